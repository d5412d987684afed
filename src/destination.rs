use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::TransportError;

/// Whether a destination is point-to-point or publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A resolved destination handle.
///
/// Destinations are immutable and cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: Arc<str>,
    kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    /// Logical name without any `/queue/` or `/topic/` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "/queue/{}", self.name),
            DestinationKind::Topic => write!(f, "/topic/{}", self.name),
        }
    }
}

/// Resolves destination names into destination handles.
///
/// Implementations may be expensive (a broker round trip); the container
/// caches the result and only asks again after a setup failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, name: &str, pub_sub_domain: bool)
        -> Result<Destination, TransportError>;
}

/// Resolver that builds destinations straight from their names.
///
/// `/queue/x` and `/topic/x` select the kind explicitly; a bare name uses the
/// container's pub/sub domain flag.
#[derive(Debug, Default, Clone)]
pub struct DynamicDestinationResolver;

#[async_trait::async_trait]
impl DestinationResolver for DynamicDestinationResolver {
    async fn resolve(
        &self,
        name: &str,
        pub_sub_domain: bool,
    ) -> Result<Destination, TransportError> {
        let logical = normalize_destination_name(name);
        if logical.trim().is_empty() {
            return Err(TransportError::DestinationResolution(name.to_string()));
        }

        let destination = if is_queue_destination(name) {
            Destination::queue(logical)
        } else if is_topic_destination(name) || pub_sub_domain {
            Destination::topic(logical)
        } else {
            Destination::queue(logical)
        };

        debug!("Resolved destination name '{}' to {}", name, destination);
        Ok(destination)
    }
}

/// Strip a leading `/queue/` or `/topic/` prefix.
pub fn normalize_destination_name(destination: &str) -> &str {
    destination
        .strip_prefix("/queue/")
        .or_else(|| destination.strip_prefix("/topic/"))
        .unwrap_or(destination)
}

pub fn is_queue_destination(destination: &str) -> bool {
    destination.starts_with("/queue/")
}

pub fn is_topic_destination(destination: &str) -> bool {
    destination.starts_with("/topic/")
}
