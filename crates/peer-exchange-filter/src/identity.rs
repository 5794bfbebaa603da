//! Local identity accessor

use peer_exchange_proto::NodeMetadata;

/// Supplies the local proxy's own metadata
///
/// Queried once per connection, when the local frame is built. Implementations
/// must be cheap and non-blocking; the filter calls this from the I/O path.
pub trait LocalIdentityProvider: Send + Sync {
    fn local_identity(&self) -> NodeMetadata;
}

/// Identity fixed at startup
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    metadata: NodeMetadata,
}

impl StaticIdentity {
    pub fn new(metadata: NodeMetadata) -> Self {
        Self { metadata }
    }
}

impl LocalIdentityProvider for StaticIdentity {
    fn local_identity(&self) -> NodeMetadata {
        self.metadata.clone()
    }
}

impl<F> LocalIdentityProvider for F
where
    F: Fn() -> NodeMetadata + Send + Sync,
{
    fn local_identity(&self) -> NodeMetadata {
        self()
    }
}
