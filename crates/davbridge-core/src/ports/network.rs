//! Network reachability port

use crate::domain::BackendError;

/// Checks whether the network path to the storage backend is usable
#[async_trait::async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Performs one reachability check
    ///
    /// Returns [`BackendError::Network`] while the backend cannot be reached.
    async fn check(&self) -> Result<(), BackendError>;
}

/// Probe for backends that need no network, such as local directories
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait::async_trait]
impl NetworkProbe for AlwaysReachable {
    async fn check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
