//! Contracts between the orchestrator and whatever supplies backends.

use std::sync::Arc;

use async_trait::async_trait;

use super::stream::BoxedStream;
use super::target::Target;
use crate::error::ConnectError;

/// Live metrics of the backend carrying a connection.
///
/// Called concurrently from every orchestration using the backend; none of
/// these may block or fail.
pub trait BackendHandle: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    fn increase_conn_count(&self);

    fn decrease_conn_count(&self);

    /// Bytes relayed client -> backend.
    fn add_in_bytes(&self, bytes: u64);

    /// Bytes relayed backend -> client.
    fn add_out_bytes(&self, bytes: u64);
}

/// Picks a backend for a target and opens a stream through it.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Returns a stream already tunnelled to `target` plus the metrics
    /// handle of the backend that carries it.
    async fn connect(
        &self,
        target: &Target,
    ) -> Result<(BoxedStream, Arc<dyn BackendHandle>), ConnectError>;
}
