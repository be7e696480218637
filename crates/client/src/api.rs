//! The trait seam between the bridge and the metagraph.

use async_trait::async_trait;
use loom_types::envelope::Signed;
use loom_types::error::ClientError;
use loom_types::fiber::{Checkpoint, DataUpdate, Fiber, SubmitReceipt};

/// Read/write access to the metagraph layers.
///
/// Every method carries a deadline internally; callers never wait unbounded.
#[async_trait]
pub trait DataLayerApi: Send + Sync {
    /// Submits a signed update to the data layer.
    ///
    /// Returns only after the data layer acknowledges the write. Snapshot
    /// visibility lags behind; callers needing it poll via
    /// [`get_state_machine`](Self::get_state_machine).
    async fn submit(&self, envelope: &Signed<DataUpdate>) -> Result<SubmitReceipt, ClientError>;

    /// Fetches the current state of a fiber, or `None` when the snapshot
    /// layer does not know it yet.
    async fn get_state_machine(&self, fiber_id: &str) -> Result<Option<Fiber>, ClientError>;

    /// Fetches the current snapshot-layer checkpoint.
    async fn get_checkpoint(&self) -> Result<Checkpoint, ClientError>;

    /// The latest snapshot ordinal, or `None` before the first snapshot.
    async fn get_latest_ordinal(&self) -> Result<Option<u64>, ClientError>;
}
