use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::{SharedBus, ZoneCommand};
use crate::zone::CommandOutcome;

/// Context passed to adapter logic during execution
pub struct AdapterContext {
    /// Event bus for publishing events
    pub bus: SharedBus,
    /// Cancellation token for shutdown coordination
    pub shutdown: CancellationToken,
}

/// Adapter-specific logic trait
///
/// Implementors provide setup, polling and command handling.
/// Lifecycle (retry, shutdown, teardown, ACK) is handled by AdapterHandle.
#[async_trait]
pub trait AdapterLogic: Send + Sync + 'static {
    /// Adapter name, used in logs and lifecycle events
    fn prefix(&self) -> &'static str;

    /// Run the adapter's main loop (setup, polling, command dispatch).
    /// Returns when ctx.shutdown is triggered or on error; an error asks
    /// AdapterHandle to retry the whole run.
    async fn run(&self, ctx: AdapterContext) -> Result<()>;

    /// Handle a command for a zone owned by this adapter
    async fn handle_command(&self, zone_id: &str, command: ZoneCommand) -> Result<CommandOutcome>;

    /// Optional: called before run() for one-time setup
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Optional: called after every run, however it ended. The run future
    /// may already have been dropped, so teardown goes here, not in run().
    async fn stop(&self) {}
}
