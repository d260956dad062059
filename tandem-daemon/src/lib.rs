//! Sync daemon: change collection, coalesced scheduling, the orchestrator
//! state machine, peer notification and the control socket.

mod error;
pub mod listener;
pub mod notifier;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod remote;
mod runtime;
pub mod scheduler;
pub mod sync_loop;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::DaemonError;
pub use notifier::{HttpNotifier, PeerNotifier};
pub use orchestrator::{CycleKind, CycleReport, Orchestrator, OrchestratorState};
pub use protocol::{
    request_pull, request_status, request_stop, request_sync, send_request, ControlClient,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, start_blocking, DaemonOptions};
pub use scheduler::{CoalescingScheduler, Decision};
pub use sync_loop::{SyncHandle, SyncLoop, SyncStats, SyncStatus};
