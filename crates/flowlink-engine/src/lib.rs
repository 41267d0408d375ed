mod connection;
mod deployment;
mod dispatcher;
mod engine;
mod protocol;
mod router;
mod store;
mod transport;
mod triggers;

pub use connection::{ConnectionManager, ConnectionSettings};
pub use deployment::{DeploymentEvent, DeploymentStateMachine, Transition};
pub use dispatcher::{PendingResponse, RequestDispatcher, ResponseHook};
pub use engine::{EngineConfig, SyncEngine};
pub use protocol::{
    Broadcast, BroadcastKind, InboundFrame, Operation, ScopeRequirement, StatusSnapshot, Timeout,
    VariableUpdate,
};
pub use router::FrameRouter;
pub use store::{ScopePartition, ScopeView, ScopedStateStore};
pub use transport::WsConnector;
pub use triggers::{TriggerWait, TriggerWaitRegistry};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Critical sections in this crate never leave the maps half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
