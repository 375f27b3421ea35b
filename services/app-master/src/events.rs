//! Event types and the gateway feeding the reconciliation loop.
//!
//! Resource-manager callbacks, process-exit notifications, and operator
//! flex requests all arrive from independent tasks. Rather than mutating
//! shared state from those callsites, everything is posted onto one bounded
//! channel and consumed by the single reconciliation loop, which is the
//! sole owner of [`AppState`].
//!
//! [`AppState`]: crate::state::AppState

use roost_model::{ContainerId, InstanceId};
use tokio::sync::mpsc;

/// A container grant reported by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub container: ContainerId,
    pub host: String,

    /// Role priority echoed back from the original request.
    pub priority: u32,
}

/// A container completion reported by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub container: ContainerId,
    pub exit_status: i32,
}

/// Events consumed by the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Containers granted by the resource manager.
    ContainersAllocated(Vec<Allocation>),

    /// Containers that stopped, whether released by us or failed.
    ContainersCompleted(Vec<Completion>),

    /// Operator changed a role's desired instance count.
    Flex { role: String, desired: u32 },

    /// A supervised role process terminated.
    ProcessExited {
        instance: InstanceId,
        exit_code: i32,
        failed: bool,
        timed_out: bool,
    },
}

/// Errors posting into the event channel.
#[derive(Debug, thiserror::Error)]
#[error("reconciliation loop is gone")]
pub struct GatewayClosed;

/// Clone-able adapter external callbacks post through.
///
/// This is the whole of the event-delivery boundary: collaborators never
/// touch reconciler state directly.
#[derive(Clone)]
pub struct EventGateway {
    tx: mpsc::Sender<Event>,
}

impl EventGateway {
    /// Create a gateway and the receiving end for the reconciliation loop.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    pub async fn post(&self, event: Event) -> Result<(), GatewayClosed> {
        self.tx.send(event).await.map_err(|_| GatewayClosed)
    }

    /// Inbound resource-manager callback: containers allocated.
    pub async fn containers_allocated(
        &self,
        allocations: Vec<Allocation>,
    ) -> Result<(), GatewayClosed> {
        self.post(Event::ContainersAllocated(allocations)).await
    }

    /// Inbound resource-manager callback: containers completed.
    pub async fn containers_completed(
        &self,
        completions: Vec<Completion>,
    ) -> Result<(), GatewayClosed> {
        self.post(Event::ContainersCompleted(completions)).await
    }

    /// Operator flex request.
    pub async fn flex(&self, role: impl Into<String>, desired: u32) -> Result<(), GatewayClosed> {
        self.post(Event::Flex {
            role: role.into(),
            desired,
        })
        .await
    }
}
