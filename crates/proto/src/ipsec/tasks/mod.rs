//! IKEv2 negotiation tasks
//!
//! A task drives one multi-round negotiation inside an IKE_SA. The IKE
//! engine owns the dispatch loop: it calls `build` when composing an
//! outbound message and `process` when an inbound message arrives, and
//! acts on the returned [`TaskStatus`]. Between rounds a task is
//! quiescent; all of its state lives on the heap, owned by the IKE_SA.

pub mod child_create;

pub use child_create::ChildCreate;

use crate::ipsec::bus::EventBus;
use crate::ipsec::config::Settings;
use crate::ipsec::ikev2::ke::KeProvider;
use crate::ipsec::scheduler::Scheduler;
use ironwire_platform::KernelIpsec;
use std::sync::Arc;

/// Result of one build or process round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Another round is required
    NeedMore,
    /// The task completed (successfully or after a non-critical failure)
    Success,
    /// The task failed; the exchange is abandoned
    Failed,
    /// The failure is fatal to the IKE_SA; terminate it
    DestroyMe,
}

/// Shared collaborators handed to every task
///
/// The kernel, bus, scheduler and key-exchange backends are process-wide
/// services; tasks reference them for the lifetime of a negotiation.
pub struct TaskContext {
    /// Kernel IPsec engine
    pub kernel: Arc<dyn KernelIpsec>,
    /// Negotiation event bus
    pub bus: Arc<dyn EventBus>,
    /// Delayed-job scheduler
    pub scheduler: Arc<dyn Scheduler>,
    /// Key exchange backends
    pub ke_provider: Arc<dyn KeProvider>,
    /// Negotiation settings
    pub settings: Arc<Settings>,
}
