//! Negotiation event bus
//!
//! Fire-and-forget notifications raised while CHILD_SAs are negotiated
//! and installed: selector narrowing hooks, failure alerts and SA
//! up/down events. Plugins (trap managers, updown scripts, HA sync)
//! subscribe by implementing [`EventBus`].
//!
//! All hooks have empty default implementations; a subscriber overrides
//! what it cares about.

use crate::ipsec::ikev2::ts::TrafficSelector;
use std::sync::Mutex;

/// Phase of a traffic-selector narrowing hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrowPhase {
    /// Initiator, before building the IKE_AUTH request
    InitiatorPreNoAuth,
    /// Initiator, before building a CREATE_CHILD_SA request
    InitiatorPreAuth,
    /// Initiator, after processing the IKE_AUTH response
    InitiatorPostNoAuth,
    /// Initiator, after processing a CREATE_CHILD_SA response
    InitiatorPostAuth,
    /// Responder, after narrowing the received selectors
    Responder,
    /// Responder, immediately before installing policies
    ResponderPost,
}

/// Alert raised on negotiation or installation failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// No mutually acceptable CHILD_SA proposal
    ProposalMismatchChild,
    /// Received traffic selectors did not match the configuration
    TsMismatch,
    /// Installing the SAs into the kernel failed
    InstallChildSaFailed,
    /// Installing the flow policies failed
    InstallChildPolicyFailed,
    /// A CHILD_SA failed but the IKE_SA is kept
    KeepOnChildSaFailure {
        /// Whether this was the first CHILD_SA of the IKE_SA
        is_first: bool,
    },
}

/// Subscriber interface for negotiation events
pub trait EventBus: Send + Sync {
    /// Traffic selectors were narrowed; hooks may observe the result
    fn narrow(
        &self,
        _phase: NarrowPhase,
        _my_ts: &[TrafficSelector],
        _other_ts: &[TrafficSelector],
    ) {
    }

    /// A failure alert was raised
    fn alert(&self, _alert: Alert) {}

    /// Keys were derived for a CHILD_SA
    fn child_derived_keys(&self, _child_id: u32, _initiator: bool) {}

    /// A CHILD_SA completed its key exchanges
    fn child_keys(&self, _child_id: u32, _initiator: bool, _nonce_i: &[u8], _nonce_r: &[u8]) {}

    /// A CHILD_SA went up (true) or down (false)
    fn child_updown(&self, _child_id: u32, _up: bool) {}
}

/// Bus discarding every event
#[derive(Debug, Default)]
pub struct NullBus;

impl EventBus for NullBus {}

/// A single recorded bus event
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A narrowing hook fired
    Narrow {
        /// Hook phase
        phase: NarrowPhase,
        /// Local selector count after narrowing
        my_count: usize,
        /// Remote selector count after narrowing
        other_count: usize,
    },
    /// An alert fired
    Alert(Alert),
    /// Keys were derived
    ChildDerivedKeys {
        /// CHILD_SA unique id
        child_id: u32,
    },
    /// Key exchanges completed
    ChildKeys {
        /// CHILD_SA unique id
        child_id: u32,
    },
    /// Up/down event
    ChildUpdown {
        /// CHILD_SA unique id
        child_id: u32,
        /// Up or down
        up: bool,
    },
}

/// Bus recording every event, for tests
#[derive(Debug, Default)]
pub struct RecordingBus {
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingBus {
    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    /// All recorded alerts
    pub fn alerts(&self) -> Vec<Alert> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::Alert(alert) => Some(alert),
                _ => None,
            })
            .collect()
    }

    /// All recorded updown events as (child_id, up)
    pub fn updowns(&self) -> Vec<(u32, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::ChildUpdown { child_id, up } => Some((child_id, up)),
                _ => None,
            })
            .collect()
    }
}

impl EventBus for RecordingBus {
    fn narrow(&self, phase: NarrowPhase, my_ts: &[TrafficSelector], other_ts: &[TrafficSelector]) {
        self.events.lock().unwrap().push(BusEvent::Narrow {
            phase,
            my_count: my_ts.len(),
            other_count: other_ts.len(),
        });
    }

    fn alert(&self, alert: Alert) {
        self.events.lock().unwrap().push(BusEvent::Alert(alert));
    }

    fn child_derived_keys(&self, child_id: u32, _initiator: bool) {
        self.events
            .lock()
            .unwrap()
            .push(BusEvent::ChildDerivedKeys { child_id });
    }

    fn child_keys(&self, child_id: u32, _initiator: bool, _nonce_i: &[u8], _nonce_r: &[u8]) {
        self.events
            .lock()
            .unwrap()
            .push(BusEvent::ChildKeys { child_id });
    }

    fn child_updown(&self, child_id: u32, up: bool) {
        self.events
            .lock()
            .unwrap()
            .push(BusEvent::ChildUpdown { child_id, up });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_bus_accepts_everything() {
        let bus = NullBus;
        bus.narrow(NarrowPhase::Responder, &[], &[]);
        bus.alert(Alert::TsMismatch);
        bus.child_updown(1, true);
    }

    #[test]
    fn test_recording_bus() {
        let bus = RecordingBus::default();
        bus.alert(Alert::ProposalMismatchChild);
        bus.child_updown(3, true);
        bus.child_updown(3, false);

        assert_eq!(bus.alerts(), vec![Alert::ProposalMismatchChild]);
        assert_eq!(bus.updowns(), vec![(3, true), (3, false)]);
        assert_eq!(bus.events().len(), 3);
    }
}
