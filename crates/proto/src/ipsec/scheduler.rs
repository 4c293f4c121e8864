//! Delayed job scheduling
//!
//! CHILD_SA negotiation schedules three kinds of delayed work: retrying
//! a failed creation after TEMPORARY_FAILURE, closing an inactive
//! CHILD_SA, and the delayed IKE_SA delete used when the first CHILD_SA
//! fails with `close_ike_on_child_failure` (the delete must not beat the
//! outbound IKE_AUTH response onto the wire).
//!
//! The IKE engine owns the actual timer wheel; tasks only enqueue jobs
//! through the [`Scheduler`] trait. The [`RecordingScheduler`] collects
//! jobs for inspection in tests.

use crate::ipsec::config::ChildConfig;
use crate::ipsec::ikev2::ts::{SecLabel, TrafficSelector};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything needed to clone a CHILD_SA creation attempt
///
/// Carried by the delayed-retry job so the new task starts with the
/// original reqid, marks, interface IDs, label and triggering packet.
#[derive(Debug, Clone)]
pub struct ChildCreateBlueprint {
    /// The child configuration to retry with
    pub config: Arc<ChildConfig>,
    /// Reserved reqid
    pub reqid: u32,
    /// Marks (in, out)
    pub marks: (u32, u32),
    /// Interface IDs (in, out)
    pub if_ids: (u32, u32),
    /// Security label from the original attempt
    pub label: Option<SecLabel>,
    /// Source selector of the triggering packet
    pub packet_tsi: Option<TrafficSelector>,
    /// Destination selector of the triggering packet
    pub packet_tsr: Option<TrafficSelector>,
}

/// A delayed job
#[derive(Debug, Clone)]
pub enum Job {
    /// Queue a new CHILD_SA creation task
    RetryChildCreate(ChildCreateBlueprint),
    /// Close a CHILD_SA that saw no traffic
    InactivityTimeout {
        /// CHILD_SA unique id
        child_id: u32,
        /// Configured timeout
        timeout: Duration,
        /// Close the whole IKE_SA instead of just the child
        close_ike: bool,
    },
    /// Delete an IKE_SA
    DeleteIkeSa {
        /// IKE_SA unique id
        ike_sa_id: u32,
    },
}

/// Scheduler interface offered by the IKE engine
pub trait Scheduler: Send + Sync {
    /// Execute a job after a delay
    fn schedule(&self, delay: Duration, job: Job);
}

/// Scheduler that records jobs instead of running them
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    jobs: Mutex<Vec<(Duration, Job)>>,
}

impl RecordingScheduler {
    /// Snapshot of the scheduled jobs
    pub fn jobs(&self) -> Vec<(Duration, Job)> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration, job: Job) {
        self.jobs.lock().unwrap().push((delay, job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_scheduler() {
        let scheduler = RecordingScheduler::default();
        scheduler.schedule(
            Duration::from_secs(10),
            Job::InactivityTimeout {
                child_id: 1,
                timeout: Duration::from_secs(10),
                close_ike: false,
            },
        );
        scheduler.schedule(Duration::from_millis(100), Job::DeleteIkeSa { ike_sa_id: 2 });

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 2);
        assert!(matches!(jobs[0].1, Job::InactivityTimeout { child_id: 1, .. }));
        assert_eq!(jobs[1].0, Duration::from_millis(100));
    }
}
