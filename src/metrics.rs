use crate::engine::ScanStatus;
use std::fmt::Debug;
use tracing::debug;

/// Outcome of a call towards the scanning backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// never issued, the circuit was open
    Rejected,
}

/// Sink for engine observability events.
///
/// Every method defaults to a no-op, so a sink only implements what it cares about.
pub trait Metrics: Debug + Send + Sync {
    fn record_transition(&self, _from: ScanStatus, _to: ScanStatus, _legal: bool) {}

    fn record_admission(&self, _admitted: bool, _in_progress: usize, _limit: usize) {}

    fn record_priority_change(&self, _from: i32, _to: i32) {}

    fn record_dropped_action(&self, _action: &'static str, _reason: &str) {}

    fn record_backend_call(&self, _operation: &str, _outcome: CallOutcome) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Emits every event as a `tracing` event on the `scanherd::metrics` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn record_transition(&self, from: ScanStatus, to: ScanStatus, legal: bool) {
        debug!(target: "scanherd::metrics", %from, %to, legal, "transition");
    }

    fn record_admission(&self, admitted: bool, in_progress: usize, limit: usize) {
        debug!(target: "scanherd::metrics", admitted, in_progress, limit, "admission");
    }

    fn record_priority_change(&self, from: i32, to: i32) {
        debug!(target: "scanherd::metrics", from, to, "priority");
    }

    fn record_dropped_action(&self, action: &'static str, reason: &str) {
        debug!(target: "scanherd::metrics", action, reason, "dropped");
    }

    fn record_backend_call(&self, operation: &str, outcome: CallOutcome) {
        debug!(target: "scanherd::metrics", operation, ?outcome, "backend call");
    }
}

#[cfg(test)]
pub use recording::RecordingMetrics;

#[cfg(test)]
mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps everything it is told, for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingMetrics {
        pub transitions: Mutex<Vec<(ScanStatus, ScanStatus, bool)>>,
        pub admissions: Mutex<Vec<bool>>,
        pub dropped: Mutex<Vec<&'static str>>,
        pub calls: Mutex<Vec<(String, CallOutcome)>>,
    }

    impl Metrics for RecordingMetrics {
        fn record_transition(&self, from: ScanStatus, to: ScanStatus, legal: bool) {
            self.transitions.lock().push((from, to, legal));
        }

        fn record_admission(&self, admitted: bool, _in_progress: usize, _limit: usize) {
            self.admissions.lock().push(admitted);
        }

        fn record_dropped_action(&self, action: &'static str, _reason: &str) {
            self.dropped.lock().push(action);
        }

        fn record_backend_call(&self, operation: &str, outcome: CallOutcome) {
            self.calls.lock().push((operation.to_string(), outcome));
        }
    }
}
