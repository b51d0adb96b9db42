use crate::metrics::{CallOutcome, Metrics};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    /// calls pass
    Enabled,
    /// calls are rejected until the next check
    Disabled,
    /// a single trial call is in flight
    Checking,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("Enabled"),
            Self::Disabled => f.write_str("Disabled"),
            Self::Checking => f.write_str("Checking"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit open, not issuing: {description}")]
    Open { description: String },
    #[error("{0}")]
    Failed(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    next_check_time: Option<Instant>,
    max_backoff: Duration,
}

impl Inner {
    fn backoff(&self) -> Duration {
        2u64.checked_pow(self.consecutive_failures)
            .map(Duration::from_secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn disable(&mut self) {
        let backoff = self.backoff();
        self.state = BreakerState::Disabled;
        self.next_check_time = Some(Instant::now() + backoff);

        warn!(
            failures = self.consecutive_failures,
            backoff = %humantime::format_duration(backoff),
            "Disabling backend calls"
        );
    }
}

/// How a call got past the breaker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Admission {
    Regular,
    Trial,
}

/// Puts the breaker back to `Disabled` if a trial call is dropped before it completes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.state == BreakerState::Checking {
            warn!("Trial call abandoned before completion");
            inner.disable();
        }
    }
}

/// Guards calls to the scanning backend, backing off exponentially while it fails.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<Inner>>,
    metrics: Arc<dyn Metrics>,
}

impl CircuitBreaker {
    pub fn new(max_backoff: Duration, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Enabled,
                consecutive_failures: 0,
                next_check_time: None,
                max_backoff,
            })),
            metrics,
        }
    }

    /// Change the upper limit of the backoff. Applies from the next failure on.
    pub fn set_max_backoff(&self, max_backoff: Duration) {
        let mut inner = self.inner.lock();
        info!(
            from = %humantime::format_duration(inner.max_backoff),
            to = %humantime::format_duration(max_backoff),
            "Circuit breaker max backoff"
        );
        inner.max_backoff = max_backoff;
    }

    /// Run `op`, unless the circuit is open.
    ///
    /// Only the outcome of a trial call may close an open circuit. Calls admitted before the
    /// circuit opened don't change it once they return.
    pub async fn issue_request<T, E, F, Fut>(
        &self,
        description: &str,
        op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let Some(admission) = self.admit() else {
            self.metrics
                .record_backend_call(description, CallOutcome::Rejected);
            return Err(BreakerError::Open {
                description: description.to_string(),
            });
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let result = op().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(admission);
                self.metrics
                    .record_backend_call(description, CallOutcome::Success);
                Ok(value)
            }
            Err(err) => {
                warn!(description, "Backend call failed: {err}");
                self.on_failure(admission);
                self.metrics
                    .record_backend_call(description, CallOutcome::Failure);
                Err(BreakerError::Failed(err))
            }
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Enabled => Some(Admission::Regular),
            BreakerState::Checking => None,
            BreakerState::Disabled => match inner.next_check_time {
                Some(next) if Instant::now() < next => None,
                _ => {
                    info!(failures = inner.consecutive_failures, "Letting a trial call through");
                    inner.state = BreakerState::Checking;
                    Some(Admission::Trial)
                }
            },
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Checking && admission == Admission::Trial {
            info!("Backend recovered, enabling");
            inner.state = BreakerState::Enabled;
            inner.consecutive_failures = 0;
            inner.next_check_time = None;
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (inner.state, admission) {
            (BreakerState::Enabled, Admission::Regular) => {
                inner.consecutive_failures = 1;
                inner.disable();
            }
            (BreakerState::Checking, Admission::Trial) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.disable();
            }
            _ => {}
        }
    }

    /// Force the breaker back to `Enabled`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(state = %inner.state, "Resetting circuit breaker");
        inner.state = BreakerState::Enabled;
        inner.consecutive_failures = 0;
        inner.next_check_time = None;
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call issued now would be rejected.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Enabled => false,
            BreakerState::Checking => true,
            BreakerState::Disabled => inner
                .next_check_time
                .is_some_and(|next| Instant::now() < next),
        }
    }

    pub fn snapshot(&self) -> scanherd_api::BreakerStatus {
        let inner = self.inner.lock();
        let now = Instant::now();
        scanherd_api::BreakerStatus {
            state: inner.state.to_string(),
            consecutive_failures: inner.consecutive_failures,
            next_check_in_secs: inner
                .next_check_time
                .map(|next| next.saturating_duration_since(now).as_secs()),
        }
    }
}
