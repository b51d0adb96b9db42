use crate::engine::ModelConfig;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

/// Scan orchestration for the images running in a cluster
#[derive(clap::Parser, Debug, Clone)]
#[command(name = "scanherd")]
pub struct Config {
    /// Address the HTTP API binds to
    #[arg(long, env = "BIND_ADDR", default_value = "[::]:8080")]
    pub bind_addr: String,

    /// Base URL of the scanning backend
    #[arg(long, env = "SCANHERD_BACKEND_URL", default_value = "http://localhost:8081")]
    pub backend_url: Url,

    /// Timeout of a single call to the scanning backend
    #[arg(long, env = "SCANHERD_BACKEND_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub backend_timeout: Duration,

    /// Use an in-memory backend instead of the HTTP one
    #[arg(long, env = "SCANHERD_MOCK")]
    pub mock: bool,

    /// Default log filter, `RUST_LOG` takes precedence
    #[arg(long, env = "SCANHERD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Watch the pods of the cluster
    #[arg(long, env = "SCANHERD_WATCH")]
    pub watch: bool,

    /// Number of images allowed to be scanned at the same time
    #[arg(long, env = "SCANHERD_CONCURRENT_SCAN_LIMIT", default_value_t = 2)]
    pub concurrent_scan_limit: usize,

    /// Upper limit of the circuit breaker backoff
    #[arg(long, env = "SCANHERD_MAX_BACKOFF", default_value = "1h", value_parser = humantime::parse_duration)]
    pub max_backoff: Duration,

    #[arg(long, env = "SCANHERD_STALLED_SCAN_CLIENT_TIMEOUT", default_value = "2h", value_parser = humantime::parse_duration)]
    pub stalled_scan_client_timeout: Duration,

    #[arg(long, env = "SCANHERD_STALLED_BACKEND_SCAN_TIMEOUT", default_value = "2h", value_parser = humantime::parse_duration)]
    pub stalled_backend_scan_timeout: Duration,

    #[command(flatten)]
    pub timings: Timings,
}

impl Config {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            concurrent_scan_limit: self.concurrent_scan_limit,
            stalled_scan_client_timeout: self.stalled_scan_client_timeout,
            stalled_backend_scan_timeout: self.stalled_backend_scan_timeout,
        }
    }
}

/// Cadences of the periodic loops. May change at runtime.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    /// Pause of the backend check loop while its queue is empty
    #[arg(long, env = "SCANHERD_BACKEND_CHECK_PAUSE", default_value = "5s", value_parser = humantime::parse_duration)]
    pub backend_check_pause: Duration,

    /// Pause between two consecutive backend checks
    #[arg(long, env = "SCANHERD_BACKEND_THROTTLE", default_value = "1s", value_parser = humantime::parse_duration)]
    pub backend_throttle: Duration,

    #[arg(long, env = "SCANHERD_SCAN_DISPATCH_PAUSE", default_value = "5s", value_parser = humantime::parse_duration)]
    pub scan_dispatch_pause: Duration,

    #[arg(long, env = "SCANHERD_COMPLETION_POLL_PAUSE", default_value = "20s", value_parser = humantime::parse_duration)]
    pub completion_poll_pause: Duration,

    #[arg(long, env = "SCANHERD_STALL_CHECK_PAUSE", default_value = "1m", value_parser = humantime::parse_duration)]
    pub stall_check_pause: Duration,

    #[arg(long, env = "SCANHERD_ORPHAN_PRUNE_PAUSE", default_value = "5m", value_parser = humantime::parse_duration)]
    pub orphan_prune_pause: Duration,

    /// How long a completed image must stay orphaned before it is forgotten
    #[arg(long, env = "SCANHERD_ORPHAN_CLEANUP_GRACE", default_value = "1h", value_parser = humantime::parse_duration)]
    pub orphan_cleanup_grace: Duration,

    #[arg(long, env = "SCANHERD_REFRESH_PAUSE", default_value = "1m", value_parser = humantime::parse_duration)]
    pub refresh_pause: Duration,

    /// Age of results after which they get fetched again
    #[arg(long, env = "SCANHERD_REFRESH_THRESHOLD", default_value = "30m", value_parser = humantime::parse_duration)]
    pub refresh_threshold: Duration,

    #[arg(long, env = "SCANHERD_INVENTORY_PAUSE", default_value = "5m", value_parser = humantime::parse_duration)]
    pub inventory_pause: Duration,

    #[arg(long, env = "SCANHERD_METRICS_PAUSE", default_value = "15s", value_parser = humantime::parse_duration)]
    pub metrics_pause: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            backend_check_pause: Duration::from_secs(5),
            backend_throttle: Duration::from_secs(1),
            scan_dispatch_pause: Duration::from_secs(5),
            completion_poll_pause: Duration::from_secs(20),
            stall_check_pause: Duration::from_secs(60),
            orphan_prune_pause: Duration::from_secs(5 * 60),
            orphan_cleanup_grace: Duration::from_secs(60 * 60),
            refresh_pause: Duration::from_secs(60),
            refresh_threshold: Duration::from_secs(30 * 60),
            inventory_pause: Duration::from_secs(5 * 60),
            metrics_pause: Duration::from_secs(15),
        }
    }
}

impl Timings {
    /// Apply a runtime update. Zero durations are ignored.
    pub fn apply(&mut self, update: &scanherd_api::ConfigUpdate) {
        fn set(name: &str, target: &mut Duration, value: Option<Duration>) {
            match value {
                Some(value) if value.is_zero() => warn!("Ignoring zero duration for {name}"),
                Some(value) => *target = value,
                None => {}
            }
        }

        set(
            "backend check pause",
            &mut self.backend_check_pause,
            update.backend_check_pause_millis.map(Duration::from_millis),
        );
        set(
            "backend throttle",
            &mut self.backend_throttle,
            update.backend_throttle_millis.map(Duration::from_millis),
        );
        set(
            "scan dispatch pause",
            &mut self.scan_dispatch_pause,
            update.scan_dispatch_pause_secs.map(Duration::from_secs),
        );
        set(
            "completion poll pause",
            &mut self.completion_poll_pause,
            update.completion_poll_pause_secs.map(Duration::from_secs),
        );
        set(
            "stall check pause",
            &mut self.stall_check_pause,
            update.stall_check_pause_secs.map(Duration::from_secs),
        );
        set(
            "orphan prune pause",
            &mut self.orphan_prune_pause,
            update.orphan_prune_pause_secs.map(Duration::from_secs),
        );
        set(
            "orphan cleanup grace",
            &mut self.orphan_cleanup_grace,
            update.orphan_cleanup_grace_secs.map(Duration::from_secs),
        );
        set(
            "refresh pause",
            &mut self.refresh_pause,
            update.refresh_pause_secs.map(Duration::from_secs),
        );
        set(
            "refresh threshold",
            &mut self.refresh_threshold,
            update.refresh_threshold_secs.map(Duration::from_secs),
        );
        set(
            "inventory pause",
            &mut self.inventory_pause,
            update.inventory_pause_secs.map(Duration::from_secs),
        );
        set(
            "metrics pause",
            &mut self.metrics_pause,
            update.metrics_pause_secs.map(Duration::from_secs),
        );
    }
}

/// Sleep for the pause selected by `pick`, following runtime changes of it.
///
/// Returns `false` if stopped meanwhile.
pub async fn pause(
    timings: &watch::Receiver<Timings>,
    stop: &CancellationToken,
    pick: fn(&Timings) -> Duration,
) -> bool {
    let mut timings = timings.clone();
    let start = Instant::now();

    loop {
        let deadline = start + pick(&*timings.borrow_and_update());
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = timings.changed() => {
                if changed.is_err() {
                    // no more updates
                    return tokio::select! {
                        _ = stop.cancelled() => false,
                        _ = tokio::time::sleep_until(deadline) => true,
                    };
                }
            }
        }
    }
}
