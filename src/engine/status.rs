use std::fmt;

/// Lifecycle of an image inside the engine.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize,
)]
pub enum ScanStatus {
    Unknown,
    InBackendCheckQueue,
    InScanQueue,
    RunningScanClient,
    RunningBackendScan,
    Complete,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 6] = [
        Self::Unknown,
        Self::InBackendCheckQueue,
        Self::InScanQueue,
        Self::RunningScanClient,
        Self::RunningBackendScan,
        Self::Complete,
    ];

    /// Check if moving from `self` to `to` is allowed.
    pub fn can_transition_to(self, to: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, to),
            (Unknown, InBackendCheckQueue | RunningBackendScan)
                | (
                    InBackendCheckQueue,
                    InScanQueue | RunningBackendScan | Complete
                )
                | (InScanQueue, RunningScanClient | RunningBackendScan)
                | (RunningScanClient, InScanQueue | RunningBackendScan)
                | (RunningBackendScan, InScanQueue | Complete)
        )
    }

    /// Counts against the concurrent scan limit.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::RunningScanClient | Self::RunningBackendScan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::InBackendCheckQueue => "InBackendCheckQueue",
            Self::InScanQueue => "InScanQueue",
            Self::RunningScanClient => "RunningScanClient",
            Self::RunningBackendScan => "RunningBackendScan",
            Self::Complete => "Complete",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
