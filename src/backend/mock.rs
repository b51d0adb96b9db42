use super::{BackendError, ScanBackend};
use crate::api::{Image, ScanResult, ScanState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory backend. Submitted scans complete clean on the second status fetch.
#[derive(Debug, Default)]
pub struct MockBackend {
    scans: Mutex<HashMap<String, MockScan>>,
    unavailable: AtomicBool,
}

#[derive(Clone, Copy, Debug)]
enum MockScan {
    Submitted,
    Fixed(ScanState),
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, or succeed again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_scan(&self, search_key: impl Into<String>, state: ScanState) {
        self.scans
            .lock()
            .insert(search_key.into(), MockScan::Fixed(state));
    }

    pub fn submitted(&self) -> Vec<String> {
        self.scans.lock().keys().cloned().collect()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("mock backend switched off".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ScanBackend for MockBackend {
    async fn submit_scan(&self, image: &Image) -> Result<(), BackendError> {
        self.check()?;
        self.scans
            .lock()
            .insert(image.search_key().to_string(), MockScan::Submitted);
        Ok(())
    }

    async fn fetch_scan_status(&self, search_key: &str) -> Result<Option<ScanState>, BackendError> {
        self.check()?;
        let mut scans = self.scans.lock();
        Ok(match scans.get_mut(search_key) {
            None => None,
            Some(scan) => match *scan {
                MockScan::Fixed(state) => Some(state),
                MockScan::Submitted => {
                    *scan = MockScan::Fixed(ScanState::Complete(ScanResult::clean()));
                    Some(ScanState::InProgress)
                }
            },
        })
    }

    async fn list_all_known_scans(&self) -> Result<Vec<String>, BackendError> {
        self.check()?;
        Ok(self.submitted())
    }
}
