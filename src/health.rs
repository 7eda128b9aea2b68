//! Rolling record of consumer-loop failures, read by the liveness probe.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Upper bound on retained entries; only the most recent ones are kept.
const LEDGER_CAPACITY: usize = 64;

/// Recent loop-level errors (broker or store unreachable, malformed events).
///
/// Per-message delivery failures are not recorded here. The ledger is cleared
/// after every fully successful poll cycle, so its length is the number of
/// consecutive failed cycles, capped at [`LEDGER_CAPACITY`].
#[derive(Debug)]
pub struct FailureLedger {
    entries: Mutex<VecDeque<String>>,
    threshold: usize,
}

impl FailureLedger {
    /// Creates an empty ledger that reports unhealthy above `threshold` entries.
    pub fn new(threshold: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            threshold,
        }
    }

    pub fn record(&self, error: impl Into<String>) {
        let Ok(mut entries) = self.entries.lock() else {
            log::error!("failure ledger lock poisoned!");
            return;
        };
        if entries.len() == LEDGER_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(error.into());
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Copy of the retained errors, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `false` once more than `threshold` failures accumulated without a successful cycle.
    pub fn is_healthy(&self) -> bool {
        self.len() <= self.threshold
    }
}
