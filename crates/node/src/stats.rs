//! Counter registry keyed by stable error codes.
//!
//! One instance is created at startup and handed to every component, so
//! tests can inspect exactly what a scenario produced instead of reading a
//! process-wide global.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    counters: HashMap<&'static str, u64>,
}

/// Shared counter registry.
#[derive(Clone, Default)]
pub struct Stats {
    inner: Arc<Mutex<Inner>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, code: &'static str) {
        *self.inner.lock().counters.entry(code).or_insert(0) += 1;
    }

    pub fn get(&self, code: &str) -> u64 {
        self.inner.lock().counters.get(code).copied().unwrap_or(0)
    }

    /// Snapshot of every non-zero counter, sorted by code.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut entries: Vec<_> = self
            .inner
            .lock()
            .counters
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        entries.sort_by_key(|(k, _)| *k);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let stats = Stats::new();
        stats.add("BLOCK_PROCESS_FORK");
        stats.add("BLOCK_PROCESS_FORK");
        stats.add("STREAM");
        assert_eq!(stats.get("BLOCK_PROCESS_FORK"), 2);
        assert_eq!(stats.get("STREAM"), 1);
        assert_eq!(stats.get("MISSING"), 0);
        assert_eq!(stats.snapshot().len(), 2);
    }
}
