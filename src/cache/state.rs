use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Tracks when the cache was last refreshed from a remote.
#[derive(Debug)]
pub struct CacheState {
    last_update: Mutex<DateTime<Utc>>,
}

impl CacheState {
    /// Starts the clock at process start, so a freshly started server serves
    /// from an existing cache for one interval before refreshing.
    pub fn new() -> Self {
        Self {
            last_update: Mutex::new(Utc::now()),
        }
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        *self.last_update.lock()
    }

    pub fn mark_updated(&self) {
        let mut last_update = self.last_update.lock();
        *last_update = (*last_update).max(Utc::now());
    }

    pub fn is_fresh(&self, update_interval_secs: u64) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_update());
        elapsed.num_seconds() < i64::try_from(update_interval_secs).unwrap_or(i64::MAX)
    }

    #[cfg(test)]
    pub(crate) fn set_last_update(&self, at: DateTime<Utc>) {
        *self.last_update.lock() = at;
    }
}

impl Default for CacheState {
    fn default() -> Self {
        Self::new()
    }
}
