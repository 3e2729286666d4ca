//! The aggregation engines behind the client façade.
//!
//! Each aggregator owns a bounded signature-keyed cache guarded by
//! one mutex, merges same-signature traffic locally, and pushes
//! refresh/flush requests out through a flush callback. Locks are
//! held only for the duration of a single cache operation; callbacks
//! fire strictly after the lock is released.

mod check;
mod quota;
mod report;

use std::sync::{Arc, Mutex};

pub use check::CheckAggregator;
pub use quota::QuotaAggregator;
pub use report::ReportAggregator;

use crate::error::Error;

/// Receives refresh and flush traffic evicted from an aggregator
/// cache.
///
/// The callback must be light, fast and non-blocking; a remote call
/// belongs in a spawned task. It must not call back into the
/// aggregator that invoked it, or the next cache operation can
/// deadlock.
pub type FlushCallback<R> = Arc<dyn Fn(R) + Send + Sync>;

/// Clearable slot holding an aggregator's flush callback. Teardown
/// clears the slot so late evictions go nowhere instead of reaching
/// a dying client.
pub(crate) struct CallbackSlot<R> {
    callback: Mutex<Option<FlushCallback<R>>>,
}

impl<R> CallbackSlot<R> {
    pub fn empty() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }

    pub fn set(&self, callback: Option<FlushCallback<R>>) {
        *self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }

    /// Forwards each staged request to the callback, if one is set.
    /// Callers invoke this only after releasing their cache lock.
    pub fn emit_all(&self, requests: Vec<R>) {
        if requests.is_empty() {
            return;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            for request in requests {
                callback(request);
            }
        }
    }
}

/// Tuning for the Check cache.
#[derive(Debug, Clone)]
pub struct CheckAggregationOptions {
    /// Maximum number of cached responses; 0 disables caching.
    pub num_entries: usize,
    /// How long a cached response is served before the next flush
    /// evicts it for refresh.
    pub flush_interval_ms: u64,
    /// Hard bound on a cached response's lifetime. Must be at least
    /// `flush_interval_ms`.
    pub expiration_ms: u64,
}

impl CheckAggregationOptions {
    pub fn new(num_entries: usize, flush_interval_ms: u64, expiration_ms: u64) -> Self {
        Self {
            num_entries,
            flush_interval_ms,
            expiration_ms,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.expiration_ms < self.flush_interval_ms {
            return Err(Error::InvalidOptions(format!(
                "check expiration_ms ({}) must be >= flush_interval_ms ({})",
                self.expiration_ms, self.flush_interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for CheckAggregationOptions {
    fn default() -> Self {
        Self::new(10_000, 500, 1_000)
    }
}

/// Tuning for the AllocateQuota cache.
#[derive(Debug, Clone)]
pub struct QuotaAggregationOptions {
    /// Maximum number of cached allocations; 0 disables caching.
    pub num_entries: usize,
    /// Age at which a cached allocation triggers a refresh call.
    pub refresh_interval_ms: u64,
    /// Age at which a cached allocation is dropped outright. Must be
    /// at least `refresh_interval_ms`.
    pub expiration_interval_ms: u64,
}

impl QuotaAggregationOptions {
    /// Expiration defaults to twice the refresh interval.
    pub fn new(num_entries: usize, refresh_interval_ms: u64) -> Self {
        Self {
            num_entries,
            refresh_interval_ms,
            expiration_interval_ms: refresh_interval_ms * 2,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.expiration_interval_ms < self.refresh_interval_ms {
            return Err(Error::InvalidOptions(format!(
                "quota expiration_interval_ms ({}) must be >= refresh_interval_ms ({})",
                self.expiration_interval_ms, self.refresh_interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for QuotaAggregationOptions {
    fn default() -> Self {
        Self::new(10_000, 1_000)
    }
}

/// Tuning for the Report batcher.
#[derive(Debug, Clone)]
pub struct ReportAggregationOptions {
    /// Maximum number of per-operation accumulators; 0 disables
    /// batching.
    pub num_entries: usize,
    /// Age at which accumulated operations are flushed out.
    pub flush_interval_ms: u64,
}

impl ReportAggregationOptions {
    pub fn new(num_entries: usize, flush_interval_ms: u64) -> Self {
        Self {
            num_entries,
            flush_interval_ms,
        }
    }
}

impl Default for ReportAggregationOptions {
    fn default() -> Self {
        Self::new(10_000, 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_slot_forwards_when_set() {
        let slot: CallbackSlot<u32> = CallbackSlot::empty();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slot.set(Some(Arc::new(move |n| {
            sink.lock().unwrap().push(n);
        })));

        slot.emit_all(vec![1, 2, 3]);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);

        slot.set(None);
        slot.emit_all(vec![4]);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn quota_expiration_defaults_to_twice_refresh() {
        let options = QuotaAggregationOptions::new(10, 500);
        assert_eq!(options.expiration_interval_ms, 1_000);
        options.validate().unwrap();
    }

    #[test]
    fn check_options_validate_interval_ordering() {
        assert!(CheckAggregationOptions::new(10, 1_000, 500).validate().is_err());
        CheckAggregationOptions::new(10, 500, 500).validate().unwrap();
    }
}
