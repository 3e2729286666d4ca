//! Pre-flight Check caching and aggregation.
//!
//! Positive responses are served from cache while their operations
//! merge into a pending aggregate; the periodic flush evicts aged
//! entries and turns unsent aggregates into refresh traffic. Negative
//! responses are served without merging so a denied consumer stops
//! producing upstream calls until the entry expires.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::aggregator::{CallbackSlot, CheckAggregationOptions, FlushCallback};
use crate::cache::SignatureCache;
use crate::clock::Clock;
use crate::error::Error;
use crate::operation::{MetricKinds, OperationAggregator};
use crate::proto::{CheckRequest, CheckResponse, Operation};
use crate::signature::{Signature, check_request_signature};

const MS_TO_NANOS: u64 = 1_000_000;

struct CheckEntry {
    signature: Signature,
    last_response: CheckResponse,
    pending: Option<OperationAggregator>,
    last_refresh: u64,
    in_flight: bool,
}

impl CheckEntry {
    /// Entry inserted on a miss: an empty positive response that
    /// coalesces concurrent callers while the first one goes remote.
    fn placeholder(signature: Signature, now: u64) -> Self {
        Self {
            signature,
            last_response: CheckResponse::default(),
            pending: None,
            last_refresh: now,
            in_flight: true,
        }
    }

    fn merge(
        &mut self,
        operation: &Operation,
        metric_kinds: &Arc<MetricKinds>,
    ) -> Result<(), Error> {
        self.pending
            .get_or_insert_with(|| OperationAggregator::new(operation, Arc::clone(metric_kinds)))
            .merge(operation)
    }
}

pub struct CheckAggregator {
    service_name: String,
    service_config_id: String,
    options: CheckAggregationOptions,
    metric_kinds: Arc<MetricKinds>,
    clock: Arc<dyn Clock>,
    /// `flush_interval_ms` / `expiration_ms` in clock ticks.
    flush_interval: u64,
    expiration: u64,
    cache: Option<Mutex<SignatureCache<CheckEntry>>>,
    flush_callback: CallbackSlot<CheckRequest>,
}

fn lock(cache: &Mutex<SignatureCache<CheckEntry>>) -> MutexGuard<'_, SignatureCache<CheckEntry>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CheckAggregator {
    pub fn new(
        service_name: impl Into<String>,
        service_config_id: impl Into<String>,
        options: CheckAggregationOptions,
        metric_kinds: Arc<MetricKinds>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = NonZeroUsize::new(options.num_entries)
            .map(|capacity| Mutex::new(SignatureCache::with_capacity(capacity)));
        Self {
            service_name: service_name.into(),
            service_config_id: service_config_id.into(),
            flush_interval: options.flush_interval_ms * MS_TO_NANOS,
            expiration: options.expiration_ms * MS_TO_NANOS,
            options,
            metric_kinds,
            clock,
            cache,
            flush_callback: CallbackSlot::empty(),
        }
    }

    /// See [`FlushCallback`] for the callback contract.
    pub fn set_flush_callback(&self, callback: Option<FlushCallback<CheckRequest>>) {
        self.flush_callback.set(callback);
    }

    /// How often this aggregator wants [`flush`](Self::flush) driven;
    /// `None` when caching is disabled.
    pub fn next_flush_interval(&self) -> Option<Duration> {
        self.cache
            .as_ref()
            .map(|_| Duration::from_millis(self.options.flush_interval_ms))
    }

    /// Answers a check from cache.
    ///
    /// Returns `Ok(None)` when the cache cannot answer; the caller
    /// must go to the transport and feed the result back through
    /// [`cache_response`](Self::cache_response).
    pub fn check(&self, request: &CheckRequest) -> Result<Option<CheckResponse>, Error> {
        if request.service_name != self.service_name {
            return Err(Error::ServiceNameMismatch {
                got: request.service_name.clone(),
                want: self.service_name.clone(),
            });
        }
        let Some(operation) = request.operation.as_ref() else {
            return Err(Error::MissingField { field: "operation" });
        };
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let signature = check_request_signature(operation);
        let now = self.clock.now();
        let mut staged = Vec::new();
        let cached = {
            let mut cache = lock(cache);
            'lookup: {
                if let Some(entry) = cache.get_mut(&signature) {
                    if now.saturating_sub(entry.last_refresh) < self.expiration {
                        // Negative responses are served as-is; merging
                        // would carry traffic forward past a denial.
                        if entry.last_response.is_positive() {
                            // Nothing is staged on the hit path, so a
                            // currency mismatch can propagate directly.
                            entry.merge(operation, &self.metric_kinds)?;
                        }
                        break 'lookup Some(entry.last_response.clone());
                    }
                }
                // Miss, or an entry past its hard bound. Any unsent
                // aggregate still goes out; a placeholder takes the
                // slot while the caller performs the remote call.
                if let Some(previous) = cache.pop(&signature) {
                    self.stage_refresh(previous, &mut staged);
                }
                if let Some(evicted) = cache.put(signature, CheckEntry::placeholder(signature, now))
                {
                    self.stage_refresh(evicted, &mut staged);
                }
                None
            }
        };
        self.flush_callback.emit_all(staged);
        Ok(cached)
    }

    /// Writes a transport response into the cache, creating the entry
    /// if flushing already evicted it. An error response discards the
    /// pending aggregate: errors must not be merged forward.
    pub fn cache_response(&self, request: &CheckRequest, response: CheckResponse) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(operation) = request.operation.as_ref() else {
            return;
        };
        let signature = check_request_signature(operation);
        let now = self.clock.now();
        let mut staged = Vec::new();
        {
            let mut cache = lock(cache);
            if let Some(entry) = cache.get_mut(&signature) {
                entry.in_flight = false;
                entry.last_refresh = now;
                if !response.is_positive() {
                    entry.pending = None;
                }
                entry.last_response = response;
            } else {
                let entry = CheckEntry {
                    signature,
                    last_response: response,
                    pending: None,
                    last_refresh: now,
                    in_flight: false,
                };
                if let Some(evicted) = cache.put(signature, entry) {
                    self.stage_refresh(evicted, &mut staged);
                }
            }
        }
        self.flush_callback.emit_all(staged);
    }

    /// Evicts entries older than the flush interval. Unsent
    /// aggregates become refresh requests; cached negatives younger
    /// than the expiration are retained; entries with an outstanding
    /// remote call stay put.
    pub fn flush(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let now = self.clock.now();
        let mut staged = Vec::new();
        {
            let mut cache = lock(cache);
            let swept = cache
                .pop_expired(|entry| now.saturating_sub(entry.last_refresh) >= self.flush_interval);
            for entry in swept {
                let expired = now.saturating_sub(entry.last_refresh) >= self.expiration;
                if expired {
                    self.stage_refresh(entry, &mut staged);
                } else if entry.in_flight || !entry.last_response.is_positive() {
                    let signature = entry.signature;
                    if let Some(evicted) = cache.put(signature, entry) {
                        self.stage_refresh(evicted, &mut staged);
                    }
                } else if entry.pending.is_some() {
                    // The entry is gone until the refresh response
                    // comes back through cache_response.
                    self.stage_refresh(entry, &mut staged);
                }
            }
        }
        self.flush_callback.emit_all(staged);
    }

    /// Drains the cache, emitting every unsent aggregate. Used at
    /// teardown.
    pub fn flush_all(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut staged = Vec::new();
        {
            let mut cache = lock(cache);
            for entry in cache.drain() {
                self.stage_pending(entry, &mut staged);
            }
        }
        self.flush_callback.emit_all(staged);
    }

    /// Stages a refresh request unless the entry already has a remote
    /// call outstanding.
    fn stage_refresh(&self, entry: CheckEntry, staged: &mut Vec<CheckRequest>) {
        if entry.in_flight {
            return;
        }
        self.stage_pending(entry, staged);
    }

    fn stage_pending(&self, entry: CheckEntry, staged: &mut Vec<CheckRequest>) {
        if let Some(pending) = entry.pending {
            staged.push(CheckRequest {
                service_name: self.service_name.clone(),
                operation: Some(pending.into_operation()),
                service_config_id: self.service_config_id.clone(),
            });
        }
    }
}
