//! AllocateQuota caching with optimistic admission.
//!
//! Quota sits on the synchronous critical path of every API request,
//! so a cold cache never stalls callers: the first request installs
//! an optimistic positive placeholder, goes out through the flush
//! callback as the one-and-only remote call, and every concurrent
//! caller is admitted against the placeholder while their costs
//! merge locally. The `in_flight` flag keeps outbound traffic to a
//! single call per fingerprint.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::aggregator::{CallbackSlot, FlushCallback, QuotaAggregationOptions};
use crate::cache::SignatureCache;
use crate::clock::Clock;
use crate::error::Error;
use crate::operation::QuotaOperationAggregator;
use crate::proto::{AllocateQuotaRequest, AllocateQuotaResponse, QuotaMode};
use crate::signature::{Signature, quota_request_signature};

const MS_TO_NANOS: u64 = 1_000_000;

struct QuotaEntry {
    signature: Signature,
    /// The request that created this entry; the refresh template when
    /// nothing has aggregated since the last emission.
    initial_request: AllocateQuotaRequest,
    response: AllocateQuotaResponse,
    pending: Option<QuotaOperationAggregator>,
    last_refresh: u64,
    in_flight: bool,
}

impl QuotaEntry {
    fn is_positive(&self) -> bool {
        self.response.is_positive()
    }

    fn aggregate(&mut self, request: &AllocateQuotaRequest) {
        let Some(operation) = request.allocate_operation.as_ref() else {
            return;
        };
        match &mut self.pending {
            Some(aggregator) => aggregator.merge(operation),
            None => self.pending = Some(QuotaOperationAggregator::new(operation)),
        }
    }

    fn set_response(&mut self, response: AllocateQuotaResponse) {
        // A denial invalidates everything aggregated against the old
        // positive response.
        if !response.is_positive() {
            self.pending = None;
        }
        self.response = response;
    }

    /// Builds the refresh request and clears the aggregate, falling
    /// back to the initial request when nothing has accumulated.
    fn take_refresh_request(
        &mut self,
        service_name: &str,
        service_config_id: &str,
    ) -> AllocateQuotaRequest {
        match self.pending.take() {
            Some(aggregator) => AllocateQuotaRequest {
                service_name: service_name.to_string(),
                allocate_operation: Some(aggregator.into_operation()),
                service_config_id: service_config_id.to_string(),
            },
            None => self.initial_request.clone(),
        }
    }
}

pub struct QuotaAggregator {
    service_name: String,
    service_config_id: String,
    options: QuotaAggregationOptions,
    clock: Arc<dyn Clock>,
    refresh_interval: u64,
    expiration_interval: u64,
    cache: Option<Mutex<SignatureCache<QuotaEntry>>>,
    flush_callback: CallbackSlot<AllocateQuotaRequest>,
}

fn lock(cache: &Mutex<SignatureCache<QuotaEntry>>) -> MutexGuard<'_, SignatureCache<QuotaEntry>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QuotaAggregator {
    pub fn new(
        service_name: impl Into<String>,
        service_config_id: impl Into<String>,
        options: QuotaAggregationOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = NonZeroUsize::new(options.num_entries)
            .map(|capacity| Mutex::new(SignatureCache::with_capacity(capacity)));
        Self {
            service_name: service_name.into(),
            service_config_id: service_config_id.into(),
            refresh_interval: options.refresh_interval_ms * MS_TO_NANOS,
            expiration_interval: options.expiration_interval_ms * MS_TO_NANOS,
            options,
            clock,
            cache,
            flush_callback: CallbackSlot::empty(),
        }
    }

    /// See [`FlushCallback`] for the callback contract.
    pub fn set_flush_callback(&self, callback: Option<FlushCallback<AllocateQuotaRequest>>) {
        self.flush_callback.set(callback);
    }

    pub fn next_flush_interval(&self) -> Option<Duration> {
        self.cache
            .as_ref()
            .map(|_| Duration::from_millis(self.options.refresh_interval_ms))
    }

    /// Answers an allocation from cache.
    ///
    /// Returns `Ok(None)` only when caching is disabled; with a cache
    /// present every caller gets an answer immediately. On a miss
    /// that answer is an optimistic positive placeholder and the
    /// incoming request is emitted through the flush callback as the
    /// single remote call for this fingerprint.
    pub fn allocate_quota(
        &self,
        request: &AllocateQuotaRequest,
    ) -> Result<Option<AllocateQuotaResponse>, Error> {
        if request.service_name != self.service_name {
            return Err(Error::ServiceNameMismatch {
                got: request.service_name.clone(),
                want: self.service_name.clone(),
            });
        }
        let Some(operation) = request.allocate_operation.as_ref() else {
            return Err(Error::MissingField {
                field: "allocate_operation",
            });
        };
        let Some(cache) = &self.cache else {
            return Ok(None);
        };

        let signature = quota_request_signature(operation);
        let now = self.clock.now();
        let mut staged = Vec::new();
        let response = {
            let mut cache = lock(cache);
            'lookup: {
                if let Some(entry) = cache.get_mut(&signature) {
                    if now.saturating_sub(entry.last_refresh) < self.expiration_interval {
                        if !entry.in_flight
                            && now.saturating_sub(entry.last_refresh) >= self.refresh_interval
                        {
                            entry.in_flight = true;
                            entry.last_refresh = now;
                            let mode = if entry.is_positive() {
                                QuotaMode::BestEffort
                            } else {
                                // Probe for recovery without burning
                                // tokens while the consumer is denied.
                                QuotaMode::CheckOnly
                            };
                            let mut refresh = entry
                                .take_refresh_request(&self.service_name, &self.service_config_id);
                            if let Some(op) = refresh.allocate_operation.as_mut() {
                                op.set_quota_mode(mode);
                            }
                            staged.push(refresh);
                        }
                        if entry.is_positive() {
                            entry.aggregate(request);
                        }
                        break 'lookup entry.response.clone();
                    }
                }
                // Miss or an entry past its hard bound: admit
                // optimistically and coalesce the herd into one call.
                if let Some(previous) = cache.pop(&signature) {
                    self.stage_unsent(previous, &mut staged);
                }
                let entry = QuotaEntry {
                    signature,
                    initial_request: request.clone(),
                    response: AllocateQuotaResponse::default(),
                    pending: None,
                    last_refresh: now,
                    in_flight: true,
                };
                let response = entry.response.clone();
                if let Some(evicted) = cache.put(signature, entry) {
                    self.stage_unsent(evicted, &mut staged);
                }
                staged.push(request.clone());
                response
            }
        };
        self.flush_callback.emit_all(staged);
        Ok(Some(response))
    }

    /// Writes a transport response into the cache and releases the
    /// entry's in-flight slot. Unknown fingerprints are ignored: the
    /// entry was evicted while the call was outstanding and the
    /// response has nowhere to land.
    pub fn cache_response(&self, request: &AllocateQuotaRequest, response: AllocateQuotaResponse) {
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(operation) = request.allocate_operation.as_ref() else {
            return;
        };
        let signature = quota_request_signature(operation);
        let now = self.clock.now();
        let mut cache = lock(cache);
        if let Some(entry) = cache.get_mut(&signature) {
            entry.in_flight = false;
            entry.last_refresh = now;
            entry.set_response(response);
        }
    }

    /// Sweeps entries past the refresh interval: expired ones are
    /// dropped (emitting any unsent aggregate first), the rest are
    /// reinserted, emitting a best-effort refresh when they hold an
    /// aggregate and no call is outstanding.
    pub fn flush(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let now = self.clock.now();
        let mut staged = Vec::new();
        {
            let mut cache = lock(cache);
            let swept = cache.pop_expired(|entry| {
                now.saturating_sub(entry.last_refresh) >= self.refresh_interval
            });
            for mut entry in swept {
                if now.saturating_sub(entry.last_refresh) >= self.expiration_interval {
                    self.stage_unsent(entry, &mut staged);
                    continue;
                }
                if !entry.in_flight && entry.pending.is_some() {
                    entry.in_flight = true;
                    entry.last_refresh = now;
                    let mode = if entry.is_positive() {
                        QuotaMode::BestEffort
                    } else {
                        QuotaMode::CheckOnly
                    };
                    let mut refresh =
                        entry.take_refresh_request(&self.service_name, &self.service_config_id);
                    if let Some(op) = refresh.allocate_operation.as_mut() {
                        op.set_quota_mode(mode);
                    }
                    staged.push(refresh);
                }
                let signature = entry.signature;
                if let Some(evicted) = cache.put(signature, entry) {
                    self.stage_unsent(evicted, &mut staged);
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
                self.stage_unsent(entry, &mut staged);
            }
        }
        self.flush_callback.emit_all(staged);
    }

    /// Emits tokens that were admitted locally but never reported
    /// upstream. Dropping them silently would under-report usage.
    fn stage_unsent(&self, mut entry: QuotaEntry, staged: &mut Vec<AllocateQuotaRequest>) {
        if entry.pending.is_none() {
            return;
        }
        let mut request = entry.take_refresh_request(&self.service_name, &self.service_config_id);
        if let Some(op) = request.allocate_operation.as_mut() {
            op.set_quota_mode(QuotaMode::BestEffort);
        }
        staged.push(request);
    }
}
