//! Report batching.
//!
//! Reports are write-only: there is nothing to cache, only usage to
//! accumulate. Operations merge into per-signature accumulators and
//! each flush drains the aged ones into a single outbound
//! ReportRequest. Responses are discarded by the caller.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::aggregator::{CallbackSlot, FlushCallback, ReportAggregationOptions};
use crate::cache::SignatureCache;
use crate::clock::Clock;
use crate::error::Error;
use crate::operation::{MetricKinds, OperationAggregator};
use crate::proto::{Operation, ReportRequest};
use crate::signature::report_operation_signature;

const MS_TO_NANOS: u64 = 1_000_000;

struct ReportEntry {
    aggregator: OperationAggregator,
    /// When this accumulator was created; it is drained whole, so
    /// nothing else ages it.
    created: u64,
}

pub struct ReportAggregator {
    service_name: String,
    service_config_id: String,
    options: ReportAggregationOptions,
    metric_kinds: Arc<MetricKinds>,
    clock: Arc<dyn Clock>,
    flush_interval: u64,
    cache: Option<Mutex<SignatureCache<ReportEntry>>>,
    flush_callback: CallbackSlot<ReportRequest>,
}

fn lock(cache: &Mutex<SignatureCache<ReportEntry>>) -> MutexGuard<'_, SignatureCache<ReportEntry>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReportAggregator {
    pub fn new(
        service_name: impl Into<String>,
        service_config_id: impl Into<String>,
        options: ReportAggregationOptions,
        metric_kinds: Arc<MetricKinds>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = NonZeroUsize::new(options.num_entries)
            .map(|capacity| Mutex::new(SignatureCache::with_capacity(capacity)));
        Self {
            service_name: service_name.into(),
            service_config_id: service_config_id.into(),
            flush_interval: options.flush_interval_ms * MS_TO_NANOS,
            options,
            metric_kinds,
            clock,
            cache,
            flush_callback: CallbackSlot::empty(),
        }
    }

    /// See [`FlushCallback`] for the callback contract.
    pub fn set_flush_callback(&self, callback: Option<FlushCallback<ReportRequest>>) {
        self.flush_callback.set(callback);
    }

    pub fn next_flush_interval(&self) -> Option<Duration> {
        self.cache
            .as_ref()
            .map(|_| Duration::from_millis(self.options.flush_interval_ms))
    }

    /// Absorbs a report into the accumulators. Returns `Ok(false)`
    /// when batching is disabled and the caller must send the request
    /// itself. Capacity pressure may emit a partial batch early.
    ///
    /// A money currency mismatch drops the offending value and is
    /// reported after every operation has been absorbed, so one bad
    /// value cannot lose the rest of the batch.
    pub fn report(&self, request: &ReportRequest) -> Result<bool, Error> {
        if request.service_name != self.service_name {
            return Err(Error::ServiceNameMismatch {
                got: request.service_name.clone(),
                want: self.service_name.clone(),
            });
        }
        let Some(cache) = &self.cache else {
            return Ok(false);
        };

        let now = self.clock.now();
        let mut staged = Vec::new();
        let mut first_error = None;
        {
            let mut cache = lock(cache);
            for operation in &request.operations {
                let signature = report_operation_signature(operation);
                if let Some(entry) = cache.get_mut(&signature) {
                    if let Err(error) = entry.aggregator.merge(operation) {
                        first_error.get_or_insert(error);
                    }
                    continue;
                }
                let mut aggregator =
                    OperationAggregator::new(operation, Arc::clone(&self.metric_kinds));
                if let Err(error) = aggregator.merge(operation) {
                    first_error.get_or_insert(error);
                }
                let entry = ReportEntry {
                    aggregator,
                    created: now,
                };
                if let Some(evicted) = cache.put(signature, entry) {
                    staged.push(self.batch(vec![evicted.aggregator.into_operation()]));
                }
            }
        }
        self.flush_callback.emit_all(staged);
        match first_error {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    /// Drains accumulators older than the flush interval into one
    /// batched ReportRequest.
    pub fn flush(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let now = self.clock.now();
        let mut staged = Vec::new();
        {
            let mut cache = lock(cache);
            let swept = cache
                .pop_expired(|entry| now.saturating_sub(entry.created) >= self.flush_interval);
            let operations: Vec<Operation> = swept
                .into_iter()
                .map(|entry| entry.aggregator.into_operation())
                .collect();
            if !operations.is_empty() {
                staged.push(self.batch(operations));
            }
        }
        self.flush_callback.emit_all(staged);
    }

    /// Drains everything into one batched ReportRequest. Used at
    /// teardown.
    pub fn flush_all(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut staged = Vec::new();
        {
            let mut cache = lock(cache);
            let operations: Vec<Operation> = cache
                .drain()
                .into_iter()
                .map(|entry| entry.aggregator.into_operation())
                .collect();
            if !operations.is_empty() {
                staged.push(self.batch(operations));
            }
        }
        self.flush_callback.emit_all(staged);
    }

    fn batch(&self, operations: Vec<Operation>) -> ReportRequest {
        ReportRequest {
            service_name: self.service_name.clone(),
            operations,
            service_config_id: self.service_config_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{MetricValue, MetricValueSet, Money, metric_value::Value};
    use crate::testing::ManualClock;

    const SERVICE: &str = "library.googleapis.com";
    const CONFIG_ID: &str = "2016-09-19r0";

    fn operation(name: &str, cost: i64) -> Operation {
        Operation {
            operation_name: name.into(),
            consumer_id: "project:test".into(),
            metric_value_sets: vec![MetricValueSet {
                metric_name: "requests".into(),
                metric_values: vec![MetricValue::int64(cost)],
            }],
            ..Operation::default()
        }
    }

    fn request(operations: Vec<Operation>) -> ReportRequest {
        ReportRequest {
            service_name: SERVICE.into(),
            operations,
            service_config_id: CONFIG_ID.into(),
        }
    }

    fn aggregator(
        options: ReportAggregationOptions,
        clock: Arc<ManualClock>,
    ) -> (ReportAggregator, Arc<Mutex<Vec<ReportRequest>>>) {
        let aggregator = ReportAggregator::new(
            SERVICE,
            CONFIG_ID,
            options,
            Arc::new(MetricKinds::new()),
            clock,
        );
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        aggregator.set_flush_callback(Some(Arc::new(move |request| {
            sink.lock().unwrap().push(request);
        })));
        (aggregator, emitted)
    }

    #[test]
    fn hundred_reports_flush_as_one_operation() {
        let clock = ManualClock::arc();
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(10, 500),
            Arc::clone(&clock),
        );
        for _ in 0..100 {
            assert!(aggregator.report(&request(vec![operation("ListShelves", 1)])).unwrap());
        }

        clock.advance(Duration::from_millis(600));
        aggregator.flush();

        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].operations.len(), 1);
        assert_eq!(
            emitted[0].operations[0].metric_value_sets[0].metric_values[0].as_int64(),
            Some(100)
        );
    }

    #[test]
    fn distinct_signatures_batch_together() {
        let clock = ManualClock::arc();
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(10, 500),
            Arc::clone(&clock),
        );
        aggregator
            .report(&request(vec![
                operation("ListShelves", 1),
                operation("GetShelf", 2),
            ]))
            .unwrap();

        clock.advance(Duration::from_millis(600));
        aggregator.flush();

        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1, "one batched request");
        assert_eq!(emitted[0].operations.len(), 2);
        assert_eq!(emitted[0].service_name, SERVICE);
    }

    #[test]
    fn young_accumulators_are_not_flushed() {
        let clock = ManualClock::arc();
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(10, 500),
            Arc::clone(&clock),
        );
        aggregator.report(&request(vec![operation("ListShelves", 1)])).unwrap();

        clock.advance(Duration::from_millis(100));
        aggregator.flush();
        assert!(emitted.lock().unwrap().is_empty());
    }

    #[test]
    fn capacity_pressure_emits_a_partial_batch() {
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(2, 500),
            ManualClock::arc(),
        );
        aggregator.report(&request(vec![operation("a", 1)])).unwrap();
        aggregator.report(&request(vec![operation("b", 2)])).unwrap();
        aggregator.report(&request(vec![operation("c", 3)])).unwrap();

        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1, "oldest accumulator evicted early");
        assert_eq!(emitted[0].operations.len(), 1);
        assert_eq!(emitted[0].operations[0].operation_name, "a");
    }

    #[test]
    fn disabled_batching_passes_through() {
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(0, 500),
            ManualClock::arc(),
        );
        assert!(!aggregator.report(&request(vec![operation("a", 1)])).unwrap());
        assert!(emitted.lock().unwrap().is_empty());
    }

    #[test]
    fn flush_all_drains_everything() {
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(10, 500),
            ManualClock::arc(),
        );
        aggregator.report(&request(vec![operation("a", 1)])).unwrap();
        aggregator.report(&request(vec![operation("b", 2)])).unwrap();

        aggregator.flush_all();
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].operations.len(), 2);
    }

    #[test]
    fn currency_mismatch_surfaces_but_keeps_the_batch() {
        let clock = ManualClock::arc();
        let (aggregator, emitted) = aggregator(
            ReportAggregationOptions::new(10, 500),
            Arc::clone(&clock),
        );
        let money_operation = |currency: &str| Operation {
            operation_name: "ListShelves".into(),
            consumer_id: "project:test".into(),
            metric_value_sets: vec![MetricValueSet {
                metric_name: "spend".into(),
                metric_values: vec![MetricValue {
                    value: Some(Value::MoneyValue(Money::new(currency, 5, 0))),
                    ..MetricValue::default()
                }],
            }],
            ..Operation::default()
        };

        aggregator
            .report(&request(vec![money_operation("USD")]))
            .unwrap();
        let err = aggregator
            .report(&request(vec![money_operation("CAD")]))
            .unwrap_err();
        assert!(matches!(err, Error::CurrencyMismatch { .. }));

        // The accumulator survives with the original value.
        clock.advance(Duration::from_millis(600));
        aggregator.flush();
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        match &emitted[0].operations[0].metric_value_sets[0].metric_values[0].value {
            Some(Value::MoneyValue(money)) => assert_eq!(money.currency_code, "USD"),
            other => panic!("expected money value, got {other:?}"),
        }
    }

    #[test]
    fn wrong_service_name_is_rejected() {
        let (aggregator, _) = aggregator(
            ReportAggregationOptions::new(10, 500),
            ManualClock::arc(),
        );
        let mut bad = request(vec![operation("a", 1)]);
        bad.service_name = "other".into();
        assert!(matches!(
            aggregator.report(&bad),
            Err(Error::ServiceNameMismatch { .. })
        ));
    }
}
