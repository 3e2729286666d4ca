//! Merge accumulators for operations sharing a signature.
//!
//! An accumulator keeps one representative operation plus the merged
//! metric values observed since the last flush; `into_operation()`
//! rebuilds a wire operation carrying the combined payload.

use std::collections::{BTreeMap, HashMap, hash_map::Entry};
use std::sync::Arc;

use prost_types::Timestamp;

use crate::distribution;
use crate::error::Error;
use crate::money;
use crate::proto::{MetricValue, MetricValueSet, Operation, QuotaOperation, metric_value::Value};
use crate::signature::{Signature, metric_value_signature};

/// Metric kind from the service configuration; controls how two
/// values for the same metric combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Delta,
    Gauge,
    Cumulative,
}

/// Metric name to kind, as declared by the service configuration.
/// Metrics not listed merge as DELTA.
pub type MetricKinds = HashMap<String, MetricKind>;

fn timestamp_before(a: &Timestamp, b: &Timestamp) -> bool {
    a.seconds < b.seconds || (a.seconds == b.seconds && a.nanos < b.nanos)
}

/// Widens `to`'s time range to cover `from`'s: start collapses to
/// the minimum, end to the maximum.
fn merge_time_range(from: &MetricValue, to: &mut MetricValue) {
    if let Some(from_start) = &from.start_time
        && to
            .start_time
            .as_ref()
            .is_none_or(|start| timestamp_before(from_start, start))
    {
        to.start_time = Some(from_start.clone());
    }
    if let Some(from_end) = &from.end_time
        && to
            .end_time
            .as_ref()
            .is_none_or(|end| timestamp_before(end, from_end))
    {
        to.end_time = Some(from_end.clone());
    }
}

fn same_value_kind(a: &MetricValue, b: &MetricValue) -> bool {
    match (&a.value, &b.value) {
        (Some(x), Some(y)) => std::mem::discriminant(x) == std::mem::discriminant(y),
        _ => false,
    }
}

/// Merges two values of a DELTA metric.
///
/// Incompatible payload kinds and unmergeable distributions are
/// logged and the incoming value is dropped. A money currency
/// mismatch is the one failure reported to the caller: the two
/// accumulator variants disagree on what to do with it.
fn merge_delta_value(from: &MetricValue, to: &mut MetricValue) -> Result<(), Error> {
    if !same_value_kind(from, to) {
        tracing::warn!(
            from = ?from.value,
            to = ?to.value,
            "dropping metric value: payload kinds are not compatible"
        );
        return Ok(());
    }
    merge_time_range(from, to);
    match (&from.value, &mut to.value) {
        (Some(Value::Int64Value(add)), Some(Value::Int64Value(into))) => {
            *into += add;
        }
        (Some(Value::DoubleValue(add)), Some(Value::DoubleValue(into))) => {
            *into += add;
        }
        (Some(Value::DistributionValue(add)), Some(Value::DistributionValue(into))) => {
            if let Err(error) = distribution::merge_distribution(add, into) {
                tracing::warn!(error = %error, "dropping distribution value");
            }
        }
        (Some(Value::MoneyValue(add)), Some(Value::MoneyValue(into))) => {
            if add.currency_code != into.currency_code {
                return Err(Error::CurrencyMismatch {
                    left: into.currency_code.clone(),
                    right: add.currency_code.clone(),
                });
            }
            *into = money::saturating_add_money(into, add);
        }
        _ => {
            tracing::warn!(value = ?to.value, "metric value kind cannot be delta-merged");
        }
    }
    Ok(())
}

/// Keeps whichever value was observed later, by end time.
fn keep_latest_value(from: &MetricValue, to: &mut MetricValue) {
    let from_end = from.end_time.as_ref();
    let to_end = to.end_time.as_ref();
    let from_is_later = match (from_end, to_end) {
        (Some(f), Some(t)) => !timestamp_before(f, t),
        (Some(_), None) => true,
        _ => false,
    };
    if from_is_later {
        *to = from.clone();
    }
}

/// Accumulator for check and report operations: kind-aware merging of
/// metric values keyed by metric name and value labels.
pub struct OperationAggregator {
    /// Representative fields; metric value sets live in `values`.
    operation: Operation,
    metric_kinds: Arc<MetricKinds>,
    values: HashMap<String, HashMap<Signature, MetricValue>>,
}

impl OperationAggregator {
    /// Creates an empty accumulator carrying `operation`'s
    /// representative fields. Fold its metric values in with
    /// [`merge`](Self::merge), which is the fallible step.
    pub fn new(operation: &Operation, metric_kinds: Arc<MetricKinds>) -> Self {
        let mut representative = operation.clone();
        representative.metric_value_sets.clear();
        Self {
            operation: representative,
            metric_kinds,
            values: HashMap::new(),
        }
    }

    /// Merges an operation with the same signature into this
    /// accumulator.
    ///
    /// A money currency mismatch drops the offending value and is
    /// reported as `CurrencyMismatch` after the remaining values
    /// have merged; every other merge failure is logged and dropped
    /// without failing the call.
    pub fn merge(&mut self, operation: &Operation) -> Result<(), Error> {
        if let Some(start) = &operation.start_time
            && self
                .operation
                .start_time
                .as_ref()
                .is_none_or(|current| timestamp_before(start, current))
        {
            self.operation.start_time = Some(start.clone());
        }
        if let Some(end) = &operation.end_time
            && self
                .operation
                .end_time
                .as_ref()
                .is_none_or(|current| timestamp_before(current, end))
        {
            self.operation.end_time = Some(end.clone());
        }

        let mut first_error = None;
        for set in &operation.metric_value_sets {
            let kind = self
                .metric_kinds
                .get(&set.metric_name)
                .copied()
                .unwrap_or(MetricKind::Delta);
            let by_signature = self.values.entry(set.metric_name.clone()).or_default();
            for value in &set.metric_values {
                match by_signature.entry(metric_value_signature(value)) {
                    Entry::Vacant(slot) => {
                        slot.insert(value.clone());
                    }
                    Entry::Occupied(mut slot) => match kind {
                        MetricKind::Delta => {
                            if let Err(error) = merge_delta_value(value, slot.get_mut()) {
                                tracing::warn!(
                                    metric = %set.metric_name,
                                    error = %error,
                                    "dropping metric value"
                                );
                                first_error.get_or_insert(error);
                            }
                        }
                        MetricKind::Gauge | MetricKind::Cumulative => {
                            keep_latest_value(value, slot.get_mut());
                        }
                    },
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Rebuilds a wire operation with the merged metric value sets,
    /// ordered by metric name for deterministic output.
    pub fn into_operation(self) -> Operation {
        let mut operation = self.operation;
        let ordered: BTreeMap<String, HashMap<Signature, MetricValue>> =
            self.values.into_iter().collect();
        for (metric_name, by_signature) in ordered {
            operation.metric_value_sets.push(MetricValueSet {
                metric_name,
                metric_values: by_signature.into_values().collect(),
            });
        }
        operation
    }
}

/// Accumulator for quota operations: one cost value per metric name,
/// int64-dominated (the control plane sends exactly one value per
/// quota metric).
pub struct QuotaOperationAggregator {
    operation: QuotaOperation,
    values: HashMap<String, MetricValue>,
}

impl QuotaOperationAggregator {
    pub fn new(operation: &QuotaOperation) -> Self {
        let mut representative = operation.clone();
        representative.quota_metrics.clear();
        let mut aggregator = Self {
            operation: representative,
            values: HashMap::new(),
        };
        aggregator.merge(operation);
        aggregator
    }

    /// Merges an operation with the same signature. Unlike the
    /// check/report accumulator, a money currency mismatch here is
    /// logged and skipped, never surfaced: quota admission already
    /// happened and must not fail retroactively.
    pub fn merge(&mut self, operation: &QuotaOperation) {
        for set in &operation.quota_metrics {
            let Some(value) = set.metric_values.first() else {
                continue;
            };
            match self.values.entry(set.metric_name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                }
                Entry::Occupied(mut slot) => {
                    if let Err(error) = merge_delta_value(value, slot.get_mut()) {
                        tracing::warn!(
                            metric = %set.metric_name,
                            error = %error,
                            "skipping quota metric value"
                        );
                    }
                }
            }
        }
    }

    pub fn into_operation(self) -> QuotaOperation {
        let mut operation = self.operation;
        let ordered: BTreeMap<String, MetricValue> = self.values.into_iter().collect();
        for (metric_name, value) in ordered {
            operation.quota_metrics.push(MetricValueSet {
                metric_name,
                metric_values: vec![value],
            });
        }
        operation
    }
}
