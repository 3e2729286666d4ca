//! Request fingerprints.
//!
//! Two requests with the same fingerprint are interchangeable for
//! caching. Fields are concatenated with a NUL delimiter so adjacent
//! fields cannot run together, and label maps and metric names are
//! visited in sorted order so map iteration order never leaks into
//! the digest.
//!
//! Quota signatures deliberately ignore metric *values*: requests
//! that differ only in cost must land in the same cache slot so
//! their costs can be aggregated. Check signatures include the full
//! metric payload because different counts are semantically
//! different checks.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use md5::{Digest, Md5};

use crate::proto::{MetricValue, MetricValueSet, Operation, QuotaOperation};

/// A 16-byte MD5 digest. Collision resistance is all that is needed;
/// nothing security-sensitive derives from it.
pub type Signature = [u8; 16];

const DELIMITER: &[u8] = b"\0";

fn hash_labels(labels: &HashMap<String, String>, hasher: &mut Md5) {
    let ordered: BTreeMap<&String, &String> = labels.iter().collect();
    for (key, value) in ordered {
        hasher.update(DELIMITER);
        hasher.update(key.as_bytes());
        hasher.update(DELIMITER);
        hasher.update(value.as_bytes());
    }
}

/// Fingerprint of a single metric value: its labels only. Within one
/// metric name, values with equal labels aggregate together.
pub fn metric_value_signature(value: &MetricValue) -> Signature {
    let mut hasher = Md5::new();
    hash_labels(&value.labels, &mut hasher);
    hasher.finalize().into()
}

/// Fingerprint of a report operation: consumer, operation name and
/// labels. Metric values do not participate so usage with the same
/// shape accumulates into one entry.
pub fn report_operation_signature(operation: &Operation) -> Signature {
    let mut hasher = Md5::new();
    hasher.update(operation.consumer_id.as_bytes());
    hasher.update(DELIMITER);
    hasher.update(operation.operation_name.as_bytes());
    hash_labels(&operation.labels, &mut hasher);
    hasher.finalize().into()
}

/// Fingerprint of a check operation, including every metric value so
/// that semantically different checks never share a cache slot.
pub fn check_request_signature(operation: &Operation) -> Signature {
    let mut hasher = Md5::new();
    hasher.update(operation.operation_name.as_bytes());
    hasher.update(DELIMITER);
    hasher.update(operation.consumer_id.as_bytes());
    hasher.update(DELIMITER);
    hash_labels(&operation.labels, &mut hasher);

    let by_name: BTreeMap<&str, &MetricValueSet> = operation
        .metric_value_sets
        .iter()
        .map(|set| (set.metric_name.as_str(), set))
        .collect();
    for (metric_name, set) in by_name {
        hasher.update(DELIMITER);
        hasher.update(metric_name.as_bytes());
        for value in &set.metric_values {
            hash_labels(&value.labels, &mut hasher);
        }
    }

    hasher.update(DELIMITER);
    hasher.finalize().into()
}

/// Fingerprint of a quota operation: method, consumer and the sorted
/// *set* of metric names. Costs are excluded by design.
pub fn quota_request_signature(operation: &QuotaOperation) -> Signature {
    let mut hasher = Md5::new();
    hasher.update(operation.method_name.as_bytes());
    hasher.update(DELIMITER);
    hasher.update(operation.consumer_id.as_bytes());

    let metric_names: BTreeSet<&str> = operation
        .quota_metrics
        .iter()
        .map(|set| set.metric_name.as_str())
        .collect();
    for metric_name in metric_names {
        hasher.update(DELIMITER);
        hasher.update(metric_name.as_bytes());
    }
    hasher.finalize().into()
}
