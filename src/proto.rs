//! Service Control v1 wire messages.
//!
//! Hand-maintained prost structs whose field tags match
//! `google.api.servicecontrol.v1`, so encoded bytes are
//! wire-compatible with the control plane. Only the fields the
//! client reads or writes are declared; unknown fields are skipped
//! by prost on decode and never re-emitted.

use std::collections::HashMap;

use prost_types::Timestamp;

/// An amount of money in a specific currency, `google.type.Money` shaped.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Money {
    /// Three-letter ISO 4217 currency code.
    #[prost(string, tag = "1")]
    pub currency_code: String,
    /// Whole units of the amount.
    #[prost(int64, tag = "2")]
    pub units: i64,
    /// Nano units, in `[-999_999_999, 999_999_999]`, sign-consistent
    /// with `units`.
    #[prost(int32, tag = "3")]
    pub nanos: i32,
}

impl Money {
    pub fn new(currency_code: impl Into<String>, units: i64, nanos: i32) -> Self {
        Self {
            currency_code: currency_code.into(),
            units,
            nanos,
        }
    }
}

/// Summary of a population of values with a histogram.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Distribution {
    #[prost(int64, tag = "1")]
    pub count: i64,
    #[prost(double, tag = "2")]
    pub mean: f64,
    #[prost(double, tag = "3")]
    pub minimum: f64,
    #[prost(double, tag = "4")]
    pub maximum: f64,
    #[prost(double, tag = "5")]
    pub sum_of_squared_deviation: f64,
    /// One count per histogram bucket, underflow and overflow included.
    #[prost(int64, repeated, tag = "6")]
    pub bucket_counts: Vec<i64>,
    #[prost(oneof = "distribution::BucketOption", tags = "7, 8, 9")]
    pub bucket_option: Option<distribution::BucketOption>,
}

pub mod distribution {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LinearBuckets {
        #[prost(int32, tag = "1")]
        pub num_finite_buckets: i32,
        #[prost(double, tag = "2")]
        pub width: f64,
        #[prost(double, tag = "3")]
        pub offset: f64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExponentialBuckets {
        #[prost(int32, tag = "1")]
        pub num_finite_buckets: i32,
        #[prost(double, tag = "2")]
        pub growth_factor: f64,
        #[prost(double, tag = "3")]
        pub scale: f64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExplicitBuckets {
        #[prost(double, repeated, tag = "1")]
        pub bounds: Vec<f64>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum BucketOption {
        #[prost(message, tag = "7")]
        LinearBuckets(LinearBuckets),
        #[prost(message, tag = "8")]
        ExponentialBuckets(ExponentialBuckets),
        #[prost(message, tag = "9")]
        ExplicitBuckets(ExplicitBuckets),
    }
}

/// A single typed, labeled measurement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricValue {
    #[prost(map = "string, string", tag = "1")]
    pub labels: HashMap<String, String>,
    #[prost(message, optional, tag = "2")]
    pub start_time: Option<Timestamp>,
    #[prost(message, optional, tag = "3")]
    pub end_time: Option<Timestamp>,
    #[prost(oneof = "metric_value::Value", tags = "4, 5, 6, 7, 8, 9")]
    pub value: Option<metric_value::Value>,
}

impl MetricValue {
    /// A bare int64 value with no labels.
    pub fn int64(value: i64) -> Self {
        Self {
            value: Some(metric_value::Value::Int64Value(value)),
            ..Self::default()
        }
    }

    /// The int64 payload, if this value carries one.
    pub fn as_int64(&self) -> Option<i64> {
        match self.value {
            Some(metric_value::Value::Int64Value(v)) => Some(v),
            _ => None,
        }
    }
}

pub mod metric_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(bool, tag = "4")]
        BoolValue(bool),
        #[prost(int64, tag = "5")]
        Int64Value(i64),
        #[prost(double, tag = "6")]
        DoubleValue(f64),
        #[prost(string, tag = "7")]
        StringValue(String),
        #[prost(message, tag = "8")]
        DistributionValue(super::Distribution),
        #[prost(message, tag = "9")]
        MoneyValue(super::Money),
    }
}

/// All values reported for a single metric name.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricValueSet {
    #[prost(string, tag = "1")]
    pub metric_name: String,
    #[prost(message, repeated, tag = "2")]
    pub metric_values: Vec<MetricValue>,
}

/// The unit of work arbitrated by the control plane: one consumer,
/// one method call, a bag of labels and metric values.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub operation_id: String,
    #[prost(string, tag = "2")]
    pub operation_name: String,
    #[prost(string, tag = "3")]
    pub consumer_id: String,
    #[prost(message, optional, tag = "4")]
    pub start_time: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub end_time: Option<Timestamp>,
    #[prost(map = "string, string", tag = "6")]
    pub labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "7")]
    pub metric_value_sets: Vec<MetricValueSet>,
    #[prost(enumeration = "operation::Importance", tag = "11")]
    pub importance: i32,
}

pub mod operation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Importance {
        Low = 0,
        High = 1,
    }
}

/// Pre-flight authorization of an API call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckRequest {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<Operation>,
    #[prost(string, tag = "4")]
    pub service_config_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckError {
    #[prost(enumeration = "check_error::Code", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub detail: String,
}

pub mod check_error {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Code {
        ErrorCodeUnspecified = 0,
        NotFound = 5,
        PermissionDenied = 7,
        ResourceExhausted = 8,
        ServiceNotActivated = 104,
        ApiKeyInvalid = 105,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckResponse {
    #[prost(string, tag = "1")]
    pub operation_id: String,
    /// Empty means the operation is allowed.
    #[prost(message, repeated, tag = "2")]
    pub check_errors: Vec<CheckError>,
    #[prost(string, tag = "5")]
    pub service_config_id: String,
}

impl CheckResponse {
    /// Whether the response allows the operation.
    pub fn is_positive(&self) -> bool {
        self.check_errors.is_empty()
    }
}

/// How strictly an allocation is enforced and whether it consumes
/// tokens.
pub mod quota_operation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum QuotaMode {
        Unspecified = 0,
        /// Allocate or fail the whole request.
        Normal = 1,
        /// Allocate as much as is available, never fail.
        BestEffort = 2,
        /// Only check availability; consume nothing.
        CheckOnly = 3,
    }
}

pub use quota_operation::QuotaMode;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuotaOperation {
    #[prost(string, tag = "1")]
    pub operation_id: String,
    #[prost(string, tag = "2")]
    pub method_name: String,
    #[prost(string, tag = "3")]
    pub consumer_id: String,
    #[prost(map = "string, string", tag = "4")]
    pub labels: HashMap<String, String>,
    /// One metric value per quota metric; the value is the cost.
    #[prost(message, repeated, tag = "5")]
    pub quota_metrics: Vec<MetricValueSet>,
    #[prost(enumeration = "quota_operation::QuotaMode", tag = "6")]
    pub quota_mode: i32,
}

/// Token reservation against per-consumer quota buckets.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocateQuotaRequest {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(message, optional, tag = "2")]
    pub allocate_operation: Option<QuotaOperation>,
    #[prost(string, tag = "4")]
    pub service_config_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuotaError {
    #[prost(enumeration = "quota_error::Code", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub subject: String,
    #[prost(string, tag = "3")]
    pub description: String,
}

pub mod quota_error {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Code {
        Unspecified = 0,
        ResourceExhausted = 8,
        ApiKeyInvalid = 105,
        ProjectDeleted = 108,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocateQuotaResponse {
    #[prost(string, tag = "1")]
    pub operation_id: String,
    /// Empty means the allocation was granted.
    #[prost(message, repeated, tag = "2")]
    pub allocate_errors: Vec<QuotaError>,
    #[prost(message, repeated, tag = "3")]
    pub quota_metrics: Vec<MetricValueSet>,
    #[prost(string, tag = "4")]
    pub service_config_id: String,
}

impl AllocateQuotaResponse {
    /// Whether the allocation was granted (or is an optimistic
    /// placeholder).
    pub fn is_positive(&self) -> bool {
        self.allocate_errors.is_empty()
    }
}

/// After-the-fact usage reporting.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportRequest {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(message, repeated, tag = "2")]
    pub operations: Vec<Operation>,
    #[prost(string, tag = "3")]
    pub service_config_id: String,
}

/// `google.rpc.Status` shaped error payload (details omitted).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportError {
    #[prost(string, tag = "1")]
    pub operation_id: String,
    #[prost(message, optional, tag = "2")]
    pub status: Option<RpcStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportResponse {
    /// Partial failures; operations not listed here were accepted.
    #[prost(message, repeated, tag = "1")]
    pub report_errors: Vec<ReportError>,
    #[prost(string, tag = "2")]
    pub service_config_id: String,
}
