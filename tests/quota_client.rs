//! End-to-end AllocateQuota flows: single-flight coalescing,
//! refresh-after-denial and fail-open behavior.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use service_control_client::aggregator::QuotaAggregationOptions;
use service_control_client::proto::{
    AllocateQuotaRequest, AllocateQuotaResponse, MetricValue, MetricValueSet, QuotaError,
    QuotaMode, QuotaOperation, quota_error,
};
use service_control_client::testing::{ManualClock, MockQuotaTransport};
use service_control_client::{ClientOptions, Code, ServiceControlClient};

const SERVICE: &str = "library.googleapis.com";
const CONFIG_ID: &str = "2016-09-19r0";

fn quota_request(cost: i64) -> AllocateQuotaRequest {
    AllocateQuotaRequest {
        service_name: SERVICE.into(),
        allocate_operation: Some(QuotaOperation {
            operation_id: "operation-1".into(),
            method_name: "methodname".into(),
            consumer_id: "consumerid".into(),
            quota_metrics: vec![
                MetricValueSet {
                    metric_name: "metric_first".into(),
                    metric_values: vec![MetricValue::int64(cost)],
                },
                MetricValueSet {
                    metric_name: "metric_second".into(),
                    metric_values: vec![MetricValue::int64(cost)],
                },
            ],
            quota_mode: QuotaMode::BestEffort as i32,
            ..QuotaOperation::default()
        }),
        service_config_id: CONFIG_ID.into(),
    }
}

fn positive_response() -> AllocateQuotaResponse {
    AllocateQuotaResponse {
        operation_id: "operation-1".into(),
        service_config_id: CONFIG_ID.into(),
        ..AllocateQuotaResponse::default()
    }
}

fn negative_response() -> AllocateQuotaResponse {
    AllocateQuotaResponse {
        operation_id: "operation-1".into(),
        allocate_errors: vec![QuotaError {
            code: quota_error::Code::ResourceExhausted as i32,
            subject: "user:integration_test_user".into(),
            description: String::new(),
        }],
        ..AllocateQuotaResponse::default()
    }
}

fn client(
    transport: Arc<MockQuotaTransport>,
    clock: Arc<ManualClock>,
    options: QuotaAggregationOptions,
) -> ServiceControlClient {
    ServiceControlClient::new(
        SERVICE,
        CONFIG_ID,
        ClientOptions {
            quota_options: options,
            quota_transport: Some(transport),
            enable_flush_timer: false,
            clock: Some(clock),
            ..ClientOptions::default()
        },
    )
    .unwrap()
}

/// Lets detached flush dispatches run to completion.
async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn cold_cache_burst_is_single_flight() {
    let transport = MockQuotaTransport::returning(positive_response());
    // Hold the transport so the one remote call stays outstanding
    // for the whole burst.
    transport.hold();
    let client = Arc::new(client(
        Arc::clone(&transport),
        ManualClock::arc(),
        QuotaAggregationOptions::new(10, 500),
    ));

    let mut workers = Vec::new();
    for _ in 0..10 {
        let client = Arc::clone(&client);
        workers.push(tokio::spawn(async move {
            client.allocate_quota(quota_request(1)).await.unwrap()
        }));
    }
    for worker in workers {
        let response = worker.await.unwrap();
        assert!(response.is_positive(), "every caller admitted");
    }
    settle().await;

    // The burst coalesced while the call was still in the air.
    assert_eq!(transport.calls(), 1, "one remote call for the burst");
    assert_eq!(transport.requests()[0], quota_request(1));

    let stats = client.statistics();
    assert_eq!(stats.total_called_quotas, 10);
    assert_eq!(stats.send_quotas_by_flush, 1);
    assert_eq!(stats.send_quotas_in_flight, 0);

    // Completing the call lands the real response in the cache.
    transport.release();
    settle().await;
    let after = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(after.is_positive());
    assert_eq!(transport.calls(), 1, "still no extra remote call");
}

#[tokio::test]
async fn denial_is_cached_and_recovery_probed_check_only() {
    let clock = ManualClock::arc();
    let transport = MockQuotaTransport::returning(negative_response());
    let client = client(
        Arc::clone(&transport),
        Arc::clone(&clock),
        QuotaAggregationOptions::new(10, 500),
    );

    // First call is admitted optimistically while the real request
    // runs in the background and lands a denial in the cache.
    let first = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(first.is_positive());
    settle().await;

    let second = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(!second.is_positive(), "denial now served from cache");

    // Past the refresh interval the cached denial is still returned,
    // but a CHECK_ONLY probe goes out to test for recovery.
    clock.advance(Duration::from_millis(600));
    transport.set_response(positive_response());
    let third = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(!third.is_positive());
    settle().await;

    assert_eq!(transport.calls(), 2);
    let probe = transport.requests()[1]
        .allocate_operation
        .as_ref()
        .unwrap()
        .quota_mode();
    assert_eq!(probe, QuotaMode::CheckOnly);

    // The probe succeeded: traffic recovers.
    let fourth = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(fourth.is_positive());
}

#[tokio::test]
async fn refresh_failure_fails_open() {
    let clock = ManualClock::arc();
    let transport = MockQuotaTransport::returning(negative_response());
    let client = client(
        Arc::clone(&transport),
        Arc::clone(&clock),
        QuotaAggregationOptions::new(10, 500),
    );

    client.allocate_quota(quota_request(1)).await.unwrap();
    settle().await;

    let denied = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(!denied.is_positive());

    // The recovery probe hits a broken transport; the failure is
    // cached as an empty positive so callers are not pinned to the
    // stale denial.
    clock.advance(Duration::from_millis(600));
    transport.set_error("transport down");
    client.allocate_quota(quota_request(1)).await.unwrap();
    settle().await;

    let recovered = client.allocate_quota(quota_request(1)).await.unwrap();
    assert!(recovered.is_positive(), "fail open after transport error");
}

#[tokio::test]
async fn refresh_carries_aggregated_cost() {
    let clock = ManualClock::arc();
    let transport = MockQuotaTransport::returning(positive_response());
    let client = client(
        Arc::clone(&transport),
        Arc::clone(&clock),
        QuotaAggregationOptions::new(10, 500),
    );

    client.allocate_quota(quota_request(2)).await.unwrap();
    settle().await;
    for cost in [3, 4, 5] {
        client.allocate_quota(quota_request(cost)).await.unwrap();
    }

    clock.advance(Duration::from_millis(600));
    client.allocate_quota(quota_request(1)).await.unwrap();
    settle().await;

    assert_eq!(transport.calls(), 2);
    let refresh = &transport.requests()[1];
    let operation = refresh.allocate_operation.as_ref().unwrap();
    assert_eq!(operation.quota_mode(), QuotaMode::BestEffort);
    assert_eq!(
        operation.quota_metrics[0].metric_values[0].as_int64(),
        Some(12),
        "costs 3 + 4 + 5 aggregated into the refresh"
    );
}

#[tokio::test]
async fn disabled_cache_sends_every_request() {
    let transport = MockQuotaTransport::returning(positive_response());
    let client = client(
        Arc::clone(&transport),
        ManualClock::arc(),
        QuotaAggregationOptions::new(0, 500),
    );

    for _ in 0..10 {
        let response = client.allocate_quota(quota_request(1)).await.unwrap();
        assert!(response.is_positive());
    }

    assert_eq!(transport.calls(), 10);
    let stats = client.statistics();
    assert_eq!(stats.total_called_quotas, 10);
    assert_eq!(stats.send_quotas_in_flight, 10);
    assert_eq!(stats.send_quotas_by_flush, 0);
}

#[tokio::test]
async fn cached_sequence_counts_one_flush_send() {
    let transport = MockQuotaTransport::returning(positive_response());
    let client = client(
        Arc::clone(&transport),
        ManualClock::arc(),
        QuotaAggregationOptions::new(10, 500),
    );

    client.allocate_quota(quota_request(1)).await.unwrap();
    for _ in 0..10 {
        client.allocate_quota(quota_request(1)).await.unwrap();
    }
    settle().await;

    let stats = client.statistics();
    assert_eq!(stats.total_called_quotas, 11);
    assert_eq!(stats.send_quotas_by_flush, 1);
    assert_eq!(stats.send_quotas_in_flight, 0);
}

#[tokio::test]
async fn mismatched_service_name_is_rejected() {
    let transport = MockQuotaTransport::returning(positive_response());
    let client = client(
        Arc::clone(&transport),
        ManualClock::arc(),
        QuotaAggregationOptions::new(10, 500),
    );

    let mut request = quota_request(1);
    request.service_name = "unknown".into();
    let err = client.allocate_quota(request).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(transport.calls(), 0);

    let stats = client.statistics();
    assert_eq!(stats.total_called_quotas, 1);
    assert_eq!(stats.send_quotas_by_flush, 0);
    assert_eq!(stats.send_quotas_in_flight, 0);
}

#[tokio::test]
async fn missing_transport_is_rejected() {
    let client = ServiceControlClient::new(
        SERVICE,
        CONFIG_ID,
        ClientOptions {
            enable_flush_timer: false,
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let err = client.allocate_quota(quota_request(1)).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(client.statistics().total_called_quotas, 1);
}
