//! End-to-end Report batching flows.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use service_control_client::aggregator::ReportAggregationOptions;
use service_control_client::proto::{
    MetricValue, MetricValueSet, Operation, ReportRequest, ReportResponse,
};
use service_control_client::testing::{ManualClock, MockReportTransport};
use service_control_client::{ClientOptions, Code, ServiceControlClient};

const SERVICE: &str = "library.googleapis.com";
const CONFIG_ID: &str = "2016-09-19r0";

fn operation(name: &str, cost: i64) -> Operation {
    Operation {
        operation_name: name.into(),
        consumer_id: "project:test".into(),
        metric_value_sets: vec![MetricValueSet {
            metric_name: "serviceruntime.googleapis.com/api/request_count".into(),
            metric_values: vec![MetricValue::int64(cost)],
        }],
        ..Operation::default()
    }
}

fn report_request(operations: Vec<Operation>) -> ReportRequest {
    ReportRequest {
        service_name: SERVICE.into(),
        operations,
        service_config_id: CONFIG_ID.into(),
    }
}

fn client(
    transport: Arc<MockReportTransport>,
    clock: Arc<ManualClock>,
    options: ReportAggregationOptions,
) -> ServiceControlClient {
    ServiceControlClient::new(
        SERVICE,
        CONFIG_ID,
        ClientOptions {
            report_options: options,
            report_transport: Some(transport),
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
async fn hundred_reports_flush_as_one_request() {
    let clock = ManualClock::arc();
    let transport = MockReportTransport::returning(ReportResponse::default());
    let client = client(
        Arc::clone(&transport),
        Arc::clone(&clock),
        ReportAggregationOptions::new(10, 500),
    );

    for _ in 0..100 {
        client
            .report(report_request(vec![operation("ListShelves", 1)]))
            .await
            .unwrap();
    }
    assert_eq!(transport.calls(), 0, "nothing sent while aggregating");

    clock.advance(Duration::from_millis(600));
    client.flush();
    settle().await;

    assert_eq!(transport.calls(), 1);
    let batch = &transport.requests()[0];
    assert_eq!(batch.operations.len(), 1);
    assert_eq!(
        batch.operations[0].metric_value_sets[0].metric_values[0].as_int64(),
        Some(100),
        "100 unit costs merged into one operation"
    );

    let stats = client.statistics();
    assert_eq!(stats.total_called_reports, 100);
    assert_eq!(stats.send_reports_by_flush, 1);
    assert_eq!(stats.send_reports_in_flight, 0);
    assert_eq!(stats.send_report_operations, 1);
}

#[tokio::test]
async fn distinct_operations_batch_into_one_request() {
    let clock = ManualClock::arc();
    let transport = MockReportTransport::returning(ReportResponse::default());
    let client = client(
        Arc::clone(&transport),
        Arc::clone(&clock),
        ReportAggregationOptions::new(10, 500),
    );

    client
        .report(report_request(vec![
            operation("ListShelves", 1),
            operation("GetShelf", 2),
        ]))
        .await
        .unwrap();

    clock.advance(Duration::from_millis(600));
    client.flush();
    settle().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.requests()[0].operations.len(), 2);
    assert_eq!(client.statistics().send_report_operations, 2);
}

#[tokio::test]
async fn disabled_batching_passes_through() {
    let transport = MockReportTransport::returning(ReportResponse::default());
    let client = client(
        Arc::clone(&transport),
        ManualClock::arc(),
        ReportAggregationOptions::new(0, 500),
    );

    for _ in 0..3 {
        client
            .report(report_request(vec![
                operation("ListShelves", 1),
                operation("GetShelf", 1),
            ]))
            .await
            .unwrap();
    }

    assert_eq!(transport.calls(), 3);
    let stats = client.statistics();
    assert_eq!(stats.total_called_reports, 3);
    assert_eq!(stats.send_reports_in_flight, 3);
    assert_eq!(stats.send_report_operations, 6);
    assert_eq!(stats.send_reports_by_flush, 0);
}

#[tokio::test]
async fn shutdown_drains_pending_batches() {
    let transport = MockReportTransport::returning(ReportResponse::default());
    let client = client(
        Arc::clone(&transport),
        ManualClock::arc(),
        ReportAggregationOptions::new(10, 500),
    );

    client
        .report(report_request(vec![operation("ListShelves", 1)]))
        .await
        .unwrap();
    client
        .report(report_request(vec![operation("GetShelf", 1)]))
        .await
        .unwrap();

    client.shutdown();
    settle().await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.requests()[0].operations.len(), 2);
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

    let err = client
        .report(report_request(vec![operation("ListShelves", 1)]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn flush_timer_drives_batches_out() {
    let transport = MockReportTransport::returning(ReportResponse::default());
    // Real clock and a short interval: the background timer must do
    // the flushing without any manual help.
    let client = ServiceControlClient::new(
        SERVICE,
        CONFIG_ID,
        ClientOptions {
            report_options: ReportAggregationOptions::new(10, 20),
            report_transport: Some(Arc::clone(&transport) as Arc<dyn service_control_client::transport::ReportTransport>),
            check_options: service_control_client::aggregator::CheckAggregationOptions::new(
                0, 500, 1_000,
            ),
            quota_options: service_control_client::aggregator::QuotaAggregationOptions::new(0, 500),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    client
        .report(report_request(vec![operation("ListShelves", 1)]))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while transport.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timer flush never fired");

    assert_eq!(transport.requests()[0].operations.len(), 1);
}
