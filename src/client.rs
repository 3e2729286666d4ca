//! Client façade binding aggregators to transports.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                  ServiceControlClient                      │
//! │  check() ──► CheckAggregator ──► hit? cached response      │
//! │                     │            miss? transport + cache   │
//! │  flush timer ──► flush() ──► evictions ──► flush callback  │
//! │                                   │                        │
//! │                                   └─► spawn(transport)     │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The flush callbacks only count, clone and spawn; transports are
//! awaited in detached tasks so no aggregator lock is ever held
//! across a remote call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::aggregator::{
    CheckAggregationOptions, CheckAggregator, QuotaAggregationOptions, QuotaAggregator,
    ReportAggregationOptions, ReportAggregator,
};
use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use crate::operation::MetricKinds;
use crate::proto::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
    ReportResponse,
};
use crate::transport::{CheckTransport, QuotaTransport, ReportTransport};

/// Everything injectable into a client: per-aggregator tuning, the
/// three transports, the metric kinds used by report merging, and
/// the tick source.
pub struct ClientOptions {
    pub check_options: CheckAggregationOptions,
    pub quota_options: QuotaAggregationOptions,
    pub report_options: ReportAggregationOptions,
    pub check_transport: Option<Arc<dyn CheckTransport>>,
    pub quota_transport: Option<Arc<dyn QuotaTransport>>,
    pub report_transport: Option<Arc<dyn ReportTransport>>,
    pub metric_kinds: MetricKinds,
    /// Drive [`ServiceControlClient::flush`] from a background task
    /// at the smallest interval any aggregator asks for. Disable to
    /// control flushing manually (tests do).
    pub enable_flush_timer: bool,
    /// Tick source; defaults to a monotonic clock.
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            check_options: CheckAggregationOptions::default(),
            quota_options: QuotaAggregationOptions::default(),
            report_options: ReportAggregationOptions::default(),
            check_transport: None,
            quota_transport: None,
            report_transport: None,
            metric_kinds: MetricKinds::new(),
            enable_flush_timer: true,
            clock: None,
        }
    }
}

/// Read-only snapshot of the client's call accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_called_checks: u64,
    pub send_checks_by_flush: u64,
    pub send_checks_in_flight: u64,
    pub total_called_quotas: u64,
    pub send_quotas_by_flush: u64,
    pub send_quotas_in_flight: u64,
    pub total_called_reports: u64,
    pub send_reports_by_flush: u64,
    pub send_reports_in_flight: u64,
    pub send_report_operations: u64,
}

#[derive(Default)]
struct Counters {
    total_called_checks: AtomicU64,
    send_checks_by_flush: AtomicU64,
    send_checks_in_flight: AtomicU64,
    total_called_quotas: AtomicU64,
    send_quotas_by_flush: AtomicU64,
    send_quotas_in_flight: AtomicU64,
    total_called_reports: AtomicU64,
    send_reports_by_flush: AtomicU64,
    send_reports_in_flight: AtomicU64,
    send_report_operations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Statistics {
        Statistics {
            total_called_checks: self.total_called_checks.load(Ordering::Relaxed),
            send_checks_by_flush: self.send_checks_by_flush.load(Ordering::Relaxed),
            send_checks_in_flight: self.send_checks_in_flight.load(Ordering::Relaxed),
            total_called_quotas: self.total_called_quotas.load(Ordering::Relaxed),
            send_quotas_by_flush: self.send_quotas_by_flush.load(Ordering::Relaxed),
            send_quotas_in_flight: self.send_quotas_in_flight.load(Ordering::Relaxed),
            total_called_reports: self.total_called_reports.load(Ordering::Relaxed),
            send_reports_by_flush: self.send_reports_by_flush.load(Ordering::Relaxed),
            send_reports_in_flight: self.send_reports_in_flight.load(Ordering::Relaxed),
            send_report_operations: self.send_report_operations.load(Ordering::Relaxed),
        }
    }
}

/// The smallest interval any aggregator asks for; `None` when every
/// cache is disabled.
fn min_flush_interval(intervals: [Option<Duration>; 3]) -> Option<Duration> {
    intervals.into_iter().flatten().min()
}

/// Client for one `(service_name, service_config_id)` pair.
///
/// Thread-safe: every method may be called concurrently from any
/// task. Must be constructed inside a Tokio runtime; flush traffic
/// is dispatched on the runtime the client was built on.
pub struct ServiceControlClient {
    check_aggregator: Arc<CheckAggregator>,
    quota_aggregator: Arc<QuotaAggregator>,
    report_aggregator: Arc<ReportAggregator>,
    check_transport: Option<Arc<dyn CheckTransport>>,
    quota_transport: Option<Arc<dyn QuotaTransport>>,
    report_transport: Option<Arc<dyn ReportTransport>>,
    counters: Arc<Counters>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceControlClient {
    pub fn new(
        service_name: impl Into<String>,
        service_config_id: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        options.check_options.validate()?;
        options.quota_options.validate()?;

        let service_name = service_name.into();
        let service_config_id = service_config_id.into();
        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let metric_kinds = Arc::new(options.metric_kinds);
        let counters = Arc::new(Counters::default());
        let handle = Handle::current();

        let check_aggregator = Arc::new(CheckAggregator::new(
            service_name.clone(),
            service_config_id.clone(),
            options.check_options,
            Arc::clone(&metric_kinds),
            Arc::clone(&clock),
        ));
        let quota_aggregator = Arc::new(QuotaAggregator::new(
            service_name.clone(),
            service_config_id.clone(),
            options.quota_options,
            Arc::clone(&clock),
        ));
        let report_aggregator = Arc::new(ReportAggregator::new(
            service_name,
            service_config_id,
            options.report_options,
            metric_kinds,
            clock,
        ));

        if let Some(transport) = options.check_transport.clone() {
            let counters = Arc::clone(&counters);
            let handle = handle.clone();
            check_aggregator.set_flush_callback(Some(Arc::new(move |request: CheckRequest| {
                counters.send_checks_by_flush.fetch_add(1, Ordering::Relaxed);
                let transport = Arc::clone(&transport);
                handle.spawn(async move {
                    // Refresh responses carry nothing the cache still
                    // wants; the entry repopulates on the next direct
                    // call.
                    if let Err(error) = transport.check(request).await {
                        tracing::error!(error = %error, "check refresh call failed");
                    }
                });
            })));
        }

        if let Some(transport) = options.quota_transport.clone() {
            let counters = Arc::clone(&counters);
            let handle = handle.clone();
            let aggregator: Weak<QuotaAggregator> = Arc::downgrade(&quota_aggregator);
            quota_aggregator.set_flush_callback(Some(Arc::new(
                move |request: AllocateQuotaRequest| {
                    counters.send_quotas_by_flush.fetch_add(1, Ordering::Relaxed);
                    let transport = Arc::clone(&transport);
                    let aggregator = aggregator.clone();
                    handle.spawn(async move {
                        let response = match transport.allocate_quota(request.clone()).await {
                            Ok(response) => response,
                            Err(error) => {
                                tracing::error!(
                                    error = %error,
                                    "allocate quota refresh failed, failing open"
                                );
                                AllocateQuotaResponse::default()
                            }
                        };
                        if let Some(aggregator) = aggregator.upgrade() {
                            aggregator.cache_response(&request, response);
                        }
                    });
                },
            )));
        }

        if let Some(transport) = options.report_transport.clone() {
            let counters = Arc::clone(&counters);
            let handle = handle.clone();
            report_aggregator.set_flush_callback(Some(Arc::new(move |request: ReportRequest| {
                counters.send_reports_by_flush.fetch_add(1, Ordering::Relaxed);
                counters
                    .send_report_operations
                    .fetch_add(request.operations.len() as u64, Ordering::Relaxed);
                let transport = Arc::clone(&transport);
                handle.spawn(async move {
                    if let Err(error) = transport.report(request).await {
                        tracing::error!(error = %error, "report flush call failed");
                    }
                });
            })));
        }

        let flush_task = if options.enable_flush_timer {
            min_flush_interval([
                check_aggregator.next_flush_interval(),
                quota_aggregator.next_flush_interval(),
                report_aggregator.next_flush_interval(),
            ])
            .map(|interval| {
                let check = Arc::clone(&check_aggregator);
                let quota = Arc::clone(&quota_aggregator);
                let report = Arc::clone(&report_aggregator);
                handle.spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        check.flush();
                        quota.flush();
                        report.flush();
                    }
                })
            })
        } else {
            None
        };

        Ok(Self {
            check_aggregator,
            quota_aggregator,
            report_aggregator,
            check_transport: options.check_transport,
            quota_transport: options.quota_transport,
            report_transport: options.report_transport,
            counters,
            flush_task: Mutex::new(flush_task),
        })
    }

    /// Pre-flight authorization. Served from cache when possible;
    /// otherwise goes to the transport and feeds the response back
    /// into the cache.
    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse, Error> {
        self.counters
            .total_called_checks
            .fetch_add(1, Ordering::Relaxed);
        let transport = self
            .check_transport
            .as_ref()
            .ok_or(Error::TransportNotConfigured)?
            .clone();

        if let Some(response) = self.check_aggregator.check(&request)? {
            return Ok(response);
        }

        self.counters
            .send_checks_in_flight
            .fetch_add(1, Ordering::Relaxed);
        match transport.check(request.clone()).await {
            Ok(response) => {
                self.check_aggregator
                    .cache_response(&request, response.clone());
                Ok(response)
            }
            Err(error) => {
                tracing::error!(error = %error, "check call failed");
                Err(error)
            }
        }
    }

    /// Token reservation. With caching enabled this never blocks on
    /// the network: misses are admitted optimistically while the one
    /// remote call runs in the background.
    pub async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, Error> {
        self.counters
            .total_called_quotas
            .fetch_add(1, Ordering::Relaxed);
        let transport = self
            .quota_transport
            .as_ref()
            .ok_or(Error::TransportNotConfigured)?
            .clone();

        if let Some(response) = self.quota_aggregator.allocate_quota(&request)? {
            return Ok(response);
        }

        self.counters
            .send_quotas_in_flight
            .fetch_add(1, Ordering::Relaxed);
        match transport.allocate_quota(request.clone()).await {
            Ok(response) => {
                self.quota_aggregator
                    .cache_response(&request, response.clone());
                Ok(response)
            }
            Err(error) => {
                // Fail open: cache a clean positive so the next call
                // is not stuck behind this failure.
                self.quota_aggregator
                    .cache_response(&request, AllocateQuotaResponse::default());
                tracing::error!(error = %error, "allocate quota call failed");
                Err(error)
            }
        }
    }

    /// Usage reporting. Batched locally; the transport sees one
    /// request per flush.
    pub async fn report(&self, request: ReportRequest) -> Result<ReportResponse, Error> {
        self.counters
            .total_called_reports
            .fetch_add(1, Ordering::Relaxed);
        let transport = self
            .report_transport
            .as_ref()
            .ok_or(Error::TransportNotConfigured)?
            .clone();

        if self.report_aggregator.report(&request)? {
            return Ok(ReportResponse::default());
        }

        self.counters
            .send_reports_in_flight
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .send_report_operations
            .fetch_add(request.operations.len() as u64, Ordering::Relaxed);
        transport.report(request).await
    }

    /// Drives one flush round on all three aggregators.
    pub fn flush(&self) {
        self.check_aggregator.flush();
        self.quota_aggregator.flush();
        self.report_aggregator.flush();
    }

    /// Graceful teardown: stop the flush timer, drain every cache
    /// (emitting unsent batches), then disconnect the flush
    /// callbacks so late completions go nowhere.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .flush_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        self.check_aggregator.flush_all();
        self.quota_aggregator.flush_all();
        self.report_aggregator.flush_all();
        self.check_aggregator.set_flush_callback(None);
        self.quota_aggregator.set_flush_callback(None);
        self.report_aggregator.set_flush_callback(None);
    }

    /// Snapshot of the call accounting.
    pub fn statistics(&self) -> Statistics {
        self.counters.snapshot()
    }
}

impl Drop for ServiceControlClient {
    fn drop(&mut self) {
        if let Some(task) = self
            .flush_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        self.check_aggregator.set_flush_callback(None);
        self.quota_aggregator.set_flush_callback(None);
        self.report_aggregator.set_flush_callback(None);
    }
}
