//! Test doubles: scripted transports and a manual clock.
//!
//! Used by this crate's own tests and available to downstream crates
//! that want to exercise the client without a control plane.
//!
//! A mock transport completes in place by default. Calling
//! [`hold`](MockCheckTransport::hold) switches it to the stored
//! style: calls are recorded, then parked on a [`Notify`] gate until
//! [`release`](MockCheckTransport::release), so a test can assert
//! what coalesced while the remote call is genuinely outstanding.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::error::Error;
use crate::proto::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
    ReportResponse,
};
use crate::transport::{CheckTransport, QuotaTransport, ReportTransport};

/// Clock advanced by hand; starts at zero.
#[derive(Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Shared scripting state of one mock transport.
struct Script<Req, Resp> {
    requests: Mutex<Vec<Req>>,
    /// One-shot responses consumed before the template.
    queue: Mutex<VecDeque<Result<Resp, Error>>>,
    template: Mutex<Result<Resp, Error>>,
    /// When present, completions park here until released.
    gate: Mutex<Option<Arc<Notify>>>,
}

impl<Req: Clone, Resp: Clone> Script<Req, Resp> {
    fn returning(template: Resp) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            template: Mutex::new(Ok(template)),
            gate: Mutex::new(None),
        }
    }

    /// Records the call, then completes: immediately when no gate is
    /// held, otherwise once the gate is released.
    async fn record(&self, request: &Req) -> Result<Resp, Error> {
        self.requests.lock().unwrap().push(request.clone());
        self.wait_if_held().await;
        if let Some(scripted) = self.queue.lock().unwrap().pop_front() {
            return scripted;
        }
        self.template.lock().unwrap().clone()
    }

    async fn wait_if_held(&self) {
        loop {
            let Some(notify) = self.gate.lock().unwrap().clone() else {
                return;
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // The gate may have been released between the clone and
            // the registration above.
            if self.gate.lock().unwrap().is_none() {
                return;
            }
            notified.await;
        }
    }

    fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Notify::new()));
    }

    fn release(&self) {
        if let Some(notify) = self.gate.lock().unwrap().take() {
            notify.notify_waiters();
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<Req> {
        self.requests.lock().unwrap().clone()
    }

    fn set_template(&self, template: Result<Resp, Error>) {
        *self.template.lock().unwrap() = template;
    }

    fn push(&self, scripted: Result<Resp, Error>) {
        self.queue.lock().unwrap().push_back(scripted);
    }
}

macro_rules! mock_transport {
    ($name:ident, $request:ty, $response:ty) => {
        pub struct $name {
            script: Script<$request, $response>,
        }

        impl $name {
            /// A mock answering every call with `response`.
            pub fn returning(response: $response) -> Arc<Self> {
                Arc::new(Self {
                    script: Script::returning(response),
                })
            }

            /// A mock failing every call with a transport error.
            pub fn failing(message: &str) -> Arc<Self> {
                let mock = Self::returning(<$response>::default());
                mock.set_error(message);
                mock
            }

            /// Replace the standing response.
            pub fn set_response(&self, response: $response) {
                self.script.set_template(Ok(response));
            }

            /// Replace the standing response with a transport error.
            pub fn set_error(&self, message: &str) {
                self.script
                    .set_template(Err(Error::Transport(message.to_string())));
            }

            /// Queue a one-shot response served before the standing
            /// one.
            pub fn push_response(&self, response: Result<$response, Error>) {
                self.script.push(response);
            }

            /// Park every call after it is recorded, keeping it
            /// outstanding until [`release`](Self::release). Calls
            /// complete in place when no hold is active.
            pub fn hold(&self) {
                self.script.hold();
            }

            /// Complete every call parked by [`hold`](Self::hold).
            pub fn release(&self) {
                self.script.release();
            }

            /// Number of calls observed.
            pub fn calls(&self) -> usize {
                self.script.calls()
            }

            /// Every request observed, in order.
            pub fn requests(&self) -> Vec<$request> {
                self.script.requests()
            }
        }
    };
}

mock_transport!(MockCheckTransport, CheckRequest, CheckResponse);
mock_transport!(MockQuotaTransport, AllocateQuotaRequest, AllocateQuotaResponse);
mock_transport!(MockReportTransport, ReportRequest, ReportResponse);

#[async_trait]
impl CheckTransport for MockCheckTransport {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, Error> {
        self.script.record(&request).await
    }
}

#[async_trait]
impl QuotaTransport for MockQuotaTransport {
    async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, Error> {
        self.script.record(&request).await
    }
}

#[async_trait]
impl ReportTransport for MockReportTransport {
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, Error> {
        self.script.record(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_requests_and_serves_queue_first() {
        let mock = MockCheckTransport::returning(CheckResponse::default());
        mock.push_response(Err(Error::Transport("scripted failure".into())));

        let request = CheckRequest {
            service_name: "svc".into(),
            ..CheckRequest::default()
        };
        assert!(mock.check(request.clone()).await.is_err());
        assert!(mock.check(request.clone()).await.is_ok());
        assert_eq!(mock.calls(), 2);
        assert_eq!(mock.requests()[0].service_name, "svc");
    }

    #[tokio::test]
    async fn held_calls_complete_only_after_release() {
        let mock = MockCheckTransport::returning(CheckResponse::default());
        mock.hold();

        let worker = tokio::spawn({
            let mock = Arc::clone(&mock);
            async move { mock.check(CheckRequest::default()).await }
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        // The call is recorded and outstanding, not completed.
        assert_eq!(mock.calls(), 1);
        assert!(!worker.is_finished());

        mock.release();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn release_without_hold_is_a_no_op() {
        let mock = MockCheckTransport::returning(CheckResponse::default());
        mock.release();
        mock.check(CheckRequest::default()).await.unwrap();
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::arc();
        assert_eq!(clock.now(), 0);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), 250_000_000);
    }
}
