//! Client-side aggregation and caching for a Service Control style
//! control plane.
//!
//! The control plane offers three remote procedures: **Check**
//! (pre-flight authorization), **AllocateQuota** (token reservation)
//! and **Report** (after-the-fact usage). Calling all three
//! synchronously for every API request would triple tail latency and
//! hammer the control plane, so this crate collapses that traffic:
//! responses are cached by request fingerprint, same-fingerprint
//! operations merge locally, concurrent identical requests coalesce
//! into a single outbound call, and a periodic flush turns the
//! merged backlog into refresh traffic.
//!
//! The crate performs no network I/O itself. Callers supply the
//! transports (see [`transport`]; an optional reqwest-based one is
//! behind the `http` feature), and on failure the client fails open
//! so production traffic keeps flowing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use service_control_client::{ClientOptions, ServiceControlClient};
//! use service_control_client::proto::{CheckRequest, Operation};
//! # use service_control_client::transport::CheckTransport;
//!
//! # async fn run(transport: Arc<dyn CheckTransport>) -> Result<(), service_control_client::Error> {
//! let options = ClientOptions {
//!     check_transport: Some(transport),
//!     ..ClientOptions::default()
//! };
//! let client = ServiceControlClient::new("library.googleapis.com", "2016-09-19r0", options)?;
//!
//! let request = CheckRequest {
//!     service_name: "library.googleapis.com".into(),
//!     operation: Some(Operation::default()),
//!     ..CheckRequest::default()
//! };
//! let response = client.check(request).await?;
//! assert!(response.is_positive());
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
mod cache;
mod client;
pub mod clock;
pub mod distribution;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod money;
pub mod operation;
pub mod proto;
pub mod signature;
pub mod testing;
pub mod transport;

pub use client::{ClientOptions, ServiceControlClient, Statistics};
pub use error::{Code, Error};
