//! Transport seams to the remote control plane.
//!
//! The client performs no network I/O itself; each remote procedure
//! goes through one of these traits. Implementations are invoked at
//! most once per outbound request and may complete from any task.
//! The client never retries: a refresh failure fails open, a direct
//! failure propagates to the caller.

use async_trait::async_trait;

use crate::error::Error;
use crate::proto::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
    ReportResponse,
};

/// Performs the remote Check call.
#[async_trait]
pub trait CheckTransport: Send + Sync {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, Error>;
}

/// Performs the remote AllocateQuota call.
#[async_trait]
pub trait QuotaTransport: Send + Sync {
    async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, Error>;
}

/// Performs the remote Report call.
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, Error>;
}
