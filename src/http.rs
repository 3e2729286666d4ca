//! HTTP transport speaking the Service Control REST surface.
//!
//! Posts protobuf-encoded bodies to the
//! `:check` / `:allocateQuota` / `:report` verbs of the v1 API with
//! bearer-token auth. Enabled with the `http` feature.

use async_trait::async_trait;
use prost::Message;

use crate::error::Error;
use crate::proto::{
    AllocateQuotaRequest, AllocateQuotaResponse, CheckRequest, CheckResponse, ReportRequest,
    ReportResponse,
};
use crate::transport::{CheckTransport, QuotaTransport, ReportTransport};

/// One HTTP transport serves all three verbs; register the same
/// instance for check, quota and report.
pub struct HttpTransport {
    endpoint: String,
    service_name: String,
    token: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// `endpoint` is the API root, e.g.
    /// `https://servicecontrol.googleapis.com`.
    pub fn new(
        endpoint: impl Into<String>,
        service_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            service_name: service_name.into(),
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<Req, Resp>(&self, verb: &str, request: &Req) -> Result<Resp, Error>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let url = format!(
            "{}/v1/services/{}:{verb}",
            self.endpoint, self.service_name
        );
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-protobuf")
            .bearer_auth(&self.token)
            .body(request.encode_to_vec())
            .send()
            .await
            .map_err(|error| Error::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{verb} returned {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|error| Error::Transport(error.to_string()))?;
        Resp::decode(body.as_ref())
            .map_err(|error| Error::Transport(format!("undecodable {verb} response: {error}")))
    }
}

#[async_trait]
impl CheckTransport for HttpTransport {
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, Error> {
        self.post("check", &request).await
    }
}

#[async_trait]
impl QuotaTransport for HttpTransport {
    async fn allocate_quota(
        &self,
        request: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse, Error> {
        self.post("allocateQuota", &request).await
    }
}

#[async_trait]
impl ReportTransport for HttpTransport {
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, Error> {
        self.post("report", &request).await
    }
}
