//! HTTP clients for the gateway-hosted receipts and spreadsheets services.
//!
//! Blocking `reqwest` clients: workers run on plain threads and call
//! capabilities synchronously. Never construct or drop one of these from
//! inside an async runtime.

use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use courier_core::{CapabilityError, CapabilityResult, ReceiptIssuer, SheetAppender, TicketId};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid gateway address {0:?}")]
    InvalidAddress(String),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Shared connection settings for the gateway services.
#[derive(Debug, Clone)]
pub struct Gateway {
    base: Url,
    http: Client,
}

impl Gateway {
    /// `addr` may omit the scheme (`localhost:8888` means `http://localhost:8888`).
    pub fn new(addr: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let addr = addr.trim().trim_end_matches('/');
        let with_scheme = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let base = Url::parse(&with_scheme)
            .ok()
            .filter(|u| !u.cannot_be_a_base() && u.has_host())
            .ok_or_else(|| GatewayError::InvalidAddress(addr.to_string()))?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url, CapabilityError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CapabilityError::Rejected(format!("gateway address {} has no path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn check(result: Result<Response, reqwest::Error>) -> CapabilityResult {
    let response = result.map_err(|e| CapabilityError::Transport(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(CapabilityError::Status(status.as_u16()))
    }
}

#[derive(Serialize)]
struct IssueReceiptRequest<'a> {
    ticket_id: &'a str,
}

/// `PUT /receipts-api/receipts`.
#[derive(Debug, Clone)]
pub struct ReceiptsClient {
    gateway: Gateway,
}

impl ReceiptsClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

impl ReceiptIssuer for ReceiptsClient {
    #[instrument(skip_all, fields(ticket_id = %ticket_id), err)]
    fn issue_receipt(&self, ticket_id: &TicketId) -> CapabilityResult {
        let url = self.gateway.url(&["receipts-api", "receipts"])?;
        check(
            self.gateway
                .http
                .put(url)
                .json(&IssueReceiptRequest {
                    ticket_id: ticket_id.as_str(),
                })
                .send(),
        )
    }
}

#[derive(Serialize)]
struct AppendRowRequest<'a> {
    columns: &'a [String],
}

/// `POST /spreadsheets-api/sheets/{sheet}/rows`.
#[derive(Debug, Clone)]
pub struct SpreadsheetsClient {
    gateway: Gateway,
}

impl SpreadsheetsClient {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }
}

impl SheetAppender for SpreadsheetsClient {
    #[instrument(skip_all, fields(sheet = %sheet), err)]
    fn append_row(&self, sheet: &str, row: &[String]) -> CapabilityResult {
        let url = self
            .gateway
            .url(&["spreadsheets-api", "sheets", sheet, "rows"])?;
        check(
            self.gateway
                .http
                .post(url)
                .json(&AppendRowRequest { columns: row })
                .send(),
        )
    }
}
