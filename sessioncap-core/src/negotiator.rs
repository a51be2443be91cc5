//! Session negotiation with the ingest service.
//!
//! A negotiation runs in three steps:
//! 1. [`Negotiator::prepare`] advances the page counter, consumes the reset
//!    flag and builds both the worker init message and the start request.
//! 2. [`Negotiator::request_start`] performs `POST {ingest}/v1/web/start`
//!    and classifies the outcome.
//! 3. [`Negotiator::persist`] stores the negotiated identity.
//!
//! The steps are split so the orchestrator can post the init message to
//! the worker before the network round trip, and so no lock is held across
//! the request.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;

use crate::error::{Error, Result, CANCELED};
use crate::host::DeviceHints;
use crate::storage::PersistedState;
use crate::transport::InitParams;

/// Request body for POST /v1/web/start
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub project_key: String,
    #[serde(rename = "revID")]
    pub rev_id: String,
    pub timestamp: i64,
    pub tracker_version: String,
    #[serde(rename = "userID")]
    pub user_id: Option<String>,
    #[serde(rename = "userUUID")]
    pub user_uuid: Option<String>,
    pub is_snippet: bool,
    pub token: Option<String>,
    pub device_memory: Option<f64>,
    pub js_heap_size_limit: Option<u64>,
    pub reset: bool,
}

/// Validated 200 response from POST /v1/web/start
#[derive(Debug, Clone, PartialEq)]
pub struct StartResponse {
    pub token: String,
    pub user_uuid: String,
    pub session_id: Option<String>,
    pub beacon_size_limit: Option<u64>,
}

/// Everything a negotiation needs from the orchestrator.
#[derive(Debug, Clone)]
pub struct StartContext<'a> {
    pub project_key: &'a str,
    pub rev_id: &'a str,
    pub tracker_version: &'a str,
    pub user_id: Option<&'a str>,
    pub is_snippet: bool,
    pub timestamp: i64,
    pub force_new: bool,
    pub hints: DeviceHints,
    pub conn_attempt_count: u32,
    pub conn_attempt_gap: Duration,
}

/// A prepared negotiation: the worker init message and the request to send.
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub init: InitParams,
    pub request: StartRequest,
}

/// HTTP client for the session start endpoint
pub struct Negotiator {
    http_client: reqwest::Client,
    ingest_point: String,
}

impl Negotiator {
    /// Create a negotiator for `ingest_point`
    pub fn new(ingest_point: &str, timeout: Duration) -> Result<Self> {
        let ingest_point = ingest_point.trim_end_matches('/').to_string();
        reqwest::Url::parse(&ingest_point)
            .map_err(|e| Error::Config(format!("invalid ingest point {}: {}", ingest_point, e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            ingest_point,
        })
    }

    pub fn start_url(&self) -> String {
        format!("{}/v1/web/start", self.ingest_point)
    }

    /// Advance persisted state and build the messages for one negotiation.
    ///
    /// The page counter is written before anything goes on the wire, so an
    /// interrupted negotiation still counts as a page visit.
    pub fn prepare(&self, persisted: &PersistedState, ctx: &StartContext<'_>) -> Result<Negotiation> {
        let page_no = persisted.next_page_no()?;
        let reset_flag = persisted.take_reset_flag()?;

        let init = InitParams {
            ingest_point: self.ingest_point.clone(),
            page_no,
            start_timestamp: ctx.timestamp,
            conn_attempt_count: ctx.conn_attempt_count,
            conn_attempt_gap: ctx.conn_attempt_gap,
        };

        let request = StartRequest {
            project_key: ctx.project_key.to_string(),
            rev_id: ctx.rev_id.to_string(),
            timestamp: ctx.timestamp,
            tracker_version: ctx.tracker_version.to_string(),
            user_id: ctx.user_id.map(str::to_string),
            user_uuid: persisted.user_uuid()?,
            is_snippet: ctx.is_snippet,
            token: persisted.token()?,
            device_memory: ctx.hints.device_memory,
            js_heap_size_limit: ctx.hints.js_heap_size_limit,
            reset: ctx.force_new || reset_flag,
        };

        tracing::debug!(page_no, reset = request.reset, "Prepared session negotiation");
        Ok(Negotiation { init, request })
    }

    /// Send the start request and classify the response.
    pub async fn request_start(&self, request: &StartRequest) -> Result<StartResponse> {
        let response = self
            .http_client
            .post(self.start_url())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status != StatusCode::OK {
            return Err(classify_rejection(status.as_u16(), body));
        }

        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|_| Error::IncorrectResponse(body.clone()))?;
        parse_start_response(&value)
    }

    /// Store the negotiated token (session scope) and user UUID (durable).
    pub fn persist(persisted: &PersistedState, response: &StartResponse) -> Result<()> {
        persisted.set_token(&response.token)?;
        persisted.set_user_uuid(&response.user_uuid)?;
        Ok(())
    }
}

fn classify_rejection(status: u16, body: String) -> Error {
    if body == CANCELED {
        Error::Canceled
    } else {
        Error::Server { status, body }
    }
}

/// Structural validation of a 200 body.
pub fn parse_start_response(value: &serde_json::Value) -> Result<StartResponse> {
    let incorrect = || Error::IncorrectResponse(value.to_string());

    let token = value.get("token").and_then(|v| v.as_str()).ok_or_else(incorrect)?;
    let user_uuid = value
        .get("userUUID")
        .and_then(|v| v.as_str())
        .ok_or_else(incorrect)?;

    let beacon_size_limit = match value.get("beaconSizeLimit") {
        None => None,
        Some(v) => {
            let n = v.as_f64().ok_or_else(incorrect)?;
            Some(n.max(0.0) as u64)
        }
    };

    let session_id = value
        .get("sessionID")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(StartResponse {
        token: token.to_string(),
        user_uuid: user_uuid.to_string(),
        session_id,
        beacon_size_limit,
    })
}
