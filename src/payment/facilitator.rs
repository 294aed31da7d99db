//! HTTP client for the x402 payment facilitator.
//!
//! The facilitator validates a signed payment claim (`verify`) and later
//! executes it (`settle`). Response bodies are opaque to this server:
//! successful bodies are forwarded verbatim to the client and the
//! settlement log, and only the error envelope is interpreted.

use crate::mcp::types::canonical;
use crate::payment::PaymentRequirement;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

const FACILITATOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[error("facilitator {operation} failed ({status_code}): {code}")]
pub struct FacilitatorError {
    pub operation: &'static str,
    /// Upstream HTTP status; 0 when the request never completed.
    pub status_code: u16,
    pub code: String,
    pub retryable: bool,
}

impl FacilitatorError {
    fn unavailable(operation: &'static str) -> Self {
        Self {
            operation,
            status_code: 0,
            code: canonical::PAYMENT_FACILITATOR_UNAVAILABLE.to_string(),
            retryable: true,
        }
    }
}

pub struct FacilitatorClient {
    http: reqwest::Client,
    base: url::Url,
    token: Option<String>,
}

impl FacilitatorClient {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let mut base = url::Url::parse(base_url)?;
        // Ensure join() appends instead of replacing the last segment.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let http = reqwest::Client::builder()
            .timeout(FACILITATOR_TIMEOUT)
            .build()?;
        Ok(Self { http, base, token })
    }

    /// Validate the payment claim before the tool runs.
    pub async fn verify(
        &self,
        signature: &str,
        requirement: &PaymentRequirement,
    ) -> Result<String, FacilitatorError> {
        self.call("verify", signature, requirement).await
    }

    /// Execute settlement after a successful tool run.
    pub async fn settle(
        &self,
        signature: &str,
        requirement: &PaymentRequirement,
    ) -> Result<String, FacilitatorError> {
        self.call("settle", signature, requirement).await
    }

    async fn call(
        &self,
        operation: &'static str,
        signature: &str,
        requirement: &PaymentRequirement,
    ) -> Result<String, FacilitatorError> {
        let url = self
            .base
            .join(operation)
            .map_err(|_| FacilitatorError::unavailable(operation))?;
        let body = json!({
            "x402Version": 1,
            "paymentHeader": signature,
            "paymentRequirements": requirement,
        });

        let mut request = self.http.post(url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|_| FacilitatorError::unavailable(operation))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|_| FacilitatorError::unavailable(operation))?;

        if status.is_success() {
            // A 200 can still report an invalid claim; that flag is part
            // of the envelope, everything else stays opaque.
            if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                let valid = parsed
                    .get("isValid")
                    .or_else(|| parsed.get("success"))
                    .and_then(Value::as_bool);
                if valid == Some(false) {
                    return Err(envelope_error(operation, status, &parsed));
                }
            }
            return Ok(text);
        }

        let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        Err(envelope_error(operation, status, &parsed))
    }
}

fn envelope_error(
    operation: &'static str,
    status: StatusCode,
    body: &Value,
) -> FacilitatorError {
    let code = body
        .get("code")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default_code(operation, status).to_string());
    let retryable = body
        .get("retryable")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| status.is_server_error());
    FacilitatorError {
        operation,
        status_code: status.as_u16(),
        code,
        retryable,
    }
}

fn default_code(operation: &'static str, status: StatusCode) -> &'static str {
    if status.is_server_error() {
        canonical::PAYMENT_FACILITATOR_UNAVAILABLE
    } else if operation == "settle" {
        canonical::PAYMENT_SETTLEMENT_FAILED
    } else {
        canonical::PAYMENT_INVALID
    }
}
