//! x402 payment gating for `tools/call`.
//!
//! When enabled, every `tools/call` request must present a signed payment
//! claim in `X-PAYMENT`. The gate runs verify → execute → settle against
//! the facilitator with at-most-once execution per `(signature, params)`
//! pair: duplicates serialize on a per-key mutex and replay the cached
//! outcome byte-for-byte, including the `X-PAYMENT-RESPONSE` header.

pub mod facilitator;
pub mod keyed_lock;
pub mod outcome_cache;
pub mod settlement_log;

use crate::config::{X402Config, X402Mode};
use crate::mcp::types::{canonical, server_error};
use crate::observability::EventLog;
use base64::Engine;
use facilitator::{FacilitatorClient, FacilitatorError};
use jsonrpc_core::types::response::{Failure, Output, Success};
use jsonrpc_core::{Error as RpcError, Id, Version};
use keyed_lock::KeyedLocks;
use once_cell::sync::Lazy;
use outcome_cache::{ExecutionOutcome, OutcomeCache};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settlement_log::SettlementLog;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Immutable payment requirement tuple, also the 402 challenge payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    /// CAIP-2 network identifier.
    pub network: String,
    pub amount_atomic: String,
    pub max_amount_required: String,
    pub asset: String,
    pub pay_to: String,
    pub resource_url: String,
}

static CAIP2_NETWORK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]{3,8}:[-_a-zA-Z0-9]{1,32}$").expect("static regex"));

impl PaymentRequirement {
    /// Strict validation of the configured tuple. All problems are
    /// reported at once so a misconfiguration is fixable in one pass.
    pub fn from_config(x402: &X402Config, mcp_path: &str) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();

        if x402.scheme.trim().is_empty() {
            problems.push("scheme is empty".to_string());
        }
        if !CAIP2_NETWORK.is_match(&x402.network) {
            problems.push(format!("network '{}' is not CAIP-2", x402.network));
        }
        check_atomic_amount("price_atomic", &x402.price_atomic, &mut problems);
        check_atomic_amount(
            "max_amount_required",
            &x402.max_amount_required,
            &mut problems,
        );
        if let (Ok(price), Ok(max)) = (
            x402.price_atomic.parse::<u128>(),
            x402.max_amount_required.parse::<u128>(),
        ) {
            if max < price {
                problems.push("max_amount_required is below price_atomic".to_string());
            }
        }
        if x402.asset.trim().is_empty() {
            problems.push("asset is empty".to_string());
        }
        if x402.pay_to.trim().is_empty() {
            problems.push("pay_to is empty".to_string());
        }
        let resource_url = match url::Url::parse(&x402.resource_base_url) {
            Ok(base) if matches!(base.scheme(), "http" | "https") => {
                format!("{}{}", x402.resource_base_url.trim_end_matches('/'), mcp_path)
            }
            _ => {
                problems.push(format!(
                    "resource_base_url '{}' is not an http(s) URL",
                    x402.resource_base_url
                ));
                String::new()
            }
        };

        if problems.is_empty() {
            Ok(Self {
                scheme: x402.scheme.clone(),
                network: x402.network.clone(),
                amount_atomic: x402.price_atomic.clone(),
                max_amount_required: x402.max_amount_required.clone(),
                asset: x402.asset.clone(),
                pay_to: x402.pay_to.clone(),
                resource_url,
            })
        } else {
            Err(problems)
        }
    }
}

fn check_atomic_amount(field: &str, value: &str, problems: &mut Vec<String>) {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        problems.push(format!("{field} '{value}' is not a decimal amount"));
    } else if value.bytes().all(|b| b == b'0') {
        problems.push(format!("{field} is zero"));
    } else if value.len() > 38 {
        problems.push(format!("{field} exceeds 38 digits"));
    }
}

/// Deterministic idempotency key for a paid invocation.
pub fn execution_key(params_bytes: &[u8], signature: &str) -> String {
    format!("{}:{signature}", hex::encode(Sha256::digest(params_bytes)))
}

/// Short digest safe to log; never the signature itself.
pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))[..16].to_string()
}

/// What the transport should send back for a gated `tools/call`.
pub struct GateReply {
    pub status_code: u16,
    pub output: Output,
    /// Value for `X-PAYMENT-RESPONSE` when settlement succeeded.
    pub payment_response: Option<String>,
    /// Attach the 402 challenge header.
    pub challenge: bool,
}

pub struct PaymentGate {
    requirement: PaymentRequirement,
    challenge_b64: String,
    facilitator: FacilitatorClient,
    cache: OutcomeCache,
    locks: Arc<KeyedLocks>,
    settlement: SettlementLog,
    events: Arc<EventLog>,
}

impl PaymentGate {
    /// Construct the gate from configuration.
    ///
    /// `off` (or `tools_call_enabled:false`) yields `None`. An invalid
    /// requirement tuple yields `None` in `on` mode (fail-open to unpaid
    /// service, with a warning event) and an error in `required` mode.
    pub fn build(
        x402: &X402Config,
        mcp_path: &str,
        state_dir: &Path,
        events: Arc<EventLog>,
    ) -> anyhow::Result<Option<Arc<PaymentGate>>> {
        if x402.mode == X402Mode::Off || !x402.tools_call_enabled {
            return Ok(None);
        }

        let requirement = match PaymentRequirement::from_config(x402, mcp_path) {
            Ok(requirement) => requirement,
            Err(problems) => match x402.mode {
                X402Mode::Required => {
                    anyhow::bail!(
                        "x402 requirement invalid ({}): {}",
                        canonical::PAYMENT_CONFIG_INVALID,
                        problems.join("; ")
                    );
                }
                _ => {
                    events.warning(
                        "payment_gate_disabled",
                        json!({"reasons": problems}),
                    );
                    return Ok(None);
                }
            },
        };

        let challenge_b64 = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&requirement)?);
        let facilitator =
            FacilitatorClient::new(&x402.facilitator_url, x402.facilitator_token.clone())?;

        Ok(Some(Arc::new(PaymentGate {
            requirement,
            challenge_b64,
            facilitator,
            cache: OutcomeCache::new(outcome_cache::DEFAULT_TTL, outcome_cache::DEFAULT_CAPACITY),
            locks: KeyedLocks::new(),
            settlement: SettlementLog::new(state_dir),
            events,
        })))
    }

    pub fn challenge_header(&self) -> String {
        format!("Payment {}", self.challenge_b64)
    }

    pub fn requirement(&self) -> &PaymentRequirement {
        &self.requirement
    }

    /// Prune expired outcomes; called by the background sweeper. The cache
    /// also prunes itself on every access.
    pub fn prune_cache(&self) {
        let _ = self.cache.len();
    }

    /// Flush the settlement log; called during shutdown.
    pub fn close(&self) {
        if let Err(err) = self.settlement.flush() {
            self.events
                .warning("settlement_log_flush_failed", json!({"error": err.to_string()}));
        }
    }

    /// Run the full payment pipeline around one `tools/call` execution.
    pub async fn handle_tools_call<F, Fut>(
        &self,
        id: Id,
        signature: Option<&str>,
        params_bytes: &[u8],
        exec: F,
    ) -> GateReply
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, (u16, RpcError)>>,
    {
        let signature = match signature {
            Some(sig) if !sig.trim().is_empty() => sig.trim(),
            _ => {
                self.events.info("payment_challenge", json!({}));
                return self.challenge_reply(
                    id,
                    canonical::PAYMENT_REQUIRED,
                    "payment required: sign the challenge and retry with X-PAYMENT",
                );
            }
        };

        let key = execution_key(params_bytes, signature);
        let digest = key_digest(&key);
        let _guard = self.locks.acquire(&key).await;

        // Idempotent replay path.
        if let Some(outcome) = self.cache.get(&key) {
            if outcome.settled || !outcome.requires_settle {
                self.events
                    .info("payment_replay", json!({"key_digest": digest}));
                return self.reply_from_outcome(id, &outcome);
            }
            // Executed but unsettled: finish settlement, never re-execute.
            return match self.settle(signature, &key, &digest).await {
                Ok(outcome) => self.reply_from_outcome(id, &outcome),
                Err(err) => self.failure_reply(id, &err),
            };
        }

        match self.facilitator.verify(signature, &self.requirement).await {
            Ok(response) => {
                self.events.info(
                    "payment_verified",
                    json!({"key_digest": digest, "response": opaque(&response)}),
                );
                self.settlement_entry("verify_succeeded", json!({"key_digest": digest}));
            }
            Err(err) => {
                self.events.warning(
                    "payment_verify_failed",
                    json!({
                        "key_digest": digest,
                        "status_code": err.status_code,
                        "code": err.code,
                    }),
                );
                return self.failure_reply(id, &err);
            }
        }

        let outcome = match exec().await {
            Ok(result) => ExecutionOutcome::from_result(200, result),
            Err((status, error)) => ExecutionOutcome::from_rpc_error(status, error),
        };
        // Compare-and-swap: a concurrent writer's outcome wins, ours is
        // discarded, so replays stay byte-stable.
        let outcome = self.cache.insert_if_absent(&key, outcome);
        self.events.info(
            "payment_executed",
            json!({"key_digest": digest, "requires_settle": outcome.requires_settle}),
        );
        self.settlement_entry(
            "execute",
            json!({"key_digest": digest, "requires_settle": outcome.requires_settle}),
        );

        if !outcome.requires_settle {
            return self.reply_from_outcome(id, &outcome);
        }

        match self.settle(signature, &key, &digest).await {
            Ok(outcome) => self.reply_from_outcome(id, &outcome),
            Err(err) => {
                // The tool already ran; a later retry replays the cached
                // outcome once settlement goes through.
                if let Some(cached) = self.cache.get(&key) {
                    if cached.settled || !cached.requires_settle {
                        return self.reply_from_outcome(id, &cached);
                    }
                }
                self.failure_reply(id, &err)
            }
        }
    }

    async fn settle(
        &self,
        signature: &str,
        key: &str,
        digest: &str,
    ) -> Result<ExecutionOutcome, FacilitatorError> {
        match self.facilitator.settle(signature, &self.requirement).await {
            Ok(response) => {
                self.events.info(
                    "payment_settled",
                    json!({"key_digest": digest, "response": opaque(&response)}),
                );
                self.settlement_entry(
                    "settle_succeeded",
                    json!({"key_digest": digest, "response": opaque(&response)}),
                );
                self.cache
                    .mark_settled(key, response)
                    .ok_or_else(|| FacilitatorError {
                        operation: "settle",
                        status_code: 0,
                        code: canonical::PAYMENT_SETTLEMENT_FAILED.to_string(),
                        retryable: true,
                    })
            }
            Err(err) => {
                self.events.warning(
                    "payment_settle_failed",
                    json!({
                        "key_digest": digest,
                        "status_code": err.status_code,
                        "code": err.code,
                    }),
                );
                self.settlement_entry(
                    "settle_failed",
                    json!({"key_digest": digest, "code": err.code}),
                );
                Err(err)
            }
        }
    }

    fn reply_from_outcome(&self, id: Id, outcome: &ExecutionOutcome) -> GateReply {
        let output = match (&outcome.result, &outcome.rpc_error) {
            (Some(result), _) => Output::Success(Success {
                jsonrpc: Some(Version::V2),
                result: result.clone(),
                id,
            }),
            (None, Some(error)) => Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                error: error.clone(),
                id,
            }),
            (None, None) => Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                error: server_error(
                    "payment outcome lost",
                    canonical::INTERNAL_ERROR,
                    true,
                ),
                id,
            }),
        };
        GateReply {
            status_code: outcome.status_code,
            output,
            payment_response: outcome.payment_response.clone(),
            challenge: false,
        }
    }

    fn challenge_reply(&self, id: Id, code: &str, message: &str) -> GateReply {
        GateReply {
            status_code: 402,
            output: Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                error: server_error(message, code, true),
                id,
            }),
            payment_response: None,
            challenge: true,
        }
    }

    /// Route a facilitator failure to the right HTTP shape.
    fn failure_reply(&self, id: Id, err: &FacilitatorError) -> GateReply {
        match err.code.as_str() {
            canonical::PAYMENT_REQUIRED
            | canonical::PAYMENT_INVALID
            | canonical::PAYMENT_SETTLEMENT_FAILED => self.challenge_reply(
                id,
                &err.code,
                &format!("payment {} failed", err.operation),
            ),
            canonical::PAYMENT_CONFIG_INVALID => GateReply {
                status_code: 503,
                output: Output::Failure(Failure {
                    jsonrpc: Some(Version::V2),
                    error: server_error(
                        "payment gate misconfigured",
                        canonical::PAYMENT_CONFIG_INVALID,
                        false,
                    ),
                    id,
                }),
                payment_response: None,
                challenge: false,
            },
            _ if (400..500).contains(&err.status_code) && !err.retryable => self
                .challenge_reply(
                    id,
                    canonical::PAYMENT_INVALID,
                    &format!("payment {} rejected", err.operation),
                ),
            _ => GateReply {
                status_code: 503,
                output: Output::Failure(Failure {
                    jsonrpc: Some(Version::V2),
                    error: server_error(
                        "payment facilitator unavailable",
                        canonical::PAYMENT_FACILITATOR_UNAVAILABLE,
                        true,
                    ),
                    id,
                }),
                payment_response: None,
                challenge: false,
            },
        }
    }

    fn settlement_entry(&self, event: &str, data: Value) {
        if let Err(err) = self.settlement.append(event, data) {
            self.events.warning(
                "settlement_log_write_failed",
                json!({"error": err.to_string()}),
            );
        }
    }
}

/// Embed a facilitator body as JSON when it parses, raw text otherwise.
fn opaque(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}
