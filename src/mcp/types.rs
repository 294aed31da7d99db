//! MCP protocol types and the error taxonomy.
//!
//! Three tiers of failure leave this server. Transport errors are plain
//! HTTP. RPC errors are JSON-RPC failure envelopes whose `data` carries
//! `{code, retryable}` with a canonical string code. Tool errors travel as
//! *successful* JSON-RPC responses whose result has `isError:true` and a
//! `structuredContent.error` object, so that agents see them as tool
//! outcomes rather than protocol faults.

use crate::retriever::RetrieverError;
use jsonrpc_core::{Error as RpcError, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Canonical string codes carried in `data.code` and
/// `structuredContent.error.code`.
pub mod canonical {
    pub const MISSING_FIELD: &str = "MISSING_FIELD";
    pub const INVALID_FIELD: &str = "INVALID_FIELD";
    pub const INVALID_RANGE: &str = "INVALID_RANGE";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const INDEX_NOT_READY: &str = "INDEX_NOT_READY";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const PATH_OUTSIDE_ROOT: &str = "PATH_OUTSIDE_ROOT";
    pub const DOC_TYPE_UNSUPPORTED: &str = "DOC_TYPE_UNSUPPORTED";
    pub const STORE_CORRUPT: &str = "STORE_CORRUPT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const SESSION_REQUIRED: &str = "SESSION_REQUIRED";
    pub const SESSION_INVALID: &str = "SESSION_INVALID";
    pub const PAYMENT_REQUIRED: &str = "PAYMENT_REQUIRED";
    pub const PAYMENT_INVALID: &str = "PAYMENT_INVALID";
    pub const PAYMENT_SETTLEMENT_FAILED: &str = "PAYMENT_SETTLEMENT_FAILED";
    pub const PAYMENT_CONFIG_INVALID: &str = "PAYMENT_CONFIG_INVALID";
    pub const PAYMENT_FACILITATOR_UNAVAILABLE: &str = "PAYMENT_FACILITATOR_UNAVAILABLE";
}

/// A tool-level failure, surfaced to the client as an `isError` result.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ToolError {
    pub fn new(code: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn missing_field(message: impl Into<String>) -> Self {
        Self::new(canonical::MISSING_FIELD, message, false)
    }

    pub fn invalid_field(message: impl Into<String>) -> Self {
        Self::new(canonical::INVALID_FIELD, message, false)
    }

    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::new(canonical::INVALID_RANGE, message, false)
    }

    pub fn method_not_found(name: &str) -> Self {
        Self::new(
            canonical::METHOD_NOT_FOUND,
            format!("unknown tool '{name}'"),
            false,
        )
    }

    pub fn index_not_ready() -> Self {
        Self::new(
            canonical::INDEX_NOT_READY,
            "index is not ready; retry once indexing has progressed",
            true,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(canonical::INTERNAL_ERROR, message, true)
    }

    /// Map a backend error onto the canonical taxonomy. Raw backend
    /// messages stay in the event log; the client sees stable phrasing.
    pub fn from_retriever(err: &RetrieverError) -> Self {
        match err {
            RetrieverError::IndexNotReady | RetrieverError::NotConfigured => {
                Self::index_not_ready()
            }
            RetrieverError::Forbidden(_) => {
                Self::new(canonical::FORBIDDEN, "access to this file is forbidden", false)
            }
            RetrieverError::PathOutsideRoot(_) => Self::new(
                canonical::PATH_OUTSIDE_ROOT,
                "path resolves outside the served root",
                false,
            ),
            RetrieverError::DocTypeUnsupported(_) => Self::new(
                canonical::DOC_TYPE_UNSUPPORTED,
                "this document type does not support the requested operation",
                false,
            ),
            RetrieverError::NotFound(_) => {
                Self::new(canonical::NOT_FOUND, "file is not part of the corpus", false)
            }
            RetrieverError::StoreCorrupt(_) => {
                Self::new(canonical::STORE_CORRUPT, "retrieval store is corrupt", false)
            }
            RetrieverError::Other(_) => Self::internal("retrieval backend failed"),
        }
    }

    pub fn into_result(self) -> ToolResult {
        ToolResult::from_error(&self)
    }
}

/// One content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    /// Success result: pretty JSON as the text item, the raw value as
    /// structured content.
    pub fn success(structured: Value) -> Self {
        let text = serde_json::to_string_pretty(&structured)
            .unwrap_or_else(|_| structured.to_string());
        Self {
            content: vec![ToolContent::Text { text }],
            structured_content: Some(structured),
            is_error: false,
        }
    }

    /// Success result that also carries an audio content item.
    pub fn success_with_audio(structured: Value, data: String, mime_type: String) -> Self {
        let text = serde_json::to_string_pretty(&structured)
            .unwrap_or_else(|_| structured.to_string());
        Self {
            content: vec![
                ToolContent::Text { text },
                ToolContent::Audio { data, mime_type },
            ],
            structured_content: Some(structured),
            is_error: false,
        }
    }

    pub fn from_error(err: &ToolError) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: err.message.clone(),
            }],
            structured_content: Some(json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                    "retryable": err.retryable,
                }
            })),
            is_error: true,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"isError": true}))
    }
}

/// Build a JSON-RPC error whose data carries the canonical code.
pub fn rpc_error(
    code: ErrorCode,
    message: impl Into<String>,
    canonical_code: &str,
    retryable: bool,
) -> RpcError {
    RpcError {
        code,
        message: message.into(),
        data: Some(json!({"code": canonical_code, "retryable": retryable})),
    }
}

pub fn parse_error(message: impl Into<String>) -> RpcError {
    rpc_error(ErrorCode::ParseError, message, canonical::PARSE_ERROR, false)
}

pub fn invalid_request(message: impl Into<String>, canonical_code: &str) -> RpcError {
    rpc_error(ErrorCode::InvalidRequest, message, canonical_code, false)
}

pub fn unknown_method(method: &str) -> RpcError {
    rpc_error(
        ErrorCode::MethodNotFound,
        format!("unknown method '{method}'"),
        canonical::METHOD_NOT_FOUND,
        false,
    )
}

pub fn server_error(
    message: impl Into<String>,
    canonical_code: &str,
    retryable: bool,
) -> RpcError {
    rpc_error(
        ErrorCode::ServerError(-32000),
        message,
        canonical_code,
        retryable,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_serializes_with_structured_error() {
        let result = ToolError::invalid_range("k 99 outside [1,50]").into_result();
        let value = result.to_value();
        assert_eq!(value["isError"], true);
        assert_eq!(value["structuredContent"]["error"]["code"], "INVALID_RANGE");
        assert_eq!(value["structuredContent"]["error"]["retryable"], false);
        assert_eq!(value["content"][0]["type"], "text");
    }

    #[test]
    fn audio_content_uses_mime_type_key() {
        let result = ToolResult::success_with_audio(
            json!({"answer": "hi"}),
            "AAAA".to_string(),
            "audio/mpeg".to_string(),
        );
        let value = result.to_value();
        assert_eq!(value["content"][1]["type"], "audio");
        assert_eq!(value["content"][1]["mimeType"], "audio/mpeg");
        assert_eq!(value["isError"], false);
    }

    #[test]
    fn rpc_error_data_carries_canonical_code() {
        let err = server_error("rate limited", canonical::RATE_LIMITED, true);
        let data = err.data.expect("data");
        assert_eq!(data["code"], "RATE_LIMITED");
        assert_eq!(data["retryable"], true);
    }

    #[test]
    fn retriever_errors_map_to_canonical_codes() {
        let cases = [
            (RetrieverError::IndexNotReady, canonical::INDEX_NOT_READY, true),
            (
                RetrieverError::Forbidden("x".into()),
                canonical::FORBIDDEN,
                false,
            ),
            (
                RetrieverError::PathOutsideRoot("x".into()),
                canonical::PATH_OUTSIDE_ROOT,
                false,
            ),
            (
                RetrieverError::NotFound("x".into()),
                canonical::NOT_FOUND,
                false,
            ),
            (
                RetrieverError::DocTypeUnsupported("x".into()),
                canonical::DOC_TYPE_UNSUPPORTED,
                false,
            ),
            (
                RetrieverError::Other(anyhow::anyhow!("boom")),
                canonical::INTERNAL_ERROR,
                true,
            ),
        ];
        for (err, code, retryable) in cases {
            let mapped = ToolError::from_retriever(&err);
            assert_eq!(mapped.code, code);
            assert_eq!(mapped.retryable, retryable);
        }
    }
}
