// dir2mcp - serve a directory of heterogeneous files to LLM agents over MCP
// Root library module

pub mod config;
pub mod observability;
pub mod path_safety;
pub mod payment;
pub mod rate_limit;
pub mod retriever;
pub mod session;

/// Model Context Protocol (MCP) server
pub mod mcp;

// Re-export key types
pub use config::{AuthMode, Config, X402Config, X402Mode};
pub use mcp::server::{McpServer, ShutdownHandle};
pub use mcp::tools::{ToolDefinition, ToolHandler, ToolRegistry};
pub use mcp::types::{canonical, ToolContent, ToolError, ToolResult};
pub use observability::{init_logging, init_logging_with_level, EventLog, EventLevel};
pub use path_safety::{contains_secret, PathError, PathPolicy};
pub use payment::{execution_key, PaymentGate, PaymentRequirement};
pub use rate_limit::{client_ip, RateLimiter, TrustedProxies};
pub use retriever::{
    AskOutcome, AudioClip, Citation, DocType, DocumentText, FileEntry, FileListing,
    IndexKind, IndexStats, MediaBackend, Retriever, RetrieverError, SearchHit,
};
pub use session::{SessionLookup, SessionRegistry};
