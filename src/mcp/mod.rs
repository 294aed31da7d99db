/// Model Context Protocol (MCP) server core.
///
/// JSON-RPC 2.0 over a single Streamable HTTP endpoint, with session
/// lifecycle, a schema-validated tool registry, and optional x402 payment
/// gating around `tools/call`.
pub mod http;
pub mod server;
pub mod tools;
pub mod types;
