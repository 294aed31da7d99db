//! Process wrapper for the dir2mcp server.
//!
//! The core is configured through [`dir2mcp::Config`]; this binary only
//! applies a few address-level overrides and maps failures to exit codes:
//! 0 ok, 1 startup error, 2 invalid arguments (clap).

use clap::Parser;
use dir2mcp::{init_logging_with_level, Config, McpServer};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "dir2mcp", version, about = "Serve a directory to LLM agents over MCP")]
struct Args {
    /// Directory to serve.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8948", env = "DIR2MCP_LISTEN")]
    listen: String,

    /// HTTP path of the MCP endpoint.
    #[arg(long, default_value = "/mcp")]
    path: String,

    /// Directory for server-owned state.
    #[arg(long, default_value = ".dir2mcp", env = "DIR2MCP_STATE_DIR")]
    state_dir: PathBuf,

    #[arg(long, short)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if init_logging_with_level(args.verbose, args.quiet).is_err() {
        eprintln!("failed to initialize logging");
        return ExitCode::from(1);
    }

    let mut config = Config::default();
    config.root = args.root;
    config.listen_addr = args.listen;
    config.mcp_path = args.path;
    config.state_dir = args.state_dir;

    // The retrieval backend is attached by the embedding process; the
    // standalone binary serves in degraded mode.
    let server = match McpServer::new(config, None, None) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("startup error: {err:#}");
            return ExitCode::from(1);
        }
    };

    match server.serve().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("server error: {err:#}");
            ExitCode::from(1)
        }
    }
}
