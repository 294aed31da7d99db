//! Server lifecycle: construction, background sweepers, graceful shutdown.

use crate::config::Config;
use crate::mcp::http::{self, OriginSet};
use crate::mcp::tools::audio_tools::AudioTools;
use crate::mcp::tools::retrieval_tools::RetrievalTools;
use crate::mcp::tools::ToolRegistry;
use crate::observability::EventLog;
use crate::path_safety::PathPolicy;
use crate::payment::PaymentGate;
use crate::rate_limit::{RateLimiter, TrustedProxies};
use crate::retriever::{MediaBackend, Retriever};
use crate::session::SessionRegistry;
use anyhow::{Context, Result};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared request-handling state. Cheap to clone; everything heavy is
/// behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub proxies: Arc<TrustedProxies>,
    pub registry: Arc<ToolRegistry>,
    pub gate: Option<Arc<PaymentGate>>,
    pub events: Arc<EventLog>,
    pub origins: Arc<OriginSet>,
    pub start_time: Instant,
}

/// Handle for triggering a graceful shutdown from outside the serve loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct McpServer {
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl McpServer {
    pub fn new(
        config: Config,
        retriever: Option<Arc<dyn Retriever>>,
        media: Option<Arc<dyn MediaBackend>>,
    ) -> Result<Self> {
        Self::with_event_log(config, retriever, media, Arc::new(EventLog::stderr()))
    }

    /// Construct with an explicit event sink; tests use an in-memory one.
    pub fn with_event_log(
        config: Config,
        retriever: Option<Arc<dyn Retriever>>,
        media: Option<Arc<dyn MediaBackend>>,
        events: Arc<EventLog>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        if retriever.is_none() {
            tracing::warn!("no retriever configured; serving in degraded mode");
        }

        let paths = Arc::new(
            PathPolicy::new(&config.root, &config.exclude_globs)
                .context("exclude glob set")?,
        );
        let proxies = Arc::new(
            TrustedProxies::parse(&config.trusted_proxies).context("trusted_proxies")?,
        );
        // In `required` mode a bad requirement tuple fails startup here.
        let gate = PaymentGate::build(
            &config.x402,
            &config.mcp_path,
            &config.state_dir,
            events.clone(),
        )?;

        let registry = Arc::new(build_registry(
            retriever,
            media,
            paths,
            &config,
            events.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(
            config.session_inactivity_timeout,
            config.session_max_lifetime,
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_rps,
            config.rate_limit_burst,
            config.rate_limit_idle_ttl,
        ));
        let origins = Arc::new(OriginSet::new(&config.allowed_origins));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                sessions,
                limiter,
                proxies,
                registry,
                gate,
                events,
                origins,
                start_time: Instant::now(),
            },
            shutdown_tx,
        })
    }

    pub fn router(&self) -> Router {
        http::router(self.state.clone())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = self.state.config.listen_addr.parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let sweepers = self.spawn_sweepers();
        self.state.events.info(
            "server_started",
            json!({
                "addr": local_addr.to_string(),
                "mcp_path": self.state.config.mcp_path,
                "payments_enabled": self.state.gate.is_some(),
            }),
        );
        tracing::info!("MCP endpoint listening on {}{}", local_addr, self.state.config.mcp_path);

        let router = self.router();
        let shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await
        .context("server error")?;

        // Teardown order: stop feeding sweepers, drain sessions, then
        // flush payment state last.
        for sweeper in &sweepers {
            sweeper.abort();
        }
        self.state.sessions.shutdown();
        if let Some(gate) = &self.state.gate {
            gate.close();
        }
        self.state.events.info("server_stopped", json!({}));
        Ok(())
    }

    fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let sessions = self.state.sessions.clone();
        let events = self.state.events.clone();
        let mut rx = self.shutdown_tx.subscribe();
        let period = sessions.sweep_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for id in sessions.sweep(Instant::now()) {
                            events.info(
                                "session_terminated",
                                json!({"session": id, "reason": "expired"}),
                            );
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        }));

        let limiter = self.state.limiter.clone();
        let mut rx = self.shutdown_tx.subscribe();
        let period = limiter.sweep_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.sweep(Instant::now());
                    }
                    _ = rx.changed() => break,
                }
            }
        }));

        if let Some(gate) = self.state.gate.clone() {
            let mut rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CACHE_PRUNE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => gate.prune_cache(),
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        tasks
    }
}

/// Tools in their fixed declaration order; `tools/list` reports exactly
/// this sequence.
fn build_registry(
    retriever: Option<Arc<dyn Retriever>>,
    media: Option<Arc<dyn MediaBackend>>,
    paths: Arc<PathPolicy>,
    config: &Config,
    events: Arc<EventLog>,
) -> ToolRegistry {
    let retrieval = Arc::new(RetrievalTools::new(
        retriever.clone(),
        paths.clone(),
        config.state_dir.display().to_string(),
        config.protocol_version.clone(),
        config.overfetch_multiplier,
        events.clone(),
    ));
    let audio = Arc::new(AudioTools::new(
        retriever,
        media,
        paths,
        config.overfetch_multiplier,
        events,
    ));

    let mut registry = ToolRegistry::new();
    registry.register(RetrievalTools::search_definition(), retrieval.clone());
    registry.register(RetrievalTools::ask_definition(), retrieval.clone());
    registry.register(AudioTools::ask_audio_definition(), audio.clone());
    registry.register(AudioTools::transcribe_definition(), audio.clone());
    registry.register(AudioTools::annotate_definition(), audio.clone());
    registry.register(AudioTools::transcribe_and_ask_definition(), audio);
    registry.register(RetrievalTools::open_file_definition(), retrieval.clone());
    registry.register(RetrievalTools::list_files_definition(), retrieval.clone());
    registry.register(RetrievalTools::stats_definition(), retrieval);
    registry
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let requested = async move {
        loop {
            if *rx.borrow() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = requested => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
