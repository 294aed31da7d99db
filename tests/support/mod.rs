//! Shared fixtures for the integration tests: an in-memory retriever and
//! media backend, plus a helper that serves a configured server on an
//! ephemeral port.

#![allow(dead_code)]

use async_trait::async_trait;
use dir2mcp::{
    AskOutcome, AudioClip, Citation, Config, DocType, DocumentText, FileEntry, FileListing,
    IndexKind, IndexStats, McpServer, MediaBackend, Retriever, RetrieverError, SearchHit,
    ShutdownHandle,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Retriever stub over a fixed set of documents, counting calls so tests
/// can assert at-most-once execution.
#[derive(Default)]
pub struct StubRetriever {
    pub docs: HashMap<String, (DocType, String)>,
    pub search_calls: AtomicUsize,
    pub ask_calls: AtomicUsize,
}

impl StubRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc(mut self, rel_path: &str, doc_type: DocType, text: &str) -> Self {
        self.docs
            .insert(rel_path.to_string(), (doc_type, text.to_string()));
        self
    }

    pub fn search_count(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Retriever for StubRetriever {
    async fn search(
        &self,
        query: &str,
        index: IndexKind,
        k: usize,
    ) -> Result<Vec<SearchHit>, RetrieverError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let _ = (query, index);
        let mut rels: Vec<&String> = self.docs.keys().collect();
        rels.sort();
        let mut hits: Vec<SearchHit> = rels
            .into_iter()
            .enumerate()
            .map(|(i, rel_path)| {
                let (doc_type, text) = &self.docs[rel_path];
                SearchHit {
                    id: format!("chunk-{i}"),
                    rel_path: rel_path.clone(),
                    score: 1.0 / (i + 1) as f64,
                    snippet: text.chars().take(80).collect(),
                    doc_type: *doc_type,
                }
            })
            .collect();
        hits.truncate(k);
        Ok(hits)
    }

    async fn ask(
        &self,
        _question: &str,
        context: &[SearchHit],
    ) -> Result<AskOutcome, RetrieverError> {
        self.ask_calls.fetch_add(1, Ordering::SeqCst);
        let citations = context
            .iter()
            .take(2)
            .map(|hit| Citation {
                rel_path: hit.rel_path.clone(),
                chunk_id: Some(hit.id.clone()),
            })
            .collect();
        Ok(AskOutcome {
            answer: "The corpus covers this topic.".to_string(),
            citations,
        })
    }

    async fn open_file(&self, rel_path: &str) -> Result<DocumentText, RetrieverError> {
        match self.docs.get(rel_path) {
            Some((doc_type, text)) => Ok(DocumentText {
                doc_type: *doc_type,
                text: text.clone(),
            }),
            None => Err(RetrieverError::NotFound(rel_path.to_string())),
        }
    }

    async fn list_files(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<FileListing, RetrieverError> {
        let mut rels: Vec<&String> = self.docs.keys().collect();
        rels.sort();
        let files = rels
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|rel_path| FileEntry {
                rel_path: rel_path.clone(),
                doc_type: self.docs[rel_path].0,
                size_bytes: self.docs[rel_path].1.len() as u64,
            })
            .collect();
        Ok(FileListing {
            total: self.docs.len(),
            files,
        })
    }

    async fn stats(&self) -> Result<IndexStats, RetrieverError> {
        Ok(IndexStats {
            documents_indexed: self.docs.len() as u64,
            chunks_indexed: self.docs.len() as u64,
            pending: 0,
            complete: true,
            models: json!({"embedder": "stub-embed-1"}),
        })
    }

    fn indexing_complete(&self) -> bool {
        true
    }
}

pub struct StubMedia;

#[async_trait]
impl MediaBackend for StubMedia {
    async fn transcribe(&self, rel_path: &str) -> Result<String, RetrieverError> {
        Ok(format!("[00:01] transcript of {rel_path}"))
    }

    async fn annotate(
        &self,
        rel_path: &str,
        instructions: Option<&str>,
    ) -> Result<String, RetrieverError> {
        Ok(format!(
            "annotation of {rel_path} ({})",
            instructions.unwrap_or("default")
        ))
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice: Option<&str>,
    ) -> Result<AudioClip, RetrieverError> {
        Ok(AudioClip {
            data_base64: "c3R1Yi1hdWRpbw==".to_string(),
            mime_type: "audio/mpeg".to_string(),
        })
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub url: String,
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(
        config: Config,
        retriever: Option<Arc<dyn Retriever>>,
        media: Option<Arc<dyn MediaBackend>>,
    ) -> Self {
        let mcp_path = config.mcp_path.clone();
        let server = McpServer::new(config, retriever, media).expect("server construction");
        let shutdown = server.shutdown_handle();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            if let Err(err) = server.serve_with_listener(listener).await {
                eprintln!("test server terminated: {err:#}");
            }
        });
        // Give the listener a moment to start accepting.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        Self {
            addr,
            url: format!("http://{addr}{mcp_path}"),
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.shutdown();
        let _ = self.task.await;
    }
}

/// POST a JSON-RPC request, returning the raw response.
pub async fn rpc_post(
    client: &reqwest::Client,
    url: &str,
    session: Option<&str>,
    body: Value,
) -> reqwest::Response {
    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .body(body.to_string());
    if let Some(session) = session {
        request = request.header("MCP-Session-Id", session);
    }
    request.send().await.expect("send")
}

/// Run `initialize` and return the minted session id.
pub async fn initialize(client: &reqwest::Client, url: &str) -> String {
    let response = rpc_post(
        client,
        url,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;
    assert_eq!(response.status(), 200);
    response
        .headers()
        .get("mcp-session-id")
        .expect("session header")
        .to_str()
        .expect("header utf8")
        .to_string()
}

/// Convenience `tools/call` body.
pub fn tools_call(id: Value, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments},
    })
}
