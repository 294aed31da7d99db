//! The retrieval backend seam.
//!
//! The server core never talks to embedders, vector indexes, OCR, or chat
//! models directly. It consumes the [`Retriever`] capability (search, ask,
//! open_file, list_files, stats, indexing_complete) and, for the audio
//! tools, the [`MediaBackend`] capability. A missing retriever puts the
//! server in degraded mode: retrieval tools answer `INDEX_NOT_READY` while
//! `stats` keeps working.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrieverError {
    #[error("index is not ready")]
    IndexNotReady,
    #[error("retriever is not configured")]
    NotConfigured,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("path outside root: {0}")]
    PathOutsideRoot(String),
    #[error("unsupported document type: {0}")]
    DocTypeUnsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Concrete index a sub-query runs against. The `auto`/`both` selectors
/// are resolved by the adapter before the retriever is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Text,
    Code,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Text => "text",
            IndexKind::Code => "code",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Text,
    Code,
    Markdown,
    Pdf,
    Audio,
    Image,
}

impl DocType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocType::Text => "text",
            DocType::Code => "code",
            DocType::Markdown => "markdown",
            DocType::Pdf => "pdf",
            DocType::Audio => "audio",
            DocType::Image => "image",
        }
    }
}

/// One scored chunk returned by a retrieval sub-query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Stable chunk identifier, unique within the corpus.
    pub id: String,
    pub rel_path: String,
    pub score: f64,
    pub snippet: String,
    pub doc_type: DocType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub rel_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

/// Answer produced by the backend over the hit set the adapter supplies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskOutcome {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Whole-document text as stored by the backend. Span selection and
/// secret scrubbing happen in the adapter, not here.
#[derive(Debug, Clone)]
pub struct DocumentText {
    pub doc_type: DocType,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub rel_path: String,
    pub doc_type: DocType,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FileListing {
    /// Total corpus size before limit/offset are applied.
    pub total: usize,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents_indexed: u64,
    pub chunks_indexed: u64,
    pub pending: u64,
    pub complete: bool,
    /// Model identifiers in use by the backend, opaque to the core.
    pub models: serde_json::Value,
}

/// Synthesized audio returned by the media backend.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Base64-encoded audio bytes, ready for an MCP audio content item.
    pub data_base64: String,
    pub mime_type: String,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(
        &self,
        query: &str,
        index: IndexKind,
        k: usize,
    ) -> Result<Vec<SearchHit>, RetrieverError>;

    /// Generate an answer over the supplied context hits.
    async fn ask(
        &self,
        question: &str,
        context: &[SearchHit],
    ) -> Result<AskOutcome, RetrieverError>;

    async fn open_file(&self, rel_path: &str) -> Result<DocumentText, RetrieverError>;

    async fn list_files(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<FileListing, RetrieverError>;

    async fn stats(&self) -> Result<IndexStats, RetrieverError>;

    fn indexing_complete(&self) -> bool;
}

/// Transcription, annotation, and speech synthesis.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn transcribe(&self, rel_path: &str) -> Result<String, RetrieverError>;

    async fn annotate(
        &self,
        rel_path: &str,
        instructions: Option<&str>,
    ) -> Result<String, RetrieverError>;

    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
    ) -> Result<AudioClip, RetrieverError>;
}
