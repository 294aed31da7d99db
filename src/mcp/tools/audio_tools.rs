//! Media-facing tools: ask_audio, transcribe, annotate, transcribe_and_ask.
//!
//! These compose the retriever with the media backend. All `rel_path`
//! arguments go through the same path policy as `open_file`.

use crate::mcp::tools::retrieval_tools::{
    gather_hits, parse_index_select, truncate_chars, DEFAULT_K, MAX_K,
};
use crate::mcp::tools::{args, ToolDefinition, ToolHandler};
use crate::mcp::types::{ToolError, ToolResult};
use crate::observability::EventLog;
use crate::path_safety::{PathPolicy, ResolvedPath};
use crate::retriever::{MediaBackend, Retriever, RetrieverError};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Transcript context appended to `transcribe_and_ask` questions is
/// bounded so one long recording cannot crowd out the corpus.
const TRANSCRIPT_CONTEXT_CHARS: usize = 8_000;

pub struct AudioTools {
    retriever: Option<Arc<dyn Retriever>>,
    media: Option<Arc<dyn MediaBackend>>,
    paths: Arc<PathPolicy>,
    overfetch_multiplier: u32,
    events: Arc<EventLog>,
}

impl AudioTools {
    pub fn new(
        retriever: Option<Arc<dyn Retriever>>,
        media: Option<Arc<dyn MediaBackend>>,
        paths: Arc<PathPolicy>,
        overfetch_multiplier: u32,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            retriever,
            media,
            paths,
            overfetch_multiplier,
            events,
        }
    }

    pub fn ask_audio_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.ask_audio".to_string(),
            description: "Answer a question and synthesize the answer as speech".to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["question"],
                "properties": {
                    "question": {"type": "string", "minLength": 1},
                    "k": {"type": "integer", "minimum": 1, "maximum": MAX_K},
                    "index": {"type": "string", "enum": ["auto", "text", "code", "both"]},
                    "mode": {"type": "string", "enum": ["answer", "search_only"]},
                    "voice": {"type": "string"},
                }
            }),
            output_schema: None,
        }
    }

    pub fn transcribe_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.transcribe".to_string(),
            description: "Transcribe an audio file from the served directory".to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["rel_path"],
                "properties": {
                    "rel_path": {"type": "string", "minLength": 1},
                }
            }),
            output_schema: None,
        }
    }

    pub fn annotate_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.annotate".to_string(),
            description: "Describe or annotate an image or document page".to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["rel_path"],
                "properties": {
                    "rel_path": {"type": "string", "minLength": 1},
                    "instructions": {"type": "string"},
                }
            }),
            output_schema: None,
        }
    }

    pub fn transcribe_and_ask_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.transcribe_and_ask".to_string(),
            description: "Transcribe an audio file, then answer a question with the transcript as context"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["rel_path", "question"],
                "properties": {
                    "rel_path": {"type": "string", "minLength": 1},
                    "question": {"type": "string", "minLength": 1},
                    "k": {"type": "integer", "minimum": 1, "maximum": MAX_K},
                    "index": {"type": "string", "enum": ["auto", "text", "code", "both"]},
                }
            }),
            output_schema: None,
        }
    }

    fn require_retriever(&self) -> Result<&Arc<dyn Retriever>, ToolError> {
        self.retriever.as_ref().ok_or_else(ToolError::index_not_ready)
    }

    fn require_media(&self) -> Result<&Arc<dyn MediaBackend>, ToolError> {
        self.media.as_ref().ok_or_else(ToolError::index_not_ready)
    }

    fn map_backend_error(&self, err: RetrieverError) -> ToolError {
        self.events
            .error("retriever_error", json!({"error": err.to_string()}));
        ToolError::from_retriever(&err)
    }

    fn resolve(&self, rel_path: &str) -> Result<ResolvedPath, ToolError> {
        self.paths
            .resolve(rel_path)
            .map_err(super::retrieval_tools::map_path_error)
    }

    async fn ask_audio(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["question", "k", "index", "mode", "voice"])?;
        let question = args::require_str(&args_map, "question")?;
        let k = args::k_or_default(&args_map, DEFAULT_K, MAX_K)?;
        let select = parse_index_select(&args_map)?;
        let voice = args::opt_str(&args_map, "voice")?;
        let search_only = match args::opt_str(&args_map, "mode")? {
            None | Some("answer") => false,
            Some("search_only") => true,
            Some(other) => {
                return Err(ToolError::invalid_field(format!(
                    "'mode' must be 'answer' or 'search_only', got '{other}'"
                )))
            }
        };

        let retriever = self.require_retriever()?;
        let (_, hits) = gather_hits(retriever, question, select, k, self.overfetch_multiplier)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        // search_only short-circuits before any generation or synthesis.
        if search_only {
            return Ok(ToolResult::success(json!({
                "question": question,
                "answer": "",
                "citations": [],
                "hits": hits,
                "indexing_complete": retriever.indexing_complete(),
            })));
        }

        let outcome = retriever
            .ask(question, &hits)
            .await
            .map_err(|err| self.map_backend_error(err))?;
        let media = self.require_media()?;
        let clip = media
            .synthesize(&outcome.answer, voice)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        let structured = json!({
            "question": question,
            "answer": outcome.answer,
            "citations": outcome.citations,
            "hits": hits,
            "indexing_complete": retriever.indexing_complete(),
            "audio": {"mime_type": clip.mime_type, "voice": voice},
        });
        Ok(ToolResult::success_with_audio(
            structured,
            clip.data_base64,
            clip.mime_type,
        ))
    }

    async fn transcribe(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["rel_path"])?;
        let rel_path = args::require_str(&args_map, "rel_path")?;
        let resolved = self.resolve(rel_path)?;

        let media = self.require_media()?;
        let transcript = media
            .transcribe(&resolved.rel)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        Ok(ToolResult::success(json!({
            "rel_path": resolved.rel,
            "transcript": transcript,
        })))
    }

    async fn annotate(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["rel_path", "instructions"])?;
        let rel_path = args::require_str(&args_map, "rel_path")?;
        let instructions = args::opt_str(&args_map, "instructions")?;
        let resolved = self.resolve(rel_path)?;

        let media = self.require_media()?;
        let annotation = media
            .annotate(&resolved.rel, instructions)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        Ok(ToolResult::success(json!({
            "rel_path": resolved.rel,
            "annotation": annotation,
        })))
    }

    async fn transcribe_and_ask(
        &self,
        args_map: Map<String, Value>,
    ) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["rel_path", "question", "k", "index"])?;
        let rel_path = args::require_str(&args_map, "rel_path")?;
        let question = args::require_str(&args_map, "question")?;
        let k = args::k_or_default(&args_map, DEFAULT_K, MAX_K)?;
        let select = parse_index_select(&args_map)?;
        let resolved = self.resolve(rel_path)?;

        let media = self.require_media()?;
        let transcript = media
            .transcribe(&resolved.rel)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        let retriever = self.require_retriever()?;
        let (_, hits) = gather_hits(retriever, question, select, k, self.overfetch_multiplier)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        let (context, _) = truncate_chars(&transcript, TRANSCRIPT_CONTEXT_CHARS);
        let contextual_question =
            format!("{question}\n\nTranscript of {}:\n{context}", resolved.rel);
        let outcome = retriever
            .ask(&contextual_question, &hits)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        Ok(ToolResult::success(json!({
            "rel_path": resolved.rel,
            "transcript": transcript,
            "question": question,
            "answer": outcome.answer,
            "citations": outcome.citations,
            "hits": hits,
            "indexing_complete": retriever.indexing_complete(),
        })))
    }
}

#[async_trait]
impl ToolHandler for AudioTools {
    async fn call(
        &self,
        name: &str,
        args_map: Map<String, Value>,
    ) -> Result<ToolResult, ToolError> {
        match name {
            "dir2mcp.ask_audio" => self.ask_audio(args_map).await,
            "dir2mcp.transcribe" => self.transcribe(args_map).await,
            "dir2mcp.annotate" => self.annotate(args_map).await,
            "dir2mcp.transcribe_and_ask" => self.transcribe_and_ask(args_map).await,
            other => Err(ToolError::method_not_found(other)),
        }
    }
}
