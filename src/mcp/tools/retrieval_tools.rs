//! Retrieval-facing tools: search, ask, open_file, list_files, stats.
//!
//! This is the adapter between validated tool arguments and the retriever
//! capability. It owns the `auto` index heuristic, the `both` sub-query
//! merge, and citation attribution; for `open_file` it also enforces path
//! confinement, secret scrubbing, span selection, and truncation.

use crate::mcp::tools::{args, ToolDefinition, ToolHandler};
use crate::mcp::types::{canonical, ToolError, ToolResult};
use crate::observability::EventLog;
use crate::path_safety::{contains_secret, PathError, PathPolicy};
use crate::retriever::{Citation, IndexKind, Retriever, RetrieverError, SearchHit};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_K: usize = 10;
pub const MAX_K: i64 = 50;
const DEFAULT_MAX_CHARS: usize = 10_000;

pub struct RetrievalTools {
    retriever: Option<Arc<dyn Retriever>>,
    paths: Arc<PathPolicy>,
    state_dir: String,
    protocol_version: String,
    overfetch_multiplier: u32,
    events: Arc<EventLog>,
}

impl RetrievalTools {
    pub fn new(
        retriever: Option<Arc<dyn Retriever>>,
        paths: Arc<PathPolicy>,
        state_dir: String,
        protocol_version: String,
        overfetch_multiplier: u32,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            retriever,
            paths,
            state_dir,
            protocol_version,
            overfetch_multiplier,
            events,
        }
    }

    pub fn search_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.search".to_string(),
            description: "Semantic search over the indexed directory".to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["query"],
                "properties": {
                    "query": {"type": "string", "minLength": 1},
                    "k": {"type": "integer", "minimum": 1, "maximum": MAX_K},
                    "index": {"type": "string", "enum": ["auto", "text", "code", "both"]},
                }
            }),
            output_schema: Some(json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "k": {"type": "integer"},
                    "index_used": {"type": "string"},
                    "hits": {"type": "array"},
                    "indexing_complete": {"type": "boolean"},
                }
            })),
        }
    }

    pub fn ask_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.ask".to_string(),
            description: "Answer a question over the indexed directory with citations"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["question"],
                "properties": {
                    "question": {"type": "string", "minLength": 1},
                    "k": {"type": "integer", "minimum": 1, "maximum": MAX_K},
                    "index": {"type": "string", "enum": ["auto", "text", "code", "both"]},
                    "mode": {"type": "string", "enum": ["answer", "search_only"]},
                }
            }),
            output_schema: Some(json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "answer": {"type": "string"},
                    "citations": {"type": "array"},
                    "hits": {"type": "array"},
                    "indexing_complete": {"type": "boolean"},
                }
            })),
        }
    }

    pub fn open_file_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.open_file".to_string(),
            description: "Read a file from the served directory, optionally a span of it"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["rel_path"],
                "properties": {
                    "rel_path": {"type": "string", "minLength": 1},
                    "page": {"type": "integer", "minimum": 1},
                    "start_ms": {"type": "integer", "minimum": 0},
                    "end_ms": {"type": "integer", "minimum": 0},
                    "start_line": {"type": "integer", "minimum": 1},
                    "end_line": {"type": "integer", "minimum": 1},
                    "max_chars": {"type": "integer", "minimum": 200, "maximum": 50000},
                }
            }),
            output_schema: Some(json!({
                "type": "object",
                "properties": {
                    "rel_path": {"type": "string"},
                    "doc_type": {"type": "string"},
                    "span": {"type": "object"},
                    "content": {"type": "string"},
                    "truncated": {"type": "boolean"},
                }
            })),
        }
    }

    pub fn list_files_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.list_files".to_string(),
            description: "List files known to the index".to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "limit": {"type": "integer", "minimum": 1, "maximum": 1000},
                    "offset": {"type": "integer", "minimum": 0},
                }
            }),
            output_schema: None,
        }
    }

    pub fn stats_definition() -> ToolDefinition {
        ToolDefinition {
            name: "dir2mcp.stats".to_string(),
            description: "Server and indexing status".to_string(),
            input_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {}
            }),
            output_schema: None,
        }
    }

    fn require_retriever(&self) -> Result<&Arc<dyn Retriever>, ToolError> {
        self.retriever.as_ref().ok_or_else(ToolError::index_not_ready)
    }

    fn map_backend_error(&self, err: RetrieverError) -> ToolError {
        // Raw backend messages go to the event log only.
        self.events
            .error("retriever_error", json!({"error": err.to_string()}));
        ToolError::from_retriever(&err)
    }

    async fn search(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["query", "k", "index"])?;
        let query = args::require_str(&args_map, "query")?;
        let k = args::k_or_default(&args_map, DEFAULT_K, MAX_K)?;
        let select = parse_index_select(&args_map)?;

        let retriever = self.require_retriever()?;
        let (index_used, hits) =
            gather_hits(retriever, query, select, k, self.overfetch_multiplier)
                .await
                .map_err(|err| self.map_backend_error(err))?;

        Ok(ToolResult::success(json!({
            "query": query,
            "k": k,
            "index_used": index_used,
            "hits": hits,
            "indexing_complete": retriever.indexing_complete(),
        })))
    }

    async fn ask(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["question", "k", "index", "mode"])?;
        let question = args::require_str(&args_map, "question")?;
        let k = args::k_or_default(&args_map, DEFAULT_K, MAX_K)?;
        let select = parse_index_select(&args_map)?;
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

        let (answer, citations) = if search_only {
            (String::new(), Vec::new())
        } else {
            let outcome = retriever
                .ask(question, &hits)
                .await
                .map_err(|err| self.map_backend_error(err))?;
            let answer = ensure_attribution(&outcome.answer, &outcome.citations);
            (answer, outcome.citations)
        };

        Ok(ToolResult::success(json!({
            "question": question,
            "answer": answer,
            "citations": citations,
            "hits": hits,
            "indexing_complete": retriever.indexing_complete(),
        })))
    }

    async fn open_file(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(
            &args_map,
            &[
                "rel_path",
                "page",
                "start_ms",
                "end_ms",
                "start_line",
                "end_line",
                "max_chars",
            ],
        )?;
        let rel_path = args::require_str(&args_map, "rel_path")?;
        let span = parse_span(&args_map)?;
        let max_chars = args::opt_i64_in(&args_map, "max_chars", 200, 50_000)?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);

        let resolved = self.paths.resolve(rel_path).map_err(map_path_error)?;
        let retriever = self.require_retriever()?;
        let document = retriever
            .open_file(&resolved.rel)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        if contains_secret(&document.text) {
            self.events
                .warning("secret_scrub_hit", json!({"rel_path": resolved.rel}));
            return Err(ToolError::new(
                canonical::FORBIDDEN,
                "file content matches a secret pattern",
                false,
            ));
        }

        let selected = match &span {
            Some(span) => apply_span(&document.text, span)?,
            None => document.text,
        };
        let (content, truncated) = truncate_chars(&selected, max_chars);

        let mut body = json!({
            "rel_path": resolved.rel,
            "doc_type": document.doc_type.as_str(),
            "content": content,
            "truncated": truncated,
        });
        if let Some(span) = span {
            body["span"] = span.to_value();
        }
        Ok(ToolResult::success(body))
    }

    async fn list_files(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &["limit", "offset"])?;
        let limit = args::opt_i64_in(&args_map, "limit", 1, 1000)?
            .map(|v| v as usize)
            .unwrap_or(100);
        let offset = match args::opt_i64(&args_map, "offset")? {
            Some(v) if v < 0 => {
                return Err(ToolError::invalid_range(format!(
                    "'offset' {v} must be >= 0"
                )))
            }
            Some(v) => v as usize,
            None => 0,
        };

        let retriever = self.require_retriever()?;
        let listing = retriever
            .list_files(limit, offset)
            .await
            .map_err(|err| self.map_backend_error(err))?;

        Ok(ToolResult::success(json!({
            "limit": limit,
            "offset": offset,
            "total": listing.total,
            "files": listing.files,
        })))
    }

    async fn stats(&self, args_map: Map<String, Value>) -> Result<ToolResult, ToolError> {
        args::reject_unknown(&args_map, &[])?;

        let (indexing, models) = match &self.retriever {
            Some(retriever) => {
                let stats = retriever
                    .stats()
                    .await
                    .map_err(|err| self.map_backend_error(err))?;
                (
                    json!({
                        "documents_indexed": stats.documents_indexed,
                        "chunks_indexed": stats.chunks_indexed,
                        "pending": stats.pending,
                        "complete": stats.complete,
                    }),
                    stats.models,
                )
            }
            // Degraded mode: stats still answers.
            None => (
                json!({"complete": false, "reason": "retriever not configured"}),
                json!({}),
            ),
        };

        Ok(ToolResult::success(json!({
            "root": self.paths.root().display().to_string(),
            "state_dir": self.state_dir,
            "protocol_version": self.protocol_version,
            "indexing": indexing,
            "models": models,
        })))
    }
}

#[async_trait]
impl ToolHandler for RetrievalTools {
    async fn call(
        &self,
        name: &str,
        args_map: Map<String, Value>,
    ) -> Result<ToolResult, ToolError> {
        match name {
            "dir2mcp.search" => self.search(args_map).await,
            "dir2mcp.ask" => self.ask(args_map).await,
            "dir2mcp.open_file" => self.open_file(args_map).await,
            "dir2mcp.list_files" => self.list_files(args_map).await,
            "dir2mcp.stats" => self.stats(args_map).await,
            other => Err(ToolError::method_not_found(other)),
        }
    }
}

/// Index selector as supplied by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSelect {
    Auto,
    Text,
    Code,
    Both,
}

pub fn parse_index_select(args_map: &Map<String, Value>) -> Result<IndexSelect, ToolError> {
    match args::opt_str(args_map, "index")? {
        None | Some("auto") => Ok(IndexSelect::Auto),
        Some("text") => Ok(IndexSelect::Text),
        Some("code") => Ok(IndexSelect::Code),
        Some("both") => Ok(IndexSelect::Both),
        Some(other) => Err(ToolError::invalid_field(format!(
            "'index' must be one of auto|text|code|both, got '{other}'"
        ))),
    }
}

static CODE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(fn|def|class|struct|enum|impl|trait|import|include|return|const|let|var|func|function|async|await|pub|static|void)\b",
    )
    .expect("static regex")
});

static FILE_EXTENSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.\b(rs|go|py|js|ts|tsx|jsx|java|c|h|cpp|hpp|rb|sh|sql|toml|yaml|yml|json)\b")
        .expect("static regex")
});

/// Heuristic used by `index=auto`: code-looking queries route to the code
/// index, everything else to text.
pub fn choose_index(query: &str) -> IndexKind {
    if query.contains("```") {
        return IndexKind::Code;
    }
    if CODE_KEYWORDS.is_match(query) || FILE_EXTENSION.is_match(query) {
        return IndexKind::Code;
    }
    if query.contains("::") || query.contains("=>") || query.contains("();") {
        return IndexKind::Code;
    }
    let symbols = query
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '(' | ')' | ';' | '=' | '<' | '>'))
        .count();
    let len = query.chars().count().max(1);
    if symbols * 100 / len >= 8 {
        IndexKind::Code
    } else {
        IndexKind::Text
    }
}

/// Resolve the selector and produce the final hit list.
///
/// `both` overfetches each sub-query by the configured multiplier,
/// min-max-normalizes scores within each, merges on chunk id (max score
/// wins), sorts by score descending then id ascending, and truncates to k.
pub(crate) async fn gather_hits(
    retriever: &Arc<dyn Retriever>,
    query: &str,
    select: IndexSelect,
    k: usize,
    overfetch_multiplier: u32,
) -> Result<(&'static str, Vec<SearchHit>), RetrieverError> {
    let single = |kind: IndexKind| (kind, kind.as_str());
    let (kind, label) = match select {
        IndexSelect::Auto => single(choose_index(query)),
        IndexSelect::Text => single(IndexKind::Text),
        IndexSelect::Code => single(IndexKind::Code),
        IndexSelect::Both => {
            let multiplier = overfetch_multiplier.clamp(1, 100) as usize;
            let fetch = k.saturating_mul(multiplier);
            let mut text_hits = retriever.search(query, IndexKind::Text, fetch).await?;
            let mut code_hits = retriever.search(query, IndexKind::Code, fetch).await?;
            normalize_scores(&mut text_hits);
            normalize_scores(&mut code_hits);

            let mut merged: HashMap<String, SearchHit> = HashMap::new();
            for hit in text_hits.into_iter().chain(code_hits) {
                match merged.get(&hit.id) {
                    Some(existing) if existing.score >= hit.score => {}
                    _ => {
                        merged.insert(hit.id.clone(), hit);
                    }
                }
            }
            let mut hits: Vec<SearchHit> = merged.into_values().collect();
            hits.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            hits.truncate(k);
            return Ok(("both", hits));
        }
    };

    let mut hits = retriever.search(query, kind, k).await?;
    hits.truncate(k);
    Ok((label, hits))
}

/// Min-max normalization within one sub-query's result set.
fn normalize_scores(hits: &mut [SearchHit]) {
    let (min, max) = hits.iter().fold((f64::MAX, f64::MIN), |(lo, hi), h| {
        (lo.min(h.score), hi.max(h.score))
    });
    if hits.is_empty() {
        return;
    }
    let range = max - min;
    for hit in hits.iter_mut() {
        hit.score = if range > 0.0 {
            (hit.score - min) / range
        } else {
            1.0
        };
    }
}

/// Append a `Sources:` suffix listing citation tags the answer text does
/// not already carry; up to five, in citation order.
pub fn ensure_attribution(answer: &str, citations: &[Citation]) -> String {
    let mut missing: Vec<String> = Vec::new();
    for citation in citations {
        let tag = format!("[{}]", citation.rel_path);
        if !answer.contains(&tag) && !missing.contains(&tag) {
            missing.push(tag);
        }
    }
    if missing.is_empty() {
        return answer.to_string();
    }
    missing.truncate(5);
    format!("{answer}\n\nSources: {}", missing.join(" "))
}

/// A span selector into a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Lines { start: usize, end: usize },
    Page { page: usize },
    TimeMs { start_ms: u64, end_ms: u64 },
}

impl Span {
    pub fn to_value(&self) -> Value {
        match self {
            Span::Lines { start, end } => {
                json!({"type": "lines", "start_line": start, "end_line": end})
            }
            Span::Page { page } => json!({"type": "page", "page": page}),
            Span::TimeMs { start_ms, end_ms } => {
                json!({"type": "time", "start_ms": start_ms, "end_ms": end_ms})
            }
        }
    }
}

/// Parse the three mutually exclusive span groups from the arguments.
pub fn parse_span(args_map: &Map<String, Value>) -> Result<Option<Span>, ToolError> {
    let page = args::opt_i64(args_map, "page")?;
    let start_ms = args::opt_i64(args_map, "start_ms")?;
    let end_ms = args::opt_i64(args_map, "end_ms")?;
    let start_line = args::opt_i64(args_map, "start_line")?;
    let end_line = args::opt_i64(args_map, "end_line")?;

    let groups = [
        page.is_some(),
        start_ms.is_some() || end_ms.is_some(),
        start_line.is_some() || end_line.is_some(),
    ];
    if groups.iter().filter(|g| **g).count() > 1 {
        return Err(ToolError::invalid_field("conflicting span parameters"));
    }

    if let Some(page) = page {
        if page < 1 {
            return Err(ToolError::invalid_range(format!(
                "'page' {page} must be >= 1"
            )));
        }
        return Ok(Some(Span::Page { page: page as usize }));
    }

    if start_ms.is_some() || end_ms.is_some() {
        let (start, end) = match (start_ms, end_ms) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(ToolError::missing_field(
                    "'start_ms' and 'end_ms' must be supplied together",
                ))
            }
        };
        if start < 0 || end < 0 {
            return Err(ToolError::invalid_range("time span must be >= 0"));
        }
        if start > end {
            return Err(ToolError::invalid_range(
                "'start_ms' must not exceed 'end_ms'",
            ));
        }
        return Ok(Some(Span::TimeMs {
            start_ms: start as u64,
            end_ms: end as u64,
        }));
    }

    if start_line.is_some() || end_line.is_some() {
        let (start, end) = match (start_line, end_line) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(ToolError::missing_field(
                    "'start_line' and 'end_line' must be supplied together",
                ))
            }
        };
        if start < 1 || end < 1 {
            return Err(ToolError::invalid_range("line numbers must be >= 1"));
        }
        if start > end {
            return Err(ToolError::invalid_range(
                "'start_line' must not exceed 'end_line'",
            ));
        }
        return Ok(Some(Span::Lines {
            start: start as usize,
            end: end as usize,
        }));
    }

    Ok(None)
}

static TRANSCRIPT_TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\d{1,2}):(\d{2})(?::(\d{2}))?\]").expect("static regex"));

/// Apply a span to document text.
///
/// Pages split on form-feed; time windows select `[HH:MM(:SS)]`-prefixed
/// transcript entries (untimed continuation lines follow their entry).
pub fn apply_span(text: &str, span: &Span) -> Result<String, ToolError> {
    match span {
        Span::Lines { start, end } => {
            let lines: Vec<&str> = text.lines().collect();
            if *start > lines.len() {
                return Err(ToolError::invalid_range(format!(
                    "'start_line' {start} beyond end of file ({} lines)",
                    lines.len()
                )));
            }
            let end = (*end).min(lines.len());
            Ok(lines[start - 1..end].join("\n"))
        }
        Span::Page { page } => {
            let pages: Vec<&str> = text.split('\x0c').collect();
            if *page > pages.len() {
                return Err(ToolError::invalid_range(format!(
                    "'page' {page} beyond last page ({})",
                    pages.len()
                )));
            }
            Ok(pages[page - 1].trim_matches('\n').to_string())
        }
        Span::TimeMs { start_ms, end_ms } => {
            let mut current: Option<u64> = None;
            let mut any_timestamp = false;
            let mut selected = Vec::new();
            for line in text.lines() {
                if let Some(ms) = parse_timestamp_ms(line) {
                    any_timestamp = true;
                    current = Some(ms);
                }
                if let Some(ms) = current {
                    if ms >= *start_ms && ms <= *end_ms {
                        selected.push(line);
                    }
                }
            }
            if !any_timestamp {
                return Err(ToolError::new(
                    canonical::DOC_TYPE_UNSUPPORTED,
                    "document has no timestamped transcript entries",
                    false,
                ));
            }
            Ok(selected.join("\n"))
        }
    }
}

fn parse_timestamp_ms(line: &str) -> Option<u64> {
    let captures = TRANSCRIPT_TIMESTAMP.captures(line)?;
    let first: u64 = captures.get(1)?.as_str().parse().ok()?;
    let second: u64 = captures.get(2)?.as_str().parse().ok()?;
    Some(match captures.get(3) {
        // [HH:MM:SS]
        Some(seconds) => {
            let seconds: u64 = seconds.as_str().parse().ok()?;
            ((first * 60 + second) * 60 + seconds) * 1000
        }
        // [MM:SS]
        None => (first * 60 + second) * 1000,
    })
}

/// Bound output by character count.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        (text.to_string(), false)
    } else {
        (text.chars().take(max_chars).collect(), true)
    }
}

pub(crate) fn map_path_error(err: PathError) -> ToolError {
    match err {
        PathError::Absolute | PathError::Traversal | PathError::OutsideRoot => ToolError::new(
            canonical::PATH_OUTSIDE_ROOT,
            "path resolves outside the served root",
            false,
        ),
        PathError::Excluded => ToolError::new(
            canonical::FORBIDDEN,
            "path matches an excluded pattern",
            false,
        ),
        PathError::NotFound => {
            ToolError::new(canonical::NOT_FOUND, "file not found", false)
        }
        PathError::Invalid(reason) => {
            ToolError::invalid_field(format!("invalid rel_path: {reason}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn heuristic_routes_codey_queries_to_code() {
        assert_eq!(choose_index("fn main entry point"), IndexKind::Code);
        assert_eq!(choose_index("HashMap::insert usage"), IndexKind::Code);
        assert_eq!(choose_index("what is in chapter two"), IndexKind::Text);
        assert_eq!(choose_index("```\nlet x = 1;\n```"), IndexKind::Code);
        assert_eq!(choose_index("error in server.rs"), IndexKind::Code);
    }

    #[test]
    fn span_groups_are_mutually_exclusive() {
        let err = parse_span(&map(json!({
            "page": 2, "start_line": 1, "end_line": 2
        })))
        .unwrap_err();
        assert_eq!(err.code, "INVALID_FIELD");
        assert!(err.message.contains("conflicting span parameters"));

        let err = parse_span(&map(json!({"start_ms": 0, "end_line": 5, "end_ms": 10})))
            .unwrap_err();
        assert!(err.message.contains("conflicting span parameters"));
    }

    #[test]
    fn span_endpoints_required_together() {
        let err = parse_span(&map(json!({"start_line": 3}))).unwrap_err();
        assert_eq!(err.code, "MISSING_FIELD");

        let err = parse_span(&map(json!({"end_ms": 3000}))).unwrap_err();
        assert_eq!(err.code, "MISSING_FIELD");
    }

    #[test]
    fn span_ordering_enforced() {
        let err = parse_span(&map(json!({"start_line": 9, "end_line": 3}))).unwrap_err();
        assert_eq!(err.code, "INVALID_RANGE");

        let err = parse_span(&map(json!({"start_ms": 500, "end_ms": 100}))).unwrap_err();
        assert_eq!(err.code, "INVALID_RANGE");

        let span = parse_span(&map(json!({"start_line": 2, "end_line": 2}))).unwrap();
        assert_eq!(span, Some(Span::Lines { start: 2, end: 2 }));
    }

    #[test]
    fn line_span_selects_and_clamps() {
        let text = "one\ntwo\nthree\nfour";
        let got = apply_span(text, &Span::Lines { start: 2, end: 3 }).unwrap();
        assert_eq!(got, "two\nthree");

        let got = apply_span(text, &Span::Lines { start: 3, end: 99 }).unwrap();
        assert_eq!(got, "three\nfour");

        let err = apply_span(text, &Span::Lines { start: 9, end: 10 }).unwrap_err();
        assert_eq!(err.code, "INVALID_RANGE");
    }

    #[test]
    fn page_span_splits_on_form_feed() {
        let text = "page one\x0cpage two\x0cpage three";
        assert_eq!(
            apply_span(text, &Span::Page { page: 2 }).unwrap(),
            "page two"
        );
        let err = apply_span(text, &Span::Page { page: 4 }).unwrap_err();
        assert_eq!(err.code, "INVALID_RANGE");
    }

    #[test]
    fn time_span_selects_transcript_entries() {
        let text = "[00:05] hello there\nstill talking\n[00:12] second entry\n[01:00] later";
        let got = apply_span(
            text,
            &Span::TimeMs {
                start_ms: 4_000,
                end_ms: 15_000,
            },
        )
        .unwrap();
        assert_eq!(got, "[00:05] hello there\nstill talking\n[00:12] second entry");

        let err = apply_span(
            "no timestamps here",
            &Span::TimeMs {
                start_ms: 0,
                end_ms: 10,
            },
        )
        .unwrap_err();
        assert_eq!(err.code, "DOC_TYPE_UNSUPPORTED");
    }

    #[test]
    fn hhmmss_timestamps_parse() {
        assert_eq!(parse_timestamp_ms("[00:05] x"), Some(5_000));
        assert_eq!(parse_timestamp_ms("[01:02:03] x"), Some(3_723_000));
        assert_eq!(parse_timestamp_ms("no stamp"), None);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let (out, truncated) = truncate_chars("héllo wörld", 5);
        assert_eq!(out, "héllo");
        assert!(truncated);

        let (out, truncated) = truncate_chars("short", 10);
        assert_eq!(out, "short");
        assert!(!truncated);
    }

    #[test]
    fn attribution_suffix_lists_missing_tags() {
        let citations = vec![
            Citation {
                rel_path: "a.md".to_string(),
                chunk_id: None,
            },
            Citation {
                rel_path: "b.md".to_string(),
                chunk_id: None,
            },
        ];
        let answer = "See [a.md] for details.";
        let got = ensure_attribution(answer, &citations);
        assert_eq!(got, "See [a.md] for details.\n\nSources: [b.md]");

        let covered = ensure_attribution("Both [a.md] and [b.md].", &citations);
        assert!(!covered.contains("Sources:"));
    }

    #[test]
    fn attribution_suffix_caps_at_five() {
        let citations: Vec<Citation> = (0..8)
            .map(|i| Citation {
                rel_path: format!("f{i}.md"),
                chunk_id: None,
            })
            .collect();
        let got = ensure_attribution("no tags", &citations);
        let suffix = got.split("Sources: ").nth(1).unwrap();
        assert_eq!(suffix.split(' ').count(), 5);
    }

    #[test]
    fn minmax_normalization_and_degenerate_case() {
        let mut hits = vec![
            hit("a", 2.0),
            hit("b", 6.0),
            hit("c", 4.0),
        ];
        normalize_scores(&mut hits);
        assert_eq!(hits[0].score, 0.0);
        assert_eq!(hits[1].score, 1.0);
        assert_eq!(hits[2].score, 0.5);

        let mut flat = vec![hit("a", 3.0), hit("b", 3.0)];
        normalize_scores(&mut flat);
        assert!(flat.iter().all(|h| h.score == 1.0));
    }

    fn hit(id: &str, score: f64) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            rel_path: format!("{id}.md"),
            score,
            snippet: String::new(),
            doc_type: crate::retriever::DocType::Markdown,
        }
    }
}
