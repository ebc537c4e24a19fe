//! Keyword retrieval over project artifacts (SQLite FTS5, no vector store).
//!
//! Every project JSON file becomes exactly one chunk whose text is its
//! pretty-printed serialization, so rebuilds are deterministic. Queries are
//! sanitized before they reach the FTS5 grammar; if FTS5 is unavailable or
//! parsing still fails, search degrades to a linear substring scan.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::{Connection, params};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::store::{
    CHARACTERS_FILE, MEMORY_FILE, OUTLINE_FILE, REPORTS_FILE, SETTINGS_FILE, THEME_CONFLICT_FILE,
    WORLD_FILE,
};

/// One retrievable unit of text.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    /// Stable id, e.g. `file:world.json`.
    pub source_id: String,
    /// Path relative to the project root.
    pub source_path: String,
    pub doc_type: String,
    pub chapter_id: Option<u32>,
    pub text: String,
}

/// A search result.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub source_id: String,
    pub source_path: String,
    pub doc_type: String,
    pub chapter_id: Option<u32>,
    /// Higher is more relevant. FTS results negate BM25; fallback hits
    /// score a constant 1.0.
    pub score: f64,
    pub excerpt: String,
}

/// Optional search filters.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub doc_types: Option<Vec<String>>,
    pub chapter_min: Option<u32>,
    pub chapter_max: Option<u32>,
}

impl SearchFilters {
    fn accepts(&self, doc_type: &str, chapter_id: Option<u32>) -> bool {
        if let Some(types) = &self.doc_types {
            if !types.iter().any(|t| t == doc_type) {
                return false;
            }
        }
        if let Some(chapter) = chapter_id {
            if let Some(min) = self.chapter_min {
                if chapter < min {
                    return false;
                }
            }
            if let Some(max) = self.chapter_max {
                if chapter > max {
                    return false;
                }
            }
        }
        true
    }
}

/// Sanitize a user query for the FTS5 MATCH grammar.
///
/// Prompts routinely contain punctuation that breaks the query parser, so
/// everything outside `[A-Za-z0-9_\p{Han}]` becomes a space and whitespace
/// runs collapse. Idempotent on already-sanitized input.
pub fn sanitize_query(query: &str) -> String {
    static STRIP: OnceLock<Regex> = OnceLock::new();
    static COLLAPSE: OnceLock<Regex> = OnceLock::new();
    let strip = STRIP.get_or_init(|| Regex::new(r"[^A-Za-z0-9_\p{Han}]+").expect("static regex"));
    let collapse = COLLAPSE.get_or_init(|| Regex::new(r"\s+").expect("static regex"));

    let replaced = strip.replace_all(query.trim(), " ");
    collapse.replace_all(replaced.trim(), " ").to_string()
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn chapter_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^chapter_(\d{3})(_plan)?\.json$").expect("static regex"))
}

/// Visit each project artifact and emit one chunk per file.
pub fn iter_project_chunks(project_root: &Path) -> Vec<DocumentChunk> {
    let mut chunks = Vec::new();

    let mut emit = |rel: &str, doc_type: &str, chapter_id: Option<u32>| {
        let path = project_root.join(rel);
        if !path.is_file() {
            return;
        }
        let text = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        {
            Some(value) => pretty_json(&value),
            None => return,
        };
        chunks.push(DocumentChunk {
            source_id: format!("file:{rel}"),
            source_path: rel.to_string(),
            doc_type: doc_type.to_string(),
            chapter_id,
            text,
        });
    };

    for (file, doc_type) in [
        (WORLD_FILE, "world"),
        (CHARACTERS_FILE, "characters"),
        (THEME_CONFLICT_FILE, "theme_conflict"),
        (OUTLINE_FILE, "outline"),
        (MEMORY_FILE, "chapter_memory"),
        (REPORTS_FILE, "consistency_reports"),
        (SETTINGS_FILE, "settings"),
    ] {
        emit(file, doc_type, None);
    }

    let chapters_dir = project_root.join("chapters");
    if let Ok(entries) = std::fs::read_dir(&chapters_dir) {
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        for name in names {
            if let Some(caps) = chapter_file_regex().captures(&name) {
                let chapter_id = caps[1].parse::<u32>().ok();
                let doc_type = if caps.get(2).is_some() {
                    "chapter_plan"
                } else {
                    "chapter_content"
                };
                emit(&format!("chapters/{name}"), doc_type, chapter_id);
            }
        }
    }

    chunks
}

fn connect(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(EngineError::storage)?;
    }
    let conn = Connection::open(db_path)?;
    Ok(conn)
}

/// Create the FTS table if possible. Returns false when this SQLite build
/// has no FTS5, which switches search into fallback mode.
fn ensure_fts(conn: &Connection) -> bool {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
         USING fts5(
           text,
           source_id UNINDEXED,
           source_path UNINDEXED,
           doc_type UNINDEXED,
           chapter_id UNINDEXED,
           tokenize = 'unicode61'
         )",
    )
    .is_ok()
}

/// Full rebuild of the retrieval index. The corpus is one chunk per project
/// file, small enough that incremental updates are not worth their
/// complexity. Returns false when FTS5 is unavailable.
pub fn rebuild_index(db_path: &Path, chunks: &[DocumentChunk]) -> Result<bool> {
    let conn = connect(db_path)?;
    if !ensure_fts(&conn) {
        return Ok(false);
    }
    conn.execute("DELETE FROM chunks_fts", [])?;
    {
        let mut stmt = conn.prepare(
            "INSERT INTO chunks_fts(text, source_id, source_path, doc_type, chapter_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for chunk in chunks {
            stmt.execute(params![
                chunk.text,
                chunk.source_id,
                chunk.source_path,
                chunk.doc_type,
                chunk.chapter_id
            ])?;
        }
    }
    Ok(true)
}

/// Build the index if it does not exist yet; otherwise reuse it. A stale
/// index is tolerated; `rebuild_index` is the only refresh path.
pub fn ensure_index(project_root: &Path, db_path: &Path) -> Result<bool> {
    if db_path.exists() {
        return Ok(true);
    }
    rebuild_index(db_path, &iter_project_chunks(project_root))
}

/// Keyword search over the project corpus.
///
/// Uses the FTS index when available; degrades to a linear substring scan
/// when FTS5 is missing or the query still fails to parse. A query that
/// sanitizes to an empty string returns no hits without error.
pub fn search(
    project_root: &Path,
    db_path: &Path,
    query: &str,
    top_k: usize,
    filters: &SearchFilters,
) -> Result<Vec<RetrievalHit>> {
    let raw = query.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let fts_query = sanitize_query(raw);
    if fts_query.is_empty() {
        return Ok(Vec::new());
    }

    if ensure_index(project_root, db_path)? {
        let conn = connect(db_path)?;
        if ensure_fts(&conn) {
            match fts_search(&conn, &fts_query, top_k, filters) {
                Ok(hits) => return Ok(hits),
                Err(e) => {
                    debug!(error = %e, "FTS query failed, falling back to scan");
                }
            }
        }
    }

    Ok(fallback_scan(project_root, raw, top_k, filters))
}

fn fts_search(
    conn: &Connection,
    fts_query: &str,
    top_k: usize,
    filters: &SearchFilters,
) -> rusqlite::Result<Vec<RetrievalHit>> {
    let mut where_clause = String::from("chunks_fts MATCH ?1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(fts_query.to_string())];

    if let Some(types) = &filters.doc_types {
        let placeholders: Vec<String> = (0..types.len())
            .map(|i| format!("?{}", params_vec.len() + i + 1))
            .collect();
        where_clause.push_str(&format!(" AND doc_type IN ({})", placeholders.join(",")));
        for t in types {
            params_vec.push(Box::new(t.clone()));
        }
    }
    if let Some(min) = filters.chapter_min {
        where_clause.push_str(&format!(
            " AND (chapter_id IS NULL OR chapter_id >= ?{})",
            params_vec.len() + 1
        ));
        params_vec.push(Box::new(min));
    }
    if let Some(max) = filters.chapter_max {
        where_clause.push_str(&format!(
            " AND (chapter_id IS NULL OR chapter_id <= ?{})",
            params_vec.len() + 1
        ));
        params_vec.push(Box::new(max));
    }

    let sql = format!(
        "SELECT
           source_id,
           source_path,
           doc_type,
           chapter_id,
           -bm25(chunks_fts) AS score,
           snippet(chunks_fts, 0, '', '', '...', 20) AS excerpt
         FROM chunks_fts
         WHERE {where_clause}
         ORDER BY score DESC
         LIMIT ?{}",
        params_vec.len() + 1
    );
    params_vec.push(Box::new(top_k as i64));

    let mut stmt = conn.prepare(&sql)?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(params_ref.as_slice(), |row| {
        Ok(RetrievalHit {
            source_id: row.get(0)?,
            source_path: row.get(1)?,
            doc_type: row.get(2)?,
            chapter_id: row.get::<_, Option<u32>>(3)?,
            score: row.get(4)?,
            excerpt: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        })
    })?;
    rows.collect()
}

/// Index-free fallback: a simple substring scan, first `top_k` matches.
fn fallback_scan(
    project_root: &Path,
    query: &str,
    top_k: usize,
    filters: &SearchFilters,
) -> Vec<RetrievalHit> {
    let mut hits = Vec::new();
    for chunk in iter_project_chunks(project_root) {
        if !filters.accepts(&chunk.doc_type, chunk.chapter_id) {
            continue;
        }
        let Some(idx) = chunk.text.find(query) else {
            continue;
        };
        let excerpt = excerpt_around(&chunk.text, idx, query.len(), 40);
        hits.push(RetrievalHit {
            source_id: chunk.source_id,
            source_path: chunk.source_path,
            doc_type: chunk.doc_type,
            chapter_id: chunk.chapter_id,
            score: 1.0,
            excerpt,
        });
        if hits.len() >= top_k {
            break;
        }
    }
    hits
}

/// UTF-8-safe excerpt of `window` bytes on each side of a match.
fn excerpt_around(text: &str, idx: usize, match_len: usize, window: usize) -> String {
    let mut start = idx.saturating_sub(window);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (idx + match_len + window).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[start..end].replace('\n', " ")
}
