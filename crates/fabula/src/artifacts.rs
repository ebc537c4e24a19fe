//! Typed shapes for every persisted artifact.
//!
//! Each artifact carries the shared metadata triple
//! (`schema_version`, `generated_at`, `generator`) and captures unknown
//! fields instead of rejecting them, so artifacts written by newer
//! generators keep round-tripping through older binaries.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current schema version stamped on newly written artifacts.
pub const SCHEMA_VERSION: &str = "1.0";

/// Engine identifier used as the leading segment of `generator` strings.
pub const ENGINE_ID: &str = "fabula";

/// Format the generator string `<engine-id>/<run_id>/<revision_id>`.
pub fn generator_string(run_id: &str, revision_id: &str) -> String {
    format!("{ENGINE_ID}/{run_id}/{revision_id}")
}

/// Required metadata on every persisted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// ISO-8601 UTC timestamp of generation.
    #[serde(default)]
    pub generated_at: String,
    /// `<engine-id>/<run_id>/<revision_id>`.
    #[serde(default = "default_generator")]
    pub generator: String,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_generator() -> String {
    ENGINE_ID.to_string()
}

impl Default for ArtifactMeta {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            generated_at: String::new(),
            generator: default_generator(),
        }
    }
}

impl ArtifactMeta {
    /// Fresh metadata stamped with the current UTC time.
    pub fn now(generator: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            generator: generator.into(),
        }
    }
}

/// `settings.json` - project identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: String,
    /// Planned chapter count, recorded at init time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_chapters: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Issue severity. The enumeration is strict: anything else fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    Major,
    Minor,
}

/// Issue category. Strict enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    WorldRule,
    Character,
    Timeline,
    Knowledge,
    Thread,
    PovStyle,
}

/// A single audit finding produced by a plugin.
///
/// Issues do not carry their own artifact metadata; the file that persists
/// them (`consistency_reports.json`) provides it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Issue identifier, e.g. `I-001-002`.
    pub id: String,
    pub severity: Severity,
    pub category: Category,
    /// Human-readable summary.
    pub summary: String,
    /// Chapter quotes, bible references and other supporting material.
    #[serde(default)]
    pub evidence: Map<String, Value>,
    /// Actionable fix guidance. Required to be non-empty for blockers.
    #[serde(default)]
    pub fix_instructions: String,
    /// Alternative fix strategies.
    #[serde(default)]
    pub fix_options: Vec<Value>,
}

/// Planned scene inside a chapter plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScenePlan {
    pub scene_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub key_actions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `chapters/chapter_<nnn>_plan.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChapterPlan {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub chapter_id: u32,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub revision_id: String,
    /// Point-of-view character.
    #[serde(default)]
    pub pov: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub conflict: String,
    /// Key turn or twist.
    #[serde(default)]
    pub turn: String,
    #[serde(default)]
    pub reveal: Vec<String>,
    /// Thread identifiers this chapter advances.
    #[serde(default)]
    pub threads_advance: Vec<String>,
    #[serde(default)]
    pub must_include: Vec<String>,
    #[serde(default)]
    pub must_avoid: Vec<String>,
    #[serde(default)]
    pub scenes: Vec<ScenePlan>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A written scene inside chapter content.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Scene {
    pub scene_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `chapters/chapter_<nnn>.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChapterContent {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub chapter_id: u32,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub revision_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub word_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregated audit outcome for one chapter revision (checkpointed, and the
/// source of the chapter's reports entry).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditResult {
    pub chapter_id: u32,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub blocker_count: u32,
    #[serde(default)]
    pub major_count: u32,
    #[serde(default)]
    pub minor_count: u32,
    /// Suggested updates to bible/memory. Reserved; plugins may fill it.
    #[serde(default)]
    pub updates: Map<String, Value>,
    #[serde(default)]
    pub major_over_threshold: bool,
    #[serde(default)]
    pub qa_major_max: u32,
}

/// Per-chapter entry in `consistency_reports.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportEntry {
    pub chapter_id: u32,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub blocker_count: u32,
    #[serde(default)]
    pub major_count: u32,
    #[serde(default)]
    pub minor_count: u32,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub major_over_threshold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_major_max: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `consistency_reports.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportsFile {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    /// Entries keyed by decimal chapter id.
    #[serde(default)]
    pub chapters: BTreeMap<String, ReportEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-chapter entry in `chapter_memory.json`.
///
/// Richer shapes (timeline anchors, per-character states) ride along in
/// `extra`; only this narrow set is required.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryEntry {
    pub chapter_id: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub scene_count: u32,
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub updated_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `chapter_memory.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryFile {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    #[serde(default)]
    pub chapters: BTreeMap<String, MemoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A traceable retrieved source inside a context pack.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextSource {
    /// Stable source id, e.g. `file:world.json`.
    pub source_id: String,
    /// Path relative to the project root.
    pub source_path: String,
    /// `world`, `characters`, `outline`, `chapter_content`, ...
    pub doc_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<u32>,
    /// Retrieval score; higher is more relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub excerpt: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Top-level bible picks carried in every context pack.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BibleSummary {
    #[serde(default)]
    pub world_name: String,
    #[serde(default)]
    pub protagonist: String,
    #[serde(default)]
    pub theme: String,
}

/// Deterministic context every generation step receives.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequiredContext {
    /// Outline entry for the current chapter (empty object if absent).
    #[serde(default)]
    pub outline_current: Value,
    #[serde(default)]
    pub bible_summary: BibleSummary,
    /// Memory entries for the trailing three chapters.
    #[serde(default)]
    pub recent_memory: Vec<MemoryEntry>,
    /// Reports whose blocker count still exceeds the QA threshold.
    #[serde(default)]
    pub open_blocker_reports: Vec<ReportEntry>,
}

/// The assembled context pack a generation step consumes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextPack {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub project_name: String,
    pub chapter_id: u32,
    /// Retrieval query, usually the user prompt.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub required: RequiredContext,
    #[serde(default)]
    pub retrieved: Vec<ContextSource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
