//! The checkpointed workflow state.
//!
//! State is a shared blackboard: graph nodes communicate only through it,
//! and each node returns an incremental [`StateUpdate`] in which absent
//! fields mean "unchanged". The engine snapshots the full state after every
//! node transition; each top-level field is one checkpoint channel.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifacts::{AuditResult, ChapterContent, ChapterPlan, ContextPack};
use crate::error::{EngineError, Result};

/// Generate a fresh run identifier: `run_<yyyymmdd_hhmmss>_<8 hex>`.
pub fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix: u32 = rand::random();
    format!("run_{stamp}_{suffix:08x}")
}

/// Compose the revision identifier for a (chapter, round) pair:
/// `<run_id>_ch<chapter:03>_r<round>`.
pub fn revision_id_for(run_id: &str, chapter_id: u32, revision_round: u32) -> String {
    format!("{run_id}_ch{chapter_id:03}_r{revision_round}")
}

/// Workflow state - the shared blackboard for all graph nodes.
///
/// Field groups:
/// - identifiers: run, project, prompt-derived requirements
/// - bible: world / characters / theme-conflict / outline (read-only for
///   the life of a run)
/// - runtime control: chapter cursor, revision loop counters, QA thresholds
/// - transient per-chapter artifacts: plan, draft, audit, context pack
/// - terminal flags
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct State {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub project_name: String,

    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub requirements: Value,

    // Bible (single source of truth; immutable during a run)
    #[serde(default)]
    pub world: Value,
    #[serde(default)]
    pub characters: Value,
    #[serde(default)]
    pub theme_conflict: Value,
    #[serde(default)]
    pub outline: Value,

    // Runtime control
    #[serde(default)]
    pub current_chapter: u32,
    #[serde(default)]
    pub num_chapters: u32,
    #[serde(default)]
    pub revision_round: u32,
    #[serde(default)]
    pub revision_id: String,
    #[serde(default)]
    pub max_revision_rounds: u32,
    /// Blockers must be <= this to advance (usually 0).
    #[serde(default)]
    pub qa_blocker_max: u32,
    /// Majors above this only warn.
    #[serde(default)]
    pub qa_major_max: u32,

    // Transient per-chapter artifacts (in memory until stored)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_plan: Option<ChapterPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_draft: Option<ChapterContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_result: Option<AuditResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_pack: Option<ContextPack>,

    // Terminal flags
    #[serde(default)]
    pub needs_human_review: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl State {
    /// Create the initial state for a new workflow run.
    pub fn initial(
        project_name: &str,
        num_chapters: u32,
        prompt: &str,
        max_revision_rounds: u32,
        qa_blocker_max: u32,
        qa_major_max: u32,
    ) -> Self {
        let run_id = new_run_id();
        let revision_id = revision_id_for(&run_id, 1, 0);
        Self {
            run_id,
            project_name: project_name.to_string(),
            prompt: prompt.to_string(),
            requirements: Value::Object(Map::new()),
            world: Value::Object(Map::new()),
            characters: Value::Object(Map::new()),
            theme_conflict: Value::Object(Map::new()),
            outline: Value::Object(Map::new()),
            current_chapter: 1,
            num_chapters,
            revision_round: 0,
            revision_id,
            max_revision_rounds,
            qa_blocker_max,
            qa_major_max,
            chapter_plan: None,
            chapter_draft: None,
            audit_result: None,
            context_pack: None,
            needs_human_review: false,
            completed: false,
            error: None,
        }
    }

    /// The generator string for the current revision:
    /// `<engine-id>/<run_id>/<revision_id>`.
    pub fn generator(&self) -> String {
        crate::artifacts::generator_string(&self.run_id, &self.revision_id)
    }

    /// Apply an incremental update. Absent fields are left unchanged;
    /// transient artifacts carry a double option so updates can clear them.
    pub fn apply(&mut self, update: &StateUpdate) {
        if let Some(v) = &update.world {
            self.world = v.clone();
        }
        if let Some(v) = &update.characters {
            self.characters = v.clone();
        }
        if let Some(v) = &update.theme_conflict {
            self.theme_conflict = v.clone();
        }
        if let Some(v) = &update.outline {
            self.outline = v.clone();
        }
        if let Some(v) = &update.requirements {
            self.requirements = v.clone();
        }
        if let Some(v) = update.current_chapter {
            self.current_chapter = v;
        }
        if let Some(v) = update.revision_round {
            self.revision_round = v;
        }
        if let Some(v) = &update.revision_id {
            self.revision_id = v.clone();
        }
        if let Some(v) = &update.chapter_plan {
            self.chapter_plan = v.clone();
        }
        if let Some(v) = &update.chapter_draft {
            self.chapter_draft = v.clone();
        }
        if let Some(v) = &update.audit_result {
            self.audit_result = v.clone();
        }
        if let Some(v) = &update.context_pack {
            self.context_pack = v.clone();
        }
        if let Some(v) = update.needs_human_review {
            self.needs_human_review = v;
        }
        if let Some(v) = update.completed {
            self.completed = v;
        }
        if let Some(v) = &update.error {
            self.error = v.clone();
        }
    }

    /// Serialize the state into named channels, one per top-level field.
    pub fn to_channels(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(EngineError::Storage(format!(
                "state serialized to non-object: {other}"
            ))),
        }
    }

    /// Rebuild a state from channel values (missing channels take their
    /// defaults).
    pub fn from_channels(channels: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(channels))
            .map_err(|e| EngineError::Corruption(format!("cannot rebuild state: {e}")))
    }
}

/// Incremental state update returned by a graph node.
///
/// `None` means "unchanged". For the four transient artifacts the inner
/// option distinguishes "set to this value" from "clear".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_conflict: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chapter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_plan: Option<Option<ChapterPlan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_draft: Option<Option<ChapterContent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_result: Option<Option<AuditResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_pack: Option<Option<ContextPack>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_human_review: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.changed_channels().is_empty()
    }

    /// Names of the channels this update touches.
    pub fn changed_channels(&self) -> Vec<&'static str> {
        let mut channels = Vec::new();
        if self.requirements.is_some() {
            channels.push("requirements");
        }
        if self.world.is_some() {
            channels.push("world");
        }
        if self.characters.is_some() {
            channels.push("characters");
        }
        if self.theme_conflict.is_some() {
            channels.push("theme_conflict");
        }
        if self.outline.is_some() {
            channels.push("outline");
        }
        if self.current_chapter.is_some() {
            channels.push("current_chapter");
        }
        if self.revision_round.is_some() {
            channels.push("revision_round");
        }
        if self.revision_id.is_some() {
            channels.push("revision_id");
        }
        if self.chapter_plan.is_some() {
            channels.push("chapter_plan");
        }
        if self.chapter_draft.is_some() {
            channels.push("chapter_draft");
        }
        if self.audit_result.is_some() {
            channels.push("audit_result");
        }
        if self.context_pack.is_some() {
            channels.push("context_pack");
        }
        if self.needs_human_review.is_some() {
            channels.push("needs_human_review");
        }
        if self.completed.is_some() {
            channels.push("completed");
        }
        if self.error.is_some() {
            channels.push("error");
        }
        channels
    }

    /// Serialize this update as `(channel, value)` pairs for pending-write
    /// recording. Cleared transients become JSON null.
    pub fn to_channel_values(&self) -> Result<Vec<(String, Value)>> {
        let mut writes = Vec::new();
        let mut push = |name: &str, value: Value| {
            writes.push((name.to_string(), value));
        };

        if let Some(v) = &self.requirements {
            push("requirements", v.clone());
        }
        if let Some(v) = &self.world {
            push("world", v.clone());
        }
        if let Some(v) = &self.characters {
            push("characters", v.clone());
        }
        if let Some(v) = &self.theme_conflict {
            push("theme_conflict", v.clone());
        }
        if let Some(v) = &self.outline {
            push("outline", v.clone());
        }
        if let Some(v) = self.current_chapter {
            push("current_chapter", Value::from(v));
        }
        if let Some(v) = self.revision_round {
            push("revision_round", Value::from(v));
        }
        if let Some(v) = &self.revision_id {
            push("revision_id", Value::from(v.clone()));
        }
        if let Some(v) = &self.chapter_plan {
            push("chapter_plan", serde_json::to_value(v)?);
        }
        if let Some(v) = &self.chapter_draft {
            push("chapter_draft", serde_json::to_value(v)?);
        }
        if let Some(v) = &self.audit_result {
            push("audit_result", serde_json::to_value(v)?);
        }
        if let Some(v) = &self.context_pack {
            push("context_pack", serde_json::to_value(v)?);
        }
        if let Some(v) = self.needs_human_review {
            push("needs_human_review", Value::from(v));
        }
        if let Some(v) = self.completed {
            push("completed", Value::from(v));
        }
        if let Some(v) = &self.error {
            push("error", serde_json::to_value(v)?);
        }
        Ok(writes)
    }

    /// Rebuild an update from recorded `(channel, value)` pairs. Null values
    /// on transient channels mean "clear".
    pub fn from_channel_values(pairs: &[(String, Value)]) -> Result<Self> {
        let mut update = StateUpdate::default();
        for (channel, value) in pairs {
            match channel.as_str() {
                "requirements" => update.requirements = Some(value.clone()),
                "world" => update.world = Some(value.clone()),
                "characters" => update.characters = Some(value.clone()),
                "theme_conflict" => update.theme_conflict = Some(value.clone()),
                "outline" => update.outline = Some(value.clone()),
                "current_chapter" => {
                    update.current_chapter = Some(serde_json::from_value(value.clone())?)
                }
                "revision_round" => {
                    update.revision_round = Some(serde_json::from_value(value.clone())?)
                }
                "revision_id" => {
                    update.revision_id = Some(serde_json::from_value(value.clone())?)
                }
                "chapter_plan" => {
                    update.chapter_plan = Some(serde_json::from_value(value.clone())?)
                }
                "chapter_draft" => {
                    update.chapter_draft = Some(serde_json::from_value(value.clone())?)
                }
                "audit_result" => {
                    update.audit_result = Some(serde_json::from_value(value.clone())?)
                }
                "context_pack" => {
                    update.context_pack = Some(serde_json::from_value(value.clone())?)
                }
                "needs_human_review" => {
                    update.needs_human_review = Some(serde_json::from_value(value.clone())?)
                }
                "completed" => update.completed = Some(serde_json::from_value(value.clone())?),
                "error" => update.error = Some(serde_json::from_value(value.clone())?),
                other => {
                    return Err(EngineError::Corruption(format!(
                        "unknown state channel in pending writes: {other}"
                    )));
                }
            }
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_expected_shape() {
        let id = new_run_id();
        assert!(id.starts_with("run_"));
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn revision_id_pads_chapter_to_three_digits() {
        assert_eq!(revision_id_for("run_x", 7, 2), "run_x_ch007_r2");
        assert_eq!(revision_id_for("run_x", 123, 0), "run_x_ch123_r0");
    }

    #[test]
    fn initial_state_starts_at_chapter_one_round_zero() {
        let state = State::initial("demo", 3, "a prompt", 3, 0, 3);
        assert_eq!(state.current_chapter, 1);
        assert_eq!(state.revision_round, 0);
        assert_eq!(
            state.revision_id,
            revision_id_for(&state.run_id, 1, 0)
        );
        assert!(!state.completed);
        assert!(!state.needs_human_review);
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let mut state = State::initial("demo", 2, "", 3, 0, 3);
        let before_revision = state.revision_id.clone();

        let update = StateUpdate {
            current_chapter: Some(2),
            ..Default::default()
        };
        state.apply(&update);

        assert_eq!(state.current_chapter, 2);
        assert_eq!(state.revision_id, before_revision);
        assert_eq!(state.num_chapters, 2);
    }

    #[test]
    fn apply_can_clear_transient_artifacts() {
        let mut state = State::initial("demo", 1, "", 3, 0, 3);
        state.chapter_plan = Some(ChapterPlan {
            chapter_id: 1,
            ..Default::default()
        });

        let update = StateUpdate {
            chapter_plan: Some(None),
            ..Default::default()
        };
        state.apply(&update);

        assert!(state.chapter_plan.is_none());
    }

    #[test]
    fn channels_roundtrip_preserves_state() {
        let mut state = State::initial("demo", 2, "prompt text", 3, 0, 3);
        state.current_chapter = 2;
        state.revision_round = 1;
        state.needs_human_review = true;

        let channels = state.to_channels().unwrap();
        assert!(channels.contains_key("run_id"));
        assert!(channels.contains_key("current_chapter"));

        let rebuilt = State::from_channels(channels).unwrap();
        assert_eq!(rebuilt.run_id, state.run_id);
        assert_eq!(rebuilt.current_chapter, 2);
        assert_eq!(rebuilt.revision_round, 1);
        assert!(rebuilt.needs_human_review);
    }

    #[test]
    fn update_channel_values_roundtrip_preserves_clears() {
        let update = StateUpdate {
            current_chapter: Some(4),
            chapter_plan: Some(None),
            chapter_draft: Some(Some(ChapterContent {
                chapter_id: 3,
                ..Default::default()
            })),
            ..Default::default()
        };

        let pairs = update.to_channel_values().unwrap();
        let rebuilt = StateUpdate::from_channel_values(&pairs).unwrap();

        assert_eq!(rebuilt.current_chapter, Some(4));
        assert!(matches!(rebuilt.chapter_plan, Some(None)));
        let draft = rebuilt.chapter_draft.unwrap().unwrap();
        assert_eq!(draft.chapter_id, 3);
    }

    #[test]
    fn update_reports_changed_channels() {
        let update = StateUpdate {
            chapter_draft: Some(None),
            completed: Some(true),
            ..Default::default()
        };
        let channels = update.changed_channels();
        assert_eq!(channels, vec!["chapter_draft", "completed"]);
        assert!(!update.is_empty());
        assert!(StateUpdate::default().is_empty());
    }
}
