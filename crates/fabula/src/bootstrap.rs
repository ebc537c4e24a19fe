//! External collaborator contracts, with trivial offline defaults.
//!
//! The core consumes three collaborator interfaces: the bootstrap that
//! ensures bible assets exist before a run, the domain memory that rollback
//! must keep consistent with the filesystem, and the optional task queue
//! that wraps runs as background jobs. Richer implementations live outside
//! this crate; the rule-based defaults here keep the engine fully
//! operational offline.

use serde_json::{Value, json};

use crate::artifacts::ArtifactMeta;
use crate::error::{EngineError, Result};
use crate::store::{ArtifactStore, BibleDoc};

/// Result of ensuring background assets: the four bible documents plus the
/// structured requirements derived from the prompt.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub requirements: Value,
    pub world: Value,
    pub characters: Value,
    pub theme_conflict: Value,
    pub outline: Value,
}

/// Ensures the bible exists before a run. Idempotent: existing documents
/// are reused unless `allow_overwrite` is set.
pub trait Bootstrap: Send + Sync {
    fn ensure_background_assets(
        &self,
        store: &ArtifactStore,
        prompt: &str,
        num_chapters: u32,
        generator: &str,
        allow_overwrite: bool,
    ) -> Result<BootstrapResult>;
}

/// Keeps external domain memory consistent with the filesystem. Rollback
/// calls this after pruning artifacts.
pub trait DomainMemory: Send + Sync {
    /// Clear memory for chapters >= `chapter_gte` (all when `None`); when
    /// `scene_gte` is given, scene-level precision within the first cleared
    /// chapter is expected.
    fn clear(&self, project: &str, chapter_gte: Option<u32>, scene_gte: Option<u32>) -> Result<u64>;
}

/// Domain memory that holds nothing.
pub struct NoopDomainMemory;

impl DomainMemory for NoopDomainMemory {
    fn clear(&self, _project: &str, _chapter_gte: Option<u32>, _scene_gte: Option<u32>) -> Result<u64> {
        Ok(0)
    }
}

/// Optional background queue wrapper for runs.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, job: &str, project: &str) -> Result<String>;
    fn revoke(&self, task_id: &str) -> Result<()>;
    /// Register a handler invoked on queue shutdown. Implementations call
    /// the same shutdown-flag primitive the core polls.
    fn on_shutdown(&self, handler: Box<dyn Fn() + Send + Sync>);
}

/// Rule-based offline bootstrap.
///
/// Expands a short prompt into requirements and default bible documents.
/// Existing documents are loaded, never silently overwritten. Missing
/// documents with an empty prompt are a user error.
pub struct RuleBasedBootstrap;

/// Parse a short prompt into structured requirements.
pub fn parse_prompt(prompt: &str) -> Value {
    let text = prompt.trim();
    let lower = text.to_lowercase();

    let genre = if text.contains("修仙") || text.contains('仙') {
        "cultivation"
    } else if lower.contains("space") || lower.contains("star") {
        "space opera"
    } else if lower.contains("detective") || lower.contains("murder") {
        "mystery"
    } else {
        "secondary-world"
    };

    // A parenthesized list names the realms of the setting.
    let mut realms: Vec<String> = Vec::new();
    for (open, close) in [('(', ')'), ('（', '）')] {
        if let Some(start) = text.find(open) {
            if let Some(end) = text[start..].find(close) {
                let inside = &text[start + open.len_utf8()..start + end];
                realms = inside
                    .replace('，', ",")
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
        }
        if !realms.is_empty() {
            break;
        }
    }

    json!({
        "prompt": text,
        "genre": genre,
        "realms": realms,
        "constraints": [
            "fully invented setting",
            "internally consistent world rules",
            "expandable into a long-form serial",
        ],
    })
}

fn default_world(requirements: &Value) -> Value {
    let realms: Vec<String> = requirements
        .get("realms")
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_else(|| {
            vec![
                "the lowlands".to_string(),
                "the spirit reaches".to_string(),
                "the hollow deep".to_string(),
            ]
        });

    json!({
        "name": "the three realms",
        "genre": requirements.get("genre").and_then(Value::as_str).unwrap_or("secondary-world"),
        "realms": realms.iter().map(|r| json!({
            "name": r,
            "overview": format!("core ecology and power structure of {r}"),
        })).collect::<Vec<_>>(),
        "rules": [
            "power and resources obey cause and cost",
            "crossing between realms demands a price or an opening, and draws factional attention",
        ],
        "magic_system": {
            "core": "a discipline balanced on breath, craft and resolve",
            "stages": ["tempering", "foundation", "core", "soul", "transcendence"],
        },
        "factions": [
            {"name": "the Balance Compact", "realm": realms.first().cloned().unwrap_or_default(),
             "goal": "keep order and ration the flows"},
            {"name": "the Ember Court", "realm": realms.last().cloned().unwrap_or_default(),
             "goal": "break the seal and rewrite the rules"},
        ],
    })
}

fn default_characters(_requirements: &Value) -> Value {
    json!({
        "protagonist": {
            "name": "Lin Che",
            "role": "protagonist",
            "traits": ["restrained", "curious", "unyielding"],
            "wants": "strength, and the truth of an obscured origin",
            "fear": "becoming an instrument of someone else's design",
            "secret": "carries a sealed key between the realms",
        },
        "supporting": [
            {"name": "Shen Lan", "role": "companion", "traits": ["calm", "sharp"],
             "wants": "to restore a fallen school"},
            {"name": "Mo Que", "role": "rival", "traits": ["proud", "decisive"],
             "wants": "to prove a claimed destiny"},
        ],
        "antagonist": {
            "name": "the Ember Sovereign",
            "role": "antagonist",
            "wants": "to undo the seal and unify the realms",
            "methods": ["temptation", "bargains", "sacrifice"],
        },
    })
}

fn default_theme_conflict(_requirements: &Value) -> Value {
    json!({
        "theme": "freedom and its price",
        "core_question": "does gaining power always cost the self?",
        "conflict": {
            "external": "the realms contend for crossing rights and the sealed key",
            "internal": "the protagonist chooses between integrity and leverage",
        },
        "stakes": [
            "personal: the protagonist's fate and sense of self",
            "world: the order of the realms and everyone living under it",
        ],
    })
}

fn default_outline(_requirements: &Value, num_chapters: u32) -> Value {
    let chapters: Vec<Value> = (1..=num_chapters)
        .map(|i| {
            json!({
                "chapter_id": i,
                "pov": "Lin Che",
                "goal": format!("chapter {i}: push the main line forward and win a key lead"),
                "conflict": "resistance from factional play and personal limits",
                "turn": "an accident exposes a corner of the larger design",
                "threads": [format!("T-{i:02}")],
                "must_include": ["world texture", "motive progression"],
                "must_avoid": ["explaining the final mystery early"],
            })
        })
        .collect();

    json!({
        "num_chapters": num_chapters,
        "chapters": chapters,
        "high_level_arc": [
            "opening: drawn into the game",
            "development: costs surface",
            "reversal: the truth closes in",
            "climax: the choice and its price",
        ],
    })
}

fn is_empty_doc(value: &Value) -> bool {
    value.as_object().map(|o| o.is_empty()).unwrap_or(true)
}

impl Bootstrap for RuleBasedBootstrap {
    fn ensure_background_assets(
        &self,
        store: &ArtifactStore,
        prompt: &str,
        num_chapters: u32,
        generator: &str,
        allow_overwrite: bool,
    ) -> Result<BootstrapResult> {
        let prompt = prompt.trim();
        let mut requirements = if prompt.is_empty() {
            Value::Object(Default::default())
        } else {
            parse_prompt(prompt)
        };

        let mut world = store.read_bible(BibleDoc::World)?;
        let mut characters = store.read_bible(BibleDoc::Characters)?;
        let mut theme_conflict = store.read_bible(BibleDoc::ThemeConflict)?;
        let mut outline = store.read_bible(BibleDoc::Outline)?;

        let missing_any = is_empty_doc(&world)
            || is_empty_doc(&characters)
            || is_empty_doc(&theme_conflict)
            || is_empty_doc(&outline);
        if missing_any && prompt.is_empty() {
            return Err(EngineError::user(
                "project is missing bible assets (world/characters/theme_conflict/outline) and no prompt was given",
            ));
        }

        let stamp = |mut doc: Value| -> Value {
            if let Value::Object(map) = &mut doc {
                let meta = ArtifactMeta::now(generator);
                map.insert("schema_version".to_string(), meta.schema_version.into());
                map.insert("generated_at".to_string(), meta.generated_at.into());
                map.insert("generator".to_string(), meta.generator.into());
            }
            doc
        };

        if is_empty_doc(&world) || allow_overwrite {
            world = stamp(default_world(&requirements));
            store.write_bible(BibleDoc::World, &world)?;
        }
        if is_empty_doc(&characters) || allow_overwrite {
            characters = stamp(default_characters(&requirements));
            store.write_bible(BibleDoc::Characters, &characters)?;
        }
        if is_empty_doc(&theme_conflict) || allow_overwrite {
            theme_conflict = stamp(default_theme_conflict(&requirements));
            store.write_bible(BibleDoc::ThemeConflict, &theme_conflict)?;
        }
        if is_empty_doc(&outline) || allow_overwrite {
            outline = stamp(default_outline(&requirements, num_chapters));
            store.write_bible(BibleDoc::Outline, &outline)?;
        }

        if is_empty_doc(&requirements) && !prompt.is_empty() {
            requirements = json!({"prompt": prompt});
        }

        Ok(BootstrapResult {
            requirements,
            world,
            characters,
            theme_conflict,
            outline,
        })
    }
}
