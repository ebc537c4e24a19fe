//! Audit plugins and the audit runner.
//!
//! Plugins are pure analysis components: they read the state and the audit
//! context and produce structured issues. They must not touch the
//! filesystem or any external store. Registration is explicit: the
//! registry is populated from a static constructor list at engine
//! construction, never by import side effects.

use serde_json::Value;

use crate::artifacts::{AuditResult, Category, ChapterPlan, ContextPack, Issue, Severity};
use crate::error::{EngineError, Result};
use crate::schema;
use crate::state::State;

/// Marker the template patcher strips; drafts that still carry it are not
/// publishable.
pub const PLACEHOLDER_MARKER: &str = "[DRAFT PENDING]";

/// Read-only context assembled for one audit pass.
#[derive(Debug, Clone, Copy)]
pub struct AuditContext<'a> {
    pub world: &'a Value,
    pub characters: &'a Value,
    pub outline: &'a Value,
    pub theme_conflict: &'a Value,
    pub chapter_plan: Option<&'a ChapterPlan>,
    pub context_pack: Option<&'a ContextPack>,
}

impl<'a> AuditContext<'a> {
    pub fn from_state(state: &'a State) -> Self {
        Self {
            world: &state.world,
            characters: &state.characters,
            outline: &state.outline,
            theme_conflict: &state.theme_conflict,
            chapter_plan: state.chapter_plan.as_ref(),
            context_pack: state.context_pack.as_ref(),
        }
    }
}

/// A pure audit analysis component.
pub trait AuditPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Analyze the current chapter draft and return structured issues.
    fn analyze(&self, state: &State, context: &AuditContext<'_>) -> Vec<Issue>;
}

/// No-op plugin that always passes. Useful for exercising the workflow
/// without real consistency checks.
pub struct NoopPlugin;

impl AuditPlugin for NoopPlugin {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn description(&self) -> &'static str {
        "No-op plugin that always passes"
    }

    fn analyze(&self, _state: &State, _context: &AuditContext<'_>) -> Vec<Issue> {
        Vec::new()
    }
}

/// Built-in continuity checks.
///
/// Flags a chapter with zero scenes, and a chapter whose scenes still carry
/// the placeholder marker or whose word count is zero. Both findings are
/// blockers with fix instructions, which is what drives the revision loop
/// to converge.
pub struct ContinuityPlugin;

impl AuditPlugin for ContinuityPlugin {
    fn name(&self) -> &'static str {
        "continuity"
    }

    fn description(&self) -> &'static str {
        "Checks for narrative consistency issues"
    }

    fn analyze(&self, state: &State, _context: &AuditContext<'_>) -> Vec<Issue> {
        let mut issues = Vec::new();
        let Some(draft) = &state.chapter_draft else {
            return issues;
        };
        let chapter_id = state.current_chapter.max(1);

        if draft.scenes.is_empty() {
            issues.push(Issue {
                id: format!("I-{chapter_id:03}-001"),
                severity: Severity::Blocker,
                category: Category::WorldRule,
                summary: "chapter has no scenes".to_string(),
                evidence: evidence(&[
                    ("chapter_id", Value::from(chapter_id)),
                    ("missing", Value::from("scenes")),
                ]),
                fix_instructions: "add at least one scene to the chapter".to_string(),
                fix_options: vec![],
            });
        }

        if !draft.scenes.is_empty() {
            let any_placeholder = draft
                .scenes
                .iter()
                .any(|scene| scene.content.contains(PLACEHOLDER_MARKER));
            if any_placeholder || draft.word_count == 0 {
                issues.push(Issue {
                    id: format!("I-{chapter_id:03}-002"),
                    severity: Severity::Blocker,
                    category: Category::PovStyle,
                    summary: "chapter body still contains placeholder text or has zero words"
                        .to_string(),
                    evidence: evidence(&[
                        ("chapter_id", Value::from(chapter_id)),
                        ("word_count", Value::from(draft.word_count)),
                    ]),
                    fix_instructions:
                        "write real prose, remove the placeholder marker and recount word_count"
                            .to_string(),
                    fix_options: vec![],
                });
            }
        }

        issues
    }
}

fn evidence(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Holds audit plugins in registration order.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn AuditPlugin>>,
}

impl PluginRegistry {
    /// Empty registry, for callers that wire their own set.
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// The default set: noop first, then the built-in continuity checks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(NoopPlugin));
        registry.register(Box::new(ContinuityPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Box<dyn AuditPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn get(&self, name: &str) -> Option<&dyn AuditPlugin> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn plugins(&self) -> &[Box<dyn AuditPlugin>] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Run every registered plugin and aggregate their findings.
///
/// Each plugin's output is validated before aggregation; invalid output is
/// a fatal error for the run, not a silent drop, so malformed issues can
/// never corrupt the reports file.
pub fn run_audit(registry: &PluginRegistry, state: &State) -> Result<AuditResult> {
    let context = AuditContext::from_state(state);
    let chapter_id = state.current_chapter.max(1);

    let mut all_issues: Vec<Issue> = Vec::new();
    for plugin in registry.plugins() {
        let issues = plugin.analyze(state, &context);
        let validation = schema::validate_issues(&issues);
        if !validation.is_valid() {
            return Err(EngineError::validation(
                format!("plugin '{}' output", plugin.name()),
                validation.issues,
            ));
        }
        all_issues.extend(issues);
    }

    let count = |severity: Severity| {
        all_issues.iter().filter(|i| i.severity == severity).count() as u32
    };
    let blocker_count = count(Severity::Blocker);
    let major_count = count(Severity::Major);
    let minor_count = count(Severity::Minor);

    Ok(AuditResult {
        chapter_id,
        issues: all_issues,
        blocker_count,
        major_count,
        minor_count,
        updates: Default::default(),
        major_over_threshold: major_count > state.qa_major_max,
        qa_major_max: state.qa_major_max,
    })
}
