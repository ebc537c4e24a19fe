//! Provider contracts for the generation steps.
//!
//! The graph nodes never call a language model directly; they depend on the
//! [`Planner`], [`Writer`] and [`Patcher`] traits and get implementations
//! injected. The deterministic template providers below are the defaults,
//! used for tests and offline operation: the template writer's output is
//! non-placeholder by construction, so under defaults the revision loop
//! converges in a single attempt.

use serde_json::Value;

use crate::artifacts::{ArtifactMeta, ChapterContent, ChapterPlan, Issue, Scene, ScenePlan, Severity};
use crate::error::Result;
use crate::plugins::PLACEHOLDER_MARKER;
use crate::state::State;

/// Produces a structured chapter plan from the outline and context.
pub trait Planner: Send + Sync {
    fn plan(&self, state: &State, context_pack: Option<&crate::artifacts::ContextPack>)
    -> Result<ChapterPlan>;
}

/// Produces chapter content from a plan.
pub trait Writer: Send + Sync {
    fn write(
        &self,
        state: &State,
        plan: &ChapterPlan,
        context_pack: Option<&crate::artifacts::ContextPack>,
    ) -> Result<ChapterContent>;
}

/// Applies a minimal revision that attempts to resolve the given blockers.
pub trait Patcher: Send + Sync {
    fn apply(
        &self,
        state: &State,
        draft: &ChapterContent,
        blocker_issues: &[Issue],
        context_pack: Option<&crate::artifacts::ContextPack>,
    ) -> Result<ChapterContent>;
}

/// The provider trio a graph is built with.
pub struct GenerationProviders {
    pub planner: Box<dyn Planner>,
    pub writer: Box<dyn Writer>,
    pub patcher: Box<dyn Patcher>,
}

impl GenerationProviders {
    /// Deterministic template defaults.
    pub fn templates() -> Self {
        Self {
            planner: Box::new(TemplatePlanner),
            writer: Box::new(TemplateWriter),
            patcher: Box::new(TemplatePatcher),
        }
    }
}

/// Word count as whitespace-stripped character count, so CJK prose counts
/// per character and Latin prose per letter rather than per token.
pub fn word_count(text: &str) -> u64 {
    text.chars().filter(|c| !c.is_whitespace()).count() as u64
}

fn protagonist_name(characters: &Value) -> String {
    characters
        .get("protagonist")
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("the protagonist")
        .to_string()
}

fn outline_entry(state: &State) -> Value {
    state
        .outline
        .get("chapters")
        .and_then(Value::as_array)
        .and_then(|chapters| chapters.get((state.current_chapter as usize).saturating_sub(1)))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()))
}

fn str_field(value: &Value, key: &str, fallback: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| fallback.to_string())
}

fn str_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Template planner: derives the plan from the outline entry for the
/// current chapter, filling gaps with stable defaults.
pub struct TemplatePlanner;

impl Planner for TemplatePlanner {
    fn plan(
        &self,
        state: &State,
        _context_pack: Option<&crate::artifacts::ContextPack>,
    ) -> Result<ChapterPlan> {
        let chapter_id = state.current_chapter.max(1);
        let entry = outline_entry(state);
        let protagonist = protagonist_name(&state.characters);

        let location = state
            .world
            .get("realms")
            .and_then(Value::as_array)
            .and_then(|realms| realms.first())
            .map(|realm| match realm {
                Value::Object(_) => str_field(realm, "name", "the old road beyond the walls"),
                other => other.as_str().unwrap_or("the old road beyond the walls").to_string(),
            })
            .unwrap_or_else(|| "the old road beyond the walls".to_string());

        let scenes = vec![ScenePlan {
            scene_id: format!("{chapter_id}_1"),
            location,
            characters: vec![protagonist.clone()],
            purpose: "establish the chapter goal and its resistance".to_string(),
            key_actions: vec![
                "uncover a lead".to_string(),
                "meet resistance".to_string(),
                "make a choice".to_string(),
            ],
            extra: Default::default(),
        }];

        Ok(ChapterPlan {
            meta: ArtifactMeta::now(state.generator()),
            chapter_id,
            run_id: state.run_id.clone(),
            revision_id: state.revision_id.clone(),
            pov: str_field(&entry, "pov", &protagonist),
            goal: str_field(&entry, "goal", &format!("chapter {chapter_id} objective")),
            conflict: str_field(&entry, "conflict", "resistance and its price"),
            turn: str_field(&entry, "turn", "an unexpected reversal"),
            reveal: str_list(&entry, "reveal"),
            threads_advance: str_list(&entry, "threads"),
            must_include: str_list(&entry, "must_include"),
            must_avoid: str_list(&entry, "must_avoid"),
            scenes,
            extra: Default::default(),
        })
    }
}

/// Template writer: composes non-placeholder prose from the plan.
pub struct TemplateWriter;

impl Writer for TemplateWriter {
    fn write(
        &self,
        state: &State,
        plan: &ChapterPlan,
        _context_pack: Option<&crate::artifacts::ContextPack>,
    ) -> Result<ChapterContent> {
        let chapter_id = state.current_chapter.max(1);
        let pov = if plan.pov.is_empty() {
            protagonist_name(&state.characters)
        } else {
            plan.pov.clone()
        };

        let mut scenes = Vec::with_capacity(plan.scenes.len());
        for (idx, scene_plan) in plan.scenes.iter().enumerate() {
            let location = if scene_plan.location.is_empty() {
                "an unnamed place".to_string()
            } else {
                scene_plan.location.clone()
            };
            let content = format!(
                "At {location}, {pov} kept a steady head and held to the chapter's aim: {goal}. \
                 Resistance surfaced almost at once, because {conflict}. \
                 Between hesitation and resolve the path narrowed, and when {turn}, \
                 the ground of the story shifted for good.",
                goal = plan.goal,
                conflict = plan.conflict,
                turn = plan.turn,
            );
            scenes.push(Scene {
                scene_id: if scene_plan.scene_id.is_empty() {
                    format!("{chapter_id}_{}", idx + 1)
                } else {
                    scene_plan.scene_id.clone()
                },
                location,
                characters: if scene_plan.characters.is_empty() {
                    vec![pov.clone()]
                } else {
                    scene_plan.characters.clone()
                },
                purpose: scene_plan.purpose.clone(),
                content,
                extra: Default::default(),
            });
        }

        let full_text: String = scenes
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ChapterContent {
            meta: ArtifactMeta::now(state.generator()),
            chapter_id,
            run_id: state.run_id.clone(),
            revision_id: state.revision_id.clone(),
            title: format!("Chapter {chapter_id}"),
            scenes,
            word_count: word_count(&full_text),
            extra: Default::default(),
        })
    }
}

/// Template patcher: the smallest edit that resolves the blockers. Strips
/// the placeholder marker, appends a revision note to the first scene, and
/// recounts words.
pub struct TemplatePatcher;

impl Patcher for TemplatePatcher {
    fn apply(
        &self,
        _state: &State,
        draft: &ChapterContent,
        blocker_issues: &[Issue],
        _context_pack: Option<&crate::artifacts::ContextPack>,
    ) -> Result<ChapterContent> {
        let mut patched = draft.clone();
        let blockers: Vec<&Issue> = blocker_issues
            .iter()
            .filter(|i| i.severity == Severity::Blocker)
            .collect();
        if blockers.is_empty() {
            return Ok(patched);
        }

        if patched.scenes.is_empty() {
            patched.scenes.push(Scene {
                scene_id: format!("{}_1", patched.chapter_id.max(1)),
                location: "an unnamed place".to_string(),
                characters: vec![],
                purpose: "carry the chapter".to_string(),
                content: String::new(),
                extra: Default::default(),
            });
        }

        let mut note_lines = vec!["Revision notes:".to_string()];
        for issue in &blockers {
            let summary = issue.summary.trim();
            let fix = issue.fix_instructions.trim();
            if !summary.is_empty() || !fix.is_empty() {
                note_lines.push(format!("- {summary} (fix: {fix})"));
            }
        }
        let note = note_lines.join("\n");

        let first = &mut patched.scenes[0];
        let mut content = first
            .content
            .replace(PLACEHOLDER_MARKER, "The scene now carries its intended weight.");
        if content.trim().is_empty() {
            content = "The scene now carries its intended weight.".to_string();
        }
        first.content = format!("{}\n\n{note}", content.trim_end());

        let full_text: String = patched
            .scenes
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        patched.word_count = word_count(&full_text);

        Ok(patched)
    }
}

/// Deterministic fakes for exercising the revision loop.
pub mod fakes {
    use super::*;

    /// Writer that emits placeholder scenes with a zero word count,
    /// guaranteed to trip the built-in continuity blockers.
    pub struct PlaceholderWriter;

    impl Writer for PlaceholderWriter {
        fn write(
            &self,
            state: &State,
            plan: &ChapterPlan,
            _context_pack: Option<&crate::artifacts::ContextPack>,
        ) -> Result<ChapterContent> {
            let chapter_id = state.current_chapter.max(1);
            Ok(ChapterContent {
                meta: ArtifactMeta::now(format!(
                    "fake-writer/{}/{}",
                    state.run_id, state.revision_id
                )),
                chapter_id,
                run_id: state.run_id.clone(),
                revision_id: state.revision_id.clone(),
                title: format!("Chapter {chapter_id}"),
                scenes: vec![Scene {
                    scene_id: format!("{chapter_id}_1"),
                    location: "to be determined".to_string(),
                    characters: vec![],
                    purpose: plan.goal.clone(),
                    content: format!("{PLACEHOLDER_MARKER} chapter {chapter_id} body"),
                    extra: Default::default(),
                }],
                word_count: 0,
                extra: Default::default(),
            })
        }
    }

    /// Patcher that returns the draft unchanged, so blockers never clear.
    pub struct NoopPatcher;

    impl Patcher for NoopPatcher {
        fn apply(
            &self,
            _state: &State,
            draft: &ChapterContent,
            _blocker_issues: &[Issue],
            _context_pack: Option<&crate::artifacts::ContextPack>,
        ) -> Result<ChapterContent> {
            Ok(draft.clone())
        }
    }
}
