//! The nine graph nodes and the conditional routing between them.
//!
//! Nodes read the state blackboard and return incremental updates; they
//! never mutate state directly. `store_artifacts` is the only node with
//! persistent effects, and those are idempotent per `revision_id`.
//!
//! Provider calls (plan, write, patch) run under the retry contract:
//! transient failures back off and, once the schedule is exhausted, the
//! node substitutes a default artifact instead of aborting the graph. The
//! defaults are deliberately unpublishable, so the audit blocker gate
//! catches every degraded draft.

use std::path::Path;

use chrono::Utc;
use fabula_retry::Backoff;

use crate::artifacts::{ArtifactMeta, ChapterContent, ChapterPlan, Severity};
use crate::cancel::call_with_retry;
use crate::context;
use crate::error::{EngineError, Result};
use crate::plugins::{self, PluginRegistry};
use crate::providers::{Patcher, Planner, Writer};
use crate::schema;
use crate::state::{State, StateUpdate, revision_id_for};
use crate::store::ArtifactStore;

/// Assemble the context pack for the current chapter.
pub fn build_context_pack(
    state: &State,
    store: &ArtifactStore,
    retrieval_db: &Path,
) -> Result<StateUpdate> {
    let pack = context::build_context_pack(state, store, retrieval_db)?;
    Ok(StateUpdate {
        context_pack: Some(Some(pack)),
        ..Default::default()
    })
}

/// Generate the chapter plan through the injected planner.
///
/// A planner that keeps timing out degrades to an empty plan; the
/// zero-scene draft it produces downstream is a blocker.
pub fn plan_chapter(
    state: &State,
    planner: &dyn Planner,
    backoff: &Backoff,
) -> Result<StateUpdate> {
    let plan = call_with_retry("planner.plan", backoff, |_attempt| {
        planner.plan(state, state.context_pack.as_ref())
    })?
    .unwrap_or_else(|| degraded_plan(state));
    Ok(StateUpdate {
        chapter_plan: Some(Some(plan)),
        ..Default::default()
    })
}

/// Generate chapter content from the plan through the injected writer.
///
/// A writer that keeps timing out degrades to an empty draft, which the
/// audit blocker gate refuses to store.
pub fn write_chapter(state: &State, writer: &dyn Writer, backoff: &Backoff) -> Result<StateUpdate> {
    let plan = state.chapter_plan.clone().ok_or_else(|| {
        EngineError::Corruption("write_chapter reached without a chapter plan".to_string())
    })?;
    let draft = call_with_retry("writer.write", backoff, |_attempt| {
        writer.write(state, &plan, state.context_pack.as_ref())
    })?
    .unwrap_or_else(|| degraded_draft(state));
    Ok(StateUpdate {
        chapter_draft: Some(Some(draft)),
        ..Default::default()
    })
}

/// Plan substituted when the planner degrades: identifiers only, no
/// scenes.
fn degraded_plan(state: &State) -> ChapterPlan {
    ChapterPlan {
        meta: ArtifactMeta::now(state.generator()),
        chapter_id: state.current_chapter.max(1),
        run_id: state.run_id.clone(),
        revision_id: state.revision_id.clone(),
        ..Default::default()
    }
}

/// Draft substituted when the writer degrades: zero scenes, zero words.
fn degraded_draft(state: &State) -> ChapterContent {
    let chapter_id = state.current_chapter.max(1);
    ChapterContent {
        meta: ArtifactMeta::now(state.generator()),
        chapter_id,
        run_id: state.run_id.clone(),
        revision_id: state.revision_id.clone(),
        title: format!("Chapter {chapter_id}"),
        scenes: Vec::new(),
        word_count: 0,
        ..Default::default()
    }
}

/// Run all registered audit plugins over the draft.
pub fn audit_chapter(state: &State, registry: &PluginRegistry) -> Result<StateUpdate> {
    let audit = plugins::run_audit(registry, state)?;
    Ok(StateUpdate {
        audit_result: Some(Some(audit)),
        ..Default::default()
    })
}

/// Apply a minimal patch for the blocker issues.
///
/// The revision identifiers advance first and the patcher sees the updated
/// state, so the new draft carries the correct generator string. A patcher
/// that keeps timing out degrades to the unpatched draft: the round still
/// advances, the blockers stay, and the revision budget eventually hands
/// the chapter to a human.
pub fn apply_patch(state: &State, patcher: &dyn Patcher, backoff: &Backoff) -> Result<StateUpdate> {
    let audit = state.audit_result.clone().unwrap_or_default();
    let draft = state.chapter_draft.clone().ok_or_else(|| {
        EngineError::Corruption("apply_patch reached without a chapter draft".to_string())
    })?;

    let blockers: Vec<_> = audit
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Blocker)
        .cloned()
        .collect();
    if blockers.is_empty() {
        return Ok(StateUpdate::default());
    }

    let chapter_id = state.current_chapter.max(1);
    let new_round = state.revision_round + 1;
    let new_revision_id = revision_id_for(&state.run_id, chapter_id, new_round);

    let mut next_state = state.clone();
    next_state.revision_round = new_round;
    next_state.revision_id = new_revision_id.clone();

    let mut patched = call_with_retry("patcher.apply", backoff, |_attempt| {
        patcher.apply(&next_state, &draft, &blockers, state.context_pack.as_ref())
    })?
    .unwrap_or_else(|| draft.clone());
    patched.run_id = state.run_id.clone();
    patched.revision_id = new_revision_id.clone();
    patched.meta = ArtifactMeta {
        schema_version: patched.meta.schema_version.clone(),
        generated_at: Utc::now().to_rfc3339(),
        generator: next_state.generator(),
    };

    Ok(StateUpdate {
        chapter_draft: Some(Some(patched)),
        revision_round: Some(new_round),
        revision_id: Some(new_revision_id),
        ..Default::default()
    })
}

/// Persist the chapter bundle. Validation failure is fatal: an
/// inconsistent draft must never reach the disk.
pub fn store_artifacts(state: &State, store: &ArtifactStore) -> Result<StateUpdate> {
    let plan = state.chapter_plan.as_ref().ok_or_else(|| {
        EngineError::Corruption("store_artifacts reached without a chapter plan".to_string())
    })?;
    let draft = state.chapter_draft.as_ref().ok_or_else(|| {
        EngineError::Corruption("store_artifacts reached without a chapter draft".to_string())
    })?;
    let audit = state.audit_result.clone().unwrap_or_default();

    schema::validate_chapter_plan(plan).into_result("chapter_plan")?;
    schema::validate_chapter_content(draft).into_result("chapter_content")?;

    store.write_chapter_bundle(state.current_chapter.max(1), plan, draft, &audit)?;
    Ok(StateUpdate::default())
}

/// Move the cursor to the next chapter and clear the transients.
pub fn advance_chapter(state: &State) -> StateUpdate {
    let next_chapter = state.current_chapter + 1;
    StateUpdate {
        current_chapter: Some(next_chapter),
        revision_round: Some(0),
        revision_id: Some(revision_id_for(&state.run_id, next_chapter, 0)),
        chapter_plan: Some(None),
        chapter_draft: Some(None),
        audit_result: Some(None),
        context_pack: Some(None),
        ..Default::default()
    }
}

/// Terminal: the chapter needs a human.
pub fn mark_human_review(_state: &State) -> StateUpdate {
    StateUpdate {
        needs_human_review: Some(true),
        ..Default::default()
    }
}

/// Terminal: every chapter is stored.
pub fn mark_complete(_state: &State) -> StateUpdate {
    StateUpdate {
        completed: Some(true),
        ..Default::default()
    }
}

/// Decision after `audit_chapter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditRoute {
    Revise,
    Store,
    HumanReview,
}

/// Blocker gate:
/// 1. blockers within the threshold store and advance,
/// 2. blockers beyond it with revision budget left revise,
/// 3. an exhausted budget hands the chapter to a human.
pub fn should_revise(state: &State) -> AuditRoute {
    let blocker_count = state
        .audit_result
        .as_ref()
        .map(|a| a.blocker_count)
        .unwrap_or(0);

    if blocker_count <= state.qa_blocker_max {
        return AuditRoute::Store;
    }
    if state.revision_round >= state.max_revision_rounds {
        return AuditRoute::HumanReview;
    }
    AuditRoute::Revise
}

/// Whether the outer chapter loop continues after a store.
pub fn should_continue_chapters(state: &State) -> bool {
    state.current_chapter < state.num_chapters
}
