//! Context pack assembly.
//!
//! Each chapter's generation steps consume one validated context pack: a
//! deterministic `required` block built from the bible, the outline, recent
//! chapter memory and open blocker reports, plus up to eight retrieved
//! sources for the prompt query.

use std::path::Path;

use serde_json::Value;

use crate::artifacts::{
    ArtifactMeta, BibleSummary, ContextPack, ContextSource, MemoryEntry, ReportEntry,
    RequiredContext,
};
use crate::error::Result;
use crate::retrieval::{self, RetrievalHit, SearchFilters};
use crate::schema;
use crate::state::State;
use crate::store::ArtifactStore;

/// Number of trailing chapters whose memory is always included.
const RECENT_MEMORY_WINDOW: u32 = 3;

/// Retrieval depth for the prompt query.
const RETRIEVED_TOP_K: usize = 8;

/// Outline entry for the current chapter, or an empty object.
fn outline_snippet(outline: &Value, chapter_id: u32) -> Value {
    outline
        .get("chapters")
        .and_then(Value::as_array)
        .and_then(|chapters| chapters.get((chapter_id as usize).saturating_sub(1)))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()))
}

fn bible_summary(state: &State) -> BibleSummary {
    let str_at = |value: &Value, keys: &[&str]| -> String {
        let mut cursor = value;
        for key in keys {
            match cursor.get(*key) {
                Some(next) => cursor = next,
                None => return String::new(),
            }
        }
        cursor.as_str().unwrap_or_default().to_string()
    };

    BibleSummary {
        world_name: str_at(&state.world, &["name"]),
        protagonist: str_at(&state.characters, &["protagonist", "name"]),
        theme: str_at(&state.theme_conflict, &["theme"]),
    }
}

/// Memory entries for chapters `[max(1, id - window), id - 1]` in order.
fn recent_memory(store: &ArtifactStore, chapter_id: u32) -> Result<Vec<MemoryEntry>> {
    let memory = store.read_memory()?;
    let first = chapter_id.saturating_sub(RECENT_MEMORY_WINDOW).max(1);
    let mut entries = Vec::new();
    for cid in first..chapter_id {
        if let Some(entry) = memory.chapters.get(&cid.to_string()) {
            entries.push(entry.clone());
        }
    }
    Ok(entries)
}

/// Report entries whose blocker count still exceeds the QA threshold.
fn open_blocker_reports(store: &ArtifactStore, qa_blocker_max: u32) -> Result<Vec<ReportEntry>> {
    let reports = store.read_reports()?;
    Ok(reports
        .chapters
        .values()
        .filter(|entry| entry.blocker_count > qa_blocker_max)
        .cloned()
        .collect())
}

fn hit_to_source(hit: RetrievalHit) -> ContextSource {
    ContextSource {
        source_id: hit.source_id,
        source_path: hit.source_path,
        doc_type: hit.doc_type,
        chapter_id: hit.chapter_id,
        score: Some(hit.score),
        excerpt: hit.excerpt,
        extra: Default::default(),
    }
}

/// Assemble and validate the context pack for the current chapter.
/// Validation failure is fatal for the run.
pub fn build_context_pack(
    state: &State,
    store: &ArtifactStore,
    retrieval_db: &Path,
) -> Result<ContextPack> {
    let chapter_id = state.current_chapter.max(1);
    let prompt = state.prompt.trim();

    let required = RequiredContext {
        outline_current: outline_snippet(&state.outline, chapter_id),
        bible_summary: bible_summary(state),
        recent_memory: recent_memory(store, chapter_id)?,
        open_blocker_reports: open_blocker_reports(store, state.qa_blocker_max)?,
    };

    let hits = retrieval::search(
        store.project_root(),
        retrieval_db,
        prompt,
        RETRIEVED_TOP_K,
        &SearchFilters::default(),
    )?;

    let pack = ContextPack {
        meta: ArtifactMeta::now(state.generator()),
        project_name: state.project_name.clone(),
        chapter_id,
        query: prompt.to_string(),
        required,
        retrieved: hits.into_iter().map(hit_to_source).collect(),
        extra: Default::default(),
    };

    schema::validate_context_pack(&pack).into_result("context_pack")?;
    Ok(pack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{AuditResult, ChapterContent, ChapterPlan, Scene};
    use crate::store::BibleDoc;
    use tempfile::tempdir;

    fn project_with_bible() -> (tempfile::TempDir, ArtifactStore) {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");
        store
            .write_bible(
                BibleDoc::World,
                &serde_json::json!({"name": "the drowned coast"}),
            )
            .expect("world");
        store
            .write_bible(
                BibleDoc::Characters,
                &serde_json::json!({"protagonist": {"name": "Mara"}}),
            )
            .expect("characters");
        store
            .write_bible(
                BibleDoc::ThemeConflict,
                &serde_json::json!({"theme": "freedom and its price"}),
            )
            .expect("theme");
        store
            .write_bible(
                BibleDoc::Outline,
                &serde_json::json!({
                    "num_chapters": 3,
                    "chapters": [
                        {"chapter_id": 1, "goal": "landfall"},
                        {"chapter_id": 2, "goal": "the survey"},
                        {"chapter_id": 3, "goal": "the storm"}
                    ]
                }),
            )
            .expect("outline");
        (td, store)
    }

    fn state_for(store: &ArtifactStore, chapter: u32) -> State {
        let mut state = State::initial("proj", 3, "drowned coast", 3, 0, 3);
        state.current_chapter = chapter;
        state.world = store.read_bible(BibleDoc::World).unwrap();
        state.characters = store.read_bible(BibleDoc::Characters).unwrap();
        state.theme_conflict = store.read_bible(BibleDoc::ThemeConflict).unwrap();
        state.outline = store.read_bible(BibleDoc::Outline).unwrap();
        state
    }

    fn store_chapter(store: &ArtifactStore, chapter_id: u32, blockers: u32) {
        let plan = ChapterPlan {
            chapter_id,
            revision_id: format!("run_t_ch{chapter_id:03}_r0"),
            ..Default::default()
        };
        let content = ChapterContent {
            chapter_id,
            revision_id: format!("run_t_ch{chapter_id:03}_r0"),
            title: format!("Chapter {chapter_id}"),
            scenes: vec![Scene {
                scene_id: format!("{chapter_id}_1"),
                content: "some prose".to_string(),
                ..Default::default()
            }],
            word_count: 10,
            ..Default::default()
        };
        let audit = AuditResult {
            chapter_id,
            issues: (0..blockers)
                .map(|i| crate::artifacts::Issue {
                    id: format!("I-{chapter_id:03}-{i:03}"),
                    severity: crate::artifacts::Severity::Blocker,
                    category: crate::artifacts::Category::WorldRule,
                    summary: "left open".to_string(),
                    evidence: Default::default(),
                    fix_instructions: "resolve it".to_string(),
                    fix_options: vec![],
                })
                .collect(),
            blocker_count: blockers,
            qa_major_max: 3,
            ..Default::default()
        };
        store
            .write_chapter_bundle(chapter_id, &plan, &content, &audit)
            .expect("bundle");
    }

    #[test]
    fn pack_carries_outline_entry_and_bible_summary() {
        let (td, store) = project_with_bible();
        let state = state_for(&store, 2);

        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");

        assert_eq!(pack.chapter_id, 2);
        assert_eq!(pack.required.outline_current["goal"], "the survey");
        assert_eq!(pack.required.bible_summary.world_name, "the drowned coast");
        assert_eq!(pack.required.bible_summary.protagonist, "Mara");
        assert_eq!(pack.required.bible_summary.theme, "freedom and its price");
    }

    #[test]
    fn outline_snippet_is_empty_object_when_absent() {
        let (td, store) = project_with_bible();
        let mut state = state_for(&store, 2);
        state.current_chapter = 9;

        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");
        assert_eq!(pack.required.outline_current, serde_json::json!({}));
    }

    #[test]
    fn recent_memory_windows_three_chapters() {
        let (td, store) = project_with_bible();
        for chapter in 1..=4 {
            store_chapter(&store, chapter, 0);
        }
        let mut state = state_for(&store, 5);
        state.num_chapters = 6;

        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");

        let ids: Vec<u32> = pack
            .required
            .recent_memory
            .iter()
            .map(|m| m.chapter_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn recent_memory_clamps_at_chapter_one() {
        let (td, store) = project_with_bible();
        store_chapter(&store, 1, 0);
        let state = state_for(&store, 2);

        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");
        let ids: Vec<u32> = pack
            .required
            .recent_memory
            .iter()
            .map(|m| m.chapter_id)
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn open_blockers_filtered_by_threshold() {
        let (td, store) = project_with_bible();
        store_chapter(&store, 1, 0);
        store_chapter(&store, 2, 2);

        let mut state = state_for(&store, 3);
        state.qa_blocker_max = 0;
        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");
        let open: Vec<u32> = pack
            .required
            .open_blocker_reports
            .iter()
            .map(|r| r.chapter_id)
            .collect();
        assert_eq!(open, vec![2]);

        // A higher threshold closes the report.
        let mut relaxed = state_for(&store, 3);
        relaxed.qa_blocker_max = 2;
        let pack = build_context_pack(&relaxed, &store, &td.path().join("retrieval2.db"))
            .expect("pack");
        assert!(pack.required.open_blocker_reports.is_empty());
    }

    #[test]
    fn retrieved_is_capped_and_sourced() {
        let (td, store) = project_with_bible();
        let state = state_for(&store, 1);

        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");
        assert!(pack.retrieved.len() <= 8);
        for source in &pack.retrieved {
            assert!(source.source_id.starts_with("file:"));
            assert!(source.score.is_some());
        }
    }

    #[test]
    fn pack_after_advance_matches_fresh_chapter_start() {
        let (td, store) = project_with_bible();
        store_chapter(&store, 1, 0);

        // State that advanced from chapter 1 to chapter 2.
        let mut advanced = state_for(&store, 1);
        let update = crate::nodes::advance_chapter(&advanced);
        advanced.apply(&update);

        // State built directly at chapter 2 for the same run.
        let mut fresh = state_for(&store, 2);
        fresh.run_id = advanced.run_id.clone();
        fresh.revision_id = advanced.revision_id.clone();

        let pack_a = build_context_pack(&advanced, &store, &td.path().join("a.db")).expect("pack");
        let pack_b = build_context_pack(&fresh, &store, &td.path().join("b.db")).expect("pack");

        assert_eq!(pack_a.chapter_id, pack_b.chapter_id);
        assert_eq!(
            serde_json::to_value(&pack_a.required).unwrap(),
            serde_json::to_value(&pack_b.required).unwrap()
        );
        assert_eq!(pack_a.query, pack_b.query);
        let sources_a: Vec<&str> = pack_a.retrieved.iter().map(|s| s.source_id.as_str()).collect();
        let sources_b: Vec<&str> = pack_b.retrieved.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(sources_a, sources_b);
    }

    #[test]
    fn empty_prompt_yields_no_retrieved_sources() {
        let (td, store) = project_with_bible();
        let mut state = state_for(&store, 1);
        state.prompt = String::new();

        let pack =
            build_context_pack(&state, &store, &td.path().join("retrieval.db")).expect("pack");
        assert!(pack.retrieved.is_empty());
        assert_eq!(pack.query, "");
    }
}
