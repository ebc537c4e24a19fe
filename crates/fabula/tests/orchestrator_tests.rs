//! End-to-end orchestrator scenarios: clean runs, revision convergence,
//! interrupt/resume, rollback/regenerate.

use std::sync::{Arc, Mutex};

use fabula::bootstrap::DomainMemory;
use fabula::cancel::CancelToken;
use fabula::config::Config;
use fabula::engine::{
    Orchestrator, RollbackTarget, RunOptions, RunOutcome, SilentReporter, StepName,
};
use fabula::graph::Node;
use fabula::providers::{GenerationProviders, TemplatePatcher, TemplatePlanner, fakes};
use tempfile::tempdir;

fn test_config(base: &std::path::Path, project: &str, num_chapters: u32) -> Config {
    Config {
        project_name: project.to_string(),
        base_dir: base.to_path_buf(),
        author: "tester".to_string(),
        num_chapters,
        max_revision_rounds: 3,
        qa_blocker_max: 0,
        qa_major_max: 3,
        parallel_workers: 4,
    }
}

fn orchestrator(base: &std::path::Path, project: &str, num_chapters: u32) -> Orchestrator {
    Orchestrator::new(test_config(base, project, num_chapters))
        .with_cancel(CancelToken::isolated())
}

fn run_opts(num_chapters: u32, prompt: &str) -> RunOptions {
    RunOptions {
        num_chapters,
        prompt: prompt.to_string(),
        stop_at: None,
    }
}

fn placeholder_providers(patcher_fixes: bool) -> GenerationProviders {
    GenerationProviders {
        planner: Box::new(TemplatePlanner),
        writer: Box::new(fakes::PlaceholderWriter),
        patcher: if patcher_fixes {
            Box::new(TemplatePatcher)
        } else {
            Box::new(fakes::NoopPatcher)
        },
    }
}

#[test]
fn single_chapter_clean_pass() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p1", 1);
    orch.init(&mut SilentReporter).expect("init");

    let outcome = orch
        .run(
            GenerationProviders::templates(),
            &run_opts(1, "修仙世界"),
            &mut SilentReporter,
        )
        .expect("run");

    assert_eq!(outcome.exit_code(), 0);
    let state = match outcome {
        RunOutcome::Completed(s) => s,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(state.revision_round, 0);

    let store = orch.store();
    assert!(store.chapter_plan_path(1).exists());
    assert!(store.chapter_content_path(1).exists());
    let reports = store.read_reports().expect("reports");
    assert_eq!(reports.chapters["1"].blocker_count, 0);
    let memory = store.read_memory().expect("memory");
    assert!(memory.chapters["1"].scene_count >= 1);
}

#[test]
fn revision_loop_converges_and_strips_placeholders() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p2", 1);
    orch.init(&mut SilentReporter).expect("init");

    let outcome = orch
        .run(
            placeholder_providers(true),
            &run_opts(1, "a drowned coast"),
            &mut SilentReporter,
        )
        .expect("run");

    assert_eq!(outcome.exit_code(), 0);
    let state = match outcome {
        RunOutcome::Completed(s) => s,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert!(state.revision_round >= 1);
    assert_eq!(state.audit_result.expect("audit").blocker_count, 0);

    let content = orch
        .store()
        .read_chapter_content(1)
        .expect("read")
        .expect("exists");
    for scene in &content.scenes {
        assert!(!scene.content.contains(fabula::plugins::PLACEHOLDER_MARKER));
    }
}

#[test]
fn exhausted_revision_budget_pauses_for_human_review() {
    let td = tempdir().expect("tempdir");
    let mut config = test_config(td.path(), "p3", 1);
    config.max_revision_rounds = 1;
    let orch = Orchestrator::new(config).with_cancel(CancelToken::isolated());
    orch.init(&mut SilentReporter).expect("init");

    let outcome = orch
        .run(
            placeholder_providers(false),
            &run_opts(1, "prompt"),
            &mut SilentReporter,
        )
        .expect("run");

    assert_eq!(outcome.exit_code(), 2);
    let state = match outcome {
        RunOutcome::NeedsHumanReview(s) => s,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert!(state.needs_human_review);
    assert!(!orch.store().chapter_content_path(1).exists());
}

#[test]
fn interrupt_after_write_then_resume_keeps_the_draft() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p4", 1);
    orch.init(&mut SilentReporter).expect("init");

    let mut opts = run_opts(1, "prompt");
    opts.stop_at = Some(Node::WriteChapter);
    let outcome = orch
        .run(GenerationProviders::templates(), &opts, &mut SilentReporter)
        .expect("run");

    let stopped = match outcome {
        RunOutcome::Stopped(s) => s,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let draft_revision = stopped
        .chapter_draft
        .as_ref()
        .expect("draft")
        .revision_id
        .clone();
    assert!(!orch.store().chapter_content_path(1).exists());

    let outcome = orch
        .resume(GenerationProviders::templates(), &mut SilentReporter)
        .expect("resume");
    assert_eq!(outcome.exit_code(), 0);
    assert!(matches!(outcome, RunOutcome::Completed(_)));

    let content = orch
        .store()
        .read_chapter_content(1)
        .expect("read")
        .expect("exists");
    assert_eq!(content.revision_id, draft_revision);
}

#[test]
fn multi_chapter_run_stores_both_chapters() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p5", 2);
    orch.init(&mut SilentReporter).expect("init");

    let outcome = orch
        .run(
            GenerationProviders::templates(),
            &run_opts(2, "prompt"),
            &mut SilentReporter,
        )
        .expect("run");

    assert_eq!(outcome.exit_code(), 0);
    let state = match outcome {
        RunOutcome::Completed(s) => s,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(state.current_chapter, 2);

    let store = orch.store();
    for chapter in 1..=2u32 {
        assert!(store.chapter_plan_path(chapter).exists());
        assert!(store.chapter_content_path(chapter).exists());
    }
    let memory = store.read_memory().expect("memory");
    assert!(memory.chapters.contains_key("1") && memory.chapters.contains_key("2"));
    let reports = store.read_reports().expect("reports");
    assert!(reports.chapters.contains_key("1") && reports.chapters.contains_key("2"));
}

#[test]
fn rollback_to_chapter_then_resume_regenerates() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p6", 3);
    orch.init(&mut SilentReporter).expect("init");

    orch.run(
        GenerationProviders::templates(),
        &run_opts(3, "prompt"),
        &mut SilentReporter,
    )
    .expect("run");

    let report = orch
        .rollback(RollbackTarget::Chapter(2), &mut SilentReporter)
        .expect("rollback");
    assert!(report.checkpoint_deleted);

    let store = orch.store();
    assert!(store.chapter_content_path(1).exists());
    for chapter in 2..=3u32 {
        assert!(!store.chapter_plan_path(chapter).exists());
        assert!(!store.chapter_content_path(chapter).exists());
    }
    let memory = store.read_memory().expect("memory");
    let memory_keys: Vec<&str> = memory.chapters.keys().map(String::as_str).collect();
    assert_eq!(memory_keys, vec!["1"]);
    let reports = store.read_reports().expect("reports");
    let report_keys: Vec<&str> = reports.chapters.keys().map(String::as_str).collect();
    assert_eq!(report_keys, vec!["1"]);
    assert!(!fabula::config::checkpoint_db_path(store.project_root()).exists());

    // Resume rebuilds from the filesystem and regenerates chapters 2..3.
    let outcome = orch
        .resume(GenerationProviders::templates(), &mut SilentReporter)
        .expect("resume");
    assert_eq!(outcome.exit_code(), 0);

    for chapter in 1..=3u32 {
        assert!(store.chapter_plan_path(chapter).exists());
        assert!(store.chapter_content_path(chapter).exists());
    }
    let memory = store.read_memory().expect("memory");
    assert_eq!(memory.chapters.len(), 3);
}

#[test]
fn rollback_to_step_clears_chapter_tree_and_bible_tail() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p7", 1);
    orch.init(&mut SilentReporter).expect("init");
    orch.run(
        GenerationProviders::templates(),
        &run_opts(1, "prompt"),
        &mut SilentReporter,
    )
    .expect("run");

    orch.rollback(RollbackTarget::Step(StepName::Outline), &mut SilentReporter)
        .expect("rollback");

    let root = orch.store().project_root();
    assert!(root.join("world.json").exists());
    assert!(root.join("characters.json").exists());
    assert!(!root.join("outline.json").exists());
    assert!(!orch.store().chapter_content_path(1).exists());
    assert!(orch.store().read_memory().expect("memory").chapters.is_empty());
}

#[test]
fn rollback_to_scene_keeps_plan_and_earlier_scenes() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p8", 2);
    orch.init(&mut SilentReporter).expect("init");
    orch.run(
        GenerationProviders::templates(),
        &run_opts(2, "prompt"),
        &mut SilentReporter,
    )
    .expect("run");

    // Seed scene files so scene-level pruning has targets.
    let store = orch.store();
    std::fs::write(
        store.scene_path(1, 1),
        serde_json::json!({"scene_id": "1_1", "content": "keep"}).to_string(),
    )
    .expect("scene 1");
    std::fs::write(
        store.scene_path(1, 2),
        serde_json::json!({"scene_id": "1_2", "content": "drop"}).to_string(),
    )
    .expect("scene 2");

    orch.rollback(
        RollbackTarget::Scene {
            chapter: 1,
            scene: 2,
        },
        &mut SilentReporter,
    )
    .expect("rollback");

    assert!(store.chapter_plan_path(1).exists());
    assert!(store.scene_path(1, 1).exists());
    assert!(!store.scene_path(1, 2).exists());
    assert!(!store.chapter_content_path(1).exists());
    assert!(!store.chapter_plan_path(2).exists());
    assert!(!store.chapter_content_path(2).exists());
}

#[test]
fn rollback_clears_domain_memory() {
    #[derive(Default)]
    struct RecordingMemory {
        calls: Arc<Mutex<Vec<(Option<u32>, Option<u32>)>>>,
    }
    impl DomainMemory for RecordingMemory {
        fn clear(
            &self,
            _project: &str,
            chapter_gte: Option<u32>,
            scene_gte: Option<u32>,
        ) -> fabula::Result<u64> {
            self.calls.lock().unwrap().push((chapter_gte, scene_gte));
            Ok(7)
        }
    }

    let td = tempdir().expect("tempdir");
    let calls = Arc::new(Mutex::new(Vec::new()));
    let orch = orchestrator(td.path(), "p9", 1).with_domain_memory(Box::new(RecordingMemory {
        calls: calls.clone(),
    }));
    orch.init(&mut SilentReporter).expect("init");
    orch.run(
        GenerationProviders::templates(),
        &run_opts(1, "prompt"),
        &mut SilentReporter,
    )
    .expect("run");

    let report = orch
        .rollback(RollbackTarget::Chapter(1), &mut SilentReporter)
        .expect("rollback");
    assert_eq!(report.domain_memories_cleared, 7);
    assert_eq!(calls.lock().unwrap().as_slice(), &[(Some(1), None)]);
}

#[test]
fn resume_merges_orphaned_scene_files() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p10", 1);
    orch.init(&mut SilentReporter).expect("init");

    // Stop after the plan lands in the checkpoint, then fake the older
    // layout: scene files exist but the chapter file does not.
    let mut opts = run_opts(1, "prompt");
    opts.stop_at = Some(Node::PlanChapter);
    let outcome = orch
        .run(GenerationProviders::templates(), &opts, &mut SilentReporter)
        .expect("run");
    let stopped = match outcome {
        RunOutcome::Stopped(s) => s,
        other => panic!("unexpected outcome: {other:?}"),
    };
    let plan = stopped.chapter_plan.expect("plan");
    orch.store()
        .write_json(&orch.store().chapter_plan_path(1), &plan)
        .expect("write plan");
    for (i, _scene) in plan.scenes.iter().enumerate() {
        let n = (i + 1) as u32;
        std::fs::write(
            orch.store().scene_path(1, n),
            serde_json::json!({
                "scene_id": format!("1_{n}"),
                "content": format!("scene {n} prose, recovered from the older layout"),
            })
            .to_string(),
        )
        .expect("scene file");
    }

    let outcome = orch
        .resume(GenerationProviders::templates(), &mut SilentReporter)
        .expect("resume");
    assert_eq!(outcome.exit_code(), 0);

    let content = orch
        .store()
        .read_chapter_content(1)
        .expect("read")
        .expect("merged or regenerated");
    assert!(!content.scenes.is_empty());
}

#[test]
fn run_on_missing_project_is_a_user_error() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "ghost", 1);
    let err = orch
        .run(
            GenerationProviders::templates(),
            &run_opts(1, "prompt"),
            &mut SilentReporter,
        )
        .expect_err("must fail");
    assert!(matches!(err, fabula::EngineError::User(_)));
}

#[test]
fn project_status_reflects_progress() {
    let td = tempdir().expect("tempdir");
    let orch = orchestrator(td.path(), "p11", 2);
    orch.init(&mut SilentReporter).expect("init");

    orch.run(
        GenerationProviders::templates(),
        &run_opts(2, "prompt"),
        &mut SilentReporter,
    )
    .expect("run");

    let status = orch.project_status().expect("status");
    assert!(status.steps.iter().all(|(_, exists)| *exists));
    assert_eq!(status.outline_chapters, 2);
    assert!(status.checkpoint_exists);
    assert_eq!(status.memory_entries, 2);
    assert_eq!(status.report_entries, 2);
    assert!(status.chapters[&1].complete);
    assert!(status.chapters[&2].complete);
    assert!(status.chapters[&1].word_count > 0);
}
