//! The orchestrator: wires store, checkpointer, retrieval, plugins and
//! providers into the chapter graph, and owns the run / resume / rollback
//! entry points.
//!
//! Resume treats the filesystem as the final authority for completed
//! chapters: orphaned scene files are merged, the checkpoint is diffed
//! against the loaded artifacts, and when the filesystem is ahead (the
//! usual state after an interrupted bundle write) a single state update
//! repositions the graph so completed work is never regenerated.

use std::collections::BTreeMap;
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::artifacts::{ArtifactMeta, ChapterContent, Scene};
use crate::bootstrap::{Bootstrap, DomainMemory, NoopDomainMemory, RuleBasedBootstrap};
use crate::cancel::CancelToken;
use crate::checkpoint::{SqliteCheckpointer, ThreadConfig};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::events::{EventLog, EventType, RunEvent, events_path};
use crate::graph::{ChapterGraph, GraphOutcome, Node, RunConfig};
use crate::lock::LockFile;
use crate::plugins::PluginRegistry;
use crate::providers::{GenerationProviders, word_count};
use crate::state::{State, StateUpdate, revision_id_for};
use crate::store::{ArtifactStore, BibleDoc};

/// Stale-lock takeover threshold for run/resume.
const LOCK_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Progress sink implemented by the CLI (or any embedder).
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that swallows everything; used by tests.
pub struct SilentReporter;

impl Reporter for SilentReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// How a run ended, with the exit-code contract attached.
#[derive(Debug)]
pub enum RunOutcome {
    /// All chapters stored. Exit 0.
    Completed(State),
    /// The revision budget ran out on a blocker. Exit 2: a pause, not a
    /// failure.
    NeedsHumanReview(State),
    /// Graceful stop (shutdown signal or `--stop-at`). Exit 0; resume
    /// continues from the checkpoint.
    Stopped(State),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) | RunOutcome::Stopped(_) => 0,
            RunOutcome::NeedsHumanReview(_) => 2,
        }
    }

    pub fn state(&self) -> &State {
        match self {
            RunOutcome::Completed(s)
            | RunOutcome::NeedsHumanReview(s)
            | RunOutcome::Stopped(s) => s,
        }
    }
}

/// Options for one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub num_chapters: u32,
    pub prompt: String,
    pub stop_at: Option<Node>,
}

impl RunOptions {
    pub fn from_config(config: &Config, chapters: Option<u32>, prompt: Option<String>) -> Self {
        Self {
            num_chapters: chapters.unwrap_or(config.num_chapters).max(1),
            prompt: prompt.unwrap_or_default(),
            stop_at: None,
        }
    }
}

/// Rollback target, mirroring the CLI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTarget {
    Step(StepName),
    Chapter(u32),
    Scene { chapter: u32, scene: u32 },
}

/// Bootstrap steps in creation order, plus the chapter loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepName {
    World,
    ThemeConflict,
    Characters,
    Outline,
    Chapters,
}

impl StepName {
    pub fn parse(name: &str) -> Option<StepName> {
        match name {
            "world" => Some(StepName::World),
            "theme_conflict" => Some(StepName::ThemeConflict),
            "characters" => Some(StepName::Characters),
            "outline" => Some(StepName::Outline),
            "chapters" => Some(StepName::Chapters),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepName::World => "world",
            StepName::ThemeConflict => "theme_conflict",
            StepName::Characters => "characters",
            StepName::Outline => "outline",
            StepName::Chapters => "chapters",
        }
    }

    fn order(&self) -> usize {
        match self {
            StepName::World => 0,
            StepName::ThemeConflict => 1,
            StepName::Characters => 2,
            StepName::Outline => 3,
            StepName::Chapters => 4,
        }
    }

    fn bible_doc(&self) -> Option<BibleDoc> {
        match self {
            StepName::World => Some(BibleDoc::World),
            StepName::ThemeConflict => Some(BibleDoc::ThemeConflict),
            StepName::Characters => Some(BibleDoc::Characters),
            StepName::Outline => Some(BibleDoc::Outline),
            StepName::Chapters => None,
        }
    }
}

/// What a rollback removed.
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub deleted_files: Vec<String>,
    pub memory_entries_pruned: usize,
    pub report_entries_pruned: usize,
    pub domain_memories_cleared: u64,
    pub checkpoint_deleted: bool,
}

/// Per-chapter filesystem status.
#[derive(Debug, Default, Clone)]
pub struct ChapterStatus {
    pub has_plan: bool,
    pub planned_scenes: u32,
    pub scene_files: Vec<u32>,
    pub complete: bool,
    pub word_count: u64,
}

/// Full project status assembled from the filesystem.
#[derive(Debug, Default)]
pub struct ProjectStatus {
    pub steps: Vec<(&'static str, bool)>,
    pub outline_chapters: u32,
    pub chapters: BTreeMap<u32, ChapterStatus>,
    pub checkpoint_exists: bool,
    pub memory_entries: usize,
    pub report_entries: usize,
}

fn scene_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^scene_(\d{3})_(\d{3})\.json$").expect("static regex"))
}

fn chapter_any_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^chapter_(\d{3})(_plan|_revision)?\.json$").expect("static regex")
    })
}

/// Wires everything for one project and owns run / resume / rollback.
pub struct Orchestrator {
    config: Config,
    store: ArtifactStore,
    bootstrap: Box<dyn Bootstrap>,
    domain_memory: Box<dyn DomainMemory>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let store = ArtifactStore::new(config.project_root());
        Self {
            config,
            store,
            bootstrap: Box::new(RuleBasedBootstrap),
            domain_memory: Box::new(NoopDomainMemory),
            cancel: CancelToken::linked(),
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Box<dyn Bootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_domain_memory(mut self, domain_memory: Box<dyn DomainMemory>) -> Self {
        self.domain_memory = domain_memory;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the project. Fails if it already exists.
    pub fn init(&self, reporter: &mut dyn Reporter) -> Result<()> {
        self.store.init_project(
            &self.config.project_name,
            &self.config.author,
            Some(self.config.num_chapters),
        )?;
        reporter.info(&format!(
            "initialized project '{}' at {}",
            self.config.project_name,
            self.store.project_root().display()
        ));
        Ok(())
    }

    /// Run the generation workflow from the start.
    pub fn run(
        &self,
        providers: GenerationProviders,
        opts: &RunOptions,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        self.require_project()?;
        let lock = LockFile::acquire_with_timeout(self.store.project_root(), LOCK_TIMEOUT)?;

        let state = self.prepare_initial_state(opts)?;
        lock.set_run_id(&state.run_id)?;

        reporter.info(&format!(
            "starting generation for '{}', {} chapter(s)",
            self.config.project_name, state.num_chapters
        ));

        self.invoke_fresh(providers, state, opts.stop_at, reporter)
    }

    /// Resume from the latest checkpoint, reconciling with the filesystem
    /// first. Falls back to a fresh run when the checkpoint is missing or
    /// irreconcilable (the filesystem is authoritative).
    pub fn resume(
        &self,
        providers: GenerationProviders,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        self.require_project()?;
        let _lock = LockFile::acquire_with_timeout(self.store.project_root(), LOCK_TIMEOUT)?;

        // Orphaned scene files first: a complete-but-unsaved chapter becomes
        // a chapter file before anything reads the tree.
        let merged = self.merge_incomplete_chapters_from_scenes(reporter)?;
        if merged > 0 {
            reporter.info(&format!("merged {merged} chapter(s) from scene files"));
        }

        // Peek at the checkpoint before committing the providers to a graph,
        // so the fresh-run fallback can still use them.
        let checkpointer = SqliteCheckpointer::open(self.config.checkpoint_db())?;
        let thread = ThreadConfig::for_thread(&self.config.project_name);
        let tuple = checkpointer.get_tuple(&thread)?;

        let Some(tuple) = tuple else {
            reporter.warn("no checkpoint found; rebuilding from the filesystem");
            return self.rerun_from_files(providers, reporter);
        };

        let checkpoint_state =
            match State::from_channels(tuple.checkpoint.channel_values.clone()) {
                Ok(state) => state,
                Err(e) => {
                    reporter.warn(&format!(
                        "checkpoint state unreadable ({e}); rebuilding from the filesystem"
                    ));
                    return self.rerun_from_files(providers, reporter);
                }
            };

        if tuple.metadata.next.is_none() {
            // Thread already at END. If the files disagree, the checkpoint
            // is stale and the filesystem wins.
            let num_chapters = checkpoint_state.num_chapters.max(1);
            let unfinished = self.first_incomplete_chapter(num_chapters).is_some();
            if checkpoint_state.needs_human_review {
                return Ok(self.finish(GraphOutcome::Finished(checkpoint_state), reporter));
            }
            if checkpoint_state.completed && !unfinished {
                reporter.info("nothing to continue (already at END)");
                return Ok(self.finish(GraphOutcome::Finished(checkpoint_state), reporter));
            }
            reporter.warn("checkpoint claims END but chapters are incomplete; rebuilding");
            return self.rerun_from_files(providers, reporter);
        }

        let mut graph = ChapterGraph::new(
            self.store.clone(),
            self.config.retrieval_db(),
            providers,
            PluginRegistry::with_defaults(),
            checkpointer,
            self.cancel.clone(),
        );
        self.reconcile(&mut graph, &checkpoint_state, reporter)?;

        reporter.info(&format!(
            "resuming '{}' from checkpoint {}",
            self.config.project_name, tuple.checkpoint.id
        ));

        let mut cfg = RunConfig::for_thread(&self.config.project_name);
        cfg.recursion_limit = RunConfig::recursion_limit_for(
            checkpoint_state.num_chapters.max(1),
            checkpoint_state.max_revision_rounds,
        );
        let outcome = graph.invoke(None, &cfg)?;
        Ok(self.finish(outcome, reporter))
    }

    /// Roll the project back to a step, chapter or scene boundary. Deletes
    /// the checkpoint database so the next run rebuilds from files, and
    /// clears external domain memory to match.
    pub fn rollback(
        &self,
        target: RollbackTarget,
        reporter: &mut dyn Reporter,
    ) -> Result<RollbackReport> {
        self.require_project()?;
        let mut report = RollbackReport::default();

        match target {
            RollbackTarget::Step(step) => self.rollback_step(step, &mut report, reporter)?,
            RollbackTarget::Chapter(chapter) => {
                if chapter == 0 {
                    return Err(EngineError::user("rollback chapter must be >= 1"));
                }
                self.delete_chapter_files(chapter, None, &mut report)?;
                self.prune_aggregates(chapter, &mut report)?;
                report.domain_memories_cleared = self
                    .domain_memory
                    .clear(&self.config.project_name, Some(chapter), None)
                    .unwrap_or(0);
            }
            RollbackTarget::Scene { chapter, scene } => {
                if chapter == 0 || scene == 0 {
                    return Err(EngineError::user("rollback chapter and scene must be >= 1"));
                }
                self.delete_chapter_files(chapter, Some(scene), &mut report)?;
                self.prune_aggregates(chapter, &mut report)?;
                report.domain_memories_cleared = self
                    .domain_memory
                    .clear(&self.config.project_name, Some(chapter), Some(scene))
                    .unwrap_or(0);
            }
        }

        report.checkpoint_deleted = self.delete_checkpoint_db()?;

        let mut log = EventLog::new();
        log.record(RunEvent::now(
            EventType::RolledBack {
                target: format!("{target:?}"),
            },
            None,
        ));
        let _ = log.flush_to_file(&events_path(self.store.project_root()));

        reporter.info(&format!(
            "rollback complete: {} file(s) removed, {} memory / {} report entries pruned",
            report.deleted_files.len(),
            report.memory_entries_pruned,
            report.report_entries_pruned
        ));
        Ok(report)
    }

    /// Filesystem-derived project status.
    pub fn project_status(&self) -> Result<ProjectStatus> {
        self.require_project()?;
        let mut status = ProjectStatus::default();

        for step in [
            StepName::World,
            StepName::ThemeConflict,
            StepName::Characters,
            StepName::Outline,
        ] {
            let doc = step.bible_doc().ok_or_else(|| {
                EngineError::Storage("bible step without a document".to_string())
            })?;
            let exists = self.store.project_root().join(doc.file_name()).exists();
            status.steps.push((step.name(), exists));
        }

        let outline = self.store.read_bible(BibleDoc::Outline)?;
        status.outline_chapters = outline
            .get("chapters")
            .and_then(Value::as_array)
            .map(|a| a.len() as u32)
            .unwrap_or(0);

        status.checkpoint_exists =
            crate::config::checkpoint_db_path(self.store.project_root()).exists();
        status.memory_entries = self.store.read_memory()?.chapters.len();
        status.report_entries = self.store.read_reports()?.chapters.len();

        let chapters_dir = self.store.chapters_dir();
        if let Ok(entries) = fs::read_dir(&chapters_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(caps) = scene_file_regex().captures(&name) {
                    let chapter: u32 = caps[1].parse().unwrap_or(0);
                    let scene: u32 = caps[2].parse().unwrap_or(0);
                    status
                        .chapters
                        .entry(chapter)
                        .or_default()
                        .scene_files
                        .push(scene);
                    continue;
                }
                if let Some(caps) = chapter_any_file_regex().captures(&name) {
                    let chapter: u32 = caps[1].parse().unwrap_or(0);
                    let slot = status.chapters.entry(chapter).or_default();
                    match caps.get(2).map(|m| m.as_str()) {
                        Some("_plan") => {
                            slot.has_plan = true;
                            if let Ok(Some(plan)) = self.store.read_chapter_plan(chapter) {
                                slot.planned_scenes = plan.scenes.len() as u32;
                            }
                        }
                        Some("_revision") => {}
                        _ => {
                            slot.complete = true;
                            if let Ok(Some(content)) = self.store.read_chapter_content(chapter) {
                                slot.word_count = content.word_count;
                            }
                        }
                    }
                }
            }
        }
        for chapter in status.chapters.values_mut() {
            chapter.scene_files.sort_unstable();
        }
        Ok(status)
    }

    // -- run internals ----------------------------------------------------

    fn require_project(&self) -> Result<()> {
        if !self.store.project_exists() {
            return Err(EngineError::user(format!(
                "project '{}' not found; run 'init' first",
                self.config.project_name
            )));
        }
        Ok(())
    }

    /// Build the initial state for a fresh run: bootstrap (or load) the
    /// bible and seed the blackboard.
    fn prepare_initial_state(&self, opts: &RunOptions) -> Result<State> {
        let mut state = State::initial(
            &self.config.project_name,
            opts.num_chapters,
            &opts.prompt,
            self.config.max_revision_rounds,
            self.config.qa_blocker_max,
            self.config.qa_major_max,
        );

        let generator = state.generator();
        let bootstrap = self.bootstrap.ensure_background_assets(
            &self.store,
            &opts.prompt,
            opts.num_chapters,
            &generator,
            false,
        )?;
        state.requirements = bootstrap.requirements;
        state.world = bootstrap.world;
        state.characters = bootstrap.characters;
        state.theme_conflict = bootstrap.theme_conflict;
        state.outline = bootstrap.outline;
        Ok(state)
    }

    fn invoke_fresh(
        &self,
        providers: GenerationProviders,
        state: State,
        stop_at: Option<Node>,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let checkpointer = SqliteCheckpointer::open(self.config.checkpoint_db())?;
        let mut graph = ChapterGraph::new(
            self.store.clone(),
            self.config.retrieval_db(),
            providers,
            PluginRegistry::with_defaults(),
            checkpointer,
            self.cancel.clone(),
        );

        let mut cfg = RunConfig::for_thread(&self.config.project_name);
        cfg.recursion_limit =
            RunConfig::recursion_limit_for(state.num_chapters, state.max_revision_rounds);
        cfg.stop_at = stop_at;

        let outcome = graph.invoke(Some(state), &cfg)?;
        Ok(self.finish(outcome, reporter))
    }

    /// Fresh-run fallback used by resume when the checkpoint is missing or
    /// corrupt. Completed chapters on disk are skipped; the bible on disk
    /// is reused via the idempotent bootstrap.
    fn rerun_from_files(
        &self,
        providers: GenerationProviders,
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let num_chapters = self.infer_num_chapters();
        let opts = RunOptions {
            num_chapters,
            prompt: String::new(),
            stop_at: None,
        };

        let mut state = self.prepare_initial_state(&opts)?;
        match self.first_incomplete_chapter(num_chapters) {
            Some(first) => {
                if first > 1 {
                    reporter.info(&format!(
                        "chapters 1..{} already stored; starting at chapter {first}",
                        first - 1
                    ));
                    state.current_chapter = first;
                    state.revision_id = revision_id_for(&state.run_id, first, 0);
                }
            }
            None => {
                reporter.info("all chapters already stored; nothing to regenerate");
                state.current_chapter = num_chapters;
                state.completed = true;
                return Ok(RunOutcome::Completed(state));
            }
        }

        self.invoke_fresh(providers, state, None, reporter)
    }

    /// The number of chapters this project is meant to have: the outline is
    /// authoritative, then the count recorded at init, then the configured
    /// default.
    fn infer_num_chapters(&self) -> u32 {
        let from_outline = self
            .store
            .read_bible(BibleDoc::Outline)
            .ok()
            .and_then(|outline| {
                outline
                    .get("num_chapters")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32)
            })
            .filter(|n| *n >= 1);
        let from_settings = self
            .store
            .read_settings()
            .ok()
            .flatten()
            .and_then(|settings| settings.num_chapters)
            .filter(|n| *n >= 1);
        from_outline
            .or(from_settings)
            .unwrap_or(self.config.num_chapters)
    }

    /// First chapter in `1..=num_chapters` missing its plan or content.
    fn first_incomplete_chapter(&self, num_chapters: u32) -> Option<u32> {
        (1..=num_chapters.max(1)).find(|&chapter| {
            !self.store.chapter_plan_path(chapter).exists()
                || !self.store.chapter_content_path(chapter).exists()
        })
    }

    /// Diff the filesystem against the checkpoint and, when the filesystem
    /// is ahead, reposition the graph with one state update so it does not
    /// regenerate completed work.
    fn reconcile(
        &self,
        graph: &mut ChapterGraph,
        checkpoint_state: &State,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let num_chapters = checkpoint_state.num_chapters.max(1);
        let completed_through = match self.first_incomplete_chapter(num_chapters) {
            Some(first) => first.saturating_sub(1),
            None => num_chapters,
        };

        let mut update = StateUpdate::default();

        // Bible documents present on disk but missing in the checkpoint.
        let sync_doc = |doc: BibleDoc, slot: &Value| -> Result<Option<Value>> {
            let on_disk = self.store.read_bible(doc)?;
            let empty_in_checkpoint = slot.as_object().map(|o| o.is_empty()).unwrap_or(true);
            let present_on_disk = on_disk.as_object().map(|o| !o.is_empty()).unwrap_or(false);
            Ok((empty_in_checkpoint && present_on_disk).then_some(on_disk))
        };
        update.world = sync_doc(BibleDoc::World, &checkpoint_state.world)?;
        update.characters = sync_doc(BibleDoc::Characters, &checkpoint_state.characters)?;
        update.theme_conflict =
            sync_doc(BibleDoc::ThemeConflict, &checkpoint_state.theme_conflict)?;
        update.outline = sync_doc(BibleDoc::Outline, &checkpoint_state.outline)?;

        let mut next_override = None;
        if completed_through >= 1 && completed_through >= checkpoint_state.current_chapter {
            // Filesystem ahead: the chapter the checkpoint is still working
            // on is already stored.
            reporter.info(&format!(
                "filesystem is ahead (chapter {completed_through} stored); repositioning"
            ));
            update.current_chapter = Some(completed_through);
            update.revision_round = Some(0);
            update.revision_id = Some(revision_id_for(
                &checkpoint_state.run_id,
                completed_through,
                0,
            ));
            update.chapter_plan = Some(None);
            update.chapter_draft = Some(None);
            update.audit_result = Some(None);
            update.context_pack = Some(None);
            next_override = Some(Some(if completed_through < num_chapters {
                Node::AdvanceChapter
            } else {
                Node::MarkComplete
            }));
        }

        if update.is_empty() && next_override.is_none() {
            return Ok(());
        }
        info!(
            channels = ?update.changed_channels(),
            "reconciling checkpoint with filesystem"
        );
        graph.update_state(&self.config.project_name, &update, next_override)
    }

    /// Merge orphaned `scene_<ccc>_<sss>.json` files into chapter content
    /// when the plan's full scene set is present. Returns how many chapters
    /// were merged.
    fn merge_incomplete_chapters_from_scenes(
        &self,
        reporter: &mut dyn Reporter,
    ) -> Result<usize> {
        let chapters_dir = self.store.chapters_dir();
        let Ok(entries) = fs::read_dir(&chapters_dir) else {
            return Ok(0);
        };

        let mut scenes_by_chapter: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(caps) = scene_file_regex().captures(&name) {
                let chapter: u32 = caps[1].parse().unwrap_or(0);
                let scene: u32 = caps[2].parse().unwrap_or(0);
                scenes_by_chapter.entry(chapter).or_default().push(scene);
            }
        }

        let mut merged = 0;
        for (chapter, mut scene_numbers) in scenes_by_chapter {
            if self.store.chapter_content_path(chapter).exists() {
                continue;
            }
            let Some(plan) = self.store.read_chapter_plan(chapter)? else {
                continue;
            };
            scene_numbers.sort_unstable();
            scene_numbers.dedup();
            let expected = plan.scenes.len() as u32;
            if expected == 0 {
                continue;
            }
            let have_all = (1..=expected).all(|n| scene_numbers.contains(&n));
            if !have_all {
                continue;
            }

            let mut scenes = Vec::with_capacity(expected as usize);
            for n in 1..=expected {
                let path = self.store.scene_path(chapter, n);
                let raw = fs::read_to_string(&path).map_err(EngineError::storage)?;
                let value: Value = serde_json::from_str(&raw).map_err(|e| {
                    EngineError::Storage(format!("bad scene file {}: {e}", path.display()))
                })?;
                scenes.push(scene_from_value(&value, chapter, n));
            }

            let full_text: String = scenes
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let content = ChapterContent {
                meta: ArtifactMeta::now(plan.meta.generator.clone()),
                chapter_id: chapter,
                run_id: plan.run_id.clone(),
                revision_id: plan.revision_id.clone(),
                title: format!("Chapter {chapter}"),
                word_count: word_count(&full_text),
                scenes,
                extra: Default::default(),
            };
            self.store
                .write_json(&self.store.chapter_content_path(chapter), &content)?;
            reporter.info(&format!("merged chapter {chapter} from scene files"));
            merged += 1;
        }
        Ok(merged)
    }

    fn finish(&self, outcome: GraphOutcome, reporter: &mut dyn Reporter) -> RunOutcome {
        match outcome {
            GraphOutcome::Finished(state) => {
                if state.needs_human_review {
                    reporter.warn(&format!(
                        "chapter {} needs human review",
                        state.current_chapter
                    ));
                    RunOutcome::NeedsHumanReview(state)
                } else {
                    reporter.info("generation completed successfully");
                    RunOutcome::Completed(state)
                }
            }
            GraphOutcome::Interrupted(state) => {
                reporter.warn("run interrupted; resume will continue from the checkpoint");
                RunOutcome::Stopped(state)
            }
            GraphOutcome::Stopped(state) => {
                reporter.info("stopped at requested node; resume will continue");
                RunOutcome::Stopped(state)
            }
        }
    }

    // -- rollback internals ----------------------------------------------

    fn rollback_step(
        &self,
        step: StepName,
        report: &mut RollbackReport,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        reporter.info(&format!("rolling back to before step '{}'", step.name()));

        for candidate in [
            StepName::World,
            StepName::ThemeConflict,
            StepName::Characters,
            StepName::Outline,
        ] {
            if candidate.order() >= step.order() {
                if let Some(doc) = candidate.bible_doc() {
                    let path = self.store.project_root().join(doc.file_name());
                    if path.exists() {
                        fs::remove_file(&path).map_err(EngineError::storage)?;
                        report.deleted_files.push(doc.file_name().to_string());
                    }
                }
            }
        }

        // Every step boundary at or before the chapter loop clears the
        // chapter tree and the aggregates.
        let chapters_dir = self.store.chapters_dir();
        if chapters_dir.exists() {
            let count = fs::read_dir(&chapters_dir)
                .map(|entries| entries.filter_map(|e| e.ok()).count())
                .unwrap_or(0);
            fs::remove_dir_all(&chapters_dir).map_err(EngineError::storage)?;
            fs::create_dir_all(&chapters_dir).map_err(EngineError::storage)?;
            report
                .deleted_files
                .push(format!("chapters/* ({count} files)"));
        }
        self.prune_aggregates(1, report)?;
        report.domain_memories_cleared = self
            .domain_memory
            .clear(&self.config.project_name, Some(1), None)
            .unwrap_or(0);
        Ok(())
    }

    /// Delete chapter-scoped files. `scene_gte = None` removes everything
    /// for chapters >= `chapter`; `Some(s)` keeps chapter `chapter`'s plan
    /// and earlier scenes, removing scene `s` onward plus the assembled
    /// content, and everything for later chapters.
    fn delete_chapter_files(
        &self,
        chapter: u32,
        scene_gte: Option<u32>,
        report: &mut RollbackReport,
    ) -> Result<()> {
        let chapters_dir = self.store.chapters_dir();
        let Ok(entries) = fs::read_dir(&chapters_dir) else {
            return Ok(());
        };

        let mut to_delete = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();

            if let Some(caps) = scene_file_regex().captures(&name) {
                let ch: u32 = caps[1].parse().unwrap_or(0);
                let sc: u32 = caps[2].parse().unwrap_or(0);
                let doomed = match scene_gte {
                    None => ch >= chapter,
                    Some(scene) => ch > chapter || (ch == chapter && sc >= scene),
                };
                if doomed {
                    to_delete.push(name);
                }
                continue;
            }

            if let Some(caps) = chapter_any_file_regex().captures(&name) {
                let ch: u32 = caps[1].parse().unwrap_or(0);
                let kind = caps.get(2).map(|m| m.as_str());
                let doomed = match scene_gte {
                    None => ch >= chapter,
                    // Scene rollback keeps the current chapter's plan.
                    Some(_) => match kind {
                        Some("_plan") => ch > chapter,
                        _ => ch >= chapter,
                    },
                };
                if doomed {
                    to_delete.push(name);
                }
            }
        }

        for name in to_delete {
            let path = chapters_dir.join(&name);
            match fs::remove_file(&path) {
                Ok(()) => report.deleted_files.push(format!("chapters/{name}")),
                Err(e) => warn!(file = %path.display(), error = %e, "rollback delete failed"),
            }
        }
        Ok(())
    }

    /// Drop memory and report entries for chapters >= `chapter_gte`.
    fn prune_aggregates(&self, chapter_gte: u32, report: &mut RollbackReport) -> Result<()> {
        let mut memory = self.store.read_memory()?;
        let before = memory.chapters.len();
        memory
            .chapters
            .retain(|_, entry| entry.chapter_id < chapter_gte);
        report.memory_entries_pruned = before - memory.chapters.len();
        if report.memory_entries_pruned > 0 {
            self.store.write_memory(&memory)?;
        }

        let mut reports = self.store.read_reports()?;
        let before = reports.chapters.len();
        reports
            .chapters
            .retain(|_, entry| entry.chapter_id < chapter_gte);
        report.report_entries_pruned = before - reports.chapters.len();
        if report.report_entries_pruned > 0 {
            self.store.write_reports(&reports)?;
        }
        Ok(())
    }

    fn delete_checkpoint_db(&self) -> Result<bool> {
        let db = crate::config::checkpoint_db_path(self.store.project_root());
        let base_name = db
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut deleted = false;
        for suffix in ["", "-wal", "-shm"] {
            let path = db.with_file_name(format!("{base_name}{suffix}"));
            if path.exists() {
                fs::remove_file(&path).map_err(EngineError::storage)?;
                deleted = true;
            }
        }
        Ok(deleted)
    }
}

/// Lenient scene decoding for older layouts: unknown shapes degrade to an
/// empty-content scene rather than failing the merge.
fn scene_from_value(value: &Value, chapter: u32, scene_number: u32) -> Scene {
    let get_str = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let scene_id = {
        let raw = get_str("scene_id");
        if raw.is_empty() {
            format!("{chapter}_{scene_number}")
        } else {
            raw
        }
    };
    Scene {
        scene_id,
        location: get_str("location"),
        characters: value
            .get("characters")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        purpose: get_str("purpose"),
        content: get_str("content"),
        extra: Default::default(),
    }
}
