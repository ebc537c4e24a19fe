//! The chapter-generation graph engine.
//!
//! Nine nodes, one cycle (audit → patch → audit, bounded by the revision
//! budget), and a checkpoint after every node. The engine owns the state
//! while a thread executes; the checkpointer takes an immutable snapshot at
//! every node boundary, so an interrupted run resumes at the exact next
//! node.
//!
//! Replay safety: before a node's checkpoint lands, its incremental update
//! is recorded as pending writes against the previous checkpoint. A crash
//! between the two leaves the writes behind; on resume the engine applies
//! them instead of re-running the node.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use fabula_retry::Backoff;
use serde_json::Value;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::checkpoint::{
    Checkpoint, CheckpointMetadata, CheckpointTuple, SqliteCheckpointer, ThreadConfig,
};
use crate::error::{EngineError, Result};
use crate::events::{EventLog, EventType, RunEvent, events_path};
use crate::nodes::{self, AuditRoute};
use crate::plugins::PluginRegistry;
use crate::providers::GenerationProviders;
use crate::state::{State, StateUpdate};
use crate::store::ArtifactStore;

/// Default cap on node executions per invocation.
pub const DEFAULT_RECURSION_LIMIT: u32 = 25;

/// The node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    BuildContextPack,
    PlanChapter,
    WriteChapter,
    AuditChapter,
    ApplyPatch,
    StoreArtifacts,
    AdvanceChapter,
    MarkHumanReview,
    MarkComplete,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::BuildContextPack => "build_context_pack",
            Node::PlanChapter => "plan_chapter",
            Node::WriteChapter => "write_chapter",
            Node::AuditChapter => "audit_chapter",
            Node::ApplyPatch => "apply_patch",
            Node::StoreArtifacts => "store_artifacts",
            Node::AdvanceChapter => "advance_chapter",
            Node::MarkHumanReview => "mark_human_review",
            Node::MarkComplete => "mark_complete",
        }
    }

    pub fn parse(name: &str) -> Option<Node> {
        match name {
            "build_context_pack" => Some(Node::BuildContextPack),
            "plan_chapter" => Some(Node::PlanChapter),
            "write_chapter" => Some(Node::WriteChapter),
            "audit_chapter" => Some(Node::AuditChapter),
            "apply_patch" => Some(Node::ApplyPatch),
            "store_artifacts" => Some(Node::StoreArtifacts),
            "advance_chapter" => Some(Node::AdvanceChapter),
            "mark_human_review" => Some(Node::MarkHumanReview),
            "mark_complete" => Some(Node::MarkComplete),
            _ => None,
        }
    }
}

/// Per-invocation run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// One project has one thread; `thread_id = project_name`.
    pub thread_id: String,
    /// Cap on node executions for this invocation.
    pub recursion_limit: u32,
    /// Stop gracefully after this node completes (checkpoint included).
    pub stop_at: Option<Node>,
}

impl RunConfig {
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            stop_at: None,
        }
    }

    /// Budget covering `num_chapters` chapters with full revision loops,
    /// plus the terminal nodes.
    pub fn recursion_limit_for(num_chapters: u32, max_revision_rounds: u32) -> u32 {
        let per_chapter = 7 + 2 * max_revision_rounds;
        num_chapters.saturating_mul(per_chapter).saturating_add(8)
    }
}

/// How an invocation ended.
#[derive(Debug)]
pub enum GraphOutcome {
    /// Reached END (completed or needs_human_review is set on the state).
    Finished(State),
    /// Shutdown observed between nodes; the last checkpoint is the resume
    /// point.
    Interrupted(State),
    /// `stop_at` reached; the checkpoint for that node is final.
    Stopped(State),
}

impl GraphOutcome {
    pub fn state(&self) -> &State {
        match self {
            GraphOutcome::Finished(s) | GraphOutcome::Interrupted(s) | GraphOutcome::Stopped(s) => s,
        }
    }
}

/// The compiled chapter-generation workflow for one project.
pub struct ChapterGraph {
    store: ArtifactStore,
    retrieval_db: PathBuf,
    providers: GenerationProviders,
    registry: PluginRegistry,
    checkpointer: SqliteCheckpointer,
    cancel: CancelToken,
    provider_backoff: Backoff,
    event_log: EventLog,
    events_file: PathBuf,
}

impl ChapterGraph {
    pub fn new(
        store: ArtifactStore,
        retrieval_db: PathBuf,
        providers: GenerationProviders,
        registry: PluginRegistry,
        checkpointer: SqliteCheckpointer,
        cancel: CancelToken,
    ) -> Self {
        let events_file = events_path(store.project_root());
        Self {
            store,
            retrieval_db,
            providers,
            registry,
            checkpointer,
            cancel,
            provider_backoff: Backoff::default(),
            event_log: EventLog::new(),
            events_file,
        }
    }

    /// Override the retry schedule wrapped around provider calls.
    pub fn with_provider_backoff(mut self, backoff: Backoff) -> Self {
        self.provider_backoff = backoff;
        self
    }

    /// Latest checkpoint tuple for a thread.
    pub fn latest(&self, thread_id: &str) -> Result<Option<CheckpointTuple>> {
        self.checkpointer
            .get_tuple(&ThreadConfig::for_thread(thread_id))
    }

    /// Execute the graph. `initial = Some` starts a fresh run from the
    /// entry node; `None` resumes from the latest checkpoint.
    pub fn invoke(&mut self, initial: Option<State>, cfg: &RunConfig) -> Result<GraphOutcome> {
        let thread = ThreadConfig::for_thread(&cfg.thread_id);
        let mut executed: u32 = 0;

        let mut cursor = match initial {
            Some(state) => self.start_fresh(&thread, state)?,
            None => self.load_cursor(&thread)?,
        };

        // Replay dedup: a crash after put_writes but before the checkpoint
        // leaves the next node's update behind; apply it instead of
        // re-running the node.
        if let Some(node) = cursor.next {
            let recorded: Vec<(String, Value)> = cursor
                .pending
                .iter()
                .filter(|w| w.task_id == node.name())
                .map(|w| (w.channel.clone(), w.value.clone()))
                .collect();
            if !recorded.is_empty() {
                debug!(node = node.name(), "applying pending writes instead of re-running");
                let update = StateUpdate::from_channel_values(&recorded)?;
                cursor.next = self.commit(&mut cursor, node, update)?;
            }
        }
        cursor.pending.clear();

        while let Some(node) = cursor.next {
            if executed >= cfg.recursion_limit {
                return Err(EngineError::RecursionLimit(cfg.recursion_limit));
            }
            if self.cancel.is_cancelled() {
                self.event_log.record(RunEvent::now(
                    EventType::RunInterrupted,
                    Some(cursor.state.current_chapter),
                ));
                self.flush_events();
                info!(node = node.name(), "shutdown observed, stopping before node");
                return Ok(GraphOutcome::Interrupted(cursor.state));
            }

            let update = self.run_node(node, &cursor.state)?;
            executed += 1;

            let writes = update.to_channel_values()?;
            if !writes.is_empty() {
                self.checkpointer
                    .put_writes(&cursor.config, &writes, node.name(), "")?;
            }

            cursor.next = self.commit(&mut cursor, node, update)?;

            if cfg.stop_at == Some(node) {
                info!(node = node.name(), "stop_at reached");
                self.flush_events();
                return Ok(GraphOutcome::Stopped(cursor.state));
            }
        }

        self.event_log.record(RunEvent::now(
            EventType::RunFinished {
                completed: cursor.state.completed,
            },
            Some(cursor.state.current_chapter),
        ));
        self.flush_events();
        Ok(GraphOutcome::Finished(cursor.state))
    }

    /// Merge an out-of-band update into the latest checkpoint (used by
    /// resume-time reconciliation). `next_override` may retarget the node
    /// the next invocation starts from; `Some(None)` parks the thread at
    /// END.
    pub fn update_state(
        &mut self,
        thread_id: &str,
        update: &StateUpdate,
        next_override: Option<Option<Node>>,
    ) -> Result<()> {
        let thread = ThreadConfig::for_thread(thread_id);
        let tuple = self.checkpointer.get_tuple(&thread)?.ok_or_else(|| {
            EngineError::Corruption(format!("no checkpoint for thread '{thread_id}'"))
        })?;

        let mut state = State::from_channels(tuple.checkpoint.channel_values.clone())?;
        state.apply(update);

        let mut versions = tuple.checkpoint.channel_versions.clone();
        let mut new_versions = BTreeMap::new();
        for channel in update.changed_channels() {
            let bumped = self
                .checkpointer
                .next_version(versions.get(channel).map(String::as_str));
            versions.insert(channel.to_string(), bumped.clone());
            new_versions.insert(channel.to_string(), bumped);
        }

        let next = match next_override {
            Some(next) => next.map(|n| n.name().to_string()),
            None => tuple.metadata.next.clone(),
        };

        let checkpoint = Checkpoint {
            id: self.checkpointer.new_checkpoint_id(),
            ts: Utc::now().to_rfc3339(),
            channel_values: state.to_channels()?,
            channel_versions: versions,
        };
        let metadata = CheckpointMetadata {
            source: "update".to_string(),
            step: tuple.metadata.step + 1,
            node: "__update__".to_string(),
            next,
            extra: Default::default(),
        };
        self.checkpointer
            .put(&tuple.config, &checkpoint, &metadata, &new_versions)?;
        Ok(())
    }

    // -- internals --------------------------------------------------------

    fn start_fresh(&mut self, thread: &ThreadConfig, state: State) -> Result<Cursor> {
        let channels = state.to_channels()?;
        let mut versions = BTreeMap::new();
        for channel in channels.keys() {
            versions.insert(channel.clone(), self.checkpointer.next_version(None));
        }

        let checkpoint = Checkpoint {
            id: self.checkpointer.new_checkpoint_id(),
            ts: Utc::now().to_rfc3339(),
            channel_values: channels,
            channel_versions: versions.clone(),
        };
        let metadata = CheckpointMetadata {
            source: "input".to_string(),
            step: -1,
            node: "__input__".to_string(),
            next: Some(Node::BuildContextPack.name().to_string()),
            extra: Default::default(),
        };
        let config = self
            .checkpointer
            .put(thread, &checkpoint, &metadata, &versions)?;

        self.event_log.record(RunEvent::now(
            EventType::RunStarted {
                run_id: state.run_id.clone(),
                num_chapters: state.num_chapters,
            },
            None,
        ));

        Ok(Cursor {
            state,
            next: Some(Node::BuildContextPack),
            versions,
            config,
            step: 0,
            pending: Vec::new(),
        })
    }

    fn load_cursor(&mut self, thread: &ThreadConfig) -> Result<Cursor> {
        let tuple = self.checkpointer.get_tuple(thread)?.ok_or_else(|| {
            EngineError::Corruption(format!(
                "no checkpoint for thread '{}'",
                thread.thread_id
            ))
        })?;

        let state = State::from_channels(tuple.checkpoint.channel_values.clone())?;
        let next = match &tuple.metadata.next {
            Some(name) => Some(Node::parse(name).ok_or_else(|| {
                EngineError::Corruption(format!("checkpoint names unknown node '{name}'"))
            })?),
            None => None,
        };

        self.event_log.record(RunEvent::now(
            EventType::RunResumed {
                checkpoint_id: tuple.checkpoint.id.clone(),
            },
            Some(state.current_chapter),
        ));

        Ok(Cursor {
            state,
            next,
            versions: tuple.checkpoint.channel_versions.clone(),
            config: tuple.config.clone(),
            step: tuple.metadata.step + 1,
            pending: tuple.pending_writes,
        })
    }

    fn run_node(&self, node: Node, state: &State) -> Result<StateUpdate> {
        debug!(node = node.name(), chapter = state.current_chapter, "executing node");
        match node {
            Node::BuildContextPack => {
                nodes::build_context_pack(state, &self.store, &self.retrieval_db)
            }
            Node::PlanChapter => nodes::plan_chapter(
                state,
                self.providers.planner.as_ref(),
                &self.provider_backoff,
            ),
            Node::WriteChapter => nodes::write_chapter(
                state,
                self.providers.writer.as_ref(),
                &self.provider_backoff,
            ),
            Node::AuditChapter => nodes::audit_chapter(state, &self.registry),
            Node::ApplyPatch => nodes::apply_patch(
                state,
                self.providers.patcher.as_ref(),
                &self.provider_backoff,
            ),
            Node::StoreArtifacts => nodes::store_artifacts(state, &self.store),
            Node::AdvanceChapter => Ok(nodes::advance_chapter(state)),
            Node::MarkHumanReview => Ok(nodes::mark_human_review(state)),
            Node::MarkComplete => Ok(nodes::mark_complete(state)),
        }
    }

    /// Apply a node's update, route, and finalize the checkpoint for this
    /// transition. Returns the next node.
    fn commit(
        &mut self,
        cursor: &mut Cursor,
        node: Node,
        update: StateUpdate,
    ) -> Result<Option<Node>> {
        cursor.state.apply(&update);
        let next = route(node, &cursor.state);

        let mut new_versions = BTreeMap::new();
        for channel in update.changed_channels() {
            let bumped = self
                .checkpointer
                .next_version(cursor.versions.get(channel).map(String::as_str));
            cursor.versions.insert(channel.to_string(), bumped.clone());
            new_versions.insert(channel.to_string(), bumped);
        }

        let checkpoint = Checkpoint {
            id: self.checkpointer.new_checkpoint_id(),
            ts: Utc::now().to_rfc3339(),
            channel_values: cursor.state.to_channels()?,
            channel_versions: cursor.versions.clone(),
        };
        let metadata = CheckpointMetadata {
            source: "loop".to_string(),
            step: cursor.step,
            node: node.name().to_string(),
            next: next.map(|n| n.name().to_string()),
            extra: Default::default(),
        };
        cursor.config = self
            .checkpointer
            .put(&cursor.config, &checkpoint, &metadata, &new_versions)?;
        cursor.step += 1;

        self.record_transition_events(node, next, &cursor.state);
        self.flush_events();
        Ok(next)
    }

    fn record_transition_events(&mut self, node: Node, next: Option<Node>, state: &State) {
        let chapter = Some(state.current_chapter);
        self.event_log.record(RunEvent::now(
            EventType::NodeCompleted {
                node: node.name().to_string(),
            },
            chapter,
        ));
        match (node, next) {
            (Node::AuditChapter, Some(Node::ApplyPatch)) => {
                self.event_log.record(RunEvent::now(
                    EventType::RevisionTriggered {
                        revision_round: state.revision_round,
                        blocker_count: state
                            .audit_result
                            .as_ref()
                            .map(|a| a.blocker_count)
                            .unwrap_or(0),
                    },
                    chapter,
                ));
            }
            (Node::StoreArtifacts, _) => {
                self.event_log.record(RunEvent::now(
                    EventType::ChapterStored {
                        revision_id: state.revision_id.clone(),
                    },
                    chapter,
                ));
            }
            (Node::MarkHumanReview, _) => {
                self.event_log
                    .record(RunEvent::now(EventType::HumanReviewRequired, chapter));
            }
            _ => {}
        }
    }

    fn flush_events(&mut self) {
        if let Err(e) = self.event_log.flush_to_file(&self.events_file) {
            debug!(error = %e, "event log flush failed");
        }
    }
}

/// Static routing table plus the two conditional edges.
fn route(node: Node, state: &State) -> Option<Node> {
    match node {
        Node::BuildContextPack => Some(Node::PlanChapter),
        Node::PlanChapter => Some(Node::WriteChapter),
        Node::WriteChapter => Some(Node::AuditChapter),
        Node::AuditChapter => Some(match nodes::should_revise(state) {
            AuditRoute::Revise => Node::ApplyPatch,
            AuditRoute::Store => Node::StoreArtifacts,
            AuditRoute::HumanReview => Node::MarkHumanReview,
        }),
        Node::ApplyPatch => Some(Node::AuditChapter),
        Node::StoreArtifacts => Some(if nodes::should_continue_chapters(state) {
            Node::AdvanceChapter
        } else {
            Node::MarkComplete
        }),
        Node::AdvanceChapter => Some(Node::BuildContextPack),
        Node::MarkHumanReview | Node::MarkComplete => None,
    }
}

/// Execution cursor: the state and checkpoint position of one invocation.
struct Cursor {
    state: State,
    next: Option<Node>,
    versions: BTreeMap<String, String>,
    config: ThreadConfig,
    step: i64,
    pending: Vec<crate::checkpoint::PendingWrite>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{Bootstrap, RuleBasedBootstrap};
    use crate::providers::fakes;
    use tempfile::tempdir;

    fn graph_for(
        td: &tempfile::TempDir,
        providers: GenerationProviders,
    ) -> (ArtifactStore, ChapterGraph) {
        let store = ArtifactStore::new(td.path().join("proj"));
        if !store.project_exists() {
            store.init_project("proj", "", None).expect("init");
        }
        let checkpointer =
            SqliteCheckpointer::open(td.path().join("proj").join("workflow_checkpoints.db"))
                .expect("open");
        let graph = ChapterGraph::new(
            store.clone(),
            td.path().join("proj").join("data").join("retrieval.db"),
            providers,
            PluginRegistry::with_defaults(),
            checkpointer,
            CancelToken::isolated(),
        );
        (store, graph)
    }

    fn bootstrapped_state(store: &ArtifactStore, num_chapters: u32, max_rounds: u32) -> State {
        let mut state = State::initial("proj", num_chapters, "修仙世界", max_rounds, 0, 3);
        let result = RuleBasedBootstrap
            .ensure_background_assets(store, &state.prompt, num_chapters, &state.generator(), false)
            .expect("bootstrap");
        state.requirements = result.requirements;
        state.world = result.world;
        state.characters = result.characters;
        state.theme_conflict = result.theme_conflict;
        state.outline = result.outline;
        state
    }

    fn run_cfg(num_chapters: u32, max_rounds: u32) -> RunConfig {
        let mut cfg = RunConfig::for_thread("proj");
        cfg.recursion_limit = RunConfig::recursion_limit_for(num_chapters, max_rounds);
        cfg
    }

    #[test]
    fn single_chapter_clean_pass_completes() {
        let td = tempdir().expect("tempdir");
        let (store, mut graph) = graph_for(&td, GenerationProviders::templates());
        let state = bootstrapped_state(&store, 1, 3);

        let outcome = graph.invoke(Some(state), &run_cfg(1, 3)).expect("invoke");
        let final_state = match outcome {
            GraphOutcome::Finished(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert!(final_state.completed);
        assert!(!final_state.needs_human_review);
        assert_eq!(final_state.revision_round, 0);
        assert_eq!(final_state.current_chapter, 1);

        assert!(store.chapter_plan_path(1).exists());
        assert!(store.chapter_content_path(1).exists());
        let reports = store.read_reports().expect("reports");
        assert_eq!(reports.chapters["1"].blocker_count, 0);
        let memory = store.read_memory().expect("memory");
        assert!(memory.chapters["1"].scene_count >= 1);
    }

    #[test]
    fn revision_loop_converges_with_template_patcher() {
        let td = tempdir().expect("tempdir");
        let providers = GenerationProviders {
            planner: Box::new(crate::providers::TemplatePlanner),
            writer: Box::new(fakes::PlaceholderWriter),
            patcher: Box::new(crate::providers::TemplatePatcher),
        };
        let (store, mut graph) = graph_for(&td, providers);
        let state = bootstrapped_state(&store, 1, 3);

        let outcome = graph.invoke(Some(state), &run_cfg(1, 3)).expect("invoke");
        let final_state = match outcome {
            GraphOutcome::Finished(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert!(final_state.completed);
        assert!(final_state.revision_round >= 1);
        let audit = final_state.audit_result.expect("audit");
        assert_eq!(audit.blocker_count, 0);

        let content = store
            .read_chapter_content(1)
            .expect("read")
            .expect("exists");
        for scene in &content.scenes {
            assert!(!scene.content.contains(crate::plugins::PLACEHOLDER_MARKER));
        }
        assert!(content.revision_id.ends_with("_r1"));
    }

    #[test]
    fn transient_writer_degrades_and_the_patcher_recovers_the_chapter() {
        struct TransientWriter;
        impl crate::providers::Writer for TransientWriter {
            fn write(
                &self,
                _state: &State,
                _plan: &crate::artifacts::ChapterPlan,
                _context_pack: Option<&crate::artifacts::ContextPack>,
            ) -> Result<crate::artifacts::ChapterContent, EngineError> {
                Err(EngineError::Transient {
                    operation: "writer.write".to_string(),
                    message: "timed out".to_string(),
                })
            }
        }

        let td = tempdir().expect("tempdir");
        let providers = GenerationProviders {
            planner: Box::new(crate::providers::TemplatePlanner),
            writer: Box::new(TransientWriter),
            patcher: Box::new(crate::providers::TemplatePatcher),
        };
        let (store, graph) = graph_for(&td, providers);
        let mut graph = graph.with_provider_backoff(Backoff::immediate(2));
        let state = bootstrapped_state(&store, 1, 3);

        let outcome = graph.invoke(Some(state), &run_cfg(1, 3)).expect("invoke");
        let final_state = match outcome {
            GraphOutcome::Finished(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };

        // The degraded zero-scene draft was a blocker; one patch round
        // recovered it and the chapter stored.
        assert!(final_state.completed);
        assert!(final_state.revision_round >= 1);
        let content = store
            .read_chapter_content(1)
            .expect("read")
            .expect("exists");
        assert!(!content.scenes.is_empty());
        assert!(content.word_count > 0);
    }

    #[test]
    fn exhausted_revisions_end_in_human_review_without_store() {
        let td = tempdir().expect("tempdir");
        let providers = GenerationProviders {
            planner: Box::new(crate::providers::TemplatePlanner),
            writer: Box::new(fakes::PlaceholderWriter),
            patcher: Box::new(fakes::NoopPatcher),
        };
        let (store, mut graph) = graph_for(&td, providers);
        let state = bootstrapped_state(&store, 1, 1);

        let outcome = graph.invoke(Some(state), &run_cfg(1, 1)).expect("invoke");
        let final_state = match outcome {
            GraphOutcome::Finished(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert!(final_state.needs_human_review);
        assert!(!final_state.completed);
        assert!(!store.chapter_content_path(1).exists());

        // The checkpoint retains the last audit.
        let tuple = graph.latest("proj").expect("latest").expect("present");
        let checkpoint_state = State::from_channels(tuple.checkpoint.channel_values).expect("state");
        let audit = checkpoint_state.audit_result.expect("audit");
        assert!(audit.blocker_count > 0);
    }

    #[test]
    fn multi_chapter_run_stores_every_chapter() {
        let td = tempdir().expect("tempdir");
        let (store, mut graph) = graph_for(&td, GenerationProviders::templates());
        let state = bootstrapped_state(&store, 2, 3);

        let outcome = graph.invoke(Some(state), &run_cfg(2, 3)).expect("invoke");
        let final_state = match outcome {
            GraphOutcome::Finished(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };

        assert!(final_state.completed);
        assert_eq!(final_state.current_chapter, 2);
        for chapter in 1..=2u32 {
            assert!(store.chapter_plan_path(chapter).exists());
            assert!(store.chapter_content_path(chapter).exists());
        }
        let memory = store.read_memory().expect("memory");
        assert!(memory.chapters.contains_key("1"));
        assert!(memory.chapters.contains_key("2"));
        let reports = store.read_reports().expect("reports");
        assert!(reports.chapters.contains_key("1"));
        assert!(reports.chapters.contains_key("2"));
    }

    #[test]
    fn stop_at_then_resume_matches_uninterrupted_run() {
        let td = tempdir().expect("tempdir");
        let (store, mut graph) = graph_for(&td, GenerationProviders::templates());
        let state = bootstrapped_state(&store, 1, 3);

        let mut cfg = run_cfg(1, 3);
        cfg.stop_at = Some(Node::WriteChapter);
        let outcome = graph.invoke(Some(state), &cfg).expect("invoke");
        let stopped_state = match outcome {
            GraphOutcome::Stopped(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let written_revision = stopped_state
            .chapter_draft
            .as_ref()
            .expect("draft")
            .revision_id
            .clone();
        assert!(!store.chapter_content_path(1).exists());

        // Resume from the checkpoint; audit runs next.
        let outcome = graph.invoke(None, &run_cfg(1, 3)).expect("resume");
        let final_state = match outcome {
            GraphOutcome::Finished(s) => s,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert!(final_state.completed);

        let content = store
            .read_chapter_content(1)
            .expect("read")
            .expect("exists");
        assert_eq!(content.revision_id, written_revision);
    }

    #[test]
    fn resume_at_end_returns_finished_without_work() {
        let td = tempdir().expect("tempdir");
        let (store, mut graph) = graph_for(&td, GenerationProviders::templates());
        let state = bootstrapped_state(&store, 1, 3);

        graph.invoke(Some(state), &run_cfg(1, 3)).expect("run");
        let outcome = graph.invoke(None, &run_cfg(1, 3)).expect("resume");
        match outcome {
            GraphOutcome::Finished(s) => assert!(s.completed),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancelled_token_interrupts_between_nodes() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");
        let checkpointer =
            SqliteCheckpointer::open(td.path().join("proj").join("workflow_checkpoints.db"))
                .expect("open");
        let cancel = CancelToken::isolated();
        cancel.cancel();
        let mut graph = ChapterGraph::new(
            store.clone(),
            td.path().join("proj").join("data").join("retrieval.db"),
            GenerationProviders::templates(),
            PluginRegistry::with_defaults(),
            checkpointer,
            cancel,
        );

        let state = bootstrapped_state(&store, 1, 3);
        let outcome = graph.invoke(Some(state), &run_cfg(1, 3)).expect("invoke");
        match outcome {
            GraphOutcome::Interrupted(s) => {
                assert!(!s.completed);
                assert!(!s.needs_human_review);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The input checkpoint is the resume point.
        let tuple = graph.latest("proj").expect("latest").expect("present");
        assert_eq!(tuple.metadata.next.as_deref(), Some("build_context_pack"));
    }

    #[test]
    fn recursion_limit_is_a_terminal_failure() {
        let td = tempdir().expect("tempdir");
        let (store, mut graph) = graph_for(&td, GenerationProviders::templates());
        let state = bootstrapped_state(&store, 1, 3);

        let mut cfg = run_cfg(1, 3);
        cfg.recursion_limit = 2;
        let err = graph.invoke(Some(state), &cfg).expect_err("must fail");
        assert!(matches!(err, EngineError::RecursionLimit(2)));
    }

    #[test]
    fn update_state_retargets_next_node() {
        let td = tempdir().expect("tempdir");
        let (store, mut graph) = graph_for(&td, GenerationProviders::templates());
        let state = bootstrapped_state(&store, 2, 3);

        let mut cfg = run_cfg(2, 3);
        cfg.stop_at = Some(Node::StoreArtifacts);
        graph.invoke(Some(state), &cfg).expect("run to store");

        // Pretend reconciliation decided chapter 1 is done and the run
        // should advance.
        graph
            .update_state(
                "proj",
                &StateUpdate::default(),
                Some(Some(Node::AdvanceChapter)),
            )
            .expect("update");

        let tuple = graph.latest("proj").expect("latest").expect("present");
        assert_eq!(tuple.metadata.next.as_deref(), Some("advance_chapter"));
        assert_eq!(tuple.metadata.source, "update");

        let outcome = graph.invoke(None, &run_cfg(2, 3)).expect("resume");
        match outcome {
            GraphOutcome::Finished(s) => {
                assert!(s.completed);
                assert_eq!(s.current_chapter, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn recursion_limit_budget_covers_worst_case() {
        // One chapter with three failed revisions: context + plan + write +
        // audit + 3 * (patch + audit) + human review = 11 nodes.
        assert!(RunConfig::recursion_limit_for(1, 3) >= 11);
        // Two clean chapters: 2 * 7 + terminal = 15.
        assert!(RunConfig::recursion_limit_for(2, 3) >= 15);
    }
}
