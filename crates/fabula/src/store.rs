//! Artifact persistence for a project.
//!
//! All project I/O funnels through [`ArtifactStore`]:
//! - canonical paths for every artifact type
//! - atomic bundle writes for chapter artifacts (temp files, then rename)
//! - UTF-8 JSON, pretty-printed, non-ASCII preserved
//! - synchronized updates of content + memory + reports
//!
//! Layout under the project root:
//! ```text
//! settings.json
//! world.json / characters.json / theme_conflict.json / outline.json
//! chapters/chapter_<nnn>_plan.json
//! chapters/chapter_<nnn>.json
//! chapters/scene_<ccc>_<sss>.json      (older layout, consumed on resume)
//! consistency_reports.json
//! chapter_memory.json
//! data/                                (checkpoint + retrieval databases)
//! events.jsonl
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::artifacts::{
    ArtifactMeta, AuditResult, ChapterContent, ChapterPlan, MemoryEntry, MemoryFile, ReportEntry,
    ReportsFile, Settings,
};
use crate::error::{EngineError, Result};
use crate::schema;

pub const SETTINGS_FILE: &str = "settings.json";
pub const WORLD_FILE: &str = "world.json";
pub const CHARACTERS_FILE: &str = "characters.json";
pub const THEME_CONFLICT_FILE: &str = "theme_conflict.json";
pub const OUTLINE_FILE: &str = "outline.json";
pub const REPORTS_FILE: &str = "consistency_reports.json";
pub const MEMORY_FILE: &str = "chapter_memory.json";

/// The four bible documents, in bootstrap order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BibleDoc {
    World,
    Characters,
    ThemeConflict,
    Outline,
}

impl BibleDoc {
    pub fn file_name(&self) -> &'static str {
        match self {
            BibleDoc::World => WORLD_FILE,
            BibleDoc::Characters => CHARACTERS_FILE,
            BibleDoc::ThemeConflict => THEME_CONFLICT_FILE,
            BibleDoc::Outline => OUTLINE_FILE,
        }
    }
}

/// Owns all artifact reads and writes under one project root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    project_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.project_root.join("chapters")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.project_root.join("data")
    }

    pub fn chapter_plan_path(&self, chapter_id: u32) -> PathBuf {
        self.chapters_dir()
            .join(format!("chapter_{chapter_id:03}_plan.json"))
    }

    pub fn chapter_content_path(&self, chapter_id: u32) -> PathBuf {
        self.chapters_dir()
            .join(format!("chapter_{chapter_id:03}.json"))
    }

    pub fn scene_path(&self, chapter_id: u32, scene_id: u32) -> PathBuf {
        self.chapters_dir()
            .join(format!("scene_{chapter_id:03}_{scene_id:03}.json"))
    }

    pub fn project_exists(&self) -> bool {
        self.project_root.join(SETTINGS_FILE).exists()
    }

    /// Create the project directory tree and write `settings.json`.
    /// Fails if the project already exists.
    pub fn init_project(
        &self,
        project_name: &str,
        author: &str,
        num_chapters: Option<u32>,
    ) -> Result<()> {
        if self.project_exists() {
            return Err(EngineError::user(format!(
                "project '{project_name}' already exists at {}",
                self.project_root.display()
            )));
        }
        fs::create_dir_all(self.chapters_dir()).map_err(EngineError::storage)?;
        fs::create_dir_all(self.data_dir()).map_err(EngineError::storage)?;

        let settings = Settings {
            meta: ArtifactMeta::now(crate::artifacts::ENGINE_ID),
            project_name: project_name.to_string(),
            author: author.to_string(),
            created_at: Utc::now().to_rfc3339(),
            num_chapters,
            extra: Default::default(),
        };
        self.write_json(&self.project_root.join(SETTINGS_FILE), &settings)
    }

    // -- bible ------------------------------------------------------------

    pub fn read_bible(&self, doc: BibleDoc) -> Result<Value> {
        self.read_json_or_empty(&self.project_root.join(doc.file_name()))
    }

    pub fn write_bible(&self, doc: BibleDoc, data: &Value) -> Result<()> {
        self.write_json(&self.project_root.join(doc.file_name()), data)
    }

    // -- per-chapter reads ------------------------------------------------

    pub fn read_chapter_plan(&self, chapter_id: u32) -> Result<Option<ChapterPlan>> {
        self.read_typed(&self.chapter_plan_path(chapter_id), "chapter_plan")
    }

    pub fn read_chapter_content(&self, chapter_id: u32) -> Result<Option<ChapterContent>> {
        self.read_typed(&self.chapter_content_path(chapter_id), "chapter_content")
    }

    pub fn read_settings(&self) -> Result<Option<Settings>> {
        self.read_typed(&self.project_root.join(SETTINGS_FILE), "settings")
    }

    pub fn read_reports(&self) -> Result<ReportsFile> {
        Ok(self
            .read_typed(&self.project_root.join(REPORTS_FILE), "consistency_reports")?
            .unwrap_or_default())
    }

    pub fn read_memory(&self) -> Result<MemoryFile> {
        Ok(self
            .read_typed(&self.project_root.join(MEMORY_FILE), "chapter_memory")?
            .unwrap_or_default())
    }

    pub fn write_reports(&self, reports: &ReportsFile) -> Result<()> {
        schema::validate_reports_file(reports).into_result(REPORTS_FILE)?;
        self.write_json(&self.project_root.join(REPORTS_FILE), reports)
    }

    pub fn write_memory(&self, memory: &MemoryFile) -> Result<()> {
        schema::validate_memory_file(memory).into_result(MEMORY_FILE)?;
        self.write_json(&self.project_root.join(MEMORY_FILE), memory)
    }

    // -- chapter bundle ---------------------------------------------------

    /// Persist one chapter's artifacts as an atomic bundle: the plan, the
    /// content, and the two derived aggregate files. Either all four files
    /// reflect the new `revision_id` afterwards or none do.
    ///
    /// Re-running with a `revision_id` that is already on disk is a no-op,
    /// so replaying the store node after an interrupt cannot drift.
    pub fn write_chapter_bundle(
        &self,
        chapter_id: u32,
        plan: &ChapterPlan,
        content: &ChapterContent,
        audit: &AuditResult,
    ) -> Result<()> {
        let plan_path = self.chapter_plan_path(chapter_id);
        let content_path = self.chapter_content_path(chapter_id);
        let reports_path = self.project_root.join(REPORTS_FILE);
        let memory_path = self.project_root.join(MEMORY_FILE);

        let revision_id = if !content.revision_id.is_empty() {
            content.revision_id.clone()
        } else {
            plan.revision_id.clone()
        };
        if !revision_id.is_empty()
            && self.bundle_already_persisted(&plan_path, &content_path, &revision_id)
        {
            debug!(chapter_id, %revision_id, "bundle already persisted, skipping");
            return Ok(());
        }

        // Nothing invalid may reach the disk, including the issue list that
        // lands inside the reports entry.
        schema::validate_issues(&audit.issues).into_result("audit.issues")?;

        let reports = self.prepare_reports(chapter_id, audit)?;
        let memory = self.prepare_memory(chapter_id, content)?;

        schema::validate_reports_file(&reports).into_result(REPORTS_FILE)?;
        schema::validate_memory_file(&memory).into_result(MEMORY_FILE)?;

        let files: Vec<(PathBuf, Value)> = vec![
            (plan_path, serde_json::to_value(plan)?),
            (content_path, serde_json::to_value(content)?),
            (reports_path, serde_json::to_value(&reports)?),
            (memory_path, serde_json::to_value(&memory)?),
        ];

        self.atomic_write_bundle(files)
    }

    fn bundle_already_persisted(
        &self,
        plan_path: &Path,
        content_path: &Path,
        revision_id: &str,
    ) -> bool {
        if !(plan_path.exists() && content_path.exists()) {
            return false;
        }
        let read_revision = |path: &Path| -> Option<String> {
            let value: Value = serde_json::from_str(&fs::read_to_string(path).ok()?).ok()?;
            Some(value.get("revision_id")?.as_str()?.to_string())
        };
        read_revision(plan_path).as_deref() == Some(revision_id)
            && read_revision(content_path).as_deref() == Some(revision_id)
    }

    /// Write several files as one atomic bundle.
    ///
    /// Phase 1 writes every payload into a temp directory under the project
    /// root (same filesystem, so rename is atomic). Phase 2 backs up each
    /// existing target into the temp directory and renames the new file into
    /// place. Any failure restores the backups in reverse order; the temp
    /// directory is removed best-effort either way.
    fn atomic_write_bundle(&self, files: Vec<(PathBuf, Value)>) -> Result<()> {
        for (target, _) in &files {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(EngineError::storage)?;
            }
        }
        fs::create_dir_all(&self.project_root).map_err(EngineError::storage)?;

        let temp_dir = self.create_temp_dir()?;
        let result = self.atomic_write_bundle_inner(&temp_dir, &files);
        let _ = fs::remove_dir_all(&temp_dir);
        result
    }

    fn atomic_write_bundle_inner(&self, temp_dir: &Path, files: &[(PathBuf, Value)]) -> Result<()> {
        // Phase 1: stage every payload.
        let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(files.len());
        for (i, (target, data)) in files.iter().enumerate() {
            let temp_path = temp_dir.join(format!("file_{i}.json"));
            write_pretty_json(&temp_path, data).map_err(|e| EngineError::AtomicWrite {
                message: format!("staging {} failed", target.display()),
                source: Some(e),
            })?;
            staged.push((temp_path, target.as_path()));
        }

        // Phase 2: back up, then replace.
        let mut completed: Vec<(&Path, Option<PathBuf>)> = Vec::with_capacity(files.len());
        for (temp_path, target) in &staged {
            let target: &Path = target;
            let backup = if target.exists() {
                let name = target
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unnamed".to_string());
                let backup_path = temp_dir.join(format!("backup_{name}"));
                if let Err(e) = fs::copy(target, &backup_path) {
                    self.rollback_renames(&completed);
                    return Err(EngineError::AtomicWrite {
                        message: format!("backup of {} failed", target.display()),
                        source: Some(e),
                    });
                }
                Some(backup_path)
            } else {
                None
            };

            if let Err(e) = fs::rename(temp_path, target) {
                self.rollback_renames(&completed);
                return Err(EngineError::AtomicWrite {
                    message: format!("replacing {} failed", target.display()),
                    source: Some(e),
                });
            }
            fsync_parent_dir(target);
            completed.push((target, backup));
        }

        Ok(())
    }

    /// Undo completed renames in reverse order. Best effort: a target with a
    /// backup is restored, one without is deleted.
    fn rollback_renames(&self, completed: &[(&Path, Option<PathBuf>)]) {
        for (target, backup) in completed.iter().rev() {
            match backup {
                Some(backup_path) if backup_path.exists() => {
                    let _ = fs::rename(backup_path, target);
                }
                _ => {
                    let _ = fs::remove_file(target);
                }
            }
        }
    }

    fn create_temp_dir(&self) -> Result<PathBuf> {
        for _ in 0..16 {
            let suffix: u32 = rand::random();
            let candidate = self
                .project_root
                .join(format!(".fabula_atomic_{suffix:08x}"));
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(EngineError::storage(e)),
            }
        }
        Err(EngineError::Storage(
            "could not create bundle temp directory".to_string(),
        ))
    }

    fn prepare_reports(&self, chapter_id: u32, audit: &AuditResult) -> Result<ReportsFile> {
        let mut reports = self.read_reports()?;
        if reports.meta.generated_at.is_empty() {
            reports.meta = ArtifactMeta::now(crate::artifacts::ENGINE_ID);
        }
        let now = Utc::now().to_rfc3339();
        reports.chapters.insert(
            chapter_id.to_string(),
            ReportEntry {
                chapter_id,
                issues: audit.issues.clone(),
                blocker_count: audit.blocker_count,
                major_count: audit.major_count,
                minor_count: audit.minor_count,
                updated_at: now.clone(),
                major_over_threshold: audit.major_over_threshold,
                qa_major_max: Some(audit.qa_major_max),
                extra: Default::default(),
            },
        );
        reports.updated_at = Some(now);
        Ok(reports)
    }

    fn prepare_memory(&self, chapter_id: u32, content: &ChapterContent) -> Result<MemoryFile> {
        let mut memory = self.read_memory()?;
        if memory.meta.generated_at.is_empty() {
            memory.meta = ArtifactMeta::now(crate::artifacts::ENGINE_ID);
        }
        let now = Utc::now().to_rfc3339();
        let title = if content.title.is_empty() {
            format!("Chapter {chapter_id}")
        } else {
            content.title.clone()
        };
        memory.chapters.insert(
            chapter_id.to_string(),
            MemoryEntry {
                chapter_id,
                title,
                scene_count: content.scenes.len() as u32,
                word_count: content.word_count,
                updated_at: now.clone(),
                extra: Default::default(),
            },
        );
        memory.updated_at = Some(now);
        Ok(memory)
    }

    // -- json plumbing ----------------------------------------------------

    /// Single-file atomic write: temp file next to the target, rename over.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(EngineError::storage)?;
        }
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_value(value)?;
        write_pretty_json(&tmp, &data).map_err(EngineError::storage)?;
        fs::rename(&tmp, path).map_err(|e| {
            EngineError::Storage(format!(
                "failed to rename {} to {}: {e}",
                tmp.display(),
                path.display()
            ))
        })?;
        fsync_parent_dir(path);
        Ok(())
    }

    fn read_json_or_empty(&self, path: &Path) -> Result<Value> {
        if !path.exists() {
            return Ok(Value::Object(Default::default()));
        }
        let text = fs::read_to_string(path).map_err(EngineError::storage)?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::Storage(format!("failed to parse {}: {e}", path.display()))
        })
    }

    fn read_typed<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
        artifact: &str,
    ) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path).map_err(EngineError::storage)?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            EngineError::Storage(format!("failed to parse {}: {e}", path.display()))
        })?;
        schema::parse_artifact(value, artifact).map(Some)
    }
}

/// Pretty-printed UTF-8 JSON with non-ASCII characters preserved.
fn write_pretty_json(path: &Path, value: &Value) -> std::io::Result<()> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    let mut f = File::create(path)?;
    f.write_all(&data)?;
    f.sync_all().ok();
    Ok(())
}

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are ignored because
/// not all platforms support opening a directory for sync.
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Category, Issue, Scene, Severity};
    use serde_json::Map;
    use tempfile::tempdir;

    fn sample_plan(chapter_id: u32, revision_id: &str) -> ChapterPlan {
        ChapterPlan {
            meta: ArtifactMeta::now("fabula/run_t/rev"),
            chapter_id,
            run_id: "run_t".to_string(),
            revision_id: revision_id.to_string(),
            pov: "Mara".to_string(),
            goal: "reach the signal tower".to_string(),
            scenes: vec![crate::artifacts::ScenePlan {
                scene_id: format!("{chapter_id}_1"),
                location: "the tower road".to_string(),
                characters: vec!["Mara".to_string()],
                purpose: "establish the goal".to_string(),
                key_actions: vec!["find the map".to_string()],
                extra: Default::default(),
            }],
            ..Default::default()
        }
    }

    fn sample_content(chapter_id: u32, revision_id: &str) -> ChapterContent {
        ChapterContent {
            meta: ArtifactMeta::now("fabula/run_t/rev"),
            chapter_id,
            run_id: "run_t".to_string(),
            revision_id: revision_id.to_string(),
            title: format!("Chapter {chapter_id}"),
            scenes: vec![Scene {
                scene_id: format!("{chapter_id}_1"),
                location: "the tower road".to_string(),
                characters: vec!["Mara".to_string()],
                purpose: "establish the goal".to_string(),
                content: "Mara walked the tower road and weighed the cost.".to_string(),
                extra: Default::default(),
            }],
            word_count: 42,
            extra: Default::default(),
        }
    }

    fn clean_audit(chapter_id: u32) -> AuditResult {
        AuditResult {
            chapter_id,
            qa_major_max: 3,
            ..Default::default()
        }
    }

    #[test]
    fn init_project_writes_settings_and_dirs() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));

        store.init_project("proj", "someone", None).expect("init");
        assert!(store.project_exists());
        assert!(store.chapters_dir().exists());
        assert!(store.data_dir().exists());

        let settings = store.read_settings().expect("read").expect("exists");
        assert_eq!(settings.project_name, "proj");
        assert_eq!(settings.author, "someone");
    }

    #[test]
    fn init_project_fails_when_project_exists() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        let err = store.init_project("proj", "", None).expect_err("must fail");
        assert!(matches!(err, EngineError::User(_)));
    }

    #[test]
    fn bundle_write_creates_all_four_files() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        store
            .write_chapter_bundle(1, &sample_plan(1, "r0"), &sample_content(1, "r0"), &clean_audit(1))
            .expect("bundle");

        assert!(store.chapter_plan_path(1).exists());
        assert!(store.chapter_content_path(1).exists());

        let reports = store.read_reports().expect("reports");
        assert!(reports.chapters.contains_key("1"));
        assert_eq!(reports.chapters["1"].blocker_count, 0);

        let memory = store.read_memory().expect("memory");
        assert_eq!(memory.chapters["1"].scene_count, 1);
        assert_eq!(memory.chapters["1"].word_count, 42);
    }

    #[test]
    fn bundle_replay_with_same_revision_is_noop() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        let plan = sample_plan(1, "run_t_ch001_r0");
        let content = sample_content(1, "run_t_ch001_r0");
        let audit = clean_audit(1);

        store.write_chapter_bundle(1, &plan, &content, &audit).expect("first");
        let first = fs::read(store.chapter_content_path(1)).expect("read");
        let first_reports = fs::read(td.path().join("proj").join(REPORTS_FILE)).expect("read");

        store.write_chapter_bundle(1, &plan, &content, &audit).expect("second");
        let second = fs::read(store.chapter_content_path(1)).expect("read");
        let second_reports = fs::read(td.path().join("proj").join(REPORTS_FILE)).expect("read");

        assert_eq!(first, second);
        assert_eq!(first_reports, second_reports);
    }

    #[test]
    fn bundle_write_with_new_revision_overwrites() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        store
            .write_chapter_bundle(1, &sample_plan(1, "r0"), &sample_content(1, "r0"), &clean_audit(1))
            .expect("first");

        let mut content = sample_content(1, "r1");
        content.word_count = 99;
        store
            .write_chapter_bundle(1, &sample_plan(1, "r1"), &content, &clean_audit(1))
            .expect("second");

        let stored = store
            .read_chapter_content(1)
            .expect("read")
            .expect("exists");
        assert_eq!(stored.revision_id, "r1");
        assert_eq!(stored.word_count, 99);
    }

    #[test]
    fn bundle_rejects_blocker_without_fix_instructions() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        let audit = AuditResult {
            chapter_id: 1,
            issues: vec![Issue {
                id: "I-001-001".to_string(),
                severity: Severity::Blocker,
                category: Category::WorldRule,
                summary: "broken".to_string(),
                evidence: Map::new(),
                fix_instructions: String::new(),
                fix_options: vec![],
            }],
            blocker_count: 1,
            ..Default::default()
        };

        let err = store
            .write_chapter_bundle(1, &sample_plan(1, "r0"), &sample_content(1, "r0"), &audit)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(!store.chapter_plan_path(1).exists());
    }

    #[test]
    fn failed_bundle_write_rolls_back_completed_renames() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        // Seed an existing bundle so rollback has old state to restore.
        store
            .write_chapter_bundle(1, &sample_plan(1, "r0"), &sample_content(1, "r0"), &clean_audit(1))
            .expect("seed");
        let old_plan = fs::read(store.chapter_plan_path(1)).expect("read");
        let old_reports =
            fs::read(td.path().join("proj").join(REPORTS_FILE)).expect("read reports");
        let old_memory = fs::read(td.path().join("proj").join(MEMORY_FILE)).expect("read memory");

        // Force the second rename (content) to fail: a file cannot be
        // renamed over an existing directory.
        let content_path = store.chapter_content_path(1);
        fs::remove_file(&content_path).expect("remove");
        fs::create_dir(&content_path).expect("blocker dir");
        fs::write(content_path.join("occupied"), "x").expect("occupy");

        let err = store
            .write_chapter_bundle(1, &sample_plan(1, "r1"), &sample_content(1, "r1"), &clean_audit(1))
            .expect_err("must fail");
        assert!(matches!(err, EngineError::AtomicWrite { .. }));

        // The plan rename happened first and must have been rolled back.
        let restored_plan = fs::read(store.chapter_plan_path(1)).expect("read");
        assert_eq!(restored_plan, old_plan);

        // Later targets were never touched.
        assert_eq!(
            fs::read(td.path().join("proj").join(REPORTS_FILE)).expect("read"),
            old_reports
        );
        assert_eq!(
            fs::read(td.path().join("proj").join(MEMORY_FILE)).expect("read"),
            old_memory
        );

        // No temp directories left behind.
        let leftovers: Vec<_> = fs::read_dir(td.path().join("proj"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".fabula_atomic_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_first_write_leaves_no_new_files() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        // Block the very first target (the plan).
        let plan_path = store.chapter_plan_path(1);
        fs::create_dir_all(&plan_path).expect("blocker dir");
        fs::write(plan_path.join("occupied"), "x").expect("occupy");

        let err = store
            .write_chapter_bundle(1, &sample_plan(1, "r0"), &sample_content(1, "r0"), &clean_audit(1))
            .expect_err("must fail");
        assert!(matches!(err, EngineError::AtomicWrite { .. }));

        assert!(!store.chapter_content_path(1).exists());
        assert!(!td.path().join("proj").join(REPORTS_FILE).exists());
        assert!(!td.path().join("proj").join(MEMORY_FILE).exists());
    }

    #[test]
    fn written_json_preserves_non_ascii() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        let world = serde_json::json!({"name": "修仙世界", "genre": "仙侠"});
        store.write_bible(BibleDoc::World, &world).expect("write");

        let raw = fs::read_to_string(td.path().join("proj").join(WORLD_FILE)).expect("read");
        assert!(raw.contains("修仙世界"));
        assert!(!raw.contains("\\u"));

        let back = store.read_bible(BibleDoc::World).expect("read");
        assert_eq!(back["name"], "修仙世界");
    }

    #[test]
    fn read_bible_returns_empty_object_when_missing() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        let world = store.read_bible(BibleDoc::World).expect("read");
        assert_eq!(world, serde_json::json!({}));
    }

    #[test]
    fn bundle_preserves_other_chapters_entries() {
        let td = tempdir().expect("tempdir");
        let store = ArtifactStore::new(td.path().join("proj"));
        store.init_project("proj", "", None).expect("init");

        store
            .write_chapter_bundle(1, &sample_plan(1, "a_r0"), &sample_content(1, "a_r0"), &clean_audit(1))
            .expect("ch1");
        store
            .write_chapter_bundle(2, &sample_plan(2, "a2_r0"), &sample_content(2, "a2_r0"), &clean_audit(2))
            .expect("ch2");

        let memory = store.read_memory().expect("memory");
        assert!(memory.chapters.contains_key("1"));
        assert!(memory.chapters.contains_key("2"));
        let reports = store.read_reports().expect("reports");
        assert_eq!(reports.chapters.len(), 2);
    }
}
