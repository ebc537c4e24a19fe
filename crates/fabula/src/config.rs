//! Configuration loaded from environment variables, with derived paths.
//!
//! All variables are optional with defaults; CLI flags override them. The
//! project root is `<base_dir>/<project_name>` and every other path hangs
//! off it.

use std::path::{Path, PathBuf};

use crate::cancel::DEFAULT_PARALLEL_WORKERS;
use crate::error::{EngineError, Result};

pub const DEFAULT_NUM_CHAPTERS: u32 = 1;
pub const DEFAULT_MAX_REVISION_ROUNDS: u32 = 3;
pub const DEFAULT_QA_BLOCKER_MAX: u32 = 0;
pub const DEFAULT_QA_MAJOR_MAX: u32 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_name: String,
    /// Directory that holds all projects.
    pub base_dir: PathBuf,
    pub author: String,

    pub num_chapters: u32,
    pub max_revision_rounds: u32,
    pub qa_blocker_max: u32,
    pub qa_major_max: u32,
    pub parallel_workers: usize,
}

impl Config {
    /// Load configuration from the environment. `project_name` overrides
    /// `PROJECT_NAME`; one of the two must be present.
    pub fn load(project_name: Option<&str>, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let name = match project_name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => std::env::var("PROJECT_NAME")
                .ok()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    EngineError::user(
                        "project name must be given via the command line or PROJECT_NAME",
                    )
                })?,
        };
        validate_project_name(&name)?;

        Ok(Self {
            project_name: name,
            base_dir: base_dir.into(),
            author: env_string("AUTHOR", ""),
            num_chapters: env_u32("NUM_CHAPTERS", DEFAULT_NUM_CHAPTERS)?,
            max_revision_rounds: env_u32("MAX_REVISION_ROUNDS", DEFAULT_MAX_REVISION_ROUNDS)?,
            qa_blocker_max: env_u32("QA_BLOCKER_MAX", DEFAULT_QA_BLOCKER_MAX)?,
            qa_major_max: env_u32("QA_MAJOR_MAX", DEFAULT_QA_MAJOR_MAX)?,
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
        })
    }

    pub fn project_root(&self) -> PathBuf {
        self.base_dir.join(&self.project_name)
    }

    pub fn chapters_dir(&self) -> PathBuf {
        self.project_root().join("chapters")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.project_root().join("data")
    }

    pub fn checkpoint_db(&self) -> PathBuf {
        self.project_root().join("workflow_checkpoints.db")
    }

    pub fn retrieval_db(&self) -> PathBuf {
        self.data_dir().join("retrieval.db")
    }
}

/// Project names become directory names; keep them to a safe alphabet.
pub fn validate_project_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(EngineError::user(format!(
            "invalid project name '{name}': use ASCII letters, digits, '-' or '_' (max 64 chars)"
        )))
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|_| EngineError::user(format!("{key} must be a non-negative integer: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Checkpoint database path derived from a bare project root, for callers
/// that do not carry a full [`Config`] (rollback, status, tests).
pub fn checkpoint_db_path(project_root: &Path) -> PathBuf {
    project_root.join("workflow_checkpoints.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_name_wins_and_paths_derive() {
        let config = Config::load(Some("demo"), "/tmp/projects").expect("load");
        assert_eq!(config.project_name, "demo");
        assert_eq!(config.project_root(), PathBuf::from("/tmp/projects/demo"));
        assert_eq!(
            config.checkpoint_db(),
            PathBuf::from("/tmp/projects/demo/workflow_checkpoints.db")
        );
        assert_eq!(
            config.retrieval_db(),
            PathBuf::from("/tmp/projects/demo/data/retrieval.db")
        );
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::load(Some("demo"), ".").expect("load");
        assert_eq!(config.num_chapters, DEFAULT_NUM_CHAPTERS);
        assert_eq!(config.max_revision_rounds, DEFAULT_MAX_REVISION_ROUNDS);
        assert_eq!(config.qa_blocker_max, DEFAULT_QA_BLOCKER_MAX);
        assert_eq!(config.qa_major_max, DEFAULT_QA_MAJOR_MAX);
    }

    #[test]
    fn missing_name_is_a_user_error() {
        // Only run the negative case when the ambient env does not define
        // PROJECT_NAME (test environments are kept clean of it).
        if std::env::var("PROJECT_NAME").is_err() {
            let err = Config::load(None, ".").expect_err("must fail");
            assert!(matches!(err, EngineError::User(_)));
        }
    }

    #[test]
    fn hostile_project_names_are_rejected() {
        assert!(validate_project_name("ok-name_1").is_ok());
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("../escape").is_err());
        assert!(validate_project_name("a b").is_err());
        assert!(validate_project_name(&"x".repeat(65)).is_err());
    }
}
