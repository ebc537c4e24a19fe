//! Declarative validation for persisted artifacts and plugin output.
//!
//! Validation runs at the store boundary (nothing invalid is ever written)
//! and on every plugin's returned issues (invalid output aborts the run).
//! Results carry `{path, message}` pairs so callers can report every
//! problem without unwinding on the first.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::artifacts::{
    AuditResult, ChapterContent, ChapterPlan, ContextPack, Issue, MemoryFile, ReportsFile, Severity,
};
use crate::error::EngineError;

/// One problem found during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Dotted path into the artifact, e.g. `issues[2].fix_instructions`.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a validation attempt.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path, message));
    }

    /// Human-readable messages, one per issue.
    pub fn messages(&self) -> Vec<String> {
        self.issues
            .iter()
            .map(|i| format!("{}: {}", i.path, i.message))
            .collect()
    }

    /// Convert into an error naming the artifact, or `Ok(())` when valid.
    pub fn into_result(self, artifact: &str) -> Result<(), EngineError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(EngineError::validation(artifact, self.issues))
        }
    }
}

/// Parse a raw JSON value into a typed artifact.
///
/// Enum fields (severity, category) are strict, so a malformed artifact is
/// rejected here rather than silently coerced.
pub fn parse_artifact<T: DeserializeOwned>(value: Value, artifact: &str) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| {
        EngineError::validation(artifact, vec![ValidationIssue::new("$", e.to_string())])
    })
}

fn check_issue(issue: &Issue, path: &str, out: &mut ValidationResult) {
    if issue.id.is_empty() {
        out.push(format!("{path}.id"), "must not be empty");
    }
    if issue.summary.is_empty() {
        out.push(format!("{path}.summary"), "must not be empty");
    }
    if issue.severity == Severity::Blocker && issue.fix_instructions.trim().is_empty() {
        out.push(
            format!("{path}.fix_instructions"),
            "blocker issues must include non-empty fix_instructions",
        );
    }
}

/// Validate a list of issues (plugin output, report entries).
pub fn validate_issues(issues: &[Issue]) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for (i, issue) in issues.iter().enumerate() {
        check_issue(issue, &format!("issues[{i}]"), &mut result);
    }
    result
}

/// Validate an aggregated audit result: issue invariants plus counts that
/// match the actual severity breakdown.
pub fn validate_audit_result(audit: &AuditResult) -> ValidationResult {
    let mut result = validate_issues(&audit.issues);

    let blockers = count_severity(&audit.issues, Severity::Blocker);
    let majors = count_severity(&audit.issues, Severity::Major);
    let minors = count_severity(&audit.issues, Severity::Minor);

    if audit.blocker_count != blockers {
        result.push(
            "blocker_count",
            format!("expected {blockers}, found {}", audit.blocker_count),
        );
    }
    if audit.major_count != majors {
        result.push(
            "major_count",
            format!("expected {majors}, found {}", audit.major_count),
        );
    }
    if audit.minor_count != minors {
        result.push(
            "minor_count",
            format!("expected {minors}, found {}", audit.minor_count),
        );
    }
    result
}

fn count_severity(issues: &[Issue], severity: Severity) -> u32 {
    issues.iter().filter(|i| i.severity == severity).count() as u32
}

/// Validate a chapter plan before it is persisted.
pub fn validate_chapter_plan(plan: &ChapterPlan) -> ValidationResult {
    let mut result = ValidationResult::ok();
    if plan.chapter_id == 0 {
        result.push("chapter_id", "must be >= 1");
    }
    if plan.revision_id.is_empty() {
        result.push("revision_id", "must not be empty");
    }
    for (i, scene) in plan.scenes.iter().enumerate() {
        if scene.scene_id.is_empty() {
            result.push(format!("scenes[{i}].scene_id"), "must not be empty");
        }
    }
    result
}

/// Validate chapter content before it is persisted.
pub fn validate_chapter_content(content: &ChapterContent) -> ValidationResult {
    let mut result = ValidationResult::ok();
    if content.chapter_id == 0 {
        result.push("chapter_id", "must be >= 1");
    }
    if content.revision_id.is_empty() {
        result.push("revision_id", "must not be empty");
    }
    for (i, scene) in content.scenes.iter().enumerate() {
        if scene.scene_id.is_empty() {
            result.push(format!("scenes[{i}].scene_id"), "must not be empty");
        }
    }
    result
}

/// Validate the consistency-reports file: every entry keyed by its own
/// chapter id, counts summing to the issue list length.
pub fn validate_reports_file(reports: &ReportsFile) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for (key, entry) in &reports.chapters {
        let path = format!("chapters.{key}");
        if key != &entry.chapter_id.to_string() {
            result.push(
                path.clone(),
                format!("key does not match chapter_id {}", entry.chapter_id),
            );
        }
        if entry.updated_at.is_empty() {
            result.push(format!("{path}.updated_at"), "must not be empty");
        }
        let total = entry.blocker_count + entry.major_count + entry.minor_count;
        if total as usize != entry.issues.len() {
            result.push(
                format!("{path}.issues"),
                format!(
                    "severity counts sum to {total} but {} issues are present",
                    entry.issues.len()
                ),
            );
        }
        for (i, issue) in entry.issues.iter().enumerate() {
            check_issue(issue, &format!("{path}.issues[{i}]"), &mut result);
        }
    }
    result
}

/// Validate the chapter-memory file.
pub fn validate_memory_file(memory: &MemoryFile) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for (key, entry) in &memory.chapters {
        let path = format!("chapters.{key}");
        if key != &entry.chapter_id.to_string() {
            result.push(
                path.clone(),
                format!("key does not match chapter_id {}", entry.chapter_id),
            );
        }
        if entry.updated_at.is_empty() {
            result.push(format!("{path}.updated_at"), "must not be empty");
        }
    }
    result
}

/// Validate an assembled context pack before it enters the state.
pub fn validate_context_pack(pack: &ContextPack) -> ValidationResult {
    let mut result = ValidationResult::ok();
    if pack.project_name.is_empty() {
        result.push("project_name", "must not be empty");
    }
    if pack.chapter_id == 0 {
        result.push("chapter_id", "must be >= 1");
    }
    for (i, source) in pack.retrieved.iter().enumerate() {
        if source.source_id.is_empty() {
            result.push(format!("retrieved[{i}].source_id"), "must not be empty");
        }
        if source.source_path.is_empty() {
            result.push(format!("retrieved[{i}].source_path"), "must not be empty");
        }
        if source.doc_type.is_empty() {
            result.push(format!("retrieved[{i}].doc_type"), "must not be empty");
        }
    }
    result
}
