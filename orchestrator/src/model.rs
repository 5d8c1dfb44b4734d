//! Core data model: Story, StoryStep, and the small enums that drive the
//! lifecycle and wave scheduler.
//!
//! Mirrors the spec's data model section. Kept free of any persistence or
//! execution logic — those live in `store`, `scheduler`, `lifecycle`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a story originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationSource {
    User,
    Guardian,
    ExternalIssue,
}

/// How aggressively the orchestrator is allowed to proceed without human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    /// Every step needs approval.
    Assisted,
    /// Safe capabilities auto-run.
    Autonomous,
    /// All steps auto-run.
    FullAutonomous,
}

/// Story-level lifecycle status. See SPEC_FULL.md §4.7 for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Created,
    Analyzing,
    Analyzed,
    Planning,
    Planned,
    Executing,
    GatePending,
    GateFailed,
    ReadyToComplete,
    Completed,
    Cancelled,
    Failed,
}

impl StoryStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, StoryStatus::Completed | StoryStatus::Cancelled)
    }
}

/// A single work item's capability tag, used to route it to an executor/agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Analysis,
    Coding,
    Testing,
    Review,
    Documentation,
    Fixing,
}

/// Step-level execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Human review disposition for a completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    None,
    Approved,
    Rejected,
}

/// A chat turn attached to a story or a step. Appended, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of a build/test gate run. See `gate` module for the runner itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub gate_type: GateType,
    pub after_wave: u32,
    pub build_output: String,
    pub test_output: String,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub error: Option<String>,
    pub was_cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Build,
    Test,
    Full,
}

/// A single unit of orchestrated work, owned by exactly one Story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryStep {
    pub id: Uuid,
    pub story_id: Uuid,
    /// 1-based, dense within a story.
    pub order: u32,
    /// ≥1.
    pub wave: u32,
    pub name: String,
    pub description: String,
    pub capability: Capability,
    pub language_hint: Option<String>,
    pub assigned_executor: Option<String>,
    pub status: StepStatus,
    pub approval: Approval,
    pub approval_feedback: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub previous_output: Option<String>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
    pub needs_rework: bool,
    pub chat_history: Vec<ChatMessage>,
    /// Step ids this step requires to have completed first.
    pub dependencies: Vec<Uuid>,
}

impl StoryStep {
    pub fn new(
        story_id: Uuid,
        order: u32,
        wave: u32,
        name: impl Into<String>,
        description: impl Into<String>,
        capability: Capability,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            story_id,
            order,
            wave,
            name: name.into(),
            description: description.into(),
            capability,
            language_hint: None,
            assigned_executor: None,
            status: StepStatus::Pending,
            approval: Approval::None,
            approval_feedback: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
            output: None,
            previous_output: None,
            error: None,
            skip_reason: None,
            needs_rework: false,
            chat_history: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.status, StepStatus::Pending) || self.needs_rework
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// The unit of work: a natural-language development request plus its
/// lifecycle state and artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub repository_path: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub creation_source: CreationSource,
    pub priority: u8,
    pub automation_mode: AutomationMode,
    pub preferred_executor: Option<String>,
    pub max_parallelism: u32,
    pub current_wave: u32,
    pub status: StoryStatus,
    pub analyzed_context: Option<String>,
    pub execution_plan: Option<String>,
    pub gate_result: Option<GateResult>,
    pub chat_history: Vec<ChatMessage>,
    pub verification_result: Option<String>,
    pub pull_request_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        repository_path: impl AsRef<Path>,
        creation_source: CreationSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            repository_path: repository_path.as_ref().to_path_buf(),
            worktree_path: None,
            branch_name: None,
            creation_source,
            priority: 0,
            automation_mode: AutomationMode::Assisted,
            preferred_executor: None,
            max_parallelism: 3,
            current_wave: 0,
            status: StoryStatus::Created,
            analyzed_context: None,
            execution_plan: None,
            gate_result: None,
            chat_history: Vec::new(),
            verification_result: None,
            pull_request_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Canonicalize a path for storage/comparison: lowercase, forward-slashed,
    /// trailing separators stripped.
    pub fn canonicalize_path_str(path: impl AsRef<Path>) -> String {
        let s = path.as_ref().to_string_lossy().replace('\\', "/");
        s.trim_end_matches('/').to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_story_starts_created_with_no_worktree() {
        let s = Story::new("Add logging", "desc", "/repo", CreationSource::User);
        assert_eq!(s.status, StoryStatus::Created);
        assert!(s.worktree_path.is_none());
        assert_eq!(s.max_parallelism, 3);
    }

    #[test]
    fn canonicalize_path_strips_trailing_slash_and_lowercases() {
        assert_eq!(
            Story::canonicalize_path_str("/Repo/Path/"),
            "/repo/path"
        );
        assert_eq!(Story::canonicalize_path_str("C:\\Foo\\Bar"), "c:/foo/bar");
    }

    #[test]
    fn new_step_is_runnable_and_not_terminal() {
        let step = StoryStep::new(
            Uuid::new_v4(),
            1,
            1,
            "Write tests",
            "desc",
            Capability::Testing,
        );
        assert!(step.is_runnable());
        assert!(!step.is_terminal());
    }
}
