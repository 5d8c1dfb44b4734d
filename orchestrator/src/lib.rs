//! Story Orchestrator: a durable, resumable engine that decomposes a
//! natural-language development request ("story") into an ordered DAG of
//! executable steps and drives those steps through analyze → plan →
//! execute-in-waves → gate → finalize against an isolated per-story git
//! worktree.
//!
//! The crate is organized around the components of the design:
//!
//! - [`model`] — the Story/StoryStep data model.
//! - [`store`] — durable persistence with CAS on story status (C1).
//! - [`worktree`] — per-story git worktree allocation and branch ops (C2).
//! - [`context`] — the `ContextProvider` trait and a filesystem-backed default (C3).
//! - [`executors`] — the `Executor`/`AgentInvoker` traits, the external-CLI and
//!   internal-agent executors, and bounded-parallel dispatch (C4).
//! - [`gate`] — the build/test quality gate runner (C5).
//! - [`scheduler`] — the wave scheduler driving execute → gate → advance (C6).
//! - [`lifecycle`] — the phase controller enforcing status transitions (C7).
//! - [`events`] — the typed progress event stream (C8).
//!
//! None of the LLM inference, code generation, version control internals, or
//! semantic search live in this crate — those are injected as trait objects
//! (`AgentInvoker`, `ContextProvider`) or shelled out to (`git`, build/test
//! subprocesses). This crate guarantees orchestration idempotence: safe
//! re-entry into `runStream` from any persisted state, not step idempotence
//! at the agent level.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executors;
pub mod gate;
pub mod lifecycle;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod worktree;

pub use config::Config;
pub use context::{ContextProvider, FileSystemContextProvider};
pub use error::{
    GateError, LifecycleError, OrchestratorError, SchedulerError, StoreError, WorktreeError,
};
pub use events::{ProgressEvent, ProgressReceiver, ProgressSender};
pub use executors::{AgentInvoker, AgentResponse, Executor, ExecutorRegistry};
pub use gate::QualityGateRunner;
pub use lifecycle::LifecycleController;
pub use model::{
    Approval, AutomationMode, Capability, ChatMessage, CreationSource, GateResult, GateType,
    Story, StepStatus, StoryStatus, StoryStep,
};
pub use scheduler::WaveScheduler;
pub use store::{SharedStoryStore, StoryStore};
pub use worktree::WorktreeCoordinator;
