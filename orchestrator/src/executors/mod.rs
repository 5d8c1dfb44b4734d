//! Executor Registry & Executors (C4): resolves and invokes a step executor
//! (internal agent loop or external CLI subprocess) with a bounded-parallel
//! dispatcher.
//!
//! Grounded on the deleted provider registry's capability/health/priority
//! pattern, generalized from "LLM provider" to "step executor", and on the
//! deepthink mode's semaphore+`JoinSet` fan-out for bounded parallelism.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{ContextProvider, PromptContext};
use crate::model::{Capability, Story, StoryStep};

pub const MAX_AGENT_STEPS: u32 = 15;
pub const STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// JSON envelope persisted into `step.output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    pub agent_id: String,
    pub content: String,
    pub tokens_used: u32,
    pub duration_ms: u64,
}

/// A strategy for running a step: internal agent loop or external CLI.
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Mutates `step` in place to `completed` or `failed`.
    async fn execute_step(
        &self,
        step: &mut StoryStep,
        story: &Story,
        prior_steps: &[StoryStep],
        cancel: CancellationToken,
    );
}

/// Bounded-parallel fan-out over a wave's steps. A free function rather than
/// a trait method so it can be called through `Arc<dyn Executor>` — a
/// default trait method taking `self: Arc<Self>` would require `Self: Sized`
/// and so be unreachable through a trait object. Every task acquires one of
/// `max_parallelism` semaphore permits, executes, and releases it on every
/// exit path (RAII guard). Returns once every task has finished, regardless
/// of individual outcome; a panicking task is logged and dropped from the
/// result set rather than failing its siblings.
pub async fn execute_steps(
    executor: Arc<dyn Executor>,
    steps: Vec<StoryStep>,
    story: Arc<Story>,
    max_parallelism: u32,
    prior_steps: Arc<Vec<StoryStep>>,
    cancel: CancellationToken,
) -> Vec<StoryStep> {
    let semaphore = Arc::new(Semaphore::new(max_parallelism.max(1) as usize));
    let mut joinset: JoinSet<StoryStep> = JoinSet::new();

    for mut step in steps {
        let executor = Arc::clone(&executor);
        let story = Arc::clone(&story);
        let prior_steps = Arc::clone(&prior_steps);
        let cancel = cancel.clone();
        let semaphore = Arc::clone(&semaphore);

        joinset.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            executor.execute_step(&mut step, &story, &prior_steps, cancel).await;
            step
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = joinset.join_next().await {
        match joined {
            Ok(step) => results.push(step),
            Err(e) => warn!(error = %e, "executor task panicked"),
        }
    }
    results
}

/// Resolves a priority-ordered list of executors to the first one available,
/// honoring a story's `preferred_executor` when present and available.
pub struct ExecutorRegistry {
    /// Priority order; index 0 is tried first absent a preference.
    executors: Vec<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new(executors: Vec<Arc<dyn Executor>>) -> Self {
        Self { executors }
    }

    /// Resolution is performed once per wave (by the caller, on the wave's
    /// first step), not per step.
    pub fn resolve(&self, story: &Story) -> Option<Arc<dyn Executor>> {
        if let Some(preferred) = &story.preferred_executor {
            if let Some(executor) = self
                .executors
                .iter()
                .find(|e| e.id() == preferred && e.is_available())
            {
                return Some(Arc::clone(executor));
            }
        }
        self.executors.iter().find(|e| e.is_available()).cloned()
    }
}

/// Builds the shared prompt preamble: step name/description, analyzed
/// context summary, dependency outputs in chronological order, and any
/// revision feedback.
fn build_prompt(step: &StoryStep, story: &Story, prior_steps: &[StoryStep]) -> String {
    let mut prompt = format!("# Task: {}\n\n{}\n", step.name, step.description);

    if let Some(context) = &story.analyzed_context {
        prompt.push_str(&format!("\n## Analyzed context\n{context}\n"));
    }

    let dependency_outputs: Vec<&StoryStep> = prior_steps
        .iter()
        .filter(|s| step.dependencies.contains(&s.id))
        .collect();
    if !dependency_outputs.is_empty() {
        prompt.push_str("\n## Prior step outputs\n");
        for dep in dependency_outputs {
            if let Some(output) = &dep.output {
                prompt.push_str(&format!("### {}\n{}\n", dep.name, output));
            }
        }
    }

    if let Some(feedback) = &step.approval_feedback {
        prompt.push_str(&format!("\n## Revision feedback\n{feedback}\n"));
    }

    prompt
}

/// Spawns an external CLI agent (e.g. a coding assistant binary) per step.
pub struct ExternalCliExecutor {
    id: String,
    binary_path: PathBuf,
    github_token: Option<String>,
}

impl ExternalCliExecutor {
    pub fn new(id: impl Into<String>, binary_path: impl Into<PathBuf>, github_token: Option<String>) -> Self {
        Self {
            id: id.into(),
            binary_path: binary_path.into(),
            github_token,
        }
    }

    fn write_tool_config(&self) -> std::io::Result<PathBuf> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("story-orchestrator-mcp-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::json!({ "mcpServers": {} }).to_string())?;
        Ok(path)
    }

    fn extract_tool_proposal(stdout: &str) -> Option<String> {
        stdout
            .find("### Tool Improvement Proposal")
            .map(|idx| stdout[idx..].to_string())
    }
}

#[async_trait]
impl Executor for ExternalCliExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_available(&self) -> bool {
        self.binary_path.exists()
            || which_on_path(&self.binary_path.to_string_lossy())
    }

    async fn execute_step(
        &self,
        step: &mut StoryStep,
        story: &Story,
        prior_steps: &[StoryStep],
        cancel: CancellationToken,
    ) {
        let start = std::time::Instant::now();
        step.status = crate::model::StepStatus::Running;
        step.started_at = Some(chrono::Utc::now());

        let prompt = build_prompt(step, story, prior_steps);
        let Some(worktree) = &story.worktree_path else {
            step.status = crate::model::StepStatus::Failed;
            step.error = Some("no worktree path set on story".to_string());
            return;
        };

        let config_path = match self.write_tool_config() {
            Ok(p) => p,
            Err(e) => {
                step.status = crate::model::StepStatus::Failed;
                step.error = Some(format!("failed to write tool config: {e}"));
                return;
            }
        };

        let mut command = tokio::process::Command::new(&self.binary_path);
        command
            .arg("-p")
            .arg(&prompt)
            .arg("--yolo")
            .arg("--no-ask-user")
            .arg("--add-dir")
            .arg(worktree)
            .arg("--additional-mcp-config")
            .arg(format!("@{}", config_path.display()))
            .kill_on_drop(true);
        if let Some(token) = &self.github_token {
            command.env("GITHUB_TOKEN", token).env("GH_TOKEN", token);
        }

        let result = tokio::select! {
            output = command.output() => output,
            _ = cancel.cancelled() => {
                step.status = crate::model::StepStatus::Failed;
                step.error = Some("cancelled".to_string());
                let _ = std::fs::remove_file(&config_path);
                return;
            }
        };
        let _ = std::fs::remove_file(&config_path);

        match result {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let envelope = ExecutionEnvelope {
                    agent_id: self.id.clone(),
                    content: stdout.clone(),
                    tokens_used: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                step.output = serde_json::to_string(&envelope).ok();
                if let Some(proposal) = Self::extract_tool_proposal(&stdout) {
                    info!(step_id = %step.id, "tool improvement proposal captured: {proposal}");
                }
                step.status = crate::model::StepStatus::Completed;
                step.completed_at = Some(chrono::Utc::now());
            }
            Ok(output) => {
                step.status = crate::model::StepStatus::Failed;
                step.error = Some(format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
            Err(e) => {
                step.status = crate::model::StepStatus::Failed;
                step.error = Some(format!("failed to spawn executor: {e}"));
            }
        }
    }
}

fn which_on_path(binary_name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(binary_name).is_file())
        })
        .unwrap_or(false)
}

/// Abstraction over the LLM call itself; resolved by capability + language
/// hint. The core depends only on this trait, never on a concrete provider.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    fn capability(&self) -> Capability;
    fn language_hint(&self) -> Option<&str>;
    async fn invoke(&self, prompt: &str) -> Result<AgentResponse, String>;
}

#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub is_final: bool,
    pub tokens_used: u32,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Drives a ReAct-style Thought/Action/Observation loop against a resolved
/// `AgentInvoker`, attaching C3 context. Tool approval is bypassed; human
/// review happens at the step-output level instead.
pub struct InternalAgentExecutor {
    id: String,
    agents: Vec<Arc<dyn AgentInvoker>>,
    context_provider: Arc<dyn ContextProvider>,
    max_steps: u32,
    step_timeout: Duration,
}

impl InternalAgentExecutor {
    pub fn new(
        id: impl Into<String>,
        agents: Vec<Arc<dyn AgentInvoker>>,
        context_provider: Arc<dyn ContextProvider>,
    ) -> Self {
        Self {
            id: id.into(),
            agents,
            context_provider,
            max_steps: MAX_AGENT_STEPS,
            step_timeout: STEP_TIMEOUT,
        }
    }

    fn resolve_agent(&self, step: &StoryStep) -> Option<Arc<dyn AgentInvoker>> {
        self.agents
            .iter()
            .find(|a| {
                a.capability() == step.capability
                    && step
                        .language_hint
                        .as_deref()
                        .map(|hint| a.language_hint() == Some(hint))
                        .unwrap_or(true)
            })
            .or_else(|| self.agents.iter().find(|a| a.capability() == step.capability))
            .cloned()
    }

    async fn run_react_loop(
        &self,
        agent: Arc<dyn AgentInvoker>,
        initial_prompt: String,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        let mut transcript = initial_prompt;
        for _iteration in 0..self.max_steps {
            if cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            let response = tokio::select! {
                r = agent.invoke(&transcript) => r?,
                _ = cancel.cancelled() => return Err("cancelled".to_string()),
            };
            if response.is_final || response.tool_calls.is_empty() {
                return Ok(response.content);
            }
            // Tool execution is delegated to the agent's own harness; here we
            // only fold the observation back into the running transcript.
            transcript.push_str(&format!(
                "\n\nObservation: executed {} tool call(s)\n",
                response.tool_calls.len()
            ));
        }
        Err("max agent steps exhausted".to_string())
    }
}

#[async_trait]
impl Executor for InternalAgentExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_available(&self) -> bool {
        !self.agents.is_empty()
    }

    async fn execute_step(
        &self,
        step: &mut StoryStep,
        story: &Story,
        prior_steps: &[StoryStep],
        cancel: CancellationToken,
    ) {
        let start = std::time::Instant::now();
        step.status = crate::model::StepStatus::Running;
        step.started_at = Some(chrono::Utc::now());

        let Some(agent) = self.resolve_agent(step) else {
            step.status = crate::model::StepStatus::Failed;
            step.error = Some(format!("no agent available for capability {:?}", step.capability));
            return;
        };

        let mut prompt = build_prompt(step, story, prior_steps);
        if let Some(worktree) = &story.worktree_path {
            let context: PromptContext = self.context_provider.for_coding(
                worktree,
                &[step.name.clone(), step.description.clone()],
                &crate::context::extract_file_references(&format!("{} {}", step.name, step.description)),
            );
            prompt.push_str("\n\n");
            prompt.push_str(&context.render());
        }

        let deadline = tokio::time::sleep(self.step_timeout);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            result = self.run_react_loop(agent, prompt, cancel.clone()) => result,
            _ = &mut deadline => Err("timeout".to_string()),
        };

        match outcome {
            Ok(content) => {
                let envelope = ExecutionEnvelope {
                    agent_id: self.id.clone(),
                    content,
                    tokens_used: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                step.output = serde_json::to_string(&envelope).ok();
                step.status = crate::model::StepStatus::Completed;
                step.completed_at = Some(chrono::Utc::now());
            }
            Err(e) => {
                step.status = crate::model::StepStatus::Failed;
                step.error = Some(e);
            }
        }
    }
}
