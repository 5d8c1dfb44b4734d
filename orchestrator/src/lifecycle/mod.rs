//! Lifecycle Controller (C7): coordinates analyze / plan / decompose / run /
//! finalize phases, enforces status transitions, manages step-level
//! operations and retries.
//!
//! Grounded on the teacher's phase-gated coordination style (each operation
//! checks the precondition status, transitions, persists, and never leaves
//! the story in an intermediate status on failure) generalized from
//! session/ensemble phases to the story lifecycle in SPEC_FULL.md §4.7.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::context::ContextProvider;
use crate::error::{LifecycleError, LifecycleResult};
use crate::events::ProgressReceiver;
use crate::executors::AgentInvoker;
use crate::model::{Approval, Capability, ChatMessage, Story, StoryStatus, StoryStep};
use crate::scheduler::WaveScheduler;
use crate::store::SharedStoryStore;
use crate::worktree::WorktreeCoordinator;

fn require_status(story: &Story, allowed: &[StoryStatus], operation: &str) -> LifecycleResult<()> {
    if !allowed.contains(&story.status) {
        return Err(LifecycleError::InvalidState {
            operation: operation.to_string(),
            status: format!("{:?}", story.status),
        });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PlannedStep {
    name: String,
    description: String,
    capability: Capability,
    #[serde(default)]
    wave: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DecomposedTask {
    name: String,
    description: String,
    capability: Capability,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Structured-output JSON is preferred; absent that, a regex-based
/// extraction of the first `[…]` array is the documented fallback. A single
/// generic coding step guarantees progress when both fail.
fn parse_plan_response(content: &str) -> Vec<PlannedStep> {
    if let Ok(steps) = serde_json::from_str::<Vec<PlannedStep>>(content) {
        return steps;
    }
    if let Some(array_text) = extract_first_json_array(content) {
        if let Ok(steps) = serde_json::from_str::<Vec<PlannedStep>>(&array_text) {
            return steps;
        }
    }
    vec![PlannedStep {
        name: "Implement feature".to_string(),
        description: content.to_string(),
        capability: Capability::Coding,
        wave: Some(1),
    }]
}

fn parse_decompose_response(content: &str) -> Vec<DecomposedTask> {
    if let Ok(tasks) = serde_json::from_str::<Vec<DecomposedTask>>(content) {
        return tasks;
    }
    if let Some(array_text) = extract_first_json_array(content) {
        if let Ok(tasks) = serde_json::from_str::<Vec<DecomposedTask>>(&array_text) {
            return tasks;
        }
    }
    vec![DecomposedTask {
        name: "Implement feature".to_string(),
        description: content.to_string(),
        capability: Capability::Coding,
        dependencies: Vec::new(),
    }]
}

fn extract_first_json_array(text: &str) -> Option<String> {
    let re = Regex::new(r"(?s)\[.*\]").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

/// Assigns wave numbers by topological level: a task's wave is one more
/// than the deepest of its dependencies' waves, roots starting at wave 1.
fn assign_waves_by_topology(tasks: &[DecomposedTask]) -> LifecycleResult<Vec<u32>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: Vec<NodeIndex> = Vec::with_capacity(tasks.len());
    let mut name_to_index: HashMap<&str, usize> = HashMap::new();

    for (i, task) in tasks.iter().enumerate() {
        nodes.push(graph.add_node(i));
        name_to_index.insert(&task.name, i);
    }
    for (i, task) in tasks.iter().enumerate() {
        for dep_name in &task.dependencies {
            if let Some(&dep_index) = name_to_index.get(dep_name.as_str()) {
                graph.add_edge(nodes[dep_index], nodes[i], ());
            }
        }
    }

    let order = toposort(&graph, None)
        .map_err(|_| LifecycleError::Validation("dependency cycle in decomposed tasks".to_string()))?;

    let mut waves = vec![1u32; tasks.len()];
    for node in order {
        let task_index = graph[node];
        let max_dep_wave = graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|dep_node| waves[graph[dep_node]])
            .max();
        waves[task_index] = max_dep_wave.map(|w| w + 1).unwrap_or(1);
    }
    Ok(waves)
}

pub struct LifecycleController {
    store: SharedStoryStore,
    worktree: Arc<WorktreeCoordinator>,
    scheduler: Arc<WaveScheduler>,
    context_provider: Arc<dyn ContextProvider>,
    analysis_agents: Vec<Arc<dyn AgentInvoker>>,
    planning_agents: Vec<Arc<dyn AgentInvoker>>,
    base_branch: Option<String>,
    github_token: Option<String>,
}

impl LifecycleController {
    pub fn new(
        store: SharedStoryStore,
        worktree: Arc<WorktreeCoordinator>,
        scheduler: Arc<WaveScheduler>,
        context_provider: Arc<dyn ContextProvider>,
        analysis_agents: Vec<Arc<dyn AgentInvoker>>,
        planning_agents: Vec<Arc<dyn AgentInvoker>>,
        github_token: Option<String>,
    ) -> Self {
        Self {
            store,
            worktree,
            scheduler,
            context_provider,
            analysis_agents,
            planning_agents,
            base_branch: None,
            github_token,
        }
    }

    /// Source root for context queries: the story's worktree once allocated,
    /// else the repository root (analyze/plan may run before `ensure_worktree`).
    fn context_source_root(story: &Story) -> &std::path::Path {
        story.worktree_path.as_deref().unwrap_or(&story.repository_path)
    }

    fn get_story(&self, story_id: Uuid) -> LifecycleResult<Story> {
        self.store
            .get_story(&story_id)?
            .ok_or_else(|| LifecycleError::NotFound(story_id.to_string()))
    }

    /// Allocates the story's worktree and branch; idempotent if already set.
    pub fn ensure_worktree(&self, story_id: Uuid) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        if story.worktree_path.is_some() {
            return Ok(story);
        }

        let branch = crate::worktree::derive_branch_name("story", &story.title, &story.id);
        let path = self.worktree.create_worktree(&story.repository_path, &branch, self.base_branch.as_deref())?;

        Ok(self.store.update_story(&story_id, |s| {
            s.worktree_path = Some(path.clone());
            s.branch_name = Some(branch.clone());
        })?)
    }

    pub async fn analyze(&self, story_id: Uuid) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        require_status(&story, &[StoryStatus::Created, StoryStatus::Analyzed], "analyze")?;

        self.store.update_story_status(&story_id, StoryStatus::Analyzing)?;

        let Some(agent) = self.analysis_agents.first() else {
            self.store.update_story_status(&story_id, StoryStatus::Failed)?;
            return Err(LifecycleError::Validation("no analysis agent configured".to_string()));
        };

        let context = self.context_provider.for_documentation(
            Self::context_source_root(&story),
            &[story.title.clone(), story.description.clone()],
            &crate::context::extract_file_references(&format!("{} {}", story.title, story.description)),
        );
        let prompt = format!(
            "# Analyze\n\n{}\n\n{}\n\n{}",
            story.title,
            story.description,
            context.render()
        );
        match agent.invoke(&prompt).await {
            Ok(response) => Ok(self.store.update_story(&story_id, |s| {
                s.analyzed_context = Some(response.content);
                s.status = StoryStatus::Analyzed;
            })?),
            Err(e) => {
                self.store.update_story_status(&story_id, StoryStatus::Failed)?;
                Err(LifecycleError::Validation(format!("analysis failed: {e}")))
            }
        }
    }

    pub async fn plan(&self, story_id: Uuid) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        require_status(&story, &[StoryStatus::Analyzed], "plan")?;

        self.store.update_story_status(&story_id, StoryStatus::Planning)?;

        let Some(agent) = self.planning_agents.first() else {
            self.store.update_story_status(&story_id, StoryStatus::Failed)?;
            return Err(LifecycleError::Validation("no planning agent configured".to_string()));
        };

        let context = self.context_provider.for_documentation(
            Self::context_source_root(&story),
            &[story.title.clone()],
            &[],
        );
        let prompt = format!(
            "# Plan\n\n{}\n\n## Analyzed context\n{}\n\n{}",
            story.title,
            story.analyzed_context.clone().unwrap_or_default(),
            context.render()
        );
        let response = agent
            .invoke(&prompt)
            .await
            .map_err(|e| LifecycleError::Validation(format!("planning failed: {e}")))?;

        let planned = parse_plan_response(&response.content);
        let steps: Vec<StoryStep> = planned
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let mut step = StoryStep::new(story_id, (i + 1) as u32, p.wave.unwrap_or(1), p.name, p.description, p.capability);
                step.id = Uuid::new_v4();
                step
            })
            .collect();

        self.store.replace_steps(&story_id, &steps)?;
        Ok(self.store.update_story_status(&story_id, StoryStatus::Planned)?)
    }

    pub async fn decompose(&self, story_id: Uuid) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        require_status(&story, &[StoryStatus::Analyzed], "decompose")?;

        self.store.update_story_status(&story_id, StoryStatus::Planning)?;

        let Some(agent) = self.planning_agents.first() else {
            self.store.update_story_status(&story_id, StoryStatus::Failed)?;
            return Err(LifecycleError::Validation("no planning agent configured".to_string()));
        };

        let prompt = format!(
            "# Decompose with dependencies\n\n{}\n\n## Analyzed context\n{}",
            story.title,
            story.analyzed_context.clone().unwrap_or_default()
        );
        let response = agent
            .invoke(&prompt)
            .await
            .map_err(|e| LifecycleError::Validation(format!("decomposition failed: {e}")))?;

        let tasks = parse_decompose_response(&response.content);
        let waves = assign_waves_by_topology(&tasks)?;

        let mut steps: Vec<StoryStep> = tasks
            .iter()
            .zip(&waves)
            .enumerate()
            .map(|(i, (task, wave))| {
                StoryStep::new(story_id, (i + 1) as u32, *wave, &task.name, &task.description, task.capability)
            })
            .collect();

        // Map each task's name-keyed dependencies onto the generated step ids
        // so `executors::build_prompt` can later pull dependency outputs into
        // a dependent step's prompt.
        let name_to_id: HashMap<&str, Uuid> =
            tasks.iter().zip(&steps).map(|(task, step)| (task.name.as_str(), step.id)).collect();
        for (task, step) in tasks.iter().zip(steps.iter_mut()) {
            step.dependencies = task
                .dependencies
                .iter()
                .filter_map(|dep_name| name_to_id.get(dep_name.as_str()).copied())
                .collect();
        }

        self.store.replace_steps(&story_id, &steps)?;
        Ok(self.store.update_story_status(&story_id, StoryStatus::Planned)?)
    }

    pub async fn run(&self, story_id: Uuid, cancel: CancellationToken) -> LifecycleResult<ProgressReceiver> {
        let story = self.get_story(story_id)?;
        require_status(
            &story,
            &[StoryStatus::Planned, StoryStatus::Executing, StoryStatus::GatePending],
            "run",
        )?;
        Ok(self.scheduler.run_stream(story_id, cancel).await?)
    }

    /// Forbidden if any step is `running` or `pending`. Commits, squashes to
    /// base, pushes, opens a draft PR. Finalization errors are warnings —
    /// the story still reaches `completed`, just without a PR URL.
    pub async fn complete(&self, story_id: Uuid) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        require_status(&story, &[StoryStatus::ReadyToComplete], "complete")?;

        let steps = self.store.list_steps(&story_id)?;
        if steps.iter().any(|s| matches!(s.status, crate::model::StepStatus::Running | crate::model::StepStatus::Pending)) {
            return Err(LifecycleError::InvalidState {
                operation: "complete".to_string(),
                status: "steps still running or pending".to_string(),
            });
        }

        let mut pull_request_url = None;
        if let Some(worktree) = &story.worktree_path {
            if let Err(e) = self.worktree.commit(worktree, "finalize story", true) {
                warn!(story_id = %story_id, error = %e, "finalize commit failed");
            } else if let Some(base) = &self.base_branch {
                if let Err(e) = self.worktree.squash_to_base(worktree, base, &story.title) {
                    warn!(story_id = %story_id, error = %e, "finalize squash failed");
                } else if let (Some(branch), Some(token)) = (&story.branch_name, &self.github_token) {
                    if let Err(e) = self.worktree.push(worktree, true, branch, Some(token)) {
                        warn!(story_id = %story_id, error = %e, "finalize push failed");
                    } else {
                        match self
                            .worktree
                            .create_pull_request(worktree, &story.title, &story.description, Some(base), branch, true, token)
                            .await
                        {
                            Ok(url) => pull_request_url = Some(url),
                            Err(e) => warn!(story_id = %story_id, error = %e, "PR creation failed"),
                        }
                    }
                }
            }
        }

        Ok(self.store.update_story(&story_id, |s| {
            s.status = StoryStatus::Completed;
            s.pull_request_url = pull_request_url.clone();
        })?)
    }

    pub fn cancel(&self, story_id: Uuid) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        if story.status.is_terminal() {
            return Err(LifecycleError::InvalidState {
                operation: "cancel".to_string(),
                status: format!("{:?}", story.status),
            });
        }
        Ok(self.store.update_story_status(&story_id, StoryStatus::Cancelled)?)
    }

    /// Recovers a `failed`/`gate-failed` story back to `gate-pending`;
    /// optionally re-arms failed steps in the current wave to `pending`.
    pub fn reset_orchestrator(&self, story_id: Uuid, reset_failed_steps: bool) -> LifecycleResult<Story> {
        let story = self.get_story(story_id)?;
        require_status(&story, &[StoryStatus::Failed, StoryStatus::GateFailed], "resetOrchestrator")?;

        if reset_failed_steps {
            let steps = self.store.list_steps(&story_id)?;
            for mut step in steps {
                if step.status == crate::model::StepStatus::Failed && step.wave == story.current_wave {
                    step.status = crate::model::StepStatus::Pending;
                    step.error = None;
                    self.store.upsert_step(&step)?;
                }
            }
        }

        Ok(self.store.update_story_status(&story_id, StoryStatus::GatePending)?)
    }

    // -- step-level operations --------------------------------------------

    fn get_step(&self, story_id: Uuid, step_id: Uuid) -> LifecycleResult<StoryStep> {
        self.store
            .get_step(&story_id, &step_id)?
            .ok_or_else(|| LifecycleError::NotFound(step_id.to_string()))
    }

    pub fn approve_step(&self, story_id: Uuid, step_id: Uuid) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        step.approval = Approval::Approved;
        self.store.upsert_step(&step)?;
        Ok(step)
    }

    /// Cascades: rejected step resets to `pending`, output/attempts clear;
    /// every higher-ordered completed step is re-armed with `needsRework`.
    pub fn reject_step(&self, story_id: Uuid, step_id: Uuid, feedback: impl Into<String>) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        step.approval = Approval::Rejected;
        step.approval_feedback = Some(feedback.into());
        step.status = crate::model::StepStatus::Pending;
        step.previous_output = step.output.take();
        step.attempts = 0;
        self.store.upsert_step(&step)?;

        self.cascade_needs_rework(story_id, step.order)?;
        Ok(step)
    }

    pub fn skip_step(&self, story_id: Uuid, step_id: Uuid, reason: impl Into<String>) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        step.status = crate::model::StepStatus::Skipped;
        step.skip_reason = Some(reason.into());
        self.store.upsert_step(&step)?;
        Ok(step)
    }

    /// Cascades `needsRework = true` to all higher-ordered completed steps.
    pub fn reset_step(&self, story_id: Uuid, step_id: Uuid) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        step.previous_output = step.output.take();
        step.status = crate::model::StepStatus::Pending;
        step.needs_rework = false;
        self.store.upsert_step(&step)?;

        self.cascade_needs_rework(story_id, step.order)?;
        Ok(step)
    }

    fn cascade_needs_rework(&self, story_id: Uuid, from_order: u32) -> LifecycleResult<()> {
        let steps = self.store.list_steps(&story_id)?;
        for mut s in steps {
            if s.order > from_order && s.status == crate::model::StepStatus::Completed {
                s.needs_rework = true;
                self.store.upsert_step(&s)?;
            }
        }
        Ok(())
    }

    /// Inserts a step after `after_order`, shifting `order ≥ after_order + 1`
    /// up by one so `order` stays a dense permutation of `1..N`.
    pub fn add_step(
        &self,
        story_id: Uuid,
        after_order: u32,
        name: impl Into<String>,
        description: impl Into<String>,
        capability: Capability,
        wave: u32,
    ) -> LifecycleResult<StoryStep> {
        let mut steps = self.store.list_steps(&story_id)?;
        for s in steps.iter_mut() {
            if s.order >= after_order + 1 {
                s.order += 1;
                self.store.upsert_step(s)?;
            }
        }
        let new_step = StoryStep::new(story_id, after_order + 1, wave, name, description, capability);
        self.store.upsert_step(&new_step)?;
        Ok(new_step)
    }

    /// Removes a step and renumbers remaining steps to a dense `1..N`.
    pub fn remove_step(&self, story_id: Uuid, step_id: Uuid) -> LifecycleResult<()> {
        let removed = self.get_step(story_id, step_id)?;
        self.store.remove_step(&story_id, &step_id)?;

        let mut remaining = self.store.list_steps(&story_id)?;
        for s in remaining.iter_mut() {
            if s.order > removed.order {
                s.order -= 1;
                self.store.upsert_step(s)?;
            }
        }
        Ok(())
    }

    pub fn chat_with_step(&self, story_id: Uuid, step_id: Uuid, message: ChatMessage) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        self.store.append_chat(&step_id, &message)?;
        step.chat_history.push(message);
        self.store.upsert_step(&step)?;
        Ok(step)
    }

    pub fn reassign_step(&self, story_id: Uuid, step_id: Uuid, executor_id: impl Into<String>) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        step.assigned_executor = Some(executor_id.into());
        self.store.upsert_step(&step)?;
        Ok(step)
    }

    pub fn update_step_description(&self, story_id: Uuid, step_id: Uuid, description: impl Into<String>) -> LifecycleResult<StoryStep> {
        let mut step = self.get_step(story_id, step_id)?;
        step.description = description.into();
        self.store.upsert_step(&step)?;
        Ok(step)
    }
}
