//! Composition root for the story orchestrator.
//!
//! This binary is intentionally thin: the HTTP/CLI surface that would front
//! a real deployment is out of scope for this crate (see SPEC_FULL.md §1).
//! What's here wires `tracing` init, loads [`Config`] from the environment,
//! opens the store, and drives one story end-to-end with a canned
//! `AgentInvoker` so the wiring can be exercised by hand — the same role the
//! teacher's `main.rs` plays as a composition root rather than a feature
//! surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use story_orchestrator::{
    AgentInvoker, AgentResponse, Capability, Config, ExecutorRegistry, FileSystemContextProvider,
    LifecycleController, StoryStore, WaveScheduler, WorktreeCoordinator,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Story orchestrator smoke-test composition root")]
struct Args {
    /// Path to the repository the story operates against.
    #[arg(long)]
    repo: PathBuf,

    /// Story title.
    #[arg(long, default_value = "Add a hello-world module")]
    title: String,

    /// Story free-text description.
    #[arg(long, default_value = "Add a small module that prints a greeting.")]
    description: String,
}

/// Canned agent used for manual smoke-testing; the real provider registry is
/// an external collaborator per SPEC_FULL.md §1 and is never implemented here.
struct EchoAgentInvoker {
    capability: Capability,
    response: String,
}

#[async_trait]
impl AgentInvoker for EchoAgentInvoker {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn language_hint(&self) -> Option<&str> {
        None
    }

    async fn invoke(&self, _prompt: &str) -> Result<AgentResponse, String> {
        Ok(AgentResponse {
            content: self.response.clone(),
            tool_calls: Vec::new(),
            is_final: true,
            tokens_used: 0,
        })
    }
}

/// A no-op executor used when no external CLI / internal agent is wired up;
/// marks every step completed so the wave loop and gate can be exercised.
struct NoopExecutor;

#[async_trait]
impl story_orchestrator::Executor for NoopExecutor {
    fn id(&self) -> &str {
        "noop"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute_step(
        &self,
        step: &mut story_orchestrator::StoryStep,
        _story: &story_orchestrator::Story,
        _prior_steps: &[story_orchestrator::StoryStep],
        _cancel: CancellationToken,
    ) {
        step.status = story_orchestrator::StepStatus::Completed;
        step.output = Some("noop executor: nothing to do".to_string());
        step.completed_at = Some(chrono::Utc::now());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_env();
    info!(?config, "loaded configuration");

    let store = StoryStore::open(&config.store_path)
        .context("failed to open story store")?
        .shared();
    let worktree = Arc::new(WorktreeCoordinator::new(
        &config.worktree_base_dir,
        &config.commit_prefix,
    ));
    let executors = Arc::new(ExecutorRegistry::new(vec![Arc::new(NoopExecutor)]));
    let scheduler = Arc::new(WaveScheduler::new(
        Arc::clone(&store),
        Arc::clone(&executors),
        config.gate_timeout,
    ));

    let analysis_agent: Arc<dyn AgentInvoker> = Arc::new(EchoAgentInvoker {
        capability: Capability::Analysis,
        response: "The repository has no existing greeting module.".to_string(),
    });
    let planning_agent: Arc<dyn AgentInvoker> = Arc::new(EchoAgentInvoker {
        capability: Capability::Coding,
        response: r#"[{"name":"Add greeting module","description":"Create a module exposing a greet() function.","capability":"coding","wave":1}]"#.to_string(),
    });

    let context_provider = Arc::new(FileSystemContextProvider::default());

    let lifecycle = LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&worktree),
        Arc::clone(&scheduler),
        context_provider,
        vec![analysis_agent],
        vec![planning_agent],
        std::env::var("GITHUB_TOKEN").ok(),
    );

    let mut story = story_orchestrator::Story::new(
        &args.title,
        &args.description,
        &args.repo,
        story_orchestrator::CreationSource::User,
    );
    store.create_story(&story)?;
    info!(story_id = %story.id, "story created");

    story = lifecycle.ensure_worktree(story.id)?;
    story = lifecycle.analyze(story.id).await?;
    story = lifecycle.plan(story.id).await?;

    let mut rx = lifecycle.run(story.id, CancellationToken::new()).await?;
    while let Some(event) = rx.recv().await {
        info!(?event, "progress");
    }

    let final_story = store.get_story(&story.id)?.context("story disappeared")?;
    info!(status = ?final_story.status, "run finished");

    if final_story.status == story_orchestrator::StoryStatus::ReadyToComplete {
        let completed = lifecycle.complete(story.id).await?;
        info!(status = ?completed.status, pr_url = ?completed.pull_request_url, "story completed");
    }

    Ok(())
}
