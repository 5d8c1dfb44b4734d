//! End-to-end scenarios from SPEC_FULL.md §8, exercised against the real
//! `LifecycleController` + `WaveScheduler` + a throwaway git worktree with a
//! `Makefile` toolchain (cheapest real toolchain to drive under test).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use story_orchestrator::{
    AgentInvoker, AgentResponse, Capability, CreationSource, Executor, ExecutorRegistry,
    FileSystemContextProvider, LifecycleController, ProgressEvent, Story, StoryStatus, StoryStep,
    StoryStore, WaveScheduler, WorktreeCoordinator,
};
use tokio_util::sync::CancellationToken;

fn init_repo(dir: &Path) {
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
    ] {
        std::process::Command::new("git").args(args).current_dir(dir).output().unwrap();
    }
    std::fs::write(dir.join("Makefile"), "build:\n\ttrue\ntest:\n\ttrue\n").unwrap();
    std::fs::write(dir.join("README.md"), "hello").unwrap();
    std::process::Command::new("git").args(["add", "."]).current_dir(dir).output().unwrap();
    std::process::Command::new("git")
        .args(["commit", "-m", "init"])
        .current_dir(dir)
        .output()
        .unwrap();
}

struct EchoAgent {
    capability: Capability,
    response: String,
}

#[async_trait]
impl AgentInvoker for EchoAgent {
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

struct AlwaysCompletes;

#[async_trait]
impl Executor for AlwaysCompletes {
    fn id(&self) -> &str {
        "always-completes"
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn execute_step(
        &self,
        step: &mut StoryStep,
        _story: &Story,
        _prior_steps: &[StoryStep],
        _cancel: CancellationToken,
    ) {
        step.status = story_orchestrator::StepStatus::Completed;
        step.output = Some("ok".to_string());
    }
}

/// Fails any step whose name contains "fail".
struct FailsByName;

#[async_trait]
impl Executor for FailsByName {
    fn id(&self) -> &str {
        "fails-by-name"
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn execute_step(
        &self,
        step: &mut StoryStep,
        _story: &Story,
        _prior_steps: &[StoryStep],
        _cancel: CancellationToken,
    ) {
        if step.name.contains("fail") {
            step.status = story_orchestrator::StepStatus::Failed;
            step.error = Some("simulated failure".to_string());
        } else {
            step.status = story_orchestrator::StepStatus::Completed;
            step.output = Some("ok".to_string());
        }
    }
}

struct Harness {
    store: story_orchestrator::SharedStoryStore,
    lifecycle: LifecycleController,
    _store_dir: tempfile::TempDir,
    _repo_dir: tempfile::TempDir,
    _wt_base_dir: tempfile::TempDir,
}

fn build_harness(executor: Arc<dyn Executor>) -> Harness {
    let store_dir = tempfile::tempdir().unwrap();
    let store = StoryStore::open(store_dir.path().join("db")).unwrap().shared();

    let repo_dir = tempfile::tempdir().unwrap();
    init_repo(repo_dir.path());

    let wt_base_dir = tempfile::tempdir().unwrap();
    let worktree = Arc::new(WorktreeCoordinator::new(wt_base_dir.path(), "[story]"));

    let executors = Arc::new(ExecutorRegistry::new(vec![executor]));
    let scheduler = Arc::new(WaveScheduler::new(
        Arc::clone(&store),
        executors,
        Duration::from_secs(10),
    ));

    let analysis_agent: Arc<dyn AgentInvoker> = Arc::new(EchoAgent {
        capability: Capability::Analysis,
        response: "analyzed context".to_string(),
    });

    let context_provider = Arc::new(FileSystemContextProvider::default());

    let lifecycle = LifecycleController::new(
        Arc::clone(&store),
        worktree,
        scheduler,
        context_provider,
        vec![analysis_agent],
        Vec::new(),
        None,
    );

    Harness {
        store,
        lifecycle,
        _store_dir: store_dir,
        _repo_dir: repo_dir,
        _wt_base_dir: wt_base_dir,
    }
}

async fn drain(rx: &mut story_orchestrator::ProgressReceiver) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn scenario_1_happy_path_single_wave_single_step() {
    let harness = build_harness(Arc::new(AlwaysCompletes));
    let mut story = Story::new("Doc it", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();

    story = harness.lifecycle.ensure_worktree(story.id).unwrap();
    harness.store.replace_steps(
        &story.id,
        &[StoryStep::new(story.id, 1, 1, "Write docs", "d", Capability::Documentation)],
    ).unwrap();
    harness.store.update_story_status(&story.id, StoryStatus::Planned).unwrap();

    let mut rx = harness.lifecycle.run(story.id, CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx).await;

    let kinds: Vec<&str> = events.iter().map(event_kind).collect();
    assert_eq!(
        kinds,
        vec![
            "Started",
            "WaveStarted",
            "StepStarted",
            "StepCompleted",
            "WaveCompleted",
            "GateStarted",
            "GatePassed",
            "ReadyToComplete",
        ]
    );

    let final_story = harness.store.get_story(&story.id).unwrap().unwrap();
    assert_eq!(final_story.status, StoryStatus::ReadyToComplete);
}

#[tokio::test]
async fn scenario_3_parallel_wave_one_step_fails() {
    let harness = build_harness(Arc::new(FailsByName));
    let mut story = Story::new("Parallel wave", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();
    story = harness.lifecycle.ensure_worktree(story.id).unwrap();

    harness.store.replace_steps(
        &story.id,
        &[
            StoryStep::new(story.id, 1, 1, "step a", "d", Capability::Coding),
            StoryStep::new(story.id, 2, 1, "step fail b", "d", Capability::Coding),
            StoryStep::new(story.id, 3, 1, "step c", "d", Capability::Coding),
        ],
    ).unwrap();
    harness.store.update_story_status(&story.id, StoryStatus::Planned).unwrap();
    story.max_parallelism = 3;

    let mut rx = harness.lifecycle.run(story.id, CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx).await;

    let started = events.iter().filter(|e| matches!(e, ProgressEvent::StepStarted { .. })).count();
    assert_eq!(started, 3);

    let completed = events.iter().filter(|e| matches!(e, ProgressEvent::StepCompleted { .. })).count();
    let failed = events.iter().filter(|e| matches!(e, ProgressEvent::StepFailed { .. })).count();
    assert_eq!(completed, 2);
    assert_eq!(failed, 1);

    assert!(matches!(events.last().unwrap(), ProgressEvent::Failed { .. }));

    let final_story = harness.store.get_story(&story.id).unwrap().unwrap();
    assert_eq!(final_story.status, StoryStatus::Failed);
}

#[tokio::test]
async fn scenario_5_reset_and_rerun_after_gate_failure() {
    let harness = build_harness(Arc::new(AlwaysCompletes));
    let mut story = Story::new("Gate retry", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();
    story = harness.lifecycle.ensure_worktree(story.id).unwrap();

    let mut step = StoryStep::new(story.id, 1, 1, "step a", "d", Capability::Coding);
    step.status = story_orchestrator::StepStatus::Failed;
    step.error = Some("prior failure".to_string());
    harness.store.upsert_step(&step).unwrap();
    harness.store.update_story(&story.id, |s| {
        s.status = StoryStatus::GateFailed;
        s.current_wave = 1;
    }).unwrap();

    let reset = harness.lifecycle.reset_orchestrator(story.id, true).unwrap();
    assert_eq!(reset.status, StoryStatus::GatePending);

    let reset_step = harness.store.get_step(&story.id, &step.id).unwrap().unwrap();
    assert_eq!(reset_step.status, story_orchestrator::StepStatus::Pending);

    let mut rx = harness.lifecycle.run(story.id, CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx).await;
    assert!(matches!(events.last().unwrap(), ProgressEvent::ReadyToComplete { .. }));
}

#[tokio::test]
async fn scenario_6_step_rejection_cascades_rework() {
    let harness = build_harness(Arc::new(AlwaysCompletes));
    let story = Story::new("Cascade", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();

    let mut steps = Vec::new();
    for (order, name) in [(1, "one"), (2, "two"), (3, "three")] {
        let mut step = StoryStep::new(story.id, order, 1, name, "d", Capability::Coding);
        step.status = story_orchestrator::StepStatus::Completed;
        step.output = Some("done".to_string());
        steps.push(step);
    }
    harness.store.replace_steps(&story.id, &steps).unwrap();
    let step_2_id = steps[1].id;

    let rejected = harness.lifecycle.reject_step(story.id, step_2_id, "no").unwrap();
    assert_eq!(rejected.status, story_orchestrator::StepStatus::Pending);
    assert_eq!(rejected.attempts, 0);
    assert!(rejected.output.is_none());
    assert_eq!(rejected.approval, story_orchestrator::Approval::Rejected);

    let step_3 = harness.store.get_step(&story.id, &steps[2].id).unwrap().unwrap();
    assert!(step_3.needs_rework);

    let step_1 = harness.store.get_step(&story.id, &steps[0].id).unwrap().unwrap();
    assert!(!step_1.needs_rework, "lower-ordered steps are never cascaded");
}

#[tokio::test]
async fn final_wave_only_gate_ignores_intermediate_wave_failures() {
    // Wave 1's step produces output that would fail to build; the scheduler
    // must not run (or be affected by) a gate between waves — only the gate
    // after the final wave decides pass/fail.
    let harness = build_harness(Arc::new(AlwaysCompletes));
    let mut story = Story::new("Two waves", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();
    story = harness.lifecycle.ensure_worktree(story.id).unwrap();

    // Break the build on purpose; a final-wave-only gate means wave 1
    // completing never triggers this broken build.
    std::fs::write(
        story.worktree_path.as_ref().unwrap().join("Makefile"),
        "build:\n\tfalse\ntest:\n\ttrue\n",
    )
    .unwrap();
    std::process::Command::new("git")
        .args(["add", "."])
        .current_dir(story.worktree_path.as_ref().unwrap())
        .output()
        .unwrap();
    std::process::Command::new("git")
        .args(["commit", "-m", "break build"])
        .current_dir(story.worktree_path.as_ref().unwrap())
        .output()
        .unwrap();

    harness.store.replace_steps(
        &story.id,
        &[
            StoryStep::new(story.id, 1, 1, "wave1 step", "d", Capability::Coding),
            StoryStep::new(story.id, 2, 2, "wave2 step", "d", Capability::Coding),
        ],
    ).unwrap();
    harness.store.update_story_status(&story.id, StoryStatus::Planned).unwrap();

    let mut rx = harness.lifecycle.run(story.id, CancellationToken::new()).await.unwrap();
    let events = drain(&mut rx).await;

    let gate_started_count = events.iter().filter(|e| matches!(e, ProgressEvent::GateStarted { .. })).count();
    assert_eq!(gate_started_count, 1, "only the final-wave gate runs");

    assert!(matches!(events.last().unwrap(), ProgressEvent::GateFailed { .. }));
    let final_story = harness.store.get_story(&story.id).unwrap().unwrap();
    assert_eq!(final_story.status, StoryStatus::GateFailed);
}

/// Races a sleep against cancellation; on cancel, fails the step with an
/// error text containing "cancel" rather than completing it.
struct SlowExecutor;

#[async_trait]
impl Executor for SlowExecutor {
    fn id(&self) -> &str {
        "slow"
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn execute_step(
        &self,
        step: &mut StoryStep,
        _story: &Story,
        _prior_steps: &[StoryStep],
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                step.status = story_orchestrator::StepStatus::Completed;
                step.output = Some("ok".to_string());
            }
            _ = cancel.cancelled() => {
                step.status = story_orchestrator::StepStatus::Failed;
                step.error = Some("cancelled mid-wave".to_string());
            }
        }
    }
}

#[tokio::test]
async fn scenario_4_cancel_mid_wave() {
    let harness = build_harness(Arc::new(SlowExecutor));
    let mut story = Story::new("Cancel me", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();
    story = harness.lifecycle.ensure_worktree(story.id).unwrap();

    harness.store.replace_steps(
        &story.id,
        &[
            StoryStep::new(story.id, 1, 1, "slow a", "d", Capability::Coding),
            StoryStep::new(story.id, 2, 1, "slow b", "d", Capability::Coding),
        ],
    ).unwrap();
    harness.store.update_story_status(&story.id, StoryStatus::Planned).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = harness.lifecycle.run(story.id, cancel.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let events = drain(&mut rx).await;
    for event in &events {
        if let ProgressEvent::StepFailed { error_text, .. } = event {
            assert!(error_text.contains("cancel"));
        }
    }
    assert!(matches!(events.last().unwrap(), ProgressEvent::Failed { .. }));

    let final_story = harness.store.get_story(&story.id).unwrap().unwrap();
    assert_eq!(final_story.status, StoryStatus::Failed);
}

#[test]
fn add_then_remove_step_round_trips_list() {
    let harness = build_harness(Arc::new(AlwaysCompletes));
    let story = Story::new("Round trip", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();

    let original = vec![
        StoryStep::new(story.id, 1, 1, "one", "d1", Capability::Coding),
        StoryStep::new(story.id, 2, 1, "two", "d2", Capability::Testing),
    ];
    harness.store.replace_steps(&story.id, &original).unwrap();

    let new_step = harness
        .lifecycle
        .add_step(story.id, 1, "inserted", "d3", Capability::Review, 1)
        .unwrap();
    harness.lifecycle.remove_step(story.id, new_step.id).unwrap();

    let after = harness.store.list_steps(&story.id).unwrap();
    assert_eq!(after.len(), 2);
    for (a, b) in original.iter().zip(after.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.capability, b.capability);
        assert_eq!(a.order, b.order);
        assert_eq!(a.description, b.description);
    }
}

/// Tracks the peak number of concurrently-running steps.
struct SerialTracker {
    concurrent: Arc<std::sync::atomic::AtomicUsize>,
    max_concurrent: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl Executor for SerialTracker {
    fn id(&self) -> &str {
        "serial-tracker"
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn execute_step(
        &self,
        step: &mut StoryStep,
        _story: &Story,
        _prior_steps: &[StoryStep],
        _cancel: CancellationToken,
    ) {
        let now = self.concurrent.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.concurrent.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        step.status = story_orchestrator::StepStatus::Completed;
        step.output = Some("ok".to_string());
    }
}

#[tokio::test]
async fn parallelism_one_is_fully_serial() {
    let max_concurrent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let concurrent = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let executor = Arc::new(SerialTracker {
        concurrent: Arc::clone(&concurrent),
        max_concurrent: Arc::clone(&max_concurrent),
    });
    let harness = build_harness(executor);

    let story = Story::new("Serial", "desc", "/repo", CreationSource::User);
    harness.store.create_story(&story).unwrap();
    harness.lifecycle.ensure_worktree(story.id).unwrap();
    harness.store.update_story(&story.id, |s| s.max_parallelism = 1).unwrap();

    harness.store.replace_steps(
        &story.id,
        &[
            StoryStep::new(story.id, 1, 1, "a", "d", Capability::Coding),
            StoryStep::new(story.id, 2, 1, "b", "d", Capability::Coding),
            StoryStep::new(story.id, 3, 1, "c", "d", Capability::Coding),
        ],
    ).unwrap();
    harness.store.update_story_status(&story.id, StoryStatus::Planned).unwrap();

    let mut rx = harness.lifecycle.run(story.id, CancellationToken::new()).await.unwrap();
    drain(&mut rx).await;

    assert_eq!(max_concurrent.load(std::sync::atomic::Ordering::SeqCst), 1);
}

fn event_kind(event: &ProgressEvent) -> &'static str {
    match event {
        ProgressEvent::Started { .. } => "Started",
        ProgressEvent::WaveStarted { .. } => "WaveStarted",
        ProgressEvent::StepStarted { .. } => "StepStarted",
        ProgressEvent::StepCompleted { .. } => "StepCompleted",
        ProgressEvent::StepFailed { .. } => "StepFailed",
        ProgressEvent::WaveCompleted { .. } => "WaveCompleted",
        ProgressEvent::GateStarted { .. } => "GateStarted",
        ProgressEvent::GatePassed { .. } => "GatePassed",
        ProgressEvent::GateFailed { .. } => "GateFailed",
        ProgressEvent::ReadyToComplete { .. } => "ReadyToComplete",
        ProgressEvent::Failed { .. } => "Failed",
    }
}
