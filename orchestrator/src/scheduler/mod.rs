//! Wave Scheduler (C6): groups steps into dependency waves, drives the
//! per-wave execute → gate → advance loop, and emits progress events.
//!
//! The scheduler holds no run state of its own — every transition is
//! persisted to the store before the next action, so a new `run_stream`
//! call on the same story resumes exactly where a crashed one left off.
//! This is the teacher's "stateless orchestrator + durable store" pattern
//! generalized from session-level orchestration to story/wave orchestration.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{self, ProgressEvent, ProgressReceiver};
use crate::executors::{self, ExecutorRegistry};
use crate::gate::QualityGateRunner;
use crate::model::{Story, StoryStatus, StoryStep};
use crate::store::SharedStoryStore;

pub struct WaveScheduler {
    store: SharedStoryStore,
    executors: Arc<ExecutorRegistry>,
    gate: Arc<QualityGateRunner>,
}

impl WaveScheduler {
    pub fn new(store: SharedStoryStore, executors: Arc<ExecutorRegistry>, gate_timeout: Duration) -> Self {
        Self {
            store,
            executors,
            gate: Arc::new(QualityGateRunner::new(gate_timeout)),
        }
    }

    /// Validates preconditions synchronously, then spawns the run loop and
    /// returns the receiving half of its progress stream.
    pub async fn run_stream(
        &self,
        story_id: Uuid,
        cancel: CancellationToken,
    ) -> SchedulerResult<ProgressReceiver> {
        let story = self
            .store
            .get_story(&story_id)?
            .ok_or_else(|| SchedulerError::InvalidState(format!("story {story_id} not found")))?;
        let steps = self.store.list_steps(&story_id)?;

        if steps.is_empty() {
            return Err(SchedulerError::InvalidState("story has no steps".into()));
        }
        if story.worktree_path.is_none() {
            return Err(SchedulerError::InvalidState("story has no worktree".into()));
        }

        let (tx, rx) = events::channel();
        let store = Arc::clone(&self.store);
        let executors = Arc::clone(&self.executors);
        let gate = Arc::clone(&self.gate);

        tokio::spawn(async move {
            run_loop(store, executors, gate, story, steps, tx, cancel).await;
        });

        Ok(rx)
    }
}

/// Persists an event into the store's audit/replay log alongside sending it
/// over the channel. Best-effort: a store hiccup here must never interrupt
/// the run the event describes, so failures are logged and swallowed.
fn persist_event(store: &SharedStoryStore, story_id: Uuid, event: &ProgressEvent) {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let event_id = format!("{story_id}:{}", Uuid::new_v4());
    if let Err(e) = store.put_event(nanos, &event_id, event) {
        tracing::warn!(story_id = %story_id, error = %e, "failed to persist progress event to audit log");
    }
}

/// Sends `event` over the channel and, best-effort, appends it to the
/// store's event log for post-hoc audit/replay.
async fn emit(store: &SharedStoryStore, story_id: Uuid, tx: &events::ProgressSender, event: ProgressEvent) {
    persist_event(store, story_id, &event);
    let _ = tx.send(event).await;
}

async fn run_loop(
    store: SharedStoryStore,
    executors: Arc<ExecutorRegistry>,
    gate: Arc<QualityGateRunner>,
    mut story: Story,
    all_steps: Vec<StoryStep>,
    tx: events::ProgressSender,
    cancel: CancellationToken,
) {
    let story_id = story.id;
    let w_max = all_steps.iter().map(|s| s.wave).max().unwrap_or(1);

    // Idempotent re-entry: a story that already reached its terminal success
    // state emits nothing but the one event, no replayed history.
    if matches!(story.status, StoryStatus::ReadyToComplete | StoryStatus::Completed) {
        emit(&store, story_id, &tx, ProgressEvent::ReadyToComplete { total_waves: w_max }).await;
        return;
    }

    emit(&store, story_id, &tx, ProgressEvent::Started { story_id, total_waves: w_max }).await;

    let mut current_wave = story.current_wave.max(1);

    while current_wave <= w_max && !cancel.is_cancelled() {
        let steps = match store.list_steps(&story_id) {
            Ok(s) => s,
            Err(e) => {
                emit(&store, story_id, &tx, ProgressEvent::Failed { wave: current_wave, error_text: e.to_string() }).await;
                return;
            }
        };

        let wave_steps: Vec<StoryStep> = steps
            .iter()
            .filter(|s| s.wave == current_wave && s.is_runnable())
            .cloned()
            .collect();

        if wave_steps.is_empty() {
            let all_terminal = steps.iter().all(|s| s.is_terminal());
            if all_terminal {
                break;
            }
            current_wave += 1;
            continue;
        }

        emit(&store, story_id, &tx, ProgressEvent::WaveStarted { wave: current_wave, total_waves: w_max }).await;

        story = match store.update_story(&story_id, |s| {
            s.status = StoryStatus::Executing;
            s.current_wave = current_wave;
        }) {
            Ok(s) => s,
            Err(e) => {
                emit(&store, story_id, &tx, ProgressEvent::Failed { wave: current_wave, error_text: e.to_string() }).await;
                return;
            }
        };

        for step in &wave_steps {
            emit(
                &store,
                story_id,
                &tx,
                ProgressEvent::StepStarted { step_id: step.id, name: step.name.clone(), wave: current_wave },
            )
            .await;
        }

        let Some(executor) = executors.resolve(&story) else {
            emit(
                &store,
                story_id,
                &tx,
                ProgressEvent::Failed { wave: current_wave, error_text: "no available executor".to_string() },
            )
            .await;
            let _ = store.update_story_status(&story_id, StoryStatus::Failed);
            return;
        };

        let prior_completed: Vec<StoryStep> = steps
            .iter()
            .filter(|s| s.wave < current_wave && s.status == crate::model::StepStatus::Completed)
            .cloned()
            .collect();

        debug!(wave = current_wave, steps = wave_steps.len(), "dispatching wave");
        let finished_steps = executors::execute_steps(
            executor,
            wave_steps,
            Arc::new(story.clone()),
            story.max_parallelism,
            Arc::new(prior_completed),
            cancel.clone(),
        )
        .await;

        let mut completed_count = 0u32;
        let mut failed_count = 0u32;
        for step in &finished_steps {
            if let Err(e) = store.upsert_step(step) {
                emit(&store, story_id, &tx, ProgressEvent::Failed { wave: current_wave, error_text: e.to_string() }).await;
                return;
            }
            match step.status {
                crate::model::StepStatus::Completed => {
                    completed_count += 1;
                    emit(
                        &store,
                        story_id,
                        &tx,
                        ProgressEvent::StepCompleted {
                            step_id: step.id,
                            name: step.name.clone(),
                            output_blob: step.output.clone(),
                        },
                    )
                    .await;
                }
                crate::model::StepStatus::Failed => {
                    failed_count += 1;
                    emit(
                        &store,
                        story_id,
                        &tx,
                        ProgressEvent::StepFailed {
                            step_id: step.id,
                            name: step.name.clone(),
                            error_text: step.error.clone().unwrap_or_default(),
                        },
                    )
                    .await;
                }
                _ => {}
            }
        }

        emit(
            &store,
            story_id,
            &tx,
            ProgressEvent::WaveCompleted { wave: current_wave, completed_count, failed_count },
        )
        .await;

        if failed_count > 0 {
            let _ = store.update_story_status(&story_id, StoryStatus::Failed);
            emit(
                &store,
                story_id,
                &tx,
                ProgressEvent::Failed {
                    wave: current_wave,
                    error_text: format!("{failed_count} step(s) failed in wave {current_wave}"),
                },
            )
            .await;
            return;
        }

        // currentWave increments strictly after WaveCompleted, uniformly.
        current_wave += 1;
        if current_wave <= w_max {
            story = match store.update_story(&story_id, |s| {
                s.status = StoryStatus::GatePending;
                s.current_wave = current_wave;
            }) {
                Ok(s) => s,
                Err(e) => {
                    emit(&store, story_id, &tx, ProgressEvent::Failed { wave: current_wave, error_text: e.to_string() }).await;
                    return;
                }
            };
        }
    }

    if cancel.is_cancelled() {
        let _ = store.update_story_status(&story_id, StoryStatus::Failed);
        emit(&store, story_id, &tx, ProgressEvent::Failed { wave: current_wave, error_text: "cancelled".to_string() }).await;
        return;
    }

    // Final-wave-only gate: the sole validation point, run once after every
    // wave has produced terminal output.
    emit(&store, story_id, &tx, ProgressEvent::GateStarted { after_wave: w_max }).await;

    let worktree = match &story.worktree_path {
        Some(p) => p.clone(),
        None => {
            emit(&store, story_id, &tx, ProgressEvent::Failed { wave: w_max, error_text: "worktree missing".to_string() }).await;
            return;
        }
    };

    let gate_result = match gate.run_full_gate(&worktree, w_max, &cancel).await {
        Ok(r) => r,
        Err(e) => {
            let _ = store.update_story_status(&story_id, StoryStatus::Failed);
            emit(&store, story_id, &tx, ProgressEvent::Failed { wave: w_max, error_text: e.to_string() }).await;
            return;
        }
    };

    if gate_result.was_cancelled {
        let _ = store.update_story(&story_id, |s| {
            s.status = StoryStatus::GatePending;
            s.gate_result = Some(gate_result.clone());
        });
        emit(&store, story_id, &tx, ProgressEvent::GateFailed { after_wave: w_max, gate_result }).await;
        return;
    }

    if !gate_result.passed {
        let _ = store.update_story(&story_id, |s| {
            s.status = StoryStatus::GateFailed;
            s.gate_result = Some(gate_result.clone());
        });
        emit(&store, story_id, &tx, ProgressEvent::GateFailed { after_wave: w_max, gate_result }).await;
        return;
    }

    let _ = store.update_story(&story_id, |s| {
        s.status = StoryStatus::ReadyToComplete;
        s.gate_result = Some(gate_result.clone());
    });
    info!(story_id = %story_id, "story reached ready-to-complete");
    emit(&store, story_id, &tx, ProgressEvent::GatePassed { after_wave: w_max, gate_result }).await;
    emit(&store, story_id, &tx, ProgressEvent::ReadyToComplete { total_waves: w_max }).await;
}
