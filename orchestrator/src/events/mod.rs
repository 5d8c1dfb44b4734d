//! Progress Event Stream (C8): a lazy, ordered, finite sequence of typed
//! progress events emitted by the Wave Scheduler during a run.
//!
//! Grounded on the deleted `events::bus::EventBus` broadcast pattern,
//! narrowed from a many-producer/many-subscriber bus to the single-producer,
//! single-consumer `runStream` contract the scheduler needs: a bounded
//! `tokio::sync::mpsc` channel closed on the terminal event.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::GateResult;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One element of the ordered stream surfaced to callers during `runStream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { story_id: Uuid, total_waves: u32 },
    WaveStarted { wave: u32, total_waves: u32 },
    StepStarted { step_id: Uuid, name: String, wave: u32 },
    StepCompleted { step_id: Uuid, name: String, output_blob: Option<String> },
    StepFailed { step_id: Uuid, name: String, error_text: String },
    WaveCompleted { wave: u32, completed_count: u32, failed_count: u32 },
    GateStarted { after_wave: u32 },
    GatePassed { after_wave: u32, gate_result: GateResult },
    GateFailed { after_wave: u32, gate_result: GateResult },
    ReadyToComplete { total_waves: u32 },
    Failed { wave: u32, error_text: String },
}

impl ProgressEvent {
    /// Whether this event ends the stream; the scheduler's producing loop
    /// stops emitting after one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::ReadyToComplete { .. }
                | ProgressEvent::Failed { .. }
                | ProgressEvent::GateFailed { .. }
        )
    }
}

/// A single-shot, pull-based typed sequence backed by a bounded channel that
/// closes on the terminal event. The producer side lives in the scheduler;
/// callers hold the `Receiver` half directly.
pub type ProgressSender = tokio::sync::mpsc::Sender<ProgressEvent>;
pub type ProgressReceiver = tokio::sync::mpsc::Receiver<ProgressEvent>;

pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_to_complete_and_failed_are_terminal() {
        assert!(ProgressEvent::ReadyToComplete { total_waves: 1 }.is_terminal());
        assert!(ProgressEvent::Failed { wave: 1, error_text: "x".into() }.is_terminal());
        assert!(!ProgressEvent::WaveStarted { wave: 1, total_waves: 2 }.is_terminal());
    }

    #[tokio::test]
    async fn channel_delivers_events_in_order() {
        let (tx, mut rx) = channel();
        tx.send(ProgressEvent::Started { story_id: Uuid::new_v4(), total_waves: 1 })
            .await
            .unwrap();
        tx.send(ProgressEvent::ReadyToComplete { total_waves: 1 }).await.unwrap();
        drop(tx);

        assert!(matches!(rx.recv().await, Some(ProgressEvent::Started { .. })));
        assert!(matches!(rx.recv().await, Some(ProgressEvent::ReadyToComplete { .. })));
        assert!(rx.recv().await.is_none());
    }
}
