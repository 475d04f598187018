//! Progress events streamed while a pass runs.
//!
//! The orchestrator reports lifecycle phases and the executor reports every
//! operation the moment it starts and finishes. Sinks decide where events go.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::planner::{OperationKind, OperationOutcome};

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "status")]
pub enum LifecyclePhase {
    /// Nothing started yet.
    Idle,
    /// Waiting for the state lock.
    Locking,
    /// A federated credential is in hand.
    CredentialAcquired,
    /// Reading live state from providers.
    Refreshing,
    /// Diffing and ordering.
    Planning,
    /// Running provider operations.
    Applying,
    /// State written back.
    Persisted,
    /// Lock released; terminal.
    Unlocked(PassStatus),
}

/// Terminal status of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    /// Everything succeeded.
    Done,
    /// Something failed, was skipped, or the pass aborted.
    Failed,
}

/// Something worth telling the user about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    /// The orchestrator moved to a new phase.
    Phase {
        /// The new phase.
        phase: LifecyclePhase,
    },
    /// An operation was handed to its provider.
    OperationStarted {
        /// Logical resource name.
        resource: String,
        /// What is being done.
        kind: OperationKind,
    },
    /// An operation reached a terminal outcome.
    OperationFinished {
        /// Logical resource name.
        resource: String,
        /// What was attempted.
        kind: OperationKind,
        /// How it ended.
        outcome: OperationOutcome,
    },
    /// A refresh found a resource different from what was recorded.
    Drift {
        /// Logical resource name.
        resource: String,
        /// What changed.
        detail: String,
    },
}

/// Destination for progress events. Emitting never blocks.
pub trait ProgressSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, event: ProgressEvent) {
        debug!(?event, "progress");
    }
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that drains it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Locking => write!(f, "locking"),
            Self::CredentialAcquired => write!(f, "credential acquired"),
            Self::Refreshing => write!(f, "refreshing"),
            Self::Planning => write!(f, "planning"),
            Self::Applying => write!(f, "applying"),
            Self::Persisted => write!(f, "persisted"),
            Self::Unlocked(PassStatus::Done) => write!(f, "unlocked (done)"),
            Self::Unlocked(PassStatus::Failed) => write!(f, "unlocked (failed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.emit(ProgressEvent::Phase {
            phase: LifecyclePhase::Locking,
        });
        sink.emit(ProgressEvent::OperationStarted {
            resource: "bucket-a".to_string(),
            kind: OperationKind::Create,
        });

        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Phase {
                phase: LifecyclePhase::Locking
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::OperationStarted { ref resource, .. }) if resource == "bucket-a"
        ));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.emit(ProgressEvent::Phase {
            phase: LifecyclePhase::Idle,
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = ProgressEvent::Phase {
            phase: LifecyclePhase::Unlocked(PassStatus::Done),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "phase");
        assert_eq!(json["phase"]["phase"], "unlocked");
        assert_eq!(json["phase"]["status"], "done");
        assert_eq!(LifecyclePhase::Unlocked(PassStatus::Done).to_string(), "unlocked (done)");
    }
}
