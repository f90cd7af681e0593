// src/exam/notify.rs

//! Outbound lifecycle notifications.
//!
//! The core publishes fire-and-forget events; delivery (WebSocket push, etc.)
//! lives outside this crate and subscribes to the broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum ExamEvent {
    #[serde(rename = "exam.started")]
    Started {
        session_id: Uuid,
        user_id: i64,
        exam_id: i64,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
    #[serde(rename = "exam.paused")]
    Paused {
        session_id: Uuid,
        paused_at: DateTime<Utc>,
        remaining_ms: i64,
    },
    #[serde(rename = "exam.resumed")]
    Resumed {
        session_id: Uuid,
        new_deadline: DateTime<Utc>,
    },
    #[serde(rename = "exam.submitted")]
    Submitted {
        session_id: Uuid,
        user_id: i64,
        exam_id: i64,
    },
    #[serde(rename = "exam.cancelled")]
    Cancelled {
        session_id: Uuid,
        user_id: i64,
        exam_id: i64,
    },
    #[serde(rename = "exam.auto-submitted")]
    AutoSubmitted {
        session_id: Uuid,
        user_id: i64,
        exam_id: i64,
        reason: String,
    },
    #[serde(rename = "exam.result-calculated")]
    ResultCalculated {
        session_id: Uuid,
        score: f64,
        correct: i32,
        total_questions: i32,
        percentage: f64,
    },
}

impl ExamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExamEvent::Started { .. } => "exam.started",
            ExamEvent::Paused { .. } => "exam.paused",
            ExamEvent::Resumed { .. } => "exam.resumed",
            ExamEvent::Submitted { .. } => "exam.submitted",
            ExamEvent::Cancelled { .. } => "exam.cancelled",
            ExamEvent::AutoSubmitted { .. } => "exam.auto-submitted",
            ExamEvent::ResultCalculated { .. } => "exam.result-calculated",
        }
    }
}

/// Outbound message port. Publishing must never fail the caller.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: ExamEvent);
}

/// Notifier backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ExamEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExamEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: ExamEvent) {
        tracing::debug!(event = event.name(), "Publishing exam event");
        // No subscribers is not an error for a fire-and-forget port.
        let _ = self.tx.send(event);
    }
}

/// Forwards every published event to the log until the channel closes.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<ExamEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(payload) => tracing::info!(event = event.name(), %payload, "Exam event"),
                    Err(e) => tracing::warn!("Failed to serialize exam event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event logger lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
