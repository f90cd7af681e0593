// src/models/session.rs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::exam::scoring;
use crate::models::exam::{AnswerKey, ExamDefinition};

/// Lifecycle state of an exam session.
/// Stored as text in the 'exam_sessions.status' column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Paused,
    Submitted,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "NOT_STARTED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Submitted => "SUBMITTED",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Submitted | SessionStatus::Expired | SessionStatus::Cancelled
        )
    }

    /// A live session has a running or paused clock.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::InProgress | SessionStatus::Paused)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(SessionStatus::NotStarted),
            "IN_PROGRESS" => Ok(SessionStatus::InProgress),
            "PAUSED" => Ok(SessionStatus::Paused),
            "SUBMITTED" => Ok(SessionStatus::Submitted),
            "EXPIRED" => Ok(SessionStatus::Expired),
            "CANCELLED" => Ok(SessionStatus::Cancelled),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// The terminal state a session is finalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalOutcome {
    Submitted,
    Expired,
    Cancelled,
}

impl FinalOutcome {
    pub fn status(self) -> SessionStatus {
        match self {
            FinalOutcome::Submitted => SessionStatus::Submitted,
            FinalOutcome::Expired => SessionStatus::Expired,
            FinalOutcome::Cancelled => SessionStatus::Cancelled,
        }
    }
}

/// One recorded answer. Resubmitting the same question replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: i64,
    /// `None` means the learner explicitly left the question empty.
    pub option_id: Option<i64>,
    pub is_correct: bool,
    pub time_spent_secs: i32,
    pub answered_at: DateTime<Utc>,
}

/// Final score of a terminal session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub score: f64,
    pub correct: i32,
    pub wrong: i32,
    pub empty: i32,
    pub total_questions: i32,
    pub percentage: f64,
    pub time_taken_secs: i64,
}

/// One learner's attempt at one exam, bounded by a deadline.
#[derive(Debug, Clone)]
pub struct ExamSession {
    pub id: Uuid,
    pub user_id: i64,
    pub exam: ExamDefinition,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    /// `started_at + duration + paused_total_ms` while running.
    pub deadline: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Time left on the clock, set only while paused.
    pub remaining_ms: Option<i64>,
    pub paused_total_ms: i64,
    pub ended_at: Option<DateTime<Utc>>,
    pub auto_submitted: bool,
    pub answers: BTreeMap<i64, AnswerRecord>,
    pub result: Option<SessionResult>,
    pub answer_key: Arc<AnswerKey>,
}

impl ExamSession {
    /// Builds a fresh `IN_PROGRESS` session whose clock starts at `now`.
    pub fn start(
        user_id: i64,
        exam: ExamDefinition,
        answer_key: Arc<AnswerKey>,
        now: DateTime<Utc>,
    ) -> Self {
        let deadline = now + exam.duration();
        Self {
            id: Uuid::new_v4(),
            user_id,
            exam,
            status: SessionStatus::InProgress,
            started_at: now,
            deadline,
            paused_at: None,
            remaining_ms: None,
            paused_total_ms: 0,
            ended_at: None,
            auto_submitted: false,
            answers: BTreeMap::new(),
            result: None,
            answer_key,
        }
    }

    /// Deadline derived from start time, exam duration and time spent paused.
    pub fn expected_deadline(&self) -> DateTime<Utc> {
        self.started_at + self.exam.duration() + chrono::Duration::milliseconds(self.paused_total_ms)
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        match self.status {
            SessionStatus::Paused => self.remaining_ms.unwrap_or(0).max(0),
            SessionStatus::InProgress => (self.deadline - now).num_milliseconds().max(0),
            _ => 0,
        }
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.remaining_ms(now) / 1000
    }

    /// Running and still before its deadline.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::InProgress && now < self.deadline
    }

    pub(crate) fn pause(&mut self, now: DateTime<Utc>) {
        let remaining = (self.deadline - now).num_milliseconds().max(0);
        self.status = SessionStatus::Paused;
        self.paused_at = Some(now);
        self.remaining_ms = Some(remaining);
    }

    pub(crate) fn resume(&mut self, now: DateTime<Utc>) {
        let remaining = self.remaining_ms.take().unwrap_or(0).max(0);
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total_ms += (now - paused_at).num_milliseconds().max(0);
        }
        self.status = SessionStatus::InProgress;
        self.deadline = now + chrono::Duration::milliseconds(remaining);
    }

    pub(crate) fn record_answer(
        &mut self,
        question_id: i64,
        option_id: Option<i64>,
        time_spent_secs: i32,
        now: DateTime<Utc>,
    ) -> AnswerRecord {
        let is_correct = match option_id {
            Some(option) => self.answer_key.get(&question_id) == Some(&option),
            None => false,
        };
        let record = AnswerRecord {
            question_id,
            option_id,
            is_correct,
            time_spent_secs,
            answered_at: now,
        };
        self.answers.insert(question_id, record.clone());
        record
    }

    /// Moves the session into its terminal state and computes the result.
    pub(crate) fn finish(&mut self, outcome: FinalOutcome, now: DateTime<Utc>) -> SessionResult {
        let mut paused_ms = self.paused_total_ms;
        if let Some(paused_at) = self.paused_at {
            paused_ms += (now - paused_at).num_milliseconds().max(0);
        }
        let active_ms = ((now - self.started_at).num_milliseconds() - paused_ms).max(0);

        let result = scoring::evaluate(&self.exam, self.answers.values(), active_ms / 1000);

        self.status = outcome.status();
        self.ended_at = Some(now);
        self.auto_submitted = outcome == FinalOutcome::Expired;
        self.paused_at = None;
        self.remaining_ms = None;
        self.paused_total_ms = paused_ms;
        self.result = Some(result.clone());
        result
    }

    /// Snapshot of every mutable column, written on each transition.
    pub fn patch(&self) -> SessionPatch {
        SessionPatch {
            status: self.status,
            deadline: self.deadline,
            paused_at: self.paused_at,
            remaining_ms: self.remaining_ms,
            paused_total_ms: self.paused_total_ms,
            ended_at: self.ended_at,
            auto_submitted: self.auto_submitted,
            result: self.result.clone(),
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            session_id: self.id,
            exam_id: self.exam.id,
            exam_title: self.exam.title.clone(),
            exam_type: self.exam.exam_type.to_string(),
            status: self.status,
            started_at: self.started_at,
            deadline: self.deadline,
            paused_at: self.paused_at,
            ended_at: self.ended_at,
            remaining_seconds: self.remaining_seconds(now),
            is_active: self.is_active(now),
            answered_count: self.answers.len(),
            total_questions: self.exam.total_questions,
            auto_submitted: self.auto_submitted,
            result: self.result.clone(),
            answers: if self.status.is_terminal() {
                self.answers.values().cloned().collect()
            } else {
                Vec::new()
            },
        }
    }
}

/// Mutable columns of an 'exam_sessions' row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPatch {
    pub status: SessionStatus,
    pub deadline: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub remaining_ms: Option<i64>,
    pub paused_total_ms: i64,
    pub ended_at: Option<DateTime<Utc>>,
    pub auto_submitted: bool,
    pub result: Option<SessionResult>,
}

/// DTO returned to the client describing a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub exam_id: i64,
    pub exam_title: String,
    pub exam_type: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub remaining_seconds: i64,
    pub is_active: bool,
    pub answered_count: usize,
    pub total_questions: i32,
    pub auto_submitted: bool,
    pub result: Option<SessionResult>,
    /// Per-question details, only once the session has ended.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<AnswerRecord>,
}

/// DTO returned when an exam is submitted or cancelled: the score plus
/// per-question details.
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedExam {
    #[serde(flatten)]
    pub result: SessionResult,
    pub details: Vec<AnswerRecord>,
}

/// DTO returned when an exam is started.
#[derive(Debug, Clone, Serialize)]
pub struct StartedExam {
    pub session_id: Uuid,
    pub exam_id: i64,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub duration_minutes: i32,
    pub remaining_seconds: i64,
}

/// DTO for submitting a single answer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnswerSubmission {
    pub question_id: i64,
    /// Omitted or null leaves the question empty.
    #[serde(default)]
    pub option_id: Option<i64>,
    /// Seconds the learner spent on the question.
    #[serde(default)]
    #[validate(range(min = 0, max = 86400))]
    pub time_spent_secs: i32,
}

/// DTO for submitting the whole exam.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct SubmitExamRequest {
    /// Final answers; merged over the ones already recorded.
    #[serde(default)]
    #[validate(length(max = 1000), nested)]
    pub answers: Vec<AnswerSubmission>,
}
