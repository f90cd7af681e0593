// src/repository/memory.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::SessionRepository;
use crate::{
    error::SessionError,
    models::{
        exam::{AnswerKey, ExamDefinition},
        session::{AnswerRecord, ExamSession, SessionPatch, SessionStatus},
    },
};

#[derive(Debug, Default)]
struct Tables {
    exams: HashMap<i64, ExamDefinition>,
    answer_keys: HashMap<i64, AnswerKey>,
    sessions: HashMap<Uuid, ExamSession>,
}

/// In-process repository used by tests and local runs without Postgres.
///
/// Writes can be made to fail on demand to exercise persistence-error paths.
#[derive(Debug, Default)]
pub struct MemorySessionRepository {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_writable(&self) -> Result<(), SessionError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SessionError::Persistence("storage unavailable".to_string()));
        }
        Ok(())
    }

    pub fn insert_exam(&self, exam: ExamDefinition, answer_key: AnswerKey) {
        let mut tables = self.tables();
        tables.answer_keys.insert(exam.id, answer_key);
        tables.exams.insert(exam.id, exam);
    }

    /// Seeds a stored session as if written by an earlier process.
    pub fn insert_session(&self, session: ExamSession) {
        let mut stored = session;
        stored.answer_key = Arc::new(AnswerKey::new());
        self.tables().sessions.insert(stored.id, stored);
    }

    pub fn stored_session(&self, session_id: Uuid) -> Option<ExamSession> {
        self.tables().sessions.get(&session_id).cloned()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn load_exam_definition(&self, exam_id: i64) -> Result<Option<ExamDefinition>, SessionError> {
        Ok(self.tables().exams.get(&exam_id).cloned())
    }

    async fn load_answer_key(&self, exam_id: i64) -> Result<AnswerKey, SessionError> {
        Ok(self.tables().answer_keys.get(&exam_id).cloned().unwrap_or_default())
    }

    async fn create_session_record(&self, session: &ExamSession) -> Result<(), SessionError> {
        self.check_writable()?;
        self.insert_session(session.clone());
        Ok(())
    }

    async fn update_session_record(
        &self,
        session_id: Uuid,
        patch: &SessionPatch,
    ) -> Result<(), SessionError> {
        self.check_writable()?;
        let mut tables = self.tables();
        let stored = tables.sessions.get_mut(&session_id).ok_or_else(|| {
            SessionError::Persistence(format!("exam session {} has no stored record", session_id))
        })?;

        stored.status = patch.status;
        stored.deadline = patch.deadline;
        stored.paused_at = patch.paused_at;
        stored.remaining_ms = patch.remaining_ms;
        stored.paused_total_ms = patch.paused_total_ms;
        stored.ended_at = patch.ended_at;
        stored.auto_submitted = patch.auto_submitted;
        stored.result = patch.result.clone();
        Ok(())
    }

    async fn save_answers(&self, session_id: Uuid, answers: &[AnswerRecord]) -> Result<(), SessionError> {
        self.check_writable()?;
        let mut tables = self.tables();
        let stored = tables.sessions.get_mut(&session_id).ok_or_else(|| {
            SessionError::Persistence(format!("exam session {} has no stored record", session_id))
        })?;
        for answer in answers {
            stored.answers.insert(answer.question_id, answer.clone());
        }
        Ok(())
    }

    async fn load_session_record(&self, session_id: Uuid) -> Result<Option<ExamSession>, SessionError> {
        Ok(self.stored_session(session_id))
    }

    async fn load_active_session_records(
        &self,
        states: &[SessionStatus],
    ) -> Result<Vec<ExamSession>, SessionError> {
        let mut sessions: Vec<ExamSession> = self
            .tables()
            .sessions
            .values()
            .filter(|s| states.contains(&s.status) && s.ended_at.is_none())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    async fn expire_stale_sessions(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, SessionError> {
        self.check_writable()?;
        let mut expired = Vec::new();
        for session in self.tables().sessions.values_mut() {
            if session.status == SessionStatus::InProgress
                && session.ended_at.is_none()
                && session.started_at < started_before
            {
                session.status = SessionStatus::Expired;
                session.ended_at = Some(now);
                expired.push(session.id);
            }
        }
        Ok(expired)
    }
}
