// src/repository/mod.rs

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::SessionError,
    models::{
        exam::{AnswerKey, ExamDefinition},
        session::{AnswerRecord, ExamSession, SessionPatch, SessionStatus},
    },
};

pub use memory::MemorySessionRepository;
pub use postgres::PgSessionRepository;

/// Durable storage consumed by the session core.
///
/// Sessions loaded back from storage carry an empty answer key; callers that
/// need to grade answers reload it with [`SessionRepository::load_answer_key`].
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load_exam_definition(&self, exam_id: i64) -> Result<Option<ExamDefinition>, SessionError>;

    async fn load_answer_key(&self, exam_id: i64) -> Result<AnswerKey, SessionError>;

    async fn create_session_record(&self, session: &ExamSession) -> Result<(), SessionError>;

    async fn update_session_record(
        &self,
        session_id: Uuid,
        patch: &SessionPatch,
    ) -> Result<(), SessionError>;

    /// Upserts answers keyed by (session, question).
    async fn save_answers(&self, session_id: Uuid, answers: &[AnswerRecord]) -> Result<(), SessionError>;

    async fn load_session_record(&self, session_id: Uuid) -> Result<Option<ExamSession>, SessionError>;

    /// Sessions in one of `states` that have no end time yet.
    async fn load_active_session_records(
        &self,
        states: &[SessionStatus],
    ) -> Result<Vec<ExamSession>, SessionError>;

    /// Marks sessions still `IN_PROGRESS` that started before `started_before`
    /// as `EXPIRED`. Returns the ids it touched.
    async fn expire_stale_sessions(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, SessionError>;
}
