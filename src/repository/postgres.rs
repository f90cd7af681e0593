// src/repository/postgres.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::SessionRepository;
use crate::{
    error::SessionError,
    models::{
        exam::{AnswerKey, ExamDefinition, ExamType},
        session::{AnswerRecord, ExamSession, SessionPatch, SessionResult, SessionStatus},
    },
};

/// Session row joined with its exam definition.
const SESSION_SELECT: &str = r#"
    SELECT
        s.id, s.user_id, s.status, s.started_at, s.deadline,
        s.paused_at, s.remaining_ms, s.paused_total_ms, s.ended_at, s.auto_submitted,
        s.score, s.correct_count, s.wrong_count, s.empty_count, s.percentage, s.time_taken_secs,
        e.id AS exam_id, e.title, e.exam_type, e.total_questions, e.duration_minutes
    FROM exam_sessions s
    JOIN exams e ON e.id = s.exam_id
"#;

/// Represents the 'exams' table.
#[derive(Debug, FromRow)]
struct ExamRow {
    id: i64,
    title: String,
    exam_type: String,
    total_questions: i32,
    duration_minutes: i32,
}

impl From<ExamRow> for ExamDefinition {
    fn from(row: ExamRow) -> Self {
        ExamDefinition {
            id: row.id,
            title: row.title,
            exam_type: ExamType::from(row.exam_type),
            total_questions: row.total_questions,
            duration_minutes: row.duration_minutes,
        }
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: i64,
    status: String,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    remaining_ms: Option<i64>,
    paused_total_ms: i64,
    ended_at: Option<DateTime<Utc>>,
    auto_submitted: bool,
    score: Option<f64>,
    correct_count: Option<i32>,
    wrong_count: Option<i32>,
    empty_count: Option<i32>,
    percentage: Option<f64>,
    time_taken_secs: Option<i64>,
    exam_id: i64,
    title: String,
    exam_type: String,
    total_questions: i32,
    duration_minutes: i32,
}

/// Represents the 'exam_answers' table.
#[derive(Debug, FromRow)]
struct AnswerRow {
    session_id: Uuid,
    question_id: i64,
    option_id: Option<i64>,
    is_correct: bool,
    time_spent_secs: i32,
    answered_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_session(self, answers: Vec<AnswerRow>) -> Result<ExamSession, SessionError> {
        let status = self
            .status
            .parse::<SessionStatus>()
            .map_err(SessionError::Persistence)?;

        // A result exists only once the scoring columns were written.
        let result = match (self.score, self.correct_count, self.wrong_count, self.empty_count) {
            (Some(score), Some(correct), Some(wrong), Some(empty)) => Some(SessionResult {
                score,
                correct,
                wrong,
                empty,
                total_questions: self.total_questions,
                percentage: self.percentage.unwrap_or(0.0),
                time_taken_secs: self.time_taken_secs.unwrap_or(0),
            }),
            _ => None,
        };

        let answers: BTreeMap<i64, AnswerRecord> = answers
            .into_iter()
            .map(|a| {
                (
                    a.question_id,
                    AnswerRecord {
                        question_id: a.question_id,
                        option_id: a.option_id,
                        is_correct: a.is_correct,
                        time_spent_secs: a.time_spent_secs,
                        answered_at: a.answered_at,
                    },
                )
            })
            .collect();

        Ok(ExamSession {
            id: self.id,
            user_id: self.user_id,
            exam: ExamDefinition {
                id: self.exam_id,
                title: self.title,
                exam_type: ExamType::from(self.exam_type),
                total_questions: self.total_questions,
                duration_minutes: self.duration_minutes,
            },
            status,
            started_at: self.started_at,
            deadline: self.deadline,
            paused_at: self.paused_at,
            remaining_ms: self.remaining_ms,
            paused_total_ms: self.paused_total_ms,
            ended_at: self.ended_at,
            auto_submitted: self.auto_submitted,
            answers,
            result,
            answer_key: Arc::new(AnswerKey::new()),
        })
    }
}

/// Postgres-backed session storage.
#[derive(Debug, Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_answers(&self, session_ids: &[Uuid]) -> Result<Vec<AnswerRow>, SessionError> {
        let rows = sqlx::query_as::<_, AnswerRow>(
            r#"
            SELECT session_id, question_id, option_id, is_correct, time_spent_secs, answered_at
            FROM exam_answers
            WHERE session_id = ANY($1)
            ORDER BY question_id
            "#,
        )
        .bind(session_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn load_exam_definition(&self, exam_id: i64) -> Result<Option<ExamDefinition>, SessionError> {
        let row = sqlx::query_as::<_, ExamRow>(
            "SELECT id, title, exam_type, total_questions, duration_minutes FROM exams WHERE id = $1",
        )
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch exam {}: {:?}", exam_id, e);
            SessionError::from(e)
        })?;

        Ok(row.map(ExamDefinition::from))
    }

    async fn load_answer_key(&self, exam_id: i64) -> Result<AnswerKey, SessionError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT question_id, correct_option_id FROM exam_questions WHERE exam_id = $1",
        )
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn create_session_record(&self, session: &ExamSession) -> Result<(), SessionError> {
        sqlx::query(
            r#"
            INSERT INTO exam_sessions
                (id, user_id, exam_id, status, started_at, deadline,
                 paused_at, remaining_ms, paused_total_ms, ended_at, auto_submitted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.exam.id)
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(session.deadline)
        .bind(session.paused_at)
        .bind(session.remaining_ms)
        .bind(session.paused_total_ms)
        .bind(session.ended_at)
        .bind(session.auto_submitted)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to insert exam session {}: {:?}", session.id, e);
            SessionError::from(e)
        })?;

        Ok(())
    }

    async fn update_session_record(
        &self,
        session_id: Uuid,
        patch: &SessionPatch,
    ) -> Result<(), SessionError> {
        let result = patch.result.as_ref();

        let updated = sqlx::query(
            r#"
            UPDATE exam_sessions SET
                status = $2,
                deadline = $3,
                paused_at = $4,
                remaining_ms = $5,
                paused_total_ms = $6,
                ended_at = $7,
                auto_submitted = $8,
                score = $9,
                correct_count = $10,
                wrong_count = $11,
                empty_count = $12,
                percentage = $13,
                time_taken_secs = $14
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .bind(patch.status.as_str())
        .bind(patch.deadline)
        .bind(patch.paused_at)
        .bind(patch.remaining_ms)
        .bind(patch.paused_total_ms)
        .bind(patch.ended_at)
        .bind(patch.auto_submitted)
        .bind(result.map(|r| r.score))
        .bind(result.map(|r| r.correct))
        .bind(result.map(|r| r.wrong))
        .bind(result.map(|r| r.empty))
        .bind(result.map(|r| r.percentage))
        .bind(result.map(|r| r.time_taken_secs))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to update exam session {}: {:?}", session_id, e);
            SessionError::from(e)
        })?;

        if updated.rows_affected() == 0 {
            return Err(SessionError::Persistence(format!(
                "exam session {} has no stored record",
                session_id
            )));
        }

        Ok(())
    }

    async fn save_answers(&self, session_id: Uuid, answers: &[AnswerRecord]) -> Result<(), SessionError> {
        if answers.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for answer in answers {
            sqlx::query(
                r#"
                INSERT INTO exam_answers
                    (session_id, question_id, option_id, is_correct, time_spent_secs, answered_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (session_id, question_id) DO UPDATE SET
                    option_id = EXCLUDED.option_id,
                    is_correct = EXCLUDED.is_correct,
                    time_spent_secs = EXCLUDED.time_spent_secs,
                    answered_at = EXCLUDED.answered_at
                "#,
            )
            .bind(session_id)
            .bind(answer.question_id)
            .bind(answer.option_id)
            .bind(answer.is_correct)
            .bind(answer.time_spent_secs)
            .bind(answer.answered_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn load_session_record(&self, session_id: Uuid) -> Result<Option<ExamSession>, SessionError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{} WHERE s.id = $1", SESSION_SELECT))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let answers = self.load_answers(&[session_id]).await?;
        row.into_session(answers).map(Some)
    }

    async fn load_active_session_records(
        &self,
        states: &[SessionStatus],
    ) -> Result<Vec<ExamSession>, SessionError> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE s.status = ANY($1) AND s.ended_at IS NULL ORDER BY s.started_at",
            SESSION_SELECT
        ))
        .bind(states)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load active exam sessions: {:?}", e);
            SessionError::from(e)
        })?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut answers_by_session: HashMap<Uuid, Vec<AnswerRow>> = HashMap::new();
        for answer in self.load_answers(&ids).await? {
            answers_by_session.entry(answer.session_id).or_default().push(answer);
        }

        rows.into_iter()
            .map(|row| {
                let answers = answers_by_session.remove(&row.id).unwrap_or_default();
                row.into_session(answers)
            })
            .collect()
    }

    async fn expire_stale_sessions(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, SessionError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE exam_sessions
            SET status = 'EXPIRED', ended_at = $2
            WHERE status = 'IN_PROGRESS' AND ended_at IS NULL AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(started_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
