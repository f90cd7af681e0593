// src/exam/service.rs

//! Caller-facing exam session operations.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    error::SessionError,
    exam::{
        clock::Clock,
        notify::{ExamEvent, Notifier},
        store::SessionStore,
        timer::{ExamTimerEngine, ExpiryHandler},
    },
    models::session::{
        AnswerRecord, AnswerSubmission, ExamSession, FinalOutcome, SessionResult, SessionStatus,
        SessionView, StartedExam, SubmittedExam,
    },
    repository::SessionRepository,
};

/// Finalizes expired sessions. Shared by the timer, recovery and the sweep.
pub struct AutoSubmitter {
    store: Arc<SessionStore>,
    notifier: Arc<dyn Notifier>,
}

impl AutoSubmitter {
    pub fn new(store: Arc<SessionStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Expires the session if it is still running. Returns `Ok(None)` when
    /// something else already ended it.
    pub async fn auto_submit(&self, session_id: Uuid) -> Result<Option<SessionResult>, SessionError> {
        let Some(session) = self.store.get(session_id) else {
            return Ok(None);
        };
        let Some(result) = self.store.expire(session_id).await? else {
            return Ok(None);
        };

        self.notifier.publish(ExamEvent::AutoSubmitted {
            session_id,
            user_id: session.user_id,
            exam_id: session.exam.id,
            reason: "TIME_EXPIRED".to_string(),
        });
        publish_result(self.notifier.as_ref(), session_id, &result);
        Ok(Some(result))
    }
}

#[async_trait]
impl ExpiryHandler for AutoSubmitter {
    async fn on_expiry(&self, session_id: Uuid) -> Result<(), SessionError> {
        self.auto_submit(session_id).await.map(|_| ())
    }
}

fn publish_result(notifier: &dyn Notifier, session_id: Uuid, result: &SessionResult) {
    notifier.publish(ExamEvent::ResultCalculated {
        session_id,
        score: result.score,
        correct: result.correct,
        total_questions: result.total_questions,
        percentage: result.percentage,
    });
}

/// Owns the store and the timer engine for the lifetime of the process.
pub struct ExamSessionService {
    pub(crate) store: Arc<SessionStore>,
    pub(crate) engine: ExamTimerEngine,
    pub(crate) repository: Arc<dyn SessionRepository>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) auto_submitter: Arc<AutoSubmitter>,
}

impl ExamSessionService {
    /// Builds the service and starts the timer dispatcher.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(repository.clone(), clock.clone()));
        let auto_submitter = Arc::new(AutoSubmitter::new(store.clone(), notifier.clone()));
        let engine = ExamTimerEngine::start(clock.clone(), auto_submitter.clone());

        Self {
            store,
            engine,
            repository,
            notifier,
            clock,
            auto_submitter,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn engine(&self) -> &ExamTimerEngine {
        &self.engine
    }

    /// Starts a timed session and arms its expiry.
    pub async fn start_exam(&self, user_id: i64, exam_id: i64) -> Result<StartedExam, SessionError> {
        let session = self.store.create(user_id, exam_id).await?;
        self.engine.arm(session.id, session.deadline);

        self.notifier.publish(ExamEvent::Started {
            session_id: session.id,
            user_id,
            exam_id,
            started_at: session.started_at,
            deadline: session.deadline,
        });

        Ok(StartedExam {
            session_id: session.id,
            exam_id,
            started_at: session.started_at,
            deadline: session.deadline,
            duration_minutes: session.exam.duration_minutes,
            remaining_seconds: session.remaining_seconds(self.clock.now()),
        })
    }

    pub async fn submit_answer(
        &self,
        user_id: i64,
        session_id: Uuid,
        answer: &AnswerSubmission,
    ) -> Result<AnswerRecord, SessionError> {
        self.owned_session(user_id, session_id).await?;

        match self
            .store
            .record_answer(session_id, answer.question_id, answer.option_id, answer.time_spent_secs)
            .await
        {
            // Finalized between the ownership check and the write.
            Err(SessionError::NotFound(_)) if self.store.get(session_id).is_none() => {
                Err(self.missing_session(user_id, session_id).await)
            }
            other => other,
        }
    }

    /// Pauses a running session. `Ok(false)` if it was not running.
    pub async fn pause_exam(&self, user_id: i64, session_id: Uuid) -> Result<bool, SessionError> {
        if let Some(ended) = self.ended_or_owned(user_id, session_id).await? {
            tracing::debug!(%session_id, status = %ended, "Ignoring pause of an ended session");
            return Ok(false);
        }

        let outcome = self.store.pause(session_id).await;
        if !matches!(outcome, Ok(false)) {
            // The in-memory pause happened even if the durable write failed.
            self.engine.disarm(session_id);
        }

        if let (Ok(true), Some(session)) = (&outcome, self.store.get(session_id)) {
            self.notifier.publish(ExamEvent::Paused {
                session_id,
                paused_at: session.paused_at.unwrap_or_else(|| self.clock.now()),
                remaining_ms: session.remaining_ms.unwrap_or(0),
            });
        }
        outcome
    }

    /// Resumes a paused session and re-arms its timer. `Ok(false)` if it was
    /// not paused.
    pub async fn resume_exam(&self, user_id: i64, session_id: Uuid) -> Result<bool, SessionError> {
        if let Some(ended) = self.ended_or_owned(user_id, session_id).await? {
            tracing::debug!(%session_id, status = %ended, "Ignoring resume of an ended session");
            return Ok(false);
        }

        let outcome = self.store.resume(session_id).await;
        if !matches!(outcome, Ok(false)) {
            if let Some(session) = self.store.get(session_id) {
                if session.status == SessionStatus::InProgress {
                    self.engine.arm(session_id, session.deadline);
                    if matches!(outcome, Ok(true)) {
                        self.notifier.publish(ExamEvent::Resumed {
                            session_id,
                            new_deadline: session.deadline,
                        });
                    }
                }
            }
        }
        outcome
    }

    /// Merges the final answers and submits the session.
    ///
    /// The pending timer is cancelled first so a racing expiry cannot score
    /// the session a second time.
    pub async fn submit_exam(
        &self,
        user_id: i64,
        session_id: Uuid,
        answers: &[AnswerSubmission],
    ) -> Result<SubmittedExam, SessionError> {
        self.finish(user_id, session_id, FinalOutcome::Submitted, answers)
            .await
    }

    /// Abandons the session; it is scored like a submission and marked `CANCELLED`.
    pub async fn cancel_exam(&self, user_id: i64, session_id: Uuid) -> Result<SubmittedExam, SessionError> {
        self.finish(user_id, session_id, FinalOutcome::Cancelled, &[]).await
    }

    async fn finish(
        &self,
        user_id: i64,
        session_id: Uuid,
        outcome: FinalOutcome,
        answers: &[AnswerSubmission],
    ) -> Result<SubmittedExam, SessionError> {
        let session = self.owned_session(user_id, session_id).await?;
        self.engine.cancel(session_id);

        if !answers.is_empty() {
            if let Err(e) = self.store.merge_answers(session_id, answers).await {
                self.rearm_if_running(session_id);
                return Err(e);
            }
        }

        match self.store.finish_session(session_id, outcome).await {
            Ok(Some((finished, result))) => {
                let event = match outcome {
                    FinalOutcome::Cancelled => ExamEvent::Cancelled {
                        session_id,
                        user_id,
                        exam_id: session.exam.id,
                    },
                    _ => ExamEvent::Submitted {
                        session_id,
                        user_id,
                        exam_id: session.exam.id,
                    },
                };
                self.notifier.publish(event);
                publish_result(self.notifier.as_ref(), session_id, &result);
                Ok(SubmittedExam {
                    result,
                    details: finished.answers.into_values().collect(),
                })
            }
            // Lost the race against the timer or another request.
            Ok(None) => Err(self.missing_session(user_id, session_id).await),
            Err(e) => {
                self.rearm_if_running(session_id);
                Err(e)
            }
        }
    }

    fn rearm_if_running(&self, session_id: Uuid) {
        if let Some(session) = self.store.get(session_id) {
            if session.status == SessionStatus::InProgress {
                self.engine.arm(session_id, session.deadline);
            }
        }
    }

    /// Seconds left on the clock; 0 once the session has ended.
    pub async fn get_remaining_seconds(&self, user_id: i64, session_id: Uuid) -> Result<i64, SessionError> {
        match self.ended_or_owned(user_id, session_id).await? {
            Some(_) => Ok(0),
            None => Ok(self
                .store
                .get(session_id)
                .map_or(0, |s| s.remaining_seconds(self.clock.now()))),
        }
    }

    /// Live or stored view of a session.
    pub async fn get_session(&self, user_id: i64, session_id: Uuid) -> Result<SessionView, SessionError> {
        let now = self.clock.now();
        if let Some(session) = self.store.get(session_id) {
            check_owner(&session, user_id)?;
            return Ok(session.view(now));
        }

        match self.repository.load_session_record(session_id).await? {
            Some(session) => {
                check_owner(&session, user_id)?;
                Ok(session.view(now))
            }
            None => Err(not_found(session_id)),
        }
    }

    pub fn active_sessions(&self, user_id: i64) -> Vec<SessionView> {
        let now = self.clock.now();
        self.store
            .sessions_for_user(user_id)
            .iter()
            .map(|s| s.view(now))
            .collect()
    }

    /// Cancels every pending timer. Live sessions stay in storage and are
    /// picked up by recovery on the next start.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        tracing::info!("Exam session service shut down with {} live sessions", self.store.len());
    }

    async fn owned_session(&self, user_id: i64, session_id: Uuid) -> Result<ExamSession, SessionError> {
        match self.store.get(session_id) {
            Some(session) => {
                check_owner(&session, user_id)?;
                Ok(session)
            }
            None => Err(self.missing_session(user_id, session_id).await),
        }
    }

    /// `Ok(Some(status))` if the session already ended, `Ok(None)` if it is
    /// live and owned by `user_id`.
    async fn ended_or_owned(&self, user_id: i64, session_id: Uuid) -> Result<Option<SessionStatus>, SessionError> {
        if let Some(session) = self.store.get(session_id) {
            check_owner(&session, user_id)?;
            return Ok(None);
        }

        match self.repository.load_session_record(session_id).await? {
            Some(session) => {
                check_owner(&session, user_id)?;
                Ok(Some(session.status))
            }
            None => Err(not_found(session_id)),
        }
    }

    /// Explains why a session is not in the live registry.
    async fn missing_session(&self, user_id: i64, session_id: Uuid) -> SessionError {
        match self.repository.load_session_record(session_id).await {
            Ok(Some(session)) if session.user_id != user_id => forbidden(),
            Ok(Some(session)) if session.status.is_terminal() => SessionError::InvalidState(
                format!("Exam session is already {}", session.status),
            ),
            Ok(Some(_)) => SessionError::InvalidState("Exam session is not active".to_string()),
            Ok(None) => not_found(session_id),
            Err(e) => e,
        }
    }
}

fn check_owner(session: &ExamSession, user_id: i64) -> Result<(), SessionError> {
    if session.user_id != user_id {
        return Err(forbidden());
    }
    Ok(())
}

fn forbidden() -> SessionError {
    SessionError::Forbidden("Exam session belongs to another user".to_string())
}

fn not_found(session_id: Uuid) -> SessionError {
    SessionError::NotFound(format!("Exam session {} not found", session_id))
}
