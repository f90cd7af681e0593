// src/exam/store.rs

//! In-memory registry of live exam sessions.
//!
//! The store owns every state transition. The map is guarded by a plain
//! mutex that is never held across an `.await`; durable writes happen after
//! the in-memory transition, outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::SessionError,
    exam::clock::Clock,
    models::session::{
        AnswerRecord, AnswerSubmission, ExamSession, FinalOutcome, SessionResult, SessionStatus,
    },
    repository::SessionRepository,
};

struct LiveSession {
    session: ExamSession,
    /// Set while a terminal write is in flight. Only the claimant may finish.
    finalizing: bool,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<Uuid, LiveSession>,
    by_user: HashMap<i64, HashSet<Uuid>>,
}

impl Registry {
    fn insert(&mut self, session: ExamSession) {
        self.by_user.entry(session.user_id).or_default().insert(session.id);
        self.sessions.insert(
            session.id,
            LiveSession {
                session,
                finalizing: false,
            },
        );
    }

    fn remove(&mut self, session_id: Uuid) -> Option<ExamSession> {
        let live = self.sessions.remove(&session_id)?;
        if let Some(ids) = self.by_user.get_mut(&live.session.user_id) {
            ids.remove(&session_id);
            if ids.is_empty() {
                self.by_user.remove(&live.session.user_id);
            }
        }
        Some(live.session)
    }

    /// Mutable access to a session that is not being finalized.
    fn open(&mut self, session_id: Uuid) -> Result<&mut ExamSession, SessionError> {
        match self.sessions.get_mut(&session_id) {
            None => Err(SessionError::NotFound(format!(
                "Exam session {} not found",
                session_id
            ))),
            Some(live) if live.finalizing => Err(SessionError::InvalidState(
                "Exam session is being finalized".to_string(),
            )),
            Some(live) => Ok(&mut live.session),
        }
    }
}

pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
}

impl SessionStore {
    pub fn new(repository: Arc<dyn SessionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repository,
            clock,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts a new `IN_PROGRESS` session for `exam_id`.
    ///
    /// Fails with `NotFound` if the exam does not exist and with
    /// `InvalidState` if the user already has a live session for it.
    pub async fn create(&self, user_id: i64, exam_id: i64) -> Result<ExamSession, SessionError> {
        if self.has_live_session(user_id, exam_id) {
            return Err(SessionError::InvalidState(
                "An exam session for this exam is already in progress".to_string(),
            ));
        }

        let exam = self
            .repository
            .load_exam_definition(exam_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(format!("Exam {} not found", exam_id)))?;
        let answer_key = self.repository.load_answer_key(exam_id).await?;

        let session = ExamSession::start(user_id, exam, Arc::new(answer_key), self.clock.now());
        self.repository.create_session_record(&session).await?;
        self.registry().insert(session.clone());

        tracing::info!(
            session_id = %session.id,
            user_id,
            exam_id,
            deadline = %session.deadline,
            "Exam session started"
        );
        Ok(session)
    }

    pub fn get(&self, session_id: Uuid) -> Option<ExamSession> {
        self.registry()
            .sessions
            .get(&session_id)
            .map(|live| live.session.clone())
    }

    pub fn sessions_for_user(&self, user_id: i64) -> Vec<ExamSession> {
        let registry = self.registry();
        let Some(ids) = registry.by_user.get(&user_id) else {
            return Vec::new();
        };
        let mut sessions: Vec<ExamSession> = ids
            .iter()
            .filter_map(|id| registry.sessions.get(id))
            .map(|live| live.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn has_live_session(&self, user_id: i64, exam_id: i64) -> bool {
        let registry = self.registry();
        registry.by_user.get(&user_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| registry.sessions.get(id))
                .any(|live| live.session.exam.id == exam_id)
        })
    }

    pub fn len(&self) -> usize {
        self.registry().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records one answer, replacing any earlier answer to the same question.
    ///
    /// Only `IN_PROGRESS` sessions accept answers.
    pub async fn record_answer(
        &self,
        session_id: Uuid,
        question_id: i64,
        option_id: Option<i64>,
        time_spent_secs: i32,
    ) -> Result<AnswerRecord, SessionError> {
        let record = {
            let now = self.clock.now();
            let mut registry = self.registry();
            let session = registry.open(session_id)?;
            if session.status != SessionStatus::InProgress {
                return Err(SessionError::InvalidState(format!(
                    "Cannot answer a session that is {}",
                    session.status
                )));
            }
            if session.deadline <= now {
                return Err(SessionError::InvalidState("Exam time is up".to_string()));
            }
            if !session.answer_key.is_empty() && !session.answer_key.contains_key(&question_id) {
                return Err(SessionError::NotFound(format!(
                    "Question {} is not part of this exam",
                    question_id
                )));
            }
            session.record_answer(question_id, option_id, time_spent_secs, now)
        };

        self.repository
            .save_answers(session_id, std::slice::from_ref(&record))
            .await?;
        Ok(record)
    }

    /// Merges a final batch of answers into a live session (running or paused).
    /// Questions outside the exam are ignored, and so is the whole batch once
    /// a running session is past its deadline.
    pub async fn merge_answers(
        &self,
        session_id: Uuid,
        answers: &[AnswerSubmission],
    ) -> Result<Vec<AnswerRecord>, SessionError> {
        let records: Vec<AnswerRecord> = {
            let now = self.clock.now();
            let mut registry = self.registry();
            let session = registry.open(session_id)?;
            if !session.status.is_live() {
                return Err(SessionError::InvalidState(format!(
                    "Cannot answer a session that is {}",
                    session.status
                )));
            }
            if session.status == SessionStatus::InProgress && session.deadline <= now {
                return Ok(Vec::new());
            }
            let key = session.answer_key.clone();
            answers
                .iter()
                .filter(|a| key.is_empty() || key.contains_key(&a.question_id))
                .map(|a| session.record_answer(a.question_id, a.option_id, a.time_spent_secs, now))
                .collect()
        };

        if records.is_empty() {
            return Ok(records);
        }
        self.repository.save_answers(session_id, &records).await?;
        Ok(records)
    }

    /// `IN_PROGRESS -> PAUSED`, snapshotting the remaining time.
    ///
    /// Returns `Ok(false)` without touching anything if the session is not
    /// running or its time is already up. An `Err` means the in-memory pause
    /// happened but the durable write failed.
    pub async fn pause(&self, session_id: Uuid) -> Result<bool, SessionError> {
        let patch = {
            let now = self.clock.now();
            let mut registry = self.registry();
            let Ok(session) = registry.open(session_id) else {
                return Ok(false);
            };
            if session.status != SessionStatus::InProgress || session.deadline <= now {
                return Ok(false);
            }
            session.pause(now);
            session.patch()
        };

        self.repository.update_session_record(session_id, &patch).await?;
        tracing::info!(%session_id, remaining_ms = ?patch.remaining_ms, "Exam session paused");
        Ok(true)
    }

    /// `PAUSED -> IN_PROGRESS`, pushing the deadline forward by the pause length.
    ///
    /// Same return contract as [`SessionStore::pause`].
    pub async fn resume(&self, session_id: Uuid) -> Result<bool, SessionError> {
        let patch = {
            let now = self.clock.now();
            let mut registry = self.registry();
            let Ok(session) = registry.open(session_id) else {
                return Ok(false);
            };
            if session.status != SessionStatus::Paused {
                return Ok(false);
            }
            session.resume(now);
            session.patch()
        };

        self.repository.update_session_record(session_id, &patch).await?;
        tracing::info!(%session_id, deadline = %patch.deadline, "Exam session resumed");
        Ok(true)
    }

    /// Moves a live session into `outcome`, scores it, persists it and drops
    /// it from the registry.
    ///
    /// Returns `Ok(None)` if the session is unknown or another caller is
    /// already finalizing it.
    pub async fn finalize(
        &self,
        session_id: Uuid,
        outcome: FinalOutcome,
    ) -> Result<Option<SessionResult>, SessionError> {
        let finished = self.finish_session(session_id, outcome).await?;
        Ok(finished.map(|(_, result)| result))
    }

    /// Same as [`SessionStore::finalize`] but also hands back the finished
    /// session, answers included.
    pub async fn finish_session(
        &self,
        session_id: Uuid,
        outcome: FinalOutcome,
    ) -> Result<Option<(ExamSession, SessionResult)>, SessionError> {
        self.finalize_if(session_id, outcome, |s| s.status.is_live()).await
    }

    /// Timer-path finalization: only a running session (or one paused with no
    /// time left) can expire.
    pub async fn expire(&self, session_id: Uuid) -> Result<Option<SessionResult>, SessionError> {
        let finished = self
            .finalize_if(session_id, FinalOutcome::Expired, |s| match s.status {
                SessionStatus::InProgress => true,
                SessionStatus::Paused => s.remaining_ms.unwrap_or(0) <= 0,
                _ => false,
            })
            .await?;
        Ok(finished.map(|(_, result)| result))
    }

    async fn finalize_if(
        &self,
        session_id: Uuid,
        outcome: FinalOutcome,
        eligible: impl Fn(&ExamSession) -> bool,
    ) -> Result<Option<(ExamSession, SessionResult)>, SessionError> {
        let (finished, result) = {
            let now = self.clock.now();
            let mut registry = self.registry();
            let Some(live) = registry.sessions.get_mut(&session_id) else {
                return Ok(None);
            };
            if live.finalizing || !eligible(&live.session) {
                return Ok(None);
            }
            live.finalizing = true;

            let mut finished = live.session.clone();
            let result = finished.finish(outcome, now);
            (finished, result)
        };

        if let Err(e) = self
            .repository
            .update_session_record(session_id, &finished.patch())
            .await
        {
            // Leave the session in its last good state for a later retry.
            if let Some(live) = self.registry().sessions.get_mut(&session_id) {
                live.finalizing = false;
            }
            return Err(e);
        }

        self.registry().remove(session_id);
        tracing::info!(
            %session_id,
            status = %finished.status,
            score = result.score,
            correct = result.correct,
            wrong = result.wrong,
            empty = result.empty,
            "Exam session finalized"
        );
        Ok(Some((finished, result)))
    }

    /// Puts a session loaded from storage back into the registry.
    /// Returns `false` if it was already tracked.
    pub fn restore(&self, session: ExamSession) -> bool {
        let mut registry = self.registry();
        if registry.sessions.contains_key(&session.id) {
            return false;
        }
        registry.insert(session);
        true
    }

    /// Drops a session without scoring it (already finalized in storage).
    pub fn evict(&self, session_id: Uuid) -> bool {
        self.registry().remove(session_id).is_some()
    }

    /// Live sessions out of time that nobody is finalizing: running past
    /// their deadline, or paused with nothing left on the clock.
    pub fn overdue_sessions(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.registry()
            .sessions
            .values()
            .filter(|live| {
                !live.finalizing
                    && match live.session.status {
                        SessionStatus::InProgress => live.session.deadline <= now,
                        SessionStatus::Paused => live.session.remaining_ms.unwrap_or(0) <= 0,
                        _ => false,
                    }
            })
            .map(|live| live.session.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exam::clock::ManualClock;
    use crate::models::exam::{AnswerKey, ExamDefinition, ExamType};
    use crate::repository::MemorySessionRepository;
    use chrono::{Duration, TimeZone};

    const EXAM_ID: i64 = 11;

    fn setup() -> (SessionStore, Arc<MemorySessionRepository>, Arc<ManualClock>) {
        let repository = Arc::new(MemorySessionRepository::new());
        repository.insert_exam(
            ExamDefinition {
                id: EXAM_ID,
                title: "TYT Deneme".to_string(),
                exam_type: ExamType::YksTyt,
                total_questions: 5,
                duration_minutes: 10,
            },
            AnswerKey::from([(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]),
        );
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
        ));
        let store = SessionStore::new(repository.clone(), clock.clone());
        (store, repository, clock)
    }

    #[tokio::test]
    async fn create_fails_for_unknown_exam() {
        let (store, _, _) = setup();

        let err = store.create(1, 999).await.unwrap_err();

        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn create_sets_deadline_and_indexes_by_user() {
        let (store, repository, clock) = setup();

        let session = store.create(1, EXAM_ID).await.unwrap();

        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.deadline, clock.now() + Duration::minutes(10));
        assert_eq!(store.sessions_for_user(1).len(), 1);
        assert!(store.sessions_for_user(2).is_empty());
        assert!(repository.stored_session(session.id).is_some());

        let again = store.create(1, EXAM_ID).await.unwrap_err();
        assert!(matches!(again, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn pause_is_idempotent() {
        let (store, _, clock) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();

        clock.advance(Duration::minutes(2));
        assert!(store.pause(session.id).await.unwrap());
        let snapshot = store.get(session.id).unwrap();

        clock.advance(Duration::minutes(1));
        assert!(!store.pause(session.id).await.unwrap());
        let after = store.get(session.id).unwrap();

        assert_eq!(after.status, SessionStatus::Paused);
        assert_eq!(after.remaining_ms, snapshot.remaining_ms);
        assert_eq!(after.remaining_ms, Some(8 * 60 * 1000));
        assert!(!store.pause(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn pause_and_resume_preserve_allotted_time() {
        let (store, _, clock) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();

        clock.advance(Duration::minutes(3));
        store.pause(session.id).await.unwrap();
        clock.advance(Duration::minutes(5));
        assert!(store.resume(session.id).await.unwrap());

        let resumed = store.get(session.id).unwrap();
        let remaining = resumed.remaining_seconds(clock.now());
        assert!((remaining - 7 * 60).abs() <= 1, "remaining was {}", remaining);
        assert_eq!(resumed.deadline, resumed.expected_deadline());
        assert!(!store.resume(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn answers_are_rejected_once_terminal() {
        let (store, repository, _) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        store.record_answer(session.id, 1, Some(10), 12).await.unwrap();

        store.finalize(session.id, FinalOutcome::Submitted).await.unwrap();
        let err = store.record_answer(session.id, 2, Some(20), 5).await.unwrap_err();

        assert!(matches!(err, SessionError::NotFound(_)));
        let stored = repository.stored_session(session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Submitted);
        assert_eq!(stored.answers.len(), 1);
    }

    #[tokio::test]
    async fn answers_are_rejected_while_paused() {
        let (store, _, _) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        store.pause(session.id).await.unwrap();

        let err = store.record_answer(session.id, 1, Some(10), 3).await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidState(_)));
        assert!(store.get(session.id).unwrap().answers.is_empty());
    }

    #[tokio::test]
    async fn finalize_scores_once_and_removes_the_session() {
        let (store, repository, _) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        store.record_answer(session.id, 1, Some(10), 5).await.unwrap();
        store.record_answer(session.id, 2, Some(20), 5).await.unwrap();
        store.record_answer(session.id, 3, Some(99), 5).await.unwrap();

        let result = store
            .finalize(session.id, FinalOutcome::Submitted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.correct, 2);
        assert_eq!(result.wrong, 1);
        assert_eq!(result.empty, 2);
        assert_eq!(result.score, 1.75);

        assert!(store.finalize(session.id, FinalOutcome::Cancelled).await.unwrap().is_none());
        assert!(store.expire(session.id).await.unwrap().is_none());
        assert!(store.get(session.id).is_none());
        assert!(store.sessions_for_user(1).is_empty());
        assert_eq!(
            repository.stored_session(session.id).unwrap().result,
            Some(result)
        );
    }

    #[tokio::test]
    async fn expire_skips_paused_sessions_with_time_left() {
        let (store, _, _) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        store.pause(session.id).await.unwrap();

        assert!(store.expire(session.id).await.unwrap().is_none());
        assert_eq!(store.get(session.id).unwrap().status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn failed_finalize_leaves_the_session_live() {
        let (store, repository, clock) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        clock.advance(Duration::minutes(11));

        repository.set_fail_writes(true);
        let err = store.expire(session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
        assert_eq!(store.get(session.id).unwrap().status, SessionStatus::InProgress);
        assert_eq!(store.overdue_sessions(clock.now()), vec![session.id]);

        repository.set_fail_writes(false);
        assert!(store.expire(session.id).await.unwrap().is_some());
        assert!(store.overdue_sessions(clock.now()).is_empty());
    }

    #[tokio::test]
    async fn sessions_out_of_time_cannot_be_paused_or_answered() {
        let (store, _, clock) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        clock.advance(Duration::minutes(10));

        assert!(!store.pause(session.id).await.unwrap());
        let err = store.record_answer(session.id, 1, Some(10), 5).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));

        let merged = store
            .merge_answers(
                session.id,
                &[AnswerSubmission { question_id: 2, option_id: Some(20), time_spent_secs: 4 }],
            )
            .await
            .unwrap();
        assert!(merged.is_empty());

        let live = store.get(session.id).unwrap();
        assert_eq!(live.status, SessionStatus::InProgress);
        assert!(live.answers.is_empty());
        assert_eq!(store.overdue_sessions(clock.now()), vec![session.id]);
    }

    #[tokio::test]
    async fn paused_sessions_without_time_left_are_overdue() {
        let (store, _, clock) = setup();
        let mut session = store.create(1, EXAM_ID).await.unwrap();
        store.evict(session.id);
        session.pause(session.deadline);
        assert_eq!(session.remaining_ms, Some(0));
        assert!(store.restore(session.clone()));

        assert_eq!(store.overdue_sessions(clock.now()), vec![session.id]);
        assert!(store.expire(session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finish_session_returns_the_recorded_answers() {
        let (store, _, _) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        store.record_answer(session.id, 4, Some(40), 9).await.unwrap();

        let (finished, result) = store
            .finish_session(session.id, FinalOutcome::Submitted)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(finished.status, SessionStatus::Submitted);
        assert_eq!(finished.answers.len(), 1);
        assert!(finished.answers[&4].is_correct);
        assert_eq!(result.correct, 1);
    }

    #[tokio::test]
    async fn merge_overwrites_and_ignores_unknown_questions() {
        let (store, _, _) = setup();
        let session = store.create(1, EXAM_ID).await.unwrap();
        store.record_answer(session.id, 1, Some(11), 5).await.unwrap();

        let merged = store
            .merge_answers(
                session.id,
                &[
                    AnswerSubmission { question_id: 1, option_id: Some(10), time_spent_secs: 8 },
                    AnswerSubmission { question_id: 77, option_id: Some(1), time_spent_secs: 1 },
                ],
            )
            .await
            .unwrap();

        assert_eq!(merged.len(), 1);
        let answers = store.get(session.id).unwrap().answers;
        assert!(answers[&1].is_correct);
        assert!(!answers.contains_key(&77));
    }
}
