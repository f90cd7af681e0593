// src/exam/recovery.rs

//! Startup reconciliation and the periodic stale-session sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    error::SessionError,
    exam::service::ExamSessionService,
    models::{
        exam::AnswerKey,
        session::{ExamSession, SessionStatus},
    },
};

/// What happened to each stored live session during recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running sessions re-armed with their remaining time.
    pub restored: usize,
    /// Paused sessions put back without a running timer.
    pub paused: usize,
    /// Sessions whose deadline passed while the process was down.
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Overdue in-memory sessions finalized by the sweep.
    pub reconciled: usize,
    /// Stored sessions stuck in progress past the stale margin.
    pub stale_expired: usize,
    pub failed: usize,
}

enum Recovered {
    Running,
    Paused,
    Expired,
}

impl ExamSessionService {
    /// Rebuilds the live registry and timers from durable storage.
    pub async fn recover(&self) -> Result<RecoveryReport, SessionError> {
        let stored = self
            .repository
            .load_active_session_records(&[SessionStatus::InProgress, SessionStatus::Paused])
            .await?;
        tracing::info!("Recovering {} exam sessions", stored.len());

        let mut answer_keys: HashMap<i64, Arc<AnswerKey>> = HashMap::new();
        let mut report = RecoveryReport::default();

        for mut session in stored {
            let session_id = session.id;
            let key = match answer_keys.get(&session.exam.id) {
                Some(key) => key.clone(),
                None => match self.repository.load_answer_key(session.exam.id).await {
                    Ok(key) => {
                        let key = Arc::new(key);
                        answer_keys.insert(session.exam.id, key.clone());
                        key
                    }
                    Err(e) => {
                        tracing::error!(%session_id, "Failed to load answer key during recovery: {}", e);
                        report.failed += 1;
                        continue;
                    }
                },
            };
            session.answer_key = key;

            match self.recover_session(session).await {
                Ok(Recovered::Running) => report.restored += 1,
                Ok(Recovered::Paused) => report.paused += 1,
                Ok(Recovered::Expired) => report.expired += 1,
                Err(e) => {
                    tracing::error!(%session_id, "Failed to recover exam session: {}", e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            restored = report.restored,
            paused = report.paused,
            expired = report.expired,
            failed = report.failed,
            "Exam session recovery finished"
        );
        Ok(report)
    }

    async fn recover_session(&self, mut session: ExamSession) -> Result<Recovered, SessionError> {
        let now = self.clock.now();
        let session_id = session.id;

        if session.status == SessionStatus::Paused {
            let remaining_ms = session.remaining_ms.unwrap_or(0);
            if remaining_ms > 0 {
                self.store.restore(session);
                self.engine.park(session_id, remaining_ms);
                return Ok(Recovered::Paused);
            }
        } else {
            let deadline = session.expected_deadline();
            if now < deadline {
                session.deadline = deadline;
                self.store.restore(session);
                self.engine.arm(session_id, deadline);
                return Ok(Recovered::Running);
            }
        }

        tracing::warn!(%session_id, "Exam session deadline passed while offline, expiring");
        self.store.restore(session);
        self.auto_submitter.auto_submit(session_id).await?;
        Ok(Recovered::Expired)
    }

    /// Backstop for timers that fired but failed and for sessions that were
    /// never recovered.
    pub async fn sweep(&self, stale_after: chrono::Duration) -> Result<SweepReport, SessionError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for session_id in self.store.overdue_sessions(now) {
            self.engine.cancel(session_id);
            match self.auto_submitter.auto_submit(session_id).await {
                Ok(Some(_)) => report.reconciled += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(%session_id, "Sweep failed to expire exam session: {}", e);
                    report.failed += 1;
                }
            }
        }

        let stale: Vec<Uuid> = self
            .repository
            .expire_stale_sessions(now - stale_after, now)
            .await?;
        for session_id in &stale {
            self.engine.cancel(*session_id);
            self.store.evict(*session_id);
        }
        report.stale_expired = stale.len();

        if report != SweepReport::default() {
            tracing::info!(
                reconciled = report.reconciled,
                stale_expired = report.stale_expired,
                failed = report.failed,
                "Exam session sweep finished"
            );
        }
        Ok(report)
    }
}

/// Runs [`ExamSessionService::sweep`] every `every`, starting one period from now.
pub fn spawn_sweeper(
    service: Arc<ExamSessionService>,
    every: Duration,
    stale_after: chrono::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = service.sweep(stale_after).await {
                tracing::error!("Exam session sweep failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exam::clock::{Clock, ManualClock};
    use crate::exam::notify::BroadcastNotifier;
    use crate::exam::timer::TimerState;
    use crate::models::exam::{ExamDefinition, ExamType};
    use crate::repository::MemorySessionRepository;
    use chrono::{TimeZone, Utc};

    fn exam(duration_minutes: i32) -> ExamDefinition {
        ExamDefinition {
            id: 3,
            title: "KPSS Genel Yetenek".to_string(),
            exam_type: ExamType::Kpss,
            total_questions: 3,
            duration_minutes,
        }
    }

    fn setup(duration_minutes: i32) -> (ExamSessionService, Arc<MemorySessionRepository>, Arc<ManualClock>) {
        let repository = Arc::new(MemorySessionRepository::new());
        repository.insert_exam(exam(duration_minutes), AnswerKey::from([(1, 1), (2, 2), (3, 3)]));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).unwrap()));
        let service = ExamSessionService::new(
            repository.clone(),
            Arc::new(BroadcastNotifier::new(16)),
            clock.clone(),
        );
        (service, repository, clock)
    }

    fn stored_session(
        repository: &MemorySessionRepository,
        clock: &ManualClock,
        duration_minutes: i32,
        started_ago: chrono::Duration,
    ) -> ExamSession {
        let session = ExamSession::start(
            7,
            exam(duration_minutes),
            Arc::new(AnswerKey::new()),
            clock.now() - started_ago,
        );
        repository.insert_session(session.clone());
        session
    }

    #[tokio::test]
    async fn sessions_past_their_deadline_expire_on_recovery() {
        let (service, repository, clock) = setup(60);
        let session = stored_session(&repository, &clock, 60, chrono::Duration::hours(2));

        let report = service.recover().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(service.engine().state(session.id), None);
        assert!(service.store().get(session.id).is_none());
        let stored = repository.stored_session(session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
        assert!(stored.auto_submitted);
        assert!(stored.result.is_some());
    }

    #[tokio::test]
    async fn running_sessions_are_rearmed_with_their_remaining_time() {
        let (service, repository, clock) = setup(60);
        let session = stored_session(&repository, &clock, 60, chrono::Duration::minutes(10));

        let report = service.recover().await.unwrap();

        assert_eq!(report.restored, 1);
        let live = service.store().get(session.id).unwrap();
        assert_eq!(live.status, SessionStatus::InProgress);
        assert_eq!(live.remaining_seconds(clock.now()), 50 * 60);
        assert!(!live.answer_key.is_empty());
        assert_eq!(
            service.engine().state(session.id),
            Some(TimerState::Armed { fire_at: live.deadline })
        );
    }

    #[tokio::test]
    async fn paused_sessions_stay_paused() {
        let (service, repository, clock) = setup(60);
        let mut session = ExamSession::start(
            7,
            exam(60),
            Arc::new(AnswerKey::new()),
            clock.now() - chrono::Duration::hours(5),
        );
        session.pause(session.started_at + chrono::Duration::minutes(20));
        repository.insert_session(session.clone());

        let report = service.recover().await.unwrap();

        assert_eq!(report.paused, 1);
        assert_eq!(service.store().get(session.id).unwrap().status, SessionStatus::Paused);
        assert_eq!(
            service.engine().state(session.id),
            Some(TimerState::Disarmed { remaining_ms: 40 * 60 * 1000 })
        );
    }

    #[tokio::test]
    async fn sweep_reconciles_a_failed_auto_submit() {
        let (service, repository, clock) = setup(10);
        let started = service.start_exam(7, 3).await.unwrap();
        clock.advance(chrono::Duration::minutes(11));

        repository.set_fail_writes(true);
        assert!(service.auto_submitter.auto_submit(started.session_id).await.is_err());
        assert!(service.store().get(started.session_id).is_some());
        repository.set_fail_writes(false);

        let report = service.sweep(chrono::Duration::hours(24)).await.unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(
            repository.stored_session(started.session_id).unwrap().status,
            SessionStatus::Expired
        );
    }

    #[tokio::test]
    async fn sweep_expires_sessions_stuck_past_the_stale_margin() {
        let (service, repository, clock) = setup(48 * 60);
        let started = service.start_exam(7, 3).await.unwrap();
        clock.advance(chrono::Duration::hours(25));

        let report = service.sweep(chrono::Duration::hours(24)).await.unwrap();

        assert_eq!(report.stale_expired, 1);
        assert_eq!(report.reconciled, 0);
        assert!(service.store().get(started.session_id).is_none());
        assert_eq!(service.engine().state(started.session_id), None);
        let stored = repository.stored_session(started.session_id).unwrap();
        assert_eq!(stored.status, SessionStatus::Expired);
        assert!(!stored.auto_submitted);
        assert!(stored.result.is_none());
    }
}
