// src/exam/timer.rs

//! Expiry scheduling for live exam sessions.
//!
//! One dispatcher task drains a min-heap of deadlines. Every session has at
//! most one schedule entry; re-arming bumps a generation counter so the heap
//! can keep stale items around and skip them lazily when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{error::SessionError, exam::clock::Clock};

/// Invoked by the dispatcher when a session's timer fires.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn on_expiry(&self, session_id: Uuid) -> Result<(), SessionError>;
}

/// Scheduling state of one session. A fired timer has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Armed { fire_at: DateTime<Utc> },
    Disarmed { remaining_ms: i64 },
}

struct Entry {
    state: TimerState,
    generation: u64,
}

#[derive(Default)]
struct Schedule {
    entries: HashMap<Uuid, Entry>,
    queue: BinaryHeap<Reverse<(Instant, u64, Uuid)>>,
    next_generation: u64,
    stopped: bool,
}

impl Schedule {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Pops every due item whose generation still matches its entry.
    fn take_due(&mut self, now: Instant) -> Vec<Uuid> {
        let mut due = Vec::new();
        while let Some(Reverse((at, generation, session_id))) = self.queue.peek().copied() {
            if at > now {
                break;
            }
            self.queue.pop();
            let current = self.entries.get(&session_id).is_some_and(|entry| {
                entry.generation == generation && matches!(entry.state, TimerState::Armed { .. })
            });
            if current {
                self.entries.remove(&session_id);
                due.push(session_id);
            }
        }
        due
    }

    fn next_wake(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Drops stale heap items once they clearly outnumber live entries.
    fn compact(&mut self) {
        if self.queue.len() <= 64 || self.queue.len() <= self.entries.len() * 2 {
            return;
        }
        let entries = &self.entries;
        self.queue.retain(|Reverse((_, generation, session_id))| {
            entries.get(session_id).is_some_and(|entry| {
                entry.generation == *generation && matches!(entry.state, TimerState::Armed { .. })
            })
        });
    }
}

struct Shared {
    schedule: Mutex<Schedule>,
    wake: Notify,
}

impl Shared {
    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct ExamTimerEngine {
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ExamTimerEngine {
    /// Spawns the dispatcher task. Must be called inside a Tokio runtime.
    pub fn start(clock: Arc<dyn Clock>, handler: Arc<dyn ExpiryHandler>) -> Self {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::default()),
            wake: Notify::new(),
        });
        let dispatcher = tokio::spawn(run_dispatcher(shared.clone(), handler));

        Self {
            clock,
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Schedules the expiry of `session_id` at `fire_at`, replacing any
    /// existing timer for it.
    pub fn arm(&self, session_id: Uuid, fire_at: DateTime<Utc>) {
        let delay = (fire_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let at = Instant::now() + delay;
        {
            let mut schedule = self.shared.schedule();
            if schedule.stopped {
                return;
            }
            let generation = schedule.bump();
            schedule.entries.insert(
                session_id,
                Entry {
                    state: TimerState::Armed { fire_at },
                    generation,
                },
            );
            schedule.queue.push(Reverse((at, generation, session_id)));
            schedule.compact();
        }
        self.shared.wake.notify_one();
        tracing::debug!(%session_id, %fire_at, "Exam timer armed");
    }

    /// Cancels the pending expiry and returns the time that was left.
    /// `None` if no timer was armed.
    pub fn disarm(&self, session_id: Uuid) -> Option<i64> {
        let now = self.clock.now();
        let mut schedule = self.shared.schedule();
        let generation = schedule.bump();
        let entry = schedule.entries.get_mut(&session_id)?;
        let TimerState::Armed { fire_at } = entry.state else {
            return None;
        };
        let remaining_ms = (fire_at - now).num_milliseconds().max(0);
        entry.state = TimerState::Disarmed { remaining_ms };
        entry.generation = generation;
        tracing::debug!(%session_id, remaining_ms, "Exam timer disarmed");
        Some(remaining_ms)
    }

    /// Records a disarmed timer without scheduling anything. Used when a
    /// paused session is recovered.
    pub fn park(&self, session_id: Uuid, remaining_ms: i64) {
        let mut schedule = self.shared.schedule();
        if schedule.stopped {
            return;
        }
        let generation = schedule.bump();
        schedule.entries.insert(
            session_id,
            Entry {
                state: TimerState::Disarmed { remaining_ms },
                generation,
            },
        );
    }

    /// Removes any timer for the session. Returns whether one existed.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        let removed = self.shared.schedule().entries.remove(&session_id).is_some();
        if removed {
            tracing::debug!(%session_id, "Exam timer cancelled");
        }
        removed
    }

    pub fn state(&self, session_id: Uuid) -> Option<TimerState> {
        self.shared
            .schedule()
            .entries
            .get(&session_id)
            .map(|entry| entry.state)
    }

    pub fn armed_count(&self) -> usize {
        self.shared
            .schedule()
            .entries
            .values()
            .filter(|entry| matches!(entry.state, TimerState::Armed { .. }))
            .count()
    }

    /// Clears every pending timer and stops the dispatcher.
    pub fn shutdown(&self) {
        let cleared = {
            let mut schedule = self.shared.schedule();
            schedule.stopped = true;
            schedule.queue.clear();
            let cleared = schedule.entries.len();
            schedule.entries.clear();
            cleared
        };
        self.shared.wake.notify_one();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("Exam timer engine stopped, cleared {} timers", cleared);
        }
    }
}

impl Drop for ExamTimerEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_dispatcher(shared: Arc<Shared>, handler: Arc<dyn ExpiryHandler>) {
    loop {
        let (due, next_wake) = {
            let mut schedule = shared.schedule();
            if schedule.stopped {
                break;
            }
            let due = schedule.take_due(Instant::now());
            (due, schedule.next_wake())
        };

        for session_id in due {
            let handler = handler.clone();
            // Each expiry runs on its own task so slow persistence never
            // delays other sessions' timers.
            tokio::spawn(async move {
                tracing::info!(%session_id, "Exam timer fired");
                if let Err(e) = handler.on_expiry(session_id).await {
                    tracing::error!(%session_id, "Failed to auto-submit exam session: {}", e);
                }
            });
        }

        match next_wake {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}
