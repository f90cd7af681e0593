// src/exam/mod.rs

pub mod clock;
pub mod notify;
pub mod recovery;
pub mod scoring;
pub mod service;
pub mod store;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use notify::{BroadcastNotifier, ExamEvent, Notifier, spawn_event_logger};
pub use recovery::{RecoveryReport, SweepReport, spawn_sweeper};
pub use service::{AutoSubmitter, ExamSessionService};
pub use store::SessionStore;
pub use timer::{ExamTimerEngine, ExpiryHandler, TimerState};
