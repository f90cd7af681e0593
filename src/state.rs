// src/state.rs

use std::sync::Arc;

use axum::extract::FromRef;

use crate::{config::Config, exam::ExamSessionService};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<ExamSessionService>,
}

impl FromRef<AppState> for Arc<ExamSessionService> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
