// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{handlers::exam_session, state::AppState, utils::jwt::auth_middleware};

/// Assembles the main application router.
///
/// * Every exam and session route requires a bearer token.
/// * Applies global middleware (Trace, CORS).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        HeaderValue::from_static("http://localhost:3000"),
        HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let exam_routes = Router::new().route("/{exam_id}/start", post(exam_session::start_exam));

    let session_routes = Router::new()
        .route("/active", get(exam_session::list_active_sessions))
        .route("/{session_id}", get(exam_session::get_session))
        .route("/{session_id}/answers", post(exam_session::submit_answer))
        .route("/{session_id}/pause", post(exam_session::pause_exam))
        .route("/{session_id}/resume", post(exam_session::resume_exam))
        .route("/{session_id}/submit", post(exam_session::submit_exam))
        .route("/{session_id}/cancel", post(exam_session::cancel_exam))
        .route("/{session_id}/remaining", get(exam_session::get_remaining_time));

    let protected = Router::new()
        .nest("/api/exams", exam_routes)
        .nest("/api/sessions", session_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(exam_session::health))
        .merge(protected)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
