// src/handlers/exam_session.rs

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppError,
    exam::ExamSessionService,
    models::session::{AnswerSubmission, SubmitExamRequest},
    utils::jwt::Claims,
};

/// Starts a timed session for the exam.
pub async fn start_exam(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let started = sessions.start_exam(user_id, exam_id).await?;

    Ok((StatusCode::CREATED, Json(started)))
}

/// Lists the caller's live (running or paused) sessions.
pub async fn list_active_sessions(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    Ok(Json(sessions.active_sessions(user_id)))
}

pub async fn get_session(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let view = sessions.get_session(user_id, session_id).await?;

    Ok(Json(view))
}

/// Records one answer. Re-answering a question replaces the earlier answer.
pub async fn submit_answer(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<AnswerSubmission>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let user_id = claims.user_id()?;
    let record = sessions.submit_answer(user_id, session_id, &payload).await?;

    Ok(Json(record))
}

pub async fn pause_exam(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let paused = sessions.pause_exam(user_id, session_id).await?;
    let remaining_seconds = sessions.get_remaining_seconds(user_id, session_id).await?;

    Ok(Json(json!({
        "paused": paused,
        "remaining_seconds": remaining_seconds,
    })))
}

pub async fn resume_exam(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let resumed = sessions.resume_exam(user_id, session_id).await?;
    let remaining_seconds = sessions.get_remaining_seconds(user_id, session_id).await?;

    Ok(Json(json!({
        "resumed": resumed,
        "remaining_seconds": remaining_seconds,
    })))
}

/// Submits the exam, merging any final answers in the body, and returns the
/// score with per-question details.
pub async fn submit_exam(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<SubmitExamRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let user_id = claims.user_id()?;
    let result = sessions
        .submit_exam(user_id, session_id, &payload.answers)
        .await?;

    Ok(Json(result))
}

pub async fn cancel_exam(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let result = sessions.cancel_exam(user_id, session_id).await?;

    Ok(Json(result))
}

pub async fn get_remaining_time(
    State(sessions): State<Arc<ExamSessionService>>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;
    let remaining_seconds = sessions.get_remaining_seconds(user_id, session_id).await?;

    Ok(Json(json!({
        "session_id": session_id,
        "remaining_seconds": remaining_seconds,
    })))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
