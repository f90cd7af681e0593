// tests/exam_session_api_tests.rs

use std::collections::HashMap;
use std::sync::Arc;

use exam_sessions::{
    config::Config,
    exam::{BroadcastNotifier, ExamSessionService, SystemClock},
    models::exam::{ExamDefinition, ExamType},
    repository::MemorySessionRepository,
    routes,
    state::AppState,
    utils::jwt::sign_jwt,
};
use serde_json::{Value, json};

const JWT_SECRET: &str = "test_secret_for_integration_tests";
const TYT_EXAM: i64 = 101;
const KPSS_EXAM: i64 = 102;

struct TestApp {
    address: String,
    client: reqwest::Client,
}

impl TestApp {
    fn token(&self, user_id: i64) -> String {
        sign_jwt(user_id, "user", JWT_SECRET, 600).expect("Failed to sign token")
    }

    async fn post(&self, user_id: i64, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .bearer_auth(self.token(user_id))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    async fn get(&self, user_id: i64, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .bearer_auth(self.token(user_id))
            .send()
            .await
            .expect("Failed to execute request")
    }

    async fn start(&self, user_id: i64, exam_id: i64) -> String {
        let response = self
            .post(user_id, &format!("/api/exams/{}/start", exam_id), json!({}))
            .await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.unwrap();
        body["session_id"].as_str().unwrap().to_string()
    }
}

/// Spawns the app on a random port, backed by the in-memory repository.
async fn spawn_app() -> TestApp {
    let repository = Arc::new(MemorySessionRepository::new());
    repository.insert_exam(
        ExamDefinition {
            id: TYT_EXAM,
            title: "TYT Deneme Sınavı".to_string(),
            exam_type: ExamType::YksTyt,
            total_questions: 4,
            duration_minutes: 120,
        },
        HashMap::from([(1, 11), (2, 21), (3, 31), (4, 41)]),
    );
    repository.insert_exam(
        ExamDefinition {
            id: KPSS_EXAM,
            title: "KPSS Genel Kültür".to_string(),
            exam_type: ExamType::Kpss,
            total_questions: 3,
            duration_minutes: 60,
        },
        HashMap::from([(1, 1), (2, 2), (3, 3)]),
    );

    let sessions = Arc::new(ExamSessionService::new(
        repository,
        Arc::new(BroadcastNotifier::new(64)),
        Arc::new(SystemClock),
    ));

    let config = Config {
        database_url: "postgres://unused".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        rust_log: "error".to_string(),
        port: 0,
        sweep_interval_secs: 3600,
        stale_session_hours: 24,
    };

    let app = routes::create_router(AppState { config, sessions });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        address,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn health_check_404() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(format!("{}/random_path_that_does_not_exist", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn session_routes_require_a_token() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(format!("{}/api/exams/{}/start", app.address, TYT_EXAM))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .get(format!("{}/api/sessions/active", app.address))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn start_exam_returns_deadline_and_remaining_time() {
    let app = spawn_app().await;

    let response = app
        .post(1, &format!("/api/exams/{}/start", TYT_EXAM), json!({}))
        .await;

    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["exam_id"], TYT_EXAM);
    assert_eq!(body["duration_minutes"], 120);
    let remaining = body["remaining_seconds"].as_i64().unwrap();
    assert!(remaining > 119 * 60 && remaining <= 120 * 60);

    let active: Value = app.get(1, "/api/sessions/active").await.json().await.unwrap();
    assert_eq!(active.as_array().unwrap().len(), 1);
    assert_eq!(active[0]["status"], "IN_PROGRESS");
    assert_eq!(active[0]["is_active"], true);
    assert!(active[0].get("answers").is_none());
}

#[tokio::test]
async fn starting_an_unknown_exam_is_404() {
    let app = spawn_app().await;

    let response = app.post(1, "/api/exams/9999/start", json!({})).await;

    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("9999"));
}

#[tokio::test]
async fn starting_the_same_exam_twice_conflicts() {
    let app = spawn_app().await;
    app.start(3, KPSS_EXAM).await;

    let response = app
        .post(3, &format!("/api/exams/{}/start", KPSS_EXAM), json!({}))
        .await;

    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn other_users_cannot_touch_a_session() {
    let app = spawn_app().await;
    let session_id = app.start(1, TYT_EXAM).await;

    let answer = app
        .post(
            2,
            &format!("/api/sessions/{}/answers", session_id),
            json!({ "question_id": 1, "option_id": 11, "time_spent_secs": 5 }),
        )
        .await;
    assert_eq!(answer.status().as_u16(), 403);

    let remaining = app
        .get(2, &format!("/api/sessions/{}/remaining", session_id))
        .await;
    assert_eq!(remaining.status().as_u16(), 403);
}

#[tokio::test]
async fn answers_are_scored_on_submit() {
    let app = spawn_app().await;
    let session_id = app.start(5, TYT_EXAM).await;

    for (question_id, option_id) in [(1, 11), (2, 21), (3, 99)] {
        let response = app
            .post(
                5,
                &format!("/api/sessions/{}/answers", session_id),
                json!({ "question_id": question_id, "option_id": option_id, "time_spent_secs": 30 }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 200);
    }

    let response = app
        .post(
            5,
            &format!("/api/sessions/{}/submit", session_id),
            json!({ "answers": [{ "question_id": 4, "option_id": 41, "time_spent_secs": 12 }] }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let result: Value = response.json().await.unwrap();
    assert_eq!(result["correct"], 3);
    assert_eq!(result["wrong"], 1);
    assert_eq!(result["empty"], 0);
    assert_eq!(result["score"], 2.75);
    assert_eq!(result["total_questions"], 4);
    let details = result["details"].as_array().unwrap();
    assert_eq!(details.len(), 4);
    assert_eq!(details[2]["question_id"], 3);
    assert_eq!(details[2]["option_id"], 99);
    assert_eq!(details[2]["is_correct"], false);
    assert_eq!(details[3]["is_correct"], true);

    let view: Value = app
        .get(5, &format!("/api/sessions/{}", session_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(view["status"], "SUBMITTED");
    assert_eq!(view["remaining_seconds"], 0);
    assert_eq!(view["auto_submitted"], false);
    assert_eq!(view["answers"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn answering_after_submit_conflicts() {
    let app = spawn_app().await;
    let session_id = app.start(6, KPSS_EXAM).await;
    let response = app
        .post(6, &format!("/api/sessions/{}/submit", session_id), json!({}))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = app
        .post(
            6,
            &format!("/api/sessions/{}/answers", session_id),
            json!({ "question_id": 1, "option_id": 1 }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 409);

    let response = app
        .post(6, &format!("/api/sessions/{}/submit", session_id), json!({}))
        .await;
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let app = spawn_app().await;
    let session_id = app.start(7, TYT_EXAM).await;

    let first: Value = app
        .post(7, &format!("/api/sessions/{}/pause", session_id), json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["paused"], true);

    let second: Value = app
        .post(7, &format!("/api/sessions/{}/pause", session_id), json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(second["paused"], false);
    assert_eq!(second["remaining_seconds"], first["remaining_seconds"]);

    let answer = app
        .post(
            7,
            &format!("/api/sessions/{}/answers", session_id),
            json!({ "question_id": 1, "option_id": 11 }),
        )
        .await;
    assert_eq!(answer.status().as_u16(), 409);

    let resumed: Value = app
        .post(7, &format!("/api/sessions/{}/resume", session_id), json!({}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(resumed["resumed"], true);
    assert!(resumed["remaining_seconds"].as_i64().unwrap() > 119 * 60);
}

#[tokio::test]
async fn invalid_answer_payload_is_rejected() {
    let app = spawn_app().await;
    let session_id = app.start(8, TYT_EXAM).await;

    let response = app
        .post(
            8,
            &format!("/api/sessions/{}/answers", session_id),
            json!({ "question_id": 1, "option_id": 11, "time_spent_secs": -3 }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn cancelled_sessions_report_zero_remaining() {
    let app = spawn_app().await;
    let session_id = app.start(9, KPSS_EXAM).await;

    let response = app
        .post(9, &format!("/api/sessions/{}/cancel", session_id), json!({}))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let remaining: Value = app
        .get(9, &format!("/api/sessions/{}/remaining", session_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(remaining["remaining_seconds"], 0);

    let unknown = app
        .get(9, &format!("/api/sessions/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(unknown.status().as_u16(), 404);
}
