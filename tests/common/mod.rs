#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use risk_lms::config::Config;
use risk_lms::issuer::{ArtifactError, ArtifactRenderer, CertificateDocument, Issuer};
use risk_lms::models::*;
use risk_lms::store::{MemStore, Store};
use risk_lms::{router, AppState};

pub const PDF: &[u8] = b"%PDF-1.4 stub";

/// Renders fixed bytes instead of calling the render service.
pub struct StubRenderer;

#[async_trait]
impl ArtifactRenderer for StubRenderer {
    async fn render_qr(&self, _payload: &str) -> Result<Vec<u8>, ArtifactError> {
        Ok(b"png".to_vec())
    }

    async fn render_document(&self, _doc: &CertificateDocument) -> Result<Vec<u8>, ArtifactError> {
        Ok(PDF.to_vec())
    }
}

pub struct TestApp {
    pub app: Router,
    pub store: Arc<MemStore>,
    pub admin: User,
    pub banker: User,
}

/// Correct and incorrect option ids per question.
pub type AnswerKey = HashMap<Uuid, (Uuid, Uuid)>;

impl TestApp {
    pub async fn new() -> Self {
        Self::with_renderer(Arc::new(StubRenderer)).await
    }

    pub async fn with_renderer(renderer: Arc<dyn ArtifactRenderer>) -> Self {
        let store = Arc::new(MemStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let config = Config::default();
        let issuer = Arc::new(Issuer::new(dyn_store.clone(), renderer, &config));
        let app = router(AppState { store: dyn_store, issuer, config: Arc::new(config) });

        let admin = seed_user(&store, Role::Admin, "Risk Management").await;
        let banker = seed_user(&store, Role::Banker, "Retail Banking").await;
        TestApp { app, store, admin, banker }
    }

    pub async fn user(&self, role: Role, department: &str) -> User {
        seed_user(&self.store, role, department).await
    }

    pub async fn course(&self, videos: usize, passing_score: i32) -> (Course, Vec<ContentUnit>) {
        let course = Course {
            id: Uuid::new_v4(),
            title: "Anti-Money Laundering".into(),
            description: String::new(),
            created_by: Some(self.admin.id),
            is_published: true,
            passing_score,
            target_departments: vec![],
            completion_time_limit_days: Some(30),
            created_at: Utc::now(),
        };
        self.store.insert_course(&course).await.unwrap();
        let mut units = Vec::new();
        for i in 0..videos {
            let unit = ContentUnit {
                id: Uuid::new_v4(),
                course_id: course.id,
                title: format!("Video {}", i + 1),
                order_index: i as i32,
                kind: UnitKind::Video { duration_secs: 100 },
                created_at: Utc::now(),
            };
            self.store.insert_unit(&unit).await.unwrap();
            units.push(unit);
        }
        (course, units)
    }

    pub async fn module(&self, course: &Course, total_slides: i32) -> ContentUnit {
        let unit = ContentUnit {
            id: Uuid::new_v4(),
            course_id: course.id,
            title: "Interactive module".into(),
            order_index: 99,
            kind: UnitKind::Interactive { total_slides, passing_score: 80 },
            created_at: Utc::now(),
        };
        self.store.insert_unit(&unit).await.unwrap();
        unit
    }

    /// Single-answer questions with one right and one wrong option.
    pub async fn questions(&self, scope: Scope, n: usize) -> AnswerKey {
        let mut key = AnswerKey::new();
        for i in 0..n {
            let (right, wrong) = (Uuid::new_v4(), Uuid::new_v4());
            let q = Question {
                id: Uuid::new_v4(),
                scope,
                text: format!("Question {i}"),
                kind: QuestionKind::MultipleChoice,
                topic: "aml".into(),
                difficulty: "medium".into(),
                points: 1,
                explanation: String::new(),
                options: vec![
                    QuestionOption { id: right, text: "right".into(), is_correct: true, order_index: 1 },
                    QuestionOption { id: wrong, text: "wrong".into(), is_correct: false, order_index: 2 },
                ],
                created_at: Utc::now(),
            };
            self.store.insert_question(&q).await.unwrap();
            key.insert(q.id, (right, wrong));
        }
        key
    }

    pub async fn raw(&self, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, bytes.to_vec())
    }

    pub async fn call(&self, method: Method, uri: &str, user: Option<&User>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(u) = user {
            req = req.header("x-user-id", u.id.to_string());
        }
        let req = match body {
            Some(json) => req
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let (status, _, bytes) = self.raw(req).await;
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    pub async fn get(&self, uri: &str, user: &User) -> (StatusCode, Value) {
        self.call(Method::GET, uri, Some(user), None).await
    }

    pub async fn post(&self, uri: &str, user: &User, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, Some(user), Some(body)).await
    }

    pub async fn enroll(&self, user: &User, course: &Course) {
        let (status, _) = self.call(Method::POST, &format!("/api/courses/{}/enroll", course.id), Some(user), None).await;
        assert!(status.is_success(), "enroll failed: {status}");
    }

    pub async fn watch(&self, user: &User, unit: &ContentUnit, secs: i32) -> (StatusCode, Value) {
        self.post(
            &format!("/api/units/{}/progress", unit.id),
            user,
            serde_json::json!({ "watched_duration": secs, "last_position": secs }),
        )
        .await
    }

    pub async fn start(&self, user: &User, path: &str) -> (StatusCode, Value) {
        self.call(Method::POST, path, Some(user), None).await
    }

    /// Answers the first `correct` questions right and the rest wrong.
    pub async fn submit(&self, user: &User, attempt: &Value, key: &AnswerKey, correct: usize) -> (StatusCode, Value) {
        let ids: Vec<Uuid> = serde_json::from_value(attempt["question_ids"].clone()).unwrap();
        let form: Vec<String> = ids
            .iter()
            .enumerate()
            .map(|(i, qid)| {
                let (right, wrong) = key[qid];
                let pick = if i < correct { right } else { wrong };
                format!("question_{qid}={pick}")
            })
            .collect();
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/attempts/{}/submit", attempt["id"].as_str().unwrap()))
            .header("x-user-id", user.id.to_string())
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form.join("&")))
            .unwrap();
        let (status, _, bytes) = self.raw(req).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

async fn seed_user(store: &MemStore, role: Role, department: &str) -> User {
    let id = Uuid::new_v4();
    let user = User {
        id,
        username: format!("user-{id}"),
        email: format!("{id}@bank.example"),
        full_name: format!("Learner {}", &id.to_string()[..8]),
        role,
        department: department.into(),
        is_superuser: false,
        created_at: Utc::now(),
    };
    store.insert_user(&user).await.unwrap();
    user
}
