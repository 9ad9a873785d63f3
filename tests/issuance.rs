mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use common::StubRenderer;
use risk_lms::config::Config;
use risk_lms::error::LmsError;
use risk_lms::issuer::{ArtifactRenderer, DisabledRenderer, Issuer};
use risk_lms::models::*;
use risk_lms::quiz::{self, Answers};
use risk_lms::store::{MemStore, Store, StoreError, StoreResult};

/// Delegates to a [`MemStore`]. Can fail enrollment completion on demand and
/// yield after reads so that two joined futures interleave at the points
/// where concurrent requests race.
struct ScriptedStore {
    inner: MemStore,
    fail_enrollment_completion: AtomicBool,
    interleave: bool,
}

impl ScriptedStore {
    fn new(interleave: bool) -> Self {
        Self { inner: MemStore::new(), fail_enrollment_completion: AtomicBool::new(false), interleave }
    }

    async fn pause(&self) {
        if self.interleave {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        self.inner.insert_user(user).await
    }
    async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.inner.get_user(id).await
    }
    async fn list_users_by_role(&self, role: Role) -> StoreResult<Vec<User>> {
        self.inner.list_users_by_role(role).await
    }
    async fn insert_course(&self, course: &Course) -> StoreResult<()> {
        self.inner.insert_course(course).await
    }
    async fn get_course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        self.inner.get_course(id).await
    }
    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        self.inner.list_courses().await
    }
    async fn insert_unit(&self, unit: &ContentUnit) -> StoreResult<()> {
        self.inner.insert_unit(unit).await
    }
    async fn get_unit(&self, id: Uuid) -> StoreResult<Option<ContentUnit>> {
        self.inner.get_unit(id).await
    }
    async fn list_units(&self, course_id: Uuid) -> StoreResult<Vec<ContentUnit>> {
        self.inner.list_units(course_id).await
    }
    async fn get_progress(&self, user_id: Uuid, unit_id: Uuid) -> StoreResult<Option<ProgressRecord>> {
        self.inner.get_progress(user_id, unit_id).await
    }
    async fn list_progress(&self, user_id: Uuid, unit_ids: &[Uuid]) -> StoreResult<Vec<ProgressRecord>> {
        self.inner.list_progress(user_id, unit_ids).await
    }
    async fn save_progress(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord> {
        self.inner.save_progress(record).await
    }
    async fn insert_question(&self, question: &Question) -> StoreResult<()> {
        self.inner.insert_question(question).await
    }
    async fn update_question(&self, question: &Question) -> StoreResult<bool> {
        self.inner.update_question(question).await
    }
    async fn delete_question(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete_question(id).await
    }
    async fn list_question_ids(&self, scope: Scope) -> StoreResult<Vec<Uuid>> {
        self.inner.list_question_ids(scope).await
    }
    async fn get_questions(&self, ids: &[Uuid]) -> StoreResult<Vec<Question>> {
        self.inner.get_questions(ids).await
    }
    async fn insert_attempt(&self, attempt: &QuizAttempt) -> StoreResult<()> {
        self.inner.insert_attempt(attempt).await
    }
    async fn get_attempt(&self, id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        let attempt = self.inner.get_attempt(id).await;
        self.pause().await;
        attempt
    }
    async fn complete_attempt(&self, id: Uuid, completion: &AttemptCompletion) -> StoreResult<bool> {
        self.inner.complete_attempt(id, completion).await
    }
    async fn list_answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>> {
        self.inner.list_answers(attempt_id).await
    }
    async fn list_completed_attempts(&self, user_id: Uuid, scope: Scope) -> StoreResult<Vec<QuizAttempt>> {
        self.inner.list_completed_attempts(user_id, scope).await
    }
    async fn insert_certificate(&self, cert: &Certificate) -> StoreResult<()> {
        self.inner.insert_certificate(cert).await
    }
    async fn find_certificate(&self, user_id: Uuid, scope: CertificateScope) -> StoreResult<Option<Certificate>> {
        let found = self.inner.find_certificate(user_id, scope).await;
        self.pause().await;
        found
    }
    async fn get_certificate(&self, id: Uuid) -> StoreResult<Option<Certificate>> {
        self.inner.get_certificate(id).await
    }
    async fn find_certificate_by_number(&self, number: &str) -> StoreResult<Option<Certificate>> {
        self.inner.find_certificate_by_number(number).await
    }
    async fn list_certificates(&self, user_id: Uuid) -> StoreResult<Vec<Certificate>> {
        self.inner.list_certificates(user_id).await
    }
    async fn save_certificate_artifacts(
        &self,
        id: Uuid,
        qr_code: Option<&[u8]>,
        document: Option<&[u8]>,
    ) -> StoreResult<()> {
        self.inner.save_certificate_artifacts(id, qr_code, document).await
    }
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<(Enrollment, bool)> {
        self.inner.insert_enrollment(enrollment).await
    }
    async fn get_enrollment(&self, user_id: Uuid, course_id: Uuid) -> StoreResult<Option<Enrollment>> {
        self.inner.get_enrollment(user_id, course_id).await
    }
    async fn list_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        self.inner.list_enrollments(user_id).await
    }
    async fn list_course_enrollments(&self, course_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        self.inner.list_course_enrollments(course_id).await
    }
    async fn mark_enrollment_completed(&self, user_id: Uuid, course_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        if self.fail_enrollment_completion.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(sqlx::Error::PoolTimedOut));
        }
        self.inner.mark_enrollment_completed(user_id, course_id, at).await
    }
}

struct Fixture {
    store: Arc<ScriptedStore>,
    issuer: Issuer,
    learner: Uuid,
    course: Uuid,
    /// Correct option per question.
    key: HashMap<Uuid, Uuid>,
}

impl Fixture {
    async fn new(interleave: bool, renderer: Arc<dyn ArtifactRenderer>) -> Self {
        let store = Arc::new(ScriptedStore::new(interleave));
        let dyn_store: Arc<dyn Store> = store.clone();
        let issuer = Issuer::new(dyn_store, renderer, &Config::default());

        let learner = Uuid::new_v4();
        store
            .insert_user(&User {
                id: learner,
                username: "amina".into(),
                email: "amina@bank.example".into(),
                full_name: "Amina Mushi".into(),
                role: Role::Banker,
                department: "Retail Banking".into(),
                is_superuser: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        // no content units, so the quiz is open as soon as the learner enrolls
        let course = Uuid::new_v4();
        store
            .insert_course(&Course {
                id: course,
                title: "Fraud Awareness".into(),
                description: String::new(),
                created_by: None,
                is_published: true,
                passing_score: 80,
                target_departments: vec![],
                completion_time_limit_days: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        risk_lms::enrollment::enroll(store.as_ref(), learner, course).await.unwrap();

        let mut key = HashMap::new();
        for i in 0..5 {
            let (right, wrong) = (Uuid::new_v4(), Uuid::new_v4());
            let q = Question {
                id: Uuid::new_v4(),
                scope: Scope::Course(course),
                text: format!("Question {i}"),
                kind: QuestionKind::MultipleChoice,
                topic: "fraud".into(),
                difficulty: "medium".into(),
                points: 1,
                explanation: String::new(),
                options: vec![
                    QuestionOption { id: right, text: "right".into(), is_correct: true, order_index: 1 },
                    QuestionOption { id: wrong, text: "wrong".into(), is_correct: false, order_index: 2 },
                ],
                created_at: Utc::now(),
            };
            store.insert_question(&q).await.unwrap();
            key.insert(q.id, right);
        }

        Fixture { store, issuer, learner, course, key }
    }

    fn all_right(&self) -> Answers {
        self.key.iter().map(|(q, o)| (*q, HashSet::from([*o]))).collect()
    }

    async fn enrollment(&self) -> Enrollment {
        self.store.get_enrollment(self.learner, self.course).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn concurrent_submits_complete_the_attempt_once() {
    let fx = Fixture::new(true, Arc::new(StubRenderer)).await;
    let attempt = quiz::start_attempt(fx.store.as_ref(), fx.learner, Scope::Course(fx.course)).await.unwrap();
    let answers = fx.all_right();

    let (a, b) = tokio::join!(
        quiz::submit_attempt(fx.store.as_ref(), &fx.issuer, fx.learner, attempt.id, &answers),
        quiz::submit_attempt(fx.store.as_ref(), &fx.issuer, fx.learner, attempt.id, &answers),
    );

    let (winner, loser) = match (a, b) {
        (Ok(w), Err(l)) | (Err(l), Ok(w)) => (w, l),
        (a, b) => panic!("expected exactly one success, got {a:?} and {b:?}"),
    };
    assert!(matches!(loser, LmsError::AlreadyCompleted), "{loser:?}");
    assert!(winner.attempt.passed);
    assert!(winner.certificate.is_some());

    let completed = fx.store.list_completed_attempts(fx.learner, Scope::Course(fx.course)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(fx.store.list_answers(attempt.id).await.unwrap().len(), 5);
    assert_eq!(fx.store.list_certificates(fx.learner).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_issue_yields_one_certificate() {
    let fx = Fixture::new(true, Arc::new(StubRenderer)).await;
    let scope = CertificateScope::Course(fx.course);

    let (a, b) = tokio::join!(
        fx.issuer.issue(fx.learner, scope, 90.0),
        fx.issuer.issue(fx.learner, scope, 90.0),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.certificate.certificate_number, b.certificate.certificate_number);
    assert_eq!([a.created, b.created].iter().filter(|c| **c).count(), 1);
    assert_eq!(fx.store.list_certificates(fx.learner).await.unwrap().len(), 1);
    assert!(fx.enrollment().await.completed_at.is_some());
}

#[tokio::test]
async fn enrollment_failure_after_insert_keeps_the_certificate() {
    let fx = Fixture::new(false, Arc::new(StubRenderer)).await;
    fx.store.fail_enrollment_completion.store(true, Ordering::SeqCst);

    let attempt = quiz::start_attempt(fx.store.as_ref(), fx.learner, Scope::Course(fx.course)).await.unwrap();
    let outcome = quiz::submit_attempt(fx.store.as_ref(), &fx.issuer, fx.learner, attempt.id, &fx.all_right())
        .await
        .unwrap();

    let issued = outcome.certificate.expect("certificate issued despite the enrollment error");
    let notice = outcome.notice.unwrap();
    assert!(notice.contains("enrollment"), "{notice}");
    assert!(!notice.contains("not issued"), "{notice}");
    assert!(issued.document.is_some());
    assert!(fx.enrollment().await.completed_at.is_none());

    // the next issue call for the same scope repairs the enrollment
    fx.store.fail_enrollment_completion.store(false, Ordering::SeqCst);
    let again = fx.issuer.issue(fx.learner, CertificateScope::Course(fx.course), 100.0).await.unwrap();
    assert!(!again.created);
    assert!(again.artifact_error.is_none());
    assert_eq!(again.certificate.certificate_number, issued.certificate_number);
    assert_eq!(fx.enrollment().await.completed_at, Some(issued.issued_at));
}

#[tokio::test]
async fn existing_certificate_reports_missing_artifacts() {
    let fx = Fixture::new(false, Arc::new(DisabledRenderer)).await;
    let scope = CertificateScope::Course(fx.course);

    let first = fx.issuer.issue(fx.learner, scope, 90.0).await.unwrap();
    assert!(first.created);
    assert!(first.artifact_error.is_some());

    let second = fx.issuer.issue(fx.learner, scope, 90.0).await.unwrap();
    assert!(!second.created);
    assert!(!second.certificate.has_artifacts());
    let message = second.artifact_error.expect("missing artifacts are reported on every issue call");
    assert!(message.contains("render service not configured"), "{message}");
}
