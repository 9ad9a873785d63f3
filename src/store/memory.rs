use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    merge_progress, Store, StoreError, StoreResult, CERT_NUMBER_KEY, CERT_USER_SCOPE_KEY,
};
use crate::models::*;

/// In-process store used by the test suite and by local runs without
/// `DATABASE_URL`. One lock guards everything, which gives every call the
/// same all-or-nothing behaviour the SQL store gets from transactions.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    courses: HashMap<Uuid, Course>,
    units: HashMap<Uuid, ContentUnit>,
    progress: HashMap<(Uuid, Uuid), ProgressRecord>,
    questions: Vec<Question>,
    attempts: HashMap<Uuid, QuizAttempt>,
    answers: Vec<QuizAnswer>,
    certificates: Vec<Certificate>,
    enrollments: Vec<Enrollment>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        self.inner.lock().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn list_users_by_role(&self, role: Role) -> StoreResult<Vec<User>> {
        let t = self.inner.lock().await;
        let mut users: Vec<User> = t.users.values().filter(|u| u.role == role).cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn insert_course(&self, course: &Course) -> StoreResult<()> {
        self.inner.lock().await.courses.insert(course.id, course.clone());
        Ok(())
    }

    async fn get_course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        Ok(self.inner.lock().await.courses.get(&id).cloned())
    }

    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        let t = self.inner.lock().await;
        let mut courses: Vec<Course> = t.courses.values().cloned().collect();
        courses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.title.cmp(&b.title)));
        Ok(courses)
    }

    async fn insert_unit(&self, unit: &ContentUnit) -> StoreResult<()> {
        self.inner.lock().await.units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn get_unit(&self, id: Uuid) -> StoreResult<Option<ContentUnit>> {
        Ok(self.inner.lock().await.units.get(&id).cloned())
    }

    async fn list_units(&self, course_id: Uuid) -> StoreResult<Vec<ContentUnit>> {
        let t = self.inner.lock().await;
        let mut units: Vec<ContentUnit> =
            t.units.values().filter(|u| u.course_id == course_id).cloned().collect();
        units.sort_by_key(|u| (u.order_index, u.created_at));
        Ok(units)
    }

    async fn get_progress(
        &self,
        user_id: Uuid,
        unit_id: Uuid,
    ) -> StoreResult<Option<ProgressRecord>> {
        Ok(self.inner.lock().await.progress.get(&(user_id, unit_id)).cloned())
    }

    async fn list_progress(
        &self,
        user_id: Uuid,
        unit_ids: &[Uuid],
    ) -> StoreResult<Vec<ProgressRecord>> {
        let t = self.inner.lock().await;
        Ok(unit_ids
            .iter()
            .filter_map(|unit_id| t.progress.get(&(user_id, *unit_id)).cloned())
            .collect())
    }

    async fn save_progress(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord> {
        let mut t = self.inner.lock().await;
        let key = (record.user_id, record.unit_id);
        let merged = match t.progress.get(&key) {
            Some(stored) => merge_progress(stored, record),
            None => record.clone(),
        };
        t.progress.insert(key, merged.clone());
        Ok(merged)
    }

    async fn insert_question(&self, question: &Question) -> StoreResult<()> {
        self.inner.lock().await.questions.push(question.clone());
        Ok(())
    }

    async fn update_question(&self, question: &Question) -> StoreResult<bool> {
        let mut t = self.inner.lock().await;
        let Some(stored) = t.questions.iter_mut().find(|q| q.id == question.id) else {
            return Ok(false);
        };
        *stored = Question { scope: stored.scope, created_at: stored.created_at, ..question.clone() };
        Ok(true)
    }

    async fn delete_question(&self, id: Uuid) -> StoreResult<bool> {
        let mut t = self.inner.lock().await;
        let before = t.questions.len();
        t.questions.retain(|q| q.id != id);
        let deleted = t.questions.len() != before;
        if deleted {
            for answer in t.answers.iter_mut().filter(|a| a.question_id == Some(id)) {
                answer.question_id = None;
            }
        }
        Ok(deleted)
    }

    async fn list_question_ids(&self, scope: Scope) -> StoreResult<Vec<Uuid>> {
        let t = self.inner.lock().await;
        let mut bank: Vec<&Question> = t.questions.iter().filter(|q| q.scope == scope).collect();
        bank.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.created_at.cmp(&b.created_at)));
        Ok(bank.into_iter().map(|q| q.id).collect())
    }

    async fn get_questions(&self, ids: &[Uuid]) -> StoreResult<Vec<Question>> {
        let t = self.inner.lock().await;
        Ok(t.questions.iter().filter(|q| ids.contains(&q.id)).cloned().collect())
    }

    async fn insert_attempt(&self, attempt: &QuizAttempt) -> StoreResult<()> {
        self.inner.lock().await.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        Ok(self.inner.lock().await.attempts.get(&id).cloned())
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        completion: &AttemptCompletion,
    ) -> StoreResult<bool> {
        let mut t = self.inner.lock().await;
        let Some(attempt) = t.attempts.get_mut(&id) else {
            return Ok(false);
        };
        if attempt.completed_at.is_some() {
            return Ok(false);
        }
        attempt.correct_answers = completion.correct_answers;
        attempt.score = Some(completion.score);
        attempt.passed = completion.passed;
        attempt.completed_at = Some(completion.completed_at);
        t.answers.extend(completion.answers.iter().cloned());
        Ok(true)
    }

    async fn list_answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>> {
        let t = self.inner.lock().await;
        Ok(t.answers.iter().filter(|a| a.attempt_id == attempt_id).cloned().collect())
    }

    async fn list_completed_attempts(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> StoreResult<Vec<QuizAttempt>> {
        let t = self.inner.lock().await;
        let mut attempts: Vec<QuizAttempt> = t
            .attempts
            .values()
            .filter(|a| a.user_id == user_id && a.scope == scope && a.completed_at.is_some())
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(attempts)
    }

    async fn insert_certificate(&self, cert: &Certificate) -> StoreResult<()> {
        let mut t = self.inner.lock().await;
        if t.certificates.iter().any(|c| c.user_id == cert.user_id && c.scope == cert.scope) {
            return Err(StoreError::Duplicate { constraint: CERT_USER_SCOPE_KEY.into() });
        }
        if t.certificates.iter().any(|c| c.certificate_number == cert.certificate_number) {
            return Err(StoreError::Duplicate { constraint: CERT_NUMBER_KEY.into() });
        }
        t.certificates.push(cert.clone());
        Ok(())
    }

    async fn find_certificate(
        &self,
        user_id: Uuid,
        scope: CertificateScope,
    ) -> StoreResult<Option<Certificate>> {
        let t = self.inner.lock().await;
        Ok(t.certificates.iter().find(|c| c.user_id == user_id && c.scope == scope).cloned())
    }

    async fn get_certificate(&self, id: Uuid) -> StoreResult<Option<Certificate>> {
        let t = self.inner.lock().await;
        Ok(t.certificates.iter().find(|c| c.id == id).cloned())
    }

    async fn find_certificate_by_number(&self, number: &str) -> StoreResult<Option<Certificate>> {
        let t = self.inner.lock().await;
        Ok(t.certificates.iter().find(|c| c.certificate_number == number).cloned())
    }

    async fn list_certificates(&self, user_id: Uuid) -> StoreResult<Vec<Certificate>> {
        let t = self.inner.lock().await;
        let mut certs: Vec<Certificate> =
            t.certificates.iter().filter(|c| c.user_id == user_id).cloned().collect();
        certs.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(certs)
    }

    async fn save_certificate_artifacts(
        &self,
        id: Uuid,
        qr_code: Option<&[u8]>,
        document: Option<&[u8]>,
    ) -> StoreResult<()> {
        let mut t = self.inner.lock().await;
        if let Some(cert) = t.certificates.iter_mut().find(|c| c.id == id) {
            if cert.qr_code.is_none() {
                cert.qr_code = qr_code.map(<[u8]>::to_vec);
            }
            if cert.document.is_none() {
                cert.document = document.map(<[u8]>::to_vec);
            }
        }
        Ok(())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<(Enrollment, bool)> {
        let mut t = self.inner.lock().await;
        if let Some(existing) = t
            .enrollments
            .iter()
            .find(|e| e.user_id == enrollment.user_id && e.course_id == enrollment.course_id)
        {
            return Ok((existing.clone(), false));
        }
        t.enrollments.push(enrollment.clone());
        Ok((enrollment.clone(), true))
    }

    async fn get_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> StoreResult<Option<Enrollment>> {
        let t = self.inner.lock().await;
        Ok(t.enrollments
            .iter()
            .find(|e| e.user_id == user_id && e.course_id == course_id)
            .cloned())
    }

    async fn list_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let t = self.inner.lock().await;
        Ok(t.enrollments.iter().filter(|e| e.user_id == user_id).cloned().collect())
    }

    async fn list_course_enrollments(&self, course_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let t = self.inner.lock().await;
        Ok(t.enrollments.iter().filter(|e| e.course_id == course_id).cloned().collect())
    }

    async fn mark_enrollment_completed(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut t = self.inner.lock().await;
        if let Some(e) = t
            .enrollments
            .iter_mut()
            .find(|e| e.user_id == user_id && e.course_id == course_id)
        {
            e.completed_at.get_or_insert(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(user_id: Uuid) -> QuizAttempt {
        QuizAttempt {
            id: Uuid::new_v4(),
            user_id,
            scope: Scope::Course(Uuid::new_v4()),
            question_ids: vec![],
            total_questions: 0,
            correct_answers: 0,
            score: None,
            passed: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn completion(score: f64) -> AttemptCompletion {
        AttemptCompletion {
            correct_answers: 1,
            score,
            passed: true,
            completed_at: Utc::now(),
            answers: vec![],
        }
    }

    #[tokio::test]
    async fn attempt_completes_once() {
        let store = MemStore::new();
        let a = attempt(Uuid::new_v4());
        store.insert_attempt(&a).await.unwrap();

        assert!(store.complete_attempt(a.id, &completion(90.0)).await.unwrap());
        assert!(!store.complete_attempt(a.id, &completion(10.0)).await.unwrap());

        let stored = store.get_attempt(a.id).await.unwrap().unwrap();
        assert_eq!(stored.score, Some(90.0));
    }

    #[tokio::test]
    async fn enrollment_insert_is_get_or_create() {
        let store = MemStore::new();
        let e = Enrollment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            enrolled_at: Some(Utc::now()),
            deadline: None,
            completed_at: None,
        };
        let (_, created) = store.insert_enrollment(&e).await.unwrap();
        assert!(created);
        let again = Enrollment { id: Uuid::new_v4(), ..e.clone() };
        let (stored, created) = store.insert_enrollment(&again).await.unwrap();
        assert!(!created);
        assert_eq!(stored.id, e.id);
    }
}
