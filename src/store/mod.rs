//! Persistence collaborator.
//!
//! Every user-facing action is one short transactional operation against a
//! [`Store`]. Invariants the service cannot enforce alone (monotonic progress,
//! single completion of an attempt, one certificate per user and scope) are
//! pushed down into the store so concurrent requests cannot break them.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::*;

pub mod memory;
pub mod pg;

pub use memory::MemStore;
pub use pg::PgStore;

pub const CERT_USER_SCOPE_KEY: &str = "certificates_user_scope_key";
pub const CERT_NUMBER_KEY: &str = "certificates_certificate_number_key";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unique constraint {constraint} violated")]
    Duplicate { constraint: String },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_duplicate_of(&self, name: &str) -> bool {
        matches!(self, StoreError::Duplicate { constraint } if constraint == name)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // users
    async fn insert_user(&self, user: &User) -> StoreResult<()>;
    async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn list_users_by_role(&self, role: Role) -> StoreResult<Vec<User>>;

    // courses and content
    async fn insert_course(&self, course: &Course) -> StoreResult<()>;
    async fn get_course(&self, id: Uuid) -> StoreResult<Option<Course>>;
    /// Every course, oldest first.
    async fn list_courses(&self) -> StoreResult<Vec<Course>>;
    async fn insert_unit(&self, unit: &ContentUnit) -> StoreResult<()>;
    async fn get_unit(&self, id: Uuid) -> StoreResult<Option<ContentUnit>>;
    /// Units of a course ordered by `order_index`.
    async fn list_units(&self, course_id: Uuid) -> StoreResult<Vec<ContentUnit>>;

    // progress ledger
    async fn get_progress(&self, user_id: Uuid, unit_id: Uuid)
        -> StoreResult<Option<ProgressRecord>>;
    async fn list_progress(&self, user_id: Uuid, unit_ids: &[Uuid])
        -> StoreResult<Vec<ProgressRecord>>;
    /// Upserts a record, merging with what is stored: counters keep the
    /// larger value and an existing completion timestamp is never replaced.
    /// Returns the merged record.
    async fn save_progress(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord>;

    // question bank
    async fn insert_question(&self, question: &Question) -> StoreResult<()>;
    /// Replaces the question's fields and its whole option list. Scope and
    /// creation time are kept. `false` when the question does not exist.
    async fn update_question(&self, question: &Question) -> StoreResult<bool>;
    async fn delete_question(&self, id: Uuid) -> StoreResult<bool>;
    /// Question ids of a scope in bank order (topic, then creation time).
    async fn list_question_ids(&self, scope: Scope) -> StoreResult<Vec<Uuid>>;
    /// Questions with options; missing ids are skipped, order is unspecified.
    async fn get_questions(&self, ids: &[Uuid]) -> StoreResult<Vec<Question>>;

    // attempts
    async fn insert_attempt(&self, attempt: &QuizAttempt) -> StoreResult<()>;
    async fn get_attempt(&self, id: Uuid) -> StoreResult<Option<QuizAttempt>>;
    /// Writes the grade and answers only if the attempt is still open.
    /// Returns `false` when another call completed it first.
    async fn complete_attempt(&self, id: Uuid, completion: &AttemptCompletion)
        -> StoreResult<bool>;
    async fn list_answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>>;
    async fn list_completed_attempts(&self, user_id: Uuid, scope: Scope)
        -> StoreResult<Vec<QuizAttempt>>;

    // certificates
    /// Fails with [`StoreError::Duplicate`] naming [`CERT_USER_SCOPE_KEY`] or
    /// [`CERT_NUMBER_KEY`].
    async fn insert_certificate(&self, cert: &Certificate) -> StoreResult<()>;
    async fn find_certificate(&self, user_id: Uuid, scope: CertificateScope)
        -> StoreResult<Option<Certificate>>;
    async fn get_certificate(&self, id: Uuid) -> StoreResult<Option<Certificate>>;
    async fn find_certificate_by_number(&self, number: &str) -> StoreResult<Option<Certificate>>;
    async fn list_certificates(&self, user_id: Uuid) -> StoreResult<Vec<Certificate>>;
    /// Fills artifact columns that are still empty.
    async fn save_certificate_artifacts(
        &self,
        id: Uuid,
        qr_code: Option<&[u8]>,
        document: Option<&[u8]>,
    ) -> StoreResult<()>;

    // enrollments
    /// Inserts unless the (user, course) pair exists; returns the stored row
    /// and whether it was created.
    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<(Enrollment, bool)>;
    async fn get_enrollment(&self, user_id: Uuid, course_id: Uuid)
        -> StoreResult<Option<Enrollment>>;
    async fn list_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>>;
    async fn list_course_enrollments(&self, course_id: Uuid) -> StoreResult<Vec<Enrollment>>;
    async fn mark_enrollment_completed(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<()>;
}

/// Merge rule shared by every store implementation.
pub fn merge_progress(stored: &ProgressRecord, incoming: &ProgressRecord) -> ProgressRecord {
    ProgressRecord {
        id: stored.id,
        user_id: stored.user_id,
        unit_id: stored.unit_id,
        watched_secs: stored.watched_secs.max(incoming.watched_secs),
        last_position: incoming.last_position,
        highest_slide: stored.highest_slide.max(incoming.highest_slide),
        completed_at: stored.completed_at.or(incoming.completed_at),
        created_at: stored.created_at,
        updated_at: incoming.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn merge_never_regresses() {
        let now = Utc::now();
        let mut stored = ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), now);
        stored.watched_secs = 90;
        stored.highest_slide = 4;
        stored.completed_at = Some(now);

        let mut incoming = stored.clone();
        incoming.watched_secs = 10;
        incoming.highest_slide = 1;
        incoming.last_position = 5;
        incoming.completed_at = None;
        incoming.updated_at = now + Duration::seconds(3);

        let merged = merge_progress(&stored, &incoming);
        assert_eq!(merged.watched_secs, 90);
        assert_eq!(merged.highest_slide, 4);
        assert_eq!(merged.last_position, 5);
        assert_eq!(merged.completed_at, Some(now));
        assert_eq!(merged.updated_at, incoming.updated_at);
    }
}
