use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::models::*;

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str) -> anyhow::Result<Db> {
    Ok(Pool::<Postgres>::connect(url).await?)
}

pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        // crate-relative path for sqlx migrations
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

/// Unique violations carry the constraint name so callers can tell a lost
/// issuance race from a certificate-number collision.
fn classify(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Duplicate {
                constraint: db.constraint().unwrap_or_default().to_string(),
            };
        }
    }
    StoreError::Backend(e)
}

fn corrupt(table: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt { table, detail: detail.into() }
}

// --- row types ---

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    full_name: String,
    role: String,
    department: String,
    is_superuser: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(r: UserRow) -> StoreResult<User> {
        let role = Role::parse(&r.role).ok_or_else(|| corrupt("users", r.role.clone()))?;
        Ok(User {
            id: r.id,
            username: r.username,
            email: r.email,
            full_name: r.full_name,
            role,
            department: r.department,
            is_superuser: r.is_superuser,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: Uuid,
    title: String,
    description: String,
    created_by: Option<Uuid>,
    is_published: bool,
    passing_score: i32,
    target_departments: Vec<String>,
    completion_time_limit_days: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<CourseRow> for Course {
    fn from(r: CourseRow) -> Course {
        Course {
            id: r.id,
            title: r.title,
            description: r.description,
            created_by: r.created_by,
            is_published: r.is_published,
            passing_score: r.passing_score,
            target_departments: r.target_departments,
            completion_time_limit_days: r.completion_time_limit_days,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    id: Uuid,
    course_id: Uuid,
    kind: String,
    title: String,
    order_index: i32,
    duration_secs: i32,
    total_slides: i32,
    passing_score: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<UnitRow> for ContentUnit {
    type Error = StoreError;

    fn try_from(r: UnitRow) -> StoreResult<ContentUnit> {
        let kind = match r.kind.as_str() {
            "video" => UnitKind::Video { duration_secs: r.duration_secs },
            "interactive" => UnitKind::Interactive {
                total_slides: r.total_slides,
                passing_score: r.passing_score,
            },
            other => return Err(corrupt("content_units", other)),
        };
        Ok(ContentUnit {
            id: r.id,
            course_id: r.course_id,
            title: r.title,
            order_index: r.order_index,
            kind,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    id: Uuid,
    user_id: Uuid,
    unit_id: Uuid,
    watched_secs: i32,
    last_position: i32,
    highest_slide: i32,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProgressRow> for ProgressRecord {
    fn from(r: ProgressRow) -> ProgressRecord {
        ProgressRecord {
            id: r.id,
            user_id: r.user_id,
            unit_id: r.unit_id,
            watched_secs: r.watched_secs,
            last_position: r.last_position,
            highest_slide: r.highest_slide,
            completed_at: r.completed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: Uuid,
    scope_kind: String,
    scope_id: Uuid,
    text: String,
    kind: String,
    topic: String,
    difficulty: String,
    points: i32,
    explanation: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OptionRow {
    id: Uuid,
    question_id: Uuid,
    text: String,
    is_correct: bool,
    order_index: i32,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    user_id: Uuid,
    scope_kind: String,
    scope_id: Uuid,
    question_ids: Vec<Uuid>,
    total_questions: i32,
    correct_answers: i32,
    score: Option<f64>,
    passed: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for QuizAttempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> StoreResult<QuizAttempt> {
        let scope = Scope::from_parts(&r.scope_kind, r.scope_id)
            .ok_or_else(|| corrupt("quiz_attempts", r.scope_kind.clone()))?;
        Ok(QuizAttempt {
            id: r.id,
            user_id: r.user_id,
            scope,
            question_ids: r.question_ids,
            total_questions: r.total_questions,
            correct_answers: r.correct_answers,
            score: r.score,
            passed: r.passed,
            started_at: r.started_at,
            completed_at: r.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    id: Uuid,
    attempt_id: Uuid,
    question_id: Option<Uuid>,
    selected_option_ids: Vec<Uuid>,
    is_correct: bool,
    answered_at: DateTime<Utc>,
}

impl From<AnswerRow> for QuizAnswer {
    fn from(r: AnswerRow) -> QuizAnswer {
        QuizAnswer {
            id: r.id,
            attempt_id: r.attempt_id,
            question_id: r.question_id,
            selected_option_ids: r.selected_option_ids,
            is_correct: r.is_correct,
            answered_at: r.answered_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    user_id: Uuid,
    scope_kind: String,
    scope_id: Option<Uuid>,
    certificate_number: String,
    score: f64,
    verification_url: String,
    qr_code: Option<Vec<u8>>,
    document: Option<Vec<u8>>,
    is_valid: bool,
    issued_at: DateTime<Utc>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = StoreError;

    fn try_from(r: CertificateRow) -> StoreResult<Certificate> {
        let scope = CertificateScope::from_parts(&r.scope_kind, r.scope_id)
            .ok_or_else(|| corrupt("certificates", r.scope_kind.clone()))?;
        Ok(Certificate {
            id: r.id,
            user_id: r.user_id,
            scope,
            certificate_number: r.certificate_number,
            score: r.score,
            verification_url: r.verification_url,
            qr_code: r.qr_code,
            document: r.document,
            is_valid: r.is_valid,
            issued_at: r.issued_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    user_id: Uuid,
    course_id: Uuid,
    enrolled_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<EnrollmentRow> for Enrollment {
    fn from(r: EnrollmentRow) -> Enrollment {
        Enrollment {
            id: r.id,
            user_id: r.user_id,
            course_id: r.course_id,
            enrolled_at: r.enrolled_at,
            deadline: r.deadline,
            completed_at: r.completed_at,
        }
    }
}

fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO users (id, username, email, full_name, role, department, is_superuser, created_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(user.role.as_str())
        .bind(&user.department)
        .bind(user.is_superuser)
        .bind(user.created_at)
        .execute(&self.db)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn list_users_by_role(&self, role: Role) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE role=$1 ORDER BY username")
            .bind(role.as_str())
            .fetch_all(&self.db)
            .await?;
        collect(rows)
    }

    async fn insert_course(&self, course: &Course) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO courses (id, title, description, created_by, is_published, passing_score,
                                   target_departments, completion_time_limit_days, created_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
        )
        .bind(course.id)
        .bind(&course.title)
        .bind(&course.description)
        .bind(course.created_by)
        .bind(course.is_published)
        .bind(course.passing_score)
        .bind(&course.target_departments)
        .bind(course.completion_time_limit_days)
        .bind(course.created_at)
        .execute(&self.db)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn get_course(&self, id: Uuid) -> StoreResult<Option<Course>> {
        Ok(sqlx::query_as::<_, CourseRow>("SELECT * FROM courses WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(Course::from))
    }

    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        let rows = sqlx::query_as::<_, CourseRow>("SELECT * FROM courses ORDER BY created_at, title")
            .fetch_all(&self.db)
            .await?;
        Ok(rows.into_iter().map(Course::from).collect())
    }

    async fn insert_unit(&self, unit: &ContentUnit) -> StoreResult<()> {
        let (kind, duration_secs, total_slides, passing_score) = match unit.kind {
            UnitKind::Video { duration_secs } => ("video", duration_secs, 0, DEFAULT_PASSING_SCORE),
            UnitKind::Interactive { total_slides, passing_score } => {
                ("interactive", 0, total_slides, passing_score)
            }
        };
        sqlx::query(
            r#"INSERT INTO content_units (id, course_id, kind, title, order_index, duration_secs,
                                         total_slides, passing_score, created_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
        )
        .bind(unit.id)
        .bind(unit.course_id)
        .bind(kind)
        .bind(&unit.title)
        .bind(unit.order_index)
        .bind(duration_secs)
        .bind(total_slides)
        .bind(passing_score)
        .bind(unit.created_at)
        .execute(&self.db)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn get_unit(&self, id: Uuid) -> StoreResult<Option<ContentUnit>> {
        sqlx::query_as::<_, UnitRow>("SELECT * FROM content_units WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(ContentUnit::try_from)
            .transpose()
    }

    async fn list_units(&self, course_id: Uuid) -> StoreResult<Vec<ContentUnit>> {
        let rows = sqlx::query_as::<_, UnitRow>(
            "SELECT * FROM content_units WHERE course_id=$1 ORDER BY order_index, created_at",
        )
        .bind(course_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn get_progress(
        &self,
        user_id: Uuid,
        unit_id: Uuid,
    ) -> StoreResult<Option<ProgressRecord>> {
        Ok(sqlx::query_as::<_, ProgressRow>(
            "SELECT * FROM progress_records WHERE user_id=$1 AND unit_id=$2",
        )
        .bind(user_id)
        .bind(unit_id)
        .fetch_optional(&self.db)
        .await?
        .map(ProgressRecord::from))
    }

    async fn list_progress(
        &self,
        user_id: Uuid,
        unit_ids: &[Uuid],
    ) -> StoreResult<Vec<ProgressRecord>> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            "SELECT * FROM progress_records WHERE user_id=$1 AND unit_id = ANY($2)",
        )
        .bind(user_id)
        .bind(unit_ids)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(ProgressRecord::from).collect())
    }

    async fn save_progress(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord> {
        // the merge runs under the row lock taken by ON CONFLICT
        let row = sqlx::query_as::<_, ProgressRow>(
            r#"
            INSERT INTO progress_records (id, user_id, unit_id, watched_secs, last_position,
                                          highest_slide, completed_at, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (user_id, unit_id) DO UPDATE SET
                watched_secs  = GREATEST(progress_records.watched_secs, EXCLUDED.watched_secs),
                last_position = EXCLUDED.last_position,
                highest_slide = GREATEST(progress_records.highest_slide, EXCLUDED.highest_slide),
                completed_at  = COALESCE(progress_records.completed_at, EXCLUDED.completed_at),
                updated_at    = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.unit_id)
        .bind(record.watched_secs)
        .bind(record.last_position)
        .bind(record.highest_slide)
        .bind(record.completed_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.db)
        .await
        .map_err(classify)?;
        Ok(row.into())
    }

    async fn insert_question(&self, question: &Question) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"INSERT INTO questions (id, scope_kind, scope_id, text, kind, topic, difficulty,
                                     points, explanation, created_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)"#,
        )
        .bind(question.id)
        .bind(question.scope.kind())
        .bind(question.scope.id())
        .bind(&question.text)
        .bind(question.kind.as_str())
        .bind(&question.topic)
        .bind(&question.difficulty)
        .bind(question.points)
        .bind(&question.explanation)
        .bind(question.created_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        for opt in &question.options {
            sqlx::query(
                r#"INSERT INTO question_options (id, question_id, text, is_correct, order_index)
                   VALUES ($1,$2,$3,$4,$5)"#,
            )
            .bind(opt.id)
            .bind(question.id)
            .bind(&opt.text)
            .bind(opt.is_correct)
            .bind(opt.order_index)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_question(&self, question: &Question) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let res = sqlx::query(
            r#"UPDATE questions SET text=$2, kind=$3, topic=$4, difficulty=$5, points=$6, explanation=$7
               WHERE id=$1"#,
        )
        .bind(question.id)
        .bind(&question.text)
        .bind(question.kind.as_str())
        .bind(&question.topic)
        .bind(&question.difficulty)
        .bind(question.points)
        .bind(&question.explanation)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM question_options WHERE question_id=$1")
            .bind(question.id)
            .execute(&mut *tx)
            .await?;
        for opt in &question.options {
            sqlx::query(
                r#"INSERT INTO question_options (id, question_id, text, is_correct, order_index)
                   VALUES ($1,$2,$3,$4,$5)"#,
            )
            .bind(opt.id)
            .bind(question.id)
            .bind(&opt.text)
            .bind(opt.is_correct)
            .bind(opt.order_index)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_question(&self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM questions WHERE id=$1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_question_ids(&self, scope: Scope) -> StoreResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM questions WHERE scope_kind=$1 AND scope_id=$2 ORDER BY topic, created_at",
        )
        .bind(scope.kind())
        .bind(scope.id())
        .fetch_all(&self.db)
        .await?)
    }

    async fn get_questions(&self, ids: &[Uuid]) -> StoreResult<Vec<Question>> {
        let rows = sqlx::query_as::<_, QuestionRow>("SELECT * FROM questions WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.db)
            .await?;
        let opts = sqlx::query_as::<_, OptionRow>(
            "SELECT * FROM question_options WHERE question_id = ANY($1) ORDER BY order_index",
        )
        .bind(ids)
        .fetch_all(&self.db)
        .await?;

        let mut by_question: HashMap<Uuid, Vec<QuestionOption>> = HashMap::new();
        for o in opts {
            by_question.entry(o.question_id).or_default().push(QuestionOption {
                id: o.id,
                text: o.text,
                is_correct: o.is_correct,
                order_index: o.order_index,
            });
        }

        rows.into_iter()
            .map(|r| -> StoreResult<Question> {
                let scope = Scope::from_parts(&r.scope_kind, r.scope_id)
                    .ok_or_else(|| corrupt("questions", r.scope_kind.clone()))?;
                let kind = QuestionKind::parse(&r.kind)
                    .ok_or_else(|| corrupt("questions", r.kind.clone()))?;
                Ok(Question {
                    options: by_question.remove(&r.id).unwrap_or_default(),
                    id: r.id,
                    scope,
                    text: r.text,
                    kind,
                    topic: r.topic,
                    difficulty: r.difficulty,
                    points: r.points,
                    explanation: r.explanation,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    async fn insert_attempt(&self, attempt: &QuizAttempt) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO quiz_attempts (id, user_id, scope_kind, scope_id, question_ids,
                                         total_questions, correct_answers, score, passed, started_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)"#,
        )
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(attempt.scope.kind())
        .bind(attempt.scope.id())
        .bind(&attempt.question_ids)
        .bind(attempt.total_questions)
        .bind(attempt.correct_answers)
        .bind(attempt.score)
        .bind(attempt.passed)
        .bind(attempt.started_at)
        .execute(&self.db)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> StoreResult<Option<QuizAttempt>> {
        sqlx::query_as::<_, AttemptRow>("SELECT * FROM quiz_attempts WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(QuizAttempt::try_from)
            .transpose()
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        completion: &AttemptCompletion,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;

        // only the first writer sees the open attempt
        let res = sqlx::query(
            r#"UPDATE quiz_attempts
               SET correct_answers=$2, score=$3, passed=$4, completed_at=$5
               WHERE id=$1 AND completed_at IS NULL"#,
        )
        .bind(id)
        .bind(completion.correct_answers)
        .bind(completion.score)
        .bind(completion.passed)
        .bind(completion.completed_at)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for a in &completion.answers {
            sqlx::query(
                r#"INSERT INTO quiz_answers (id, attempt_id, question_id, selected_option_ids,
                                            is_correct, answered_at)
                   VALUES ($1,$2,$3,$4,$5,$6)"#,
            )
            .bind(a.id)
            .bind(a.attempt_id)
            .bind(a.question_id)
            .bind(&a.selected_option_ids)
            .bind(a.is_correct)
            .bind(a.answered_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_answers(&self, attempt_id: Uuid) -> StoreResult<Vec<QuizAnswer>> {
        let rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT * FROM quiz_answers WHERE attempt_id=$1 ORDER BY answered_at",
        )
        .bind(attempt_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(QuizAnswer::from).collect())
    }

    async fn list_completed_attempts(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> StoreResult<Vec<QuizAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"SELECT * FROM quiz_attempts
               WHERE user_id=$1 AND scope_kind=$2 AND scope_id=$3 AND completed_at IS NOT NULL
               ORDER BY started_at DESC"#,
        )
        .bind(user_id)
        .bind(scope.kind())
        .bind(scope.id())
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn insert_certificate(&self, cert: &Certificate) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO certificates (id, user_id, scope_kind, scope_id, certificate_number,
                                        score, verification_url, qr_code, document, is_valid, issued_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"#,
        )
        .bind(cert.id)
        .bind(cert.user_id)
        .bind(cert.scope.kind())
        .bind(cert.scope.id())
        .bind(&cert.certificate_number)
        .bind(cert.score)
        .bind(&cert.verification_url)
        .bind(cert.qr_code.as_deref())
        .bind(cert.document.as_deref())
        .bind(cert.is_valid)
        .bind(cert.issued_at)
        .execute(&self.db)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn find_certificate(
        &self,
        user_id: Uuid,
        scope: CertificateScope,
    ) -> StoreResult<Option<Certificate>> {
        sqlx::query_as::<_, CertificateRow>(
            r#"SELECT * FROM certificates
               WHERE user_id=$1 AND scope_kind=$2 AND scope_id IS NOT DISTINCT FROM $3"#,
        )
        .bind(user_id)
        .bind(scope.kind())
        .bind(scope.id())
        .fetch_optional(&self.db)
        .await?
        .map(Certificate::try_from)
        .transpose()
    }

    async fn get_certificate(&self, id: Uuid) -> StoreResult<Option<Certificate>> {
        sqlx::query_as::<_, CertificateRow>("SELECT * FROM certificates WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }

    async fn find_certificate_by_number(&self, number: &str) -> StoreResult<Option<Certificate>> {
        sqlx::query_as::<_, CertificateRow>("SELECT * FROM certificates WHERE certificate_number=$1")
            .bind(number)
            .fetch_optional(&self.db)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }

    async fn list_certificates(&self, user_id: Uuid) -> StoreResult<Vec<Certificate>> {
        let rows = sqlx::query_as::<_, CertificateRow>(
            "SELECT * FROM certificates WHERE user_id=$1 ORDER BY issued_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        collect(rows)
    }

    async fn save_certificate_artifacts(
        &self,
        id: Uuid,
        qr_code: Option<&[u8]>,
        document: Option<&[u8]>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE certificates
               SET qr_code = COALESCE(qr_code, $2), document = COALESCE(document, $3)
               WHERE id=$1"#,
        )
        .bind(id)
        .bind(qr_code)
        .bind(document)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> StoreResult<(Enrollment, bool)> {
        let inserted = sqlx::query_as::<_, EnrollmentRow>(
            r#"INSERT INTO enrollments (id, user_id, course_id, enrolled_at, deadline, completed_at)
               VALUES ($1,$2,$3,$4,$5,$6)
               ON CONFLICT (user_id, course_id) DO NOTHING
               RETURNING *"#,
        )
        .bind(enrollment.id)
        .bind(enrollment.user_id)
        .bind(enrollment.course_id)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.deadline)
        .bind(enrollment.completed_at)
        .fetch_optional(&self.db)
        .await
        .map_err(classify)?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }
        let existing = self
            .get_enrollment(enrollment.user_id, enrollment.course_id)
            .await?
            .ok_or_else(|| corrupt("enrollments", "conflicting row vanished"))?;
        Ok((existing, false))
    }

    async fn get_enrollment(
        &self,
        user_id: Uuid,
        course_id: Uuid,
    ) -> StoreResult<Option<Enrollment>> {
        Ok(sqlx::query_as::<_, EnrollmentRow>(
            "SELECT * FROM enrollments WHERE user_id=$1 AND course_id=$2",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?
        .map(Enrollment::from))
    }

    async fn list_enrollments(&self, user_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(
            "SELECT * FROM enrollments WHERE user_id=$1 ORDER BY enrolled_at DESC NULLS LAST",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Enrollment::from).collect())
    }

    async fn list_course_enrollments(&self, course_id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(
            "SELECT * FROM enrollments WHERE course_id=$1 ORDER BY enrolled_at DESC NULLS LAST",
        )
        .bind(course_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Enrollment::from).collect())
    }

    async fn mark_enrollment_completed(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"UPDATE enrollments SET completed_at = COALESCE(completed_at, $3)
               WHERE user_id=$1 AND course_id=$2"#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
