use axum::{
    extract::{FromRequestParts, Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Form, Json, Router,
};
use chrono::Utc;
use http::{header, request::Parts, HeaderName, StatusCode};
use std::sync::Arc;
use uuid::Uuid;

use crate::access::{self, Permission};
use crate::config::Config;
use crate::eligibility::{self, EligibilityResult};
use crate::enrollment::{self, EnrollmentView};
use crate::error::{LmsError, LmsResult};
use crate::issuer::{CertificateDetail, IssueOutcome, Issuer, Verification};
use crate::ledger::{self, ProgressState};
use crate::models::*;
use crate::quiz::{self, AttemptPaper, AttemptResult, SubmitOutcome};
use crate::reports::{self, CourseReport, LearnerSummary, ProgramAnalytics};
use crate::store::Store;

pub const USER_HEADER: HeaderName = HeaderName::from_static("x-user-id");

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub issuer: Arc<Issuer>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        // learner flow
        .route("/api/courses/:id/enroll", post(enroll))
        .route("/api/courses/:id/eligibility", get(eligibility))
        .route("/api/courses/:id/quiz", post(start_course_quiz))
        .route("/api/modules/:id/quiz", post(start_module_quiz))
        .route("/api/units/:id/progress", get(get_progress).post(record_progress))
        .route("/api/units/:id/slides", post(record_slide))
        .route("/api/attempts/:id", get(take_attempt))
        .route("/api/attempts/:id/submit", post(submit_attempt))
        .route("/api/attempts/:id/results", get(attempt_results))
        .route("/api/me/progress", get(my_progress))
        // certificates
        .route("/api/certificates", get(list_certificates))
        .route("/api/certificates/program", post(request_program_certificate))
        .route("/api/certificates/:id", get(certificate_detail))
        .route("/api/certificates/:id/download", get(download_certificate))
        .route("/certificates/verify/:number", get(verify_certificate))
        // administration
        .route("/api/admin/courses", post(create_course))
        .route("/api/admin/courses/:id/units", post(create_unit))
        .route("/api/admin/courses/:id/enroll-department", post(enroll_department))
        .route("/api/admin/courses/:id/progress", get(course_report))
        .route("/api/admin/questions", post(create_question))
        .route("/api/admin/questions/:id", put(edit_question).delete(delete_question))
        .route("/api/admin/analytics", get(program_analytics))
        .with_state(state)
}

/// The caller, resolved from the `x-user-id` header.
pub struct CurrentUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = LmsError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(&USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or(LmsError::Unauthorized)?;
        let user = state.store.get_user(id).await?.ok_or(LmsError::Unauthorized)?;
        Ok(CurrentUser(user))
    }
}

// --- learner ---

async fn enroll(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<Uuid>,
) -> LmsResult<(StatusCode, Json<EnrollmentView>)> {
    access::require(&user, Permission::TakeCourses)?;
    let view = enrollment::enroll(st.store.as_ref(), user.id, course_id).await?;
    let status = if view.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(view)))
}

async fn eligibility(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<Uuid>,
) -> LmsResult<Json<EligibilityResult>> {
    Ok(Json(eligibility::evaluate(st.store.as_ref(), user.id, course_id).await?))
}

async fn start_quiz(st: &AppState, user: &User, scope: Scope) -> LmsResult<(StatusCode, Json<QuizAttempt>)> {
    access::require(user, Permission::TakeCourses)?;
    let attempt = quiz::start_attempt(st.store.as_ref(), user.id, scope).await?;
    Ok((StatusCode::CREATED, Json(attempt)))
}

async fn start_course_quiz(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<Uuid>,
) -> LmsResult<(StatusCode, Json<QuizAttempt>)> {
    start_quiz(&st, &user, Scope::Course(course_id)).await
}

async fn start_module_quiz(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(module_id): Path<Uuid>,
) -> LmsResult<(StatusCode, Json<QuizAttempt>)> {
    start_quiz(&st, &user, Scope::Module(module_id)).await
}

async fn get_progress(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(unit_id): Path<Uuid>,
) -> LmsResult<Json<ProgressState>> {
    Ok(Json(ledger::get_progress(st.store.as_ref(), user.id, unit_id).await?))
}

async fn record_progress(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(unit_id): Path<Uuid>,
    Json(req): Json<ProgressUpdateReq>,
) -> LmsResult<Json<ProgressState>> {
    Ok(Json(ledger::record_progress(st.store.as_ref(), user.id, unit_id, &req).await?))
}

async fn record_slide(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(unit_id): Path<Uuid>,
    Json(req): Json<SlideUpdateReq>,
) -> LmsResult<Json<ProgressState>> {
    Ok(Json(ledger::record_slide(st.store.as_ref(), user.id, unit_id, &req).await?))
}

async fn take_attempt(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(attempt_id): Path<Uuid>,
) -> LmsResult<Json<AttemptPaper>> {
    Ok(Json(quiz::take_attempt(st.store.as_ref(), user.id, attempt_id).await?))
}

async fn submit_attempt(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(attempt_id): Path<Uuid>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> LmsResult<Json<SubmitOutcome>> {
    let answers = quiz::parse_submission(&pairs)?;
    let outcome =
        quiz::submit_attempt(st.store.as_ref(), &st.issuer, user.id, attempt_id, &answers).await?;
    Ok(Json(outcome))
}

async fn attempt_results(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(attempt_id): Path<Uuid>,
) -> LmsResult<Json<AttemptResult>> {
    Ok(Json(quiz::attempt_results(st.store.as_ref(), user.id, attempt_id).await?))
}

async fn my_progress(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> LmsResult<Json<LearnerSummary>> {
    Ok(Json(reports::learner_summary(st.store.as_ref(), user.id).await?))
}

// --- certificates ---

async fn list_certificates(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> LmsResult<Json<Vec<Certificate>>> {
    Ok(Json(st.issuer.list(user.id).await?))
}

async fn certificate_detail(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> LmsResult<Json<CertificateDetail>> {
    Ok(Json(st.issuer.detail(user.id, id).await?))
}

async fn download_certificate(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> LmsResult<impl IntoResponse> {
    let (filename, pdf) = st.issuer.download(user.id, id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        pdf,
    ))
}

async fn request_program_certificate(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> LmsResult<(StatusCode, Json<IssueOutcome>)> {
    let outcome = st.issuer.issue_program(user.id, st.config.program_passing_score).await?;
    let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

async fn verify_certificate(
    State(st): State<AppState>,
    Path(number): Path<String>,
) -> LmsResult<Json<Verification>> {
    Ok(Json(st.issuer.verify(&number).await?))
}

// --- administration ---

fn check_passing_score(score: i32) -> LmsResult<i32> {
    if (0..=100).contains(&score) {
        Ok(score)
    } else {
        Err(LmsError::Validation("passing score must be between 0 and 100".into()))
    }
}

async fn create_course(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateCourseReq>,
) -> LmsResult<(StatusCode, Json<Course>)> {
    access::require(&user, Permission::ManageContent)?;
    if req.title.trim().is_empty() {
        return Err(LmsError::Validation("title is required".into()));
    }
    let course = Course {
        id: Uuid::new_v4(),
        title: req.title.trim().to_string(),
        description: req.description,
        created_by: Some(user.id),
        is_published: req.is_published,
        passing_score: check_passing_score(req.passing_score.unwrap_or(DEFAULT_PASSING_SCORE))?,
        target_departments: req.target_departments,
        completion_time_limit_days: req.completion_time_limit_days.filter(|d| *d > 0),
        created_at: Utc::now(),
    };
    st.store.insert_course(&course).await?;
    tracing::info!(course_id = %course.id, user_id = %user.id, "course created");
    Ok((StatusCode::CREATED, Json(course)))
}

async fn create_unit(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<Uuid>,
    Json(req): Json<CreateUnitReq>,
) -> LmsResult<(StatusCode, Json<ContentUnit>)> {
    access::require(&user, Permission::ManageContent)?;
    st.store.get_course(course_id).await?.ok_or(LmsError::NotFound("course"))?;
    match req.kind {
        UnitKind::Video { duration_secs } if duration_secs < 0 => {
            return Err(LmsError::Validation("duration cannot be negative".into()));
        }
        UnitKind::Interactive { total_slides, passing_score } => {
            if total_slides < 0 {
                return Err(LmsError::Validation("slide count cannot be negative".into()));
            }
            check_passing_score(passing_score)?;
        }
        UnitKind::Video { .. } => {}
    }
    let unit = ContentUnit {
        id: Uuid::new_v4(),
        course_id,
        title: req.title,
        order_index: req.order_index,
        kind: req.kind,
        created_at: Utc::now(),
    };
    st.store.insert_unit(&unit).await?;
    tracing::info!(course_id = %course_id, unit_id = %unit.id, "content unit added");
    Ok((StatusCode::CREATED, Json(unit)))
}

async fn create_question(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateQuestionReq>,
) -> LmsResult<(StatusCode, Json<Question>)> {
    access::require(&user, Permission::ManageContent)?;
    let question = quiz::add_question(st.store.as_ref(), req).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

async fn edit_question(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<EditQuestionReq>,
) -> LmsResult<Json<Question>> {
    access::require(&user, Permission::ManageContent)?;
    Ok(Json(quiz::edit_question(st.store.as_ref(), id, req).await?))
}

async fn delete_question(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> LmsResult<StatusCode> {
    access::require(&user, Permission::ManageContent)?;
    quiz::delete_question(st.store.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enroll_department(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<Uuid>,
    Json(req): Json<BulkEnrollReq>,
) -> LmsResult<Json<serde_json::Value>> {
    access::require(&user, Permission::ManageEnrollments)?;
    let created = enrollment::bulk_enroll_department(st.store.as_ref(), course_id, &req.department).await?;
    Ok(Json(serde_json::json!({ "created": created })))
}

async fn course_report(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<Uuid>,
) -> LmsResult<Json<CourseReport>> {
    access::require(&user, Permission::ViewAnalytics)?;
    Ok(Json(reports::course_report(st.store.as_ref(), course_id).await?))
}

async fn program_analytics(
    State(st): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> LmsResult<Json<ProgramAnalytics>> {
    access::require(&user, Permission::ViewAnalytics)?;
    Ok(Json(reports::program_analytics(st.store.as_ref()).await?))
}
