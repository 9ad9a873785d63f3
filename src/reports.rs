//! Read-only progress summaries for learners and course administrators.

use serde::Serialize;
use uuid::Uuid;

use crate::eligibility::{self, round2, Tally};
use crate::error::{LmsError, LmsResult};
use crate::models::*;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct CourseProgress {
    pub course_id: Uuid,
    pub title: String,
    pub videos: Tally,
    pub interactive: Tally,
    pub content_percent: f64,
    pub attempts: usize,
    pub best_passing_score: Option<f64>,
    pub has_certificate: bool,
}

async fn course_progress(store: &dyn Store, user_id: Uuid, course: &Course) -> LmsResult<CourseProgress> {
    let result = eligibility::evaluate(store, user_id, course.id).await?;
    let certificate = store
        .find_certificate(user_id, CertificateScope::Course(course.id))
        .await?;
    Ok(CourseProgress {
        course_id: course.id,
        title: course.title.clone(),
        videos: result.content.videos,
        interactive: result.content.interactive,
        content_percent: result.content.percent(),
        attempts: store
            .list_completed_attempts(user_id, Scope::Course(course.id))
            .await?
            .len(),
        best_passing_score: result.best_passing_score,
        has_certificate: certificate.is_some(),
    })
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Totals {
    pub enrolled: usize,
    pub content_complete: usize,
    pub passed: usize,
    pub certificates: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerSummary {
    pub user_id: Uuid,
    pub courses: Vec<CourseProgress>,
    pub totals: Totals,
}

pub async fn learner_summary(store: &dyn Store, user_id: Uuid) -> LmsResult<LearnerSummary> {
    let mut courses = Vec::new();
    for enrollment in store.list_enrollments(user_id).await? {
        if let Some(course) = store.get_course(enrollment.course_id).await? {
            courses.push(course_progress(store, user_id, &course).await?);
        }
    }
    let totals = Totals {
        enrolled: courses.len(),
        content_complete: courses
            .iter()
            .filter(|c| c.videos.is_satisfied() && c.interactive.is_satisfied())
            .count(),
        passed: courses.iter().filter(|c| c.best_passing_score.is_some()).count(),
        certificates: store.list_certificates(user_id).await?.len(),
    };
    Ok(LearnerSummary { user_id, courses, totals })
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerRow {
    pub user_id: Uuid,
    pub full_name: String,
    pub department: String,
    pub overdue: bool,
    #[serde(flatten)]
    pub progress: CourseProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseReport {
    pub course_id: Uuid,
    pub title: String,
    pub learners: Vec<LearnerRow>,
    pub average_content_percent: f64,
}

pub async fn course_report(store: &dyn Store, course_id: Uuid) -> LmsResult<CourseReport> {
    let course = store.get_course(course_id).await?.ok_or(LmsError::NotFound("course"))?;
    let now = chrono::Utc::now();

    let mut learners = Vec::new();
    for enrollment in store.list_course_enrollments(course_id).await? {
        let Some(user) = store.get_user(enrollment.user_id).await? else {
            continue;
        };
        learners.push(LearnerRow {
            overdue: crate::enrollment::is_overdue(&enrollment, now),
            progress: course_progress(store, user.id, &course).await?,
            user_id: user.id,
            full_name: user.full_name,
            department: user.department,
        });
    }

    let average_content_percent = if learners.is_empty() {
        0.0
    } else {
        round2(learners.iter().map(|l| l.progress.content_percent).sum::<f64>() / learners.len() as f64)
    };
    Ok(CourseReport { course_id, title: course.title, learners, average_content_percent })
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseAnalytics {
    pub course_id: Uuid,
    pub title: String,
    pub is_published: bool,
    pub total_bankers: usize,
    pub enrolled: usize,
    pub not_enrolled: usize,
    pub in_progress: usize,
    pub content_complete: usize,
    pub passed: usize,
    pub certificates: usize,
    pub overdue: usize,
    /// Learners with progress saved in the last seven days.
    pub recently_active: usize,
    pub average_content_percent: f64,
    pub enrollment_rate: f64,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramAnalytics {
    pub total_bankers: usize,
    pub courses: Vec<CourseAnalytics>,
    pub totals: Totals,
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 * 100.0 / whole as f64)
    }
}

/// Enrollment and completion figures for every course, counted over bankers.
pub async fn program_analytics(store: &dyn Store) -> LmsResult<ProgramAnalytics> {
    let bankers = store.list_users_by_role(Role::Banker).await?;
    let total_bankers = bankers.len();
    let now = chrono::Utc::now();
    let recent = now - chrono::Duration::days(7);

    let mut courses = Vec::new();
    let mut totals = Totals::default();
    for course in store.list_courses().await? {
        let unit_ids: Vec<Uuid> = store.list_units(course.id).await?.iter().map(|u| u.id).collect();
        let mut row = CourseAnalytics {
            course_id: course.id,
            title: course.title.clone(),
            is_published: course.is_published,
            total_bankers,
            enrolled: 0,
            not_enrolled: 0,
            in_progress: 0,
            content_complete: 0,
            passed: 0,
            certificates: 0,
            overdue: 0,
            recently_active: 0,
            average_content_percent: 0.0,
            enrollment_rate: 0.0,
            completion_rate: 0.0,
        };
        let mut percent_sum = 0.0;

        for enrollment in store.list_course_enrollments(course.id).await? {
            if !bankers.iter().any(|b| b.id == enrollment.user_id) {
                continue;
            }
            let progress = course_progress(store, enrollment.user_id, &course).await?;
            row.enrolled += 1;
            percent_sum += progress.content_percent;
            if progress.videos.is_satisfied() && progress.interactive.is_satisfied() {
                row.content_complete += 1;
            }
            if progress.best_passing_score.is_some() {
                row.passed += 1;
            }
            if progress.has_certificate {
                row.certificates += 1;
            }
            if crate::enrollment::is_overdue(&enrollment, now) {
                row.overdue += 1;
            }
            let records = store.list_progress(enrollment.user_id, &unit_ids).await?;
            if records.iter().any(|r| r.updated_at >= recent) {
                row.recently_active += 1;
            }
        }

        row.not_enrolled = total_bankers.saturating_sub(row.enrolled);
        row.in_progress = row.enrolled - row.content_complete;
        if row.enrolled > 0 {
            row.average_content_percent = round2(percent_sum / row.enrolled as f64);
        }
        row.enrollment_rate = rate(row.enrolled, total_bankers);
        row.completion_rate = rate(row.certificates, row.enrolled);

        totals.enrolled += row.enrolled;
        totals.content_complete += row.content_complete;
        totals.passed += row.passed;
        totals.certificates += row.certificates;
        courses.push(row);
    }

    Ok(ProgramAnalytics { total_bankers, courses, totals })
}
