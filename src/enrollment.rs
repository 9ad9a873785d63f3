//! Course membership and the completion deadline policy.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{LmsError, LmsResult};
use crate::models::*;
use crate::store::Store;

/// Department keys with their display labels. `all` targets everyone.
pub const DEPARTMENTS: &[(&str, &str)] = &[
    ("all", "All Departments"),
    ("operations", "Operations"),
    ("retail_banking", "Retail Banking"),
    ("corporate_banking", "Corporate Banking"),
    ("risk_management", "Risk Management"),
    ("compliance", "Compliance"),
    ("finance", "Finance"),
    ("it", "Information Technology"),
    ("hr", "Human Resources"),
    ("audit", "Internal Audit"),
    ("marketing", "Marketing"),
    ("branch_network", "Branch Network"),
];

fn limit_days(course: &Course) -> Option<i64> {
    course.completion_time_limit_days.filter(|d| *d > 0).map(i64::from)
}

/// Deadline for a fresh enrollment; a missing enrolled-at counts from `now`.
pub fn deadline_for(course: &Course, enrolled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let days = limit_days(course)?;
    Some(enrolled_at.unwrap_or(now) + Duration::days(days))
}

pub fn is_overdue(enrollment: &Enrollment, now: DateTime<Utc>) -> bool {
    match enrollment.deadline {
        Some(deadline) if enrollment.completed_at.is_none() => now > deadline,
        _ => false,
    }
}

/// Whole days left, floored at zero. `None` once completed or without a deadline.
pub fn days_remaining(enrollment: &Enrollment, now: DateTime<Utc>) -> Option<i64> {
    if enrollment.completed_at.is_some() {
        return None;
    }
    enrollment.deadline.map(|d| (d - now).num_days().max(0))
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

pub fn time_limit_display(course: &Course) -> String {
    let Some(days) = limit_days(course) else {
        return "No time limit".into();
    };
    let (n, unit, rest) = match days {
        d if d < 7 => return plural(d, "day"),
        7 => return "1 week".into(),
        d if d < 30 => (d / 7, "week", d % 7),
        d => (d / 30, "month", d % 30),
    };
    // multi-week and multi-month spans always read in the plural
    let head = format!("{n} {unit}s");
    if rest == 0 {
        head
    } else {
        format!("{head} {}", plural(rest, "day"))
    }
}

/// Maps a free-text department onto a known key where possible.
pub fn normalize_department(raw: &str) -> String {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return value;
    }
    let by_label = |v: &str| {
        DEPARTMENTS
            .iter()
            .find(|(_, label)| label.to_lowercase() == v)
            .map(|(key, _)| key.to_string())
    };
    if let Some(key) = by_label(&value) {
        return key;
    }

    let mut slug = String::with_capacity(value.len());
    for ch in value.replace('&', "and").chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_').to_string();

    if let Some(key) = by_label(&slug) {
        return key;
    }
    match slug.as_str() {
        "information_technology" | "informationtechnology" => "it".into(),
        "human_resources" | "humanresource" => "hr".into(),
        _ => slug,
    }
}

pub fn is_department_key(key: &str) -> bool {
    DEPARTMENTS.iter().any(|(k, _)| *k == key)
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentView {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub created: bool,
    pub is_overdue: bool,
    pub days_remaining: Option<i64>,
    pub time_limit: String,
}

impl EnrollmentView {
    pub fn of(enrollment: Enrollment, course: &Course, created: bool, now: DateTime<Utc>) -> Self {
        Self {
            is_overdue: is_overdue(&enrollment, now),
            days_remaining: days_remaining(&enrollment, now),
            time_limit: time_limit_display(course),
            enrollment,
            created,
        }
    }
}

async fn create(store: &dyn Store, user_id: Uuid, course: &Course, now: DateTime<Utc>) -> LmsResult<(Enrollment, bool)> {
    let fresh = Enrollment {
        id: Uuid::new_v4(),
        user_id,
        course_id: course.id,
        enrolled_at: Some(now),
        deadline: deadline_for(course, Some(now), now),
        completed_at: None,
    };
    // an existing row keeps its original deadline
    Ok(store.insert_enrollment(&fresh).await?)
}

/// Get-or-create membership in a published course.
pub async fn enroll(store: &dyn Store, user_id: Uuid, course_id: Uuid) -> LmsResult<EnrollmentView> {
    let course = store
        .get_course(course_id)
        .await?
        .filter(|c| c.is_published)
        .ok_or(LmsError::NotFound("course"))?;
    let now = Utc::now();
    let (enrollment, created) = create(store, user_id, &course, now).await?;
    if created {
        tracing::info!(user_id = %user_id, course_id = %course_id, deadline = ?enrollment.deadline, "enrolled");
    }
    Ok(EnrollmentView::of(enrollment, &course, created, now))
}

/// Enrolls every banker in `department`; returns how many enrollments were new.
pub async fn bulk_enroll_department(store: &dyn Store, course_id: Uuid, department: &str) -> LmsResult<usize> {
    let key = department.trim();
    if !is_department_key(key) {
        return Err(LmsError::Validation(format!("unknown department {key:?}")));
    }
    let course = store.get_course(course_id).await?.ok_or(LmsError::NotFound("course"))?;

    let now = Utc::now();
    let mut created_count = 0;
    for user in store.list_users_by_role(Role::Banker).await? {
        if key != "all" && normalize_department(&user.department) != key {
            continue;
        }
        let (_, created) = create(store, user.id, &course, now).await?;
        if created {
            created_count += 1;
        }
    }
    tracing::info!(course_id = %course_id, department = key, created = created_count, "bulk enrollment");
    Ok(created_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(limit: Option<i32>) -> Course {
        Course {
            id: Uuid::new_v4(),
            title: "AML Basics".into(),
            description: String::new(),
            created_by: None,
            is_published: true,
            passing_score: 80,
            target_departments: vec![],
            completion_time_limit_days: limit,
            created_at: Utc::now(),
        }
    }

    fn enrollment(deadline: Option<DateTime<Utc>>) -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            enrolled_at: Some(Utc::now()),
            deadline,
            completed_at: None,
        }
    }

    #[test]
    fn deadline_follows_time_limit() {
        let now = Utc::now();
        let start = now - Duration::days(3);
        assert_eq!(deadline_for(&course(Some(14)), Some(start), now), Some(start + Duration::days(14)));
        assert_eq!(deadline_for(&course(Some(14)), None, now), Some(now + Duration::days(14)));
        assert_eq!(deadline_for(&course(Some(0)), Some(start), now), None);
        assert_eq!(deadline_for(&course(None), Some(start), now), None);
    }

    #[test]
    fn overdue_and_days_remaining() {
        let now = Utc::now();
        let late = enrollment(Some(now - Duration::days(2)));
        assert!(is_overdue(&late, now));
        assert_eq!(days_remaining(&late, now), Some(0));

        let open = enrollment(Some(now + Duration::days(5) + Duration::hours(3)));
        assert!(!is_overdue(&open, now));
        assert_eq!(days_remaining(&open, now), Some(5));

        let done = Enrollment { completed_at: Some(now), ..late };
        assert!(!is_overdue(&done, now));
        assert_eq!(days_remaining(&done, now), None);
        assert_eq!(days_remaining(&enrollment(None), now), None);
    }

    #[test]
    fn time_limit_reads_naturally() {
        let cases = [
            (None, "No time limit"),
            (Some(1), "1 day"),
            (Some(5), "5 days"),
            (Some(7), "1 week"),
            (Some(14), "2 weeks"),
            (Some(10), "1 weeks 3 days"),
            (Some(16), "2 weeks 2 days"),
            (Some(30), "1 months"),
            (Some(61), "2 months 1 day"),
        ];
        for (limit, want) in cases {
            assert_eq!(time_limit_display(&course(limit)), want, "limit {limit:?}");
        }
    }

    #[test]
    fn departments_normalize_to_keys() {
        assert_eq!(normalize_department("Retail Banking"), "retail_banking");
        assert_eq!(normalize_department("  retail banking "), "retail_banking");
        assert_eq!(normalize_department("Information Technology"), "it");
        assert_eq!(normalize_department("information-technology"), "it");
        assert_eq!(normalize_department("Human Resources"), "hr");
        assert_eq!(normalize_department("Risk & Compliance"), "risk_and_compliance");
        assert_eq!(normalize_department("compliance"), "compliance");
        assert_eq!(normalize_department(""), "");
        assert!(is_department_key("all"));
        assert!(!is_department_key("treasury"));
    }
}
