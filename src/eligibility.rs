//! Eligibility evaluator.
//!
//! Everything here is recomputed from the ledger and the attempt history on
//! each call; no completion flag is cached anywhere, so there is nothing to
//! go stale or repair on read.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{LmsError, LmsResult};
use crate::models::*;
use crate::store::Store;

/// Completed/total counts for one kind of content unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Tally {
    pub completed: usize,
    pub total: usize,
}

impl Tally {
    /// A kind with no units is trivially satisfied.
    pub fn is_satisfied(&self) -> bool {
        self.completed >= self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ContentTally {
    pub videos: Tally,
    pub interactive: Tally,
}

impl ContentTally {
    /// Videos and interactive modules are judged independently.
    pub fn is_content_complete(&self) -> bool {
        self.videos.is_satisfied() && self.interactive.is_satisfied()
    }

    pub fn percent(&self) -> f64 {
        let total = self.videos.total + self.interactive.total;
        if total == 0 {
            return 100.0;
        }
        let done = self.videos.completed + self.interactive.completed;
        round2(done as f64 / total as f64 * 100.0)
    }

    pub fn prerequisite_error(&self) -> LmsError {
        LmsError::PrerequisiteNotMet { videos: self.videos, interactive: self.interactive }
    }
}

pub fn tally(units: &[ContentUnit], progress: &[ProgressRecord]) -> ContentTally {
    let done = |unit: &ContentUnit| {
        progress.iter().any(|p| p.unit_id == unit.id && p.is_completed())
    };
    let mut t = ContentTally::default();
    for unit in units {
        let slot = if unit.is_video() { &mut t.videos } else { &mut t.interactive };
        slot.total += 1;
        if done(unit) {
            slot.completed += 1;
        }
    }
    t
}

/// Highest score among completed, passed attempts.
pub fn best_passing_score(attempts: &[QuizAttempt]) -> Option<f64> {
    attempts
        .iter()
        .filter(|a| a.is_completed() && a.passed)
        .filter_map(|a| a.score)
        .fold(None, |best, s| Some(best.map_or(s, |b: f64| b.max(s))))
}

/// Mean of the courses that have a qualifying score; the others count
/// neither in the numerator nor in the denominator.
pub fn program_average(per_course: &[Option<f64>]) -> Option<f64> {
    let scores: Vec<f64> = per_course.iter().flatten().copied().collect();
    if scores.is_empty() {
        return None;
    }
    Some(round2(scores.iter().sum::<f64>() / scores.len() as f64))
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct EligibilityResult {
    pub scope: Scope,
    pub content: ContentTally,
    pub content_complete: bool,
    pub passed_attempts: usize,
    pub best_passing_score: Option<f64>,
    pub certifiable: bool,
}

impl EligibilityResult {
    fn build(scope: Scope, content: ContentTally, attempts: &[QuizAttempt]) -> Self {
        let content_complete = content.is_content_complete();
        let best = best_passing_score(attempts);
        Self {
            scope,
            content,
            content_complete,
            passed_attempts: attempts.iter().filter(|a| a.passed).count(),
            best_passing_score: best,
            certifiable: content_complete && best.is_some(),
        }
    }
}

/// Ledger counts for every unit of a course.
pub async fn course_tally(store: &dyn Store, user_id: Uuid, course_id: Uuid) -> LmsResult<ContentTally> {
    let units = store.list_units(course_id).await?;
    let ids: Vec<Uuid> = units.iter().map(|u| u.id).collect();
    let progress = store.list_progress(user_id, &ids).await?;
    Ok(tally(&units, &progress))
}

/// Ledger counts for a single interactive module scope.
pub async fn module_tally(store: &dyn Store, user_id: Uuid, module: &ContentUnit) -> LmsResult<ContentTally> {
    let progress = store.get_progress(user_id, module.id).await?;
    Ok(tally(std::slice::from_ref(module), progress.as_slice()))
}

pub async fn scope_tally(store: &dyn Store, user_id: Uuid, scope: Scope) -> LmsResult<ContentTally> {
    match scope {
        Scope::Course(id) => {
            store.get_course(id).await?.ok_or(LmsError::NotFound("course"))?;
            course_tally(store, user_id, id).await
        }
        Scope::Module(id) => {
            let module = load_module(store, id).await?;
            module_tally(store, user_id, &module).await
        }
    }
}

pub async fn load_module(store: &dyn Store, id: Uuid) -> LmsResult<ContentUnit> {
    store
        .get_unit(id)
        .await?
        .filter(ContentUnit::is_interactive)
        .ok_or(LmsError::NotFound("interactive module"))
}

pub async fn evaluate_scope(store: &dyn Store, user_id: Uuid, scope: Scope) -> LmsResult<EligibilityResult> {
    let content = scope_tally(store, user_id, scope).await?;
    let attempts = store.list_completed_attempts(user_id, scope).await?;
    Ok(EligibilityResult::build(scope, content, &attempts))
}

pub async fn evaluate(store: &dyn Store, user_id: Uuid, course_id: Uuid) -> LmsResult<EligibilityResult> {
    evaluate_scope(store, user_id, Scope::Course(course_id)).await
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseStanding {
    pub course_id: Uuid,
    pub title: String,
    pub content_complete: bool,
    pub best_passing_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramStanding {
    pub courses: Vec<CourseStanding>,
    pub counted_courses: usize,
    pub average_score: Option<f64>,
    pub threshold: f64,
    pub eligible: bool,
}

impl ProgramStanding {
    pub fn reason(&self) -> String {
        match self.average_score {
            None if self.courses.is_empty() => "no courses enrolled".into(),
            None => "no courses completed; complete all videos, interactive modules and pass the quiz".into(),
            Some(avg) => format!("average score is {avg:.2}%, minimum {:.0}% required", self.threshold),
        }
    }
}

/// Whole-program standing over the user's enrolled courses.
pub async fn evaluate_program(store: &dyn Store, user_id: Uuid, threshold: f64) -> LmsResult<ProgramStanding> {
    let mut courses = Vec::new();
    for enrollment in store.list_enrollments(user_id).await? {
        let Some(course) = store.get_course(enrollment.course_id).await? else {
            continue;
        };
        let result = evaluate(store, user_id, course.id).await?;
        courses.push(CourseStanding {
            course_id: course.id,
            title: course.title,
            content_complete: result.content_complete,
            best_passing_score: result.best_passing_score.filter(|_| result.content_complete),
        });
    }

    let scores: Vec<Option<f64>> = courses.iter().map(|c| c.best_passing_score).collect();
    let average_score = program_average(&scores);
    Ok(ProgramStanding {
        counted_courses: scores.iter().flatten().count(),
        eligible: average_score.is_some_and(|avg| avg >= threshold),
        average_score,
        threshold,
        courses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn unit(kind: UnitKind) -> ContentUnit {
        ContentUnit {
            id: Uuid::new_v4(),
            course_id: Uuid::nil(),
            title: "u".into(),
            order_index: 0,
            kind,
            created_at: Utc::now(),
        }
    }

    fn done(user: Uuid, unit: &ContentUnit) -> ProgressRecord {
        let mut p = ProgressRecord::new(user, unit.id, Utc::now());
        p.completed_at = Some(Utc::now());
        p
    }

    fn attempt(score: f64, passed: bool) -> QuizAttempt {
        QuizAttempt {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            scope: Scope::Course(Uuid::nil()),
            question_ids: vec![],
            total_questions: 10,
            correct_answers: 0,
            score: Some(score),
            passed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn three_videos_need_all_three() {
        let user = Uuid::new_v4();
        let units: Vec<ContentUnit> =
            (0..3).map(|_| unit(UnitKind::Video { duration_secs: 100 })).collect();
        let mut progress = vec![done(user, &units[0]), done(user, &units[1])];

        let t = tally(&units, &progress);
        assert_eq!(t.videos, Tally { completed: 2, total: 3 });
        assert!(!t.is_content_complete());

        progress.push(done(user, &units[2]));
        assert!(tally(&units, &progress).is_content_complete());
    }

    #[test]
    fn kinds_are_counted_independently() {
        let user = Uuid::new_v4();
        let video = unit(UnitKind::Video { duration_secs: 0 });
        let module = unit(UnitKind::Interactive { total_slides: 10, passing_score: 80 });
        let units = vec![video.clone(), module];
        let t = tally(&units, &[done(user, &video)]);
        assert!(t.videos.is_satisfied());
        assert!(!t.interactive.is_satisfied());
        assert!(!t.is_content_complete());
        assert_eq!(t.percent(), 50.0);
    }

    #[test]
    fn empty_course_is_content_complete() {
        let t = tally(&[], &[]);
        assert!(t.is_content_complete());
        assert_eq!(t.percent(), 100.0);
    }

    #[test]
    fn best_score_ignores_failed_attempts() {
        let attempts = vec![attempt(85.0, true), attempt(95.0, false), attempt(90.0, true)];
        assert_eq!(best_passing_score(&attempts), Some(90.0));
        assert_eq!(best_passing_score(&[attempt(60.0, false)]), None);
    }

    #[test]
    fn program_average_excludes_unfinished_courses() {
        assert_eq!(program_average(&[Some(90.0), None, Some(80.0)]), Some(85.0));
        assert_eq!(program_average(&[None, None]), None);
        assert_eq!(program_average(&[Some(70.0), Some(75.0)]), Some(72.5));
    }
}
