//! Progress ledger.
//!
//! The server decides when a unit is complete. Thresholds are based on how
//! much was watched or how far the learner got, never on the reported
//! position, so seeking to the end of a video does not complete it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{LmsError, LmsResult};
use crate::models::*;
use crate::scorm;
use crate::store::Store;

/// Share of a known duration that must be watched.
pub const COMPLETION_PERCENT: f64 = 95.0;
/// Seconds watched that complete a video of unknown duration passively.
pub const UNKNOWN_DURATION_PASSIVE_SECS: i32 = 60;
/// Seconds watched before "mark complete" is accepted for an unknown duration.
pub const UNKNOWN_DURATION_MANUAL_SECS: i32 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressState {
    pub unit_id: Uuid,
    pub is_completed: bool,
    pub completion_percentage: f64,
    pub watched_duration: i32,
    pub last_position: i32,
    pub highest_slide: i32,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressState {
    pub fn of(unit: &ContentUnit, rec: &ProgressRecord) -> Self {
        Self {
            unit_id: unit.id,
            is_completed: rec.is_completed(),
            completion_percentage: percentage(unit.kind, rec),
            watched_duration: rec.watched_secs,
            last_position: rec.last_position,
            highest_slide: rec.highest_slide,
            completed_at: rec.completed_at,
        }
    }
}

pub fn percentage(kind: UnitKind, rec: &ProgressRecord) -> f64 {
    let (done, total) = match kind {
        UnitKind::Video { duration_secs } => (rec.watched_secs, duration_secs),
        UnitKind::Interactive { total_slides, .. } => (rec.highest_slide, total_slides),
    };
    if total <= 0 {
        return if rec.is_completed() { 100.0 } else { 0.0 };
    }
    (f64::from(done) / f64::from(total) * 100.0).min(100.0)
}

/// Completion reached through normal playback.
pub fn video_auto_complete(duration_secs: i32, watched_secs: i32) -> bool {
    if duration_secs > 0 {
        f64::from(watched_secs) >= f64::from(duration_secs) * COMPLETION_PERCENT / 100.0
    } else {
        watched_secs >= UNKNOWN_DURATION_PASSIVE_SECS
    }
}

/// Completion the learner asked for explicitly, re-checked here.
pub fn video_manual_complete(duration_secs: i32, watched_secs: i32) -> bool {
    if duration_secs > 0 {
        f64::from(watched_secs) / f64::from(duration_secs) * 100.0 >= COMPLETION_PERCENT
    } else {
        watched_secs >= UNKNOWN_DURATION_MANUAL_SECS
    }
}

fn manual_requirement(duration_secs: i32) -> &'static str {
    if duration_secs > 0 {
        "95% of video"
    } else {
        "30 seconds"
    }
}

/// Applies one video update to the previous record. Counters only grow and a
/// set completion timestamp is kept.
pub fn apply_video(
    prev: ProgressRecord,
    duration_secs: i32,
    update: &ProgressUpdateReq,
    now: DateTime<Utc>,
) -> LmsResult<ProgressRecord> {
    if update.watched_duration < 0 || update.last_position < 0 {
        return Err(LmsError::Validation("durations must not be negative".into()));
    }
    let mut next = prev;
    next.watched_secs = next.watched_secs.max(update.watched_duration);
    next.last_position = update.last_position;
    next.updated_at = now;

    if next.completed_at.is_none() {
        let reached = match update.action {
            Some(ProgressAction::Complete) => {
                if !video_manual_complete(duration_secs, next.watched_secs) {
                    return Err(LmsError::CompletionRejected(manual_requirement(duration_secs)));
                }
                true
            }
            None => video_auto_complete(duration_secs, next.watched_secs),
        };
        if reached {
            next.completed_at = Some(now);
        }
    }
    Ok(next)
}

/// Applies one slide report from an interactive module.
pub fn apply_slide(
    prev: ProgressRecord,
    total_slides: i32,
    update: &SlideUpdateReq,
    now: DateTime<Utc>,
) -> LmsResult<ProgressRecord> {
    let slide = match (update.slide, update.lesson_location.as_deref()) {
        (Some(n), _) if n < 0 => {
            return Err(LmsError::Validation("slide must not be negative".into()))
        }
        (Some(n), _) => n,
        (None, Some(loc)) => scorm::parse_slide_location(loc).unwrap_or(0),
        (None, None) => 0,
    };

    let mut next = prev;
    next.highest_slide = next.highest_slide.max(slide);
    if slide > 0 {
        next.last_position = slide;
    }
    next.updated_at = now;

    let status_done = update
        .lesson_status
        .as_deref()
        .is_some_and(scorm::status_means_complete);
    let slides_done = total_slides > 0 && next.highest_slide >= total_slides;
    // the runtime's own status only counts when the slide count is unknown
    if next.completed_at.is_none() && (slides_done || (total_slides <= 0 && status_done)) {
        next.completed_at = Some(now);
    }
    Ok(next)
}

async fn load_unit(store: &dyn Store, unit_id: Uuid) -> LmsResult<ContentUnit> {
    store.get_unit(unit_id).await?.ok_or(LmsError::NotFound("content unit"))
}

async fn load_record(store: &dyn Store, user_id: Uuid, unit_id: Uuid, now: DateTime<Utc>) -> LmsResult<ProgressRecord> {
    Ok(store
        .get_progress(user_id, unit_id)
        .await?
        .unwrap_or_else(|| ProgressRecord::new(user_id, unit_id, now)))
}

pub async fn record_progress(
    store: &dyn Store,
    user_id: Uuid,
    unit_id: Uuid,
    update: &ProgressUpdateReq,
) -> LmsResult<ProgressState> {
    let unit = load_unit(store, unit_id).await?;
    let UnitKind::Video { duration_secs } = unit.kind else {
        return Err(LmsError::Validation("unit is not a video".into()));
    };
    let now = Utc::now();
    let prev = load_record(store, user_id, unit_id, now).await?;
    let was_complete = prev.is_completed();

    let next = apply_video(prev, duration_secs, update, now)?;
    let saved = store.save_progress(&next).await?;
    if !was_complete && saved.is_completed() {
        tracing::info!(user_id = %user_id, unit_id = %unit_id, watched = saved.watched_secs, "video completed");
    }
    Ok(ProgressState::of(&unit, &saved))
}

pub async fn record_slide(
    store: &dyn Store,
    user_id: Uuid,
    unit_id: Uuid,
    update: &SlideUpdateReq,
) -> LmsResult<ProgressState> {
    let unit = load_unit(store, unit_id).await?;
    let UnitKind::Interactive { total_slides, .. } = unit.kind else {
        return Err(LmsError::Validation("unit is not an interactive module".into()));
    };
    let now = Utc::now();
    let prev = load_record(store, user_id, unit_id, now).await?;
    let was_complete = prev.is_completed();

    let next = apply_slide(prev, total_slides, update, now)?;
    let saved = store.save_progress(&next).await?;
    if !was_complete && saved.is_completed() {
        tracing::info!(user_id = %user_id, unit_id = %unit_id, slide = saved.highest_slide, "interactive module completed");
    }
    Ok(ProgressState::of(&unit, &saved))
}

/// Current state; a unit never touched reads as the zero state.
pub async fn get_progress(store: &dyn Store, user_id: Uuid, unit_id: Uuid) -> LmsResult<ProgressState> {
    let unit = load_unit(store, unit_id).await?;
    let rec = load_record(store, user_id, unit_id, Utc::now()).await?;
    Ok(ProgressState::of(&unit, &rec))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec() -> ProgressRecord {
        ProgressRecord::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now())
    }

    fn watch(secs: i32) -> ProgressUpdateReq {
        ProgressUpdateReq { watched_duration: secs, last_position: secs, action: None }
    }

    fn mark(secs: i32) -> ProgressUpdateReq {
        ProgressUpdateReq { action: Some(ProgressAction::Complete), ..watch(secs) }
    }

    #[test]
    fn watched_duration_never_decreases() {
        let r = apply_video(rec(), 600, &watch(300), Utc::now()).unwrap();
        let r = apply_video(r, 600, &watch(120), Utc::now()).unwrap();
        assert_eq!(r.watched_secs, 300);
        assert_eq!(r.last_position, 120);
    }

    #[test]
    fn known_duration_completes_at_95_percent() {
        let r = apply_video(rec(), 100, &watch(94), Utc::now()).unwrap();
        assert!(!r.is_completed());
        let r = apply_video(r, 100, &watch(95), Utc::now()).unwrap();
        assert!(r.is_completed());
    }

    #[test]
    fn unknown_duration_uses_absolute_thresholds() {
        let r = apply_video(rec(), 0, &watch(59), Utc::now()).unwrap();
        assert!(!r.is_completed());
        let r = apply_video(r, 0, &watch(60), Utc::now()).unwrap();
        assert!(r.is_completed());

        // manual completion only needs 30 seconds
        assert!(apply_video(rec(), 0, &mark(30), Utc::now()).unwrap().is_completed());
        assert!(matches!(
            apply_video(rec(), 0, &mark(29), Utc::now()),
            Err(LmsError::CompletionRejected("30 seconds"))
        ));
    }

    #[test]
    fn manual_completion_is_revalidated() {
        let err = apply_video(rec(), 200, &mark(100), Utc::now()).unwrap_err();
        assert!(matches!(err, LmsError::CompletionRejected("95% of video")));
        assert!(apply_video(rec(), 200, &mark(190), Utc::now()).unwrap().is_completed());
    }

    #[test]
    fn position_alone_does_not_complete() {
        let update = ProgressUpdateReq { watched_duration: 5, last_position: 600, action: None };
        let r = apply_video(rec(), 600, &update, Utc::now()).unwrap();
        assert!(!r.is_completed());
    }

    #[test]
    fn completion_is_sticky() {
        let first = Utc::now();
        let r = apply_video(rec(), 100, &watch(100), first).unwrap();
        let r = apply_video(r, 100, &watch(3), Utc::now()).unwrap();
        assert_eq!(r.completed_at, Some(first));
        // a rejected manual request on a complete record is a no-op, not an error
        assert!(apply_video(r, 100, &mark(0), Utc::now()).unwrap().is_completed());
    }

    #[test]
    fn percentage_is_capped() {
        let mut r = rec();
        r.watched_secs = 150;
        assert_eq!(percentage(UnitKind::Video { duration_secs: 100 }, &r), 100.0);
        r.watched_secs = 25;
        assert_eq!(percentage(UnitKind::Video { duration_secs: 100 }, &r), 25.0);
        assert_eq!(percentage(UnitKind::Video { duration_secs: 0 }, &r), 0.0);
    }

    fn slide(n: i32) -> SlideUpdateReq {
        SlideUpdateReq { slide: Some(n), lesson_location: None, lesson_status: None }
    }

    #[test]
    fn slides_complete_at_last_slide() {
        let r = apply_slide(rec(), 10, &slide(9), Utc::now()).unwrap();
        assert!(!r.is_completed());
        let r = apply_slide(r, 10, &slide(4), Utc::now()).unwrap();
        assert_eq!(r.highest_slide, 9);
        let r = apply_slide(r, 10, &slide(10), Utc::now()).unwrap();
        assert!(r.is_completed());
        assert_eq!(percentage(UnitKind::Interactive { total_slides: 10, passing_score: 80 }, &r), 100.0);
    }

    #[test]
    fn lesson_location_is_parsed() {
        let update = SlideUpdateReq {
            slide: None,
            lesson_location: Some("m1s7".into()),
            lesson_status: None,
        };
        let r = apply_slide(rec(), 10, &update, Utc::now()).unwrap();
        assert_eq!(r.highest_slide, 7);
    }

    #[test]
    fn status_only_counts_without_slide_count() {
        let update = SlideUpdateReq {
            slide: Some(2),
            lesson_location: None,
            lesson_status: Some("completed".into()),
        };
        assert!(!apply_slide(rec(), 10, &update, Utc::now()).unwrap().is_completed());
        assert!(apply_slide(rec(), 0, &update, Utc::now()).unwrap().is_completed());
    }
}
