//! Quiz engine: attempt creation, the exam paper, grading and results.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::eligibility::{self, round2};
use crate::error::{LmsError, LmsResult};
use crate::issuer::Issuer;
use crate::models::*;
use crate::store::Store;

pub const MAX_QUESTIONS_PER_ATTEMPT: usize = 20;

/// Submitted option ids per question.
pub type Answers = HashMap<Uuid, HashSet<Uuid>>;

/// Uniform sample without replacement when the bank is larger than `limit`,
/// otherwise the whole bank in bank order.
pub fn select_questions<R: Rng + ?Sized>(bank: &[Uuid], limit: usize, rng: &mut R) -> Vec<Uuid> {
    if bank.len() <= limit {
        return bank.to_vec();
    }
    bank.choose_multiple(rng, limit).copied().collect()
}

/// Credit only for exactly the set of correct options.
pub fn is_correct(question: &Question, selected: &HashSet<Uuid>) -> bool {
    let correct: HashSet<Uuid> =
        question.options.iter().filter(|o| o.is_correct).map(|o| o.id).collect();
    !selected.is_empty() && *selected == correct
}

pub fn score_percent(correct: i32, total: i32) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    round2(f64::from(correct) / f64::from(total) * 100.0)
}

/// Grades an open attempt. Questions no longer in the bank and unanswered
/// questions earn nothing; the denominator stays the attempt's fixed total.
pub fn grade(
    attempt: &QuizAttempt,
    questions: &[Question],
    answers: &Answers,
    passing_score: i32,
    now: DateTime<Utc>,
) -> AttemptCompletion {
    let by_id: HashMap<Uuid, &Question> = questions.iter().map(|q| (q.id, q)).collect();
    let mut rows = Vec::new();
    let mut correct = 0;

    for qid in &attempt.question_ids {
        let (Some(question), Some(selected)) = (by_id.get(qid), answers.get(qid)) else {
            continue;
        };
        if selected.is_empty() {
            continue;
        }
        let ok = is_correct(question, selected);
        if ok {
            correct += 1;
        }
        let mut selected_option_ids: Vec<Uuid> = selected.iter().copied().collect();
        selected_option_ids.sort();
        rows.push(QuizAnswer {
            id: Uuid::new_v4(),
            attempt_id: attempt.id,
            question_id: Some(*qid),
            selected_option_ids,
            is_correct: ok,
            answered_at: now,
        });
    }

    let score = score_percent(correct, attempt.total_questions);
    AttemptCompletion {
        correct_answers: correct,
        score,
        passed: score >= f64::from(passing_score),
        completed_at: now,
        answers: rows,
    }
}

/// Reads `question_<id>=<option id>` pairs; other fields are ignored.
pub fn parse_submission(pairs: &[(String, String)]) -> LmsResult<Answers> {
    let mut answers = Answers::new();
    for (key, value) in pairs {
        let Some(qid) = key.strip_prefix("question_") else {
            continue;
        };
        let qid = Uuid::parse_str(qid)
            .map_err(|_| LmsError::Validation(format!("invalid question id in {key}")))?;
        // a blank radio/select value means the question was left unanswered
        if value.trim().is_empty() {
            continue;
        }
        let oid = Uuid::parse_str(value.trim())
            .map_err(|_| LmsError::Validation(format!("invalid option id for {key}")))?;
        answers.entry(qid).or_default().insert(oid);
    }
    Ok(answers)
}

pub async fn passing_score(store: &dyn Store, scope: Scope) -> LmsResult<i32> {
    match scope {
        Scope::Course(id) => Ok(store
            .get_course(id)
            .await?
            .map(|c| c.passing_score)
            .unwrap_or(DEFAULT_PASSING_SCORE)),
        Scope::Module(id) => match store.get_unit(id).await?.map(|u| u.kind) {
            Some(UnitKind::Interactive { passing_score, .. }) => Ok(passing_score),
            _ => Ok(DEFAULT_PASSING_SCORE),
        },
    }
}

/// Starts an attempt once every content unit in scope is complete.
pub async fn start_attempt(store: &dyn Store, user_id: Uuid, scope: Scope) -> LmsResult<QuizAttempt> {
    let content = match scope {
        Scope::Course(course_id) => {
            store.get_course(course_id).await?.ok_or(LmsError::NotFound("course"))?;
            store
                .get_enrollment(user_id, course_id)
                .await?
                .ok_or(LmsError::NotFound("enrollment"))?;
            eligibility::course_tally(store, user_id, course_id).await?
        }
        Scope::Module(module_id) => {
            let module = eligibility::load_module(store, module_id).await?;
            eligibility::module_tally(store, user_id, &module).await?
        }
    };
    if !content.is_content_complete() {
        tracing::debug!(user_id = %user_id, %scope, ?content, "quiz start blocked");
        return Err(content.prerequisite_error());
    }

    let bank = store.list_question_ids(scope).await?;
    if bank.is_empty() {
        return Err(LmsError::EmptyQuestionBank);
    }
    let selected = select_questions(&bank, MAX_QUESTIONS_PER_ATTEMPT, &mut rand::thread_rng());

    let attempt = QuizAttempt {
        id: Uuid::new_v4(),
        user_id,
        scope,
        total_questions: selected.len() as i32,
        question_ids: selected,
        correct_answers: 0,
        score: None,
        passed: false,
        started_at: Utc::now(),
        completed_at: None,
    };
    store.insert_attempt(&attempt).await?;
    tracing::info!(user_id = %user_id, %scope, attempt_id = %attempt.id,
        questions = attempt.total_questions, bank = bank.len(), "quiz attempt started");
    Ok(attempt)
}

async fn owned_attempt(store: &dyn Store, user_id: Uuid, attempt_id: Uuid) -> LmsResult<QuizAttempt> {
    store
        .get_attempt(attempt_id)
        .await?
        .filter(|a| a.user_id == user_id)
        .ok_or(LmsError::NotFound("quiz attempt"))
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperOption {
    pub id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperQuestion {
    pub id: Uuid,
    pub text: String,
    pub kind: QuestionKind,
    pub topic: String,
    pub points: i32,
    pub options: Vec<PaperOption>,
}

/// The exam as shown to the learner; carries no correctness.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptPaper {
    pub attempt_id: Uuid,
    pub scope: Scope,
    pub total_questions: i32,
    pub started_at: DateTime<Utc>,
    pub questions: Vec<PaperQuestion>,
}

/// Serves the stored question list in stored order. Repeated reads of the
/// same attempt return the same paper.
pub async fn take_attempt(store: &dyn Store, user_id: Uuid, attempt_id: Uuid) -> LmsResult<AttemptPaper> {
    let attempt = owned_attempt(store, user_id, attempt_id).await?;
    if attempt.is_completed() {
        return Err(LmsError::AlreadyCompleted);
    }
    let mut by_id: HashMap<Uuid, Question> = store
        .get_questions(&attempt.question_ids)
        .await?
        .into_iter()
        .map(|q| (q.id, q))
        .collect();

    let questions = attempt
        .question_ids
        .iter()
        .filter_map(|id| by_id.remove(id))
        .map(|q| PaperQuestion {
            id: q.id,
            text: q.text,
            kind: q.kind,
            topic: q.topic,
            points: q.points,
            options: q
                .options
                .into_iter()
                .map(|o| PaperOption { id: o.id, text: o.text })
                .collect(),
        })
        .collect();

    Ok(AttemptPaper {
        attempt_id: attempt.id,
        scope: attempt.scope,
        total_questions: attempt.total_questions,
        started_at: attempt.started_at,
        questions,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub attempt: QuizAttempt,
    pub certificate: Option<Certificate>,
    /// Set when the attempt passed but the certificate step reported a problem.
    pub notice: Option<String>,
}

/// Grades an attempt exactly once.
pub async fn submit_attempt(
    store: &dyn Store,
    issuer: &Issuer,
    user_id: Uuid,
    attempt_id: Uuid,
    answers: &Answers,
) -> LmsResult<SubmitOutcome> {
    let attempt = owned_attempt(store, user_id, attempt_id).await?;
    if attempt.is_completed() {
        return Err(LmsError::AlreadyCompleted);
    }

    let questions = store.get_questions(&attempt.question_ids).await?;
    let bar = passing_score(store, attempt.scope).await?;
    let completion = grade(&attempt, &questions, answers, bar, Utc::now());

    // a concurrent submit may have won since the read above
    if !store.complete_attempt(attempt.id, &completion).await? {
        tracing::warn!(attempt_id = %attempt.id, "concurrent submission rejected");
        return Err(LmsError::AlreadyCompleted);
    }

    let graded = QuizAttempt {
        correct_answers: completion.correct_answers,
        score: Some(completion.score),
        passed: completion.passed,
        completed_at: Some(completion.completed_at),
        ..attempt
    };
    tracing::info!(user_id = %user_id, attempt_id = %graded.id, scope = %graded.scope,
        score = completion.score, passed = graded.passed, "quiz attempt graded");

    let mut outcome = SubmitOutcome { attempt: graded, certificate: None, notice: None };
    if !outcome.attempt.passed {
        return Ok(outcome);
    }

    // the grade stands even if issuance fails; the learner can retry later
    match issuer.issue_if_eligible(user_id, outcome.attempt.scope).await {
        Ok(Some(issued)) => {
            outcome.notice = issued.artifact_error;
            outcome.certificate = Some(issued.certificate);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(user_id = %user_id, attempt_id = %outcome.attempt.id, error = %e, "certificate issuance failed");
            outcome.notice = Some(format!("certificate not issued: {e}"));
        }
    }
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptResult {
    pub attempt: QuizAttempt,
    pub answers: Vec<QuizAnswer>,
    pub certificate: Option<Certificate>,
}

pub async fn attempt_results(store: &dyn Store, user_id: Uuid, attempt_id: Uuid) -> LmsResult<AttemptResult> {
    let attempt = owned_attempt(store, user_id, attempt_id).await?;
    let answers = store.list_answers(attempt.id).await?;
    let certificate = if attempt.passed {
        store.find_certificate(user_id, attempt.scope.into()).await?
    } else {
        None
    };
    Ok(AttemptResult { attempt, answers, certificate })
}

fn validate_question(text: &str, kind: QuestionKind, options: &[CreateOptionReq]) -> LmsResult<()> {
    if text.trim().is_empty() {
        return Err(LmsError::Validation("question text is required".into()));
    }
    let options: Vec<&CreateOptionReq> =
        options.iter().filter(|o| !o.text.trim().is_empty()).collect();
    if options.len() < 2 {
        return Err(LmsError::Validation("a question needs at least two options".into()));
    }
    let correct = options.iter().filter(|o| o.is_correct).count();
    match kind {
        QuestionKind::TrueFalse if options.len() != 2 => {
            Err(LmsError::Validation("true/false questions have exactly two options".into()))
        }
        QuestionKind::MultipleChoice | QuestionKind::TrueFalse if correct != 1 => {
            Err(LmsError::Validation("exactly one option must be correct".into()))
        }
        QuestionKind::MultipleAnswer if correct == 0 => {
            Err(LmsError::Validation("at least one option must be correct".into()))
        }
        _ => Ok(()),
    }
}

/// Adds a question to a course or module bank. Blank options are dropped.
pub async fn add_question(store: &dyn Store, req: CreateQuestionReq) -> LmsResult<Question> {
    validate_question(&req.text, req.kind, &req.options)?;
    match req.scope {
        Scope::Course(id) => {
            store.get_course(id).await?.ok_or(LmsError::NotFound("course"))?;
        }
        Scope::Module(id) => {
            eligibility::load_module(store, id).await?;
        }
    }
    let question = Question {
        id: Uuid::new_v4(),
        scope: req.scope,
        text: req.text,
        kind: req.kind,
        topic: req.topic,
        difficulty: req.difficulty.unwrap_or_else(|| "medium".into()),
        points: req.points.unwrap_or(1),
        explanation: req.explanation,
        options: build_options(req.options),
        created_at: Utc::now(),
    };
    store.insert_question(&question).await?;
    tracing::info!(question_id = %question.id, scope = %question.scope, "question added");
    Ok(question)
}

fn build_options(options: Vec<CreateOptionReq>) -> Vec<QuestionOption> {
    options
        .into_iter()
        .filter(|o| !o.text.trim().is_empty())
        .enumerate()
        .map(|(i, o)| QuestionOption {
            id: Uuid::new_v4(),
            text: o.text,
            is_correct: o.is_correct,
            order_index: i as i32 + 1,
        })
        .collect()
}

/// Rewrites a question and replaces its options. Past answers keep the
/// option ids they recorded.
pub async fn edit_question(store: &dyn Store, question_id: Uuid, req: EditQuestionReq) -> LmsResult<Question> {
    validate_question(&req.text, req.kind, &req.options)?;
    let existing = store
        .get_questions(&[question_id])
        .await?
        .into_iter()
        .next()
        .ok_or(LmsError::NotFound("question"))?;
    let question = Question {
        text: req.text,
        kind: req.kind,
        topic: req.topic,
        difficulty: req.difficulty.unwrap_or(existing.difficulty),
        points: req.points.unwrap_or(existing.points),
        explanation: req.explanation,
        options: build_options(req.options),
        ..existing
    };
    if !store.update_question(&question).await? {
        return Err(LmsError::NotFound("question"));
    }
    tracing::info!(question_id = %question.id, scope = %question.scope, "question updated");
    Ok(question)
}

pub async fn delete_question(store: &dyn Store, question_id: Uuid) -> LmsResult<()> {
    if !store.delete_question(question_id).await? {
        return Err(LmsError::NotFound("question"));
    }
    tracing::info!(question_id = %question_id, "question deleted");
    Ok(())
}
