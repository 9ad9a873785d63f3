use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_PASSING_SCORE: i32 = 80;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    HeadOfRisk,
    RiskComplianceSpecialist,
    Banker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::HeadOfRisk => "head_of_risk",
            Role::RiskComplianceSpecialist => "risk_compliance_specialist",
            Role::Banker => "banker",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "head_of_risk" => Some(Role::HeadOfRisk),
            "risk_compliance_specialist" => Some(Role::RiskComplianceSpecialist),
            "banker" => Some(Role::Banker),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub department: String,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: Option<Uuid>, // nulled when the creator is deleted
    pub is_published: bool,
    pub passing_score: i32,
    pub target_departments: Vec<String>,
    /// Days allowed to finish after enrolling. `None` or 0 disables the limit.
    pub completion_time_limit_days: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// What a content unit is, with the measure its completion is judged by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// `duration_secs == 0` means the duration is unknown.
    Video { duration_secs: i32 },
    /// `total_slides == 0` means the slide count is unknown.
    Interactive { total_slides: i32, passing_score: i32 },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContentUnit {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub order_index: i32,
    #[serde(flatten)]
    pub kind: UnitKind,
    pub created_at: DateTime<Utc>,
}

impl ContentUnit {
    pub fn is_video(&self) -> bool {
        matches!(self.kind, UnitKind::Video { .. })
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self.kind, UnitKind::Interactive { .. })
    }
}

/// The thing a quiz is taken against.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Course(Uuid),
    Module(Uuid),
}

impl Scope {
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Course(_) => "course",
            Scope::Module(_) => "module",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Scope::Course(id) | Scope::Module(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Scope> {
        match kind {
            "course" => Some(Scope::Course(id)),
            "module" => Some(Scope::Module(id)),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// The thing a certificate is issued for. `Program` is the whole-program
/// certificate earned from the cross-course average.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum CertificateScope {
    Course(Uuid),
    Module(Uuid),
    Program,
}

impl CertificateScope {
    pub fn kind(&self) -> &'static str {
        match self {
            CertificateScope::Course(_) => "course",
            CertificateScope::Module(_) => "module",
            CertificateScope::Program => "program",
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            CertificateScope::Course(id) | CertificateScope::Module(id) => Some(*id),
            CertificateScope::Program => None,
        }
    }

    pub fn from_parts(kind: &str, id: Option<Uuid>) -> Option<CertificateScope> {
        match (kind, id) {
            ("course", Some(id)) => Some(CertificateScope::Course(id)),
            ("module", Some(id)) => Some(CertificateScope::Module(id)),
            ("program", None) => Some(CertificateScope::Program),
            _ => None,
        }
    }
}

impl From<Scope> for CertificateScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Course(id) => CertificateScope::Course(id),
            Scope::Module(id) => CertificateScope::Module(id),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub unit_id: Uuid,
    pub watched_secs: i32,
    pub last_position: i32,
    pub highest_slide: i32,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(user_id: Uuid, unit_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            unit_id,
            watched_secs: 0,
            last_position: 0,
            highest_slide: 0,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    MultipleAnswer,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "multiple_choice",
            QuestionKind::TrueFalse => "true_false",
            QuestionKind::MultipleAnswer => "multiple_answer",
        }
    }

    pub fn parse(s: &str) -> Option<QuestionKind> {
        match s {
            "multiple_choice" => Some(QuestionKind::MultipleChoice),
            "true_false" => Some(QuestionKind::TrueFalse),
            "multiple_answer" => Some(QuestionKind::MultipleAnswer),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuestionOption {
    pub id: Uuid,
    pub text: String,
    pub is_correct: bool,
    pub order_index: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub scope: Scope,
    pub text: String,
    pub kind: QuestionKind,
    pub topic: String,
    pub difficulty: String,
    pub points: i32,
    pub explanation: String,
    pub options: Vec<QuestionOption>, // ordered by order_index
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: Scope,
    /// Fixed when the attempt is created; never re-derived from the bank.
    pub question_ids: Vec<Uuid>,
    pub total_questions: i32,
    pub correct_answers: i32,
    pub score: Option<f64>,
    pub passed: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QuizAttempt {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QuizAnswer {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub question_id: Option<Uuid>,
    pub selected_option_ids: Vec<Uuid>,
    pub is_correct: bool,
    pub answered_at: DateTime<Utc>,
}

/// Grading result written onto an attempt in one step.
#[derive(Debug, Clone)]
pub struct AttemptCompletion {
    pub correct_answers: i32,
    pub score: f64,
    pub passed: bool,
    pub completed_at: DateTime<Utc>,
    pub answers: Vec<QuizAnswer>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Certificate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scope: CertificateScope,
    pub certificate_number: String,
    pub score: f64,
    pub verification_url: String,
    #[serde(skip)]
    pub qr_code: Option<Vec<u8>>,
    #[serde(skip)]
    pub document: Option<Vec<u8>>,
    pub is_valid: bool,
    pub issued_at: DateTime<Utc>,
}

impl Certificate {
    pub fn has_artifacts(&self) -> bool {
        self.qr_code.is_some() && self.document.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Enrollment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// --- request payloads ---

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProgressUpdateReq {
    // players post these as numbers or as form-ish strings
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub watched_duration: i32,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub last_position: i32,
    #[serde(default)]
    pub action: Option<ProgressAction>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressAction {
    Complete,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlideUpdateReq {
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub slide: Option<i32>,
    /// Raw `cmi.core.lesson_location`, used when `slide` is absent.
    #[serde(default)]
    pub lesson_location: Option<String>,
    #[serde(default)]
    pub lesson_status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateCourseReq {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_published: bool,
    pub passing_score: Option<i32>,
    #[serde(default)]
    pub target_departments: Vec<String>,
    pub completion_time_limit_days: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateUnitReq {
    pub title: String,
    #[serde(default)]
    pub order_index: i32,
    #[serde(flatten)]
    pub kind: UnitKind,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateQuestionReq {
    pub scope: Scope,
    pub text: String,
    pub kind: QuestionKind,
    #[serde(default)]
    pub topic: String,
    pub difficulty: Option<String>,
    pub points: Option<i32>,
    #[serde(default)]
    pub explanation: String,
    pub options: Vec<CreateOptionReq>,
}

/// Replaces a question's content. The bank it belongs to does not change.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EditQuestionReq {
    pub text: String,
    pub kind: QuestionKind,
    #[serde(default)]
    pub topic: String,
    pub difficulty: Option<String>,
    pub points: Option<i32>,
    #[serde(default)]
    pub explanation: String,
    pub options: Vec<CreateOptionReq>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateOptionReq {
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BulkEnrollReq {
    pub department: String,
}
