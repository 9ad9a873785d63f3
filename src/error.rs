use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::eligibility::Tally;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum LmsError {
    #[error("complete all content before taking the quiz (videos {}/{}, interactive modules {}/{})",
        .videos.completed, .videos.total, .interactive.completed, .interactive.total)]
    PrerequisiteNotMet { videos: Tally, interactive: Tally },
    #[error("this quiz has already been completed")]
    AlreadyCompleted,
    #[error("not eligible for a certificate: {0}")]
    NotEligible(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("certificate already issued for this scope")]
    DuplicateIssuance,
    #[error("must watch {0} to mark complete")]
    CompletionRejected(&'static str),
    #[error("no questions available for this quiz yet")]
    EmptyQuestionBank,
    #[error("{0}")]
    Validation(String),
    #[error("missing or unknown user")]
    Unauthorized,
    #[error("permission denied")]
    Forbidden,
    #[error("certificate document not available: {0}")]
    ArtifactUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LmsError {
    pub fn kind(&self) -> &'static str {
        match self {
            LmsError::PrerequisiteNotMet { .. } => "prerequisite_not_met",
            LmsError::AlreadyCompleted => "already_completed",
            LmsError::NotEligible(_) => "not_eligible",
            LmsError::NotFound(_) => "not_found",
            LmsError::DuplicateIssuance => "duplicate_issuance",
            LmsError::CompletionRejected(_) => "completion_rejected",
            LmsError::EmptyQuestionBank => "empty_question_bank",
            LmsError::Validation(_) => "validation",
            LmsError::Unauthorized => "unauthorized",
            LmsError::Forbidden => "forbidden",
            LmsError::ArtifactUnavailable(_) => "artifact_unavailable",
            LmsError::Store(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            LmsError::PrerequisiteNotMet { .. }
            | LmsError::AlreadyCompleted
            | LmsError::DuplicateIssuance
            | LmsError::EmptyQuestionBank => StatusCode::CONFLICT,
            LmsError::NotEligible(_) | LmsError::CompletionRejected(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LmsError::NotFound(_) => StatusCode::NOT_FOUND,
            LmsError::Validation(_) => StatusCode::BAD_REQUEST,
            LmsError::Unauthorized => StatusCode::UNAUTHORIZED,
            LmsError::Forbidden => StatusCode::FORBIDDEN,
            LmsError::ArtifactUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LmsError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LmsError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
        }
        let message = match &self {
            // storage details stay in the log
            LmsError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (
            status,
            Json(serde_json::json!({ "error": message, "kind": self.kind() })),
        )
            .into_response()
    }
}

pub type LmsResult<T> = Result<T, LmsError>;
