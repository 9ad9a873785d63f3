//! Course completion and certification service for an internal risk
//! training program: progress tracking, gated quizzes, and certificates.

pub mod access;
pub mod config;
pub mod eligibility;
pub mod enrollment;
pub mod error;
pub mod issuer;
pub mod ledger;
pub mod models;
pub mod quiz;
pub mod reports;
pub mod routes;
pub mod scorm;
pub mod store;

pub use routes::{router, AppState};
