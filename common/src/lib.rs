//! A library with common utilities for automating a Gradescope assignment.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod cli;
pub mod client_api;
pub mod cookies;
pub mod regrade;
pub mod scrape;
pub mod upload;

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_BASE_URL: &str = "https://www.gradescope.com";
pub const DEFAULT_COOKIE_FILE: &str = "cookies.json";
pub const CSRF_TOKEN_HEADER: &str = "X-Csrf-Token";
pub const REQUEST_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_UPLOAD_THREADS: usize = 8;
pub const DEFAULT_UPLOAD_FILENAME: &str = "upload.txt";
/// How long to give the autograder between two passes over the worklist.
pub const AUTOGRADER_WAIT_SECS: u64 = 60;

pub type CourseId = u64;
pub type AssignmentId = u64;
pub type SubmissionId = u64;
pub type UserId = u64;

/// One student from the roster embedded in the submissions page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RosterEntry {
    pub id: UserId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub email: String,
}

/// Gradescope leaves `name`/`email` as `null` for some roster entries.
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl fmt::Display for RosterEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.email)
    }
}

/// The anti-forgery parameter name and value a page was rendered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub param: String,
    pub token: String,
}

/// A row from the "review grades" table.
/// `score` and `submission` are empty when the student never submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRow {
    pub name: String,
    pub email: String,
    pub score: Option<f64>,
    pub submission: Option<String>,
}

/// The state of a submission as reported by the submission viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    Processed,
    Failed,
    /// Anything else, usually still queued or regrading.
    Other(String),
}

impl SubmissionStatus {
    #[must_use]
    pub fn is_processed(&self) -> bool {
        matches!(self, SubmissionStatus::Processed)
    }
}

impl From<&str> for SubmissionStatus {
    fn from(status: &str) -> Self {
        match status {
            "processed" => SubmissionStatus::Processed,
            "failed" => SubmissionStatus::Failed,
            other => SubmissionStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmissionStatus::Processed => write!(f, "processed"),
            SubmissionStatus::Failed => write!(f, "failed"),
            SubmissionStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

/// Everything scraped from a single submission page.
#[derive(Debug, Clone)]
pub struct AutograderStatus {
    pub status: SubmissionStatus,
    pub autograder_results: serde_json::Value,
    pub csrf: CsrfToken,
}

/// A zero-scored submission that has not been seen in the `processed` state yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    pub submission_id: SubmissionId,
    pub name: String,
    pub email: String,
}

impl fmt::Display for PendingSubmission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_submission_status_from_str() {
        assert_eq!(
            SubmissionStatus::from("processed"),
            SubmissionStatus::Processed
        );
        assert_eq!(SubmissionStatus::from("failed"), SubmissionStatus::Failed);
        assert_eq!(
            SubmissionStatus::from("autograder_harness_started"),
            SubmissionStatus::Other("autograder_harness_started".to_string())
        );
    }

    #[test_log::test]
    fn test_only_processed_is_processed() {
        assert!(SubmissionStatus::Processed.is_processed());
        assert!(!SubmissionStatus::Failed.is_processed());
        assert!(!SubmissionStatus::Other("queued".to_string()).is_processed());
    }

    #[test_log::test]
    fn test_roster_entry_ignores_unknown_fields() {
        let entry: RosterEntry = serde_json::from_str(
            r#"{"id": 42, "name": "Ada Lovelace", "email": "ada@example.com", "sid": "A1"}"#,
        )
        .unwrap();
        assert_eq!(entry.id, 42);
        assert_eq!(entry.to_string(), "Ada Lovelace (ada@example.com)");
    }

    #[test_log::test]
    fn test_roster_entry_null_or_missing_fields_are_empty() {
        let entry: RosterEntry =
            serde_json::from_str(r#"{"id": 7, "name": null, "email": null}"#).unwrap();
        assert_eq!(entry.name, "");
        assert_eq!(entry.email, "");

        let entry: RosterEntry = serde_json::from_str(r#"{"id": 8}"#).unwrap();
        assert_eq!((entry.name.as_str(), entry.email.as_str()), ("", ""));
    }
}
