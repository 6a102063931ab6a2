//! Finding zero scores caused by autograder failures and regrading them.
//!
//! A zero on the review-grades page is either a real zero or a run where the
//! autograder itself broke. The submission page tells them apart: only a
//! `processed` submission has a trustworthy score. Everything else gets a
//! regrade and is checked again on the next round.

use crate::client_api::GradescopeClient;
use crate::scrape::submission_id_from_url;
use crate::{
    AssignmentId, AutograderStatus, CourseId, CsrfToken, GradeRow, PendingSubmission,
    SubmissionId, SubmissionStatus,
};
use anyhow::Result;
use log::{debug, error, info, warn};

/// The two calls the check loop needs, so it can run without a network.
pub trait AutograderApi {
    fn fetch_autograder_status(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        submission_id: SubmissionId,
    ) -> Result<AutograderStatus>;

    fn regrade_submission(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        submission_id: SubmissionId,
        csrf: &CsrfToken,
    ) -> Result<()>;
}

impl AutograderApi for GradescopeClient {
    fn fetch_autograder_status(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        submission_id: SubmissionId,
    ) -> Result<AutograderStatus> {
        GradescopeClient::fetch_autograder_status(self, course_id, assignment_id, submission_id)
    }

    fn regrade_submission(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        submission_id: SubmissionId,
        csrf: &CsrfToken,
    ) -> Result<()> {
        GradescopeClient::regrade_submission(self, course_id, assignment_id, submission_id, csrf)
    }
}

/// Keep only zero-scored rows that link to a submission.
#[must_use]
pub fn build_worklist(rows: &[GradeRow]) -> Vec<PendingSubmission> {
    rows.iter()
        .filter(|row| row.score == Some(0.0))
        .filter_map(|row| {
            let link = row.submission.as_deref()?;
            let Some(submission_id) = submission_id_from_url(link) else {
                warn!(
                    "Skipping {} ({}): unexpected submission link {link:?}",
                    row.name, row.email
                );
                return None;
            };
            Some(PendingSubmission {
                submission_id,
                name: row.name.clone(),
                email: row.email.clone(),
            })
        })
        .collect()
}

/// Check one submission and regrade it unless the autograder finished.
///
/// Returns `true` when the submission is validated and needs nothing more.
pub fn validate_and_fix<A: AutograderApi>(
    api: &A,
    course_id: CourseId,
    assignment_id: AssignmentId,
    pending: &PendingSubmission,
) -> Result<bool> {
    let autograder = api.fetch_autograder_status(course_id, assignment_id, pending.submission_id)?;
    debug!(
        "Autograder results for {pending}: {}",
        autograder.autograder_results
    );

    match &autograder.status {
        SubmissionStatus::Processed => {
            info!("processed: {pending}");
            return Ok(true);
        }
        SubmissionStatus::Failed => warn!("failed: {pending}"),
        // probably still regrading from last round; regrade anyway to be safe
        SubmissionStatus::Other(status) => warn!("{status}: {pending}"),
    }

    info!("Regrading submission {} for {pending}", pending.submission_id);
    api.regrade_submission(
        course_id,
        assignment_id,
        pending.submission_id,
        &autograder.csrf,
    )?;
    Ok(false)
}

/// Validate every pending submission once. Returns the ones still pending.
///
/// An error on one submission is logged and the submission stays pending.
pub fn check_round<A: AutograderApi>(
    api: &A,
    course_id: CourseId,
    assignment_id: AssignmentId,
    worklist: Vec<PendingSubmission>,
) -> Vec<PendingSubmission> {
    worklist
        .into_iter()
        .filter(
            |pending| match validate_and_fix(api, course_id, assignment_id, pending) {
                Ok(validated) => !validated,
                Err(e) => {
                    error!("Could not check {pending}: {e:#}");
                    true
                }
            },
        )
        .collect()
}

/// Outcome of [`run_until_validated`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub rounds: usize,
    pub still_pending: Vec<PendingSubmission>,
}

/// Run [`check_round`] until nothing is pending, calling `wait` between rounds.
///
/// With `max_rounds` set, gives up after that many rounds.
pub fn run_until_validated<A, W>(
    api: &A,
    course_id: CourseId,
    assignment_id: AssignmentId,
    mut worklist: Vec<PendingSubmission>,
    mut wait: W,
    max_rounds: Option<usize>,
) -> RoundReport
where
    A: AutograderApi,
    W: FnMut(usize),
{
    let mut rounds = 0;
    while !worklist.is_empty() {
        if max_rounds.is_some_and(|max| rounds >= max) {
            break;
        }
        rounds += 1;
        info!(
            "Round {rounds}: validating {} submissions...",
            worklist.len()
        );
        worklist = check_round(api, course_id, assignment_id, worklist);

        let done = max_rounds.is_some_and(|max| rounds >= max);
        if !worklist.is_empty() && !done {
            wait(worklist.len());
        }
    }

    RoundReport {
        rounds,
        still_pending: worklist,
    }
}
