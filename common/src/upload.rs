//! Choosing who to upload for, and fanning the uploads out over a thread pool.

use crate::client_api::GradescopeClient;
use crate::{AssignmentId, CourseId, CsrfToken, DEFAULT_UPLOAD_FILENAME, RosterEntry, UserId};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error};
use rayon::prelude::*;
use simple_tqdm::ParTqdm;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Which students get a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    All,
    Email(String),
}

/// The file attached to every upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub filename: String,
    pub content: Vec<u8>,
}

impl Default for UploadFile {
    /// An empty placeholder file.
    fn default() -> Self {
        Self {
            filename: DEFAULT_UPLOAD_FILENAME.to_string(),
            content: Vec::new(),
        }
    }
}

impl UploadFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} is not a file", path.display()))?;
        Ok(Self { filename, content })
    }
}

/// One upload on behalf of one student.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub owner_id: UserId,
    pub csrf: CsrfToken,
    pub file: UploadFile,
}

impl UploadRequest {
    /// The text fields of the multipart form, in the order they are sent.
    #[must_use]
    pub fn form_fields(&self) -> Vec<(String, String)> {
        vec![
            (self.csrf.param.clone(), self.csrf.token.clone()),
            ("submission[owner_id]".to_string(), self.owner_id.to_string()),
            ("submission[method]".to_string(), "upload".to_string()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub student: RosterEntry,
    pub error: String,
}

/// Tally of a bulk upload run.
#[derive(Debug, Clone, Default)]
pub struct UploadSummary {
    pub succeeded: usize,
    pub failed: Vec<UploadFailure>,
}

impl UploadSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

/// Pick the roster entries to upload for. Each student appears at most once.
pub fn select_targets(roster: &[RosterEntry], target: &UploadTarget) -> Result<Vec<RosterEntry>> {
    match target {
        UploadTarget::All => {
            let mut seen = HashSet::new();
            Ok(roster
                .iter()
                .filter(|entry| seen.insert(entry.id))
                .cloned()
                .collect())
        }
        UploadTarget::Email(email) => {
            let wanted = email.trim();
            roster
                .iter()
                .find(|entry| entry.email.trim().eq_ignore_ascii_case(wanted))
                .cloned()
                .map(|entry| vec![entry])
                .ok_or_else(|| anyhow!("Failed to find user email {wanted} in the roster!"))
        }
    }
}

/// Upload `file` for every target on a pool of `threads` workers.
///
/// Requests are independent: a failure is logged and counted, never retried.
#[allow(clippy::too_many_arguments)]
pub fn run_uploads(
    client: &GradescopeClient,
    course_id: CourseId,
    assignment_id: AssignmentId,
    targets: &[RosterEntry],
    csrf: &CsrfToken,
    file: &UploadFile,
    threads: usize,
    show_progress: bool,
) -> Result<UploadSummary> {
    if threads == 0 {
        bail!("At least one upload thread is required");
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Failed to build upload thread pool")?;

    let tqdm_config = simple_tqdm::Config::new()
        .with_unit("uploads")
        .with_disable(!show_progress);

    let results: Vec<(RosterEntry, Result<()>)> = pool.install(|| {
        targets
            .par_iter()
            .tqdm_config(tqdm_config)
            .map(|student| {
                let request = UploadRequest {
                    owner_id: student.id,
                    csrf: csrf.clone(),
                    file: file.clone(),
                };
                let result = client.upload(course_id, assignment_id, &request);
                (student.clone(), result)
            })
            .collect()
    });

    let mut summary = UploadSummary::default();
    for (student, result) in results {
        match result {
            Ok(()) => {
                debug!("Uploaded for {student}");
                summary.succeeded += 1;
            }
            Err(e) => {
                error!("Upload failed for {student}: {e:#}");
                summary.failed.push(UploadFailure {
                    student,
                    error: format!("{e:#}"),
                });
            }
        }
    }
    Ok(summary)
}
