//! Bulk upload placeholder submissions for a Gradescope assignment.

#![warn(clippy::all, clippy::pedantic)]

use gradescope_common::cli::{ConnectionArgs, init_logging, load_dotenv};
use gradescope_common::upload::{UploadFile, UploadTarget, run_uploads, select_targets};
use gradescope_common::{AssignmentId, CLIENT_VERSION, CourseId, DEFAULT_UPLOAD_THREADS};

use anyhow::{Result, bail};
use clap::{ArgGroup, Parser};
use log::{debug, info, warn};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(group(ArgGroup::new("target").required(true).args(["all", "email"])))]
pub struct Cli {
    /// Gradescope course id
    course_id: CourseId,

    /// Gradescope assignment id
    assignment_id: AssignmentId,

    /// Upload a file for all students
    #[arg(long)]
    all: bool,

    /// Email of user to upload a file for
    #[arg(long)]
    email: Option<String>,

    /// Maximum number of threads to use for upload requests
    #[arg(short, long, default_value_t = DEFAULT_UPLOAD_THREADS, env = "GRADESCOPE_THREADS")]
    threads: usize,

    /// Upload this file instead of an empty placeholder
    #[arg(long)]
    file: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,
}

impl Cli {
    fn target(&self) -> UploadTarget {
        match &self.email {
            Some(email) if !self.all => UploadTarget::Email(email.clone()),
            _ => UploadTarget::All,
        }
    }
}

fn main() -> Result<()> {
    let dotenv_problem = load_dotenv();
    let cli = Cli::parse();
    init_logging(cli.connection.log_level());
    if let Some(e) = dotenv_problem {
        warn!("Ignoring .env: {e}");
    }
    debug!("CLI Inputs: {cli:?}");

    if cli.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let file = match &cli.file {
        Some(path) => UploadFile::from_path(path)?,
        None => UploadFile::default(),
    };

    info!(
        "Gradescope upload v{CLIENT_VERSION}: course {}, assignment {}, {} threads",
        cli.course_id, cli.assignment_id, cli.threads
    );

    let client = cli.connection.connect()?;
    let (roster, csrf) = client.fetch_submission_page(cli.course_id, cli.assignment_id)?;
    let targets = select_targets(&roster, &cli.target())?;
    info!(
        "Uploading {} ({} bytes) for {} of {} students",
        file.filename,
        file.content.len(),
        targets.len(),
        roster.len()
    );

    let summary = run_uploads(
        &client,
        cli.course_id,
        cli.assignment_id,
        &targets,
        &csrf,
        &file,
        cli.threads,
        !cli.connection.quiet,
    )?;

    info!(
        "Uploaded {}/{} submissions",
        summary.succeeded,
        summary.total()
    );
    if !summary.failed.is_empty() {
        for failure in &summary.failed {
            eprintln!("  {}: {}", failure.student, failure.error);
        }
        bail!("{} uploads failed", summary.failed.len());
    }
    Ok(())
}
