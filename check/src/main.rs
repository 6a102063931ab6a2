//! Find autograder failures on a Gradescope assignment and regrade them until they pass.

#![warn(clippy::all, clippy::pedantic)]

use gradescope_common::cli::{ConnectionArgs, init_logging, load_dotenv};
use gradescope_common::regrade::{build_worklist, run_until_validated};
use gradescope_common::{AUTOGRADER_WAIT_SECS, AssignmentId, CLIENT_VERSION, CourseId};

use anyhow::{Result, bail};
use clap::Parser;
use log::{debug, info, warn};
use simple_tqdm::Tqdm;
use std::{thread, time::Duration};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Gradescope course id
    course_id: CourseId,

    /// Gradescope assignment id
    assignment_id: AssignmentId,

    /// Seconds to give the autograder between rounds
    #[arg(long, default_value_t = AUTOGRADER_WAIT_SECS, env = "GRADESCOPE_INTERVAL")]
    interval: u64,

    /// Give up after this many rounds
    #[arg(long)]
    max_rounds: Option<usize>,

    #[command(flatten)]
    connection: ConnectionArgs,
}

/// Sleep for `secs` seconds, one tick per second on the progress bar.
fn wait_for_regrades(secs: u64, remaining: usize, quiet: bool) {
    info!("Waiting {secs}s for {remaining} submissions to regrade...");
    let tqdm_config = simple_tqdm::Config::new()
        .with_unit("s")
        .with_disable(quiet);
    let ticks = usize::try_from(secs).unwrap_or(usize::MAX);
    for _ in (0..ticks).tqdm_config(tqdm_config) {
        thread::sleep(Duration::from_secs(1));
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

    info!(
        "Gradescope autograder check v{CLIENT_VERSION}: course {}, assignment {}",
        cli.course_id, cli.assignment_id
    );

    let client = cli.connection.connect()?;
    let grades = client.fetch_grades(cli.course_id, cli.assignment_id)?;
    let worklist = build_worklist(&grades);
    info!(
        "{} of {} students have a zero-scored submission",
        worklist.len(),
        grades.len()
    );

    let report = run_until_validated(
        &client,
        cli.course_id,
        cli.assignment_id,
        worklist,
        |remaining| wait_for_regrades(cli.interval, remaining, cli.connection.quiet),
        cli.max_rounds,
    );

    if report.still_pending.is_empty() {
        info!("All submissions validated after {} rounds", report.rounds);
        return Ok(());
    }
    for pending in &report.still_pending {
        warn!("still pending: {pending} (submission {})", pending.submission_id);
    }
    bail!(
        "{} submissions still not processed after {} rounds",
        report.still_pending.len(),
        report.rounds
    )
}
