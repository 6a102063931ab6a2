//! Extracting data from Gradescope pages.
//!
//! Everything that depends on how Gradescope renders its pages lives here, so
//! when the site changes this is the only module that needs patching.

use crate::{AutograderStatus, CsrfToken, GradeRow, RosterEntry, SubmissionId, SubmissionStatus};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::sync::LazyLock;

const LOGGED_IN_WARNING: &str = "You must be logged out to access this page.";
const INVALID_LOGIN_MESSAGE: &str = "Invalid email/password combination";

static ROSTER_ASSIGNMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gon\.roster\s*=\s*").unwrap());
static SUBMISSION_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"courses/(?P<course_id>\d+)/assignments/(?P<assignment_id>\d+)/submissions/(?P<submission_id>\d+)")
        .unwrap()
});

/// What the login page tells us about the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    LoggedIn,
    LoginForm { authenticity_token: String },
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Invalid selector {css:?}: {e:?}"))
}

/// Element text with runs of whitespace collapsed.
fn element_text(element: &ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn meta_content(page: &Html, name: &str) -> Result<String> {
    let meta = selector(&format!(r#"meta[name="{name}"]"#))?;
    page.select(&meta)
        .next()
        .and_then(|tag| tag.value().attr("content"))
        .map(str::to_string)
        .ok_or_else(|| anyhow!("<meta name=\"{name}\"> tag not found"))
}

fn csrf_from_page(page: &Html) -> Result<CsrfToken> {
    Ok(CsrfToken {
        param: meta_content(page, "csrf-param")?,
        token: meta_content(page, "csrf-token")?,
    })
}

/// Decide whether a response from `/login` means we already have a session.
///
/// A logged-in session gets a JSON warning back, or at least a page without
/// the login button. Otherwise the form's authenticity token is returned so
/// a login can be attempted.
pub fn parse_login_state(body: &str) -> Result<LoginState> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body)
        && json.get("warning").and_then(serde_json::Value::as_str) == Some(LOGGED_IN_WARNING)
    {
        return Ok(LoginState::LoggedIn);
    }

    let page = Html::parse_document(body);
    let login_button = selector(r#"input[type="submit"][value="Log In"]"#)?;
    if page.select(&login_button).next().is_none() {
        return Ok(LoginState::LoggedIn);
    }

    let token_input = selector(r#"form input[name="authenticity_token"]"#)?;
    let authenticity_token = page
        .select(&token_input)
        .next()
        .and_then(|input| input.value().attr("value"))
        .ok_or_else(|| anyhow!("Login form has no authenticity token"))?
        .to_string();
    Ok(LoginState::LoginForm { authenticity_token })
}

/// Whether a login response carries the "invalid credentials" alert.
pub fn login_rejected(body: &str) -> bool {
    let page = Html::parse_document(body);
    let Ok(alert_spans) = selector(".alert-error span") else {
        return false;
    };
    page.select(&alert_spans)
        .any(|span| element_text(&span).contains(INVALID_LOGIN_MESSAGE))
}

/// Read the CSRF parameter and token from a page's `<meta>` tags.
pub fn parse_csrf(html: &str) -> Result<CsrfToken> {
    csrf_from_page(&Html::parse_document(html))
}

/// Pull the `gon.roster` JSON out of the assignment submissions page.
pub fn parse_roster(html: &str) -> Result<Vec<RosterEntry>> {
    let page = Html::parse_document(html);
    let scripts = selector("script")?;

    for script in page.select(&scripts) {
        let text = script.text().collect::<String>();
        let Some(found) = ROSTER_ASSIGNMENT.find(&text) else {
            continue;
        };
        // the roster is followed by more gon assignments, so read exactly one value
        let mut values = serde_json::Deserializer::from_str(&text[found.end()..])
            .into_iter::<Vec<RosterEntry>>();
        let roster = values
            .next()
            .ok_or_else(|| anyhow!("Roster assignment has no value"))?
            .context("Failed to deserialize roster data")?;
        debug!("Found {} students in the roster", roster.len());
        return Ok(roster);
    }

    bail!("Failed to find roster data!")
}

/// Read the "review grades" table.
pub fn parse_grades_table(html: &str) -> Result<Vec<GradeRow>> {
    let page = Html::parse_document(html);
    let table = page
        .select(&selector("table.js-reviewGradesTable")?)
        .next()
        .ok_or_else(|| anyhow!("Grade table not found"))?;

    let mut name_idx = None;
    let mut email_idx = None;
    let mut score_idx = None;
    for (col_idx, header) in table.select(&selector("thead th")?).enumerate() {
        let header = element_text(&header).to_lowercase();
        if header.contains("name") {
            name_idx = Some(col_idx);
        } else if header.contains("email") {
            email_idx = Some(col_idx);
        } else if header.contains("score") {
            score_idx = Some(col_idx);
        }
    }
    let (Some(name_idx), Some(email_idx), Some(score_idx)) = (name_idx, email_idx, score_idx)
    else {
        bail!("Unable to find one of name, email, or score columns in the grades table");
    };

    let cell = selector("td")?;
    let link = selector("a")?;
    let mut rows = Vec::new();
    for (row_idx, row) in table.select(&selector("tbody tr")?).enumerate() {
        let cells: Vec<ElementRef> = row.select(&cell).collect();
        let needed = name_idx.max(email_idx).max(score_idx);
        if cells.len() <= needed {
            bail!(
                "Grade table row {row_idx} has {} cells, expected at least {}",
                cells.len(),
                needed + 1
            );
        }

        let name = element_text(&cells[name_idx]);
        let email = element_text(&cells[email_idx]);
        let submission = cells[name_idx]
            .select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);

        let score = if submission.is_some() {
            let score_text = element_text(&cells[score_idx]);
            match score_text.parse::<f64>() {
                Ok(score) => Some(score),
                Err(_) => {
                    warn!("Unreadable score {score_text:?} for {name} ({email})");
                    None
                }
            }
        } else {
            None
        };

        rows.push(GradeRow {
            name,
            email,
            score,
            submission,
        });
    }

    Ok(rows)
}

#[derive(Deserialize)]
struct SubmissionViewerProps {
    assignment_submission: SubmissionMetadata,
    #[serde(default)]
    autograder_results: serde_json::Value,
}

#[derive(Deserialize)]
struct SubmissionMetadata {
    status: String,
}

/// Read the autograder status out of a single submission page.
pub fn parse_submission_viewer(html: &str) -> Result<AutograderStatus> {
    let page = Html::parse_document(html);
    let csrf = csrf_from_page(&page)?;

    let viewer = page
        .select(&selector(
            r#"div[data-react-class="AssignmentSubmissionViewer"]"#,
        )?)
        .next()
        .ok_or_else(|| anyhow!("Cannot find submission viewer"))?;
    let props = viewer
        .value()
        .attr("data-react-props")
        .ok_or_else(|| anyhow!("Submission viewer component doesn't have data-react-props attr"))?;
    let props: SubmissionViewerProps =
        serde_json::from_str(props).context("Failed to deserialize submission viewer props")?;

    Ok(AutograderStatus {
        status: SubmissionStatus::from(props.assignment_submission.status.as_str()),
        autograder_results: props.autograder_results,
        csrf,
    })
}

/// Extract the submission id from a submission link.
pub fn submission_id_from_url(url: &str) -> Option<SubmissionId> {
    SUBMISSION_URL
        .captures(url)
        .and_then(|caps| caps.name("submission_id"))
        .and_then(|id| id.as_str().parse().ok())
}
