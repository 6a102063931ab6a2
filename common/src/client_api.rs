//! Blocking client for the Gradescope endpoints, with proper error handling.

use crate::cookies::{CookieMap, load_cookie_file, parse_cookie_header, save_cookie_file};
use crate::scrape::{
    LoginState, login_rejected, parse_csrf, parse_grades_table, parse_login_state, parse_roster,
    parse_submission_viewer,
};
use crate::upload::UploadRequest;
use crate::{
    AssignmentId, AutograderStatus, CLIENT_VERSION, CSRF_TOKEN_HEADER, CourseId, CsrfToken,
    DEFAULT_BASE_URL, DEFAULT_MAX_RETRIES, GradeRow, REQUEST_TIMEOUT_SECS, RosterEntry,
    SubmissionId,
};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use reqwest::Url;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ORIGIN, REFERER};
use std::path::Path;
use std::sync::Arc;
use std::{thread, time::Duration};

/// Whether a failed page fetch is worth another attempt.
/// Timeouts, refused connections and DNS hiccups usually clear up on their own.
fn is_retryable_error(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

/// Short label for a failed fetch in retry warnings.
fn error_type_str(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection"
    } else if e.is_request() {
        "request/DNS"
    } else if e.is_body() {
        "body"
    } else if e.is_decode() {
        "decode"
    } else {
        "unknown"
    }
}

/// Generic retry logic for HTTP requests with exponential backoff.
/// Handles both network errors and 5xx server errors.
/// Takes a closure to process the successful response.
fn retry_request<F, P, T>(
    request_fn: F,
    process_response: P,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T>
where
    F: Fn() -> Result<Response, reqwest::Error>,
    P: Fn(Response) -> Result<T>,
{
    let max_retries = max_retries.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        let delay = base_delay * 2_u32.saturating_pow(attempts - 1);

        match request_fn() {
            Ok(response) => {
                if response.status().is_server_error() {
                    let status = response.status();
                    if attempts < max_retries {
                        warn!(
                            "Server error ({status}), retrying in {delay:?}... (attempt {attempts}/{max_retries})"
                        );
                        thread::sleep(delay);
                        continue;
                    }
                    return Err(anyhow!("Server error after {attempts} attempts: {status}"));
                }

                return process_response(response);
            }
            Err(e) => {
                if is_retryable_error(&e) && attempts < max_retries {
                    warn!(
                        "Network error ({}), retrying in {:?}... (attempt {}/{}): {}",
                        error_type_str(&e),
                        delay,
                        attempts,
                        max_retries,
                        e
                    );
                    thread::sleep(delay);
                    continue;
                }
                return Err(anyhow!(
                    "Network error ({}) after {attempts} attempts: {e}",
                    error_type_str(&e)
                ));
            }
        }
    }
}

/// Read a response body, failing on any non-success status.
fn success_text(response: Response) -> Result<String> {
    let status = response.status();
    let url = response.url().clone();
    let body = response.text().context("Failed to read response body")?;
    if !status.is_success() {
        bail!("Request to {url} failed (status {status})\nResponse: {body}");
    }
    Ok(body)
}

/// Connection settings for a [`GradescopeClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Attempts per page fetch, including the first one.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Login credentials. Anything missing is asked for interactively.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    fn resolve(&self) -> Result<(String, String)> {
        let email = match &self.email {
            Some(email) => email.clone(),
            None => dialoguer::Input::<String>::new()
                .with_prompt("Gradescope email")
                .interact_text()
                .context("Failed to read email")?,
        };
        let password = match &self.password {
            Some(password) => password.clone(),
            None => dialoguer::Password::new()
                .with_prompt("Gradescope password")
                .interact()
                .context("Failed to read password")?,
        };
        Ok((email, password))
    }
}

/// An authenticated session against Gradescope.
///
/// Cloning is cheap and clones share the same cookie jar, so one client can
/// be handed to every upload worker.
#[derive(Clone)]
pub struct GradescopeClient {
    http: Client,
    jar: Arc<Jar>,
    base_url: Url,
    config: ClientConfig,
}

impl GradescopeClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base URL {:?}", config.base_url))?;
        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(config.timeout)
            .user_agent(format!("gradescope-tools/{CLIENT_VERSION}"))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            jar,
            base_url,
            config,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid request path {path:?}"))
    }

    /// GET a page, retrying transient failures. Any status other than 2xx is an error.
    fn get_page(&self, path: &str) -> Result<String> {
        let url = self.url(path)?;
        debug!("GET {url}");
        retry_request(
            || self.http.get(url.clone()).send(),
            success_text,
            self.config.max_retries,
            self.config.retry_delay,
        )
    }

    /// Put cached cookies into the jar.
    pub fn restore_cookies(&self, cookies: &CookieMap) {
        for (name, value) in cookies {
            self.jar
                .add_cookie_str(&format!("{name}={value}; Path=/"), &self.base_url);
        }
    }

    /// The cookies the jar would send to Gradescope.
    pub fn cookies(&self) -> CookieMap {
        self.jar
            .cookies(&self.base_url)
            .and_then(|header| header.to_str().map(parse_cookie_header).ok())
            .unwrap_or_default()
    }

    fn login_page(&self) -> Result<LoginState> {
        let url = self.url("login")?;
        // a logged-in session gets an error status with a JSON warning, so don't require success
        let body = retry_request(
            || self.http.get(url.clone()).send(),
            |response| response.text().context("Failed to read login page"),
            self.config.max_retries,
            self.config.retry_delay,
        )?;
        parse_login_state(&body)
    }

    /// Check whether the cookies in the jar belong to a live session.
    pub fn is_logged_in(&self) -> Result<bool> {
        Ok(self.login_page()? == LoginState::LoggedIn)
    }

    /// Log in through the regular login form.
    pub fn login(&self, email: &str, password: &str) -> Result<()> {
        let authenticity_token = match self.login_page()? {
            LoginState::LoggedIn => {
                debug!("Already logged in");
                return Ok(());
            }
            LoginState::LoginForm { authenticity_token } => authenticity_token,
        };

        let url = self.url("login")?;
        let form = [
            ("utf8", "✓"),
            ("authenticity_token", authenticity_token.as_str()),
            ("session[email]", email),
            ("session[password]", password),
            ("session[remember_me]", "1"),
            ("commit", "Log In"),
            ("session[remember_me_sso]", "0"),
        ];
        let response = self
            .http
            .post(url.clone())
            .header(ORIGIN, self.base_url.origin().ascii_serialization())
            .header(REFERER, url.as_str())
            .form(&form)
            .send()
            .context("Network error while logging in")?;

        let status = response.status();
        let body = response.text().context("Failed to read login response")?;
        if !status.is_success() {
            bail!("Failed to log in; (status {status})\nResponse: {body}");
        }
        if login_rejected(&body) {
            bail!("Failed to log in; invalid email/password combination.");
        }
        Ok(())
    }

    /// Restore the session from the cookie cache, or log in and refresh the cache.
    pub fn authenticate(&self, cookie_file: &Path, credentials: &Credentials) -> Result<()> {
        if let Some(cookies) = load_cookie_file(cookie_file)? {
            info!("Restoring cookies from {}", cookie_file.display());
            self.restore_cookies(&cookies);
            if self.is_logged_in()? {
                info!("Session restored");
                return Ok(());
            }
            warn!("Cached session is no longer valid, logging in again");
        }

        let (email, password) = credentials.resolve()?;
        info!("Logging in as {email}");
        self.login(&email, &password)?;
        save_cookie_file(cookie_file, &self.cookies())?;
        info!("Saved cookies to {}", cookie_file.display());
        Ok(())
    }

    /// Fetch the roster and CSRF token from an assignment's submissions page.
    pub fn fetch_submission_page(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
    ) -> Result<(Vec<RosterEntry>, CsrfToken)> {
        let page = self
            .get_page(&format!(
                "courses/{course_id}/assignments/{assignment_id}/submissions"
            ))
            .context("Failed to fetch assignment page")?;
        Ok((parse_roster(&page)?, parse_csrf(&page)?))
    }

    /// Fetch every row of the "review grades" page.
    pub fn fetch_grades(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
    ) -> Result<Vec<GradeRow>> {
        let page = self
            .get_page(&format!(
                "courses/{course_id}/assignments/{assignment_id}/review_grades"
            ))
            .context("Failed to fetch grades page")?;
        parse_grades_table(&page)
    }

    pub fn fetch_autograder_status(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        submission_id: SubmissionId,
    ) -> Result<AutograderStatus> {
        let page = self
            .get_page(&format!(
                "courses/{course_id}/assignments/{assignment_id}/submissions/{submission_id}"
            ))
            .with_context(|| format!("Failed to fetch submission {submission_id}"))?;
        parse_submission_viewer(&page)
    }

    /// Ask the autograder to run a submission again. Not retried.
    pub fn regrade_submission(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        submission_id: SubmissionId,
        csrf: &CsrfToken,
    ) -> Result<()> {
        let url = self.url(&format!(
            "courses/{course_id}/assignments/{assignment_id}/submissions/{submission_id}/regrade"
        ))?;
        let response = self
            .http
            .post(url)
            .header(CSRF_TOKEN_HEADER, &csrf.token)
            .send()
            .context("Network error while requesting regrade")?;
        if !response.status().is_success() {
            bail!(
                "Bad response when regrading submission id {submission_id} (course {course_id}, assignment {assignment_id}): {}",
                response.status()
            );
        }
        Ok(())
    }

    /// Upload a file on behalf of a student. Not retried.
    pub fn upload(
        &self,
        course_id: CourseId,
        assignment_id: AssignmentId,
        request: &UploadRequest,
    ) -> Result<()> {
        let url = self.url(&format!(
            "courses/{course_id}/assignments/{assignment_id}/submissions"
        ))?;

        let mut form = Form::new();
        for (name, value) in request.form_fields() {
            form = form.text(name, value);
        }
        let file = Part::bytes(request.file.content.clone()).file_name(request.file.filename.clone());
        form = form.part("submission[files][]", file);

        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .context("Network error while uploading")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Failed to upload file; (status {status})\nResponse: {body}");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_client(server: &mockito::Server) -> GradescopeClient {
    GradescopeClient::new(ClientConfig {
        base_url: server.url(),
        timeout: Duration::from_secs(5),
        max_retries: 3,
        retry_delay: Duration::ZERO,
    })
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubmissionStatus;
    use crate::scrape::fixtures::*;
    use crate::upload::UploadFile;
    use mockito::Matcher;

    #[test_log::test]
    fn test_login_posts_form_and_keeps_cookie() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/login")
            .with_body(login_page())
            .create();
        let post = server
            .mock("POST", "/login")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("authenticity_token".into(), "login-token".into()),
                Matcher::UrlEncoded("session[email]".into(), "ta@example.com".into()),
                Matcher::UrlEncoded("session[password]".into(), "hunter2".into()),
                Matcher::UrlEncoded("session[remember_me]".into(), "1".into()),
            ]))
            .with_header("set-cookie", "_gradescope_session=abc123; path=/")
            .with_body(dashboard_page())
            .create();

        let client = test_client(&server);
        client.login("ta@example.com", "hunter2").unwrap();

        post.assert();
        assert_eq!(client.cookies()["_gradescope_session"], "abc123");
    }

    #[test_log::test]
    fn test_login_rejected_credentials() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/login")
            .with_body(login_page())
            .create();
        server
            .mock("POST", "/login")
            .with_body(r#"<div class="alert-error"><span>Invalid email/password combination.</span></div>"#)
            .create();

        let client = test_client(&server);
        let err = client.login("ta@example.com", "wrong").unwrap_err();
        assert!(err.to_string().contains("invalid email/password"));
    }

    #[test_log::test]
    fn test_authenticate_reuses_cookie_file() {
        let mut server = mockito::Server::new();
        let check = server
            .mock("GET", "/login")
            .match_header("cookie", Matcher::Regex("_gradescope_session=cached".into()))
            .with_status(401)
            .with_body(r#"{"warning":"You must be logged out to access this page."}"#)
            .create();
        let post = server.mock("POST", "/login").expect(0).create();

        let dir = tempfile::tempdir().unwrap();
        let cookie_file = dir.path().join("cookies.json");
        save_cookie_file(
            &cookie_file,
            &CookieMap::from([("_gradescope_session".to_string(), "cached".to_string())]),
        )
        .unwrap();

        let client = test_client(&server);
        client
            .authenticate(&cookie_file, &Credentials::default())
            .unwrap();

        check.assert();
        post.assert();
    }

    #[test_log::test]
    fn test_authenticate_saves_cookies_after_login() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/login")
            .with_body(login_page())
            .create();
        server
            .mock("POST", "/login")
            .with_header("set-cookie", "_gradescope_session=fresh; path=/")
            .with_body(dashboard_page())
            .create();

        let dir = tempfile::tempdir().unwrap();
        let cookie_file = dir.path().join("cookies.json");
        let credentials = Credentials {
            email: Some("ta@example.com".to_string()),
            password: Some("hunter2".to_string()),
        };

        let client = test_client(&server);
        client.authenticate(&cookie_file, &credentials).unwrap();

        let saved = load_cookie_file(&cookie_file).unwrap().unwrap();
        assert_eq!(saved["_gradescope_session"], "fresh");
    }

    #[test_log::test]
    fn test_authenticate_logs_in_again_when_session_is_stale() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/login")
            .with_body(login_page())
            .create();
        let post = server
            .mock("POST", "/login")
            .with_header("set-cookie", "_gradescope_session=fresh; path=/")
            .with_body(dashboard_page())
            .expect(1)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let cookie_file = dir.path().join("cookies.json");
        save_cookie_file(
            &cookie_file,
            &CookieMap::from([("_gradescope_session".to_string(), "stale".to_string())]),
        )
        .unwrap();
        let credentials = Credentials {
            email: Some("ta@example.com".to_string()),
            password: Some("hunter2".to_string()),
        };

        let client = test_client(&server);
        client.authenticate(&cookie_file, &credentials).unwrap();

        post.assert();
        let saved = load_cookie_file(&cookie_file).unwrap().unwrap();
        assert_eq!(saved["_gradescope_session"], "fresh");
    }

    #[test_log::test]
    fn test_page_fetch_retries_network_errors() {
        // nothing listens on port 1
        let client = GradescopeClient::new(ClientConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::ZERO,
        })
        .unwrap();

        let err = client.fetch_grades(1, 2).unwrap_err();
        assert!(
            format!("{err:#}").contains("Network error (connection) after 3 attempts"),
            "{err:#}"
        );
    }

    #[test_log::test]
    fn test_page_fetch_retries_server_errors() {
        let mut server = mockito::Server::new();
        let failing = server
            .mock("GET", "/courses/1/assignments/2/review_grades")
            .with_status(503)
            .expect(3)
            .create();

        let client = test_client(&server);
        let err = client.fetch_grades(1, 2).unwrap_err();

        failing.assert();
        assert!(format!("{err:#}").contains("Server error after 3 attempts"));
    }

    #[test_log::test]
    fn test_page_fetch_does_not_retry_client_errors() {
        let mut server = mockito::Server::new();
        let missing = server
            .mock("GET", "/courses/1/assignments/2/submissions")
            .with_status(404)
            .expect(1)
            .create();

        let client = test_client(&server);
        assert!(client.fetch_submission_page(1, 2).is_err());
        missing.assert();
    }

    #[test_log::test]
    fn test_fetch_submission_page() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/courses/1/assignments/2/submissions")
            .with_body(submissions_page())
            .create();

        let client = test_client(&server);
        let (roster, csrf) = client.fetch_submission_page(1, 2).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(csrf.param, "authenticity_token");
    }

    #[test_log::test]
    fn test_fetch_grades_and_status() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/courses/1/assignments/2/review_grades")
            .with_body(grades_page())
            .create();
        server
            .mock("GET", "/courses/1/assignments/2/submissions/100")
            .with_body(submission_page("processed"))
            .create();

        let client = test_client(&server);
        assert_eq!(client.fetch_grades(1, 2).unwrap().len(), 4);
        assert_eq!(
            client.fetch_autograder_status(1, 2, 100).unwrap().status,
            SubmissionStatus::Processed
        );
    }

    #[test_log::test]
    fn test_regrade_sends_csrf_header() {
        let mut server = mockito::Server::new();
        let regrade = server
            .mock("POST", "/courses/1/assignments/2/submissions/100/regrade")
            .match_header("x-csrf-token", "tok3n==")
            .create();

        let client = test_client(&server);
        let csrf = CsrfToken {
            param: "authenticity_token".to_string(),
            token: "tok3n==".to_string(),
        };
        client.regrade_submission(1, 2, 100, &csrf).unwrap();
        regrade.assert();
    }

    #[test_log::test]
    fn test_regrade_failure_is_error() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/courses/1/assignments/2/submissions/100/regrade")
            .with_status(422)
            .create();

        let client = test_client(&server);
        let csrf = CsrfToken {
            param: "authenticity_token".to_string(),
            token: "tok3n==".to_string(),
        };
        let err = client.regrade_submission(1, 2, 100, &csrf).unwrap_err();
        assert!(err.to_string().contains("submission id 100"));
    }

    #[test_log::test]
    fn test_upload_sends_multipart_form() {
        let mut server = mockito::Server::new();
        let upload = server
            .mock("POST", "/courses/1/assignments/2/submissions")
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="authenticity_token"\s+tok3n=="#.into()),
                Matcher::Regex(r#"name="submission\[owner_id\]"\s+11"#.into()),
                Matcher::Regex(r#"name="submission\[method\]"\s+upload"#.into()),
                Matcher::Regex(r#"name="submission\[files\]\[\]"; filename="upload.txt""#.into()),
            ]))
            .create();

        let client = test_client(&server);
        let request = UploadRequest {
            owner_id: 11,
            csrf: CsrfToken {
                param: "authenticity_token".to_string(),
                token: "tok3n==".to_string(),
            },
            file: UploadFile::default(),
        };
        client.upload(1, 2, &request).unwrap();
        upload.assert();
    }
}
