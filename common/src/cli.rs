//! Command line options shared by every tool.

use crate::client_api::{ClientConfig, Credentials, GradescopeClient};
use crate::{DEFAULT_BASE_URL, DEFAULT_COOKIE_FILE, DEFAULT_MAX_RETRIES, REQUEST_TIMEOUT_SECS};
use anyhow::Result;
use clap::Args;
use log::LevelFilter;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How to reach and authenticate with Gradescope.
#[derive(Args, Clone)]
pub struct ConnectionArgs {
    /// Filename for the cookie cache
    #[arg(long, default_value = DEFAULT_COOKIE_FILE, env = "GRADESCOPE_COOKIES")]
    pub cookies: PathBuf,

    /// The base URL to connect to
    #[arg(long, default_value = DEFAULT_BASE_URL, env = "GRADESCOPE_BASE_URL")]
    pub base_url: String,

    /// Email to log in with when the cookie cache is missing or stale
    #[arg(long, env = "GRADESCOPE_EMAIL", hide_env_values = true)]
    pub login_email: Option<String>,

    /// Password to log in with; prompted for if not given
    #[arg(long, env = "GRADESCOPE_PASSWORD", hide_env_values = true)]
    pub login_password: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS, env = "GRADESCOPE_TIMEOUT")]
    pub timeout: u64,

    /// Attempts per page fetch before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, env = "GRADESCOPE_MAX_RETRIES")]
    pub max_retries: u32,

    /// Only show warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Show additional output
    #[arg(short, long)]
    pub verbose: bool,
}

impl fmt::Debug for ConnectionArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionArgs")
            .field("cookies", &self.cookies)
            .field("base_url", &self.base_url)
            .field("login_email", &self.login_email)
            .field("login_password", &self.login_password.as_ref().map(|_| "<hidden>"))
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("quiet", &self.quiet)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl ConnectionArgs {
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.timeout),
            max_retries: self.max_retries,
            ..ClientConfig::default()
        }
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.login_email.clone(),
            password: self.login_password.clone(),
        }
    }

    /// Build a client and restore or create a session with it.
    pub fn connect(&self) -> Result<GradescopeClient> {
        let client = GradescopeClient::new(self.client_config())?;
        client.authenticate(&self.cookies, &self.credentials())?;
        Ok(client)
    }

    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Warn
        } else if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}

/// Load `.env` so credentials can live next to the cookie cache.
/// Must run before the arguments are parsed, which is before logging is set up,
/// so a broken `.env` is handed back for the caller to report.
#[must_use]
pub fn load_dotenv() -> Option<dotenvy::Error> {
    dotenv_problem(dotenvy::dotenv())
}

/// A missing `.env` is fine; anything else is worth a warning.
fn dotenv_problem<T>(result: dotenvy::Result<T>) -> Option<dotenvy::Error> {
    match result {
        Err(e) if !e.not_found() => Some(e),
        _ => None,
    }
}

/// Set up the logger. `RUST_LOG` still wins over the CLI flags.
pub fn init_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .parse_default_env()
        .init();
}
