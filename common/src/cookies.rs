//! Reading and writing the cookie cache.
//!
//! The cache is a flat JSON object of cookie names to values, which is what a
//! logged-in Gradescope session needs to be restored without a password.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub type CookieMap = BTreeMap<String, String>;

/// Load the cookie cache. Returns `None` if there is no cache yet.
pub fn load_cookie_file(path: &Path) -> Result<Option<CookieMap>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read cookie file {}", path.display()))?;
    let cookies = serde_json::from_str::<CookieMap>(&content)
        .with_context(|| format!("Cookie file {} is not a JSON object", path.display()))?;
    Ok(Some(cookies))
}

/// Write the cookie cache, creating the parent directory if needed.
pub fn save_cookie_file(path: &Path, cookies: &CookieMap) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    let content = serde_json::to_string_pretty(cookies)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write cookie file {}", path.display()))?;
    Ok(())
}

/// Split a `Cookie:` header value (`a=1; b=2`) into a map.
#[must_use]
pub fn parse_cookie_header(header: &str) -> CookieMap {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), value.trim().to_string()))
            }
        })
        .collect()
}
