//! Program identifiers and registry addresses.
//!
//! A program is named `[user/]program[.version]`, or given directly as an
//! absolute `http(s)://` URL. Names are resolved against the registry base
//! URL from [`RegistryConfig`](capsule_common::RegistryConfig).

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;
use url::Url;

use capsule_common::RuntimeError;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-zA-Z][0-9a-zA-Z-]+$").expect("program name pattern is valid")
});

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-zA-Z.-]+$").expect("version pattern is valid"));

/// Returns `true` if `s` starts with `http://` or `https://`, ignoring case.
pub fn looks_like_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Returns `true` if `name` is a valid user or program name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// A parsed `[user/]program[.version]` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramName {
    /// Owner of the program, if qualified.
    pub user: Option<String>,
    /// Program name.
    pub program: String,
    /// Requested version, if any.
    pub version: Option<String>,
}

impl FromStr for ProgramName {
    type Err = RuntimeError;

    fn from_str(full: &str) -> Result<Self, Self::Err> {
        let (user, rest) = match full.rsplit_once('/') {
            Some((user, rest)) => (Some(user.trim_matches('/')), rest),
            None => (None, full),
        };
        let (program, version) = match rest.split_once('.') {
            Some((program, version)) => (program, Some(version)),
            None => (rest, None),
        };

        if let Some(user) = user {
            if !is_valid_name(user) {
                return Err(RuntimeError::invalid_program(full, format!("invalid user name '{user}'")));
            }
        }
        if !is_valid_name(program) {
            return Err(RuntimeError::invalid_program(
                full,
                format!("invalid program name '{program}'"),
            ));
        }
        if let Some(version) = version {
            if !VERSION_RE.is_match(version) {
                return Err(RuntimeError::invalid_program(full, format!("invalid version '{version}'")));
            }
        }

        Ok(Self {
            user: user.map(str::to_string),
            program: program.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for ProgramName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}/")?;
        }
        f.write_str(&self.program)?;
        if let Some(version) = &self.version {
            write!(f, ".{version}")?;
        }
        Ok(())
    }
}

/// Resolve a program name or URL to the URL it is loaded from.
///
/// URLs are used verbatim. Names become
/// `<base>/load?program=<name>[&access_token=<token>]`.
pub fn resolve(base: &str, name_or_url: &str, token: Option<&str>) -> Result<String, RuntimeError> {
    if looks_like_url(name_or_url) {
        return Ok(name_or_url.to_string());
    }

    let name: ProgramName = name_or_url.parse()?;
    let mut params = vec![("program", name.to_string())];
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        params.push(("access_token", token.to_string()));
    }
    endpoint(base, "load", &params)
}

/// URL an archive named `name` is uploaded to.
pub fn upload_url(base: &str, name: &str, token: &str) -> Result<String, RuntimeError> {
    endpoint(
        base,
        "upload",
        &[("name", name.to_string()), ("access_token", token.to_string())],
    )
}

fn endpoint(base: &str, path: &str, params: &[(&str, String)]) -> Result<String, RuntimeError> {
    let base = base.trim_end_matches('/');
    let url = Url::parse_with_params(&format!("{base}/{path}"), params).map_err(|e| {
        RuntimeError::invalid_config(format!("invalid registry base URL '{base}': {e}"))
    })?;
    Ok(url.into())
}

/// Replace `token` by its value if it is an alias in `tokens_file`.
///
/// The file holds `alias = token` lines. A missing or unreadable file
/// leaves the token unchanged.
pub fn expand_token(tokens_file: &Path, token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }

    let content = match std::fs::read_to_string(tokens_file) {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %tokens_file.display(), error = %e, "No token aliases");
            return token.to_string();
        }
    };

    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(alias, _)| alias.trim() == token)
        .map_or_else(|| token.to_string(), |(_, value)| value.trim().to_string())
}
