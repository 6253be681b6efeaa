//! Wildcard pattern translation
//!
//! User patterns use a tiny grammar: `*` matches any run of characters and
//! everything else is literal. Chrome-style match patterns
//! (`*://*.example.com/*`) are split into scheme, host and path so that an
//! optional port can be accepted after the host.

use regex::{Regex, RegexBuilder};

/// Expression that never matches; used for empty patterns.
pub const MATCH_NOTHING: &str = r"[^\s\S]";

const OPTIONAL_PORT: &str = r"(?::\d+)?";

/// Error type for compiling a translated pattern.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Invalid pattern '{pattern}': {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Translate a wildcard pattern into an anchored regular expression.
pub fn translate(pattern: &str) -> String {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return MATCH_NOTHING.to_string();
    }

    if let Some(parts) = split_match_pattern(trimmed) {
        let port = if parts.host.contains(':') { "" } else { OPTIONAL_PORT };
        return format!(
            "^{}://{}{}{}$",
            wildcard_to_regex(parts.scheme),
            wildcard_to_regex(parts.host),
            port,
            wildcard_to_regex(parts.path),
        );
    }

    format!("^{}$", wildcard_to_regex(trimmed))
}

/// Translate and compile a pattern. Matching is case-insensitive, as the
/// enforcement layer treats URL filters by default.
pub fn compile(pattern: &str) -> Result<Regex, PatternError> {
    let expr = translate(pattern);
    RegexBuilder::new(&expr)
        .case_insensitive(true)
        .build()
        .map_err(|source| PatternError::Invalid {
            pattern: pattern.to_string(),
            source,
        })
}

/// Test `url` against a wildcard pattern. Patterns that fail to compile
/// match nothing.
pub fn matches(pattern: &str, url: &str) -> bool {
    match compile(pattern) {
        Ok(re) => re.is_match(url),
        Err(e) => {
            log::warn!("{}", e);
            false
        }
    }
}

struct MatchPatternParts<'a> {
    scheme: &'a str,
    host: &'a str,
    path: &'a str,
}

/// Split `scheme://host/path`. Scheme and host must be non-empty and free of
/// `/`; the path keeps its leading `/`.
fn split_match_pattern(s: &str) -> Option<MatchPatternParts<'_>> {
    let sep = s.find("://")?;
    let scheme = &s[..sep];
    if scheme.is_empty() || scheme.contains('/') {
        return None;
    }

    let rest = &s[sep + 3..];
    let slash = rest.find('/')?;
    let host = &rest[..slash];
    if host.is_empty() {
        return None;
    }

    Some(MatchPatternParts {
        scheme,
        host,
        path: &rest[slash..],
    })
}

/// Escape every regex metacharacter except `*`, which becomes `.*`.
fn wildcard_to_regex(segment: &str) -> String {
    segment
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*")
}
