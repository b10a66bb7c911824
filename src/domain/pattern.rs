//! URL patterns used by cache rules.
//!
//! Three forms are accepted:
//!
//! - literal paths (`/checkout`) match the path exactly;
//! - wildcards (`/products/*`) where `*` expands to any run of characters,
//!   including `/`;
//! - regular expressions delimited by slashes (`/^\/p\/\d+$/`), optionally
//!   followed by the `i` flag.
//!
//! Literal and wildcard patterns may be prefixed with a host
//! (`shop.example.com/cart*`). Hosts compare case-insensitively; paths are
//! case-sensitive unless a regex opts into `i`.

use std::fmt;

use regex::{Regex, RegexBuilder};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Literal,
    Wildcard,
    Regex,
}

#[derive(Debug, Clone)]
enum PathMatcher {
    Exact(String),
    Regex(Regex),
}

impl PathMatcher {
    fn is_match(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => expected == path,
            PathMatcher::Regex(regex) => regex.is_match(path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    kind: PatternKind,
    host: Option<Regex>,
    path: PathMatcher,
}

impl UrlPattern {
    pub fn parse(source: &str) -> Result<Self, DomainError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_pattern(source, "pattern is empty"));
        }

        if let Some((body, case_insensitive)) = split_regex_literal(trimmed) {
            let regex = RegexBuilder::new(body)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|err| DomainError::invalid_pattern(trimmed, err.to_string()))?;
            return Ok(Self {
                source: trimmed.to_string(),
                kind: PatternKind::Regex,
                host: None,
                path: PathMatcher::Regex(regex),
            });
        }

        let (host, path) = split_host(trimmed);

        let host = host
            .map(|host| {
                compile_glob(host, true)
                    .map_err(|reason| DomainError::invalid_pattern(trimmed, reason))
            })
            .transpose()?;

        let (kind, path) = if path.contains('*') {
            let regex = compile_glob(path, false)
                .map_err(|reason| DomainError::invalid_pattern(trimmed, reason))?;
            (PatternKind::Wildcard, PathMatcher::Regex(regex))
        } else {
            (PatternKind::Literal, PathMatcher::Exact(path.to_string()))
        };

        Ok(Self {
            source: trimmed.to_string(),
            kind,
            host,
            path,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    /// Match against a request. Patterns carrying a host never match when the
    /// request host is unknown.
    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        if let Some(expected) = &self.host {
            match host {
                Some(host) if expected.is_match(host) => {}
                _ => return false,
            }
        }
        self.path.is_match(path)
    }

    /// Expression over whole request URLs (`scheme://host[:port]/path?query`)
    /// that agrees with [`UrlPattern::matches`] on host and path. Regex
    /// patterns describe a path only and have no such form.
    pub fn url_expression(&self) -> Option<String> {
        if self.kind == PatternKind::Regex {
            return None;
        }
        let (host, path) = split_host(&self.source);
        let host = match host {
            Some(host) => format!("(?i:{})", glob_expression(host, "[^/?#:]*")),
            None => "[^/?#]*".to_string(),
        };
        Some(format!(
            "^[a-zA-Z][a-zA-Z0-9+.-]*://{host}(?::[0-9]+)?{}(?:[?#].*)?$",
            glob_expression(path, "[^?#]*")
        ))
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn split_regex_literal(value: &str) -> Option<(&str, bool)> {
    let rest = value.strip_prefix('/')?;
    if let Some(body) = rest.strip_suffix("/i") {
        return (!body.is_empty()).then_some((body, true));
    }
    let body = rest.strip_suffix('/')?;
    (!body.is_empty()).then_some((body, false))
}

/// Split a literal or wildcard source into its optional host and its path.
fn split_host(source: &str) -> (Option<&str>, &str) {
    if source.starts_with('/') || source == "*" {
        return (None, source);
    }
    match source.find('/') {
        Some(index) => (Some(&source[..index]), &source[index..]),
        None => (Some(source), "/*"),
    }
}

fn glob_expression(glob: &str, star: &str) -> String {
    let mut expression = String::with_capacity(glob.len() + 8);
    for (index, literal) in glob.split('*').enumerate() {
        if index > 0 {
            expression.push_str(star);
        }
        expression.push_str(&regex::escape(literal));
    }
    expression
}

fn compile_glob(glob: &str, case_insensitive: bool) -> Result<Regex, String> {
    let expression = format!("^{}$", glob_expression(glob, ".*"));
    RegexBuilder::new(&expression)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| err.to_string())
}
