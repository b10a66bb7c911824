//! Cache key normalization.
//!
//! Two URLs that render to the same document must map to the same key, so the
//! key drops fragments, tracking parameters and parameter order.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::{Url, form_urlencoded};

const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid", "msclkid", "dclid", "yclid"];

/// Normalized URL identifying one cache entry and one render flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_url(url: &Url) -> Self {
        let mut key = String::new();

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        key.push_str(&host);
        if let Some(port) = url.port() {
            key.push(':');
            key.push_str(&port.to_string());
        }

        let path = url.path();
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            key.push('/');
        } else {
            key.push_str(trimmed);
        }

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !is_tracking_param(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        if !pairs.is_empty() {
            pairs.sort();
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            key.push('?');
            key.push_str(&query);
        }

        Self(key)
    }

    /// Build a key for a request path against a host. Returns `None` when the
    /// combination does not form a valid URL.
    pub fn for_request(host: &str, path_and_query: &str) -> Option<Self> {
        let url = Url::parse(&format!("http://{host}{path_and_query}")).ok()?;
        Some(Self::from_url(&url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which a networked backend stores the entry.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_tracking_param(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered.starts_with("utm_") || TRACKING_PARAMS.contains(&lowered.as_str())
}

/// Glob match with `*` (any run, possibly empty) and `?` (one character).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str) -> String {
        CacheKey::from_url(&Url::parse(url).expect("url")).to_string()
    }

    #[test]
    fn fragment_and_scheme_do_not_split_keys() {
        assert_eq!(key("https://Example.com/a#top"), "example.com/a");
        assert_eq!(key("http://example.com/a"), "example.com/a");
    }

    #[test]
    fn tracking_params_are_stripped_and_rest_sorted() {
        assert_eq!(
            key("https://example.com/p?b=2&utm_source=x&a=1&gclid=zz&UTM_Medium=y"),
            "example.com/p?a=1&b=2"
        );
        assert_eq!(key("https://example.com/p?utm_campaign=only"), "example.com/p");
    }

    #[test]
    fn trailing_slash_is_removed_except_at_root() {
        assert_eq!(key("https://example.com/blog/"), "example.com/blog");
        assert_eq!(key("https://example.com/"), "example.com/");
        assert_eq!(key("https://example.com"), "example.com/");
    }

    #[test]
    fn non_default_port_is_kept() {
        assert_eq!(key("http://example.com:8080/x"), "example.com:8080/x");
        assert_eq!(key("https://example.com:443/x"), "example.com/x");
    }

    #[test]
    fn request_helper_matches_url_form() {
        let from_request = CacheKey::for_request("Example.com", "/products/1/?z=1&a=2")
            .expect("valid request");
        assert_eq!(from_request.as_str(), "example.com/products/1?a=2&z=1");
        assert_eq!(
            from_request.storage_key("prerender:"),
            "prerender:example.com/products/1?a=2&z=1"
        );
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("example.com/blog/*", "example.com/blog/a/b"));
        assert!(glob_match("*", ""));
        assert!(glob_match("example.com/p?", "example.com/p1"));
        assert!(!glob_match("example.com/p?", "example.com/p12"));
        assert!(glob_match("*/products/*", "shop.example/products/9"));
        assert!(!glob_match("example.com/blog/*", "example.com/news/a"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }
}
