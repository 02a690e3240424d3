//! Glob matching for authentication bypass rules.
//!
//! Patterns support two wildcards:
//! - `*` matches any run of characters, including `/`
//! - `?` matches exactly one character
//!
//! Every other character matches itself. Matching is case-sensitive and
//! anchored at both ends, so `/health` does not match `/health/live`.
//!
//! ```ignore
//! let matcher = PathMatcher::new();
//! assert!(matcher.matches("/fhir/Patient/123", "/fhir/*"));
//! assert!(!matcher.matches("/Health", "/health"));
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use regex::Regex;

/// Glob matcher with a cache of compiled patterns.
///
/// Thread-safe; one instance is shared by all requests of a middleware.
pub struct PathMatcher {
    /// Compiled regexes keyed by their glob pattern.
    regex_cache: RwLock<HashMap<String, Regex>>,
}

impl Default for PathMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PathMatcher {
    /// Create a new path matcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regex_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `true` if `pathname` matches the glob `pattern`.
    #[must_use]
    pub fn matches(&self, pathname: &str, pattern: &str) -> bool {
        self.get_or_compile(pattern)
            .map(|re| re.is_match(pathname))
            .unwrap_or(false)
    }

    /// Returns `true` if `pathname` matches any of `patterns`.
    #[must_use]
    pub fn matches_any<S: AsRef<str>>(&self, pathname: &str, patterns: &[S]) -> bool {
        patterns
            .iter()
            .any(|pattern| self.matches(pathname, pattern.as_ref()))
    }

    /// Number of compiled patterns held in the cache.
    #[must_use]
    pub fn cached_patterns(&self) -> usize {
        self.regex_cache.read().map(|c| c.len()).unwrap_or(0)
    }

    fn get_or_compile(&self, pattern: &str) -> Option<Regex> {
        if let Some(re) = self
            .regex_cache
            .read()
            .ok()
            .and_then(|cache| cache.get(pattern).cloned())
        {
            return Some(re);
        }

        let re = match Regex::new(&glob_to_regex(pattern)) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid path pattern");
                return None;
            }
        };
        if let Ok(mut cache) = self.regex_cache.write() {
            cache.insert(pattern.to_string(), re.clone());
        }

        Some(re)
    }
}

/// Translates a glob into an anchored regular expression.
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');

    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                regex.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    regex.push_str(&regex::escape(&literal));

    regex.push('$');
    regex
}
