//! Glob patterns used in policy subjects, actions and resources.
//!
//! `*` matches any run of characters, including the `:` separator, so
//! `trade:*` matches `trade:place_order` and `user:*` matches `user:42:child`.
//! Every other character matches itself. Patterns are anchored at both ends.

use dashmap::DashMap;
use regex::Regex;

/// Translate a glob into an anchored regular expression source.
pub fn glob_to_regex(pattern: &str) -> String {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{}$", body)
}

pub fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&glob_to_regex(pattern))
}

/// Compiled-pattern cache shared by every permission check.
#[derive(Default)]
pub struct PatternMatcher {
    compiled: DashMap<String, Option<Regex>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `value` matches `pattern`. Patterns that fail to compile never match.
    pub fn matches(&self, pattern: &str, value: &str) -> bool {
        if let Some(entry) = self.compiled.get(pattern) {
            return entry.as_ref().map(|re| re.is_match(value)).unwrap_or(false);
        }

        let compiled = match compile(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, "Policy pattern failed to compile: {}", e);
                None
            }
        };
        let matched = compiled.as_ref().map(|re| re.is_match(value)).unwrap_or(false);
        self.compiled.insert(pattern.to_string(), compiled);
        matched
    }

    pub fn matches_any(&self, patterns: &[String], value: &str) -> bool {
        patterns.iter().any(|pattern| self.matches(pattern, value))
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_translation() {
        assert_eq!(glob_to_regex("user:*"), "^user:.*$");
        assert_eq!(glob_to_regex("*"), "^.*$");
        assert_eq!(glob_to_regex("trade.v2:*"), r"^trade\.v2:.*$");
    }

    #[test]
    fn test_exact_and_wildcard_matching() {
        let m = PatternMatcher::new();
        assert!(m.matches("user:42", "user:42"));
        assert!(!m.matches("user:42", "user:420"));
        assert!(m.matches("user:*", "user:420"));
        assert!(m.matches("trade:*", "trade:place_order"));
        assert!(!m.matches("trade:*", "account:trade:view"));
        assert!(m.matches("*:view", "account:view"));
    }

    #[test]
    fn test_wildcard_crosses_separator() {
        let m = PatternMatcher::new();
        assert!(m.matches("trading_account:*", "trading_account:99:positions"));
        assert!(m.matches("user:*", "user:"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        let m = PatternMatcher::new();
        assert!(m.matches("report.daily", "report.daily"));
        assert!(!m.matches("report.daily", "reportXdaily"));
        assert!(!m.matches("a+", "aa"));
    }

    #[test]
    fn test_compiled_patterns_are_cached() {
        let m = PatternMatcher::new();
        assert!(m.is_empty());
        m.matches("user:*", "user:1");
        m.matches("user:*", "user:2");
        assert_eq!(m.len(), 1);
        assert!(m.matches_any(&["account:*".to_string(), "user:*".to_string()], "user:3"));
        assert_eq!(m.len(), 2);
    }
}
