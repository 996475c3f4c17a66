//! Invalidation Patterns
//!
//! Keys are `:`-delimited paths (`post:42:comments`). A pattern is either an
//! exact key or contains `*`, which matches any run of characters inside a
//! single segment. `post:*` matches `post:42` but not `post:42:comments`.

use regex::Regex;

use crate::error::{Error, Result};

/// Segment delimiter for keys and patterns
pub const SEGMENT_DELIMITER: char = ':';

/// The only wildcard token
pub const WILDCARD: char = '*';

/// Parsed invalidation pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationPattern {
    /// Matches exactly one key
    Exact(String),
    /// Contains at least one `*`
    Wildcard(String),
}

impl InvalidationPattern {
    /// Classify a pattern string.
    pub fn parse(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if pattern.contains(WILDCARD) {
            Self::Wildcard(pattern)
        } else {
            Self::Exact(pattern)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Wildcard(s) => s,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard(_))
    }

    /// Compile into a reusable matcher.
    pub fn compile(&self) -> Result<PatternMatcher> {
        PatternMatcher::compile(self.as_str())
    }
}

impl std::fmt::Display for InvalidationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for InvalidationPattern {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for InvalidationPattern {
    fn from(s: String) -> Self {
        Self::parse(s)
    }
}

/// Compiled, stateless key matcher.
#[derive(Debug, Clone)]
pub enum PatternMatcher {
    Exact(String),
    Wildcard { source: String, regex: Regex },
}

impl PatternMatcher {
    /// Compile a pattern string. Each `*` becomes `[^:]*`; everything else
    /// is matched literally and the whole key must match.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: String::new(),
                reason: "pattern is empty".to_string(),
            });
        }
        if !pattern.contains(WILDCARD) {
            return Ok(Self::Exact(pattern.to_string()));
        }

        let segment_any = format!("[^{}]*", regex::escape(&SEGMENT_DELIMITER.to_string()));
        let body = pattern
            .split(WILDCARD)
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(&segment_any);

        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::Wildcard {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern this matcher was compiled from.
    pub fn source(&self) -> &str {
        match self {
            Self::Exact(s) => s,
            Self::Wildcard { source, .. } => source,
        }
    }

    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(s) => s == key,
            Self::Wildcard { regex, .. } => regex.is_match(key),
        }
    }

    /// Filter a key set, preserving input order.
    pub fn filter<'a, I>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        keys.into_iter()
            .filter(|k| self.matches(k))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classifies() {
        assert_eq!(
            InvalidationPattern::parse("post:1"),
            InvalidationPattern::Exact("post:1".into())
        );
        assert!(InvalidationPattern::parse("post:*").is_wildcard());
    }

    #[test]
    fn test_exact_match() {
        let m = PatternMatcher::compile("post:1").unwrap();
        assert!(m.matches("post:1"));
        assert!(!m.matches("post:10"));
        assert!(!m.matches("post"));
    }

    #[test]
    fn test_wildcard_stays_within_segment() {
        let m = PatternMatcher::compile("post:*").unwrap();
        assert!(m.matches("post:1"));
        assert!(m.matches("post:"));
        assert!(m.matches("post:abc-def"));
        assert!(!m.matches("post:1:comments"));
        assert!(!m.matches("posts:1"));
        assert!(!m.matches("user:1"));
    }

    #[test]
    fn test_wildcard_inside_segment() {
        let m = PatternMatcher::compile("feed:user-*:page").unwrap();
        assert!(m.matches("feed:user-7:page"));
        assert!(!m.matches("feed:admin-7:page"));
        assert!(!m.matches("feed:user-7:x:page"));
    }

    #[test]
    fn test_middle_segment_wildcard() {
        let m = PatternMatcher::compile("post:*:comments").unwrap();
        assert!(m.matches("post:42:comments"));
        assert!(!m.matches("post:42:likes"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let m = PatternMatcher::compile("q:a.b+(c):*").unwrap();
        assert!(m.matches("q:a.b+(c):1"));
        assert!(!m.matches("q:aXb+(c):1"));
    }

    #[test]
    fn test_filter_preserves_order() {
        let keys = vec![
            "post:2".to_string(),
            "user:1".to_string(),
            "post:1".to_string(),
        ];
        let m = PatternMatcher::compile("post:*").unwrap();
        assert_eq!(m.filter(&keys), vec!["post:2".to_string(), "post:1".to_string()]);
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(PatternMatcher::compile("").is_err());
    }
}
