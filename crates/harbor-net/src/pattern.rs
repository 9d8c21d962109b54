//! URL patterns for route matching.
//!
//! A pattern that starts with `/` is matched against the URL path only;
//! anything else is matched against the full serialized URL.

use glob::{MatchOptions, Pattern, PatternError};
use serde::{Deserialize, Serialize};
use url::Url;

/// `*` and `?` stop at `/`; `**` spans segments.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Exact match.
    Exact,
    /// Prefix match.
    Prefix,
    /// Suffix match (e.g., file extension).
    Suffix,
    /// Contains substring.
    Contains,
    /// Glob: `*` within one segment, `**` across segments, `?` one character.
    Glob,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
    /// Compiled form of a glob.
    compiled: Option<Pattern>,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::new(PatternType::Exact, url)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::new(PatternType::Prefix, prefix)
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::new(PatternType::Suffix, suffix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::new(PatternType::Contains, substring)
    }

    /// Compile a glob pattern.
    pub fn glob(glob: &str) -> Result<Self, PatternError> {
        let compiled = Pattern::new(glob)?;
        Ok(Self {
            compiled: Some(compiled),
            ..Self::new(PatternType::Glob, glob)
        })
    }

    fn new(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
            compiled: None,
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let subject = if self.pattern.starts_with('/') {
            url.path()
        } else {
            url.as_str()
        };
        match self.pattern_type {
            PatternType::Exact => subject == self.pattern,
            PatternType::Prefix => subject.starts_with(&self.pattern),
            PatternType::Suffix => subject.ends_with(&self.pattern),
            PatternType::Contains => subject.contains(&self.pattern),
            PatternType::Glob => self
                .compiled
                .as_ref()
                .is_some_and(|glob| glob.matches_with(subject, GLOB_OPTIONS)),
        }
    }
}
