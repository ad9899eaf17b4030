//! Glob patterns over resource paths.
//!
//! `*` matches any run of characters (including `.` and `/`), `?` matches
//! exactly one character, everything else is literal. Matching is anchored
//! at both ends.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// A compiled resource pattern such as `accrual.*`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    raw: String,
    regex: Regex,
}

impl ResourcePattern {
    /// Compile a glob pattern.
    pub fn new(raw: &str) -> Result<Self, CapabilityError> {
        if raw.is_empty() {
            return Err(CapabilityError::InvalidPattern("pattern is empty".into()));
        }

        let mut re = String::with_capacity(raw.len() * 2 + 2);
        re.push('^');
        for ch in raw.chars() {
            match ch {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                other => re.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        re.push('$');

        let regex = Regex::new(&re)
            .map_err(|e| CapabilityError::InvalidPattern(format!("{}: {}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    /// Does `path` fall under this pattern?
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern has no wildcards.
    pub fn is_literal(&self) -> bool {
        !self.raw.contains(['*', '?'])
    }

    /// Conservative containment: every path matched by `other` is matched by
    /// `self`. Exact for literal patterns and for `prefix*` patterns.
    pub fn covers(&self, other: &ResourcePattern) -> bool {
        if self.raw == other.raw {
            return true;
        }
        if other.is_literal() {
            return self.matches(&other.raw);
        }
        match self.raw.strip_suffix('*') {
            Some(prefix) if !prefix.contains(['*', '?']) => {
                let other_prefix: String = other.raw.chars().take_while(|c| *c != '*' && *c != '?').collect();
                other_prefix.starts_with(prefix)
            }
            _ => false,
        }
    }
}

impl PartialEq for ResourcePattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ResourcePattern {}

impl std::hash::Hash for ResourcePattern {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Debug for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourcePattern({:?})", self.raw)
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = CapabilityError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(&raw)
    }
}

impl From<ResourcePattern> for String {
    fn from(p: ResourcePattern) -> Self {
        p.raw
    }
}
