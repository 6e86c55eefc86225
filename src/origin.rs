//! Inbound origin validation.
//!
//! Allowed origins are exact strings or bounded-wildcard patterns
//! (`https://*.widgets.com`).  The `*` never compiles to an unbounded
//! quantifier: it becomes a character class repeated at most 253 times, so
//! matching stays linear in the origin's length.

use regex::Regex;
use std::collections::HashSet;
use tracing::warn;

/// Longest run a single `*` may match.  253 is the DNS name length cap.
const WILDCARD_MAX: usize = 253;

/// Decides whether a stated origin may deliver messages to this bus.
#[derive(Debug)]
pub struct OriginValidator {
    allow_all: bool,
    exact: HashSet<String>,
    patterns: Vec<Regex>,
    same_origin: String,
}

impl OriginValidator {
    /// Build a validator from the configured allowlist.
    ///
    /// A literal `"*"` entry switches on allow-all mode.  Entries containing
    /// `*` compile to bounded patterns; entries that fail to compile are
    /// logged and skipped rather than silently widening the allowlist.
    pub fn new<S: AsRef<str>>(allowed: &[S], same_origin: impl Into<String>) -> Self {
        let mut allow_all = false;
        let mut exact = HashSet::new();
        let mut patterns = Vec::new();

        for entry in allowed {
            let entry = entry.as_ref();
            if entry == "*" {
                allow_all = true;
            } else if entry.contains('*') {
                match compile_pattern(entry) {
                    Ok(re) => patterns.push(re),
                    Err(e) => warn!(pattern = entry, error = %e, "skipping origin pattern"),
                }
            } else {
                exact.insert(entry.to_owned());
            }
        }

        OriginValidator {
            allow_all,
            exact,
            patterns,
            same_origin: same_origin.into(),
        }
    }

    /// Whether allow-all mode is active (a `"*"` entry was configured).
    pub fn allows_any(&self) -> bool {
        self.allow_all
    }

    /// Apply the decision ladder to a stated origin.
    pub fn is_allowed(&self, origin: &str) -> bool {
        if self.allow_all {
            return true;
        }
        // Opaque origins are only accepted when explicitly listed.
        if origin == "null" {
            return self.exact.contains("null");
        }
        if self.exact.is_empty() && self.patterns.is_empty() {
            return origin == self.same_origin;
        }
        if self.exact.contains(origin) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(origin))
    }
}

/// Compile one wildcard entry to an anchored, bounded regex.
fn compile_pattern(entry: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(entry.len() + 16);
    source.push('^');
    for ch in entry.chars() {
        if ch == '*' {
            source.push_str(&format!("[A-Za-z0-9.-]{{0,{}}}", WILDCARD_MAX));
        } else {
            source.push_str(&regex::escape(&ch.to_string()));
        }
    }
    source.push('$');
    Regex::new(&source)
}
