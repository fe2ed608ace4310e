//! Anchored `*` globs.
//!
//! Used for cache invalidation patterns and wildcard rate-limit routes. A
//! pattern is compiled once into a regular expression that must match the
//! whole candidate, so `a:*` matches `a:1` but not `xa:1`.

use regex::Regex;

#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    regex: Regex,
    wildcards: usize,
}

impl Glob {
    /// Compile `pattern`, treating `*` as "zero or more characters" and every
    /// other character literally.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 12);
        // `(?s)` lets `.` cross newlines inside keys.
        expr.push_str("(?s)^");
        for (index, literal) in pattern.split('*').enumerate() {
            if index > 0 {
                expr.push_str(".*");
            }
            expr.push_str(&regex::escape(literal));
        }
        expr.push('$');

        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
            wildcards: pattern.matches('*').count(),
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn wildcard_count(&self) -> usize {
        self.wildcards
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcards > 0
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}
