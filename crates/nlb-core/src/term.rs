//! Search-term normalization.
//!
//! A raw term is accepted if, after stripping separators and an optional
//! country prefix, it is a 10-digit subscriber number with a leading digit in
//! 6-9. The canonical form is what the protection registry and the upstream
//! lookup both key on.

use std::fmt;

/// A normalized search key, validated on construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CanonicalTerm(String);

impl CanonicalTerm {
    /// Normalize a raw user-supplied term, or `None` if it does not match the
    /// subscriber-number shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let unprefixed = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let mut digits = String::with_capacity(unprefixed.len());
        for c in unprefixed.chars() {
            match c {
                '0'..='9' => digits.push(c),
                ' ' | '-' | '(' | ')' | '.' => continue,
                _ => return None,
            }
        }

        // Accept the bare national number, `91`-prefixed, or `0`-trunk form.
        let national = match digits.len() {
            10 => digits.as_str(),
            11 if digits.starts_with('0') => &digits[1..],
            12 if digits.starts_with("91") => &digits[2..],
            _ => return None,
        };

        if !matches!(national.as_bytes()[0], b'6'..=b'9') {
            return None;
        }

        Some(Self(national.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
