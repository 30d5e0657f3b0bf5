//! Object pattern matching and specificity ranking.
//!
//! Patterns are dot-delimited object names in which `*` matches zero or more
//! characters. Matching is case-insensitive and always spans the whole name.

use regex::{Regex, RegexBuilder};
use tracing::debug;

/// Separator between object name segments.
pub const SEGMENT_DELIMITER: char = '.';
/// Multi-character wildcard.
pub const WILDCARD: char = '*';

const EXACT_BONUS: i64 = 1000;
const SEGMENT_WEIGHT: i64 = 100;
const WILDCARD_PENALTY: i64 = 50;
const REGEX_SIZE_LIMIT: usize = 1 << 16;

/// Trims, strips control characters and upper-cases an object name or pattern.
pub fn normalize(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Whether `object_name` matches `pattern`.
///
/// Malformed input never errors; it is reported as no match.
pub fn matches(object_name: &str, pattern: &str) -> bool {
    ObjectPattern::new(pattern).matches(object_name)
}

/// Specificity score of a pattern: more segments and fewer wildcards score
/// higher, exact patterns get a bonus, and length breaks what remains.
///
/// The score alone does not keep every exact pattern above every wildcarded
/// one; a wildcard pattern with many segments can outscore a short literal.
/// Candidate ordering uses [`crate::CachedRule::rank`], which compares
/// exactness first.
pub fn specificity(pattern: &str) -> i64 {
    let segments = pattern.matches(SEGMENT_DELIMITER).count() as i64;
    let wildcards = pattern.matches(WILDCARD).count() as i64;
    let exact_bonus = if wildcards == 0 { EXACT_BONUS } else { 0 };
    segments * SEGMENT_WEIGHT - wildcards * WILDCARD_PENALTY
        + exact_bonus
        + pattern.chars().count() as i64
}

/// A normalized pattern with its wildcard matcher compiled once.
#[derive(Debug, Clone)]
pub struct ObjectPattern {
    normalized: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Glob(Regex),
    // Compilation failed; nothing but the literal text can match.
    Broken,
}

impl ObjectPattern {
    pub fn new(pattern: &str) -> Self {
        let normalized = normalize(pattern);
        let matcher = if normalized.contains(WILDCARD) {
            match compile_glob(&normalized) {
                Ok(regex) => Matcher::Glob(regex),
                Err(err) => {
                    debug!(pattern = %normalized, %err, "pattern failed to compile");
                    Matcher::Broken
                }
            }
        } else {
            Matcher::Exact
        };

        Self {
            normalized,
            matcher,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Exact)
    }

    pub fn specificity(&self) -> i64 {
        specificity(&self.normalized)
    }

    pub fn matches(&self, object_name: &str) -> bool {
        self.matches_normalized(&normalize(object_name))
    }

    /// Like [`ObjectPattern::matches`] for a name already passed through [`normalize`].
    pub fn matches_normalized(&self, object: &str) -> bool {
        if object == self.normalized {
            return true;
        }
        match &self.matcher {
            Matcher::Exact | Matcher::Broken => false,
            Matcher::Glob(regex) => regex.is_match(object),
        }
    }
}

fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    let mut previous_was_wildcard = false;
    for piece in pattern.split_inclusive(WILDCARD) {
        let (literal, wildcard) = match piece.strip_suffix(WILDCARD) {
            Some(literal) => (literal, true),
            None => (piece, false),
        };
        if !literal.is_empty() {
            expression.push_str(&regex::escape(literal));
            previous_was_wildcard = false;
        }
        if wildcard && !previous_was_wildcard {
            expression.push_str(".*");
            previous_was_wildcard = true;
        }
    }
    expression.push('$');

    RegexBuilder::new(&expression)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_patterns_compare_case_insensitively() {
        assert!(matches("order_pkg.create", "ORDER_PKG.CREATE"));
        assert!(matches("  ORDER_PKG.CREATE\n", "order_pkg.create"));
        assert!(!matches("ORDER_PKG.CREATE_X", "ORDER_PKG.CREATE"));
        assert!(!matches("ORDER_PKG", "ORDER_PKG.CREATE"));
    }

    #[test]
    fn wildcard_spans_whole_name() {
        assert!(matches("ORDER_PKG.CREATE", "ORDER_PKG.*"));
        assert!(matches("ORDER_PKG.", "ORDER_PKG.*"));
        assert!(matches("ORDER_PKG.CREATE", "*.CREATE"));
        assert!(matches("ORDER_PKG.CREATE", "*"));
        assert!(matches("ORDER_PKG.CREATE", "ORD*PKG*ATE"));
        assert!(!matches("BILLING.ORDER_PKG.CREATE", "ORDER_PKG.*"));
        assert!(!matches("ORDER_PKG.CREATE", "*.DELETE"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(!matches("ORDERXPKG.CREATE", "ORDER.PKG.*"));
        assert!(matches("A+B.C", "A+B.*"));
        assert!(!matches("AAB.C", "A+B.*"));
        assert!(matches("ORDER_PKG.CREATE", "ORDER_PKG.**"));
    }

    #[test]
    fn empty_and_control_input_degrades_to_no_match() {
        assert!(!matches("ORDER_PKG.CREATE", ""));
        assert!(matches("", ""));
        assert!(matches("ORD\u{0007}ER", "ORDER"));
    }

    #[test]
    fn exact_outranks_any_wildcard() {
        use crate::cache::CachedRule;
        use crate::testing::rule;

        let deep_wildcard = "A.B.C.D.E.F.G.H.I.J.K.*";
        assert!(specificity(deep_wildcard) > specificity("A"));

        let exact = CachedRule::new(rule("A", "T1"));
        let wildcard = CachedRule::new(rule(deep_wildcard, "T1"));
        assert!(exact.rank() > wildcard.rank());
    }

    #[test]
    fn specificity_prefers_segments_and_fewer_wildcards() {
        assert!(specificity("ORDER_PKG.CREATE.*") > specificity("ORDER_PKG.*"));
        assert!(specificity("ORDER_PKG.*") > specificity("*.*"));
        assert!(specificity("ORDER_PKG.*") > specificity("*"));
        assert_eq!(specificity("ORDER_PKG.*"), 100 - 50 + 11);
        assert_eq!(specificity("ORDER_PKG.CREATE"), 100 + 1000 + 16);
    }
}
