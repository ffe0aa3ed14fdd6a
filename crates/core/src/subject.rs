//! Subject routing.
//!
//! Subjects are dot-delimited routing strings (`payout.settle.eu`). Consumers
//! subscribe with patterns where `*` matches exactly one token and `>` matches
//! one or more trailing tokens. `>` is only meaningful as the last token.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

const SEPARATOR: char = '.';
const SINGLE: &str = "*";
const TAIL: &str = ">";

/// Test a concrete subject against a wildcard pattern.
///
/// A `>` that is not the final pattern token invalidates the match.
pub fn match_subject(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split(SEPARATOR).collect();
    let pattern_tokens: Vec<&str> = pattern.split(SEPARATOR).collect();

    for (i, token) in pattern_tokens.iter().enumerate() {
        if *token == TAIL {
            return i == pattern_tokens.len() - 1 && i < subject_tokens.len();
        }

        let Some(subject_token) = subject_tokens.get(i) else {
            return false;
        };

        if *token != SINGLE && token != subject_token {
            return false;
        }
    }

    subject_tokens.len() == pattern_tokens.len()
}

/// Validate a concrete subject used when publishing.
///
/// Published subjects are literal: they may not be empty and may not contain
/// wildcard tokens.
pub fn validate_subject(subject: &str) -> DomainResult<()> {
    if subject.is_empty() {
        return Err(DomainError::validation("subject must not be empty"));
    }
    if subject
        .split(SEPARATOR)
        .any(|token| token == SINGLE || token == TAIL)
    {
        return Err(DomainError::validation(format!(
            "subject `{subject}` contains a wildcard token"
        )));
    }
    Ok(())
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectPattern(String);

impl SubjectPattern {
    /// Parse and validate a pattern.
    pub fn parse(pattern: impl Into<String>) -> DomainResult<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(DomainError::invalid_pattern(pattern, "pattern is empty"));
        }

        let tokens: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = tokens.len() - 1;
        if tokens[..last].iter().any(|token| *token == TAIL) {
            return Err(DomainError::invalid_pattern(
                pattern,
                "`>` is only allowed as the last token",
            ));
        }

        Ok(Self(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Does `subject` fall under this pattern?
    pub fn matches(&self, subject: &str) -> bool {
        match_subject(subject, &self.0)
    }

    /// Anchored regular expression equivalent to [`match_subject`] for this
    /// pattern.
    ///
    /// Uses only constructs that behave identically in PostgreSQL's `~`
    /// operator and the `regex` crate, so the store can filter subjects in SQL.
    pub fn to_regex(&self) -> String {
        let parts: Vec<String> = self
            .0
            .split(SEPARATOR)
            .map(|token| match token {
                SINGLE => "[^.]*".to_string(),
                TAIL => ".*".to_string(),
                literal => escape_literal(literal),
            })
            .collect();
        format!("^{}$", parts.join("\\."))
    }
}

impl core::fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SubjectPattern {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SubjectPattern> for String {
    fn from(value: SubjectPattern) -> Self {
        value.0
    }
}

impl core::str::FromStr for SubjectPattern {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn escape_literal(token: &str) -> String {
    let mut escaped = String::with_capacity(token.len());
    for c in token.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_token_wildcard() {
        assert!(match_subject("foo.bar", "foo.*"));
        assert!(!match_subject("foo.bar.baz", "foo.*"));
        assert!(!match_subject("foo", "foo.*"));
        assert!(match_subject("foo.bar.baz", "foo.*.baz"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(match_subject("foo.bar.baz", "foo.>"));
        assert!(match_subject("foo.bar", "foo.>"));
        assert!(!match_subject("foo", "foo.>"));
        assert!(match_subject("a.b.c", ">"));
        assert!(match_subject("a", ">"));
    }

    #[test]
    fn tail_wildcard_only_valid_at_end() {
        assert!(!match_subject("foo.bar.baz", "foo.>.baz"));
        assert!(!match_subject("foo.bar", ">.bar"));
    }

    #[test]
    fn literals_match_exactly() {
        assert!(match_subject("payout.settle", "payout.settle"));
        assert!(!match_subject("payout.settle", "payout.settled"));
        assert!(!match_subject("payout.settle", "payout"));
        assert!(!match_subject("payout", "payout.settle"));
    }

    #[test]
    fn parse_rejects_misplaced_tail() {
        let err = SubjectPattern::parse("foo.>.bar").unwrap_err();
        assert!(matches!(err, DomainError::InvalidPattern { .. }));
        assert!(SubjectPattern::parse("").is_err());
        assert!(SubjectPattern::parse("foo.>").is_ok());
        assert!(SubjectPattern::parse(">").is_ok());
    }

    #[test]
    fn validate_subject_rejects_wildcards() {
        assert!(validate_subject("game.timeout").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("game.*").is_err());
        assert!(validate_subject("game.>").is_err());
    }

    #[test]
    fn regex_shapes() {
        let p = SubjectPattern::parse("foo.*").unwrap();
        assert_eq!(p.to_regex(), r"^foo\.[^.]*$");
        let p = SubjectPattern::parse("foo.>").unwrap();
        assert_eq!(p.to_regex(), r"^foo\..*$");
        let p = SubjectPattern::parse("a+b.c").unwrap();
        assert_eq!(p.to_regex(), r"^a\+b\.c$");
    }

    fn token() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just("x+y".to_string()),
            Just("".to_string()),
        ]
    }

    fn pattern_token() -> impl Strategy<Value = String> {
        prop_oneof![token(), Just("*".to_string())]
    }

    proptest! {
        #[test]
        fn regex_agrees_with_matcher(
            subject in prop::collection::vec(token(), 1..5),
            pattern in prop::collection::vec(pattern_token(), 1..5),
            tail in any::<bool>(),
        ) {
            let mut pattern = pattern;
            if tail {
                pattern.push(">".to_string());
            }
            let subject = subject.join(".");
            let pattern = pattern.join(".");
            prop_assume!(!pattern.is_empty());
            let pattern = SubjectPattern::parse(pattern).unwrap();
            let re = regex::Regex::new(&pattern.to_regex()).unwrap();
            prop_assert_eq!(re.is_match(&subject), pattern.matches(&subject));
        }

        #[test]
        fn literal_pattern_matches_itself(subject in prop::collection::vec("[a-z]{1,6}", 1..6)) {
            let subject = subject.join(".");
            prop_assert!(match_subject(&subject, &subject));
            prop_assert!(match_subject(&subject, ">"));
        }
    }
}
