// Subject validation and wildcard interest matching.
//
// A subject is a non-empty dot-separated token sequence (`orders.eu.created`).
// Subscription patterns may additionally use `*` to match exactly one token
// and a terminal `>` to match one or more remaining tokens.
pub mod matcher;

pub use matcher::{Interest, MatchResult, Matcher, QueueMatch};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("invalid subject pattern: {0}")]
    InvalidPattern(String),
}

/// Single-token wildcard.
pub const TOKEN_WILDCARD: &str = "*";
/// Terminal multi-token wildcard.
pub const TOKEN_FULL_WILDCARD: &str = ">";

const SEP: char = '.';

// Token-level check shared by subjects and patterns. A token is opaque bytes
// excluding the separator; whitespace would break the line protocol framing.
fn valid_token(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(|c| c == SEP || c.is_ascii_whitespace())
}

/// Validate a literal subject as used by publishes. Wildcard tokens are
/// interest-only and rejected here.
pub fn validate_literal(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    for token in subject.split(SEP) {
        if !valid_token(token) || token == TOKEN_WILDCARD || token == TOKEN_FULL_WILDCARD {
            return Err(Error::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Validate a subscription pattern. `*` must occupy a whole token and `>` is
/// only valid as the final token.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidPattern(pattern.to_string()));
    }
    let tokens: Vec<&str> = pattern.split(SEP).collect();
    let last = tokens.len() - 1;
    for (idx, token) in tokens.iter().enumerate() {
        if *token == TOKEN_FULL_WILDCARD {
            if idx != last {
                return Err(Error::InvalidPattern(pattern.to_string()));
            }
            continue;
        }
        if !valid_token(token) {
            return Err(Error::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

/// True when `pattern` accepts the literal `subject`. Used for spot checks
/// and tests; bulk matching goes through [`Matcher`].
pub fn pattern_matches(pattern: &str, subject: &str) -> bool {
    let mut subj = subject.split(SEP);
    for ptok in pattern.split(SEP) {
        if ptok == TOKEN_FULL_WILDCARD {
            // `>` needs at least one remaining token.
            return subj.next().is_some();
        }
        match subj.next() {
            Some(stok) if ptok == TOKEN_WILDCARD || ptok == stok => {}
            _ => return false,
        }
    }
    subj.next().is_none()
}
