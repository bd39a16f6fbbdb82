//! Experiment name validation.
//!
//! A name doubles as a git branch name and a directory under `experiments/`,
//! so only a conservative subset of both is accepted.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::error::EmError;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("valid name regex"));

pub fn validate_name(name: &str) -> Result<(), EmError> {
    let invalid = |reason: &str| EmError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.contains('/') {
        return Err(invalid("must not contain '/'"));
    }
    if !NAME_RE.is_match(name) {
        return Err(invalid(
            "must be [A-Za-z0-9._-] only and not start with '.' or '-'",
        ));
    }
    if name.contains("..") || name.ends_with(".lock") || name.ends_with('.') {
        return Err(invalid("is not a valid branch name"));
    }
    Ok(())
}
