use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, TaskerError};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("name pattern is a valid regex"));

static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable pattern is a valid regex")
});

/// Job and task names: non-empty, `[A-Za-z0-9_-]+`.
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(TaskerError::InvalidName(name.to_string()))
    }
}

/// Variable names must be expandable as `$NAME` and `${NAME}`.
pub fn validate_variable_name(name: &str) -> Result<()> {
    if VARIABLE_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(TaskerError::InvalidVariable(name.to_string()))
    }
}
