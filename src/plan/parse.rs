//! Plan wire formats: a structured-text human form and a strict JSON form,
//! both normalizing into the same [`Plan`] value.

use crate::error::EngineError;

use super::Plan;

/// Parse the human form: TOML with a top-level `base` and an array of
/// `[[tasks]]` tables, one per task.
pub fn parse_human(input: &str) -> Result<Plan, EngineError> {
    toml::from_str(input).map_err(|e| EngineError::PlanInvalid {
        reason: format!("failed to parse plan (human form): {e}"),
    })
}

/// Parse the strict key/value form: JSON with the identical field set.
pub fn parse_strict(input: &str) -> Result<Plan, EngineError> {
    serde_json::from_str(input).map_err(|e| EngineError::PlanInvalid {
        reason: format!("failed to parse plan (strict form): {e}"),
    })
}

/// Parse a plan, detecting the wire format from its leading non-whitespace
/// character: `{` is the strict JSON form, anything else is the human TOML
/// form.
pub fn parse(input: &str) -> Result<Plan, EngineError> {
    match input.trim_start().chars().next() {
        Some('{') => parse_strict(input),
        _ => parse_human(input),
    }
}
