//! Target normalization.

use crate::error::{ProbeError, Result};

/// Turn user input into a network identity.
///
/// Phone-number style input keeps only its digits (`+49 151-123` becomes
/// `49151123`) and gets `@{domain}` appended. Input that already carries a
/// domain is used as-is.
pub fn normalize_target(input: &str, domain: &str) -> Result<String> {
    let input = input.trim();
    if input.contains('@') {
        return Ok(input.to_string());
    }

    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(ProbeError::InvalidTarget(format!(
            "'{input}' contains no digits"
        )));
    }
    Ok(format!("{digits}@{domain}"))
}
