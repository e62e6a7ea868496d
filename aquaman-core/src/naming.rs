//! Safe-name validation for service names and credential keys.
//!
//! Service names and credential keys end up in URL paths, filenames, keyring
//! accounts, and CLI arguments. Every composition site validates through here
//! first; nothing downstream re-checks.

/// Pattern: `^[a-z0-9][a-z0-9._-]*$`.
///
/// The leading character excludes `_`, which keeps user and built-in service
/// names from ever colliding with the reserved `/_health` and `/_hostmap`
/// endpoints. Slashes and backslashes are excluded entirely, so a validated
/// name can never traverse out of a storage root.
pub fn is_safe_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Validate a service name, returning it on success.
pub fn validate_service_name(name: &str) -> Result<&str, crate::AquamanError> {
    if is_safe_name(name) {
        Ok(name)
    } else {
        Err(crate::AquamanError::InvalidInput(format!(
            "invalid service name: {name:?}"
        )))
    }
}

/// Validate a credential key, returning it on success.
pub fn validate_key(key: &str) -> Result<&str, crate::AquamanError> {
    if is_safe_name(key) {
        Ok(key)
    } else {
        Err(crate::AquamanError::InvalidInput(format!(
            "invalid credential key: {key:?}"
        )))
    }
}
