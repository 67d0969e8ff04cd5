//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_CLIENT_KEY_LENGTH: usize = 128;
const MAX_JERSEY_LENGTH: usize = 4;

/// Validates a client-generated key (session key or idempotency key).
///
/// Keys are 1 to 128 characters of ASCII letters, digits, `_`, `-`, `.` or `:`.
///
/// # Examples
///
/// ```ignore
/// validate_client_key("tablet-a:2024-11-02") // Ok
/// validate_client_key("")                    // Err - empty
/// validate_client_key("two words")           // Err - space
/// ```
pub fn validate_client_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() || key.len() > MAX_CLIENT_KEY_LENGTH {
        let mut err = ValidationError::new("client_key_length");
        err.message = Some(
            format!(
                "Key must be between 1 and {MAX_CLIENT_KEY_LENGTH} characters (got {})",
                key.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        let mut err = ValidationError::new("client_key_format");
        err.message =
            Some("Key may only contain ASCII letters, digits, '_', '-', '.' and ':'".into());
        return Err(err);
    }

    Ok(())
}

/// Validates an opponent jersey label: 1 to 4 ASCII letters or digits.
pub fn validate_jersey(jersey: &str) -> Result<(), ValidationError> {
    if jersey.is_empty()
        || jersey.len() > MAX_JERSEY_LENGTH
        || !jersey.chars().all(|c| c.is_ascii_alphanumeric())
    {
        let mut err = ValidationError::new("jersey_format");
        err.message = Some(
            format!("Jersey must be 1 to {MAX_JERSEY_LENGTH} letters or digits (got `{jersey}`)")
                .into(),
        );
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_client_key_valid() {
        assert!(validate_client_key("abc").is_ok());
        assert!(validate_client_key("tablet-a:2024-11-02").is_ok());
        assert!(validate_client_key("device_7.q2").is_ok());
        assert!(validate_client_key(&"k".repeat(128)).is_ok());
    }

    #[test]
    fn test_validate_client_key_invalid() {
        assert!(validate_client_key("").is_err());
        assert!(validate_client_key(&"k".repeat(129)).is_err());
        assert!(validate_client_key("two words").is_err());
        assert!(validate_client_key("clé").is_err());
    }

    #[test]
    fn test_validate_jersey() {
        assert!(validate_jersey("4").is_ok());
        assert!(validate_jersey("00").is_ok());
        assert!(validate_jersey("A12").is_ok());
        assert!(validate_jersey("").is_err());
        assert!(validate_jersey("12345").is_err());
        assert!(validate_jersey("#4").is_err());
    }
}
