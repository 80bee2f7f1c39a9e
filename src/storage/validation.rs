//! Input checks applied before anything touches storage.

use crate::error::ValidationError;

/// Longest identifier accepted in a storage key segment.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Default evidence payload cap (100 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Checks that `value` is safe to use as one segment of a storage key:
/// ASCII letters, digits, `-` and `_` only.
///
/// # Errors
///
/// Returns `ValidationError::InvalidIdentifier` naming `field`.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let reject = |reason: &'static str| ValidationError::InvalidIdentifier {
        field,
        value: value.chars().take(64).collect::<String>().escape_default().to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(reject("must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(reject("longer than 128 characters"));
    }
    if value.chars().any(char::is_control) {
        return Err(reject("contains control characters"));
    }
    if value.contains("..") || value.contains('/') || value.contains('\\') {
        return Err(reject("contains a path separator or traversal sequence"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(reject("only letters, digits, '-' and '_' are allowed"));
    }
    Ok(())
}

/// Checks an evidence payload against the size cap.
///
/// # Errors
///
/// Returns `ValidationError::EmptyPayload` or `ValidationError::PayloadTooLarge`.
pub fn validate_payload(payload: &[u8], limit: usize) -> Result<(), ValidationError> {
    if payload.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    if payload.len() > limit {
        return Err(ValidationError::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(value: &str) -> &'static str {
        match validate_identifier("asset id", value) {
            Err(ValidationError::InvalidIdentifier { reason, .. }) => reason,
            other => panic!("expected rejection of {value:?}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_plain_identifiers() {
        for ok in ["acme", "asset-01", "EV_2025_0001", "a"] {
            assert!(validate_identifier("asset id", ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn rejects_key_injection() {
        assert!(reason("").contains("empty"));
        assert!(reason("../other-tenant").contains("traversal"));
        assert!(reason("a/b").contains("separator"));
        assert!(reason("a\\b").contains("separator"));
        assert!(reason("line\nbreak").contains("control"));
        assert!(reason("nul\0").contains("control"));
        assert!(reason("space here").contains("only letters"));
        assert!(reason("caf\u{e9}").contains("only letters"));
        assert!(reason(&"x".repeat(129)).contains("128"));
    }

    #[test]
    fn rejected_value_is_escaped() {
        let err = validate_identifier("tenant id", "a\nb").unwrap_err();
        assert!(err.to_string().contains("a\\nb"));
    }

    #[test]
    fn payload_bounds() {
        assert_eq!(validate_payload(&[], 10), Err(ValidationError::EmptyPayload));
        assert!(validate_payload(&[1; 10], 10).is_ok());
        assert_eq!(
            validate_payload(&[1; 11], 10),
            Err(ValidationError::PayloadTooLarge { size: 11, limit: 10 })
        );
    }
}
