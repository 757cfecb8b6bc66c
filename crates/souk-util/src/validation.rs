use thiserror::Error;

/// Upper bound on a single chat message body, in bytes.
pub const MAX_MESSAGE_LEN: usize = 4000;
/// Upper bound on a client-supplied send nonce.
pub const MAX_NONCE_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("invalid characters")]
    InvalidCharacters,
}

/// Message text must contain something other than whitespace.
pub fn validate_message_content(content: &str) -> Result<(), ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::TooShort { min: 1, got: 0 });
    }
    if content.len() > MAX_MESSAGE_LEN {
        return Err(ValidationError::TooLong {
            max: MAX_MESSAGE_LEN,
            got: content.len(),
        });
    }
    Ok(())
}

pub fn validate_nonce(nonce: &str) -> Result<(), ValidationError> {
    if nonce.len() > MAX_NONCE_LEN {
        return Err(ValidationError::TooLong {
            max: MAX_NONCE_LEN,
            got: nonce.len(),
        });
    }
    if !nonce
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_message_is_rejected() {
        assert_eq!(
            validate_message_content("  \n\t "),
            Err(ValidationError::TooShort { min: 1, got: 0 })
        );
        assert!(validate_message_content("").is_err());
    }

    #[test]
    fn padded_message_is_accepted() {
        assert!(validate_message_content("  hello  ").is_ok());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let body = "x".repeat(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            validate_message_content(&body),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn nonce_charset_is_restricted() {
        assert!(validate_nonce("a1b2-c3_d4").is_ok());
        assert_eq!(validate_nonce("a b"), Err(ValidationError::InvalidCharacters));
        assert!(validate_nonce(&"n".repeat(MAX_NONCE_LEN + 1)).is_err());
    }
}
