//! Task text validation.

/// Maximum task text length, in characters, after trimming.
pub const MAX_TEXT_CHARS: usize = 280;

/// Reasons task text can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Text is empty after trimming whitespace.
    #[error("task text cannot be empty")]
    Empty,

    /// Text is longer than the allowed maximum.
    #[error("task text is {chars} characters long (maximum {max})")]
    TooLong {
        /// Length of the trimmed text.
        chars: usize,
        /// The maximum allowed.
        max: usize,
    },

    /// Text contains a control character such as a newline or NUL.
    #[error("task text cannot contain control characters")]
    ControlCharacter,
}

/// Trim and validate task text, returning the normalized text.
///
/// # Errors
///
/// Returns a [`ValidationError`] if the trimmed text is empty, longer than
/// [`MAX_TEXT_CHARS`], or contains control characters.
pub fn validate_text(raw: &str) -> Result<String, ValidationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ValidationError::Empty);
    }

    let chars = text.chars().count();
    if chars > MAX_TEXT_CHARS {
        return Err(ValidationError::TooLong { chars, max: MAX_TEXT_CHARS });
    }

    if text.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacter);
    }

    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_text_is_trimmed() {
        assert_eq!(validate_text("  Buy milk  ").unwrap(), "Buy milk");
        assert_eq!(validate_text("Buy milk").unwrap(), "Buy milk");
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(validate_text(""), Err(ValidationError::Empty));
        assert_eq!(validate_text("   "), Err(ValidationError::Empty));
        assert_eq!(validate_text("\t\n "), Err(ValidationError::Empty));
    }

    #[test]
    fn test_length_limit() {
        assert!(validate_text(&"x".repeat(280)).is_ok());
        assert_eq!(
            validate_text(&"x".repeat(281)),
            Err(ValidationError::TooLong { chars: 281, max: 280 })
        );
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 280 three-byte characters is still within the limit.
        assert!(validate_text(&"日".repeat(280)).is_ok());
    }

    #[test]
    fn test_surrounding_whitespace_does_not_count() {
        let padded = format!("   {}   ", "x".repeat(280));
        assert!(validate_text(&padded).is_ok());
    }

    #[test]
    fn test_control_characters_rejected() {
        assert_eq!(validate_text("line one\nline two"), Err(ValidationError::ControlCharacter));
        assert_eq!(validate_text("nul\0byte"), Err(ValidationError::ControlCharacter));
    }
}
