//! Destination number and message text validation
//!
//! Runs before a send request is queued, so malformed input never reaches the modem.

use crate::error::GatewayError;

/// Destination validation errors with helpful messages
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DestinationError {
    #[error("Destination number is empty")]
    Empty,

    #[error("Destination number is too short (minimum {min} digits)")]
    TooShort { min: usize },

    #[error("Destination number is too long (maximum {max} digits)")]
    TooLong { max: usize },

    #[error("Destination number contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },

    #[error("'+' is only allowed as the first character")]
    MisplacedPlus,
}

/// Message text validation errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TextError {
    #[error("Message text is empty")]
    Empty,

    #[error("Message text is too long (maximum {max} characters)")]
    TooLong { max: usize },
}

/// Number validation rules
#[derive(Debug, Clone)]
pub struct DestinationRules {
    pub min_digits: usize,
    pub max_digits: usize,
}

impl Default for DestinationRules {
    fn default() -> Self {
        // E.164 caps at 15 digits; short codes go down to 3
        DestinationRules {
            min_digits: 3,
            max_digits: 15,
        }
    }
}

/// Longest text accepted for a single logical send (split into parts by the gateway).
pub const MAX_TEXT_CHARS: usize = 1530;

/// Validate and normalize a destination number.
///
/// Accepts the same shapes a dashboard text field would (`+420 777-123 456`,
/// `(555) 0100`), strips the separators, and returns `+?digits`.
pub fn validate_destination(number: &str, rules: &DestinationRules) -> Result<String, DestinationError> {
    let trimmed = number.trim();
    if trimmed.is_empty() {
        return Err(DestinationError::Empty);
    }

    let mut normalized = String::with_capacity(trimmed.len());
    let mut invalid = Vec::new();
    for (i, ch) in trimmed.chars().enumerate() {
        match ch {
            '0'..='9' => normalized.push(ch),
            '+' if i == 0 => normalized.push(ch),
            '+' => return Err(DestinationError::MisplacedPlus),
            ' ' | '-' | '(' | ')' | '.' => {}
            other => invalid.push(other),
        }
    }

    if !invalid.is_empty() {
        invalid.sort_unstable();
        invalid.dedup();
        let chars = invalid
            .into_iter()
            .map(|c| {
                if c.is_control() {
                    format!("\\u{{{:04x}}}", c as u32)
                } else {
                    c.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DestinationError::InvalidCharacters { chars });
    }

    let digits = normalized.trim_start_matches('+').len();
    if digits < rules.min_digits {
        return Err(DestinationError::TooShort { min: rules.min_digits });
    }
    if digits > rules.max_digits {
        return Err(DestinationError::TooLong { max: rules.max_digits });
    }
    Ok(normalized)
}

/// Reject empty or oversized text.
pub fn validate_message_text(text: &str) -> Result<(), TextError> {
    if text.trim().is_empty() {
        return Err(TextError::Empty);
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(TextError::TooLong { max: MAX_TEXT_CHARS });
    }
    Ok(())
}

impl From<DestinationError> for GatewayError {
    fn from(e: DestinationError) -> Self {
        GatewayError::InvalidDestination(e.to_string())
    }
}

impl From<TextError> for GatewayError {
    fn from(e: TextError) -> Self {
        GatewayError::InvalidText(e.to_string())
    }
}
