//! Error types for slap-core

use thiserror::Error;

use crate::ambient::EffectId;
use crate::logging::LogError;
use crate::validator::{FieldId, ValidationState};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slap-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Edit-session errors from the debounce validator
    #[error("Validator error: {0}")]
    Validator(#[from] ValidatorError),

    /// Effect playback errors
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    /// Logging setup errors
    #[error("Logging error: {0}")]
    Logging(#[from] LogError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Errors surfaced by [`DebounceValidator`](crate::validator::DebounceValidator).
///
/// Superseded or cancelled checks are not errors; they are dropped silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorError {
    /// Input arrived for a field that has no open edit session
    #[error("No edit session for field {0}")]
    NoSession(FieldId),

    /// Submit attempted while the candidate value is not confirmed available
    #[error("Submit blocked for field {field}: state is {state}")]
    SubmitBlocked {
        field: FieldId,
        state: ValidationState,
    },
}

/// Errors reported by an [`EffectPlayer`](crate::ambient::EffectPlayer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// The effect id does not resolve to a playable resource
    #[error("Effect not found: {0}")]
    NotFound(EffectId),

    /// The output device or session is not available
    #[error("Playback unavailable: {0}")]
    Unavailable(String),

    /// The resource was found but could not be started
    #[error("Failed to play {effect}: {reason}")]
    Failed { effect: EffectId, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_error() {
        let err: Error = ConfigError::ValidationError("bad range".to_string()).into();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Config error: Validation error: bad range");
    }

    #[test]
    fn validator_error_display_includes_state() {
        let err = ValidatorError::SubmitBlocked {
            field: FieldId::from("username"),
            state: ValidationState::Unavailable,
        };
        assert_eq!(
            err.to_string(),
            "Submit blocked for field username: state is unavailable"
        );
    }

    #[test]
    fn no_session_display() {
        let err = ValidatorError::NoSession(FieldId::from("display_name"));
        assert_eq!(err.to_string(), "No edit session for field display_name");
    }

    #[test]
    fn playback_error_display() {
        let err = PlaybackError::Failed {
            effect: EffectId::from("whip2.wav"),
            reason: "decoder error".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to play whip2.wav: decoder error");
        let wrapped: Error = err.into();
        assert!(matches!(wrapped, Error::Playback(_)));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(err.to_string().starts_with("I/O error"));
    }
}
