//! Error types
//!
//! Errors are split by concern: the mixing session, asset decoding, and the
//! platform audio session. Decode errors are `Clone` because a single failure
//! is fanned out to every requester waiting on the same asset.

use thiserror::Error;

/// Errors raised by the mixing session and its configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SoundError {
    /// `initialize` was called on a manager that is already initialized.
    #[error("sound manager is already initialized")]
    AlreadyInitialized,

    /// The generator is already registered with the manager.
    #[error("sound generator {0} is already registered")]
    DuplicateGenerator(u64),

    /// The generator was never registered (or has already been removed).
    #[error("sound generator {0} is not registered")]
    UnknownGenerator(u64),

    /// A category name that was not supplied at initialization.
    #[error("unknown sound category: {0}")]
    UnknownCategory(String),

    /// The same category name was supplied more than once.
    #[error("duplicate sound category: {0}")]
    DuplicateCategory(String),

    /// Attempted to remove a ducking property that was never added.
    #[error("ducking property is not registered")]
    UnknownDuckingProperty,

    /// The manager was used in a way that requires initialization.
    #[error("sound manager is not initialized")]
    NotInitialized,

    /// Configuration document could not be parsed.
    #[error("invalid sound configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for SoundError {
    fn from(e: serde_json::Error) -> Self {
        SoundError::InvalidConfig(e.to_string())
    }
}

/// Errors produced while fetching or decoding an audio asset.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The remote reference could not be fetched.
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The inline payload is not a well-formed `data:audio/...;base64,` URI.
    #[error("malformed data URI: {0}")]
    InvalidDataUri(String),

    /// The inline payload is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    /// The platform decoder does not understand this format.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The bytes claimed a supported format but could not be decoded.
    #[error("corrupt audio data: {0}")]
    Corrupt(String),
}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self {
        DecodeError::Base64(e.to_string())
    }
}

impl From<hound::Error> for DecodeError {
    fn from(e: hound::Error) -> Self {
        DecodeError::Corrupt(e.to_string())
    }
}

/// Errors raised by the platform audio session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The host refused to resume the session (autoplay policy, no gesture).
    #[error("audio session resume was rejected by the host")]
    ResumeRejected,

    /// The session has been closed and can never run again.
    #[error("audio session is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sound_error_display() {
        let err = SoundError::UnknownCategory("ui".into());
        assert_eq!(err.to_string(), "unknown sound category: ui");
        assert_eq!(
            SoundError::DuplicateGenerator(7).to_string(),
            "sound generator 7 is already registered"
        );
    }

    #[test]
    fn test_config_error_from_json() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let err: SoundError = parse.unwrap_err().into();
        assert!(matches!(err, SoundError::InvalidConfig(_)));
    }

    #[test]
    fn test_decode_error_is_cloneable_for_fan_out() {
        let err = DecodeError::UnsupportedFormat("audio/ogg".into());
        let copies = vec![err.clone(), err.clone()];
        assert!(copies.iter().all(|e| *e == err));
    }
}
