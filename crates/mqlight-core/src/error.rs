//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame tag: {0:#04x}")]
    InvalidFrameTag(u8),

    #[error("Invalid length encoding")]
    InvalidLength,

    #[error("Truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
