//! Codec error types.

use bridgemenot_common::BridgeError;
use thiserror::Error;

/// Errors raised while packing or unpacking on-chain data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A value does not fit the bit width reserved for it.
    #[error("{field} does not fit in {bits} bits")]
    EncodingOverflow { field: &'static str, bits: u32 },

    /// Packed data is inconsistent with its own layout.
    #[error("{field}: {reason}")]
    DecodeMismatch { field: &'static str, reason: String },

    /// A persisted artifact could not be parsed or written.
    #[error("artifact: {0}")]
    Artifact(String),
}

impl CodecError {
    pub(crate) fn mismatch(field: &'static str, reason: impl Into<String>) -> Self {
        CodecError::DecodeMismatch {
            field,
            reason: reason.into(),
        }
    }
}

impl From<CodecError> for BridgeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::EncodingOverflow { field, bits } => BridgeError::EncodingOverflow {
                field: field.to_string(),
                bits,
            },
            CodecError::DecodeMismatch { field, reason } => BridgeError::DecodeMismatch {
                field: field.to_string(),
                reason,
            },
            CodecError::Artifact(reason) => BridgeError::Serialization(reason),
        }
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
