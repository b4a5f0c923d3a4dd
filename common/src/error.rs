//! Error types for Bridge-Me-Not coordination.

use crate::{SwapId, SwapStatus};
use thiserror::Error;

/// Main error type for swap coordination.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A record with this id already exists.
    #[error("Swap already exists: {0}")]
    AlreadyExists(SwapId),

    /// No record with this id.
    #[error("Swap not found: {0}")]
    NotFound(SwapId),

    /// The caller presented a stale version.
    #[error("Version conflict on swap {swap_id}: expected {expected}, stored {actual}")]
    VersionConflict {
        swap_id: SwapId,
        expected: u64,
        actual: u64,
    },

    /// The caller does not hold the lock it claims to hold.
    #[error("Lock not held on {resource} by {holder}")]
    LockNotHeld { resource: String, holder: String },

    /// The lock is held by another instance and retries were exhausted.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// Packed data is internally inconsistent.
    #[error("Decode mismatch in {field}: {reason}")]
    DecodeMismatch { field: String, reason: String },

    /// A field exceeds its bit width.
    #[error("Encoding overflow: {field} does not fit in {bits} bits")]
    EncodingOverflow { field: String, bits: u32 },

    /// Invalid state transition.
    #[error("Invalid transition on swap {swap_id} from {from:?} to {to:?}")]
    InvalidTransition {
        swap_id: SwapId,
        from: SwapStatus,
        to: SwapStatus,
    },

    /// The transition's patch does not satisfy its preconditions.
    #[error("Invalid patch for swap {swap_id}: {reason}")]
    InvalidPatch { swap_id: SwapId, reason: String },

    /// Backing store failed transiently.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Timeout.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Stored bytes could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The chain collaborator rejected or failed an action.
    #[error("Chain error: {0}")]
    Chain(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resolver is not accepting work.
    #[error("Resolver not running")]
    NotRunning,

    /// A lifecycle transition failed; carries the swap and attempted status.
    #[error("Transition of swap {swap_id} to {attempted:?} failed: {source}")]
    TransitionFailed {
        swap_id: SwapId,
        attempted: SwapStatus,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Wrap this error with the swap and transition it interrupted.
    pub fn in_transition(self, swap_id: SwapId, attempted: SwapStatus) -> Self {
        match self {
            already @ BridgeError::TransitionFailed { .. } => already,
            other => BridgeError::TransitionFailed {
                swap_id,
                attempted,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through transition context.
    pub fn root(&self) -> &BridgeError {
        match self {
            BridgeError::TransitionFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            BridgeError::StoreUnavailable(_) | BridgeError::Timeout(_)
        )
    }

    /// Check if the caller may recover by re-reading and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            BridgeError::AlreadyExists(_)
                | BridgeError::NotFound(_)
                | BridgeError::VersionConflict { .. }
                | BridgeError::LockUnavailable(_)
        ) || self.is_retryable()
    }

    /// Check if this error must move the swap to `Failed`.
    pub fn is_fatal_to_swap(&self) -> bool {
        matches!(self.root(), BridgeError::DecodeMismatch { .. })
    }

    /// Get error code for logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::AlreadyExists(_) => "ALREADY_EXISTS",
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::VersionConflict { .. } => "VERSION_CONFLICT",
            BridgeError::LockNotHeld { .. } => "LOCK_NOT_HELD",
            BridgeError::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            BridgeError::DecodeMismatch { .. } => "DECODE_MISMATCH",
            BridgeError::EncodingOverflow { .. } => "ENCODING_OVERFLOW",
            BridgeError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BridgeError::InvalidPatch { .. } => "INVALID_PATCH",
            BridgeError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            BridgeError::Timeout(_) => "TIMEOUT",
            BridgeError::Serialization(_) => "SERIALIZATION",
            BridgeError::Chain(_) => "CHAIN_ERROR",
            BridgeError::Configuration(_) => "CONFIGURATION_ERROR",
            BridgeError::NotRunning => "NOT_RUNNING",
            BridgeError::TransitionFailed { source, .. } => source.error_code(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}

/// Result type alias for Bridge-Me-Not operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
