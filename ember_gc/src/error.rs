//! Error types surfaced by the collector.
//!
//! Only recoverable conditions are represented here. Heap corruption
//! (double free, arena/kind mismatch, sweeping while marking) is reported
//! through assertions instead.

use crate::compartment::CompartmentId;
use crate::config::ConfigError;
use crate::kind::AllocKind;
use crate::weak::WeakMapId;
use thiserror::Error;

/// Errors returned by allocation, field access and compartment operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GcError {
    /// The heap quota is still exceeded after a last-ditch collection, or
    /// the platform refused to map another chunk.
    #[error("out of memory allocating {requested_kind:?} ({gc_bytes} of {max_bytes} bytes in use)")]
    OutOfMemory {
        /// Kind whose allocation failed.
        requested_kind: AllocKind,
        /// Runtime heap bytes at the time of the failure.
        gc_bytes: usize,
        /// Configured heap limit.
        max_bytes: usize,
    },

    /// The page allocator could not map a new chunk.
    #[error("failed to map a new chunk")]
    ChunkAllocationFailed,

    /// The compartment was destroyed or never existed.
    #[error("unknown compartment {0:?}")]
    UnknownCompartment(CompartmentId),

    /// The cell does not address a live thing in this runtime.
    #[error("cell does not address an allocated thing")]
    InvalidCell,

    /// The weak map was destroyed or never existed.
    #[error("unknown weak map {0:?}")]
    UnknownWeakMap(WeakMapId),

    /// A field index past the end of the thing.
    #[error("field index {index} out of bounds for a thing of {words} words")]
    FieldOutOfBounds {
        /// Requested word index.
        index: usize,
        /// Number of words in the thing.
        words: usize,
    },

    /// The operation is not allowed while a collection is running.
    #[error("a collection is already in progress")]
    CollectionInProgress,

    /// The background helper thread could not be started.
    #[error("background helper thread unavailable")]
    HelperUnavailable,

    /// The runtime was created with an invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Result alias for collector operations.
pub type GcResult<T> = Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_message_mentions_kind_and_bytes() {
        let err = GcError::OutOfMemory {
            requested_kind: AllocKind::Object4,
            gc_bytes: 4096,
            max_bytes: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("Object4"));
        assert!(msg.contains("4096 of 8192"));
    }

    #[test]
    fn test_field_out_of_bounds_message() {
        let err = GcError::FieldOutOfBounds { index: 9, words: 4 };
        assert_eq!(
            err.to_string(),
            "field index 9 out of bounds for a thing of 4 words"
        );
    }
}
