//! Collector configuration.
//!
//! Chunk and arena geometry are compile-time constants (see [`crate::heap`]);
//! everything here is a tunable that can differ between runtimes.

use std::time::Duration;
use thiserror::Error;

use crate::heap::ARENA_SIZE;

/// Whether allocation pressure schedules whole-heap or per-compartment
/// collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcMode {
    /// Every triggered collection covers the whole heap.
    #[default]
    Global,
    /// A compartment over its own quota may be collected alone.
    Compartment,
}

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// # Example
///
/// ```ignore
/// use ember_gc::{GcConfig, GcMode};
///
/// let config = GcConfig {
///     mode: GcMode::Compartment,
///     max_bytes: 256 * 1024 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Heap Limits
    // =========================================================================
    /// Hard limit on bytes held in allocated arenas, across all compartments.
    ///
    /// Allocation beyond this runs a last-ditch collection and then fails
    /// with [`GcError::OutOfMemory`](crate::GcError::OutOfMemory).
    ///
    /// Default: unlimited (`usize::MAX`)
    pub max_bytes: usize,

    /// Floor for the post-collection size that trigger thresholds grow from.
    ///
    /// Default: 30MB
    pub allocation_threshold: usize,

    /// Multiplier applied to the post-collection size to obtain the next
    /// trigger.
    ///
    /// Default: 3.0
    pub heap_growth_factor: f64,

    // =========================================================================
    // Scheduling
    // =========================================================================
    /// Collection granularity for scheduled collections.
    ///
    /// Default: [`GcMode::Global`]
    pub mode: GcMode,

    /// Idle interval after which `maybe_gc` runs a shrinking collection if
    /// the chunk pool looks oversized.
    ///
    /// Default: 20 seconds
    pub idle_full_span: Duration,

    /// Number of expiry passes an empty chunk survives in the pool before it
    /// is returned to the OS.
    ///
    /// Default: 4
    pub max_empty_chunk_age: u32,

    /// Number of free committed arenas above which an idle shrink is worth
    /// running.
    ///
    /// Default: 8MB worth of arenas
    pub free_committed_arenas_threshold: usize,

    // =========================================================================
    // Marking
    // =========================================================================
    /// Maximum number of entries on the explicit mark stack before children
    /// are deferred to delayed arena marking.
    ///
    /// Default: 32768
    pub mark_stack_limit: usize,

    // =========================================================================
    // Background Helper
    // =========================================================================
    /// Hand background-finalizable kinds to the helper thread.
    ///
    /// Default: true
    pub background_finalization: bool,

    /// Let the helper thread pre-map chunks when the pool runs dry.
    ///
    /// Default: true
    pub background_allocation: bool,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Scan the native stack conservatively. Only honored when the crate is
    /// built with the `conservative` feature.
    ///
    /// Default: false
    pub conservative_stack_scanning: bool,

    /// Enable the write-barrier verifier. Only honored when the crate is
    /// built with the `verify` feature.
    ///
    /// Default: false
    pub verify_barriers: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            // Limits
            max_bytes: usize::MAX,
            allocation_threshold: 30 * 1024 * 1024, // 30MB
            heap_growth_factor: 3.0,

            // Scheduling
            mode: GcMode::Global,
            idle_full_span: Duration::from_secs(20),
            max_empty_chunk_age: 4,
            free_committed_arenas_threshold: (8 * 1024 * 1024) / ARENA_SIZE,

            // Marking
            mark_stack_limit: 32 * 1024,

            // Helper
            background_finalization: true,
            background_allocation: true,

            // Debugging
            conservative_stack_scanning: false,
            verify_barriers: false,
        }
    }
}

impl GcConfig {
    /// Configuration that keeps the heap and chunk pool small.
    pub fn low_memory() -> Self {
        Self {
            allocation_threshold: 4 * 1024 * 1024, // 4MB
            heap_growth_factor: 1.5,
            max_empty_chunk_age: 1,
            free_committed_arenas_threshold: (1024 * 1024) / ARENA_SIZE,
            background_allocation: false,
            ..Default::default()
        }
    }

    /// Configuration that trades memory for fewer collections.
    pub fn high_throughput() -> Self {
        Self {
            allocation_threshold: 128 * 1024 * 1024, // 128MB
            heap_growth_factor: 4.0,
            max_empty_chunk_age: 8,
            ..Default::default()
        }
    }

    /// Deterministic configuration for tests: no helper thread, small
    /// thresholds, tiny mark stack so delayed marking is exercised.
    pub fn for_testing() -> Self {
        Self {
            allocation_threshold: 1024 * 1024, // 1MB
            heap_growth_factor: 2.0,
            mark_stack_limit: 64,
            background_finalization: false,
            background_allocation: false,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.heap_growth_factor >= 1.0 && self.heap_growth_factor.is_finite()) {
            return Err(ConfigError::InvalidGrowthFactor(self.heap_growth_factor));
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::ZeroHeapLimit);
        }
        if self.mark_stack_limit < MIN_MARK_STACK {
            return Err(ConfigError::MarkStackTooSmall(self.mark_stack_limit));
        }
        if self.idle_full_span.is_zero() {
            return Err(ConfigError::ZeroIdleSpan);
        }
        if self.max_empty_chunk_age == 0 {
            return Err(ConfigError::ZeroChunkAge);
        }
        Ok(())
    }
}

/// Smallest usable mark stack.
pub const MIN_MARK_STACK: usize = 16;

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ConfigError {
    /// Growth factor must be finite and at least 1.0.
    #[error("heap growth factor must be finite and >= 1.0, got {0}")]
    InvalidGrowthFactor(f64),
    /// `max_bytes` of zero would fail every allocation.
    #[error("heap limit must be non-zero")]
    ZeroHeapLimit,
    /// Mark stack below [`MIN_MARK_STACK`] entries.
    #[error("mark stack limit {0} is below the minimum of {MIN_MARK_STACK}")]
    MarkStackTooSmall(usize),
    /// Idle span must be positive.
    #[error("idle collection span must be non-zero")]
    ZeroIdleSpan,
    /// Chunks must survive at least one expiry pass.
    #[error("maximum empty chunk age must be at least 1")]
    ZeroChunkAge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(GcConfig::low_memory().validate().is_ok());
        assert!(GcConfig::high_throughput().validate().is_ok());
        assert!(GcConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_default_free_arena_threshold_is_8mb() {
        let config = GcConfig::default();
        assert_eq!(
            config.free_committed_arenas_threshold * ARENA_SIZE,
            8 * 1024 * 1024
        );
    }

    #[test]
    fn test_invalid_growth_factor() {
        let config = GcConfig {
            heap_growth_factor: 0.5,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidGrowthFactor(0.5)));

        let config = GcConfig {
            heap_growth_factor: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGrowthFactor(_))
        ));
    }

    #[test]
    fn test_invalid_mark_stack() {
        let config = GcConfig {
            mark_stack_limit: 4,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MarkStackTooSmall(4)));
    }

    #[test]
    fn test_zero_chunk_age_rejected() {
        let config = GcConfig {
            max_empty_chunk_age: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroChunkAge));
    }
}
