//! Debug-only heap checks, compiled with the `verify` feature.
//!
//! - [`BarrierVerifier`] snapshots the object graph reachable from the
//!   roots and, when finished, checks that every edge removed since the
//!   snapshot went through the pre-write barrier.
//! - [`poison_unrooted`] scans a word buffer standing in for a value stack
//!   and poisons words that address things no rooter holds, so a missing
//!   root fails fast instead of reading a finalized thing later.

mod barrier;
mod stack;

pub use barrier::{BarrierReport, BarrierViolation};
pub(crate) use barrier::BarrierVerifier;
pub use stack::{STACK_POISON, is_poisoned};
pub(crate) use stack::poison_unrooted;
