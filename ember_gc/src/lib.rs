//! Ember Garbage Collector
//!
//! A non-moving mark-and-sweep collector with compartment-scoped
//! collections, built for an embedded scripting runtime.
//!
//! # Architecture
//!
//! - **Chunks**: memory is mapped from the OS in 1 MiB chunks aligned to
//!   their size, so any thing's address identifies its chunk and arena by
//!   masking. Empty chunks age in a pool before being unmapped.
//!
//! - **Arenas**: each chunk holds 256 arenas of 4 KiB. An allocated arena
//!   holds things of one [`AllocKind`] for one compartment, tracks its free
//!   slots as a list of spans, and keeps two mark bits per cell.
//!
//! - **Compartments**: isolated heaps sharing the chunk layer. A collection
//!   covers either the whole runtime or a single compartment, in which case
//!   wrapper targets held by other compartments act as roots.
//!
//! - **Helper thread**: finalizes background-safe kinds after the GC lock is
//!   released, refills the chunk pool, and decommits free arenas.
//!
//! # Usage
//!
//! ```ignore
//! use ember_gc::{AllocKind, GcConfig, Runtime, TraceKind};
//!
//! let rt = Runtime::new(GcConfig::default())?;
//! rt.set_trace_hook(TraceKind::Object, |view, tracer| {
//!     for i in ember_gc::OBJECT_HEADER_WORDS..view.len() {
//!         tracer.trace_word(view.word(i));
//!     }
//! })?;
//!
//! let comp = rt.create_compartment(false);
//! let scope = rt.root_scope();
//! let obj = scope.root(rt.alloc(comp, AllocKind::Object4)?);
//! rt.gc()?;
//! assert!(rt.is_live(obj));
//! ```
//!
//! # Rooting
//!
//! A thing survives a collection only if it is reachable from a root:
//! a [`RootScope`], a named root, a locked thing, a pinned atom, an
//! embedder root tracer, or (with the `conservative` feature) a word on the
//! native stack. Edges between things are discovered solely through the
//! trace hook installed for their [`TraceKind`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod heap;
pub mod trace;
#[cfg(feature = "verify")]
pub mod verify;

mod cell;
mod compartment;
mod config;
mod error;
mod helper;
mod kind;
mod roots;
mod runtime;
mod stats;
mod trigger;
mod weak;

// Re-exports for convenient access
pub use cell::{GcCell, ThingView};
pub use collector::{GcKind, GcReason, GcStatus};
pub use compartment::CompartmentId;
pub use config::{ConfigError, GcConfig, GcMode, MIN_MARK_STACK};
pub use error::{GcError, GcResult};
pub use heap::platform::{FaultInjectingPages, PageAllocator, SystemPages};
pub use helper::HelperState;
pub use kind::{AllocKind, OBJECT_HEADER_WORDS, TraceKind};
pub use roots::{ConservativeStats, RootScope};
pub use runtime::{KeepAtoms, Runtime};
pub use stats::{GcPhase, GcStats, GcStatsSnapshot};
pub use trace::{CollectingTracer, CountingTracer, NullTracer, TraceHooks, Tracer};
pub use weak::{Liveness, WeakMapId, WeakMarker, WeakRoots};
#[cfg(feature = "verify")]
pub use verify::{BarrierReport, BarrierViolation};
