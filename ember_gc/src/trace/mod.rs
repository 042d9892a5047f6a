//! Per-kind trace and finalize hooks.
//!
//! The collector knows nothing about the layout of things beyond their size.
//! For each [`TraceKind`] the embedder registers a hook that reports the
//! thing's edges and, optionally, one that releases its external resources
//! when it dies.
//!
//! Finalize hooks of background-finalized kinds run on the helper thread,
//! which is why both hook types are `Send + Sync`.

pub mod tracer;

pub use tracer::{CollectingTracer, CountingTracer, NullTracer, Tracer};

use std::fmt;
use std::sync::Arc;

use crate::cell::ThingView;
use crate::kind::{TRACE_KIND_COUNT, TraceKind};

/// Reports the edges of a thing.
pub type TraceHook = Arc<dyn Fn(&ThingView<'_>, &mut dyn Tracer) + Send + Sync>;

/// Runs when a thing is found dead during sweep.
///
/// The hook must not touch other things: they may already be finalized,
/// except that objects are finalized before strings, scripts and shapes.
pub type FinalizeHook = Arc<dyn Fn(&ThingView<'_>) + Send + Sync>;

/// Hook table indexed by trace kind.
#[derive(Clone, Default)]
pub struct TraceHooks {
    trace: [Option<TraceHook>; TRACE_KIND_COUNT],
    finalize: [Option<FinalizeHook>; TRACE_KIND_COUNT],
}

impl TraceHooks {
    /// Empty table: things have no edges and no finalizers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the trace hook for `kind`.
    pub fn set_trace<F>(&mut self, kind: TraceKind, hook: F)
    where
        F: Fn(&ThingView<'_>, &mut dyn Tracer) + Send + Sync + 'static,
    {
        self.trace[kind.index()] = Some(Arc::new(hook));
    }

    /// Install the finalize hook for `kind`.
    pub fn set_finalize<F>(&mut self, kind: TraceKind, hook: F)
    where
        F: Fn(&ThingView<'_>) + Send + Sync + 'static,
    {
        self.finalize[kind.index()] = Some(Arc::new(hook));
    }

    /// Report the children of `view`.
    #[inline]
    pub fn trace_children(&self, view: &ThingView<'_>, tracer: &mut dyn Tracer) {
        if let Some(hook) = &self.trace[view.kind().trace_kind().index()] {
            hook(view, tracer);
        }
    }

    /// Run the finalizer for `view`, if one is registered.
    #[inline]
    pub fn finalize(&self, view: &ThingView<'_>) {
        if let Some(hook) = &self.finalize[view.kind().trace_kind().index()] {
            hook(view);
        }
    }

    /// Whether `kind` has a trace hook.
    pub fn has_trace(&self, kind: TraceKind) -> bool {
        self.trace[kind.index()].is_some()
    }
}

impl fmt::Debug for TraceHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let traced = self.trace.iter().filter(|h| h.is_some()).count();
        let finalized = self.finalize.iter().filter(|h| h.is_some()).count();
        f.debug_struct("TraceHooks")
            .field("trace_hooks", &traced)
            .field("finalize_hooks", &finalized)
            .finish()
    }
}
