//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use ember_gc::{GcCell, GcConfig, OBJECT_HEADER_WORDS, Runtime, TraceKind};

/// Runtime with the deterministic test configuration and object tracing.
pub fn runtime() -> Runtime {
    runtime_with(GcConfig::for_testing())
}

pub fn runtime_with(config: GcConfig) -> Runtime {
    let rt = Runtime::new(config).expect("runtime");
    trace_object_slots(&rt);
    rt
}

/// Objects hold edges in every slot after the header.
pub fn trace_object_slots(rt: &Runtime) {
    rt.set_trace_hook(TraceKind::Object, |view, tracer| {
        for i in OBJECT_HEADER_WORDS..view.len() {
            tracer.trace_word(view.word(i));
        }
    })
    .expect("trace hook");
}

/// Record the address of every finalized thing of `kind`.
pub fn record_finalized(rt: &Runtime, kind: TraceKind) -> Arc<Mutex<Vec<usize>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    rt.set_finalize_hook(kind, move |view| sink.lock().push(view.cell().addr()))
        .expect("finalize hook");
    log
}

pub fn was_finalized(log: &Mutex<Vec<usize>>, cell: GcCell) -> bool {
    log.lock().contains(&cell.addr())
}

/// First object slot.
pub const SLOT0: usize = OBJECT_HEADER_WORDS;
