//! Root tracking.
//!
//! GC roots are the starting points for marking:
//! - Named roots registered with [`Runtime::add_root`](crate::Runtime::add_root)
//! - Locked things, pinned with a reference count
//! - Cells held in a [`RootScope`] (the shadow stack)
//! - Words on the native stack, when conservative scanning is enabled
//! - Embedder black and gray root tracers

pub(crate) mod conservative;
mod shadow;

pub use conservative::ConservativeStats;
pub use shadow::RootScope;
pub(crate) use shadow::ShadowStack;

use rustc_hash::FxHashMap;

use crate::cell::GcCell;
use crate::trace::Tracer;

/// Named roots and the locked-things table.
#[derive(Debug, Default)]
pub(crate) struct RootRegistry {
    named: FxHashMap<GcCell, Option<String>>,
    locked: FxHashMap<GcCell, u32>,
}

impl RootRegistry {
    /// Register `cell` as a root. Re-registering replaces the name.
    pub(crate) fn add_root(&mut self, cell: GcCell, name: Option<&str>) {
        self.named.insert(cell, name.map(str::to_owned));
    }

    pub(crate) fn remove_root(&mut self, cell: GcCell) -> bool {
        self.named.remove(&cell).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_root(&self, cell: GcCell) -> bool {
        self.named.contains_key(&cell)
    }

    /// Pin `cell`. Returns the new lock count.
    pub(crate) fn lock(&mut self, cell: GcCell) -> u32 {
        let count = self.locked.entry(cell).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one pin. Returns false if `cell` was not locked.
    pub(crate) fn unlock(&mut self, cell: GcCell) -> bool {
        let Some(count) = self.locked.get_mut(&cell) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.locked.remove(&cell);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self, cell: GcCell) -> bool {
        self.locked.contains_key(&cell)
    }

    #[cfg(test)]
    pub(crate) fn root_count(&self) -> usize {
        self.named.len()
    }

    pub(crate) fn trace_named(&self, tracer: &mut dyn Tracer) {
        for &cell in self.named.keys() {
            tracer.trace_cell(cell);
        }
    }

    pub(crate) fn trace_locked(&self, tracer: &mut dyn Tracer) {
        for &cell in self.locked.keys() {
            tracer.trace_cell(cell);
        }
    }

    /// Names of roots still registered, for leak reports at shutdown.
    pub(crate) fn leaked(&self) -> impl Iterator<Item = (GcCell, Option<&str>)> + '_ {
        self.named
            .iter()
            .map(|(&cell, name)| (cell, name.as_deref()))
    }

    pub(crate) fn clear(&mut self) {
        self.named.clear();
        self.locked.clear();
    }
}
