//! Compartments: the unit of partial collection.
//!
//! Every thing belongs to exactly one compartment. Compartment 0 holds the
//! atoms; it is never collected on its own and never destroyed while the
//! runtime lives.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::cell::GcCell;
use crate::config::GcConfig;
use crate::heap::arena_lists::ArenaLists;
use crate::heap::chunk::AvailableList;
use crate::trigger::HeapTrigger;

/// Identifies a compartment within one runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompartmentId(u32);

impl CompartmentId {
    /// The atoms compartment.
    pub const ATOMS: CompartmentId = CompartmentId(0);

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Numeric id, unique for the lifetime of the runtime.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether this is the atoms compartment.
    pub const fn is_atoms(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_atoms() {
            f.write_str("Compartment(atoms)")
        } else {
            write!(f, "Compartment({})", self.0)
        }
    }
}

/// Per-compartment collector state.
#[derive(Debug)]
pub(crate) struct Compartment {
    pub(crate) id: CompartmentId,
    pub(crate) is_system: bool,
    /// Pinned compartments survive sweeping even when empty.
    pub(crate) hold: bool,
    pub(crate) arenas: ArenaLists,
    pub(crate) trigger: HeapTrigger,
    /// Wrapped target in another compartment → wrapper in this one.
    pub(crate) wrappers: FxHashMap<GcCell, GcCell>,
}

impl Compartment {
    pub(crate) fn new(id: CompartmentId, is_system: bool, config: &GcConfig) -> Self {
        Self {
            id,
            is_system,
            hold: false,
            arenas: ArenaLists::new(),
            trigger: HeapTrigger::new(config),
            wrappers: FxHashMap::default(),
        }
    }

    /// Available-chunk list this compartment allocates from.
    #[inline]
    pub(crate) fn available_list(&self) -> AvailableList {
        if self.is_system {
            AvailableList::System
        } else {
            AvailableList::User
        }
    }

    /// Can be destroyed by a full collection.
    pub(crate) fn is_collectable_empty(&self) -> bool {
        !self.id.is_atoms() && !self.hold && self.arenas.are_empty()
    }

    /// Remove wrapper entries whose wrapper or target is dying.
    pub(crate) fn sweep_wrappers(&mut self, is_dying: impl Fn(GcCell) -> bool) -> usize {
        let before = self.wrappers.len();
        self.wrappers
            .retain(|&target, &mut wrapper| !is_dying(target) && !is_dying(wrapper));
        before - self.wrappers.len()
    }
}
