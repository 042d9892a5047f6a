//! Stack-root checking.

use rustc_hash::FxHashSet;

use crate::cell::GcCell;
use crate::collector::GcState;
use crate::roots::conservative::{WordClass, classify_word};

/// Byte written into the top of a poisoned word.
pub const STACK_POISON: u8 = 0xDA;

const POISON_SHIFT: u32 = usize::BITS - 8;

/// Whether `word` was poisoned by the stack-root checker.
pub fn is_poisoned(word: usize) -> bool {
    (word >> POISON_SHIFT) as u8 == STACK_POISON
}

/// Poison every word that addresses a live thing missing from `rooted`.
/// Returns how many words were poisoned.
pub(crate) fn poison_unrooted(state: &GcState, rooted: &FxHashSet<GcCell>, words: &mut [usize]) -> usize {
    let mut poisoned = 0;
    for word in words.iter_mut() {
        let WordClass::Valid(cell) = classify_word(state, None, *word) else {
            continue;
        };
        if rooted.contains(&cell) {
            continue;
        }
        tracing::warn!(?cell, "unrooted thing on the value stack");
        *word = (*word & !(0xFF << POISON_SHIFT)) | ((STACK_POISON as usize) << POISON_SHIFT);
        poisoned += 1;
    }
    poisoned
}
