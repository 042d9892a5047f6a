//! Shadow root stack and scoped rooting.
//!
//! Rust code holding cells across anything that may collect roots them in a
//! [`RootScope`]. Scopes push onto a per-runtime shadow stack and pop back
//! to their base when dropped, so nested scopes unwind in LIFO order.

use std::cell::RefCell;
use std::fmt;

use crate::cell::GcCell;

#[derive(Debug, Default)]
pub(crate) struct ShadowStack {
    cells: RefCell<Vec<GcCell>>,
}

impl ShadowStack {
    pub(crate) fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    fn push(&self, cell: GcCell) {
        self.cells.borrow_mut().push(cell);
    }

    fn truncate(&self, len: usize) {
        self.cells.borrow_mut().truncate(len);
    }

    pub(crate) fn contains(&self, cell: GcCell) -> bool {
        self.cells.borrow().contains(&cell)
    }

    /// Copy of the rooted cells, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<GcCell> {
        self.cells.borrow().clone()
    }
}

/// A scope whose rooted cells survive collections until it is dropped.
///
/// # Example
///
/// ```ignore
/// let scope = rt.root_scope();
/// let list = scope.root(rt.alloc(comp, AllocKind::Object2)?);
/// let item = rt.alloc(comp, AllocKind::Object0)?; // may collect; `list` survives
/// rt.write_edge(list, 4, Some(item))?;
/// ```
pub struct RootScope<'rt> {
    stack: &'rt ShadowStack,
    base: usize,
}

impl<'rt> RootScope<'rt> {
    pub(crate) fn new(stack: &'rt ShadowStack) -> Self {
        Self {
            base: stack.len(),
            stack,
        }
    }

    /// Root `cell` for the lifetime of the scope and hand it back.
    pub fn root(&self, cell: GcCell) -> GcCell {
        self.stack.push(cell);
        cell
    }

    /// Root a possibly-null edge.
    pub fn root_edge(&self, edge: Option<GcCell>) -> Option<GcCell> {
        edge.map(|cell| self.root(cell))
    }

    /// Cells rooted by this scope and by scopes nested inside it.
    pub fn len(&self) -> usize {
        self.stack.len().saturating_sub(self.base)
    }

    /// Whether nothing is rooted by this scope.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RootScope<'_> {
    fn drop(&mut self) {
        self.stack.truncate(self.base);
    }
}

impl fmt::Debug for RootScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootScope")
            .field("base", &self.base)
            .field("len", &self.len())
            .finish()
    }
}
