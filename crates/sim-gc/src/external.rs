//! Storage outside the object graph that holds object handles
//!
//! Player records, fixed slot tables and static globals keep handles to
//! managed objects without being managed objects themselves. The collector
//! cannot see them through descriptors, so each such storage category
//! registers at startup:
//!
//! - [`ExternalHolder`] lets pointer substitution find and patch its handles
//!   when an object is destroyed outside the sweep. Storage that skips
//!   registration keeps dangling handles after a manual destroy.
//! - [`RootSource`] lets the storage act as a root during marking.
//!
//! Stores into registered storage during marking must go through
//! [`Collector::write_barrier_root`](crate::Collector::write_barrier_root).

use std::cell::RefCell;
use std::rc::Rc;

use crate::collector::Collector;
use crate::object::ObjId;

/// Non-graph storage that can patch the handles it holds
pub trait ExternalHolder {
    /// Category name for diagnostics
    fn name(&self) -> &str;

    /// Replace every handle equal to `old` with `new`; returns the count.
    fn substitute(&mut self, old: ObjId, new: Option<ObjId>) -> usize;
}

/// Non-graph storage whose handles keep objects alive
pub trait RootSource {
    /// Mark every handle held
    fn mark_roots(&mut self, marker: &mut RootMarker<'_>);
}

/// Passed to [`RootSource::mark_roots`]
pub struct RootMarker<'a> {
    collector: &'a mut Collector,
}

impl<'a> RootMarker<'a> {
    pub(crate) fn new(collector: &'a mut Collector) -> Self {
        Self { collector }
    }

    /// Mark the object in `slot`. Clears the slot if the object is gone or
    /// waiting to be destroyed.
    pub fn mark(&mut self, slot: &mut Option<ObjId>) {
        self.collector.mark(slot);
    }
}

/// Registered holders and root sources
#[derive(Default)]
pub(crate) struct HolderRegistry {
    holders: Vec<Rc<RefCell<dyn ExternalHolder>>>,
    roots: Vec<Rc<RefCell<dyn RootSource>>>,
}

impl HolderRegistry {
    pub(crate) fn add_holder(&mut self, holder: Rc<RefCell<dyn ExternalHolder>>) {
        self.holders.push(holder);
    }

    pub(crate) fn add_root(&mut self, root: Rc<RefCell<dyn RootSource>>) {
        self.roots.push(root);
    }

    pub(crate) fn holder_count(&self) -> usize {
        self.holders.len()
    }

    pub(crate) fn roots(&self) -> Vec<Rc<RefCell<dyn RootSource>>> {
        self.roots.clone()
    }

    /// Run every holder's scan.
    ///
    /// # Panics
    /// Panics if a holder is borrowed elsewhere; a skipped holder would keep a
    /// dangling handle.
    pub(crate) fn substitute_all(&self, old: ObjId, new: Option<ObjId>) -> usize {
        let mut changed = 0;
        for holder in &self.holders {
            let mut holder = holder.borrow_mut();
            let count = holder.substitute(old, new);
            if count > 0 {
                tracing::trace!(
                    target: "sim::gc",
                    holder = holder.name(),
                    count,
                    "patched external holder"
                );
            }
            changed += count;
        }
        changed
    }
}

/// Fixed-size table of handles, e.g. a corpse queue or per-sector slots.
#[derive(Debug, Clone)]
pub struct SlotTable<const N: usize> {
    name: &'static str,
    slots: [Option<ObjId>; N],
}

impl<const N: usize> SlotTable<N> {
    /// Create an empty table
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: [None; N],
        }
    }

    /// Number of slots
    pub const fn len(&self) -> usize {
        N
    }

    /// Whether the table has no slots
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Handle in slot `index`
    pub fn get(&self, index: usize) -> Option<ObjId> {
        self.slots.get(index).copied().flatten()
    }

    /// Store a handle, returning the previous one.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, value: Option<ObjId>) -> Option<ObjId> {
        std::mem::replace(&mut self.slots[index], value)
    }

    /// Iterate over the slots
    pub fn iter(&self) -> impl Iterator<Item = Option<ObjId>> + '_ {
        self.slots.iter().copied()
    }

    /// Whether any slot holds `id`
    pub fn contains(&self, id: ObjId) -> bool {
        self.slots.contains(&Some(id))
    }

    /// Empty every slot
    pub fn clear(&mut self) {
        self.slots = [None; N];
    }
}

impl<const N: usize> ExternalHolder for SlotTable<N> {
    fn name(&self) -> &str {
        self.name
    }

    fn substitute(&mut self, old: ObjId, new: Option<ObjId>) -> usize {
        let mut changed = 0;
        for slot in self.slots.iter_mut().filter(|slot| **slot == Some(old)) {
            *slot = new;
            changed += 1;
        }
        changed
    }
}

impl<const N: usize> RootSource for SlotTable<N> {
    fn mark_roots(&mut self, marker: &mut RootMarker<'_>) {
        for slot in &mut self.slots {
            marker.mark(slot);
        }
    }
}
