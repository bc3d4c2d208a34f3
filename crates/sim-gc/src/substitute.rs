//! Pointer substitution and manual destruction
//!
//! An object destroyed outside the sweep may still be referenced from other
//! objects and from registered external storage. Before it is freed every
//! such reference is rewritten, so nothing is left dangling:
//!
//! 1. every object on the root list has its declared and native references
//!    to the victim replaced;
//! 2. every registered [`ExternalHolder`](crate::ExternalHolder) does the same;
//! 3. the victim leaves the root list and the gray list;
//! 4. the number of replaced references is reported.
//!
//! Substitution always runs to completion. Running it again for the same
//! handle finds nothing.

use crate::collector::{Collector, LinkPos};
use crate::error::{GcError, Result};
use crate::object::{MarkColor, ObjId, ObjectFlags, ObjectState};

impl Collector {
    /// Replace every reference to `old` with `new` in the graph and in
    /// registered holders, then unlink `old` from the collector lists.
    ///
    /// Returns the number of references replaced. The unlinked object stays
    /// allocated until [`destroy_now`](Self::destroy_now) or
    /// [`shutdown`](Self::shutdown) frees it.
    pub fn substitute(&mut self, old: ObjId, new: Option<ObjId>) -> usize {
        let changed = self.replace_references(old, new);

        let linked = self.get(old).is_some_and(|obj| {
            matches!(
                obj.header.state(),
                ObjectState::Live | ObjectState::PendingSubstitution
            )
        });
        if linked {
            self.unlink_gray(old.index);
            self.unlink_root(old.index);
            self.object_at_mut(old.index)
                .header
                .set_state(ObjectState::Unlinked);
        }
        changed
    }

    /// Replace references to `old` with `new` without unlinking anything,
    /// for swapping one live object for another.
    pub fn replace_references(&mut self, old: ObjId, new: Option<ObjId>) -> usize {
        let mut changed = 0;
        let mut cursor = self.root_head;
        while let Some(index) = cursor {
            let obj = self.object_at_mut(index);
            changed += obj.substitute_references(old, new);
            cursor = obj.header.root_next;
        }
        changed += self.external.substitute_all(old, new);

        // A black holder that now points at a white replacement must not
        // hide it from the current mark.
        if let Some(new) = new {
            self.write_barrier_root(new);
        }

        self.stats.last_substitutions = changed;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "sim::gc", ?old, ?new, changed, "pointer substitution");

        changed
    }

    /// Destroy an object immediately.
    ///
    /// Every reference to it is nulled through [`substitute`](Self::substitute),
    /// its teardown hook runs and its slot is freed. Returns the number of
    /// references cleared. Freeing outside the sweep logs a warning unless the
    /// object was flagged with [`set_yes_really_delete`](Self::set_yes_really_delete).
    pub fn destroy_now(&mut self, id: ObjId) -> Result<usize> {
        let obj = self.get(id).ok_or(GcError::StaleHandle(id))?;
        let flags = obj.header.flags();
        let class = obj.class_name();
        let state = obj.header.state();

        if self.shutting_down || flags.contains(ObjectFlags::CLEANUP) {
            self.unlink_gray(id.index);
            self.unlink_root(id.index);
            self.release(id.index);
            return Ok(0);
        }

        if !flags.contains(ObjectFlags::YES_REALLY_DELETE) {
            tracing::warn!(target: "sim::gc", class, ?id, "'{class}' is freed outside the GC process");
        }

        if state == ObjectState::Live {
            self.object_at_mut(id.index)
                .header
                .set_state(ObjectState::PendingSubstitution);
        }
        let changed = self.substitute(id, None);
        self.release(id.index);
        self.stats.manual_frees += 1;
        Ok(changed)
    }

    /// Remove `index` from the root list. If the sweep cursor sits on the
    /// removed link it moves back to the predecessor.
    fn unlink_root(&mut self, index: u32) {
        let mut pos = LinkPos::Head;
        let mut cursor = self.root_head;
        while let Some(current) = cursor {
            let next = self.object_at(current).header.root_next;
            if current == index {
                if self.sweep_pos == LinkPos::After(index) {
                    self.sweep_pos = pos;
                }
                self.object_at_mut(index).header.root_next = None;
                self.set_link(pos, next);
                return;
            }
            pos = LinkPos::After(current);
            cursor = next;
        }
    }

    /// Remove `index` from the gray list if it is gray.
    fn unlink_gray(&mut self, index: u32) {
        if self.object_at(index).header.mark() != MarkColor::Gray {
            return;
        }
        let next = self.object_at_mut(index).header.gray_next.take();
        if self.gray_head == Some(index) {
            self.gray_head = next;
            return;
        }
        let mut cursor = self.gray_head;
        while let Some(current) = cursor {
            let header = &mut self.object_at_mut(current).header;
            if header.gray_next == Some(index) {
                header.gray_next = next;
                return;
            }
            cursor = header.gray_next;
        }
    }
}
