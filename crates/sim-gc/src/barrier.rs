//! Write barrier for incremental marking
//!
//! Marking is interleaved with the simulation, so a reference stored into an
//! object that has already been scanned would be invisible to the collector.
//! The barrier here is insertion style (Dijkstra): when a black holder gains a
//! reference to a white target, the target is grayed.
//!
//! - [`Collector::store_ref`] stores and runs the barrier.
//! - [`Collector::write_barrier`] is the barrier alone, for code that patches
//!   native state directly.
//! - [`Collector::write_barrier_root`] covers stores into registered external
//!   storage, which has no color of its own.
//!
//! In debug builds [`Collector::verify_tricolor`] runs after every mark step
//! (see [`GcConfig::verify_barriers`](crate::GcConfig::verify_barriers)) and
//! reports any black-to-white edge a missing barrier left behind.

use crate::collector::{Collector, GcPhase};
use crate::descriptor::Slot;
use crate::error::Result;
use crate::object::{MarkColor, ObjId, ObjectFlags};

/// A black object referencing a current-white object during marking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierViolation {
    /// Scanned object holding the reference
    pub holder: ObjId,
    /// Unscanned object it references
    pub target: ObjId,
}

impl Collector {
    /// Insertion barrier.
    ///
    /// Called after `target` is stored into `holder`. Only acts during the
    /// mark phase, and only when the holder is black and the target white.
    pub fn write_barrier(&mut self, holder: ObjId, target: ObjId) {
        if self.phase != GcPhase::Propagate {
            return;
        }
        let holder_black = self
            .get(holder)
            .is_some_and(|obj| obj.header.mark() == MarkColor::Black);
        if holder_black && self.is_current_white(target) {
            self.mark_object(target);
        }
    }

    /// Barrier for stores into registered external storage.
    ///
    /// Root sources may already have been scanned, so the target is grayed
    /// whenever marking is in progress.
    pub fn write_barrier_root(&mut self, target: ObjId) {
        if self.phase == GcPhase::Propagate {
            self.mark_object(target);
        }
    }

    /// Store a reference into `holder` and run the write barrier
    pub fn store_ref(&mut self, holder: ObjId, slot: Slot, target: Option<ObjId>) -> Result<()> {
        self.store_ref_unbarriered(holder, slot, target)?;
        if let Some(target) = target {
            self.write_barrier(holder, target);
        }
        Ok(())
    }

    fn is_current_white(&self, id: ObjId) -> bool {
        let white = self.current_white();
        self.get(id)
            .is_some_and(|obj| obj.header.mark() == MarkColor::White(white))
    }

    /// Every black-to-white edge in the live graph.
    ///
    /// Empty outside the mark phase. Edges to objects with destruction pending
    /// are ignored since marking drops them anyway.
    pub fn verify_tricolor(&self) -> Vec<BarrierViolation> {
        let mut violations = Vec::new();
        if self.phase != GcPhase::Propagate {
            return violations;
        }

        let mut cursor = self.root_head;
        while let Some(index) = cursor {
            let obj = self.object_at(index);
            if obj.header.mark() == MarkColor::Black {
                let holder = self.id_at(index);
                for target in obj.outgoing() {
                    if self.is_current_white(target) && self.is_alive(target) {
                        let doomed = self.flags_of(target).is_some_and(|flags| {
                            flags.contains(ObjectFlags::EUTHANIZE)
                        });
                        if !doomed {
                            violations.push(BarrierViolation { holder, target });
                        }
                    }
                }
            }
            cursor = obj.header.root_next;
        }
        violations
    }
}
