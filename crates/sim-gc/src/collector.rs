//! Incremental tri-color mark-sweep collector
//!
//! Objects live in a slab and are addressed by [`ObjId`] handles. Two index
//! chains run through the slab headers:
//!
//! - the **root list** links every live object, newest first. Sweep walks it
//!   with a persistent cursor.
//! - the **gray list** links objects that were reached but whose children have
//!   not been scanned yet.
//!
//! A cycle goes `Idle -> Propagate -> Sweep -> Idle`:
//!
//! 1. [`start_cycle`](Collector::start_cycle) grays the roots (objects flagged
//!    `FIXED` and every registered [`RootSource`](crate::RootSource)).
//! 2. [`mark_step`](Collector::mark_step) pops one gray object, marks what it
//!    references and blackens it. Marking never recurses.
//! 3. When the gray list drains, the atomic phase re-marks the roots, drains
//!    again and calls [`flip_epoch`](Collector::flip_epoch): the current white
//!    swaps, black survivors are recolored to the new white and anything still
//!    carrying the old white is garbage.
//! 4. [`sweep_step`](Collector::sweep_step) frees previous-white and
//!    destroy-requested objects in budgeted slices.
//!
//! Objects allocated during marking get the current white and are only kept
//! if something reaches them, which is why stores into black objects need the
//! write barrier (see [`barrier`](crate::barrier)).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::GcConfig;
use crate::descriptor::{ClassInfo, Slot, TypeRegistry};
use crate::error::{GcError, Result};
use crate::external::{ExternalHolder, HolderRegistry, RootMarker, RootSource};
use crate::object::{
    GcTraceable, ManagedObject, MarkColor, ObjId, ObjectFlags, ObjectState, Value, White,
};

/// GC phase for incremental collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Idle,
    /// Gray objects are being scanned; write barriers active
    Propagate,
    /// Unreachable objects are being freed
    Sweep,
}

/// Position in the root list: the link that names the next object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkPos {
    /// The list head
    Head,
    /// The `root_next` link of this slot
    After(u32),
}

/// GC statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct GcStats {
    /// Completed cycles
    pub collections: u64,
    /// Wall time from cycle start to sweep end, summed (nanoseconds)
    pub total_time_ns: u64,
    /// Objects blackened in the last cycle
    pub last_marked: usize,
    /// Objects freed by the last sweep
    pub last_freed: usize,
    /// Bytes freed by the last sweep
    pub last_reclaimed: usize,
    /// Objects destroyed through the manual path
    pub manual_frees: u64,
    /// References replaced by the last substitution
    pub last_substitutions: usize,
}

pub(crate) struct SlabEntry {
    pub(crate) generation: u32,
    pub(crate) object: Option<ManagedObject>,
}

/// The collector: owns every managed object and both collector lists.
pub struct Collector {
    types: Arc<TypeRegistry>,
    config: GcConfig,
    pub(crate) slab: Vec<SlabEntry>,
    free_slots: Vec<u32>,
    pub(crate) root_head: Option<u32>,
    pub(crate) gray_head: Option<u32>,
    current_white: White,
    pub(crate) phase: GcPhase,
    pub(crate) sweep_pos: LinkPos,
    pub(crate) external: HolderRegistry,
    pub(crate) shutting_down: bool,
    allocated_bytes: usize,
    threshold: usize,
    live_count: usize,
    cycle_start: Option<Instant>,
    pub(crate) stats: GcStats,
}

impl Collector {
    /// Create a collector with the default configuration
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self::with_config(types, GcConfig::default())
    }

    /// Create a collector with a custom configuration
    pub fn with_config(types: Arc<TypeRegistry>, config: GcConfig) -> Self {
        Self {
            types,
            threshold: config.initial_threshold,
            config,
            slab: Vec::new(),
            free_slots: Vec::new(),
            root_head: None,
            gray_head: None,
            current_white: White::A,
            phase: GcPhase::Idle,
            sweep_pos: LinkPos::Head,
            external: HolderRegistry::default(),
            shutting_down: false,
            allocated_bytes: 0,
            live_count: 0,
            cycle_start: None,
            stats: GcStats::default(),
        }
    }

    /// Type registry shared with other collectors
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Get config
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Current phase
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Returns true while marking is in progress
    pub fn is_marking(&self) -> bool {
        self.phase == GcPhase::Propagate
    }

    /// White given to new objects this epoch
    pub fn current_white(&self) -> White {
        self.current_white
    }

    /// Objects currently held in the slab
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Accounted bytes of all held objects
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Accounted bytes at which [`tick`](Self::tick) starts a cycle
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether global teardown has started
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate an object of `class` with default field values.
    ///
    /// # Panics
    /// Panics if the class is unregistered or its metadata is malformed.
    pub fn allocate(&mut self, class: &'static ClassInfo) -> ObjId {
        self.allocate_inner(class, None)
    }

    /// Allocate an object carrying native state
    pub fn allocate_with<T: GcTraceable + 'static>(
        &mut self,
        class: &'static ClassInfo,
        native: T,
    ) -> ObjId {
        self.allocate_inner(class, Some(Box::new(native)))
    }

    fn allocate_inner(
        &mut self,
        class: &'static ClassInfo,
        native: Option<Box<dyn GcTraceable>>,
    ) -> ObjId {
        let descriptor = match self.types.try_descriptor(class) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("cannot allocate '{}': {err}", class.name),
        };
        let size = descriptor.size();

        let mut object = ManagedObject::new(descriptor, self.current_white, native);
        object.header.root_next = self.root_head;

        let id = if let Some(index) = self.free_slots.pop() {
            let entry = &mut self.slab[index as usize];
            entry.object = Some(object);
            ObjId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.slab.len() as u32;
            self.slab.push(SlabEntry {
                generation: 0,
                object: Some(object),
            });
            ObjId {
                index,
                generation: 0,
            }
        };

        self.root_head = Some(id.index);
        self.allocated_bytes += size;
        self.live_count += 1;
        id
    }

    // -----------------------------------------------------------------------
    // Checked access
    // -----------------------------------------------------------------------

    /// Resolve a handle. Stale handles resolve to `None`.
    pub fn get(&self, id: ObjId) -> Option<&ManagedObject> {
        let entry = self.slab.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.object.as_ref()
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut ManagedObject> {
        let entry = self.slab.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.object.as_mut()
    }

    pub(crate) fn live_mut(&mut self, id: ObjId) -> Result<&mut ManagedObject> {
        match self.get_mut(id) {
            Some(obj) if obj.header.state() == ObjectState::Live => Ok(obj),
            _ => Err(GcError::StaleHandle(id)),
        }
    }

    pub(crate) fn live(&self, id: ObjId) -> Result<&ManagedObject> {
        match self.get(id) {
            Some(obj) if obj.header.state() == ObjectState::Live => Ok(obj),
            _ => Err(GcError::StaleHandle(id)),
        }
    }

    /// Whether the handle names a live, linked object
    pub fn is_alive(&self, id: ObjId) -> bool {
        self.live(id).is_ok()
    }

    /// Lifecycle state; stale handles report `Freed`
    pub fn state_of(&self, id: ObjId) -> ObjectState {
        self.get(id)
            .map_or(ObjectState::Freed, |obj| obj.header.state())
    }

    /// Mark color, if the handle resolves
    pub fn color_of(&self, id: ObjId) -> Option<MarkColor> {
        self.get(id).map(|obj| obj.header.mark())
    }

    /// Lifecycle flags, if the handle resolves
    pub fn flags_of(&self, id: ObjId) -> Option<ObjectFlags> {
        self.get(id).map(|obj| obj.header.flags())
    }

    pub(crate) fn id_at(&self, index: u32) -> ObjId {
        ObjId {
            index,
            generation: self.slab[index as usize].generation,
        }
    }

    pub(crate) fn object_at(&self, index: u32) -> &ManagedObject {
        self.slab[index as usize]
            .object
            .as_ref()
            .expect("collector list names an empty slot")
    }

    pub(crate) fn object_at_mut(&mut self, index: u32) -> &mut ManagedObject {
        self.slab[index as usize]
            .object
            .as_mut()
            .expect("collector list names an empty slot")
    }

    /// Snapshot of the root list, newest first
    pub fn live_objects(&self) -> Vec<ObjId> {
        let mut out = Vec::with_capacity(self.live_count);
        let mut cursor = self.root_head;
        while let Some(index) = cursor {
            out.push(self.id_at(index));
            cursor = self.object_at(index).header.root_next;
        }
        out
    }

    /// Snapshot of the gray list, next to be scanned first
    pub fn gray_objects(&self) -> Vec<ObjId> {
        let mut out = Vec::new();
        let mut cursor = self.gray_head;
        while let Some(index) = cursor {
            out.push(self.id_at(index));
            cursor = self.object_at(index).header.gray_next;
        }
        out
    }

    // -----------------------------------------------------------------------
    // Fields
    // -----------------------------------------------------------------------

    /// Slot of a named field (first element for arrays)
    pub fn field(&self, id: ObjId, name: &str) -> Result<Slot> {
        self.field_at(id, name, 0)
    }

    /// Slot of element `index` of a named array field
    pub fn field_at(&self, id: ObjId, name: &str, index: u32) -> Result<Slot> {
        let obj = self.live(id)?;
        obj.descriptor()
            .field(name)
            .and_then(|field| field.slot(index))
            .ok_or_else(|| GcError::NoSuchField {
                class: obj.class_name(),
                field: format!("{name}[{index}]"),
            })
    }

    fn check_slot(obj: &ManagedObject, slot: Slot) -> Result<bool> {
        let field = obj
            .descriptor()
            .field_at(slot)
            .ok_or_else(|| GcError::NoSuchField {
                class: obj.class_name(),
                field: format!("#{}", slot.offset()),
            })?;
        Ok(field.ty.is_reference())
    }

    /// Read a field
    pub fn read(&self, id: ObjId, slot: Slot) -> Result<Value> {
        let obj = self.live(id)?;
        Self::check_slot(obj, slot)?;
        Ok(obj.fields[slot.offset() as usize])
    }

    /// Read a reference field. Targets that are gone or waiting for
    /// destruction read as `None`.
    pub fn read_ref(&self, id: ObjId, slot: Slot) -> Result<Option<ObjId>> {
        let target = self.read(id, slot)?.as_object();
        Ok(target.filter(|&target| {
            self.live(target)
                .is_ok_and(|obj| !obj.header.flags().contains(ObjectFlags::EUTHANIZE))
        }))
    }

    /// Write a scalar field. References go through [`store_ref`](Self::store_ref).
    pub fn write(&mut self, id: ObjId, slot: Slot, value: Value) -> Result<()> {
        let obj = self.live_mut(id)?;
        let field = obj
            .descriptor()
            .field_at(slot)
            .ok_or_else(|| GcError::NoSuchField {
                class: obj.class_name(),
                field: format!("#{}", slot.offset()),
            })?;
        let expected = field.ty.default_value().kind();
        if field.ty.is_reference() || expected != value.kind() {
            return Err(GcError::FieldTypeMismatch {
                class: obj.class_name(),
                field: field.name,
                expected,
            });
        }
        obj.fields[slot.offset() as usize] = value;
        Ok(())
    }

    /// Store a reference without running the write barrier.
    ///
    /// Only correct when `holder` cannot be black, e.g. outside marking or
    /// for an object allocated this epoch that nothing has scanned yet.
    pub fn store_ref_unbarriered(
        &mut self,
        holder: ObjId,
        slot: Slot,
        target: Option<ObjId>,
    ) -> Result<()> {
        let obj = self.live_mut(holder)?;
        if !Self::check_slot(obj, slot)? {
            let (field, expected) = obj
                .descriptor()
                .field_at(slot)
                .map_or(("?", "a scalar"), |f| (f.name, f.ty.default_value().kind()));
            return Err(GcError::FieldTypeMismatch {
                class: obj.class_name(),
                field,
                expected,
            });
        }
        obj.fields[slot.offset() as usize] = Value::Ref(target);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    /// Request destruction; the object is reclaimed by the next sweep.
    pub fn request_destroy(&mut self, id: ObjId) -> Result<()> {
        self.live_mut(id)?.request_destroy();
        Ok(())
    }

    /// Pin or unpin an object. Fixed objects are roots and never swept.
    pub fn set_fixed(&mut self, id: ObjId, fixed: bool) -> Result<()> {
        let obj = self.live_mut(id)?;
        if fixed {
            obj.header.insert_flags(ObjectFlags::FIXED);
        } else {
            obj.header.remove_flags(ObjectFlags::FIXED);
        }
        Ok(())
    }

    /// Declare that freeing this object outside the sweep is intended
    pub fn set_yes_really_delete(&mut self, id: ObjId) -> Result<()> {
        self.live_mut(id)?
            .header
            .insert_flags(ObjectFlags::YES_REALLY_DELETE);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register storage that pointer substitution must patch
    pub fn register_holder<H: ExternalHolder + 'static>(&mut self, holder: Rc<RefCell<H>>) {
        self.external.add_holder(holder);
    }

    /// Register storage whose handles are roots
    pub fn register_root_source<R: RootSource + 'static>(&mut self, source: Rc<RefCell<R>>) {
        self.external.add_root(source);
    }

    /// Number of registered external holders
    pub fn holder_count(&self) -> usize {
        self.external.holder_count()
    }

    // -----------------------------------------------------------------------
    // Marking
    // -----------------------------------------------------------------------

    /// Mark the object referenced from `slot`.
    ///
    /// Null, gray and black targets are left alone. A target that is gone or
    /// has destruction pending is cleared from the slot. Outside the mark
    /// phase nothing is grayed, so objects waiting to be swept stay dead.
    pub fn mark(&mut self, slot: &mut Option<ObjId>) {
        if let Some(id) = *slot {
            if !self.mark_object(id) {
                *slot = None;
            }
        }
    }

    /// Gray `id` if it is current white. Returns false when references to it
    /// should be dropped.
    pub(crate) fn mark_object(&mut self, id: ObjId) -> bool {
        let marking = self.phase == GcPhase::Propagate;
        let white = self.current_white;
        let gray_head = self.gray_head;

        let Some(obj) = self.get_mut(id) else {
            return false;
        };
        if obj.header.state() != ObjectState::Live
            || obj.header.flags().contains(ObjectFlags::EUTHANIZE)
        {
            return false;
        }
        if marking && obj.header.mark() == MarkColor::White(white) {
            obj.header.set_mark(MarkColor::Gray);
            obj.header.gray_next = gray_head;
            self.gray_head = Some(id.index);
        }
        true
    }

    /// Mark everything `id` references; returns its nominal size.
    /// Does nothing during global teardown.
    pub fn propagate_mark(&mut self, id: ObjId) -> usize {
        if self.shutting_down || self.get(id).is_none() {
            return 0;
        }
        self.propagate_index(id.index)
    }

    fn propagate_index(&mut self, index: u32) -> usize {
        if self.shutting_down {
            return 0;
        }
        let obj = self.object_at(index);
        let descriptor = obj.descriptor().clone();
        let mut extra = Vec::new();
        if let Some(native) = obj.native() {
            native.trace(&mut |id| extra.push(id));
        }

        for offset in descriptor.pointer_offsets() {
            let offset = offset as usize;
            if let Some(target) = self.object_at(index).fields[offset].as_object() {
                if !self.mark_object(target) {
                    self.object_at_mut(index).fields[offset] = Value::Ref(None);
                }
            }
        }
        for target in extra {
            self.mark_object(target);
        }

        descriptor.size()
    }

    /// Mark the root set: fixed objects and registered root sources.
    fn mark_roots(&mut self) {
        let mut fixed = Vec::new();
        let mut cursor = self.root_head;
        while let Some(index) = cursor {
            let header = &self.object_at(index).header;
            if header.flags().contains(ObjectFlags::FIXED) {
                fixed.push(self.id_at(index));
            }
            cursor = header.root_next;
        }
        for id in fixed {
            self.mark_object(id);
        }

        for source in self.external.roots() {
            let mut marker = RootMarker::new(self);
            source.borrow_mut().mark_roots(&mut marker);
        }
    }

    /// Begin a cycle: gray the roots and enter the mark phase.
    /// Does nothing if a cycle is already running.
    pub fn start_cycle(&mut self) {
        if self.phase != GcPhase::Idle {
            return;
        }
        self.phase = GcPhase::Propagate;
        self.stats.last_marked = 0;
        self.stats.last_freed = 0;
        self.stats.last_reclaimed = 0;
        self.cycle_start = Some(Instant::now());

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "sim::gc",
            objects = self.live_count,
            bytes = self.allocated_bytes,
            "GC cycle starting"
        );

        self.mark_roots();
    }

    /// Scan one gray object and blacken it.
    ///
    /// Returns the work done, or `None` when the gray list is empty.
    pub fn mark_step(&mut self) -> Option<usize> {
        let index = self.gray_head?;
        let obj = self.object_at_mut(index);
        self.gray_head = obj.header.gray_next.take();

        let work = self.propagate_index(index);
        self.object_at_mut(index).header.set_mark(MarkColor::Black);
        self.stats.last_marked += 1;

        if cfg!(debug_assertions) && self.config.verify_barriers {
            let violations = self.verify_tricolor();
            debug_assert!(
                violations.is_empty(),
                "black objects reference white objects without a write barrier: {violations:?}"
            );
        }

        Some(work)
    }

    /// Re-mark roots, drain the gray list and flip the epoch.
    fn atomic(&mut self) {
        self.mark_roots();
        while self.mark_step().is_some() {}
        self.flip_epoch();
        self.phase = GcPhase::Sweep;
        self.sweep_pos = LinkPos::Head;
    }

    /// Swap the current white and recolor survivors.
    ///
    /// Every black object (and any fixed object) takes the new white, so
    /// whatever still carries the old white is unreachable and will be swept.
    /// Called once marking has drained the gray list.
    pub fn flip_epoch(&mut self) {
        debug_assert!(self.gray_head.is_none(), "epoch flipped with gray objects pending");

        let previous = self.current_white;
        let current = previous.other();
        self.current_white = current;

        let mut cursor = self.root_head;
        while let Some(index) = cursor {
            let header = &mut self.object_at_mut(index).header;
            let survives = match header.mark() {
                MarkColor::Black | MarkColor::Gray => true,
                MarkColor::White(_) => header.flags().contains(ObjectFlags::FIXED),
            };
            if survives {
                header.set_mark(MarkColor::White(current));
                header.gray_next = None;
            }
            cursor = header.root_next;
        }
    }

    // -----------------------------------------------------------------------
    // Sweeping
    // -----------------------------------------------------------------------

    fn link_at(&self, pos: LinkPos) -> Option<u32> {
        match pos {
            LinkPos::Head => self.root_head,
            LinkPos::After(index) => self.object_at(index).header.root_next,
        }
    }

    pub(crate) fn set_link(&mut self, pos: LinkPos, next: Option<u32>) {
        match pos {
            LinkPos::Head => self.root_head = next,
            LinkPos::After(index) => self.object_at_mut(index).header.root_next = next,
        }
    }

    /// Sweep up to `budget` work units from the sweep cursor.
    ///
    /// Returns the work done. At least one object is visited per call. When
    /// the cursor reaches the end of the root list the cycle finishes.
    pub fn sweep_step(&mut self, budget: usize) -> usize {
        if self.phase != GcPhase::Sweep {
            return 0;
        }
        let previous = self.current_white.other();
        let cost = self.config.sweep_cost.max(1);
        let mut spent = 0usize;

        loop {
            let Some(index) = self.link_at(self.sweep_pos) else {
                self.finish_cycle();
                return spent;
            };
            if spent > 0 && spent >= budget {
                return spent;
            }
            spent = spent.saturating_add(cost);

            let obj = self.object_at_mut(index);
            let flags = obj.header.flags();
            let dead = !flags.contains(ObjectFlags::FIXED)
                && (flags.contains(ObjectFlags::EUTHANIZE)
                    || obj.header.mark() == MarkColor::White(previous));

            if dead {
                obj.header.insert_flags(ObjectFlags::CLEANUP);
                let next = obj.header.root_next.take();
                self.set_link(self.sweep_pos, next);
                let freed = self.release(index);
                self.stats.last_freed += 1;
                self.stats.last_reclaimed += freed;
            } else {
                self.sweep_pos = LinkPos::After(index);
            }
        }
    }

    /// Sweep the rest of the root list
    pub fn sweep(&mut self) {
        while self.phase == GcPhase::Sweep {
            self.sweep_step(usize::MAX);
        }
    }

    /// Free an unlinked slot; returns the bytes released.
    ///
    /// A slot whose generation is exhausted is retired instead of reused, so
    /// old handles to it can never resolve again.
    pub(crate) fn release(&mut self, index: u32) -> usize {
        let entry = &mut self.slab[index as usize];
        let Some(mut obj) = entry.object.take() else {
            return 0;
        };
        if let Some(generation) = entry.generation.checked_add(1) {
            entry.generation = generation;
            self.free_slots.push(index);
        }

        let size = obj.descriptor().size();
        self.live_count -= 1;
        self.allocated_bytes = self.allocated_bytes.saturating_sub(size);

        if !self.shutting_down {
            if let Some(native) = obj.native.as_mut() {
                native.destroy_specials();
            }
        }
        obj.header.set_state(ObjectState::Freed);
        size
    }

    fn finish_cycle(&mut self) {
        self.phase = GcPhase::Idle;
        self.sweep_pos = LinkPos::Head;
        self.threshold = self.config.next_threshold(self.allocated_bytes);
        self.stats.collections += 1;
        if let Some(start) = self.cycle_start.take() {
            self.stats.total_time_ns += start.elapsed().as_nanos() as u64;
        }

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "sim::gc",
            collection = self.stats.collections,
            marked = self.stats.last_marked,
            freed_objects = self.stats.last_freed,
            reclaimed_bytes = self.stats.last_reclaimed,
            live_objects = self.live_count,
            next_threshold = self.threshold,
            "GC cycle complete"
        );
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Perform up to `budget` work units of collection.
    ///
    /// Starts a cycle when idle, then marks, flips and sweeps as the budget
    /// allows. Returns the phase reached; `Idle` means the cycle finished.
    pub fn incremental_step(&mut self, budget: usize) -> GcPhase {
        let budget = budget.max(1);
        if self.phase == GcPhase::Idle {
            self.start_cycle();
        }

        let mut spent = 0usize;
        while spent < budget {
            match self.phase {
                GcPhase::Propagate => match self.mark_step() {
                    Some(work) => spent = spent.saturating_add(work.max(1)),
                    None => self.atomic(),
                },
                GcPhase::Sweep => {
                    let work = self.sweep_step(budget - spent);
                    spent = spent.saturating_add(work.max(1));
                }
                GcPhase::Idle => break,
            }
        }
        self.phase
    }

    /// Allocation-paced collection, called once per simulation tick.
    ///
    /// Runs one budgeted step while a cycle is in progress or once accounted
    /// bytes pass the threshold. Returns whether any work was done.
    pub fn tick(&mut self) -> bool {
        if self.phase == GcPhase::Idle && self.allocated_bytes < self.threshold {
            return false;
        }
        self.incremental_step(self.config.step_budget());
        true
    }

    /// Finish any cycle in progress, then run one complete cycle.
    pub fn full_collect(&mut self) {
        while self.phase != GcPhase::Idle {
            self.incremental_step(usize::MAX);
        }
        self.incremental_step(usize::MAX);
        while self.phase != GcPhase::Idle {
            self.incremental_step(usize::MAX);
        }
    }

    /// Global teardown: free every object without substitution, diagnostics
    /// or teardown hooks. Objects left unlinked by
    /// [`substitute`](Self::substitute) are freed too.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.gray_head = None;
        let mut cursor = self.root_head.take();
        while let Some(index) = cursor {
            cursor = self.object_at_mut(index).header.root_next.take();
            self.release(index);
        }
        for index in 0..self.slab.len() as u32 {
            self.release(index);
        }
        self.phase = GcPhase::Idle;
        self.sweep_pos = LinkPos::Head;
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("phase", &self.phase)
            .field("current_white", &self.current_white)
            .field("live", &self.live_count)
            .field("bytes", &self.allocated_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FieldInfo, OBJECT_CLASS_NAME};

    static NODE: ClassInfo = ClassInfo {
        name: "Node",
        parent: Some(OBJECT_CLASS_NAME),
        fields: &[FieldInfo::int("value"), FieldInfo::object("next", "Node")],
        size: 64,
    };

    fn collector() -> Collector {
        let types = TypeRegistry::new();
        types.register(&NODE);
        Collector::new(types)
    }

    fn link(gc: &mut Collector, from: ObjId, to: ObjId) {
        let slot = gc.field(from, "next").unwrap();
        gc.store_ref(from, slot, Some(to)).unwrap();
    }

    #[test]
    fn test_collector_creation() {
        let gc = collector();
        assert_eq!(gc.stats().collections, 0);
        assert_eq!(gc.phase(), GcPhase::Idle);
        assert_eq!(gc.current_white(), White::A);
    }

    #[test]
    fn test_allocate_links_at_head() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        let b = gc.allocate(&NODE);
        assert_eq!(gc.live_objects(), vec![b, a]);
        assert_eq!(gc.color_of(a), Some(MarkColor::White(White::A)));
        assert_eq!(gc.allocated_bytes(), 128);
        assert_eq!(gc.live_count(), 2);
    }

    #[test]
    fn test_collect_empty() {
        let mut gc = collector();
        gc.full_collect();
        assert_eq!(gc.stats().collections, 1);
        assert_eq!(gc.current_white(), White::B);
    }

    #[test]
    fn test_unrooted_objects_are_swept() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        let _b = gc.allocate(&NODE);
        gc.full_collect();
        assert_eq!(gc.live_count(), 0);
        assert_eq!(gc.stats().last_freed, 2);
        assert!(gc.get(a).is_none());
        assert_eq!(gc.state_of(a), ObjectState::Freed);
    }

    #[test]
    fn test_fixed_root_keeps_chain_alive() {
        let mut gc = collector();
        let root = gc.allocate(&NODE);
        let child = gc.allocate(&NODE);
        let garbage = gc.allocate(&NODE);
        gc.set_fixed(root, true).unwrap();
        link(&mut gc, root, child);

        gc.full_collect();

        assert!(gc.is_alive(root));
        assert!(gc.is_alive(child));
        assert!(!gc.is_alive(garbage));
        assert_eq!(gc.color_of(child), Some(MarkColor::White(gc.current_white())));
    }

    #[test]
    fn test_survivors_survive_repeated_cycles() {
        let mut gc = collector();
        let root = gc.allocate(&NODE);
        let child = gc.allocate(&NODE);
        gc.set_fixed(root, true).unwrap();
        link(&mut gc, root, child);

        for _ in 0..4 {
            gc.full_collect();
        }
        assert!(gc.is_alive(child));
        assert_eq!(gc.stats().collections, 4);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        gc.full_collect();
        let b = gc.allocate(&NODE);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(gc.get(a).is_none());
        assert!(gc.get(b).is_some());
    }

    #[test]
    fn test_stats_describe_last_cycle_only() {
        let mut gc = collector();
        gc.allocate(&NODE);
        gc.full_collect();
        assert_eq!(gc.stats().last_freed, 1);

        gc.allocate(&NODE);
        gc.full_collect();
        assert_eq!(gc.stats().last_freed, 1);
        assert_eq!(gc.stats().last_reclaimed, 64);
        assert_eq!(gc.stats().collections, 2);
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        gc.slab[a.index() as usize].generation = u32::MAX;
        let old = ObjId {
            index: a.index(),
            generation: u32::MAX,
        };
        assert!(gc.is_alive(old));

        gc.full_collect();
        assert!(gc.get(old).is_none());

        let b = gc.allocate(&NODE);
        assert_ne!(b.index(), old.index());
        assert!(gc.get(old).is_none());
    }

    #[test]
    #[should_panic(expected = "cannot allocate 'Node'")]
    fn test_allocate_unregistered_class_panics() {
        let mut gc = Collector::new(TypeRegistry::new());
        gc.allocate(&NODE);
    }

    #[test]
    fn test_mark_step_is_incremental() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        let b = gc.allocate(&NODE);
        let c = gc.allocate(&NODE);
        gc.set_fixed(a, true).unwrap();
        link(&mut gc, a, b);
        link(&mut gc, b, c);

        gc.start_cycle();
        assert_eq!(gc.gray_objects(), vec![a]);

        assert_eq!(gc.mark_step(), Some(64));
        assert_eq!(gc.color_of(a), Some(MarkColor::Black));
        assert_eq!(gc.color_of(b), Some(MarkColor::Gray));
        assert_eq!(gc.color_of(c), Some(MarkColor::White(White::A)));

        gc.mark_step();
        gc.mark_step();
        assert_eq!(gc.mark_step(), None);
        assert_eq!(gc.color_of(c), Some(MarkColor::Black));
    }

    #[test]
    fn test_mark_clears_slot_of_destroyed_target() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        let b = gc.allocate(&NODE);
        gc.set_fixed(a, true).unwrap();
        link(&mut gc, a, b);
        gc.request_destroy(b).unwrap();

        gc.full_collect();

        let slot = gc.field(a, "next").unwrap();
        assert_eq!(gc.read(a, slot).unwrap(), Value::Ref(None));
        assert!(!gc.is_alive(b));
    }

    #[test]
    fn test_destroy_requested_black_object_is_swept() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        gc.set_fixed(a, true).unwrap();
        gc.start_cycle();
        gc.mark_step();
        assert_eq!(gc.color_of(a), Some(MarkColor::Black));

        gc.request_destroy(a).unwrap();
        gc.full_collect();
        assert!(!gc.is_alive(a));
    }

    #[test]
    fn test_mark_outside_cycle_does_not_gray() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        let mut slot = Some(a);
        gc.mark(&mut slot);
        assert_eq!(slot, Some(a));
        assert_eq!(gc.color_of(a), Some(MarkColor::White(White::A)));
        assert!(gc.gray_objects().is_empty());
    }

    #[test]
    fn test_sweep_is_budgeted() {
        let types = TypeRegistry::new();
        types.register(&NODE);
        let config = GcConfig {
            sweep_cost: 10,
            ..GcConfig::default()
        };
        let mut gc = Collector::with_config(types, config);
        for _ in 0..10 {
            gc.allocate(&NODE);
        }
        gc.start_cycle();
        while gc.mark_step().is_some() {}
        gc.atomic();
        assert_eq!(gc.phase(), GcPhase::Sweep);

        assert_eq!(gc.sweep_step(30), 30);
        assert_eq!(gc.live_count(), 7);
        gc.sweep();
        assert_eq!(gc.phase(), GcPhase::Idle);
        assert_eq!(gc.live_count(), 0);
    }

    #[test]
    fn test_allocation_during_sweep_survives() {
        let mut gc = collector();
        for _ in 0..3 {
            gc.allocate(&NODE);
        }
        gc.start_cycle();
        gc.atomic();
        gc.sweep_step(1);

        let fresh = gc.allocate(&NODE);
        gc.sweep();
        assert!(gc.is_alive(fresh));
        assert_eq!(gc.live_count(), 1);
    }

    #[test]
    fn test_tick_respects_threshold() {
        let types = TypeRegistry::new();
        types.register(&NODE);
        let config = GcConfig {
            initial_threshold: 256,
            ..GcConfig::default()
        };
        let mut gc = Collector::with_config(types, config);
        gc.allocate(&NODE);
        assert!(!gc.tick());

        for _ in 0..4 {
            gc.allocate(&NODE);
        }
        assert!(gc.tick());
        while gc.phase() != GcPhase::Idle {
            gc.tick();
        }
        assert_eq!(gc.live_count(), 0);
        assert_eq!(gc.stats().collections, 1);
        assert_eq!(gc.threshold(), gc.config().step_size);
    }

    #[test]
    fn test_field_access_errors() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        assert!(matches!(gc.field(a, "nope"), Err(GcError::NoSuchField { .. })));

        let value = gc.field(a, "value").unwrap();
        gc.write(a, value, Value::Int(7)).unwrap();
        assert_eq!(gc.read(a, value).unwrap(), Value::Int(7));
        assert!(matches!(
            gc.write(a, value, Value::Bool(true)),
            Err(GcError::FieldTypeMismatch { .. })
        ));
        assert!(matches!(
            gc.store_ref(a, value, Some(a)),
            Err(GcError::FieldTypeMismatch { .. })
        ));

        let next = gc.field(a, "next").unwrap();
        assert!(matches!(
            gc.write(a, next, Value::Int(1)),
            Err(GcError::FieldTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_read_ref_hides_destroy_requested_target() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        let b = gc.allocate(&NODE);
        link(&mut gc, a, b);
        let next = gc.field(a, "next").unwrap();
        assert_eq!(gc.read_ref(a, next).unwrap(), Some(b));

        gc.request_destroy(b).unwrap();
        assert_eq!(gc.read_ref(a, next).unwrap(), None);
    }

    #[test]
    fn test_shutdown_frees_everything() {
        let mut gc = collector();
        let a = gc.allocate(&NODE);
        gc.set_fixed(a, true).unwrap();
        let b = gc.allocate(&NODE);
        gc.substitute(b, None);
        assert_eq!(gc.state_of(b), ObjectState::Unlinked);

        gc.shutdown();
        assert_eq!(gc.live_count(), 0);
        assert_eq!(gc.allocated_bytes(), 0);
        assert!(gc.get(b).is_none());
        assert!(gc.live_objects().is_empty());
        assert_eq!(gc.propagate_mark(a), 0);
    }
}
