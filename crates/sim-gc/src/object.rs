//! Managed object layout

use std::any::Any;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::archive::Archive;
use crate::descriptor::TypeDescriptor;

/// Handle to a managed object.  Copy-able, 8 bytes.
///
/// `index` selects the slab slot, `generation` is bumped every time that slot
/// is freed, so a handle to a reclaimed object never resolves again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjId {
    /// Slab slot
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation the handle was issued for
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Debug for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjId({}/{})", self.index, self.generation)
    }
}

/// One of the two alternating white colors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum White {
    /// First white
    A,
    /// Second white
    B,
}

impl White {
    /// The other white
    pub fn other(self) -> Self {
        match self {
            White::A => White::B,
            White::B => White::A,
        }
    }
}

/// Mark color for tri-color marking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited this epoch (or, if the previous white, unreachable)
    White(White),
    /// Reached, children not yet scanned
    Gray,
    /// Reached and fully scanned
    Black,
}

bitflags! {
    /// Per-object lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u8 {
        /// Never reclaimed by sweep; marked as a root every cycle
        const FIXED = 1 << 0;
        /// Destruction requested; reclaimed by the next sweep
        const EUTHANIZE = 1 << 1;
        /// Being reclaimed by the collector's own sweep
        const CLEANUP = 1 << 2;
        /// Manual free is intentional, no diagnostic
        const YES_REALLY_DELETE = 1 << 3;
        /// Base serialization step ran
        const SERIALIZED_OK = 1 << 4;
    }
}

/// Lifecycle of a managed object.
///
/// Sweep reclaims go straight from `Live` to `Freed`. Manual destruction walks
/// every state so that callers can observe where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Linked in the root list
    Live,
    /// Manual destruction started, references are being replaced
    PendingSubstitution,
    /// No references remain and the object left the collector lists
    Unlinked,
    /// Storage released
    Freed,
}

/// GC object header
#[derive(Debug)]
pub struct GcHeader {
    color: MarkColor,
    flags: ObjectFlags,
    state: ObjectState,
    /// Next object in the root list. Only the collector touches this.
    pub(crate) root_next: Option<u32>,
    /// Next object in the gray list, meaningful only while gray.
    pub(crate) gray_next: Option<u32>,
}

impl GcHeader {
    /// Create a header colored with the given white
    pub(crate) fn new(white: White) -> Self {
        Self {
            color: MarkColor::White(white),
            flags: ObjectFlags::empty(),
            state: ObjectState::Live,
            root_next: None,
            gray_next: None,
        }
    }

    /// Get mark color
    pub fn mark(&self) -> MarkColor {
        self.color
    }

    pub(crate) fn set_mark(&mut self, color: MarkColor) {
        self.color = color;
    }

    /// Whether the object is white of either epoch
    pub fn is_white(&self) -> bool {
        matches!(self.color, MarkColor::White(_))
    }

    /// Get lifecycle flags
    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub(crate) fn insert_flags(&mut self, flags: ObjectFlags) {
        self.flags.insert(flags);
    }

    pub(crate) fn remove_flags(&mut self, flags: ObjectFlags) {
        self.flags.remove(flags);
    }

    /// Get lifecycle state
    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }
}

/// Value stored in a declared field slot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Object reference, `None` is null
    Ref(Option<ObjId>),
}

impl Value {
    /// Referenced object, if this is a non-null reference
    pub fn as_object(&self) -> Option<ObjId> {
        match self {
            Value::Ref(target) => *target,
            _ => None,
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Bool payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "an int",
            Value::Float(_) => "a float",
            Value::Bool(_) => "a bool",
            Value::Ref(_) => "an object reference",
        }
    }
}

/// Downcasting support for native object state.
pub trait AsAny {
    /// Borrow as `Any`
    fn as_any(&self) -> &dyn Any;
    /// Mutably borrow as `Any`
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Engine-side state attached to a managed object.
///
/// Declared fields are handled through the class descriptor. Implement the
/// hooks here for references the descriptor cannot see, such as growable
/// lists of attached objects.
pub trait GcTraceable: AsAny {
    /// Report references held outside the declared fields
    fn trace(&self, _tracer: &mut dyn FnMut(ObjId)) {}

    /// Replace references to `old` held outside the declared fields.
    /// Returns how many were replaced.
    fn substitute(&mut self, _old: ObjId, _new: Option<ObjId>) -> usize {
        0
    }

    /// Write this object into an archive. Overrides must call
    /// [`Archive::serialize_base`].
    fn serialize(&self, arc: &mut Archive) {
        arc.serialize_base();
    }

    /// Type-specific teardown, run when the object is reclaimed
    fn destroy_specials(&mut self) {}
}

/// A managed object: header, declared fields and optional native state.
pub struct ManagedObject {
    pub(crate) header: GcHeader,
    descriptor: Arc<TypeDescriptor>,
    pub(crate) fields: Box<[Value]>,
    pub(crate) native: Option<Box<dyn GcTraceable>>,
}

impl ManagedObject {
    pub(crate) fn new(
        descriptor: Arc<TypeDescriptor>,
        white: White,
        native: Option<Box<dyn GcTraceable>>,
    ) -> Self {
        Self {
            header: GcHeader::new(white),
            fields: descriptor.default_fields(),
            descriptor,
            native,
        }
    }

    /// Get the GC header
    pub fn header(&self) -> &GcHeader {
        &self.header
    }

    /// Class descriptor
    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    /// Class name
    pub fn class_name(&self) -> &'static str {
        self.descriptor.name()
    }

    /// Declared field storage
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    /// Native state, if any
    pub fn native(&self) -> Option<&dyn GcTraceable> {
        self.native.as_deref()
    }

    /// Native state downcast to a concrete type
    pub fn native_as<T: 'static>(&self) -> Option<&T> {
        self.native.as_deref()?.as_any().downcast_ref()
    }

    /// Mutable native state downcast to a concrete type
    pub fn native_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.native.as_deref_mut()?.as_any_mut().downcast_mut()
    }

    /// Request destruction: the next sweep reclaims the object.
    pub fn request_destroy(&mut self) {
        self.header.remove_flags(ObjectFlags::FIXED);
        self.header.insert_flags(ObjectFlags::EUTHANIZE);
    }

    /// Every non-null reference in the declared fields and native state
    pub fn outgoing(&self) -> Vec<ObjId> {
        let mut out: Vec<ObjId> = self
            .descriptor
            .pointer_offsets()
            .filter_map(|offset| self.fields[offset as usize].as_object())
            .collect();
        if let Some(native) = &self.native {
            native.trace(&mut |id| out.push(id));
        }
        out
    }

    /// Replace every reference to `old` with `new`; returns the count.
    pub fn substitute_references(&mut self, old: ObjId, new: Option<ObjId>) -> usize {
        let mut changed = 0;
        for offset in self.descriptor.pointer_offsets() {
            let slot = &mut self.fields[offset as usize];
            if *slot == Value::Ref(Some(old)) {
                *slot = Value::Ref(new);
                changed += 1;
            }
        }
        if let Some(native) = &mut self.native {
            changed += native.substitute(old, new);
        }
        changed
    }
}

impl std::fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObject")
            .field("class", &self.class_name())
            .field("header", &self.header)
            .field("fields", &self.fields)
            .finish()
    }
}
