//! # Simulation Object Collector
//!
//! Incremental tri-color mark-sweep collector and object lifecycle core for a
//! tick-driven simulation.
//!
//! ## Design
//!
//! - **Handles**: objects live in a slab and are named by generation-checked
//!   [`ObjId`]s, so a freed object can never be reached through an old handle
//! - **Descriptors**: per-class field layout and reference offsets are built
//!   once from static [`ClassInfo`] metadata and cached in a [`TypeRegistry`]
//! - **Incremental marking**: gray objects are scanned one per step under a
//!   work budget, with an insertion write barrier for stores into scanned
//!   objects
//! - **Manual destruction**: [`Collector::destroy_now`] rewrites every
//!   reference to the victim in the graph and in registered external storage
//!   before freeing it
//!
//! ```
//! use sim_gc::{ClassInfo, Collector, FieldInfo, TypeRegistry, OBJECT_CLASS_NAME};
//!
//! static THINKER: ClassInfo = ClassInfo {
//!     name: "Thinker",
//!     parent: Some(OBJECT_CLASS_NAME),
//!     fields: &[FieldInfo::object("target", "Thinker")],
//!     size: 64,
//! };
//!
//! let types = TypeRegistry::new();
//! types.register(&THINKER);
//! let mut gc = Collector::new(types);
//!
//! let a = gc.allocate(&THINKER);
//! let b = gc.allocate(&THINKER);
//! let slot = gc.field(a, "target").unwrap();
//! gc.store_ref(a, slot, Some(b)).unwrap();
//!
//! assert_eq!(gc.destroy_now(b), Ok(1));
//! assert_eq!(gc.read_ref(a, slot).unwrap(), None);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod archive;
pub mod barrier;
pub mod collector;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod external;
pub mod object;
pub mod substitute;

pub use archive::{Archive, ArchiveRecord};
pub use barrier::BarrierViolation;
pub use collector::{Collector, GcPhase, GcStats};
pub use config::GcConfig;
pub use descriptor::{
    ClassInfo, FieldInfo, FieldLayout, FieldType, OBJECT_CLASS, OBJECT_CLASS_NAME, POINTER_END,
    Slot, TypeDescriptor, TypeRegistry,
};
pub use error::{GcError, Result};
pub use external::{ExternalHolder, RootMarker, RootSource, SlotTable};
pub use object::{
    AsAny, GcHeader, GcTraceable, ManagedObject, MarkColor, ObjId, ObjectFlags, ObjectState,
    Value, White,
};
