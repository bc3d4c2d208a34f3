//! Class metadata and the type descriptor registry
//!
//! Every managed class is described by a static [`ClassInfo`]: its name, its
//! parent, the fields it declares and its nominal size. The registry turns
//! that metadata into a [`TypeDescriptor`] the first time a class is needed:
//!
//! - fields are laid out parent-first into one flat storage array
//! - every slot that holds an object reference is listed in
//!   `pointer_offsets`, with fixed-size reference arrays expanded one entry per
//!   element
//! - the offset list ends with [`POINTER_END`], so consumers can walk it without
//!   a length
//!
//! Descriptors are immutable once built and shared through `Arc`. A class's
//! shape is fixed for the life of the process, so there is no invalidation.
//!
//! Malformed metadata is a configuration bug. [`TypeRegistry::descriptor`]
//! panics with the [`GcError`] describing it rather than letting marking run
//! over a wrong layout.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{GcError, Result};
use crate::object::Value;

/// Sentinel terminating a descriptor's pointer offset table.
pub const POINTER_END: u32 = u32::MAX;

/// Name of the root class every registry starts with.
pub const OBJECT_CLASS_NAME: &str = "Object";

/// Root of the class hierarchy. Declares no fields.
pub static OBJECT_CLASS: ClassInfo = ClassInfo {
    name: OBJECT_CLASS_NAME,
    parent: None,
    fields: &[],
    size: 32,
};

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Integer scalar
    Int,
    /// Floating point scalar
    Float,
    /// Boolean scalar
    Bool,
    /// Reference to an object of `class` (or a subclass)
    Object {
        /// Target class name
        class: &'static str,
    },
    /// Fixed-size array of references
    ObjectArray {
        /// Element class name
        class: &'static str,
        /// Number of elements
        len: u32,
    },
}

impl FieldType {
    /// Number of storage slots the field occupies
    pub fn slot_count(&self) -> u32 {
        match self {
            FieldType::ObjectArray { len, .. } => *len,
            _ => 1,
        }
    }

    /// Whether the field holds object references
    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object { .. } | FieldType::ObjectArray { .. })
    }

    /// Initial value of each slot of this field
    pub fn default_value(&self) -> Value {
        match self {
            FieldType::Int => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::Bool => Value::Bool(false),
            FieldType::Object { .. } | FieldType::ObjectArray { .. } => Value::Ref(None),
        }
    }

    fn target_class(&self) -> Option<&'static str> {
        match self {
            FieldType::Object { class } | FieldType::ObjectArray { class, .. } => Some(class),
            _ => None,
        }
    }
}

/// A field declared directly by one class.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Field name, unique within the class hierarchy
    pub name: &'static str,
    /// Declared type
    pub ty: FieldType,
}

impl FieldInfo {
    /// Integer field
    pub const fn int(name: &'static str) -> Self {
        Self { name, ty: FieldType::Int }
    }

    /// Float field
    pub const fn float(name: &'static str) -> Self {
        Self { name, ty: FieldType::Float }
    }

    /// Boolean field
    pub const fn bool(name: &'static str) -> Self {
        Self { name, ty: FieldType::Bool }
    }

    /// Single object reference
    pub const fn object(name: &'static str, class: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::Object { class },
        }
    }

    /// Fixed-size array of object references
    pub const fn object_array(name: &'static str, class: &'static str, len: u32) -> Self {
        Self {
            name,
            ty: FieldType::ObjectArray { class, len },
        }
    }
}

/// Static metadata for one managed class.
#[derive(Debug)]
pub struct ClassInfo {
    /// Class name
    pub name: &'static str,
    /// Parent class name (`None` only for the root class)
    pub parent: Option<&'static str>,
    /// Fields declared by this class, not including inherited ones
    pub fields: &'static [FieldInfo],
    /// Nominal instance size in bytes, used for collector pacing
    pub size: usize,
}

/// Position of a single storage slot inside an object's field array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub(crate) u32);

impl Slot {
    /// Offset into the field storage
    pub fn offset(self) -> u32 {
        self.0
    }
}

/// Where one declared field landed in the flattened layout.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    /// Field name
    pub name: &'static str,
    /// Class that declared it
    pub owner: &'static str,
    /// First slot
    pub offset: u32,
    /// Number of slots
    pub len: u32,
    /// Declared type
    pub ty: FieldType,
}

impl FieldLayout {
    /// Slot of element `index` (always 0 for non-array fields)
    pub fn slot(&self, index: u32) -> Option<Slot> {
        (index < self.len).then_some(Slot(self.offset + index))
    }
}

/// Flattened, cached layout of a class.
#[derive(Debug)]
pub struct TypeDescriptor {
    class: &'static ClassInfo,
    ancestry: Vec<&'static str>,
    layout: Vec<FieldLayout>,
    field_count: u32,
    pointer_offsets: Box<[u32]>,
}

impl TypeDescriptor {
    /// Class described
    pub fn class(&self) -> &'static ClassInfo {
        self.class
    }

    /// Class name
    pub fn name(&self) -> &'static str {
        self.class.name
    }

    /// Nominal instance size
    pub fn size(&self) -> usize {
        self.class.size
    }

    /// Total number of field storage slots
    pub fn field_count(&self) -> u32 {
        self.field_count
    }

    /// Flattened field layout, parent fields first
    pub fn layout(&self) -> &[FieldLayout] {
        &self.layout
    }

    /// Pointer offset table including the trailing [`POINTER_END`]
    pub fn raw_pointer_offsets(&self) -> &[u32] {
        &self.pointer_offsets
    }

    /// Offsets of every reference slot, in layout order
    pub fn pointer_offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.pointer_offsets
            .iter()
            .copied()
            .take_while(|&offset| offset != POINTER_END)
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.layout.iter().find(|f| f.name == name)
    }

    /// Layout entry covering a slot
    pub fn field_at(&self, slot: Slot) -> Option<&FieldLayout> {
        self.layout
            .iter()
            .find(|f| slot.0 >= f.offset && slot.0 < f.offset + f.len)
    }

    /// Whether this class is `name` or inherits from it
    pub fn is_descendant_of(&self, name: &str) -> bool {
        self.ancestry.iter().any(|&c| c == name)
    }

    /// Freshly initialised field storage for a new instance
    pub fn default_fields(&self) -> Box<[Value]> {
        let mut values = Vec::with_capacity(self.field_count as usize);
        for field in &self.layout {
            values.extend(std::iter::repeat_n(field.ty.default_value(), field.len as usize));
        }
        values.into_boxed_slice()
    }
}

/// Registry of every managed class and the descriptors built for them.
///
/// Shared between collectors. Registration happens at startup; descriptors are
/// built lazily on first use and never change afterwards.
pub struct TypeRegistry {
    classes: RwLock<FxHashMap<&'static str, &'static ClassInfo>>,
    descriptors: RwLock<FxHashMap<&'static str, Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    /// Create a registry holding only the root `Object` class
    pub fn new() -> Arc<Self> {
        let registry = Self {
            classes: RwLock::new(FxHashMap::default()),
            descriptors: RwLock::new(FxHashMap::default()),
        };
        registry.register(&OBJECT_CLASS);
        Arc::new(registry)
    }

    /// Register a class.
    ///
    /// # Panics
    /// Panics if a different class was already registered under the same name.
    pub fn register(&self, class: &'static ClassInfo) {
        let mut classes = self.classes.write();
        if let Some(existing) = classes.get(class.name) {
            assert!(
                std::ptr::eq(*existing, class),
                "class '{}' registered twice with different metadata",
                class.name
            );
            return;
        }
        classes.insert(class.name, class);
    }

    /// Register several classes in one go
    pub fn register_all(&self, classes: &[&'static ClassInfo]) {
        for class in classes {
            self.register(class);
        }
    }

    /// Look up a registered class by name
    pub fn class(&self, name: &str) -> Option<&'static ClassInfo> {
        self.classes.read().get(name).copied()
    }

    /// Whether a class is registered
    pub fn is_registered(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    /// Number of descriptors built so far
    pub fn built_count(&self) -> usize {
        self.descriptors.read().len()
    }

    /// Get the descriptor for `class`, building it on first use.
    ///
    /// # Panics
    /// Panics if the class metadata is malformed. This is a configuration
    /// error and must not be survived.
    pub fn descriptor(&self, class: &'static ClassInfo) -> Arc<TypeDescriptor> {
        match self.try_descriptor(class) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("invalid class metadata: {err}"),
        }
    }

    /// Fallible form of [`descriptor`](Self::descriptor).
    pub fn try_descriptor(&self, class: &'static ClassInfo) -> Result<Arc<TypeDescriptor>> {
        if let Some(descriptor) = self.descriptors.read().get(class.name) {
            return Ok(descriptor.clone());
        }

        let built = Arc::new(self.build(class)?);
        let mut descriptors = self.descriptors.write();
        // Another caller may have won the race; the first build is kept.
        Ok(descriptors.entry(class.name).or_insert(built).clone())
    }

    /// Walk the metadata and flatten it into a descriptor.
    fn build(&self, class: &'static ClassInfo) -> Result<TypeDescriptor> {
        let classes = self.classes.read();
        if !classes.contains_key(class.name) {
            return Err(GcError::UnknownClass(class.name));
        }

        // Collect the chain from the class up to the root.
        let mut chain: Vec<&'static ClassInfo> = vec![class];
        let mut seen: FxHashSet<&'static str> = FxHashSet::default();
        seen.insert(class.name);
        let mut current = class;
        while let Some(parent_name) = current.parent {
            let parent = classes.get(parent_name).copied().ok_or(GcError::UnknownParent {
                class: current.name,
                parent: parent_name,
            })?;
            if !seen.insert(parent.name) {
                return Err(GcError::InheritanceCycle(parent.name));
            }
            chain.push(parent);
            current = parent;
        }

        let ancestry = chain.iter().map(|c| c.name).collect();

        let mut layout = Vec::new();
        let mut pointer_offsets = Vec::new();
        let mut names: FxHashSet<&'static str> = FxHashSet::default();
        let mut offset = 0u32;

        for owner in chain.iter().rev() {
            for field in owner.fields {
                if !names.insert(field.name) {
                    return Err(GcError::DuplicateField {
                        class: class.name,
                        field: field.name,
                    });
                }
                if let Some(target) = field.ty.target_class() {
                    if !classes.contains_key(target) {
                        return Err(GcError::UnknownReferenceTarget {
                            class: owner.name,
                            field: field.name,
                            target,
                        });
                    }
                }
                let len = field.ty.slot_count();
                if len == 0 {
                    return Err(GcError::EmptyReferenceArray {
                        class: owner.name,
                        field: field.name,
                    });
                }
                if field.ty.is_reference() {
                    pointer_offsets.extend(offset..offset + len);
                }
                layout.push(FieldLayout {
                    name: field.name,
                    owner: owner.name,
                    offset,
                    len,
                    ty: field.ty,
                });
                offset += len;
            }
        }
        pointer_offsets.push(POINTER_END);

        Ok(TypeDescriptor {
            class,
            ancestry,
            layout,
            field_count: offset,
            pointer_offsets: pointer_offsets.into_boxed_slice(),
        })
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("classes", &self.classes.read().len())
            .field("descriptors", &self.descriptors.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static THINKER: ClassInfo = ClassInfo {
        name: "Thinker",
        parent: Some(OBJECT_CLASS_NAME),
        fields: &[FieldInfo::object("next", "Thinker"), FieldInfo::int("statnum")],
        size: 48,
    };

    static SECTOR_EFFECT: ClassInfo = ClassInfo {
        name: "SectorEffect",
        parent: Some("Thinker"),
        fields: &[
            FieldInfo::float("speed"),
            FieldInfo::object_array("interpolations", "Thinker", 3),
            FieldInfo::object("owner", "Thinker"),
        ],
        size: 96,
    };

    static ORPHAN: ClassInfo = ClassInfo {
        name: "Orphan",
        parent: Some("Missing"),
        fields: &[],
        size: 8,
    };

    static BAD_TARGET: ClassInfo = ClassInfo {
        name: "BadTarget",
        parent: Some(OBJECT_CLASS_NAME),
        fields: &[FieldInfo::object("thing", "NoSuchClass")],
        size: 8,
    };

    static EMPTY_ARRAY: ClassInfo = ClassInfo {
        name: "EmptyArray",
        parent: Some(OBJECT_CLASS_NAME),
        fields: &[FieldInfo::object_array("slots", "Object", 0)],
        size: 8,
    };

    static SHADOWING: ClassInfo = ClassInfo {
        name: "Shadowing",
        parent: Some("Thinker"),
        fields: &[FieldInfo::int("statnum")],
        size: 8,
    };

    static LOOP_A: ClassInfo = ClassInfo {
        name: "LoopA",
        parent: Some("LoopB"),
        fields: &[],
        size: 8,
    };

    static LOOP_B: ClassInfo = ClassInfo {
        name: "LoopB",
        parent: Some("LoopA"),
        fields: &[],
        size: 8,
    };

    fn registry() -> Arc<TypeRegistry> {
        let registry = TypeRegistry::new();
        registry.register_all(&[&THINKER, &SECTOR_EFFECT]);
        registry
    }

    #[test]
    fn test_flattens_parent_fields_first() {
        let registry = registry();
        let desc = registry.descriptor(&SECTOR_EFFECT);

        let names: Vec<_> = desc.layout().iter().map(|f| f.name).collect();
        assert_eq!(names, ["next", "statnum", "speed", "interpolations", "owner"]);
        assert_eq!(desc.field_count(), 7);
        assert_eq!(desc.field("owner").unwrap().owner, "SectorEffect");
        assert_eq!(desc.field("next").unwrap().owner, "Thinker");
    }

    #[test]
    fn test_pointer_offsets_expand_arrays() {
        let registry = registry();
        let desc = registry.descriptor(&SECTOR_EFFECT);

        let offsets: Vec<_> = desc.pointer_offsets().collect();
        assert_eq!(offsets, [0, 3, 4, 5, 6]);
        assert_eq!(desc.raw_pointer_offsets().last(), Some(&POINTER_END));
    }

    #[test]
    fn test_descriptor_is_cached() {
        let registry = registry();
        let a = registry.descriptor(&THINKER);
        let b = registry.descriptor(&THINKER);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.built_count(), 1);
    }

    #[test]
    fn test_root_class_has_no_pointers() {
        let registry = TypeRegistry::new();
        let desc = registry.descriptor(&OBJECT_CLASS);
        assert_eq!(desc.pointer_offsets().count(), 0);
        assert_eq!(desc.raw_pointer_offsets(), &[POINTER_END]);
    }

    #[test]
    fn test_ancestry() {
        let registry = registry();
        let desc = registry.descriptor(&SECTOR_EFFECT);
        assert!(desc.is_descendant_of("Thinker"));
        assert!(desc.is_descendant_of(OBJECT_CLASS_NAME));
        assert!(!desc.is_descendant_of("Actor"));
    }

    #[test]
    fn test_field_slots() {
        let registry = registry();
        let desc = registry.descriptor(&SECTOR_EFFECT);
        let field = desc.field("interpolations").unwrap();
        assert_eq!(field.slot(2), Some(Slot(5)));
        assert_eq!(field.slot(3), None);
        assert_eq!(desc.field_at(Slot(4)).unwrap().name, "interpolations");
    }

    #[test]
    fn test_default_fields() {
        let registry = registry();
        let desc = registry.descriptor(&SECTOR_EFFECT);
        let fields = desc.default_fields();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[1], Value::Int(0));
        assert_eq!(fields[2], Value::Float(0.0));
        assert_eq!(fields[6], Value::Ref(None));
    }

    #[test]
    fn test_malformed_metadata_is_rejected() {
        let registry = registry();
        registry.register_all(&[&ORPHAN, &BAD_TARGET, &EMPTY_ARRAY, &SHADOWING, &LOOP_A, &LOOP_B]);

        assert_eq!(
            registry.try_descriptor(&ORPHAN).unwrap_err(),
            GcError::UnknownParent {
                class: "Orphan",
                parent: "Missing"
            }
        );
        assert!(matches!(
            registry.try_descriptor(&BAD_TARGET),
            Err(GcError::UnknownReferenceTarget { target: "NoSuchClass", .. })
        ));
        assert!(matches!(
            registry.try_descriptor(&EMPTY_ARRAY),
            Err(GcError::EmptyReferenceArray { field: "slots", .. })
        ));
        assert!(matches!(
            registry.try_descriptor(&SHADOWING),
            Err(GcError::DuplicateField { field: "statnum", .. })
        ));
        assert!(matches!(
            registry.try_descriptor(&LOOP_A),
            Err(GcError::InheritanceCycle(_))
        ));
        assert_eq!(registry.built_count(), 0);
    }

    #[test]
    fn test_unregistered_class_is_rejected() {
        let registry = TypeRegistry::new();
        assert_eq!(
            registry.try_descriptor(&THINKER).unwrap_err(),
            GcError::UnknownClass("Thinker")
        );
    }

    #[test]
    #[should_panic(expected = "invalid class metadata")]
    fn test_descriptor_panics_on_bad_metadata() {
        let registry = registry();
        registry.register(&BAD_TARGET);
        let _ = registry.descriptor(&BAD_TARGET);
    }
}
