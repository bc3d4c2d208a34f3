//! Save-game archive hook and serialization chaining check
//!
//! The archive only records what each object wrote; encoding it is up to the
//! save-game code. What matters here is the chaining rule: every class that
//! overrides [`GcTraceable::serialize`](crate::GcTraceable::serialize) must
//! reach [`Archive::serialize_base`], which writes the declared fields and
//! lets the collector set `SERIALIZED_OK`.

use serde::Serialize;

use crate::collector::Collector;
use crate::error::{GcError, Result};
use crate::object::{ObjId, ObjectFlags, Value};

/// One object's entry in the archive
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    /// Object written
    pub id: ObjId,
    /// Class name
    pub class: &'static str,
    /// Declared field values, written by the base step
    pub fields: Vec<Value>,
    /// Extra values written by subclass serializers
    pub extra: Vec<Value>,
}

/// Sink for serialized objects
#[derive(Debug, Default, Serialize)]
pub struct Archive {
    records: Vec<ArchiveRecord>,
    #[serde(skip)]
    pending_fields: Vec<Value>,
    #[serde(skip)]
    base_done: bool,
}

impl Archive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far
    pub fn records(&self) -> &[ArchiveRecord] {
        &self.records
    }

    /// Base serialization step: writes the declared fields.
    pub fn serialize_base(&mut self) {
        if let Some(record) = self.records.last_mut() {
            if !self.base_done {
                record.fields = std::mem::take(&mut self.pending_fields);
            }
        }
        self.base_done = true;
    }

    /// Append a subclass-specific value to the current record
    pub fn write(&mut self, value: Value) {
        if let Some(record) = self.records.last_mut() {
            record.extra.push(value);
        }
    }

    pub(crate) fn begin(&mut self, id: ObjId, class: &'static str, fields: &[Value]) {
        self.records.push(ArchiveRecord {
            id,
            class,
            fields: Vec::new(),
            extra: Vec::new(),
        });
        self.pending_fields = fields.to_vec();
        self.base_done = false;
    }

    /// Returns whether the base step ran for the current record
    pub(crate) fn finish(&mut self) -> bool {
        self.pending_fields.clear();
        std::mem::take(&mut self.base_done)
    }
}

impl Collector {
    /// Serialize one object into `arc`.
    ///
    /// # Panics
    /// Panics if the object's serializer did not chain to
    /// [`Archive::serialize_base`].
    pub fn serialize_object(&mut self, id: ObjId, arc: &mut Archive) -> Result<()> {
        let obj = self.live_mut(id)?;
        obj.header.remove_flags(ObjectFlags::SERIALIZED_OK);
        arc.begin(id, obj.class_name(), &obj.fields);
        match obj.native() {
            Some(native) => native.serialize(arc),
            None => arc.serialize_base(),
        }
        if arc.finish() {
            obj.header.insert_flags(ObjectFlags::SERIALIZED_OK);
        }
        self.check_if_serialized(id)
    }

    /// Verify the base serialization step ran for `id`.
    ///
    /// # Panics
    /// Panics naming the class when `SERIALIZED_OK` is unset.
    pub fn check_if_serialized(&self, id: ObjId) -> Result<()> {
        let obj = self.live(id)?;
        if !obj.header.flags().contains(ObjectFlags::SERIALIZED_OK) {
            panic!("{}", GcError::NotSerialized(obj.class_name()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ClassInfo, FieldInfo, OBJECT_CLASS_NAME, TypeRegistry};
    use crate::object::GcTraceable;

    static COUNTER: ClassInfo = ClassInfo {
        name: "Counter",
        parent: Some(OBJECT_CLASS_NAME),
        fields: &[FieldInfo::int("count"), FieldInfo::object("owner", "Counter")],
        size: 24,
    };

    struct Chained;

    impl GcTraceable for Chained {
        fn serialize(&self, arc: &mut Archive) {
            arc.serialize_base();
            arc.write(Value::Bool(true));
        }
    }

    struct Forgetful;

    impl GcTraceable for Forgetful {
        fn serialize(&self, arc: &mut Archive) {
            arc.write(Value::Int(1));
        }
    }

    fn collector() -> Collector {
        let types = TypeRegistry::new();
        types.register(&COUNTER);
        Collector::new(types)
    }

    #[test]
    fn test_plain_object_serializes_fields() {
        let mut gc = collector();
        let id = gc.allocate(&COUNTER);
        let slot = gc.field(id, "count").unwrap();
        gc.write(id, slot, Value::Int(3)).unwrap();

        let mut arc = Archive::new();
        gc.serialize_object(id, &mut arc).unwrap();

        let record = &arc.records()[0];
        assert_eq!(record.class, "Counter");
        assert_eq!(record.fields, vec![Value::Int(3), Value::Ref(None)]);
        assert!(gc.flags_of(id).unwrap().contains(ObjectFlags::SERIALIZED_OK));
    }

    #[test]
    fn test_chained_native_serializer() {
        let mut gc = collector();
        let id = gc.allocate_with(&COUNTER, Chained);
        let mut arc = Archive::new();
        gc.serialize_object(id, &mut arc).unwrap();
        assert_eq!(arc.records()[0].fields.len(), 2);
        assert_eq!(arc.records()[0].extra, vec![Value::Bool(true)]);
    }

    #[test]
    #[should_panic(expected = "BUG: Counter::serialize")]
    fn test_missing_base_step_panics() {
        let mut gc = collector();
        let id = gc.allocate_with(&COUNTER, Forgetful);
        let mut arc = Archive::new();
        let _ = gc.serialize_object(id, &mut arc);
    }
}
