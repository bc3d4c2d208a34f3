//! Collector error types

use crate::object::ObjId;
use thiserror::Error;

/// Errors reported by the object lifecycle core.
///
/// Descriptor and serialization errors are configuration bugs: the collector
/// turns them into a panic at the point they are detected, so they only show
/// up as values from the fallible lookup entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcError {
    /// Handle refers to an object that has already been freed
    #[error("stale object handle {0:?}")]
    StaleHandle(ObjId),

    /// Class was never registered with the type registry
    #[error("class '{0}' is not registered")]
    UnknownClass(&'static str),

    /// Parent class named in metadata is not registered
    #[error("class '{class}' names unregistered parent '{parent}'")]
    UnknownParent {
        /// Class being described
        class: &'static str,
        /// Missing parent
        parent: &'static str,
    },

    /// Reference field points at a class the registry does not know
    #[error("field '{class}.{field}' references unknown class '{target}'")]
    UnknownReferenceTarget {
        /// Class declaring the field
        class: &'static str,
        /// Field name
        field: &'static str,
        /// Declared target class
        target: &'static str,
    },

    /// Fixed-size reference array declared with no elements
    #[error("field '{class}.{field}' is a zero-length reference array")]
    EmptyReferenceArray {
        /// Class declaring the field
        class: &'static str,
        /// Field name
        field: &'static str,
    },

    /// Same field name declared twice along the inheritance chain
    #[error("field '{field}' is declared twice in the hierarchy of '{class}'")]
    DuplicateField {
        /// Class being described
        class: &'static str,
        /// Duplicated field name
        field: &'static str,
    },

    /// Parent chain loops back on itself
    #[error("inheritance cycle through class '{0}'")]
    InheritanceCycle(&'static str),

    /// Field lookup by name failed
    #[error("class '{class}' has no field '{field}'")]
    NoSuchField {
        /// Class searched
        class: &'static str,
        /// Requested field
        field: String,
    },

    /// Store or read used the wrong kind of value for a field
    #[error("field '{field}' of class '{class}' holds {expected}")]
    FieldTypeMismatch {
        /// Class declaring the field
        class: &'static str,
        /// Field name
        field: &'static str,
        /// What the field actually holds
        expected: &'static str,
    },

    /// A subclass serializer did not chain to the base step
    #[error(
        "BUG: {0}::serialize (or one of its superclasses) needs to call Archive::serialize_base"
    )]
    NotSerialized(&'static str),
}

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, GcError>;
