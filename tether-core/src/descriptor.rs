//! Static field descriptor tables.
//!
//! Each entity kind declares its fields once as a `&'static` table. The table
//! maps the property name used by callers to the key used on the wire, and
//! records whether the field is requested when refreshing.

use crate::EntityKind;

/// One row of a field descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Property name reported in change notifications.
    pub name: &'static str,
    /// Key under which the value travels on the wire and lives in the document.
    pub wire_key: &'static str,
    /// Whether the field is included in the `fields` request parameter.
    pub is_requested: bool,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, wire_key: &'static str) -> Self {
        Self {
            name,
            wire_key,
            is_requested: true,
        }
    }

    /// A field that is known locally but never asked for explicitly
    /// (nested collections are requested through their own parameters).
    pub const fn unrequested(name: &'static str, wire_key: &'static str) -> Self {
        Self {
            name,
            wire_key,
            is_requested: false,
        }
    }
}

/// Descriptor table for one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldTable {
    kind: EntityKind,
    fields: &'static [FieldDescriptor],
}

impl FieldTable {
    pub const fn new(kind: EntityKind, fields: &'static [FieldDescriptor]) -> Self {
        Self { kind, fields }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    pub fn by_name(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn by_wire_key(&self, wire_key: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.wire_key == wire_key)
    }

    /// Property name for a wire key, falling back to the key itself.
    pub fn name_for<'a>(&self, wire_key: &'a str) -> &'a str {
        match self.by_wire_key(wire_key) {
            Some(descriptor) => descriptor.name,
            None => wire_key,
        }
    }

    pub fn requested(&self) -> impl Iterator<Item = &'static FieldDescriptor> {
        self.fields.iter().filter(|f| f.is_requested)
    }

    /// Comma separated wire keys for the `fields` request parameter.
    pub fn fields_parameter(&self) -> String {
        self.requested()
            .map(|f| f.wire_key)
            .collect::<Vec<_>>()
            .join(",")
    }
}
