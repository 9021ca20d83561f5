//! Static entity descriptors
//!
//! Every entity type declares its backing table and the ordered list of its
//! fields once, as a `static`. The unit of work and the diff engine only ever
//! walk these descriptors; nothing is discovered at runtime.
//!
//! ```
//! use resql_core::{FieldDef, TableDef};
//!
//! pub static NUMBER: TableDef = TableDef::new(
//!     "number",
//!     "id",
//!     &[
//!         FieldDef::stored("id"),
//!         FieldDef::stored("value"),
//!         FieldDef::derived("doubled"),
//!     ],
//! );
//!
//! assert!(NUMBER.field("doubled").unwrap().is_derived());
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Whether a field is written by the application or produced by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Stored,
    /// Generated/computed column; never written, never diffed.
    Derived,
}

/// Shape of a field's value in entity payloads.
///
/// The primary store has fewer column types than JSON, so values read back
/// from a row are converted to this shape before they are compared or
/// deserialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Whatever the store returns
    #[default]
    Any,
    /// Stored as 0/1
    Bool,
    Integer,
    Real,
    Text,
    /// Object or array stored as JSON text
    Json,
}

impl ValueKind {
    /// Converts a value read from the store into this shape. Values that do
    /// not have the expected storage form are returned unchanged.
    pub fn decode(self, raw: Value) -> Value {
        match (self, raw) {
            (ValueKind::Bool, Value::Number(n)) => match n.as_i64() {
                Some(0) => Value::Bool(false),
                Some(1) => Value::Bool(true),
                _ => Value::Number(n),
            },
            (ValueKind::Integer, Value::Number(n)) => match n.as_f64() {
                Some(f) if n.as_i64().is_none() && f.fract() == 0.0 => Value::from(f as i64),
                _ => Value::Number(n),
            },
            (ValueKind::Real, Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
                (Some(_), Some(f)) => Value::from(f),
                _ => Value::Number(n),
            },
            (ValueKind::Text, Value::Number(n)) => Value::String(n.to_string()),
            (ValueKind::Json, Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            (_, raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Key used in entity payloads and in diffs
    pub name: &'static str,
    /// Backing column
    pub column: &'static str,
    pub kind: FieldKind,
    /// Not selected when the entity is loaded; fetched on first access.
    pub deferred: bool,
    /// Discriminator values this field applies to (empty = all)
    pub variants: &'static [&'static str],
    pub value: ValueKind,
}

impl FieldDef {
    pub const fn stored(name: &'static str) -> Self {
        Self {
            name,
            column: name,
            kind: FieldKind::Stored,
            deferred: false,
            variants: &[],
            value: ValueKind::Any,
        }
    }

    pub const fn derived(name: &'static str) -> Self {
        Self {
            name,
            column: name,
            kind: FieldKind::Derived,
            deferred: false,
            variants: &[],
            value: ValueKind::Any,
        }
    }

    /// Maps the field onto a column with a different name.
    pub const fn column(self, column: &'static str) -> Self {
        Self { column, ..self }
    }

    pub const fn deferred(self) -> Self {
        Self {
            deferred: true,
            ..self
        }
    }

    pub const fn typed(self, value: ValueKind) -> Self {
        Self { value, ..self }
    }

    pub const fn boolean(self) -> Self {
        self.typed(ValueKind::Bool)
    }

    pub const fn json(self) -> Self {
        self.typed(ValueKind::Json)
    }

    /// Loaded column value in payload form.
    pub fn decode(&self, raw: Value) -> Value {
        self.value.decode(raw)
    }

    /// Restricts the field to some variants of a single-table hierarchy.
    pub const fn only_for(self, variants: &'static [&'static str]) -> Self {
        Self { variants, ..self }
    }

    pub fn is_derived(&self) -> bool {
        self.kind == FieldKind::Derived
    }

    pub fn applies_to(&self, variant: Option<&str>) -> bool {
        if self.variants.is_empty() {
            return true;
        }
        variant
            .map(|v| self.variants.contains(&v))
            .unwrap_or(false)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    /// Name of the identity field (must be listed in `fields`)
    pub identity: &'static str,
    /// Field holding the variant name in single-table polymorphism
    pub discriminator: Option<&'static str>,
    pub fields: &'static [FieldDef],
}

impl TableDef {
    pub const fn new(
        name: &'static str,
        identity: &'static str,
        fields: &'static [FieldDef],
    ) -> Self {
        Self {
            name,
            identity,
            discriminator: None,
            fields,
        }
    }

    pub const fn with_discriminator(self, field: &'static str) -> Self {
        Self {
            discriminator: Some(field),
            ..self
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn identity_field(&self) -> Option<&FieldDef> {
        self.field(self.identity)
    }

    /// Fields the application may assign (everything but derived columns).
    pub fn writable_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_derived())
    }

    /// Fields selected when an entity is loaded.
    pub fn eager_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.deferred)
    }
}

/// An entity type the unit of work can track.
///
/// `serde` serialization is the field accessor: every key of the serialized
/// object that names a field of [`Model::table`] is read, and `null` means
/// "not set".
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn table() -> &'static TableDef;
}
