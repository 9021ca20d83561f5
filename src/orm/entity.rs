//! Tracked entity state and per-field history

use std::collections::BTreeMap;
use std::marker::PhantomData;

use resql_core::{FieldDef, Model, TableDef};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Added to the session, not yet inserted or inserted but not yet flushed
    Pending,
    Persistent,
    /// Marked for deletion
    Deleted,
}

/// An application write to one field since the last flush
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Set(Value),
    Removed,
}

/// History of one field, by analogy with an attribute's
/// added/unchanged/deleted triple.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeHistory {
    pub added: Option<Value>,
    pub unchanged: Option<Value>,
    pub deleted: Option<Value>,
}

impl AttributeHistory {
    pub fn has_changes(&self) -> bool {
        self.added.is_some() || self.deleted.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct TrackedEntity {
    table: &'static TableDef,
    pub(crate) state: EntityState,
    pub(crate) identity: Option<i64>,
    /// Loaded values; a missing key means "not loaded"
    pub(crate) committed: BTreeMap<&'static str, Value>,
    pub(crate) pending: BTreeMap<&'static str, Assignment>,
    /// Inserted inside the still-open transaction
    pub(crate) inserted_in_tx: bool,
}

impl TrackedEntity {
    pub(crate) fn new_pending(table: &'static TableDef) -> Self {
        Self {
            table,
            state: EntityState::Pending,
            identity: None,
            committed: BTreeMap::new(),
            pending: BTreeMap::new(),
            inserted_in_tx: false,
        }
    }

    pub(crate) fn loaded(
        table: &'static TableDef,
        identity: i64,
        values: BTreeMap<&'static str, Value>,
    ) -> Self {
        Self {
            table,
            state: EntityState::Persistent,
            identity: Some(identity),
            committed: values,
            pending: BTreeMap::new(),
            inserted_in_tx: false,
        }
    }

    pub fn table(&self) -> &'static TableDef {
        self.table
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Store-assigned identity; `None` until the entity has been inserted.
    pub fn identity(&self) -> Option<i64> {
        self.identity
    }

    pub fn is_loaded(&self, field: &str) -> bool {
        self.committed.contains_key(field)
    }

    pub fn is_assigned(&self, field: &str) -> bool {
        self.pending.contains_key(field)
    }

    /// Current in-memory value: the pending assignment, else the loaded value.
    pub fn value(&self, field: &str) -> Option<&Value> {
        match self.pending.get(field) {
            Some(Assignment::Set(v)) => Some(v),
            Some(Assignment::Removed) => None,
            None => self.committed.get(field),
        }
    }

    /// Discriminator value for single-table hierarchies.
    pub fn variant(&self) -> Option<&str> {
        self.table
            .discriminator
            .and_then(|field| self.value(field))
            .and_then(Value::as_str)
    }

    /// History of `field`, or `None` when its prior value is unknown.
    ///
    /// A pending entity has no prior values, so only its assignments show up.
    /// A persistent entity needs its prior value loaded to report anything.
    pub fn history(&self, field: &str) -> Option<AttributeHistory> {
        let prior = match self.state {
            EntityState::Pending => self.committed.get(field).cloned().or(Some(Value::Null)),
            _ => self.committed.get(field).cloned(),
        };

        match (self.pending.get(field), prior) {
            (None, None) => None,
            (None, Some(prior)) => Some(AttributeHistory {
                unchanged: (!prior.is_null()).then_some(prior),
                ..Default::default()
            }),
            (Some(_), None) => None,
            (Some(Assignment::Set(new)), Some(prior)) => {
                if *new == prior {
                    Some(AttributeHistory {
                        unchanged: (!prior.is_null()).then_some(prior),
                        ..Default::default()
                    })
                } else {
                    Some(AttributeHistory {
                        added: Some(new.clone()),
                        unchanged: None,
                        deleted: (!prior.is_null()).then_some(prior),
                    })
                }
            }
            (Some(Assignment::Removed), Some(prior)) => Some(AttributeHistory {
                deleted: (!prior.is_null()).then_some(prior),
                ..Default::default()
            }),
        }
    }

    /// Stored fields this entity's variant carries.
    pub fn applicable_fields(&self) -> impl Iterator<Item = &'static FieldDef> + '_ {
        let variant = self.variant();
        self.table
            .fields
            .iter()
            .filter(move |f| f.applies_to(variant) || self.table.discriminator == Some(f.name))
    }

    /// Assigned fields whose net value differs from the loaded one.
    pub fn changed_fields(&self) -> Vec<&'static FieldDef> {
        self.table
            .fields
            .iter()
            .filter(|f| self.pending.contains_key(f.name))
            .filter(|f| self.history(f.name).is_some_and(|h| h.has_changes()))
            .collect()
    }

    /// Assigned fields of a persistent entity whose prior value is unknown.
    pub(crate) fn unloaded_assigned(&self) -> Vec<&'static FieldDef> {
        self.table
            .fields
            .iter()
            .filter(|f| self.pending.contains_key(f.name) && !self.committed.contains_key(f.name))
            .collect()
    }

    pub(crate) fn merge_loaded(&mut self, values: BTreeMap<&'static str, Value>) {
        for (field, value) in values {
            self.committed.entry(field).or_insert(value);
        }
    }

    /// Pending values become committed; history starts over.
    pub(crate) fn reset_history(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (field, assignment) in pending {
            let value = match assignment {
                Assignment::Set(v) => v,
                Assignment::Removed => Value::Null,
            };
            self.committed.insert(field, value);
        }
        if self.state == EntityState::Pending {
            self.state = EntityState::Persistent;
        }
    }

    /// Drops every loaded value; the next access reloads.
    pub(crate) fn expire(&mut self) {
        self.committed.clear();
        self.pending.clear();
    }

    /// Full field map for deserialization; unknown fields are `null`.
    pub(crate) fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for field in self.table.fields {
            let value = self.value(field.name).cloned().unwrap_or(Value::Null);
            map.insert(field.name.to_string(), value);
        }
        if let Some(id) = self.identity {
            map.insert(self.table.identity.to_string(), Value::from(id));
        }
        Value::Object(map)
    }
}

/// Typed handle to an entity tracked by a [`Session`](super::Session).
pub struct EntityRef<M> {
    pub(crate) index: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Model> EntityRef<M> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }
}

impl<M> Clone for EntityRef<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for EntityRef<M> {}

impl<M> std::fmt::Debug for EntityRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EntityRef").field(&self.index).finish()
    }
}

impl<M> PartialEq for EntityRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<M> Eq for EntityRef<M> {}
