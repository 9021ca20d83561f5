// SPDX-License-Identifier: Apache-2.0

//! Audit and recovery records
//!
//! A [`ChangeRecord`] is one mutated entity of one flushed unit of work; a
//! [`QueryRecord`] is one executed write statement. Both are append-only once
//! their writer has committed them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Entity-level operation captured by the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(OpType::Insert),
            "update" => Some(OpType::Update),
            "delete" => Some(OpType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before/after pair for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub old: Value,
    pub new: Value,
}

impl Diff {
    pub fn new(old: Value, new: Value) -> Self {
        Self { old, new }
    }
}

/// Field key -> before/after, only for fields that changed
pub type ModelDiff = BTreeMap<String, Diff>;

/// Free-form metadata bound to a logger
pub type Extra = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Assigned by the audit store
    pub id: Option<i64>,
    pub table_name: String,
    pub record_id: i64,
    pub op_type: OpType,
    pub diff: ModelDiff,
    pub extra: Option<Extra>,
    pub executed_at: DateTime<Utc>,
}

/// Statement category, as seen by the recovery log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    #[default]
    Other,
}

impl StatementKind {
    pub fn is_read_only(&self) -> bool {
        matches!(self, StatementKind::Select)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Create => "create",
            StatementKind::Alter => "alter",
            StatementKind::Drop => "drop",
            StatementKind::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "select" => StatementKind::Select,
            "insert" => StatementKind::Insert,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            "create" => StatementKind::Create,
            "alter" => StatementKind::Alter,
            "drop" => StatementKind::Drop,
            _ => StatementKind::Other,
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One set of bound parameters, in bind order.
///
/// Serializes as a JSON object whose keys keep insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamSet(Vec<(String, Value)>);

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; a repeated name replaces the earlier value in place.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|(_, v)| v)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = ParamSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

impl Serialize for ParamSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParamSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParamSetVisitor;

        impl<'de> Visitor<'de> for ParamSetVisitor {
            type Value = ParamSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of parameter names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ParamSet, A::Error> {
                let mut set = ParamSet::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    set.insert(name, value);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(ParamSetVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Assigned by the recovery store
    pub id: Option<i64>,
    pub dialect_description: String,
    pub statement: String,
    pub parameters: Vec<ParamSet>,
    pub op_type: StatementKind,
    pub extra: Option<Extra>,
    pub executed_at: DateTime<Utc>,
}
