// SPDX-License-Identifier: Apache-2.0

//! Transactional data-access layer
//!
//! A small unit of work over `sqlx`/SQLite. It is the collaborator the
//! interceptors attach to:
//! - [`Session`] accumulates created/updated/deleted entities and fires
//!   [`FlushListener`]s at the materialization point of every flush.
//! - [`Connection`] reports every executed statement, with its bound
//!   parameters, to the [`StatementListener`]s in scope.
//! - [`TrackedEntity`] keeps per-field history (added/unchanged/deleted).

mod connection;
mod database;
mod entity;
mod listener;
mod session;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use connection::{Connection, Row, TransactionScope};
pub use database::{Database, DIALECT_DESCRIPTION};
pub use entity::{Assignment, AttributeHistory, EntityRef, EntityState, TrackedEntity};
pub use listener::{
    ChangeScope, FieldLoader, FlushContext, FlushListener, StatementEvent, StatementListener,
    StatementScope,
};
pub use session::{Session, SessionFactory};

/// Unique identifier for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a pooled connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
