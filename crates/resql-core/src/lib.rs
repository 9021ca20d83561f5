// SPDX-License-Identifier: Apache-2.0

//! resql core types
//!
//! Shared vocabulary for the change-capture and recovery-logging layers:
//! - **Schema**: static entity descriptors (`TableDef`, `FieldDef`, `Model`)
//! - **Records**: what lands in the audit and recovery stores
//! - **Errors**: the unified `ResqlError`

pub mod error;
pub mod record;
pub mod schema;

pub use error::{ResqlError, ResqlResult};
pub use record::*;
pub use schema::{FieldDef, FieldKind, Model, TableDef, ValueKind};
