// SPDX-License-Identifier: Apache-2.0

//! Entity diff engine
//!
//! Turns the field history of one tracked entity into a [`ModelDiff`]:
//!
//! | history                      | entry                    |
//! |------------------------------|--------------------------|
//! | added, no prior value        | `{old: null, new: added}`|
//! | added over a prior value     | `{old: prior, new: added}`|
//! | removed                      | `{old: prior, new: null}`|
//! | unchanged                    | none                     |
//!
//! Derived fields and fields outside the entity's variant are skipped. Fields
//! not in memory are loaded first, in one batch, and then count as unchanged.
//! The entity itself is never modified, so the result is stable for a given
//! entity state.

use resql_core::{Diff, FieldDef, ModelDiff, ResqlError, ResqlResult};
use serde_json::Value;

use crate::orm::{EntityState, FieldLoader, TrackedEntity};

pub async fn compute_diff(
    entity: &TrackedEntity,
    loader: &mut dyn FieldLoader,
) -> ResqlResult<ModelDiff> {
    let table = entity.table();
    let variant = entity.variant();

    let fields: Vec<&'static FieldDef> = table
        .fields
        .iter()
        .filter(|f| !f.is_derived())
        .filter(|f| f.applies_to(variant) || table.discriminator == Some(f.name))
        .collect();

    let mut unloaded = Vec::new();
    for field in &fields {
        if entity.history(field.name).is_some() {
            continue;
        }
        if entity.is_assigned(field.name) {
            return Err(ResqlError::diff_error(
                table.name,
                field.name,
                "assigned without a known prior value",
            ));
        }
        unloaded.push(*field);
    }

    if !unloaded.is_empty() {
        let identity = match (entity.state(), entity.identity()) {
            (EntityState::Pending, _) | (_, None) => {
                return Err(ResqlError::diff_error(
                    table.name,
                    unloaded[0].name,
                    "cannot load a field of an entity without identity",
                ));
            }
            (_, Some(identity)) => identity,
        };

        let loaded = loader
            .load_fields(table, identity, &unloaded)
            .await
            .map_err(|e| ResqlError::diff_error(table.name, unloaded[0].name, e.to_string()))?;

        if let Some(missing) = unloaded.iter().find(|f| !loaded.contains_key(f.name)) {
            return Err(ResqlError::diff_error(
                table.name,
                missing.name,
                "field could not be loaded",
            ));
        }
    }

    let mut diff = ModelDiff::new();
    for field in &fields {
        let Some(history) = entity.history(field.name) else {
            continue;
        };
        if !history.has_changes() {
            continue;
        }
        let old = history.deleted.unwrap_or(Value::Null);
        let new = history.added.unwrap_or(Value::Null);
        if old != new {
            diff.insert(field.name.to_string(), Diff::new(old, new));
        }
    }
    Ok(diff)
}
