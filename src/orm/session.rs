// SPDX-License-Identifier: Apache-2.0

//! Unit of work
//!
//! A [`Session`] owns one connection and tracks the entities added to or
//! loaded through it. `flush` turns the accumulated assignments into
//! statements inside the connection's transaction and then fires every
//! [`FlushListener`] while field history is still intact. `commit` flushes,
//! commits and expires every loaded value.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use resql_core::{FieldDef, Model, ParamSet, ResqlError, ResqlResult, TableDef};
use resql_sql::{generate, SqlDialect, Statement};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::connection::{Connection, Row};
use super::database::Database;
use super::entity::{Assignment, AttributeHistory, EntityRef, EntityState, TrackedEntity};
use super::listener::{
    ChangeScope, FieldLoader, FlushContext, FlushListener, StatementListener, StatementScope,
};
use super::SessionId;

/// Creates sessions. Flush listeners attached here are attached to every
/// session created afterwards.
#[derive(Clone)]
pub struct SessionFactory {
    db: Database,
    listeners: Vec<Arc<dyn FlushListener>>,
}

impl SessionFactory {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            listeners: Vec::new(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn add_listener(&mut self, listener: Arc<dyn FlushListener>) {
        self.listeners.push(listener);
    }

    /// New session on a freshly checked-out connection.
    pub async fn session(&self) -> ResqlResult<Session> {
        let conn = self.db.connection().await?;
        Ok(self.session_on(conn))
    }

    /// New session bound to an existing connection.
    pub fn session_on(&self, conn: Connection) -> Session {
        let mut session = Session::new(conn);
        for listener in &self.listeners {
            session.add_flush_listener(listener.clone());
        }
        session
    }
}

impl ChangeScope for SessionFactory {
    fn attach_flush_listener(&mut self, listener: Arc<dyn FlushListener>) {
        self.add_listener(listener);
    }
}

pub struct Session {
    id: SessionId,
    conn: Connection,
    slots: Vec<Option<TrackedEntity>>,
    identity_map: HashMap<(&'static str, i64), usize>,
    /// Entities deleted by a flush of the open transaction, restored on rollback
    removed_in_tx: Vec<(usize, TrackedEntity)>,
    flush_listeners: Vec<Arc<dyn FlushListener>>,
    /// Set when a flush failed after writing; cleared by `rollback`.
    needs_rollback: bool,
}

impl Session {
    pub fn new(conn: Connection) -> Self {
        Self {
            id: SessionId::new(),
            conn,
            slots: Vec::new(),
            identity_map: HashMap::new(),
            removed_in_tx: Vec::new(),
            flush_listeners: Vec::new(),
            needs_rollback: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// True after a flush failed part way, until `rollback` is called.
    pub fn needs_rollback(&self) -> bool {
        self.needs_rollback
    }

    pub fn add_flush_listener(&mut self, listener: Arc<dyn FlushListener>) {
        self.flush_listeners.push(listener);
    }

    fn slot(&self, index: usize) -> ResqlResult<&TrackedEntity> {
        self.slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| ResqlError::mapping("Entity is no longer tracked by this session"))
    }

    fn slot_mut(&mut self, index: usize) -> ResqlResult<&mut TrackedEntity> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| ResqlError::mapping("Entity is no longer tracked by this session"))
    }

    pub fn entity<M: Model>(&self, entity: EntityRef<M>) -> ResqlResult<&TrackedEntity> {
        self.slot(entity.index)
    }

    pub fn history<M: Model>(
        &self,
        entity: EntityRef<M>,
        field: &str,
    ) -> ResqlResult<Option<AttributeHistory>> {
        Ok(self.slot(entity.index)?.history(field))
    }

    /// Starts tracking a new entity. `null` fields are left unset.
    pub fn add<M: Model>(&mut self, model: &M) -> ResqlResult<EntityRef<M>> {
        let table = M::table();
        let values = serialize_model(model)?;
        let mut entity = TrackedEntity::new_pending(table);

        let variant = table
            .discriminator
            .and_then(|d| values.get(d))
            .and_then(Value::as_str);

        for field in table.writable_fields() {
            if !field.applies_to(variant) && table.discriminator != Some(field.name) {
                continue;
            }
            match values.get(field.name) {
                Some(value) if !value.is_null() => {
                    entity
                        .pending
                        .insert(field.name, Assignment::Set(value.clone()));
                }
                _ => {}
            }
        }

        self.slots.push(Some(entity));
        Ok(EntityRef::new(self.slots.len() - 1))
    }

    fn writable_field(
        &mut self,
        index: usize,
        field: &str,
    ) -> ResqlResult<(&mut TrackedEntity, &'static FieldDef)> {
        let entity = self.slot_mut(index)?;
        let table = entity.table();
        let def = table.field(field).ok_or_else(|| {
            ResqlError::mapping(format!("{}.{} is not a mapped field", table.name, field))
        })?;
        if def.is_derived() {
            return Err(ResqlError::mapping(format!(
                "{}.{} is computed by the store and cannot be assigned",
                table.name, field
            )));
        }
        if def.name == table.identity && entity.state() != EntityState::Pending {
            return Err(ResqlError::mapping(format!(
                "Identity of a persistent {} cannot change",
                table.name
            )));
        }
        if entity.state() == EntityState::Deleted {
            return Err(ResqlError::mapping(format!(
                "{} is marked for deletion",
                table.name
            )));
        }
        Ok((entity, def))
    }

    pub fn set<M: Model>(
        &mut self,
        entity: EntityRef<M>,
        field: &str,
        value: impl Serialize,
    ) -> ResqlResult<()> {
        let value = serde_json::to_value(value).map_err(|e| ResqlError::mapping(e.to_string()))?;
        let (tracked, def) = self.writable_field(entity.index, field)?;
        tracked.pending.insert(def.name, Assignment::Set(value));
        Ok(())
    }

    /// Removes the value of `field` without replacing it.
    pub fn unset<M: Model>(&mut self, entity: EntityRef<M>, field: &str) -> ResqlResult<()> {
        let (tracked, def) = self.writable_field(entity.index, field)?;
        tracked.pending.insert(def.name, Assignment::Removed);
        Ok(())
    }

    /// Assigns every writable field of `model` except the identity.
    pub fn assign<M: Model>(&mut self, entity: EntityRef<M>, model: &M) -> ResqlResult<()> {
        let values = serialize_model(model)?;
        let table = M::table();
        for field in table.writable_fields() {
            if field.name == table.identity {
                continue;
            }
            if let Some(value) = values.get(field.name) {
                let (tracked, def) = self.writable_field(entity.index, field.name)?;
                tracked.pending.insert(def.name, Assignment::Set(value.clone()));
            }
        }
        Ok(())
    }

    /// Marks a persistent entity for deletion; a pending one is just forgotten.
    pub fn delete<M: Model>(&mut self, entity: EntityRef<M>) -> ResqlResult<()> {
        let tracked = self.slot_mut(entity.index)?;
        match tracked.state() {
            EntityState::Pending => {
                self.slots[entity.index] = None;
            }
            EntityState::Persistent => tracked.state = EntityState::Deleted,
            EntityState::Deleted => {}
        }
        Ok(())
    }

    /// Current field values of `entity`, loading whatever is not in memory.
    pub async fn get<M: Model>(&mut self, entity: EntityRef<M>) -> ResqlResult<M> {
        let (table, identity, missing) = {
            let tracked = self.slot(entity.index)?;
            let missing: Vec<&'static FieldDef> = tracked
                .applicable_fields()
                .filter(|f| !tracked.is_loaded(f.name))
                .collect();
            let identity = match tracked.state() {
                EntityState::Pending => None,
                _ => tracked.identity(),
            };
            (tracked.table(), identity, missing)
        };

        if let Some(identity) = identity.filter(|_| !missing.is_empty()) {
            let values = self.conn.load_fields(table, identity, &missing).await?;
            self.slot_mut(entity.index)?.merge_loaded(values);
        }

        let tracked = self.slot(entity.index)?;
        serde_json::from_value(tracked.to_json()).map_err(|e| ResqlError::mapping(e.to_string()))
    }

    /// Entity by identity, loading it (or refreshing it if expired) as needed.
    pub async fn find<M: Model>(&mut self, identity: i64) -> ResqlResult<Option<EntityRef<M>>> {
        let table = M::table();
        let eager: Vec<&'static FieldDef> = table.eager_fields().collect();

        if let Some(&index) = self.identity_map.get(&(table.name, identity)) {
            let stale = {
                let tracked = self.slot(index)?;
                tracked.state() != EntityState::Pending
                    && eager.iter().any(|f| !tracked.is_loaded(f.name))
            };
            if !stale {
                return Ok(Some(EntityRef::new(index)));
            }
        }

        let statement = generate::select_by_identity(SqlDialect::Sqlite, table, &eager);
        let params = ParamSet::new().with(generate::IDENTITY_PARAM, identity);
        let rows = self.conn.fetch_all(statement, &params).await?;

        match rows.first() {
            Some(row) => Ok(Some(EntityRef::new(self.track_row(table, &eager, row)?))),
            None => {
                if let Some(index) = self.identity_map.remove(&(table.name, identity)) {
                    self.slots[index] = None;
                }
                Ok(None)
            }
        }
    }

    /// Every row of the entity's table, ordered by identity.
    pub async fn find_all<M: Model>(&mut self) -> ResqlResult<Vec<EntityRef<M>>> {
        let table = M::table();
        let eager: Vec<&'static FieldDef> = table.eager_fields().collect();
        let statement = generate::select_all(SqlDialect::Sqlite, table, &eager);
        let rows = self.conn.fetch_all(statement, &ParamSet::new()).await?;

        rows.iter()
            .map(|row| self.track_row(table, &eager, row).map(EntityRef::new))
            .collect()
    }

    fn track_row(
        &mut self,
        table: &'static TableDef,
        fields: &[&'static FieldDef],
        row: &Row,
    ) -> ResqlResult<usize> {
        let identity = row
            .get(generate::identity_column(table))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ResqlError::mapping(format!("{} row without an integer identity", table.name))
            })?;
        let values: BTreeMap<&'static str, Value> = fields
            .iter()
            .map(|f| {
                let raw = row.get(f.column).cloned().unwrap_or(Value::Null);
                (f.name, f.decode(raw))
            })
            .collect();

        if let Some(&index) = self.identity_map.get(&(table.name, identity)) {
            if let Some(tracked) = self.slots.get_mut(index).and_then(Option::as_mut) {
                tracked.merge_loaded(values);
                return Ok(index);
            }
        }

        self.slots
            .push(Some(TrackedEntity::loaded(table, identity, values)));
        let index = self.slots.len() - 1;
        self.identity_map.insert((table.name, identity), index);
        Ok(index)
    }

    /// Raw statement through the session's connection; bypasses entity tracking.
    pub async fn execute(
        &mut self,
        statement: impl Into<Statement>,
        params: &[ParamSet],
    ) -> ResqlResult<u64> {
        self.conn.execute(statement, params).await
    }

    pub async fn fetch_all(
        &mut self,
        statement: impl Into<Statement>,
        params: &ParamSet,
    ) -> ResqlResult<Vec<Row>> {
        self.conn.fetch_all(statement, params).await
    }

    /// Writes pending changes and fires the flush listeners.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn flush(&mut self) -> ResqlResult<()> {
        if self.needs_rollback {
            return Err(ResqlError::transaction_error(
                "A previous flush failed part way; roll back before flushing again",
            ));
        }

        let mut new = Vec::new();
        let mut deleted = Vec::new();
        let mut candidates = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(entity) = slot else { continue };
            match entity.state() {
                EntityState::Pending => new.push(index),
                EntityState::Deleted => deleted.push(index),
                EntityState::Persistent if !entity.pending.is_empty() => candidates.push(index),
                EntityState::Persistent => {}
            }
        }
        if new.is_empty() && deleted.is_empty() && candidates.is_empty() {
            return Ok(());
        }

        // Prior values of assigned fields must be known before any write
        for &index in &candidates {
            let (table, identity, missing) = {
                let entity = self.slot(index)?;
                (entity.table(), entity.identity(), entity.unloaded_assigned())
            };
            if missing.is_empty() {
                continue;
            }
            let identity = identity
                .ok_or_else(|| ResqlError::internal("Persistent entity without identity"))?;
            let values = self.conn.load_fields(table, identity, &missing).await?;
            self.slot_mut(index)?.merge_loaded(values);
        }

        let mut dirty = Vec::new();
        for &index in &candidates {
            if !self.slot(index)?.changed_fields().is_empty() {
                dirty.push(index);
            }
        }

        if new.is_empty() && deleted.is_empty() && dirty.is_empty() {
            for &index in &candidates {
                self.slot_mut(index)?.reset_history();
            }
            return Ok(());
        }

        let listeners = match self.write_and_notify(&new, &dirty, &deleted).await {
            Ok(listeners) => listeners,
            Err(e) => {
                self.needs_rollback = true;
                warn!(error = %e, "Flush failed after writing; transaction needs a rollback");
                return Err(e);
            }
        };

        for &index in new.iter().chain(&candidates) {
            self.slot_mut(index)?.reset_history();
        }
        for &index in &deleted {
            if let Some(entity) = self.slots[index].take() {
                if let Some(identity) = entity.identity() {
                    self.identity_map.remove(&(entity.table().name, identity));
                }
                self.removed_in_tx.push((index, entity));
            }
        }

        debug!(
            inserted = new.len(),
            updated = dirty.len(),
            deleted = deleted.len(),
            listeners,
            "Flushed unit of work"
        );
        Ok(())
    }

    /// Issues the planned writes, then runs every flush listener over them.
    async fn write_and_notify(
        &mut self,
        new: &[usize],
        dirty: &[usize],
        deleted: &[usize],
    ) -> ResqlResult<usize> {
        for &index in new {
            self.insert_entity(index).await?;
        }
        for &index in dirty {
            self.update_entity(index).await?;
        }
        self.delete_entities(deleted).await?;

        let listeners = self.flush_listeners.clone();
        let mut ctx = FlushContext {
            session_id: self.id,
            new: pick(&self.slots, new),
            dirty: pick(&self.slots, dirty),
            deleted: pick(&self.slots, deleted),
            loader: &mut self.conn,
        };
        for listener in &listeners {
            listener.after_flush(&mut ctx).await?;
        }
        Ok(listeners.len())
    }

    async fn insert_entity(&mut self, index: usize) -> ResqlResult<()> {
        let (table, fields, params) = {
            let entity = self.slot(index)?;
            let fields: Vec<&'static FieldDef> = entity
                .table()
                .fields
                .iter()
                .filter(|f| matches!(entity.pending.get(f.name), Some(Assignment::Set(_))))
                .collect();
            let params: ParamSet = fields
                .iter()
                .map(|f| (f.column, entity.value(f.name).cloned().unwrap_or(Value::Null)))
                .collect();
            (entity.table(), fields, params)
        };

        let statement = generate::insert(SqlDialect::Sqlite, table, &fields);
        let rows = self.conn.fetch_all(statement, &params).await?;
        let identity = rows
            .first()
            .and_then(|row| row.get(generate::identity_column(table)))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ResqlError::execution_error(format!(
                    "INSERT INTO {} returned no identity",
                    table.name
                ))
            })?;

        let entity = self.slot_mut(index)?;
        entity.identity = Some(identity);
        if !entity.pending.contains_key(table.identity) {
            // Store-assigned; no history
            entity.committed.insert(table.identity, Value::from(identity));
        }
        entity.inserted_in_tx = true;
        self.identity_map.insert((table.name, identity), index);
        Ok(())
    }

    async fn update_entity(&mut self, index: usize) -> ResqlResult<()> {
        let (table, identity, fields, params) = {
            let entity = self.slot(index)?;
            let table = entity.table();
            let identity = entity
                .identity()
                .ok_or_else(|| ResqlError::internal("Persistent entity without identity"))?;
            let fields = entity.changed_fields();
            let mut params: ParamSet = fields
                .iter()
                .map(|f| (f.column, entity.value(f.name).cloned().unwrap_or(Value::Null)))
                .collect();
            params.insert(generate::IDENTITY_PARAM, identity);
            (table, identity, fields, params)
        };

        let statement = generate::update(SqlDialect::Sqlite, table, &fields);
        let affected = self
            .conn
            .execute(statement, std::slice::from_ref(&params))
            .await?;
        if affected == 0 {
            return Err(ResqlError::execution_error(format!(
                "UPDATE of {} {} matched no row",
                table.name, identity
            )));
        }
        Ok(())
    }

    /// One batched DELETE per table, in first-deleted order.
    async fn delete_entities(&mut self, deleted: &[usize]) -> ResqlResult<()> {
        let mut batches: Vec<(&'static TableDef, Vec<ParamSet>)> = Vec::new();
        for &index in deleted {
            let entity = self.slot(index)?;
            let table = entity.table();
            let identity = entity
                .identity()
                .ok_or_else(|| ResqlError::internal("Deleted entity without identity"))?;
            let set = ParamSet::new().with(generate::IDENTITY_PARAM, identity);
            match batches.iter_mut().find(|(t, _)| t.name == table.name) {
                Some((_, sets)) => sets.push(set),
                None => batches.push((table, vec![set])),
            }
        }

        for (table, sets) in batches {
            let statement = generate::delete(SqlDialect::Sqlite, table);
            self.conn.execute(statement, &sets).await?;
        }
        Ok(())
    }

    /// Flush, commit, then expire every loaded value.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn commit(&mut self) -> ResqlResult<()> {
        self.flush().await?;
        self.conn.commit().await?;

        self.removed_in_tx.clear();
        for entity in self.slots.iter_mut().flatten() {
            entity.inserted_in_tx = false;
            entity.expire();
        }
        Ok(())
    }

    /// Rolls the transaction back and resets tracked state to match it.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn rollback(&mut self) -> ResqlResult<()> {
        self.conn.rollback().await?;
        self.needs_rollback = false;

        for (index, mut entity) in self.removed_in_tx.drain(..) {
            entity.state = EntityState::Persistent;
            if let Some(identity) = entity.identity() {
                self.identity_map.insert((entity.table().name, identity), index);
            }
            self.slots[index] = Some(entity);
        }

        for slot in self.slots.iter_mut() {
            let expunge = slot
                .as_ref()
                .is_some_and(|e| e.state() == EntityState::Pending || e.inserted_in_tx);
            if expunge {
                if let Some(entity) = slot.take() {
                    if let Some(identity) = entity.identity() {
                        self.identity_map.remove(&(entity.table().name, identity));
                    }
                }
            } else if let Some(entity) = slot.as_mut() {
                if entity.state() == EntityState::Deleted {
                    entity.state = EntityState::Persistent;
                }
                entity.expire();
            }
        }
        Ok(())
    }

    /// Rolls back anything uncommitted and releases the connection.
    pub async fn close(self) -> ResqlResult<()> {
        self.conn.close().await
    }
}

impl ChangeScope for Session {
    fn attach_flush_listener(&mut self, listener: Arc<dyn FlushListener>) {
        self.add_flush_listener(listener);
    }
}

impl StatementScope for Session {
    fn attach_statement_listener(&mut self, listener: Arc<dyn StatementListener>) {
        self.conn.add_listener(listener);
    }
}

fn pick<'a>(slots: &'a [Option<TrackedEntity>], indices: &[usize]) -> Vec<&'a TrackedEntity> {
    indices
        .iter()
        .filter_map(|&i| slots.get(i).and_then(Option::as_ref))
        .collect()
}

fn serialize_model<M: Model>(model: &M) -> ResqlResult<serde_json::Map<String, Value>> {
    match serde_json::to_value(model).map_err(|e| ResqlError::mapping(e.to_string()))? {
        Value::Object(map) => Ok(map),
        _ => Err(ResqlError::mapping(format!(
            "{} must serialize to an object",
            M::table().name
        ))),
    }
}
