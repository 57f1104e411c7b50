//! INSERT / UPDATE / DELETE.
//!
//! UPDATE and DELETE never reuse a row's uid: `MvccEngine::overwrite` only
//! works for equal-length payloads (see `data_item::DataManager::after`),
//! and an updated row's encoded length can change. Both instead delete the
//! old version and insert a new one, then re-point every indexed field's
//! B+ tree at the new uid. Old index entries are left stale — they point at
//! a uid that's no longer visible, so `collect_candidate_uids` callers
//! filter them out for free via `MvccEngine::read` returning `None`.

use crate::catalog::Table;
use crate::error::{DbError, Result};
use crate::executor::evaluator::eval_where;
use crate::executor::query::collect_candidate_uids;
use crate::executor::Executor;
use crate::parser::ast::{Literal, WhereClause};
use crate::types::{decode_row, encode_row, DataType, Field, ExecResult, Row, Value};

fn coerce_literal(field: &Field, lit: &Literal) -> Result<Value> {
    match (&field.ty, lit) {
        (DataType::Int32, Literal::Int(i)) => Ok(Value::Int32(*i as i32)),
        (DataType::Int64, Literal::Int(i)) => Ok(Value::Int64(*i)),
        (DataType::String, Literal::Str(s)) => Ok(Value::String(s.clone())),
        _ => Err(DbError::InvalidValues(format!(
            "value type does not match column {}",
            field.name
        ))),
    }
}

impl Executor {
    fn build_row(&self, table: &Table, columns: &Option<Vec<String>>, values: &[Literal]) -> Result<Row> {
        let names: Vec<String> = match columns {
            Some(cols) => cols.clone(),
            None => table.fields.iter().map(|f| f.name.clone()).collect(),
        };
        if names.len() != values.len() {
            return Err(DbError::InvalidValues(
                "column count does not match value count".into(),
            ));
        }
        let mut row = Row::new();
        for (name, lit) in names.iter().zip(values.iter()) {
            let field = table
                .field(name)
                .ok_or_else(|| DbError::FieldNotFound(name.clone()))?;
            row.insert(name.clone(), coerce_literal(field, lit)?);
        }
        for field in &table.fields {
            if row.contains_key(&field.name) {
                continue;
            }
            if field.primary {
                return Err(DbError::InvalidValues(format!(
                    "missing value for primary column {}",
                    field.name
                )));
            }
            row.insert(field.name.clone(), field.ty.zero_value());
        }
        Ok(row)
    }

    /// Reserve every primary/unique field's key before the visibility check
    /// closes the race where two inserts both pass `tree.find` for the same
    /// key before either has committed its index entry.
    fn reserve_unique_fields(&self, table: &Table, row: &Row) -> Result<Vec<(String, i64)>> {
        let mut reserved = Vec::new();
        for field in &table.fields {
            if !(field.primary || field.unique) {
                continue;
            }
            let key = row
                .get(&field.name)
                .and_then(Value::as_i64_key)
                .ok_or_else(|| DbError::InvalidField(format!("{} must be an integer key", field.name)))?;
            if let Err(e) = self.unique_guard.reserve(&table.name, &field.name, key) {
                self.release_reservations(table, &reserved);
                return Err(e);
            }
            reserved.push((field.name.clone(), key));
        }
        Ok(reserved)
    }

    fn release_reservations(&self, table: &Table, reserved: &[(String, i64)]) {
        for (field, key) in reserved {
            self.unique_guard.release(&table.name, field, *key);
        }
    }

    pub(crate) fn insert(
        &self,
        xid: u64,
        table_name: &str,
        columns: Option<Vec<String>>,
        values: Vec<Literal>,
    ) -> Result<ExecResult> {
        let table = self
            .catalog
            .get(table_name)
            .ok_or_else(|| DbError::TableNotFound(table_name.to_string()))?;
        let row = self.build_row(&table, &columns, &values)?;
        let reserved = self.reserve_unique_fields(&table, &row)?;
        let result = self.try_insert(xid, &table, &row);
        self.release_reservations(&table, &reserved);
        result
    }

    fn try_insert(&self, xid: u64, table: &Table, row: &Row) -> Result<ExecResult> {
        for field in &table.fields {
            if let Some(tree) = table.indexes.get(&field.name) {
                let key = row.get(&field.name).and_then(Value::as_i64_key).unwrap();
                for uid in tree.find(key)? {
                    if self.mvcc.read(xid, uid)?.is_some() {
                        return Err(DbError::DuplicatedEntry);
                    }
                }
            }
        }

        let body = encode_row(&table.fields, row)?;
        let uid = self.mvcc.insert(xid, &body)?;
        for field in &table.fields {
            if let Some(tree) = table.indexes.get(&field.name) {
                let key = row.get(&field.name).and_then(Value::as_i64_key).unwrap();
                tree.insert(key, uid)?;
            }
        }

        Ok(ExecResult::Ok {
            message: "1 row inserted".to_string(),
            affected_rows: 1,
            elapsed_ns: 0,
        })
    }

    pub(crate) fn update(
        &self,
        xid: u64,
        table_name: &str,
        assignments: Vec<(String, Literal)>,
        where_clause: Option<WhereClause>,
    ) -> Result<ExecResult> {
        let table = self
            .catalog
            .get(table_name)
            .ok_or_else(|| DbError::TableNotFound(table_name.to_string()))?;
        for (field_name, _) in &assignments {
            let field = table
                .field(field_name)
                .ok_or_else(|| DbError::FieldNotFound(field_name.clone()))?;
            if field.primary {
                return Err(DbError::PrimaryKeyNotUpdatable);
            }
        }

        let candidates = collect_candidate_uids(&table, &where_clause)?;
        let mut affected = 0u64;
        for uid in candidates {
            let Some(pk) = self.pre_read_primary_key(xid, &table, uid)? else {
                continue;
            };
            if self.apply_update(xid, &table, uid, pk, &assignments, &where_clause)? {
                affected += 1;
            }
        }
        Ok(ExecResult::Ok {
            message: format!("{} row(s) updated", affected),
            affected_rows: affected,
            elapsed_ns: 0,
        })
    }

    /// Read a candidate's primary key value under the caller's snapshot,
    /// before taking the row lock. Used to relocate the row through the
    /// primary index if it's been moved by a concurrently committed UPDATE
    /// by the time `read_for_update` runs.
    fn pre_read_primary_key(&self, xid: u64, table: &Table, uid: u64) -> Result<Option<i64>> {
        let Some(body) = self.mvcc.read(xid, uid)? else {
            return Ok(None);
        };
        let row = decode_row(&table.fields, &body)?;
        let primary = table
            .primary_field()
            .ok_or_else(|| DbError::Internal("table has no primary key".into()))?;
        Ok(row.get(&primary.name).and_then(Value::as_i64_key))
    }

    /// Find the uid a primary key value currently lives at, skipping stale
    /// index entries left behind by prior relocations.
    fn relocate_by_primary_key(&self, xid: u64, table: &Table, key: i64) -> Result<Option<u64>> {
        let primary = table
            .primary_field()
            .ok_or_else(|| DbError::Internal("table has no primary key".into()))?;
        let tree = table
            .indexes
            .get(&primary.name)
            .ok_or_else(|| DbError::Internal("primary key is not indexed".into()))?;
        for candidate_uid in tree.find(key)? {
            if self.mvcc.read(xid, candidate_uid)?.is_some() {
                return Ok(Some(candidate_uid));
            }
        }
        Ok(None)
    }

    fn apply_update(
        &self,
        xid: u64,
        table: &Table,
        mut uid: u64,
        primary_key: i64,
        assignments: &[(String, Literal)],
        where_clause: &Option<WhereClause>,
    ) -> Result<bool> {
        const MAX_RELOCATE_RETRIES: u32 = 3;
        let mut body = None;
        for attempt in 0..=MAX_RELOCATE_RETRIES {
            if let Some(b) = self.mvcc.read_for_update(xid, uid)? {
                body = Some(b);
                break;
            }
            if attempt == MAX_RELOCATE_RETRIES {
                break;
            }
            match self.relocate_by_primary_key(xid, table, primary_key)? {
                Some(new_uid) => uid = new_uid,
                None => break,
            }
        }
        let Some(body) = body else {
            return Ok(false);
        };
        let mut row = decode_row(&table.fields, &body)?;
        if !eval_where(&row, where_clause) {
            return Ok(false);
        }

        let mut new_keys = Vec::new();
        for (field_name, lit) in assignments {
            let field = table.field(field_name).expect("checked in update()");
            let value = coerce_literal(field, lit)?;
            if field.unique {
                let key = value
                    .as_i64_key()
                    .ok_or_else(|| DbError::InvalidField(format!("{} must be an integer key", field.name)))?;
                new_keys.push((field.name.clone(), key));
            }
            row.insert(field_name.clone(), value);
        }

        let reserved = self.reserve_changed_keys(table, uid, &new_keys)?;
        let result = self.relocate_row(xid, table, uid, &row);
        self.release_reservations(table, &reserved);
        result.map(|()| true)
    }

    /// Reserve the keys an UPDATE is about to move a row into, closing the
    /// same race `reserve_unique_fields` closes for INSERT. The authoritative
    /// duplicate check still happens in `relocate_row` against the caller's
    /// own snapshot.
    fn reserve_changed_keys(
        &self,
        table: &Table,
        _current_uid: u64,
        new_keys: &[(String, i64)],
    ) -> Result<Vec<(String, i64)>> {
        let mut reserved = Vec::new();
        for (field, key) in new_keys {
            if let Err(e) = self.unique_guard.reserve(&table.name, field, *key) {
                self.release_reservations(table, &reserved);
                return Err(e);
            }
            reserved.push((field.clone(), *key));
        }
        Ok(reserved)
    }

    fn relocate_row(&self, xid: u64, table: &Table, old_uid: u64, row: &Row) -> Result<()> {
        for field in &table.fields {
            if let Some(tree) = table.indexes.get(&field.name) {
                let key = row.get(&field.name).and_then(Value::as_i64_key).unwrap();
                for candidate_uid in tree.find(key)? {
                    if candidate_uid != old_uid && self.mvcc.read(xid, candidate_uid)?.is_some() {
                        return Err(DbError::DuplicatedEntry);
                    }
                }
            }
        }

        self.mvcc.delete(xid, old_uid)?;
        let body = encode_row(&table.fields, row)?;
        let new_uid = self.mvcc.insert(xid, &body)?;
        for field in &table.fields {
            if let Some(tree) = table.indexes.get(&field.name) {
                let key = row.get(&field.name).and_then(Value::as_i64_key).unwrap();
                tree.insert(key, new_uid)?;
            }
        }
        Ok(())
    }

    pub(crate) fn delete(
        &self,
        xid: u64,
        table_name: &str,
        where_clause: Option<WhereClause>,
    ) -> Result<ExecResult> {
        let table = self
            .catalog
            .get(table_name)
            .ok_or_else(|| DbError::TableNotFound(table_name.to_string()))?;
        let candidates = collect_candidate_uids(&table, &where_clause)?;
        let mut affected = 0u64;
        for uid in candidates {
            let Some(body) = self.mvcc.read_for_update(xid, uid)? else {
                continue;
            };
            let row = decode_row(&table.fields, &body)?;
            if !eval_where(&row, &where_clause) {
                continue;
            }
            if self.mvcc.delete(xid, uid)? {
                affected += 1;
            }
        }
        Ok(ExecResult::Ok {
            message: format!("{} row(s) deleted", affected),
            affected_rows: affected,
            elapsed_ns: 0,
        })
    }
}
