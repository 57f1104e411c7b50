//! Statement execution against the catalog and MVCC engine.
//!
//! `execute` is the single entry point: it dispatches on the parsed
//! statement, runs the DDL/DML/query handler, and patches `elapsed_ns` into
//! whatever `ExecResult` comes back so callers never have to thread timing
//! through every handler.

use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{Catalog, UniqueGuard};
use crate::error::Result;
use crate::mvcc::MvccEngine;
use crate::parser::ast::Statement;
use crate::types::ExecResult;

pub mod aggregation;
pub mod ddl;
pub mod dml;
pub mod evaluator;
pub mod query;

pub struct Executor {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) mvcc: Arc<MvccEngine>,
    pub(crate) unique_guard: Arc<UniqueGuard>,
}

impl Executor {
    pub fn new(catalog: Arc<Catalog>, mvcc: Arc<MvccEngine>, unique_guard: Arc<UniqueGuard>) -> Self {
        Self {
            catalog,
            mvcc,
            unique_guard,
        }
    }

    /// Execute one non-transaction-control statement under `xid`. Callers
    /// (the session layer) own BEGIN/COMMIT/ABORT and database selection.
    pub fn execute(&self, xid: u64, stmt: Statement) -> Result<ExecResult> {
        let start = Instant::now();
        let result = match stmt {
            Statement::CreateTable { name, fields } => self.create_table(&name, &fields),
            Statement::DropTable(name) => self.drop_table(&name),
            Statement::ShowTables => self.show_tables(),
            Statement::Describe(name) => self.describe(&name),
            Statement::Insert { table, columns, values } => self.insert(xid, &table, columns, values),
            Statement::Select(select) => self.select(xid, select),
            Statement::Update {
                table,
                assignments,
                where_clause,
            } => self.update(xid, &table, assignments, where_clause),
            Statement::Delete { table, where_clause } => self.delete(xid, &table, where_clause),
            Statement::Begin { .. }
            | Statement::Commit
            | Statement::Abort
            | Statement::UseDatabase(_)
            | Statement::CreateDatabase(_)
            | Statement::DropDatabase(_)
            | Statement::ShowDatabases => {
                return Err(crate::error::DbError::Internal(
                    "transaction/database statements are handled by the session layer".into(),
                ))
            }
        }?;

        let elapsed_ns = start.elapsed().as_nanos();
        Ok(match result {
            ExecResult::Ok {
                message,
                affected_rows,
                ..
            } => ExecResult::Ok {
                message,
                affected_rows,
                elapsed_ns,
            },
            ExecResult::Result {
                columns,
                rows,
                result_rows,
                ..
            } => ExecResult::Result {
                columns,
                rows,
                result_rows,
                elapsed_ns,
            },
        })
    }
}
