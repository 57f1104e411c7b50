//! Per-connection session state: current database, current transaction,
//! and the auto-transaction wrapper around one-shot statements. (C12)
//!
//! Begin/Commit/Abort go straight to MVCC; Use/CreateDb/DropDb/Show go to
//! the registry; everything else runs through the executor, wrapped in an
//! implicit transaction when the session has no explicit one open.

use std::sync::Arc;

use crate::error::{DbError, Result};
use crate::executor::Executor;
use crate::mvcc::IsolationLevel;
use crate::parser::ast::Statement;
use crate::parser::Parser;
use crate::registry::{Database, Registry};
use crate::types::{ExecResult, Value};

pub struct Session {
    registry: Arc<Registry>,
    database: Option<Arc<Database>>,
    xid: u64,
}

impl Session {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            database: None,
            xid: 0,
        }
    }

    fn database(&self) -> Result<&Arc<Database>> {
        self.database.as_ref().ok_or(DbError::NoDatabaseSelected)
    }

    fn executor(&self) -> Result<Executor> {
        let db = self.database()?;
        Ok(Executor::new(
            Arc::clone(&db.catalog),
            Arc::clone(&db.mvcc),
            Arc::clone(&db.unique_guard),
        ))
    }

    /// Parse and run one statement, returning a structured result or error.
    pub fn handle(&mut self, sql: &str) -> Result<ExecResult> {
        let stmt = Parser::parse(sql)?;
        self.execute(stmt)
    }

    pub fn execute(&mut self, stmt: Statement) -> Result<ExecResult> {
        match stmt {
            Statement::Begin { isolation } => self.begin(isolation),
            Statement::Commit => self.commit(),
            Statement::Abort => self.abort(),
            Statement::UseDatabase(name) => self.use_database(&name),
            Statement::CreateDatabase(name) => {
                self.registry.create(&name)?;
                Ok(ExecResult::Ok {
                    message: format!("database {} created", name),
                    affected_rows: 0,
                    elapsed_ns: 0,
                })
            }
            Statement::DropDatabase(name) => {
                self.registry.drop_database(&name)?;
                Ok(ExecResult::Ok {
                    message: format!("database {} dropped", name),
                    affected_rows: 0,
                    elapsed_ns: 0,
                })
            }
            Statement::ShowDatabases => {
                let names = self.registry.show()?;
                let result_rows = names.len() as u64;
                Ok(ExecResult::Result {
                    columns: vec!["database".to_string()],
                    rows: names.into_iter().map(|n| vec![Value::String(n)]).collect(),
                    result_rows,
                    elapsed_ns: 0,
                })
            }
            other => self.run_through_executor(other),
        }
    }

    fn begin(&mut self, isolation: Option<String>) -> Result<ExecResult> {
        if self.xid != 0 {
            return Err(DbError::NestedTransaction);
        }
        let level = match isolation {
            Some(name) => IsolationLevel::from_name(&name)
                .ok_or_else(|| DbError::InvalidCommand(format!("unknown isolation level: {name}")))?,
            None => IsolationLevel::ReadCommitted,
        };
        let db = self.database()?;
        self.xid = db.mvcc.begin(level)?;
        Ok(ExecResult::Ok {
            message: "transaction started".to_string(),
            affected_rows: 0,
            elapsed_ns: 0,
        })
    }

    fn commit(&mut self) -> Result<ExecResult> {
        if self.xid == 0 {
            return Err(DbError::NoTransaction);
        }
        let xid = self.xid;
        self.xid = 0;
        self.database()?.mvcc.commit(xid)?;
        Ok(ExecResult::Ok {
            message: "transaction committed".to_string(),
            affected_rows: 0,
            elapsed_ns: 0,
        })
    }

    fn abort(&mut self) -> Result<ExecResult> {
        if self.xid == 0 {
            return Err(DbError::NoTransaction);
        }
        let xid = self.xid;
        self.xid = 0;
        // Best-effort: a poisoned transaction was already aborted internally
        // by MVCC, so re-asking it to abort just re-raises the stored error.
        let _ = self.database()?.mvcc.abort(xid);
        Ok(ExecResult::Ok {
            message: "transaction aborted".to_string(),
            affected_rows: 0,
            elapsed_ns: 0,
        })
    }

    fn use_database(&mut self, name: &str) -> Result<ExecResult> {
        if self.xid != 0 {
            return Err(DbError::SwitchDatabaseInTxn);
        }
        let db = self.registry.acquire(name)?;
        if let Some(old) = self.database.take() {
            self.registry.release(&old.name);
        }
        self.database = Some(db);
        Ok(ExecResult::Ok {
            message: format!("using database {}", name),
            affected_rows: 0,
            elapsed_ns: 0,
        })
    }

    fn run_through_executor(&mut self, stmt: Statement) -> Result<ExecResult> {
        let executor = self.executor()?;
        if self.xid != 0 {
            return executor.execute(self.xid, stmt);
        }
        let mvcc = Arc::clone(&self.database()?.mvcc);
        let xid = mvcc.begin(IsolationLevel::ReadCommitted)?;
        match executor.execute(xid, stmt) {
            Ok(result) => {
                mvcc.commit(xid)?;
                Ok(result)
            }
            Err(e) => {
                let _ = mvcc.abort(xid);
                Err(e)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(db) = &self.database {
            if self.xid != 0 {
                let _ = db.mvcc.abort(self.xid);
            }
            self.registry.release(&db.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn session() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            cache_capacity: 64,
            wal_buffer_size: 1 << 16,
            ..Config::default()
        };
        let registry = Arc::new(Registry::new(config).unwrap());
        (dir, Session::new(registry))
    }

    #[test]
    fn select_without_database_is_rejected() {
        let (_dir, mut session) = session();
        let err = session.handle("SELECT * FROM t").unwrap_err();
        assert!(matches!(err, DbError::NoDatabaseSelected));
    }

    #[test]
    fn create_database_use_and_query() {
        let (_dir, mut session) = session();
        session.handle("CREATE DATABASE shop").unwrap();
        session.handle("USE shop").unwrap();
        session
            .handle("CREATE TABLE t (id INT64 PRIMARY KEY, name STRING)")
            .unwrap();
        session.handle("INSERT INTO t VALUES (1, 'a')").unwrap();
        let result = session.handle("SELECT * FROM t").unwrap();
        match result {
            ExecResult::Result { result_rows, .. } => assert_eq!(result_rows, 1),
            other => panic!("expected Result, got {:?}", other),
        }
    }

    #[test]
    fn explicit_transaction_spans_statements() {
        let (_dir, mut session) = session();
        session.handle("CREATE DATABASE shop").unwrap();
        session.handle("USE shop").unwrap();
        session
            .handle("CREATE TABLE t (id INT64 PRIMARY KEY)")
            .unwrap();
        session.handle("BEGIN").unwrap();
        session.handle("INSERT INTO t VALUES (1)").unwrap();
        assert!(matches!(
            session.handle("BEGIN").unwrap_err(),
            DbError::NestedTransaction
        ));
        session.handle("COMMIT").unwrap();
        assert!(matches!(
            session.handle("COMMIT").unwrap_err(),
            DbError::NoTransaction
        ));
    }

    #[test]
    fn use_database_inside_transaction_rejected() {
        let (_dir, mut session) = session();
        session.handle("CREATE DATABASE a").unwrap();
        session.handle("CREATE DATABASE b").unwrap();
        session.handle("USE a").unwrap();
        session.handle("BEGIN").unwrap();
        assert!(matches!(
            session.handle("USE b").unwrap_err(),
            DbError::SwitchDatabaseInTxn
        ));
    }

    #[test]
    fn implicit_transaction_auto_aborts_on_error() {
        let (_dir, mut session) = session();
        session.handle("CREATE DATABASE shop").unwrap();
        session.handle("USE shop").unwrap();
        session
            .handle("CREATE TABLE t (id INT64 PRIMARY KEY)")
            .unwrap();
        assert!(session.handle("INSERT INTO t VALUES (1, 2)").is_err());
        // The failed implicit insert must not have left a dangling row.
        let result = session.handle("SELECT * FROM t").unwrap();
        match result {
            ExecResult::Result { result_rows, .. } => assert_eq!(result_rows, 0),
            other => panic!("expected Result, got {:?}", other),
        }
    }
}
