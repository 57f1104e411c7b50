//! End-to-end scenarios against the public Session/Registry surface: one
//! insert/select round trip, aggregation with HAVING, unique-field conflict
//! rejection, a genuine cross-lock deadlock, crash recovery across a
//! registry reopen, and repeatable-read snapshot isolation.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use minikvdb::config::Config;
use minikvdb::error::DbError;
use minikvdb::registry::Registry;
use minikvdb::session::Session;
use minikvdb::types::{ExecResult, Value};

fn fresh_registry() -> (tempfile::TempDir, Config, Arc<Registry>) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        cache_capacity: 64,
        wal_buffer_size: 1 << 16,
        ..Config::default()
    };
    let registry = Arc::new(Registry::new(config.clone()).unwrap());
    (dir, config, registry)
}

fn result_rows(result: ExecResult) -> u64 {
    match result {
        ExecResult::Result { result_rows, .. } => result_rows,
        other => panic!("expected a Result frame, got {:?}", other),
    }
}

#[test]
fn single_row_insert_and_select() {
    let (_dir, _config, registry) = fresh_registry();
    let mut session = Session::new(Arc::clone(&registry));

    session.handle("CREATE DATABASE shop").unwrap();
    session.handle("USE shop").unwrap();
    session
        .handle("CREATE TABLE customers (id INT64 PRIMARY KEY, name STRING)")
        .unwrap();
    session
        .handle("INSERT INTO customers VALUES (1, 'ada')")
        .unwrap();

    let result = session.handle("SELECT * FROM customers").unwrap();
    match result {
        ExecResult::Result { columns, rows, result_rows, .. } => {
            assert_eq!(result_rows, 1);
            assert_eq!(columns, vec!["id", "name"]);
            assert_eq!(rows[0], vec![Value::Int64(1), Value::String("ada".to_string())]);
        }
        other => panic!("expected Result, got {:?}", other),
    }
}

#[test]
fn aggregation_with_group_by_and_having() {
    let (_dir, _config, registry) = fresh_registry();
    let mut session = Session::new(registry);

    session.handle("CREATE DATABASE sales").unwrap();
    session.handle("USE sales").unwrap();
    session
        .handle("CREATE TABLE orders (id INT64 PRIMARY KEY, region STRING, amount INT64)")
        .unwrap();
    session.handle("INSERT INTO orders VALUES (1, 'east', 10)").unwrap();
    session.handle("INSERT INTO orders VALUES (2, 'east', 10)").unwrap();
    session.handle("INSERT INTO orders VALUES (3, 'west', 5)").unwrap();

    let result = session
        .handle("SELECT region, SUM(amount) FROM orders GROUP BY region HAVING SUM(amount) > 15")
        .unwrap();
    match result {
        ExecResult::Result { rows, result_rows, .. } => {
            assert_eq!(result_rows, 1);
            assert_eq!(rows[0][0], Value::String("east".to_string()));
            assert_eq!(rows[0][1], Value::Int64(20));
        }
        other => panic!("expected Result, got {:?}", other),
    }
}

#[test]
fn unique_field_conflict_is_rejected() {
    let (_dir, _config, registry) = fresh_registry();
    let mut session = Session::new(registry);

    session.handle("CREATE DATABASE shop").unwrap();
    session.handle("USE shop").unwrap();
    session
        .handle("CREATE TABLE users (id INT64 PRIMARY KEY, badge INT64 UNIQUE)")
        .unwrap();
    session.handle("INSERT INTO users VALUES (1, 100)").unwrap();

    let err = session.handle("INSERT INTO users VALUES (2, 100)").unwrap_err();
    assert!(matches!(err, DbError::DuplicatedEntry));

    // The rejected insert must not have left a dangling row behind.
    let result = session.handle("SELECT * FROM users").unwrap();
    assert_eq!(result_rows(result), 1);
}

#[test]
fn update_into_duplicate_unique_value_is_rejected() {
    let (_dir, _config, registry) = fresh_registry();
    let mut session = Session::new(registry);

    session.handle("CREATE DATABASE shop").unwrap();
    session.handle("USE shop").unwrap();
    session
        .handle("CREATE TABLE users (id INT64 PRIMARY KEY, badge INT64 UNIQUE)")
        .unwrap();
    session.handle("INSERT INTO users VALUES (1, 100)").unwrap();
    session.handle("INSERT INTO users VALUES (2, 200)").unwrap();

    let err = session
        .handle("UPDATE users SET badge = 100 WHERE id = 2")
        .unwrap_err();
    assert!(matches!(err, DbError::DuplicatedEntry));
}

#[test]
fn update_on_primary_key_is_rejected() {
    let (_dir, _config, registry) = fresh_registry();
    let mut session = Session::new(registry);

    session.handle("CREATE DATABASE shop").unwrap();
    session.handle("USE shop").unwrap();
    session
        .handle("CREATE TABLE t (id INT64 PRIMARY KEY, value INT64)")
        .unwrap();
    session.handle("INSERT INTO t VALUES (1, 100)").unwrap();

    let err = session.handle("UPDATE t SET id = 2 WHERE id = 1").unwrap_err();
    assert!(matches!(err, DbError::PrimaryKeyNotUpdatable));
}

/// Two transactions lock two rows in opposite order. One of them must come
/// back with a deadlock error instead of both blocking forever; the other
/// must be free to commit.
#[test]
fn crossed_locks_report_a_deadlock() {
    let (_dir, _config, registry) = fresh_registry();
    let mut setup = Session::new(Arc::clone(&registry));
    setup.handle("CREATE DATABASE shop").unwrap();
    setup.handle("USE shop").unwrap();
    setup
        .handle("CREATE TABLE t (id INT64 PRIMARY KEY, value INT64)")
        .unwrap();
    setup.handle("INSERT INTO t VALUES (1, 0)").unwrap();
    setup.handle("INSERT INTO t VALUES (2, 0)").unwrap();
    drop(setup);

    let registry_a = Arc::clone(&registry);
    let t1 = thread::spawn(move || {
        let mut session = Session::new(registry_a);
        session.handle("USE shop").unwrap();
        session.handle("BEGIN").unwrap();
        session.handle("UPDATE t SET value = 1 WHERE id = 1").unwrap();
        thread::sleep(Duration::from_millis(100));
        let outcome = session.handle("UPDATE t SET value = 1 WHERE id = 2");
        if outcome.is_ok() {
            session.handle("COMMIT").unwrap();
        }
        outcome
    });

    let registry_b = Arc::clone(&registry);
    let t2 = thread::spawn(move || {
        let mut session = Session::new(registry_b);
        session.handle("USE shop").unwrap();
        session.handle("BEGIN").unwrap();
        session.handle("UPDATE t SET value = 2 WHERE id = 2").unwrap();
        thread::sleep(Duration::from_millis(100));
        let outcome = session.handle("UPDATE t SET value = 2 WHERE id = 1");
        if outcome.is_ok() {
            session.handle("COMMIT").unwrap();
        }
        outcome
    });

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    // Exactly one side should have hit the cycle; the other proceeds.
    let deadlocks = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, Err(DbError::Deadlock)))
        .count();
    assert_eq!(deadlocks, 1, "r1={:?} r2={:?}", r1, r2);
    assert!(r1.is_ok() || r2.is_ok());
}

#[test]
fn uncommitted_transaction_is_rolled_back_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        cache_capacity: 64,
        wal_buffer_size: 1 << 16,
        ..Config::default()
    };
    let registry = Arc::new(Registry::new(config.clone()).unwrap());

    {
        let mut session = Session::new(Arc::clone(&registry));
        session.handle("CREATE DATABASE shop").unwrap();
        session.handle("USE shop").unwrap();
        session
            .handle("CREATE TABLE t (id INT64 PRIMARY KEY, value INT64)")
            .unwrap();
        session.handle("INSERT INTO t VALUES (1, 1)").unwrap();
        session.handle("BEGIN").unwrap();
        session.handle("INSERT INTO t VALUES (2, 2)").unwrap();
        // Session drops here without a COMMIT, so the open transaction never
        // reaches the WAL as committed. Reopening the registry on the same
        // files must not see row 2.
    }
    drop(registry);

    let registry = Arc::new(Registry::new(config).unwrap());
    let mut session = Session::new(registry);
    session.handle("USE shop").unwrap();
    let result = session.handle("SELECT * FROM t").unwrap();
    assert_eq!(result_rows(result), 1);
}

fn read_value(result: ExecResult) -> Value {
    match result {
        ExecResult::Result { rows, .. } => rows[0][0].clone(),
        other => panic!("expected Result, got {:?}", other),
    }
}

#[test]
fn repeatable_read_sees_a_consistent_snapshot() {
    let (_dir, _config, registry) = fresh_registry();
    let mut setup = Session::new(Arc::clone(&registry));
    setup.handle("CREATE DATABASE shop").unwrap();
    setup.handle("USE shop").unwrap();
    setup
        .handle("CREATE TABLE t (id INT64 PRIMARY KEY, value INT64)")
        .unwrap();
    setup.handle("INSERT INTO t VALUES (1, 100)").unwrap();
    drop(setup);

    let mut reader = Session::new(Arc::clone(&registry));
    reader.handle("USE shop").unwrap();
    reader.handle("BEGIN REPEATABLE READ").unwrap();
    let before = read_value(reader.handle("SELECT value FROM t WHERE id = 1").unwrap());
    assert_eq!(before, Value::Int64(100));

    let mut writer = Session::new(Arc::clone(&registry));
    writer.handle("USE shop").unwrap();
    writer.handle("UPDATE t SET value = 999 WHERE id = 1").unwrap();

    let still = read_value(reader.handle("SELECT value FROM t WHERE id = 1").unwrap());
    assert_eq!(still, before, "repeatable read must not observe the concurrent commit");
    reader.handle("COMMIT").unwrap();

    let mut checker = Session::new(registry);
    checker.handle("USE shop").unwrap();
    let after = read_value(checker.handle("SELECT value FROM t WHERE id = 1").unwrap());
    assert_eq!(after, Value::Int64(999));
}
