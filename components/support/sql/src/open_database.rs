/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Use this module to open a new SQLite database connection.
//!
//! Usage:
//!    - Define a struct that implements ConnectionInitializer. This handles:
//!      - Initializing the schema for a new database
//!      - Upgrading the schema for an existing database
//!      - Extra preparation/finishing steps, for example setting up pragmas
//!
//!    - Call open_database() in your database constructor:
//!      - If the database file is not present, open_database() will create a
//!        new DB and call prepare(), init(), then finish()
//!      - If the database file exists, open_database() will open it and call
//!        prepare(), upgrade_from() for each upgrade that needs to be
//!        applied, then finish().

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ConnectionInitializer {
    // Name to display in the logs.
    const NAME: &'static str;

    // The version that the last upgrade function upgrades to.
    const END_VERSION: u32;

    // Runs immediately after the connection is opened, before the schema
    // init/upgrade transaction. Pragmas live here.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    // Initialize a newly created database to END_VERSION.
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    // Upgrade schema from version -> version + 1.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    // Runs after the init/upgrade transaction commits.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(initializer: &CI) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    init_connection(&mut conn, true, initializer)?;
    Ok(conn)
}

pub fn open_database_with_flags<CI: ConnectionInitializer>(
    path: impl AsRef<Path>,
    open_flags: OpenFlags,
    initializer: &CI,
) -> Result<Connection> {
    let db_empty = !path.as_ref().exists();
    let mut conn = Connection::open_with_flags(path, open_flags)?;
    init_connection(&mut conn, db_empty, initializer)?;
    Ok(conn)
}

fn init_connection<CI: ConnectionInitializer>(
    conn: &mut Connection,
    db_empty: bool,
    initializer: &CI,
) -> Result<()> {
    log::debug!("{}: opening database", CI::NAME);
    initializer.prepare(conn, db_empty)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current_version = get_schema_version(&tx)?;
    if db_empty || current_version == 0 {
        log::debug!("{}: initializing new database", CI::NAME);
        initializer.init(&tx)?;
    } else if current_version > CI::END_VERSION {
        return Err(Error::IncompatibleVersion(current_version));
    } else {
        let mut version = current_version;
        while version < CI::END_VERSION {
            log::debug!("{}: upgrading database to {}", CI::NAME, version + 1);
            initializer.upgrade_from(&tx, version)?;
            version += 1;
        }
    }
    set_schema_version(&tx, CI::END_VERSION)?;
    tx.commit()?;

    initializer.finish(conn)?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct TestInitializer {
        calls: RefCell<Vec<&'static str>>,
    }

    impl ConnectionInitializer for TestInitializer {
        const NAME: &'static str = "test db";
        const END_VERSION: u32 = 2;

        fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
            self.calls.borrow_mut().push("prepare");
            Ok(())
        }

        fn init(&self, tx: &Transaction<'_>) -> Result<()> {
            self.calls.borrow_mut().push("init");
            tx.execute_batch("CREATE TABLE my_table(col TEXT)")?;
            Ok(())
        }

        fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()> {
            match version {
                1 => {
                    self.calls.borrow_mut().push("upgrade_from_v1");
                    tx.execute_batch("ALTER TABLE old_table RENAME TO my_table")?;
                    Ok(())
                }
                _ => panic!("unexpected version: {}", version),
            }
        }
    }

    #[test]
    fn test_init_fresh() {
        let init = TestInitializer::default();
        let conn = open_memory_database(&init).unwrap();
        assert_eq!(*init.calls.borrow(), vec!["prepare", "init"]);
        let version: u32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE old_table(col TEXT)")
                .unwrap();
            conn.pragma_update(None, "user_version", 1).unwrap();
        }
        let init = TestInitializer::default();
        let conn = open_database(&path, &init).unwrap();
        assert_eq!(*init.calls.borrow(), vec!["prepare", "upgrade_from_v1"]);
        conn.execute("INSERT INTO my_table(col) VALUES ('x')", [])
            .unwrap();
    }

    #[test]
    fn test_version_too_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        let init = TestInitializer::default();
        assert!(matches!(
            open_database(&path, &init),
            Err(Error::IncompatibleVersion(99))
        ));
    }
}
