/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Use this module to open a new SQLite database connection.
///
/// Usage:
///    - Define a struct that implements ConnectionInitializer. This handles:
///      - Initializing the schema for a new database
///      - Upgrading the schema for an existing database
///      - Extra preparation/finishing steps, for example setting up SQLite
///        functions
///
///    - Call open_database() in your database constructor:
///      - The first method called is `prepare()`, which is used for
///        executing pragmas that must happen outside a transaction.
///      - If the database file is not present, open_database() will create a
///        new DB and call init(), then finish().
///      - If the database file exists, open_database() will open it and
///        call upgrade_from() for each upgrade it needs to apply, then
///        finish().
use crate::ConnExt;
use rusqlite::{Connection, Error as RusqliteError, ErrorCode, OpenFlags, Transaction};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl Error {
    /// Returns true when the underlying SQLite failure indicates the file is
    /// not a usable database; open_database() reacts by recreating the file.
    pub fn is_corruption_error(&self) -> bool {
        match self {
            Error::SqlError(RusqliteError::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ConnectionInitializer {
    // Name to display in the logs.
    const NAME: &'static str;

    // The version that the last upgrade function upgrades to.
    const END_VERSION: u32;

    // Functions called only for brand new databases.
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    // Functions called for existing databases.  `version` is the current
    // user_version; the implementation must upgrade the schema to
    // `version + 1`.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    // Runs immediately after the connection is opened, outside the
    // init/upgrade transaction.  This is the place for pragmas.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    // Runs after the init/upgrade transaction commits.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    connection_initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), connection_initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(
    connection_initializer: &CI,
) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    init_connection(&mut conn, connection_initializer)?;
    Ok(conn)
}

pub fn open_database_with_flags<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    open_flags: OpenFlags,
    connection_initializer: &CI,
) -> Result<Connection> {
    let path = path.as_ref();
    let mut conn = Connection::open_with_flags(path, open_flags)?;
    match init_connection(&mut conn, connection_initializer) {
        Ok(()) => Ok(conn),
        Err(e) if e.is_corruption_error() => {
            // The database file is beyond repair.  Drop it on the floor and
            // start over rather than failing to open forever.
            log::warn!("{}: corrupt database, recreating: {}", CI::NAME, e);
            drop(conn);
            std::fs::remove_file(path)?;
            let mut conn = Connection::open_with_flags(path, open_flags)?;
            init_connection(&mut conn, connection_initializer)?;
            Ok(conn)
        }
        Err(e) => Err(e),
    }
}

fn init_connection<CI: ConnectionInitializer>(
    conn: &mut Connection,
    connection_initializer: &CI,
) -> Result<()> {
    log::debug!("{}: opening database", CI::NAME);
    let db_empty = is_db_empty(conn)?;
    connection_initializer.prepare(conn, db_empty)?;
    let tx = conn.transaction()?;
    if db_empty {
        log::debug!("{}: initializing new database", CI::NAME);
        connection_initializer.init(&tx)?;
    } else {
        let mut current_version = get_schema_version(&tx)?;
        if current_version > CI::END_VERSION {
            return Err(Error::IncompatibleVersion(current_version));
        }
        while current_version < CI::END_VERSION {
            log::debug!(
                "{}: upgrading database to {}",
                CI::NAME,
                current_version + 1
            );
            connection_initializer.upgrade_from(&tx, current_version)?;
            current_version += 1;
        }
    }
    set_schema_version(&tx, CI::END_VERSION)?;
    tx.commit()?;
    connection_initializer.finish(conn)?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(())
}

fn is_db_empty(conn: &Connection) -> Result<bool> {
    Ok(conn.query_one::<u32>("SELECT COUNT(*) FROM sqlite_master")? == 0)
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row_and_then("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.set_pragma("user_version", version)?;
    Ok(())
}

// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod test_utils {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Database file that we can programmatically run upgrades on.
    ///
    /// We purposefully don't keep a connection to the database around to
    /// force upgrades to always run against a newly opened DB, like they
    /// would in the real world.
    pub struct MigratedDatabaseFile<CI: ConnectionInitializer> {
        // Keep around a TempDir to ensure the database file stays around
        // until this struct is dropped.
        _tempdir: TempDir,
        pub connection_initializer: CI,
        pub path: PathBuf,
    }

    impl<CI: ConnectionInitializer> MigratedDatabaseFile<CI> {
        pub fn new(connection_initializer: CI, init_sql: &str) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join("db.sql");
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(init_sql).unwrap();
            Self {
                _tempdir: tempdir,
                connection_initializer,
                path,
            }
        }

        /// Upgrade the schema to a specific version, running one
        /// `upgrade_from` at a time.
        pub fn upgrade_to(&self, version: u32) {
            let mut conn = self.open();
            let tx = conn.transaction().unwrap();
            let mut current_version = get_schema_version(&tx).unwrap();
            while current_version < version {
                self.connection_initializer
                    .upgrade_from(&tx, current_version)
                    .unwrap();
                current_version += 1;
            }
            set_schema_version(&tx, current_version).unwrap();
            tx.commit().unwrap();
        }

        pub fn run_all_upgrades(&self) {
            let current_version = get_schema_version(&self.open()).unwrap();
            for version in current_version..CI::END_VERSION {
                self.upgrade_to(version + 1);
            }
        }

        pub fn open(&self) -> Connection {
            Connection::open(&self.path).unwrap()
        }
    }
}
