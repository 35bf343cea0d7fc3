/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The persisted `crr_*` schema.
//!
//! The change log is the authoritative store; user tables are a
//! materialization of it. Note `value` columns are declared without a type:
//! that gives them BLOB affinity, so SQLite stores whatever the application
//! wrote without coercing (a fractional key like '104' must stay text).

use crate::clock::Hlc;
use rusqlite::{Connection, Transaction};
use sql_support::open_database::{
    ConnectionInitializer, Error as MigrationError, Result as MigrationResult,
};
use sql_support::ConnExt;

const CREATE_CHANGES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_changes (
        type        TEXT NOT NULL CHECK (type IN ('insert', 'update', 'delete')),
        tbl         TEXT NOT NULL,
        col         TEXT NOT NULL,
        pk          TEXT NOT NULL,
        value,
        site_id     TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        applied_at  INTEGER NOT NULL,
        version     TEXT NOT NULL DEFAULT '0',
        document    TEXT NOT NULL,
        PRIMARY KEY (type, tbl, col, pk, version)
    )";

// The apply engine range-scans per table in clock order; this index is what
// keeps those scans from walking the whole log.
const CREATE_CHANGES_INDEX_SQL: &str = "
    CREATE INDEX IF NOT EXISTS crr_changes_scan_index
    ON crr_changes (tbl, created_at, version, document)";

const CREATE_COLUMNS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_columns (
        tbl             TEXT NOT NULL,
        col             TEXT NOT NULL,
        type            TEXT NOT NULL DEFAULT 'lww'
                        CHECK (type IN ('lww', 'fractional_index')),
        fk_tbl          TEXT,
        fk_col          TEXT,
        fk_on_delete    TEXT,
        parent_col      TEXT,
        replicate       INTEGER NOT NULL DEFAULT 1,
        manual_conflict INTEGER NOT NULL DEFAULT 0,
        pk_ordinal      INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tbl, col)
    )";

const CREATE_CLIENTS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_clients (
        site_id       TEXT PRIMARY KEY,
        is_local      INTEGER NOT NULL DEFAULT 0,
        first_seen_at INTEGER NOT NULL,
        last_seen_at  INTEGER NOT NULL
    ) WITHOUT ROWID";

// Session state for the triggers: exactly one row. It's a real table rather
// than process memory so trigger bodies can read it with a subquery.
const CREATE_TEMP_STATE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_temp (
        id              INTEGER PRIMARY KEY CHECK (id = 0),
        clock           TEXT NOT NULL,
        time_travelling INTEGER NOT NULL DEFAULT 0,
        document        TEXT NOT NULL DEFAULT 'main'
    )";

const CREATE_COMMITS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_commits (
        id         TEXT PRIMARY KEY,
        document   TEXT NOT NULL,
        parent     TEXT,
        message    TEXT NOT NULL,
        author     TEXT NOT NULL,
        created_at TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    )";

const CREATE_COMMITS_INDEX_SQL: &str = "
    CREATE INDEX IF NOT EXISTS crr_commits_document_index
    ON crr_commits (document, created_at)";

const CREATE_DOCUMENTS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_documents (
        id                 TEXT PRIMARY KEY,
        head               TEXT,
        last_pulled_at     INTEGER,
        last_pulled_commit TEXT,
        last_pushed_commit TEXT,
        last_pushed_at     INTEGER
    )";

const CREATE_CONFLICTS_SQL: &str = "
    CREATE TABLE IF NOT EXISTS crr_conflicts (
        document TEXT NOT NULL,
        tbl      TEXT NOT NULL,
        pk       TEXT NOT NULL,
        columns  TEXT NOT NULL,
        base     TEXT,
        ours     TEXT,
        theirs   TEXT,
        PRIMARY KEY (document, tbl, pk)
    )";

pub(crate) struct CrrConnectionInitializer;

impl ConnectionInitializer for CrrConnectionInitializer {
    const NAME: &'static str = "crr storage db";
    const END_VERSION: u32 = 1;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> MigrationResult<()> {
        let initial_pragmas = "
            -- We don't care about temp tables being persisted to disk.
            PRAGMA temp_store = 2;
            -- we unconditionally want write-ahead-logging mode.
            PRAGMA journal_mode = WAL;
            -- cascading deletes are driven by the real constraints.
            PRAGMA foreign_keys = ON;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, db: &Transaction<'_>) -> MigrationResult<()> {
        log::debug!("Creating schemas");
        create_schema(db)?;
        Ok(())
    }

    fn upgrade_from(&self, _db: &Transaction<'_>, version: u32) -> MigrationResult<()> {
        Err(MigrationError::IncompatibleVersion(version))
    }
}

pub(crate) fn create_schema(db: &Connection) -> MigrationResult<()> {
    db.execute_all(&[
        CREATE_CHANGES_SQL,
        CREATE_CHANGES_INDEX_SQL,
        CREATE_COLUMNS_SQL,
        CREATE_CLIENTS_SQL,
        CREATE_TEMP_STATE_SQL,
        CREATE_COMMITS_SQL,
        CREATE_COMMITS_INDEX_SQL,
        CREATE_DOCUMENTS_SQL,
        CREATE_CONFLICTS_SQL,
    ])?;
    db.execute(
        "INSERT OR IGNORE INTO crr_temp (id, clock, time_travelling) VALUES (0, ?1, 0)",
        [Hlc::new()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_support::open_database::open_memory_database;

    #[test]
    fn test_create_schema_twice() {
        let conn = open_memory_database(&CrrConnectionInitializer).unwrap();
        create_schema(&conn).expect("should allow running twice");
    }

    #[test]
    fn test_temp_state_seeded() {
        let conn = open_memory_database(&CrrConnectionInitializer).unwrap();
        let clock: String = conn
            .query_row("SELECT clock FROM crr_temp WHERE id = 0", [], |r| r.get(0))
            .unwrap();
        assert!(clock.parse::<crate::clock::Hlc>().is_ok());
        let tt: i64 = conn
            .query_row("SELECT time_travelling FROM crr_temp", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tt, 0);
    }
}
