/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! `CrrDb` owns the SQLite connection and the session state the triggers
//! read: the persisted hybrid logical clock, the active document, and the
//! `time_travelling` flag the apply engine uses to silence the triggers
//! while it replays foreign history.

use crate::changes;
use crate::clock::Hlc;
use crate::error::Result;
use crate::events::{Events, TableChange};
use crate::fractindex;
use crate::pk;
use crate::registry::{self, Registry, TableOptions};
use crate::schema::CrrConnectionInitializer;
use crate::triggers;
use crate::types::{random_id, SqlValue, Timestamp};
use rusqlite::{named_params, Connection};
use serde_derive::{Deserialize, Serialize};
use sql_support::open_database::{open_database, open_memory_database};
use sql_support::ConnExt;
use std::path::Path;

/// The document used when the application doesn't partition its data.
pub const DEFAULT_DOCUMENT: &str = "main";

pub struct CrrDb {
    conn: Connection,
    events: Events,
}

impl CrrDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(path, &CrrConnectionInitializer)?;
        Self::finish_open(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = open_memory_database(&CrrConnectionInitializer)?;
        Self::finish_open(conn)
    }

    fn finish_open(conn: Connection) -> Result<Self> {
        ensure_local_client(&conn)?;
        Ok(CrrDb {
            conn,
            events: Events::new(),
        })
    }

    /// The raw connection. Reads are fine; writes to replicated tables
    /// should go through [`CrrDb::exec_track_changes`] or they won't be
    /// captured... which is occasionally what you want (tests, tooling).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// This replica's persistent identity.
    pub fn site_id(&self) -> Result<String> {
        session::local_site(&self.conn)
    }

    pub fn upgrade_table(&self, table: &str, opts: &TableOptions<'_>) -> Result<()> {
        registry::upgrade_table(&self.conn, table, opts)
    }

    pub fn upgrade_column_to_fractional_index(
        &self,
        table: &str,
        column: &str,
        parent_column: &str,
    ) -> Result<()> {
        registry::upgrade_column_to_fractional_index(&self.conn, table, column, parent_column)
    }

    /// Install (or reinstall) the change-capture triggers. Call once after
    /// the last `upgrade_*`.
    pub fn finalize(&self) -> Result<()> {
        triggers::finalize(&self.conn)
    }

    /// The application's write entry point: run one SQL statement with
    /// change tracking against `document`.
    ///
    /// The session clock ticks once for the whole statement, so every
    /// column change it produces shares one `created_at`; placeholder
    /// fractional positions (`|append` & friends) are resolved before the
    /// transaction commits.
    pub fn exec_track_changes(
        &self,
        sql: &str,
        params: &[SqlValue],
        document: &str,
    ) -> Result<usize> {
        let registry = Registry::load(&self.conn)?;
        let tx = self.conn.unchecked_transaction_exclusive()?;
        ensure_document(&tx, document)?;
        session::set_document(&tx, document)?;
        let clock = session::send_clock(&tx)?;
        let affected = tx.execute(sql, rusqlite::params_from_iter(params))?;
        fractindex::assign_placeholder_positions(&tx, &registry, document, clock)?;
        let tables = changes::statement_tables(&tx, document, clock)?;
        tx.commit()?;
        if !tables.is_empty() {
            self.events.notify(&TableChange {
                document: document.to_string(),
                tables,
            });
        }
        Ok(affected)
    }

    pub fn document(&self, id: &str) -> Result<Option<Document>> {
        get_document(&self.conn, id)
    }

    pub fn documents(&self) -> Result<Vec<Document>> {
        self.conn.query_rows_and_then_cached(
            &format!("{} ORDER BY id", SELECT_DOCUMENTS),
            [],
            Document::from_row,
        )
    }

    /// Remove every trace of a document: its changes, commits, conflicts,
    /// bookkeeping, and the rows it materialized.
    pub fn erase_document(&self, document: &str) -> Result<()> {
        let registry = Registry::load(&self.conn)?;
        let tx = self.conn.unchecked_transaction_exclusive()?;
        session::set_time_travelling(&tx, true)?;
        let mut tables = Vec::new();
        for table in registry.tables() {
            let sql = format!(
                "DELETE FROM {tbl} WHERE {pk} IN
                     (SELECT DISTINCT pk FROM crr_changes
                      WHERE tbl = :tbl AND document = :document)",
                tbl = pk::ident(&table.name),
                pk = pk::expr(table, None),
            );
            let n = tx.execute_cached(
                &sql,
                named_params! { ":tbl": table.name, ":document": document },
            )?;
            if n > 0 {
                tables.push(table.name.clone());
            }
        }
        tx.execute_cached(
            "DELETE FROM crr_changes WHERE document = ?1",
            [document],
        )?;
        tx.execute_cached(
            "DELETE FROM crr_commits WHERE document = ?1",
            [document],
        )?;
        tx.execute_cached(
            "DELETE FROM crr_conflicts WHERE document = ?1",
            [document],
        )?;
        tx.execute_cached("DELETE FROM crr_documents WHERE id = ?1", [document])?;
        session::set_time_travelling(&tx, false)?;
        tx.commit()?;
        if !tables.is_empty() {
            self.events.notify(&TableChange {
                document: document.to_string(),
                tables,
            });
        }
        Ok(())
    }

    pub(crate) fn notify_tables(&self, document: &str, tables: Vec<String>) {
        if !tables.is_empty() {
            self.events.notify(&TableChange {
                document: document.to_string(),
                tables,
            });
        }
    }
}

/// Per-document replication bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    /// Latest commit, if any history exists.
    pub head: Option<String>,
    pub last_pulled_at: Option<Timestamp>,
    pub last_pulled_commit: Option<String>,
    pub last_pushed_commit: Option<String>,
    pub last_pushed_at: Option<Timestamp>,
}

const SELECT_DOCUMENTS: &str =
    "SELECT id, head, last_pulled_at, last_pulled_commit, last_pushed_commit, last_pushed_at
     FROM crr_documents";

impl Document {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Document> {
        Ok(Document {
            id: row.get("id")?,
            head: row.get("head")?,
            last_pulled_at: row.get("last_pulled_at")?,
            last_pulled_commit: row.get("last_pulled_commit")?,
            last_pushed_commit: row.get("last_pushed_commit")?,
            last_pushed_at: row.get("last_pushed_at")?,
        })
    }
}

pub(crate) fn ensure_document(conn: &Connection, id: &str) -> Result<()> {
    conn.execute_cached(
        "INSERT OR IGNORE INTO crr_documents (id) VALUES (?1)",
        [id],
    )?;
    Ok(())
}

pub(crate) fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>> {
    conn.try_query_row(
        &format!("{} WHERE id = ?1", SELECT_DOCUMENTS),
        [id],
        Document::from_row,
        true,
    )
}

pub(crate) fn head(conn: &Connection, document: &str) -> Result<Option<String>> {
    conn.try_query_one(
        "SELECT head FROM crr_documents WHERE id = ?1",
        [document],
        true,
    )
    .map_err(Into::into)
}

pub(crate) fn set_head(conn: &Connection, document: &str, head: Option<&str>) -> Result<()> {
    ensure_document(conn, document)?;
    conn.execute_cached(
        "UPDATE crr_documents SET head = :head WHERE id = :id",
        named_params! { ":head": head, ":id": document },
    )?;
    Ok(())
}

pub(crate) fn record_pull(
    conn: &Connection,
    document: &str,
    commit_id: Option<&str>,
    at: Timestamp,
) -> Result<()> {
    ensure_document(conn, document)?;
    conn.execute_cached(
        "UPDATE crr_documents
         SET last_pulled_at = :at,
             last_pulled_commit = COALESCE(:commit, last_pulled_commit)
         WHERE id = :id",
        named_params! { ":at": at, ":commit": commit_id, ":id": document },
    )?;
    Ok(())
}

pub(crate) fn record_push(
    conn: &Connection,
    document: &str,
    commit_id: Option<&str>,
    at: Timestamp,
) -> Result<()> {
    ensure_document(conn, document)?;
    conn.execute_cached(
        "UPDATE crr_documents
         SET last_pushed_at = :at,
             last_pushed_commit = COALESCE(:commit, last_pushed_commit)
         WHERE id = :id",
        named_params! { ":at": at, ":commit": commit_id, ":id": document },
    )?;
    Ok(())
}

fn ensure_local_client(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn.try_query_one(
        "SELECT site_id FROM crr_clients WHERE is_local = 1",
        [],
        true,
    )?;
    if existing.is_none() {
        let site = random_id();
        let now = Timestamp::now();
        conn.execute_cached(
            "INSERT INTO crr_clients (site_id, is_local, first_seen_at, last_seen_at)
             VALUES (:site, 1, :now, :now)",
            named_params! { ":site": site, ":now": now },
        )?;
        log::info!("assigned site id {}", site);
    }
    Ok(())
}

/// The single-row session state in `crr_temp`. Everything here must be read
/// and written through the connection so triggers observe it mid-statement.
pub(crate) mod session {
    use super::*;

    pub fn local_site(conn: &Connection) -> Result<String> {
        Ok(conn.query_one("SELECT site_id FROM crr_clients WHERE is_local = 1")?)
    }

    pub fn get_clock(conn: &Connection) -> Result<Hlc> {
        Ok(conn.query_one("SELECT clock FROM crr_temp WHERE id = 0")?)
    }

    pub fn put_clock(conn: &Connection, clock: Hlc) -> Result<()> {
        conn.execute_cached("UPDATE crr_temp SET clock = ?1 WHERE id = 0", [clock])?;
        Ok(())
    }

    /// Tick the clock for a local event and persist it.
    pub fn send_clock(conn: &Connection) -> Result<Hlc> {
        let clock = get_clock(conn)?.send();
        put_clock(conn, clock)?;
        Ok(clock)
    }

    /// Merge an observed foreign clock and persist the result.
    pub fn receive_clock(conn: &Connection, observed: Hlc) -> Result<Hlc> {
        let clock = get_clock(conn)?.receive(observed);
        put_clock(conn, clock)?;
        Ok(clock)
    }

    pub fn set_time_travelling(conn: &Connection, on: bool) -> Result<()> {
        conn.execute_cached(
            "UPDATE crr_temp SET time_travelling = ?1 WHERE id = 0",
            [on],
        )?;
        Ok(())
    }

    pub fn set_document(conn: &Connection, document: &str) -> Result<()> {
        conn.execute_cached("UPDATE crr_temp SET document = ?1 WHERE id = 0", [document])?;
        Ok(())
    }

    pub fn document(conn: &Connection) -> Result<String> {
        Ok(conn.query_one("SELECT document FROM crr_temp WHERE id = 0")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn new_todo_db() -> CrrDb {
        let _ = env_logger::try_init();
        let db = CrrDb::open_in_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, finished INTEGER);",
            )
            .unwrap();
        db.upgrade_table("todos", &TableOptions::default()).unwrap();
        db.finalize().unwrap();
        db
    }

    #[test]
    fn test_site_id_stable() {
        let db = new_todo_db();
        let site = db.site_id().unwrap();
        assert_eq!(site.len(), 12);
        assert_eq!(db.site_id().unwrap(), site);
    }

    #[test]
    fn test_exec_track_changes_stamps_one_clock() {
        let db = new_todo_db();
        db.exec_track_changes(
            "INSERT INTO todos (id, title, finished) VALUES (?1, ?2, ?3)",
            &[1.into(), "Buy milk".into(), 0.into()],
            DEFAULT_DOCUMENT,
        )
        .unwrap();
        let clocks: Vec<String> = db
            .conn()
            .query_rows_and_then("SELECT DISTINCT created_at FROM crr_changes", [], |r| {
                r.get(0).map_err(crate::error::Error::from)
            })
            .unwrap();
        assert_eq!(clocks.len(), 1, "multi-column write must share a clock");
        let doc: String = db
            .conn()
            .query_one("SELECT DISTINCT document FROM crr_changes")
            .unwrap();
        assert_eq!(doc, DEFAULT_DOCUMENT);
    }

    #[test]
    fn test_clock_monotone_across_statements() {
        let db = new_todo_db();
        for i in 0..5 {
            db.exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (?1, ?2)",
                &[i.into(), "x".into()],
                DEFAULT_DOCUMENT,
            )
            .unwrap();
        }
        let clocks: Vec<String> = db
            .conn()
            .query_rows_and_then(
                "SELECT DISTINCT created_at FROM crr_changes ORDER BY created_at",
                [],
                |r| r.get(0).map_err(crate::error::Error::from),
            )
            .unwrap();
        assert_eq!(clocks.len(), 5);
        let mut sorted = clocks.clone();
        sorted.sort();
        assert_eq!(clocks, sorted);
    }

    #[test]
    fn test_events_fire_for_touched_tables() {
        let db = new_todo_db();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let _sub = db.events().subscribe(&["todos"], move |change| {
            assert_eq!(change.tables, vec!["todos".to_string()]);
            h.fetch_add(1, Ordering::SeqCst);
        });
        db.exec_track_changes(
            "INSERT INTO todos (id, title) VALUES (1, 'Buy milk')",
            &[],
            DEFAULT_DOCUMENT,
        )
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_document_bookkeeping() {
        let db = new_todo_db();
        db.exec_track_changes(
            "INSERT INTO todos (id, title) VALUES (1, 'a')",
            &[],
            "doc-1",
        )
        .unwrap();
        let doc = db.document("doc-1").unwrap().unwrap();
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.head, None);
        assert_eq!(db.documents().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_preserves_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crr.db");
        let site;
        let clock_before: String;
        {
            let db = CrrDb::open(&path).unwrap();
            db.conn()
                .execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT);")
                .unwrap();
            db.upgrade_table("todos", &TableOptions::default()).unwrap();
            db.finalize().unwrap();
            db.exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (1, 'persisted')",
                &[],
                DEFAULT_DOCUMENT,
            )
            .unwrap();
            site = db.site_id().unwrap();
            clock_before = db.conn().query_one("SELECT clock FROM crr_temp").unwrap();
        }
        let db = CrrDb::open(&path).unwrap();
        assert_eq!(db.site_id().unwrap(), site);
        // The persisted clock is what keeps created_at monotone across
        // restarts.
        let clock_after: String = db.conn().query_one("SELECT clock FROM crr_temp").unwrap();
        assert_eq!(clock_after, clock_before);
        let count: i64 = db
            .conn()
            .query_one("SELECT COUNT(*) FROM crr_changes")
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_erase_document() {
        let db = new_todo_db();
        db.exec_track_changes(
            "INSERT INTO todos (id, title) VALUES (1, 'a')",
            &[],
            "doc-1",
        )
        .unwrap();
        db.erase_document("doc-1").unwrap();
        let rows: i64 = db.conn().query_one("SELECT COUNT(*) FROM todos").unwrap();
        assert_eq!(rows, 0);
        let changes: i64 = db
            .conn()
            .query_one("SELECT COUNT(*) FROM crr_changes")
            .unwrap();
        assert_eq!(changes, 0);
        assert!(db.document("doc-1").unwrap().is_none());
    }
}
