/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Change-capture triggers.
//!
//! `finalize` installs an AFTER INSERT/UPDATE/DELETE trigger per upgraded
//! table. The bodies read the session clock, document and site through
//! subqueries on every invocation - the apply engine flips
//! `crr_temp.time_travelling` while replaying foreign changes, and the
//! triggers must see that immediately, not a cached value.

use crate::changes::TOMBSTONE_COLUMN;
use crate::error::Result;
use crate::pk;
use crate::registry::{Registry, TableInfo};
use rusqlite::Connection;
use sql_support::ConnExt;

// Unix milliseconds from SQLite's julian-day clock.
const NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

const SITE: &str = "(SELECT site_id FROM crr_clients WHERE is_local = 1)";
const CLOCK: &str = "(SELECT clock FROM crr_temp WHERE id = 0)";
const DOCUMENT: &str = "(SELECT document FROM crr_temp WHERE id = 0)";
const NOT_TIME_TRAVELLING: &str = "(SELECT time_travelling FROM crr_temp WHERE id = 0) = 0";

// Values are always bound parameters in this crate; trigger bodies are the
// one place we embed literals, and only for names taken from the schema.
fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn trigger_name(kind: &str, table: &str) -> String {
    pk::ident(&format!("crr_after_{}_{}", kind, table))
}

fn insert_trigger_sql(table: &TableInfo) -> String {
    let pk_expr = pk::expr(table, Some("NEW"));
    let body: Vec<String> = table
        .replicated_columns()
        .map(|col| {
            format!(
                "INSERT OR IGNORE INTO crr_changes \
                 (type, tbl, col, pk, value, site_id, created_at, applied_at, version, document) \
                 VALUES ('insert', {tbl}, {col}, {pk}, NEW.{col_ref}, {site}, {clock}, {now}, '0', {doc});",
                tbl = sql_str(&table.name),
                col = sql_str(&col.name),
                pk = pk_expr,
                col_ref = pk::ident(&col.name),
                site = SITE,
                clock = CLOCK,
                now = NOW_MS,
                doc = DOCUMENT,
            )
        })
        .collect();
    format!(
        "CREATE TRIGGER {name} AFTER INSERT ON {tbl} FOR EACH ROW WHEN {gate}\n\
         BEGIN\n    {body}\nEND",
        name = trigger_name("insert", &table.name),
        tbl = pk::ident(&table.name),
        gate = NOT_TIME_TRAVELLING,
        body = body.join("\n    "),
    )
}

fn update_trigger_sql(table: &TableInfo) -> String {
    let pk_expr = pk::expr(table, Some("NEW"));
    let body: Vec<String> = table
        .replicated_columns()
        .map(|col| {
            format!(
                "INSERT INTO crr_changes \
                 (type, tbl, col, pk, value, site_id, created_at, applied_at, version, document) \
                 SELECT 'update', {tbl}, {col}, {pk}, NEW.{col_ref}, {site}, {clock}, {now}, '0', {doc} \
                 WHERE NEW.{col_ref} IS NOT OLD.{col_ref} \
                 ON CONFLICT (type, tbl, col, pk, version) DO UPDATE SET \
                 value = excluded.value, site_id = excluded.site_id, \
                 created_at = excluded.created_at, applied_at = excluded.applied_at;",
                tbl = sql_str(&table.name),
                col = sql_str(&col.name),
                pk = pk_expr,
                col_ref = pk::ident(&col.name),
                site = SITE,
                clock = CLOCK,
                now = NOW_MS,
                doc = DOCUMENT,
            )
        })
        .collect();
    format!(
        "CREATE TRIGGER {name} AFTER UPDATE ON {tbl} FOR EACH ROW WHEN {gate}\n\
         BEGIN\n    {body}\nEND",
        name = trigger_name("update", &table.name),
        tbl = pk::ident(&table.name),
        gate = NOT_TIME_TRAVELLING,
        body = body.join("\n    "),
    )
}

fn delete_trigger_sql(table: &TableInfo) -> String {
    format!(
        "CREATE TRIGGER {name} AFTER DELETE ON {tbl} FOR EACH ROW WHEN {gate}\n\
         BEGIN\n    \
         INSERT INTO crr_changes \
         (type, tbl, col, pk, value, site_id, created_at, applied_at, version, document) \
         VALUES ('delete', {tbl_str}, {col}, {pk}, 1, {site}, {clock}, {now}, '0', {doc}) \
         ON CONFLICT (type, tbl, col, pk, version) DO UPDATE SET \
         value = 1, site_id = excluded.site_id, \
         created_at = excluded.created_at, applied_at = excluded.applied_at;\nEND",
        name = trigger_name("delete", &table.name),
        tbl = pk::ident(&table.name),
        gate = NOT_TIME_TRAVELLING,
        tbl_str = sql_str(&table.name),
        col = sql_str(TOMBSTONE_COLUMN),
        pk = pk::expr(table, Some("OLD")),
        site = SITE,
        clock = CLOCK,
        now = NOW_MS,
        doc = DOCUMENT,
    )
}

fn drop_table_triggers(conn: &Connection, table: &str) -> Result<()> {
    for kind in ["insert", "update", "delete"] {
        conn.execute_batch(&format!(
            "DROP TRIGGER IF EXISTS {}",
            trigger_name(kind, table)
        ))?;
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn.exists(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
    )?)
}

/// Drop and reinstall the change-capture triggers for every upgraded table.
/// Idempotent; call after the last `upgrade_table` /
/// `upgrade_column_to_fractional_index` of a session.
pub fn finalize(conn: &Connection) -> Result<()> {
    let registry = Registry::load(conn)?;
    for table in registry.tables() {
        drop_table_triggers(conn, &table.name)?;
        if !table_exists(conn, &table.name)? {
            // The log outlives the table; nothing to capture until it's
            // recreated.
            log::warn!("not installing triggers: no table named '{}'", table.name);
            continue;
        }
        conn.execute_batch(&insert_trigger_sql(table))?;
        conn.execute_batch(&update_trigger_sql(table))?;
        conn.execute_batch(&delete_trigger_sql(table))?;
        log::debug!("installed change triggers for '{}'", table.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CrrDb;
    use crate::registry::{upgrade_table, TableOptions};

    fn new_db() -> CrrDb {
        let db = CrrDb::open_in_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, finished INTEGER,
                                     secret TEXT);",
            )
            .unwrap();
        upgrade_table(
            db.conn(),
            "todos",
            &TableOptions {
                non_replicated: &["secret"],
                ..TableOptions::default()
            },
        )
        .unwrap();
        finalize(db.conn()).unwrap();
        db
    }

    fn count_changes(db: &CrrDb, kind: &str) -> i64 {
        db.conn()
            .query_row(
                "SELECT COUNT(*) FROM crr_changes WHERE type = ?1",
                [kind],
                |r| r.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_insert_captured_per_column() {
        let db = new_db();
        db.conn()
            .execute(
                "INSERT INTO todos (id, title, finished, secret) VALUES (1, 'Buy milk', 0, 'x')",
                [],
            )
            .unwrap();
        // id, title, finished - but not the non-replicated column.
        assert_eq!(count_changes(&db, "insert"), 3);
        let secret_rows: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM crr_changes WHERE col = 'secret'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(secret_rows, 0);
    }

    #[test]
    fn test_update_captures_only_changed_columns() {
        let db = new_db();
        db.conn()
            .execute(
                "INSERT INTO todos (id, title, finished) VALUES (1, 'Buy milk', 0)",
                [],
            )
            .unwrap();
        db.conn()
            .execute("UPDATE todos SET title = 'Buy coffee' WHERE id = 1", [])
            .unwrap();
        assert_eq!(count_changes(&db, "update"), 1);
        // A second update of the same cell merges into the same uncommitted
        // change row.
        db.conn()
            .execute("UPDATE todos SET title = 'Buy tea' WHERE id = 1", [])
            .unwrap();
        assert_eq!(count_changes(&db, "update"), 1);
        let value: String = db
            .conn()
            .query_row(
                "SELECT value FROM crr_changes WHERE type = 'update' AND col = 'title'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(value, "Buy tea");
    }

    #[test]
    fn test_delete_captures_tombstone() {
        let db = new_db();
        db.conn()
            .execute("INSERT INTO todos (id, title) VALUES (1, 'Buy milk')", [])
            .unwrap();
        db.conn()
            .execute("DELETE FROM todos WHERE id = 1", [])
            .unwrap();
        assert_eq!(count_changes(&db, "delete"), 1);
        let (col, value): (String, i64) = db
            .conn()
            .query_row(
                "SELECT col, value FROM crr_changes WHERE type = 'delete'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(col, TOMBSTONE_COLUMN);
        assert_eq!(value, 1);
    }

    #[test]
    fn test_time_travelling_suppresses_capture() {
        let db = new_db();
        db.conn()
            .execute("UPDATE crr_temp SET time_travelling = 1", [])
            .unwrap();
        db.conn()
            .execute("INSERT INTO todos (id, title) VALUES (1, 'ghost')", [])
            .unwrap();
        assert_eq!(count_changes(&db, "insert"), 0);
        db.conn()
            .execute("UPDATE crr_temp SET time_travelling = 0", [])
            .unwrap();
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let db = new_db();
        finalize(db.conn()).unwrap();
        finalize(db.conn()).unwrap();
        db.conn()
            .execute("INSERT INTO todos (id, title) VALUES (1, 't')", [])
            .unwrap();
        assert_eq!(count_changes(&db, "insert"), 2);
    }
}
