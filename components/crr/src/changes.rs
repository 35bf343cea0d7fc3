/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The change log.
//!
//! One row per `(type, table, column, pk, version)`: the full edit history
//! of every replicated cell, plus tombstones. The log is authoritative -
//! user tables can be rebuilt from it at any commit - and append-mostly:
//! the only in-place mutations are the LWW upserts performed while applying
//! foreign batches, and flipping a tombstone's cancelled flag.

use crate::clock::Hlc;
use crate::error::Result;
use crate::types::{SqlValue, Timestamp};
use rusqlite::{named_params, Connection, Row as SqlRow};
use serde_derive::{Deserialize, Serialize};
use sql_support::{repeat_sql_vars, ConnExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            _ => Err(crate::error::Error::Invariant(format!(
                "unknown change type '{}'",
                s
            ))),
        }
    }
}

/// The column name used by delete changes.
pub const TOMBSTONE_COLUMN: &str = "tombstone";
/// The version of uncommitted (working copy) changes.
pub const UNCOMMITTED: &str = "0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub tbl: String,
    /// Column name, or `"tombstone"` for deletes.
    pub col: String,
    /// Encoded primary key of the affected row.
    pub pk: String,
    /// The written value; for deletes, 1 = active tombstone, 0 = cancelled.
    pub value: SqlValue,
    /// Site that authored the change.
    pub site_id: String,
    pub created_at: Hlc,
    /// Wall clock (ms) when this replica committed the row locally.
    pub applied_at: Timestamp,
    /// Commit id, or `"0"` while uncommitted.
    pub version: String,
    pub document: String,
}

impl Change {
    pub fn is_tombstone(&self) -> bool {
        self.kind == ChangeKind::Delete
    }

    /// An active (not cancelled) tombstone?
    pub fn is_active_tombstone(&self) -> bool {
        self.is_tombstone() && matches!(self.value, SqlValue::Integer(v) if v != 0)
    }

    pub(crate) fn from_row(row: &SqlRow<'_>) -> Result<Change> {
        Ok(Change {
            kind: ChangeKind::from_str(&row.get::<_, String>("type")?)?,
            tbl: row.get("tbl")?,
            col: row.get("col")?,
            pk: row.get("pk")?,
            value: row.get("value")?,
            site_id: row.get("site_id")?,
            created_at: row.get("created_at")?,
            applied_at: row.get("applied_at")?,
            version: row.get("version")?,
            document: row.get("document")?,
        })
    }
}

/// Does `a` beat `b` for the same cell? Clock first; on a tie the larger
/// value (as text) wins so that every replica picks the same side; a full
/// tie is the same change, and taking it is harmless.
pub fn wins_over(a: &Change, b: &Change) -> bool {
    match a.created_at.cmp(&b.created_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.value.as_sort_text() >= b.value.as_sort_text(),
    }
}

const SELECT_CHANGES: &str =
    "SELECT type, tbl, col, pk, value, site_id, created_at, applied_at, version, document
     FROM crr_changes";

/// Upsert a change on the uniqueness tuple. This is the apply engine's
/// write shape: an accepted newer write replaces the stored cell state for
/// that version.
pub(crate) fn save(conn: &Connection, change: &Change) -> Result<()> {
    conn.execute_cached(
        "INSERT INTO crr_changes (
             type, tbl, col, pk, value, site_id, created_at, applied_at, version, document
         )
         VALUES (:type, :tbl, :col, :pk, :value, :site_id, :created_at, :applied_at,
                 :version, :document)
         ON CONFLICT (type, tbl, col, pk, version) DO UPDATE SET
             value = excluded.value,
             site_id = excluded.site_id,
             created_at = excluded.created_at,
             applied_at = excluded.applied_at,
             document = excluded.document",
        named_params! {
            ":type": change.kind.as_str(),
            ":tbl": change.tbl,
            ":col": change.col,
            ":pk": change.pk,
            ":value": change.value,
            ":site_id": change.site_id,
            ":created_at": change.created_at,
            ":applied_at": change.applied_at,
            ":version": change.version,
            ":document": change.document,
        },
    )?;
    Ok(())
}

/// Insert-or-ignore on the uniqueness tuple: the trigger write shape, also
/// used for foreign rows that must never clobber what's already stored.
pub(crate) fn insert_ignore(conn: &Connection, change: &Change) -> Result<()> {
    conn.execute_cached(
        "INSERT OR IGNORE INTO crr_changes (
             type, tbl, col, pk, value, site_id, created_at, applied_at, version, document
         )
         VALUES (:type, :tbl, :col, :pk, :value, :site_id, :created_at, :applied_at,
                 :version, :document)",
        named_params! {
            ":type": change.kind.as_str(),
            ":tbl": change.tbl,
            ":col": change.col,
            ":pk": change.pk,
            ":value": change.value,
            ":site_id": change.site_id,
            ":created_at": change.created_at,
            ":applied_at": change.applied_at,
            ":version": change.version,
            ":document": change.document,
        },
    )?;
    Ok(())
}

/// Point lookup on the uniqueness tuple.
pub(crate) fn get(
    conn: &Connection,
    kind: ChangeKind,
    tbl: &str,
    col: &str,
    pk: &str,
    version: &str,
) -> Result<Option<Change>> {
    let sql = format!(
        "{} WHERE type = :type AND tbl = :tbl AND col = :col AND pk = :pk AND version = :version",
        SELECT_CHANGES
    );
    conn.try_query_row(
        &sql,
        named_params! {
            ":type": kind.as_str(),
            ":tbl": tbl,
            ":col": col,
            ":pk": pk,
            ":version": version,
        },
        |row| Change::from_row(row),
        true,
    )
}

/// Latest non-delete change for one cell, across all versions.
pub(crate) fn latest_live_cell_change(
    conn: &Connection,
    tbl: &str,
    col: &str,
    pk: &str,
) -> Result<Option<Change>> {
    let sql = format!(
        "{} WHERE tbl = :tbl AND col = :col AND pk = :pk AND type != 'delete'
         ORDER BY created_at DESC LIMIT 1",
        SELECT_CHANGES
    );
    conn.try_query_row(
        &sql,
        named_params! { ":tbl": tbl, ":col": col, ":pk": pk },
        |row| Change::from_row(row),
        true,
    )
}

/// Latest tombstone for a row, if any.
pub(crate) fn latest_tombstone(conn: &Connection, tbl: &str, pk: &str) -> Result<Option<Change>> {
    let sql = format!(
        "{} WHERE tbl = :tbl AND pk = :pk AND type = 'delete'
         ORDER BY created_at DESC LIMIT 1",
        SELECT_CHANGES
    );
    conn.try_query_row(
        &sql,
        named_params! { ":tbl": tbl, ":pk": pk },
        |row| Change::from_row(row),
        true,
    )
}

/// Flip every tombstone of `(tbl, pk)` to cancelled. Writing `value` of a
/// delete row is the one mutation allowed on foreign changes; it is
/// idempotent and commutative.
pub(crate) fn cancel_tombstones(conn: &Connection, tbl: &str, pk: &str) -> Result<()> {
    conn.execute_cached(
        "UPDATE crr_changes SET value = 0
         WHERE tbl = :tbl AND pk = :pk AND type = 'delete'",
        named_params! { ":tbl": tbl, ":pk": pk },
    )?;
    Ok(())
}

/// The newest non-delete change on a row authored by any site other than
/// `site`, at or after `clock`. This is what decides whether an incoming
/// delete is cancelled.
pub(crate) fn newest_conflicting_change(
    conn: &Connection,
    tbl: &str,
    pk: &str,
    site: &str,
    clock: Hlc,
) -> Result<Option<Change>> {
    let sql = format!(
        "{} WHERE tbl = :tbl AND pk = :pk AND type != 'delete'
           AND site_id != :site AND created_at >= :clock
         ORDER BY created_at DESC LIMIT 1",
        SELECT_CHANGES
    );
    conn.try_query_row(
        &sql,
        named_params! { ":tbl": tbl, ":pk": pk, ":site": site, ":clock": clock },
        |row| Change::from_row(row),
        true,
    )
}

/// Distinct pks of rows whose *current* value of `col` (per the log) equals
/// `value_text`. Used to find the children of a row along a foreign key.
pub(crate) fn row_pks_with_cell_value(
    conn: &Connection,
    tbl: &str,
    col: &str,
    value_text: &str,
) -> Result<Vec<String>> {
    // Bare-column-with-MAX: SQLite picks `value` from the row holding the
    // max created_at of each group.
    conn.query_rows_and_then_cached(
        "SELECT pk FROM (
             SELECT pk, value, MAX(created_at)
             FROM crr_changes
             WHERE tbl = :tbl AND col = :col AND type != 'delete'
             GROUP BY pk
         )
         WHERE CAST(value AS TEXT) = :val",
        named_params! { ":tbl": tbl, ":col": col, ":val": value_text },
        |row| Ok(row.get(0)?),
    )
}

/// Rewrite the stored value of the newest live change of one cell. Used by
/// fractional-index repair so the log agrees with the repaired row.
pub(crate) fn set_latest_cell_value(
    conn: &Connection,
    tbl: &str,
    col: &str,
    pk: &str,
    value: &SqlValue,
) -> Result<()> {
    conn.execute_cached(
        "UPDATE crr_changes SET value = :value
         WHERE tbl = :tbl AND col = :col AND pk = :pk AND type != 'delete'
           AND created_at = (SELECT MAX(created_at) FROM crr_changes
                             WHERE tbl = :tbl AND col = :col AND pk = :pk
                               AND type != 'delete')",
        named_params! { ":value": value, ":tbl": tbl, ":col": col, ":pk": pk },
    )?;
    Ok(())
}

/// Mirror an accepted foreign-key update onto the historical insert rows of
/// the same cell, so a later resurrection re-parents the row correctly.
pub(crate) fn mirror_fk_onto_inserts(
    conn: &Connection,
    tbl: &str,
    col: &str,
    pk: &str,
    value: &SqlValue,
) -> Result<()> {
    conn.execute_cached(
        "UPDATE crr_changes SET value = :value
         WHERE tbl = :tbl AND col = :col AND pk = :pk AND type = 'insert'",
        named_params! { ":value": value, ":tbl": tbl, ":col": col, ":pk": pk },
    )?;
    Ok(())
}

/// Non-delete changes for one row, newest first; what row reconstruction
/// folds over.
pub(crate) fn row_changes_newest_first(
    conn: &Connection,
    tbl: &str,
    pk: &str,
) -> Result<Vec<Change>> {
    let sql = format!(
        "{} WHERE tbl = :tbl AND pk = :pk AND type != 'delete'
         ORDER BY created_at DESC",
        SELECT_CHANGES
    );
    conn.query_rows_and_then_cached(
        &sql,
        named_params! { ":tbl": tbl, ":pk": pk },
        |row| Change::from_row(row),
    )
}

/// All changes belonging to one commit, in clock order.
pub(crate) fn changes_for_version(conn: &Connection, version: &str) -> Result<Vec<Change>> {
    let sql = format!(
        "{} WHERE version = :version ORDER BY created_at, tbl, pk, col",
        SELECT_CHANGES
    );
    conn.query_rows_and_then_cached(&sql, named_params! { ":version": version }, |row| {
        Change::from_row(row)
    })
}

/// All changes belonging to a set of commits, in clock order.
pub(crate) fn changes_for_versions(conn: &Connection, versions: &[String]) -> Result<Vec<Change>> {
    if versions.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "{} WHERE version IN ({}) ORDER BY created_at, tbl, pk, col",
        SELECT_CHANGES,
        repeat_sql_vars(versions.len()),
    );
    conn.query_rows_and_then(&sql, rusqlite::params_from_iter(versions), |row| {
        Change::from_row(row)
    })
}

/// The working copy: uncommitted changes of one document, in clock order.
pub(crate) fn uncommitted(conn: &Connection, document: &str) -> Result<Vec<Change>> {
    let sql = format!(
        "{} WHERE version = '0' AND document = :document ORDER BY created_at, tbl, pk, col",
        SELECT_CHANGES
    );
    conn.query_rows_and_then_cached(&sql, named_params! { ":document": document }, |row| {
        Change::from_row(row)
    })
}

pub(crate) fn has_uncommitted(conn: &Connection, document: &str) -> Result<bool> {
    Ok(conn.exists(
        "SELECT 1 FROM crr_changes WHERE version = '0' AND document = ?1",
        [document],
    )?)
}

/// Promote the document's working copy into `version`. This is what
/// `commit` does.
pub(crate) fn promote_uncommitted(
    conn: &Connection,
    document: &str,
    version: &str,
) -> Result<usize> {
    Ok(conn.execute_cached(
        "UPDATE crr_changes SET version = :version
         WHERE version = '0' AND document = :document",
        named_params! { ":version": version, ":document": document },
    )?)
}

pub(crate) fn delete_uncommitted(conn: &Connection, document: &str) -> Result<usize> {
    Ok(conn.execute_cached(
        "DELETE FROM crr_changes WHERE version = '0' AND document = ?1",
        [document],
    )?)
}

/// Changes of a document applied after `since`; the non-versioned sync pair
/// pulls with this.
pub(crate) fn changes_since(
    conn: &Connection,
    document: &str,
    since: Timestamp,
) -> Result<Vec<Change>> {
    let sql = format!(
        "{} WHERE document = :document AND applied_at > :since
         ORDER BY created_at, tbl, pk, col",
        SELECT_CHANGES
    );
    conn.query_rows_and_then_cached(
        &sql,
        named_params! { ":document": document, ":since": since },
        |row| Change::from_row(row),
    )
}

/// Distinct tables touched by the statement stamped with `clock`; feeds the
/// table-change events.
pub(crate) fn statement_tables(
    conn: &Connection,
    document: &str,
    clock: Hlc,
) -> Result<Vec<String>> {
    conn.query_rows_and_then_cached(
        "SELECT DISTINCT tbl FROM crr_changes
         WHERE version = '0' AND document = :document AND created_at = :clock",
        named_params! { ":document": document, ":clock": clock },
        |row| Ok(row.get(0)?),
    )
}

/// Uncommitted placeholder-position candidates for one fractional column,
/// in insertion order.
pub(crate) fn placeholder_position_changes(
    conn: &Connection,
    tbl: &str,
    col: &str,
    document: &str,
    clock: Hlc,
) -> Result<Vec<Change>> {
    let sql = format!(
        "{} WHERE version = '0' AND document = :document AND tbl = :tbl
           AND col = :col AND created_at = :clock
         ORDER BY rowid",
        SELECT_CHANGES
    );
    let all = conn.query_rows_and_then_cached(
        &sql,
        named_params! { ":document": document, ":tbl": tbl, ":col": col, ":clock": clock },
        |row| Change::from_row(row),
    )?;
    Ok(all
        .into_iter()
        .filter(|c| crate::fractindex::is_placeholder(&c.value))
        .collect())
}

/// Record that we've seen a change from `site`.
pub(crate) fn record_site(conn: &Connection, site: &str) -> Result<()> {
    let now = Timestamp::now();
    conn.execute_cached(
        "INSERT INTO crr_clients (site_id, is_local, first_seen_at, last_seen_at)
         VALUES (:site, 0, :now, :now)
         ON CONFLICT (site_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        named_params! { ":site": site, ":now": now },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: ChangeKind, created_at: Hlc, value: SqlValue) -> Change {
        Change {
            kind,
            tbl: "todos".into(),
            col: "title".into(),
            pk: "1".into(),
            value,
            site_id: "site-a".into(),
            created_at,
            applied_at: Timestamp(1),
            version: UNCOMMITTED.into(),
            document: "main".into(),
        }
    }

    #[test]
    fn test_wins_over_by_clock() {
        let older = change(ChangeKind::Update, Hlc { pt: 10, lt: 0 }, "a".into());
        let newer = change(ChangeKind::Update, Hlc { pt: 11, lt: 0 }, "b".into());
        assert!(wins_over(&newer, &older));
        assert!(!wins_over(&older, &newer));
    }

    #[test]
    fn test_wins_over_value_tiebreak() {
        let clock = Hlc { pt: 10, lt: 0 };
        let a = change(ChangeKind::Update, clock, "apple".into());
        let b = change(ChangeKind::Update, clock, "banana".into());
        assert!(wins_over(&b, &a));
        assert!(!wins_over(&a, &b));
        // Full tie falls through to true.
        assert!(wins_over(&a, &a));
    }

    #[test]
    fn test_tombstone_flags() {
        let active = change(ChangeKind::Delete, Hlc { pt: 1, lt: 0 }, SqlValue::Integer(1));
        let cancelled = change(ChangeKind::Delete, Hlc { pt: 1, lt: 0 }, SqlValue::Integer(0));
        assert!(active.is_active_tombstone());
        assert!(!cancelled.is_active_tombstone());
        assert!(cancelled.is_tombstone());
    }

    #[test]
    fn test_serde_wire_shape() {
        let c = change(
            ChangeKind::Insert,
            Hlc { pt: 36, lt: 1 },
            SqlValue::Text("Buy milk".into()),
        );
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["createdAt"], "000000010-0001");
        assert_eq!(json["value"], serde_json::json!({ "text": "Buy milk" }));
        let back: Change = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
