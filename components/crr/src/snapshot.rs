/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Reconstruction: folding the change log back into rows.
//!
//! `reconstruct_row` rebuilds one live row from its full history;
//! `document_snapshot` folds the changes of a commit's ancestor set into a
//! queryable state, which `checkout` can materialize into the real tables.

use crate::changes::{self, Change};
use crate::commits;
use crate::error::Result;
use crate::pk;
use crate::registry::{Registry, TableInfo};
use crate::types::{row_to_json, Row, SqlValue};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use sql_support::{repeat_sql_vars, ConnExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Does the row currently exist in the user table?
pub(crate) fn row_exists(conn: &Connection, table: &TableInfo, encoded_pk: &str) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {}",
        pk::ident(&table.name),
        pk::where_clause(table),
    );
    let params: Vec<SqlValue> = pk::decode(encoded_pk)
        .into_iter()
        .map(SqlValue::Text)
        .collect();
    Ok(conn.exists(&sql, rusqlite::params_from_iter(params))?)
}

/// The current value of one cell: the live row if present, else the newest
/// change in the log.
pub(crate) fn current_cell_value(
    conn: &Connection,
    table: &TableInfo,
    encoded_pk: &str,
    column: &str,
) -> Result<Option<SqlValue>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        pk::ident(column),
        pk::ident(&table.name),
        pk::where_clause(table),
    );
    let params: Vec<SqlValue> = pk::decode(encoded_pk)
        .into_iter()
        .map(SqlValue::Text)
        .collect();
    let from_row = conn.try_query_row(
        &sql,
        rusqlite::params_from_iter(params),
        |row| -> Result<SqlValue> { Ok(row.get(0)?) },
        true,
    )?;
    if from_row.is_some() {
        return Ok(from_row);
    }
    Ok(
        changes::latest_live_cell_change(conn, &table.name, column, encoded_pk)?
            .map(|c| c.value),
    )
}

/// Rebuild a row from its change history: per configured column, the newest
/// value; columns never written are null. `None` when no history exists.
pub(crate) fn reconstruct_row(
    conn: &Connection,
    table: &TableInfo,
    encoded_pk: &str,
) -> Result<Option<Row>> {
    let history = changes::row_changes_newest_first(conn, &table.name, encoded_pk)?;
    if history.is_empty() {
        return Ok(None);
    }
    let mut row = Row::new();
    for col in table.replicated_columns() {
        let newest = history.iter().find(|c| c.col == col.name);
        row.insert(
            col.name.clone(),
            newest.map(|c| c.value.clone()).unwrap_or(SqlValue::Null),
        );
    }
    // The pk columns are part of the address even when the log never saw
    // them as cells.
    let parts = pk::decode(encoded_pk);
    for (i, pk_col) in table.pk_cols.iter().enumerate() {
        let missing = row.get(pk_col).map(SqlValue::is_null).unwrap_or(true);
        if missing {
            row.insert(
                pk_col.clone(),
                SqlValue::Text(parts.get(i).cloned().unwrap_or_default()),
            );
        }
    }
    Ok(Some(row))
}

/// `INSERT OR IGNORE` a reconstructed row.
pub(crate) fn insert_row_ignore(conn: &Connection, table: &TableInfo, row: &Row) -> Result<()> {
    let cols: Vec<&String> = row.keys().collect();
    let col_list: Vec<String> = cols.iter().map(|c| pk::ident(c)).collect();
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        pk::ident(&table.name),
        col_list.join(", "),
        repeat_sql_vars(cols.len()),
    );
    conn.execute(&sql, rusqlite::params_from_iter(row.values()))?;
    Ok(())
}

/// The folded state of a document at some commit.
pub struct Snapshot {
    document: String,
    commit: String,
    rows: BTreeMap<(String, String), Row>,
}

impl Snapshot {
    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// The folded row, or `None` when it never existed or its fold ends in
    /// an active tombstone.
    pub fn get_row(&self, table: &str, encoded_pk: &str) -> Option<&Row> {
        self.rows
            .get(&(table.to_string(), encoded_pk.to_string()))
    }

    pub fn get_rows(&self, table: &str) -> Vec<&Row> {
        self.rows
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, row)| row)
            .collect()
    }

    /// Deserialize the folded row into an application type.
    pub fn get_row_as<T: DeserializeOwned>(
        &self,
        table: &str,
        encoded_pk: &str,
    ) -> Result<Option<T>> {
        self.get_row(table, encoded_pk)
            .map(|row| Ok(serde_json::from_value(row_to_json(row))?))
            .transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fold all changes of `commit`'s ancestor set (the commit included).
pub fn document_snapshot(
    conn: &Connection,
    registry: &Registry,
    document: &str,
    commit: &str,
) -> Result<Snapshot> {
    let versions = commits::ancestor_ids(conn, commit)?;
    build_snapshot(conn, registry, document, commit, &versions)
}

pub(crate) fn build_snapshot(
    conn: &Connection,
    registry: &Registry,
    document: &str,
    commit: &str,
    versions: &[String],
) -> Result<Snapshot> {
    let all = changes::changes_for_versions(conn, versions)?;
    Ok(fold_changes(registry, document, commit, all))
}

/// Fold a change set by `(table, pk, column)` under last-writer-wins, with
/// tombstone suppression: a row whose newest fate is an active delete is
/// absent from the result.
pub(crate) fn fold_changes(
    registry: &Registry,
    document: &str,
    commit: &str,
    all: Vec<Change>,
) -> Snapshot {
    let mut cells: HashMap<(String, String, String), Change> = HashMap::new();
    let mut tombstones: HashMap<(String, String), Change> = HashMap::new();
    for change in all {
        if change.is_tombstone() {
            let key = (change.tbl.clone(), change.pk.clone());
            match tombstones.get(&key) {
                Some(prior) if prior.created_at >= change.created_at => {}
                _ => {
                    tombstones.insert(key, change);
                }
            }
        } else {
            let key = (change.tbl.clone(), change.pk.clone(), change.col.clone());
            match cells.get(&key) {
                Some(prior) if !changes::wins_over(&change, prior) => {}
                _ => {
                    cells.insert(key, change);
                }
            }
        }
    }

    // A tombstone only erases the row if it is active and nothing newer
    // wrote to the row afterwards.
    let mut newest_write: HashMap<(String, String), crate::clock::Hlc> = HashMap::new();
    for ((tbl, pk, _), change) in &cells {
        let key = (tbl.clone(), pk.clone());
        let newest = newest_write.entry(key).or_insert(change.created_at);
        if change.created_at > *newest {
            *newest = change.created_at;
        }
    }
    let dead: BTreeSet<(String, String)> = tombstones
        .into_iter()
        .filter(|((tbl, pk), ts)| {
            ts.is_active_tombstone()
                && newest_write
                    .get(&(tbl.clone(), pk.clone()))
                    .map(|w| ts.created_at > *w)
                    .unwrap_or(true)
        })
        .map(|(key, _)| key)
        .collect();

    let mut rows: BTreeMap<(String, String), Row> = BTreeMap::new();
    for ((tbl, pk, col), change) in cells {
        if dead.contains(&(tbl.clone(), pk.clone())) {
            continue;
        }
        // Only columns our schema knows can be materialized.
        let known = registry
            .get(&tbl)
            .map(|t| t.column(&col).is_some())
            .unwrap_or(false);
        if !known {
            continue;
        }
        rows.entry((tbl, pk))
            .or_insert_with(Row::new)
            .insert(col, change.value);
    }
    // Fill unwritten columns with nulls and make sure pks are present, so
    // rows materialize completely.
    for ((tbl, pk), row) in rows.iter_mut() {
        if let Some(table) = registry.get(tbl) {
            for col in table.replicated_columns() {
                row.entry(col.name.clone()).or_insert(SqlValue::Null);
            }
            let parts = pk::decode(pk);
            for (i, pk_col) in table.pk_cols.iter().enumerate() {
                let missing = row.get(pk_col).map(SqlValue::is_null).unwrap_or(true);
                if missing {
                    row.insert(
                        pk_col.clone(),
                        SqlValue::Text(parts.get(i).cloned().unwrap_or_default()),
                    );
                }
            }
        }
    }

    Snapshot {
        document: document.to_string(),
        commit: commit.to_string(),
        rows,
    }
}

/// Materialize a snapshot: truncate the document's rows and re-insert the
/// folded state. The caller wraps this in a transaction with
/// `time_travelling` set.
pub(crate) fn apply_snapshot(
    conn: &Connection,
    registry: &Registry,
    snapshot: &Snapshot,
) -> Result<Vec<String>> {
    let tables = delete_document_rows(conn, registry, &snapshot.document)?;
    for ((tbl, _), row) in &snapshot.rows {
        let table = match registry.get(tbl) {
            Some(t) => t,
            None => {
                log::warn!("snapshot row for unknown table '{}' not materialized", tbl);
                continue;
            }
        };
        insert_row_ignore(conn, table, row)?;
    }
    let mut touched: BTreeSet<String> = tables.into_iter().collect();
    touched.extend(snapshot.rows.keys().map(|(tbl, _)| tbl.clone()));
    Ok(touched.into_iter().collect())
}

/// Delete every materialized row of `document` from the user tables;
/// returns the tables that lost rows.
pub(crate) fn delete_document_rows(
    conn: &Connection,
    registry: &Registry,
    document: &str,
) -> Result<Vec<String>> {
    let mut touched = Vec::new();
    for table in registry.tables() {
        let sql = format!(
            "DELETE FROM {tbl} WHERE {pk} IN
                 (SELECT DISTINCT pk FROM crr_changes
                  WHERE tbl = :tbl AND document = :document)",
            tbl = pk::ident(&table.name),
            pk = pk::expr(table, None),
        );
        let n = conn.execute_cached(
            &sql,
            rusqlite::named_params! { ":tbl": table.name, ":document": document },
        )?;
        if n > 0 {
            touched.push(table.name.clone());
        }
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::{Change, ChangeKind};
    use crate::clock::Hlc;
    use crate::db::CrrDb;
    use crate::registry::TableOptions;
    use crate::types::Timestamp;

    fn new_db() -> CrrDb {
        let db = CrrDb::open_in_memory().unwrap();
        db.conn()
            .execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, finished INTEGER);")
            .unwrap();
        db.upgrade_table("todos", &TableOptions::default()).unwrap();
        db.finalize().unwrap();
        db
    }

    fn change(kind: ChangeKind, col: &str, pk: &str, value: SqlValue, pt: u64) -> Change {
        Change {
            kind,
            tbl: "todos".into(),
            col: col.into(),
            pk: pk.into(),
            value,
            site_id: "remote".into(),
            created_at: Hlc { pt, lt: 0 },
            applied_at: Timestamp(pt as i64),
            version: "v1".into(),
            document: "main".into(),
        }
    }

    #[test]
    fn test_reconstruct_row_takes_newest_per_column() {
        let db = new_db();
        let registry = Registry::load(db.conn()).unwrap();
        let table = registry.table("todos").unwrap();
        for c in [
            change(ChangeKind::Insert, "id", "1", SqlValue::Integer(1), 10),
            change(ChangeKind::Insert, "title", "1", "Buy milk".into(), 10),
            change(ChangeKind::Update, "title", "1", "Buy coffee".into(), 20),
        ] {
            changes::save(db.conn(), &c).unwrap();
        }
        let row = reconstruct_row(db.conn(), table, "1").unwrap().unwrap();
        assert_eq!(row["title"], SqlValue::Text("Buy coffee".into()));
        // Never written: null.
        assert_eq!(row["finished"], SqlValue::Null);

        assert!(reconstruct_row(db.conn(), table, "999").unwrap().is_none());
    }

    #[test]
    fn test_fold_suppresses_active_tombstone() {
        let db = new_db();
        let registry = Registry::load(db.conn()).unwrap();
        let all = vec![
            change(ChangeKind::Insert, "id", "1", SqlValue::Integer(1), 10),
            change(ChangeKind::Insert, "title", "1", "gone".into(), 10),
            change(
                ChangeKind::Delete,
                crate::changes::TOMBSTONE_COLUMN,
                "1",
                SqlValue::Integer(1),
                20,
            ),
            change(ChangeKind::Insert, "id", "2", SqlValue::Integer(2), 10),
            change(ChangeKind::Insert, "title", "2", "kept".into(), 10),
        ];
        let snap = fold_changes(&registry, "main", "v1", all);
        assert!(snap.get_row("todos", "1").is_none());
        assert!(snap.get_row("todos", "2").is_some());
        assert_eq!(snap.get_rows("todos").len(), 1);
    }

    #[test]
    fn test_fold_delete_loses_to_newer_write() {
        let db = new_db();
        let registry = Registry::load(db.conn()).unwrap();
        let all = vec![
            change(ChangeKind::Insert, "id", "1", SqlValue::Integer(1), 10),
            change(
                ChangeKind::Delete,
                crate::changes::TOMBSTONE_COLUMN,
                "1",
                SqlValue::Integer(1),
                20,
            ),
            change(ChangeKind::Update, "title", "1", "revived".into(), 30),
        ];
        let snap = fold_changes(&registry, "main", "v1", all);
        let row = snap.get_row("todos", "1").expect("row survives");
        assert_eq!(row["title"], SqlValue::Text("revived".into()));
    }
}
