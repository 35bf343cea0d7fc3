/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Pull-side history integration: fast-forward and three-way merge.
//!
//! A pull that finds no local commits past the common ancestor just
//! fast-forwards. Otherwise remote changes are compared cell-by-cell
//! against the local divergence: untouched cells are taken, contested
//! cells resolve by last-writer-wins - except columns registered
//! `manual_conflict`, which park a conflict record for the application to
//! settle with `resolve_conflict`.

use crate::apply;
use crate::changes::{self, Change};
use crate::commits::{self, Commit};
use crate::db::{self, session, CrrDb};
use crate::error::{Error, Result};
use crate::pk;
use crate::registry::Registry;
use crate::snapshot;
use crate::types::{random_id, row_from_json, row_to_json, Row, SqlValue};
use rusqlite::{named_params, Connection};
use serde_derive::{Deserialize, Serialize};
use sql_support::ConnExt;
use std::collections::{BTreeMap, BTreeSet};

/// An unresolved three-way conflict on one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub document: String,
    pub tbl: String,
    pub pk: String,
    /// The contested columns.
    pub columns: Vec<String>,
    /// Row image at the common ancestor.
    pub base: Option<Row>,
    /// Our side of the divergence (the live row).
    pub ours: Option<Row>,
    /// Their side (base overlaid with the remote changes).
    pub theirs: Option<Row>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    Ours,
    Theirs,
    Base,
}

impl Conflict {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Conflict> {
        let columns: String = row.get("columns")?;
        let parse_image = |raw: Option<String>| -> Result<Option<Row>> {
            Ok(match raw {
                Some(raw) => Some(row_from_json(&serde_json::from_str(&raw)?)),
                None => None,
            })
        };
        Ok(Conflict {
            document: row.get("document")?,
            tbl: row.get("tbl")?,
            pk: row.get("pk")?,
            columns: serde_json::from_str(&columns)?,
            base: parse_image(row.get("base")?)?,
            ours: parse_image(row.get("ours")?)?,
            theirs: parse_image(row.get("theirs")?)?,
        })
    }
}

const SELECT_CONFLICTS: &str =
    "SELECT document, tbl, pk, columns, base, ours, theirs FROM crr_conflicts";

fn save_conflict(conn: &Connection, conflict: &Conflict) -> Result<()> {
    let image = |row: &Option<Row>| -> Result<Option<String>> {
        Ok(match row {
            Some(row) => Some(serde_json::to_string(&row_to_json(row))?),
            None => None,
        })
    };
    conn.execute_cached(
        "INSERT OR REPLACE INTO crr_conflicts (document, tbl, pk, columns, base, ours, theirs)
         VALUES (:document, :tbl, :pk, :columns, :base, :ours, :theirs)",
        named_params! {
            ":document": conflict.document,
            ":tbl": conflict.tbl,
            ":pk": conflict.pk,
            ":columns": serde_json::to_string(&conflict.columns)?,
            ":base": image(&conflict.base)?,
            ":ours": image(&conflict.ours)?,
            ":theirs": image(&conflict.theirs)?,
        },
    )?;
    Ok(())
}

fn get_conflict(
    conn: &Connection,
    document: &str,
    tbl: &str,
    pk: &str,
) -> Result<Option<Conflict>> {
    conn.try_query_row(
        &format!(
            "{} WHERE document = :document AND tbl = :tbl AND pk = :pk",
            SELECT_CONFLICTS
        ),
        named_params! { ":document": document, ":tbl": tbl, ":pk": pk },
        Conflict::from_row,
        true,
    )
}

/// The live row as a plain map, straight from the user table.
fn read_live_row(
    conn: &Connection,
    registry: &Registry,
    tbl: &str,
    encoded_pk: &str,
) -> Result<Option<Row>> {
    let table = registry.table(tbl)?;
    let cols: Vec<String> = table
        .replicated_columns()
        .map(|c| pk::ident(&c.name))
        .collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        cols.join(", "),
        pk::ident(tbl),
        pk::where_clause(table),
    );
    let params: Vec<SqlValue> = pk::decode(encoded_pk)
        .into_iter()
        .map(SqlValue::Text)
        .collect();
    conn.try_query_row(
        &sql,
        rusqlite::params_from_iter(params),
        |row| -> Result<Row> {
            let mut out = Row::new();
            for (i, col) in table.replicated_columns().enumerate() {
                out.insert(col.name.clone(), row.get(i)?);
            }
            Ok(out)
        },
        false,
    )
}

impl CrrDb {
    pub fn get_conflicts(&self, table: &str, document: &str) -> Result<Vec<Conflict>> {
        self.conn().query_rows_and_then_cached(
            &format!(
                "{} WHERE document = :document AND tbl = :tbl ORDER BY pk",
                SELECT_CONFLICTS
            ),
            named_params! { ":document": document, ":tbl": table },
            Conflict::from_row,
        )
    }

    /// Settle a conflict: per contested column, write the chosen side's
    /// value as a fresh tracked change, then drop the record.
    pub fn resolve_conflict(
        &self,
        table: &str,
        pk: &str,
        document: &str,
        choices: &[(String, ConflictChoice)],
    ) -> Result<()> {
        let registry = Registry::load(self.conn())?;
        let table_info = registry.table(table)?;
        let conflict = get_conflict(self.conn(), document, table, pk)?
            .ok_or_else(|| Error::UnknownConflict(table.to_string(), pk.to_string()))?;

        let mut sets = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for (column, choice) in choices {
            let image = match choice {
                ConflictChoice::Ours => &conflict.ours,
                ConflictChoice::Theirs => &conflict.theirs,
                ConflictChoice::Base => &conflict.base,
            };
            let value = image
                .as_ref()
                .and_then(|row| row.get(column))
                .cloned()
                .unwrap_or(SqlValue::Null);
            sets.push(format!("{} = ?", pk::ident(column)));
            params.push(value);
        }
        if !sets.is_empty() {
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                pk::ident(table),
                sets.join(", "),
                pk::where_clause(table_info),
            );
            params.extend(pk::decode(pk).into_iter().map(SqlValue::Text));
            self.exec_track_changes(&sql, &params, document)?;
        }
        self.conn().execute_cached(
            "DELETE FROM crr_conflicts WHERE document = :document AND tbl = :tbl AND pk = :pk",
            named_params! { ":document": document, ":tbl": table, ":pk": pk },
        )?;
        Ok(())
    }
}

/// Append remote history when we have nothing of our own past the common
/// ancestor: apply each batch, store the commits, advance the head.
pub(crate) fn fast_forward(
    db: &CrrDb,
    document: &str,
    incoming_commits: &[Commit],
    incoming_changes: &[Vec<Change>],
) -> Result<()> {
    for (commit, batch) in incoming_commits.iter().zip(incoming_changes) {
        db.apply_changes(batch)?;
        let mut commit = commit.clone();
        commit.applied_at = commits::next_applied_at(db.conn())?;
        let tx = db.conn().unchecked_transaction_exclusive()?;
        commits::insert_commit(&tx, &commit)?;
        db::set_head(&tx, document, Some(&commit.id))?;
        tx.commit()?;
    }
    log::debug!(
        "fast-forwarded '{}' over {} commit(s)",
        document,
        incoming_commits.len()
    );
    Ok(())
}

/// Three-way merge of divergent local and remote history.
pub(crate) fn merge_remote(
    db: &CrrDb,
    document: &str,
    incoming_commits: &[Commit],
    incoming_changes: &[Vec<Change>],
) -> Result<()> {
    let registry = Registry::load(db.conn())?;
    let their_head = match incoming_commits.last() {
        Some(c) => c.id.clone(),
        None => return Ok(()),
    };

    let tx = db.conn().unchecked_transaction_exclusive()?;
    db::ensure_document(&tx, document)?;
    let our_head = db::head(&tx, document)?
        .ok_or_else(|| Error::Invariant("three-way merge without a local head".into()))?;
    let doc = db::get_document(&tx, document)?
        .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;

    // Local divergence: changes of every commit past the common ancestor,
    // plus the working copy.
    let base = doc.last_pulled_commit.clone();
    let base_set: BTreeSet<String> = match &base {
        Some(b) => commits::ancestor_ids(&tx, b)?.into_iter().collect(),
        None => BTreeSet::new(),
    };
    let local_versions: Vec<String> = commits::ancestor_ids(&tx, &our_head)?
        .into_iter()
        .filter(|id| !base_set.contains(id))
        .collect();
    let mut local = changes::changes_for_versions(&tx, &local_versions)?;
    local.extend(changes::uncommitted(&tx, document)?);

    // Sort remote changes into accepted / recorded-only / conflicted.
    let remote: Vec<&Change> = incoming_changes.iter().flatten().collect();
    let mut accepted: Vec<Change> = Vec::new();
    let mut conflicted: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for r in &remote {
        let contested = local
            .iter()
            .find(|l| l.tbl == r.tbl && l.pk == r.pk && l.col == r.col && l.value != r.value);
        match contested {
            None => accepted.push((*r).clone()),
            Some(l) => {
                let manual = registry
                    .get(&r.tbl)
                    .and_then(|t| t.column(&r.col))
                    .map(|c| c.manual_conflict)
                    .unwrap_or(false);
                if manual {
                    conflicted
                        .entry((r.tbl.clone(), r.pk.clone()))
                        .or_default()
                        .push(r.col.clone());
                } else if changes::wins_over(r, l) {
                    accepted.push((*r).clone());
                }
                // A losing remote change is recorded below, not applied.
            }
        }
    }

    session::set_time_travelling(&tx, true)?;
    let applied = apply::apply_changes_in_tx(&tx, &registry, &accepted)?;

    // Keep the full remote history and its commits so we can serve them to
    // later pullers.
    for (commit, batch) in incoming_commits.iter().zip(incoming_changes) {
        for change in batch {
            changes::insert_ignore(&tx, change)?;
        }
        let mut commit = commit.clone();
        commit.applied_at = commits::next_applied_at(&tx)?;
        commits::insert_commit(&tx, &commit)?;
    }

    // Park manual conflicts. `theirs` is the base image overlaid with the
    // remote changes of the row.
    let conflict_count = conflicted.len();
    let base_snapshot = match &base {
        Some(b) => Some(snapshot::document_snapshot(&tx, &registry, document, b)?),
        None => None,
    };
    for ((tbl, row_pk), mut columns) in conflicted {
        columns.sort();
        columns.dedup();
        let base_row = base_snapshot
            .as_ref()
            .and_then(|s| s.get_row(&tbl, &row_pk).cloned());
        let ours = read_live_row(&tx, &registry, &tbl, &row_pk)?;
        let mut theirs = base_row.clone().unwrap_or_default();
        for r in &remote {
            if r.tbl == tbl && r.pk == row_pk && !r.is_tombstone() {
                theirs.insert(r.col.clone(), r.value.clone());
            }
        }
        save_conflict(
            &tx,
            &Conflict {
                document: document.to_string(),
                tbl,
                pk: row_pk,
                columns,
                base: base_row,
                ours,
                theirs: Some(theirs),
            },
        )?;
    }

    // Tie the histories together: a merge commit with both heads as
    // parents, carrying whatever the merge itself produced (counter
    // changes and the like) plus the local working copy.
    let clock = session::send_clock(&tx)?;
    let merge_commit = Commit {
        id: random_id(),
        document: document.to_string(),
        parent: Some(format!("{}|{}", their_head, our_head)),
        message: format!("Merge {} into {}", their_head, our_head),
        author: session::local_site(&tx)?,
        created_at: clock,
        applied_at: commits::next_applied_at(&tx)?,
    };
    changes::promote_uncommitted(&tx, document, &merge_commit.id)?;
    commits::insert_commit(&tx, &merge_commit)?;
    db::set_head(&tx, document, Some(&merge_commit.id))?;
    session::set_time_travelling(&tx, false)?;
    tx.commit()?;

    log::debug!(
        "merged {} remote commit(s) into '{}' ({} conflict(s))",
        incoming_commits.len(),
        document,
        conflict_count
    );
    let tables: BTreeSet<String> = applied.iter().map(|c| c.tbl.clone()).collect();
    db.notify_tables(document, tables.into_iter().collect());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DEFAULT_DOCUMENT;
    use crate::registry::TableOptions;

    fn new_db() -> CrrDb {
        let _ = env_logger::try_init();
        let db = CrrDb::open_in_memory().unwrap();
        db.conn()
            .execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT);")
            .unwrap();
        db.upgrade_table(
            "todos",
            &TableOptions {
                manual_conflict: &["title"],
                ..TableOptions::default()
            },
        )
        .unwrap();
        db.finalize().unwrap();
        db
    }

    #[test]
    fn test_conflict_record_round_trip() {
        let db = new_db();
        let mut base = Row::new();
        base.insert("id".into(), SqlValue::Integer(1));
        base.insert("title".into(), SqlValue::Text("A".into()));
        let mut ours = base.clone();
        ours.insert("title".into(), SqlValue::Text("C".into()));
        let mut theirs = base.clone();
        theirs.insert("title".into(), SqlValue::Text("B".into()));

        let conflict = Conflict {
            document: DEFAULT_DOCUMENT.into(),
            tbl: "todos".into(),
            pk: "1".into(),
            columns: vec!["title".into()],
            base: Some(base),
            ours: Some(ours),
            theirs: Some(theirs),
        };
        save_conflict(db.conn(), &conflict).unwrap();
        let loaded = db.get_conflicts("todos", DEFAULT_DOCUMENT).unwrap();
        assert_eq!(loaded, vec![conflict]);
    }

    #[test]
    fn test_resolve_conflict_writes_choice_and_clears() {
        let db = new_db();
        db.exec_track_changes(
            "INSERT INTO todos (id, title) VALUES (1, 'C')",
            &[],
            DEFAULT_DOCUMENT,
        )
        .unwrap();
        let mut base = Row::new();
        base.insert("id".into(), SqlValue::Integer(1));
        base.insert("title".into(), SqlValue::Text("A".into()));
        let mut theirs = base.clone();
        theirs.insert("title".into(), SqlValue::Text("B".into()));
        save_conflict(
            db.conn(),
            &Conflict {
                document: DEFAULT_DOCUMENT.into(),
                tbl: "todos".into(),
                pk: "1".into(),
                columns: vec!["title".into()],
                base: Some(base),
                ours: None,
                theirs: Some(theirs),
            },
        )
        .unwrap();

        db.resolve_conflict(
            "todos",
            "1",
            DEFAULT_DOCUMENT,
            &[("title".into(), ConflictChoice::Theirs)],
        )
        .unwrap();

        let title: String = db
            .conn()
            .query_one("SELECT title FROM todos WHERE id = 1")
            .unwrap();
        assert_eq!(title, "B");
        assert!(db.get_conflicts("todos", DEFAULT_DOCUMENT).unwrap().is_empty());
        // Unknown conflicts error.
        assert!(matches!(
            db.resolve_conflict("todos", "1", DEFAULT_DOCUMENT, &[]),
            Err(Error::UnknownConflict(_, _))
        ));
    }
}
