/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The schema registry: which tables are replicated, how each column merges,
//! and how tables relate through foreign keys.
//!
//! `upgrade_table` snapshots the engine's own metadata (`pragma table_info`,
//! `pragma foreign_key_list`) into `crr_columns`; everything downstream -
//! triggers, the apply engine, snapshots - works from a `Registry` loaded
//! from that table, never from SQLite reflection at merge time.

use crate::error::{Error, Result};
use rusqlite::{named_params, Connection};
use sql_support::ConnExt;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Last-writer-wins register (the default).
    Lww,
    /// Fractional index ordering key.
    FractionalIndex,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Lww => "lww",
            ColumnKind::FractionalIndex => "fractional_index",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lww" => Ok(ColumnKind::Lww),
            "fractional_index" => Ok(ColumnKind::FractionalIndex),
            _ => Err(Error::Invariant(format!("unknown column kind '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
    Restrict,
    NoAction,
}

impl OnDelete {
    pub fn as_str(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::NoAction => "NO_ACTION",
        }
    }

    fn from_str(s: &str) -> Self {
        // SQLite reports "NO ACTION", "SET NULL" etc.; anything we don't
        // give cascade semantics to behaves like NO_ACTION here.
        match s {
            "CASCADE" => OnDelete::Cascade,
            "RESTRICT" => OnDelete::Restrict,
            _ => OnDelete::NoAction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referenced (parent) table.
    pub table: String,
    /// Referenced column on the parent.
    pub column: String,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub table: String,
    pub name: String,
    pub kind: ColumnKind,
    pub fk: Option<ForeignKey>,
    /// For fractional-index columns: the column whose value groups rows
    /// into one ordered list.
    pub parent_col: Option<String>,
    pub replicate: bool,
    pub manual_conflict: bool,
    /// 0 for non-pk columns, 1-based position within the pk otherwise.
    pub pk_ordinal: u32,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// Primary key columns, in declared order.
    pub pk_cols: Vec<String>,
    pub columns: BTreeMap<String, ColumnInfo>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.get(name)
    }

    /// Columns the triggers capture, pk columns included.
    pub fn replicated_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.values().filter(|c| c.replicate)
    }

    pub fn fractional_columns(&self) -> Vec<&ColumnInfo> {
        self.columns
            .values()
            .filter(|c| c.kind == ColumnKind::FractionalIndex)
            .collect()
    }

    /// Foreign-key columns whose delete action cascades; the delete policy
    /// and resurrection walk these edges.
    pub fn cascade_fk_columns(&self) -> Vec<&ColumnInfo> {
        self.columns
            .values()
            .filter(|c| {
                matches!(&c.fk, Some(fk) if fk.on_delete == OnDelete::Cascade)
            })
            .collect()
    }

    /// 0-based position of `column` within the encoded pk, if it is part of
    /// the pk.
    pub fn pk_position(&self, column: &str) -> Option<usize> {
        self.pk_cols.iter().position(|c| c == column)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    tables: BTreeMap<String, TableInfo>,
}

impl Registry {
    /// Snapshot `crr_columns` into memory. Cheap enough to do once per
    /// entry point; the snapshot stays consistent for the transaction.
    pub fn load(conn: &Connection) -> Result<Registry> {
        let mut tables: BTreeMap<String, TableInfo> = BTreeMap::new();
        let columns = conn.query_rows_and_then_cached(
            "SELECT tbl, col, type, fk_tbl, fk_col, fk_on_delete, parent_col,
                    replicate, manual_conflict, pk_ordinal
             FROM crr_columns
             ORDER BY tbl, col",
            [],
            |row| -> Result<ColumnInfo> {
                let fk_tbl: Option<String> = row.get("fk_tbl")?;
                let fk = match fk_tbl {
                    Some(table) => Some(ForeignKey {
                        table,
                        column: row.get("fk_col")?,
                        on_delete: OnDelete::from_str(&row.get::<_, String>("fk_on_delete")?),
                    }),
                    None => None,
                };
                Ok(ColumnInfo {
                    table: row.get("tbl")?,
                    name: row.get("col")?,
                    kind: ColumnKind::from_str(&row.get::<_, String>("type")?)?,
                    fk,
                    parent_col: row.get("parent_col")?,
                    replicate: row.get("replicate")?,
                    manual_conflict: row.get("manual_conflict")?,
                    pk_ordinal: row.get("pk_ordinal")?,
                })
            },
        )?;
        for col in columns {
            let entry = tables
                .entry(col.table.clone())
                .or_insert_with(|| TableInfo {
                    name: col.table.clone(),
                    pk_cols: Vec::new(),
                    columns: BTreeMap::new(),
                });
            entry.columns.insert(col.name.clone(), col);
        }
        for table in tables.values_mut() {
            let mut pks: Vec<(&u32, &String)> = table
                .columns
                .values()
                .filter(|c| c.pk_ordinal > 0)
                .map(|c| (&c.pk_ordinal, &c.name))
                .collect();
            pks.sort();
            table.pk_cols = pks.into_iter().map(|(_, name)| name.clone()).collect();
        }
        Ok(Registry { tables })
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    pub fn get(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn table(&self, name: &str) -> Result<&TableInfo> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotUpgraded(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// `(child table, fk column)` pairs that cascade from `parent`.
    pub fn cascade_children(&self, parent: &str) -> Vec<(&TableInfo, &ColumnInfo)> {
        let mut out = Vec::new();
        for table in self.tables.values() {
            for col in table.cascade_fk_columns() {
                if col.fk.as_ref().map(|fk| fk.table.as_str()) == Some(parent) {
                    out.push((table, col));
                }
            }
        }
        out
    }
}

/// Options for `upgrade_table`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions<'a> {
    /// Columns whose values should not leave this replica. They still exist
    /// locally; peers materialize them from the column default.
    pub non_replicated: &'a [&'a str],
    /// Columns whose conflicting three-way merges surface a conflict record
    /// instead of resolving by last writer.
    pub manual_conflict: &'a [&'a str],
}

/// Register `table` as a replicated relation: one `crr_columns` row per
/// column, defaulting everything to last-writer-wins. Idempotent; re-running
/// refreshes the metadata from the live schema.
pub fn upgrade_table(conn: &Connection, table: &str, opts: &TableOptions<'_>) -> Result<()> {
    let cols = conn.query_rows_and_then(
        "SELECT name, pk FROM pragma_table_info(?1)",
        [table],
        |row| -> Result<(String, u32)> { Ok((row.get("name")?, row.get("pk")?)) },
    )?;
    if cols.is_empty() {
        return Err(Error::NoSuchTable(table.to_string()));
    }
    if !cols.iter().any(|(_, pk)| *pk > 0) {
        return Err(Error::NoPrimaryKey(table.to_string()));
    }

    // `to` is NULL when the fk references the parent's implicit primary key.
    let fks = conn.query_rows_and_then(
        "SELECT \"table\", \"from\", \"to\", on_delete FROM pragma_foreign_key_list(?1)",
        [table],
        |row| -> Result<(String, String, Option<String>, String)> {
            Ok((
                row.get("table")?,
                row.get("from")?,
                row.get("to")?,
                row.get("on_delete")?,
            ))
        },
    )?;

    for (name, pk_ordinal) in cols {
        let fk = fks.iter().find(|(_, from, _, _)| *from == name);
        let (fk_tbl, fk_col, fk_on_delete) = match fk {
            Some((parent, _, to, on_delete)) => {
                let to_col = match to {
                    Some(c) => c.clone(),
                    None => first_pk_column(conn, parent)?,
                };
                (
                    Some(parent.clone()),
                    Some(to_col),
                    Some(OnDelete::from_str(on_delete).as_str().to_string()),
                )
            }
            None => (None, None, None),
        };
        conn.execute_cached(
            "INSERT INTO crr_columns (
                 tbl, col, type, fk_tbl, fk_col, fk_on_delete, parent_col,
                 replicate, manual_conflict, pk_ordinal
             )
             VALUES (:tbl, :col, 'lww', :fk_tbl, :fk_col, :fk_on_delete, NULL,
                     :replicate, :manual_conflict, :pk_ordinal)
             ON CONFLICT (tbl, col) DO UPDATE SET
                 fk_tbl = excluded.fk_tbl,
                 fk_col = excluded.fk_col,
                 fk_on_delete = excluded.fk_on_delete,
                 replicate = excluded.replicate,
                 manual_conflict = excluded.manual_conflict,
                 pk_ordinal = excluded.pk_ordinal",
            named_params! {
                ":tbl": table,
                ":col": name,
                ":fk_tbl": fk_tbl,
                ":fk_col": fk_col,
                ":fk_on_delete": fk_on_delete,
                ":replicate": !opts.non_replicated.contains(&name.as_str()),
                ":manual_conflict": opts.manual_conflict.contains(&name.as_str()),
                ":pk_ordinal": pk_ordinal,
            },
        )?;
    }
    log::debug!("upgraded table '{}' to a crr", table);
    Ok(())
}

/// Switch `column` to fractional-index semantics, grouped by
/// `parent_column`. The table must have been upgraded first.
pub fn upgrade_column_to_fractional_index(
    conn: &Connection,
    table: &str,
    column: &str,
    parent_column: &str,
) -> Result<()> {
    let n = conn.execute_cached(
        "UPDATE crr_columns SET type = 'fractional_index', parent_col = :parent
         WHERE tbl = :tbl AND col = :col",
        named_params! {
            ":parent": parent_column,
            ":tbl": table,
            ":col": column,
        },
    )?;
    if n == 0 {
        return Err(Error::UnknownColumn(table.to_string(), column.to_string()));
    }
    Ok(())
}

fn first_pk_column(conn: &Connection, table: &str) -> Result<String> {
    conn.try_query_row(
        "SELECT name FROM pragma_table_info(?1) WHERE pk = 1",
        [table],
        |row| -> Result<String> { Ok(row.get(0)?) },
        true,
    )?
    .ok_or_else(|| Error::NoPrimaryKey(table.to_string()))
}
