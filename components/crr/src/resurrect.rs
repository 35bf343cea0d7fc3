/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Resurrection: restoring cascade-deleted ancestors.
//!
//! When a non-delete change arrives for a row whose parent chain includes a
//! cascade-deleted ancestor, add-wins semantics say the edit beats the
//! delete - unless some ancestor's tombstone is newer than the edit, in
//! which case the delete stands and the edit is only recorded, not
//! materialized.
//!
//! The walk goes up the ON-DELETE-CASCADE foreign keys collecting missing
//! ancestors, then rebuilds from the root down, re-inserting each ancestor
//! from its change history and reviving any cascade children that have no
//! active tombstone of their own.

use crate::changes;
use crate::clock::Hlc;
use crate::error::Result;
use crate::pk;
use crate::registry::{ColumnInfo, Registry, TableInfo};
use crate::snapshot;
use rusqlite::Connection;
use std::collections::BTreeSet;

/// Make sure every cascade ancestor of `(table, pk)` exists, reviving
/// deleted ones. Returns `false` when an ancestor's tombstone is newer
/// than `incoming` - the delete wins and the caller must not materialize
/// the row.
pub(crate) fn ensure_ancestors(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    encoded_pk: &str,
    incoming: Hlc,
) -> Result<bool> {
    let mut missing: Vec<(String, String)> = Vec::new();
    let mut visited = BTreeSet::new();
    visited.insert((table.name.clone(), encoded_pk.to_string()));
    if !collect_missing_ancestors(conn, registry, table, encoded_pk, incoming, &mut missing, &mut visited)? {
        return Ok(false);
    }
    // `missing` was pushed child-to-root; rebuild root-first.
    for (tbl, ancestor_pk) in missing.iter().rev() {
        let ancestor_table = registry.table(tbl)?;
        changes::cancel_tombstones(conn, tbl, ancestor_pk)?;
        if let Some(row) = snapshot::reconstruct_row(conn, ancestor_table, ancestor_pk)? {
            log::debug!("resurrecting {} '{}'", tbl, ancestor_pk);
            snapshot::insert_row_ignore(conn, ancestor_table, &row)?;
        } else {
            log::error!(
                "cannot resurrect {} '{}': no change history",
                tbl,
                ancestor_pk
            );
            continue;
        }
        let mut seen = BTreeSet::new();
        revive_children(conn, registry, ancestor_table, ancestor_pk, &mut seen)?;
    }
    Ok(true)
}

fn collect_missing_ancestors(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    encoded_pk: &str,
    incoming: Hlc,
    missing: &mut Vec<(String, String)>,
    visited: &mut BTreeSet<(String, String)>,
) -> Result<bool> {
    for fk_col in table.cascade_fk_columns() {
        let fk = fk_col.fk.as_ref().unwrap();
        let parent_table = match registry.get(&fk.table) {
            Some(t) => t,
            // Parent isn't replicated; nothing for us to revive.
            None => continue,
        };
        let parent_pk = match parent_pk_for(conn, table, encoded_pk, fk_col, parent_table)? {
            Some(pk) => pk,
            None => continue,
        };
        if snapshot::row_exists(conn, parent_table, &parent_pk)? {
            continue;
        }
        let key = (parent_table.name.clone(), parent_pk.clone());
        if !visited.insert(key) {
            continue;
        }
        if let Some(ts) = changes::latest_tombstone(conn, &parent_table.name, &parent_pk)? {
            if ts.is_active_tombstone() && ts.created_at > incoming {
                log::debug!(
                    "resurrection blocked: {} '{}' deleted at {} > {}",
                    parent_table.name,
                    parent_pk,
                    ts.created_at,
                    incoming
                );
                return Ok(false);
            }
        }
        missing.push((parent_table.name.clone(), parent_pk.clone()));
        if !collect_missing_ancestors(
            conn,
            registry,
            parent_table,
            &parent_pk,
            incoming,
            missing,
            visited,
        )? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The encoded pk of the parent row referenced by `fk_col` of
/// `(table, encoded_pk)`, per the current state of row/log.
fn parent_pk_for(
    conn: &Connection,
    table: &TableInfo,
    encoded_pk: &str,
    fk_col: &ColumnInfo,
    parent_table: &TableInfo,
) -> Result<Option<String>> {
    let fk = fk_col.fk.as_ref().unwrap();
    let value = match snapshot::current_cell_value(conn, table, encoded_pk, &fk_col.name)? {
        Some(v) if !v.is_null() => v,
        _ => return Ok(None),
    };
    // Composite-pk parents would need a multi-column foreign key to address
    // them; we follow the referenced column only when it's the whole pk.
    if parent_table.pk_cols.len() != 1 || parent_table.pk_cols[0] != fk.column {
        log::warn!(
            "cascade walk skipping {}.{}: referenced column '{}' is not the pk of '{}'",
            table.name,
            fk_col.name,
            fk.column,
            parent_table.name
        );
        return Ok(None);
    }
    Ok(Some(value.as_sort_text()))
}

/// After reviving `(table, pk)`, revive its cascade children whose own
/// latest tombstone is not active - they were deleted by the cascade, not
/// on purpose.
fn revive_children(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    encoded_pk: &str,
    seen: &mut BTreeSet<(String, String)>,
) -> Result<()> {
    for (child_table, fk_col) in registry.cascade_children(&table.name) {
        let fk = fk_col.fk.as_ref().unwrap();
        let parent_part = match table.pk_position(&fk.column) {
            Some(i) => match pk::decode(encoded_pk).get(i) {
                Some(part) => part.clone(),
                None => continue,
            },
            None => match snapshot::current_cell_value(conn, table, encoded_pk, &fk.column)? {
                Some(v) => v.as_sort_text(),
                None => continue,
            },
        };
        let child_pks =
            changes::row_pks_with_cell_value(conn, &child_table.name, &fk_col.name, &parent_part)?;
        for child_pk in child_pks {
            let key = (child_table.name.clone(), child_pk.clone());
            if !seen.insert(key) {
                continue;
            }
            if snapshot::row_exists(conn, child_table, &child_pk)? {
                continue;
            }
            if let Some(ts) = changes::latest_tombstone(conn, &child_table.name, &child_pk)? {
                if ts.is_active_tombstone() {
                    // Deleted in its own right; stays dead.
                    continue;
                }
            }
            if let Some(row) = snapshot::reconstruct_row(conn, child_table, &child_pk)? {
                log::debug!("reviving cascade child {} '{}'", child_table.name, child_pk);
                snapshot::insert_row_ignore(conn, child_table, &row)?;
                revive_children(conn, registry, child_table, &child_pk, seen)?;
            }
        }
    }
    Ok(())
}
