/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The apply engine: merging foreign change batches.
//!
//! Batches arrive in any order; the engine partitions them into
//! `(table, pk, type)` groups, replays the groups in clock order, and
//! resolves each cell by last-writer-wins. Deletes follow the hybrid
//! add-wins policy: a delete loses to any newer write on the row or on any
//! row reachable through ON-DELETE-CASCADE foreign keys.
//!
//! The whole batch runs in one exclusive transaction with
//! `time_travelling` set, so the triggers stay quiet and a failure leaves
//! nothing half-applied. Log rows are persisted even for changes that lose
//! or are blocked; only the user-table materialization is conditional.

use crate::changes::{self, Change, ChangeKind, TOMBSTONE_COLUMN, UNCOMMITTED};
use crate::clock::Hlc;
use crate::db::{self, session, CrrDb};
use crate::error::Result;
use crate::fractindex;
use crate::pk;
use crate::registry::{ColumnKind, Registry, TableInfo};
use crate::resurrect;
use crate::snapshot;
use crate::types::{Row, SqlValue, Timestamp};
use rusqlite::Connection;
use sql_support::ConnExt;
use std::collections::{BTreeMap, BTreeSet};

impl CrrDb {
    /// Apply a batch of foreign changes (one document). Returns the subset
    /// that was materialized into the user tables; every incoming row is
    /// persisted to the log regardless.
    pub fn apply_changes(&self, incoming: &[Change]) -> Result<Vec<Change>> {
        if incoming.is_empty() {
            return Ok(Vec::new());
        }
        let registry = Registry::load(self.conn())?;
        let document = incoming[0].document.clone();
        let tx = self.conn().unchecked_transaction_exclusive()?;
        db::ensure_document(&tx, &document)?;
        session::set_time_travelling(&tx, true)?;
        let applied = apply_changes_in_tx(&tx, &registry, incoming)?;
        session::set_time_travelling(&tx, false)?;
        tx.commit()?;
        let tables: BTreeSet<String> = applied.iter().map(|c| c.tbl.clone()).collect();
        self.notify_tables(&document, tables.into_iter().collect());
        Ok(applied)
    }

    /// The document's working copy, in clock order. This is what `commit`
    /// would promote.
    pub fn uncommitted_changes(&self, document: &str) -> Result<Vec<Change>> {
        changes::uncommitted(self.conn(), document)
    }
}

/// The batch body, for callers that already hold the transaction (the
/// three-way merge does).
pub(crate) fn apply_changes_in_tx(
    conn: &Connection,
    registry: &Registry,
    incoming: &[Change],
) -> Result<Vec<Change>> {
    let local_site = session::local_site(conn)?;
    let mut seen_sites: BTreeSet<&str> = BTreeSet::new();
    for change in incoming {
        if change.site_id != local_site && seen_sites.insert(change.site_id.as_str()) {
            changes::record_site(conn, &change.site_id)?;
        }
    }

    // Partition into (table, pk, type) groups, each sorted by clock, then
    // process the groups in clock order. Network reordering dies here.
    // `applied_at` records when *this* replica stored the row, so re-stamp.
    let now = Timestamp::now();
    let mut grouped: BTreeMap<(String, String, &'static str), Vec<Change>> = BTreeMap::new();
    for change in incoming {
        let mut change = change.clone();
        change.applied_at = now;
        grouped
            .entry((
                change.tbl.clone(),
                change.pk.clone(),
                change.kind.as_str(),
            ))
            .or_default()
            .push(change);
    }
    let mut groups: Vec<Vec<Change>> = grouped.into_values().collect();
    for group in &mut groups {
        group.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    }
    groups.sort_by(|a, b| a[0].created_at.cmp(&b[0].created_at));

    let mut applied: Vec<Change> = Vec::new();
    let mut max_clock: Option<Hlc> = None;
    // (table, column, pk) cells that touched a fractional index; repaired
    // after all groups land.
    let mut frac_cells: BTreeSet<(String, String, String)> = BTreeSet::new();

    for group in &groups {
        let first = &group[0];
        for change in group {
            max_clock = Some(match max_clock {
                Some(m) if m >= change.created_at => m,
                _ => change.created_at,
            });
        }
        let table = match registry.get(&first.tbl) {
            Some(t) => t,
            None => {
                // Not upgraded here (yet): keep the history, skip the rows.
                log::warn!("ignoring changes for unknown table '{}'", first.tbl);
                for change in group {
                    changes::insert_ignore(conn, change)?;
                }
                continue;
            }
        };
        for change in group {
            if let Some(col) = table.column(&change.col) {
                if col.kind == ColumnKind::FractionalIndex {
                    frac_cells.insert((change.tbl.clone(), change.col.clone(), change.pk.clone()));
                }
            }
        }
        match first.kind {
            ChangeKind::Insert => apply_insert_group(conn, registry, table, group, &mut applied)?,
            ChangeKind::Update => apply_update_group(conn, registry, table, group, &mut applied)?,
            ChangeKind::Delete => {
                apply_delete_group(conn, registry, table, group, &local_site, &mut applied)?
            }
        }
    }

    // Fold the observed clocks into ours so our next local write is newer
    // than anything we just saw.
    if let Some(observed) = max_clock {
        session::receive_clock(conn, observed)?;
    }

    repair_fractional_lists(conn, registry, &frac_cells)?;
    Ok(applied)
}

fn apply_insert_group(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    group: &[Change],
    applied: &mut Vec<Change>,
) -> Result<()> {
    for change in group {
        changes::insert_ignore(conn, change)?;
    }
    let newest = group.last().unwrap();
    if let Some(ts) = changes::latest_tombstone(conn, &table.name, &newest.pk)? {
        if ts.is_active_tombstone() {
            if ts.created_at > newest.created_at {
                log::debug!(
                    "insert of {} '{}' loses to newer tombstone",
                    table.name,
                    newest.pk
                );
                return Ok(());
            }
            changes::cancel_tombstones(conn, &table.name, &newest.pk)?;
        }
    }
    if !resurrect::ensure_ancestors(conn, registry, table, &newest.pk, newest.created_at)? {
        return Ok(());
    }
    let mut row = Row::new();
    for change in group {
        // A peer can know columns we don't; their history is kept, but we
        // can only materialize what our schema has.
        if table.column(&change.col).is_some() {
            row.insert(change.col.clone(), change.value.clone());
        }
    }
    complete_pk_columns(table, &newest.pk, &mut row);
    snapshot::insert_row_ignore(conn, table, &row)?;
    applied.extend_from_slice(group);
    Ok(())
}

fn apply_update_group(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    group: &[Change],
    applied: &mut Vec<Change>,
) -> Result<()> {
    let newest = group.last().unwrap();
    let encoded_pk = &newest.pk;

    if let Some(ts) = changes::latest_tombstone(conn, &table.name, encoded_pk)? {
        if ts.is_active_tombstone() {
            if ts.created_at > newest.created_at {
                // The delete stands; keep the history for later resolution.
                for change in group {
                    changes::insert_ignore(conn, change)?;
                }
                return Ok(());
            }
            // Add-wins: the newer edit revives the row.
            changes::cancel_tombstones(conn, &table.name, encoded_pk)?;
        }
    }

    let mut row_present = snapshot::row_exists(conn, table, encoded_pk)?;
    if !row_present {
        if !resurrect::ensure_ancestors(conn, registry, table, encoded_pk, newest.created_at)? {
            for change in group {
                changes::insert_ignore(conn, change)?;
            }
            return Ok(());
        }
        // The walk may have revived the row itself along with its parents.
        row_present = snapshot::row_exists(conn, table, encoded_pk)?;
    }

    for change in group {
        if table.column(&change.col).is_none() {
            changes::insert_ignore(conn, change)?;
            continue;
        }
        let prior =
            changes::latest_live_cell_change(conn, &table.name, &change.col, encoded_pk)?;
        let accept = match &prior {
            Some(p) => changes::wins_over(change, p),
            // No prior writer: the incoming wins by default.
            None => true,
        };
        if !accept {
            changes::insert_ignore(conn, change)?;
            log::trace!(
                "update of {}.{} '{}' loses lww to {}",
                table.name,
                change.col,
                encoded_pk,
                prior.as_ref().map(|p| p.site_id.as_str()).unwrap_or("?")
            );
            continue;
        }
        changes::save(conn, change)?;
        let is_fk_column = table
            .column(&change.col)
            .map(|c| c.fk.is_some())
            .unwrap_or(false);
        if is_fk_column {
            changes::mirror_fk_onto_inserts(conn, &table.name, &change.col, encoded_pk, &change.value)?;
        }
        if row_present {
            let sql = format!(
                "UPDATE {} SET {} = ? WHERE {}",
                pk::ident(&table.name),
                pk::ident(&change.col),
                pk::where_clause(table),
            );
            let mut params: Vec<SqlValue> = vec![change.value.clone()];
            params.extend(pk::decode(encoded_pk).into_iter().map(SqlValue::Text));
            conn.execute_cached(&sql, rusqlite::params_from_iter(params))?;
        }
        applied.push(change.clone());
    }

    if !row_present {
        // The accepted cells are in the log now; rebuild the whole row.
        if let Some(row) = snapshot::reconstruct_row(conn, table, encoded_pk)? {
            snapshot::insert_row_ignore(conn, table, &row)?;
        }
    }
    Ok(())
}

fn apply_delete_group(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    group: &[Change],
    local_site: &str,
    applied: &mut Vec<Change>,
) -> Result<()> {
    let ts = group.last().unwrap();

    if !ts.is_active_tombstone() {
        // A peer already cancelled this delete; agree with it.
        for change in group {
            changes::save(conn, change)?;
        }
        changes::cancel_tombstones(conn, &table.name, &ts.pk)?;
        return Ok(());
    }

    // If this exact tombstone is already stored as cancelled, re-applying it
    // must stay a no-op (no second counter change).
    let already_cancelled = changes::get(
        conn,
        ChangeKind::Delete,
        &table.name,
        TOMBSTONE_COLUMN,
        &ts.pk,
        &ts.version,
    )?
    .map(|stored| !stored.is_active_tombstone())
    .unwrap_or(false);

    match newest_conflict_in_subtree(conn, registry, table, ts)? {
        Some(conflicting) => {
            log::debug!(
                "delete of {} '{}' cancelled by {} write at {}",
                table.name,
                ts.pk,
                conflicting.site_id,
                conflicting.created_at
            );
            let mut cancelled = ts.clone();
            cancelled.value = SqlValue::Integer(0);
            changes::save(conn, &cancelled)?;
            changes::cancel_tombstones(conn, &table.name, &ts.pk)?;
            if !already_cancelled {
                // Re-assert the winning write so peers that saw the delete
                // win learn about the cancellation.
                emit_counter_change(conn, local_site, &conflicting)?;
            }
            if !snapshot::row_exists(conn, table, &ts.pk)? {
                if let Some(row) = snapshot::reconstruct_row(conn, table, &ts.pk)? {
                    snapshot::insert_row_ignore(conn, table, &row)?;
                }
            }
        }
        None => {
            for change in group {
                changes::save(conn, change)?;
            }
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                pk::ident(&table.name),
                pk::where_clause(table),
            );
            let params: Vec<SqlValue> = pk::decode(&ts.pk)
                .into_iter()
                .map(SqlValue::Text)
                .collect();
            // ON DELETE CASCADE constraints take the children with it.
            conn.execute_cached(&sql, rusqlite::params_from_iter(params))?;
            applied.extend_from_slice(group);
        }
    }
    Ok(())
}

/// The newest change cancelling `ts`: any non-delete write on the row - or
/// on a row transitively reachable through cascade foreign keys - from a
/// different site, at or after the delete's clock.
fn newest_conflict_in_subtree(
    conn: &Connection,
    registry: &Registry,
    table: &TableInfo,
    ts: &Change,
) -> Result<Option<Change>> {
    fn walk(
        conn: &Connection,
        registry: &Registry,
        table: &TableInfo,
        encoded_pk: &str,
        site: &str,
        clock: Hlc,
        visited: &mut BTreeSet<(String, String)>,
    ) -> Result<Option<Change>> {
        if !visited.insert((table.name.clone(), encoded_pk.to_string())) {
            return Ok(None);
        }
        if let Some(c) =
            changes::newest_conflicting_change(conn, &table.name, encoded_pk, site, clock)?
        {
            return Ok(Some(c));
        }
        for (child_table, fk_col) in registry.cascade_children(&table.name) {
            let fk = fk_col.fk.as_ref().unwrap();
            let parent_part = match table.pk_position(&fk.column) {
                Some(i) => match pk::decode(encoded_pk).get(i) {
                    Some(part) => part.clone(),
                    None => continue,
                },
                None => continue,
            };
            let child_pks = changes::row_pks_with_cell_value(
                conn,
                &child_table.name,
                &fk_col.name,
                &parent_part,
            )?;
            for child_pk in child_pks {
                if let Some(c) = walk(conn, registry, child_table, &child_pk, site, clock, visited)?
                {
                    return Ok(Some(c));
                }
            }
        }
        Ok(None)
    }
    let mut visited = BTreeSet::new();
    walk(
        conn,
        registry,
        table,
        &ts.pk,
        &ts.site_id,
        ts.created_at,
        &mut visited,
    )
}

/// Replay the newest conflicting change as a fresh local write, so the
/// cancellation of a delete propagates on the next sync.
fn emit_counter_change(conn: &Connection, local_site: &str, conflicting: &Change) -> Result<Change> {
    let clock = session::send_clock(conn)?;
    let counter = Change {
        kind: ChangeKind::Update,
        tbl: conflicting.tbl.clone(),
        col: conflicting.col.clone(),
        pk: conflicting.pk.clone(),
        value: conflicting.value.clone(),
        site_id: local_site.to_string(),
        created_at: clock,
        applied_at: Timestamp::now(),
        version: UNCOMMITTED.to_string(),
        document: conflicting.document.clone(),
    };
    changes::save(conn, &counter)?;
    log::debug!(
        "emitted counter change for {}.{} '{}'",
        counter.tbl,
        counter.col,
        counter.pk
    );
    Ok(counter)
}

fn repair_fractional_lists(
    conn: &Connection,
    registry: &Registry,
    frac_cells: &BTreeSet<(String, String, String)>,
) -> Result<()> {
    // Several cells may land in the same list; repair each list once.
    let mut lists: BTreeMap<(String, String, String), SqlValue> = BTreeMap::new();
    for (tbl, col, encoded_pk) in frac_cells {
        let table = registry.table(tbl)?;
        let col_info = match table.column(col) {
            Some(c) => c,
            None => continue,
        };
        let parent_col = match &col_info.parent_col {
            Some(p) => p.as_str(),
            None => {
                log::error!("fractional column {}.{} has no parent column", tbl, col);
                continue;
            }
        };
        let parent = snapshot::current_cell_value(conn, table, encoded_pk, parent_col)?
            .unwrap_or(SqlValue::Null);
        lists.insert((tbl.clone(), col.clone(), parent.as_sort_text()), parent);
    }
    for ((tbl, col, _), parent) in lists {
        let table = registry.table(&tbl)?;
        if let Some(col_info) = table.column(&col) {
            fractindex::fix_collisions(conn, table, col_info, &parent)?;
        }
    }
    Ok(())
}

fn complete_pk_columns(table: &TableInfo, encoded_pk: &str, row: &mut Row) {
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
}
