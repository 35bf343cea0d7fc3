/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Fractional index keys.
//!
//! An ordering column stores a string of base-62 digits; list order is the
//! lexicographic order of the keys. Between any two keys another key can be
//! found, so concurrent inserts never need to renumber siblings. Keys may
//! grow, but only where the list is hot.
//!
//! Keys never end in the zero digit. That invariant is what makes midpoint
//! insertion safe against zero-padded tails, and every generator below
//! maintains it.

use crate::changes;
use crate::clock::Hlc;
use crate::error::Result;
use crate::pk;
use crate::registry::{ColumnInfo, Registry, TableInfo};
use crate::types::SqlValue;
use rusqlite::Connection;
use sql_support::ConnExt;
use std::collections::BTreeSet;

/// Sentinel meaning "before any key".
pub const BEFORE_ALL: &str = "[";
/// Sentinel meaning "after any key".
pub const AFTER_ALL: &str = "]";

// Base-62 digits in ascii order, so digit order and lexicographic order
// agree.
const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: usize = 62;

fn digit_index(b: u8) -> usize {
    DIGITS
        .iter()
        .position(|&d| d == b)
        .expect("not a fractional index digit")
}

/// Returns a key strictly between `a` and `b`. The sentinels `"["` / `"]"`
/// stand for the ends of the list. Arguments may be given in either order.
pub fn frac_mid(a: &str, b: &str) -> String {
    let a = if a == BEFORE_ALL { "" } else { a };
    let b = if b == AFTER_ALL { None } else { Some(b) };
    match b {
        Some(b) if a == b => a.to_string(),
        Some(b) if a > b => midpoint(b, Some(a)),
        _ => midpoint(a, b),
    }
}

// `a < b` when b is Some; None stands for "after everything". `b` must not
// end in the zero digit.
fn midpoint(a: &str, b: Option<&str>) -> String {
    if let Some(b) = b {
        // Shared prefix: strip it, solve the rest, glue it back on. The
        // shorter key acts as if padded with zero digits on the right.
        let ab = a.as_bytes();
        let bb = b.as_bytes();
        let mut n = 0;
        while n < bb.len() && ab.get(n).copied().unwrap_or(b'0') == bb[n] {
            n += 1;
        }
        if n > 0 {
            let a_rest = if n < a.len() { &a[n..] } else { "" };
            return format!("{}{}", &b[..n], midpoint(a_rest, Some(&b[n..])));
        }
    }
    let digit_a = a.bytes().next().map(digit_index).unwrap_or(0);
    let digit_b = b
        .and_then(|b| b.bytes().next())
        .map(digit_index)
        .unwrap_or(BASE);
    if digit_b - digit_a > 1 {
        // A digit fits between the two first digits.
        let mid = (digit_a + digit_b + 1) / 2;
        (DIGITS[mid] as char).to_string()
    } else if b.map(|b| b.len() > 1).unwrap_or(false) {
        // First digits are consecutive but b has a tail, so its first digit
        // alone already sits strictly between a and b.
        b.unwrap()[..1].to_string()
    } else {
        // No gap at this position: keep a's digit and extend on the right.
        let a_rest = if a.is_empty() { "" } else { &a[1..] };
        format!("{}{}", DIGITS[digit_a] as char, midpoint(a_rest, None))
    }
}

/// True when an application wrote one of the placeholder positions
/// (`|append`, `|prepend`, `|after(<pk>)`) instead of a real key.
pub(crate) fn is_placeholder(value: &SqlValue) -> bool {
    matches!(value, SqlValue::Text(s) if s.starts_with('|'))
}

#[derive(Debug)]
enum Placeholder {
    Append,
    Prepend,
    After(String),
}

fn parse_placeholder(s: &str) -> Option<Placeholder> {
    match s {
        "|append" => Some(Placeholder::Append),
        "|prepend" => Some(Placeholder::Prepend),
        _ => s
            .strip_prefix("|after(")
            .and_then(|rest| rest.strip_suffix(')'))
            .map(|anchor| Placeholder::After(anchor.to_string())),
    }
}

// One live sibling: encoded pk and its current position key.
struct Sibling {
    pk: String,
    pos: String,
}

fn live_siblings(
    conn: &Connection,
    table: &TableInfo,
    col: &ColumnInfo,
    parent: &SqlValue,
) -> Result<Vec<Sibling>> {
    let parent_col = col.parent_col.as_deref().unwrap_or_default();
    let sql = format!(
        "SELECT {} AS pk, CAST({} AS TEXT) AS pos FROM {} \
         WHERE {} IS ?1 AND {} IS NOT NULL ORDER BY pos",
        pk::expr(table, None),
        pk::ident(&col.name),
        pk::ident(&table.name),
        pk::ident(parent_col),
        pk::ident(&col.name),
    );
    Ok(conn.query_rows_and_then(&sql, [parent], |row| -> Result<Sibling> {
        Ok(Sibling {
            pk: row.get("pk")?,
            pos: row.get("pos")?,
        })
    })?)
}

fn write_position(
    conn: &Connection,
    table: &TableInfo,
    col: &ColumnInfo,
    encoded_pk: &str,
    pos: &str,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET {} = ?1 WHERE {}",
        pk::ident(&table.name),
        pk::ident(&col.name),
        pk::where_clause(table),
    );
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(pos.to_string())];
    params.extend(pk::decode(encoded_pk).into_iter().map(SqlValue::Text));
    conn.execute_cached(&sql, rusqlite::params_from_iter(params))?;
    // The change log must agree with the row, or other replicas resolve the
    // list differently.
    changes::set_latest_cell_value(
        conn,
        &table.name,
        &col.name,
        encoded_pk,
        &SqlValue::Text(pos.to_string()),
    )?;
    Ok(())
}

/// Replace placeholder positions written by the application during the
/// statement stamped with `clock`. Runs at the tail of `exec_track_changes`,
/// inside its transaction.
pub(crate) fn assign_placeholder_positions(
    conn: &Connection,
    registry: &Registry,
    document: &str,
    clock: Hlc,
) -> Result<()> {
    for table in registry.tables() {
        for col in table.fractional_columns() {
            let pending =
                changes::placeholder_position_changes(conn, &table.name, &col.name, document, clock)?;
            for change in pending {
                let placeholder = match &change.value {
                    SqlValue::Text(s) => match parse_placeholder(s) {
                        Some(p) => p,
                        None => continue,
                    },
                    _ => continue,
                };
                let parent = row_parent_value(conn, table, col, &change.pk)?;
                let siblings: Vec<Sibling> = live_siblings(conn, table, col, &parent)?
                    .into_iter()
                    // Keys still awaiting assignment sort after every real
                    // key ('|' > 'z'), so just drop them from the anchors.
                    .filter(|s| !s.pos.starts_with('|'))
                    .collect();
                let pos = match placeholder {
                    Placeholder::Append => {
                        let last = siblings.last().map(|s| s.pos.as_str()).unwrap_or(BEFORE_ALL);
                        frac_mid(last, AFTER_ALL)
                    }
                    Placeholder::Prepend => {
                        let first = siblings
                            .first()
                            .map(|s| s.pos.as_str())
                            .unwrap_or(AFTER_ALL);
                        frac_mid(BEFORE_ALL, first)
                    }
                    Placeholder::After(anchor) => match siblings.iter().position(|s| s.pk == anchor)
                    {
                        Some(i) => {
                            let next = siblings
                                .get(i + 1)
                                .map(|s| s.pos.as_str())
                                .unwrap_or(AFTER_ALL);
                            frac_mid(&siblings[i].pos, next)
                        }
                        None => {
                            log::warn!(
                                "fractional index: anchor row '{}' not found in {}; appending",
                                anchor,
                                table.name
                            );
                            let last =
                                siblings.last().map(|s| s.pos.as_str()).unwrap_or(BEFORE_ALL);
                            frac_mid(last, AFTER_ALL)
                        }
                    },
                };
                write_position(conn, table, col, &change.pk, &pos)?;
            }
        }
    }
    Ok(())
}

fn row_parent_value(
    conn: &Connection,
    table: &TableInfo,
    col: &ColumnInfo,
    encoded_pk: &str,
) -> Result<SqlValue> {
    let parent_col = col.parent_col.as_deref().unwrap_or_default();
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        pk::ident(parent_col),
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
    if let Some(v) = from_row {
        return Ok(v);
    }
    // Row missing (e.g. while replaying history): fall back to the change
    // log's view of the grouping column.
    Ok(
        changes::latest_live_cell_change(conn, &table.name, parent_col, encoded_pk)?
            .map(|c| c.value)
            .unwrap_or(SqlValue::Null),
    )
}

/// Repair duplicate positions inside one `(parent)` group of one ordered
/// column. Runs after a batch of foreign changes is applied.
///
/// Among rows that collided, the earliest writer keeps the key; later
/// writers are re-keyed between the kept key and the next higher key in the
/// list. Both the rows and the change log are updated, so every replica
/// resolves the collision to the same keys.
pub(crate) fn fix_collisions(
    conn: &Connection,
    table: &TableInfo,
    col: &ColumnInfo,
    parent: &SqlValue,
) -> Result<()> {
    let siblings = live_siblings(conn, table, col, parent)?;
    if siblings.len() < 2 {
        return Ok(());
    }
    // Pair each sibling with the clock of its winning position change so we
    // can order collision groups by writer.
    let mut entries: Vec<(Sibling, Hlc)> = Vec::with_capacity(siblings.len());
    for s in siblings {
        let clock = changes::latest_live_cell_change(conn, &table.name, &col.name, &s.pk)?
            .map(|c| c.created_at)
            .unwrap_or_default();
        entries.push((s, clock));
    }

    let mut i = 0;
    while i < entries.len() {
        let mut j = i + 1;
        while j < entries.len() && entries[j].0.pos == entries[i].0.pos {
            j += 1;
        }
        if j - i > 1 {
            // Everything in i..j shares one key. The next distinct key in
            // the list bounds the reassignments from above.
            let upper = entries
                .get(j)
                .map(|(s, _)| s.pos.clone())
                .unwrap_or_else(|| AFTER_ALL.to_string());
            let mut group: Vec<&(Sibling, Hlc)> = entries[i..j].iter().collect();
            group.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.pk.cmp(&b.0.pk)));
            let mut prev = group[0].0.pos.clone();
            let reassign: Vec<(String, String)> = group[1..]
                .iter()
                .map(|(s, _)| {
                    let pos = frac_mid(&prev, &upper);
                    prev = pos.clone();
                    (s.pk.clone(), pos)
                })
                .collect();
            for (pk, pos) in reassign {
                log::debug!(
                    "fractional index: reassigning {}/{} row {} to '{}'",
                    table.name,
                    col.name,
                    pk,
                    pos
                );
                write_position(conn, table, col, &pk, &pos)?;
            }
        }
        i = j;
    }

    // Post: all keys distinct within the group.
    let check: Vec<Sibling> = live_siblings(conn, table, col, parent)?;
    let distinct: BTreeSet<&str> = check.iter().map(|s| s.pos.as_str()).collect();
    if distinct.len() != check.len() {
        log::error!(
            "fractional index repair left duplicate keys in {}.{}",
            table.name,
            col.name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_midpoint() {
        assert_eq!(frac_mid("103", "105"), "104");
        // Argument order doesn't matter.
        assert_eq!(frac_mid("105", "103"), "104");
    }

    #[test]
    fn test_sentinels() {
        let first = frac_mid(BEFORE_ALL, AFTER_ALL);
        assert_eq!(first, "V");
        let before = frac_mid(BEFORE_ALL, &first);
        assert!(before < first);
        let after = frac_mid(&first, AFTER_ALL);
        assert!(first < after);
    }

    #[test]
    fn test_zero_padding() {
        // "1" is compared against "103" as if it were "100".
        let mid = frac_mid("1", "103");
        assert!("1" < mid.as_str() && mid.as_str() < "103", "got {}", mid);
    }

    #[test]
    fn test_adjacent_digits_extend() {
        let mid = frac_mid("1", "2");
        assert!("1" < mid.as_str() && mid.as_str() < "2", "got {}", mid);
        let mid = frac_mid("1z", "2");
        assert!("1z" < mid.as_str() && mid.as_str() < "2", "got {}", mid);
    }

    #[test]
    fn test_never_terminates() {
        // Repeated splitting between a fixed pair keeps producing strictly
        // intermediate keys.
        let mut lo = frac_mid(BEFORE_ALL, AFTER_ALL);
        let hi = frac_mid(&lo, AFTER_ALL);
        for _ in 0..64 {
            let mid = frac_mid(&lo, &hi);
            assert!(lo < mid && mid < hi, "{} < {} < {}", lo, mid, hi);
            lo = mid;
        }
        // And downward too.
        let mut hi2 = hi.clone();
        let lo2 = frac_mid(BEFORE_ALL, &hi2);
        for _ in 0..64 {
            let mid = frac_mid(&lo2, &hi2);
            assert!(lo2 < mid && mid < hi2);
            hi2 = mid;
        }
    }

    #[test]
    fn test_no_trailing_zero() {
        let mut lo = String::from(BEFORE_ALL);
        for _ in 0..128 {
            let mid = frac_mid(&lo, AFTER_ALL);
            assert!(!mid.ends_with('0'));
            lo = mid;
        }
    }

    #[test]
    fn test_placeholder_parsing() {
        assert!(matches!(parse_placeholder("|append"), Some(Placeholder::Append)));
        assert!(matches!(parse_placeholder("|prepend"), Some(Placeholder::Prepend)));
        match parse_placeholder("|after(4|2)") {
            Some(Placeholder::After(anchor)) => assert_eq!(anchor, "4|2"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parse_placeholder("|bogus").is_none());
    }
}
