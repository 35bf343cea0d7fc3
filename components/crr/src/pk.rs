/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Composite primary-key encoding.
//!
//! A row is addressed everywhere (change log, tombstones, conflicts, wire)
//! by the `|`-joined textual form of its primary-key columns, in declared
//! order. `todos(id=1)` encodes as `"1"`, `membership(user=3, group="a")`
//! as `"3|a"`.

use crate::registry::TableInfo;
use crate::types::SqlValue;

pub const SEPARATOR: char = '|';

/// Quote an identifier for embedding in generated SQL. Values never take
/// this path - they are always bound parameters.
pub(crate) fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Encode the primary key of a row from its column values, in pk order.
pub fn encode(values: &[SqlValue]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.as_sort_text()).collect();
    parts.join("|")
}

/// Split an encoded primary key back into its per-column parts.
pub fn decode(pk: &str) -> Vec<String> {
    pk.split(SEPARATOR).map(str::to_string).collect()
}

/// SQL expression producing the encoded pk of a row of `table`.
/// `alias` prefixes the column references; triggers pass `NEW`/`OLD`.
pub(crate) fn expr(table: &TableInfo, alias: Option<&str>) -> String {
    let refs: Vec<String> = table
        .pk_cols
        .iter()
        .map(|col| match alias {
            Some(a) => format!("CAST({}.{} AS TEXT)", a, ident(col)),
            None => format!("CAST({} AS TEXT)", ident(col)),
        })
        .collect();
    refs.join(" || '|' || ")
}

/// `WHERE` fragment matching a row of `table` by its pk parts, one
/// positional parameter per pk column, in pk order.
pub(crate) fn where_clause(table: &TableInfo) -> String {
    let parts: Vec<String> = table
        .pk_cols
        .iter()
        .map(|col| format!("{} = ?", ident(col)))
        .collect();
    parts.join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let values = [
            SqlValue::Integer(3),
            SqlValue::Text("alpha".into()),
            SqlValue::Integer(-1),
        ];
        let encoded = encode(&values);
        assert_eq!(encoded, "3|alpha|-1");
        assert_eq!(decode(&encoded), vec!["3", "alpha", "-1"]);
    }

    #[test]
    fn test_single_column() {
        assert_eq!(encode(&[SqlValue::Integer(7)]), "7");
        assert_eq!(decode("7"), vec!["7"]);
    }

    #[test]
    fn test_ident_quoting() {
        assert_eq!(ident("todos"), "\"todos\"");
        assert_eq!(ident("we\"ird"), "\"we\"\"ird\"");
    }
}
