/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Multi-replica scenarios driven end-to-end: several in-memory stores
//! exchanging change batches and commits through the in-process transport.

use crr::sync::{InProcessTransport, Syncer};
use crr::{Change, ConflictChoice, CrrDb, SqlValue, TableOptions, DEFAULT_DOCUMENT};

fn new_replica() -> CrrDb {
    let _ = env_logger::try_init();
    let db = CrrDb::open_in_memory().unwrap();
    db.conn()
        .execute_batch(
            "CREATE TABLE lists (
                 id INTEGER PRIMARY KEY,
                 title TEXT
             );
             CREATE TABLE todos (
                 id INTEGER PRIMARY KEY,
                 list_id INTEGER REFERENCES lists(id) ON DELETE CASCADE,
                 title TEXT,
                 position TEXT,
                 finished INTEGER NOT NULL DEFAULT 0
             );",
        )
        .unwrap();
    db.upgrade_table("lists", &TableOptions::default()).unwrap();
    db.upgrade_table("todos", &TableOptions::default()).unwrap();
    db.upgrade_column_to_fractional_index("todos", "position", "list_id")
        .unwrap();
    db.finalize().unwrap();
    db
}

fn exec(db: &CrrDb, sql: &str) {
    db.exec_track_changes(sql, &[], DEFAULT_DOCUMENT).unwrap();
}

fn working_copy(db: &CrrDb) -> Vec<Change> {
    db.uncommitted_changes(DEFAULT_DOCUMENT).unwrap()
}

fn todo(db: &CrrDb, id: i64) -> Option<(String, i64)> {
    let mut stmt = db
        .conn()
        .prepare("SELECT title, finished FROM todos WHERE id = ?1")
        .unwrap();
    let mut rows = stmt.query([id]).unwrap();
    rows.next()
        .unwrap()
        .map(|r| (r.get(0).unwrap(), r.get(1).unwrap()))
}

fn table_dump(db: &CrrDb, table: &str) -> Vec<Vec<String>> {
    let sql = format!(
        "SELECT * FROM {} ORDER BY id",
        table
    );
    let mut stmt = db.conn().prepare(&sql).unwrap();
    let n = stmt.column_count();
    let mut rows = stmt.query([]).unwrap();
    let mut out = Vec::new();
    while let Some(row) = rows.next().unwrap() {
        let mut cells = Vec::with_capacity(n);
        for i in 0..n {
            cells.push(row.get::<_, SqlValue>(i).unwrap().as_sort_text());
        }
        out.push(cells);
    }
    out
}

// S1: concurrent edits of different columns of one row merge cell-wise.
#[test]
fn s1_basic_lww() {
    let a = new_replica();
    let b = new_replica();

    exec(&a, "INSERT INTO todos (id, title, finished) VALUES (1, 'Buy milk', 0)");
    b.apply_changes(&working_copy(&a)).unwrap();

    exec(&a, "UPDATE todos SET title = 'Buy Coffee' WHERE id = 1");
    exec(&b, "UPDATE todos SET finished = 1 WHERE id = 1");

    let from_a = working_copy(&a);
    let from_b = working_copy(&b);
    b.apply_changes(&from_a).unwrap();
    a.apply_changes(&from_b).unwrap();

    assert_eq!(todo(&a, 1), Some(("Buy Coffee".into(), 1)));
    assert_eq!(todo(&b, 1), Some(("Buy Coffee".into(), 1)));
}

// S2: placeholder positions resolve to dense keys; append/append/after(1)
// orders the rows 1, 3, 2.
#[test]
fn s2_fractional_insert() {
    let a = new_replica();
    exec(&a, "INSERT INTO lists (id, title) VALUES (4, 'groceries')");
    exec(
        &a,
        "INSERT INTO todos (id, list_id, title, position) VALUES (1, 4, 'one', '|append')",
    );
    exec(
        &a,
        "INSERT INTO todos (id, list_id, title, position) VALUES (2, 4, 'two', '|append')",
    );
    exec(
        &a,
        "INSERT INTO todos (id, list_id, title, position) VALUES (3, 4, 'three', '|after(1)')",
    );

    let order: Vec<i64> = {
        let mut stmt = a
            .conn()
            .prepare("SELECT id FROM todos WHERE list_id = 4 ORDER BY position")
            .unwrap();
        let rows = stmt.query_map([], |r| r.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    };
    assert_eq!(order, vec![1, 3, 2]);

    // The change log holds real keys, not placeholders.
    let placeholders: i64 = a
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM crr_changes
             WHERE col = 'position' AND CAST(value AS TEXT) LIKE '|%'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(placeholders, 0);
}

// Positions stay pairwise distinct after concurrent inserts into the same
// list meet.
#[test]
fn s2b_fractional_collision_repair() {
    let a = new_replica();
    let b = new_replica();
    exec(&a, "INSERT INTO lists (id, title) VALUES (4, 'shared')");
    b.apply_changes(&working_copy(&a)).unwrap();

    // Both replicas append to the empty list: identical keys on both sides.
    exec(
        &a,
        "INSERT INTO todos (id, list_id, title, position) VALUES (1, 4, 'a', '|append')",
    );
    exec(
        &b,
        "INSERT INTO todos (id, list_id, title, position) VALUES (2, 4, 'b', '|append')",
    );

    let from_a = working_copy(&a);
    let from_b = working_copy(&b);
    b.apply_changes(&from_a).unwrap();
    a.apply_changes(&from_b).unwrap();

    for db in [&a, &b] {
        let positions: Vec<String> = {
            let mut stmt = db
                .conn()
                .prepare("SELECT CAST(position AS TEXT) FROM todos WHERE list_id = 4")
                .unwrap();
            let rows = stmt.query_map([], |r| r.get(0)).unwrap();
            rows.map(|r| r.unwrap()).collect()
        };
        assert_eq!(positions.len(), 2);
        assert_ne!(positions[0], positions[1], "collision survived repair");
    }
    // Both replicas agree on the order.
    assert_eq!(table_dump(&a, "todos"), table_dump(&b, "todos"));
}

// S3: delete versus a concurrent later update; the update wins everywhere.
#[test]
fn s3_delete_with_concurrent_update() {
    let a = new_replica();
    let b = new_replica();
    exec(&a, "INSERT INTO todos (id, title) VALUES (1, 'Buy milk')");
    b.apply_changes(&working_copy(&a)).unwrap();

    exec(&a, "DELETE FROM todos WHERE id = 1");
    exec(&b, "UPDATE todos SET title = 'X' WHERE id = 1");

    let deletes: Vec<Change> = working_copy(&a)
        .into_iter()
        .filter(|c| c.is_tombstone())
        .collect();
    let updates: Vec<Change> = working_copy(&b)
        .into_iter()
        .filter(|c| !c.is_tombstone())
        .collect();

    b.apply_changes(&deletes).unwrap();
    a.apply_changes(&updates).unwrap();

    assert_eq!(todo(&a, 1), Some(("X".into(), 0)));
    assert_eq!(todo(&b, 1), Some(("X".into(), 0)));

    // The tombstone is cancelled and B emitted a counter change.
    let cancelled: i64 = b
        .conn()
        .query_row(
            "SELECT value FROM crr_changes WHERE type = 'delete' AND tbl = 'todos'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(cancelled, 0);
    let counter: i64 = b
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM crr_changes
             WHERE type = 'update' AND col = 'title' AND site_id = ?1",
            [b.site_id().unwrap()],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(counter, 1);
}

// S4: a child edit resurrects its cascade-deleted parent chain.
#[test]
fn s4_resurrection() {
    let a = new_replica();
    let b = new_replica();
    exec(&a, "INSERT INTO lists (id, title) VALUES (1, 'P')");
    exec(&a, "INSERT INTO todos (id, list_id, title) VALUES (1, 1, 'C')");
    b.apply_changes(&working_copy(&a)).unwrap();

    // A deletes the parent; the cascade takes the child with it.
    exec(&a, "DELETE FROM lists WHERE id = 1");
    let lists_on_a: i64 = a.conn().query_row("SELECT COUNT(*) FROM lists", [], |r| r.get(0)).unwrap();
    let todos_on_a: i64 = a.conn().query_row("SELECT COUNT(*) FROM todos", [], |r| r.get(0)).unwrap();
    assert_eq!((lists_on_a, todos_on_a), (0, 0));

    // B, unaware, edits the child.
    exec(&b, "UPDATE todos SET title = 'edited' WHERE id = 1");

    let deletes: Vec<Change> = working_copy(&a)
        .into_iter()
        .filter(|c| c.is_tombstone())
        .collect();
    let edits: Vec<Change> = working_copy(&b)
        .into_iter()
        .filter(|c| !c.is_tombstone() && c.tbl == "todos" && c.col == "title")
        .collect();

    // A learns about the edit: parent and child come back.
    a.apply_changes(&edits).unwrap();
    let list_title: String = a
        .conn()
        .query_row("SELECT title FROM lists WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(list_title, "P");
    assert_eq!(todo(&a, 1), Some(("edited".into(), 0)));
    let active_tombstones: i64 = a
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM crr_changes WHERE type = 'delete' AND value = 1",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(active_tombstones, 0);

    // B learns about the delete: its newer edit cancels it.
    b.apply_changes(&deletes).unwrap();
    assert_eq!(todo(&b, 1), Some(("edited".into(), 0)));
    let list_on_b: i64 = b.conn().query_row("SELECT COUNT(*) FROM lists", [], |r| r.get(0)).unwrap();
    assert_eq!(list_on_b, 1);
}

// The delete side of the add-wins coin: when the parent's tombstone is
// newer than the child edit, the delete stands everywhere, and the edit is
// recorded but not materialized.
#[test]
fn s4b_resurrection_blocked_by_newer_delete() {
    let a = new_replica();
    let b = new_replica();
    exec(&a, "INSERT INTO lists (id, title) VALUES (1, 'P')");
    exec(&a, "INSERT INTO todos (id, list_id, title) VALUES (1, 1, 'C')");
    b.apply_changes(&working_copy(&a)).unwrap();

    // B edits the child; A *sees that edit* and then deletes the parent,
    // so the delete is causally newer.
    exec(&b, "UPDATE todos SET title = 'late edit' WHERE id = 1");
    let edit: Vec<Change> = working_copy(&b)
        .into_iter()
        .filter(|c| c.col == "title" && c.tbl == "todos" && !c.is_tombstone())
        .collect();
    a.apply_changes(&edit).unwrap();
    exec(&a, "DELETE FROM lists WHERE id = 1");

    // B learns of the delete: nothing on the row is newer, so it wins.
    let deletes: Vec<Change> = working_copy(&a)
        .into_iter()
        .filter(|c| c.is_tombstone())
        .collect();
    b.apply_changes(&deletes).unwrap();
    let rows: i64 = b
        .conn()
        .query_row(
            "SELECT (SELECT COUNT(*) FROM lists) + (SELECT COUNT(*) FROM todos)",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(rows, 0);

    // A fresh observer that already has the tombstones receives the old
    // edit afterwards: it's kept in the log but the rows stay dead.
    let o = new_replica();
    let history: Vec<Change> = working_copy(&a)
        .into_iter()
        .filter(|c| !(c.col == "title" && c.value == SqlValue::Text("late edit".into())))
        .collect();
    o.apply_changes(&history).unwrap();
    o.apply_changes(&edit).unwrap();
    let rows: i64 = o
        .conn()
        .query_row(
            "SELECT (SELECT COUNT(*) FROM lists) + (SELECT COUNT(*) FROM todos)",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(rows, 0);
    let recorded: i64 = o
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM crr_changes WHERE CAST(value AS TEXT) = 'late edit'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(recorded, 1);
}

// S5: divergent commits to a manual-conflict column surface a conflict
// record instead of silently resolving.
#[test]
fn s5_three_way_merge_manual_conflict() {
    let _ = env_logger::try_init();
    let make = || {
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
    };
    let server = make();
    let a = make();
    let b = make();

    // Common ancestor: title = 'A'.
    a.exec_track_changes(
        "INSERT INTO todos (id, title) VALUES (1, 'A')",
        &[],
        DEFAULT_DOCUMENT,
    )
    .unwrap();
    a.commit("c0", DEFAULT_DOCUMENT).unwrap().unwrap();
    let mut a_sync = Syncer::new(&a, InProcessTransport::new(&server));
    a_sync.push_commits(DEFAULT_DOCUMENT).unwrap();
    let mut b_sync = Syncer::new(&b, InProcessTransport::new(&server));
    b_sync.pull_commits(DEFAULT_DOCUMENT).unwrap();

    // A commits 'B' and pushes; B commits 'C' locally.
    a.exec_track_changes(
        "UPDATE todos SET title = 'B' WHERE id = 1",
        &[],
        DEFAULT_DOCUMENT,
    )
    .unwrap();
    a.commit("a-edit", DEFAULT_DOCUMENT).unwrap().unwrap();
    a_sync.push_commits(DEFAULT_DOCUMENT).unwrap();

    b.exec_track_changes(
        "UPDATE todos SET title = 'C' WHERE id = 1",
        &[],
        DEFAULT_DOCUMENT,
    )
    .unwrap();
    b.commit("b-edit", DEFAULT_DOCUMENT).unwrap().unwrap();

    // B pulls: three-way merge with a parked conflict.
    b_sync.pull_commits(DEFAULT_DOCUMENT).unwrap();
    let conflicts = b.get_conflicts("todos", DEFAULT_DOCUMENT).unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.columns, vec!["title".to_string()]);
    let image_title = |row: &Option<crr::Row>| -> String {
        match row.as_ref().unwrap().get("title").unwrap() {
            SqlValue::Text(s) => s.clone(),
            other => panic!("unexpected value {:?}", other),
        }
    };
    assert_eq!(image_title(&conflict.base), "A");
    assert_eq!(image_title(&conflict.ours), "C");
    assert_eq!(image_title(&conflict.theirs), "B");

    // Neither side was applied while the conflict is open.
    let title: String = b
        .conn()
        .query_row("SELECT title FROM todos WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(title, "C");

    b.resolve_conflict(
        "todos",
        "1",
        DEFAULT_DOCUMENT,
        &[("title".into(), ConflictChoice::Theirs)],
    )
    .unwrap();
    let title: String = b
        .conn()
        .query_row("SELECT title FROM todos WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(title, "B");
    assert!(b.get_conflicts("todos", DEFAULT_DOCUMENT).unwrap().is_empty());
    // The merge commit has two parents.
    let head = b.document_head(DEFAULT_DOCUMENT).unwrap().unwrap();
    let merge = b.get_commit(&head).unwrap().unwrap();
    assert!(merge.is_merge());
}

// S6 lives in sync::tests (push-needs-pull-retry); here we check the
// convergence property: the same changes in any delivery order produce the
// same tables.
#[test]
fn convergence_under_permuted_batches() {
    let a = new_replica();
    let b = new_replica();

    exec(&a, "INSERT INTO lists (id, title) VALUES (1, 'L')");
    exec(
        &a,
        "INSERT INTO todos (id, list_id, title, position) VALUES (1, 1, 'one', '|append')",
    );
    b.apply_changes(&working_copy(&a)).unwrap();

    exec(&a, "UPDATE todos SET title = 'one!' WHERE id = 1");
    exec(
        &a,
        "INSERT INTO todos (id, list_id, title, position) VALUES (2, 1, 'two', '|append')",
    );
    exec(&b, "UPDATE todos SET finished = 1 WHERE id = 1");
    exec(&b, "DELETE FROM todos WHERE id = 1");

    let mut everything = working_copy(&a);
    everything.extend(working_copy(&b));

    // Fresh observers receive the whole history in different orders.
    let mut permutations: Vec<Vec<Change>> = Vec::new();
    permutations.push(everything.clone());
    let mut reversed = everything.clone();
    reversed.reverse();
    permutations.push(reversed);
    let mut rotated = everything.clone();
    rotated.rotate_left(everything.len() / 2);
    permutations.push(rotated);

    let mut dumps = Vec::new();
    for perm in permutations {
        let observer = new_replica();
        // Split into two batches to exercise cross-batch ordering too.
        let mid = perm.len() / 2;
        observer.apply_changes(&perm[..mid]).unwrap();
        observer.apply_changes(&perm[mid..]).unwrap();
        dumps.push((table_dump(&observer, "lists"), table_dump(&observer, "todos")));
    }
    for pair in dumps.windows(2) {
        assert_eq!(pair[0], pair[1], "replicas diverged");
    }
}
