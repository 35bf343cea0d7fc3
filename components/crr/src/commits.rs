/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Commits and the commit graph.
//!
//! A commit labels the document's working copy and links to its parent -
//! one id for linear history, `"A|B"` for a merge, null for a root. The
//! graph is small (it lives in `crr_commits`), so the closure queries just
//! load it and walk in memory.

use crate::changes;
use crate::clock::Hlc;
use crate::db::{self, session, CrrDb};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::snapshot;
use crate::types::{random_id, Timestamp};
use rusqlite::{named_params, Connection};
use serde_derive::{Deserialize, Serialize};
use sql_support::ConnExt;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: String,
    pub document: String,
    /// None for a root, one id, or `"A|B"` for a merge.
    pub parent: Option<String>,
    pub message: String,
    /// Site that created the commit.
    pub author: String,
    pub created_at: Hlc,
    pub applied_at: Timestamp,
}

impl Commit {
    pub fn parents(&self) -> Vec<&str> {
        self.parent
            .as_deref()
            .map(|p| p.split('|').collect())
            .unwrap_or_default()
    }

    pub fn is_merge(&self) -> bool {
        self.parents().len() == 2
    }

    fn from_row(row: &rusqlite::Row<'_>) -> Result<Commit> {
        Ok(Commit {
            id: row.get("id")?,
            document: row.get("document")?,
            parent: row.get("parent")?,
            message: row.get("message")?,
            author: row.get("author")?,
            created_at: row.get("created_at")?,
            applied_at: row.get("applied_at")?,
        })
    }
}

const SELECT_COMMITS: &str =
    "SELECT id, document, parent, message, author, created_at, applied_at FROM crr_commits";

pub(crate) fn get_commit(conn: &Connection, id: &str) -> Result<Option<Commit>> {
    conn.try_query_row(
        &format!("{} WHERE id = ?1", SELECT_COMMITS),
        [id],
        Commit::from_row,
        true,
    )
}

pub(crate) fn insert_commit(conn: &Connection, commit: &Commit) -> Result<()> {
    conn.execute_cached(
        "INSERT OR IGNORE INTO crr_commits
             (id, document, parent, message, author, created_at, applied_at)
         VALUES (:id, :document, :parent, :message, :author, :created_at, :applied_at)",
        named_params! {
            ":id": commit.id,
            ":document": commit.document,
            ":parent": commit.parent,
            ":message": commit.message,
            ":author": commit.author,
            ":created_at": commit.created_at,
            ":applied_at": commit.applied_at,
        },
    )?;
    Ok(())
}

/// All commits of a document, oldest first.
pub(crate) fn commits_for_document(conn: &Connection, document: &str) -> Result<Vec<Commit>> {
    conn.query_rows_and_then_cached(
        &format!(
            "{} WHERE document = ?1 ORDER BY created_at, id",
            SELECT_COMMITS
        ),
        [document],
        Commit::from_row,
    )
}

/// Transitive parents of `id`, the commit itself included, discovery
/// order. Errors if `id` doesn't exist; missing *parents* (history we never
/// pulled) are tolerated.
pub(crate) fn ancestor_ids(conn: &Connection, id: &str) -> Result<Vec<String>> {
    if get_commit(conn, id)?.is_none() {
        return Err(Error::UnknownCommit(id.to_string()));
    }
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([id.to_string()]);
    while let Some(cur) = queue.pop_front() {
        if !seen.insert(cur.clone()) {
            continue;
        }
        if let Some(commit) = get_commit(conn, &cur)? {
            for parent in commit.parents() {
                queue.push_back(parent.to_string());
            }
        }
        out.push(cur);
    }
    Ok(out)
}

/// Transitive children of `id` within its document, the commit included.
pub(crate) fn descendant_ids(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let commit = get_commit(conn, id)?.ok_or_else(|| Error::UnknownCommit(id.to_string()))?;
    let all = commits_for_document(conn, &commit.document)?;
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for c in &all {
        for parent in c.parents() {
            children.entry(parent).or_default().push(c.id.as_str());
        }
    }
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([id]);
    while let Some(cur) = queue.pop_front() {
        if !seen.insert(cur) {
            continue;
        }
        if let Some(kids) = children.get(cur) {
            for kid in kids {
                queue.push_back(kid);
            }
        }
        out.push(cur.to_string());
    }
    Ok(out)
}

pub(crate) fn is_ancestor(conn: &Connection, a: &str, b: &str) -> Result<bool> {
    Ok(ancestor_ids(conn, b)?.iter().any(|id| id == a))
}

/// Storage stamp for the next commit: wall clock, but strictly greater
/// than every `applied_at` already stored. Pull horizons compare these, so
/// two commits stored in the same millisecond must not tie.
pub(crate) fn next_applied_at(conn: &Connection) -> Result<Timestamp> {
    let max: Option<i64> = conn.try_query_one("SELECT MAX(applied_at) FROM crr_commits", [], true)?;
    Ok(Timestamp(
        Timestamp::now().as_millis().max(max.unwrap_or(0) + 1),
    ))
}

impl CrrDb {
    /// Label the document's working copy. `None` when there was nothing to
    /// commit.
    pub fn commit(&self, message: &str, document: &str) -> Result<Option<Commit>> {
        let tx = self.conn().unchecked_transaction_exclusive()?;
        if !changes::has_uncommitted(&tx, document)? {
            log::debug!("commit('{}'): no uncommitted changes", document);
            return Ok(None);
        }
        let id = random_id();
        let clock = session::send_clock(&tx)?;
        let commit = Commit {
            id: id.clone(),
            document: document.to_string(),
            parent: db::head(&tx, document)?,
            message: message.to_string(),
            author: session::local_site(&tx)?,
            created_at: clock,
            applied_at: next_applied_at(&tx)?,
        };
        let promoted = changes::promote_uncommitted(&tx, document, &id)?;
        insert_commit(&tx, &commit)?;
        db::set_head(&tx, document, Some(&id))?;
        tx.commit()?;
        log::debug!(
            "committed {} change(s) of '{}' as {}",
            promoted,
            document,
            id
        );
        Ok(Some(commit))
    }

    /// Move the document to `commit_id`: rebuild the tables from the fold
    /// of its ancestor set.
    pub fn checkout(&self, commit_id: &str) -> Result<()> {
        let registry = Registry::load(self.conn())?;
        let commit = get_commit(self.conn(), commit_id)?
            .ok_or_else(|| Error::UnknownCommit(commit_id.to_string()))?;
        let tx = self.conn().unchecked_transaction_exclusive()?;
        session::set_time_travelling(&tx, true)?;
        let snap = snapshot::document_snapshot(&tx, &registry, &commit.document, commit_id)?;
        let tables = snapshot::apply_snapshot(&tx, &registry, &snap)?;
        db::set_head(&tx, &commit.document, Some(commit_id))?;
        session::set_time_travelling(&tx, false)?;
        tx.commit()?;
        self.notify_tables(&commit.document, tables);
        Ok(())
    }

    /// Throw the working copy away and rematerialize the committed state.
    pub fn discard_changes(&self, document: &str) -> Result<()> {
        let registry = Registry::load(self.conn())?;
        let tx = self.conn().unchecked_transaction_exclusive()?;
        session::set_time_travelling(&tx, true)?;
        let dropped = changes::delete_uncommitted(&tx, document)?;
        let tables = match db::head(&tx, document)? {
            Some(head) => {
                let snap = snapshot::document_snapshot(&tx, &registry, document, &head)?;
                snapshot::apply_snapshot(&tx, &registry, &snap)?
            }
            None => snapshot::delete_document_rows(&tx, &registry, document)?,
        };
        session::set_time_travelling(&tx, false)?;
        tx.commit()?;
        log::debug!("discarded {} uncommitted change(s) of '{}'", dropped, document);
        self.notify_tables(document, tables);
        Ok(())
    }

    pub fn get_commit(&self, id: &str) -> Result<Option<Commit>> {
        get_commit(self.conn(), id)
    }

    pub fn commits(&self, document: &str) -> Result<Vec<Commit>> {
        commits_for_document(self.conn(), document)
    }

    pub fn document_head(&self, document: &str) -> Result<Option<String>> {
        db::head(self.conn(), document)
    }

    pub fn ancestors(&self, commit_id: &str) -> Result<Vec<Commit>> {
        let ids = ancestor_ids(self.conn(), commit_id)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = get_commit(self.conn(), &id)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    pub fn descendants(&self, commit_id: &str) -> Result<Vec<Commit>> {
        let ids = descendant_ids(self.conn(), commit_id)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = get_commit(self.conn(), &id)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    pub fn is_ancestor(&self, a: &str, b: &str) -> Result<bool> {
        is_ancestor(self.conn(), a, b)
    }

    /// Fold the document state as of `commit_id` into a queryable snapshot.
    pub fn get_document_snapshot(&self, commit_id: &str) -> Result<snapshot::Snapshot> {
        let registry = Registry::load(self.conn())?;
        let commit = get_commit(self.conn(), commit_id)?
            .ok_or_else(|| Error::UnknownCommit(commit_id.to_string()))?;
        snapshot::document_snapshot(self.conn(), &registry, &commit.document, commit_id)
    }

    /// Materialize a snapshot into the live tables (truncate + insert).
    pub fn apply_document_snapshot(&self, snap: &snapshot::Snapshot) -> Result<()> {
        let registry = Registry::load(self.conn())?;
        let tx = self.conn().unchecked_transaction_exclusive()?;
        session::set_time_travelling(&tx, true)?;
        let tables = snapshot::apply_snapshot(&tx, &registry, snap)?;
        session::set_time_travelling(&tx, false)?;
        tx.commit()?;
        self.notify_tables(snap.document(), tables);
        Ok(())
    }
}
