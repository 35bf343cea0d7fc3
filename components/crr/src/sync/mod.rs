/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sync orchestrator: pairs this store with a remote peer through a
//! [`Transport`] and drives push/pull.
//!
//! Three call sets, mirroring the transports an application might wire up:
//! the non-versioned HTTP pair (`push_changes` / `pull_changes`), the
//! WebSocket message handlers, and the commit-style pair
//! (`push_commits` / `pull_commits`) with fast-forward / three-way-merge
//! pull handling.
//!
//! No local transaction is held across a transport call: requests are
//! prepared and committed before the call, responses are integrated in
//! fresh transactions afterwards, so a transport failure leaves the store
//! untouched and simply surfaces the error.

pub mod protocol;
mod server;

use crate::changes;
use crate::commits::{self, Commit};
use crate::db::{self, CrrDb};
use crate::error::{Error, Result};
use crate::merge;
use crate::types::Timestamp;
use protocol::{
    PullChangesRequest, PullChangesResponse, PullRequest, PullResponse, PushChangesRequest,
    PushChangesResponse, PushRequest, PushResponse, WsMessage,
};
use std::collections::BTreeSet;

/// What the orchestrator needs from the network layer. Implementations
/// surface failures as [`Error::Transport`].
pub trait Transport {
    fn push_commits(&mut self, req: &PushRequest) -> Result<PushResponse>;
    fn pull_commits(&mut self, req: &PullRequest) -> Result<PullResponse>;
    fn push_changes(&mut self, req: &PushChangesRequest) -> Result<PushChangesResponse>;
    fn pull_changes(&mut self, req: &PullChangesRequest) -> Result<PullChangesResponse>;
}

/// A transport that short-circuits to another store in the same process.
/// Useful for tests and for local replica pairs.
pub struct InProcessTransport<'a> {
    remote: &'a CrrDb,
}

impl<'a> InProcessTransport<'a> {
    pub fn new(remote: &'a CrrDb) -> Self {
        Self { remote }
    }
}

impl Transport for InProcessTransport<'_> {
    fn push_commits(&mut self, req: &PushRequest) -> Result<PushResponse> {
        self.remote.receive_push_commits(req)
    }

    fn pull_commits(&mut self, req: &PullRequest) -> Result<PullResponse> {
        self.remote.receive_pull_commits(req)
    }

    fn push_changes(&mut self, req: &PushChangesRequest) -> Result<PushChangesResponse> {
        self.remote.receive_push_changes(req)
    }

    fn pull_changes(&mut self, req: &PullChangesRequest) -> Result<PullChangesResponse> {
        self.remote.receive_pull_changes(req)
    }
}

impl CrrDb {
    /// Build the commit-style push request: every local commit the server
    /// can't already know (not an ancestor of what we last pushed or
    /// pulled), oldest first, with its change batch.
    pub fn prepare_push_commits(&self, document: &str) -> Result<PushRequest> {
        db::ensure_document(self.conn(), document)?;
        let doc = db::get_document(self.conn(), document)?
            .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;

        let mut known: BTreeSet<String> = BTreeSet::new();
        for marker in [&doc.last_pushed_commit, &doc.last_pulled_commit] {
            if let Some(id) = marker {
                if commits::get_commit(self.conn(), id)?.is_some() {
                    known.extend(commits::ancestor_ids(self.conn(), id)?);
                }
            }
        }
        let mut to_push: Vec<Commit> = Vec::new();
        if let Some(head) = &doc.head {
            for id in commits::ancestor_ids(self.conn(), head)? {
                if !known.contains(&id) {
                    if let Some(commit) = commits::get_commit(self.conn(), &id)? {
                        to_push.push(commit);
                    }
                }
            }
        }
        to_push.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut batches = Vec::with_capacity(to_push.len());
        for commit in &to_push {
            batches.push(changes::changes_for_version(self.conn(), &commit.id)?);
        }

        let lookup = |id: &Option<String>| -> Result<Option<Commit>> {
            Ok(match id {
                Some(id) => commits::get_commit(self.conn(), id)?,
                None => None,
            })
        };
        Ok(PushRequest {
            document_id: document.to_string(),
            last_pushed_commit: lookup(&doc.last_pushed_commit)?,
            last_pulled_commit: lookup(&doc.last_pulled_commit)?,
            commits: to_push,
            changes: batches,
        })
    }

    pub fn prepare_pull_commits(&self, document: &str) -> Result<PullRequest> {
        db::ensure_document(self.conn(), document)?;
        let doc = db::get_document(self.conn(), document)?
            .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;
        let last_pulled_commit = match &doc.last_pulled_commit {
            Some(id) => commits::get_commit(self.conn(), id)?,
            None => None,
        };
        Ok(PullRequest {
            document_id: document.to_string(),
            last_pulled_commit,
        })
    }
}

pub struct Syncer<'a, T: Transport> {
    db: &'a CrrDb,
    transport: T,
}

impl<'a, T: Transport> Syncer<'a, T> {
    pub fn new(db: &'a CrrDb, transport: T) -> Self {
        Self { db, transport }
    }

    /// One full commit-style cycle: integrate the server's history, then
    /// offer ours.
    pub fn sync(&mut self, document: &str) -> Result<()> {
        self.pull_commits(document)?;
        self.push_commits(document)?;
        Ok(())
    }

    /// Push local commits; on `needs-pull`, pull (merging if required) and
    /// retry once.
    pub fn push_commits(&mut self, document: &str) -> Result<PushResponse> {
        let req = self.db.prepare_push_commits(document)?;
        if req.commits.is_empty() {
            log::debug!("push('{}'): nothing to push", document);
            return Ok(PushResponse::RequestContainedNoCommits);
        }
        let resp = self.transport.push_commits(&req)?;
        match resp {
            PushResponse::Ok { applied_at, .. } => {
                self.record_push_ok(document, applied_at)?;
                Ok(resp)
            }
            PushResponse::NeedsPull { ref message } => {
                log::debug!("push('{}') rejected: {}; pulling", document, message);
                self.pull_commits(document)?;
                let retry = self.db.prepare_push_commits(document)?;
                if retry.commits.is_empty() {
                    return Ok(resp);
                }
                let second = self.transport.push_commits(&retry)?;
                if let PushResponse::Ok { applied_at, .. } = second {
                    self.record_push_ok(document, applied_at)?;
                }
                Ok(second)
            }
            _ => Ok(resp),
        }
    }

    fn record_push_ok(&self, document: &str, applied_at: Timestamp) -> Result<()> {
        // The server accepted everything up to our head, so pushed and
        // pulled markers both land there.
        let head = db::head(self.db.conn(), document)?;
        db::record_push(self.db.conn(), document, head.as_deref(), applied_at)?;
        db::record_pull(self.db.conn(), document, head.as_deref(), applied_at)?;
        Ok(())
    }

    /// Pull remote commits and integrate them: fast-forward when we have
    /// nothing local past the common ancestor, three-way merge otherwise.
    pub fn pull_commits(&mut self, document: &str) -> Result<()> {
        let req = self.db.prepare_pull_commits(document)?;
        let resp = self.transport.pull_commits(&req)?;
        let (commits, batches, pulled_at) = match resp {
            PullResponse::Ok {
                commits,
                changes,
                pulled_at,
            } => (commits, changes, pulled_at),
            PullResponse::RequestMalformed { message } => {
                return Err(Error::Transport(message));
            }
        };

        // The server sends anything newer than our marker; drop what we
        // already have (our own pushed commits, say).
        let mut new_commits = Vec::new();
        let mut new_batches = Vec::new();
        for (commit, batch) in commits.into_iter().zip(batches) {
            if self.db.get_commit(&commit.id)?.is_none() {
                new_commits.push(commit);
                new_batches.push(batch);
            }
        }
        if new_commits.is_empty() {
            db::record_pull(self.db.conn(), document, None, pulled_at)?;
            return Ok(());
        }

        let doc = db::get_document(self.db.conn(), document)?
            .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;
        let diverged = match (&doc.head, &doc.last_pulled_commit) {
            (Some(head), Some(base)) => head != base,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if diverged {
            merge::merge_remote(self.db, document, &new_commits, &new_batches)?;
        } else {
            merge::fast_forward(self.db, document, &new_commits, &new_batches)?;
        }
        let their_head = new_commits.last().map(|c| c.id.clone());
        db::record_pull(self.db.conn(), document, their_head.as_deref(), pulled_at)?;
        Ok(())
    }

    /// Non-versioned push: ship every change stored since the last push.
    pub fn push_changes(&mut self, document: &str) -> Result<()> {
        db::ensure_document(self.db.conn(), document)?;
        let doc = db::get_document(self.db.conn(), document)?
            .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;
        let since = doc.last_pushed_at.unwrap_or(Timestamp(0));
        let changes = changes::changes_since(self.db.conn(), document, since)?;
        if changes.is_empty() {
            return Ok(());
        }
        let req = PushChangesRequest {
            document_id: document.to_string(),
            changes,
        };
        match self.transport.push_changes(&req)? {
            PushChangesResponse::Ok { applied_at, .. } => {
                db::record_push(self.db.conn(), document, None, applied_at)?;
                Ok(())
            }
            PushChangesResponse::Fail { message, .. } => Err(Error::Transport(message)),
        }
    }

    /// Non-versioned pull: fetch and apply everything the server stored
    /// since our last pull.
    pub fn pull_changes(&mut self, document: &str) -> Result<()> {
        db::ensure_document(self.db.conn(), document)?;
        let doc = db::get_document(self.db.conn(), document)?
            .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;
        let since = doc.last_pulled_at.unwrap_or(Timestamp(0));
        let req = PullChangesRequest {
            document_id: document.to_string(),
            since,
        };
        match self.transport.pull_changes(&req)? {
            PullChangesResponse::Ok { changes, pulled_at } => {
                if !changes.is_empty() {
                    self.db.apply_changes(&changes)?;
                }
                db::record_pull(self.db.conn(), document, None, pulled_at)?;
                Ok(())
            }
            PullChangesResponse::Fail { message } => Err(Error::Transport(message)),
        }
    }

    /// Build a WebSocket push for everything stored since the last push,
    /// or `None` when there's nothing to say.
    pub fn make_push_changes_ws(&self, document: &str) -> Result<Option<WsMessage>> {
        db::ensure_document(self.db.conn(), document)?;
        let doc = db::get_document(self.db.conn(), document)?
            .ok_or_else(|| Error::UnknownDocument(document.to_string()))?;
        let since = doc.last_pushed_at.unwrap_or(Timestamp(0));
        let changes = changes::changes_since(self.db.conn(), document, since)?;
        if changes.is_empty() {
            return Ok(None);
        }
        Ok(Some(WsMessage::PushChanges {
            document_id: document.to_string(),
            changes,
        }))
    }

    /// Client side of the WebSocket conversation. Returns the reply to
    /// send, if any.
    pub fn handle_ws_message(&mut self, msg: WsMessage) -> Result<Option<WsMessage>> {
        match msg {
            WsMessage::PullHint { document_id } => {
                db::ensure_document(self.db.conn(), &document_id)?;
                let doc = db::get_document(self.db.conn(), &document_id)?
                    .ok_or_else(|| Error::UnknownDocument(document_id.clone()))?;
                Ok(Some(WsMessage::PullChanges {
                    document_id,
                    since: doc.last_pulled_at.unwrap_or(Timestamp(0)),
                }))
            }
            WsMessage::PullChangesOk {
                document_id,
                changes,
                pulled_at,
            } => {
                if !changes.is_empty() {
                    self.db.apply_changes(&changes)?;
                }
                db::record_pull(self.db.conn(), &document_id, None, pulled_at)?;
                Ok(None)
            }
            WsMessage::PushChangesOk {
                document_id,
                applied_at,
            } => {
                db::record_push(self.db.conn(), &document_id, None, applied_at)?;
                Ok(None)
            }
            WsMessage::PushChangesFail { message, .. }
            | WsMessage::PullChangesFail { message, .. } => Err(Error::Transport(message)),
            // Server-bound messages aren't ours to answer.
            _ => Ok(None),
        }
    }
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
        db.upgrade_table("todos", &TableOptions::default()).unwrap();
        db.finalize().unwrap();
        db
    }

    fn titles(db: &CrrDb) -> Vec<String> {
        sql_support::ConnExt::query_rows_and_then(
            db.conn(),
            "SELECT title FROM todos ORDER BY id",
            [],
            |r| r.get(0).map_err(crate::error::Error::from),
        )
        .unwrap()
    }

    #[test]
    fn test_push_then_pull_on_fresh_peer() {
        let client = new_db();
        let server = new_db();

        client
            .exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (1, 'shared')",
                &[],
                DEFAULT_DOCUMENT,
            )
            .unwrap();
        client.commit("c1", DEFAULT_DOCUMENT).unwrap().unwrap();

        let mut syncer = Syncer::new(&client, InProcessTransport::new(&server));
        let resp = syncer.push_commits(DEFAULT_DOCUMENT).unwrap();
        assert!(matches!(resp, PushResponse::Ok { .. }));
        assert_eq!(titles(&server), vec!["shared"]);
        assert_eq!(
            server.document_head(DEFAULT_DOCUMENT).unwrap(),
            client.document_head(DEFAULT_DOCUMENT).unwrap()
        );

        // A second client pulls and fast-forwards.
        let other = new_db();
        let mut other_syncer = Syncer::new(&other, InProcessTransport::new(&server));
        other_syncer.pull_commits(DEFAULT_DOCUMENT).unwrap();
        assert_eq!(titles(&other), vec!["shared"]);
        assert_eq!(
            other.document_head(DEFAULT_DOCUMENT).unwrap(),
            server.document_head(DEFAULT_DOCUMENT).unwrap()
        );
    }

    #[test]
    fn test_push_needs_pull_then_retry() {
        // S6: the server is ahead; push reports needs-pull, the client
        // pulls (merging) and the retry lands.
        let server = new_db();
        let alice = new_db();
        let bob = new_db();

        alice
            .exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (1, 'from alice')",
                &[],
                DEFAULT_DOCUMENT,
            )
            .unwrap();
        alice.commit("a1", DEFAULT_DOCUMENT).unwrap().unwrap();
        let mut alice_sync = Syncer::new(&alice, InProcessTransport::new(&server));
        assert!(matches!(
            alice_sync.push_commits(DEFAULT_DOCUMENT).unwrap(),
            PushResponse::Ok { .. }
        ));

        // Bob has divergent local history and has never pulled.
        bob.exec_track_changes(
            "INSERT INTO todos (id, title) VALUES (2, 'from bob')",
            &[],
            DEFAULT_DOCUMENT,
        )
        .unwrap();
        bob.commit("b1", DEFAULT_DOCUMENT).unwrap().unwrap();
        let mut bob_sync = Syncer::new(&bob, InProcessTransport::new(&server));
        let resp = bob_sync.push_commits(DEFAULT_DOCUMENT).unwrap();
        assert!(matches!(resp, PushResponse::Ok { .. }), "retry should land");

        assert_eq!(titles(&bob), vec!["from alice", "from bob"]);
        assert_eq!(titles(&server), vec!["from alice", "from bob"]);

        // And alice can pull bob's work back down.
        alice_sync.pull_commits(DEFAULT_DOCUMENT).unwrap();
        assert_eq!(titles(&alice), vec!["from alice", "from bob"]);
    }

    #[test]
    fn test_changes_style_round_trip() {
        let client = new_db();
        let server = new_db();
        client
            .exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (1, 'no commits needed')",
                &[],
                DEFAULT_DOCUMENT,
            )
            .unwrap();
        let mut syncer = Syncer::new(&client, InProcessTransport::new(&server));
        syncer.push_changes(DEFAULT_DOCUMENT).unwrap();
        assert_eq!(titles(&server), vec!["no commits needed"]);

        server
            .exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (2, 'from server')",
                &[],
                DEFAULT_DOCUMENT,
            )
            .unwrap();
        syncer.pull_changes(DEFAULT_DOCUMENT).unwrap();
        assert_eq!(titles(&client), vec!["no commits needed", "from server"]);
    }

    #[test]
    fn test_ws_conversation() {
        let client = new_db();
        let server = new_db();
        server
            .exec_track_changes(
                "INSERT INTO todos (id, title) VALUES (1, 'over ws')",
                &[],
                DEFAULT_DOCUMENT,
            )
            .unwrap();

        let mut syncer = Syncer::new(&client, InProcessTransport::new(&server));
        // Server hints; client asks; server answers; client applies.
        let hint = WsMessage::PullHint {
            document_id: DEFAULT_DOCUMENT.into(),
        };
        let request = syncer.handle_ws_message(hint).unwrap().unwrap();
        assert!(matches!(request, WsMessage::PullChanges { .. }));
        let reply = server.receive_ws_message(&request).unwrap().unwrap();
        assert!(matches!(reply, WsMessage::PullChangesOk { .. }));
        assert!(syncer.handle_ws_message(reply).unwrap().is_none());
        assert_eq!(titles(&client), vec!["over ws"]);
    }
}
