/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The receiving side of push/pull. "Server" here just means the store a
//! peer replicates against - any `CrrDb` can play the role.

use crate::changes;
use crate::commits;
use crate::db::{self, CrrDb};
use crate::error::Result;
use crate::sync::protocol::{
    PullChangesRequest, PullChangesResponse, PullRequest, PullResponse, PushChangesRequest,
    PushChangesResponse, PushRequest, PushResponse, WsMessage,
};
use crate::types::Timestamp;
use sql_support::ConnExt;

impl CrrDb {
    /// Server side of a commit-style push.
    ///
    /// The push is accepted only when the client is up to date: our head
    /// must be what they last pushed or last pulled (or we have no history
    /// at all). Anything else means they have to pull first.
    pub fn receive_push_commits(&self, req: &PushRequest) -> Result<PushResponse> {
        if req.commits.len() != req.changes.len() {
            return Ok(PushResponse::RequestMalformed {
                message: "commits and changes must have the same length".into(),
            });
        }
        if req.commits.iter().any(|c| c.document != req.document_id) {
            return Ok(PushResponse::RequestMalformed {
                message: "commit does not belong to the pushed document".into(),
            });
        }
        let head = db::head(self.conn(), &req.document_id)?;
        if let Some(head) = &head {
            let last_pushed = req.last_pushed_commit.as_ref().map(|c| c.id.as_str());
            let last_pulled = req.last_pulled_commit.as_ref().map(|c| c.id.as_str());
            if Some(head.as_str()) != last_pushed && Some(head.as_str()) != last_pulled {
                return Ok(PushResponse::NeedsPull {
                    message: format!("document head is {}; pull before pushing", head),
                });
            }
        }
        if req.commits.is_empty() {
            return Ok(PushResponse::RequestContainedNoCommits);
        }

        for (commit, batch) in req.commits.iter().zip(&req.changes) {
            if commits::get_commit(self.conn(), &commit.id)?.is_some() {
                // Retried push; this commit already landed.
                continue;
            }
            self.apply_changes(batch)?;
            // `applied_at` is when *we* stored the commit; it's what pull
            // horizons are computed from.
            let mut commit = commit.clone();
            commit.applied_at = commits::next_applied_at(self.conn())?;
            let tx = self.conn().unchecked_transaction_exclusive()?;
            commits::insert_commit(&tx, &commit)?;
            db::set_head(&tx, &req.document_id, Some(&commit.id))?;
            tx.commit()?;
        }
        log::debug!(
            "accepted push of {} commit(s) for '{}'",
            req.commits.len(),
            req.document_id
        );
        Ok(PushResponse::Ok {
            applied_at: Timestamp::now(),
            document_id: req.document_id.clone(),
        })
    }

    /// Server side of a commit-style pull: every commit newer than the
    /// client's `last_pulled_commit` (all of them for a first pull), each
    /// with its change batch.
    ///
    /// "Newer" is judged by *our* storage time for the marker commit, not
    /// the author clocks: commits from independent sites interleave in
    /// `created_at`, and a horizon computed from them can skip history.
    pub fn receive_pull_commits(&self, req: &PullRequest) -> Result<PullResponse> {
        let since = match &req.last_pulled_commit {
            Some(marker) => match commits::get_commit(self.conn(), &marker.id)? {
                Some(local) => Some(local.applied_at),
                // We never saw that commit; play it safe and send the lot.
                None => None,
            },
            None => None,
        };
        let mut commits: Vec<_> = commits::commits_for_document(self.conn(), &req.document_id)?
            .into_iter()
            .filter(|c| since.map(|s| c.applied_at > s).unwrap_or(true))
            .collect();
        commits.sort_by(|a, b| {
            a.applied_at
                .cmp(&b.applied_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        let mut batches = Vec::with_capacity(commits.len());
        for commit in &commits {
            batches.push(changes::changes_for_version(self.conn(), &commit.id)?);
        }
        log::debug!(
            "serving pull of {} commit(s) for '{}'",
            commits.len(),
            req.document_id
        );
        Ok(PullResponse::Ok {
            commits,
            changes: batches,
            pulled_at: Timestamp::now(),
        })
    }

    /// Server side of a non-versioned push.
    pub fn receive_push_changes(&self, req: &PushChangesRequest) -> Result<PushChangesResponse> {
        match self.apply_changes(&req.changes) {
            Ok(applied) => {
                log::debug!(
                    "accepted {} change(s) ({} applied) for '{}'",
                    req.changes.len(),
                    applied.len(),
                    req.document_id
                );
                Ok(PushChangesResponse::Ok {
                    document_id: req.document_id.clone(),
                    applied_at: Timestamp::now(),
                })
            }
            Err(e) => Ok(PushChangesResponse::Fail {
                document_id: req.document_id.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// Server side of a non-versioned pull.
    pub fn receive_pull_changes(&self, req: &PullChangesRequest) -> Result<PullChangesResponse> {
        match changes::changes_since(self.conn(), &req.document_id, req.since) {
            Ok(changes) => Ok(PullChangesResponse::Ok {
                changes,
                pulled_at: Timestamp::now(),
            }),
            Err(e) => Ok(PullChangesResponse::Fail {
                message: e.to_string(),
            }),
        }
    }

    /// Server side of the WebSocket message set. Returns the reply to send,
    /// if any; unknown/client-bound messages produce `None`.
    pub fn receive_ws_message(&self, msg: &WsMessage) -> Result<Option<WsMessage>> {
        match msg {
            WsMessage::PushChanges {
                document_id,
                changes,
            } => {
                let resp = self.receive_push_changes(&PushChangesRequest {
                    document_id: document_id.clone(),
                    changes: changes.clone(),
                })?;
                Ok(Some(match resp {
                    PushChangesResponse::Ok {
                        document_id,
                        applied_at,
                    } => WsMessage::PushChangesOk {
                        document_id,
                        applied_at,
                    },
                    PushChangesResponse::Fail {
                        document_id,
                        message,
                    } => WsMessage::PushChangesFail {
                        document_id,
                        message,
                    },
                }))
            }
            WsMessage::PullChanges { document_id, since } => {
                let resp = self.receive_pull_changes(&PullChangesRequest {
                    document_id: document_id.clone(),
                    since: *since,
                })?;
                Ok(Some(match resp {
                    PullChangesResponse::Ok { changes, pulled_at } => WsMessage::PullChangesOk {
                        document_id: document_id.clone(),
                        changes,
                        pulled_at,
                    },
                    PullChangesResponse::Fail { message } => WsMessage::PullChangesFail {
                        document_id: document_id.clone(),
                        message,
                    },
                }))
            }
            _ => Ok(None),
        }
    }
}
