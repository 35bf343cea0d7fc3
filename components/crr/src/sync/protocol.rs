/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Wire formats. The transport (HTTP framing, WebSocket plumbing) lives
//! outside this crate; these are the payloads it carries, serialized as
//! camelCase JSON with kebab-case status/type tags.

use crate::changes::Change;
use crate::commits::Commit;
use crate::types::Timestamp;
use serde_derive::{Deserialize, Serialize};

/// Commit-style push: the client's new commits with one change batch per
/// commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub document_id: String,
    pub last_pushed_commit: Option<Commit>,
    pub last_pulled_commit: Option<Commit>,
    pub commits: Vec<Commit>,
    pub changes: Vec<Vec<Change>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PushResponse {
    Ok {
        applied_at: Timestamp,
        document_id: String,
    },
    NeedsPull {
        message: String,
    },
    RequestContainedNoCommits,
    RequestMalformed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub document_id: String,
    pub last_pulled_commit: Option<Commit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PullResponse {
    Ok {
        commits: Vec<Commit>,
        changes: Vec<Vec<Change>>,
        pulled_at: Timestamp,
    },
    RequestMalformed {
        message: String,
    },
}

/// Non-versioned push: a raw batch of changes for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChangesRequest {
    pub document_id: String,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PushChangesResponse {
    Ok {
        document_id: String,
        applied_at: Timestamp,
    },
    Fail {
        document_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullChangesRequest {
    pub document_id: String,
    /// Return changes stored after this wall-clock time.
    pub since: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PullChangesResponse {
    Ok {
        changes: Vec<Change>,
        pulled_at: Timestamp,
    },
    Fail {
        message: String,
    },
}

/// The WebSocket message set. `pull-hint` is server-initiated: it nudges
/// the client to request a pull when another client pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WsMessage {
    PushChanges {
        document_id: String,
        changes: Vec<Change>,
    },
    PushChangesOk {
        document_id: String,
        applied_at: Timestamp,
    },
    PushChangesFail {
        document_id: String,
        message: String,
    },
    PullHint {
        document_id: String,
    },
    PullChanges {
        document_id: String,
        since: Timestamp,
    },
    PullChangesOk {
        document_id: String,
        changes: Vec<Change>,
        pulled_at: Timestamp,
    },
    PullChangesFail {
        document_id: String,
        message: String,
    },
}
