/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict-free replicated relations over SQLite.
//!
//! Applications write ordinary SQL through [`CrrDb::exec_track_changes`];
//! triggers record one change per written column into an append-mostly
//! change log, stamped with a hybrid logical clock. Batches of changes
//! ship between replicas and merge deterministically - per-column
//! last-writer-wins, add-wins deletes with cascade resurrection, and
//! densely splittable fractional keys for ordered lists - so every replica
//! converges on the same state regardless of delivery order.
//!
//! On top of the log sits document-scoped versioning: commits form a
//! graph, push/pull moves them between peers, and divergent histories are
//! reconciled by fast-forward or three-way merge with per-column conflict
//! records for columns the application wants to settle itself.

mod apply;
mod changes;
mod clock;
mod commits;
mod db;
mod error;
mod events;
mod fractindex;
mod merge;
mod pk;
mod registry;
mod resurrect;
mod schema;
mod snapshot;
pub mod sync;
mod triggers;
mod types;

pub use crate::changes::{Change, ChangeKind, TOMBSTONE_COLUMN, UNCOMMITTED};
pub use crate::clock::Hlc;
pub use crate::commits::Commit;
pub use crate::db::{CrrDb, Document, DEFAULT_DOCUMENT};
pub use crate::error::{Error, Result};
pub use crate::events::{Events, Subscription, TableChange};
pub use crate::fractindex::{frac_mid, AFTER_ALL, BEFORE_ALL};
pub use crate::merge::{Conflict, ConflictChoice};
pub use crate::pk::{decode as decode_pk, encode as encode_pk};
pub use crate::registry::{
    upgrade_column_to_fractional_index, upgrade_table, ColumnInfo, ColumnKind, ForeignKey,
    OnDelete, Registry, TableInfo, TableOptions,
};
pub use crate::snapshot::Snapshot;
pub use crate::triggers::finalize;
pub use crate::types::{Row, SqlValue, Timestamp};
