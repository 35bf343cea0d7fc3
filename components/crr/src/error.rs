/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No such table: {0}")]
    NoSuchTable(String),

    #[error("Table '{0}' has not been upgraded to a crr")]
    TableNotUpgraded(String),

    #[error("Table '{0}' has no primary key")]
    NoPrimaryKey(String),

    #[error("Table '{0}' has no column named '{1}'")]
    UnknownColumn(String, String),

    #[error("Malformed hybrid logical clock: '{0}'")]
    MalformedClock(String),

    #[error("Unknown commit: {0}")]
    UnknownCommit(String),

    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    #[error("No conflict recorded for row '{1}' of table '{0}'")]
    UnknownConflict(String, String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
