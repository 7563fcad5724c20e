/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found")]
    NotFound,

    #[error("Collection already exists")]
    CollectionExists,

    #[error("Nothing to do")]
    NothingToDo,

    #[error("Invalid limit")]
    InvalidLimit,

    #[error("Invalid offset")]
    InvalidOffset,

    #[error("Invalid newer")]
    InvalidNewer,

    #[error("Invalid sort")]
    InvalidSort,

    #[error("Invalid BSO id: {0:?}")]
    InvalidBsoId(String),

    #[error("Invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("The pool is shut down")]
    Closed,

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl Error {
    /// True for corruption/IO class failures. A store that produced one of
    /// these is dropped from the pool so the next request reopens the file.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::SqlError(_) | Error::OpenDatabaseError(_) | Error::IoError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
