/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use types::Timestamp;

/// A Basic Storage Object as it is read back out of a user's store.
/// `expiry` is internal bookkeeping (the absolute expiry tick) and never
/// appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bso {
    pub id: String,
    pub modified: Timestamp,
    pub payload: String,
    pub sortindex: i32,
    #[serde(skip)]
    pub expiry: Timestamp,
}

/// One record of a POST body. Every field other than `id` is optional;
/// absent fields are left untouched on update and defaulted on insert.
/// Aliases accept the capitalized spellings older clients send. Serialize
/// is how batch staging persists records between requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostedBso {
    #[serde(alias = "Id", alias = "ID")]
    pub id: Option<String>,
    #[serde(alias = "Payload")]
    pub payload: Option<String>,
    #[serde(alias = "SortIndex")]
    pub sortindex: Option<i32>,
    #[serde(alias = "TTL")]
    pub ttl: Option<u64>,
}

/// Outcome of a multi-record upsert. Per-item failures are part of the
/// response contract, never errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostResults {
    #[serde(default)]
    pub modified: Timestamp,
    #[serde(default)]
    pub success: Vec<String>,
    #[serde(default)]
    pub failed: HashMap<String, String>,
}

/// Sort order for collection listings.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Sorting {
    #[default]
    None,
    Newest,
    Oldest,
    Index,
}

impl fmt::Display for Sorting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sorting::None => f.write_str("none"),
            Sorting::Newest => f.write_str("newest"),
            Sorting::Oldest => f.write_str("oldest"),
            Sorting::Index => f.write_str("index"),
        }
    }
}

impl FromStr for Sorting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "newest" => Ok(Sorting::Newest),
            "oldest" => Ok(Sorting::Oldest),
            "index" => Ok(Sorting::Index),
            _ => Err(Error::InvalidSort),
        }
    }
}

/// A page of BSOs plus the bookkeeping the caller needs to fetch the rest.
#[derive(Debug, Clone, Default)]
pub struct GetBsosResult {
    pub bsos: Vec<Bso>,
    /// How many records matched the filter in total.
    pub total: usize,
    /// Whether records beyond this page matched.
    pub more: bool,
    /// Offset to pass to get the next page. Only meaningful when `more`.
    pub offset: i64,
}

/// Returns true when `id` is a well-formed BSO id: 1..=64 chars drawn from
/// `[A-Za-z0-9_-]`.
pub fn valid_bso_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Returns true for a well-formed collection name: 1..=32 chars from
/// `[A-Za-z0-9_]`.
pub fn valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bso_id() {
        assert!(valid_bso_id("bso1"));
        assert!(valid_bso_id("a-b_c"));
        assert!(valid_bso_id(&"x".repeat(64)));
        assert!(!valid_bso_id(""));
        assert!(!valid_bso_id(&"x".repeat(65)));
        assert!(!valid_bso_id("has space"));
        assert!(!valid_bso_id("no\ttabs"));
    }

    #[test]
    fn test_valid_collection_name() {
        assert!(valid_collection_name("bookmarks"));
        assert!(valid_collection_name("my_new_collection"));
        assert!(!valid_collection_name(""));
        assert!(!valid_collection_name("has-dash"));
        assert!(!valid_collection_name(&"c".repeat(33)));
    }

    #[test]
    fn test_sorting_from_str() {
        assert_eq!("newest".parse::<Sorting>().unwrap(), Sorting::Newest);
        assert_eq!("oldest".parse::<Sorting>().unwrap(), Sorting::Oldest);
        assert_eq!("index".parse::<Sorting>().unwrap(), Sorting::Index);
        assert!("invalid".parse::<Sorting>().is_err());
    }

    #[test]
    fn test_posted_bso_aliases() {
        let b: PostedBso =
            serde_json::from_str(r#"{"Id":"bso1","Payload":"a","SortIndex":1,"TTL":100}"#).unwrap();
        assert_eq!(b.id.as_deref(), Some("bso1"));
        assert_eq!(b.payload.as_deref(), Some("a"));
        assert_eq!(b.sortindex, Some(1));
        assert_eq!(b.ttl, Some(100));

        let b: PostedBso =
            serde_json::from_str(r#"{"id":"bso2","payload":"b","sortindex":2}"#).unwrap();
        assert_eq!(b.id.as_deref(), Some("bso2"));
        assert_eq!(b.ttl, None);
    }
}
