/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Request validation: path pieces, query strings and precondition headers
//! are checked here before any handler touches storage.

use crate::error::{ApiError, ApiResult};
use axum::http::HeaderMap;
use serde::Deserialize;
use syncstorage::Sorting;
use types::Timestamp;

pub mod headers {
    pub const X_LAST_MODIFIED: &str = "X-Last-Modified";
    pub const X_WEAVE_TIMESTAMP: &str = "X-Weave-Timestamp";
    pub const X_WEAVE_RECORDS: &str = "X-Weave-Records";
    pub const X_WEAVE_NEXT_OFFSET: &str = "X-Weave-Next-Offset";
    pub const X_IF_MODIFIED_SINCE: &str = "X-If-Modified-Since";
    pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
    pub const X_IF_UNMODIFIED_SINCE: &str = "X-If-Unmodified-Since";
}

/// A uid is a non-empty run of digits; anything else doesn't exist as far
/// as the routing tree is concerned.
pub fn validate_uid(uid: &str) -> ApiResult<&str> {
    if !uid.is_empty() && uid.bytes().all(|b| b.is_ascii_digit()) {
        Ok(uid)
    } else {
        Err(ApiError::NotFound)
    }
}

/// Collection names outside `[a-zA-Z0-9_]{1,32}` don't match the route.
pub fn validate_collection(name: &str) -> ApiResult<&str> {
    if syncstorage::bso::valid_collection_name(name) {
        Ok(name)
    } else {
        Err(ApiError::NotFound)
    }
}

/// BSO ids outside `[a-zA-Z0-9_-]{1,64}` don't match the route.
pub fn validate_bso_id(id: &str) -> ApiResult<&str> {
    if syncstorage::bso::valid_bso_id(id) {
        Ok(id)
    } else {
        Err(ApiError::NotFound)
    }
}

/// The raw query string of a collection request; everything arrives as an
/// optional string so `?limit=` can be told apart from a missing `limit`.
#[derive(Debug, Default, Deserialize)]
pub struct RawListQuery {
    pub ids: Option<String>,
    pub newer: Option<String>,
    pub full: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub sort: Option<String>,
    pub batch: Option<String>,
    pub commit: Option<String>,
}

/// Validated collection query parameters.
#[derive(Debug, Default)]
pub struct ListParams {
    pub ids: Option<Vec<String>>,
    pub newer: i64,
    pub full: bool,
    pub limit: Option<i64>,
    pub offset: i64,
    pub sort: Sorting,
}

impl RawListQuery {
    pub fn validate(&self) -> ApiResult<ListParams> {
        let mut params = ListParams {
            full: self.full.is_some(),
            ..Default::default()
        };

        if let Some(ids) = &self.ids {
            if !ids
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b',')
            {
                return Err(ApiError::BadRequest("invalid ids".into()));
            }
            params.ids = Some(
                ids.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }

        if let Some(newer) = non_empty(&self.newer) {
            let ts: Timestamp = newer
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid newer".into()))?;
            params.newer = ts.as_centis() as i64;
        }

        if let Some(limit) = non_empty(&self.limit) {
            let limit: i64 = limit
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid limit".into()))?;
            if limit <= 0 {
                return Err(ApiError::BadRequest("invalid limit".into()));
            }
            params.limit = Some(limit);
        }

        if let Some(offset) = non_empty(&self.offset) {
            let offset: i64 = offset
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid offset".into()))?;
            if offset < 0 {
                return Err(ApiError::BadRequest("invalid offset".into()));
            }
            params.offset = offset;
        }

        if let Some(sort) = non_empty(&self.sort) {
            params.sort = sort
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid sort".into()))?;
        }

        Ok(params)
    }

    /// `?batch=true` opens a batch, `?batch=<id>` refers to one.
    pub fn batch_ref(&self) -> ApiResult<Option<BatchRef>> {
        match non_empty(&self.batch) {
            None => Ok(None),
            Some("true") => Ok(Some(BatchRef::New)),
            Some(id) => id
                .parse()
                .map(|id| Some(BatchRef::Existing(id)))
                .map_err(|_| ApiError::BadRequest("invalid batch id".into())),
        }
    }

    pub fn wants_commit(&self) -> bool {
        matches!(non_empty(&self.commit), Some("true") | Some("1"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRef {
    New,
    Existing(i64),
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

fn header_timestamp(headers: &HeaderMap, names: &[&str]) -> ApiResult<Option<Timestamp>> {
    for name in names {
        if let Some(value) = headers.get(*name) {
            let value = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("invalid precondition header".into()))?;
            let ts = value
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid precondition header".into()))?;
            return Ok(Some(ts));
        }
    }
    Ok(None)
}

/// For reads: true when the client's copy is current and a 304 is in order.
pub fn not_modified(headers: &HeaderMap, modified: Timestamp) -> ApiResult<bool> {
    let since = header_timestamp(
        headers,
        &[headers::X_IF_MODIFIED_SINCE, headers::IF_MODIFIED_SINCE],
    )?;
    Ok(matches!(since, Some(since) if modified <= since))
}

/// For writes: errors when the collection moved past the client's
/// `X-If-Unmodified-Since`.
pub fn check_unmodified(headers: &HeaderMap, modified: Timestamp) -> ApiResult<()> {
    let since = header_timestamp(headers, &[headers::X_IF_UNMODIFIED_SINCE])?;
    match since {
        Some(since) if modified > since => Err(ApiError::PreconditionFailed),
        _ => Ok(()),
    }
}
