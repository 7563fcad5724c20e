/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Route handlers for the Sync 1.5 storage API.

use crate::error::{ApiError, ApiResult};
use crate::extract::{
    check_unmodified,
    headers::{X_LAST_MODIFIED, X_WEAVE_NEXT_OFFSET, X_WEAVE_RECORDS},
    not_modified, validate_bso_id, validate_collection, validate_uid, BatchRef, RawListQuery,
};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use syncstorage::{Error as StorageError, PostedBso};
use types::Timestamp;

pub async fn heartbeat() -> &'static str {
    "OK"
}

pub async fn echo_uid(Path(uid): Path<String>) -> ApiResult<String> {
    validate_uid(&uid)?;
    Ok(uid)
}

pub async fn info_collections(
    Path(uid): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let modified = state.dispatch.last_modified(uid).await?;
    if not_modified(&headers, modified)? {
        return Ok(status_with_modified(StatusCode::NOT_MODIFIED, modified));
    }
    let info = state.dispatch.info_collections(uid).await?;
    Ok((
        StatusCode::OK,
        [(X_LAST_MODIFIED, modified.to_string())],
        Json(info),
    )
        .into_response())
}

pub async fn info_collection_usage(
    Path(uid): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let usage = state.dispatch.info_collection_usage(uid).await?;
    Ok(Json(usage).into_response())
}

pub async fn info_collection_counts(
    Path(uid): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let counts = state.dispatch.info_collection_counts(uid).await?;
    Ok(Json(counts).into_response())
}

pub async fn info_configuration(
    Path(uid): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    validate_uid(&uid)?;
    Ok(Json(state.settings.limit.info_configuration()).into_response())
}

pub async fn info_quota(
    Path(uid): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let used = state.dispatch.storage_used_bytes(uid).await?;
    Ok(Json(json!([used, state.settings.limit.max_quota_bytes])).into_response())
}

pub async fn get_collection(
    Path((uid, collection)): Path<(String, String)>,
    Query(raw): Query<RawListQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let collection = validate_collection(&collection)?;
    let params = raw.validate()?;

    let cid = match state.dispatch.get_collection_id(uid, collection).await {
        Ok(cid) => cid,
        // Collections spring into being on first write; reading one that
        // was never written is just empty.
        Err(e) if e.is_not_found() => return Ok(Json(json!([])).into_response()),
        Err(e) => return Err(e.into()),
    };

    let modified = state.dispatch.collection_modified(uid, cid).await?;
    if not_modified(&headers, modified)? {
        return Ok(status_with_modified(StatusCode::NOT_MODIFIED, modified));
    }

    let limit = params
        .limit
        .unwrap_or(i64::MAX)
        .min(state.settings.limit.max_bso_get_limit);
    let result = state
        .dispatch
        .get_bsos(
            uid,
            cid,
            params.ids,
            params.newer,
            params.sort,
            limit,
            params.offset,
        )
        .await?;

    let mut response = if params.full {
        (
            StatusCode::OK,
            [
                (X_LAST_MODIFIED, modified.to_string()),
                (X_WEAVE_RECORDS, result.total.to_string()),
            ],
            Json(&result.bsos),
        )
            .into_response()
    } else {
        let ids: Vec<&str> = result.bsos.iter().map(|b| b.id.as_str()).collect();
        (
            StatusCode::OK,
            [
                (X_LAST_MODIFIED, modified.to_string()),
                (X_WEAVE_RECORDS, result.total.to_string()),
            ],
            Json(&ids),
        )
            .into_response()
    };
    if result.more {
        response.headers_mut().insert(
            X_WEAVE_NEXT_OFFSET,
            result
                .offset
                .to_string()
                .parse()
                .expect("offset is a valid header value"),
        );
    }
    Ok(response)
}

pub async fn get_bso(
    Path((uid, collection, bso_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let collection = validate_collection(&collection)?;
    let bso_id = validate_bso_id(&bso_id)?;

    let cid = state.dispatch.get_collection_id(uid, collection).await?;
    let bso = state.dispatch.get_bso(uid, cid, bso_id).await?;
    if not_modified(&headers, bso.modified)? {
        return Ok(status_with_modified(StatusCode::NOT_MODIFIED, bso.modified));
    }
    Ok((
        StatusCode::OK,
        [(X_LAST_MODIFIED, bso.modified.to_string())],
        Json(bso),
    )
        .into_response())
}

/// The body of a PUT: any subset of the three mutable fields.
#[derive(Debug, Default, Deserialize)]
pub struct PutBsoBody {
    #[serde(alias = "Payload")]
    pub payload: Option<String>,
    #[serde(alias = "SortIndex")]
    pub sortindex: Option<i32>,
    #[serde(alias = "TTL")]
    pub ttl: Option<u64>,
}

pub async fn put_bso(
    Path((uid, collection, bso_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let collection = validate_collection(&collection)?;
    let bso_id = validate_bso_id(&bso_id)?;

    let put: PutBsoBody = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid json: {}", e)))?;
    let payload_len = put.payload.as_deref().map_or(0, str::len);
    if payload_len > state.settings.limit.max_record_payload_bytes {
        return Err(ApiError::PayloadTooLarge);
    }

    check_unmodified(&headers, collection_ts(&state, uid, collection).await?)?;
    check_quota(&state, uid, payload_len).await?;

    let cid = state
        .dispatch
        .get_or_create_collection_id(uid, collection)
        .await?;
    let ts = state
        .dispatch
        .put_bso(uid, cid, bso_id, put.payload, put.sortindex, put.ttl)
        .await?;
    Ok(timestamp_response(ts))
}

pub async fn post_collection(
    Path((uid, collection)): Path<(String, String)>,
    Query(raw): Query<RawListQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let collection = validate_collection(&collection)?;
    let limits = &state.settings.limit;

    let items: Vec<PostedBso> = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid json: {}", e)))?;
    if items.len() > limits.max_post_records {
        return Err(ApiError::BadRequest("too many records".into()));
    }
    let posted_bytes: usize = items
        .iter()
        .map(|i| i.payload.as_deref().map_or(0, str::len))
        .sum();
    if posted_bytes > limits.max_post_bytes {
        return Err(ApiError::BadRequest("request payloads too large".into()));
    }
    if items
        .iter()
        .any(|i| i.payload.as_deref().map_or(0, str::len) > limits.max_record_payload_bytes)
    {
        return Err(ApiError::BadRequest("BSO payload too large".into()));
    }

    check_unmodified(&headers, collection_ts(&state, uid, collection).await?)?;
    check_quota(&state, uid, posted_bytes).await?;

    let cid = state
        .dispatch
        .get_or_create_collection_id(uid, collection)
        .await?;

    match raw.batch_ref()? {
        None => {
            let results = state.dispatch.post_bsos(uid, cid, items).await?;
            Ok((
                StatusCode::OK,
                [(X_LAST_MODIFIED, results.modified.to_string())],
                Json(results),
            )
                .into_response())
        }
        Some(BatchRef::New) => {
            let batch = state
                .dispatch
                .create_batch(uid, cid, limits.max_batch_ttl_secs, items)
                .await?;
            Ok(batch_response(batch))
        }
        Some(BatchRef::Existing(batch)) => {
            let (staged_records, staged_bytes) = state
                .dispatch
                .batch_stats(uid, batch, cid)
                .await
                .map_err(bad_batch)?;
            if staged_records + items.len() > limits.max_total_records {
                return Err(ApiError::BadRequest("batch has too many records".into()));
            }
            if staged_bytes + posted_bytes > limits.max_total_bytes {
                return Err(ApiError::BadRequest("batch payloads too large".into()));
            }
            if !items.is_empty() {
                state
                    .dispatch
                    .append_to_batch(uid, batch, cid, items)
                    .await
                    .map_err(bad_batch)?;
            }
            if raw.wants_commit() {
                let results = state
                    .dispatch
                    .commit_batch(uid, batch, cid)
                    .await
                    .map_err(bad_batch)?;
                Ok((
                    StatusCode::OK,
                    [(X_LAST_MODIFIED, results.modified.to_string())],
                    Json(results),
                )
                    .into_response())
            } else {
                Ok(batch_response(batch))
            }
        }
    }
}

pub async fn delete_collection(
    Path((uid, collection)): Path<(String, String)>,
    Query(raw): Query<RawListQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let collection = validate_collection(&collection)?;
    let params = raw.validate()?;

    let cid = match state.dispatch.get_collection_id(uid, collection).await {
        Ok(cid) => cid,
        // Deleting something that never existed already succeeded.
        Err(e) if e.is_not_found() => return Ok("ok".into_response()),
        Err(e) => return Err(e.into()),
    };
    check_unmodified(&headers, state.dispatch.collection_modified(uid, cid).await?)?;

    match params.ids {
        Some(ids) if !ids.is_empty() => {
            let ts = state.dispatch.delete_bsos(uid, cid, ids).await?;
            Ok(timestamp_response(ts))
        }
        _ => {
            let ts = state.dispatch.delete_collection(uid, cid).await?;
            Ok((
                StatusCode::OK,
                [(X_LAST_MODIFIED, ts.to_string())],
                "ok",
            )
                .into_response())
        }
    }
}

pub async fn delete_bso(
    Path((uid, collection, bso_id)): Path<(String, String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let collection = validate_collection(&collection)?;
    let bso_id = validate_bso_id(&bso_id)?;

    let cid = state.dispatch.get_collection_id(uid, collection).await?;
    check_unmodified(&headers, state.dispatch.collection_modified(uid, cid).await?)?;
    let ts = state.dispatch.delete_bso(uid, cid, bso_id).await?;
    Ok(timestamp_response(ts))
}

pub async fn delete_storage(
    Path(uid): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    let uid = validate_uid(&uid)?;
    let ts = state.dispatch.delete_everything(uid).await?;
    Ok((StatusCode::OK, [(X_LAST_MODIFIED, ts.to_string())], "ok").into_response())
}

/// The collection's modified time for precondition checks; a collection
/// that doesn't exist yet has never been modified.
async fn collection_ts(state: &AppState, uid: &str, collection: &str) -> ApiResult<Timestamp> {
    match state.dispatch.get_collection_id(uid, collection).await {
        Ok(cid) => Ok(state.dispatch.collection_modified(uid, cid).await?),
        Err(e) if e.is_not_found() => Ok(Timestamp(0)),
        Err(e) => Err(e.into()),
    }
}

async fn check_quota(state: &AppState, uid: &str, incoming_bytes: usize) -> ApiResult<()> {
    let Some(quota) = state.settings.limit.max_quota_bytes else {
        return Ok(());
    };
    let used = state.dispatch.storage_used_bytes(uid).await?;
    if used + incoming_bytes as u64 > quota {
        return Err(ApiError::QuotaExceeded);
    }
    Ok(())
}

/// New timestamp as a bare JSON number, plus the matching header.
fn timestamp_response(ts: Timestamp) -> Response {
    (StatusCode::OK, [(X_LAST_MODIFIED, ts.to_string())], Json(ts)).into_response()
}

fn status_with_modified(status: StatusCode, ts: Timestamp) -> Response {
    (status, [(X_LAST_MODIFIED, ts.to_string())], ()).into_response()
}

fn batch_response(batch: i64) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "batch": batch.to_string(),
            "success": [],
            "failed": {},
        })),
    )
        .into_response()
}

/// Batch lookups that miss mean the client sent a stale or bogus id.
fn bad_batch(e: StorageError) -> ApiError {
    if e.is_not_found() {
        ApiError::BadRequest("no such batch".into())
    } else {
        e.into()
    }
}
