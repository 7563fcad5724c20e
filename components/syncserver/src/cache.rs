/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Response caching for the two endpoints hot enough to matter:
//! `info/collections` (per user) and `info/configuration` (global).
//! Responses are kept in RAM and served without touching a store; any
//! mutating request for a user drops that user's entries *before* it is
//! forwarded, so a concurrent reader sees either a miss or the fresh
//! state, never a stale hit after the write commits.

use crate::extract::headers::{X_IF_MODIFIED_SINCE, X_LAST_MODIFIED};
use crate::state::AppState;
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use types::Timestamp;

/// Responses bigger than this are served but never cached.
const MAX_CACHEABLE_BODY: usize = 1024 * 1024;

// The configuration payload derives only from static limits, so one global
// entry is correct. If per-user limits ever appear this must become
// `config:<uid>`.
const CONFIG_KEY: &str = "config";

fn body_key(uid: &str) -> String {
    format!("body:{}", uid)
}

fn lm_key(uid: &str) -> String {
    format!("lm:{}", uid)
}

pub struct ResponseCache {
    entries: DashMap<String, Bytes>,
    bytes: AtomicUsize,
    max_bytes: usize,
}

impl ResponseCache {
    pub fn new(max_size_mb: usize) -> Self {
        Self {
            entries: DashMap::new(),
            bytes: AtomicUsize::new(0),
            max_bytes: max_size_mb * 1024 * 1024,
        }
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn put(&self, key: String, value: Bytes) {
        if value.len() > MAX_CACHEABLE_BODY {
            return;
        }
        let size = key.len() + value.len();
        if let Some(old) = self.entries.insert(key.clone(), value) {
            self.bytes.fetch_sub(old.len() + key.len(), Ordering::Relaxed);
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.shrink(&key);
    }

    fn remove(&self, key: &str) {
        if let Some((k, v)) = self.entries.remove(key) {
            self.bytes.fetch_sub(k.len() + v.len(), Ordering::Relaxed);
        }
    }

    /// Evict entries (other than the one just written) until we're back
    /// under budget. Which entries go is deliberately unspecified; a stale
    /// entry surviving is fine, a stale entry being *served* is not, and
    /// that's handled by invalidation.
    fn shrink(&self, keep: &str) {
        while self.bytes.load(Ordering::Relaxed) > self.max_bytes {
            let victim = self
                .entries
                .iter()
                .map(|e| e.key().clone())
                .find(|k| k.as_str() != keep);
            match victim {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }

    pub fn invalidate_user(&self, uid: &str) {
        self.remove(&body_key(uid));
        self.remove(&lm_key(uid));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pulls the uid out of a `/1.5/{uid}/...` path.
fn uid_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/1.5/")?;
    let uid = rest.split('/').next()?;
    (!uid.is_empty() && uid.bytes().all(|b| b.is_ascii_digit())).then_some(uid)
}

pub async fn cache_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let Some(uid) = uid_from_path(&path).map(str::to_string) else {
        return next.run(req).await;
    };

    if req.method() == Method::GET {
        let tail = &path["/1.5/".len() + uid.len()..];
        if tail == "/info/collections" {
            return serve_info_collections(&state, &uid, req, next).await;
        }
        if tail == "/info/configuration" {
            return serve_cached_body(&state, CONFIG_KEY, req, next).await;
        }
    } else if req.method() == Method::POST
        || req.method() == Method::PUT
        || req.method() == Method::DELETE
    {
        tracing::debug!(uid = %uid, "cache invalidate");
        state.cache.invalidate_user(&uid);
    }

    next.run(req).await
}

async fn serve_info_collections(
    state: &AppState,
    uid: &str,
    req: Request,
    next: Next,
) -> Response {
    let cache = &state.cache;
    if let (Some(lm), Some(body)) = (cache.get(&lm_key(uid)), cache.get(&body_key(uid))) {
        let lm_str = String::from_utf8_lossy(&lm).to_string();
        if let Ok(lm_ts) = lm_str.parse::<Timestamp>() {
            if let Some(since) = if_modified_since(&req) {
                if lm_ts <= since {
                    return not_modified_response(&lm_str);
                }
            }
        }
        return cached_body_response(body, Some(&lm_str));
    }

    let response = next.run(req).await;
    capture(state, uid, response).await
}

async fn serve_cached_body(state: &AppState, key: &str, req: Request, next: Next) -> Response {
    if let Some(body) = state.cache.get(key) {
        return cached_body_response(body, None);
    }
    let response = next.run(req).await;
    let (parts, bytes) = match collect_body(response).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if parts.status == StatusCode::OK {
        state.cache.put(key.to_string(), bytes.clone());
    }
    Response::from_parts(parts, Body::from(bytes))
}

/// Store a fresh info/collections response on the way out.
async fn capture(state: &AppState, uid: &str, response: Response) -> Response {
    let (parts, bytes) = match collect_body(response).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if parts.status == StatusCode::OK {
        if let Some(lm) = parts
            .headers
            .get(X_LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
        {
            state
                .cache
                .put(lm_key(uid), Bytes::from(lm.as_bytes().to_vec()));
            state.cache.put(body_key(uid), bytes.clone());
            tracing::debug!(uid = %uid, modified = %lm, "cache set info/collections");
        }
    }
    Response::from_parts(parts, Body::from(bytes))
}

async fn collect_body(
    response: Response,
) -> Result<(axum::http::response::Parts, Bytes), Response> {
    let (parts, body) = response.into_parts();
    match to_bytes(body, MAX_CACHEABLE_BODY).await {
        Ok(bytes) => Ok((parts, bytes)),
        Err(e) => {
            tracing::error!(error = %e, "failed to buffer cacheable response");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn if_modified_since(req: &Request) -> Option<Timestamp> {
    req.headers()
        .get(X_IF_MODIFIED_SINCE)
        .or_else(|| req.headers().get(header::IF_MODIFIED_SINCE))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn cached_body_response(body: Bytes, last_modified: Option<&str>) -> Response {
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE.as_str(), "application/json")],
        body,
    )
        .into_response();
    if let Some(lm) = last_modified {
        if let Ok(value) = lm.parse() {
            response.headers_mut().insert(X_LAST_MODIFIED, value);
        }
    }
    response
}

fn not_modified_response(last_modified: &str) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    if let Ok(value) = last_modified.parse() {
        response.headers_mut().insert(X_LAST_MODIFIED, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_from_path() {
        assert_eq!(uid_from_path("/1.5/123/info/collections"), Some("123"));
        assert_eq!(uid_from_path("/1.5/123"), Some("123"));
        assert_eq!(uid_from_path("/1.5/abc/info/collections"), None);
        assert_eq!(uid_from_path("/__heartbeat__"), None);
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = ResponseCache::new(1);
        cache.put(body_key("1"), Bytes::from_static(b"{}"));
        cache.put(lm_key("1"), Bytes::from_static(b"10.00"));
        assert!(cache.get(&body_key("1")).is_some());
        cache.invalidate_user("1");
        assert!(cache.get(&body_key("1")).is_none());
        assert!(cache.get(&lm_key("1")).is_none());
        assert_eq!(cache.bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_budget_eviction() {
        // A tiny budget: entries get evicted, the newest insert survives.
        let cache = ResponseCache {
            entries: DashMap::new(),
            bytes: AtomicUsize::new(0),
            max_bytes: 64,
        };
        for uid in ["1", "2", "3", "4"] {
            cache.put(body_key(uid), Bytes::from(vec![b'x'; 30]));
            assert!(cache.get(&body_key(uid)).is_some());
        }
        assert!(cache.len() < 4);
        assert!(cache.bytes.load(Ordering::Relaxed) <= 64 + 40);
    }

    #[test]
    fn test_oversized_not_cached() {
        let cache = ResponseCache::new(256);
        cache.put(
            body_key("1"),
            Bytes::from(vec![0u8; MAX_CACHEABLE_BODY + 1]),
        );
        assert!(cache.get(&body_key("1")).is_none());
    }
}
