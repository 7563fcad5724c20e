/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared helpers for driving the full router in tests.

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use syncserver::{create_router, AppState, Settings};
use tower::ServiceExt;

pub struct TestServer {
    pub state: AppState,
    pub router: axum::Router,
    _dir: tempfile::TempDir,
}

pub fn test_server() -> TestServer {
    test_server_with(|_| {})
}

pub fn test_server_with(tweak: impl FnOnce(&mut Settings)) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    settings.pool.num = 2;
    settings.pool.max_size = 4;
    tweak(&mut settings);
    let state = AppState::new(settings);
    TestServer {
        router: create_router(state.clone()),
        state,
        _dir: dir,
    }
}

pub async fn send(
    server: &TestServer,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<String>,
) -> (StatusCode, HeaderMap, String) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let request = builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .expect("request should build");

    let response = server
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("request should not fail at the transport level");

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn get(server: &TestServer, path: &str) -> (StatusCode, HeaderMap, String) {
    send(server, "GET", path, &[], None).await
}

pub async fn post(
    server: &TestServer,
    path: &str,
    body: &str,
) -> (StatusCode, HeaderMap, String) {
    send(server, "POST", path, &[], Some(body.to_string())).await
}

pub async fn put(server: &TestServer, path: &str, body: &str) -> (StatusCode, HeaderMap, String) {
    send(server, "PUT", path, &[], Some(body.to_string())).await
}

pub async fn delete(server: &TestServer, path: &str) -> (StatusCode, HeaderMap, String) {
    send(server, "DELETE", path, &[], None).await
}
