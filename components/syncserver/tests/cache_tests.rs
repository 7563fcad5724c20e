/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod common;

use axum::http::StatusCode;
use common::{get, put, send, test_server};

#[tokio::test]
async fn test_info_collections_is_cached() {
    let server = test_server();
    put(
        &server,
        "/1.5/42/storage/bookmarks/a",
        r#"{"payload":"x"}"#,
    )
    .await;

    let (status, headers, first) = get(&server, "/1.5/42/info/collections").await;
    assert_eq!(status, StatusCode::OK);
    let lm = headers
        .get("X-Last-Modified")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Mutate storage *behind the cache's back*: the HTTP layer never saw a
    // write, so the cached body must still be served verbatim.
    server
        .state
        .dispatch
        .put_bso("42", 4, "sneaky", Some("y".into()), None, None)
        .await
        .unwrap();

    let (status, headers, second) = get(&server, "/1.5/42/info/collections").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(headers.get("X-Last-Modified").unwrap().to_str().unwrap(), lm);
}

#[tokio::test]
async fn test_cache_invalidated_by_write() {
    let server = test_server();
    put(
        &server,
        "/1.5/42/storage/bookmarks/a",
        r#"{"payload":"x"}"#,
    )
    .await;
    let (_, _, before) = get(&server, "/1.5/42/info/collections").await;

    // A mutating request through the HTTP layer drops the cache before it
    // is forwarded.
    put(&server, "/1.5/42/storage/history/b", r#"{"payload":"y"}"#).await;

    let (_, _, after) = get(&server, "/1.5/42/info/collections").await;
    assert_ne!(before, after);
    assert!(after.contains("history"));
}

#[tokio::test]
async fn test_cached_not_modified() {
    let server = test_server();
    put(
        &server,
        "/1.5/42/storage/bookmarks/a",
        r#"{"payload":"x"}"#,
    )
    .await;

    // Prime the cache.
    let (_, headers, _) = get(&server, "/1.5/42/info/collections").await;
    let lm = headers
        .get("X-Last-Modified")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let (status, headers, body) = send(
        &server,
        "GET",
        "/1.5/42/info/collections",
        &[("X-If-Modified-Since", &lm)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());
    assert_eq!(headers.get("X-Last-Modified").unwrap().to_str().unwrap(), lm);
}

#[tokio::test]
async fn test_configuration_cached_globally() {
    let server = test_server();
    let (status, _, first) = get(&server, "/1.5/1/info/configuration").await;
    assert_eq!(status, StatusCode::OK);

    // Served out of the same global entry for any uid.
    let (status, _, second) = get(&server, "/1.5/999/info/configuration").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_different_users_cached_independently() {
    let server = test_server();
    put(&server, "/1.5/1/storage/bookmarks/a", r#"{"payload":"x"}"#).await;
    put(&server, "/1.5/2/storage/history/b", r#"{"payload":"y"}"#).await;

    let (_, _, one) = get(&server, "/1.5/1/info/collections").await;
    let (_, _, two) = get(&server, "/1.5/2/info/collections").await;
    assert!(one.contains("bookmarks"));
    assert!(!one.contains("history"));
    assert!(two.contains("history"));

    // Invalidating user 1 leaves user 2's entry alone.
    put(&server, "/1.5/1/storage/tabs/c", r#"{"payload":"z"}"#).await;
    let (_, _, two_again) = get(&server, "/1.5/2/info/collections").await;
    assert_eq!(two, two_again);
}
