/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The HTTP surface of the Sync 1.5 storage service. Everything is mounted
//! under `/1.5/{uid}/`; the storage engine lives in the `syncstorage`
//! crate and this crate only parses, validates, routes and renders.

pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod state;

pub use crate::config::Settings;
pub use crate::state::AppState;

use crate::extract::headers::X_WEAVE_TIMESTAMP;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use types::Timestamp;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/__heartbeat__", get(handlers::heartbeat))
        .route("/1.5/{uid}/echo-uid", get(handlers::echo_uid))
        .route("/1.5/{uid}/info/collections", get(handlers::info_collections))
        .route(
            "/1.5/{uid}/info/collection_usage",
            get(handlers::info_collection_usage),
        )
        .route(
            "/1.5/{uid}/info/collection_counts",
            get(handlers::info_collection_counts),
        )
        .route(
            "/1.5/{uid}/info/configuration",
            get(handlers::info_configuration),
        )
        .route("/1.5/{uid}/info/quota", get(handlers::info_quota))
        .route("/1.5/{uid}/storage", delete(handlers::delete_storage))
        .route(
            "/1.5/{uid}/storage/{collection}",
            get(handlers::get_collection)
                .post(handlers::post_collection)
                .delete(handlers::delete_collection),
        )
        .route(
            "/1.5/{uid}/storage/{collection}/{bso}",
            get(handlers::get_bso)
                .put(handlers::put_bso)
                .delete(handlers::delete_bso),
        )
        .layer(DefaultBodyLimit::max(state.settings.limit.max_request_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cache::cache_middleware,
        ))
        .layer(middleware::from_fn(weave_timestamp_middleware));

    // Middleware layers apply in reverse order (outermost last).
    let router = if state.settings.log.disable_http {
        router
    } else {
        router.layer(TraceLayer::new_for_http())
    };
    router.layer(CatchPanicLayer::new()).with_state(state)
}

/// Every response under `/1.5/` reports the server's clock.
async fn weave_timestamp_middleware(req: Request, next: Next) -> Response {
    let is_sync_route = req.uri().path().starts_with("/1.5/");
    let mut response = next.run(req).await;
    if is_sync_route {
        if let Ok(value) = Timestamp::now().to_string().parse() {
            response.headers_mut().insert(X_WEAVE_TIMESTAMP, value);
        }
    }
    response
}
