/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared application state.

use crate::cache::ResponseCache;
use crate::config::Settings;
use std::sync::Arc;
use syncstorage::Dispatch;

#[derive(Clone)]
pub struct AppState {
    pub dispatch: Dispatch,
    pub settings: Arc<Settings>,
    pub cache: Arc<ResponseCache>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let dispatch = Dispatch::new(settings.pool_config());
        let cache = Arc::new(ResponseCache::new(settings.cache.max_cache_size_mb));
        Self {
            dispatch,
            settings: Arc::new(settings),
            cache,
        }
    }
}
