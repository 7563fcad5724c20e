/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The per-user storage engine behind the Sync 1.5 HTTP service.
//!
//! Every user owns one SQLite file holding their collections and BSOs
//! ([`db::UserStore`]). A bounded, sharded pool ([`pool::Pool`]) keeps a
//! limited number of stores open, serializes access per user and evicts
//! idle ones. [`dispatch::Dispatch`] is the uid-keyed facade the HTTP
//! layer talks to.

pub mod bso;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod path;
pub mod pool;
pub mod schema;

pub use crate::bso::{Bso, GetBsosResult, PostResults, PostedBso, Sorting};
pub use crate::db::{UserStore, DEFAULT_BSO_TTL, MAX_BSO_PAYLOAD_SIZE};
pub use crate::dispatch::Dispatch;
pub use crate::error::{Error, Result};
pub use crate::pool::{CancelSignal, Pool, PoolConfig};
