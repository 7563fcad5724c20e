/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Stateless facade translating `(uid, operation)` into a call on the
//! right user's store via the pool. No storage logic lives here.

use crate::bso::{Bso, GetBsosResult, PostResults, PostedBso, Sorting};
use crate::db::DbUsage;
use crate::error::Result;
use crate::pool::{Pool, PoolConfig};
use std::collections::HashMap;
use std::sync::Arc;
use types::Timestamp;

#[derive(Clone)]
pub struct Dispatch {
    pool: Arc<Pool>,
}

impl Dispatch {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pool: Arc::new(Pool::new(config)),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub async fn last_modified(&self, uid: &str) -> Result<Timestamp> {
        self.pool.with_store(uid, |db| db.last_modified()).await
    }

    pub async fn get_collection_id(&self, uid: &str, name: &str) -> Result<i64> {
        let name = name.to_string();
        self.pool
            .with_store(uid, move |db| db.get_collection_id(&name))
            .await
    }

    pub async fn get_or_create_collection_id(&self, uid: &str, name: &str) -> Result<i64> {
        let name = name.to_string();
        self.pool
            .with_store(uid, move |db| db.get_or_create_collection_id(&name))
            .await
    }

    pub async fn create_collection(&self, uid: &str, name: &str) -> Result<i64> {
        let name = name.to_string();
        self.pool
            .with_store(uid, move |db| db.create_collection(&name))
            .await
    }

    pub async fn delete_collection(&self, uid: &str, collection_id: i64) -> Result<Timestamp> {
        self.pool
            .with_store(uid, move |db| db.delete_collection(collection_id))
            .await
    }

    pub async fn touch_collection(
        &self,
        uid: &str,
        collection_id: i64,
        ts: Timestamp,
    ) -> Result<()> {
        self.pool
            .with_store(uid, move |db| db.touch_collection(collection_id, ts))
            .await
    }

    pub async fn collection_modified(&self, uid: &str, collection_id: i64) -> Result<Timestamp> {
        self.pool
            .with_store(uid, move |db| db.collection_modified(collection_id))
            .await
    }

    pub async fn info_collections(&self, uid: &str) -> Result<HashMap<String, Timestamp>> {
        self.pool.with_store(uid, |db| db.info_collections()).await
    }

    pub async fn info_collection_usage(&self, uid: &str) -> Result<HashMap<String, u64>> {
        self.pool
            .with_store(uid, |db| db.info_collection_usage())
            .await
    }

    pub async fn info_collection_counts(&self, uid: &str) -> Result<HashMap<String, u64>> {
        self.pool
            .with_store(uid, |db| db.info_collection_counts())
            .await
    }

    pub async fn storage_used_bytes(&self, uid: &str) -> Result<u64> {
        self.pool.with_store(uid, |db| db.storage_used_bytes()).await
    }

    pub async fn get_bso(&self, uid: &str, collection_id: i64, bso_id: &str) -> Result<Bso> {
        let bso_id = bso_id.to_string();
        self.pool
            .with_store(uid, move |db| db.get_bso(collection_id, &bso_id))
            .await
    }

    pub async fn put_bso(
        &self,
        uid: &str,
        collection_id: i64,
        bso_id: &str,
        payload: Option<String>,
        sortindex: Option<i32>,
        ttl: Option<u64>,
    ) -> Result<Timestamp> {
        let bso_id = bso_id.to_string();
        self.pool
            .with_store(uid, move |db| {
                db.put_bso(collection_id, &bso_id, payload.as_deref(), sortindex, ttl)
            })
            .await
    }

    pub async fn post_bsos(
        &self,
        uid: &str,
        collection_id: i64,
        items: Vec<PostedBso>,
    ) -> Result<PostResults> {
        self.pool
            .with_store(uid, move |db| db.post_bsos(collection_id, &items))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_bsos(
        &self,
        uid: &str,
        collection_id: i64,
        ids: Option<Vec<String>>,
        newer: i64,
        sort: Sorting,
        limit: i64,
        offset: i64,
    ) -> Result<GetBsosResult> {
        self.pool
            .with_store(uid, move |db| {
                db.get_bsos(collection_id, ids.as_deref(), newer, sort, limit, offset)
            })
            .await
    }

    pub async fn delete_bso(
        &self,
        uid: &str,
        collection_id: i64,
        bso_id: &str,
    ) -> Result<Timestamp> {
        let bso_id = bso_id.to_string();
        self.pool
            .with_store(uid, move |db| db.delete_bso(collection_id, &bso_id))
            .await
    }

    pub async fn delete_bsos(
        &self,
        uid: &str,
        collection_id: i64,
        bso_ids: Vec<String>,
    ) -> Result<Timestamp> {
        self.pool
            .with_store(uid, move |db| db.delete_bsos(collection_id, &bso_ids))
            .await
    }

    pub async fn delete_everything(&self, uid: &str) -> Result<Timestamp> {
        self.pool.with_store(uid, |db| db.delete_everything()).await
    }

    pub async fn purge_expired(&self, uid: &str) -> Result<usize> {
        self.pool.with_store(uid, |db| db.purge_expired()).await
    }

    pub async fn usage(&self, uid: &str) -> Result<DbUsage> {
        self.pool.with_store(uid, |db| db.usage()).await
    }

    pub async fn optimize(&self, uid: &str, threshold: f32) -> Result<bool> {
        self.pool
            .with_store(uid, move |db| db.optimize(threshold))
            .await
    }

    pub async fn create_batch(
        &self,
        uid: &str,
        collection_id: i64,
        ttl: u64,
        items: Vec<PostedBso>,
    ) -> Result<i64> {
        self.pool
            .with_store(uid, move |db| db.create_batch(collection_id, ttl, &items))
            .await
    }

    pub async fn append_to_batch(
        &self,
        uid: &str,
        batch_id: i64,
        collection_id: i64,
        items: Vec<PostedBso>,
    ) -> Result<()> {
        self.pool
            .with_store(uid, move |db| {
                db.append_to_batch(batch_id, collection_id, &items)
            })
            .await
    }

    pub async fn batch_exists(&self, uid: &str, batch_id: i64, collection_id: i64) -> Result<bool> {
        self.pool
            .with_store(uid, move |db| db.batch_exists(batch_id, collection_id))
            .await
    }

    pub async fn batch_stats(
        &self,
        uid: &str,
        batch_id: i64,
        collection_id: i64,
    ) -> Result<(usize, usize)> {
        self.pool
            .with_store(uid, move |db| db.batch_stats(batch_id, collection_id))
            .await
    }

    pub async fn commit_batch(
        &self,
        uid: &str,
        batch_id: i64,
        collection_id: i64,
    ) -> Result<PostResults> {
        self.pool
            .with_store(uid, move |db| db.commit_batch(batch_id, collection_id))
            .await
    }

    /// Drain and close everything. See [`Pool::stop`].
    pub async fn stop(&self) {
        self.pool.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::path::PathBuf;
    use std::time::Duration;

    fn dispatch() -> (tempfile::TempDir, Dispatch) {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let d = Dispatch::new(PoolConfig {
            basepath: PathBuf::from(dir.path()),
            num: 4,
            max_size: 10,
            ttl_idle: Duration::from_secs(300),
        });
        (dir, d)
    }

    #[tokio::test]
    async fn test_routes_by_uid() {
        let (_dir, d) = dispatch();
        d.put_bso("100", 7, "b0", Some("for-100".into()), None, None)
            .await
            .unwrap();
        d.put_bso("200", 7, "b0", Some("for-200".into()), None, None)
            .await
            .unwrap();

        assert_eq!(d.get_bso("100", 7, "b0").await.unwrap().payload, "for-100");
        assert_eq!(d.get_bso("200", 7, "b0").await.unwrap().payload, "for-200");
    }

    #[tokio::test]
    async fn test_collections_and_info() {
        let (_dir, d) = dispatch();
        let uid = "123456";
        let cid = d.get_or_create_collection_id(uid, "my_col").await.unwrap();
        assert_eq!(cid, 100);

        let ts = Timestamp::now().add_seconds(5);
        d.touch_collection(uid, 7, ts).await.unwrap();
        let info = d.info_collections(uid).await.unwrap();
        assert_eq!(info["bookmarks"], ts);

        d.delete_collection(uid, cid).await.unwrap();
        assert!(matches!(
            d.get_collection_id(uid, "my_col").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_error_kinds_pass_through() {
        let (_dir, d) = dispatch();
        assert!(matches!(
            d.get_bso("1", 7, "missing").await,
            Err(Error::NotFound)
        ));
        assert!(matches!(
            d.get_bsos("1", 7, None, -1, Sorting::None, 10, 0).await,
            Err(Error::InvalidNewer)
        ));
    }
}
