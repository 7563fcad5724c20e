/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The embedded per-user store. One SQLite file per user, with collection
//! and BSO semantics layered on top: monotonic modification timestamps,
//! TTL expiry, sort orders and multi-record upsert.

use crate::bso::{valid_bso_id, valid_collection_name, Bso, GetBsosResult, PostResults, PostedBso, Sorting};
use crate::error::{Error, Result};
use crate::schema::{
    is_static_collection, static_collection_id, StorageConnectionInitializer,
    FIRST_CUSTOM_COLLECTION_ID, META_COLLECTION_SEQ, META_LAST_MODIFIED,
};
use rusqlite::{named_params, types::Value, Connection, Transaction};
use sql_support::open_database::{open_database, open_memory_database};
use sql_support::ConnExt;
use std::collections::HashMap;
use std::path::Path;
use types::Timestamp;

/// Hard cap on a single BSO payload, in bytes.
pub const MAX_BSO_PAYLOAD_SIZE: usize = 256 * 1024;

/// TTL applied to newly inserted BSOs that don't specify one, in seconds.
/// Far enough out to mean "never expires" at the protocol's resolution.
pub const DEFAULT_BSO_TTL: u64 = 2_100_000_000;

/// File-size bookkeeping reported by [`UserStore::usage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DbUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

pub struct UserStore {
    conn: Connection,
    /// Highest timestamp this store has issued. Mirrors the `Meta` row so
    /// monotonicity survives close/reopen.
    last_ts: Timestamp,
}

impl UserStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_database(path, &StorageConnectionInitializer)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = open_memory_database(&StorageConnectionInitializer)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let last_ts = get_meta_ts(&conn, META_LAST_MODIFIED)?;
        Ok(Self { conn, last_ts })
    }

    /// Timestamp for the next write transaction: wall clock, pushed forward
    /// one tick when the clock hasn't advanced past the last issued value.
    fn next_timestamp(&self) -> Timestamp {
        let now = Timestamp::now();
        if now <= self.last_ts {
            self.last_ts.next()
        } else {
            now
        }
    }

    /// Run `f` inside a write transaction with this transaction's timestamp.
    /// On error the transaction rolls back and nothing moves.
    fn write_tx<T>(&mut self, f: impl FnOnce(&Transaction<'_>, Timestamp) -> Result<T>) -> Result<T> {
        let ts = self.next_timestamp();
        let tx = self.conn.transaction()?;
        let out = f(&tx, ts)?;
        tx.commit()?;
        if ts > self.last_ts {
            self.last_ts = ts;
        }
        Ok(out)
    }

    /// Max modified across all collections (the store-wide watermark).
    pub fn last_modified(&self) -> Result<Timestamp> {
        get_meta_ts(&self.conn, META_LAST_MODIFIED)
    }

    pub fn get_collection_id(&self, name: &str) -> Result<i64> {
        if let Some(id) = static_collection_id(name) {
            return Ok(id);
        }
        self.conn
            .try_query_one("SELECT Id FROM Collections WHERE Name = ?1", [name])?
            .ok_or(Error::NotFound)
    }

    pub fn collection_modified(&self, collection_id: i64) -> Result<Timestamp> {
        self.conn
            .try_query_one(
                "SELECT Modified FROM Collections WHERE Id = ?1",
                [collection_id],
            )?
            .ok_or(Error::NotFound)
    }

    pub fn create_collection(&mut self, name: &str) -> Result<i64> {
        if !valid_collection_name(name) {
            return Err(Error::InvalidCollectionName(name.into()));
        }
        if self.get_collection_id(name).is_ok() {
            return Err(Error::CollectionExists);
        }
        self.write_tx(|tx, ts| {
            let seq: i64 = tx
                .try_query_one("SELECT Value FROM Meta WHERE Key = ?1", [META_COLLECTION_SEQ])?
                .unwrap_or(FIRST_CUSTOM_COLLECTION_ID - 1);
            let id = seq.max(FIRST_CUSTOM_COLLECTION_ID - 1) + 1;
            tx.execute_cached(
                "UPDATE Meta SET Value = ?2 WHERE Key = ?1",
                (META_COLLECTION_SEQ, id),
            )?;
            tx.execute_cached(
                "INSERT INTO Collections (Id, Name, Modified, Visible) VALUES (?1, ?2, ?3, 1)",
                (id, name, ts),
            )?;
            bump_last_modified(tx, ts)?;
            Ok(id)
        })
    }

    pub fn get_or_create_collection_id(&mut self, name: &str) -> Result<i64> {
        match self.get_collection_id(name) {
            Err(Error::NotFound) => self.create_collection(name),
            other => other,
        }
    }

    /// Removes all of a collection's BSOs (and staged batches). Custom
    /// collection rows are dropped; static rows stay, advance their
    /// modified time to the delete and drop out of the info listings.
    pub fn delete_collection(&mut self, collection_id: i64) -> Result<Timestamp> {
        self.write_tx(|tx, ts| {
            let known: Option<i64> =
                tx.try_query_one("SELECT 1 FROM Collections WHERE Id = ?1", [collection_id])?;
            if known.is_none() {
                return Err(Error::NotFound);
            }
            tx.execute_cached("DELETE FROM Bsos WHERE CollectionId = ?1", [collection_id])?;
            tx.execute_cached("DELETE FROM Batches WHERE CollectionId = ?1", [collection_id])?;
            if is_static_collection(collection_id) {
                tx.execute_cached(
                    "UPDATE Collections SET Modified = MAX(Modified, ?2), Visible = 0
                     WHERE Id = ?1",
                    (collection_id, ts),
                )?;
            } else {
                tx.execute_cached("DELETE FROM Collections WHERE Id = ?1", [collection_id])?;
            }
            bump_last_modified(tx, ts)?;
            Ok(ts)
        })
    }

    /// Sets a collection's modified time to `max(current, ts)`.
    pub fn touch_collection(&mut self, collection_id: i64, ts: Timestamp) -> Result<()> {
        self.write_tx(|tx, _| {
            let rows = tx.execute_cached(
                "UPDATE Collections SET Modified = MAX(Modified, ?2), Visible = 1
                 WHERE Id = ?1",
                (collection_id, ts),
            )?;
            if rows == 0 {
                return Err(Error::NotFound);
            }
            bump_last_modified(tx, ts)?;
            Ok(())
        })
    }

    /// Per-collection modified times. Pre-seeded static rows that were
    /// never written to, and collections since deleted, are excluded.
    pub fn info_collections(&self) -> Result<HashMap<String, Timestamp>> {
        let rows = self.conn.query_rows_and_then_cached::<_, Error, _, _>(
            "SELECT Name, Modified FROM Collections WHERE Visible = 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Timestamp>(1)?)),
        )?;
        Ok(rows.into_iter().collect())
    }

    /// Live payload bytes per collection.
    pub fn info_collection_usage(&self) -> Result<HashMap<String, u64>> {
        let now = Timestamp::now();
        let rows = self.conn.query_rows_and_then_cached::<_, Error, _, _>(
            "SELECT c.Name, SUM(b.PayloadSize)
             FROM Bsos b
             JOIN Collections c ON c.Id = b.CollectionId
             WHERE b.Ttl > :now
             GROUP BY b.CollectionId",
            named_params! { ":now": now },
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64)),
        )?;
        Ok(rows.into_iter().collect())
    }

    /// Live BSO counts per collection.
    pub fn info_collection_counts(&self) -> Result<HashMap<String, u64>> {
        let now = Timestamp::now();
        let rows = self.conn.query_rows_and_then_cached::<_, Error, _, _>(
            "SELECT c.Name, COUNT(*)
             FROM Bsos b
             JOIN Collections c ON c.Id = b.CollectionId
             WHERE b.Ttl > :now
             GROUP BY b.CollectionId",
            named_params! { ":now": now },
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64)),
        )?;
        Ok(rows.into_iter().collect())
    }

    /// Total live payload bytes, for quota accounting.
    pub fn storage_used_bytes(&self) -> Result<u64> {
        let now = Timestamp::now();
        let used: i64 = self.conn.try_query_one(
            "SELECT COALESCE(SUM(PayloadSize), 0) FROM Bsos WHERE Ttl > ?1",
            [now],
        )?
        .unwrap_or(0);
        Ok(used.max(0) as u64)
    }

    /// A single BSO. Expired records are indistinguishable from absent ones.
    pub fn get_bso(&self, collection_id: i64, bso_id: &str) -> Result<Bso> {
        let now = Timestamp::now();
        self.conn
            .try_query_row(
                "SELECT Id, Modified, Payload, SortIndex, Ttl FROM Bsos
                 WHERE CollectionId = :cid AND Id = :bid AND Ttl > :now",
                named_params! { ":cid": collection_id, ":bid": bso_id, ":now": now },
                row_to_bso,
            )?
            .ok_or(Error::NotFound)
    }

    /// Insert or partially update one BSO. Returns the collection's modified
    /// time after the write. A pure TTL touch (only `ttl` supplied on an
    /// existing record) does not bump any modified values.
    pub fn put_bso(
        &mut self,
        collection_id: i64,
        bso_id: &str,
        payload: Option<&str>,
        sortindex: Option<i32>,
        ttl: Option<u64>,
    ) -> Result<Timestamp> {
        if !valid_bso_id(bso_id) {
            return Err(Error::InvalidBsoId(bso_id.into()));
        }
        if let Some(p) = payload {
            if p.len() > MAX_BSO_PAYLOAD_SIZE {
                return Err(Error::PayloadTooLarge(p.len()));
            }
        }
        self.write_tx(|tx, ts| {
            let bumped = put_bso_in_tx(tx, ts, collection_id, bso_id, payload, sortindex, ttl)?;
            if bumped {
                Ok(ts)
            } else {
                collection_modified_in_tx(tx, collection_id)
            }
        })
    }

    /// Per-item upsert of many BSOs in one transaction. Item failures are
    /// collected into the result and never abort the batch; only backend
    /// errors do.
    pub fn post_bsos(&mut self, collection_id: i64, items: &[PostedBso]) -> Result<PostResults> {
        self.write_tx(|tx, ts| {
            let mut results = PostResults {
                modified: ts,
                ..Default::default()
            };
            post_items_in_tx(tx, ts, collection_id, items, &mut results)?;
            Ok(results)
        })
    }

    /// Query a collection. `ids` narrows to the given set, `newer` filters
    /// strictly-after, then `sort` and `limit`/`offset` shape the page.
    pub fn get_bsos(
        &self,
        collection_id: i64,
        ids: Option<&[String]>,
        newer: i64,
        sort: Sorting,
        limit: i64,
        offset: i64,
    ) -> Result<GetBsosResult> {
        if limit < 1 {
            return Err(Error::InvalidLimit);
        }
        if offset < 0 {
            return Err(Error::InvalidOffset);
        }
        if newer < 0 {
            return Err(Error::InvalidNewer);
        }

        let now = Timestamp::now();
        let mut where_sql =
            "CollectionId = ?1 AND Ttl > ?2 AND Modified > ?3".to_string();
        let mut values: Vec<Value> = vec![
            Value::Integer(collection_id),
            Value::Integer(now.as_centis() as i64),
            Value::Integer(newer),
        ];
        if let Some(ids) = ids {
            if !ids.is_empty() {
                let mut placeholders = Vec::with_capacity(ids.len());
                for id in ids {
                    values.push(Value::Text(id.clone()));
                    placeholders.push(format!("?{}", values.len()));
                }
                where_sql.push_str(&format!(" AND Id IN ({})", placeholders.join(",")));
            }
        }

        let total: usize = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM Bsos WHERE {}", where_sql),
            rusqlite::params_from_iter(values.iter()),
            |row| row.get::<_, i64>(0).map(|n| n.max(0) as usize),
        )?;

        let order_sql = match sort {
            Sorting::None => "",
            Sorting::Newest => " ORDER BY Modified DESC",
            Sorting::Oldest => " ORDER BY Modified ASC",
            Sorting::Index => " ORDER BY SortIndex DESC, Modified DESC",
        };
        let sql = format!(
            "SELECT Id, Modified, Payload, SortIndex, Ttl FROM Bsos
             WHERE {}{} LIMIT {} OFFSET {}",
            where_sql, order_sql, limit, offset
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bsos = stmt
            .query_and_then(rusqlite::params_from_iter(values.iter()), row_to_bso)?
            .collect::<Result<Vec<Bso>>>()?;

        let next = offset + bsos.len() as i64;
        let more = (next as usize) < total;
        Ok(GetBsosResult {
            bsos,
            total,
            more,
            offset: next,
        })
    }

    /// Delete one BSO, returning the collection's new modified time.
    pub fn delete_bso(&mut self, collection_id: i64, bso_id: &str) -> Result<Timestamp> {
        self.delete_bsos(collection_id, std::slice::from_ref(&bso_id.to_string()))
    }

    /// Delete a set of BSOs; NotFound when nothing (live) matched.
    pub fn delete_bsos(&mut self, collection_id: i64, bso_ids: &[String]) -> Result<Timestamp> {
        if bso_ids.is_empty() {
            return Err(Error::NotFound);
        }
        self.write_tx(|tx, ts| {
            let mut sql = "DELETE FROM Bsos WHERE CollectionId = ?1 AND Ttl > ?2".to_string();
            let mut values: Vec<Value> = vec![
                Value::Integer(collection_id),
                Value::Integer(ts.as_centis() as i64),
            ];
            let mut placeholders = Vec::with_capacity(bso_ids.len());
            for id in bso_ids {
                values.push(Value::Text(id.clone()));
                placeholders.push(format!("?{}", values.len()));
            }
            sql.push_str(&format!(" AND Id IN ({})", placeholders.join(",")));
            let deleted = tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            if deleted == 0 {
                return Err(Error::NotFound);
            }
            touch_collection_in_tx(tx, collection_id, ts)?;
            Ok(ts)
        })
    }

    /// Wipe every collection and BSO this user has.
    pub fn delete_everything(&mut self) -> Result<Timestamp> {
        self.write_tx(|tx, ts| {
            tx.execute_cached("DELETE FROM Bsos", [])?;
            tx.execute_cached("DELETE FROM Batches", [])?;
            tx.execute_cached(
                "DELETE FROM Collections WHERE Id >= ?1",
                [FIRST_CUSTOM_COLLECTION_ID],
            )?;
            tx.execute_cached(
                "UPDATE Collections SET Modified = MAX(Modified, ?1), Visible = 0",
                [ts],
            )?;
            bump_last_modified(tx, ts)?;
            Ok(ts)
        })
    }

    /// Reclaim expired BSOs (and expired staging batches). Returns how many
    /// BSOs went away.
    pub fn purge_expired(&mut self) -> Result<usize> {
        self.write_tx(|tx, ts| {
            let bsos = tx.execute_cached("DELETE FROM Bsos WHERE Ttl <= ?1", [ts])?;
            let batches = tx.execute_cached("DELETE FROM Batches WHERE Expiry <= ?1", [ts])?;
            if batches > 0 {
                log::debug!("purged {} expired batches", batches);
            }
            Ok(bsos)
        })
    }

    pub fn usage(&self) -> Result<DbUsage> {
        let page_size: i64 = self.pragma("page_size")?;
        let page_count: i64 = self.pragma("page_count")?;
        let freelist: i64 = self.pragma("freelist_count")?;
        Ok(DbUsage {
            total_bytes: (page_size * page_count).max(0) as u64,
            free_bytes: (page_size * freelist).max(0) as u64,
        })
    }

    /// VACUUM when at least `threshold` of the file is free pages. Returns
    /// whether a vacuum ran.
    pub fn optimize(&mut self, threshold: f32) -> Result<bool> {
        let usage = self.usage()?;
        if usage.total_bytes == 0 {
            return Ok(false);
        }
        let frac = usage.free_bytes as f32 / usage.total_bytes as f32;
        if frac < threshold {
            return Ok(false);
        }
        self.conn.execute_batch("VACUUM")?;
        Ok(true)
    }

    fn pragma(&self, name: &str) -> Result<i64> {
        Ok(self
            .conn
            .pragma_query_value(None, name, |row| row.get(0))?)
    }

    // Batch upload staging.

    /// Open a new staging batch holding `items`, expiring `ttl` seconds out.
    pub fn create_batch(&mut self, collection_id: i64, ttl: u64, items: &[PostedBso]) -> Result<i64> {
        let line = serde_json::to_string(items)?;
        self.write_tx(|tx, ts| {
            tx.execute_cached(
                "INSERT INTO Batches (CollectionId, Created, Expiry, ItemCount, ByteCount, Items)
                 VALUES (:cid, :created, :expiry, :count, :bytes, :items || char(10))",
                named_params! {
                    ":cid": collection_id,
                    ":created": ts,
                    ":expiry": ts.add_seconds(ttl),
                    ":count": items.len() as i64,
                    ":bytes": staged_bytes(items),
                    ":items": line,
                },
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Append more items to an open batch. NotFound once it has expired or
    /// been committed.
    pub fn append_to_batch(&mut self, batch_id: i64, collection_id: i64, items: &[PostedBso]) -> Result<()> {
        let line = serde_json::to_string(items)?;
        self.write_tx(|tx, ts| {
            let rows = tx.execute_cached(
                "UPDATE Batches SET
                    Items = Items || :items || char(10),
                    ItemCount = ItemCount + :count,
                    ByteCount = ByteCount + :bytes
                 WHERE Id = :id AND CollectionId = :cid AND Expiry > :now",
                named_params! {
                    ":items": line,
                    ":count": items.len() as i64,
                    ":bytes": staged_bytes(items),
                    ":id": batch_id,
                    ":cid": collection_id,
                    ":now": ts,
                },
            )?;
            if rows == 0 {
                return Err(Error::NotFound);
            }
            Ok(())
        })
    }

    /// How much a live batch has staged so far: (records, payload bytes).
    pub fn batch_stats(&self, batch_id: i64, collection_id: i64) -> Result<(usize, usize)> {
        let now = Timestamp::now();
        self.conn
            .try_query_row(
                "SELECT ItemCount, ByteCount FROM Batches
                 WHERE Id = ?1 AND CollectionId = ?2 AND Expiry > ?3",
                (batch_id, collection_id, now),
                |row| {
                    Ok::<_, Error>((
                        row.get::<_, i64>(0)?.max(0) as usize,
                        row.get::<_, i64>(1)?.max(0) as usize,
                    ))
                },
            )?
            .ok_or(Error::NotFound)
    }

    pub fn batch_exists(&self, batch_id: i64, collection_id: i64) -> Result<bool> {
        let now = Timestamp::now();
        let found: Option<i64> = self.conn.try_query_one(
            "SELECT 1 FROM Batches WHERE Id = ?1 AND CollectionId = ?2 AND Expiry > ?3",
            (batch_id, collection_id, now),
        )?;
        Ok(found.is_some())
    }

    /// Apply everything staged in a batch as a single upsert transaction,
    /// then discard the batch.
    pub fn commit_batch(&mut self, batch_id: i64, collection_id: i64) -> Result<PostResults> {
        self.write_tx(|tx, ts| {
            let staged: Option<String> = tx.try_query_one(
                "SELECT Items FROM Batches WHERE Id = ?1 AND CollectionId = ?2 AND Expiry > ?3",
                (batch_id, collection_id, ts),
            )?;
            let staged = staged.ok_or(Error::NotFound)?;
            let mut results = PostResults {
                modified: ts,
                ..Default::default()
            };
            for line in staged.lines().filter(|l| !l.is_empty()) {
                let items: Vec<PostedBso> = serde_json::from_str(line)?;
                post_items_in_tx(tx, ts, collection_id, &items, &mut results)?;
            }
            tx.execute_cached("DELETE FROM Batches WHERE Id = ?1", [batch_id])?;
            Ok(results)
        })
    }
}

impl Drop for UserStore {
    fn drop(&mut self) {
        // In line with the SQLite recommendation, run `PRAGMA optimize`
        // before closing the connection.
        if let Err(e) = self.conn.execute_batch("PRAGMA optimize(0x02);") {
            log::warn!("Failed to execute pragma optimize (DB locked?): {}", e);
        }
    }
}

fn row_to_bso(row: &rusqlite::Row<'_>) -> Result<Bso> {
    Ok(Bso {
        id: row.get(0)?,
        modified: row.get(1)?,
        payload: row.get(2)?,
        sortindex: row.get(3)?,
        expiry: row.get(4)?,
    })
}

fn get_meta_ts(conn: &Connection, key: &str) -> Result<Timestamp> {
    Ok(conn
        .try_query_one("SELECT Value FROM Meta WHERE Key = ?1", [key])?
        .unwrap_or_default())
}

fn bump_last_modified(tx: &Transaction<'_>, ts: Timestamp) -> Result<()> {
    tx.execute_cached(
        "UPDATE Meta SET Value = MAX(Value, ?2) WHERE Key = ?1",
        (META_LAST_MODIFIED, ts),
    )?;
    Ok(())
}

fn collection_modified_in_tx(tx: &Transaction<'_>, collection_id: i64) -> Result<Timestamp> {
    Ok(tx
        .try_query_one(
            "SELECT Modified FROM Collections WHERE Id = ?1",
            [collection_id],
        )?
        .unwrap_or_default())
}

fn touch_collection_in_tx(tx: &Transaction<'_>, collection_id: i64, ts: Timestamp) -> Result<()> {
    // The row may not exist yet for implicitly created collections; the
    // callers that can hit that path insert it first.
    tx.execute_cached(
        "UPDATE Collections SET Modified = MAX(Modified, ?2), Visible = 1 WHERE Id = ?1",
        (collection_id, ts),
    )?;
    bump_last_modified(tx, ts)
}

/// Upsert one BSO inside an open transaction. Returns whether the write
/// bumped modification times (a pure TTL touch doesn't).
fn put_bso_in_tx(
    tx: &Transaction<'_>,
    ts: Timestamp,
    collection_id: i64,
    bso_id: &str,
    payload: Option<&str>,
    sortindex: Option<i32>,
    ttl: Option<u64>,
) -> Result<bool> {
    let exists: Option<i64> = tx.try_query_one(
        "SELECT 1 FROM Bsos WHERE CollectionId = ?1 AND Id = ?2",
        (collection_id, bso_id),
    )?;

    if exists.is_none() {
        if payload.is_none() && sortindex.is_none() && ttl.is_none() {
            return Err(Error::NothingToDo);
        }
        let payload = payload.unwrap_or("");
        tx.execute_cached(
            "INSERT INTO Bsos (CollectionId, Id, SortIndex, Modified, Payload, PayloadSize, Ttl)
             VALUES (:cid, :bid, :sortindex, :modified, :payload, :payload_size, :ttl)",
            named_params! {
                ":cid": collection_id,
                ":bid": bso_id,
                ":sortindex": sortindex.unwrap_or(0),
                ":modified": ts,
                ":payload": payload,
                ":payload_size": payload.len() as i64,
                ":ttl": ts.add_seconds(ttl.unwrap_or(DEFAULT_BSO_TTL)),
            },
        )?;
        touch_collection_in_tx(tx, collection_id, ts)?;
        return Ok(true);
    }

    if payload.is_none() && sortindex.is_none() {
        match ttl {
            // Nothing supplied at all: leave the record alone.
            None => return Ok(false),
            // Pure TTL touch: expiry is recomputed from the record's own
            // modified time and `Modified` stays put.
            Some(ttl) => {
                tx.execute_cached(
                    "UPDATE Bsos SET Ttl = Modified + :ttl * 100
                     WHERE CollectionId = :cid AND Id = :bid",
                    named_params! {
                        ":ttl": ttl as i64,
                        ":cid": collection_id,
                        ":bid": bso_id,
                    },
                )?;
                return Ok(false);
            }
        }
    }

    tx.execute_cached(
        "UPDATE Bsos SET
            Payload = COALESCE(:payload, Payload),
            PayloadSize = COALESCE(:payload_size, PayloadSize),
            SortIndex = COALESCE(:sortindex, SortIndex),
            Modified = :modified,
            Ttl = CASE WHEN :ttl IS NULL THEN Ttl ELSE :modified + :ttl * 100 END
         WHERE CollectionId = :cid AND Id = :bid",
        named_params! {
            ":payload": payload,
            ":payload_size": payload.map(|p| p.len() as i64),
            ":sortindex": sortindex,
            ":modified": ts,
            ":ttl": ttl.map(|t| t as i64),
            ":cid": collection_id,
            ":bid": bso_id,
        },
    )?;
    touch_collection_in_tx(tx, collection_id, ts)?;
    Ok(true)
}

fn staged_bytes(items: &[PostedBso]) -> i64 {
    items
        .iter()
        .map(|i| i.payload.as_deref().map_or(0, str::len) as i64)
        .sum()
}

/// The shared per-item loop behind `post_bsos` and `commit_batch`.
fn post_items_in_tx(
    tx: &Transaction<'_>,
    ts: Timestamp,
    collection_id: i64,
    items: &[PostedBso],
    results: &mut PostResults,
) -> Result<()> {
    for item in items {
        let id = match &item.id {
            Some(id) if valid_bso_id(id) => id.clone(),
            Some(id) => {
                results.failed.insert(id.clone(), "invalid bso id".into());
                continue;
            }
            None => {
                results.failed.insert(String::new(), "missing bso id".into());
                continue;
            }
        };
        if item.payload.as_deref().map_or(false, |p| p.len() > MAX_BSO_PAYLOAD_SIZE) {
            results.failed.insert(id, "payload too large".into());
            continue;
        }
        match put_bso_in_tx(
            tx,
            ts,
            collection_id,
            &id,
            item.payload.as_deref(),
            item.sortindex,
            item.ttl,
        ) {
            Ok(_) => results.success.push(id),
            Err(e) if e.is_backend() => return Err(e),
            Err(e) => {
                results.failed.insert(id, e.to_string());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> UserStore {
        let _ = env_logger::try_init();
        UserStore::open_in_memory().expect("should open a memory store")
    }

    fn put(db: &mut UserStore, cid: i64, bid: &str, payload: &str, sortindex: i32) -> Timestamp {
        db.put_bso(cid, bid, Some(payload), Some(sortindex), None)
            .expect("put_bso should work")
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("12345.db");
        let db = UserStore::open(&path).unwrap();
        assert_eq!(db.last_modified().unwrap(), Timestamp(0));
        assert!(path.exists());
    }

    #[test]
    fn test_static_collection_ids() {
        let db = store();
        for (id, name) in crate::schema::STATIC_COLLECTIONS {
            assert_eq!(db.get_collection_id(name).unwrap(), *id, "{}", name);
        }
        assert!(matches!(
            db.get_collection_id("nope"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_custom_collections_start_at_100() {
        let mut db = store();
        assert_eq!(db.create_collection("col1").unwrap(), 100);
        assert_eq!(db.create_collection("col2").unwrap(), 101);
        assert_eq!(db.get_collection_id("col1").unwrap(), 100);
        assert!(matches!(
            db.create_collection("col1"),
            Err(Error::CollectionExists)
        ));
        assert!(matches!(
            db.create_collection("bookmarks"),
            Err(Error::CollectionExists)
        ));
    }

    #[test]
    fn test_collection_ids_not_reused() {
        let mut db = store();
        let id = db.create_collection("doomed").unwrap();
        assert_eq!(id, 100);
        db.delete_collection(id).unwrap();
        assert_eq!(db.create_collection("fresh").unwrap(), 101);
    }

    #[test]
    fn test_put_insert_defaults() {
        let mut db = store();
        db.put_bso(1, "b0", None, Some(3), None).unwrap();
        let bso = db.get_bso(1, "b0").unwrap();
        assert_eq!(bso.payload, "");
        assert_eq!(bso.sortindex, 3);
        assert_eq!(bso.expiry, bso.modified.add_seconds(DEFAULT_BSO_TTL));
    }

    #[test]
    fn test_put_nothing_to_do() {
        let mut db = store();
        assert!(matches!(
            db.put_bso(1, "missing", None, None, None),
            Err(Error::NothingToDo)
        ));
    }

    #[test]
    fn test_put_partial_updates() {
        let mut db = store();
        let ts1 = put(&mut db, 1, "b1", "initial", 1);

        // Update only the payload; sortindex survives.
        let ts2 = db.put_bso(1, "b1", Some("updated"), None, None).unwrap();
        assert!(ts2 > ts1);
        let bso = db.get_bso(1, "b1").unwrap();
        assert_eq!(bso.payload, "updated");
        assert_eq!(bso.sortindex, 1);
        assert_eq!(bso.modified, ts2);

        // Update only the sortindex; payload survives.
        let ts3 = db.put_bso(1, "b1", None, Some(2), None).unwrap();
        let bso = db.get_bso(1, "b1").unwrap();
        assert_eq!(bso.payload, "updated");
        assert_eq!(bso.sortindex, 2);
        assert_eq!(bso.modified, ts3);
    }

    #[test]
    fn test_ttl_touch_does_not_bump_modified() {
        let mut db = store();
        let ts1 = put(&mut db, 1, "b1", "hello", 1);

        db.put_bso(1, "b1", None, None, Some(1000)).unwrap();
        let bso = db.get_bso(1, "b1").unwrap();
        assert_eq!(bso.modified, ts1);
        assert_eq!(bso.expiry, ts1.add_seconds(1000));

        // Collection modified untouched as well.
        assert_eq!(db.collection_modified(1).unwrap(), ts1);
    }

    #[test]
    fn test_ttl_with_other_fields_bumps_modified() {
        let mut db = store();
        let ts1 = put(&mut db, 1, "b1", "hello", 1);
        let ts2 = db
            .put_bso(1, "b1", Some("fresh"), None, Some(500))
            .unwrap();
        assert!(ts2 > ts1);
        let bso = db.get_bso(1, "b1").unwrap();
        assert_eq!(bso.modified, ts2);
        assert_eq!(bso.expiry, ts2.add_seconds(500));
    }

    #[test]
    fn test_expired_bso_invisible() {
        let mut db = store();
        db.put_bso(1, "gone", Some("x"), None, Some(0)).unwrap();
        assert!(matches!(db.get_bso(1, "gone"), Err(Error::NotFound)));
        let res = db.get_bsos(1, None, 0, Sorting::None, 10, 0).unwrap();
        assert_eq!(res.total, 0);
        assert_eq!(db.info_collection_counts().unwrap().get("clients"), None);
    }

    #[test]
    fn test_get_bsos_validation() {
        let db = store();
        assert!(matches!(
            db.get_bsos(1, None, 0, Sorting::Index, -1, 0),
            Err(Error::InvalidLimit)
        ));
        assert!(matches!(
            db.get_bsos(1, None, 0, Sorting::Index, 0, 0),
            Err(Error::InvalidLimit)
        ));
        assert!(matches!(
            db.get_bsos(1, None, 0, Sorting::Index, 5, -1),
            Err(Error::InvalidOffset)
        ));
        assert!(matches!(
            db.get_bsos(1, None, -1, Sorting::None, 10, 0),
            Err(Error::InvalidNewer)
        ));
    }

    #[test]
    fn test_get_bsos_limit_offset() {
        let mut db = store();
        for i in 0..12 {
            put(&mut db, 1, &i.to_string(), &format!("payload-{}", i), i);
        }

        let page1 = db.get_bsos(1, None, 0, Sorting::Newest, 5, 0).unwrap();
        assert_eq!(page1.bsos.len(), 5);
        assert_eq!(page1.total, 12);
        assert!(page1.more);
        assert_eq!(page1.offset, 5);
        assert_eq!(page1.bsos[0].id, "11");
        assert_eq!(page1.bsos[4].id, "7");

        let page2 = db
            .get_bsos(1, None, 0, Sorting::Newest, 5, page1.offset)
            .unwrap();
        assert_eq!(page2.bsos.len(), 5);
        assert!(page2.more);
        assert_eq!(page2.offset, 10);
        assert_eq!(page2.bsos[0].id, "6");
        assert_eq!(page2.bsos[4].id, "2");

        let page3 = db
            .get_bsos(1, None, 0, Sorting::Newest, 5, page2.offset)
            .unwrap();
        assert_eq!(page3.bsos.len(), 2);
        assert!(!page3.more);
        assert_eq!(page3.bsos[0].id, "1");
        assert_eq!(page3.bsos[1].id, "0");
    }

    #[test]
    fn test_get_bsos_newer() {
        let mut db = store();
        let ts0 = put(&mut db, 1, "b2", "a", 1);
        let ts1 = put(&mut db, 1, "b1", "a", 1);
        let ts2 = put(&mut db, 1, "b0", "a", 1);
        assert!(ts0 < ts1 && ts1 < ts2);

        let all = db
            .get_bsos(1, None, ts0.as_centis() as i64 - 1, Sorting::Newest, 10, 0)
            .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(
            all.bsos.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
            vec!["b0", "b1", "b2"]
        );

        let after0 = db
            .get_bsos(1, None, ts0.as_centis() as i64, Sorting::Newest, 10, 0)
            .unwrap();
        assert_eq!(after0.total, 2);
        assert_eq!(after0.bsos[0].id, "b0");
        assert_eq!(after0.bsos[1].id, "b1");

        let after2 = db
            .get_bsos(1, None, ts2.as_centis() as i64, Sorting::Newest, 10, 0)
            .unwrap();
        assert_eq!(after2.total, 0);
    }

    #[test]
    fn test_get_bsos_sort_orders() {
        let mut db = store();
        put(&mut db, 1, "b2", "a", 2);
        put(&mut db, 1, "b1", "a", 0);
        put(&mut db, 1, "b0", "a", 1);

        let ids = |sort| {
            db.get_bsos(1, None, 0, sort, 10, 0)
                .unwrap()
                .bsos
                .into_iter()
                .map(|b| b.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(Sorting::Newest), vec!["b0", "b1", "b2"]);
        assert_eq!(ids(Sorting::Oldest), vec!["b2", "b1", "b0"]);
        assert_eq!(ids(Sorting::Index), vec!["b2", "b0", "b1"]);
    }

    #[test]
    fn test_get_bsos_ids_filter() {
        let mut db = store();
        for id in ["a", "b", "c", "d"] {
            put(&mut db, 1, id, "x", 0);
        }
        let got = db
            .get_bsos(
                1,
                Some(&["a".to_string(), "c".to_string(), "zz".to_string()]),
                0,
                Sorting::Oldest,
                10,
                0,
            )
            .unwrap();
        assert_eq!(
            got.bsos.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );

        // An empty id set is a no-op filter.
        let all = db.get_bsos(1, Some(&[]), 0, Sorting::Oldest, 10, 0).unwrap();
        assert_eq!(all.total, 4);
    }

    #[test]
    fn test_post_bsos() {
        let mut db = store();
        let items: Vec<PostedBso> = vec![
            PostedBso {
                id: Some("b0".into()),
                payload: Some("a".into()),
                sortindex: Some(1),
                ttl: None,
            },
            PostedBso {
                id: Some("invalid\tid".into()),
                payload: Some("a".into()),
                ..Default::default()
            },
            PostedBso {
                id: Some("b1".into()),
                payload: Some("a".into()),
                sortindex: Some(1),
                ttl: None,
            },
        ];
        let results = db.post_bsos(1, &items).unwrap();
        assert_eq!(results.success, vec!["b0", "b1"]);
        assert_eq!(results.failed.len(), 1);
        assert!(results.failed.contains_key("invalid\tid"));
        assert_eq!(db.collection_modified(1).unwrap(), results.modified);

        // Partial updates apply per item.
        let update: Vec<PostedBso> = vec![
            PostedBso {
                id: Some("b0".into()),
                sortindex: Some(2),
                ..Default::default()
            },
            PostedBso {
                id: Some("b1".into()),
                payload: Some("b".into()),
                ..Default::default()
            },
        ];
        db.post_bsos(1, &update).unwrap();

        let b0 = db.get_bso(1, "b0").unwrap();
        assert_eq!(b0.payload, "a");
        assert_eq!(b0.sortindex, 2);
        let b1 = db.get_bso(1, "b1").unwrap();
        assert_eq!(b1.payload, "b");
        assert_eq!(b1.sortindex, 1);
    }

    #[test]
    fn test_delete_bso() {
        let mut db = store();
        put(&mut db, 1, "b0", "x", 0);
        let ts = db.delete_bso(1, "b0").unwrap();
        assert!(matches!(db.get_bso(1, "b0"), Err(Error::NotFound)));
        assert_eq!(db.collection_modified(1).unwrap(), ts);
        assert!(matches!(db.delete_bso(1, "b0"), Err(Error::NotFound)));
    }

    #[test]
    fn test_delete_bsos() {
        let mut db = store();
        for id in ["a", "b", "c"] {
            put(&mut db, 1, id, "x", 0);
        }
        db.delete_bsos(1, &["a".to_string(), "c".to_string()])
            .unwrap();
        assert!(db.get_bso(1, "b").is_ok());
        assert!(matches!(db.get_bso(1, "a"), Err(Error::NotFound)));
        assert!(matches!(
            db.delete_bsos(1, &["nope".to_string()]),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_delete_collection() {
        let mut db = store();
        let cid = db.create_collection("stuff").unwrap();
        put(&mut db, cid, "b0", "x", 0);
        db.delete_collection(cid).unwrap();
        assert!(matches!(db.get_collection_id("stuff"), Err(Error::NotFound)));
        assert!(matches!(db.get_bso(cid, "b0"), Err(Error::NotFound)));
        assert!(matches!(db.delete_collection(cid), Err(Error::NotFound)));

        // Static collections lose their BSOs but keep their row (and id).
        let before = put(&mut db, 7, "bm", "x", 0);
        let deleted_at = db.delete_collection(7).unwrap();
        assert_eq!(db.get_collection_id("bookmarks").unwrap(), 7);
        assert!(matches!(db.get_bso(7, "bm"), Err(Error::NotFound)));
        assert!(db.info_collections().unwrap().get("bookmarks").is_none());

        // The delete reads back as the collection's modified time; it never
        // winds backwards past what a client already observed.
        assert!(deleted_at > before);
        assert_eq!(db.collection_modified(7).unwrap(), deleted_at);

        // Writing again relists the collection with a fresh timestamp.
        let revived = put(&mut db, 7, "bm2", "y", 0);
        assert!(revived > deleted_at);
        assert_eq!(db.info_collections().unwrap()["bookmarks"], revived);
    }

    #[test]
    fn test_delete_everything() {
        let mut db = store();
        let cid = db.create_collection("mine").unwrap();
        put(&mut db, cid, "b0", "x", 0);
        put(&mut db, 1, "b1", "x", 0);
        let ts = db.delete_everything().unwrap();
        assert!(matches!(db.get_collection_id("mine"), Err(Error::NotFound)));
        assert!(matches!(db.get_bso(1, "b1"), Err(Error::NotFound)));
        assert!(db.info_collections().unwrap().is_empty());
        assert_eq!(db.last_modified().unwrap(), ts);
        // Static rows carry the wipe's timestamp rather than regressing.
        assert_eq!(db.collection_modified(1).unwrap(), ts);
    }

    #[test]
    fn test_touch_collection() {
        let mut db = store();
        let future = Timestamp::now().add_seconds(60);
        db.touch_collection(7, future).unwrap();
        assert_eq!(db.collection_modified(7).unwrap(), future);
        // Touching backwards is a no-op.
        db.touch_collection(7, Timestamp(1)).unwrap();
        assert_eq!(db.collection_modified(7).unwrap(), future);
        assert!(matches!(
            db.touch_collection(4242, Timestamp(1)),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_info_collections() {
        let mut db = store();
        // Untouched static collections don't show up.
        assert!(db.info_collections().unwrap().is_empty());
        let ts = put(&mut db, 7, "b0", "x", 0);
        let info = db.info_collections().unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info["bookmarks"], ts);
    }

    #[test]
    fn test_info_usage_and_counts() {
        let mut db = store();
        let sizes = [463usize, 467, 479];
        for (i, size) in sizes.iter().enumerate() {
            put(&mut db, 4, &format!("h{}", i), &"x".repeat(*size), 0);
            put(&mut db, 7, &format!("b{}", i), &"y".repeat(*size), 0);
        }
        let total: u64 = sizes.iter().map(|s| *s as u64).sum();
        let usage = db.info_collection_usage().unwrap();
        assert_eq!(usage["history"], total);
        assert_eq!(usage["bookmarks"], total);
        let counts = db.info_collection_counts().unwrap();
        assert_eq!(counts["history"], sizes.len() as u64);
        assert_eq!(db.storage_used_bytes().unwrap(), total * 2);
    }

    #[test]
    fn test_last_modified_strictly_increases() {
        let mut db = store();
        let mut prev = db.last_modified().unwrap();
        for i in 0..20 {
            put(&mut db, 1, &format!("b{}", i), "x", 0);
            let now = db.last_modified().unwrap();
            assert!(now > prev, "timestamps must strictly increase");
            prev = now;
        }
    }

    #[test]
    fn test_last_modified_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.db");
        let ts = {
            let mut db = UserStore::open(&path).unwrap();
            put(&mut db, 1, "b0", "x", 0)
        };
        let db = UserStore::open(&path).unwrap();
        assert_eq!(db.last_modified().unwrap(), ts);
        assert_eq!(db.last_ts, ts);
    }

    #[test]
    fn test_purge_expired() {
        let mut db = store();
        db.put_bso(1, "dead", Some("x"), None, Some(0)).unwrap();
        db.put_bso(1, "alive", Some("x"), None, None).unwrap();
        let purged = db.purge_expired().unwrap();
        assert_eq!(purged, 1);
        assert!(db.get_bso(1, "alive").is_ok());
    }

    #[test]
    fn test_usage_and_optimize() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = UserStore::open(dir.path().join("u.db")).unwrap();
        for i in 0..50 {
            put(&mut db, 1, &format!("b{}", i), &"x".repeat(4096), 0);
        }
        let usage = db.usage().unwrap();
        assert!(usage.total_bytes > 0);
        db.delete_collection(1).unwrap();
        // With everything deleted the free ratio is high enough to vacuum.
        assert!(db.optimize(0.05).unwrap());
        let after = db.usage().unwrap();
        assert!(after.total_bytes <= usage.total_bytes);
    }

    #[test]
    fn test_batch_lifecycle() {
        let mut db = store();
        let first = vec![PostedBso {
            id: Some("b0".into()),
            payload: Some("a".into()),
            sortindex: Some(1),
            ttl: None,
        }];
        let second = vec![PostedBso {
            id: Some("b1".into()),
            payload: Some("b".into()),
            ..Default::default()
        }];

        let batch = db.create_batch(7, 7200, &first).unwrap();
        assert!(db.batch_exists(batch, 7).unwrap());
        assert!(!db.batch_exists(batch, 4).unwrap());
        assert_eq!(db.batch_stats(batch, 7).unwrap(), (1, 1));
        db.append_to_batch(batch, 7, &second).unwrap();
        assert_eq!(db.batch_stats(batch, 7).unwrap(), (2, 2));

        // Nothing applied until commit.
        assert!(matches!(db.get_bso(7, "b0"), Err(Error::NotFound)));

        let results = db.commit_batch(batch, 7).unwrap();
        assert_eq!(results.success, vec!["b0", "b1"]);
        assert!(results.failed.is_empty());
        assert_eq!(db.get_bso(7, "b0").unwrap().payload, "a");
        assert_eq!(db.get_bso(7, "b1").unwrap().payload, "b");

        // The batch is gone once committed.
        assert!(!db.batch_exists(batch, 7).unwrap());
        assert!(matches!(db.commit_batch(batch, 7), Err(Error::NotFound)));
    }

    #[test]
    fn test_batch_expiry() {
        let mut db = store();
        let batch = db.create_batch(7, 0, &[]).unwrap();
        assert!(!db.batch_exists(batch, 7).unwrap());
        assert!(matches!(
            db.append_to_batch(batch, 7, &[]),
            Err(Error::NotFound)
        ));
    }
}
