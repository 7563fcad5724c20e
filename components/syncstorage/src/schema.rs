/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{Connection, Transaction};
use sql_support::open_database::{ConnectionInitializer, Error, Result};

pub const VERSION: u32 = 1;

/// Well-known collections with fixed ids. These are baked into the code so
/// lookups for common names never hit SQL, and their rows are pre-seeded so
/// joins against `Collections` always resolve a name.
pub const STATIC_COLLECTIONS: &[(i64, &str)] = &[
    (1, "clients"),
    (2, "crypto"),
    (3, "forms"),
    (4, "history"),
    (5, "keys"),
    (6, "meta"),
    (7, "bookmarks"),
    (8, "prefs"),
    (9, "tabs"),
    (10, "passwords"),
    (11, "addons"),
];

/// Ids handed to user-defined collections start here and only grow.
pub const FIRST_CUSTOM_COLLECTION_ID: i64 = 100;

/// `Meta` key holding the store-wide last modified timestamp.
pub const META_LAST_MODIFIED: &str = "last_modified";

/// `Meta` key holding the last allocated custom collection id.
pub const META_COLLECTION_SEQ: &str = "collection_seq";

pub const SQL: &str = "
    CREATE TABLE Meta(
        Key TEXT PRIMARY KEY,
        Value NOT NULL
    ) WITHOUT ROWID;

    -- Modified only ever advances; Visible tracks whether the collection
    -- currently appears in info listings, so deletes can clear it without
    -- winding the timestamp back.
    CREATE TABLE Collections(
        Id INTEGER PRIMARY KEY,
        Name TEXT UNIQUE NOT NULL,
        Modified INTEGER NOT NULL DEFAULT 0,
        Visible INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE Bsos(
        CollectionId INTEGER NOT NULL,
        Id TEXT NOT NULL,
        SortIndex INTEGER NOT NULL DEFAULT 0,
        Modified INTEGER NOT NULL,
        Payload TEXT NOT NULL DEFAULT '',
        PayloadSize INTEGER NOT NULL DEFAULT 0,
        Ttl INTEGER NOT NULL,

        PRIMARY KEY (CollectionId, Id)
    ) WITHOUT ROWID;

    CREATE INDEX bsos_modified ON Bsos(CollectionId, Modified);
    CREATE INDEX bsos_ttl ON Bsos(Ttl);

    CREATE TABLE Batches(
        Id INTEGER PRIMARY KEY AUTOINCREMENT,
        CollectionId INTEGER NOT NULL,
        Created INTEGER NOT NULL,
        Expiry INTEGER NOT NULL,
        ItemCount INTEGER NOT NULL DEFAULT 0,
        ByteCount INTEGER NOT NULL DEFAULT 0,
        Items TEXT NOT NULL DEFAULT ''
    );
";

pub struct StorageConnectionInitializer;

impl ConnectionInitializer for StorageConnectionInitializer {
    const NAME: &'static str = "syncstorage db";
    const END_VERSION: u32 = VERSION;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> Result<()> {
        let initial_pragmas = "
            -- Use in-memory storage for TEMP tables.
            PRAGMA temp_store = 2;

            -- We unconditionally want write-ahead-logging mode.
            PRAGMA journal_mode = WAL;

            PRAGMA foreign_keys = ON;

            -- How long to wait for a lock before returning SQLITE_BUSY (ms).
            PRAGMA busy_timeout = 5000;
        ";
        conn.execute_batch(initial_pragmas)?;
        conn.set_prepared_statement_cache_capacity(128);
        Ok(())
    }

    fn init(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(SQL)?;
        let mut stmt = tx.prepare("INSERT INTO Collections(Id, Name) VALUES (?1, ?2)")?;
        for (id, name) in STATIC_COLLECTIONS {
            stmt.execute((id, name))?;
        }
        tx.execute(
            "INSERT INTO Meta(Key, Value) VALUES (?1, 0), (?2, ?3)",
            (
                META_LAST_MODIFIED,
                META_COLLECTION_SEQ,
                FIRST_CUSTOM_COLLECTION_ID - 1,
            ),
        )?;
        Ok(())
    }

    fn upgrade_from(&self, _tx: &Transaction<'_>, version: u32) -> Result<()> {
        Err(Error::IncompatibleVersion(version))
    }
}

/// Resolve a static collection name to its fixed id without touching SQL.
pub fn static_collection_id(name: &str) -> Option<i64> {
    STATIC_COLLECTIONS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

pub fn is_static_collection(id: i64) -> bool {
    (1..=STATIC_COLLECTIONS.len() as i64).contains(&id)
}
