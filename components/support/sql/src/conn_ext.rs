/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    types::FromSql, Connection, Params, Result as SqlResult, Row, Savepoint, Transaction,
};

/// This trait exists so that we can use these helpers on
/// `rusqlite::{Transaction, Connection}`. Note that you must import ConnExt
/// in order to call these methods on anything.
pub trait ConnExt {
    /// The method you need to implement to opt in to all of this.
    fn conn(&self) -> &Connection;

    /// Execute all the provided statements.
    fn execute_all(&self, stmts: &[&str]) -> SqlResult<()> {
        let conn = self.conn();
        for sql in stmts {
            conn.execute(sql, [])?;
        }
        Ok(())
    }

    /// Equivalent to `Connection::execute` but caches the statement so that
    /// subsequent calls will have improved performance.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute a query that returns a single result column, and return that
    /// result.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row(sql, [], |row| row.get(0))
    }

    /// Like `Connection::query_row`, but returns None instead of erroring
    /// when no such row exists, and caches the statement.
    fn try_query_row<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Option<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnOnce(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params)?;
        Ok(match rows.next()? {
            None => None,
            Some(row) => Some(mapper(row)?),
        })
    }

    /// As `try_query_row`, but for a single scalar column.
    fn try_query_one<T: FromSql, P: Params>(&self, sql: &str, params: P) -> SqlResult<Option<T>> {
        self.try_query_row(sql, params, |row| row.get(0))
    }

    /// Run a query, mapping every returned row through `mapper` into a `Vec`.
    /// The statement is cached.
    fn query_rows_and_then_cached<T, E, P, F>(
        &self,
        sql: &str,
        params: P,
        mapper: F,
    ) -> Result<Vec<T>, E>
    where
        P: Params,
        E: From<rusqlite::Error>,
        F: FnMut(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let iter = stmt.query_and_then(params, mapper)?;
        iter.collect()
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl<'conn> ConnExt for Transaction<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl<'conn> ConnExt for Savepoint<'conn> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
            .unwrap();
        conn
    }

    #[test]
    fn test_query_one() {
        let conn = conn();
        conn.execute_cached("INSERT INTO t(v) VALUES (?1)", ["hello"])
            .unwrap();
        let count: i64 = conn.query_one("SELECT COUNT(*) FROM t").unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_try_query_row_missing() {
        let conn = conn();
        let got: Option<String> = conn
            .try_query_one("SELECT v FROM t WHERE id = ?1", [42])
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_query_rows() {
        let conn = conn();
        for v in ["a", "b", "c"] {
            conn.execute_cached("INSERT INTO t(v) VALUES (?1)", [v])
                .unwrap();
        }
        let rows: Vec<String> = conn
            .query_rows_and_then_cached::<_, rusqlite::Error, _, _>(
                "SELECT v FROM t ORDER BY id",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, vec!["a", "b", "c"]);
    }
}
