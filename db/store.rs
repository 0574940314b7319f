// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The embedded ordered key-value store.
//!
//! One SQLite table per namespace, `TEXT PRIMARY KEY` keys, JSON values.
//! SQLite's default `BINARY` collation compares keys by memcmp, so iteration
//! order is lexicographic, which for the zero-padded decimal movement keys
//! is also chronological order.
//!
//! Scans materialize their rows before returning, so callers never hold a
//! SQLite cursor across an `await` point and see a consistent snapshot even
//! with concurrent writers.

use base::{Error, ErrorKind, ResultExt as _};
use parking_lot::Mutex;
use rusqlite::OptionalExtension as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// The fixed set of sub-namespaces. Strictly typed so a key can't stray into
/// the wrong table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    Cameras,
    Movements,
    Settings,
    DiskStatus,
}

impl Namespace {
    fn table(self) -> &'static str {
        match self {
            Namespace::Cameras => "cameras",
            Namespace::Movements => "movements",
            Namespace::Settings => "settings",
            Namespace::DiskStatus => "diskstatus",
        }
    }
}

const ALL_NAMESPACES: [Namespace; 4] = [
    Namespace::Cameras,
    Namespace::Movements,
    Namespace::Settings,
    Namespace::DiskStatus,
];

/// Bounds and direction for a range scan. All bounds are inclusive or
/// exclusive per their name; `limit` caps the row count after ordering.
#[derive(Clone, Debug, Default)]
pub struct ScanOpts {
    pub reverse: bool,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub limit: Option<usize>,
}

impl ScanOpts {
    pub fn forward() -> Self {
        ScanOpts::default()
    }

    pub fn reverse() -> Self {
        ScanOpts {
            reverse: true,
            ..ScanOpts::default()
        }
    }

    pub fn lt(mut self, key: impl Into<String>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<String>) -> Self {
        self.lte = Some(key.into());
        self
    }

    pub fn gt(mut self, key: impl Into<String>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<String>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(Debug)]
pub struct Store {
    conn: Mutex<rusqlite::Connection>,
}

impl Store {
    /// Opens (creating if necessary) the store at the given file path.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path)
            .err_kind(ErrorKind::Unavailable)
            .map_err(|e| e.context(format!("unable to open store at {}", path.display())))?;
        Self::with_conn(conn)
    }

    /// Opens a fresh in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = rusqlite::Connection::open_in_memory().err_kind(ErrorKind::Unavailable)?;
        Self::with_conn(conn)
    }

    fn with_conn(conn: rusqlite::Connection) -> Result<Self, Error> {
        // The journal_mode pragma returns a row, so it can't go through
        // `execute`.
        conn.query_row("pragma journal_mode = wal", [], |row| {
            row.get::<_, String>(0)
        })
        .err_kind(ErrorKind::Unavailable)?;
        for ns in ALL_NAMESPACES {
            conn.execute_batch(&format!(
                "create table if not exists {} (k text primary key, v text not null)",
                ns.table()
            ))
            .err_kind(ErrorKind::Unavailable)?;
        }
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, ns: Namespace, key: &str) -> Result<Option<T>, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!("select v from {} where k = ?", ns.table()))
            .err_kind(ErrorKind::Internal)?;
        let row: Option<String> = stmt
            .query_row([key], |row| row.get(0))
            .optional()
            .err_kind(ErrorKind::Internal)?;
        match row {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_str(&v).err_kind(ErrorKind::DataLoss)?)),
        }
    }

    pub fn put<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> Result<(), Error> {
        let v = serde_json::to_string(value).err_kind(ErrorKind::Internal)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "insert or replace into {} (k, v) values (?, ?)",
                ns.table()
            ))
            .err_kind(ErrorKind::Internal)?;
        stmt.execute([key, v.as_str()])
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn del(&self, ns: Namespace, key: &str) -> Result<(), Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!("delete from {} where k = ?", ns.table()))
            .err_kind(ErrorKind::Internal)?;
        stmt.execute([key]).err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Deletes all the given keys in one transaction.
    pub fn batch_delete(&self, ns: Namespace, keys: &[String]) -> Result<(), Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        {
            let mut stmt = tx
                .prepare_cached(&format!("delete from {} where k = ?", ns.table()))
                .err_kind(ErrorKind::Internal)?;
            for k in keys {
                stmt.execute([k.as_str()]).err_kind(ErrorKind::Internal)?;
            }
        }
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn count(&self, ns: Namespace) -> Result<u64, Error> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(&format!("select count(*) from {}", ns.table()), [], |row| {
                row.get(0)
            })
            .err_kind(ErrorKind::Internal)?;
        Ok(n as u64)
    }

    /// Scans a key range in order, returning deserialized `(key, value)`
    /// pairs.
    pub fn scan<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        opts: &ScanOpts,
    ) -> Result<Vec<(String, T)>, Error> {
        let mut sql = format!("select k, v from {}", ns.table());
        let mut clauses: Vec<&'static str> = Vec::new();
        let mut params: Vec<&str> = Vec::new();
        if let Some(k) = &opts.lt {
            clauses.push("k < ?");
            params.push(k);
        }
        if let Some(k) = &opts.lte {
            clauses.push("k <= ?");
            params.push(k);
        }
        if let Some(k) = &opts.gt {
            clauses.push("k > ?");
            params.push(k);
        }
        if let Some(k) = &opts.gte {
            clauses.push("k >= ?");
            params.push(k);
        }
        if !clauses.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&clauses.join(" and "));
        }
        sql.push_str(if opts.reverse {
            " order by k desc"
        } else {
            " order by k"
        });
        if let Some(limit) = opts.limit {
            sql.push_str(&format!(" limit {limit}"));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params))
            .err_kind(ErrorKind::Internal)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
            let k: String = row.get(0).err_kind(ErrorKind::Internal)?;
            let v: String = row.get(1).err_kind(ErrorKind::Internal)?;
            let v = serde_json::from_str(&v)
                .err_kind(ErrorKind::DataLoss)
                .map_err(|e| e.context(format!("corrupt value at {:?}/{k}", ns)))?;
            out.push((k, v));
        }
        Ok(out)
    }

    /// Like `scan`, but returns only the keys.
    pub fn scan_keys(&self, ns: Namespace, opts: &ScanOpts) -> Result<Vec<String>, Error> {
        Ok(self
            .scan::<serde_json::Value>(ns, opts)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }
}
