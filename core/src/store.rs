//! Generic indexed record store on top of the SQLite pool.
//!
//! Every entity lives as a JSON document in the `records` table, keyed by
//! `(collection, key)`. Secondary indexes are SQLite expression indexes over
//! `json_extract(body, ...)` (see `migrations/`), so lookups through an
//! [`Index`] hit a real b-tree and the composite page index enforces
//! uniqueness inside the database itself.
//!
//! All work happens through a [`Tx`] handed to a closure by [`Store::read`] or
//! [`Store::write`]. A write closure runs inside `BEGIN IMMEDIATE`, which takes
//! the database write lock before the first read, so two read-modify-write
//! sequences can never interleave. Returning `Err` from the closure rolls the
//! whole unit back.

use r2d2_sqlite::rusqlite::types::Value;
use r2d2_sqlite::rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, TransactionBehavior,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::db::DbPool;
use crate::errors::{IntakeError, Result};

/// An entity stored in a named collection.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    const COLLECTION: &'static str;

    fn key(&self) -> &str;
}

/// Secondary indexes declared by the migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    InboundStatus,
    InboundDate,
    InboundNormalizedNumber,
    InboundSupplier,
    ImageInbound,
    ImageInboundPage,
    ImageContentHash,
    ImageSynced,
    ItemZone,
    LogInbound,
}

impl Index {
    pub fn collection(self) -> &'static str {
        match self {
            Self::InboundStatus
            | Self::InboundDate
            | Self::InboundNormalizedNumber
            | Self::InboundSupplier => "inbound",
            Self::ImageInbound
            | Self::ImageInboundPage
            | Self::ImageContentHash
            | Self::ImageSynced => "images",
            Self::ItemZone => "items",
            Self::LogInbound => "log",
        }
    }

    fn fields(self) -> &'static [&'static str] {
        match self {
            Self::InboundStatus => &["status"],
            Self::InboundDate => &["date_doc"],
            Self::InboundNormalizedNumber => &["ls_nr_normalized"],
            Self::InboundSupplier => &["supplier"],
            Self::ImageInbound => &["inbound_id"],
            Self::ImageInboundPage => &["inbound_id", "page_no"],
            Self::ImageContentHash => &["content_hash"],
            Self::ImageSynced => &["synced"],
            Self::ItemZone => &["zone"],
            Self::LogInbound => &["inbound_id"],
        }
    }
}

/// One component of an index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for IndexKey {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for IndexKey {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

// json_extract yields 0/1 for JSON booleans.
impl From<IndexKey> for Value {
    fn from(key: IndexKey) -> Self {
        match key {
            IndexKey::Text(s) => Value::Text(s),
            IndexKey::Int(i) => Value::Integer(i),
            IndexKey::Bool(b) => Value::Integer(i64::from(b)),
        }
    }
}

/// Which index entries a query selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Equality on every field of the index, in declaration order.
    Only(Vec<IndexKey>),
    /// Inclusive range over a single-field index; `None` is unbounded.
    Bound {
        lower: Option<IndexKey>,
        upper: Option<IndexKey>,
    },
}

impl KeyRange {
    pub fn only(key: impl Into<IndexKey>) -> Self {
        Self::Only(vec![key.into()])
    }

    pub fn between(lower: impl Into<IndexKey>, upper: impl Into<IndexKey>) -> Self {
        Self::Bound {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
        }
    }
}

/// Handle for the reads and writes of one logical operation.
pub struct Tx<'c> {
    conn: &'c Connection,
}

impl<'c> Tx<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert a new record; fails with `Conflict` when the key is taken.
    pub fn add<R: Record>(&self, record: &R) -> Result<()> {
        if self.exists::<R>(record.key())? {
            return Err(IntakeError::Conflict {
                collection: R::COLLECTION,
                key: record.key().to_string(),
            });
        }
        let body = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO records (collection, key, body) VALUES (?1, ?2, ?3)",
            params![R::COLLECTION, record.key(), body],
        )?;
        Ok(())
    }

    /// Insert or replace. A replaced record keeps its insertion position.
    pub fn put<R: Record>(&self, record: &R) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT INTO records (collection, key, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, key) DO UPDATE SET body = excluded.body",
            params![R::COLLECTION, record.key(), body],
        )?;
        Ok(())
    }

    pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND key = ?2",
                params![R::COLLECTION, key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|raw| serde_json::from_str(&raw).map_err(IntakeError::from))
            .transpose()
    }

    /// Like [`Tx::get`] but a missing record is an error.
    pub fn require<R: Record>(&self, key: &str) -> Result<R> {
        self.get(key)?
            .ok_or_else(|| IntakeError::not_found(R::COLLECTION, key))
    }

    pub fn exists<R: Record>(&self, key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM records WHERE collection = ?1 AND key = ?2",
                params![R::COLLECTION, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Remove a record; returns whether anything was deleted.
    pub fn delete<R: Record>(&self, key: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![R::COLLECTION, key],
        )?;
        Ok(changed > 0)
    }

    /// Every record of the collection in insertion order.
    pub fn all<R: Record>(&self) -> Result<Vec<R>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM records WHERE collection = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map([R::COLLECTION], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    /// Records selected through a secondary index, in insertion order.
    pub fn query<R: Record>(&self, index: Index, range: &KeyRange) -> Result<Vec<R>> {
        let (filter, values) = index_filter::<R>(index, range)?;
        let sql = format!("SELECT body FROM records WHERE {filter} ORDER BY rowid");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn count<R: Record>(&self, index: Index, range: &KeyRange) -> Result<usize> {
        let (filter, values) = index_filter::<R>(index, range)?;
        let sql = format!("SELECT COUNT(*) FROM records WHERE {filter}");
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn put_blob(&self, uri: &str, data: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO blobs (uri, data) VALUES (?1, ?2)
             ON CONFLICT(uri) DO UPDATE SET data = excluded.data",
            params![uri, data],
        )?;
        Ok(())
    }

    pub fn get_blob(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row("SELECT data FROM blobs WHERE uri = ?1", [uri], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn delete_blob(&self, uri: &str) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM blobs WHERE uri = ?1", [uri])?;
        Ok(changed > 0)
    }
}

fn index_filter<R: Record>(index: Index, range: &KeyRange) -> Result<(String, Vec<Value>)> {
    if index.collection() != R::COLLECTION {
        return Err(IntakeError::InvalidInput(format!(
            "index {index:?} does not belong to collection {}",
            R::COLLECTION
        )));
    }
    let fields = index.fields();
    // Literal collection so the planner can match the partial indexes.
    let mut clauses = vec![format!("collection = '{}'", R::COLLECTION)];
    let mut values: Vec<Value> = Vec::new();
    match range {
        KeyRange::Only(keys) => {
            if keys.len() != fields.len() {
                return Err(IntakeError::InvalidInput(format!(
                    "index {index:?} expects {} key parts, got {}",
                    fields.len(),
                    keys.len()
                )));
            }
            for (field, key) in fields.iter().zip(keys) {
                values.push(key.clone().into());
                clauses.push(format!(
                    "json_extract(body, '$.{field}') = ?{}",
                    values.len()
                ));
            }
        }
        KeyRange::Bound { lower, upper } => {
            let [field] = fields else {
                return Err(IntakeError::InvalidInput(format!(
                    "range queries need a single-field index, {index:?} is composite"
                )));
            };
            if let Some(lower) = lower {
                values.push(lower.clone().into());
                clauses.push(format!(
                    "json_extract(body, '$.{field}') >= ?{}",
                    values.len()
                ));
            }
            if let Some(upper) = upper {
                values.push(upper.clone().into());
                clauses.push(format!(
                    "json_extract(body, '$.{field}') <= ?{}",
                    values.len()
                ));
            }
        }
    }
    Ok((clauses.join(" AND "), values))
}

/// Shared handle to the record store.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Run `f` against a consistent snapshot.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TransactionBehavior::Deferred, f).await
    }

    /// Run `f` as one all-or-nothing unit holding the write lock.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TransactionBehavior::Immediate, f).await
    }

    async fn run<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let mut conn = pool.get()?;
            let tx = conn.transaction_with_behavior(behavior)?;
            let outcome = f(&Tx::new(&tx));
            match outcome {
                Ok(out) => {
                    tx.commit()?;
                    Ok(out)
                }
                Err(err) => {
                    if matches!(err, IntakeError::ConstraintViolation(_)) {
                        log::error!("store transaction rolled back: {err}");
                    }
                    // Dropping `tx` rolls back.
                    Err(err)
                }
            }
        })
        .await?
    }

    pub async fn add<R: Record>(&self, record: R) -> Result<()> {
        self.write(move |tx| tx.add(&record)).await
    }

    pub async fn put<R: Record>(&self, record: R) -> Result<()> {
        self.write(move |tx| tx.put(&record)).await
    }

    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
        let key = key.to_string();
        self.read(move |tx| tx.get(&key)).await
    }

    pub async fn delete<R: Record>(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.write(move |tx| tx.delete::<R>(&key)).await
    }

    pub async fn query<R: Record>(&self, index: Index, range: KeyRange) -> Result<Vec<R>> {
        self.read(move |tx| tx.query(index, &range)).await
    }

    pub async fn all<R: Record>(&self) -> Result<Vec<R>> {
        self.read(|tx| tx.all()).await
    }
}
