use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{
    content_etag, order_and_page, BatchOp, BatchResult, Filter, ListQuery, Row, Store,
};

const BUCKETS: &[&str] = &[
    "pivtokens",
    "pivtoken_history",
    "recovery_configurations",
    "recovery_tokens",
    "recovery_configuration_transitions",
];

fn table_def(bucket: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(bucket)
}

fn internal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// Persistent [`Store`] backed by a redb database file.
///
/// One table per bucket, documents as JSON bytes. A `batch` call runs inside
/// a single write transaction, which is what makes the multi-row invariants
/// above the store atomic.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically and all known bucket
    /// tables are ensured to exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;
        {
            let wtxn = db.begin_write().map_err(internal)?;
            for bucket in BUCKETS {
                wtxn.open_table(table_def(bucket)).map_err(internal)?;
            }
            wtxn.commit().map_err(internal)?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    fn scan(&self, bucket: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = match rtxn.open_table(table_def(bucket)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(internal(e)),
        };
        let mut rows = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (k, v) = entry.map_err(internal)?;
            let value: Value = serde_json::from_slice(v.value())?;
            if filter.matches(&value) {
                let etag = content_etag(&value);
                rows.push(Row { key: k.value().to_string(), value, etag });
            }
        }
        Ok(rows)
    }
}

// ── Write-transaction helpers ────────────────────────────────────────────────

fn current_value(
    table: &redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<Value>, StoreError> {
    match table.get(key).map_err(internal)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn exec_put(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    bucket: &str,
    key: &str,
    value: &Value,
    etag: Option<&str>,
) -> Result<String, StoreError> {
    match (etag, current_value(table, key)?) {
        (None, Some(_)) => return Err(StoreError::unique_violation(bucket, key)),
        (Some(_), None) => return Err(StoreError::not_found(bucket, key)),
        (Some(tag), Some(current)) if content_etag(&current) != tag => {
            return Err(StoreError::etag_mismatch(bucket, key));
        }
        _ => {}
    }
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice()).map_err(internal)?;
    Ok(content_etag(value))
}

fn exec_delete(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    bucket: &str,
    key: &str,
    etag: Option<&str>,
) -> Result<(), StoreError> {
    let current =
        current_value(table, key)?.ok_or_else(|| StoreError::not_found(bucket, key))?;
    if let Some(tag) = etag {
        if content_etag(&current) != tag {
            return Err(StoreError::etag_mismatch(bucket, key));
        }
    }
    table.remove(key).map_err(internal)?;
    Ok(())
}

fn matching_keys(
    table: &redb::Table<'_, &'static str, &'static [u8]>,
    filter: &Filter,
) -> Result<Vec<(String, Value)>, StoreError> {
    let mut hits = Vec::new();
    for entry in table.iter().map_err(internal)? {
        let (k, v) = entry.map_err(internal)?;
        let value: Value = serde_json::from_slice(v.value())?;
        if filter.matches(&value) {
            hits.push((k.value().to_string(), value));
        }
    }
    Ok(hits)
}

fn exec_update(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    filter: &Filter,
    set: &BTreeMap<String, Option<Value>>,
) -> Result<u64, StoreError> {
    let hits = matching_keys(table, filter)?;
    let mut count = 0;
    for (key, mut value) in hits {
        if let Value::Object(obj) = &mut value {
            for (field, v) in set {
                match v {
                    Some(v) => {
                        obj.insert(field.clone(), v.clone());
                    }
                    None => {
                        obj.remove(field);
                    }
                }
            }
            let bytes = serde_json::to_vec(&value)?;
            table.insert(key.as_str(), bytes.as_slice()).map_err(internal)?;
            count += 1;
        }
    }
    Ok(count)
}

fn exec_delete_many(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    filter: &Filter,
) -> Result<u64, StoreError> {
    let hits = matching_keys(table, filter)?;
    let count = hits.len() as u64;
    for (key, _) in hits {
        table.remove(key.as_str()).map_err(internal)?;
    }
    Ok(count)
}

#[async_trait]
impl Store for RedbStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Row>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = match rtxn.open_table(table_def(bucket)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(internal(e)),
        };
        match table.get(key).map_err(internal)? {
            Some(guard) => {
                let value: Value = serde_json::from_slice(guard.value())?;
                let etag = content_etag(&value);
                Ok(Some(Row { key: key.to_string(), value, etag }))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> Result<String, StoreError> {
        let results = self
            .batch(vec![BatchOp::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                value,
                etag: etag.map(String::from),
            }])
            .await?;
        match results.into_iter().next() {
            Some(BatchResult::Put { etag }) => Ok(etag),
            _ => Err(StoreError::Internal("put produced no result".into())),
        }
    }

    async fn delete(&self, bucket: &str, key: &str, etag: Option<&str>) -> Result<(), StoreError> {
        self.batch(vec![BatchOp::Delete {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: etag.map(String::from),
        }])
        .await?;
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let mut results = Vec::with_capacity(ops.len());
        // Any error here drops the transaction without committing, so the
        // whole batch unwinds.
        for op in &ops {
            let result = match op {
                BatchOp::Put { bucket, key, value, etag } => {
                    let mut table = wtxn.open_table(table_def(bucket)).map_err(internal)?;
                    BatchResult::Put {
                        etag: exec_put(&mut table, bucket, key, value, etag.as_deref())?,
                    }
                }
                BatchOp::Delete { bucket, key, etag } => {
                    let mut table = wtxn.open_table(table_def(bucket)).map_err(internal)?;
                    exec_delete(&mut table, bucket, key, etag.as_deref())?;
                    BatchResult::Deleted
                }
                BatchOp::Update { bucket, filter, set } => {
                    let mut table = wtxn.open_table(table_def(bucket)).map_err(internal)?;
                    BatchResult::Updated { count: exec_update(&mut table, filter, set)? }
                }
                BatchOp::DeleteMany { bucket, filter } => {
                    let mut table = wtxn.open_table(table_def(bucket)).map_err(internal)?;
                    BatchResult::DeletedMany { count: exec_delete_many(&mut table, filter)? }
                }
            };
            results.push(result);
        }
        wtxn.commit().map_err(internal)?;
        Ok(results)
    }

    async fn list(&self, bucket: &str, query: ListQuery) -> Result<Vec<Row>, StoreError> {
        let rows = self.scan(bucket, &query.filter)?;
        Ok(order_and_page(rows, &query))
    }

    async fn count(&self, bucket: &str, filter: Filter) -> Result<u64, StoreError> {
        Ok(self.scan(bucket, &filter)?.len() as u64)
    }
}
