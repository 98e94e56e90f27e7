use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{
    content_etag, order_and_page, BatchOp, BatchResult, Filter, ListQuery, Row, Store,
};

type Bucket = BTreeMap<String, Value>;

#[derive(Debug, Default, Clone)]
struct Inner {
    buckets: HashMap<String, Bucket>,
}

impl Inner {
    fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    fn bucket_mut(&mut self, name: &str) -> &mut Bucket {
        self.buckets.entry(name.to_string()).or_default()
    }

    fn apply_put(
        &mut self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> Result<String, StoreError> {
        let existing = self.bucket(bucket).and_then(|b| b.get(key));
        match (etag, existing) {
            (None, Some(_)) => return Err(StoreError::unique_violation(bucket, key)),
            (Some(_), None) => return Err(StoreError::not_found(bucket, key)),
            (Some(tag), Some(current)) if content_etag(current) != tag => {
                return Err(StoreError::etag_mismatch(bucket, key));
            }
            _ => {}
        }
        let new_etag = content_etag(&value);
        self.bucket_mut(bucket).insert(key.to_string(), value);
        Ok(new_etag)
    }

    fn apply_delete(&mut self, bucket: &str, key: &str, etag: Option<&str>) -> Result<(), StoreError> {
        let existing = self
            .bucket(bucket)
            .and_then(|b| b.get(key))
            .ok_or_else(|| StoreError::not_found(bucket, key))?;
        if let Some(tag) = etag {
            if content_etag(existing) != tag {
                return Err(StoreError::etag_mismatch(bucket, key));
            }
        }
        self.bucket_mut(bucket).remove(key);
        Ok(())
    }

    fn apply_update(
        &mut self,
        bucket: &str,
        filter: &Filter,
        set: &BTreeMap<String, Option<Value>>,
    ) -> u64 {
        let mut count = 0;
        for value in self.bucket_mut(bucket).values_mut() {
            if !filter.matches(value) {
                continue;
            }
            if let Value::Object(obj) = value {
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
                count += 1;
            }
        }
        count
    }

    fn apply_delete_many(&mut self, bucket: &str, filter: &Filter) -> u64 {
        let b = self.bucket_mut(bucket);
        let before = b.len();
        b.retain(|_, v| !filter.matches(v));
        (before - b.len()) as u64
    }

    fn apply_batch(&mut self, ops: &[BatchOp]) -> Result<Vec<BatchResult>, StoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = match op {
                BatchOp::Put { bucket, key, value, etag } => BatchResult::Put {
                    etag: self.apply_put(bucket, key, value.clone(), etag.as_deref())?,
                },
                BatchOp::Delete { bucket, key, etag } => {
                    self.apply_delete(bucket, key, etag.as_deref())?;
                    BatchResult::Deleted
                }
                BatchOp::Update { bucket, filter, set } => BatchResult::Updated {
                    count: self.apply_update(bucket, filter, set),
                },
                BatchOp::DeleteMany { bucket, filter } => BatchResult::DeletedMany {
                    count: self.apply_delete_many(bucket, filter),
                },
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// In-memory implementation of [`Store`].
///
/// All data is lost on process exit. Suitable for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Row>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.bucket(bucket).and_then(|b| b.get(key)).map(|v| Row {
            key: key.to_string(),
            value: v.clone(),
            etag: content_etag(v),
        }))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut guard = self.inner.write().await;
        guard.apply_put(bucket, key, value, etag)
    }

    async fn delete(&self, bucket: &str, key: &str, etag: Option<&str>) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.apply_delete(bucket, key, etag)
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, StoreError> {
        // All-or-nothing: apply against a copy, swap in only on full success.
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        let results = staged.apply_batch(&ops)?;
        *guard = staged;
        Ok(results)
    }

    async fn list(&self, bucket: &str, query: ListQuery) -> Result<Vec<Row>, StoreError> {
        let guard = self.inner.read().await;
        let rows: Vec<Row> = guard
            .bucket(bucket)
            .map(|b| {
                b.iter()
                    .filter(|(_, v)| query.filter.matches(v))
                    .map(|(k, v)| Row {
                        key: k.clone(),
                        value: v.clone(),
                        etag: content_etag(v),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(order_and_page(rows, &query))
    }

    async fn count(&self, bucket: &str, filter: Filter) -> Result<u64, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .bucket(bucket)
            .map(|b| b.values().filter(|v| filter.matches(v)).count() as u64)
            .unwrap_or(0))
    }
}
