use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{BatchOp, BatchResult, Filter, ListQuery, Row, Store};

/// Decorator that namespaces every bucket with a fixed prefix.
///
/// Used operationally to point a scratch instance at the same database file
/// without touching production rows.
pub struct PrefixedStore<S> {
    inner: S,
    prefix: String,
}

impl<S: Store> PrefixedStore<S> {
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self { inner, prefix: prefix.into() }
    }

    fn bucket(&self, bucket: &str) -> String {
        format!("{}{}", self.prefix, bucket)
    }

    fn map_op(&self, op: BatchOp) -> BatchOp {
        match op {
            BatchOp::Put { bucket, key, value, etag } => {
                BatchOp::Put { bucket: self.bucket(&bucket), key, value, etag }
            }
            BatchOp::Delete { bucket, key, etag } => {
                BatchOp::Delete { bucket: self.bucket(&bucket), key, etag }
            }
            BatchOp::Update { bucket, filter, set } => {
                BatchOp::Update { bucket: self.bucket(&bucket), filter, set }
            }
            BatchOp::DeleteMany { bucket, filter } => {
                BatchOp::DeleteMany { bucket: self.bucket(&bucket), filter }
            }
        }
    }
}

#[async_trait]
impl<S: Store> Store for PrefixedStore<S> {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Row>, StoreError> {
        self.inner.get(&self.bucket(bucket), key).await
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> Result<String, StoreError> {
        self.inner.put(&self.bucket(bucket), key, value, etag).await
    }

    async fn delete(&self, bucket: &str, key: &str, etag: Option<&str>) -> Result<(), StoreError> {
        self.inner.delete(&self.bucket(bucket), key, etag).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, StoreError> {
        let ops = ops.into_iter().map(|op| self.map_op(op)).collect();
        self.inner.batch(ops).await
    }

    async fn list(&self, bucket: &str, query: ListQuery) -> Result<Vec<Row>, StoreError> {
        self.inner.list(&self.bucket(bucket), query).await
    }

    async fn count(&self, bucket: &str, filter: Filter) -> Result<u64, StoreError> {
        self.inner.count(&self.bucket(bucket), filter).await
    }
}
