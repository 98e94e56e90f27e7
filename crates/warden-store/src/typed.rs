use serde_json::Value;
use warden_domain::Document;

use crate::error::StoreError;
use crate::store::{BatchOp, Filter, ListQuery, Store};

/// A deserialized document together with the etag it was read at.
#[derive(Debug, Clone)]
pub struct Stored<T> {
    pub doc: T,
    pub etag: String,
}

fn decode<T: Document>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(StoreError::from)
}

fn encode<T: Document>(doc: &T) -> Result<Value, StoreError> {
    serde_json::to_value(doc).map_err(StoreError::from)
}

/// Fetch one document by key.
pub async fn fetch<T: Document>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<Stored<T>>, StoreError> {
    match store.get(T::BUCKET, key).await? {
        Some(row) => Ok(Some(Stored { doc: decode(row.value)?, etag: row.etag })),
        None => Ok(None),
    }
}

/// Create a new document; unique-violation when the key already exists.
pub async fn create<T: Document>(store: &dyn Store, doc: &T) -> Result<String, StoreError> {
    store.put(T::BUCKET, &doc.key(), encode(doc)?, None).await
}

/// Conditionally replace a document read at `etag`.
pub async fn update<T: Document>(
    store: &dyn Store,
    doc: &T,
    etag: &str,
) -> Result<String, StoreError> {
    store.put(T::BUCKET, &doc.key(), encode(doc)?, Some(etag)).await
}

/// Filtered list, decoded.
pub async fn query<T: Document>(
    store: &dyn Store,
    query: ListQuery,
) -> Result<Vec<Stored<T>>, StoreError> {
    let rows = store.list(T::BUCKET, query).await?;
    rows.into_iter()
        .map(|row| Ok(Stored { doc: decode(row.value)?, etag: row.etag }))
        .collect()
}

/// A `Put` batch op for this document (create when `etag` is `None`).
pub fn put_op<T: Document>(doc: &T, etag: Option<String>) -> Result<BatchOp, StoreError> {
    Ok(BatchOp::Put {
        bucket: T::BUCKET.to_string(),
        key: doc.key(),
        value: encode(doc)?,
        etag,
    })
}

/// A conditional `Delete` batch op for this document.
pub fn delete_op<T: Document>(doc: &T, etag: Option<String>) -> BatchOp {
    BatchOp::Delete { bucket: T::BUCKET.to_string(), key: doc.key(), etag }
}

/// An `Update` batch op over this document's bucket.
pub fn update_op<T: Document>(
    filter: Filter,
    set: std::collections::BTreeMap<String, Option<Value>>,
) -> BatchOp {
    BatchOp::Update { bucket: T::BUCKET.to_string(), filter, set }
}
