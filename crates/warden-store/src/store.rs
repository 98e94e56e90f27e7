use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreError;

// ── Rows and etags ───────────────────────────────────────────────────────────

/// One stored document with its server-issued etag.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    pub value: Value,
    pub etag: String,
}

/// Etag of a document: SHA-256 over its canonical JSON. `serde_json` keeps
/// object keys in a sorted map, so serializing a `Value` is already
/// canonical.
pub fn content_etag(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

// ── Filters ──────────────────────────────────────────────────────────────────

/// Predicate over top-level document fields. This is the only query language
/// the store speaks; every field named here must be an indexed field of the
/// bucket's entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    True,
    Eq(String, Value),
    In(String, Vec<Value>),
    Present(String),
    Absent(String),
    Lt(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn is_in(field: &str, values: Vec<Value>) -> Self {
        Filter::In(field.to_string(), values)
    }

    pub fn present(field: &str) -> Self {
        Filter::Present(field.to_string())
    }

    pub fn absent(field: &str) -> Self {
        Filter::Absent(field.to_string())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::True => true,
            Filter::Eq(field, expected) => doc.get(field) == Some(expected),
            Filter::In(field, values) => {
                doc.get(field).map_or(false, |v| values.contains(v))
            }
            Filter::Present(field) => doc.get(field).map_or(false, |v| !v.is_null()),
            Filter::Absent(field) => doc.get(field).map_or(true, |v| v.is_null()),
            Filter::Lt(field, bound) => doc
                .get(field)
                .map_or(false, |v| cmp_values(v, bound) == std::cmp::Ordering::Less),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

/// Ordering over JSON scalars. Strings that both parse as RFC 3339
/// timestamps compare chronologically, so mixed-precision timestamps order
/// correctly; everything else falls back to type-wise comparison.
pub(crate) fn cmp_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            match (
                chrono::DateTime::parse_from_rfc3339(x),
                chrono::DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(tx), Ok(ty)) => tx.cmp(&ty),
                _ => x.cmp(y),
            }
        }
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

// ── List queries ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Sort { field: field.to_string(), ascending: true }
    }

    pub fn desc(field: &str) -> Self {
        Sort { field: field.to_string(), ascending: false }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filter: Filter,
    pub sort: Option<Sort>,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl ListQuery {
    pub fn filtered(filter: Filter) -> Self {
        ListQuery { filter, ..Default::default() }
    }

    pub fn sorted(filter: Filter, sort: Sort) -> Self {
        ListQuery { filter, sort: Some(sort), ..Default::default() }
    }
}

// ── Batch operations ─────────────────────────────────────────────────────────

/// One element of an all-or-nothing batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Create (`etag: None`) or conditionally replace (`etag: Some`).
    Put {
        bucket: String,
        key: String,
        value: Value,
        etag: Option<String>,
    },
    Delete {
        bucket: String,
        key: String,
        etag: Option<String>,
    },
    /// Set (`Some`) or remove (`None`) top-level fields on every document
    /// matching the filter.
    Update {
        bucket: String,
        filter: Filter,
        set: BTreeMap<String, Option<Value>>,
    },
    DeleteMany {
        bucket: String,
        filter: Filter,
    },
}

/// Per-op result, in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Put { etag: String },
    Deleted,
    Updated { count: u64 },
    DeletedMany { count: u64 },
}

// ── The store trait ──────────────────────────────────────────────────────────

/// Typed wrapper over an indexed document store. The store is the only
/// component that touches the backing database; all multi-row invariants
/// above it are expressed as single `batch` calls.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch one document. `Ok(None)` when absent.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Row>, StoreError>;

    /// Create when `etag` is `None` (unique-violation if the key exists);
    /// conditional replace when `Some` (etag-mismatch on a stale tag).
    /// Returns the new etag.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Delete, optionally conditional on the current etag.
    async fn delete(&self, bucket: &str, key: &str, etag: Option<&str>) -> Result<(), StoreError>;

    /// Execute every op or none of them.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, StoreError>;

    /// Filtered, sorted, paginated scan over one bucket.
    async fn list(&self, bucket: &str, query: ListQuery) -> Result<Vec<Row>, StoreError>;

    /// Cardinality of a filter without materializing rows.
    async fn count(&self, bucket: &str, filter: Filter) -> Result<u64, StoreError>;
}

/// Apply sort / offset / limit to an already-filtered row set. Shared by
/// both backends so pagination semantics cannot drift.
pub(crate) fn order_and_page(mut rows: Vec<Row>, query: &ListQuery) -> Vec<Row> {
    if let Some(sort) = &query.sort {
        rows.sort_by(|a, b| {
            let av = a.value.get(&sort.field).unwrap_or(&Value::Null);
            let bv = b.value.get(&sort.field).unwrap_or(&Value::Null);
            let ord = cmp_values(av, bv);
            if sort.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }
    let start = (query.offset as usize).min(rows.len());
    let end = match query.limit {
        Some(limit) => (start + limit as usize).min(rows.len()),
        None => rows.len(),
    };
    rows[start..end].to_vec()
}
