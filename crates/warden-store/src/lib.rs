pub mod error;
pub mod memory;
pub mod prefix;
pub mod redb_store;
pub mod store;
pub mod typed;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use prefix::PrefixedStore;
pub use redb_store::RedbStore;
pub use store::{content_etag, BatchOp, BatchResult, Filter, ListQuery, Row, Sort, Store};
pub use typed::{create, delete_op, fetch, put_op, query, update, update_op, Stored};
