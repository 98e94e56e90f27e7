use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;
use warden_domain::{Document, PivTokenHistory, RecoveryToken};
use warden_store::{BatchOp, BatchResult, Filter, Store};

use crate::error::TransitionerError;

/// Drop rows older than the retention window: history entries whose active
/// range ended before the cutoff, and recovery tokens expired before it.
/// Returns (history rows, token rows) removed.
pub async fn prune(
    store: &dyn Store,
    history_duration_secs: i64,
    now: DateTime<Utc>,
) -> Result<(u64, u64), TransitionerError> {
    let cutoff = now - Duration::seconds(history_duration_secs);
    let results = store
        .batch(vec![
            BatchOp::DeleteMany {
                bucket: PivTokenHistory::BUCKET.to_string(),
                filter: Filter::lt("active_end", json!(cutoff)),
            },
            BatchOp::DeleteMany {
                bucket: RecoveryToken::BUCKET.to_string(),
                filter: Filter::lt("expired", json!(cutoff)),
            },
        ])
        .await?;

    let counts: Vec<u64> = results
        .into_iter()
        .map(|r| match r {
            BatchResult::DeletedMany { count } => count,
            _ => 0,
        })
        .collect();
    let (history, tokens) = (counts[0], counts[1]);
    if history + tokens > 0 {
        debug!(history, tokens, "pruned rows past retention window");
    }
    Ok((history, tokens))
}
