use serde::Deserialize;

/// Raw YAML representation of the server config file. Every field is
/// optional; unknown fields are rejected so typos do not pass silently.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Listen address, `host:port`.
    pub bind: Option<String>,
    /// Path to the redb database file. Absent means in-memory (ephemeral).
    pub store_path: Option<String>,
    /// Stable orchestrator identity. Absent means a fresh uuid at startup.
    pub instance_uuid: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub recovery_token_duration_secs: Option<i64>,
    pub history_duration_secs: Option<i64>,
    /// Base URL of the node-agent executor. Absent means the local stub.
    pub node_agent_url: Option<String>,
    /// Operator admin public keys (SSH public-key lines) accepted as a
    /// signature fallback.
    #[serde(default)]
    pub admin_keys: Vec<String>,
    /// Bucket-name prefix for scratch instances sharing a database.
    pub test_bucket_prefix: Option<String>,
    pub log_level: Option<String>,
}
