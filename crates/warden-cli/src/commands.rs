use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;
use warden_agent::{HttpAgent, LocalAgent, NodeAgent};
use warden_config::WardenConfig;
use warden_store::{InMemoryStore, PrefixedStore, RedbStore, Store};
use warden_transitioner::Transitioner;

use crate::output;

// ── Serve ─────────────────────────────────────────────────────────────────────

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => warden_config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => WardenConfig::default(),
    };
    crate::init_tracing(&config.log_level);

    let store: Arc<dyn Store> = match &config.store_path {
        Some(path) => {
            info!(path = %path.display(), "using persistent store");
            let store = RedbStore::open(path)
                .with_context(|| format!("failed to open store at {}", path.display()))?;
            match &config.test_bucket_prefix {
                Some(prefix) => Arc::new(PrefixedStore::new(store, prefix.clone())),
                None => Arc::new(store),
            }
        }
        None => {
            info!("using in-memory store; state is lost on exit");
            Arc::new(InMemoryStore::new())
        }
    };

    let agent: Arc<dyn NodeAgent> = match &config.node_agent_url {
        Some(url) => {
            info!(url = %url, "using http node-agent executor");
            Arc::new(HttpAgent::new(url.clone()))
        }
        None => {
            info!("using local stub node-agent executor");
            Arc::new(LocalAgent::new())
        }
    };

    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The orchestrator runs alongside the server and shares its store.
    let worker = Transitioner::new(
        store.clone(),
        agent,
        config.instance_uuid,
        config.poll_interval,
        config.history_duration_secs,
    );
    let worker_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(rx).await })
    };

    let app = warden_api::build_app(store, config.clone());
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind))?;
    info!(addr = %config.bind, instance = %config.instance_uuid, "warden listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for orchestrator to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), worker_handle).await;
    info!("warden stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

// ── Client commands ───────────────────────────────────────────────────────────

async fn get_json(remote: &str, path: &str) -> Result<Value> {
    let url = format!("{}{}", remote.trim_end_matches('/'), path);
    let resp = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("request to {} failed", url))?;
    let status = resp.status();
    let body: Value = resp.json().await.context("response was not JSON")?;
    if !status.is_success() {
        anyhow::bail!("{}: {}", status, body["message"].as_str().unwrap_or("error"));
    }
    Ok(body)
}

pub async fn ping(remote: String) -> Result<()> {
    let body = get_json(&remote, "/ping").await?;
    println!(
        "{} {} at {}",
        body["name"].as_str().unwrap_or("warden"),
        body["version"].as_str().unwrap_or("?"),
        remote
    );
    Ok(())
}

pub async fn configs_list(remote: String) -> Result<()> {
    let body = get_json(&remote, "/recovery-configurations").await?;
    print!("{}", output::render_configs(body.as_array().cloned().unwrap_or_default()));
    Ok(())
}

pub async fn configs_show(remote: String, uuid: String) -> Result<()> {
    let body = get_json(&remote, &format!("/recovery-configurations/{}", uuid)).await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

pub async fn tokens(remote: String) -> Result<()> {
    let body = get_json(&remote, "/pivtokens").await?;
    print!("{}", output::render_pivtokens(body.as_array().cloned().unwrap_or_default()));
    Ok(())
}
