mod config;
mod domain;
mod engine;
mod infra;
mod jobs;
mod judger;
mod languages;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{config_path, Config};
use crate::engine::sandbox::{IsolateDriver, Sandbox};
use crate::infra::{HttpQueueClient, QueueApi};
use crate::judger::Judger;
use crate::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_client=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let path = config_path(std::env::args().skip(1));
    let config = Config::load(&path)?;
    info!("Loaded configuration from {}", path.display());

    info!("Starting judge client...");

    let api: Arc<dyn QueueApi> = Arc::new(
        HttpQueueClient::new(
            &config.server_root,
            config.identity.clone(),
            config.request_timeout(),
        )
        .context("Failed to build HTTP client")?,
    );
    info!("Queue API at {}", config.server_root);

    let sandbox = Sandbox::new(
        Arc::new(IsolateDriver::new(config.isolate_path.clone())),
        config.box_id,
        &config.state_dir,
    );
    info!(
        "Sandbox: isolate={}, box_id={}, state_dir={}",
        config.isolate_path,
        config.box_id,
        config.state_dir.display()
    );

    let judger = Judger::new(api.clone(), sandbox.clone(), config.judge_settings());
    let worker = Worker::new(api, judger, config.poll_interval());

    tokio::select! {
        _ = worker.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
    }

    // a job interrupted mid-run leaves its files behind
    if let Err(e) = sandbox.reset().await {
        warn!("Failed to reset sandbox {} on shutdown: {}", sandbox.box_id(), e);
    }
    Ok(())
}
