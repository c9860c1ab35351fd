//! hoopsync: one sync pass per invocation.
//!
//! Loads configuration, initialises structured logging, opens and migrates
//! the store, then runs the fetch → normalize → upsert pass. Ctrl+C stops
//! the pass after the in-flight batch.
//!
//! Exit codes: 0 when every entity type finished, 1 when any failed,
//! 2 when startup failed.

use anyhow::Result;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use hoopsync::api::client::ApiClient;
use hoopsync::config::AppConfig;
use hoopsync::engine::{Coordinator, SyncSettings};
use hoopsync::stop::stop_channel;
use hoopsync::storage::{run_log, Store};
use hoopsync::types::RunResult;

const DEFAULT_CONFIG_PATH: &str = "hoopsync.toml";

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    match run().await {
        Ok(result) if result.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<RunResult> {
    let config_path =
        std::env::var("HOOPSYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::from_env(&config_path)?;

    info!(
        config = %config_path,
        api = %cfg.api.base_url,
        db = %cfg.store.db_url,
        entities = ?cfg.sync.entities,
        season = ?cfg.sync.season,
        "hoopsync starting up"
    );

    // -- Store -----------------------------------------------------------

    let store = Store::connect(&cfg.store).await?;
    store.migrate().await?;

    // -- API client ------------------------------------------------------

    let api_key = cfg.api_key();
    if api_key.is_none() {
        warn!(
            env = %cfg.api.api_key_env,
            "No API key configured, sending unauthenticated requests"
        );
    }
    let client = ApiClient::new(&cfg.api, api_key)?;

    if let Some(path) = &cfg.sync.report_path {
        match run_log::load_report(path) {
            Ok(Some(previous)) if !previous.is_success() => {
                warn!(
                    run_id = %previous.run_id,
                    failed = previous.errors().len(),
                    "Previous pass did not finish cleanly"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable previous run report"),
        }
    }

    // -- Pass --------------------------------------------------------------

    let (stop_handle, stop) = stop_channel();
    let settings = SyncSettings::from_config(&cfg);
    let coordinator =
        Coordinator::new(Arc::new(client), store.clone(), settings).with_stop(stop);

    let pass = coordinator.run();
    tokio::pin!(pass);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut stopping = false;

    let result = loop {
        tokio::select! {
            result = &mut pass => break result,
            _ = &mut shutdown, if !stopping => {
                warn!("Shutdown signal received, stopping after the current batch");
                stop_handle.stop();
                stopping = true;
            }
        }
    };

    if let Some(path) = &cfg.sync.report_path {
        if let Err(e) = run_log::save_report(&result, path) {
            error!(error = %e, "Failed to save run report");
        }
    }

    store.pool().close().await;
    Ok(result)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hoopsync=info"));

    let json_logging = std::env::var("HOOPSYNC_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
