use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use meter_poller::cli::Args;
use meter_poller::client::{HttpMeterClient, MeterClient};
use meter_poller::config::Config;
use meter_poller::http;
use meter_poller::observations::{Observations, SensorDescriptor};
use meter_poller::scheduler::{PollScheduler, TimerToken, TokioTimers};
use meter_poller::services::accumulated::AccumulatedSensor;
use meter_poller::services::historical::HistoricalSensor;
use meter_poller::store::{
    load_or_absent, FileStateStore, HistoricalLog, JsonlHistoricalLog, StateStore,
};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,meter_poller=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing()?;

    let client: Arc<dyn MeterClient> = Arc::new(
        HttpMeterClient::new(
            config.api_url.clone(),
            config.api_token.clone(),
            config.request_timeout,
        )
        .context("build meter client")?,
    );
    let details = match client.fetch_contract_details().await {
        Ok(details) => {
            tracing::info!(serial = %details.serial, manufacturer = %details.manufacturer, "contract details loaded");
            Some(details)
        }
        Err(err) => {
            tracing::warn!(error = %err, "contract details unavailable; sensors start without device info");
            None
        }
    };

    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(&config.state_dir).context("open state store")?);
    let log: Arc<dyn HistoricalLog> = Arc::new(
        JsonlHistoricalLog::open(config.historical_log_path()).context("open historical log")?,
    );
    let observations = Observations::new();

    let historical = HistoricalSensor::new(
        SensorDescriptor::historical(&config.name, &config.entry_id, details.as_ref()),
        client.clone(),
        log.clone(),
        store.clone(),
        observations.clone(),
        config.historical_poll_interval,
        config.historical_max_age(),
    );

    if args.once {
        let outcome = historical.backfill(&Local::now()).await?;
        println!("{}", serde_json::to_string(&outcome)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let restored = load_or_absent(store.as_ref(), historical.unique_id());
    let startup = historical
        .reconcile_on_start(restored.as_ref(), &Local::now())
        .await;
    tasks.push(tokio::spawn(historical.run(startup.decision, cancel.clone())));

    if config.enable_direct_measure {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel::<TimerToken>();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let scheduler = PollScheduler::new(config.schedule_window()?, TokioTimers::new(fire_tx), rng);
        let mut accumulated = AccumulatedSensor::new(
            SensorDescriptor::accumulated(&config.name, &config.entry_id, details.as_ref()),
            client.clone(),
            store.clone(),
            observations.clone(),
            scheduler,
            config.measure_max_age(),
        );
        let restored = load_or_absent(store.as_ref(), accumulated.unique_id());
        accumulated
            .reconcile_on_start(restored.as_ref(), &Local::now())
            .await;
        tasks.push(tokio::spawn(accumulated.run(fire_rx, cancel.clone())));
    } else {
        tracing::info!("direct measure disabled; only the historical sensor runs");
    }

    let app = http::router(http::HttpState {
        observations: observations.clone(),
        log: log.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "meter-poller HTTP listening");
    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
            .ok();
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    cancel.cancel();

    for task in tasks {
        task.await.ok();
    }
    http_handle.await.ok();
    Ok(())
}
