//! fleetlink-edge — on-vehicle collection & inspection agent
//!
//! Startup consumes a single JSON configuration (see `config::AgentConfig`)
//! and wires the component tasks together. Shutdown is cooperative: SIGINT
//! cancels every task and waits for each to stop.
//!
//! # Exit codes
//!
//! - `0` clean shutdown
//! - `1` configuration error
//! - `2` unrecoverable subsystem failure at startup

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use fleetlink_edge::campaign::CampaignManager;
use fleetlink_edge::checkin::run_checkin_reporter;
use fleetlink_edge::clock::SystemClock;
use fleetlink_edge::config::AgentConfig;
use fleetlink_edge::decoder::DictionaryPublisher;
use fleetlink_edge::dtc::SharedDtcState;
use fleetlink_edge::functions::FunctionRegistry;
use fleetlink_edge::inspection::InspectionEngine;
use fleetlink_edge::pipeline::{SignalDistributor, SignalPipeline};
use fleetlink_edge::rawdata::RawDataBufferManager;
use fleetlink_edge::sources::run_stdin_source;
use fleetlink_edge::storage::PersistenceAdapter;
use fleetlink_edge::transport::{run_document_poller, HttpTransport, Transport};
use fleetlink_edge::uploader::Uploader;

#[derive(Parser, Debug)]
#[command(name = "fleetlink-edge")]
#[command(about = "FleetLink on-vehicle collection & inspection agent")]
#[command(version)]
struct CliArgs {
    /// Path to the JSON configuration file.
    /// Falls back to $FLEETLINK_CONFIG, then ./fleetlink-config.json.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read custom-source signal readings from stdin (JSON lines).
    #[arg(long)]
    stdin: bool,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = CliArgs::parse();

    let config_path = AgentConfig::resolve_path(args.config);
    let config = match AgentConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Configuration error");
            return ExitCode::from(1);
        }
    };

    match run_agent(config, args.stdin).await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Unrecoverable subsystem failure");
            ExitCode::from(2)
        }
    }
}

/// Wire every component and run until SIGINT.
async fn run_agent(config: AgentConfig, use_stdin: bool) -> anyhow::Result<()> {
    info!("Starting FleetLink edge agent");

    // Shared infrastructure.
    let clock = Arc::new(SystemClock::new());
    let persistence = Arc::new(
        PersistenceAdapter::open(&config.persistency.path, config.persistency.max_bytes)
            .context("opening persistence store")?,
    );
    let rawdata = Arc::new(RawDataBufferManager::new(&config.raw_data_buffer));
    let dictionary = Arc::new(DictionaryPublisher::new());
    let dtc = Arc::new(SharedDtcState::new());
    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(&config.transport).context("building transport client")?,
    );

    // Signal path: producers → pipeline → distributor → engine.
    let (pipeline, pipeline_rx) = SignalPipeline::new(config.signal_pipeline_size);
    let distributor = SignalDistributor::new(pipeline_rx);
    let distributor_handle = distributor.handle();
    let (_consumer_id, engine_rx) = distributor_handle.attach(config.signal_pipeline_size);

    // Control path: poller → manager → {engine, dictionary, checkin}.
    let (manager, handles) = CampaignManager::new(
        clock.clone(),
        persistence.clone(),
        dictionary.clone(),
        config.collection_scheme_manager_idle_time_ms,
    );

    // Upload path: engine → uploader → transport.
    let (triggered_tx, triggered_rx) = tokio::sync::mpsc::channel(config.upload_queue_size);

    let mut functions = FunctionRegistry::new();
    // The multi-rising-edge trigger emits its label payload on the first
    // signal that carries a raw-data quota, when one is configured.
    if let Some(entry) = config.raw_data_buffer.signals.first() {
        functions.register(
            "multi_rising_edge",
            Box::new(fleetlink_edge::functions::MultiRisingEdgeTrigger::new(
                entry.signal_id,
                rawdata.clone(),
            )),
        );
    }

    let engine = InspectionEngine::new(
        clock.clone(),
        rawdata.clone(),
        dtc.clone(),
        functions,
        engine_rx,
        handles.matrix_rx.clone(),
        triggered_tx,
        config.inspection_idle_time_ms,
    );

    let uploader = Uploader::new(
        transport.clone(),
        rawdata.clone(),
        persistence.clone(),
        triggered_rx,
        config.uploader_interval_ms,
    );

    // Spawn the component tasks under one cancellation token.
    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<()> = JoinSet::new();

    tasks.spawn(distributor.run(cancel.clone()));
    tasks.spawn(engine.run(cancel.clone()));
    tasks.spawn(uploader.run(cancel.clone()));
    tasks.spawn(run_checkin_reporter(
        transport.clone(),
        handles.checkin_rx.clone(),
        config.checkin_interval_ms,
        cancel.clone(),
    ));
    tasks.spawn(run_document_poller(
        transport.clone(),
        handles.events_tx.clone(),
        config.document_poll_interval_ms,
        cancel.clone(),
    ));
    tasks.spawn(manager.run(cancel.clone()));

    if use_stdin {
        let producer = pipeline.producer("stdin");
        tasks.spawn(run_stdin_source(
            producer,
            dictionary.clone(),
            rawdata.clone(),
            cancel.clone(),
        ));
    }

    info!(tasks = tasks.len(), "All subsystems running");

    // Level-triggered stop: every task checks the token at its suspension
    // points and returns.
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Shutdown signal received");
    cancel.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Component task ended abnormally");
        }
    }

    let stats = pipeline.stats();
    info!(
        samples_pushed = stats.pushed,
        samples_dropped = stats.dropped,
        "Signal pipeline final counters"
    );
    Ok(())
}
