use anyhow::{bail, Context};
use exactly_once::{
    ConsumerMetrics, LogReader, LogWriter, MemoryLog, ProducerMetrics, RetryingExecutor,
};
use file_ingest_service::config::{IngestConfig, LogBackend};
use file_ingest_service::{connect_store, pipeline, report, SERVICE_NAME};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Produce,
    Consume,
    Run,
    Report,
}

impl Mode {
    fn parse(arg: Option<&str>) -> anyhow::Result<Self> {
        match arg {
            None | Some("run") => Ok(Mode::Run),
            Some("produce") => Ok(Mode::Produce),
            Some("consume") => Ok(Mode::Consume),
            Some("report") => Ok(Mode::Report),
            Some(other) => bail!("unknown mode {other:?}; expected produce, consume, run or report"),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "file_ingest_service=info,exactly_once=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Shutdown flag flipped by Ctrl-C or SIGTERM.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {},
                        _ = terminate.recv() => {},
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Shutdown signal received");
        let _ = tx.send(true);
        // Keep the sender alive so receivers never see a closed channel first
        tx.closed().await;
    });

    rx
}

fn log_writer(config: &IngestConfig, memory: &Arc<MemoryLog>) -> anyhow::Result<Arc<dyn LogWriter>> {
    match config.log_backend {
        LogBackend::Memory => {
            let writer: Arc<dyn LogWriter> = memory.clone();
            Ok(writer)
        }
        LogBackend::Kafka => kafka_writer(config),
    }
}

fn log_reader(config: &IngestConfig, memory: &Arc<MemoryLog>) -> anyhow::Result<Arc<dyn LogReader>> {
    match config.log_backend {
        LogBackend::Memory => {
            let reader: Arc<dyn LogReader> = memory.clone();
            Ok(reader)
        }
        LogBackend::Kafka => kafka_reader(config),
    }
}

#[cfg(feature = "kafka")]
fn kafka_writer(config: &IngestConfig) -> anyhow::Result<Arc<dyn LogWriter>> {
    let writer = exactly_once::KafkaLogWriter::connect(
        &config.kafka_brokers,
        &config.topic,
        &config.producer_id,
    )
    .context("failed to create Kafka producer")?;
    Ok(Arc::new(writer))
}

#[cfg(feature = "kafka")]
fn kafka_reader(config: &IngestConfig) -> anyhow::Result<Arc<dyn LogReader>> {
    let reader = exactly_once::KafkaLogReader::connect(
        &config.kafka_brokers,
        &config.consumer_group,
        &config.topic,
    )
    .context("failed to create Kafka consumer")?;
    Ok(Arc::new(reader))
}

#[cfg(not(feature = "kafka"))]
fn kafka_writer(_config: &IngestConfig) -> anyhow::Result<Arc<dyn LogWriter>> {
    bail!("built without the `kafka` feature; set INGEST_LOG_BACKEND=memory")
}

#[cfg(not(feature = "kafka"))]
fn kafka_reader(_config: &IngestConfig) -> anyhow::Result<Arc<dyn LogReader>> {
    bail!("built without the `kafka` feature; set INGEST_LOG_BACKEND=memory")
}

async fn produce(
    config: &IngestConfig,
    memory: &Arc<MemoryLog>,
    executor: RetryingExecutor,
) -> anyhow::Result<()> {
    let path = config.source_path()?;
    let report = pipeline::produce(
        path,
        config.chunk_size,
        log_writer(config, memory)?,
        executor,
        config.producer_options()?,
        Some(ProducerMetrics::new(SERVICE_NAME)),
    )
    .await
    .context("produce failed")?;

    info!(
        published = report.published,
        resumed_from = ?report.resumed_from,
        last_position = ?report.last_position,
        "Produce finished"
    );
    Ok(())
}

async fn consume(
    config: &IngestConfig,
    memory: &Arc<MemoryLog>,
    executor: RetryingExecutor,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let report = pipeline::consume(
        log_reader(config, memory)?,
        executor,
        config.consumer_options(),
        Some(ConsumerMetrics::new(SERVICE_NAME)),
        shutdown,
    )
    .await
    .context("consume failed")?;

    for halted in &report.halted {
        error!(
            partition = halted.partition,
            offset = halted.offset,
            error = %halted.error,
            "Partition halted; fix the cause and restart to redeliver"
        );
    }
    info!(
        received = report.received,
        applied = report.applied,
        skipped = report.skipped,
        "Consume finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mode = Mode::parse(std::env::args().nth(1).as_deref())?;
    let config = IngestConfig::from_env().context("configuration loading failed")?;
    info!(?mode, backend = ?config.log_backend, "Starting {}", SERVICE_NAME);

    if config.log_backend == LogBackend::Memory && matches!(mode, Mode::Produce | Mode::Consume) {
        warn!("In-process log does not outlive this run; use `run` or the Kafka backend");
    }

    let store = connect_store().await?;
    let executor = RetryingExecutor::new(store, config.retry_config());
    let memory = Arc::new(MemoryLog::new(config.partitions));
    let shutdown = shutdown_signal();

    match mode {
        Mode::Produce => produce(&config, &memory, executor).await?,
        Mode::Consume => consume(&config, &memory, executor, shutdown).await?,
        Mode::Run => {
            produce(&config, &memory, executor.clone()).await?;
            consume(&config, &memory, executor.clone(), shutdown).await?;
            report::log_snapshot(&report::read_snapshot(&executor).await?);
        }
        Mode::Report => report::log_snapshot(&report::read_snapshot(&executor).await?),
    }

    Ok(())
}
