use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub applied: IntCounter,
    pub skipped: IntCounter,
    pub failed: IntCounter,
    pub halted_partitions: IntGauge,
}

impl ConsumerMetrics {
    pub fn new(service: &str) -> Self {
        let applied = IntCounter::with_opts(
            Opts::new(
                "ingest_messages_applied_total",
                "Messages whose business write committed",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_messages_applied_total");

        let skipped = IntCounter::with_opts(
            Opts::new(
                "ingest_messages_skipped_total",
                "Redelivered messages at or below the applied offset",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_messages_skipped_total");

        let failed = IntCounter::with_opts(
            Opts::new(
                "ingest_messages_failed_total",
                "Messages that failed permanently and were left unacknowledged",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_messages_failed_total");

        let halted_partitions = IntGauge::with_opts(
            Opts::new(
                "ingest_halted_partitions",
                "Partitions stopped by a permanent failure in this session",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_halted_partitions");

        register(
            "consumer",
            [
                Box::new(applied.clone()) as Box<dyn prometheus::core::Collector>,
                Box::new(skipped.clone()),
                Box::new(failed.clone()),
                Box::new(halted_partitions.clone()),
            ],
        );

        Self {
            applied,
            skipped,
            failed,
            halted_partitions,
        }
    }
}

#[derive(Clone)]
pub struct ProducerMetrics {
    pub published: IntCounter,
    pub publish_retries: IntCounter,
    pub resume_position: IntGauge,
}

impl ProducerMetrics {
    pub fn new(service: &str) -> Self {
        let published = IntCounter::with_opts(
            Opts::new(
                "ingest_chunks_published_total",
                "Chunks accepted by the log",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_chunks_published_total");

        let publish_retries = IntCounter::with_opts(
            Opts::new(
                "ingest_publish_retries_total",
                "Publish attempts retried after a transient log failure",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_publish_retries_total");

        let resume_position = IntGauge::with_opts(
            Opts::new(
                "ingest_producer_resume_position",
                "Last source position recorded as durably published",
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts for ingest_producer_resume_position");

        register(
            "producer",
            [
                Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
                Box::new(publish_retries.clone()),
                Box::new(resume_position.clone()),
            ],
        );

        Self {
            published,
            publish_retries,
            resume_position,
        }
    }
}

fn register<const N: usize>(kind: &str, metrics: [Box<dyn prometheus::core::Collector>; N]) {
    let registry = prometheus::default_registry();
    for metric in metrics {
        if let Err(e) = registry.register(metric) {
            warn!("Failed to register {} metric: {}", kind, e);
        }
    }
}
