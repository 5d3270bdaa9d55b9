use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::Error;

const PARTITION_LABEL: &str = "partition";
const WRITER_LABEL: &str = "writer";
const LANE_LABEL: &str = "lane";

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "epochflow";
// Prefixes for the sub-registries
const SHUFFLE_REGISTRY_PREFIX: &str = "shuffle";
const COMMIT_REGISTRY_PREFIX: &str = "commit";
const GENERATOR_REGISTRY_PREFIX: &str = "generator";

/// The global register of all metrics.
struct GlobalRegistry {
    // It is okay to use a blocking mutex because each metric is registered only once.
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Each metric is a family differentiated by its label values, provided as `Vec<(String, String)>`.
pub(crate) struct EpochflowMetrics {
    pub(crate) shuffle: ShuffleMetrics,
    pub(crate) commit: CommitMetrics,
    pub(crate) generator: GeneratorMetrics,
}

pub(crate) struct ShuffleMetrics {
    pub(crate) rows_sent_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) markers_sent_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) send_retries_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) rows_received_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) epochs_closed_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) pending_rows: Family<Vec<(String, String)>, Gauge>,
}

pub(crate) struct CommitMetrics {
    pub(crate) commits_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) trimmed_batches_total: Family<Vec<(String, String)>, Counter>,
    pub(crate) retained_batches: Family<Vec<(String, String)>, Gauge>,
}

pub(crate) struct GeneratorMetrics {
    pub(crate) rows_total: Family<Vec<(String, String)>, Counter>,
}

impl EpochflowMetrics {
    fn new() -> Self {
        let metrics = Self {
            shuffle: ShuffleMetrics {
                rows_sent_total: Family::default(),
                markers_sent_total: Family::default(),
                send_retries_total: Family::default(),
                rows_received_total: Family::default(),
                epochs_closed_total: Family::default(),
                pending_rows: Family::default(),
            },
            commit: CommitMetrics {
                commits_total: Family::default(),
                trimmed_batches_total: Family::default(),
                retained_batches: Family::default(),
            },
            generator: GeneratorMetrics {
                rows_total: Family::default(),
            },
        };

        let mut registry = global_registry().registry.lock();

        let shuffle_registry = registry.sub_registry_with_prefix(SHUFFLE_REGISTRY_PREFIX);
        shuffle_registry.register(
            "rows_sent",
            "Total number of rows acknowledged by a receiver endpoint",
            metrics.shuffle.rows_sent_total.clone(),
        );
        shuffle_registry.register(
            "markers_sent",
            "Total number of epoch markers acknowledged by a receiver endpoint",
            metrics.shuffle.markers_sent_total.clone(),
        );
        shuffle_registry.register(
            "send_retries",
            "Total number of retried sends after a delivery failure",
            metrics.shuffle.send_retries_total.clone(),
        );
        shuffle_registry.register(
            "rows_received",
            "Total number of rows accepted by a receiver endpoint",
            metrics.shuffle.rows_received_total.clone(),
        );
        shuffle_registry.register(
            "epochs_closed",
            "Total number of epochs a receiver endpoint reported as ended",
            metrics.shuffle.epochs_closed_total.clone(),
        );
        shuffle_registry.register(
            "pending_rows",
            "Rows queued at a receiver endpoint, across all epochs",
            metrics.shuffle.pending_rows.clone(),
        );

        let commit_registry = registry.sub_registry_with_prefix(COMMIT_REGISTRY_PREFIX);
        commit_registry.register(
            "commits",
            "Total number of commits that advanced the committed offset",
            metrics.commit.commits_total.clone(),
        );
        commit_registry.register(
            "trimmed_batches",
            "Total number of buffered batches discarded by commits",
            metrics.commit.trimmed_batches_total.clone(),
        );
        commit_registry.register(
            "retained_batches",
            "Batches still retained for replay",
            metrics.commit.retained_batches.clone(),
        );

        let generator_registry = registry.sub_registry_with_prefix(GENERATOR_REGISTRY_PREFIX);
        generator_registry.register(
            "rows",
            "Total number of rows emitted by a generator lane",
            metrics.generator.rows_total.clone(),
        );

        metrics
    }
}

static METRICS: OnceLock<EpochflowMetrics> = OnceLock::new();

pub(crate) fn metrics() -> &'static EpochflowMetrics {
    METRICS.get_or_init(EpochflowMetrics::new)
}

pub(crate) fn partition_labels(partition_idx: u16) -> Vec<(String, String)> {
    vec![(PARTITION_LABEL.to_string(), partition_idx.to_string())]
}

pub(crate) fn writer_partition_labels(writer: u16, partition_idx: u16) -> Vec<(String, String)> {
    vec![
        (WRITER_LABEL.to_string(), writer.to_string()),
        (PARTITION_LABEL.to_string(), partition_idx.to_string()),
    ]
}

pub(crate) fn writer_labels(writer: u16) -> Vec<(String, String)> {
    vec![(WRITER_LABEL.to_string(), writer.to_string())]
}

pub(crate) fn lane_labels(lane: u16) -> Vec<(String, String)> {
    vec![(LANE_LABEL.to_string(), lane.to_string())]
}

/// Snapshot of the global registry in the OpenMetrics text format.
pub fn encode_metrics() -> crate::Result<String> {
    // make sure the families are registered even if nothing was recorded yet
    let _ = metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry)
        .map_err(|e| Error::Metrics(format!("Encoding metrics registry: {e}")))?;
    Ok(buffer)
}
