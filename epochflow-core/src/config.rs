//! Process configuration. The pipeline is described by a base64 encoded JSON [PipelineSpec] in the
//! `EPOCHFLOW_PIPELINE_OBJECT` environment variable; every field is optional and falls back to a
//! default. Without the variable the defaults are used as is.

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Result;
use crate::error::Error;
use crate::generator::GeneratorConfig;
use crate::shuffle::writer::WriterConfig;

const ENV_PIPELINE_OBJ: &str = "EPOCHFLOW_PIPELINE_OBJECT";

const DEFAULT_LANES: u16 = 2;
const DEFAULT_ROWS_PER_SECOND: u64 = 100;
const DEFAULT_PARTITIONS: u16 = 2;
const DEFAULT_RECEIVER_CAPACITY: usize = 10_000;
const DEFAULT_EPOCH_INTERVAL_MILLIS: u64 = 1000;
const DEFAULT_METRICS_PORT: u16 = 2469;

/// Wire format of the pipeline object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSpec {
    pub generator: Option<GeneratorSpec>,
    pub partitions: Option<u16>,
    pub receiver_capacity: Option<usize>,
    pub epoch_interval_millis: Option<u64>,
    /// Stop after this long; run until a shutdown signal if unset.
    pub duration_secs: Option<u64>,
    pub writer: Option<WriterSpec>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratorSpec {
    pub lanes: Option<u16>,
    pub rows_per_second: Option<u64>,
    pub start_value: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriterSpec {
    pub send_timeout_millis: Option<u64>,
    pub retry_interval_millis: Option<u64>,
    pub max_send_attempts: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub generator: GeneratorConfig,
    /// Number of downstream partitions, one receiver and one consumer each.
    pub partitions: u16,
    pub receiver_capacity: usize,
    pub writer: WriterConfig,
    pub epoch_interval: Duration,
    pub run_duration: Option<Duration>,
    pub metrics_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig {
                num_lanes: DEFAULT_LANES,
                rows_per_second: DEFAULT_ROWS_PER_SECOND,
                start_value: 0,
            },
            partitions: DEFAULT_PARTITIONS,
            receiver_capacity: DEFAULT_RECEIVER_CAPACITY,
            writer: WriterConfig::default(),
            epoch_interval: Duration::from_millis(DEFAULT_EPOCH_INTERVAL_MILLIS),
            run_duration: None,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

/// Settings of this process, loaded on first use.
pub fn config() -> Result<&'static Settings> {
    static CONF: OnceLock<Settings> = OnceLock::new();
    if let Some(settings) = CONF.get() {
        return Ok(settings);
    }
    let settings = Settings::load()?;
    Ok(CONF.get_or_init(|| settings))
}

impl Settings {
    fn load() -> Result<Self> {
        match env::var(ENV_PIPELINE_OBJ) {
            Ok(obj) => Self::from_encoded(&obj),
            Err(_) => {
                let settings = Settings::default();
                settings.validate()?;
                Ok(settings)
            }
        }
    }

    /// Builds the settings from a base64 encoded [PipelineSpec].
    pub fn from_encoded(obj: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(obj.trim().as_bytes())
            .map_err(|e| Error::Config(format!("Failed to decode pipeline object: {e:?}")))?;
        let spec: PipelineSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse pipeline object: {e:?}")))?;
        Self::from_spec(spec)
    }

    pub fn from_spec(spec: PipelineSpec) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(generator) = spec.generator {
            if let Some(lanes) = generator.lanes {
                settings.generator.num_lanes = lanes;
            }
            if let Some(rps) = generator.rows_per_second {
                settings.generator.rows_per_second = rps;
            }
            if let Some(start) = generator.start_value {
                settings.generator.start_value = start;
            }
        }
        if let Some(writer) = spec.writer {
            if let Some(ms) = writer.send_timeout_millis {
                settings.writer.send_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = writer.retry_interval_millis {
                settings.writer.retry_interval = Duration::from_millis(ms);
            }
            if let Some(attempts) = writer.max_send_attempts {
                settings.writer.max_send_attempts = attempts;
            }
        }

        settings.partitions = spec.partitions.unwrap_or(settings.partitions);
        settings.receiver_capacity = spec.receiver_capacity.unwrap_or(settings.receiver_capacity);
        if let Some(ms) = spec.epoch_interval_millis {
            settings.epoch_interval = Duration::from_millis(ms);
        }
        settings.run_duration = spec.duration_secs.map(Duration::from_secs);
        settings.metrics_port = spec.metrics_port.unwrap_or(settings.metrics_port);

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.generator.validate()?;
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be at least 1".to_string()));
        }
        if self.receiver_capacity == 0 {
            return Err(Error::Config(
                "receiverCapacity must be greater than zero".to_string(),
            ));
        }
        if self.epoch_interval.is_zero() {
            return Err(Error::Config(
                "epochIntervalMillis must be greater than zero".to_string(),
            ));
        }
        if self.writer.max_send_attempts == 0 {
            return Err(Error::Config(
                "maxSendAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
