use crate::alerts::{AlertEngine, AlertSettings, AlertSink, ThresholdConfigInvalid, ThresholdRuleConfig, ThresholdTable};
use crate::collector::{Collector, CollectorSettings, HospitalEntry};
use crate::history::AggregateHistory;
use crate::pipeline::{CommandCentre, CycleSettings};
use crate::publisher::{Publisher, PublisherSettings};
use crate::sources::{HttpSource, PushInbox, PushSource, SharedSource};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Thresholds(#[from] ThresholdConfigInvalid),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CentreConfig {
    pub listen: String,
    pub cycle: CycleConf,
    pub collector: CollectorConf,
    pub alerts: AlertsConf,
    pub publisher: PublisherConf,
    pub history: HistoryConf,
    pub mqtt: Option<MqttConf>,
    pub hospitals: Vec<HospitalConf>,
    pub thresholds: Vec<ThresholdRuleConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CycleConf {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CollectorConf {
    pub fetch_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub offline_after: u32,
    pub max_concurrency: usize,
    pub deadline_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConf {
    pub lock_timeout_ms: u64,
    pub lock_retries: u32,
    pub archive_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PublisherConf {
    pub buffer_capacity: usize,
    pub replay_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConf {
    pub capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HospitalConf {
    pub id: String,
    pub name: String,
    pub source: SourceConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConf {
    Http {
        url: String,
    },
    Push {
        #[serde(default = "default_push_max_age")]
        max_age_secs: u64,
    },
}

fn default_client_id() -> String {
    "opscentre-kernel".into()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_push_max_age() -> u64 {
    120
}

impl Default for CentreConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            cycle: CycleConf::default(),
            collector: CollectorConf::default(),
            alerts: AlertsConf::default(),
            publisher: PublisherConf::default(),
            history: HistoryConf::default(),
            mqtt: None,
            hospitals: Vec::new(),
            thresholds: Vec::new(),
        }
    }
}

impl Default for CycleConf {
    fn default() -> Self {
        Self { interval_secs: 30, timeout_secs: 25 }
    }
}

impl Default for CollectorConf {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 2_000,
            offline_after: 3,
            max_concurrency: 8,
            deadline_secs: 20,
        }
    }
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self { lock_timeout_ms: 50, lock_retries: 3, archive_capacity: 500 }
    }
}

impl Default for PublisherConf {
    fn default() -> Self {
        Self { buffer_capacity: 16, replay_capacity: 64 }
    }
}

impl Default for HistoryConf {
    // a day of 30-second cycles
    fn default() -> Self {
        Self { capacity: 2_880 }
    }
}

/// Reads `$OPSCENTRE_CONFIG` (default `opscentre.yaml`).
///
/// A missing or empty file yields the defaults. Anything that cannot be read
/// or validated is an error; the service must not start on a bad file.
pub async fn load_config() -> Result<CentreConfig, ConfigError> {
    let path = std::env::var("OPSCENTRE_CONFIG").unwrap_or_else(|_| "opscentre.yaml".into());
    let mut cfg = load_config_from(Path::new(&path)).await?;
    if let Ok(listen) = std::env::var("OPSCENTRE_LISTEN") {
        cfg.listen = listen;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Reads and validates one configuration file, without environment overrides.
pub async fn load_config_from(path: &Path) -> Result<CentreConfig, ConfigError> {
    let display = path.display().to_string();
    if !path.exists() {
        info!("No {} found, using default configuration", path.display());
        return Ok(CentreConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read { path: display.clone(), source })?;
    let cfg = parse_config(&txt).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse { path: display.clone(), source },
        other => other,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn parse_config(txt: &str) -> Result<CentreConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(CentreConfig::default());
    }
    serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse { path: "<inline>".into(), source })
}

fn nonzero(value: u64, name: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
    }
    Ok(())
}

impl CentreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        nonzero(self.cycle.interval_secs, "cycle.interval_secs")?;
        nonzero(self.cycle.timeout_secs, "cycle.timeout_secs")?;
        nonzero(self.collector.fetch_timeout_ms, "collector.fetch_timeout_ms")?;
        nonzero(self.collector.max_attempts as u64, "collector.max_attempts")?;
        nonzero(self.collector.offline_after as u64, "collector.offline_after")?;
        nonzero(self.collector.max_concurrency as u64, "collector.max_concurrency")?;
        nonzero(self.collector.deadline_secs, "collector.deadline_secs")?;
        nonzero(self.alerts.lock_timeout_ms, "alerts.lock_timeout_ms")?;
        nonzero(self.publisher.buffer_capacity as u64, "publisher.buffer_capacity")?;
        nonzero(self.publisher.replay_capacity as u64, "publisher.replay_capacity")?;
        nonzero(self.history.capacity as u64, "history.capacity")?;

        if self.collector.deadline_secs > self.cycle.timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "collector.deadline_secs ({}) exceeds cycle.timeout_secs ({})",
                self.collector.deadline_secs, self.cycle.timeout_secs
            )));
        }

        let mut ids = HashSet::new();
        for h in &self.hospitals {
            if h.id.trim().is_empty() {
                return Err(ConfigError::Invalid("hospital with empty id".into()));
            }
            if !ids.insert(h.id.as_str()) {
                return Err(ConfigError::Invalid(format!("hospital id '{}' configured twice", h.id)));
            }
            if let SourceConf::Http { url } = &h.source {
                if url.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!("hospital '{}' has an empty source url", h.id)));
                }
            }
        }

        let needs_push = self.hospitals.iter().any(|h| matches!(h.source, SourceConf::Push { .. }));
        if needs_push && self.mqtt.is_none() {
            return Err(ConfigError::Invalid("push sources configured but no mqtt section".into()));
        }

        self.threshold_table()?;
        Ok(())
    }

    pub fn threshold_table(&self) -> Result<ThresholdTable, ThresholdConfigInvalid> {
        ThresholdTable::from_config(&self.thresholds)
    }

    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            interval: Duration::from_secs(self.cycle.interval_secs),
            timeout: Duration::from_secs(self.cycle.timeout_secs),
        }
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        let c = &self.collector;
        CollectorSettings {
            fetch_timeout: Duration::from_millis(c.fetch_timeout_ms),
            max_attempts: c.max_attempts,
            backoff_base: Duration::from_millis(c.backoff_base_ms),
            backoff_max: Duration::from_millis(c.backoff_max_ms),
            offline_after: c.offline_after,
            max_concurrency: c.max_concurrency,
            cycle_deadline: Duration::from_secs(c.deadline_secs),
        }
    }

    pub fn alert_settings(&self) -> AlertSettings {
        AlertSettings {
            lock_timeout: Duration::from_millis(self.alerts.lock_timeout_ms),
            lock_retries: self.alerts.lock_retries,
            archive_capacity: self.alerts.archive_capacity,
        }
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            buffer_capacity: self.publisher.buffer_capacity,
            replay_capacity: self.publisher.replay_capacity,
        }
    }

    pub fn build_hospitals(&self, client: &reqwest::Client, inbox: &Arc<PushInbox>) -> Vec<HospitalEntry> {
        self.hospitals
            .iter()
            .map(|h| {
                let source: SharedSource = match &h.source {
                    SourceConf::Http { url } => Arc::new(HttpSource::new(client.clone(), url.clone())),
                    SourceConf::Push { max_age_secs } => Arc::new(PushSource::new(
                        inbox.clone(),
                        h.id.clone(),
                        Duration::from_secs(*max_age_secs),
                    )),
                };
                HospitalEntry::new(h.id.clone(), h.name.clone(), source)
            })
            .collect()
    }

    /// Wire every component from this configuration.
    pub fn build_centre(
        &self,
        client: &reqwest::Client,
        inbox: &Arc<PushInbox>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Result<CommandCentre, ConfigError> {
        let engine = sinks
            .into_iter()
            .fold(AlertEngine::new(self.threshold_table()?, self.alert_settings()), |engine, sink| {
                engine.with_sink(sink)
            });
        Ok(CommandCentre::new(
            Collector::new(self.build_hospitals(client, inbox), self.collector_settings()),
            engine,
            Publisher::new(self.publisher_settings()),
            AggregateHistory::new(self.history.capacity),
            self.cycle_settings(),
        ))
    }
}
