use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use crate::{
    alerts::AlertConfig, correlator::CorrelationConfig, dispatch::DispatchConfig,
    error::EngineError, transport::TransportConfig,
};

/// Everything the engine needs to run a session, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Stable client identifier; a random one is generated when absent.
    pub client_id: Option<String>,
    /// Inference backend address as `host:port`.
    pub backend_addr: String,
    pub database_path: PathBuf,
    /// Directory of encoded frames replayed by the command-line runner.
    pub frames_dir: Option<PathBuf>,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub correlation: CorrelationConfig,
    pub alerts: AlertConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            backend_addr: "127.0.0.1:8765".into(),
            database_path: PathBuf::from("drivewatch.sqlite3"),
            frames_dir: None,
            transport: TransportConfig::default(),
            dispatch: DispatchConfig::default(),
            correlation: CorrelationConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.backend_addr.trim().is_empty() {
            return Err(EngineError::Config("backendAddr must not be empty".into()));
        }
        self.transport.validate()?;
        self.dispatch.validate()?;
        self.correlation.validate()?;
        self.alerts.validate()?;
        Ok(())
    }
}

/// File-backed configuration with an in-memory copy.
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<EngineConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            read_config(&path)?
        } else {
            EngineConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> EngineConfig {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, config: EngineConfig) -> Result<()> {
        config
            .validate()
            .map_err(|err| anyhow::anyhow!(err))
            .context("refusing to store invalid config")?;

        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.persist(&config)?;
        *guard = config;
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let data = read_config(&self.path)?;
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = data;
        Ok(())
    }

    fn persist(&self, data: &EngineConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }
}

fn read_config(path: &Path) -> Result<EngineConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))
}
