use std::path::Path;

use anyhow::Context;
use rdstream_logging::LogConfig;
use rdstream_net_rdma::RdmaConfig;
use serde::{Deserialize, Serialize};

/// Which transport the probe dials over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    #[default]
    Rdma,
    /// In-process echoing RDMA binding; needs no hardware or peer.
    Loopback,
}

/// Probe configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub rdma: RdmaConfig,
}

impl ProbeConfig {
    /// Load from a TOML file, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ProbeConfig = toml::from_str(content)?;
        config.rdma.validate()?;
        Ok(config)
    }
}
