// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// root configuration for a runner node.
///
/// every field has a default so an empty file (or no file at all) yields a
/// usable single-gpu configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// total gpu memory, in GB, the runner may hand out to model instances.
    pub memory_budget_gb: u64,
    /// address the worker task api listens on.
    pub api_socket: SocketAddr,
    /// base url backends use to reach the task api. defaults to
    /// `http://{api_socket}`.
    pub public_url: Option<String>,
    /// directory holding the backend checkouts (axolotl, sd-scripts).
    pub backend_root: PathBuf,
    /// ready instances idle for longer than this are retired.
    pub idle_timeout_secs: u64,
    /// a submitted task nobody pulls within this window fails.
    pub pull_timeout_secs: u64,
    /// a pulled task not resolved within this window is treated as a crash.
    pub resolve_timeout_secs: u64,
    /// how often the background sweep runs.
    pub sweep_interval_secs: u64,
    /// how long a task pull blocks before answering "no task".
    pub pull_wait_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            memory_budget_gb: 24,
            api_socket: SocketAddr::from(([127, 0, 0, 1], 8060)),
            public_url: None,
            backend_root: PathBuf::from(".."),
            idle_timeout_secs: 5 * 60,
            pull_timeout_secs: 30,
            resolve_timeout_secs: 10 * 60,
            sweep_interval_secs: 5,
            pull_wait_secs: 10,
        }
    }
}

impl RunnerConfig {
    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_gb.saturating_mul(1024 * 1024 * 1024)
    }

    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{}", self.api_socket))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn pull_wait(&self) -> Duration {
        Duration::from_secs(self.pull_wait_secs)
    }
}

pub fn parse(text: &str) -> Result<RunnerConfig> {
    toml::from_str(text).context("failed to parse runner configuration")
}

pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<RunnerConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid config file {}", path.display()))
}
