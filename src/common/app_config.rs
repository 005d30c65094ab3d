// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

static CONFIG: OnceLock<PronghornConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static PronghornConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = PronghornConfig::load_from_file(path.as_ref())?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static PronghornConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = PronghornConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static PronghornConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("PRONGHORN_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let default = PathBuf::from("pronghorn.toml");
    if default.exists() {
        return Ok(default);
    }

    Err(anyhow!(
        "missing config file: set $PRONGHORN_CONFIG or create ./pronghorn.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct PronghornConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression; takes precedence over
    /// `log_level` (e.g. "pronghorn=debug,h2=off,hyper=off,tonic=off").
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl PronghornConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn effective_log_filter(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.clone())
    }
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_internal_service_port")]
    pub internal_service_port: u16,
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_internal_service_port() -> u16 {
    9070
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            internal_service_port: default_internal_service_port(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Threads used to fan out ExecPlanFragment RPCs.
    #[serde(default)]
    pub exec_rpc_threads: usize,
    /// Threads used by the bulk filesystem operation driver.
    #[serde(default)]
    pub fs_op_threads: usize,
    #[serde(default = "default_rpc_connect_timeout_ms")]
    pub rpc_connect_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Progress is logged every time this percentage of scan ranges completes.
    #[serde(default = "default_progress_log_period_percent")]
    pub progress_log_period_percent: i64,
}

fn default_rpc_connect_timeout_ms() -> u64 {
    10_000
}

fn default_rpc_timeout_ms() -> u64 {
    600_000
}

fn default_progress_log_period_percent() -> i64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_rpc_threads: 0,
            fs_op_threads: 0,
            rpc_connect_timeout_ms: default_rpc_connect_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            progress_log_period_percent: default_progress_log_period_percent(),
        }
    }
}

impl RuntimeConfig {
    pub fn actual_exec_rpc_threads(&self) -> usize {
        if self.exec_rpc_threads > 0 {
            self.exec_rpc_threads
        } else {
            default_parallelism()
        }
    }

    pub fn actual_fs_op_threads(&self) -> usize {
        if self.fs_op_threads > 0 {
            self.fs_op_threads
        } else {
            default_parallelism()
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
