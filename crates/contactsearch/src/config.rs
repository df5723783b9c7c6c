// Copyright 2025 ContactSearch Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration, merged from: defaults <- config file <- env <- CLI.

use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

/// Invalid user input at startup; the process exits non-zero.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl Error for ConfigError {}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// URL of the search backend.
    pub elastic_url: String,
    /// Connection string for the contact database.
    pub db: String,
    /// Seconds to wait between checking for database updates.
    pub poll: u64,
    /// Rebuild the index into a fresh physical index, swap, then exit.
    pub rebuild: bool,
    /// Remove old physical indexes after a rebuild.
    pub cleanup: bool,
    /// One of error, warn, info, debug, trace.
    pub log_level: String,
    /// Prefix for exported gauges.
    pub metrics_namespace: String,
    /// Deployment label attached to exported gauges.
    pub deployment_id: String,
    /// Alias to use for the contact index.
    pub contacts_index: String,
    /// Shard count for newly created contact indexes.
    pub contacts_shards: u32,
    /// Replica count for newly created contact indexes.
    pub contacts_replicas: u32,
    /// Rows per bulk sub-batch.
    pub batch_size: usize,
    /// Bind host for the health/metrics server.
    pub host: String,
    /// Bind port for the health/metrics server.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            elastic_url: "http://localhost:9200".to_string(),
            db: "postgres://localhost/contactsearch?sslmode=disable".to_string(),
            poll: 5,
            rebuild: false,
            cleanup: false,
            log_level: "info".to_string(),
            metrics_namespace: "contactsearch".to_string(),
            deployment_id: "dev".to_string(),
            contacts_index: "contacts".to_string(),
            contacts_shards: 2,
            contacts_replicas: 1,
            batch_size: 500,
            host: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

/// CLI-level overrides that the binary passes to [`load_config`].
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub elastic_url: Option<String>,
    pub db: Option<String>,
    pub poll: Option<u64>,
    pub rebuild: Option<bool>,
    pub cleanup: Option<bool>,
    pub log_level: Option<String>,
    pub metrics_namespace: Option<String>,
    pub deployment_id: Option<String>,
    pub contacts_index: Option<String>,
    pub contacts_shards: Option<u32>,
    pub contacts_replicas: Option<u32>,
    pub batch_size: Option<usize>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

fn env_string(base: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        *base = v;
    }
}

fn env_parse<T: std::str::FromStr>(base: &mut T, key: &str) {
    // unparseable env values are ignored, the previous layer wins
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *base = parsed;
        }
    }
}

/// Loads and merges Config from: defaults <- config file <- env vars <- CLI.
pub fn load_config(opts: Overrides) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| ConfigError(format!("error reading {}: {}", path.display(), e)))?;
            cfg = toml::from_str(&raw)
                .map_err(|e| ConfigError(format!("error parsing {}: {}", path.display(), e)))?;
        }
    }

    // env vars override file
    env_string(&mut cfg.elastic_url, "CSEARCH_ELASTIC_URL");
    env_string(&mut cfg.db, "CSEARCH_DB");
    env_parse(&mut cfg.poll, "CSEARCH_POLL");
    env_parse(&mut cfg.rebuild, "CSEARCH_REBUILD");
    env_parse(&mut cfg.cleanup, "CSEARCH_CLEANUP");
    env_string(&mut cfg.log_level, "CSEARCH_LOG_LEVEL");
    env_string(&mut cfg.metrics_namespace, "CSEARCH_METRICS_NAMESPACE");
    env_string(&mut cfg.deployment_id, "CSEARCH_DEPLOYMENT_ID");
    env_string(&mut cfg.contacts_index, "CSEARCH_CONTACTS_INDEX");
    env_parse(&mut cfg.contacts_shards, "CSEARCH_CONTACTS_SHARDS");
    env_parse(&mut cfg.contacts_replicas, "CSEARCH_CONTACTS_REPLICAS");
    env_parse(&mut cfg.batch_size, "CSEARCH_BATCH_SIZE");
    env_string(&mut cfg.host, "CSEARCH_HOST");
    env_parse(&mut cfg.port, "CSEARCH_PORT");

    // CLI overrides everything
    if let Some(v) = opts.elastic_url {
        cfg.elastic_url = v;
    }
    if let Some(v) = opts.db {
        cfg.db = v;
    }
    if let Some(v) = opts.poll {
        cfg.poll = v;
    }
    if let Some(v) = opts.rebuild {
        cfg.rebuild = v;
    }
    if let Some(v) = opts.cleanup {
        cfg.cleanup = v;
    }
    if let Some(v) = opts.log_level {
        cfg.log_level = v;
    }
    if let Some(v) = opts.metrics_namespace {
        cfg.metrics_namespace = v;
    }
    if let Some(v) = opts.deployment_id {
        cfg.deployment_id = v;
    }
    if let Some(v) = opts.contacts_index {
        cfg.contacts_index = v;
    }
    if let Some(v) = opts.contacts_shards {
        cfg.contacts_shards = v;
    }
    if let Some(v) = opts.contacts_replicas {
        cfg.contacts_replicas = v;
    }
    if let Some(v) = opts.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = opts.host {
        cfg.host = v;
    }
    if let Some(v) = opts.port {
        cfg.port = v;
    }

    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.elastic_url.is_empty() {
            return Err(ConfigError("elastic_url may not be empty".to_string()));
        }
        if self.db.is_empty() {
            return Err(ConfigError("db may not be empty".to_string()));
        }
        if self.poll == 0 {
            return Err(ConfigError("poll must be at least 1 second".to_string()));
        }
        if self.contacts_index.is_empty() {
            return Err(ConfigError("contacts_index may not be empty".to_string()));
        }
        if self.contacts_shards == 0 {
            return Err(ConfigError("contacts_shards must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError("batch_size must be at least 1".to_string()));
        }
        if !matches!(
            self.log_level.as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(ConfigError(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }
}
