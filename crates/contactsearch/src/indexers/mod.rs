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

//! Indexer trait and the shared physical-index lifecycle.
//!
//! Concrete indexers supply a projection query and an index definition; the
//! lifecycle here is common: physical indexes are named `{alias}_{YYYY_MM_DD}`
//! with a numeric suffix on same-day collisions, the alias is swapped
//! atomically onto exactly one physical index, and superseded indexes are
//! garbage collected once a newer one is current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;

use crate::elastic::{self, ElasticError};

mod contacts;
pub use contacts::ContactIndexer;

/// Frames one bulk index operation; the document source follows on the next line.
pub(crate) fn index_action(id: i64, version: i64, routing: i64) -> String {
    format!(
        r#"{{"index":{{"_id":{},"version":{},"version_type":"external","routing":{}}}}}"#,
        id, version, routing
    )
}

/// Frames one bulk delete operation.
pub(crate) fn delete_action(id: i64, version: i64, routing: i64) -> String {
    format!(
        r#"{{"delete":{{"_id":{},"version":{},"version_type":"external","routing":{}}}}}"#,
        id, version, routing
    )
}

/// Cumulative per-indexer counters, written only by the owning indexer task
/// and read as snapshots by the stats reporter.
#[derive(Default)]
pub struct Stats {
    indexed: AtomicI64,
    deleted: AtomicI64,
    elapsed_ns: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Documents created or updated.
    pub indexed: i64,
    /// Documents tombstone-deleted.
    pub deleted: i64,
    /// Wall time spent inside bulk writes.
    pub elapsed: Duration,
}

impl Stats {
    fn record(&self, indexed: i64, deleted: i64, elapsed: Duration) {
        self.indexed.fetch_add(indexed, Ordering::Relaxed);
        self.deleted.fetch_add(deleted, Ordering::Relaxed);
        self.elapsed_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            indexed: self.indexed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            elapsed: Duration::from_nanos(self.elapsed_ns.load(Ordering::Relaxed)),
        }
    }
}

/// What we send to the backend to create a physical index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub settings: IndexSettings,
    pub mappings: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSettings {
    pub index: IndexOptions,
    pub analysis: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexOptions {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub routing_partition_size: u32,
}

impl IndexDefinition {
    /// Parses an embedded definition and applies the configured shard and
    /// replica counts.
    pub fn parse(base: &str, shards: u32, replicas: u32) -> Result<Self, serde_json::Error> {
        let mut def: IndexDefinition = serde_json::from_str(base)?;
        def.settings.index.number_of_shards = shards;
        def.settings.index.number_of_replicas = replicas;
        Ok(def)
    }
}

/// Capability set the daemon depends on. Implementations differ only in
/// their projection and index definition.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// The alias this indexer owns.
    fn name(&self) -> &str;

    /// Runs one pass and returns the physical index written to.
    async fn index(&self, db: &PgPool, rebuild: bool, cleanup: bool) -> Result<String>;

    fn stats(&self) -> StatsSnapshot;

    /// Watermark currently visible in the backend for the given index.
    async fn es_last_modified(&self, index: &str) -> Result<DateTime<Utc>, ElasticError>;

    /// Newest `modified_on` in the source store.
    async fn db_last_modified(&self, db: &PgPool) -> Result<DateTime<Utc>>;
}

/// Shared lifecycle state embedded by concrete indexers.
pub struct BaseIndexer {
    client: Client,
    elastic_url: String,
    name: String,
    definition: IndexDefinition,
    stats: Stats,
}

/// Response items from a bulk submission, classified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub conflicted: usize,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    index: Option<BulkItemResult>,
    #[serde(default)]
    delete: Option<BulkItemResult>,
}

#[derive(Debug, Deserialize)]
struct BulkItemResult {
    #[serde(rename = "_id")]
    id: String,
    status: u16,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: LastModifiedSource,
}

#[derive(Debug, Deserialize)]
struct LastModifiedSource {
    modified_on: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    indices: HashMap<String, serde_json::Value>,
}

/// Sorts physical index names newest first. Plain byte-wise reverse order:
/// for names differing only by a `_n` suffix the suffixed form is longer and
/// therefore greater, so the latest same-day rebuild wins.
fn newest_first(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.reverse();
    names
}

/// Builds the atomic alias mutation payload: remove every existing mapping,
/// add the new one.
fn alias_actions(alias: &str, existing: &[String], new_index: &str) -> serde_json::Value {
    let mut actions = Vec::with_capacity(existing.len() + 1);
    for idx in existing {
        actions.push(json!({"remove": {"index": idx, "alias": alias}}));
    }
    actions.push(json!({"add": {"index": new_index, "alias": alias}}));
    json!({ "actions": actions })
}

/// Classifies per-item bulk results. Conflicts are the designed resolution
/// path for replays and never count as failures.
fn classify_bulk(items: &[BulkItem]) -> BulkCounts {
    let mut counts = BulkCounts::default();

    for item in items {
        if let Some(index) = &item.index {
            tracing::debug!(id = %index.id, status = index.status, "index response");
            match index.status {
                201 => counts.created += 1,
                200 => counts.updated += 1,
                409 => counts.conflicted += 1,
                _ => {
                    tracing::error!(id = %index.id, status = index.status, result = ?index.result, "error indexing document");
                }
            }
        } else if let Some(delete) = &item.delete {
            tracing::debug!(id = %delete.id, status = delete.status, "delete response");
            match delete.status {
                200 => counts.deleted += 1,
                409 => counts.conflicted += 1,
                _ => {}
            }
        } else {
            tracing::error!("unparsed item in bulk response");
        }
    }

    counts
}

impl BaseIndexer {
    pub fn new(elastic_url: &str, name: &str, definition: IndexDefinition) -> Self {
        Self {
            client: Client::new(),
            elastic_url: elastic_url.trim_end_matches('/').to_string(),
            name: name.to_string(),
            definition,
            stats: Stats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records indexing activity and updates statistics.
    pub(crate) fn record_activity(&self, indexed: usize, deleted: usize, elapsed: Duration) {
        self.stats.record(indexed as i64, deleted as i64, elapsed);

        tracing::info!(
            indexer = %self.name,
            indexed,
            deleted,
            elapsed_ms = elapsed.as_millis() as u64,
            "completed indexing"
        );
    }

    /// Finds all physical indexes currently mapped to our alias, newest
    /// first. Empty on any error; the caller treats that as "create one".
    pub async fn find_indexes(&self) -> Vec<String> {
        let url = format!("{}/{}", self.elastic_url, self.name);
        let response: HashMap<String, serde_json::Value> =
            match elastic::request_json(&self.client, Method::GET, &url, None).await {
                Ok(r) => r,
                // error could mean a variety of things, the caller decides
                Err(_) => return Vec::new(),
            };

        let indexes = newest_first(response.into_keys().collect());
        tracing::debug!(indexer = %self.name, indexes = ?indexes, "found physical indexes");
        indexes
    }

    /// Creates a new physical index named for today, e.g. `contacts_2025_03_05`,
    /// probing for same-day collisions and appending `_1`, `_2`, ... until a
    /// free name is found. The alias is not touched here.
    pub async fn create_new_index(&self) -> Result<String, ElasticError> {
        let today = Utc::now().format("%Y_%m_%d").to_string();
        let mut index = format!("{}_{}", self.name, today);
        let mut suffix = 0;

        loop {
            let url = format!("{}/{}", self.elastic_url, index);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ElasticError::Transport(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                break;
            }

            suffix += 1;
            index = format!("{}_{}_{}", self.name, today, suffix);
        }

        let body =
            serde_json::to_vec(&self.definition).map_err(|e| ElasticError::Decode(e.to_string()))?;
        let url = format!("{}/{}", self.elastic_url, index);
        elastic::send(&self.client, Method::PUT, &url, Some(&body)).await?;

        tracing::info!(indexer = %self.name, index, "created new index");
        Ok(index)
    }

    /// Atomically remaps the alias onto `new_index`, removing any existing
    /// mappings in the same request. Safe to retry.
    pub async fn update_alias(&self, new_index: &str) -> Result<(), ElasticError> {
        let existing = self.find_indexes().await;
        for idx in &existing {
            tracing::debug!(indexer = %self.name, index = %idx, "removing old alias");
        }

        let payload = alias_actions(&self.name, &existing, new_index);
        let body = serde_json::to_vec(&payload).map_err(|e| ElasticError::Decode(e.to_string()))?;
        let url = format!("{}/_aliases", self.elastic_url);
        elastic::send(&self.client, Method::POST, &url, Some(&body)).await?;

        tracing::info!(indexer = %self.name, index = new_index, "updated alias");
        Ok(())
    }

    /// Removes all indexes with our alias prefix that sort strictly below
    /// the current authoritative index.
    pub async fn cleanup_indexes(&self) -> Result<(), ElasticError> {
        let currents = self.find_indexes().await;

        // no current indexes? this is a noop
        let Some(current) = currents.first() else {
            return Ok(());
        };

        let url = format!("{}/_cluster/health?level=indices", self.elastic_url);
        let health: HealthResponse =
            elastic::request_json(&self.client, Method::GET, &url, None).await?;

        for name in health.indices.keys() {
            if name.starts_with(&self.name) && name < current {
                tracing::info!(index = %name, "removing old index");
                let url = format!("{}/{}", self.elastic_url, name);
                elastic::send(&self.client, Method::DELETE, &url, None).await?;
            }
        }

        Ok(())
    }

    /// Submits a pre-framed newline-delimited bulk payload and classifies
    /// the per-item results.
    pub async fn index_batch(&self, index: &str, batch: &[u8]) -> Result<BulkCounts, ElasticError> {
        if index.is_empty() {
            return Err(ElasticError::IndexMissing);
        }

        let url = format!("{}/{}/_bulk", self.elastic_url, index);
        let response: BulkResponse =
            elastic::request_json(&self.client, Method::PUT, &url, Some(batch)).await?;

        let counts = classify_bulk(&response.items);
        tracing::debug!(
            created = counts.created,
            updated = counts.updated,
            deleted = counts.deleted,
            conflicted = counts.conflicted,
            "indexed batch"
        );

        Ok(counts)
    }

    /// Queries a concrete index for its newest document and returns that
    /// document's `modified_on`. A fresh index reports the zero watermark.
    pub async fn es_last_modified(&self, index: &str) -> Result<DateTime<Utc>, ElasticError> {
        if index.is_empty() {
            return Err(ElasticError::IndexMissing);
        }

        let body = br#"{"sort":[{"modified_on_mu":"desc"}],"_source":{"includes":["modified_on","id"]},"size":1,"track_total_hits":false}"#;
        let url = format!("{}/{}/_search", self.elastic_url, index);
        let response: SearchResponse =
            elastic::request_json(&self.client, Method::POST, &url, Some(body)).await?;

        Ok(response
            .hits
            .hits
            .first()
            .map(|h| h.source.modified_on)
            .unwrap_or(DateTime::UNIX_EPOCH))
    }
}
