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

//! Drives a set of indexers on a poll interval.
//!
//! One task per indexer plus one stats reporter, all watching a shared quit
//! broadcast. Nothing is shared between indexer tasks beyond the database
//! pool; each owns its cursor and bulk buffers for the duration of a pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::indexers::{Indexer, StatsSnapshot};
use crate::metrics::MetricsRegistry;

/// How often the reporter samples indexer stats.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Lag needs two round trips, so it only runs every Nth report.
const LAG_EVERY: u64 = 5;

/// Deadline for one lag computation.
const LAG_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Daemon {
    db: PgPool,
    metrics: Arc<MetricsRegistry>,
    indexers: Vec<Arc<dyn Indexer>>,
    poll: Duration,
    quit: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(
        db: PgPool,
        metrics: Arc<MetricsRegistry>,
        indexers: Vec<Arc<dyn Indexer>>,
        poll: Duration,
    ) -> Self {
        let (quit, _) = watch::channel(false);

        Self {
            db,
            metrics,
            indexers,
            poll,
            quit,
            handles: Vec::new(),
        }
    }

    /// Spawns one polling task per indexer and the stats reporter.
    pub fn start(&mut self) {
        for ix in self.indexers.clone() {
            self.start_indexer(ix);
        }
        self.start_stats_reporter(REPORT_INTERVAL);
    }

    fn start_indexer(&mut self, ix: Arc<dyn Indexer>) {
        let db = self.db.clone();
        let poll = self.poll;
        let mut quit_rx = self.quit.subscribe();

        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {
                        if let Err(e) = ix.index(&db, false, false).await {
                            tracing::error!(indexer = ix.name(), error = %format!("{:#}", e), "error during indexing");
                        }
                    }
                    _ = quit_rx.changed() => break,
                }
            }

            tracing::info!(indexer = ix.name(), "indexer exiting");
        }));
    }

    fn start_stats_reporter(&mut self, interval: Duration) {
        let db = self.db.clone();
        let metrics = Arc::clone(&self.metrics);
        let indexers = self.indexers.clone();
        let mut quit_rx = self.quit.subscribe();

        self.handles.push(tokio::spawn(async move {
            let mut prev: HashMap<String, StatsSnapshot> = HashMap::new();
            let mut iterations: u64 = 0;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        report_stats(&db, &metrics, &indexers, &mut prev, iterations % LAG_EVERY == 0).await;
                    }
                    _ = quit_rx.changed() => break,
                }

                iterations += 1;
            }

            tracing::info!("stats reporter exiting");
        }));
    }

    /// Broadcasts the quit signal and waits for every task to finish its
    /// current iteration.
    pub async fn stop(self) {
        tracing::info!("daemon stopping");
        let _ = self.quit.send(true);

        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// rate = indexed per second of bulk-write time, zero when nothing moved.
fn rate(indexed_delta: i64, elapsed_delta: Duration) -> f64 {
    if indexed_delta > 0 && !elapsed_delta.is_zero() {
        indexed_delta as f64 / elapsed_delta.as_secs_f64()
    } else {
        0.0
    }
}

async fn report_stats(
    db: &PgPool,
    metrics: &MetricsRegistry,
    indexers: &[Arc<dyn Indexer>],
    prev: &mut HashMap<String, StatsSnapshot>,
    include_lag: bool,
) {
    for ix in indexers {
        let stats = ix.stats();
        let last = prev.get(ix.name()).copied().unwrap_or_default();

        let indexed_delta = stats.indexed - last.indexed;
        let deleted_delta = stats.deleted - last.deleted;
        let elapsed_delta = stats.elapsed.saturating_sub(last.elapsed);
        let rate_in_period = rate(indexed_delta, elapsed_delta);

        metrics.set_gauge(&format!("{}_indexed", ix.name()), indexed_delta as f64);
        metrics.set_gauge(&format!("{}_deleted", ix.name()), deleted_delta as f64);
        metrics.set_gauge(&format!("{}_rate", ix.name()), rate_in_period);

        prev.insert(ix.name().to_string(), stats);

        if include_lag {
            match calculate_lag(db, ix.as_ref()).await {
                Ok(lag) => {
                    let lag_secs = lag.num_milliseconds() as f64 / 1000.0;
                    metrics.set_gauge(&format!("{}_lag", ix.name()), lag_secs);
                }
                Err(e) => {
                    tracing::error!(indexer = ix.name(), error = %format!("{:#}", e), "error calculating lag");
                }
            }
        }

        tracing::info!(
            indexer = ix.name(),
            indexed = indexed_delta,
            deleted = deleted_delta,
            rate = rate_in_period,
            "stats reported"
        );
    }
}

/// lag = newest `modified_on` in the source minus the backend watermark.
async fn calculate_lag(db: &PgPool, ix: &dyn Indexer) -> Result<chrono::Duration> {
    tokio::time::timeout(LAG_TIMEOUT, async {
        let es_last_modified = ix
            .es_last_modified(ix.name())
            .await
            .context("error getting search index last modified")?;
        let db_last_modified = ix
            .db_last_modified(db)
            .await
            .context("error getting database last modified")?;

        Ok(db_last_modified - es_last_modified)
    })
    .await
    .context("timed out calculating lag")?
}
