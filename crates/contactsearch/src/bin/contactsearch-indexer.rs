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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use clap::Parser;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::signal;
use tracing::{error, info};

use contactsearch::config::{load_config, Overrides};
use contactsearch::daemon::Daemon;
use contactsearch::indexers::{ContactIndexer, Indexer};
use contactsearch::metrics::MetricsRegistry;

/// Indexes contacts from the database into the search backend.
#[derive(Parser)]
#[command(name = "contactsearch-indexer", version)]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// URL of the search backend.
    #[arg(long)]
    elastic_url: Option<String>,
    /// Connection string for the contact database.
    #[arg(long)]
    db: Option<String>,
    /// Seconds between polls for database updates.
    #[arg(long)]
    poll: Option<u64>,
    /// Rebuild into a fresh physical index, swap the alias, then exit.
    #[arg(long)]
    rebuild: bool,
    /// Remove old physical indexes after a rebuild.
    #[arg(long)]
    cleanup: bool,
    /// Log level: error, warn, info, debug or trace.
    #[arg(long)]
    log_level: Option<String>,
    /// Alias for the contact index.
    #[arg(long)]
    contacts_index: Option<String>,
    #[arg(long)]
    contacts_shards: Option<u32>,
    #[arg(long)]
    contacts_replicas: Option<u32>,
    /// Rows per bulk sub-batch.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Bind host for the health/metrics server.
    #[arg(long)]
    host: Option<String>,
    /// Bind port for the health/metrics server.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    db: PgPool,
    metrics: Arc<MetricsRegistry>,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => (axum::http::StatusCode::OK, "OK".to_string()),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            format!("ERR: {}", e),
        ),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = match load_config(Overrides {
        config_path: args.config,
        elastic_url: args.elastic_url,
        db: args.db,
        poll: args.poll,
        rebuild: args.rebuild.then_some(true),
        cleanup: args.cleanup.then_some(true),
        log_level: args.log_level,
        contacts_index: args.contacts_index,
        contacts_shards: args.contacts_shards,
        contacts_replicas: args.contacts_replicas,
        batch_size: args.batch_size,
        host: args.host,
        port: args.port,
        ..Default::default()
    }) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // OTLP export installs its own subscriber stack when enabled
    let enable_otel = cfg!(feature = "otel")
        && std::env::var("CSEARCH_ENABLE_OTEL")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
    if enable_otel {
        contactsearch::otel::init_otel_from_env();
    } else {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!(
                "{},hyper_util=warn,hyper=warn,h2=warn,reqwest=warn,sqlx=warn",
                cfg.log_level
            ))
        });
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting indexer");

    let db = match PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&cfg.db)
        .await
    {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "unable to connect to database");
            std::process::exit(1);
        }
    };

    let contacts = match ContactIndexer::new(
        &cfg.elastic_url,
        &cfg.contacts_index,
        cfg.contacts_shards,
        cfg.contacts_replicas,
        cfg.batch_size,
    ) {
        Ok(ix) => Arc::new(ix),
        Err(e) => {
            error!(error = %format!("{:#}", e), "unable to build contact indexer");
            std::process::exit(1);
        }
    };

    if cfg.rebuild {
        // one complete pass into a fresh index, then exit
        match contacts.index(&db, true, cfg.cleanup).await {
            Ok(index) => info!(index, "rebuild complete"),
            Err(e) => {
                error!(error = %format!("{:#}", e), "error during rebuild");
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let metrics = Arc::new(MetricsRegistry::new(
        &cfg.metrics_namespace,
        &cfg.deployment_id,
    ));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState {
            db: db.clone(),
            metrics: Arc::clone(&metrics),
        });

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "health/metrics server listening");
    let serve_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "health/metrics server failed");
        }
    });

    let indexers: Vec<Arc<dyn Indexer>> = vec![contacts];
    let mut daemon = Daemon::new(
        db,
        Arc::clone(&metrics),
        indexers,
        Duration::from_secs(cfg.poll),
    );
    daemon.start();

    signal::ctrl_c().await?;
    info!("received exit signal, exiting");

    daemon.stop().await;
    serve_handle.abort();

    Ok(())
}
