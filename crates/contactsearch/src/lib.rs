//! Incremental contact indexing into Elasticsearch.
//!
//! The pieces fit together like this:
//! - `elastic` is the JSON-over-HTTP transport with bounded retries
//! - `indexers` owns the physical-index lifecycle (discover, create,
//!   alias swap, cleanup), the bulk protocol and the contact projection
//! - `daemon` drives one task per indexer on a poll interval plus a
//!   stats reporter, and shuts everything down on a quit broadcast
//! - `config` and `metrics` are the boring-but-necessary edges

pub mod config;
pub mod daemon;
pub mod elastic;
pub mod indexers;
pub mod metrics;
pub mod otel;
