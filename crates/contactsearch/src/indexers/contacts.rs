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

//! Contact indexer: projects modified contact rows into search documents.
//!
//! The projection happens in SQL. One modified-since query flattens each
//! contact with its URNs, custom fields (including the trailing-segment
//! keyword extraction for state/district/ward values), manual/query group
//! memberships, current flow and flow-run history into a single JSON
//! document, streamed ascending by `modified_on`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{PgPool, Row};

use super::{
    delete_action, index_action, BaseIndexer, IndexDefinition, Indexer, StatsSnapshot,
};
use crate::elastic::ElasticError;

const CONTACTS_INDEX_DEF: &str = include_str!("contacts.index.json");

const SQL_SELECT_MODIFIED: &str = r#"
SELECT org_id, id, modified_on, is_active, row_to_json(t)::text FROM (
	SELECT
		id,
		org_id,
		uuid,
		name,
		language,
		status,
		ticket_count AS tickets,
		is_active,
		created_on,
		modified_on,
		last_seen_on,
		EXTRACT(EPOCH FROM modified_on) * 1000000 AS modified_on_mu,
		(
			SELECT array_to_json(array_agg(row_to_json(u)))
			FROM (SELECT scheme, path FROM contacts_contacturn WHERE contact_id = contacts_contact.id) u
		) AS urns,
		(
			SELECT jsonb_agg(f.value)
			FROM (
				SELECT
					CASE
					WHEN value ? 'ward'
					THEN jsonb_build_object('ward_keyword', trim(substring(value ->> 'ward' from '(?!.* > )([^>]+)')))
					ELSE '{}'::jsonb
					END || district_value.value AS value
				FROM (
					SELECT
						CASE
						WHEN value ? 'district'
						THEN jsonb_build_object('district_keyword', trim(substring(value ->> 'district' from '(?!.* > )([^>]+)')))
						ELSE '{}'::jsonb
						END || state_value.value AS value
					FROM (
						SELECT
							CASE
							WHEN value ? 'state'
							THEN jsonb_build_object('state_keyword', trim(substring(value ->> 'state' from '(?!.* > )([^>]+)')))
							ELSE '{}'::jsonb
							END || jsonb_build_object('field', key) || value AS value
						FROM jsonb_each(contacts_contact.fields)
					) state_value
				) AS district_value
			) AS f
		) AS fields,
		(
			SELECT array_to_json(array_agg(gc.contactgroup_id))
			FROM contacts_contactgroup_contacts gc
			INNER JOIN contacts_contactgroup g ON g.id = gc.contactgroup_id
			WHERE gc.contact_id = contacts_contact.id AND g.group_type IN ('M', 'Q')
		) AS group_ids,
		current_flow_id AS flow_id,
		(
			SELECT array_to_json(array_agg(DISTINCT fr.flow_id)) FROM flows_flowrun fr WHERE fr.contact_id = contacts_contact.id
		) AS flow_history_ids
	FROM contacts_contact
	WHERE modified_on >= $1
	ORDER BY modified_on ASC
	LIMIT 100000
) t;
"#;

/// Indexer for the contacts alias.
pub struct ContactIndexer {
    base: BaseIndexer,
    batch_size: usize,
}

#[derive(Default)]
struct BatchProgress {
    created: usize,
    updated: usize,
    deleted: usize,
    es_elapsed: Duration,
}

impl ContactIndexer {
    pub fn new(
        elastic_url: &str,
        name: &str,
        shards: u32,
        replicas: u32,
        batch_size: usize,
    ) -> Result<Self> {
        let definition = IndexDefinition::parse(CONTACTS_INDEX_DEF, shards, replicas)
            .context("error parsing contact index definition")?;

        Ok(Self {
            base: BaseIndexer::new(elastic_url, name, definition),
            batch_size,
        })
    }

    async fn flush(
        &self,
        index: &str,
        sub_batch: &mut String,
        progress: &mut BatchProgress,
    ) -> Result<(), ElasticError> {
        let started = Instant::now();
        let counts = self.base.index_batch(index, sub_batch.as_bytes()).await?;

        progress.es_elapsed += started.elapsed();
        progress.created += counts.created;
        progress.updated += counts.updated;
        progress.deleted += counts.deleted;
        sub_batch.clear();
        Ok(())
    }

    /// Streams and indexes all contacts modified since `last_modified`,
    /// flushing sub-batches of `batch_size` rows, until a cursor pass
    /// neither advances the watermark nor creates anything.
    async fn index_modified(
        &self,
        db: &PgPool,
        index: &str,
        mut last_modified: DateTime<Utc>,
        rebuild: bool,
    ) -> Result<()> {
        let mut total_fetched = 0usize;
        let mut total_created = 0usize;
        let mut total_updated = 0usize;
        let mut total_deleted = 0usize;

        let mut sub_batch = String::new();
        let start = Instant::now();

        loop {
            let batch_start = Instant::now();
            let mut batch_fetched = 0usize;
            let mut progress = BatchProgress::default();
            let query_modified = last_modified;

            {
                let mut rows = sqlx::query(SQL_SELECT_MODIFIED).bind(last_modified).fetch(db);

                while let Some(row) = rows
                    .try_next()
                    .await
                    .context("error querying modified contacts")?
                {
                    let org_id: i64 = row.try_get(0).context("error scanning org id")?;
                    let id: i64 = row.try_get(1).context("error scanning contact id")?;
                    let modified_on: DateTime<Utc> =
                        row.try_get(2).context("error scanning modified_on")?;
                    let is_active: bool = row.try_get(3).context("error scanning is_active")?;
                    let document: String = row.try_get(4).context("error scanning document")?;

                    batch_fetched += 1;
                    last_modified = modified_on;

                    let version = modified_on.timestamp_nanos_opt().unwrap_or_default();

                    if is_active {
                        tracing::debug!(id, modified_on = %modified_on, "modified contact");
                        sub_batch.push_str(&index_action(id, version, org_id));
                        sub_batch.push('\n');
                        sub_batch.push_str(&document);
                        sub_batch.push('\n');
                    } else {
                        tracing::debug!(id, modified_on = %modified_on, "deleted contact");
                        sub_batch.push_str(&delete_action(id, version, org_id));
                        sub_batch.push('\n');
                    }

                    if batch_fetched % self.batch_size == 0 {
                        self.flush(index, &mut sub_batch, &mut progress)
                            .await
                            .context("error flushing batch")?;
                    }
                }
            }

            if !sub_batch.is_empty() {
                self.flush(index, &mut sub_batch, &mut progress)
                    .await
                    .context("error flushing batch")?;
            }

            total_fetched += batch_fetched;
            total_created += progress.created;
            total_updated += progress.updated;
            total_deleted += progress.deleted;

            let batch_elapsed = batch_start.elapsed();
            let batch_rate = if batch_elapsed.as_secs_f64() > 0.0 {
                (batch_fetched as f64 / batch_elapsed.as_secs_f64()) as u64
            } else {
                0
            };

            // batch progress is info-worthy during a rebuild, noise otherwise
            if rebuild {
                tracing::info!(
                    index,
                    rate = batch_rate,
                    batch_fetched,
                    batch_created = progress.created,
                    batch_updated = progress.updated,
                    batch_elapsed_ms = batch_elapsed.as_millis() as u64,
                    batch_elapsed_es_ms = progress.es_elapsed.as_millis() as u64,
                    total_fetched,
                    total_created,
                    total_updated,
                    total_deleted,
                    total_elapsed_ms = start.elapsed().as_millis() as u64,
                    "indexed contact batch"
                );
            } else {
                tracing::debug!(
                    index,
                    rate = batch_rate,
                    batch_fetched,
                    batch_created = progress.created,
                    batch_updated = progress.updated,
                    batch_elapsed_ms = batch_elapsed.as_millis() as u64,
                    batch_elapsed_es_ms = progress.es_elapsed.as_millis() as u64,
                    total_fetched,
                    total_created,
                    total_updated,
                    total_deleted,
                    total_elapsed_ms = start.elapsed().as_millis() as u64,
                    "indexed contact batch"
                );
            }

            self.base.record_activity(
                progress.created + progress.updated,
                progress.deleted,
                progress.es_elapsed,
            );

            // watermark stayed put and nothing new was created, seen it all
            if last_modified == query_modified && progress.created == 0 {
                break;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Indexer for ContactIndexer {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn index(&self, db: &PgPool, rebuild: bool, cleanup: bool) -> Result<String> {
        let physical_indexes = self.base.find_indexes().await;
        let mut physical = physical_indexes.first().cloned().unwrap_or_default();

        // whether we need to remap our alias after building
        let mut remap_alias = false;

        // doesn't exist or we are rebuilding, create it
        if physical.is_empty() || rebuild {
            physical = self
                .base
                .create_new_index()
                .await
                .context("error creating new index")?;
            remap_alias = true;
        }

        let last_modified = self
            .base
            .es_last_modified(&physical)
            .await
            .context("error finding last modified")?;

        tracing::debug!(index = %physical, last_modified = %last_modified, "indexing newer than last modified");

        // rewind to absorb commit skew around the watermark
        self.index_modified(db, &physical, last_modified - chrono::Duration::seconds(5), rebuild)
            .await
            .context("error indexing documents")?;

        // if the index didn't previously exist or we are rebuilding, remap to our alias
        if remap_alias {
            self.base
                .update_alias(&physical)
                .await
                .context("error updating alias")?;
        }

        if cleanup {
            self.base
                .cleanup_indexes()
                .await
                .context("error cleaning up old indexes")?;
        }

        Ok(physical)
    }

    fn stats(&self) -> StatsSnapshot {
        self.base.stats()
    }

    async fn es_last_modified(&self, index: &str) -> Result<DateTime<Utc>, ElasticError> {
        self.base.es_last_modified(index).await
    }

    async fn db_last_modified(&self, db: &PgPool) -> Result<DateTime<Utc>> {
        let last_modified: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(modified_on) FROM contacts_contact")
                .fetch_one(db)
                .await
                .context("error querying database last modified")?;

        Ok(last_modified.unwrap_or(DateTime::UNIX_EPOCH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_definition_parses() {
        let ix = ContactIndexer::new("http://localhost:9200", "contacts", 4, 2, 500).unwrap();
        assert_eq!(ix.name(), "contacts");
        assert_eq!(ix.base.stats(), StatsSnapshot::default());
    }

    #[test]
    fn definition_maps_expected_fields() {
        let def = IndexDefinition::parse(CONTACTS_INDEX_DEF, 2, 1).unwrap();
        let properties = def.mappings.get("properties").unwrap();

        for field in [
            "urns",
            "fields",
            "group_ids",
            "flow_id",
            "flow_history_ids",
            "tickets",
            "uuid",
            "status",
            "language",
            "name",
            "created_on",
            "modified_on",
            "modified_on_mu",
            "last_seen_on",
        ] {
            assert!(properties.get(field).is_some(), "missing mapping for {}", field);
        }

        // routing is required so an org's documents land on the same shard
        assert_eq!(def.mappings["_routing"]["required"], serde_json::json!(true));
    }
}
