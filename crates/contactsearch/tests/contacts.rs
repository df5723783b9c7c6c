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

//! End-to-end indexing scenarios against live Postgres and Elasticsearch.
//!
//! Gated on CSEARCH_TEST_DATABASE_URL and CSEARCH_TEST_ELASTIC_URL so CI
//! without the services skips cleanly. The fixture set lives in testdb.sql
//! and is reseeded on every run.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};

use contactsearch::indexers::{
    BaseIndexer, ContactIndexer, IndexDefinition, Indexer, StatsSnapshot,
};

const ALIAS: &str = "indexer_test";

struct TestContext {
    db: PgPool,
    elastic_url: String,
    http: reqwest::Client,
}

async fn setup() -> Option<TestContext> {
    let (Ok(db_url), Ok(elastic_url)) = (
        std::env::var("CSEARCH_TEST_DATABASE_URL"),
        std::env::var("CSEARCH_TEST_ELASTIC_URL"),
    ) else {
        eprintln!(
            "skipping: set CSEARCH_TEST_DATABASE_URL and CSEARCH_TEST_ELASTIC_URL to run"
        );
        return None;
    };

    let db = PgPoolOptions::new()
        .max_connections(4)
        .connect(&db_url)
        .await
        .expect("connect test database");

    sqlx::raw_sql(include_str!("testdb.sql"))
        .execute(&db)
        .await
        .expect("seed test database");

    let http = reqwest::Client::new();
    let ctx = TestContext {
        db,
        elastic_url: elastic_url.trim_end_matches('/').to_string(),
        http,
    };

    // drop anything left over from previous runs
    for name in all_indexes(&ctx).await {
        if name.starts_with(ALIAS) {
            ctx.http
                .delete(format!("{}/{}", ctx.elastic_url, name))
                .send()
                .await
                .expect("delete index");
        }
    }

    Some(ctx)
}

async fn all_indexes(ctx: &TestContext) -> Vec<String> {
    let aliases: Value = ctx
        .http
        .get(format!("{}/_aliases", ctx.elastic_url))
        .send()
        .await
        .expect("list aliases")
        .json()
        .await
        .expect("decode aliases");

    aliases
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default()
}

async fn indexes_with_prefix(ctx: &TestContext, prefix: &str) -> Vec<String> {
    let mut found: Vec<String> = all_indexes(ctx)
        .await
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect();
    found.sort();
    found
}

/// Makes everything written so far visible to search.
async fn refresh(ctx: &TestContext) {
    let resp = ctx
        .http
        .post(format!("{}/_refresh", ctx.elastic_url))
        .send()
        .await
        .expect("refresh");
    assert!(resp.status().is_success());
}

async fn assert_query(ctx: &TestContext, query: Value, expected: &[i64]) {
    let body = json!({"query": query, "sort": [{"id": "asc"}]});
    let results: Value = ctx
        .http
        .post(format!("{}/{}/_search", ctx.elastic_url, ALIAS))
        .json(&body)
        .send()
        .await
        .expect("search")
        .json()
        .await
        .expect("decode search response");

    let hits = results["hits"]["hits"]
        .as_array()
        .unwrap_or_else(|| panic!("no hits in response: {}", results));
    let actual: Vec<i64> = hits
        .iter()
        .map(|hit| hit["_id"].as_str().unwrap().parse().unwrap())
        .collect();

    assert_eq!(expected, actual.as_slice(), "query mismatch for {}", query);
}

fn assert_stats(ix: &dyn Indexer, indexed: i64, deleted: i64) {
    let actual: StatsSnapshot = ix.stats();
    assert_eq!(indexed, actual.indexed, "indexed mismatch");
    assert_eq!(deleted, actual.deleted, "deleted mismatch");
}

fn match_q(field: &str, value: impl Into<Value>) -> Value {
    json!({"match": {field: {"query": value.into()}}})
}

fn phrase_q(field: &str, value: &str) -> Value {
    json!({"match_phrase": {field: {"query": value}}})
}

fn term_q(field: &str, value: impl Into<Value>) -> Value {
    json!({"term": {field: value.into()}})
}

fn exists_q(field: &str) -> Value {
    json!({"exists": {"field": field}})
}

fn gt_q(field: &str, value: impl Into<Value>) -> Value {
    json!({"range": {field: {"gt": value.into()}}})
}

fn lt_q(field: &str, value: impl Into<Value>) -> Value {
    json!({"range": {field: {"lt": value.into()}}})
}

fn all_q(queries: Vec<Value>) -> Value {
    json!({"bool": {"must": queries}})
}

fn not_q(query: Value) -> Value {
    json!({"bool": {"must_not": [query]}})
}

fn nested_q(path: &str, query: Value) -> Value {
    json!({"nested": {"path": path, "query": query}})
}

async fn run_query_battery(ctx: &TestContext) {
    let nickname = "17103bb1-1b48-4b70-92f7-1f6b73bd3488";
    let age = "05bca1cd-e322-4837-9595-86d0d85e5adb";
    let joined = "e0eac267-463a-4c00-9732-cab62df07b16";
    let state = "22d11697-edba-4186-b084-793e3b876379";
    let district = "fcab2439-861c-4832-aa54-0c97f38f24ab";
    let ward = "a551ade4-e5a0-4d83-b185-53b515ad2f2a";

    let cases: Vec<(Value, Vec<i64>)> = vec![
        (match_q("org_id", 1), vec![1, 2, 3, 4]),
        (match_q("name", "JOHn"), vec![4]),
        (term_q("name.keyword", "JOHN DOE"), vec![4]),
        // can search on both first and last name
        (all_q(vec![match_q("name", "john"), match_q("name", "doe")]), vec![4]),
        (match_q("name", "Ajodinabiff"), vec![5]),
        (match_q("language", "eng"), vec![1]),
        (match_q("status", "B"), vec![3]),
        (match_q("status", "S"), vec![2]),
        (match_q("tickets", 2), vec![1]),
        (match_q("tickets", 1), vec![2, 3]),
        (gt_q("tickets", 0), vec![1, 2, 3]),
        (match_q("flow_id", 1), vec![2, 3]),
        (match_q("flow_id", 2), vec![4]),
        (match_q("flow_history_ids", 1), vec![1, 2, 3]),
        (match_q("flow_history_ids", 2), vec![1, 2]),
        (gt_q("created_on", "2017-01-01"), vec![1, 6, 8]),
        (lt_q("last_seen_on", "2019-01-01"), vec![3, 4]),
        (exists_q("last_seen_on"), vec![1, 2, 3, 4, 5, 6]),
        (not_q(exists_q("last_seen_on")), vec![7, 8, 9]),
        (
            nested_q(
                "urns",
                all_q(vec![
                    match_q("urns.scheme", "facebook"),
                    match_q("urns.path.keyword", "1000001"),
                ]),
            ),
            vec![8],
        ),
        // urn substring
        (
            nested_q(
                "urns",
                all_q(vec![match_q("urns.scheme", "tel"), phrase_q("urns.path", "779")]),
            ),
            vec![1, 2, 3, 6],
        ),
        (
            nested_q(
                "urns",
                all_q(vec![match_q("urns.scheme", "tel"), phrase_q("urns.path", "77911")]),
            ),
            vec![1],
        ),
        (
            nested_q(
                "urns",
                all_q(vec![match_q("urns.scheme", "tel"), phrase_q("urns.path", "600055")]),
            ),
            vec![5],
        ),
        // a contact with multiple tel urns
        (
            nested_q(
                "urns",
                all_q(vec![match_q("urns.scheme", "tel"), phrase_q("urns.path", "222")]),
            ),
            vec![1],
        ),
        // text field
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", nickname),
                    match_q("fields.text", "the rock"),
                ]),
            ),
            vec![1],
        ),
        // no tokenizing of field text
        (
            nested_q(
                "fields",
                all_q(vec![match_q("fields.field", nickname), match_q("fields.text", "rock")]),
            ),
            vec![],
        ),
        // people with no nickname
        (
            not_q(nested_q(
                "fields",
                all_q(vec![match_q("fields.field", nickname), exists_q("fields.text")]),
            )),
            vec![2, 3, 4, 5, 6, 7, 8, 9],
        ),
        // number field range
        (
            nested_q(
                "fields",
                all_q(vec![match_q("fields.field", age), gt_q("fields.number", 10)]),
            ),
            vec![2],
        ),
        // datetime field range
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", joined),
                    lt_q("fields.datetime", "2020-01-01T00:00:00Z"),
                ]),
            ),
            vec![3],
        ),
        // state field matches only the trailing location segment
        (
            nested_q(
                "fields",
                all_q(vec![match_q("fields.field", state), phrase_q("fields.state", "washington")]),
            ),
            vec![5],
        ),
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", state),
                    match_q("fields.state_keyword", "  washington"),
                ]),
            ),
            vec![5],
        ),
        // the country part of the location is not indexed
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", state),
                    match_q("fields.state_keyword", "usa"),
                ]),
            ),
            vec![],
        ),
        (
            nested_q(
                "fields",
                all_q(vec![match_q("fields.field", state), phrase_q("fields.state", "usa")]),
            ),
            vec![],
        ),
        // district field
        (
            nested_q(
                "fields",
                all_q(vec![match_q("fields.field", district), phrase_q("fields.district", "king")]),
            ),
            vec![7, 9],
        ),
        // phrase must match all terms
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", district),
                    phrase_q("fields.district", "King-Côunty"),
                ]),
            ),
            vec![7],
        ),
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", district),
                    match_q("fields.district_keyword", "King-Côunty"),
                ]),
            ),
            vec![7],
        ),
        // ward field
        (
            nested_q(
                "fields",
                all_q(vec![match_q("fields.field", ward), phrase_q("fields.ward", "district")]),
            ),
            vec![8],
        ),
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", ward),
                    match_q("fields.ward_keyword", "central district"),
                ]),
            ),
            vec![8],
        ),
        // no substring matching on the keyword variant
        (
            nested_q(
                "fields",
                all_q(vec![
                    match_q("fields.field", ward),
                    match_q("fields.ward_keyword", "district"),
                ]),
            ),
            vec![],
        ),
        (match_q("group_ids", 1), vec![1]),
        (match_q("group_ids", 4), vec![1, 2]),
        (match_q("group_ids", 2), vec![]),
    ];

    for (query, expected) in cases {
        assert_query(ctx, query, &expected).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn contact_indexing_end_to_end() {
    let Some(ctx) = setup().await else { return };

    let ix1 = ContactIndexer::new(&ctx.elastic_url, ALIAS, 2, 1, 4).unwrap();
    assert_eq!(ix1.name(), ALIAS);

    let fixture_max: DateTime<Utc> = "2017-11-10T21:11:59.890662Z".parse().unwrap();

    let db_modified = ix1.db_last_modified(&ctx.db).await.unwrap();
    assert_eq!(fixture_max, db_modified);

    // no index exists yet, the watermark probe must fail rather than lie
    assert!(ix1.es_last_modified(ALIAS).await.is_err());

    let expected_index = format!("{}_{}", ALIAS, Utc::now().format("%Y_%m_%d"));

    let index_name = ix1.index(&ctx.db, false, false).await.unwrap();
    assert_eq!(expected_index, index_name);
    refresh(&ctx).await;

    let es_modified = ix1.es_last_modified(ALIAS).await.unwrap();
    assert_eq!(fixture_max, es_modified);

    assert_stats(&ix1, 9, 0);
    assert_eq!(
        vec![expected_index.clone()],
        indexes_with_prefix(&ctx, ALIAS).await
    );

    run_query_battery(&ctx).await;

    // now make some changes: unlink a group, rename one contact, deactivate another
    sqlx::raw_sql(
        r#"
        DELETE FROM contacts_contactgroup_contacts WHERE id = 3;
        UPDATE contacts_contact SET name = 'John Deer', modified_on = '2020-08-20 14:00:00+00' WHERE id = 2;
        UPDATE contacts_contact SET is_active = FALSE, modified_on = '2020-08-22 15:00:00+00' WHERE id = 4;
        "#,
    )
    .execute(&ctx.db)
    .await
    .unwrap();

    let index_name = ix1.index(&ctx.db, false, false).await.unwrap();
    assert_eq!(expected_index, index_name); // same physical index used
    assert_stats(&ix1, 10, 1);
    refresh(&ctx).await;

    assert_eq!(
        vec![expected_index.clone()],
        indexes_with_prefix(&ctx, ALIAS).await
    );

    // only the new john matches, the old john is gone
    assert_query(&ctx, match_q("name", "john"), &[2]).await;

    // contact 2 is no longer in group 4
    assert_query(&ctx, match_q("group_ids", 4), &[1]).await;

    // rename again and simulate a second indexer doing a parallel rebuild
    sqlx::raw_sql(
        "UPDATE contacts_contact SET name = 'Eric', modified_on = '2020-08-20 14:00:00+00' WHERE id = 2;",
    )
    .execute(&ctx.db)
    .await
    .unwrap();

    let ix2 = ContactIndexer::new(&ctx.elastic_url, ALIAS, 2, 1, 4).unwrap();
    let index_name2 = ix2.index(&ctx.db, true, false).await.unwrap();
    assert_eq!(format!("{}_1", expected_index), index_name2); // new physical index
    assert_stats(&ix2, 8, 0);
    refresh(&ctx).await;

    // the old index is still around, the alias resolves to the new one
    assert_eq!(
        vec![expected_index.clone(), format!("{}_1", expected_index)],
        indexes_with_prefix(&ctx, ALIAS).await
    );
    assert_query(&ctx, match_q("name", "eric"), &[2]).await;

    // a third indexer rebuilds with cleanup, leaving only its own index
    let ix3 = ContactIndexer::new(&ctx.elastic_url, ALIAS, 2, 1, 4).unwrap();
    let index_name3 = ix3.index(&ctx.db, true, true).await.unwrap();
    assert_eq!(format!("{}_2", expected_index), index_name3);
    assert_stats(&ix3, 8, 0);
    refresh(&ctx).await;

    assert_eq!(
        vec![format!("{}_2", expected_index)],
        indexes_with_prefix(&ctx, ALIAS).await
    );

    // the original indexer discovers and writes to the survivor
    let index_name = ix1.index(&ctx.db, false, false).await.unwrap();
    assert_eq!(format!("{}_2", expected_index), index_name);
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn version_conflict_within_one_batch_is_absorbed() {
    let Some(ctx) = setup().await else { return };

    let definition = IndexDefinition::parse(
        r#"{
            "settings": {
                "index": {"number_of_shards": 1, "number_of_replicas": 0, "routing_partition_size": 1},
                "analysis": {}
            },
            "mappings": {
                "properties": {
                    "modified_on": {"type": "date"},
                    "modified_on_mu": {"type": "long"}
                }
            }
        }"#,
        1,
        0,
    )
    .unwrap();

    let base = BaseIndexer::new(&ctx.elastic_url, "indexer_bulk_test", definition);
    for name in indexes_with_prefix(&ctx, "indexer_bulk_test").await {
        ctx.http
            .delete(format!("{}/{}", ctx.elastic_url, name))
            .send()
            .await
            .expect("delete index");
    }

    let index = base.create_new_index().await.unwrap();

    // same row twice with an identical external version
    let action = r#"{"index":{"_id":1,"version":1510348319890662000,"version_type":"external","routing":1}}"#;
    let doc = r#"{"id":1,"org_id":1,"modified_on":"2017-11-10T21:11:59.890662Z","modified_on_mu":1510348319890662}"#;
    let batch = format!("{}\n{}\n{}\n{}\n", action, doc, action, doc);

    let counts = base.index_batch(&index, batch.as_bytes()).await.unwrap();
    assert_eq!(1, counts.created);
    assert_eq!(1, counts.conflicted);
    assert_eq!(0, counts.updated);
    assert_eq!(0, counts.deleted);

    ctx.http
        .delete(format!("{}/{}", ctx.elastic_url, index))
        .send()
        .await
        .expect("delete index");
}
