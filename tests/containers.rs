//! End-to-end checks against real containers.
//!
//! Run with `cargo test --test containers -- --ignored` on a machine with a
//! Docker daemon.

use std::time::Duration;

use mongodb::bson::{doc, Document};
use serde_json::json;
use tempfile::TempDir;

use testdeps::config::{ResourceSettings, Settings};
use testdeps::connector::{DocumentConnector, RelationalConnector, SearchConnector};
use testdeps::provisioner::DockerProvisioner;
use testdeps::{Broker, BrokerState, InitArtifact, ResourceKind, TenantScope};

fn settings() -> Settings {
    Settings {
        reuse_across_runs: false,
        startup_timeout_secs: 120,
        ..Default::default()
    }
}

fn resource(kind: ResourceKind) -> ResourceSettings {
    let mut resource = ResourceSettings::defaults(kind);
    resource.container_name = format!("testdeps-it-{}-{}", kind.key(), std::process::id());
    resource
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_relational_rows_are_scoped() {
    let dir = TempDir::new().unwrap();
    let schema = dir.path().join("schema.sql");
    std::fs::write(
        &schema,
        "CREATE TABLE products (id TEXT NOT NULL, tenant_id TEXT NOT NULL, \
         PRIMARY KEY (id, tenant_id));",
    )
    .unwrap();
    let artifacts = vec![InitArtifact::from_path(&schema)];

    let broker = Broker::new(
        RelationalConnector::new(Duration::from_secs(5)),
        settings(),
        resource(ResourceKind::Relational),
    );

    for _ in 0..2 {
        let pool = broker.acquire(&artifacts).await.unwrap();
        let scope = TenantScope::mint();
        sqlx::query("INSERT INTO products (id, tenant_id) VALUES ($1, $2)")
            .bind("id-1")
            .bind(scope.as_str())
            .execute(&pool)
            .await
            .unwrap();

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM products WHERE tenant_id = $1")
                .bind(scope.as_str())
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows, vec![("id-1".to_string(),)]);
    }

    broker.clean_data().await.unwrap();
    let pool = broker.connection().await.unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);

    broker.release().await;
    broker.release().await;
    assert_eq!(broker.state().await, BrokerState::NotStarted);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_search_index_from_artifact() {
    let dir = TempDir::new().unwrap();
    let mapping = dir.path().join("products.json");
    std::fs::write(
        &mapping,
        r#"{"mappings":{"properties":{"tenant_id":{"type":"keyword"},"name":{"type":"text"}}}}"#,
    )
    .unwrap();

    let broker = Broker::new(
        SearchConnector::new(Duration::from_secs(5)),
        settings(),
        resource(ResourceKind::SearchEngine),
    );
    let client = broker
        .acquire(&[InitArtifact::from_path(&mapping)])
        .await
        .unwrap();
    assert!(client.list_indices().await.unwrap().contains(&"products".to_string()));

    let mine = TenantScope::mint();
    let theirs = TenantScope::mint();
    for scope in [&mine, &theirs] {
        client
            .index_document(
                "products",
                &scope.namespace("id-1"),
                &json!({ "name": "lamp", "tenant_id": scope.as_str() }),
            )
            .await
            .unwrap();
    }
    broker.refresh().await.unwrap();

    let result = client
        .search("products", &json!({ "query": mine.search_filter() }))
        .await
        .unwrap();
    assert_eq!(result.total_hits, 1);
    assert_eq!(result.hits[0]["tenant_id"], mine.as_str());
    assert!(client
        .get_document("products", &theirs.namespace("id-1"))
        .await
        .unwrap()
        .is_some());

    broker.release().await;
    assert_eq!(broker.provision_count(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_document_seed_survives_reattach() {
    let dir = TempDir::new().unwrap();
    let seed = dir.path().join("products.json");
    std::fs::write(&seed, r#"[{"sku": "lamp"}, {"sku": "desk"}]"#).unwrap();
    let artifacts = vec![InitArtifact::from_path(&seed)];

    let settings = Settings {
        reuse_across_runs: true,
        ..settings()
    };
    let resource = resource(ResourceKind::DocumentStore);
    let new_broker = || {
        Broker::new(
            DocumentConnector::new(resource.databases.clone(), Duration::from_secs(5)),
            settings.clone(),
            resource.clone(),
        )
    };

    // First process creates and seeds the instance.
    let first = new_broker();
    first.acquire(&artifacts).await.unwrap();
    first.release().await;
    first.shutdown().await;

    // Next process reattaches; the seed is visible and not inserted twice.
    let second = new_broker();
    let handle = second.acquire(&artifacts).await.unwrap();
    let count = handle
        .database()
        .collection::<Document>("products")
        .count_documents(doc! {})
        .await
        .unwrap();
    assert_eq!(count, 2);

    second.release().await;
    second.shutdown().await;
    DockerProvisioner::new(settings, resource)
        .unwrap()
        .remove()
        .await
        .unwrap();
}
