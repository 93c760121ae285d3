//! Full-cycle tests: orchestrator against mock marketplace + spreadsheet
//! upstreams, with real stores on a temp database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stocksync_backend::{
    cache::TenantCache,
    config::Config,
    marketplace::wildberries::{PollPolicy, RetryPolicy},
    models::{
        FailureClass, MarketplaceKind, PartialReason, SyncStatus, SyncTrigger, Tenant,
        FLAG_PROJECTION_RETRIED,
    },
    rate_limit::RateLimiter,
    shutdown::Shutdown,
    storage::{open_database, tenant_store::NewTenant, SyncLogStore, TenantStore},
    sync::Orchestrator,
    vault::CredentialVault,
};

struct Harness {
    server: MockServer,
    tenant: Tenant,
    logs: Arc<SyncLogStore>,
    orchestrator: Orchestrator,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pipeline.db");
    let conn = open_database(db_path.to_str().unwrap()).unwrap();

    let config = Arc::new(Config {
        wb_analytics_base: server.uri(),
        wb_statistics_base: server.uri(),
        sheets_base: server.uri(),
        ..Config::default()
    });

    let vault = Arc::new(CredentialVault::new("pipeline-master-key").unwrap());
    let tenants = Arc::new(TenantStore::new(conn.clone()));
    let logs = Arc::new(SyncLogStore::new(conn));

    let tenant = tenants
        .create(NewTenant {
            name: "Acme Seller".to_string(),
            marketplace: MarketplaceKind::Wildberries,
            marketplace_credentials_enc: vault.encrypt("wb-api-token").unwrap(),
            spreadsheet_credentials_enc: vault.encrypt(r#"{"token": "sheet-token"}"#).unwrap(),
            spreadsheet_id: "sheet-1".to_string(),
            worksheet_name: "Inventory".to_string(),
            cadence_hours: 24,
        })
        .unwrap();

    let orchestrator = Orchestrator::new(
        config,
        vault,
        Arc::new(RateLimiter::new()),
        Arc::new(TenantCache::default()),
    )
    .with_projector_retry_pause(Duration::from_millis(10))
    .with_marketplace_policies(
        RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(5),
            cap: Duration::from_millis(50),
        },
        PollPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
        },
    );

    Harness {
        server,
        tenant,
        logs,
        orchestrator,
        _dir: dir,
    }
}

/// S1-shaped upstream data: one product, two FBO warehouses, three orders.
async fn mount_marketplace(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v2/stocks-report/products/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "items": [
                { "nmID": 100, "vendorCode": "SKU-100", "title": "Mug",
                  "metrics": { "stockCount": 50, "ordersCount": 3 } }
            ]}
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/warehouse_remains"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "taskId": "t1" } })),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/warehouse_remains/tasks/t1/download"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "nmId": 100, "vendorCode": "SKU-100", "warehouses": [
                { "warehouseName": "A", "quantity": 30 },
                { "warehouseName": "B", "quantity": 20 }
            ]}
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/supplier/orders"))
        .and(query_param("flag", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "nmId": 100, "warehouseName": "A", "srid": "x" },
            { "nmId": 100, "warehouseName": "A", "srid": "y" },
            { "nmId": 100, "warehouseName": "B", "srid": "z" }
        ])))
        .mount(server)
        .await;
}

/// Worksheet exists with headers already in the expected layout, so a clean
/// scheduled cycle is: meta, header read, clear, one data write.
async fn mount_sheets(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1"))
        .and(query_param("fields", "sheets.properties"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sheets": [ { "properties": { "sheetId": 11, "title": "Inventory" } } ]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1/values:batchGet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valueRanges": [ {
                "range": "'Inventory'!A1:L2",
                "values": [
                    ["Product","","","","","","A","","","B","",""],
                    ["seller article","nmId","name","totalOrders","totalStock","turnover",
                     "name","orders","stock","name","orders","stock"]
                ]
            } ]
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r".*:clear$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

async fn mount_sheets_write_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v4/spreadsheets/sheet-1/values:batchUpdate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

async fn batch_update_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| {
            r.method == wiremock::http::Method::POST
                && r.url.path().ends_with("/values:batchUpdate")
        })
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn successful_cycle_writes_one_log_and_projects_merged_rows() {
    let h = harness().await;
    mount_marketplace(&h.server).await;
    mount_sheets(&h.server).await;
    mount_sheets_write_ok(&h.server).await;

    let outcome = h
        .orchestrator
        .run_sync(
            &h.tenant,
            SyncTrigger::Scheduled,
            Instant::now() + Duration::from_secs(60),
            &Shutdown::never(),
        )
        .await;

    assert_eq!(outcome.log.status, SyncStatus::Success);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.log.products_processed, 1);
    assert_eq!(outcome.log.orders_fetched_raw, 3);
    assert_eq!(outcome.log.orders_after_filter, 3);
    assert!(outcome.log.partial_reason.is_none());

    // Exactly one SyncLog per terminated job.
    h.logs.append(&outcome.log).unwrap();
    assert_eq!(h.logs.count_for_tenant(&h.tenant.id).unwrap(), 1);

    // The single data write carries the merged S1 row.
    let bodies = batch_update_bodies(&h.server).await;
    assert_eq!(bodies.len(), 1, "headers matched; only the data write expected");
    let row = &bodies[0]["data"][0]["values"][0];
    assert_eq!(row[0], json!("SKU-100"));
    assert_eq!(row[1], json!(100));
    assert_eq!(row[3], json!(3)); // totalOrders
    assert_eq!(row[4], json!(50)); // totalStock
    assert_eq!(row[6], json!("A"));
    assert_eq!(row[7], json!(2));
    assert_eq!(row[8], json!(30));
    assert_eq!(row[9], json!("B"));
    assert_eq!(row[10], json!(1));
    assert_eq!(row[11], json!(20));
}

#[tokio::test]
async fn quota_exhausted_write_retries_once_and_flags_it() {
    let h = harness().await;
    mount_marketplace(&h.server).await;
    mount_sheets(&h.server).await;

    // First write attempt hits the quota wall; the retry lands.
    Mock::given(method("POST"))
        .and(path("/v4/spreadsheets/sheet-1/values:batchUpdate"))
        .respond_with(ResponseTemplate::new(429).set_body_string("RESOURCE_EXHAUSTED"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&h.server)
        .await;
    mount_sheets_write_ok(&h.server).await;

    let outcome = h
        .orchestrator
        .run_sync(
            &h.tenant,
            SyncTrigger::Scheduled,
            Instant::now() + Duration::from_secs(60),
            &Shutdown::never(),
        )
        .await;

    assert_eq!(outcome.log.status, SyncStatus::Success);
    assert!(outcome
        .log
        .flags
        .contains(&FLAG_PROJECTION_RETRIED.to_string()));
}

#[tokio::test]
async fn breakdown_failure_degrades_to_partial() {
    let h = harness().await;
    mount_sheets(&h.server).await;
    mount_sheets_write_ok(&h.server).await;

    Mock::given(method("POST"))
        .and(path("/api/v2/stocks-report/products/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "items": [
                { "nmID": 100, "vendorCode": "SKU-100", "title": "Mug",
                  "metrics": { "stockCount": 50, "ordersCount": 0 } }
            ]}
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/warehouse_remains"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/supplier/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .run_sync(
            &h.tenant,
            SyncTrigger::Scheduled,
            Instant::now() + Duration::from_secs(60),
            &Shutdown::never(),
        )
        .await;

    // Totals still correct and projected; only warehouse detail was lost.
    assert_eq!(outcome.log.status, SyncStatus::Partial);
    assert_eq!(outcome.log.partial_reason, Some(PartialReason::NoBreakdown));
    assert_eq!(outcome.log.products_processed, 1);

    // The stored headers cover warehouses A/B, but this cycle's layout only
    // has the residual column group, so the first batch update rewrites the
    // headers; the data write is the one anchored at A3.
    let bodies = batch_update_bodies(&h.server).await;
    let data_body = bodies
        .iter()
        .find(|b| b["data"][0]["range"] == json!("'Inventory'!A3"))
        .expect("data write body");
    let row = &data_body["data"][0]["values"][0];
    // Everything lands on the seller-premises residual row.
    assert_eq!(row[4], json!(50));
    assert_eq!(row[6], json!("МП/FBS (on seller's premises)"));
    assert_eq!(row[8], json!(50));
}

#[tokio::test]
async fn aggregates_failure_is_terminal_marketplace_failure() {
    let h = harness().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/stocks-report/products/products"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/warehouse_remains"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/supplier/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&h.server)
        .await;

    let outcome = h
        .orchestrator
        .run_sync(
            &h.tenant,
            SyncTrigger::Scheduled,
            Instant::now() + Duration::from_secs(60),
            &Shutdown::never(),
        )
        .await;

    assert_eq!(outcome.log.status, SyncStatus::Failed);
    assert_eq!(outcome.log.error_kind, Some(FailureClass::Marketplace));
    // Transient upstream exhaustion is retriable by the scheduler.
    assert!(outcome.error.unwrap().kind.is_retriable());
}

#[tokio::test]
async fn corrupt_credentials_fail_before_any_network_io() {
    let h = harness().await;
    let mut tenant = h.tenant.clone();
    tenant.marketplace_credentials_enc = "not-a-valid-blob".to_string();

    let outcome = h
        .orchestrator
        .run_sync(
            &tenant,
            SyncTrigger::Scheduled,
            Instant::now() + Duration::from_secs(60),
            &Shutdown::never(),
        )
        .await;

    assert_eq!(outcome.log.status, SyncStatus::Failed);
    assert_eq!(outcome.log.error_kind, Some(FailureClass::Credential));
    assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_sync_upserts_in_place_without_clearing() {
    let h = harness().await;

    // Two products, both fully covered by one FBO warehouse.
    Mock::given(method("POST"))
        .and(path("/api/v2/stocks-report/products/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "items": [
                { "nmID": 100, "vendorCode": "SKU-100", "title": "Mug",
                  "metrics": { "stockCount": 50, "ordersCount": 0 } },
                { "nmID": 200, "vendorCode": "SKU-200", "title": "Bowl",
                  "metrics": { "stockCount": 10, "ordersCount": 0 } }
            ]}
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/warehouse_remains"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "taskId": "t2" } })),
        )
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/warehouse_remains/tasks/t2/download"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "nmId": 100, "vendorCode": "SKU-100",
              "warehouses": [ { "warehouseName": "A", "quantity": 50 } ] },
            { "nmId": 200, "vendorCode": "SKU-200",
              "warehouses": [ { "warehouseName": "A", "quantity": 10 } ] }
        ])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/supplier/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&h.server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1"))
        .and(query_param("fields", "sheets.properties"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sheets": [ { "properties": { "sheetId": 11, "title": "Inventory" } } ]
        })))
        .mount(&h.server)
        .await;
    // Header read and the existence read resolve by range.
    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1/values:batchGet"))
        .and(query_param("ranges", "'Inventory'!1:2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valueRanges": [ {
                "range": "'Inventory'!A1:I2",
                "values": [
                    ["Product","","","","","","A","",""],
                    ["seller article","nmId","name","totalOrders","totalStock","turnover",
                     "name","orders","stock"]
                ]
            } ]
        })))
        .mount(&h.server)
        .await;
    // The sheet already holds SKU-100 and a row for an article this cycle
    // no longer carries; the manual path must leave the stale row alone.
    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1/values:batchGet"))
        .and(query_param("ranges", "'Inventory'!A3:A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valueRanges": [ {
                "range": "'Inventory'!A3:A4",
                "values": [ ["SKU-100"], ["SKU-OLD"] ]
            } ]
        })))
        .mount(&h.server)
        .await;
    mount_sheets_write_ok(&h.server).await;

    let outcome = h
        .orchestrator
        .run_sync(
            &h.tenant,
            SyncTrigger::Manual,
            Instant::now() + Duration::from_secs(60),
            &Shutdown::never(),
        )
        .await;

    assert_eq!(outcome.log.status, SyncStatus::Success);
    assert_eq!(outcome.log.products_processed, 2);

    // No destructive clear on a manual sync.
    let requests = h.server.received_requests().await.unwrap();
    assert!(
        !requests.iter().any(|r| r.url.path().ends_with(":clear")),
        "manual sync must not clear data rows"
    );

    // SKU-100 updates its existing row; SKU-200 appends after the last
    // used row (SKU-OLD at row 4 stays).
    let bodies = batch_update_bodies(&h.server).await;
    assert_eq!(bodies.len(), 1);
    let data = bodies[0]["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["range"], json!("'Inventory'!A3"));
    assert_eq!(data[0]["values"][0][0], json!("SKU-100"));
    assert_eq!(data[1]["range"], json!("'Inventory'!A5"));
    assert_eq!(data[1]["values"][0][0], json!("SKU-200"));
}

#[tokio::test]
async fn rerun_with_unchanged_upstream_is_byte_identical() {
    let h = harness().await;
    mount_marketplace(&h.server).await;
    mount_sheets(&h.server).await;
    mount_sheets_write_ok(&h.server).await;

    for _ in 0..2 {
        let outcome = h
            .orchestrator
            .run_sync(
                &h.tenant,
                SyncTrigger::Scheduled,
                Instant::now() + Duration::from_secs(60),
                &Shutdown::never(),
            )
            .await;
        assert_eq!(outcome.log.status, SyncStatus::Success);
        h.logs.append(&outcome.log).unwrap();
    }

    assert_eq!(h.logs.count_for_tenant(&h.tenant.id).unwrap(), 2);

    let bodies = batch_update_bodies(&h.server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(
        bodies[0], bodies[1],
        "identical upstream data must produce identical writes"
    );
}
