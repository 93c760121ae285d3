//! HTTP-level tests for the Wildberries client: retry/backoff behavior,
//! terminal errors, the async warehouse-remains task, and cycle caching.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stocksync_backend::{
    cache::TenantCache,
    config::Config,
    error::ErrorKind,
    marketplace::{
        wildberries::{PollPolicy, RetryPolicy, WildberriesClient},
        types::AggregationWindow,
        Marketplace,
    },
    rate_limit::RateLimiter,
    shutdown::Shutdown,
};

const AGGREGATES_PATH: &str = "/api/v2/stocks-report/products/products";
const REMAINS_PATH: &str = "/api/v1/warehouse_remains";
const ORDERS_PATH: &str = "/api/v1/supplier/orders";

fn test_config(base: &str) -> Config {
    Config {
        wb_analytics_base: base.to_string(),
        wb_statistics_base: base.to_string(),
        ..Config::default()
    }
}

fn fast_client(server: &MockServer) -> WildberriesClient {
    WildberriesClient::new(
        &test_config(&server.uri()),
        "test-token".to_string(),
        "tenant-1".to_string(),
        Arc::new(RateLimiter::new()),
        Arc::new(TenantCache::default()),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy {
        attempts: 3,
        base: Duration::from_millis(5),
        cap: Duration::from_millis(50),
    })
    .with_poll_policy(PollPolicy {
        interval: Duration::from_millis(10),
        timeout: Duration::from_millis(500),
    })
}

fn aggregates_body(items: serde_json::Value) -> serde_json::Value {
    json!({ "data": { "items": items } })
}

#[tokio::test]
async fn aggregates_retry_on_server_error_then_succeed() {
    let server = MockServer::start().await;

    // Two 500s, then success: the client must absorb both and return Ok.
    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(aggregates_body(json!([
            { "nmID": 100, "vendorCode": "SKU-100", "title": "Mug",
              "metrics": { "stockCount": 50, "ordersCount": 3 } }
        ]))))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let items = client
        .fetch_product_aggregates(AggregationWindow::last_days(30))
        .await
        .unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].nm_id, 100);
    assert_eq!(items[0].metrics.stock_count, 50);
}

#[tokio::test]
async fn aggregates_honor_retry_after_on_429() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .respond_with(
            ResponseTemplate::new(429).insert_header("Retry-After", "0"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(aggregates_body(json!([]))))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let items = client
        .fetch_product_aggregates(AggregationWindow::last_days(30))
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn aggregates_client_error_is_terminal() {
    let server = MockServer::start().await;

    // A 400 must surface immediately: exactly one request, no retries.
    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad window"))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let err = client
        .fetch_product_aggregates(AggregationWindow::last_days(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MarketplaceInvalid);
    assert!(err.message.contains("bad window"));
}

#[tokio::test]
async fn aggregates_paginate_until_short_page() {
    let server = MockServer::start().await;

    let full_page: Vec<serde_json::Value> = (0..1000)
        .map(|i| {
            json!({ "nmID": i, "vendorCode": format!("SKU-{i}"),
                    "metrics": { "stockCount": 1, "ordersCount": 0 } })
        })
        .collect();

    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .and(body_partial_json(json!({ "offset": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(aggregates_body(json!(full_page))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(AGGREGATES_PATH))
        .and(body_partial_json(json!({ "offset": 1000 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(aggregates_body(json!([
            { "nmID": 1000, "vendorCode": "SKU-1000",
              "metrics": { "stockCount": 7, "ordersCount": 0 } }
        ]))))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let items = client
        .fetch_product_aggregates(AggregationWindow::last_days(30))
        .await
        .unwrap();
    assert_eq!(items.len(), 1001);
    assert_eq!(items[1000].metrics.stock_count, 7);
}

#[tokio::test]
async fn warehouse_remains_polls_task_until_ready() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(REMAINS_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "taskId": "task-7" } })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let download = format!("{REMAINS_PATH}/tasks/task-7/download");
    // Not ready twice, then the result set.
    Mock::given(method("GET"))
        .and(path(download.clone()))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(download))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "nmId": 100, "vendorCode": "SKU-100",
              "warehouses": [ { "warehouseName": "Коледино", "quantity": 30 } ] }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let remains = client
        .fetch_warehouse_breakdown(&Shutdown::never())
        .await
        .unwrap();
    assert_eq!(remains.len(), 1);
    assert_eq!(remains[0].warehouses[0].name, "Коледино");
    assert_eq!(remains[0].warehouses[0].quantity, 30);
}

#[tokio::test]
async fn warehouse_remains_times_out_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(REMAINS_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "taskId": "slow" } })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{REMAINS_PATH}/tasks/slow/download")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let err = client
        .fetch_warehouse_breakdown(&Shutdown::never())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MarketplaceTransient);
    assert!(err.message.contains("slow"));
}

#[tokio::test]
async fn orders_fetch_passes_window_parameters() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(ORDERS_PATH))
        .and(query_param("flag", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "nmId": 7, "warehouseName": "A", "srid": "s1", "isCancel": false },
            { "nmId": 7, "warehouseName": "A", "srid": "s1", "isCancel": false },
            { "nmId": 7, "warehouseName": "B", "srid": "s2", "isCancel": true }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let orders = client.fetch_orders(chrono::Utc::now()).await.unwrap();
    // The client returns raw records; filtering is the merger's job.
    assert_eq!(orders.len(), 3);
    assert!(orders[2].is_cancel);
}

#[tokio::test]
async fn orders_are_memoized_within_a_cycle() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(ORDERS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "nmId": 1, "warehouseName": "A", "srid": "s1" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = fast_client(&server);
    let date_from = chrono::Utc::now();
    let first = client.fetch_orders(date_from).await.unwrap();
    // Same window again: served from cache, the mock's expect(1) verifies
    // no second request went out.
    let second = client.fetch_orders(date_from).await.unwrap();
    assert_eq!(first.len(), second.len());
}
