//! Endpoint failover of the Esplora client against local mock servers

use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;

use resolver::chains::esplora::EsploraClient;
use resolver::chains::failover::EndpointSet;
use resolver::chains::UtxoChainClient;

const TIP_HEIGHT: u32 = 812_345;

/// Serve `app` on an ephemeral port and return its base URL
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn healthy() -> Router {
    Router::new().route(
        "/blocks/tip/height",
        get(|| async { TIP_HEIGHT.to_string() }),
    )
}

fn failing() -> Router {
    Router::new().route(
        "/blocks/tip/height",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
    )
}

/// URL of a port nothing listens on
async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_switches_after_connection_failure() {
    let backup = serve(healthy()).await;
    let urls = vec![dead_url().await, backup.clone()];
    let endpoints = Arc::new(EndpointSet::new("esplora", urls, 1).unwrap());
    let client = EsploraClient::new(endpoints.clone()).unwrap();

    assert!(client.get_height().await.is_err());
    assert_eq!(endpoints.switches(), 1);
    assert_eq!(endpoints.current(), backup);

    assert_eq!(client.get_height().await.unwrap(), TIP_HEIGHT);
    assert_eq!(endpoints.switches(), 1);
}

#[tokio::test]
async fn test_server_errors_count_towards_threshold() {
    let primary = serve(failing()).await;
    let backup = serve(healthy()).await;
    let endpoints =
        Arc::new(EndpointSet::new("esplora", vec![primary.clone(), backup.clone()], 2).unwrap());
    let client = EsploraClient::new(endpoints.clone()).unwrap();

    assert!(client.get_height().await.is_err());
    assert_eq!(endpoints.current(), primary);
    assert!(client.get_height().await.is_err());
    assert_eq!(endpoints.current(), backup);

    assert_eq!(client.get_height().await.unwrap(), TIP_HEIGHT);
    assert_eq!(endpoints.switches(), 1);
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let primary = serve(healthy()).await;
    let backup = serve(healthy()).await;
    let endpoints =
        Arc::new(EndpointSet::new("esplora", vec![primary.clone(), backup], 2).unwrap());
    let client = EsploraClient::new(endpoints.clone()).unwrap();

    endpoints.record_failure();
    assert_eq!(client.get_height().await.unwrap(), TIP_HEIGHT);
    endpoints.record_failure();
    assert_eq!(endpoints.current(), primary);
    assert_eq!(endpoints.switches(), 0);
}
