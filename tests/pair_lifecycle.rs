use std::sync::Arc;

use market_collector::{DataCollector, ExchangeClient, FileWriterPool, Pair, PairManager, PairStatus, Repository};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn catalogue_response(symbols: &[(&str, &str)]) -> serde_json::Value {
    serde_json::json!({
        "symbols": symbols
            .iter()
            .map(|(b, q)| serde_json::json!({"baseAsset": b, "quoteAsset": q}))
            .collect::<Vec<_>>()
    })
}

#[tokio::test]
async fn pair_is_archived_then_restored_across_catalogue_changes() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalogue_response(&[
            ("BTC", "USDT"),
            ("ETH", "USDT"),
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let repository = Arc::new(Repository::open(dir.path().join("currency_pairs.json")).unwrap());
    let file_pool = Arc::new(FileWriterPool::new(dir.path()));
    let collector = DataCollector::new(Pair::new("sol", "usdt"), file_pool);
    let manager = PairManager::new(
        repository.clone(),
        collector,
        ExchangeClient::new(server.uri()),
        60,
    );

    manager.refresh().await;
    let after_first = repository.find(&Default::default());
    assert_eq!(after_first.len(), 2);
    assert!(after_first.iter().all(|p| p.status == PairStatus::Created));

    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(catalogue_response(&[("BTC", "USDT")])),
        )
        .mount(&server)
        .await;

    manager.refresh().await;
    let eth = repository
        .find(&Default::default())
        .into_iter()
        .find(|p| p.symbol() == "ethusdt")
        .unwrap();
    assert_eq!(eth.status, PairStatus::Archived);

    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalogue_response(&[
            ("BTC", "USDT"),
            ("ETH", "USDT"),
        ])))
        .mount(&server)
        .await;

    manager.refresh().await;
    let eth = repository
        .find(&Default::default())
        .into_iter()
        .find(|p| p.symbol() == "ethusdt")
        .unwrap();
    assert_eq!(eth.status, PairStatus::Restored);
}

#[tokio::test]
async fn http_start_then_stop_round_trips_status() {
    let dir = tempfile::tempdir().unwrap();
    let repository = Arc::new(Repository::open(dir.path().join("currency_pairs.json")).unwrap());
    let file_pool = Arc::new(FileWriterPool::new(dir.path()));
    let collector = DataCollector::new(Pair::new("btc", "usdt"), file_pool);
    let pair_manager = PairManager::new(
        repository.clone(),
        collector.clone(),
        ExchangeClient::default(),
        60,
    );

    let pair = repository.create(Pair::new("eth", "usdt")).unwrap();

    let app = market_collector::http::router(market_collector::http::AppState {
        repository: repository.clone(),
        collector,
        pair_manager,
    });

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/currency_pairs/{}/start", pair.uuid))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(repository.read(pair.uuid).unwrap().status, PairStatus::Active);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/currency_pairs/{}/stop", pair.uuid))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(repository.read(pair.uuid).unwrap().status, PairStatus::Stopped);
}
