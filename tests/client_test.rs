//! HTTP client behaviour against a mock server

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ranksync::api::client::HttpLeaderboardClient;
use ranksync::api::{Dataset, LeaderboardApi, PageRequest};
use ranksync::error::Error;
use ranksync::models::{Record, WorkUnit};
use ranksync::ratelimit::retry::RetryPolicy;

fn client(server: &MockServer) -> HttpLeaderboardClient {
    HttpLeaderboardClient::with_base_url(&server.uri(), 2)
        .unwrap()
        .with_retry_policy(RetryPolicy::with_delays(3, 1, 5))
}

fn rankings_request(page: u32) -> PageRequest {
    PageRequest {
        dataset: Dataset::Rankings,
        unit: WorkUnit::Leaderboard {
            season: "s1".into(),
            region: "eu".into(),
            dungeon: 7,
        },
        page,
        page_size: 2,
    }
}

fn ranking_json(player: &str, score: f64) -> serde_json::Value {
    json!({
        "season": "s1",
        "region": "eu",
        "dungeon": 7,
        "player": player,
        "realm": "draenor",
        "class_spec": "mage-frost",
        "keystone_level": 20,
        "score": score,
        "completed_at": "2024-05-01T12:00:00Z"
    })
}

#[tokio::test]
async fn test_fetch_page_decodes_records_and_quota() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rankings"))
        .and(query_param("region", "eu"))
        .and(query_param("page", "2"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ranking_json("Alys", 310.5), ranking_json("Bren", 298.0)],
            "rateLimit": {
                "limitPerHour": 3600,
                "pointsSpentThisHour": 100,
                "pointsResetIn": 1200
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server).fetch_page(&rankings_request(2)).await.unwrap();

    assert_eq!(page.records.len(), 2);
    match &page.records[0] {
        Record::Ranking(r) => {
            assert_eq!(r.player, "Alys");
            assert_eq!(r.score, 310.5);
            assert!(r.report_code.is_none());
        }
        other => panic!("unexpected record {other:?}"),
    }

    let info = page.rate_limit.unwrap();
    assert_eq!(info.remaining_points, 3500.0);
    assert_eq!(info.reset_in_secs, 1200);
    assert!(!info.is_exhausted());
}

#[tokio::test]
async fn test_exhausted_quota_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rankings"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": "too many points spent",
            "rateLimit": {
                "limitPerHour": 3600,
                "pointsSpentThisHour": 3599.5,
                "pointsResetIn": 90
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch_page(&rankings_request(1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::QuotaExceeded { .. }));
    assert!(err.is_rate_limited());
    assert_eq!(err.rate_limit_info().unwrap().reset_in_secs, 90);
}

#[tokio::test]
async fn test_rate_limit_without_body_stays_rate_limit() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch_page(&rankings_request(1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RateLimit { info: None, .. }));
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;

    // First request fails, later ones fall through to the success mock
    Mock::given(method("GET"))
        .and(path("/rankings"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rankings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ranking_json("Cato", 250.0)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server).fetch_page(&rankings_request(1)).await.unwrap();

    assert_eq!(page.records.len(), 1);
    assert!(page.rate_limit.is_none());
}

#[tokio::test]
async fn test_client_error_is_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "unknown dungeon" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch_page(&rankings_request(1))
        .await
        .unwrap_err();

    match err {
        Error::Api {
            status,
            message,
            retryable,
        } => {
            assert_eq!(status, 400);
            assert_eq!(message, "unknown dungeon");
            assert!(!retryable);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_spec_units_query_by_spec() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/builds"))
        .and(query_param("spec", "rogue-sub"))
        .and(query_param("dungeon", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let request = PageRequest {
        dataset: Dataset::Builds,
        unit: WorkUnit::SpecDungeon {
            spec: "rogue-sub".into(),
            dungeon: 3,
        },
        page: 1,
        page_size: 100,
    };

    let page = client(&server).fetch_page(&request).await.unwrap();
    assert!(page.records.is_empty());
}
