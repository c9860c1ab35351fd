//! `ApiClient` against a local axum server standing in for the stats API.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hoopsync::api::client::ApiClient;
use hoopsync::api::StatsSource;
use hoopsync::config::{ApiConfig, AppConfig};
use hoopsync::engine::{Coordinator, SyncSettings};
use hoopsync::storage::Store;
use hoopsync::types::{EntityKind, PageRequest, SyncError, SyncFilters};
use secrecy::SecretString;

use crate::mock_source::team;

#[derive(Clone, Default)]
struct Hits(Arc<AtomicUsize>);

impl Hits {
    fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/v1")
}

fn client(base_url: &str, key: Option<&str>) -> ApiClient {
    let config = ApiConfig {
        base_url: base_url.to_string(),
        timeout_secs: 5,
        max_retries: 2,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        ..ApiConfig::default()
    };
    ApiClient::new(&config, key.map(|k| SecretString::new(k.to_string()))).unwrap()
}

fn first_page(entity: EntityKind) -> PageRequest {
    PageRequest {
        entity,
        cursor: None,
        per_page: 2,
        filters: SyncFilters::default(),
    }
}

fn envelope(ids: &[i64], next: Option<i64>) -> Json<serde_json::Value> {
    Json(json!({
        "data": ids.iter().map(|id| team(*id)).collect::<Vec<_>>(),
        "meta": {"next_cursor": next, "per_page": ids.len()}
    }))
}

#[tokio::test]
async fn test_rate_limited_then_served() {
    let hits = Hits::default();
    let router = Router::new()
        .route(
            "/v1/teams",
            get(|State(hits): State<Hits>| async move {
                if hits.next() == 0 {
                    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")], "slow down")
                        .into_response()
                } else {
                    envelope(&[1, 2], None).into_response()
                }
            }),
        )
        .with_state(hits.clone());
    let base = serve(router).await;

    let page = client(&base, None)
        .fetch_page(&first_page(EntityKind::Teams))
        .await
        .unwrap();

    assert_eq!(page.payloads.len(), 2);
    assert_eq!(page.next_cursor, None);
    assert_eq!(hits.count(), 2);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let hits = Hits::default();
    let router = Router::new()
        .route(
            "/v1/teams",
            get(|State(hits): State<Hits>| async move {
                hits.next();
                (StatusCode::SERVICE_UNAVAILABLE, "down for maintenance")
            }),
        )
        .with_state(hits.clone());
    let base = serve(router).await;

    let err = client(&base, None)
        .fetch_page(&first_page(EntityKind::Teams))
        .await
        .unwrap_err();

    match err {
        SyncError::FetchExhausted {
            entity,
            cursor,
            attempts,
            last_error,
        } => {
            assert_eq!(entity, EntityKind::Teams);
            assert_eq!(cursor, None);
            assert_eq!(attempts, 3);
            assert!(last_error.contains("503"), "{last_error}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hits.count(), 3);
}

#[tokio::test]
async fn test_client_error_rejected_without_retry() {
    let hits = Hits::default();
    let router = Router::new()
        .route(
            "/v1/players",
            get(|State(hits): State<Hits>| async move {
                hits.next();
                (StatusCode::UNAUTHORIZED, "bad key")
            }),
        )
        .with_state(hits.clone());
    let base = serve(router).await;

    let err = client(&base, Some("wrong"))
        .fetch_page(&first_page(EntityKind::Players))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::FetchRejected { ref reason, .. } if reason.contains("401")));
    assert!(!err.is_resumable());
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn test_malformed_envelope_rejected() {
    let hits = Hits::default();
    let router = Router::new()
        .route(
            "/v1/teams",
            get(|State(hits): State<Hits>| async move {
                hits.next();
                Json(json!({"results": []}))
            }),
        )
        .with_state(hits.clone());
    let base = serve(router).await;

    let err = client(&base, None)
        .fetch_page(&first_page(EntityKind::Teams))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SyncError::FetchRejected { ref reason, .. } if reason.contains("envelope")
    ));
    assert_eq!(hits.count(), 1);
}

#[tokio::test]
async fn test_sends_key_cursor_and_filters() {
    let seen: Arc<Mutex<Vec<(Option<String>, HashMap<String, String>)>>> = Arc::default();
    let router = Router::new()
        .route(
            "/v1/games",
            get(
                |State(seen): State<Arc<Mutex<Vec<(Option<String>, HashMap<String, String>)>>>>,
                 headers: HeaderMap,
                 Query(params): Query<HashMap<String, String>>| async move {
                    let auth = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    seen.lock().unwrap().push((auth, params));
                    Json(json!({"data": [], "meta": {"next_cursor": null}}))
                },
            ),
        )
        .with_state(seen.clone());
    let base = serve(router).await;

    let request = PageRequest {
        entity: EntityKind::Games,
        cursor: Some("400".into()),
        per_page: 100,
        filters: SyncFilters {
            season: Some(2023),
            ..SyncFilters::default()
        },
    };
    client(&base, Some("secret-key"))
        .fetch_page(&request)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (auth, params) = &seen[0];
    assert_eq!(auth.as_deref(), Some("secret-key"));
    assert_eq!(params.get("per_page").map(String::as_str), Some("100"));
    assert_eq!(params.get("cursor").map(String::as_str), Some("400"));
    assert_eq!(params.get("season").map(String::as_str), Some("2023"));
}

#[tokio::test]
async fn test_full_pass_over_http() {
    let router = Router::new().route(
        "/v1/teams",
        get(|Query(params): Query<HashMap<String, String>>| async move {
            match params.get("cursor").map(String::as_str) {
                None => envelope(&[1, 2], Some(2)).into_response(),
                Some("2") => envelope(&[3, 4], Some(4)).into_response(),
                Some("4") => envelope(&[5], None).into_response(),
                Some(_) => StatusCode::BAD_REQUEST.into_response(),
            }
        }),
    );
    let base = serve(router).await;

    let mut cfg = AppConfig::default();
    cfg.api = ApiConfig {
        base_url: base.clone(),
        per_page: 2,
        max_retries: 1,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        ..ApiConfig::default()
    };
    cfg.sync.entities = vec![EntityKind::Teams];

    let store = Store::in_memory().await.unwrap();
    store.migrate().await.unwrap();
    let result = Coordinator::new(
        Arc::new(client(&base, None)),
        store.clone(),
        SyncSettings::from_config(&cfg),
    )
    .run()
    .await;

    assert!(result.is_success(), "{result}");
    let counts = &result.outcome(EntityKind::Teams).unwrap().counts;
    assert_eq!(counts.pages, 3);
    assert_eq!(counts.written, 5);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(rows, 5);
}
