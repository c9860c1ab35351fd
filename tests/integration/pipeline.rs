//! Full passes over an in-memory store driven by [`MockSource`].

use serde_json::Value;
use std::sync::Arc;

use hoopsync::config::AppConfig;
use hoopsync::engine::{Coordinator, SyncSettings};
use hoopsync::storage::Store;
use hoopsync::types::{EntityKind, EntityStatus, FailureKind, Phase, RunResult};

use crate::mock_source::{
    box_score, game, player, season_average, team, team_pages, Failure, MockSource,
};

type TeamRow = (i64, String, String, Option<String>, String, String, String);

async fn store() -> Store {
    let store = Store::in_memory().await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn settings(entities: &[EntityKind], batch_size: usize) -> SyncSettings {
    let mut cfg = AppConfig::default();
    cfg.sync.entities = entities.to_vec();
    cfg.store.batch_size = batch_size;
    cfg.api.per_page = 50;
    SyncSettings::from_config(&cfg)
}

async fn pass(source: &Arc<MockSource>, store: &Store, settings: SyncSettings) -> RunResult {
    Coordinator::new(source.clone(), store.clone(), settings)
        .run()
        .await
}

async fn team_rows(store: &Store) -> Vec<TeamRow> {
    sqlx::query_as(
        "SELECT team_id, abbreviation, name, city, payload, first_seen_at, updated_at
         FROM teams ORDER BY team_id",
    )
    .fetch_all(store.pool())
    .await
    .unwrap()
}

/// Every row of every entity table, as text.
async fn dump(store: &Store) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    for (table, _) in store.table_counts().await.unwrap() {
        let rows: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT payload || '|' || first_seen_at || '|' || updated_at FROM {table} ORDER BY 1"
        ))
        .fetch_all(store.pool())
        .await
        .unwrap();
        out.push((table.to_string(), rows));
    }
    out
}

async fn count(store: &Store, table: &str) -> i64 {
    store
        .table_counts()
        .await
        .unwrap()
        .into_iter()
        .find(|(t, _)| *t == table)
        .map(|(_, c)| c)
        .unwrap()
}

/// Upstream data for every entity type.
fn league() -> MockSource {
    MockSource::new()
        .with_pages(EntityKind::Teams, team_pages(1, 6))
        .with_pages(
            EntityKind::Players,
            vec![
                (1..=4).map(|id| player(id, 1)).collect(),
                (5..=8).map(|id| player(id, 2)).collect(),
            ],
        )
        .with_pages(
            EntityKind::Games,
            vec![vec![game(100, 1, 2), game(101, 3, 4)]],
        )
        .with_pages(
            EntityKind::SeasonAverages,
            vec![vec![
                season_average(1, "2023-24"),
                season_average(1, "2024-25"),
                season_average(5, "2024"),
            ]],
        )
        .with_pages(
            EntityKind::BoxScores,
            vec![
                vec![box_score(100, (1, &[1, 2, 3]), (2, &[5, 6]))],
                vec![box_score(101, (3, &[]), (4, &[7]))],
            ],
        )
}

#[tokio::test]
async fn test_three_pages_of_fifty_teams() {
    let source = Arc::new(MockSource::new().with_pages(EntityKind::Teams, team_pages(3, 50)));
    let store = store().await;

    let result = pass(&source, &store, settings(&[EntityKind::Teams], 100)).await;

    assert!(result.is_success(), "{result}");
    let rows = team_rows(&store).await;
    assert_eq!(rows.len(), 150);
    for row in &rows {
        let stored: Value = serde_json::from_str(&row.4).unwrap();
        assert_eq!(stored, team(row.0));
    }
    let counts = &result.outcome(EntityKind::Teams).unwrap().counts;
    assert_eq!(counts.pages, 3);
    assert_eq!(counts.fetched, 150);
    assert_eq!(counts.written, 150);
}

#[tokio::test]
async fn test_rename_touches_exactly_one_row() {
    let source = Arc::new(MockSource::new().with_pages(EntityKind::Teams, team_pages(3, 50)));
    let store = store().await;
    pass(&source, &store, settings(&[EntityKind::Teams], 100)).await;
    let before = team_rows(&store).await;

    let mut pages = team_pages(3, 50);
    pages[1][7]["name"] = Value::from("Renamed");
    source.set_pages(EntityKind::Teams, pages);

    let result = pass(&source, &store, settings(&[EntityKind::Teams], 100)).await;
    assert!(result.is_success());
    let counts = &result.outcome(EntityKind::Teams).unwrap().counts;
    assert_eq!(counts.written, 1);
    assert_eq!(counts.unchanged, 149);

    let after = team_rows(&store).await;
    assert_eq!(after.len(), 150);
    let changed: Vec<(&TeamRow, &TeamRow)> = before
        .iter()
        .zip(after.iter())
        .filter(|(b, a)| b != a)
        .collect();
    assert_eq!(changed.len(), 1);

    let (old, new) = changed[0];
    assert_eq!(new.0, 58);
    assert_eq!(new.2, "Renamed");
    assert_ne!(old.4, new.4);
    assert_eq!(old.5, new.5, "first_seen_at never changes");
    assert_ne!(old.6, new.6);
}

#[tokio::test]
async fn test_second_pass_leaves_store_identical() {
    let source = Arc::new(league());
    let store = store().await;

    let first = pass(&source, &store, settings(EntityKind::ALL, 2)).await;
    assert!(first.is_success(), "{first}");
    let before = dump(&store).await;

    let second = pass(&source, &store, settings(EntityKind::ALL, 2)).await;
    assert!(second.is_success(), "{second}");
    assert_eq!(second.totals().written, 0);
    assert_eq!(second.totals().pruned, 0);
    assert_eq!(dump(&store).await, before);
}

#[tokio::test]
async fn test_every_entity_type_lands() {
    let source = Arc::new(league());
    let store = store().await;

    let result = pass(&source, &store, settings(EntityKind::ALL, 10)).await;
    assert!(result.is_success(), "{result}");

    assert_eq!(count(&store, "teams").await, 6);
    assert_eq!(count(&store, "players").await, 8);
    assert_eq!(count(&store, "games").await, 2);
    assert_eq!(count(&store, "season_averages").await, 3);
    assert_eq!(count(&store, "box_scores").await, 2);
    assert_eq!(count(&store, "box_score_lines").await, 6);

    let seasons: Vec<i64> =
        sqlx::query_scalar("SELECT season FROM season_averages WHERE player_id = 1 ORDER BY season")
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(seasons, vec![2023, 2024]);

    let minutes: f64 = sqlx::query_scalar(
        "SELECT minutes FROM box_score_lines WHERE game_id = 101 AND player_id = 7",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!((minutes - (32.0 + 10.0 / 60.0)).abs() < 1e-9);

    let team_id: i64 = sqlx::query_scalar(
        "SELECT team_id FROM box_score_lines WHERE game_id = 100 AND player_id = 5",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(team_id, 2);
}

#[tokio::test]
async fn test_box_score_lines_follow_latest_payload() {
    let source = Arc::new(league());
    let store = store().await;
    pass(&source, &store, settings(EntityKind::ALL, 10)).await;

    source.set_pages(
        EntityKind::BoxScores,
        vec![
            vec![box_score(100, (1, &[1, 2]), (2, &[5, 6, 8]))],
            vec![box_score(101, (3, &[]), (4, &[7]))],
        ],
    );
    let result = pass(&source, &store, settings(&[EntityKind::BoxScores], 10)).await;
    assert!(result.is_success(), "{result}");
    assert_eq!(result.totals().pruned, 1);

    let players: Vec<i64> = sqlx::query_scalar(
        "SELECT player_id FROM box_score_lines WHERE game_id = 100 ORDER BY player_id",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(players, vec![1, 2, 5, 6, 8]);
}

#[tokio::test]
async fn test_duplicate_keys_collapse_to_one_row() {
    let mut pages = team_pages(2, 5);
    pages[1].push(team(3));
    pages[1].push(team(3));
    let source = Arc::new(MockSource::new().with_pages(EntityKind::Teams, pages));
    let store = store().await;

    let result = pass(&source, &store, settings(&[EntityKind::Teams], 4)).await;

    assert!(result.is_success());
    assert_eq!(result.outcome(EntityKind::Teams).unwrap().counts.fetched, 12);
    assert_eq!(count(&store, "teams").await, 10);
}

#[tokio::test]
async fn test_violating_batch_leaves_no_rows() {
    let source = Arc::new(
        MockSource::new()
            .with_pages(EntityKind::Teams, team_pages(1, 2))
            .with_pages(
                EntityKind::Players,
                vec![vec![player(1, 1), player(2, 2), player(3, 2), player(4, 77)]],
            ),
    );
    let store = store().await;

    let result = pass(
        &source,
        &store,
        settings(&[EntityKind::Teams, EntityKind::Players], 100),
    )
    .await;

    let outcome = result.outcome(EntityKind::Players).unwrap();
    match &outcome.status {
        EntityStatus::Failed { phase, reason, detail } => {
            assert_eq!(*phase, Phase::Writing);
            assert_eq!(*reason, FailureKind::IntegrityViolation);
            assert!(detail.contains("player_id=4"), "{detail}");
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(outcome.failed_batch, Some(0));
    assert_eq!(outcome.failed_page, Some(0));
    assert_eq!(count(&store, "players").await, 0);
    assert_eq!(count(&store, "teams").await, 2);
}

#[tokio::test]
async fn test_resumed_pass_skips_committed_pages() {
    let source = Arc::new(MockSource::new().with_pages(EntityKind::Teams, team_pages(3, 50)));
    source.fail_page(EntityKind::Teams, 2, Failure::Exhausted);
    let store = store().await;

    let first = pass(&source, &store, settings(&[EntityKind::Teams], 20)).await;
    let outcome = first.outcome(EntityKind::Teams).unwrap();
    assert!(matches!(
        outcome.status,
        EntityStatus::Failed {
            reason: FailureKind::FetchExhausted,
            ..
        }
    ));
    assert_eq!(outcome.failed_page, Some(2));
    assert_eq!(count(&store, "teams").await, 100);
    assert_eq!(
        outcome.checkpoint.as_ref().and_then(|c| c.next_cursor.clone()),
        Some("2".to_string())
    );

    source.clear_failures();
    source.reset_requests();
    let second = pass(&source, &store, settings(&[EntityKind::Teams], 20)).await;

    assert!(second.is_success(), "{second}");
    assert_eq!(
        source.cursors_for(EntityKind::Teams),
        vec![Some("2".to_string())]
    );
    assert_eq!(count(&store, "teams").await, 150);
    assert!(store.load_checkpoint(EntityKind::Teams).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rejected_fetch_needs_no_retry_and_spares_siblings() {
    let source = Arc::new(league());
    source.fail_page(EntityKind::Players, 1, Failure::Rejected);
    let store = store().await;

    let result = pass(&source, &store, settings(EntityKind::ALL, 10)).await;

    assert!(!result.is_success());
    let errors = result.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, EntityKind::Players);
    assert!(errors[0].1.contains("cursor 1"));
    for kind in [
        EntityKind::Teams,
        EntityKind::Games,
        EntityKind::SeasonAverages,
        EntityKind::BoxScores,
    ] {
        assert!(result.outcome(kind).unwrap().is_done(), "{kind} should finish");
    }
    assert_eq!(count(&store, "players").await, 4);
    assert_eq!(
        source.cursors_for(EntityKind::Players),
        vec![None, Some("1".to_string())]
    );
}
