//! Mock stats source for integration testing.
//!
//! Serves scripted pages per entity type with deterministic cursors
//! (page `i` is requested with cursor `i`, the first page with none),
//! records every request, and injects failures on chosen pages.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use hoopsync::api::StatsSource;
use hoopsync::types::{EntityKind, PageRequest, RawPage, RawPayload, SyncError};

/// Failure to inject on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Transient errors outlasted the retry budget.
    Exhausted,
    /// The API refused the request.
    Rejected,
}

#[derive(Default)]
pub struct MockSource {
    pages: Mutex<HashMap<EntityKind, Vec<Vec<Value>>>>,
    failures: Mutex<HashMap<(EntityKind, usize), Failure>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(self, entity: EntityKind, pages: Vec<Vec<Value>>) -> Self {
        self.set_pages(entity, pages);
        self
    }

    /// Replace the upstream data for one entity type.
    pub fn set_pages(&self, entity: EntityKind, pages: Vec<Vec<Value>>) {
        self.pages.lock().unwrap().insert(entity, pages);
    }

    /// Fail every request for page `index` of `entity` until cleared.
    pub fn fail_page(&self, entity: EntityKind, index: usize, failure: Failure) {
        self.failures.lock().unwrap().insert((entity, index), failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Cursors requested for one entity type, in order.
    pub fn cursors_for(&self, entity: EntityKind) -> Vec<Option<String>> {
        self.requests()
            .into_iter()
            .filter(|r| r.entity == entity)
            .map(|r| r.cursor)
            .collect()
    }

    pub fn reset_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl StatsSource for MockSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawPage, SyncError> {
        self.requests.lock().unwrap().push(request.clone());

        let index = match request.cursor.as_deref() {
            None => 0,
            Some(c) => c.parse::<usize>().map_err(|_| SyncError::FetchRejected {
                entity: request.entity,
                cursor: request.cursor.clone(),
                reason: format!("unknown cursor {c}"),
            })?,
        };

        if let Some(failure) = self.failures.lock().unwrap().get(&(request.entity, index)) {
            return Err(match failure {
                Failure::Exhausted => SyncError::FetchExhausted {
                    entity: request.entity,
                    cursor: request.cursor.clone(),
                    attempts: 5,
                    last_error: "HTTP 503 Service Unavailable".into(),
                },
                Failure::Rejected => SyncError::FetchRejected {
                    entity: request.entity,
                    cursor: request.cursor.clone(),
                    reason: "HTTP 400 Bad Request".into(),
                },
            });
        }

        let pages = self.pages.lock().unwrap();
        let entity_pages = pages.get(&request.entity).cloned().unwrap_or_default();
        let payloads = entity_pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < entity_pages.len()).then(|| (index + 1).to_string());

        Ok(RawPage {
            entity: request.entity,
            cursor: request.cursor.clone(),
            next_cursor,
            payloads: payloads.into_iter().map(RawPayload::new).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const CONFERENCES: [&str; 2] = ["East", "West"];

pub fn team(id: i64) -> Value {
    json!({
        "id": id,
        "abbreviation": format!("T{id:02}"),
        "city": format!("City {id}"),
        "conference": CONFERENCES[(id % 2) as usize],
        "division": "Central",
        "full_name": format!("City {id} Team {id}"),
        "name": format!("Team {id}")
    })
}

/// `pages` pages of `per_page` consecutive team ids starting at 1.
pub fn team_pages(pages: usize, per_page: usize) -> Vec<Vec<Value>> {
    (0..pages)
        .map(|p| {
            (0..per_page)
                .map(|i| team((p * per_page + i + 1) as i64))
                .collect()
        })
        .collect()
}

pub fn player(id: i64, team_id: i64) -> Value {
    json!({
        "id": id,
        "first_name": format!("First{id}"),
        "last_name": format!("Last{id}"),
        "position": "G",
        "height": "6-4",
        "weight": "205",
        "jersey_number": id % 99,
        "college": null,
        "country": "USA",
        "draft_year": 2019,
        "draft_round": 1,
        "draft_number": id % 30 + 1,
        "team": team(team_id)
    })
}

pub fn game(id: i64, home: i64, visitor: i64) -> Value {
    json!({
        "id": id,
        "date": "2024-10-22",
        "season": 2024,
        "status": "Final",
        "period": 4,
        "time": "Final",
        "postseason": false,
        "home_team_score": 110,
        "visitor_team_score": 101,
        "home_team": team(home),
        "visitor_team": team(visitor)
    })
}

pub fn season_average(player_id: i64, season: &str) -> Value {
    json!({
        "player_id": player_id,
        "season": season,
        "games_played": 70,
        "min": "34:06",
        "pts": 25.7,
        "reb": 7.3,
        "ast": 8.3,
        "fg_pct": 0.54
    })
}

fn line(player_id: i64, pts: i64) -> Value {
    json!({
        "player": {"id": player_id, "first_name": "F", "last_name": "L"},
        "min": "32:10",
        "pts": pts,
        "reb": 5,
        "ast": 4,
        "fgm": 9,
        "fga": 18
    })
}

pub fn box_score(game_id: i64, home: (i64, &[i64]), visitor: (i64, &[i64])) -> Value {
    json!({
        "game": {
            "id": game_id,
            "date": "2024-10-22",
            "season": 2024,
            "status": "Final",
            "period": 4,
            "home_team_score": 110,
            "visitor_team_score": 101
        },
        "home_team": {
            "id": home.0,
            "players": home.1.iter().map(|p| line(*p, 20)).collect::<Vec<_>>()
        },
        "visitor_team": {
            "id": visitor.0,
            "players": visitor.1.iter().map(|p| line(*p, 12)).collect::<Vec<_>>()
        }
    })
}
