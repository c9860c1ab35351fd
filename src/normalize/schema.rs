//! Table definitions for every entity type.
//!
//! Each table lists its columns in storage order together with the JSON
//! path each column is read from. The store generates its DDL and upsert
//! statements from these same definitions, so the field map and the
//! schema cannot drift apart.

use crate::types::EntityKind;

/// How a JSON value is coerced into a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Bool,
    /// Season start year; also accepts `"2023-24"` labels.
    Season,
    /// Minutes played; also accepts `"MM:SS"` clock strings.
    Minutes,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer | ColumnKind::Season | ColumnKind::Bool => "INTEGER",
            ColumnKind::Real | ColumnKind::Minutes => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }

    /// Human-readable name used in mismatch errors.
    pub fn expected(self) -> &'static str {
        match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Real => "number",
            ColumnKind::Text => "string",
            ColumnKind::Bool => "boolean",
            ColumnKind::Season => "season year or \"YYYY-YY\" label",
            ColumnKind::Minutes => "minutes or \"MM:SS\"",
        }
    }
}

/// One target column and where its value comes from.
#[derive(Debug)]
pub struct ColumnSpec {
    pub column: &'static str,
    /// Dotted path relative to the record's source object. Empty when the
    /// value is supplied by the parent document (see [`ChildSpec::inherit`]).
    pub path: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

#[derive(Debug)]
pub struct ForeignKey {
    pub columns: &'static [&'static str],
    pub references: &'static str,
    pub ref_columns: &'static [&'static str],
}

/// A column of a child record copied from the parent document.
#[derive(Debug)]
pub struct Inherit {
    pub column: &'static str,
    /// Dotted path relative to the parent document.
    pub path: &'static str,
}

/// A nested collection that expands into rows of a child table.
#[derive(Debug)]
pub struct ChildSpec {
    pub table: &'static TableSchema,
    /// Dotted path of the array inside the parent document.
    pub path: &'static str,
    pub inherit: &'static [Inherit],
}

#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    /// Natural key columns.
    pub key: &'static [&'static str],
    pub columns: &'static [ColumnSpec],
    pub foreign_keys: &'static [ForeignKey],
    /// For child tables: key columns that hold the parent's natural key.
    pub parent_key: &'static [&'static str],
    pub children: &'static [ChildSpec],
    pub indexes: &'static [(&'static str, &'static [&'static str])],
}

impl TableSchema {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.column == column)
    }

    /// Key columns that are not inherited from the parent.
    pub fn child_discriminator(&self) -> Vec<&'static str> {
        self.key
            .iter()
            .copied()
            .filter(|k| !self.parent_key.contains(k))
            .collect()
    }

    /// Tables reachable through `children`, without duplicates.
    pub fn child_tables(&self) -> Vec<&'static TableSchema> {
        let mut tables: Vec<&'static TableSchema> = Vec::new();
        for child in self.children {
            if !tables.iter().any(|t| t.name == child.table.name) {
                tables.push(child.table);
            }
        }
        tables
    }
}

const fn col(column: &'static str, path: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        column,
        path,
        kind,
        required: false,
    }
}

const fn req(column: &'static str, path: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        column,
        path,
        kind,
        required: true,
    }
}

use ColumnKind::{Bool, Integer, Minutes, Real, Season, Text};

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

pub static TEAMS: TableSchema = TableSchema {
    name: "teams",
    key: &["team_id"],
    columns: &[
        req("team_id", "id", Integer),
        req("abbreviation", "abbreviation", Text),
        req("full_name", "full_name", Text),
        col("name", "name", Text),
        col("city", "city", Text),
        col("conference", "conference", Text),
        col("division", "division", Text),
    ],
    foreign_keys: &[],
    parent_key: &[],
    children: &[],
    indexes: &[("idx_teams_abbreviation", &["abbreviation"])],
};

pub static PLAYERS: TableSchema = TableSchema {
    name: "players",
    key: &["player_id"],
    columns: &[
        req("player_id", "id", Integer),
        req("first_name", "first_name", Text),
        req("last_name", "last_name", Text),
        col("position", "position", Text),
        col("height", "height", Text),
        col("weight", "weight", Integer),
        col("jersey_number", "jersey_number", Text),
        col("college", "college", Text),
        col("country", "country", Text),
        col("draft_year", "draft_year", Integer),
        col("draft_round", "draft_round", Integer),
        col("draft_number", "draft_number", Integer),
        col("team_id", "team.id", Integer),
    ],
    foreign_keys: &[ForeignKey {
        columns: &["team_id"],
        references: "teams",
        ref_columns: &["team_id"],
    }],
    parent_key: &[],
    children: &[],
    indexes: &[("idx_players_name", &["last_name", "first_name"])],
};

pub static GAMES: TableSchema = TableSchema {
    name: "games",
    key: &["game_id"],
    columns: &[
        req("game_id", "id", Integer),
        req("date", "date", Text),
        req("season", "season", Season),
        col("status", "status", Text),
        col("period", "period", Integer),
        col("time", "time", Text),
        col("postseason", "postseason", Bool),
        req("home_team_id", "home_team.id", Integer),
        req("visitor_team_id", "visitor_team.id", Integer),
        col("home_team_score", "home_team_score", Integer),
        col("visitor_team_score", "visitor_team_score", Integer),
    ],
    foreign_keys: &[
        ForeignKey {
            columns: &["home_team_id"],
            references: "teams",
            ref_columns: &["team_id"],
        },
        ForeignKey {
            columns: &["visitor_team_id"],
            references: "teams",
            ref_columns: &["team_id"],
        },
    ],
    parent_key: &[],
    children: &[],
    indexes: &[("idx_games_season", &["season"]), ("idx_games_date", &["date"])],
};

pub static SEASON_AVERAGES: TableSchema = TableSchema {
    name: "season_averages",
    key: &["player_id", "season"],
    columns: &[
        req("player_id", "player_id", Integer),
        req("season", "season", Season),
        col("games_played", "games_played", Integer),
        col("minutes", "min", Minutes),
        col("pts", "pts", Real),
        col("reb", "reb", Real),
        col("ast", "ast", Real),
        col("stl", "stl", Real),
        col("blk", "blk", Real),
        col("turnover", "turnover", Real),
        col("pf", "pf", Real),
        col("fgm", "fgm", Real),
        col("fga", "fga", Real),
        col("fg_pct", "fg_pct", Real),
        col("fg3m", "fg3m", Real),
        col("fg3a", "fg3a", Real),
        col("fg3_pct", "fg3_pct", Real),
        col("ftm", "ftm", Real),
        col("fta", "fta", Real),
        col("ft_pct", "ft_pct", Real),
        col("oreb", "oreb", Real),
        col("dreb", "dreb", Real),
    ],
    foreign_keys: &[],
    parent_key: &[],
    children: &[],
    indexes: &[("idx_season_averages_season", &["season"])],
};

pub static BOX_SCORE_LINES: TableSchema = TableSchema {
    name: "box_score_lines",
    key: &["game_id", "player_id"],
    columns: &[
        req("game_id", "", Integer),
        req("team_id", "", Integer),
        req("player_id", "player.id", Integer),
        col("minutes", "min", Minutes),
        col("pts", "pts", Integer),
        col("reb", "reb", Integer),
        col("ast", "ast", Integer),
        col("stl", "stl", Integer),
        col("blk", "blk", Integer),
        col("turnover", "turnover", Integer),
        col("pf", "pf", Integer),
        col("fgm", "fgm", Integer),
        col("fga", "fga", Integer),
        col("fg3m", "fg3m", Integer),
        col("fg3a", "fg3a", Integer),
        col("ftm", "ftm", Integer),
        col("fta", "fta", Integer),
        col("oreb", "oreb", Integer),
        col("dreb", "dreb", Integer),
    ],
    foreign_keys: &[
        ForeignKey {
            columns: &["game_id"],
            references: "box_scores",
            ref_columns: &["game_id"],
        },
        ForeignKey {
            columns: &["team_id"],
            references: "teams",
            ref_columns: &["team_id"],
        },
    ],
    parent_key: &["game_id"],
    children: &[],
    indexes: &[("idx_box_score_lines_player", &["player_id"])],
};

pub static BOX_SCORES: TableSchema = TableSchema {
    name: "box_scores",
    key: &["game_id"],
    columns: &[
        req("game_id", "game.id", Integer),
        col("date", "game.date", Text),
        col("season", "game.season", Season),
        col("status", "game.status", Text),
        col("period", "game.period", Integer),
        req("home_team_id", "home_team.id", Integer),
        req("visitor_team_id", "visitor_team.id", Integer),
        col("home_team_score", "game.home_team_score", Integer),
        col("visitor_team_score", "game.visitor_team_score", Integer),
    ],
    foreign_keys: &[ForeignKey {
        columns: &["game_id"],
        references: "games",
        ref_columns: &["game_id"],
    }],
    parent_key: &[],
    children: &[
        ChildSpec {
            table: &BOX_SCORE_LINES,
            path: "home_team.players",
            inherit: &[
                Inherit {
                    column: "game_id",
                    path: "game.id",
                },
                Inherit {
                    column: "team_id",
                    path: "home_team.id",
                },
            ],
        },
        ChildSpec {
            table: &BOX_SCORE_LINES,
            path: "visitor_team.players",
            inherit: &[
                Inherit {
                    column: "game_id",
                    path: "game.id",
                },
                Inherit {
                    column: "team_id",
                    path: "visitor_team.id",
                },
            ],
        },
    ],
    indexes: &[],
};

/// Every table, parents before children.
pub static ALL_TABLES: &[&TableSchema] = &[
    &TEAMS,
    &PLAYERS,
    &GAMES,
    &SEASON_AVERAGES,
    &BOX_SCORES,
    &BOX_SCORE_LINES,
];

/// Root table for an entity type.
pub fn schema_for(kind: EntityKind) -> &'static TableSchema {
    match kind {
        EntityKind::Teams => &TEAMS,
        EntityKind::Players => &PLAYERS,
        EntityKind::Games => &GAMES,
        EntityKind::SeasonAverages => &SEASON_AVERAGES,
        EntityKind::BoxScores => &BOX_SCORES,
    }
}
