//! SQLite schema of the durable download statistics database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

// =============================================================================
// Version 1 - Daily download counts
// =============================================================================

/// One row per (entity, day), holding the latest flushed snapshot.
const DOWNLOAD_STATS_TABLE_V1: Table = Table {
    name: "download_stats",
    columns: &[
        sqlite_column!("entity_id", &SqlType::Text, non_null = true),
        sqlite_column!("day", &SqlType::Text, non_null = true),
        sqlite_column!("count", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_download_stats_day", "day")],
    unique_constraints: &[&["entity_id", "day"]],
};

// =============================================================================
// Version 2 - Flush run history
// =============================================================================

const FLUSH_RUNS_TABLE_V2: Table = Table {
    name: "flush_runs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text, non_null = true),
        sqlite_column!("keys_scanned", &SqlType::Integer, non_null = true),
        sqlite_column!("rows_written", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_flush_runs_started", "started_at DESC")],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    FLUSH_RUNS_TABLE_V2.create(conn)
}

pub const DOWNLOAD_STATS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[DOWNLOAD_STATS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[DOWNLOAD_STATS_TABLE_V1, FLUSH_RUNS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
