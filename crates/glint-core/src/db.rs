//! SQLite persistence for the enrichment worker.
//!
//! The worker shares its database with the upstream app that inserts
//! `assets` and `asset_ai` rows and reads `asset_search`. The embedding and
//! segment tables are owned here and bootstrapped on connect so the worker
//! can start before the app has applied its own migrations.
//!
//! All functions take a plain `Connection`/`Transaction`; transaction
//! boundaries belong to the job loop, which groups mutations into the two
//! commits the state machine defines.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

use crate::types::{AssetStatus, Job};

/// Open the shared database: enable foreign keys, set a 5 s busy timeout
/// for multi-worker contention, and ensure the owned schema exists.
pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS asset_embeddings (
           asset_id TEXT PRIMARY KEY REFERENCES assets(id) ON DELETE CASCADE,
           model TEXT NOT NULL,
           dim INTEGER NOT NULL,
           embedding BLOB,
           updated_at TEXT NOT NULL DEFAULT (datetime('now'))
         );
         CREATE TABLE IF NOT EXISTS asset_segments (
           asset_id TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
           tag TEXT NOT NULL,
           svg TEXT,
           bbox_json TEXT,
           updated_at TEXT NOT NULL DEFAULT (datetime('now')),
           PRIMARY KEY (asset_id, tag)
         );
         CREATE INDEX IF NOT EXISTS asset_segments_tag_idx ON asset_segments(tag);",
    )?;
    Ok(conn)
}

/// Lease the oldest enrichable image asset, if any.
///
/// `processing` is included on purpose: a worker that crashed mid-job
/// leaves its row stuck there, and the next poll (from any worker) picks
/// it up again. At-least-once, not exactly-once.
pub fn fetch_next_job(conn: &Connection) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        "SELECT
           a.id,
           a.project_id,
           a.original_name,
           a.mime_type,
           a.storage_path,
           a.storage_url,
           a.sha256
         FROM assets a
         JOIN asset_ai ai ON ai.asset_id = a.id
         WHERE ai.status IN ('pending', 'processing') AND a.mime_type LIKE 'image/%'
         ORDER BY ai.updated_at ASC
         LIMIT 1",
        [],
        |row| {
            Ok(Job {
                asset_id: row.get(0)?,
                project_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                original_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                mime_type: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                storage_path: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                storage_url: row.get(5)?,
                sha256: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            })
        },
    )
    .optional()
}

pub fn set_status(conn: &Connection, asset_id: &str, status: AssetStatus) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE asset_ai SET status = ?1, updated_at = datetime('now') WHERE asset_id = ?2",
        params![status.as_str(), asset_id],
    )?;
    Ok(())
}

/// Write the enrichment outcome onto the `asset_ai` row.
pub fn write_results(
    conn: &Connection,
    asset_id: &str,
    caption: &str,
    tags: &[String],
    status: AssetStatus,
    model_version: &str,
) -> rusqlite::Result<()> {
    let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "UPDATE asset_ai
         SET caption = ?1,
             tags_json = ?2,
             status = ?3,
             model_version = ?4,
             updated_at = datetime('now')
         WHERE asset_id = ?5",
        params![caption, tags_json, status.as_str(), model_version, asset_id],
    )?;
    Ok(())
}

/// Update the display name generated by the alias step.
pub fn rename_asset(conn: &Connection, asset_id: &str, pretty: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE assets SET original_name = ?1 WHERE id = ?2",
        params![pretty, asset_id],
    )?;
    Ok(())
}

/// Rebuild the denormalized search row from current `assets ⋈ asset_ai`
/// state. Delete-then-insert keeps parity with the upstream app's indexer
/// and makes the rebuild idempotent.
pub fn update_search_index(conn: &Connection, asset_id: &str) -> rusqlite::Result<()> {
    let row = conn
        .query_row(
            "SELECT a.id, a.project_id, a.original_name, ai.caption, ai.tags_json
             FROM assets a
             LEFT JOIN asset_ai ai ON ai.asset_id = a.id
             WHERE a.id = ?1",
            [asset_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((id, project_id, original_name, caption, tags_json)) = row else {
        return Ok(());
    };

    let tags_text = tags_json.as_deref().map(tags_to_text).unwrap_or_default();

    conn.execute("DELETE FROM asset_search WHERE asset_id = ?1", [&id])?;
    conn.execute(
        "INSERT INTO asset_search (asset_id, project_id, original_name, caption, tags)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            project_id.unwrap_or_default(),
            original_name.unwrap_or_default(),
            caption.unwrap_or_default(),
            tags_text
        ],
    )?;
    Ok(())
}

/// Whitespace-join the string entries of a `tags_json` array; malformed
/// payloads index as empty rather than erroring.
fn tags_to_text(tags_json: &str) -> String {
    match serde_json::from_str::<Value>(tags_json) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

pub fn upsert_segment_row(
    conn: &Connection,
    asset_id: &str,
    tag: &str,
    svg: Option<&str>,
    bbox_json: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO asset_segments (asset_id, tag, svg, bbox_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(asset_id, tag) DO UPDATE SET
           svg = excluded.svg,
           bbox_json = excluded.bbox_json,
           updated_at = excluded.updated_at",
        params![asset_id, tag, svg, bbox_json],
    )?;
    Ok(())
}

/// Remove segment rows for tags that did not survive this run, so stale
/// tags from a prior enrichment cannot linger.
pub fn delete_segments_not_in(
    conn: &Connection,
    asset_id: &str,
    keep_tags: &[String],
) -> rusqlite::Result<()> {
    if keep_tags.is_empty() {
        conn.execute("DELETE FROM asset_segments WHERE asset_id = ?1", [asset_id])?;
        return Ok(());
    }
    let placeholders = vec!["?"; keep_tags.len()].join(",");
    let sql =
        format!("DELETE FROM asset_segments WHERE asset_id = ? AND tag NOT IN ({placeholders})");
    let args = std::iter::once(asset_id).chain(keep_tags.iter().map(String::as_str));
    conn.execute(&sql, rusqlite::params_from_iter(args))?;
    Ok(())
}

pub fn upsert_embedding_row(
    conn: &Connection,
    asset_id: &str,
    model: &str,
    dim: usize,
    embedding: &[u8],
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO asset_embeddings (asset_id, model, dim, embedding, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(asset_id) DO UPDATE SET
           model = excluded.model,
           dim = excluded.dim,
           embedding = excluded.embedding,
           updated_at = excluded.updated_at",
        params![asset_id, model, dim as i64, embedding],
    )?;
    Ok(())
}
