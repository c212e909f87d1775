//! SQLite Index Store
//!
//! Stores chunks with their vectors (little-endian `f32` blobs) and processed
//! markers in one database file. A video's chunks and marker are committed in
//! a single transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction};

use super::{check_commit, count_mismatch, IndexStore, ProcessedMarker, StoredChunk};
use crate::core::chunking::Chunk;
use crate::core::{CoreError, CoreResult, VideoId};

// =============================================================================
// SQLite Store
// =============================================================================

/// SQLite-backed [`IndexStore`]
pub struct SqliteIndexStore {
    conn: Mutex<Connection>,
}

const CHUNK_COLUMNS: &str =
    "chunk_id, video_id, start_sec, end_sec, text, source_segment_ids, vector";

fn storage_error(context: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::IndexUnavailable(format!("{}: {}", context, e))
}

impl SqliteIndexStore {
    /// Opens (or creates) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| storage_error("Failed to open index database", e))?;

        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| storage_error("Failed to set busy timeout", e))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| storage_error("Failed to enable WAL", e))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates an in-memory database (for testing)
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage_error("Failed to create in-memory database", e))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::IndexUnavailable("index database lock poisoned".to_string()))
    }

    /// Initializes the database schema
    fn init_schema(&self) -> CoreResult<()> {
        self.lock()?
            .execute_batch(
                r#"
                -- Chunks with their embeddings; seq preserves insertion order
                CREATE TABLE IF NOT EXISTS chunks (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    chunk_id TEXT NOT NULL UNIQUE,
                    video_id TEXT NOT NULL,
                    start_sec REAL NOT NULL,
                    end_sec REAL NOT NULL,
                    text TEXT NOT NULL,
                    source_segment_ids TEXT NOT NULL,
                    vector BLOB NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                -- Fully indexed videos
                CREATE TABLE IF NOT EXISTS processed_videos (
                    video_id TEXT PRIMARY KEY,
                    chunk_count INTEGER NOT NULL,
                    embedding_model TEXT NOT NULL,
                    processed_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_chunks_video ON chunks(video_id, seq);
                "#,
            )
            .map_err(|e| storage_error("Failed to initialize schema", e))
    }

    fn insert_chunks(tx: &Transaction<'_>, chunks: &[StoredChunk]) -> CoreResult<()> {
        let mut stmt = tx
            .prepare(&format!(
                "INSERT INTO chunks ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                CHUNK_COLUMNS
            ))
            .map_err(|e| storage_error("Failed to prepare chunk insert", e))?;

        for stored in chunks {
            let chunk = &stored.chunk;
            let segment_ids = serde_json::to_string(&chunk.source_segment_ids)?;
            stmt.execute(rusqlite::params![
                chunk.chunk_id,
                chunk.video_id,
                chunk.start_sec,
                chunk.end_sec,
                chunk.text,
                segment_ids,
                encode_vector(&stored.vector),
            ])
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    CoreError::DuplicateChunk(chunk.chunk_id.clone())
                }
                other => storage_error("Failed to insert chunk", other),
            })?;
        }

        Ok(())
    }

    fn upsert_marker(conn: &Connection, marker: &ProcessedMarker) -> CoreResult<()> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO processed_videos (video_id, chunk_count, embedding_model, processed_at)
            VALUES (?, ?, ?, ?)
            "#,
            rusqlite::params![
                marker.video_id,
                marker.chunk_count as i64,
                marker.embedding_model,
                marker.processed_at.to_rfc3339(),
            ],
        )
        .map_err(|e| storage_error("Failed to save processed marker", e))?;
        Ok(())
    }

    fn count_for_video(conn: &Connection, video_id: &str) -> CoreResult<usize> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE video_id = ?",
                [video_id],
                |row| row.get(0),
            )
            .map_err(|e| storage_error("Failed to count chunks", e))?;
        Ok(count as usize)
    }

    fn query_chunks(&self, where_clause: &str, params: &[&dyn rusqlite::ToSql]) -> CoreResult<Vec<StoredChunk>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM chunks {} ORDER BY seq",
                CHUNK_COLUMNS, where_clause
            ))
            .map_err(|e| storage_error("Failed to prepare chunk query", e))?;

        let rows = stmt
            .query_map(params, read_chunk_row)
            .map_err(|e| storage_error("Failed to query chunks", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| storage_error("Failed to read chunks", e))?;

        rows.into_iter().map(decode_chunk_row).collect()
    }
}

// =============================================================================
// Row Codec
// =============================================================================

type ChunkRow = (String, String, f64, f64, String, String, Vec<u8>);

fn read_chunk_row(row: &Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_chunk_row(row: ChunkRow) -> CoreResult<StoredChunk> {
    let (chunk_id, video_id, start_sec, end_sec, text, segment_ids, blob) = row;
    let source_segment_ids: Vec<String> = serde_json::from_str(&segment_ids)
        .map_err(|e| storage_error(&format!("Corrupt segment ids for {}", chunk_id), e))?;
    let vector = decode_vector(&blob)
        .ok_or_else(|| CoreError::IndexUnavailable(format!("Corrupt vector for {}", chunk_id)))?;

    Ok(StoredChunk::new(
        Chunk {
            chunk_id,
            video_id,
            start_sec,
            end_sec,
            text,
            source_segment_ids,
        },
        vector,
    ))
}

fn read_marker_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_marker_row(row: (String, i64, String, String)) -> CoreResult<ProcessedMarker> {
    let (video_id, chunk_count, embedding_model, processed_at) = row;
    let processed_at = DateTime::parse_from_rfc3339(&processed_at)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| storage_error(&format!("Corrupt marker timestamp for {}", video_id), e))?;
    Ok(ProcessedMarker {
        video_id,
        chunk_count: chunk_count.max(0) as usize,
        embedding_model,
        processed_at,
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

// =============================================================================
// IndexStore Implementation
// =============================================================================

impl IndexStore for SqliteIndexStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get_chunk(&self, chunk_id: &str) -> CoreResult<Option<StoredChunk>> {
        Ok(self
            .query_chunks("WHERE chunk_id = ?", &[&chunk_id])?
            .into_iter()
            .next())
    }

    fn has_chunk(&self, chunk_id: &str) -> CoreResult<bool> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1 FROM chunks WHERE chunk_id = ?", [chunk_id], |_| Ok(()))
            .optional()
            .map(|found| found.is_some())
            .map_err(|e| storage_error("Failed to look up chunk", e))
    }

    fn put_chunks(&self, chunks: &[StoredChunk]) -> CoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| storage_error("Failed to begin transaction", e))?;
        Self::insert_chunks(&tx, chunks)?;
        tx.commit()
            .map_err(|e| storage_error("Failed to commit chunks", e))
    }

    fn chunks_for_video(&self, video_id: &str) -> CoreResult<Vec<StoredChunk>> {
        self.query_chunks("WHERE video_id = ?", &[&video_id])
    }

    fn all_chunks(&self) -> CoreResult<Vec<StoredChunk>> {
        self.query_chunks("", &[])
    }

    fn chunk_count(&self) -> CoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .map_err(|e| storage_error("Failed to count chunks", e))?;
        Ok(count as usize)
    }

    fn chunk_count_for_video(&self, video_id: &str) -> CoreResult<usize> {
        let conn = self.lock()?;
        Self::count_for_video(&conn, video_id)
    }

    fn videos_with_chunks(&self) -> CoreResult<Vec<VideoId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT video_id FROM chunks ORDER BY video_id")
            .map_err(|e| storage_error("Failed to prepare video query", e))?;
        let videos = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| storage_error("Failed to query videos", e))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| storage_error("Failed to read videos", e))?;
        Ok(videos)
    }

    fn get_marker(&self, video_id: &str) -> CoreResult<Option<ProcessedMarker>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT video_id, chunk_count, embedding_model, processed_at FROM processed_videos WHERE video_id = ?",
                [video_id],
                read_marker_row,
            )
            .optional()
            .map_err(|e| storage_error("Failed to load processed marker", e))?;
        row.map(decode_marker_row).transpose()
    }

    fn put_marker(&self, marker: &ProcessedMarker) -> CoreResult<()> {
        let conn = self.lock()?;
        Self::upsert_marker(&conn, marker)
    }

    fn remove_marker(&self, video_id: &str) -> CoreResult<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM processed_videos WHERE video_id = ?", [video_id])
            .map_err(|e| storage_error("Failed to remove processed marker", e))?;
        Ok(removed > 0)
    }

    fn markers(&self) -> CoreResult<Vec<ProcessedMarker>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT video_id, chunk_count, embedding_model, processed_at FROM processed_videos ORDER BY video_id",
            )
            .map_err(|e| storage_error("Failed to prepare marker query", e))?;
        let rows = stmt
            .query_map([], read_marker_row)
            .map_err(|e| storage_error("Failed to query markers", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| storage_error("Failed to read markers", e))?;
        rows.into_iter().map(decode_marker_row).collect()
    }

    fn delete_video(&self, video_id: &str) -> CoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| storage_error("Failed to begin transaction", e))?;

        let removed = tx
            .execute("DELETE FROM chunks WHERE video_id = ?", [video_id])
            .map_err(|e| storage_error("Failed to delete chunks", e))?;
        tx.execute("DELETE FROM processed_videos WHERE video_id = ?", [video_id])
            .map_err(|e| storage_error("Failed to delete processed marker", e))?;

        tx.commit()
            .map_err(|e| storage_error("Failed to commit delete", e))?;
        Ok(removed)
    }

    fn commit_video(&self, marker: &ProcessedMarker, chunks: &[StoredChunk]) -> CoreResult<()> {
        check_commit(marker, chunks)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| storage_error("Failed to begin transaction", e))?;

        let existing = Self::count_for_video(&tx, &marker.video_id)?;
        if existing + chunks.len() != marker.chunk_count {
            return Err(count_mismatch(marker, existing + chunks.len()));
        }

        Self::insert_chunks(&tx, chunks)?;
        Self::upsert_marker(&tx, marker)?;

        tx.commit()
            .map_err(|e| storage_error("Failed to commit video", e))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::tests::{exercise_store, stored};

    #[test]
    fn test_store_contract_in_memory() {
        let store = SqliteIndexStore::in_memory().unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        {
            let store = SqliteIndexStore::open(&path).unwrap();
            store
                .commit_video(
                    &ProcessedMarker::new("vid", 2, "mock"),
                    &[stored("vid", 0, "intro"), stored("vid", 1, "outro")],
                )
                .unwrap();
        }

        let store = SqliteIndexStore::open(&path).unwrap();
        let chunks = store.chunks_for_video("vid").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].vector, vec![0.0, 0.5, -1.25]);
        assert_eq!(chunks[1].chunk.source_segment_ids, vec!["vid:00001".to_string()]);
        assert_eq!(store.get_marker("vid").unwrap().unwrap().embedding_model, "mock");
    }

    #[test]
    fn test_vector_codec() {
        let vector = vec![1.5f32, -0.0, f32::MAX, 3.25e-8];
        assert_eq!(decode_vector(&encode_vector(&vector)).unwrap(), vector);
        assert!(decode_vector(&[1, 2, 3]).is_none());
    }
}
