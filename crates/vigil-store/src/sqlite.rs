//! SQLite storage backend.

use crate::backend::Backend;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use vigil_core::{DetectionResult, ImageBuffer, Origin, Person, PersonStatus, PixelFormat};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    status          TEXT NOT NULL,
    reference_image BLOB NOT NULL,
    notes           TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS detection_results (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    origin        TEXT NOT NULL,
    stream_id     TEXT,
    timestamp     TEXT NOT NULL,
    image_width   INTEGER NOT NULL,
    image_height  INTEGER NOT NULL,
    image_format  TEXT NOT NULL,
    image_data    BLOB NOT NULL,
    outcomes      TEXT NOT NULL
);
";

/// Single-connection SQLite backend. Shared between the watchlist (writes on
/// the caller's thread) and the result log writer thread.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("sqlite schema ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn into_shared(self) -> Arc<dyn Backend> {
        Arc::new(self)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, format!("invalid timestamp '{value}': {e}")))
}

fn row_to_person(row: &Row) -> rusqlite::Result<Person> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        status: PersonStatus::parse(&status)
            .ok_or_else(|| conversion_error(2, format!("unknown status '{status}'")))?,
        reference_image: row.get(3)?,
        notes: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
    })
}

fn row_to_result(row: &Row) -> rusqlite::Result<DetectionResult> {
    let origin: String = row.get(1)?;
    let timestamp: String = row.get(3)?;
    let format: String = row.get(6)?;
    let outcomes: String = row.get(8)?;

    let source_image = ImageBuffer {
        width: row.get(4)?,
        height: row.get(5)?,
        format: PixelFormat::parse(&format)
            .ok_or_else(|| conversion_error(6, format!("unknown pixel format '{format}'")))?,
        data: row.get(7)?,
    };

    Ok(DetectionResult {
        id: row.get(0)?,
        origin: Origin::parse(&origin)
            .ok_or_else(|| conversion_error(1, format!("unknown origin '{origin}'")))?,
        stream_id: row.get(2)?,
        timestamp: parse_timestamp(3, &timestamp)?,
        source_image: Arc::new(source_image),
        outcomes: serde_json::from_str(&outcomes)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?,
    })
}

impl Backend for SqliteBackend {
    fn load_persons(&self) -> Result<Vec<Person>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, status, reference_image, notes, created_at
             FROM persons ORDER BY seq ASC",
        )?;
        let persons = stmt
            .query_map([], row_to_person)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(persons)
    }

    fn upsert_persons(&self, persons: &[Person]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO persons (id, name, status, reference_image, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    status = excluded.status,
                    reference_image = excluded.reference_image,
                    notes = excluded.notes,
                    created_at = excluded.created_at",
            )?;
            for p in persons {
                stmt.execute(params![
                    p.id,
                    p.name,
                    p.status.as_str(),
                    p.reference_image,
                    p.notes,
                    p.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_person(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM persons WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn load_results(&self, limit: usize) -> Result<Vec<DetectionResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, origin, stream_id, timestamp, image_width, image_height,
                    image_format, image_data, outcomes
             FROM detection_results ORDER BY seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let results = stmt
            .query_map(params![limit], row_to_result)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    fn append_result(&self, result: &DetectionResult) -> Result<()> {
        let outcomes = serde_json::to_string(&result.outcomes)?;
        let image = &result.source_image;
        self.conn().execute(
            "INSERT INTO detection_results
                (id, origin, stream_id, timestamp, image_width, image_height,
                 image_format, image_data, outcomes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id,
                result.origin.as_str(),
                result.stream_id,
                result.timestamp.to_rfc3339(),
                image.width,
                image.height,
                image.format.as_str(),
                image.data,
                outcomes,
            ],
        )?;
        Ok(())
    }

    fn trim_results(&self, keep: usize) -> Result<()> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let removed = self.conn().execute(
            "DELETE FROM detection_results WHERE seq NOT IN
                (SELECT seq FROM detection_results ORDER BY seq DESC LIMIT ?1)",
            params![keep],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "trimmed detection results");
        }
        Ok(())
    }

    fn clear_results(&self) -> Result<()> {
        self.conn().execute("DELETE FROM detection_results", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{BoundingBox, FaceRegion, MatchOutcome};

    fn person(id: &str, name: &str) -> Person {
        Person {
            id: id.into(),
            name: name.into(),
            status: PersonStatus::Flagged,
            reference_image: vec![9, 8, 7],
            notes: Some("note".into()),
            created_at: Utc::now(),
        }
    }

    fn result(stream: &str) -> DetectionResult {
        let region = FaceRegion::new(BoundingBox { x: 0.0, y: 0.0, width: 2.0, height: 2.0 }, 0.7);
        DetectionResult::new(
            Arc::new(ImageBuffer::gray(2, 2, vec![1, 2, 3, 4])),
            vec![MatchOutcome::matched(region, "p1", 0.91), MatchOutcome::no_match(region)],
            Origin::LiveStream,
            Some(stream.into()),
        )
    }

    #[test]
    fn test_persons_roundtrip_in_insertion_order() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.upsert_persons(&[person("b", "Bea"), person("a", "Al")]).unwrap();

        let mut renamed = person("b", "Beatrice");
        renamed.notes = None;
        db.upsert_persons(&[renamed.clone()]).unwrap();

        let loaded = db.load_persons().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], renamed);
        assert_eq!(loaded[1].id, "a");

        db.delete_person("b").unwrap();
        assert_eq!(db.load_persons().unwrap().len(), 1);
    }

    #[test]
    fn test_results_most_recent_first_and_trim() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let first = result("cam-1");
        let second = result("cam-2");
        let third = result("cam-3");
        for r in [&first, &second, &third] {
            db.append_result(r).unwrap();
        }

        let loaded = db.load_results(10).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0], third);
        assert_eq!(loaded[2], first);

        db.trim_results(2).unwrap();
        let ids: Vec<_> = db.load_results(10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![third.id.clone(), second.id.clone()]);

        db.clear_results().unwrap();
        assert!(db.load_results(10).unwrap().is_empty());
    }

    #[test]
    fn test_open_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlist.db");
        {
            let db = SqliteBackend::open(&path).unwrap();
            db.upsert_persons(&[person("x", "Xena")]).unwrap();
        }
        let db = SqliteBackend::open(&path).unwrap();
        assert_eq!(db.load_persons().unwrap()[0].name, "Xena");
    }
}
