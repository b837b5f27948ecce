use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{PresenceError, Result};
use crate::event::{PersonRef, PresenceEvent};
use crate::geometry::BBox;

/// Persistence for emitted presence events.
pub trait EventStore: Send + Sync {
    fn append(&self, ev: &PresenceEvent) -> Result<()>;

    /// The newest `limit` events, oldest first.
    fn recent(&self, limit: usize) -> Result<Vec<PresenceEvent>>;

    /// Look up one event by its `evt_...` id.
    fn get(&self, evt_id: &str) -> Result<Option<PresenceEvent>>;
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) the database at `db_path`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(db_path: &str) -> Result<Self> {
        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        PresenceError::Storage(format!(
                            "create database dir {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PresenceError::Storage("event store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              evt_id TEXT NOT NULL UNIQUE,
              ts REAL NOT NULL,
              camera_id TEXT NOT NULL,
              source TEXT NOT NULL,
              bbox TEXT NOT NULL,
              snapshot_url TEXT,
              person_id INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts);
            "#,
        )?;
        Ok(())
    }
}

type RowParts = (String, f64, String, String, String, Option<String>, Option<i64>);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowParts> {
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

fn parts_to_event(parts: RowParts) -> Result<PresenceEvent> {
    let (id, ts, camera_id, source, bbox_json, snapshot_url, person_id) = parts;
    let bbox: BBox = serde_json::from_str(&bbox_json)?;
    Ok(PresenceEvent {
        id,
        ts,
        camera_id,
        source,
        bbox,
        snapshot_url,
        person: person_id.map(|id| PersonRef { id, name: None }),
    })
}

impl EventStore for SqliteEventStore {
    fn append(&self, ev: &PresenceEvent) -> Result<()> {
        let bbox_json = serde_json::to_string(&ev.bbox)?;
        self.lock()?.execute(
            r#"
            INSERT INTO events(evt_id, ts, camera_id, source, bbox, snapshot_url, person_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                ev.id,
                ev.ts,
                ev.camera_id,
                ev.source,
                bbox_json,
                ev.snapshot_url,
                ev.person.as_ref().map(|p| p.id)
            ],
        )?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<PresenceEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT evt_id, ts, camera_id, source, bbox, snapshot_url, person_id
            FROM events ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit], row_to_parts)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(parts_to_event(row?)?);
        }
        out.reverse();
        Ok(out)
    }

    fn get(&self, evt_id: &str) -> Result<Option<PresenceEvent>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT evt_id, ts, camera_id, source, bbox, snapshot_url, person_id
                FROM events WHERE evt_id = ?1
                "#,
                params![evt_id],
                row_to_parts,
            )
            .optional()?;
        row.map(parts_to_event).transpose()
    }
}
