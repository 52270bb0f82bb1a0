// SQLite persistence for lifetime totals and the traffic log

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::accumulator::ByteCounters;
use crate::aggregator::TrafficLogRecord;

/// Durable storage consumed by the aggregator: a key-value load/save for
/// lifetime totals plus an append-only log sink with a viewer query.
pub trait TrafficStore: Send + Sync {
    fn load_totals(&self) -> Result<HashMap<String, ByteCounters>>;
    fn save_totals(&self, totals: &HashMap<String, ByteCounters>) -> Result<()>;
    fn append_logs(&self, records: &[TrafficLogRecord]) -> Result<()>;
    /// Most recent records first, optionally narrowed to one process name.
    fn fetch_recent_logs(
        &self,
        limit: u32,
        app_name: Option<&str>,
    ) -> Result<Vec<TrafficLogRecord>>;
}

/// Store backed by a single SQLite database file.
///
/// SQLite stores 64-bit signed integers, so byte totals round-trip through
/// i64; lifetime counters would need to pass 2^63 bytes before that bites.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS app_traffic (
                app_name TEXT PRIMARY KEY,
                download_bytes INTEGER NOT NULL DEFAULT 0,
                upload_bytes INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS traffic_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                app_name TEXT NOT NULL,
                download_kb REAL NOT NULL,
                upload_kb REAL NOT NULL,
                src_addr TEXT NOT NULL,
                dst_addr TEXT NOT NULL
            );",
        )
        .context("Failed to create tables")?;

        log::debug!("Opened traffic database at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrafficLogRecord> {
    Ok(TrafficLogRecord {
        timestamp: row.get(0)?,
        app_name: row.get(1)?,
        download_kb: row.get(2)?,
        upload_kb: row.get(3)?,
        src_addr: row.get(4)?,
        dst_addr: row.get(5)?,
    })
}

impl TrafficStore for SqliteStore {
    fn load_totals(&self) -> Result<HashMap<String, ByteCounters>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT app_name, download_bytes, upload_bytes FROM app_traffic")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ByteCounters {
                    download_bytes: row.get::<_, i64>(1)? as u64,
                    upload_bytes: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut totals = HashMap::new();
        for row in rows {
            let (name, counters) = row?;
            totals.insert(name, counters);
        }
        Ok(totals)
    }

    fn save_totals(&self, totals: &HashMap<String, ByteCounters>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO app_traffic (app_name, download_bytes, upload_bytes)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (name, counters) in totals {
                stmt.execute(params![
                    name,
                    counters.download_bytes as i64,
                    counters.upload_bytes as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn append_logs(&self, records: &[TrafficLogRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO traffic_logs
                 (timestamp, app_name, download_kb, upload_kb, src_addr, dst_addr)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.timestamp,
                    record.app_name,
                    record.download_kb,
                    record.upload_kb,
                    record.src_addr,
                    record.dst_addr
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn fetch_recent_logs(
        &self,
        limit: u32,
        app_name: Option<&str>,
    ) -> Result<Vec<TrafficLogRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut records = Vec::new();

        match app_name {
            Some(name) => {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, app_name, download_kb, upload_kb, src_addr, dst_addr
                     FROM traffic_logs WHERE app_name = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![name, limit], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, app_name, download_kb, upload_kb, src_addr, dst_addr
                     FROM traffic_logs ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }

        Ok(records)
    }
}

/// In-memory store for aggregator tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    totals: Mutex<HashMap<String, ByteCounters>>,
    logs: Mutex<Vec<TrafficLogRecord>>,
}

#[cfg(test)]
impl TrafficStore for MemoryStore {
    fn load_totals(&self) -> Result<HashMap<String, ByteCounters>> {
        Ok(self.totals.lock().unwrap().clone())
    }

    fn save_totals(&self, totals: &HashMap<String, ByteCounters>) -> Result<()> {
        *self.totals.lock().unwrap() = totals.clone();
        Ok(())
    }

    fn append_logs(&self, records: &[TrafficLogRecord]) -> Result<()> {
        self.logs.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    fn fetch_recent_logs(
        &self,
        limit: u32,
        app_name: Option<&str>,
    ) -> Result<Vec<TrafficLogRecord>> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|record| app_name.is_none_or(|name| record.app_name == name))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
