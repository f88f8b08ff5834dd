// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! History of received text and commands, in SQLite.

use chrono::{DateTime, Local, TimeZone};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::protocol::LinkError;

/// Kind of history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Text,
    Command,
}

impl EntryKind {
    fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Text => "TEXT",
            EntryKind::Command => "COMMAND",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "COMMAND" => EntryKind::Command,
            _ => EntryKind::Text,
        }
    }
}

/// A single history entry.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: DateTime<Local>,
    pub kind: EntryKind,
    pub content: String,
}

/// History database, capped to a maximum row count.
#[derive(Clone)]
pub struct History {
    conn: Arc<Mutex<Connection>>,
    max_entries: u32,
}

impl History {
    /// Open or create the history database in the data directory.
    pub fn open(data_dir: &Path, max_entries: u32) -> Result<Self, LinkError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| LinkError::Storage(format!("cannot create data dir: {}", e)))?;
        let db_path = data_dir.join("history.db");
        info!("Opening history database: {:?}", db_path);

        let conn = Connection::open(&db_path).map_err(storage_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL
            )",
            [],
        )
        .map_err(storage_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp DESC)",
            [],
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_entries,
        })
    }

    /// Append one entry, evicting the oldest rows beyond the cap.
    pub fn append(&self, kind: EntryKind, content: &str) -> Result<(), LinkError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO history (timestamp, kind, content) VALUES (?1, ?2, ?3)",
            params![Local::now().timestamp(), kind.as_str(), content],
        )
        .map_err(storage_err)?;

        conn.execute(
            "DELETE FROM history WHERE id NOT IN (
                SELECT id FROM history ORDER BY timestamp DESC, id DESC LIMIT ?1
            )",
            [self.max_entries],
        )
        .map_err(storage_err)?;

        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<HistoryEntry>, LinkError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, kind, content
                 FROM history
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?1",
            )
            .map_err(storage_err)?;

        let entries = stmt
            .query_map([limit], |row| {
                let timestamp_secs: i64 = row.get(1)?;
                let kind: String = row.get(2)?;
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    timestamp: Local.timestamp_opt(timestamp_secs, 0).unwrap(),
                    kind: EntryKind::parse(&kind),
                    content: row.get(3)?,
                })
            })
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        Ok(entries)
    }

    pub fn count(&self) -> Result<u32, LinkError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))
            .map_err(storage_err)
    }
}

fn storage_err(e: rusqlite::Error) -> LinkError {
    LinkError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_recent() {
        let dir = tempdir().unwrap();
        let history = History::open(dir.path(), 100).unwrap();

        history.append(EntryKind::Text, "Hello world").unwrap();
        history.append(EntryKind::Command, "ENTER").unwrap();

        let entries = history.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "ENTER");
        assert_eq!(entries[0].kind, EntryKind::Command);
        assert_eq!(entries[1].content, "Hello world");
        assert_eq!(entries[1].kind, EntryKind::Text);
    }

    #[test]
    fn test_row_cap() {
        let dir = tempdir().unwrap();
        let history = History::open(dir.path(), 3).unwrap();

        for i in 0..10 {
            history.append(EntryKind::Text, &format!("entry {}", i)).unwrap();
        }

        assert_eq!(history.count().unwrap(), 3);
        let entries = history.recent(10).unwrap();
        assert_eq!(entries[0].content, "entry 9");
    }
}
