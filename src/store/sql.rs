// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! SQLite-backed session store.
//!
//! Two tables: `session` holds the three blobs per download keyed by hash,
//! `field` holds the keyed side-channel values. Saves are transactional
//! upserts, so an interrupted save has no effect; the batch resume flush
//! wraps the whole range in one transaction and counts per-row successes.
//!
//! Host exclusion has no filesystem lockfile here: it is a designated field
//! row (`rtorrent.lock`) holding the owner identity. The lock is advisory:
//! a crashed holder leaves the row behind, and recovery means deleting it.

use rusqlite::{params, Connection, OptionalExtension};

use crate::bencode::Value;
use crate::lockfile::holder_identity;

use super::{SessionError, SessionRecord, SessionRow};

/// Field row used for host exclusion.
const LOCK_FIELD_KEY: &str = "rtorrent.lock";

const SCHEMA: &str = "BEGIN;
CREATE TABLE IF NOT EXISTS session (hash TEXT UNIQUE, torrent BLOB, rtorrent BLOB, resume BLOB);
CREATE TABLE IF NOT EXISTS field (key TEXT UNIQUE, value BLOB);
COMMIT;";

const INSERT_SESSION_ALL: &str = "INSERT INTO session (hash, torrent, rtorrent, resume) \
     VALUES (?1, ?2, ?3, ?4) \
     ON CONFLICT(hash) DO UPDATE SET torrent = excluded.torrent, \
     rtorrent = excluded.rtorrent, resume = excluded.resume";

const INSERT_SESSION_RESUME: &str = "INSERT INTO session (hash, rtorrent, resume) \
     VALUES (?1, ?2, ?3) \
     ON CONFLICT(hash) DO UPDATE SET rtorrent = excluded.rtorrent, \
     resume = excluded.resume";

const INSERT_FIELD: &str = "INSERT INTO field (key, value) VALUES (?1, ?2) \
     ON CONFLICT(key) DO UPDATE SET value = excluded.value";

pub(super) struct SqlBackend {
    conn: Connection,
    location: String,
    is_locked: bool,
}

impl SqlBackend {
    /// Open the database, create the schema if missing, and claim the lock
    /// row when `lock` is set.
    pub(super) fn enable(uri: &str, lock: bool) -> Result<Self, SessionError> {
        let storage_err = |e: rusqlite::Error| SessionError::StorageUnavailable {
            location: uri.to_string(),
            reason: e.to_string(),
        };

        let conn = Connection::open(super::sqlite_path(uri)).map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;

        let mut backend = Self {
            conn,
            location: uri.to_string(),
            is_locked: false,
        };

        if lock {
            let holder = backend.retrieve_field(LOCK_FIELD_KEY);
            let holder = holder.as_str().unwrap_or("");
            if !holder.is_empty() {
                return Err(SessionError::lock_held(uri, holder.to_string()));
            }
            if !backend.save_field(LOCK_FIELD_KEY, &Value::string(&holder_identity())) {
                return Err(SessionError::StorageUnavailable {
                    location: uri.to_string(),
                    reason: "could not write lock row".to_string(),
                });
            }
            backend.is_locked = true;
        }

        Ok(backend)
    }

    /// Release the lock row if this store wrote it.
    pub(super) fn disable(&mut self) {
        if self.is_locked {
            self.remove_field(LOCK_FIELD_KEY);
            self.is_locked = false;
        }
    }

    pub(super) fn save(&mut self, row: &SessionRow) -> bool {
        let Ok(tx) = self.conn.transaction() else {
            return false;
        };
        let result = execute_row(&tx, row);
        match result {
            Ok(_) => tx.commit().is_ok(),
            Err(e) => {
                tracing::debug!("session save failed | hash={} error={}", row.hash, e);
                false
            }
        }
    }

    /// Save a batch of rows in a single transaction, counting per-row
    /// successes. A transaction that fails to commit persisted nothing.
    pub(super) fn save_batch(&mut self, rows: &[SessionRow]) -> usize {
        let Ok(tx) = self.conn.transaction() else {
            return 0;
        };
        let mut saved = 0;
        for row in rows {
            match execute_row(&tx, row) {
                Ok(_) => saved += 1,
                Err(e) => {
                    tracing::debug!("session row save failed | hash={} error={}", row.hash, e);
                }
            }
        }
        if tx.commit().is_ok() {
            saved
        } else {
            0
        }
    }

    pub(super) fn remove(&mut self, hash: &str) {
        if let Err(e) = self
            .conn
            .execute("DELETE FROM session WHERE hash = ?1", params![hash])
        {
            tracing::debug!("session delete failed | hash={} error={}", hash, e);
        }
    }

    /// Scan the session table in one read transaction and feed every row
    /// through the sink. Blobs that are NULL or fail to decode hydrate as
    /// empty maps.
    pub(super) fn load_all(
        &mut self,
        sink: &mut dyn FnMut(SessionRecord),
    ) -> Result<(), SessionError> {
        let location = self.location.clone();
        let storage_err = move |e: rusqlite::Error| SessionError::StorageUnavailable {
            location: location.clone(),
            reason: e.to_string(),
        };

        let tx = self.conn.transaction().map_err(&storage_err)?;
        {
            let mut stmt = tx
                .prepare("SELECT hash, torrent, rtorrent, resume FROM session")
                .map_err(&storage_err)?;
            let mut rows = stmt.query([]).map_err(&storage_err)?;
            while let Some(row) = rows.next().map_err(&storage_err)? {
                let hash: String = row.get(0).map_err(&storage_err)?;
                let torrent: Option<Vec<u8>> = row.get(1).map_err(&storage_err)?;
                let rtorrent: Option<Vec<u8>> = row.get(2).map_err(&storage_err)?;
                let resume: Option<Vec<u8>> = row.get(3).map_err(&storage_err)?;
                sink(SessionRecord {
                    main: decode_blob(torrent, "torrent", &hash),
                    rtorrent: decode_blob(rtorrent, "rtorrent", &hash),
                    libtorrent_resume: decode_blob(resume, "resume", &hash),
                    hash,
                });
            }
        }
        let _ = tx.commit();
        Ok(())
    }

    pub(super) fn save_field(&mut self, key: &str, value: &Value) -> bool {
        let bytes = value.encode(0);
        let result = self
            .conn
            .prepare_cached(INSERT_FIELD)
            .and_then(|mut stmt| stmt.execute(params![key, bytes]));
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("field save failed | key={} error={}", key, e);
                false
            }
        }
    }

    pub(super) fn retrieve_field(&mut self, key: &str) -> Value {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM field WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional();
        match result {
            Ok(Some(data)) => Value::decode(&data).unwrap_or_else(|e| {
                tracing::debug!("field row corrupted, discarding (key:{}): {}", key, e);
                Value::none()
            }),
            Ok(None) => Value::none(),
            Err(e) => {
                tracing::debug!("field read failed | key={} error={}", key, e);
                Value::none()
            }
        }
    }

    pub(super) fn remove_field(&mut self, key: &str) {
        if let Err(e) = self
            .conn
            .execute("DELETE FROM field WHERE key = ?1", params![key])
        {
            tracing::debug!("field delete failed | key={} error={}", key, e);
        }
    }
}

fn execute_row(conn: &Connection, row: &SessionRow) -> rusqlite::Result<usize> {
    match &row.main {
        Some(main) => conn
            .prepare_cached(INSERT_SESSION_ALL)
            .and_then(|mut stmt| stmt.execute(params![row.hash, main, row.rtorrent, row.resume])),
        None => conn
            .prepare_cached(INSERT_SESSION_RESUME)
            .and_then(|mut stmt| stmt.execute(params![row.hash, row.rtorrent, row.resume])),
    }
}

fn decode_blob(blob: Option<Vec<u8>>, column: &str, hash: &str) -> Value {
    match blob {
        Some(data) => Value::decode(&data).unwrap_or_else(|e| {
            tracing::debug!(
                "session blob corrupted, discarding (hash:{} column:{}): {}",
                hash,
                column,
                e
            );
            Value::map()
        }),
        None => Value::map(),
    }
}
