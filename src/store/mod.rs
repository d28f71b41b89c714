// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! The session store: durable identity and resume state for every managed
//! download, plus keyed operator state.
//!
//! One operation surface over three backends: vacant (the default store,
//! which can never be enabled and answers every request with trivial
//! success), a directory of bencode files, and a SQLite database. The
//! backend is chosen from the location URI when the store is enabled.
//!
//! Lifecycle: a store is constructed disabled. `set_location` and
//! `set_lock_location` are only valid while disabled; `enable` validates the
//! URI and takes the host lock; `disable` releases it. Write operations on a
//! disabled store report success without touching storage so callers never
//! branch on store state.

mod directory;
mod sql;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bencode::Value;
use crate::config::SessionSettings;
use crate::download::{Download, RESUME_KEY, RTORRENT_KEY};

use directory::DirectoryBackend;
use sql::SqlBackend;

/// Save flag: do not rewrite the immutable metainfo document. Used for
/// periodic resume flushes, where only the state blobs change.
pub const SAVE_SKIP_STATIC: u32 = 0x1;

/// One hydrated download record, as handed to the load callback.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// 40 uppercase hex characters.
    pub hash: String,
    pub main: Value,
    pub rtorrent: Value,
    pub libtorrent_resume: Value,
}

/// Sink invoked once per stored record during `load_all`.
pub type LoadCallback = Box<dyn FnMut(SessionRecord)>;

/// Startup-path errors. Steady-state write failures are never errors; they
/// are the `false` returns of `save` and `save_field`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation issued in the wrong lifecycle state. Caller bug.
    #[error("{0}")]
    BadState(String),

    /// The session location is locked by another process.
    #[error("Could not lock session directory: \"{location}\", held by \"{holder}\"{hint}")]
    LockHeld {
        location: String,
        holder: String,
        hint: String,
    },

    /// The lock path itself is unusable.
    #[error("Could not lock session directory: \"{location}\", {source}")]
    LockPath {
        location: String,
        #[source]
        source: io::Error,
    },

    /// The backing store cannot be opened or enumerated.
    #[error("Could not open session storage \"{location}\": {reason}")]
    StorageUnavailable { location: String, reason: String },
}

impl SessionError {
    pub(crate) fn lock_held(location: impl Into<String>, holder: String) -> Self {
        // Containers often run the daemon as a very low pid with a generated
        // hostname, which makes leftover lock identities ambiguous.
        let hint = if std::process::id() <= 10 {
            "\nHint: use a consistent hostname so stale locks can be handled safely.".to_string()
        } else {
            String::new()
        };
        SessionError::LockHeld {
            location: location.into(),
            holder,
            hint,
        }
    }
}

/// Encoded form of one save: the three blobs keyed by hash. `main` is absent
/// for skip-static saves.
#[derive(Debug, Clone)]
pub(crate) struct SessionRow {
    pub hash: String,
    pub main: Option<Vec<u8>>,
    pub rtorrent: Vec<u8>,
    pub resume: Vec<u8>,
}

enum Backend {
    Vacant,
    Directory(DirectoryBackend),
    Sql(SqlBackend),
}

/// Build a store for `uri`: `sqlite:` URIs get the database backend,
/// anything else is treated as a session directory path.
pub fn create_session_store(uri: &str) -> SessionStore {
    let mut store = SessionStore::new();
    store.uri = normalize_location(uri);
    store
}

fn is_sqlite_uri(uri: &str) -> bool {
    uri.starts_with("sqlite:")
}

pub(crate) fn sqlite_path(uri: &str) -> &str {
    let rest = uri.strip_prefix("sqlite:").unwrap_or(uri);
    rest.strip_prefix("//").unwrap_or(rest)
}

/// Expand a leading `~/` against the home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Home-expand a location URI. For `sqlite:` URIs the expansion applies to
/// the path portion; the scheme is preserved as written.
fn normalize_location(uri: &str) -> String {
    if let Some(rest) = uri.strip_prefix("sqlite:") {
        let (slashes, path) = match rest.strip_prefix("//") {
            Some(path) => ("//", path),
            None => ("", rest),
        };
        return format!("sqlite:{}{}", slashes, expand_tilde(path));
    }
    expand_tilde(uri)
}

/// The session store front.
pub struct SessionStore {
    uri: String,
    lock_location: Option<String>,
    callback: Option<LoadCallback>,
    backend: Backend,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// A vacant store with no location. It can be configured and enabled
    /// later, or used as-is as the always-disabled default store.
    pub fn new() -> Self {
        Self {
            uri: String::new(),
            lock_location: None,
            callback: None,
            backend: Backend::Vacant,
        }
    }

    /// Build a store from daemon settings. The caller still decides when to
    /// enable it (and whether to lock, via `settings.lock`).
    pub fn from_settings(settings: &SessionSettings) -> Self {
        let mut store = create_session_store(&settings.location);
        store.lock_location = settings
            .lock_location
            .as_deref()
            .filter(|path| !path.is_empty())
            .map(expand_tilde);
        store
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, Backend::Vacant)
    }

    pub fn location(&self) -> &str {
        &self.uri
    }

    pub fn lock_location(&self) -> Option<&str> {
        self.lock_location.as_deref()
    }

    /// Change the backend location. Only valid while disabled.
    pub fn set_location(&mut self, uri: &str) -> Result<(), SessionError> {
        if self.is_enabled() {
            return Err(SessionError::BadState(
                "Tried to change session location while it is enabled.".to_string(),
            ));
        }
        self.uri = normalize_location(uri);
        Ok(())
    }

    /// Change the lockfile path. Only valid while disabled; an empty path
    /// restores the default (`rtorrent.lock` inside the session directory).
    pub fn set_lock_location(&mut self, path: &str) -> Result<(), SessionError> {
        if self.is_enabled() {
            return Err(SessionError::BadState(
                "Tried to change session lock while it is enabled.".to_string(),
            ));
        }
        self.lock_location = if path.is_empty() {
            None
        } else {
            Some(expand_tilde(path))
        };
        Ok(())
    }

    /// Register the sink `load_all` feeds. Replaces any previous sink.
    pub fn set_load_callback(&mut self, sink: impl FnMut(SessionRecord) + 'static) {
        self.callback = Some(Box::new(sink));
    }

    /// Open the backing store and, when `lock` is set, take the host lock.
    ///
    /// Enabling with an empty location is a no-op that leaves the store
    /// disabled.
    pub fn enable(&mut self, lock: bool) -> Result<(), SessionError> {
        if self.is_enabled() {
            let what = if is_sqlite_uri(&self.uri) {
                "Session database already enabled."
            } else {
                "Session directory already enabled."
            };
            return Err(SessionError::BadState(what.to_string()));
        }
        if self.uri.is_empty() {
            return Ok(());
        }

        if is_sqlite_uri(&self.uri) {
            self.backend = Backend::Sql(SqlBackend::enable(&self.uri, lock)?);
        } else {
            let dir = PathBuf::from(&self.uri);
            let lock_path = lock.then(|| {
                self.lock_location
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| dir.join("rtorrent.lock"))
            });
            self.backend = Backend::Directory(DirectoryBackend::enable(dir, lock_path)?);
        }

        tracing::info!("SESSION_ENABLED | location={} lock={}", self.uri, lock);
        Ok(())
    }

    /// Release the lock and return to the disabled state. Never fails; a
    /// disabled store stays disabled.
    pub fn disable(&mut self) {
        match std::mem::replace(&mut self.backend, Backend::Vacant) {
            Backend::Vacant => {}
            Backend::Directory(mut backend) => {
                backend.disable();
                tracing::info!("SESSION_DISABLED | location={}", self.uri);
            }
            Backend::Sql(mut backend) => {
                backend.disable();
                tracing::info!("SESSION_DISABLED | location={}", self.uri);
            }
        }
    }

    /// Persist one download. Returns `false` on any I/O failure; previous
    /// on-disk state survives a failed save intact. Disabled stores report
    /// success.
    ///
    /// Before serialization the four lifetime counters are sampled from the
    /// download and written into its live `rtorrent` subtree, and the
    /// session-data flag is re-asserted on both state subtrees. Callers
    /// observe these annotations on the download itself.
    pub fn save(&mut self, download: &mut Download, flags: u32) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let row = annotate_and_encode(download, flags);
        match &mut self.backend {
            Backend::Vacant => true,
            Backend::Directory(backend) => backend.save(&row),
            Backend::Sql(backend) => backend.save(&row),
        }
    }

    /// Full save, metainfo document included.
    pub fn save_full(&mut self, download: &mut Download) -> bool {
        self.save(download, 0)
    }

    /// Resume-only save of a single download.
    pub fn save_resume_one(&mut self, download: &mut Download) -> bool {
        self.save(download, SAVE_SKIP_STATIC)
    }

    /// Periodic resume flush over a batch of downloads. Returns how many
    /// were saved; individual failures are counted as not-saved, never
    /// surfaced. A disabled store counts every download as saved.
    pub fn save_resume<'a>(
        &mut self,
        downloads: impl IntoIterator<Item = &'a mut Download>,
    ) -> usize {
        if !self.is_enabled() {
            return downloads.into_iter().count();
        }
        let rows: Vec<SessionRow> = downloads
            .into_iter()
            .map(|d| annotate_and_encode(d, SAVE_SKIP_STATIC))
            .collect();
        match &mut self.backend {
            Backend::Vacant => rows.len(),
            Backend::Directory(backend) => rows.iter().filter(|row| backend.save(row)).count(),
            Backend::Sql(backend) => backend.save_batch(&rows),
        }
    }

    /// Delete the stored record for a download. Silent on missing.
    pub fn remove(&mut self, download: &Download) {
        self.remove_key(&download.hash_hex());
    }

    /// Delete a stored record by its 40-hex hash key. Silent on missing.
    pub fn remove_key(&mut self, hash: &str) {
        match &mut self.backend {
            Backend::Vacant => {}
            Backend::Directory(backend) => backend.remove(hash),
            Backend::Sql(backend) => backend.remove(hash),
        }
    }

    /// Replay every stored record through the registered load callback, one
    /// synchronous pass. Blobs that are missing or fail to decode hydrate as
    /// empty maps. Disabled stores emit nothing.
    pub fn load_all(&mut self) -> Result<(), SessionError> {
        let callback = &mut self.callback;
        let mut emitted = 0usize;
        let mut sink = |record: SessionRecord| {
            emitted += 1;
            if let Some(cb) = callback.as_mut() {
                cb(record);
            }
        };
        match &mut self.backend {
            Backend::Vacant => {}
            Backend::Directory(backend) => backend.load_all(&mut sink)?,
            Backend::Sql(backend) => backend.load_all(&mut sink)?,
        }
        tracing::info!("SESSION_LOADED | location={} records={}", self.uri, emitted);
        Ok(())
    }

    /// Persist an arbitrary keyed value outside any download. Returns
    /// `false` on I/O failure; disabled stores report success.
    pub fn save_field(&mut self, key: &str, value: &Value) -> bool {
        match &mut self.backend {
            Backend::Vacant => true,
            Backend::Directory(backend) => backend.save_field(key, value),
            Backend::Sql(backend) => backend.save_field(key, value),
        }
    }

    /// Fetch a keyed value. `Value::none()` when absent or corrupt; never
    /// fails.
    pub fn retrieve_field(&mut self, key: &str) -> Value {
        match &mut self.backend {
            Backend::Vacant => Value::none(),
            Backend::Directory(backend) => backend.retrieve_field(key),
            Backend::Sql(backend) => backend.retrieve_field(key),
        }
    }

    /// Delete a keyed value. Silent on missing.
    pub fn remove_field(&mut self, key: &str) {
        match &mut self.backend {
            Backend::Vacant => {}
            Backend::Directory(backend) => backend.remove_field(key),
            Backend::Sql(backend) => backend.remove_field(key),
        }
    }
}

/// Sample the live counters into the download's `rtorrent` subtree, assert
/// the session-data flag on both state subtrees, and encode the blobs.
fn annotate_and_encode(download: &mut Download, flags: u32) -> SessionRow {
    let completed = download.completed_chunks();
    let wanted = download.wanted_chunks();
    let uploaded = download.uploaded_total();
    let downloaded = download.downloaded_total();

    let rtorrent = download.base_mut(RTORRENT_KEY);
    rtorrent.insert_key("chunks_done", Value::int(i64::from(completed)));
    rtorrent.insert_key("chunks_wanted", Value::int(i64::from(wanted)));
    rtorrent.insert_key("total_uploaded", Value::int(uploaded as i64));
    rtorrent.insert_key("total_downloaded", Value::int(downloaded as i64));
    rtorrent.set_flags(Value::FLAG_SESSION_DATA);
    download.base_mut(RESUME_KEY).set_flags(Value::FLAG_SESSION_DATA);

    SessionRow {
        hash: download.hash_hex(),
        main: (flags & SAVE_SKIP_STATIC == 0)
            .then(|| download.root().encode(Value::FLAG_SESSION_DATA)),
        rtorrent: download.base(RTORRENT_KEY).encode(0),
        resume: download.base(RESUME_KEY).encode(0),
    }
}
