// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Directory-backed session store.
//!
//! One on-disk triplet per download under the session directory:
//! `H.torrent` (metainfo), `H.torrent.rtorrent` (operator state) and
//! `H.torrent.libtorrent_resume` (resume data), where `H` is the 40-hex
//! hash. Every write stages into a `.new` sibling, is read back to verify a
//! complete bencode document hit disk, and is then renamed over the live
//! file, so a reader never sees a torn blob. Keyed fields live as loose
//! files in the same directory; the input history uses a line format
//! instead of bencode.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::bencode::Value;
use crate::lockfile::{Lockfile, LockfileError};

use super::{SessionError, SessionRecord, SessionRow};

/// Only names of this exact shape are session records; everything else in
/// the directory (locks, fields, staged files) is ignored by enumeration.
static SESSION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]{40}\.torrent$").expect("session name regex"));

/// The field key whose directory representation is the line-oriented
/// history file rather than bencode.
const INPUT_HISTORY_KEY: &str = "rtorrent.input_history";

pub(super) struct DirectoryBackend {
    dir: PathBuf,
    lockfile: Lockfile,
}

impl DirectoryBackend {
    /// Open the session directory, creating it if missing, and take the
    /// host lock when a lock path is given.
    pub(super) fn enable(dir: PathBuf, lock_path: Option<PathBuf>) -> Result<Self, SessionError> {
        fs::create_dir_all(&dir).map_err(|e| SessionError::StorageUnavailable {
            location: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut lockfile = Lockfile::new(lock_path);
        lockfile.try_lock().map_err(|e| match e {
            LockfileError::Held { holder } => {
                SessionError::lock_held(dir.display().to_string(), holder)
            }
            LockfileError::Path(source) => SessionError::LockPath {
                location: dir.display().to_string(),
                source,
            },
        })?;

        Ok(Self { dir, lockfile })
    }

    pub(super) fn disable(&mut self) {
        self.lockfile.unlock();
    }

    fn session_paths(&self, hash: &str) -> (PathBuf, PathBuf, PathBuf) {
        let main = self.dir.join(format!("{hash}.torrent"));
        let rtorrent = self.dir.join(format!("{hash}.torrent.rtorrent"));
        let resume = self.dir.join(format!("{hash}.torrent.libtorrent_resume"));
        (main, rtorrent, resume)
    }

    /// Write one record. The resume and rtorrent blobs are staged first and
    /// renamed together, so they advance as a pair from a reader's
    /// perspective; the metainfo document is renamed only if its own staged
    /// write verified, and its failure does not fail the save.
    pub(super) fn save(&mut self, row: &SessionRow) -> bool {
        let (main_path, rtorrent_path, resume_path) = self.session_paths(&row.hash);

        if !write_and_verify(&staged(&resume_path), &row.resume)
            || !write_and_verify(&staged(&rtorrent_path), &row.rtorrent)
        {
            return false;
        }
        commit(&staged(&resume_path), &resume_path);
        commit(&staged(&rtorrent_path), &rtorrent_path);

        if let Some(main) = &row.main {
            if write_and_verify(&staged(&main_path), main) {
                commit(&staged(&main_path), &main_path);
            }
        }

        tracing::debug!("SESSION_SAVED | hash={} main={}", row.hash, row.main.is_some());
        true
    }

    pub(super) fn remove(&mut self, hash: &str) {
        let (main, rtorrent, resume) = self.session_paths(hash);
        for path in [resume, rtorrent, main] {
            let _ = fs::remove_file(path);
        }
    }

    /// Enumerate session records and feed each through the sink. Blobs that
    /// are missing or fail to decode hydrate as empty maps; only a directory
    /// that cannot be listed at all is an error.
    pub(super) fn load_all(
        &mut self,
        sink: &mut dyn FnMut(SessionRecord),
    ) -> Result<(), SessionError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| SessionError::StorageUnavailable {
            location: self.dir.display().to_string(),
            reason: format!("could not open directory: {e}"),
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| SESSION_NAME.is_match(name))
            .collect();
        names.sort();

        for name in names {
            let hash = name[..40].to_string();
            let (main_path, rtorrent_path, resume_path) = self.session_paths(&hash);
            sink(SessionRecord {
                hash,
                main: read_session_file(&main_path),
                rtorrent: read_session_file(&rtorrent_path),
                libtorrent_resume: read_session_file(&resume_path),
            });
        }
        Ok(())
    }

    pub(super) fn save_field(&mut self, key: &str, value: &Value) -> bool {
        if key == INPUT_HISTORY_KEY {
            return self.save_input_history(value);
        }
        let path = self.dir.join(key);
        let staged_path = staged(&path);
        if !write_and_verify(&staged_path, &value.encode(0)) {
            return false;
        }
        fs::rename(&staged_path, &path).is_ok()
    }

    pub(super) fn retrieve_field(&mut self, key: &str) -> Value {
        if key == INPUT_HISTORY_KEY {
            return self.load_input_history();
        }
        let path = self.dir.join(key);
        match fs::read(&path) {
            Err(e) => {
                tracing::debug!("could not open field file (path:{:?}): {}", path, e);
                Value::none()
            }
            Ok(data) => match Value::decode(&data) {
                Ok(value) => {
                    tracing::debug!("field file read (path:{:?})", path);
                    value
                }
                Err(e) => {
                    tracing::debug!("field file corrupted, discarding (path:{:?}): {}", path, e);
                    Value::none()
                }
            },
        }
    }

    pub(super) fn remove_field(&mut self, key: &str) {
        let _ = fs::remove_file(self.dir.join(key));
    }

    /// Write the input history in line format: `<type>|<value>` per entry,
    /// in list order. Entries that are not `[int, string]` pairs are
    /// skipped.
    fn save_input_history(&self, value: &Value) -> bool {
        let Some(entries) = value.as_list() else {
            return false;
        };
        let path = self.dir.join(INPUT_HISTORY_KEY);
        let staged_path = staged(&path);

        let mut out = String::new();
        for entry in entries {
            let Some(pair) = entry.as_list() else { continue };
            let kind = pair.first().and_then(Value::as_int);
            let text = pair.last().and_then(Value::as_str);
            if let (Some(kind), Some(text)) = (kind, text) {
                out.push_str(&format!("{kind}|{text}\n"));
            }
        }

        let write = |path: &Path| -> io::Result<()> {
            let mut file = File::create(path)?;
            file.write_all(out.as_bytes())?;
            file.sync_all()
        };
        if let Err(e) = write(&staged_path) {
            tracing::debug!(
                "could not write input history file (path:{:?}): {}",
                path,
                e
            );
            return false;
        }
        fs::rename(&staged_path, &path).is_ok()
    }

    /// Read the input history back as a list of `[type, value]` pairs.
    /// Lines without a separator are skipped; values are trimmed.
    fn load_input_history(&self) -> Value {
        let path = self.dir.join(INPUT_HISTORY_KEY);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("could not open input history file (path:{:?}): {}", path, e);
                return Value::list(Vec::new());
            }
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let Some(pos) = line.find('|') else { continue };
            let kind = line[..pos].trim().parse::<i64>().unwrap_or(0);
            let text = line[pos + 1..].trim();
            entries.push(Value::list(vec![Value::int(kind), Value::string(text)]));
        }
        Value::list(entries)
    }
}

fn staged(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".new");
    PathBuf::from(os)
}

/// Stage `bytes` at `path`, flush to disk, then read the file back and
/// check it parses as one bencode document. A staged file that fails
/// verification is left in place; it is overwritten by the next save.
fn write_and_verify(path: &Path, bytes: &[u8]) -> bool {
    let write = || -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        tracing::debug!("session write failed (path:{:?}): {}", path, e);
        return false;
    }
    match fs::read(path) {
        Ok(data) if Value::decode(&data).is_ok() => true,
        _ => {
            tracing::debug!("session write verification failed (path:{:?})", path);
            false
        }
    }
}

fn commit(staged: &Path, live: &Path) {
    if let Err(e) = fs::rename(staged, live) {
        tracing::debug!("session rename failed (path:{:?}): {}", live, e);
    }
}

fn read_session_file(path: &Path) -> Value {
    match fs::read(path) {
        Ok(data) => Value::decode(&data).unwrap_or_else(|e| {
            tracing::debug!("session file corrupted, discarding (path:{:?}): {}", path, e);
            Value::map()
        }),
        Err(e) => {
            tracing::debug!("could not open session file (path:{:?}): {}", path, e);
            Value::map()
        }
    }
}
