// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! seedvault - durable session state for a peer-to-peer file-transfer daemon
//!
//! seedvault remembers, across crashes and restarts, the identity and
//! resumable state of every download a daemon manages, plus a small amount
//! of keyed operator state. On startup it rehydrates every stored download
//! through a caller-supplied sink; during operation it writes updated resume
//! data with an atomic stage-then-rename discipline; on removal it deletes
//! the associated records. A host lock keeps two daemons out of the same
//! session location.
//!
//! # Core Modules
//!
//! - [`store`] - The session store and its directory and SQLite backends
//! - [`bencode`] - Bencode value model, codec, and skip-mask serialization
//! - [`lockfile`] - Host-exclusive lock with holder identity
//! - [`download`] - The download handle the daemon passes in
//! - [`config`] - Session settings loaded from the daemon's config file

pub mod bencode;
pub mod config;
pub mod download;
pub mod lockfile;
pub mod store;

// Re-export the types daemon code touches on every call.
pub use bencode::{BencodeError, Kind, Value};
pub use config::SessionSettings;
pub use download::{Download, RESUME_KEY, RTORRENT_KEY};
pub use lockfile::{Lockfile, LockfileError};
pub use store::{
    create_session_store, LoadCallback, SessionError, SessionRecord, SessionStore,
    SAVE_SKIP_STATIC,
};
