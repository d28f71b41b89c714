// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Session settings loaded from the daemon's config file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Where and how the daemon persists its session.
///
/// `location` selects the backend: a `sqlite:` URI for the database backend,
/// anything else is a session directory path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Backend URI (directory path or `sqlite:<path>`).
    pub location: String,
    /// Explicit lockfile path. Defaults to `rtorrent.lock` inside the
    /// session directory when unset.
    #[serde(default)]
    pub lock_location: Option<String>,
    /// Whether to take the host lock on enable.
    #[serde(default = "default_lock")]
    pub lock: bool,
}

fn default_lock() -> bool {
    true
}

impl SessionSettings {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            lock_location: None,
            lock: true,
        }
    }

    /// Load settings from a JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session settings: {:?}", path))?;
        serde_json::from_str(&content).context("Failed to parse session settings")
    }

    /// Write settings as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize session settings")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write session settings: {:?}", path))
    }
}
