// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! The download handle the daemon hands to the session store.
//!
//! The store does not own downloads; the daemon's download list does. What
//! the store needs from one is small: the content hash that keys its
//! records, the root bencode document holding the `rtorrent` and
//! `libtorrent_resume` subtrees, and the four live counters sampled into
//! every save.

use crate::bencode::Value;

/// Map key of the store-private subtree in the root document.
pub const RTORRENT_KEY: &str = "rtorrent";

/// Map key of the transfer-engine resume subtree in the root document.
pub const RESUME_KEY: &str = "libtorrent_resume";

/// A managed download, as seen by the session store.
#[derive(Debug, Clone)]
pub struct Download {
    hash: [u8; 20],
    root: Value,
    completed_chunks: u32,
    wanted_chunks: u32,
    uploaded_total: u64,
    downloaded_total: u64,
}

impl Download {
    /// Wrap a root document. Non-map roots are replaced with an empty map;
    /// the `rtorrent` and `libtorrent_resume` subtrees are created when
    /// missing so the save path always has both bases.
    pub fn new(hash: [u8; 20], root: Value) -> Self {
        let mut root = if root.is_map() { root } else { Value::map() };
        for key in [RTORRENT_KEY, RESUME_KEY] {
            if !root.get_key(key).map(Value::is_map).unwrap_or(false) {
                root.insert_key(key, Value::map());
            }
        }
        Self {
            hash,
            root,
            completed_chunks: 0,
            wanted_chunks: 0,
            uploaded_total: 0,
            downloaded_total: 0,
        }
    }

    /// Rebuild a download from the three hydrated session documents.
    pub fn from_parts(hash: [u8; 20], main: Value, rtorrent: Value, libtorrent_resume: Value) -> Self {
        let mut d = Self::new(hash, main);
        if rtorrent.is_map() {
            d.root.insert_key(RTORRENT_KEY, rtorrent);
        }
        if libtorrent_resume.is_map() {
            d.root.insert_key(RESUME_KEY, libtorrent_resume);
        }
        d
    }

    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    /// The hash as 40 uppercase hex characters, the form used for filenames
    /// and database keys.
    pub fn hash_hex(&self) -> String {
        let mut out = String::with_capacity(40);
        for b in self.hash {
            out.push_str(&format!("{:02X}", b));
        }
        out
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    /// The named session subtree of the root document.
    pub fn base(&self, key: &str) -> &Value {
        self.root.get_key(key).expect("session base exists by construction")
    }

    pub fn base_mut(&mut self, key: &str) -> &mut Value {
        self.root.get_key_mut(key).expect("session base exists by construction")
    }

    pub fn completed_chunks(&self) -> u32 {
        self.completed_chunks
    }

    pub fn wanted_chunks(&self) -> u32 {
        self.wanted_chunks
    }

    pub fn uploaded_total(&self) -> u64 {
        self.uploaded_total
    }

    pub fn downloaded_total(&self) -> u64 {
        self.downloaded_total
    }

    /// Update the chunk counters the daemon tracks for this download.
    pub fn record_progress(&mut self, completed_chunks: u32, wanted_chunks: u32) {
        self.completed_chunks = completed_chunks;
        self.wanted_chunks = wanted_chunks;
    }

    /// Update the lifetime transfer totals.
    pub fn record_transfer(&mut self, uploaded_total: u64, downloaded_total: u64) {
        self.uploaded_total = uploaded_total;
        self.downloaded_total = downloaded_total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_is_uppercase_and_40_chars() {
        let mut hash = [0u8; 20];
        hash[0] = 0xAB;
        hash[19] = 0x01;
        let d = Download::new(hash, Value::map());
        let hex = d.hash_hex();
        assert_eq!(hex.len(), 40);
        assert!(hex.starts_with("AB"));
        assert!(hex.ends_with("01"));
        assert_eq!(hex, hex.to_uppercase());
    }

    #[test]
    fn test_new_creates_session_bases() {
        let d = Download::new([0u8; 20], Value::map());
        assert!(d.base(RTORRENT_KEY).is_map());
        assert!(d.base(RESUME_KEY).is_map());
    }

    #[test]
    fn test_new_replaces_non_map_root() {
        let d = Download::new([0u8; 20], Value::int(3));
        assert!(d.root().is_map());
    }

    #[test]
    fn test_from_parts_attaches_subtrees() {
        let mut main = Value::map();
        main.insert_key("info", Value::map());
        let mut rtorrent = Value::map();
        rtorrent.insert_key("custom", Value::string("x"));
        let resume = Value::map();

        let d = Download::from_parts([0u8; 20], main, rtorrent, resume);
        assert!(d.root().has_key("info"));
        assert_eq!(
            d.base(RTORRENT_KEY).get_key("custom").and_then(Value::as_str),
            Some("x")
        );
    }
}
