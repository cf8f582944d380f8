// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-account device-list persistence with TTL.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::atomic_file::{read_atomic, write_atomic};
use super::token_cache::token_cache_path;
use crate::device::Device;
use crate::error::PersistenceError;

#[derive(Debug, Serialize, Deserialize)]
struct DeviceFile {
    cached_at: i64,
    devices: Vec<Device>,
}

/// Durable per-account device-list cache.
///
/// Files are named `devices_{md5(email)}.json`, mirroring
/// [`super::TokenCache`]'s `tokens_{md5(email)}.json` naming.
#[derive(Debug, Clone)]
pub struct DeviceCache {
    directory: PathBuf,
    ttl: Duration,
}

impl DeviceCache {
    /// Default time-to-live before a cached device list is considered
    /// stale.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

    /// Creates a device cache rooted at `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Overrides the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn path_for(&self, email: &str) -> PathBuf {
        // Same hash scheme as the token cache, different filename prefix.
        let tokens_path = token_cache_path(&self.directory, email);
        let hash = tokens_path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("tokens_"))
            .unwrap_or_default();
        self.directory.join(format!("devices_{hash}.json"))
    }

    /// Returns the cached device list, or `None` if absent, past its
    /// TTL, or unreadable/corrupt.
    pub fn get(&self, email: &str) -> Option<Vec<Device>> {
        let file: DeviceFile = match read_atomic(&self.path_for(email)) {
            Ok(Some(file)) => file,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(email, error = %e, "device cache read failed, treating as miss");
                return None;
            }
        };
        let now = now_unix();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(file.cached_at) > ttl {
            return None;
        }
        Some(file.devices)
    }

    /// Persists a device list.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the cache directory or file
    /// cannot be written.
    pub fn put(&self, email: &str, devices: Vec<Device>) -> Result<(), PersistenceError> {
        let file = DeviceFile {
            cached_at: now_unix(),
            devices,
        };
        write_atomic(&self.path_for(email), &file)
    }

    /// Invalidates the cached list for `email`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the cache file exists but cannot
    /// be rewritten.
    pub fn invalidate(&self, email: &str) -> Result<(), PersistenceError> {
        // cached_at of 0 guarantees a miss under any configured TTL.
        let file = DeviceFile {
            cached_at: 0,
            devices: Vec::new(),
        };
        write_atomic(&self.path_for(email), &file)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::Mac;
    use chrono::Utc;

    fn cache() -> (tempfile::TempDir, DeviceCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::new(dir.path());
        (dir, cache)
    }

    fn sample_device() -> Device {
        Device::new(
            Mac::parse("7C2C67AB5F0E").unwrap(),
            "Garage",
            "p1",
            "F2400",
            true,
            Utc::now(),
        )
    }

    #[test]
    fn miss_when_absent() {
        let (_dir, cache) = cache();
        assert!(cache.get("a@example.com").is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, cache) = cache();
        cache.put("a@example.com", vec![sample_device()]).unwrap();
        let devices = cache.get("a@example.com").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mac, sample_device().mac);
    }

    #[test]
    fn stale_past_ttl_is_miss() {
        let (_dir, cache) = cache();
        let cache = cache.with_ttl(Duration::from_secs(0));
        cache.put("a@example.com", vec![sample_device()]).unwrap();
        // TTL of 0 means anything already written is stale immediately
        // (now - cached_at >= 0 is always true once any time passes).
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get("a@example.com").is_none());
    }

    #[test]
    fn invalidate_clears_entry() {
        let (_dir, cache) = cache();
        cache.put("a@example.com", vec![sample_device()]).unwrap();
        cache.invalidate("a@example.com").unwrap();
        assert!(cache.get("a@example.com").is_none());
    }

    #[test]
    fn token_and_device_files_share_account_hash() {
        let dir = tempfile::tempdir().unwrap();
        let device_cache = DeviceCache::new(dir.path());
        let token_path = token_cache_path(dir.path(), "a@example.com");
        let device_path = device_cache.path_for("a@example.com");
        let token_hash = token_path.file_stem().unwrap().to_str().unwrap();
        let device_hash = device_path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(
            token_hash.strip_prefix("tokens_"),
            device_hash.strip_prefix("devices_")
        );
    }
}
