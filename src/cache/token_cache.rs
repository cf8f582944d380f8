// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-account, per-stage token persistence with TTL and safety margin.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use super::atomic_file::{read_atomic, write_atomic};
use crate::error::PersistenceError;

/// The three staged tokens in the authentication flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStage {
    /// Short-lived, unauthenticated token (~10 min).
    Anonymous,
    /// User-bound login token.
    Login,
    /// MQTT JWT (~3 days).
    Mqtt,
}

/// A staged token as persisted on disk: the opaque value, its absolute
/// expiry, and when it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    /// The opaque token string.
    pub token: String,
    /// Absolute expiry, Unix seconds.
    pub expires_at: i64,
    /// When this entry was written, Unix seconds.
    pub cached_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    #[serde(default)]
    anonymous: Option<CachedToken>,
    #[serde(default)]
    login: Option<CachedToken>,
    #[serde(default)]
    mqtt: Option<CachedToken>,
}

impl TokenFile {
    fn slot(&self, stage: TokenStage) -> &Option<CachedToken> {
        match stage {
            TokenStage::Anonymous => &self.anonymous,
            TokenStage::Login => &self.login,
            TokenStage::Mqtt => &self.mqtt,
        }
    }

    fn slot_mut(&mut self, stage: TokenStage) -> &mut Option<CachedToken> {
        match stage {
            TokenStage::Anonymous => &mut self.anonymous,
            TokenStage::Login => &mut self.login,
            TokenStage::Mqtt => &mut self.mqtt,
        }
    }
}

/// Durable per-account token cache.
///
/// Files are named `tokens_{md5(email)}.json` under the configured cache
/// directory, matching the `devices_{md5(email)}.json` naming used by
/// [`super::DeviceCache`].
#[derive(Debug, Clone)]
pub struct TokenCache {
    directory: PathBuf,
    safety_margin: Duration,
    max_token_ttl: Duration,
}

impl TokenCache {
    /// Default safety margin subtracted from `expires_at` when
    /// evaluating usability.
    pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(300);
    /// Default ceiling on any cached expiry, regardless of what the
    /// server claimed.
    pub const DEFAULT_MAX_TOKEN_TTL: Duration = Duration::from_secs(86_400);

    /// Creates a token cache rooted at `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            safety_margin: Self::DEFAULT_SAFETY_MARGIN,
            max_token_ttl: Self::DEFAULT_MAX_TOKEN_TTL,
        }
    }

    /// Overrides the safety margin.
    #[must_use]
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Overrides the max-TTL ceiling.
    #[must_use]
    pub fn with_max_token_ttl(mut self, ttl: Duration) -> Self {
        self.max_token_ttl = ttl;
        self
    }

    fn path_for(&self, email: &str) -> PathBuf {
        self.directory.join(format!("tokens_{}.json", account_hash(email)))
    }

    fn load(&self, email: &str) -> Result<TokenFile, PersistenceError> {
        Ok(read_atomic(&self.path_for(email))?.unwrap_or_default())
    }

    /// Returns the cached token for `stage`, or `None` if absent, expired
    /// (within the safety margin), or unreadable/corrupt.
    ///
    /// Corruption is treated identically to a miss: callers never see a
    /// `PersistenceError` from this method.
    pub fn get(&self, email: &str, stage: TokenStage) -> Option<CachedToken> {
        let file = match self.load(email) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(email, ?stage, error = %e, "token cache read failed, treating as miss");
                return None;
            }
        };
        let entry = file.slot(stage).clone()?;
        let now = now_unix();
        let margin = i64::try_from(self.safety_margin.as_secs()).unwrap_or(i64::MAX);
        if entry.expires_at <= now.saturating_add(margin) {
            return None;
        }
        Some(entry)
    }

    /// Persists a token for `stage`, capping `expires_at` by the
    /// configured `max_token_ttl` ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the cache directory or file
    /// cannot be written.
    pub fn put(
        &self,
        email: &str,
        stage: TokenStage,
        token: impl Into<String>,
        expires_at: SystemTime,
    ) -> Result<(), PersistenceError> {
        let now = now_unix();
        let ceiling = now.saturating_add(
            i64::try_from(self.max_token_ttl.as_secs()).unwrap_or(i64::MAX),
        );
        let requested = expires_at
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(now);
        let capped = requested.min(ceiling);

        let mut file = self.load(email)?;
        *file.slot_mut(stage) = Some(CachedToken {
            token: token.into(),
            expires_at: capped,
            cached_at: now,
        });
        write_atomic(&self.path_for(email), &file)
    }

    /// Invalidates one stage, or all stages if `stage` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the cache file exists but cannot
    /// be rewritten.
    pub fn invalidate(
        &self,
        email: &str,
        stage: Option<TokenStage>,
    ) -> Result<(), PersistenceError> {
        let mut file = self.load(email)?;
        match stage {
            Some(stage) => *file.slot_mut(stage) = None,
            None => file = TokenFile::default(),
        }
        write_atomic(&self.path_for(email), &file)
    }
}

fn account_hash(email: &str) -> String {
    let digest = Md5::digest(email.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Resolves the path a given account's token cache file would live at,
/// without requiring a full [`TokenCache`] (used by diagnostics/tests).
#[must_use]
pub fn token_cache_path(directory: &Path, email: &str) -> PathBuf {
    directory.join(format!("tokens_{}.json", account_hash(email)))
}
