// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent, crash-safe caches for tokens and discovered devices.
//!
//! Both caches share the same on-disk discipline: one JSON file per
//! account (named by an MD5 hash of the account email), written via a
//! temp-file-plus-rename so a reader never observes a torn write, under
//! a 0700 directory with 0600 files.

mod atomic_file;
mod device_cache;
mod token_cache;

pub use device_cache::DeviceCache;
pub use token_cache::{CachedToken, TokenCache, TokenStage, token_cache_path};
