// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crash-safe JSON file persistence: temp-file-plus-rename, with
//! restrictive Unix permissions.

use std::io;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PersistenceError;

/// Directory mode: owner read/write/execute only.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
/// File mode: owner read/write only.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Ensures `dir` exists with mode 0700 (a no-op on non-Unix targets
/// beyond creating the directory).
pub(crate) fn ensure_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))?;
    }
    Ok(())
}

/// Writes `value` as JSON to `path` atomically: serialize to a sibling
/// temp file, set its mode to 0600, then rename over the destination.
/// A concurrent reader observes either the old file or the fully-written
/// new one, never a torn write.
pub(crate) fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let dir = path.parent().ok_or_else(|| {
        PersistenceError::Corrupt(format!("{} has no parent directory", path.display()))
    })?;
    ensure_dir(dir)?;

    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
    std::fs::write(&tmp_path, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(FILE_MODE))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads and deserializes JSON from `path`.
///
/// Returns `Ok(None)` if the file does not exist. Any I/O or parse
/// failure is reported via `PersistenceError` so callers can treat it as
/// a cache miss without propagating it as fatal.
pub(crate) fn read_atomic<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, PersistenceError> {
    let contents = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::Io(e)),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| PersistenceError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("sample.json");
        write_atomic(&path, &Sample { value: 42 }).unwrap();
        let read: Option<Sample> = read_atomic(&path).unwrap();
        assert_eq!(read, Some(Sample { value: 42 }));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<Sample> = read_atomic(&path).unwrap();
        assert_eq!(read, None);
    }

    #[test]
    fn corrupt_file_is_persistence_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"not json").unwrap();
        let read: Result<Option<Sample>, _> = read_atomic(&path);
        assert!(matches!(read, Err(PersistenceError::Corrupt(_))));
    }

    #[test]
    #[cfg(unix)]
    fn written_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perm.json");
        write_atomic(&path, &Sample { value: 1 }).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
    }
}
