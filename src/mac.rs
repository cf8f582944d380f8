// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device MAC address identity.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A device's canonical hardware identifier: 12 hex characters, no
/// separators, uppercase.
///
/// This is the identity of a [`crate::device::Device`] and the key used
/// to route cloud and local MQTT topics to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mac([u8; 12]);

/// Errors validating a MAC address string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacError {
    /// Input was not exactly 12 characters once separators were stripped.
    #[error("MAC must be 12 hex characters, got {0}")]
    WrongLength(usize),

    /// Input contained a non-hex-digit character.
    #[error("MAC contains non-hex character: {0:?}")]
    NotHex(char),
}

impl Mac {
    /// Parses a MAC from a string, accepting `:` or `-` separators and
    /// any case, and normalizing to the canonical uppercase, separator-free
    /// form.
    pub fn parse(input: &str) -> Result<Self, MacError> {
        let stripped: String = input.chars().filter(|c| *c != ':' && *c != '-').collect();
        if stripped.chars().count() != 12 {
            return Err(MacError::WrongLength(stripped.chars().count()));
        }
        let mut bytes = [0u8; 12];
        for (i, c) in stripped.chars().enumerate() {
            if !c.is_ascii_hexdigit() {
                return Err(MacError::NotHex(c));
            }
            bytes[i] = c.to_ascii_uppercase() as u8;
        }
        Ok(Self(bytes))
    }

    /// Returns the canonical 12-character uppercase representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // SAFETY-free: bytes are guaranteed ASCII hex digits by `parse`.
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self.as_str())
    }
}

impl FromStr for Mac {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Mac {
    type Error = MacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Mac> for String {
    fn from(mac: Mac) -> Self {
        mac.as_str().to_string()
    }
}
