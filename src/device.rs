// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identity, as discovered from the cloud device-list endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mac::Mac;

/// A device as known to the cloud account, independent of any live
/// connection state.
///
/// Identity is the MAC; everything else is descriptive metadata set at
/// discovery time and never mutated by this bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Canonical hardware identifier.
    pub mac: Mac,
    /// Human-assigned display name.
    pub name: String,
    /// Vendor product identifier.
    pub product_id: String,
    /// Vendor model string.
    pub model: String,
    /// Whether the cloud reports the device as currently online.
    pub online: bool,
    /// When the device was registered with the cloud account.
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Creates a device record.
    #[must_use]
    pub fn new(
        mac: Mac,
        name: impl Into<String>,
        product_id: impl Into<String>,
        model: impl Into<String>,
        online: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            mac,
            name: name.into(),
            product_id: product_id.into(),
            model: model.into(),
            online,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_mac() {
        let a = Device::new(
            Mac::parse("7C2C67AB5F0E").unwrap(),
            "Garage",
            "p1",
            "F2400",
            true,
            Utc::now(),
        );
        let b = Device::new(
            Mac::parse("7C2C67AB5F0E").unwrap(),
            "Renamed",
            "p2",
            "F3600",
            false,
            Utc::now(),
        );
        assert_eq!(a.mac, b.mac);
    }

    #[test]
    fn serde_round_trip() {
        let device = Device::new(
            Mac::parse("7C2C67AB5F0E").unwrap(),
            "Garage",
            "p1",
            "F2400",
            true,
            Utc::now(),
        );
        let json = serde_json::to_string(&device).unwrap();
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(device, back);
    }
}
