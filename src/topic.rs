// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bidirectional translation between the cloud's per-device topic
//! namespace and the local broker's `fossibot/` namespace.
//!
//! Pure functions only: no I/O, no state. [`crate::cloud::session`]
//! parses cloud response topics for its own routing needs; this module
//! is the seam the bridge supervisor uses to move between the two
//! namespaces.

use crate::mac::Mac;

/// Retained bridge-wide status topic.
pub const BRIDGE_STATUS_TOPIC: &str = "fossibot/bridge/status";

/// The local topic a device's state snapshot is published to.
#[must_use]
pub fn local_state_topic(mac: Mac) -> String {
    format!("fossibot/{mac}/state")
}

/// The local topic a device's commands are subscribed on.
#[must_use]
pub fn local_command_topic(mac: Mac) -> String {
    format!("fossibot/{mac}/command")
}

/// The cloud topic a device's commands are published to.
#[must_use]
pub fn cloud_request_topic(mac: Mac) -> String {
    format!("{mac}/client/request/data")
}

/// The cloud subscription filter for a device's responses.
#[must_use]
pub fn cloud_response_filter(mac: Mac) -> String {
    format!("{mac}/device/response/+")
}

/// Extracts and validates the MAC from a local `fossibot/{MAC}/command`
/// topic. Returns `None` for any other shape, including a mismatched
/// literal segment or malformed MAC.
#[must_use]
pub fn parse_local_command_topic(topic: &str) -> Option<Mac> {
    let mut parts = topic.splitn(3, '/');
    if parts.next()? != "fossibot" {
        return None;
    }
    let mac_str = parts.next()?;
    if parts.next()? != "command" {
        return None;
    }
    Mac::parse(mac_str).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_state_topic_is_namespaced_by_mac() {
        let mac = Mac::parse("7C2C67AB5F0E").unwrap();
        assert_eq!(local_state_topic(mac), "fossibot/7C2C67AB5F0E/state");
    }

    #[test]
    fn cloud_request_topic_targets_client_request_data() {
        let mac = Mac::parse("7C2C67AB5F0E").unwrap();
        assert_eq!(cloud_request_topic(mac), "7C2C67AB5F0E/client/request/data");
    }

    #[test]
    fn parses_valid_command_topic() {
        let mac = parse_local_command_topic("fossibot/7C2C67AB5F0E/command").unwrap();
        assert_eq!(mac.as_str(), "7C2C67AB5F0E");
    }

    #[test]
    fn rejects_wrong_namespace() {
        assert!(parse_local_command_topic("other/7C2C67AB5F0E/command").is_none());
    }

    #[test]
    fn rejects_wrong_suffix() {
        assert!(parse_local_command_topic("fossibot/7C2C67AB5F0E/state").is_none());
    }

    #[test]
    fn rejects_bad_mac() {
        assert!(parse_local_command_topic("fossibot/BADMAC/command").is_none());
    }
}
