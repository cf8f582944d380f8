// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `fossibot-bridge` - a cloud-to-local MQTT/Modbus bridge for Fossibot
//! portable power stations.
//!
//! Fossibot devices only ever talk to the vendor's cloud: the app drives
//! them over a WeChat mini-program backend that proxies MQTT-over-WebSocket
//! down to the device, which in turn only speaks Modbus-RTU over that
//! pipe. This crate reproduces the cloud side of that conversation well
//! enough to keep a session alive per account, and re-exposes every
//! device's state and controls on a local MQTT broker so nothing has to
//! touch the vendor's servers at read time.
//!
//! # Shape of the bridge
//!
//! - [`cloud`] authenticates against the vendor's four-stage HTTP flow and
//!   holds the resulting MQTT-over-WebSocket session open, escalating
//!   through [`cloud::ReconnectSupervisor`]'s three tiers as failures
//!   accumulate.
//! - [`modbus`] builds and parses the Modbus-RTU frames exchanged once a
//!   session is live: register reads/writes, CRC-16, response framing.
//! - [`command`] models the handful of writes and reads this bridge ever
//!   issues, independent of how they get transported.
//! - [`projector`] turns incoming frames into a coherent per-device state,
//!   arbitrating between the two cloud topics that can both claim to know
//!   a switch's position.
//! - [`dispatcher`] paces outgoing commands per account and keeps them
//!   queued across reconnects rather than dropping them.
//! - [`topic`] is the seam between the vendor's topic namespace and the
//!   local one this bridge publishes under.
//! - [`cache`] persists tokens and device lists to disk so a restart
//!   doesn't require re-authenticating from scratch.
//! - [`config`] is the typed shape the bridge is built from.
//! - [`bridge`] wires all of the above into a single supervised process.
//!
//! # Quick start
//!
//! ```no_run
//! use fossibot_bridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fossibot_bridge::error::Error> {
//!     let text = std::fs::read_to_string("bridge.toml").expect("read config");
//!     let config = Config::from_toml_str(&text).expect("parse config");
//!     config.validate().expect("invalid config");
//!
//!     let shutdown = async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     };
//!     fossibot_bridge::bridge::run(config, shutdown).await
//! }
//! ```

pub mod bridge;
pub mod cache;
pub mod cloud;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod mac;
pub mod modbus;
pub mod projector;
pub mod topic;

pub use command::{Command, ResponseClass};
pub use device::Device;
pub use error::Error;
pub use mac::Mac;
pub use projector::DeviceState;
