// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The vendor cloud side: authentication, the MQTT-over-WebSocket
//! session, and reconnect escalation.

pub mod auth;
pub mod reconnect;
pub mod session;

pub use auth::{AnonymousToken, ClientInfo, CloudAuthenticator, LoginToken, MqttToken};
pub use reconnect::{ReconnectSupervisor, Terminal, Tier};
pub use session::{CloudSession, SessionErrorKind, SessionEvent, publish_frame};
