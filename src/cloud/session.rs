// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cloud MQTT-over-WebSocket session: one per account, subscribed to
//! every known device's response topics, publishing raw Modbus frames on
//! command.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::mpsc;

use crate::error::{Error, ProtocolError};
use crate::mac::Mac;

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Vendor MQTT-over-WebSocket endpoint port.
pub const CLOUD_WS_PORT: u16 = 8083;
/// Vendor MQTT-over-WebSocket path.
pub const CLOUD_WS_PATH: &str = "/mqtt";
/// MQTT CONNECT password: a fixed shared secret, not the account
/// password.
const MQTT_SHARED_SECRET: &str = "wfu9s9oj8gwklr1cgb6";

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(45);

/// A liveness event surfaced by [`CloudSession`] to the reconnect
/// supervisor.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// CONNACK succeeded and subscriptions were sent.
    Connected,
    /// The connection dropped for any reason.
    Disconnected,
    /// A binary PUBLISH arrived on a device's response topic.
    Frame {
        /// Which device's topic this arrived on.
        mac: Mac,
        /// The raw Modbus-RTU bytes.
        payload: Vec<u8>,
        /// Response topic suffix (`client/04`, `client/data`, `state`, …).
        response_kind: String,
    },
    /// A connection-level failure.
    Error(SessionErrorKind),
}

/// Classifies a session-level failure for the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// CONNACK returned return code 5 (not authorized): the mqtt token
    /// is dead.
    AuthRejected,
    /// Any other transport/protocol failure.
    Transient,
}

/// A connected (or connecting) cloud MQTT-over-WebSocket session for one
/// account.
pub struct CloudSession {
    client: AsyncClient,
    events: mpsc::Receiver<SessionEvent>,
}

impl CloudSession {
    /// Opens a WebSocket connection to `host` and runs the MQTT 3.1.1
    /// handshake, subscribing to every device in `macs`.
    ///
    /// Returns once CONNACK has been received (or rejected/timed out);
    /// the event loop continues running in a background task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthRejected`] if CONNACK return code is 5, or
    /// [`Error::TransientNet`] if the connection does not establish
    /// within its timeout.
    pub async fn connect(
        host: &str,
        mqtt_token: &str,
        macs: &[Mac],
    ) -> Result<Self, Error> {
        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("bridge_{}_{counter}", std::process::id());

        let mut options = MqttOptions::new(client_id, host, CLOUD_WS_PORT);
        options.set_credentials(mqtt_token, MQTT_SHARED_SECRET);
        options.set_clean_session(true);
        options.set_keep_alive(KEEP_ALIVE);

        let ws_url = format!("ws://{host}:{CLOUD_WS_PORT}{CLOUD_WS_PATH}");
        options.set_transport(Transport::Ws(ws_url.into()));

        let (client, event_loop) = AsyncClient::new(options, 64);

        for mac in macs {
            let topic = format!("{mac}/device/response/+");
            client
                .subscribe(&topic, QoS::AtMostOnce)
                .await
                .map_err(|e| Error::TransientNet(e.to_string()))?;
        }

        let (tx, rx) = mpsc::channel(256);
        let connect_result = tokio::time::timeout(
            WS_CONNECT_TIMEOUT + MQTT_CONNECT_TIMEOUT,
            wait_for_connack(event_loop, tx),
        )
        .await
        .map_err(|_| Error::TransientNet("cloud session connect timed out".into()))??;

        tokio::spawn(connect_result);

        Ok(Self { client, events: rx })
    }

    /// Returns a cheaply-cloneable handle that can publish on this
    /// session without holding its event receiver.
    ///
    /// The command dispatcher holds onto this handle rather than the
    /// [`CloudSession`] itself, since only the bridge's per-account task
    /// drains `next_event`.
    #[must_use]
    pub fn publisher(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Publishes raw Modbus frame bytes to a device's command topic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransientNet`] if the publish cannot be queued
    /// (the underlying connection is down).
    pub async fn publish(&self, mac: Mac, frame: &[u8]) -> Result<(), Error> {
        let topic = format!("{mac}/client/request/data");
        self.client
            .publish(topic, QoS::AtMostOnce, false, frame)
            .await
            .map_err(|e| Error::TransientNet(e.to_string()))
    }

    /// Waits for the next liveness/frame event.
    ///
    /// Returns `None` once the event loop task has exited (the session
    /// is no longer usable; reconnect).
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Gracefully disconnects.
    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// Drives `event_loop` until CONNACK resolves, forwarding the outcome
/// (and then all subsequent events) on `tx`. Returns a future to spawn
/// that continues pumping the loop after the initial handshake.
async fn wait_for_connack(
    mut event_loop: EventLoop,
    tx: mpsc::Sender<SessionEvent>,
) -> Result<impl std::future::Future<Output = ()>, Error> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == rumqttc::ConnectReturnCode::RefusedNotAuthorized {
                    return Err(Error::AuthRejected(
                        "CONNACK return code 5 (not authorized)".into(),
                    ));
                }
                if ack.code != rumqttc::ConnectReturnCode::Success {
                    return Err(Error::TransientNet(format!("CONNACK rejected: {:?}", ack.code)));
                }
                let _ = tx.send(SessionEvent::Connected).await;
                return Ok(pump_events(event_loop, tx));
            }
            Ok(_) => continue,
            Err(e) => return Err(classify_connection_error(e)),
        }
    }
}

/// Runs for the lifetime of the connection, translating incoming PUBLISH
/// packets into [`SessionEvent::Frame`] and surfacing disconnects.
async fn pump_events(mut event_loop: EventLoop, tx: mpsc::Sender<SessionEvent>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some((mac, response_kind)) = parse_response_topic(&publish.topic) {
                    let event = SessionEvent::Frame {
                        mac,
                        payload: publish.payload.to_vec(),
                        response_kind,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                } else {
                    tracing::debug!(topic = %publish.topic, "ignoring publish on unparseable topic");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = tx.send(SessionEvent::Disconnected).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "cloud session event loop ended");
                let _ = tx.send(SessionEvent::Error(SessionErrorKind::Transient)).await;
                let _ = tx.send(SessionEvent::Disconnected).await;
                return;
            }
        }
    }
}

/// Publishes raw Modbus frame bytes on an already-cloned publisher
/// handle. Free function so the command dispatcher can hold only an
/// `AsyncClient` (via [`CloudSession::publisher`]) without the rest of
/// the session.
///
/// # Errors
///
/// Returns [`Error::TransientNet`] if the publish cannot be queued.
pub async fn publish_frame(client: &AsyncClient, mac: Mac, frame: &[u8]) -> Result<(), Error> {
    let topic = format!("{mac}/client/request/data");
    client
        .publish(topic, QoS::AtMostOnce, false, frame)
        .await
        .map_err(|e| Error::TransientNet(e.to_string()))
}

fn parse_response_topic(topic: &str) -> Option<(Mac, String)> {
    let mut parts = topic.splitn(4, '/');
    let mac_str = parts.next()?;
    let device = parts.next()?;
    let response = parts.next()?;
    if device != "device" || response != "response" {
        return None;
    }
    let rest: Vec<&str> = parts.next().into_iter().collect();
    let response_kind = rest.join("/");
    let mac = Mac::parse(mac_str).ok()?;
    Some((mac, response_kind))
}

/// Transport/protocol-level errors below CONNACK are always treated as
/// transient; the one case that means the mqtt token is dead (CONNACK
/// return code 5) is inspected directly where CONNACK is handled, not
/// here.
fn classify_connection_error(err: ConnectionError) -> Error {
    Error::TransientNet(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_04_topic() {
        let (mac, kind) = parse_response_topic("7C2C67AB5F0E/device/response/client/04").unwrap();
        assert_eq!(mac.as_str(), "7C2C67AB5F0E");
        assert_eq!(kind, "client/04");
    }

    #[test]
    fn parses_client_data_topic() {
        let (_, kind) = parse_response_topic("7C2C67AB5F0E/device/response/client/data").unwrap();
        assert_eq!(kind, "client/data");
    }

    #[test]
    fn parses_state_topic() {
        let (_, kind) = parse_response_topic("7C2C67AB5F0E/device/response/state").unwrap();
        assert_eq!(kind, "state");
    }

    #[test]
    fn rejects_malformed_topic() {
        assert!(parse_response_topic("garbage").is_none());
        assert!(parse_response_topic("BADMAC/device/response/state").is_none());
        assert!(parse_response_topic("7C2C67AB5F0E/client/request/data").is_none());
    }
}
