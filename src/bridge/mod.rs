// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide bridge supervisor (§4.11): owns the local broker
//! connection, one cloud session per enabled account, and wires local
//! commands through to the cloud and cloud state back to the local
//! namespace.
//!
//! This is the top of the dependency graph; everything else in this
//! crate is a leaf it composes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};

use crate::cache::{DeviceCache, TokenCache};
use crate::cloud::{CloudAuthenticator, CloudSession, ReconnectSupervisor, SessionErrorKind, SessionEvent, Tier};
use crate::command::{Command, ResponseClass};
use crate::config::{AccountConfig, Config};
use crate::device::Device;
use crate::dispatcher::CommandDispatcher;
use crate::error::Error;
use crate::mac::Mac;
use crate::modbus::{FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, parse_read_registers_response};
use crate::projector::{Projector, TopicKind};
use crate::topic;

/// The vendor's serverless auth endpoint.
const CLOUD_AUTH_URL: &str = "https://api.next.bspapp.com/client";
/// Vendor space id, fixed per the cloud account type this bridge targets.
const CLOUD_SPACE_ID: &str = "mp-6c382a98-49b4-4cbf-ca5f-AAAAAAAAAA";
/// Vendor MQTT-over-WebSocket host (distinct from the HTTP auth host).
const CLOUD_WS_HOST: &str = "mqtt.sydpower.com";

/// Register write targets for the four boolean output-switch actions a
/// local command can request. Values arbitrary nonzero writes the
/// device's firmware maps back onto the register-41 bitfield.
const REGISTER_USB_SWITCH: u16 = 24;
const REGISTER_AC_SWITCH: u16 = 23;
const REGISTER_DC_SWITCH: u16 = 25;
const REGISTER_LED_SWITCH: u16 = 26;

/// Shared, process-wide bridge state: every device's projected state and
/// the account that owns it.
struct Shared {
    projector: Mutex<Projector>,
    mac_owner: RwLock<HashMap<Mac, CommandDispatcher>>,
    /// Outlet for state changes the projector produces. The projector
    /// itself never touches the local broker; a dedicated task drains
    /// this and performs the publish, the same channel-owned-by-a-task
    /// shape the command dispatcher uses for outbound cloud frames.
    state_changes: mpsc::UnboundedSender<(Mac, crate::projector::DeviceState)>,
}

/// The local command payload accepted on `fossibot/{MAC}/command`
/// (§4.11, §6), including the legacy `usb_on`/`usb_off` spellings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LocalCommand {
    Structured { action: String, value: bool },
    Legacy { action: LegacyAction },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum LegacyAction {
    UsbOn,
    UsbOff,
    AcOn,
    AcOff,
    DcOn,
    DcOff,
    LedOn,
    LedOff,
}

impl LocalCommand {
    fn resolve(self) -> Result<(&'static str, bool), String> {
        match self {
            Self::Structured { action, value } => match action.as_str() {
                "usb" | "ac" | "dc" | "led" => {
                    let normalized = match action.as_str() {
                        "usb" => "usb",
                        "ac" => "ac",
                        "dc" => "dc",
                        _ => "led",
                    };
                    Ok((normalized, value))
                }
                other => Err(other.to_string()),
            },
            Self::Legacy { action } => Ok(match action {
                LegacyAction::UsbOn => ("usb", true),
                LegacyAction::UsbOff => ("usb", false),
                LegacyAction::AcOn => ("ac", true),
                LegacyAction::AcOff => ("ac", false),
                LegacyAction::DcOn => ("dc", true),
                LegacyAction::DcOff => ("dc", false),
                LegacyAction::LedOn => ("led", true),
                LegacyAction::LedOff => ("led", false),
            }),
        }
    }
}

fn switch_command(action: &str, value: bool) -> Result<Command, Error> {
    let register = match action {
        "usb" => REGISTER_USB_SWITCH,
        "ac" => REGISTER_AC_SWITCH,
        "dc" => REGISTER_DC_SWITCH,
        "led" => REGISTER_LED_SWITCH,
        other => return Err(Error::BadInput(crate::error::BadInput::UnrecognizedAction(other.to_string()))),
    };
    Command::write_single_register(register, u16::from(value), ResponseClass::Immediate)
        .map_err(Error::BadInput)
}

/// Runs the bridge for the lifetime of the process: connects the local
/// broker, starts one task per enabled account, and drains local command
/// traffic until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error only if the local broker connection cannot be
/// established at all; once running, per-account failures are isolated
/// and logged rather than propagated.
pub async fn run(config: Config, shutdown: impl std::future::Future<Output = ()>) -> Result<(), Error> {
    let (state_tx, state_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        projector: Mutex::new(Projector::new()),
        mac_owner: RwLock::new(HashMap::new()),
        state_changes: state_tx,
    });

    let mut options = MqttOptions::new(
        config.mosquitto.client_id.clone(),
        config.mosquitto.host.clone(),
        config.mosquitto.port,
    );
    if let (Some(user), Some(pass)) = (&config.mosquitto.username, &config.mosquitto.password) {
        options.set_credentials(user, pass);
    }
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        topic::BRIDGE_STATUS_TOPIC,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    let (local_client, mut local_event_loop) = AsyncClient::new(options, 256);
    local_client
        .subscribe("fossibot/+/command", QoS::AtMostOnce)
        .await
        .map_err(|e| Error::TransientNet(e.to_string()))?;
    local_client
        .publish(topic::BRIDGE_STATUS_TOPIC, QoS::AtLeastOnce, true, "online")
        .await
        .map_err(|e| Error::TransientNet(e.to_string()))?;

    for account in config.accounts.iter().filter(|a| a.enabled).cloned() {
        let shared = Arc::clone(&shared);
        let cache_dir = config.cache.directory.clone();
        let token_ttl_safety_margin = Duration::from_secs(config.cache.token_ttl_safety_margin);
        let device_list_ttl = Duration::from_secs(config.cache.device_list_ttl);
        let max_token_ttl = Duration::from_secs(config.cache.max_token_ttl);
        tokio::spawn(async move {
            let token_cache = TokenCache::new(cache_dir.clone())
                .with_safety_margin(token_ttl_safety_margin)
                .with_max_token_ttl(max_token_ttl);
            let device_cache = DeviceCache::new(cache_dir).with_ttl(device_list_ttl);
            run_account(account, shared, token_cache, device_cache).await;
        });
    }

    let status_interval = Duration::from_secs(config.bridge.status_publish_interval.max(1));
    let status_shared = Arc::clone(&shared);
    let status_client = local_client.clone();
    tokio::spawn(async move {
        publish_status_loop(status_shared, status_client, status_interval).await;
    });

    let state_publish_client = local_client.clone();
    tokio::spawn(async move {
        run_state_publisher(state_rx, state_publish_client).await;
    });

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => {
                let _ = local_client.disconnect().await;
                return Ok(());
            }
            event = local_event_loop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_local_publish(&shared, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "local broker connection error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
}

fn handle_local_publish(shared: &Shared, topic_str: &str, payload: &[u8]) {
    let Some(mac) = topic::parse_local_command_topic(topic_str) else {
        return;
    };
    let parsed: Result<LocalCommand, _> = serde_json::from_slice(payload);
    let Ok(local_command) = parsed else {
        tracing::warn!(%mac, "malformed local command payload");
        return;
    };
    let (action, value) = match local_command.resolve() {
        Ok(pair) => pair,
        Err(action) => {
            tracing::warn!(%mac, action, "unrecognized local command action");
            return;
        }
    };
    let command = match switch_command(action, value) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::warn!(%mac, error = %e, "rejected local command");
            return;
        }
    };
    let dispatcher = shared.mac_owner.read().get(&mac).cloned();
    match dispatcher {
        Some(dispatcher) => dispatcher.enqueue(mac, command),
        None => tracing::warn!(%mac, "command for unknown device, no owning account"),
    }
}

async fn publish_status_loop(shared: Arc<Shared>, client: AsyncClient, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshots: Vec<(Mac, crate::projector::DeviceState)> = {
            let projector = shared.projector.lock();
            projector
                .snapshots()
                .map(|(mac, state)| (*mac, state.clone()))
                .collect()
        };
        for (mac, state) in snapshots {
            let Ok(json) = serde_json::to_vec(&state) else {
                continue;
            };
            let _ = client
                .publish(topic::local_state_topic(mac), QoS::AtMostOnce, false, json)
                .await;
        }
    }
}

/// Drives one account's full lifecycle for the life of the process:
/// authenticate, connect, drain events, and recover through the
/// three-tier reconnect supervisor on any loss.
async fn run_account(
    account: AccountConfig,
    shared: Arc<Shared>,
    token_cache: TokenCache,
    device_cache: DeviceCache,
) {
    let Ok(authenticator) = CloudAuthenticator::new(CLOUD_AUTH_URL, CLOUD_SPACE_ID) else {
        tracing::error!(email = %account.email, "failed to build cloud authenticator");
        return;
    };
    let mut reconnect = ReconnectSupervisor::default();

    // One queue per account, persisting across reconnects: commands
    // enqueued while the session is down stay queued and drain once
    // `publisher_tx` carries a live client again (§4.9).
    let (publisher_tx, publisher_rx) = watch::channel(None);
    let shared_for_arm = Arc::clone(&shared);
    let dispatcher = CommandDispatcher::spawn(publisher_rx, move |mac| {
        shared_for_arm.projector.lock().arm_command_expectation(mac);
    });

    // Decided by the previous iteration's `next_tier` call; `None` only
    // for the very first attempt, which always runs cache-driven (no
    // prior failure to recover from).
    let mut tier_hint: Option<Tier> = None;

    loop {
        let result = connect_and_drain(
            &account,
            &authenticator,
            &token_cache,
            &device_cache,
            &shared,
            &dispatcher,
            &publisher_tx,
            &mut reconnect,
            tier_hint,
        )
        .await;

        let credentials_rejected = matches!(result, Err(SessionErrorKind::AuthRejected));
        if credentials_rejected {
            let _ = token_cache.invalidate(&account.email, Some(crate::cache::TokenStage::Login));
            let _ = token_cache.invalidate(&account.email, Some(crate::cache::TokenStage::Mqtt));
        }

        let tokens_within_margin = token_cache.get(&account.email, crate::cache::TokenStage::Mqtt).is_some();
        let tier = match reconnect.next_tier(tokens_within_margin, credentials_rejected) {
            Ok(tier) => tier,
            Err(_terminal) => {
                tracing::error!(email = %account.email, "reconnect attempts exhausted, account quiescent");
                return;
            }
        };
        tracing::info!(email = %account.email, ?tier, "recovering cloud session");
        tier_hint = Some(tier);

        tokio::time::sleep(reconnect.current_backoff_delay()).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn connect_and_drain(
    account: &AccountConfig,
    authenticator: &CloudAuthenticator,
    token_cache: &TokenCache,
    device_cache: &DeviceCache,
    shared: &Arc<Shared>,
    dispatcher: &CommandDispatcher,
    publisher_tx: &watch::Sender<Option<AsyncClient>>,
    reconnect: &mut ReconnectSupervisor,
    tier_hint: Option<Tier>,
) -> Result<(), SessionErrorKind> {
    // Tier 2 (full re-auth) means the prior attempt's cached tokens
    // didn't actually recover the session — don't just let stage 1/2
    // TTLs coast through on a cache hit, force every stage to refetch.
    // Tier 3 (backoff) is still recovering from the same failure, so it
    // keeps forcing the same invalidation on each attempt.
    if matches!(tier_hint, Some(Tier::FullReauth | Tier::Backoff)) {
        let _ = token_cache.invalidate(&account.email, None);
    }

    let anonymous = authenticator
        .anonymous(&account.email, token_cache)
        .await
        .map_err(classify_error)?;
    let login = authenticator
        .login(&account.email, &account.password, &anonymous, token_cache)
        .await
        .map_err(classify_error)?;
    let mqtt_token = authenticator
        .mqtt_token(&account.email, &anonymous, &login, token_cache)
        .await
        .map_err(classify_error)?;
    let devices = authenticator
        .devices(&account.email, &anonymous, device_cache)
        .await
        .map_err(classify_error)?;

    let macs: Vec<Mac> = devices.iter().map(|d: &Device| d.mac).collect();
    let mut session = CloudSession::connect(CLOUD_WS_HOST, &mqtt_token.token, &macs)
        .await
        .map_err(classify_error)?;

    let _ = publisher_tx.send(Some(session.publisher()));
    {
        let mut owner = shared.mac_owner.write();
        for mac in &macs {
            owner.insert(*mac, dispatcher.clone());
        }
    }

    loop {
        match session.next_event().await {
            Some(SessionEvent::Connected) => {
                tracing::info!(email = %account.email, "cloud session connected");
                reconnect.reset();
            }
            Some(SessionEvent::Frame { mac, payload, response_kind }) => {
                handle_cloud_frame(shared, mac, &response_kind, &payload).await;
            }
            Some(SessionEvent::Error(kind)) => {
                let _ = publisher_tx.send(None);
                return Err(kind);
            }
            Some(SessionEvent::Disconnected) | None => {
                let _ = publisher_tx.send(None);
                return Err(SessionErrorKind::Transient);
            }
        }
    }
}

async fn handle_cloud_frame(
    shared: &Arc<Shared>,
    mac: Mac,
    response_kind: &str,
    payload: &[u8],
) {
    let (topic_kind, function_code) = match response_kind {
        "client/04" => (TopicKind::Immediate, FC_READ_INPUT_REGISTERS),
        "client/data" => (TopicKind::Polling, FC_READ_HOLDING_REGISTERS),
        _ => {
            tracing::debug!(%mac, response_kind, "ignoring unrecognized response topic");
            return;
        }
    };

    let registers = match parse_read_registers_response(payload, function_code) {
        Ok(registers) => registers,
        Err(e) => {
            tracing::debug!(%mac, error = %e, "dropping malformed modbus frame");
            return;
        }
    };

    let change = shared.projector.lock().apply(mac, topic_kind, &registers, Utc::now());
    if let Some(change) = change {
        let _ = shared.state_changes.send((mac, change.after));
    }
}

/// Drains state changes the projector produces and performs the actual
/// local-broker publish. The projector that feeds this channel never
/// holds a client handle itself.
async fn run_state_publisher(
    mut rx: mpsc::UnboundedReceiver<(Mac, crate::projector::DeviceState)>,
    client: AsyncClient,
) {
    while let Some((mac, state)) = rx.recv().await {
        let Ok(json) = serde_json::to_vec(&state) else {
            continue;
        };
        let _ = client
            .publish(topic::local_state_topic(mac), QoS::AtMostOnce, false, json)
            .await;
    }
}

fn classify_error(err: Error) -> SessionErrorKind {
    match err {
        Error::AuthRejected(_) => SessionErrorKind::AuthRejected,
        _ => SessionErrorKind::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_command_resolves_action_and_value() {
        let cmd: LocalCommand = serde_json::from_str(r#"{"action":"usb","value":true}"#).unwrap();
        assert_eq!(cmd.resolve().unwrap(), ("usb", true));
    }

    #[test]
    fn legacy_command_resolves_to_structured_equivalent() {
        let cmd: LocalCommand = serde_json::from_str(r#"{"action":"usb_on"}"#).unwrap();
        assert_eq!(cmd.resolve().unwrap(), ("usb", true));
        let cmd: LocalCommand = serde_json::from_str(r#"{"action":"ac_off"}"#).unwrap();
        assert_eq!(cmd.resolve().unwrap(), ("ac", false));
    }

    #[test]
    fn unrecognized_structured_action_is_rejected() {
        let cmd: LocalCommand = serde_json::from_str(r#"{"action":"flux_capacitor","value":true}"#).unwrap();
        assert!(cmd.resolve().is_err());
    }

    #[test]
    fn switch_command_builds_immediate_write() {
        let cmd = switch_command("usb", true).unwrap();
        assert_eq!(cmd.register(), REGISTER_USB_SWITCH);
        assert_eq!(cmd.response_class(), ResponseClass::Immediate);
    }
}
