// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exercises the bridge supervisor's local-broker side against a mocked
//! MQTT broker: retained status on startup, and silent rejection of a
//! command for a device no cloud session has registered.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use fossibot_bridge::config::{BridgeConfig, CacheConfig, Config, DaemonConfig, MosquittoConfig};
use mockforge_mqtt::broker::MqttConfig;
use mockforge_mqtt::start_mqtt_server;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::time::sleep;

fn next_port() -> u16 {
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(19_200);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

async fn start_broker(port: u16) {
    let config = MqttConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };
    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });
    sleep(Duration::from_millis(500)).await;
}

fn bridge_config(port: u16, cache_dir: &std::path::Path) -> Config {
    Config {
        accounts: Vec::new(),
        mosquitto: MosquittoConfig {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "bridge-under-test".to_string(),
            username: None,
            password: None,
        },
        bridge: BridgeConfig {
            status_publish_interval: 1,
            ..BridgeConfig::default()
        },
        cache: CacheConfig {
            directory: cache_dir.to_path_buf(),
            ..CacheConfig::default()
        },
        daemon: DaemonConfig::default(),
        unknown: std::collections::HashMap::new(),
    }
}

#[tokio::test]
async fn bridge_publishes_retained_online_status_on_startup() {
    let port = next_port();
    start_broker(port).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let config = bridge_config(port, cache_dir.path());

    let shutdown_tx = std::sync::Arc::new(tokio::sync::Notify::new());
    let shutdown_rx = std::sync::Arc::clone(&shutdown_tx);
    let handle = tokio::spawn(async move {
        fossibot_bridge::bridge::run(config, async move { shutdown_rx.notified().await }).await
    });

    sleep(Duration::from_millis(300)).await;

    let mut options = MqttOptions::new("observer", "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    client
        .subscribe(fossibot_bridge::topic::BRIDGE_STATUS_TOPIC, QoS::AtLeastOnce)
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Event::Incoming(Packet::Publish(publish))) = event_loop.poll().await {
                return publish.payload.to_vec();
            }
        }
    })
    .await
    .expect("status message observed before timeout");

    assert_eq!(payload, b"online");

    shutdown_tx.notify_one();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn command_for_unregistered_device_is_silently_dropped() {
    let port = next_port();
    start_broker(port).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let config = bridge_config(port, cache_dir.path());

    let shutdown_tx = std::sync::Arc::new(tokio::sync::Notify::new());
    let shutdown_rx = std::sync::Arc::clone(&shutdown_tx);
    let handle = tokio::spawn(async move {
        fossibot_bridge::bridge::run(config, async move { shutdown_rx.notified().await }).await
    });
    sleep(Duration::from_millis(300)).await;

    let mut options = MqttOptions::new("commander", "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));
    let (client, mut event_loop) = AsyncClient::new(options, 16);
    tokio::spawn(async move {
        loop {
            if event_loop.poll().await.is_err() {
                return;
            }
        }
    });

    // No device with this MAC was ever registered by a cloud session, so
    // this must be dropped rather than panicking the bridge.
    client
        .publish(
            "fossibot/AABBCCDDEEFF/command",
            QoS::AtMostOnce,
            false,
            r#"{"action":"usb","value":true}"#,
        )
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished(), "bridge task must still be running");

    shutdown_tx.notify_one();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
}
