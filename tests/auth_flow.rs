// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercise of the four-stage cloud authentication flow
//! against a mocked serverless endpoint.

use fossibot_bridge::cache::{DeviceCache, TokenCache, TokenStage};
use fossibot_bridge::cloud::CloudAuthenticator;
use wiremock::matchers::{header_exists, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ok_envelope(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data }))
}

#[tokio::test]
async fn cold_start_completes_all_four_stages_and_populates_caches() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header_exists("x-serverless-sign"))
        .respond_with(|req: &wiremock::Request| {
            let body: serde_json::Value = req.body_json().unwrap();
            match body["method"].as_str().unwrap() {
                "serverless.auth.user.anonymousAuthorize" => {
                    ok_envelope(serde_json::json!({ "token": "anon-token", "expiresInSecond": 600 }))
                }
                "router/user/pub/login" => {
                    ok_envelope(serde_json::json!({ "token": "login-token", "expiresInSecond": 86_400 }))
                }
                "router/common/emqx.getAccessToken" => {
                    ok_envelope(serde_json::json!({ "accessToken": "header.payload.sig" }))
                }
                "router/device/list" => ok_envelope(serde_json::json!({
                    "rows": [{
                        "device_mac": "7C2C67AB5F0E",
                        "name": "Garage F2400",
                        "productId": "f2400",
                        "model": "F2400",
                        "online": true,
                    }],
                })),
                other => panic!("unexpected method {other}"),
            }
        })
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let token_cache = TokenCache::new(temp.path());
    let device_cache = DeviceCache::new(temp.path());
    let auth = CloudAuthenticator::new(server.uri(), "mp-test-space").unwrap();

    let anonymous = auth.anonymous("user@example.com", &token_cache).await.unwrap();
    let login = auth
        .login("user@example.com", "hunter2", &anonymous, &token_cache)
        .await
        .unwrap();
    let mqtt = auth
        .mqtt_token("user@example.com", &anonymous, &login, &token_cache)
        .await
        .unwrap();
    assert_eq!(mqtt.token, "header.payload.sig");

    let devices = auth
        .devices("user@example.com", &anonymous, &device_cache)
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].mac.as_str(), "7C2C67AB5F0E");

    // Every stage's result is now cached; a second call with a dead
    // server still succeeds because it never needs to reach it.
    drop(server);
    assert!(token_cache.get("user@example.com", TokenStage::Anonymous).is_some());
    assert!(token_cache.get("user@example.com", TokenStage::Login).is_some());
    assert!(token_cache.get("user@example.com", TokenStage::Mqtt).is_some());
    assert_eq!(device_cache.get("user@example.com").unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_credentials_surface_as_auth_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(|req: &wiremock::Request| {
            let body: serde_json::Value = req.body_json().unwrap();
            if body["method"] == "serverless.auth.user.anonymousAuthorize" {
                ok_envelope(serde_json::json!({ "token": "anon-token", "expiresInSecond": 600 }))
            } else {
                ResponseTemplate::new(401)
            }
        })
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().unwrap();
    let token_cache = TokenCache::new(temp.path());
    let auth = CloudAuthenticator::new(server.uri(), "mp-test-space").unwrap();

    let anonymous = auth.anonymous("user@example.com", &token_cache).await.unwrap();
    let err = auth
        .login("user@example.com", "wrong", &anonymous, &token_cache)
        .await
        .unwrap_err();
    assert!(matches!(err, fossibot_bridge::Error::AuthRejected(_)));
}
