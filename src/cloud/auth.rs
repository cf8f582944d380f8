// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The four-stage cloud authentication flow: anonymous token, login
//! token, MQTT token, device list.
//!
//! Every stage is an HTTPS POST to the same serverless RPC endpoint,
//! signed with HMAC-MD5 over a normalized, sorted query string.

use std::time::{Duration, SystemTime};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac as HmacMac};
use md5::Md5;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cache::{DeviceCache, TokenCache, TokenStage};
use crate::device::Device;
use crate::error::{Error, ProtocolError};
use crate::mac::Mac;

type HmacMd5 = Hmac<Md5>;

/// Shared client secret used to sign every request. Fixed by the vendor
/// protocol, not a per-account secret.
const CLIENT_SECRET: &str = "M0MAYOSDTHYIBMNPZLUXAVADWQBUVKPP";

/// Default request timeout for each authentication stage (§5).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of the anonymous-authorize stage.
#[derive(Debug, Clone)]
pub struct AnonymousToken {
    /// Opaque token string.
    pub token: String,
    /// Absolute expiry.
    pub expires_at: SystemTime,
}

/// Result of the login stage.
#[derive(Debug, Clone)]
pub struct LoginToken {
    /// Opaque token string.
    pub token: String,
    /// Absolute expiry (server-claimed, capped by the cache's
    /// `max_token_ttl`).
    pub expires_at: SystemTime,
}

/// Result of the MQTT-token stage.
#[derive(Debug, Clone)]
pub struct MqttToken {
    /// Opaque JWT string, used as the MQTT CONNECT password's username.
    pub token: String,
    /// True expiry, taken from the JWT's `exp` claim.
    pub expires_at: SystemTime,
}

/// Stable per-process device identity sent as `clientInfo` on every
/// request from stage 2 onward.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    #[serde(rename = "deviceId")]
    device_id: String,
    platform: &'static str,
    #[serde(rename = "osVersion")]
    os_version: &'static str,
    #[serde(rename = "appVersion")]
    app_version: &'static str,
}

impl ClientInfo {
    /// Generates a fresh client identity with a random 32-hex device id.
    #[must_use]
    pub fn generate() -> Self {
        let device_id: String = (0..32)
            .map(|_| {
                let n: u8 = rand::random::<u8>() % 16;
                std::char::from_digit(u32::from(n), 16).unwrap_or('0')
            })
            .collect();
        Self {
            device_id,
            platform: "android",
            os_version: "13",
            app_version: "1.0.0",
        }
    }
}

/// Drives the four-stage authentication flow for one account, consulting
/// and updating the token/device caches at each step.
#[derive(Debug)]
pub struct CloudAuthenticator {
    http: Client,
    base_url: String,
    space_id: String,
    client_info: ClientInfo,
}

impl CloudAuthenticator {
    /// Creates an authenticator against the vendor's serverless endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, space_id: impl Into<String>) -> Result<Self, Error> {
        let http = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProtocolError::UnexpectedShape(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            space_id: space_id.into(),
            client_info: ClientInfo::generate(),
        })
    }

    fn timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    /// Computes the `x-serverless-sign` header: HMAC-MD5 (hex) of the
    /// params, normalized as ascending-sorted `k=v` pairs joined by `&`,
    /// with empty values dropped.
    fn sign(params: &[(&str, String)]) -> String {
        let mut pairs: Vec<(&str, String)> =
            params.iter().filter(|(_, v)| !v.is_empty()).cloned().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let normalized = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let mut mac = HmacMd5::new_from_slice(CLIENT_SECRET.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(normalized.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    async fn post(
        &self,
        method: &str,
        params: Value,
        token: Option<&str>,
    ) -> Result<Value, Error> {
        let timestamp = Self::timestamp_ms();
        let mut sign_params = vec![
            ("method", method.to_string()),
            ("spaceId", self.space_id.clone()),
            ("timestamp", timestamp.to_string()),
        ];
        if let Some(token) = token {
            sign_params.push(("token", token.to_string()));
        }
        let signature = Self::sign(&sign_params);

        let mut body = json!({
            "method": method,
            "params": params,
            "spaceId": self.space_id,
            "timestamp": timestamp,
            "clientInfo": self.client_info,
        });
        if let Some(token) = token {
            body["token"] = Value::String(token.to_string());
        }

        let response = self
            .http
            .post(&self.base_url)
            .header("x-serverless-sign", signature)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::AuthRejected(format!(
                "{method} rejected with HTTP {status}"
            )));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::TransientNet(format!("{method} returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Protocol(ProtocolError::UnexpectedShape(format!(
                "{method} returned unexpected HTTP {status}"
            ))));
        }

        let envelope: Value = response.json().await.map_err(classify_reqwest_error)?;
        envelope
            .get("data")
            .cloned()
            .ok_or_else(|| Error::Protocol(ProtocolError::UnexpectedShape(format!("{method} response had no data envelope"))))
    }

    /// Stage 1: acquire an anonymous token, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthRejected`] on HTTP 401/403,
    /// [`Error::TransientNet`] on timeout/429/5xx, or
    /// [`Error::Protocol`] if the response is malformed.
    pub async fn anonymous(
        &self,
        email: &str,
        cache: &TokenCache,
    ) -> Result<AnonymousToken, Error> {
        if let Some(cached) = cache.get(email, TokenStage::Anonymous) {
            return Ok(AnonymousToken {
                token: cached.token,
                expires_at: unix_to_system(cached.expires_at),
            });
        }

        let data = self
            .post("serverless.auth.user.anonymousAuthorize", json!({}), None)
            .await?;
        let token = extract_str(&data, "token")?;
        let expires_in = extract_u64(&data, "expiresInSecond").unwrap_or(600);
        let expires_at = SystemTime::now() + Duration::from_secs(expires_in);

        let _ = cache.put(email, TokenStage::Anonymous, token.as_str(), expires_at);
        Ok(AnonymousToken { token, expires_at })
    }

    /// Stage 2: log in with username/password, using the anonymous token
    /// as signing witness.
    ///
    /// # Errors
    ///
    /// See [`CloudAuthenticator::anonymous`].
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        anonymous: &AnonymousToken,
        cache: &TokenCache,
    ) -> Result<LoginToken, Error> {
        if let Some(cached) = cache.get(email, TokenStage::Login) {
            return Ok(LoginToken {
                token: cached.token,
                expires_at: unix_to_system(cached.expires_at),
            });
        }

        let params = json!({
            "locale": "en",
            "username": email,
            "password": password,
        });
        let data = self
            .post("router/user/pub/login", params, Some(&anonymous.token))
            .await?;
        let token = extract_str(&data, "token")?;
        // The server's claimed expiry is not honored long-term; the
        // cache's `max_token_ttl` ceiling is the real bound.
        let expires_in = extract_u64(&data, "expiresInSecond").unwrap_or(TokenCache::DEFAULT_MAX_TOKEN_TTL.as_secs());
        let expires_at = SystemTime::now() + Duration::from_secs(expires_in);

        let _ = cache.put(email, TokenStage::Login, token.as_str(), expires_at);
        Ok(LoginToken { token, expires_at })
    }

    /// Stage 3: exchange the login token for an MQTT JWT.
    ///
    /// # Errors
    ///
    /// See [`CloudAuthenticator::anonymous`].
    pub async fn mqtt_token(
        &self,
        email: &str,
        anonymous: &AnonymousToken,
        login: &LoginToken,
        cache: &TokenCache,
    ) -> Result<MqttToken, Error> {
        if let Some(cached) = cache.get(email, TokenStage::Mqtt) {
            return Ok(MqttToken {
                token: cached.token,
                expires_at: unix_to_system(cached.expires_at),
            });
        }
        let _ = &login.token;

        let data = self
            .post("router/common/emqx.getAccessToken", json!({}), Some(&anonymous.token))
            .await?;
        let token = extract_str(&data, "accessToken")?;
        let expires_at = jwt_expiry(&token).unwrap_or_else(|| {
            SystemTime::now() + Duration::from_secs(3 * 86_400)
        });

        let _ = cache.put(email, TokenStage::Mqtt, token.as_str(), expires_at);
        Ok(MqttToken { token, expires_at })
    }

    /// Stage 4: fetch the account's device list, consulting the device
    /// cache first.
    ///
    /// # Errors
    ///
    /// See [`CloudAuthenticator::anonymous`].
    pub async fn devices(
        &self,
        email: &str,
        anonymous: &AnonymousToken,
        device_cache: &DeviceCache,
    ) -> Result<Vec<Device>, Error> {
        if let Some(cached) = device_cache.get(email) {
            return Ok(cached);
        }

        let mut devices = Vec::new();
        let mut page = 1u32;
        loop {
            let params = json!({ "page": page, "pageSize": 50 });
            let data = self
                .post("router/device/list", params, Some(&anonymous.token))
                .await?;
            let items = data
                .get("rows")
                .or_else(|| data.get("list"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if items.is_empty() {
                break;
            }
            let page_len = items.len();
            for item in items {
                devices.push(parse_device(&item)?);
            }
            if page_len < 50 {
                break;
            }
            page += 1;
        }

        let _ = device_cache.put(email, devices.clone());
        Ok(devices)
    }
}

fn parse_device(value: &Value) -> Result<Device, Error> {
    let mac_str = extract_str(value, "device_mac").or_else(|_| extract_str(value, "mac"))?;
    let mac = Mac::parse(&mac_str).map_err(|e| Error::BadInput(e.into()))?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let product_id = value
        .get("productId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let online = value.get("online").and_then(Value::as_bool).unwrap_or(false);
    let created_at = chrono::Utc::now();
    Ok(Device::new(mac, name, product_id, model, online, created_at))
}

fn extract_str(value: &Value, field: &str) -> Result<String, Error> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Protocol(ProtocolError::UnexpectedShape(format!(
                "response missing string field {field}"
            )))
        })
}

fn extract_u64(value: &Value, field: &str) -> Option<u64> {
    value.get(field).and_then(Value::as_u64)
}

fn unix_to_system(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

/// Decodes the `exp` claim from a JWT's unverified payload segment.
/// Returns `None` if the token is not a well-formed three-part JWT.
fn jwt_expiry(token: &str) -> Option<SystemTime> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let value: Value = serde_json::from_slice(&payload).ok()?;
    let exp = value.get("exp")?.as_i64()?;
    Some(unix_to_system(exp))
}

fn classify_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() {
        Error::TransientNet(err.to_string())
    } else {
        Error::Protocol(ProtocolError::UnexpectedShape(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_drops_empty_values_and_sorts_keys() {
        let params = vec![
            ("timestamp", "100".to_string()),
            ("method", "x".to_string()),
            ("token", String::new()),
        ];
        let sig_a = CloudAuthenticator::sign(&params);

        let reordered = vec![
            ("method", "x".to_string()),
            ("timestamp", "100".to_string()),
        ];
        let sig_b = CloudAuthenticator::sign(&reordered);
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn sign_is_deterministic() {
        let params = vec![("a", "1".to_string()), ("b", "2".to_string())];
        assert_eq!(CloudAuthenticator::sign(&params), CloudAuthenticator::sign(&params));
    }

    #[test]
    fn client_info_device_id_is_32_hex_chars() {
        let info = ClientInfo::generate();
        assert_eq!(info.device_id.len(), 32);
        assert!(info.device_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn jwt_expiry_decodes_exp_claim() {
        // header.payload.signature, payload = {"exp":1893456000}
        let payload = URL_SAFE_NO_PAD.encode(br#"{"exp":1893456000}"#);
        let token = format!("eyJhbGciOiJIUzI1NiJ9.{payload}.sig");
        let expiry = jwt_expiry(&token).unwrap();
        assert_eq!(
            expiry.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs(),
            1_893_456_000
        );
    }

    #[test]
    fn jwt_expiry_none_for_malformed_token() {
        assert!(jwt_expiry("not-a-jwt").is_none());
    }
}
