// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the bridge.
//!
//! Errors are grouped by the taxonomy the bridge reasons about for
//! recovery: transient network failures retry, auth rejection forces
//! re-authentication, protocol/persistence errors are logged and
//! isolated to the account or device they came from, and bad input is
//! rejected at the call site.

use thiserror::Error;

use crate::mac::MacError;

/// The main error type for the bridge.
#[derive(Debug, Error)]
pub enum Error {
    /// A network failure that is expected to resolve on retry (timeouts,
    /// connection resets, HTTP 5xx/429).
    #[error("transient network error: {0}")]
    TransientNet(String),

    /// The cloud rejected our credentials or token (HTTP 401/403, MQTT
    /// CONNACK return code 5). Forces tier-2 reconnection.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// A response did not have the shape we expected, or a Modbus frame
    /// failed to decode.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Caller supplied a value that fails validation (bad MAC, bad
    /// register/value, malformed topic).
    #[error("invalid input: {0}")]
    BadInput(#[from] BadInput),

    /// The on-disk cache could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Reconnection attempts have been exhausted; the account is
    /// quiescent until externally restarted.
    #[error("terminal error for account: {0}")]
    Terminal(String),
}

/// Errors decoding or building Modbus frames, or validating commands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A Modbus response was shorter than the minimum valid frame.
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    /// The trailing CRC-16 did not match the computed checksum.
    #[error("bad CRC")]
    BadCrc,

    /// The response's function code did not match the request.
    #[error("function code mismatch: expected {expected}, got {actual}")]
    FunctionMismatch {
        /// Function code we sent.
        expected: u8,
        /// Function code the device replied with.
        actual: u8,
    },

    /// The response's byte count did not match `2 * register count`.
    #[error("byte count mismatch: expected {expected}, got {actual}")]
    ByteCountMismatch {
        /// Expected byte count.
        expected: u8,
        /// Byte count field in the response.
        actual: u8,
    },

    /// The response used a function code we don't implement.
    #[error("unsupported function code: {0}")]
    UnsupportedFunction(u8),

    /// A command or codec call was given an out-of-range register/count.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// A cloud response did not contain the fields we expected.
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
}

/// Errors for caller-supplied values that are rejected at construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadInput {
    /// A command attempted to write register 68 with value 0, which is
    /// rejected regardless of caller intent.
    #[error("register 68 may not be written with value 0")]
    RegisterGuard,

    /// An invalid MAC address string.
    #[error(transparent)]
    Mac(#[from] MacError),

    /// A malformed MQTT topic that could not be translated.
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    /// A command's local action field was not recognized.
    #[error("unrecognized command action: {0}")]
    UnrecognizedAction(String),
}

/// Errors reading or writing the on-disk token/device caches.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The cache directory or file could not be created or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The cached file was valid JSON but had an unexpected shape. This
    /// is treated as a cache miss by callers, never propagated as fatal.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

/// A specialized Result type for the bridge.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::FunctionMismatch {
            expected: 6,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "function code mismatch: expected 6, got 3"
        );
    }

    #[test]
    fn bad_input_from_mac_error() {
        let mac_err = MacError::WrongLength(5);
        let err: BadInput = mac_err.into();
        assert!(matches!(err, BadInput::Mac(MacError::WrongLength(5))));
    }

    #[test]
    fn error_from_protocol_error() {
        let err: Error = ProtocolError::BadCrc.into();
        assert!(matches!(err, Error::Protocol(ProtocolError::BadCrc)));
    }
}
