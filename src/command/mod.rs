// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed commands sent to a device over the cloud session.
//!
//! A [`Command`] is built once, validated at construction, and carries
//! everything the dispatcher needs: the Modbus frame bytes, the register
//! it targets, the response class that tells the dispatcher how to wait
//! for (or not wait for) a reply, and a register-type hint the state
//! projector uses to pick a decoding table.

use crate::error::BadInput;
use crate::modbus;

/// Register 68 (sleep time) must never be written with value 0; doing so
/// bricks the device's sleep behavior. Rejected at construction
/// regardless of caller intent.
const SLEEP_TIME_REGISTER: u16 = 68;

/// How the dispatcher should expect a reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// A `/client/04` frame should arrive promptly and reflects the new
    /// state directly (switch writes).
    Immediate,
    /// No direct reply is expected; the effect surfaces in the next
    /// `/client/data` poll (setting writes).
    Delayed,
    /// The command is itself a read; its reply is the requested data.
    ReadResponse,
}

/// The register table a reply to this command should be decoded against.
///
/// FC06 writes always yield an FC04-class response (the device
/// immediately echoes switch/power state on `/client/04`), which is why
/// this is tracked separately from the request's own function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Power/switch registers decoded from `/client/04` (FC04 semantics).
    InputRegisters,
    /// Settings registers decoded from `/client/data` (FC03 semantics).
    HoldingRegisters,
}

/// A validated, encodable command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Write a single holding register (FC06).
    WriteSingleRegister {
        /// Target register.
        register: u16,
        /// Value to write.
        value: u16,
        /// How the dispatcher should wait for a reply.
        response_class: ResponseClass,
    },
    /// Read a span of holding registers (FC03).
    ReadHoldingRegisters {
        /// First register to read.
        start: u16,
        /// Number of registers to read, 1..=125.
        count: u16,
    },
    /// Read a span of input registers (FC04).
    ReadInputRegisters {
        /// First register to read.
        start: u16,
        /// Number of registers to read, 1..=125.
        count: u16,
    },
}

impl Command {
    /// Builds a write-single-register command.
    ///
    /// # Errors
    ///
    /// Returns [`BadInput::RegisterGuard`] if `register == 68 && value ==
    /// 0`, regardless of `response_class`.
    pub fn write_single_register(
        register: u16,
        value: u16,
        response_class: ResponseClass,
    ) -> Result<Self, BadInput> {
        if register == SLEEP_TIME_REGISTER && value == 0 {
            return Err(BadInput::RegisterGuard);
        }
        Ok(Self::WriteSingleRegister {
            register,
            value,
            response_class,
        })
    }

    /// Builds a read-holding-registers command (FC03).
    ///
    /// # Errors
    ///
    /// Returns [`BadInput`] if `count` is outside `1..=125` or `start +
    /// count` overflows the 16-bit register space.
    pub fn read_holding_registers(start: u16, count: u16) -> Result<Self, BadInput> {
        modbus::build_read_holding_registers(start, count)
            .map_err(|e| BadInput::MalformedTopic(e.to_string()))?;
        Ok(Self::ReadHoldingRegisters { start, count })
    }

    /// Builds a read-input-registers command (FC04).
    ///
    /// # Errors
    ///
    /// See [`Command::read_holding_registers`].
    pub fn read_input_registers(start: u16, count: u16) -> Result<Self, BadInput> {
        modbus::build_read_input_registers(start, count)
            .map_err(|e| BadInput::MalformedTopic(e.to_string()))?;
        Ok(Self::ReadInputRegisters { start, count })
    }

    /// The register this command targets (the start register for reads).
    #[must_use]
    pub fn register(&self) -> u16 {
        match self {
            Self::WriteSingleRegister { register, .. } => *register,
            Self::ReadHoldingRegisters { start, .. } | Self::ReadInputRegisters { start, .. } => {
                *start
            }
        }
    }

    /// How the dispatcher should expect a reply.
    #[must_use]
    pub fn response_class(&self) -> ResponseClass {
        match self {
            Self::WriteSingleRegister { response_class, .. } => *response_class,
            Self::ReadHoldingRegisters { .. } | Self::ReadInputRegisters { .. } => {
                ResponseClass::ReadResponse
            }
        }
    }

    /// The decoding table a reply should be interpreted against. FC06
    /// writes always yield an FC04-class (input-register) response.
    #[must_use]
    pub fn register_kind(&self) -> RegisterKind {
        match self {
            Self::WriteSingleRegister { .. } | Self::ReadInputRegisters { .. } => {
                RegisterKind::InputRegisters
            }
            Self::ReadHoldingRegisters { .. } => RegisterKind::HoldingRegisters,
        }
    }

    /// Encodes this command to its Modbus-RTU frame bytes.
    #[must_use]
    pub fn to_frame(&self) -> Vec<u8> {
        match *self {
            Self::WriteSingleRegister { register, value, .. } => {
                modbus::build_write_single_register(register, value)
            }
            Self::ReadHoldingRegisters { start, count } => {
                modbus::build_read_holding_registers(start, count)
                    .expect("range validated at construction")
            }
            Self::ReadInputRegisters { start, count } => {
                modbus::build_read_input_registers(start, count)
                    .expect("range validated at construction")
            }
        }
    }

    /// A short human description for logs.
    #[must_use]
    pub fn description(&self) -> String {
        match *self {
            Self::WriteSingleRegister { register, value, .. } => {
                format!("write register {register} = {value}")
            }
            Self::ReadHoldingRegisters { start, count } => {
                format!("read {count} holding register(s) from {start}")
            }
            Self::ReadInputRegisters { start, count } => {
                format!("read {count} input register(s) from {start}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_68_zero_is_rejected() {
        let err = Command::write_single_register(68, 0, ResponseClass::Delayed).unwrap_err();
        assert_eq!(err, BadInput::RegisterGuard);
    }

    #[test]
    fn register_68_nonzero_is_accepted() {
        let cmd = Command::write_single_register(68, 30, ResponseClass::Delayed).unwrap();
        assert_eq!(cmd.register(), 68);
    }

    #[test]
    fn other_registers_accept_zero() {
        Command::write_single_register(41, 0, ResponseClass::Immediate).unwrap();
    }

    #[test]
    fn write_single_register_yields_input_register_kind() {
        let cmd = Command::write_single_register(41, 1, ResponseClass::Immediate).unwrap();
        assert_eq!(cmd.register_kind(), RegisterKind::InputRegisters);
        assert_eq!(cmd.response_class(), ResponseClass::Immediate);
    }

    #[test]
    fn read_holding_registers_rejects_out_of_range_count() {
        assert!(Command::read_holding_registers(0, 0).is_err());
        assert!(Command::read_holding_registers(0, 126).is_err());
    }

    #[test]
    fn to_frame_matches_codec_output() {
        let cmd = Command::write_single_register(24, 1, ResponseClass::Immediate).unwrap();
        let frame = cmd.to_frame();
        assert_eq!(frame, modbus::build_write_single_register(24, 1));
    }

    #[test]
    fn description_is_human_readable() {
        let cmd = Command::write_single_register(41, 1, ResponseClass::Immediate).unwrap();
        assert_eq!(cmd.description(), "write register 41 = 1");
    }
}
