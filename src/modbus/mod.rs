// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Modbus-RTU framing: CRC-16 and FC03/FC04/FC06 frame build & parse.

mod codec;
mod crc;

pub use codec::{
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_SINGLE_REGISTER, SLAVE_ADDRESS,
    build_read_holding_registers, build_read_input_registers, build_write_single_register,
    parse_read_registers_response, parse_write_single_register_response,
};
pub use crc::{append_crc, crc16_modbus};
