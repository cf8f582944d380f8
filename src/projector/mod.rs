// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decodes inbound Modbus register maps into a per-device state
//! projection, arbitrating between the cloud's two response topics by
//! priority (§4.8).
//!
//! `…/client/04` ("immediate") is authoritative for switches and power;
//! `…/client/data` ("polling") is authoritative for settings and is only
//! allowed to override switch state once the most recent immediate
//! update is more than [`TOPIC_PRIORITY_WINDOW`] old.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::mac::Mac;

/// How long after the latest immediate (`client/04`) update a polling
/// (`client/data`) update must be ignored for register 41 and SoC.
/// Hardware-measured, not contractual (§9 open questions).
pub const TOPIC_PRIORITY_WINDOW: Duration = Duration::from_secs(35);

/// Which cloud response topic a register map arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `…/client/04`: immediate, authoritative for switches/power.
    Immediate,
    /// `…/client/data`: periodic FC03 poll, authoritative for settings.
    Polling,
}

/// Where the last applied update to a device's state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// The device pushed this state change on its own.
    Spontaneous,
    /// This bridge's own command produced the change.
    Command,
    /// Discovered via a routine `client/data` poll.
    Polling,
}

/// A device's projected state: the fields in spec §3 "Device state".
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceState {
    /// State of charge, percent, one decimal place.
    pub soc: f64,
    /// Input power, watts.
    pub input_watts: u16,
    /// Output power, watts.
    pub output_watts: u16,
    /// DC input power, watts.
    pub dc_input_watts: u16,

    /// USB output switch.
    pub usb_output: bool,
    /// AC output switch.
    pub ac_output: bool,
    /// DC output switch.
    pub dc_output: bool,
    /// LED switch.
    pub led_output: bool,

    /// Maximum charging current, amps.
    pub max_charging_current: u16,
    /// Discharge lower limit, percent.
    pub discharge_lower_limit: f64,
    /// AC charging upper limit, percent.
    pub ac_charging_upper_limit: f64,
    /// Whether AC silent charging is enabled.
    pub ac_silent_charging: bool,
    /// USB standby timeout, minutes.
    pub usb_standby_min: u16,
    /// AC standby timeout, minutes.
    pub ac_standby_min: u16,
    /// DC standby timeout, minutes.
    pub dc_standby_min: u16,
    /// Screen rest timeout, seconds.
    pub screen_rest_sec: u16,
    /// AC charging timer, minutes.
    pub ac_charging_timer_min: u16,
    /// Sleep timeout, minutes. Invariant: never 0.
    pub sleep_time_min: u16,

    /// Timestamp of the most recent update of any kind, `None` until the
    /// first frame for this device is applied.
    pub last_full_update: Option<DateTime<Utc>>,
    /// Timestamp of the most recent switch-state update, `None` until an
    /// immediate frame has carried register 41.
    pub last_output_update: Option<DateTime<Utc>>,
    /// Timestamp of the most recent SoC update, `None` until an immediate
    /// frame has carried register 56.
    pub last_soc_update: Option<DateTime<Utc>>,
    /// Where the most recent update came from.
    pub last_update_source: UpdateSource,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            soc: 0.0,
            input_watts: 0,
            output_watts: 0,
            dc_input_watts: 0,
            usb_output: false,
            ac_output: false,
            dc_output: false,
            led_output: false,
            max_charging_current: 0,
            discharge_lower_limit: 0.0,
            ac_charging_upper_limit: 0.0,
            ac_silent_charging: false,
            usb_standby_min: 0,
            ac_standby_min: 0,
            dc_standby_min: 0,
            screen_rest_sec: 0,
            ac_charging_timer_min: 0,
            sleep_time_min: 1,
            last_full_update: None,
            last_output_update: None,
            last_soc_update: None,
            last_update_source: UpdateSource::Spontaneous,
        }
    }
}

// Register addresses (§3, §4.8).
const REG_INPUT_WATTS: u16 = 4;
const REG_OUTPUT_WATTS: u16 = 6;
const REG_DC_INPUT_WATTS: u16 = 39;
const REG_SWITCHES: u16 = 41;
const REG_SOC: u16 = 56;
const REG_MAX_CHARGING_CURRENT: u16 = 20;
const REG_AC_SILENT_CHARGING: u16 = 57;
const REG_USB_STANDBY: u16 = 59;
const REG_AC_STANDBY: u16 = 60;
const REG_DC_STANDBY: u16 = 61;
const REG_SCREEN_REST: u16 = 62;
const REG_AC_CHARGING_TIMER: u16 = 63;
const REG_DISCHARGE_LOWER_LIMIT: u16 = 66;
const REG_AC_CHARGING_UPPER_LIMIT: u16 = 67;
const REG_SLEEP_TIME: u16 = 68;

const SWITCH_BIT_USB: u16 = 0x0200;
const SWITCH_BIT_DC: u16 = 0x0400;
const SWITCH_MASK_AC: u16 = 0x0804;
const SWITCH_BIT_LED: u16 = 0x1000;

/// Decodes register 41's bitfield into the four output switches.
///
/// USB is bit 9, DC is bit 10, LED is bit 12. AC is bits 2 and 11
/// together (`bitfield & 0x804 != 0`). Bit 7 co-occurs with both USB and
/// DC and carries no independent meaning; it is intentionally not
/// consulted here.
#[must_use]
pub fn decode_switches(bitfield: u16) -> (bool, bool, bool, bool) {
    let usb = bitfield & SWITCH_BIT_USB != 0;
    let dc = bitfield & SWITCH_BIT_DC != 0;
    let ac = bitfield & SWITCH_MASK_AC != 0;
    let led = bitfield & SWITCH_BIT_LED != 0;
    (usb, ac, dc, led)
}

/// Decodes register 56's raw SoC reading: `raw / 1000 * 100`, rounded to
/// one decimal place.
#[must_use]
pub fn decode_soc(raw: u16) -> f64 {
    let pct = f64::from(raw) / 1000.0 * 100.0;
    (pct * 10.0).round() / 10.0
}

/// Decodes a raw tenths-of-a-percent register (discharge lower limit,
/// AC charging upper limit): `raw / 10`.
#[must_use]
pub fn decode_tenths_percent(raw: u16) -> f64 {
    f64::from(raw) / 10.0
}

/// Tracks one device's projected state and the timestamps the
/// priority-arbitration rule needs.
pub struct Projector {
    states: HashMap<Mac, DeviceState>,
    /// MACs with an immediate-class command expectation armed by the
    /// dispatcher, and when it was armed (for the bridge to expire
    /// stale expectations; §9 open question 1).
    pending_writes: HashMap<Mac, Instant>,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new()
    }
}

impl Projector {
    /// Creates an empty projector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            pending_writes: HashMap::new(),
        }
    }

    /// Returns the current snapshot for `mac`, if any state has been
    /// applied for it yet.
    #[must_use]
    pub fn snapshot(&self, mac: Mac) -> Option<&DeviceState> {
        self.states.get(&mac)
    }

    /// Returns every known device's snapshot, for periodic bridge-wide
    /// republishing.
    pub fn snapshots(&self) -> impl Iterator<Item = (&Mac, &DeviceState)> {
        self.states.iter()
    }

    /// Called by the command dispatcher immediately before publishing an
    /// immediate-class write, so the next `client/04` frame for this MAC
    /// is attributed to the command rather than the device acting on its
    /// own.
    pub fn arm_command_expectation(&mut self, mac: Mac) {
        self.pending_writes.insert(mac, Instant::now());
    }

    /// Consumes (and clears) the command expectation for `mac` if one is
    /// armed and not yet stale, returning whether this update should be
    /// attributed to a command.
    fn consume_command_expectation(&mut self, mac: Mac, max_age: Duration) -> bool {
        match self.pending_writes.remove(&mac) {
            Some(armed_at) => armed_at.elapsed() <= max_age,
            None => false,
        }
    }

    /// Applies a decoded register map arriving on `topic` for `mac` at
    /// `now`, returning a [`StateChange`] if anything was applied, or
    /// `None` if every register in this frame was dropped by the
    /// priority rule (the frame still isn't an error — a subordinate
    /// poll inside the window is expected traffic, not a malformed one).
    pub fn apply(
        &mut self,
        mac: Mac,
        topic: TopicKind,
        registers: &BTreeMap<u16, u16>,
        now: DateTime<Utc>,
    ) -> Option<StateChange> {
        let was_command_triggered =
            matches!(topic, TopicKind::Immediate) && self.consume_command_expectation(mac, Duration::from_secs(5));

        let mut state = self.states.get(&mac).cloned().unwrap_or_default();
        let before = state.clone();
        let mut applied_anything = false;

        match topic {
            TopicKind::Immediate => {
                if let Some(&raw) = registers.get(&REG_INPUT_WATTS) {
                    state.input_watts = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_OUTPUT_WATTS) {
                    state.output_watts = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_DC_INPUT_WATTS) {
                    state.dc_input_watts = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_SWITCHES) {
                    let (usb, ac, dc, led) = decode_switches(raw);
                    state.usb_output = usb;
                    state.ac_output = ac;
                    state.dc_output = dc;
                    state.led_output = led;
                    state.last_output_update = Some(now);
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_SOC) {
                    state.soc = decode_soc(raw);
                    state.last_soc_update = Some(now);
                    applied_anything = true;
                }
                if applied_anything {
                    state.last_update_source = if was_command_triggered {
                        UpdateSource::Command
                    } else {
                        UpdateSource::Spontaneous
                    };
                }
            }
            TopicKind::Polling => {
                let window_elapsed = match state.last_output_update {
                    None => true,
                    Some(last) => now
                        .signed_duration_since(last)
                        .to_std()
                        .map(|d| d > TOPIC_PRIORITY_WINDOW)
                        .unwrap_or(true),
                };
                if window_elapsed {
                    if let Some(&raw) = registers.get(&REG_SWITCHES) {
                        let (usb, ac, dc, led) = decode_switches(raw);
                        state.usb_output = usb;
                        state.ac_output = ac;
                        state.dc_output = dc;
                        state.led_output = led;
                        applied_anything = true;
                    }
                }
                if let Some(&raw) = registers.get(&REG_MAX_CHARGING_CURRENT) {
                    state.max_charging_current = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_AC_SILENT_CHARGING) {
                    state.ac_silent_charging = raw == 1;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_USB_STANDBY) {
                    state.usb_standby_min = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_AC_STANDBY) {
                    state.ac_standby_min = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_DC_STANDBY) {
                    state.dc_standby_min = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_SCREEN_REST) {
                    state.screen_rest_sec = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_AC_CHARGING_TIMER) {
                    state.ac_charging_timer_min = raw;
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_DISCHARGE_LOWER_LIMIT) {
                    state.discharge_lower_limit = decode_tenths_percent(raw);
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_AC_CHARGING_UPPER_LIMIT) {
                    state.ac_charging_upper_limit = decode_tenths_percent(raw);
                    applied_anything = true;
                }
                if let Some(&raw) = registers.get(&REG_SLEEP_TIME) {
                    if raw != 0 {
                        state.sleep_time_min = raw;
                        applied_anything = true;
                    }
                }
                if applied_anything {
                    state.last_update_source = UpdateSource::Polling;
                }
            }
        }

        if !applied_anything {
            return None;
        }
        state.last_full_update = Some(now);
        self.states.insert(mac, state.clone());
        Some(StateChange {
            mac,
            before,
            after: state,
        })
    }
}

/// The result of a successful [`Projector::apply`] call: the state
/// before and after, for callers that want to detect which fields
/// actually changed (e.g. to decide whether a local publish is
/// warranted).
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Which device changed.
    pub mac: Mac,
    /// State immediately before this update.
    pub before: DeviceState,
    /// State immediately after this update.
    pub after: DeviceState,
}
