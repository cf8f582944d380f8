// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Three-tier reconnect escalation with a fixed backoff schedule.

use std::time::Duration;

/// Fixed backoff delays, in seconds, indexed by attempt number (1-based,
/// clamped at the last entry).
pub const BACKOFF_SCHEDULE_SECS: [u64; 6] = [5, 10, 15, 30, 45, 60];

/// Default ceiling on reconnect attempts before giving up entirely.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Which recovery tier the supervisor should attempt next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Tokens are still within their safety margin: redo the WebSocket
    /// and MQTT CONNECT, resubscribe.
    SimpleReconnect,
    /// Tokens are invalid or the server rejected credentials: clear
    /// in-memory tokens, invalidate cache entries, rerun S1-S4.
    FullReauth,
    /// Repeated failure: wait out the backoff schedule before retrying.
    Backoff,
}

/// Terminal outcome once `max_reconnect_attempts` is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal;

/// Drives the tier-selection and backoff-delay logic for one account's
/// reconnect attempts.
///
/// Holds no I/O; the bridge supervisor asks it what to do next and what
/// to wait, and reports back whether the attempt succeeded.
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    max_attempts: u32,
    attempt: u32,
    last_tier: Option<Tier>,
    /// Consecutive attempts that landed on tier 2 via the sticky rule
    /// (not a fresh `credentials_rejected` trigger). Two in a row means
    /// tier 2 itself is failing to recover the session, so the next
    /// attempt backs off instead of hammering full re-auth again.
    full_reauth_repeats: u32,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

impl ReconnectSupervisor {
    /// Creates a supervisor with the given attempt ceiling.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempt: 0,
            last_tier: None,
            full_reauth_repeats: 0,
        }
    }

    /// Resets attempt counting after a successful reconnection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_tier = None;
        self.full_reauth_repeats = 0;
    }

    /// Returns the delay for backoff attempt `n` (1-based): `delays[min(n
    /// - 1, delays.len() - 1)]`.
    #[must_use]
    pub fn backoff_delay(attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
        Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
    }

    /// Decides the tier for the next attempt, given whether tokens are
    /// still within their safety margin (i.e. a simple reconnect is
    /// viable at all) and whether the cloud explicitly rejected
    /// credentials (CONNACK code 5 or an HTTP 401/403).
    ///
    /// Tier-selection rule (§4.7): if the prior attempt failed as a
    /// simple reconnect, the next attempt forces tier 2; if it failed as
    /// tier 2, the next attempt also retries tier 2 — twice in a row
    /// without a fresh `credentials_rejected` signal escalates to tier 3
    /// (backoff) instead of repeating tier 2 forever. A fresh failure
    /// with valid tokens starts at tier 1.
    ///
    /// This call alone never schedules a delay; call [`Self::current_backoff_delay`]
    /// for how long the caller should wait before acting on the returned
    /// tier. Tier memory survives that wait untouched, which is what
    /// keeps the escalation sticky across an attempt that backs off.
    ///
    /// # Errors
    ///
    /// Returns [`Terminal`] once `max_attempts` has been reached; the
    /// caller should emit a terminal event and stay quiescent.
    pub fn next_tier(&mut self, tokens_within_safety_margin: bool, credentials_rejected: bool) -> Result<Tier, Terminal> {
        if self.attempt >= self.max_attempts {
            return Err(Terminal);
        }
        self.attempt += 1;

        let tier = if credentials_rejected {
            self.full_reauth_repeats = 0;
            Tier::FullReauth
        } else {
            match self.last_tier {
                Some(Tier::SimpleReconnect) => Tier::FullReauth,
                Some(Tier::FullReauth) => {
                    self.full_reauth_repeats += 1;
                    if self.full_reauth_repeats >= 2 {
                        Tier::Backoff
                    } else {
                        Tier::FullReauth
                    }
                }
                Some(Tier::Backoff) => Tier::Backoff,
                None => {
                    if tokens_within_safety_margin {
                        Tier::SimpleReconnect
                    } else {
                        Tier::FullReauth
                    }
                }
            }
        };
        self.last_tier = Some(tier);
        Ok(tier)
    }

    /// The delay the caller should wait before acting on the tier from
    /// the most recent `next_tier` call, drawn from the fixed backoff
    /// schedule and indexed by the attempt count. Does not touch tier
    /// memory — unlike the old `record_failure`, this can't stomp the
    /// sticky escalation state between attempts.
    #[must_use]
    pub fn current_backoff_delay(&self) -> Duration {
        Self::backoff_delay(self.attempt)
    }

    /// Current attempt count.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_clamps_at_last_entry() {
        assert_eq!(ReconnectSupervisor::backoff_delay(1), Duration::from_secs(5));
        assert_eq!(ReconnectSupervisor::backoff_delay(6), Duration::from_secs(60));
        assert_eq!(ReconnectSupervisor::backoff_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn fresh_failure_with_valid_tokens_starts_at_tier1() {
        let mut sup = ReconnectSupervisor::default();
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::SimpleReconnect);
    }

    #[test]
    fn fresh_failure_without_valid_tokens_forces_tier2() {
        let mut sup = ReconnectSupervisor::default();
        assert_eq!(sup.next_tier(false, false).unwrap(), Tier::FullReauth);
    }

    #[test]
    fn credentials_rejected_always_forces_tier2() {
        let mut sup = ReconnectSupervisor::default();
        assert_eq!(sup.next_tier(true, true).unwrap(), Tier::FullReauth);
    }

    #[test]
    fn tier1_failure_forces_tier2_next() {
        let mut sup = ReconnectSupervisor::default();
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::SimpleReconnect);
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::FullReauth);
    }

    #[test]
    fn tier2_failure_stays_tier2() {
        let mut sup = ReconnectSupervisor::default();
        sup.next_tier(true, true).unwrap();
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::FullReauth);
    }

    #[test]
    fn repeated_tier2_failure_escalates_to_backoff_and_stays_there() {
        let mut sup = ReconnectSupervisor::new(5);
        sup.next_tier(true, true).unwrap(); // forced tier 2
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::FullReauth); // still tier 2
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::Backoff); // second repeat: back off
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::Backoff); // stays backed off
    }

    #[test]
    fn backoff_delay_survives_across_attempts_without_resetting_tier() {
        let mut sup = ReconnectSupervisor::default();
        sup.next_tier(true, false).unwrap(); // tier 1, attempt 1
        assert_eq!(sup.current_backoff_delay(), Duration::from_secs(5));
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::FullReauth); // attempt 2, sticky tier 2
        assert_eq!(sup.current_backoff_delay(), Duration::from_secs(10));
    }

    #[test]
    fn terminal_after_max_attempts() {
        let mut sup = ReconnectSupervisor::new(2);
        sup.next_tier(true, false).unwrap();
        sup.next_tier(true, false).unwrap();
        assert_eq!(sup.next_tier(true, false), Err(Terminal));
    }

    #[test]
    fn reset_clears_attempt_count_and_tier_memory() {
        let mut sup = ReconnectSupervisor::new(2);
        sup.next_tier(true, false).unwrap();
        sup.reset();
        assert_eq!(sup.attempt(), 0);
        assert_eq!(sup.next_tier(true, false).unwrap(), Tier::SimpleReconnect);
    }
}
