//! License policy evaluation.
//!
//! The policy engine is a pure state machine over server-granted usage terms.
//! It performs no I/O and never reads a clock; callers pass the current time
//! into every operation. It is the sole arbiter of whether decryption is
//! currently permitted.

use std::collections::HashMap;

use crate::protocol::{License, LicenseIdentification, LicensePolicy, LicenseType};

/// Query map keys returned by [`PolicyEngine::query`].
pub mod query_keys {
    pub const LICENSE_TYPE: &str = "LicenseType";
    pub const PLAY_ALLOWED: &str = "PlayAllowed";
    pub const PERSIST_ALLOWED: &str = "PersistAllowed";
    pub const RENEW_ALLOWED: &str = "RenewAllowed";
    pub const LICENSE_DURATION_REMAINING: &str = "LicenseDurationRemaining";
    pub const PLAYBACK_DURATION_REMAINING: &str = "PlaybackDurationRemaining";
    pub const RENEWAL_SERVER_URL: &str = "RenewalServerUrl";
}

/// Lifecycle state of the granted policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Initial,
    InitialPendingUsage,
    CanPlay,
    NeedRenewal,
    WaitingLicenseUpdate,
    Expired,
}

/// Event emitted by a timer evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    LicenseExpired,
    LicenseRenewalNeeded,
}

/// Time-window policy state machine.
#[derive(Debug)]
pub struct PolicyEngine {
    state: PolicyState,
    policy: LicensePolicy,
    license_id: LicenseIdentification,
    begin_usage_on_receipt: bool,
    license_start_time: u64,
    license_received_time: u64,
    playback_start_time: u64,
    next_renewal_time: u64,
    /// Effective license window: min of rental and license durations with 0
    /// excluded unless both are 0.
    max_duration: u64,
    can_decrypt: bool,
}

impl PolicyEngine {
    pub fn new(begin_usage_on_receipt: bool) -> Self {
        Self {
            state: PolicyState::Initial,
            policy: LicensePolicy::default(),
            license_id: LicenseIdentification::default(),
            begin_usage_on_receipt,
            license_start_time: 0,
            license_received_time: 0,
            playback_start_time: 0,
            next_renewal_time: 0,
            max_duration: 0,
            can_decrypt: false,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Cached decryptability hint. Set only by state transitions so the
    /// decrypt path never recomputes duration arithmetic.
    pub fn can_decrypt(&self) -> bool {
        self.can_decrypt
    }

    /// Identification echoed back on renewal and release requests.
    pub fn license_id(&self) -> &LicenseIdentification {
        &self.license_id
    }

    /// Renewal server URL from the current policy, when the server set one.
    pub fn renewal_server_url(&self) -> Option<&str> {
        self.policy.renewal_server_url.as_deref()
    }

    /// Apply a freshly granted license, discarding all prior state.
    ///
    /// Ignored when the grant carries no license start time.
    pub fn set_license(&mut self, now: u64, license: &License) {
        let start_time = match license.license_start_time {
            Some(t) if t >= 0 => t as u64,
            _ => {
                log::warn!("license grant without start time ignored");
                return;
            }
        };

        self.state = PolicyState::Initial;
        self.policy = license.policy.clone().unwrap_or_default();
        self.license_id = license.id.clone().unwrap_or_default();
        self.license_start_time = start_time;
        self.license_received_time = now;
        self.playback_start_time = 0;
        self.can_decrypt = false;

        self.apply_policy(now);
    }

    /// Merge a renewal grant into the current policy.
    ///
    /// Rejected (no state change) unless the incoming identification advances
    /// the version. Fields present in the update override; unset fields keep
    /// their prior values.
    ///
    /// Returns whether the update was applied.
    pub fn update_license(&mut self, now: u64, license: &License) -> bool {
        let incoming = match license.id.as_ref() {
            Some(id) => id,
            None => return false,
        };
        if incoming.version.unwrap_or(0) <= self.license_id.version.unwrap_or(0) {
            log::warn!(
                "renewal without version advance rejected (current {}, incoming {})",
                self.license_id.version.unwrap_or(0),
                incoming.version.unwrap_or(0)
            );
            return false;
        }

        if let Some(update) = license.policy.as_ref() {
            merge_policy(&mut self.policy, update);
        }
        self.license_id = incoming.clone();
        // the granted window re-anchors at the renewal, extending access
        self.license_received_time = now;

        self.apply_policy(now);
        true
    }

    /// Start the playback clock on the first actual decrypt attempt.
    ///
    /// Idempotent: a running playback clock makes this a no-op.
    pub fn begin_decryption(&mut self, now: u64) {
        if self.playback_start_time != 0 {
            return;
        }
        self.playback_start_time = now;

        match self.state {
            PolicyState::InitialPendingUsage
            | PolicyState::NeedRenewal
            | PolicyState::WaitingLicenseUpdate => {
                self.state = if self.policy.renew_with_usage.unwrap_or(false) {
                    PolicyState::NeedRenewal
                } else {
                    PolicyState::CanPlay
                };
            }
            _ => {}
        }
    }

    /// Evaluate time windows and renewal triggers against `now`.
    ///
    /// Expiry of either the license or the playback window dominates every
    /// other consideration.
    pub fn on_timer_event(&mut self, now: u64) -> Option<PolicyEvent> {
        if matches!(self.state, PolicyState::Initial | PolicyState::Expired) {
            return None;
        }

        if self.license_window_expired(now) || self.playback_window_expired(now) {
            self.state = PolicyState::Expired;
            self.can_decrypt = false;
            return Some(PolicyEvent::LicenseExpired);
        }

        let renewal_needed = match self.state {
            PolicyState::CanPlay | PolicyState::InitialPendingUsage => {
                let delay = duration(self.policy.renewal_delay_seconds);
                self.policy.can_renew.unwrap_or(false) && delay != 0 && now >= self.next_renewal_time
            }
            PolicyState::NeedRenewal => true,
            PolicyState::WaitingLicenseUpdate => now >= self.next_renewal_time,
            PolicyState::Initial | PolicyState::Expired => false,
        };

        if renewal_needed {
            self.state = PolicyState::WaitingLicenseUpdate;
            self.next_renewal_time = now + duration(self.policy.renewal_retry_interval_seconds);
            return Some(PolicyEvent::LicenseRenewalNeeded);
        }

        None
    }

    /// Whether either policy window has actually elapsed at `now`. Used to
    /// reclassify opaque decrypt failures.
    pub fn has_expired_window(&self, now: u64) -> bool {
        self.license_window_expired(now) || self.playback_window_expired(now)
    }

    /// Snapshot the current policy terms as a string-keyed map.
    ///
    /// Fails while no license has ever been applied.
    pub fn query(&self, now: u64) -> Option<HashMap<String, String>> {
        if self.state == PolicyState::Initial {
            return None;
        }

        let license_remaining = remaining(self.license_received_time, self.max_duration, now);
        let playback_remaining = if self.playback_start_time == 0 {
            duration(self.policy.playback_duration_seconds)
        } else {
            remaining(
                self.playback_start_time,
                duration(self.policy.playback_duration_seconds),
                now,
            )
        };

        let license_type = self
            .license_id
            .license_type
            .and_then(|v| LicenseType::try_from(v).ok())
            .map(|t| t.as_str())
            .unwrap_or("UNKNOWN");

        let mut map = HashMap::new();
        map.insert(query_keys::LICENSE_TYPE.to_string(), license_type.to_string());
        map.insert(
            query_keys::PLAY_ALLOWED.to_string(),
            self.policy.can_play.unwrap_or(false).to_string(),
        );
        map.insert(
            query_keys::PERSIST_ALLOWED.to_string(),
            self.policy.can_persist.unwrap_or(false).to_string(),
        );
        map.insert(
            query_keys::RENEW_ALLOWED.to_string(),
            self.policy.can_renew.unwrap_or(false).to_string(),
        );
        map.insert(
            query_keys::LICENSE_DURATION_REMAINING.to_string(),
            license_remaining.to_string(),
        );
        map.insert(
            query_keys::PLAYBACK_DURATION_REMAINING.to_string(),
            playback_remaining.to_string(),
        );
        map.insert(
            query_keys::RENEWAL_SERVER_URL.to_string(),
            self.policy.renewal_server_url.clone().unwrap_or_default(),
        );
        Some(map)
    }

    /// Shared tail of `set_license` and `update_license`.
    fn apply_policy(&mut self, now: u64) {
        if !self.policy.can_play.unwrap_or(false) {
            self.state = PolicyState::Expired;
            self.can_decrypt = false;
            return;
        }

        self.max_duration = effective_max_duration(
            duration(self.policy.rental_duration_seconds),
            duration(self.policy.license_duration_seconds),
        );
        self.next_renewal_time = now + duration(self.policy.renewal_delay_seconds);
        self.can_decrypt = true;

        if self.begin_usage_on_receipt {
            if self.playback_start_time == 0 {
                self.playback_start_time = now;
            }
            self.state = if self.policy.renew_with_usage.unwrap_or(false) {
                PolicyState::NeedRenewal
            } else {
                PolicyState::CanPlay
            };
        } else if self.playback_start_time == 0 {
            self.state = PolicyState::InitialPendingUsage;
        } else {
            self.state = PolicyState::CanPlay;
        }
    }

    fn license_window_expired(&self, now: u64) -> bool {
        self.max_duration != 0 && now > self.license_received_time + self.max_duration
    }

    fn playback_window_expired(&self, now: u64) -> bool {
        let playback = duration(self.policy.playback_duration_seconds);
        playback != 0
            && self.playback_start_time != 0
            && now > self.playback_start_time + playback
    }
}

/// A duration of 0 means unbounded; negative values from the wire are
/// clamped to unbounded as well.
fn duration(field: Option<i64>) -> u64 {
    field.filter(|&v| v > 0).map(|v| v as u64).unwrap_or(0)
}

fn remaining(start: u64, dur: u64, now: u64) -> u64 {
    if dur == 0 {
        return 0;
    }
    (start + dur).saturating_sub(now)
}

/// Minimum of two windows where 0 is unbounded and excluded unless both are.
fn effective_max_duration(rental: u64, license: u64) -> u64 {
    match (rental, license) {
        (0, 0) => 0,
        (0, l) => l,
        (r, 0) => r,
        (r, l) => r.min(l),
    }
}

/// Field-wise merge: present fields override, unset fields persist.
fn merge_policy(current: &mut LicensePolicy, update: &LicensePolicy) {
    macro_rules! take {
        ($field:ident) => {
            if update.$field.is_some() {
                current.$field = update.$field.clone();
            }
        };
    }
    take!(can_play);
    take!(can_persist);
    take!(can_renew);
    take!(rental_duration_seconds);
    take!(license_duration_seconds);
    take!(playback_duration_seconds);
    take!(renewal_server_url);
    take!(renewal_delay_seconds);
    take!(renewal_retry_interval_seconds);
    take!(renew_with_usage);
}
