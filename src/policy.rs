// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The platform policy seam.
//!
//! Everything the session core must ask the platform about — app privilege
//! and importance, feature toggles, session limits — funnels through
//! [`PolicyOracle`] so the outer service keeps ownership of settings and
//! permission enforcement.

use std::collections::HashSet;

use crate::params::Protocol;

/// The identity chain of a request, one link per delegating package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributionSource {
    pub uid: i32,
    pub package_name: Option<String>,
    pub next: Option<Box<AttributionSource>>,
}

impl AttributionSource {
    pub fn new(uid: i32, package_name: Option<String>) -> Self {
        Self { uid, package_name, next: None }
    }

    /// Iterate the chain from the direct caller outward.
    pub fn iter(&self) -> AttributionChainIter<'_> {
        AttributionChainIter { next: Some(self) }
    }
}

pub struct AttributionChainIter<'a> {
    next: Option<&'a AttributionSource>,
}

impl<'a> Iterator for AttributionChainIter<'a> {
    type Item = &'a AttributionSource;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next.as_deref();
        Some(current)
    }
}

/// The queries the session core makes against platform policy.
pub trait PolicyOracle: 'static + Send + Sync {
    /// Whether the app is privileged (system app or holder of the privileged
    /// ranging permission); privileged apps are exempt from foreground
    /// gating.
    fn is_app_privileged(&self, uid: i32, package_name: Option<&str>) -> bool;

    /// Whether the app currently has a foreground activity or service.
    fn is_app_foreground(&self, uid: i32, package_name: Option<&str>) -> bool;

    /// Whether sessions of background apps may range at all.
    fn background_ranging_enabled(&self) -> bool;

    fn ranging_error_streak_timer_enabled(&self) -> bool;

    fn ranging_error_streak_timeout_ms(&self) -> u64 {
        30_000
    }

    /// Whether stop fetches the CCC/ALIRO "stopped" parameters.
    fn stopped_params_enabled(&self, protocol: Protocol) -> bool;

    /// The admission limit for the protocol on the chip.
    fn max_sessions_per_protocol(&self, protocol: Protocol, chip_id: &str) -> usize;

    /// Replaces the default-sentinel priority band when set. Does not lock
    /// the session's priority.
    fn default_priority_override(&self) -> Option<u8> {
        None
    }

    /// Re-checked on every data/radar delivery when the session requires it.
    fn has_data_delivery_permission(&self, attribution: &AttributionSource) -> bool;

    /// How long a disallowed background app may keep ranging before the
    /// session is stopped.
    fn background_app_stop_timeout_ms(&self) -> u64 {
        120_000
    }
}

/// A [`PolicyOracle`] backed by plain values, for embedders with static
/// policy and for tests.
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    pub privileged_uids: HashSet<i32>,
    pub foreground_uids: HashSet<i32>,
    pub background_ranging_enabled: bool,
    pub ranging_error_streak_timer_enabled: bool,
    pub ranging_error_streak_timeout_ms: u64,
    pub stopped_params_enabled: bool,
    pub max_fira_sessions: usize,
    pub max_ccc_sessions: usize,
    pub max_aliro_sessions: usize,
    pub max_radar_sessions: usize,
    pub default_priority_override: Option<u8>,
    pub data_delivery_permission_granted: bool,
    pub background_app_stop_timeout_ms: u64,
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self {
            privileged_uids: HashSet::new(),
            foreground_uids: HashSet::new(),
            background_ranging_enabled: true,
            ranging_error_streak_timer_enabled: true,
            ranging_error_streak_timeout_ms: 30_000,
            stopped_params_enabled: false,
            max_fira_sessions: 5,
            max_ccc_sessions: 1,
            max_aliro_sessions: 1,
            max_radar_sessions: 1,
            default_priority_override: None,
            data_delivery_permission_granted: true,
            background_app_stop_timeout_ms: 120_000,
        }
    }
}

impl PolicyOracle for StaticPolicy {
    fn is_app_privileged(&self, uid: i32, _package_name: Option<&str>) -> bool {
        self.privileged_uids.contains(&uid)
    }

    fn is_app_foreground(&self, uid: i32, _package_name: Option<&str>) -> bool {
        self.foreground_uids.contains(&uid)
    }

    fn background_ranging_enabled(&self) -> bool {
        self.background_ranging_enabled
    }

    fn ranging_error_streak_timer_enabled(&self) -> bool {
        self.ranging_error_streak_timer_enabled
    }

    fn ranging_error_streak_timeout_ms(&self) -> u64 {
        self.ranging_error_streak_timeout_ms
    }

    fn stopped_params_enabled(&self, protocol: Protocol) -> bool {
        matches!(protocol, Protocol::Ccc | Protocol::Aliro) && self.stopped_params_enabled
    }

    fn max_sessions_per_protocol(&self, protocol: Protocol, _chip_id: &str) -> usize {
        match protocol {
            Protocol::Fira => self.max_fira_sessions,
            Protocol::Ccc => self.max_ccc_sessions,
            Protocol::Aliro => self.max_aliro_sessions,
            Protocol::Radar => self.max_radar_sessions,
        }
    }

    fn default_priority_override(&self) -> Option<u8> {
        self.default_priority_override
    }

    fn has_data_delivery_permission(&self, _attribution: &AttributionSource) -> bool {
        self.data_delivery_permission_granted
    }

    fn background_app_stop_timeout_ms(&self) -> u64 {
        self.background_app_stop_timeout_ms
    }
}
