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

//! Admission control for session opens: policy gating, duplicate checks and
//! the per-protocol session limits with FiRa priority eviction.

use log::{debug, info};

use crate::error::{Error, Result};
use crate::params::uci_packets::{SessionHandle, SessionId};
use crate::params::Protocol;
use crate::policy::{AttributionSource, PolicyOracle};
use crate::session::table::SessionTable;

/// The outcome of an accepted admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmissionVerdict {
    Admit,
    /// Admit once the named session was deinited with `MaxSessionsReached`.
    AdmitAfterEviction(SessionHandle),
}

/// The first link of the attribution chain that is not privileged, if any.
/// Sessions with an all-privileged chain are exempt from foreground gating.
pub(crate) fn first_non_privileged_link<'a>(
    attribution_source: &'a AttributionSource,
    policy: &dyn PolicyOracle,
) -> Option<&'a AttributionSource> {
    attribution_source
        .iter()
        .find(|link| !policy.is_app_privileged(link.uid, link.package_name.as_deref()))
}

/// Run the admission checks of spec'd order: background policy, duplicates,
/// session limits.
pub(crate) async fn check_admission(
    table: &SessionTable,
    policy: &dyn PolicyOracle,
    session_handle: SessionHandle,
    session_id: SessionId,
    protocol: Protocol,
    chip_id: &str,
    non_privileged_foreground: Option<bool>,
    incoming_priority: u8,
) -> Result<AdmissionVerdict> {
    if let Some(foreground) = non_privileged_foreground {
        if !foreground && !policy.background_ranging_enabled() {
            info!("open of {} refused: background ranging disabled", session_handle);
            return Err(Error::PolicyRefused);
        }
    }

    if table.contains_handle(&session_handle) || table.contains_id(session_id) {
        info!("open of {} refused: duplicate handle or id {}", session_handle, session_id);
        return Err(Error::DuplicatedSession);
    }

    let max_sessions = policy.max_sessions_per_protocol(protocol, chip_id);
    if table.count_by_protocol(protocol) < max_sessions {
        return Ok(AdmissionVerdict::Admit);
    }

    // CCC, ALIRO and radar sessions all share one priority band, so there is
    // nothing to evict.
    if protocol != Protocol::Fira {
        return Err(Error::MaxSessionsExceeded);
    }

    match table.session_with_lowest_priority(protocol).await {
        Some((lowest_handle, lowest_priority)) if lowest_priority < incoming_priority => {
            debug!(
                "evicting {} (priority {}) for {} (priority {})",
                lowest_handle, lowest_priority, session_handle, incoming_priority
            );
            Ok(AdmissionVerdict::AdmitAfterEviction(lowest_handle))
        }
        _ => Err(Error::MaxSessionsExceeded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::params::fira_app_config_params::FiraAppConfigParamsBuilder;
    use crate::params::uci_packets::{ProtocolVersion, SessionType, UwbAddress};
    use crate::params::AppConfigParams;
    use crate::policy::StaticPolicy;
    use crate::session::session::{SessionSlot, UwbSession};
    use crate::utils::SystemClock;

    fn add_session(table: &mut SessionTable, n: u64, priority: u8) {
        let params = FiraAppConfigParamsBuilder::new()
            .device_mac_address(UwbAddress::Short([0x01, 0x02]))
            .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
            .build()
            .unwrap();
        let session = UwbSession::new(
            SessionHandle(n),
            n as SessionId,
            SessionType::FiraRangingSession,
            "default".to_owned(),
            ProtocolVersion::new(2, 0),
            AttributionSource::new(1000 + n as i32, None),
            AppConfigParams::Fira(params),
            priority,
            false,
            None,
            true,
        );
        table.insert(
            SessionHandle(n),
            n as SessionId,
            Protocol::Fira,
            "default".to_owned(),
            Arc::new(SessionSlot::new(session)),
        );
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let mut table = SessionTable::new(Arc::new(SystemClock::new()));
        let policy = StaticPolicy::default();
        add_session(&mut table, 1, 50);
        let result = check_admission(
            &table,
            &policy,
            SessionHandle(1),
            7,
            Protocol::Fira,
            "default",
            None,
            50,
        )
        .await;
        assert_eq!(result, Err(Error::DuplicatedSession));

        let result = check_admission(
            &table,
            &policy,
            SessionHandle(9),
            1,
            Protocol::Fira,
            "default",
            None,
            50,
        )
        .await;
        assert_eq!(result, Err(Error::DuplicatedSession));
    }

    #[tokio::test]
    async fn test_background_policy_refusal() {
        let table = SessionTable::new(Arc::new(SystemClock::new()));
        let policy = StaticPolicy { background_ranging_enabled: false, ..Default::default() };
        let result = check_admission(
            &table,
            &policy,
            SessionHandle(1),
            7,
            Protocol::Fira,
            "default",
            Some(false),
            40,
        )
        .await;
        assert_eq!(result, Err(Error::PolicyRefused));

        // Foreground apps are unaffected.
        let result = check_admission(
            &table,
            &policy,
            SessionHandle(1),
            7,
            Protocol::Fira,
            "default",
            Some(true),
            60,
        )
        .await;
        assert_eq!(result, Ok(AdmissionVerdict::Admit));
    }

    #[tokio::test]
    async fn test_fira_eviction_requires_strictly_lower_priority() {
        let mut table = SessionTable::new(Arc::new(SystemClock::new()));
        let policy = StaticPolicy { max_fira_sessions: 2, ..Default::default() };
        add_session(&mut table, 1, 40);
        add_session(&mut table, 2, 60);

        // Priority 70 evicts the priority-40 session.
        let result = check_admission(
            &table,
            &policy,
            SessionHandle(3),
            3,
            Protocol::Fira,
            "default",
            None,
            70,
        )
        .await;
        assert_eq!(result, Ok(AdmissionVerdict::AdmitAfterEviction(SessionHandle(1))));

        // Equal priority does not evict.
        let result = check_admission(
            &table,
            &policy,
            SessionHandle(3),
            3,
            Protocol::Fira,
            "default",
            None,
            40,
        )
        .await;
        assert_eq!(result, Err(Error::MaxSessionsExceeded));
    }

    #[tokio::test]
    async fn test_non_fira_protocols_never_evict() {
        let mut table = SessionTable::new(Arc::new(SystemClock::new()));
        let policy = StaticPolicy { max_ccc_sessions: 0, ..Default::default() };
        add_session(&mut table, 1, 40);
        let result = check_admission(
            &table,
            &policy,
            SessionHandle(2),
            2,
            Protocol::Ccc,
            "default",
            None,
            80,
        )
        .await;
        assert_eq!(result, Err(Error::MaxSessionsExceeded));
    }
}
