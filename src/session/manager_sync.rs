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

//! A synchronized facade over [`SessionManager`].
//!
//! For embedders that are not async (a JNI or binder shim): the facade owns
//! the tokio runtime the event loop and notification router run on, and
//! blocks on the few genuinely async entry points. The command entry points
//! only enqueue onto the event loop, so they forward directly.

use bytes::Bytes;
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};

use crate::error::{Error, Result};
use crate::params::uci_packets::{Controlee, SessionHandle, SessionId, UpdateMulticastListAction, UwbAddress};
use crate::policy::PolicyOracle;
use crate::session::manager::{
    DataTransferPhaseConfig, OpenSessionRequest, ReconfigureRequest, SessionManager,
    SessionManagerConfig, StartRangingParams,
};
use crate::session::table::ClosedSessionInfo;
use crate::sink::NotificationSink;
use crate::uci::transport::UciTransport;

pub struct SessionManagerSync {
    runtime: Runtime,
    manager: SessionManager,
}

impl SessionManagerSync {
    /// Build the runtime, then the manager on it. The runtime is owned for
    /// the life of the facade; dropping the facade tears the service down.
    pub fn new<T, S, P>(
        transport: T,
        sink: S,
        policy: P,
        config: SessionManagerConfig,
    ) -> Result<Self>
    where
        T: UciTransport,
        S: NotificationSink,
        P: PolicyOracle,
    {
        let runtime = RuntimeBuilder::new_multi_thread()
            .thread_name("UwbSessionSvc")
            .enable_all()
            .build()
            .map_err(|_| Error::Unknown)?;
        let manager =
            runtime.block_on(async { SessionManager::new(transport, sink, policy, config) });
        Ok(Self { runtime, manager })
    }

    pub fn open_ranging(&self, request: OpenSessionRequest) -> Result<()> {
        self.manager.open_ranging(request)
    }

    pub fn start_ranging(
        &self,
        session_handle: SessionHandle,
        start_params: Option<StartRangingParams>,
    ) -> Result<()> {
        self.manager.start_ranging(session_handle, start_params)
    }

    pub fn stop_ranging(&self, session_handle: SessionHandle) -> Result<()> {
        self.manager.stop_ranging(session_handle)
    }

    pub fn reconfigure_ranging(
        &self,
        session_handle: SessionHandle,
        request: ReconfigureRequest,
    ) -> Result<()> {
        self.manager.reconfigure_ranging(session_handle, request)
    }

    pub fn update_controller_multicast_list(
        &self,
        session_handle: SessionHandle,
        action: UpdateMulticastListAction,
        controlees: Vec<Controlee>,
    ) -> Result<()> {
        self.manager.update_controller_multicast_list(session_handle, action, controlees)
    }

    pub fn close_ranging(&self, session_handle: SessionHandle) -> Result<()> {
        self.manager.close_ranging(session_handle)
    }

    pub fn on_client_death(&self, session_handle: SessionHandle) -> Result<()> {
        self.manager.on_client_death(session_handle)
    }

    pub fn send_data(
        &self,
        session_handle: SessionHandle,
        dest_address: UwbAddress,
        data: Bytes,
    ) -> Result<()> {
        self.manager.send_data(session_handle, dest_address, data)
    }

    pub fn update_dt_tag_ranging_rounds(
        &self,
        session_handle: SessionHandle,
        ranging_round_indexes: Vec<u8>,
    ) -> Result<()> {
        self.manager.update_dt_tag_ranging_rounds(session_handle, ranging_round_indexes)
    }

    pub fn set_data_transfer_phase_config(
        &self,
        session_handle: SessionHandle,
        config: DataTransferPhaseConfig,
    ) -> Result<()> {
        self.manager.set_data_transfer_phase_config(session_handle, config)
    }

    pub fn notify_uid_importance(&self, uid: i32, foreground: bool) -> Result<()> {
        self.manager.notify_uid_importance(uid, foreground)
    }

    /// Blocking query of the session's maximum data packet size.
    pub fn query_max_data_size_bytes(&self, session_handle: SessionHandle) -> Result<u32> {
        self.runtime.block_on(self.manager.query_max_data_size_bytes(session_handle))
    }

    pub fn recently_closed(&self) -> Vec<ClosedSessionInfo> {
        self.runtime.block_on(self.manager.recently_closed())
    }

    pub fn session_id_of(&self, session_handle: SessionHandle) -> Option<SessionId> {
        self.runtime.block_on(self.manager.session_id_of(session_handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::params::fira_app_config_params::FiraAppConfigParamsBuilder;
    use crate::params::uci_packets::{SessionState, SessionType, UwbAddress};
    use crate::params::AppConfigParams;
    use crate::policy::{AttributionSource, StaticPolicy};
    use crate::sink::mock_sink::{MockNotificationSink, SinkEvent};
    use crate::uci::mock_transport::MockUciTransport;
    use crate::uci::notification::SessionNotification;

    #[test]
    fn test_sync_open_ranging() {
        let transport = MockUciTransport::new();
        let (sink, mut events) = MockNotificationSink::new();
        transport.expected_init_session(
            7,
            SessionType::FiraRangingSession,
            vec![SessionNotification::Status {
                session_id: 7,
                session_state: SessionState::SessionStateInit,
                reason_code: 0,
            }],
            Ok(()),
        );
        transport.expected_set_app_configurations(
            7,
            None,
            vec![SessionNotification::Status {
                session_id: 7,
                session_state: SessionState::SessionStateIdle,
                reason_code: 0,
            }],
            Ok(()),
        );

        let policy = StaticPolicy {
            foreground_uids: HashSet::from([1000]),
            ..Default::default()
        };
        let manager_sync = SessionManagerSync::new(
            transport.clone(),
            sink,
            policy,
            SessionManagerConfig::default(),
        )
        .unwrap();

        let params = AppConfigParams::Fira(
            FiraAppConfigParamsBuilder::new()
                .device_mac_address(UwbAddress::Short([0x01, 0x02]))
                .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
                .build()
                .unwrap(),
        );
        manager_sync
            .open_ranging(OpenSessionRequest {
                session_handle: SessionHandle(1),
                session_id: 7,
                session_type: SessionType::FiraRangingSession,
                chip_id: "default".to_owned(),
                attribution_source: AttributionSource::new(1000, None),
                params,
            })
            .unwrap();
        assert_eq!(events.blocking_recv(), Some(SinkEvent::RangingOpened(SessionHandle(1))));
        assert_eq!(manager_sync.session_id_of(SessionHandle(1)), Some(7));
    }
}
