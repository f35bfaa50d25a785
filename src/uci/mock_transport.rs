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

//! A scripted [`UciTransport`] for tests.
//!
//! Each `expected_*` call enqueues one expected command together with the
//! canned result and the notifications the UWBS would emit for it. The mock
//! replays them in order and fails any command it was not scripted for.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::error;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::params::uci_packets::{
    AppConfigTlv, AppConfigTlvType, Controlee, ProtocolVersion, SessionId, SessionToken,
    SessionType, SessionUpdateDtTagRangingRoundsResponse, UpdateMulticastListAction,
};
use crate::uci::notification::SessionNotification;
use crate::uci::transport::UciTransport;

#[derive(Debug)]
enum ExpectedCall {
    InitSession {
        session_id: SessionId,
        session_type: SessionType,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    DeinitSession {
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    SetAppConfigurations {
        session_id: SessionId,
        expected_config_tlvs: Option<Vec<AppConfigTlv>>,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    GetAppConfigurations {
        session_id: SessionId,
        out: Result<Vec<AppConfigTlv>>,
    },
    StartRanging {
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    StopRanging {
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    MulticastListUpdate {
        session_id: SessionId,
        action: UpdateMulticastListAction,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    SendData {
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    SetDataTransferPhaseConfig {
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    },
    UpdateDtTagRangingRounds {
        session_id: SessionId,
        out: Result<SessionUpdateDtTagRangingRoundsResponse>,
    },
    SetHybridSessionConfiguration {
        session_id: SessionId,
        out: Result<()>,
    },
    QueryMaxDataSize {
        session_id: SessionId,
        out: Result<u32>,
    },
    GetSessionToken {
        session_id: SessionId,
        out: Result<SessionToken>,
    },
    QueryUwbsTimestamp {
        out: Result<u64>,
    },
}

#[derive(Default)]
struct Inner {
    expected_calls: Mutex<VecDeque<ExpectedCall>>,
    notf_sender: Mutex<Option<mpsc::UnboundedSender<SessionNotification>>>,
    received_app_configs: Mutex<Vec<(SessionId, Vec<AppConfigTlv>)>>,
    expect_call_consumed: Notify,
}

/// The scripted transport. Clones share the expectation queue, so a test can
/// keep one handle while the session manager owns the other.
#[derive(Clone, Default)]
pub struct MockUciTransport {
    inner: Arc<Inner>,
}

impl MockUciTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an unsolicited notification, as if the UWBS emitted it.
    pub fn send_notification(&self, notf: SessionNotification) {
        if let Some(sender) = self.inner.notf_sender.lock().unwrap().as_ref() {
            let _ = sender.send(notf);
        }
    }

    /// Wait until every scripted call was consumed.
    pub async fn wait_expected_calls_done(&self) -> bool {
        while !self.inner.expected_calls.lock().unwrap().is_empty() {
            let notified = self.inner.expect_call_consumed.notified();
            if tokio::time::timeout(Duration::from_secs(1), notified).await.is_err() {
                return false;
            }
        }
        true
    }

    /// The TLV lists received by `set_app_configurations`, in call order.
    pub fn received_app_configs(&self) -> Vec<(SessionId, Vec<AppConfigTlv>)> {
        self.inner.received_app_configs.lock().unwrap().clone()
    }

    pub fn expected_init_session(
        &self,
        session_id: SessionId,
        session_type: SessionType,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::InitSession { session_id, session_type, notfs, out });
    }

    pub fn expected_deinit_session(
        &self,
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::DeinitSession { session_id, notfs, out });
    }

    pub fn expected_set_app_configurations(
        &self,
        session_id: SessionId,
        expected_config_tlvs: Option<Vec<AppConfigTlv>>,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::SetAppConfigurations {
            session_id,
            expected_config_tlvs,
            notfs,
            out,
        });
    }

    pub fn expected_get_app_configurations(
        &self,
        session_id: SessionId,
        out: Result<Vec<AppConfigTlv>>,
    ) {
        self.push(ExpectedCall::GetAppConfigurations { session_id, out });
    }

    pub fn expected_start_ranging(
        &self,
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::StartRanging { session_id, notfs, out });
    }

    pub fn expected_stop_ranging(
        &self,
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::StopRanging { session_id, notfs, out });
    }

    pub fn expected_controller_multicast_list_update(
        &self,
        session_id: SessionId,
        action: UpdateMulticastListAction,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::MulticastListUpdate { session_id, action, notfs, out });
    }

    pub fn expected_send_data(
        &self,
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::SendData { session_id, notfs, out });
    }

    pub fn expected_set_data_transfer_phase_config(
        &self,
        session_id: SessionId,
        notfs: Vec<SessionNotification>,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::SetDataTransferPhaseConfig { session_id, notfs, out });
    }

    pub fn expected_session_update_dt_tag_ranging_rounds(
        &self,
        session_id: SessionId,
        out: Result<SessionUpdateDtTagRangingRoundsResponse>,
    ) {
        self.push(ExpectedCall::UpdateDtTagRangingRounds { session_id, out });
    }

    pub fn expected_set_hybrid_session_configuration(
        &self,
        session_id: SessionId,
        out: Result<()>,
    ) {
        self.push(ExpectedCall::SetHybridSessionConfiguration { session_id, out });
    }

    pub fn expected_query_max_data_size_bytes(&self, session_id: SessionId, out: Result<u32>) {
        self.push(ExpectedCall::QueryMaxDataSize { session_id, out });
    }

    pub fn expected_get_session_token(
        &self,
        session_id: SessionId,
        out: Result<SessionToken>,
    ) {
        self.push(ExpectedCall::GetSessionToken { session_id, out });
    }

    pub fn expected_query_uwbs_timestamp_micros(&self, out: Result<u64>) {
        self.push(ExpectedCall::QueryUwbsTimestamp { out });
    }

    fn push(&self, call: ExpectedCall) {
        self.inner.expected_calls.lock().unwrap().push_back(call);
    }

    fn pop(&self, method: &str) -> Option<ExpectedCall> {
        let call = self.inner.expected_calls.lock().unwrap().pop_front();
        if call.is_none() {
            error!("MockUciTransport: unexpected call of {}", method);
        }
        call
    }

    fn consume(&self, notfs: Vec<SessionNotification>) {
        for notf in notfs {
            self.send_notification(notf);
        }
        self.inner.expect_call_consumed.notify_waiters();
    }

    fn mismatch(&self, method: &str, call: ExpectedCall) -> Error {
        error!("MockUciTransport: call of {} does not match expectation {:?}", method, call);
        self.inner.expect_call_consumed.notify_waiters();
        Error::Unknown
    }
}

#[async_trait]
impl UciTransport for MockUciTransport {
    fn set_session_notification_sender(
        &mut self,
        sender: mpsc::UnboundedSender<SessionNotification>,
    ) {
        self.inner.notf_sender.lock().unwrap().replace(sender);
    }

    async fn init_session(
        &self,
        session_id: SessionId,
        session_type: SessionType,
        _chip_id: &str,
    ) -> Result<()> {
        match self.pop("init_session") {
            Some(ExpectedCall::InitSession {
                session_id: expected_id,
                session_type: expected_type,
                notfs,
                out,
            }) if expected_id == session_id && expected_type == session_type => {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("init_session", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn deinit_session(&self, session_id: SessionId, _chip_id: &str) -> Result<()> {
        match self.pop("deinit_session") {
            Some(ExpectedCall::DeinitSession { session_id: expected_id, notfs, out })
                if expected_id == session_id =>
            {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("deinit_session", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn set_app_configurations(
        &self,
        session_id: SessionId,
        config_tlvs: Vec<AppConfigTlv>,
        _chip_id: &str,
        _uci_version: ProtocolVersion,
    ) -> Result<()> {
        self.inner
            .received_app_configs
            .lock()
            .unwrap()
            .push((session_id, config_tlvs.clone()));
        match self.pop("set_app_configurations") {
            Some(ExpectedCall::SetAppConfigurations {
                session_id: expected_id,
                expected_config_tlvs,
                notfs,
                out,
            }) if expected_id == session_id
                && expected_config_tlvs.as_ref().map_or(true, |expected| *expected == config_tlvs) =>
            {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("set_app_configurations", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn get_app_configurations(
        &self,
        session_id: SessionId,
        _config_ids: Vec<AppConfigTlvType>,
        _chip_id: &str,
    ) -> Result<Vec<AppConfigTlv>> {
        match self.pop("get_app_configurations") {
            Some(ExpectedCall::GetAppConfigurations { session_id: expected_id, out })
                if expected_id == session_id =>
            {
                self.consume(vec![]);
                out
            }
            Some(call) => Err(self.mismatch("get_app_configurations", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn start_ranging(&self, session_id: SessionId, _chip_id: &str) -> Result<()> {
        match self.pop("start_ranging") {
            Some(ExpectedCall::StartRanging { session_id: expected_id, notfs, out })
                if expected_id == session_id =>
            {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("start_ranging", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn stop_ranging(&self, session_id: SessionId, _chip_id: &str) -> Result<()> {
        match self.pop("stop_ranging") {
            Some(ExpectedCall::StopRanging { session_id: expected_id, notfs, out })
                if expected_id == session_id =>
            {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("stop_ranging", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn controller_multicast_list_update(
        &self,
        session_id: SessionId,
        action: UpdateMulticastListAction,
        _controlees: Vec<Controlee>,
        _chip_id: &str,
    ) -> Result<()> {
        match self.pop("controller_multicast_list_update") {
            Some(ExpectedCall::MulticastListUpdate {
                session_id: expected_id,
                action: expected_action,
                notfs,
                out,
            }) if expected_id == session_id && expected_action == action => {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("controller_multicast_list_update", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn send_data(
        &self,
        session_id: SessionId,
        _dest_address: [u8; 8],
        _uci_sequence_number: u16,
        _data: Bytes,
        _chip_id: &str,
    ) -> Result<()> {
        match self.pop("send_data") {
            Some(ExpectedCall::SendData { session_id: expected_id, notfs, out })
                if expected_id == session_id =>
            {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("send_data", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn set_data_transfer_phase_config(
        &self,
        session_id: SessionId,
        _dtpcm_repetition: u8,
        _data_transfer_control: u8,
        _dtpml_size: u8,
        _mac_addresses: Vec<u8>,
        _slot_bitmaps: Vec<u8>,
        _chip_id: &str,
    ) -> Result<()> {
        match self.pop("set_data_transfer_phase_config") {
            Some(ExpectedCall::SetDataTransferPhaseConfig {
                session_id: expected_id,
                notfs,
                out,
            }) if expected_id == session_id => {
                self.consume(notfs);
                out
            }
            Some(call) => Err(self.mismatch("set_data_transfer_phase_config", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn session_update_dt_tag_ranging_rounds(
        &self,
        session_id: SessionId,
        _ranging_round_indexes: Vec<u8>,
        _chip_id: &str,
    ) -> Result<SessionUpdateDtTagRangingRoundsResponse> {
        match self.pop("session_update_dt_tag_ranging_rounds") {
            Some(ExpectedCall::UpdateDtTagRangingRounds { session_id: expected_id, out })
                if expected_id == session_id =>
            {
                self.consume(vec![]);
                out
            }
            Some(call) => Err(self.mismatch("session_update_dt_tag_ranging_rounds", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn set_hybrid_session_configuration(
        &self,
        session_id: SessionId,
        _number_of_phases: u8,
        _update_time: [u8; 8],
        _phase_list: Bytes,
        _chip_id: &str,
    ) -> Result<()> {
        match self.pop("set_hybrid_session_configuration") {
            Some(ExpectedCall::SetHybridSessionConfiguration {
                session_id: expected_id,
                out,
            }) if expected_id == session_id => {
                self.consume(vec![]);
                out
            }
            Some(call) => Err(self.mismatch("set_hybrid_session_configuration", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn query_max_data_size_bytes(
        &self,
        session_id: SessionId,
        _chip_id: &str,
    ) -> Result<u32> {
        match self.pop("query_max_data_size_bytes") {
            Some(ExpectedCall::QueryMaxDataSize { session_id: expected_id, out })
                if expected_id == session_id =>
            {
                self.consume(vec![]);
                out
            }
            Some(call) => Err(self.mismatch("query_max_data_size_bytes", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn get_session_token(
        &self,
        session_id: SessionId,
        _chip_id: &str,
    ) -> Result<SessionToken> {
        match self.pop("get_session_token") {
            Some(ExpectedCall::GetSessionToken { session_id: expected_id, out })
                if expected_id == session_id =>
            {
                self.consume(vec![]);
                out
            }
            Some(call) => Err(self.mismatch("get_session_token", call)),
            None => Err(Error::Unknown),
        }
    }

    async fn query_uwbs_timestamp_micros(&self, _chip_id: &str) -> Result<u64> {
        match self.pop("query_uwbs_timestamp_micros") {
            Some(ExpectedCall::QueryUwbsTimestamp { out }) => {
                self.consume(vec![]);
                out
            }
            Some(call) => Err(self.mismatch("query_uwbs_timestamp_micros", call)),
            None => Err(Error::Unknown),
        }
    }
}
