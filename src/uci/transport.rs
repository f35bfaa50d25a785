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

//! The downward seam to the UCI stack.
//!
//! Implementations own command framing, retries and the HAL connection. The
//! session layer only sees fallible command entry points plus the
//! [`SessionNotification`] stream installed at construction.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::params::uci_packets::{
    AppConfigTlv, AppConfigTlvType, Controlee, ProtocolVersion, SessionId, SessionToken,
    SessionType, SessionUpdateDtTagRangingRoundsResponse, UpdateMulticastListAction,
};
use crate::uci::notification::SessionNotification;

/// The UCI command surface the session layer drives.
///
/// Methods are cancel-safe from the caller's point of view: a command that
/// was issued may still complete on the UWBS after the caller gave up
/// waiting, and the resulting notification is routed like any other.
#[async_trait]
pub trait UciTransport: 'static + Send + Sync {
    /// Install the channel that carries session notifications upward. Called
    /// once, before any command is issued.
    fn set_session_notification_sender(
        &mut self,
        sender: mpsc::UnboundedSender<SessionNotification>,
    );

    async fn init_session(
        &self,
        session_id: SessionId,
        session_type: SessionType,
        chip_id: &str,
    ) -> Result<()>;

    async fn deinit_session(&self, session_id: SessionId, chip_id: &str) -> Result<()>;

    async fn set_app_configurations(
        &self,
        session_id: SessionId,
        config_tlvs: Vec<AppConfigTlv>,
        chip_id: &str,
        uci_version: ProtocolVersion,
    ) -> Result<()>;

    async fn get_app_configurations(
        &self,
        session_id: SessionId,
        config_ids: Vec<AppConfigTlvType>,
        chip_id: &str,
    ) -> Result<Vec<AppConfigTlv>>;

    async fn start_ranging(&self, session_id: SessionId, chip_id: &str) -> Result<()>;

    async fn stop_ranging(&self, session_id: SessionId, chip_id: &str) -> Result<()>;

    async fn controller_multicast_list_update(
        &self,
        session_id: SessionId,
        action: UpdateMulticastListAction,
        controlees: Vec<Controlee>,
        chip_id: &str,
    ) -> Result<()>;

    /// Queue one application data packet toward the peer. The outcome is
    /// reported asynchronously per sequence number.
    async fn send_data(
        &self,
        session_id: SessionId,
        dest_address: [u8; 8],
        uci_sequence_number: u16,
        data: Bytes,
        chip_id: &str,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    async fn set_data_transfer_phase_config(
        &self,
        session_id: SessionId,
        dtpcm_repetition: u8,
        data_transfer_control: u8,
        dtpml_size: u8,
        mac_addresses: Vec<u8>,
        slot_bitmaps: Vec<u8>,
        chip_id: &str,
    ) -> Result<()>;

    async fn session_update_dt_tag_ranging_rounds(
        &self,
        session_id: SessionId,
        ranging_round_indexes: Vec<u8>,
        chip_id: &str,
    ) -> Result<SessionUpdateDtTagRangingRoundsResponse>;

    async fn set_hybrid_session_configuration(
        &self,
        session_id: SessionId,
        number_of_phases: u8,
        update_time: [u8; 8],
        phase_list: Bytes,
        chip_id: &str,
    ) -> Result<()>;

    async fn query_max_data_size_bytes(
        &self,
        session_id: SessionId,
        chip_id: &str,
    ) -> Result<u32>;

    async fn get_session_token(
        &self,
        session_id: SessionId,
        chip_id: &str,
    ) -> Result<SessionToken>;

    async fn query_uwbs_timestamp_micros(&self, chip_id: &str) -> Result<u64>;
}
