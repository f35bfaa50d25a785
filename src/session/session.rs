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

//! The per-session state record and its wait-latch.
//!
//! Every mutation happens either on the event loop or in the notification
//! router while holding the slot's lock; the latch is how a command handler
//! parks until the router observed the notification it needs.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::params::uci_packets::{
    ControleeStatus, DataTransferPhaseConfigStatusCode, ProtocolVersion, ReasonCode, SessionHandle,
    SessionId, SessionState, SessionToken, SessionType, UwbAddress,
};
use crate::params::{AppConfigParams, Protocol};
use crate::policy::AttributionSource;
use crate::session::filtering::FilterEngine;

use crate::params::fira_app_config_params::{
    DeviceRole, RangingRoundUsage, DEFAULT_RX_DATA_MAX_PACKETS_TO_STORE,
};

/// FiRa caps a controller's multicast list at eight controlees.
const MAX_FIRA_CONTROLEES: usize = 8;

/// The last requested operation of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationType {
    InitSession,
    Start,
    Stop,
    Reconfigure,
    Deinit,
    OnDeinit,
    SendData,
    UpdateDtTagRounds,
    DataTransferPhaseConfig,
}

/// One queued outbound data packet, kept until its transfer status arrives.
#[derive(Debug, Clone)]
pub(crate) struct SendDataInfo {
    pub dest_address: UwbAddress,
    pub payload: Bytes,
}

/// One controlee of a controller session, with its optional filter engine.
pub(crate) struct ControleeEntry {
    pub short_address: [u8; 2],
    pub subsession_id: u32,
    pub filter: Option<Box<dyn FilterEngine>>,
}

impl ControleeEntry {
    pub fn close(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            filter.close();
        }
        self.filter = None;
    }
}

impl std::fmt::Debug for ControleeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControleeEntry")
            .field("short_address", &self.short_address)
            .field("subsession_id", &self.subsession_id)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// The non-privileged app owning a session, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NonPrivilegedClient {
    pub uid: i32,
    pub package_name: Option<String>,
}

/// The mutable state of one UWB session.
pub(crate) struct UwbSession {
    pub session_handle: SessionHandle,
    pub session_id: SessionId,
    pub session_type: SessionType,
    pub protocol: Protocol,
    pub chip_id: String,
    pub uci_version: ProtocolVersion,
    pub attribution_source: AttributionSource,
    pub params: AppConfigParams,

    pub state: SessionState,
    pub last_reason_code: Option<ReasonCode>,
    pub operation: Option<OperationType>,

    /// UWBS-assigned value; equals the session id until the open handler
    /// caches the real token.
    pub session_token: SessionToken,

    pub stack_priority: u8,
    pub priority_override: bool,

    pub controlees: Vec<ControleeEntry>,

    rx_buffers: HashMap<UwbAddress, BTreeMap<u16, Bytes>>,
    rx_max_packets_to_store: usize,
    tx_next_sequence_number: u16,
    pub tx_pending: HashMap<u16, SendDataInfo>,

    /// Stashed by the router for the reconfigure handler to consume.
    pub multicast_update_result: Option<Vec<ControleeStatus>>,
    pub dt_phase_config_status: Option<DataTransferPhaseConfigStatusCode>,

    pub data_delivery_permission_check_needed: bool,
    pub needs_app_config_update: bool,
    /// Set when the open/start handler computed the absolute initiation time
    /// from the UWBS timestamp; cleared together with the computed value.
    pub computed_absolute_initiation_time: bool,
    pub acquired_default_pose: bool,
    pub has_non_privileged_fg_app: bool,
    pub non_privileged_client: Option<NonPrivilegedClient>,

    pub ranging_error_streak_timer: Option<JoinHandle<()>>,
    pub background_app_timer: Option<JoinHandle<()>>,
}

impl UwbSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_handle: SessionHandle,
        session_id: SessionId,
        session_type: SessionType,
        chip_id: String,
        uci_version: ProtocolVersion,
        attribution_source: AttributionSource,
        params: AppConfigParams,
        stack_priority: u8,
        priority_override: bool,
        non_privileged_client: Option<NonPrivilegedClient>,
        has_non_privileged_fg_app: bool,
    ) -> Self {
        let protocol = params.protocol();
        let rx_max_packets_to_store = params
            .fira()
            .map(|p| p.rx_data_max_packets_to_store())
            .unwrap_or(DEFAULT_RX_DATA_MAX_PACKETS_TO_STORE);
        Self {
            session_handle,
            session_id,
            session_type,
            protocol,
            chip_id,
            uci_version,
            data_delivery_permission_check_needed: non_privileged_client.is_some(),
            attribution_source,
            params,
            state: SessionState::SessionStateDeinit,
            last_reason_code: None,
            operation: None,
            session_token: session_id,
            stack_priority,
            priority_override,
            controlees: Vec::new(),
            rx_buffers: HashMap::new(),
            rx_max_packets_to_store,
            tx_next_sequence_number: 0,
            tx_pending: HashMap::new(),
            multicast_update_result: None,
            dt_phase_config_status: None,
            needs_app_config_update: false,
            computed_absolute_initiation_time: false,
            acquired_default_pose: false,
            has_non_privileged_fg_app,
            non_privileged_client,
            ranging_error_streak_timer: None,
            background_app_timer: None,
        }
    }

    /// Whether this session observes one-way AoA advertisers, which gates
    /// received-data release on the pointing predicate.
    pub fn is_owr_aoa_observer(&self) -> bool {
        match self.params.fira() {
            Some(fira) => {
                fira.ranging_round_usage() == RangingRoundUsage::OwrAoaMeasurement
                    && fira.device_role() == DeviceRole::Observer
            }
            None => false,
        }
    }

    pub fn max_controlees(&self) -> usize {
        match self.protocol {
            Protocol::Fira => MAX_FIRA_CONTROLEES,
            _ => 0,
        }
    }

    /// Allocate the next outbound sequence number (16-bit, wrapping).
    pub fn alloc_tx_sequence_number(&mut self) -> u16 {
        let sequence_number = self.tx_next_sequence_number;
        self.tx_next_sequence_number = self.tx_next_sequence_number.wrapping_add(1);
        sequence_number
    }

    /// Buffer a received payload for the peer, enforcing the per-peer cap.
    ///
    /// On overflow the smallest stored sequence number is evicted, but only
    /// when the incoming one is strictly greater; otherwise the incoming
    /// payload is dropped. The retained set is therefore always the highest
    /// sequence numbers seen so far.
    pub fn store_received_data(&mut self, address: UwbAddress, sequence_num: u16, payload: Bytes) {
        let buffer = self.rx_buffers.entry(address).or_default();
        if buffer.len() >= self.rx_max_packets_to_store && !buffer.contains_key(&sequence_num) {
            let smallest = match buffer.keys().next() {
                Some(smallest) => *smallest,
                None => return,
            };
            if sequence_num <= smallest {
                return;
            }
            buffer.remove(&smallest);
        }
        buffer.insert(sequence_num, payload);
    }

    /// Drain the peer's buffered payloads in ascending sequence order.
    pub fn take_buffered_data(&mut self, address: &UwbAddress) -> Vec<(u16, Bytes)> {
        match self.rx_buffers.remove(address) {
            Some(buffer) => buffer.into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn buffered_peers(&self) -> Vec<UwbAddress> {
        self.rx_buffers.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn buffered_count(&self, address: &UwbAddress) -> usize {
        self.rx_buffers.get(address).map_or(0, |buffer| buffer.len())
    }

    pub fn find_controlee(&self, short_address: [u8; 2]) -> Option<usize> {
        self.controlees.iter().position(|entry| entry.short_address == short_address)
    }

    pub fn remove_controlee(&mut self, short_address: [u8; 2]) {
        if let Some(index) = self.find_controlee(short_address) {
            let mut entry = self.controlees.remove(index);
            entry.close();
        }
    }

    pub fn clear_controlees(&mut self) {
        for entry in self.controlees.iter_mut() {
            entry.close();
        }
        self.controlees.clear();
    }

    pub fn set_state(&mut self, state: SessionState, reason_code: Option<ReasonCode>) {
        self.state = state;
        if reason_code.is_some() {
            self.last_reason_code = reason_code;
        }
    }

    pub fn cancel_ranging_error_streak_timer(&mut self) {
        if let Some(timer) = self.ranging_error_streak_timer.take() {
            timer.abort();
        }
    }

    pub fn cancel_background_app_timer(&mut self) {
        if let Some(timer) = self.background_app_timer.take() {
            timer.abort();
        }
    }

    pub fn cancel_timers(&mut self) {
        self.cancel_ranging_error_streak_timer();
        self.cancel_background_app_timer();
    }
}

/// A session plus its wait-latch, shared between the event loop and the
/// notification router.
pub(crate) struct SessionSlot {
    pub session: Mutex<UwbSession>,
    notify: Notify,
}

impl SessionSlot {
    pub fn new(session: UwbSession) -> Self {
        Self { session: Mutex::new(session), notify: Notify::new() }
    }

    /// Wake the waiting command handler, if any. A permit is stored when
    /// nobody waits yet, so wake-then-wait does not lose the event.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until the predicate yields a value or the deadline passes.
    ///
    /// The predicate runs under the session lock and is re-evaluated after
    /// every wake, so a stale permit from a previous operation only costs an
    /// extra check.
    pub async fn wait_until<T>(
        &self,
        deadline: Instant,
        mut pred: impl FnMut(&mut UwbSession) -> Option<T>,
    ) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut session = self.session.lock().await;
                if let Some(value) = pred(&mut session) {
                    return Ok(value);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::params::fira_app_config_params::FiraAppConfigParamsBuilder;

    fn make_session(rx_max: usize) -> UwbSession {
        let params = FiraAppConfigParamsBuilder::new()
            .device_mac_address(UwbAddress::Short([0x01, 0x02]))
            .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
            .rx_data_max_packets_to_store(rx_max)
            .build()
            .unwrap();
        UwbSession::new(
            SessionHandle(1),
            42,
            SessionType::FiraRangingSession,
            "default".to_owned(),
            ProtocolVersion::new(2, 0),
            AttributionSource::new(1000, Some("com.example".to_owned())),
            AppConfigParams::Fira(params),
            60,
            false,
            None,
            true,
        )
    }

    #[test]
    fn test_tx_sequence_number_wraps() {
        let mut session = make_session(4);
        session.tx_next_sequence_number = u16::MAX;
        assert_eq!(session.alloc_tx_sequence_number(), u16::MAX);
        assert_eq!(session.alloc_tx_sequence_number(), 0);
        assert_eq!(session.alloc_tx_sequence_number(), 1);
    }

    #[test]
    fn test_rx_buffer_bound_keeps_highest_sequence_numbers() {
        let mut session = make_session(3);
        let peer = UwbAddress::Extended([0xBE, 0xEF, 0, 0, 0, 0, 0, 0]);
        for seq in [5u16, 3, 4] {
            session.store_received_data(peer, seq, Bytes::from_static(b"x"));
        }
        assert_eq!(session.buffered_count(&peer), 3);

        // Smaller than the smallest stored: dropped.
        session.store_received_data(peer, 2, Bytes::from_static(b"x"));
        assert_eq!(session.buffered_count(&peer), 3);
        // Larger: evicts seq 3.
        session.store_received_data(peer, 9, Bytes::from_static(b"x"));
        let drained: Vec<u16> =
            session.take_buffered_data(&peer).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(drained, vec![4, 5, 9]);
        assert_eq!(session.buffered_count(&peer), 0);
    }

    #[test]
    fn test_take_buffered_data_is_ascending() {
        let mut session = make_session(8);
        let peer = UwbAddress::Extended([0xBE, 0xEF, 0, 0, 0, 0, 0, 0]);
        for seq in [5u16, 3, 4] {
            session.store_received_data(peer, seq, Bytes::from_static(b"y"));
        }
        let order: Vec<u16> =
            session.take_buffered_data(&peer).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(order, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_state_change() {
        let slot = Arc::new(SessionSlot::new(make_session(4)));
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(1);
                slot.wait_until(deadline, |session| {
                    (session.state == SessionState::SessionStateIdle).then_some(())
                })
                .await
            })
        };
        {
            let mut session = slot.session.lock().await;
            session.set_state(SessionState::SessionStateIdle, None);
        }
        slot.wake();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let slot = SessionSlot::new(make_session(4));
        let deadline = Instant::now() + Duration::from_millis(100);
        let result = slot
            .wait_until(deadline, |session| {
                (session.state == SessionState::SessionStateActive).then_some(())
            })
            .await;
        assert_eq!(result, Err(Error::Timeout));
    }
}
