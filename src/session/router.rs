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

//! The notification router.
//!
//! One task drains the transport's notification stream. Each notification is
//! routed by session id, mutates the session under its slot lock, wakes any
//! command handler parked on the wait-latch, and emits the application
//! events that do not belong to a pending command. Notifications for removed
//! sessions are logged and discarded.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use num_traits::FromPrimitive;
use tokio::sync::{mpsc, Mutex};

use crate::params::uci_packets::{
    DataTransferNtfStatusCode, DataTransferPhaseConfigStatusCode, ReasonCode, SessionId,
    SessionState, StatusCode, UwbAddress,
};
use crate::policy::{AttributionSource, PolicyOracle};
use crate::session::advertise::AdvertiseManager;
use crate::session::manager::{SessionCommand, SharedSessionTable, SharedSink, StopTrigger};
use crate::session::session::{OperationType, SessionSlot};
use crate::sink::{RangingChangeReason, RangingReport};
use crate::uci::notification::{
    DataRcvNotification, RadarDataRcv, RangingMeasurements, SessionNotification, SessionRangeData,
};

pub(crate) struct NotificationRouter {
    ntf_receiver: mpsc::UnboundedReceiver<SessionNotification>,
    table: SharedSessionTable,
    sink: SharedSink,
    policy: Arc<dyn PolicyOracle>,
    advertise: Arc<Mutex<AdvertiseManager>>,
    cmd_sender: mpsc::UnboundedSender<SessionCommand>,
}

fn data_transfer_status_to_status_code(status: DataTransferNtfStatusCode) -> StatusCode {
    match status {
        DataTransferNtfStatusCode::UciDataTransferNtfStatusOk => StatusCode::UciStatusOk,
        DataTransferNtfStatusCode::UciDataTransferNtfStatusRepetitionOk => StatusCode::UciStatusOk,
        DataTransferNtfStatusCode::UciDataTransferNtfStatusErrorRejected => {
            StatusCode::UciStatusRejected
        }
        DataTransferNtfStatusCode::UciDataTransferNtfStatusInvalidFormat => {
            StatusCode::UciStatusInvalidParam
        }
        _ => StatusCode::UciStatusFailed,
    }
}

impl NotificationRouter {
    pub fn new(
        ntf_receiver: mpsc::UnboundedReceiver<SessionNotification>,
        table: SharedSessionTable,
        sink: SharedSink,
        policy: Arc<dyn PolicyOracle>,
        advertise: Arc<Mutex<AdvertiseManager>>,
        cmd_sender: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self { ntf_receiver, table, sink, policy, advertise, cmd_sender }
    }

    pub async fn run(mut self) {
        while let Some(ntf) = self.ntf_receiver.recv().await {
            self.route(ntf).await;
        }
        info!("NotificationRouter exiting");
    }

    async fn route(&mut self, ntf: SessionNotification) {
        let session_id = ntf.session_id();
        let slot = { self.table.lock().await.get_by_id(session_id) };
        let Some(slot) = slot else {
            debug!("notification for unknown session {} discarded", session_id);
            return;
        };
        match ntf {
            SessionNotification::Status { session_state, reason_code, .. } => {
                self.on_session_status(slot, session_state, reason_code).await;
            }
            SessionNotification::RangeData(data) => {
                self.on_range_data(slot, data).await;
            }
            SessionNotification::DataReceived(data) => {
                self.on_data_received(slot, data).await;
            }
            SessionNotification::DataSendStatus {
                status, uci_sequence_number, tx_count, ..
            } => {
                self.on_data_send_status(slot, status, uci_sequence_number, tx_count).await;
            }
            SessionNotification::UpdateControllerMulticastList { status_list, .. } => {
                self.on_multicast_list_update(slot, status_list).await;
            }
            SessionNotification::DataTransferPhaseConfig { status, .. } => {
                self.on_data_transfer_phase_config(slot, session_id, status).await;
            }
            SessionNotification::RadarData(data) => {
                self.on_radar_data(slot, data).await;
            }
        }
    }

    async fn on_session_status(
        &mut self,
        slot: Arc<SessionSlot>,
        session_state: SessionState,
        reason_code: u8,
    ) {
        let decoded = ReasonCode::from_u8(reason_code);
        if decoded.is_none() {
            warn!("unknown session status reason code {:#x}", reason_code);
        }
        let mapped =
            decoded.map(RangingChangeReason::from_reason_code).unwrap_or(RangingChangeReason::Unknown);

        enum Emission {
            None,
            Stopped(RangingChangeReason),
            Paused,
            PauseFailed(RangingChangeReason),
            Resumed,
            ResumeFailed(RangingChangeReason),
        }

        let (session_handle, emission) = {
            let mut session = slot.session.lock().await;
            let previous_state = session.state;
            session.set_state(session_state, decoded);

            let emission = match decoded {
                Some(ReasonCode::SessionSuspendedDueToInbandSignal) => {
                    if session_state == SessionState::SessionStateActive {
                        Emission::Paused
                    } else {
                        Emission::PauseFailed(mapped)
                    }
                }
                Some(ReasonCode::SessionResumedDueToInbandSignal) => {
                    if session_state == SessionState::SessionStateActive {
                        Emission::Resumed
                    } else {
                        Emission::ResumeFailed(mapped)
                    }
                }
                Some(ReasonCode::StateChangeWithSessionManagementCommands) => Emission::None,
                _ => {
                    if previous_state == SessionState::SessionStateActive
                        && session_state == SessionState::SessionStateIdle
                    {
                        Emission::Stopped(mapped)
                    } else {
                        Emission::None
                    }
                }
            };

            if session_state == SessionState::SessionStateDeinit
                && session.operation != Some(OperationType::Deinit)
            {
                // Remote-initiated teardown; the event loop runs the cleanup.
                let _ = self.cmd_sender.send(SessionCommand::OnSessionDeinited {
                    session_handle: session.session_handle,
                });
            }
            (session.session_handle, emission)
        };
        slot.wake();

        let mut sink = self.sink.lock().await;
        match emission {
            Emission::None => {}
            Emission::Stopped(reason) => sink.on_ranging_stopped(session_handle, reason, &[]),
            Emission::Paused => sink.on_ranging_paused(session_handle),
            Emission::PauseFailed(reason) => {
                sink.on_ranging_pause_failed(session_handle, reason, StatusCode::UciStatusFailed)
            }
            Emission::Resumed => sink.on_ranging_resumed(session_handle),
            Emission::ResumeFailed(reason) => {
                sink.on_ranging_resume_failed(session_handle, reason, StatusCode::UciStatusFailed)
            }
        }
    }

    /// Whether delivery to this session's app is still permitted. Denials
    /// drop the payload with no user-visible callback.
    fn delivery_permitted(
        &self,
        check_needed: bool,
        attribution_source: &AttributionSource,
    ) -> bool {
        !check_needed || self.policy.has_data_delivery_permission(attribution_source)
    }

    async fn on_range_data(&mut self, slot: Arc<SessionSlot>, data: SessionRangeData) {
        let (session_handle, check_needed, attribution_source, owr_observer) = {
            let session = slot.session.lock().await;
            (
                session.session_handle,
                session.data_delivery_permission_check_needed,
                session.attribution_source.clone(),
                session.is_owr_aoa_observer(),
            )
        };
        if !self.delivery_permitted(check_needed, &attribution_source) {
            debug!("range data of {} dropped: delivery permission lost", session_handle);
            return;
        }

        let report = RangingReport {
            session_handle,
            sequence_number: data.sequence_number,
            ranging_interval_ms: data.current_ranging_interval_ms,
            measurement_type: data.ranging_measurement_type,
            measurements: data.ranging_measurements.clone(),
        };
        self.sink.lock().await.on_ranging_result(session_handle, &report);

        if owr_observer {
            if let RangingMeasurements::OwrAoa(measurement) = &data.ranging_measurements {
                let pointed = {
                    let mut advertise = self.advertise.lock().await;
                    advertise.update_advertise_target(measurement);
                    advertise.is_pointed_target(&measurement.mac_address)
                };
                if pointed {
                    let drained = {
                        let mut session = slot.session.lock().await;
                        session.take_buffered_data(&measurement.mac_address)
                    };
                    if !drained.is_empty() {
                        let mut sink = self.sink.lock().await;
                        for (sequence_num, payload) in drained {
                            sink.on_data_received(
                                session_handle,
                                measurement.mac_address,
                                sequence_num,
                                &payload,
                            );
                        }
                    }
                }
            }
        }

        if self.policy.ranging_error_streak_timer_enabled() {
            let mut session = slot.session.lock().await;
            if data.ranging_measurements.is_all_error() {
                if session.state == SessionState::SessionStateActive
                    && session.ranging_error_streak_timer.is_none()
                {
                    let cmd_sender = self.cmd_sender.clone();
                    let timeout_ms = self.policy.ranging_error_streak_timeout_ms();
                    session.ranging_error_streak_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                        let _ = cmd_sender.send(SessionCommand::Stop {
                            session_handle,
                            trigger: StopTrigger::ErrorStreak,
                        });
                    }));
                }
            } else {
                session.cancel_ranging_error_streak_timer();
            }
        }
    }

    async fn on_data_received(&mut self, slot: Arc<SessionSlot>, data: DataRcvNotification) {
        let DataRcvNotification { status, uci_sequence_num, source_address, payload, .. } = data;
        if !matches!(source_address, UwbAddress::Extended(_)) {
            error!("received data with a non-extended source address, dropped");
            return;
        }
        let (session_handle, check_needed, attribution_source, owr_observer) = {
            let session = slot.session.lock().await;
            (
                session.session_handle,
                session.data_delivery_permission_check_needed,
                session.attribution_source.clone(),
                session.is_owr_aoa_observer(),
            )
        };
        if !self.delivery_permitted(check_needed, &attribution_source) {
            debug!("received data of {} dropped: delivery permission lost", session_handle);
            return;
        }
        if status != StatusCode::UciStatusOk {
            self.sink.lock().await.on_data_receive_failed(
                session_handle,
                source_address,
                uci_sequence_num,
                status,
            );
            return;
        }

        if owr_observer {
            let pointed = self.advertise.lock().await.is_pointed_target(&source_address);
            let drained = {
                let mut session = slot.session.lock().await;
                session.store_received_data(source_address, uci_sequence_num, payload);
                if pointed {
                    session.take_buffered_data(&source_address)
                } else {
                    Vec::new()
                }
            };
            if !drained.is_empty() {
                let mut sink = self.sink.lock().await;
                for (sequence_num, buffered) in drained {
                    sink.on_data_received(session_handle, source_address, sequence_num, &buffered);
                }
            }
        } else {
            self.sink.lock().await.on_data_received(
                session_handle,
                source_address,
                uci_sequence_num,
                &payload,
            );
        }
    }

    async fn on_data_send_status(
        &mut self,
        slot: Arc<SessionSlot>,
        status: DataTransferNtfStatusCode,
        uci_sequence_number: u16,
        tx_count: u8,
    ) {
        let (session_handle, send_info, repetition_count) = {
            let session = slot.session.lock().await;
            (
                session.session_handle,
                session.tx_pending.get(&uci_sequence_number).cloned(),
                session.params.fira().map(|p| p.data_repetition_count()).unwrap_or(0),
            )
        };
        let Some(send_info) = send_info else {
            warn!(
                "data transfer status for unknown sequence number {} of {}",
                uci_sequence_number, session_handle
            );
            return;
        };

        match status {
            DataTransferNtfStatusCode::UciDataTransferNtfStatusOk
            | DataTransferNtfStatusCode::UciDataTransferNtfStatusRepetitionOk => {
                self.sink.lock().await.on_data_sent(
                    session_handle,
                    send_info.dest_address,
                    uci_sequence_number,
                );
                let transfer_done = status == DataTransferNtfStatusCode::UciDataTransferNtfStatusOk
                    && u16::from(tx_count) >= u16::from(repetition_count) + 1;
                if transfer_done {
                    slot.session.lock().await.tx_pending.remove(&uci_sequence_number);
                }
            }
            _ => {
                self.sink.lock().await.on_data_send_failed(
                    session_handle,
                    send_info.dest_address,
                    uci_sequence_number,
                    data_transfer_status_to_status_code(status),
                );
                slot.session.lock().await.tx_pending.remove(&uci_sequence_number);
            }
        }
    }

    async fn on_multicast_list_update(
        &mut self,
        slot: Arc<SessionSlot>,
        status_list: Vec<crate::params::uci_packets::ControleeStatus>,
    ) {
        {
            let mut session = slot.session.lock().await;
            if session.operation != Some(OperationType::Reconfigure) {
                warn!(
                    "unsolicited multicast list update for {} dropped",
                    session.session_handle
                );
                return;
            }
            session.multicast_update_result = Some(status_list);
        }
        slot.wake();
    }

    async fn on_data_transfer_phase_config(
        &mut self,
        slot: Arc<SessionSlot>,
        session_id: SessionId,
        status: DataTransferPhaseConfigStatusCode,
    ) {
        {
            let mut session = slot.session.lock().await;
            if session.operation != Some(OperationType::DataTransferPhaseConfig) {
                warn!("unsolicited data transfer phase config ntf for session {}", session_id);
                return;
            }
            session.dt_phase_config_status = Some(status);
        }
        slot.wake();
    }

    async fn on_radar_data(&mut self, slot: Arc<SessionSlot>, data: RadarDataRcv) {
        let (session_handle, check_needed, attribution_source) = {
            let session = slot.session.lock().await;
            (
                session.session_handle,
                session.data_delivery_permission_check_needed,
                session.attribution_source.clone(),
            )
        };
        if !self.delivery_permitted(check_needed, &attribution_source) {
            debug!("radar data of {} dropped: delivery permission lost", session_handle);
            return;
        }
        self.sink.lock().await.on_radar_data(session_handle, &data);
    }
}
