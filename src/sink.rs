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

//! The application-facing callback seam.
//!
//! The session core owns no application identities beyond the session
//! handle; the embedder's sink implementation resolves handles back to its
//! callbacks. All methods are invoked from the service's own tasks and must
//! not block.

use crate::params::uci_packets::{
    AppConfigTlv, MulticastUpdateStatusCode, ReasonCode, RangingMeasurementType, SessionHandle,
    StatusCode, UwbAddress,
};
use crate::params::AppConfigParams;
use crate::uci::notification::{RadarDataRcv, RangingMeasurements};

/// The user-visible reason of a session state change, mapped from UCI status
/// and reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingChangeReason {
    LocalApi,
    MaxSessionsReached,
    BadParameters,
    ProtocolSpecific,
    SystemPolicy,
    SystemRegulation,
    MaxRrRetryReached,
    RemoteRequest,
    InsufficientSlotsPerRr,
    SessionResumed,
    SessionSuspended,
    InbandSessionStop,
    Unknown,
}

impl RangingChangeReason {
    /// Map a UCI command status to the user-visible reason.
    pub fn from_status_code(status: StatusCode) -> Self {
        match status {
            StatusCode::UciStatusOk => Self::LocalApi,
            StatusCode::UciStatusMaxSessionsExceeded => Self::MaxSessionsReached,
            StatusCode::UciStatusInvalidParam
            | StatusCode::UciStatusInvalidRange
            | StatusCode::UciStatusInvalidMsgSize
            | StatusCode::UciStatusSessionDuplicate => Self::BadParameters,
            StatusCode::UciStatusSessionNotExist
            | StatusCode::UciStatusErrorCccLifecycle
            | StatusCode::UciStatusErrorCccSeBusy => Self::ProtocolSpecific,
            StatusCode::UciStatusRegulationUwbOff => Self::SystemRegulation,
            _ => Self::Unknown,
        }
    }

    /// Map a session-status reason code to the user-visible reason.
    pub fn from_reason_code(reason_code: ReasonCode) -> Self {
        match reason_code {
            ReasonCode::StateChangeWithSessionManagementCommands => Self::LocalApi,
            ReasonCode::MaxRangingRoundRetryCountReached => Self::MaxRrRetryReached,
            ReasonCode::MaxNumberOfMeasurementsReached => Self::RemoteRequest,
            ReasonCode::ErrorInvalidUlTdoaRandomWindow
            | ReasonCode::ErrorSlotLengthNotSupported
            | ReasonCode::ErrorMacAddressModeNotSupported
            | ReasonCode::ErrorInvalidRangingDuration
            | ReasonCode::ErrorInvalidStsConfig
            | ReasonCode::ErrorInvalidRframeConfig
            | ReasonCode::ErrorHusNotEnoughSlots
            | ReasonCode::ErrorHusCfpPhaseTooShort
            | ReasonCode::ErrorHusCapPhaseTooShort
            | ReasonCode::ErrorHusOthers => Self::BadParameters,
            ReasonCode::ErrorInsufficientSlotsPerRr => Self::InsufficientSlotsPerRr,
            ReasonCode::ErrorSessionKeyNotFound | ReasonCode::ErrorSubSessionKeyNotFound => {
                Self::ProtocolSpecific
            }
            ReasonCode::ErrorRegulationUwbOff => Self::SystemRegulation,
            ReasonCode::SessionResumedDueToInbandSignal => Self::SessionResumed,
            ReasonCode::SessionSuspendedDueToInbandSignal => Self::SessionSuspended,
            ReasonCode::SessionStoppedDueToInbandSignal => Self::InbandSessionStop,
        }
    }
}

/// One ranging result frame, shaped for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingReport {
    pub session_handle: SessionHandle,
    pub sequence_number: u32,
    pub ranging_interval_ms: u32,
    pub measurement_type: RangingMeasurementType,
    pub measurements: RangingMeasurements,
}

/// The application-facing callbacks of the session core.
pub trait NotificationSink: 'static + Send {
    fn on_ranging_opened(&mut self, session_handle: SessionHandle);
    fn on_ranging_open_failed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    fn on_ranging_started(&mut self, session_handle: SessionHandle, params: &AppConfigParams);
    fn on_ranging_start_failed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    /// `stopped_params` carries the CCC/ALIRO "stopped" TLVs when the policy
    /// enables fetching them; empty otherwise.
    fn on_ranging_stopped(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        stopped_params: &[AppConfigTlv],
    );
    fn on_ranging_stop_failed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    fn on_ranging_reconfigured(&mut self, session_handle: SessionHandle);
    fn on_ranging_reconfigure_failed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    fn on_ranging_closed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    fn on_controlee_added(&mut self, session_handle: SessionHandle, address: [u8; 2]);
    fn on_controlee_add_failed(
        &mut self,
        session_handle: SessionHandle,
        address: [u8; 2],
        status: MulticastUpdateStatusCode,
    );
    fn on_controlee_removed(&mut self, session_handle: SessionHandle, address: [u8; 2]);
    fn on_controlee_remove_failed(
        &mut self,
        session_handle: SessionHandle,
        address: [u8; 2],
        status: MulticastUpdateStatusCode,
    );
    fn on_ranging_result(&mut self, session_handle: SessionHandle, report: &RangingReport);
    fn on_data_received(
        &mut self,
        session_handle: SessionHandle,
        address: UwbAddress,
        uci_sequence_num: u16,
        data: &[u8],
    );
    fn on_data_receive_failed(
        &mut self,
        session_handle: SessionHandle,
        address: UwbAddress,
        uci_sequence_num: u16,
        status: StatusCode,
    );
    fn on_data_sent(
        &mut self,
        session_handle: SessionHandle,
        address: UwbAddress,
        uci_sequence_num: u16,
    );
    fn on_data_send_failed(
        &mut self,
        session_handle: SessionHandle,
        address: UwbAddress,
        uci_sequence_num: u16,
        status: StatusCode,
    );
    fn on_data_transfer_phase_configured(&mut self, session_handle: SessionHandle);
    fn on_data_transfer_phase_config_failed(
        &mut self,
        session_handle: SessionHandle,
        status: StatusCode,
    );
    fn on_ranging_paused(&mut self, session_handle: SessionHandle);
    fn on_ranging_pause_failed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    fn on_ranging_resumed(&mut self, session_handle: SessionHandle);
    fn on_ranging_resume_failed(
        &mut self,
        session_handle: SessionHandle,
        reason: RangingChangeReason,
        status: StatusCode,
    );
    fn on_dt_tag_rounds_update_status(
        &mut self,
        session_handle: SessionHandle,
        status: StatusCode,
        ranging_round_indexes: &[u8],
    );
    fn on_radar_data(&mut self, session_handle: SessionHandle, data: &RadarDataRcv);
}

#[cfg(any(test, feature = "mock-util"))]
pub mod mock_sink {
    //! A [`NotificationSink`] that records every callback into a channel.

    use tokio::sync::mpsc;

    use super::*;

    /// One recorded sink callback.
    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkEvent {
        RangingOpened(SessionHandle),
        RangingOpenFailed(SessionHandle, RangingChangeReason, StatusCode),
        RangingStarted(SessionHandle),
        RangingStartFailed(SessionHandle, RangingChangeReason, StatusCode),
        RangingStopped(SessionHandle, RangingChangeReason, Vec<AppConfigTlv>),
        RangingStopFailed(SessionHandle, RangingChangeReason, StatusCode),
        RangingReconfigured(SessionHandle),
        RangingReconfigureFailed(SessionHandle, RangingChangeReason, StatusCode),
        RangingClosed(SessionHandle, RangingChangeReason, StatusCode),
        ControleeAdded(SessionHandle, [u8; 2]),
        ControleeAddFailed(SessionHandle, [u8; 2], MulticastUpdateStatusCode),
        ControleeRemoved(SessionHandle, [u8; 2]),
        ControleeRemoveFailed(SessionHandle, [u8; 2], MulticastUpdateStatusCode),
        RangingResult(SessionHandle, RangingReport),
        DataReceived(SessionHandle, UwbAddress, u16, Vec<u8>),
        DataReceiveFailed(SessionHandle, UwbAddress, u16, StatusCode),
        DataSent(SessionHandle, UwbAddress, u16),
        DataSendFailed(SessionHandle, UwbAddress, u16, StatusCode),
        DataTransferPhaseConfigured(SessionHandle),
        DataTransferPhaseConfigFailed(SessionHandle, StatusCode),
        RangingPaused(SessionHandle),
        RangingPauseFailed(SessionHandle, RangingChangeReason, StatusCode),
        RangingResumed(SessionHandle),
        RangingResumeFailed(SessionHandle, RangingChangeReason, StatusCode),
        DtTagRoundsUpdateStatus(SessionHandle, StatusCode, Vec<u8>),
        RadarData(SessionHandle, RadarDataRcv),
    }

    pub struct MockNotificationSink {
        sender: mpsc::UnboundedSender<SinkEvent>,
    }

    impl MockNotificationSink {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            (Self { sender }, receiver)
        }

        fn record(&self, event: SinkEvent) {
            let _ = self.sender.send(event);
        }
    }

    impl NotificationSink for MockNotificationSink {
        fn on_ranging_opened(&mut self, session_handle: SessionHandle) {
            self.record(SinkEvent::RangingOpened(session_handle));
        }
        fn on_ranging_open_failed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingOpenFailed(session_handle, reason, status));
        }
        fn on_ranging_started(
            &mut self,
            session_handle: SessionHandle,
            _params: &AppConfigParams,
        ) {
            self.record(SinkEvent::RangingStarted(session_handle));
        }
        fn on_ranging_start_failed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingStartFailed(session_handle, reason, status));
        }
        fn on_ranging_stopped(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            stopped_params: &[AppConfigTlv],
        ) {
            self.record(SinkEvent::RangingStopped(
                session_handle,
                reason,
                stopped_params.to_vec(),
            ));
        }
        fn on_ranging_stop_failed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingStopFailed(session_handle, reason, status));
        }
        fn on_ranging_reconfigured(&mut self, session_handle: SessionHandle) {
            self.record(SinkEvent::RangingReconfigured(session_handle));
        }
        fn on_ranging_reconfigure_failed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingReconfigureFailed(session_handle, reason, status));
        }
        fn on_ranging_closed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingClosed(session_handle, reason, status));
        }
        fn on_controlee_added(&mut self, session_handle: SessionHandle, address: [u8; 2]) {
            self.record(SinkEvent::ControleeAdded(session_handle, address));
        }
        fn on_controlee_add_failed(
            &mut self,
            session_handle: SessionHandle,
            address: [u8; 2],
            status: MulticastUpdateStatusCode,
        ) {
            self.record(SinkEvent::ControleeAddFailed(session_handle, address, status));
        }
        fn on_controlee_removed(&mut self, session_handle: SessionHandle, address: [u8; 2]) {
            self.record(SinkEvent::ControleeRemoved(session_handle, address));
        }
        fn on_controlee_remove_failed(
            &mut self,
            session_handle: SessionHandle,
            address: [u8; 2],
            status: MulticastUpdateStatusCode,
        ) {
            self.record(SinkEvent::ControleeRemoveFailed(session_handle, address, status));
        }
        fn on_ranging_result(&mut self, session_handle: SessionHandle, report: &RangingReport) {
            self.record(SinkEvent::RangingResult(session_handle, report.clone()));
        }
        fn on_data_received(
            &mut self,
            session_handle: SessionHandle,
            address: UwbAddress,
            uci_sequence_num: u16,
            data: &[u8],
        ) {
            self.record(SinkEvent::DataReceived(
                session_handle,
                address,
                uci_sequence_num,
                data.to_vec(),
            ));
        }
        fn on_data_receive_failed(
            &mut self,
            session_handle: SessionHandle,
            address: UwbAddress,
            uci_sequence_num: u16,
            status: StatusCode,
        ) {
            self.record(SinkEvent::DataReceiveFailed(
                session_handle,
                address,
                uci_sequence_num,
                status,
            ));
        }
        fn on_data_sent(
            &mut self,
            session_handle: SessionHandle,
            address: UwbAddress,
            uci_sequence_num: u16,
        ) {
            self.record(SinkEvent::DataSent(session_handle, address, uci_sequence_num));
        }
        fn on_data_send_failed(
            &mut self,
            session_handle: SessionHandle,
            address: UwbAddress,
            uci_sequence_num: u16,
            status: StatusCode,
        ) {
            self.record(SinkEvent::DataSendFailed(
                session_handle,
                address,
                uci_sequence_num,
                status,
            ));
        }
        fn on_data_transfer_phase_configured(&mut self, session_handle: SessionHandle) {
            self.record(SinkEvent::DataTransferPhaseConfigured(session_handle));
        }
        fn on_data_transfer_phase_config_failed(
            &mut self,
            session_handle: SessionHandle,
            status: StatusCode,
        ) {
            self.record(SinkEvent::DataTransferPhaseConfigFailed(session_handle, status));
        }
        fn on_ranging_paused(&mut self, session_handle: SessionHandle) {
            self.record(SinkEvent::RangingPaused(session_handle));
        }
        fn on_ranging_pause_failed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingPauseFailed(session_handle, reason, status));
        }
        fn on_ranging_resumed(&mut self, session_handle: SessionHandle) {
            self.record(SinkEvent::RangingResumed(session_handle));
        }
        fn on_ranging_resume_failed(
            &mut self,
            session_handle: SessionHandle,
            reason: RangingChangeReason,
            status: StatusCode,
        ) {
            self.record(SinkEvent::RangingResumeFailed(session_handle, reason, status));
        }
        fn on_dt_tag_rounds_update_status(
            &mut self,
            session_handle: SessionHandle,
            status: StatusCode,
            ranging_round_indexes: &[u8],
        ) {
            self.record(SinkEvent::DtTagRoundsUpdateStatus(
                session_handle,
                status,
                ranging_round_indexes.to_vec(),
            ));
        }
        fn on_radar_data(&mut self, session_handle: SessionHandle, data: &RadarDataRcv) {
            self.record(SinkEvent::RadarData(session_handle, data.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            RangingChangeReason::from_status_code(StatusCode::UciStatusOk),
            RangingChangeReason::LocalApi
        );
        assert_eq!(
            RangingChangeReason::from_status_code(StatusCode::UciStatusMaxSessionsExceeded),
            RangingChangeReason::MaxSessionsReached
        );
        assert_eq!(
            RangingChangeReason::from_status_code(StatusCode::UciStatusInvalidRange),
            RangingChangeReason::BadParameters
        );
        assert_eq!(
            RangingChangeReason::from_status_code(StatusCode::UciStatusErrorCccSeBusy),
            RangingChangeReason::ProtocolSpecific
        );
        assert_eq!(
            RangingChangeReason::from_status_code(StatusCode::UciStatusFailed),
            RangingChangeReason::Unknown
        );
    }

    #[test]
    fn test_reason_code_mapping() {
        assert_eq!(
            RangingChangeReason::from_reason_code(
                ReasonCode::StateChangeWithSessionManagementCommands
            ),
            RangingChangeReason::LocalApi
        );
        assert_eq!(
            RangingChangeReason::from_reason_code(ReasonCode::MaxRangingRoundRetryCountReached),
            RangingChangeReason::MaxRrRetryReached
        );
        assert_eq!(
            RangingChangeReason::from_reason_code(ReasonCode::MaxNumberOfMeasurementsReached),
            RangingChangeReason::RemoteRequest
        );
        assert_eq!(
            RangingChangeReason::from_reason_code(ReasonCode::ErrorHusCfpPhaseTooShort),
            RangingChangeReason::BadParameters
        );
        assert_eq!(
            RangingChangeReason::from_reason_code(ReasonCode::ErrorSubSessionKeyNotFound),
            RangingChangeReason::ProtocolSpecific
        );
        assert_eq!(
            RangingChangeReason::from_reason_code(ReasonCode::ErrorRegulationUwbOff),
            RangingChangeReason::SystemRegulation
        );
        assert_eq!(
            RangingChangeReason::from_reason_code(ReasonCode::SessionStoppedDueToInbandSignal),
            RangingChangeReason::InbandSessionStop
        );
    }
}
