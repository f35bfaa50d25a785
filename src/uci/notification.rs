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

//! The session-scoped notifications delivered upward by the UCI transport.

use bytes::Bytes;

use crate::params::uci_packets::{
    ControleeStatus, DataTransferNtfStatusCode, DataTransferPhaseConfigStatusCode,
    DlTdoaRangingMeasurement, ExtendedAddressTwoWayRangingMeasurement, OwrAoaRangingMeasurement,
    RangingMeasurementType, SessionId, SessionState, ShortAddressTwoWayRangingMeasurement,
    StatusCode, UwbAddress,
};

/// An asynchronous notification tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    Status {
        session_id: SessionId,
        session_state: SessionState,
        /// Raw reason byte; decoded by the router so unknown values can
        /// still be surfaced.
        reason_code: u8,
    },
    RangeData(SessionRangeData),
    DataReceived(DataRcvNotification),
    DataSendStatus {
        session_id: SessionId,
        status: DataTransferNtfStatusCode,
        uci_sequence_number: u16,
        tx_count: u8,
    },
    UpdateControllerMulticastList {
        session_id: SessionId,
        remaining_multicast_list_size: usize,
        status_list: Vec<ControleeStatus>,
    },
    DataTransferPhaseConfig {
        session_id: SessionId,
        status: DataTransferPhaseConfigStatusCode,
    },
    RadarData(RadarDataRcv),
}

impl SessionNotification {
    /// The session the notification routes to.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Status { session_id, .. } => *session_id,
            Self::RangeData(data) => data.session_id,
            Self::DataReceived(data) => data.session_id,
            Self::DataSendStatus { session_id, .. } => *session_id,
            Self::UpdateControllerMulticastList { session_id, .. } => *session_id,
            Self::DataTransferPhaseConfig { session_id, .. } => *session_id,
            Self::RadarData(data) => data.session_id,
        }
    }
}

/// The measurement list of one ranging frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RangingMeasurements {
    ShortAddressTwoWay(Vec<ShortAddressTwoWayRangingMeasurement>),
    ExtendedAddressTwoWay(Vec<ExtendedAddressTwoWayRangingMeasurement>),
    OwrAoa(OwrAoaRangingMeasurement),
    DlTdoa(Vec<DlTdoaRangingMeasurement>),
}

impl RangingMeasurements {
    /// True when the frame carries measurements and every one of them failed.
    pub fn is_all_error(&self) -> bool {
        match self {
            Self::ShortAddressTwoWay(list) => {
                !list.is_empty() && list.iter().all(|m| m.status != StatusCode::UciStatusOk)
            }
            Self::ExtendedAddressTwoWay(list) => {
                !list.is_empty() && list.iter().all(|m| m.status != StatusCode::UciStatusOk)
            }
            Self::OwrAoa(m) => m.status != StatusCode::UciStatusOk,
            Self::DlTdoa(list) => {
                !list.is_empty() && list.iter().all(|m| m.status != StatusCode::UciStatusOk)
            }
        }
    }
}

/// The payload of SESSION_INFO_NTF.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRangeData {
    pub sequence_number: u32,
    pub session_id: SessionId,
    pub current_ranging_interval_ms: u32,
    pub ranging_measurement_type: RangingMeasurementType,
    pub ranging_measurements: RangingMeasurements,
    pub rcr_indicator: u8,
}

/// The payload of a received data packet notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRcvNotification {
    pub session_id: SessionId,
    pub status: StatusCode,
    pub uci_sequence_num: u16,
    pub source_address: UwbAddress,
    pub payload: Bytes,
}

/// One sweep of a radar data notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarSweepData {
    pub sequence_number: u32,
    pub timestamp: u32,
    pub vendor_specific_data: Vec<u8>,
    pub sample_data: Vec<u8>,
}

/// The payload of RADAR_DATA_NTF.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarDataRcv {
    pub session_id: SessionId,
    pub status: StatusCode,
    pub radar_data_type: u8,
    pub samples_per_sweep: u8,
    pub bits_per_sample: u8,
    pub sweeps: Vec<RadarSweepData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_measurement(status: StatusCode) -> ShortAddressTwoWayRangingMeasurement {
        ShortAddressTwoWayRangingMeasurement {
            mac_address: 0xAA01,
            status,
            nlos: 0,
            distance: 120,
            aoa_azimuth: 0,
            aoa_azimuth_fom: 100,
            aoa_elevation: 0,
            aoa_elevation_fom: 100,
            aoa_destination_azimuth: 0,
            aoa_destination_azimuth_fom: 0,
            aoa_destination_elevation: 0,
            aoa_destination_elevation_fom: 0,
            slot_index: 1,
            rssi: 50,
        }
    }

    #[test]
    fn test_all_error_detection() {
        let all_err = RangingMeasurements::ShortAddressTwoWay(vec![
            short_measurement(StatusCode::UciStatusRangingRxTimeout),
            short_measurement(StatusCode::UciStatusFailed),
        ]);
        assert!(all_err.is_all_error());

        let one_ok = RangingMeasurements::ShortAddressTwoWay(vec![
            short_measurement(StatusCode::UciStatusRangingRxTimeout),
            short_measurement(StatusCode::UciStatusOk),
        ]);
        assert!(!one_ok.is_all_error());

        let empty = RangingMeasurements::ShortAddressTwoWay(vec![]);
        assert!(!empty.is_all_error());
    }

    #[test]
    fn test_notification_session_id() {
        let ntf = SessionNotification::Status {
            session_id: 42,
            session_state: SessionState::SessionStateIdle,
            reason_code: 0,
        };
        assert_eq!(ntf.session_id(), 42);
    }
}
