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

//! The UCI-level value types shared across the crate.
//!
//! The wire encoding of these values belongs to the transport below us; this
//! module only fixes the identifiers, states and codes the session layer
//! reasons about.

use num_derive::{FromPrimitive, ToPrimitive};
use zeroize::Zeroize;

/// The session identifier passed to the UWBS.
pub type SessionId = u32;
/// The UWBS-assigned token used when one session references another.
pub type SessionToken = u32;
/// The sub-session identifier of a controlee.
pub type SubSessionId = u32;

/// The caller-minted opaque identity of a session; primary key of the
/// session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionHandle({})", self.0)
    }
}

/// A UWB device address, short or extended form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UwbAddress {
    Short([u8; 2]),
    Extended([u8; 8]),
}

impl UwbAddress {
    /// Widen to the extended form, zero-padding a short address.
    pub fn to_extended(self) -> [u8; 8] {
        match self {
            UwbAddress::Short(addr) => {
                let mut ext = [0u8; 8];
                ext[..2].copy_from_slice(&addr);
                ext
            }
            UwbAddress::Extended(addr) => addr,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            UwbAddress::Short(addr) => addr,
            UwbAddress::Extended(addr) => addr,
        }
    }
}

impl From<[u8; 2]> for UwbAddress {
    fn from(addr: [u8; 2]) -> Self {
        UwbAddress::Short(addr)
    }
}

impl From<[u8; 8]> for UwbAddress {
    fn from(addr: [u8; 8]) -> Self {
        UwbAddress::Extended(addr)
    }
}

/// The state of a session, as reported by SESSION_STATUS_NTF.
///
/// `SessionStateError` is host-local: it marks a session that hit a
/// catastrophic transport failure and is kept only for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum SessionState {
    SessionStateInit = 0x00,
    SessionStateDeinit = 0x01,
    SessionStateActive = 0x02,
    SessionStateIdle = 0x03,
    SessionStateError = 0xFF,
}

/// The type byte of SESSION_INIT_CMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum SessionType {
    FiraRangingSession = 0x00,
    FiraRangingAndInBandDataSession = 0x01,
    FiraDataTransferSession = 0x02,
    FiraRangingOnlyPhase = 0x03,
    FiraInBandDataPhase = 0x04,
    FiraRangingWithDataPhase = 0x05,
    Ccc = 0xA0,
    Aliro = 0xA1,
    DeviceTestMode = 0xD0,
    Radar = 0xF1,
}

impl SessionType {
    /// Session types that may carry a data-transfer phase configuration.
    pub fn supports_data_transfer_phase(&self) -> bool {
        matches!(
            self,
            SessionType::FiraRangingAndInBandDataSession
                | SessionType::FiraDataTransferSession
                | SessionType::FiraInBandDataPhase
        )
    }
}

/// The status code of a UCI command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum StatusCode {
    UciStatusOk = 0x00,
    UciStatusRejected = 0x01,
    UciStatusFailed = 0x02,
    UciStatusSyntaxError = 0x03,
    UciStatusInvalidParam = 0x04,
    UciStatusInvalidRange = 0x05,
    UciStatusInvalidMsgSize = 0x06,
    UciStatusUnknownGid = 0x07,
    UciStatusUnknownOid = 0x08,
    UciStatusReadOnly = 0x09,
    UciStatusCommandRetry = 0x0A,
    UciStatusSessionNotExist = 0x11,
    UciStatusSessionDuplicate = 0x12,
    UciStatusSessionActive = 0x13,
    UciStatusMaxSessionsExceeded = 0x14,
    UciStatusSessionNotConfigured = 0x15,
    UciStatusActiveSessionsOngoing = 0x16,
    UciStatusMulticastListFull = 0x17,
    UciStatusAddressNotFound = 0x18,
    UciStatusAddressAlreadyPresent = 0x19,
    UciStatusRangingTxFailed = 0x20,
    UciStatusRangingRxTimeout = 0x21,
    UciStatusRangingRxPhyDecFailed = 0x22,
    UciStatusRangingRxPhyToaFailed = 0x23,
    UciStatusRangingRxPhyStsFailed = 0x24,
    UciStatusRangingRxMacDecFailed = 0x25,
    UciStatusRangingRxMacIeDecFailed = 0x26,
    UciStatusRangingRxMacIeMissing = 0x27,
    UciStatusErrorRoundIndexNotActivated = 0x28,
    UciStatusErrorNumberOfActiveRangingRoundsExceeded = 0x29,
    UciStatusErrorRoundIndexNotSetAsInitiator = 0x2A,
    UciStatusErrorDlTdoaDeviceAddressNotMatchingInReplyTimeList = 0x2B,
    UciStatusDataMaxTxPsduSizeExceeded = 0x30,
    UciStatusDataRxCrcError = 0x31,
    UciStatusErrorCccSeBusy = 0x50,
    UciStatusErrorCccLifecycle = 0x51,
    UciStatusErrorStoppedDueToOtherSessionConflict = 0x52,
    UciStatusRegulationUwbOff = 0x53,
}

/// The reason code delivered with SESSION_STATUS_NTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ReasonCode {
    StateChangeWithSessionManagementCommands = 0x00,
    MaxRangingRoundRetryCountReached = 0x01,
    MaxNumberOfMeasurementsReached = 0x02,
    SessionSuspendedDueToInbandSignal = 0x03,
    SessionResumedDueToInbandSignal = 0x04,
    SessionStoppedDueToInbandSignal = 0x05,
    ErrorInvalidUlTdoaRandomWindow = 0x1D,
    ErrorSlotLengthNotSupported = 0x20,
    ErrorInsufficientSlotsPerRr = 0x21,
    ErrorMacAddressModeNotSupported = 0x22,
    ErrorInvalidRangingDuration = 0x23,
    ErrorInvalidStsConfig = 0x24,
    ErrorInvalidRframeConfig = 0x25,
    ErrorHusNotEnoughSlots = 0x26,
    ErrorHusCfpPhaseTooShort = 0x27,
    ErrorHusCapPhaseTooShort = 0x28,
    ErrorHusOthers = 0x29,
    ErrorSessionKeyNotFound = 0x2A,
    ErrorSubSessionKeyNotFound = 0x2B,
    ErrorRegulationUwbOff = 0x73,
}

/// The action byte of SESSION_UPDATE_CONTROLLER_MULTICAST_LIST_CMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum UpdateMulticastListAction {
    AddControlee = 0x00,
    RemoveControlee = 0x01,
    AddControleeWithShortSubSessionKey = 0x02,
    AddControleeWithLongSubSessionKey = 0x03,
}

impl UpdateMulticastListAction {
    /// Actions that carry per-controlee sub-session key material.
    pub fn requires_sub_session_key(&self) -> bool {
        matches!(
            self,
            UpdateMulticastListAction::AddControleeWithShortSubSessionKey
                | UpdateMulticastListAction::AddControleeWithLongSubSessionKey
        )
    }

    /// Actions that add controlees to the session.
    pub fn is_add(&self) -> bool {
        !matches!(self, UpdateMulticastListAction::RemoveControlee)
    }

    /// The required key length in bytes, if the action carries keys.
    pub fn sub_session_key_len(&self) -> Option<usize> {
        match self {
            UpdateMulticastListAction::AddControleeWithShortSubSessionKey => Some(16),
            UpdateMulticastListAction::AddControleeWithLongSubSessionKey => Some(32),
            _ => None,
        }
    }
}

/// Per-controlee status in SESSION_UPDATE_CONTROLLER_MULTICAST_LIST_NTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MulticastUpdateStatusCode {
    StatusOkMulticastListUpdate = 0x00,
    StatusErrorMulticastListFull = 0x01,
    StatusErrorKeyFetchFail = 0x02,
    StatusErrorSubSessionIdNotFound = 0x03,
    StatusErrorSubSessionKeyNotFound = 0x05,
    StatusErrorSubSessionKeyNotApplicable = 0x06,
    StatusErrorSessionKeyNotFound = 0x07,
    StatusErrorAddressNotFound = 0x08,
    StatusErrorAddressAlreadyPresent = 0x09,
}

/// One entry of the multicast-update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControleeStatus {
    pub mac_address: [u8; 2],
    pub subsession_id: SubSessionId,
    pub status: MulticastUpdateStatusCode,
}

/// Sub-session key material for a controlee. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SubSessionKey(Vec<u8>);

impl SubSessionKey {
    pub fn new(key: Vec<u8>) -> Self {
        Self(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Key material stays out of the logs.
impl std::fmt::Debug for SubSessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubSessionKey({} bytes)", self.0.len())
    }
}

/// A controlee entry of a multicast-list update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controlee {
    pub short_address: [u8; 2],
    pub subsession_id: SubSessionId,
    /// Defaults to no key; required only by the keyed add actions.
    pub subsession_key: Option<SubSessionKey>,
}

impl Controlee {
    pub fn new(short_address: [u8; 2]) -> Self {
        Self { short_address, subsession_id: 0, subsession_key: None }
    }
}

/// The status code of SESSION_DATA_TRANSFER_STATUS_NTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum DataTransferNtfStatusCode {
    UciDataTransferNtfStatusOk = 0x00,
    UciDataTransferNtfStatusRepetitionOk = 0x01,
    UciDataTransferNtfStatusErrorDataTransfer = 0x02,
    UciDataTransferNtfStatusErrorNoCreditAvailable = 0x03,
    UciDataTransferNtfStatusErrorRejected = 0x04,
    UciDataTransferNtfStatusSessionTypeNotSupported = 0x05,
    UciDataTransferNtfStatusErrorDataTransferIsOngoing = 0x06,
    UciDataTransferNtfStatusInvalidFormat = 0x07,
}

/// The status of SESSION_DATA_TRANSFER_PHASE_CONFIG_NTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum DataTransferPhaseConfigStatusCode {
    UciDtpcmConfigSuccess = 0x00,
    UciDtpcmErrorInvalidPhase = 0x01,
    UciDtpcmErrorDuplicatePhase = 0x02,
    UciDtpcmErrorOther = 0x03,
}

/// The measurement type of SESSION_INFO_NTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum RangingMeasurementType {
    OneWay = 0x00,
    TwoWay = 0x01,
    DlTdoa = 0x02,
    OwrAoa = 0x03,
}

/// A two-way ranging measurement with a short peer address.
///
/// Angles are Q9.7 degrees, distances centimeters, matching the UCI fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortAddressTwoWayRangingMeasurement {
    pub mac_address: u16,
    pub status: StatusCode,
    pub nlos: u8,
    pub distance: u16,
    pub aoa_azimuth: i16,
    pub aoa_azimuth_fom: u8,
    pub aoa_elevation: i16,
    pub aoa_elevation_fom: u8,
    pub aoa_destination_azimuth: i16,
    pub aoa_destination_azimuth_fom: u8,
    pub aoa_destination_elevation: i16,
    pub aoa_destination_elevation_fom: u8,
    pub slot_index: u8,
    pub rssi: u8,
}

/// A two-way ranging measurement with an extended peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedAddressTwoWayRangingMeasurement {
    pub mac_address: u64,
    pub status: StatusCode,
    pub nlos: u8,
    pub distance: u16,
    pub aoa_azimuth: i16,
    pub aoa_azimuth_fom: u8,
    pub aoa_elevation: i16,
    pub aoa_elevation_fom: u8,
    pub aoa_destination_azimuth: i16,
    pub aoa_destination_azimuth_fom: u8,
    pub aoa_destination_elevation: i16,
    pub aoa_destination_elevation_fom: u8,
    pub slot_index: u8,
    pub rssi: u8,
}

/// A one-way AoA measurement of an advertiser frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwrAoaRangingMeasurement {
    pub mac_address: UwbAddress,
    pub status: StatusCode,
    pub nlos: u8,
    pub frame_sequence_number: u8,
    pub block_index: u16,
    pub aoa_azimuth: i16,
    pub aoa_azimuth_fom: u8,
    pub aoa_elevation: i16,
    pub aoa_elevation_fom: u8,
}

/// A DL-TDoA measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlTdoaRangingMeasurement {
    pub mac_address: UwbAddress,
    pub status: StatusCode,
    pub message_control: u16,
    pub block_index: u16,
    pub round_index: u8,
    pub nlos: u8,
    pub aoa_azimuth: i16,
    pub aoa_azimuth_fom: u8,
    pub aoa_elevation: i16,
    pub aoa_elevation_fom: u8,
    pub rssi: u8,
    pub tx_timestamp: u64,
    pub rx_timestamp: u64,
}

/// The response of SESSION_UPDATE_DT_TAG_RANGING_ROUNDS_CMD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdateDtTagRangingRoundsResponse {
    pub status: StatusCode,
    /// Round indexes the UWBS did not activate.
    pub ranging_round_indexes: Vec<u8>,
}

/// The id of an app config TLV.
///
/// FiRa identifiers in the standard range, CCC/ALIRO and Radar identifiers
/// in the vendor ranges the respective specs assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum AppConfigTlvType {
    DeviceType = 0x00,
    RangingRoundUsage = 0x01,
    StsConfig = 0x02,
    MultiNodeMode = 0x03,
    ChannelNumber = 0x04,
    NoOfControlee = 0x05,
    DeviceMacAddress = 0x06,
    DstMacAddress = 0x07,
    SlotDuration = 0x08,
    RangingDuration = 0x09,
    StsIndex = 0x0A,
    MacFcsType = 0x0B,
    RangingRoundControl = 0x0C,
    AoaResultReq = 0x0D,
    RngDataNtf = 0x0E,
    RngDataNtfProximityNear = 0x0F,
    RngDataNtfProximityFar = 0x10,
    DeviceRole = 0x11,
    RframeConfig = 0x12,
    PreambleCodeIndex = 0x14,
    SfdId = 0x15,
    PsduDataRate = 0x16,
    PreambleDuration = 0x17,
    RangingTimeStruct = 0x1A,
    SlotsPerRr = 0x1B,
    TxAdaptivePayloadPower = 0x1C,
    PrfMode = 0x1F,
    ScheduledMode = 0x22,
    KeyRotation = 0x23,
    KeyRotationRate = 0x24,
    SessionPriority = 0x25,
    MacAddressMode = 0x26,
    VendorId = 0x27,
    StaticStsIv = 0x28,
    NumberOfStsSegments = 0x29,
    MaxRrRetry = 0x2A,
    UwbInitiationTime = 0x2B,
    HoppingMode = 0x2C,
    BlockStrideLength = 0x2D,
    ResultReportConfig = 0x2E,
    InBandTerminationAttemptCount = 0x2F,
    SubSessionId = 0x30,
    BprfPhrDataRate = 0x31,
    MaxNumberOfMeasurements = 0x32,
    DataRepetitionCount = 0x33,
    StsLength = 0x35,
    SessionKey = 0x45,
    SubSessionKey = 0x46,
    SessionTimeBase = 0x48,
    ApplicationDataEndpoint = 0x4C,
    // CCC vendor range.
    CccHopModeKey = 0xA0,
    CccUwbTime0 = 0xA1,
    CccRanMultiplier = 0xA2,
    CccRangingProtocolVer = 0xA3,
    CccUwbConfigId = 0xA4,
    CccPulseshapeCombo = 0xA5,
    CccUrskTtl = 0xA6,
    CccLastIndexUsed = 0xA8,
    // Radar vendor range.
    RadarTimingParams = 0xB0,
    RadarSamplesPerSweep = 0xB1,
    RadarSweepPeriod = 0xB2,
    RadarSweepOffset = 0xB3,
    RadarNumberOfBursts = 0xB4,
    RadarBitsPerSample = 0xB5,
    RadarDataType = 0xB6,
}

/// One app config TLV; the value encoding follows the config id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigTlv {
    pub cfg_id: AppConfigTlvType,
    pub v: Vec<u8>,
}

/// A protocol (FiRa MAC or UCI) version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn is_at_least(&self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

/// The UCI version at which the UWBS assigns session tokens and accepts
/// absolute initiation times.
pub const UCI_VERSION_2_0: ProtocolVersion = ProtocolVersion::new(2, 0);

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_address_widening() {
        let short = UwbAddress::Short([0xAA, 0x01]);
        assert_eq!(short.to_extended(), [0xAA, 0x01, 0, 0, 0, 0, 0, 0]);
        let ext = UwbAddress::Extended([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ext.to_extended(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_reason_code_from_raw() {
        assert_eq!(
            ReasonCode::from_u8(0x00),
            Some(ReasonCode::StateChangeWithSessionManagementCommands)
        );
        assert_eq!(ReasonCode::from_u8(0x01), Some(ReasonCode::MaxRangingRoundRetryCountReached));
        // Values outside the table are handled by the caller.
        assert_eq!(ReasonCode::from_u8(0xE0), None);
    }

    #[test]
    fn test_multicast_action_key_rules() {
        assert!(!UpdateMulticastListAction::AddControlee.requires_sub_session_key());
        assert_eq!(
            UpdateMulticastListAction::AddControleeWithShortSubSessionKey.sub_session_key_len(),
            Some(16)
        );
        assert_eq!(
            UpdateMulticastListAction::AddControleeWithLongSubSessionKey.sub_session_key_len(),
            Some(32)
        );
        assert!(UpdateMulticastListAction::AddControlee.is_add());
        assert!(!UpdateMulticastListAction::RemoveControlee.is_add());
    }

    #[test]
    fn test_sub_session_key_debug_is_redacted() {
        let key = SubSessionKey::new(vec![0x42; 16]);
        assert_eq!(format!("{key:?}"), "SubSessionKey(16 bytes)");
    }

    #[test]
    fn test_protocol_version_ordering() {
        assert!(ProtocolVersion::new(2, 0).is_at_least(2, 0));
        assert!(ProtocolVersion::new(2, 1).is_at_least(2, 0));
        assert!(!ProtocolVersion::new(1, 1).is_at_least(2, 0));
    }

    #[test]
    fn test_session_type_data_transfer_phase_support() {
        assert!(SessionType::FiraRangingAndInBandDataSession.supports_data_transfer_phase());
        assert!(SessionType::FiraInBandDataPhase.supports_data_transfer_phase());
        assert!(!SessionType::FiraRangingSession.supports_data_transfer_phase());
        assert!(!SessionType::Ccc.supports_data_transfer_phase());
    }
}
