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

//! The FiRa session parameters and their app config TLV encoding.

use std::collections::HashMap;

use log::error;
use zeroize::Zeroize;

use crate::params::uci_packets::{
    AppConfigTlvType, SessionHandle, SessionToken, SubSessionId, UwbAddress,
};

/// The default (sentinel) session priority; a caller-supplied value other
/// than this locks the session's priority.
pub const DEFAULT_SESSION_PRIORITY: u8 = 50;

/// The default per-peer cap of buffered received payloads.
pub const DEFAULT_RX_DATA_MAX_PACKETS_TO_STORE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceType {
    Controlee = 0,
    Controller = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceRole {
    Responder = 0,
    Initiator = 1,
    UtSynchronizationAnchor = 2,
    UtAnchor = 3,
    UtTag = 4,
    Advertiser = 5,
    Observer = 6,
    DtAnchor = 7,
    DtTag = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RangingRoundUsage {
    UlTdoa = 0,
    SsTwrDeferred = 1,
    DsTwrDeferred = 2,
    SsTwrNonDeferred = 3,
    DsTwrNonDeferred = 4,
    DlTdoa = 5,
    OwrAoaMeasurement = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MultiNodeMode {
    Unicast = 0,
    OneToMany = 1,
    ManyToMany = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StsConfig {
    Static = 0,
    Dynamic = 1,
    DynamicForControleeIndividualKey = 2,
    Provisioned = 3,
    ProvisionedForControleeIndividualKey = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UwbChannel {
    Channel5 = 5,
    Channel6 = 6,
    Channel8 = 8,
    Channel9 = 9,
    Channel10 = 10,
    Channel12 = 12,
    Channel13 = 13,
    Channel14 = 14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MacFcsType {
    Crc16 = 0,
    Crc32 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AoaResultRequest {
    NoAoaReport = 0,
    ReqAoaResults = 1,
    ReqAoaResultsAzimuthOnly = 2,
    ReqAoaResultsElevationOnly = 3,
    ReqAoaResultsInterleaved = 0xF0,
}

/// Ranging-data notification control; the proximity bounds apply to the
/// proximity-triggered modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RangeDataNtfConfig {
    Disable = 0,
    Enable = 1,
    EnableProximityLevelTrig = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RframeConfig {
    SP0 = 0,
    SP1 = 1,
    SP3 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PsduDataRate {
    Rate6m81 = 0,
    Rate7m80 = 1,
    Rate27m2 = 2,
    Rate31m2 = 3,
    Rate850k = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreambleDuration {
    T32Symbols = 0,
    T64Symbols = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RangingTimeStruct {
    IntervalBasedScheduling = 0,
    BlockBasedScheduling = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxAdaptivePayloadPower {
    Disable = 0,
    Enable = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrfMode {
    Bprf = 0,
    HprfWith124_8MHz = 1,
    HprfWith249_6MHz = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScheduledMode {
    ContentionBasedRanging = 0,
    TimeScheduledRanging = 1,
    HybridBasedRanging = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyRotation {
    Disable = 0,
    Enable = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MacAddressMode {
    MacAddress2Bytes = 0,
    MacAddress8Bytes2BytesHeader = 1,
    MacAddress8Bytes = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HoppingMode {
    Disable = 0,
    FiraHoppingEnable = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StsLength {
    Length32 = 0,
    Length64 = 1,
    Length128 = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BprfPhrDataRate {
    Rate850k = 0,
    Rate6m81 = 1,
}

/// The RANGING_ROUND_CONTROL bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangingRoundControl {
    pub ranging_result_report_message: bool,
    pub control_message: bool,
    pub measurement_report_message: bool,
}

impl RangingRoundControl {
    fn as_u8(&self) -> u8 {
        let mut value = 0u8;
        if self.ranging_result_report_message {
            value |= 0x01;
        }
        if self.control_message {
            value |= 0x02;
        }
        if self.measurement_report_message {
            value |= 0x80;
        }
        value
    }
}

impl Default for RangingRoundControl {
    fn default() -> Self {
        Self {
            ranging_result_report_message: true,
            control_message: true,
            measurement_report_message: false,
        }
    }
}

/// The RESULT_REPORT_CONFIG bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultReportConfig {
    pub tof: bool,
    pub aoa_azimuth: bool,
    pub aoa_elevation: bool,
    pub aoa_fom: bool,
}

impl ResultReportConfig {
    fn as_u8(&self) -> u8 {
        let mut value = 0u8;
        if self.tof {
            value |= 0x01;
        }
        if self.aoa_azimuth {
            value |= 0x02;
        }
        if self.aoa_elevation {
            value |= 0x04;
        }
        if self.aoa_fom {
            value |= 0x08;
        }
        value
    }
}

impl Default for ResultReportConfig {
    fn default() -> Self {
        Self { tof: true, aoa_azimuth: false, aoa_elevation: false, aoa_fom: false }
    }
}

/// AoA post-processing selection; `Default` binds the shared pose source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    None,
    Default,
}

/// FiRa session key material. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    pub fn new(key: Vec<u8>) -> Self {
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({} bytes)", self.0.len())
    }
}

/// A reference to another session used as the time base.
///
/// The caller supplies the handle; the session token is resolved from the
/// session table right before the config is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTimeBase {
    pub reference_session_handle: SessionHandle,
    pub resolved_session_token: Option<SessionToken>,
    pub session_offset_ms: u32,
}

/// One phase of a hybrid session, referencing a constituent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridPhase {
    pub session_handle: SessionHandle,
    pub resolved_session_token: Option<SessionToken>,
    pub start_slot_index: u16,
    pub end_slot_index: u16,
}

/// The FiRa app configuration parameters.
///
/// Immutable by default; the defined reconfigure paths replace the whole
/// record through the session manager.
#[derive(Debug, Clone, PartialEq)]
pub struct FiraAppConfigParams {
    pub(crate) device_type: DeviceType,
    pub(crate) device_role: DeviceRole,
    pub(crate) ranging_round_usage: RangingRoundUsage,
    pub(crate) multi_node_mode: MultiNodeMode,
    pub(crate) sts_config: StsConfig,
    pub(crate) channel_number: UwbChannel,
    pub(crate) device_mac_address: UwbAddress,
    pub(crate) dst_mac_address_list: Vec<UwbAddress>,
    pub(crate) slot_duration_rstu: u16,
    pub(crate) ranging_interval_ms: u32,
    pub(crate) mac_fcs_type: MacFcsType,
    pub(crate) ranging_round_control: RangingRoundControl,
    pub(crate) aoa_result_request: AoaResultRequest,
    pub(crate) range_data_ntf_config: RangeDataNtfConfig,
    pub(crate) range_data_ntf_proximity_near_cm: u16,
    pub(crate) range_data_ntf_proximity_far_cm: u16,
    pub(crate) rframe_config: RframeConfig,
    pub(crate) preamble_code_index: u8,
    pub(crate) sfd_id: u8,
    pub(crate) psdu_data_rate: PsduDataRate,
    pub(crate) preamble_duration: PreambleDuration,
    pub(crate) ranging_time_struct: RangingTimeStruct,
    pub(crate) slots_per_rr: u8,
    pub(crate) tx_adaptive_payload_power: TxAdaptivePayloadPower,
    pub(crate) prf_mode: PrfMode,
    pub(crate) scheduled_mode: ScheduledMode,
    pub(crate) key_rotation: KeyRotation,
    pub(crate) key_rotation_rate: u8,
    pub(crate) session_priority: u8,
    pub(crate) mac_address_mode: MacAddressMode,
    pub(crate) vendor_id: [u8; 2],
    pub(crate) static_sts_iv: [u8; 6],
    pub(crate) number_of_sts_segments: u8,
    pub(crate) max_rr_retry: u16,
    pub(crate) initiation_time_ms: u64,
    pub(crate) absolute_initiation_time_us: Option<u64>,
    pub(crate) hopping_mode: HoppingMode,
    pub(crate) block_stride_length: u8,
    pub(crate) result_report_config: ResultReportConfig,
    pub(crate) in_band_termination_attempt_count: u8,
    pub(crate) sub_session_id: SubSessionId,
    pub(crate) bprf_phr_data_rate: BprfPhrDataRate,
    pub(crate) max_number_of_measurements: u16,
    pub(crate) sts_length: StsLength,
    pub(crate) session_key: Option<SessionKey>,
    pub(crate) data_repetition_count: u8,
    pub(crate) rx_data_max_packets_to_store: usize,
    pub(crate) filter_type: FilterType,
    pub(crate) reference_time_base: Option<ReferenceTimeBase>,
    pub(crate) hybrid_phase_list: Vec<HybridPhase>,
}

impl FiraAppConfigParams {
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn device_role(&self) -> DeviceRole {
        self.device_role
    }

    pub fn ranging_round_usage(&self) -> RangingRoundUsage {
        self.ranging_round_usage
    }

    pub fn sts_config(&self) -> StsConfig {
        self.sts_config
    }

    pub fn ranging_interval_ms(&self) -> u32 {
        self.ranging_interval_ms
    }

    pub fn session_priority(&self) -> u8 {
        self.session_priority
    }

    pub fn dst_mac_address_list(&self) -> &[UwbAddress] {
        &self.dst_mac_address_list
    }

    pub fn data_repetition_count(&self) -> u8 {
        self.data_repetition_count
    }

    pub fn rx_data_max_packets_to_store(&self) -> usize {
        self.rx_data_max_packets_to_store
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    pub fn hybrid_phase_list(&self) -> &[HybridPhase] {
        &self.hybrid_phase_list
    }

    pub(crate) fn set_session_priority(&mut self, priority: u8) {
        self.session_priority = priority;
    }

    pub(crate) fn set_absolute_initiation_time_us(&mut self, time_us: Option<u64>) {
        self.absolute_initiation_time_us = time_us;
    }

    pub fn initiation_time_ms(&self) -> u64 {
        self.initiation_time_ms
    }

    pub fn absolute_initiation_time_us(&self) -> Option<u64> {
        self.absolute_initiation_time_us
    }

    pub fn reference_time_base(&self) -> Option<&ReferenceTimeBase> {
        self.reference_time_base.as_ref()
    }

    pub(crate) fn reference_time_base_mut(&mut self) -> Option<&mut ReferenceTimeBase> {
        self.reference_time_base.as_mut()
    }

    pub(crate) fn hybrid_phase_list_mut(&mut self) -> &mut [HybridPhase] {
        &mut self.hybrid_phase_list
    }

    /// The TLVs of a live ranging-data notification override.
    ///
    /// Enabling restores the stored config and proximity bounds; disabling
    /// emits only the Disable control. Neither mutates the stored params.
    pub fn range_data_ntf_override_tlvs(
        &self,
        enabled: bool,
    ) -> Vec<crate::params::uci_packets::AppConfigTlv> {
        use crate::params::uci_packets::AppConfigTlv;
        if enabled {
            vec![
                AppConfigTlv {
                    cfg_id: AppConfigTlvType::RngDataNtf,
                    v: vec![self.range_data_ntf_config as u8],
                },
                AppConfigTlv {
                    cfg_id: AppConfigTlvType::RngDataNtfProximityNear,
                    v: self.range_data_ntf_proximity_near_cm.to_le_bytes().to_vec(),
                },
                AppConfigTlv {
                    cfg_id: AppConfigTlvType::RngDataNtfProximityFar,
                    v: self.range_data_ntf_proximity_far_cm.to_le_bytes().to_vec(),
                },
            ]
        } else {
            vec![AppConfigTlv {
                cfg_id: AppConfigTlvType::RngDataNtf,
                v: vec![RangeDataNtfConfig::Disable as u8],
            }]
        }
    }

    pub(crate) fn generate_config_map(&self) -> HashMap<AppConfigTlvType, Vec<u8>> {
        let mut map = HashMap::from([
            (AppConfigTlvType::DeviceType, vec![self.device_type as u8]),
            (AppConfigTlvType::DeviceRole, vec![self.device_role as u8]),
            (AppConfigTlvType::RangingRoundUsage, vec![self.ranging_round_usage as u8]),
            (AppConfigTlvType::MultiNodeMode, vec![self.multi_node_mode as u8]),
            (AppConfigTlvType::StsConfig, vec![self.sts_config as u8]),
            (AppConfigTlvType::ChannelNumber, vec![self.channel_number as u8]),
            (AppConfigTlvType::NoOfControlee, vec![self.dst_mac_address_list.len() as u8]),
            (AppConfigTlvType::DeviceMacAddress, self.device_mac_address.as_bytes().to_vec()),
            (
                AppConfigTlvType::DstMacAddress,
                self.dst_mac_address_list.iter().flat_map(|addr| addr.as_bytes().to_vec()).collect(),
            ),
            (AppConfigTlvType::SlotDuration, self.slot_duration_rstu.to_le_bytes().to_vec()),
            (AppConfigTlvType::RangingDuration, self.ranging_interval_ms.to_le_bytes().to_vec()),
            (AppConfigTlvType::MacFcsType, vec![self.mac_fcs_type as u8]),
            (AppConfigTlvType::RangingRoundControl, vec![self.ranging_round_control.as_u8()]),
            (AppConfigTlvType::AoaResultReq, vec![self.aoa_result_request as u8]),
            (AppConfigTlvType::RngDataNtf, vec![self.range_data_ntf_config as u8]),
            (
                AppConfigTlvType::RngDataNtfProximityNear,
                self.range_data_ntf_proximity_near_cm.to_le_bytes().to_vec(),
            ),
            (
                AppConfigTlvType::RngDataNtfProximityFar,
                self.range_data_ntf_proximity_far_cm.to_le_bytes().to_vec(),
            ),
            (AppConfigTlvType::RframeConfig, vec![self.rframe_config as u8]),
            (AppConfigTlvType::PreambleCodeIndex, vec![self.preamble_code_index]),
            (AppConfigTlvType::SfdId, vec![self.sfd_id]),
            (AppConfigTlvType::PsduDataRate, vec![self.psdu_data_rate as u8]),
            (AppConfigTlvType::PreambleDuration, vec![self.preamble_duration as u8]),
            (AppConfigTlvType::RangingTimeStruct, vec![self.ranging_time_struct as u8]),
            (AppConfigTlvType::SlotsPerRr, vec![self.slots_per_rr]),
            (
                AppConfigTlvType::TxAdaptivePayloadPower,
                vec![self.tx_adaptive_payload_power as u8],
            ),
            (AppConfigTlvType::PrfMode, vec![self.prf_mode as u8]),
            (AppConfigTlvType::ScheduledMode, vec![self.scheduled_mode as u8]),
            (AppConfigTlvType::KeyRotation, vec![self.key_rotation as u8]),
            (AppConfigTlvType::KeyRotationRate, vec![self.key_rotation_rate]),
            (AppConfigTlvType::SessionPriority, vec![self.session_priority]),
            (AppConfigTlvType::MacAddressMode, vec![self.mac_address_mode as u8]),
            (AppConfigTlvType::VendorId, self.vendor_id.to_vec()),
            (AppConfigTlvType::StaticStsIv, self.static_sts_iv.to_vec()),
            (AppConfigTlvType::NumberOfStsSegments, vec![self.number_of_sts_segments]),
            (AppConfigTlvType::MaxRrRetry, self.max_rr_retry.to_le_bytes().to_vec()),
            (AppConfigTlvType::UwbInitiationTime, self.initiation_time_tlv()),
            (AppConfigTlvType::HoppingMode, vec![self.hopping_mode as u8]),
            (AppConfigTlvType::BlockStrideLength, vec![self.block_stride_length]),
            (AppConfigTlvType::ResultReportConfig, vec![self.result_report_config.as_u8()]),
            (
                AppConfigTlvType::InBandTerminationAttemptCount,
                vec![self.in_band_termination_attempt_count],
            ),
            (AppConfigTlvType::BprfPhrDataRate, vec![self.bprf_phr_data_rate as u8]),
            (
                AppConfigTlvType::MaxNumberOfMeasurements,
                self.max_number_of_measurements.to_le_bytes().to_vec(),
            ),
            (AppConfigTlvType::StsLength, vec![self.sts_length as u8]),
            (
                AppConfigTlvType::DataRepetitionCount,
                vec![self.data_repetition_count],
            ),
        ]);
        if self.sub_session_id != 0 {
            map.insert(AppConfigTlvType::SubSessionId, self.sub_session_id.to_le_bytes().to_vec());
        }
        if let Some(key) = &self.session_key {
            map.insert(AppConfigTlvType::SessionKey, key.as_bytes().to_vec());
        }
        if let Some(time_base) = &self.reference_time_base {
            if let Some(token) = time_base.resolved_session_token {
                let mut v = vec![0x01];
                v.extend_from_slice(&token.to_le_bytes());
                v.extend_from_slice(&time_base.session_offset_ms.to_le_bytes());
                map.insert(AppConfigTlvType::SessionTimeBase, v);
            }
        }
        map
    }

    fn initiation_time_tlv(&self) -> Vec<u8> {
        match self.absolute_initiation_time_us {
            Some(time_us) => time_us.to_le_bytes().to_vec(),
            None => (self.initiation_time_ms as u32).to_le_bytes().to_vec(),
        }
    }

    pub(crate) fn generate_updated_config_map(
        &self,
        prev: &Self,
    ) -> HashMap<AppConfigTlvType, Vec<u8>> {
        let prev_map = prev.generate_config_map();
        self.generate_config_map()
            .into_iter()
            .filter(|(cfg_id, v)| prev_map.get(cfg_id) != Some(v))
            .collect()
    }
}

/// The builder of FiraAppConfigParams.
pub struct FiraAppConfigParamsBuilder {
    device_type: DeviceType,
    device_role: DeviceRole,
    ranging_round_usage: RangingRoundUsage,
    multi_node_mode: MultiNodeMode,
    sts_config: StsConfig,
    channel_number: UwbChannel,
    device_mac_address: Option<UwbAddress>,
    dst_mac_address_list: Vec<UwbAddress>,
    slot_duration_rstu: u16,
    ranging_interval_ms: u32,
    mac_fcs_type: MacFcsType,
    ranging_round_control: RangingRoundControl,
    aoa_result_request: AoaResultRequest,
    range_data_ntf_config: RangeDataNtfConfig,
    range_data_ntf_proximity_near_cm: u16,
    range_data_ntf_proximity_far_cm: u16,
    rframe_config: RframeConfig,
    preamble_code_index: u8,
    sfd_id: u8,
    psdu_data_rate: PsduDataRate,
    preamble_duration: PreambleDuration,
    ranging_time_struct: RangingTimeStruct,
    slots_per_rr: u8,
    tx_adaptive_payload_power: TxAdaptivePayloadPower,
    prf_mode: PrfMode,
    scheduled_mode: ScheduledMode,
    key_rotation: KeyRotation,
    key_rotation_rate: u8,
    session_priority: u8,
    mac_address_mode: MacAddressMode,
    vendor_id: [u8; 2],
    static_sts_iv: [u8; 6],
    number_of_sts_segments: u8,
    max_rr_retry: u16,
    initiation_time_ms: u64,
    absolute_initiation_time_us: Option<u64>,
    hopping_mode: HoppingMode,
    block_stride_length: u8,
    result_report_config: ResultReportConfig,
    in_band_termination_attempt_count: u8,
    sub_session_id: SubSessionId,
    bprf_phr_data_rate: BprfPhrDataRate,
    max_number_of_measurements: u16,
    sts_length: StsLength,
    session_key: Option<SessionKey>,
    data_repetition_count: u8,
    rx_data_max_packets_to_store: usize,
    filter_type: FilterType,
    reference_time_base: Option<ReferenceTimeBase>,
    hybrid_phase_list: Vec<HybridPhase>,
}

#[allow(clippy::new_without_default)]
impl FiraAppConfigParamsBuilder {
    pub fn new() -> Self {
        Self {
            device_type: DeviceType::Controller,
            device_role: DeviceRole::Initiator,
            ranging_round_usage: RangingRoundUsage::DsTwrDeferred,
            multi_node_mode: MultiNodeMode::Unicast,
            sts_config: StsConfig::Static,
            channel_number: UwbChannel::Channel9,
            device_mac_address: None,
            dst_mac_address_list: vec![],
            slot_duration_rstu: 2400,
            ranging_interval_ms: 200,
            mac_fcs_type: MacFcsType::Crc16,
            ranging_round_control: RangingRoundControl::default(),
            aoa_result_request: AoaResultRequest::ReqAoaResults,
            range_data_ntf_config: RangeDataNtfConfig::Enable,
            range_data_ntf_proximity_near_cm: 0,
            range_data_ntf_proximity_far_cm: 20000,
            rframe_config: RframeConfig::SP3,
            preamble_code_index: 10,
            sfd_id: 2,
            psdu_data_rate: PsduDataRate::Rate6m81,
            preamble_duration: PreambleDuration::T64Symbols,
            ranging_time_struct: RangingTimeStruct::IntervalBasedScheduling,
            slots_per_rr: 25,
            tx_adaptive_payload_power: TxAdaptivePayloadPower::Disable,
            prf_mode: PrfMode::Bprf,
            scheduled_mode: ScheduledMode::TimeScheduledRanging,
            key_rotation: KeyRotation::Disable,
            key_rotation_rate: 0,
            session_priority: DEFAULT_SESSION_PRIORITY,
            mac_address_mode: MacAddressMode::MacAddress2Bytes,
            vendor_id: [0, 0],
            static_sts_iv: [0; 6],
            number_of_sts_segments: 1,
            max_rr_retry: 0,
            initiation_time_ms: 0,
            absolute_initiation_time_us: None,
            hopping_mode: HoppingMode::Disable,
            block_stride_length: 0,
            result_report_config: ResultReportConfig::default(),
            in_band_termination_attempt_count: 1,
            sub_session_id: 0,
            bprf_phr_data_rate: BprfPhrDataRate::Rate850k,
            max_number_of_measurements: 0,
            sts_length: StsLength::Length64,
            session_key: None,
            data_repetition_count: 0,
            rx_data_max_packets_to_store: DEFAULT_RX_DATA_MAX_PACKETS_TO_STORE,
            filter_type: FilterType::Default,
            reference_time_base: None,
            hybrid_phase_list: vec![],
        }
    }

    builder_field!(device_type, DeviceType);
    builder_field!(device_role, DeviceRole);
    builder_field!(ranging_round_usage, RangingRoundUsage);
    builder_field!(multi_node_mode, MultiNodeMode);
    builder_field!(sts_config, StsConfig);
    builder_field!(channel_number, UwbChannel);
    builder_field!(device_mac_address, UwbAddress, Some);
    builder_field!(dst_mac_address_list, Vec<UwbAddress>);
    builder_field!(slot_duration_rstu, u16);
    builder_field!(ranging_interval_ms, u32);
    builder_field!(mac_fcs_type, MacFcsType);
    builder_field!(ranging_round_control, RangingRoundControl);
    builder_field!(aoa_result_request, AoaResultRequest);
    builder_field!(range_data_ntf_config, RangeDataNtfConfig);
    builder_field!(range_data_ntf_proximity_near_cm, u16);
    builder_field!(range_data_ntf_proximity_far_cm, u16);
    builder_field!(rframe_config, RframeConfig);
    builder_field!(preamble_code_index, u8);
    builder_field!(sfd_id, u8);
    builder_field!(psdu_data_rate, PsduDataRate);
    builder_field!(preamble_duration, PreambleDuration);
    builder_field!(ranging_time_struct, RangingTimeStruct);
    builder_field!(slots_per_rr, u8);
    builder_field!(tx_adaptive_payload_power, TxAdaptivePayloadPower);
    builder_field!(prf_mode, PrfMode);
    builder_field!(scheduled_mode, ScheduledMode);
    builder_field!(key_rotation, KeyRotation);
    builder_field!(key_rotation_rate, u8);
    builder_field!(session_priority, u8);
    builder_field!(mac_address_mode, MacAddressMode);
    builder_field!(vendor_id, [u8; 2]);
    builder_field!(static_sts_iv, [u8; 6]);
    builder_field!(number_of_sts_segments, u8);
    builder_field!(max_rr_retry, u16);
    builder_field!(initiation_time_ms, u64);
    builder_field!(absolute_initiation_time_us, u64, Some);
    builder_field!(hopping_mode, HoppingMode);
    builder_field!(block_stride_length, u8);
    builder_field!(result_report_config, ResultReportConfig);
    builder_field!(in_band_termination_attempt_count, u8);
    builder_field!(sub_session_id, SubSessionId);
    builder_field!(bprf_phr_data_rate, BprfPhrDataRate);
    builder_field!(max_number_of_measurements, u16);
    builder_field!(sts_length, StsLength);
    builder_field!(session_key, SessionKey, Some);
    builder_field!(data_repetition_count, u8);
    builder_field!(rx_data_max_packets_to_store, usize);
    builder_field!(filter_type, FilterType);
    builder_field!(reference_time_base, ReferenceTimeBase, Some);
    builder_field!(hybrid_phase_list, Vec<HybridPhase>);

    pub fn build(self) -> Option<FiraAppConfigParams> {
        let device_mac_address = match self.device_mac_address {
            Some(addr) => addr,
            None => {
                error!("device_mac_address is not set");
                return None;
            }
        };
        if self.dst_mac_address_list.is_empty() {
            error!("dst_mac_address_list is empty");
            return None;
        }
        if self.mac_address_mode == MacAddressMode::MacAddress2Bytes {
            let all_short = std::iter::once(&device_mac_address)
                .chain(self.dst_mac_address_list.iter())
                .all(|addr| matches!(addr, UwbAddress::Short(_)));
            if !all_short {
                error!("extended address used with 2-byte mac address mode");
                return None;
            }
        }
        if !(1..=100).contains(&self.session_priority) {
            error!("session_priority {} out of range", self.session_priority);
            return None;
        }
        if self.range_data_ntf_proximity_near_cm > self.range_data_ntf_proximity_far_cm {
            error!("proximity near bound above far bound");
            return None;
        }
        if !(9..=12).contains(&self.preamble_code_index)
            && !(25..=32).contains(&self.preamble_code_index)
        {
            error!("preamble_code_index {} invalid", self.preamble_code_index);
            return None;
        }
        if matches!(
            self.sts_config,
            StsConfig::Provisioned | StsConfig::ProvisionedForControleeIndividualKey
        ) && self.session_key.is_none()
        {
            error!("provisioned STS requires a session key");
            return None;
        }

        Some(FiraAppConfigParams {
            device_type: self.device_type,
            device_role: self.device_role,
            ranging_round_usage: self.ranging_round_usage,
            multi_node_mode: self.multi_node_mode,
            sts_config: self.sts_config,
            channel_number: self.channel_number,
            device_mac_address,
            dst_mac_address_list: self.dst_mac_address_list,
            slot_duration_rstu: self.slot_duration_rstu,
            ranging_interval_ms: self.ranging_interval_ms,
            mac_fcs_type: self.mac_fcs_type,
            ranging_round_control: self.ranging_round_control,
            aoa_result_request: self.aoa_result_request,
            range_data_ntf_config: self.range_data_ntf_config,
            range_data_ntf_proximity_near_cm: self.range_data_ntf_proximity_near_cm,
            range_data_ntf_proximity_far_cm: self.range_data_ntf_proximity_far_cm,
            rframe_config: self.rframe_config,
            preamble_code_index: self.preamble_code_index,
            sfd_id: self.sfd_id,
            psdu_data_rate: self.psdu_data_rate,
            preamble_duration: self.preamble_duration,
            ranging_time_struct: self.ranging_time_struct,
            slots_per_rr: self.slots_per_rr,
            tx_adaptive_payload_power: self.tx_adaptive_payload_power,
            prf_mode: self.prf_mode,
            scheduled_mode: self.scheduled_mode,
            key_rotation: self.key_rotation,
            key_rotation_rate: self.key_rotation_rate,
            session_priority: self.session_priority,
            mac_address_mode: self.mac_address_mode,
            vendor_id: self.vendor_id,
            static_sts_iv: self.static_sts_iv,
            number_of_sts_segments: self.number_of_sts_segments,
            max_rr_retry: self.max_rr_retry,
            initiation_time_ms: self.initiation_time_ms,
            absolute_initiation_time_us: self.absolute_initiation_time_us,
            hopping_mode: self.hopping_mode,
            block_stride_length: self.block_stride_length,
            result_report_config: self.result_report_config,
            in_band_termination_attempt_count: self.in_band_termination_attempt_count,
            sub_session_id: self.sub_session_id,
            bprf_phr_data_rate: self.bprf_phr_data_rate,
            max_number_of_measurements: self.max_number_of_measurements,
            sts_length: self.sts_length,
            session_key: self.session_key,
            data_repetition_count: self.data_repetition_count,
            rx_data_max_packets_to_store: self.rx_data_max_packets_to_store,
            filter_type: self.filter_type,
            reference_time_base: self.reference_time_base,
            hybrid_phase_list: self.hybrid_phase_list,
        })
    }

    /// Start a builder from existing params, for the reconfigure paths.
    pub fn from_params(params: &FiraAppConfigParams) -> Self {
        let params = params.clone();
        Self {
            device_type: params.device_type,
            device_role: params.device_role,
            ranging_round_usage: params.ranging_round_usage,
            multi_node_mode: params.multi_node_mode,
            sts_config: params.sts_config,
            channel_number: params.channel_number,
            device_mac_address: Some(params.device_mac_address),
            dst_mac_address_list: params.dst_mac_address_list,
            slot_duration_rstu: params.slot_duration_rstu,
            ranging_interval_ms: params.ranging_interval_ms,
            mac_fcs_type: params.mac_fcs_type,
            ranging_round_control: params.ranging_round_control,
            aoa_result_request: params.aoa_result_request,
            range_data_ntf_config: params.range_data_ntf_config,
            range_data_ntf_proximity_near_cm: params.range_data_ntf_proximity_near_cm,
            range_data_ntf_proximity_far_cm: params.range_data_ntf_proximity_far_cm,
            rframe_config: params.rframe_config,
            preamble_code_index: params.preamble_code_index,
            sfd_id: params.sfd_id,
            psdu_data_rate: params.psdu_data_rate,
            preamble_duration: params.preamble_duration,
            ranging_time_struct: params.ranging_time_struct,
            slots_per_rr: params.slots_per_rr,
            tx_adaptive_payload_power: params.tx_adaptive_payload_power,
            prf_mode: params.prf_mode,
            scheduled_mode: params.scheduled_mode,
            key_rotation: params.key_rotation,
            key_rotation_rate: params.key_rotation_rate,
            session_priority: params.session_priority,
            mac_address_mode: params.mac_address_mode,
            vendor_id: params.vendor_id,
            static_sts_iv: params.static_sts_iv,
            number_of_sts_segments: params.number_of_sts_segments,
            max_rr_retry: params.max_rr_retry,
            initiation_time_ms: params.initiation_time_ms,
            absolute_initiation_time_us: params.absolute_initiation_time_us,
            hopping_mode: params.hopping_mode,
            block_stride_length: params.block_stride_length,
            result_report_config: params.result_report_config,
            in_band_termination_attempt_count: params.in_band_termination_attempt_count,
            sub_session_id: params.sub_session_id,
            bprf_phr_data_rate: params.bprf_phr_data_rate,
            max_number_of_measurements: params.max_number_of_measurements,
            sts_length: params.sts_length,
            session_key: params.session_key,
            data_repetition_count: params.data_repetition_count,
            rx_data_max_packets_to_store: params.rx_data_max_packets_to_store,
            filter_type: params.filter_type,
            reference_time_base: params.reference_time_base,
            hybrid_phase_list: params.hybrid_phase_list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_builder() -> FiraAppConfigParamsBuilder {
        FiraAppConfigParamsBuilder::new()
            .device_mac_address(UwbAddress::Short([0x01, 0x02]))
            .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
    }

    #[test]
    fn test_build_ok_and_tlv_contents() {
        let params = minimal_builder().build().unwrap();
        let map = params.generate_config_map();
        assert_eq!(map.get(&AppConfigTlvType::DeviceType), Some(&vec![1]));
        assert_eq!(map.get(&AppConfigTlvType::NoOfControlee), Some(&vec![1]));
        assert_eq!(map.get(&AppConfigTlvType::DstMacAddress), Some(&vec![0xAA, 0x01]));
        assert_eq!(
            map.get(&AppConfigTlvType::RangingDuration),
            Some(&200u32.to_le_bytes().to_vec())
        );
        assert_eq!(map.get(&AppConfigTlvType::SessionPriority), Some(&vec![50]));
        // Relative initiation time encodes as 4 bytes, absolute as 8.
        assert_eq!(map.get(&AppConfigTlvType::UwbInitiationTime).unwrap().len(), 4);
    }

    #[test]
    fn test_absolute_initiation_time_encoding() {
        let params = minimal_builder().absolute_initiation_time_us(1_000_000).build().unwrap();
        let map = params.generate_config_map();
        assert_eq!(
            map.get(&AppConfigTlvType::UwbInitiationTime),
            Some(&1_000_000u64.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn test_build_rejects_missing_device_address() {
        assert!(FiraAppConfigParamsBuilder::new()
            .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
            .build()
            .is_none());
    }

    #[test]
    fn test_build_rejects_mixed_address_modes() {
        assert!(minimal_builder()
            .dst_mac_address_list(vec![UwbAddress::Extended([0; 8])])
            .build()
            .is_none());
    }

    #[test]
    fn test_build_rejects_bad_proximity_bounds() {
        assert!(minimal_builder()
            .range_data_ntf_proximity_near_cm(100)
            .range_data_ntf_proximity_far_cm(50)
            .build()
            .is_none());
    }

    #[test]
    fn test_build_rejects_provisioned_sts_without_key() {
        assert!(minimal_builder()
            .sts_config(StsConfig::ProvisionedForControleeIndividualKey)
            .build()
            .is_none());
    }

    #[test]
    fn test_updated_config_map_contains_only_changes() {
        let prev = minimal_builder().build().unwrap();
        let updated = FiraAppConfigParamsBuilder::from_params(&prev)
            .ranging_interval_ms(400)
            .build()
            .unwrap();
        let diff = updated.generate_updated_config_map(&prev);
        assert_eq!(diff.len(), 1);
        assert_eq!(
            diff.get(&AppConfigTlvType::RangingDuration),
            Some(&400u32.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn test_session_time_base_tlv_requires_resolved_token() {
        let unresolved = minimal_builder()
            .reference_time_base(ReferenceTimeBase {
                reference_session_handle: SessionHandle(7),
                resolved_session_token: None,
                session_offset_ms: 50,
            })
            .build()
            .unwrap();
        assert!(!unresolved
            .generate_config_map()
            .contains_key(&AppConfigTlvType::SessionTimeBase));

        let mut resolved = unresolved;
        resolved.reference_time_base_mut().unwrap().resolved_session_token = Some(0xDEAD);
        let v = resolved.generate_config_map().get(&AppConfigTlvType::SessionTimeBase).cloned();
        let v = v.unwrap();
        assert_eq!(v[0], 0x01);
        assert_eq!(&v[1..5], &0xDEADu32.to_le_bytes());
        assert_eq!(&v[5..9], &50u32.to_le_bytes());
    }

    #[test]
    fn test_range_data_ntf_override_tlvs() {
        let params = minimal_builder()
            .range_data_ntf_config(RangeDataNtfConfig::EnableProximityLevelTrig)
            .range_data_ntf_proximity_near_cm(50)
            .range_data_ntf_proximity_far_cm(500)
            .build()
            .unwrap();
        let disabled = params.range_data_ntf_override_tlvs(false);
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].v, vec![RangeDataNtfConfig::Disable as u8]);
        let enabled = params.range_data_ntf_override_tlvs(true);
        assert_eq!(enabled.len(), 3);
        assert_eq!(enabled[0].v, vec![RangeDataNtfConfig::EnableProximityLevelTrig as u8]);
        assert_eq!(enabled[1].v, 50u16.to_le_bytes().to_vec());
        assert_eq!(enabled[2].v, 500u16.to_le_bytes().to_vec());
    }
}
