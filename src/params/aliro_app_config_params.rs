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

//! The ALIRO session parameters.
//!
//! ALIRO shares the CCC parameter shape; the differences are the protocol
//! version TLV and the config-id value space, so the record is kept separate
//! instead of aliasing the CCC one.

use std::collections::HashMap;

use log::error;

use crate::params::ccc_app_config_params::{CccProtocolVersion, CccPulseShapeCombo, PulseShape};
use crate::params::fira_app_config_params::UwbChannel;
use crate::params::uci_packets::AppConfigTlvType;

/// The ALIRO app configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AliroAppConfigParams {
    pub(crate) protocol_version: CccProtocolVersion,
    pub(crate) uwb_config_id: u16,
    pub(crate) pulse_shape_combo: CccPulseShapeCombo,
    pub(crate) ran_multiplier: u32,
    pub(crate) channel_number: UwbChannel,
    pub(crate) num_responder_nodes: u8,
    pub(crate) slots_per_rr: u8,
    pub(crate) sync_code_index: u8,
    pub(crate) sts_index: u32,
    pub(crate) initiation_time_ms: u64,
    pub(crate) absolute_initiation_time_us: Option<u64>,
}

impl AliroAppConfigParams {
    pub fn ran_multiplier(&self) -> u32 {
        self.ran_multiplier
    }

    pub fn sts_index(&self) -> u32 {
        self.sts_index
    }

    pub fn initiation_time_ms(&self) -> u64 {
        self.initiation_time_ms
    }

    pub fn absolute_initiation_time_us(&self) -> Option<u64> {
        self.absolute_initiation_time_us
    }

    pub(crate) fn set_ran_multiplier(&mut self, ran_multiplier: u32) {
        self.ran_multiplier = ran_multiplier;
    }

    pub(crate) fn set_sts_index(&mut self, sts_index: u32) {
        self.sts_index = sts_index;
    }

    pub(crate) fn set_initiation_time_ms(&mut self, time_ms: u64) {
        self.initiation_time_ms = time_ms;
    }

    pub(crate) fn set_absolute_initiation_time_us(&mut self, time_us: Option<u64>) {
        self.absolute_initiation_time_us = time_us;
    }

    pub(crate) fn generate_config_map(&self) -> HashMap<AppConfigTlvType, Vec<u8>> {
        HashMap::from([
            (
                AppConfigTlvType::CccRangingProtocolVer,
                vec![self.protocol_version.major, self.protocol_version.minor],
            ),
            (AppConfigTlvType::CccUwbConfigId, self.uwb_config_id.to_le_bytes().to_vec()),
            (AppConfigTlvType::CccPulseshapeCombo, vec![self.pulse_shape_combo_byte()]),
            (AppConfigTlvType::CccRanMultiplier, self.ran_multiplier.to_le_bytes().to_vec()),
            (AppConfigTlvType::ChannelNumber, vec![self.channel_number as u8]),
            (AppConfigTlvType::NoOfControlee, vec![self.num_responder_nodes]),
            (AppConfigTlvType::SlotsPerRr, vec![self.slots_per_rr]),
            (AppConfigTlvType::PreambleCodeIndex, vec![self.sync_code_index]),
            (AppConfigTlvType::StsIndex, self.sts_index.to_le_bytes().to_vec()),
            (AppConfigTlvType::UwbInitiationTime, self.initiation_time_tlv()),
        ])
    }

    fn pulse_shape_combo_byte(&self) -> u8 {
        ((self.pulse_shape_combo.initiator_tx as u8) << 4)
            | (self.pulse_shape_combo.responder_tx as u8)
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

/// The builder of AliroAppConfigParams.
pub struct AliroAppConfigParamsBuilder {
    protocol_version: CccProtocolVersion,
    uwb_config_id: u16,
    pulse_shape_combo: CccPulseShapeCombo,
    ran_multiplier: u32,
    channel_number: UwbChannel,
    num_responder_nodes: u8,
    slots_per_rr: u8,
    sync_code_index: u8,
    sts_index: u32,
    initiation_time_ms: u64,
    absolute_initiation_time_us: Option<u64>,
}

#[allow(clippy::new_without_default)]
impl AliroAppConfigParamsBuilder {
    pub fn new() -> Self {
        Self {
            protocol_version: CccProtocolVersion { major: 1, minor: 0 },
            uwb_config_id: 0,
            pulse_shape_combo: CccPulseShapeCombo {
                initiator_tx: PulseShape::SymmetricalRootRaisedCosine,
                responder_tx: PulseShape::SymmetricalRootRaisedCosine,
            },
            ran_multiplier: 1,
            channel_number: UwbChannel::Channel9,
            num_responder_nodes: 1,
            slots_per_rr: 24,
            sync_code_index: 1,
            sts_index: 0,
            initiation_time_ms: 0,
            absolute_initiation_time_us: None,
        }
    }

    builder_field!(protocol_version, CccProtocolVersion);
    builder_field!(uwb_config_id, u16);
    builder_field!(pulse_shape_combo, CccPulseShapeCombo);
    builder_field!(ran_multiplier, u32);
    builder_field!(channel_number, UwbChannel);
    builder_field!(num_responder_nodes, u8);
    builder_field!(slots_per_rr, u8);
    builder_field!(sync_code_index, u8);
    builder_field!(sts_index, u32);
    builder_field!(initiation_time_ms, u64);
    builder_field!(absolute_initiation_time_us, u64, Some);

    pub fn build(self) -> Option<AliroAppConfigParams> {
        if !(1..=32).contains(&self.sync_code_index) {
            error!("sync_code_index {} out of range", self.sync_code_index);
            return None;
        }
        if self.num_responder_nodes == 0 {
            error!("num_responder_nodes is zero");
            return None;
        }

        Some(AliroAppConfigParams {
            protocol_version: self.protocol_version,
            uwb_config_id: self.uwb_config_id,
            pulse_shape_combo: self.pulse_shape_combo,
            ran_multiplier: self.ran_multiplier,
            channel_number: self.channel_number,
            num_responder_nodes: self.num_responder_nodes,
            slots_per_rr: self.slots_per_rr,
            sync_code_index: self.sync_code_index,
            sts_index: self.sts_index,
            initiation_time_ms: self.initiation_time_ms,
            absolute_initiation_time_us: self.absolute_initiation_time_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ok_and_tlv_contents() {
        let params = AliroAppConfigParamsBuilder::new().ran_multiplier(2).build().unwrap();
        let map = params.generate_config_map();
        assert_eq!(
            map.get(&AppConfigTlvType::CccRanMultiplier),
            Some(&2u32.to_le_bytes().to_vec())
        );
        assert!(map.contains_key(&AppConfigTlvType::UwbInitiationTime));
    }

    #[test]
    fn test_updated_config_map_contains_only_changes() {
        let prev = AliroAppConfigParamsBuilder::new().build().unwrap();
        let mut updated = prev.clone();
        updated.set_sts_index(3);
        let diff = updated.generate_updated_config_map(&prev);
        assert_eq!(diff.len(), 1);
        assert!(diff.contains_key(&AppConfigTlvType::StsIndex));
    }
}
