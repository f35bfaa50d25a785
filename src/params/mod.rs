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

//! The application parameters of a UWB session, one variant per protocol.

pub mod aliro_app_config_params;
pub mod ccc_app_config_params;
pub mod fira_app_config_params;
pub mod radar_app_config_params;
pub mod uci_packets;

use std::collections::HashMap;

use crate::params::uci_packets::{AppConfigTlv, AppConfigTlvType, SessionType};

/// The session protocol; drives parameter interpretation and the default
/// priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Fira,
    Ccc,
    Aliro,
    Radar,
}

/// The parameters of the UWB session.
#[derive(Debug, Clone, PartialEq)]
pub enum AppConfigParams {
    Fira(fira_app_config_params::FiraAppConfigParams),
    Ccc(ccc_app_config_params::CccAppConfigParams),
    Aliro(aliro_app_config_params::AliroAppConfigParams),
    Radar(radar_app_config_params::RadarAppConfigParams),
}

impl AppConfigParams {
    /// Generate the TLV list from the params.
    pub fn generate_tlvs(&self) -> Vec<AppConfigTlv> {
        Self::config_map_to_tlvs(self.generate_config_map())
    }

    /// Generate the updated TLV list from the difference between this and the
    /// previous params.
    pub fn generate_updated_tlvs(&self, prev_params: &Self) -> Vec<AppConfigTlv> {
        Self::config_map_to_tlvs(self.generate_updated_config_map(prev_params))
    }

    fn config_map_to_tlvs(config_map: HashMap<AppConfigTlvType, Vec<u8>>) -> Vec<AppConfigTlv> {
        let mut tlvs: Vec<AppConfigTlv> =
            config_map.into_iter().map(|(cfg_id, v)| AppConfigTlv { cfg_id, v }).collect();
        // The map iteration order is unstable; keep the command deterministic.
        tlvs.sort_by_key(|tlv| tlv.cfg_id);
        tlvs
    }

    fn generate_config_map(&self) -> HashMap<AppConfigTlvType, Vec<u8>> {
        match self {
            Self::Fira(params) => params.generate_config_map(),
            Self::Ccc(params) => params.generate_config_map(),
            Self::Aliro(params) => params.generate_config_map(),
            Self::Radar(params) => params.generate_config_map(),
        }
    }

    fn generate_updated_config_map(
        &self,
        prev_params: &Self,
    ) -> HashMap<AppConfigTlvType, Vec<u8>> {
        match (self, prev_params) {
            (Self::Fira(params), Self::Fira(prev_params)) => {
                params.generate_updated_config_map(prev_params)
            }
            (Self::Ccc(params), Self::Ccc(prev_params)) => {
                params.generate_updated_config_map(prev_params)
            }
            (Self::Aliro(params), Self::Aliro(prev_params)) => {
                params.generate_updated_config_map(prev_params)
            }
            _ => HashMap::new(),
        }
    }

    pub fn is_type_matched(&self, session_type: SessionType) -> bool {
        match self {
            Self::Fira(_) => matches!(
                session_type,
                SessionType::FiraRangingSession
                    | SessionType::FiraRangingAndInBandDataSession
                    | SessionType::FiraDataTransferSession
                    | SessionType::FiraRangingOnlyPhase
                    | SessionType::FiraInBandDataPhase
                    | SessionType::FiraRangingWithDataPhase
            ),
            Self::Ccc(_) => session_type == SessionType::Ccc,
            Self::Aliro(_) => session_type == SessionType::Aliro,
            Self::Radar(_) => session_type == SessionType::Radar,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Fira(_) => Protocol::Fira,
            Self::Ccc(_) => Protocol::Ccc,
            Self::Aliro(_) => Protocol::Aliro,
            Self::Radar(_) => Protocol::Radar,
        }
    }

    pub fn fira(&self) -> Option<&fira_app_config_params::FiraAppConfigParams> {
        match self {
            Self::Fira(params) => Some(params),
            _ => None,
        }
    }

    pub fn fira_mut(&mut self) -> Option<&mut fira_app_config_params::FiraAppConfigParams> {
        match self {
            Self::Fira(params) => Some(params),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::fira_app_config_params::FiraAppConfigParamsBuilder;
    use crate::params::uci_packets::UwbAddress;

    #[test]
    fn test_generated_tlvs_are_sorted() {
        let params = FiraAppConfigParamsBuilder::new()
            .device_mac_address(UwbAddress::Short([0x01, 0x02]))
            .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
            .build()
            .unwrap();
        let tlvs = AppConfigParams::Fira(params).generate_tlvs();
        assert!(!tlvs.is_empty());
        assert!(tlvs.windows(2).all(|w| w[0].cfg_id < w[1].cfg_id));
    }

    #[test]
    fn test_updated_tlvs_cross_protocol_is_empty() {
        let fira = AppConfigParams::Fira(
            FiraAppConfigParamsBuilder::new()
                .device_mac_address(UwbAddress::Short([0x01, 0x02]))
                .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
                .build()
                .unwrap(),
        );
        let ccc = AppConfigParams::Ccc(
            crate::params::ccc_app_config_params::CccAppConfigParamsBuilder::new()
                .build()
                .unwrap(),
        );
        assert!(fira.generate_updated_tlvs(&ccc).is_empty());
    }

    #[test]
    fn test_type_matching() {
        let ccc = AppConfigParams::Ccc(
            crate::params::ccc_app_config_params::CccAppConfigParamsBuilder::new()
                .build()
                .unwrap(),
        );
        assert!(ccc.is_type_matched(SessionType::Ccc));
        assert!(!ccc.is_type_matched(SessionType::FiraRangingSession));
        assert_eq!(ccc.protocol(), Protocol::Ccc);
    }
}
