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

//! The radar session parameters.

use std::collections::HashMap;

use log::error;

use crate::params::fira_app_config_params::{PreambleDuration, PrfMode, RframeConfig, UwbChannel};
use crate::params::uci_packets::AppConfigTlvType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RadarDataType {
    RadarSweepSamples = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitsPerSample {
    Value32 = 0,
    Value48 = 1,
    Value64 = 2,
}

/// The burst/sweep timing block of RADAR_TIMING_PARAMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadarTimingParams {
    pub burst_period_ms: u32,
    pub sweep_period_rstu: u16,
    pub sweeps_per_burst: u8,
}

/// The radar app configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarAppConfigParams {
    pub(crate) timing_params: RadarTimingParams,
    pub(crate) samples_per_sweep: u8,
    pub(crate) channel_number: UwbChannel,
    pub(crate) sweep_offset: i16,
    pub(crate) rframe_config: RframeConfig,
    pub(crate) preamble_duration: PreambleDuration,
    pub(crate) preamble_code_index: u8,
    pub(crate) bits_per_sample: BitsPerSample,
    pub(crate) prf_mode: PrfMode,
    pub(crate) number_of_bursts: u16,
    pub(crate) radar_data_type: RadarDataType,
}

impl RadarAppConfigParams {
    pub(crate) fn generate_config_map(&self) -> HashMap<AppConfigTlvType, Vec<u8>> {
        let mut timing = Vec::with_capacity(7);
        timing.extend_from_slice(&self.timing_params.burst_period_ms.to_le_bytes());
        timing.extend_from_slice(&self.timing_params.sweep_period_rstu.to_le_bytes());
        timing.push(self.timing_params.sweeps_per_burst);
        HashMap::from([
            (AppConfigTlvType::RadarTimingParams, timing),
            (AppConfigTlvType::RadarSamplesPerSweep, vec![self.samples_per_sweep]),
            (AppConfigTlvType::ChannelNumber, vec![self.channel_number as u8]),
            (AppConfigTlvType::RadarSweepOffset, self.sweep_offset.to_le_bytes().to_vec()),
            (AppConfigTlvType::RframeConfig, vec![self.rframe_config as u8]),
            (AppConfigTlvType::PreambleDuration, vec![self.preamble_duration as u8]),
            (AppConfigTlvType::PreambleCodeIndex, vec![self.preamble_code_index]),
            (AppConfigTlvType::RadarBitsPerSample, vec![self.bits_per_sample as u8]),
            (AppConfigTlvType::PrfMode, vec![self.prf_mode as u8]),
            (
                AppConfigTlvType::RadarNumberOfBursts,
                self.number_of_bursts.to_le_bytes().to_vec(),
            ),
            (AppConfigTlvType::RadarDataType, vec![self.radar_data_type as u8]),
        ])
    }
}

/// The builder of RadarAppConfigParams.
pub struct RadarAppConfigParamsBuilder {
    timing_params: RadarTimingParams,
    samples_per_sweep: u8,
    channel_number: UwbChannel,
    sweep_offset: i16,
    rframe_config: RframeConfig,
    preamble_duration: PreambleDuration,
    preamble_code_index: u8,
    bits_per_sample: BitsPerSample,
    prf_mode: PrfMode,
    number_of_bursts: u16,
    radar_data_type: RadarDataType,
}

#[allow(clippy::new_without_default)]
impl RadarAppConfigParamsBuilder {
    pub fn new() -> Self {
        Self {
            timing_params: RadarTimingParams {
                burst_period_ms: 100,
                sweep_period_rstu: 200,
                sweeps_per_burst: 16,
            },
            samples_per_sweep: 64,
            channel_number: UwbChannel::Channel9,
            sweep_offset: 0,
            rframe_config: RframeConfig::SP0,
            preamble_duration: PreambleDuration::T64Symbols,
            preamble_code_index: 10,
            bits_per_sample: BitsPerSample::Value32,
            prf_mode: PrfMode::Bprf,
            number_of_bursts: 0,
            radar_data_type: RadarDataType::RadarSweepSamples,
        }
    }

    builder_field!(timing_params, RadarTimingParams);
    builder_field!(samples_per_sweep, u8);
    builder_field!(channel_number, UwbChannel);
    builder_field!(sweep_offset, i16);
    builder_field!(rframe_config, RframeConfig);
    builder_field!(preamble_duration, PreambleDuration);
    builder_field!(preamble_code_index, u8);
    builder_field!(bits_per_sample, BitsPerSample);
    builder_field!(prf_mode, PrfMode);
    builder_field!(number_of_bursts, u16);
    builder_field!(radar_data_type, RadarDataType);

    pub fn build(self) -> Option<RadarAppConfigParams> {
        if self.samples_per_sweep == 0 {
            error!("samples_per_sweep is zero");
            return None;
        }
        if self.timing_params.sweeps_per_burst == 0 {
            error!("sweeps_per_burst is zero");
            return None;
        }

        Some(RadarAppConfigParams {
            timing_params: self.timing_params,
            samples_per_sweep: self.samples_per_sweep,
            channel_number: self.channel_number,
            sweep_offset: self.sweep_offset,
            rframe_config: self.rframe_config,
            preamble_duration: self.preamble_duration,
            preamble_code_index: self.preamble_code_index,
            bits_per_sample: self.bits_per_sample,
            prf_mode: self.prf_mode,
            number_of_bursts: self.number_of_bursts,
            radar_data_type: self.radar_data_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ok_and_timing_encoding() {
        let params = RadarAppConfigParamsBuilder::new().build().unwrap();
        let map = params.generate_config_map();
        let timing = map.get(&AppConfigTlvType::RadarTimingParams).unwrap();
        assert_eq!(timing.len(), 7);
        assert_eq!(&timing[0..4], &100u32.to_le_bytes());
        assert_eq!(&timing[4..6], &200u16.to_le_bytes());
        assert_eq!(timing[6], 16);
    }

    #[test]
    fn test_build_rejects_zero_samples() {
        assert!(RadarAppConfigParamsBuilder::new().samples_per_sweep(0).build().is_none());
    }
}
