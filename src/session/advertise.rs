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

//! Advertiser tracking for one-way AoA observers.
//!
//! Buffered payloads of an advertiser are only released once the observer is
//! pointed at it. Pointing is judged over a rolling record of recent AoA
//! measurements per advertiser address.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::params::uci_packets::{OwrAoaRangingMeasurement, StatusCode, UwbAddress};
use crate::utils::Clock;

/// Samples older than this fall out of the pointing window.
const POINTING_WINDOW: Duration = Duration::from_millis(2000);
/// At least this many windowed samples are required before pointing holds.
const MIN_WINDOW_SAMPLES: usize = 2;
/// Every windowed sample must be inside this cone, both axes.
const CRITERIA_ANGLE_DEG: f32 = 10.0;
/// Cap of retained samples per advertiser.
const MAX_SAMPLES: usize = 16;

struct AoaSample {
    azimuth_deg: f32,
    elevation_deg: f32,
    taken_at: Duration,
}

#[derive(Default)]
struct AdvertiseTarget {
    samples: VecDeque<AoaSample>,
}

/// The rolling per-advertiser AoA records of one OWR-AoA session.
pub(crate) struct AdvertiseManager {
    clock: Arc<dyn Clock>,
    targets: HashMap<UwbAddress, AdvertiseTarget>,
}

/// Q9.7 fixed point to degrees.
fn q9_7_to_degrees(raw: i16) -> f32 {
    raw as f32 / 128.0
}

impl AdvertiseManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, targets: HashMap::new() }
    }

    /// Fold one OWR-AoA measurement into the advertiser's rolling record.
    /// Failed measurements carry no usable angles and are ignored.
    pub fn update_advertise_target(&mut self, measurement: &OwrAoaRangingMeasurement) {
        if measurement.status != StatusCode::UciStatusOk {
            return;
        }
        let now = self.clock.now();
        let target = self.targets.entry(measurement.mac_address).or_default();
        target.samples.push_back(AoaSample {
            azimuth_deg: q9_7_to_degrees(measurement.aoa_azimuth),
            elevation_deg: q9_7_to_degrees(measurement.aoa_elevation),
            taken_at: now,
        });
        while target.samples.len() > MAX_SAMPLES {
            target.samples.pop_front();
        }
        while target
            .samples
            .front()
            .map_or(false, |sample| now.saturating_sub(sample.taken_at) > POINTING_WINDOW)
        {
            target.samples.pop_front();
        }
    }

    /// Whether the observer is currently pointed at the advertiser.
    pub fn is_pointed_target(&self, address: &UwbAddress) -> bool {
        let Some(target) = self.targets.get(address) else {
            return false;
        };
        let now = self.clock.now();
        let mut windowed = 0usize;
        for sample in &target.samples {
            if now.saturating_sub(sample.taken_at) > POINTING_WINDOW {
                continue;
            }
            if sample.azimuth_deg.abs() > CRITERIA_ANGLE_DEG
                || sample.elevation_deg.abs() > CRITERIA_ANGLE_DEG
            {
                return false;
            }
            windowed += 1;
        }
        windowed >= MIN_WINDOW_SAMPLES
    }

    pub fn remove_advertise_target(&mut self, address: &UwbAddress) {
        self.targets.remove(address);
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }
}
