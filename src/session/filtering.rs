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

//! Seams to the AoA post-processing stack.
//!
//! The filter engines and pose sources themselves live outside this crate;
//! the session core only tracks their lifetimes: an engine per controlee,
//! closed on removal, and one shared default pose source reference-counted
//! across the FiRa sessions that use default filtering.

use crate::params::uci_packets::UwbAddress;

/// A per-controlee AoA filter engine.
pub trait FilterEngine: Send {
    /// Release the engine's resources. Called exactly once, when the
    /// controlee is removed or its session closes.
    fn close(&mut self);
}

/// Creates a filter engine for a controlee address, or `None` when filtering
/// is unavailable for it.
pub type FilterEngineFactory =
    Box<dyn Fn(&UwbAddress) -> Option<Box<dyn FilterEngine>> + Send + Sync>;

/// The shared default pose source.
///
/// `start` is called when the first interested session opens, `stop` when
/// the last one closes.
pub trait PoseSource: Send + Sync {
    fn start(&self);
    fn stop(&self);
}
