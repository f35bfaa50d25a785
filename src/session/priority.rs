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

//! The session priority bands used by eviction.

use crate::params::Protocol;

pub const PRIORITY_ALIRO: u8 = 80;
pub const PRIORITY_CCC: u8 = 80;
pub const PRIORITY_SYSTEM_APP: u8 = 70;
pub const PRIORITY_FG_APP: u8 = 60;
pub const PRIORITY_BG_APP: u8 = 40;

/// Compute the stack priority of a session without a caller override.
///
/// Recomputed on foreground/background transitions and right before start.
/// The radar protocol is restricted to privileged callers, so it shares the
/// system-app band.
pub fn compute_stack_priority(
    protocol: Protocol,
    privileged: bool,
    foreground: bool,
    default_priority_override: Option<u8>,
) -> u8 {
    match protocol {
        Protocol::Ccc => PRIORITY_CCC,
        Protocol::Aliro => PRIORITY_ALIRO,
        Protocol::Radar => PRIORITY_SYSTEM_APP,
        Protocol::Fira => {
            if let Some(priority) = default_priority_override {
                return priority;
            }
            if privileged {
                PRIORITY_SYSTEM_APP
            } else if foreground {
                PRIORITY_FG_APP
            } else {
                PRIORITY_BG_APP
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_bands() {
        assert_eq!(compute_stack_priority(Protocol::Ccc, false, false, None), 80);
        assert_eq!(compute_stack_priority(Protocol::Aliro, false, false, None), 80);
        assert_eq!(compute_stack_priority(Protocol::Radar, true, true, None), 70);
    }

    #[test]
    fn test_fira_bands() {
        assert_eq!(compute_stack_priority(Protocol::Fira, true, false, None), 70);
        assert_eq!(compute_stack_priority(Protocol::Fira, false, true, None), 60);
        assert_eq!(compute_stack_priority(Protocol::Fira, false, false, None), 40);
    }

    #[test]
    fn test_fira_default_override_wins() {
        assert_eq!(compute_stack_priority(Protocol::Fira, false, true, Some(55)), 55);
    }
}
