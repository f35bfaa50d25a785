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

//! Shared helpers: the consuming-builder field macro and the monotonic clock
//! seam used by the advertise window and the recently-closed records.

use std::time::{Duration, Instant};

/// Generate the setter methods for the builder.
///
/// The generated methods take the field value and return the builder itself,
/// so that the caller can chain the setters.
macro_rules! builder_field {
    ($field:ident, $ty:ty) => {
        /// Set the $field field.
        pub fn $field(mut self, value: $ty) -> Self {
            self.$field = value;
            self
        }
    };
    ($field:ident, $ty:ty, $wrap:expr) => {
        /// Set the $field field.
        pub fn $field(mut self, value: $ty) -> Self {
            self.$field = $wrap(value);
            self
        }
    };
}

/// A monotonic time source.
///
/// Session timers run on the tokio clock; this seam only covers the places
/// where a timestamp is recorded and compared later (advertise sample
/// windows, recently-closed diagnostics).
pub trait Clock: 'static + Send + Sync {
    /// Monotonic time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// The [`Clock`] backed by `std::time::Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_fake_clock_advances() {
        let clock = testing::FakeClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Duration::from_millis(250));
    }
}
