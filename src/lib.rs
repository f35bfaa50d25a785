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

//! Core of the controller-side UWB session service.
//!
//! The crate sits between a platform facade (binder/RPC, permission wrappers,
//! settings) and a UCI transport that talks to the UWB subsystem. It owns the
//! set of live sessions, drives every session through its lifecycle on a
//! serialized event loop, routes asynchronous UCI notifications back into
//! session state, and reports outcomes through the [`sink::NotificationSink`]
//! callbacks.
//!
//! The platform pieces this crate depends on are expressed as traits so the
//! embedder can supply them: [`uci::transport::UciTransport`] for the command
//! path, [`policy::PolicyOracle`] for platform gating, and
//! [`sink::NotificationSink`] for the application-facing callbacks.

#[macro_use]
mod utils;

pub mod error;
pub mod params;
pub mod policy;
pub mod session;
pub mod sink;
pub mod uci;

pub use crate::utils::{Clock, SystemClock};
