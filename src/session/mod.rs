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

//! The session manager core: table, per-session state machine, event loop,
//! notification routing, admission and app-state tracking.

pub(crate) mod admission;
pub(crate) mod advertise;
pub(crate) mod app_state;
pub mod filtering;
pub mod manager;
pub mod manager_sync;
pub mod priority;
pub(crate) mod router;
pub(crate) mod session;
pub mod table;

pub use self::manager::{
    ChipInfo, DataTransferPhaseConfig, DataTransferPhaseEntry, OpenSessionRequest,
    ReconfigureRequest, SessionManager, SessionManagerConfig, StartRangingParams,
};
pub use self::manager_sync::SessionManagerSync;
pub use self::table::ClosedSessionInfo;
