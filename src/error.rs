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

//! The error types of the crate.
//!
//! Errors never cross the upward boundary as `Err`: every failure of a
//! session operation is converted to the matching failure callback on the
//! notification sink. `Error` is the internal currency used to get there.

use crate::params::uci_packets::StatusCode;

/// The error type of the crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The provided parameters are invalid, or the request is structurally
    /// malformed (bad address length, mismatched bitmap size, missing field).
    #[error("The parameters are invalid")]
    BadParameters,
    /// The session handle or session id is already in use.
    #[error("The session handle or id is duplicated")]
    DuplicatedSession,
    /// The maximum session count for the protocol is reached and no eviction
    /// was possible.
    #[error("The maximum session count is exceeded")]
    MaxSessionsExceeded,
    /// The operation is not permitted in the session's current state.
    #[error("The operation is rejected in the current session state")]
    InvalidState,
    /// Refused by platform policy (e.g. background ranging disallowed).
    #[error("The operation is refused by platform policy")]
    PolicyRefused,
    /// A required runtime permission check failed.
    #[error("The caller lost a required permission")]
    PermissionDenied,
    /// The expected UCI response or notification did not arrive in time.
    #[error("The UWBS did not respond within the deadline")]
    Timeout,
    /// The UCI transport completed the command with a non-OK status.
    #[error("The UCI transport returned status {0:?}")]
    Transport(StatusCode),
    /// The session (or the whole service) was torn down while the operation
    /// was pending.
    #[error("The session was closed while the operation was pending")]
    Closed,
    /// The unexpected case, not mapped to any of the above.
    #[error("The unknown error")]
    Unknown,
}

impl Error {
    /// Project the error onto the UCI status code reported to the sink.
    ///
    /// Timeouts are surfaced with a synthesized `UciStatusFailed`; the
    /// session state is deliberately left for the next notification to
    /// reconcile.
    pub fn as_status_code(&self) -> StatusCode {
        match self {
            Error::BadParameters => StatusCode::UciStatusInvalidParam,
            Error::DuplicatedSession => StatusCode::UciStatusSessionDuplicate,
            Error::MaxSessionsExceeded => StatusCode::UciStatusMaxSessionsExceeded,
            Error::InvalidState => StatusCode::UciStatusRejected,
            Error::PolicyRefused => StatusCode::UciStatusRejected,
            Error::PermissionDenied => StatusCode::UciStatusRejected,
            Error::Timeout => StatusCode::UciStatusFailed,
            Error::Transport(status) => *status,
            Error::Closed => StatusCode::UciStatusFailed,
            Error::Unknown => StatusCode::UciStatusFailed,
        }
    }
}

/// The result type of the crate.
pub type Result<T> = std::result::Result<T, Error>;
