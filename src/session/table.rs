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

//! The process-wide session registry.
//!
//! Mutations happen only on the event loop; the router and diagnostics only
//! look sessions up. Closed sessions leave a bounded trail for dumps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::params::uci_packets::{SessionHandle, SessionId};
use crate::params::Protocol;
use crate::session::session::SessionSlot;
use crate::sink::RangingChangeReason;
use crate::utils::Clock;

const MAX_RECENTLY_CLOSED: usize = 16;

/// A diagnostics record of a closed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSessionInfo {
    pub session_handle: SessionHandle,
    pub session_id: SessionId,
    pub protocol: Protocol,
    pub chip_id: String,
    pub reason: RangingChangeReason,
    /// Monotonic close time, for ordering dumps.
    pub closed_at: Duration,
}

struct TableEntry {
    slot: Arc<SessionSlot>,
    session_id: SessionId,
    protocol: Protocol,
    chip_id: String,
}

/// The map from session handle to live session, with the id index and the
/// recently-closed ring.
pub(crate) struct SessionTable {
    entries: HashMap<SessionHandle, TableEntry>,
    by_id: HashMap<SessionId, SessionHandle>,
    recently_closed: VecDeque<ClosedSessionInfo>,
    clock: Arc<dyn Clock>,
}

impl SessionTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            by_id: HashMap::new(),
            recently_closed: VecDeque::new(),
            clock,
        }
    }

    pub fn insert(
        &mut self,
        session_handle: SessionHandle,
        session_id: SessionId,
        protocol: Protocol,
        chip_id: String,
        slot: Arc<SessionSlot>,
    ) {
        // Duplicates are rejected by admission before we get here.
        assert!(
            !self.entries.contains_key(&session_handle) && !self.by_id.contains_key(&session_id),
            "duplicate session inserted: {} id={}",
            session_handle,
            session_id
        );
        self.by_id.insert(session_id, session_handle);
        self.entries
            .insert(session_handle, TableEntry { slot, session_id, protocol, chip_id });
    }

    pub fn contains_handle(&self, session_handle: &SessionHandle) -> bool {
        self.entries.contains_key(session_handle)
    }

    pub fn contains_id(&self, session_id: SessionId) -> bool {
        self.by_id.contains_key(&session_id)
    }

    pub fn get_by_handle(&self, session_handle: &SessionHandle) -> Option<Arc<SessionSlot>> {
        self.entries.get(session_handle).map(|entry| entry.slot.clone())
    }

    pub fn get_by_id(&self, session_id: SessionId) -> Option<Arc<SessionSlot>> {
        let session_handle = self.by_id.get(&session_id)?;
        match self.entries.get(session_handle) {
            Some(entry) => Some(entry.slot.clone()),
            None => panic!("session id {} indexed but not in table", session_id),
        }
    }

    /// The session id of the handle; `None` for unknown handles.
    pub fn session_id_of(&self, session_handle: &SessionHandle) -> Option<SessionId> {
        self.entries.get(session_handle).map(|entry| entry.session_id)
    }

    pub fn count_by_protocol(&self, protocol: Protocol) -> usize {
        self.entries.values().filter(|entry| entry.protocol == protocol).count()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.entries.keys().copied().collect()
    }

    /// The live session of the protocol with the lowest stack priority.
    pub async fn session_with_lowest_priority(
        &self,
        protocol: Protocol,
    ) -> Option<(SessionHandle, u8)> {
        let mut lowest: Option<(SessionHandle, u8)> = None;
        for (session_handle, entry) in &self.entries {
            if entry.protocol != protocol {
                continue;
            }
            let priority = entry.slot.session.lock().await.stack_priority;
            if lowest.map_or(true, |(_, lowest_priority)| priority < lowest_priority) {
                lowest = Some((*session_handle, priority));
            }
        }
        lowest
    }

    /// Drop the session and append it to the recently-closed ring.
    pub fn remove(&mut self, session_handle: &SessionHandle, reason: RangingChangeReason) {
        let Some(entry) = self.entries.remove(session_handle) else {
            return;
        };
        self.by_id.remove(&entry.session_id);
        if self.recently_closed.len() == MAX_RECENTLY_CLOSED {
            self.recently_closed.pop_front();
        }
        self.recently_closed.push_back(ClosedSessionInfo {
            session_handle: *session_handle,
            session_id: entry.session_id,
            protocol: entry.protocol,
            chip_id: entry.chip_id,
            reason,
            closed_at: self.clock.now(),
        });
    }

    pub fn recently_closed(&self) -> Vec<ClosedSessionInfo> {
        self.recently_closed.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
