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

//! The uid-to-sessions index behind foreground/background tracking.
//!
//! Only sessions owned by a non-privileged app are registered; importance
//! changes of other uids are ignored. The actual reconfiguration and timer
//! work happens on the event loop, which consumes this index.

use std::collections::{HashMap, HashSet};

use crate::params::uci_packets::SessionHandle;

#[derive(Default)]
pub(crate) struct AppStateWatcher {
    uid_sessions: HashMap<i32, HashSet<SessionHandle>>,
}

impl AppStateWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, uid: i32, session_handle: SessionHandle) {
        self.uid_sessions.entry(uid).or_default().insert(session_handle);
    }

    pub fn unregister(&mut self, uid: i32, session_handle: &SessionHandle) {
        if let Some(sessions) = self.uid_sessions.get_mut(&uid) {
            sessions.remove(session_handle);
            if sessions.is_empty() {
                self.uid_sessions.remove(&uid);
            }
        }
    }

    /// The sessions affected by an importance change of the uid.
    pub fn sessions_of(&self, uid: i32) -> Vec<SessionHandle> {
        self.uid_sessions
            .get(&uid)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_watched(&self, uid: i32) -> bool {
        self.uid_sessions.contains_key(&uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister_roundtrip() {
        let mut watcher = AppStateWatcher::new();
        watcher.register(1000, SessionHandle(1));
        watcher.register(1000, SessionHandle(2));
        watcher.register(2000, SessionHandle(3));

        let mut sessions = watcher.sessions_of(1000);
        sessions.sort();
        assert_eq!(sessions, vec![SessionHandle(1), SessionHandle(2)]);
        assert!(watcher.is_watched(2000));
        assert!(!watcher.is_watched(3000));

        watcher.unregister(1000, &SessionHandle(1));
        watcher.unregister(1000, &SessionHandle(2));
        assert!(!watcher.is_watched(1000));
        assert!(watcher.sessions_of(1000).is_empty());
    }
}
