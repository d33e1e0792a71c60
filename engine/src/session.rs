//! Process-wide session table. Sessions refer to their DCBs by id within
//! the owning worker; the table itself only records where a session
//! lives, so routers and diagnostics can enumerate sessions without
//! touching worker-owned state.
//!
//! Reads vastly outnumber writes (a write per connect and disconnect), so
//! the table sits behind a many-readers/one-writer lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::dcb::DcbId;

/// Session state as visible outside the owning worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    /// Worker that owns every DCB of this session.
    pub worker_id: usize,
    /// The client-side DCB, by id within the owning worker.
    pub client_dcb: DcbId,
    /// Backend DCBs currently attached to the session.
    pub backend_dcbs: Vec<DcbId>,
    pub remote: String,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, SessionInfo>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new session and return its id.
    pub fn add(&self, worker_id: usize, client_dcb: DcbId, remote: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = SessionInfo {
            id,
            worker_id,
            client_dcb,
            backend_dcbs: Vec::new(),
            remote,
        };

        self.sessions.write().unwrap().insert(id, info);
        id
    }

    pub fn remove(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.write().unwrap().remove(&id)
    }

    pub fn attach_backend(&self, id: u64, dcb: DcbId) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(&id) {
            Some(info) => {
                if !info.backend_dcbs.contains(&dcb) {
                    info.backend_dcbs.push(dcb);
                }
                true
            }
            None => false,
        }
    }

    pub fn detach_backend(&self, id: u64, dcb: DcbId) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(&id) {
            Some(info) => {
                info.backend_dcbs.retain(|d| *d != dcb);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Snapshot of every session, for diagnostics.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Sessions owned by one worker, e.g. for draining it.
    pub fn by_worker(&self, worker_id: usize) -> Vec<u64> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|info| info.worker_id == worker_id)
            .map(|info| info.id)
            .collect()
    }
}
