use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Metadata describing one client session in the data transmission phase.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub export: String,
    pub size: u64,
}

/// A registry of active sessions keyed by the client's address.
///
/// Sessions never read each other's entries; the registry only exists so that
/// an administrator can list who is connected. Entries are added when a
/// session enters transmission and removed when it ends.
#[derive(Clone, Debug, Default)]
pub struct Sessions {
    active: Arc<Mutex<HashMap<SocketAddr, SessionInfo>>>,
}

impl Sessions {
    /// Returns a snapshot of all active sessions ordered by peer address.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|session| session.peer);
        sessions
    }

    /// Returns the number of active sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Reports whether no sessions are active.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registers `info` until the returned guard is dropped.
    pub(crate) fn register(&self, info: SessionInfo) -> SessionGuard {
        let peer = info.peer;
        self.lock().insert(peer, info);

        SessionGuard {
            sessions: self.clone(),
            peer,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, SessionInfo>> {
        // The map is always left consistent, so a panic elsewhere while the
        // lock was held does not invalidate it.
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a session from its registry when dropped, however the session
/// ends.
pub(crate) struct SessionGuard {
    sessions: Sessions,
    peer: SocketAddr,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(port: u16, export: &str) -> SessionInfo {
        SessionInfo {
            peer: SocketAddr::from(([127, 0, 0, 1], port)),
            export: export.to_string(),
            size: 4096,
        }
    }

    #[test]
    fn register_and_drop() {
        let sessions = Sessions::default();
        assert!(sessions.is_empty());

        let b = sessions.register(info(2000, "b.iso"));
        let a = sessions.register(info(1000, "a.iso"));

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.list(), vec![info(1000, "a.iso"), info(2000, "b.iso")]);

        drop(a);
        assert_eq!(sessions.list(), vec![info(2000, "b.iso")]);

        drop(b);
        assert!(sessions.is_empty());
    }
}
