//! Registry of live sessions keyed by session id.
//!
//! The directory lives inside the bridge task, so it is a plain map with no
//! locking: every insert, lookup and removal is serialized through that task.

use std::collections::{BTreeMap, HashMap};

use super::session::{Session, SessionInfo};
use super::{BridgeError, SessionId};

#[derive(Default)]
pub struct SessionDirectory {
    sessions: HashMap<SessionId, Session>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Ids are random UUIDs, but a collision is still refused
    /// rather than silently replacing a live session.
    pub fn insert(&mut self, session: Session) -> Result<(), (BridgeError, Session)> {
        if self.sessions.contains_key(session.id()) {
            return Err((BridgeError::DuplicateId(session.id().to_string()), session));
        }
        self.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// The live session for `id`. Closed sessions are never returned.
    pub fn lookup(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id).filter(|s| !s.is_closed())
    }

    pub fn lookup_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id).filter(|s| !s.is_closed())
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Diagnostic view: id → who/where, without any live handles.
    pub fn snapshot(&self) -> BTreeMap<SessionId, SessionInfo> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(id, s)| (id.clone(), s.info()))
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::session::{Endpoint, NewSession};
    use crate::bridge::testing::{settings, FakeChannel, FakeReactor};

    fn session(id: &str) -> Session {
        let (channel, _) = FakeChannel::new();
        Session::with_id(
            id.to_string(),
            NewSession::new(Box::new(channel), Endpoint::new("10.0.0.5", 22)).username("root"),
            &settings(),
        )
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut dir = SessionDirectory::new();
        dir.insert(session("a")).map_err(|(e, _)| e).unwrap();
        assert!(dir.lookup("a").is_some());
        assert!(dir.lookup("b").is_none());
        assert!(dir.remove("a").is_some());
        assert!(dir.remove("a").is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_duplicate_id_is_refused_and_returned() {
        let mut dir = SessionDirectory::new();
        dir.insert(session("a")).map_err(|(e, _)| e).unwrap();
        let (err, rejected) = dir.insert(session("a")).unwrap_err();
        assert_eq!(err, BridgeError::DuplicateId("a".to_string()));
        assert_eq!(rejected.id(), "a");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_closed_sessions_are_invisible() {
        let mut dir = SessionDirectory::new();
        dir.insert(session("a")).map_err(|(e, _)| e).unwrap();
        let mut reactor = FakeReactor::default();
        dir.lookup_mut("a").unwrap().close("test", &mut reactor);
        assert!(dir.lookup("a").is_none());
        assert!(dir.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_has_creation_args_only() {
        let mut dir = SessionDirectory::new();
        dir.insert(session("a")).map_err(|(e, _)| e).unwrap();
        let snap = dir.snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["a"]["host"], "10.0.0.5");
        assert_eq!(json["a"]["port"], 22);
        assert_eq!(json["a"]["username"], "root");
        assert_eq!(json["a"]["attached"], false);
        assert!(json["a"].get("password").is_none());
    }
}
