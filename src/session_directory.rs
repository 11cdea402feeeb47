use rustc_hash::FxHashMap;

use crate::action_code::ActionCode;
use crate::partition::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// created by an open request from a peer, receives content
    Inbound,
    /// opened locally, sends content
    Outbound,
}

/// The inbound and outbound sessions of an environment, plus the outbound sessions that are
///  waiting for a peer's open or close response. Like the ack table this lives inside the
///  environment's lock.
pub struct SessionDirectory<S> {
    inbound: FxHashMap<SessionId, S>,
    outbound: FxHashMap<SessionId, S>,
    response_waiters: FxHashMap<(SessionId, ActionCode), S>,
}

impl<S: Clone> SessionDirectory<S> {
    pub fn new() -> SessionDirectory<S> {
        SessionDirectory {
            inbound: FxHashMap::default(),
            outbound: FxHashMap::default(),
            response_waiters: FxHashMap::default(),
        }
    }

    fn map(&self, kind: SessionKind) -> &FxHashMap<SessionId, S> {
        match kind {
            SessionKind::Inbound => &self.inbound,
            SessionKind::Outbound => &self.outbound,
        }
    }

    fn map_mut(&mut self, kind: SessionKind) -> &mut FxHashMap<SessionId, S> {
        match kind {
            SessionKind::Inbound => &mut self.inbound,
            SessionKind::Outbound => &mut self.outbound,
        }
    }

    pub fn get(&self, kind: SessionKind, session_id: SessionId) -> Option<S> {
        self.map(kind).get(&session_id).cloned()
    }

    /// Returns the already registered session instead if there is one
    pub fn insert(&mut self, kind: SessionKind, session_id: SessionId, session: S) -> Result<(), S> {
        let map = self.map_mut(kind);
        if let Some(existing) = map.get(&session_id) {
            return Err(existing.clone());
        }
        map.insert(session_id, session);
        Ok(())
    }

    pub fn remove(&mut self, kind: SessionKind, session_id: SessionId) -> Option<S> {
        self.map_mut(kind).remove(&session_id)
    }

    pub fn len(&self, kind: SessionKind) -> usize {
        self.map(kind).len()
    }

    pub fn insert_response_waiter(&mut self, session_id: SessionId, response: ActionCode, session: S) {
        self.response_waiters.insert((session_id, response), session);
    }

    pub fn take_response_waiter(&mut self, session_id: SessionId, response: ActionCode) -> Option<S> {
        self.response_waiters.remove(&(session_id, response))
    }

    /// An outbound session is reachable by its peer's abort request both while it is open and
    ///  while it waits for the open response
    pub fn find_outbound(&self, session_id: SessionId) -> Option<S> {
        self.outbound.get(&session_id)
            .or_else(|| self.response_waiters.get(&(session_id, ActionCode::OpenSessionResponse)))
            .or_else(|| self.response_waiters.get(&(session_id, ActionCode::CloseSessionResponse)))
            .cloned()
    }

    /// Removes every trace of a session, returning whether anything was removed
    pub fn remove_all(&mut self, kind: SessionKind, session_id: SessionId) -> bool {
        let mut removed = self.remove(kind, session_id).is_some();
        if kind == SessionKind::Outbound {
            removed |= self.take_response_waiter(session_id, ActionCode::OpenSessionResponse).is_some();
            removed |= self.take_response_waiter(session_id, ActionCode::CloseSessionResponse).is_some();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
        self.response_waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(raw: u128) -> SessionId {
        SessionId::from_raw(raw)
    }

    #[rstest]
    #[case::inbound(SessionKind::Inbound, SessionKind::Outbound)]
    #[case::outbound(SessionKind::Outbound, SessionKind::Inbound)]
    fn test_roles_are_separate(#[case] kind: SessionKind, #[case] other: SessionKind) {
        let mut directory = SessionDirectory::new();
        assert_eq!(directory.insert(kind, id(1), "a"), Ok(()));
        assert_eq!(directory.insert(kind, id(1), "b"), Err("a"));
        assert_eq!(directory.insert(other, id(1), "c"), Ok(()));

        assert_eq!(directory.get(kind, id(1)), Some("a"));
        assert_eq!(directory.get(other, id(1)), Some("c"));
        assert_eq!(directory.len(kind), 1);

        assert_eq!(directory.remove(kind, id(1)), Some("a"));
        assert_eq!(directory.get(kind, id(1)), None);
        assert_eq!(directory.get(other, id(1)), Some("c"));
    }

    #[rstest]
    #[case::open_pending(ActionCode::OpenSessionResponse)]
    #[case::close_pending(ActionCode::CloseSessionResponse)]
    fn test_find_outbound_includes_response_waiters(#[case] response: ActionCode) {
        let mut directory = SessionDirectory::new();
        directory.insert_response_waiter(id(3), response, "w");
        assert_eq!(directory.find_outbound(id(3)), Some("w"));
        assert_eq!(directory.get(SessionKind::Outbound, id(3)), None);

        assert!(directory.remove_all(SessionKind::Outbound, id(3)));
        assert_eq!(directory.find_outbound(id(3)), None);
        assert!(!directory.remove_all(SessionKind::Outbound, id(3)));
    }

    #[test]
    fn test_take_response_waiter_once() {
        let mut directory = SessionDirectory::new();
        directory.insert_response_waiter(id(1), ActionCode::OpenSessionResponse, "w");
        assert_eq!(directory.take_response_waiter(id(1), ActionCode::CloseSessionResponse), None);
        assert_eq!(directory.take_response_waiter(id(1), ActionCode::OpenSessionResponse), Some("w"));
        assert_eq!(directory.take_response_waiter(id(1), ActionCode::OpenSessionResponse), None);
    }
}
