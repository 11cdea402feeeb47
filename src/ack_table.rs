use std::fmt::Debug;

use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::action_code::ActionCode;
use crate::error::SessionError;
use crate::partition::SessionId;

/// Identifies the one outstanding protocol operation a session may have per expected ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub session_id: SessionId,
    pub ack_action: ActionCode,
}
impl AckKey {
    pub fn new(session_id: SessionId, ack_action: ActionCode) -> AckKey {
        AckKey { session_id, ack_action }
    }
}

/// Correlates acks to the protocol operations waiting for them. This is plain data, it lives
///  inside the environment's lock together with the session directory.
pub struct AckTable<W> {
    waiters: FxHashMap<AckKey, W>,
}

impl<W: Debug> AckTable<W> {
    pub fn new() -> AckTable<W> {
        AckTable {
            waiters: FxHashMap::default(),
        }
    }

    /// Registers a waiter. An occupied key is a usage error unless `tolerate_duplicate` is set,
    ///  in which case the new waiter takes the slot and the previous one is returned to the
    ///  caller, which is then responsible for completing it.
    pub fn insert(&mut self, key: AckKey, waiter: W, tolerate_duplicate: bool) -> Result<Option<W>, SessionError> {
        self.waiters.try_reserve(1)
            .map_err(|_| SessionError::OutOfMemory)?;

        if let Some(previous) = self.waiters.get(&key) {
            if !tolerate_duplicate {
                error!("duplicate registration for {:?}: {:?} is still outstanding", key, previous);
                panic!("this is a bug: a session may not have two outstanding operations for {:?}", key);
            }
            trace!("replacing outstanding waiter for {:?}", key);
        }
        Ok(self.waiters.insert(key, waiter))
    }

    pub fn extract(&mut self, key: &AckKey) -> Option<W> {
        self.waiters.remove(key)
    }

    /// Removes the entry for a key only if it is the given waiter, i.e. if it was not
    ///  concurrently extracted or replaced
    pub fn extract_if(&mut self, key: &AckKey, is_same: impl FnOnce(&W) -> bool) -> Option<W> {
        if self.waiters.get(key).map(is_same).unwrap_or(false) {
            self.waiters.remove(key)
        }
        else {
            None
        }
    }

    pub fn contains(&self, key: &AckKey) -> bool {
        self.waiters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn drain(&mut self) -> Vec<W> {
        self.waiters.drain()
            .map(|(_, w)| w)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn key(raw: u128, action: ActionCode) -> AckKey {
        AckKey::new(SessionId::from_raw(raw), action)
    }

    #[test]
    fn test_insert_extract() {
        let mut table = AckTable::new();
        assert_eq!(table.insert(key(1, ActionCode::OpenSessionRequestAck), "a", false), Ok(None));
        assert_eq!(table.insert(key(1, ActionCode::CloseSessionRequestAck), "b", false), Ok(None));
        assert_eq!(table.insert(key(2, ActionCode::OpenSessionRequestAck), "c", false), Ok(None));
        assert_eq!(table.len(), 3);

        assert_eq!(table.extract(&key(1, ActionCode::OpenSessionRequestAck)), Some("a"));
        assert_eq!(table.extract(&key(1, ActionCode::OpenSessionRequestAck)), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic(expected = "two outstanding operations")]
    fn test_duplicate_is_fatal() {
        let mut table = AckTable::new();
        table.insert(key(1, ActionCode::CloseSessionRequestAck), "a", false).unwrap();
        let _ = table.insert(key(1, ActionCode::CloseSessionRequestAck), "b", false);
    }

    #[test]
    fn test_tolerated_duplicate_replaces() {
        let mut table = AckTable::new();
        table.insert(key(1, ActionCode::OpenSessionResponseAck), "a", true).unwrap();
        assert_eq!(table.insert(key(1, ActionCode::OpenSessionResponseAck), "b", true), Ok(Some("a")));
        assert_eq!(table.extract(&key(1, ActionCode::OpenSessionResponseAck)), Some("b"));
    }

    #[rstest]
    #[case::same("a", true)]
    #[case::replaced("b", false)]
    fn test_extract_if(#[case] registered: &'static str, #[case] expected_removed: bool) {
        let mut table = AckTable::new();
        table.insert(key(1, ActionCode::AbortInboundSessionRequestAck), registered, false).unwrap();

        let removed = table.extract_if(&key(1, ActionCode::AbortInboundSessionRequestAck), |w| *w == "a");
        assert_eq!(removed.is_some(), expected_removed);
        assert_eq!(table.contains(&key(1, ActionCode::AbortInboundSessionRequestAck)), !expected_removed);
    }

    #[test]
    fn test_extract_if_missing() {
        let mut table: AckTable<&str> = AckTable::new();
        assert!(table.extract_if(&key(1, ActionCode::OpenSessionRequestAck), |_| true).is_none());
    }
}
