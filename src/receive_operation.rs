use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{trace, warn};

use crate::completion::Completion;
use crate::error::SessionError;
use crate::message_pool::PooledMessage;
use crate::session::Session;

pub(crate) enum QueuedEntry {
    Message(PooledMessage),
    /// marks the end of the stream after the peer closed its side of the session
    CloseSentinel,
}

/// A queued entry matched with the receive operation that gets it. Deliveries are collected
///  under the session lock and executed after releasing it.
pub(crate) struct Delivery {
    pub receiver: ReceiveOperation,
    pub entry: QueuedEntry,
}
impl Delivery {
    pub fn execute(self, session: &Arc<Session>) {
        self.receiver.deliver(self.entry, session);
    }
}

pub(crate) enum ContentOutcome {
    Accepted(Vec<Delivery>),
    Duplicate,
}

/// The inbound session's undelivered messages. Content is queued in sequence number order:
///  messages arriving ahead of a gap are held back until the gap is filled, and messages that
///  were seen before are recognized as duplicates.
pub(crate) struct InboundQueue {
    next_expected: u64,
    held: BTreeMap<u64, PooledMessage>,
    entries: VecDeque<QueuedEntry>,
    receivers: VecDeque<ReceiveOperation>,
    closed: bool,
}

impl InboundQueue {
    pub fn new() -> InboundQueue {
        InboundQueue {
            next_expected: 0,
            held: BTreeMap::new(),
            entries: VecDeque::new(),
            receivers: VecDeque::new(),
            closed: false,
        }
    }

    pub fn is_duplicate(&self, sequence_number: u64) -> bool {
        sequence_number < self.next_expected || self.held.contains_key(&sequence_number)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn insert(&mut self, sequence_number: u64, message: PooledMessage) -> ContentOutcome {
        if self.is_duplicate(sequence_number) {
            return ContentOutcome::Duplicate;
        }
        if sequence_number > self.next_expected {
            trace!("holding #{} until #{} arrives", sequence_number, self.next_expected);
            self.held.insert(sequence_number, message);
            return ContentOutcome::Accepted(Vec::new());
        }

        self.entries.push_back(QueuedEntry::Message(message));
        self.next_expected += 1;
        while let Some(message) = self.held.remove(&self.next_expected) {
            self.entries.push_back(QueuedEntry::Message(message));
            self.next_expected += 1;
        }
        ContentOutcome::Accepted(self.match_receivers())
    }

    /// Stops accepting content and appends the close sentinel
    pub fn close(&mut self, close_sequence_number: u64) -> Vec<Delivery> {
        if close_sequence_number != self.next_expected || !self.held.is_empty() {
            warn!("closing inbound queue at #{} with #{} expected next and {} messages held back", close_sequence_number, self.next_expected, self.held.len());
        }
        self.closed = true;
        self.entries.push_back(QueuedEntry::CloseSentinel);
        self.match_receivers()
    }

    fn match_receivers(&mut self) -> Vec<Delivery> {
        let mut result = Vec::new();
        while !self.receivers.is_empty() && !self.entries.is_empty() {
            if let (Some(receiver), Some(entry)) = (self.receivers.pop_front(), self.entries.pop_front()) {
                result.push(Delivery { receiver, entry });
            }
        }
        result
    }

    pub fn try_dequeue(&mut self) -> Option<QueuedEntry> {
        self.entries.pop_front()
    }

    pub fn num_receivers(&self) -> usize {
        self.receivers.len()
    }

    pub fn register(&mut self, receiver: ReceiveOperation) {
        self.receivers.push_back(receiver);
    }

    pub fn unregister(&mut self, receiver: &ReceiveOperation) -> bool {
        let len_before = self.receivers.len();
        self.receivers.retain(|r| !r.is_same(receiver));
        self.receivers.len() != len_before
    }

    /// Removes the receivers that are still waiting after the close sentinel was dequeued
    pub fn take_receivers(&mut self) -> Vec<ReceiveOperation> {
        self.receivers.drain(..).collect()
    }

    /// Empties the queue on abort. The returned entries hold pooled objects, dropping them
    ///  returns the objects to the pool.
    pub fn take_all(&mut self) -> (Vec<ReceiveOperation>, Vec<QueuedEntry>) {
        self.closed = true;
        let mut entries: Vec<QueuedEntry> = self.entries.drain(..).collect();
        entries.extend(std::mem::take(&mut self.held).into_values().map(QueuedEntry::Message));
        (self.receivers.drain(..).collect(), entries)
    }
}

struct ReceiveOperationInner {
    session: Weak<Session>,
    completion: Completion<Result<Bytes, SessionError>>,
}

/// Hands the next in-order message of an inbound session to a consumer
#[derive(Clone)]
pub struct ReceiveOperation(Arc<ReceiveOperationInner>);

impl ReceiveOperation {
    pub(crate) fn new(session: &Arc<Session>) -> ReceiveOperation {
        ReceiveOperation(Arc::new(ReceiveOperationInner {
            session: Arc::downgrade(session),
            completion: Completion::new(),
        }))
    }

    pub(crate) fn is_same(&self, other: &ReceiveOperation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_completed(&self) -> bool {
        self.0.completion.is_completed()
    }

    pub async fn wait(&self) -> Result<Bytes, SessionError> {
        self.0.completion.wait().await
    }

    pub(crate) fn fail(&self, error: SessionError) {
        self.0.completion.complete(Err(error), "receive operation");
    }

    pub(crate) fn deliver(&self, entry: QueuedEntry, session: &Arc<Session>) {
        match entry {
            QueuedEntry::Message(message) => {
                trace!("delivering {:?}", message);
                // this returns the pooled object before the consumer sees the payload
                let payload = message.into_payload();
                self.0.completion.complete(Ok(payload), "receive operation");
            }
            QueuedEntry::CloseSentinel => {
                trace!("{:?}: close sentinel dequeued", session);
                session.continue_close_inbound();
                self.fail(SessionError::ObjectClosed);
            }
        }
    }

    /// Completes with [SessionError::OperationCanceled] unless a message was delivered already
    pub fn cancel(&self) {
        match self.0.session.upgrade() {
            Some(session) => {
                if session.unregister_receiver(self) {
                    self.fail(SessionError::OperationCanceled);
                }
            }
            None => {
                self.0.completion.try_complete(Err(SessionError::OperationCanceled));
            }
        }
    }
}

impl Debug for ReceiveOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReceiveOperation{{completed: {}}}", self.is_completed())
    }
}
