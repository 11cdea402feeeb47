use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::action_code::ActionCode;
use crate::completion::Completion;
use crate::error::SessionError;
use crate::frame::FrameHeaders;
use crate::session::Session;

/// Why a send operation left its session's send buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseReason {
    AckReceived,
    SendCanceled,
    NotStarted,
}

/// The outbound session's unacknowledged send operations, keyed by sequence number. Sequence
///  numbers are assigned on insertion, which happens under the session lock, so they are gap
///  free across concurrent senders.
pub(crate) struct SendBuffer {
    next_sequence_number: u64,
    window_size: u32,
    operations: BTreeMap<u64, SendOperation>,
    closed: bool,
}

impl SendBuffer {
    pub fn new() -> SendBuffer {
        SendBuffer {
            next_sequence_number: 0,
            window_size: 1,
            operations: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn set_window_size(&mut self, window_size: u32) {
        self.window_size = window_size.max(1);
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Returns the assigned sequence number, or `None` if the buffer does not accept messages
    ///  any more
    pub fn insert(&mut self, op: &SendOperation) -> Option<u64> {
        if self.closed {
            return None;
        }
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.operations.insert(sequence_number, op.clone());
        Some(sequence_number)
    }

    pub fn remove(&mut self, sequence_number: u64) -> Option<SendOperation> {
        self.operations.remove(&sequence_number)
    }

    pub fn remove_if_same(&mut self, sequence_number: u64, op: &SendOperation) -> bool {
        match self.operations.get(&sequence_number) {
            Some(registered) if registered.is_same(op) => {
                self.operations.remove(&sequence_number);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, sequence_number: u64) -> Option<SendOperation> {
        self.operations.get(&sequence_number).cloned()
    }

    fn low_water_mark(&self) -> u64 {
        self.operations.keys().next()
            .cloned()
            .unwrap_or(self.next_sequence_number)
    }

    pub fn is_in_window(&self, sequence_number: u64) -> bool {
        sequence_number < self.low_water_mark() + self.window_size as u64
    }

    /// The operations inside the window that were never transmitted, e.g. because the window
    ///  was full when they were started
    pub fn untransmitted_in_window(&self) -> Vec<SendOperation> {
        let low = self.low_water_mark();
        self.operations.range(low..low + self.window_size as u64)
            .map(|(_, op)| op)
            .filter(|op| op.attempts() == 0)
            .cloned()
            .collect()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_drained(&self) -> bool {
        self.closed && self.operations.is_empty()
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn take_all(&mut self) -> Vec<SendOperation> {
        self.closed = true;
        std::mem::take(&mut self.operations)
            .into_values()
            .collect()
    }
}

#[derive(Default)]
struct SendBookkeeping {
    attempts: u32,
    last_send_result: Option<Result<(), SessionError>>,
    last_attempt: Option<Instant>,
    retry_task: Option<JoinHandle<()>>,
}

struct SendOperationInner {
    session: Weak<Session>,
    sequence_number: OnceLock<u64>,
    frame: OnceLock<Bytes>,
    retry_interval: Duration,
    failed_retry_interval: Duration,
    /// wakes the retry task early after a 'pool exceeded' nack
    resend: Arc<Notify>,
    bookkeeping: Mutex<SendBookkeeping>,
    completion: Completion<Result<(), SessionError>>,
}

/// Delivers one application message inside an open outbound session. The message is re-sent
///  until it is acknowledged, without a retry limit; only cancelling (or the session going
///  away) stops it.
///
/// The operation completes when it is released from the session's send buffer, and whoever
///  removes it from the buffer releases it.
#[derive(Clone)]
pub struct SendOperation(Arc<SendOperationInner>);

impl SendOperation {
    pub(crate) fn start(session: &Arc<Session>, payload: &[u8]) -> Result<SendOperation, SessionError> {
        let headers = FrameHeaders::new(session.session_id(), 0, ActionCode::SendMessage);
        let frame_buf = headers.alloc_frame(payload.len())?;

        let op = SendOperation(Arc::new(SendOperationInner {
            session: Arc::downgrade(session),
            sequence_number: OnceLock::new(),
            frame: OnceLock::new(),
            retry_interval: session.config().send_retry_interval,
            failed_retry_interval: session.config().failed_send_retry_interval,
            resend: Arc::new(Notify::new()),
            bookkeeping: Default::default(),
            completion: Completion::new(),
        }));

        let sequence_number = match session.insert_into_send_buffer(&op) {
            Ok(sequence_number) => sequence_number,
            Err(SessionError::InvalidState) => {
                debug!("{:?} does not accept messages: send operation not started", session);
                op.release(EraseReason::NotStarted);
                return Err(SessionError::InvalidState);
            }
            Err(e) => return Err(e),
        };
        let _ = op.0.sequence_number.set(sequence_number);

        let headers = FrameHeaders::new(session.session_id(), sequence_number, ActionCode::SendMessage);
        let _ = op.0.frame.set(headers.write_frame(frame_buf, payload));
        trace!("{:?} inserted into send buffer", op);

        op.spawn_retry_task();
        Ok(op)
    }

    pub fn sequence_number(&self) -> Option<u64> {
        self.0.sequence_number.get().cloned()
    }

    pub fn attempts(&self) -> u32 {
        self.0.bookkeeping.lock().unwrap().attempts
    }

    pub fn is_completed(&self) -> bool {
        self.0.completion.is_completed()
    }

    pub async fn wait(&self) -> Result<(), SessionError> {
        self.0.completion.wait().await
    }

    pub(crate) fn is_same(&self, other: &SendOperation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Completes with [SessionError::OperationCanceled] unless the operation completed already
    pub fn cancel(&self) {
        let Some(sequence_number) = self.sequence_number() else {
            return;
        };
        match self.0.session.upgrade() {
            Some(session) => {
                if session.remove_from_send_buffer(sequence_number, self) {
                    self.release(EraseReason::SendCanceled);
                }
            }
            None => {
                self.stop_retry_task();
                self.0.completion.try_complete(Err(SessionError::OperationCanceled));
            }
        }
    }

    /// Called exactly once per operation, by the code path that removed it from the send buffer
    pub(crate) fn release(&self, reason: EraseReason) {
        let result = match reason {
            EraseReason::AckReceived => Ok(()),
            EraseReason::SendCanceled => Err(SessionError::OperationCanceled),
            EraseReason::NotStarted => Err(SessionError::InvalidState),
        };
        trace!("{:?} released: {:?}", self, reason);

        self.stop_retry_task();
        self.0.completion.complete(result, "send operation");
    }

    /// A 'pool exceeded' nack: the peer dropped the message, so it is re-sent after the
    ///  failed send interval instead of waiting for the full retry interval
    pub(crate) fn mark_send_failed(&self) {
        self.0.bookkeeping.lock().unwrap().last_send_result = Some(Err(SessionError::QuotaExceeded));
        self.0.resend.notify_one();
    }

    fn is_send_due(&self, now: Instant) -> bool {
        let bookkeeping = self.0.bookkeeping.lock().unwrap();
        match (&bookkeeping.last_attempt, &bookkeeping.last_send_result) {
            (None, _) => true,
            (_, Some(Err(_))) => true,
            (Some(last_attempt), _) => now.duration_since(*last_attempt) >= self.0.retry_interval,
        }
    }

    /// How long the retry task sleeps before its next check. Operations that were never
    ///  transmitted are outside the window, and acks advancing the window send them.
    fn next_attempt_delay(&self, now: Instant) -> Duration {
        let bookkeeping = self.0.bookkeeping.lock().unwrap();
        match (&bookkeeping.last_attempt, &bookkeeping.last_send_result) {
            (None, _) => self.0.retry_interval,
            (_, Some(Err(_))) => self.0.failed_retry_interval,
            (Some(last_attempt), _) => (*last_attempt + self.0.retry_interval).saturating_duration_since(now),
        }
    }

    pub(crate) async fn try_send_message(&self, now: Instant) {
        if self.is_completed() {
            return;
        }
        let (Some(frame), Some(&sequence_number)) = (self.0.frame.get(), self.0.sequence_number.get()) else {
            return;
        };
        let Some(session) = self.0.session.upgrade() else {
            return;
        };
        if !self.is_send_due(now) || !session.is_in_send_window(sequence_number) {
            return;
        }

        let result = session.send_frame(frame.clone()).await;

        let mut bookkeeping = self.0.bookkeeping.lock().unwrap();
        bookkeeping.attempts += 1;
        bookkeeping.last_attempt = Some(now);
        trace!("{:?}: send attempt #{}: {:?}", self, bookkeeping.attempts, result);
        bookkeeping.last_send_result = Some(result);
    }

    fn stop_retry_task(&self) {
        if let Some(handle) = self.0.bookkeeping.lock().unwrap().retry_task.take() {
            handle.abort();
        }
    }

    fn spawn_retry_task(&self) {
        let mut bookkeeping = self.0.bookkeeping.lock().unwrap();
        if self.is_completed() {
            return;
        }

        let weak = Arc::downgrade(&self.0);
        let resend = self.0.resend.clone();
        let failed_retry_interval = self.0.failed_retry_interval;
        bookkeeping.retry_task = Some(tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let op = SendOperation(inner);
                if op.is_completed() {
                    break;
                }
                op.try_send_message(Instant::now()).await;
                let delay = op.next_attempt_delay(Instant::now());
                drop(op);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = resend.notified() => tokio::time::sleep(failed_retry_interval).await,
                }
            }
        }));
    }
}

impl Debug for SendOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SendOperation{{#{:?}}}", self.0.sequence_number.get())
    }
}
