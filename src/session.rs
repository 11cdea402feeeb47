use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::action_code::ActionCode;
use crate::completion::Completion;
use crate::config::ReliableMessagingConfig;
use crate::environment::Environment;
use crate::error::{ResultCode, SessionError};
use crate::frame::{FrameHeaders, SessionParameters};
use crate::message_pool::MessagePool;
use crate::partition::{PartitionId, SendTarget, SessionId};
use crate::protocol_operation::ProtocolOperation;
use crate::receive_operation::{ContentOutcome, Delivery, InboundQueue, ReceiveOperation};
use crate::send_operation::{EraseReason, SendBuffer, SendOperation};
use crate::session_directory::SessionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    OpenPending,
    Open,
    ClosePending,
    Closed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// local open call, or an open request from the peer
    OpenStarted,
    /// success response from the peer, or the session manager accepted an inbound session
    OpenSucceeded,
    OpenFailed,
    /// local close call, or a close request from the peer
    CloseStarted,
    CloseCompleted,
    Abort,
}

impl SessionState {
    /// The lifecycle transition function. `None` means that the signal is ignored in this state.
    pub fn on_signal(self, signal: SessionSignal) -> Option<SessionState> {
        use SessionState::*;
        use SessionSignal::*;

        match (self, signal) {
            (Created, OpenStarted) => Some(OpenPending),
            (OpenPending, OpenSucceeded) => Some(Open),
            (OpenPending, OpenFailed) => Some(Aborted),
            (Open, CloseStarted) => Some(ClosePending),
            (ClosePending, CloseCompleted) => Some(Closed),
            (Closed | Aborted, Abort) => None,
            (_, Abort) => Some(Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }
}

struct SessionInner {
    state: SessionState,
    send_buffer: SendBuffer,
    inbound_queue: InboundQueue,
    open_request: Option<ProtocolOperation>,
    close_request: Option<ProtocolOperation>,
    open_result: Option<ResultCode>,
}

impl SessionInner {
    fn apply(&mut self, signal: SessionSignal, session_id: SessionId) -> bool {
        match self.state.on_signal(signal) {
            Some(new_state) => {
                debug!("{:?}: {:?} -> {:?} on {:?}", session_id, self.state, new_state, signal);
                self.state = new_state;
                true
            }
            None => {
                trace!("{:?}: ignoring {:?} in state {:?}", session_id, signal, self.state);
                false
            }
        }
    }
}

/// One end of a session: outbound sessions send application messages, inbound sessions
///  receive them.
pub struct Session {
    session_id: SessionId,
    kind: SessionKind,
    source: PartitionId,
    target: PartitionId,
    /// the target for outbound sessions, the source for inbound sessions
    partner: SendTarget,
    env: Arc<Environment>,
    inbound_pool: MessagePool,
    inner: Mutex<SessionInner>,
    send_buffer_drained: Completion<()>,
    open_completion: Completion<Result<(), SessionError>>,
    close_completion: Completion<Result<(), SessionError>>,
}

impl Session {
    pub(crate) fn new(env: &Arc<Environment>, session_id: SessionId, kind: SessionKind, source: PartitionId, target: PartitionId, partner: SendTarget) -> Arc<Session> {
        let pool_capacity = match kind {
            SessionKind::Inbound => env.config.inbound_message_quota,
            SessionKind::Outbound => 0,
        };

        Arc::new(Session {
            session_id,
            kind,
            source,
            target,
            partner,
            env: env.clone(),
            inbound_pool: MessagePool::new("inbound session", pool_capacity),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                send_buffer: SendBuffer::new(),
                inbound_queue: InboundQueue::new(),
                open_request: None,
                close_request: None,
                open_result: None,
            }),
            send_buffer_drained: Completion::new(),
            open_completion: Completion::new(),
            close_completion: Completion::new(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn source(&self) -> &PartitionId {
        &self.source
    }

    pub fn target(&self) -> &PartitionId {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    #[cfg(test)]
    pub(crate) fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub(crate) fn config(&self) -> &ReliableMessagingConfig {
        &self.env.config
    }

    pub(crate) fn inbound_pool_in_use(&self) -> usize {
        self.inbound_pool.in_use()
    }

    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<(), SessionError> {
        self.env.send_frame(self.partner, frame).await
    }

    fn protocol_headers(&self, action: ActionCode, sequence_number: u64) -> FrameHeaders {
        FrameHeaders::new(self.session_id, sequence_number, action)
    }

    //-------------------------------------------- sending

    /// Sends a message and waits until the peer acknowledged it
    pub async fn send(self: &Arc<Self>, payload: &[u8]) -> Result<(), SessionError> {
        self.start_send(payload)?
            .wait().await
    }

    pub fn start_send(self: &Arc<Self>, payload: &[u8]) -> Result<SendOperation, SessionError> {
        if self.kind != SessionKind::Outbound {
            return Err(SessionError::InvalidState);
        }
        SendOperation::start(self, payload)
    }

    pub(crate) fn insert_into_send_buffer(&self, op: &SendOperation) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Open {
            return Err(SessionError::InvalidState);
        }
        if inner.send_buffer.len() >= self.env.config.send_operation_quota {
            return Err(SessionError::QuotaExceeded);
        }
        inner.send_buffer.insert(op)
            .ok_or(SessionError::InvalidState)
    }

    pub(crate) fn remove_from_send_buffer(&self, sequence_number: u64, op: &SendOperation) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.send_buffer.remove_if_same(sequence_number, op);
        if removed && inner.send_buffer.is_drained() {
            self.send_buffer_drained.try_complete(());
        }
        removed
    }

    pub(crate) fn is_in_send_window(&self, sequence_number: u64) -> bool {
        self.inner.lock().unwrap().send_buffer.is_in_window(sequence_number)
    }

    /// Processes a `SendMessageAck` from the peer
    pub(crate) async fn on_message_ack(self: &Arc<Self>, sequence_number: u64, result: ResultCode) {
        match result {
            ResultCode::Success => {
                let (acked, now_in_window) = {
                    let mut inner = self.inner.lock().unwrap();
                    let acked = inner.send_buffer.remove(sequence_number);
                    if inner.send_buffer.is_drained() {
                        self.send_buffer_drained.try_complete(());
                    }
                    (acked, inner.send_buffer.untransmitted_in_window())
                };

                match acked {
                    Some(op) => op.release(EraseReason::AckReceived),
                    None => trace!("{:?}: duplicate ack for #{}", self, sequence_number),
                }

                let now = Instant::now();
                for op in now_in_window {
                    op.try_send_message(now).await;
                }
            }
            ResultCode::PoolExceeded => {
                trace!("{:?}: peer dropped #{} for lack of buffers", self, sequence_number);
                let op = self.inner.lock().unwrap().send_buffer.get(sequence_number);
                if let Some(op) = op {
                    op.mark_send_failed();
                }
            }
            other => {
                if self.inner.lock().unwrap().send_buffer.get(sequence_number).is_none() {
                    trace!("{:?}: stale nack for #{} with {:?}, ignoring", self, sequence_number, other);
                    return;
                }
                info!("{:?}: peer nacked #{} with {:?}, aborting session", self, sequence_number, other);
                self.abort_locally();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_send_window(&self, window_size: u32) {
        self.inner.lock().unwrap().send_buffer.set_window_size(window_size);
    }

    //-------------------------------------------- receiving

    /// Waits for the next message
    pub async fn receive(self: &Arc<Self>) -> Result<Bytes, SessionError> {
        self.start_receive(true)
            .wait().await
    }

    /// With `wait_for_message == false`, the returned operation is completed immediately, with
    ///  [SessionError::QueueEmpty] if there is no message
    pub fn start_receive(self: &Arc<Self>, wait_for_message: bool) -> ReceiveOperation {
        let op = ReceiveOperation::new(self);

        let dequeued = {
            let mut inner = self.inner.lock().unwrap();
            match (self.kind, inner.state) {
                (SessionKind::Inbound, SessionState::Open | SessionState::ClosePending) => {
                    match inner.inbound_queue.try_dequeue() {
                        Some(entry) => Ok(Some(entry)),
                        None if !wait_for_message => Err(SessionError::QueueEmpty),
                        None if inner.inbound_queue.num_receivers() >= self.env.config.receive_operation_quota => Err(SessionError::QuotaExceeded),
                        None => {
                            inner.inbound_queue.register(op.clone());
                            Ok(None)
                        }
                    }
                }
                (SessionKind::Inbound, SessionState::Closed) => Err(SessionError::ObjectClosed),
                (SessionKind::Inbound, SessionState::Aborted) => Err(SessionError::OperationCanceled),
                _ => Err(SessionError::InvalidState),
            }
        };

        match dequeued {
            Ok(Some(entry)) => op.deliver(entry, self),
            Ok(None) => {}
            Err(e) => op.fail(e),
        }
        op
    }

    pub(crate) fn unregister_receiver(&self, op: &ReceiveOperation) -> bool {
        self.inner.lock().unwrap().inbound_queue.unregister(op)
    }

    /// Processes a `SendMessage` frame, returning the result to acknowledge it with
    pub(crate) fn on_content(self: &Arc<Self>, headers: FrameHeaders, sender: SendTarget, payload: &[u8]) -> ResultCode {
        let sequence_number = headers.sequence_number();

        let deliveries: Vec<Delivery> = {
            let mut inner = self.inner.lock().unwrap();
            // a late retransmission of a delivered message is acked even while closing
            if inner.inbound_queue.is_duplicate(sequence_number) {
                trace!("{:?}: duplicate #{}", self, sequence_number);
                return ResultCode::Success;
            }
            if inner.state != SessionState::Open || inner.inbound_queue.is_closed() {
                return ResultCode::InvalidState;
            }
            let Some(message) = self.inbound_pool.acquire(headers, sender, payload) else {
                return ResultCode::PoolExceeded;
            };
            match inner.inbound_queue.insert(sequence_number, message) {
                ContentOutcome::Accepted(deliveries) => deliveries,
                ContentOutcome::Duplicate => return ResultCode::Success,
            }
        };

        for delivery in deliveries {
            delivery.execute(self);
        }
        ResultCode::Success
    }

    //-------------------------------------------- opening

    /// Runs the outbound open handshake
    pub(crate) async fn open_outbound(self: &Arc<Self>) -> Result<(), SessionError> {
        if !self.inner.lock().unwrap().apply(SessionSignal::OpenStarted, self.session_id) {
            return Err(SessionError::InvalidState);
        }

        self.env.with_tables(|t| t.sessions.insert_response_waiter(self.session_id, ActionCode::OpenSessionResponse, self.clone()));

        let frame = self.protocol_headers(ActionCode::OpenSessionRequest, 0)
            .with_routing(self.source.clone(), self.target.clone())
            .ser_frame(&[]);
        let started = match frame {
            Ok(frame) => ProtocolOperation::start(&self.env, ActionCode::OpenSessionRequest, ActionCode::OpenSessionRequestAck, self.session_id, frame, self.partner, self.env.config.open_max_retries).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(op) => {
                self.inner.lock().unwrap().open_request = Some(op.clone());
                self.abort_if_failed(op);
            }
            Err(e) => {
                warn!("{:?}: could not start open request: {}", self, e);
                self.env.with_tables(|t| t.sessions.take_response_waiter(self.session_id, ActionCode::OpenSessionResponse));
                self.inner.lock().unwrap().apply(SessionSignal::OpenFailed, self.session_id);
                self.open_completion.try_complete(Err(e));
            }
        }

        self.open_completion.wait().await
    }

    /// A protocol operation running out of retries means that the peer is unreachable
    fn abort_if_failed(self: &Arc<Self>, op: ProtocolOperation) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(SessionError::OperationFailed) = op.wait().await {
                info!("{:?}: {:?} failed, aborting session", session, op.action());
                session.abort_locally_with(SessionError::OperationFailed);
            }
        });
    }

    /// Processes the peer's `OpenSessionResponse`, after the response waiter was extracted
    pub(crate) fn on_open_response(self: &Arc<Self>, result: ResultCode, params: Option<SessionParameters>) {
        let open_request = self.inner.lock().unwrap().open_request.take();
        if let Some(op) = open_request {
            // the response implies the request arrived, even if its ack did not
            op.cancel();
        }

        match result.into_result() {
            Ok(()) => {
                // the directory entry is made under the session lock, so a concurrent abort
                //  either sees the session open and removes the entry, or prevents the transition
                let mut inner = self.inner.lock().unwrap();
                if !inner.apply(SessionSignal::OpenSucceeded, self.session_id) {
                    return;
                }
                let window_size = match params {
                    Some(params) => params.window_size.min(self.env.config.max_send_window),
                    None => {
                        warn!("{:?}: open response without session parameters, using a window of 1", self);
                        1
                    }
                };
                inner.send_buffer.set_window_size(window_size);

                if let Err(existing) = self.env.with_tables(|t| t.sessions.insert(SessionKind::Outbound, self.session_id, self.clone())) {
                    panic!("this is a bug: {:?} is already in the outbound directory", existing);
                }
                drop(inner);
                info!("{:?} opened", self);
                self.open_completion.try_complete(Ok(()));
            }
            Err(e) => {
                info!("{:?}: peer refused to open session: {}", self, e);
                self.inner.lock().unwrap().apply(SessionSignal::OpenFailed, self.session_id);
                self.open_completion.try_complete(Err(e));
            }
        }
    }

    /// Creates an inbound session for a peer's open request and asks the session manager about
    ///  it. The returned session is registered in the inbound directory unless an inbound
    ///  session with that id exists already, in which case that one is returned instead.
    pub(crate) async fn start_open_inbound(env: &Arc<Environment>, session_id: SessionId, source: PartitionId, target: PartitionId, partner: SendTarget) -> Arc<Session> {
        let session = Session::new(env, session_id, SessionKind::Inbound, source.clone(), target.clone(), partner);
        session.inner.lock().unwrap().apply(SessionSignal::OpenStarted, session_id);

        if let Err(existing) = env.with_tables(|t| t.sessions.insert(SessionKind::Inbound, session_id, session.clone())) {
            debug!("{:?}: repeated open request", existing);
            existing.resend_open_response().await;
            return existing;
        }

        let decision = env.session_manager.request_inbound_session_open(target, source, partner, session.clone()).await;
        session.complete_open_inbound(decision).await;
        session
    }

    async fn complete_open_inbound(self: &Arc<Self>, decision: Result<(), SessionError>) {
        let result = match decision {
            Ok(()) => {
                if !self.inner.lock().unwrap().apply(SessionSignal::OpenSucceeded, self.session_id) {
                    // aborted while the session manager was deciding
                    return;
                }
                info!("{:?} accepted", self);
                ResultCode::Success
            }
            Err(e) => {
                info!("{:?} rejected: {}", self, e);
                self.inner.lock().unwrap().apply(SessionSignal::OpenFailed, self.session_id);
                self.env.with_tables(|t| t.sessions.remove(SessionKind::Inbound, self.session_id));
                ResultCode::Rejected
            }
        };

        self.inner.lock().unwrap().open_result = Some(result);
        self.send_open_response(result).await;
    }

    async fn resend_open_response(self: &Arc<Self>) {
        let open_result = self.inner.lock().unwrap().open_result;
        match open_result {
            Some(result) => self.send_open_response(result).await,
            None => trace!("{:?}: open decision is pending, response will follow", self),
        }
    }

    async fn send_open_response(self: &Arc<Self>, result: ResultCode) {
        let mut headers = self.protocol_headers(ActionCode::OpenSessionResponse, 0)
            .with_routing(self.source.clone(), self.target.clone())
            .with_result(result);
        if result == ResultCode::Success {
            headers = headers.with_params(SessionParameters { window_size: self.inbound_pool.capacity() as u32 });
        }
        self.start_one_shot_operation(ActionCode::OpenSessionResponse, headers, self.env.config.response_max_retries).await;
    }

    /// Starts a protocol operation whose outcome nobody waits for
    async fn start_one_shot_operation(&self, action: ActionCode, headers: FrameHeaders, max_retries: Option<u32>) {
        let Some(expected_ack) = action.ack_code() else {
            return;
        };
        let started = match headers.ser_frame(&[]) {
            Ok(frame) => ProtocolOperation::start(&self.env, action, expected_ack, self.session_id, frame, self.partner, max_retries).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(op) => {
                tokio::spawn(async move {
                    let result = op.wait().await;
                    trace!("{:?} finished: {:?}", op, result);
                });
            }
            Err(e) => warn!("{:?}: could not start {:?}: {}", self, action, e),
        }
    }

    //-------------------------------------------- closing

    /// Closes an outbound session gracefully: all messages sent so far are delivered before
    ///  the close handshake starts. The result is the peer's close response.
    pub async fn close(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.kind != SessionKind::Outbound {
            return Err(SessionError::InvalidState);
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.apply(SessionSignal::CloseStarted, self.session_id) {
                return Err(SessionError::InvalidState);
            }
            inner.send_buffer.close();
            if inner.send_buffer.is_drained() {
                self.send_buffer_drained.try_complete(());
            }
        }

        debug!("{:?}: waiting for send buffer to drain", self);
        self.send_buffer_drained.wait().await;

        let close_sequence_number = {
            let inner = self.inner.lock().unwrap();
            (inner.state == SessionState::ClosePending).then(|| inner.send_buffer.next_sequence_number())
        };
        let Some(close_sequence_number) = close_sequence_number else {
            // aborted while draining
            return self.close_completion.wait().await;
        };

        self.env.with_tables(|t| t.sessions.insert_response_waiter(self.session_id, ActionCode::CloseSessionResponse, self.clone()));

        let started = match self.protocol_headers(ActionCode::CloseSessionRequest, close_sequence_number).ser_frame(&[]) {
            Ok(frame) => ProtocolOperation::start(&self.env, ActionCode::CloseSessionRequest, ActionCode::CloseSessionRequestAck, self.session_id, frame, self.partner, self.env.config.close_max_retries).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(op) => {
                self.inner.lock().unwrap().close_request = Some(op.clone());
                self.abort_if_failed(op);
            }
            Err(e) => {
                warn!("{:?}: could not start close request: {}", self, e);
                self.abort_locally_with(e);
            }
        }

        self.close_completion.wait().await
    }

    /// Processes the peer's `CloseSessionResponse`, after the response waiter was extracted
    pub(crate) fn on_close_response(self: &Arc<Self>, result: ResultCode) {
        let close_request = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.apply(SessionSignal::CloseCompleted, self.session_id) {
                return;
            }
            inner.close_request.take()
        };
        if let Some(op) = close_request {
            op.cancel();
        }
        self.env.with_tables(|t| t.sessions.remove(SessionKind::Outbound, self.session_id));

        let result = match result {
            // the peer has no session any more, which is what closing is about
            ResultCode::SessionNotFound => Ok(()),
            other => other.into_result(),
        };
        info!("{:?} closed: {:?}", self, result);
        self.close_completion.try_complete(result);
    }

    /// Processes the peer's `CloseSessionRequest`: no more content is accepted, and the close
    ///  sentinel is queued behind the messages that were not consumed yet
    pub(crate) fn on_close_request(self: &Arc<Self>, close_sequence_number: u64) {
        let deliveries = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.apply(SessionSignal::CloseStarted, self.session_id) {
                return;
            }
            inner.inbound_queue.close(close_sequence_number)
        };

        for delivery in deliveries {
            delivery.execute(self);
        }
    }

    /// Called when a receive operation dequeued the close sentinel
    pub(crate) fn continue_close_inbound(self: &Arc<Self>) {
        let waiting_receivers = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.apply(SessionSignal::CloseCompleted, self.session_id) {
                return;
            }
            inner.inbound_queue.take_receivers()
        };
        self.env.with_tables(|t| t.sessions.remove(SessionKind::Inbound, self.session_id));
        info!("{:?} closed", self);
        self.close_completion.try_complete(Ok(()));

        for receiver in waiting_receivers {
            receiver.fail(SessionError::ObjectClosed);
        }

        let session = self.clone();
        tokio::spawn(async move {
            let headers = session.protocol_headers(ActionCode::CloseSessionResponse, 0)
                .with_result(ResultCode::Success);
            session.start_one_shot_operation(ActionCode::CloseSessionResponse, headers, session.env.config.response_max_retries).await;
        });
    }

    //-------------------------------------------- aborting

    /// Tears down the session immediately and tells the peer on a best effort basis
    pub async fn abort(self: &Arc<Self>) {
        if !self.abort_locally() {
            return;
        }

        let action = match self.kind {
            SessionKind::Outbound => ActionCode::AbortInboundSessionRequest,
            SessionKind::Inbound => ActionCode::AbortOutboundSessionRequest,
        };
        let headers = self.protocol_headers(action, 0);
        self.start_one_shot_operation(action, headers, Some(self.env.config.abort_max_retries)).await;
    }

    /// Returns `false` if the session was closed or aborted already
    pub(crate) fn abort_locally(self: &Arc<Self>) -> bool {
        self.abort_locally_with(SessionError::OperationCanceled)
    }

    fn abort_locally_with(self: &Arc<Self>, reason: SessionError) -> bool {
        let (send_operations, (receivers, queued), open_request, close_request) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.apply(SessionSignal::Abort, self.session_id) {
                return false;
            }
            (
                inner.send_buffer.take_all(),
                inner.inbound_queue.take_all(),
                inner.open_request.take(),
                inner.close_request.take(),
            )
        };
        self.env.with_tables(|t| t.sessions.remove_all(self.kind, self.session_id));
        info!("{:?} aborted: {}", self, reason);

        for op in send_operations {
            op.release(EraseReason::SendCanceled);
        }
        for receiver in receivers {
            receiver.fail(SessionError::OperationCanceled);
        }
        drop(queued);
        for op in open_request.into_iter().chain(close_request) {
            op.cancel();
        }

        self.send_buffer_drained.try_complete(());
        self.open_completion.try_complete(Err(reason.clone()));
        self.close_completion.try_complete(Err(reason));
        true
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = state;
        if state != SessionState::Open {
            inner.send_buffer.close();
        }
    }

    /// Brings a session into the open state without a handshake
    #[cfg(test)]
    pub(crate) fn force_open(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SessionState::Open;
            inner.send_buffer.set_window_size(self.env.config.max_send_window);
        }
        let _ = self.env.with_tables(|t| t.sessions.insert(self.kind, self.session_id, self.clone()));
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {:?} {:?}->{:?}", self.kind, self.session_id, self.source, self.target)
    }
}
