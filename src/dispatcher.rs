use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::ack_table::AckKey;
use crate::action_code::{ActionCode, DispatchPath};
use crate::environment::Environment;
use crate::error::ResultCode;
use crate::frame::FrameHeaders;
use crate::message_pool::{MessagePool, PooledMessage};
use crate::partition::SendTarget;
use crate::session::Session;
use crate::session_directory::SessionKind;
use crate::transport::FrameHandler;

/// The single entry point for inbound frames. Acks for protocol operations and content frames
///  are handled inline; requests and responses of the open, close and abort protocols go
///  through a queue that is drained by a fixed number of worker tasks, because they mutate the
///  session directory and call into the session manager.
pub struct TransportDispatcher {
    env: Arc<Environment>,
    deferred_pool: MessagePool,
    deferred_queue: mpsc::UnboundedSender<PooledMessage>,
}

impl TransportDispatcher {
    /// Returns the dispatcher and the handles of its deferred workers
    pub fn new(env: Arc<Environment>) -> (TransportDispatcher, Vec<JoinHandle<()>>) {
        let (send, recv) = mpsc::unbounded_channel();
        let recv = Arc::new(tokio::sync::Mutex::new(recv));

        let workers = (0..env.config.num_dispatch_workers)
            .map(|worker_id| tokio::spawn(deferred_worker(worker_id, env.clone(), recv.clone())))
            .collect();

        let dispatcher = TransportDispatcher {
            deferred_pool: MessagePool::new("deferred protocol", env.config.dispatch_pool_size),
            env,
            deferred_queue: send,
        };
        (dispatcher, workers)
    }

    pub(crate) fn deferred_pool_in_use(&self) -> usize {
        self.deferred_pool.in_use()
    }

    async fn dispatch(&self, frame: &[u8], sender: SendTarget) {
        let (headers, payload) = match FrameHeaders::try_deser(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("received unparsable frame from {:?}, dropping: {}", sender, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", headers.header, sender);

        match headers.action().dispatch_path() {
            DispatchPath::AckFastPath => self.on_protocol_ack(&headers),
            DispatchPath::ContentFastPath => {
                if headers.action() == ActionCode::SendMessage {
                    self.on_content(headers, sender, payload).await;
                }
                else {
                    self.on_content_ack(&headers).await;
                }
            }
            DispatchPath::Deferred => {
                let Some(message) = self.deferred_pool.acquire(headers, sender, payload) else {
                    // the sender's retry will bring it back
                    debug!("deferred protocol queue is full, dropping frame from {:?}", sender);
                    return;
                };
                if self.deferred_queue.send(message).is_err() {
                    warn!("deferred protocol queue is closed, dropping frame from {:?}", sender);
                }
            }
        }
    }

    fn on_protocol_ack(&self, headers: &FrameHeaders) {
        let key = AckKey::new(headers.session_id(), headers.action());
        match self.env.with_tables(|t| t.ack_table.extract(&key)) {
            Some(op) => op.complete_protocol_operation(headers.action()),
            None => trace!("no protocol operation waiting for {:?}, ignoring", key),
        }
    }

    async fn on_content(&self, headers: FrameHeaders, sender: SendTarget, payload: &[u8]) {
        let session_id = headers.session_id();
        let sequence_number = headers.sequence_number();

        let result = match self.env.session(SessionKind::Inbound, session_id) {
            Some(session) => session.on_content(headers, sender, payload),
            None => {
                debug!("content for unknown session {:?} from {:?}", session_id, sender);
                ResultCode::SessionNotFound
            }
        };
        self.env.send_ack(sender, session_id, ActionCode::SendMessageAck, sequence_number, Some(result)).await;
    }

    async fn on_content_ack(&self, headers: &FrameHeaders) {
        let Some(session) = self.env.session(SessionKind::Outbound, headers.session_id()) else {
            trace!("ack for unknown session {:?}, ignoring", headers.session_id());
            return;
        };
        let result = headers.result.unwrap_or(ResultCode::Success);
        session.on_message_ack(headers.sequence_number(), result).await;
    }
}

#[async_trait]
impl FrameHandler for TransportDispatcher {
    async fn on_frame_received(&self, frame: &[u8], sender: SendTarget) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "frame_received", ?correlation_id);
        self.dispatch(frame, sender)
            .instrument(span)
            .await
    }
}

async fn deferred_worker(worker_id: usize, env: Arc<Environment>, queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PooledMessage>>>) {
    debug!("starting deferred protocol worker #{}", worker_id);
    loop {
        // the queue lock is released before processing, so another worker is waiting for the
        //  next frame while this one is busy
        let next = queue.lock().await.recv().await;
        let Some(message) = next else {
            debug!("deferred protocol queue closed, stopping worker #{}", worker_id);
            break;
        };
        on_deferred_frame(&env, message).await;
    }
}

async fn on_deferred_frame(env: &Arc<Environment>, message: PooledMessage) {
    let headers = message.headers().clone();
    let sender = message.sender();
    // the pooled object is not needed beyond the headers
    drop(message);

    let session_id = headers.session_id();
    let action = headers.action();
    trace!("processing {:?} for {:?} from {:?}", action, session_id, sender);

    // requests are acked before their effect is attempted: the outcome is reported in a
    //  response, not by withholding the ack
    if let Some(ack) = action.ack_code() {
        env.send_ack(sender, session_id, ack, headers.sequence_number(), None).await;
    }

    match action {
        ActionCode::OpenSessionRequest => {
            let Some(routing) = headers.routing else {
                warn!("open request for {:?} from {:?} without routing header, ignoring", session_id, sender);
                return;
            };
            Session::start_open_inbound(env, session_id, routing.source, routing.target, sender).await;
        }
        ActionCode::OpenSessionResponse => {
            match env.with_tables(|t| t.sessions.take_response_waiter(session_id, ActionCode::OpenSessionResponse)) {
                Some(session) => session.on_open_response(headers.result.unwrap_or(ResultCode::OperationFailed), headers.params),
                None => trace!("no session waiting for open response {:?}, ignoring", session_id),
            }
        }
        ActionCode::CloseSessionRequest => {
            match env.session(SessionKind::Inbound, session_id) {
                Some(session) => session.on_close_request(headers.sequence_number()),
                None => {
                    // sent without retry: the sender's retried close request is answered again
                    debug!("close request for unknown session {:?}", session_id);
                    let response = FrameHeaders::new(session_id, 0, ActionCode::CloseSessionResponse)
                        .with_result(ResultCode::SessionNotFound);
                    if let Ok(frame) = response.ser_frame(&[]) {
                        let _ = env.send_frame(sender, frame).await;
                    }
                }
            }
        }
        ActionCode::CloseSessionResponse => {
            match env.with_tables(|t| t.sessions.take_response_waiter(session_id, ActionCode::CloseSessionResponse)) {
                Some(session) => session.on_close_response(headers.result.unwrap_or(ResultCode::OperationFailed)),
                None => trace!("no session waiting for close response {:?}, ignoring", session_id),
            }
        }
        ActionCode::AbortInboundSessionRequest => {
            let session = env.session(SessionKind::Inbound, session_id);
            on_abort_request(env, session, SessionKind::Inbound).await;
        }
        ActionCode::AbortOutboundSessionRequest => {
            let session = env.with_tables(|t| t.sessions.find_outbound(session_id));
            on_abort_request(env, session, SessionKind::Outbound).await;
        }
        other => warn!("{:?} frame on the deferred path, ignoring", other),
    }
}

async fn on_abort_request(env: &Arc<Environment>, session: Option<Arc<Session>>, kind: SessionKind) {
    let Some(session) = session else {
        trace!("abort request for unknown {:?} session, ignoring", kind);
        return;
    };
    if session.abort_locally() {
        debug!("{:?} aborted by peer", session);
        let session_manager = env.session_manager.clone();
        let session_id = session.session_id();
        tokio::spawn(async move {
            session_manager.on_session_aborted(kind, session_id).await;
        });
    }
}
