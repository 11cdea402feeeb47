use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::ack_table::AckKey;
use crate::action_code::ActionCode;
use crate::completion::Completion;
use crate::environment::Environment;
use crate::error::SessionError;
use crate::partition::{SendTarget, SessionId};

#[derive(Default)]
struct RetryBookkeeping {
    attempts: u32,
    last_send_result: Option<Result<(), SessionError>>,
    last_attempt: Option<Instant>,
    retry_task: Option<JoinHandle<()>>,
}

struct ProtocolOperationInner {
    env: Weak<Environment>,
    action: ActionCode,
    key: AckKey,
    frame: Bytes,
    target: SendTarget,
    max_retries: Option<u32>,
    retry_interval: Duration,
    bookkeeping: Mutex<RetryBookkeeping>,
    completion: Completion<Result<(), SessionError>>,
}

/// Reliably delivers one control message: it is re-sent at a fixed interval until the matching
///  ack arrives, the operation is cancelled, or (for bounded operations) the maximum number of
///  send attempts is reached.
///
/// While it is outstanding, the operation is registered in the environment's ack table. Whoever
///  extracts it from the table completes it, so completion happens exactly once.
#[derive(Clone)]
pub struct ProtocolOperation(Arc<ProtocolOperationInner>);

impl ProtocolOperation {
    pub async fn start(
        env: &Arc<Environment>,
        action: ActionCode,
        expected_ack: ActionCode,
        session_id: SessionId,
        frame: Bytes,
        target: SendTarget,
        max_retries: Option<u32>,
    ) -> Result<ProtocolOperation, SessionError> {
        let op = ProtocolOperation(Arc::new(ProtocolOperationInner {
            env: Arc::downgrade(env),
            action,
            key: AckKey::new(session_id, expected_ack),
            frame,
            target,
            max_retries,
            retry_interval: env.config.protocol_retry_interval,
            bookkeeping: Default::default(),
            completion: Completion::new(),
        }));

        // a retried open request can make the accepting side re-send its open response while
        //  the first one is still outstanding
        let tolerate_duplicate = action == ActionCode::OpenSessionResponse;
        let replaced = env.with_tables(|t| t.ack_table.insert(op.0.key, op.clone(), tolerate_duplicate))?;
        if let Some(replaced) = replaced {
            debug!("{:?} replaces outstanding {:?}", op, replaced);
            replaced.cancel_unregistered();
        }

        debug!("starting {:?}", op);
        op.send_attempt().await;
        op.spawn_retry_task();
        Ok(op)
    }

    pub fn action(&self) -> ActionCode {
        self.0.action
    }

    pub fn key(&self) -> AckKey {
        self.0.key
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

    fn is_same(&self, other: &ProtocolOperation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Entry point for the dispatcher's ack fast path, after it extracted this operation from
    ///  the ack table
    pub fn complete_protocol_operation(&self, ack_action: ActionCode) {
        if ack_action != self.0.key.ack_action {
            error!("{:?} received unexpected ack {:?}", self, ack_action);
            panic!("this is a bug: {:?} was completed by {:?}", self, ack_action);
        }
        trace!("{:?} acknowledged", self);
        self.finish(Ok(()));
    }

    /// Stops retrying and completes with [SessionError::OperationCanceled]. Cancelling an
    ///  operation that completed already is a no-op.
    pub fn cancel(&self) {
        let Some(env) = self.0.env.upgrade() else {
            self.cancel_unregistered();
            return;
        };

        if env.with_tables(|t| t.ack_table.extract_if(&self.0.key, |w| w.is_same(self))).is_some() {
            debug!("canceling {:?}", self);
            self.finish(Err(SessionError::OperationCanceled));
        }
    }

    /// Cancels an operation that was already removed from the ack table by the caller
    pub(crate) fn cancel_unregistered(&self) {
        self.stop_retry_task();
        self.0.completion.try_complete(Err(SessionError::OperationCanceled));
    }

    fn finish(&self, result: Result<(), SessionError>) {
        self.0.completion.complete(result, "protocol operation");
        self.stop_retry_task();
    }

    fn stop_retry_task(&self) {
        if let Some(handle) = self.0.bookkeeping.lock().unwrap().retry_task.take() {
            handle.abort();
        }
    }

    async fn send_attempt(&self) {
        let Some(env) = self.0.env.upgrade() else {
            return;
        };

        // the original frame is retained, every attempt sends its own handle to it
        let result = env.send_frame(self.0.target, self.0.frame.clone()).await;

        let mut bookkeeping = self.0.bookkeeping.lock().unwrap();
        bookkeeping.attempts += 1;
        bookkeeping.last_attempt = Some(Instant::now());
        trace!("{:?}: send attempt #{}: {:?}", self, bookkeeping.attempts, result);
        bookkeeping.last_send_result = Some(result);
    }

    fn spawn_retry_task(&self) {
        let mut bookkeeping = self.0.bookkeeping.lock().unwrap();
        if self.is_completed() {
            return;
        }

        let weak = Arc::downgrade(&self.0);
        let retry_interval = self.0.retry_interval;
        bookkeeping.retry_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(retry_interval).await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let op = ProtocolOperation(inner);
                if op.is_completed() {
                    break;
                }
                if op.retries_exhausted() {
                    op.on_retries_exhausted();
                    break;
                }
                op.send_attempt().await;
            }
        }));
    }

    fn retries_exhausted(&self) -> bool {
        match self.0.max_retries {
            Some(max_retries) => self.attempts() >= max_retries,
            None => false,
        }
    }

    fn on_retries_exhausted(&self) {
        let Some(env) = self.0.env.upgrade() else {
            return;
        };

        if env.with_tables(|t| t.ack_table.extract_if(&self.0.key, |w| w.is_same(self))).is_some() {
            info!("{:?}: no ack after {} attempts, giving up", self, self.attempts());
            // this runs inside the retry task, so there is nothing left to abort
            self.0.bookkeeping.lock().unwrap().retry_task.take();
            self.0.completion.complete(Err(SessionError::OperationFailed), "protocol operation");
        }
        else {
            trace!("{:?}: ack arrived concurrently with giving up", self);
        }
    }
}

impl Debug for ProtocolOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProtocolOperation{{{:?} {:?} -> {:?}}}", self.0.action, self.0.key.session_id, self.0.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReliableMessagingConfig;
    use crate::frame::FrameHeaders;
    use crate::transport::{MockSessionManager, MockTransport};
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::runtime::Builder;

    fn target() -> SendTarget {
        SendTarget(([10, 0, 0, 2], 1234).into())
    }

    fn frame(action: ActionCode) -> Bytes {
        FrameHeaders::new(SessionId::from_raw(7), 0, action).ser_frame(&[]).unwrap()
    }

    fn env_counting_sends(counter: Arc<AtomicU32>) -> Arc<Environment> {
        let mut transport = MockTransport::new();
        transport.expect_send_one_way()
            .with(eq(target()), mockall::predicate::always())
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        Arc::new(Environment::new(
            Arc::new(ReliableMessagingConfig::new()),
            Arc::new(transport),
            Arc::new(MockSessionManager::new()),
        ))
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    async fn start(env: &Arc<Environment>, action: ActionCode, max_retries: Option<u32>) -> Result<ProtocolOperation, SessionError> {
        let ack = action.ack_code().unwrap();
        ProtocolOperation::start(env, action, ack, SessionId::from_raw(7), frame(action), target(), max_retries).await
    }

    #[rstest]
    #[case::one(1)]
    #[case::three(3)]
    #[case::ten(10)]
    fn test_retry_termination(#[case] max_retries: u32) {
        paused_runtime().block_on(async move {
            let counter = Arc::new(AtomicU32::new(0));
            let env = env_counting_sends(counter.clone());

            let op = start(&env, ActionCode::AbortInboundSessionRequest, Some(max_retries)).await.unwrap();
            assert_eq!(env.outstanding_protocol_operations(), 1);

            assert_eq!(op.wait().await, Err(SessionError::OperationFailed));
            assert_eq!(counter.load(Ordering::SeqCst), max_retries);
            assert_eq!(op.attempts(), max_retries);
            assert_eq!(env.outstanding_protocol_operations(), 0);
        });
    }

    #[test]
    fn test_retries_at_fixed_interval_until_acked() {
        paused_runtime().block_on(async move {
            let counter = Arc::new(AtomicU32::new(0));
            let env = env_counting_sends(counter.clone());

            let op = start(&env, ActionCode::OpenSessionRequest, None).await.unwrap();
            assert_eq!(counter.load(Ordering::SeqCst), 1);

            tokio::time::sleep(Duration::from_millis(350)).await;
            assert_eq!(counter.load(Ordering::SeqCst), 4);

            let extracted = env.with_tables(|t| t.ack_table.extract(&op.key())).unwrap();
            extracted.complete_protocol_operation(ActionCode::OpenSessionRequestAck);
            assert_eq!(op.wait().await, Ok(()));

            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(counter.load(Ordering::SeqCst), 4);
        });
    }

    #[rstest]
    #[case::close_request(ActionCode::CloseSessionRequest)]
    #[case::close_response(ActionCode::CloseSessionResponse)]
    #[case::open_request(ActionCode::OpenSessionRequest)]
    #[case::abort(ActionCode::AbortOutboundSessionRequest)]
    #[should_panic(expected = "two outstanding operations")]
    fn test_second_registration_is_fatal(#[case] action: ActionCode) {
        paused_runtime().block_on(async move {
            let env = env_counting_sends(Default::default());
            let _first = start(&env, action, None).await.unwrap();
            let _ = start(&env, action, None).await;
        });
    }

    #[test]
    fn test_second_open_response_is_tolerated() {
        paused_runtime().block_on(async move {
            let env = env_counting_sends(Default::default());
            let first = start(&env, ActionCode::OpenSessionResponse, None).await.unwrap();
            let second = start(&env, ActionCode::OpenSessionResponse, None).await.unwrap();

            assert_eq!(first.wait().await, Err(SessionError::OperationCanceled));
            assert!(!second.is_completed());
            assert_eq!(env.outstanding_protocol_operations(), 1);

            let extracted = env.with_tables(|t| t.ack_table.extract(&second.key())).unwrap();
            assert!(extracted.is_same(&second));
        });
    }

    #[test]
    fn test_cancel_is_idempotent() {
        paused_runtime().block_on(async move {
            let counter = Arc::new(AtomicU32::new(0));
            let env = env_counting_sends(counter.clone());

            let op = start(&env, ActionCode::CloseSessionRequest, None).await.unwrap();
            op.cancel();
            op.cancel();
            assert_eq!(op.wait().await, Err(SessionError::OperationCanceled));
            assert_eq!(env.outstanding_protocol_operations(), 0);

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        paused_runtime().block_on(async move {
            let env = env_counting_sends(Default::default());

            let op = start(&env, ActionCode::CloseSessionRequest, None).await.unwrap();
            env.with_tables(|t| t.ack_table.extract(&op.key())).unwrap()
                .complete_protocol_operation(ActionCode::CloseSessionRequestAck);
            op.cancel();
            assert_eq!(op.wait().await, Ok(()));
        });
    }

    #[test]
    #[should_panic(expected = "was completed by")]
    fn test_unexpected_ack_is_fatal() {
        paused_runtime().block_on(async move {
            let env = env_counting_sends(Default::default());
            let op = start(&env, ActionCode::CloseSessionRequest, None).await.unwrap();
            op.complete_protocol_operation(ActionCode::OpenSessionRequestAck);
        });
    }

    #[test]
    fn test_failed_sends_are_retried() {
        paused_runtime().block_on(async move {
            let mut transport = MockTransport::new();
            transport.expect_send_one_way()
                .times(3)
                .returning(|_, _| Err(anyhow::anyhow!("no buffers")));
            let env = Arc::new(Environment::new(
                Arc::new(ReliableMessagingConfig::new()),
                Arc::new(transport),
                Arc::new(MockSessionManager::new()),
            ));

            let op = start(&env, ActionCode::AbortInboundSessionRequest, Some(3)).await.unwrap();
            assert_eq!(op.wait().await, Err(SessionError::OperationFailed));
        });
    }
}
