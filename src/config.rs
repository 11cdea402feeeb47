use std::time::Duration;
use anyhow::bail;

pub struct ReliableMessagingConfig {
    /// The fixed interval at which protocol operations (open, close, abort and their responses)
    ///  re-send their message until the matching ack arrives. This is independent of the action.
    pub protocol_retry_interval: Duration,

    /// A content message is re-sent if it was not acknowledged this long after its last
    ///  send attempt. Content messages are retried indefinitely, only session close / abort or
    ///  an explicit cancel stops this.
    pub send_retry_interval: Duration,

    /// A content message whose last send attempt failed (a transport error, or a 'pool
    ///  exceeded' nack from the peer) is re-sent after this shorter interval
    pub failed_send_retry_interval: Duration,

    /// `None` means an open request is retried until the session is aborted
    pub open_max_retries: Option<u32>,
    pub close_max_retries: Option<u32>,
    pub response_max_retries: Option<u32>,

    /// Abort is best effort: its request is sent at most this many times, and the outcome is
    ///  only logged
    pub abort_max_retries: u32,

    /// This is the number of pooled message objects per inbound session, i.e. the number of
    ///  messages that can be received but not yet consumed by the application. It is advertised
    ///  to the peer as the session's window.
    ///
    /// Content arriving while the pool is exhausted is dropped with a 'pool exceeded' nack.
    pub inbound_message_quota: usize,

    /// Maximum number of unfinished send operations per outbound session
    pub send_operation_quota: usize,

    /// Maximum number of registered (blocking) receive operations per inbound session
    pub receive_operation_quota: usize,

    /// Upper bound for the number of unacknowledged content messages in flight per session. The
    ///  effective window is the minimum of this and the peer's advertised window.
    pub max_send_window: u32,

    /// Number of pooled message objects for frames waiting in the deferred protocol queue
    pub dispatch_pool_size: usize,
    pub num_dispatch_workers: usize,
}

impl ReliableMessagingConfig {
    pub fn new() -> ReliableMessagingConfig {
        ReliableMessagingConfig {
            protocol_retry_interval: Duration::from_millis(100),
            send_retry_interval: Duration::from_millis(200),
            failed_send_retry_interval: Duration::from_millis(20),
            open_max_retries: None,
            close_max_retries: None,
            response_max_retries: Some(20),
            abort_max_retries: 5,
            inbound_message_quota: 256,
            send_operation_quota: 1024,
            receive_operation_quota: 64,
            max_send_window: 128,
            dispatch_pool_size: 1024,
            num_dispatch_workers: 4,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol_retry_interval.is_zero() || self.send_retry_interval.is_zero() || self.failed_send_retry_interval.is_zero() {
            bail!("retry intervals must be positive");
        }
        if self.abort_max_retries == 0 || self.open_max_retries == Some(0) || self.close_max_retries == Some(0) || self.response_max_retries == Some(0) {
            bail!("a protocol operation must be allowed at least one send attempt");
        }
        if self.inbound_message_quota == 0 || self.send_operation_quota == 0 || self.receive_operation_quota == 0 {
            bail!("per-session quotas must be positive");
        }
        if self.inbound_message_quota > u32::MAX as usize {
            bail!("inbound message quota is advertised as a window and must fit into 32 bits");
        }
        if self.max_send_window == 0 {
            bail!("send window must be positive");
        }
        if self.dispatch_pool_size == 0 || self.num_dispatch_workers == 0 {
            bail!("the deferred protocol queue needs at least one pooled object and one worker");
        }
        Ok(())
    }
}

impl Default for ReliableMessagingConfig {
    fn default() -> Self {
        ReliableMessagingConfig::new()
    }
}
