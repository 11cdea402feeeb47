//! The boundary to the collaborators: the unreliable datagram transport below the protocol,
//!  and the session manager above it that decides about inbound sessions.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::error::SessionError;
use crate::partition::{PartitionId, SendTarget, SessionId};
use crate::session::Session;
use crate::session_directory::SessionKind;

/// An at-most-once, point-to-point datagram transport
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn resolve_target(&self, address: &str) -> anyhow::Result<SendTarget>;

    /// Fails with a transport-defined error e.g. on resource exhaustion. Success does not imply
    ///  delivery.
    async fn send_one_way(&self, target: SendTarget, frame: Bytes) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionManager: Send + Sync + 'static {
    /// Decides whether an inbound session requested by a peer is accepted. Returning `Ok` opens
    ///  the session, and the session manager can then receive messages through the handle.
    async fn request_inbound_session_open(&self, target: PartitionId, source: PartitionId, send_target: SendTarget, session: Arc<Session>) -> Result<(), SessionError>;

    /// Called after a session was aborted by its peer
    async fn on_session_aborted(&self, kind: SessionKind, session_id: SessionId);
}

/// The transport calls this for every received frame
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame_received(&self, frame: &[u8], sender: SendTarget);
}
