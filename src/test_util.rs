//! Transports and session managers for testing sessions without a network

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::config::ReliableMessagingConfig;
use crate::environment::Environment;
use crate::error::SessionError;
use crate::frame::FrameHeaders;
use crate::partition::{PartitionId, SendTarget, SessionId};
use crate::session::Session;
use crate::session_directory::SessionKind;
use crate::transport::{FrameHandler, SessionManager, Transport};

pub fn peer_addr() -> SendTarget {
    SendTarget(([10, 0, 0, 9], 99).into())
}

/// Records sent frames instead of sending them
pub struct TrackingTransport {
    sent: Mutex<Vec<(SendTarget, Bytes)>>,
}
impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        TrackingTransport {
            sent: Default::default(),
        }
    }

    /// Returns the frames sent since the previous call, parsed
    pub fn sent_frames(&self) -> Vec<(SendTarget, FrameHeaders, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
            .into_iter()
            .map(|(to, frame)| {
                let (headers, payload) = FrameHeaders::try_deser(&frame).unwrap();
                (to, headers, Bytes::copy_from_slice(payload))
            })
            .collect()
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    fn resolve_target(&self, address: &str) -> anyhow::Result<SendTarget> {
        Ok(SendTarget(address.parse()?))
    }

    async fn send_one_way(&self, target: SendTarget, frame: Bytes) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((target, frame));
        Ok(())
    }
}

/// Accepts (or rejects) every inbound session and keeps track of what it was told
pub struct RecordingSessionManager {
    accept: bool,
    accepted: Mutex<Vec<Arc<Session>>>,
    aborted: Mutex<Vec<(SessionKind, SessionId)>>,
}
impl RecordingSessionManager {
    pub fn new(accept: bool) -> RecordingSessionManager {
        RecordingSessionManager {
            accept,
            accepted: Default::default(),
            aborted: Default::default(),
        }
    }

    pub fn accepted_sessions(&self) -> Vec<Arc<Session>> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn aborted_sessions(&self) -> Vec<(SessionKind, SessionId)> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionManager for RecordingSessionManager {
    async fn request_inbound_session_open(&self, _target: PartitionId, _source: PartitionId, _send_target: SendTarget, session: Arc<Session>) -> Result<(), SessionError> {
        if !self.accept {
            return Err(SessionError::Rejected);
        }
        self.accepted.lock().unwrap().push(session);
        Ok(())
    }

    async fn on_session_aborted(&self, kind: SessionKind, session_id: SessionId) {
        self.aborted.lock().unwrap().push((kind, session_id));
    }
}

pub fn test_environment(transport: Arc<dyn Transport>, config: ReliableMessagingConfig) -> Arc<Environment> {
    Arc::new(Environment::new(
        Arc::new(config),
        transport,
        Arc::new(RecordingSessionManager::new(true)),
    ))
}

/// An open session in a fresh environment, registered in the environment's directory
pub fn test_session(transport: Arc<dyn Transport>, kind: SessionKind, config: ReliableMessagingConfig) -> Arc<Session> {
    let env = test_environment(transport, config);
    let session = Session::new(&env, SessionId::new_random(), kind, PartitionId::new("source"), PartitionId::new("target"), peer_addr());
    session.force_open();
    session
}

type DropFilter = Box<dyn FnMut(&FrameHeaders) -> bool + Send>;

/// Connects engines in memory. Every frame is delivered on its own task, optionally dropping
///  frames selected by a filter.
pub struct LoopbackNetwork {
    handlers: Mutex<FxHashMap<SocketAddr, Weak<dyn FrameHandler>>>,
    drop_filter: Mutex<Option<DropFilter>>,
}
impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        Arc::new(LoopbackNetwork {
            handlers: Default::default(),
            drop_filter: Default::default(),
        })
    }

    pub fn transport(self: &Arc<Self>, addr: &str) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
            self_addr: addr.parse().unwrap(),
        })
    }

    pub fn register(&self, addr: &str, handler: &Arc<dyn FrameHandler>) {
        self.handlers.lock().unwrap().insert(addr.parse().unwrap(), Arc::downgrade(handler));
    }

    /// The filter returns `true` for frames that are dropped
    pub fn set_drop_filter(&self, filter: impl FnMut(&FrameHeaders) -> bool + Send + 'static) {
        *self.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    fn should_drop(&self, frame: &[u8]) -> bool {
        let mut filter = self.drop_filter.lock().unwrap();
        match (filter.as_mut(), FrameHeaders::try_deser(frame)) {
            (Some(filter), Ok((headers, _))) => filter(&headers),
            _ => false,
        }
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    self_addr: SocketAddr,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn resolve_target(&self, address: &str) -> anyhow::Result<SendTarget> {
        Ok(SendTarget(address.parse()?))
    }

    async fn send_one_way(&self, target: SendTarget, frame: Bytes) -> anyhow::Result<()> {
        if self.network.should_drop(&frame) {
            return Ok(());
        }

        let handler = self.network.handlers.lock().unwrap()
            .get(&target.0)
            .and_then(|h| h.upgrade());
        if let Some(handler) = handler {
            let sender = SendTarget(self.self_addr);
            tokio::spawn(async move {
                handler.on_frame_received(&frame, sender).await;
            });
        }
        Ok(())
    }
}
