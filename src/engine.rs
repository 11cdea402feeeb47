use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ReliableMessagingConfig;
use crate::dispatcher::TransportDispatcher;
use crate::environment::Environment;
use crate::error::SessionError;
use crate::partition::{PartitionId, SendTarget, SessionId};
use crate::session::Session;
use crate::session_directory::SessionKind;
use crate::transport::{FrameHandler, SessionManager, Transport};

/// A messaging engine instance. It owns the environment shared by its sessions, and the
///  dispatcher that the transport feeds received frames into.
pub struct ReliableMessaging {
    env: Arc<Environment>,
    dispatcher: Arc<TransportDispatcher>,
    workers: Vec<JoinHandle<()>>,
}

impl ReliableMessaging {
    pub fn new(config: ReliableMessagingConfig, transport: Arc<dyn Transport>, session_manager: Arc<dyn SessionManager>) -> anyhow::Result<ReliableMessaging> {
        config.validate()?;

        let env = Arc::new(Environment::new(Arc::new(config), transport, session_manager));
        let (dispatcher, workers) = TransportDispatcher::new(env.clone());
        info!("reliable messaging started with {} deferred protocol workers", workers.len());

        Ok(ReliableMessaging {
            env,
            dispatcher: Arc::new(dispatcher),
            workers,
        })
    }

    /// Opens an outbound session to the peer at the given address, returning after the peer
    ///  accepted it
    pub async fn open_session(&self, source: PartitionId, target: PartitionId, target_address: &str) -> Result<Arc<Session>, SessionError> {
        let send_target = self.env.transport.resolve_target(target_address)?;
        let session = Session::new(&self.env, SessionId::new_random(), SessionKind::Outbound, source, target, send_target);
        debug!("opening {:?} at {:?}", session, send_target);

        session.open_outbound().await?;
        Ok(session)
    }

    /// The handler to register with the transport
    pub fn frame_handler(&self) -> Arc<dyn FrameHandler> {
        self.dispatcher.clone()
    }

    pub async fn on_frame_received(&self, frame: &[u8], sender: SendTarget) {
        self.dispatcher.on_frame_received(frame, sender).await
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }
}

impl Drop for ReliableMessaging {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
        self.env.clear();
    }
}
