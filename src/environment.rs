use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{trace, warn};

use crate::ack_table::AckTable;
use crate::action_code::ActionCode;
use crate::config::ReliableMessagingConfig;
use crate::error::{ResultCode, SessionError};
use crate::frame::FrameHeaders;
use crate::partition::{SendTarget, SessionId};
use crate::protocol_operation::ProtocolOperation;
use crate::session::Session;
use crate::session_directory::{SessionDirectory, SessionKind};

pub struct EnvironmentTables {
    pub ack_table: AckTable<ProtocolOperation>,
    pub sessions: SessionDirectory<Arc<Session>>,
}

/// The context shared by all sessions and operations of one messaging engine instance.
///
/// The ack table and the session directory are guarded by a single lock. It is only reachable
///  through [Environment::with_tables], which runs a synchronous closure: the guard can not be
///  held across an `await`, a network send or a callback into application code.
pub struct Environment {
    pub config: Arc<ReliableMessagingConfig>,
    pub transport: Arc<dyn crate::transport::Transport>,
    pub session_manager: Arc<dyn crate::transport::SessionManager>,
    tables: Mutex<EnvironmentTables>,
}

impl Environment {
    pub fn new(
        config: Arc<ReliableMessagingConfig>,
        transport: Arc<dyn crate::transport::Transport>,
        session_manager: Arc<dyn crate::transport::SessionManager>,
    ) -> Environment {
        Environment {
            config,
            transport,
            session_manager,
            tables: Mutex::new(EnvironmentTables {
                ack_table: AckTable::new(),
                sessions: SessionDirectory::new(),
            }),
        }
    }

    pub fn with_tables<R>(&self, f: impl FnOnce(&mut EnvironmentTables) -> R) -> R {
        let mut tables = self.tables.lock().unwrap();
        f(&mut tables)
    }

    pub fn session(&self, kind: SessionKind, session_id: SessionId) -> Option<Arc<Session>> {
        self.with_tables(|t| t.sessions.get(kind, session_id))
    }

    pub fn inbound_session_count(&self) -> usize {
        self.with_tables(|t| t.sessions.len(SessionKind::Inbound))
    }

    pub fn outbound_session_count(&self) -> usize {
        self.with_tables(|t| t.sessions.len(SessionKind::Outbound))
    }

    pub fn outstanding_protocol_operations(&self) -> usize {
        self.with_tables(|t| t.ack_table.len())
    }

    pub async fn send_frame(&self, target: SendTarget, frame: Bytes) -> Result<(), SessionError> {
        self.transport.send_one_way(target, frame).await
            .map_err(|e| {
                trace!("sending frame to {:?} failed: {}", target, e);
                SessionError::from(e)
            })
    }

    /// Acks are fire-and-forget: a lost ack is compensated by the sender's retry
    pub async fn send_ack(&self, target: SendTarget, session_id: SessionId, ack_action: ActionCode, sequence_number: u64, result: Option<ResultCode>) {
        let mut headers = FrameHeaders::new(session_id, sequence_number, ack_action);
        if let Some(result) = result {
            headers = headers.with_result(result);
        }

        match headers.ser_frame(&[]) {
            Ok(frame) => {
                trace!("sending {:?} for {:?} #{} to {:?}: {:?}", ack_action, session_id, sequence_number, target, result);
                let _ = self.send_frame(target, frame).await;
            }
            Err(e) => warn!("could not build {:?} frame: {}", ack_action, e),
        }
    }

    /// Breaks the reference cycles between the environment and its sessions and operations
    pub(crate) fn clear(&self) {
        let operations = self.with_tables(|t| {
            t.sessions.clear();
            t.ack_table.drain()
        });
        for op in operations {
            op.cancel_unregistered();
        }
    }
}
