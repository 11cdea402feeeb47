use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

/// Opaque logical identity of a session endpoint
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    pub fn new(name: &str) -> PartitionId {
        PartitionId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.0.len());
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PartitionId> {
        let len = buf.try_get_usize_varint()?;
        if buf.remaining() < len {
            anyhow::bail!("partition id is truncated: {} bytes expected, {} available", len, buf.remaining());
        }
        let raw = buf.copy_to_bytes(len);
        let s = std::str::from_utf8(&raw)?;
        Ok(PartitionId::new(s))
    }
}
impl Debug for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}
impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_random() -> SessionId {
        SessionId(Uuid::new_v4())
    }

    pub fn from_raw(raw: u128) -> SessionId {
        SessionId(Uuid::from_u128(raw))
    }

    pub fn to_raw(&self) -> u128 {
        self.0.as_u128()
    }
}
impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S:{}", self.0)
    }
}
impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A peer address as resolved by the transport. Frames are sent to and received from send targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SendTarget(pub SocketAddr);
