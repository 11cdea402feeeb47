use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use crc::{Crc, CRC_32_ISCSI};

use crate::action_code::ActionCode;
use crate::error::{ResultCode, SessionError};
use crate::partition::{PartitionId, SessionId};

const PROTOCOL_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = size_of::<u32>();
const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const FLAG_ROUTING: u8 = 1;
const FLAG_RESPONSE: u8 = 2;
const FLAG_PARAMS: u8 = 4;

/// Present on every frame
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub session_id: SessionId,
    /// meaningful for content frames and their acks, and as the final sequence number + 1 of
    ///  a close request
    pub sequence_number: u64,
    pub action: ActionCode,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RoutingHeader {
    pub source: PartitionId,
    pub target: PartitionId,
}

/// Limits the accepting side of an open handshake hands to the opening side
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionParameters {
    pub window_size: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameHeaders {
    pub header: FrameHeader,
    pub routing: Option<RoutingHeader>,
    pub result: Option<ResultCode>,
    pub params: Option<SessionParameters>,
}

impl FrameHeaders {
    pub fn new(session_id: SessionId, sequence_number: u64, action: ActionCode) -> FrameHeaders {
        FrameHeaders {
            header: FrameHeader { session_id, sequence_number, action },
            routing: None,
            result: None,
            params: None,
        }
    }

    pub fn with_routing(mut self, source: PartitionId, target: PartitionId) -> FrameHeaders {
        self.routing = Some(RoutingHeader { source, target });
        self
    }

    pub fn with_result(mut self, result: ResultCode) -> FrameHeaders {
        self.result = Some(result);
        self
    }

    pub fn with_params(mut self, params: SessionParameters) -> FrameHeaders {
        self.params = Some(params);
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }

    pub fn action(&self) -> ActionCode {
        self.header.action
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    fn serialized_len(&self, payload_len: usize) -> usize {
        let routing_len = self.routing.as_ref()
            .map(|r| r.source.as_str().len() + r.target.as_str().len() + 2*size_of::<u64>())
            .unwrap_or(0);

        2 + size_of::<u128>() + size_of::<u64>() + 1
            + routing_len
            + self.result.map(|_| 1).unwrap_or(0)
            + self.params.map(|_| size_of::<u32>()).unwrap_or(0)
            + payload_len
            + CHECKSUM_LEN
    }

    /// Builds a complete frame with the given payload. Allocation is fallible so that frame
    ///  construction can report [SessionError::OutOfMemory] instead of aborting.
    pub fn ser_frame(&self, payload: &[u8]) -> Result<Bytes, SessionError> {
        let buf = self.alloc_frame(payload.len())?;
        Ok(self.write_frame(buf, payload))
    }

    /// Reserves the buffer for a frame with these headers, see [FrameHeaders::write_frame]
    pub fn alloc_frame(&self, payload_len: usize) -> Result<Vec<u8>, SessionError> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(self.serialized_len(payload_len))
            .map_err(|_| SessionError::OutOfMemory)?;
        Ok(buf)
    }

    /// Writes the frame into a buffer returned by [FrameHeaders::alloc_frame]. The sequence
    ///  number may differ from the one the buffer was reserved with, its size is fixed.
    pub fn write_frame(&self, mut buf: Vec<u8>, payload: &[u8]) -> Bytes {
        buf.clear();
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.header.action.into());
        buf.put_u128(self.header.session_id.to_raw());
        buf.put_u64(self.header.sequence_number);

        let mut flags = 0;
        if self.routing.is_some() { flags |= FLAG_ROUTING; }
        if self.result.is_some() { flags |= FLAG_RESPONSE; }
        if self.params.is_some() { flags |= FLAG_PARAMS; }
        buf.put_u8(flags);

        if let Some(routing) = &self.routing {
            routing.source.ser(&mut buf);
            routing.target.ser(&mut buf);
        }
        if let Some(result) = self.result {
            buf.put_u8(result.into());
        }
        if let Some(params) = self.params {
            buf.put_u32(params.window_size);
        }
        buf.put_slice(payload);

        let checksum = CRC.checksum(&buf);
        buf.put_u32(checksum);
        Bytes::from(buf)
    }

    /// Parses and verifies a received frame, returning its headers and a view of its payload
    pub fn try_deser(frame: &[u8]) -> anyhow::Result<(FrameHeaders, &[u8])> {
        if frame.len() < CHECKSUM_LEN {
            bail!("frame is too short: {} bytes", frame.len());
        }
        let (content, mut checksum_buf) = frame.split_at(frame.len() - CHECKSUM_LEN);
        let checksum = checksum_buf.try_get_u32()?;
        if CRC.checksum(content) != checksum {
            bail!("checksum mismatch");
        }

        let mut buf = content;
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }
        let raw_action = buf.try_get_u8()?;
        let action = ActionCode::try_from(raw_action)
            .map_err(|_| anyhow!("unknown action code {}", raw_action))?;
        let session_id = SessionId::from_raw(buf.try_get_u128()?);
        let sequence_number = buf.try_get_u64()?;
        let flags = buf.try_get_u8()?;

        let mut result = FrameHeaders::new(session_id, sequence_number, action);
        if flags & FLAG_ROUTING != 0 {
            let source = PartitionId::try_deser(&mut buf)?;
            let target = PartitionId::try_deser(&mut buf)?;
            result = result.with_routing(source, target);
        }
        if flags & FLAG_RESPONSE != 0 {
            let raw_result = buf.try_get_u8()?;
            let code = ResultCode::try_from(raw_result)
                .map_err(|_| anyhow!("unknown result code {}", raw_result))?;
            result = result.with_result(code);
        }
        if flags & FLAG_PARAMS != 0 {
            result = result.with_params(SessionParameters { window_size: buf.try_get_u32()? });
        }

        Ok((result, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn session_id() -> SessionId {
        SessionId::from_raw(0x0102)
    }

    #[test]
    fn test_ser_plain() {
        let frame = FrameHeaders::new(session_id(), 5, ActionCode::SendMessage)
            .ser_frame(b"hi")
            .unwrap();

        let mut expected = vec![1, 13, 0,0,0,0,0,0,0,0, 0,0,0,0,0,0,1,2, 0,0,0,0,0,0,0,5, 0, b'h', b'i'];
        let checksum = CRC.checksum(&expected);
        expected.extend_from_slice(&checksum.to_be_bytes());
        assert_eq!(frame.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::plain(FrameHeaders::new(session_id(), 0, ActionCode::SendMessageAck), b"".to_vec())]
    #[case::routing(FrameHeaders::new(session_id(), 0, ActionCode::OpenSessionRequest)
        .with_routing(PartitionId::new("source"), PartitionId::new("target")), b"".to_vec())]
    #[case::open_response(FrameHeaders::new(session_id(), 0, ActionCode::OpenSessionResponse)
        .with_routing(PartitionId::new("s"), PartitionId::new("t"))
        .with_result(ResultCode::Success)
        .with_params(SessionParameters { window_size: 17 }), b"".to_vec())]
    #[case::nack(FrameHeaders::new(session_id(), 99, ActionCode::SendMessageAck).with_result(ResultCode::PoolExceeded), b"".to_vec())]
    #[case::payload(FrameHeaders::new(session_id(), 3, ActionCode::SendMessage), b"hello".to_vec())]
    fn test_deser(#[case] headers: FrameHeaders, #[case] payload: Vec<u8>) {
        let frame = headers.ser_frame(&payload).unwrap();
        let (actual, actual_payload) = FrameHeaders::try_deser(&frame).unwrap();
        assert_eq!(actual, headers);
        assert_eq!(actual_payload, payload.as_slice());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::only_checksum(vec![0, 0, 0, 0])]
    fn test_deser_too_short(#[case] raw: Vec<u8>) {
        assert!(FrameHeaders::try_deser(&raw).is_err());
    }

    #[rstest]
    #[case::version(0)]
    #[case::action(1)]
    #[case::flags(26)]
    #[case::payload(27)]
    fn test_deser_corrupted(#[case] offset: usize) {
        let mut raw = FrameHeaders::new(session_id(), 1, ActionCode::SendMessage)
            .ser_frame(b"abc")
            .unwrap()
            .to_vec();
        raw[offset] ^= 0x40;
        assert!(FrameHeaders::try_deser(&raw).is_err());
    }

    #[rstest]
    #[case::unknown_version(vec![2, 13], "unsupported protocol version")]
    #[case::unknown_action(vec![1, 77], "unknown action code")]
    #[case::truncated_header(vec![1, 13, 0, 0], "")]
    fn test_deser_invalid_content(#[case] content: Vec<u8>, #[case] expected_msg: &str) {
        let mut raw = content;
        let checksum = CRC.checksum(&raw);
        raw.extend_from_slice(&checksum.to_be_bytes());

        let err = FrameHeaders::try_deser(&raw).unwrap_err();
        assert!(err.to_string().contains(expected_msg), "{}", err);
    }
}
