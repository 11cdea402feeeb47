use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Outcome of a session level operation (open, close, send, receive) as reported to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("protocol operation failed: retries exhausted without acknowledgement")]
    OperationFailed,

    #[error("operation canceled")]
    OperationCanceled,

    #[error("session not found")]
    SessionNotFound,

    #[error("session is not in a valid state for this operation")]
    InvalidState,

    #[error("session was closed")]
    ObjectClosed,

    #[error("no message available")]
    QueueEmpty,

    #[error("per-session operation quota exceeded")]
    QuotaExceeded,

    #[error("session was rejected by the peer")]
    Rejected,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<anyhow::Error> for SessionError {
    fn from(value: anyhow::Error) -> Self {
        SessionError::Transport(value.to_string())
    }
}

/// The result code carried on the wire in response headers and (negative) acks
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    SessionNotFound = 1,
    PoolExceeded = 2,
    InvalidState = 3,
    Rejected = 4,
    OperationFailed = 5,
}

impl ResultCode {
    pub fn into_result(self) -> Result<(), SessionError> {
        match self {
            ResultCode::Success => Ok(()),
            ResultCode::SessionNotFound => Err(SessionError::SessionNotFound),
            // a pool exceeded nack never completes an operation, it only shortens the sender's
            //  retry wait
            ResultCode::PoolExceeded => Err(SessionError::QuotaExceeded),
            ResultCode::InvalidState => Err(SessionError::InvalidState),
            ResultCode::Rejected => Err(SessionError::Rejected),
            ResultCode::OperationFailed => Err(SessionError::OperationFailed),
        }
    }

    pub fn from_result(result: &Result<(), SessionError>) -> ResultCode {
        match result {
            Ok(()) => ResultCode::Success,
            Err(SessionError::SessionNotFound) => ResultCode::SessionNotFound,
            Err(SessionError::InvalidState) | Err(SessionError::ObjectClosed) => ResultCode::InvalidState,
            Err(SessionError::Rejected) => ResultCode::Rejected,
            Err(SessionError::QuotaExceeded) => ResultCode::PoolExceeded,
            Err(_) => ResultCode::OperationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::success(ResultCode::Success, Ok(()))]
    #[case::not_found(ResultCode::SessionNotFound, Err(SessionError::SessionNotFound))]
    #[case::invalid_state(ResultCode::InvalidState, Err(SessionError::InvalidState))]
    #[case::rejected(ResultCode::Rejected, Err(SessionError::Rejected))]
    fn test_result_code_round_trip(#[case] code: ResultCode, #[case] expected: Result<(), SessionError>) {
        assert_eq!(code.into_result(), expected);
        assert_eq!(ResultCode::from_result(&expected), code);
    }

    #[rstest]
    #[case::canceled(SessionError::OperationCanceled)]
    #[case::out_of_memory(SessionError::OutOfMemory)]
    #[case::transport(SessionError::Transport("x".to_string()))]
    fn test_local_errors_map_to_operation_failed(#[case] error: SessionError) {
        assert_eq!(ResultCode::from_result(&Err(error)), ResultCode::OperationFailed);
    }

    #[test]
    fn test_unknown_result_code() {
        assert!(ResultCode::try_from(99u8).is_err());
    }
}
