use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Tag on every frame identifying the protocol step it represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ActionCode {
    OpenSessionRequest = 1,
    OpenSessionResponse = 2,
    OpenSessionRequestAck = 3,
    OpenSessionResponseAck = 4,
    CloseSessionRequest = 5,
    CloseSessionResponse = 6,
    CloseSessionRequestAck = 7,
    CloseSessionResponseAck = 8,
    AbortInboundSessionRequest = 9,
    AbortInboundSessionRequestAck = 10,
    AbortOutboundSessionRequest = 11,
    AbortOutboundSessionRequestAck = 12,
    SendMessage = 13,
    SendMessageAck = 14,
}

/// The path an inbound frame takes through the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    /// completes a waiting protocol operation inline
    AckFastPath,
    /// application content and its acks, handled inline against the session directory
    ContentFastPath,
    /// requests and responses that need directory mutation or session manager callbacks
    Deferred,
}

impl ActionCode {
    pub fn dispatch_path(self) -> DispatchPath {
        use ActionCode::*;

        match self {
            OpenSessionRequestAck | OpenSessionResponseAck |
            CloseSessionRequestAck | CloseSessionResponseAck |
            AbortInboundSessionRequestAck | AbortOutboundSessionRequestAck => DispatchPath::AckFastPath,
            SendMessage | SendMessageAck => DispatchPath::ContentFastPath,
            OpenSessionRequest | OpenSessionResponse |
            CloseSessionRequest | CloseSessionResponse |
            AbortInboundSessionRequest | AbortOutboundSessionRequest => DispatchPath::Deferred,
        }
    }

    /// The acknowledgement a receiver sends for a frame with this action code, `None` for acks
    pub fn ack_code(self) -> Option<ActionCode> {
        use ActionCode::*;

        match self {
            OpenSessionRequest => Some(OpenSessionRequestAck),
            OpenSessionResponse => Some(OpenSessionResponseAck),
            CloseSessionRequest => Some(CloseSessionRequestAck),
            CloseSessionResponse => Some(CloseSessionResponseAck),
            AbortInboundSessionRequest => Some(AbortInboundSessionRequestAck),
            AbortOutboundSessionRequest => Some(AbortOutboundSessionRequestAck),
            SendMessage => Some(SendMessageAck),
            _ => None,
        }
    }

    /// Open-protocol frames carry the source / target partition routing header
    pub fn carries_routing(self) -> bool {
        matches!(self, ActionCode::OpenSessionRequest | ActionCode::OpenSessionResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActionCode::*;
    use rstest::rstest;

    #[rstest]
    #[case::open_req(OpenSessionRequest, DispatchPath::Deferred, Some(OpenSessionRequestAck))]
    #[case::open_resp(OpenSessionResponse, DispatchPath::Deferred, Some(OpenSessionResponseAck))]
    #[case::open_req_ack(OpenSessionRequestAck, DispatchPath::AckFastPath, None)]
    #[case::open_resp_ack(OpenSessionResponseAck, DispatchPath::AckFastPath, None)]
    #[case::close_req(CloseSessionRequest, DispatchPath::Deferred, Some(CloseSessionRequestAck))]
    #[case::close_resp(CloseSessionResponse, DispatchPath::Deferred, Some(CloseSessionResponseAck))]
    #[case::close_req_ack(CloseSessionRequestAck, DispatchPath::AckFastPath, None)]
    #[case::close_resp_ack(CloseSessionResponseAck, DispatchPath::AckFastPath, None)]
    #[case::abort_in(AbortInboundSessionRequest, DispatchPath::Deferred, Some(AbortInboundSessionRequestAck))]
    #[case::abort_in_ack(AbortInboundSessionRequestAck, DispatchPath::AckFastPath, None)]
    #[case::abort_out(AbortOutboundSessionRequest, DispatchPath::Deferred, Some(AbortOutboundSessionRequestAck))]
    #[case::abort_out_ack(AbortOutboundSessionRequestAck, DispatchPath::AckFastPath, None)]
    #[case::send(SendMessage, DispatchPath::ContentFastPath, Some(SendMessageAck))]
    #[case::send_ack(SendMessageAck, DispatchPath::ContentFastPath, None)]
    fn test_classification(#[case] code: ActionCode, #[case] path: DispatchPath, #[case] ack: Option<ActionCode>) {
        assert_eq!(code.dispatch_path(), path);
        assert_eq!(code.ack_code(), ack);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::above(15)]
    #[case::max(255)]
    fn test_unknown_code(#[case] raw: u8) {
        assert!(ActionCode::try_from(raw).is_err());
    }
}
