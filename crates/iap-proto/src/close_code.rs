//! WebSocket close codes used by the relay

/// Close code sent by the relay (or the client) when a WebSocket ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    ErrorUnknown,
    SidUnknown,
    SidInUse,
    FailedToConnectToBackend,
    ReauthenticationRequired,
    BadAck,
    InvalidAck,
    InvalidWebsocketOpcode,
    InvalidTag,
    DestinationWriteFailed,
    DestinationReadFailed,
    InvalidData,
    NotAuthorized,
    LookupFailed,
    LookupFailedReconnect,
    Other(u16),
}

/// What the client should do after a close with a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Session ended normally
    Graceful,
    /// Transient drop, reconnect with the same session
    Retry,
    /// Reconnect after fetching a fresh credential
    Reauthenticate,
    /// Credential rejected or caller not authorized for the target
    AuthenticationFailed,
    /// Relay cannot route to the target
    TargetUnreachable,
    /// The relay no longer knows the session
    SessionLost,
    /// Peer violated the framing protocol
    Protocol,
    /// The connection between relay and target failed
    Destination,
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            4000 => CloseCode::ErrorUnknown,
            4001 => CloseCode::SidUnknown,
            4002 => CloseCode::SidInUse,
            4003 => CloseCode::FailedToConnectToBackend,
            4004 => CloseCode::ReauthenticationRequired,
            4005 => CloseCode::BadAck,
            4006 => CloseCode::InvalidAck,
            4007 => CloseCode::InvalidWebsocketOpcode,
            4008 => CloseCode::InvalidTag,
            4009 => CloseCode::DestinationWriteFailed,
            4010 => CloseCode::DestinationReadFailed,
            4013 => CloseCode::InvalidData,
            4033 => CloseCode::NotAuthorized,
            4047 => CloseCode::LookupFailed,
            4051 => CloseCode::LookupFailedReconnect,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::ErrorUnknown => 4000,
            CloseCode::SidUnknown => 4001,
            CloseCode::SidInUse => 4002,
            CloseCode::FailedToConnectToBackend => 4003,
            CloseCode::ReauthenticationRequired => 4004,
            CloseCode::BadAck => 4005,
            CloseCode::InvalidAck => 4006,
            CloseCode::InvalidWebsocketOpcode => 4007,
            CloseCode::InvalidTag => 4008,
            CloseCode::DestinationWriteFailed => 4009,
            CloseCode::DestinationReadFailed => 4010,
            CloseCode::InvalidData => 4013,
            CloseCode::NotAuthorized => 4033,
            CloseCode::LookupFailed => 4047,
            CloseCode::LookupFailedReconnect => 4051,
            CloseCode::Other(other) => other,
        }
    }
}

impl CloseCode {
    pub fn disposition(self) -> CloseDisposition {
        match self {
            CloseCode::Normal => CloseDisposition::Graceful,
            CloseCode::ErrorUnknown => CloseDisposition::Retry,
            CloseCode::ReauthenticationRequired => CloseDisposition::Reauthenticate,
            CloseCode::NotAuthorized => CloseDisposition::AuthenticationFailed,
            CloseCode::FailedToConnectToBackend
            | CloseCode::LookupFailed
            | CloseCode::LookupFailedReconnect => CloseDisposition::TargetUnreachable,
            CloseCode::SidUnknown | CloseCode::SidInUse => CloseDisposition::SessionLost,
            CloseCode::BadAck
            | CloseCode::InvalidAck
            | CloseCode::InvalidWebsocketOpcode
            | CloseCode::InvalidTag
            | CloseCode::InvalidData => CloseDisposition::Protocol,
            CloseCode::DestinationWriteFailed | CloseCode::DestinationReadFailed => {
                CloseDisposition::Destination
            }
            // Going away, abnormal closure, internal error and anything unknown
            CloseCode::Other(_) => CloseDisposition::Retry,
        }
    }
}
