//! MQTT v5.0 reason codes
//!
//! One unified code space for CONNACK, DISCONNECT and AUTH, with the
//! fixed mapping down to MQTT v3.x CONNACK return codes.

use std::fmt;

/// MQTT v5.0 Reason Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReasonCode {
    /// Success / Normal disconnection / Granted QoS 0
    #[default]
    Success = 0x00,
    /// Continue authentication
    ContinueAuthentication = 0x18,
    /// Re-authenticate
    ReAuthenticate = 0x19,
    /// Unspecified error
    UnspecifiedError = 0x80,
    /// Malformed Packet
    MalformedPacket = 0x81,
    /// Protocol Error
    ProtocolError = 0x82,
    /// Implementation specific error
    ImplementationError = 0x83,
    /// Unsupported Protocol Version
    UnsupportedProtocolVersion = 0x84,
    /// Client Identifier not valid
    ClientIdNotValid = 0x85,
    /// Bad User Name or Password
    BadUserNameOrPassword = 0x86,
    /// Not authorized
    NotAuthorized = 0x87,
    /// Server unavailable
    ServerUnavailable = 0x88,
    /// Server busy
    ServerBusy = 0x89,
    /// Banned
    Banned = 0x8A,
    /// Server shutting down
    ServerShuttingDown = 0x8B,
    /// Bad authentication method
    BadAuthenticationMethod = 0x8C,
    /// Keep Alive timeout
    KeepAliveTimeout = 0x8D,
    /// Session taken over
    SessionTakenOver = 0x8E,
    /// Topic Filter invalid
    TopicFilterInvalid = 0x8F,
    /// Topic Name invalid
    TopicNameInvalid = 0x90,
    /// Receive Maximum exceeded
    ReceiveMaxExceeded = 0x93,
    /// Topic Alias invalid
    TopicAliasInvalid = 0x94,
    /// Packet too large
    PacketTooLarge = 0x95,
    /// Message rate too high
    MessageRateTooHigh = 0x96,
    /// Quota exceeded
    QuotaExceeded = 0x97,
    /// Administrative action
    AdministrativeAction = 0x98,
    /// Payload format invalid
    PayloadFormatInvalid = 0x99,
    /// Retain not supported
    RetainNotSupported = 0x9A,
    /// QoS not supported
    QoSNotSupported = 0x9B,
    /// Use another server
    UseAnotherServer = 0x9C,
    /// Server moved
    ServerMoved = 0x9D,
    /// Shared Subscriptions not supported
    SharedSubsNotSupported = 0x9E,
    /// Connection rate exceeded
    ConnectionRateExceeded = 0x9F,
    /// Maximum connect time
    MaximumConnectTime = 0xA0,
    /// Subscription Identifiers not supported
    SubIdNotSupported = 0xA1,
    /// Wildcard Subscriptions not supported
    WildcardSubsNotSupported = 0xA2,
}

impl ReasonCode {
    /// Check if this reason code indicates success
    #[inline]
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }

    /// Check if this reason code indicates failure
    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }

    /// Convert to the MQTT v3.x CONNACK return code
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0x00,
            ReasonCode::UnsupportedProtocolVersion => 0x01,
            ReasonCode::ClientIdNotValid => 0x02,
            ReasonCode::ServerUnavailable | ReasonCode::ServerBusy => 0x03,
            ReasonCode::BadUserNameOrPassword => 0x04,
            // Everything else collapses to "not authorized" in v3
            _ => 0x05,
        }
    }

    /// Narrow an arbitrary (e.g. DISCONNECT) reason code to one that is
    /// legal on a CONNACK, or `None` if it has no CONNACK counterpart.
    pub fn for_connack(self) -> Option<ReasonCode> {
        match self {
            ReasonCode::Success
            | ReasonCode::UnspecifiedError
            | ReasonCode::MalformedPacket
            | ReasonCode::ProtocolError
            | ReasonCode::ImplementationError
            | ReasonCode::UnsupportedProtocolVersion
            | ReasonCode::ClientIdNotValid
            | ReasonCode::BadUserNameOrPassword
            | ReasonCode::NotAuthorized
            | ReasonCode::ServerUnavailable
            | ReasonCode::ServerBusy
            | ReasonCode::Banned
            | ReasonCode::BadAuthenticationMethod
            | ReasonCode::TopicNameInvalid
            | ReasonCode::PacketTooLarge
            | ReasonCode::QuotaExceeded
            | ReasonCode::PayloadFormatInvalid
            | ReasonCode::RetainNotSupported
            | ReasonCode::QoSNotSupported
            | ReasonCode::UseAnotherServer
            | ReasonCode::ServerMoved
            | ReasonCode::ConnectionRateExceeded => Some(self),
            ReasonCode::ServerShuttingDown => Some(ReasonCode::ServerUnavailable),
            ReasonCode::TopicFilterInvalid => Some(ReasonCode::TopicNameInvalid),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonCode::Success => "Success",
            ReasonCode::ContinueAuthentication => "Continue authentication",
            ReasonCode::ReAuthenticate => "Re-authenticate",
            ReasonCode::UnspecifiedError => "Unspecified error",
            ReasonCode::MalformedPacket => "Malformed Packet",
            ReasonCode::ProtocolError => "Protocol Error",
            ReasonCode::ImplementationError => "Implementation specific error",
            ReasonCode::UnsupportedProtocolVersion => "Unsupported Protocol Version",
            ReasonCode::ClientIdNotValid => "Client Identifier not valid",
            ReasonCode::BadUserNameOrPassword => "Bad User Name or Password",
            ReasonCode::NotAuthorized => "Not authorized",
            ReasonCode::ServerUnavailable => "Server unavailable",
            ReasonCode::ServerBusy => "Server busy",
            ReasonCode::Banned => "Banned",
            ReasonCode::ServerShuttingDown => "Server shutting down",
            ReasonCode::BadAuthenticationMethod => "Bad authentication method",
            ReasonCode::KeepAliveTimeout => "Keep Alive timeout",
            ReasonCode::SessionTakenOver => "Session taken over",
            ReasonCode::TopicFilterInvalid => "Topic Filter invalid",
            ReasonCode::TopicNameInvalid => "Topic Name invalid",
            ReasonCode::ReceiveMaxExceeded => "Receive Maximum exceeded",
            ReasonCode::TopicAliasInvalid => "Topic Alias invalid",
            ReasonCode::PacketTooLarge => "Packet too large",
            ReasonCode::MessageRateTooHigh => "Message rate too high",
            ReasonCode::QuotaExceeded => "Quota exceeded",
            ReasonCode::AdministrativeAction => "Administrative action",
            ReasonCode::PayloadFormatInvalid => "Payload format invalid",
            ReasonCode::RetainNotSupported => "Retain not supported",
            ReasonCode::QoSNotSupported => "QoS not supported",
            ReasonCode::UseAnotherServer => "Use another server",
            ReasonCode::ServerMoved => "Server moved",
            ReasonCode::SharedSubsNotSupported => "Shared Subscriptions not supported",
            ReasonCode::ConnectionRateExceeded => "Connection rate exceeded",
            ReasonCode::MaximumConnectTime => "Maximum connect time",
            ReasonCode::SubIdNotSupported => "Subscription Identifiers not supported",
            ReasonCode::WildcardSubsNotSupported => "Wildcard Subscriptions not supported",
        };
        f.write_str(s)
    }
}

/// Acknowledgement verdicts an extension authorizer can attach to the
/// will publish of a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReasonCode {
    Success,
    NoMatchingSubscribers,
    UnspecifiedError,
    ImplementationSpecificError,
    NotAuthorized,
    TopicNameInvalid,
    PacketIdentifierInUse,
    QuotaExceeded,
    PayloadFormatInvalid,
}

impl AckReasonCode {
    /// Map to the CONNACK reason code used when the will is denied
    pub fn to_connack_code(self) -> ReasonCode {
        match self {
            AckReasonCode::Success | AckReasonCode::NoMatchingSubscribers => ReasonCode::Success,
            AckReasonCode::UnspecifiedError => ReasonCode::UnspecifiedError,
            AckReasonCode::ImplementationSpecificError => ReasonCode::ImplementationError,
            AckReasonCode::NotAuthorized => ReasonCode::NotAuthorized,
            AckReasonCode::TopicNameInvalid => ReasonCode::TopicNameInvalid,
            AckReasonCode::PacketIdentifierInUse => ReasonCode::UnspecifiedError,
            AckReasonCode::QuotaExceeded => ReasonCode::QuotaExceeded,
            AckReasonCode::PayloadFormatInvalid => ReasonCode::PayloadFormatInvalid,
        }
    }
}
