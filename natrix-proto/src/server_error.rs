use bytestring::ByteString;

/// An error reported by the server through the `-ERR` command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("subject is invalid")]
    InvalidSubject,
    #[error("permissions violation for publish")]
    PublishPermissionViolation,
    #[error("permissions violation for subscription")]
    SubscribePermissionViolation,

    #[error("unknown protocol operation")]
    UnknownProtocolOperation,

    #[error("attempted to connect to route port")]
    ConnectionAttemptedToWrongPort,

    #[error("authorization violation")]
    AuthorizationViolation,
    #[error("authorization timeout")]
    AuthorizationTimeout,
    #[error("invalid client protocol")]
    InvalidClientProtocol,
    #[error("maximum control line exceeded")]
    MaximumControlLineExceeded,
    #[error("parser error")]
    ParseError,
    #[error("secure connection, tls required")]
    TlsRequired,
    #[error("stale connection")]
    StaleConnection,
    #[error("maximum connections exceeded")]
    MaximumConnectionsExceeded,
    #[error("slow consumer")]
    SlowConsumer,
    #[error("maximum payload violation")]
    MaximumPayloadViolation,

    #[error("server entering lame duck mode")]
    LameDuckMode,

    #[error("unknown error: {raw_message}")]
    Other { raw_message: ByteString },
}

impl ServerError {
    /// Whether this error terminates the connection
    ///
    /// `Some(true)` errors close the connection without a reconnect
    /// attempt. Authorization failures, permission violations, stale
    /// connections and slow-consumer kicks all fall in this group.
    /// `Some(false)` errors leave the connection live. `None` means
    /// the classification is unknown.
    pub fn is_fatal(&self) -> Option<bool> {
        match self {
            Self::InvalidSubject | Self::LameDuckMode => Some(false),

            Self::PublishPermissionViolation
            | Self::SubscribePermissionViolation
            | Self::UnknownProtocolOperation
            | Self::ConnectionAttemptedToWrongPort
            | Self::AuthorizationViolation
            | Self::AuthorizationTimeout
            | Self::InvalidClientProtocol
            | Self::MaximumControlLineExceeded
            | Self::ParseError
            | Self::TlsRequired
            | Self::StaleConnection
            | Self::MaximumConnectionsExceeded
            | Self::SlowConsumer
            | Self::MaximumPayloadViolation => Some(true),

            Self::Other { .. } => None,
        }
    }

    /// Whether this error signals that the server is being evicted
    /// and clients should reconnect elsewhere
    pub fn is_lame_duck(&self) -> bool {
        matches!(self, Self::LameDuckMode)
    }

    pub(crate) fn parse(raw_message: ByteString) -> Self {
        const PUBLISH_PERMISSIONS: &str = "Permissions Violation for Publish";
        const SUBSCRIPTION_PERMISSIONS: &str = "Permissions Violation for Subscription";
        const LAME_DUCK: &str = "Lame Duck Mode";

        let m = raw_message.trim();
        if m.eq_ignore_ascii_case("Invalid Subject") {
            Self::InvalidSubject
        } else if m.len() > PUBLISH_PERMISSIONS.len()
            && m[..PUBLISH_PERMISSIONS.len()].eq_ignore_ascii_case(PUBLISH_PERMISSIONS)
        {
            Self::PublishPermissionViolation
        } else if m.len() > SUBSCRIPTION_PERMISSIONS.len()
            && m[..SUBSCRIPTION_PERMISSIONS.len()].eq_ignore_ascii_case(SUBSCRIPTION_PERMISSIONS)
        {
            Self::SubscribePermissionViolation
        } else if m.eq_ignore_ascii_case("Unknown Protocol Operation") {
            Self::UnknownProtocolOperation
        } else if m.eq_ignore_ascii_case("Attempted To Connect To Route Port") {
            Self::ConnectionAttemptedToWrongPort
        } else if m.eq_ignore_ascii_case("Authorization Violation") {
            Self::AuthorizationViolation
        } else if m.eq_ignore_ascii_case("Authorization Timeout") {
            Self::AuthorizationTimeout
        } else if m.eq_ignore_ascii_case("Invalid Client Protocol") {
            Self::InvalidClientProtocol
        } else if m.eq_ignore_ascii_case("Maximum Control Line Exceeded") {
            Self::MaximumControlLineExceeded
        } else if m.eq_ignore_ascii_case("Parser Error") {
            Self::ParseError
        } else if m.eq_ignore_ascii_case("Secure Connection - TLS Required") {
            Self::TlsRequired
        } else if m.eq_ignore_ascii_case("Stale Connection") {
            Self::StaleConnection
        } else if m.eq_ignore_ascii_case("Maximum Connections Exceeded") {
            Self::MaximumConnectionsExceeded
        } else if m.eq_ignore_ascii_case("Slow Consumer") {
            Self::SlowConsumer
        } else if m.eq_ignore_ascii_case("Maximum Payload Violation") {
            Self::MaximumPayloadViolation
        } else if m
            .as_bytes()
            .windows(LAME_DUCK.len())
            .any(|w| w.eq_ignore_ascii_case(LAME_DUCK.as_bytes()))
        {
            Self::LameDuckMode
        } else {
            Self::Other { raw_message }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::ServerError;

    #[test]
    fn classifies_fatal() {
        let err = ServerError::parse(ByteString::from_static("Authorization Violation"));
        assert_eq!(ServerError::AuthorizationViolation, err);
        assert_eq!(Some(true), err.is_fatal());

        let err = ServerError::parse(ByteString::from_static("Stale Connection"));
        assert_eq!(ServerError::StaleConnection, err);
        assert_eq!(Some(true), err.is_fatal());

        // Permission violations tear the connection down as well
        let err = ServerError::parse(ByteString::from_static(
            "Permissions Violation for Publish to \"greet\"",
        ));
        assert_eq!(ServerError::PublishPermissionViolation, err);
        assert_eq!(Some(true), err.is_fatal());

        let err = ServerError::parse(ByteString::from_static(
            "Permissions Violation for Subscription to \"greet\"",
        ));
        assert_eq!(ServerError::SubscribePermissionViolation, err);
        assert_eq!(Some(true), err.is_fatal());
    }

    #[test]
    fn classifies_transient() {
        let err = ServerError::parse(ByteString::from_static("Invalid Subject"));
        assert_eq!(ServerError::InvalidSubject, err);
        assert_eq!(Some(false), err.is_fatal());
    }

    #[test]
    fn detects_lame_duck() {
        let err = ServerError::parse(ByteString::from_static("Server Entering Lame Duck Mode"));
        assert!(err.is_lame_duck());
        assert_eq!(Some(false), err.is_fatal());
    }

    #[test]
    fn unknown_is_preserved() {
        let err = ServerError::parse(ByteString::from_static("Something Novel"));
        assert_eq!(
            ServerError::Other {
                raw_message: ByteString::from_static("Something Novel")
            },
            err
        );
        assert_eq!(None, err.is_fatal());
    }
}
