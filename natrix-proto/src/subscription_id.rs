use std::fmt::{self, Display};

use crate::util::{self, ParseUintError};

/// A client-local subscription identifier
///
/// Allocated by the client, carried on `SUB`/`UNSUB` and echoed back
/// by the server on every `MSG`/`HMSG` so deliveries can be routed to
/// the right subscription. Identifiers are only meaningful within the
/// connection that allocated them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// The smallest valid identifier
    pub const MIN: Self = SubscriptionId(1);
    /// The largest representable identifier
    ///
    /// An allocator reaching this value has exhausted the id space.
    pub const MAX: Self = SubscriptionId(u64::MAX);

    /// Converts a slice of ASCII digits to a `SubscriptionId`.
    ///
    /// This is how the id arrives on the wire, as one chunk of a
    /// `MSG`/`HMSG` control line.
    ///
    /// # Errors
    ///
    /// It returns an error if the bytes do not contain a valid numeric value.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, ParseUintError> {
        util::parse_u64(buf).map(Self)
    }
}

impl From<u64> for SubscriptionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SubscriptionId> for u64 {
    fn from(value: SubscriptionId) -> Self {
        value.0
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok_eq};

    use super::SubscriptionId;

    #[test]
    fn wire_round_trip() {
        for id in [1, 42, 512, u64::from(u32::MAX), u64::MAX] {
            let s = SubscriptionId::from(id).to_string();
            assert_ok_eq!(
                SubscriptionId::from_ascii_bytes(s.as_bytes()),
                SubscriptionId::from(id)
            );
        }
    }

    #[test]
    fn rejects_invalid_chunks() {
        assert_err!(SubscriptionId::from_ascii_bytes(b"12a"));
        assert_err!(SubscriptionId::from_ascii_bytes(b"-1"));
        assert_err!(SubscriptionId::from_ascii_bytes(b" 1"));
        // One past u64::MAX
        assert_err!(SubscriptionId::from_ascii_bytes(b"18446744073709551616"));
    }
}
