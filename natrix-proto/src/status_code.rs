use std::{
    fmt::{self, Display, Formatter},
    num::NonZeroU16,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::util;

/// A NATS status code
///
/// Constants are provided for the status codes the server is known
/// to produce.
///
/// Values are guaranteed to be in range `100..1000`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(NonZeroU16);

impl StatusCode {
    /// The request has successfully been sent
    pub const OK: StatusCode = Self::new_internal(200);
    /// The requested resource doesn't exist
    pub const NOT_FOUND: StatusCode = Self::new_internal(404);
    /// The server-side operation reached its timeout
    pub const TIMEOUT: StatusCode = Self::new_internal(408);
    /// The request was sent to a subject that does not appear to have any subscribers listening
    pub const NO_RESPONDERS: StatusCode = Self::new_internal(503);

    /// Decodes a status code from a slice of ASCII characters.
    ///
    /// The ASCII representation is expected to be in the form of `"NNN"`, where `N` is a numeric
    /// digit.
    ///
    /// # Errors
    ///
    /// It returns an error if the slice of bytes does not contain a valid status code.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, StatusCodeError> {
        if buf.len() != 3 {
            return Err(StatusCodeError);
        }

        util::parse_u16(buf)
            .map_err(|_| StatusCodeError)?
            .try_into()
            .map(Self)
            .map_err(|_| StatusCodeError)
    }

    const fn new_internal(val: u16) -> Self {
        match NonZeroU16::new(val) {
            Some(val) => Self(val),
            None => unreachable!(),
        }
    }
}

impl FromStr for StatusCode {
    type Err = StatusCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ascii_bytes(s.as_bytes())
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = StatusCodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if (100..1000).contains(&value) {
            Ok(Self(NonZeroU16::new(value).unwrap()))
        } else {
            Err(StatusCodeError)
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(value: StatusCode) -> Self {
        value.0.get()
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        u16::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u16::deserialize(deserializer)?;
        n.try_into().map_err(de::Error::custom)
    }
}

/// An error encountered while parsing [`StatusCode`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("invalid status code")]
pub struct StatusCodeError;
