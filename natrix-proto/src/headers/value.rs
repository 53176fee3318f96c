use std::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;

/// A string that can be used as a header value
///
/// `HeaderValue` contains a string that is guaranteed [^1] to
/// meet the following requirements:
///
/// * The value is not empty
/// * The value has a length less than or equal to 1024 [^2]
/// * The value does not contain CR, LF or any other control byte
///
/// Interior spaces are allowed. `HeaderValue` can be constructed
/// from [`HeaderValue::from_static`] or any of the `TryFrom`
/// implementations.
///
/// [^1]: Because [`HeaderValue::from_dangerous_value`] is safe to call,
///       unsafe code must not assume any of the above invariants.
/// [^2]: Values coming from the server are allowed to violate the
///       length rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderValue(ByteString);

impl HeaderValue {
    /// Construct `HeaderValue` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `HeaderValue`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid HeaderValue")
    }

    /// Construct a `HeaderValue` from a string, without checking invariants
    ///
    /// This method bypasses the invariant checks implemented by
    /// [`HeaderValue::from_static`] and all `TryFrom` implementations.
    ///
    /// # Security
    ///
    /// While calling this method can eliminate the runtime cost of
    /// validating the string, sending an invalid header value to the
    /// server can cause serious security issues. When in doubt use
    /// [`HeaderValue::from_static`] or any of the `TryFrom`
    /// implementations.
    #[must_use]
    #[expect(
        clippy::missing_panics_doc,
        reason = "the header validation is only made in debug"
    )]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate_header_value(&value) {
                panic!("HeaderValue {value:?} isn't valid {err:?}");
            }
        }
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for HeaderValue {
    type Error = HeaderValueValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_header_value(&value)?;
        Ok(Self::from_dangerous_value(value))
    }
}

impl TryFrom<String> for HeaderValue {
    type Error = HeaderValueValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_header_value(&value)?;
        Ok(Self::from_dangerous_value(value.into()))
    }
}

impl TryFrom<&str> for HeaderValue {
    type Error = HeaderValueValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_header_value(value)?;
        Ok(Self::from_dangerous_value(value.into()))
    }
}

impl From<HeaderValue> for ByteString {
    fn from(value: HeaderValue) -> Self {
        value.0
    }
}

impl AsRef<[u8]> for HeaderValue {
    fn as_ref(&self) -> &[u8] {
        self.as_str().as_bytes()
    }
}

impl AsRef<str> for HeaderValue {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for HeaderValue {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// An error encountered while validating [`HeaderValue`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum HeaderValueValidateError {
    /// The value is empty
    #[error("HeaderValue is empty")]
    Empty,
    /// The value has a length greater than 1024
    #[error("HeaderValue is too long")]
    TooLong,
    /// The value contains CR, LF or another control byte
    #[error("HeaderValue contained an illegal character")]
    IllegalCharacter,
}

fn validate_header_value(header_value: &str) -> Result<(), HeaderValueValidateError> {
    if header_value.is_empty() {
        return Err(HeaderValueValidateError::Empty);
    }

    if header_value.len() > 1024 {
        // This is an arbitrary limit, but the server must also have one
        return Err(HeaderValueValidateError::TooLong);
    }

    if header_value.chars().any(char::is_control) {
        // CR and LF would break the header block framing
        return Err(HeaderValueValidateError::IllegalCharacter);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{HeaderValue, HeaderValueValidateError};

    #[test]
    fn valid_values() {
        let values = ["abcd", "1", "No Responders", "2024-01-01T00:00:00Z"];
        for value in values {
            assert_eq!(value, HeaderValue::try_from(value).unwrap().as_str());
        }
    }

    #[test]
    fn invalid_values() {
        let values = [
            ("", HeaderValueValidateError::Empty),
            ("bad\nvalue", HeaderValueValidateError::IllegalCharacter),
            ("bad\rvalue", HeaderValueValidateError::IllegalCharacter),
            ("bad\r\nvalue", HeaderValueValidateError::IllegalCharacter),
            ("bad\tvalue", HeaderValueValidateError::IllegalCharacter),
        ];
        for (value, expected_err) in values {
            assert_eq!(expected_err, HeaderValue::try_from(value).unwrap_err());
        }
    }
}
