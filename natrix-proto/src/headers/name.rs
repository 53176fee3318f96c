use std::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;

/// A string that can be used as a header name
///
/// `HeaderName` contains a string that is guaranteed [^1] to
/// meet the following requirements:
///
/// * The value is not empty
/// * The value has a length less than or equal to 64 [^2]
/// * The value does not contain `:`, whitespace or control bytes
/// * The value is stored in canonical form: ASCII title-case
///   per hyphen-separated segment (`nats-msg-id` becomes `Nats-Msg-Id`)
///
/// All constructors canonicalize, so two names differing only in
/// case compare equal and serialize identically on the wire.
///
/// [^1]: Because [`HeaderName::from_dangerous_value`] is safe to call,
///       unsafe code must not assume any of the above invariants.
/// [^2]: Names coming from the server are allowed to violate the
///       length rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderName(ByteString);

impl HeaderName {
    /// Construct `HeaderName` from a static string
    ///
    /// # Panics
    ///
    /// Will panic if `value` isn't a valid `HeaderName`
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        match validate_header_name(value) {
            Ok(()) if is_canonical(value) => Self(ByteString::from_static(value)),
            Ok(()) => Self(canonicalize(value)),
            Err(err) => panic!("HeaderName {value:?} isn't valid {err:?}"),
        }
    }

    /// Construct a `HeaderName` from a string, without checking invariants
    ///
    /// This method bypasses the validation and canonicalization
    /// implemented by [`HeaderName::from_static`] and all `TryFrom`
    /// implementations. The value must already be canonical.
    ///
    /// # Security
    ///
    /// While calling this method can eliminate the runtime cost of
    /// checking the string, sending an invalid header name to the
    /// server can cause serious security issues. When in doubt use
    /// [`HeaderName::from_static`] or any of the `TryFrom` implementations.
    #[expect(
        clippy::missing_panics_doc,
        reason = "the header validation is only made in debug"
    )]
    #[must_use]
    pub fn from_dangerous_value(value: ByteString) -> Self {
        if cfg!(debug_assertions) {
            if let Err(err) = validate_header_name(&value) {
                panic!("HeaderName {value:?} isn't valid {err:?}");
            }
        }
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl TryFrom<ByteString> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_header_name(&value)?;
        if is_canonical(&value) {
            Ok(Self(value))
        } else {
            Ok(Self(canonicalize(&value)))
        }
    }
}

impl TryFrom<String> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ByteString::from(value).try_into()
    }
}

impl TryFrom<&str> for HeaderName {
    type Error = HeaderNameValidateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ByteString::from(value).try_into()
    }
}

impl From<HeaderName> for ByteString {
    fn from(value: HeaderName) -> Self {
        value.0
    }
}

impl AsRef<[u8]> for HeaderName {
    fn as_ref(&self) -> &[u8] {
        self.as_str().as_bytes()
    }
}

impl AsRef<str> for HeaderName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for HeaderName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// An error encountered while validating [`HeaderName`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum HeaderNameValidateError {
    /// The value is empty
    #[error("HeaderName is empty")]
    Empty,
    /// The value has a length greater than 64
    #[error("HeaderName is too long")]
    TooLong,
    /// The value contains `:`, whitespace or a control byte
    #[error("HeaderName contained an illegal character")]
    IllegalCharacter,
}

fn validate_header_name(header_name: &str) -> Result<(), HeaderNameValidateError> {
    if header_name.is_empty() {
        return Err(HeaderNameValidateError::Empty);
    }

    if header_name.len() > 64 {
        // This is an arbitrary limit, but the server must also have one
        return Err(HeaderNameValidateError::TooLong);
    }

    if header_name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == ':')
    {
        return Err(HeaderNameValidateError::IllegalCharacter);
    }

    Ok(())
}

fn is_canonical(header_name: &str) -> bool {
    header_name.split('-').all(|segment| {
        let mut chars = segment.chars();
        chars.next().map_or(true, |first| !first.is_ascii_lowercase())
            && chars.all(|c| !c.is_ascii_uppercase())
    })
}

fn canonicalize(header_name: &str) -> ByteString {
    let mut canonical = String::with_capacity(header_name.len());
    for (i, segment) in header_name.split('-').enumerate() {
        if i > 0 {
            canonical.push('-');
        }

        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            canonical.push(first.to_ascii_uppercase());
        }
        for c in chars {
            canonical.push(c.to_ascii_lowercase());
        }
    }
    canonical.into()
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{HeaderName, HeaderNameValidateError};

    #[test]
    fn canonicalizes() {
        let cases = [
            ("nats-msg-id", "Nats-Msg-Id"),
            ("NATS-MSG-ID", "Nats-Msg-Id"),
            ("Nats-Msg-Id", "Nats-Msg-Id"),
            ("content-type", "Content-Type"),
            ("x", "X"),
            ("-x", "-X"),
        ];
        for (input, expected) in cases {
            assert_eq!(expected, HeaderName::try_from(input).unwrap().as_str());
        }
    }

    #[test]
    fn eq_after_canonicalization() {
        let cased = HeaderName::try_from("Nats-Message-Id").unwrap();
        let lowercase = HeaderName::try_from("nats-message-id").unwrap();
        assert_eq!(cased, lowercase);
        assert_eq!(cased.cmp(&lowercase), Ordering::Equal);
    }

    #[test]
    fn invalid_names() {
        let names = [
            ("", HeaderNameValidateError::Empty),
            (
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                HeaderNameValidateError::TooLong,
            ),
            ("X:bad", HeaderNameValidateError::IllegalCharacter),
            ("X bad", HeaderNameValidateError::IllegalCharacter),
            ("X\tbad", HeaderNameValidateError::IllegalCharacter),
            ("X\rbad", HeaderNameValidateError::IllegalCharacter),
            ("X\nbad", HeaderNameValidateError::IllegalCharacter),
            ("X\u{0}bad", HeaderNameValidateError::IllegalCharacter),
        ];
        for (name, expected_err) in names {
            assert_eq!(expected_err, HeaderName::try_from(name).unwrap_err());
        }
    }
}
