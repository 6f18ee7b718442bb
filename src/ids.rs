use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Opaque session token.
///
/// Fresh sessions get a ULID, but any client-presented token is accepted as-is.
/// Comparison is ASCII case-insensitive, so the token is stored lower-cased.
#[derive(Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct SessionId(String);

/// Error returned when parsing an empty or malformed session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSessionId;

impl Display for InvalidSessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid session id")
    }
}

impl std::error::Error for InvalidSessionId {}

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string().to_ascii_lowercase())
    }

    /// Use the presented token when it parses, otherwise mint a new one.
    #[must_use]
    pub fn from_client_or_new(token: Option<&str>) -> Self {
        token
            .and_then(|s| s.parse::<SessionId>().ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    /// Tokens end up as directory names when sessions are persisted, so only
    /// a conservative character set is allowed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty()
            || s.len() > 128
            || !s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(InvalidSessionId);
        }
        Ok(SessionId(s.to_ascii_lowercase()))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<SessionId>()
            .map_err(|_| serde::de::Error::custom("invalid session id"))
    }
}
