//! Protocol version: `namespace:major.minor`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const NAMESPACE: &str = "dp";
pub const MAJOR: u16 = 4;
pub const MINOR: u16 = 21;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub namespace: String,
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid protocol version: {0:?}")]
pub struct ParseVersionError(String);

impl ProtocolVersion {
    pub fn new(namespace: impl Into<String>, major: u16, minor: u16) -> Self {
        Self {
            namespace: namespace.into(),
            major,
            minor,
        }
    }

    /// The version this server speaks
    pub fn current() -> Self {
        Self::new(NAMESPACE, MAJOR, MINOR)
    }

    /// Sessions can only be created and loaded with a compatible version
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.namespace == other.namespace && self.major == other.major
    }

    pub fn is_current(&self) -> bool {
        self.is_compatible(&Self::current())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.namespace, self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let (namespace, numbers) = s.split_once(':').ok_or_else(err)?;
        let (major, minor) = numbers.split_once('.').ok_or_else(err)?;
        if namespace.is_empty() || !namespace.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(err());
        }
        Ok(Self {
            namespace: namespace.to_string(),
            major: major.parse().map_err(|_| err())?,
            minor: minor.parse().map_err(|_| err())?,
        })
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats() {
        let v: ProtocolVersion = "dp:4.21".parse().unwrap();
        assert_eq!(v, ProtocolVersion::new("dp", 4, 21));
        assert_eq!(v.to_string(), "dp:4.21");
    }

    #[test]
    fn rejects_malformed() {
        for s in ["", "dp", "dp:4", "dp:x.1", ":4.1", "dp:4.1.2"] {
            assert!(s.parse::<ProtocolVersion>().is_err(), "{s}");
        }
    }

    #[test]
    fn compatibility_ignores_minor() {
        let current = ProtocolVersion::current();
        assert!(current.is_compatible(&ProtocolVersion::new("dp", MAJOR, 0)));
        assert!(!current.is_compatible(&ProtocolVersion::new("dp", MAJOR + 1, MINOR)));
        assert!(!current.is_compatible(&ProtocolVersion::new("xx", MAJOR, MINOR)));
    }
}
