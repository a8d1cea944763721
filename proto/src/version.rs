// Copyright (c) 2024-2025 The Keyfort Developers

//! Firmware version reporting and comparison

use core::fmt::{self, Display};
use core::str::FromStr;

/// Semantic firmware version as reported in the hello exchange.
///
/// Ordering is lexicographic over (major, minor, patch) so capability
/// thresholds can be expressed as plain comparisons.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
}

impl FirmwareVersion {
    /// Create a firmware version from parts
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error parsing a firmware version string
#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
#[error("malformed version string")]
pub struct VersionParseError;

impl FromStr for FirmwareVersion {
    type Err = VersionParseError;

    /// Parse a `major.minor.patch` version string, tolerating a `v` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('v').unwrap_or(s);

        let mut parts = s.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or(VersionParseError)
        };

        let v = Self::new(next()?, next()?, next()?);

        match parts.next() {
            Some(_) => Err(VersionParseError),
            None => Ok(v),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(
            "2.4.1".parse(),
            Ok(FirmwareVersion::new(2, 4, 1))
        );
        assert_eq!(
            "v9.15.0".parse(),
            Ok(FirmwareVersion::new(9, 15, 0))
        );

        assert_eq!(
            "2.4".parse::<FirmwareVersion>(),
            Err(VersionParseError)
        );
        assert_eq!(
            "2.4.1.7".parse::<FirmwareVersion>(),
            Err(VersionParseError)
        );
        assert_eq!(
            "2.x.1".parse::<FirmwareVersion>(),
            Err(VersionParseError)
        );
    }

    #[test]
    fn ordering() {
        let v210 = FirmwareVersion::new(2, 1, 0);

        assert!(FirmwareVersion::new(2, 0, 9) < v210);
        assert!(FirmwareVersion::new(2, 1, 1) > v210);
        assert!(FirmwareVersion::new(1, 9, 9) < v210);
        assert!(FirmwareVersion::new(3, 0, 0) > v210);
        assert!(v210 >= FirmwareVersion::new(2, 1, 0));
    }

    #[test]
    fn display_round_trip() {
        let v = FirmwareVersion::new(2, 4, 1);
        assert_eq!(v.to_string(), "2.4.1");
        assert_eq!(v.to_string().parse(), Ok(v));
    }
}
