//! Version type tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::VersionError;

/// Release channel of a version level.
///
/// Declaration order is precedence order; the ordinal participates in
/// version comparison ahead of the version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionType {
    PreAlpha,
    Alpha,
    /// Also known as "preview".
    #[serde(alias = "preview")]
    PreBeta,
    Beta,
    PreRelease,
    Release,
}

impl VersionType {
    /// All types in precedence order.
    pub const ALL: [VersionType; 6] = [
        VersionType::PreAlpha,
        VersionType::Alpha,
        VersionType::PreBeta,
        VersionType::Beta,
        VersionType::PreRelease,
        VersionType::Release,
    ];

    /// Numeric precedence used in the comparison token stream.
    pub const fn ordinal(self) -> u64 {
        match self {
            VersionType::PreAlpha => 0,
            VersionType::Alpha => 1,
            VersionType::PreBeta => 2,
            VersionType::Beta => 3,
            VersionType::PreRelease => 4,
            VersionType::Release => 5,
        }
    }

    /// Short tag used by the plain and full string forms.
    pub const fn short_name(self) -> &'static str {
        match self {
            VersionType::PreAlpha => "pa",
            VersionType::Alpha => "a",
            VersionType::PreBeta => "pb",
            VersionType::Beta => "b",
            VersionType::PreRelease => "pr",
            VersionType::Release => "r",
        }
    }

    /// Human-readable name used by the extended string forms.
    pub const fn long_name(self) -> &'static str {
        match self {
            VersionType::PreAlpha => "pre-alpha",
            VersionType::Alpha => "alpha",
            VersionType::PreBeta => "pre-beta",
            VersionType::Beta => "beta",
            VersionType::PreRelease => "pre-release",
            VersionType::Release => "release",
        }
    }

    /// Looks up a type by its short tag.
    pub fn from_short_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.short_name() == s)
    }
}

impl fmt::Display for VersionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.long_name())
    }
}

impl FromStr for VersionType {
    type Err = VersionError;

    /// Accepts short tags, long names and the "preview" alias, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "preview" {
            return Ok(VersionType::PreBeta);
        }
        Self::ALL
            .into_iter()
            .find(|t| t.short_name() == lower || t.long_name() == lower)
            .ok_or_else(|| VersionError::UnknownType(s.to_string()))
    }
}
