//! The `Version` type and its ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::kind::VersionType;
use crate::token::{Token, Tokenizer};
use crate::VersionError;

/// Separates an explicit type tag from level text that would otherwise be
/// misread, e.g. `r:b1` for the release `b1`.
const TAG_SEPARATOR: char = ':';

/// A typed version string, optionally qualified by a parent version.
///
/// Immutable once constructed. Ordering and equality follow the token
/// stream rules described at the crate root.
#[derive(Debug, Clone)]
pub struct Version {
    parent: Option<Box<Version>>,
    kind: VersionType,
    string: String,
}

impl Version {
    /// Creates a release version.
    pub fn new(string: impl Into<String>) -> Self {
        Self::typed(VersionType::Release, string)
    }

    /// Creates a version of the given type.
    pub fn typed(kind: VersionType, string: impl Into<String>) -> Self {
        Self {
            parent: None,
            kind,
            string: string.into(),
        }
    }

    /// Creates a version qualified by `parent`.
    pub fn with_parent(parent: Version, kind: VersionType, string: impl Into<String>) -> Self {
        Self {
            parent: Some(Box::new(parent)),
            kind,
            string: string.into(),
        }
    }

    /// Creates a version by joining numeric components with dots.
    pub fn from_numbers(kind: VersionType, numbers: &[u64]) -> Result<Self, VersionError> {
        if numbers.is_empty() {
            return Err(VersionError::NoComponents);
        }
        let string = numbers
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Ok(Self::typed(kind, string))
    }

    /// Parses the plain or full string form.
    ///
    /// Levels are separated by `/`. A level may be prefixed with a short
    /// type tag (`pa`, `a`, `pb`, `b`, `pr`, `r`) directly followed by a
    /// digit, or by `:` and arbitrary text; levels without a tag are
    /// releases. Level text cannot contain `/`.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if s.trim().is_empty() {
            return Err(VersionError::Empty);
        }

        let mut current: Option<Version> = None;
        for (position, segment) in s.trim().split('/').enumerate() {
            if segment.is_empty() {
                return Err(VersionError::EmptySegment {
                    input: s.to_string(),
                    position,
                });
            }
            let (kind, string) = split_type_tag(segment);
            current = Some(Version {
                parent: current.map(Box::new),
                kind,
                string: string.to_string(),
            });
        }

        current.ok_or(VersionError::Empty)
    }

    /// The parent version, if any.
    pub fn parent(&self) -> Option<&Version> {
        self.parent.as_deref()
    }

    /// The type of this level.
    pub fn kind(&self) -> VersionType {
        self.kind
    }

    /// The version string of this level.
    pub fn as_str(&self) -> &str {
        &self.string
    }

    /// Full form, every level tagged: `r1.0.0/pa7`.
    pub fn to_full_string(&self) -> String {
        let mut level = String::new();
        // Writing into a String cannot fail.
        let _ = write_level(&mut level, self.kind, &self.string, true);
        match &self.parent {
            Some(parent) => format!("{}/{}", parent.to_full_string(), level),
            None => level,
        }
    }

    /// Extended form, root type omitted: `1.0.0 pre-alpha 7`.
    pub fn to_extended_string(&self) -> String {
        match &self.parent {
            Some(parent) => format!(
                "{} {} {}",
                parent.to_extended_string(),
                self.kind.long_name(),
                self.string
            ),
            None => self.string.clone(),
        }
    }

    /// Full extended form: `release 1.0.0 pre-alpha 7`.
    pub fn to_full_extended_string(&self) -> String {
        let level = format!("{} {}", self.kind.long_name(), self.string);
        match &self.parent {
            Some(parent) => format!("{} {}", parent.to_full_extended_string(), level),
            None => level,
        }
    }

    /// Flattens the chain into comparison tokens, root level first.
    fn tokens(&self) -> Vec<Token<'_>> {
        let mut levels = Vec::new();
        let mut level = Some(self);
        while let Some(v) = level {
            levels.push(v);
            level = v.parent();
        }

        let mut tokens = Vec::new();
        for v in levels.into_iter().rev() {
            tokens.push(Token {
                number: v.kind.ordinal(),
                suffix: "",
            });
            tokens.extend(Tokenizer::new(&v.string));
        }
        tokens
    }
}

/// Splits an optional short type tag off a level of the string form.
fn split_type_tag(segment: &str) -> (VersionType, &str) {
    if let Some((tag, rest)) = segment.split_once(TAG_SEPARATOR) {
        if let Some(kind) = VersionType::from_short_name(tag) {
            return (kind, rest);
        }
    }

    let tag_end = segment
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(segment.len());
    let (tag, rest) = segment.split_at(tag_end);

    if rest.starts_with(|c: char| c.is_ascii_digit()) {
        if let Some(kind) = VersionType::from_short_name(tag) {
            return (kind, rest);
        }
    }
    (VersionType::Release, segment)
}

/// Writes one level so that [`split_type_tag`] reads it back unchanged.
/// The tag of a release is omitted unless `tagged` is set.
fn write_level(
    out: &mut impl fmt::Write,
    kind: VersionType,
    text: &str,
    tagged: bool,
) -> fmt::Result {
    if !tagged && kind == VersionType::Release && split_type_tag(text) == (kind, text) {
        return out.write_str(text);
    }
    if text.starts_with(|c: char| c.is_ascii_digit()) {
        write!(out, "{}{}", kind.short_name(), text)
    } else {
        write!(out, "{}{}{}", kind.short_name(), TAG_SEPARATOR, text)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let left = self.tokens();
        let right = other.tokens();

        // An exhausted stream is padded with zero tokens, which makes
        // trailing zeros insignificant.
        for i in 0..left.len().max(right.len()) {
            let a = left.get(i).unwrap_or(&Token::ZERO);
            let b = right.get(i).unwrap_or(&Token::ZERO);
            match a.cmp(b) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut tokens = self.tokens();
        while tokens.last().is_some_and(Token::is_zero) {
            tokens.pop();
        }
        tokens.hash(state);
    }
}

impl fmt::Display for Version {
    /// Plain form, root type omitted: `1.0.0/pa7`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}/")?;
        }
        write_level(f, self.kind, &self.string, self.parent.is_some())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_full_string())
    }
}

impl<'de> serde::Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
