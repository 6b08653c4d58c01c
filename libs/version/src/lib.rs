//! # subfleet-version
//!
//! Hierarchical, typed version identifiers for the subfleet controller and
//! host agent.
//!
//! ## Model
//!
//! A [`Version`] is a version string tagged with a [`VersionType`] and an
//! optional parent version. Chains qualify one version by another, e.g. a
//! platform release whose build carries a plugin pre-alpha:
//!
//! - `1.0.0/pa7` (plain form)
//! - `r1.0.0/pa7` (full form)
//! - `1.0.0 pre-alpha 7` (extended form)
//! - `release 1.0.0 pre-alpha 7` (full extended form)
//!
//! Level text that does not start with a digit is written after the tag and
//! a `:` when it would otherwise be misread, so `r:b1` is the release `b1`
//! and `b:rc1` the beta `rc1`. The plain and full forms parse back to the
//! same version.
//!
//! ## Ordering
//!
//! Versions are ordered by flattening each chain into a token stream, root
//! first. Every level contributes its type ordinal followed by the tokens
//! of its string, where a token is a number followed by an optional suffix
//! (`"1.2.0b3"` yields `1`, `2`, `0b`, `3`). Numbers compare numerically,
//! an unsuffixed token outranks a suffixed one with the same number
//! (`1.2 > 1.2b`), and suffixes compare lexically. Trailing zero tokens are
//! insignificant, so `1.0 == 1.0.0`.
//!
//! Equality is defined as the ordering yielding `Equal`; there is no
//! separate identity check.

mod error;
mod kind;
mod token;
mod version;

pub use error::VersionError;
pub use kind::VersionType;
pub use version::Version;
