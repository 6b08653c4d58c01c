//! Comparison tokens.

use std::cmp::Ordering;

/// One comparable unit of a version stream: a number and its suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Token<'a> {
    pub number: u64,
    pub suffix: &'a str,
}

impl Token<'_> {
    /// Value an exhausted stream is padded with.
    pub const ZERO: Token<'static> = Token {
        number: 0,
        suffix: "",
    };

    pub fn is_zero(&self) -> bool {
        self.number == 0 && self.suffix.is_empty()
    }
}

impl Ord for Token<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number.cmp(&other.number).then_with(|| {
            match (self.suffix.is_empty(), other.suffix.is_empty()) {
                (true, true) => Ordering::Equal,
                // 1.2 > 1.2b
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.suffix.cmp(other.suffix),
            }
        })
    }
}

impl PartialOrd for Token<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Splits a version string into tokens.
///
/// A token is a run of ASCII digits (missing means zero) followed by a run
/// of anything that is neither a digit nor `.`. A `.` only terminates a
/// token.
pub(crate) struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { rest: input }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let digits_end = self
            .rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        let number = self.rest[..digits_end]
            .bytes()
            .fold(0u64, |acc, b| {
                acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
            });

        let after_digits = &self.rest[digits_end..];
        let suffix_end = after_digits
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_digits.len());
        let suffix = &after_digits[..suffix_end];

        let mut rest = &after_digits[suffix_end..];
        if let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
        }
        self.rest = rest;

        Some(Token { number, suffix })
    }
}
