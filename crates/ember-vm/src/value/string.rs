// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! String heap type.

use core::fmt;
use std::borrow::Cow;

/// An immutable Ember string.
///
/// Strings are UTF-8 text. Lengths and indexing are byte-granular:
/// `sizeof` reports the byte length and the `[]` operator yields byte
/// values. Type names and other baked-in text are borrowed `'static`
/// rather than copied.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Str {
    text: Cow<'static, str>,
}

impl Str {
    /// Create a string, copying the text.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Cow::Owned(text.into()),
        }
    }

    /// Create a string borrowing static text.
    #[must_use]
    pub const fn from_static(text: &'static str) -> Self {
        Self {
            text: Cow::Borrowed(text),
        }
    }

    /// The text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Byte length of the text.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Check if the string is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The byte at `idx`; `None` when out of bounds.
    #[inline]
    #[must_use]
    pub fn byte(&self, idx: usize) -> Option<u8> {
        self.text.as_bytes().get(idx).copied()
    }

    /// Concatenate two strings into a new one.
    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        let mut text = String::with_capacity(self.len() + other.len());
        text.push_str(self.as_str());
        text.push_str(other.as_str());
        Self::new(text)
    }
}

impl fmt::Debug for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.text)
    }
}

impl fmt::Display for Str {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
