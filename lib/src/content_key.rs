// Copyright 2024 The Icevault Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Hierarchical keys addressing catalog content.

use std::fmt;
use std::fmt::Display;

use thiserror::Error;

use crate::content_hash::ContentHash;
use crate::content_hash::DigestUpdate;

/// Maximum number of elements in a key.
pub const MAX_ELEMENTS: usize = 20;
/// Maximum total length of a key in bytes, counting separators.
pub const MAX_KEY_BYTES: usize = 500;

/// Error returned when constructing a [`ContentKey`] from invalid input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidContentKey {
    #[error("Content key must have at least one element")]
    Empty,
    #[error("Content key must have at most {MAX_ELEMENTS} elements")]
    TooManyElements,
    #[error("Content key must be at most {MAX_KEY_BYTES} bytes")]
    TooLong,
    #[error("Content key elements must be non-empty")]
    EmptyElement,
    #[error("Content key element contains forbidden character: {0:?}")]
    ForbiddenCharacter(char),
}

/// An ordered, case-sensitive tuple of non-empty path elements identifying a
/// catalog entity (namespace path plus leaf name).
///
/// Keys order element-wise, so `["db", "z"]` sorts before `["db2", "a"]`
/// even though the dotted renderings compare the other way.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContentKey {
    elements: Vec<String>,
}

impl ContentKey {
    /// Creates a key from path elements, validating the adapter limits.
    pub fn new(
        elements: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, InvalidContentKey> {
        let elements: Vec<String> = elements.into_iter().map(Into::into).collect();
        if elements.is_empty() {
            return Err(InvalidContentKey::Empty);
        }
        if elements.len() > MAX_ELEMENTS {
            return Err(InvalidContentKey::TooManyElements);
        }
        let total: usize = elements.iter().map(|e| e.len() + 1).sum::<usize>() - 1;
        if total > MAX_KEY_BYTES {
            return Err(InvalidContentKey::TooLong);
        }
        for element in &elements {
            if element.is_empty() {
                return Err(InvalidContentKey::EmptyElement);
            }
            if let Some(ch) = element.chars().find(|&ch| ch == '.' || ch.is_control()) {
                return Err(InvalidContentKey::ForbiddenCharacter(ch));
            }
        }
        Ok(Self { elements })
    }

    /// Parses a dotted rendering such as `db.table1`.
    pub fn parse_dotted(s: &str) -> Result<Self, InvalidContentKey> {
        Self::new(s.split('.'))
    }

    /// The path elements.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// The leaf name (last element).
    pub fn name(&self) -> &str {
        self.elements.last().unwrap()
    }

    /// The namespace path (all elements but the last).
    pub fn namespace(&self) -> &[String] {
        &self.elements[..self.elements.len() - 1]
    }

    /// Whether `self` equals `prefix` or lives below it.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.elements.len() >= prefix.elements.len()
            && self.elements[..prefix.elements.len()] == prefix.elements[..]
    }
}

impl Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.elements.join("."))
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentKey")
            .field(&self.elements.join("."))
            .finish()
    }
}

impl ContentHash for ContentKey {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.elements.hash(state);
    }
}
