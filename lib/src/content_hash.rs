// Copyright 2023 The Icevault Authors
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

//! Portable, stable hashing of objects, used for deriving object ids.
//!
//! The canonical byte stream is deterministic by construction: struct fields
//! are hashed in declaration order, strings and collections are
//! length-prefixed, integers are big-endian, and enum variants carry a
//! discriminant prefix. Map iteration order never leaks into the stream
//! because only `BTreeMap` is hashable.

use std::collections::BTreeMap;

use sha2::Digest as _;
use sha2::Sha256;

pub use digest::Update as DigestUpdate;

/// Portably hashable value. The canonical byte stream fed to `state` fully
/// determines the object id.
pub trait ContentHash {
    /// Feeds the canonical bytes of `self` to `state`.
    fn hash(&self, state: &mut impl DigestUpdate);
}

/// Computes the SHA-256 hash of `tag` followed by the canonical bytes of `x`.
///
/// The domain tag keeps ids of distinct object kinds from colliding even if
/// their canonical bytes happen to be equal.
pub fn hash_with_tag(tag: &str, x: &(impl ContentHash + ?Sized)) -> Vec<u8> {
    let mut hasher = Sha256::new();
    tag.hash(&mut hasher);
    x.hash(&mut hasher);
    hasher.finalize().to_vec()
}

/// Derives a stable id from a domain tag and ordered field bytes.
///
/// Unlike [`hash_with_tag`], this works on pre-extracted field bytes, so a
/// caller can derive an id from a few fields of a stored object without
/// loading the object body.
pub fn derived_id(tag: &str, fields: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    tag.hash(&mut hasher);
    for field in fields {
        digest::Update::update(&mut hasher, &(field.len() as u64).to_be_bytes());
        digest::Update::update(&mut hasher, field);
    }
    hasher.finalize().to_vec()
}

impl ContentHash for () {
    fn hash(&self, _state: &mut impl DigestUpdate) {}
}

impl ContentHash for bool {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&[u8::from(*self)]);
    }
}

impl ContentHash for u8 {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&[*self]);
    }
}

macro_rules! impl_content_hash_for_int {
    ($ty:ty) => {
        impl ContentHash for $ty {
            fn hash(&self, state: &mut impl DigestUpdate) {
                state.update(&self.to_be_bytes());
            }
        }
    };
}

impl_content_hash_for_int!(i32);
impl_content_hash_for_int!(i64);
impl_content_hash_for_int!(u32);
impl_content_hash_for_int!(u64);

impl ContentHash for str {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&(self.len() as u64).to_be_bytes());
        state.update(self.as_bytes());
    }
}

impl ContentHash for String {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.as_str().hash(state);
    }
}

impl<T: ContentHash> ContentHash for Option<T> {
    fn hash(&self, state: &mut impl DigestUpdate) {
        match self {
            None => state.update(&[0]),
            Some(x) => {
                state.update(&[1]);
                x.hash(state);
            }
        }
    }
}

impl<T: ContentHash> ContentHash for [T] {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&(self.len() as u64).to_be_bytes());
        for x in self {
            x.hash(state);
        }
    }
}

impl<T: ContentHash> ContentHash for Vec<T> {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.as_slice().hash(state);
    }
}

impl<T: ContentHash + ?Sized> ContentHash for &T {
    fn hash(&self, state: &mut impl DigestUpdate) {
        (*self).hash(state);
    }
}

impl<K: ContentHash, V: ContentHash> ContentHash for BTreeMap<K, V> {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&(self.len() as u64).to_be_bytes());
        for (k, v) in self {
            k.hash(state);
            v.hash(state);
        }
    }
}

// Expands to a `ContentHash` impl hashing the named fields in the given
// order. The declaration-site field list keeps the canonical stream stable
// even if the struct definition is reordered.
macro_rules! impl_content_hash {
    ($name:ident { $($field:ident),* $(,)? }) => {
        impl $crate::content_hash::ContentHash for $name {
            fn hash(&self, state: &mut impl $crate::content_hash::DigestUpdate) {
                $( $crate::content_hash::ContentHash::hash(&self.$field, state); )*
            }
        }
    };
}

pub(crate) use impl_content_hash;

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    fn hash(x: &impl ContentHash) -> Vec<u8> {
        let mut hasher = Sha256::new();
        x.hash(&mut hasher);
        hasher.finalize().to_vec()
    }

    #[test]
    fn test_string_length_prefix() {
        // Adjacent strings must not be able to share a boundary.
        assert_ne!(
            hash(&vec!["ab".to_string(), "c".to_string()]),
            hash(&vec!["a".to_string(), "bc".to_string()])
        );
    }

    #[test]
    fn test_option() {
        assert_ne!(hash(&None::<String>), hash(&Some(String::new())));
    }

    #[test]
    fn test_map_deterministic() {
        let map1 = btreemap! {
            "a".to_string() => 1_u32,
            "b".to_string() => 2_u32,
        };
        let map2: BTreeMap<String, u32> = map1.clone().into_iter().rev().collect();
        assert_eq!(hash(&map1), hash(&map2));
    }

    #[test]
    fn test_domain_tag() {
        assert_ne!(
            hash_with_tag("Commit", &42_u64),
            hash_with_tag("Segment", &42_u64)
        );
    }

    #[test]
    fn test_derived_id_is_pure() {
        let a = derived_id("ContentSnapshot", &[b"s3://wh/t1/v0.json", &1_i64.to_be_bytes()]);
        let b = derived_id("ContentSnapshot", &[b"s3://wh/t1/v0.json", &1_i64.to_be_bytes()]);
        assert_eq!(a, b);
        let c = derived_id("ContentSnapshot", &[b"s3://wh/t1/v0.json", &2_i64.to_be_bytes()]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_derived_id_field_boundaries() {
        assert_ne!(
            derived_id("T", &[b"ab", b"c"]),
            derived_id("T", &[b"a", b"bc"])
        );
    }
}
