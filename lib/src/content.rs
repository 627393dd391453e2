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

//! Typed content payloads stored at catalog keys.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::content_hash::ContentHash;
use crate::content_hash::DigestUpdate;
use crate::content_hash::impl_content_hash;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;

id_type!(
    /// Identifier of a stored [`ContentValue`] blob, the hash of its
    /// canonical bytes.
    pub PayloadId
);

/// Stable identity of a logical catalog entity.
///
/// Assigned when a key is first put and preserved across updates to the same
/// entity, so the entity can be tracked through renames and metadata
/// rewrites. Distinct from [`PayloadId`], which changes with every update.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ContentId(Uuid);

impl ContentId {
    /// Creates a fresh, random content id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0.hyphenated().to_string())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentId")
            .field(&self.0.hyphenated().to_string())
            .finish()
    }
}

impl ContentHash for ContentId {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.0.as_bytes().as_slice().hash(state);
    }
}

/// Discriminant of the [`Content`] sum type, stored in key-index entries so
/// listings can report types without loading payloads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    IcebergTable,
    IcebergView,
    Namespace,
    Udf,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IcebergTable => "iceberg-table",
            Self::IcebergView => "iceberg-view",
            Self::Namespace => "namespace",
            Self::Udf => "udf",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl ContentHash for ContentType {
    fn hash(&self, state: &mut impl DigestUpdate) {
        (*self as u32).hash(state);
    }
}

/// Pointer to the current Iceberg table metadata file, plus the ids a reader
/// needs to pick the active schema, partition spec, and sort order without
/// parsing the file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IcebergTable {
    pub metadata_location: String,
    pub snapshot_id: i64,
    pub schema_id: i32,
    pub spec_id: i32,
    pub sort_order_id: i32,
}

impl_content_hash!(IcebergTable {
    metadata_location,
    snapshot_id,
    schema_id,
    spec_id,
    sort_order_id,
});

/// Pointer to the current Iceberg view metadata file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IcebergView {
    pub metadata_location: String,
    pub version_id: i64,
    pub schema_id: i32,
}

impl_content_hash!(IcebergView {
    metadata_location,
    version_id,
    schema_id,
});

/// A namespace level in the key hierarchy, with free-form properties.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Namespace {
    pub properties: BTreeMap<String, String>,
}

impl_content_hash!(Namespace { properties });

/// A user-defined function body.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Udf {
    pub dialect: String,
    pub body: String,
}

impl_content_hash!(Udf { dialect, body });

/// Typed content payload. A closed sum type keeps the key-index segment
/// encoding stable; new formats get new variants rather than subclasses.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Content {
    IcebergTable(IcebergTable),
    IcebergView(IcebergView),
    Namespace(Namespace),
    Udf(Udf),
}

impl Content {
    pub fn content_type(&self) -> ContentType {
        match self {
            Self::IcebergTable(_) => ContentType::IcebergTable,
            Self::IcebergView(_) => ContentType::IcebergView,
            Self::Namespace(_) => ContentType::Namespace,
            Self::Udf(_) => ContentType::Udf,
        }
    }
}

impl ContentHash for Content {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.content_type().hash(state);
        match self {
            Self::IcebergTable(table) => table.hash(state),
            Self::IcebergView(view) => view.hash(state),
            Self::Namespace(namespace) => namespace.hash(state),
            Self::Udf(udf) => udf.hash(state),
        }
    }
}

/// A content blob as stored: the stable entity id plus the typed payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContentValue {
    pub id: ContentId,
    pub content: Content,
}

impl_content_hash!(ContentValue { id, content });

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_hash::hash_with_tag;

    fn table(location: &str) -> Content {
        Content::IcebergTable(IcebergTable {
            metadata_location: location.to_string(),
            snapshot_id: 1,
            schema_id: 0,
            spec_id: 0,
            sort_order_id: 0,
        })
    }

    #[test]
    fn test_content_type_tags() {
        assert_eq!(
            table("s3://wh/t/v0.json").content_type(),
            ContentType::IcebergTable
        );
        assert_eq!(
            Content::Namespace(Namespace::default()).content_type(),
            ContentType::Namespace
        );
    }

    #[test]
    fn test_content_serde_round_trip() {
        let value = ContentValue {
            id: ContentId::random(),
            content: table("s3://wh/db/t/v0.json"),
        };
        let json = serde_json::to_vec(&value).unwrap();
        let decoded: ContentValue = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_payload_hash_changes_with_body() {
        let id = ContentId::random();
        let a = ContentValue {
            id,
            content: table("s3://wh/t/v0.json"),
        };
        let b = ContentValue {
            id,
            content: table("s3://wh/t/v1.json"),
        };
        assert_ne!(hash_with_tag("Content", &a), hash_with_tag("Content", &b));
    }
}
