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

use std::collections::BTreeMap;

use chrono::TimeZone as _;
use thiserror::Error;

use crate::content::ContentId;
use crate::content::ContentType;
use crate::content::PayloadId;
use crate::content_hash::ContentHash;
use crate::content_hash::DigestUpdate;
use crate::content_hash::impl_content_hash;
use crate::content_key::ContentKey;
use crate::key_index::SegmentId;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;

id_type!(
    /// Identifier for a [`Commit`], the hash of its canonical bytes.
    pub CommitId
);

#[derive(Debug, Error)]
#[error("Out-of-range date")]
pub struct TimestampOutOfRange;

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            timestamp: MillisSinceEpoch(datetime.timestamp_millis()),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }

    pub fn to_datetime(
        &self,
    ) -> Result<chrono::DateTime<chrono::FixedOffset>, TimestampOutOfRange> {
        let utc = match chrono::Utc.timestamp_opt(
            self.timestamp.0.div_euclid(1000),
            (self.timestamp.0.rem_euclid(1000)) as u32 * 1000000,
        ) {
            chrono::LocalResult::None => {
                return Err(TimestampOutOfRange);
            }
            chrono::LocalResult::Single(x) => x,
            chrono::LocalResult::Ambiguous(y, _z) => y,
        };

        Ok(utc.with_timezone(
            &chrono::FixedOffset::east_opt(self.tz_offset * 60)
                .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap()),
        ))
    }
}

impl ContentHash for MillisSinceEpoch {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.0.hash(state);
    }
}

impl_content_hash!(Timestamp { timestamp, tz_offset });

/// Represents a [`Commit`] signature.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize, serde::Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub timestamp: Timestamp,
}

impl_content_hash!(Signature {
    name,
    email,
    timestamp,
});

/// The effect a commit has on a single key.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OperationKind {
    /// Stores a content payload at the key.
    Put {
        content_id: ContentId,
        content_type: ContentType,
        payload: PayloadId,
    },
    /// Removes the key.
    Delete,
    /// Records the key in the log without changing it.
    Unchanged,
}

impl ContentHash for OperationKind {
    fn hash(&self, state: &mut impl DigestUpdate) {
        match self {
            Self::Put {
                content_id,
                content_type,
                payload,
            } => {
                0_u32.hash(state);
                content_id.hash(state);
                content_type.hash(state);
                payload.hash(state);
            }
            Self::Delete => 1_u32.hash(state),
            Self::Unchanged => 2_u32.hash(state),
        }
    }
}

/// A keyed operation recorded by a commit. At most one operation per key is
/// permitted within a commit.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommitOperation {
    pub key: ContentKey,
    #[serde(flatten)]
    pub kind: OperationKind,
}

impl_content_hash!(CommitOperation { key, kind });

/// Immutable node in the version DAG.
///
/// `parents[0]` is the logical predecessor; additional parents encode
/// merges. The key index reachable from `index_root` reflects the cumulative
/// effect of operations from the root commit. A commit references its
/// parents by id only; traversal is always from a head backward.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    pub parents: Vec<CommitId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    pub operations: Vec<CommitOperation>,
    pub index_root: Option<SegmentId>,
    pub metadata: BTreeMap<String, String>,
}

impl_content_hash!(Commit {
    parents,
    author,
    committer,
    message,
    operations,
    index_root,
    metadata,
});

/// The commit every repository starts from: no parents, no operations, an
/// empty key index.
pub fn make_root_commit() -> Commit {
    let timestamp = Timestamp {
        timestamp: MillisSinceEpoch(0),
        tz_offset: 0,
    };
    let signature = Signature {
        name: String::new(),
        email: String::new(),
        timestamp,
    };
    Commit {
        parents: vec![],
        author: signature.clone(),
        committer: signature,
        message: String::new(),
        operations: vec![],
        index_root: None,
        metadata: BTreeMap::new(),
    }
}
