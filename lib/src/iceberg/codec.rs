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

//! The codec boundary between the catalog layer and Iceberg's metadata
//! JSON.

use std::fmt::Debug;

use thiserror::Error;

use crate::iceberg::metadata::TableMetadata;
use crate::iceberg::metadata::ViewMetadata;

/// Codec failure. Surfaces to callers as an internal error: metadata files
/// the catalog itself wrote must always parse.
#[derive(Debug, Error)]
#[error("Iceberg metadata codec failure")]
pub struct CodecError {
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            source: Box::new(err),
        }
    }
}

/// Serializes and deserializes Iceberg metadata documents.
pub trait IcebergCodec: Send + Sync + Debug {
    fn serialize_table(&self, metadata: &TableMetadata) -> Result<Vec<u8>, CodecError>;
    fn deserialize_table(&self, bytes: &[u8]) -> Result<TableMetadata, CodecError>;
    fn serialize_view(&self, metadata: &ViewMetadata) -> Result<Vec<u8>, CodecError>;
    fn deserialize_view(&self, bytes: &[u8]) -> Result<ViewMetadata, CodecError>;
}

/// The standard JSON codec.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl IcebergCodec for JsonCodec {
    fn serialize_table(&self, metadata: &TableMetadata) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec_pretty(metadata)?)
    }

    fn deserialize_table(&self, bytes: &[u8]) -> Result<TableMetadata, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_view(&self, metadata: &ViewMetadata) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec_pretty(metadata)?)
    }

    fn deserialize_view(&self, bytes: &[u8]) -> Result<ViewMetadata, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
