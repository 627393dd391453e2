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

//! Object-store I/O for metadata files.
//!
//! The catalog layer only needs whole-object reads and writes addressed by
//! URI; concrete stores (S3, GCS, ...) plug in behind [`ObjectIO`]. The
//! in-memory and local-filesystem implementations here cover tests and
//! single-node use.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::file_util::persist_content_addressed_temp_file;

/// Failure of an object-store operation.
#[derive(Debug, Error)]
#[error("I/O failure on object {uri}")]
pub struct IoFailure {
    pub uri: String,
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl IoFailure {
    pub fn new(uri: impl Into<String>, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            uri: uri.into(),
            source: source.into(),
        }
    }
}

/// Whole-object reads and writes addressed by URI.
#[async_trait]
pub trait ObjectIO: Send + Sync + Debug {
    async fn write_object(&self, uri: &str, bytes: &[u8]) -> Result<(), IoFailure>;

    async fn read_object(&self, uri: &str) -> Result<Vec<u8>, IoFailure>;

    /// Whether this implementation can address `uri` at all.
    fn is_valid_uri(&self, uri: &str) -> bool;
}

/// Splits `scheme://rest` into its parts.
pub fn split_uri(uri: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    Some((scheme, rest))
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectIo {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reads: AtomicUsize,
}

impl MemoryObjectIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `read_object` calls, for asserting read
    /// deduplication.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.objects.lock().unwrap().contains_key(uri)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectIO for MemoryObjectIo {
    async fn write_object(&self, uri: &str, bytes: &[u8]) -> Result<(), IoFailure> {
        if !self.is_valid_uri(uri) {
            return Err(IoFailure::new(uri, "not a valid object URI"));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(uri.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_object(&self, uri: &str) -> Result<Vec<u8>, IoFailure> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| IoFailure::new(uri, "object not found"))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(bytes)
    }

    fn is_valid_uri(&self, uri: &str) -> bool {
        split_uri(uri).is_some()
    }
}

/// Object store over a local directory, for `file://` URIs.
#[derive(Debug)]
pub struct LocalFsObjectIo {
    root: PathBuf,
}

impl LocalFsObjectIo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf, IoFailure> {
        let (scheme, rest) = split_uri(uri).ok_or_else(|| IoFailure::new(uri, "malformed URI"))?;
        if scheme != "file" {
            return Err(IoFailure::new(uri, format!("unsupported scheme {scheme}")));
        }
        let relative = Path::new(rest.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            return Err(IoFailure::new(uri, "URI escapes the store root"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectIO for LocalFsObjectIo {
    async fn write_object(&self, uri: &str, bytes: &[u8]) -> Result<(), IoFailure> {
        let path = self.path_for(uri)?;
        let parent = path
            .parent()
            .ok_or_else(|| IoFailure::new(uri, "URI has no parent directory"))?;
        std::fs::create_dir_all(parent).map_err(|err| IoFailure::new(uri, err))?;
        let mut temp_file =
            NamedTempFile::new_in(parent).map_err(|err| IoFailure::new(uri, err))?;
        temp_file
            .write_all(bytes)
            .map_err(|err| IoFailure::new(uri, err))?;
        persist_content_addressed_temp_file(temp_file, &path)
            .map_err(|err| IoFailure::new(uri, err))?;
        Ok(())
    }

    async fn read_object(&self, uri: &str) -> Result<Vec<u8>, IoFailure> {
        let path = self.path_for(uri)?;
        std::fs::read(&path).map_err(|err| IoFailure::new(uri, err))
    }

    fn is_valid_uri(&self, uri: &str) -> bool {
        matches!(split_uri(uri), Some(("file", _)))
    }
}
