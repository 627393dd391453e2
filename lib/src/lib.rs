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

#![warn(missing_docs)]

//! Engine library for icevault, a transactional, Git-like catalog and
//! versioned metadata store for tabular data.
//!
//! Clients read and write typed content addressed by a branch, tag, or
//! commit hash. Every change is recorded as an immutable commit in a
//! content-addressed DAG. The [`version_store`] module is the main entry
//! point for commits, merges, and reads; the [`catalog`] module layers
//! Iceberg table/view snapshot handling on top of it.

pub mod backend;
pub mod backoff;
pub mod catalog;
pub mod clock;
pub mod commit;
pub mod content;
pub mod content_hash;
pub mod content_key;
pub mod dag_walk;
pub mod error;
pub mod file_util;
pub mod hex_util;
pub mod iceberg;
pub mod key_index;
pub mod memory_backend;
pub mod merge;
pub mod object_id;
pub mod object_io;
pub mod refs;
pub mod repo;
pub mod store;
pub mod task_cache;
pub mod version_store;
