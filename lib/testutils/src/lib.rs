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

//! Builders for fully wired test repositories.

use std::sync::Arc;

use icevault_lib::catalog::CatalogConfig;
use icevault_lib::catalog::CatalogService;
use icevault_lib::clock::FakeClock;
use icevault_lib::commit::MillisSinceEpoch;
use icevault_lib::commit::Signature;
use icevault_lib::commit::Timestamp;
use icevault_lib::content::Content;
use icevault_lib::content::ContentId;
use icevault_lib::content::ContentValue;
use icevault_lib::content::IcebergTable;
use icevault_lib::content::Namespace;
use icevault_lib::content_key::ContentKey;
use icevault_lib::iceberg::codec::JsonCodec;
use icevault_lib::memory_backend::MemoryBackend;
use icevault_lib::object_io::MemoryObjectIo;
use icevault_lib::refs::RefNameBuf;
use icevault_lib::repo::RepoConfig;
use icevault_lib::store::Store;
use icevault_lib::task_cache::TaskCacheConfig;
use icevault_lib::version_store::VersionStore;
use pollster::FutureExt as _;
use tempfile::TempDir;

pub const TEST_EPOCH_MS: i64 = 1_700_000_000_000;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("icevault-test-")
        .tempdir()
        .unwrap()
}

/// A deterministic signature for test commits.
pub fn test_signature() -> Signature {
    Signature {
        name: "Test User".to_string(),
        email: "test.user@example.com".to_string(),
        timestamp: Timestamp {
            timestamp: MillisSinceEpoch(TEST_EPOCH_MS),
            tz_offset: 0,
        },
    }
}

pub fn content_key(dotted: &str) -> ContentKey {
    ContentKey::parse_dotted(dotted).unwrap()
}

/// A table content blob with a fresh content id.
pub fn table_content(metadata_location: &str, snapshot_id: i64) -> ContentValue {
    ContentValue {
        id: ContentId::random(),
        content: Content::IcebergTable(IcebergTable {
            metadata_location: metadata_location.to_string(),
            snapshot_id,
            schema_id: 0,
            spec_id: 0,
            sort_order_id: 0,
        }),
    }
}

/// A namespace content blob with a fresh content id.
pub fn namespace_content() -> ContentValue {
    ContentValue {
        id: ContentId::random(),
        content: Content::Namespace(Namespace::default()),
    }
}

/// A version store over an in-memory backend and a fake clock.
pub struct TestRepo {
    pub store: Arc<Store>,
    pub clock: Arc<FakeClock>,
    pub versions: Arc<VersionStore>,
}

impl TestRepo {
    /// Initializes a repository with a `main` default branch.
    pub fn init() -> Self {
        Self::init_with_config(RepoConfig::default())
    }

    pub fn init_with_config(config: RepoConfig) -> Self {
        let store = Store::new(Box::new(MemoryBackend::new()));
        let clock = Arc::new(FakeClock::new(TEST_EPOCH_MS));
        let versions = VersionStore::init(
            store.clone(),
            clock.clone(),
            RefNameBuf::from("main"),
            config,
        )
        .block_on()
        .unwrap();
        Self {
            store,
            clock,
            versions: Arc::new(versions),
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        self.store.backend_impl::<MemoryBackend>().unwrap()
    }
}

/// A catalog service over a [`TestRepo`] and an in-memory object store.
pub struct TestCatalog {
    pub repo: TestRepo,
    pub object_io: Arc<MemoryObjectIo>,
    pub catalog: CatalogService,
}

impl TestCatalog {
    pub const WAREHOUSE: &'static str = "mem://warehouse";

    pub fn init() -> Self {
        let repo = TestRepo::init();
        let object_io = Arc::new(MemoryObjectIo::new());
        let catalog = CatalogService::new(
            repo.versions.clone(),
            object_io.clone(),
            Arc::new(JsonCodec),
            repo.clock.clone(),
            CatalogConfig {
                warehouse_root: Self::WAREHOUSE.to_string(),
            },
            TaskCacheConfig::default(),
        );
        Self {
            repo,
            object_io,
            catalog,
        }
    }
}
