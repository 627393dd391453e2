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

use std::collections::BTreeMap;

use icevault_lib::refs::RefName;
use icevault_lib::repo::RepoConfig;
use icevault_lib::version_store::CommitOperationRequest;
use icevault_lib::version_store::CommitRequest;
use icevault_lib::version_store::RefSpec;
use icevault_lib::version_store::RequestedOperation;
use pollster::FutureExt as _;
use testutils::TestRepo;
use testutils::content_key;
use testutils::table_content;
use testutils::test_signature;

fn commit_many(repo: &TestRepo, keys: &[String]) {
    let operations = keys
        .iter()
        .map(|key| CommitOperationRequest {
            key: content_key(key),
            operation: RequestedOperation::Put(table_content(
                &format!("mem://wh/{key}/v0.json"),
                1,
            )),
            requirement: None,
        })
        .collect();
    repo.versions
        .commit(CommitRequest {
            branch: "main".into(),
            expected_head: None,
            message: "bulk load".to_string(),
            author: test_signature(),
            operations,
            metadata: BTreeMap::new(),
        })
        .block_on()
        .unwrap();
}

#[test]
fn test_large_index_stays_paged_and_consistent() {
    // A small byte budget forces the root to split into many leaves.
    let repo = TestRepo::init_with_config(RepoConfig {
        segment_byte_budget: 1024,
        ..RepoConfig::default()
    });
    let keys: Vec<String> = (0..300).map(|i| format!("db{:02}.table{i:03}", i % 10)).collect();
    commit_many(&repo, &keys);

    // Every key resolves through the paged index.
    for key in &keys {
        let (_, value) = repo
            .versions
            .get_content(&RefSpec::name("main"), &content_key(key))
            .block_on()
            .unwrap();
        assert_eq!(value.content.content_type().as_str(), "iceberg-table");
    }

    // A prefix scan sees exactly one namespace, in order.
    let page = repo
        .versions
        .entries(&RefSpec::name("main"), Some(&content_key("db03")), None, 1000)
        .block_on()
        .unwrap();
    let mut expected: Vec<String> = keys
        .iter()
        .filter(|key| key.starts_with("db03."))
        .cloned()
        .collect();
    expected.sort();
    let listed: Vec<String> = page.entries.iter().map(|e| e.key.to_string()).collect();
    assert_eq!(listed, expected);
}

#[test]
fn test_scan_pages_cover_everything_exactly_once() {
    let repo = TestRepo::init_with_config(RepoConfig {
        segment_byte_budget: 512,
        ..RepoConfig::default()
    });
    let keys: Vec<String> = (0..100).map(|i| format!("ns.k{i:03}")).collect();
    commit_many(&repo, &keys);

    let mut seen = vec![];
    let mut token = None;
    loop {
        let page = repo
            .versions
            .entries(&RefSpec::name("main"), None, token.as_ref(), 7)
            .block_on()
            .unwrap();
        seen.extend(page.entries.iter().map(|e| e.key.to_string()));
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    let expected: Vec<String> = keys.to_vec();
    assert_eq!(seen, expected);
}

#[test]
fn test_unrelated_commits_share_segments() {
    use icevault_lib::backend::Bucket;

    let repo = TestRepo::init_with_config(RepoConfig {
        segment_byte_budget: 1024,
        ..RepoConfig::default()
    });
    let keys: Vec<String> = (0..200).map(|i| format!("ns.k{i:03}")).collect();
    commit_many(&repo, &keys);

    let segments_before = repo
        .store
        .backend()
        .scan(Bucket::IndexSegments, b"", None, 10_000)
        .block_on()
        .unwrap()
        .entries
        .len();

    // Touching one key must only rewrite the affected leaf (plus the root).
    commit_many(&repo, &["ns.k000".to_string()]);
    let segments_after = repo
        .store
        .backend()
        .scan(Bucket::IndexSegments, b"", None, 10_000)
        .block_on()
        .unwrap()
        .entries
        .len();
    let new_segments = segments_after - segments_before;
    assert!(
        new_segments <= 2,
        "expected at most a leaf and a root, got {new_segments}"
    );
}

#[test]
fn test_old_roots_remain_readable() {
    let repo = TestRepo::init();
    commit_many(&repo, &["a.x".to_string()]);
    let old_head = repo
        .versions
        .get_ref(RefName::new("main"))
        .block_on()
        .unwrap()
        .head;
    commit_many(&repo, &["a.y".to_string()]);

    // Reading through the old commit still sees only the old state.
    let page = repo
        .versions
        .entries(&RefSpec::hash(old_head), None, None, 10)
        .block_on()
        .unwrap();
    let keys: Vec<String> = page.entries.iter().map(|e| e.key.to_string()).collect();
    assert_eq!(keys, ["a.x"]);
}
