// E2E Test 1: Full build
// Empty store, ten remote messages in a single page → complete index

mod e2e;

use e2e::helpers::{mailbox, TestEnv, TestResult};
use mail_search::remote::MemoryTransport;
use mail_search::state::IndexingState;
use std::sync::Arc;

#[tokio::test]
async fn test_e2e_1_full_build() {
    let (name, started) = TestResult::start("E2E Test 1: Full build of an empty store");
    let env = TestEnv::new(mailbox(10));
    let search = env.service().await;

    println!("\n📋 Step 1: Enabling search...");
    let status = search.enable().await.unwrap();
    assert_eq!(status.state, IndexingState::Downloading);

    println!("\n📋 Step 2: Waiting for the build...");
    let status = search.wait_for_build().await;
    assert_eq!(status.state, IndexingState::Complete);
    assert_eq!(status.entries, 10);
    assert_eq!(status.processed, 10);
    assert_eq!(status.total, 10);
    assert_eq!(env.transport.page_requests().len(), 1);
    assert_eq!(env.transport.detail_fetches(), 10);

    println!("\n📋 Step 3: Building a complete index again...");
    let status = search.build().await.unwrap();
    assert_eq!(status.state, IndexingState::Complete);
    assert_eq!(env.transport.page_requests().len(), 1);
    assert_eq!(env.transport.detail_fetches(), 10);

    TestResult::success(name, started).print();
}

#[tokio::test]
async fn test_e2e_1_restart_finds_complete_index() {
    let (name, started) = TestResult::start("E2E Test 1b: Restart with a complete index");
    let env = TestEnv::new(mailbox(10));

    {
        let search = env.service().await;
        search.enable().await.unwrap();
        search.wait_for_build().await;
        search.close().await;
    }

    println!("\n📋 Reopening the index...");
    let search = env.service().await;
    let status = search.status().await;
    assert_eq!(status.state, IndexingState::Partial);
    assert_eq!(status.entries, 10);

    search.build().await.unwrap();
    let status = search.wait_for_build().await;
    assert_eq!(status.state, IndexingState::Complete);
    assert_eq!(status.entries, 10);
    assert_eq!(env.transport.detail_fetches(), 10);

    TestResult::success(name, started).print();
}

#[tokio::test]
async fn test_e2e_1_exported_mailbox_needs_no_detail_requests() {
    let (name, started) = TestResult::start("E2E Test 1c: Build from an exported mailbox");
    let mut env = TestEnv::new(Vec::new());
    let path = env.write_mailbox(&mailbox(4));
    env.transport = Arc::new(MemoryTransport::from_json_file(&path).unwrap());

    let search = env.service().await;
    search.enable().await.unwrap();
    let status = search.wait_for_build().await;

    assert_eq!(status.state, IndexingState::Complete);
    assert_eq!(status.entries, 4);
    assert_eq!(env.transport.detail_fetches(), 0);

    TestResult::success(name, started).print();
}
