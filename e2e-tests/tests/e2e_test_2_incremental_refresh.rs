// E2E Test 2: Incremental refresh
// Five of ten messages indexed, five new ones arrive → refresh indexes only those

mod e2e;

use e2e::helpers::{mailbox, message, TestEnv, TestResult};
use mail_search::state::IndexingState;

#[tokio::test]
async fn test_e2e_2_incremental_refresh() {
    let (name, started) = TestResult::start("E2E Test 2: Incremental refresh");
    let env = TestEnv::new(mailbox(5));
    let search = env.service().await;

    println!("\n📋 Step 1: Indexing the first five messages...");
    search.enable().await.unwrap();
    let status = search.wait_for_build().await;
    assert_eq!(status.entries, 5);
    let store = env.store().await;
    let newest_before = store.newest_time().await.unwrap();

    println!("\n📋 Step 2: Five new messages arrive...");
    for i in 6..=10 {
        env.transport.push(message(i, &format!("Subject {:02}", i))).await;
    }

    println!("\n📋 Step 3: Refreshing...");
    let status = search.build().await.unwrap();
    assert_eq!(status.state, IndexingState::Refresh);
    let status = search.wait_for_build().await;

    assert_eq!(status.state, IndexingState::Complete);
    assert_eq!(status.entries, 10);
    assert_eq!(env.transport.detail_fetches(), 10);
    assert!(store.contains("msg-10").await.unwrap());

    let newest_after = store.newest_time().await.unwrap();
    assert!(newest_after > newest_before);

    TestResult::success(name, started).print();
}
