// E2E Test 5: Cache first, then index
// A partial cache answers first; the encrypted index fills the rest of the page

mod e2e;

use e2e::helpers::{message, TestEnv, TestResult, USER};
use mail_search::search::{HitSource, SearchEvent, SearchState};
use tokio::sync::mpsc;

const INVOICES: [i64; 5] = [10, 8, 6, 3, 1];

fn subject(i: i64) -> String {
    if INVOICES.contains(&i) {
        format!("Invoice #{:02}", i)
    } else {
        format!("Meeting #{:02}", i)
    }
}

#[tokio::test]
async fn test_e2e_5_cache_then_index() {
    let (name, started) = TestResult::start("E2E Test 5: Search across cache and index");
    let env = TestEnv::new((1..=10).map(|i| message(i, &subject(i))).collect());
    let search = env.service().await;
    search.enable().await.unwrap();
    search.wait_for_build().await;

    println!("\n📋 Step 1: Limiting the cache to the five newest messages...");
    let full = search.refresh_cache().await.unwrap();
    assert_eq!(full.len, 10);
    assert!(!full.partial);
    let per_message = (full.size_bytes / full.len) as u64;
    env.memory.set(per_message * 5 + per_message / 2);

    let limited = search.refresh_cache().await.unwrap();
    assert_eq!(limited.len, 5);
    assert!(limited.partial);

    println!("\n📋 Step 2: Searching for invoices...");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut state = SearchState::new(USER, "invoice");
    let page = search.search(&mut state, Some(tx)).await.unwrap();

    let ids: Vec<_> = page.hits.iter().map(|h| h.message_id.clone()).collect();
    assert_eq!(ids, vec!["msg-10", "msg-08", "msg-06", "msg-03", "msg-01"]);
    let sources: Vec<_> = page.hits.iter().map(|h| h.source).collect();
    assert_eq!(
        sources,
        vec![
            HitSource::Cache,
            HitSource::Cache,
            HitSource::Cache,
            HitSource::Index,
            HitSource::Index
        ]
    );
    assert!(page.exhausted);

    match rx.recv().await {
        Some(SearchEvent::Results(first)) => {
            assert_eq!(first.len(), 3);
            assert!(first.iter().all(|h| h.source == HitSource::Cache));
        }
        other => panic!("expected cache results first, got {:?}", other),
    }

    println!("\n📋 Step 3: Same query, same results...");
    let mut again = SearchState::new(USER, "invoice");
    let repeat = search.search(&mut again, None).await.unwrap();
    let repeat_ids: Vec<_> = repeat.hits.iter().map(|h| h.message_id.clone()).collect();
    assert_eq!(repeat_ids, ids);

    TestResult::success(name, started).print();
}

#[tokio::test]
async fn test_e2e_5_empty_query_touches_nothing() {
    let (name, started) = TestResult::start("E2E Test 5b: Empty query");
    let env = TestEnv::new((1..=3).map(|i| message(i, &subject(i))).collect());
    let search = env.service().await;
    search.enable().await.unwrap();
    search.wait_for_build().await;

    let mut state = SearchState::new(USER, "   ");
    let page = search.search(&mut state, None).await.unwrap();
    assert!(page.hits.is_empty());
    assert!(page.exhausted);

    TestResult::success(name, started).print();
}
