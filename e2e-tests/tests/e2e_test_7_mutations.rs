// E2E Test 7: Message changes and cache ownership
// Changes arriving during a build replay in order; the cache belongs to one user

mod e2e;

use e2e::helpers::{mailbox, message, TestEnv, TestResult, USER};
use mail_search::engine::MutationOutcome;
use mail_search::search::SearchState;
use mail_search::state::{IndexingState, MessageMutation};

#[tokio::test]
async fn test_e2e_7_changes_replay_in_arrival_order() {
    let (name, started) = TestResult::start("E2E Test 7: Buffered changes");
    let env = TestEnv::new(mailbox(10));
    let gate = env.transport.hold_page(1);
    let search = env.service().await;

    search.enable().await.unwrap();
    gate.reached.notified().await;

    println!("\n📋 Step 1: Changes arrive while downloading...");
    let changes = vec![
        MessageMutation::Insert(message(20, "Quarterly report")),
        MessageMutation::Update(message(20, "Quarterly report v2")),
        MessageMutation::Move {
            message_id: "msg-20".to_string(),
            label_ids: vec!["3".to_string()],
            location: 3,
        },
        MessageMutation::Delete("msg-05".to_string()),
        MessageMutation::Insert(message(21, "Temporary")),
        MessageMutation::Delete("msg-21".to_string()),
    ];
    for change in changes {
        assert_eq!(
            search.apply_mutation(change).await.unwrap(),
            MutationOutcome::Buffered
        );
    }

    println!("\n📋 Step 2: Build completes and replays...");
    gate.release.notify_one();
    let status = search.wait_for_build().await;
    assert_eq!(status.state, IndexingState::Complete);
    assert_eq!(status.entries, 10);

    let store = env.store().await;
    let report = store.get("msg-20").await.unwrap().unwrap();
    assert_eq!(report.label_ids, vec!["3".to_string()]);
    assert!(!store.contains("msg-05").await.unwrap());
    assert!(!store.contains("msg-21").await.unwrap());

    let mut state = SearchState::new(USER, "report v2");
    let page = search.search(&mut state, None).await.unwrap();
    assert_eq!(page.hits.len(), 1);

    println!("\n📋 Step 3: Changes after completion apply immediately...");
    assert_eq!(
        search
            .apply_mutation(MessageMutation::Delete("msg-20".to_string()))
            .await
            .unwrap(),
        MutationOutcome::Applied
    );
    let mut state = SearchState::new(USER, "report");
    assert!(search.search(&mut state, None).await.unwrap().hits.is_empty());

    TestResult::success(name, started).print();
}

#[tokio::test]
async fn test_e2e_7_one_cache_per_user() {
    let (name, started) = TestResult::start("E2E Test 7b: Cache ownership");
    let env = TestEnv::new(mailbox(5));
    let search = env.service().await;
    search.enable().await.unwrap();
    search.wait_for_build().await;

    let mut state = SearchState::new(USER, "subject");
    search.search(&mut state, None).await.unwrap();
    let first = search.cache_info().await.unwrap();

    let mut state = SearchState::new(USER, "body");
    search.search(&mut state, None).await.unwrap();
    let second = search.cache_info().await.unwrap();
    assert_eq!(first.generation, second.generation);

    println!("\n📋 Switching users...");
    search.open_user("bob@example.com").await.unwrap();
    assert!(search.cache_info().await.is_none());

    search.open_user(USER).await.unwrap();
    let mut state = SearchState::new(USER, "subject");
    let page = search.search(&mut state, None).await.unwrap();
    assert_eq!(page.hits.len(), 5);
    let rebuilt = search.cache_info().await.unwrap();
    assert!(rebuilt.generation > first.generation);

    TestResult::success(name, started).print();
}
