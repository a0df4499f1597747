//! Session store tests

use super::*;

fn connect_for(client_id: &str, clean_start: bool) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        clean_start,
        ..Connect::default()
    }
}

#[tokio::test]
async fn test_clean_start_never_resumes() {
    let store = MemorySessionStore::new();

    let present = store
        .start_persistence(&connect_for("c1", false), false, 3600)
        .await
        .unwrap();
    assert!(!present, "first connect has no session to resume");

    // Clean start: the handler passes session_exists=false
    let present = store
        .start_persistence(&connect_for("c1", true), false, 3600)
        .await
        .unwrap();
    assert!(!present, "clean start must report session_present=false");
}

#[tokio::test]
async fn test_resume_existing_session() {
    let store = MemorySessionStore::new();
    store
        .start_persistence(&connect_for("c1", false), false, 3600)
        .await
        .unwrap();
    store.mark_disconnected("c1");

    assert!(store.exists("c1").await);
    let present = store
        .start_persistence(&connect_for("c1", false), true, 3600)
        .await
        .unwrap();
    assert!(present, "non-expired session must be resumed");
}

#[tokio::test]
async fn test_zero_expiry_session_gone_after_disconnect() {
    let store = MemorySessionStore::new();
    store
        .start_persistence(&connect_for("c1", false), false, 0)
        .await
        .unwrap();

    // Connected sessions exist regardless of expiry
    assert!(store.exists("c1").await);

    store.mark_disconnected("c1");
    assert!(!store.exists("c1").await, "expiry 0 means gone on disconnect");

    let present = store
        .start_persistence(&connect_for("c1", false), false, 0)
        .await
        .unwrap();
    assert!(!present);
}

#[tokio::test]
async fn test_shared_cache_invalidation() {
    let store = MemorySessionStore::new();
    store.cache_shared_subscriptions(Arc::from("c1"), vec!["$share/g/topic".to_string()]);
    assert!(store.cached_shared_subscriptions("c1").is_some());

    store.invalidate_shared_cache("c1");
    assert!(store.cached_shared_subscriptions("c1").is_none());
}
