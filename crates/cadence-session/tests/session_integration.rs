#![allow(clippy::unwrap_used, clippy::expect_used)]

use cadence_core::{CadenceError, Content, Event, StateMap};
use cadence_session::{
    FileSessionStore, GetSessionConfig, InMemorySessionStore, Session, SessionStore,
};
use serde_json::json;
use std::sync::Arc;

/// Helper: create a FileSessionStore in a temp directory.
async fn temp_store() -> (FileSessionStore, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = FileSessionStore::new(tmp.path().join("sessions"))
        .await
        .unwrap();
    (store, tmp)
}

fn event_with_delta(author: &str, delta: serde_json::Value) -> Event {
    let mut event = Event::new("inv-1", author);
    event.actions.state_delta = serde_json::from_value(delta).unwrap();
    event
}

/// Exercises the shared contract against any backend.
async fn exercise_store(store: &dyn SessionStore) {
    let mut initial = StateMap::new();
    initial.insert("lang".into(), json!("en"));
    let mut session = store
        .create_session("app", "alice", Some(initial), Some("s1".into()))
        .await
        .unwrap();
    assert_eq!(session.state["lang"], json!("en"));

    store
        .append_event(&mut session, event_with_delta("user", json!({"a": 1})))
        .await
        .unwrap();
    store
        .append_event(&mut session, event_with_delta("agent", json!({"a": 2, "b": 3})))
        .await
        .unwrap();

    let loaded = store
        .get_session("app", "alice", "s1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.events.len(), 2);
    assert_eq!(loaded.state["a"], json!(2));
    assert_eq!(loaded.state["b"], json!(3));
    assert_eq!(loaded.state["lang"], json!("en"));
    assert_eq!(loaded, session);

    let events = store.list_events("app", "alice", "s1").await.unwrap();
    assert_eq!(events.len(), 2);

    let listed = store.list_sessions("app", "alice").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].events.is_empty());

    store.delete_session("app", "alice", "s1").await.unwrap();
    assert!(store
        .get_session("app", "alice", "s1", None)
        .await
        .unwrap()
        .is_none());
    // Deleting twice is fine.
    store.delete_session("app", "alice", "s1").await.unwrap();
}

#[tokio::test]
async fn test_in_memory_contract() {
    exercise_store(&InMemorySessionStore::new()).await;
}

#[tokio::test]
async fn test_file_contract() {
    let (store, _tmp) = temp_store().await;
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("sessions");
    {
        let store = FileSessionStore::new(dir.clone()).await.unwrap();
        let mut session = store
            .create_session("app", "bob", None, Some("persist".into()))
            .await
            .unwrap();
        let event = Event::new("inv-1", "user").with_content(Content::user_text("Hello!"));
        store.append_event(&mut session, event).await.unwrap();
    }

    let store = FileSessionStore::new(dir).await.unwrap();
    let loaded = store
        .get_session("app", "bob", "persist", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.events.len(), 1);
    assert_eq!(loaded.events[0].text(), "Hello!");
}

#[tokio::test]
async fn test_partial_events_not_persisted() {
    let (store, _tmp) = temp_store().await;
    let mut session = store.create_session("app", "u", None, None).await.unwrap();
    let mut chunk = Event::new("inv-1", "agent").with_content(Content::model_text("Hel"));
    chunk.partial = true;

    let returned = store.append_event(&mut session, chunk).await.unwrap();
    assert!(returned.partial);
    assert_eq!(session.events.len(), 0);
    assert!(store
        .list_events("app", "u", &session.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_temp_state_stripped_on_append() {
    let store = InMemorySessionStore::new();
    let mut session = store.create_session("app", "u", None, None).await.unwrap();
    let recorded = store
        .append_event(
            &mut session,
            event_with_delta("agent", json!({"temp:draft": "x", "final": "y"})),
        )
        .await
        .unwrap();

    assert!(!recorded.actions.state_delta.contains_key("temp:draft"));
    let loaded = store
        .get_session("app", "u", &session.id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.state.len(), 1);
    assert_eq!(loaded.state["final"], json!("y"));
}

#[tokio::test]
async fn test_after_timestamp_filter() {
    let store = InMemorySessionStore::new();
    let mut session = store.create_session("app", "u", None, None).await.unwrap();
    store
        .append_event(&mut session, Event::new("inv-1", "user"))
        .await
        .unwrap();
    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
    let mut later = Event::new("inv-2", "user");
    later.timestamp = cutoff + chrono::Duration::seconds(1);
    store.append_event(&mut session, later).await.unwrap();

    let loaded = store
        .get_session(
            "app",
            "u",
            &session.id,
            Some(GetSessionConfig {
                num_recent_events: None,
                after_timestamp: Some(cutoff),
            }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.events.len(), 1);
    assert_eq!(loaded.events[0].invocation_id, "inv-2");
}

#[tokio::test]
async fn test_append_to_missing_session_fails() {
    let store = InMemorySessionStore::new();
    let mut ghost = Session::new("app", "u", "ghost", StateMap::new());
    let err = store
        .append_event(&mut ghost, Event::new("inv", "user"))
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::SessionNotFound { .. }));
}

#[tokio::test]
async fn test_failed_file_write_leaves_session_unchanged() {
    let (store, tmp) = temp_store().await;
    let mut session = store
        .create_session("app", "alice", None, Some("s1".into()))
        .await
        .unwrap();

    // A directory where the temp file goes makes the write fail.
    let blocker = tmp.path().join("sessions/app/alice/s1.json.tmp");
    std::fs::create_dir_all(&blocker).unwrap();

    let result = store
        .append_event(&mut session, event_with_delta("agent", json!({"k": 1})))
        .await;
    assert!(result.is_err());
    assert!(session.events.is_empty());
    assert!(!session.state.contains_key("k"));
    assert!(store.list_events("app", "alice", "s1").await.unwrap().is_empty());

    // Once writes succeed again, the caller's copy and the file agree.
    std::fs::remove_dir(&blocker).unwrap();
    store
        .append_event(&mut session, event_with_delta("agent", json!({"k": 2})))
        .await
        .unwrap();
    let durable = store
        .get_session("app", "alice", "s1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(durable, session);
    assert_eq!(durable.events.len(), 1);
    assert_eq!(durable.state["k"], json!(2));
}

#[tokio::test]
async fn test_concurrent_writers_serialize() {
    let store = Arc::new(InMemorySessionStore::new());
    let session = store
        .create_session("app", "u", None, Some("shared".into()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            // Each writer re-reads until its append lands on a fresh copy.
            loop {
                let mut copy = store
                    .get_session("app", "u", "shared", None)
                    .await
                    .unwrap()
                    .unwrap();
                let mut event = Event::new("inv-1", "agent");
                event.actions.state_delta.insert(format!("k{i}"), json!(i));
                match store.append_event(&mut copy, event).await {
                    Ok(_) => break,
                    Err(CadenceError::StaleSession { .. }) => continue,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let loaded = store
        .get_session("app", "u", &session.id, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.events.len(), 8);
    assert_eq!(loaded.state.len(), 8);
}
