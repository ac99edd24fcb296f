use crate::session::Session;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, Event, StateMap};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Restricts which events [`SessionStore::get_session`] returns.
///
/// State is always the fold of the full log regardless of the filter.
#[derive(Debug, Clone, Default)]
pub struct GetSessionConfig {
    /// Keep only the last `n` events.
    pub num_recent_events: Option<usize>,
    /// Keep only events at or after this time.
    pub after_timestamp: Option<DateTime<Utc>>,
}

impl GetSessionConfig {
    pub(crate) fn apply(&self, session: &mut Session) {
        if let Some(after) = self.after_timestamp {
            session.events.retain(|e| e.timestamp >= after);
        }
        if let Some(n) = self.num_recent_events {
            let len = session.events.len();
            if len > n {
                session.events.drain(..len - n);
            }
        }
    }
}

/// Keeper of sessions and their event logs.
///
/// The store is the single source of truth: appends are serialized per
/// session and an append from a copy that is behind the stored log fails
/// with [`CadenceError::StaleSession`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session. A random id is generated when `session_id` is `None`.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> CadenceResult<Session>;

    /// Loads a session, or `None` when it does not exist.
    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> CadenceResult<Option<Session>>;

    /// Durably records `event` and folds it into `session`.
    ///
    /// Partial events are returned without being persisted.
    async fn append_event(&self, session: &mut Session, event: Event) -> CadenceResult<Event>;

    /// All events of a session, in order.
    async fn list_events(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> CadenceResult<Vec<Event>>;

    /// Sessions owned by a user, without their events.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> CadenceResult<Vec<Session>>;

    /// Deletes a session. Deleting a missing session is not an error.
    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> CadenceResult<()>;
}

pub(crate) fn not_found(app_name: &str, user_id: &str, session_id: &str) -> CadenceError {
    CadenceError::SessionNotFound {
        app_name: app_name.to_string(),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
    }
}

pub(crate) fn new_session_id(requested: Option<String>) -> String {
    requested
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Applies `event` to the stored copy after checking that the caller's copy
/// is not behind it. The caller's copy is left untouched.
pub(crate) fn record_event(
    stored: &mut Session,
    in_hand: &Session,
    event: &Event,
) -> CadenceResult<Event> {
    if stored.event_count() > in_hand.event_count() {
        return Err(CadenceError::StaleSession {
            session_id: in_hand.id.clone(),
            stored: stored.event_count(),
            in_hand: in_hand.event_count(),
        });
    }
    stored.apply_event(event.clone());
    // The recorded event has temp keys stripped.
    stored
        .last_event()
        .cloned()
        .ok_or_else(|| CadenceError::Session("append did not record the event".into()))
}

/// Mirrors an event already recorded in `stored` into the caller's copy.
pub(crate) fn mirror_event(session: &mut Session, stored: &Session, event: Event) {
    session.apply_event(event);
    session.last_update_time = stored.last_update_time;
}

type SessionKey = (String, String, String);

fn key(app_name: &str, user_id: &str, session_id: &str) -> SessionKey {
    (
        app_name.to_string(),
        user_id.to_string(),
        session_id.to_string(),
    )
}

/// In-process session store backed by a map behind a `RwLock`.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> CadenceResult<Session> {
        let id = new_session_id(session_id);
        let mut sessions = self.sessions.write().await;
        let k = key(app_name, user_id, &id);
        if sessions.contains_key(&k) {
            return Err(CadenceError::Session(format!(
                "Session with id {id} already exists"
            )));
        }
        let session = Session::new(app_name, user_id, &id, state.unwrap_or_default());
        sessions.insert(k, session.clone());
        debug!(app = %app_name, user = %user_id, session_id = %id, "Session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> CadenceResult<Option<Session>> {
        let sessions = self.sessions.read().await;
        let Some(stored) = sessions.get(&key(app_name, user_id, session_id)) else {
            return Ok(None);
        };
        let mut session = stored.clone();
        if let Some(config) = config {
            config.apply(&mut session);
        }
        Ok(Some(session))
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> CadenceResult<Event> {
        if event.partial {
            return Ok(event);
        }
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&key(&session.app_name, &session.user_id, &session.id))
            .ok_or_else(|| not_found(&session.app_name, &session.user_id, &session.id))?;
        let recorded = record_event(stored, session, &event)?;
        mirror_event(session, stored, event);
        Ok(recorded)
    }

    async fn list_events(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> CadenceResult<Vec<Event>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&key(app_name, user_id, session_id))
            .map(|s| s.events.clone())
            .ok_or_else(|| not_found(app_name, user_id, session_id))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> CadenceResult<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| s.app_name == app_name && s.user_id == user_id)
            .map(Session::without_events)
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> CadenceResult<()> {
        self.sessions
            .write()
            .await
            .remove(&key(app_name, user_id, session_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::Content;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_explicit_id_rejected() {
        let store = InMemorySessionStore::new();
        store
            .create_session("app", "u1", None, Some("s1".into()))
            .await
            .unwrap();
        let err = store
            .create_session("app", "u1", None, Some("s1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::Session(_)));
    }

    #[tokio::test]
    async fn test_stale_copy_rejected() {
        let store = InMemorySessionStore::new();
        let mut first = store.create_session("app", "u1", None, None).await.unwrap();
        let mut second = first.clone();

        store
            .append_event(&mut first, Event::new("inv-1", "user"))
            .await
            .unwrap();
        let err = store
            .append_event(&mut second, Event::new("inv-2", "user"))
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::StaleSession { stored: 1, in_hand: 0, .. }));
    }

    #[tokio::test]
    async fn test_filtered_get_keeps_full_state() {
        let store = InMemorySessionStore::new();
        let mut session = store.create_session("app", "u1", None, None).await.unwrap();
        for i in 0..5 {
            let mut event = Event::new("inv", "agent").with_content(Content::model_text(format!("{i}")));
            event.actions.state_delta.insert(format!("k{i}"), json!(i));
            store.append_event(&mut session, event).await.unwrap();
        }

        let config = GetSessionConfig {
            num_recent_events: Some(2),
            after_timestamp: None,
        };
        let loaded = store
            .get_session("app", "u1", &session.id, Some(config))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.events.len(), 2);
        assert_eq!(loaded.events[0].text(), "3");
        assert_eq!(loaded.state.len(), 5);
    }
}
