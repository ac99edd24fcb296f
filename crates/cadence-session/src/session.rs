use cadence_core::{apply_delta, strip_temp_keys, Event, StateMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation identified by `(app_name, user_id, id)`: an append-only
/// event log plus the state folded from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub state: StateMap,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        id: impl Into<String>,
        initial_state: StateMap,
    ) -> Self {
        let mut state = StateMap::new();
        apply_delta(&mut state, &initial_state);
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            id: id.into(),
            events: Vec::new(),
            state,
            last_update_time: Utc::now(),
        }
    }

    /// Folds the event's delta into `state` and appends it to the log.
    ///
    /// Invocation-scoped (`temp:`) keys are stripped from the recorded delta.
    /// Partial events are ignored.
    pub fn apply_event(&mut self, mut event: Event) {
        if event.partial {
            return;
        }
        strip_temp_keys(&mut event.actions.state_delta);
        apply_delta(&mut self.state, &event.actions.state_delta);
        self.last_update_time = event.timestamp;
        self.events.push(event);
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// The most recent event, if any.
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// A copy of this session's metadata and state without its events.
    pub fn without_events(&self) -> Self {
        Self {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            events: Vec::new(),
            state: self.state.clone(),
            last_update_time: self.last_update_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_event_folds_state() {
        let mut session = Session::new("app", "u1", "s1", StateMap::new());
        let mut first = Event::new("inv", "agent");
        first.actions.state_delta.insert("a".into(), json!(1));
        let mut second = Event::new("inv", "agent");
        second.actions.state_delta.insert("a".into(), json!(2));
        second.actions.state_delta.insert("temp:x".into(), json!(true));

        session.apply_event(first);
        session.apply_event(second);

        assert_eq!(session.event_count(), 2);
        assert_eq!(session.state["a"], json!(2));
        assert!(!session.state.contains_key("temp:x"));
        let recorded = &session.events[1].actions.state_delta;
        assert!(!recorded.contains_key("temp:x"));
    }

    #[test]
    fn test_partial_events_ignored() {
        let mut session = Session::new("app", "u1", "s1", StateMap::new());
        let mut chunk = Event::new("inv", "agent");
        chunk.partial = true;
        session.apply_event(chunk);
        assert_eq!(session.event_count(), 0);
    }
}
