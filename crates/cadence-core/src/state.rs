use crate::event::Event;
use serde_json::Value;
use std::collections::BTreeMap;

/// Materialized session state: string keys to JSON values.
pub type StateMap = BTreeMap<String, Value>;

/// Keys with this prefix live only for the current invocation and are never
/// persisted or folded into session state.
pub const TEMP_PREFIX: &str = "temp:";

/// Merges `delta` into `state`; later keys overwrite earlier ones.
pub fn apply_delta(state: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        if key.starts_with(TEMP_PREFIX) {
            continue;
        }
        state.insert(key.clone(), value.clone());
    }
}

/// Left-folds the state deltas of `events` in order.
pub fn fold_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> StateMap {
    let mut state = StateMap::new();
    for event in events {
        apply_delta(&mut state, &event.actions.state_delta);
    }
    state
}

/// Removes invocation-scoped keys from a delta.
pub fn strip_temp_keys(delta: &mut StateMap) {
    delta.retain(|key, _| !key.starts_with(TEMP_PREFIX));
}
