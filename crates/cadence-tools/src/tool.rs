use async_trait::async_trait;
use cadence_core::{CadenceResult, EventActions, StateMap, ToolConfirmation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema advertised to the model for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A callable capability the model may request.
#[async_trait]
pub trait Tool: Send + Sync {
    fn declaration(&self) -> &ToolDeclaration;

    fn name(&self) -> &str {
        &self.declaration().name
    }

    /// Executes the tool. Side effects (state writes, transfers, escalation)
    /// are recorded on `ctx.actions` and attached to the response event.
    async fn invoke(&self, args: Map<String, Value>, ctx: &mut ToolContext)
        -> CadenceResult<Map<String, Value>>;
}

/// Per-call view of the invocation handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub invocation_id: String,
    pub agent_name: String,
    pub function_call_id: String,
    /// Side effects accumulated by this call.
    pub actions: EventActions,
    /// Approval attached to this call, when it was previously requested.
    pub tool_confirmation: Option<ToolConfirmation>,
    state: StateMap,
}

impl ToolContext {
    pub fn new(
        invocation_id: impl Into<String>,
        agent_name: impl Into<String>,
        function_call_id: impl Into<String>,
        state: StateMap,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            agent_name: agent_name.into(),
            function_call_id: function_call_id.into(),
            actions: EventActions::default(),
            tool_confirmation: None,
            state,
        }
    }

    /// Reads a state value, seeing this call's own pending writes first.
    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.actions
            .state_delta
            .get(key)
            .or_else(|| self.state.get(key))
    }

    /// Records a state write in this call's delta.
    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.actions.state_delta.insert(key.into(), value);
    }

    /// Snapshot the call started with, overlaid with its pending writes.
    pub fn state(&self) -> StateMap {
        let mut merged = self.state.clone();
        merged.extend(self.actions.state_delta.clone());
        merged
    }

    /// Asks for external approval of this call before it may proceed.
    pub fn request_confirmation(&mut self, hint: impl Into<String>, payload: Option<Value>) {
        self.actions.requested_tool_confirmations.insert(
            self.function_call_id.clone(),
            ToolConfirmation {
                hint: hint.into(),
                confirmed: false,
                payload,
            },
        );
    }
}

/// Wraps a non-object tool result as `{"result": value}`.
pub fn into_response_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_sees_own_writes() {
        let mut state = StateMap::new();
        state.insert("count".into(), json!(1));
        let mut ctx = ToolContext::new("inv", "agent", "call-1", state);

        assert_eq!(ctx.get_state("count"), Some(&json!(1)));
        ctx.set_state("count", json!(2));
        assert_eq!(ctx.get_state("count"), Some(&json!(2)));
        assert_eq!(ctx.state()["count"], json!(2));
        assert_eq!(ctx.actions.state_delta.len(), 1);
    }

    #[test]
    fn test_request_confirmation_keyed_by_call() {
        let mut ctx = ToolContext::new("inv", "agent", "call-7", StateMap::new());
        ctx.request_confirmation("transfer $500?", None);
        let pending = &ctx.actions.requested_tool_confirmations["call-7"];
        assert_eq!(pending.hint, "transfer $500?");
        assert!(!pending.confirmed);
    }

    #[test]
    fn test_into_response_map() {
        assert_eq!(into_response_map(json!({"ok": true}))["ok"], json!(true));
        assert_eq!(into_response_map(json!(42))["result"], json!(42));
        assert!(into_response_map(Value::Null).is_empty());
    }
}
