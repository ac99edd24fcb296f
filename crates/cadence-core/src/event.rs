use crate::content::{Content, FunctionCall, FunctionResponse};
use crate::state::StateMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A tool call awaiting human or external approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfirmation {
    /// Text shown to whoever approves the call.
    #[serde(default)]
    pub hint: String,
    /// Whether the call has been approved.
    #[serde(default)]
    pub confirmed: bool,
    /// Optional structured payload supplied with the approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Side effects attached to an [`Event`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    /// Keys to merge into session state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_delta: StateMap,
    /// Artifact name to produced version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_delta: BTreeMap<String, u32>,
    /// Name of the agent that should take over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// Hand control back to the parent agent.
    #[serde(default)]
    pub escalate: bool,
    /// Do not ask the model to summarize a tool response.
    #[serde(default)]
    pub skip_summarization: bool,
    /// Function-call id to pending confirmation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requested_tool_confirmations: BTreeMap<String, ToolConfirmation>,
}

impl EventActions {
    /// True when no side effect is requested.
    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty()
            && self.artifact_delta.is_empty()
            && self.transfer_to_agent.is_none()
            && !self.escalate
            && !self.skip_summarization
            && self.requested_tool_confirmations.is_empty()
    }

    /// Merges `other` into `self`. Map keys from `other` win, flags are OR-ed,
    /// and a transfer in `other` replaces one in `self`.
    pub fn merge(&mut self, other: EventActions) {
        self.state_delta.extend(other.state_delta);
        self.artifact_delta.extend(other.artifact_delta);
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        self.escalate |= other.escalate;
        self.skip_summarization |= other.skip_summarization;
        self.requested_tool_confirmations
            .extend(other.requested_tool_confirmations);
    }
}

/// An immutable record of one causal step within an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: String,
    /// Groups the events of one runner call.
    pub invocation_id: String,
    /// `"user"`, an agent name, or `"model"`.
    pub author: String,
    /// Message content, absent for state-only events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Side effects.
    #[serde(default)]
    pub actions: EventActions,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// An incremental streaming chunk; never persisted.
    #[serde(default)]
    pub partial: bool,
    /// The model finished its turn (live mode).
    #[serde(default)]
    pub turn_complete: bool,
    /// The model output was interrupted (live mode).
    #[serde(default)]
    pub interrupted: bool,
    /// This event ends its author's turn.
    #[serde(default)]
    pub final_response: bool,
    /// Dot-separated agent path scoping sub-agent conversations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Machine-readable error code reported by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error message reported by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Event {
    /// Creates an empty event for the given invocation and author.
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Self::new_id(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            content: None,
            actions: EventActions::default(),
            timestamp: Utc::now(),
            partial: false,
            turn_complete: false,
            interrupted: false,
            final_response: false,
            branch: None,
            error_code: None,
            error_message: None,
        }
    }

    /// Generates a fresh event id.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Sets the content.
    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    /// Sets the actions.
    pub fn with_actions(mut self, actions: EventActions) -> Self {
        self.actions = actions;
        self
    }

    /// Sets the branch.
    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    /// Function calls carried by the content, in order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.content
            .as_ref()
            .map(Content::function_calls)
            .unwrap_or_default()
    }

    /// Function responses carried by the content, in order.
    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.content
            .as_ref()
            .map(Content::function_responses)
            .unwrap_or_default()
    }

    /// Concatenated text of the content, empty when there is none.
    pub fn text(&self) -> String {
        self.content.as_ref().map(Content::text).unwrap_or_default()
    }

    /// Whether this event ends its author's turn.
    pub fn is_final_response(&self) -> bool {
        self.final_response
    }

    /// True when the event has no meaningful content.
    pub fn has_empty_content(&self) -> bool {
        self.content.as_ref().map_or(true, Content::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Part;
    use serde_json::json;

    #[test]
    fn test_actions_merge() {
        let mut first = EventActions::default();
        first.state_delta.insert("a".into(), json!(1));
        first.skip_summarization = true;

        let mut second = EventActions::default();
        second.state_delta.insert("a".into(), json!(2));
        second.state_delta.insert("b".into(), json!(3));
        second.transfer_to_agent = Some("billing".into());

        first.merge(second);
        assert_eq!(first.state_delta["a"], json!(2));
        assert_eq!(first.state_delta["b"], json!(3));
        assert!(first.skip_summarization);
        assert_eq!(first.transfer_to_agent.as_deref(), Some("billing"));
        assert!(!first.is_empty());
        assert!(EventActions::default().is_empty());
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::new("inv-1", "helper").with_content(Content::new(
            "model",
            vec![
                Part::text("checking"),
                Part::FunctionCall(FunctionCall::new("check_prime", json!({"nums": [6]}))),
            ],
        ));
        assert_eq!(event.text(), "checking");
        assert_eq!(event.function_calls()[0].name, "check_prime");
        assert!(event.function_responses().is_empty());
        assert!(!event.has_empty_content());
        assert!(Event::new("inv-1", "helper").has_empty_content());
    }

    #[test]
    fn test_event_serde_omits_empty_fields() {
        let event = Event::new("inv-1", "user").with_content(Content::user_text("hi"));
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("branch").is_none());
        assert!(value["actions"].get("state_delta").is_none());
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
