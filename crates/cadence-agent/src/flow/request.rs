//! Model request assembly: instruction templating, history filtering and
//! tool declarations.

use crate::agent::{AgentId, AgentNode, IncludeContents, Instruction, LlmAgent};
use crate::context::InvocationContext;
use crate::llm::LlmRequest;
use cadence_core::{CadenceError, CadenceResult, Content, Event, Part, StateMap, ROLE_USER};
use cadence_tools::{Tool, TRANSFER_TO_AGENT};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::{Arc, LazyLock};

/// Author of events carrying user input.
pub const USER_AUTHOR: &str = "user";

#[allow(clippy::unwrap_used)]
static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{+[^{}]*\}+").unwrap());

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replaces `{key}` and `{key?}` with state values.
///
/// Keys may carry a `temp:` prefix. Text inside braces that is not a key name
/// is left untouched, as are doubled braces. A missing `{key}` is an error; a
/// missing `{key?}` becomes empty.
pub fn inject_state(template: &str, state: &StateMap) -> CadenceResult<String> {
    let mut missing = None;
    let rendered = PLACEHOLDER_PATTERN.replace_all(template, |caps: &Captures<'_>| {
        let matched = &caps[0];
        let inner = match matched.strip_prefix('{').and_then(|m| m.strip_suffix('}')) {
            Some(inner) if !inner.starts_with('{') && !inner.ends_with('}') => inner.trim(),
            _ => return matched.to_string(),
        };
        let (key, optional) = match inner.strip_suffix('?') {
            Some(key) => (key, true),
            None => (inner, false),
        };
        let bare = key.strip_prefix(cadence_core::TEMP_PREFIX).unwrap_or(key);
        if !is_identifier(bare) {
            return matched.to_string();
        }
        match state.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None if optional => String::new(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                matched.to_string()
            }
        }
    });
    match missing {
        Some(key) => Err(CadenceError::Agent(format!(
            "Context variable not found: `{key}`"
        ))),
        None => Ok(rendered.into_owned()),
    }
}

/// Resolves the agent's instruction against the current state.
pub fn resolve_instruction(agent: &LlmAgent, state: &StateMap) -> CadenceResult<String> {
    match &agent.instruction {
        Instruction::Static(text) => inject_state(text, state),
        Instruction::Provider(provider) => provider(state),
    }
}

fn transfer_note(ctx: &InvocationContext, id: AgentId, targets: &[AgentId]) -> String {
    let agents = &ctx.agents;
    let mut note = String::from("You have a list of other agents to transfer to:\n");
    for &target in targets {
        let node = agents.node(target);
        note.push_str(&format!(
            "\nAgent name: {}\nAgent description: {}\n",
            node.name, node.description
        ));
    }
    note.push_str(&format!(
        "\nIf you are the best to answer the question according to your description, you can answer it.\n\n\
         If another agent is better for answering the question according to its description, call \
         `{TRANSFER_TO_AGENT}` function to transfer the question to that agent. When transferring, \
         do not generate any text other than the function call.\n"
    ));
    if let Some(parent) = agents.parent(id).filter(|p| targets.contains(p)) {
        note.push_str(&format!(
            "\nYour parent agent is {}. If neither the other agents nor you are best for answering \
             the question according to the descriptions, transfer to your parent agent.\n",
            agents.node(parent).name
        ));
    }
    note
}

/// Whether an event recorded on `event_branch` is visible from `branch`.
///
/// Events without a branch are visible everywhere, and a context without a
/// branch sees everything. Otherwise an event is visible from its own branch
/// and from branches nested below it.
pub fn is_visible(branch: Option<&str>, event_branch: Option<&str>) -> bool {
    match (branch, event_branch) {
        (Some(current), Some(owner)) => {
            current == owner
                || current
                    .strip_prefix(owner)
                    .is_some_and(|rest| rest.starts_with('.'))
        }
        _ => true,
    }
}

fn is_foreign(agent_name: &str, event: &Event) -> bool {
    event.author != agent_name && event.author != USER_AUTHOR
}

/// Re-frames another agent's output as user-role context.
fn reframe_foreign(event: &Event, content: &Content) -> Content {
    let author = &event.author;
    let mut parts = vec![Part::text("For context:")];
    for part in &content.parts {
        let part = match part {
            Part::Text { text } => Part::text(format!("[{author}] said: {text}")),
            Part::FunctionCall(call) => Part::text(format!(
                "[{author}] called tool `{}` with parameters: {}",
                call.name, call.args
            )),
            Part::FunctionResponse(response) => Part::text(format!(
                "[{author}] `{}` tool returned result: {}",
                response.name,
                Value::Object(response.response.clone())
            )),
            other => other.clone(),
        };
        parts.push(part);
    }
    Content::new(ROLE_USER, parts)
}

/// Builds the model history for `agent_name` from the session events.
pub fn build_contents(
    events: &[Event],
    agent_name: &str,
    branch: Option<&str>,
    include: IncludeContents,
) -> Vec<Content> {
    let visible: Vec<&Event> = events
        .iter()
        .filter(|e| !e.partial && !e.has_empty_content())
        .filter(|e| is_visible(branch, e.branch.as_deref()))
        .collect();

    let start = match include {
        IncludeContents::Default => 0,
        IncludeContents::None => visible
            .iter()
            .rposition(|e| e.author == USER_AUTHOR || is_foreign(agent_name, e))
            .unwrap_or(0),
    };

    visible[start..]
        .iter()
        .filter_map(|event| {
            let content = event.content.as_ref()?;
            if is_foreign(agent_name, event) {
                Some(reframe_foreign(event, content))
            } else {
                Some(content.clone())
            }
        })
        .collect()
}

/// Assembles the request for one model step.
///
/// `pending` is a state delta not yet recorded; it overlays the session state
/// for instruction templating.
pub async fn build_request(
    ctx: &InvocationContext,
    node: &AgentNode,
    agent: &LlmAgent,
    tools: &[Arc<dyn Tool>],
    transfer_targets: &[AgentId],
    pending: &StateMap,
) -> CadenceResult<LlmRequest> {
    let mut state = ctx.state_snapshot().await;
    state.extend(pending.iter().map(|(k, v)| (k.clone(), v.clone())));
    let mut request = LlmRequest {
        model: agent.model.model_name().to_string(),
        ..LlmRequest::default()
    };

    let instruction = resolve_instruction(agent, &state)?;
    if !instruction.is_empty() {
        request.append_instruction(&instruction);
    }
    if !transfer_targets.is_empty() {
        request.append_instruction(&transfer_note(ctx, node.id, transfer_targets));
    }

    let events = ctx.events().await;
    request.contents = build_contents(
        &events,
        &node.name,
        ctx.branch.as_deref(),
        agent.include_contents,
    );
    request.tools = tools.iter().map(|t| t.declaration().clone()).collect();

    request.generation = agent.generation.clone();
    let run_config = &ctx.run_config;
    request
        .generation
        .extend(run_config.generation.iter().map(|(k, v)| (k.clone(), v.clone())));
    request.response_modalities = run_config.response_modalities.clone();
    request.speech_config = run_config.speech_config.clone();
    request.input_audio_transcription = run_config.input_audio_transcription.clone();
    request.output_audio_transcription = run_config.output_audio_transcription.clone();
    Ok(request)
}
