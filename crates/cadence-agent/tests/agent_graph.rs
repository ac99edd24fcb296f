#![allow(clippy::unwrap_used, clippy::expect_used)]

use cadence_agent::testing::{collect_events, ScriptedModel};
use cadence_agent::{AgentDef, AgentTree, LlmAgent, LlmResponse, RunConfig, Runner};
use cadence_core::{CadenceError, Content, Event, FunctionCall};
use cadence_session::{FileSessionStore, InMemorySessionStore, SessionStore};
use cadence_tools::{ExitLoopTool, EXIT_LOOP, TRANSFER_TO_AGENT};
use serde_json::json;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn run_text(runner: &Runner, text: &str) -> (Vec<Event>, Option<CadenceError>) {
    collect_events(runner.run(
        "u1",
        "s1",
        Content::user_text(text),
        None,
        RunConfig::default(),
    ))
    .await
}

fn transfer(target: &str) -> LlmResponse {
    LlmResponse::function_calls(vec![FunctionCall::new(
        TRANSFER_TO_AGENT,
        json!({"agent_name": target}),
    )])
}

fn support_desk(coordinator: Arc<ScriptedModel>, billing: Arc<ScriptedModel>) -> AgentDef {
    AgentDef::llm(
        LlmAgent::new("coordinator", coordinator).with_instruction("Route the user to a specialist."),
    )
    .with_sub_agent(
        AgentDef::llm(LlmAgent::new("billing", billing))
            .with_description("Answers questions about invoices and balances."),
    )
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transfer_hands_control_to_sub_agent() {
    let coordinator = Arc::new(ScriptedModel::responses(vec![transfer("billing")]));
    let billing = Arc::new(ScriptedModel::responses(vec![
        LlmResponse::text("Your balance is 0."),
        LlmResponse::text("Invoice #7 is paid."),
    ]));
    let runner = Runner::new(
        "test_app",
        AgentTree::build(support_desk(coordinator.clone(), billing.clone())).unwrap(),
        Arc::new(InMemorySessionStore::new()),
    );

    let (events, error) = run_text(&runner, "What is my balance?").await;
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].author, "coordinator");
    assert_eq!(events[1].actions.transfer_to_agent.as_deref(), Some("billing"));
    assert!(events[1].final_response);
    assert_eq!(events[2].author, "billing");
    assert_eq!(events[2].text(), "Your balance is 0.");

    // The coordinator saw the transfer tool and a note listing billing.
    let request = &coordinator.requests().await[0];
    assert!(request.tools.iter().any(|t| t.name == TRANSFER_TO_AGENT));
    let instruction = request.system_instruction.as_deref().unwrap();
    assert!(instruction.starts_with("Route the user to a specialist."));
    assert!(instruction.contains("Agent name: billing"));

    // Billing sees the coordinator's turn reframed as context.
    let billing_request = &billing.requests().await[0];
    assert_eq!(billing_request.contents[0].text(), "What is my balance?");
    assert!(billing_request.contents[1].text().starts_with("For context:"));
    assert!(billing_request.contents[1]
        .text()
        .contains("[coordinator] called tool `transfer_to_agent`"));

    // The next message resumes with billing.
    let (events, error) = run_text(&runner, "And invoice #7?").await;
    assert!(error.is_none());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].author, "billing");
    assert_eq!(coordinator.call_count().await, 1);
}

#[tokio::test]
async fn test_non_resumable_agent_falls_back_to_root() {
    let coordinator = Arc::new(ScriptedModel::responses(vec![
        transfer("billing"),
        LlmResponse::text("Back at the desk."),
    ]));
    let billing = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("Done.")]));
    let root = AgentDef::llm(LlmAgent::new("coordinator", coordinator.clone())).with_sub_agent(
        AgentDef::llm(LlmAgent::new("billing", billing).disallow_transfer_to_parent()),
    );
    let runner = Runner::new(
        "test_app",
        AgentTree::build(root).unwrap(),
        Arc::new(InMemorySessionStore::new()),
    );

    run_text(&runner, "balance?").await;
    let (events, error) = run_text(&runner, "thanks").await;
    assert!(error.is_none());
    assert_eq!(events[0].author, "coordinator");
    assert_eq!(coordinator.call_count().await, 2);
}

#[tokio::test]
async fn test_resume_survives_store_reload() {
    let dir = tempfile::tempdir().unwrap();

    let coordinator = Arc::new(ScriptedModel::responses(vec![transfer("billing")]));
    let billing = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("Balance: 0.")]));
    let store = FileSessionStore::new(dir.path().to_path_buf()).await.unwrap();
    let runner = Runner::new(
        "test_app",
        AgentTree::build(support_desk(coordinator, billing)).unwrap(),
        Arc::new(store),
    );
    let (_, error) = run_text(&runner, "balance?").await;
    assert!(error.is_none());
    drop(runner);

    let coordinator = Arc::new(ScriptedModel::new(Vec::new()));
    let billing = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("Still 0.")]));
    let store = FileSessionStore::new(dir.path().to_path_buf()).await.unwrap();
    let runner = Runner::new(
        "test_app",
        AgentTree::build(support_desk(coordinator.clone(), billing.clone())).unwrap(),
        Arc::new(store),
    );
    let (events, error) = run_text(&runner, "and now?").await;
    assert!(error.is_none());
    assert_eq!(events[0].author, "billing");
    assert_eq!(coordinator.call_count().await, 0);

    // History from the first process is part of billing's request.
    let contents = &billing.requests().await[0].contents;
    assert_eq!(contents.len(), 5);

    let stored = runner
        .store()
        .list_events("test_app", "u1", "s1")
        .await
        .unwrap();
    assert_eq!(stored.len(), 6);
}

// ---------------------------------------------------------------------------
// Workflow agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_loop_exits_on_escalation() {
    let critic = Arc::new(ScriptedModel::responses(vec![
        LlmResponse::text("Needs another pass."),
        LlmResponse::function_calls(vec![FunctionCall::new(EXIT_LOOP, json!({}))]),
    ]));
    let root = AgentDef::loop_agent("refine", Some(5)).with_sub_agent(AgentDef::llm(
        LlmAgent::new("critic", critic.clone()).with_tool(Arc::new(ExitLoopTool::new())),
    ));
    let runner = Runner::new(
        "test_app",
        AgentTree::build(root).unwrap(),
        Arc::new(InMemorySessionStore::new()),
    );

    let (events, error) = run_text(&runner, "draft").await;
    assert!(error.is_none());
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].text(), "Needs another pass.");
    assert!(events[2].actions.escalate);
    assert!(events[2].final_response);
    assert_eq!(critic.call_count().await, 2);
}

#[tokio::test]
async fn test_loop_stops_at_max_iterations() {
    let worker = Arc::new(ScriptedModel::repeating(
        cadence_agent::testing::ScriptStep::Response(LlmResponse::text("again")),
    ));
    let root = AgentDef::loop_agent("repeat", Some(3))
        .with_sub_agent(AgentDef::llm(LlmAgent::new("worker", worker.clone())));
    let runner = Runner::new(
        "test_app",
        AgentTree::build(root).unwrap(),
        Arc::new(InMemorySessionStore::new()),
    );

    let (events, error) = run_text(&runner, "go").await;
    assert!(error.is_none());
    assert_eq!(events.len(), 3);
    assert_eq!(worker.call_count().await, 3);
}

#[tokio::test]
async fn test_sequential_runs_children_in_order() {
    let writer = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("draft v1")]));
    let reviewer = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("approved")]));
    let root = AgentDef::sequential("pipeline")
        .with_sub_agent(AgentDef::llm(LlmAgent::new("writer", writer).with_output_key("draft")))
        .with_sub_agent(AgentDef::llm(
            LlmAgent::new("reviewer", reviewer.clone()).with_instruction("Review: {draft}"),
        ));
    let runner = Runner::new(
        "test_app",
        AgentTree::build(root).unwrap(),
        Arc::new(InMemorySessionStore::new()),
    );

    let (events, error) = run_text(&runner, "write something").await;
    assert!(error.is_none());
    let authors: Vec<&str> = events.iter().map(|e| e.author.as_str()).collect();
    assert_eq!(authors, vec!["writer", "reviewer"]);
    assert_eq!(
        reviewer.requests().await[0].system_instruction.as_deref(),
        Some("Review: draft v1")
    );
}

#[tokio::test]
async fn test_parallel_children_run_on_isolated_branches() {
    let a = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("from a")]));
    let b = Arc::new(ScriptedModel::responses(vec![LlmResponse::text("from b")]));
    let root = AgentDef::parallel("fanout")
        .with_sub_agent(AgentDef::llm(LlmAgent::new("a", a.clone())))
        .with_sub_agent(AgentDef::llm(LlmAgent::new("b", b.clone())));
    let runner = Runner::new(
        "test_app",
        AgentTree::build(root).unwrap(),
        Arc::new(InMemorySessionStore::new()),
    );

    let (events, error) = run_text(&runner, "split").await;
    assert!(error.is_none());
    assert_eq!(events.len(), 2);

    let mut branches: Vec<(String, Option<String>)> = events
        .iter()
        .map(|e| (e.author.clone(), e.branch.clone()))
        .collect();
    branches.sort();
    assert_eq!(
        branches,
        vec![
            ("a".to_string(), Some("fanout.a".to_string())),
            ("b".to_string(), Some("fanout.b".to_string())),
        ]
    );

    // Each child only sees the user message, never its sibling's output.
    assert_eq!(a.requests().await[0].contents.len(), 1);
    assert_eq!(b.requests().await[0].contents.len(), 1);
}

// ---------------------------------------------------------------------------
// Graph validation
// ---------------------------------------------------------------------------

#[test]
fn test_reserved_agent_name_rejected() {
    let model = Arc::new(ScriptedModel::new(Vec::new()));
    let err = AgentTree::build(AgentDef::llm(LlmAgent::new("user", model)))
        .err()
        .unwrap();
    assert!(matches!(err, CadenceError::Config(_)));
}
