#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult, StateMap};
use cadence_tools::*;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Toolset whose discovery fails a configurable number of times.
struct FlakyToolset {
    failures_before_success: u32,
    discovery_calls: AtomicU32,
    filter: ToolFilter,
}

impl FlakyToolset {
    fn new(failures_before_success: u32, filter: ToolFilter) -> Self {
        Self {
            failures_before_success,
            discovery_calls: AtomicU32::new(0),
            filter,
        }
    }

    async fn discover_once(&self) -> CadenceResult<Vec<Arc<dyn Tool>>> {
        let n = self.discovery_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures_before_success {
            return Err(CadenceError::Http(format!("server not ready ({n})")));
        }
        Ok(vec![
            Arc::new(prime_tool()) as Arc<dyn Tool>,
            Arc::new(EchoTool::new()),
            Arc::new(ExitLoopTool::new()),
        ])
    }
}

#[async_trait]
impl Toolset for FlakyToolset {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn tools(&self) -> CadenceResult<Vec<Arc<dyn Tool>>> {
        let tools = retry_discovery(self.name(), |_| self.discover_once()).await?;
        Ok(self.filter.apply(tools))
    }
}

fn prime_tool() -> FunctionTool {
    FunctionTool::new(
        ToolDeclaration::new(
            "check_prime",
            "Reports which of the given numbers are prime.",
            json!({
                "type": "object",
                "properties": {"nums": {"type": "array", "items": {"type": "integer"}}},
                "required": ["nums"],
            }),
        ),
        |args, _ctx| {
            let nums = args
                .get("nums")
                .and_then(Value::as_array)
                .ok_or_else(|| CadenceError::tool("check_prime", "missing 'nums'"))?;
            let primes: Vec<i64> = nums
                .iter()
                .filter_map(Value::as_i64)
                .filter(|&n| n > 1 && (2..n).take_while(|d| d * d <= n).all(|d| n % d != 0))
                .collect();
            if primes.is_empty() {
                Ok(json!("No prime numbers found."))
            } else {
                Ok(json!(format!("{primes:?} are prime numbers.")))
            }
        },
    )
}

// ---------------------------------------------------------------------------
// 1. Discovery retry contract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_fails_twice_then_succeeds() {
    let toolset = FlakyToolset::new(2, ToolFilter::all());
    let tools = toolset.tools().await.unwrap();
    assert_eq!(tools.len(), 3);
    assert_eq!(toolset.discovery_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn discovery_exhaustion_raises_tool_loading() {
    let toolset = FlakyToolset::new(10, ToolFilter::all());
    let err = toolset.tools().await.err().unwrap();
    assert!(matches!(err, CadenceError::ToolLoading { attempts: 3, .. }));
    assert!(!err.is_plugin_interceptable());
    assert_eq!(toolset.discovery_calls.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// 2. Filtering and invocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filtered_toolset_into_registry() {
    let toolset = FlakyToolset::new(0, ToolFilter::allow(["exit_loop", "check_prime"]));
    let registry: ToolRegistry = toolset.tools().await.unwrap().into_iter().collect();

    let names: Vec<_> = registry.declarations().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["check_prime", "exit_loop"]);

    let tool = registry.get("check_prime").unwrap();
    let mut ctx = ToolContext::new("inv", "math", "c1", StateMap::new());
    let mut args = Map::new();
    args.insert("nums".into(), json!([6]));
    let out = tool.invoke(args, &mut ctx).await.unwrap();
    assert_eq!(out["result"], json!("No prime numbers found."));

    let mut args = Map::new();
    args.insert("nums".into(), json!([4, 5, 7]));
    let out = tool.invoke(args, &mut ctx).await.unwrap();
    assert_eq!(out["result"], json!("[5, 7] are prime numbers."));
}
