use crate::tool::Tool;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Total number of attempts made to discover tools from a remote provider.
pub const DISCOVERY_ATTEMPTS: u32 = 3;

/// A provider of tools resolved at request time (e.g. a tool server).
#[async_trait]
pub trait Toolset: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the tools currently offered, in the provider's order.
    async fn tools(&self) -> CadenceResult<Vec<Arc<dyn Tool>>>;

    /// Releases any connection held by the toolset.
    async fn close(&self) -> CadenceResult<()> {
        Ok(())
    }
}

/// Allow-list restricting the advertised tool set by name.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    allowed: Option<HashSet<String>>,
}

impl ToolFilter {
    /// A filter that lets every tool through.
    pub fn all() -> Self {
        Self { allowed: None }
    }

    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.as_ref().map_or(true, |set| set.contains(name))
    }

    /// Keeps only allowed tools, preserving the provider's declared order.
    pub fn apply(&self, tools: Vec<Arc<dyn Tool>>) -> Vec<Arc<dyn Tool>> {
        tools.into_iter().filter(|t| self.allows(t.name())).collect()
    }
}

/// Runs `attempt` up to [`DISCOVERY_ATTEMPTS`] times, returning the first
/// success. Any error counts as a failed attempt; no backoff is applied.
///
/// Exhaustion yields [`CadenceError::ToolLoading`] carrying the last error.
pub async fn retry_discovery<T, F, Fut>(provider: &str, mut attempt: F) -> CadenceResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CadenceResult<T>>,
{
    let mut last_error = String::new();
    for n in 1..=DISCOVERY_ATTEMPTS {
        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    info!(provider = %provider, attempt = n, "Tool discovery recovered");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(
                    provider = %provider,
                    attempt = n,
                    max_attempts = DISCOVERY_ATTEMPTS,
                    error = %e,
                    "Tool discovery attempt failed"
                );
                last_error = e.to_string();
            }
        }
    }
    Err(CadenceError::ToolLoading {
        attempts: DISCOVERY_ATTEMPTS,
        message: last_error,
    })
}
