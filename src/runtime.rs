//! Composition root wiring admission, registry, tasks and metrics together.
//!
//! [`ToolRuntime`] is what the HTTP layer (or an embedding application)
//! holds. It owns the two invocation paths: `submit_task` for the
//! 202-Accepted protocol and `invoke` for synchronous execution, which
//! bypasses the task machine entirely and raises structured errors straight
//! to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::admission::{AdmissionGateway, RateLimiter, ScopeAuthorizer};
use crate::config::RuntimeConfig;
use crate::error::{CapabilityError, ErrorCode, InvokeError, TaskError};
use crate::metrics::{MetricsSink, INVOCATIONS_TOTAL, INVOCATION_SECONDS, TIMEOUTS_TOTAL};
use crate::registry::{CapabilityRegistry, InvocationContext};
use crate::tasks::manager::caller_class;
use crate::tasks::{InMemoryTaskStore, TaskManager, TaskPriority};

/// The tool-invocation runtime.
pub struct ToolRuntime {
    config: RuntimeConfig,
    metrics: Arc<MetricsSink>,
    registry: Arc<CapabilityRegistry>,
    gateway: AdmissionGateway,
    tasks: Arc<TaskManager>,
}

impl std::fmt::Debug for ToolRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRuntime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ToolRuntime {
    /// Assemble a runtime from a configuration and a scope table, with the
    /// default in-memory stores.
    pub fn new(config: RuntimeConfig, authorizer: ScopeAuthorizer) -> Self {
        let metrics = Arc::new(MetricsSink::new());
        let registry = Arc::new(CapabilityRegistry::new());
        let gateway = AdmissionGateway::new(
            config.clone(),
            authorizer,
            RateLimiter::new(config.rate),
            Arc::clone(&metrics),
        );
        let tasks = Arc::new(TaskManager::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.tool_timeout,
            config.task_ttl,
        ));
        Self {
            config,
            metrics,
            registry,
            gateway,
            tasks,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn gateway(&self) -> &AdmissionGateway {
        &self.gateway
    }

    // ---- Invocation paths ----

    /// Asynchronous path: admit, then allocate a `PENDING` task and hand it
    /// to the worker pool. Admission failures never create a task.
    pub fn submit_task(
        &self,
        subject: &str,
        tool: &str,
        payload: Value,
        caller_scopes: &[String],
        priority: TaskPriority,
    ) -> Result<Uuid, InvokeError> {
        if !self.registry.contains(tool) {
            return Err(InvokeError::UnknownTool {
                tool: tool.to_string(),
            });
        }
        self.gateway.admit(subject, tool, &payload, caller_scopes)?;
        Ok(self.tasks.submit(tool, payload, subject, priority))
    }

    /// Synchronous path: admit, then run the capability inline under its
    /// timeout. Does not touch the task state machine.
    pub async fn invoke(
        &self,
        subject: &str,
        tool: &str,
        payload: Value,
        caller_scopes: &[String],
    ) -> Result<Value, InvokeError> {
        if !self.registry.contains(tool) {
            return Err(InvokeError::UnknownTool {
                tool: tool.to_string(),
            });
        }
        self.gateway.admit(subject, tool, &payload, caller_scopes)?;

        let capability = self
            .registry
            .load(tool)
            .ok_or_else(|| InvokeError::UnknownTool {
                tool: tool.to_string(),
            })?;
        let timeout = capability.timeout().unwrap_or(self.config.tool_timeout);
        let ctx = InvocationContext::detached();
        let caller = caller_class(subject).to_string();
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, capability.invoke(payload, &ctx)).await;
        let elapsed = started.elapsed();

        match outcome {
            Err(_) => {
                self.metrics.incr(TIMEOUTS_TOTAL, &[("tool", tool)]);
                self.record_invocation(tool, "timeout", &caller, elapsed);
                Err(InvokeError::Failed(TaskError::new(
                    ErrorCode::Timeout,
                    format!("invocation exceeded {:?} deadline", timeout),
                )))
            }
            Ok(Err(err @ CapabilityError::Cancelled)) => {
                self.record_invocation(tool, "cancelled", &caller, elapsed);
                Err(InvokeError::Failed(err.into()))
            }
            Ok(Err(err)) => {
                self.record_invocation(tool, "failed", &caller, elapsed);
                Err(InvokeError::Failed(err.into()))
            }
            Ok(Ok(result)) => {
                self.record_invocation(tool, "completed", &caller, elapsed);
                Ok(result)
            }
        }
    }

    fn record_invocation(&self, tool: &str, outcome: &str, caller: &str, elapsed: Duration) {
        self.metrics.incr(
            INVOCATIONS_TOTAL,
            &[("tool", tool), ("outcome", outcome), ("caller", caller)],
        );
        self.metrics
            .observe_seconds(INVOCATION_SECONDS, &[("tool", tool)], elapsed.as_secs_f64());
    }

    // ---- Background services ----

    /// Start the configured number of task workers.
    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        self.tasks.spawn_workers(self.config.workers)
    }

    /// Start the TTL sweeper on a fixed cadence.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        self.tasks.run_sweeper(Duration::from_secs(60))
    }

    /// Signal background services to stop.
    pub fn shutdown(&self) {
        self.tasks.shutdown();
    }
}
