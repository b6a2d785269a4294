use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use plait_core::config::HooksConfig;
use plait_core::error::{PlaitError, Result};
use plait_core::types::{RunResult, Workflow};

use crate::context::ExecutionContext;
use crate::runner::AgentRunContext;

/// What to do about a failed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Run the agent again (bounded by `executor.max_agent_retries`).
    Retry,
    /// Mark the agent done with a placeholder result and continue.
    Skip,
    /// Fail the task.
    Abort,
    /// Fail the task; reported as an escalation in the logs.
    Escalate,
    /// Keep the default handling.
    Continue,
}

impl ErrorDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "skip" => Some(Self::Skip),
            "abort" => Some(Self::Abort),
            "escalate" => Some(Self::Escalate),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

/// Verdict on a successful agent result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AfterAgentAction {
    #[default]
    Accept,
    Retry,
}

/// Observation and policy points around workflow execution.
///
/// Every method has a no-op default. Failures are logged and never change
/// the outcome of the task.
pub trait WorkflowHooks: Send + Sync + 'static {
    fn on_workflow_generated<'a>(
        &'a self,
        _ctx: &'a ExecutionContext,
        _workflow: &'a Workflow,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn on_step_complete<'a>(
        &'a self,
        _ctx: &'a AgentRunContext,
        _result: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn on_workflow_complete<'a>(
        &'a self,
        _ctx: &'a ExecutionContext,
        _result: &'a RunResult,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn after_agent_complete<'a>(
        &'a self,
        _ctx: &'a AgentRunContext,
        _result: &'a str,
    ) -> BoxFuture<'a, Result<AfterAgentAction>> {
        Box::pin(async { Ok(AfterAgentAction::Accept) })
    }

    fn on_agent_error<'a>(
        &'a self,
        _ctx: &'a AgentRunContext,
        _error: &'a PlaitError,
    ) -> BoxFuture<'a, Result<Option<ErrorDecision>>> {
        Box::pin(async { Ok(None) })
    }
}

/// Ordered collection of hooks, invoked one after another.
#[derive(Default, Clone)]
pub struct HookSet {
    hooks: Vec<Arc<dyn WorkflowHooks>>,
}

impl HookSet {
    pub fn new(hooks: Vec<Arc<dyn WorkflowHooks>>) -> Self {
        Self { hooks }
    }

    pub fn push(&mut self, hook: Arc<dyn WorkflowHooks>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn workflow_generated(&self, ctx: &ExecutionContext, workflow: &Workflow) {
        for hook in &self.hooks {
            shielded("on_workflow_generated", hook.on_workflow_generated(ctx, workflow)).await;
        }
    }

    pub async fn step_complete(&self, ctx: &AgentRunContext, result: &str) {
        for hook in &self.hooks {
            shielded("on_step_complete", hook.on_step_complete(ctx, result)).await;
        }
    }

    pub async fn workflow_complete(&self, ctx: &ExecutionContext, result: &RunResult) {
        for hook in &self.hooks {
            shielded("on_workflow_complete", hook.on_workflow_complete(ctx, result)).await;
        }
    }

    /// `Retry` if any hook asks for it.
    pub async fn after_agent_complete(&self, ctx: &AgentRunContext, result: &str) -> AfterAgentAction {
        let mut action = AfterAgentAction::Accept;
        for hook in &self.hooks {
            if let Some(AfterAgentAction::Retry) =
                shielded("after_agent_complete", hook.after_agent_complete(ctx, result)).await
            {
                action = AfterAgentAction::Retry;
            }
        }
        action
    }

    /// First decision other than `Continue`, if any.
    pub async fn agent_error(&self, ctx: &AgentRunContext, error: &PlaitError) -> Option<ErrorDecision> {
        for hook in &self.hooks {
            match shielded("on_agent_error", hook.on_agent_error(ctx, error)).await {
                Some(Some(ErrorDecision::Continue)) | Some(None) | None => continue,
                Some(Some(decision)) => return Some(decision),
            }
        }
        None
    }
}

/// Await a hook future, turning errors and panics into a log line.
async fn shielded<T>(hook: &str, fut: impl Future<Output = Result<T>>) -> Option<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(hook, error = %e, "Hook failed");
            None
        }
        Err(_) => {
            warn!(hook, "Hook panicked");
            None
        }
    }
}

/// Hooks that run shell commands from `[hooks]` config.
///
/// Context is passed through `PLAIT_*` environment variables.
pub struct ShellHooks {
    config: HooksConfig,
}

impl ShellHooks {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }
}

impl WorkflowHooks for ShellHooks {
    fn on_workflow_generated<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        workflow: &'a Workflow,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let agents = workflow.agents.len().to_string();
            run_hooks(
                &self.config.on_workflow_generated,
                &[
                    ("PLAIT_TASK_ID", ctx.task_id().as_str()),
                    ("PLAIT_WORKFLOW_NAME", workflow.name.as_str()),
                    ("PLAIT_AGENT_COUNT", agents.as_str()),
                ],
            )
            .await;
            Ok(())
        })
    }

    fn on_step_complete<'a>(
        &'a self,
        ctx: &'a AgentRunContext,
        result: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            run_hooks(
                &self.config.on_step_complete,
                &[
                    ("PLAIT_TASK_ID", ctx.task_id().as_str()),
                    ("PLAIT_AGENT_ID", ctx.agent().id.as_str()),
                    ("PLAIT_AGENT_NAME", ctx.agent().name.as_str()),
                    ("PLAIT_RESULT", result),
                ],
            )
            .await;
            Ok(())
        })
    }

    fn on_workflow_complete<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        result: &'a RunResult,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let stop_reason = format!("{:?}", result.stop_reason).to_lowercase();
            run_hooks(
                &self.config.on_workflow_complete,
                &[
                    ("PLAIT_TASK_ID", ctx.task_id().as_str()),
                    ("PLAIT_SUCCESS", if result.success { "true" } else { "false" }),
                    ("PLAIT_STOP_REASON", stop_reason.as_str()),
                    ("PLAIT_RESULT", result.result.as_str()),
                ],
            )
            .await;
            Ok(())
        })
    }
}

/// Execute hook commands with environment variables.
/// Fire-and-forget: errors are logged, not propagated.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)]) {
    for cmd in commands {
        debug!(hook = %cmd, "Running hook");
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        match command.status().await {
            Ok(s) if !s.success() => warn!(hook = %cmd, code = s.code(), "Hook exited non-zero"),
            Err(e) => warn!(hook = %cmd, error = %e, "Hook failed to execute"),
            _ => {}
        }
    }
}
