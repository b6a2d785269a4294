use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use plait_core::error::{PlaitError, Result};
use plait_core::types::{DeclaredAgent, StreamMessage, StreamMessageKind, TaskId};

use crate::chain::RunRecorder;
use crate::context::ExecutionContext;

/// Executes one declared agent's task.
///
/// Runners are resolved by the declared agent's `name`. Long awaits should
/// go through [`AgentRunContext::guard`] so hard pause and abort can cut them
/// short.
pub trait AgentRunner: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Short capability lines shown to the planner.
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    fn run<'a>(&'a self, ctx: &'a AgentRunContext) -> BoxFuture<'a, Result<String>>;

    /// Asked after a successful run when dynamic re-planning is enabled.
    fn should_replan(&self, ctx: &AgentRunContext) -> bool {
        ctx.replan_requested()
    }
}

/// Planner-facing description of a registered runner.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
}

/// Registry of agent runners keyed by agent type name.
pub struct AgentRegistry {
    runners: HashMap<String, Arc<dyn AgentRunner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
        }
    }

    pub fn register(&mut self, runner: impl AgentRunner) {
        self.register_arc(Arc::new(runner));
    }

    pub fn register_arc(&mut self, runner: Arc<dyn AgentRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AgentRunner>> {
        self.get(name)
            .ok_or_else(|| PlaitError::UnknownAgent(name.to_string()))
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.runners.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Descriptors sorted by name, so prompts are stable.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let mut out: Vec<AgentDescriptor> = self
            .runners
            .values()
            .map(|r| AgentDescriptor {
                name: r.name().to_string(),
                description: r.description().to_string(),
                capabilities: r.capabilities(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a runner sees during one attempt.
pub struct AgentRunContext {
    context: Arc<ExecutionContext>,
    agent: DeclaredAgent,
    recorder: RunRecorder,
    attempt: usize,
    user_messages: Vec<String>,
    replan: AtomicBool,
}

impl AgentRunContext {
    pub fn new(
        context: Arc<ExecutionContext>,
        agent: DeclaredAgent,
        recorder: RunRecorder,
        attempt: usize,
    ) -> Self {
        let user_messages = context.conversation();
        Self {
            context,
            agent,
            recorder,
            attempt,
            user_messages,
            replan: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn task_id(&self) -> &TaskId {
        self.context.task_id()
    }

    pub fn agent(&self) -> &DeclaredAgent {
        &self.agent
    }

    pub fn recorder(&self) -> &RunRecorder {
        &self.recorder
    }

    /// Zero on the first attempt, incremented on each retry.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Messages injected by the user since the last step.
    pub fn user_messages(&self) -> &[String] {
        &self.user_messages
    }

    pub fn max_consecutive_tool_errors(&self) -> usize {
        self.context.config().agent.max_consecutive_tool_errors
    }

    /// Ask the executor to revise the remaining plan after this step.
    pub fn request_replan(&self) {
        self.replan.store(true, Ordering::Relaxed);
    }

    pub fn replan_requested(&self) -> bool {
        self.replan.load(Ordering::Relaxed)
    }

    pub async fn check_aborted(&self) -> Result<()> {
        self.context.check_aborted().await
    }

    /// Publish a stream message attributed to this agent.
    pub fn publish(&self, kind: StreamMessageKind) {
        self.context.event_bus().publish(StreamMessage {
            task_id: self.context.task_id().clone(),
            agent_name: self.agent.name.clone(),
            agent_id: Some(self.agent.id.clone()),
            kind,
        });
    }

    /// Run `fut` as a registered in-flight operation.
    ///
    /// Abort resolves to `Interrupted`; a hard pause resolves to `StepCancelled`.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let op = self.context.register_operation();
        tokio::select! {
            result = fut => result,
            _ = op.token().cancelled() => {
                if self.context.is_cancelled() {
                    Err(self.context.interrupted_error())
                } else {
                    Err(PlaitError::StepCancelled)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_core::config::{AppConfig, ModelConfig};
    use plait_core::event::EventBus;
    use std::time::Duration;

    struct Echo;

    impl AgentRunner for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Repeats its task"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["text".into()]
        }

        fn run<'a>(&'a self, ctx: &'a AgentRunContext) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Ok(ctx.agent().task.clone()) })
        }
    }

    fn run_ctx() -> AgentRunContext {
        let ctx = Arc::new(ExecutionContext::new(
            TaskId::from_str("t"),
            Arc::new(AppConfig::new(ModelConfig::new("test"))),
            Arc::new(EventBus::default()),
        ));
        ctx.push_conversation("be brief");
        let agent = DeclaredAgent::new("1", "echo", "hello");
        let recorder = ctx.chain().start_run(&agent);
        AgentRunContext::new(ctx, agent, recorder, 0)
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = AgentRegistry::new();
        registry.register(Echo);
        assert!(registry.resolve("echo").is_ok());
        assert!(matches!(
            registry.resolve("browser"),
            Err(PlaitError::UnknownAgent(name)) if name == "browser"
        ));
        assert_eq!(registry.list(), vec!["echo"]);
        assert_eq!(registry.descriptors()[0].capabilities, vec!["text"]);
    }

    #[tokio::test]
    async fn run_context_exposes_messages_and_replan_flag() {
        let ctx = run_ctx();
        assert_eq!(ctx.user_messages(), ["be brief".to_string()]);
        assert_eq!(ctx.max_consecutive_tool_errors(), 10);
        assert!(!Echo.should_replan(&ctx));
        ctx.request_replan();
        assert!(Echo.should_replan(&ctx));
        assert_eq!(Echo.run(&ctx).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn guard_maps_hard_pause_to_step_cancelled() {
        let ctx = Arc::new(run_ctx());
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.guard(futures::future::pending::<Result<()>>()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.context().pause(true);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PlaitError::StepCancelled)));
    }

    #[tokio::test]
    async fn guard_maps_abort_to_interrupted() {
        let ctx = Arc::new(run_ctx());
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.guard(futures::future::pending::<Result<()>>()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.context().abort(Some("stop"));
        assert!(handle.await.unwrap().unwrap_err().is_interrupted());
    }

    #[tokio::test]
    async fn guard_passes_through_completion() {
        let ctx = run_ctx();
        let value = ctx.guard(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(ctx.context().in_flight_operations(), 0);
    }
}
