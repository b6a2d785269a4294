use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use plait_core::config::AppConfig;
use plait_core::error::{PlaitError, Result};
use plait_core::event::EventBus;
use plait_core::traits::LlmClient;
use plait_core::types::{RunResult, StreamMessage, TaskId, Workflow};

use crate::context::ExecutionContext;
use crate::graph::WorkflowExecutor;
use crate::hooks::{HookSet, ShellHooks, WorkflowHooks};
use crate::planner::Planner;
use crate::runner::{AgentRegistry, AgentRunner};

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Box<dyn LlmClient>,
    fallbacks: Vec<Box<dyn LlmClient>>,
    registry: AgentRegistry,
    hooks: Vec<Arc<dyn WorkflowHooks>>,
    event_bus: Option<Arc<EventBus>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, llm: Box<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            fallbacks: vec![],
            registry: AgentRegistry::new(),
            hooks: vec![],
            event_bus: None,
        }
    }

    /// Client for the next entry of `fallback_models`.
    pub fn with_fallback(mut self, client: Box<dyn LlmClient>) -> Self {
        self.fallbacks.push(client);
        self
    }

    pub fn with_runner(mut self, runner: impl AgentRunner) -> Self {
        self.registry.register(runner);
        self
    }

    pub fn with_runner_arc(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.registry.register_arc(runner);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn build(self) -> Orchestrator {
        let mut hooks = HookSet::new(self.hooks);
        if let Some(shell) = self.config.hooks.clone().filter(|h| !h.is_empty()) {
            hooks.push(Arc::new(ShellHooks::new(shell)));
        }

        let llm: Arc<dyn LlmClient> =
            Arc::from(plait_llm::with_retry(self.llm, &self.config, self.fallbacks));
        let planner = Planner::new(
            llm,
            self.config.model.clone(),
            self.config.planner.clone(),
            self.registry.descriptors(),
        );
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_bus_capacity)));

        Orchestrator {
            config: Arc::new(self.config),
            registry: Arc::new(self.registry),
            planner: Arc::new(planner),
            hooks: Arc::new(hooks),
            event_bus,
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

/// Task registry: plans, runs and controls tasks by id.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    registry: Arc<AgentRegistry>,
    planner: Arc<Planner>,
    hooks: Arc<HookSet>,
    event_bus: Arc<EventBus>,
    tasks: RwLock<HashMap<TaskId, Arc<ExecutionContext>>>,
}

impl Orchestrator {
    pub fn builder(config: AppConfig, llm: Box<dyn LlmClient>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, llm)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.event_bus.subscribe()
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Arc<ExecutionContext>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn new_context(&self, task_id: TaskId) -> Arc<ExecutionContext> {
        let ctx = Arc::new(ExecutionContext::new(
            task_id.clone(),
            self.config.clone(),
            self.event_bus.clone(),
        ));
        let previous = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, ctx.clone());
        if let Some(previous) = previous {
            warn!(task_id = %ctx.task_id(), "Replacing existing task");
            previous.abort(Some("Task replaced"));
        }
        ctx
    }

    fn remove(&self, task_id: &TaskId) -> Option<Arc<ExecutionContext>> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
    }

    /// Plan a new task. A failed plan leaves no task behind.
    pub async fn generate(&self, task_prompt: &str, task_id: Option<TaskId>) -> Result<Workflow> {
        let ctx = self.new_context(task_id.unwrap_or_default());
        match self.planner.plan(&ctx, task_prompt).await {
            Ok(workflow) => {
                ctx.set_workflow(workflow.clone());
                self.hooks.workflow_generated(&ctx, &workflow).await;
                Ok(workflow)
            }
            Err(e) => {
                error!(task_id = %ctx.task_id(), error = %e, "Plan generation failed");
                self.remove(ctx.task_id());
                Err(e)
            }
        }
    }

    /// Register a task with an already built workflow, skipping planning.
    pub async fn load(&self, workflow: Workflow) -> Arc<ExecutionContext> {
        let ctx = self.new_context(workflow.task_id.clone());
        ctx.set_workflow(workflow.clone());
        self.hooks.workflow_generated(&ctx, &workflow).await;
        ctx
    }

    /// Execute a task. Never fails: every outcome is folded into the result.
    pub async fn execute(&self, task_id: &TaskId) -> RunResult {
        let Some(ctx) = self.get_task(task_id) else {
            warn!(task_id = %task_id, "Execute on unknown task");
            return RunResult::failed(
                task_id.clone(),
                PlaitError::TaskNotFound(task_id.to_string()),
                false,
            );
        };
        if ctx.is_cancelled() {
            ctx.reset();
        }

        let executor = WorkflowExecutor::new(self.registry.clone(), self.hooks.clone())
            .with_planner(self.planner.clone());
        let result = match executor.execute(&ctx).await {
            Ok(output) => {
                info!(task_id = %task_id, "Task completed");
                RunResult::done(task_id.clone(), output)
            }
            Err(e) => {
                let aborted = ctx.is_cancelled();
                if aborted || e.is_interrupted() {
                    info!(task_id = %task_id, reason = %e, "Task aborted");
                } else {
                    error!(task_id = %task_id, error = %e, "Task failed");
                }
                RunResult::failed(task_id.clone(), e, aborted)
            }
        };

        self.hooks.workflow_complete(&ctx, &result).await;
        result
    }

    /// Generate and execute in one call.
    pub async fn run(&self, task_prompt: &str) -> Result<RunResult> {
        let workflow = self.generate(task_prompt, None).await?;
        Ok(self.execute(&workflow.task_id).await)
    }

    /// Revise a task's plan with a new instruction.
    ///
    /// An unknown id is planned from scratch under that id. If the task is
    /// running, the executor switches to the revised plan after the current
    /// step.
    pub async fn modify(&self, task_id: &TaskId, instruction: &str) -> Result<Workflow> {
        let Some(ctx) = self.get_task(task_id) else {
            return self.generate(instruction, Some(task_id.clone())).await;
        };
        if ctx.is_cancelled() {
            ctx.reset();
        }
        ctx.clear_conversation();
        let revised = self.planner.replan(&ctx, instruction).await?;
        // Merged against the live workflow: agents may have finished while
        // the revision was being planned.
        let workflow = ctx.submit_revision(revised);
        self.hooks.workflow_generated(&ctx, &workflow).await;
        Ok(workflow)
    }

    /// Pause a task. Returns false for unknown ids.
    pub fn pause(&self, task_id: &TaskId, abort_current_step: bool) -> bool {
        match self.get_task(task_id) {
            Some(ctx) => {
                ctx.pause(abort_current_step);
                true
            }
            None => false,
        }
    }

    pub fn resume(&self, task_id: &TaskId) -> bool {
        match self.get_task(task_id) {
            Some(ctx) => {
                ctx.resume();
                true
            }
            None => false,
        }
    }

    pub fn abort(&self, task_id: &TaskId, reason: Option<&str>) -> bool {
        match self.get_task(task_id) {
            Some(ctx) => {
                ctx.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Abort a task, clear its variables and forget it.
    pub fn delete(&self, task_id: &TaskId) -> bool {
        match self.remove(task_id) {
            Some(ctx) => {
                ctx.abort(Some("Task deleted"));
                ctx.clear_variables();
                info!(task_id = %task_id, "Task deleted");
                true
            }
            None => false,
        }
    }

    /// Queue a user message for the task's next agent run.
    pub fn inject_message(&self, task_id: &TaskId, text: &str) -> bool {
        match self.get_task(task_id) {
            Some(ctx) => {
                ctx.push_conversation(text);
                true
            }
            None => false,
        }
    }
}
