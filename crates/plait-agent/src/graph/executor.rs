use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use plait_core::error::{PlaitError, Result};
use plait_core::types::{AgentStatus, DeclaredAgent, StreamMessage, StreamMessageKind, Workflow};

use super::builder::build_execution_tree;
use super::node::ExecutionNode;
use crate::chain::RunRecorder;
use crate::context::ExecutionContext;
use crate::hooks::{AfterAgentAction, ErrorDecision, HookSet};
use crate::planner::Planner;
use crate::runner::{AgentRegistry, AgentRunContext};

/// Result of asking the planner for a revision between steps.
#[derive(Debug)]
pub enum ReplanOutcome {
    Unchanged,
    Revised(Workflow),
}

/// What one agent or one node produced.
#[derive(Debug, Default)]
struct StepOutcome {
    /// `None` when the step was cut short and has nothing to report.
    text: Option<String>,
    replan: bool,
    /// A hard pause cancelled an agent of this step.
    cancelled: bool,
}

/// Walks a task's execution tree node by node.
pub struct WorkflowExecutor {
    registry: Arc<AgentRegistry>,
    hooks: Arc<HookSet>,
    planner: Option<Arc<Planner>>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<AgentRegistry>, hooks: Arc<HookSet>) -> Self {
        Self {
            registry,
            hooks,
            planner: None,
        }
    }

    /// Enable dynamic re-planning through `planner`.
    pub fn with_planner(mut self, planner: Arc<Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Run the task's workflow to completion and return the last step's output.
    ///
    /// Only agents not yet `done` are scheduled, so re-executing a partially
    /// finished task picks up where it stopped.
    pub async fn execute(&self, ctx: &Arc<ExecutionContext>) -> Result<String> {
        let mut workflow = ctx.workflow().ok_or(PlaitError::EmptyWorkflow)?;
        // Revisions submitted while idle are already part of the workflow.
        let _ = ctx.take_revision();
        // Agents left running or failed by an earlier run are scheduled again.
        let mut rescheduled = false;
        for agent in &mut workflow.agents {
            if matches!(agent.status, AgentStatus::Running | AgentStatus::Error) {
                agent.status = AgentStatus::Init;
                rescheduled = true;
            }
        }
        if rescheduled {
            ctx.set_workflow(workflow.clone());
        }
        let mut current = self.tree_for(&workflow)?;
        let mut output = String::new();

        info!(
            task_id = %ctx.task_id(),
            agents = workflow.agents.len(),
            pending = workflow.pending_agents().len(),
            "Executing workflow"
        );

        while let Some(node) = current {
            ctx.check_aborted().await?;

            let step = match &node {
                ExecutionNode::Serial { agent, .. } => {
                    let recorder = ctx.chain().start_run(agent);
                    self.run_agent(ctx, agent, recorder).await?
                }
                ExecutionNode::Parallel { agents, .. } => self.run_parallel(ctx, agents).await?,
            };
            if let Some(text) = step.text {
                output = text;
            }
            if step.cancelled {
                // Nothing after a cancelled step is decided until resume.
                ctx.check_aborted().await?;
            }

            let conversation = ctx.take_conversation();

            let mut revision = ctx.take_revision();
            if revision.is_none()
                && step.replan
                && node.next().is_some()
                && ctx.config().executor.dynamic_replan
            {
                if let ReplanOutcome::Revised(workflow) = self.replan(ctx, &conversation).await? {
                    revision = Some(workflow);
                }
            }

            if let Some(revised) = revision {
                let merged = ctx.merge_revision(revised);
                current = self.tree_for(&merged)?;
                info!(
                    task_id = %ctx.task_id(),
                    pending = merged.pending_agents().len(),
                    "Workflow revised, rebuilding execution tree"
                );
                continue;
            }

            current = node.into_next();
        }

        // Agents cancelled by a hard pause are left in `error` for the next
        // `execute` to pick up; the run itself did not finish the plan.
        let unfinished: Vec<String> = ctx
            .workflow()
            .map(|wf| {
                wf.agents
                    .into_iter()
                    .filter(|a| a.status == AgentStatus::Error)
                    .map(|a| a.id)
                    .collect()
            })
            .unwrap_or_default();
        if !unfinished.is_empty() {
            warn!(
                task_id = %ctx.task_id(),
                agents = %unfinished.join(", "),
                "Workflow ended with cancelled agents"
            );
            return Err(PlaitError::StepCancelled);
        }

        info!(task_id = %ctx.task_id(), "Workflow finished");
        Ok(output)
    }

    /// Build the tree for the pending agents, resolving every agent type first.
    fn tree_for(&self, workflow: &Workflow) -> Result<Option<ExecutionNode>> {
        if workflow.agents.is_empty() {
            return Err(PlaitError::EmptyWorkflow);
        }
        let pending = workflow.pending_agents();
        if pending.is_empty() {
            return Ok(None);
        }
        for agent in &pending {
            self.registry.resolve(&agent.name)?;
        }
        build_execution_tree(&pending).map(Some)
    }

    async fn run_parallel(
        &self,
        ctx: &Arc<ExecutionContext>,
        agents: &[DeclaredAgent],
    ) -> Result<StepOutcome> {
        let outcomes: Vec<Result<StepOutcome>> = if ctx.agent_parallel() {
            debug!(task_id = %ctx.task_id(), count = agents.len(), "Running agents concurrently");
            let recorders: Vec<RunRecorder> = agents.iter().map(|a| ctx.chain().recorder(a)).collect();
            let results = join_all(
                agents
                    .iter()
                    .zip(&recorders)
                    .map(|(agent, recorder)| self.run_agent(ctx, agent, recorder.clone())),
            )
            .await;
            // History follows declaration order, not completion order.
            for recorder in recorders {
                ctx.chain().append(recorder);
            }
            results
        } else {
            let mut results = Vec::with_capacity(agents.len());
            for (i, agent) in agents.iter().enumerate() {
                if i > 0 {
                    ctx.check_aborted().await?;
                }
                let recorder = ctx.chain().start_run(agent);
                let result = self.run_agent(ctx, agent, recorder).await;
                let failed = result.is_err();
                results.push(result);
                if failed {
                    break;
                }
            }
            results
        };

        let mut texts = Vec::new();
        let mut replan = false;
        let mut cancelled = false;
        for outcome in outcomes {
            let outcome = outcome?;
            texts.extend(outcome.text);
            replan |= outcome.replan;
            cancelled |= outcome.cancelled;
        }
        Ok(StepOutcome {
            text: (!texts.is_empty()).then(|| texts.join("\n\n")),
            replan,
            cancelled,
        })
    }

    async fn run_agent(
        &self,
        ctx: &Arc<ExecutionContext>,
        agent: &DeclaredAgent,
        recorder: RunRecorder,
    ) -> Result<StepOutcome> {
        let runner = self.registry.resolve(&agent.name)?;
        let max_retries = ctx.config().executor.max_agent_retries;
        let mut attempt = 0;

        ctx.set_agent_status(&agent.id, AgentStatus::Running);
        publish(ctx, agent, StreamMessageKind::AgentStart { agent: agent.clone() });
        info!(
            task_id = %ctx.task_id(),
            agent_id = %agent.id,
            agent_name = %agent.name,
            "Agent started"
        );

        loop {
            let run_ctx = AgentRunContext::new(ctx.clone(), agent.clone(), recorder.clone(), attempt);
            let outcome = match runner.run(&run_ctx).await {
                // A runner that ignored the signal still ends as an interruption.
                Err(e) if ctx.is_cancelled() && !e.is_interrupted() => Err(ctx.interrupted_error()),
                other => other,
            };

            let err = match outcome {
                Ok(text) => {
                    if attempt < max_retries
                        && self.hooks.after_agent_complete(&run_ctx, &text).await == AfterAgentAction::Retry
                    {
                        attempt += 1;
                        info!(agent_id = %agent.id, attempt, "Result rejected by hook, re-running agent");
                        continue;
                    }
                    let replan = runner.should_replan(&run_ctx);
                    self.finish(&run_ctx, &recorder, &text).await;
                    return Ok(StepOutcome {
                        text: Some(text),
                        replan,
                        cancelled: false,
                    });
                }
                Err(e) => e,
            };

            if err.is_interrupted() {
                fail(ctx, agent, &err);
                return Err(err);
            }

            warn!(
                task_id = %ctx.task_id(),
                agent_id = %agent.id,
                attempt,
                error = %err,
                "Agent failed"
            );

            let decision = self.hooks.agent_error(&run_ctx, &err).await;
            match decision {
                Some(ErrorDecision::Retry) if attempt < max_retries => {
                    attempt += 1;
                    ctx.set_agent_status(&agent.id, AgentStatus::Init);
                    info!(agent_id = %agent.id, attempt, "Retrying agent");
                    if matches!(err, PlaitError::StepCancelled) {
                        // Re-run only once the pause that cancelled it is lifted.
                        ctx.check_aborted().await?;
                    }
                    ctx.set_agent_status(&agent.id, AgentStatus::Running);
                    continue;
                }
                Some(ErrorDecision::Skip) => {
                    let text = format!("Skipped due to error: {err}");
                    info!(agent_id = %agent.id, "Agent skipped");
                    self.finish(&run_ctx, &recorder, &text).await;
                    return Ok(StepOutcome {
                        text: Some(text),
                        replan: false,
                        cancelled: false,
                    });
                }
                Some(ErrorDecision::Retry) => {
                    warn!(agent_id = %agent.id, max_retries, "Agent retries exhausted");
                }
                Some(ErrorDecision::Escalate) => {
                    warn!(agent_id = %agent.id, "Agent failure escalated");
                }
                _ => {}
            }

            fail(ctx, agent, &err);
            if matches!(err, PlaitError::StepCancelled) && decision != Some(ErrorDecision::Abort) {
                info!(agent_id = %agent.id, "Step cancelled by pause; continuing once resumed");
                return Ok(StepOutcome {
                    cancelled: true,
                    ..StepOutcome::default()
                });
            }
            return Err(err);
        }
    }

    async fn finish(&self, run_ctx: &AgentRunContext, recorder: &RunRecorder, text: &str) {
        let ctx = run_ctx.context();
        let agent = run_ctx.agent();
        recorder.set_result(text);
        ctx.set_agent_status(&agent.id, AgentStatus::Done);
        publish(
            ctx,
            agent,
            StreamMessageKind::AgentResult {
                agent: agent.clone(),
                result: Some(text.to_string()),
                error: None,
            },
        );
        info!(task_id = %ctx.task_id(), agent_id = %agent.id, "Agent done");
        self.hooks.step_complete(run_ctx, text).await;
    }

    async fn replan(&self, ctx: &Arc<ExecutionContext>, conversation: &[String]) -> Result<ReplanOutcome> {
        let Some(planner) = &self.planner else {
            debug!(task_id = %ctx.task_id(), "Re-plan requested but no planner configured");
            return Ok(ReplanOutcome::Unchanged);
        };
        let instruction = if conversation.is_empty() {
            "Re-evaluate the remaining steps given the results so far.".to_string()
        } else {
            conversation.join("\n")
        };
        info!(task_id = %ctx.task_id(), "Re-planning workflow");
        let workflow = planner.replan(ctx, &instruction).await?;
        self.hooks.workflow_generated(ctx, &workflow).await;
        Ok(ReplanOutcome::Revised(workflow))
    }
}

fn fail(ctx: &ExecutionContext, agent: &DeclaredAgent, err: &PlaitError) {
    ctx.set_agent_status(&agent.id, AgentStatus::Error);
    publish(
        ctx,
        agent,
        StreamMessageKind::AgentResult {
            agent: agent.clone(),
            result: None,
            error: Some(err.to_string()),
        },
    );
    error!(task_id = %ctx.task_id(), agent_id = %agent.id, error = %err, "Agent errored");
}

fn publish(ctx: &ExecutionContext, agent: &DeclaredAgent, kind: StreamMessageKind) {
    ctx.event_bus().publish(StreamMessage {
        task_id: ctx.task_id().clone(),
        agent_name: agent.name.clone(),
        agent_id: Some(agent.id.clone()),
        kind,
    });
}
