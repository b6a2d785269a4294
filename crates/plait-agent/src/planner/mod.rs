//! Plan generation: drive one streaming LLM call per attempt and turn the
//! reply into a [`Workflow`].

pub mod prompt;
pub mod xml;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use plait_core::config::{ModelConfig, PlannerConfig};
use plait_core::error::{PlaitError, Result};
use plait_core::traits::LlmClient;
use plait_core::types::{
    AgentStatus, ChatMessage, StreamDelta, StreamMessage, StreamMessageKind, Workflow,
};

use crate::chain::PlanExchange;
use crate::context::ExecutionContext;
use crate::runner::AgentDescriptor;

pub use xml::{parse_workflow, to_xml};

/// `agent_name` carried by plan preview messages.
pub const PLANNER_NAME: &str = "Planer";

/// Generates and revises workflows.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    config: PlannerConfig,
    agents: Vec<AgentDescriptor>,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        config: PlannerConfig,
        agents: Vec<AgentDescriptor>,
    ) -> Self {
        Self {
            llm,
            model,
            config,
            agents,
        }
    }

    /// Fresh plan for `task_prompt`. The exchange is stored on the chain so a
    /// later `replan` can continue the conversation.
    pub async fn plan(&self, ctx: &ExecutionContext, task_prompt: &str) -> Result<Workflow> {
        let request = vec![
            ChatMessage::system(prompt::system_prompt(
                &self.agents,
                self.config.system_prompt.as_deref(),
            )),
            ChatMessage::user(prompt::plan_request(task_prompt, self.config.include_datetime)),
        ];

        let response = self.stream_with_retry(ctx, &request).await?;
        let mut workflow = xml::parse_workflow(ctx.task_id().clone(), &response, true)?;
        workflow.task_prompt = task_prompt.to_string();

        ctx.chain().set_plan(PlanExchange { request, response });
        self.publish(ctx, &workflow, true);
        info!(
            task_id = %ctx.task_id(),
            agents = workflow.agents.len(),
            name = %workflow.name,
            "Plan generated"
        );
        Ok(workflow)
    }

    /// Revise the current plan.
    ///
    /// Continues the stored exchange with a new user turn; falls back to
    /// `plan` when the task was never planned. Finished agents of the
    /// current workflow are carried over.
    pub async fn replan(&self, ctx: &ExecutionContext, instruction: &str) -> Result<Workflow> {
        let Some(exchange) = ctx.chain().plan() else {
            debug!(task_id = %ctx.task_id(), "No stored plan, planning from scratch");
            return self.plan(ctx, instruction).await;
        };

        let current = ctx.workflow();
        let mut request = exchange.request;
        request.push(ChatMessage::assistant(exchange.response));
        request.push(ChatMessage::user(prompt::replan_request(
            instruction,
            current.as_ref(),
            &ctx.chain().runs(),
        )));

        let response = self.stream_with_retry(ctx, &request).await?;
        let revised = xml::parse_workflow(ctx.task_id().clone(), &response, true)?;
        let workflow = match &current {
            Some(previous) => merge_replan(previous, revised),
            None => revised,
        };

        self.publish(ctx, &workflow, true);
        info!(
            task_id = %ctx.task_id(),
            agents = workflow.agents.len(),
            "Plan revised"
        );
        Ok(workflow)
    }

    async fn stream_with_retry(&self, ctx: &ExecutionContext, request: &[ChatMessage]) -> Result<String> {
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt: u32 = 0;
        loop {
            match self.stream_once(ctx, request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_interrupted() || matches!(e, PlaitError::LlmRejected(_)) => {
                    return Err(e)
                }
                Err(e) if attempt >= self.config.max_retries => {
                    warn!(task_id = %ctx.task_id(), error = %e, "Plan generation failed, retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        task_id = %ctx.task_id(),
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "Plan generation failed, retrying"
                    );
                    let cancel = ctx.cancel_token();
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ctx.interrupted_error()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn stream_once(&self, ctx: &ExecutionContext, request: &[ChatMessage]) -> Result<String> {
        let cancel = ctx.cancel_token();
        let mut stream = tokio::select! {
            result = self.llm.chat_stream(&self.model, request.to_vec()) => result?,
            _ = cancel.cancelled() => return Err(ctx.interrupted_error()),
        };

        let mut text = String::new();
        let mut thinking = String::new();
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => return Err(ctx.interrupted_error()),
            };
            let Some(delta) = next else { break };
            match delta? {
                StreamDelta::TextDelta(chunk) => {
                    text.push_str(&chunk);
                    self.preview(ctx, &text);
                }
                StreamDelta::ThinkingDelta(chunk) => thinking.push_str(&chunk),
                StreamDelta::Stop(reason) if reason.is_abnormal() => {
                    return Err(PlaitError::LlmRejected(format!("{reason:?}")));
                }
                StreamDelta::Stop(reason) => {
                    debug!(task_id = %ctx.task_id(), ?reason, "Plan stream finished");
                }
                StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    debug!(input_tokens, output_tokens, "Plan token usage");
                }
            }
        }

        if !thinking.is_empty() {
            debug!(task_id = %ctx.task_id(), chars = thinking.len(), "Planner reasoning received");
        }
        Ok(text)
    }

    /// Publish a partial plan if anyone is listening and the prefix parses.
    fn preview(&self, ctx: &ExecutionContext, text: &str) {
        if !ctx.event_bus().has_subscribers() {
            return;
        }
        match xml::parse_workflow(ctx.task_id().clone(), text, false) {
            Ok(workflow) => self.publish(ctx, &workflow, false),
            Err(e) => debug!(error = %e, "Partial plan not parseable yet"),
        }
    }

    fn publish(&self, ctx: &ExecutionContext, workflow: &Workflow, stream_done: bool) {
        ctx.event_bus().publish(StreamMessage {
            task_id: ctx.task_id().clone(),
            agent_name: PLANNER_NAME.to_string(),
            agent_id: None,
            kind: StreamMessageKind::Workflow {
                workflow: workflow.clone(),
                stream_done,
            },
        });
    }
}

/// Combine a revised plan with the finished part of the previous one.
///
/// Done and running agents keep their status and position; revised agents
/// whose ids belong to them are dropped, the rest are appended as `init`.
pub fn merge_replan(previous: &Workflow, revised: Workflow) -> Workflow {
    let kept: Vec<_> = previous
        .agents
        .iter()
        .filter(|a| matches!(a.status, AgentStatus::Done | AgentStatus::Running))
        .cloned()
        .collect();
    let kept_ids: HashSet<String> = kept.iter().map(|a| a.id.clone()).collect();

    let mut agents = kept;
    for mut agent in revised.agents {
        if kept_ids.contains(&agent.id) {
            continue;
        }
        agent.status = AgentStatus::Init;
        agents.push(agent);
    }

    Workflow {
        task_id: previous.task_id.clone(),
        name: if revised.name.is_empty() {
            previous.name.clone()
        } else {
            revised.name
        },
        thought: revised.thought,
        task_prompt: previous.task_prompt.clone(),
        agents,
        xml: revised.xml,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_core::types::{DeclaredAgent, TaskId};

    #[test]
    fn merge_keeps_done_agents_and_appends_new_work() {
        let mut previous = Workflow::new(
            TaskId::from_str("t"),
            vec![
                DeclaredAgent::new("1", "fetch", "Fetch page X"),
                DeclaredAgent::new("2", "summarize", "Summarize it").with_depends(vec!["1".into()]),
            ],
        );
        previous.name = "Report".into();
        previous.task_prompt = "fetch then summarize".into();
        previous.set_status("1", AgentStatus::Done);

        let revised = Workflow::new(
            TaskId::from_str("t"),
            vec![
                DeclaredAgent::new("1", "fetch", "Fetch page Y"),
                DeclaredAgent::new("3", "translate", "Translate it").with_depends(vec!["1".into()]),
            ],
        );

        let merged = merge_replan(&previous, revised);
        let ids: Vec<&str> = merged.agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(merged.agents[0].status, AgentStatus::Done);
        assert_eq!(merged.agents[0].task, "Fetch page X");
        assert_eq!(merged.agents[1].status, AgentStatus::Init);
        assert_eq!(merged.name, "Report");
        assert_eq!(merged.task_prompt, "fetch then summarize");
        assert_eq!(merged.pending_agents().len(), 1);
    }

    #[test]
    fn merge_keeps_the_agent_in_flight() {
        let mut previous = Workflow::new(
            TaskId::from_str("t"),
            vec![
                DeclaredAgent::new("1", "fetch", "x"),
                DeclaredAgent::new("2", "summarize", "y").with_depends(vec!["1".into()]),
            ],
        );
        previous.set_status("1", AgentStatus::Running);
        let revised = Workflow::new(
            TaskId::from_str("t"),
            vec![
                DeclaredAgent::new("1", "fetch", "x"),
                DeclaredAgent::new("3", "translate", "z").with_depends(vec!["1".into()]),
            ],
        );
        let merged = merge_replan(&previous, revised);
        let ids: Vec<&str> = merged.agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(merged.agents[0].status, AgentStatus::Running);
        assert_eq!(merged.pending_agents().len(), 1);
    }

    #[test]
    fn merge_is_stable_when_reapplied() {
        let mut previous = Workflow::new(
            TaskId::from_str("t"),
            vec![DeclaredAgent::new("1", "fetch", "x")],
        );
        previous.set_status("1", AgentStatus::Done);
        let revised = Workflow::new(
            TaskId::from_str("t"),
            vec![DeclaredAgent::new("2", "summarize", "y")],
        );
        let once = merge_replan(&previous, revised);
        let twice = merge_replan(&once, once.clone());
        assert_eq!(once.agents, twice.agents);
    }
}
