//! Shared mocks and fixtures for Plait tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use plait_agent::{
    to_xml, AfterAgentAction, AgentRunContext, AgentRunner, ErrorDecision, ExecutionContext,
    WorkflowHooks,
};
use plait_core::config::{AppConfig, ModelConfig};
use plait_core::error::{PlaitError, Result};
use plait_core::traits::LlmClient;
use plait_core::types::{
    ChatMessage, DeclaredAgent, RunResult, StopReason, StreamDelta, StreamMessageKind, TaskId,
    Workflow,
};

/// Config with short delays so retry and pause paths run quickly.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::new(ModelConfig::new("mock-model"));
    config.planner.retry_delay_ms = 10;
    config.planner.include_datetime = false;
    config.executor.pause_poll_interval_ms = 20;
    config
}

/// Plan document for `(id, name, task, depends)` tuples.
pub fn plan_xml(name: &str, agents: &[(&str, &str, &str, &[&str])]) -> String {
    let mut workflow = Workflow::new(
        TaskId::from_str("fixture"),
        agents
            .iter()
            .map(|(id, agent, task, depends)| {
                DeclaredAgent::new(*id, *agent, *task)
                    .with_depends(depends.iter().map(|d| d.to_string()).collect())
            })
            .collect(),
    );
    workflow.name = name.to_string();
    to_xml(&workflow)
}

// ── LLM ──────────────────────────────────────────────────────────

/// One scripted response of [`MockLlmClient`].
#[derive(Debug, Clone)]
pub enum Reply {
    /// Stream these chunks, then finish normally.
    Text(Vec<String>),
    /// Fail before streaming starts.
    RequestError(String),
    /// Stream these chunks, then fail mid-stream.
    StreamError { chunks: Vec<String>, message: String },
    /// Stream these chunks, then finish with `reason`.
    Finish { chunks: Vec<String>, reason: StopReason },
    /// Wait `millis` before answering with the inner reply.
    Delayed { millis: u64, reply: Box<Reply> },
}

impl Reply {
    /// `text` split into small chunks, the way a provider streams it.
    pub fn streamed(text: &str) -> Self {
        Self::Text(chunk(text, 24))
    }

    pub fn delayed(self, millis: u64) -> Self {
        Self::Delayed {
            millis,
            reply: Box::new(self),
        }
    }
}

fn chunk(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

pub type RequestLog = Arc<Mutex<Vec<Vec<ChatMessage>>>>;

/// LLM client that plays back scripted replies in order.
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Reply>>,
    requests: RequestLog,
}

impl MockLlmClient {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle on the message lists received so far.
    pub fn request_log(&self) -> RequestLog {
        self.requests.clone()
    }
}

impl LlmClient for MockLlmClient {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests.lock().unwrap().push(messages);
        let mut reply = self.replies.lock().unwrap().pop_front();

        Box::pin(async move {
            while let Some(Reply::Delayed { millis, reply: inner }) = reply {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                reply = Some(*inner);
            }
            let items: Vec<Result<StreamDelta>> = match reply {
                None => return Err(PlaitError::LlmRequest("no scripted reply left".into())),
                Some(Reply::RequestError(message)) => return Err(PlaitError::LlmRequest(message)),
                Some(Reply::Text(chunks)) => text_items(chunks)
                    .chain([Ok(StreamDelta::Stop(StopReason::EndTurn))])
                    .collect(),
                Some(Reply::StreamError { chunks, message }) => text_items(chunks)
                    .chain([Err(PlaitError::LlmStream(message))])
                    .collect(),
                Some(Reply::Finish { chunks, reason }) => text_items(chunks)
                    .chain([Ok(StreamDelta::Stop(reason))])
                    .collect(),
                Some(Reply::Delayed { .. }) => unreachable!("delays are unwrapped above"),
            };
            Ok(stream::iter(items).boxed())
        })
    }
}

fn text_items(chunks: Vec<String>) -> impl Iterator<Item = Result<StreamDelta>> {
    chunks.into_iter().map(|c| Ok(StreamDelta::TextDelta(c)))
}

// ── Runners ──────────────────────────────────────────────────────

/// Shared, ordered event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries starting with `prefix`, prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(String::from))
            .collect()
    }
}

/// Agent runner with per-agent-id behavior.
///
/// Returns `"<id>:<task>"`, with injected user messages appended in brackets.
/// Logs `start:<id>`, `done:<id>` and `fail:<id>` to its [`EventLog`].
pub struct ScriptedRunner {
    name: String,
    delays: HashMap<String, Duration>,
    failures: Mutex<HashMap<String, usize>>,
    blocking: Mutex<HashSet<String>>,
    replan_after: HashSet<String>,
    log: EventLog,
}

impl ScriptedRunner {
    pub fn new(name: impl Into<String>, log: EventLog) -> Self {
        Self {
            name: name.into(),
            delays: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            blocking: Mutex::new(HashSet::new()),
            replan_after: HashSet::new(),
            log,
        }
    }

    pub fn with_delay(mut self, agent_id: &str, millis: u64) -> Self {
        self.delays.insert(agent_id.into(), Duration::from_millis(millis));
        self
    }

    /// Fail the first `times` attempts of `agent_id`.
    pub fn failing(self, agent_id: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(agent_id.into(), times);
        self
    }

    /// Block the first run of `agent_id` until the step is cancelled.
    pub fn blocking(self, agent_id: &str) -> Self {
        self.blocking.lock().unwrap().insert(agent_id.into());
        self
    }

    /// Request a re-plan after `agent_id` succeeds.
    pub fn replan_after(mut self, agent_id: &str) -> Self {
        self.replan_after.insert(agent_id.into());
        self
    }
}

impl AgentRunner for ScriptedRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test agent"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["scripted".into()]
    }

    fn run<'a>(&'a self, ctx: &'a AgentRunContext) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let agent = ctx.agent();
            self.log.push(format!("start:{}", agent.id));

            let call_id = format!("call-{}-{}", agent.id, ctx.attempt());
            ctx.recorder()
                .begin_tool_call(&call_id, "echo", serde_json::json!({ "task": agent.task }));
            ctx.recorder()
                .set_tool_params(&call_id, serde_json::json!({ "text": agent.task }))?;

            let block = self.blocking.lock().unwrap().remove(&agent.id);
            if block {
                ctx.guard(futures::future::pending::<Result<()>>()).await?;
            }
            if let Some(delay) = self.delays.get(&agent.id) {
                let delay = *delay;
                ctx.guard(async move {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }

            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&agent.id) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                self.log.push(format!("fail:{}", agent.id));
                ctx.recorder().complete_tool_call(&call_id, "scripted failure", true)?;
                return Err(PlaitError::AgentExecution {
                    agent: agent.name.clone(),
                    message: "scripted failure".into(),
                });
            }

            let mut output = format!("{}:{}", agent.id, agent.task);
            if !ctx.user_messages().is_empty() {
                output.push_str(&format!(" [{}]", ctx.user_messages().join("; ")));
            }
            ctx.recorder().complete_tool_call(&call_id, &output, false)?;
            ctx.publish(StreamMessageKind::Text {
                text: output.clone(),
                stream_done: true,
            });
            if self.replan_after.contains(&agent.id) {
                ctx.request_replan();
            }
            self.log.push(format!("done:{}", agent.id));
            Ok(output)
        })
    }
}

// ── Hooks ────────────────────────────────────────────────────────

/// Hooks that log every call and answer with configured decisions.
///
/// Entries: `generated:<agents>`, `after:<id>`, `error:<id>`, `step:<id>`,
/// `complete:<success>`.
pub struct RecordingHooks {
    log: EventLog,
    decision: Option<ErrorDecision>,
    result_retries: Mutex<usize>,
    broken: bool,
}

impl RecordingHooks {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            decision: None,
            result_retries: Mutex::new(0),
            broken: false,
        }
    }

    pub fn with_decision(mut self, decision: ErrorDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Reject the next `times` successful results.
    pub fn with_result_retries(self, times: usize) -> Self {
        *self.result_retries.lock().unwrap() = times;
        self
    }

    /// Every hook logs its call, then fails.
    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    fn outcome<T>(&self, value: T) -> Result<T> {
        if self.broken {
            Err(PlaitError::Hook("scripted hook failure".into()))
        } else {
            Ok(value)
        }
    }
}

impl WorkflowHooks for RecordingHooks {
    fn on_workflow_generated<'a>(
        &'a self,
        _ctx: &'a ExecutionContext,
        workflow: &'a Workflow,
    ) -> BoxFuture<'a, Result<()>> {
        self.log.push(format!("generated:{}", workflow.agents.len()));
        Box::pin(async move { self.outcome(()) })
    }

    fn on_step_complete<'a>(
        &'a self,
        ctx: &'a AgentRunContext,
        _result: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        self.log.push(format!("step:{}", ctx.agent().id));
        Box::pin(async move { self.outcome(()) })
    }

    fn on_workflow_complete<'a>(
        &'a self,
        _ctx: &'a ExecutionContext,
        result: &'a RunResult,
    ) -> BoxFuture<'a, Result<()>> {
        self.log.push(format!("complete:{}", result.success));
        Box::pin(async move { self.outcome(()) })
    }

    fn after_agent_complete<'a>(
        &'a self,
        ctx: &'a AgentRunContext,
        _result: &'a str,
    ) -> BoxFuture<'a, Result<AfterAgentAction>> {
        self.log.push(format!("after:{}", ctx.agent().id));
        let action = {
            let mut left = self.result_retries.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                AfterAgentAction::Retry
            } else {
                AfterAgentAction::Accept
            }
        };
        Box::pin(async move { self.outcome(action) })
    }

    fn on_agent_error<'a>(
        &'a self,
        ctx: &'a AgentRunContext,
        _error: &'a PlaitError,
    ) -> BoxFuture<'a, Result<Option<ErrorDecision>>> {
        self.log.push(format!("error:{}", ctx.agent().id));
        let decision = self.decision;
        Box::pin(async move { self.outcome(decision) })
    }
}
