use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;

use plait_core::error::{PlaitError, Result};
use plait_core::types::{ChatMessage, DeclaredAgent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The request and raw response of the last plan generation.
#[derive(Debug, Clone)]
pub struct PlanExchange {
    pub request: Vec<ChatMessage>,
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallState {
    PendingParams,
    PendingResult,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// One tool invocation made by an agent run.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    /// Raw request as emitted by the model.
    pub request: Value,
    pub params: Option<Value>,
    pub result: Option<ToolOutcome>,
    pub state: ToolCallState,
}

/// The history of one agent's execution.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub agent: DeclaredAgent,
    pub tools: Vec<ToolCall>,
    pub result: Option<String>,
}

/// Change notifications for chain listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    PlanRecorded,
    RunAppended { agent_id: String },
    ToolCallStarted { agent_id: String, tool_call_id: String, tool_name: String },
    ToolCallParams { agent_id: String, tool_call_id: String },
    ToolCallCompleted { agent_id: String, tool_call_id: String, is_error: bool },
    RunFinished { agent_id: String },
}

/// Write handle for one [`AgentRun`].
#[derive(Clone)]
pub struct RunRecorder {
    run: Arc<Mutex<AgentRun>>,
    events: broadcast::Sender<ChainEvent>,
}

impl RunRecorder {
    fn new(agent: &DeclaredAgent, events: broadcast::Sender<ChainEvent>) -> Self {
        Self {
            run: Arc::new(Mutex::new(AgentRun {
                agent: agent.clone(),
                tools: vec![],
                result: None,
            })),
            events,
        }
    }

    pub fn agent_id(&self) -> String {
        lock(&self.run).agent.id.clone()
    }

    fn emit(&self, event: ChainEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    pub fn begin_tool_call(
        &self,
        id: impl Into<String>,
        tool_name: impl Into<String>,
        request: Value,
    ) {
        let id = id.into();
        let tool_name = tool_name.into();
        let agent_id = {
            let mut run = lock(&self.run);
            run.tools.push(ToolCall {
                id: id.clone(),
                tool_name: tool_name.clone(),
                request,
                params: None,
                result: None,
                state: ToolCallState::PendingParams,
            });
            run.agent.id.clone()
        };
        self.emit(ChainEvent::ToolCallStarted {
            agent_id,
            tool_call_id: id,
            tool_name,
        });
    }

    /// Attach resolved parameters. Valid only while params are pending.
    pub fn set_tool_params(&self, id: &str, params: Value) -> Result<()> {
        let agent_id = {
            let mut run = lock(&self.run);
            let agent_id = run.agent.id.clone();
            let call = find_call(&mut run.tools, id)?;
            if call.state != ToolCallState::PendingParams {
                return Err(PlaitError::InvalidToolTransition(format!(
                    "{id}: params already set ({:?})",
                    call.state
                )));
            }
            call.params = Some(params);
            call.state = ToolCallState::PendingResult;
            agent_id
        };
        self.emit(ChainEvent::ToolCallParams {
            agent_id,
            tool_call_id: id.to_string(),
        });
        Ok(())
    }

    /// Attach the tool's result. Valid only once params are set.
    pub fn complete_tool_call(&self, id: &str, content: impl Into<String>, is_error: bool) -> Result<()> {
        let agent_id = {
            let mut run = lock(&self.run);
            let agent_id = run.agent.id.clone();
            let call = find_call(&mut run.tools, id)?;
            if call.state != ToolCallState::PendingResult {
                return Err(PlaitError::InvalidToolTransition(format!(
                    "{id}: cannot complete from {:?}",
                    call.state
                )));
            }
            call.result = Some(ToolOutcome {
                content: content.into(),
                is_error,
            });
            call.state = ToolCallState::Complete;
            agent_id
        };
        self.emit(ChainEvent::ToolCallCompleted {
            agent_id,
            tool_call_id: id.to_string(),
            is_error,
        });
        Ok(())
    }

    pub fn set_result(&self, text: impl Into<String>) {
        let agent_id = {
            let mut run = lock(&self.run);
            run.result = Some(text.into());
            run.agent.id.clone()
        };
        self.emit(ChainEvent::RunFinished { agent_id });
    }

    pub fn snapshot(&self) -> AgentRun {
        lock(&self.run).clone()
    }
}

fn find_call<'a>(tools: &'a mut [ToolCall], id: &str) -> Result<&'a mut ToolCall> {
    tools
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| PlaitError::InvalidToolTransition(format!("unknown tool call {id}")))
}

/// Append-only history of a task: the plan exchange plus agent runs in
/// execution order. Survives `reset`.
pub struct Chain {
    plan: Mutex<Option<PlanExchange>>,
    runs: Mutex<Vec<RunRecorder>>,
    events: broadcast::Sender<ChainEvent>,
}

impl Chain {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            plan: Mutex::new(None),
            runs: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn set_plan(&self, exchange: PlanExchange) {
        *lock(&self.plan) = Some(exchange);
        let _ = self.events.send(ChainEvent::PlanRecorded);
    }

    pub fn plan(&self) -> Option<PlanExchange> {
        lock(&self.plan).clone()
    }

    /// A recorder not yet part of the history. Used for concurrent runs,
    /// which are appended afterwards in declaration order.
    pub fn recorder(&self, agent: &DeclaredAgent) -> RunRecorder {
        RunRecorder::new(agent, self.events.clone())
    }

    pub fn append(&self, recorder: RunRecorder) {
        let agent_id = recorder.agent_id();
        lock(&self.runs).push(recorder);
        let _ = self.events.send(ChainEvent::RunAppended { agent_id });
    }

    /// Create a recorder and append it immediately.
    pub fn start_run(&self, agent: &DeclaredAgent) -> RunRecorder {
        let recorder = self.recorder(agent);
        self.append(recorder.clone());
        recorder
    }

    pub fn runs(&self) -> Vec<AgentRun> {
        lock(&self.runs).iter().map(RunRecorder::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.runs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}
