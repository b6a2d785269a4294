use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlaitError;

/// Unique task identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a declared agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Init,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One node of the plan graph: a named unit of work with dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredAgent {
    /// Stable identifier, unique within a workflow.
    pub id: String,
    /// Agent type name, resolved against the runner registry.
    pub name: String,
    /// Natural-language instruction for this agent.
    pub task: String,
    #[serde(default)]
    pub input: Option<String>,
    /// Ids of agents that must complete first.
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub status: AgentStatus,
}

impl DeclaredAgent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task: task.into(),
            input: None,
            depends: vec![],
            status: AgentStatus::Init,
        }
    }

    pub fn with_depends(mut self, depends: Vec<String>) -> Self {
        self.depends = depends;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// A task description plus its ordered collection of declared agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub task_id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub thought: String,
    /// The user request the plan was generated from.
    #[serde(default)]
    pub task_prompt: String,
    pub agents: Vec<DeclaredAgent>,
    /// Raw graph description the agents were parsed from.
    #[serde(default)]
    pub xml: String,
}

impl Workflow {
    pub fn new(task_id: TaskId, agents: Vec<DeclaredAgent>) -> Self {
        Self {
            task_id,
            agents,
            ..Default::default()
        }
    }

    pub fn agent(&self, id: &str) -> Option<&DeclaredAgent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Update an agent's status. Returns false if the id is unknown.
    pub fn set_status(&mut self, id: &str, status: AgentStatus) -> bool {
        match self.agents.iter_mut().find(|a| a.id == id) {
            Some(agent) => {
                agent.status = status;
                true
            }
            None => false,
        }
    }

    /// Agents still waiting to run, in declaration order.
    pub fn pending_agents(&self) -> Vec<DeclaredAgent> {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::Init)
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.agents.iter().all(|a| a.status == AgentStatus::Done)
    }
}

/// Terminal reason of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalReason {
    Done,
    Abort,
    Error,
}

/// The terminal outcome of one `execute` invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub task_id: TaskId,
    pub success: bool,
    pub stop_reason: TerminalReason,
    /// Final textual output, or a `<kind>: <detail>` message on failure.
    pub result: String,
    pub error: Option<Arc<PlaitError>>,
}

impl RunResult {
    pub fn done(task_id: TaskId, result: impl Into<String>) -> Self {
        Self {
            task_id,
            success: true,
            stop_reason: TerminalReason::Done,
            result: result.into(),
            error: None,
        }
    }

    /// Normalize a failure; interruptions become `abort`, everything else `error`.
    pub fn failed(task_id: TaskId, error: PlaitError, aborted: bool) -> Self {
        let stop_reason = if aborted || error.is_interrupted() {
            TerminalReason::Abort
        } else {
            TerminalReason::Error
        };
        Self {
            task_id,
            success: false,
            stop_reason,
            result: error.describe(),
            error: Some(Arc::new(error)),
        }
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the language model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Finish reason reported by the LLM.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    /// The provider refused the content.
    ContentFilter,
    /// Unspecified abnormal termination.
    Other(String),
}

impl StopReason {
    /// Finishes that must fail the attempt instead of yielding a plan.
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::ContentFilter | Self::Other(_))
    }
}

/// A streaming delta from the LLM. Stream errors arrive as `Err` items.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of output text.
    TextDelta(String),

    /// A chunk of reasoning text.
    ThinkingDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Progress message published on the event bus.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub task_id: TaskId,
    /// Declared name of the originating agent (`"Planer"` for plan previews).
    pub agent_name: String,
    pub agent_id: Option<String>,
    pub kind: StreamMessageKind,
}

/// Discriminated payload of a [`StreamMessage`].
#[derive(Debug, Clone)]
pub enum StreamMessageKind {
    /// Plan snapshot; `stream_done` is false for partial previews.
    Workflow { workflow: Workflow, stream_done: bool },
    AgentStart { agent: DeclaredAgent },
    AgentResult {
        agent: DeclaredAgent,
        result: Option<String>,
        error: Option<String>,
    },
    Text { text: String, stream_done: bool },
    Thinking { text: String, stream_done: bool },
    ToolUse {
        tool_name: String,
        tool_call_id: String,
        params: serde_json::Value,
    },
    ToolResult {
        tool_name: String,
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
}

impl StreamMessageKind {
    /// Stable type tag for consumers that switch on strings.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Workflow { .. } => "workflow",
            Self::AgentStart { .. } => "agent_start",
            Self::AgentResult { .. } => "agent_result",
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workflow {
        Workflow::new(
            TaskId::from_str("t1"),
            vec![
                DeclaredAgent::new("1", "fetch", "Fetch page X"),
                DeclaredAgent::new("2", "summarize", "Summarize it").with_depends(vec!["1".into()]),
            ],
        )
    }

    #[test]
    fn test_pending_agents_filters_status() {
        let mut wf = sample();
        assert!(wf.set_status("1", AgentStatus::Done));
        let pending = wf.pending_agents();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "2");
        assert!(!wf.is_complete());
    }

    #[test]
    fn test_set_status_unknown_id() {
        let mut wf = sample();
        assert!(!wf.set_status("9", AgentStatus::Done));
    }

    #[test]
    fn test_run_result_interrupted_is_abort() {
        let r = RunResult::failed(
            TaskId::from_str("t"),
            PlaitError::Interrupted("user".into()),
            false,
        );
        assert!(!r.success);
        assert_eq!(r.stop_reason, TerminalReason::Abort);
        assert!(r.result.starts_with("Interruption: "));
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&AgentStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_abnormal_finish() {
        assert!(StopReason::ContentFilter.is_abnormal());
        assert!(StopReason::Other("unknown".into()).is_abnormal());
        assert!(!StopReason::EndTurn.is_abnormal());
        assert!(!StopReason::MaxTokens.is_abnormal());
    }
}
