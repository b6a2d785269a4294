use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaitError {
    // Interruption
    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    #[error("Step cancelled while paused")]
    StepCancelled,

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response rejected: {0}")]
    LlmRejected(String),

    // Plan / graph errors
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Workflow has no agents")]
    EmptyWorkflow,

    #[error("Circular dependency among agents: {0}")]
    CircularDependency(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgent(String),

    #[error("Duplicate agent id: {0}")]
    DuplicateAgentId(String),

    // Execution errors
    #[error("Agent execution failed: {agent}: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Invalid tool call transition: {0}")]
    InvalidToolTransition(String),

    // Hook errors
    #[error("Hook failed: {0}")]
    Hook(String),

    // Task registry errors
    #[error("Task does not exist: {0}")]
    TaskNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for run results and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Interruption,
    Transport,
    Execution,
    Configuration,
    Hook,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Interruption => "Interruption",
            Self::Transport => "TransportError",
            Self::Execution => "ExecutionError",
            Self::Configuration => "ConfigurationError",
            Self::Hook => "HookError",
        };
        f.write_str(name)
    }
}

impl PlaitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Interrupted(_) | Self::StepCancelled => ErrorKind::Interruption,
            Self::LlmRequest(_) | Self::LlmStream(_) | Self::LlmRejected(_) => ErrorKind::Transport,
            Self::AgentExecution { .. }
            | Self::ToolExecution { .. }
            | Self::InvalidToolTransition(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Execution,
            Self::PlanParse(_)
            | Self::EmptyWorkflow
            | Self::CircularDependency(_)
            | Self::UnknownAgent(_)
            | Self::DuplicateAgentId(_)
            | Self::TaskNotFound(_)
            | Self::Config(_)
            | Self::ConfigNotFound(_) => ErrorKind::Configuration,
            Self::Hook(_) => ErrorKind::Hook,
        }
    }

    /// True when the master cancellation signal unwound the task.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Message in the `<kind>: <detail>` shape used by run results.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

pub type Result<T> = std::result::Result<T, PlaitError>;
