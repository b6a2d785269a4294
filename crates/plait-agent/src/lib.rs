pub mod chain;
pub mod context;
pub mod graph;
pub mod hooks;
pub mod orchestrator;
pub mod planner;
pub mod runner;

pub use chain::{AgentRun, Chain, ChainEvent, PlanExchange, RunRecorder, ToolCall, ToolCallState};
pub use context::{ExecutionContext, OperationGuard, PauseState};
pub use graph::executor::ReplanOutcome;
pub use graph::{build_execution_tree, ExecutionNode, WorkflowExecutor};
pub use hooks::{AfterAgentAction, ErrorDecision, HookSet, ShellHooks, WorkflowHooks};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use planner::{merge_replan, parse_workflow, to_xml, Planner};
pub use runner::{AgentDescriptor, AgentRegistry, AgentRunContext, AgentRunner};
