//! Dependency graph and its execution.
//!
//! A workflow's declared agents are layered into a linked sequence of
//! `ExecutionNode`s: a node is either one agent or a group of agents whose
//! dependencies are all satisfied by earlier nodes. The `WorkflowExecutor`
//! walks that sequence, honoring pause, abort and plan revisions between
//! nodes.

pub mod builder;
pub mod executor;
pub mod node;

pub use builder::build_execution_tree;
pub use executor::WorkflowExecutor;
pub use node::ExecutionNode;
