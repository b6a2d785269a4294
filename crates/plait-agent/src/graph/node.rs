use std::fmt;

use plait_core::types::DeclaredAgent;

/// One step of an execution sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionNode {
    /// A single agent.
    Serial {
        agent: DeclaredAgent,
        next: Option<Box<ExecutionNode>>,
    },
    /// Agents that become ready together and may run concurrently.
    Parallel {
        agents: Vec<DeclaredAgent>,
        next: Option<Box<ExecutionNode>>,
    },
}

impl ExecutionNode {
    /// The agents of this node, in declaration order.
    pub fn agents(&self) -> &[DeclaredAgent] {
        match self {
            Self::Serial { agent, .. } => std::slice::from_ref(agent),
            Self::Parallel { agents, .. } => agents,
        }
    }

    pub fn next(&self) -> Option<&ExecutionNode> {
        match self {
            Self::Serial { next, .. } | Self::Parallel { next, .. } => next.as_deref(),
        }
    }

    pub fn into_next(self) -> Option<ExecutionNode> {
        match self {
            Self::Serial { next, .. } | Self::Parallel { next, .. } => next.map(|n| *n),
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel { .. })
    }

    /// Agent ids per node, following `next` links.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        let mut current = Some(self);
        while let Some(node) = current {
            out.push(node.agents().iter().map(|a| a.id.clone()).collect());
            current = node.next();
        }
        out
    }

    /// Every agent in traversal order.
    pub fn flatten(&self) -> Vec<&DeclaredAgent> {
        let mut out = Vec::new();
        let mut current = Some(self);
        while let Some(node) = current {
            out.extend(node.agents());
            current = node.next();
        }
        out
    }

    /// Number of nodes in the sequence starting here.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut current = Some(self);
        while let Some(node) = current {
            count += 1;
            current = node.next();
        }
        count
    }
}

/// Renders as `1 -> [2, 3] -> 4`.
impl fmt::Display for ExecutionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .layers()
            .into_iter()
            .map(|ids| {
                if ids.len() == 1 {
                    ids[0].clone()
                } else {
                    format!("[{}]", ids.join(", "))
                }
            })
            .collect();
        f.write_str(&parts.join(" -> "))
    }
}
