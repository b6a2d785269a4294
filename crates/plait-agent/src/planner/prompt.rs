use chrono::Local;

use plait_core::types::Workflow;

use crate::chain::AgentRun;
use crate::runner::AgentDescriptor;

const PLANNING_INSTRUCTIONS: &str = "\
You are a planner. Break the user's request into steps, each handled by one \
of the agents listed below. Reply with a single XML document and nothing else.

Format:
<root>
  <name>short task name</name>
  <thought>how the steps fit together</thought>
  <agents>
    <agent name=\"AGENT_NAME\" id=\"1\">
      <task>what this agent must do</task>
    </agent>
    <agent name=\"AGENT_NAME\" id=\"2\" depends=\"1\">
      <task>what this agent must do with the result of step 1</task>
    </agent>
  </agents>
</root>

Rules:
- Use only agent names from the list below.
- Ids are unique within the plan.
- `depends` is a comma-separated list of ids that must finish first.
  Steps without a dependency between them run side by side.
- Never introduce a dependency cycle.";

/// System prompt: planning instructions followed by the agent catalogue.
pub fn system_prompt(agents: &[AgentDescriptor], custom: Option<&str>) -> String {
    let mut prompt = custom.unwrap_or(PLANNING_INSTRUCTIONS).to_string();
    prompt.push_str("\n\n## Available agents\n");
    for agent in agents {
        prompt.push_str(&format!("\n- {}: {}", agent.name, agent.description));
        for capability in &agent.capabilities {
            prompt.push_str(&format!("\n  - {capability}"));
        }
    }
    prompt
}

pub fn plan_request(task_prompt: &str, include_datetime: bool) -> String {
    let mut out = format!("Task: {task_prompt}");
    if include_datetime {
        out.push_str(&format!(
            "\n\nCurrent datetime: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

/// Follow-up turn asking for a revised plan.
///
/// Lists what already ran so the model keeps finished steps and plans only
/// the remaining work.
pub fn replan_request(instruction: &str, current: Option<&Workflow>, runs: &[AgentRun]) -> String {
    let mut out = String::from("The plan needs to change.\n");

    if let Some(workflow) = current {
        let steps: Vec<String> = workflow
            .agents
            .iter()
            .map(|a| format!("- [{}] {} ({}): {}", a.status, a.id, a.name, a.task))
            .collect();
        if !steps.is_empty() {
            out.push_str("\nCurrent steps:\n");
            out.push_str(&steps.join("\n"));
            out.push('\n');
        }
    }

    let results: Vec<String> = runs
        .iter()
        .filter_map(|r| {
            r.result
                .as_ref()
                .map(|text| format!("- {} ({}): {}", r.agent.id, r.agent.name, text))
        })
        .collect();
    if !results.is_empty() {
        out.push_str("\nResults so far:\n");
        out.push_str(&results.join("\n"));
        out.push('\n');
    }

    out.push_str(&format!("\nChange request: {instruction}\n"));
    out.push_str(
        "\nReply with the complete revised plan in the same XML format. \
         Steps marked [done] have finished; reuse their ids in `depends` \
         when later steps need their output, but do not list them again.",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use plait_core::types::{AgentStatus, DeclaredAgent, TaskId};

    fn catalogue() -> Vec<AgentDescriptor> {
        vec![AgentDescriptor {
            name: "fetch".into(),
            description: "Downloads web pages".into(),
            capabilities: vec!["http".into()],
        }]
    }

    #[test]
    fn system_prompt_lists_agents() {
        let prompt = system_prompt(&catalogue(), None);
        assert!(prompt.contains("<root>"));
        assert!(prompt.contains("- fetch: Downloads web pages"));
        assert!(prompt.contains("  - http"));
    }

    #[test]
    fn custom_instructions_replace_builtin() {
        let prompt = system_prompt(&catalogue(), Some("Plan carefully."));
        assert!(prompt.starts_with("Plan carefully."));
        assert!(!prompt.contains("Rules:"));
    }

    #[test]
    fn plan_request_datetime_is_optional() {
        assert_eq!(plan_request("do x", false), "Task: do x");
        assert!(plan_request("do x", true).contains("Current datetime:"));
    }

    #[test]
    fn replan_request_mentions_finished_work() {
        let mut wf = Workflow::new(
            TaskId::from_str("t"),
            vec![DeclaredAgent::new("1", "fetch", "Fetch page X")],
        );
        wf.set_status("1", AgentStatus::Done);
        let runs = vec![AgentRun {
            agent: wf.agents[0].clone(),
            tools: vec![],
            result: Some("<html>".into()),
        }];
        let text = replan_request("use page Y instead", Some(&wf), &runs);
        assert!(text.contains("[done] 1 (fetch)"));
        assert!(text.contains("- 1 (fetch): <html>"));
        assert!(text.contains("Change request: use page Y instead"));
    }
}
