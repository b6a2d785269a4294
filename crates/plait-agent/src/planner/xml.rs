//! Tolerant reader and writer for the plan document.
//!
//! ```xml
//! <root>
//!   <name>Weather report</name>
//!   <thought>Fetch first, then summarize.</thought>
//!   <agents>
//!     <agent name="fetch" id="1">
//!       <task>Fetch page X</task>
//!     </agent>
//!     <agent name="summarize" id="2" depends="1">
//!       <task>Summarize it</task>
//!     </agent>
//!   </agents>
//! </root>
//! ```
//!
//! Model output is rarely clean: prose or code fences around the document,
//! stray `<` in task text. The reader skips everything before `<root` and
//! after `</root>`. In partial mode (used while a response is still
//! streaming) unterminated tags are dropped and open elements are closed.

use std::collections::HashSet;

use plait_core::error::{PlaitError, Result};
use plait_core::types::{DeclaredAgent, TaskId, Workflow};

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn new(name: String, attrs: Vec<(String, String)>) -> Self {
        Self {
            name,
            attrs,
            children: vec![],
        }
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Direct text content, trimmed.
    fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let Node::Text(t) = child {
                out.push_str(t);
            }
        }
        out.trim().to_string()
    }
}

fn decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn parse_attrs(input: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            if chars.next().is_none() {
                break;
            }
            continue;
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            attrs.push((key, String::new()));
            continue;
        }
        chars.next(); // consume '='
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                for c in chars.by_ref() {
                    if c == quote {
                        break;
                    }
                    value.push(c);
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        attrs.push((key, decode(&value)));
    }
    attrs
}

/// Parse the `<root>` element out of `input`.
fn parse_root(input: &str, done: bool) -> Result<Element> {
    let start = input
        .find("<root")
        .ok_or_else(|| PlaitError::PlanParse("missing <root> element".into()))?;
    let src = &input[start..];

    let mut stack: Vec<Element> = vec![Element::default()];
    let mut pos = 0;

    while pos < src.len() {
        let Some(offset) = src[pos..].find('<') else {
            push_text(&mut stack, &src[pos..]);
            break;
        };
        let lt = pos + offset;
        if lt > pos {
            push_text(&mut stack, &src[pos..lt]);
        }

        let rest = &src[lt + 1..];
        if rest.starts_with("!--") {
            match rest.find("-->") {
                Some(end) => {
                    pos = lt + 1 + end + 3;
                    continue;
                }
                None if done => return Err(PlaitError::PlanParse("unterminated comment".into())),
                None => break,
            }
        }

        // A '<' that cannot open a tag is ordinary text.
        let opens_tag = rest
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
        if !opens_tag {
            if rest.is_empty() && !done {
                break;
            }
            push_text(&mut stack, "<");
            pos = lt + 1;
            continue;
        }

        let Some(gt) = rest.find('>') else {
            if done {
                return Err(PlaitError::PlanParse("unterminated tag".into()));
            }
            break;
        };
        let inner = &rest[..gt];
        pos = lt + 1 + gt + 1;

        if inner.starts_with('!') || inner.starts_with('?') {
            continue;
        }

        if let Some(close) = inner.strip_prefix('/') {
            let name = close.trim();
            let matches_top = stack.last().is_some_and(|e| e.name == name);
            if matches_top {
                close_top(&mut stack);
            } else if done {
                return Err(PlaitError::PlanParse(format!("unexpected </{name}>")));
            } else if stack.iter().skip(1).any(|e| e.name == name) {
                while stack.last().is_some_and(|e| e.name != name) {
                    close_top(&mut stack);
                }
                close_top(&mut stack);
            }
            if stack.len() == 1 && name == "root" {
                break;
            }
            continue;
        }

        let (body, self_closing) = match inner.strip_suffix('/') {
            Some(body) => (body, true),
            None => (inner, false),
        };
        let name_end = body.find(char::is_whitespace).unwrap_or(body.len());
        let name = body[..name_end].to_string();
        let element = Element::new(name, parse_attrs(&body[name_end..]));
        if self_closing {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(Node::Element(element));
            }
        } else {
            stack.push(element);
        }
    }

    if stack.len() > 1 {
        if done {
            let open = stack.last().map(|e| e.name.clone()).unwrap_or_default();
            return Err(PlaitError::PlanParse(format!("unclosed <{open}>")));
        }
        while stack.len() > 1 {
            close_top(&mut stack);
        }
    }

    let document = stack.pop().unwrap_or_default();
    document
        .children
        .into_iter()
        .find_map(|c| match c {
            Node::Element(e) if e.name == "root" => Some(e),
            _ => None,
        })
        .ok_or_else(|| PlaitError::PlanParse("missing <root> element".into()))
}

fn push_text(stack: &mut [Element], text: &str) {
    if let Some(top) = stack.last_mut() {
        top.children.push(Node::Text(decode(text)));
    }
}

fn close_top(stack: &mut Vec<Element>) {
    if stack.len() < 2 {
        return;
    }
    if let Some(element) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(Node::Element(element));
        }
    }
}

/// Parse a plan document into a workflow.
///
/// With `done == false` the input may be a truncated prefix: incomplete
/// agents are skipped and nothing is validated. With `done == true` every
/// agent needs a name, an id and a task, ids must be unique and at least one
/// agent must be declared.
pub fn parse_workflow(task_id: TaskId, xml: &str, done: bool) -> Result<Workflow> {
    let root = parse_root(xml, done)?;

    let name = root.child("name").map(Element::text).unwrap_or_default();
    let thought = root.child("thought").map(Element::text).unwrap_or_default();

    let mut agents = Vec::new();
    let declared = root
        .child("agents")
        .into_iter()
        .flat_map(|list| list.elements().filter(|e| e.name == "agent"));

    for (index, el) in declared.enumerate() {
        let agent_name = el.attr("name").map(str::trim).unwrap_or_default();
        let id = el.attr("id").map(str::trim).unwrap_or_default();
        let task = match el.child("task") {
            Some(t) => t.text(),
            None => el.text(),
        };

        if done {
            if agent_name.is_empty() {
                return Err(PlaitError::PlanParse(format!(
                    "agent #{} has no name",
                    index + 1
                )));
            }
            if id.is_empty() {
                return Err(PlaitError::PlanParse(format!(
                    "agent `{agent_name}` has no id"
                )));
            }
            if task.is_empty() {
                return Err(PlaitError::PlanParse(format!("agent {id} has no task")));
            }
        } else if agent_name.is_empty() {
            continue;
        }

        let id = if id.is_empty() {
            index.to_string()
        } else {
            id.to_string()
        };
        let depends = el
            .attr("depends")
            .map(|d| {
                d.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut agent = DeclaredAgent::new(id, agent_name, task).with_depends(depends);
        if let Some(input) = el.child("input").map(Element::text).filter(|s| !s.is_empty()) {
            agent = agent.with_input(input);
        }
        agents.push(agent);
    }

    if done {
        if agents.is_empty() {
            return Err(PlaitError::EmptyWorkflow);
        }
        let mut seen = HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(PlaitError::DuplicateAgentId(agent.id.clone()));
            }
        }
    }

    Ok(Workflow {
        task_id,
        name,
        thought,
        task_prompt: String::new(),
        agents,
        xml: xml.to_string(),
    })
}

/// Serialize a workflow back into a plan document.
pub fn to_xml(workflow: &Workflow) -> String {
    let mut out = String::from("<root>\n");
    out.push_str(&format!("  <name>{}</name>\n", escape(&workflow.name)));
    if !workflow.thought.is_empty() {
        out.push_str(&format!("  <thought>{}</thought>\n", escape(&workflow.thought)));
    }
    out.push_str("  <agents>\n");
    for agent in &workflow.agents {
        out.push_str(&format!(
            "    <agent name=\"{}\" id=\"{}\"",
            escape(&agent.name),
            escape(&agent.id)
        ));
        if !agent.depends.is_empty() {
            out.push_str(&format!(" depends=\"{}\"", escape(&agent.depends.join(","))));
        }
        out.push_str(">\n");
        out.push_str(&format!("      <task>{}</task>\n", escape(&agent.task)));
        if let Some(input) = &agent.input {
            out.push_str(&format!("      <input>{}</input>\n", escape(input)));
        }
        out.push_str("    </agent>\n");
    }
    out.push_str("  </agents>\n</root>\n");
    out
}
