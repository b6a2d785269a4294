#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use plait_agent::{ExecutionContext, Orchestrator};
use plait_core::config::AppConfig;
use plait_core::types::{StreamMessage, StreamMessageKind};
use plait_test_utils::{
    plan_xml, EventLog, MockLlmClient, RecordingHooks, Reply, RequestLog, ScriptedRunner,
};
use tokio::sync::broadcast;

/// Orchestrator wired to scripted collaborators, plus handles on their logs.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    /// `start:` / `done:` / `fail:` entries from the runner.
    pub runs: EventLog,
    /// Hook calls in order.
    pub hooks: EventLog,
    pub requests: RequestLog,
}

pub fn harness(
    config: AppConfig,
    replies: Vec<Reply>,
    runner: impl FnOnce(ScriptedRunner) -> ScriptedRunner,
    hooks: impl FnOnce(RecordingHooks) -> RecordingHooks,
) -> Harness {
    let runs = EventLog::default();
    let hook_log = EventLog::default();
    let llm = MockLlmClient::new(replies);
    let requests = llm.request_log();

    let orchestrator = Orchestrator::builder(config, Box::new(llm))
        .with_runner(runner(ScriptedRunner::new("worker", runs.clone())))
        .with_hooks(Arc::new(hooks(RecordingHooks::new(hook_log.clone()))))
        .build();

    Harness {
        orchestrator: Arc::new(orchestrator),
        runs,
        hooks: hook_log,
        requests,
    }
}

/// Harness with default runner and hook behavior.
pub fn simple(config: AppConfig, replies: Vec<Reply>) -> Harness {
    harness(config, replies, |r| r, |h| h)
}

/// Plan reply for worker agents given as `(id, task, depends)`.
pub fn plan(agents: &[(&str, &str, &[&str])]) -> Reply {
    let rows: Vec<(&str, &str, &str, &[&str])> = agents
        .iter()
        .map(|(id, task, depends)| (*id, "worker", *task, *depends))
        .collect();
    Reply::streamed(&plan_xml("Test plan", &rows))
}

/// Wait until an in-flight operation is registered on `ctx`.
pub async fn wait_for_operation(ctx: &ExecutionContext) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.in_flight_operations() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no operation started in time");
}

/// Wait for the `AgentStart` message of `agent_id`.
pub async fn wait_for_start(rx: &mut broadcast::Receiver<StreamMessage>, agent_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            };
            if let StreamMessageKind::AgentStart { agent } = &msg.kind {
                if agent.id == agent_id {
                    return;
                }
            }
        }
    })
    .await
    .expect("agent did not start in time");
}
