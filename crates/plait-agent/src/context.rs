use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use plait_core::config::AppConfig;
use plait_core::error::{PlaitError, Result};
use plait_core::event::EventBus;
use plait_core::types::{AgentStatus, TaskId, Workflow};

use crate::chain::Chain;
use crate::planner::merge_replan;

/// Variable that overrides `executor.agent_parallel` for one task.
pub const AGENT_PARALLEL_VAR: &str = "agent_parallel";

/// Pause state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PauseState {
    Running = 0,
    /// New node dispatch is blocked; the in-flight node runs to completion.
    SoftPaused = 1,
    /// Like soft pause, and every registered in-flight operation is cancelled.
    HardPaused = 2,
}

type OperationSet = Arc<Mutex<HashMap<u64, CancellationToken>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A cancelable sub-operation registered with the context.
///
/// Hard pause and abort cancel its token. Dropping the guard deregisters it.
pub struct OperationGuard {
    id: u64,
    token: CancellationToken,
    operations: OperationSet,
}

impl OperationGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        lock(&self.operations).remove(&self.id);
    }
}

/// Per-task mutable state: cancellation, pause, in-flight operations,
/// variables, the conversation buffer, the current workflow and its history.
pub struct ExecutionContext {
    task_id: TaskId,
    config: Arc<AppConfig>,
    event_bus: Arc<EventBus>,
    chain: Arc<Chain>,
    cancel: Mutex<CancellationToken>,
    abort_reason: Mutex<Option<String>>,
    pause: watch::Sender<PauseState>,
    operations: OperationSet,
    next_operation: AtomicU64,
    variables: RwLock<HashMap<String, Value>>,
    conversation: Mutex<Vec<String>>,
    workflow: RwLock<Option<Workflow>>,
    revision_tx: mpsc::UnboundedSender<Workflow>,
    revision_rx: Mutex<mpsc::UnboundedReceiver<Workflow>>,
}

impl ExecutionContext {
    pub fn new(task_id: TaskId, config: Arc<AppConfig>, event_bus: Arc<EventBus>) -> Self {
        let (pause, _) = watch::channel(PauseState::Running);
        let (revision_tx, revision_rx) = mpsc::unbounded_channel();
        Self {
            task_id,
            config,
            event_bus,
            chain: Arc::new(Chain::new()),
            cancel: Mutex::new(CancellationToken::new()),
            abort_reason: Mutex::new(None),
            pause,
            operations: Arc::new(Mutex::new(HashMap::new())),
            next_operation: AtomicU64::new(0),
            variables: RwLock::new(HashMap::new()),
            conversation: Mutex::new(Vec::new()),
            workflow: RwLock::new(None),
            revision_tx,
            revision_rx: Mutex::new(revision_rx),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    // ── Cancellation and pause ─────────────────────────────────

    /// The current master cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.cancel).is_cancelled()
    }

    pub fn pause_state(&self) -> PauseState {
        *self.pause.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.pause_state() != PauseState::Running
    }

    /// The error raised when the master signal has fired.
    pub fn interrupted_error(&self) -> PlaitError {
        let reason = lock(&self.abort_reason)
            .clone()
            .unwrap_or_else(|| "Operation was interrupted".to_string());
        PlaitError::Interrupted(reason)
    }

    /// Fail if aborted; while paused, wait until resumed or aborted.
    ///
    /// Resume wakes the waiter immediately. The configured poll interval
    /// bounds how long a waiter sleeps between state checks.
    pub async fn check_aborted(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(self.interrupted_error());
        }

        let poll = Duration::from_millis(self.config.executor.pause_poll_interval_ms.max(1));
        let mut rx = self.pause.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state == PauseState::Running {
                return Ok(());
            }
            let token = self.cancel_token();
            tokio::select! {
                _ = token.cancelled() => {}
                _ = rx.changed() => {}
                _ = tokio::time::sleep(poll) => {}
            }
            if self.is_cancelled() {
                return Err(self.interrupted_error());
            }
        }
    }

    /// Block new node dispatch; with `abort_current_step`, also cancel every
    /// registered in-flight operation.
    pub fn pause(&self, abort_current_step: bool) {
        let state = if abort_current_step {
            PauseState::HardPaused
        } else {
            PauseState::SoftPaused
        };
        self.pause.send_replace(state);
        if abort_current_step {
            self.cancel_operations();
        }
        info!(task_id = %self.task_id, ?state, "Task paused");
    }

    pub fn resume(&self) {
        self.pause.send_replace(PauseState::Running);
        info!(task_id = %self.task_id, "Task resumed");
    }

    /// Cancel the master signal. Terminal until `reset`.
    pub fn abort(&self, reason: Option<&str>) {
        let reason = reason.unwrap_or("Task aborted").to_string();
        info!(task_id = %self.task_id, reason = %reason, "Task aborted");
        *lock(&self.abort_reason) = Some(reason);
        lock(&self.cancel).cancel();
        self.cancel_operations();
    }

    /// Clear pause state and install a fresh master signal so the task can run again.
    pub fn reset(&self) {
        self.pause.send_replace(PauseState::Running);
        let old = std::mem::replace(&mut *lock(&self.cancel), CancellationToken::new());
        old.cancel();
        self.cancel_operations();
        *lock(&self.abort_reason) = None;
        debug!(task_id = %self.task_id, "Execution context reset");
    }

    /// Register an interruptible sub-operation. Its token is a child of the
    /// master signal, so abort cancels it as well. Registering while hard
    /// paused yields an already cancelled token.
    pub fn register_operation(&self) -> OperationGuard {
        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel_token().child_token();
        lock(&self.operations).insert(id, token.clone());
        // Checked after insertion so a concurrent `pause(true)` either sees
        // the token or has already published its state.
        if self.pause_state() == PauseState::HardPaused {
            token.cancel();
        }
        OperationGuard {
            id,
            token,
            operations: self.operations.clone(),
        }
    }

    pub fn in_flight_operations(&self) -> usize {
        lock(&self.operations).len()
    }

    fn cancel_operations(&self) {
        let drained: Vec<CancellationToken> =
            lock(&self.operations).drain().map(|(_, t)| t).collect();
        if !drained.is_empty() {
            debug!(task_id = %self.task_id, count = drained.len(), "Cancelling in-flight operations");
        }
        for token in drained {
            token.cancel();
        }
    }

    // ── Variables ──────────────────────────────────────────────

    pub fn variable(&self, key: &str) -> Option<Value> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn remove_variable(&self, key: &str) -> Option<Value> {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_variables(&self) {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether parallel nodes run concurrently for this task.
    pub fn agent_parallel(&self) -> bool {
        self.variable(AGENT_PARALLEL_VAR)
            .and_then(|v| v.as_bool())
            .unwrap_or(self.config.executor.agent_parallel)
    }

    // ── Conversation buffer ────────────────────────────────────

    /// Queue a user message for the next agent runner invocation.
    pub fn push_conversation(&self, text: impl Into<String>) {
        lock(&self.conversation).push(text.into());
    }

    pub fn conversation(&self) -> Vec<String> {
        lock(&self.conversation).clone()
    }

    pub fn take_conversation(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.conversation))
    }

    pub fn clear_conversation(&self) {
        lock(&self.conversation).clear();
    }

    // ── Workflow ───────────────────────────────────────────────

    pub fn workflow(&self) -> Option<Workflow> {
        self.workflow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_workflow(&self, workflow: Workflow) {
        *self.workflow.write().unwrap_or_else(PoisonError::into_inner) = Some(workflow);
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        self.workflow
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(|wf| wf.set_status(agent_id, status))
            .unwrap_or(false)
    }

    /// Merge a revised plan into the live workflow and hand it to the
    /// executor, which picks it up after the step in progress. Returns the
    /// merged workflow.
    pub fn submit_revision(&self, revised: Workflow) -> Workflow {
        let merged = self.merge_revision(revised.clone());
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.revision_tx.send(revised);
        merged
    }

    /// Merge `revised` into the live workflow under one lock and store it.
    ///
    /// Statuses come from the live workflow, so an agent that finished
    /// while the revision was being planned stays done.
    pub fn merge_revision(&self, revised: Workflow) -> Workflow {
        let mut live = self.workflow.write().unwrap_or_else(PoisonError::into_inner);
        let merged = match live.as_ref() {
            Some(current) => merge_replan(current, revised),
            None => revised,
        };
        *live = Some(merged.clone());
        merged
    }

    /// Latest pending revision, discarding older ones.
    pub fn take_revision(&self) -> Option<Workflow> {
        let mut rx = lock(&self.revision_rx);
        let mut latest = None;
        while let Ok(workflow) = rx.try_recv() {
            latest = Some(workflow);
        }
        latest
    }
}
