use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::definition::{EdgeLabel, NodeKind};
use crate::effector::{EffectOutcome, EffectRequest, EffectorGateway};
use crate::error::EngineError;
use crate::execution::{Cursor, ExecutionId, ExitReason, FlowExecution, VisitOutcome};
use crate::executor::{NodeExecutor, split_branch};
use crate::exit::ExitRuleEvaluator;
use crate::graph::FlowGraph;

/// Per-execution slot. The mutex is the single-writer guarantee: all
/// cursor mutations for one execution serialize here, while distinct
/// executions advance in parallel.
type Slot = Mutex<FlowExecution>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    due: Instant,
    exec_id: ExecutionId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.exec_id.cmp(&other.exec_id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Owns every execution and the single timer loop that wakes the waiting
/// ones. One binary heap of due instants plus a notify, not a task per
/// sleeping entity.
pub struct ExecutionScheduler {
    executions: DashMap<ExecutionId, Arc<Slot>>,
    by_flow: DashMap<String, Vec<ExecutionId>>,
    active: DashMap<String, Arc<AtomicUsize>>,
    graphs: DashMap<String, Arc<FlowGraph>>,
    timers: StdMutex<BinaryHeap<Reverse<TimerEntry>>>,
    timer_changed: Notify,
    cancel: CancellationToken,
    executor: NodeExecutor,
    exit: ExitRuleEvaluator,
    gateway: Arc<dyn EffectorGateway>,
}

impl ExecutionScheduler {
    pub fn new(
        executor: NodeExecutor,
        exit: ExitRuleEvaluator,
        gateway: Arc<dyn EffectorGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            executions: DashMap::new(),
            by_flow: DashMap::new(),
            active: DashMap::new(),
            graphs: DashMap::new(),
            timers: StdMutex::new(BinaryHeap::new()),
            timer_changed: Notify::new(),
            cancel: CancellationToken::new(),
            executor,
            exit,
            gateway,
        })
    }

    /// Makes a compiled graph visible to the advancement loop. Called on
    /// activation; graphs are immutable so replacing an entry is only ever
    /// re-registration of the same structure.
    pub fn register_graph(&self, graph: Arc<FlowGraph>) {
        self.graphs.insert(graph.flow_id().to_string(), graph);
    }

    fn graph(&self, flow_id: &str) -> Option<Arc<FlowGraph>> {
        self.graphs.get(flow_id).map(|g| g.clone())
    }

    /// Timer loop. Sleeps until the earliest due instant, fires everything
    /// that has come due, and re-arms. `timer_changed` interrupts the sleep
    /// when a nearer wake is scheduled.
    pub async fn run(self: Arc<Self>) {
        info!("execution scheduler started");
        loop {
            let next_due = self
                .timers
                .lock()
                .expect("timer heap poisoned")
                .peek()
                .map(|Reverse(entry)| entry.due);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("execution scheduler stopping");
                    return;
                }
                _ = self.timer_changed.notified() => {}
                _ = async {
                    match next_due {
                        Some(due) => tokio::time::sleep_until(due).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.fire_due();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn fire_due(self: &Arc<Self>) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut heap = self.timers.lock().expect("timer heap poisoned");
            while heap
                .peek()
                .is_some_and(|Reverse(entry)| entry.due <= now)
            {
                let Reverse(entry) = heap.pop().expect("peeked entry vanished");
                due.push(entry.exec_id);
            }
        }
        for exec_id in due {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.advance(&exec_id).await;
            });
        }
    }

    fn schedule_wake(&self, exec_id: ExecutionId, due: Instant) {
        self.timers
            .lock()
            .expect("timer heap poisoned")
            .push(Reverse(TimerEntry { due, exec_id }));
        self.timer_changed.notify_one();
    }

    /// Reserves an active slot for `flow_id` under its concurrency cap.
    /// Returns false when the flow is full.
    pub fn try_reserve(&self, flow_id: &str, cap: Option<usize>) -> bool {
        let counter = self
            .active
            .entry(flow_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match cap {
                    Some(cap) if current >= cap => None,
                    _ => Some(current + 1),
                }
            })
            .is_ok()
    }

    fn release(&self, flow_id: &str) {
        if let Some(counter) = self.active.get(flow_id) {
            let counter = counter.clone();
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
        }
    }

    pub fn active_count(&self, flow_id: &str) -> usize {
        self.active
            .get(flow_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Creates an execution at the flow's entry node and drives it until it
    /// suspends or terminates. The caller has already reserved capacity.
    pub async fn enroll(&self, graph: &FlowGraph, entity_id: &str) -> ExecutionId {
        let mut exec =
            FlowExecution::new(graph.flow_id(), entity_id, graph.entry_target(), Utc::now());
        let exec_id = exec.id.clone();
        debug!(flow = %graph.flow_id(), entity = %entity_id, exec = %exec_id, "execution enrolled");

        if let Some(max) = &graph.definition().max_time_in_flow {
            let deadline = Instant::now() + max.to_std();
            exec.deadline = Some(deadline);
            // Wake at the limit so a long suspension cannot overstay it.
            self.schedule_wake(exec_id.clone(), deadline);
        }

        self.executions
            .insert(exec_id.clone(), Arc::new(Mutex::new(exec)));
        self.by_flow
            .entry(graph.flow_id().to_string())
            .or_default()
            .push(exec_id.clone());

        self.advance(&exec_id).await;
        exec_id
    }

    /// Advances one execution as far as it can go right now. Idempotent:
    /// terminal or frozen executions are a no-op, and a spurious timer wake
    /// before the due instant leaves the cursor untouched.
    #[instrument(skip(self), fields(exec = %exec_id))]
    pub async fn advance(&self, exec_id: &str) {
        let Some(slot) = self.executions.get(exec_id).map(|s| s.clone()) else {
            return;
        };
        let mut exec = slot.lock().await;

        loop {
            if exec.is_terminal() || exec.requires_revision {
                return;
            }
            let Some(graph) = self.graph(&exec.flow_id) else {
                // Flow paused or deactivated; resume when re-registered.
                return;
            };

            // Exit rules outrank whatever the cursor says, including a
            // pending delay.
            match self.exit.should_exit(&exec, &graph, Utc::now()).await {
                Ok(Some(reason)) => {
                    self.finish(&mut exec, &graph, Cursor::Exited(reason)).await;
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "exit evaluation failed; freezing execution");
                    exec.requires_revision = true;
                    return;
                }
            }
            // Time limit against the monotonic clock; lowest priority, so it
            // runs after the rule set had its say.
            if exec.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.finish(&mut exec, &graph, Cursor::Exited(ExitReason::TimeLimit))
                    .await;
                return;
            }

            match exec.cursor.clone() {
                Cursor::At(node_id) => {
                    if !self.step(&mut exec, &graph, &node_id).await {
                        return;
                    }
                }
                Cursor::Waiting { resume, due, .. } => {
                    if Instant::now() < due {
                        // Spurious wake; the real timer is still pending.
                        return;
                    }
                    match resume {
                        Some(node) => exec.cursor = Cursor::At(node),
                        None => {
                            self.finish(&mut exec, &graph, Cursor::Done).await;
                            return;
                        }
                    }
                }
                Cursor::Done | Cursor::Exited(_) => return,
            }
        }
    }

    /// Processes the node under the cursor. Returns true when the cursor
    /// moved and the advancement loop should keep going.
    async fn step(&self, exec: &mut FlowExecution, graph: &FlowGraph, node_id: &str) -> bool {
        let Some(node) = graph.node(node_id) else {
            warn!(flow = %exec.flow_id, node = %node_id, "cursor at unknown node; freezing");
            exec.requires_revision = true;
            return false;
        };

        match &node.kind {
            NodeKind::Trigger { .. } => {
                // Executions start past the trigger; tolerate a stale cursor.
                exec.cursor = Cursor::At(graph.entry_target().to_string());
                true
            }
            NodeKind::Delay { delay } => {
                let resume = graph.single_target(node_id).map(String::from);
                exec.record_visit(node_id, VisitOutcome::Waited);
                let due = Instant::now() + delay.to_std();
                exec.cursor = Cursor::Waiting {
                    resume,
                    due_at: Utc::now() + delay.to_chrono(),
                    due,
                };
                self.schedule_wake(exec.id.clone(), due);
                false
            }
            NodeKind::Conditional { predicate } => {
                match self.executor.eval_conditional(predicate, exec).await {
                    Ok(taken) => {
                        let label = if taken { EdgeLabel::Yes } else { EdgeLabel::No };
                        exec.record_visit(node_id, VisitOutcome::Branch(label));
                        self.follow_branch(exec, graph, node_id, label)
                    }
                    Err(err) => {
                        warn!(%err, node = %node_id, "conditional evaluation failed; freezing");
                        exec.requires_revision = true;
                        false
                    }
                }
            }
            NodeKind::Split { ratio } => {
                let label = split_branch(&exec.flow_id, &exec.entity_id, node_id, *ratio);
                exec.record_visit(node_id, VisitOutcome::Branch(label));
                self.follow_branch(exec, graph, node_id, label)
            }
            _ => match self.executor.execute_effect(node, exec).await {
                EffectOutcome::Success => {
                    exec.record_visit(node_id, VisitOutcome::Success);
                    match graph.single_target(node_id) {
                        Some(next) => {
                            exec.cursor = Cursor::At(next.to_string());
                            true
                        }
                        None => {
                            self.finish(exec, graph, Cursor::Done).await;
                            false
                        }
                    }
                }
                outcome => {
                    exec.record_visit(
                        node_id,
                        VisitOutcome::Failed(format!("{outcome:?}")),
                    );
                    exec.requires_revision = true;
                    false
                }
            },
        }
    }

    fn follow_branch(
        &self,
        exec: &mut FlowExecution,
        graph: &FlowGraph,
        node_id: &str,
        label: EdgeLabel,
    ) -> bool {
        match graph.branch_target(node_id, label) {
            Some(next) => {
                exec.cursor = Cursor::At(next.to_string());
                true
            }
            None => {
                // Compilation guarantees both branches exist.
                warn!(node = %node_id, ?label, "branch target missing; freezing");
                exec.requires_revision = true;
                false
            }
        }
    }

    /// Moves an execution to a terminal cursor, releases its capacity slot
    /// and fires the flow's exit action when it exited early.
    async fn finish(&self, exec: &mut FlowExecution, graph: &FlowGraph, cursor: Cursor) {
        let exited = matches!(cursor, Cursor::Exited(_));
        if let Cursor::Exited(reason) = cursor {
            info!(flow = %exec.flow_id, entity = %exec.entity_id, ?reason, "execution exited");
        } else {
            info!(flow = %exec.flow_id, entity = %exec.entity_id, "execution completed");
        }
        exec.cursor = cursor;
        self.release(&exec.flow_id);

        if exited
            && let Some(action) = &graph.definition().exit_action
        {
            // Best effort, exactly once per execution.
            let key = format!("{}:exit", exec.id);
            let request = EffectRequest::for_exit_action(action, &exec.entity_id, key);
            if self.gateway.send(request).await != EffectOutcome::Success {
                warn!(flow = %exec.flow_id, entity = %exec.entity_id, "exit action dispatch failed");
            }
        }
    }

    /// Records an engagement on the entity's most recent execution in the
    /// flow and re-drives it: an open or click can satisfy a conversion
    /// goal mid-wait.
    pub async fn record_engagement(
        &self,
        flow_id: &str,
        entity_id: &str,
        node_id: &str,
        kind: crate::execution::EngagementKind,
    ) -> Result<(), EngineError> {
        let Some(exec_id) = self.latest_for_entity(flow_id, entity_id).await else {
            return Err(EngineError::ExecutionNotFound(format!(
                "{flow_id}/{entity_id}"
            )));
        };
        {
            let slot = self
                .executions
                .get(&exec_id)
                .map(|s| s.clone())
                .ok_or_else(|| EngineError::ExecutionNotFound(exec_id.clone()))?;
            let mut exec = slot.lock().await;
            exec.record_engagement(node_id, kind);
        }
        self.advance(&exec_id).await;
        Ok(())
    }

    async fn latest_for_entity(&self, flow_id: &str, entity_id: &str) -> Option<ExecutionId> {
        let ids = self.by_flow.get(flow_id)?.clone();
        for exec_id in ids.iter().rev() {
            if let Some(slot) = self.executions.get(exec_id).map(|s| s.clone()) {
                let exec = slot.lock().await;
                if exec.entity_id == entity_id {
                    return Some(exec_id.clone());
                }
            }
        }
        None
    }

    /// Re-arms a frozen execution after operator intervention. The cursor
    /// stays where the failure left it, so the failed node is retried.
    pub async fn retry_execution(&self, exec_id: &str) -> Result<(), EngineError> {
        let slot = self
            .executions
            .get(exec_id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::ExecutionNotFound(exec_id.to_string()))?;
        {
            let mut exec = slot.lock().await;
            if !exec.requires_revision {
                return Ok(());
            }
            exec.requires_revision = false;
            info!(exec = %exec_id, "execution re-armed");
        }
        self.advance(exec_id).await;
        Ok(())
    }

    /// True when the entity has ever been enrolled in the flow, live or
    /// finished. Feeds the admission gate's re-entry check.
    pub async fn has_enrolled(&self, flow_id: &str, entity_id: &str) -> bool {
        let Some(ids) = self.by_flow.get(flow_id).map(|ids| ids.clone()) else {
            return false;
        };
        for exec_id in &ids {
            if let Some(slot) = self.executions.get(exec_id).map(|s| s.clone()) {
                let exec = slot.lock().await;
                if exec.entity_id == entity_id {
                    return true;
                }
            }
        }
        false
    }

    /// Exits every non-terminal execution in a flow, used when a flow is
    /// force-archived.
    pub async fn force_exit_flow(&self, flow_id: &str, reason: ExitReason) {
        let Some(ids) = self.by_flow.get(flow_id).map(|ids| ids.clone()) else {
            return;
        };
        let Some(graph) = self.graph(flow_id) else {
            return;
        };
        for exec_id in &ids {
            if let Some(slot) = self.executions.get(exec_id).map(|s| s.clone()) {
                let mut exec = slot.lock().await;
                if !exec.is_terminal() {
                    self.finish(&mut exec, &graph, Cursor::Exited(reason)).await;
                }
            }
        }
    }

    pub async fn has_active_executions(&self, flow_id: &str) -> bool {
        let Some(ids) = self.by_flow.get(flow_id).map(|ids| ids.clone()) else {
            return false;
        };
        for exec_id in &ids {
            if let Some(slot) = self.executions.get(exec_id).map(|s| s.clone()) {
                let exec = slot.lock().await;
                if !exec.is_terminal() {
                    return true;
                }
            }
        }
        false
    }

    /// Snapshot clones of every execution in a flow, for analytics.
    pub async fn snapshot_flow(&self, flow_id: &str) -> Vec<FlowExecution> {
        let Some(ids) = self.by_flow.get(flow_id).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(ids.len());
        for exec_id in &ids {
            if let Some(slot) = self.executions.get(exec_id).map(|s| s.clone()) {
                out.push(slot.lock().await.clone());
            }
        }
        out
    }

    pub async fn snapshot(&self, exec_id: &str) -> Result<FlowExecution, EngineError> {
        let slot = self
            .executions
            .get(exec_id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::ExecutionNotFound(exec_id.to_string()))?;
        let exec = slot.lock().await;
        Ok(exec.clone())
    }
}
