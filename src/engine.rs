use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::analytics::{self, FlowAnalytics, FlowStats};
use crate::config::EngineConfig;
use crate::definition::{FlowDefinition, FlowStatus};
use crate::effector::EffectorGateway;
use crate::error::{EngineError, FlowError};
use crate::execution::{EngagementKind, ExitReason, FlowExecution};
use crate::executor::NodeExecutor;
use crate::exit::ExitRuleEvaluator;
use crate::gate::{EntryGate, EntryResult, TriggerEvent};
use crate::graph::FlowGraph;
use crate::scheduler::ExecutionScheduler;
use crate::segment::{AudienceEstimate, SegmentDirectory, SegmentMatcher};

/// One registered flow: the editable definition, its lifecycle status and,
/// once activated, the compiled graph. The graph outlives archival so
/// analytics keep working on retired flows.
struct FlowEntry {
    definition: FlowDefinition,
    status: FlowStatus,
    graph: Option<Arc<FlowGraph>>,
}

/// Front door of the retention engine. Owns the flow registry, the
/// admission gate and the execution scheduler; everything else reaches the
/// engine through this facade.
pub struct RetentionEngine {
    flows: DashMap<String, FlowEntry>,
    scheduler: Arc<ExecutionScheduler>,
    gate: EntryGate,
    timer_loop: JoinHandle<()>,
}

impl RetentionEngine {
    /// Wires the engine together and starts its timer loop.
    pub fn new(
        directory: Arc<dyn SegmentDirectory>,
        gateway: Arc<dyn EffectorGateway>,
        config: EngineConfig,
    ) -> Self {
        let executor = NodeExecutor::new(gateway.clone(), directory.clone(), config.clone());
        let exit = ExitRuleEvaluator::new(directory.clone(), config.directory_policy);
        let scheduler = ExecutionScheduler::new(executor, exit, gateway);
        let gate = EntryGate::new(SegmentMatcher::new(directory), scheduler.clone());
        let timer_loop = tokio::spawn(scheduler.clone().run());
        Self {
            flows: DashMap::new(),
            scheduler,
            gate,
            timer_loop,
        }
    }

    /// Creates or replaces a draft definition. Anything past `Draft` is
    /// immutable; edit by cloning into a new draft instead.
    pub fn upsert_draft(&self, definition: FlowDefinition) -> Result<(), FlowError> {
        let flow_id = definition.id.clone();
        match self.flows.entry(flow_id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.status != FlowStatus::Draft {
                    return Err(FlowError::NotEditable {
                        flow: flow_id,
                        status: current.status,
                    });
                }
                entry.get_mut().definition = definition;
            }
            Entry::Vacant(entry) => {
                entry.insert(FlowEntry {
                    definition,
                    status: FlowStatus::Draft,
                    graph: None,
                });
                info!(flow = %flow_id, "draft registered");
            }
        }
        Ok(())
    }

    /// Compiles and activates a draft. Structural validation failing here
    /// leaves the flow in `Draft`.
    #[instrument(skip(self))]
    pub fn activate(&self, flow_id: &str) -> Result<(), FlowError> {
        let mut entry = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        if entry.status != FlowStatus::Draft {
            return Err(FlowError::InvalidTransition {
                flow: flow_id.to_string(),
                from: entry.status,
                to: FlowStatus::Active,
            });
        }
        let graph = Arc::new(FlowGraph::compile(entry.definition.clone())?);
        self.scheduler.register_graph(graph.clone());
        entry.graph = Some(graph);
        entry.status = FlowStatus::Active;
        info!(flow = %flow_id, "flow activated");
        Ok(())
    }

    /// Stops new admissions. In-flight executions keep advancing; pausing
    /// is an intake valve, not a freeze.
    pub fn pause(&self, flow_id: &str) -> Result<(), FlowError> {
        self.transition(flow_id, FlowStatus::Active, FlowStatus::Paused)
    }

    pub fn resume(&self, flow_id: &str) -> Result<(), FlowError> {
        self.transition(flow_id, FlowStatus::Paused, FlowStatus::Active)
    }

    fn transition(&self, flow_id: &str, from: FlowStatus, to: FlowStatus) -> Result<(), FlowError> {
        let mut entry = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        if entry.status != from {
            return Err(FlowError::InvalidTransition {
                flow: flow_id.to_string(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        info!(flow = %flow_id, ?from, ?to, "flow transitioned");
        Ok(())
    }

    /// Retires a flow. Refused while executions are still in progress
    /// unless `force`, which exits them all with `FlowArchived`.
    #[instrument(skip(self))]
    pub async fn archive(&self, flow_id: &str, force: bool) -> Result<(), FlowError> {
        {
            let entry = self
                .flows
                .get(flow_id)
                .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
            if entry.status == FlowStatus::Archived {
                return Ok(());
            }
        }
        if self.scheduler.has_active_executions(flow_id).await {
            if !force {
                return Err(FlowError::ArchiveBlocked {
                    flow: flow_id.to_string(),
                    active: self.scheduler.active_count(flow_id),
                });
            }
            self.scheduler
                .force_exit_flow(flow_id, ExitReason::FlowArchived)
                .await;
        }
        if let Some(mut entry) = self.flows.get_mut(flow_id) {
            entry.status = FlowStatus::Archived;
        }
        info!(flow = %flow_id, force, "flow archived");
        Ok(())
    }

    /// Feeds one trigger event through the admission gate. Only active
    /// flows take entries.
    pub async fn handle_trigger(&self, event: TriggerEvent) -> Result<EntryResult, EngineError> {
        let graph = {
            let entry = self
                .flows
                .get(&event.flow_id)
                .ok_or_else(|| FlowError::NotFound(event.flow_id.clone()))?;
            if entry.status != FlowStatus::Active {
                return Ok(EntryResult::FlowNotActive);
            }
            entry.graph.clone().ok_or_else(|| FlowError::NotFound(event.flow_id.clone()))?
        };
        Ok(self.gate.admit(&graph, &event).await)
    }

    /// Ingests a provider engagement signal (open, click, unsubscribe) and
    /// re-drives the affected execution.
    pub async fn record_engagement(
        &self,
        flow_id: &str,
        entity_id: &str,
        node_id: &str,
        kind: EngagementKind,
    ) -> Result<(), EngineError> {
        self.scheduler
            .record_engagement(flow_id, entity_id, node_id, kind)
            .await
    }

    /// Operator re-arm of a frozen execution.
    pub async fn retry_execution(&self, exec_id: &str) -> Result<(), EngineError> {
        self.scheduler.retry_execution(exec_id).await
    }

    pub async fn execution(&self, exec_id: &str) -> Result<FlowExecution, EngineError> {
        self.scheduler.snapshot(exec_id).await
    }

    /// Folds the flow's execution snapshots into funnel and email metrics.
    pub async fn analytics(&self, flow_id: &str) -> Result<FlowAnalytics, EngineError> {
        let graph = self
            .flows
            .get(flow_id)
            .and_then(|entry| entry.graph.clone())
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        let executions = self.scheduler.snapshot_flow(flow_id).await;
        Ok(analytics::flow_analytics(&graph, &executions))
    }

    /// Cross-flow dashboard numbers.
    pub async fn stats(&self) -> FlowStats {
        let mut stats = FlowStats::default();
        let flow_ids: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
        for flow_id in flow_ids {
            let (is_active, graph) = match self.flows.get(&flow_id) {
                Some(entry) => (entry.status == FlowStatus::Active, entry.graph.clone()),
                None => continue,
            };
            if is_active {
                stats.active_flows += 1;
            }
            if let Some(graph) = graph {
                let executions = self.scheduler.snapshot_flow(&flow_id).await;
                let flow = analytics::flow_analytics(&graph, &executions);
                stats.clients_in_flows += flow.in_progress;
                stats.conversions_generated += flow.conversions;
            }
        }
        stats
    }

    /// Preview audience arithmetic from the cached segment sizes; no
    /// directory round trip.
    pub fn estimate_audience(&self, flow_id: &str) -> Result<AudienceEstimate, FlowError> {
        let entry = self
            .flows
            .get(flow_id)
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        Ok(SegmentMatcher::estimate_audience_size(
            &entry.definition.audience_rule,
        ))
    }

    pub fn flow_status(&self, flow_id: &str) -> Option<FlowStatus> {
        self.flows.get(flow_id).map(|entry| entry.status)
    }

    /// Stops the timer loop. Executions stay queryable afterwards.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.timer_loop.abort();
    }
}

impl Drop for RetentionEngine {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
