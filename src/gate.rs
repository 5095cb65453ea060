use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::definition::ReentryPolicy;
use crate::execution::ExecutionId;
use crate::graph::FlowGraph;
use crate::scheduler::ExecutionScheduler;
use crate::segment::SegmentMatcher;

/// A trigger event observed by the CRM: some entity did the thing a flow's
/// trigger node listens for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub flow_id: String,
    pub entity_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn now(flow_id: &str, entity_id: &str) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            entity_id: entity_id.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// Admission decision. Rejections are ordinary outcomes, not errors; the
/// engine records them and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryResult {
    Admitted(ExecutionId),
    /// Flow is paused, archived or still a draft.
    FlowNotActive,
    /// Re-entry is denied and the entity has an execution, live or finished,
    /// for this flow.
    RejectedByReentry,
    /// Entity does not match the audience rule (or the directory was
    /// unreachable; admission fails closed).
    RejectedBySegment,
    /// Flow is at its concurrency cap.
    RejectedByCapacity,
}

/// Decides whether a trigger event becomes an execution. Checks run in a
/// fixed order so rejection reasons are deterministic: re-entry, then
/// audience, then capacity.
pub struct EntryGate {
    matcher: SegmentMatcher,
    scheduler: Arc<ExecutionScheduler>,
}

impl EntryGate {
    pub fn new(matcher: SegmentMatcher, scheduler: Arc<ExecutionScheduler>) -> Self {
        Self { matcher, scheduler }
    }

    /// Admits or rejects one trigger event against an active flow's graph.
    /// On admission the new execution is driven inline until it suspends or
    /// terminates.
    #[instrument(skip(self, graph), fields(flow = %event.flow_id, entity = %event.entity_id))]
    pub async fn admit(&self, graph: &FlowGraph, event: &TriggerEvent) -> EntryResult {
        let definition = graph.definition();

        // Under Allowed each enrollment event gets its own execution, even
        // while an earlier one is still in flight.
        if definition.reentry_policy == ReentryPolicy::Denied
            && self
                .scheduler
                .has_enrolled(&event.flow_id, &event.entity_id)
                .await
        {
            debug!("rejected: re-entry denied");
            return EntryResult::RejectedByReentry;
        }

        match self
            .matcher
            .matches(&event.entity_id, &definition.audience_rule)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("rejected: outside audience");
                return EntryResult::RejectedBySegment;
            }
            // Directory down: admission always fails closed.
            Err(err) => {
                debug!(%err, "rejected: directory unavailable");
                return EntryResult::RejectedBySegment;
            }
        }

        // Reserve before enrolling so two racing admissions cannot both
        // squeeze under the cap.
        if !self
            .scheduler
            .try_reserve(&event.flow_id, definition.concurrency_cap)
        {
            debug!("rejected: concurrency cap reached");
            return EntryResult::RejectedByCapacity;
        }

        let exec_id = self.scheduler.enroll(graph, &event.entity_id).await;
        EntryResult::Admitted(exec_id)
    }
}
