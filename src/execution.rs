use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::definition::EdgeLabel;

pub type ExecutionId = String;

/// Why an execution left the flow before reaching a terminal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Conversion,
    Unsubscribe,
    SegmentChange,
    TimeLimit,
    FlowArchived,
}

/// Coarse status, derived from the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Exited,
}

/// Where an execution currently is in its graph.
#[derive(Debug, Clone)]
pub enum Cursor {
    /// Due for advancement at this node.
    At(String),
    /// Suspended at a delay node. `resume` is the node to continue at when
    /// the timer fires (`None` when the delay is the last node). `due_at`
    /// is informational; the timer compares against `due`.
    Waiting {
        resume: Option<String>,
        due_at: DateTime<Utc>,
        due: Instant,
    },
    Done,
    Exited(ExitReason),
}

/// What happened when a node was visited.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitOutcome {
    /// Effect dispatched and acknowledged.
    Success,
    /// Conditional or split routed to this branch.
    Branch(EdgeLabel),
    /// Delay suspension recorded.
    Waited,
    /// Dispatch failed after retries; execution frozen here.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct VisitRecord {
    pub node_id: String,
    pub at: DateTime<Utc>,
    pub outcome: VisitOutcome,
}

/// Engagement signals reported back by the mail provider through the
/// effector gateway (open/click webhooks, unsubscribe list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Opened,
    Clicked,
    Unsubscribed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngagementRecord {
    pub node_id: String,
    pub kind: EngagementKind,
    pub at: DateTime<Utc>,
}

/// One entity's progress through one flow. Owned exclusively by the
/// scheduler; everyone else sees snapshot clones. Completed and exited
/// executions are retained for analytics, never deleted on completion.
#[derive(Debug, Clone)]
pub struct FlowExecution {
    pub id: ExecutionId,
    pub flow_id: String,
    pub entity_id: String,
    pub entered_at: DateTime<Utc>,
    /// Monotonic instant of the flow's time limit, when one is configured.
    /// The scheduler wakes on it; the wall-clock rule in the exit evaluator
    /// covers restarts where monotonic time has no meaning.
    pub deadline: Option<Instant>,
    pub cursor: Cursor,
    pub visits: Vec<VisitRecord>,
    pub engagements: Vec<EngagementRecord>,
    pub unsubscribed: bool,
    /// Set when the execution froze (retry exhaustion, directory outage
    /// under the freeze policy). Cleared by an operator re-arm.
    pub requires_revision: bool,
}

impl FlowExecution {
    pub fn new(flow_id: &str, entity_id: &str, start_node: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            entity_id: entity_id.to_string(),
            entered_at: now,
            deadline: None,
            cursor: Cursor::At(start_node.to_string()),
            visits: Vec::new(),
            engagements: Vec::new(),
            unsubscribed: false,
            requires_revision: false,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self.cursor {
            Cursor::At(_) | Cursor::Waiting { .. } => ExecutionStatus::InProgress,
            Cursor::Done => ExecutionStatus::Completed,
            Cursor::Exited(_) => ExecutionStatus::Exited,
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        match self.cursor {
            Cursor::Exited(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.cursor, Cursor::Done | Cursor::Exited(_))
    }

    pub fn record_visit(&mut self, node_id: &str, outcome: VisitOutcome) {
        self.visits.push(VisitRecord {
            node_id: node_id.to_string(),
            at: Utc::now(),
            outcome,
        });
    }

    pub fn record_engagement(&mut self, node_id: &str, kind: EngagementKind) {
        if kind == EngagementKind::Unsubscribed {
            self.unsubscribed = true;
        }
        self.engagements.push(EngagementRecord {
            node_id: node_id.to_string(),
            kind,
            at: Utc::now(),
        });
    }

    pub fn visited(&self, node_id: &str) -> bool {
        self.visits.iter().any(|v| v.node_id == node_id)
    }

    /// Index of the first visit to `node_id`, for ordering checks.
    pub fn first_visit_index(&self, node_id: &str) -> Option<usize> {
        self.visits.iter().position(|v| v.node_id == node_id)
    }

    pub fn engaged(&self, node_id: &str, kind: EngagementKind) -> bool {
        self.engagements
            .iter()
            .any(|e| e.node_id == node_id && e.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tracks_cursor() {
        let mut exec = FlowExecution::new("f1", "client-1", "email-1", Utc::now());
        assert_eq!(exec.status(), ExecutionStatus::InProgress);
        assert!(!exec.is_terminal());

        exec.cursor = Cursor::Exited(ExitReason::Conversion);
        assert_eq!(exec.status(), ExecutionStatus::Exited);
        assert_eq!(exec.exit_reason(), Some(ExitReason::Conversion));
        assert!(exec.is_terminal());
    }

    #[test]
    fn unsubscribe_engagement_sets_flag() {
        let mut exec = FlowExecution::new("f1", "client-1", "email-1", Utc::now());
        exec.record_engagement("email-1", EngagementKind::Opened);
        assert!(!exec.unsubscribed);
        assert!(exec.engaged("email-1", EngagementKind::Opened));

        exec.record_engagement("email-1", EngagementKind::Unsubscribed);
        assert!(exec.unsubscribed);
    }

    #[test]
    fn visit_order_is_preserved() {
        let mut exec = FlowExecution::new("f1", "client-1", "a", Utc::now());
        exec.record_visit("a", VisitOutcome::Success);
        exec.record_visit("b", VisitOutcome::Waited);
        assert_eq!(exec.first_visit_index("a"), Some(0));
        assert_eq!(exec.first_visit_index("b"), Some(1));
        assert_eq!(exec.first_visit_index("c"), None);
    }
}
