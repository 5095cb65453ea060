use serde::Serialize;

use crate::definition::NodeKind;
use crate::execution::{EngagementKind, ExecutionStatus, ExitReason, FlowExecution, VisitOutcome};
use crate::graph::FlowGraph;

/// Funnel numbers for one node: how many executions reached it and how many
/// moved on to any successor afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub node_id: String,
    pub node_type: String,
    pub reached: u64,
    pub progressed: u64,
    /// Percentage of reached executions that never progressed. Terminal
    /// nodes treat completion as progress.
    pub drop_off_rate: f64,
}

/// Delivery and engagement counters for one email node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMetrics {
    pub node_id: String,
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

/// Aggregate view of one flow, folded from execution snapshots. Pure
/// derivation; nothing here is stored, so the numbers are always consistent
/// with the executions they came from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAnalytics {
    pub flow_id: String,
    pub total_entries: u64,
    pub in_progress: u64,
    pub completions: u64,
    pub exits: u64,
    /// Goal-predicate exits, as distinct from natural completions.
    pub conversions: u64,
    /// Completions as a percentage of all entries.
    pub conversion_rate: f64,
    pub nodes: Vec<NodeMetrics>,
    pub emails: Vec<EmailMetrics>,
}

/// Cross-flow headline numbers for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub active_flows: u64,
    pub clients_in_flows: u64,
    pub conversions_generated: u64,
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Folds execution snapshots into per-flow analytics.
pub fn flow_analytics(graph: &FlowGraph, executions: &[FlowExecution]) -> FlowAnalytics {
    let total_entries = executions.len() as u64;
    let mut in_progress = 0;
    let mut completions = 0;
    let mut exits = 0;
    let mut conversions = 0;
    for exec in executions {
        match exec.status() {
            ExecutionStatus::InProgress => in_progress += 1,
            ExecutionStatus::Completed => completions += 1,
            ExecutionStatus::Exited => {
                exits += 1;
                if exec.exit_reason() == Some(ExitReason::Conversion) {
                    conversions += 1;
                }
            }
        }
    }

    let mut nodes = Vec::new();
    let mut emails = Vec::new();
    for node in &graph.definition().nodes {
        if matches!(node.kind, NodeKind::Trigger { .. }) {
            continue;
        }
        let successors = graph.successors(&node.id);
        let mut reached = 0;
        let mut progressed = 0;
        for exec in executions {
            let Some(first) = exec.first_visit_index(&node.id) else {
                continue;
            };
            reached += 1;
            let moved_on = if successors.is_empty() {
                exec.status() == ExecutionStatus::Completed
            } else {
                exec.visits[first + 1..]
                    .iter()
                    .any(|v| successors.contains(&v.node_id.as_str()))
            };
            if moved_on {
                progressed += 1;
            }
        }
        nodes.push(NodeMetrics {
            node_id: node.id.clone(),
            node_type: node.kind.type_name().to_string(),
            reached,
            progressed,
            drop_off_rate: percentage(reached - progressed, reached),
        });

        if matches!(node.kind, NodeKind::Email { .. }) {
            emails.push(email_metrics(&node.id, executions));
        }
    }

    FlowAnalytics {
        flow_id: graph.flow_id().to_string(),
        total_entries,
        in_progress,
        completions,
        exits,
        conversions,
        conversion_rate: percentage(completions, total_entries),
        nodes,
        emails,
    }
}

fn email_metrics(node_id: &str, executions: &[FlowExecution]) -> EmailMetrics {
    let mut sent = 0;
    let mut opened = 0;
    let mut clicked = 0;
    for exec in executions {
        let delivered = exec
            .visits
            .iter()
            .any(|v| v.node_id == node_id && v.outcome == VisitOutcome::Success);
        if delivered {
            sent += 1;
            if exec.engaged(node_id, EngagementKind::Opened) {
                opened += 1;
            }
            if exec.engaged(node_id, EngagementKind::Clicked) {
                clicked += 1;
            }
        }
    }
    EmailMetrics {
        node_id: node_id.to_string(),
        sent,
        opened,
        clicked,
        open_rate: percentage(opened, sent),
        click_rate: percentage(clicked, sent),
    }
}
