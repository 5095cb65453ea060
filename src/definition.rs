use std::time::Duration as StdDuration;

use chrono::Duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::segment::Segment;

/// A flow definition as produced by the external drag-and-drop editor:
/// nodes, labeled edges, audience rules and exit rules. The engine never
/// builds these itself; it validates and compiles them (see `graph.rs`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub audience_rule: AudienceRule,
    #[serde(default)]
    pub exit_rules: Vec<ExitRule>,
    /// Max simultaneous `in_progress` executions; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_cap: Option<usize>,
    #[serde(default)]
    pub reentry_policy: ReentryPolicy,
    /// Hard ceiling on how long an entity may stay enrolled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_in_flow: Option<DelaySpec>,
    /// Optional best-effort effect fired once when an execution exits early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_action: Option<ExitAction>,
}

impl FlowDefinition {
    pub fn max_time_in_flow(&self) -> Option<Duration> {
        self.max_time_in_flow.as_ref().map(DelaySpec::to_chrono)
    }
}

/// Runtime status of a registered flow. The definition is editable only
/// while `Draft` and immutable from the instant it becomes `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReentryPolicy {
    Allowed,
    #[default]
    Denied,
}

/// One step in a flow. The payload shape is fixed by the node type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; `event` names the external trigger (informational).
    Trigger {
        event: String,
    },
    Email {
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    Sms {
        template: String,
    },
    Push {
        template: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Tag {
        tag: String,
        #[serde(default)]
        remove: bool,
    },
    Plan {
        plan_id: String,
    },
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Conditional {
        predicate: Predicate,
    },
    Delay {
        #[serde(flatten)]
        delay: DelaySpec,
    },
    /// Deterministic A/B split; `ratio` is the percentage routed to `a`.
    Split {
        ratio: u8,
    },
}

impl NodeKind {
    /// Effectful nodes dispatch through the effector gateway; control-flow
    /// nodes (trigger, conditional, delay, split) do not.
    pub fn is_effectful(&self) -> bool {
        matches!(
            self,
            NodeKind::Email { .. }
                | NodeKind::Sms { .. }
                | NodeKind::Push { .. }
                | NodeKind::Tag { .. }
                | NodeKind::Plan { .. }
                | NodeKind::Webhook { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger { .. } => "trigger",
            NodeKind::Email { .. } => "email",
            NodeKind::Sms { .. } => "sms",
            NodeKind::Push { .. } => "push",
            NodeKind::Tag { .. } => "tag",
            NodeKind::Plan { .. } => "plan",
            NodeKind::Webhook { .. } => "webhook",
            NodeKind::Conditional { .. } => "conditional",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Split { .. } => "split",
        }
    }
}

/// Directed connection between two nodes. Labels are only meaningful on
/// edges leaving `conditional` (yes/no) and `split` (a/b) nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EdgeLabel {
    Yes,
    No,
    A,
    B,
}

/// A wait duration as the editor expresses it (`duration` + `unit`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DelaySpec {
    pub duration: u64,
    pub unit: DelayUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelaySpec {
    pub fn new(duration: u64, unit: DelayUnit) -> Self {
        Self { duration, unit }
    }

    fn seconds(&self) -> u64 {
        let per_unit = match self.unit {
            DelayUnit::Minutes => 60,
            DelayUnit::Hours => 3_600,
            DelayUnit::Days => 86_400,
        };
        self.duration * per_unit
    }

    pub fn to_std(&self) -> StdDuration {
        StdDuration::from_secs(self.seconds())
    }

    pub fn to_chrono(&self) -> Duration {
        Duration::seconds(self.seconds() as i64)
    }
}

/// Predicates evaluated against entity facts and the execution's own visit
/// and engagement history. Engagement facts ("opened the previous email")
/// come from the execution; the rest come from the segment directory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    OpenedEmail { node_id: String },
    ClickedEmail { node_id: String },
    VisitedNode { node_id: String },
    OnPlan { plan_id: String },
    InLocation { location: String },
    HasTag { tag: String },
    BehaviorAbove { metric: String, threshold: f64 },
}

impl Predicate {
    /// True when evaluation requires a live segment directory read.
    pub fn needs_directory(&self) -> bool {
        matches!(
            self,
            Predicate::OnPlan { .. }
                | Predicate::InLocation { .. }
                | Predicate::HasTag { .. }
                | Predicate::BehaviorAbove { .. }
        )
    }
}

/// Audience gating for enrollment: an entity must satisfy at least one
/// included segment (empty include set admits everyone) and none of the
/// excluded ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AudienceRule {
    #[serde(default)]
    pub include: Vec<Segment>,
    #[serde(default)]
    pub exclude: Vec<Segment>,
}

/// Opt-in conditions that terminate an execution out-of-band, independently
/// of its graph position. Only the rules that need configuring live here:
/// unsubscribes always exit, and the time limit is armed by
/// `max_time_in_flow`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ExitRule {
    Conversion { goal: Predicate },
    SegmentChange,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitAction {
    Tag { tag: String },
    Email { template: String },
    Webhook { url: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_round_trips_editor_json() {
        let raw = json!({
            "id": "flow-onboarding",
            "name": "Onboarding Nuevos Clientes",
            "nodes": [
                { "id": "trigger-1", "type": "trigger", "event": "signup_completed" },
                { "id": "email-1", "type": "email", "template": "welcome", "subject": "Bienvenido" },
                { "id": "delay-1", "type": "delay", "duration": 3, "unit": "days" },
                { "id": "cond-1", "type": "conditional",
                  "predicate": { "kind": "opened_email", "node_id": "email-1" } }
            ],
            "edges": [
                { "source": "trigger-1", "target": "email-1" },
                { "source": "email-1", "target": "delay-1" },
                { "source": "delay-1", "target": "cond-1" }
            ],
            "reentryPolicy": "denied",
            "maxTimeInFlow": { "duration": 30, "unit": "days" }
        });

        let def: FlowDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.nodes.len(), 4);
        assert_eq!(def.nodes[2].kind.type_name(), "delay");
        assert_eq!(def.max_time_in_flow().unwrap(), Duration::days(30));

        let back = serde_json::to_value(&def).unwrap();
        let again: FlowDefinition = serde_json::from_value(back).unwrap();
        assert_eq!(again.id, "flow-onboarding");
    }

    #[test]
    fn delay_spec_unit_conversion() {
        assert_eq!(
            DelaySpec::new(2, DelayUnit::Hours).to_std(),
            StdDuration::from_secs(7_200)
        );
        assert_eq!(
            DelaySpec::new(3, DelayUnit::Days).to_chrono(),
            Duration::days(3)
        );
    }

    #[test]
    fn effectful_classification() {
        let email = NodeKind::Email {
            template: "t".into(),
            subject: None,
        };
        let delay = NodeKind::Delay {
            delay: DelaySpec::new(1, DelayUnit::Minutes),
        };
        assert!(email.is_effectful());
        assert!(!delay.is_effectful());
    }
}
