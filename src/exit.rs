use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::DirectoryFailurePolicy;
use crate::definition::ExitRule;
use crate::error::EngineError;
use crate::execution::{ExitReason, FlowExecution};
use crate::executor::evaluate_predicate;
use crate::graph::FlowGraph;
use crate::segment::{EntityFacts, SegmentDirectory};

/// Checks the out-of-band exit conditions on every advancement attempt.
/// Conditions are evaluated in fixed priority order (conversion >
/// unsubscribe > segment_change > time_limit): conversion is the most
/// actionable signal, so it wins when several fire at once. Conversion and
/// segment_change only apply when configured on the flow; unsubscribe is
/// always checked, and the time limit is armed by `max_time_in_flow`.
pub struct ExitRuleEvaluator {
    directory: Arc<dyn SegmentDirectory>,
    policy: DirectoryFailurePolicy,
}

impl ExitRuleEvaluator {
    pub fn new(directory: Arc<dyn SegmentDirectory>, policy: DirectoryFailurePolicy) -> Self {
        Self { directory, policy }
    }

    /// `now` is a parameter so the clock is a test input, not an ambient.
    /// `Err` means the directory was needed and unreachable under the
    /// freeze policy; the scheduler freezes the execution.
    pub async fn should_exit(
        &self,
        exec: &FlowExecution,
        graph: &FlowGraph,
        now: DateTime<Utc>,
    ) -> Result<Option<ExitReason>, EngineError> {
        let definition = graph.definition();
        // One lazy directory read shared by conversion and segment_change.
        let mut facts: Option<EntityFacts> = None;

        if let Some(goal) = definition.exit_rules.iter().find_map(|r| match r {
            ExitRule::Conversion { goal } => Some(goal),
            _ => None,
        }) {
            let converted = if goal.needs_directory() {
                match self.fetch_facts(exec, &mut facts).await? {
                    Some(f) => evaluate_predicate(goal, f, exec),
                    None => false,
                }
            } else {
                evaluate_predicate(goal, &EntityFacts::default(), exec)
            };
            if converted {
                return Ok(Some(ExitReason::Conversion));
            }
        }

        // Opt-outs always end the execution, no rule toggle needed.
        if exec.unsubscribed {
            return Ok(Some(ExitReason::Unsubscribe));
        }

        let segment_change_enabled = definition
            .exit_rules
            .iter()
            .any(|r| matches!(r, ExitRule::SegmentChange));
        if segment_change_enabled {
            match self.fetch_facts(exec, &mut facts).await? {
                Some(f) => {
                    let rule = &definition.audience_rule;
                    let included =
                        rule.include.is_empty() || rule.include.iter().any(|s| s.satisfied_by(f));
                    let excluded = rule.exclude.iter().any(|s| s.satisfied_by(f));
                    if !(included && !excluded) {
                        return Ok(Some(ExitReason::SegmentChange));
                    }
                }
                // Fail-open outage: assume the entity still matches.
                None => {}
            }
        }

        if let Some(max) = definition.max_time_in_flow()
            && now - exec.entered_at > max
        {
            return Ok(Some(ExitReason::TimeLimit));
        }

        Ok(None)
    }

    async fn fetch_facts<'a>(
        &self,
        exec: &FlowExecution,
        cache: &'a mut Option<EntityFacts>,
    ) -> Result<Option<&'a EntityFacts>, EngineError> {
        if cache.is_none() {
            match self.directory.get_facts(&exec.entity_id).await {
                Ok(facts) => *cache = Some(facts),
                Err(err) => match self.policy {
                    DirectoryFailurePolicy::FailOpen => {
                        warn!(entity = %exec.entity_id, %err, "directory unavailable during exit check");
                        return Ok(None);
                    }
                    DirectoryFailurePolicy::Freeze => return Err(err),
                },
            }
        }
        Ok(cache.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        AudienceRule, Edge, FlowDefinition, Node, NodeKind, Predicate,
    };
    use crate::definition::{DelaySpec, DelayUnit};
    use crate::execution::EngagementKind;
    use crate::segment::{InMemoryDirectory, Segment, SegmentKind};
    use chrono::Duration;

    fn graph_with(exit_rules: Vec<ExitRule>, max_days: Option<u64>) -> FlowGraph {
        let def = FlowDefinition {
            id: "f1".into(),
            name: "test".into(),
            description: String::new(),
            nodes: vec![
                Node {
                    id: "t".into(),
                    kind: NodeKind::Trigger {
                        event: "signup".into(),
                    },
                },
                Node {
                    id: "e1".into(),
                    kind: NodeKind::Email {
                        template: "tpl".into(),
                        subject: None,
                    },
                },
            ],
            edges: vec![Edge {
                source: "t".into(),
                target: "e1".into(),
                label: None,
            }],
            audience_rule: AudienceRule {
                include: vec![Segment {
                    id: "seg-premium".into(),
                    name: "Premium".into(),
                    kind: SegmentKind::Plan,
                    value: "premium".into(),
                    audience_size: 1000,
                }],
                exclude: vec![],
            },
            exit_rules,
            concurrency_cap: None,
            reentry_policy: Default::default(),
            max_time_in_flow: max_days.map(|d| DelaySpec::new(d, DelayUnit::Days)),
            exit_action: None,
        };
        FlowGraph::compile(def).unwrap()
    }

    fn premium_directory() -> Arc<InMemoryDirectory> {
        let directory = InMemoryDirectory::new();
        directory.put(
            "client-1",
            crate::segment::EntityFacts {
                plan_id: Some("premium".into()),
                ..Default::default()
            },
        );
        directory
    }

    #[tokio::test]
    async fn conversion_beats_unsubscribe() {
        let graph = graph_with(
            vec![ExitRule::Conversion {
                goal: Predicate::OpenedEmail {
                    node_id: "e1".into(),
                },
            }],
            None,
        );
        let evaluator =
            ExitRuleEvaluator::new(premium_directory(), DirectoryFailurePolicy::Freeze);

        let mut exec = FlowExecution::new("f1", "client-1", "e1", Utc::now());
        exec.record_engagement("e1", EngagementKind::Opened);
        exec.record_engagement("e1", EngagementKind::Unsubscribed);

        let reason = evaluator
            .should_exit(&exec, &graph, Utc::now())
            .await
            .unwrap();
        assert_eq!(reason, Some(ExitReason::Conversion));
    }

    #[tokio::test]
    async fn unsubscribe_exits_without_any_configured_rules() {
        let graph = graph_with(vec![], None);
        let evaluator =
            ExitRuleEvaluator::new(premium_directory(), DirectoryFailurePolicy::Freeze);

        let mut exec = FlowExecution::new("f1", "client-1", "e1", Utc::now());
        exec.record_engagement("e1", EngagementKind::Unsubscribed);

        let reason = evaluator
            .should_exit(&exec, &graph, Utc::now())
            .await
            .unwrap();
        assert_eq!(reason, Some(ExitReason::Unsubscribe));
    }

    #[tokio::test]
    async fn segment_change_fires_when_facts_drift() {
        let graph = graph_with(vec![ExitRule::SegmentChange], None);
        let directory = InMemoryDirectory::new();
        directory.put(
            "client-1",
            crate::segment::EntityFacts {
                plan_id: Some("basic".into()),
                ..Default::default()
            },
        );
        let evaluator = ExitRuleEvaluator::new(directory, DirectoryFailurePolicy::Freeze);

        let exec = FlowExecution::new("f1", "client-1", "e1", Utc::now());
        let reason = evaluator
            .should_exit(&exec, &graph, Utc::now())
            .await
            .unwrap();
        assert_eq!(reason, Some(ExitReason::SegmentChange));
    }

    #[tokio::test]
    async fn segment_change_ignored_when_rule_disabled() {
        let graph = graph_with(vec![], None);
        let directory = InMemoryDirectory::new(); // no facts: nobody is premium
        let evaluator = ExitRuleEvaluator::new(directory, DirectoryFailurePolicy::Freeze);

        let exec = FlowExecution::new("f1", "client-1", "e1", Utc::now());
        let reason = evaluator
            .should_exit(&exec, &graph, Utc::now())
            .await
            .unwrap();
        assert_eq!(reason, None);
    }

    #[tokio::test]
    async fn time_limit_fires_after_window() {
        let graph = graph_with(vec![], Some(30));
        let evaluator =
            ExitRuleEvaluator::new(premium_directory(), DirectoryFailurePolicy::Freeze);

        let entered = Utc::now();
        let exec = FlowExecution::new("f1", "client-1", "e1", entered);

        let within = evaluator
            .should_exit(&exec, &graph, entered + Duration::days(29))
            .await
            .unwrap();
        assert_eq!(within, None);

        let beyond = evaluator
            .should_exit(&exec, &graph, entered + Duration::days(31))
            .await
            .unwrap();
        assert_eq!(beyond, Some(ExitReason::TimeLimit));
    }

    #[tokio::test]
    async fn directory_outage_freezes_under_freeze_policy() {
        let graph = graph_with(vec![ExitRule::SegmentChange], None);
        let directory = InMemoryDirectory::new();
        directory.set_offline(true);
        let evaluator = ExitRuleEvaluator::new(directory, DirectoryFailurePolicy::Freeze);

        let exec = FlowExecution::new("f1", "client-1", "e1", Utc::now());
        assert!(
            evaluator
                .should_exit(&exec, &graph, Utc::now())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn directory_outage_is_benign_under_fail_open() {
        let graph = graph_with(vec![ExitRule::SegmentChange], None);
        let directory = InMemoryDirectory::new();
        directory.set_offline(true);
        let evaluator = ExitRuleEvaluator::new(directory, DirectoryFailurePolicy::FailOpen);

        let exec = FlowExecution::new("f1", "client-1", "e1", Utc::now());
        let reason = evaluator
            .should_exit(&exec, &graph, Utc::now())
            .await
            .unwrap();
        assert_eq!(reason, None);
    }
}
