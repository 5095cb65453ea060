use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{DirectoryFailurePolicy, EngineConfig};
use crate::definition::{EdgeLabel, Node, Predicate};
use crate::effector::{EffectOutcome, EffectRequest, EffectorGateway};
use crate::error::EngineError;
use crate::execution::{EngagementKind, FlowExecution};
use crate::segment::{EntityFacts, SegmentDirectory};

/// Executes single nodes: dispatches effects through the gateway (with
/// bounded exponential backoff on transient failures) and evaluates
/// conditional predicates against directory facts plus the execution's own
/// history.
pub struct NodeExecutor {
    gateway: Arc<dyn EffectorGateway>,
    directory: Arc<dyn SegmentDirectory>,
    config: EngineConfig,
}

impl NodeExecutor {
    pub fn new(
        gateway: Arc<dyn EffectorGateway>,
        directory: Arc<dyn SegmentDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            gateway,
            directory,
            config,
        }
    }

    /// Dispatches an effectful node. Transient failures are retried up to
    /// the configured attempt cap; exhaustion converts to a permanent
    /// failure. The idempotency key is stable across attempts so the
    /// provider can deduplicate.
    pub async fn execute_effect(&self, node: &Node, exec: &FlowExecution) -> EffectOutcome {
        let key = format!("{}:{}", exec.id, node.id);
        let Some(request) = EffectRequest::for_node(&node.kind, &exec.entity_id, key) else {
            // Control-flow nodes never reach this path.
            return EffectOutcome::Success;
        };

        let mut delay = self.config.retry_base_delay;
        for attempt in 1..=self.config.max_attempts {
            match self.gateway.send(request.clone()).await {
                EffectOutcome::Success => {
                    debug!(node = %node.id, entity = %exec.entity_id, attempt, "effect dispatched");
                    return EffectOutcome::Success;
                }
                EffectOutcome::PermanentFailure => {
                    warn!(node = %node.id, entity = %exec.entity_id, attempt, "permanent effector failure");
                    return EffectOutcome::PermanentFailure;
                }
                EffectOutcome::TransientFailure if attempt < self.config.max_attempts => {
                    warn!(node = %node.id, entity = %exec.entity_id, attempt, "transient effector failure, backing off");
                    sleep(delay).await;
                    delay *= 2;
                }
                EffectOutcome::TransientFailure => {
                    warn!(node = %node.id, entity = %exec.entity_id, attempt, "retries exhausted");
                    return EffectOutcome::PermanentFailure;
                }
            }
        }
        EffectOutcome::PermanentFailure
    }

    /// Evaluates a conditional predicate. Directory-backed predicates hit
    /// the segment directory; an outage there either reads as `false`
    /// (fail-open policy) or surfaces the error so the scheduler freezes
    /// the execution.
    pub async fn eval_conditional(
        &self,
        predicate: &Predicate,
        exec: &FlowExecution,
    ) -> Result<bool, EngineError> {
        let facts = if predicate.needs_directory() {
            match self.directory.get_facts(&exec.entity_id).await {
                Ok(facts) => facts,
                Err(err) => match self.config.directory_policy {
                    DirectoryFailurePolicy::FailOpen => {
                        warn!(entity = %exec.entity_id, %err, "directory unavailable; predicate reads false");
                        return Ok(false);
                    }
                    DirectoryFailurePolicy::Freeze => return Err(err),
                },
            }
        } else {
            EntityFacts::default()
        };
        Ok(evaluate_predicate(predicate, &facts, exec))
    }
}

/// Pure predicate evaluation over facts and execution history.
pub fn evaluate_predicate(
    predicate: &Predicate,
    facts: &EntityFacts,
    exec: &FlowExecution,
) -> bool {
    match predicate {
        Predicate::OpenedEmail { node_id } => exec.engaged(node_id, EngagementKind::Opened),
        Predicate::ClickedEmail { node_id } => exec.engaged(node_id, EngagementKind::Clicked),
        Predicate::VisitedNode { node_id } => exec.visited(node_id),
        Predicate::OnPlan { plan_id } => facts.plan_id.as_deref() == Some(plan_id.as_str()),
        Predicate::InLocation { location } => {
            facts.location_code.as_deref() == Some(location.as_str())
        }
        Predicate::HasTag { tag } => facts.tags.iter().any(|t| t == tag),
        Predicate::BehaviorAbove { metric, threshold } => facts
            .behavior_scores
            .get(metric)
            .is_some_and(|score| *score > *threshold),
    }
}

/// Deterministic A/B assignment: a stable hash of (flow, entity, node)
/// mod 100 against the ratio, so the same entity always lands on the same
/// branch however often it is re-evaluated.
pub fn split_branch(flow_id: &str, entity_id: &str, node_id: &str, ratio: u8) -> EdgeLabel {
    let digest = blake3::hash(format!("{flow_id}:{entity_id}:{node_id}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    let bucket = (u64::from_le_bytes(head) % 100) as u8;
    if bucket < ratio {
        EdgeLabel::A
    } else {
        EdgeLabel::B
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn exec() -> FlowExecution {
        FlowExecution::new("f1", "client-1", "n1", Utc::now())
    }

    #[test]
    fn split_assignment_is_stable() {
        let first = split_branch("f1", "client-1", "split-1", 50);
        for _ in 0..10 {
            assert_eq!(split_branch("f1", "client-1", "split-1", 50), first);
        }
    }

    #[test]
    fn split_ratio_extremes() {
        for entity in ["a", "b", "c", "d"] {
            assert_eq!(split_branch("f1", entity, "s", 100), EdgeLabel::A);
            assert_eq!(split_branch("f1", entity, "s", 0), EdgeLabel::B);
        }
    }

    #[test]
    fn split_varies_across_entities() {
        // With a 50/50 ratio a run of distinct entities should hit both
        // branches; 64 entities all landing on one side would mean the hash
        // is not spreading.
        let mut saw_a = false;
        let mut saw_b = false;
        for i in 0..64 {
            match split_branch("f1", &format!("client-{i}"), "s", 50) {
                EdgeLabel::A => saw_a = true,
                EdgeLabel::B => saw_b = true,
                _ => unreachable!(),
            }
        }
        assert!(saw_a && saw_b);
    }

    #[test]
    fn engagement_predicates_read_visit_history() {
        let mut e = exec();
        assert!(!evaluate_predicate(
            &Predicate::OpenedEmail {
                node_id: "email-1".into()
            },
            &EntityFacts::default(),
            &e,
        ));
        e.record_engagement("email-1", EngagementKind::Opened);
        assert!(evaluate_predicate(
            &Predicate::OpenedEmail {
                node_id: "email-1".into()
            },
            &EntityFacts::default(),
            &e,
        ));
    }

    #[test]
    fn fact_predicates_read_directory_facts() {
        let facts = EntityFacts {
            plan_id: Some("premium".into()),
            location_code: Some("MX".into()),
            tags: vec!["vip".into()],
            behavior_scores: [("usage".to_string(), 0.8)].into(),
        };
        let e = exec();
        assert!(evaluate_predicate(
            &Predicate::OnPlan {
                plan_id: "premium".into()
            },
            &facts,
            &e
        ));
        assert!(!evaluate_predicate(
            &Predicate::BehaviorAbove {
                metric: "usage".into(),
                threshold: 0.9
            },
            &facts,
            &e
        ));
    }
}
