use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::definition::AudienceRule;
use crate::error::EngineError;

/// A named predicate over entity facts, used for audience targeting.
/// `audience_size` is a cached preview figure, never consulted for
/// admission decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    pub value: String,
    #[serde(default)]
    pub audience_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Plan,
    Location,
    Behavior,
    Tag,
}

impl Segment {
    pub fn satisfied_by(&self, facts: &EntityFacts) -> bool {
        match self.kind {
            SegmentKind::Plan => facts.plan_id.as_deref() == Some(self.value.as_str()),
            SegmentKind::Location => facts.location_code.as_deref() == Some(self.value.as_str()),
            SegmentKind::Tag => facts.tags.iter().any(|t| t == &self.value),
            // The directory owns score semantics; present and positive counts.
            SegmentKind::Behavior => facts
                .behavior_scores
                .get(&self.value)
                .is_some_and(|score| *score > 0.0),
        }
    }
}

/// Live facts about an entity, as served by the segment directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFacts {
    pub plan_id: Option<String>,
    pub location_code: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub behavior_scores: HashMap<String, f64>,
}

/// External read-only source of entity facts. Consumed, never owned.
#[async_trait]
pub trait SegmentDirectory: Send + Sync {
    async fn get_facts(&self, entity_id: &str) -> Result<EntityFacts, EngineError>;
}

/// Advisory audience size for a rule. `All` is the sentinel for an empty
/// include set ("every entity the trigger reaches").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceEstimate {
    All,
    Approx(u64),
}

/// Evaluates audience rules against live directory facts.
pub struct SegmentMatcher {
    directory: Arc<dyn SegmentDirectory>,
}

impl SegmentMatcher {
    pub fn new(directory: Arc<dyn SegmentDirectory>) -> Self {
        Self { directory }
    }

    /// OR across the include set (empty include admits everyone), AND NOT
    /// across the exclude set. A directory failure propagates: admission
    /// fails closed at the caller.
    pub async fn matches(&self, entity_id: &str, rule: &AudienceRule) -> Result<bool, EngineError> {
        let facts = match self.directory.get_facts(entity_id).await {
            Ok(facts) => facts,
            Err(err) => {
                warn!(entity_id, %err, "segment directory lookup failed; failing closed");
                return Err(err);
            }
        };

        let included =
            rule.include.is_empty() || rule.include.iter().any(|s| s.satisfied_by(&facts));
        let excluded = rule.exclude.iter().any(|s| s.satisfied_by(&facts));
        Ok(included && !excluded)
    }

    /// Preview-only arithmetic over the cached segment sizes.
    pub fn estimate_audience_size(rule: &AudienceRule) -> AudienceEstimate {
        if rule.include.is_empty() {
            return AudienceEstimate::All;
        }
        let included: u64 = rule.include.iter().map(|s| s.audience_size).sum();
        let excluded: u64 = rule.exclude.iter().map(|s| s.audience_size).sum();
        AudienceEstimate::Approx(included.saturating_sub(excluded))
    }
}

/// In-memory directory, used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    facts: DashMap<String, EntityFacts>,
    offline: AtomicBool,
}

impl InMemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, entity_id: impl Into<String>, facts: EntityFacts) {
        self.facts.insert(entity_id.into(), facts);
    }

    /// Simulates the directory becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl SegmentDirectory for InMemoryDirectory {
    async fn get_facts(&self, entity_id: &str) -> Result<EntityFacts, EngineError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngineError::DirectoryUnavailable(
                "directory offline".into(),
            ));
        }
        Ok(self
            .facts
            .get(entity_id)
            .map(|f| f.clone())
            .unwrap_or_default())
    }
}
