//! Retention automation flow engine: directed-graph drip campaigns for a
//! fitness CRM. Flows are authored as drafts, validated and compiled on
//! activation, and driven per-entity by a single timer loop; all outbound
//! effects go through the pluggable effector gateway.

pub mod analytics;
pub mod config;
pub mod definition;
pub mod effector;
pub mod engine;
pub mod error;
pub mod execution;
pub mod executor;
pub mod exit;
pub mod gate;
pub mod graph;
pub mod logger;
pub mod scheduler;
pub mod segment;

pub use config::{DirectoryFailurePolicy, EngineConfig};
pub use definition::{FlowDefinition, FlowStatus, NodeKind, ReentryPolicy};
pub use effector::{EffectOutcome, EffectRequest, EffectorGateway, NullGateway};
pub use engine::RetentionEngine;
pub use error::{EngineError, FlowError};
pub use execution::{EngagementKind, ExecutionStatus, ExitReason, FlowExecution};
pub use gate::{EntryResult, TriggerEvent};
pub use segment::{AudienceEstimate, EntityFacts, InMemoryDirectory, SegmentDirectory};
