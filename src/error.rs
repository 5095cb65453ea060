use thiserror::Error;

use crate::definition::FlowStatus;

/// Structural and lifecycle errors for a flow definition. Every structural
/// variant is fatal at activation time: a flow cannot transition
/// `draft -> active` while any of these hold.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error("flow `{0}` has no trigger node")]
    MissingTrigger(String),
    #[error("flow `{flow}` has {count} nodes with in-degree 0; exactly one trigger entry point is required")]
    MultipleEntryPoints { flow: String, count: usize },
    #[error("node `{0}` has in-degree 0 but is not the trigger")]
    OrphanNode(String),
    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),
    #[error("edge references unknown node `{0}`")]
    UnknownNode(String),
    #[error("trigger `{0}` must have exactly one outgoing edge")]
    TriggerFanout(String),
    #[error("branch node `{node}` is missing its `{missing}` edge")]
    MissingBranch { node: String, missing: String },
    #[error("node `{0}` has more than one outgoing edge")]
    ExtraEdges(String),
    #[error("flow `{0}` contains a cycle reachable from the trigger")]
    Cyclic(String),
    #[error("split node `{node}` has ratio {ratio}, expected 0..=100")]
    SplitRatio { node: String, ratio: u8 },

    #[error("flow `{0}` not found")]
    NotFound(String),
    #[error("flow `{flow}` cannot transition {from:?} -> {to:?}")]
    InvalidTransition {
        flow: String,
        from: FlowStatus,
        to: FlowStatus,
    },
    #[error("flow `{flow}` is not editable while {status:?}")]
    NotEditable { flow: String, status: FlowStatus },
    #[error("flow `{flow}` still has {active} executions in progress; archive refused")]
    ArchiveBlocked { flow: String, active: usize },
}

/// Runtime errors raised while driving executions. Admission rejections are
/// *not* errors (see `EntryResult`); these cover the external collaborators
/// and lookups going wrong.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("segment directory unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),
    #[error("node `{node}` not present in flow `{flow}`")]
    UnknownGraphNode { flow: String, node: String },
    #[error(transparent)]
    Flow(#[from] FlowError),
}
