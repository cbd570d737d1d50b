//! Error types.
//!
//! Each stage of the pipeline has its own error kind:
//!
//! - [`StructuralError`]: a source model or forest violates a structural
//!   invariant. Raised only while converting or building a forest.
//! - [`ShapeError`]: a buffer does not match the forest or the target device.
//!   Raised by `infer`, `postprocess` and buffer copies before any work starts.
//! - [`UnsupportedDeviceError`]: an accelerator operation was requested but the
//!   accelerator was not compiled into this build.
//! - [`ConfigError`]: a configuration builder rejected its parameters.
//!
//! [`enum@Error`] wraps all of them for callers that drive the whole pipeline.

use crate::device::Residency;
use crate::repr::IndexWidth;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

// =============================================================================
// StructuralError
// =============================================================================

/// A source model or forest is malformed.
///
/// Conversion never repairs its input; the first violation found is reported.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StructuralError {
    #[error("model declares zero outputs")]
    NoOutputs,
    #[error("tree {tree} has no nodes")]
    EmptyTree { tree: usize },
    #[error("tree {tree}: node {node} references child {child} but tree has {n_nodes} nodes")]
    DanglingChild {
        tree: usize,
        node: usize,
        child: usize,
        n_nodes: usize,
    },
    #[error("tree {tree}: node {node} references itself as a child")]
    SelfLoop { tree: usize, node: usize },
    #[error("tree {tree}: cycle detected at node {node}")]
    Cycle { tree: usize, node: usize },
    #[error("tree {tree}: node {node} is reachable through more than one path")]
    SharedNode { tree: usize, node: usize },
    #[error("tree {tree}: node {node} is unreachable from the root")]
    UnreachableNode { tree: usize, node: usize },
    #[error("tree {tree}: node {node} splits on feature {feature} but model has {n_features} features")]
    FeatureOutOfRange {
        tree: usize,
        node: usize,
        feature: usize,
        n_features: usize,
    },
    #[error("tree {tree}: node {node} has a NaN threshold")]
    NanThreshold { tree: usize, node: usize },
    #[error("tree {tree}: node {node} compares against +inf with `<=` or `>`, which has no strict `<` form")]
    UnboundedThreshold { tree: usize, node: usize },
    #[error("tree {tree}: leaf {node} has {width} outputs, expected {expected}")]
    LeafWidthMismatch {
        tree: usize,
        node: usize,
        width: usize,
        expected: usize,
    },
    #[error("tree {tree}: leaf {node} mixes scalar and vector leaf outputs within one model")]
    MixedLeafKinds { tree: usize, node: usize },
    #[error("tree {tree}: output group {group} out of range for {n_outputs} outputs")]
    GroupOutOfRange {
        tree: usize,
        group: usize,
        n_outputs: usize,
    },
    #[error("tree {tree}: leaf {node} value {value} is not a class index below {n_outputs}")]
    InvalidVote {
        tree: usize,
        node: usize,
        value: f32,
        n_outputs: usize,
    },
    #[error("tree {tree}: weight {weight} cannot be applied to a voting ensemble")]
    WeightedVote { tree: usize, weight: f32 },
    #[error("base score has {len} values, expected 1 or {n_outputs}")]
    BaseScoreLength { len: usize, n_outputs: usize },
    #[error("tree {tree}: node {node} has an invalid child offset")]
    InvalidOffset { tree: usize, node: usize },
    #[error("tree {tree} is laid out differently from the rest of the forest")]
    LayoutMismatch { tree: usize },
    #[error("tree {tree}: leaf {node} references a missing leaf vector")]
    MissingLeafVector { tree: usize, node: usize },
    #[error("index width {requested:?} cannot hold index {required}")]
    IndexWidthTooNarrow { requested: IndexWidth, required: usize },
    #[error("model needs index {required}, which exceeds the widest supported index width")]
    ModelTooLarge { required: usize },
}

impl StructuralError {
    /// Re-attribute an error raised for a standalone tree to tree `index`.
    pub fn in_tree(mut self, index: usize) -> Self {
        use StructuralError::*;
        match &mut self {
            EmptyTree { tree }
            | DanglingChild { tree, .. }
            | SelfLoop { tree, .. }
            | Cycle { tree, .. }
            | SharedNode { tree, .. }
            | UnreachableNode { tree, .. }
            | FeatureOutOfRange { tree, .. }
            | NanThreshold { tree, .. }
            | UnboundedThreshold { tree, .. }
            | LeafWidthMismatch { tree, .. }
            | MixedLeafKinds { tree, .. }
            | GroupOutOfRange { tree, .. }
            | InvalidVote { tree, .. }
            | WeightedVote { tree, .. }
            | InvalidOffset { tree, .. }
            | LayoutMismatch { tree }
            | MissingLeafVector { tree, .. } => *tree = index,
            NoOutputs | BaseScoreLength { .. } | IndexWidthTooNarrow { .. } | ModelTooLarge { .. } => {}
        }
        self
    }
}

// =============================================================================
// ShapeError
// =============================================================================

/// A buffer does not match the forest or the target device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("input has {actual} columns but forest expects {expected} features")]
    ColumnMismatch { expected: usize, actual: usize },
    #[error("input buffer holds {actual} values, expected {expected} (rows x columns)")]
    InputLength { expected: usize, actual: usize },
    #[error("output buffer holds {actual} values, expected {expected} (rows x outputs)")]
    OutputLength { expected: usize, actual: usize },
    #[error("{buffer} buffer resides on {actual:?} but the operation targets {expected:?}")]
    ResidencyMismatch {
        buffer: &'static str,
        expected: Residency,
        actual: Residency,
    },
    #[error("buffer of {len} values is not a whole number of rows of width {width}")]
    RaggedRows { len: usize, width: usize },
    #[error("cannot copy {src} values into a buffer of {dst} values")]
    CopyLength { src: usize, dst: usize },
}

// =============================================================================
// UnsupportedDeviceError
// =============================================================================

/// An accelerator operation was requested in a build without accelerator support.
///
/// Every accelerator boundary reports this same error kind. Only the name of
/// the attempted operation differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("accelerator unsupported: tried to {operation} in a host-only build")]
pub struct UnsupportedDeviceError {
    operation: &'static str,
}

impl UnsupportedDeviceError {
    pub(crate) const fn new(operation: &'static str) -> Self {
        Self { operation }
    }

    /// The operation that was refused.
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

// =============================================================================
// ConfigError
// =============================================================================

/// A configuration builder rejected its parameters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_size must be at least 1")]
    ZeroChunkSize,
    #[error("missing_sentinel must not be NaN; NaN is always treated as missing")]
    NanSentinel,
    #[error("n_outputs must be at least 1")]
    ZeroOutputs,
}

// =============================================================================
// Error
// =============================================================================

/// Umbrella error for the conversion, inference and postprocessing pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    UnsupportedDevice(#[from] UnsupportedDeviceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A job queued on an asynchronous stream panicked.
    #[error("kernel fault on stream: {0}")]
    KernelFault(String),
}
