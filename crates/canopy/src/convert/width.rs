//! Index width selection.
//!
//! A forest's offsets and feature indices share one integer width. The
//! narrowest width wins because node size drives cache and memory traffic
//! during traversal; see [`select_index_width`].

use crate::error::StructuralError;
use crate::repr::IndexWidth;

/// Size statistics of a forest, gathered before layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForestStats {
    /// Deepest root-to-leaf path, in edges.
    pub max_depth: usize,
    /// Node count of the largest tree.
    pub max_node_count: usize,
    pub n_features: usize,
}

impl ForestStats {
    /// Largest index any node field must hold.
    ///
    /// Offsets never exceed `max_node_count - 1` in either layout and feature
    /// indices never exceed `n_features - 1`. Depth is included so traversal
    /// counters sized to the same width cannot overflow.
    pub fn required_index(&self) -> usize {
        self.max_node_count
            .saturating_sub(1)
            .max(self.n_features.saturating_sub(1))
            .max(self.max_depth)
    }
}

/// Pick the narrowest index width able to represent `stats`.
pub fn select_index_width(stats: &ForestStats) -> Result<IndexWidth, StructuralError> {
    let required = stats.required_index();
    IndexWidth::narrowest_for(required).ok_or(StructuralError::ModelTooLarge { required })
}

/// Apply a caller-forced width, which may widen but never narrow.
pub fn resolve_index_width(
    stats: &ForestStats,
    forced: Option<IndexWidth>,
) -> Result<IndexWidth, StructuralError> {
    let selected = select_index_width(stats)?;
    match forced {
        Some(requested) if requested < selected => Err(StructuralError::IndexWidthTooNarrow {
            requested,
            required: stats.required_index(),
        }),
        Some(requested) => Ok(requested),
        None => Ok(selected),
    }
}
