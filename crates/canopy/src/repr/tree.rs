//! Laid-out tree storage.

use crate::error::StructuralError;

use super::{LeafKind, Node, NodeIndex, TreeLayout, TreeShape};

/// A single tree: a flat node arena plus its vector-leaf table.
///
/// The root is always at index 0. Children are located with
/// [`TreeLayout::left_child`] / [`TreeLayout::right_child`] from the parent's
/// position and its distant offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree<I: NodeIndex> {
    nodes: Box<[Node<I>]>,
    leaf_vectors: Box<[f32]>,
    layout: TreeLayout,
    max_depth: usize,
}

impl<I: NodeIndex> Tree<I> {
    /// Lay out a normalized tree.
    ///
    /// Fails if `shape` is not a proper binary tree, mixes vector leaf widths,
    /// or holds an offset or feature index that does not fit in `I`. Errors
    /// name the tree as index 0.
    pub fn from_shape(shape: &TreeShape, layout: TreeLayout) -> Result<Self, StructuralError> {
        let (nodes, leaf_vectors) = layout.lay_out::<I>(shape)?;
        let mut tree = Self {
            nodes: nodes.into_boxed_slice(),
            leaf_vectors: leaf_vectors.into_boxed_slice(),
            layout,
            max_depth: 0,
        };
        tree.max_depth = tree.compute_depth();
        Ok(tree)
    }

    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Number of edges on the longest root-to-leaf path.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[inline]
    pub fn layout(&self) -> TreeLayout {
        self.layout
    }

    #[inline]
    pub fn nodes(&self) -> &[Node<I>] {
        &self.nodes
    }

    #[inline(always)]
    pub fn node(&self, index: usize) -> &Node<I> {
        &self.nodes[index]
    }

    #[inline]
    pub fn leaf_vectors(&self) -> &[f32] {
        &self.leaf_vectors
    }

    #[inline(always)]
    pub fn left_child(&self, index: usize) -> usize {
        let offset = self.nodes[index].distant_offset().index();
        self.layout.left_child(index, offset)
    }

    #[inline(always)]
    pub fn right_child(&self, index: usize) -> usize {
        let offset = self.nodes[index].distant_offset().index();
        self.layout.right_child(index, offset)
    }

    /// Scalar output of the leaf at `index`.
    #[inline(always)]
    pub fn leaf_value(&self, index: usize) -> f32 {
        self.nodes[index].leaf_value()
    }

    /// Output vector of the leaf at `index`, `width` values long.
    #[inline(always)]
    pub fn leaf_vector(&self, index: usize, width: usize) -> &[f32] {
        let start = self.nodes[index].leaf_vector_index() * width;
        &self.leaf_vectors[start..start + width]
    }

    fn children(&self, index: usize) -> Option<(usize, usize)> {
        let node = &self.nodes[index];
        if node.is_leaf() {
            None
        } else {
            Some((self.left_child(index), self.right_child(index)))
        }
    }

    fn compute_depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((index, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            let Some((left, right)) = self.children(index) else {
                continue;
            };
            stack.push((left, depth + 1));
            stack.push((right, depth + 1));
        }
        max_depth
    }

    /// Check the laid-out tree against the forest's invariants.
    ///
    /// Every internal node must have a non-zero offset whose children stay in
    /// bounds, every node must be reached exactly once from the root, split
    /// features must be below `n_features` and vector leaves must reference
    /// complete entries of the vector table.
    pub fn validate(
        &self,
        tree: usize,
        n_features: usize,
        leaf_kind: LeafKind,
    ) -> Result<(), StructuralError> {
        for (index, node) in self.nodes.iter().enumerate() {
            if node.is_leaf() {
                if let LeafKind::Vector { width } = leaf_kind {
                    if (node.leaf_vector_index() + 1) * width > self.leaf_vectors.len() {
                        return Err(StructuralError::MissingLeafVector { tree, node: index });
                    }
                }
                continue;
            }
            if node.distant_offset().index() == 0 {
                return Err(StructuralError::InvalidOffset { tree, node: index });
            }
            if node.feature().index() >= n_features {
                return Err(StructuralError::FeatureOutOfRange {
                    tree,
                    node: index,
                    feature: node.feature().index(),
                    n_features,
                });
            }
            if node.threshold().is_nan() {
                return Err(StructuralError::NanThreshold { tree, node: index });
            }
        }
        check_structure(tree, self.nodes.len(), |index| self.children(index)).map(|_| ())
    }
}

/// Walk a tree from root 0 and verify it is a proper binary tree.
///
/// `children(i)` returns `None` for leaves. Every child must be in bounds and
/// every node must be reached exactly once. Returns the maximum depth.
pub(crate) fn check_structure(
    tree: usize,
    n_nodes: usize,
    children: impl Fn(usize) -> Option<(usize, usize)>,
) -> Result<usize, StructuralError> {
    if n_nodes == 0 {
        return Err(StructuralError::EmptyTree { tree });
    }

    // Iterative DFS with color marking.
    // 0 = unvisited, 1 = visiting, 2 = done
    let mut color = vec![0u8; n_nodes];
    let mut stack: Vec<(usize, bool, usize)> = vec![(0, false, 0)];
    let mut max_depth = 0;

    while let Some((node, exiting, depth)) = stack.pop() {
        if exiting {
            color[node] = 2;
            continue;
        }
        match color[node] {
            0 => {}
            1 => return Err(StructuralError::Cycle { tree, node }),
            _ => return Err(StructuralError::SharedNode { tree, node }),
        }
        color[node] = 1;
        max_depth = max_depth.max(depth);
        stack.push((node, true, depth));

        if let Some((left, right)) = children(node) {
            for child in [right, left] {
                if child == node {
                    return Err(StructuralError::SelfLoop { tree, node });
                }
                if child >= n_nodes {
                    return Err(StructuralError::DanglingChild {
                        tree,
                        node,
                        child,
                        n_nodes,
                    });
                }
                stack.push((child, false, depth + 1));
            }
        }
    }

    match color.iter().position(|&c| c == 0) {
        Some(node) => Err(StructuralError::UnreachableNode { tree, node }),
        None => Ok(max_depth),
    }
}
