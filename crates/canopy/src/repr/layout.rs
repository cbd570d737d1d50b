//! Node placement policies.
//!
//! A [`TreeShape`] is a normalized tree with arbitrary node ids (root = 0). [`TreeLayout`] decides where each node lands in the flat
//! array and therefore how a child is found from its parent:
//!
//! | Layout        | Left child          | Right child             |
//! |---------------|---------------------|-------------------------|
//! | `DepthFirst`  | `i + 1`             | `i + offset`            |
//! | `BreadthFirst`| `i + offset`        | `i + offset + 1`        |
//!
//! Depth-first keeps each root-to-leaf path close together in memory and is
//! the default. Breadth-first keeps the top levels of the tree contiguous.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::StructuralError;

use super::{Node, NodeIndex, check_structure};

/// Leaf output before layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeafOutput {
    Scalar(f32),
    Vector(Vec<f32>),
}

impl LeafOutput {
    /// Number of outputs this leaf produces.
    pub fn width(&self) -> usize {
        match self {
            LeafOutput::Scalar(_) => 1,
            LeafOutput::Vector(v) => v.len(),
        }
    }
}

/// Node of a normalized tree: strict `<` splits only.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeNode {
    Split {
        feature: usize,
        threshold: f32,
        default_left: bool,
        left: usize,
        right: usize,
    },
    Leaf(LeafOutput),
}

/// A normalized tree awaiting layout. Node 0 is the root.
///
/// The fields are public, so layout re-checks the shape before placing it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TreeShape {
    pub nodes: Vec<ShapeNode>,
}

impl TreeShape {
    #[inline]
    fn children(&self, id: usize) -> Option<(usize, usize)> {
        match self.nodes[id] {
            ShapeNode::Split { left, right, .. } => Some((left, right)),
            ShapeNode::Leaf(_) => None,
        }
    }

    /// Verify every node is reached exactly once from the root.
    ///
    /// Returns the maximum depth. Errors name the tree as index 0; see
    /// [`StructuralError::in_tree`].
    pub fn check(&self) -> Result<usize, StructuralError> {
        check_structure(0, self.nodes.len(), |id| self.children(id))
    }
}

/// Placement policy for nodes within a tree's flat array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeLayout {
    /// Pre-order; the left child directly follows its parent.
    #[default]
    DepthFirst,
    /// Level order; sibling pairs are adjacent.
    BreadthFirst,
}

impl TreeLayout {
    /// Position of the left child of the node at `index`.
    #[inline(always)]
    pub fn left_child(self, index: usize, distant_offset: usize) -> usize {
        match self {
            TreeLayout::DepthFirst => index + 1,
            TreeLayout::BreadthFirst => index + distant_offset,
        }
    }

    /// Position of the right child of the node at `index`.
    #[inline(always)]
    pub fn right_child(self, index: usize, distant_offset: usize) -> usize {
        match self {
            TreeLayout::DepthFirst => index + distant_offset,
            TreeLayout::BreadthFirst => index + distant_offset + 1,
        }
    }

    /// Child selected by a branch decision.
    #[inline(always)]
    pub fn child(self, index: usize, distant_offset: usize, go_left: bool) -> usize {
        if go_left {
            self.left_child(index, distant_offset)
        } else {
            self.right_child(index, distant_offset)
        }
    }

    /// Shape node ids in the order they are placed.
    ///
    /// Fails on an empty, dangling, cyclic or shared shape.
    pub fn order(self, shape: &TreeShape) -> Result<Vec<usize>, StructuralError> {
        shape.check()?;
        let mut order = Vec::with_capacity(shape.nodes.len());
        match self {
            TreeLayout::DepthFirst => {
                let mut stack = vec![0usize];
                while let Some(id) = stack.pop() {
                    order.push(id);
                    if let Some((left, right)) = shape.children(id) {
                        stack.push(right);
                        stack.push(left);
                    }
                }
            }
            TreeLayout::BreadthFirst => {
                let mut queue = VecDeque::from([0usize]);
                while let Some(id) = queue.pop_front() {
                    order.push(id);
                    if let Some((left, right)) = shape.children(id) {
                        queue.push_back(left);
                        queue.push_back(right);
                    }
                }
            }
        }
        Ok(order)
    }

    /// Lay out `shape` into a flat node array plus the vector-leaf table.
    ///
    /// Vector leaves are appended to the table in placement order. Besides
    /// the structural checks of [`order`](Self::order), every vector leaf must
    /// have the same width and every offset and feature index must fit in `I`.
    pub fn lay_out<I: NodeIndex>(self, shape: &TreeShape) -> Result<(Vec<Node<I>>, Vec<f32>), StructuralError> {
        let order = self.order(shape)?;
        check_vector_widths(shape)?;
        let mut position = vec![0usize; shape.nodes.len()];
        for (pos, &id) in order.iter().enumerate() {
            position[id] = pos;
        }

        let mut nodes = Vec::with_capacity(order.len());
        let mut vectors = Vec::new();
        let mut n_vectors = 0u32;

        for (pos, &id) in order.iter().enumerate() {
            let node = match &shape.nodes[id] {
                ShapeNode::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                } => {
                    let offset = match self {
                        TreeLayout::DepthFirst => {
                            debug_assert_eq!(position[*left], pos + 1);
                            position[*right] - pos
                        }
                        TreeLayout::BreadthFirst => {
                            debug_assert_eq!(position[*right], position[*left] + 1);
                            position[*left] - pos
                        }
                    };
                    Node::split(narrow(*feature)?, *threshold, narrow(offset)?, *default_left)
                }
                ShapeNode::Leaf(LeafOutput::Scalar(value)) => Node::scalar_leaf(*value),
                ShapeNode::Leaf(LeafOutput::Vector(values)) => {
                    vectors.extend_from_slice(values);
                    n_vectors += 1;
                    Node::vector_leaf(n_vectors - 1)
                }
            };
            nodes.push(node);
        }

        Ok((nodes, vectors))
    }
}

fn narrow<I: NodeIndex>(value: usize) -> Result<I, StructuralError> {
    I::try_from_usize(value).ok_or(StructuralError::IndexWidthTooNarrow {
        requested: I::WIDTH,
        required: value,
    })
}

fn check_vector_widths(shape: &TreeShape) -> Result<(), StructuralError> {
    let mut first = None;
    for (node, n) in shape.nodes.iter().enumerate() {
        let ShapeNode::Leaf(LeafOutput::Vector(values)) = n else {
            continue;
        };
        let expected = *first.get_or_insert(values.len());
        if values.len() != expected {
            return Err(StructuralError::LeafWidthMismatch {
                tree: 0,
                node,
                width: values.len(),
                expected,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repr::IndexWidth;

    fn split(left: usize, right: usize) -> ShapeNode {
        ShapeNode::Split {
            feature: 0,
            threshold: 0.5,
            default_left: true,
            left,
            right,
        }
    }

    fn leaf(v: f32) -> ShapeNode {
        ShapeNode::Leaf(LeafOutput::Scalar(v))
    }

    /// ```text
    ///         0
    ///       /   \
    ///      1     2
    ///     / \   / \
    ///    3   4 5   6
    /// ```
    fn balanced() -> TreeShape {
        TreeShape {
            nodes: vec![
                split(1, 2),
                split(3, 4),
                split(5, 6),
                leaf(3.0),
                leaf(4.0),
                leaf(5.0),
                leaf(6.0),
            ],
        }
    }

    #[test]
    fn depth_first_is_preorder() {
        assert_eq!(TreeLayout::DepthFirst.order(&balanced()).unwrap(), vec![0, 1, 3, 4, 2, 5, 6]);
    }

    #[test]
    fn breadth_first_is_level_order() {
        assert_eq!(TreeLayout::BreadthFirst.order(&balanced()).unwrap(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn offsets_locate_children() {
        for layout in [TreeLayout::DepthFirst, TreeLayout::BreadthFirst] {
            let shape = balanced();
            let order = layout.order(&shape).unwrap();
            let (nodes, _) = layout.lay_out::<u8>(&shape).unwrap();
            for (pos, node) in nodes.iter().enumerate() {
                if node.is_leaf() {
                    continue;
                }
                let ShapeNode::Split { left, right, .. } = shape.nodes[order[pos]] else {
                    unreachable!()
                };
                let offset = node.distant_offset() as usize;
                assert_eq!(order[layout.left_child(pos, offset)], left, "{layout:?}");
                assert_eq!(order[layout.right_child(pos, offset)], right, "{layout:?}");
            }
        }
    }

    #[test]
    fn single_leaf_tree() {
        let shape = TreeShape {
            nodes: vec![leaf(7.0)],
        };
        let (nodes, vectors) = TreeLayout::DepthFirst.lay_out::<u8>(&shape).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].is_leaf());
        assert_eq!(nodes[0].leaf_value(), 7.0);
        assert!(vectors.is_empty());
    }

    #[test]
    fn vector_leaves_fill_table_in_placement_order() {
        let shape = TreeShape {
            nodes: vec![
                split(1, 2),
                ShapeNode::Leaf(LeafOutput::Vector(vec![1.0, 2.0])),
                ShapeNode::Leaf(LeafOutput::Vector(vec![3.0, 4.0])),
            ],
        };
        let (nodes, vectors) = TreeLayout::DepthFirst.lay_out::<u16>(&shape).unwrap();
        assert_eq!(vectors, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(nodes[1].leaf_vector_index(), 0);
        assert_eq!(nodes[2].leaf_vector_index(), 1);
    }

    // =========================================================================
    // Malformed shapes
    // =========================================================================

    #[test]
    fn dangling_child_is_rejected_by_both_layouts() {
        let shape = TreeShape {
            nodes: vec![split(1, 5), leaf(0.0)],
        };
        for layout in [TreeLayout::DepthFirst, TreeLayout::BreadthFirst] {
            assert_eq!(
                layout.lay_out::<u8>(&shape).unwrap_err(),
                StructuralError::DanglingChild {
                    tree: 0,
                    node: 0,
                    child: 5,
                    n_nodes: 2
                }
            );
        }
    }

    #[test]
    fn cyclic_shape_is_rejected() {
        let shape = TreeShape {
            nodes: vec![split(1, 2), split(0, 2), leaf(0.0)],
        };
        assert!(matches!(
            TreeLayout::DepthFirst.order(&shape),
            Err(StructuralError::Cycle { .. })
        ));
        assert!(matches!(
            TreeLayout::BreadthFirst.order(&shape),
            Err(StructuralError::Cycle { .. })
        ));
    }

    #[test]
    fn empty_shape_is_rejected() {
        let err = TreeLayout::DepthFirst.order(&TreeShape::default()).unwrap_err();
        assert_eq!(err, StructuralError::EmptyTree { tree: 0 });
    }

    #[test]
    fn feature_too_wide_for_index_type_is_rejected() {
        let shape = TreeShape {
            nodes: vec![
                ShapeNode::Split {
                    feature: 300,
                    threshold: 0.5,
                    default_left: true,
                    left: 1,
                    right: 2,
                },
                leaf(0.0),
                leaf(1.0),
            ],
        };
        assert_eq!(
            TreeLayout::DepthFirst.lay_out::<u8>(&shape).unwrap_err(),
            StructuralError::IndexWidthTooNarrow {
                requested: IndexWidth::U8,
                required: 300
            }
        );
        let (nodes, _) = TreeLayout::DepthFirst.lay_out::<u16>(&shape).unwrap();
        assert_eq!(nodes[0].feature(), 300);
    }

    #[test]
    fn uneven_vector_leaves_are_rejected() {
        let shape = TreeShape {
            nodes: vec![
                split(1, 2),
                ShapeNode::Leaf(LeafOutput::Vector(vec![1.0, 2.0])),
                ShapeNode::Leaf(LeafOutput::Vector(vec![3.0])),
            ],
        };
        assert_eq!(
            TreeLayout::BreadthFirst.lay_out::<u8>(&shape).unwrap_err(),
            StructuralError::LeafWidthMismatch {
                tree: 0,
                node: 2,
                width: 1,
                expected: 2
            }
        );
    }
}
