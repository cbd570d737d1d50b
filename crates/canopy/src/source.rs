//! Framework-neutral description of a trained tree ensemble.
//!
//! The serving layer translates a framework's model (XGBoost, LightGBM,
//! scikit-learn, ...) into a [`SourceModel`]; [`convert`](crate::convert())
//! turns it into a [`Forest`](crate::repr::Forest). Node ids are local to each
//! tree and the root is node 0.
//!
//! The types derive `serde` so models can be handed over in any format:
//!
//! ```
//! use canopy::source::SourceModel;
//!
//! let model: SourceModel = serde_json::from_str(r#"{
//!     "n_features": 1,
//!     "trees": [{ "nodes": [
//!         { "split": { "feature": 0, "threshold": 0.5, "left": 1, "right": 2 } },
//!         { "leaf": -1.0 },
//!         { "leaf": 1.0 }
//!     ]}]
//! }"#).unwrap();
//! assert_eq!(model.trees[0].nodes.len(), 3);
//! ```

use serde::{Deserialize, Serialize};

pub use crate::repr::LeafOutput;

/// Comparison that sends a row to the left child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// `value < threshold`
    #[default]
    Lt,
    /// `value <= threshold`
    Le,
    /// `value > threshold`
    Gt,
    /// `value >= threshold`
    Ge,
}

/// How tree outputs combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Gradient boosting: outputs add up.
    #[default]
    Sum,
    /// Random-forest regression or probability averaging.
    Average,
    /// Random-forest classification: each tree votes for a class.
    Vote,
}

/// Mapping from raw margins to predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    #[default]
    Identity,
    /// Log-odds margins (logistic / softmax objectives).
    Logit,
    /// Log margins (poisson, gamma, tweedie objectives).
    Log,
}

/// Space a base score is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSpace {
    /// Already a raw margin.
    #[default]
    Margin,
    /// Prediction space; mapped through the inverse [`Link`] on conversion.
    Output,
}

/// One node of a [`SourceTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceNode {
    Split {
        feature: usize,
        threshold: f32,
        #[serde(default)]
        comparison: Comparison,
        /// Direction taken when the feature is missing.
        #[serde(default = "default_true")]
        default_left: bool,
        left: usize,
        right: usize,
    },
    Leaf(LeafOutput),
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f32 {
    1.0
}

fn default_outputs() -> usize {
    1
}

impl SourceNode {
    /// `value < threshold` split.
    pub fn split(feature: usize, threshold: f32, default_left: bool, left: usize, right: usize) -> Self {
        SourceNode::Split {
            feature,
            threshold,
            comparison: Comparison::Lt,
            default_left,
            left,
            right,
        }
    }

    pub fn leaf(value: f32) -> Self {
        SourceNode::Leaf(LeafOutput::Scalar(value))
    }

    pub fn leaf_vector(values: Vec<f32>) -> Self {
        SourceNode::Leaf(LeafOutput::Vector(values))
    }

    /// Replace the comparison of a split node; leaves are returned unchanged.
    pub fn with_comparison(mut self, op: Comparison) -> Self {
        if let SourceNode::Split { comparison, .. } = &mut self {
            *comparison = op;
        }
        self
    }

    pub(crate) fn children(&self) -> Option<(usize, usize)> {
        match *self {
            SourceNode::Split { left, right, .. } => Some((left, right)),
            SourceNode::Leaf(_) => None,
        }
    }
}

/// A single tree, root at node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTree {
    pub nodes: Vec<SourceNode>,
    /// Output slot fed by scalar leaves under sum aggregation.
    #[serde(default)]
    pub group: u32,
    /// Multiplier applied to every leaf (DART weights, learning-rate folding).
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl SourceTree {
    pub fn new(nodes: Vec<SourceNode>) -> Self {
        Self {
            nodes,
            group: 0,
            weight: 1.0,
        }
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

/// A trained ensemble in framework-neutral form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceModel {
    pub n_features: usize,
    /// Output count: classes for classifiers, targets otherwise.
    #[serde(default = "default_outputs")]
    pub n_outputs: usize,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub link: Link,
    /// One value, or one per output. Empty means zero.
    #[serde(default)]
    pub base_score: Vec<f32>,
    #[serde(default)]
    pub base_score_space: ScoreSpace,
    pub trees: Vec<SourceTree>,
}

impl SourceModel {
    /// Single-output regression model with zero base score.
    pub fn regression(n_features: usize, trees: Vec<SourceTree>) -> Self {
        Self {
            n_features,
            n_outputs: 1,
            aggregation: Aggregation::Sum,
            link: Link::Identity,
            base_score: Vec::new(),
            base_score_space: ScoreSpace::Margin,
            trees,
        }
    }

    pub fn with_outputs(mut self, n_outputs: usize) -> Self {
        self.n_outputs = n_outputs;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    pub fn with_base_score(mut self, base_score: Vec<f32>, space: ScoreSpace) -> Self {
        self.base_score = base_score;
        self.base_score_space = space;
        self
    }
}
