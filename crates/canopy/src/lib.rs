//! canopy: device-portable inference for decision tree ensembles.
//!
//! Trained ensembles from any framework are described as a
//! [`SourceModel`](source::SourceModel), converted once into an immutable,
//! flat [`Forest`](repr::Forest), and then evaluated in batches on the host or
//! on a data-parallel accelerator with identical results.
//!
//! # Pipeline
//!
//! 1. [`convert()`]: validate, normalize and lay out a source model
//! 2. [`infer()`]: raw per-row outputs into a [`Buffer`](device::Buffer)
//! 3. [`postprocess()`]: sigmoid, softmax or vote shares
//!
//! ```
//! use canopy::device::{Buffer, Device};
//! use canopy::infer::InferenceConfig;
//! use canopy::source::{Link, SourceModel, SourceNode, SourceTree};
//! use canopy::{convert, infer, postprocess, postprocessor_for};
//!
//! let tree = SourceTree::new(vec![
//!     SourceNode::split(0, 0.5, true, 1, 2),
//!     SourceNode::leaf(-2.0),
//!     SourceNode::leaf(2.0),
//! ]);
//! let model = SourceModel::regression(1, vec![tree]).with_link(Link::Logit);
//! let forest = convert(&model).unwrap();
//!
//! let input = Buffer::from_vec(vec![0.0, 1.0, f32::NAN]);
//! let raw = infer(&forest, &input, 3, 1, &InferenceConfig::default(), Device::Host, None).unwrap();
//! assert_eq!(raw.to_vec(), vec![-2.0, 2.0, -2.0]);
//!
//! let probs = postprocess(&raw, &postprocessor_for(&model)).unwrap().to_vec();
//! assert!(probs[0] < 0.5 && probs[1] > 0.5);
//! ```
//!
//! # Features
//!
//! - `accelerator` (default): the accelerator instantiation. Without it every
//!   accelerator request fails with
//!   [`UnsupportedDeviceError`](error::UnsupportedDeviceError).

// Re-export approx traits for users who want to compare predictions
pub use approx;

pub mod convert;
pub mod device;
pub mod error;
pub mod infer;
pub mod postprocess;
pub mod repr;
pub mod source;
pub mod testing;

// =============================================================================
// Convenience Re-exports
// =============================================================================

pub use convert::{ConvertConfig, convert, convert_with, postprocessor_for};
pub use device::{Buffer, Device, Residency, Stream};
pub use error::{ConfigError, Error, Result, ShapeError, StructuralError, UnsupportedDeviceError};
pub use infer::{InferenceConfig, infer, infer_into};
pub use postprocess::{PostprocessorConfig, Transform, postprocess};
pub use repr::{AnyForest, Forest, IndexWidth, TreeLayout};
