//! Batch inference over a [`Forest`].
//!
//! [`infer`] and [`infer_into`] evaluate every row of a row-major feature
//! buffer against every tree and write raw (pre-postprocessing) outputs, one
//! row of `n_outputs` values per input row.
//!
//! # Devices
//!
//! The kernel exists in two instantiations sharing one traversal routine:
//!
//! - [`Device::Host`]: rows are processed in chunks of
//!   [`InferenceConfig::chunk_size`]; within a chunk, trees outer, rows inner
//! - [`Device::Accelerator`]: rows are spread over the data-parallel pool, each
//!   row summing its trees in tree order
//!
//! Each output element receives its contributions in the same order on both
//! devices, so results are bit-identical.
//!
//! # Checks
//!
//! Before any work is launched, in this order: device capability, buffer
//! residency, column count, input length, output length. A failed check
//! leaves the output untouched.

mod accelerator;
mod host;
mod traversal;

pub use traversal::{FeatureRow, MissingValue, traverse};
pub(crate) use traversal::predict_row_into;

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::device::{Buffer, Device, Stream, require_accelerator};
use crate::error::{ConfigError, Error, ShapeError};
use crate::repr::{AnyForest, Forest, NodeIndex, with_forest};

use self::accelerator::AcceleratorKernel;
use self::host::HostKernel;

/// Default rows per chunk (matches XGBoost's block size).
pub const DEFAULT_CHUNK_SIZE: usize = 64;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-request inference parameters.
///
/// ```
/// use canopy::infer::InferenceConfig;
///
/// let config = InferenceConfig::builder()
///     .chunk_size(128)
///     .missing_sentinel(-999.0)
///     .build()
///     .unwrap();
/// assert!(config.missing().is_missing(-999.0));
/// assert!(config.missing().is_missing(f32::NAN));
///
/// assert!(InferenceConfig::builder().chunk_size(0).build().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Builder, Serialize, Deserialize)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct InferenceConfig {
    /// Rows per chunk. Default: [`DEFAULT_CHUNK_SIZE`].
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Extra value treated as missing, besides NaN.
    #[serde(default)]
    pub missing_sentinel: Option<f32>,
}

impl<S: inference_config_builder::IsComplete> InferenceConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroChunkSize`] or [`ConfigError::NanSentinel`].
    pub fn build(self) -> Result<InferenceConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            missing_sentinel: None,
        }
    }
}

impl InferenceConfig {
    /// Check parameters that deserialization cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.missing_sentinel.is_some_and(f32::is_nan) {
            return Err(ConfigError::NanSentinel);
        }
        Ok(())
    }

    #[inline]
    pub fn missing(&self) -> MissingValue {
        MissingValue::with_sentinel(self.missing_sentinel)
    }
}

// =============================================================================
// Kernels
// =============================================================================

/// A validated launch.
pub(crate) struct Launch<'a> {
    pub input: &'a Buffer<f32>,
    pub output: &'a mut Buffer<f32>,
    pub n_rows: usize,
    pub n_cols: usize,
    pub chunk_size: usize,
    pub missing: MissingValue,
    pub stream: Option<&'a Stream>,
}

/// One device instantiation of the inference kernel.
pub(crate) trait Kernel {
    const DEVICE: Device;

    fn launch<I: NodeIndex>(forest: &Forest<I>, launch: Launch<'_>) -> Result<(), Error>;
}

// =============================================================================
// Entry points
// =============================================================================

/// Run inference into a newly allocated output buffer on `device`.
///
/// `input` holds `n_rows * n_cols` row-major values. The output holds
/// `n_rows * forest.n_outputs()` raw values. With an asynchronous `stream`
/// the call returns once the work is queued; read the output (or call
/// [`Stream::synchronize`]) to wait for it.
///
/// ```
/// use canopy::convert::convert;
/// use canopy::device::{Buffer, Device};
/// use canopy::infer::{InferenceConfig, infer};
/// use canopy::source::{SourceModel, SourceNode, SourceTree};
///
/// let trees = (0..3).map(|_| SourceTree::new(vec![SourceNode::leaf(1.0)])).collect();
/// let forest = convert(&SourceModel::regression(2, trees)).unwrap();
/// let input = Buffer::from_vec(vec![0.0f32; 4]);
///
/// let out = infer(&forest, &input, 2, 2, &InferenceConfig::default(), Device::Host, None).unwrap();
/// assert_eq!(out.to_vec(), vec![3.0, 3.0]);
/// ```
///
/// # Errors
///
/// [`UnsupportedDeviceError`](crate::error::UnsupportedDeviceError) when
/// `device` is compiled out, [`ShapeError`] for residency or size mismatches,
/// and [`ConfigError`] for an invalid `config`.
pub fn infer(
    forest: &AnyForest,
    input: &Buffer<f32>,
    n_rows: usize,
    n_cols: usize,
    config: &InferenceConfig,
    device: Device,
    stream: Option<&Stream>,
) -> Result<Buffer<f32>, Error> {
    check_request(forest, input, None, n_rows, n_cols, device)?;
    let mut output = Buffer::zeroed(n_rows * forest.n_outputs(), device)?;
    infer_into(forest, input, &mut output, n_rows, n_cols, config, device, stream)?;
    Ok(output)
}

/// Run inference into a caller-provided `output` on `device`.
///
/// `output` must hold `n_rows * forest.n_outputs()` values and reside where
/// `device` computes. Its previous contents are overwritten.
#[allow(clippy::too_many_arguments)]
pub fn infer_into(
    forest: &AnyForest,
    input: &Buffer<f32>,
    output: &mut Buffer<f32>,
    n_rows: usize,
    n_cols: usize,
    config: &InferenceConfig,
    device: Device,
    stream: Option<&Stream>,
) -> Result<(), Error> {
    check_request(forest, input, Some(output), n_rows, n_cols, device)?;
    config.validate()?;

    tracing::debug!(
        rows = n_rows,
        cols = n_cols,
        trees = forest.n_trees(),
        outputs = forest.n_outputs(),
        width = ?forest.index_width(),
        ?device,
        chunk_size = config.chunk_size,
        asynchronous = stream.is_some_and(Stream::is_asynchronous),
        "launching inference"
    );

    let launch = Launch {
        input,
        output,
        n_rows,
        n_cols,
        chunk_size: config.chunk_size,
        missing: config.missing(),
        stream,
    };
    with_forest!(forest, f => dispatch(f, device, launch))
}

fn dispatch<I: NodeIndex>(forest: &Forest<I>, device: Device, launch: Launch<'_>) -> Result<(), Error> {
    match device {
        Device::Host => HostKernel::launch(forest, launch),
        Device::Accelerator => AcceleratorKernel::launch(forest, launch),
    }
}

fn check_request(
    forest: &AnyForest,
    input: &Buffer<f32>,
    output: Option<&Buffer<f32>>,
    n_rows: usize,
    n_cols: usize,
    device: Device,
) -> Result<(), Error> {
    if device.is_accelerator() {
        require_accelerator("run inference on the accelerator")?;
    }
    check_residency("input", input, device)?;
    if let Some(output) = output {
        check_residency("output", output, device)?;
    }

    if n_cols != forest.n_features() {
        return Err(ShapeError::ColumnMismatch {
            expected: forest.n_features(),
            actual: n_cols,
        }
        .into());
    }
    let expected = n_rows.saturating_mul(n_cols);
    if input.len() != expected {
        return Err(ShapeError::InputLength {
            expected,
            actual: input.len(),
        }
        .into());
    }
    if let Some(output) = output {
        let expected = n_rows.saturating_mul(forest.n_outputs());
        if output.len() != expected {
            return Err(ShapeError::OutputLength {
                expected,
                actual: output.len(),
            }
            .into());
        }
    }
    Ok(())
}

fn check_residency(buffer: &'static str, data: &Buffer<f32>, device: Device) -> Result<(), ShapeError> {
    if data.residency() != device.residency() {
        return Err(ShapeError::ResidencyMismatch {
            buffer,
            expected: device.residency(),
            actual: data.residency(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::convert;
    use crate::source::{Aggregation, SourceModel, SourceNode, SourceTree};

    fn stump_model() -> AnyForest {
        let tree = crate::source_tree! {
            0 => num(1, 0.5, L) -> 1, 2,
            1 => leaf(-1.0),
            2 => leaf(1.0),
        };
        convert(&SourceModel::regression(2, vec![tree])).unwrap()
    }

    fn run(forest: &AnyForest, rows: &[f32], n_cols: usize, config: &InferenceConfig) -> Vec<f32> {
        let input = Buffer::from_vec(rows.to_vec());
        infer(forest, &input, rows.len() / n_cols.max(1), n_cols, config, Device::Host, None)
            .unwrap()
            .to_vec()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    #[test]
    fn config_defaults() {
        let config = InferenceConfig::builder().build().unwrap();
        assert_eq!(config, InferenceConfig::default());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.missing(), MissingValue::NAN);
    }

    #[test]
    fn config_rejects_nan_sentinel() {
        let err = InferenceConfig::builder().missing_sentinel(f32::NAN).build().unwrap_err();
        assert_eq!(err, ConfigError::NanSentinel);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: InferenceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, InferenceConfig::default());
    }

    // =========================================================================
    // Host kernel
    // =========================================================================

    #[test]
    fn predicts_each_row() {
        let forest = stump_model();
        let rows = [0.0, 0.2, 0.0, 0.8, 0.0, f32::NAN];
        let out = run(&forest, &rows, 2, &InferenceConfig::default());
        assert_eq!(out, vec![-1.0, 1.0, -1.0]);
    }

    #[test]
    fn chunk_size_does_not_change_results() {
        let forest = stump_model();
        let rows: Vec<f32> = (0..200).map(|i| (i % 7) as f32 / 7.0).collect();
        let reference = run(&forest, &rows, 2, &InferenceConfig::default());
        for chunk_size in [1, 3, 64, 1000] {
            let config = InferenceConfig::builder().chunk_size(chunk_size).build().unwrap();
            assert_eq!(run(&forest, &rows, 2, &config), reference);
        }
    }

    #[test]
    fn sentinel_takes_default_direction() {
        let forest = stump_model();
        let config = InferenceConfig::builder().missing_sentinel(7.0).build().unwrap();
        assert_eq!(run(&forest, &[0.0, 7.0], 2, &config), vec![-1.0]);
        assert_eq!(run(&forest, &[0.0, 7.0], 2, &InferenceConfig::default()), vec![1.0]);
    }

    #[test]
    fn zero_rows_yield_empty_output() {
        let forest = stump_model();
        assert!(run(&forest, &[], 2, &InferenceConfig::default()).is_empty());
    }

    #[test]
    fn vote_forest_counts_classes() {
        let trees = [0.0, 2.0, 2.0]
            .into_iter()
            .map(|class| SourceTree::new(vec![SourceNode::leaf(class)]))
            .collect();
        let model = SourceModel::regression(1, trees)
            .with_outputs(3)
            .with_aggregation(Aggregation::Vote);
        let forest = convert(&model).unwrap();
        assert_eq!(run(&forest, &[0.0], 1, &InferenceConfig::default()), vec![1.0, 0.0, 2.0]);
    }

    // =========================================================================
    // Request checks
    // =========================================================================

    #[test]
    fn column_mismatch_is_shape_error() {
        let forest = stump_model();
        let input = Buffer::from_vec(vec![0.0f32; 6]);
        let err = infer(&forest, &input, 2, 3, &InferenceConfig::default(), Device::Host, None).unwrap_err();
        assert_eq!(err, Error::Shape(ShapeError::ColumnMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn input_length_is_checked() {
        let forest = stump_model();
        let input = Buffer::from_vec(vec![0.0f32; 5]);
        let err = infer(&forest, &input, 3, 2, &InferenceConfig::default(), Device::Host, None).unwrap_err();
        assert_eq!(err, Error::Shape(ShapeError::InputLength { expected: 6, actual: 5 }));
    }

    #[test]
    fn output_length_is_checked_and_output_untouched() {
        let forest = stump_model();
        let input = Buffer::from_vec(vec![0.0f32; 4]);
        let mut output = Buffer::from_vec(vec![9.0f32; 3]);
        let err = infer_into(
            &forest,
            &input,
            &mut output,
            2,
            2,
            &InferenceConfig::default(),
            Device::Host,
            None,
        )
        .unwrap_err();
        assert_eq!(err, Error::Shape(ShapeError::OutputLength { expected: 2, actual: 3 }));
        assert_eq!(output.to_vec(), vec![9.0; 3]);
    }

    #[cfg(feature = "accelerator")]
    #[test]
    fn residency_mismatch_is_shape_error() {
        use crate::device::Residency;

        let forest = stump_model();
        let input = Buffer::from_slice(&[0.0f32; 2], Device::Accelerator).unwrap();
        let err = infer(&forest, &input, 1, 2, &InferenceConfig::default(), Device::Host, None).unwrap_err();
        assert_eq!(
            err,
            Error::Shape(ShapeError::ResidencyMismatch {
                buffer: "input",
                expected: Residency::Host,
                actual: Residency::Accelerator,
            })
        );
    }

    #[cfg(not(feature = "accelerator"))]
    #[test]
    fn accelerator_inference_unsupported() {
        let forest = stump_model();
        let input = Buffer::from_vec(vec![0.0f32; 2]);
        let err = infer(&forest, &input, 1, 2, &InferenceConfig::default(), Device::Accelerator, None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDevice(_)));
    }
}
