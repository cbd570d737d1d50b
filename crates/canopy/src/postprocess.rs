//! Conversion of raw accumulator outputs into final predictions.
//!
//! A [`PostprocessorConfig`] names a [`Transform`] and the number of raw
//! outputs per row. Transforms are pure and row-wise: any set of disjoint row
//! ranges can be processed concurrently, and no state survives between calls.
//!
//! # Transforms
//!
//! - [`Identity`](Transform::Identity): raw margins (regression)
//! - [`Sigmoid`](Transform::Sigmoid): logistic function, element-wise
//! - [`Exp`](Transform::Exp): exponential, element-wise (log-link regression)
//! - [`Softmax`](Transform::Softmax): row-wise, numerically stable
//! - [`ClassVotes`](Transform::ClassVotes): vote totals normalized to vote shares
//! - [`MaxIndex`](Transform::MaxIndex): index of the winning output (width 1)

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::device::Buffer;
use crate::error::{ConfigError, Error, ShapeError};

/// Inference-time output transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// No transformation; output = margin.
    #[default]
    Identity,

    /// Logistic sigmoid: output = 1 / (1 + exp(-margin)).
    Sigmoid,

    /// output = exp(margin).
    Exp,

    /// Softmax: output_i = exp(margin_i) / sum(exp(margin_j)).
    Softmax,

    /// output_i = votes_i / sum(votes_j); rows without votes stay zero.
    ClassVotes,

    /// Index of the first maximum, as `f32`.
    MaxIndex,
}

/// Postprocessing parameters. Stateless and reusable across requests.
///
/// ```
/// use canopy::postprocess::{PostprocessorConfig, Transform};
///
/// let config = PostprocessorConfig::builder()
///     .transform(Transform::Softmax)
///     .n_outputs(3)
///     .build()
///     .unwrap();
/// let mut row = [1000.0, 1000.0, 1000.0];
/// config.apply_inplace(&mut row).unwrap();
/// assert!((row[0] - 1.0 / 3.0).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct PostprocessorConfig {
    /// Default: `Identity`.
    #[builder(default)]
    pub transform: Transform,

    /// Raw outputs per row (classes for classifiers). Default: 1.
    #[builder(default = 1)]
    pub n_outputs: usize,
}

impl<S: postprocessor_config_builder::IsComplete> PostprocessorConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroOutputs`] if `n_outputs == 0`.
    pub fn build(self) -> Result<PostprocessorConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl Default for PostprocessorConfig {
    fn default() -> Self {
        Self {
            transform: Transform::Identity,
            n_outputs: 1,
        }
    }
}

impl PostprocessorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.n_outputs == 0 {
            return Err(ConfigError::ZeroOutputs);
        }
        Ok(())
    }

    /// Values per row after the transform.
    #[inline]
    pub fn output_width(&self) -> usize {
        match self.transform {
            Transform::MaxIndex => 1,
            _ => self.n_outputs,
        }
    }

    /// Number of whole rows in `len` raw values.
    fn rows_in(&self, len: usize) -> Result<usize, ShapeError> {
        if self.n_outputs == 0 || len % self.n_outputs != 0 {
            return Err(ShapeError::RaggedRows {
                len,
                width: self.n_outputs,
            });
        }
        Ok(len / self.n_outputs)
    }

    /// Transform one row of `n_outputs` raw values into `output_width` values.
    #[inline]
    pub fn apply_row(&self, raw: &[f32], out: &mut [f32]) {
        debug_assert_eq!(raw.len(), self.n_outputs);
        debug_assert_eq!(out.len(), self.output_width());
        match self.transform {
            Transform::Identity => out.copy_from_slice(raw),
            Transform::Sigmoid => {
                for (o, &x) in out.iter_mut().zip(raw) {
                    *o = sigmoid(x);
                }
            }
            Transform::Exp => {
                for (o, &x) in out.iter_mut().zip(raw) {
                    *o = x.exp();
                }
            }
            Transform::Softmax => {
                out.copy_from_slice(raw);
                softmax_inplace(out);
            }
            Transform::ClassVotes => {
                out.copy_from_slice(raw);
                normalize_inplace(out);
            }
            Transform::MaxIndex => out[0] = argmax(raw) as f32,
        }
    }

    /// Transform a row-major block of raw rows into `out`.
    ///
    /// `raw` may be any whole number of rows; `out` must hold
    /// `rows * output_width()` values. Disjoint blocks may be processed from
    /// different threads.
    pub fn apply_rows(&self, raw: &[f32], out: &mut [f32]) -> Result<(), ShapeError> {
        let rows = self.rows_in(raw.len())?;
        let width = self.output_width();
        if out.len() != rows * width {
            return Err(ShapeError::OutputLength {
                expected: rows * width,
                actual: out.len(),
            });
        }
        for (raw_row, out_row) in raw.chunks_exact(self.n_outputs).zip(out.chunks_exact_mut(width)) {
            self.apply_row(raw_row, out_row);
        }
        Ok(())
    }

    /// Transform row-major `values` in place.
    ///
    /// Returns the number of leading values that hold results: `values.len()`
    /// for width-preserving transforms, the row count for `MaxIndex`.
    pub fn apply_inplace(&self, values: &mut [f32]) -> Result<usize, ShapeError> {
        let rows = self.rows_in(values.len())?;
        let n = self.n_outputs;
        match self.transform {
            Transform::Identity => {}
            Transform::Sigmoid => values.iter_mut().for_each(|x| *x = sigmoid(*x)),
            Transform::Exp => values.iter_mut().for_each(|x| *x = x.exp()),
            Transform::Softmax => values.chunks_exact_mut(n).for_each(softmax_inplace),
            Transform::ClassVotes => values.chunks_exact_mut(n).for_each(normalize_inplace),
            Transform::MaxIndex => {
                // Row r's result lands at index r <= r * n, which is already consumed.
                for r in 0..rows {
                    let start = r * n;
                    values[r] = argmax(&values[start..start + n]) as f32;
                }
                return Ok(rows);
            }
        }
        Ok(values.len())
    }
}

/// Postprocess a raw output buffer into a new buffer on the same device.
pub fn postprocess(raw: &Buffer<f32>, config: &PostprocessorConfig) -> Result<Buffer<f32>, Error> {
    let rows = config.rows_in(raw.len())?;
    let mut out = vec![0.0f32; rows * config.output_width()];
    tracing::trace!(rows, transform = ?config.transform, device = ?raw.device(), "postprocess");

    raw.read(|values| apply_on_device(config, raw.device(), values, &mut out))?;
    Ok(Buffer::from_slice(&out, raw.device())?)
}

#[cfg(feature = "accelerator")]
fn apply_on_device(
    config: &PostprocessorConfig,
    device: crate::device::Device,
    raw: &[f32],
    out: &mut [f32],
) -> Result<(), ShapeError> {
    use rayon::prelude::*;

    if !device.is_accelerator() {
        return config.apply_rows(raw, out);
    }
    let width = config.output_width();
    raw.par_chunks_exact(config.n_outputs)
        .zip(out.par_chunks_exact_mut(width))
        .with_min_len(crate::infer::DEFAULT_CHUNK_SIZE)
        .for_each(|(raw_row, out_row)| config.apply_row(raw_row, out_row));
    Ok(())
}

#[cfg(not(feature = "accelerator"))]
fn apply_on_device(
    config: &PostprocessorConfig,
    _device: crate::device::Device,
    raw: &[f32],
    out: &mut [f32],
) -> Result<(), ShapeError> {
    config.apply_rows(raw, out)
}

/// Numerically stable sigmoid.
/// Clamps input to [-500, 500] to prevent overflow.
#[inline]
fn sigmoid(x: f32) -> f32 {
    let clamped = x.clamp(-500.0, 500.0);
    if clamped >= 0.0 {
        1.0 / (1.0 + (-clamped).exp())
    } else {
        let e = clamped.exp();
        e / (1.0 + e)
    }
}

/// Numerically stable softmax in-place.
/// Subtracts max before exponentiating to avoid overflow.
#[inline]
fn softmax_inplace(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }

    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }

    if sum > 0.0 {
        for x in row.iter_mut() {
            *x /= sum;
        }
    }
}

#[inline]
fn normalize_inplace(row: &mut [f32]) {
    let sum: f32 = row.iter().sum();
    if sum > 0.0 {
        for x in row.iter_mut() {
            *x /= sum;
        }
    }
}

#[inline]
fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] || row[best].is_nan() {
            best = i;
        }
    }
    best
}
