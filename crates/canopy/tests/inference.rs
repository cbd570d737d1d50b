//! End-to-end inference scenarios: convert, infer, postprocess.

use approx::assert_abs_diff_eq;
use rstest::rstest;

use canopy::device::{Buffer, Device, Stream};
use canopy::error::{Error, ShapeError};
use canopy::infer::{InferenceConfig, infer};
use canopy::postprocess::{PostprocessorConfig, Transform, postprocess};
use canopy::repr::{AnyForest, TreeLayout};
use canopy::source::{Aggregation, Link, ScoreSpace, SourceModel, SourceNode, SourceTree};
use canopy::testing::{DEFAULT_TOLERANCE, assert_slice_approx_eq};
use canopy::{ConvertConfig, convert, convert_with, postprocessor_for, source_tree};

// =============================================================================
// Helpers
// =============================================================================

fn host_infer(forest: &AnyForest, rows: &[f32], n_cols: usize) -> Result<Vec<f32>, Error> {
    let n_rows = if n_cols == 0 { 0 } else { rows.len() / n_cols };
    let input = Buffer::from_vec(rows.to_vec());
    let out = infer(forest, &input, n_rows, n_cols, &InferenceConfig::default(), Device::Host, None)?;
    Ok(out.to_vec())
}

fn constant_trees(n: usize, value: f32) -> Vec<SourceTree> {
    (0..n).map(|_| SourceTree::new(vec![SourceNode::leaf(value)])).collect()
}

/// Three-class softmax model: one depth-1 tree per class.
fn multiclass_model() -> SourceModel {
    let trees = (0..3)
        .map(|class| {
            let tree = source_tree! {
                0 => num(class, 0.0, R) -> 1, 2,
                1 => leaf(-1.0),
                2 => leaf(1.0),
            };
            tree.with_group(class as u32)
        })
        .collect();
    SourceModel::regression(3, trees)
        .with_outputs(3)
        .with_link(Link::Logit)
}

// =============================================================================
// Basic semantics
// =============================================================================

#[rstest]
#[case::depth_first(TreeLayout::DepthFirst)]
#[case::breadth_first(TreeLayout::BreadthFirst)]
fn single_leaf_predicts_constant(#[case] layout: TreeLayout) {
    let model = SourceModel::regression(2, constant_trees(1, 4.25));
    let config = ConvertConfig::builder().layout(layout).build();
    let forest = convert_with(&model, &config).unwrap();
    let out = host_infer(&forest, &[1.0, 2.0, f32::NAN, -3.0], 2).unwrap();
    assert_eq!(out, vec![4.25, 4.25]);
}

#[rstest]
#[case(1)]
#[case(10)]
#[case(300)]
fn unit_trees_sum_to_tree_count(#[case] n_trees: usize) {
    let forest = convert(&SourceModel::regression(1, constant_trees(n_trees, 1.0))).unwrap();
    let out = host_infer(&forest, &[0.0; 5], 1).unwrap();
    assert_eq!(out, vec![n_trees as f32; 5]);
}

#[rstest]
#[case::default_left(true, -1.0)]
#[case::default_right(false, 1.0)]
fn missing_at_root_follows_default(#[case] default_left: bool, #[case] expected: f32) {
    let tree = SourceTree::new(vec![
        SourceNode::split(0, 0.0, default_left, 1, 2),
        SourceNode::leaf(-1.0),
        SourceNode::leaf(1.0),
    ]);
    let forest = convert(&SourceModel::regression(1, vec![tree])).unwrap();
    assert_eq!(host_infer(&forest, &[f32::NAN], 1).unwrap(), vec![expected]);
}

#[test]
fn empty_forest_predicts_base_score() {
    let model = SourceModel::regression(2, vec![])
        .with_outputs(2)
        .with_base_score(vec![0.5, -0.5], ScoreSpace::Margin);
    let forest = convert(&model).unwrap();
    assert_eq!(host_infer(&forest, &[0.0, 0.0], 2).unwrap(), vec![0.5, -0.5]);
}

#[test]
fn column_mismatch_is_shape_error() {
    let forest = convert(&SourceModel::regression(3, constant_trees(1, 1.0))).unwrap();
    let err = host_infer(&forest, &[0.0; 8], 4).unwrap_err();
    assert_eq!(err, Error::Shape(ShapeError::ColumnMismatch { expected: 3, actual: 4 }));
}

// =============================================================================
// Postprocessing
// =============================================================================

#[test]
fn softmax_of_equal_large_margins_is_uniform() {
    let raw = Buffer::from_vec(vec![1000.0, 1000.0, 1000.0]);
    let config = PostprocessorConfig::builder()
        .transform(Transform::Softmax)
        .n_outputs(3)
        .build()
        .unwrap();
    let probs = postprocess(&raw, &config).unwrap().to_vec();
    for p in probs {
        assert_abs_diff_eq!(p, 1.0 / 3.0, epsilon = 1e-6);
    }
}

#[test]
fn multiclass_pipeline() {
    let model = multiclass_model();
    let forest = convert(&model).unwrap();
    let rows = [1.0, -1.0, -1.0, f32::NAN, f32::NAN, 1.0];
    let raw = Buffer::from_vec(host_infer(&forest, &rows, 3).unwrap());
    assert_eq!(raw.to_vec(), vec![1.0, -1.0, -1.0, 1.0, 1.0, 1.0]);

    let probs = postprocess(&raw, &postprocessor_for(&model)).unwrap().to_vec();
    let e = std::f32::consts::E;
    let hi = e / (e + 2.0 / e);
    let lo = (1.0 / e) / (e + 2.0 / e);
    assert_slice_approx_eq(&probs[..3], &[hi, lo, lo], DEFAULT_TOLERANCE, "row 0");
    assert_slice_approx_eq(&probs[3..], &[1.0 / 3.0; 3], DEFAULT_TOLERANCE, "row 1");
}

#[test]
fn random_forest_votes_become_shares() {
    let trees = [0.0, 1.0, 1.0, 1.0]
        .into_iter()
        .map(|class| {
            source_tree! {
                0 => num(0, 0.5, L) -> 1, 2,
                1 => leaf(class),
                2 => leaf(2.0),
            }
        })
        .collect();
    let model = SourceModel::regression(1, trees)
        .with_outputs(3)
        .with_aggregation(Aggregation::Vote);
    let forest = convert(&model).unwrap();
    let raw = Buffer::from_vec(host_infer(&forest, &[0.0, 1.0], 1).unwrap());
    assert_eq!(raw.to_vec(), vec![1.0, 3.0, 0.0, 0.0, 0.0, 4.0]);

    let shares = postprocess(&raw, &postprocessor_for(&model)).unwrap().to_vec();
    assert_eq!(shares, vec![0.25, 0.75, 0.0, 0.0, 0.0, 1.0]);
}

#[test]
fn source_model_from_json() {
    let model: SourceModel = serde_json::from_str(
        r#"{
            "n_features": 2,
            "link": "logit",
            "base_score": [0.5],
            "base_score_space": "output",
            "trees": [{ "nodes": [
                { "split": { "feature": 1, "threshold": 3.0, "comparison": "le",
                             "default_left": false, "left": 1, "right": 2 } },
                { "leaf": -0.5 },
                { "leaf": 0.5 }
            ]}]
        }"#,
    )
    .unwrap();
    let forest = convert(&model).unwrap();
    let raw = host_infer(&forest, &[0.0, 3.0, 0.0, 3.5, 0.0, f32::NAN], 2).unwrap();
    assert_slice_approx_eq(&raw, &[-0.5, 0.5, 0.5], DEFAULT_TOLERANCE, "raw");
}

// =============================================================================
// Devices and streams
// =============================================================================

#[cfg(feature = "accelerator")]
#[test]
fn accelerator_pipeline_stays_on_device() {
    use canopy::device::Residency;

    let model = multiclass_model();
    let forest = convert(&model).unwrap();
    let rows = [0.5f32, -0.5, 0.25, 2.0, f32::NAN, -1.0];
    let input = Buffer::from_slice(&rows, Device::Accelerator).unwrap();

    let raw = infer(&forest, &input, 2, 3, &InferenceConfig::default(), Device::Accelerator, None).unwrap();
    assert_eq!(raw.residency(), Residency::Accelerator);

    let probs = postprocess(&raw, &postprocessor_for(&model)).unwrap();
    assert_eq!(probs.residency(), Residency::Accelerator);

    let host_raw = Buffer::from_vec(host_infer(&forest, &rows, 3).unwrap());
    let host_probs = postprocess(&host_raw, &postprocessor_for(&model)).unwrap();
    assert_eq!(probs.to_vec(), host_probs.to_vec());
}

#[cfg(feature = "accelerator")]
#[test]
fn streams_order_repeated_launches() {
    use canopy::infer::infer_into;

    let forest = convert(&SourceModel::regression(1, constant_trees(3, 0.5))).unwrap();
    let stream = Stream::new(Device::Accelerator).unwrap();
    let input = Buffer::from_slice(&[0.0f32; 256], Device::Accelerator).unwrap();
    let mut output = Buffer::<f32>::zeroed(256, Device::Accelerator).unwrap();
    let config = InferenceConfig::builder().chunk_size(8).build().unwrap();

    for _ in 0..4 {
        infer_into(&forest, &input, &mut output, 256, 1, &config, Device::Accelerator, Some(&stream)).unwrap();
    }
    stream.synchronize().unwrap();
    assert_eq!(output.to_vec(), vec![1.5; 256]);
}

#[cfg(feature = "accelerator")]
#[test]
fn independent_streams_share_one_forest() {
    let forest = convert(&multiclass_model()).unwrap();
    let rows: Vec<f32> = (0..300).map(|i| (i % 5) as f32 - 2.0).collect();
    let expected = host_infer(&forest, &rows, 3).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let forest = forest.clone();
            let rows = rows.clone();
            std::thread::spawn(move || {
                let stream = Stream::new(Device::Accelerator).unwrap();
                let input = Buffer::from_slice(&rows, Device::Accelerator).unwrap();
                let out = infer(
                    &forest,
                    &input,
                    100,
                    3,
                    &InferenceConfig::default(),
                    Device::Accelerator,
                    Some(&stream),
                )
                .unwrap();
                stream.synchronize().unwrap();
                out.to_vec()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[cfg(not(feature = "accelerator"))]
#[test]
fn accelerator_requests_fail_uniformly() {
    let forest = convert(&SourceModel::regression(1, constant_trees(1, 1.0))).unwrap();
    let input = Buffer::from_vec(vec![0.0f32]);

    let unsupported = |err: Error| matches!(err, Error::UnsupportedDevice(_));
    assert!(unsupported(
        infer(&forest, &input, 1, 1, &InferenceConfig::default(), Device::Accelerator, None).unwrap_err()
    ));
    assert!(Stream::new(Device::Accelerator).is_err());
    assert!(Buffer::<f32>::zeroed(1, Device::Accelerator).is_err());
    assert!(input.to_device(Device::Accelerator).is_err());

    // The host path is unaffected.
    assert_eq!(host_infer(&forest, &[0.0], 1).unwrap(), vec![1.0]);
}
