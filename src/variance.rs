use crate::error::VarianceError;
use crate::gpu::GpuVariance;
use crate::tensor::Tensor;
use log::debug;
use serde::{Deserialize, Serialize};

/// Options of the variance metric, bound once and reused across calls.
/// Also serves as the `metric` section of the YAML parameter file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VarianceConfig {
    #[serde(default = "true_default")]
    pub include_background: bool,
    #[serde(default = "false_default")]
    pub spatial_map: bool,
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl Default for VarianceConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

fn true_default() -> bool {
    true
}
fn false_default() -> bool {
    false
}

/// Variance across an ensemble of predictions for the same input.
///
/// `y_pred` is a (members, channels, spatial...) stack of predictions,
/// e.g. repeated Monte-Carlo inference runs over one image. The variance
/// is taken along the member axis only, with the population formula
/// (divide by N): member counts are small and no unbiased correction is
/// applied.
///
/// * `include_background=false` drops channel 0 (the conventional
///   background class) before the reduction; the output then has one
///   class less than the input.
/// * `spatial_map=true` returns the full (channels, spatial...) variance
///   map; otherwise the map is averaged into one value per class, shape
///   (channels, 1).
/// * `threshold`, when set, floors every prediction at the given value
///   before any reduction. Near-zero probabilities are raised to the
///   threshold, values at or above it pass through unchanged.
pub fn compute_variance(
    y_pred: &Tensor,
    include_background: bool,
    spatial_map: bool,
    threshold: Option<f64>,
) -> Result<Tensor, VarianceError> {
    validate(y_pred, include_background, threshold)?;

    let mut work = match threshold {
        Some(floor) => y_pred.clamp_min(floor),
        None => y_pred.clone(),
    };
    if !include_background {
        work = work.drop_channel(0)?;
    }

    let variance = work.ensemble_variance()?;
    debug!(
        "variance over {} members: map shape {:?}",
        y_pred.shape()[0],
        variance.shape()
    );

    if spatial_map && variance.ndim() >= 2 {
        Ok(variance)
    } else {
        Ok(variance.leading_axis_means())
    }
}

fn validate(
    y_pred: &Tensor,
    include_background: bool,
    threshold: Option<f64>,
) -> Result<(), VarianceError> {
    if y_pred.ndim() < 2 {
        return Err(VarianceError::MissingAxes(y_pred.shape().to_vec()));
    }
    if y_pred.shape()[0] == 0 {
        return Err(VarianceError::EmptyEnsemble);
    }
    if let Some(floor) = threshold {
        if floor < 0.0 {
            return Err(VarianceError::NegativeThreshold(floor));
        }
    }
    if !include_background && y_pred.shape()[1] < 2 {
        return Err(VarianceError::BackgroundOnly(y_pred.shape()[1]));
    }
    Ok(())
}

/// Thin stateful wrapper: binds the configuration at construction, then
/// computes independently on every call. No state survives between calls.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceMetric {
    config: VarianceConfig,
}

impl VarianceMetric {
    pub fn new(include_background: bool, spatial_map: bool, threshold: Option<f64>) -> Self {
        VarianceMetric {
            config: VarianceConfig {
                include_background,
                spatial_map,
                threshold,
            },
        }
    }

    pub fn from_config(config: &VarianceConfig) -> Self {
        VarianceMetric {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &VarianceConfig {
        &self.config
    }

    pub fn compute(&self, y_pred: &Tensor) -> Result<Tensor, VarianceError> {
        compute_variance(
            y_pred,
            self.config.include_background,
            self.config.spatial_map,
            self.config.threshold,
        )
    }

    /// Same contract as [`compute`](Self::compute), with the member-axis
    /// reduction dispatched to the GPU. The device works in f32, so
    /// results can differ from the CPU path in the order of 1e-7.
    pub fn compute_with_gpu(
        &self,
        y_pred: &Tensor,
        assay: &GpuVariance,
    ) -> Result<Tensor, VarianceError> {
        validate(y_pred, self.config.include_background, self.config.threshold)?;

        let work = if self.config.include_background {
            y_pred.clone()
        } else {
            y_pred.drop_channel(0)?
        };

        let members = work.shape()[0];
        let positions = work.len() / members;
        let uploaded: Vec<f32> = work.values().iter().map(|&v| v as f32).collect();
        let map = assay.ensemble_variance(
            &uploaded,
            members,
            positions,
            self.config.threshold.map(|t| t as f32),
        );

        let variance = Tensor::new(
            map.into_iter().map(f64::from).collect(),
            work.shape()[1..].to_vec(),
        )?;

        if self.config.spatial_map && variance.ndim() >= 2 {
            Ok(variance)
        } else {
            Ok(variance.leading_axis_means())
        }
    }
}

// unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn assert_close(actual: &Tensor, expected: &[f64], tol: f64) {
        assert_eq!(actual.values().len(), expected.len());
        for (a, e) in actual.values().iter().zip(expected) {
            assert!(
                (a - e).abs() < tol,
                "expected {:?}, got {:?}",
                expected,
                actual.values()
            );
        }
    }

    #[test]
    fn test_constant_ensemble_1d() {
        let t = Tensor::from_elem(1.0, vec![3, 1, 3]);
        let out = compute_variance(&t, true, false, None).unwrap();
        assert_eq!(out.shape(), &[1, 1]);
        assert_close(&out, &[0.0], 1e-12);
    }

    #[test]
    fn test_constant_ensemble_2d() {
        let t = Tensor::from_elem(1.0, vec![1, 1, 2, 2]);
        let out = compute_variance(&t, true, false, None).unwrap();
        assert_eq!(out.shape(), &[1, 1]);
        assert_close(&out, &[0.0], 1e-12);
    }

    #[test]
    fn test_background_channel_is_dropped() {
        // channel 0 varies across members, channel 1 is constant
        let t = Tensor::new(
            vec![
                1.0, 2.0, 3.0, 1.0, 1.0, 1.0, //
                4.0, 5.0, 6.0, 1.0, 1.0, 1.0, //
                7.0, 8.0, 9.0, 1.0, 1.0, 1.0,
            ],
            vec![3, 2, 3],
        )
        .unwrap();
        let out = compute_variance(&t, false, false, None).unwrap();
        assert_eq!(out.shape(), &[1, 1]);
        assert_close(&out, &[0.0], 1e-12);
    }

    #[test]
    fn test_spatial_map_2d() {
        let t = Tensor::from_elem(1.0, vec![1, 1, 2, 2]);
        let out = compute_variance(&t, true, true, None).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_close(&out, &[0.0; 4], 1e-12);
    }

    #[test]
    fn test_spatial_map_3d() {
        let t = Tensor::from_elem(1.0, vec![1, 1, 2, 2, 2]);
        let out = compute_variance(&t, true, true, None).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        assert_close(&out, &[0.0; 8], 1e-12);
    }

    #[test]
    fn test_threshold_reference_value() {
        // 4 members, background channel varying, data channel flipping
        // between 0 and 1 at the last location. Floored at 0.001 the
        // flipping location has population variance (0.999/2)^2 and the
        // class summary is 0.24950025 / 3.
        let t = Tensor::new(
            vec![
                1.0, 2.0, 3.0, 1.0, 1.0, 0.0, //
                4.0, 5.0, 6.0, 1.0, 1.0, 1.0, //
                7.0, 8.0, 9.0, 1.0, 1.0, 0.0, //
                1.0, 2.0, 3.0, 1.0, 1.0, 1.0,
            ],
            vec![4, 2, 3],
        )
        .unwrap();
        let out = compute_variance(&t, false, false, Some(0.001)).unwrap();
        assert_eq!(out.shape(), &[1, 1]);
        assert_close(&out, &[0.083167], 1e-4);
        assert!((out.values()[0] - 0.083_166_75).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_noop_when_all_values_above() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let values: Vec<f64> = (0..4 * 2 * 6).map(|_| rng.gen_range(0.1..1.0)).collect();
        let t = Tensor::new(values, vec![4, 2, 6]).unwrap();
        let with = compute_variance(&t, true, false, Some(0.05)).unwrap();
        let without = compute_variance(&t, true, false, None).unwrap();
        assert_close(&with, without.values(), 1e-12);
    }

    #[test]
    fn test_spatial_and_scalar_modes_agree() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let values: Vec<f64> = (0..5 * 3 * 4 * 4).map(|_| rng.gen::<f64>()).collect();
        let t = Tensor::new(values, vec![5, 3, 4, 4]).unwrap();

        let map = compute_variance(&t, true, true, None).unwrap();
        let scalar = compute_variance(&t, true, false, None).unwrap();

        let collapsed = map.leading_axis_means();
        assert_close(&scalar, collapsed.values(), 1e-12);
    }

    #[test]
    fn test_single_member_variance_is_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let values: Vec<f64> = (0..2 * 9).map(|_| rng.gen::<f64>()).collect();
        let t = Tensor::new(values, vec![1, 2, 9]).unwrap();
        let out = compute_variance(&t, true, true, None).unwrap();
        assert!(out.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_background_drop_reduces_class_count() {
        let t = Tensor::from_elem(0.5, vec![2, 4, 3, 3]);
        let kept = compute_variance(&t, true, false, None).unwrap();
        let dropped = compute_variance(&t, false, false, None).unwrap();
        assert_eq!(kept.shape(), &[4, 1]);
        assert_eq!(dropped.shape(), &[3, 1]);
    }

    #[test]
    fn test_single_channel_background_error() {
        let t = Tensor::from_elem(1.0, vec![3, 1, 3]);
        let err = compute_variance(&t, false, false, None).unwrap_err();
        assert_eq!(err, VarianceError::BackgroundOnly(1));
    }

    #[test]
    fn test_missing_axes_error() {
        let t = Tensor::from_elem(1.0, vec![3]);
        let err = compute_variance(&t, true, false, None).unwrap_err();
        assert_eq!(err, VarianceError::MissingAxes(vec![3]));
    }

    #[test]
    fn test_negative_threshold_error() {
        let t = Tensor::from_elem(1.0, vec![3, 1, 3]);
        let err = compute_variance(&t, true, false, Some(-0.5)).unwrap_err();
        assert_eq!(err, VarianceError::NegativeThreshold(-0.5));
    }

    #[test]
    fn test_degenerate_no_spatial_axis() {
        // (N, C) input: both modes collapse to (C, 1)
        let t = Tensor::new(vec![0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0], vec![4, 2]).unwrap();
        let scalar = compute_variance(&t, true, false, None).unwrap();
        let map = compute_variance(&t, true, true, None).unwrap();
        assert_eq!(scalar.shape(), &[2, 1]);
        assert_eq!(map.shape(), &[2, 1]);
        assert_close(&scalar, &[0.25, 0.0], 1e-12);
        assert_close(&map, &[0.25, 0.0], 1e-12);
    }

    #[test]
    fn test_metric_wrapper_matches_function() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let values: Vec<f64> = (0..6 * 3 * 8).map(|_| rng.gen::<f64>()).collect();
        let t = Tensor::new(values, vec![6, 3, 8]).unwrap();

        let metric = VarianceMetric::new(false, false, Some(0.01));
        let from_metric = metric.compute(&t).unwrap();
        let from_function = compute_variance(&t, false, false, Some(0.01)).unwrap();
        assert_eq!(from_metric, from_function);
    }

    #[test]
    fn test_metric_from_config_defaults() {
        let metric = VarianceMetric::from_config(&VarianceConfig::default());
        assert!(metric.config().include_background);
        assert!(!metric.config().spatial_map);
        assert!(metric.config().threshold.is_none());
    }
}
