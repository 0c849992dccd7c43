use crate::error::VarianceError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// A dense row-major tensor of f64 values.
///
/// Prediction ensembles are laid out as (members, channels, spatial...),
/// so the value at (n, c, s) lives at `n * channels * spatial + c * spatial + s`.
/// The struct is deliberately small: it only carries the operations the
/// variance metric needs (channel removal, elementwise floor, reductions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    values: Vec<f64>,
    shape: Vec<usize>,
}

impl Tensor {
    /// Build a tensor, checking that the shape covers the value count.
    pub fn new(values: Vec<f64>, shape: Vec<usize>) -> Result<Tensor, VarianceError> {
        if shape.is_empty() {
            return Err(VarianceError::MissingAxes(shape));
        }
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(VarianceError::ValueCount {
                shape,
                expected,
                found: values.len(),
            });
        }
        Ok(Tensor { values, shape })
    }

    /// A tensor filled with a single value.
    pub fn from_elem(value: f64, shape: Vec<usize>) -> Tensor {
        let len = shape.iter().product();
        Tensor {
            values: vec![value; len],
            shape,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove one index along the channel axis (axis 1).
    pub fn drop_channel(&self, channel: usize) -> Result<Tensor, VarianceError> {
        if self.ndim() < 2 {
            return Err(VarianceError::MissingAxes(self.shape.clone()));
        }
        let channels = self.shape[1];
        if channel >= channels {
            return Err(VarianceError::ChannelOutOfRange { channel, channels });
        }
        let members = self.shape[0];
        let spatial: usize = self.shape[2..].iter().product();

        let mut values = Vec::with_capacity(members * (channels - 1) * spatial);
        for n in 0..members {
            for c in 0..channels {
                if c == channel {
                    continue;
                }
                let start = (n * channels + c) * spatial;
                values.extend_from_slice(&self.values[start..start + spatial]);
            }
        }
        let mut shape = self.shape.clone();
        shape[1] = channels - 1;
        Ok(Tensor { values, shape })
    }

    /// Elementwise floor: every value below `floor` is raised to `floor`,
    /// values at or above it are left untouched.
    pub fn clamp_min(&self, floor: f64) -> Tensor {
        let values = self
            .values
            .iter()
            .map(|&v| if v < floor { floor } else { v })
            .collect();
        Tensor {
            values,
            shape: self.shape.clone(),
        }
    }

    /// Population variance along axis 0, one value per remaining position.
    /// For a (N, C, spatial...) input the result has shape (C, spatial...).
    pub fn ensemble_variance(&self) -> Result<Tensor, VarianceError> {
        if self.ndim() < 2 {
            return Err(VarianceError::MissingAxes(self.shape.clone()));
        }
        let members = self.shape[0];
        if members == 0 {
            return Err(VarianceError::EmptyEnsemble);
        }
        let positions = self.values.len() / members;
        let values: Vec<f64> = (0..positions)
            .into_par_iter()
            .map(|j| {
                (0..members)
                    .map(|n| self.values[n * positions + j])
                    .population_variance()
            })
            .collect();
        Ok(Tensor {
            values,
            shape: self.shape[1..].to_vec(),
        })
    }

    /// Mean over every axis but the first, per leading index.
    /// Collapses a (C, spatial...) map to a (C, 1) summary.
    pub fn leading_axis_means(&self) -> Tensor {
        let leading = self.shape[0];
        let rest = if leading == 0 {
            0
        } else {
            self.values.len() / leading
        };
        let values: Vec<f64> = (0..leading)
            .map(|c| self.values[c * rest..(c + 1) * rest].iter().mean())
            .collect();
        Tensor {
            values,
            shape: vec![leading, 1],
        }
    }
}
