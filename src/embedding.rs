//! Reduction of a `[1, C, H, W]` feature map to a length-`C` embedding.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayView4, ArrayViewD, Axis, Ix4};

use crate::error::{EmbeddingError, Result};

/// One scalar per channel of the model's output feature map.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    pub fn stats(&self) -> EmbeddingStats {
        EmbeddingStats::of(&self.0)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Spatial reduction applied per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pooling {
    #[default]
    Average,
    Max,
    /// Value at the spatial cell nearest the geometric center.
    Center,
}

impl Pooling {
    pub const ALL: [Pooling; 3] = [Pooling::Average, Pooling::Max, Pooling::Center];
}

impl fmt::Display for Pooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pooling::Average => "average",
            Pooling::Max => "max",
            Pooling::Center => "center",
        };
        f.write_str(name)
    }
}

impl FromStr for Pooling {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" | "avg" | "mean" => Ok(Pooling::Average),
            "max" => Ok(Pooling::Max),
            "center" => Ok(Pooling::Center),
            other => Err(EmbeddingError::invalid_config(format!(
                "unknown pooling strategy: {other}"
            ))),
        }
    }
}

/// Checks the output is rank 4 and reduces it with `pooling`.
pub fn extract_embedding(tensor: ArrayViewD<'_, f32>, pooling: Pooling) -> Result<Embedding> {
    let shape = tensor.shape().to_vec();
    let tensor = tensor
        .into_dimensionality::<Ix4>()
        .map_err(|_| EmbeddingError::shape(format!("expected a rank-4 tensor, got shape {shape:?}")))?;

    match pooling {
        Pooling::Average => global_average_pool(tensor),
        Pooling::Max => global_max_pool(tensor),
        Pooling::Center => center_point(tensor),
    }
}

/// Mean over `H x W` for each channel of batch entry 0.
pub fn global_average_pool(tensor: ArrayView4<'_, f32>) -> Result<Embedding> {
    let first = first_batch(&tensor)?;
    let spatial = (first.len_of(Axis(1)) * first.len_of(Axis(2))) as f64;

    // f64 accumulation keeps constant maps exact
    let values = first
        .outer_iter()
        .map(|channel| {
            let sum = channel.fold(0.0_f64, |acc, &v| acc + f64::from(v));
            (sum / spatial) as f32
        })
        .collect();
    Ok(Embedding(values))
}

/// Maximum over `H x W` for each channel of batch entry 0.
pub fn global_max_pool(tensor: ArrayView4<'_, f32>) -> Result<Embedding> {
    let first = first_batch(&tensor)?;

    let values = first
        .outer_iter()
        .map(|channel| channel.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)))
        .collect();
    Ok(Embedding(values))
}

/// Value at `(H / 2, W / 2)` for each channel of batch entry 0.
pub fn center_point(tensor: ArrayView4<'_, f32>) -> Result<Embedding> {
    let first = first_batch(&tensor)?;
    let (cy, cx) = (first.len_of(Axis(1)) / 2, first.len_of(Axis(2)) / 2);

    let values = first
        .outer_iter()
        .map(|channel| channel[[cy, cx]])
        .collect();
    Ok(Embedding(values))
}

fn first_batch<'a>(tensor: &ArrayView4<'a, f32>) -> Result<ndarray::ArrayView3<'a, f32>> {
    if tensor.shape().contains(&0) {
        return Err(EmbeddingError::shape(format!(
            "output tensor has an empty dimension: {:?}",
            tensor.shape()
        )));
    }
    Ok(tensor.clone().index_axis_move(Axis(0), 0))
}

/// Summary statistics used when printing tensors and embeddings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbeddingStats {
    pub len: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub non_zero: usize,
}

impl EmbeddingStats {
    pub fn of(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self {
                len: 0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                non_zero: 0,
            };
        }

        let (min, max, sum, non_zero) = values.iter().fold(
            (f32::INFINITY, f32::NEG_INFINITY, 0.0_f64, 0_usize),
            |(min, max, sum, nz), &v| {
                (min.min(v), max.max(v), sum + f64::from(v), nz + usize::from(v != 0.0))
            },
        );

        Self {
            len: values.len(),
            min,
            max,
            mean: (sum / values.len() as f64) as f32,
            non_zero,
        }
    }
}

impl fmt::Display for EmbeddingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dim: {}, range: [{:.4}, {:.4}], mean: {:.4}, non-zero: {}/{}",
            self.len, self.min, self.max, self.mean, self.non_zero, self.len
        )
    }
}
