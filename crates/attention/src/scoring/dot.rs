//! Parameter-free scoring functions built on the dot product.

use candle_core::{DType, Result, Tensor, D};

use super::{ScoringFunction, ScoringKind};

/// Plain `q · kᵀ`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProduct;

impl ScoringFunction for DotProduct {
    fn kind(&self) -> ScoringKind {
        ScoringKind::DotProduct
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> Result<Tensor> {
        query.contiguous()?.matmul(&key_t.contiguous()?)
    }
}

/// `q · kᵀ / sqrt(scaling_factor)`.
#[derive(Debug, Clone, Copy)]
pub struct ScaledDotProduct {
    scaling_factor: usize,
}

impl ScaledDotProduct {
    pub fn new(scaling_factor: usize) -> Self {
        Self { scaling_factor }
    }

    pub fn scaling_factor(&self) -> usize {
        self.scaling_factor
    }
}

impl ScoringFunction for ScaledDotProduct {
    fn kind(&self) -> ScoringKind {
        ScoringKind::ScaledDotProduct
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> Result<Tensor> {
        let scores = DotProduct.score(query, key_t)?;
        if self.scaling_factor == 1 {
            return Ok(scores);
        }
        scores.affine(1.0 / (self.scaling_factor as f64).sqrt(), 0.0)
    }
}

/// Dot product of L2-normalised queries and keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Cosine {
    fn tiny_value(dtype: DType) -> f64 {
        match dtype {
            DType::F16 | DType::BF16 => 1e-4,
            _ => 1e-13,
        }
    }

    fn normalize(tensor: &Tensor, dim: D) -> Result<Tensor> {
        let norm = tensor
            .sqr()?
            .sum_keepdim(dim)?
            .sqrt()?
            .affine(1.0, Self::tiny_value(tensor.dtype()))?;
        tensor.broadcast_div(&norm)
    }
}

impl ScoringFunction for Cosine {
    fn kind(&self) -> ScoringKind {
        ScoringKind::Cosine
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> Result<Tensor> {
        // Keys arrive transposed, so their feature axis is the second to last.
        let query = Self::normalize(query, D::Minus1)?;
        let key_t = Self::normalize(key_t, D::Minus2)?;
        DotProduct.score(&query, &key_t)
    }
}
