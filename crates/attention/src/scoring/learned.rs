//! Scoring functions carrying trainable parameters.
//!
//! Parameters are sized by the per-head dimension so that the same function is
//! shared by every head.

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{checks, LinearInit};

use super::{DotProduct, ScoringFunction, ScoringKind};

fn untranspose(key_t: &Tensor) -> Result<Tensor> {
    key_t.transpose(2, 3)?.contiguous()
}

fn expect_dims(name: &str, tensor: &Tensor, dims: &[usize]) -> Result<()> {
    checks::expect_shape(name, tensor, dims)?;
    checks::expect_dtype_in(name, tensor, &checks::FLOAT_DTYPES)
}

/// `q · W · kᵀ + b`.
#[derive(Debug, Clone)]
pub struct Bilinear {
    weight_matrix: Tensor,
    bias: Tensor,
}

impl Bilinear {
    pub fn new(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let weight_matrix = LinearInit::XavierUniform.sample((dim, dim), device, dtype)?;
        let bias = Tensor::zeros(1, dtype, device)?;
        Ok(Self {
            weight_matrix,
            bias,
        })
    }

    pub fn from_parts(dim: usize, weight_matrix: Tensor, bias: Tensor) -> Result<Self> {
        expect_dims("attn.weight_matrix", &weight_matrix, &[dim, dim])?;
        expect_dims("attn.bias", &bias, &[1])?;
        Ok(Self {
            weight_matrix,
            bias,
        })
    }
}

impl ScoringFunction for Bilinear {
    fn kind(&self) -> ScoringKind {
        ScoringKind::Bilinear
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> Result<Tensor> {
        let projected = query.contiguous()?.broadcast_matmul(&self.weight_matrix)?;
        DotProduct
            .score(&projected, key_t)?
            .broadcast_add(&self.bias)
    }

    fn named_parameters(&self) -> Vec<(&'static str, Tensor)> {
        vec![
            ("weight_matrix", self.weight_matrix.clone()),
            ("bias", self.bias.clone()),
        ]
    }
}

/// `vᵀ · tanh(W·q + U·k)` evaluated for every query/key pair.
#[derive(Debug, Clone)]
pub struct Additive {
    w_matrix: Tensor,
    u_matrix: Tensor,
    v_vector: Tensor,
}

impl Additive {
    pub fn new(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let init = LinearInit::XavierUniform;
        Ok(Self {
            w_matrix: init.sample((dim, dim), device, dtype)?,
            u_matrix: init.sample((dim, dim), device, dtype)?,
            v_vector: init.sample((dim, 1), device, dtype)?,
        })
    }

    pub fn from_parts(dim: usize, w_matrix: Tensor, u_matrix: Tensor, v_vector: Tensor) -> Result<Self> {
        expect_dims("attn.w_matrix", &w_matrix, &[dim, dim])?;
        expect_dims("attn.u_matrix", &u_matrix, &[dim, dim])?;
        expect_dims("attn.v_vector", &v_vector, &[dim, 1])?;
        Ok(Self {
            w_matrix,
            u_matrix,
            v_vector,
        })
    }
}

impl ScoringFunction for Additive {
    fn kind(&self) -> ScoringKind {
        ScoringKind::Additive
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> Result<Tensor> {
        let key = untranspose(key_t)?;
        // [b, h, q, 1, d] + [b, h, 1, k, d] -> [b, h, q, k, d]
        let q_part = query.contiguous()?.broadcast_matmul(&self.w_matrix)?.unsqueeze(3)?;
        let k_part = key.broadcast_matmul(&self.u_matrix)?.unsqueeze(2)?;
        let hidden = q_part.broadcast_add(&k_part)?.tanh()?;
        let v = self.v_vector.squeeze(1)?;
        hidden.broadcast_mul(&v)?.sum(4)
    }

    fn named_parameters(&self) -> Vec<(&'static str, Tensor)> {
        vec![
            ("w_matrix", self.w_matrix.clone()),
            ("u_matrix", self.u_matrix.clone()),
            ("v_vector", self.v_vector.clone()),
        ]
    }
}

/// `w_q · q + w_k · k + b` evaluated for every query/key pair.
#[derive(Debug, Clone)]
pub struct LinearScore {
    weight_vector: Tensor,
    bias: Tensor,
}

impl LinearScore {
    pub fn new(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let std = (6.0f64 / (2 * dim + 1) as f64).sqrt() as f32;
        let weight_vector = Tensor::rand(-std, std, 2 * dim, device)?.to_dtype(dtype)?;
        let bias = Tensor::zeros(1, dtype, device)?;
        Ok(Self {
            weight_vector,
            bias,
        })
    }

    pub fn from_parts(dim: usize, weight_vector: Tensor, bias: Tensor) -> Result<Self> {
        expect_dims("attn.weight_vector", &weight_vector, &[2 * dim])?;
        expect_dims("attn.bias", &bias, &[1])?;
        Ok(Self {
            weight_vector,
            bias,
        })
    }
}

impl ScoringFunction for LinearScore {
    fn kind(&self) -> ScoringKind {
        ScoringKind::Linear
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> Result<Tensor> {
        let dim = self.weight_vector.dim(0)? / 2;
        if query.dims().last() != Some(&dim) {
            bail!("linear scoring expects head_dim {dim}, got {:?}", query.dims());
        }
        let w_query = self.weight_vector.narrow(0, 0, dim)?.unsqueeze(1)?;
        let w_key = self.weight_vector.narrow(0, dim, dim)?.unsqueeze(1)?;
        // [b, h, q, 1] + [b, h, 1, k]
        let q_part = query.contiguous()?.broadcast_matmul(&w_query)?;
        let k_part = untranspose(key_t)?.broadcast_matmul(&w_key)?.transpose(2, 3)?;
        q_part.broadcast_add(&k_part)?.broadcast_add(&self.bias)
    }

    fn named_parameters(&self) -> Vec<(&'static str, Tensor)> {
        vec![
            ("weight_vector", self.weight_vector.clone()),
            ("bias", self.bias.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_with_identity_matches_dot_product() -> Result<()> {
        let device = Device::Cpu;
        let bilinear = Bilinear::from_parts(
            3,
            Tensor::eye(3, DType::F32, &device)?,
            Tensor::full(0.5f32, 1, &device)?,
        )?;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 2, 3), &device)?;
        let k_t = Tensor::randn(0f32, 1.0, (1, 2, 3, 4), &device)?;
        let expected = DotProduct.score(&q, &k_t)?.affine(1.0, 0.5)?;
        let diff = bilinear
            .score(&q, &k_t)?
            .sub(&expected)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn linear_score_separates_query_and_key_terms() -> Result<()> {
        let device = Device::Cpu;
        // w_q = [1, 0], w_k = [0, 2], b = 1
        let score = LinearScore::from_parts(
            2,
            Tensor::from_vec(vec![1f32, 0.0, 0.0, 2.0], 4, &device)?,
            Tensor::ones(1, DType::F32, &device)?,
        )?;
        let q = Tensor::from_vec(vec![3f32, 9.0], (1, 1, 1, 2), &device)?;
        let k = Tensor::from_vec(vec![7f32, 1.0, 7.0, 5.0], (1, 1, 2, 2), &device)?;
        let out = score.score(&q, &k.transpose(2, 3)?)?;
        assert_eq!(out.dims(), &[1, 1, 1, 2]);
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![6.0, 14.0]);
        Ok(())
    }

    #[test]
    fn additive_matches_manual_pairwise_evaluation() -> Result<()> {
        let device = Device::Cpu;
        let additive = Additive::from_parts(
            1,
            Tensor::full(2f32, (1, 1), &device)?,
            Tensor::full(-1f32, (1, 1), &device)?,
            Tensor::full(3f32, (1, 1), &device)?,
        )?;
        let q = Tensor::from_vec(vec![0.5f32, -0.25], (1, 1, 2, 1), &device)?;
        let k_t = Tensor::from_vec(vec![0.1f32, 0.7, -0.3], (1, 1, 1, 3), &device)?;
        let out = additive.score(&q, &k_t)?.flatten_all()?.to_vec1::<f32>()?;
        let mut expected = Vec::new();
        for qi in [0.5f32, -0.25] {
            for kj in [0.1f32, 0.7, -0.3] {
                expected.push(3.0 * (2.0 * qi - kj).tanh());
            }
        }
        for (got, want) in out.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
        Ok(())
    }

    #[test]
    fn from_parts_validates_shapes() -> Result<()> {
        let device = Device::Cpu;
        let bad = Tensor::zeros((2, 3), DType::F32, &device)?;
        let bias = Tensor::zeros(1, DType::F32, &device)?;
        assert!(Bilinear::from_parts(3, bad, bias).is_err());
        Ok(())
    }
}
