//! Quantisation primitives: STE, dorefa, BWN, and gradient calibration.
//!
//! Every quantized layer delegates to these functions for the forward-pass
//! quantisation and for the calibration that maps a gradient on the quantized
//! weight back onto the latent full-precision weight.
//!
//! All STE helpers follow one pattern: `q.detach() + (x - x.detach())`. The
//! forward value is `q`; the backward pass sees the identity w.r.t. `x`. The
//! non-differentiable part (`sign`, `round`) never enters the graph.

use candle_core::{DType, Result, Tensor, D};

use metaquant_common::QuantScheme;

/// Lower bound for normalisers (`max|tanh(w)|`, `mean|w|`).
const EPS: f32 = 1e-8;

// ── STE primitives ──────────────────────────────────────────────────────────

/// Attach `x`'s gradient path to the (detached) value `q`.
#[inline]
fn ste(q: &Tensor, x: &Tensor) -> Result<Tensor> {
    let residual = (x - &x.detach())?;
    q.detach() + residual
}

/// Hard STE sign: forward `sign(x)`, backward identity.
#[inline]
pub fn ste_sign(x: &Tensor) -> Result<Tensor> {
    ste(&x.detach().sign()?, x)
}

/// k-bit uniform quantisation of `x ∈ [0, 1]` with STE.
///
/// `bits >= 32` is the identity.
pub fn ste_quantize_k(x: &Tensor, bits: u32) -> Result<Tensor> {
    if bits >= 32 {
        return Ok(x.clone());
    }
    let levels = ((1u64 << bits) - 1) as f64;
    let q = x.detach().affine(levels, 0.0)?.round()?.affine(1.0 / levels, 0.0)?;
    ste(&q, x)
}

// ── Scalar helpers ──────────────────────────────────────────────────────────

/// `max(|x|)` over every element, detached, floored at `EPS`.
fn max_abs(x: &Tensor) -> Result<f64> {
    let m = x.detach().abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    Ok(m.max(EPS) as f64)
}

/// `mean(|x|)` over every element, detached, floored at `EPS`.
fn mean_abs(x: &Tensor) -> Result<f64> {
    let m = x.detach().abs()?.mean_all()?.to_scalar::<f32>()?;
    Ok(m.max(EPS) as f64)
}

// ── Schemes ─────────────────────────────────────────────────────────────────

/// Output of [`quantize_weight`]: the pre-quantisation tensor (what the
/// meta-network observes as "weight") and the quantized tensor used in the
/// forward pass. Both stay attached to the graph of the input weight.
pub struct Quantized {
    pub pre_quantized: Tensor,
    pub quantized: Tensor,
}

/// dorefa: `pre = tanh(w) / max|tanh(w)| · ½ + ½`, `q = 2·quant_k(pre) − 1`.
pub fn dorefa_quantize(w: &Tensor, bits: u32) -> Result<Quantized> {
    let t = w.tanh()?;
    let scale = max_abs(&t)?;
    let pre_quantized = t.affine(0.5 / scale, 0.5)?;
    let quantized = ste_quantize_k(&pre_quantized, bits)?.affine(2.0, -1.0)?;
    Ok(Quantized {
        pre_quantized,
        quantized,
    })
}

/// BWN: `q = mean|w| · sign(w)` with a layer-wide, detached scale.
pub fn bwn_quantize(w: &Tensor) -> Result<Quantized> {
    let alpha = mean_abs(w)?;
    let quantized = ste_sign(w)?.affine(alpha, 0.0)?;
    Ok(Quantized {
        pre_quantized: w.clone(),
        quantized,
    })
}

/// BWN-F: like [`bwn_quantize`] with one scale per output channel (dim 0).
pub fn bwn_f_quantize(w: &Tensor) -> Result<Quantized> {
    let out = w.dim(0)?;
    let alpha = w
        .detach()
        .abs()?
        .reshape((out, ()))?
        .mean_keepdim(D::Minus1)?
        .clamp(EPS, f32::MAX)?;
    let mut alpha_shape = vec![1usize; w.rank()];
    alpha_shape[0] = out;
    let alpha = alpha.reshape(alpha_shape)?;
    let quantized = ste_sign(w)?.broadcast_mul(&alpha)?;
    Ok(Quantized {
        pre_quantized: w.clone(),
        quantized,
    })
}

/// Quantise `w` under `scheme`.
pub fn quantize_weight(w: &Tensor, scheme: QuantScheme, bits: u32) -> Result<Quantized> {
    match scheme {
        QuantScheme::Dorefa => dorefa_quantize(w, bits),
        QuantScheme::Bwn => bwn_quantize(w),
        QuantScheme::BwnF => bwn_f_quantize(w),
        QuantScheme::FullPrecision => Ok(Quantized {
            pre_quantized: w.clone(),
            quantized: w.clone(),
        }),
    }
}

// ── Calibration ─────────────────────────────────────────────────────────────

/// Chain-rule correction from a gradient on the quantisation surrogate to a
/// gradient on the latent weight.
#[derive(Debug, Clone)]
pub enum Calibration {
    /// Scale-based schemes: exactly 1.0.
    Unit,
    /// Elementwise factor, same shape as the latent weight (detached).
    Tensor(Tensor),
}

impl Calibration {
    /// Compute the calibration for latent weight `w` under `scheme`.
    ///
    /// dorefa: `(1 − tanh(w)²) / max|tanh(w)|`. Everything else: [`Calibration::Unit`].
    pub fn compute(w: &Tensor, scheme: QuantScheme) -> Result<Self> {
        match scheme {
            QuantScheme::Dorefa => {
                let t = w.detach().tanh()?;
                let scale = max_abs(&t)?;
                let deriv = t.sqr()?.affine(-1.0, 1.0)?;
                Ok(Self::Tensor(deriv.affine(1.0 / scale, 0.0)?))
            }
            QuantScheme::Bwn | QuantScheme::BwnF | QuantScheme::FullPrecision => Ok(Self::Unit),
        }
    }

    /// `calibration * grad`. Keeps `grad`'s graph (the meta-network path).
    pub fn apply(&self, grad: &Tensor) -> Result<Tensor> {
        match self {
            Self::Unit => Ok(grad.clone()),
            Self::Tensor(c) => grad.broadcast_mul(c),
        }
    }

    /// Materialise as a tensor of `shape` (ones for [`Calibration::Unit`]).
    pub fn to_tensor(&self, like: &Tensor) -> Result<Tensor> {
        match self {
            Self::Unit => Tensor::ones(like.shape(), DType::F32, like.device()),
            Self::Tensor(c) => Ok(c.clone()),
        }
    }
}

// ── Tensor helpers ──────────────────────────────────────────────────────────

/// Reshape `x` to 2-D, multiply by `w_t`, reshape back.
///
/// Handles arbitrary leading dims: `(.., K) @ (K, N) → (.., N)`.
pub fn matmul_reshape(x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let out_dim = w_t.dim(1)?;
    match dims {
        [_, _] => x.matmul(w_t),
        _ => {
            let last = dims[dims.len() - 1];
            let prod: usize = dims[..dims.len() - 1].iter().product();
            let y = x.reshape((prod, last))?.matmul(w_t)?;
            let mut out_shape: Vec<usize> = dims[..dims.len() - 1].to_vec();
            out_shape.push(out_dim);
            y.reshape(out_shape.as_slice())
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
