//! Meta-quantized linear / convolutional layer.
//!
//! Each layer stores a full-precision latent weight. The forward pass:
//!
//! 1. computes the calibration of the latent weight for the active scheme;
//! 2. if a [`MetaGradRecord`] is supplied, derives the *meta weight*
//!    `w − lr · calibration · meta_grad` (optionally blended with a slow
//!    record at decay [`MOMENTUM_DECAY`]). The record's tensor is still
//!    attached to the meta-network graph, so the primary loss backpropagates
//!    into the meta-network through this subtraction;
//! 3. quantises the meta weight;
//! 4. adds a zero-valued tap variable to the quantized weight and keeps it in
//!    a [`GradCapture`]. Candle only keeps gradients of variables, so the
//!    tap's gradient is how the backward driver exposes `dL/dq` to the layer
//!    ([`MetaQuantLayer::capture_grads`]);
//! 5. runs `linear` or `conv2d` with the quantized weight.
//!
//! # Thread safety
//!
//! Per-step transient fields live behind a [`parking_lot::Mutex`], so forward
//! and capture take `&self` and layers are `Send + Sync`.

use std::collections::HashMap;

use candle_core::{backprop::GradStore, bail, Result, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use parking_lot::Mutex;

use metaquant_common::QuantScheme;

use crate::quantize::{matmul_reshape, quantize_weight, Calibration};

/// Fixed decay of the slow (momentum) blend in the meta-weight update.
pub const MOMENTUM_DECAY: f64 = 0.9;

/// Init stdev of the second LoRA factor. Kept non-zero so its dorefa
/// calibration (`1 / max|tanh(B)|`) stays finite.
const LORA_B_STDEV: f64 = 0.02;

// ── Meta-gradient records ───────────────────────────────────────────────────

/// Transformed gradient for one layer's trainable weight.
#[derive(Debug, Clone)]
pub enum LayerGrad {
    /// Same shape as the latent weight.
    Dense(Tensor),
    /// One gradient per LoRA factor.
    LowRank { a: Tensor, b: Tensor },
}

impl LayerGrad {
    pub fn detach(&self) -> Self {
        match self {
            Self::Dense(g) => Self::Dense(g.detach()),
            Self::LowRank { a, b } => Self::LowRank {
                a: a.detach(),
                b: b.detach(),
            },
        }
    }

    pub fn dense(&self) -> Option<&Tensor> {
        match self {
            Self::Dense(g) => Some(g),
            Self::LowRank { .. } => None,
        }
    }

    pub fn low_rank(&self) -> Option<(&Tensor, &Tensor)> {
        match self {
            Self::Dense(_) => None,
            Self::LowRank { a, b } => Some((a, b)),
        }
    }
}

/// `(layer index, transformed weight gradient, bias gradient or none)`.
#[derive(Debug, Clone)]
pub struct MetaGradRecord {
    pub layer_idx: usize,
    pub weight_grad: LayerGrad,
    pub bias_grad: Option<Tensor>,
}

impl MetaGradRecord {
    /// Copy cut from every graph (used for slow/momentum records).
    pub fn detach(&self) -> Self {
        Self {
            layer_idx: self.layer_idx,
            weight_grad: self.weight_grad.detach(),
            bias_grad: self.bias_grad.as_ref().map(Tensor::detach),
        }
    }
}

/// Layer name → record. Produced fresh every step.
pub type MetaGradMap = HashMap<String, MetaGradRecord>;

/// Detached copy of a whole map.
pub fn detach_map(map: &MetaGradMap) -> MetaGradMap {
    map.iter().map(|(k, v)| (k.clone(), v.detach())).collect()
}

// ── Layer configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
}

impl ConvParams {
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel_size,
            stride,
            padding,
            dilation: 1,
            groups: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Linear,
    Conv2d(ConvParams),
}

/// Per-call arguments of [`MetaQuantLayer::forward`].
#[derive(Debug, Clone, Copy)]
pub struct LayerArgs<'a> {
    pub scheme: QuantScheme,
    pub meta_grad: Option<&'a MetaGradRecord>,
    pub slow_grad: Option<&'a MetaGradRecord>,
    pub lr: f64,
}

impl<'a> LayerArgs<'a> {
    /// No meta-gradient: the meta weight is the latent weight.
    pub fn plain(scheme: QuantScheme) -> Self {
        Self {
            scheme,
            meta_grad: None,
            slow_grad: None,
            lr: 0.0,
        }
    }
}

/// Low-rank factors `A (rows × r)`, `B (r × cols)` with `rows · cols` equal to
/// the weight's element count.
struct LoraFactors {
    a: Tensor,
    b: Tensor,
}

/// Zero-valued variable added to the quantized weight of one forward pass.
/// It is not part of any `VarMap`; its gradient equals `dL/dq`.
#[derive(Debug, Clone)]
pub struct GradCapture {
    tap: Var,
}

impl GradCapture {
    fn new(quantized: &Tensor) -> Result<Self> {
        let tap = Var::zeros(quantized.dims(), quantized.dtype(), quantized.device())?;
        Ok(Self { tap })
    }

    /// `quantized + tap`: numerically the quantized weight.
    fn attach(&self, quantized: &Tensor) -> Result<Tensor> {
        quantized + self.tap.as_tensor()
    }
}

#[derive(Default)]
struct LayerState {
    calibration: Option<Calibration>,
    lora_calibration: Option<(Calibration, Calibration)>,
    pre_quantized_weight: Option<Tensor>,
    quantized_weight: Option<Tensor>,
    lora_snapshot: Option<(Tensor, Tensor)>,
    capture: Option<GradCapture>,
    quantized_grads: Option<Tensor>,
    bias_grad: Option<Tensor>,
    lora_grads: Option<(Tensor, Tensor)>,
    pre_quantized_grads: Option<LayerGrad>,
}

/// One gradient signal the meta-network transforms: a raw gradient and the
/// weight it belongs to. Dense layers yield one slot, LoRA layers two.
#[derive(Debug, Clone)]
pub struct GradSlot {
    /// Appended to the layer name to key per-slot recurrent state.
    pub suffix: Option<&'static str>,
    pub grad: Tensor,
    pub weight: Tensor,
}

/// Everything the orchestrator reads from a layer after a backward pass.
#[derive(Debug, Clone)]
pub struct LayerObservation {
    pub slots: Vec<GradSlot>,
    pub bias_grad: Option<Tensor>,
}

// ── MetaQuantLayer ──────────────────────────────────────────────────────────

pub struct MetaQuantLayer {
    name: String,
    index: usize,
    kind: LayerKind,
    weight: Tensor,
    bias: Option<Tensor>,
    lora: Option<LoraFactors>,
    bit_w: u32,
    state: Mutex<LayerState>,
}

impl MetaQuantLayer {
    /// Quantized fully-connected layer, weight `(out, in)`.
    #[allow(clippy::too_many_arguments)]
    pub fn linear(
        name: &str,
        index: usize,
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        bit_w: u32,
        lora_rank: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = (2.0 / ((in_dim * out_dim) as f64).sqrt()).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
        let bias = if bias {
            Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.))?)
        } else {
            None
        };
        let lora = match lora_rank {
            Some(r) => Some(LoraFactors::new(out_dim, in_dim, r, vb.pp("lora"))?),
            None => None,
        };
        Ok(Self::assemble(
            name,
            index,
            LayerKind::Linear,
            weight,
            bias,
            lora,
            bit_w,
        ))
    }

    /// Quantized 2-D convolution, weight `(out, in / groups, k, k)`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        name: &str,
        index: usize,
        in_channels: usize,
        out_channels: usize,
        params: ConvParams,
        bias: bool,
        bit_w: u32,
        lora_rank: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let k = params.kernel_size;
        let in_per_group = in_channels / params.groups;
        let bound = (2.0 / ((k * k * out_channels) as f64).sqrt()).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb.get_with_hints((out_channels, in_per_group, k, k), "weight", init)?;
        let bias = if bias {
            Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.))?)
        } else {
            None
        };
        let lora = match lora_rank {
            Some(r) => Some(LoraFactors::new(
                out_channels * k,
                in_per_group * k,
                r,
                vb.pp("lora"),
            )?),
            None => None,
        };
        Ok(Self::assemble(
            name,
            index,
            LayerKind::Conv2d(params),
            weight,
            bias,
            lora,
            bit_w,
        ))
    }

    fn assemble(
        name: &str,
        index: usize,
        kind: LayerKind,
        weight: Tensor,
        bias: Option<Tensor>,
        lora: Option<LoraFactors>,
        bit_w: u32,
    ) -> Self {
        tracing::debug!(
            layer = name,
            index,
            shape = ?weight.dims(),
            bias = bias.is_some(),
            lora = lora.is_some(),
            bit_w,
            "Built meta-quantized layer"
        );
        Self {
            name: name.to_string(),
            index,
            kind,
            weight,
            bias,
            lora,
            bit_w,
            state: Mutex::new(LayerState::default()),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn bit_w(&self) -> u32 {
        self.bit_w
    }

    /// Latent full-precision weight (a variable of the primary network).
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn lora_factors(&self) -> Option<(&Tensor, &Tensor)> {
        self.lora.as_ref().map(|l| (&l.a, &l.b))
    }

    /// Calibration computed by the last forward pass.
    pub fn calibration(&self) -> Option<Calibration> {
        self.state.lock().calibration.clone()
    }

    /// Pre-quantisation weight snapshot of the last forward pass.
    pub fn pre_quantized_weight(&self) -> Option<Tensor> {
        self.state.lock().pre_quantized_weight.clone()
    }

    /// Quantized weight of the last forward pass (detached).
    pub fn quantized_weight(&self) -> Option<Tensor> {
        self.state.lock().quantized_weight.clone()
    }

    /// Raw gradient w.r.t. the quantized weight from the last backward pass.
    pub fn quantized_grads(&self) -> Option<Tensor> {
        self.state.lock().quantized_grads.clone()
    }

    /// Transformed gradient assigned by the orchestrator.
    pub fn pre_quantized_grads(&self) -> Option<LayerGrad> {
        self.state.lock().pre_quantized_grads.clone()
    }

    pub fn set_pre_quantized_grads(&self, grad: LayerGrad) {
        self.state.lock().pre_quantized_grads = Some(grad);
    }

    // ── Forward ─────────────────────────────────────────────────────────────

    pub fn forward(&self, x: &Tensor, args: &LayerArgs) -> Result<Tensor> {
        let record = args.meta_grad;
        if let Some(r) = record {
            self.check_record(r)?;
        }
        let calibration = Calibration::compute(&self.weight, args.scheme)?;

        let (latent, lora_parts) = match &self.lora {
            None => {
                let meta_weight = match record {
                    Some(r) => {
                        let grad = dense_grad(&r.weight_grad, &self.name)?;
                        let slow = args.slow_grad.and_then(|s| s.weight_grad.dense());
                        meta_update(&self.weight, &calibration, grad, slow, args.lr)?
                    }
                    None => self.weight.clone(),
                };
                (meta_weight, None)
            }
            Some(lora) => {
                let cal_a = Calibration::compute(&lora.a, args.scheme)?;
                let cal_b = Calibration::compute(&lora.b, args.scheme)?;
                let (meta_a, meta_b) = match record {
                    Some(r) => {
                        let (ga, gb) = low_rank_grad(&r.weight_grad, &self.name)?;
                        let slow = args.slow_grad.and_then(|s| s.weight_grad.low_rank());
                        (
                            meta_update(&lora.a, &cal_a, ga, slow.map(|s| s.0), args.lr)?,
                            meta_update(&lora.b, &cal_b, gb, slow.map(|s| s.1), args.lr)?,
                        )
                    }
                    None => (lora.a.clone(), lora.b.clone()),
                };
                let delta = meta_a.matmul(&meta_b)?.reshape(self.weight.dims())?;
                let merged = (&self.weight + delta)?;
                (merged, Some((cal_a, cal_b, meta_a, meta_b)))
            }
        };

        let meta_bias = match (&self.bias, record) {
            (Some(b), Some(r)) => match &r.bias_grad {
                Some(g) => Some((b - g.affine(args.lr, 0.0)?)?),
                None => bail!("layer {}: bias present but record has no bias gradient", self.name),
            },
            (Some(b), None) => Some(b.clone()),
            (None, _) => None,
        };

        let q = quantize_weight(&latent, args.scheme, self.bit_w)?;
        let capture = GradCapture::new(&q.quantized)?;
        let weight = capture.attach(&q.quantized)?;

        {
            let mut st = self.state.lock();
            st.calibration = Some(calibration);
            st.pre_quantized_weight = Some(q.pre_quantized.detach());
            st.quantized_weight = Some(q.quantized.detach());
            st.capture = Some(capture);
            if let Some((cal_a, cal_b, meta_a, meta_b)) = lora_parts {
                st.lora_calibration = Some((cal_a, cal_b));
                st.lora_snapshot = Some((meta_a.detach(), meta_b.detach()));
            }
        }

        let y = match self.kind {
            LayerKind::Linear => matmul_reshape(x, &weight.t()?)?,
            LayerKind::Conv2d(p) => x.conv2d(&weight, p.padding, p.stride, p.dilation, p.groups)?,
        };
        match (&meta_bias, self.kind) {
            (None, _) => Ok(y),
            (Some(b), LayerKind::Linear) => y.broadcast_add(b),
            (Some(b), LayerKind::Conv2d(_)) => y.broadcast_add(&b.reshape((1, (), 1, 1))?),
        }
    }

    /// The bias presence of the layer and of its record must agree, and the
    /// record's gradient kind must match the layer (dense vs. LoRA).
    fn check_record(&self, r: &MetaGradRecord) -> Result<()> {
        if self.bias.is_none() && r.bias_grad.is_some() {
            bail!("layer {}: record carries a bias gradient but the layer has no bias", self.name);
        }
        match (&r.weight_grad, self.lora.is_some()) {
            (LayerGrad::Dense(_), false) | (LayerGrad::LowRank { .. }, true) => Ok(()),
            (LayerGrad::Dense(_), true) => {
                bail!("layer {}: dense record for a LoRA layer", self.name)
            }
            (LayerGrad::LowRank { .. }, false) => {
                bail!("layer {}: low-rank record for a dense layer", self.name)
            }
        }
    }

    // ── Gradient capture ────────────────────────────────────────────────────

    /// Deposit the gradients of the last forward pass from `grads` into the
    /// layer's transient fields: `dL/dq` from the capture tap, the bias
    /// gradient, and for LoRA layers the gradients of both factor variables.
    /// Returns `false` (and leaves the fields untouched) when the pass
    /// recorded no gradient, e.g. during inference.
    pub fn capture_grads(&self, grads: &GradStore) -> bool {
        let mut st = self.state.lock();
        let Some(capture) = st.capture.take() else {
            return false;
        };
        let Some(g) = grads.get(capture.tap.as_tensor()) else {
            tracing::trace!(layer = %self.name, "no gradient recorded for quantized weight");
            return false;
        };
        st.quantized_grads = Some(g.detach());
        if let Some(b) = &self.bias {
            if let Some(g) = grads.get(b) {
                st.bias_grad = Some(g.detach());
            }
        }
        if let Some(lora) = &self.lora {
            if let (Some(ga), Some(gb)) = (grads.get(&lora.a), grads.get(&lora.b)) {
                st.lora_grads = Some((ga.detach(), gb.detach()));
            }
        }
        true
    }

    /// Inject raw gradients directly, bypassing capture (external drivers).
    pub fn record_gradients(&self, quantized_grad: Tensor, bias_grad: Option<Tensor>) {
        let mut st = self.state.lock();
        st.quantized_grads = Some(quantized_grad);
        st.bias_grad = bias_grad;
    }

    /// Read the raw gradients and weight snapshots for the orchestrator.
    pub fn observation(&self) -> Result<LayerObservation> {
        let st = self.state.lock();
        let bias_grad = match (&self.bias, &st.bias_grad) {
            (Some(_), Some(g)) => Some(g.clone()),
            (Some(_), None) => bail!("layer {}: bias present but no bias gradient captured", self.name),
            (None, _) => None,
        };
        let slots = if self.lora.is_some() {
            let (Some((ga, gb)), Some((wa, wb))) = (&st.lora_grads, &st.lora_snapshot) else {
                bail!("layer {}: no LoRA gradients captured; run a backward pass first", self.name)
            };
            vec![
                GradSlot {
                    suffix: Some("lora_a"),
                    grad: ga.clone(),
                    weight: wa.clone(),
                },
                GradSlot {
                    suffix: Some("lora_b"),
                    grad: gb.clone(),
                    weight: wb.clone(),
                },
            ]
        } else {
            let (Some(g), Some(w)) = (&st.quantized_grads, &st.pre_quantized_weight) else {
                bail!("layer {}: no gradient captured; run a backward pass first", self.name)
            };
            vec![GradSlot {
                suffix: None,
                grad: g.clone(),
                weight: w.clone(),
            }]
        };
        Ok(LayerObservation { slots, bias_grad })
    }

    // ── Gradient assignment ─────────────────────────────────────────────────

    /// Overwrite the latent-weight gradient in `grads` with
    /// `calibration * transformed_gradient`. For LoRA layers each factor gets
    /// its own calibrated gradient and the base weight gradient is dropped.
    pub fn assign_gradient(&self, record: &MetaGradRecord, grads: &mut GradStore) -> Result<()> {
        self.check_record(record)?;
        let st = self.state.lock();
        match (&record.weight_grad, &self.lora) {
            (LayerGrad::Dense(g), None) => {
                let Some(cal) = &st.calibration else {
                    bail!("layer {}: no calibration; run a forward pass first", self.name)
                };
                grads.insert(&self.weight, cal.apply(&g.detach())?);
            }
            (LayerGrad::LowRank { a, b }, Some(lora)) => {
                let Some((cal_a, cal_b)) = &st.lora_calibration else {
                    bail!("layer {}: no LoRA calibration; run a forward pass first", self.name)
                };
                grads.insert(&lora.a, cal_a.apply(&a.detach())?);
                grads.insert(&lora.b, cal_b.apply(&b.detach())?);
                grads.remove(&self.weight);
            }
            _ => bail!("layer {}: record kind does not match layer", self.name),
        }
        Ok(())
    }

    /// Drop gradients of frozen tensors (the LoRA base weight).
    pub fn retain_trainable_grads(&self, grads: &mut GradStore) {
        if self.lora.is_some() {
            grads.remove(&self.weight);
        }
    }

    /// Trainable element count (latent weight or LoRA factors, plus bias).
    pub fn num_params(&self) -> usize {
        let weight = match &self.lora {
            Some(l) => l.a.elem_count() + l.b.elem_count(),
            None => self.weight.elem_count(),
        };
        weight + self.bias.as_ref().map_or(0, |b| b.elem_count())
    }
}

impl LoraFactors {
    fn new(rows: usize, cols: usize, rank: usize, vb: VarBuilder) -> Result<Self> {
        let a = vb.get_with_hints(
            (rows, rank),
            "a",
            Init::Randn {
                mean: 0.,
                stdev: 1.0 / (rank as f64).sqrt(),
            },
        )?;
        let b = vb.get_with_hints(
            (rank, cols),
            "b",
            Init::Randn {
                mean: 0.,
                stdev: LORA_B_STDEV,
            },
        )?;
        Ok(Self { a, b })
    }
}

// ── Update laws ─────────────────────────────────────────────────────────────

/// `latent − lr · step`, where `step` is the calibrated gradient, or
/// `0.9 · slow + 0.1 · calibrated` when a slow gradient is supplied.
fn meta_update(
    latent: &Tensor,
    calibration: &Calibration,
    grad: &Tensor,
    slow: Option<&Tensor>,
    lr: f64,
) -> Result<Tensor> {
    let calibrated = calibration.apply(grad)?;
    let step = match slow {
        Some(s) => (s.affine(MOMENTUM_DECAY, 0.0)? + calibrated.affine(1.0 - MOMENTUM_DECAY, 0.0)?)?,
        None => calibrated,
    };
    latent - step.affine(lr, 0.0)?
}

fn dense_grad<'a>(g: &'a LayerGrad, layer: &str) -> Result<&'a Tensor> {
    match g.dense() {
        Some(t) => Ok(t),
        None => bail!("layer {layer}: expected a dense gradient"),
    }
}

fn low_rank_grad<'a>(g: &'a LayerGrad, layer: &str) -> Result<(&'a Tensor, &'a Tensor)> {
    match g.low_rank() {
        Some(t) => Ok(t),
        None => bail!("layer {layer}: expected a low-rank gradient"),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
