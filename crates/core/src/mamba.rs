//! Selective state-space block (Mamba-style) used as a gradient meta-network.
//!
//! Every observed gradient element is an independent batch entry with
//! `d_model = 1`. The block keeps two pieces of recurrent state per entry:
//!
//! | state | shape | content |
//! |-------|-------|---------|
//! | conv  | `(B, d_inner, d_conv)` | trailing inputs of the causal depthwise conv |
//! | ssm   | `(B, d_inner, d_state)` | diagonal state-space memory |
//!
//! [`SelectiveSsm::forward_seq`] runs a whole window from zero state;
//! [`SelectiveSsm::step`] advances an existing state by one input.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

/// Target `softplus(dt_bias)` at init.
const DT_INIT: f64 = 0.01;

pub struct SelectiveSsm {
    in_proj: Linear,
    conv_weight: Tensor,
    conv_bias: Tensor,
    x_proj: Linear,
    dt_proj: Linear,
    a_log: Tensor,
    d: Tensor,
    out_proj: Linear,
    d_inner: usize,
    d_state: usize,
    d_conv: usize,
    dt_rank: usize,
}

/// `(conv_state, ssm_state)` of one layer slot.
#[derive(Debug, Clone)]
pub struct SsmState {
    pub conv: Tensor,
    pub ssm: Tensor,
}

impl SsmState {
    pub fn detach(&self) -> Self {
        Self {
            conv: self.conv.detach(),
            ssm: self.ssm.detach(),
        }
    }
}

impl SelectiveSsm {
    pub fn new(
        d_model: usize,
        d_state: usize,
        d_conv: usize,
        expand: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if d_conv == 0 || d_state == 0 || expand == 0 {
            candle_core::bail!("state-space sizes must be positive (d_state={d_state}, d_conv={d_conv}, expand={expand})");
        }
        let d_inner = expand * d_model;
        let dt_rank = d_model.div_ceil(16);

        let in_proj = candle_nn::linear_no_bias(d_model, 2 * d_inner, vb.pp("in_proj"))?;
        let conv_bound = 1.0 / (d_conv as f64).sqrt();
        let conv_weight = vb.get_with_hints(
            (d_inner, d_conv),
            "conv.weight",
            Init::Uniform {
                lo: -conv_bound,
                up: conv_bound,
            },
        )?;
        let conv_bias = vb.get_with_hints(d_inner, "conv.bias", Init::Const(0.))?;
        let x_proj =
            candle_nn::linear_no_bias(d_inner, dt_rank + 2 * d_state, vb.pp("x_proj"))?;

        let dt_bound = 1.0 / (dt_rank as f64).sqrt();
        let dt_weight = vb.pp("dt_proj").get_with_hints(
            (d_inner, dt_rank),
            "weight",
            Init::Uniform {
                lo: -dt_bound,
                up: dt_bound,
            },
        )?;
        // Inverse softplus so the initial step size is DT_INIT.
        let dt_bias_init = DT_INIT.exp_m1().ln();
        let dt_bias = vb
            .pp("dt_proj")
            .get_with_hints(d_inner, "bias", Init::Const(dt_bias_init))?;
        let dt_proj = Linear::new(dt_weight, Some(dt_bias));

        let a_log = vb.get_with_hints((d_inner, d_state), "a_log", Init::Const(0.))?;
        let d = vb.get_with_hints(d_inner, "d", Init::Const(1.))?;
        let out_proj = candle_nn::linear_no_bias(d_inner, d_model, vb.pp("out_proj"))?;

        Ok(Self {
            in_proj,
            conv_weight,
            conv_bias,
            x_proj,
            dt_proj,
            a_log,
            d,
            out_proj,
            d_inner,
            d_state,
            d_conv,
            dt_rank,
        })
    }

    pub fn d_inner(&self) -> usize {
        self.d_inner
    }

    pub fn d_state(&self) -> usize {
        self.d_state
    }

    pub fn d_conv(&self) -> usize {
        self.d_conv
    }

    /// Zero state for `batch` entries.
    pub fn zero_state(&self, batch: usize, like: &Tensor) -> Result<SsmState> {
        let dtype = like.dtype();
        let dev = like.device();
        Ok(SsmState {
            conv: Tensor::zeros((batch, self.d_inner, self.d_conv), dtype, dev)?,
            ssm: Tensor::zeros((batch, self.d_inner, self.d_state), dtype, dev)?,
        })
    }

    /// `A = −exp(a_log) · [1, 2, …, d_state]`, shape `(d_inner, d_state)`.
    fn a(&self) -> Result<Tensor> {
        let ramp = Tensor::arange(1u32, self.d_state as u32 + 1, self.a_log.device())?
            .to_dtype(self.a_log.dtype())?;
        self.a_log.exp()?.broadcast_mul(&ramp)?.neg()
    }

    /// One recurrence step. `x`: `(B, d_model)` → `(B, d_model)`.
    pub fn step(&self, x: &Tensor, state: &SsmState) -> Result<(Tensor, SsmState)> {
        let xz = self.in_proj.forward(x)?;
        let xs = xz.narrow(1, 0, self.d_inner)?;
        let z = xz.narrow(1, self.d_inner, self.d_inner)?;

        let conv = if self.d_conv == 1 {
            xs.unsqueeze(2)?
        } else {
            Tensor::cat(
                &[state.conv.narrow(2, 1, self.d_conv - 1)?, xs.unsqueeze(2)?],
                2,
            )?
        };
        let xc = conv
            .broadcast_mul(&self.conv_weight.unsqueeze(0)?)?
            .sum(D::Minus1)?
            .broadcast_add(&self.conv_bias)?;
        let xc = candle_nn::ops::silu(&xc)?;

        let x_db = self.x_proj.forward(&xc)?;
        let dt = x_db.narrow(1, 0, self.dt_rank)?;
        let b = x_db.narrow(1, self.dt_rank, self.d_state)?;
        let c = x_db.narrow(1, self.dt_rank + self.d_state, self.d_state)?;
        let dt = softplus(&self.dt_proj.forward(&dt)?)?;

        let dt3 = dt.unsqueeze(2)?;
        let decay = dt3.broadcast_mul(&self.a()?.unsqueeze(0)?)?.exp()?;
        let drive = dt3
            .broadcast_mul(&b.unsqueeze(1)?)?
            .broadcast_mul(&xc.unsqueeze(2)?)?;
        let ssm = ((&state.ssm * decay)? + drive)?;

        let y = ssm.broadcast_mul(&c.unsqueeze(1)?)?.sum(D::Minus1)?;
        let y = (y + xc.broadcast_mul(&self.d)?)?;
        let y = (y * candle_nn::ops::silu(&z)?)?;
        let out = self.out_proj.forward(&y)?;
        Ok((out, SsmState { conv, ssm }))
    }

    /// Run a window `(B, L, d_model)` from zero state → `(B, L, d_model)`.
    pub fn forward_seq(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, len, _) = x.dims3()?;
        let mut state = self.zero_state(batch, x)?;
        let mut outputs = Vec::with_capacity(len);
        for t in 0..len {
            let xt = x.narrow(1, t, 1)?.squeeze(1)?;
            let (y, next) = self.step(&xt, &state)?;
            outputs.push(y.unsqueeze(1)?);
            state = next;
        }
        Tensor::cat(&outputs, 1)
    }
}

/// `log(1 + exp(x))`, computed as `relu(x) + log(1 + exp(−|x|))`.
fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn block(varmap: &VarMap) -> SelectiveSsm {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        SelectiveSsm::new(1, 4, 3, 6, vb).unwrap()
    }

    #[test]
    fn step_keeps_state_shapes() {
        let varmap = VarMap::new();
        let ssm = block(&varmap);
        let x = Tensor::new(&[[0.1f32], [-0.2], [0.3]], &Device::Cpu).unwrap();
        let state = ssm.zero_state(3, &x).unwrap();
        let (y, next) = ssm.step(&x, &state).unwrap();
        assert_eq!(y.dims(), &[3, 1]);
        assert_eq!(next.conv.dims(), &[3, 6, 3]);
        assert_eq!(next.ssm.dims(), &[3, 6, 4]);
    }

    #[test]
    fn sequence_matches_repeated_steps() {
        let varmap = VarMap::new();
        let ssm = block(&varmap);
        let dev = Device::Cpu;
        let seq = Tensor::new(&[[[0.5f32], [-1.0], [0.25]]], &dev).unwrap();
        let out = ssm.forward_seq(&seq).unwrap();
        assert_eq!(out.dims(), &[1, 3, 1]);

        let mut state = ssm.zero_state(1, &seq).unwrap();
        let mut last = None;
        for v in [0.5f32, -1.0, 0.25] {
            let x = Tensor::new(&[[v]], &dev).unwrap();
            let (y, next) = ssm.step(&x, &state).unwrap();
            state = next;
            last = Some(y);
        }
        let stepped = last.unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        let seq_last = out
            .narrow(1, 2, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!((stepped - seq_last).abs() < 1e-6);
    }

    #[test]
    fn softplus_is_stable() {
        let x = Tensor::new(&[-50f32, 0.0, 50.0], &Device::Cpu).unwrap();
        let y = softplus(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!(y[0] >= 0.0 && y[0] < 1e-6);
        assert!((y[1] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((y[2] - 50.0).abs() < 1e-4);
    }
}
