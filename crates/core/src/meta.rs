//! Meta-networks: small models that transform per-layer gradient signals.
//!
//! All variants share one call convention,
//! `transform(observation, state) -> (output, new_state)`:
//!
//! | variant | observation | state | output |
//! |---------|-------------|-------|--------|
//! | [`MetaNet::Fc`]    | `(N, 1)`       | -            | `(N, 1)` |
//! | [`MetaNet::Lstm`]  | `(seq, N, 1)`  | [`LstmState`] | `(N, 1)` head over the last hidden state |
//! | [`MetaNet::Mamba`] | `(N, L, 1)`    | - (window mode) | `(N, L, 1)` |
//! | [`MetaNet::Mamba`] | `(N, 1, 1)`    | [`SsmState`] (stream mode) | `(N, 1, 1)` |
//! | [`MetaNet::Scale`] | any            | -            | `alpha · obs` |
//!
//! Each gradient element is one batch entry, so `N` is the element count of
//! the layer being transformed.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use metaquant_common::{MetaMethod, MetaNetConfig, MetaNonlinear};

use crate::mamba::{SelectiveSsm, SsmState};

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

/// Recurrent state carried between steps for one layer slot.
#[derive(Debug, Clone)]
pub enum MetaState {
    Lstm(LstmState),
    Ssm(SsmState),
}

impl MetaState {
    /// Cut from the graph of the step that produced it.
    pub fn detach(&self) -> Self {
        match self {
            Self::Lstm(s) => Self::Lstm(LstmState {
                h: s.h.detach(),
                c: s.c.detach(),
            }),
            Self::Ssm(s) => Self::Ssm(s.detach()),
        }
    }
}

// ── FC ──────────────────────────────────────────────────────────────────────

/// Bias-free FC stack `1 → hidden → … → 1`.
pub struct MetaFc {
    layers: Vec<Linear>,
    nonlinear: MetaNonlinear,
}

impl MetaFc {
    pub fn new(
        num_layers: usize,
        hidden: usize,
        nonlinear: MetaNonlinear,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            candle_core::bail!("meta FC needs at least one layer");
        }
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { 1 } else { hidden };
            let out_dim = if i + 1 == num_layers { 1 } else { hidden };
            layers.push(candle_nn::linear_no_bias(
                in_dim,
                out_dim,
                vb.pp(format!("linear{i}")),
            )?);
        }
        Ok(Self { layers, nonlinear })
    }
}

impl Module for MetaFc {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i != last {
                h = match self.nonlinear {
                    MetaNonlinear::None => h,
                    MetaNonlinear::Relu => h.relu()?,
                    MetaNonlinear::Tanh => h.tanh()?,
                };
            }
        }
        Ok(h)
    }
}

// ── LSTM ────────────────────────────────────────────────────────────────────

/// Single-layer LSTM over scalar inputs plus a linear head on the final
/// hidden state. Gate order: input, forget, cell, output.
pub struct MetaLstm {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    head: Linear,
    hidden: usize,
}

impl MetaLstm {
    pub fn new(hidden: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (hidden as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let lstm = vb.pp("lstm");
        let w_ih = lstm.get_with_hints((4 * hidden, 1), "weight_ih", init)?;
        let w_hh = lstm.get_with_hints((4 * hidden, hidden), "weight_hh", init)?;
        let b_ih = lstm.get_with_hints(4 * hidden, "bias_ih", init)?;
        let b_hh = lstm.get_with_hints(4 * hidden, "bias_hh", init)?;
        let head = candle_nn::linear(hidden, 1, vb.pp("head"))?;
        Ok(Self {
            w_ih,
            w_hh,
            b_ih,
            b_hh,
            head,
            hidden,
        })
    }

    pub fn zero_state(&self, batch: usize, like: &Tensor) -> Result<LstmState> {
        let h = Tensor::zeros((batch, self.hidden), like.dtype(), like.device())?;
        Ok(LstmState { c: h.clone(), h })
    }

    /// One cell update. `x`: `(N, 1)`.
    fn step(&self, x: &Tensor, state: &LstmState) -> Result<LstmState> {
        let gates = x
            .matmul(&self.w_ih.t()?)?
            .broadcast_add(&self.b_ih)?
            .add(&state.h.matmul(&self.w_hh.t()?)?.broadcast_add(&self.b_hh)?)?;
        let chunks = gates.chunk(4, 1)?;
        let i = candle_nn::ops::sigmoid(&chunks[0])?;
        let f = candle_nn::ops::sigmoid(&chunks[1])?;
        let g = chunks[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&chunks[3])?;
        let c = ((f * &state.c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok(LstmState { h, c })
    }

    /// Run `(seq, N, 1)` from `state`; returns `(head(h_last), final state)`.
    pub fn forward(&self, x: &Tensor, state: &LstmState) -> Result<(Tensor, LstmState)> {
        let seq = x.dim(0)?;
        let mut state = state.clone();
        for t in 0..seq {
            state = self.step(&x.get(t)?, &state)?;
        }
        let out = self.head.forward(&state.h)?;
        Ok((out, state))
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────────

pub enum MetaNet {
    Fc(MetaFc),
    Lstm(MetaLstm),
    Mamba(SelectiveSsm),
    /// Single trainable scalar `alpha`, shape `(1,)`.
    Scale(Tensor),
}

impl MetaNet {
    /// Build the network a gradient-transformation method needs.
    pub fn for_method(cfg: &MetaNetConfig, vb: VarBuilder) -> Result<Self> {
        let net = match cfg.method {
            MetaMethod::FcGrad => {
                Self::Fc(MetaFc::new(2, cfg.hidden_size, cfg.nonlinear, vb.pp("fc"))?)
            }
            MetaMethod::MultiFc => Self::Fc(MetaFc::new(
                cfg.num_fc,
                cfg.hidden_size,
                cfg.nonlinear,
                vb.pp("fc"),
            )?),
            MetaMethod::LstmWeight
            | MetaMethod::LstmGrad
            | MetaMethod::LstmMerge
            | MetaMethod::LstmMomentum => Self::Lstm(MetaLstm::new(cfg.hidden_size, vb)?),
            MetaMethod::MambaHistory | MetaMethod::MambaStream => Self::Mamba(SelectiveSsm::new(
                1,
                cfg.d_state,
                cfg.d_conv,
                cfg.expand,
                vb.pp("mamba"),
            )?),
            MetaMethod::ConstantScale => {
                Self::Scale(vb.get_with_hints(1, "alpha", Init::Const(cfg.scale_init))?)
            }
        };
        tracing::info!(method = %cfg.method, kind = net.kind(), "Built meta-network");
        Ok(net)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fc(_) => "fc",
            Self::Lstm(_) => "lstm",
            Self::Mamba(_) => "mamba",
            Self::Scale(_) => "scale",
        }
    }

    /// Fresh zero state for `n` entries, or `None` for stateless variants.
    pub fn initial_state(&self, n: usize, like: &Tensor) -> Result<Option<MetaState>> {
        match self {
            Self::Lstm(m) => Ok(Some(MetaState::Lstm(m.zero_state(n, like)?))),
            Self::Mamba(m) => Ok(Some(MetaState::Ssm(m.zero_state(n, like)?))),
            Self::Fc(_) | Self::Scale(_) => Ok(None),
        }
    }

    /// Transform one observation. See the module table for shapes.
    ///
    /// For [`MetaNet::Mamba`], `state = None` selects window mode and
    /// `Some` selects stream mode. For [`MetaNet::Lstm`] a missing state is
    /// replaced by zeros.
    pub fn transform(
        &self,
        obs: &Tensor,
        state: Option<&MetaState>,
    ) -> Result<(Tensor, Option<MetaState>)> {
        match self {
            Self::Fc(m) => Ok((m.forward(obs)?, None)),
            Self::Scale(alpha) => Ok((obs.broadcast_mul(alpha)?, None)),
            Self::Lstm(m) => {
                let prior = match state {
                    Some(MetaState::Lstm(s)) => s.clone(),
                    Some(MetaState::Ssm(_)) => {
                        candle_core::bail!("LSTM meta-network received a state-space state")
                    }
                    None => m.zero_state(obs.dim(1)?, obs)?,
                };
                let (out, next) = m.forward(obs, &prior)?;
                Ok((out, Some(MetaState::Lstm(next))))
            }
            Self::Mamba(m) => match state {
                None => Ok((m.forward_seq(obs)?, None)),
                Some(MetaState::Ssm(s)) => {
                    let x = obs.flatten_from(1)?;
                    let (y, next) = m.step(&x, s)?;
                    Ok((y.unsqueeze(1)?, Some(MetaState::Ssm(next))))
                }
                Some(MetaState::Lstm(_)) => {
                    candle_core::bail!("state-space meta-network received an LSTM state")
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(method: MetaMethod, varmap: &VarMap) -> MetaNet {
        let cfg = MetaNetConfig {
            method,
            hidden_size: 8,
            expand: 4,
            d_state: 4,
            ..Default::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        MetaNet::for_method(&cfg, vb).unwrap()
    }

    #[test]
    fn fc_maps_column_to_column() {
        let varmap = VarMap::new();
        let net = build(MetaMethod::MultiFc, &varmap);
        let obs = Tensor::ones((7, 1), DType::F32, &Device::Cpu).unwrap();
        let (out, state) = net.transform(&obs, None).unwrap();
        assert_eq!(out.dims(), &[7, 1]);
        assert!(state.is_none());
        assert_eq!(varmap.all_vars().len(), 3);
    }

    #[test]
    fn scale_at_one_is_identity() {
        let varmap = VarMap::new();
        let net = build(MetaMethod::ConstantScale, &varmap);
        let obs = Tensor::new(&[[0.5f32], [-2.0], [3.0]], &Device::Cpu).unwrap();
        let (out, _) = net.transform(&obs, None).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), obs.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn lstm_threads_state() {
        let varmap = VarMap::new();
        let net = build(MetaMethod::LstmGrad, &varmap);
        let obs = Tensor::ones((1, 5, 1), DType::F32, &Device::Cpu).unwrap();
        let (first, state) = net.transform(&obs, None).unwrap();
        assert_eq!(first.dims(), &[5, 1]);
        let Some(MetaState::Lstm(s)) = &state else {
            panic!("expected LSTM state")
        };
        assert_eq!(s.h.dims(), &[5, 8]);
        let (second, _) = net.transform(&obs, state.as_ref()).unwrap();
        let a = first.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = second.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn lstm_merge_consumes_two_timesteps() {
        let varmap = VarMap::new();
        let net = build(MetaMethod::LstmMerge, &varmap);
        let obs = Tensor::ones((2, 3, 1), DType::F32, &Device::Cpu).unwrap();
        let (out, _) = net.transform(&obs, None).unwrap();
        assert_eq!(out.dims(), &[3, 1]);
    }

    #[test]
    fn mamba_modes() {
        let varmap = VarMap::new();
        let net = build(MetaMethod::MambaStream, &varmap);
        let dev = Device::Cpu;
        let window = Tensor::ones((6, 3, 1), DType::F32, &dev).unwrap();
        let (out, state) = net.transform(&window, None).unwrap();
        assert_eq!(out.dims(), &[6, 3, 1]);
        assert!(state.is_none());

        let obs = Tensor::ones((6, 1, 1), DType::F32, &dev).unwrap();
        let zero = net.initial_state(6, &obs).unwrap();
        let (out, state) = net.transform(&obs, zero.as_ref()).unwrap();
        assert_eq!(out.dims(), &[6, 1, 1]);
        assert!(matches!(state, Some(MetaState::Ssm(_))));
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let varmap = VarMap::new();
        let lstm = build(MetaMethod::LstmWeight, &varmap);
        let obs = Tensor::ones((1, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let ssm_state = MetaState::Ssm(SsmState {
            conv: Tensor::zeros((2, 1, 1), DType::F32, &Device::Cpu).unwrap(),
            ssm: Tensor::zeros((2, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        });
        assert!(lstm.transform(&obs, Some(&ssm_state)).is_err());
    }
}
