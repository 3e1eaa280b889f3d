//! Meta-gradient generation: one pass over every quantized layer.
//!
//! For each layer (in registration order) and each of its gradient slots:
//!
//! 1. read the captured raw gradient and the pre-quantisation weight;
//! 2. shape the observation for the active [`MetaMethod`];
//! 3. run the meta-network, threading per-slot recurrent state;
//! 4. reshape the output back to the gradient's shape.
//!
//! The result is a [`MetaGradMap`] plus the next [`LayerStates`]. The caller
//! owns the states and replaces its copy with the returned one every step.

use std::collections::HashMap;

use anyhow::Context;
use candle_core::Tensor;

use metaquant_common::MetaMethod;
use metaquant_core::{
    GradSlot, LayerGrad, MetaGradMap, MetaGradRecord, MetaNet, MetaState, PrimaryNet,
    MOMENTUM_DECAY,
};

/// Per-slot state carried between steps, keyed by layer name (or
/// `<layer>.lora_a` / `<layer>.lora_b` for low-rank slots).
#[derive(Debug, Clone, Default)]
pub struct LayerStates {
    /// LSTM `(h, c)` or state-space `(conv, ssm)` state.
    pub hidden: HashMap<String, MetaState>,
    /// Gradient EMA, shape `(N, 1)`.
    pub momentum: HashMap<String, Tensor>,
    /// Trailing gradient window, shape `(N, L, 1)` with `L ≤ history_window`.
    pub history: HashMap<String, Tensor>,
}

impl LayerStates {
    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty() && self.momentum.is_empty() && self.history.is_empty()
    }
}

/// Knobs of one generation pass.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub method: MetaMethod,
    /// Detach meta-network outputs (no meta learning this step).
    pub fix_meta: bool,
    pub history_window: usize,
}

/// Transform the captured gradients of every layer of `net`.
pub fn generate_meta_gradients(
    meta: &MetaNet,
    net: &PrimaryNet,
    opts: &GenerationOptions,
    prev: &LayerStates,
) -> anyhow::Result<(MetaGradMap, LayerStates)> {
    let mut map = MetaGradMap::with_capacity(net.num_layers());
    let mut next = LayerStates::default();

    for (name, idx) in net.layer_name_list() {
        let layer = net
            .layer(*idx)
            .with_context(|| format!("layer {name} (index {idx}) is not registered"))?;
        let obs = layer
            .observation()
            .with_context(|| format!("reading gradients of layer {name}"))?;

        let mut outputs = Vec::with_capacity(obs.slots.len());
        for slot in &obs.slots {
            let key = match slot.suffix {
                Some(s) => format!("{name}.{s}"),
                None => name.clone(),
            };
            let out = transform_slot(meta, opts, &key, slot, prev, &mut next)
                .with_context(|| format!("meta-network on {key} ({})", opts.method))?;
            outputs.push(out.reshape(slot.grad.dims())?);
        }

        let weight_grad = match <[Tensor; 2]>::try_from(outputs) {
            Ok([a, b]) => LayerGrad::LowRank { a, b },
            Err(mut single) => match single.pop() {
                Some(g) if single.is_empty() => LayerGrad::Dense(g),
                _ => anyhow::bail!("layer {name}: unexpected number of gradient slots"),
            },
        };
        layer.set_pre_quantized_grads(weight_grad.detach());
        map.insert(
            name.clone(),
            MetaGradRecord {
                layer_idx: *idx,
                weight_grad,
                bias_grad: obs.bias_grad,
            },
        );
    }

    tracing::trace!(
        layers = map.len(),
        method = %opts.method,
        fix_meta = opts.fix_meta,
        "Generated meta-gradients"
    );
    Ok((map, next))
}

/// Run the meta-network on one slot. Returns a tensor with the same element
/// count as `slot.grad`.
fn transform_slot(
    meta: &MetaNet,
    opts: &GenerationOptions,
    key: &str,
    slot: &GradSlot,
    prev: &LayerStates,
    next: &mut LayerStates,
) -> anyhow::Result<Tensor> {
    let n = slot.grad.elem_count();
    let grad = slot.grad.detach().reshape((n, 1))?;
    let weight = slot.weight.detach().reshape((n, 1))?;
    let freeze = |t: Tensor| if opts.fix_meta { t.detach() } else { t };

    let out = match opts.method {
        MetaMethod::FcGrad | MetaMethod::ConstantScale => {
            let (out, _) = meta.transform(&grad, None)?;
            freeze(out)
        }
        MetaMethod::MultiFc => {
            let (gate, _) = meta.transform(&weight, None)?;
            (&grad * freeze(gate))?
        }
        MetaMethod::LstmWeight
        | MetaMethod::LstmGrad
        | MetaMethod::LstmMerge
        | MetaMethod::LstmMomentum => {
            let obs = match opts.method {
                MetaMethod::LstmWeight => weight.unsqueeze(0)?,
                MetaMethod::LstmGrad => grad.unsqueeze(0)?,
                MetaMethod::LstmMerge => {
                    Tensor::cat(&[weight.unsqueeze(0)?, grad.unsqueeze(0)?], 0)?
                }
                _ => {
                    let momentum = prev.momentum.get(key).cloned().unwrap_or_else(|| grad.clone());
                    let updated = (momentum.affine(MOMENTUM_DECAY, 0.0)?
                        + grad.affine(1.0 - MOMENTUM_DECAY, 0.0)?)?;
                    next.momentum.insert(key.to_string(), updated);
                    momentum.unsqueeze(0)?
                }
            };
            let (gate, state) = meta.transform(&obs, prev.hidden.get(key))?;
            if let Some(s) = state {
                next.hidden.insert(key.to_string(), s.detach());
            }
            (&grad * freeze(gate))?
        }
        MetaMethod::MambaHistory => {
            let current = grad.unsqueeze(1)?;
            let window = match prev.history.get(key) {
                Some(h) => {
                    let keep = opts.history_window.saturating_sub(1).min(h.dim(1)?);
                    if keep == 0 {
                        current
                    } else {
                        let tail = h.narrow(1, h.dim(1)? - keep, keep)?;
                        Tensor::cat(&[tail, current], 1)?
                    }
                }
                None => current,
            };
            next.history.insert(key.to_string(), window.clone());
            let (out, _) = meta.transform(&window, None)?;
            let len = out.dim(1)?;
            freeze(out.narrow(1, len - 1, 1)?)
        }
        MetaMethod::MambaStream => {
            let state = match prev.hidden.get(key) {
                Some(s) => s.clone(),
                None => meta
                    .initial_state(n, &grad)?
                    .context("stream method needs a recurrent meta-network")?,
            };
            let (out, state) = meta.transform(&grad.unsqueeze(1)?, Some(&state))?;
            if let Some(s) = state {
                next.hidden.insert(key.to_string(), s.detach());
            }
            freeze(out)
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use metaquant_common::{MetaNetConfig, MetaQuantConfig, ModelKind, QuantScheme};
    use metaquant_core::{build_network, ForwardArgs};

    fn small_config(method: MetaMethod, bias: bool) -> MetaQuantConfig {
        MetaQuantConfig {
            model: ModelKind::Mlp,
            num_classes: 2,
            input_shape: [1, 2, 2],
            mlp_hidden: vec![3],
            mlp_bias: bias,
            meta: MetaNetConfig {
                method,
                hidden_size: 4,
                expand: 2,
                d_state: 2,
                d_conv: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Fixture {
        net: PrimaryNet,
        meta: MetaNet,
        opts: GenerationOptions,
        _vars: (VarMap, VarMap),
    }

    fn fixture(config: &MetaQuantConfig) -> Fixture {
        let dev = Device::Cpu;
        let primary = VarMap::new();
        let net =
            build_network(config, VarBuilder::from_varmap(&primary, DType::F32, &dev)).unwrap();
        let meta_vars = VarMap::new();
        let meta = MetaNet::for_method(
            &config.meta,
            VarBuilder::from_varmap(&meta_vars, DType::F32, &dev),
        )
        .unwrap();
        let opts = GenerationOptions {
            method: config.meta.method,
            fix_meta: false,
            history_window: config.meta.history_window,
        };
        Fixture {
            net,
            meta,
            opts,
            _vars: (primary, meta_vars),
        }
    }

    /// Forward + backward on a fixed batch, then capture.
    fn natural_gradients(net: &PrimaryNet) {
        let x = Tensor::new(&[[[[0.5f32, -1.0], [0.25, 2.0]]]], &Device::Cpu).unwrap();
        let y = net.forward(&x, &ForwardArgs::eval(QuantScheme::Dorefa)).unwrap();
        let grads = y.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(net.capture_grads(&grads), net.num_layers());
    }

    /// Overwrite every layer's raw gradient with the constant `v`.
    fn inject(net: &PrimaryNet, v: f64) {
        for layer in net.layers() {
            let g = Tensor::ones(layer.weight().dims(), DType::F32, &Device::Cpu)
                .unwrap()
                .affine(v, 0.0)
                .unwrap();
            let b = layer.bias().map(|b| b.zeros_like().unwrap());
            layer.record_gradients(g, b);
        }
    }

    #[test]
    fn every_method_preserves_shapes() {
        for method in MetaMethod::ALL {
            let fx = fixture(&small_config(method, true));
            natural_gradients(&fx.net);
            let (map, states) =
                generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default())
                    .unwrap();
            assert_eq!(map.len(), 2, "{method}");
            assert_eq!(!states.hidden.is_empty(), method.is_recurrent(), "{method}");
            for layer in fx.net.layers() {
                let record = &map[layer.name()];
                assert_eq!(record.layer_idx, layer.index());
                let g = record.weight_grad.dense().unwrap();
                assert_eq!(g.dims(), layer.weight().dims(), "{method}");
                assert!(record.bias_grad.is_some());
                assert!(layer.pre_quantized_grads().is_some());
            }
        }
    }

    #[test]
    fn constant_scale_at_one_is_identity() {
        let fx = fixture(&small_config(MetaMethod::ConstantScale, false));
        natural_gradients(&fx.net);
        let (map, states) =
            generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default())
                .unwrap();
        assert!(states.is_empty());
        for layer in fx.net.layers() {
            let raw = layer.quantized_grads().unwrap();
            let out = map[layer.name()].weight_grad.dense().unwrap().clone();
            let diff = (raw - out).unwrap().abs().unwrap().sum_all().unwrap();
            assert!(diff.to_scalar::<f32>().unwrap() < 1e-7);
        }
    }

    #[test]
    fn recurrent_state_carries_over() {
        let fx = fixture(&small_config(MetaMethod::LstmGrad, false));
        natural_gradients(&fx.net);
        inject(&fx.net, 0.5);
        let (first, states) =
            generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default())
                .unwrap();
        assert_eq!(states.hidden.len(), 2);
        assert!(states.hidden.contains_key("fc0"));

        let (second, next) =
            generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &states).unwrap();
        let a = first["fc0"].weight_grad.dense().unwrap();
        let b = second["fc0"].weight_grad.dense().unwrap();
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);

        // The second call must start from exactly the state the first returned.
        let grad = fx.net.layer(0).unwrap().quantized_grads().unwrap();
        let obs = grad.reshape((1, grad.elem_count(), 1)).unwrap();
        let (gate, expected_state) = fx.meta.transform(&obs, Some(&states.hidden["fc0"])).unwrap();
        let expected = (grad.reshape((grad.elem_count(), 1)).unwrap() * gate)
            .unwrap()
            .reshape(grad.dims())
            .unwrap();
        let vec = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(vec(b), vec(&expected));
        match (expected_state, &next.hidden["fc0"]) {
            (Some(MetaState::Lstm(want)), MetaState::Lstm(got)) => {
                assert_eq!(vec(&got.h), vec(&want.h));
                assert_eq!(vec(&got.c), vec(&want.c));
            }
            _ => panic!("expected LSTM state"),
        }
    }

    #[test]
    fn momentum_tracks_previous_average() {
        let fx = fixture(&small_config(MetaMethod::LstmMomentum, false));
        natural_gradients(&fx.net);
        inject(&fx.net, 1.0);
        let (_, s1) =
            generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default())
                .unwrap();
        let m1 = s1.momentum["fc0"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(m1.iter().all(|v| (v - 1.0).abs() < 1e-6));

        inject(&fx.net, 11.0);
        let (_, s2) = generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &s1).unwrap();
        let m2 = s2.momentum["fc0"].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // 0.9 * 1 + 0.1 * 11
        assert!(m2.iter().all(|v| (v - 2.0).abs() < 1e-5));
    }

    #[test]
    fn history_window_keeps_latest_five_in_order() {
        let fx = fixture(&small_config(MetaMethod::MambaHistory, false));
        natural_gradients(&fx.net);
        let mut states = LayerStates::default();
        for k in 1..=7 {
            inject(&fx.net, k as f64);
            let (_, next) = generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &states).unwrap();
            states = next;
        }
        let window = &states.history["fc0"];
        assert_eq!(window.dims(), &[12, 5, 1]);
        let first_entry = window.get(0).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first_entry, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn stream_state_is_created_on_demand() {
        let fx = fixture(&small_config(MetaMethod::MambaStream, false));
        natural_gradients(&fx.net);
        let (_, states) =
            generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default())
                .unwrap();
        match &states.hidden["fc1"] {
            MetaState::Ssm(s) => assert_eq!(s.ssm.dims(), &[6, 2, 2]),
            MetaState::Lstm(_) => panic!("expected state-space state"),
        }
    }

    #[test]
    fn missing_bias_gradient_is_fatal() {
        let fx = fixture(&small_config(MetaMethod::MultiFc, true));
        natural_gradients(&fx.net);
        let layer = fx.net.layer(0).unwrap();
        layer.record_gradients(layer.quantized_grads().unwrap(), None);
        let res = generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default());
        assert!(res.is_err());
    }

    #[test]
    fn lora_layers_yield_two_slots() {
        let config = MetaQuantConfig {
            lora_rank: Some(2),
            ..small_config(MetaMethod::LstmWeight, false)
        };
        let fx = fixture(&config);
        natural_gradients(&fx.net);
        let (map, states) =
            generate_meta_gradients(&fx.meta, &fx.net, &fx.opts, &LayerStates::default())
                .unwrap();
        let (a, b) = map["fc0"].weight_grad.low_rank().unwrap();
        assert_eq!(a.dims(), &[3, 2]);
        assert_eq!(b.dims(), &[2, 4]);
        assert!(states.hidden.contains_key("fc0.lora_a"));
        assert!(states.hidden.contains_key("fc0.lora_b"));
    }
}
