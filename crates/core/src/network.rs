//! Primary networks built from [`MetaQuantLayer`]s.
//!
//! Supports: a flat MLP over flattened images and the CIFAR ResNet family
//! (`6n + 2` layers, option-A zero-pad shortcuts, BatchNorm). Every
//! convolution and fully-connected layer is meta-quantized; BatchNorm stays
//! full precision.
//!
//! Layers are registered once, in forward order, through a [`LayerRegistry`].
//! The registry hands out `(name, index)` pairs and the finished network
//! verifies that the registered count equals the number of layers it walks.

use candle_core::{backprop::GradStore, bail, Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT, VarBuilder};

use metaquant_common::{MetaQuantConfig, ModelKind, QuantScheme};

use crate::layer::{ConvParams, LayerArgs, MetaGradMap, MetaQuantLayer};

// ── Registration ────────────────────────────────────────────────────────────

/// Ordered `(name, index)` list filled while a network is built.
#[derive(Debug, Default)]
pub struct LayerRegistry {
    entries: Vec<(String, usize)>,
}

impl LayerRegistry {
    /// Register `name` and return its index.
    pub fn register(&mut self, name: &str) -> Result<usize> {
        if self.entries.iter().any(|(n, _)| n == name) {
            bail!("layer '{name}' registered twice");
        }
        let idx = self.entries.len();
        self.entries.push((name.to_string(), idx));
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, usize)] {
        &self.entries
    }
}

// ── Forward arguments ───────────────────────────────────────────────────────

/// Per-step forward arguments shared by every layer.
#[derive(Debug, Clone, Copy)]
pub struct ForwardArgs<'a> {
    pub scheme: QuantScheme,
    pub meta_grads: Option<&'a MetaGradMap>,
    pub slow_grads: Option<&'a MetaGradMap>,
    pub lr: f64,
    /// BatchNorm mode.
    pub train: bool,
}

impl<'a> ForwardArgs<'a> {
    /// Evaluation: no meta-gradients, BatchNorm in inference mode.
    pub fn eval(scheme: QuantScheme) -> Self {
        Self {
            scheme,
            meta_grads: None,
            slow_grads: None,
            lr: 0.0,
            train: false,
        }
    }

    fn layer_args(&self, layer: &MetaQuantLayer) -> LayerArgs<'a> {
        LayerArgs {
            scheme: self.scheme,
            meta_grad: self.meta_grads.and_then(|m| m.get(layer.name())),
            slow_grad: self.slow_grads.and_then(|m| m.get(layer.name())),
            lr: self.lr,
        }
    }
}

// ── ResNet pieces ───────────────────────────────────────────────────────────

enum Shortcut {
    Identity,
    /// Spatial subsample by 2 and zero-pad `pad` channels on each side.
    Pad { pad: usize },
}

struct BasicBlock {
    conv1: usize,
    bn1: BatchNorm,
    conv2: usize,
    bn2: BatchNorm,
    shortcut: Shortcut,
}

struct ResNetBody {
    stem: usize,
    stem_bn: BatchNorm,
    blocks: Vec<BasicBlock>,
    fc: usize,
}

enum Body {
    Mlp { hidden: usize },
    ResNet(ResNetBody),
}

// ── PrimaryNet ──────────────────────────────────────────────────────────────

/// The network being quantized and trained with meta-gradients.
pub struct PrimaryNet {
    layers: Vec<MetaQuantLayer>,
    registry: LayerRegistry,
    body: Body,
    kind: ModelKind,
}

/// Build the primary network described by `config`.
pub fn build_network(config: &MetaQuantConfig, vb: VarBuilder) -> Result<PrimaryNet> {
    let mut registry = LayerRegistry::default();
    let (layers, body) = match config.model.resnet_blocks() {
        None => build_mlp(config, &mut registry, &vb)?,
        Some(n) => build_resnet(config, n, &mut registry, &vb)?,
    };
    let net = PrimaryNet {
        layers,
        registry,
        body,
        kind: config.model,
    };
    let walked = net.count_layers();
    if walked != net.registry.len() || walked != net.layers.len() {
        bail!(
            "registered {} layers but the network contains {walked}",
            net.registry.len()
        );
    }
    tracing::info!(
        model = config.model.as_str(),
        layers = walked,
        quantize = config.quantize.as_str(),
        bit_w = config.bit_w,
        "Built primary network"
    );
    Ok(net)
}

fn build_mlp(
    config: &MetaQuantConfig,
    registry: &mut LayerRegistry,
    vb: &VarBuilder,
) -> Result<(Vec<MetaQuantLayer>, Body)> {
    let mut dims = vec![config.input_dim()];
    dims.extend(config.mlp_hidden.iter().copied());
    dims.push(config.num_classes);
    let mut layers = Vec::with_capacity(dims.len() - 1);
    for (i, pair) in dims.windows(2).enumerate() {
        let name = format!("fc{i}");
        let idx = registry.register(&name)?;
        layers.push(MetaQuantLayer::linear(
            &name,
            idx,
            pair[0],
            pair[1],
            config.mlp_bias,
            config.bit_w,
            config.lora_rank,
            vb.pp(&name),
        )?);
    }
    Ok((
        layers,
        Body::Mlp {
            hidden: config.mlp_hidden.len(),
        },
    ))
}

fn build_resnet(
    config: &MetaQuantConfig,
    blocks_per_stage: usize,
    registry: &mut LayerRegistry,
    vb: &VarBuilder,
) -> Result<(Vec<MetaQuantLayer>, Body)> {
    let bn_cfg = BatchNormConfig::default();
    let mut layers = Vec::new();
    let mut conv = |name: &str, cin: usize, cout: usize, stride: usize| -> Result<usize> {
        let idx = registry.register(name)?;
        layers.push(MetaQuantLayer::conv2d(
            name,
            idx,
            cin,
            cout,
            ConvParams::new(3, stride, 1),
            false,
            config.bit_w,
            config.lora_rank,
            vb.pp(name),
        )?);
        Ok(idx)
    };

    let in_channels = config.input_shape[0];
    let stem = conv("conv1", in_channels, 16, 1)?;
    let stem_bn = batch_norm(16, bn_cfg, vb.pp("bn1"))?;

    let mut blocks = Vec::with_capacity(3 * blocks_per_stage);
    let mut in_planes = 16;
    for (stage, planes) in [16usize, 32, 64].into_iter().enumerate() {
        for b in 0..blocks_per_stage {
            let stride = if stage > 0 && b == 0 { 2 } else { 1 };
            let prefix = format!("layer{}.{b}", stage + 1);
            let conv1 = conv(&format!("{prefix}.conv1"), in_planes, planes, stride)?;
            let bn1 = batch_norm(planes, bn_cfg, vb.pp(format!("{prefix}.bn1")))?;
            let conv2 = conv(&format!("{prefix}.conv2"), planes, planes, 1)?;
            let bn2 = batch_norm(planes, bn_cfg, vb.pp(format!("{prefix}.bn2")))?;
            let shortcut = if stride != 1 || in_planes != planes {
                Shortcut::Pad {
                    pad: (planes - in_planes) / 2,
                }
            } else {
                Shortcut::Identity
            };
            blocks.push(BasicBlock {
                conv1,
                bn1,
                conv2,
                bn2,
                shortcut,
            });
            in_planes = planes;
        }
    }

    let fc_idx = registry.register("fc")?;
    layers.push(MetaQuantLayer::linear(
        "fc",
        fc_idx,
        64,
        config.num_classes,
        true,
        config.bit_w,
        config.lora_rank,
        vb.pp("fc"),
    )?);

    Ok((
        layers,
        Body::ResNet(ResNetBody {
            stem,
            stem_bn,
            blocks,
            fc: fc_idx,
        }),
    ))
}

impl PrimaryNet {
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// `(name, index)` of every quantized layer in registration order.
    pub fn layer_name_list(&self) -> &[(String, usize)] {
        self.registry.entries()
    }

    pub fn layer(&self, idx: usize) -> Option<&MetaQuantLayer> {
        self.layers.get(idx)
    }

    pub fn layers(&self) -> &[MetaQuantLayer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Walk the architecture and count the quantized layers it uses.
    fn count_layers(&self) -> usize {
        match &self.body {
            Body::Mlp { hidden } => hidden + 1,
            Body::ResNet(r) => 2 + 2 * r.blocks.len(),
        }
    }

    fn run(&self, idx: usize, x: &Tensor, args: &ForwardArgs) -> Result<Tensor> {
        let layer = &self.layers[idx];
        layer.forward(x, &args.layer_args(layer))
    }

    /// Logits `(B, num_classes)` for images `(B, C, H, W)`.
    pub fn forward(&self, x: &Tensor, args: &ForwardArgs) -> Result<Tensor> {
        match &self.body {
            Body::Mlp { .. } => {
                let mut h = x.flatten_from(1)?;
                let last = self.layers.len() - 1;
                for idx in 0..self.layers.len() {
                    h = self.run(idx, &h, args)?;
                    if idx != last {
                        h = h.relu()?;
                    }
                }
                Ok(h)
            }
            Body::ResNet(r) => {
                let h = self.run(r.stem, x, args)?;
                let mut h = r.stem_bn.forward_t(&h, args.train)?.relu()?;
                for block in &r.blocks {
                    h = self.block_forward(block, &h, args)?;
                }
                let pooled = h.mean((2, 3))?;
                self.run(r.fc, &pooled, args)
            }
        }
    }

    fn block_forward(&self, block: &BasicBlock, x: &Tensor, args: &ForwardArgs) -> Result<Tensor> {
        let h = self.run(block.conv1, x, args)?;
        let h = block.bn1.forward_t(&h, args.train)?.relu()?;
        let h = self.run(block.conv2, &h, args)?;
        let h = block.bn2.forward_t(&h, args.train)?;
        let shortcut = match block.shortcut {
            Shortcut::Identity => x.clone(),
            Shortcut::Pad { pad } => subsample(x)?.pad_with_zeros(1, pad, pad)?,
        };
        (h + shortcut)?.relu()
    }

    /// Deposit captured gradients into every layer. Returns how many layers
    /// received one.
    pub fn capture_grads(&self, grads: &GradStore) -> usize {
        self.layers.iter().filter(|l| l.capture_grads(grads)).count()
    }

    /// Parameter counts and storage cost of the quantized weights.
    pub fn compression_stats(&self, total_params: usize, scheme: QuantScheme) -> CompressionStats {
        let quantized: usize = self.layers.iter().map(|l| l.weight().elem_count()).sum();
        let trainable = self.layers.iter().map(|l| l.num_params()).sum();
        let bits_quantized = match scheme {
            QuantScheme::Dorefa => self.layers.first().map_or(32, |l| l.bit_w().min(32)) as f64,
            QuantScheme::Bwn | QuantScheme::BwnF => 1.0,
            QuantScheme::FullPrecision => 32.0,
        };
        let bits_full = 32.0;
        let total = total_params.max(quantized);
        let effective_bits = (quantized as f64 * bits_quantized
            + total.saturating_sub(quantized) as f64 * bits_full)
            / total.max(1) as f64;
        CompressionStats {
            total_params: total,
            quantized_params: quantized,
            trainable_layer_params: trainable,
            effective_bits_per_param: effective_bits,
            compression_ratio_vs_f32: bits_full / effective_bits.max(f64::EPSILON),
        }
    }
}

/// `x[:, :, ::2, ::2]`.
fn subsample(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let rows = Tensor::arange_step(0u32, h as u32, 2, x.device())?;
    let cols = Tensor::arange_step(0u32, w as u32, 2, x.device())?;
    x.index_select(&rows, 2)?.index_select(&cols, 3)
}

// ── Compression Stats ───────────────────────────────────────────────────────

/// Parameter counts and effective storage bits of a built network.
#[derive(Debug, Clone)]
pub struct CompressionStats {
    pub total_params: usize,
    pub quantized_params: usize,
    /// Parameters the manual update moves inside quantized layers (LoRA
    /// factors instead of the frozen base weight, plus biases).
    pub trainable_layer_params: usize,
    /// Effective bits per weight: (quant×bits + full×32) / total.
    pub effective_bits_per_param: f64,
    /// Compression ratio vs FP32.
    pub compression_ratio_vs_f32: f64,
}

/// Sum of element counts over every variable of a map.
pub fn count_params(varmap: &candle_nn::VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn mlp_config() -> MetaQuantConfig {
        MetaQuantConfig {
            model: ModelKind::Mlp,
            num_classes: 3,
            input_shape: [1, 2, 2],
            mlp_hidden: vec![5],
            ..Default::default()
        }
    }

    #[test]
    fn mlp_registers_layers_in_order() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = build_network(&mlp_config(), vb).unwrap();
        let names: Vec<_> = net.layer_name_list().iter().map(|(n, i)| (n.as_str(), *i)).collect();
        assert_eq!(names, vec![("fc0", 0), ("fc1", 1)]);
        let x = Tensor::ones((4, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let y = net.forward(&x, &ForwardArgs::eval(QuantScheme::Dorefa)).unwrap();
        assert_eq!(y.dims(), &[4, 3]);
    }

    #[test]
    fn resnet20_has_twenty_quantized_layers() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MetaQuantConfig {
            input_shape: [3, 8, 8],
            ..Default::default()
        };
        let net = build_network(&config, vb).unwrap();
        assert_eq!(net.num_layers(), 20);
        assert_eq!(net.layer_name_list()[0].0, "conv1");
        assert_eq!(net.layer_name_list()[19].0, "fc");
        assert!(net.layer(19).unwrap().has_bias());
        assert!(!net.layer(0).unwrap().has_bias());

        let x = Tensor::ones((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let args = ForwardArgs {
            train: true,
            ..ForwardArgs::eval(QuantScheme::Bwn)
        };
        let y = net.forward(&x, &args).unwrap();
        assert_eq!(y.dims(), &[2, 10]);
        let grads = y.sum_all().unwrap().backward().unwrap();
        assert_eq!(net.capture_grads(&grads), 20);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reg = LayerRegistry::default();
        reg.register("a").unwrap();
        assert!(reg.register("a").is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn subsample_takes_even_positions() {
        let x = Tensor::arange(0f32, 16.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let s = subsample(&x).unwrap();
        assert_eq!(
            s.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 2.0, 8.0, 10.0]
        );
    }

    #[test]
    fn one_bit_compression() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MetaQuantConfig {
            mlp_bias: false,
            ..mlp_config()
        };
        let net = build_network(&config, vb).unwrap();
        let stats = net.compression_stats(count_params(&varmap), QuantScheme::Dorefa);
        assert_eq!(stats.total_params, stats.quantized_params);
        assert_eq!(stats.trainable_layer_params, stats.quantized_params);
        assert!((stats.compression_ratio_vs_f32 - 32.0).abs() < 1e-9);
    }

    #[test]
    fn lora_layers_train_only_their_factors() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MetaQuantConfig {
            mlp_bias: false,
            lora_rank: Some(1),
            ..mlp_config()
        };
        let net = build_network(&config, vb).unwrap();
        let stats = net.compression_stats(count_params(&varmap), QuantScheme::Dorefa);
        // 4 → 5 → 3: base weights 20 + 15, factors (5 + 4) + (3 + 5).
        assert_eq!(stats.quantized_params, 35);
        assert_eq!(stats.trainable_layer_params, 17);
    }
}
