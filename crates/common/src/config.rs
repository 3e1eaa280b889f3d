//! Experiment configuration for meta-quant.
//!
//! Serialised as JSON next to checkpoints. Every field has a default so a
//! minimal `{}` JSON produces a working ResNet-20 / dorefa / multi-FC run.
//!
//! Every string-valued choice (model, quantisation scheme, meta method,
//! nonlinearity) is parsed into a closed enum when the config is read. An
//! unknown name is a configuration error and is raised before any training
//! step runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Enumerated choices ──────────────────────────────────────────────────────

/// Primary network architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Stack of quantized fully-connected layers over flattened input.
    #[serde(rename = "mlp")]
    Mlp,
    #[serde(rename = "resnet20")]
    ResNet20,
    #[serde(rename = "resnet32")]
    ResNet32,
    #[serde(rename = "resnet44")]
    ResNet44,
    #[serde(rename = "resnet56")]
    ResNet56,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mlp => "mlp",
            Self::ResNet20 => "resnet20",
            Self::ResNet32 => "resnet32",
            Self::ResNet44 => "resnet44",
            Self::ResNet56 => "resnet56",
        }
    }

    /// Basic blocks per stage for the CIFAR ResNet family (`6n + 2` layers).
    pub fn resnet_blocks(&self) -> Option<usize> {
        match self {
            Self::Mlp => None,
            Self::ResNet20 => Some(3),
            Self::ResNet32 => Some(5),
            Self::ResNet44 => Some(7),
            Self::ResNet56 => Some(9),
        }
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mlp" => Ok(Self::Mlp),
            "resnet20" => Ok(Self::ResNet20),
            "resnet32" => Ok(Self::ResNet32),
            "resnet44" => Ok(Self::ResNet44),
            "resnet56" => Ok(Self::ResNet56),
            other => anyhow::bail!("unknown model '{other}'"),
        }
    }
}

/// Weight quantisation scheme applied inside every quantized layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantScheme {
    /// `tanh` normalisation followed by k-bit uniform quantisation.
    #[serde(rename = "dorefa")]
    Dorefa,
    /// Binary weights scaled by the layer-wide `mean(|w|)`.
    #[serde(rename = "bwn")]
    Bwn,
    /// Binary weights scaled per output channel.
    #[serde(rename = "bwn-f")]
    BwnF,
    /// No quantisation.
    #[serde(rename = "none")]
    FullPrecision,
}

impl QuantScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dorefa => "dorefa",
            Self::Bwn => "bwn",
            Self::BwnF => "bwn-f",
            Self::FullPrecision => "none",
        }
    }
}

impl FromStr for QuantScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dorefa" => Ok(Self::Dorefa),
            "bwn" => Ok(Self::Bwn),
            "bwn-f" => Ok(Self::BwnF),
            "none" | "fp" | "full" => Ok(Self::FullPrecision),
            other => anyhow::bail!("unknown quantization scheme '{other}'"),
        }
    }
}

/// Meta-network strategy tag. Closed set: the orchestrator dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetaMethod {
    /// `f(grad)`.
    FcGrad,
    /// `grad * f(weight)`.
    MultiFc,
    /// `grad * f(weight, h)`.
    LstmWeight,
    /// `grad * f(grad, h)`.
    LstmGrad,
    /// `grad * f(weight ⊕ grad, h)`.
    LstmMerge,
    /// `grad * f(ema(grad), h)`.
    LstmMomentum,
    /// Last-step output of a state-space model over a trailing gradient window.
    MambaHistory,
    /// One-step state-space recurrence over the current gradient.
    MambaStream,
    /// `alpha * grad`.
    ConstantScale,
}

impl MetaMethod {
    pub const ALL: [MetaMethod; 9] = [
        Self::FcGrad,
        Self::MultiFc,
        Self::LstmWeight,
        Self::LstmGrad,
        Self::LstmMerge,
        Self::LstmMomentum,
        Self::MambaHistory,
        Self::MambaStream,
        Self::ConstantScale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FcGrad => "fc-grad",
            Self::MultiFc => "multi-fc",
            Self::LstmWeight => "lstm-weight",
            Self::LstmGrad => "lstm-grad",
            Self::LstmMerge => "lstm-merge",
            Self::LstmMomentum => "lstm-momentum",
            Self::MambaHistory => "mamba-history",
            Self::MambaStream => "mamba-stream",
            Self::ConstantScale => "constant-scale",
        }
    }

    /// Whether the method carries per-layer recurrent state between steps.
    pub fn is_recurrent(&self) -> bool {
        matches!(
            self,
            Self::LstmWeight
                | Self::LstmGrad
                | Self::LstmMerge
                | Self::LstmMomentum
                | Self::MambaStream
        )
    }
}

impl fmt::Display for MetaMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetaMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
                anyhow::anyhow!("unknown meta method '{s}' (expected one of {known:?})")
            })
    }
}

/// Nonlinearity placed between the FC layers of a meta-network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetaNonlinear {
    #[default]
    None,
    Relu,
    Tanh,
}

impl FromStr for MetaNonlinear {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "relu" => Ok(Self::Relu),
            "tanh" => Ok(Self::Tanh),
            other => anyhow::bail!("unknown nonlinearity '{other}'"),
        }
    }
}

// ── Meta-network config ─────────────────────────────────────────────────────

/// Hyper-parameters of the meta-network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaNetConfig {
    #[serde(default = "default_method")]
    pub method: MetaMethod,
    /// Hidden width of FC layers and of the LSTM.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Number of FC layers for `multi-fc` (`fc-grad` always uses 2).
    #[serde(default = "default_num_fc")]
    pub num_fc: usize,
    #[serde(default)]
    pub nonlinear: MetaNonlinear,
    /// State-space model: state size per channel.
    #[serde(default = "default_d_state")]
    pub d_state: usize,
    /// State-space model: causal convolution width.
    #[serde(default = "default_d_conv")]
    pub d_conv: usize,
    /// State-space model: inner expansion factor.
    #[serde(default = "default_expand")]
    pub expand: usize,
    /// Number of trailing gradients kept for `mamba-history`.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Initial value of `alpha` for `constant-scale`.
    #[serde(default = "default_scale_init")]
    pub scale_init: f64,
}

// ── Experiment config ───────────────────────────────────────────────────────

/// Complete configuration of one meta-quantisation experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaQuantConfig {
    #[serde(default = "default_model")]
    pub model: ModelKind,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Input image shape `(channels, height, width)`.
    #[serde(default = "default_input_shape")]
    pub input_shape: [usize; 3],
    /// Weight bit-width used by the dorefa quantiser.
    #[serde(default = "default_bit_w")]
    pub bit_w: u32,
    #[serde(default = "default_quantize")]
    pub quantize: QuantScheme,
    /// Hidden widths of the MLP primary network (ignored for ResNets).
    #[serde(default = "default_mlp_hidden")]
    pub mlp_hidden: Vec<usize>,
    /// Whether MLP layers carry a bias.
    #[serde(default = "default_true")]
    pub mlp_bias: bool,
    /// Rank of the LoRA factors attached to every quantized layer (None = off).
    #[serde(default)]
    pub lora_rank: Option<usize>,
    #[serde(default = "default_meta")]
    pub meta: MetaNetConfig,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_method() -> MetaMethod {
    MetaMethod::MultiFc
}
fn default_hidden_size() -> usize {
    100
}
fn default_num_fc() -> usize {
    3
}
fn default_d_state() -> usize {
    16
}
fn default_d_conv() -> usize {
    4
}
fn default_expand() -> usize {
    100
}
fn default_history_window() -> usize {
    5
}
fn default_scale_init() -> f64 {
    1.0
}
fn default_model() -> ModelKind {
    ModelKind::ResNet20
}
fn default_num_classes() -> usize {
    10
}
fn default_input_shape() -> [usize; 3] {
    [3, 32, 32]
}
fn default_bit_w() -> u32 {
    1
}
fn default_quantize() -> QuantScheme {
    QuantScheme::Dorefa
}
fn default_mlp_hidden() -> Vec<usize> {
    vec![256, 128]
}
fn default_true() -> bool {
    true
}
fn default_meta() -> MetaNetConfig {
    MetaNetConfig::default()
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for MetaNetConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            hidden_size: default_hidden_size(),
            num_fc: default_num_fc(),
            nonlinear: MetaNonlinear::None,
            d_state: default_d_state(),
            d_conv: default_d_conv(),
            expand: default_expand(),
            history_window: default_history_window(),
            scale_init: default_scale_init(),
        }
    }
}

impl Default for MetaQuantConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            num_classes: default_num_classes(),
            input_shape: default_input_shape(),
            bit_w: default_bit_w(),
            quantize: default_quantize(),
            mlp_hidden: default_mlp_hidden(),
            mlp_bias: true,
            lora_rank: None,
            meta: MetaNetConfig::default(),
        }
    }
}

impl MetaQuantConfig {
    /// Flattened input width (`C * H * W`), used by the MLP.
    pub fn input_dim(&self) -> usize {
        self.input_shape.iter().product()
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot be built.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bit_w == 0 {
            anyhow::bail!("bit_w must be at least 1");
        }
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be positive");
        }
        if self.meta.history_window == 0 {
            anyhow::bail!("meta.history_window must be positive");
        }
        if self.meta.method == MetaMethod::MultiFc && self.meta.num_fc == 0 {
            anyhow::bail!("meta.num_fc must be positive for multi-fc");
        }
        if self.lora_rank == Some(0) {
            anyhow::bail!("lora_rank must be positive when set");
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
