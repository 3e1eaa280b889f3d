//! # metaquant-core: Layers and Networks
//!
//! Everything that runs inside a training step's forward/backward pass:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | STE primitives, dorefa / BWN / BWN-F, gradient [`Calibration`] |
//! | [`layer`] | [`MetaQuantLayer`] (linear / conv2d / LoRA), meta-gradient records |
//! | [`network`] | [`PrimaryNet`] (MLP, CIFAR ResNet), [`LayerRegistry`] |
//! | [`meta`] | [`MetaNet`] strategies: FC, LSTM, state-space, scalar scale |
//! | [`mamba`] | [`SelectiveSsm`] block with window and stream modes |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **`Send + Sync`-safe.** Per-step layer fields use `parking_lot::Mutex`.
//! 3. **No hooks.** Gradients w.r.t. quantized weights are read from the
//!    `GradStore` after `backward()` through per-layer capture handles.

pub mod layer;
pub mod mamba;
pub mod meta;
pub mod network;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use layer::{
    detach_map, ConvParams, GradSlot, LayerArgs, LayerGrad, LayerKind, LayerObservation,
    MetaGradMap, MetaGradRecord, MetaQuantLayer, MOMENTUM_DECAY,
};
pub use mamba::{SelectiveSsm, SsmState};
pub use meta::{LstmState, MetaFc, MetaLstm, MetaNet, MetaState};
pub use network::{
    build_network, count_params, CompressionStats, ForwardArgs, LayerRegistry, PrimaryNet,
};
pub use quantize::{quantize_weight, Calibration, Quantized};
