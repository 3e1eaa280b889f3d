//! # metaquant-train: The Gradient-Substitution Loop
//!
//! Everything between two forward passes of the primary network:
//!
//! * **[`generate_meta_gradients`]**: runs the meta-network over every
//!   quantized layer's captured gradient and threads per-layer state.
//! * **[`assign_meta_gradients`]** / **[`update_parameters`]**: write
//!   `calibration * meta_gradient` into the gradient store and apply
//!   `param -= lr * grad` without an optimiser.
//! * **[`MetaTrainer`]**: owns both networks, the meta AdamW and the
//!   schedule. One call to [`MetaTrainer::step`] runs the full sequence.
//! * **[`LrScheduler`]**: per-epoch step / cosine / constant decay.

pub mod orchestrator;
pub mod scheduler;
pub mod trainer;
pub mod update;

pub use orchestrator::{generate_meta_gradients, GenerationOptions, LayerStates};
pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{EpochMetrics, EvalMetrics, MetaTrainer, StepMetrics, TrainerConfig};
pub use update::{assign_meta_gradients, retain_trainable_grads, update_parameters};
