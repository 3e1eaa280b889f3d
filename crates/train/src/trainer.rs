//! Trainer: the gradient-substitution training loop.
//!
//! Owns both parameter sets. The primary network is updated manually with
//! meta-gradients; the meta-network has its own AdamW and learns by
//! backpropagating the primary loss through the meta-weight subtraction.
//!
//! Per step:
//!
//! 1. (every step but the first) generate meta-gradients from the previous
//!    step's captured gradients;
//! 2. forward with the meta-gradient map, cross-entropy, backward;
//! 3. capture per-layer gradients for the next step;
//! 4. meta optimiser step (skipped while the meta-network is frozen);
//! 5. write `calibration * meta_gradient` into the gradient store and apply
//!    `param -= lr * grad`. The very first step uses the raw gradients.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use metaquant_common::{batch_to_tensors, BatchDataset, MetaQuantConfig};
use metaquant_core::{
    build_network, count_params, detach_map, ForwardArgs, MetaGradMap, MetaNet, PrimaryNet,
};

use crate::orchestrator::{generate_meta_gradients, GenerationOptions, LayerStates};
use crate::scheduler::{LrDecay, LrScheduler};
use crate::update::{assign_meta_gradients, retain_trainable_grads, update_parameters};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Primary-network learning rate (manual update).
    pub lr: f64,
    pub lr_min: f64,
    pub lr_decay: LrDecay,
    /// Meta-network AdamW learning rate.
    pub meta_lr: f64,
    pub meta_weight_decay: f64,
    /// Freeze the meta-network for the whole run.
    pub fix_meta: bool,
    /// Freeze the meta-network from this epoch on.
    pub fix_meta_epoch: Option<usize>,
    /// Blend each meta-weight update with the previous step's meta-gradients.
    pub momentum_blend: bool,
    pub log_every: usize,
    /// Cap on evaluation batches (None = full test set).
    pub eval_batches: Option<usize>,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_epochs: 100,
            lr: 1e-2,
            lr_min: 0.0,
            lr_decay: LrDecay::Step {
                every: 30,
                gamma: 0.1,
            },
            meta_lr: 1e-2,
            meta_weight_decay: 0.0,
            fix_meta: false,
            fix_meta_epoch: None,
            momentum_blend: false,
            log_every: 50,
            eval_batches: None,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub accuracy: f64,
    pub lr: f64,
    /// Whether the primary update used meta-gradients (false on the first step).
    pub meta_applied: bool,
    pub updated_vars: usize,
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub lr: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub test_top5_accuracy: f64,
    pub best_test_accuracy: f64,
    pub meta_frozen: bool,
}

/// Result of [`MetaTrainer::evaluate`].
#[derive(Debug, Clone, Copy)]
pub struct EvalMetrics {
    pub loss: f64,
    /// Top-1 accuracy.
    pub accuracy: f64,
    pub top5_accuracy: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns both networks, the meta optimiser, the
/// per-layer recurrent state and the schedule.
pub struct MetaTrainer {
    pub net: PrimaryNet,
    pub meta: MetaNet,
    pub varmap: VarMap,
    pub meta_varmap: VarMap,
    primary_vars: Vec<Var>,
    meta_optimizer: AdamW,
    states: LayerStates,
    last_meta_grads: MetaGradMap,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    model_config: MetaQuantConfig,
    pub global_step: usize,
    epoch: usize,
    best_test_accuracy: Option<f64>,
    device: Device,
}

impl MetaTrainer {
    /// Build both networks from config.
    pub fn new(
        model_config: MetaQuantConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        model_config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = build_network(&model_config, vb)?;
        let primary_vars = varmap.all_vars();

        let meta_varmap = VarMap::new();
        let meta_vb = VarBuilder::from_varmap(&meta_varmap, DType::F32, &device);
        let meta = MetaNet::for_method(&model_config.meta, meta_vb)?;

        let stats = net.compression_stats(count_params(&varmap), model_config.quantize);
        tracing::info!(
            total_params = stats.total_params,
            quantized_params = stats.quantized_params,
            trainable_layer_params = stats.trainable_layer_params,
            meta_params = count_params(&meta_varmap),
            effective_bits = format!("{:.2}", stats.effective_bits_per_param),
            compression = format!("{:.2}x", stats.compression_ratio_vs_f32),
            "Model compression stats"
        );

        tracing::info!(
            method = %model_config.meta.method,
            meta = meta.kind(),
            recurrent = model_config.meta.method.is_recurrent(),
            "Built meta-network"
        );

        let meta_optimizer = AdamW::new(
            meta_varmap.all_vars(),
            ParamsAdamW {
                lr: trainer_config.meta_lr,
                weight_decay: trainer_config.meta_weight_decay,
                ..Default::default()
            },
        )?;

        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.max_epochs,
            trainer_config.lr_decay,
        );

        Ok(Self {
            net,
            meta,
            varmap,
            meta_varmap,
            primary_vars,
            meta_optimizer,
            states: LayerStates::default(),
            last_meta_grads: MetaGradMap::new(),
            lr_scheduler,
            config: trainer_config,
            model_config,
            global_step: 0,
            epoch: 0,
            best_test_accuracy: None,
            device,
        })
    }

    /// Load primary-network weights (safetensors) before training.
    pub fn load_pretrained(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap.load(path)?;
        tracing::info!(path = %path.display(), "Loaded pretrained primary weights");
        Ok(())
    }

    /// Whether the meta-network is frozen in the current epoch.
    pub fn meta_frozen(&self) -> bool {
        self.config.fix_meta || self.config.fix_meta_epoch.is_some_and(|e| self.epoch >= e)
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_scheduler.lr_at(self.epoch)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn layer_states(&self) -> &LayerStates {
        &self.states
    }

    /// Meta-gradients used by the most recent step (detached).
    pub fn last_meta_grads(&self) -> &MetaGradMap {
        &self.last_meta_grads
    }

    pub fn best_test_accuracy(&self) -> Option<f64> {
        self.best_test_accuracy
    }

    /// Execute one training step on a raw batch.
    pub fn step(&mut self, pixels: &[f32], labels: &[u32]) -> anyhow::Result<StepMetrics> {
        let (images, labels) =
            batch_to_tensors(pixels, labels, self.model_config.input_shape, &self.device)?;
        let lr = self.current_lr();
        let frozen = self.meta_frozen();

        // Meta-gradients from the previous step's captured gradients.
        let meta_grads = if self.global_step == 0 {
            MetaGradMap::new()
        } else {
            let opts = GenerationOptions {
                method: self.model_config.meta.method,
                fix_meta: frozen,
                history_window: self.model_config.meta.history_window,
            };
            let (map, states) = generate_meta_gradients(&self.meta, &self.net, &opts, &self.states)?;
            self.states = states;
            map
        };
        let slow = (self.config.momentum_blend && !self.last_meta_grads.is_empty())
            .then_some(&self.last_meta_grads);

        let args = ForwardArgs {
            scheme: self.model_config.quantize,
            meta_grads: (!meta_grads.is_empty()).then_some(&meta_grads),
            slow_grads: slow,
            lr,
            train: true,
        };
        let logits = self.net.forward(&images, &args)?;
        let loss = loss::cross_entropy(&logits, &labels)?;
        let loss_val = loss.to_scalar::<f32>()?;
        let accuracy = topk_accuracy(&logits, &labels, 1)?;

        let mut grads = loss.backward()?;
        let captured = self.net.capture_grads(&grads);
        if captured != self.net.num_layers() {
            tracing::warn!(
                captured,
                layers = self.net.num_layers(),
                "Some layers recorded no gradient"
            );
        }

        if !frozen {
            self.meta_optimizer.step(&grads)?;
        }

        let meta_applied = !meta_grads.is_empty();
        if meta_applied {
            assign_meta_gradients(&self.net, &meta_grads, &mut grads)?;
        } else {
            retain_trainable_grads(&self.net, &mut grads);
        }
        let updated_vars = update_parameters(&self.primary_vars, &grads, lr)?;

        self.last_meta_grads = detach_map(&meta_grads);
        let step = self.global_step;
        self.global_step += 1;

        if self.config.log_every > 0 && step % self.config.log_every == 0 {
            tracing::info!(
                step,
                epoch = self.epoch,
                loss = loss_val,
                accuracy = format!("{:.3}", accuracy),
                lr,
                meta_applied,
                frozen,
                "Train step"
            );
        }

        Ok(StepMetrics {
            step,
            loss: loss_val,
            accuracy,
            lr,
            meta_applied,
            updated_vars,
        })
    }

    /// One pass over `train_ds`, then evaluation on `test_ds`.
    ///
    /// `on_step` observes every step (progress bars, metric files).
    pub fn train_epoch(
        &mut self,
        train_ds: &impl BatchDataset,
        test_ds: &impl BatchDataset,
        mut on_step: impl FnMut(&StepMetrics),
    ) -> anyhow::Result<EpochMetrics> {
        let lr = self.current_lr();
        let frozen = self.meta_frozen();
        tracing::info!(epoch = self.epoch, lr, meta_frozen = frozen, "Starting epoch");

        let mut loss_sum = 0.0f64;
        let mut acc_sum = 0.0f64;
        let mut steps = 0usize;
        for (pixels, labels) in train_ds.batches(self.config.batch_size, true) {
            let metrics = self.step(&pixels, &labels)?;
            loss_sum += metrics.loss as f64;
            acc_sum += metrics.accuracy;
            steps += 1;
            on_step(&metrics);
        }
        if steps == 0 {
            anyhow::bail!(
                "training set has fewer samples ({}) than one batch ({})",
                train_ds.len(),
                self.config.batch_size
            );
        }

        let eval = self.evaluate(test_ds)?;
        let test_accuracy = eval.accuracy;
        let best = self
            .best_test_accuracy
            .map_or(test_accuracy, |b| b.max(test_accuracy));
        let improved = self.best_test_accuracy.map_or(true, |b| test_accuracy > b);
        self.best_test_accuracy = Some(best);

        let metrics = EpochMetrics {
            epoch: self.epoch,
            lr,
            train_loss: loss_sum / steps as f64,
            train_accuracy: acc_sum / steps as f64,
            test_loss: eval.loss,
            test_accuracy,
            test_top5_accuracy: eval.top5_accuracy,
            best_test_accuracy: best,
            meta_frozen: frozen,
        };
        tracing::info!(
            epoch = metrics.epoch,
            train_loss = format!("{:.4}", metrics.train_loss),
            train_acc = format!("{:.3}", metrics.train_accuracy),
            test_loss = format!("{:.4}", metrics.test_loss),
            test_acc = format!("{:.3}", metrics.test_accuracy),
            test_top5 = format!("{:.3}", metrics.test_top5_accuracy),
            best_test_acc = format!("{:.3}", best),
            "Epoch finished"
        );
        if improved {
            let path = self.save_checkpoint("best")?;
            tracing::info!(path = %path.display(), "Saved best checkpoint");
        }

        self.epoch += 1;
        Ok(metrics)
    }

    /// Loss, top-1 and top-5 accuracy on every sample of `ds` (the last
    /// batch may be short): forward without meta-gradients, BatchNorm in
    /// inference mode, no backward.
    pub fn evaluate(&self, ds: &impl BatchDataset) -> anyhow::Result<EvalMetrics> {
        let mut loss_sum = 0.0f64;
        let mut top1 = 0.0f64;
        let mut top5 = 0.0f64;
        let mut seen = 0usize;
        let limit = self.config.eval_batches.unwrap_or(usize::MAX);
        let args = ForwardArgs::eval(self.model_config.quantize);

        for (pixels, labels) in ds.all_batches(self.config.batch_size).take(limit) {
            let (images, labels) =
                batch_to_tensors(&pixels, &labels, self.model_config.input_shape, &self.device)?;
            let logits = self.net.forward(&images, &args)?.detach();
            let n = labels.dim(0)?;
            let l = loss::cross_entropy(&logits, &labels)?;
            loss_sum += l.to_scalar::<f32>()? as f64 * n as f64;
            top1 += topk_accuracy(&logits, &labels, 1)? * n as f64;
            top5 += topk_accuracy(&logits, &labels, 5)? * n as f64;
            seen += n;
        }

        if seen == 0 {
            return Ok(EvalMetrics {
                loss: f64::MAX,
                accuracy: 0.0,
                top5_accuracy: 0.0,
            });
        }
        let seen = seen as f64;
        Ok(EvalMetrics {
            loss: loss_sum / seen,
            accuracy: top1 / seen,
            top5_accuracy: top5 / seen,
        })
    }

    /// Save both parameter sets and the config under `output_dir/<tag>/`.
    pub fn save_checkpoint(&self, tag: &str) -> anyhow::Result<PathBuf> {
        let dir = self.config.output_dir.join(tag);
        std::fs::create_dir_all(&dir)?;
        self.varmap.save(dir.join("primary.safetensors"))?;
        self.meta_varmap.save(dir.join("meta.safetensors"))?;
        self.model_config.save(&dir.join("config.json"))?;
        Ok(dir)
    }

    pub fn model_config(&self) -> &MetaQuantConfig {
        &self.model_config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Top-`k` accuracy of `logits (B, C)` against `labels (B,)`: a sample is a
/// hit when fewer than `k` classes score strictly above its label.
fn topk_accuracy(logits: &Tensor, labels: &Tensor, k: usize) -> candle_core::Result<f64> {
    let n = labels.dim(0)?;
    if n == 0 {
        return Ok(0.0);
    }
    let target = logits.gather(&labels.unsqueeze(1)?.contiguous()?, 1)?;
    let above = logits
        .broadcast_gt(&target)?
        .to_dtype(DType::F32)?
        .sum(1)?;
    let limit = Tensor::full(k as f32, above.dims(), above.device())?;
    let hits = above
        .lt(&limit)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as f64 / n as f64)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use metaquant_common::{MetaMethod, MetaNetConfig, ModelKind, QuantScheme, SyntheticDataset};

    fn configs(method: MetaMethod, dir: &str) -> (MetaQuantConfig, TrainerConfig) {
        let model = MetaQuantConfig {
            model: ModelKind::Mlp,
            num_classes: 3,
            input_shape: [1, 3, 3],
            mlp_hidden: vec![6],
            quantize: QuantScheme::Dorefa,
            meta: MetaNetConfig {
                method,
                hidden_size: 4,
                expand: 2,
                d_state: 2,
                scale_init: 2.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let trainer = TrainerConfig {
            batch_size: 4,
            max_epochs: 2,
            lr: 0.05,
            log_every: 0,
            output_dir: std::env::temp_dir().join(dir),
            ..Default::default()
        };
        (model, trainer)
    }

    fn batch(ds: &SyntheticDataset) -> (Vec<f32>, Vec<u32>) {
        ds.batches(4, false).next().unwrap()
    }

    #[test]
    fn first_step_trains_on_raw_gradients() {
        let (model, trainer) = configs(MetaMethod::LstmGrad, "metaquant-first-step");
        let mut t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        let ds = SyntheticDataset::new(8, 3, [1, 3, 3], 1);
        let (pixels, labels) = batch(&ds);
        let before = t.net.layer(0).unwrap().weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let m = t.step(&pixels, &labels).unwrap();
        assert_eq!(m.step, 0);
        assert!(!m.meta_applied);
        assert!(m.updated_vars > 0);
        assert!(t.layer_states().is_empty());
        assert!(t.last_meta_grads().is_empty());
        let after = t.net.layer(0).unwrap().weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(before, after);

        let m = t.step(&pixels, &labels).unwrap();
        assert!(m.meta_applied);
        assert_eq!(t.last_meta_grads().len(), 2);
        assert_eq!(t.layer_states().hidden.len(), 2);
    }

    #[test]
    fn meta_network_learns_unless_frozen() {
        let ds = SyntheticDataset::new(8, 3, [1, 3, 3], 2);
        let (pixels, labels) = batch(&ds);
        let alpha = |t: &MetaTrainer| {
            t.meta_varmap.all_vars()[0].as_tensor().to_vec1::<f32>().unwrap()[0]
        };

        let (model, trainer) = configs(MetaMethod::ConstantScale, "metaquant-meta-learns");
        let mut t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        for _ in 0..3 {
            t.step(&pixels, &labels).unwrap();
        }
        assert_ne!(alpha(&t), 2.0);

        let (model, trainer) = configs(MetaMethod::ConstantScale, "metaquant-meta-frozen");
        let trainer = TrainerConfig {
            fix_meta: true,
            ..trainer
        };
        let mut t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        for _ in 0..3 {
            t.step(&pixels, &labels).unwrap();
        }
        assert_eq!(alpha(&t), 2.0);
    }

    #[test]
    fn fix_meta_epoch_freezes_later_epochs() {
        let (model, trainer) = configs(MetaMethod::MultiFc, "metaquant-fix-epoch");
        let trainer = TrainerConfig {
            fix_meta_epoch: Some(1),
            ..trainer
        };
        let train = SyntheticDataset::new(8, 3, [1, 3, 3], 3);
        let test = SyntheticDataset::new(4, 3, [1, 3, 3], 4);
        let mut t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        let mut seen = 0;
        let e0 = t.train_epoch(&train, &test, |_| seen += 1).unwrap();
        assert_eq!(seen, 2);
        assert!(!e0.meta_frozen);
        let e1 = t.train_epoch(&train, &test, |_| {}).unwrap();
        assert!(e1.meta_frozen);
        assert!(e1.best_test_accuracy >= e0.test_accuracy);
        assert!(t.config.output_dir.join("best").join("meta.safetensors").exists());
    }

    #[test]
    fn momentum_blend_runs_with_slow_records() {
        let (model, trainer) = configs(MetaMethod::FcGrad, "metaquant-blend");
        let trainer = TrainerConfig {
            momentum_blend: true,
            ..trainer
        };
        let ds = SyntheticDataset::new(8, 3, [1, 3, 3], 5);
        let (pixels, labels) = batch(&ds);
        let mut t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        for _ in 0..3 {
            let m = t.step(&pixels, &labels).unwrap();
            assert!(m.loss.is_finite());
        }
    }

    #[test]
    fn accuracy_counts_hits() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &dev).unwrap();
        let labels = Tensor::new(&[1u32, 1, 1], &dev).unwrap();
        assert!((topk_accuracy(&logits, &labels, 1).unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(topk_accuracy(&logits, &labels, 2).unwrap(), 1.0);
    }

    #[test]
    fn top5_accepts_label_ranked_fifth() {
        let dev = Device::Cpu;
        let logits = Tensor::new(
            &[
                [6.0f32, 5.0, 4.0, 3.0, 2.0, 1.0],
                [6.0, 5.0, 4.0, 3.0, 2.0, 1.0],
            ],
            &dev,
        )
        .unwrap();
        let labels = Tensor::new(&[4u32, 5], &dev).unwrap();
        assert_eq!(topk_accuracy(&logits, &labels, 1).unwrap(), 0.0);
        assert_eq!(topk_accuracy(&logits, &labels, 5).unwrap(), 0.5);
    }

    #[test]
    fn evaluation_scores_the_trailing_partial_batch() {
        let (model, trainer) = configs(MetaMethod::FcGrad, "metaquant-eval-partial");
        let t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        // 6 samples at batch size 4: a full batch and a batch of 2.
        let ds = SyntheticDataset::new(6, 3, [1, 3, 3], 9);
        let eval = t.evaluate(&ds).unwrap();

        let args = ForwardArgs::eval(QuantScheme::Dorefa);
        let mut hits = 0.0;
        for (pixels, labels) in ds.all_batches(6) {
            let (x, y) = batch_to_tensors(&pixels, &labels, [1, 3, 3], &Device::Cpu).unwrap();
            let logits = t.net.forward(&x, &args).unwrap();
            hits += topk_accuracy(&logits, &y, 1).unwrap() * 6.0;
        }
        assert!((eval.accuracy - hits / 6.0).abs() < 1e-9);
        // 3 classes: every label is within the top 5.
        assert_eq!(eval.top5_accuracy, 1.0);
    }

    #[test]
    fn first_step_forward_matches_plain_forward() {
        let (model, trainer) = configs(MetaMethod::LstmMerge, "metaquant-first-forward");
        let mut t = MetaTrainer::new(model, trainer, Device::Cpu).unwrap();
        let ds = SyntheticDataset::new(8, 3, [1, 3, 3], 6);
        let (pixels, labels) = batch(&ds);
        let (x, y) = batch_to_tensors(&pixels, &labels, [1, 3, 3], &Device::Cpu).unwrap();

        let plain = ForwardArgs {
            scheme: QuantScheme::Dorefa,
            meta_grads: None,
            slow_grads: None,
            lr: t.current_lr(),
            train: true,
        };
        let empty = MetaGradMap::new();
        let with_empty_map = ForwardArgs {
            meta_grads: Some(&empty),
            ..plain
        };
        let a = t.net.forward(&x, &plain).unwrap();
        let b = t.net.forward(&x, &with_empty_map).unwrap();
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        let expected = loss::cross_entropy(&a, &y).unwrap().to_scalar::<f32>().unwrap();

        let m = t.step(&pixels, &labels).unwrap();
        assert!(!m.meta_applied);
        assert!((m.loss - expected).abs() < 1e-6, "{} vs {expected}", m.loss);
    }
}
