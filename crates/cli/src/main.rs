use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use metaquant_common::{
    AnyImageDataset, BatchDataset, CifarDataset, CifarVariant, MetaMethod, MetaQuantConfig,
    ModelKind, QuantScheme, Split, SyntheticDataset,
};
use metaquant_train::{LrDecay, MetaTrainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "metaquant", about = "Meta-learned gradient recalibration for quantized networks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a quantized network with a meta-network generating its gradients.
    Train(TrainArgs),
    /// Evaluate a saved checkpoint on the test split.
    Eval(EvalArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DatasetKind {
    Cifar10,
    Cifar100,
    Synthetic,
}

#[derive(Args, Debug, Clone)]
struct DataArgs {
    #[arg(long, value_enum, default_value = "cifar10")]
    dataset: DatasetKind,
    /// Directory with the CIFAR binary files.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value_t = 2048)]
    synthetic_train: usize,
    #[arg(long, default_value_t = 512)]
    synthetic_test: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct TrainArgs {
    /// Experiment config (created with defaults if missing).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[command(flatten)]
    data: DataArgs,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    /// Override `model` from the config.
    #[arg(long)]
    model: Option<ModelKind>,
    /// Override `meta.method` from the config.
    #[arg(long)]
    method: Option<MetaMethod>,
    /// Override `quantize` from the config.
    #[arg(long)]
    quantize: Option<QuantScheme>,
    /// Override `bit_w` from the config.
    #[arg(long)]
    bit_w: Option<u32>,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 100)]
    epochs: usize,
    #[arg(long, default_value_t = 1e-2)]
    lr: f64,
    #[arg(long, default_value_t = 0.0)]
    lr_min: f64,
    /// `<epochs>[:<gamma>]`, `cosine` or `none`.
    #[arg(long, default_value = "30")]
    lr_schedule: LrDecay,
    #[arg(long, default_value_t = 1e-2)]
    meta_lr: f64,
    #[arg(long, default_value_t = 0.0)]
    meta_weight_decay: f64,
    #[arg(long)]
    fix_meta: bool,
    #[arg(long)]
    fix_meta_epoch: Option<usize>,
    #[arg(long)]
    momentum_blend: bool,
    /// Primary weights to start from (safetensors).
    #[arg(long)]
    pretrained: Option<PathBuf>,
    #[arg(long, default_value_t = 100)]
    log_every: usize,
    #[arg(long)]
    eval_batches: Option<usize>,
}

// ── Eval ───────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct EvalArgs {
    /// Checkpoint directory containing `config.json` and `primary.safetensors`.
    #[arg(long)]
    checkpoint: PathBuf,
    #[command(flatten)]
    data: DataArgs,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    #[arg(long)]
    eval_batches: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Eval(args) => cmd_eval(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut model_config = if args.config.exists() {
        MetaQuantConfig::load(&args.config)?
    } else {
        let default = MetaQuantConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(m) = args.model {
        model_config.model = m;
    }
    if let Some(m) = args.method {
        model_config.meta.method = m;
    }
    if let Some(q) = args.quantize {
        model_config.quantize = q;
    }
    if let Some(b) = args.bit_w {
        model_config.bit_w = b;
    }

    let (train_ds, test_ds) = open_datasets(&args.data, &mut model_config)?;
    model_config.validate()?;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        max_epochs: args.epochs,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_decay: args.lr_schedule,
        meta_lr: args.meta_lr,
        meta_weight_decay: args.meta_weight_decay,
        fix_meta: args.fix_meta,
        fix_meta_epoch: args.fix_meta_epoch,
        momentum_blend: args.momentum_blend,
        log_every: args.log_every,
        eval_batches: args.eval_batches,
        output_dir: args.output_dir.clone(),
    };

    let device = Device::cuda_if_available(0)?;
    let mut trainer = MetaTrainer::new(model_config, trainer_config, device)?;
    if let Some(path) = &args.pretrained {
        trainer.load_pretrained(path)?;
    }

    std::fs::create_dir_all(&args.output_dir)?;
    let metrics_path = args.output_dir.join("metrics.csv");
    let mut metrics_file = std::fs::File::create(&metrics_path)
        .with_context(|| format!("creating {}", metrics_path.display()))?;
    writeln!(
        metrics_file,
        "epoch,lr,train_loss,train_acc,test_loss,test_acc,test_top5,best_test_acc,meta_frozen"
    )?;

    let steps_per_epoch = train_ds.num_batches(args.batch_size) as u64;
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
        .progress_chars("=>-");

    for _ in 0..args.epochs {
        let pb = ProgressBar::new(steps_per_epoch);
        pb.set_style(style.clone());
        let m = trainer.train_epoch(&train_ds, &test_ds, |s| {
            pb.set_message(format!("loss {:.4} acc {:.3}", s.loss, s.accuracy));
            pb.inc(1);
        })?;
        pb.finish_with_message(format!("epoch {} test acc {:.3}", m.epoch, m.test_accuracy));

        writeln!(
            metrics_file,
            "{},{:e},{:.6},{:.4},{:.6},{:.4},{:.4},{:.4},{}",
            m.epoch,
            m.lr,
            m.train_loss,
            m.train_accuracy,
            m.test_loss,
            m.test_accuracy,
            m.test_top5_accuracy,
            m.best_test_accuracy,
            m.meta_frozen
        )?;
        metrics_file.flush()?;
    }

    let path = trainer.save_checkpoint("final")?;
    tracing::info!(
        path = %path.display(),
        best_test_acc = trainer.best_test_accuracy().unwrap_or(0.0),
        "Training finished"
    );
    eprintln!(
        "Best test accuracy: {:.3}%",
        100.0 * trainer.best_test_accuracy().unwrap_or(0.0)
    );
    Ok(())
}

fn cmd_eval(args: EvalArgs) -> Result<()> {
    let mut model_config = MetaQuantConfig::load(&args.checkpoint.join("config.json"))?;
    let (_, test_ds) = open_datasets(&args.data, &mut model_config)?;
    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        eval_batches: args.eval_batches,
        output_dir: args.checkpoint.clone(),
        ..Default::default()
    };
    let device = Device::cuda_if_available(0)?;
    let mut trainer = MetaTrainer::new(model_config, trainer_config, device)?;
    trainer.load_pretrained(&args.checkpoint.join("primary.safetensors"))?;
    let eval = trainer.evaluate(&test_ds)?;
    println!(
        "test loss {:.4}  top-1 {:.3}%  top-5 {:.3}%",
        eval.loss,
        100.0 * eval.accuracy,
        100.0 * eval.top5_accuracy
    );
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// Open train/test splits and align the config's input shape and class count
/// with the data.
fn open_datasets(
    args: &DataArgs,
    config: &mut MetaQuantConfig,
) -> Result<(AnyImageDataset, AnyImageDataset)> {
    let cifar = |variant: CifarVariant, dir: &Path| -> Result<(AnyImageDataset, AnyImageDataset)> {
        let train = CifarDataset::open(dir, variant, Split::Train)?;
        let test = CifarDataset::open(dir, variant, Split::Test)?;
        Ok((AnyImageDataset::Cifar(train), AnyImageDataset::Cifar(test)))
    };
    let (train, test) = match args.dataset {
        DatasetKind::Cifar10 => cifar(CifarVariant::Cifar10, &args.data_dir)?,
        DatasetKind::Cifar100 => cifar(CifarVariant::Cifar100, &args.data_dir)?,
        DatasetKind::Synthetic => {
            let shape = config.input_shape;
            let classes = config.num_classes;
            (
                AnyImageDataset::Synthetic(SyntheticDataset::new(
                    args.synthetic_train,
                    classes,
                    shape,
                    args.seed,
                )),
                AnyImageDataset::Synthetic(SyntheticDataset::new(
                    args.synthetic_test,
                    classes,
                    shape,
                    args.seed.wrapping_add(1),
                )),
            )
        }
    };
    if let AnyImageDataset::Cifar(d) = &train {
        let classes = d.variant().num_classes();
        if config.num_classes != classes {
            tracing::warn!(
                config = config.num_classes,
                dataset = classes,
                "num_classes does not match the dataset; using the dataset's"
            );
            config.num_classes = classes;
        }
    }
    config.input_shape = train.image_shape();
    tracing::info!(
        dataset = ?args.dataset,
        train = train.len(),
        test = test.len(),
        "Opened datasets"
    );
    Ok((train, test))
}
