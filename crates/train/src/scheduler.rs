//! Per-epoch learning rate schedule for the primary network.

use std::str::FromStr;

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Learning rate schedule indexed by epoch: step decay, cosine, or constant.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    lr: f64,
    lr_min: f64,
    max_epochs: usize,
    decay: LrDecay,
}

/// Decay mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrDecay {
    /// Multiply by `gamma` every `every` epochs.
    Step { every: usize, gamma: f64 },
    Cosine,
    None,
}

impl FromStr for LrDecay {
    type Err = anyhow::Error;

    /// `"30"` (×0.1 every 30 epochs), `"30:0.5"`, `"cosine"`, `"none"`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "none" | "constant" => Ok(Self::None),
            other => {
                let (every, gamma) = match other.split_once(':') {
                    Some((e, g)) => (e, g.parse::<f64>()?),
                    None => (other, 0.1),
                };
                let every = every
                    .parse::<usize>()
                    .map_err(|_| anyhow::anyhow!("unknown lr schedule '{s}'"))?;
                if every == 0 {
                    anyhow::bail!("lr step interval must be positive");
                }
                Ok(Self::Step { every, gamma })
            }
        }
    }
}

impl LrScheduler {
    pub fn new(lr: f64, lr_min: f64, max_epochs: usize, decay: LrDecay) -> Self {
        Self {
            lr,
            lr_min,
            max_epochs,
            decay,
        }
    }

    /// Learning rate used throughout `epoch` (0-based).
    pub fn lr_at(&self, epoch: usize) -> f64 {
        match self.decay {
            LrDecay::None => self.lr,
            LrDecay::Step { every, gamma } => self.lr * gamma.powi((epoch / every) as i32),
            LrDecay::Cosine => {
                if self.max_epochs == 0 {
                    return self.lr;
                }
                let progress = epoch.min(self.max_epochs) as f64 / self.max_epochs as f64;
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
