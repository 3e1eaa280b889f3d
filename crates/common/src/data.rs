//! Data pipeline: image classification batches.
//!
//! * **[`CifarDataset`]**: zero-copy access to the CIFAR-10 / CIFAR-100 binary
//!   distribution via `memmap2`; pixels are normalised on the fly.
//! * **[`SyntheticDataset`]**: seeded Gaussian-cluster images for smoke runs
//!   and tests.
//! * **[`BatchDataset`]**: the interface the trainer consumes. Batches are
//!   `(pixels, labels)` with a fixed batch size; a trailing partial batch is
//!   dropped so every epoch has the same number of steps.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// One batch: flattened `f32` pixels (`batch × C × H × W`) and class labels.
pub type ImageBatch = (Vec<f32>, Vec<u32>);

// ── CIFAR binary format ─────────────────────────────────────────────────────

/// Pixels per CIFAR image (3 × 32 × 32).
const CIFAR_PIXELS: usize = 3 * 32 * 32;
const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const CIFAR_STD: [f32; 3] = [0.2470, 0.2435, 0.2616];

/// Which split of the CIFAR distribution to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// CIFAR variant; decides file names and how many label bytes prefix a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CifarVariant {
    /// 1 label byte per record, files `data_batch_{1..5}.bin` / `test_batch.bin`.
    Cifar10,
    /// 2 label bytes (coarse, fine) per record, files `train.bin` / `test.bin`.
    Cifar100,
}

impl CifarVariant {
    fn label_bytes(&self) -> usize {
        match self {
            Self::Cifar10 => 1,
            Self::Cifar100 => 2,
        }
    }

    fn files(&self, split: Split) -> Vec<&'static str> {
        match (self, split) {
            (Self::Cifar10, Split::Train) => vec![
                "data_batch_1.bin",
                "data_batch_2.bin",
                "data_batch_3.bin",
                "data_batch_4.bin",
                "data_batch_5.bin",
            ],
            (Self::Cifar10, Split::Test) => vec!["test_batch.bin"],
            (Self::Cifar100, Split::Train) => vec!["train.bin"],
            (Self::Cifar100, Split::Test) => vec!["test.bin"],
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Self::Cifar10 => 10,
            Self::Cifar100 => 100,
        }
    }
}

/// Memory-mapped CIFAR split. Only the pages touched for each batch are read.
pub struct CifarDataset {
    maps: Vec<Mmap>,
    /// `(map index, record index within map)` for every record, in file order.
    index: Vec<(usize, usize)>,
    variant: CifarVariant,
}

impl CifarDataset {
    /// Open every binary file of `split` under `dir`.
    pub fn open(dir: &Path, variant: CifarVariant, split: Split) -> AnyhowResult<Self> {
        let record_len = variant.label_bytes() + CIFAR_PIXELS;
        let mut maps = Vec::new();
        let mut index = Vec::new();
        for name in variant.files(split) {
            let path: PathBuf = dir.join(name);
            let file =
                File::open(&path).with_context(|| format!("open {}", path.display()))?;
            let mmap = unsafe { Mmap::map(&file).context("mmap cifar file")? };
            if mmap.len() % record_len != 0 {
                anyhow::bail!(
                    "{}: size {} is not a multiple of the record length {}",
                    path.display(),
                    mmap.len(),
                    record_len
                );
            }
            let map_idx = maps.len();
            index.extend((0..mmap.len() / record_len).map(|r| (map_idx, r)));
            maps.push(mmap);
        }
        tracing::info!(
            dir = %dir.display(),
            ?split,
            records = index.len(),
            "Opened CIFAR split"
        );
        Ok(Self {
            maps,
            index,
            variant,
        })
    }

    pub fn variant(&self) -> CifarVariant {
        self.variant
    }

    /// Decode record `i` into normalised CHW pixels, appending to `pixels`.
    fn read_record(&self, i: usize, pixels: &mut Vec<f32>) -> u32 {
        let label_bytes = self.variant.label_bytes();
        let record_len = label_bytes + CIFAR_PIXELS;
        let (map_idx, rec) = self.index[i];
        let bytes = &self.maps[map_idx][rec * record_len..(rec + 1) * record_len];
        // CIFAR-100 stores (coarse, fine); the fine label is the class.
        let label = bytes[label_bytes - 1] as u32;
        let plane = CIFAR_PIXELS / 3;
        for (c, chunk) in bytes[label_bytes..].chunks(plane).enumerate() {
            pixels.extend(
                chunk
                    .iter()
                    .map(|&b| (b as f32 / 255.0 - CIFAR_MEAN[c]) / CIFAR_STD[c]),
            );
        }
        label
    }
}

// ── SyntheticDataset ────────────────────────────────────────────────────────

/// Seeded synthetic classification set: one random prototype per class plus
/// Gaussian-ish noise. Deterministic for a given seed.
pub struct SyntheticDataset {
    pixels: Vec<f32>,
    labels: Vec<u32>,
    shape: [usize; 3],
}

impl SyntheticDataset {
    pub fn new(len: usize, num_classes: usize, shape: [usize; 3], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dim: usize = shape.iter().product();
        let prototypes: Vec<Vec<f32>> = (0..num_classes)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect();
        let mut pixels = Vec::with_capacity(len * dim);
        let mut labels = Vec::with_capacity(len);
        for i in 0..len {
            let class = i % num_classes.max(1);
            labels.push(class as u32);
            pixels.extend(
                prototypes[class]
                    .iter()
                    .map(|&p| p + 0.25 * (rng.gen::<f32>() + rng.gen::<f32>() - 1.0)),
            );
        }
        Self {
            pixels,
            labels,
            shape,
        }
    }

    fn image_dim(&self) -> usize {
        self.shape.iter().product()
    }
}

// ── BatchDataset trait ──────────────────────────────────────────────────────

/// Common interface for datasets that yield `(pixels, labels)` batches.
pub trait BatchDataset {
    fn len(&self) -> usize;
    fn image_shape(&self) -> [usize; 3];

    /// Batches of one epoch. With `drop_last` the trailing partial batch is
    /// skipped; otherwise every sample appears exactly once.
    fn iter_batches(
        &self,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_>;

    /// Full training batches (the trailing partial batch is dropped).
    fn batches(
        &self,
        batch_size: usize,
        shuffle: bool,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        self.iter_batches(batch_size, shuffle, true)
    }

    /// Every sample in order, the last batch possibly short.
    fn all_batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        self.iter_batches(batch_size, false, false)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full batches per epoch (the trailing partial batch is dropped).
    fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len() / batch_size
        }
    }
}

/// `[start, end)` sample ranges of one epoch's batches.
fn batch_bounds(
    len: usize,
    batch_size: usize,
    drop_last: bool,
) -> impl Iterator<Item = (usize, usize)> {
    let n = match (batch_size, drop_last) {
        (0, _) => 0,
        (bs, true) => len / bs,
        (bs, false) => len.div_ceil(bs),
    };
    (0..n).map(move |b| (b * batch_size, ((b + 1) * batch_size).min(len)))
}

/// Record order for one epoch.
fn epoch_order(len: usize, shuffle: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        order.shuffle(&mut rand::thread_rng());
    }
    order
}

impl BatchDataset for CifarDataset {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn image_shape(&self) -> [usize; 3] {
        [3, 32, 32]
    }

    fn iter_batches(
        &self,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        let order = epoch_order(self.len(), shuffle);
        Box::new(batch_bounds(self.len(), batch_size, drop_last).map(move |(lo, hi)| {
            let mut pixels = Vec::with_capacity((hi - lo) * CIFAR_PIXELS);
            let mut labels = Vec::with_capacity(hi - lo);
            for &i in &order[lo..hi] {
                labels.push(self.read_record(i, &mut pixels));
            }
            (pixels, labels)
        }))
    }
}

impl BatchDataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn image_shape(&self) -> [usize; 3] {
        self.shape
    }

    fn iter_batches(
        &self,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        let order = epoch_order(self.len(), shuffle);
        let dim = self.image_dim();
        Box::new(batch_bounds(self.len(), batch_size, drop_last).map(move |(lo, hi)| {
            let mut pixels = Vec::with_capacity((hi - lo) * dim);
            let mut labels = Vec::with_capacity(hi - lo);
            for &i in &order[lo..hi] {
                pixels.extend_from_slice(&self.pixels[i * dim..(i + 1) * dim]);
                labels.push(self.labels[i]);
            }
            (pixels, labels)
        }))
    }
}

/// Either a [`CifarDataset`] or a [`SyntheticDataset`].
pub enum AnyImageDataset {
    Cifar(CifarDataset),
    Synthetic(SyntheticDataset),
}

impl BatchDataset for AnyImageDataset {
    fn len(&self) -> usize {
        match self {
            Self::Cifar(d) => d.len(),
            Self::Synthetic(d) => d.len(),
        }
    }

    fn image_shape(&self) -> [usize; 3] {
        match self {
            Self::Cifar(d) => d.image_shape(),
            Self::Synthetic(d) => d.image_shape(),
        }
    }

    fn iter_batches(
        &self,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Box<dyn Iterator<Item = ImageBatch> + '_> {
        match self {
            Self::Cifar(d) => d.iter_batches(batch_size, shuffle, drop_last),
            Self::Synthetic(d) => d.iter_batches(batch_size, shuffle, drop_last),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch to Candle tensors: images `(B, C, H, W)` f32 and
/// labels `(B,)` u32.
pub fn batch_to_tensors(
    pixels: &[f32],
    labels: &[u32],
    shape: [usize; 3],
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch_size = labels.len();
    let images = Tensor::from_slice(pixels, (batch_size, shape[0], shape[1], shape[2]), device)?;
    let labels = Tensor::from_slice(labels, batch_size, device)?;
    Ok((images, labels))
}

// ── Tests ───────────────────────────────────────────────────────────────────
