//! CIFAR-10 binary batches
//!
//! Each record is one label byte followed by 3072 pixel bytes in CHW order.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::info;

use crate::error::{NasError, Result};

pub const IMAGE_SIZE: usize = 32;
pub const CHANNELS: usize = 3;
pub const IMAGE_LEN: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
const RECORD_LEN: usize = 1 + IMAGE_LEN;

pub const CIFAR10_MEAN: [f32; CHANNELS] = [0.4914, 0.4822, 0.4465];
pub const CIFAR10_STD: [f32; CHANNELS] = [0.2470, 0.2435, 0.2616];

const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

/// Normalized images and their labels, held in host memory
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Vec<f32>,
    labels: Vec<u32>,
}

impl Dataset {
    /// Build from already normalized CHW images
    pub fn new(images: Vec<f32>, labels: Vec<u32>) -> Result<Self> {
        if images.len() != labels.len() * IMAGE_LEN {
            return Err(NasError::DataError(format!(
                "{} image values for {} labels",
                images.len(),
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    /// Parse the contents of one or more concatenated binary batches
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % RECORD_LEN != 0 {
            return Err(NasError::DataError(format!(
                "batch length {} is not a multiple of {}",
                bytes.len(),
                RECORD_LEN
            )));
        }

        let n = bytes.len() / RECORD_LEN;
        let mut images = Vec::with_capacity(n * IMAGE_LEN);
        let mut labels = Vec::with_capacity(n);
        for record in bytes.chunks_exact(RECORD_LEN) {
            labels.push(record[0] as u32);
            for (c, plane) in record[1..].chunks_exact(IMAGE_SIZE * IMAGE_SIZE).enumerate() {
                images.extend(
                    plane
                        .iter()
                        .map(|&p| (p as f32 / 255.0 - CIFAR10_MEAN[c]) / CIFAR10_STD[c]),
                );
            }
        }
        Ok(Self { images, labels })
    }

    pub fn load_files(paths: &[PathBuf]) -> Result<Self> {
        let mut bytes = Vec::new();
        for path in paths {
            let chunk = fs::read(path).map_err(|e| {
                NasError::DataError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            bytes.extend_from_slice(&chunk);
        }
        let dataset = Self::from_bytes(&bytes)?;
        info!(files = paths.len(), samples = dataset.len(), "Loaded CIFAR-10 batches");
        Ok(dataset)
    }

    /// `data_batch_{1..5}.bin` under `dir`
    pub fn load_train(dir: impl AsRef<Path>) -> Result<Self> {
        let paths: Vec<PathBuf> = TRAIN_FILES.iter().map(|f| dir.as_ref().join(f)).collect();
        Self::load_files(&paths)
    }

    /// `test_batch.bin` under `dir`
    pub fn load_test(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_files(&[dir.as_ref().join(TEST_FILE)])
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// `(images [n, 3, 32, 32], labels [n])` for the given sample indices
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let mut images = Vec::with_capacity(indices.len() * IMAGE_LEN);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.len() {
                return Err(NasError::IndexOutOfRange {
                    what: "sample",
                    index: i,
                    len: self.len(),
                });
            }
            images.extend_from_slice(&self.images[i * IMAGE_LEN..(i + 1) * IMAGE_LEN]);
            labels.push(self.labels[i]);
        }
        let n = indices.len();
        let images = Tensor::from_vec(images, (n, CHANNELS, IMAGE_SIZE, IMAGE_SIZE), device)?;
        let labels = Tensor::from_vec(labels, n, device)?;
        Ok((images, labels))
    }

    /// Mini-batches in order, or shuffled when a seed is given
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
        device: &'a Device,
    ) -> BatchIter<'a> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle_seed {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        BatchIter {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            pos: 0,
            device,
        }
    }
}

/// Iterator over `(images, labels)` mini-batches; the last one may be short
pub struct BatchIter<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
    device: &'a Device,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let batch = self.dataset.batch(&self.order[self.pos..end], self.device);
        self.pos = end;
        Some(batch)
    }
}
