//! Image classification data

mod cifar;

pub use cifar::{
    BatchIter, Dataset, CHANNELS, CIFAR10_MEAN, CIFAR10_STD, IMAGE_LEN, IMAGE_SIZE,
};
