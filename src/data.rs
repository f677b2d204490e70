use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use flate2::read::GzDecoder;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// MNIST item.
#[derive(Clone, Debug, PartialEq)]
pub struct MnistItem {
    /// Row-major grayscale pixels.
    pub pixels: Vec<u8>,

    /// Digit class of the image.
    pub label: u8,
}

#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("Could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Neither '{0}' nor its gzip version exists")]
    NotFound(PathBuf),

    #[error("'{file}' has magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        file: String,
        expected: u32,
        found: u32,
    },

    #[error("'{file}' is truncated: expected {expected} bytes, found {found}")]
    Truncated {
        file: String,
        expected: usize,
        found: usize,
    },

    #[error("Split has {images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("Validation size {validation_size} exceeds the {available} training examples")]
    ValidationTooLarge {
        validation_size: usize,
        available: usize,
    },
}

/// Train, validation and test partitions of MNIST.
pub struct MnistSplits {
    pub train: InMemDataset<MnistItem>,
    pub validation: InMemDataset<MnistItem>,
    pub test: InMemDataset<MnistItem>,
}

impl MnistSplits {
    pub fn new(train: Vec<MnistItem>, validation: Vec<MnistItem>, test: Vec<MnistItem>) -> Self {
        Self {
            train: InMemDataset::new(train),
            validation: InMemDataset::new(validation),
            test: InMemDataset::new(test),
        }
    }

    /// Load the IDX files found in `directory`.
    ///
    /// The first `validation_size` training examples are held out as the validation split.
    pub fn load<P: AsRef<Path>>(directory: P, validation_size: usize) -> Result<Self, DataError> {
        let directory = directory.as_ref();
        let mut train = read_split(directory, TRAIN_IMAGES, TRAIN_LABELS)?;
        let test = read_split(directory, TEST_IMAGES, TEST_LABELS)?;

        if validation_size > train.len() {
            return Err(DataError::ValidationTooLarge {
                validation_size,
                available: train.len(),
            });
        }

        let train_rest = train.split_off(validation_size);
        log::info!(
            "Loaded MNIST from '{}': {} train, {} validation, {} test",
            directory.display(),
            train_rest.len(),
            train.len(),
            test.len()
        );

        Ok(Self::new(train_rest, train, test))
    }
}

fn read_split(directory: &Path, images: &str, labels: &str) -> Result<Vec<MnistItem>, DataError> {
    let images = parse_images(images, &read_idx(directory, images)?)?;
    let labels = parse_labels(labels, &read_idx(directory, labels)?)?;

    if images.len() != labels.len() {
        return Err(DataError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }

    Ok(images
        .into_iter()
        .zip(labels)
        .map(|(pixels, label)| MnistItem { pixels, label })
        .collect())
}

/// Read an IDX file, falling back to its `.gz` version.
fn read_idx(directory: &Path, name: &str) -> Result<Vec<u8>, DataError> {
    let raw = directory.join(name);
    let gzip = directory.join(format!("{name}.gz"));

    let mut bytes = Vec::new();
    if raw.exists() {
        File::open(&raw)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .map_err(|source| DataError::Io { path: raw, source })?;
    } else if gzip.exists() {
        File::open(&gzip)
            .and_then(|file| GzDecoder::new(file).read_to_end(&mut bytes))
            .map_err(|source| DataError::Io { path: gzip, source })?;
    } else {
        return Err(DataError::NotFound(raw));
    }

    Ok(bytes)
}

fn read_u32(file: &str, bytes: &[u8], offset: usize) -> Result<u32, DataError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| DataError::Truncated {
            file: file.to_string(),
            expected: offset + 4,
            found: bytes.len(),
        })
}

fn check_magic(file: &str, bytes: &[u8], expected: u32) -> Result<(), DataError> {
    match read_u32(file, bytes, 0)? {
        found if found == expected => Ok(()),
        found => Err(DataError::BadMagic {
            file: file.to_string(),
            expected,
            found,
        }),
    }
}

/// Parse an IDX3 image file: a 16-byte header (magic, count, rows, columns) followed by the pixels.
pub fn parse_images(file: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>, DataError> {
    check_magic(file, bytes, IMAGES_MAGIC)?;
    let count = read_u32(file, bytes, 4)? as usize;
    let rows = read_u32(file, bytes, 8)? as usize;
    let columns = read_u32(file, bytes, 12)? as usize;
    let truncated = |expected| DataError::Truncated {
        file: file.to_string(),
        expected,
        found: bytes.len(),
    };

    // Header dimensions are untrusted and may overflow.
    let image_size = rows.checked_mul(columns).ok_or_else(|| truncated(usize::MAX))?;
    let body_size = count.checked_mul(image_size).ok_or_else(|| truncated(usize::MAX))?;

    let body = &bytes[16..];
    if body.len() < body_size {
        return Err(truncated(body_size.saturating_add(16)));
    }

    if image_size == 0 {
        return Ok(vec![Vec::new(); count]);
    }

    Ok(body[..body_size]
        .chunks(image_size)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Parse an IDX1 label file: an 8-byte header (magic, count) followed by one byte per label.
pub fn parse_labels(file: &str, bytes: &[u8]) -> Result<Vec<u8>, DataError> {
    check_magic(file, bytes, LABELS_MAGIC)?;
    let count = read_u32(file, bytes, 4)? as usize;

    bytes
        .get(8..8 + count)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| DataError::Truncated {
            file: file.to_string(),
            expected: 8 + count,
            found: bytes.len(),
        })
}

/// Number of full batches in one epoch, the remainder is dropped.
pub fn total_batches(num_examples: usize, batch_size: usize) -> usize {
    num_examples / batch_size
}

/// Shuffle the indices of a dataset and split them into full batches.
///
/// Every index appears at most once per epoch; the last `num_examples % batch_size` indices
/// of the permutation are skipped.
pub fn epoch_batches(num_examples: usize, batch_size: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..num_examples).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    indices
        .chunks_exact(batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

/// Gather the items of one batch.
pub fn batch_items<D: Dataset<MnistItem>>(dataset: &D, indices: &[usize]) -> Vec<MnistItem> {
    indices.iter().filter_map(|index| dataset.get(*index)).collect()
}

#[derive(Clone, Debug, Default)]
pub struct MnistBatcher;

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    pub images: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, MnistItem, MnistBatch<B>> for MnistBatcher {
    fn batch(&self, items: Vec<MnistItem>, device: &B::Device) -> MnistBatch<B> {
        let width = items.first().map_or(0, |item| item.pixels.len());

        // Scale to [0, 1]
        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|item| item.pixels.iter().map(|pixel| f32::from(*pixel) / 255.0))
            .collect();
        let labels: Vec<i64> = items.iter().map(|item| i64::from(item.label)).collect();

        let images = Tensor::from_data(TensorData::new(pixels, [items.len(), width]), device);
        let targets = Tensor::from_data(TensorData::new(labels, [items.len()]), device);

        MnistBatch { images, targets }
    }
}
