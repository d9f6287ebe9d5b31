//! DataLoader for batching and iterating over image tensors
//!
//! Provides batching for both training loops with support for:
//! - Random shuffling
//! - Drop last incomplete batch
//! - Endless batch sampling for the critic

use rand::seq::SliceRandom;
use rand::Rng;
use tch::Tensor;

/// Source of fixed-size batches of real images
pub trait BatchSource {
    /// Return exactly `batch_size` images of shape [batch_size, C, H, W]
    fn sample_batch(&mut self, batch_size: i64) -> anyhow::Result<Tensor>;
}

/// DataLoader for iterating over batched images
pub struct DataLoader {
    /// Full dataset of shape (num_images, channels, height, width)
    data: Tensor,
    /// Batch size
    batch_size: usize,
    /// Whether to shuffle data each epoch
    shuffle: bool,
    /// Whether to drop the last incomplete batch
    drop_last: bool,
    /// Current indices for iteration
    indices: Vec<i64>,
    /// Current position in iteration
    current_idx: usize,
}

impl DataLoader {
    /// Create a new DataLoader
    ///
    /// # Arguments
    ///
    /// * `data` - 4D tensor of shape (num_images, channels, height, width)
    /// * `batch_size` - Number of images per batch
    /// * `shuffle` - Whether to shuffle data each epoch
    /// * `drop_last` - Whether to drop incomplete final batch
    pub fn new(data: Tensor, batch_size: usize, shuffle: bool, drop_last: bool) -> Self {
        let num_samples = data.size()[0];
        let indices: Vec<i64> = (0..num_samples).collect();

        let mut loader = Self {
            data,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            indices,
            current_idx: 0,
        };

        if shuffle {
            loader.shuffle_indices();
        }

        loader
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let num_samples = self.num_samples();
        if self.drop_last {
            num_samples / self.batch_size
        } else {
            (num_samples + self.batch_size - 1) / self.batch_size
        }
    }

    /// Get total number of images
    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn shuffle_indices(&mut self) {
        let mut rng = rand::thread_rng();
        self.indices.shuffle(&mut rng);
    }

    /// Reset for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.shuffle_indices();
        }
    }

    /// Get next batch
    ///
    /// Returns None when epoch is complete
    pub fn next_batch(&mut self) -> Option<Tensor> {
        let num_samples = self.indices.len();
        let start = self.current_idx;

        if start >= num_samples {
            return None;
        }

        let end = (start + self.batch_size).min(num_samples);

        if self.drop_last && end - start < self.batch_size {
            return None;
        }

        let index = Tensor::from_slice(&self.indices[start..end]).to_device(self.data.device());
        self.current_idx = end;
        Some(self.data.index_select(0, &index))
    }

    /// Iterate over all batches of one epoch
    pub fn iter(&mut self) -> DataLoaderIter<'_> {
        self.reset();
        DataLoaderIter { loader: self }
    }

    /// Get the underlying data
    pub fn data(&self) -> &Tensor {
        &self.data
    }
}

impl BatchSource for DataLoader {
    /// Cycle through epochs, skipping a short trailing batch
    fn sample_batch(&mut self, batch_size: i64) -> anyhow::Result<Tensor> {
        if batch_size != self.batch_size as i64 {
            anyhow::bail!(
                "Requested batch size {} but loader yields batches of {}",
                batch_size,
                self.batch_size
            );
        }
        if (self.num_samples() as i64) < batch_size {
            anyhow::bail!(
                "Dataset has {} images, fewer than batch size {}",
                self.num_samples(),
                batch_size
            );
        }

        for _ in 0..2 {
            let batch = match self.next_batch() {
                Some(batch) => batch,
                None => {
                    self.reset();
                    match self.next_batch() {
                        Some(batch) => batch,
                        None => anyhow::bail!("Data loader is empty"),
                    }
                }
            };
            if batch.size()[0] == batch_size {
                return Ok(batch);
            }
        }

        anyhow::bail!("Could not draw a full batch of {} images", batch_size)
    }
}

/// Iterator adapter for DataLoader
pub struct DataLoaderIter<'a> {
    loader: &'a mut DataLoader,
}

impl<'a> Iterator for DataLoaderIter<'a> {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        self.loader.next_batch()
    }
}

/// Draws batches of uniformly random indices, with replacement
pub struct RandomSampler {
    data: Tensor,
}

impl RandomSampler {
    pub fn new(data: Tensor) -> Self {
        Self { data }
    }

    pub fn num_samples(&self) -> usize {
        self.data.size()[0] as usize
    }
}

impl BatchSource for RandomSampler {
    fn sample_batch(&mut self, batch_size: i64) -> anyhow::Result<Tensor> {
        let n = self.data.size()[0];
        if n == 0 {
            anyhow::bail!("Cannot sample from an empty dataset");
        }
        if batch_size <= 0 {
            anyhow::bail!("Batch size must be > 0");
        }

        let mut rng = rand::thread_rng();
        let idx: Vec<i64> = (0..batch_size).map(|_| rng.gen_range(0..n)).collect();
        let index = Tensor::from_slice(&idx).to_device(self.data.device());
        Ok(self.data.index_select(0, &index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn dummy_images(n: i64) -> Tensor {
        Tensor::zeros([n, 1, 4, 4], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_dataloader_basic() {
        let mut loader = DataLoader::new(dummy_images(10), 3, false, false);

        assert_eq!(loader.num_batches(), 4); // ceil(10/3) = 4
        assert_eq!(loader.num_samples(), 10);

        let mut batch_count = 0;
        while let Some(batch) = loader.next_batch() {
            batch_count += 1;
            if batch_count < 4 {
                assert_eq!(batch.size(), vec![3, 1, 4, 4]);
            } else {
                assert_eq!(batch.size()[0], 1); // Last batch has 1 image
            }
        }
        assert_eq!(batch_count, 4);
    }

    #[test]
    fn test_dataloader_drop_last() {
        let mut loader = DataLoader::new(dummy_images(10), 3, false, true);

        assert_eq!(loader.num_batches(), 3); // floor(10/3) = 3

        let mut batch_count = 0;
        while let Some(batch) = loader.next_batch() {
            batch_count += 1;
            assert_eq!(batch.size()[0], 3);
        }
        assert_eq!(batch_count, 3);
    }

    #[test]
    fn test_dataloader_iter() {
        let mut loader = DataLoader::new(dummy_images(10), 5, false, true);

        let batches: Vec<_> = loader.iter().collect();
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_shuffled_epoch_covers_every_image() {
        let data = Tensor::arange(6i64, (Kind::Float, Device::Cpu)).view([6, 1, 1, 1]);
        let mut loader = DataLoader::new(data, 4, true, false);

        let mut seen: Vec<i64> = loader
            .iter()
            .flat_map(|b| Vec::<f32>::try_from(b.flatten(0, -1)).unwrap())
            .map(|v| v as i64)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sample_batch_skips_short_batch() {
        let mut loader = DataLoader::new(dummy_images(5), 2, false, false);

        for _ in 0..6 {
            let batch = loader.sample_batch(2).unwrap();
            assert_eq!(batch.size()[0], 2);
        }
    }

    #[test]
    fn test_sample_batch_rejects_small_dataset() {
        let mut loader = DataLoader::new(dummy_images(1), 2, false, false);
        assert!(loader.sample_batch(2).is_err());
    }

    #[test]
    fn test_random_sampler() {
        let data = Tensor::arange(4i64, (Kind::Float, Device::Cpu)).view([4, 1, 1, 1]);
        let mut sampler = RandomSampler::new(data);

        let batch = sampler.sample_batch(16).unwrap();
        assert_eq!(batch.size(), vec![16, 1, 1, 1]);

        let values = Vec::<f32>::try_from(batch.flatten(0, -1)).unwrap();
        assert!(values.iter().all(|v| (0.0..4.0).contains(v)));
    }

    #[test]
    fn test_random_sampler_empty() {
        let mut sampler = RandomSampler::new(dummy_images(0));
        assert!(sampler.sample_batch(2).is_err());
    }
}
