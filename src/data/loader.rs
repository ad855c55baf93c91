// Copyright 2020 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::data::dataset::{PretrainingDataset, TrainingExample};
use crate::PretrainError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tch::{Device, Tensor};

/// # Padded batch of training examples
/// All tensors have shape `[batch size, longest member]` and `Int64` kind.
#[derive(Debug)]
pub struct Batch {
    pub input_ids: Tensor,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Tensor,
    /// Padding positions hold the padding id, which the loss ignores
    pub target_ids: Tensor,
}

impl Batch {
    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            input_ids: self.input_ids.to_device(device),
            attention_mask: self.attention_mask.to_device(device),
            target_ids: self.target_ids.to_device(device),
        }
    }

    pub fn size(&self) -> i64 {
        self.input_ids.size()[0]
    }
}

fn pad_to_matrix<'a, I>(sequences: I, rows: usize, pad_id: i64) -> (Tensor, Tensor)
where
    I: Iterator<Item = &'a [i64]> + Clone,
{
    let max_len = sequences.clone().map(|s| s.len()).max().unwrap_or(0);
    let mut values = Vec::with_capacity(rows * max_len);
    let mut mask = Vec::with_capacity(rows * max_len);
    for sequence in sequences {
        values.extend_from_slice(sequence);
        values.extend(std::iter::repeat(pad_id).take(max_len - sequence.len()));
        mask.extend(std::iter::repeat(1i64).take(sequence.len()));
        mask.extend(std::iter::repeat(0i64).take(max_len - sequence.len()));
    }
    let shape = [rows as i64, max_len as i64];
    (
        Tensor::from_slice(&values).view(shape),
        Tensor::from_slice(&mask).view(shape),
    )
}

/// Right-pads a set of examples to the length of its longest member.
pub fn collate(examples: &[TrainingExample], pad_id: i64) -> Batch {
    let rows = examples.len();
    let (input_ids, attention_mask) = pad_to_matrix(
        examples.iter().map(|example| example.input_ids.as_slice()),
        rows,
        pad_id,
    );
    let (target_ids, _) = pad_to_matrix(
        examples.iter().map(|example| example.target_ids.as_slice()),
        rows,
        pad_id,
    );
    Batch {
        input_ids,
        attention_mask,
        target_ids,
    }
}

/// # Epoch iterator over a dataset
///
/// Segment indices are shuffled with a seeded generator, grouped into full batches (the last
/// incomplete batch is dropped) and span-corrupted on a background thread. Up to `prefetch`
/// example batches are buffered ahead of the consumer. The worker only reads the dataset.
pub struct BatchLoader {
    dataset: Arc<PretrainingDataset>,
    batch_size: usize,
    prefetch: usize,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<PretrainingDataset>,
        batch_size: usize,
        prefetch: usize,
    ) -> Result<BatchLoader, PretrainError> {
        if batch_size == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "batch size must be strictly positive".to_string(),
            ));
        }
        Ok(BatchLoader {
            dataset,
            batch_size,
            prefetch: prefetch.max(1),
        })
    }

    /// Number of full batches of one pass over the dataset.
    pub fn batches_available(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Starts an epoch. Dropping the returned iterator stops the worker.
    pub fn epoch(&self, seed: u64) -> BatchIter {
        let (sender, receiver) = sync_channel(self.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let batch_size = self.batch_size;
        let pad_id = dataset.pad_token_id();

        let worker = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut indices: Vec<usize> = (0..dataset.len()).collect();
            indices.shuffle(&mut rng);
            for chunk in indices.chunks_exact(batch_size) {
                let examples: Vec<TrainingExample> = chunk
                    .iter()
                    .filter_map(|&index| dataset.get(index, &mut rng))
                    .collect();
                if sender.send(examples).is_err() {
                    break;
                }
            }
        });

        BatchIter {
            receiver: Some(receiver),
            worker: Some(worker),
            pad_id,
        }
    }
}

pub struct BatchIter {
    receiver: Option<Receiver<Vec<TrainingExample>>>,
    worker: Option<JoinHandle<()>>,
    pad_id: i64,
}

impl Iterator for BatchIter {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let examples = self.receiver.as_ref()?.recv().ok()?;
        Some(collate(&examples, self.pad_id))
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        // unblocks a worker waiting on a full channel
        drop(self.receiver.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("batch prefetch worker panicked");
            }
        }
    }
}
