//! # Dataset windowing layer
//!
//! Turns a token shard into batches of span-corrupted training examples. Documents are split into
//! segments that fit the model input, each segment is corrupted on the fly (T5 objective: random
//! spans are replaced by sentinel tokens in the input and listed after their sentinel in the
//! target) and examples are padded into `tch` tensors.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use t5_pretrain::corpus::TokenShard;
//! use t5_pretrain::data::{BatchLoader, PretrainingDataset, SpanMaskingConfig};
//! use t5_pretrain::tokenization::{SpecialTokenNames, SpecialTokens, TokenizerOption};
//!
//! let tokenizer = TokenizerOption::from_file("data/wordpiece.json", false)?;
//! let special_tokens = SpecialTokens::resolve(&tokenizer, &SpecialTokenNames::default(), 100)?;
//! let shard = TokenShard::open("shards/000.bin.gz")?;
//! let dataset = PretrainingDataset::new(shard, special_tokens, SpanMaskingConfig::default())?;
//! let loader = BatchLoader::new(Arc::new(dataset), 32, 4)?;
//! for batch in loader.epoch(42) {
//!     println!("{:?}", batch.input_ids.size());
//! }
//! # Ok(())
//! # }
//! ```

mod dataset;
mod loader;

pub use dataset::{PretrainingDataset, SpanMaskingConfig, TrainingExample};
pub use loader::{collate, Batch, BatchIter, BatchLoader};
