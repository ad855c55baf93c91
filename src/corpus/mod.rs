//! # Sharded corpus tokenization and packaging
//!
//! Converts raw newline-delimited text corpora into per-rank token shards:
//! - `ingest` reads the compressed text files assigned to a worker rank, splits them into
//!   documents at blank lines and tokenizes every line
//! - `shard` redistributes the documents of a rank round-robin into a fixed number of
//!   compressed shards that can be loaded independently
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use t5_pretrain::corpus::{CorpusProcessor, PathTemplate, ShardWriter, DEFAULT_FAN_OUT};
//! use t5_pretrain::tokenization::TokenizerOption;
//!
//! let rank = 0;
//! let tokenizer = TokenizerOption::from_file("data/wordpiece.json", false)?;
//! let corpus = CorpusProcessor::new(&tokenizer)
//!     .load_and_tokenize(rank, &[PathTemplate::parse("data/segmented/{:03d}.txt.gz")?])?;
//! let writer = ShardWriter::new(
//!     PathTemplate::parse("data/tokenized/shard_{:04d}.bin.gz")?,
//!     DEFAULT_FAN_OUT,
//! )?;
//! let shard_paths = writer.write(rank, &corpus.documents)?;
//! # Ok(())
//! # }
//! ```

mod ingest;
mod shard;
mod template;

pub use ingest::{CorpusProcessor, DocumentAccumulator, TokenizedCorpus};
pub use shard::{
    partition_documents, shard_assignment, ShardWriter, TokenDtype, TokenShard, DEFAULT_FAN_OUT,
    SHARD_MAGIC, SHARD_VERSION,
};
pub use template::{count_shards, PathTemplate};

/// A document: one token id array per non-empty source line.
pub type Document = Vec<Vec<i64>>;
