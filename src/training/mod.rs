//! # Training loop driver
//!
//! Epoch-based pretraining with checkpoint and resume:
//! - [`TrainingArgs`]: run configuration, merged once with the arguments of a checkpoint
//! - [`Trainer`]: per epoch, load a shard, agree on the number of steps, train, checkpoint
//! - [`Checkpoint`] and [`CheckpointWriter`]: single-file snapshot of the run, replaced by moving
//!   the previous one aside before publishing the new one
//! - [`MetricsSink`]: per-step scalars, appended as JSON lines by the main process
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use clap::Parser;
//! use t5_pretrain::distributed::{Coordinator, SingleProcess};
//! use t5_pretrain::t5::{T5Config, T5ForPretraining};
//! use t5_pretrain::tokenization::{SpecialTokenNames, SpecialTokens, TokenizerOption};
//! use t5_pretrain::training::{JsonlMetrics, Trainer, TrainingArgs};
//! use t5_pretrain::Config;
//! use tch::{nn, Device};
//!
//! let args = TrainingArgs::parse().with_run_id();
//! let tokenizer = TokenizerOption::from_file(&args.vocab_path, args.lower_case)?;
//! let special_tokens =
//!     SpecialTokens::resolve(&tokenizer, &SpecialTokenNames::default(), args.num_sentinels)?;
//!
//! let var_store = nn::VarStore::new(Device::cuda_if_available());
//! let config = T5Config::from_file(&args.config_file)?;
//! let model = T5ForPretraining::new(var_store.root(), &config, special_tokens.pad_token_id);
//!
//! let metrics = JsonlMetrics::open(args.metrics_file())?;
//! let coordinator = Coordinator::new(SingleProcess);
//! let mut trainer = Trainer::new(args, var_store, model, coordinator, special_tokens, metrics)?;
//! trainer.run()?;
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod config;
mod metrics;
mod trainer;

pub use checkpoint::{
    aside_path, resolve_resume_path, Checkpoint, CheckpointWriter, ASIDE_SUFFIX,
    CHECKPOINT_FILE_NAME, CHECKPOINT_MAGIC, CHECKPOINT_VERSION,
};
pub use config::TrainingArgs;
pub use metrics::{JsonlMetrics, MetricsSink, NoMetrics, StepMetrics, METRICS_FILE_NAME};
pub use trainer::{Phase, RunState, Trainer};
