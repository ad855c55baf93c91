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

use crate::corpus::PathTemplate;
use crate::data::SpanMaskingConfig;
use crate::optim::{OptimizerKind, SchedulerKind};
use crate::PretrainError;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// # Configuration of a pretraining run
///
/// Parsed from the command line on a fresh run. When resuming, the arguments stored in the
/// checkpoint take precedence over the command line (see [`TrainingArgs::resolve_with_checkpoint`]),
/// so that a resumed run behaves exactly as the interrupted one.
#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(author, version, about = "Distributed span-corruption pretraining of a T5 model")]
pub struct TrainingArgs {
    /// Directory containing the token shards
    #[arg(long)]
    pub input_dir: PathBuf,
    /// Name of the run
    #[arg(long, default_value = "base")]
    pub name: String,
    /// T5 model configuration (JSON)
    #[arg(long)]
    pub config_file: PathBuf,
    /// Directory where the checkpoint and the metrics are written
    #[arg(long)]
    pub output_dir: PathBuf,
    /// Vocabulary the corpus was tokenized with
    #[arg(long)]
    pub vocab_path: PathBuf,
    /// Checkpoint of a previous run to resume from
    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Lamb)]
    pub optimizer: OptimizerKind,
    #[arg(long, value_enum, default_value_t = SchedulerKind::Cosine)]
    pub scheduler: SchedulerKind,
    /// Maximum length of the encoder input, end of sequence token included
    #[arg(long, default_value_t = 512)]
    pub seq_length: usize,
    /// Batch size per process
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 2e-3)]
    pub learning_rate: f64,
    /// Total number of optimizer steps of the run
    #[arg(long, default_value_t = 250_000)]
    pub max_steps: u64,
    /// Fraction of the steps used for the learning rate warmup
    #[arg(long, default_value_t = 0.004)]
    pub warmup_proportion: f64,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Number of steps between two metric records
    #[arg(long, default_value_t = 10)]
    pub log_freq: u64,
    /// Fraction of the tokens masked by span corruption
    #[arg(long, default_value_t = 0.15)]
    pub mask_p: f64,
    /// Probability of truncating a segment to a random shorter length
    #[arg(long, default_value_t = 0.1)]
    pub short_p: f64,
    #[arg(long, default_value_t = 3.0)]
    pub mean_span_length: f64,
    #[arg(long, default_value_t = 0.1)]
    pub weight_decay: f64,
    /// Maximum gradient norm
    #[arg(long, default_value_t = 2.0)]
    pub max_gradient: f64,
    /// Mixed precision forward pass with dynamic loss scaling (`--mixed-precision false` disables it)
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub mixed_precision: bool,
    /// File name template of the token shards in `input_dir`
    #[arg(long, default_value = "shard_{:04d}.bin.gz")]
    pub shard_template: String,
    /// An epoch covers `1 / epoch_fraction` of the batches of a shard
    #[arg(long, default_value_t = 16)]
    pub epoch_fraction: usize,
    /// Number of span-corruption sentinel tokens in the vocabulary
    #[arg(long, default_value_t = 100)]
    pub num_sentinels: usize,
    /// Lower-case text before tokenization (WordPiece and SentencePiece vocabularies)
    #[arg(long)]
    pub lower_case: bool,
    /// Identifier of the run, generated on fresh runs and kept across resumes
    #[arg(long)]
    pub run_id: Option<String>,
    /// Seconds a collective operation may wait for the other processes
    #[arg(long, default_value_t = 1800)]
    pub collective_timeout_secs: u64,
    /// Number of batches prepared ahead of the training loop
    #[arg(long, default_value_t = 4)]
    pub prefetch: usize,
}

impl TrainingArgs {
    /// Merges the arguments stored in a checkpoint with the command line arguments.
    ///
    /// Fields present in the checkpoint override the command line, fields absent from it keep the
    /// command line value. `checkpoint_path` always keeps the command line value. Checkpoint
    /// arguments that are not a JSON object or hold values of the wrong type make the checkpoint
    /// unusable.
    pub fn resolve_with_checkpoint(
        cli: TrainingArgs,
        checkpoint_args: &Value,
    ) -> Result<TrainingArgs, PretrainError> {
        let saved = checkpoint_args.as_object().ok_or_else(|| {
            PretrainError::CheckpointCorruptionError(
                "checkpoint arguments are not a key/value record".to_string(),
            )
        })?;
        let checkpoint_path = cli.checkpoint_path.clone();

        let mut merged = serde_json::to_value(cli).map_err(|e| {
            PretrainError::InvalidConfigurationError(format!("could not serialize arguments: {e}"))
        })?;
        if let Value::Object(fields) = &mut merged {
            for (key, value) in saved {
                if key != "checkpoint_path" {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }

        let mut resolved: TrainingArgs = serde_json::from_value(merged).map_err(|e| {
            PretrainError::CheckpointCorruptionError(format!("invalid checkpoint arguments: {e}"))
        })?;
        resolved.checkpoint_path = checkpoint_path;
        Ok(resolved)
    }

    /// Assigns a fresh run identifier if none was given or inherited.
    pub fn with_run_id(mut self) -> TrainingArgs {
        if self.run_id.is_none() {
            self.run_id = Some(uuid::Uuid::new_v4().to_string());
        }
        self
    }

    pub fn validate(&self) -> Result<(), PretrainError> {
        let invalid = |message: String| Err(PretrainError::InvalidConfigurationError(message));
        if self.batch_size == 0 {
            return invalid("batch size must be positive".to_string());
        }
        if self.seq_length < 2 {
            return invalid(format!("sequence length {} is too short", self.seq_length));
        }
        if self.max_steps == 0 {
            return invalid("the run requires at least one step".to_string());
        }
        if self.epoch_fraction == 0 {
            return invalid("epoch fraction must be positive".to_string());
        }
        if self.log_freq == 0 {
            return invalid("logging frequency must be positive".to_string());
        }
        if self.max_gradient.is_nan() || self.max_gradient <= 0.0 {
            return invalid(format!("invalid gradient clipping value {}", self.max_gradient));
        }
        self.shard_template()?;
        Ok(())
    }

    /// File name template of the token shards, relative to `input_dir`.
    pub fn shard_template(&self) -> Result<PathTemplate, PretrainError> {
        PathTemplate::parse(&self.shard_template)
    }

    pub fn masking_config(&self) -> SpanMaskingConfig {
        SpanMaskingConfig {
            seq_length: self.seq_length,
            mask_p: self.mask_p,
            short_p: self.short_p,
            mean_span_length: self.mean_span_length,
        }
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.collective_timeout_secs)
    }

    /// Location of the checkpoint written by this run.
    pub fn checkpoint_file(&self) -> PathBuf {
        self.output_dir.join(super::checkpoint::CHECKPOINT_FILE_NAME)
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.output_dir.join(super::metrics::METRICS_FILE_NAME)
    }
}
