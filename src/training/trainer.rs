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

use crate::corpus::{count_shards, TokenShard};
use crate::data::{Batch, BatchLoader, PretrainingDataset};
use crate::distributed::{Communicator, Coordinator};
use crate::optim::{clip_grad_norm, GradScaler, LRScheduler, Optimizer};
use crate::t5::PretrainingModel;
use crate::tokenization::SpecialTokens;
use crate::training::checkpoint::{Checkpoint, CheckpointWriter};
use crate::training::config::TrainingArgs;
use crate::training::metrics::{run_progress_bar, MetricsSink, StepMetrics};
use crate::PretrainError;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tch::{nn, Device};

/// Position of a run: the epoch about to start and the number of optimizer steps applied so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub epoch: usize,
    pub global_step: u64,
}

/// Stage of the driver, reported when the run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Resume,
    LoadShard,
    Train,
    Checkpoint,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Resume => "resume",
            Phase::LoadShard => "load-shard",
            Phase::Train => "train",
            Phase::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// # Epoch-based training driver
///
/// Every epoch reads one token shard (rotating over the shards from epoch to epoch), agrees with
/// the other processes on the number of steps, runs them and lets the main process publish a
/// checkpoint. The run stops once `max_steps` optimizer steps have been applied in total.
///
/// Within a step, gradients are averaged across processes before the update is applied and before
/// the global step advances, so that all processes apply identical updates.
pub struct Trainer<M, C, S>
where
    M: PretrainingModel,
    C: Communicator,
    S: MetricsSink,
{
    args: TrainingArgs,
    var_store: nn::VarStore,
    model: M,
    optimizer: Optimizer,
    scheduler: LRScheduler,
    grad_scaler: GradScaler,
    coordinator: Coordinator<C>,
    special_tokens: SpecialTokens,
    metrics: S,
    checkpoint_writer: Option<CheckpointWriter>,
    state: RunState,
    phase: Phase,
}

impl<M, C, S> Trainer<M, C, S>
where
    M: PretrainingModel,
    C: Communicator,
    S: MetricsSink,
{
    /// Builds the optimizer, learning rate schedule and loss scaler for `model`, whose parameters
    /// live in `var_store`. Only the main process writes checkpoints.
    pub fn new(
        args: TrainingArgs,
        var_store: nn::VarStore,
        model: M,
        coordinator: Coordinator<C>,
        special_tokens: SpecialTokens,
        metrics: S,
    ) -> Result<Self, PretrainError> {
        args.validate()?;
        let mut optimizer = Optimizer::new(
            &var_store,
            args.optimizer,
            args.learning_rate,
            args.weight_decay,
        )?;
        let scheduler = LRScheduler::new(
            args.scheduler,
            args.learning_rate,
            args.max_steps,
            args.warmup_proportion,
        )?;
        optimizer.set_learning_rate(scheduler.learning_rate());
        let grad_scaler = GradScaler::new(args.mixed_precision);
        let checkpoint_writer = coordinator
            .is_main()
            .then(|| CheckpointWriter::new(&args.output_dir));

        if coordinator.is_main() {
            tracing::info!(
                "parameters without weight decay: {}",
                optimizer.no_decay_parameters().join(", ")
            );
        }

        Ok(Trainer {
            args,
            var_store,
            model,
            optimizer,
            scheduler,
            grad_scaler,
            coordinator,
            special_tokens,
            metrics,
            checkpoint_writer,
            state: RunState::default(),
            phase: Phase::Setup,
        })
    }

    /// Continues from `checkpoint`: model weights (non-strict), optimizer, schedule and loss
    /// scale are restored, the run restarts at the epoch following the saved one.
    pub fn resume(&mut self, checkpoint: &Checkpoint) -> Result<RunState, PretrainError> {
        self.phase = Phase::Resume;
        self.state = checkpoint.restore(
            &self.var_store,
            &mut self.optimizer,
            &mut self.scheduler,
            &mut self.grad_scaler,
        )?;
        self.optimizer
            .set_learning_rate(self.scheduler.learning_rate());
        tracing::info!(
            epoch = self.state.epoch,
            global_step = self.state.global_step,
            "resuming training"
        );
        Ok(self.state)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Stage the driver is in, or was in when an error was returned.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &LRScheduler {
        &self.scheduler
    }

    pub fn grad_scaler(&self) -> &GradScaler {
        &self.grad_scaler
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    pub fn into_parts(self) -> (nn::VarStore, M, Coordinator<C>, S) {
        (self.var_store, self.model, self.coordinator, self.metrics)
    }

    /// Runs epochs until `max_steps` optimizer steps have been applied.
    pub fn run(&mut self) -> Result<RunState, PretrainError> {
        let _span = tracing::info_span!("train", rank = self.coordinator.rank()).entered();
        self.phase = Phase::LoadShard;
        let shard_template = self.args.shard_template()?;
        let n_shards = count_shards(&self.args.input_dir, &shard_template)?;
        if self.coordinator.is_main() {
            let world_size = self.coordinator.world_size() as u64;
            tracing::info!(
                "training for {} steps with {world_size} processes: {} x {world_size} x {} x {} = {} subword instances",
                self.args.max_steps,
                self.args.max_steps,
                self.args.batch_size,
                self.args.seq_length,
                self.args.max_steps
                    * world_size
                    * self.args.batch_size as u64
                    * self.args.seq_length as u64,
            );
            tracing::info!(n_shards, "found training shards");
        }

        let progress = run_progress_bar(
            self.coordinator.is_main(),
            self.state.global_step,
            self.args.max_steps,
        );
        let mut empty_epochs = 0usize;
        while self.state.global_step < self.args.max_steps {
            let epoch = self.state.epoch;
            self.phase = Phase::LoadShard;
            let (loader, agreed_steps) = self.load_epoch(epoch, n_shards)?;

            if agreed_steps == 0 {
                empty_epochs += 1;
                if empty_epochs >= n_shards {
                    return Err(PretrainError::InvalidConfigurationError(format!(
                        "no full batch of {} examples in {n_shards} consecutive epochs, not enough training data",
                        self.args.batch_size
                    )));
                }
                tracing::warn!(epoch, "empty epoch, at least one process has no full batch");
            } else {
                empty_epochs = 0;
            }

            self.phase = Phase::Train;
            let remaining = self.args.max_steps - self.state.global_step;
            let steps = remaining.min(agreed_steps as u64) as usize;
            let seed = self.coordinator.epoch_seed(self.args.seed, epoch);
            for batch in loader.epoch(seed).take(steps) {
                let metrics = self.train_step(&batch)?;
                self.report(&metrics, &progress)?;
            }

            self.phase = Phase::Checkpoint;
            self.save_checkpoint()?;
            self.metrics.end_epoch(epoch)?;
            self.state.epoch += 1;
        }
        progress.finish();

        // All processes leave once the final checkpoint is published.
        self.coordinator.barrier()?;
        Ok(self.state)
    }

    /// Opens the shard of `epoch` and returns its batch loader with the agreed number of steps.
    fn load_epoch(
        &mut self,
        epoch: usize,
        n_shards: usize,
    ) -> Result<(BatchLoader, usize), PretrainError> {
        let shard_index = self.coordinator.shard_index(epoch, n_shards)?;
        let shard_path = self
            .args
            .shard_template()?
            .in_directory(&self.args.input_dir)
            .render(shard_index);
        let shard = TokenShard::open(&shard_path)?;
        let dataset = PretrainingDataset::new(
            shard,
            self.special_tokens.clone(),
            self.args.masking_config(),
        )?;
        let loader = BatchLoader::new(Arc::new(dataset), self.args.batch_size, self.args.prefetch)?;
        let local_steps = loader.batches_available() / self.args.epoch_fraction;
        tracing::info!(
            epoch,
            shard = shard_index,
            local_steps,
            "loaded training shard {}",
            shard_path.display()
        );

        let agreed_steps = self.coordinator.agree_on_epoch_length(local_steps)?;
        Ok((loader, agreed_steps))
    }

    /// One optimizer step on `batch`.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics, PretrainError> {
        let device = self.var_store.device();
        let batch = batch.to_device(device);
        let autocast = self.args.mixed_precision && device != Device::Cpu;
        let output = tch::autocast(autocast, || {
            self.model.forward_t(
                &batch.input_ids,
                &batch.attention_mask,
                &batch.target_ids,
                true,
            )
        })?;
        self.grad_scaler.scale(&output.loss).backward();

        self.coordinator.synchronize_gradients(&self.var_store)?;
        let found_inf = self.grad_scaler.unscale_and_check(&self.var_store)?;
        let grad_norm = clip_grad_norm(&self.var_store, self.args.max_gradient);
        if found_inf {
            tracing::debug!(
                global_step = self.state.global_step,
                "non-finite gradients, update skipped"
            );
        } else {
            self.optimizer.step();
        }
        let loss_scale = self.grad_scaler.loss_scale();
        self.grad_scaler.update(found_inf);
        // reported rate is the one of the next step
        let learning_rate = self.scheduler.step();
        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.zero_grad();
        self.state.global_step += 1;

        Ok(StepMetrics {
            global_step: self.state.global_step,
            epoch: self.state.epoch,
            loss: output.loss.f_double_value(&[])?,
            accuracy: output.accuracy.f_double_value(&[])? * 100.0,
            learning_rate,
            grad_norm,
            seq_length: self.args.seq_length,
            loss_scale,
            skipped: found_inf,
        })
    }

    fn report(&mut self, metrics: &StepMetrics, progress: &ProgressBar) -> Result<(), PretrainError> {
        self.metrics.record(metrics)?;
        if !self.coordinator.is_main() {
            return Ok(());
        }
        progress.set_message(format!(
            "loss: {:.2}, accuracy: {:.2}, grad_norm: {:.2}, lr: {:.5}",
            metrics.loss, metrics.accuracy, metrics.grad_norm, metrics.learning_rate
        ));
        progress.inc(1);
        if metrics.global_step % self.args.log_freq == 0 {
            tracing::info!(
                global_step = metrics.global_step,
                epoch = metrics.epoch,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                learning_rate = metrics.learning_rate,
                grad_norm = metrics.grad_norm,
                seq_length = metrics.seq_length,
                "train"
            );
        }
        Ok(())
    }

    /// Publishes the state at the end of the current epoch (main process only).
    pub fn save_checkpoint(&mut self) -> Result<(), PretrainError> {
        if let Some(writer) = &self.checkpoint_writer {
            let checkpoint = Checkpoint::capture(
                &self.var_store,
                &self.optimizer,
                &self.scheduler,
                &self.grad_scaler,
                self.state,
                &self.args,
            )?;
            writer.save(&checkpoint)?;
        }
        Ok(())
    }
}
