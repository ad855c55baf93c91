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

use clap::Parser;
use std::fs;
use std::process::ExitCode;
use t5_pretrain::distributed::{
    ClusterEnv, Communicator, Coordinator, DistributedContext, SingleProcess, TcpCommunicator,
    HOSTNAME_VAR, RANK_VAR,
};
#[cfg(feature = "cuda")]
use t5_pretrain::distributed::NcclCommunicator;
use t5_pretrain::t5::{T5Config, T5ForPretraining};
use t5_pretrain::tokenization::{SpecialTokenNames, SpecialTokens, TokenizerOption};
use t5_pretrain::training::{
    resolve_resume_path, Checkpoint, JsonlMetrics, MetricsSink, NoMetrics, Phase, RunState,
    Trainer, TrainingArgs,
};
use t5_pretrain::{Config, PretrainError};
use tch::nn;
use tracing_subscriber::EnvFilter;

/// What the top-level handler reports when the run fails.
struct FailureContext {
    rank: String,
    hostname: String,
    phase: Phase,
}

/// Gradients of CUDA processes are reduced on the device with NCCL.
#[cfg(feature = "cuda")]
fn collective_backend(
    bootstrap: TcpCommunicator,
    context: &DistributedContext,
) -> Result<Box<dyn Communicator>, PretrainError> {
    match context.device {
        tch::Device::Cuda(local_rank) => Ok(Box::new(NcclCommunicator::init(
            bootstrap, local_rank,
        )?)),
        _ => Ok(Box::new(bootstrap)),
    }
}

#[cfg(not(feature = "cuda"))]
fn collective_backend(
    bootstrap: TcpCommunicator,
    context: &DistributedContext,
) -> Result<Box<dyn Communicator>, PretrainError> {
    if matches!(context.device, tch::Device::Cuda(_)) {
        tracing::warn!("built without the cuda feature, gradients are exchanged over TCP");
    }
    Ok(Box::new(bootstrap))
}

fn run(cli: TrainingArgs, failure: &mut FailureContext) -> Result<RunState, PretrainError> {
    let env = ClusterEnv::from_env()?;
    failure.rank = env.rank.to_string();
    failure.hostname = env.hostname.clone();

    let detected_devices = tch::Cuda::device_count().max(0) as usize;
    let context = DistributedContext::new(&env, detected_devices)?;
    tracing::info!(
        rank = context.rank,
        world_size = context.world_size,
        local_rank = context.local_rank,
        host = %context.hostname,
        device = ?context.device,
        "process placed, {} accelerators per node",
        env.devices_per_node
    );

    failure.phase = Phase::Resume;
    let (args, checkpoint) = match &cli.checkpoint_path {
        Some(path) => {
            let path = resolve_resume_path(path)?;
            let checkpoint = Checkpoint::load(&path)?;
            let args = TrainingArgs::resolve_with_checkpoint(cli, &checkpoint.args)?;
            (args, Some(checkpoint))
        }
        None => (cli, None),
    };
    let args = args.with_run_id();
    args.validate()?;

    failure.phase = Phase::Setup;
    tch::manual_seed(args.seed.wrapping_add(context.rank as u64) as i64);

    let communicator: Box<dyn Communicator> = if context.world_size == 1 {
        Box::new(SingleProcess)
    } else {
        let bootstrap = TcpCommunicator::init(
            context.rank,
            context.world_size,
            &env.master_addr,
            args.collective_timeout(),
        )?;
        collective_backend(bootstrap, &context)?
    };
    let coordinator = Coordinator::new(communicator);
    if coordinator.is_main() {
        fs::create_dir_all(&args.output_dir)?;
    }

    let tokenizer = TokenizerOption::from_file(&args.vocab_path, args.lower_case)?;
    let special_tokens =
        SpecialTokens::resolve(&tokenizer, &SpecialTokenNames::default(), args.num_sentinels)?;
    let config = T5Config::from_file(&args.config_file)?;
    if tokenizer.vocab_size() as i64 > config.vocab_size {
        return Err(PretrainError::InvalidConfigurationError(format!(
            "vocabulary of {} tokens does not fit the model embeddings ({})",
            tokenizer.vocab_size(),
            config.vocab_size
        )));
    }

    let var_store = nn::VarStore::new(context.device);
    let model = T5ForPretraining::new(var_store.root(), &config, special_tokens.pad_token_id);
    if coordinator.is_main() {
        let n_params: i64 = var_store
            .trainable_variables()
            .iter()
            .map(|variable| variable.numel() as i64)
            .sum();
        tracing::info!(n_params, run_id = ?args.run_id, name = %args.name, "model built");
    }

    let metrics: Box<dyn MetricsSink> = match (coordinator.is_main(), &checkpoint) {
        (true, Some(checkpoint)) => Box::new(JsonlMetrics::resume(
            args.metrics_file(),
            checkpoint.global_step,
        )?),
        (true, None) => Box::new(JsonlMetrics::open(args.metrics_file())?),
        (false, _) => Box::new(NoMetrics),
    };
    let mut trainer = Trainer::new(args, var_store, model, coordinator, special_tokens, metrics)?;
    if let Some(checkpoint) = checkpoint {
        failure.phase = Phase::Resume;
        trainer.resume(&checkpoint)?;
    }

    let result = trainer.run();
    failure.phase = trainer.phase();
    result
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = TrainingArgs::parse();
    let mut failure = FailureContext {
        rank: std::env::var(RANK_VAR).unwrap_or_else(|_| "?".to_string()),
        hostname: std::env::var(HOSTNAME_VAR).unwrap_or_else(|_| "localhost".to_string()),
        phase: Phase::Setup,
    };

    match run(cli, &mut failure) {
        Ok(state) => {
            tracing::info!(
                epoch = state.epoch,
                global_step = state.global_step,
                "training finished"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!(
                "rank {} on {} failed during {}: {error}",
                failure.rank, failure.hostname, failure.phase
            );
            ExitCode::from(error.exit_code() as u8)
        }
    }
}
