use clap::Parser;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use t5_pretrain::optim::{GradScaler, LRScheduler, Optimizer, OptimizerKind, SchedulerKind};
use t5_pretrain::training::{
    aside_path, resolve_resume_path, Checkpoint, CheckpointWriter, RunState, TrainingArgs,
    CHECKPOINT_FILE_NAME,
};
use t5_pretrain::PretrainError;
use tch::{nn, Device, Kind, Tensor};
use tempfile::TempDir;

struct RunParts {
    vs: nn::VarStore,
    optimizer: Optimizer,
    scheduler: LRScheduler,
    scaler: GradScaler,
}

fn run_parts(init: f64) -> anyhow::Result<RunParts> {
    let vs = nn::VarStore::new(Device::Cpu);
    vs.root()
        .sub("encoder")
        .var("weight", &[2, 3], nn::Init::Const(init));
    vs.root()
        .sub("lm_head")
        .var("bias", &[3], nn::Init::Const(init));
    let optimizer = Optimizer::new(&vs, OptimizerKind::AdamW, 1e-2, 0.1)?;
    let scheduler = LRScheduler::new(SchedulerKind::Cosine, 1e-2, 100, 0.1)?;
    Ok(RunParts {
        vs,
        optimizer,
        scheduler,
        scaler: GradScaler::new(true),
    })
}

/// Applies `steps` updates with a fixed quadratic loss.
fn train(parts: &mut RunParts, steps: usize) {
    for _ in 0..steps {
        let loss = parts
            .vs
            .trainable_variables()
            .iter()
            .map(|variable| (variable * 3.0).square().sum(Kind::Float))
            .fold(Tensor::from(0f32), |total, term| total + term);
        loss.backward();
        parts.optimizer.step();
        parts.scaler.update(false);
        let learning_rate = parts.scheduler.step();
        parts.optimizer.set_learning_rate(learning_rate);
        parts.optimizer.zero_grad();
    }
}

fn capture(parts: &RunParts, state: RunState) -> anyhow::Result<Checkpoint> {
    Ok(Checkpoint::capture(
        &parts.vs,
        &parts.optimizer,
        &parts.scheduler,
        &parts.scaler,
        state,
        &json!({"batch_size": 8, "seed": 7}),
    )?)
}

fn variables(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    let mut variables: Vec<_> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    variables
}

#[test]
fn round_trip_restores_the_run() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let mut parts = run_parts(0.5)?;
    train(&mut parts, 5);
    parts.scaler.update(true);

    let writer = CheckpointWriter::new(directory.path());
    let path = writer.save(&capture(
        &parts,
        RunState {
            epoch: 3,
            global_step: 5,
        },
    )?)?;
    assert_eq!(path, directory.path().join(CHECKPOINT_FILE_NAME));

    let checkpoint = Checkpoint::load(&path)?;
    assert_eq!(checkpoint.global_step, 5);
    assert_eq!(checkpoint.epoch, 3);
    assert_eq!(checkpoint.args["seed"], 7);
    assert_eq!(
        checkpoint.resume_state(),
        RunState {
            epoch: 4,
            global_step: 5
        }
    );

    let mut resumed = run_parts(0.0)?;
    let state = checkpoint.restore(
        &resumed.vs,
        &mut resumed.optimizer,
        &mut resumed.scheduler,
        &mut resumed.scaler,
    )?;
    assert_eq!(state.global_step, 5);
    assert_eq!(resumed.scheduler, parts.scheduler);
    assert_eq!(resumed.scaler.state(), parts.scaler.state());
    assert_eq!(resumed.optimizer.step_count(), 5);
    for ((name, original), (_, restored)) in variables(&parts.vs).iter().zip(variables(&resumed.vs)) {
        assert!(original.equal(&restored), "{name} differs");
    }
    let original_moments = parts.optimizer.state_dict().tensors;
    let restored_moments = resumed.optimizer.state_dict().tensors;
    assert_eq!(original_moments.len(), restored_moments.len());
    for ((name, original), (restored_name, restored)) in original_moments.iter().zip(&restored_moments) {
        assert_eq!(name, restored_name);
        assert!(original.equal(restored), "{name} differs");
    }

    // both runs continue identically
    train(&mut parts, 2);
    train(&mut resumed, 2);
    for ((name, original), (_, restored)) in variables(&parts.vs).iter().zip(variables(&resumed.vs)) {
        assert!(original.allclose(&restored, 1e-6, 1e-6, false), "{name} diverged");
    }
    Ok(())
}

#[test]
fn previous_checkpoint_survives_an_interrupted_save() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let mut parts = run_parts(0.5)?;
    let writer = CheckpointWriter::new(directory.path());

    train(&mut parts, 1);
    writer.save(&capture(&parts, RunState { epoch: 0, global_step: 1 })?)?;
    train(&mut parts, 1);
    writer.save(&capture(&parts, RunState { epoch: 1, global_step: 2 })?)?;

    let main = directory.path().join(CHECKPOINT_FILE_NAME);
    let aside = aside_path(&main);
    assert!(aside.is_file());
    assert_eq!(Checkpoint::load(&aside)?.global_step, 1);
    assert_eq!(resolve_resume_path(&main)?, main);

    // stopped after moving the checkpoint aside, before publishing the new one
    fs::rename(&main, &aside)?;
    let resume_path = resolve_resume_path(&main)?;
    assert_eq!(resume_path, aside);
    let checkpoint = Checkpoint::load(&resume_path)?;
    assert_eq!(checkpoint.resume_state(), RunState { epoch: 2, global_step: 2 });

    fs::remove_file(&aside)?;
    assert!(matches!(
        resolve_resume_path(&main),
        Err(PretrainError::IOError(_))
    ));
    Ok(())
}

#[test]
fn damaged_checkpoints_are_reported() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let parts = run_parts(0.5)?;
    let path = CheckpointWriter::new(directory.path())
        .save(&capture(&parts, RunState::default())?)?;

    let bytes = fs::read(&path)?;
    fs::write(&path, &bytes[..bytes.len() - 64])?;
    assert!(matches!(
        Checkpoint::load(&path),
        Err(PretrainError::CheckpointCorruptionError(_))
    ));

    let mut wrong_version = bytes.clone();
    wrong_version[8] = 99;
    fs::write(&path, &wrong_version)?;
    assert!(matches!(
        Checkpoint::load(&path),
        Err(PretrainError::CheckpointCorruptionError(_))
    ));

    assert!(matches!(
        Checkpoint::load(directory.path().join("missing.bin")),
        Err(PretrainError::IOError(_))
    ));
    Ok(())
}

#[test]
fn model_restore_tolerates_new_parameters() -> anyhow::Result<()> {
    let saved = nn::VarStore::new(Device::Cpu);
    saved.root().var("shared", &[4], nn::Init::Const(2.0));
    let optimizer = Optimizer::new(&saved, OptimizerKind::Lamb, 1e-3, 0.0)?;
    let scheduler = LRScheduler::new(SchedulerKind::Linear, 1e-3, 10, 0.0)?;
    let checkpoint = Checkpoint::capture(
        &saved,
        &optimizer,
        &scheduler,
        &GradScaler::new(false),
        RunState::default(),
        &json!({}),
    )?;

    let grown = nn::VarStore::new(Device::Cpu);
    let shared = grown.root().var("shared", &[4], nn::Init::Const(0.0));
    let added = grown.root().var("added", &[2], nn::Init::Const(1.0));

    assert!(matches!(
        checkpoint.restore_model(&grown, true),
        Err(PretrainError::CheckpointCorruptionError(_))
    ));
    let missing = checkpoint.restore_model(&grown, false)?;
    assert_eq!(missing, vec!["added".to_string()]);
    assert_eq!(Vec::<f32>::try_from(&shared.detach())?, vec![2.0; 4]);
    assert_eq!(Vec::<f32>::try_from(&added.detach())?, vec![1.0; 2]);

    let reshaped = nn::VarStore::new(Device::Cpu);
    reshaped.root().var("shared", &[5], nn::Init::Const(0.0));
    assert!(matches!(
        checkpoint.restore_model(&reshaped, false),
        Err(PretrainError::CheckpointCorruptionError(_))
    ));
    Ok(())
}

#[test]
fn checkpoint_configuration_wins_over_the_command_line() -> anyhow::Result<()> {
    let saved_args = TrainingArgs::parse_from([
        "pretrain",
        "--input-dir",
        "data/tokenized",
        "--config-file",
        "configs/base.json",
        "--output-dir",
        "checkpoints/base",
        "--vocab-path",
        "data/wordpiece.json",
        "--batch-size",
        "8",
        "--scheduler",
        "linear",
    ])
    .with_run_id();
    let mut stored = serde_json::to_value(&saved_args)?;
    // written by an earlier version that did not record the prefetch depth
    if let Some(fields) = stored.as_object_mut() {
        fields.remove("prefetch");
    }

    let cli = TrainingArgs::parse_from([
        "pretrain",
        "--input-dir",
        "elsewhere",
        "--config-file",
        "configs/base.json",
        "--output-dir",
        "checkpoints/base",
        "--vocab-path",
        "data/wordpiece.json",
        "--checkpoint-path",
        "checkpoints/base/model.bin",
        "--batch-size",
        "64",
        "--prefetch",
        "9",
    ]);
    let resolved = TrainingArgs::resolve_with_checkpoint(cli, &stored)?;

    assert_eq!(resolved.batch_size, 8);
    assert_eq!(resolved.scheduler, SchedulerKind::Linear);
    assert_eq!(resolved.input_dir, PathBuf::from("data/tokenized"));
    assert_eq!(resolved.run_id, saved_args.run_id);
    assert_eq!(resolved.prefetch, 9);
    assert_eq!(
        resolved.checkpoint_path,
        Some(PathBuf::from("checkpoints/base/model.bin"))
    );
    Ok(())
}
