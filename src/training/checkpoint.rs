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

use crate::common::io_utils::publish_atomically;
use crate::optim::{
    GradScaler, GradScalerState, LRScheduler, Optimizer, OptimizerKind, OptimizerState,
    SchedulerState,
};
use crate::training::RunState;
use crate::PretrainError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tch::{nn, Device, Tensor};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"T5CKPT\0\0";
pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_FILE_NAME: &str = "model.bin";
/// Suffix of the previous checkpoint, moved aside while the new one is written
pub const ASIDE_SUFFIX: &str = "_tmp";

const MODEL_PREFIX: &str = "model/";
const OPTIMIZER_PREFIX: &str = "optimizer/";

#[derive(Debug, Serialize, Deserialize)]
struct OptimizerScalars {
    kind: OptimizerKind,
    step: i64,
    learning_rate: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMetadata {
    global_step: u64,
    epoch: usize,
    args: serde_json::Value,
    scheduler: SchedulerState,
    grad_scaler: GradScalerState,
    optimizer: OptimizerScalars,
    model_tensors: Vec<String>,
    optimizer_tensors: Vec<String>,
}

/// # Snapshot of a training run
///
/// Holds everything needed to continue a run exactly where it stopped. `global_step` is the number
/// of optimizer updates applied to the saved model and optimizer state, `epoch` the last completed
/// epoch.
pub struct Checkpoint {
    pub model: Vec<(String, Tensor)>,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    pub grad_scaler: GradScalerState,
    pub global_step: u64,
    pub epoch: usize,
    /// Resolved run arguments, as a key/value record
    pub args: serde_json::Value,
}

fn corrupted(message: String) -> PretrainError {
    PretrainError::CheckpointCorruptionError(message)
}

impl Checkpoint {
    /// Captures the current state of a run. Tensors are shared with the live state, not copied.
    pub fn capture<A: Serialize>(
        var_store: &nn::VarStore,
        optimizer: &Optimizer,
        scheduler: &LRScheduler,
        grad_scaler: &GradScaler,
        run_state: RunState,
        args: &A,
    ) -> Result<Checkpoint, PretrainError> {
        let mut model: Vec<(String, Tensor)> = var_store.variables().into_iter().collect();
        model.sort_by(|a, b| a.0.cmp(&b.0));
        let args = serde_json::to_value(args).map_err(|e| {
            PretrainError::InvalidConfigurationError(format!("could not serialize arguments: {e}"))
        })?;
        Ok(Checkpoint {
            model,
            optimizer: optimizer.state_dict(),
            scheduler: scheduler.state(),
            grad_scaler: grad_scaler.state(),
            global_step: run_state.global_step,
            epoch: run_state.epoch,
            args,
        })
    }

    /// Run state of the run continuing from this checkpoint.
    pub fn resume_state(&self) -> RunState {
        RunState {
            epoch: self.epoch + 1,
            global_step: self.global_step,
        }
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), PretrainError> {
        let metadata = CheckpointMetadata {
            global_step: self.global_step,
            epoch: self.epoch,
            args: self.args.clone(),
            scheduler: self.scheduler,
            grad_scaler: self.grad_scaler,
            optimizer: OptimizerScalars {
                kind: self.optimizer.kind,
                step: self.optimizer.step,
                learning_rate: self.optimizer.learning_rate,
            },
            model_tensors: self.model.iter().map(|(name, _)| name.clone()).collect(),
            optimizer_tensors: self
                .optimizer
                .tensors
                .iter()
                .map(|(name, _)| name.clone())
                .collect(),
        };
        let metadata = serde_json::to_vec(&metadata).map_err(|e| {
            PretrainError::IOError(format!("could not serialize checkpoint metadata: {e}"))
        })?;

        writer.write_all(CHECKPOINT_MAGIC)?;
        writer.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
        writer.write_all(&(metadata.len() as u64).to_le_bytes())?;
        writer.write_all(&metadata)?;

        let payload: Vec<(String, Tensor)> = self
            .model
            .iter()
            .map(|(name, tensor)| (format!("{MODEL_PREFIX}{name}"), tensor))
            .chain(
                self.optimizer
                    .tensors
                    .iter()
                    .map(|(name, tensor)| (format!("{OPTIMIZER_PREFIX}{name}"), tensor)),
            )
            .map(|(name, tensor)| (name, tensor.detach().to_device(Device::Cpu)))
            .collect();
        Tensor::save_multi_to_stream(&payload, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a checkpoint. Any malformed content is reported as a `CheckpointCorruptionError`.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Checkpoint, PretrainError> {
        let mut magic = [0u8; 8];
        read_exact(&mut reader, &mut magic, "magic")?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(corrupted("not a checkpoint file".to_string()));
        }
        let mut version = [0u8; 4];
        read_exact(&mut reader, &mut version, "version")?;
        let version = u32::from_le_bytes(version);
        if version != CHECKPOINT_VERSION {
            return Err(corrupted(format!("unsupported checkpoint version {version}")));
        }
        let mut metadata_length = [0u8; 8];
        read_exact(&mut reader, &mut metadata_length, "metadata length")?;
        let metadata_length = usize::try_from(u64::from_le_bytes(metadata_length))
            .map_err(|_| corrupted("metadata length out of range".to_string()))?;

        let mut metadata = Vec::new();
        (&mut reader)
            .take(metadata_length as u64)
            .read_to_end(&mut metadata)?;
        if metadata.len() != metadata_length {
            return Err(corrupted("truncated metadata".to_string()));
        }
        let metadata: CheckpointMetadata = serde_json::from_slice(&metadata)
            .map_err(|e| corrupted(format!("invalid metadata: {e}")))?;

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        let tensors = Tensor::load_multi_from_stream(Cursor::new(payload))
            .map_err(|e| corrupted(format!("invalid tensor payload: {e}")))?;
        let mut tensors: HashMap<String, Tensor> = tensors.into_iter().collect();

        let mut take = |prefix: &str, names: Vec<String>| {
            names
                .into_iter()
                .map(|name| {
                    tensors
                        .remove(&format!("{prefix}{name}"))
                        .map(|tensor| (name.clone(), tensor))
                        .ok_or_else(|| corrupted(format!("tensor {prefix}{name} missing")))
                })
                .collect::<Result<Vec<(String, Tensor)>, PretrainError>>()
        };
        let model = take(MODEL_PREFIX, metadata.model_tensors)?;
        let optimizer_tensors = take(OPTIMIZER_PREFIX, metadata.optimizer_tensors)?;

        Ok(Checkpoint {
            model,
            optimizer: OptimizerState {
                kind: metadata.optimizer.kind,
                step: metadata.optimizer.step,
                learning_rate: metadata.optimizer.learning_rate,
                tensors: optimizer_tensors,
            },
            scheduler: metadata.scheduler,
            grad_scaler: metadata.grad_scaler,
            global_step: metadata.global_step,
            epoch: metadata.epoch,
            args: metadata.args,
        })
    }

    /// Loads the checkpoint stored at `path`. A missing file is an `IOError`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Checkpoint, PretrainError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            PretrainError::IOError(format!("could not open checkpoint {}: {e}", path.display()))
        })?;
        Checkpoint::read_from(BufReader::new(file)).map_err(|error| match error {
            PretrainError::CheckpointCorruptionError(message) | PretrainError::IOError(message) => {
                corrupted(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Copies the saved weights into the variables of `var_store`.
    ///
    /// Variables absent from the checkpoint keep their current values and are returned; with
    /// `strict` they are an error instead. Saved tensors with no matching variable are ignored. A
    /// shape disagreement is always an error.
    pub fn restore_model(
        &self,
        var_store: &nn::VarStore,
        strict: bool,
    ) -> Result<Vec<String>, PretrainError> {
        let saved: HashMap<&str, &Tensor> = self
            .model
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();
        let mut variables: Vec<(String, Tensor)> = var_store.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        let mut missing = Vec::new();
        let mut restored = 0usize;
        tch::no_grad(|| -> Result<(), PretrainError> {
            for (name, mut variable) in variables {
                match saved.get(name.as_str()) {
                    Some(tensor) if tensor.size() == variable.size() => {
                        variable.f_copy_(
                            &tensor.to_kind(variable.kind()).to_device(variable.device()),
                        )?;
                        restored += 1;
                    }
                    Some(tensor) => {
                        return Err(corrupted(format!(
                            "{name} has shape {:?} in the checkpoint, {:?} in the model",
                            tensor.size(),
                            variable.size()
                        )));
                    }
                    None => missing.push(name),
                }
            }
            Ok(())
        })?;

        if strict && !missing.is_empty() {
            return Err(corrupted(format!("missing key {}", missing.join(", "))));
        }
        let unexpected = self.model.len() - restored;
        if unexpected > 0 {
            tracing::warn!(unexpected, "checkpoint tensors without matching model parameter");
        }
        if !missing.is_empty() {
            tracing::warn!(
                missing = missing.len(),
                "parameters absent from the checkpoint keep their initialization: {}",
                missing.join(", ")
            );
        }
        Ok(missing)
    }

    /// Restores the model (non-strict), the optimizer, the schedule and the loss scale.
    pub fn restore(
        &self,
        var_store: &nn::VarStore,
        optimizer: &mut Optimizer,
        scheduler: &mut LRScheduler,
        grad_scaler: &mut GradScaler,
    ) -> Result<RunState, PretrainError> {
        self.restore_model(var_store, false)?;
        let optimizer_state = OptimizerState {
            kind: self.optimizer.kind,
            step: self.optimizer.step,
            learning_rate: self.optimizer.learning_rate,
            tensors: self
                .optimizer
                .tensors
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.shallow_clone()))
                .collect(),
        };
        optimizer.load_state_dict(optimizer_state)?;
        scheduler.load_state(&self.scheduler)?;
        grad_scaler.load_state(&self.grad_scaler)?;
        Ok(self.resume_state())
    }
}

fn read_exact<R: Read>(reader: &mut R, buffer: &mut [u8], field: &str) -> Result<(), PretrainError> {
    reader
        .read_exact(buffer)
        .map_err(|e| corrupted(format!("could not read {field}: {e}")))
}

/// Path of the copy a checkpoint is moved to before being replaced.
pub fn aside_path(checkpoint_path: &Path) -> PathBuf {
    let mut file_name = checkpoint_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| CHECKPOINT_FILE_NAME.into());
    file_name.push(ASIDE_SUFFIX);
    checkpoint_path.with_file_name(file_name)
}

/// Checkpoint to resume from: `path` itself, or its aside copy if the process stopped after the
/// previous checkpoint was moved aside and before the new one was published.
pub fn resolve_resume_path(path: &Path) -> Result<PathBuf, PretrainError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    let aside = aside_path(path);
    if aside.is_file() {
        tracing::warn!(
            "checkpoint {} not found, resuming from {}",
            path.display(),
            aside.display()
        );
        return Ok(aside);
    }
    Err(PretrainError::IOError(format!(
        "no checkpoint at {} or {}",
        path.display(),
        aside.display()
    )))
}

/// # Publishes the checkpoints of a run under its output directory
pub struct CheckpointWriter {
    path: PathBuf,
}

impl CheckpointWriter {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> CheckpointWriter {
        CheckpointWriter {
            path: output_dir.as_ref().join(CHECKPOINT_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the checkpoint of the run.
    ///
    /// An existing checkpoint is first renamed to its aside copy. The new checkpoint is written to
    /// a temporary file and renamed into place once complete, so that `model.bin` is never
    /// partially written and the aside copy survives a failed write.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, PretrainError> {
        if self.path.is_file() {
            fs::rename(&self.path, aside_path(&self.path)).map_err(|e| {
                PretrainError::IOError(format!(
                    "could not move {} aside: {e}",
                    self.path.display()
                ))
            })?;
        }
        publish_atomically(&self.path, |writer| checkpoint.write_to(writer))?;
        tracing::info!(
            global_step = checkpoint.global_step,
            epoch = checkpoint.epoch,
            "checkpoint saved to {}",
            self.path.display()
        );
        Ok(self.path.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aside_copy_name() {
        assert_eq!(
            aside_path(Path::new("checkpoints/base/model.bin")),
            PathBuf::from("checkpoints/base/model.bin_tmp")
        );
    }

    #[test]
    fn rejects_foreign_files() {
        let result = Checkpoint::read_from(Cursor::new(b"PK\x03\x04 not a checkpoint".to_vec()));
        assert!(matches!(
            result,
            Err(PretrainError::CheckpointCorruptionError(_))
        ));
    }
}
