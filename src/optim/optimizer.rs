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

use crate::PretrainError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::{nn, Kind, Tensor};

/// Parameters whose name contains one of these patterns are not weight-decayed.
pub const NO_DECAY_PATTERNS: [&str; 3] = ["bias", "layer_norm", "_embedding"];

pub const BETAS: (f64, f64) = (0.9, 0.98);
pub const EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
/// # Parameter update rule
pub enum OptimizerKind {
    /// Layer-wise adaptive moments (Adam update rescaled by a per-parameter trust ratio)
    Lamb,
    /// Adam with decoupled weight decay
    #[serde(alias = "adam")]
    #[value(name = "adamw", alias = "adam")]
    AdamW,
}

struct ParameterSlot {
    name: String,
    parameter: Tensor,
    weight_decay: f64,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// # Serializable optimizer state
/// Scalars go to the checkpoint metadata, moment estimates to the tensor payload as
/// `{parameter}.exp_avg` and `{parameter}.exp_avg_sq`.
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: i64,
    pub learning_rate: f64,
    pub tensors: Vec<(String, Tensor)>,
}

/// # AdamW / LAMB over the trainable variables of a `VarStore`
///
/// Parameters are split in two weight decay groups: parameters matching [`NO_DECAY_PATTERNS`] are
/// not decayed, all others use the configured weight decay.
pub struct Optimizer {
    kind: OptimizerKind,
    slots: Vec<ParameterSlot>,
    learning_rate: f64,
    step: i64,
}

pub fn applies_weight_decay(name: &str) -> bool {
    !NO_DECAY_PATTERNS
        .iter()
        .any(|pattern| name.contains(pattern))
}

impl Optimizer {
    pub fn new(
        var_store: &nn::VarStore,
        kind: OptimizerKind,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<Optimizer, PretrainError> {
        if learning_rate.is_nan() || learning_rate <= 0.0 || weight_decay < 0.0 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "invalid optimizer settings: learning rate {learning_rate}, weight decay {weight_decay}"
            )));
        }
        let mut variables: Vec<(String, Tensor)> = var_store
            .variables()
            .into_iter()
            .filter(|(_, variable)| variable.requires_grad())
            .collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        let slots = variables
            .into_iter()
            .map(|(name, parameter)| {
                let exp_avg = tch::no_grad(|| parameter.zeros_like());
                let exp_avg_sq = tch::no_grad(|| parameter.zeros_like());
                ParameterSlot {
                    weight_decay: if applies_weight_decay(&name) {
                        weight_decay
                    } else {
                        0.0
                    },
                    name,
                    parameter,
                    exp_avg,
                    exp_avg_sq,
                }
            })
            .collect();

        Ok(Optimizer {
            kind,
            slots,
            learning_rate,
            step: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> i64 {
        self.step
    }

    /// Names of the parameters excluded from weight decay.
    pub fn no_decay_parameters(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|slot| !applies_weight_decay(&slot.name))
            .map(|slot| slot.name.as_str())
            .collect()
    }

    /// Applies one update with the current gradients. Parameters without gradient are left
    /// untouched.
    pub fn step(&mut self) {
        self.step += 1;
        let (beta_1, beta_2) = BETAS;
        let bias_correction_1 = 1.0 - beta_1.powi(self.step as i32);
        let bias_correction_2 = 1.0 - beta_2.powi(self.step as i32);
        let learning_rate = self.learning_rate;
        let kind = self.kind;

        tch::no_grad(|| {
            for slot in self.slots.iter_mut() {
                let gradient = slot.parameter.grad();
                if !gradient.defined() {
                    continue;
                }
                let gradient = gradient.to_kind(slot.exp_avg.kind());

                let exp_avg = &slot.exp_avg * beta_1 + &gradient * (1.0 - beta_1);
                let exp_avg_sq =
                    &slot.exp_avg_sq * beta_2 + gradient.square() * (1.0 - beta_2);
                slot.exp_avg.copy_(&exp_avg);
                slot.exp_avg_sq.copy_(&exp_avg_sq);

                let denominator = (exp_avg_sq / bias_correction_2).sqrt() + EPSILON;
                let adam_update = exp_avg / bias_correction_1 / denominator;

                let updated = match kind {
                    OptimizerKind::AdamW => {
                        &slot.parameter * (1.0 - learning_rate * slot.weight_decay)
                            - adam_update * learning_rate
                    }
                    OptimizerKind::Lamb => {
                        let update = adam_update + &slot.parameter * slot.weight_decay;
                        let weight_norm =
                            slot.parameter.to_kind(Kind::Float).norm().double_value(&[]);
                        let update_norm =
                            update.to_kind(Kind::Float).norm().double_value(&[]);
                        let trust_ratio = if weight_norm > 0.0 && update_norm > 0.0 {
                            weight_norm / update_norm
                        } else {
                            1.0
                        };
                        &slot.parameter - update * (learning_rate * trust_ratio)
                    }
                };
                slot.parameter.copy_(&updated);
            }
        });
    }

    pub fn zero_grad(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.parameter.zero_grad();
        }
    }

    pub fn state_dict(&self) -> OptimizerState {
        let mut tensors = Vec::with_capacity(2 * self.slots.len());
        for slot in &self.slots {
            tensors.push((format!("{}.exp_avg", slot.name), slot.exp_avg.shallow_clone()));
            tensors.push((
                format!("{}.exp_avg_sq", slot.name),
                slot.exp_avg_sq.shallow_clone(),
            ));
        }
        OptimizerState {
            kind: self.kind,
            step: self.step,
            learning_rate: self.learning_rate,
            tensors,
        }
    }

    /// Restores a saved state.
    ///
    /// Parameters absent from the state (added to the architecture since the state was saved)
    /// keep fresh moment estimates. Moment estimates whose shape disagrees with the parameter
    /// make the state unusable.
    pub fn load_state_dict(&mut self, state: OptimizerState) -> Result<(), PretrainError> {
        if state.kind != self.kind {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "optimizer state was saved for {:?}, current optimizer is {:?}",
                state.kind, self.kind
            )));
        }
        let mut tensors: HashMap<String, Tensor> = state.tensors.into_iter().collect();
        let mut missing = Vec::new();
        tch::no_grad(|| -> Result<(), PretrainError> {
            for slot in self.slots.iter_mut() {
                for (suffix, target) in [
                    ("exp_avg", &mut slot.exp_avg),
                    ("exp_avg_sq", &mut slot.exp_avg_sq),
                ] {
                    let key = format!("{}.{suffix}", slot.name);
                    match tensors.remove(&key) {
                        Some(saved) if saved.size() == target.size() => {
                            target.copy_(&saved.to_kind(target.kind()).to_device(target.device()));
                        }
                        Some(saved) => {
                            return Err(PretrainError::CheckpointCorruptionError(format!(
                                "optimizer state {key} has shape {:?}, expected {:?}",
                                saved.size(),
                                target.size()
                            )));
                        }
                        None => missing.push(key),
                    }
                }
            }
            Ok(())
        })?;
        if !missing.is_empty() {
            tracing::warn!(
                missing = missing.len(),
                "optimizer state incomplete, fresh moments used for: {}",
                missing.join(", ")
            );
        }
        self.step = state.step;
        self.learning_rate = state.learning_rate;
        Ok(())
    }
}

/// Rescales all gradients so that their global L2 norm does not exceed `max_norm`.
///
/// Returns the norm before clipping. Gradients are left unchanged when the norm is not finite.
pub fn clip_grad_norm(var_store: &nn::VarStore, max_norm: f64) -> f64 {
    let gradients: Vec<Tensor> = var_store
        .trainable_variables()
        .iter()
        .map(|variable| variable.grad())
        .filter(|gradient| gradient.defined())
        .collect();

    let total_norm = tch::no_grad(|| {
        gradients
            .iter()
            .map(|gradient| {
                gradient
                    .to_kind(Kind::Float)
                    .square()
                    .sum(Kind::Double)
                    .double_value(&[])
            })
            .sum::<f64>()
            .sqrt()
    });

    if total_norm.is_finite() && total_norm > max_norm {
        let coefficient = max_norm / (total_norm + 1e-6);
        tch::no_grad(|| {
            for mut gradient in gradients {
                let clipped = &gradient * coefficient;
                gradient.copy_(&clipped);
            }
        });
    }
    total_norm
}

#[cfg(test)]
mod test {
    use super::*;
    use tch::Device;

    #[test]
    fn weight_decay_groups() {
        assert!(applies_weight_decay("encoder.block.0.layer.0.SelfAttention.q.weight"));
        assert!(!applies_weight_decay("encoder.block.0.layer.1.layer_norm.weight"));
        assert!(!applies_weight_decay("decoder.final_layer_norm.weight"));
        assert!(!applies_weight_decay("word_embedding.weight"));
        assert!(!applies_weight_decay("lm_head.bias"));
    }

    #[test]
    fn adamw_moves_against_gradient() {
        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().var("weight", &[3], nn::Init::Const(1.0));
        let mut optimizer = Optimizer::new(&vs, OptimizerKind::AdamW, 0.1, 0.0).unwrap();

        let loss = (&weight * Tensor::from_slice(&[1.0f32, -1.0, 0.0])).sum(Kind::Float);
        loss.backward();
        optimizer.step();

        let values = Vec::<f32>::try_from(&weight.detach()).unwrap();
        assert!(values[0] < 1.0);
        assert!(values[1] > 1.0);
        assert!((values[2] - 1.0).abs() < 1e-6);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn clipping_bounds_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().var("weight", &[2], nn::Init::Const(0.0));
        let loss = (&weight * Tensor::from_slice(&[30.0f32, 40.0])).sum(Kind::Float);
        loss.backward();

        let norm = clip_grad_norm(&vs, 5.0);
        assert!((norm - 50.0).abs() < 1e-4);
        let clipped = Vec::<f32>::try_from(&weight.grad()).unwrap();
        assert!((clipped[0] - 3.0).abs() < 1e-3);
        assert!((clipped[1] - 4.0).abs() < 1e-3);
    }
}
