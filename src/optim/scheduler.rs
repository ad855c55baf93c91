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
use std::f64::consts::PI;

/// Floor of the cosine schedule, relative to the base learning rate.
pub const COSINE_MIN_FACTOR: f64 = 0.1;
/// Start factor of the linear warmup and end factor of the linear decay.
pub const LINEAR_END_FACTOR: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
/// # Shape of the learning rate schedule
pub enum SchedulerKind {
    /// Linear warmup, then cosine decay down to `COSINE_MIN_FACTOR`
    Cosine,
    /// Linear warmup from `LINEAR_END_FACTOR`, multiplied by a linear decay to `LINEAR_END_FACTOR`
    /// over the whole run
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: SchedulerKind,
    pub step: u64,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

/// # Step-based learning rate schedule
///
/// The learning rate at step `s` is `base_learning_rate * factor(s)`; the schedule starts at
/// step 0 and advances once per optimizer step.
#[derive(Clone, Debug, PartialEq)]
pub struct LRScheduler {
    kind: SchedulerKind,
    base_learning_rate: f64,
    warmup_steps: u64,
    total_steps: u64,
    step: u64,
}

impl LRScheduler {
    /// Builds the schedule of a run of `total_steps` steps, of which the first
    /// `floor(total_steps * warmup_proportion)` are warmup.
    pub fn new(
        kind: SchedulerKind,
        base_learning_rate: f64,
        total_steps: u64,
        warmup_proportion: f64,
    ) -> Result<LRScheduler, PretrainError> {
        if total_steps == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "the learning rate schedule requires at least one step".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&warmup_proportion) {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "warmup proportion must lie in [0, 1], got {warmup_proportion}"
            )));
        }
        Ok(LRScheduler {
            kind,
            base_learning_rate,
            warmup_steps: (total_steps as f64 * warmup_proportion) as u64,
            total_steps,
            step: 0,
        })
    }

    pub fn factor(&self, step: u64) -> f64 {
        match self.kind {
            SchedulerKind::Cosine => {
                if step < self.warmup_steps {
                    return step as f64 / self.warmup_steps.max(1) as f64;
                }
                let progress = (step - self.warmup_steps) as f64
                    / (self.total_steps.saturating_sub(self.warmup_steps)).max(1) as f64;
                let cosine = 0.5 * (1.0 + (PI * progress).cos());
                (COSINE_MIN_FACTOR + (1.0 - COSINE_MIN_FACTOR) * cosine).max(COSINE_MIN_FACTOR)
            }
            SchedulerKind::Linear => {
                let warmup = if self.warmup_steps == 0 {
                    1.0
                } else {
                    let progress = step.min(self.warmup_steps) as f64 / self.warmup_steps as f64;
                    LINEAR_END_FACTOR + (1.0 - LINEAR_END_FACTOR) * progress
                };
                let progress = step.min(self.total_steps) as f64 / self.total_steps as f64;
                let decay = 1.0 + (LINEAR_END_FACTOR - 1.0) * progress;
                warmup * decay
            }
        }
    }

    /// Learning rate for the next optimizer step.
    pub fn learning_rate(&self) -> f64 {
        self.base_learning_rate * self.factor(self.step)
    }

    /// Advances the schedule and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.learning_rate()
    }

    pub fn current_step(&self) -> u64 {
        self.step
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            kind: self.kind,
            step: self.step,
            warmup_steps: self.warmup_steps,
            total_steps: self.total_steps,
        }
    }

    /// Restores the position in the schedule. The base learning rate stays the configured one.
    pub fn load_state(&mut self, state: &SchedulerState) -> Result<(), PretrainError> {
        if state.kind != self.kind {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "scheduler state was saved for {:?}, current schedule is {:?}",
                state.kind, self.kind
            )));
        }
        self.warmup_steps = state.warmup_steps;
        self.total_steps = state.total_steps.max(1);
        self.step = state.step;
        Ok(())
    }
}
