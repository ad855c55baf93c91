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
use tch::{nn, Tensor};

pub const INITIAL_SCALE: f64 = 65536.0;
pub const GROWTH_FACTOR: f64 = 2.0;
pub const BACKOFF_FACTOR: f64 = 0.5;
pub const GROWTH_INTERVAL: u64 = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub enabled: bool,
    pub scale: f64,
    /// Consecutive steps without overflow since the last scale change
    pub growth_tracker: u64,
}

/// # Dynamic loss scaling for mixed precision training
///
/// The loss is multiplied by the current scale before the backward pass so that small half
/// precision gradients do not underflow. Gradients are unscaled before clipping. A step with a
/// non-finite gradient is skipped and the scale is halved; after `GROWTH_INTERVAL` consecutive
/// finite steps the scale doubles. When disabled, scaling is the identity and no step is skipped.
#[derive(Clone, Debug, PartialEq)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_tracker: u64,
}

impl GradScaler {
    pub fn new(enabled: bool) -> GradScaler {
        GradScaler {
            enabled,
            scale: INITIAL_SCALE,
            growth_tracker: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn loss_scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Tensor {
        if self.enabled {
            loss * self.scale
        } else {
            loss.shallow_clone()
        }
    }

    /// Divides all gradients by the loss scale and reports whether any of them is not finite.
    pub fn unscale_and_check(&self, var_store: &nn::VarStore) -> Result<bool, PretrainError> {
        if !self.enabled {
            return Ok(false);
        }
        let inverse_scale = 1.0 / self.scale;
        let found_inf = tch::no_grad(|| -> Result<bool, PretrainError> {
            let mut found_inf = false;
            for variable in var_store.trainable_variables() {
                let mut gradient = variable.grad();
                if !gradient.defined() {
                    continue;
                }
                let unscaled = &gradient * inverse_scale;
                gradient.f_copy_(&unscaled)?;
                if !found_inf {
                    found_inf = unscaled.isfinite().all().f_int64_value(&[])? == 0;
                }
            }
            Ok(found_inf)
        })?;
        Ok(found_inf)
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= BACKOFF_FACTOR;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        }
    }

    pub fn state(&self) -> GradScalerState {
        GradScalerState {
            enabled: self.enabled,
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    /// Restores the scale of a previous run. A disabled scaler ignores the saved state.
    pub fn load_state(&mut self, state: &GradScalerState) -> Result<(), PretrainError> {
        if !self.enabled {
            return Ok(());
        }
        if state.enabled {
            if !(state.scale.is_finite() && state.scale > 0.0) {
                return Err(PretrainError::CheckpointCorruptionError(format!(
                    "invalid loss scale {}",
                    state.scale
                )));
            }
            self.scale = state.scale;
            self.growth_tracker = state.growth_tracker;
        }
        Ok(())
    }
}
