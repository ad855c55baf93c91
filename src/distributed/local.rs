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

use crate::distributed::{Communicator, Contribution};
use crate::PretrainError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

struct State {
    slots: Vec<Option<Contribution>>,
    arrived: usize,
    /// Number of completed collectives
    generation: u64,
    /// Outcome of the last completed collective
    outcome: Option<Result<Contribution, String>>,
    departed: Vec<bool>,
}

struct Shared {
    state: Mutex<State>,
    completed: Condvar,
    timeout: Duration,
}

/// # In-process group of ranks
///
/// Every rank runs on its own thread and holds one `LocalCommunicator`. Contributions are posted
/// to per-rank slots; the last rank to arrive reduces them in rank order, publishes the outcome
/// and wakes the others. A rank whose communicator is dropped leaves the group: collectives still
/// waiting for it, and every later collective, fail instead of blocking. So does a collective
/// that does not complete within the group timeout.
pub struct LocalGroup;

impl LocalGroup {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(world_size: usize) -> Vec<LocalCommunicator> {
        LocalGroup::with_timeout(world_size, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(world_size: usize, timeout: Duration) -> Vec<LocalCommunicator> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                slots: vec![None; world_size],
                arrived: 0,
                generation: 0,
                outcome: None,
                departed: vec![false; world_size],
            }),
            completed: Condvar::new(),
            timeout,
        });
        (0..world_size)
            .map(|rank| LocalCommunicator {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalCommunicator {
    fn lock(&self) -> Result<MutexGuard<'_, State>, PretrainError> {
        self.shared.state.lock().map_err(|_| poisoned())
    }

    fn exchange(&self, contribution: Contribution) -> Result<Contribution, PretrainError> {
        let mut state = self.lock()?;
        if let Some(rank) = state.departed.iter().position(|departed| *departed) {
            return Err(departed(rank));
        }
        let slot = state.slots.get_mut(self.rank).ok_or_else(poisoned)?;
        if slot.is_some() {
            return Err(PretrainError::CollectiveCommunicationError(format!(
                "rank {} joined a collective twice",
                self.rank
            )));
        }
        *slot = Some(contribution);
        state.arrived += 1;

        if state.arrived == self.world_size {
            let contributions: Vec<Contribution> =
                state.slots.iter_mut().filter_map(Option::take).collect();
            let outcome = Contribution::reduce(contributions);
            state.arrived = 0;
            state.generation += 1;
            state.outcome = Some(match &outcome {
                Ok(reduced) => Ok(reduced.clone()),
                Err(error) => Err(error.to_string()),
            });
            self.shared.completed.notify_all();
            return outcome;
        }

        let generation = state.generation;
        let deadline = Instant::now() + self.shared.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.abandon(&mut state);
                return Err(PretrainError::CollectiveCommunicationError(format!(
                    "rank {} timed out after {:?} waiting for the group",
                    self.rank, self.shared.timeout
                )));
            }
            state = self
                .shared
                .completed
                .wait_timeout(state, deadline - now)
                .map_err(|_| poisoned())?
                .0;
            if state.generation != generation {
                return match &state.outcome {
                    Some(Ok(reduced)) => Ok(reduced.clone()),
                    Some(Err(message)) => Err(PretrainError::CollectiveCommunicationError(
                        message.clone(),
                    )),
                    None => Err(poisoned()),
                };
            }
            let missing = state
                .departed
                .iter()
                .zip(state.slots.iter())
                .position(|(departed, slot)| *departed && slot.is_none());
            if let Some(rank) = missing {
                self.abandon(&mut state);
                return Err(departed(rank));
            }
        }
    }

    /// Withdraws the pending contribution of this rank and leaves the group.
    fn abandon(&self, state: &mut State) {
        if let Some(slot) = state.slots.get_mut(self.rank) {
            if slot.take().is_some() {
                state.arrived -= 1;
            }
        }
        if let Some(departed) = state.departed.get_mut(self.rank) {
            *departed = true;
        }
        self.shared.completed.notify_all();
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if let Some(departed) = state.departed.get_mut(self.rank) {
                *departed = true;
            }
        }
        self.shared.completed.notify_all();
    }
}

fn departed(rank: usize) -> PretrainError {
    PretrainError::CollectiveCommunicationError(format!("rank {rank} left the local group"))
}

fn poisoned() -> PretrainError {
    PretrainError::CollectiveCommunicationError("a rank of the local group panicked".to_string())
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_min(&mut self, value: i64) -> Result<i64, PretrainError> {
        self.exchange(Contribution::Min(value))?.into_min()
    }

    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<(), PretrainError> {
        let reduced = self
            .exchange(Contribution::Sum(values.to_vec()))?
            .into_sum(values.len())?;
        values.copy_from_slice(&reduced);
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), PretrainError> {
        self.exchange(Contribution::Barrier).map(|_| ())
    }
}
