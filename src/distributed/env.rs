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
use std::str::FromStr;
use tch::Device;

pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
pub const RANK_VAR: &str = "SLURM_PROCID";
pub const DEVICES_PER_NODE_VAR: &str = "SLURM_GPUS_ON_NODE";
pub const MASTER_ADDR_VAR: &str = "MASTER_ADDR";
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";
pub const HOSTNAME_VAR: &str = "HOSTNAME";

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// # Process placement supplied by the cluster scheduler
///
/// Read once at startup and passed down explicitly. Nothing below the binaries reads the process
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEnv {
    pub world_size: usize,
    pub rank: usize,
    pub devices_per_node: usize,
    /// `host:port` of the rank 0 rendezvous
    pub master_addr: String,
    pub hostname: String,
}

impl ClusterEnv {
    pub fn from_env() -> Result<ClusterEnv, PretrainError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the environment from an arbitrary variable lookup.
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use t5_pretrain::distributed::ClusterEnv;
    ///
    /// let vars: HashMap<&str, &str> = [
    ///     ("WORLD_SIZE", "8"),
    ///     ("SLURM_PROCID", "5"),
    ///     ("SLURM_GPUS_ON_NODE", "4"),
    ///     ("MASTER_ADDR", "node-001"),
    ///     ("MASTER_PORT", "29500"),
    /// ]
    /// .into_iter()
    /// .collect();
    /// let env = ClusterEnv::from_lookup(|name| vars.get(name).map(|value| value.to_string())).unwrap();
    /// assert_eq!(env.local_rank(), 1);
    /// assert_eq!(env.master_addr, "node-001:29500");
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<ClusterEnv, PretrainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let world_size: usize = required(&lookup, WORLD_SIZE_VAR)?;
        let rank: usize = required(&lookup, RANK_VAR)?;
        let devices_per_node: usize = required(&lookup, DEVICES_PER_NODE_VAR)?;

        if world_size == 0 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "{WORLD_SIZE_VAR} must be strictly positive"
            )));
        }
        if rank >= world_size {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "rank {rank} out of range for a world of size {world_size}"
            )));
        }
        if devices_per_node == 0 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "{DEVICES_PER_NODE_VAR} must be strictly positive"
            )));
        }

        let (host, port) = if world_size == 1 {
            (
                lookup(MASTER_ADDR_VAR).unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string()),
                optional(&lookup, MASTER_PORT_VAR)?.unwrap_or(DEFAULT_MASTER_PORT),
            )
        } else {
            (
                required::<String, _>(&lookup, MASTER_ADDR_VAR)?,
                required::<u16, _>(&lookup, MASTER_PORT_VAR)?,
            )
        };
        let hostname = lookup(HOSTNAME_VAR).unwrap_or_else(|| "localhost".to_string());

        Ok(ClusterEnv {
            world_size,
            rank,
            devices_per_node,
            master_addr: format!("{host}:{port}"),
            hostname,
        })
    }

    pub fn local_rank(&self) -> usize {
        self.rank % self.devices_per_node
    }

    /// Checks the scheduler's device count against the accelerators visible to the process.
    ///
    /// A CPU-only process (no accelerator detected) is accepted with one device per node.
    pub fn validate_devices(&self, detected: usize) -> Result<(), PretrainError> {
        if detected == 0 && self.devices_per_node == 1 {
            return Ok(());
        }
        if detected != self.devices_per_node {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "{DEVICES_PER_NODE_VAR}={} but {detected} accelerator(s) detected on {}",
                self.devices_per_node, self.hostname
            )));
        }
        Ok(())
    }

    /// Device assigned to this process given the number of detected accelerators.
    pub fn device(&self, detected: usize) -> Device {
        if detected == 0 {
            Device::Cpu
        } else {
            Device::Cuda(self.local_rank())
        }
    }
}

fn required<T, F>(lookup: &F, name: &str) -> Result<T, PretrainError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, name)?.ok_or_else(|| {
        PretrainError::InvalidConfigurationError(format!("environment variable {name} is not set"))
    })
}

fn optional<T, F>(lookup: &F, name: &str) -> Result<Option<T>, PretrainError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| {
            PretrainError::InvalidConfigurationError(format!(
                "environment variable {name} has an invalid value: {value:?}"
            ))
        }),
    }
}
