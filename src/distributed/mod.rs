//! # Distributed coordination
//!
//! One process runs per accelerator. Processes are placed by the cluster scheduler
//! ([`ClusterEnv`]) and cooperate through blocking collectives behind the [`Communicator`] trait:
//! - [`SingleProcess`] for a world of one
//! - [`LocalGroup`] for ranks running as threads of one process
//! - [`TcpCommunicator`] for ranks spread over nodes, exchanging host buffers
//! - `NcclCommunicator` (feature `cuda`) for ranks on CUDA devices: gradients are reduced on the
//!   device by NCCL, the TCP group only bootstraps it and carries the scalar collectives
//!
//! The [`Coordinator`] builds the operations the training loop needs on top of these collectives:
//! per-rank seeds, shard rotation, agreement on the epoch length and gradient averaging.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use std::time::Duration;
//! use t5_pretrain::distributed::{ClusterEnv, Coordinator, TcpCommunicator};
//!
//! let env = ClusterEnv::from_env()?;
//! let communicator = TcpCommunicator::init(
//!     env.rank,
//!     env.world_size,
//!     &env.master_addr,
//!     Duration::from_secs(600),
//! )?;
//! let mut coordinator = Coordinator::new(communicator);
//! let steps = coordinator.agree_on_epoch_length(120)?;
//! # Ok(())
//! # }
//! ```

mod env;
mod local;
#[cfg(feature = "cuda")]
mod nccl;
mod tcp;

pub use env::{
    ClusterEnv, DEVICES_PER_NODE_VAR, HOSTNAME_VAR, MASTER_ADDR_VAR, MASTER_PORT_VAR, RANK_VAR,
    WORLD_SIZE_VAR,
};
pub use local::{LocalCommunicator, LocalGroup};
#[cfg(feature = "cuda")]
pub use nccl::NcclCommunicator;
pub use tcp::TcpCommunicator;

use crate::PretrainError;
use tch::{nn, Device, Kind, Tensor};

/// # Blocking collective operations
///
/// Every rank of the group must issue the same sequence of collectives. A rank that is missing,
/// has exited or issues a different operation makes the collective fail with a
/// `CollectiveCommunicationError` on the ranks that are still running.
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Global minimum of one value per rank.
    fn all_reduce_min(&mut self, value: i64) -> Result<i64, PretrainError>;

    /// Element-wise sum across ranks, written back into `values` on every rank.
    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<(), PretrainError>;

    /// Element-wise sum of a tensor across ranks, in place.
    ///
    /// The default goes through host memory with [`Communicator::all_reduce_sum`]; device
    /// backends reduce the tensor where it lives.
    fn all_reduce_sum_tensor(&mut self, tensor: &mut Tensor) -> Result<(), PretrainError> {
        let mut values = Vec::<f32>::try_from(
            &tensor
                .detach()
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view(-1),
        )?;
        self.all_reduce_sum(&mut values)?;
        let reduced = Tensor::from_slice(&values)
            .view_as(tensor)
            .to_kind(tensor.kind())
            .to_device(tensor.device());
        tch::no_grad(|| tensor.copy_(&reduced));
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), PretrainError>;
}

impl<C: Communicator + ?Sized> Communicator for Box<C> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_reduce_min(&mut self, value: i64) -> Result<i64, PretrainError> {
        (**self).all_reduce_min(value)
    }

    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<(), PretrainError> {
        (**self).all_reduce_sum(values)
    }

    fn all_reduce_sum_tensor(&mut self, tensor: &mut Tensor) -> Result<(), PretrainError> {
        (**self).all_reduce_sum_tensor(tensor)
    }

    fn barrier(&mut self) -> Result<(), PretrainError> {
        (**self).barrier()
    }
}

/// Sends the bytes of rank 0 to every rank. All ranks pass a buffer of the same length, only
/// the content given by rank 0 is used.
#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
pub(crate) fn broadcast_bytes<C: Communicator + ?Sized>(
    communicator: &mut C,
    bytes: &[u8],
) -> Result<Vec<u8>, PretrainError> {
    let is_root = communicator.rank() == 0;
    let mut values: Vec<f32> = bytes
        .iter()
        .map(|byte| if is_root { *byte as f32 } else { 0.0 })
        .collect();
    communicator.all_reduce_sum(&mut values)?;
    values
        .into_iter()
        .map(|value| {
            if (0.0..=255.0).contains(&value) && value.fract() == 0.0 {
                Ok(value as u8)
            } else {
                Err(PretrainError::CollectiveCommunicationError(format!(
                    "broadcast byte out of range: {value}"
                )))
            }
        })
        .collect()
}

/// Contribution of one rank to a collective.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Contribution {
    Min(i64),
    Sum(Vec<f32>),
    Barrier,
}

impl Contribution {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Contribution::Min(_) => "all_reduce_min",
            Contribution::Sum(_) => "all_reduce_sum",
            Contribution::Barrier => "barrier",
        }
    }

    /// Reduces contributions given in rank order. All ranks must have issued the same operation
    /// with the same number of elements.
    pub(crate) fn reduce(contributions: Vec<Contribution>) -> Result<Contribution, PretrainError> {
        let mut contributions = contributions.into_iter().enumerate();
        let (_, mut reduced) = contributions.next().ok_or_else(|| {
            PretrainError::CollectiveCommunicationError("empty process group".to_string())
        })?;
        for (rank, contribution) in contributions {
            match (&mut reduced, contribution) {
                (Contribution::Min(current), Contribution::Min(value)) => {
                    *current = (*current).min(value)
                }
                (Contribution::Sum(current), Contribution::Sum(values))
                    if current.len() == values.len() =>
                {
                    current
                        .iter_mut()
                        .zip(values)
                        .for_each(|(total, value)| *total += value);
                }
                (Contribution::Barrier, Contribution::Barrier) => {}
                (expected, received) => {
                    return Err(PretrainError::CollectiveCommunicationError(format!(
                        "rank {rank} issued {} ({} elements) while rank 0 issued {} ({} elements)",
                        received.name(),
                        received.len(),
                        expected.name(),
                        expected.len()
                    )));
                }
            }
        }
        Ok(reduced)
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Contribution::Min(_) => 1,
            Contribution::Sum(values) => values.len(),
            Contribution::Barrier => 0,
        }
    }

    pub(crate) fn into_min(self) -> Result<i64, PretrainError> {
        match self {
            Contribution::Min(value) => Ok(value),
            other => Err(PretrainError::CollectiveCommunicationError(format!(
                "expected an all_reduce_min result, got {}",
                other.name()
            ))),
        }
    }

    pub(crate) fn into_sum(self, expected_len: usize) -> Result<Vec<f32>, PretrainError> {
        match self {
            Contribution::Sum(values) if values.len() == expected_len => Ok(values),
            other => Err(PretrainError::CollectiveCommunicationError(format!(
                "expected an all_reduce_sum result of {expected_len} elements, got {} ({} elements)",
                other.name(),
                other.len()
            ))),
        }
    }
}

/// # Group of a single process
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_min(&mut self, value: i64) -> Result<i64, PretrainError> {
        Ok(value)
    }

    fn all_reduce_sum(&mut self, _values: &mut [f32]) -> Result<(), PretrainError> {
        Ok(())
    }

    fn all_reduce_sum_tensor(&mut self, _tensor: &mut Tensor) -> Result<(), PretrainError> {
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), PretrainError> {
        Ok(())
    }
}

/// # Placement of this process, resolved at startup
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedContext {
    pub rank: usize,
    pub world_size: usize,
    /// Index of the accelerator used by this process on its node
    pub local_rank: usize,
    pub device: Device,
    pub hostname: String,
}

impl DistributedContext {
    /// Validates the scheduler environment against the `detected_devices` accelerators visible to
    /// the process and assigns the device.
    pub fn new(env: &ClusterEnv, detected_devices: usize) -> Result<Self, PretrainError> {
        env.validate_devices(detected_devices)?;
        Ok(DistributedContext {
            rank: env.rank,
            world_size: env.world_size,
            local_rank: env.local_rank(),
            device: env.device(detected_devices),
            hostname: env.hostname.clone(),
        })
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

/// # Coordination protocol of the training loop
pub struct Coordinator<C: Communicator> {
    communicator: C,
}

impl<C: Communicator> Coordinator<C> {
    pub fn new(communicator: C) -> Coordinator<C> {
        Coordinator { communicator }
    }

    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    pub fn world_size(&self) -> usize {
        self.communicator.world_size()
    }

    pub fn is_main(&self) -> bool {
        self.rank() == 0
    }

    pub fn communicator(&self) -> &C {
        &self.communicator
    }

    pub fn into_communicator(self) -> C {
        self.communicator
    }

    /// Seed of the data pipeline of this rank for `epoch`: `base_seed + rank + epoch * world_size`.
    ///
    /// Seeds are distinct across ranks and epochs for a fixed world size. Resuming with a
    /// different world size may reuse seeds of earlier epochs.
    pub fn epoch_seed(&self, base_seed: u64, epoch: usize) -> u64 {
        base_seed
            .wrapping_add(self.rank() as u64)
            .wrapping_add((epoch as u64).wrapping_mul(self.world_size() as u64))
    }

    /// Index of the training shard read by this rank at `epoch`.
    ///
    /// Ranks read distinct shards within an epoch as long as `n_shards >= world_size`, and every
    /// rank moves `world_size` shards forward at each epoch.
    pub fn shard_index(&self, epoch: usize, n_shards: usize) -> Result<usize, PretrainError> {
        if n_shards == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "no training shard available".to_string(),
            ));
        }
        Ok((self.rank() + epoch * self.world_size()) % n_shards)
    }

    /// Number of optimizer steps every rank runs this epoch: the global minimum of the number of
    /// full batches each rank can produce. Blocks until all ranks have reported.
    pub fn agree_on_epoch_length(
        &mut self,
        local_batches_available: usize,
    ) -> Result<usize, PretrainError> {
        let local = i64::try_from(local_batches_available).map_err(|_| {
            PretrainError::InvalidConfigurationError(format!(
                "batch count {local_batches_available} out of range"
            ))
        })?;
        let agreed = self.communicator.all_reduce_min(local)?;
        usize::try_from(agreed).map_err(|_| {
            PretrainError::CollectiveCommunicationError(format!(
                "invalid agreed epoch length {agreed}"
            ))
        })
    }

    /// Replaces every gradient of `var_store` by its average over the ranks.
    ///
    /// Variables are visited in name order and a variable without gradient contributes zeros, so
    /// that all ranks exchange buffers of the same layout. The gradients are flattened into one
    /// single precision buffer on the device of the variables and reduced with
    /// [`Communicator::all_reduce_sum_tensor`].
    pub fn synchronize_gradients(&mut self, var_store: &nn::VarStore) -> Result<(), PretrainError> {
        let world_size = self.world_size();
        if world_size == 1 {
            return Ok(());
        }

        let mut variables: Vec<(String, Tensor)> = var_store.variables().into_iter().collect();
        if variables.is_empty() {
            return Ok(());
        }
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        let device = var_store.device();
        let flattened: Vec<Tensor> = variables
            .iter()
            .map(|(_, variable)| {
                let gradient = variable.grad();
                if gradient.defined() {
                    gradient
                        .detach()
                        .to_device(device)
                        .to_kind(Kind::Float)
                        .reshape([-1])
                } else {
                    Tensor::zeros([variable.numel() as i64], (Kind::Float, device))
                }
            })
            .collect();
        let mut buffer = Tensor::cat(&flattened, 0);

        self.communicator.all_reduce_sum_tensor(&mut buffer)?;

        let averaged = buffer / world_size as f64;
        tch::no_grad(|| {
            let mut offset = 0i64;
            for (_, variable) in variables.iter() {
                let numel = variable.numel() as i64;
                let mut gradient = variable.grad();
                if gradient.defined() {
                    let values = averaged
                        .narrow(0, offset, numel)
                        .view_as(&gradient)
                        .to_kind(gradient.kind())
                        .to_device(gradient.device());
                    gradient.copy_(&values);
                }
                offset += numel;
            }
        });
        Ok(())
    }

    pub fn barrier(&mut self) -> Result<(), PretrainError> {
        self.communicator.barrier()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reduce_checks_operations() {
        let reduced = Contribution::reduce(vec![
            Contribution::Sum(vec![1.0, 2.0]),
            Contribution::Sum(vec![0.5, -2.0]),
        ])
        .unwrap();
        assert_eq!(reduced, Contribution::Sum(vec![1.5, 0.0]));

        assert!(Contribution::reduce(vec![Contribution::Min(1), Contribution::Barrier]).is_err());
        assert!(Contribution::reduce(vec![
            Contribution::Sum(vec![1.0]),
            Contribution::Sum(vec![1.0, 2.0])
        ])
        .is_err());
    }

    #[test]
    fn bytes_of_rank_zero_are_broadcast() {
        let payload: Vec<u8> = (0..=255u8).rev().collect();
        let handles: Vec<_> = LocalGroup::new(3)
            .into_iter()
            .map(|mut communicator| {
                let local = if communicator.rank() == 0 {
                    payload.clone()
                } else {
                    vec![7u8; payload.len()]
                };
                std::thread::spawn(move || broadcast_bytes(&mut communicator, &local))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), payload);
        }
    }

    #[test]
    fn single_process_is_identity() -> Result<(), PretrainError> {
        let mut coordinator = Coordinator::new(SingleProcess);
        assert_eq!(coordinator.agree_on_epoch_length(17)?, 17);
        assert_eq!(coordinator.epoch_seed(42, 3), 45);
        assert_eq!(coordinator.shard_index(5, 4)?, 1);
        Ok(())
    }
}
