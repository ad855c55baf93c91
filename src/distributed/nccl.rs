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

use crate::distributed::{broadcast_bytes, Communicator, TcpCommunicator};
use crate::PretrainError;
use cudarc::driver::CudaContext;
use cudarc::nccl::{result, sys};
use std::fmt::Debug;
use std::sync::Arc;
use tch::{Device, Kind, Tensor};

const UNIQUE_ID_LEN: usize = 128;

/// # NCCL process group
///
/// Tensor reductions run on the CUDA device of the process with NCCL. The TCP group the
/// communicator is built from distributes the NCCL unique id and keeps carrying the scalar
/// collectives (epoch agreement, barriers).
pub struct NcclCommunicator {
    bootstrap: TcpCommunicator,
    local_rank: usize,
    comm: sys::ncclComm_t,
    _context: Arc<CudaContext>,
}

// SAFETY: the NCCL handle is only used through `&mut self`, by one thread at a time.
unsafe impl Send for NcclCommunicator {}

fn nccl_error(context: &str, error: impl Debug) -> PretrainError {
    PretrainError::CollectiveCommunicationError(format!("{context}: {error:?}"))
}

impl NcclCommunicator {
    /// Creates the NCCL communicator of the group formed by `bootstrap` on CUDA device
    /// `local_rank`. Blocks until every rank has joined.
    pub fn init(
        mut bootstrap: TcpCommunicator,
        local_rank: usize,
    ) -> Result<NcclCommunicator, PretrainError> {
        let rank = bootstrap.rank();
        let world_size = bootstrap.world_size();
        let context = CudaContext::new(local_rank)
            .map_err(|e| nccl_error(&format!("could not open CUDA device {local_rank}"), e))?;

        let local_id: Vec<u8> = if rank == 0 {
            result::get_uniqueid()
                .map_err(|e| nccl_error("could not create the NCCL id", e))?
                .internal
                .iter()
                .map(|byte| *byte as u8)
                .collect()
        } else {
            vec![0u8; UNIQUE_ID_LEN]
        };
        let shared_id = broadcast_bytes(&mut bootstrap, &local_id)?;
        let mut id = sys::ncclUniqueId {
            internal: [0; UNIQUE_ID_LEN],
        };
        for (target, byte) in id.internal.iter_mut().zip(shared_id) {
            *target = byte as _;
        }

        let mut comm: sys::ncclComm_t = std::ptr::null_mut();
        // SAFETY: every rank passes the id of rank 0 and the same world size.
        unsafe { result::comm_init_rank(&mut comm, world_size as i32, id, rank as i32) }
            .map_err(|e| nccl_error("could not join the NCCL group", e))?;
        tracing::info!(rank, world_size, local_rank, "NCCL communicator ready");

        Ok(NcclCommunicator {
            bootstrap,
            local_rank,
            comm,
            _context: context,
        })
    }
}

impl Communicator for NcclCommunicator {
    fn rank(&self) -> usize {
        self.bootstrap.rank()
    }

    fn world_size(&self) -> usize {
        self.bootstrap.world_size()
    }

    fn all_reduce_min(&mut self, value: i64) -> Result<i64, PretrainError> {
        self.bootstrap.all_reduce_min(value)
    }

    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<(), PretrainError> {
        self.bootstrap.all_reduce_sum(values)
    }

    fn all_reduce_sum_tensor(&mut self, tensor: &mut Tensor) -> Result<(), PretrainError> {
        let device = Device::Cuda(self.local_rank);
        if tensor.device() != device || tensor.kind() != Kind::Float || !tensor.is_contiguous() {
            return Err(PretrainError::CollectiveCommunicationError(format!(
                "NCCL reduction expects a contiguous float tensor on {device:?}, got {:?} on {:?}",
                tensor.kind(),
                tensor.device()
            )));
        }
        let buffer = tensor.data_ptr();
        // SAFETY: `buffer` holds `numel` contiguous f32 on the device of the communicator. The
        // reduction is queued on the default stream, after the kernels that wrote the tensor.
        unsafe {
            result::all_reduce(
                buffer,
                buffer,
                tensor.numel(),
                sys::ncclDataType_t::ncclFloat32,
                sys::ncclRedOp_t::ncclSum,
                self.comm,
                std::ptr::null_mut(),
            )
        }
        .map_err(|e| nccl_error("NCCL all-reduce failed", e))?;
        tch::Cuda::synchronize(self.local_rank as i64);
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), PretrainError> {
        self.bootstrap.barrier()
    }
}

impl Drop for NcclCommunicator {
    fn drop(&mut self) {
        // SAFETY: `comm` was created by `comm_init_rank` and is not used after this point.
        if let Err(error) = unsafe { result::comm_destroy(self.comm) } {
            tracing::warn!(?error, "could not release the NCCL communicator");
        }
    }
}
