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

//! Star-topology collectives over TCP.
//!
//! Rank 0 listens on the rendezvous address and every other rank holds one connection to it.
//! Each connection opens with a handshake (`b"T5CC"`, rank as `u32`, world size as `u32`, little
//! endian). A collective is one request frame per non-root rank followed by one reply frame from
//! rank 0:
//!
//! | field   | type        |
//! |---------|-------------|
//! | op tag  | `u8`        |
//! | count   | `u64`       |
//! | payload | count items |
//!
//! A sum frame whose count differs from the length of the local contribution is rejected before
//! its payload is read.
//!
//! Rank 0 reads the requests in rank order, reduces them together with its own contribution and
//! writes the same reply to every peer. All reads and writes are bounded by the collective
//! timeout; an expired timeout, a closed connection or mismatched requests abort the collective.

use crate::distributed::{Communicator, Contribution};
use crate::PretrainError;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

const HANDSHAKE_MAGIC: &[u8; 4] = b"T5CC";
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

const TAG_MIN: u8 = 1;
const TAG_SUM: u8 = 2;
const TAG_BARRIER: u8 = 3;

enum Role {
    Root { peers: Vec<TcpStream> },
    Leaf { root: TcpStream },
}

pub struct TcpCommunicator {
    rank: usize,
    world_size: usize,
    role: Role,
}

fn comm_error(context: &str, error: io::Error) -> PretrainError {
    let reason = match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => "timed out".to_string(),
        io::ErrorKind::UnexpectedEof => "peer closed the connection".to_string(),
        _ => error.to_string(),
    };
    PretrainError::CollectiveCommunicationError(format!("{context}: {reason}"))
}

impl TcpCommunicator {
    /// Joins the process group.
    ///
    /// Rank 0 binds `master_addr` and waits for the `world_size - 1` other ranks; the other ranks
    /// retry connecting until `timeout` expires. Fails with a `CollectiveCommunicationError` if the
    /// group cannot be formed in time.
    pub fn init(
        rank: usize,
        world_size: usize,
        master_addr: &str,
        timeout: Duration,
    ) -> Result<TcpCommunicator, PretrainError> {
        if rank >= world_size {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "rank {rank} out of range for a world of size {world_size}"
            )));
        }
        let address = resolve(master_addr)?;
        let role = if rank == 0 {
            Role::Root {
                peers: accept_peers(address, world_size, timeout)?,
            }
        } else {
            Role::Leaf {
                root: connect_root(address, rank, world_size, timeout)?,
            }
        };
        tracing::debug!(rank, world_size, %address, "process group formed");
        Ok(TcpCommunicator {
            rank,
            world_size,
            role,
        })
    }

    fn collective(&mut self, contribution: Contribution) -> Result<Contribution, PretrainError> {
        match &mut self.role {
            Role::Leaf { root } => {
                write_frame(root, &contribution)
                    .map_err(|e| comm_error("could not send to rank 0", e))?;
                read_frame(root, contribution.len())
                    .map_err(|e| comm_error("no reply from rank 0", e))
            }
            Role::Root { peers } => {
                let expected_len = contribution.len();
                let mut contributions = Vec::with_capacity(peers.len() + 1);
                contributions.push(contribution);
                for (index, peer) in peers.iter_mut().enumerate() {
                    let request = read_frame(peer, expected_len)
                        .map_err(|e| comm_error(&format!("rank {}", index + 1), e))?;
                    contributions.push(request);
                }
                let reduced = Contribution::reduce(contributions)?;
                for (index, peer) in peers.iter_mut().enumerate() {
                    write_frame(peer, &reduced)
                        .map_err(|e| comm_error(&format!("rank {}", index + 1), e))?;
                }
                Ok(reduced)
            }
        }
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_min(&mut self, value: i64) -> Result<i64, PretrainError> {
        self.collective(Contribution::Min(value))?.into_min()
    }

    fn all_reduce_sum(&mut self, values: &mut [f32]) -> Result<(), PretrainError> {
        let reduced = self
            .collective(Contribution::Sum(values.to_vec()))?
            .into_sum(values.len())?;
        values.copy_from_slice(&reduced);
        Ok(())
    }

    fn barrier(&mut self) -> Result<(), PretrainError> {
        match self.collective(Contribution::Barrier)? {
            Contribution::Barrier => Ok(()),
            other => Err(PretrainError::CollectiveCommunicationError(format!(
                "expected a barrier reply, got {}",
                other.name()
            ))),
        }
    }
}

fn resolve(master_addr: &str) -> Result<SocketAddr, PretrainError> {
    master_addr
        .to_socket_addrs()
        .map_err(|e| {
            PretrainError::InvalidConfigurationError(format!(
                "invalid rendezvous address {master_addr}: {e}"
            ))
        })?
        .next()
        .ok_or_else(|| {
            PretrainError::InvalidConfigurationError(format!(
                "rendezvous address {master_addr} did not resolve"
            ))
        })
}

fn configure(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))
}

fn accept_peers(
    address: SocketAddr,
    world_size: usize,
    timeout: Duration,
) -> Result<Vec<TcpStream>, PretrainError> {
    let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    if peers.is_empty() {
        return Ok(Vec::new());
    }
    let listener = TcpListener::bind(address)
        .map_err(|e| comm_error(&format!("could not listen on {address}"), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| comm_error("could not configure listener", e))?;

    let deadline = Instant::now() + timeout;
    let mut missing = peers.len();
    while missing > 0 {
        match listener.accept() {
            Ok((mut stream, _)) => {
                configure(&stream, timeout).map_err(|e| comm_error("handshake", e))?;
                let (peer_rank, peer_world_size) =
                    read_handshake(&mut stream).map_err(|e| comm_error("handshake", e))?;
                if peer_world_size != world_size || peer_rank == 0 || peer_rank >= world_size {
                    return Err(PretrainError::CollectiveCommunicationError(format!(
                        "peer announced rank {peer_rank} of {peer_world_size}, expected a rank in 1..{world_size}"
                    )));
                }
                let slot = &mut peers[peer_rank - 1];
                if slot.is_some() {
                    return Err(PretrainError::CollectiveCommunicationError(format!(
                        "rank {peer_rank} joined twice"
                    )));
                }
                *slot = Some(stream);
                missing -= 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(PretrainError::CollectiveCommunicationError(format!(
                        "{missing} rank(s) did not join within {timeout:?}"
                    )));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => return Err(comm_error("accept", e)),
        }
    }
    Ok(peers.into_iter().flatten().collect())
}

fn connect_root(
    address: SocketAddr,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<TcpStream, PretrainError> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect_timeout(&address, CONNECT_ATTEMPT_TIMEOUT) {
            Ok(mut stream) => {
                configure(&stream, timeout).map_err(|e| comm_error("handshake", e))?;
                write_handshake(&mut stream, rank, world_size)
                    .map_err(|e| comm_error("handshake", e))?;
                return Ok(stream);
            }
            Err(e) if Instant::now() >= deadline => {
                return Err(comm_error(&format!("could not reach rank 0 at {address}"), e));
            }
            Err(_) => thread::sleep(RETRY_INTERVAL),
        }
    }
}

fn write_handshake(stream: &mut TcpStream, rank: usize, world_size: usize) -> io::Result<()> {
    let mut buffer = Vec::with_capacity(12);
    buffer.extend_from_slice(HANDSHAKE_MAGIC);
    buffer.extend_from_slice(&(rank as u32).to_le_bytes());
    buffer.extend_from_slice(&(world_size as u32).to_le_bytes());
    stream.write_all(&buffer)?;
    stream.flush()
}

fn read_handshake(stream: &mut TcpStream) -> io::Result<(usize, usize)> {
    let mut buffer = [0u8; 12];
    stream.read_exact(&mut buffer)?;
    if &buffer[..4] != HANDSHAKE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected handshake",
        ));
    }
    let rank = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    let world_size = u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize;
    Ok((rank, world_size))
}

fn write_frame<W: Write>(writer: &mut W, contribution: &Contribution) -> io::Result<()> {
    let mut buffer = Vec::new();
    match contribution {
        Contribution::Min(value) => {
            buffer.push(TAG_MIN);
            buffer.extend_from_slice(&1u64.to_le_bytes());
            buffer.extend_from_slice(&value.to_le_bytes());
        }
        Contribution::Sum(values) => {
            buffer.reserve(9 + 4 * values.len());
            buffer.push(TAG_SUM);
            buffer.extend_from_slice(&(values.len() as u64).to_le_bytes());
            for value in values {
                buffer.extend_from_slice(&value.to_le_bytes());
            }
        }
        Contribution::Barrier => {
            buffer.push(TAG_BARRIER);
            buffer.extend_from_slice(&0u64.to_le_bytes());
        }
    }
    writer.write_all(&buffer)?;
    writer.flush()
}

/// Reads one frame. A sum frame must carry `expected_len` values: the count is checked before
/// the payload is allocated.
fn read_frame<R: Read>(reader: &mut R, expected_len: usize) -> io::Result<Contribution> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header)?;
    let mut count = [0u8; 8];
    count.copy_from_slice(&header[1..]);
    let count = u64::from_le_bytes(count);

    let invalid = |message: String| io::Error::new(io::ErrorKind::InvalidData, message);
    match (header[0], count) {
        (TAG_MIN, 1) => {
            let mut value = [0u8; 8];
            reader.read_exact(&mut value)?;
            Ok(Contribution::Min(i64::from_le_bytes(value)))
        }
        (TAG_SUM, count) => {
            if usize::try_from(count).ok() != Some(expected_len) {
                return Err(invalid(format!(
                    "sum frame of {count} values, expected {expected_len}"
                )));
            }
            let size = expected_len
                .checked_mul(4)
                .ok_or_else(|| invalid(format!("sum frame of {count} values is too large")))?;
            let mut payload = vec![0u8; size];
            reader.read_exact(&mut payload)?;
            let values = payload
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            Ok(Contribution::Sum(values))
        }
        (TAG_BARRIER, 0) => Ok(Contribution::Barrier),
        (tag, count) => Err(invalid(format!(
            "malformed frame (tag {tag}, {count} items)"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_keep_payload() {
        for contribution in [
            Contribution::Min(-42),
            Contribution::Sum(vec![0.5, -1.25, 3.0]),
            Contribution::Barrier,
        ] {
            let mut buffer = Vec::new();
            write_frame(&mut buffer, &contribution).unwrap();
            let decoded = read_frame(&mut Cursor::new(buffer), contribution.len()).unwrap();
            assert_eq!(decoded, contribution);
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Contribution::Sum(vec![1.0, 2.0])).unwrap();
        buffer.truncate(buffer.len() - 1);
        let error = read_frame(&mut Cursor::new(buffer), 2).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_count_is_rejected_before_reading_payload() {
        for count in [u64::MAX, u64::MAX / 2, 1 << 40] {
            let mut buffer = vec![TAG_SUM];
            buffer.extend_from_slice(&count.to_le_bytes());
            let error = read_frame(&mut Cursor::new(buffer), 3).unwrap_err();
            assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        }
    }

    #[test]
    fn sum_of_unexpected_length_is_rejected() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Contribution::Sum(vec![1.0, 2.0, 3.0])).unwrap();
        let error = read_frame(&mut Cursor::new(buffer.clone()), 2).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        assert!(read_frame(&mut Cursor::new(buffer), 3).is_ok());
    }
}
