//! Message passing layer the engine is written against.
//!
//! The trait mirrors the slice of MPI the engine actually uses: point-to-point
//! messages with tags, a handful of intra-communicator collectives and the
//! inter-communicator constructors needed for group bridging. Two backends
//! implement it, an in-process one where every rank is a thread
//! ([`thread`]) and, with the `mpi` feature, a thin wrapper over a real MPI
//! library ([`mpi`]).

#[cfg(feature = "mpi")]
pub mod mpi;
pub mod noncollective;
pub mod thread;

#[cfg(test)]
mod thread_test;

use std::{fmt::Display, os::raw::c_void};
use thiserror::Error;
use tracing::error;

/// rank of a process inside a communicator
pub type Rank = i32;
/// message tag
pub type Tag = i32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("Operation requires an intra-communicator")]
    NotIntra,
    #[error("Operation requires an inter-communicator")]
    NotInter,
    #[error("Rank {rank} is out of range for a group of {size}")]
    RankOutOfRange { rank: Rank, size: Rank },
    #[error("Calling rank {0} is not a member of the requested group")]
    NotAMember(Rank),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Backend call {call} failed with code {code}")]
    Backend { call: &'static str, code: i32 },
}

/// envelope information of a matched message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: Rank,
    pub tag: Tag,
    pub count: usize,
}

pub trait Communicator: Sized {
    fn rank(&self) -> Rank;

    /// size of the local group
    fn size(&self) -> Rank;

    fn is_inter(&self) -> bool;

    /// size of the remote group, zero for intra-communicators
    fn remote_size(&self) -> Rank;

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]) -> Result<(), CommError>;

    /// block until a message matching `source`/`tag` is available, `None` matches anything
    fn probe(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<Status, CommError>;

    fn iprobe(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<Option<Status>, CommError>;

    fn recv(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<(Vec<u8>, Status), CommError>;

    fn barrier(&self) -> Result<(), CommError>;

    /// replace `data` on every rank with the contents of `data` on `root`
    fn broadcast(&self, root: Rank, data: &mut Vec<u8>) -> Result<(), CommError>;

    fn dup(&self) -> Result<Self, CommError>;

    /// ranks passing `None` take part but receive no communicator
    fn split(&self, color: Option<i32>, key: i32) -> Result<Option<Self>, CommError>;

    /// fresh communicator containing only the calling rank
    fn solo(&self) -> Result<Self, CommError>;

    /// collective over this group and the group led by `remote_leader` (a rank of `peer`)
    fn intercomm_create(
        &self,
        local_leader: Rank,
        peer: &Self,
        remote_leader: Rank,
        tag: Tag,
    ) -> Result<Self, CommError>;

    /// turn an inter-communicator into an intra-communicator, `high == false` side first
    fn merge(&self, high: bool) -> Result<Self, CommError>;

    /// map ranks of this communicator's local group onto `other`'s group
    fn translate_ranks(&self, ranks: &[Rank], other: &Self)
        -> Result<Vec<Option<Rank>>, CommError>;

    /// wall clock in seconds
    fn wtime(&self) -> f64;

    /// bring down every rank taking part in the job
    fn abort(&self, code: i32) -> !;

    /// Address of the backend's native handle, what hosted code receives:
    /// the `MPI_Comm` for the MPI backend, the communicator itself otherwise.
    /// Valid for as long as `self` is.
    fn handle(&self) -> *mut c_void;

    fn send_str(&self, dest: Rank, tag: Tag, value: &str) -> Result<(), CommError> {
        self.send(dest, tag, value.as_bytes())
    }

    fn recv_string(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<(String, Status), CommError> {
        let (bytes, status) = self.recv(source, tag)?;
        let value = String::from_utf8(bytes).map_err(|e| CommError::Malformed(e.to_string()))?;

        Ok((value, status))
    }

    fn send_i32s(&self, dest: Rank, tag: Tag, values: &[i32]) -> Result<(), CommError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.send(dest, tag, &bytes)
    }

    fn recv_i32s(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<(Vec<i32>, Status), CommError> {
        let (bytes, status) = self.recv(source, tag)?;

        Ok((decode_i32s(&bytes)?, status))
    }

    fn send_f64s(&self, dest: Rank, tag: Tag, values: &[f64]) -> Result<(), CommError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.send(dest, tag, &bytes)
    }

    fn recv_f64s(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<(Vec<f64>, Status), CommError> {
        let (bytes, status) = self.recv(source, tag)?;
        if bytes.len() % 8 != 0 {
            return Err(CommError::Malformed(format!("{} bytes is not a list of f64", bytes.len())));
        }

        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();

        Ok((values, status))
    }
}

pub(crate) fn decode_i32s(bytes: &[u8]) -> Result<Vec<i32>, CommError> {
    if bytes.len() % 4 != 0 {
        return Err(CommError::Malformed(format!("{} bytes is not a list of i32", bytes.len())));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Fatal error policy: anything that leaves ranks with inconsistent state
/// takes the whole job down.
pub trait OrAbort<T> {
    fn or_abort<C: Communicator>(self, comm: &C) -> T;
}

impl<T, E: Display> OrAbort<T> for Result<T, E> {
    fn or_abort<C: Communicator>(self, comm: &C) -> T {
        match self {
            Ok(value) => value,
            Err(error) => {
                error!(rank = comm.rank(), "Fatal error, aborting: {error}");
                comm.abort(1)
            }
        }
    }
}
