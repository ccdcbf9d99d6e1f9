//! Backend over a real MPI library through rsmpi's raw bindings.
//!
//! Only the raw layer is used: the engine needs `MPI_Intercomm_create` and
//! `MPI_Intercomm_merge` on arbitrary communicators, and has to hand the raw
//! handle to hosted code.

use super::{CommError, Communicator, Rank, Status, Tag};
use mpi::ffi::{self, MPI_Comm, MPI_Group, MPI_Status};
use std::{
    mem::MaybeUninit,
    os::raw::{c_int, c_void},
    ptr,
};
use tracing::{error, info};

const SUCCESS: c_int = 0;

fn check(call: &'static str, code: c_int) -> Result<(), CommError> {
    if code == SUCCESS {
        Ok(())
    } else {
        Err(CommError::Backend { call, code })
    }
}

fn source_or_any(source: Option<Rank>) -> c_int {
    source.unwrap_or(unsafe { ffi::RSMPI_ANY_SOURCE })
}

fn tag_or_any(tag: Option<Tag>) -> c_int {
    tag.unwrap_or(unsafe { ffi::RSMPI_ANY_TAG })
}

/// Owned (or borrowed, for the predefined world) MPI communicator.
pub struct MpiComm {
    raw: MPI_Comm,
    owned: bool,
}

/// Keeps MPI initialised for as long as it lives.
pub struct Universe {
    _private: (),
}

impl Universe {
    pub fn initialize() -> Result<Self, CommError> {
        let mut initialized: c_int = 0;
        check("MPI_Initialized", unsafe { ffi::MPI_Initialized(&mut initialized) })?;
        if initialized == 0 {
            check("MPI_Init", unsafe { ffi::MPI_Init(ptr::null_mut(), ptr::null_mut()) })?;
            info!("MPI initialised");
        }

        Ok(Self { _private: () })
    }

    pub fn world(&self) -> MpiComm {
        MpiComm {
            raw: unsafe { ffi::RSMPI_COMM_WORLD },
            owned: false,
        }
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        let code = unsafe { ffi::MPI_Finalize() };
        if code != SUCCESS {
            error!(code, "MPI_Finalize failed");
        }
    }
}

impl MpiComm {
    pub fn raw(&self) -> MPI_Comm {
        self.raw
    }

    fn owned(raw: MPI_Comm) -> Self {
        Self { raw, owned: true }
    }

    fn group(&self) -> Result<MPI_Group, CommError> {
        let mut group = MaybeUninit::<MPI_Group>::uninit();
        check("MPI_Comm_group", unsafe { ffi::MPI_Comm_group(self.raw, group.as_mut_ptr()) })?;

        Ok(unsafe { group.assume_init() })
    }

    fn status_of(status: &MPI_Status) -> Result<Status, CommError> {
        let mut count: c_int = 0;
        check("MPI_Get_count", unsafe {
            ffi::MPI_Get_count(status, ffi::RSMPI_UINT8_T, &mut count)
        })?;

        Ok(Status {
            source: status.MPI_SOURCE,
            tag: status.MPI_TAG,
            count: count.max(0) as usize,
        })
    }
}

impl Drop for MpiComm {
    fn drop(&mut self) {
        if self.owned && self.raw != unsafe { ffi::RSMPI_COMM_NULL } {
            let code = unsafe { ffi::MPI_Comm_free(&mut self.raw) };
            if code != SUCCESS {
                error!(code, "MPI_Comm_free failed");
            }
        }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> Rank {
        let mut rank: c_int = -1;
        unsafe { ffi::MPI_Comm_rank(self.raw, &mut rank) };
        rank
    }

    fn size(&self) -> Rank {
        let mut size: c_int = 0;
        unsafe { ffi::MPI_Comm_size(self.raw, &mut size) };
        size
    }

    fn is_inter(&self) -> bool {
        let mut flag: c_int = 0;
        unsafe { ffi::MPI_Comm_test_inter(self.raw, &mut flag) };
        flag != 0
    }

    fn remote_size(&self) -> Rank {
        if !self.is_inter() {
            return 0;
        }
        let mut size: c_int = 0;
        unsafe { ffi::MPI_Comm_remote_size(self.raw, &mut size) };
        size
    }

    fn send(&self, dest: Rank, tag: Tag, data: &[u8]) -> Result<(), CommError> {
        check("MPI_Send", unsafe {
            ffi::MPI_Send(
                data.as_ptr() as *const c_void,
                data.len() as c_int,
                ffi::RSMPI_UINT8_T,
                dest,
                tag,
                self.raw,
            )
        })
    }

    fn probe(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<Status, CommError> {
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        check("MPI_Probe", unsafe {
            ffi::MPI_Probe(source_or_any(source), tag_or_any(tag), self.raw, status.as_mut_ptr())
        })?;

        Self::status_of(unsafe { status.assume_init_ref() })
    }

    fn iprobe(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<Option<Status>, CommError> {
        let mut flag: c_int = 0;
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        check("MPI_Iprobe", unsafe {
            ffi::MPI_Iprobe(
                source_or_any(source),
                tag_or_any(tag),
                self.raw,
                &mut flag,
                status.as_mut_ptr(),
            )
        })?;

        if flag == 0 {
            return Ok(None);
        }
        Self::status_of(unsafe { status.assume_init_ref() }).map(Some)
    }

    fn recv(&self, source: Option<Rank>, tag: Option<Tag>) -> Result<(Vec<u8>, Status), CommError> {
        // probe first so the buffer fits, then receive exactly the probed message
        let probed = self.probe(source, tag)?;
        let mut buffer = vec![0u8; probed.count];
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        check("MPI_Recv", unsafe {
            ffi::MPI_Recv(
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as c_int,
                ffi::RSMPI_UINT8_T,
                probed.source,
                probed.tag,
                self.raw,
                status.as_mut_ptr(),
            )
        })?;

        Ok((buffer, probed))
    }

    fn barrier(&self) -> Result<(), CommError> {
        check("MPI_Barrier", unsafe { ffi::MPI_Barrier(self.raw) })
    }

    fn broadcast(&self, root: Rank, data: &mut Vec<u8>) -> Result<(), CommError> {
        let mut length = data.len() as u64;
        check("MPI_Bcast", unsafe {
            ffi::MPI_Bcast(
                &mut length as *mut u64 as *mut c_void,
                8,
                ffi::RSMPI_UINT8_T,
                root,
                self.raw,
            )
        })?;

        data.resize(length as usize, 0);
        check("MPI_Bcast", unsafe {
            ffi::MPI_Bcast(
                data.as_mut_ptr() as *mut c_void,
                data.len() as c_int,
                ffi::RSMPI_UINT8_T,
                root,
                self.raw,
            )
        })
    }

    fn dup(&self) -> Result<Self, CommError> {
        let mut raw = MaybeUninit::<MPI_Comm>::uninit();
        check("MPI_Comm_dup", unsafe { ffi::MPI_Comm_dup(self.raw, raw.as_mut_ptr()) })?;

        Ok(Self::owned(unsafe { raw.assume_init() }))
    }

    fn split(&self, color: Option<i32>, key: i32) -> Result<Option<Self>, CommError> {
        let color = color.unwrap_or(unsafe { ffi::RSMPI_UNDEFINED });
        let mut raw = MaybeUninit::<MPI_Comm>::uninit();
        check("MPI_Comm_split", unsafe {
            ffi::MPI_Comm_split(self.raw, color, key, raw.as_mut_ptr())
        })?;

        let raw = unsafe { raw.assume_init() };
        if raw == unsafe { ffi::RSMPI_COMM_NULL } {
            Ok(None)
        } else {
            Ok(Some(Self::owned(raw)))
        }
    }

    fn solo(&self) -> Result<Self, CommError> {
        let mut raw = MaybeUninit::<MPI_Comm>::uninit();
        check("MPI_Comm_dup", unsafe {
            ffi::MPI_Comm_dup(ffi::RSMPI_COMM_SELF, raw.as_mut_ptr())
        })?;

        Ok(Self::owned(unsafe { raw.assume_init() }))
    }

    fn intercomm_create(
        &self,
        local_leader: Rank,
        peer: &Self,
        remote_leader: Rank,
        tag: Tag,
    ) -> Result<Self, CommError> {
        let mut raw = MaybeUninit::<MPI_Comm>::uninit();
        check("MPI_Intercomm_create", unsafe {
            ffi::MPI_Intercomm_create(
                self.raw,
                local_leader,
                peer.raw,
                remote_leader,
                tag,
                raw.as_mut_ptr(),
            )
        })?;

        Ok(Self::owned(unsafe { raw.assume_init() }))
    }

    fn merge(&self, high: bool) -> Result<Self, CommError> {
        if !self.is_inter() {
            return Err(CommError::NotInter);
        }
        let mut raw = MaybeUninit::<MPI_Comm>::uninit();
        check("MPI_Intercomm_merge", unsafe {
            ffi::MPI_Intercomm_merge(self.raw, high as c_int, raw.as_mut_ptr())
        })?;

        Ok(Self::owned(unsafe { raw.assume_init() }))
    }

    fn translate_ranks(&self, ranks: &[Rank], other: &Self) -> Result<Vec<Option<Rank>>, CommError> {
        let mut ours = self.group()?;
        let mut theirs = other.group()?;
        let mut translated = vec![0 as c_int; ranks.len()];

        let result = check("MPI_Group_translate_ranks", unsafe {
            ffi::MPI_Group_translate_ranks(
                ours,
                ranks.len() as c_int,
                ranks.as_ptr(),
                theirs,
                translated.as_mut_ptr(),
            )
        });
        unsafe {
            ffi::MPI_Group_free(&mut ours);
            ffi::MPI_Group_free(&mut theirs);
        }
        result?;

        let undefined = unsafe { ffi::RSMPI_UNDEFINED };
        Ok(translated
            .into_iter()
            .map(|rank| if rank == undefined { None } else { Some(rank) })
            .collect())
    }

    fn wtime(&self) -> f64 {
        unsafe { ffi::RSMPI_Wtime() }
    }

    fn abort(&self, code: i32) -> ! {
        error!(code, "Calling MPI_Abort");
        unsafe { ffi::MPI_Abort(self.raw, code) };
        std::process::abort()
    }

    fn handle(&self) -> *mut c_void {
        &self.raw as *const MPI_Comm as *mut c_void
    }
}
