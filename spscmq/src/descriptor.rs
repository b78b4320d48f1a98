//! Out-of-band queue metadata.
//!
//! A [`Descriptor`] names the shared-memory regions that make up one queue:
//! an ordered file-descriptor table plus a grantor table mapping each logical
//! region (reader counter, writer counter, data ring) to a byte range within
//! one of those file descriptors. Endpoints consume descriptors; they never
//! allocate backing memory themselves. [`Descriptor::create`] is the factory
//! collaborator that mints a descriptor over a fresh `memfd` so the first
//! process of a pair has something to hand to its peer.

use std::mem;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crossbeam::utils::CachePadded;
use eyre::{Result, WrapErr};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;

use crate::error::QueueError;
use crate::mapping::page_size;

/// One entry in a descriptor's region table.
///
/// Offsets are arbitrary byte positions within the referenced shared-memory
/// object; the region mapper takes care of page alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grantor {
    pub fd_index: u32,
    pub offset: usize,
    pub extent: usize,
}

/// Ordered file-descriptor table backing a descriptor.
#[derive(Debug)]
pub struct NativeHandle {
    fds: Vec<OwnedFd>,
}

impl NativeHandle {
    pub fn new(fds: Vec<OwnedFd>) -> Self {
        NativeHandle { fds }
    }

    pub fn is_valid(&self) -> bool {
        !self.fds.is_empty()
    }

    pub fn fd(&self, index: u32) -> Option<BorrowedFd<'_>> {
        self.fds.get(index as usize).map(|fd| fd.as_fd())
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub fn try_clone(&self) -> Result<Self> {
        let mut fds = Vec::with_capacity(self.fds.len());
        for fd in &self.fds {
            fds.push(
                fd.try_clone()
                    .wrap_err("failed to duplicate descriptor fd")?,
            );
        }
        Ok(NativeHandle { fds })
    }
}

/// Immutable metadata naming the shared-memory regions of one queue.
#[derive(Debug)]
pub struct Descriptor {
    size: usize,
    quantum: usize,
    grantors: Vec<Grantor>,
    handle: NativeHandle,
}

impl Descriptor {
    /// Grantor table position of the reader position counter.
    pub const READ_POINTER: usize = 0;
    /// Grantor table position of the writer position counter.
    pub const WRITE_POINTER: usize = 1;
    /// Grantor table position of the data ring.
    pub const DATA_RING: usize = 2;
    /// Fewest grantors a usable descriptor carries. Richer descriptors may
    /// append further regions; endpoints ignore them.
    pub const MIN_GRANTOR_COUNT: usize = 3;

    /// Assemble a descriptor from parts received out of band.
    ///
    /// No validation happens here; an endpoint validates when it binds.
    pub fn new(
        size: usize,
        quantum: usize,
        grantors: Vec<Grantor>,
        handle: NativeHandle,
    ) -> Self {
        Descriptor {
            size,
            quantum,
            grantors,
            handle,
        }
    }

    /// Allocate backing memory for a fresh queue and describe it.
    ///
    /// One `memfd` holds everything: the reader counter at offset zero, the
    /// writer counter one cache line in so the two sides never contend on a
    /// line, and the ring on the next page boundary.
    pub fn create(record_count: usize, quantum: usize) -> Result<Self> {
        let capacity = record_count
            .checked_mul(quantum)
            .filter(|c| *c > 0)
            .ok_or(QueueError::BadGeometry {
                record_count,
                quantum,
            })?;

        let data_offset = page_size();
        let counter_stride = mem::size_of::<CachePadded<u64>>();

        let fd = memfd_create(c"spscmq", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(QueueError::MemfdFailed)
            .wrap_err("failed to create queue backing memory")?;
        ftruncate(&fd, (data_offset + capacity) as i64)
            .wrap_err("failed to size queue backing memory")?;

        let counter_extent = mem::size_of::<u64>();
        let grantors = vec![
            Grantor {
                fd_index: 0,
                offset: 0,
                extent: counter_extent,
            },
            Grantor {
                fd_index: 0,
                offset: counter_stride,
                extent: counter_extent,
            },
            Grantor {
                fd_index: 0,
                offset: data_offset,
                extent: capacity,
            },
        ];

        Ok(Descriptor {
            size: capacity,
            quantum,
            grantors,
            handle: NativeHandle::new(vec![fd]),
        })
    }

    /// Total ring capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes per record.
    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn grantor_count(&self) -> usize {
        self.grantors.len()
    }

    pub fn grantors(&self) -> &[Grantor] {
        &self.grantors
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    pub fn is_handle_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Duplicate the descriptor, including its fd table, so a second
    /// endpoint can bind to the same queue.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Descriptor {
            size: self.size,
            quantum: self.quantum,
            grantors: self.grantors.clone(),
            handle: self.handle.try_clone()?,
        })
    }
}
