//! The region mapper: grantor in, process-local address out.

use core::ptr::NonNull;
use std::num::NonZero;

use eyre::{ensure, Result, WrapErr};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::descriptor::{Grantor, NativeHandle};
use crate::error::QueueError;

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// One grantor's bytes mapped into this process.
///
/// `mmap` requires a page-aligned file offset while grantors address
/// arbitrary intra-object ranges, so the mapping starts at the preceding
/// page boundary and the exposed pointer sits `delta` bytes into it. The
/// pre-pad bytes are mapped but never touched.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    map_len: usize,
    delta: usize,
}

impl MappedRegion {
    pub fn map(handle: &NativeHandle, grantor: &Grantor) -> Result<Self> {
        ensure!(grantor.extent > 0, QueueError::EmptyRegion);
        let fd = handle
            .fd(grantor.fd_index)
            .ok_or(QueueError::BadFdIndex(grantor.fd_index))?;

        let aligned = (grantor.offset / page_size()) * page_size();
        let delta = grantor.offset - aligned;
        let map_len = delta + grantor.extent;

        let base = unsafe {
            mmap(
                None,
                NonZero::new(map_len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                aligned as i64,
            )
            .map_err(QueueError::MmapFailed)
            .wrap_err("failed to map shared-memory region")?
        };

        let ptr = NonNull::new(unsafe { base.as_ptr().cast::<u8>().add(delta) })
            .expect("mmap returned null pointer");

        Ok(MappedRegion {
            ptr,
            map_len,
            delta,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            let base = self.ptr.as_ptr().sub(self.delta);
            let _ = munmap(NonNull::new_unchecked(base.cast()), self.map_len);
        }
    }
}

unsafe impl Send for MappedRegion {}
