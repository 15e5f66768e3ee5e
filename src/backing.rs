/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::ffi::CStr;
use crate::debug::*;
use crate::dprintf;
use crate::errors::ErrNO;
use crate::stdio::{errno, strerror};
use crate::types::vaddr_t;

/* Live mapping count, reported on mmap failures: the per-process map count
 * limit usually trips long before address space runs out. */
static ACTIVE_MAPPINGS: AtomicUsize = AtomicUsize::new(0);

pub fn active_mappings() -> usize {
    ACTIVE_MAPPINGS.load(Ordering::Relaxed)
}

/* An anonymous PROT_NONE range holding address space for later fixed
 * mappings. Consumes no physical memory until something is attached. */
pub struct Reservation {
    base: vaddr_t,
    size: usize,
}

impl Reservation {
    pub fn base(&self) -> vaddr_t {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
        ACTIVE_MAPPINGS.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn reserve(size: usize) -> Result<Reservation, ErrNO> {
    let ptr = unsafe {
        libc::mmap(ptr::null_mut(), size, libc::PROT_NONE,
                   libc::MAP_ANONYMOUS | libc::MAP_PRIVATE, -1, 0)
    };
    if ptr == libc::MAP_FAILED {
        dprintf!(CRITICAL, "bigmaac: failed to reserve address space: {}\n",
                 strerror(errno()));
        return Err(ErrNO::NoResources);
    }
    ACTIVE_MAPPINGS.fetch_add(1, Ordering::Relaxed);
    Ok(Reservation { base: ptr as vaddr_t, size })
}

/* Replace [addr, addr+size) of the reservation with a shared mapping of a
 * fresh unlinked temporary file. Once mapped, the file lives exactly as
 * long as the mapping and is invisible on disk. */
pub fn attach(addr: vaddr_t, size: usize, template: &CStr) -> Result<(), ErrNO> {
    let mut path = template.to_bytes_with_nul().to_vec();
    dprintf!(INFO, "bigmaac: backing file of {:.2} MB\n",
             size as f64 / (1024.0 * 1024.0));

    let fd = unsafe { libc::mkstemp(path.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        dprintf!(CRITICAL, "bigmaac: failed to make temp file: {}\n",
                 strerror(errno()));
        return Err(ErrNO::NoResources);
    }
    if unsafe { libc::unlink(path.as_ptr() as *const libc::c_char) } != 0 {
        dprintf!(CRITICAL, "bigmaac: unlink of backing file failed: {}\n",
                 strerror(errno()));
        unsafe { libc::close(fd); }
        return Err(ErrNO::NoResources);
    }
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        dprintf!(CRITICAL, "bigmaac: ftruncate to {} failed: {}\n",
                 size, strerror(errno()));
        unsafe { libc::close(fd); }
        return Err(ErrNO::NoResources);
    }

    let mapped = unsafe {
        libc::mmap(addr as *mut libc::c_void, size,
                   libc::PROT_READ | libc::PROT_WRITE,
                   libc::MAP_SHARED | libc::MAP_FIXED, fd, 0)
    };
    if mapped == libc::MAP_FAILED {
        dprintf!(CRITICAL,
                 "bigmaac: mmap of backing file failed, active mappings {}, \
                  check /proc/sys/vm/max_map_count: {}\n",
                 active_mappings(), strerror(errno()));
        unsafe { libc::close(fd); }
        return Err(ErrNO::NoResources);
    }
    ACTIVE_MAPPINGS.fetch_add(1, Ordering::Relaxed);

    /* the mapping keeps the file open from here on */
    if unsafe { libc::close(fd) } != 0 {
        dprintf!(CRITICAL, "bigmaac: close of backing fd failed: {}\n",
                 strerror(errno()));
    }
    Ok(())
}

/* Revert [addr, addr+size) to an inaccessible anonymous reservation; the
 * kernel reclaims the file once its last mapping is gone. */
pub fn detach(addr: vaddr_t, size: usize) -> Result<(), ErrNO> {
    let mapped = unsafe {
        libc::mmap(addr as *mut libc::c_void, size, libc::PROT_NONE,
                   libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                   -1, 0)
    };
    if mapped == libc::MAP_FAILED {
        dprintf!(CRITICAL, "bigmaac: remap to reservation failed: {}\n",
                 strerror(errno()));
        return Err(ErrNO::NoResources);
    }
    ACTIVE_MAPPINGS.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}
