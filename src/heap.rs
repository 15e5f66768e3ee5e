/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::cmp::min;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicI8, AtomicUsize, Ordering};
use libc::c_void;
use spin::Mutex;
use crate::SIZE_TO_MULTIPLE;
use crate::arena::Arena;
use crate::backing::{self, Reservation};
use crate::config::Config;
use crate::debug::*;
use crate::dprintf;
use crate::errors::ErrNO;
use crate::real;
use crate::stdio::set_errno;
use crate::types::vaddr_t;

/* Bootstrap state machine. The dynamic loader may allocate while the real
 * symbols resolve, so the shims must be callable in every state. */
#[derive(Clone, Copy, Debug)]
#[derive(PartialEq)]
pub enum LoadStatus {
    LibraryFail = -1,
    NotLoaded = 0,
    LoadingMemFuncs = 1,
    LoadingLibrary = 2,
    Loaded = 3,
}

static LOAD_STATE: AtomicI8 = AtomicI8::new(LoadStatus::NotLoaded as i8);

pub fn load_state() -> LoadStatus {
    match LOAD_STATE.load(Ordering::Acquire) {
        -1 => LoadStatus::LibraryFail,
        0 => LoadStatus::NotLoaded,
        1 => LoadStatus::LoadingMemFuncs,
        2 => LoadStatus::LoadingLibrary,
        _ => LoadStatus::Loaded,
    }
}

fn set_load_state(state: LoadStatus) {
    LOAD_STATE.store(state as i8, Ordering::Release);
}

/* Thresholds and range bounds, mirrored into atomics when the library goes
 * LOADED so the shims can classify without taking the heap lock. All zero
 * until then, which classifies every pointer as unmanaged. */
static MIN_SIZE_FRY: AtomicUsize = AtomicUsize::new(0);
static MIN_SIZE_BIGMAAC: AtomicUsize = AtomicUsize::new(0);
static BASE_FRIES: AtomicUsize = AtomicUsize::new(0);
static BASE_BIGMAAC: AtomicUsize = AtomicUsize::new(0);
static END_BIGMAAC: AtomicUsize = AtomicUsize::new(0);

pub fn min_size_fry() -> usize {
    MIN_SIZE_FRY.load(Ordering::Acquire)
}

pub fn min_size_bigmaac() -> usize {
    MIN_SIZE_BIGMAAC.load(Ordering::Acquire)
}

pub fn managed_range_contains(ptr: vaddr_t) -> bool {
    ptr >= BASE_FRIES.load(Ordering::Acquire)
        && ptr < END_BIGMAAC.load(Ordering::Acquire)
}

pub fn fry_range_contains(ptr: vaddr_t) -> bool {
    ptr >= BASE_FRIES.load(Ordering::Acquire)
        && ptr < BASE_BIGMAAC.load(Ordering::Acquire)
}

pub fn bigmaac_range_contains(ptr: vaddr_t) -> bool {
    ptr >= BASE_BIGMAAC.load(Ordering::Acquire)
        && ptr < END_BIGMAAC.load(Ordering::Acquire)
}

/* The two arenas over one contiguous reservation: fries in the front half,
 * backed by a single file mapped at init, bigmaacs behind them with one
 * backing file per allocation. */
pub struct BigMaac {
    cfg: Config,
    #[allow(dead_code)]
    reservation: Reservation,
    fries: Arena,
    bigmaacs: Arena,
}

impl BigMaac {
    pub fn new(cfg: Config) -> Result<BigMaac, ErrNO> {
        if cfg.min_size_fry > cfg.min_size_bigmaac {
            dprintf!(CRITICAL,
                     "bigmaac: fry threshold {} above bigmaac threshold {}\n",
                     cfg.min_size_fry, cfg.min_size_bigmaac);
            return Err(ErrNO::InvalidArgs);
        }

        let total = cfg.size_fries.checked_add(cfg.size_bigmaac)
            .ok_or(ErrNO::InvalidArgs)?;
        let reservation = backing::reserve(total)?;
        let base = reservation.base();

        /* fries share one mapping for the life of the process; dropping the
         * reservation on a later failure takes it down again */
        backing::attach(base, cfg.size_fries, &cfg.template)?;

        let fries = Arena::new(base, cfg.size_fries)?;
        let bigmaacs = Arena::new(base + cfg.size_fries, cfg.size_bigmaac)?;
        Ok(BigMaac { cfg, reservation, fries, bigmaacs })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn fries(&self) -> &Arena {
        &self.fries
    }

    pub fn bigmaacs(&self) -> &Arena {
        &self.bigmaacs
    }

    pub fn contains(&self, ptr: vaddr_t) -> bool {
        self.fries.contains(ptr) || self.bigmaacs.contains(ptr)
    }

    /* Carve a rounded chunk from whichever arena the size calls for; a
     * bigmaac sub-range gets file-backed before its address is handed out. */
    pub fn create_chunk(&mut self, size: usize) -> Result<vaddr_t, ErrNO> {
        if size > self.cfg.min_size_bigmaac {
            if size > self.bigmaacs.capacity() {
                return Err(ErrNO::NoMem);
            }
            let rounded = SIZE_TO_MULTIPLE!(size, self.cfg.page_size);
            let ptr = self.bigmaacs.alloc(rounded)?;
            if let Err(err) = backing::attach(ptr, rounded, &self.cfg.template) {
                dprintf!(CRITICAL,
                         "bigmaac: attach failed, active mappings {}, \
                          bigmaac capacity free {:.2}, fry capacity free {:.2}\n",
                         backing::active_mappings(),
                         1.0 - self.bigmaacs.used() as f64 / self.bigmaacs.capacity() as f64,
                         1.0 - self.fries.used() as f64 / self.fries.capacity() as f64);
                if self.bigmaacs.release(ptr).is_err() {
                    dprintf!(CRITICAL, "bigmaac: leaking chunk after failed attach\n");
                }
                return Err(err);
            }
            Ok(ptr)
        } else {
            if size > self.fries.capacity() {
                return Err(ErrNO::NoMem);
            }
            let rounded = SIZE_TO_MULTIPLE!(size, self.cfg.fry_size_multiple);
            self.fries.alloc(rounded)
        }
    }

    /* Classify by address and release. A bigmaac sub-range reverts to the
     * inaccessible reservation before its block is coalesced away. */
    pub fn release_chunk(&mut self, ptr: vaddr_t) -> Result<(), ErrNO> {
        if self.fries.contains(ptr) {
            self.fries.release(ptr)?;
            Ok(())
        } else if self.bigmaacs.contains(ptr) {
            let (start, size) = self.bigmaacs.find(ptr).ok_or(ErrNO::NotFound)?;
            backing::detach(start, size)?;
            self.bigmaacs.release(ptr)?;
            Ok(())
        } else {
            Err(ErrNO::NotFound)
        }
    }

    pub fn chunk_size(&self, ptr: vaddr_t) -> Option<usize> {
        if self.fries.contains(ptr) {
            self.fries.find(ptr).map(|(_, size)| size)
        } else if self.bigmaacs.contains(ptr) {
            self.bigmaacs.find(ptr).map(|(_, size)| size)
        } else {
            None
        }
    }
}

static BIGMAAC: Mutex<Option<BigMaac>> = Mutex::new(None);

/* Resolve the real allocator, read the environment, reserve the address
 * ranges and build both arenas. Runs at most once; any failure latches
 * LIBRARY_FAIL and the shims pass through forever after. */
pub fn bigmaac_init() {
    let mut heap = BIGMAAC.lock();
    match load_state() {
        LoadStatus::NotLoaded => {}
        LoadStatus::LibraryFail => return,
        state => {
            dprintf!(INFO, "bigmaac: already initialized ({})\n", state as i8);
            return;
        }
    }

    dprintf!(INFO, "bigmaac: loading, pid {} ppid {}\n",
             unsafe { libc::getpid() }, unsafe { libc::getppid() });

    set_load_state(LoadStatus::LoadingMemFuncs);
    if real::resolve().is_err() {
        set_load_state(LoadStatus::LibraryFail);
        return;
    }
    set_load_state(LoadStatus::LoadingLibrary);

    let cfg = Config::from_env();
    match BigMaac::new(cfg) {
        Ok(bigmaac) => {
            MIN_SIZE_FRY.store(bigmaac.cfg.min_size_fry, Ordering::Release);
            MIN_SIZE_BIGMAAC.store(bigmaac.cfg.min_size_bigmaac, Ordering::Release);
            BASE_FRIES.store(bigmaac.fries.base(), Ordering::Release);
            BASE_BIGMAAC.store(bigmaac.bigmaacs.base(), Ordering::Release);
            END_BIGMAAC.store(bigmaac.bigmaacs.end(), Ordering::Release);
            *heap = Some(bigmaac);
            set_load_state(LoadStatus::Loaded);
        }
        Err(err) => {
            dprintf!(CRITICAL, "bigmaac: failed to initialize library: {:?}\n", err);
            set_load_state(LoadStatus::LibraryFail);
        }
    }
}

pub fn create_chunk(size: usize) -> Option<vaddr_t> {
    let mut heap = BIGMAAC.lock();
    heap.as_mut()?.create_chunk(size).ok()
}

pub fn remove_chunk(ptr: vaddr_t) -> Result<(), ErrNO> {
    let mut heap = BIGMAAC.lock();
    heap.as_mut().ok_or(ErrNO::NotFound)?.release_chunk(ptr)
}

pub fn chunk_size(ptr: vaddr_t) -> Option<usize> {
    let heap = BIGMAAC.lock();
    heap.as_ref()?.chunk_size(ptr)
}

fn oom() -> *mut c_void {
    dprintf!(CRITICAL, "bigmaac: failed to find available space\n");
    set_errno(libc::ENOMEM);
    null_mut()
}

unsafe fn fallback_malloc(size: usize) -> *mut c_void {
    if real::ready() {
        real::malloc(size)
    } else {
        set_errno(libc::ENOMEM);
        null_mut()
    }
}

unsafe fn fallback_calloc(count: usize, size: usize) -> *mut c_void {
    if real::ready() {
        real::calloc(count, size)
    } else {
        set_errno(libc::ENOMEM);
        null_mut()
    }
}

/* Entry points with the C allocator contracts. The extern shims are thin
 * wrappers around these. */

pub unsafe fn bigmaac_malloc(size: usize) -> *mut c_void {
    if load_state() == LoadStatus::NotLoaded {
        bigmaac_init();
    }
    if load_state() != LoadStatus::Loaded || size == 0 {
        return fallback_malloc(size);
    }

    if size > min_size_fry() {
        match create_chunk(size) {
            Some(ptr) => ptr as *mut c_void,
            None => oom(),
        }
    } else {
        fallback_malloc(size)
    }
}

pub unsafe fn bigmaac_calloc(count: usize, size: usize) -> *mut c_void {
    /* dlsym re-enters here while the symbols resolve; NULL makes the
     * loader fall back to its scratch buffer */
    if load_state() == LoadStatus::LoadingMemFuncs || real::resolving() {
        return null_mut();
    }
    if load_state() == LoadStatus::NotLoaded {
        bigmaac_init();
    }
    if load_state() != LoadStatus::Loaded || count == 0 || size == 0 {
        return fallback_calloc(count, size);
    }

    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => {
            set_errno(libc::ENOMEM);
            return null_mut();
        }
    };
    if total > min_size_fry() {
        let ptr = match create_chunk(total) {
            Some(ptr) => ptr,
            None => return oom(),
        };
        if total <= min_size_bigmaac() {
            /* fries reuse the shared mapping and must be wiped; a fresh
             * bigmaac file already reads back as zeros */
            core::ptr::write_bytes(ptr as *mut u8, 0, total);
        }
        ptr as *mut c_void
    } else {
        fallback_calloc(count, size)
    }
}

pub unsafe fn bigmaac_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if load_state() == LoadStatus::NotLoaded {
        bigmaac_init();
    }
    if load_state() != LoadStatus::Loaded {
        return if real::ready() {
            real::realloc(ptr, size)
        } else {
            set_errno(libc::ENOMEM);
            null_mut()
        };
    }
    if ptr.is_null() {
        return bigmaac_malloc(size);
    }
    if size == 0 {
        /* release and hand back a minimal allocation */
        bigmaac_free(ptr);
        return real::malloc(0);
    }

    let addr = ptr as vaddr_t;
    if managed_range_contains(addr) {
        let old_size = match chunk_size(addr) {
            Some(old_size) => old_size,
            None => {
                dprintf!(CRITICAL, "bigmaac: realloc of unknown pointer {:p}\n", ptr);
                return null_mut();
            }
        };
        if old_size >= size {
            return ptr;
        }

        let new_ptr = if size > min_size_fry() {
            match create_chunk(size) {
                Some(new_ptr) => new_ptr as *mut c_void,
                None => return oom(),
            }
        } else {
            let new_ptr = real::malloc(size);
            if new_ptr.is_null() {
                set_errno(libc::ENOMEM);
                return null_mut();
            }
            new_ptr
        };

        /* the copy runs outside the heap lock */
        core::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8,
                                       min(old_size, size));
        if remove_chunk(addr).is_err() {
            dprintf!(CRITICAL, "bigmaac: could not release {:p} after relocation\n", ptr);
        }
        return new_ptr;
    }

    /* system-owned pointer */
    if size > min_size_fry() {
        let old_size = libc::malloc_usable_size(ptr);
        let new_ptr = match create_chunk(size) {
            Some(new_ptr) => new_ptr,
            None => return oom(),
        };
        core::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8,
                                       min(old_size, size));
        real::free(ptr);
        return new_ptr as *mut c_void;
    }
    real::realloc(ptr, size)
}

pub unsafe fn bigmaac_reallocarray(ptr: *mut c_void, count: usize, size: usize)
    -> *mut c_void
{
    match count.checked_mul(size) {
        Some(total) => bigmaac_realloc(ptr, total),
        None => {
            set_errno(libc::ENOMEM);
            null_mut()
        }
    }
}

pub unsafe fn bigmaac_free(ptr: *mut c_void) {
    if load_state() == LoadStatus::NotLoaded {
        bigmaac_init();
    }
    let addr = ptr as vaddr_t;
    if load_state() != LoadStatus::Loaded || !managed_range_contains(addr) {
        if real::ready() {
            real::free(ptr);
        }
        return;
    }

    match remove_chunk(addr) {
        Ok(()) => {}
        Err(ErrNO::NotFound) => {
            dprintf!(CRITICAL, "bigmaac: free of pointer that was not allocated {:p}\n", ptr);
        }
        Err(_) => {
            /* detach failure, already reported; the block stays live */
        }
    }
}
