/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use libc::c_void;
use crate::debug::*;
use crate::dprintf;
use crate::errors::ErrNO;

/* The next `malloc` and friends in dynamic load order. Resolved once; the
 * shims and the forwarding global allocator delegate through these so the
 * interposed entry points are never re-entered. */

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type PosixMemalignFn =
    unsafe extern "C" fn(*mut *mut c_void, libc::size_t, libc::size_t) -> libc::c_int;

static REAL_MALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_CALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_REALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_FREE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_POSIX_MEMALIGN: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;
const FAILED: u8 = 3;

static RESOLVE_STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);

pub fn ready() -> bool {
    RESOLVE_STATE.load(Ordering::Acquire) == RESOLVED
}

/* The dynamic loader may allocate inside dlsym; while this window is open
 * the calloc shim answers NULL and the loader falls back to its scratch
 * buffer. */
pub fn resolving() -> bool {
    RESOLVE_STATE.load(Ordering::Acquire) == RESOLVING
}

pub fn resolve() -> Result<(), ErrNO> {
    match RESOLVE_STATE.compare_exchange(UNRESOLVED, RESOLVING,
                                         Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(RESOLVED) => return Ok(()),
        Err(FAILED) => return Err(ErrNO::NotFound),
        Err(_) => {
            /* another thread is mid-resolve */
            loop {
                match RESOLVE_STATE.load(Ordering::Acquire) {
                    RESOLVED => return Ok(()),
                    FAILED => return Err(ErrNO::NotFound),
                    _ => core::hint::spin_loop(),
                }
            }
        }
    }

    let malloc_sym = lookup(b"malloc\0");
    let calloc_sym = lookup(b"calloc\0");
    let realloc_sym = lookup(b"realloc\0");
    let free_sym = lookup(b"free\0");
    let memalign_sym = lookup(b"posix_memalign\0");

    if malloc_sym.is_null() || calloc_sym.is_null()
        || realloc_sym.is_null() || free_sym.is_null() {
        dprintf!(CRITICAL, "bigmaac: dlsym could not resolve the system allocator\n");
        RESOLVE_STATE.store(FAILED, Ordering::Release);
        return Err(ErrNO::NotFound);
    }

    REAL_MALLOC.store(malloc_sym, Ordering::Release);
    REAL_CALLOC.store(calloc_sym, Ordering::Release);
    REAL_REALLOC.store(realloc_sym, Ordering::Release);
    REAL_FREE.store(free_sym, Ordering::Release);
    REAL_POSIX_MEMALIGN.store(memalign_sym, Ordering::Release);
    RESOLVE_STATE.store(RESOLVED, Ordering::Release);
    Ok(())
}

fn lookup(name: &'static [u8]) -> *mut c_void {
    unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char) }
}

/* The accessors below require a prior successful resolve(). */

pub unsafe fn malloc(size: usize) -> *mut c_void {
    debug_assert!(ready());
    let f: MallocFn = mem::transmute(REAL_MALLOC.load(Ordering::Acquire));
    f(size)
}

pub unsafe fn calloc(count: usize, size: usize) -> *mut c_void {
    debug_assert!(ready());
    let f: CallocFn = mem::transmute(REAL_CALLOC.load(Ordering::Acquire));
    f(count, size)
}

pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    debug_assert!(ready());
    let f: ReallocFn = mem::transmute(REAL_REALLOC.load(Ordering::Acquire));
    f(ptr, size)
}

pub unsafe fn free(ptr: *mut c_void) {
    debug_assert!(ready());
    let f: FreeFn = mem::transmute(REAL_FREE.load(Ordering::Acquire));
    f(ptr)
}

pub unsafe fn posix_memalign(align: usize, size: usize) -> *mut c_void {
    let sym = REAL_POSIX_MEMALIGN.load(Ordering::Acquire);
    if sym.is_null() {
        return ptr::null_mut();
    }
    let f: PosixMemalignFn = mem::transmute(sym);
    let mut out: *mut c_void = ptr::null_mut();
    if f(&mut out, align, size) != 0 {
        return ptr::null_mut();
    }
    out
}
