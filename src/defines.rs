/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

#![allow(dead_code)]

use core::sync::atomic::{AtomicUsize, Ordering};

/* Const units */
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

/* Requests at or below this stay on the system allocator. */
pub const DEFAULT_MIN_FRY_SIZE: usize = 4 * KB;

/* Requests above this get a backing file of their own. */
pub const DEFAULT_MIN_BIGMAAC_SIZE: usize = MB;

/* Arena reservations. Fries are backed by one file mapped at init, so their
 * arena stays modest; the bigmaac arena only holds address space. */
pub const DEFAULT_SIZE_FRIES: usize = 256 * MB;
pub const DEFAULT_SIZE_BIGMAAC: usize = 16 * GB;

/* Fry sizes round up to a multiple of this grain. */
pub const DEFAULT_FRY_SIZE_MULTIPLE: usize = 4 * KB;

/* mkstemp template for backing files; the trailing Xs get filled in. */
pub const DEFAULT_TEMPLATE: &str = "/tmp/bigmaac.XXXXXX";

static PAGE_SIZE_CACHE: AtomicUsize = AtomicUsize::new(0);

pub fn system_page_size() -> usize {
    let cached = PAGE_SIZE_CACHE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let sz = if sz > 0 { sz as usize } else { 4 * KB };
    PAGE_SIZE_CACHE.store(sz, Ordering::Relaxed);
    sz
}
