/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use std::ffi::CString;
use crate::IS_ALIGNED;
use crate::config::Config;
use crate::defines::{system_page_size, KB, MB};
use crate::heap::{self, BigMaac, LoadStatus};
use crate::stdio::{errno, set_errno};

fn test_config(size_fries: usize, size_bigmaac: usize) -> Config {
    let mut cfg = Config::default();
    cfg.min_size_fry = 4 * KB;
    cfg.min_size_bigmaac = 64 * KB;
    cfg.size_fries = size_fries;
    cfg.size_bigmaac = size_bigmaac;
    cfg.template = CString::new("/tmp/bigmaac-test.XXXXXX").unwrap();
    cfg
}

/* The global instance is shared by every test in the binary, so the tests
 * below only assert things that hold with other tests allocating
 * concurrently; exact-state assertions run on owned instances. */
fn ensure_loaded() {
    heap::bigmaac_init();
    assert_eq!(heap::load_state(), LoadStatus::Loaded);
}

#[test]
fn chunk_classification_by_size() {
    let mut bigmaac = BigMaac::new(test_config(16 * MB, 16 * MB)).unwrap();

    /* a threshold-sized request stays in the smaller class */
    let fry_lo = bigmaac.create_chunk(4 * KB + 1).unwrap();
    let fry_hi = bigmaac.create_chunk(64 * KB).unwrap();
    let big = bigmaac.create_chunk(64 * KB + 1).unwrap();
    assert!(bigmaac.fries().contains(fry_lo));
    assert!(bigmaac.fries().contains(fry_hi));
    assert!(bigmaac.bigmaacs().contains(big));
    assert!(IS_ALIGNED!(big, system_page_size()));

    bigmaac.release_chunk(fry_lo).unwrap();
    bigmaac.release_chunk(fry_hi).unwrap();
    bigmaac.release_chunk(big).unwrap();
    assert_eq!(bigmaac.fries().used(), 0);
    assert_eq!(bigmaac.bigmaacs().used(), 0);
    bigmaac.fries().check_consistency();
    bigmaac.bigmaacs().check_consistency();
}

#[test]
fn fry_rounding_and_accounting() {
    let mut bigmaac = BigMaac::new(test_config(8 * MB, 8 * MB)).unwrap();
    let ptr = bigmaac.create_chunk(5000).unwrap();
    assert_eq!(bigmaac.chunk_size(ptr), Some(8 * KB));
    assert_eq!(bigmaac.fries().used(), 8 * KB);
    bigmaac.release_chunk(ptr).unwrap();
    assert_eq!(bigmaac.fries().used(), 0);
}

#[test]
fn bigmaac_chunks_are_fresh_files() {
    let mut bigmaac = BigMaac::new(test_config(8 * MB, 8 * MB)).unwrap();
    let ptr = bigmaac.create_chunk(128 * KB).unwrap();
    unsafe {
        let bytes = ptr as *mut u8;
        for off in 0..(128 * KB) {
            *bytes.add(off) = 0xee;
        }
    }
    bigmaac.release_chunk(ptr).unwrap();

    /* the freed range coalesced back to the arena front, so the next carve
     * reuses it, now backed by a brand new file reading as zeros */
    let again = bigmaac.create_chunk(128 * KB).unwrap();
    assert_eq!(again, ptr);
    unsafe {
        let bytes = again as *const u8;
        for off in 0..(128 * KB) {
            assert_eq!(*bytes.add(off), 0);
        }
    }
    bigmaac.release_chunk(again).unwrap();
}

#[test]
fn oom_leaves_state_untouched() {
    let mut bigmaac = BigMaac::new(test_config(MB, MB)).unwrap();
    assert!(bigmaac.create_chunk(2 * MB).is_err());
    assert_eq!(bigmaac.fries().used(), 0);
    assert_eq!(bigmaac.bigmaacs().used(), 0);
    bigmaac.bigmaacs().check_consistency();
}

#[test]
fn release_of_unknown_chunk_fails() {
    let mut bigmaac = BigMaac::new(test_config(MB, MB)).unwrap();
    let inside = bigmaac.fries().base() + 12345;
    assert!(bigmaac.release_chunk(inside).is_err());
    let outside = bigmaac.bigmaacs().end() + 4 * KB;
    assert!(bigmaac.release_chunk(outside).is_err());
}

#[test]
fn mismatched_thresholds_fail_init() {
    let mut cfg = test_config(MB, MB);
    cfg.min_size_fry = 128 * KB;
    assert!(BigMaac::new(cfg).is_err());
}

#[test]
fn config_normalize_disables_fries() {
    let mut cfg = Config::default();
    cfg.min_size_fry = 0;
    cfg.normalize();
    assert_eq!(cfg.min_size_fry, cfg.min_size_bigmaac);
}

#[test]
fn init_is_idempotent() {
    ensure_loaded();
    heap::bigmaac_init();
    assert_eq!(heap::load_state(), LoadStatus::Loaded);
}

#[test]
fn global_malloc_routes_by_size() {
    ensure_loaded();
    unsafe {
        let small = heap::bigmaac_malloc(100);
        assert!(!small.is_null());
        assert!(!heap::managed_range_contains(small as usize));

        let fry = heap::bigmaac_malloc(8 * KB);
        assert!(heap::fry_range_contains(fry as usize));

        let big = heap::bigmaac_malloc(2 * MB);
        assert!(heap::bigmaac_range_contains(big as usize));
        assert!(IS_ALIGNED!(big as usize, system_page_size()));

        /* mapped and usable end to end */
        core::ptr::write_bytes(big as *mut u8, 0xa5, 2 * MB);
        assert_eq!(*(big as *const u8).add(2 * MB - 1), 0xa5);
        core::ptr::write_bytes(fry as *mut u8, 0x5a, 8 * KB);
        assert_eq!(*(fry as *const u8).add(8 * KB - 1), 0x5a);

        heap::bigmaac_free(big);
        heap::bigmaac_free(fry);
        heap::bigmaac_free(small);
    }
}

#[test]
fn global_malloc_zero_delegates() {
    ensure_loaded();
    unsafe {
        let ptr = heap::bigmaac_malloc(0);
        assert!(!heap::managed_range_contains(ptr as usize));
        heap::bigmaac_free(ptr);
        heap::bigmaac_free(core::ptr::null_mut());
    }
}

#[test]
fn global_realloc_grows_across_classes() {
    ensure_loaded();
    unsafe {
        let ptr = heap::bigmaac_malloc(8 * KB) as *mut u8;
        assert!(heap::fry_range_contains(ptr as usize));
        for off in 0..(8 * KB) {
            *ptr.add(off) = (off % 127) as u8;
        }

        let grown = heap::bigmaac_realloc(ptr as *mut _, 2 * MB) as *mut u8;
        assert!(heap::bigmaac_range_contains(grown as usize));
        for off in 0..(8 * KB) {
            assert_eq!(*grown.add(off), (off % 127) as u8);
        }

        /* shrinking a managed chunk stays in place */
        let shrunk = heap::bigmaac_realloc(grown as *mut _, MB);
        assert_eq!(shrunk as *mut u8, grown);
        heap::bigmaac_free(shrunk);
    }
}

#[test]
fn global_realloc_promotes_system_pointer() {
    ensure_loaded();
    unsafe {
        let ptr = heap::bigmaac_malloc(256) as *mut u8;
        assert!(!heap::managed_range_contains(ptr as usize));
        for off in 0..256 {
            *ptr.add(off) = off as u8;
        }

        let grown = heap::bigmaac_realloc(ptr as *mut _, 2 * MB) as *mut u8;
        assert!(heap::managed_range_contains(grown as usize));
        for off in 0..256 {
            assert_eq!(*grown.add(off), off as u8);
        }
        heap::bigmaac_free(grown as *mut _);
    }
}

#[test]
fn global_realloc_of_null_acts_as_malloc() {
    ensure_loaded();
    unsafe {
        let ptr = heap::bigmaac_realloc(core::ptr::null_mut(), 8 * KB);
        assert!(heap::fry_range_contains(ptr as usize));
        heap::bigmaac_free(ptr);
    }
}

#[test]
fn global_calloc_zeroes_by_product() {
    ensure_loaded();
    unsafe {
        /* 512 * 16 bytes lands in the fry class and must be wiped */
        let fry = heap::bigmaac_calloc(512, 16) as *const u8;
        assert!(heap::fry_range_contains(fry as usize));
        for off in 0..(8 * KB) {
            assert_eq!(*fry.add(off), 0);
        }
        heap::bigmaac_free(fry as *mut _);

        /* a bigmaac reads as zeros straight from its fresh mapping */
        let big = heap::bigmaac_calloc(1, 2 * MB) as *const u8;
        assert!(heap::bigmaac_range_contains(big as usize));
        for off in (0..(2 * MB)).step_by(system_page_size()) {
            assert_eq!(*big.add(off), 0);
        }
        heap::bigmaac_free(big as *mut _);
    }
}

#[test]
fn global_overflow_and_oom_set_enomem() {
    ensure_loaded();
    unsafe {
        set_errno(0);
        let overflowed = heap::bigmaac_calloc(usize::MAX / 2, 3);
        assert!(overflowed.is_null());
        assert_eq!(errno(), libc::ENOMEM);

        set_errno(0);
        let huge = heap::bigmaac_malloc(usize::MAX / 2);
        assert!(huge.is_null());
        assert_eq!(errno(), libc::ENOMEM);

        set_errno(0);
        let wrapped = heap::bigmaac_reallocarray(core::ptr::null_mut(), usize::MAX / 4, 8);
        assert!(wrapped.is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }
}

#[test]
fn global_free_of_unknown_managed_pointer_is_ignored() {
    ensure_loaded();
    unsafe {
        let ptr = heap::bigmaac_malloc(8 * KB);
        assert!(heap::fry_range_contains(ptr as usize));
        /* inside the managed range but never a block start; logged and
         * ignored, nothing else disturbed */
        heap::bigmaac_free((ptr as usize + 1) as *mut _);
        assert_eq!(heap::chunk_size(ptr as usize), Some(8 * KB));
        heap::bigmaac_free(ptr);
    }
}

#[test]
fn concurrent_alloc_free_stress() {
    ensure_loaded();
    let mut handles = Vec::new();
    for thread in 0..4u64 {
        handles.push(std::thread::spawn(move || {
            let mut seed = 0x9e37_79b9_7f4a_7c15u64.wrapping_add(thread);
            let mut rand = move || {
                seed = seed.wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (seed >> 33) as usize
            };
            let mut live: Vec<(*mut u8, usize)> = Vec::new();
            for _ in 0..200 {
                if rand() % 4 < 3 {
                    let size = 4 * KB + rand() % (256 * KB);
                    let ptr = unsafe { heap::bigmaac_malloc(size) } as *mut u8;
                    if !ptr.is_null() {
                        unsafe {
                            core::ptr::write_bytes(ptr, (size % 255) as u8, 4 * KB);
                        }
                        live.push((ptr, size));
                    }
                } else if let Some((ptr, size)) = live.pop() {
                    unsafe {
                        assert_eq!(*ptr, (size % 255) as u8);
                        heap::bigmaac_free(ptr as *mut _);
                    }
                }
            }
            for (ptr, _) in live {
                unsafe { heap::bigmaac_free(ptr as *mut _); }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
