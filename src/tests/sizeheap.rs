/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::ptr::NonNull;
use crate::klib::list::{Block, MemoryUse, NO_HEAP_IDX};
use crate::klib::sizeheap::SizeHeap;

fn free_block(start: usize, size: usize) -> NonNull<Block> {
    Block::alloc_record(start, size, MemoryUse::Free).unwrap()
}

fn drop_all(blocks: Vec<NonNull<Block>>) {
    for block in blocks {
        unsafe { Block::free_record(block); }
    }
}

fn assert_heap_ok(heap: &SizeHeap) {
    for idx in 0..heap.len() {
        assert_eq!(unsafe { heap.slot(idx).as_ref().heap_idx }, idx);
        if idx > 0 {
            assert!(heap.size_at((idx - 1) / 2) >= heap.size_at(idx));
        }
    }
}

#[test]
fn insert_keeps_max_at_root() {
    let mut heap = SizeHeap::new();
    let sizes = [4096, 65536, 8192, 1 << 20, 12288, 512 * 1024, 4096];
    let mut blocks = Vec::new();
    for (pos, &size) in sizes.iter().enumerate() {
        let block = free_block(pos * (1 << 21), size);
        heap.insert(block).unwrap();
        blocks.push(block);
        assert_heap_ok(&heap);
    }
    assert_eq!(heap.len(), sizes.len());
    assert_eq!(unsafe { heap.root().unwrap().as_ref().size }, 1 << 20);
    drop_all(blocks);
}

#[test]
fn remove_any_slot_keeps_order() {
    let mut heap = SizeHeap::new();
    let sizes = [7, 1, 9, 3, 8, 2, 6, 5, 4];
    let mut blocks = Vec::new();
    for (pos, &size) in sizes.iter().enumerate() {
        let block = free_block(pos * 16, size * 4096);
        heap.insert(block).unwrap();
        blocks.push(block);
    }

    /* pull out a middle slot, then the root, then a leaf */
    for _ in 0..3 {
        let victim_idx = heap.len() / 2;
        let victim = heap.slot(victim_idx);
        heap.remove(victim_idx);
        assert_eq!(unsafe { victim.as_ref().heap_idx }, NO_HEAP_IDX);
        assert_heap_ok(&heap);
        heap.remove(0);
        assert_heap_ok(&heap);
        let leaf_idx = heap.len() - 1;
        heap.remove(leaf_idx);
        assert_heap_ok(&heap);
    }
    assert!(heap.is_empty());
    drop_all(blocks);
}

#[test]
fn rekey_down_after_shrink() {
    let mut heap = SizeHeap::new();
    let mut blocks = Vec::new();
    for (pos, &size) in [64, 48, 56, 16, 32].iter().enumerate() {
        let block = free_block(pos * 4096, size * 1024);
        heap.insert(block).unwrap();
        blocks.push(block);
    }

    /* the root shrinks below its children, as after a split */
    let mut root = heap.root().unwrap();
    unsafe { root.as_mut().size = 8 * 1024; }
    heap.sift_down(0);
    assert_heap_ok(&heap);
    assert_eq!(unsafe { heap.root().unwrap().as_ref().size }, 56 * 1024);
    drop_all(blocks);
}

#[test]
fn rekey_up_after_grow() {
    let mut heap = SizeHeap::new();
    let mut blocks = Vec::new();
    for (pos, &size) in [64, 48, 56, 16, 32].iter().enumerate() {
        let block = free_block(pos * 4096, size * 1024);
        heap.insert(block).unwrap();
        blocks.push(block);
    }

    /* a leaf grows past the root, as after a coalesce */
    let leaf_idx = heap.len() - 1;
    let mut leaf = heap.slot(leaf_idx);
    unsafe { leaf.as_mut().size = 128 * 1024; }
    heap.sift_up(leaf_idx);
    assert_heap_ok(&heap);
    assert_eq!(heap.root().unwrap(), leaf);
    drop_all(blocks);
}
