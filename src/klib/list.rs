/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, Layout};
use crate::types::vaddr_t;

pub const NO_HEAP_IDX: usize = usize::MAX;

#[derive(Clone, Copy, Debug)]
#[derive(PartialEq)]
pub enum MemoryUse {
    InUse,
    Free,
}

/* One contiguous sub-range of an arena. A block is FREE exactly while it
 * sits in the owning arena's size heap; heap_idx is the reverse pointer
 * that makes rekeying O(log n) without a search. */
pub struct Block {
    next: Option<NonNull<Block>>,
    prev: Option<NonNull<Block>>,
    pub state: MemoryUse,
    pub heap_idx: usize,
    pub start: vaddr_t,
    pub size: usize,
}

impl Block {
    fn layout() -> Layout {
        Layout::new::<Block>()
    }

    /* Records go through the forwarding global allocator onto the system
     * heap; None when the real allocator is exhausted. */
    pub fn alloc_record(start: vaddr_t, size: usize, state: MemoryUse) -> Option<NonNull<Block>> {
        let raw = unsafe { alloc(Self::layout()) } as *mut Block;
        let ptr = NonNull::new(raw)?;
        unsafe {
            ptr.as_ptr().write(Block {
                next: None,
                prev: None,
                state,
                heap_idx: NO_HEAP_IDX,
                start,
                size,
            });
        }
        Some(ptr)
    }

    pub unsafe fn free_record(ptr: NonNull<Block>) {
        dealloc(ptr.as_ptr() as *mut u8, Self::layout());
    }

    pub fn next(&self) -> Option<NonNull<Block>> {
        self.next
    }

    pub fn prev(&self) -> Option<NonNull<Block>> {
        self.prev
    }

    pub fn is_free(&self) -> bool {
        self.state == MemoryUse::Free
    }
}

/* Blocks of one arena in strict start-address order, anchored by a dummy
 * head sentinel. The sentinel is IN_USE with size zero so a block with no
 * real left neighbor coalesces the same way as any other. The list owns
 * every record; the size heap only indexes the FREE subset. */
pub struct BlockList {
    head: NonNull<Block>,
}

impl BlockList {
    /* Sentinel plus one FREE block covering the whole range; the caller
     * still has to heap-insert the block. */
    pub fn new(start: vaddr_t, size: usize) -> Option<(BlockList, NonNull<Block>)> {
        let sentinel = Block::alloc_record(0, 0, MemoryUse::InUse)?;
        let first = match Block::alloc_record(start, size, MemoryUse::Free) {
            Some(block) => block,
            None => {
                unsafe { Block::free_record(sentinel); }
                return None;
            }
        };
        unsafe {
            (*sentinel.as_ptr()).next = Some(first);
            (*first.as_ptr()).prev = Some(sentinel);
        }
        Some((BlockList { head: sentinel }, first))
    }

    pub fn sentinel(&self) -> NonNull<Block> {
        self.head
    }

    pub fn first(&self) -> Option<NonNull<Block>> {
        unsafe { self.head.as_ref().next }
    }

    /* Splice `new` immediately before `at`. `at` must not be the sentinel. */
    pub unsafe fn insert_before(at: NonNull<Block>, new: NonNull<Block>) {
        let prev = (*at.as_ptr()).prev.unwrap();
        (*prev.as_ptr()).next = Some(new);
        (*new.as_ptr()).prev = Some(prev);
        (*new.as_ptr()).next = Some(at);
        (*at.as_ptr()).prev = Some(new);
    }

    /* Unlink `node`. `node` must not be the sentinel. */
    pub unsafe fn unlink(node: NonNull<Block>) {
        let prev = (*node.as_ptr()).prev.take().unwrap();
        let next = (*node.as_ptr()).next.take();
        (*prev.as_ptr()).next = next;
        if let Some(next) = next {
            (*next.as_ptr()).prev = Some(prev);
        }
    }

    /* Blocks after the sentinel, in address order. */
    pub fn iter(&self) -> BlockIter {
        BlockIter { cur: self.first() }
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        let mut cur = Some(self.head);
        while let Some(block) = cur {
            cur = unsafe { block.as_ref().next };
            unsafe { Block::free_record(block); }
        }
    }
}

unsafe impl Send for BlockList {}

pub struct BlockIter {
    cur: Option<NonNull<Block>>,
}

impl Iterator for BlockIter {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<NonNull<Block>> {
        let cur = self.cur?;
        self.cur = unsafe { cur.as_ref().next };
        Some(cur)
    }
}
