/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::ptr::NonNull;
use rbtree::RBTree;
use crate::errors::ErrNO;
use crate::klib::list::{Block, BlockList, MemoryUse, NO_HEAP_IDX};
use crate::klib::sizeheap::SizeHeap;
use crate::types::vaddr_t;

/* One contiguous reservation together with the structures tracking its
 * free and in-use sub-ranges. The address-ordered list owns every block;
 * the size heap indexes the FREE subset and the start-address tree indexes
 * the IN_USE subset. Adjacent free blocks never coexist, coalescing is
 * eager on release. */
pub struct Arena {
    base: vaddr_t,
    end: vaddr_t,
    list: BlockList,
    heap: SizeHeap,
    index: RBTree<vaddr_t, NonNull<Block>>,
    used: usize,
}

impl Arena {
    pub fn new(base: vaddr_t, size: usize) -> Result<Arena, ErrNO> {
        let (list, first) = BlockList::new(base, size).ok_or(ErrNO::NoMem)?;
        let mut heap = SizeHeap::new();
        heap.insert(first)?;
        Ok(Arena {
            base,
            end: base + size,
            list,
            heap,
            index: RBTree::new(),
            used: 0,
        })
    }

    pub fn base(&self) -> vaddr_t {
        self.base
    }

    pub fn end(&self) -> vaddr_t {
        self.end
    }

    pub fn capacity(&self) -> usize {
        self.end - self.base
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn contains(&self, ptr: vaddr_t) -> bool {
        ptr >= self.base && ptr < self.end
    }

    pub fn free_blocks(&self) -> usize {
        self.heap.len()
    }

    pub fn largest_free(&self) -> usize {
        match self.heap.root() {
            Some(root) => unsafe { root.as_ref().size },
            None => 0,
        }
    }

    /* Carve `size` bytes (already rounded by the caller) out of some free
     * block and hand back its start address. */
    pub fn alloc(&mut self, size: usize) -> Result<vaddr_t, ErrNO> {
        let block = self.pop_split(size)?;
        let start = unsafe { block.as_ref().start };
        self.index.insert(start, block);
        self.used += size;
        Ok(start)
    }

    /* Exact-start lookup of a live allocation. */
    pub fn find(&self, ptr: vaddr_t) -> Option<(vaddr_t, usize)> {
        self.index.get(&ptr)
            .map(|block| unsafe { (block.as_ref().start, block.as_ref().size) })
    }

    /* Release the allocation starting at `ptr`, coalescing with whichever
     * neighbors are free. Returns the released size. */
    pub fn release(&mut self, ptr: vaddr_t) -> Result<usize, ErrNO> {
        let block = self.index.remove(&ptr).ok_or(ErrNO::NotFound)?;
        let size = unsafe { block.as_ref().size };
        if let Err(err) = unsafe { self.free_block(block) } {
            /* bookkeeping failure; the block stays live */
            self.index.insert(ptr, block);
            return Err(err);
        }
        self.used -= size;
        Ok(size)
    }

    fn pop_split(&mut self, size: usize) -> Result<NonNull<Block>, ErrNO> {
        let root = self.heap.root().ok_or(ErrNO::NoMem)?;
        if unsafe { root.as_ref().size } < size {
            return Err(ErrNO::NoMem);
        }

        /* Prefer a child of the root when one is big enough, and the
         * smaller of two qualifying children. Carving the largest free
         * block is a last resort, it has to stay around for big requests. */
        let len = self.heap.len();
        let mut chosen = 0;
        if len > 1 && self.heap.size_at(1) >= size {
            chosen = 1;
        }
        if len > 2 && self.heap.size_at(2) >= size
            && (chosen == 0 || self.heap.size_at(2) < self.heap.size_at(chosen)) {
            chosen = 2;
        }

        let mut block = self.heap.slot(chosen);
        if unsafe { block.as_ref().size } == size {
            self.heap.remove(chosen);
            unsafe { block.as_mut().state = MemoryUse::InUse; }
            return Ok(block);
        }

        /* Split: a new IN_USE record takes the front, the free survivor
         * keeps the tail and sinks in the heap (its key shrank). */
        let start = unsafe { block.as_ref().start };
        let used_block = Block::alloc_record(start, size, MemoryUse::InUse)
            .ok_or(ErrNO::NoMem)?;
        unsafe {
            BlockList::insert_before(block, used_block);
            block.as_mut().start += size;
            block.as_mut().size -= size;
        }
        self.heap.sift_down(chosen);
        Ok(used_block)
    }

    /* The sentinel counts as IN_USE, so the no-left-neighbor case falls
     * out of the same comparisons. The grown survivor of a coalesce rises
     * in the heap (its key grew). */
    unsafe fn free_block(&mut self, mut node: NonNull<Block>) -> Result<(), ErrNO> {
        let prev = node.as_ref().prev().unwrap();
        let next = node.as_ref().next();
        let prev_free = prev.as_ref().is_free();
        let next_free = next.map_or(false, |n| n.as_ref().is_free());

        match (prev_free, next_free) {
            (true, true) => {
                /* both neighbors free: everything collapses into next */
                let mut next = next.unwrap();
                next.as_mut().start = prev.as_ref().start;
                next.as_mut().size += node.as_ref().size + prev.as_ref().size;
                BlockList::unlink(node);
                BlockList::unlink(prev);
                self.heap.remove(prev.as_ref().heap_idx);
                self.heap.sift_up(next.as_ref().heap_idx);
                Block::free_record(node);
                Block::free_record(prev);
            }
            (true, false) => {
                let mut prev = prev;
                prev.as_mut().size += node.as_ref().size;
                BlockList::unlink(node);
                self.heap.sift_up(prev.as_ref().heap_idx);
                Block::free_record(node);
            }
            (false, true) => {
                let mut next = next.unwrap();
                next.as_mut().start = node.as_ref().start;
                next.as_mut().size += node.as_ref().size;
                BlockList::unlink(node);
                self.heap.sift_up(next.as_ref().heap_idx);
                Block::free_record(node);
            }
            (false, false) => {
                node.as_mut().state = MemoryUse::Free;
                if let Err(err) = self.heap.insert(node) {
                    node.as_mut().state = MemoryUse::InUse;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /* Walks everything and asserts the structural invariants: the list
     * covers exactly [base, end) in order with no gaps, free blocks are
     * never adjacent, heap membership matches FREE state with back-indices
     * intact, the heap is a max-heap, and `used` matches the IN_USE sum. */
    pub fn check_consistency(&self) {
        let mut total = 0;
        let mut in_use_bytes = 0;
        let mut free_count = 0;
        let mut in_use_count = 0;
        let mut expect = self.base;
        let mut prev_free = false;

        for block in self.list.iter() {
            let block = unsafe { block.as_ref() };
            assert_eq!(block.start, expect);
            expect = block.start + block.size;
            total += block.size;
            match block.state {
                MemoryUse::Free => {
                    assert!(!prev_free);
                    assert!(block.heap_idx != NO_HEAP_IDX);
                    assert!(block.heap_idx < self.heap.len());
                    let slot = self.heap.slot(block.heap_idx);
                    assert_eq!(slot.as_ptr() as *const Block, block as *const Block);
                    free_count += 1;
                    prev_free = true;
                }
                MemoryUse::InUse => {
                    assert_eq!(block.heap_idx, NO_HEAP_IDX);
                    assert!(self.index.get(&block.start).is_some());
                    in_use_bytes += block.size;
                    in_use_count += 1;
                    prev_free = false;
                }
            }
        }

        assert_eq!(total, self.capacity());
        assert_eq!(in_use_bytes, self.used);
        assert_eq!(free_count, self.heap.len());
        assert_eq!(in_use_count, self.index.len());
        for idx in 1..self.heap.len() {
            assert!(self.heap.size_at((idx - 1) / 2) >= self.heap.size_at(idx));
        }
    }
}

unsafe impl Send for Arena {}
