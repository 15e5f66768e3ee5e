/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

use core::ptr::NonNull;
use crate::errors::ErrNO;
use super::list::{Block, NO_HEAP_IDX};

/* Array-backed max-heap over the FREE blocks of one arena, keyed by block
 * size. slots[b.heap_idx] == b at all times, so a block whose size changed
 * can be re-keyed from its own index. */
pub struct SizeHeap {
    slots: Vec<NonNull<Block>>,
}

impl SizeHeap {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn root(&self) -> Option<NonNull<Block>> {
        self.slots.first().copied()
    }

    pub fn slot(&self, idx: usize) -> NonNull<Block> {
        self.slots[idx]
    }

    pub fn size_at(&self, idx: usize) -> usize {
        unsafe { self.slots[idx].as_ref().size }
    }

    pub fn insert(&mut self, mut block: NonNull<Block>) -> Result<(), ErrNO> {
        self.slots.try_reserve(1).map_err(|_| ErrNO::NoMem)?;
        let idx = self.slots.len();
        self.slots.push(block);
        unsafe { block.as_mut().heap_idx = idx; }
        self.sift_up(idx);
        Ok(())
    }

    /* Replace the removed slot with the last one and re-key it in whichever
     * direction its size calls for. */
    pub fn remove(&mut self, idx: usize) {
        let last = self.slots.len() - 1;
        unsafe { (*self.slots[idx].as_ptr()).heap_idx = NO_HEAP_IDX; }
        if idx == last {
            self.slots.pop();
            return;
        }
        let moved = self.slots.pop().unwrap();
        self.slots[idx] = moved;
        unsafe { (*moved.as_ptr()).heap_idx = idx; }
        if idx > 0 && self.size_at(idx) > self.size_at((idx - 1) / 2) {
            self.sift_up(idx);
        } else {
            self.sift_down(idx);
        }
    }

    pub fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.size_at(idx) <= self.size_at(parent) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    pub fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = idx * 2 + 1;
            let right = idx * 2 + 2;
            let mut largest = idx;
            if left < self.slots.len() && self.size_at(left) > self.size_at(largest) {
                largest = left;
            }
            if right < self.slots.len() && self.size_at(right) > self.size_at(largest) {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.swap(idx, largest);
            idx = largest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        unsafe {
            (*self.slots[a].as_ptr()).heap_idx = a;
            (*self.slots[b].as_ptr()).heap_idx = b;
        }
    }
}

unsafe impl Send for SizeHeap {}
