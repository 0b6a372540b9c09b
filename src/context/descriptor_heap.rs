//! Descriptor heap slot allocation
//!
//! A heap hands out contiguous slot ranges from a list of free blocks kept
//! sorted by offset. Freed ranges are merged back with their neighbours, so
//! a heap that has had every range returned ends up as a single block again.

use crate::backend::DescriptorRange;
use crate::error::{RenderError, RenderResult};

/// Slots in the constant buffer / texture / raw buffer heap
pub const RESOURCE_HEAP_CAPACITY: u32 = 1024;
/// Slots in the sampler heap
pub const SAMPLER_HEAP_CAPACITY: u32 = 1024;

#[derive(Debug)]
pub struct DescriptorHeap {
    name: &'static str,
    capacity: u32,
    free_blocks: Vec<DescriptorRange>,
}

impl DescriptorHeap {
    pub fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            capacity,
            free_blocks: vec![DescriptorRange {
                offset: 0,
                count: capacity,
            }],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn free_count(&self) -> u32 {
        self.free_blocks.iter().map(|b| b.count).sum()
    }

    pub fn allocated_count(&self) -> u32 {
        self.capacity - self.free_count()
    }

    /// First-fit allocation of `count` contiguous slots
    pub fn allocate(&mut self, count: u32) -> RenderResult<DescriptorRange> {
        if count == 0 {
            return Ok(DescriptorRange {
                offset: 0,
                count: 0,
            });
        }
        let Some(index) = self.free_blocks.iter().position(|b| b.count >= count) else {
            return Err(RenderError::DescriptorHeapExhausted {
                requested: count,
                available: self.free_count(),
            });
        };
        let block = &mut self.free_blocks[index];
        let range = DescriptorRange {
            offset: block.offset,
            count,
        };
        block.offset += count;
        block.count -= count;
        if block.count == 0 {
            self.free_blocks.remove(index);
        }
        log::trace!(
            "{}: allocated slots {}..{}",
            self.name,
            range.offset,
            range.end()
        );
        Ok(range)
    }

    /// Return a range; merges with adjacent free blocks
    pub fn free(&mut self, range: DescriptorRange) {
        if range.count == 0 {
            return;
        }
        if range.end() > self.capacity || self.free_blocks.iter().any(|b| b.overlaps(&range)) {
            log::error!(
                "{}: ignoring free of slots {}..{} that are not allocated",
                self.name,
                range.offset,
                range.end()
            );
            return;
        }

        let index = self
            .free_blocks
            .iter()
            .position(|b| b.offset > range.offset)
            .unwrap_or(self.free_blocks.len());
        self.free_blocks.insert(index, range);

        // merge with the next block
        if index + 1 < self.free_blocks.len()
            && self.free_blocks[index].end() == self.free_blocks[index + 1].offset
        {
            let next = self.free_blocks.remove(index + 1);
            self.free_blocks[index].count += next.count;
        }
        // merge with the previous block
        if index > 0 && self.free_blocks[index - 1].end() == self.free_blocks[index].offset {
            let current = self.free_blocks.remove(index);
            self.free_blocks[index - 1].count += current.count;
        }
    }

    #[cfg(test)]
    fn block_count(&self) -> usize {
        self.free_blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_do_not_overlap() {
        let mut heap = DescriptorHeap::new("test", 16);
        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(3).unwrap();
        let c = heap.allocate(5).unwrap();
        assert!(!a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!b.overlaps(&c));
        assert_eq!(heap.allocated_count(), 12);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut heap = DescriptorHeap::new("test", 4);
        heap.allocate(3).unwrap();
        assert!(matches!(
            heap.allocate(2),
            Err(RenderError::DescriptorHeapExhausted {
                requested: 2,
                available: 1
            })
        ));
    }

    #[test]
    fn freed_ranges_coalesce() {
        let mut heap = DescriptorHeap::new("test", 12);
        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        let c = heap.allocate(4).unwrap();
        heap.free(a);
        heap.free(c);
        assert_eq!(heap.block_count(), 2);
        heap.free(b);
        assert_eq!(heap.block_count(), 1);
        assert_eq!(heap.free_count(), 12);
        assert_eq!(heap.allocate(12).unwrap().offset, 0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = DescriptorHeap::new("test", 8);
        let a = heap.allocate(2).unwrap();
        let _b = heap.allocate(2).unwrap();
        heap.free(a);
        let c = heap.allocate(2).unwrap();
        assert_eq!(c.offset, a.offset);
    }

    #[test]
    fn double_free_is_ignored() {
        let mut heap = DescriptorHeap::new("test", 8);
        let a = heap.allocate(2).unwrap();
        heap.free(a);
        heap.free(a);
        assert_eq!(heap.free_count(), 8);
    }

    #[test]
    fn zero_sized_allocation_takes_no_slots() {
        let mut heap = DescriptorHeap::new("test", 8);
        let empty = heap.allocate(0).unwrap();
        assert_eq!(empty.count, 0);
        assert_eq!(heap.free_count(), 8);
        heap.free(empty);
        assert_eq!(heap.free_count(), 8);
    }
}
