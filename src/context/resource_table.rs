//! CPU-side bookkeeping for resource tables
//!
//! Categories must be filled in order: constant buffers, then
//! textures with their samplers, then raw buffers. Each category owns one
//! contiguous slot range, taken from the resource heap (samplers from the
//! sampler heap) when the category is set and returned on destroy.

use crate::backend::{
    BufferHandle, DescriptorRange, ResourceTableDesc, ResourceTableHandle, SamplerHandle,
    TextureHandle,
};
use crate::error::{RenderError, RenderResult};

use super::descriptor_heap::DescriptorHeap;

/// Resource category of a table, in required fill order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableCategory {
    ConstantBuffers,
    Textures,
    Buffers,
}

#[derive(Debug)]
pub struct ResourceTable {
    handle: ResourceTableHandle,
    desc: ResourceTableDesc,
    last_category: Option<TableCategory>,
}

impl ResourceTable {
    pub fn new(handle: ResourceTableHandle) -> Self {
        Self {
            handle,
            desc: ResourceTableDesc::default(),
            last_category: None,
        }
    }

    pub fn handle(&self) -> ResourceTableHandle {
        self.handle
    }

    pub fn desc(&self) -> &ResourceTableDesc {
        &self.desc
    }

    fn check_order(&self, category: TableCategory) -> RenderResult<()> {
        match self.last_category {
            Some(last) if category < last => Err(RenderError::InvalidBindingOrder(format!(
                "{category:?} set after {last:?} on table {}",
                self.handle.id()
            ))),
            _ => Ok(()),
        }
    }

    /// A new range for `count` slots, or None when `slot` already fits
    fn allocate(
        heap: &mut DescriptorHeap,
        slot: Option<DescriptorRange>,
        count: usize,
    ) -> RenderResult<Option<DescriptorRange>> {
        let count = count as u32;
        if slot.map(|r| r.count) == Some(count) {
            return Ok(None);
        }
        heap.allocate(count).map(Some)
    }

    fn commit(heap: &mut DescriptorHeap, slot: &mut Option<DescriptorRange>, range: Option<DescriptorRange>) {
        if let Some(range) = range {
            if let Some(old) = slot.replace(range) {
                heap.free(old);
            }
        }
    }

    fn reserve(
        heap: &mut DescriptorHeap,
        slot: &mut Option<DescriptorRange>,
        count: usize,
    ) -> RenderResult<()> {
        let range = Self::allocate(heap, *slot, count)?;
        Self::commit(heap, slot, range);
        Ok(())
    }

    pub fn set_constant_buffers(
        &mut self,
        heap: &mut DescriptorHeap,
        buffers: &[BufferHandle],
    ) -> RenderResult<()> {
        self.check_order(TableCategory::ConstantBuffers)?;
        Self::reserve(heap, &mut self.desc.constant_buffer_range, buffers.len())?;
        self.desc.constant_buffers = buffers.to_vec();
        self.last_category = Some(TableCategory::ConstantBuffers);
        Ok(())
    }

    pub fn set_textures(
        &mut self,
        heap: &mut DescriptorHeap,
        sampler_heap: &mut DescriptorHeap,
        textures: &[TextureHandle],
        samplers: &[SamplerHandle],
    ) -> RenderResult<()> {
        self.check_order(TableCategory::Textures)?;
        if textures.len() != samplers.len() {
            return Err(RenderError::usage(format!(
                "{} textures paired with {} samplers",
                textures.len(),
                samplers.len()
            )));
        }
        let texture_range = Self::allocate(heap, self.desc.texture_range, textures.len())?;
        let sampler_range =
            match Self::allocate(sampler_heap, self.desc.sampler_range, samplers.len()) {
                Ok(range) => range,
                Err(e) => {
                    if let Some(range) = texture_range {
                        heap.free(range);
                    }
                    return Err(e);
                }
            };
        Self::commit(heap, &mut self.desc.texture_range, texture_range);
        Self::commit(sampler_heap, &mut self.desc.sampler_range, sampler_range);
        self.desc.textures = textures.to_vec();
        self.desc.samplers = samplers.to_vec();
        self.last_category = Some(TableCategory::Textures);
        Ok(())
    }

    /// Swap textures in place; the count must not change
    pub fn update_textures(&mut self, textures: &[TextureHandle]) -> RenderResult<()> {
        if textures.len() != self.desc.textures.len() {
            return Err(RenderError::usage(format!(
                "update_textures with {} textures on a table holding {}",
                textures.len(),
                self.desc.textures.len()
            )));
        }
        self.desc.textures = textures.to_vec();
        Ok(())
    }

    pub fn set_buffers(
        &mut self,
        heap: &mut DescriptorHeap,
        buffers: &[BufferHandle],
    ) -> RenderResult<()> {
        self.check_order(TableCategory::Buffers)?;
        Self::reserve(heap, &mut self.desc.buffer_range, buffers.len())?;
        self.desc.buffers = buffers.to_vec();
        self.last_category = Some(TableCategory::Buffers);
        Ok(())
    }

    /// Every slot range the table holds
    pub fn ranges(&self) -> impl Iterator<Item = DescriptorRange> + '_ {
        [
            self.desc.constant_buffer_range,
            self.desc.texture_range,
            self.desc.buffer_range,
        ]
        .into_iter()
        .flatten()
    }

    /// Give every slot back
    pub fn release(&mut self, heap: &mut DescriptorHeap, sampler_heap: &mut DescriptorHeap) {
        for range in [
            self.desc.constant_buffer_range.take(),
            self.desc.texture_range.take(),
            self.desc.buffer_range.take(),
        ]
        .into_iter()
        .flatten()
        {
            heap.free(range);
        }
        if let Some(range) = self.desc.sampler_range.take() {
            sampler_heap.free(range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heaps() -> (DescriptorHeap, DescriptorHeap) {
        (
            DescriptorHeap::new("resources", 32),
            DescriptorHeap::new("samplers", 32),
        )
    }

    #[test]
    fn categories_get_separate_ranges() {
        let (mut heap, mut samplers) = heaps();
        let mut table = ResourceTable::new(ResourceTableHandle(1));
        table
            .set_constant_buffers(&mut heap, &[BufferHandle(1), BufferHandle(2)])
            .unwrap();
        table
            .set_textures(
                &mut heap,
                &mut samplers,
                &[TextureHandle(3)],
                &[SamplerHandle(4)],
            )
            .unwrap();
        table.set_buffers(&mut heap, &[BufferHandle(5)]).unwrap();

        let ranges: Vec<_> = table.ranges().collect();
        assert_eq!(ranges.len(), 3);
        assert_eq!(heap.allocated_count(), 4);
        assert_eq!(samplers.allocated_count(), 1);

        table.release(&mut heap, &mut samplers);
        assert_eq!(heap.allocated_count(), 0);
        assert_eq!(samplers.allocated_count(), 0);
    }

    #[test]
    fn out_of_order_set_is_rejected() {
        let (mut heap, mut samplers) = heaps();
        let mut table = ResourceTable::new(ResourceTableHandle(1));
        table
            .set_textures(
                &mut heap,
                &mut samplers,
                &[TextureHandle(3)],
                &[SamplerHandle(4)],
            )
            .unwrap();
        assert!(matches!(
            table.set_constant_buffers(&mut heap, &[BufferHandle(1)]),
            Err(RenderError::InvalidBindingOrder(_))
        ));
    }

    #[test]
    fn resetting_same_count_keeps_slots() {
        let (mut heap, _) = heaps();
        let mut table = ResourceTable::new(ResourceTableHandle(1));
        table.set_constant_buffers(&mut heap, &[BufferHandle(1)]).unwrap();
        let before = table.desc().constant_buffer_range;
        table.set_constant_buffers(&mut heap, &[BufferHandle(9)]).unwrap();
        assert_eq!(table.desc().constant_buffer_range, before);
        assert_eq!(heap.allocated_count(), 1);
    }

    #[test]
    fn exhausted_sampler_heap_gives_texture_slots_back() {
        let mut heap = DescriptorHeap::new("resources", 32);
        let mut samplers = DescriptorHeap::new("samplers", 1);
        let mut table = ResourceTable::new(ResourceTableHandle(1));
        let result = table.set_textures(
            &mut heap,
            &mut samplers,
            &[TextureHandle(3), TextureHandle(4)],
            &[SamplerHandle(5), SamplerHandle(6)],
        );
        assert!(matches!(
            result,
            Err(RenderError::DescriptorHeapExhausted { .. })
        ));
        assert_eq!(heap.allocated_count(), 0);
        assert_eq!(table.desc().texture_range, None);
        assert!(table.desc().textures.is_empty());

        // a smaller set still fits afterwards
        table
            .set_textures(&mut heap, &mut samplers, &[TextureHandle(3)], &[SamplerHandle(5)])
            .unwrap();
        assert_eq!(heap.allocated_count(), 1);
        assert_eq!(samplers.allocated_count(), 1);
    }

    #[test]
    fn update_textures_keeps_count() {
        let (mut heap, mut samplers) = heaps();
        let mut table = ResourceTable::new(ResourceTableHandle(1));
        table
            .set_textures(
                &mut heap,
                &mut samplers,
                &[TextureHandle(3)],
                &[SamplerHandle(4)],
            )
            .unwrap();
        table.update_textures(&[TextureHandle(7)]).unwrap();
        assert_eq!(table.desc().textures, vec![TextureHandle(7)]);
        assert!(table.update_textures(&[]).is_err());
    }
}
