//! Reference-counted physical frame pool.
//!
//! Frames live in a fixed table; free frames sit on a stack so allocation and
//! reclamation are O(1). A frame is reclaimed as soon as its last reference
//! is released.

use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalPage};
use kernel_vmem::{FrameAlloc, FrameFill};
use log::warn;

const FRAME_BYTES: usize = 1 << PAGE_SHIFT;

struct Frame {
    allocated: bool,
    refs: usize,
    data: Box<[u8; FRAME_BYTES]>,
}

pub struct FramePool {
    frames: Vec<Frame>,
    /// Free frame numbers; the lowest number is on top.
    free: Vec<u64>,
}

impl FramePool {
    /// A pool of `count` zeroed frames, numbered `0..count`.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let frames = (0..count)
            .map(|_| Frame {
                allocated: false,
                refs: 0,
                data: Box::new([0; FRAME_BYTES]),
            })
            .collect();
        let free = (0..count as u64).rev().collect();
        Self { frames, free }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.capacity() - self.free_count()
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage) -> bool {
        self.slot(frame).is_some_and(|f| f.allocated)
    }

    fn slot(&self, frame: PhysicalPage) -> Option<&Frame> {
        usize::try_from(frame.index())
            .ok()
            .and_then(|i| self.frames.get(i))
    }

    fn slot_mut(&mut self, frame: PhysicalPage) -> Option<&mut Frame> {
        usize::try_from(frame.index())
            .ok()
            .and_then(|i| self.frames.get_mut(i))
    }

    fn reclaim(&mut self, frame: PhysicalPage) {
        if let Some(slot) = self.slot_mut(frame) {
            slot.allocated = false;
            slot.refs = 0;
            self.free.push(frame.index());
        }
    }
}

impl FrameAlloc for FramePool {
    fn allocate(&mut self, fill: FrameFill) -> Option<PhysicalPage> {
        let index = self.free.pop()?;
        let frame = PhysicalPage::from_index(index);
        let slot = self.slot_mut(frame)?;
        slot.allocated = true;
        slot.refs = 0;
        if fill == FrameFill::Zeroed {
            slot.data.fill(0);
        }
        Some(frame)
    }

    fn retain(&mut self, frame: PhysicalPage) {
        match self.slot_mut(frame) {
            Some(slot) if slot.allocated => slot.refs += 1,
            _ => warn!("retain of unallocated frame {frame}"),
        }
    }

    fn release(&mut self, frame: PhysicalPage) {
        let Some(slot) = self.slot_mut(frame) else {
            warn!("release of unknown frame {frame}");
            return;
        };
        if !slot.allocated {
            warn!("release of free frame {frame}");
            return;
        }
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            self.reclaim(frame);
        }
    }

    fn ref_count(&self, frame: PhysicalPage) -> usize {
        self.slot(frame).map_or(0, |f| f.refs)
    }

    fn bytes(&self, frame: PhysicalPage) -> &[u8] {
        self.slot(frame).map_or(Default::default(), |f| &f.data[..])
    }

    fn bytes_mut(&mut self, frame: PhysicalPage) -> &mut [u8] {
        match self.slot_mut(frame) {
            Some(f) => &mut f.data[..],
            None => Default::default(),
        }
    }

    fn copy_frame(&mut self, src: PhysicalPage, dst: PhysicalPage) {
        let (Ok(s), Ok(d)) = (usize::try_from(src.index()), usize::try_from(dst.index())) else {
            return;
        };
        if s == d || s >= self.frames.len() || d >= self.frames.len() {
            return;
        }
        let data = self.frames[s].data.clone();
        self.frames[d].data = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_frame_first() {
        let mut pool = FramePool::new(4);
        assert_eq!(pool.allocate(FrameFill::Zeroed), Some(PhysicalPage::from_index(0)));
        assert_eq!(pool.allocate(FrameFill::Zeroed), Some(PhysicalPage::from_index(1)));
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    fn frames_span_one_page() {
        let mut pool = FramePool::new(1);
        let f = pool.allocate(FrameFill::Zeroed).unwrap();
        let page = usize::try_from(kernel_memory_addresses::PAGE_SIZE).unwrap();
        assert_eq!(pool.bytes(f).len(), page);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = FramePool::new(1);
        assert!(pool.allocate(FrameFill::Uninit).is_some());
        assert!(pool.allocate(FrameFill::Uninit).is_none());
    }

    #[test]
    fn frame_is_reclaimed_at_zero_references() {
        let mut pool = FramePool::new(2);
        let f = pool.allocate(FrameFill::Zeroed).unwrap();
        pool.retain(f);
        pool.retain(f);
        assert_eq!(pool.ref_count(f), 2);

        pool.release(f);
        assert!(pool.is_allocated(f));
        pool.release(f);
        assert!(!pool.is_allocated(f));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn releasing_an_unretained_frame_reclaims_it() {
        let mut pool = FramePool::new(1);
        let f = pool.allocate(FrameFill::Zeroed).unwrap();
        pool.release(f);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn zeroed_allocation_scrubs_previous_contents() {
        let mut pool = FramePool::new(1);
        let f = pool.allocate(FrameFill::Zeroed).unwrap();
        pool.bytes_mut(f)[10] = 0xAB;
        pool.release(f);

        let g = pool.allocate(FrameFill::Uninit).unwrap();
        assert_eq!(g, f);
        assert_eq!(pool.bytes(g)[10], 0xAB);
        pool.release(g);

        let h = pool.allocate(FrameFill::Zeroed).unwrap();
        assert_eq!(pool.bytes(h)[10], 0);
    }

    #[test]
    fn copy_frame_duplicates_contents() {
        let mut pool = FramePool::new(2);
        let a = pool.allocate(FrameFill::Zeroed).unwrap();
        let b = pool.allocate(FrameFill::Zeroed).unwrap();
        pool.bytes_mut(a)[0] = 0x77;
        pool.bytes_mut(a)[4095] = 0x57;
        pool.copy_frame(a, b);
        assert_eq!(pool.bytes(b)[0], 0x77);
        assert_eq!(pool.bytes(b)[4095], 0x57);
    }
}
