//! Already-parsed program images.
//!
//! Parsing an executable format is not this crate's business; the loader
//! hands over the entry point, the loadable segments and the raw bytes the
//! segments refer to.

use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::PageFlags;

/// One loadable segment: `file_len` bytes at `file_offset` in the image go to
/// `vaddr`, the rest of `mem_len` is zero-filled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageSegment {
    pub vaddr: VirtualAddress,
    pub mem_len: u64,
    pub file_offset: u64,
    pub file_len: u64,
    pub perm: PageFlags,
}

impl ImageSegment {
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        VirtualRange::new(self.vaddr, self.mem_len)
    }

    /// The segment's file bytes within `data`, if they are all there.
    #[must_use]
    pub fn file_bytes<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        let start = usize::try_from(self.file_offset).ok()?;
        let len = usize::try_from(self.file_len.min(self.mem_len)).ok()?;
        data.get(start..start.checked_add(len)?)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ProgramImage<'a> {
    pub entry: VirtualAddress,
    pub segments: &'a [ImageSegment],
    pub data: &'a [u8],
}

impl<'a> ProgramImage<'a> {
    #[must_use]
    pub const fn new(entry: VirtualAddress, segments: &'a [ImageSegment], data: &'a [u8]) -> Self {
        Self {
            entry,
            segments,
            data,
        }
    }

    /// An image without segments, e.g. for a kernel service entered at `entry`.
    #[must_use]
    pub const fn entry_only(entry: VirtualAddress) -> Self {
        Self::new(entry, &[], &[])
    }
}
