use log::trace;
use std::collections::BTreeMap;

use crate::{
    errors::{KernelError, Result},
    utils::{align_up, Packer},
};

pub type PointerSizeT = u8;

/// Allocation granularity of the linear heap.
pub const LINEAR_GRANULARITY: u32 = 0x10;

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    label: String,
}

/// A contiguous range of linear address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub begin: u32,
    pub end: u32,
}

impl Region {
    pub fn new(begin: u32, size: u32) -> Self {
        Self {
            begin,
            end: begin.saturating_add(size),
        }
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.begin && addr < self.end
    }
}

/// Byte-addressed view over emulated memory.
pub trait Memory {
    fn read(&self, addr: u32, size: usize) -> Result<Vec<u8>>;
    fn write(&mut self, addr: u32, bytes: impl AsRef<[u8]>) -> Result<()>;

    fn read_ptr(&self, addr: u32, pointersize: Option<PointerSizeT>) -> Result<u64> {
        let pointersize = pointersize.unwrap_or(2);
        let data = self.read(addr, pointersize as usize)?;
        Ok(Packer::new(pointersize).unpack(data))
    }

    /// Write an integer value to a memory address, little endian.
    ///
    /// Args:
    ///  addr: target memory address
    ///  value: integer value to write
    ///  size: pointer size (in bytes): either 1, 2, 4, or none for the native word
    fn write_ptr(&mut self, addr: u32, value: u64, pointersize: Option<PointerSizeT>) -> Result<()> {
        let pointersize = pointersize.unwrap_or(2);
        self.write(addr, Packer::new(pointersize).pack(value))
    }
}

/// Flat linear memory split into two pools: conventional memory below 1MB and the
/// extended pool backing ordinary global allocations.
///
/// Blocks never overlap and never move by themselves; `realloc` either resizes in
/// place or hands back a new base.
#[derive(Debug)]
pub struct LinearMemory {
    heap: Region,
    dos: Region,
    blocks: BTreeMap<u32, Block>,
}

impl LinearMemory {
    pub fn new(heap: Region, dos: Region) -> Self {
        Self {
            heap,
            dos,
            blocks: BTreeMap::new(),
        }
    }

    pub fn alloc(&mut self, size: u32, label: impl Into<String>) -> Result<u32> {
        let region = self.heap;
        self.alloc_in(region, size, label.into())
    }

    pub fn alloc_dos(&mut self, size: u32, label: impl Into<String>) -> Result<u32> {
        let region = self.dos;
        self.alloc_in(region, size, label.into())
    }

    fn alloc_in(&mut self, region: Region, size: u32, label: String) -> Result<u32> {
        let base = self
            .find_gap(region, size)
            .ok_or(KernelError::OutOfMemory(size))?;
        trace!("linear alloc {:#x} bytes at {:#010x} [{}]", size, base, label);
        self.blocks.insert(
            base,
            Block {
                data: vec![0; size as usize],
                label,
            },
        );
        Ok(base)
    }

    /// First fit in `region`.
    fn find_gap(&self, region: Region, size: u32) -> Option<u32> {
        let size = align_up(size.max(1), LINEAR_GRANULARITY);
        let mut cursor = region.begin;
        for (&base, block) in self.blocks.range(region.begin..region.end) {
            if base.checked_sub(cursor)? >= size {
                return Some(cursor);
            }
            cursor = align_up(base + block.data.len().max(1) as u32, LINEAR_GRANULARITY);
        }
        match region.end.checked_sub(cursor) {
            Some(room) if room >= size => Some(cursor),
            _ => None,
        }
    }

    pub fn free(&mut self, base: u32) -> bool {
        self.blocks.remove(&base).is_some()
    }

    pub fn block_size(&self, base: u32) -> Option<u32> {
        self.blocks.get(&base).map(|b| b.data.len() as u32)
    }

    pub fn label(&self, base: u32) -> Option<&str> {
        self.blocks.get(&base).map(|b| b.label.as_str())
    }

    fn region_of(&self, base: u32) -> Region {
        if self.dos.contains(base) {
            self.dos
        } else {
            self.heap
        }
    }

    /// Room available for `base` to grow into without moving.
    fn room_after(&self, base: u32) -> u32 {
        let region = self.region_of(base);
        let next = self
            .blocks
            .range(base + 1..region.end)
            .next()
            .map(|(&b, _)| b)
            .unwrap_or(region.end);
        next - base
    }

    /// Resize the block at `base`. When it cannot grow in place and `may_move` is set
    /// the contents are copied to a new block and the new base returned.
    pub fn realloc(&mut self, base: u32, size: u32, may_move: bool) -> Result<u32> {
        let old = self.block_size(base).ok_or(KernelError::Unmapped(base))?;
        if size <= old || size <= self.room_after(base) {
            if let Some(block) = self.blocks.get_mut(&base) {
                block.data.resize(size as usize, 0);
            }
            return Ok(base);
        }
        if !may_move {
            return Err(KernelError::OutOfMemory(size));
        }
        let region = self.region_of(base);
        let new_base = self
            .find_gap(region, size)
            .ok_or(KernelError::OutOfMemory(size))?;
        let mut block = self.blocks.remove(&base).ok_or(KernelError::Unmapped(base))?;
        block.data.resize(size as usize, 0);
        trace!("linear move {:#010x} -> {:#010x} ({:#x} bytes)", base, new_base, size);
        self.blocks.insert(new_base, block);
        Ok(new_base)
    }

    /// Largest block the extended pool could still satisfy.
    pub fn largest_free(&self) -> u32 {
        let mut cursor = self.heap.begin;
        let mut best = 0;
        for (&base, block) in self.blocks.range(self.heap.begin..self.heap.end) {
            best = best.max(base.saturating_sub(cursor));
            cursor = align_up(base + block.data.len().max(1) as u32, LINEAR_GRANULARITY);
        }
        best.max(self.heap.end.saturating_sub(cursor))
    }

    fn locate(&self, addr: u32, len: usize) -> Result<(u32, usize)> {
        let (&base, block) = self
            .blocks
            .range(..=addr)
            .next_back()
            .ok_or(KernelError::Unmapped(addr))?;
        let start = (addr - base) as usize;
        if start + len > block.data.len() {
            return Err(KernelError::Unmapped(addr));
        }
        Ok((base, start))
    }

    pub fn slice(&self, addr: u32, len: usize) -> Result<&[u8]> {
        let (base, start) = self.locate(addr, len)?;
        let block = self.blocks.get(&base).ok_or(KernelError::Unmapped(addr))?;
        Ok(&block.data[start..start + len])
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8]> {
        let (base, start) = self.locate(addr, len)?;
        let block = self
            .blocks
            .get_mut(&base)
            .ok_or(KernelError::Unmapped(addr))?;
        Ok(&mut block.data[start..start + len])
    }
}

impl Memory for LinearMemory {
    fn read(&self, addr: u32, size: usize) -> Result<Vec<u8>> {
        Ok(self.slice(addr, size)?.to_vec())
    }

    fn write(&mut self, addr: u32, bytes: impl AsRef<[u8]>) -> Result<()> {
        let bytes = bytes.as_ref();
        self.slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{LinearMemory, Memory, Region};

    fn memory() -> LinearMemory {
        LinearMemory::new(Region::new(0x100000, 0x10000), Region::new(0x10000, 0x1000))
    }

    #[test]
    fn test_first_fit_reuses_holes() {
        let mut mem = memory();
        let a = mem.alloc(0x100, "a").unwrap();
        let b = mem.alloc(0x100, "b").unwrap();
        let c = mem.alloc(0x100, "c").unwrap();
        assert_eq!(a, 0x100000);
        assert!(b > a && c > b);
        assert!(mem.free(b));
        let d = mem.alloc(0x80, "d").unwrap();
        assert_eq!(d, b);
        assert!(mem.alloc(0x20000, "too big").is_err());
    }

    #[test]
    fn test_realloc_moves_when_blocked() {
        let mut mem = memory();
        let a = mem.alloc(0x20, "a").unwrap();
        let _b = mem.alloc(0x20, "b").unwrap();
        mem.write(a, [1u8, 2, 3]).unwrap();
        assert!(mem.realloc(a, 0x100, false).is_err());
        let moved = mem.realloc(a, 0x100, true).unwrap();
        assert_ne!(moved, a);
        assert_eq!(mem.read(moved, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(mem.block_size(moved), Some(0x100));
        assert!(mem.read(a, 1).is_err());
    }

    #[test]
    fn test_bounds_and_pointers() {
        let mut mem = memory();
        let a = mem.alloc(0x10, "a").unwrap();
        mem.write_ptr(a + 2, 0xbeef, None).unwrap();
        assert_eq!(mem.read_ptr(a + 2, Some(2)).unwrap(), 0xbeef);
        assert!(mem.read(a + 0xf, 2).is_err());
        let dos = mem.alloc_dos(0x100, "dos").unwrap();
        assert!(dos < 0x100000);
    }
}
