//! The local descriptor table: selector allocation and descriptor bookkeeping.
//!
//! A selector is `index << 3 | 7` (LDT, ring 3). Blocks larger than 64KB take
//! consecutive selectors ("tiles"), tile `i` based at `base + i * 64KB` with the limit
//! covering the remainder of the block.

use bitflags::bitflags;
use log::{debug, warn};

use crate::errors::{KernelError, Result};

pub const LDT_SIZE: usize = 8192;
/// Shift between consecutive tile selectors.
pub const AHSHIFT: u16 = 3;
pub const AHINCR: u16 = 1 << AHSHIFT;
const TILE: u32 = 0x10000;

bitflags! {
    pub struct SegmentAccess: u8 {
        const ACCESSED = 0x01;
        /// writable for data, readable for code
        const RW = 0x02;
        const EXPAND_DOWN = 0x04;
        const EXECUTABLE = 0x08;
        const SEGMENT = 0x10;
        const BIG = 0x40;
        const ALLOCATED = 0x80;

        const DATA = Self::SEGMENT.bits | Self::RW.bits | Self::ACCESSED.bits;
        const CODE = Self::DATA.bits | Self::EXECUTABLE.bits;
    }
}

impl SegmentAccess {
    pub fn is_code(&self) -> bool {
        self.contains(SegmentAccess::EXECUTABLE)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LdtEntry {
    pub base: u32,
    pub limit: u32,
    pub access: SegmentAccess,
}

impl LdtEntry {
    pub const EMPTY: LdtEntry = LdtEntry {
        base: 0,
        limit: 0,
        access: SegmentAccess::empty(),
    };

    pub fn is_allocated(&self) -> bool {
        self.access.contains(SegmentAccess::ALLOCATED)
    }
}

pub const fn index_to_selector(index: u16) -> u16 {
    (index << AHSHIFT) | 7
}

pub const fn selector_to_index(sel: u16) -> usize {
    (sel >> AHSHIFT) as usize
}

/// Number of tiles needed to cover `size` bytes.
pub fn tile_count(size: u32) -> u16 {
    ((size as u64 + 0xffff) / TILE as u64) as u16
}

pub struct SelectorTable {
    entries: Vec<LdtEntry>,
    first_free_hint: usize,
    first_index: usize,
}

impl SelectorTable {
    pub fn new(first_index: u16) -> Self {
        Self {
            entries: vec![LdtEntry::EMPTY; LDT_SIZE],
            first_free_hint: first_index as usize,
            first_index: first_index as usize,
        }
    }

    pub fn entry(&self, sel: u16) -> Option<&LdtEntry> {
        self.entries
            .get(selector_to_index(sel))
            .filter(|e| e.is_allocated())
    }

    pub fn is_allocated(&self, sel: u16) -> bool {
        self.entry(sel).is_some()
    }

    /// Reserve `count` consecutive free slots and return the first selector.
    fn alloc_entries(&mut self, count: u16) -> Option<u16> {
        let count = count.max(1) as usize;
        let mut start = self.first_free_hint.max(self.first_index);
        'search: while start + count <= LDT_SIZE {
            for i in start..start + count {
                if self.entries[i].is_allocated() {
                    start = i + 1;
                    continue 'search;
                }
            }
            for e in &mut self.entries[start..start + count] {
                *e = LdtEntry {
                    base: 0,
                    limit: 0,
                    access: SegmentAccess::ALLOCATED,
                };
            }
            if start == self.first_free_hint {
                self.first_free_hint = start + count;
            }
            return Some(index_to_selector(start as u16));
        }
        None
    }

    fn free_entries(&mut self, sel: u16, count: u16) {
        let first = selector_to_index(sel);
        for i in first..(first + count as usize).min(LDT_SIZE) {
            self.entries[i] = LdtEntry::EMPTY;
        }
        self.first_free_hint = self.first_free_hint.min(first.max(self.first_index));
    }

    /// Program the tiles of a block.
    pub fn set_entries(&mut self, sel: u16, base: u32, size: u32, access: SegmentAccess) {
        let first = selector_to_index(sel);
        let count = tile_count(size) as usize;
        let mut limit = size.wrapping_sub(1);
        for i in 0..count.max(1) {
            if let Some(e) = self.entries.get_mut(first + i) {
                *e = LdtEntry {
                    base: base + (i as u32) * TILE,
                    limit,
                    access: access | SegmentAccess::ALLOCATED,
                };
            }
            limit = limit.wrapping_sub(TILE);
        }
    }

    /// Allocate selectors for a block of `size` bytes based at `base`.
    pub fn alloc_block(&mut self, base: u32, size: u32, access: SegmentAccess) -> Result<u16> {
        let count = tile_count(size).max(1);
        let sel = self
            .alloc_entries(count)
            .ok_or(KernelError::OutOfSelectors(count))?;
        self.set_entries(sel, base, size.max(1), access);
        Ok(sel)
    }

    /// Free a block allocated with `alloc_block`; the tile count comes from the limit.
    pub fn free_block(&mut self, sel: u16) {
        if let Some(e) = self.entry(sel) {
            let count = (e.limit >> 16) as u16 + 1;
            self.free_entries(sel, count);
        }
    }

    /// Re-tile a block after its size or base changed. May return a different
    /// selector when the block needs more tiles than are free after it.
    pub fn realloc_block(&mut self, sel: u16, base: u32, size: u32) -> Result<u16> {
        let e = *self.entry(sel).ok_or(KernelError::InvalidSelector(sel))?;
        let old_count = (e.limit >> 16) as u16 + 1;
        let new_count = tile_count(size).max(1);
        let access = e.access;
        let mut sel = sel;
        if new_count > old_count {
            let first = selector_to_index(sel);
            let tail = first + old_count as usize..first + new_count as usize;
            let tail_free = tail.end <= LDT_SIZE
                && self.entries[tail.clone()].iter().all(|e| !e.is_allocated());
            if tail_free {
                for e in &mut self.entries[tail] {
                    e.access = SegmentAccess::ALLOCATED;
                }
            } else {
                let moved = self
                    .alloc_entries(new_count)
                    .ok_or(KernelError::OutOfSelectors(new_count))?;
                self.free_entries(sel, old_count);
                sel = moved;
            }
        } else if new_count < old_count {
            self.free_entries(sel + (new_count << AHSHIFT), old_count - new_count);
        }
        self.set_entries(sel, base, size.max(1), access);
        Ok(sel)
    }

    /// A fresh selector mirroring `template` (or an empty one for 0).
    pub fn alloc_selector(&mut self, template: u16) -> Result<u16> {
        if template == 0 {
            return self
                .alloc_entries(1)
                .ok_or(KernelError::OutOfSelectors(1));
        }
        let src = *self
            .entry(template)
            .ok_or(KernelError::InvalidSelector(template))?;
        let count = (src.limit >> 16) as u16 + 1;
        let sel = self
            .alloc_entries(count)
            .ok_or(KernelError::OutOfSelectors(count))?;
        let first = selector_to_index(template);
        let dst = selector_to_index(sel);
        for i in 0..count as usize {
            self.entries[dst + i] = self.entries[first + i];
        }
        Ok(sel)
    }

    pub fn free_selector(&mut self, sel: u16) -> bool {
        if !self.is_allocated(sel) {
            warn!("freeing unallocated selector {:#06x}", sel);
            return false;
        }
        self.free_entries(sel, 1);
        true
    }

    /// Copy `src` into `dst`, flipping code to data and back.
    pub fn presto_chango(&mut self, src: u16, dst: u16) -> Result<u16> {
        let mut e = *self.entry(src).ok_or(KernelError::InvalidSelector(src))?;
        if !self.is_allocated(dst) {
            return Err(KernelError::InvalidSelector(dst));
        }
        e.access.toggle(SegmentAccess::EXECUTABLE);
        self.entries[selector_to_index(dst)] = e;
        Ok(dst)
    }

    /// A one-tile alias of `sel` with the code bit flipped.
    pub fn alloc_cs_alias(&mut self, sel: u16) -> Result<u16> {
        let alias = self.alloc_selector(0)?;
        self.presto_chango(sel, alias)
    }

    pub fn base(&self, sel: u16) -> Option<u32> {
        self.entry(sel).map(|e| e.base)
    }

    pub fn limit(&self, sel: u16) -> Option<u32> {
        self.entry(sel).map(|e| e.limit)
    }

    pub fn access(&self, sel: u16) -> Option<SegmentAccess> {
        self.entry(sel).map(|e| e.access)
    }

    pub fn set_base(&mut self, sel: u16, base: u32) -> Result<()> {
        self.with_entry(sel, |e| e.base = base)
    }

    pub fn set_limit(&mut self, sel: u16, limit: u32) -> Result<()> {
        self.with_entry(sel, |e| e.limit = limit)
    }

    pub fn set_access(&mut self, sel: u16, access: SegmentAccess) -> Result<()> {
        self.with_entry(sel, |e| e.access = access | SegmentAccess::ALLOCATED)
    }

    fn with_entry(&mut self, sel: u16, f: impl FnOnce(&mut LdtEntry)) -> Result<()> {
        match self.entries.get_mut(selector_to_index(sel)) {
            Some(e) if e.is_allocated() => {
                f(e);
                debug!("ldt {:#06x} -> {:?}", sel, e);
                Ok(())
            }
            _ => Err(KernelError::InvalidSelector(sel)),
        }
    }

    /// Translate `sel:off` to a linear address, checking that `len` bytes fit
    /// under the limit.
    pub fn resolve(&self, sel: u16, off: u32, len: u32) -> Result<u32> {
        let e = self.entry(sel).ok_or(KernelError::InvalidSelector(sel))?;
        if e.base == 0 {
            // discarded
            return Err(KernelError::InvalidSelector(sel));
        }
        let last = off as u64 + len.max(1) as u64 - 1;
        if last > e.limit as u64 {
            return Err(KernelError::OutOfBounds(sel, off));
        }
        Ok(e.base + off)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_selector_encoding() {
        assert_eq!(index_to_selector(17), 0x8f);
        assert_eq!(selector_to_index(0x8f), 17);
        assert_eq!(tile_count(1), 1);
        assert_eq!(tile_count(0x10000), 1);
        assert_eq!(tile_count(0x10001), 2);
    }

    #[test]
    fn test_tiling() {
        let mut ldt = SelectorTable::new(17);
        let sel = ldt.alloc_block(0x100000, 0x18000, SegmentAccess::DATA).unwrap();
        assert_eq!(ldt.limit(sel), Some(0x17fff));
        assert_eq!(ldt.base(sel + AHINCR), Some(0x110000));
        assert_eq!(ldt.limit(sel + AHINCR), Some(0x7fff));
        assert_eq!(ldt.resolve(sel, 0x17fff, 1).unwrap(), 0x117fff);
        assert!(ldt.resolve(sel, 0x17fff, 2).is_err());

        ldt.free_block(sel);
        assert!(!ldt.is_allocated(sel));
        assert!(!ldt.is_allocated(sel + AHINCR));
    }

    #[test]
    fn test_realloc_relocates_when_tail_taken() {
        let mut ldt = SelectorTable::new(17);
        let a = ldt.alloc_block(0x100000, 0x100, SegmentAccess::DATA).unwrap();
        let b = ldt.alloc_block(0x200000, 0x100, SegmentAccess::DATA).unwrap();
        assert_eq!(b, a + AHINCR);
        let moved = ldt.realloc_block(a, 0x300000, 0x20000).unwrap();
        assert_ne!(moved, a);
        assert!(!ldt.is_allocated(a));
        assert_eq!(ldt.base(moved + AHINCR), Some(0x310000));
        // shrinking keeps the selector
        assert_eq!(ldt.realloc_block(moved, 0x300000, 0x10).unwrap(), moved);
        assert!(!ldt.is_allocated(moved + AHINCR));
    }

    #[test]
    fn test_failed_realloc_keeps_block() {
        let mut ldt = SelectorTable::new(17);
        let a = ldt.alloc_block(0x100000, 0x100, SegmentAccess::DATA).unwrap();
        while ldt.alloc_block(0x200000, 0x100, SegmentAccess::DATA).is_ok() {}
        assert!(matches!(
            ldt.realloc_block(a, 0x300000, 0x20000),
            Err(KernelError::OutOfSelectors(2))
        ));
        assert!(ldt.is_allocated(a));
        assert_eq!(ldt.base(a), Some(0x100000));
        assert_eq!(ldt.resolve(a, 0xff, 1).unwrap(), 0x1000ff);
    }

    #[test]
    fn test_presto_chango() {
        let mut ldt = SelectorTable::new(17);
        let data = ldt.alloc_block(0x100000, 0x100, SegmentAccess::DATA).unwrap();
        let alias = ldt.alloc_cs_alias(data).unwrap();
        assert!(ldt.access(alias).unwrap().is_code());
        assert!(!ldt.access(data).unwrap().is_code());
        assert_eq!(ldt.base(alias), ldt.base(data));
        assert!(ldt.free_selector(alias));
        assert!(!ldt.free_selector(alias));
    }
}
