//! The global heap: selector-addressed blocks backed by linear memory.
//!
//! Every live block owns one arena slot, indexed by the LDT index of its first
//! selector. Moveable blocks are known by `selector - 1`, fixed ones by the
//! selector itself, so `handle | 7` always recovers the selector.

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::{
    config::MemoryConfig,
    errors::{KernelError, Result},
    ldt::{selector_to_index, tile_count, SegmentAccess, SelectorTable, LDT_SIZE},
    memory::{LinearMemory, Memory, Region},
    utils::{make_segptr, offset_of, selector_of, SegPtr},
};

/// Largest block the global heap hands out (16MB - 64KB).
pub const MAX_SIZE: u32 = 0x00ff_0000;

bitflags! {
    /// `GMEM_*` allocation flags.
    pub struct GlobalFlags: u16 {
        const FIXED = 0x0000;
        const MOVEABLE = 0x0002;
        const NOCOMPACT = 0x0010;
        const NODISCARD = 0x0020;
        const ZEROINIT = 0x0040;
        const MODIFY = 0x0080;
        const DISCARDABLE = 0x0100;
        const NOT_BANKED = 0x1000;
        const DDESHARE = 0x2000;
        const NOTIFY = 0x4000;
    }
}

/// Bits reported by `GlobalHeap::flags`, above the lock count.
pub const GMEM_DISCARDABLE: u16 = 0x0100;
pub const GMEM_DISCARDED: u16 = 0x4000;

bitflags! {
    pub struct ArenaFlags: u8 {
        const MOVEABLE = 0x02;
        const DGROUP = 0x04;
        const DISCARDABLE = 0x08;
        const IPCSHARE = 0x10;
        const DOSMEM = 0x20;
    }
}

#[derive(Copy, Clone, Debug)]
pub struct GlobalArena {
    /// Linear base; 0 once discarded.
    pub base: u32,
    pub size: u32,
    pub handle: u16,
    pub owner: u16,
    pub lock_count: u8,
    pub page_lock_count: u8,
    pub flags: ArenaFlags,
    pub sel_count: u16,
}

/// One row of a heap walk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GlobalEntry {
    pub handle: u16,
    pub base: u32,
    pub size: u32,
    pub owner: u16,
    pub lock_count: u8,
    pub discarded: bool,
}

pub fn handle_to_sel(handle: u16) -> u16 {
    if handle == 0 {
        return 0;
    }
    if handle & 7 == 0 {
        warn!("invalid selector conversion of {:#06x}", handle);
        return handle - 1;
    }
    handle | 7
}

fn round_size(size: u32) -> u32 {
    if size < 0x10_0000 {
        (size + 0x1f) & !0x1f
    } else {
        (size + 0xfff) & !0xfff
    }
}

pub struct GlobalHeap {
    ldt: SelectorTable,
    linear: LinearMemory,
    arenas: Vec<Option<GlobalArena>>,
}

impl GlobalHeap {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            ldt: SelectorTable::new(config.first_selector_index),
            linear: LinearMemory::new(
                Region::new(config.linear_base, config.linear_size),
                Region::new(config.dos_base, config.dos_size),
            ),
            arenas: vec![None; LDT_SIZE],
        }
    }

    pub fn ldt(&self) -> &SelectorTable {
        &self.ldt
    }

    pub fn ldt_mut(&mut self) -> &mut SelectorTable {
        &mut self.ldt
    }

    pub fn linear(&self) -> &LinearMemory {
        &self.linear
    }

    fn arena_index(&self, handle: u16) -> Option<usize> {
        if handle == 0 {
            return None;
        }
        let idx = selector_to_index(handle_to_sel(handle));
        match self.arenas.get(idx) {
            Some(Some(_)) => Some(idx),
            _ => None,
        }
    }

    pub fn arena(&self, handle: u16) -> Option<&GlobalArena> {
        self.arena_index(handle)
            .and_then(|idx| self.arenas[idx].as_ref())
    }

    fn arena_mut(&mut self, handle: u16) -> Option<&mut GlobalArena> {
        let idx = self.arena_index(handle)?;
        self.arenas[idx].as_mut()
    }

    pub fn is_valid(&self, handle: u16) -> bool {
        self.arena_index(handle).is_some()
    }

    fn create_block(
        &mut self,
        flags: GlobalFlags,
        base: u32,
        size: u32,
        owner: u16,
        access: SegmentAccess,
    ) -> Result<u16> {
        let sel = self.ldt.alloc_block(base, size, access)?;
        let mut arena_flags = ArenaFlags::empty();
        if flags.contains(GlobalFlags::MOVEABLE) {
            arena_flags |= ArenaFlags::MOVEABLE;
        }
        if flags.contains(GlobalFlags::DISCARDABLE) {
            arena_flags |= ArenaFlags::DISCARDABLE;
        }
        if flags.contains(GlobalFlags::DDESHARE) {
            arena_flags |= ArenaFlags::IPCSHARE;
        }
        if !access.is_code() {
            arena_flags |= ArenaFlags::DGROUP;
        }
        let handle = if arena_flags.contains(ArenaFlags::MOVEABLE) {
            sel - 1
        } else {
            sel
        };
        self.arenas[selector_to_index(sel)] = Some(GlobalArena {
            base,
            size: if base == 0 { 0 } else { size },
            handle,
            owner,
            lock_count: 0,
            page_lock_count: 0,
            flags: arena_flags,
            sel_count: tile_count(size).max(1),
        });
        trace!(
            "global block {:#06x} ({:#x} bytes at {:#010x}) owner {:#06x}",
            handle,
            size,
            base,
            owner
        );
        Ok(handle)
    }

    /// Allocate a data block; returns 0 on failure.
    pub fn alloc(&mut self, flags: GlobalFlags, size: u32, owner: u16) -> u16 {
        self.alloc_segment(flags, size, owner, SegmentAccess::DATA)
    }

    /// Allocate a block with explicit descriptor access bits.
    pub fn alloc_segment(
        &mut self,
        flags: GlobalFlags,
        size: u32,
        owner: u16,
        access: SegmentAccess,
    ) -> u16 {
        match self.try_alloc(flags, size, owner, access) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("global alloc of {:#x} bytes failed: {}", size, e);
                0
            }
        }
    }

    fn try_alloc(
        &mut self,
        flags: GlobalFlags,
        size: u32,
        owner: u16,
        access: SegmentAccess,
    ) -> Result<u16> {
        // a zero sized request yields a block that starts out discarded
        if size == 0 {
            return self.create_block(flags, 0, 1, owner, access);
        }
        if size >= MAX_SIZE {
            return Err(KernelError::OutOfMemory(size));
        }
        let size = round_size(size);
        let base = self.linear.alloc(size, format!("global {:04x}", owner))?;
        self.create_block(flags, base, size, owner, access)
            .map_err(|e| {
                self.linear.free(base);
                e
            })
    }

    pub fn realloc(&mut self, handle: u16, size: u32, flags: GlobalFlags) -> u16 {
        if handle == 0 {
            return 0;
        }
        let idx = match self.arena_index(handle) {
            Some(idx) => idx,
            None => {
                warn!("invalid handle {:#06x} passed to global realloc", handle);
                return 0;
            }
        };
        let sel = handle_to_sel(handle);
        let mut arena = match self.arenas[idx] {
            Some(arena) => arena,
            None => return 0,
        };
        debug!("global realloc {:#06x} {:#x} flags={:?}", handle, size, flags);

        if size == 0 && flags.contains(GlobalFlags::MOVEABLE) && !flags.contains(GlobalFlags::MODIFY)
        {
            if !arena.flags.contains(ArenaFlags::MOVEABLE)
                || !arena.flags.contains(ArenaFlags::DISCARDABLE)
                || arena.lock_count > 0
                || arena.page_lock_count > 0
            {
                return 0;
            }
            if arena.base != 0 {
                self.linear.free(arena.base);
            }
            // shrinking never changes the selector
            if self.ldt.realloc_block(sel, 0, 1).is_err() {
                return 0;
            }
            arena.base = 0;
            arena.size = 0;
            arena.sel_count = 1;
            self.arenas[idx] = Some(arena);
            return handle;
        }

        if size > MAX_SIZE - 0x20 {
            return 0;
        }
        let size = if size == 0 { 0x20 } else { round_size(size) };

        if flags.contains(GlobalFlags::MODIFY) {
            arena.flags &= ArenaFlags::DGROUP;
            if flags.contains(GlobalFlags::MOVEABLE) {
                arena.flags |= ArenaFlags::MOVEABLE;
            }
            if flags.contains(GlobalFlags::DISCARDABLE) {
                arena.flags |= ArenaFlags::DISCARDABLE;
            }
            self.arenas[idx] = Some(arena);
            return handle;
        }

        if arena.base != 0 && size == arena.size {
            return handle;
        }

        let locked = arena.lock_count > 0 || arena.page_lock_count > 0;
        let new_base = if arena.base != 0 {
            self.linear.realloc(arena.base, size, !locked)
        } else if arena.flags.contains(ArenaFlags::DOSMEM) {
            self.linear.alloc_dos(size, format!("dos {:04x}", arena.owner))
        } else {
            self.linear.alloc(size, format!("global {:04x}", arena.owner))
        };
        let new_base = match new_base {
            Ok(base) => base,
            Err(e) => {
                warn!("global realloc of {:#06x} failed (locked: {}): {}", handle, locked, e);
                return 0;
            }
        };

        let new_sel = match self.ldt.realloc_block(sel, new_base, size) {
            Ok(sel) => sel,
            Err(e) => {
                warn!("global realloc of {:#06x} failed: {}", handle, e);
                if arena.base == 0 {
                    self.linear.free(new_base);
                } else if let Some(access) = self.ldt.access(sel) {
                    // the old selectors keep addressing the old extent
                    self.ldt.set_entries(sel, new_base, arena.size.min(size), access);
                    arena.base = new_base;
                    self.arenas[idx] = Some(arena);
                }
                return 0;
            }
        };

        arena.base = new_base;
        arena.size = size;
        arena.sel_count = tile_count(size).max(1);
        arena.handle = if arena.flags.contains(ArenaFlags::MOVEABLE) {
            new_sel - 1
        } else {
            new_sel
        };
        self.arenas[idx] = None;
        self.arenas[selector_to_index(new_sel)] = Some(arena);
        arena.handle
    }

    /// Returns 0 on success, the handle itself on failure.
    pub fn free(&mut self, handle: u16) -> u16 {
        if handle == 0 {
            return 0;
        }
        let idx = match self.arena_index(handle) {
            Some(idx) => idx,
            None => {
                warn!("invalid handle {:#06x} passed to global free", handle);
                return handle;
            }
        };
        if let Some(arena) = self.arenas[idx].take() {
            if arena.base != 0 {
                self.linear.free(arena.base);
            }
            trace!("global free {:#06x}", handle);
        }
        self.ldt.free_block(handle_to_sel(handle));
        0
    }

    /// Far pointer to the start of the block, or 0 if invalid or discarded.
    pub fn lock(&mut self, handle: u16) -> SegPtr {
        if handle == 0 {
            return 0;
        }
        let sel = handle_to_sel(handle);
        match self.arena_mut(handle) {
            Some(arena) if arena.base != 0 => {
                arena.lock_count = arena.lock_count.saturating_add(1);
                make_segptr(sel, 0)
            }
            Some(_) => 0,
            None => {
                warn!("invalid handle {:#06x} passed to global lock", handle);
                0
            }
        }
    }

    /// Returns the remaining lock count.
    pub fn unlock(&mut self, handle: u16) -> u16 {
        match self.arena_mut(handle) {
            Some(arena) => {
                arena.lock_count = arena.lock_count.saturating_sub(1);
                arena.lock_count as u16
            }
            None => {
                warn!("invalid handle {:#06x} passed to global unlock", handle);
                0
            }
        }
    }

    pub fn size(&self, handle: u16) -> u32 {
        match self.arena(handle) {
            Some(arena) if arena.base != 0 => arena.size,
            _ => 0,
        }
    }

    pub fn flags(&self, handle: u16) -> u16 {
        match self.arena(handle) {
            Some(arena) => {
                let mut flags = arena.lock_count as u16;
                if arena.flags.contains(ArenaFlags::DISCARDABLE) {
                    flags |= GMEM_DISCARDABLE;
                }
                if arena.base == 0 {
                    flags |= GMEM_DISCARDED;
                }
                flags
            }
            None => {
                warn!("invalid handle {:#06x} passed to global flags", handle);
                0
            }
        }
    }

    /// The handle of the block a selector belongs to.
    pub fn handle(&self, sel: u16) -> u16 {
        self.arena(sel).map(|a| a.handle).unwrap_or(0)
    }

    pub fn owner(&self, handle: u16) -> u16 {
        self.arena(handle).map(|a| a.owner).unwrap_or(0)
    }

    pub fn set_owner(&mut self, handle: u16, owner: u16) {
        if let Some(arena) = self.arena_mut(handle) {
            arena.owner = owner;
        }
    }

    /// Release every block belonging to `owner`.
    pub fn free_all(&mut self, owner: u16) {
        let handles: Vec<u16> = self
            .arenas
            .iter()
            .flatten()
            .filter(|a| a.owner == owner)
            .map(|a| a.handle)
            .collect();
        debug!("freeing {} blocks owned by {:#06x}", handles.len(), owner);
        for handle in handles {
            self.free(handle);
        }
    }

    /// Largest block that could currently be allocated.
    pub fn compact(&self, _desired: u32) -> u32 {
        self.linear.largest_free().min(MAX_SIZE)
    }

    pub fn page_lock(&mut self, handle: u16) -> u16 {
        match self.arena_mut(handle) {
            Some(arena) => {
                arena.page_lock_count = arena.page_lock_count.saturating_add(1);
                arena.page_lock_count as u16
            }
            None => {
                warn!("invalid handle {:#06x} passed to global page lock", handle);
                0
            }
        }
    }

    pub fn page_unlock(&mut self, handle: u16) -> u16 {
        match self.arena_mut(handle) {
            Some(arena) => {
                arena.page_lock_count = arena.page_lock_count.saturating_sub(1);
                arena.page_lock_count as u16
            }
            None => {
                warn!("invalid handle {:#06x} passed to global page unlock", handle);
                0
            }
        }
    }

    /// Conventional memory block: selector in the low word, real mode paragraph in
    /// the high word. 0 on failure.
    pub fn dos_alloc(&mut self, size: u32, owner: u16) -> u32 {
        if size == 0 || size > 0x10000 {
            return 0;
        }
        let size = round_size(size);
        let base = match self.linear.alloc_dos(size, format!("dos {:04x}", owner)) {
            Ok(base) => base,
            Err(e) => {
                warn!("dos alloc of {:#x} bytes failed: {}", size, e);
                return 0;
            }
        };
        let handle = match self.create_block(GlobalFlags::FIXED, base, size, owner, SegmentAccess::DATA)
        {
            Ok(handle) => handle,
            Err(_) => {
                self.linear.free(base);
                return 0;
            }
        };
        if let Some(arena) = self.arena_mut(handle) {
            arena.flags |= ArenaFlags::DOSMEM;
        }
        ((base >> 4) << 16) | handle as u32
    }

    /// Returns 0 on success, the selector on failure.
    pub fn dos_free(&mut self, sel: u16) -> u16 {
        match self.arena(sel) {
            Some(arena) if arena.flags.contains(ArenaFlags::DOSMEM) => self.free(sel),
            _ => sel,
        }
    }

    pub fn entries(&self) -> Vec<GlobalEntry> {
        self.arenas
            .iter()
            .flatten()
            .map(|a| GlobalEntry {
                handle: a.handle,
                base: a.base,
                size: a.size,
                owner: a.owner,
                lock_count: a.lock_count,
                discarded: a.base == 0,
            })
            .collect()
    }

    /// Linear address of a far pointer, checked against the segment limit.
    pub fn map_sl(&self, ptr: SegPtr) -> Result<u32> {
        self.ldt
            .resolve(selector_of(ptr), offset_of(ptr) as u32, 1)
    }

    /// The bytes addressable through `sel`, from offset 0 up to its limit.
    pub fn segment(&self, sel: u16) -> Result<&[u8]> {
        let e = self.ldt.entry(sel).ok_or(KernelError::InvalidSelector(sel))?;
        if e.base == 0 {
            return Err(KernelError::InvalidSelector(sel));
        }
        self.linear.slice(e.base, e.limit as usize + 1)
    }

    pub fn segment_mut(&mut self, sel: u16) -> Result<&mut [u8]> {
        let e = *self.ldt.entry(sel).ok_or(KernelError::InvalidSelector(sel))?;
        if e.base == 0 {
            return Err(KernelError::InvalidSelector(sel));
        }
        self.linear.slice_mut(e.base, e.limit as usize + 1)
    }

    pub fn read(&self, ptr: SegPtr, len: usize) -> Result<Vec<u8>> {
        let lin = self
            .ldt
            .resolve(selector_of(ptr), offset_of(ptr) as u32, len as u32)?;
        self.linear.read(lin, len)
    }

    pub fn write(&mut self, ptr: SegPtr, bytes: impl AsRef<[u8]>) -> Result<()> {
        let bytes = bytes.as_ref();
        let lin = self
            .ldt
            .resolve(selector_of(ptr), offset_of(ptr) as u32, bytes.len() as u32)?;
        self.linear.write(lin, bytes)
    }

    pub fn read_word(&self, ptr: SegPtr) -> Result<u16> {
        let lin = self.ldt.resolve(selector_of(ptr), offset_of(ptr) as u32, 2)?;
        Ok(self.linear.read_ptr(lin, Some(2))? as u16)
    }

    pub fn write_word(&mut self, ptr: SegPtr, value: u16) -> Result<()> {
        let lin = self.ldt.resolve(selector_of(ptr), offset_of(ptr) as u32, 2)?;
        self.linear.write_ptr(lin, value as u64, Some(2))
    }

    /// Resize the block behind `sel`, moving its linear memory if needed.
    pub fn grow_to(&mut self, sel: u16, size: u32) -> bool {
        let handle = self.handle(sel);
        if handle == 0 {
            return false;
        }
        self.realloc(handle, size, GlobalFlags::FIXED) != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MemoryConfig;

    fn heap() -> GlobalHeap {
        GlobalHeap::new(&MemoryConfig::default())
    }

    #[test]
    fn test_handle_parity() {
        let mut heap = heap();
        let fixed = heap.alloc(GlobalFlags::FIXED, 0x100, 1);
        let moveable = heap.alloc(GlobalFlags::MOVEABLE, 0x100, 1);
        assert_eq!(fixed & 1, 1);
        assert_eq!(moveable & 1, 0);
        assert_eq!(handle_to_sel(moveable), moveable + 1);
        assert_eq!(heap.handle(handle_to_sel(moveable)), moveable);
        assert!(heap.size(fixed) >= 0x100);
    }

    #[test]
    fn test_free_invalidates() {
        let mut heap = heap();
        let h = heap.alloc(GlobalFlags::MOVEABLE | GlobalFlags::ZEROINIT, 0x40, 1);
        assert_eq!(heap.free(h), 0);
        assert_eq!(heap.free(h), h);
        assert_eq!(heap.lock(h), 0);
        assert_eq!(heap.size(h), 0);
        assert_eq!(heap.realloc(h, 0x80, GlobalFlags::MOVEABLE), 0);
    }

    #[test]
    fn test_discard_and_revive() {
        let mut heap = heap();
        let h = heap.alloc(GlobalFlags::MOVEABLE | GlobalFlags::DISCARDABLE, 0x40, 1);
        assert_eq!(heap.lock(h), make_segptr(h | 7, 0));
        // locked blocks cannot be discarded
        assert_eq!(heap.realloc(h, 0, GlobalFlags::MOVEABLE), 0);
        assert_eq!(heap.unlock(h), 0);
        assert_eq!(heap.realloc(h, 0, GlobalFlags::MOVEABLE), h);
        assert_ne!(heap.flags(h) & GMEM_DISCARDED, 0);
        assert_eq!(heap.lock(h), 0);
        let revived = heap.realloc(h, 0x40, GlobalFlags::MOVEABLE);
        assert_eq!(revived, h);
        assert_eq!(heap.flags(h) & GMEM_DISCARDED, 0);
        assert_eq!(heap.size(h), 0x40);
    }

    #[test]
    fn test_invalid_handles() {
        let mut heap = heap();
        assert_eq!(heap.unlock(0x1234), 0);
        assert_eq!(heap.flags(0x1234), 0);
        assert_eq!(heap.page_lock(0x1234), 0);
        assert_eq!(heap.page_unlock(0x1234), 0);
        assert_eq!(heap.lock(0x1234), 0);
        assert_eq!(heap.free(0x1234), 0x1234);
    }

    #[test]
    fn test_grow_without_selectors_keeps_block() {
        let mut heap = heap();
        let h = heap.alloc(GlobalFlags::MOVEABLE, 0x100, 1);
        let sel = handle_to_sel(h);
        heap.write(make_segptr(sel, 0x10), [0x5a]).unwrap();
        while heap.ldt_mut().alloc_block(0, 1, SegmentAccess::DATA).is_ok() {}

        assert_eq!(heap.realloc(h, 0x20000, GlobalFlags::MOVEABLE), 0);
        assert!(heap.is_valid(h));
        assert_eq!(heap.size(h), 0x100);
        assert_eq!(heap.lock(h), make_segptr(sel, 0));
        assert_eq!(heap.read(make_segptr(sel, 0x10), 1).unwrap(), vec![0x5a]);
        assert_eq!(heap.unlock(h), 0);
    }

    #[test]
    fn test_zero_size_is_discarded() {
        let mut heap = heap();
        let h = heap.alloc(GlobalFlags::MOVEABLE, 0, 1);
        assert_ne!(h, 0);
        assert_ne!(heap.flags(h) & GMEM_DISCARDED, 0);
        assert!(heap.alloc(GlobalFlags::FIXED, MAX_SIZE, 1) == 0);
    }

    #[test]
    fn test_large_block_tiles() {
        let mut heap = heap();
        let h = heap.alloc(GlobalFlags::FIXED, 0x28000, 1);
        let sel = handle_to_sel(h);
        heap.write(make_segptr(sel + 8, 0x10), [0xaa]).unwrap();
        assert_eq!(heap.segment(sel).unwrap()[0x10010], 0xaa);
        assert_eq!(heap.arena(h).unwrap().sel_count, 3);
    }

    #[test]
    fn test_free_all_by_owner() {
        let mut heap = heap();
        let a = heap.alloc(GlobalFlags::FIXED, 0x10, 7);
        let b = heap.alloc(GlobalFlags::FIXED, 0x10, 8);
        heap.free_all(7);
        assert!(!heap.is_valid(a));
        assert!(heap.is_valid(b));
        assert_eq!(heap.owner(b), 8);
    }

    #[test]
    fn test_dos_alloc() {
        let mut heap = heap();
        let r = heap.dos_alloc(0x100, 1);
        let sel = r as u16;
        let para = (r >> 16) as u16;
        assert_ne!(sel, 0);
        assert!((para as u32) << 4 < 0x10_0000);
        assert_eq!(heap.dos_free(sel), 0);
        let plain = heap.alloc(GlobalFlags::FIXED, 0x10, 1);
        assert_eq!(heap.dos_free(plain), plain);
    }
}
