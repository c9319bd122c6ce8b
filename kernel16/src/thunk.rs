//! Instance thunks.
//!
//! A thunk loads an instance's data segment into `ax` and jumps to the real
//! function, whose patched prolog moves `ax` into `ds`:
//!
//! ```text
//! b8 <instance>        mov ax, instance
//! ea <offset> <sel>    jmp far func
//! ```
//!
//! Thunks live in arenas: the first one is embedded in the task database, further
//! ones are code segments chained through the arena header. Each header is
//! `next handle, magic "PT", unused, first free`; free thunks are chained through
//! their first word.

use bytes::{BufMut, BytesMut};
use log::{debug, trace, warn};

use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags, GlobalHeap},
    ldt::SegmentAccess,
    utils::{make_segptr, offset_of, selector_of, SegPtr},
};

pub const THUNK_SIZE: u16 = 8;
pub const THUNK_HEADER_SIZE: u16 = 8;
pub const THUNK_MAGIC: u16 = u16::from_le_bytes(*b"PT");

/// Where an arena lives: the selector its header is written through, the offset
/// of the header, and the selector code runs through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThunkArena {
    pub sel: u16,
    pub base: u16,
    pub code_sel: u16,
    /// End of the thunk slots.
    pub end: u16,
}

impl ThunkArena {
    fn next(&self, heap: &GlobalHeap) -> Result<u16> {
        heap.read_word(make_segptr(self.sel, self.base))
    }

    fn free(&self, heap: &GlobalHeap) -> Result<u16> {
        heap.read_word(make_segptr(self.sel, self.base + 6))
    }

    fn set_free(&self, heap: &mut GlobalHeap, off: u16) -> Result<()> {
        heap.write_word(make_segptr(self.sel, self.base + 6), off)
    }

    fn slots(&self) -> std::ops::Range<u16> {
        self.base + THUNK_HEADER_SIZE..self.end
    }

    /// An arena in a segment of its own.
    fn in_segment(heap: &GlobalHeap, handle: u16) -> Self {
        let sel = handle_to_sel(handle);
        Self {
            sel,
            base: 0,
            code_sel: sel,
            end: heap.size(handle).min(0xffff) as u16,
        }
    }
}

/// The bytes of a thunk.
pub fn thunk_code(instance: u16, func: SegPtr) -> [u8; THUNK_SIZE as usize] {
    let mut buf = BytesMut::with_capacity(THUNK_SIZE as usize);
    buf.put_u8(0xb8);
    buf.put_u16_le(instance);
    buf.put_u8(0xea);
    buf.put_u16_le(offset_of(func));
    buf.put_u16_le(selector_of(func));
    let mut out = [0u8; THUNK_SIZE as usize];
    out[..buf.len()].copy_from_slice(&buf);
    out
}

/// Instance and target of the thunk at `at`, if the bytes there are one.
pub fn decode_thunk(heap: &GlobalHeap, at: SegPtr) -> Option<(u16, SegPtr)> {
    let b = heap.read(at, 8).ok()?;
    if b[0] != 0xb8 || b[3] != 0xea {
        return None;
    }
    let instance = u16::from_le_bytes([b[1], b[2]]);
    let func = make_segptr(u16::from_le_bytes([b[6], b[7]]), u16::from_le_bytes([b[4], b[5]]));
    Some((instance, func))
}

/// Write an empty arena header and chain every slot onto the free list.
pub fn init_arena(heap: &mut GlobalHeap, arena: &ThunkArena) -> Result<()> {
    let header = make_segptr(arena.sel, arena.base);
    let mut buf = BytesMut::with_capacity(THUNK_HEADER_SIZE as usize);
    buf.put_u16_le(0);
    buf.put_u16_le(THUNK_MAGIC);
    buf.put_u16_le(0);
    let first = arena.base + THUNK_HEADER_SIZE;
    buf.put_u16_le(if first + THUNK_SIZE <= arena.end { first } else { 0 });
    heap.write(header, &buf)?;

    let mut off = first;
    while off + THUNK_SIZE <= arena.end {
        let next = off + THUNK_SIZE;
        let link = if next + THUNK_SIZE <= arena.end { next } else { 0 };
        heap.write_word(make_segptr(arena.sel, off), link)?;
        off = next;
    }
    Ok(())
}

/// Every arena reachable from `first`.
pub fn arenas(heap: &GlobalHeap, first: ThunkArena) -> Vec<ThunkArena> {
    let mut out = vec![first];
    let mut cur = first;
    while let Ok(next) = cur.next(heap) {
        if next == 0 || out.len() > 0x100 {
            break;
        }
        cur = ThunkArena::in_segment(heap, next);
        out.push(cur);
    }
    out
}

/// Take a free slot, chaining in a new arena of `count` thunks owned by `owner`
/// when all are used. Returns the slot's code address.
pub fn alloc_thunk(heap: &mut GlobalHeap, first: ThunkArena, owner: u16, count: u16) -> Result<SegPtr> {
    let chain = arenas(heap, first);
    for arena in &chain {
        let free = arena.free(heap)?;
        if free == 0 {
            continue;
        }
        let next = heap.read_word(make_segptr(arena.sel, free))?;
        arena.set_free(heap, next)?;
        trace!("thunk {:04x}:{:04x}", arena.code_sel, free);
        return Ok(make_segptr(arena.code_sel, free));
    }

    let size = THUNK_HEADER_SIZE as u32 + THUNK_SIZE as u32 * count.max(1) as u32;
    let handle = heap.alloc_segment(
        GlobalFlags::FIXED | GlobalFlags::ZEROINIT,
        size,
        owner,
        SegmentAccess::CODE,
    );
    if handle == 0 {
        return Err(KernelError::OutOfMemory(size));
    }
    let arena = ThunkArena::in_segment(heap, handle);
    init_arena(heap, &arena)?;
    let last = chain[chain.len() - 1];
    heap.write_word(make_segptr(last.sel, last.base), handle)?;
    debug!("new thunk segment {:#06x} for {} thunks", handle, count);
    alloc_thunk(heap, first, owner, count)
}

/// Fill the slot at `thunk` with a thunk loading `instance` and jumping to
/// `func`. The bytes go through the arena's data selector.
pub fn write_thunk(
    heap: &mut GlobalHeap,
    first: ThunkArena,
    thunk: SegPtr,
    instance: u16,
    func: SegPtr,
) -> Result<()> {
    let (sel, off) = (selector_of(thunk), offset_of(thunk));
    let arena = arenas(heap, first)
        .into_iter()
        .find(|a| a.code_sel == sel && a.slots().contains(&off))
        .ok_or(KernelError::InvalidSelector(sel))?;
    heap.write(make_segptr(arena.sel, off), thunk_code(instance, func))
}

/// Return a thunk to its arena. False if `thunk` is not a slot of any arena.
pub fn free_thunk(heap: &mut GlobalHeap, first: ThunkArena, thunk: SegPtr) -> Result<bool> {
    let (sel, off) = (selector_of(thunk), offset_of(thunk));
    let arena = match arenas(heap, first).into_iter().find(|a| {
        a.code_sel == sel && a.slots().contains(&off) && (off - a.slots().start) % THUNK_SIZE == 0
    }) {
        Some(a) => a,
        None => {
            warn!("{:04x}:{:04x} is not a thunk", sel, off);
            return Ok(false);
        }
    };
    let free = arena.free(heap)?;
    heap.write(make_segptr(arena.sel, off), [0u8; THUNK_SIZE as usize])?;
    heap.write_word(make_segptr(arena.sel, off), free)?;
    arena.set_free(heap, off)?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MemoryConfig;

    fn embedded(heap: &mut GlobalHeap) -> ThunkArena {
        // two slots inside a bigger block, as in a task database
        let h = heap.alloc(GlobalFlags::FIXED | GlobalFlags::ZEROINIT, 0x40, 1);
        let sel = handle_to_sel(h);
        let alias = heap.ldt_mut().alloc_cs_alias(sel).unwrap();
        let arena = ThunkArena {
            sel,
            base: 0x10,
            code_sel: alias,
            end: 0x10 + THUNK_HEADER_SIZE + 2 * THUNK_SIZE,
        };
        init_arena(heap, &arena).unwrap();
        arena
    }

    #[test]
    fn test_code_bytes() {
        assert_eq!(
            thunk_code(0x1237, 0x00ef_0010),
            [0xb8, 0x37, 0x12, 0xea, 0x10, 0x00, 0xef, 0x00]
        );
    }

    #[test]
    fn test_alloc_grows_and_reuses() {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let first = embedded(&mut heap);
        let a = alloc_thunk(&mut heap, first, 1, 4).unwrap();
        let b = alloc_thunk(&mut heap, first, 1, 4).unwrap();
        assert_eq!(selector_of(a), first.code_sel);
        assert_eq!(offset_of(b), offset_of(a) + THUNK_SIZE);

        // the third goes to a new segment
        let c = alloc_thunk(&mut heap, first, 1, 4).unwrap();
        assert_ne!(selector_of(c), first.code_sel);
        assert_eq!(offset_of(c), THUNK_HEADER_SIZE);
        assert_eq!(arenas(&heap, first).len(), 2);
        assert!(heap.ldt().access(selector_of(c)).unwrap().is_code());

        write_thunk(&mut heap, first, a, 0x55, 0x0123_0004).unwrap();
        assert_eq!(decode_thunk(&heap, a), Some((0x55, 0x0123_0004)));

        assert!(free_thunk(&mut heap, first, a).unwrap());
        assert_eq!(decode_thunk(&heap, a), None);
        assert_eq!(alloc_thunk(&mut heap, first, 1, 4).unwrap(), a);
        assert!(!free_thunk(&mut heap, first, a + 3).unwrap());
    }
}
