//! Per-segment local heap.
//!
//! The heap lives entirely inside a data segment and uses the classic layout:
//!
//! ```text
//! +0   INSTANCEDATA (16 bytes, word at +6 points to the heap info)
//!      first arena       FIXED
//!      heap info arena   FIXED   (0x2a byte LOCALHEAPINFO after the header)
//!      free arena(s)
//!      last arena        FREE, points to itself
//! ```
//!
//! Arenas are `prev | type, next, size, free_prev, free_next`; allocated arenas only
//! keep the first two words. Moveable blocks are reached through handle table
//! entries `{addr, flags, lock}` and carry a back pointer to their handle in the
//! two bytes before the user data.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, trace, warn};

use crate::utils::peek_u16;

pub const INSTANCE_DATA_SIZE: u16 = 16;
pub const INSTANCE_HEAP: u16 = 0x06;
pub const INSTANCE_ATOM_TABLE: u16 = 0x08;
pub const INSTANCE_STACK_TOP: u16 = 0x0a;
pub const INSTANCE_STACK_MIN: u16 = 0x0c;
pub const INSTANCE_STACK_BOTTOM: u16 = 0x0e;

pub const LOCAL_HEAP_MAGIC: u16 = 0x484c;

const ARENA_HEADER_SIZE: u16 = 4;
/// Size of a full (free) arena record.
const ARENA_SIZE: u16 = 10;
const ARENA_SIZE_ALIGNED: u16 = 12;
const ARENA_FREE: u16 = 0;
const ARENA_FIXED: u16 = 1;
const MOVEABLE_PREFIX: u16 = 2;

const HEAP_INFO_SIZE: u16 = 0x2a;
const HI_ITEMS: u16 = 0x04;
const HI_FIRST: u16 = 0x06;
const HI_LAST: u16 = 0x0a;
const HI_HTABLE: u16 = 0x14;
const HI_HDELTA: u16 = 0x18;
const HI_EXTRA: u16 = 0x24;
const HI_MINSIZE: u16 = 0x26;
const HI_MAGIC: u16 = 0x28;

const HE_ADDR: u16 = 0;
const HE_FLAGS: u16 = 2;
const HE_LOCK: u16 = 3;
const HE_SIZE: u16 = 4;
const HE_FREE: u8 = 0xff;
const HE_DISCARDED: u8 = 0x40;

/// Bound on list walks so a corrupted heap cannot hang the caller.
const MAX_WALK: usize = 0x4000;

bitflags! {
    /// `LMEM_*` flags.
    pub struct LocalFlags: u16 {
        const FIXED = 0x0000;
        const MOVEABLE = 0x0002;
        const NOCOMPACT = 0x0010;
        const NODISCARD = 0x0020;
        const ZEROINIT = 0x0040;
        const MODIFY = 0x0080;
        const DISCARDABLE = 0x0f00;
    }
}

pub const LMEM_DISCARDED: u16 = 0x4000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NotifyMsg {
    Move = 1,
    Discard = 2,
    OutOfMem = 3,
}

/// Observer told about blocks the heap moves or discards on its own.
pub trait LocalNotify: Send {
    fn notify(&mut self, msg: NotifyMsg, handle: u16, arg: u16) -> bool;
}

/// The storage a local heap lives in.
pub trait HeapSegment {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
    /// Enlarge the segment to a full 64KB. Offsets stay valid across growth.
    fn grow(&mut self) -> bool;
}

impl HeapSegment for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
    fn grow(&mut self) -> bool {
        if self.len() > 0xfff0 {
            return false;
        }
        self.resize(0x10000, 0);
        true
    }
}

pub fn is_moveable(handle: u16) -> bool {
    handle & 3 == 2
}

pub fn is_fixed(handle: u16) -> bool {
    handle & 3 == 0
}

fn lalign(v: u32) -> u32 {
    (v + 3) & !3
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArenaKind {
    Free,
    Fixed,
    Moveable,
}

/// One arena of a heap walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LocalEntry {
    pub arena: u16,
    pub size: u16,
    pub kind: ArenaKind,
    /// Handle of a moveable block.
    pub handle: u16,
    pub lock: u8,
}

pub struct LocalHeap<'a> {
    seg: &'a mut dyn HeapSegment,
    notify: Option<&'a mut dyn LocalNotify>,
}

impl<'a> LocalHeap<'a> {
    pub fn new(seg: &'a mut dyn HeapSegment) -> Self {
        Self { seg, notify: None }
    }

    pub fn with_notify(
        seg: &'a mut dyn HeapSegment,
        notify: Option<&'a mut dyn LocalNotify>,
    ) -> Self {
        Self { seg, notify }
    }

    pub(crate) fn word(&self, off: u16) -> u16 {
        peek_u16(self.seg.bytes(), off as usize).unwrap_or(0)
    }

    pub(crate) fn set_word(&mut self, off: u16, v: u16) {
        match self
            .seg
            .bytes_mut()
            .get_mut(off as usize..off as usize + 2)
        {
            Some(b) => LittleEndian::write_u16(b, v),
            None => warn!("local heap write past segment end at {:#06x}", off),
        }
    }

    pub(crate) fn byte(&self, off: u16) -> u8 {
        self.seg.bytes().get(off as usize).copied().unwrap_or(0)
    }

    pub(crate) fn set_byte(&mut self, off: u16, v: u8) {
        if let Some(b) = self.seg.bytes_mut().get_mut(off as usize) {
            *b = v;
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.seg.bytes()
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        self.seg.bytes_mut()
    }

    fn fill(&mut self, start: u16, end: u16, value: u8) {
        let len = self.seg.bytes().len();
        let (start, end) = (start as usize, (end as usize).min(len));
        if start < end {
            self.seg.bytes_mut()[start..end].fill(value);
        }
    }

    fn prev(&self, a: u16) -> u16 {
        self.word(a)
    }
    fn next(&self, a: u16) -> u16 {
        self.word(a.wrapping_add(2))
    }
    fn arena_size(&self, a: u16) -> u16 {
        self.word(a.wrapping_add(4))
    }
    fn free_prev(&self, a: u16) -> u16 {
        self.word(a.wrapping_add(6))
    }
    fn free_next(&self, a: u16) -> u16 {
        self.word(a.wrapping_add(8))
    }
    fn set_prev(&mut self, a: u16, v: u16) {
        self.set_word(a, v)
    }
    fn set_next(&mut self, a: u16, v: u16) {
        self.set_word(a.wrapping_add(2), v)
    }
    fn set_arena_size(&mut self, a: u16, v: u16) {
        self.set_word(a.wrapping_add(4), v)
    }
    fn set_free_prev(&mut self, a: u16, v: u16) {
        self.set_word(a.wrapping_add(6), v)
    }
    fn set_free_next(&mut self, a: u16, v: u16) {
        self.set_word(a.wrapping_add(8), v)
    }
    fn is_free(&self, a: u16) -> bool {
        self.prev(a) & 3 == ARENA_FREE
    }

    /// Offset of the heap info structure, if the segment carries a valid heap.
    pub(crate) fn info(&self) -> Option<u16> {
        let info = peek_u16(self.seg.bytes(), INSTANCE_HEAP as usize)?;
        if info == 0 {
            return None;
        }
        if info as usize + HEAP_INFO_SIZE as usize > self.seg.bytes().len() {
            warn!("local heap info at {:#06x} outside segment", info);
            return None;
        }
        if self.word(info + HI_MAGIC) != LOCAL_HEAP_MAGIC {
            warn!("bad local heap magic at {:#06x}", info);
            return None;
        }
        Some(info)
    }

    pub fn has_heap(&self) -> bool {
        self.info().is_some()
    }

    fn bump_items(&mut self, info: u16, up: bool) {
        let items = self.word(info + HI_ITEMS);
        let items = if up {
            items.wrapping_add(1)
        } else {
            items.wrapping_sub(1)
        };
        self.set_word(info + HI_ITEMS, items);
    }

    fn call_notify(&mut self, msg: NotifyMsg, handle: u16, arg: u16) -> bool {
        match self.notify.as_mut() {
            Some(n) => n.notify(msg, handle, arg),
            None => false,
        }
    }

    fn make_block_free(&mut self, block: u16) {
        let prev = self.prev(block);
        self.set_prev(block, (prev & !3) | ARENA_FREE);
        let size = self.next(block).wrapping_sub(block);
        self.set_arena_size(block, size);

        // the last block is always free
        let mut next = self.next(block);
        for _ in 0..MAX_WALK {
            if self.is_free(next) {
                break;
            }
            next = self.next(next);
        }
        trace!("free block {:#06x}, next free {:#06x}", block, next);
        let next_free_prev = self.free_prev(next);
        self.set_free_prev(block, next_free_prev);
        self.set_free_next(block, next);
        self.set_free_next(next_free_prev, block);
        self.set_free_prev(next, block);
    }

    fn remove_free_block(&mut self, block: u16) {
        let prev = self.prev(block);
        self.set_prev(block, (prev & !3) | ARENA_FIXED);
        let (fp, fnx) = (self.free_prev(block), self.free_next(block));
        self.set_free_next(fp, fnx);
        self.set_free_prev(fnx, fp);
    }

    fn add_block(&mut self, prev: u16, new: u16) {
        self.set_prev(new, (prev & !3) | ARENA_FIXED);
        let after = self.next(prev);
        self.set_next(new, after);
        let after_prev = self.prev(after);
        self.set_prev(after, (after_prev & 3) | new);
        self.set_next(prev, new);
    }

    fn remove_block(&mut self, block: u16) {
        if self.is_free(block) {
            self.remove_free_block(block);
        }
        let prev = self.prev(block) & !3;
        let next = self.next(block);
        if self.is_free(prev) {
            let size = self.arena_size(prev).wrapping_add(next.wrapping_sub(block));
            self.set_arena_size(prev, size);
        }
        self.set_next(prev, next);
        let next_prev = self.prev(next);
        self.set_prev(next, (next_prev & 3) | (self.prev(block) & !3));
    }

    /// Create a heap in `start..end`. A zero `start` places a heap of `end` bytes
    /// at the end of the segment.
    pub fn init(&mut self, start: u16, end: u16) -> bool {
        let (mut start, mut end) = (start as u32, end as u32);
        debug!("local init {:#06x}-{:#06x}", start, end);
        if start == 0 {
            let size = self.seg.bytes().len().min(0xffff) as u32;
            end = end.min(0xfffe);
            start = match size.checked_sub(1).and_then(|s| s.checked_sub(end)) {
                Some(s) => s,
                None => return false,
            };
            end += start;
        }
        let start = lalign(start.max(INSTANCE_DATA_SIZE as u32));
        let heap_info_arena = lalign(start + ARENA_SIZE as u32);
        let free_arena =
            lalign(heap_info_arena + ARENA_HEADER_SIZE as u32 + HEAP_INFO_SIZE as u32);
        let last_arena = match end.checked_sub(ARENA_SIZE as u32) {
            Some(v) => v & !3,
            None => return false,
        };
        if free_arena + ARENA_SIZE as u32 >= last_arena
            || last_arena + ARENA_SIZE_ALIGNED as u32 > self.seg.bytes().len() as u32
        {
            warn!("not enough room for a local heap in {:#x}-{:#x}", start, end);
            return false;
        }
        let (start, hia, fa, la) = (
            start as u16,
            heap_info_arena as u16,
            free_arena as u16,
            last_arena as u16,
        );

        self.set_prev(start, start | ARENA_FIXED);
        self.set_next(start, hia);
        self.set_arena_size(start, ARENA_SIZE_ALIGNED);
        self.set_free_prev(start, start);
        self.set_free_next(start, fa);

        self.set_prev(hia, start | ARENA_FIXED);
        self.set_next(hia, fa);

        let info = hia + ARENA_HEADER_SIZE;
        self.fill(info, info + HEAP_INFO_SIZE, 0);
        self.set_word(info + HI_ITEMS, 4);
        self.set_word(info + HI_FIRST, start);
        self.set_word(info + HI_LAST, la);
        self.set_word(info + HI_HTABLE, 0);
        self.set_word(info + HI_HDELTA, 0x20);
        self.set_word(info + HI_EXTRA, 0x200);
        self.set_word(info + HI_MINSIZE, la - fa);
        self.set_word(info + HI_MAGIC, LOCAL_HEAP_MAGIC);

        self.set_prev(fa, hia | ARENA_FREE);
        self.set_next(fa, la);
        self.set_arena_size(fa, la - fa);
        self.set_free_prev(fa, start);
        self.set_free_next(fa, la);

        self.set_prev(la, fa | ARENA_FREE);
        self.set_next(la, la);
        self.set_arena_size(la, ARENA_SIZE_ALIGNED);
        self.set_free_prev(la, fa);
        self.set_free_next(la, la);

        self.set_word(INSTANCE_HEAP, info);
        true
    }

    fn grow_heap(&mut self) -> bool {
        let old_size = self.seg.bytes().len() as u32;
        if old_size > 0xfff0 || !self.seg.grow() {
            return false;
        }
        let info = match self.info() {
            Some(info) => info,
            None => {
                error!("local heap lost while growing its segment");
                return false;
            }
        };
        let end = (self.seg.bytes().len() as u32).min(0x10000);
        let last_arena = ((end - ARENA_SIZE as u32) & !3) as u16;

        self.bump_items(info, true);
        let free_arena = self.word(info + HI_LAST);
        self.set_word(info + HI_LAST, last_arena);
        let minsize = self.word(info + HI_MINSIZE);
        self.set_word(
            info + HI_MINSIZE,
            minsize.wrapping_add((end - old_size) as u16),
        );

        // the old last block becomes an ordinary free block
        self.set_arena_size(free_arena, last_arena - free_arena);
        self.set_next(free_arena, last_arena);
        self.set_free_next(free_arena, last_arena);

        self.set_prev(last_arena, free_arena | ARENA_FREE);
        self.set_next(last_arena, last_arena);
        self.set_arena_size(last_arena, ARENA_SIZE_ALIGNED);
        self.set_free_prev(last_arena, free_arena);
        self.set_free_next(last_arena, last_arena);

        if self.is_free(self.prev(free_arena) & !3) {
            self.remove_block(free_arena);
            self.bump_items(info, false);
        }
        debug!("local heap expanded to {:#x} bytes", end);
        true
    }

    /// Returns 0 on success, the arena on failure.
    fn free_arena(&mut self, arena: u16) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => return arena,
        };
        if self.is_free(arena) {
            error!("trying to free local block {:#06x} twice", arena);
            return arena;
        }
        let prev = self.prev(arena) & !3;
        let arena = if self.is_free(prev) {
            let block = self.next(prev);
            self.remove_block(block);
            self.bump_items(info, false);
            prev
        } else {
            self.make_block_free(arena);
            arena
        };
        let next = self.next(arena);
        if next == self.free_next(arena) && next != self.word(info + HI_LAST) {
            self.remove_block(next);
            self.bump_items(info, false);
        }
        0
    }

    fn shrink_arena(&mut self, arena: u16, size: u16) {
        let split = arena as u32 + size as u32;
        if split + (ARENA_SIZE_ALIGNED as u32) < self.next(arena) as u32 {
            let info = match self.info() {
                Some(info) => info,
                None => return,
            };
            let split = split as u16;
            self.add_block(arena, split);
            self.bump_items(info, true);
            self.free_arena(split);
        }
    }

    fn grow_arena_downward(&mut self, arena: u16, new_size: u16) {
        let prev_arena = self.prev(arena) & !3;
        let info = match self.info() {
            Some(info) => info,
            None => return,
        };
        let size = self
            .next(arena)
            .wrapping_sub(arena)
            .wrapping_sub(ARENA_HEADER_SIZE) as usize;
        self.remove_free_block(prev_arena);
        self.remove_block(arena);
        self.bump_items(info, false);
        let src = (arena + ARENA_HEADER_SIZE) as usize;
        let dst = (prev_arena + ARENA_HEADER_SIZE) as usize;
        if src + size <= self.seg.bytes().len() {
            self.seg.bytes_mut().copy_within(src..src + size, dst);
        }
        self.shrink_arena(prev_arena, new_size);
    }

    fn grow_arena_upward(&mut self, arena: u16, new_size: u16) {
        let next = self.next(arena);
        let info = match self.info() {
            Some(info) => info,
            None => return,
        };
        self.remove_block(next);
        self.bump_items(info, false);
        self.shrink_arena(arena, new_size);
    }

    fn free_space(&self) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => return 0,
        };
        let mut arena = self.word(info + HI_FIRST);
        let mut space = 0u16;
        for _ in 0..MAX_WALK {
            let next = self.free_next(arena);
            if next == arena {
                break;
            }
            arena = next;
            space = space.max(self.arena_size(arena));
        }
        space.saturating_sub(ARENA_HEADER_SIZE)
    }

    fn compact_with(&mut self, minfree: u16, flags: LocalFlags) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => {
                error!("local heap not found");
                return 0;
            }
        };
        let free = self.free_space();
        if free >= minfree || flags.contains(LocalFlags::NOCOMPACT) {
            return free;
        }
        debug!("compacting local heap for {:#x} bytes", minfree);

        let mut table = self.word(info + HI_HTABLE);
        let mut tables = 0;
        while table != 0 && tables < MAX_WALK {
            let count = self.word(table);
            let mut entry = table + 2;
            for _ in 0..count {
                if self.byte(entry + HE_LOCK) == 0 && self.byte(entry + HE_FLAGS) != HE_DISCARDED
                {
                    self.move_down(info, entry);
                }
                entry += HE_SIZE;
            }
            table = self.word(entry);
            tables += 1;
        }

        let free = self.free_space();
        if free >= minfree || flags.contains(LocalFlags::NODISCARD) {
            return free;
        }

        let mut table = self.word(info + HI_HTABLE);
        let mut tables = 0;
        while table != 0 && tables < MAX_WALK {
            let count = self.word(table);
            let mut entry = table + 2;
            for _ in 0..count {
                let flags = self.byte(entry + HE_FLAGS);
                if self.byte(entry + HE_LOCK) == 0
                    && flags != HE_DISCARDED
                    && flags & (LocalFlags::DISCARDABLE.bits() >> 8) as u8 != 0
                {
                    let addr = self.word(entry + HE_ADDR);
                    let arena = match addr.checked_sub(MOVEABLE_PREFIX + ARENA_HEADER_SIZE) {
                        Some(arena) => arena,
                        None => {
                            error!("local handle {:#06x} points at {:#06x}", entry, addr);
                            entry += HE_SIZE;
                            continue;
                        }
                    };
                    trace!("discarding handle {:#06x} (block {:#06x})", entry, addr);
                    self.free_arena(arena);
                    self.call_notify(NotifyMsg::Discard, entry, flags as u16);
                    self.set_word(entry + HE_ADDR, 0);
                    self.set_byte(entry + HE_FLAGS, HE_DISCARDED);
                }
                entry += HE_SIZE;
            }
            table = self.word(entry);
            tables += 1;
        }
        self.compact_with(0xffff, LocalFlags::NODISCARD)
    }

    /// Slide the moveable block of `entry` into the best fitting free arena below
    /// it, or into the free arena right before it.
    fn move_down(&mut self, info: u16, entry: u16) {
        let addr = self.word(entry + HE_ADDR);
        let move_arena = addr.wrapping_sub(MOVEABLE_PREFIX + ARENA_HEADER_SIZE);
        let move_size = self.next(move_arena).wrapping_sub(move_arena);

        let mut arena = self.word(info + HI_FIRST);
        let mut best = 0xffffu16;
        let mut final_arena = 0;
        for _ in 0..MAX_WALK {
            let next = self.free_next(arena);
            let at_end = next == self.free_next(next);
            arena = next;
            if arena >= move_arena || at_end {
                break;
            }
            let size = self.arena_size(arena);
            if size >= move_size && size < best {
                best = size;
                final_arena = arena;
            }
        }

        if final_arena != 0 {
            trace!("moving local block {:#06x} to {:#06x}", move_arena, final_arena);
            self.remove_free_block(final_arena);
            self.shrink_arena(final_arena, move_size);
            let src = (move_arena + ARENA_HEADER_SIZE) as usize;
            let dst = (final_arena + ARENA_HEADER_SIZE) as usize;
            let len = (move_size - ARENA_HEADER_SIZE) as usize;
            if src + len <= self.seg.bytes().len() {
                self.seg.bytes_mut().copy_within(src..src + len, dst);
            }
            self.free_arena(move_arena);
            self.call_notify(NotifyMsg::Move, entry, addr);
            self.set_word(
                entry + HE_ADDR,
                final_arena + ARENA_HEADER_SIZE + MOVEABLE_PREFIX,
            );
        } else if self.is_free(self.prev(move_arena) & !3) {
            let final_arena = self.prev(move_arena) & !3;
            self.grow_arena_downward(move_arena, move_size);
            self.set_word(
                entry + HE_ADDR,
                final_arena + ARENA_HEADER_SIZE + MOVEABLE_PREFIX,
            );
        }
    }

    fn find_free_block(&self, size: u16) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => return 0,
        };
        let mut arena = self.word(info + HI_FIRST);
        for _ in 0..MAX_WALK {
            arena = self.free_next(arena);
            if arena == self.free_next(arena) {
                break;
            }
            if self.arena_size(arena) >= size {
                return arena;
            }
        }
        0
    }

    /// Carve a fixed block out of the heap; returns the data offset or 0.
    fn get_block(&mut self, size: u16, flags: LocalFlags) -> u16 {
        if self.info().is_none() {
            error!("local heap not found");
            return 0;
        }
        let size = size as u32 + ARENA_HEADER_SIZE as u32;
        if size > 0xfff0 {
            error!("local block of {:#x} bytes cannot fit a segment", size);
            return 0;
        }
        let size = lalign(size.max(ARENA_SIZE as u32)) as u16;

        let mut arena = self.find_free_block(size);
        if arena == 0 {
            self.compact_with(size, flags);
            arena = self.find_free_block(size);
        }
        if arena == 0 {
            if !self.grow_heap() {
                self.call_notify(NotifyMsg::OutOfMem, 0, size);
                error!("not enough space in local heap for {} bytes", size);
                return 0;
            }
            arena = self.find_free_block(size);
        }
        if arena == 0 {
            error!("not enough space in local heap for {} bytes", size);
            return 0;
        }
        trace!("local block of {:#x} bytes at arena {:#06x}", size, arena);
        self.remove_free_block(arena);
        self.shrink_arena(arena, size);
        if flags.contains(LocalFlags::ZEROINIT) {
            self.fill(arena + ARENA_HEADER_SIZE, arena + size, 0);
        }
        arena + ARENA_HEADER_SIZE
    }

    fn new_handle_table(&mut self) -> bool {
        let info = match self.info() {
            Some(info) => info,
            None => return false,
        };
        let delta = self.word(info + HI_HDELTA);
        let block = self.get_block(delta * HE_SIZE + 2 * 2, LocalFlags::FIXED);
        if block == 0 {
            return false;
        }
        self.set_word(block, delta);
        let mut entry = block + 2;
        for _ in 0..delta {
            self.set_word(entry + HE_ADDR, 0);
            self.set_byte(entry + HE_FLAGS, HE_FREE);
            self.set_byte(entry + HE_LOCK, HE_FREE);
            entry += HE_SIZE;
        }
        let htable = self.word(info + HI_HTABLE);
        self.set_word(entry, htable);
        self.set_word(info + HI_HTABLE, block);
        true
    }

    fn new_handle_entry(&mut self) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => return 0,
        };
        let mut table = self.word(info + HI_HTABLE);
        let mut found = 0;
        let mut tables = 0;
        while table != 0 && tables < MAX_WALK {
            let count = self.word(table);
            let mut entry = table + 2;
            for _ in 0..count {
                if self.byte(entry + HE_LOCK) == HE_FREE {
                    found = entry;
                    break;
                }
                entry += HE_SIZE;
            }
            if found != 0 {
                break;
            }
            table = self.word(entry);
            tables += 1;
        }
        if found == 0 {
            if !self.new_handle_table() {
                return 0;
            }
            found = self.word(info + HI_HTABLE) + 2;
        }
        self.set_byte(found + HE_LOCK, 0);
        self.set_byte(found + HE_FLAGS, 0);
        found
    }

    /// The word linking to the live handle table that holds the entry
    /// `handle`, if there is one.
    fn handle_table_link(&self, handle: u16) -> Option<u16> {
        let info = self.info()?;
        let mut link = info + HI_HTABLE;
        for _ in 0..MAX_WALK {
            let table = self.word(link);
            if table == 0 {
                return None;
            }
            let first = table as u32 + 2;
            let end = first + self.word(table) as u32 * HE_SIZE as u32;
            let h = handle as u32;
            if h >= first && h < end {
                return match (h - first) % HE_SIZE as u32 {
                    0 => Some(link),
                    _ => None,
                };
            }
            if end > 0xfffe {
                return None;
            }
            link = end as u16;
        }
        None
    }

    fn free_handle_entry(&mut self, handle: u16) {
        let link = match self.handle_table_link(handle) {
            Some(link) => link,
            None => {
                error!("invalid local handle entry {:#06x}", handle);
                return;
            }
        };

        self.set_word(handle + HE_ADDR, 0);
        self.set_byte(handle + HE_LOCK, HE_FREE);
        self.set_byte(handle + HE_FLAGS, HE_FREE);

        let table = self.word(link);
        let count = self.word(table);
        let mut entry = table + 2;
        for _ in 0..count {
            if self.byte(entry + HE_LOCK) != HE_FREE {
                return;
            }
            entry += HE_SIZE;
        }
        trace!("freeing local handle table {:#06x}", table);
        let next_table = self.word(entry);
        self.set_word(link, next_table);
        self.free_arena(table - ARENA_HEADER_SIZE);
    }

    fn valid_handle_entry(&self, handle: u16) -> bool {
        (handle as usize + HE_SIZE as usize) <= self.seg.bytes().len()
            && self.handle_table_link(handle).is_some()
    }

    pub fn alloc(&mut self, flags: LocalFlags, size: u16) -> u16 {
        let size = if size > 0 && size <= 4 { 5 } else { size };
        if !flags.contains(LocalFlags::MOVEABLE) {
            if size == 0 {
                return 0;
            }
            return self.get_block(size, flags);
        }

        let hmem = if size != 0 {
            match self.get_block(size.saturating_add(MOVEABLE_PREFIX), flags) {
                0 => return 0,
                hmem => hmem,
            }
        } else {
            0
        };
        let handle = self.new_handle_entry();
        if handle == 0 {
            warn!("no local handle entry left");
            if hmem != 0 {
                self.free_arena(hmem - ARENA_HEADER_SIZE);
            }
            return 0;
        }
        self.set_byte(handle + HE_LOCK, 0);
        if hmem != 0 {
            self.set_word(handle + HE_ADDR, hmem + MOVEABLE_PREFIX);
            self.set_byte(handle + HE_FLAGS, ((flags.bits() & 0x0f00) >> 8) as u8);
            self.set_word(hmem, handle);
        } else {
            self.set_word(handle + HE_ADDR, 0);
            self.set_byte(handle + HE_FLAGS, HE_DISCARDED);
        }
        handle
    }

    pub fn realloc(&mut self, handle: u16, size: u16, flags: LocalFlags) -> u16 {
        if handle == 0 {
            return 0;
        }
        if is_moveable(handle)
            && (!self.valid_handle_entry(handle) || self.byte(handle + HE_LOCK) == HE_FREE)
        {
            return 0;
        }
        if self.info().is_none() {
            return 0;
        }
        trace!("local realloc {:#06x} {:#x} {:?}", handle, size, flags);

        let mut size = size;
        let mut block = if is_fixed(handle) {
            handle
        } else {
            if self.byte(handle + HE_FLAGS) == HE_DISCARDED {
                if size <= 4 {
                    size = 5;
                }
                let hl = self.get_block(size.saturating_add(MOVEABLE_PREFIX), flags);
                if hl == 0 {
                    return 0;
                }
                self.set_word(handle + HE_ADDR, hl + MOVEABLE_PREFIX);
                self.set_byte(handle + HE_FLAGS, 0);
                self.set_byte(handle + HE_LOCK, 0);
                self.set_word(hl, handle);
                return handle;
            }
            let block = self.word(handle + HE_ADDR).wrapping_sub(MOVEABLE_PREFIX);
            if block & 3 != 0 {
                error!("invalid local handle {:#06x}", handle);
                return 0;
            }
            if self.word(block) != handle {
                error!("back pointer of local handle {:#06x} is invalid", handle);
                return 0;
            }
            block
        };

        if flags.contains(LocalFlags::MODIFY) {
            if is_moveable(handle) {
                self.set_byte(handle + HE_FLAGS, ((flags.bits() & 0x0f00) >> 8) as u8);
            }
            return handle;
        }

        if size == 0 {
            if flags.contains(LocalFlags::MOVEABLE) {
                if is_fixed(handle) {
                    return self.free(handle);
                }
                if self.byte(handle + HE_LOCK) == 0 {
                    self.free_arena(block - ARENA_HEADER_SIZE);
                    self.set_word(handle + HE_ADDR, 0);
                    self.set_byte(handle + HE_FLAGS, HE_DISCARDED);
                    return handle;
                }
            } else if flags.is_empty()
                && (is_fixed(handle) || self.byte(handle + HE_LOCK) == 0)
            {
                return self.free(handle);
            }
            return 0;
        }

        let mut arena = block.wrapping_sub(ARENA_HEADER_SIZE);
        if size <= 4 {
            size = 5;
        }
        let size = if is_moveable(handle) {
            size as u32 + MOVEABLE_PREFIX as u32
        } else {
            size as u32
        };
        let old_size = self
            .next(arena)
            .wrapping_sub(arena)
            .wrapping_sub(ARENA_HEADER_SIZE);
        let next_arena = lalign(block as u32 + size);

        if next_arena <= self.next(arena) as u32 {
            trace!("local realloc shrinks in place");
            self.shrink_arena(arena, (next_arena - arena as u32) as u16);
            return handle;
        }

        let next = self.next(arena);
        if self.is_free(next) && next_arena <= self.next(next) as u32 {
            trace!("local realloc grows into the next free block");
            self.grow_arena_upward(arena, (next_arena - arena as u32) as u16);
            if flags.contains(LocalFlags::ZEROINIT) {
                let end = self.next(arena);
                self.fill(block + old_size, end, 0);
            }
            return handle;
        }

        if !flags.contains(LocalFlags::MOVEABLE) {
            if is_fixed(handle) {
                error!("needed to move fixed local block without LMEM_MOVEABLE");
                return 0;
            }
            if self.byte(handle + HE_LOCK) != 0 {
                error!("needed to move locked local block without LMEM_MOVEABLE");
                return 0;
            }
        }
        if size > 0xffff {
            return 0;
        }
        let mut size = size as u16;

        let mut hmem = self.get_block(size, flags);
        if is_moveable(handle) {
            // compaction may have moved the block being resized
            block = self.word(handle + HE_ADDR).wrapping_sub(MOVEABLE_PREFIX);
            arena = block.wrapping_sub(ARENA_HEADER_SIZE);
        }
        if hmem == 0 {
            let saved = match self
                .seg
                .bytes()
                .get(block as usize..block as usize + old_size as usize)
            {
                Some(b) => b.to_vec(),
                None => return 0,
            };
            let saved_flags = self.byte(handle + HE_FLAGS);
            if is_moveable(handle) {
                // keep compaction away from the entry while its block is gone
                self.set_word(handle + HE_ADDR, 0);
                self.set_byte(handle + HE_FLAGS, HE_DISCARDED);
            }
            self.free_arena(arena);
            hmem = self.get_block(size, flags);
            if hmem == 0 {
                hmem = self.get_block(old_size, flags);
                if hmem == 0 {
                    error!("cannot restore saved local block");
                    return 0;
                }
                size = old_size;
            }
            if let Some(dst) = self
                .seg
                .bytes_mut()
                .get_mut(hmem as usize..hmem as usize + saved.len())
            {
                dst.copy_from_slice(&saved);
            }
            if is_moveable(handle) {
                self.set_byte(handle + HE_FLAGS, saved_flags);
            }
        } else {
            let src = block as usize;
            if src + old_size as usize <= self.seg.bytes().len() {
                self.seg
                    .bytes_mut()
                    .copy_within(src..src + old_size as usize, hmem as usize);
            }
            self.free_arena(arena);
        }
        if is_moveable(handle) {
            self.set_word(handle + HE_ADDR, hmem + MOVEABLE_PREFIX);
            if self.word(hmem) != handle {
                error!("back pointer of local handle {:#06x} is invalid", handle);
            }
            hmem = handle;
        }
        if size == old_size {
            // only the old size could be restored
            return 0;
        }
        hmem
    }

    /// Returns 0 on success, the handle on failure.
    pub fn free(&mut self, handle: u16) -> u16 {
        if handle == 0 {
            warn!("freeing local handle 0");
            return 0;
        }
        if is_fixed(handle) {
            return match self.free_arena(handle - ARENA_HEADER_SIZE) {
                0 => 0,
                _ => handle,
            };
        }
        if !self.valid_handle_entry(handle) || self.byte(handle + HE_LOCK) == HE_FREE {
            warn!("invalid local handle {:#06x}", handle);
            return handle;
        }
        if self.byte(handle + HE_FLAGS) != HE_DISCARDED {
            let addr = self.word(handle + HE_ADDR);
            trace!("real block at {:#06x}", addr);
            let arena = match addr.checked_sub(MOVEABLE_PREFIX + ARENA_HEADER_SIZE) {
                Some(arena) => arena,
                None => {
                    error!("local handle {:#06x} points at {:#06x}", handle, addr);
                    return handle;
                }
            };
            if self.free_arena(arena) != 0 {
                return handle;
            }
        }
        self.free_handle_entry(handle);
        0
    }

    /// Offset of the block data; moveable blocks gain a lock.
    pub fn lock(&mut self, handle: u16) -> u16 {
        if handle == 0 {
            return 0;
        }
        if is_moveable(handle) {
            if !self.valid_handle_entry(handle) || self.byte(handle + HE_FLAGS) == HE_DISCARDED {
                return 0;
            }
            let lock = self.byte(handle + HE_LOCK);
            if lock < 0xfe {
                self.set_byte(handle + HE_LOCK, lock + 1);
            }
            return self.word(handle + HE_ADDR);
        }
        handle
    }

    /// For moveable blocks the remaining lock count, otherwise 0.
    pub fn unlock(&mut self, handle: u16) -> u16 {
        if !is_moveable(handle) || !self.valid_handle_entry(handle) {
            return 0;
        }
        let lock = self.byte(handle + HE_LOCK);
        if lock == 0 || lock == HE_FREE {
            return 0;
        }
        self.set_byte(handle + HE_LOCK, lock - 1);
        (lock - 1) as u16
    }

    pub fn size(&self, handle: u16) -> u16 {
        if handle == 0 {
            return 0;
        }
        let (addr, arena) = if is_moveable(handle) {
            if !self.valid_handle_entry(handle) {
                return 0;
            }
            let addr = self.word(handle + HE_ADDR);
            if addr == 0 {
                return 0;
            }
            (addr, addr.wrapping_sub(MOVEABLE_PREFIX + ARENA_HEADER_SIZE))
        } else {
            (handle, handle.wrapping_sub(ARENA_HEADER_SIZE))
        };
        self.next(arena).wrapping_sub(addr)
    }

    /// Lock count in the low byte, `LMEM_*` flags above.
    pub fn flags(&self, handle: u16) -> u16 {
        if !is_moveable(handle) || !self.valid_handle_entry(handle) {
            return 0;
        }
        self.byte(handle + HE_LOCK) as u16 | ((self.byte(handle + HE_FLAGS) as u16) << 8)
    }

    /// The handle owning the block at `addr`; fixed blocks are their own handle.
    pub fn handle(&self, addr: u16) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => {
                error!("local heap not found");
                return 0;
            }
        };
        let mut table = self.word(info + HI_HTABLE);
        let mut tables = 0;
        while table != 0 && tables < MAX_WALK {
            let count = self.word(table);
            let mut entry = table + 2;
            for _ in 0..count {
                if self.word(entry + HE_ADDR) == addr {
                    return entry;
                }
                entry += HE_SIZE;
            }
            table = self.word(entry);
            tables += 1;
        }
        addr
    }

    /// Largest free block after compacting for `minfree` bytes.
    pub fn compact(&mut self, minfree: u16) -> u16 {
        self.compact_with(minfree, LocalFlags::empty())
    }

    pub fn count_free(&self) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => return 0,
        };
        let mut total = 0u16;
        let mut arena = self.word(info + HI_FIRST);
        for _ in 0..MAX_WALK {
            arena = self.free_next(arena);
            if arena == self.free_next(arena) {
                break;
            }
            total = total.wrapping_add(self.arena_size(arena));
        }
        total
    }

    pub fn heap_size(&self) -> u16 {
        match self.info() {
            Some(info) => self.word(info + HI_LAST) - self.word(info + HI_FIRST),
            None => 0,
        }
    }

    /// Set the number of entries per new handle table (0 just queries).
    pub fn handle_delta(&mut self, delta: u16) -> u16 {
        let info = match self.info() {
            Some(info) => info,
            None => return 0,
        };
        if delta != 0 {
            self.set_word(info + HI_HDELTA, delta);
        }
        self.word(info + HI_HDELTA)
    }

    /// The arenas from first to last.
    pub fn walk(&self) -> Option<Vec<LocalEntry>> {
        let info = self.info()?;
        let last = self.word(info + HI_LAST);
        let mut arena = self.word(info + HI_FIRST);
        let mut entries = vec![];
        for _ in 0..MAX_WALK {
            let next = self.next(arena);
            let free = self.is_free(arena);
            let mut entry = LocalEntry {
                arena,
                size: if arena == last {
                    ARENA_SIZE_ALIGNED
                } else {
                    next.wrapping_sub(arena)
                },
                kind: if free { ArenaKind::Free } else { ArenaKind::Fixed },
                handle: 0,
                lock: 0,
            };
            if !free && arena != last {
                let back = self.word(arena + ARENA_HEADER_SIZE);
                if is_moveable(back)
                    && self.valid_handle_entry(back)
                    && self.word(back + HE_ADDR) == arena + ARENA_HEADER_SIZE + MOVEABLE_PREFIX
                {
                    entry.kind = ArenaKind::Moveable;
                    entry.handle = back;
                    entry.lock = self.byte(back + HE_LOCK);
                }
            }
            entries.push(entry);
            if arena == last {
                return Some(entries);
            }
            if next <= arena {
                return None;
            }
            arena = next;
        }
        None
    }

    /// Structural check of the arena chain and the free list.
    pub fn validate(&self) -> bool {
        let info = match self.info() {
            Some(info) => info,
            None => return false,
        };
        let entries = match self.walk() {
            Some(e) => e,
            None => return false,
        };
        let last = self.word(info + HI_LAST);
        if entries.len() != self.word(info + HI_ITEMS) as usize {
            return false;
        }
        for pair in entries.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if self.prev(b.arena) & !3 != a.arena {
                return false;
            }
            if a.kind == ArenaKind::Free && b.kind == ArenaKind::Free && b.arena != last {
                return false;
            }
        }
        let free_in_chain = entries
            .iter()
            .filter(|e| e.kind == ArenaKind::Free)
            .count();
        let mut free_in_list = 0;
        let mut arena = self.word(info + HI_FIRST);
        for _ in 0..MAX_WALK {
            let next = self.free_next(arena);
            if self.free_prev(next) != arena && next != arena {
                return false;
            }
            if next == arena {
                return free_in_list == free_in_chain;
            }
            if !self.is_free(next) {
                return false;
            }
            free_in_list += 1;
            arena = next;
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn test_init_layout() {
        let mut seg = segment(0x1000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0, 0x800));
        let info = heap.info().unwrap();
        assert_eq!(heap.word(info + HI_MAGIC), LOCAL_HEAP_MAGIC);
        assert_eq!(heap.word(info + HI_ITEMS), 4);
        assert!(heap.validate());
        assert!(heap.heap_size() > 0x700);

        let mut tiny = segment(0x40);
        let mut heap = LocalHeap::new(&mut tiny);
        assert!(!heap.init(0x10, 0x40));
    }

    #[test]
    fn test_fixed_alloc_free() {
        let mut seg = segment(0x1000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0x10, 0xff0));
        let free_before = heap.count_free();
        let a = heap.alloc(LocalFlags::FIXED | LocalFlags::ZEROINIT, 3);
        assert!(is_fixed(a) && a != 0);
        assert!(heap.size(a) >= 5);
        let b = heap.alloc(LocalFlags::FIXED, 0x100);
        assert!(heap.validate());
        assert_eq!(heap.free(a), 0);
        assert_eq!(heap.free(b), 0);
        assert!(heap.validate());
        assert_eq!(heap.count_free(), free_before);
    }

    #[test]
    fn test_moveable_lock_discard() {
        let mut seg = segment(0x2000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0, 0x1000));
        let h = heap.alloc(LocalFlags::MOVEABLE | LocalFlags::DISCARDABLE, 100);
        assert!(is_moveable(h));
        let p = heap.lock(h);
        assert_eq!(p & 3, 2);
        assert_eq!(heap.flags(h) & 0xff, 1);
        assert_eq!(heap.handle(p), h);
        assert_eq!(heap.realloc(h, 0, LocalFlags::MOVEABLE), 0);
        assert_eq!(heap.unlock(h), 0);
        assert_eq!(heap.realloc(h, 0, LocalFlags::MOVEABLE), h);
        assert_eq!(heap.flags(h) >> 8, HE_DISCARDED as u16);
        assert_eq!(heap.lock(h), 0);
        assert_eq!(heap.size(h), 0);
        assert_eq!(heap.realloc(h, 50, LocalFlags::MOVEABLE), h);
        assert!(heap.size(h) >= 50);
        assert_eq!(heap.free(h), 0);
        assert!(heap.validate());
    }

    #[test]
    fn test_bogus_handles_rejected() {
        let mut seg = segment(0x1000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0x10, 0xff0));
        let free_before = heap.count_free();
        assert_eq!(heap.free(2), 2);
        assert_eq!(heap.free(0xfffe), 0xfffe);
        assert_eq!(heap.lock(2), 0);
        assert_eq!(heap.unlock(2), 0);
        assert_eq!(heap.size(0xfffe), 0);
        assert_eq!(heap.flags(0xfffe), 0);
        assert_eq!(heap.realloc(2, 10, LocalFlags::MOVEABLE), 0);

        // off the entry boundaries of a live table
        let h = heap.alloc(LocalFlags::MOVEABLE, 16);
        assert!(is_moveable(h));
        assert_eq!(heap.free(h + 1), h + 1);
        assert_eq!(heap.free(h), 0);
        assert_eq!(heap.free(h), h);
        assert!(heap.validate());
        assert_eq!(heap.count_free(), free_before);
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let mut seg = segment(0x1000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0x10, 0xff0));
        let h = heap.alloc(LocalFlags::MOVEABLE, 8);
        let p = heap.lock(h);
        for i in 0..8 {
            heap.set_byte(p + i, i as u8 + 1);
        }
        heap.unlock(h);
        // block right after prevents growing in place
        let blocker = heap.alloc(LocalFlags::FIXED, 8);
        assert_ne!(blocker, 0);
        assert_eq!(heap.realloc(h, 0x200, LocalFlags::MOVEABLE), h);
        let q = heap.lock(h);
        assert_ne!(p, q);
        for i in 0..8 {
            assert_eq!(heap.byte(q + i), i as u8 + 1);
        }
        assert!(heap.size(h) >= 0x200);
        assert!(heap.validate());

        // a fixed block that must move fails without LMEM_MOVEABLE
        let f = heap.alloc(LocalFlags::FIXED, 8);
        let _g = heap.alloc(LocalFlags::FIXED, 8);
        assert_eq!(heap.realloc(f, 0x100, LocalFlags::FIXED), 0);
        assert!(heap.validate());
    }

    #[test]
    fn test_grows_segment() {
        let mut seg = segment(0x400);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0x10, 0x3f0));
        let big = heap.alloc(LocalFlags::FIXED, 0x1000);
        assert_ne!(big, 0);
        assert!(heap.validate());
        drop(heap);
        assert_eq!(seg.len(), 0x10000);
    }

    #[test]
    fn test_handle_table_released() {
        let mut seg = segment(0x1000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0x10, 0xff0));
        let info = heap.info().unwrap();
        let handles: Vec<u16> = (0..40)
            .map(|_| heap.alloc(LocalFlags::MOVEABLE, 4))
            .collect();
        assert!(handles.iter().all(|&h| is_moveable(h)));
        assert_ne!(heap.word(info + HI_HTABLE), 0);
        for h in handles {
            assert_eq!(heap.free(h), 0);
        }
        assert_eq!(heap.word(info + HI_HTABLE), 0);
        assert!(heap.validate());
    }

    #[test]
    fn test_alloc_free_restores_topology() {
        let mut seg = segment(0x1000);
        let mut heap = LocalHeap::new(&mut seg);
        assert!(heap.init(0, 0x1000 - 0x20));
        let keep = heap.alloc(LocalFlags::FIXED, 0x30);
        assert_ne!(keep, 0);
        let before = heap.walk().unwrap();
        for size in [1u16, 7, 0x40, 0x123] {
            let h = heap.alloc(LocalFlags::FIXED, size);
            assert_ne!(h, 0);
            assert_eq!(heap.free(h), 0);
            assert_eq!(heap.walk().unwrap(), before);
        }
        // double free is rejected
        let h = heap.alloc(LocalFlags::FIXED, 0x10);
        assert_eq!(heap.free(h), 0);
        assert_eq!(heap.free(h), h);
        assert!(heap.validate());
    }

    struct Recorder(Vec<(NotifyMsg, u16)>);

    impl LocalNotify for Recorder {
        fn notify(&mut self, msg: NotifyMsg, handle: u16, _arg: u16) -> bool {
            self.0.push((msg, handle));
            true
        }
    }

    #[test]
    fn test_compact_moves_and_notifies() {
        let mut seg = segment(0x10000);
        let mut rec = Recorder(vec![]);
        {
            let mut heap = LocalHeap::with_notify(&mut seg, Some(&mut rec));
            assert!(heap.init(0x10, 0x600));
            let hole = heap.alloc(LocalFlags::FIXED, 0x100);
            let m = heap.alloc(LocalFlags::MOVEABLE, 0x40);
            let p = heap.lock(m);
            heap.set_byte(p, 0x5a);
            heap.unlock(m);
            assert_eq!(heap.free(hole), 0);
            let free = heap.compact(0xffff);
            assert!(free > 0);
            let q = heap.lock(m);
            assert!(q < p);
            assert_eq!(heap.byte(q), 0x5a);
            assert!(heap.validate());
        }
        assert_eq!(rec.0.first().map(|r| r.0), Some(NotifyMsg::Move));
    }
}
