//! Allocating and loading module segments.

use log::{debug, error, trace, warn};

use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags, GlobalHeap},
    ldt::SegmentAccess,
    ne::{
        entry::{ENTRY_EXPORTED, ENTRY_SHARED_DATA},
        module::{get_module, get_module_mut, ModuleFlags, SegEntry, SegmentFlags, SEG_ENTRY_SIZE},
        reloc::{apply_relocations, parse_relocs, RELOC_SIZE},
    },
    utils::{hiword, make_segptr, peek_u16},
};

/// Global allocation flags for a segment with file flags `flags`.
pub fn ne2mem_flags(flags: u16) -> GlobalFlags {
    let f = SegmentFlags::from_bits_truncate(flags);
    let mut mem = GlobalFlags::ZEROINIT;
    if f.contains(SegmentFlags::DISCARDABLE) {
        mem |= GlobalFlags::DISCARDABLE;
    }
    if f.contains(SegmentFlags::MOVEABLE)
        || !f.intersects(SegmentFlags::DATA | SegmentFlags::LOADED | SegmentFlags::ALLOCATED)
    {
        mem |= GlobalFlags::MOVEABLE;
    }
    mem
}

fn module_seg(heap: &GlobalHeap, hmodule: u16, segnum: u16) -> Result<SegEntry> {
    get_module(heap, hmodule)
        .ok_or(KernelError::InvalidHandle(hmodule))?
        .seg(segnum)
        .ok_or_else(|| KernelError::BadFormat(format!("segment {} out of range", segnum)))
}

fn store_seg(heap: &mut GlobalHeap, hmodule: u16, segnum: u16, seg: &SegEntry) -> Result<()> {
    get_module_mut(heap, hmodule)
        .ok_or(KernelError::InvalidHandle(hmodule))?
        .set_seg(segnum, seg);
    Ok(())
}

/// Allocate memory for segment `segnum`. DGROUP is allocated again on every call
/// so that each instance gets its own.
pub fn create_segment(heap: &mut GlobalHeap, hmodule: u16, segnum: u16) -> Result<()> {
    let module = get_module(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    let mut seg = module
        .seg(segnum)
        .ok_or_else(|| KernelError::BadFormat(format!("segment {} out of range", segnum)))?;
    // a self-loader allocates everything past its own segment
    if module.has(ModuleFlags::SELFLOAD) && segnum != 1 {
        return Ok(());
    }
    if seg.has(SegmentFlags::ALLOCATED) && segnum != module.autodata() {
        return Ok(());
    }

    let mut size = seg.min_alloc();
    if segnum == hiword(module.sssp()) {
        size += module.stack() as u32;
    }
    if segnum == module.autodata() {
        size += module.heap() as u32;
    }
    let mut access = if seg.has(SegmentFlags::DATA) {
        SegmentAccess::DATA
    } else {
        SegmentAccess::CODE
    };
    if seg.has(SegmentFlags::BIT32) {
        access |= SegmentAccess::BIG;
    }
    let hseg = heap.alloc_segment(ne2mem_flags(seg.flags), size, hmodule, access);
    if hseg == 0 {
        return Err(KernelError::OutOfMemory(size));
    }
    trace!("segment {} of {:#06x}: {:#06x} ({:#x} bytes)", segnum, hmodule, hseg, size);
    seg.hseg = hseg;
    seg.flags |= SegmentFlags::ALLOCATED.bits();
    store_seg(heap, hmodule, segnum, &seg)
}

pub fn create_all_segments(heap: &mut GlobalHeap, hmodule: u16) -> Result<()> {
    let cseg = get_module(heap, hmodule)
        .ok_or(KernelError::InvalidHandle(hmodule))?
        .cseg();
    for segnum in 1..=cseg {
        create_segment(heap, hmodule, segnum)?;
    }
    let mut module = get_module_mut(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    let dgroup_entry = match module.autodata() {
        0 => 0,
        n => module.segtab() + (n - 1) * SEG_ENTRY_SIZE,
    };
    module.set_dgroup_entry(dgroup_entry);
    Ok(())
}

/// Expand `(repeat, length, bytes)` records into `out`, stopping at its end.
fn expand_iterated(raw: &[u8], out: &mut [u8]) -> usize {
    let mut curr = 0;
    let mut dst = 0;
    while let (Some(rept), Some(len)) = (peek_u16(raw, curr), peek_u16(raw, curr + 2)) {
        curr += 4;
        let len = len as usize;
        let bytes = match raw.get(curr..curr + len) {
            Some(b) => b,
            None => break,
        };
        for _ in 0..rept {
            match out.get_mut(dst..dst + len) {
                Some(d) => d.copy_from_slice(bytes),
                None => {
                    warn!("iterated data overflows its segment");
                    return dst;
                }
            }
            dst += len;
        }
        curr += len;
    }
    dst
}

/// Load the file image of segment `segnum` from `image`, then fix up exported
/// prologs and apply the segment's relocations.
pub fn load_segment(heap: &mut GlobalHeap, hmodule: u16, segnum: u16, image: &[u8]) -> Result<()> {
    let module = get_module(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    let mut seg = module
        .seg(segnum)
        .ok_or_else(|| KernelError::BadFormat(format!("segment {} out of range", segnum)))?;
    let selfload = module.has(ModuleFlags::SELFLOAD);
    let autodata = module.autodata();
    let align = module.align();
    let name = module.name();

    if seg.has(SegmentFlags::LOADED) {
        // only DGROUP is reloaded, for a new instance
        if selfload || segnum != autodata {
            return Ok(());
        }
    }
    if seg.filepos == 0 {
        return Ok(());
    }

    let pos = (seg.filepos as usize) << align;
    let size = if seg.size != 0 {
        seg.size as usize
    } else {
        seg.min_alloc() as usize
    };
    let raw = image.get(pos..pos + size).ok_or_else(|| {
        KernelError::BadFormat(format!("{}: segment {} past end of file", name, segnum))
    })?;
    debug!(
        "loading segment {} of {} ({:#x} bytes at {:#x}) into {:#06x}",
        segnum, name, size, pos, seg.hseg
    );

    let sel = handle_to_sel(seg.hseg);
    let mem = heap.segment_mut(sel)?;
    if seg.has(SegmentFlags::ITERATED) {
        expand_iterated(raw, mem);
    } else {
        mem.get_mut(..size)
            .ok_or(KernelError::OutOfBounds(sel, size as u32))?
            .copy_from_slice(raw);
    }
    seg.flags |= SegmentFlags::LOADED.bits();
    store_seg(heap, hmodule, segnum, &seg)?;

    fixup_prologs(heap, hmodule, segnum)?;

    if !seg.has(SegmentFlags::RELOC_DATA) {
        return Ok(());
    }
    let count = match peek_u16(image, pos + size) {
        Some(0) | None => return Ok(()),
        Some(n) => n as usize,
    };
    let records = image
        .get(pos + size + 2..pos + size + 2 + count * RELOC_SIZE)
        .and_then(|data| parse_relocs(data, count))
        .ok_or_else(|| {
            KernelError::BadFormat(format!("{}: relocations of segment {} truncated", name, segnum))
        })?;
    apply_relocations(heap, hmodule, segnum, &records)
}

/// Patch the standard prolog of exported far functions so they pick up the
/// right data segment.
pub fn fixup_prologs(heap: &mut GlobalHeap, hmodule: u16, segnum: u16) -> Result<()> {
    let module = get_module(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    let mut seg = module
        .seg(segnum)
        .ok_or_else(|| KernelError::BadFormat(format!("segment {} out of range", segnum)))?;
    if seg.has(SegmentFlags::DATA) {
        seg.flags |= SegmentFlags::LOADED.bits();
        return store_seg(heap, hmodule, segnum, &seg);
    }
    let dgroup = match module.autodata() {
        0 => return Ok(()),
        n => match module.seg(n).map(|s| handle_to_sel(s.hseg)) {
            Some(sel) if sel != 0 => sel,
            _ => return Ok(()),
        },
    };
    let multiple = module.has(ModuleFlags::MULTIPLEDATA);
    let sel = handle_to_sel(seg.hseg);
    let entries: Vec<_> = module
        .entries()
        .into_iter()
        .filter(|e| e.segnum as u16 == segnum)
        .collect();

    for e in entries {
        let at = make_segptr(sel, e.offset);
        let prolog = match heap.read(at, 3) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if prolog[2] != 0x90 {
            continue;
        }
        let mut word = u16::from_le_bytes([prolog[0], prolog[1]]);
        // push ds; pop ax  becomes  mov ax, ds
        if word == 0x581e {
            word = 0xd88c;
            heap.write_word(at, word)?;
        }
        if word != 0xd88c {
            continue;
        }
        if e.flags & ENTRY_SHARED_DATA != 0 {
            let [lo, hi] = dgroup.to_le_bytes();
            heap.write(at, [0xb8, lo, hi])?;
        } else if multiple && e.flags & ENTRY_EXPORTED != 0 {
            heap.write_word(at, 0x9090)?;
        }
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DllInitParams {
    pub hinstance: u16,
    pub ds: u16,
    pub heap: u16,
}

/// Instance, data segment and heap size handed to a library's init code.
pub fn dll_init_params(heap: &GlobalHeap, hmodule: u16) -> DllInitParams {
    let module = match get_module(heap, hmodule) {
        Some(m) => m,
        None => return DllInitParams::default(),
    };
    let (ds, local_heap) = if !module.has(ModuleFlags::SINGLEDATA) {
        if module.has(ModuleFlags::MULTIPLEDATA) || module.autodata() != 0 {
            error!("library {} is not marked SINGLEDATA", module.name());
        }
        (0, 0)
    } else {
        match module.autodata() {
            0 => (0, 0),
            n => (
                module.seg(n).map(|s| handle_to_sel(s.hseg)).unwrap_or(0),
                module.heap(),
            ),
        }
    };
    DllInitParams {
        hinstance: if ds != 0 { heap.handle(ds) } else { module.self_handle() },
        ds,
        heap: local_heap,
    }
}

/// Segment allocator exported to self-loading modules. Returns the handle in the
/// low word and the selector in the high word.
pub fn my_alloc(heap: &mut GlobalHeap, owner: u16, flags: u16, size: u16, elem: u16) -> u32 {
    let bytes = (size as u32) << elem;
    let mut hmem = 0;
    if bytes != 0 || flags & SegmentFlags::MOVEABLE.bits() != 0 {
        hmem = heap.alloc(ne2mem_flags(flags), bytes, owner);
    }
    if flags & 7 != SegmentFlags::DATA.bits()
        && flags & 7 != (SegmentFlags::DATA | SegmentFlags::ALLOCATED | SegmentFlags::LOADED).bits()
        && hmem != 0
    {
        let sel = handle_to_sel(hmem);
        let access = heap.ldt().access(sel).unwrap_or(SegmentAccess::DATA);
        if let Err(e) = heap.ldt_mut().set_access(sel, access | SegmentAccess::EXECUTABLE) {
            warn!("cannot mark {:#06x} as code: {}", sel, e);
        }
    }
    if bytes != 0 {
        ((handle_to_sel(hmem) as u32) << 16) | hmem as u32
    } else {
        (hmem as u32) << 16
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::MemoryConfig,
        ne::{
            builder::NeBuilder,
            module::build_module,
            reloc::{RelocRecord, ADDR_SELECTOR},
        },
    };

    fn load_all(image: &[u8]) -> (GlobalHeap, u16) {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let h = build_module(&mut heap, image, "T.EXE").unwrap();
        create_all_segments(&mut heap, h).unwrap();
        let cseg = get_module(&heap, h).unwrap().cseg();
        for n in 1..=cseg {
            load_segment(&mut heap, h, n, image).unwrap();
        }
        (heap, h)
    }

    #[test]
    fn test_segment_sizes_and_flags() {
        let mut b = NeBuilder::new("T");
        let code = b.code_segment(vec![0xcb; 8]);
        let data = b.data_segment(vec![7; 4], 0x100);
        b.entry(code, 0).stack(data, 0x400).heap(0x200);
        let (heap, h) = load_all(&b.build());
        let module = get_module(&heap, h).unwrap();
        let dseg = module.seg(data).unwrap();
        assert!(dseg.has(SegmentFlags::ALLOCATED | SegmentFlags::LOADED));
        assert!(heap.size(dseg.hseg) >= 0x100 + 0x1400 + 0x200);
        assert_eq!(heap.owner(dseg.hseg), h);
        assert_eq!(module.instance(), dseg.hseg);
        assert_eq!(module.dgroup_entry(), module.segtab() + SEG_ENTRY_SIZE);
        let cseg = module.seg(code).unwrap();
        assert_eq!(cseg.hseg & 1, 0, "code segments are moveable");
        assert!(heap.ldt().access(handle_to_sel(cseg.hseg)).unwrap().is_code());
        assert_eq!(
            heap.read(make_segptr(handle_to_sel(dseg.hseg), 0), 5).unwrap(),
            vec![7, 7, 7, 7, 0]
        );
    }

    #[test]
    fn test_iterated_and_relocated() {
        let mut b = NeBuilder::new("T");
        let code = b.code_segment(vec![0, 0, 0xff, 0xff]);
        let data = b.iterated_segment(&[(3, b"ab"), (2, b"z")], 0x20);
        b.reloc(code, RelocRecord::internal(ADDR_SELECTOR, 2, data, 0));
        let (heap, h) = load_all(&b.build());
        let module = get_module(&heap, h).unwrap();
        let dsel = handle_to_sel(module.seg(data).unwrap().hseg);
        let csel = handle_to_sel(module.seg(code).unwrap().hseg);
        assert_eq!(heap.read(make_segptr(dsel, 0), 9).unwrap(), b"abababzz\0".to_vec());
        assert_eq!(heap.read_word(make_segptr(csel, 2)).unwrap(), dsel);
    }

    #[test]
    fn test_prolog_fixups() {
        // three exported far functions starting with push ds; pop ax; nop
        let prolog = [0x1e, 0x58, 0x90, 0xcb];
        let mut b = NeBuilder::new("T");
        let code = b.code_segment(prolog.repeat(3));
        let data = b.data_segment(vec![0; 0x10], 0x10);
        b.entry(code, 0).stack(data, 0x100);
        b.entry_point(1, code, 0, ENTRY_EXPORTED)
            .entry_point(2, code, 4, ENTRY_EXPORTED | ENTRY_SHARED_DATA)
            .entry_point(3, code, 8, 0);
        let (heap, h) = load_all(&b.build());
        let module = get_module(&heap, h).unwrap();
        let csel = handle_to_sel(module.seg(code).unwrap().hseg);
        let dsel = handle_to_sel(module.seg(data).unwrap().hseg);
        let bytes = heap.read(make_segptr(csel, 0), 12).unwrap();
        assert_eq!(&bytes[0..3], &[0x90, 0x90, 0x90]);
        assert_eq!(&bytes[4..7], &[0xb8, dsel as u8, (dsel >> 8) as u8]);
        assert_eq!(&bytes[8..11], &[0x8c, 0xd8, 0x90]);
    }

    #[test]
    fn test_second_instance_reallocates_dgroup() {
        let mut b = NeBuilder::new("T");
        let code = b.code_segment(vec![0xcb]);
        let data = b.data_segment(vec![1, 2], 0x10);
        b.entry(code, 0).stack(data, 0x100);
        let image = b.build();
        let (mut heap, h) = load_all(&image);
        let first = get_module(&heap, h).unwrap().instance();
        let code_before = get_module(&heap, h).unwrap().seg(code).unwrap().hseg;
        create_segment(&mut heap, h, data).unwrap();
        load_segment(&mut heap, h, data, &image).unwrap();
        let module = get_module(&heap, h).unwrap();
        assert_ne!(module.instance(), first);
        assert_eq!(module.seg(code).unwrap().hseg, code_before);
        assert_eq!(
            heap.read(make_segptr(handle_to_sel(module.instance()), 0), 2).unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_dll_init_params() {
        let mut b = NeBuilder::new("L");
        b.lib(true);
        b.code_segment(vec![0xcb]);
        b.data_segment(vec![0; 4], 0x10);
        b.heap(0x400);
        let (heap, h) = load_all(&b.build());
        let p = dll_init_params(&heap, h);
        assert_eq!(p.heap, 0x400);
        assert_eq!(heap.handle(p.ds), p.hinstance);
        assert_eq!(p.hinstance, get_module(&heap, h).unwrap().instance());

        let mut b = NeBuilder::new("N");
        b.lib(true);
        b.code_segment(vec![0xcb]);
        let (heap, h) = load_all(&b.build());
        let p = dll_init_params(&heap, h);
        assert_eq!((p.ds, p.heap, p.hinstance), (0, 0, h));
    }

    #[test]
    fn test_my_alloc() {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let code = my_alloc(&mut heap, 1, SegmentFlags::MOVEABLE.bits(), 0x10, 4);
        let h = code as u16;
        assert_eq!((code >> 16) as u16, handle_to_sel(h));
        assert!(heap.size(h) >= 0x100);
        assert!(heap.ldt().access(handle_to_sel(h)).unwrap().is_code());
        let data = my_alloc(&mut heap, 1, SegmentFlags::DATA.bits(), 0x10, 0);
        assert!(!heap.ldt().access((data >> 16) as u16).unwrap().is_code());
        let empty = my_alloc(&mut heap, 1, SegmentFlags::MOVEABLE.bits(), 0, 0);
        assert_eq!(empty as u16, 0);
        assert_ne!(empty >> 16, 0);
    }
}
