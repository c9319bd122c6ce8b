//! Segment fixups.

use byteorder::{ByteOrder, LittleEndian};
use log::{error, trace, warn};
use serde::Serialize;

use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalHeap},
    ne::module::{get_module, get_ordinal},
    utils::{hiword, loword, make_segptr, SegPtr},
};

pub const RELOC_SIZE: usize = 8;

pub const ADDR_LOBYTE: u8 = 0;
pub const ADDR_SELECTOR: u8 = 2;
pub const ADDR_POINTER32: u8 = 3;
pub const ADDR_OFFSET16: u8 = 5;
pub const ADDR_POINTER48: u8 = 11;
pub const ADDR_OFFSET32: u8 = 13;

pub const RELOC_INTERNALREF: u8 = 0;
pub const RELOC_IMPORTORDINAL: u8 = 1;
pub const RELOC_IMPORTNAME: u8 = 2;
pub const RELOC_OSFIXUP: u8 = 3;
pub const RELOC_ADDITIVE: u8 = 4;

/// Internal references with this segment number go through the entry table.
pub const MOVEABLE_SEGMENT: u16 = 0xff;
/// Filled in for imports that cannot be resolved.
pub const UNRESOLVED_IMPORT: SegPtr = 0xdead_beef;
const CHAIN_END: u16 = 0xffff;
const MAX_CHAIN: usize = 0x8000;

#[derive(Serialize, Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RelocRecord {
    pub address_type: u8,
    pub relocation_type: u8,
    pub offset: u16,
    pub target1: u16,
    pub target2: u16,
}

impl RelocRecord {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let b = data.get(..RELOC_SIZE)?;
        Some(Self {
            address_type: b[0],
            relocation_type: b[1],
            offset: u16::from_le_bytes([b[2], b[3]]),
            target1: u16::from_le_bytes([b[4], b[5]]),
            target2: u16::from_le_bytes([b[6], b[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; RELOC_SIZE] {
        let mut b = [0u8; RELOC_SIZE];
        b[0] = self.address_type;
        b[1] = self.relocation_type;
        b[2..4].copy_from_slice(&self.offset.to_le_bytes());
        b[4..6].copy_from_slice(&self.target1.to_le_bytes());
        b[6..8].copy_from_slice(&self.target2.to_le_bytes());
        b
    }

    /// Reference to `segnum:target_offset` inside the same module.
    pub fn internal(address_type: u8, offset: u16, segnum: u16, target_offset: u16) -> Self {
        Self {
            address_type,
            relocation_type: RELOC_INTERNALREF,
            offset,
            target1: segnum,
            target2: target_offset,
        }
    }

    /// Import by ordinal; `module` is the 1-based module reference.
    pub fn import_ordinal(address_type: u8, offset: u16, module: u16, ordinal: u16) -> Self {
        Self {
            address_type,
            relocation_type: RELOC_IMPORTORDINAL,
            offset,
            target1: module,
            target2: ordinal,
        }
    }

    /// Import by name; `name` is an offset into the imported names table.
    pub fn import_name(address_type: u8, offset: u16, module: u16, name: u16) -> Self {
        Self {
            address_type,
            relocation_type: RELOC_IMPORTNAME,
            offset,
            target1: module,
            target2: name,
        }
    }

    pub fn additive(mut self) -> Self {
        self.relocation_type |= RELOC_ADDITIVE;
        self
    }

    pub fn is_additive(&self) -> bool {
        self.relocation_type & RELOC_ADDITIVE != 0
    }
}

pub fn parse_relocs(data: &[u8], count: usize) -> Option<Vec<RelocRecord>> {
    (0..count)
        .map(|i| RelocRecord::parse(data.get(i * RELOC_SIZE..)?))
        .collect()
}

/// Resolve the target of `rep`; `None` for records that need no patching.
fn resolve(heap: &GlobalHeap, hmodule: u16, rep: &RelocRecord) -> Result<Option<SegPtr>> {
    let module = get_module(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    let import_target = |what: &str, hmod: u16, ordinal: u16| -> SegPtr {
        let address = get_module(heap, hmod)
            .map(|m| m.entry_point(ordinal))
            .unwrap_or(0);
        if address != 0 {
            return address;
        }
        match get_module(heap, hmod) {
            None => warn!(
                "{}: module {:#06x} not found for {}",
                module.name(),
                hmod,
                what
            ),
            Some(m) => error!(
                "{}: no implementation for {}.{} ({}), using {:#x}",
                module.name(),
                m.name(),
                ordinal,
                what,
                UNRESOLVED_IMPORT
            ),
        }
        UNRESOLVED_IMPORT
    };

    let address = match rep.relocation_type & 3 {
        RELOC_IMPORTORDINAL => {
            if rep.target1 == 0 || rep.target1 > module.cmod() {
                return Err(KernelError::BadFormat(format!(
                    "{}: module reference {} out of range",
                    module.name(),
                    rep.target1
                )));
            }
            let hmod = module.modref(rep.target1 - 1);
            import_target("ordinal import", hmod, rep.target2)
        }
        RELOC_IMPORTNAME => {
            if rep.target1 == 0 || rep.target1 > module.cmod() {
                return Err(KernelError::BadFormat(format!(
                    "{}: module reference {} out of range",
                    module.name(),
                    rep.target1
                )));
            }
            let hmod = module.modref(rep.target1 - 1);
            let name = module.imported_name(rep.target2).unwrap_or_default();
            let ordinal = get_ordinal(heap, hmod, &name);
            import_target(&name, hmod, ordinal)
        }
        RELOC_INTERNALREF => {
            if rep.target1 == MOVEABLE_SEGMENT {
                module.entry_point(rep.target2)
            } else {
                let seg = module.seg(rep.target1).ok_or_else(|| {
                    KernelError::BadFormat(format!(
                        "{}: internal reference to segment {}",
                        module.name(),
                        rep.target1
                    ))
                })?;
                make_segptr(handle_to_sel(seg.hseg), rep.target2)
            }
        }
        _ => {
            trace!("{}: skipping OS fixup {:?}", module.name(), rep);
            return Ok(None);
        }
    };
    Ok(Some(address))
}

fn unknown(rep: &RelocRecord) -> KernelError {
    KernelError::BadFormat(format!(
        "unknown relocation address type {} (type {}, offset {:#06x}, target {:04x} {:04x})",
        rep.address_type, rep.relocation_type, rep.offset, rep.target1, rep.target2
    ))
}

fn patch_additive(heap: &mut GlobalHeap, sel: u16, rep: &RelocRecord, address: SegPtr) -> Result<()> {
    let at = make_segptr(sel, rep.offset);
    match rep.address_type & 0x7f {
        ADDR_LOBYTE => {
            let b = heap.read(at, 1)?[0];
            heap.write(at, [b.wrapping_add(address as u8)])?;
        }
        ADDR_OFFSET16 => {
            let w = heap.read_word(at)?;
            heap.write_word(at, w.wrapping_add(loword(address)))?;
        }
        ADDR_POINTER32 => {
            let w = heap.read_word(at)?;
            heap.write_word(at, w.wrapping_add(loword(address)))?;
            heap.write_word(make_segptr(sel, rep.offset.wrapping_add(2)), hiword(address))?;
        }
        ADDR_SELECTOR => {
            // some linkers emit additive selector fixups against a zero word
            let w = heap.read_word(at)?;
            if w != 0 {
                error!("additive selector fixup at {:04x}:{:04x} over {:#06x}", sel, rep.offset, w);
            } else {
                heap.write_word(at, hiword(address))?;
            }
        }
        ADDR_OFFSET32 => {
            let d = LittleEndian::read_u32(&heap.read(at, 4)?);
            heap.write(at, d.wrapping_add(loword(address) as u32).to_le_bytes())?;
        }
        ADDR_POINTER48 => {
            let d = LittleEndian::read_u32(&heap.read(at, 4)?);
            heap.write(at, d.wrapping_add(loword(address) as u32).to_le_bytes())?;
            heap.write_word(make_segptr(sel, rep.offset.wrapping_add(4)), hiword(address))?;
        }
        _ => return Err(unknown(rep)),
    }
    Ok(())
}

/// Walk the chain of patch sites threaded through the segment image.
fn patch_chain(
    heap: &mut GlobalHeap,
    sel: u16,
    seg_size: u32,
    rep: &RelocRecord,
    address: SegPtr,
) -> Result<()> {
    let mut offset = rep.offset;
    for _ in 0..MAX_CHAIN {
        let at = make_segptr(sel, offset);
        let next = heap.read_word(at)?;
        match rep.address_type & 0x7f {
            ADDR_LOBYTE => heap.write(at, [address as u8])?,
            ADDR_OFFSET16 => heap.write_word(at, loword(address))?,
            ADDR_POINTER32 => heap.write(at, address.to_le_bytes())?,
            ADDR_SELECTOR => heap.write_word(at, hiword(address))?,
            ADDR_OFFSET32 => heap.write(at, (loword(address) as u32).to_le_bytes())?,
            ADDR_POINTER48 => {
                heap.write(at, (loword(address) as u32).to_le_bytes())?;
                heap.write_word(make_segptr(sel, offset.wrapping_add(4)), hiword(address))?;
            }
            _ => return Err(unknown(rep)),
        }
        if next == offset || next as u32 >= seg_size || next == CHAIN_END {
            return Ok(());
        }
        offset = next;
    }
    warn!("relocation chain in {:#06x} did not terminate", sel);
    Ok(())
}

/// Apply `records` to segment `segnum` of `hmodule`.
pub fn apply_relocations(
    heap: &mut GlobalHeap,
    hmodule: u16,
    segnum: u16,
    records: &[RelocRecord],
) -> Result<()> {
    let hseg = get_module(heap, hmodule)
        .and_then(|m| m.seg(segnum))
        .map(|s| s.hseg)
        .ok_or(KernelError::InvalidHandle(hmodule))?;
    let sel = handle_to_sel(hseg);
    let seg_size = heap.size(hseg);

    for rep in records {
        let address = match resolve(heap, hmodule, rep)? {
            Some(a) => a,
            None => continue,
        };
        trace!(
            "fixup {:04x}:{:04x} type {}/{} -> {:08x}",
            sel,
            rep.offset,
            rep.address_type,
            rep.relocation_type,
            address
        );
        if rep.is_additive() {
            patch_additive(heap, sel, rep, address)?;
        } else {
            patch_chain(heap, sel, seg_size, rep, address)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::MemoryConfig,
        global::GlobalFlags,
        ne::{builder::NeBuilder, module::build_module},
    };

    /// A module whose code segment is allocated and filled with `code`.
    fn setup(code: Vec<u8>) -> (GlobalHeap, u16, u16) {
        let mut b = NeBuilder::new("FIX");
        b.lib(true);
        let seg1 = b.code_segment(code.clone());
        let seg2 = b.code_segment(vec![0; 0x10]);
        b.export("TARGET", 3, seg2, 0x0008);
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let h = build_module(&mut heap, &b.build(), "FIX.DLL").unwrap();
        for n in [seg1, seg2] {
            let hseg = heap.alloc(GlobalFlags::FIXED, 0x40, h);
            let mut m = crate::ne::module::get_module_mut(&mut heap, h).unwrap();
            let mut seg = m.seg(n).unwrap();
            seg.hseg = hseg;
            m.set_seg(n, &seg);
        }
        let sel = handle_to_sel(get_module(&heap, h).unwrap().seg(seg1).unwrap().hseg);
        heap.write(make_segptr(sel, 0), &code).unwrap();
        (heap, h, sel)
    }

    fn seg2_sel(heap: &GlobalHeap, h: u16) -> u16 {
        handle_to_sel(get_module(heap, h).unwrap().seg(2).unwrap().hseg)
    }

    #[test]
    fn test_chain() {
        // sites at 0, 4 and 8 linked through their contents
        let code = vec![4, 0, 0, 0, 8, 0, 0, 0, 0xff, 0xff, 0, 0];
        let (mut heap, h, sel) = setup(code);
        let rep = RelocRecord::internal(ADDR_SELECTOR, 0, 2, 0);
        apply_relocations(&mut heap, h, 1, &[rep]).unwrap();
        let target = seg2_sel(&heap, h);
        for off in [0, 4, 8] {
            assert_eq!(heap.read_word(make_segptr(sel, off)).unwrap(), target);
        }
    }

    #[test]
    fn test_self_loop_terminates() {
        let code = vec![2, 0, 2, 0];
        let (mut heap, h, sel) = setup(code);
        let rep = RelocRecord::internal(ADDR_OFFSET16, 2, 2, 0x1234);
        apply_relocations(&mut heap, h, 1, &[rep]).unwrap();
        assert_eq!(heap.read_word(make_segptr(sel, 2)).unwrap(), 0x1234);
        assert_eq!(heap.read_word(make_segptr(sel, 0)).unwrap(), 2);
    }

    #[test]
    fn test_additive_and_entry_table() {
        let code = vec![0x10, 0, 0, 0, 0xff, 0xff, 0xff, 0xff];
        let (mut heap, h, sel) = setup(code);
        let add = RelocRecord::internal(ADDR_OFFSET16, 0, MOVEABLE_SEGMENT, 3).additive();
        let far = RelocRecord::internal(ADDR_POINTER32, 4, MOVEABLE_SEGMENT, 3);
        apply_relocations(&mut heap, h, 1, &[add, far]).unwrap();
        assert_eq!(heap.read_word(make_segptr(sel, 0)).unwrap(), 0x18);
        let target = seg2_sel(&heap, h);
        assert_eq!(
            heap.read(make_segptr(sel, 4), 4).unwrap(),
            make_segptr(target, 8).to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_wide_fixups() {
        let code = vec![0xff; 12];
        let (mut heap, h, sel) = setup(code);
        let p48 = RelocRecord::internal(ADDR_POINTER48, 0, 2, 0x20);
        let o32 = RelocRecord::internal(ADDR_OFFSET32, 6, 2, 0x30);
        apply_relocations(&mut heap, h, 1, &[p48, o32]).unwrap();
        let target = seg2_sel(&heap, h);
        let bytes = heap.read(make_segptr(sel, 0), 10).unwrap();
        assert_eq!(&bytes[0..4], &[0x20, 0, 0, 0]);
        assert_eq!(&bytes[4..6], &target.to_le_bytes());
        assert_eq!(&bytes[6..10], &[0x30, 0, 0, 0]);
    }

    #[test]
    fn test_wide_additive_fixups() {
        let code = vec![0x04, 0, 1, 0, 0, 0, 0x02, 0, 0, 0];
        let (mut heap, h, sel) = setup(code);
        let p48 = RelocRecord::internal(ADDR_POINTER48, 0, 2, 0x20).additive();
        let o32 = RelocRecord::internal(ADDR_OFFSET32, 6, 2, 0xfffe).additive();
        apply_relocations(&mut heap, h, 1, &[p48, o32]).unwrap();
        let target = seg2_sel(&heap, h);
        let bytes = heap.read(make_segptr(sel, 0), 10).unwrap();
        assert_eq!(&bytes[0..4], &[0x24, 0, 1, 0]);
        assert_eq!(&bytes[4..6], &target.to_le_bytes());
        assert_eq!(&bytes[6..10], &[0, 0, 1, 0]);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let (mut heap, h, _) = setup(vec![0; 4]);
        let bad = RelocRecord::internal(7, 0, 2, 0);
        assert!(apply_relocations(&mut heap, h, 1, &[bad]).is_err());
        let import = RelocRecord::import_ordinal(ADDR_OFFSET16, 0, 4, 1);
        assert!(apply_relocations(&mut heap, h, 1, &[import]).is_err());
    }
}
