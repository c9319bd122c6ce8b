//! The in-memory module block.
//!
//! A loaded module lives in one fixed global block owned by itself. The block
//! starts with a copy of the file header, some fields of which are reused for
//! runtime state, followed by the tables the loader keeps resident.

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags, GlobalHeap},
    ne::{
        entry::build_bundle_data,
        header::{read_header, DiskSegment, DISK_SEGMENT_SIZE, IMAGE_OS2_SIGNATURE, NE_HEADER_SIZE},
    },
    utils::{atoi, basename, c_str, eq_ignore_case, pascal_str, peek_u16, peek_u32, SegPtr},
};

pub const NE_MODULE_SIZE: u16 = 0x44;
pub const SEG_ENTRY_SIZE: u16 = 10;
/// Fixed part of the loaded-file record preceding the path.
pub const OFSTRUCT_HEADER: u16 = 8;
/// Applications get at least this much stack.
pub const MIN_APP_STACK: u16 = 0x1400;
/// Set on a module while its DLL attach walk is in progress.
pub const FLAGSOTHERS_VISITING: u8 = 0x80;

const OFF_MAGIC: usize = 0x00;
const OFF_FLAGS: usize = 0x0c;
const OFF_CSIP: usize = 0x14;
const OFF_SSSP: usize = 0x18;
const OFF_NRESTAB: usize = 0x2c;
const OFF_EXETYP: usize = 0x36;
const OFF_FLAGSOTHERS: usize = 0x37;

bitflags! {
    pub struct ModuleFlags: u16 {
        const SINGLEDATA = 0x0001;
        const MULTIPLEDATA = 0x0002;
        const WIN32 = 0x0010;
        const BUILTIN = 0x0020;
        const FRAMEBUF = 0x0100;
        const CONSOLE = 0x0200;
        const GUI = 0x0300;
        const SELFLOAD = 0x0800;
        const LINKERROR = 0x2000;
        const CALLWEP = 0x4000;
        const LIBMODULE = 0x8000;
    }
}

bitflags! {
    pub struct SegmentFlags: u16 {
        const DATA = 0x0001;
        const ALLOCATED = 0x0002;
        const LOADED = 0x0004;
        const ITERATED = 0x0008;
        const MOVEABLE = 0x0010;
        const SHAREABLE = 0x0020;
        const PRELOAD = 0x0040;
        const READONLY = 0x0080;
        const RELOC_DATA = 0x0100;
        const SELFLOAD = 0x0800;
        const DISCARDABLE = 0x1000;
        const BIT32 = 0x2000;
    }
}

/// A resident segment table entry: the file entry plus the segment's handle.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SegEntry {
    pub filepos: u16,
    pub size: u16,
    pub flags: u16,
    pub minsize: u16,
    pub hseg: u16,
}

impl SegEntry {
    pub fn has(&self, flags: SegmentFlags) -> bool {
        self.flags & flags.bits() == flags.bits()
    }

    /// Bytes the segment needs, a zero `minsize` meaning 64K.
    pub fn min_alloc(&self) -> u32 {
        if self.minsize == 0 {
            0x10000
        } else {
            self.minsize as u32
        }
    }
}

/// Typed view over the bytes of a module block.
pub struct NeModule<B> {
    data: B,
}

/// Word accessors for a typed view with `word`/`set_word` helpers.
macro_rules! word_fields {
    ($ty:ident; $($get:ident, $set:ident, $off:expr;)*) => {
        impl<B: AsRef<[u8]>> $ty<B> {
            $(pub fn $get(&self) -> u16 {
                self.word($off)
            })*
        }

        impl<B: AsRef<[u8]> + AsMut<[u8]>> $ty<B> {
            $(pub fn $set(&mut self, v: u16) {
                self.set_word($off, v)
            })*
        }
    };
}

pub(crate) use word_fields;

word_fields! {
    NeModule;
    count, set_count, 0x02;
    enttab, set_enttab, 0x04;
    next, set_next, 0x06;
    dgroup_entry, set_dgroup_entry, 0x08;
    fileinfo, set_fileinfo, 0x0a;
    autodata, set_autodata, 0x0e;
    heap, set_heap, 0x10;
    stack, set_stack, 0x12;
    cseg, set_cseg, 0x1c;
    cmod, set_cmod, 0x1e;
    cbnrestab, set_cbnrestab, 0x20;
    segtab, set_segtab, 0x22;
    rsrctab, set_rsrctab, 0x24;
    restab, set_restab, 0x26;
    modtab, set_modtab, 0x28;
    imptab, set_imptab, 0x2a;
    cmovent, set_cmovent, 0x30;
    align, set_align, 0x32;
    cres, set_cres, 0x34;
    dlls_to_init, set_dlls_to_init, 0x38;
    nrname_handle, set_nrname_handle, 0x3a;
    swaparea, set_swaparea, 0x3c;
    expver, set_expver, 0x3e;
    self_handle, set_self_handle, 0x40;
    self_loading_sel, set_self_loading_sel, 0x42;
}

impl<B: AsRef<[u8]>> NeModule<B> {
    pub fn new(data: B) -> Option<Self> {
        let bytes = data.as_ref();
        if bytes.len() < NE_MODULE_SIZE as usize || peek_u16(bytes, OFF_MAGIC)? != IMAGE_OS2_SIGNATURE
        {
            return None;
        }
        Some(Self { data })
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub(crate) fn word(&self, off: usize) -> u16 {
        peek_u16(self.bytes(), off).unwrap_or(0)
    }

    pub(crate) fn byte(&self, off: usize) -> u8 {
        self.bytes().get(off).copied().unwrap_or(0)
    }

    pub fn raw_flags(&self) -> u16 {
        self.word(OFF_FLAGS)
    }

    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags::from_bits_truncate(self.raw_flags())
    }

    pub fn has(&self, flags: ModuleFlags) -> bool {
        self.raw_flags() & flags.bits() == flags.bits()
    }

    pub fn is_win32(&self) -> bool {
        self.has(ModuleFlags::WIN32)
    }

    pub fn is_lib(&self) -> bool {
        self.has(ModuleFlags::LIBMODULE)
    }

    pub fn csip(&self) -> SegPtr {
        peek_u32(self.bytes(), OFF_CSIP).unwrap_or(0)
    }

    pub fn sssp(&self) -> SegPtr {
        peek_u32(self.bytes(), OFF_SSSP).unwrap_or(0)
    }

    pub fn nrestab(&self) -> u32 {
        peek_u32(self.bytes(), OFF_NRESTAB).unwrap_or(0)
    }

    pub fn exetyp(&self) -> u8 {
        self.byte(OFF_EXETYP)
    }

    pub fn flagsothers(&self) -> u8 {
        self.byte(OFF_FLAGSOTHERS)
    }

    /// Segment `segnum`, counted from 1.
    pub fn seg(&self, segnum: u16) -> Option<SegEntry> {
        if segnum == 0 || segnum > self.cseg() {
            return None;
        }
        let off = self.segtab() as usize + (segnum as usize - 1) * SEG_ENTRY_SIZE as usize;
        let b = self.bytes();
        Some(SegEntry {
            filepos: peek_u16(b, off)?,
            size: peek_u16(b, off + 2)?,
            flags: peek_u16(b, off + 4)?,
            minsize: peek_u16(b, off + 6)?,
            hseg: peek_u16(b, off + 8)?,
        })
    }

    pub fn segments(&self) -> Vec<SegEntry> {
        (1..=self.cseg()).filter_map(|n| self.seg(n)).collect()
    }

    /// The module name, the first resident name.
    pub fn name(&self) -> String {
        pascal_str(self.bytes(), self.restab() as usize)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default()
    }

    /// Path the module was loaded from.
    pub fn file_name(&self) -> String {
        let off = self.fileinfo() as usize;
        if off == 0 {
            return String::new();
        }
        self.bytes()
            .get(off + OFSTRUCT_HEADER as usize..)
            .map(|s| String::from_utf8_lossy(c_str(s)).into_owned())
            .unwrap_or_default()
    }

    /// Handle of the `index`th (0-based) imported module, once imports are bound.
    pub fn modref(&self, index: u16) -> u16 {
        self.word(self.modtab() as usize + index as usize * 2)
    }

    pub fn modrefs(&self) -> Vec<u16> {
        if self.modtab() == 0 {
            return vec![];
        }
        (0..self.cmod()).map(|i| self.modref(i)).collect()
    }

    /// Entry of the imported names table at `off`.
    pub fn imported_name(&self, off: u16) -> Option<String> {
        pascal_str(self.bytes(), self.imptab() as usize + off as usize)
            .map(|s| String::from_utf8_lossy(s).into_owned())
    }

    /// Instance handle: the DGROUP segment if the module has one, else the module.
    pub fn instance(&self) -> u16 {
        match self.autodata() {
            0 => self.self_handle(),
            n => self.seg(n).map(|s| s.hseg).unwrap_or(0),
        }
    }

    pub fn resident_names(&self) -> Vec<(String, u16)> {
        name_table(&self.bytes()[self.restab() as usize..])
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NeModule<B> {
    pub(crate) fn set_word(&mut self, off: usize, v: u16) {
        if let Some(b) = self.data.as_mut().get_mut(off..off + 2) {
            b.copy_from_slice(&v.to_le_bytes());
        }
    }

    pub(crate) fn set_byte(&mut self, off: usize, v: u8) {
        if let Some(b) = self.data.as_mut().get_mut(off) {
            *b = v;
        }
    }

    pub(crate) fn set_dword(&mut self, off: usize, v: u32) {
        if let Some(b) = self.data.as_mut().get_mut(off..off + 4) {
            b.copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn set_raw_flags(&mut self, flags: u16) {
        self.set_word(OFF_FLAGS, flags)
    }

    pub fn insert_flags(&mut self, flags: ModuleFlags) {
        let f = self.raw_flags() | flags.bits();
        self.set_raw_flags(f)
    }

    pub fn remove_flags(&mut self, flags: ModuleFlags) {
        let f = self.raw_flags() & !flags.bits();
        self.set_raw_flags(f)
    }

    pub fn set_csip(&mut self, v: SegPtr) {
        self.set_dword(OFF_CSIP, v)
    }

    pub fn set_sssp(&mut self, v: SegPtr) {
        self.set_dword(OFF_SSSP, v)
    }

    pub fn set_flagsothers(&mut self, v: u8) {
        self.set_byte(OFF_FLAGSOTHERS, v)
    }

    pub fn set_seg(&mut self, segnum: u16, seg: &SegEntry) {
        if segnum == 0 || segnum > self.cseg() {
            return;
        }
        let off = self.segtab() as usize + (segnum as usize - 1) * SEG_ENTRY_SIZE as usize;
        self.set_word(off, seg.filepos);
        self.set_word(off + 2, seg.size);
        self.set_word(off + 4, seg.flags);
        self.set_word(off + 6, seg.minsize);
        self.set_word(off + 8, seg.hseg);
    }

    pub fn set_modref(&mut self, index: u16, handle: u16) {
        let off = self.modtab() as usize + index as usize * 2;
        self.set_word(off, handle)
    }
}

/// `(name, ordinal)` pairs of a resident or non-resident names table, first entry
/// included.
pub fn name_table(table: &[u8]) -> Vec<(String, u16)> {
    let mut names = vec![];
    let mut p = 0;
    while let Some(name) = pascal_str(table, p) {
        if name.is_empty() {
            break;
        }
        let ordinal = match peek_u16(table, p + 1 + name.len()) {
            Some(o) => o,
            None => break,
        };
        names.push((String::from_utf8_lossy(name).into_owned(), ordinal));
        p += name.len() + 3;
    }
    names
}

fn find_name(table: &[u8], wanted: &[u8]) -> Option<u16> {
    // the first entry names the module itself
    name_table(table)
        .into_iter()
        .skip(1)
        .find(|(name, _)| eq_ignore_case(name.as_bytes(), wanted))
        .map(|(_, ordinal)| ordinal)
}

pub fn get_module(heap: &GlobalHeap, hmodule: u16) -> Option<NeModule<&[u8]>> {
    if hmodule == 0 {
        return None;
    }
    heap.segment(handle_to_sel(hmodule)).ok().and_then(NeModule::new)
}

pub fn get_module_mut(heap: &mut GlobalHeap, hmodule: u16) -> Option<NeModule<&mut [u8]>> {
    if hmodule == 0 {
        return None;
    }
    heap.segment_mut(handle_to_sel(hmodule))
        .ok()
        .and_then(NeModule::new)
}

/// Ordinal exported under `name`, or 0. `#nnn` names the ordinal directly.
pub fn get_ordinal(heap: &GlobalHeap, hmodule: u16, name: &str) -> u16 {
    let module = match get_module(heap, hmodule) {
        Some(m) => m,
        None => return 0,
    };
    if module.is_win32() {
        return 0;
    }
    if let Some(digits) = name.strip_prefix('#') {
        return atoi(digits) as u16;
    }
    let wanted = name.to_ascii_uppercase();
    if let Some(ordinal) = find_name(&module.bytes()[module.restab() as usize..], wanted.as_bytes()) {
        trace!("{}: found {} as ordinal {}", module.name(), name, ordinal);
        return ordinal;
    }
    match module.nrname_handle() {
        0 => 0,
        nrname => heap
            .segment(handle_to_sel(nrname))
            .ok()
            .and_then(|table| find_name(table, wanted.as_bytes()))
            .unwrap_or(0),
    }
}

fn image_slice<'a>(image: &'a [u8], off: usize, len: usize, path: &str) -> Result<&'a [u8]> {
    image
        .get(off..off.saturating_add(len))
        .ok_or_else(|| KernelError::BadFormat(format!("{}: table at {:#x} past end of file", path, off)))
}

/// Build the module block for an NE image and return its handle. The module is
/// not registered yet.
pub fn build_module(heap: &mut GlobalHeap, image: &[u8], path: &str) -> Result<u16> {
    let (lfanew, ne) = read_header(image, path)?;
    let at = |off: u16| lfanew + off as usize;

    let rsrc_size = if ne.rsrctab < ne.restab {
        (ne.restab - ne.rsrctab) as u32
    } else {
        0
    };
    let restab_size = ne.modtab.saturating_sub(ne.restab) as u32;
    let imptab_size = ne.enttab.saturating_sub(ne.imptab) as u32;
    let cbenttab = ne.cbenttab as u32;
    let enttab_cap =
        cbenttab + 6 + 2 * cbenttab.saturating_sub(ne.cmovent as u32 * 6);
    let size = NE_MODULE_SIZE as u32
        + ne.cseg as u32 * SEG_ENTRY_SIZE as u32
        + rsrc_size
        + restab_size
        + ne.cmod as u32 * 2
        + imptab_size
        + enttab_cap
        + OFSTRUCT_HEADER as u32
        + path.len() as u32
        + 1;
    if size > 0xfff0 {
        return Err(KernelError::BadFormat(format!(
            "{}: module tables too large ({:#x} bytes)",
            path, size
        )));
    }

    let mut block = vec![0u8; size as usize];
    block[..NE_HEADER_SIZE].copy_from_slice(&image[lfanew..lfanew + NE_HEADER_SIZE]);
    let mut pos = NE_MODULE_SIZE as usize;

    // segment table, widened by the handle word
    let segtab = pos;
    for i in 0..ne.cseg as usize {
        let raw = image_slice(image, at(ne.segtab) + i * DISK_SEGMENT_SIZE, DISK_SEGMENT_SIZE, path)?;
        if let Some(seg) = DiskSegment::parse(raw) {
            trace!(
                "{}: segment {} at {:#x}, {:#x} bytes, flags {:#06x}",
                path,
                i + 1,
                (seg.filepos as u32).checked_shl(ne.align as u32).unwrap_or(0),
                seg.size,
                seg.flags
            );
        }
        block[pos..pos + DISK_SEGMENT_SIZE].copy_from_slice(raw);
        pos += SEG_ENTRY_SIZE as usize;
    }

    let rsrctab = if rsrc_size > 0 {
        let start = pos;
        let raw = image_slice(image, at(ne.rsrctab), rsrc_size as usize, path)?;
        block[pos..pos + raw.len()].copy_from_slice(raw);
        pos += raw.len();
        start
    } else {
        0
    };

    let restab = pos;
    let raw = image_slice(image, at(ne.restab), restab_size as usize, path)?;
    block[pos..pos + raw.len()].copy_from_slice(raw);
    pos += raw.len();

    let modtab = if ne.cmod > 0 {
        let start = pos;
        let raw = image_slice(image, at(ne.modtab), ne.cmod as usize * 2, path)?;
        block[pos..pos + raw.len()].copy_from_slice(raw);
        pos += raw.len();
        start
    } else {
        0
    };

    let imptab = pos;
    let raw = image_slice(image, at(ne.imptab), imptab_size as usize, path)?;
    block[pos..pos + raw.len()].copy_from_slice(raw);
    pos += raw.len();

    let enttab = pos;
    let raw = image_slice(image, at(ne.enttab), ne.cbenttab as usize, path)?;
    build_bundle_data(raw, &mut block, enttab, enttab + enttab_cap as usize)
        .map_err(|_| KernelError::BadFormat(format!("{}: entry table overflows", path)))?;
    pos += enttab_cap as usize;

    let fileinfo = pos;
    block[pos] = (OFSTRUCT_HEADER as usize + path.len()).min(0xff) as u8;
    block[pos + 1] = 1;
    block[pos + OFSTRUCT_HEADER as usize..pos + OFSTRUCT_HEADER as usize + path.len()]
        .copy_from_slice(path.as_bytes());

    let nrname = if ne.cbnrestab > 0 {
        Some(image_slice(image, ne.nrestab as usize, ne.cbnrestab as usize, path)?.to_vec())
    } else {
        None
    };

    let hmodule = heap.alloc(GlobalFlags::FIXED | GlobalFlags::ZEROINIT, size, 0);
    if hmodule == 0 {
        return Err(KernelError::OutOfMemory(size));
    }
    heap.set_owner(hmodule, hmodule);

    let filled = (|| -> Result<()> {
        let sel = handle_to_sel(hmodule);
        heap.segment_mut(sel)?[..block.len()].copy_from_slice(&block);

        let nrname_handle = match &nrname {
            Some(table) => {
                let h = heap.alloc(GlobalFlags::FIXED, table.len() as u32, hmodule);
                if h == 0 {
                    return Err(KernelError::OutOfMemory(table.len() as u32));
                }
                heap.write(crate::utils::make_segptr(handle_to_sel(h), 0), table)?;
                h
            }
            None => 0,
        };
        let init_size = (ne.cmod as u32 + 1) * 2;
        let dlls_to_init = heap.alloc(GlobalFlags::ZEROINIT, init_size, hmodule);
        if dlls_to_init == 0 {
            return Err(KernelError::OutOfMemory(init_size));
        }

        let mut module = get_module_mut(heap, hmodule)
            .ok_or(KernelError::InvalidHandle(hmodule))?;
        module.set_count(0);
        module.set_next(0);
        module.set_dgroup_entry(0);
        module.set_fileinfo(fileinfo as u16);
        module.set_segtab(segtab as u16);
        module.set_rsrctab(rsrctab as u16);
        module.set_restab(restab as u16);
        module.set_modtab(modtab as u16);
        module.set_imptab(imptab as u16);
        module.set_enttab(enttab as u16);
        module.set_nrname_handle(nrname_handle);
        module.set_dlls_to_init(dlls_to_init);
        module.set_self_handle(hmodule);
        module.set_self_loading_sel(0);
        module.remove_flags(ModuleFlags::BUILTIN | ModuleFlags::WIN32);
        if !module.is_lib() && module.stack() < MIN_APP_STACK {
            module.set_stack(MIN_APP_STACK);
        }
        Ok(())
    })();

    match filled {
        Ok(()) => {
            debug!("built module {:#06x} for {} ({} segments)", hmodule, path, ne.cseg);
            Ok(hmodule)
        }
        Err(e) => {
            warn!("building module for {} failed: {}", path, e);
            heap.free_all(hmodule);
            Err(e)
        }
    }
}

/// Facts about a 32-bit host module needed to stand in for it as a 16-bit one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostModuleInfo {
    pub path: String,
    pub is_dll: bool,
    pub subsystem_major: u8,
    pub subsystem_minor: u8,
}

/// Build the placeholder module registered for a 32-bit module.
pub fn create_dummy_module(heap: &mut GlobalHeap, info: &HostModuleInfo) -> Result<u16> {
    let base = basename(&info.path);
    let name = base.split('.').next().unwrap_or(base);
    if info.path.is_empty() || name.len() > 0xff {
        return Err(KernelError::BadFormat(info.path.clone()));
    }
    let of_size = OFSTRUCT_HEADER as usize + info.path.len() + 1;
    let of_slot = (of_size + 3) & !3;
    let size = NE_MODULE_SIZE as usize + of_slot + 2 * SEG_ENTRY_SIZE as usize + name.len() + 2 + 8;

    let hmodule = heap.alloc(
        GlobalFlags::MOVEABLE | GlobalFlags::ZEROINIT,
        size as u32,
        0,
    );
    if hmodule == 0 {
        return Err(KernelError::OutOfMemory(size as u32));
    }
    heap.set_owner(hmodule, hmodule);

    let mut block = vec![0u8; size];
    let fileinfo = NE_MODULE_SIZE as usize;
    block[fileinfo] = of_size.min(0xff) as u8;
    block[fileinfo + OFSTRUCT_HEADER as usize..fileinfo + OFSTRUCT_HEADER as usize + info.path.len()]
        .copy_from_slice(info.path.as_bytes());
    let segtab = fileinfo + of_slot;
    // DGROUP, then code
    block[segtab + 4..segtab + 6].copy_from_slice(&SegmentFlags::DATA.bits().to_le_bytes());
    block[segtab + 6..segtab + 8].copy_from_slice(&0x1000u16.to_le_bytes());
    let restab = segtab + 2 * SEG_ENTRY_SIZE as usize;
    block[restab] = name.len() as u8;
    block[restab + 1..restab + 1 + name.len()].copy_from_slice(name.as_bytes());
    let tables = restab + name.len() + 2;
    block[..2].copy_from_slice(&IMAGE_OS2_SIGNATURE.to_le_bytes());

    let filled = (|| -> Result<()> {
        heap.segment_mut(handle_to_sel(hmodule))?[..size].copy_from_slice(&block);
        let mut module =
            get_module_mut(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
        module.set_count(1);
        let mut flags = ModuleFlags::WIN32 | ModuleFlags::GUI;
        if info.is_dll {
            flags |= ModuleFlags::LIBMODULE | ModuleFlags::SINGLEDATA;
        }
        module.set_raw_flags(flags.bits());
        module.set_sssp(crate::utils::make_segptr(0, 1));
        module.set_csip(crate::utils::make_segptr(0, 2));
        module.set_cseg(2);
        module.set_fileinfo(fileinfo as u16);
        module.set_segtab(segtab as u16);
        module.set_restab(restab as u16);
        module.set_rsrctab(tables as u16);
        module.set_imptab(tables as u16);
        module.set_enttab(tables as u16);
        module.set_self_handle(hmodule);
        module.set_expver(((info.subsystem_major as u16) << 8) | info.subsystem_minor as u16);
        Ok(())
    })();
    if let Err(e) = filled {
        heap.free_all(hmodule);
        return Err(e);
    }
    debug!("dummy module {:#06x} for {}", hmodule, info.path);
    Ok(hmodule)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::MemoryConfig, ldt::SegmentAccess, ne::builder::NeBuilder};

    fn heap() -> GlobalHeap {
        GlobalHeap::new(&MemoryConfig::default())
    }

    fn sample() -> Vec<u8> {
        let mut b = NeBuilder::new("SAMPLE");
        b.lib(true);
        let code = b.code_segment(vec![0xcb; 0x20]);
        b.export("FIRST", 1, code, 0x10);
        b.export("Second", 2, code, 0x14);
        b.export_nonresident("HIDDEN", 5, code, 0x18);
        b.description("sample library");
        b.build()
    }

    #[test]
    fn test_build_module_layout() {
        let mut heap = heap();
        let h = build_module(&mut heap, &sample(), "C:\\LIB\\SAMPLE.DLL").unwrap();
        assert_eq!(heap.owner(h), h);
        let module = get_module(&heap, h).unwrap();
        assert_eq!(module.name(), "SAMPLE");
        assert_eq!(module.file_name(), "C:\\LIB\\SAMPLE.DLL");
        assert_eq!(module.self_handle(), h);
        assert_eq!(module.count(), 0);
        assert_eq!(module.cseg(), 1);
        assert!(module.is_lib());
        assert!(!module.has(ModuleFlags::BUILTIN));
        let seg = module.seg(1).unwrap();
        assert_eq!(seg.size, 0x20);
        assert_eq!(seg.hseg, 0);
        assert!(module.seg(2).is_none());
        assert_ne!(module.nrname_handle(), 0);
        assert_eq!(heap.owner(module.nrname_handle()), h);
        assert_eq!(heap.owner(module.dlls_to_init()), h);
    }

    #[test]
    fn test_get_ordinal() {
        let mut heap = heap();
        let h = build_module(&mut heap, &sample(), "SAMPLE.DLL").unwrap();
        assert_eq!(get_ordinal(&heap, h, "first"), 1);
        assert_eq!(get_ordinal(&heap, h, "SECOND"), 2);
        assert_eq!(get_ordinal(&heap, h, "hidden"), 5);
        assert_eq!(get_ordinal(&heap, h, "#17"), 17);
        // the module name itself is not an export
        assert_eq!(get_ordinal(&heap, h, "SAMPLE"), 0);
        assert_eq!(get_ordinal(&heap, h, "MISSING"), 0);
    }

    #[test]
    fn test_app_stack_minimum() {
        let mut b = NeBuilder::new("APP");
        let code = b.code_segment(vec![0xcb]);
        let data = b.data_segment(vec![0; 0x10], 0x100);
        b.entry(code, 0).stack(data, 0x200);
        let mut heap = heap();
        let h = build_module(&mut heap, &b.build(), "APP.EXE").unwrap();
        assert_eq!(get_module(&heap, h).unwrap().stack(), MIN_APP_STACK);
    }

    #[test]
    fn test_truncated_image() {
        let mut image = sample();
        let len = image.len();
        image.truncate(len - 8);
        let mut heap = heap();
        let before = heap.entries().len();
        // the non-resident table sits at the very end
        assert!(build_module(&mut heap, &image, "SAMPLE.DLL").is_err());
        assert_eq!(heap.entries().len(), before);
    }

    #[test]
    fn test_out_of_selectors_is_not_a_format_error() {
        let mut heap = heap();
        let mut last = 0;
        while let Ok(sel) = heap.ldt_mut().alloc_block(0, 1, SegmentAccess::DATA) {
            last = sel;
        }
        // room for the module block only
        heap.ldt_mut().free_block(last);
        let err = build_module(&mut heap, &sample(), "SAMPLE.DLL").unwrap_err();
        assert!(matches!(err, KernelError::OutOfMemory(_)));
        assert!(heap.entries().is_empty());
    }

    #[test]
    fn test_dummy_module() {
        let mut heap = heap();
        let h = create_dummy_module(
            &mut heap,
            &HostModuleInfo {
                path: "C:\\WINDOWS\\SYSTEM\\COMCTL32.DLL".into(),
                is_dll: true,
                subsystem_major: 4,
                subsystem_minor: 0,
            },
        )
        .unwrap();
        assert_eq!(h & 1, 0);
        let module = get_module(&heap, h).unwrap();
        assert_eq!(module.name(), "COMCTL32");
        assert!(module.is_win32());
        assert!(module.has(ModuleFlags::LIBMODULE | ModuleFlags::SINGLEDATA));
        assert_eq!(module.count(), 1);
        assert_eq!(module.expver(), 0x0400);
        assert_eq!(module.cseg(), 2);
        assert!(module.seg(1).unwrap().has(SegmentFlags::DATA));
        assert_eq!(module.file_name(), "C:\\WINDOWS\\SYSTEM\\COMCTL32.DLL");
        assert_eq!(get_ordinal(&heap, h, "ANYTHING"), 0);
    }
}
