//! The resource table of a loaded module.
//!
//! ```text
//! shift u16
//! type:  type_id u16, count u16, loader u32       repeated until type_id == 0
//!   name: offset u16, length u16, flags u16, id u16, handle u16, usage u16
//! pascal strings referenced by ids without the 0x8000 tag
//! ```
//!
//! A resource is identified by the offset of its name entry from the start of
//! the module block.

use std::fmt;

use log::{debug, trace, warn};
use serde::Serialize;
use strum::{Display, EnumString, FromRepr};

use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags, GlobalHeap, GMEM_DISCARDED},
    ne::module::{get_module, get_module_mut, NeModule, SegmentFlags},
    utils::{atoi, c_str, eq_ignore_case, make_segptr, peek_u16, peek_u32, SegPtr},
};

pub const TYPEINFO_SIZE: usize = 8;
pub const NAMEINFO_SIZE: usize = 12;
/// Moveable and pure.
pub const RESOURCE_FLAGS_DEFAULT: u16 = 0x0030;
pub const RESOURCE_LOADED: u16 = SegmentFlags::LOADED.bits();
/// Integer ids carry this tag in the table.
pub const INT_ID_TAG: u16 = 0x8000;

#[derive(Display, EnumString, FromRepr, Copy, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum ResourceType {
    Cursor = 1,
    Bitmap = 2,
    Icon = 3,
    Menu = 4,
    Dialog = 5,
    String = 6,
    FontDir = 7,
    Font = 8,
    Accelerator = 9,
    RcData = 10,
    MessageTable = 11,
    GroupCursor = 12,
    GroupIcon = 14,
    NameTable = 15,
    Version = 16,
}

/// A resource type or name: an integer id or a string.
#[derive(Serialize, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResId {
    Int(u16),
    Name(String),
}

impl ResId {
    /// `#123` strings stand for integer ids.
    pub fn normalized(&self) -> ResId {
        match self {
            ResId::Name(s) if s.starts_with('#') => ResId::Int(atoi(&s[1..]) as u16),
            other => other.clone(),
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, ResId::Int(_))
    }
}

impl From<u16> for ResId {
    fn from(id: u16) -> Self {
        ResId::Int(id)
    }
}

impl From<ResourceType> for ResId {
    fn from(t: ResourceType) -> Self {
        ResId::Int(t as u16)
    }
}

impl From<&str> for ResId {
    fn from(s: &str) -> Self {
        ResId::Name(s.to_string()).normalized()
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResId::Int(n) => match ResourceType::from_repr(*n) {
                Some(t) => write!(f, "#{} ({})", n, t),
                None => write!(f, "#{}", n),
            },
            ResId::Name(s) => f.write_str(s),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TypeInfo {
    /// Block offset of the entry.
    pub at: usize,
    pub type_id: u16,
    pub count: u16,
    pub loader: SegPtr,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NameInfo {
    /// Block offset of the entry, the resource handle.
    pub at: usize,
    pub offset: u16,
    pub length: u16,
    pub flags: u16,
    pub id: u16,
    pub handle: u16,
    pub usage: u16,
}

#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct ResourceEntry {
    pub hrsrc: u16,
    pub type_id: ResId,
    pub name: ResId,
    pub file_offset: u32,
    pub size: u32,
    pub flags: u16,
}

impl<B: AsRef<[u8]>> NeModule<B> {
    pub fn res_shift(&self) -> u16 {
        match self.rsrctab() {
            0 => 0,
            tab => self.word(tab as usize),
        }
    }

    pub fn res_types(&self) -> Vec<TypeInfo> {
        let mut out = vec![];
        let tab = self.rsrctab() as usize;
        if tab == 0 {
            return out;
        }
        let mut at = tab + 2;
        while let Some(type_id) = peek_u16(self.bytes(), at) {
            if type_id == 0 {
                break;
            }
            let count = self.word(at + 2);
            out.push(TypeInfo {
                at,
                type_id,
                count,
                loader: peek_u32(self.bytes(), at + 4).unwrap_or(0),
            });
            at += TYPEINFO_SIZE + count as usize * NAMEINFO_SIZE;
        }
        out
    }

    fn name_info_at(&self, at: usize) -> Option<NameInfo> {
        self.bytes().get(at..at + NAMEINFO_SIZE)?;
        Some(NameInfo {
            at,
            offset: self.word(at),
            length: self.word(at + 2),
            flags: self.word(at + 4),
            id: self.word(at + 6),
            handle: self.word(at + 8),
            usage: self.word(at + 10),
        })
    }

    pub fn res_names(&self, ty: &TypeInfo) -> Vec<NameInfo> {
        (0..ty.count as usize)
            .filter_map(|i| self.name_info_at(ty.at + TYPEINFO_SIZE + i * NAMEINFO_SIZE))
            .collect()
    }

    /// The name entry for a resource handle, with its type. Handles that do not
    /// fall exactly on a name entry are rejected.
    pub fn name_info(&self, hrsrc: u16) -> Option<(TypeInfo, NameInfo)> {
        let hrsrc = hrsrc as usize;
        self.res_types().into_iter().find_map(|ty| {
            let first = ty.at + TYPEINFO_SIZE;
            let end = first + ty.count as usize * NAMEINFO_SIZE;
            if hrsrc >= first && hrsrc < end && (hrsrc - first) % NAMEINFO_SIZE == 0 {
                self.name_info_at(hrsrc).map(|ni| (ty, ni))
            } else {
                None
            }
        })
    }

    /// A string id, relative to the start of the table.
    fn res_string(&self, id: u16) -> Option<&[u8]> {
        let at = self.rsrctab() as usize + id as usize;
        let len = *self.bytes().get(at)? as usize;
        self.bytes().get(at + 1..at + 1 + len)
    }

    fn res_id(&self, raw: u16) -> ResId {
        if raw & INT_ID_TAG != 0 {
            ResId::Int(raw & !INT_ID_TAG)
        } else {
            let name = self.res_string(raw).unwrap_or_default();
            ResId::Name(String::from_utf8_lossy(name).into_owned())
        }
    }

    fn res_id_matches(&self, raw: u16, id: &ResId) -> bool {
        match id {
            ResId::Int(n) => raw == (n | INT_ID_TAG),
            ResId::Name(s) => {
                raw & INT_ID_TAG == 0
                    && self
                        .res_string(raw)
                        .map_or(false, |name| eq_ignore_case(name, s.as_bytes()))
            }
        }
    }

    /// Handle of the resource `name` of type `type_id`, 0 if there is none.
    /// `name_table` supplies the raw bytes of a name-table resource when string
    /// ids need to be translated.
    pub fn find_resource(
        &self,
        type_id: &ResId,
        name: &ResId,
        name_table: impl Fn(&NameInfo) -> Option<Vec<u8>>,
    ) -> u16 {
        if self.rsrctab() == 0 {
            return 0;
        }
        let mut type_id = type_id.normalized();
        let mut name = name.normalized();
        if !type_id.is_int() || !name.is_int() {
            if let Some((t, n)) = self.name_table_id(&type_id, &name, &name_table) {
                trace!("name table maps {}/{} to #{}/#{}", type_id, name, t, n);
                type_id = ResId::Int(t);
                name = ResId::Int(n);
            }
        }
        for ty in self.res_types() {
            if !self.res_id_matches(ty.type_id, &type_id) {
                continue;
            }
            if let Some(ni) = self
                .res_names(&ty)
                .into_iter()
                .find(|ni| self.res_id_matches(ni.id, &name))
            {
                trace!("found resource {}/{} at {:#06x}", type_id, name, ni.at);
                return ni.at as u16;
            }
        }
        0
    }

    /// Look string ids up in the name-table resources. Each record is
    /// `size u16, type u16, id u16, type string, 0, 1 byte, id string, 0`.
    fn name_table_id(
        &self,
        type_id: &ResId,
        name: &ResId,
        name_table: &impl Fn(&NameInfo) -> Option<Vec<u8>>,
    ) -> Option<(u16, u16)> {
        let tag = ResId::Int(ResourceType::NameTable as u16);
        for ty in self.res_types() {
            if !self.res_id_matches(ty.type_id, &tag) {
                continue;
            }
            for ni in self.res_names(&ty) {
                let data = match name_table(&ni) {
                    Some(data) => data,
                    None => continue,
                };
                let mut p = 0;
                while let Some(size) = peek_u16(&data, p) {
                    if size == 0 {
                        break;
                    }
                    let rec = match data.get(p..p + size as usize) {
                        Some(rec) if rec.len() >= 6 => rec,
                        _ => break,
                    };
                    p += size as usize;
                    let rec_type = u16::from_le_bytes([rec[2], rec[3]]);
                    let rec_id = u16::from_le_bytes([rec[4], rec[5]]);
                    let type_name = c_str(&rec[6..]);
                    let id_name = rec
                        .get(6 + type_name.len() + 2..)
                        .map(c_str)
                        .unwrap_or_default();

                    let type_ok = match type_id {
                        ResId::Name(s) => {
                            rec_type & INT_ID_TAG != 0 && eq_ignore_case(type_name, s.as_bytes())
                        }
                        ResId::Int(n) => rec_type & INT_ID_TAG == 0 && rec_type == *n,
                    };
                    let id_ok = match name {
                        ResId::Name(s) => {
                            rec_id & INT_ID_TAG != 0 && eq_ignore_case(id_name, s.as_bytes())
                        }
                        ResId::Int(n) => rec_id & INT_ID_TAG == 0 && rec_id == *n,
                    };
                    if type_ok && id_ok {
                        return Some((rec_type & !INT_ID_TAG, rec_id & !INT_ID_TAG));
                    }
                }
            }
        }
        None
    }

    /// Bytes of the resource in the file.
    pub fn resource_size(&self, hrsrc: u16) -> u32 {
        match self.name_info(hrsrc) {
            Some((_, ni)) => (ni.length as u32) << self.res_shift(),
            None => 0,
        }
    }

    /// File offset and length of a resource.
    pub fn resource_extent(&self, ni: &NameInfo) -> (usize, usize) {
        let shift = self.res_shift();
        (
            (ni.offset as usize) << shift,
            (ni.length as usize) << shift,
        )
    }

    pub fn resources(&self) -> Vec<ResourceEntry> {
        let mut out = vec![];
        for ty in self.res_types() {
            for ni in self.res_names(&ty) {
                let (file_offset, size) = self.resource_extent(&ni);
                out.push(ResourceEntry {
                    hrsrc: ni.at as u16,
                    type_id: self.res_id(ty.type_id),
                    name: self.res_id(ni.id),
                    file_offset: file_offset as u32,
                    size: size as u32,
                    flags: ni.flags,
                });
            }
        }
        out
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NeModule<B> {
    fn set_name_info(&mut self, ni: &NameInfo) {
        self.set_word(ni.at + 4, ni.flags);
        self.set_word(ni.at + 8, ni.handle);
        self.set_word(ni.at + 10, ni.usage);
    }

    /// Install `loader` on every type section matching `type_id` and return the
    /// loader it replaced, 0 if there was none.
    pub fn set_resource_handler(&mut self, type_id: &ResId, loader: SegPtr) -> SegPtr {
        let type_id = type_id.normalized();
        let mut prev = 0;
        for ty in self.res_types() {
            if self.res_id_matches(ty.type_id, &type_id) {
                prev = ty.loader;
                self.set_dword(ty.at + 4, loader);
            }
        }
        prev
    }

    /// Point every type section at `loader`.
    pub fn init_resource_handlers(&mut self, loader: SegPtr) {
        for ty in self.res_types() {
            self.set_dword(ty.at + 4, loader);
        }
    }
}

/// Where a resource load stands after the bookkeeping step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceLoad {
    /// Already in memory; the usage count was bumped.
    Resident(u16),
    /// Has to be read by `loader` into `handle`, which may be 0 or discarded.
    Pending { handle: u16, loader: SegPtr },
}

fn module_name_info(heap: &GlobalHeap, hmodule: u16, hrsrc: u16) -> Result<NameInfo> {
    let module = get_module(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    module
        .name_info(hrsrc)
        .map(|(_, ni)| ni)
        .ok_or(KernelError::InvalidHandle(hrsrc))
}

fn store_name_info(heap: &mut GlobalHeap, hmodule: u16, ni: &NameInfo) -> Result<()> {
    get_module_mut(heap, hmodule)
        .ok_or(KernelError::InvalidHandle(hmodule))?
        .set_name_info(ni);
    Ok(())
}

pub fn begin_load(heap: &mut GlobalHeap, hmodule: u16, hrsrc: u16) -> Result<ResourceLoad> {
    let module = get_module(heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
    let (ty, mut ni) = module
        .name_info(hrsrc)
        .ok_or(KernelError::InvalidHandle(hrsrc))?;
    if ni.handle != 0 && heap.flags(ni.handle) & GMEM_DISCARDED == 0 {
        ni.usage = ni.usage.wrapping_add(1);
        trace!("resource {:#06x} already loaded, usage {}", hrsrc, ni.usage);
        store_name_info(heap, hmodule, &ni)?;
        return Ok(ResourceLoad::Resident(ni.handle));
    }
    Ok(ResourceLoad::Pending {
        handle: ni.handle,
        loader: ty.loader,
    })
}

/// Record the outcome of a loader call; returns the resource's handle.
pub fn finish_load(heap: &mut GlobalHeap, hmodule: u16, hrsrc: u16, hmem: u16) -> Result<u16> {
    let mut ni = module_name_info(heap, hmodule, hrsrc)?;
    ni.handle = hmem;
    if hmem != 0 {
        ni.usage = ni.usage.wrapping_add(1);
        ni.flags |= RESOURCE_LOADED;
    }
    store_name_info(heap, hmodule, &ni)?;
    Ok(hmem)
}

/// Allocate a fixed block owned by the module, big enough for the resource and
/// at least `size` bytes.
pub fn alloc_resource(heap: &mut GlobalHeap, hmodule: u16, hrsrc: u16, size: u32) -> u16 {
    let module = match get_module(heap, hmodule) {
        Some(m) => m,
        None => return 0,
    };
    let size = size.max(module.resource_size(hrsrc));
    if module.name_info(hrsrc).is_none() {
        warn!("invalid resource {:#06x} in module {:#06x}", hrsrc, hmodule);
        return 0;
    }
    let h = heap.alloc(GlobalFlags::FIXED, size, hmodule);
    if h != 0 {
        debug!("resource {:#06x} of {:#06x}: block {:#06x} ({:#x} bytes)", hrsrc, hmodule, h, size);
    }
    h
}

/// The built-in loader: (re)allocate the block and copy the resource out of
/// the module's file image.
pub fn default_handler(
    heap: &mut GlobalHeap,
    hmem: u16,
    hmodule: u16,
    hrsrc: u16,
    image: &[u8],
) -> u16 {
    let (offset, length) = match get_module(heap, hmodule)
        .and_then(|m| m.name_info(hrsrc).map(|(_, ni)| m.resource_extent(&ni)))
    {
        Some(extent) => extent,
        None => return 0,
    };
    let handle = if hmem != 0 {
        heap.realloc(hmem, length as u32, GlobalFlags::empty())
    } else {
        alloc_resource(heap, hmodule, hrsrc, 0)
    };
    if handle == 0 {
        return 0;
    }
    let copied = image
        .get(offset..offset + length)
        .ok_or(KernelError::OutOfBounds(0, offset as u32))
        .and_then(|data| heap.write(make_segptr(handle_to_sel(handle), 0), data));
    match copied {
        Ok(()) => handle,
        Err(e) => {
            warn!("reading resource {:#06x} of {:#06x}: {}", hrsrc, hmodule, e);
            heap.free(handle);
            0
        }
    }
}

/// Drop one reference to a resource block. Returns `None` if the block is not
/// a resource of its owner module.
pub fn free_resource(heap: &mut GlobalHeap, handle: u16) -> Option<u16> {
    let hmodule = heap.owner(handle);
    let mut ni = {
        let module = get_module(heap, hmodule)?;
        module
            .res_types()
            .iter()
            .flat_map(|ty| module.res_names(ty))
            .find(|ni| ni.handle == handle)?
    };
    ni.usage = ni.usage.saturating_sub(1);
    if ni.usage == 0 {
        heap.free(ni.handle);
        ni.handle = 0;
        ni.flags &= !RESOURCE_LOADED;
    }
    trace!("resource block {:#06x} usage now {}", handle, ni.usage);
    store_name_info(heap, hmodule, &ni).ok()?;
    Some(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::MemoryConfig,
        ne::{builder::NeBuilder, module::build_module},
    };

    fn load(b: &NeBuilder) -> (GlobalHeap, u16, Vec<u8>) {
        let image = b.build();
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let h = build_module(&mut heap, &image, "R.DLL").unwrap();
        (heap, h, image)
    }

    fn sample() -> NeBuilder {
        let mut b = NeBuilder::new("R");
        b.lib(true);
        b.code_segment(vec![0xcb]);
        b.resource(ResourceType::RcData.into(), ResId::Int(7), b"seven".to_vec())
            .resource(ResourceType::RcData.into(), "Config".into(), b"cfg".to_vec())
            .resource("CUSTOM".into(), ResId::Int(1), vec![0xaa; 40]);
        b
    }

    fn image_reader(module: &NeModule<&[u8]>, image: &[u8], ni: &NameInfo) -> Option<Vec<u8>> {
        let (off, len) = module.resource_extent(ni);
        image.get(off..off + len).map(|d| d.to_vec())
    }

    #[test]
    fn test_find_resource() {
        let (heap, h, image) = load(&sample());
        let module = get_module(&heap, h).unwrap();
        let find = |t: ResId, n: ResId| module.find_resource(&t, &n, |ni| image_reader(&module, &image, ni));

        let seven = find(ResId::Int(10), ResId::Int(7));
        assert_ne!(seven, 0);
        assert_eq!(find("#10".into(), "#7".into()), seven);
        assert_ne!(find(ResId::Int(10), "config".into()), 0);
        assert_ne!(find("custom".into(), ResId::Int(1)), 0);
        assert_eq!(find(ResId::Int(10), ResId::Int(8)), 0);
        assert_eq!(find(ResId::Int(3), ResId::Int(7)), 0);

        let (ty, ni) = module.name_info(seven).unwrap();
        assert_eq!(ty.type_id, 10 | INT_ID_TAG);
        assert_eq!(ni.flags, RESOURCE_FLAGS_DEFAULT);
        assert!(module.resource_size(seven) >= 5);
        assert!(module.name_info(seven + 1).is_none());
    }

    #[test]
    fn test_resource_listing() {
        let (heap, h, _) = load(&sample());
        let module = get_module(&heap, h).unwrap();
        let all = module.resources();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].name, ResId::Name("Config".to_string()));
        assert_eq!(all[2].type_id, ResId::Name("CUSTOM".to_string()));
        assert_eq!(ResId::Int(4).to_string(), "#4 (MENU)");
    }

    #[test]
    fn test_load_and_free() {
        let (mut heap, h, image) = load(&sample());
        let hrsrc = get_module(&heap, h)
            .unwrap()
            .find_resource(&ResId::Int(10), &ResId::Int(7), |_| None);

        let pending = begin_load(&mut heap, h, hrsrc).unwrap();
        assert_eq!(pending, ResourceLoad::Pending { handle: 0, loader: 0 });
        let hmem = default_handler(&mut heap, 0, h, hrsrc, &image);
        assert_eq!(finish_load(&mut heap, h, hrsrc, hmem).unwrap(), hmem);
        assert_eq!(heap.owner(hmem), h);
        assert_eq!(
            heap.read(make_segptr(handle_to_sel(hmem), 0), 5).unwrap(),
            b"seven".to_vec()
        );
        assert_eq!(begin_load(&mut heap, h, hrsrc).unwrap(), ResourceLoad::Resident(hmem));

        let ni = module_name_info(&heap, h, hrsrc).unwrap();
        assert_eq!(ni.usage, 2);
        assert_ne!(ni.flags & RESOURCE_LOADED, 0);

        assert_eq!(free_resource(&mut heap, hmem), Some(0));
        assert!(heap.is_valid(hmem));
        assert_eq!(free_resource(&mut heap, hmem), Some(0));
        assert!(!heap.is_valid(hmem));
        let ni = module_name_info(&heap, h, hrsrc).unwrap();
        assert_eq!((ni.handle, ni.usage, ni.flags & RESOURCE_LOADED), (0, 0, 0));

        assert!(begin_load(&mut heap, h, hrsrc + 2).is_err());
    }

    #[test]
    fn test_foreign_block_is_not_a_resource() {
        let (mut heap, h, _) = load(&sample());
        let other = heap.alloc(GlobalFlags::FIXED, 0x10, h);
        assert_eq!(free_resource(&mut heap, other), None);
    }

    #[test]
    fn test_alloc_resource_minimum() {
        let (mut heap, h, _) = load(&sample());
        let hrsrc = get_module(&heap, h)
            .unwrap()
            .find_resource(&"custom".into(), &ResId::Int(1), |_| None);
        let hmem = alloc_resource(&mut heap, h, hrsrc, 4);
        assert!(heap.size(hmem) >= 40);
        let big = alloc_resource(&mut heap, h, hrsrc, 0x400);
        assert!(heap.size(big) >= 0x400);
        assert_eq!(alloc_resource(&mut heap, h, 1, 4), 0);
    }

    #[test]
    fn test_set_resource_handler() {
        let (mut heap, h, _) = load(&sample());
        let mut module = get_module_mut(&mut heap, h).unwrap();
        module.init_resource_handlers(0x0010_0020);
        assert_eq!(module.set_resource_handler(&ResId::Int(10), 0x1234_0000), 0x0010_0020);
        assert_eq!(module.set_resource_handler(&"#10".into(), 0x1234_0004), 0x1234_0000);
        assert_eq!(module.set_resource_handler(&ResId::Int(99), 0x1), 0);
        let loaders: Vec<_> = module.res_types().iter().map(|t| t.loader).collect();
        assert_eq!(loaders, vec![0x1234_0004, 0x0010_0020]);
    }

    #[test]
    fn test_name_table_indirection() {
        // maps type "WIDGET" / id "MAIN" to #10 / #7
        let mut rec = vec![0u8; 6];
        rec.extend_from_slice(b"WIDGET\0\0MAIN\0");
        let size = rec.len() as u16;
        rec[0..2].copy_from_slice(&size.to_le_bytes());
        rec[2..4].copy_from_slice(&(10 | INT_ID_TAG).to_le_bytes());
        rec[4..6].copy_from_slice(&(7 | INT_ID_TAG).to_le_bytes());
        rec.extend_from_slice(&[0, 0]);

        let mut b = sample();
        b.resource(ResourceType::NameTable.into(), ResId::Int(1), rec);
        let (heap, h, image) = load(&b);
        let module = get_module(&heap, h).unwrap();
        let direct = module.find_resource(&ResId::Int(10), &ResId::Int(7), |_| None);
        let named = module.find_resource(&"widget".into(), &"main".into(), |ni| {
            image_reader(&module, &image, ni)
        });
        assert_eq!(named, direct);
        let missing = module.find_resource(&"widget".into(), &"other".into(), |ni| {
            image_reader(&module, &image, ni)
        });
        assert_eq!(missing, 0);
    }
}
