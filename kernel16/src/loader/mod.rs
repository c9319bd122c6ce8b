//! Where module images come from.
//!
//! The kernel asks a [`ModuleResolver`] for the bytes of a module by name. 32-bit
//! images are not loaded as code; [`PeModule`] extracts what the kernel needs to
//! register a placeholder module for them and to serve their resources.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use goblin::pe::{section_table::SectionTable, PE};
use log::{debug, trace, warn};

use crate::{
    config::LoaderConfig,
    errors::{KernelError, Result},
    ne::{convert::convert_resource, module::HostModuleInfo, resource::ResId},
    utils::{basename, peek_u16, peek_u32},
};

const RESOURCE_DIRECTORY_SIZE: usize = 16;
const RESOURCE_ENTRY_SIZE: usize = 8;
const RESOURCE_SUBDIR: u32 = 0x8000_0000;
const IMAGE_FILE_DLL: u16 = 0x2000;

/// The file behind a module name.
#[derive(Clone, Debug)]
pub struct ResolvedModule {
    pub path: String,
    pub image: Arc<Vec<u8>>,
}

pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<ResolvedModule>;
}

/// Looks names up in a list of host directories. Names are tried as given, then
/// upper and lower cased, since module names are case-insensitive and host file
/// systems usually are not.
#[derive(Clone, Debug)]
pub struct SearchPathResolver {
    search_path: Vec<PathBuf>,
}

impl SearchPathResolver {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            search_path: config.search_path.clone(),
        }
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut out = vec![];
        let host = name.replace('\\', "/");
        if host.contains('/') {
            out.push(PathBuf::from(&host));
        }
        let file = basename(name);
        for dir in &self.search_path {
            for variant in [file.to_string(), file.to_ascii_uppercase(), file.to_ascii_lowercase()] {
                let p = dir.join(variant);
                if !out.contains(&p) {
                    out.push(p);
                }
            }
        }
        out
    }
}

impl ModuleResolver for SearchPathResolver {
    fn resolve(&self, name: &str) -> Result<ResolvedModule> {
        for path in self.candidates(name) {
            if !path.is_file() {
                continue;
            }
            trace!("{} resolved to {}", name, path.display());
            let image = fs::read(&path)?;
            return Ok(ResolvedModule {
                path: path.to_string_lossy().into_owned(),
                image: Arc::new(image),
            });
        }
        Err(KernelError::ModuleNotFound(name.to_string()))
    }
}

/// Images registered in memory under their file names. Lookups ignore case and
/// any directory part.
#[derive(Default)]
pub struct MemoryResolver {
    images: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, image: Vec<u8>) {
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images.insert(basename(name).to_ascii_uppercase(), Arc::new(image));
    }

    pub fn with(self, name: &str, image: Vec<u8>) -> Self {
        self.insert(name, image);
        self
    }
}

impl ModuleResolver for MemoryResolver {
    fn resolve(&self, name: &str) -> Result<ResolvedModule> {
        let key = basename(name).to_ascii_uppercase();
        let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images
            .get(&key)
            .map(|image| ResolvedModule {
                path: key.clone(),
                image: image.clone(),
            })
            .ok_or_else(|| KernelError::ModuleNotFound(name.to_string()))
    }
}

/// One resource of a 32-bit module, in its original layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostResource {
    pub type_id: ResId,
    pub name: ResId,
    pub data: Vec<u8>,
}

/// What a 32-bit module offers to 16-bit code: its identity and its resources.
#[derive(Clone, Debug)]
pub struct PeModule {
    pub info: HostModuleInfo,
    pub resources: Vec<HostResource>,
}

fn rva_to_offset(sections: &[SectionTable], rva: u32) -> Option<usize> {
    sections
        .iter()
        .find(|s| {
            let len = s.virtual_size.max(s.size_of_raw_data);
            rva >= s.virtual_address && rva < s.virtual_address.saturating_add(len)
        })
        .map(|s| (rva - s.virtual_address + s.pointer_to_raw_data) as usize)
}

/// A directory entry id: a string offset when the top bit is set.
fn dir_id(rsrc: &[u8], raw: u32) -> ResId {
    if raw & RESOURCE_SUBDIR == 0 {
        return ResId::Int(raw as u16);
    }
    let at = (raw & !RESOURCE_SUBDIR) as usize;
    let len = peek_u16(rsrc, at).unwrap_or(0) as usize;
    let name: String = (0..len)
        .filter_map(|i| peek_u16(rsrc, at + 2 + i * 2))
        .map(|c| if c < 0x80 { c as u8 as char } else { '?' })
        .collect();
    ResId::Name(name.to_ascii_uppercase())
}

fn dir_entries(rsrc: &[u8], dir: usize) -> Vec<(ResId, u32)> {
    let named = peek_u16(rsrc, dir + 12).unwrap_or(0) as usize;
    let ids = peek_u16(rsrc, dir + 14).unwrap_or(0) as usize;
    (0..named + ids)
        .filter_map(|i| {
            let at = dir + RESOURCE_DIRECTORY_SIZE + i * RESOURCE_ENTRY_SIZE;
            Some((dir_id(rsrc, peek_u32(rsrc, at)?), peek_u32(rsrc, at + 4)?))
        })
        .collect()
}

impl PeModule {
    pub fn parse(image: &[u8], path: &str) -> Result<Self> {
        let pe = PE::parse(image)?;
        let optional = pe
            .header
            .optional_header
            .ok_or_else(|| KernelError::BadFormat(format!("{}: no optional header", path)))?;
        let windows = optional.windows_fields;
        let info = HostModuleInfo {
            path: path.to_string(),
            is_dll: pe.is_lib || pe.header.coff_header.characteristics & IMAGE_FILE_DLL != 0,
            subsystem_major: windows.major_subsystem_version as u8,
            subsystem_minor: windows.minor_subsystem_version as u8,
        };
        let resources = match optional.data_directories.get_resource_table() {
            Some(dir) if dir.size > 0 => {
                match rva_to_offset(&pe.sections, dir.virtual_address) {
                    Some(off) => Self::walk_resources(image, off, &pe.sections),
                    None => {
                        warn!("{}: resource directory outside any section", path);
                        vec![]
                    }
                }
            }
            _ => vec![],
        };
        debug!(
            "{}: 32-bit {} with {} resources",
            path,
            if info.is_dll { "library" } else { "executable" },
            resources.len()
        );
        Ok(Self { info, resources })
    }

    /// Type, name and first language of every resource.
    fn walk_resources(image: &[u8], base: usize, sections: &[SectionTable]) -> Vec<HostResource> {
        let rsrc = match image.get(base..) {
            Some(r) => r,
            None => return vec![],
        };
        let mut out = vec![];
        for (type_id, types) in dir_entries(rsrc, 0) {
            if types & RESOURCE_SUBDIR == 0 {
                continue;
            }
            for (name, names) in dir_entries(rsrc, (types & !RESOURCE_SUBDIR) as usize) {
                let mut leaf = names;
                if leaf & RESOURCE_SUBDIR != 0 {
                    match dir_entries(rsrc, (leaf & !RESOURCE_SUBDIR) as usize).first() {
                        Some((_, lang)) => leaf = *lang,
                        None => continue,
                    }
                }
                let leaf = leaf as usize;
                let data = peek_u32(rsrc, leaf)
                    .zip(peek_u32(rsrc, leaf + 4))
                    .and_then(|(rva, size)| {
                        let off = rva_to_offset(sections, rva)?;
                        image.get(off..off + size as usize)
                    });
                match data {
                    Some(data) => out.push(HostResource {
                        type_id: type_id.clone(),
                        name,
                        data: data.to_vec(),
                    }),
                    None => warn!("resource {}/{} points outside the image", type_id, name),
                }
            }
        }
        out
    }

    /// Index of a resource, matching string ids without regard to case.
    pub fn find_resource(&self, type_id: &ResId, name: &ResId) -> Option<usize> {
        let matches = |a: &ResId, b: &ResId| match (a, b.normalized()) {
            (ResId::Int(x), ResId::Int(y)) => *x == y,
            (ResId::Name(x), ResId::Name(y)) => x.eq_ignore_ascii_case(&y),
            _ => false,
        };
        self.resources
            .iter()
            .position(|r| matches(&r.type_id, type_id) && matches(&r.name, name))
    }

    /// The resource converted to its 16-bit layout.
    pub fn load_resource(&self, index: usize) -> Result<Vec<u8>> {
        let res = self
            .resources
            .get(index)
            .ok_or(KernelError::InvalidHandle(index as u16))?;
        match res.type_id {
            ResId::Int(t) => convert_resource(t, &res.data),
            ResId::Name(_) => Ok(res.data.clone()),
        }
    }

    pub fn file_name(&self) -> &str {
        Path::new(&self.info.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.info.path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A resource section holding one RT_ACCELERATOR #1 and one named RCDATA.
    fn rsrc_section(rva: u32) -> Vec<u8> {
        let mut d = vec![0u8; 0x100];
        let put16 = |d: &mut Vec<u8>, at: usize, v: u16| d[at..at + 2].copy_from_slice(&v.to_le_bytes());
        let put32 = |d: &mut Vec<u8>, at: usize, v: u32| d[at..at + 4].copy_from_slice(&v.to_le_bytes());
        // root: two id entries
        put16(&mut d, 14, 2);
        put32(&mut d, 16, 9);
        put32(&mut d, 20, RESOURCE_SUBDIR | 0x30);
        put32(&mut d, 24, 10);
        put32(&mut d, 28, RESOURCE_SUBDIR | 0x48);
        // accelerators: id 1 -> data entry at 0x80
        put16(&mut d, 0x30 + 14, 1);
        put32(&mut d, 0x40, 1);
        put32(&mut d, 0x44, 0x80);
        // rcdata: named entry "CFG" -> language dir at 0x60
        put16(&mut d, 0x48 + 12, 1);
        put32(&mut d, 0x58, RESOURCE_SUBDIR | 0xa0);
        put32(&mut d, 0x5c, RESOURCE_SUBDIR | 0x60);
        put16(&mut d, 0x60 + 14, 1);
        put32(&mut d, 0x70, 0x409);
        put32(&mut d, 0x74, 0x90);
        // data entries
        put32(&mut d, 0x80, rva + 0xc0);
        put32(&mut d, 0x84, 8);
        put32(&mut d, 0x90, rva + 0xd0);
        put32(&mut d, 0x94, 3);
        // "Cfg" in UTF-16
        put16(&mut d, 0xa0, 3);
        for (i, c) in "Cfg".encode_utf16().enumerate() {
            put16(&mut d, 0xa2 + i * 2, c);
        }
        d[0xc0..0xc8].copy_from_slice(&[0x80, 0, 0x41, 0, 0x64, 0, 0, 0]);
        d[0xd0..0xd3].copy_from_slice(b"xyz");
        d
    }

    #[test]
    fn test_walk_resources() {
        let section = SectionTable {
            virtual_address: 0x2000,
            virtual_size: 0x100,
            size_of_raw_data: 0x100,
            pointer_to_raw_data: 0x400,
            ..Default::default()
        };
        let mut image = vec![0u8; 0x400];
        image.extend(rsrc_section(0x2000));
        let resources = PeModule::walk_resources(&image, 0x400, &[section]);
        assert_eq!(resources.len(), 2);

        let module = PeModule {
            info: HostModuleInfo {
                path: "C:\\WIN\\RES.DLL".into(),
                is_dll: true,
                subsystem_major: 4,
                subsystem_minor: 0,
            },
            resources,
        };
        let acc = module.find_resource(&ResId::Int(9), &ResId::Int(1)).unwrap();
        assert_eq!(module.load_resource(acc).unwrap(), vec![0x80, 0x41, 0, 0x64, 0]);
        let cfg = module.find_resource(&ResId::Int(10), &"cfg".into()).unwrap();
        assert_eq!(module.load_resource(cfg).unwrap(), b"xyz".to_vec());
        assert!(module.find_resource(&ResId::Int(10), &"#1".into()).is_none());
    }

    #[test]
    fn test_memory_resolver() {
        let resolver = MemoryResolver::new().with("lib\\Foo.dll", vec![1, 2, 3]);
        let found = resolver.resolve("C:\\WINDOWS\\FOO.DLL").unwrap();
        assert_eq!(found.path, "FOO.DLL");
        assert_eq!(*found.image, vec![1, 2, 3]);
        assert!(matches!(
            resolver.resolve("BAR.DLL"),
            Err(KernelError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_search_path_candidates() {
        let resolver = SearchPathResolver {
            search_path: vec![PathBuf::from("/win")],
        };
        let c = resolver.candidates("Mod.Dll");
        assert_eq!(
            c,
            vec![
                PathBuf::from("/win/Mod.Dll"),
                PathBuf::from("/win/MOD.DLL"),
                PathBuf::from("/win/mod.dll"),
            ]
        );
        assert_eq!(resolver.candidates("a\\b.dll")[0], PathBuf::from("a/b.dll"));
    }
}
