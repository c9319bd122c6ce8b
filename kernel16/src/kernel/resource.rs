//! Resource calls. NE modules go through their resource table and per-type
//! loaders; 32-bit placeholder modules serve converted copies of their PE
//! resources, with `hrsrc` one past the resource's index.

use log::{debug, trace, warn};

use super::Kernel;
use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags},
    loader::PeModule,
    ne::{
        module::{get_module, get_module_mut},
        resource::{self, begin_load, default_handler, finish_load, ResId, ResourceLoad},
    },
    utils::{hiword, loword, make_segptr, SegPtr},
};

impl Kernel {
    /// A resource type or name argument: an integer id in the low word, or a
    /// string.
    pub(crate) fn res_id(&self, ptr: SegPtr) -> Result<ResId> {
        if hiword(ptr) == 0 {
            return Ok(ResId::Int(loword(ptr)));
        }
        let s = self.read_string(ptr)?;
        Ok(ResId::from(s.as_str()))
    }

    pub fn find_resource(&self, handle: u16, type_id: &ResId, name: &ResId) -> u16 {
        self.with_state(|st| {
            let hmodule = st.get_exe_ptr(handle);
            if let Some(pe) = st.host_modules.get(&hmodule) {
                return pe.find_resource(type_id, name).map_or(0, |i| i as u16 + 1);
            }
            let module = match get_module(&st.heap, hmodule) {
                Some(m) => m,
                None => return 0,
            };
            let image = st.images.get(&hmodule);
            let hrsrc = module.find_resource(type_id, name, |ni| {
                let (off, len) = module.resource_extent(ni);
                image.and_then(|i| i.get(off..off + len)).map(|d| d.to_vec())
            });
            trace!("FindResource({:#06x}, {}, {}) = {:#06x}", hmodule, type_id, name, hrsrc);
            hrsrc
        })
    }

    /// `LoadResource`: the resource's block, loaded on first use through the
    /// loader installed for its type.
    pub fn load_resource(&self, handle: u16, hrsrc: u16) -> u16 {
        if hrsrc == 0 {
            return 0;
        }
        let _win16 = self.win16().lock();
        let hmodule = self.get_exe_ptr(handle);
        let host = self.state().host_modules.get(&hmodule).cloned();
        if let Some(pe) = host {
            return self.load_host_resource(hmodule, &pe, hrsrc);
        }

        let load = self.with_state(|st| begin_load(&mut st.heap, hmodule, hrsrc));
        let (hmem, loader) = match load {
            Ok(ResourceLoad::Resident(h)) => return h,
            Ok(ResourceLoad::Pending { handle, loader }) => (handle, loader),
            Err(e) => {
                warn!("LoadResource({:#06x}, {:#06x}): {}", hmodule, hrsrc, e);
                return 0;
            }
        };

        let default_loader = self.state().default_loader;
        let loaded = if loader == 0 || loader == default_loader {
            self.def_resource_handler(hmem, hmodule, hrsrc)
        } else {
            debug!("custom resource loader {:#010x} for {:#06x}", loader, hrsrc);
            match self.call_to_16(loader, &[hrsrc, hmodule, hmem]) {
                Ok(ret) => loword(ret),
                Err(e) => {
                    warn!("resource loader for {:#06x} failed: {}", hrsrc, e);
                    0
                }
            }
        };
        self.with_state(|st| finish_load(&mut st.heap, hmodule, hrsrc, loaded))
            .unwrap_or_else(|e| {
                warn!("LoadResource({:#06x}, {:#06x}): {}", hmodule, hrsrc, e);
                0
            })
    }

    fn load_host_resource(&self, hmodule: u16, pe: &PeModule, hrsrc: u16) -> u16 {
        let data = match pe.load_resource(hrsrc as usize - 1) {
            Ok(data) => data,
            Err(e) => {
                warn!("resource {} of {}: {}", hrsrc, pe.file_name(), e);
                return 0;
            }
        };
        self.with_state(|st| {
            let h = st.heap.alloc(GlobalFlags::FIXED, data.len().max(1) as u32, hmodule);
            if h == 0 {
                return 0;
            }
            match st.heap.write(make_segptr(handle_to_sel(h), 0), &data) {
                Ok(()) => h,
                Err(e) => {
                    warn!("copying resource {} of {}: {}", hrsrc, pe.file_name(), e);
                    st.heap.free(h);
                    0
                }
            }
        })
    }

    /// `FreeResource`: 0 on success, the handle if it was not freed. Blocks
    /// that are not NE resources are freed as plain global blocks.
    pub fn free_resource(&self, handle: u16) -> u16 {
        let _win16 = self.win16().lock();
        match self.with_state(|st| resource::free_resource(&mut st.heap, handle)) {
            Some(ret) => ret,
            None => self.global_free(handle),
        }
    }

    pub fn sizeof_resource(&self, handle: u16, hrsrc: u16) -> u32 {
        self.with_state(|st| {
            let hmodule = st.get_exe_ptr(handle);
            if let Some(pe) = st.host_modules.get(&hmodule) {
                return match hrsrc.checked_sub(1).map(|i| pe.load_resource(i as usize)) {
                    Some(Ok(data)) => data.len() as u32,
                    _ => 0,
                };
            }
            get_module(&st.heap, hmodule)
                .map(|m| m.resource_size(hrsrc))
                .unwrap_or(0)
        })
    }

    pub fn alloc_resource(&self, handle: u16, hrsrc: u16, size: u32) -> u16 {
        self.with_state(|st| {
            let hmodule = st.get_exe_ptr(handle);
            resource::alloc_resource(&mut st.heap, hmodule, hrsrc, size)
        })
    }

    /// Install `loader` for resources of `type_id`; returns the previous one.
    pub fn set_resource_handler(&self, handle: u16, type_id: &ResId, loader: SegPtr) -> SegPtr {
        self.with_state(|st| {
            let hmodule = st.get_exe_ptr(handle);
            match get_module_mut(&mut st.heap, hmodule) {
                Some(mut module) => module.set_resource_handler(type_id, loader),
                None => 0,
            }
        })
    }

    /// The built-in resource loader, also exported for 16-bit loaders to
    /// chain to.
    pub fn def_resource_handler(&self, hmem: u16, handle: u16, hrsrc: u16) -> u16 {
        self.with_state(|st| {
            let hmodule = st.get_exe_ptr(handle);
            let image = match st.images.get(&hmodule) {
                Some(image) => image.clone(),
                None => {
                    warn!("{}", KernelError::InvalidHandle(hmodule));
                    return 0;
                }
            };
            default_handler(&mut st.heap, hmem, hmodule, hrsrc, &image)
        })
    }
}
