//! The module list: loading, sharing and freeing NE modules, binding their
//! imports and running library initialization.

use std::sync::Arc;

use log::{debug, info, trace, warn};
use serde::Serialize;

use super::{Kernel, KernelState};
use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags},
    loader::PeModule,
    ne::{
        module::{
            build_module, create_dummy_module, get_module, get_module_mut, get_ordinal, ModuleFlags,
            SegmentFlags, FLAGSOTHERS_VISITING,
        },
        segment::{create_all_segments, dll_init_params, load_segment, my_alloc},
    },
    registers::Context16,
    task::{get_task, task_list},
    utils::{basename, eq_ignore_case, loword, make_segptr, offset_of, selector_of, SegPtr},
};

/// Offsets in the header a self-loading module keeps at the start of its
/// first segment.
const SELFLOAD_BOOT_APP: u16 = 0x04;
const SELFLOAD_LOAD_APP_SEG: u16 = 0x08;
const SELFLOAD_MY_ALLOC: u16 = 0x10;
const SELFLOAD_ENTRY_ADDR_PROC: u16 = 0x14;
const SELFLOAD_STACK_SIZE: u32 = 0xff00;
/// Room left above the self-loader's initial stack pointer.
const SELFLOAD_STACK_SLACK: u16 = 0x20;
const DLL_PROCESS_ATTACH: u16 = 1;
const WEP_FREE_DLL: u16 = 0;

/// A summary of a loaded module.
#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct ModuleInfo {
    pub handle: u16,
    pub name: String,
    pub file_name: String,
    pub count: u16,
    pub flags: u16,
    pub expver: u16,
    pub instance: u16,
    pub segments: u16,
    pub imports: Vec<u16>,
}

/// What `LoadModule` is told about the task to start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadParams {
    pub cmdline: String,
    pub cmd_show: u16,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            cmdline: String::new(),
            cmd_show: 1,
        }
    }
}

/// File part of a DOS or host path.
fn file_part(path: &str) -> &str {
    let base = basename(path);
    base.rsplit(':').next().unwrap_or(base)
}

fn has_extension(name: &str) -> bool {
    file_part(name).contains('.')
}

impl KernelState {
    /// Registered modules, most recently loaded first.
    pub fn module_list(&self) -> Vec<u16> {
        let mut out = vec![];
        let mut cur = self.first_module;
        while let Some(module) = get_module(&self.heap, cur) {
            if out.contains(&cur) {
                break;
            }
            out.push(cur);
            cur = module.next();
        }
        out
    }

    pub(crate) fn register_module(&mut self, hmodule: u16) {
        let first = self.first_module;
        if let Some(mut module) = get_module_mut(&mut self.heap, hmodule) {
            module.set_next(first);
            self.first_module = hmodule;
        }
    }

    fn unlink_module(&mut self, hmodule: u16, next: u16) {
        if self.first_module == hmodule {
            self.first_module = next;
            return;
        }
        for h in self.module_list() {
            let points_here = get_module(&self.heap, h).map_or(false, |m| m.next() == hmodule);
            if points_here {
                if let Some(mut prev) = get_module_mut(&mut self.heap, h) {
                    prev.set_next(next);
                }
                return;
            }
        }
    }

    /// The module behind a module, instance, task or PDB handle, or behind the
    /// owner of any block.
    pub fn get_exe_ptr(&self, handle: u16) -> u16 {
        let mut handle = match self.heap.handle(handle) {
            0 => handle,
            h => h,
        };
        if handle == 0 || !self.heap.is_valid(handle) {
            return 0;
        }
        for _ in 0..2 {
            if get_module(&self.heap, handle).is_some() {
                return handle;
            }
            for htask in task_list(&self.heap, self.first_task) {
                if let Some(tdb) = get_task(&self.heap, htask) {
                    if htask == handle
                        || tdb.instance() == handle
                        || tdb.queue() == handle
                        || tdb.pdb() == handle
                    {
                        return tdb.module();
                    }
                }
            }
            handle = self.heap.owner(handle);
            if handle == 0 {
                break;
            }
        }
        0
    }

    /// `GetModuleHandle` by name: the module name as given, then upper cased,
    /// then the file part against each module's file name.
    pub fn find_module(&self, name: &str) -> u16 {
        if name.is_empty() {
            return 0;
        }
        let modules: Vec<_> = self
            .module_list()
            .into_iter()
            .filter_map(|h| get_module(&self.heap, h).map(|m| (h, m)))
            .collect();
        let upper = name.to_ascii_uppercase();
        for wanted in [name, upper.as_str()] {
            if let Some((h, _)) = modules
                .iter()
                .find(|(_, m)| !m.is_win32() && m.name() == wanted)
            {
                return *h;
            }
        }
        let file = file_part(name);
        modules
            .iter()
            .find(|(_, m)| {
                let loaded = m.file_name();
                !loaded.is_empty() && eq_ignore_case(file_part(&loaded).as_bytes(), file.as_bytes())
            })
            .map(|(h, _)| *h)
            .unwrap_or(0)
    }

    /// A loaded 16-bit module whose file is `name`: the file parts compared,
    /// then the file part without extension against the module name.
    pub fn find_module_by_file(&self, name: &str) -> u16 {
        let file = file_part(name);
        let modules: Vec<_> = self
            .module_list()
            .into_iter()
            .filter_map(|h| get_module(&self.heap, h).map(|m| (h, m)))
            .filter(|(_, m)| !m.is_win32())
            .collect();
        if let Some((h, _)) = modules.iter().find(|(_, m)| {
            m.fileinfo() != 0 && eq_ignore_case(file_part(&m.file_name()).as_bytes(), file.as_bytes())
        }) {
            return *h;
        }
        let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
        modules
            .iter()
            .find(|(_, m)| eq_ignore_case(m.name().as_bytes(), stem.as_bytes()))
            .map(|(h, _)| *h)
            .unwrap_or(0)
    }

    /// Placeholder already standing in for the 32-bit module at `path`.
    fn find_host_module(&self, path: &str) -> u16 {
        self.host_modules
            .iter()
            .find(|(h, pe)| pe.info.path == path && get_module(&self.heap, **h).is_some())
            .map(|(h, _)| *h)
            .unwrap_or(0)
    }

    pub(crate) fn module_info(&self, hmodule: u16) -> Option<ModuleInfo> {
        let m = get_module(&self.heap, hmodule)?;
        Some(ModuleInfo {
            handle: hmodule,
            name: m.name(),
            file_name: m.file_name(),
            count: m.count(),
            flags: m.raw_flags(),
            expver: m.expver(),
            instance: m.instance(),
            segments: m.cseg(),
            imports: m.modrefs(),
        })
    }
}

impl Kernel {
    /// `LoadModule`. Without `params` only the module is loaded, as for a
    /// library; otherwise a program gets a new task and its instance is
    /// returned once the task has one.
    pub fn load_module(&self, name: &str, params: Option<&LoadParams>) -> Result<u16> {
        let _win16 = self.win16().lock();
        let lib_only = params.is_none();
        let existing = self.state().find_module_by_file(name);
        let hmodule = if existing != 0 {
            let mut st = self.state();
            let mut module =
                get_module_mut(&mut st.heap, existing).ok_or_else(|| KernelError::BadFormat(name.to_string()))?;
            if module.is_win32() {
                return Err(KernelError::Win32Module(name.to_string()));
            }
            let count = module.count();
            module.set_count(count.wrapping_add(1));
            trace!("{} already loaded as {:#06x}, count {}", name, existing, count + 1);
            existing
        } else {
            self.load_module_16(name, false, lib_only)?
        };

        let (is_lib, instance) = {
            let st = self.state();
            let module = get_module(&st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
            (module.is_lib(), module.instance())
        };
        if is_lib || lib_only {
            return Ok(instance);
        }
        let params = params.cloned().unwrap_or_default();
        self.spawn_task(hmodule, &params.cmdline, params.cmd_show)
    }

    /// `LoadLibrary`: load without starting a task.
    pub fn load_library(&self, name: &str) -> Result<u16> {
        self.load_module(name, None)
    }

    /// `WinExec`: the first word of `cmdline` names the program, the rest is
    /// its command tail.
    pub fn win_exec(&self, cmdline: &str, cmd_show: u16) -> Result<u16> {
        let cmdline = cmdline.trim_start();
        let (program, tail) = match cmdline.split_once(|c: char| c == ' ' || c == '\t') {
            Some((program, tail)) => (program, tail),
            None => (cmdline, ""),
        };
        let params = LoadParams {
            cmdline: format!(" {}", tail),
            cmd_show,
        };
        self.load_module(program, Some(&params))
    }

    /// Read a `LOADPARAMS` block; `None` for the values meaning "library only".
    pub(crate) fn read_load_params(&self, ptr: SegPtr) -> Result<Option<LoadParams>> {
        if ptr == 0 || ptr == 0xffff_ffff {
            return Ok(None);
        }
        self.with_state(|st| {
            let block = st.heap.read(ptr, 10)?;
            let word = |off: usize| u16::from_le_bytes([block[off], block[off + 1]]);
            let cmdline_ptr = make_segptr(word(4), word(2));
            let show_ptr = make_segptr(word(8), word(6));
            let cmdline = if selector_of(cmdline_ptr) == 0 {
                String::new()
            } else {
                let len = st.heap.read(cmdline_ptr, 1)?[0] as usize;
                String::from_utf8_lossy(&st.heap.read(cmdline_ptr + 1, len)?).into_owned()
            };
            let cmd_show = if show_ptr == 0 {
                1
            } else {
                st.heap.read_word(show_ptr + 2)?
            };
            Ok(Some(LoadParams { cmdline, cmd_show }))
        })
    }

    /// Find, build and register a module. Libraries, and programs loaded as
    /// libraries, are also fully loaded; a program only gets its module block
    /// until its task starts.
    fn load_module_16(&self, name: &str, implicit: bool, lib_only: bool) -> Result<u16> {
        let resolved = self.resolver().resolve(name)?;
        let hmodule = {
            let mut st = self.state();
            match build_module(&mut st.heap, &resolved.image, &resolved.path) {
                Ok(hmodule) => {
                    st.register_module(hmodule);
                    st.images.insert(hmodule, resolved.image.clone());
                    let loader = st.default_loader;
                    if let Some(mut module) = get_module_mut(&mut st.heap, hmodule) {
                        module.init_resource_handlers(loader);
                    }
                    hmodule
                }
                Err(KernelError::Win32Module(path)) => {
                    if st.find_host_module(&resolved.path) == 0 {
                        let pe = PeModule::parse(&resolved.image, &resolved.path)?;
                        let hmodule = create_dummy_module(&mut st.heap, &pe.info)?;
                        st.register_module(hmodule);
                        st.host_modules.insert(hmodule, Arc::new(pe));
                        info!("{} is a 32-bit module, placeholder {:#06x}", resolved.path, hmodule);
                    }
                    return Err(KernelError::Win32Module(path));
                }
                Err(e) => return Err(e),
            }
        };

        let is_lib = self
            .with_state(|st| get_module(&st.heap, hmodule).map(|m| m.is_lib()))
            .unwrap_or(false);
        if lib_only || is_lib {
            if let Err(e) = self.do_load_module(hmodule) {
                warn!("loading {} failed: {}", name, e);
                self.discard_module(hmodule);
                return Err(e);
            }
        }
        info!("loaded {} from {} as {:#06x}", name, resolved.path, hmodule);

        // implicitly linked libraries are initialized by InitTask
        if !implicit && is_lib {
            self.initialize_dlls(hmodule)?;
            self.dll_process_attach(hmodule);
        }
        Ok(hmodule)
    }

    /// Drop a module that never finished loading.
    fn discard_module(&self, hmodule: u16) {
        self.with_state(|st| {
            let next = get_module(&st.heap, hmodule).map(|m| m.next()).unwrap_or(0);
            st.unlink_module(hmodule, next);
            st.heap.free_all(hmodule);
            st.images.remove(&hmodule);
        })
    }

    /// Allocate segments, bind imported modules, load every segment. Returns
    /// the instance handle.
    pub(crate) fn do_load_module(&self, hmodule: u16) -> Result<u16> {
        self.with_state(|st| create_all_segments(&mut st.heap, hmodule))?;
        self.load_dlls(hmodule)?;
        if let Err(e) = self.load_all_segments(hmodule) {
            let modrefs = self.with_state(|st| get_module(&st.heap, hmodule).map(|m| m.modrefs()).unwrap_or_default());
            self.release_modrefs(&modrefs);
            return Err(e);
        }
        self.with_state(|st| {
            let mut module = get_module_mut(&mut st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
            module.set_count(1);
            Ok(module.instance())
        })
    }

    /// Replace the module reference table's name offsets with handles, loading
    /// what is not loaded yet. New libraries are queued for initialization.
    fn load_dlls(&self, hmodule: u16) -> Result<()> {
        let (cmod, expver, modname) = self.with_state(|st| {
            get_module(&st.heap, hmodule)
                .map(|m| (m.cmod(), m.expver(), m.name()))
                .ok_or(KernelError::InvalidHandle(hmodule))
        })?;
        let mut to_init = vec![];
        let mut bound = vec![];
        for i in 0..cmod {
            let handle = match self.bind_modref(hmodule, i, expver, &modname) {
                Ok((handle, fresh)) => {
                    if fresh {
                        to_init.push(handle);
                    }
                    handle
                }
                Err(e) => {
                    self.release_modrefs(&bound);
                    return Err(e);
                }
            };
            bound.push(handle);
            self.with_state(|st| {
                if let Some(mut module) = get_module_mut(&mut st.heap, hmodule) {
                    module.set_modref(i, handle);
                }
            });
        }

        if to_init.is_empty() {
            return Ok(());
        }
        let block = self.with_state(|st| {
            let size = (to_init.len() as u32 + 1) * 2;
            let block = st.heap.alloc(GlobalFlags::FIXED | GlobalFlags::ZEROINIT, size, hmodule);
            if block == 0 {
                return Err(KernelError::OutOfMemory(size));
            }
            let bytes: Vec<u8> = to_init.iter().flat_map(|h| h.to_le_bytes()).collect();
            st.heap.write(make_segptr(handle_to_sel(block), 0), bytes)?;
            get_module_mut(&mut st.heap, hmodule)
                .ok_or(KernelError::InvalidHandle(hmodule))?
                .set_dlls_to_init(block);
            Ok(())
        });
        if block.is_err() {
            self.release_modrefs(&bound);
        }
        block
    }

    /// Resolve module reference `i` to a handle, taking a reference on a
    /// loaded module or loading it. The flag tells whether it was loaded now.
    fn bind_modref(&self, hmodule: u16, i: u16, expver: u16, modname: &str) -> Result<(u16, bool)> {
        let name = self
            .with_state(|st| get_module(&st.heap, hmodule).and_then(|m| m.imported_name(m.modref(i))))
            .ok_or_else(|| KernelError::BadFormat(format!("{}: bad module reference {}", modname, i)))?;
        let found = self.get_module_handle(&name);
        if found != 0 {
            self.with_state(|st| {
                if let Some(mut dll) = get_module_mut(&mut st.heap, found) {
                    let count = dll.count();
                    dll.set_count(count.wrapping_add(1));
                }
            });
            return Ok((found, false));
        }
        let file = if has_extension(&name) {
            name.clone()
        } else if expver < 0x300 {
            format!("{}{}", name, self.config().loader.legacy_extension)
        } else {
            format!("{}{}", name, self.config().loader.default_extension)
        };
        let hdll = self.load_module_16(&file, true, true).map_err(|e| {
            warn!("could not load {} required by {}: {}", file, modname, e);
            KernelError::ModuleNotFound(file.clone())
        })?;
        Ok((hdll, true))
    }

    /// Drop the references a failed load took on its imported modules.
    fn release_modrefs(&self, modrefs: &[u16]) {
        for &dll in modrefs.iter().filter(|h| **h != 0) {
            self.free_module_ex(dll, false);
        }
    }

    fn load_all_segments(&self, hmodule: u16) -> Result<()> {
        let (cseg, selfload) = self.with_state(|st| {
            get_module(&st.heap, hmodule)
                .map(|m| (m.cseg(), m.has(ModuleFlags::SELFLOAD)))
                .ok_or(KernelError::InvalidHandle(hmodule))
        })?;
        let image = self
            .state()
            .images
            .get(&hmodule)
            .cloned()
            .ok_or(KernelError::InvalidHandle(hmodule))?;
        if !selfload {
            return self.with_state(|st| {
                for segnum in 1..=cseg {
                    load_segment(&mut st.heap, hmodule, segnum, &image)?;
                }
                Ok(())
            });
        }

        let (sel, stack_sel) = self.with_state(|st| -> Result<(u16, u16)> {
            let hkernel = st.hkernel;
            let entry_addr = get_module(&st.heap, hkernel).map(|k| k.entry_point(667)).unwrap_or(0);
            let alloc = get_module(&st.heap, hkernel).map(|k| k.entry_point(668)).unwrap_or(0);
            let mut module = get_module_mut(&mut st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
            module.set_count(1);
            load_segment(&mut st.heap, hmodule, 1, &image)?;
            let sel = get_module(&st.heap, hmodule)
                .and_then(|m| m.seg(1))
                .map(|s| handle_to_sel(s.hseg))
                .ok_or(KernelError::InvalidHandle(hmodule))?;
            st.heap
                .write(make_segptr(sel, SELFLOAD_ENTRY_ADDR_PROC), entry_addr.to_le_bytes())?;
            st.heap.write(make_segptr(sel, SELFLOAD_MY_ALLOC), alloc.to_le_bytes())?;
            let stack = st.heap.alloc(GlobalFlags::ZEROINIT, SELFLOAD_STACK_SIZE, hmodule);
            if stack == 0 {
                return Err(KernelError::OutOfMemory(SELFLOAD_STACK_SIZE));
            }
            let stack_sel = handle_to_sel(stack);
            get_module_mut(&mut st.heap, hmodule)
                .ok_or(KernelError::InvalidHandle(hmodule))?
                .set_self_loading_sel(stack_sel);
            Ok((sel, stack_sel))
        })?;

        let boot_app = self.read_far_ptr(make_segptr(sel, SELFLOAD_BOOT_APP))?;
        let hfile = self.state().files.open(image.clone());
        debug!("self-loading {:#06x}: BootApp at {:04x}:{:04x}", hmodule, selector_of(boot_app), offset_of(boot_app));
        let booted = self.call_on_stack(boot_app, stack_sel, &[hfile, hmodule]);
        self.lclose(hfile);
        booted?;

        for segnum in 2..=cseg {
            self.load_app_seg(hmodule, segnum)?;
        }
        Ok(())
    }

    /// Have a self-loading module's `LoadAppSeg` bring in segment `segnum`.
    fn load_app_seg(&self, hmodule: u16, segnum: u16) -> Result<()> {
        let (sel, stack_sel, image) = self.with_state(|st| -> Result<_> {
            let module = get_module(&st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
            let sel = module.seg(1).map(|s| handle_to_sel(s.hseg)).unwrap_or(0);
            let stack_sel = module.self_loading_sel();
            let image = st.images.get(&hmodule).cloned().ok_or(KernelError::InvalidHandle(hmodule))?;
            Ok((sel, stack_sel, image))
        })?;
        let load_app_seg = self.read_far_ptr(make_segptr(sel, SELFLOAD_LOAD_APP_SEG))?;
        let hfile = self.state().files.open(image);
        let loaded = self.call_on_stack(load_app_seg, stack_sel, &[segnum, hfile, hmodule]);
        self.lclose(hfile);
        let hseg = loword(loaded?);
        trace!("LoadAppSeg({}) of {:#06x} gave {:#06x}", segnum, hmodule, hseg);
        self.with_state(|st| {
            let mut module = get_module_mut(&mut st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
            let mut seg = module.seg(segnum).ok_or(KernelError::InvalidHandle(segnum))?;
            seg.hseg = hseg;
            seg.flags |= SegmentFlags::LOADED.bits();
            module.set_seg(segnum, &seg);
            Ok(())
        })
    }

    fn read_far_ptr(&self, at: SegPtr) -> Result<SegPtr> {
        let bytes = self.read_bytes(at, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn call_on_stack(&self, target: SegPtr, ss: u16, args: &[u16]) -> Result<u32> {
        let mut ctx = Context16 {
            cs: selector_of(target),
            eip: offset_of(target) as u32,
            ss,
            ..Default::default()
        };
        ctx.esp = (SELFLOAD_STACK_SIZE - SELFLOAD_STACK_SLACK as u32) & 0xfffe;
        Ok(self.call_to_16_regs(ctx, args)?.dx_ax())
    }

    /// Run the init code of `hmodule`'s queued libraries, depth first, then its
    /// own.
    pub(crate) fn initialize_dlls(&self, hmodule: u16) -> Result<()> {
        let pending = self.with_state(|st| -> Result<Vec<u16>> {
            let mut module = match get_module_mut(&mut st.heap, hmodule) {
                Some(m) => m,
                None => return Ok(vec![]),
            };
            let block = module.dlls_to_init();
            if block == 0 {
                return Ok(vec![]);
            }
            module.set_dlls_to_init(0);
            let raw = st.heap.segment(handle_to_sel(block))?;
            let list = raw
                .chunks_exact(2)
                .map(|w| u16::from_le_bytes([w[0], w[1]]))
                .take_while(|h| *h != 0)
                .collect();
            st.heap.free(block);
            Ok(list)
        })?;
        for dll in pending {
            self.initialize_dlls(dll)?;
        }
        self.init_dll(hmodule)
    }

    /// Call a library's `LibMain` once: `cx` heap size, `di` instance,
    /// `ds`/`es` its data segment.
    fn init_dll(&self, hmodule: u16) -> Result<()> {
        let prepared = self.with_state(|st| {
            let mut module = get_module_mut(&mut st.heap, hmodule)?;
            if !module.is_lib() || module.is_win32() || selector_of(module.csip()) == 0 {
                return None;
            }
            let csip = module.csip();
            let cs = module.seg(selector_of(csip)).map(|s| handle_to_sel(s.hseg))?;
            module.set_csip(0);
            let params = dll_init_params(&st.heap, hmodule);
            Some((cs, offset_of(csip), params, get_module(&st.heap, hmodule)?.name()))
        });
        let (cs, ip, params, name) = match prepared {
            Some(p) => p,
            None => return Ok(()),
        };
        debug!(
            "LibMain of {} at {:04x}:{:04x} ds={:04x} di={:04x} cx={:04x}",
            name, cs, ip, params.ds, params.hinstance, params.heap
        );
        let ctx = Context16 {
            cs,
            eip: ip as u32,
            ecx: params.heap as u32,
            edi: params.hinstance as u32,
            ds: params.ds,
            es: params.ds,
            ..Default::default()
        };
        let ctx = self.call_to_16_regs(ctx, &[])?;
        if ctx.ax() == 0 {
            warn!("LibMain of {} failed", name);
        }
        Ok(())
    }

    /// Send process attach to `hmodule`'s libraries, dependencies first.
    pub(crate) fn dll_process_attach(&self, hmodule: u16) {
        let modrefs = self.with_state(|st| {
            let mut module = get_module_mut(&mut st.heap, hmodule)?;
            if module.is_win32() || module.flagsothers() & FLAGSOTHERS_VISITING != 0 {
                return None;
            }
            let others = module.flagsothers();
            module.set_flagsothers(others | FLAGSOTHERS_VISITING);
            Some(module.modrefs())
        });
        let modrefs = match modrefs {
            Some(m) => m,
            None => return,
        };
        for dll in modrefs.into_iter().filter(|h| *h != 0) {
            self.dll_process_attach(dll);
        }
        if let Err(e) = self.call_dll_entry_point(hmodule, DLL_PROCESS_ATTACH) {
            warn!("DllEntryPoint of {:#06x}: {}", hmodule, e);
        }
        self.with_state(|st| {
            if let Some(mut module) = get_module_mut(&mut st.heap, hmodule) {
                let others = module.flagsothers();
                module.set_flagsothers(others & !FLAGSOTHERS_VISITING);
            }
        });
    }

    fn call_dll_entry_point(&self, hmodule: u16, reason: u16) -> Result<()> {
        let prepared = self.with_state(|st| {
            let module = get_module(&st.heap, hmodule)?;
            if !module.is_lib() || (!module.has(ModuleFlags::BUILTIN) && module.expver() < 0x400) {
                return None;
            }
            let entry = match get_ordinal(&st.heap, hmodule, "DllEntryPoint") {
                0 => return None,
                ordinal => module.entry_point(ordinal),
            };
            if entry == 0 {
                return None;
            }
            Some((entry, dll_init_params(&st.heap, hmodule)))
        });
        let (entry, params) = match prepared {
            Some(p) => p,
            None => return Ok(()),
        };
        trace!("DllEntryPoint of {:#06x} at {:#010x}", hmodule, entry);
        let ctx = Context16 {
            cs: selector_of(entry),
            eip: offset_of(entry) as u32,
            ds: params.ds,
            es: params.ds,
            ..Default::default()
        };
        self.call_to_16_regs(ctx, &[0, 0, 0, params.heap, params.ds, params.hinstance, reason, 0])?;
        Ok(())
    }

    /// `FreeModule`. True if the module is still loaded elsewhere or was
    /// freed, false for invalid and built-in modules.
    pub fn free_module(&self, handle: u16) -> bool {
        let _win16 = self.win16().lock();
        self.free_module_ex(handle, true)
    }

    pub fn free_library(&self, handle: u16) {
        self.free_module(handle);
    }

    pub(crate) fn free_module_ex(&self, handle: u16, mut call_wep: bool) -> bool {
        let hmodule = self.get_exe_ptr(handle);
        let (remaining, flags) = match self.with_state(|st| {
            let mut module = get_module_mut(&mut st.heap, hmodule)?;
            let count = module.count() as i16 - 1;
            module.set_count(count.max(0) as u16);
            Some((count, module.flags()))
        }) {
            Some(r) => r,
            None => return false,
        };
        trace!("free {:#06x}, count now {}", hmodule, remaining);
        if remaining > 0 {
            return true;
        }
        if flags.contains(ModuleFlags::BUILTIN) {
            return false;
        }
        if call_wep && !flags.contains(ModuleFlags::WIN32) {
            if flags.contains(ModuleFlags::LIBMODULE) {
                self.call_wep(hmodule);
            } else {
                call_wep = false;
            }
        }

        let modrefs = self.with_state(|st| {
            let (next, modrefs, name) = match get_module(&st.heap, hmodule) {
                Some(m) => (m.next(), m.modrefs(), m.name()),
                None => return vec![],
            };
            st.unlink_module(hmodule, next);
            if let Some(mut module) = get_module_mut(&mut st.heap, hmodule) {
                module.set_self_handle(0);
                module.set_word(0, 0);
            }
            info!("unloaded module {}", name);
            modrefs
        });
        for dll in modrefs.into_iter().filter(|h| *h != 0) {
            self.free_module_ex(dll, call_wep);
        }
        self.with_state(|st| {
            st.heap.free_all(hmodule);
            st.images.remove(&hmodule);
            st.host_modules.remove(&hmodule);
        });
        true
    }

    /// Call a library's `WEP`; a fault in it is logged and ignored.
    fn call_wep(&self, hmodule: u16) {
        let wep = self.get_proc_address(hmodule, "WEP");
        if wep == 0 {
            return;
        }
        match self.call_to_16(wep, &[WEP_FREE_DLL]) {
            Ok(ret) => trace!("WEP of {:#06x} returned {}", hmodule, loword(ret)),
            Err(e) => warn!("WEP of {:#06x}: {}", hmodule, e),
        }
    }

    pub fn get_exe_ptr(&self, handle: u16) -> u16 {
        self.with_state(|st| st.get_exe_ptr(handle))
    }

    /// Module handle for a name, 0 if no such module is loaded.
    pub fn get_module_handle(&self, name: &str) -> u16 {
        self.with_state(|st| st.find_module(name))
    }

    pub fn get_module_usage(&self, handle: u16) -> u16 {
        self.with_state(|st| {
            get_module(&st.heap, st.get_exe_ptr(handle))
                .map(|m| m.count())
                .unwrap_or(0)
        })
    }

    pub fn get_module_name(&self, handle: u16) -> Option<String> {
        self.with_state(|st| get_module(&st.heap, st.get_exe_ptr(handle)).map(|m| m.name()))
    }

    /// Path the module came from; 0 means the current task's module.
    pub fn get_module_file_name(&self, handle: u16) -> Option<String> {
        self.with_state(|st| {
            let handle = if handle == 0 { st.current_task() } else { handle };
            get_module(&st.heap, st.get_exe_ptr(handle)).map(|m| m.file_name())
        })
    }

    pub fn get_exp_win_ver(&self, handle: u16) -> u16 {
        self.with_state(|st| {
            get_module(&st.heap, st.get_exe_ptr(handle))
                .map(|m| m.expver())
                .unwrap_or(0)
        })
    }

    /// Far address of an export by name (`#n` names an ordinal). A zero
    /// module means the current task's.
    pub fn get_proc_address(&self, handle: u16, name: &str) -> SegPtr {
        self.with_state(|st| {
            let handle = if handle == 0 { st.current_task() } else { handle };
            let hmodule = st.get_exe_ptr(handle);
            let ordinal = get_ordinal(&st.heap, hmodule, name);
            if ordinal == 0 {
                trace!("{} not exported by {:#06x}", name, hmodule);
                return 0;
            }
            get_module(&st.heap, hmodule)
                .map(|m| m.entry_point(ordinal))
                .unwrap_or(0)
        })
    }

    pub fn get_proc_address_ordinal(&self, handle: u16, ordinal: u16) -> SegPtr {
        self.with_state(|st| {
            let handle = if handle == 0 { st.current_task() } else { handle };
            get_module(&st.heap, st.get_exe_ptr(handle))
                .map(|m| m.entry_point(ordinal))
                .unwrap_or(0)
        })
    }

    /// `EntryAddrProc`, for self-loading modules.
    pub fn entry_addr_proc(&self, hmodule: u16, ordinal: u16) -> SegPtr {
        self.with_state(|st| {
            get_module(&st.heap, st.get_exe_ptr(hmodule))
                .map(|m| m.entry_point(ordinal))
                .unwrap_or(0)
        })
    }

    /// Move an entry point within its segment.
    pub fn set_entry_point(&self, hmodule: u16, ordinal: u16, offset: u16) -> bool {
        self.with_state(|st| {
            get_module_mut(&mut st.heap, hmodule)
                .map(|mut m| m.set_entry_point(ordinal, offset))
                .unwrap_or(false)
        })
    }

    /// `MyAlloc`, the segment allocator handed to self-loading modules.
    pub fn my_alloc(&self, flags: u16, size: u16, elem: u16) -> u32 {
        self.with_state(|st| {
            let owner = st.alloc_owner(GlobalFlags::empty());
            my_alloc(&mut st.heap, owner, flags, size, elem)
        })
    }

    /// Head of the module list.
    pub fn module_first(&self) -> u16 {
        self.state().first_module
    }

    /// The module after `hmodule` in the list, 0 at the end.
    pub fn module_next(&self, hmodule: u16) -> u16 {
        self.with_state(|st| get_module(&st.heap, hmodule).map(|m| m.next()).unwrap_or(0))
    }

    /// DGROUP of a module, or the module itself if it has none.
    pub fn get_instance(&self, handle: u16) -> u16 {
        self.with_state(|st| {
            get_module(&st.heap, st.get_exe_ptr(handle))
                .map(|m| m.instance())
                .unwrap_or(0)
        })
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.with_state(|st| {
            st.module_list()
                .into_iter()
                .filter_map(|h| st.module_info(h))
                .collect()
        })
    }

    pub fn module_info(&self, handle: u16) -> Option<ModuleInfo> {
        self.with_state(|st| st.module_info(st.get_exe_ptr(handle)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_part() {
        assert_eq!(file_part("C:\\WINDOWS\\SYSTEM\\GDI.EXE"), "GDI.EXE");
        assert_eq!(file_part("a:b.dll"), "b.dll");
        assert_eq!(file_part("/tmp/x/user.exe"), "user.exe");
        assert!(has_extension("USER.EXE"));
        assert!(!has_extension("C:\\DIR.X\\USER"));
    }

    #[test]
    fn test_load_params_default() {
        let p = LoadParams::default();
        assert_eq!(p.cmd_show, 1);
        assert!(p.cmdline.is_empty());
    }
}
