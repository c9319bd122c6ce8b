//! The built-in KERNEL module and the relay into host code.
//!
//! KERNEL is a real NE module whose only code segment is a row of 8-byte
//! stubs. Stub `n` is `ud2` followed by the word `n`; the export for ordinal
//! `n` points at it. When 16-bit code calls an export the CPU traps on the
//! stub, the relay reads the ordinal back, pulls the arguments off the 16-bit
//! stack according to the export's calling convention and dispatches to the
//! matching [`Kernel`] method. Stub 0 is the return address of host-initiated
//! calls and never dispatches.

use std::{collections::BTreeMap, str::FromStr};

use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use lazy_static::lazy_static;
use log::{debug, error, info, trace, warn};
use serde::Deserialize;
use strum::{EnumString, EnumVariantNames};

use super::{Kernel, KernelState};
use crate::{
    cc::{ArgKind, CallingConvention, Cdecl16, Pascal16, ReturnKind},
    cpu::TRAP_OPCODE,
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags},
    local::LocalFlags,
    ne::{
        builder::NeBuilder,
        module::{build_module, get_module_mut, ModuleFlags},
        segment::{create_all_segments, load_segment},
    },
    registers::Context16,
    stack::{Frame16, Stack},
    utils::{hiword, loword, SegPtr},
};

/// Stub whose trap ends a host-initiated call.
pub const RETURN_STUB: u16 = 0;
pub const STUB_SIZE: u16 = 8;
pub const BUILTIN_PATH: &str = "KRNL386.EXE";
/// `DefResourceHandler`, the loader installed on every resource type.
pub const DEF_RESOURCE_HANDLER: u16 = 456;
/// `DOS3Call`, reached through the PDB's CP/M style entry.
pub const DOS3CALL: u16 = 102;
/// Windows 3.10 on DOS 6.22, as `GetVersion` packs it.
const VERSION: u32 = 0x0616_0a03;

#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Convention {
    Pascal,
    Cdecl,
    /// The handler sees and edits the caller's registers; nothing is popped
    /// but the return address.
    Register,
}

#[derive(Clone, Debug)]
pub struct ExportSpec {
    pub ordinal: u16,
    pub name: String,
    pub args: Vec<ArgKind>,
    pub ret: ReturnKind,
    pub convention: Convention,
}

#[derive(Deserialize)]
struct RawExport {
    ordinal: u16,
    name: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    ret: Option<String>,
    #[serde(default)]
    convention: Option<String>,
}

const KERNEL_EXPORT_TABLE: &str = include_str!("exports.json");

fn parse_export_table(data: &str) -> Result<BTreeMap<u16, ExportSpec>> {
    let raw: Vec<RawExport> = serde_json::from_str(data).map_err(|e| anyhow!("export table: {}", e))?;
    let mut result = BTreeMap::new();
    for e in raw {
        let args = e
            .args
            .iter()
            .map(|a| ArgKind::from_str(a).map_err(|_| anyhow!("{}: bad argument kind {}", e.name, a)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ret = match &e.ret {
            Some(r) => ReturnKind::from_str(r).map_err(|_| anyhow!("{}: bad return kind {}", e.name, r))?,
            None => ReturnKind::Word,
        };
        let convention = match &e.convention {
            Some(c) => Convention::from_str(c).map_err(|_| anyhow!("{}: bad convention {}", e.name, c))?,
            None => Convention::Pascal,
        };
        result.insert(
            e.ordinal,
            ExportSpec {
                ordinal: e.ordinal,
                name: e.name,
                args,
                ret,
                convention,
            },
        );
    }
    Ok(result)
}

lazy_static! {
    pub static ref EXPORTS: BTreeMap<u16, ExportSpec> = parse_export_table(KERNEL_EXPORT_TABLE)
        .unwrap_or_else(|e| {
            error!("{}", e);
            BTreeMap::new()
        });
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumVariantNames, EnumString)]
pub enum KernelCall {
    FatalExit,
    GetVersion,
    LocalInit,
    LocalAlloc,
    LocalReAlloc,
    LocalFree,
    LocalLock,
    LocalUnlock,
    LocalSize,
    LocalHandle,
    LocalFlags,
    LocalCompact,
    GlobalAlloc,
    GlobalReAlloc,
    GlobalFree,
    GlobalLock,
    GlobalUnlock,
    GlobalSize,
    GlobalHandle,
    GlobalFlags,
    LockSegment,
    UnlockSegment,
    GlobalCompact,
    GetModuleName,
    Yield,
    WaitEvent,
    PostEvent,
    SetPriority,
    GetCurrentTask,
    GetCurrentPDB,
    LoadModule,
    FreeModule,
    GetModuleHandle,
    GetModuleUsage,
    GetModuleFileName,
    GetProcAddress,
    MakeProcInstance,
    FreeProcInstance,
    FindResource,
    LoadResource,
    LockResource,
    FreeResource,
    SizeofResource,
    AllocResource,
    SetResourceHandler,
    InitAtomTable,
    FindAtom,
    AddAtom,
    DeleteAtom,
    GetAtomName,
    GetAtomHandle,
    _lclose,
    _lread,
    _llseek,
    InitTask,
    LoadLibrary,
    FreeLibrary,
    DOS3Call,
    OutputDebugString,
    GetExePtr,
    GetHeapSpaces,
    DirectedYield,
    GetTaskDS,
    LocalCountFree,
    LocalHeapSize,
    WinExec,
    GetExpWinVer,
    AllocCStoDSAlias,
    AllocDStoCSAlias,
    AllocSelector,
    FreeSelector,
    PrestoChangoSelector,
    GlobalDOSAlloc,
    GlobalDOSFree,
    GetSelectorBase,
    SetSelectorBase,
    GetSelectorLimit,
    SetSelectorLimit,
    GlobalPageLock,
    GlobalPageUnlock,
    SelectorAccessRights,
    LocalHandleDelta,
    IsTask,
    _DebugOutput,
    FarSetOwner,
    FarGetOwner,
    DefResourceHandler,
    EntryAddrProc,
    MyAlloc,
}

/// NE image of the KERNEL module: one code segment of relay stubs, every
/// export pointing at its stub.
pub fn relay_image() -> Vec<u8> {
    let last = EXPORTS.keys().next_back().copied().unwrap_or(0);
    let mut code = BytesMut::with_capacity((last as usize + 1) * STUB_SIZE as usize);
    for n in 0..=last {
        code.put_slice(&TRAP_OPCODE);
        code.put_u16_le(n);
        code.put_bytes(0x90, STUB_SIZE as usize - 4);
    }
    let mut builder = NeBuilder::new("KERNEL");
    builder.lib(true);
    let seg = builder.code_segment(code.to_vec());
    for (ordinal, spec) in EXPORTS.iter() {
        builder.export(&spec.name, *ordinal, seg, ordinal * STUB_SIZE);
    }
    builder.build()
}

impl Kernel {
    /// Load the KERNEL module and remember where its relay stubs live.
    pub(crate) fn create_builtin(&self) -> Result<()> {
        let image = relay_image();
        let mut guard = self.state();
        let st: &mut KernelState = &mut guard;
        let hmodule = build_module(&mut st.heap, &image, BUILTIN_PATH)?;
        create_all_segments(&mut st.heap, hmodule)?;
        load_segment(&mut st.heap, hmodule, 1, &image)?;

        let mut module = get_module_mut(&mut st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
        module.insert_flags(ModuleFlags::BUILTIN);
        module.set_count(1);
        module.set_next(st.first_module);
        let relay_sel = module.seg(1).map(|s| handle_to_sel(s.hseg)).unwrap_or(0);
        let default_loader = module.entry_point(DEF_RESOURCE_HANDLER);
        st.first_module = hmodule;
        st.hkernel = hmodule;
        st.relay_sel = relay_sel;
        st.default_loader = default_loader;
        debug!(
            "KERNEL {:#06x}: {} exports, relay segment {:#06x}",
            hmodule,
            EXPORTS.len(),
            relay_sel
        );
        Ok(())
    }

    /// Run the export behind stub `ordinal` for the 16-bit caller in `ctx`,
    /// leaving `ctx` as the caller sees it after the far return.
    pub(crate) fn relay_call(&self, ordinal: u16, ctx: &mut Context16) -> Result<()> {
        let spec = EXPORTS
            .get(&ordinal)
            .ok_or_else(|| anyhow!("no KERNEL export for stub {}", ordinal))?;
        let call = KernelCall::from_str(&spec.name)
            .map_err(|_| anyhow!("KERNEL.{} {} has no handler", ordinal, spec.name))?;
        trace!("relay KERNEL.{} {} from ss:sp={:04x}:{:04x}", ordinal, spec.name, ctx.ss, ctx.esp as u16);

        self.state().thread().frames.push(*ctx);
        let result = match spec.convention {
            Convention::Register => self.relay_register(call, ctx),
            Convention::Pascal => self.relay_stack_args(&Pascal16, call, spec, ctx),
            Convention::Cdecl => self.relay_stack_args(&Cdecl16, call, spec, ctx),
        };
        self.state().thread().frames.pop();
        result
    }

    fn relay_register(&self, call: KernelCall, ctx: &mut Context16) -> Result<()> {
        match call {
            KernelCall::InitTask => self.init_task(ctx)?,
            KernelCall::DOS3Call => self.dos3call(ctx)?,
            other => return Err(anyhow!("{:?} is not a register function", other).into()),
        }
        let mut st = self.state();
        let mut frame = Frame16::new(&mut st.heap, ctx);
        let ip = frame.stack_pop()?;
        let cs = frame.stack_pop()?;
        ctx.cs = cs;
        ctx.eip = ip as u32;
        Ok(())
    }

    fn relay_stack_args(
        &self,
        cc: &impl CallingConvention,
        call: KernelCall,
        spec: &ExportSpec,
        ctx: &mut Context16,
    ) -> Result<()> {
        let params = {
            let mut st = self.state();
            let frame = Frame16::new(&mut st.heap, ctx);
            cc.get_params(&frame, &spec.args)?
        };
        let ret = self.call_export(call, &params, ctx)?;
        cc.set_return_value(ctx, spec.ret, ret);
        let (cs, ip) = {
            let mut st = self.state();
            let mut frame = Frame16::new(&mut st.heap, ctx);
            cc.unwind(&mut frame, &spec.args)?
        };
        ctx.cs = cs;
        ctx.eip = ip as u32;
        trace!("{} returned {:#x}", spec.name, ret);
        Ok(())
    }

    fn str_arg(&self, ptr: SegPtr) -> Result<String> {
        Ok(self.far_ptr_string(ptr)?.unwrap_or_default())
    }

    /// A string argument that may be an integer atom in disguise.
    fn atom_arg(&self, ptr: SegPtr) -> Result<String> {
        if hiword(ptr) == 0 {
            return Ok(format!("#{}", loword(ptr)));
        }
        self.str_arg(ptr)
    }

    fn write_str_arg(&self, ptr: SegPtr, s: &str, count: usize) -> Result<u32> {
        Ok(self.with_state(|st| st.write_string(ptr, s, count))? as u32)
    }

    fn call_export(&self, call: KernelCall, p: &[u32], ctx: &mut Context16) -> Result<u32> {
        let w = |i: usize| p[i] as u16;
        let ds = ctx.ds;
        let ret = match call {
            KernelCall::FatalExit => {
                error!("FatalExit({})", w(0));
                return Err(KernelError::TaskExit(w(0)));
            }
            KernelCall::GetVersion => VERSION,
            KernelCall::LocalInit => {
                let seg = if w(0) == 0 { ds } else { w(0) };
                self.local_init(seg, w(1), w(2)) as u32
            }
            KernelCall::LocalAlloc => self.local_alloc(ds, LocalFlags::from_bits_truncate(w(0)), w(1)) as u32,
            KernelCall::LocalReAlloc => {
                self.local_realloc(ds, w(0), w(1), LocalFlags::from_bits_truncate(w(2))) as u32
            }
            KernelCall::LocalFree => self.local_free(ds, w(0)) as u32,
            KernelCall::LocalLock => self.local_lock(ds, w(0)) as u32,
            KernelCall::LocalUnlock => self.local_unlock(ds, w(0)) as u32,
            KernelCall::LocalSize => self.local_size(ds, w(0)) as u32,
            KernelCall::LocalHandle => self.local_handle(ds, w(0)) as u32,
            KernelCall::LocalFlags => self.local_flags(ds, w(0)) as u32,
            KernelCall::LocalCompact => self.local_compact(ds, w(0)) as u32,
            KernelCall::LocalCountFree => self.local_count_free(ds) as u32,
            KernelCall::LocalHeapSize => self.local_heap_size(ds) as u32,
            KernelCall::LocalHandleDelta => self.local_handle_delta(ds, w(0)) as u32,
            KernelCall::GlobalAlloc => self.global_alloc(GlobalFlags::from_bits_truncate(w(0)), p[1]) as u32,
            KernelCall::GlobalReAlloc => {
                self.global_realloc(w(0), p[1], GlobalFlags::from_bits_truncate(w(2))) as u32
            }
            KernelCall::GlobalFree => self.global_free(w(0)) as u32,
            KernelCall::GlobalLock | KernelCall::LockResource => self.global_lock(w(0)),
            KernelCall::GlobalUnlock => self.global_unlock(w(0)) as u32,
            KernelCall::GlobalSize => self.global_size(w(0)),
            KernelCall::GlobalHandle => self.global_handle(w(0)),
            KernelCall::GlobalFlags => self.global_flags(w(0)) as u32,
            KernelCall::LockSegment | KernelCall::UnlockSegment => {
                let handle = match w(0) {
                    0xffff => loword(self.global_handle(ds)),
                    h => h,
                };
                if call == KernelCall::LockSegment {
                    self.lock_segment(handle) as u32
                } else {
                    self.unlock_segment(handle) as u32
                }
            }
            KernelCall::GlobalCompact => self.global_compact(p[0]),
            KernelCall::GlobalPageLock => self.global_page_lock(w(0)) as u32,
            KernelCall::GlobalPageUnlock => self.global_page_unlock(w(0)) as u32,
            KernelCall::GlobalDOSAlloc => self.global_dos_alloc(p[0]),
            KernelCall::GlobalDOSFree => self.global_dos_free(w(0)) as u32,
            KernelCall::GetHeapSpaces => self.get_heap_spaces(w(0)),
            KernelCall::FarSetOwner => {
                self.far_set_owner(w(0), w(1));
                0
            }
            KernelCall::FarGetOwner => self.far_get_owner(w(0)) as u32,

            KernelCall::GetModuleName => match self.get_module_name(w(0)) {
                Some(name) => {
                    self.write_str_arg(p[1], &name, w(2) as usize)?;
                    1
                }
                None => 0,
            },
            KernelCall::GetModuleFileName => {
                let size = p[2] as i32;
                match self.get_module_file_name(w(0)) {
                    Some(path) if size > 0 => self.write_str_arg(p[1], &path, size as usize)?,
                    _ => 0,
                }
            }
            KernelCall::LoadModule => {
                let name = self.str_arg(p[0])?;
                let params = self.read_load_params(p[1])?;
                match self.load_module(&name, params.as_ref()) {
                    Ok(h) => h as u32,
                    Err(e) => {
                        warn!("LoadModule({}): {}", name, e);
                        e.legacy_code() as u32
                    }
                }
            }
            KernelCall::LoadLibrary => {
                let name = self.str_arg(p[0])?;
                match self.load_library(&name) {
                    Ok(h) => h as u32,
                    Err(e) => {
                        warn!("LoadLibrary({}): {}", name, e);
                        e.legacy_code() as u32
                    }
                }
            }
            KernelCall::WinExec => {
                let cmdline = self.str_arg(p[0])?;
                match self.win_exec(&cmdline, w(1)) {
                    Ok(h) => h as u32,
                    Err(e) => {
                        warn!("WinExec({}): {}", cmdline, e);
                        e.legacy_code() as u32
                    }
                }
            }
            KernelCall::FreeModule => self.free_module(w(0)) as u32,
            KernelCall::FreeLibrary => {
                self.free_library(w(0));
                0
            }
            KernelCall::GetModuleHandle => {
                let hmodule = if hiword(p[0]) == 0 {
                    self.get_exe_ptr(loword(p[0]))
                } else {
                    self.get_module_handle(&self.str_arg(p[0])?)
                };
                ((self.state().first_module as u32) << 16) | hmodule as u32
            }
            KernelCall::GetModuleUsage => self.get_module_usage(w(0)) as u32,
            KernelCall::GetExePtr => self.get_exe_ptr(w(0)) as u32,
            KernelCall::GetExpWinVer => self.get_exp_win_ver(w(0)) as u32,
            KernelCall::GetProcAddress => {
                if hiword(p[1]) == 0 {
                    self.get_proc_address_ordinal(w(0), loword(p[1]))
                } else {
                    self.get_proc_address(w(0), &self.str_arg(p[1])?)
                }
            }
            KernelCall::EntryAddrProc => self.entry_addr_proc(w(0), w(1)),
            KernelCall::MyAlloc => self.my_alloc(w(0), w(1), w(2)),

            KernelCall::Yield => {
                self.yield_task();
                0
            }
            KernelCall::DirectedYield => {
                self.directed_yield(w(0));
                0
            }
            KernelCall::WaitEvent => self.wait_event(w(0)) as u32,
            KernelCall::PostEvent => {
                self.post_event(w(0));
                0
            }
            KernelCall::SetPriority => {
                self.set_priority(w(0), p[1] as i16);
                0
            }
            KernelCall::GetCurrentTask => {
                let st = self.state();
                ((st.first_task as u32) << 16) | st.current_task() as u32
            }
            KernelCall::GetCurrentPDB => self.get_current_pdb() as u32,
            KernelCall::IsTask => self.is_task(w(0)) as u32,
            KernelCall::GetTaskDS => self.get_task_ds() as u32,
            KernelCall::MakeProcInstance => {
                let hinstance = if w(1) == 0 { ds } else { w(1) };
                self.make_proc_instance(p[0], hinstance)?
            }
            KernelCall::FreeProcInstance => {
                self.free_proc_instance(p[0]);
                0
            }

            KernelCall::FindResource => {
                let name = self.res_id(p[1])?;
                let type_id = self.res_id(p[2])?;
                self.find_resource(w(0), &type_id, &name) as u32
            }
            KernelCall::LoadResource => self.load_resource(w(0), w(1)) as u32,
            KernelCall::FreeResource => self.free_resource(w(0)) as u32,
            KernelCall::SizeofResource => self.sizeof_resource(w(0), w(1)),
            KernelCall::AllocResource => self.alloc_resource(w(0), w(1), p[2]) as u32,
            KernelCall::SetResourceHandler => {
                let type_id = self.res_id(p[1])?;
                self.set_resource_handler(w(0), &type_id, p[2])
            }
            KernelCall::DefResourceHandler => self.def_resource_handler(w(0), w(1), w(2)) as u32,

            KernelCall::InitAtomTable => self.init_atom_table(ds, w(0)) as u32,
            KernelCall::FindAtom => self.find_atom(ds, &self.atom_arg(p[0])?) as u32,
            KernelCall::AddAtom => self.add_atom(ds, &self.atom_arg(p[0])?) as u32,
            KernelCall::DeleteAtom => self.delete_atom(ds, w(0)) as u32,
            KernelCall::GetAtomName => match self.get_atom_name(ds, w(0), w(2) as usize) {
                Some(name) => self.write_str_arg(p[1], &name, w(2) as usize)?,
                None => 0,
            },
            KernelCall::GetAtomHandle => self.get_atom_handle(ds, w(0)) as u32,

            KernelCall::_lclose => self.lclose(w(0)) as u32,
            KernelCall::_lread => self.lread(w(0), p[1], w(2))? as u32,
            KernelCall::_llseek => self.llseek(w(0), p[1] as i32, w(2)),

            KernelCall::AllocCStoDSAlias => self.alloc_cs_to_ds_alias(w(0)) as u32,
            KernelCall::AllocDStoCSAlias => self.alloc_ds_to_cs_alias(w(0)) as u32,
            KernelCall::AllocSelector => self.alloc_selector(w(0)) as u32,
            KernelCall::FreeSelector => self.free_selector(w(0)) as u32,
            KernelCall::PrestoChangoSelector => self.presto_chango_selector(w(0), w(1)) as u32,
            KernelCall::GetSelectorBase => self.get_selector_base(w(0)),
            KernelCall::SetSelectorBase => self.set_selector_base(w(0), p[1]) as u32,
            KernelCall::GetSelectorLimit => self.get_selector_limit(w(0)),
            KernelCall::SetSelectorLimit => self.set_selector_limit(w(0), p[1]) as u32,
            KernelCall::SelectorAccessRights => self.selector_access_rights(w(0), w(1), w(2)) as u32,

            KernelCall::OutputDebugString => {
                info!("OutputDebugString: {}", self.str_arg(p[0])?.trim_end());
                0
            }
            KernelCall::_DebugOutput => {
                debug!("_DebugOutput({:#06x}): {}", w(0), self.str_arg(p[1])?.trim_end());
                0
            }
            KernelCall::InitTask | KernelCall::DOS3Call => {
                return Err(anyhow!("{:?} takes registers", call).into());
            }
        };
        Ok(ret)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ne::module::get_module;
    use strum::VariantNames;

    #[test]
    fn test_table_matches_handlers() {
        let table = parse_export_table(KERNEL_EXPORT_TABLE).unwrap();
        assert_eq!(table.len(), KernelCall::VARIANTS.len());
        for spec in table.values() {
            assert!(KernelCall::from_str(&spec.name).is_ok(), "{}", spec.name);
        }
        assert_eq!(table[&DOS3CALL].convention, Convention::Register);
        assert_eq!(table[&328].convention, Convention::Cdecl);
        assert_eq!(table[&15].args, vec![ArgKind::Word, ArgKind::Long]);
        assert_eq!(table[&36].ret, ReturnKind::Long);
        assert_eq!(table[&29].ret, ReturnKind::Void);
    }

    #[test]
    fn test_bad_table() {
        assert!(parse_export_table(r#"[{"ordinal": 1, "name": "X", "args": ["quad"]}]"#).is_err());
        assert!(parse_export_table("{").is_err());
    }

    #[test]
    fn test_relay_image() {
        let image = relay_image();
        let mut heap = crate::global::GlobalHeap::new(&Default::default());
        let h = build_module(&mut heap, &image, BUILTIN_PATH).unwrap();
        create_all_segments(&mut heap, h).unwrap();
        load_segment(&mut heap, h, 1, &image).unwrap();
        let module = get_module(&heap, h).unwrap();
        assert_eq!(module.name(), "KERNEL");
        assert!(module.is_lib());

        let dos = module.entry_point(DOS3CALL);
        assert_eq!(dos & 0xffff, (DOS3CALL * STUB_SIZE) as u32);
        let stub = heap.read(dos, 4).unwrap();
        assert_eq!(stub, [0x0f, 0x0b, DOS3CALL as u8, 0]);
        assert_eq!(
            crate::ne::module::get_ordinal(&heap, h, "GetProcAddress"),
            50
        );
    }
}
