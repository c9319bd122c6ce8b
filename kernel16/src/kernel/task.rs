//! Tasks: creation, startup, the event/yield primitives and instance thunks.
//!
//! Each task runs on a host thread of its own. A task blocks by resetting its
//! event and waiting on it with the Win16 lock fully released.

use std::{sync::Arc, thread};

use log::{debug, info, trace, warn};
use serde::Serialize;

use super::{exports::DOS3CALL, Kernel, KernelState, TaskEvent};
use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags},
    ne::{
        module::get_module,
        segment::{create_segment, load_segment},
    },
    registers::{Context16, StackRegister},
    task::{
        alloc_tdb, build_environment, create_pdb, get_task, get_task_mut, link_task, task_list,
        unlink_task, MAX_PRIORITY, MIN_PRIORITY, PDB_CMDLINE, TDB_DEAD, TDB_THUNKS, TDB_THUNKS_END,
    },
    thunk::{alloc_thunk, free_thunk, init_arena, write_thunk, ThunkArena},
    utils::{hiword, loword, make_segptr, offset_of, selector_of, SegPtr},
};

/// Room left above the initial stack pointer of a task.
const STACK_FRAME_SLACK: u16 = 0x2c;
/// Added to the computed stack top by `InitTask`.
const STACK_TOP_SLACK: u16 = 150;
const INSTANCE_STACKTOP: u16 = 0x0a;
const INSTANCE_STACKMIN: u16 = 0x0c;
const INSTANCE_STACKBOTTOM: u16 = 0x0e;
const DEFAULT_DRIVE: u8 = 2;

/// A summary of a live task.
#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct TaskInfo {
    pub handle: u16,
    pub module: u16,
    pub name: String,
    pub instance: u16,
    pub pdb: u16,
    pub priority: i16,
    pub events: u16,
}

/// The thunk arena embedded in a TDB.
fn task_arena(htask: u16, cs_alias: u16) -> ThunkArena {
    ThunkArena {
        sel: handle_to_sel(htask),
        base: TDB_THUNKS,
        code_sel: cs_alias,
        end: TDB_THUNKS_END,
    }
}

/// Drive index and directory of a DOS path, the file name dropped.
fn split_dos_dir(path: &str) -> (u8, String) {
    let bytes = path.as_bytes();
    if bytes.len() < 2 || bytes[1] != b':' || !bytes[0].is_ascii_alphabetic() {
        return (DEFAULT_DRIVE, "\\".to_string());
    }
    let drive = bytes[0].to_ascii_uppercase() - b'A';
    let rest = &path[2..];
    let dir = match rest.rfind('\\') {
        Some(0) | None => "\\".to_string(),
        Some(end) => rest[..end].to_string(),
    };
    (drive, dir)
}

impl KernelState {
    /// Build the TDB, PDB and environment of a task for `hmodule`. The task is
    /// not linked into the run queue.
    pub(crate) fn create_task(&mut self, hmodule: u16, cmdline: &str, cmd_show: u16) -> Result<u16> {
        let (name, file_name, expver) = get_module(&self.heap, hmodule)
            .map(|m| (m.name(), m.file_name(), m.expver()))
            .ok_or(KernelError::InvalidHandle(hmodule))?;
        let dispatcher = get_module(&self.heap, self.hkernel)
            .map(|k| k.entry_point(DOS3CALL))
            .unwrap_or(0);
        let parent_task = self.current_task();
        let parent_pdb = self.current_pdb();

        let htask = alloc_tdb(&mut self.heap, hmodule)?;
        let cs_alias = self.heap.ldt_mut().alloc_cs_alias(handle_to_sel(htask))?;

        let vars = std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        let env = build_environment(vars, &file_name);
        let henv = self.heap.alloc(GlobalFlags::FIXED, env.len() as u32, hmodule);
        if henv == 0 {
            return Err(KernelError::OutOfMemory(env.len() as u32));
        }
        self.heap.write(make_segptr(handle_to_sel(henv), 0), &env)?;

        let hpdb = create_pdb(&mut self.heap, hmodule, cmdline, parent_pdb, handle_to_sel(henv), dispatcher)?;
        self.heap.set_owner(hpdb, hpdb);
        self.heap.set_owner(htask, hpdb);
        self.heap.set_owner(henv, hpdb);

        let (drive, dir) = split_dos_dir(&file_name);
        let mut tdb = get_task_mut(&mut self.heap, htask).ok_or(KernelError::InvalidHandle(htask))?;
        tdb.set_version(expver);
        tdb.set_module(hmodule);
        tdb.set_parent(parent_task);
        tdb.set_pdb(hpdb);
        tdb.set_cmd_show(cmd_show);
        tdb.set_cs_alias(cs_alias);
        tdb.set_module_name(&name);
        tdb.set_current_dir(drive, &dir);
        tdb.set_dta(make_segptr(handle_to_sel(hpdb), PDB_CMDLINE));
        init_arena(&mut self.heap, &task_arena(htask, cs_alias))?;
        debug!("task {:#06x} for {}: pdb {:#06x}, env {:#06x}", htask, name, hpdb, henv);
        Ok(htask)
    }

    pub(crate) fn task_info(&self, htask: u16) -> Option<TaskInfo> {
        let tdb = get_task(&self.heap, htask)?;
        Some(TaskInfo {
            handle: htask,
            module: tdb.module(),
            name: tdb.module_name(),
            instance: tdb.instance(),
            pdb: tdb.pdb(),
            priority: tdb.priority(),
            events: tdb.events(),
        })
    }
}

impl Kernel {
    /// Give the constructing thread a task of its own, owned by KERNEL.
    pub(crate) fn create_main_task(&self) -> Result<()> {
        self.with_state(|st| {
            let htask = st.create_task(st.hkernel, "", 1)?;
            link_task(&mut st.heap, &mut st.first_task, htask)?;
            st.initial_task = htask;
            st.thread().task = htask;
            st.events.insert(htask, Arc::new(TaskEvent::default()));
            debug!("initial task {:#06x}", htask);
            Ok(())
        })
    }

    /// Start a task for `hmodule` on a new thread and wait until it has an
    /// instance. If it dies first, its exit code is returned instead.
    pub(crate) fn spawn_task(&self, hmodule: u16, cmdline: &str, cmd_show: u16) -> Result<u16> {
        let _win16 = self.win16().lock();
        let htask = self.with_state(|st| st.create_task(hmodule, cmdline, cmd_show))?;
        self.state().events.insert(htask, Arc::new(TaskEvent::default()));
        self.post_event(htask);

        let kernel = self.clone();
        let handle = thread::Builder::new()
            .name(format!("task-{:04x}", htask))
            .spawn(move || kernel.task_main(htask))?;
        self.state().task_threads.insert(htask, handle);
        info!("spawned task {:#06x} for module {:#06x}", htask, hmodule);

        loop {
            self.yield_lock();
            let instance = self.with_state(|st| get_task(&st.heap, htask).map(|t| t.instance()));
            match instance {
                None => {
                    let code = self.join_task(htask).unwrap_or(0);
                    debug!("task {:#06x} ended before starting, code {}", htask, code);
                    return Ok(code);
                }
                Some(0) => continue,
                Some(instance) => return Ok(instance),
            }
        }
    }

    /// Wait for the thread of `htask` to finish and return its exit code.
    pub fn join_task(&self, htask: u16) -> Option<u16> {
        let handle = self.state().task_threads.remove(&htask)?;
        let depth = self.win16().release_all();
        let code = handle.join().ok();
        self.win16().restore(depth);
        code
    }

    fn task_main(&self, htask: u16) -> u16 {
        let code = {
            let _win16 = self.win16().lock();
            let linked = self.with_state(|st| {
                st.thread().task = htask;
                link_task(&mut st.heap, &mut st.first_task, htask)
            });
            let code = match linked.and_then(|_| self.start_task(htask)) {
                Ok(code) => code,
                Err(KernelError::TaskExit(code)) => code,
                Err(e) => {
                    warn!("task {:#06x}: {}", htask, e);
                    e.legacy_code()
                }
            };
            self.exit_task(htask);
            code
        };
        self.detach_thread();
        info!("task {:#06x} exited with {}", htask, code);
        code
    }

    /// Load the task's module (or a fresh DGROUP for a further instance) and
    /// run it from its entry point. Returns `ax` at the final return.
    fn start_task(&self, htask: u16) -> Result<u16> {
        let (hmodule, hpdb, cmd_show) = self.with_state(|st| {
            get_task(&st.heap, htask)
                .map(|t| (t.module(), t.pdb(), t.cmd_show()))
                .ok_or(KernelError::InvalidHandle(htask))
        })?;
        let count = self.with_state(|st| get_module(&st.heap, hmodule).map(|m| m.count()).unwrap_or(0));
        let (instance, prev) = if count == 0 {
            (self.do_load_module(hmodule)?, 0)
        } else {
            let image = self
                .state()
                .images
                .get(&hmodule)
                .cloned()
                .ok_or(KernelError::InvalidHandle(hmodule))?;
            self.with_state(|st| -> Result<(u16, u16)> {
                let module = get_module(&st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
                let (prev, autodata) = (module.instance(), module.autodata());
                if autodata == 0 {
                    return Ok((prev, prev));
                }
                create_segment(&mut st.heap, hmodule, autodata)?;
                load_segment(&mut st.heap, hmodule, autodata, &image)?;
                let instance = get_module(&st.heap, hmodule)
                    .map(|m| m.instance())
                    .ok_or(KernelError::InvalidHandle(hmodule))?;
                st.heap.set_owner(instance, hpdb);
                Ok((instance, prev))
            })?
        };

        let ctx = self.with_state(|st| -> Result<Context16> {
            let mut tdb = get_task_mut(&mut st.heap, htask).ok_or(KernelError::InvalidHandle(htask))?;
            tdb.set_instance(instance);
            tdb.set_prev_instance(prev);
            let module = get_module(&st.heap, hmodule).ok_or(KernelError::InvalidHandle(hmodule))?;
            let (csip, sssp) = (module.csip(), module.sssp());
            let cs = module
                .seg(selector_of(csip))
                .map(|s| handle_to_sel(s.hseg))
                .ok_or_else(|| KernelError::BadFormat(format!("{}: no entry segment", module.name())))?;
            let mut sp = offset_of(sssp);
            if sp == 0 {
                let minsize = module.seg(selector_of(sssp)).map(|s| s.minsize).unwrap_or(0);
                sp = minsize.wrapping_add(module.stack());
            }
            let sp = (sp & !1).wrapping_sub(STACK_FRAME_SLACK);
            let data_sel = handle_to_sel(instance);
            let mut ctx = Context16 {
                cs,
                eip: offset_of(csip) as u32,
                ds: data_sel,
                ss: data_sel,
                es: handle_to_sel(hpdb),
                ebx: module.stack() as u32,
                ecx: module.heap() as u32,
                edi: instance as u32,
                esi: prev as u32,
                ..Default::default()
            };
            ctx.set_sp(sp);
            Ok(ctx)
        })?;
        debug!(
            "starting task {:#06x} at {:04x}:{:04x} ss:sp={:04x}:{:04x} show={}",
            htask,
            ctx.cs,
            ctx.ip(),
            ctx.ss,
            ctx.sp(),
            cmd_show
        );
        Ok(self.call_to_16_regs(ctx, &[])?.ax())
    }

    /// Unlink a finished task and release everything it owns.
    fn exit_task(&self, htask: u16) {
        let fields = self.with_state(|st| {
            let (hmodule, hpdb, cs_alias) = get_task(&st.heap, htask).map(|t| (t.module(), t.pdb(), t.cs_alias()))?;
            unlink_task(&mut st.heap, &mut st.first_task, htask);
            if let Some(mut tdb) = get_task_mut(&mut st.heap, htask) {
                tdb.set_magic(TDB_DEAD);
            }
            st.heap.ldt_mut().free_selector(cs_alias);
            st.events.remove(&htask);
            Some((hmodule, hpdb))
        });
        let (hmodule, hpdb) = match fields {
            Some(f) => f,
            None => return,
        };
        self.free_module_ex(hmodule, false);
        self.with_state(|st| {
            st.heap.free_all(hpdb);
            let remaining = task_list(&st.heap, st.first_task);
            if remaining.iter().all(|h| *h == st.initial_task) {
                info!("last task gone");
                st.shutdown = true;
            }
        });
    }

    /// `InitTask`, called by a program's startup code with the registers its
    /// task was started with.
    pub(crate) fn init_task(&self, ctx: &mut Context16) -> Result<()> {
        let htask = self.state().current_task();
        let (hmodule, hpdb, instance, prev, cmd_show) = self.with_state(|st| {
            get_task(&st.heap, htask)
                .map(|t| (t.module(), t.pdb(), t.instance(), t.prev_instance(), t.cmd_show()))
                .ok_or(KernelError::InvalidHandle(htask))
        })?;

        let ds = ctx.ds;
        let stackmin = ctx.sp().wrapping_add(4);
        let bx = ctx.ebx as u16;
        let stacktop = stackmin.saturating_sub(bx).wrapping_add(STACK_TOP_SLACK);
        self.with_state(|st| -> Result<()> {
            st.heap.write_word(make_segptr(ds, INSTANCE_STACKMIN), stackmin)?;
            st.heap.write_word(make_segptr(ds, INSTANCE_STACKBOTTOM), stackmin)?;
            st.heap.write_word(make_segptr(ds, INSTANCE_STACKTOP), stacktop)
        })?;
        let heap_size = ctx.ecx as u16;
        if heap_size != 0 && !self.local_init(handle_to_sel(instance), 0, heap_size) {
            warn!("InitTask: no local heap in {:#06x}", instance);
        }

        self.initialize_dlls(hmodule)?;
        self.dll_process_attach(hmodule);

        let tail = self.with_state(|st| st.heap.read(make_segptr(handle_to_sel(hpdb), PDB_CMDLINE), 0x80))?;
        let len = tail[0] as usize;
        ctx.ebx = match tail[1..=len.min(0x7f)].iter().position(|c| *c != b' ' && *c != b'\t') {
            Some(skip) if len > 0 => PDB_CMDLINE as u32 + 1 + skip as u32,
            _ => PDB_CMDLINE as u32,
        };
        ctx.eax = 1;
        ctx.ecx = stacktop as u32;
        ctx.edx = cmd_show as u32;
        ctx.esi = prev as u32;
        ctx.edi = instance as u32;
        ctx.es = handle_to_sel(hpdb);
        trace!("InitTask {:#06x}: stacktop {:#06x} tail at {:#06x}", htask, stacktop, ctx.ebx);
        Ok(())
    }

    /// `WaitEvent`. Returns 0 when a pending event was consumed, 1 after
    /// blocking.
    pub fn wait_event(&self, htask: u16) -> u16 {
        let _win16 = self.win16().lock();
        let (htask, event) = {
            let mut st = self.state();
            let current = st.current_task();
            let htask = if htask == 0 { current } else { htask };
            let mut tdb = match get_task_mut(&mut st.heap, htask) {
                Some(tdb) => tdb,
                None => return 0,
            };
            let events = tdb.events();
            if events > 0 {
                tdb.set_events(events - 1);
                return 0;
            }
            if htask != current {
                warn!("WaitEvent on {:#06x} from task {:#06x}", htask, current);
                return 1;
            }
            match st.events.get(&htask) {
                Some(event) => (htask, event.clone()),
                None => return 1,
            }
        };
        event.reset();
        let depth = self.win16().release_all();
        trace!("task {:#06x} waiting, lock depth {}", htask, depth);
        event.wait();
        self.win16().restore(depth);
        self.with_state(|st| {
            if let Some(mut tdb) = get_task_mut(&mut st.heap, htask) {
                let events = tdb.events();
                if events > 0 {
                    tdb.set_events(events - 1);
                }
            }
        });
        1
    }

    pub fn post_event(&self, htask: u16) {
        self.with_state(|st| {
            let htask = if htask == 0 { st.current_task() } else { htask };
            let mut tdb = match get_task_mut(&mut st.heap, htask) {
                Some(tdb) => tdb,
                None => return,
            };
            let events = tdb.events();
            tdb.set_events(events.wrapping_add(1));
            if let Some(event) = st.events.get(&htask) {
                event.set();
            }
        })
    }

    /// Let other tasks run.
    pub fn yield_task(&self) {
        self.yield_lock();
    }

    /// Yield, asking for `htask` to run next.
    pub fn directed_yield(&self, htask: u16) {
        let current = self.with_state(|st| {
            let current = st.current_task();
            if let Some(mut tdb) = get_task_mut(&mut st.heap, current) {
                tdb.set_yield_to(htask);
            }
            current
        });
        self.yield_lock();
        self.with_state(|st| {
            if let Some(mut tdb) = get_task_mut(&mut st.heap, current) {
                tdb.set_yield_to(0);
            }
        });
    }

    /// Move a task by `delta` priority levels and requeue it.
    pub fn set_priority(&self, htask: u16, delta: i16) {
        self.with_state(|st| {
            let htask = if htask == 0 { st.current_task() } else { htask };
            let priority = match get_task(&st.heap, htask) {
                Some(tdb) => tdb.priority(),
                None => return,
            };
            let priority = priority.saturating_add(delta).clamp(MIN_PRIORITY, MAX_PRIORITY);
            let linked = task_list(&st.heap, st.first_task).contains(&htask);
            if linked {
                unlink_task(&mut st.heap, &mut st.first_task, htask);
            }
            if let Some(mut tdb) = get_task_mut(&mut st.heap, htask) {
                tdb.set_priority(priority);
            }
            if linked {
                if let Err(e) = link_task(&mut st.heap, &mut st.first_task, htask) {
                    warn!("requeue {:#06x}: {}", htask, e);
                }
            }
        })
    }

    pub fn get_current_task(&self) -> u16 {
        self.state().current_task()
    }

    pub fn get_current_pdb(&self) -> u16 {
        self.state().current_pdb()
    }

    pub fn is_task(&self, htask: u16) -> bool {
        get_task(&self.state().heap, htask).is_some()
    }

    /// Data segment of the current task.
    pub fn get_task_ds(&self) -> u16 {
        let st = self.state();
        get_task(&st.heap, st.current_task())
            .map(|t| handle_to_sel(t.instance()))
            .unwrap_or(0)
    }

    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.with_state(|st| {
            task_list(&st.heap, st.first_task)
                .into_iter()
                .filter_map(|h| st.task_info(h))
                .collect()
        })
    }

    /// `MakeProcInstance`: a thunk in the current task loading `hinstance`'s
    /// data segment before jumping to `func`. Library functions need none.
    pub fn make_proc_instance(&self, func: SegPtr, hinstance: u16) -> Result<SegPtr> {
        if hiword(func) == 0 {
            return Ok(0);
        }
        let min_thunks = self.config().task.min_thunks;
        self.with_state(|st| {
            let owner = st.get_exe_ptr(hinstance);
            if get_module(&st.heap, owner).map_or(false, |m| m.is_lib()) {
                return Ok(func);
            }
            let htask = st.current_task();
            let (cs_alias, hpdb) = get_task(&st.heap, htask)
                .map(|t| (t.cs_alias(), t.pdb()))
                .ok_or(KernelError::InvalidHandle(htask))?;
            let arena = task_arena(htask, cs_alias);
            let thunk = alloc_thunk(&mut st.heap, arena, hpdb, min_thunks)?;
            write_thunk(&mut st.heap, arena, thunk, handle_to_sel(hinstance), func)?;
            trace!(
                "thunk {:04x}:{:04x} -> {:04x}:{:04x} ds={:04x}",
                selector_of(thunk),
                offset_of(thunk),
                selector_of(func),
                loword(func),
                handle_to_sel(hinstance)
            );
            Ok(thunk)
        })
    }

    pub fn free_proc_instance(&self, thunk: SegPtr) {
        self.with_state(|st| {
            let htask = st.current_task();
            let cs_alias = match get_task(&st.heap, htask) {
                Some(tdb) => tdb.cs_alias(),
                None => return,
            };
            if let Err(e) = free_thunk(&mut st.heap, task_arena(htask, cs_alias), thunk) {
                warn!("FreeProcInstance({:#010x}): {}", thunk, e);
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_dos_dir() {
        assert_eq!(split_dos_dir("C:\\WINDOWS\\CALC.EXE"), (2, "\\WINDOWS".to_string()));
        assert_eq!(split_dos_dir("a:\\X.EXE"), (0, "\\".to_string()));
        assert_eq!(split_dos_dir("/usr/share/x.exe"), (DEFAULT_DRIVE, "\\".to_string()));
    }

    #[test]
    fn test_task_arena_bounds() {
        let arena = task_arena(0x1237, 0x2007);
        assert_eq!(arena.sel, 0x1237);
        assert_eq!(arena.code_sel, 0x2007);
        assert!(arena.end > arena.base);
    }
}
