//! The running kernel.
//!
//! Every table the 16-bit side can reach (selectors, global arenas, the module
//! list, the run queue) lives in one [`KernelState`] behind a mutex, and all
//! 16-bit execution happens under the Win16 [`SysLevel`]. [`Kernel`] is a cheap
//! clonable handle to both, and carries the Win16 API as methods.
//!
//! The state mutex is never held across a call into 16-bit code; the Win16 lock
//! is, and is released around blocking waits.

mod dos;
pub mod exports;
mod memory;
mod module;
mod resource;
mod task;

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use log::{debug, info};

use crate::{
    config::KernelConfig,
    cpu::{Cpu16, MicroCpu},
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags, GlobalHeap},
    loader::{ModuleResolver, PeModule, SearchPathResolver},
    local::LocalNotify,
    registers::{Context16, StackRegister},
    syslevel::{SysLevel, WIN16_LEVEL},
    task::get_task,
    utils::{c_str, offset_of, selector_of, SegPtr},
};

pub use dos::FileTable;
pub use exports::{ExportSpec, KernelCall, EXPORTS};
pub use module::{LoadParams, ModuleInfo};
pub use task::TaskInfo;

pub type CpuFactory = Box<dyn Fn() -> Box<dyn Cpu16> + Send + Sync>;

/// Manual-reset event a task sleeps on in `WaitEvent`.
#[derive(Debug, Default)]
pub(crate) struct TaskEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl TaskEvent {
    pub(crate) fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        *signaled = true;
        self.cond.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// What the kernel knows about a host thread that runs 16-bit code.
#[derive(Debug, Default)]
pub(crate) struct ThreadInfo {
    pub task: u16,
    /// Global block used as 16-bit stack when no 16-bit frame is active.
    pub stack: u16,
    /// Contexts of the relay calls in progress, innermost last.
    pub frames: Vec<Context16>,
}

pub struct KernelState {
    pub heap: GlobalHeap,
    pub(crate) first_module: u16,
    /// File images of loaded NE modules, for segment and resource loading.
    pub(crate) images: HashMap<u16, Arc<Vec<u8>>>,
    /// Host modules standing in as 16-bit ones, by placeholder module handle.
    pub(crate) host_modules: HashMap<u16, Arc<PeModule>>,
    pub(crate) first_task: u16,
    pub(crate) initial_task: u16,
    pub(crate) events: HashMap<u16, Arc<TaskEvent>>,
    pub(crate) threads: HashMap<ThreadId, ThreadInfo>,
    pub(crate) task_threads: HashMap<u16, JoinHandle<u16>>,
    pub(crate) notifiers: HashMap<u16, Box<dyn LocalNotify>>,
    pub(crate) files: FileTable,
    pub(crate) hkernel: u16,
    pub(crate) relay_sel: u16,
    pub(crate) default_loader: SegPtr,
    pub(crate) shutdown: bool,
}

impl KernelState {
    fn new(config: &KernelConfig) -> Self {
        Self {
            heap: GlobalHeap::new(&config.memory),
            first_module: 0,
            images: HashMap::new(),
            host_modules: HashMap::new(),
            first_task: 0,
            initial_task: 0,
            events: HashMap::new(),
            threads: HashMap::new(),
            task_threads: HashMap::new(),
            notifiers: HashMap::new(),
            files: FileTable::default(),
            hkernel: 0,
            relay_sel: 0,
            default_loader: 0,
            shutdown: false,
        }
    }

    pub(crate) fn thread(&mut self) -> &mut ThreadInfo {
        self.threads.entry(thread::current().id()).or_default()
    }

    pub fn current_task(&self) -> u16 {
        self.threads
            .get(&thread::current().id())
            .map(|t| t.task)
            .filter(|t| *t != 0)
            .unwrap_or(self.initial_task)
    }

    pub fn current_pdb(&self) -> u16 {
        get_task(&self.heap, self.current_task())
            .map(|t| t.pdb())
            .unwrap_or(0)
    }

    /// Thread running `htask`, if any.
    pub(crate) fn task_thread(&self, htask: u16) -> Option<ThreadId> {
        self.threads
            .iter()
            .find(|(_, info)| info.task == htask)
            .map(|(id, _)| *id)
    }

    /// Where a 16-bit call made now should put its frame: below the innermost
    /// active frame, or at the top of the thread's own stack block.
    pub(crate) fn call_stack(&mut self, config: &KernelConfig) -> Result<(u16, u16)> {
        let hkernel = self.hkernel;
        if let Some(ctx) = self.thread().frames.last() {
            return Ok((ctx.ss, ctx.sp()));
        }
        let mut stack = self.thread().stack;
        if stack == 0 {
            let size = config.task.thread_stack_size.clamp(0x100, 0x10000);
            stack = self.heap.alloc(GlobalFlags::FIXED, size, hkernel);
            if stack == 0 {
                return Err(KernelError::OutOfMemory(size));
            }
            debug!("16-bit stack {:#06x} for {:?}", stack, thread::current().id());
            self.thread().stack = stack;
        }
        let size = self.heap.size(stack).min(0x10000);
        Ok((handle_to_sel(stack), (size - 0x10) as u16))
    }

    /// NUL terminated string at `ptr`.
    pub fn read_string(&self, ptr: SegPtr) -> Result<String> {
        let seg = self.heap.segment(selector_of(ptr))?;
        let tail = seg
            .get(offset_of(ptr) as usize..)
            .ok_or(KernelError::OutOfBounds(selector_of(ptr), offset_of(ptr) as u32))?;
        Ok(String::from_utf8_lossy(c_str(tail)).into_owned())
    }

    /// Copy `s` to `ptr` as a C string of at most `count` bytes, terminator
    /// included. Returns the length copied, terminator excluded.
    pub fn write_string(&mut self, ptr: SegPtr, s: &str, count: usize) -> Result<usize> {
        if count == 0 {
            return Ok(0);
        }
        let mut bytes = s.as_bytes()[..s.len().min(count - 1)].to_vec();
        let len = bytes.len();
        bytes.push(0);
        self.heap.write(ptr, &bytes)?;
        Ok(len)
    }
}

struct Inner {
    config: KernelConfig,
    win16: SysLevel,
    state: Mutex<KernelState>,
    cpu: CpuFactory,
    resolver: Box<dyn ModuleResolver>,
}

#[derive(Clone)]
pub struct Kernel {
    inner: Arc<Inner>,
}

impl Kernel {
    /// A kernel resolving modules through the configured search path and
    /// running 16-bit code on [`MicroCpu`].
    pub fn new(config: KernelConfig) -> Result<Self> {
        let resolver = SearchPathResolver::new(&config.loader);
        Self::with(
            config,
            Box::new(resolver),
            Box::new(|| Box::new(MicroCpu::default()) as Box<dyn Cpu16>),
        )
    }

    pub fn with(config: KernelConfig, resolver: Box<dyn ModuleResolver>, cpu: CpuFactory) -> Result<Self> {
        let state = KernelState::new(&config);
        let kernel = Kernel {
            inner: Arc::new(Inner {
                config,
                win16: SysLevel::new(WIN16_LEVEL),
                state: Mutex::new(state),
                cpu,
                resolver,
            }),
        };
        {
            let _win16 = kernel.win16().lock();
            kernel.create_builtin()?;
            kernel.create_main_task()?;
        }
        info!("kernel up, builtin module {:#06x}", kernel.state().hkernel);
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub(crate) fn win16(&self) -> &SysLevel {
        &self.inner.win16
    }

    pub(crate) fn resolver(&self) -> &dyn ModuleResolver {
        self.inner.resolver.as_ref()
    }

    pub(crate) fn new_cpu(&self) -> Box<dyn Cpu16> {
        (self.inner.cpu)()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, KernelState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the kernel state under the Win16 lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let _win16 = self.win16().lock();
        f(&mut self.state())
    }

    pub fn read_bytes(&self, ptr: SegPtr, len: usize) -> Result<Vec<u8>> {
        self.with_state(|st| st.heap.read(ptr, len))
    }

    pub fn write_bytes(&self, ptr: SegPtr, bytes: &[u8]) -> Result<()> {
        self.with_state(|st| st.heap.write(ptr, bytes))
    }

    pub fn read_string(&self, ptr: SegPtr) -> Result<String> {
        self.with_state(|st| st.read_string(ptr))
    }

    /// Handle of the built-in KERNEL module.
    pub fn kernel_module(&self) -> u16 {
        self.state().hkernel
    }

    /// Set once the last task has exited.
    pub fn is_shut_down(&self) -> bool {
        self.state().shutdown
    }

    /// Syslevel ordering violations seen so far.
    pub fn syslevel_violations(&self) -> usize {
        self.win16().violations()
    }

    /// Forget the calling thread, releasing its 16-bit stack.
    pub fn detach_thread(&self) {
        let _win16 = self.win16().lock();
        let mut st = self.state();
        if let Some(info) = st.threads.remove(&thread::current().id()) {
            if info.stack != 0 {
                st.heap.free(info.stack);
            }
            debug!("thread {:?} detached", thread::current().id());
        }
    }

    /// Give other threads a chance to take the Win16 lock.
    pub(crate) fn yield_lock(&self) {
        let depth = self.win16().release_all();
        thread::yield_now();
        if depth == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        self.win16().restore(depth);
    }

    pub(crate) fn far_ptr_string(&self, ptr: SegPtr) -> Result<Option<String>> {
        if selector_of(ptr) == 0 {
            return Ok(None);
        }
        self.state().read_string(ptr).map(Some)
    }
}
