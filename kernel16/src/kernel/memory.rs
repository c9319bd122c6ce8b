//! Global heap, local heap, atom and selector services.

use log::{trace, warn};

use super::{Kernel, KernelState};
use crate::{
    errors::Result,
    global::{handle_to_sel, GlobalEntry, GlobalFlags, GlobalHeap},
    ldt::SegmentAccess,
    local::{HeapSegment, LocalEntry, LocalFlags, LocalHeap, LocalNotify},
    ne::module::get_module,
    utils::{make_segptr, SegPtr},
};

/// A local heap's storage: the global block behind a data selector.
struct GlobalSegment<'a> {
    heap: &'a mut GlobalHeap,
    sel: u16,
}

impl HeapSegment for GlobalSegment<'_> {
    fn bytes(&self) -> &[u8] {
        self.heap.segment(self.sel).unwrap_or_default()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.heap.segment_mut(self.sel).unwrap_or_default()
    }

    fn grow(&mut self) -> bool {
        self.heap.grow_to(self.sel, 0x10000)
    }
}

impl KernelState {
    /// Run `f` on the local heap of `ds`, with its notifier installed.
    pub(crate) fn with_local<R>(&mut self, ds: u16, f: impl FnOnce(&mut LocalHeap) -> R) -> R {
        let KernelState { heap, notifiers, .. } = self;
        let mut seg = GlobalSegment { heap, sel: ds };
        let notify = notifiers
            .get_mut(&ds)
            .map(|n| n.as_mut() as &mut dyn LocalNotify);
        let mut local = LocalHeap::with_notify(&mut seg, notify);
        f(&mut local)
    }

    /// Owner given to blocks the current task allocates.
    pub(crate) fn alloc_owner(&self, flags: GlobalFlags) -> u16 {
        let owner = self.current_pdb();
        if flags.contains(GlobalFlags::DDESHARE) {
            return self.get_exe_ptr(owner);
        }
        owner
    }

    pub(crate) fn local_init(&mut self, ds: u16, start: u16, end: u16, delta: u16) -> bool {
        self.with_local(ds, |local| {
            if !local.init(start, end) {
                return false;
            }
            local.handle_delta(delta);
            true
        })
    }
}

impl Kernel {
    pub fn global_alloc(&self, flags: GlobalFlags, size: u32) -> u16 {
        self.with_state(|st| {
            let owner = st.alloc_owner(flags);
            st.heap.alloc(flags, size, owner)
        })
    }

    pub fn global_realloc(&self, handle: u16, size: u32, flags: GlobalFlags) -> u16 {
        self.with_state(|st| st.heap.realloc(handle, size, flags))
    }

    /// 0 on success, `handle` if it was not a live block.
    pub fn global_free(&self, handle: u16) -> u16 {
        self.with_state(|st| st.heap.free(handle))
    }

    pub fn global_lock(&self, handle: u16) -> SegPtr {
        self.with_state(|st| st.heap.lock(handle))
    }

    pub fn global_unlock(&self, handle: u16) -> u16 {
        self.with_state(|st| st.heap.unlock(handle))
    }

    pub fn global_size(&self, handle: u16) -> u32 {
        self.with_state(|st| st.heap.size(handle))
    }

    pub fn global_flags(&self, handle: u16) -> u16 {
        self.with_state(|st| st.heap.flags(handle))
    }

    /// Handle in the low word, selector in the high word.
    pub fn global_handle(&self, sel: u16) -> u32 {
        self.with_state(|st| match st.heap.handle(sel) {
            0 => 0,
            handle => ((handle_to_sel(handle) as u32) << 16) | handle as u32,
        })
    }

    pub fn global_compact(&self, desired: u32) -> u32 {
        self.with_state(|st| st.heap.compact(desired))
    }

    /// Free every block of `owner`, the current task's when 0.
    pub fn global_free_all(&self, owner: u16) {
        self.with_state(|st| {
            let owner = if owner == 0 { st.current_pdb() } else { owner };
            st.heap.free_all(owner)
        })
    }

    pub fn lock_segment(&self, handle: u16) -> u16 {
        self.with_state(|st| match st.heap.lock(handle) {
            0 => 0,
            _ => handle,
        })
    }

    pub fn unlock_segment(&self, handle: u16) -> u16 {
        self.global_unlock(handle)
    }

    pub fn global_page_lock(&self, handle: u16) -> u16 {
        self.with_state(|st| st.heap.page_lock(handle))
    }

    pub fn global_page_unlock(&self, handle: u16) -> u16 {
        self.with_state(|st| st.heap.page_unlock(handle))
    }

    /// Selector in the low word, paragraph in the high word.
    pub fn global_dos_alloc(&self, size: u32) -> u32 {
        self.with_state(|st| {
            let owner = st.current_pdb();
            st.heap.dos_alloc(size, owner)
        })
    }

    pub fn global_dos_free(&self, sel: u16) -> u16 {
        self.with_state(|st| st.heap.dos_free(sel))
    }

    pub fn far_set_owner(&self, handle: u16, owner: u16) {
        self.with_state(|st| st.heap.set_owner(handle, owner))
    }

    pub fn far_get_owner(&self, handle: u16) -> u16 {
        self.with_state(|st| st.heap.owner(handle))
    }

    pub fn global_entries(&self) -> Vec<GlobalEntry> {
        self.with_state(|st| st.heap.entries())
    }

    /// Linear address of a far pointer.
    pub fn map_sl(&self, ptr: SegPtr) -> Result<u32> {
        self.with_state(|st| st.heap.map_sl(ptr))
    }

    pub fn local_init(&self, ds: u16, start: u16, end: u16) -> bool {
        let delta = self.config().task.local_handle_delta;
        self.with_state(|st| st.local_init(ds, start, end, delta))
    }

    pub fn local_alloc(&self, ds: u16, flags: LocalFlags, size: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.alloc(flags, size)))
    }

    pub fn local_realloc(&self, ds: u16, handle: u16, size: u16, flags: LocalFlags) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.realloc(handle, size, flags)))
    }

    pub fn local_free(&self, ds: u16, handle: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.free(handle)))
    }

    /// Offset of the block, 0 if invalid or discarded.
    pub fn local_lock(&self, ds: u16, handle: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.lock(handle)))
    }

    /// Remaining lock count.
    pub fn local_unlock(&self, ds: u16, handle: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.unlock(handle)))
    }

    pub fn local_size(&self, ds: u16, handle: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.size(handle)))
    }

    pub fn local_flags(&self, ds: u16, handle: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.flags(handle)))
    }

    pub fn local_handle(&self, ds: u16, addr: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.handle(addr)))
    }

    pub fn local_compact(&self, ds: u16, minfree: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.compact(minfree)))
    }

    pub fn local_count_free(&self, ds: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.count_free()))
    }

    pub fn local_heap_size(&self, ds: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.heap_size()))
    }

    pub fn local_handle_delta(&self, ds: u16, delta: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.handle_delta(delta)))
    }

    pub fn local_walk(&self, ds: u16) -> Option<Vec<LocalEntry>> {
        self.with_state(|st| st.with_local(ds, |l| l.walk()))
    }

    pub fn local_validate(&self, ds: u16) -> bool {
        self.with_state(|st| st.with_local(ds, |l| l.validate()))
    }

    /// Install the notifier of the heap in `ds`; returns the previous one.
    pub fn local_notify(&self, ds: u16, notify: Box<dyn LocalNotify>) -> Option<Box<dyn LocalNotify>> {
        self.with_state(|st| st.notifiers.insert(ds, notify))
    }

    /// Free bytes in the low word and heap size in the high word, for the
    /// DGROUP of a module.
    pub fn get_heap_spaces(&self, handle: u16) -> u32 {
        self.with_state(|st| {
            let hmodule = st.get_exe_ptr(handle);
            let ds = match get_module(&st.heap, hmodule)
                .and_then(|m| m.seg(m.autodata()))
                .map(|s| handle_to_sel(s.hseg))
            {
                Some(ds) if ds != 0 => ds,
                _ => return 0,
            };
            st.with_local(ds, |l| ((l.heap_size() as u32) << 16) | l.count_free() as u32)
        })
    }

    /// Create the atom table of `ds`; 0 selects the configured size. Fails if
    /// a table already exists.
    pub fn init_atom_table(&self, ds: u16, entries: u16) -> bool {
        let entries = match entries {
            0 => self.config().task.atom_table_size,
            n => n,
        };
        self.with_state(|st| st.with_local(ds, |l| l.init_atom_table(entries) != 0))
    }

    pub fn add_atom(&self, ds: u16, name: &str) -> u16 {
        let entries = self.config().task.atom_table_size;
        self.with_state(|st| {
            st.with_local(ds, |l| {
                if l.atom_table().is_none() {
                    l.init_atom_table(entries);
                }
                l.add_atom(name)
            })
        })
    }

    pub fn delete_atom(&self, ds: u16, atom: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.delete_atom(atom)))
    }

    pub fn find_atom(&self, ds: u16, name: &str) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.find_atom(name)))
    }

    /// Name of `atom` cut to `count - 1` characters.
    pub fn get_atom_name(&self, ds: u16, atom: u16, count: usize) -> Option<String> {
        self.with_state(|st| st.with_local(ds, |l| l.atom_name(atom, count)))
    }

    pub fn get_atom_handle(&self, ds: u16, atom: u16) -> u16 {
        self.with_state(|st| st.with_local(ds, |l| l.atom_handle(atom)))
    }

    /// A copy of `template`, or an empty selector for 0. 0 on failure.
    pub fn alloc_selector(&self, template: u16) -> u16 {
        self.with_state(|st| {
            st.heap
                .ldt_mut()
                .alloc_selector(template)
                .unwrap_or_else(|e| {
                    warn!("alloc selector: {}", e);
                    0
                })
        })
    }

    /// 0 on success, `sel` otherwise.
    pub fn free_selector(&self, sel: u16) -> u16 {
        self.with_state(|st| if st.heap.ldt_mut().free_selector(sel) { 0 } else { sel })
    }

    fn alias(&self, sel: u16, code: bool) -> u16 {
        self.with_state(|st| {
            let ldt = st.heap.ldt_mut();
            let alias = match ldt.alloc_selector(sel) {
                Ok(alias) => alias,
                Err(e) => {
                    warn!("alias of {:#06x}: {}", sel, e);
                    return 0;
                }
            };
            let mut access = ldt.access(alias).unwrap_or(SegmentAccess::DATA);
            access.set(SegmentAccess::EXECUTABLE, code);
            match ldt.set_access(alias, access) {
                Ok(()) => {
                    trace!("alias {:#06x} -> {:#06x} code={}", sel, alias, code);
                    alias
                }
                Err(_) => 0,
            }
        })
    }

    pub fn alloc_cs_to_ds_alias(&self, sel: u16) -> u16 {
        self.alias(sel, false)
    }

    pub fn alloc_ds_to_cs_alias(&self, sel: u16) -> u16 {
        self.alias(sel, true)
    }

    pub fn presto_chango_selector(&self, src: u16, dst: u16) -> u16 {
        self.with_state(|st| st.heap.ldt_mut().presto_chango(src, dst).unwrap_or(0))
    }

    pub fn get_selector_base(&self, sel: u16) -> u32 {
        self.with_state(|st| st.heap.ldt().base(sel).unwrap_or(0))
    }

    pub fn set_selector_base(&self, sel: u16, base: u32) -> u16 {
        self.with_state(|st| match st.heap.ldt_mut().set_base(sel, base) {
            Ok(()) => sel,
            Err(_) => 0,
        })
    }

    pub fn get_selector_limit(&self, sel: u16) -> u32 {
        self.with_state(|st| st.heap.ldt().limit(sel).unwrap_or(0))
    }

    pub fn set_selector_limit(&self, sel: u16, limit: u32) -> u16 {
        self.with_state(|st| match st.heap.ldt_mut().set_limit(sel, limit) {
            Ok(()) => sel,
            Err(_) => 0,
        })
    }

    /// Get (`op` 0) or set the descriptor access byte; the 32-bit flag shows
    /// in bit 14.
    pub fn selector_access_rights(&self, sel: u16, op: u16, rights: u16) -> u16 {
        self.with_state(|st| {
            let ldt = st.heap.ldt_mut();
            let access = match ldt.access(sel) {
                Some(a) if ldt.is_allocated(sel) => a,
                _ => return 0,
            };
            if op == 0 {
                let big = if access.contains(SegmentAccess::BIG) { 0x4000 } else { 0 };
                // dpl 3
                return (access.bits() & !SegmentAccess::BIG.bits()) as u16 | 0x60 | big;
            }
            let mut access = SegmentAccess::from_bits_truncate(rights as u8 & 0x1f);
            access.set(SegmentAccess::BIG, rights & 0x4000 != 0);
            if let Err(e) = ldt.set_access(sel, access) {
                warn!("access rights of {:#06x}: {}", sel, e);
            }
            0
        })
    }

    /// First `len` bytes of the segment behind `sel`.
    pub fn segment_bytes(&self, sel: u16, len: usize) -> Result<Vec<u8>> {
        self.read_bytes(make_segptr(sel, 0), len)
    }
}
