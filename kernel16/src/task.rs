//! Task and process databases.
//!
//! Every task owns two fixed blocks: the task database (TDB) the scheduler links
//! into its run queue, and the program segment prefix (PDB) that startup code finds
//! in `es`. Tasks are linked through `next` in ascending priority order.
//!
//! ```text
//! TDB  00 next       02 ss:sp      06 events     08 priority   0c self
//!      0e prev inst  16 flags      1a version    1c instance   1e module
//!      20 queue      22 parent     60 pdb        62 dta        66 drive
//!      67 curdir     a8 cmdshow    aa yield to   ac dlls       b0 cs alias
//!      b2 thunks     f2 name[8]    fa "TD"
//! PDB  00 int 20h    05 call dispatcher          16 parent     18 handles[20]
//!      2c env        32 nfiles     34 handles ptr              50 int 21h; retf
//!      80 command tail
//! ```

use log::{debug, trace};

use crate::{
    errors::{KernelError, Result},
    global::{handle_to_sel, GlobalFlags, GlobalHeap},
    ne::module::word_fields,
    utils::{make_segptr, peek_u16, SegPtr},
};

pub const TDB_SIZE: u16 = 0x100;
pub const PDB_SIZE: u16 = 0x100;
pub const TDB_MAGIC: u16 = u16::from_le_bytes(*b"TD");
/// Written over the magic of a task being torn down.
pub const TDB_DEAD: u16 = 0xdead;
/// Thunk area embedded in the TDB.
pub const TDB_THUNKS: u16 = 0xb2;
pub const TDB_THUNKS_END: u16 = 0xf2;
pub const MIN_PRIORITY: i16 = -32;
pub const MAX_PRIORITY: i16 = 15;

pub const PDB_FILE_HANDLES: u16 = 0x18;
pub const PDB_HANDLE_COUNT: u16 = 20;
pub const PDB_ENVIRONMENT: u16 = 0x2c;
pub const PDB_CMDLINE: u16 = 0x80;
/// Characters of the command tail that fit between the length byte and the `\r`.
pub const CMDLINE_MAX: usize = 126;

const OFF_PRIORITY: usize = 0x08;
const OFF_DTA: usize = 0x62;
const OFF_CURDRIVE: usize = 0x66;
const OFF_CURDIR: usize = 0x67;
const CURDIR_SIZE: usize = 65;
const OFF_MODULE_NAME: usize = 0xf2;
const MODULE_NAME_SIZE: usize = 8;
const ENVIRONMENT_MAX: usize = 0x7f00;

/// Typed view over the bytes of a TDB.
pub struct TaskDb<B> {
    data: B,
}

word_fields! {
    TaskDb;
    next, set_next, 0x00;
    sp, set_sp, 0x02;
    ss, set_ss, 0x04;
    events, set_events, 0x06;
    hself, set_hself, 0x0c;
    prev_instance, set_prev_instance, 0x0e;
    flags, set_flags, 0x16;
    version, set_version, 0x1a;
    instance, set_instance, 0x1c;
    module, set_module, 0x1e;
    queue, set_queue, 0x20;
    parent, set_parent, 0x22;
    pdb, set_pdb, 0x60;
    cmd_show, set_cmd_show, 0xa8;
    yield_to, set_yield_to, 0xaa;
    dlls_to_init, set_dlls_to_init, 0xac;
    cs_alias, set_cs_alias, 0xb0;
    magic, set_magic, 0xfa;
}

impl<B: AsRef<[u8]>> TaskDb<B> {
    /// A view over `data` if it is a live TDB.
    pub fn new(data: B) -> Option<Self> {
        let bytes = data.as_ref();
        if bytes.len() < TDB_SIZE as usize || peek_u16(bytes, 0xfa)? != TDB_MAGIC {
            return None;
        }
        Some(Self { data })
    }

    pub(crate) fn word(&self, off: usize) -> u16 {
        peek_u16(self.data.as_ref(), off).unwrap_or(0)
    }

    pub fn priority(&self) -> i16 {
        self.word(OFF_PRIORITY) as i16
    }

    pub fn dta(&self) -> SegPtr {
        make_segptr(self.word(OFF_DTA + 2), self.word(OFF_DTA))
    }

    pub fn module_name(&self) -> String {
        let raw = &self.data.as_ref()[OFF_MODULE_NAME..OFF_MODULE_NAME + MODULE_NAME_SIZE];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Current drive, 0 for A:.
    pub fn drive(&self) -> u8 {
        self.data.as_ref()[OFF_CURDRIVE] & 0x7f
    }

    pub fn current_dir(&self) -> String {
        let raw = &self.data.as_ref()[OFF_CURDIR..OFF_CURDIR + CURDIR_SIZE];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TaskDb<B> {
    pub(crate) fn set_word(&mut self, off: usize, v: u16) {
        if let Some(b) = self.data.as_mut().get_mut(off..off + 2) {
            b.copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn set_priority(&mut self, priority: i16) {
        self.set_word(OFF_PRIORITY, priority as u16)
    }

    pub fn set_dta(&mut self, dta: SegPtr) {
        self.set_word(OFF_DTA, dta as u16);
        self.set_word(OFF_DTA + 2, (dta >> 16) as u16);
    }

    pub fn set_module_name(&mut self, name: &str) {
        let raw = &mut self.data.as_mut()[OFF_MODULE_NAME..OFF_MODULE_NAME + MODULE_NAME_SIZE];
        raw.fill(0);
        let n = name.len().min(MODULE_NAME_SIZE);
        raw[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    /// Drive letter index (0 is A:) and directory without the drive.
    pub fn set_current_dir(&mut self, drive: u8, dir: &str) {
        self.data.as_mut()[OFF_CURDRIVE] = 0x80 | drive;
        let raw = &mut self.data.as_mut()[OFF_CURDIR..OFF_CURDIR + CURDIR_SIZE];
        raw.fill(0);
        let n = dir.len().min(CURDIR_SIZE - 1);
        raw[..n].copy_from_slice(&dir.as_bytes()[..n]);
    }
}

pub fn get_task(heap: &GlobalHeap, htask: u16) -> Option<TaskDb<&[u8]>> {
    if htask == 0 {
        return None;
    }
    heap.segment(handle_to_sel(htask)).ok().and_then(TaskDb::new)
}

pub fn get_task_mut(heap: &mut GlobalHeap, htask: u16) -> Option<TaskDb<&mut [u8]>> {
    if htask == 0 {
        return None;
    }
    heap.segment_mut(handle_to_sel(htask))
        .ok()
        .and_then(TaskDb::new)
}

/// Allocate a TDB with its magic set. The caller fills in the rest.
pub fn alloc_tdb(heap: &mut GlobalHeap, hmodule: u16) -> Result<u16> {
    let htask = heap.alloc(
        GlobalFlags::FIXED | GlobalFlags::ZEROINIT,
        TDB_SIZE as u32,
        hmodule,
    );
    if htask == 0 {
        return Err(KernelError::OutOfMemory(TDB_SIZE as u32));
    }
    heap.write_word(make_segptr(handle_to_sel(htask), 0xfa), TDB_MAGIC)?;
    let mut tdb = get_task_mut(heap, htask).ok_or(KernelError::InvalidHandle(htask))?;
    tdb.set_hself(htask);
    Ok(htask)
}

/// The contents of a fresh PDB. `dispatcher` is the far address called through
/// offset 5.
pub fn build_pdb(cmdline: &str, parent: u16, environment: u16, dispatcher: SegPtr) -> Vec<u8> {
    let mut pdb = vec![0u8; PDB_SIZE as usize];
    pdb[0x00..0x02].copy_from_slice(&[0xcd, 0x20]);
    // paragraph just past conventional memory
    pdb[0x02..0x04].copy_from_slice(&0xa000u16.to_le_bytes());
    pdb[0x05] = 0x9a;
    pdb[0x06..0x0a].copy_from_slice(&dispatcher.to_le_bytes());
    pdb[0x16..0x18].copy_from_slice(&parent.to_le_bytes());
    let handles = PDB_FILE_HANDLES as usize;
    pdb[handles..handles + PDB_HANDLE_COUNT as usize].fill(0xff);
    pdb[0x2c..0x2e].copy_from_slice(&environment.to_le_bytes());
    pdb[0x32..0x34].copy_from_slice(&PDB_HANDLE_COUNT.to_le_bytes());
    pdb[0x50..0x53].copy_from_slice(&[0xcd, 0x21, 0xcb]);

    let tail = cmdline.as_bytes();
    let n = tail.len().min(CMDLINE_MAX);
    if n < tail.len() {
        debug!("command line truncated to {} characters", CMDLINE_MAX);
    }
    let at = PDB_CMDLINE as usize;
    pdb[at] = n as u8;
    pdb[at + 1..at + 1 + n].copy_from_slice(&tail[..n]);
    pdb[at + 1 + n] = b'\r';
    pdb
}

/// Allocate and fill the PDB of a new task; returns its handle.
pub fn create_pdb(
    heap: &mut GlobalHeap,
    hmodule: u16,
    cmdline: &str,
    parent: u16,
    environment: u16,
    dispatcher: SegPtr,
) -> Result<u16> {
    let hpdb = heap.alloc(
        GlobalFlags::FIXED | GlobalFlags::ZEROINIT,
        PDB_SIZE as u32,
        hmodule,
    );
    if hpdb == 0 {
        return Err(KernelError::OutOfMemory(PDB_SIZE as u32));
    }
    let sel = handle_to_sel(hpdb);
    let mut image = build_pdb(cmdline, parent, environment, dispatcher);
    image[0x34..0x38].copy_from_slice(&make_segptr(sel, PDB_FILE_HANDLES).to_le_bytes());
    heap.write(make_segptr(sel, 0), &image)?;
    Ok(hpdb)
}

/// Text following the program name in the PDB command tail.
pub fn command_tail(heap: &GlobalHeap, hpdb: u16) -> Result<String> {
    let at = make_segptr(handle_to_sel(hpdb), PDB_CMDLINE);
    let len = heap.read(at, 1)?[0] as usize;
    let raw = heap.read(at + 1, len.min(CMDLINE_MAX))?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// `NAME=value` strings, an empty string, then a word count of 1 and the program
/// path, as DOS lays an environment out.
pub fn build_environment(vars: impl IntoIterator<Item = (String, String)>, program: &str) -> Vec<u8> {
    let mut env = vec![];
    for (name, value) in vars {
        let entry = format!("{}={}", name, value);
        if env.len() + entry.len() + 1 > ENVIRONMENT_MAX {
            trace!("environment full, dropping {}", name);
            continue;
        }
        env.extend_from_slice(entry.as_bytes());
        env.push(0);
    }
    env.push(0);
    env.extend_from_slice(&1u16.to_le_bytes());
    env.extend_from_slice(program.as_bytes());
    env.push(0);
    env
}

/// Insert `htask` in front of the first task whose priority is not lower.
pub fn link_task(heap: &mut GlobalHeap, first: &mut u16, htask: u16) -> Result<()> {
    let priority = get_task(heap, htask)
        .ok_or(KernelError::InvalidHandle(htask))?
        .priority();
    let mut prev: Option<u16> = None;
    let mut cur = *first;
    while let Some(tdb) = get_task(heap, cur) {
        if tdb.priority() >= priority {
            break;
        }
        prev = Some(cur);
        cur = tdb.next();
    }
    get_task_mut(heap, htask)
        .ok_or(KernelError::InvalidHandle(htask))?
        .set_next(cur);
    match prev {
        None => *first = htask,
        Some(p) => get_task_mut(heap, p)
            .ok_or(KernelError::InvalidHandle(p))?
            .set_next(htask),
    }
    Ok(())
}

pub fn unlink_task(heap: &mut GlobalHeap, first: &mut u16, htask: u16) {
    let next = match get_task(heap, htask) {
        Some(tdb) => tdb.next(),
        None => return,
    };
    if *first == htask {
        *first = next;
        return;
    }
    let mut cur = *first;
    while let Some(tdb) = get_task(heap, cur) {
        if tdb.next() == htask {
            if let Some(mut prev) = get_task_mut(heap, cur) {
                prev.set_next(next);
            }
            return;
        }
        cur = tdb.next();
    }
}

/// Handles of the run queue, in order.
pub fn task_list(heap: &GlobalHeap, first: u16) -> Vec<u16> {
    let mut out = vec![];
    let mut cur = first;
    while let Some(tdb) = get_task(heap, cur) {
        if out.contains(&cur) {
            break;
        }
        out.push(cur);
        cur = tdb.next();
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MemoryConfig;

    fn task(heap: &mut GlobalHeap, priority: i16) -> u16 {
        let h = alloc_tdb(heap, 0).unwrap();
        get_task_mut(heap, h).unwrap().set_priority(priority);
        h
    }

    #[test]
    fn test_priority_order() {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let mut first = 0;
        let a = task(&mut heap, 0);
        let b = task(&mut heap, -5);
        let c = task(&mut heap, 3);
        let d = task(&mut heap, 0);
        for h in [a, b, c, d] {
            link_task(&mut heap, &mut first, h).unwrap();
        }
        // equal priorities go in front of the earlier task
        assert_eq!(task_list(&heap, first), vec![b, d, a, c]);
        unlink_task(&mut heap, &mut first, d);
        unlink_task(&mut heap, &mut first, b);
        assert_eq!(task_list(&heap, first), vec![a, c]);
        unlink_task(&mut heap, &mut first, c);
        assert_eq!(task_list(&heap, first), vec![a]);
    }

    #[test]
    fn test_tdb_fields() {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let h = alloc_tdb(&mut heap, 0).unwrap();
        {
            let mut tdb = get_task_mut(&mut heap, h).unwrap();
            tdb.set_module_name("VERYLONGNAME");
            tdb.set_current_dir(2, "\\WINDOWS");
            tdb.set_dta(0x1234_0080);
            tdb.set_priority(-3);
        }
        let tdb = get_task(&heap, h).unwrap();
        assert_eq!(tdb.hself(), h);
        assert_eq!(tdb.module_name(), "VERYLONG");
        assert_eq!(tdb.current_dir(), "\\WINDOWS");
        assert_eq!(tdb.dta(), 0x1234_0080);
        assert_eq!(tdb.priority(), -3);

        let plain = heap.alloc(GlobalFlags::FIXED, TDB_SIZE as u32, 0);
        assert!(get_task(&heap, plain).is_none());
    }

    #[test]
    fn test_pdb_layout() {
        let long = "x".repeat(200);
        let pdb = build_pdb(&long, 0x17, 0x27, 0x00ef_0330);
        assert_eq!(&pdb[0..2], &[0xcd, 0x20]);
        assert_eq!(&pdb[5..10], &[0x9a, 0x30, 0x03, 0xef, 0x00]);
        assert_eq!(pdb[0x80] as usize, CMDLINE_MAX);
        assert_eq!(pdb[0x80 + 1 + CMDLINE_MAX], b'\r');
        assert_eq!(&pdb[0x50..0x53], &[0xcd, 0x21, 0xcb]);
        assert_eq!(pdb[0x18], 0xff);

        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let h = create_pdb(&mut heap, 0, " /x file", 0, 0, 0).unwrap();
        assert_eq!(command_tail(&heap, h).unwrap(), " /x file");
        let handles = heap.read(make_segptr(handle_to_sel(h), 0x34), 4).unwrap();
        assert_eq!(u16::from_le_bytes([handles[0], handles[1]]), PDB_FILE_HANDLES);
    }

    #[test]
    fn test_environment_block() {
        let env = build_environment(vec![("PATH".to_string(), "C:\\".to_string())], "C:\\APP.EXE");
        assert_eq!(env, b"PATH=C:\\\0\0\x01\0C:\\APP.EXE\0".to_vec());
    }
}
