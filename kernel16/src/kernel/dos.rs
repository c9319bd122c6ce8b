//! The few DOS services 16-bit startup and self-loading code relies on, and
//! the file handles they work with.
//!
//! Files are read-only views of module images already in memory; a
//! self-loading module reads its own segments through them.

use std::{collections::HashMap, sync::Arc};

use log::{trace, warn};

use super::{Kernel, KernelState};
use crate::{
    errors::{KernelError, Result},
    global::handle_to_sel,
    registers::{Context16, FLAG_CARRY},
    task::get_task,
    utils::{make_segptr, SegPtr},
};

pub const HFILE_ERROR: u16 = 0xffff;
/// Handles below this are the standard DOS devices.
const FIRST_FILE_HANDLE: u16 = 5;
const SEEK_SET: u16 = 0;
const SEEK_CUR: u16 = 1;
const SEEK_END: u16 = 2;

const DOS_VERSION: u16 = 0x1606;
const ERROR_INVALID_FUNCTION: u16 = 1;
const ERROR_INVALID_HANDLE: u16 = 6;

struct OpenFile {
    data: Arc<Vec<u8>>,
    pos: usize,
}

#[derive(Default)]
pub struct FileTable {
    files: HashMap<u16, OpenFile>,
}

impl FileTable {
    pub fn open(&mut self, data: Arc<Vec<u8>>) -> u16 {
        let handle = (FIRST_FILE_HANDLE..HFILE_ERROR)
            .find(|h| !self.files.contains_key(h))
            .unwrap_or(HFILE_ERROR);
        if handle != HFILE_ERROR {
            self.files.insert(handle, OpenFile { data, pos: 0 });
        }
        handle
    }

    pub fn close(&mut self, handle: u16) -> bool {
        self.files.remove(&handle).is_some()
    }

    /// Up to `count` bytes from the current position.
    pub fn read(&mut self, handle: u16, count: usize) -> Option<Vec<u8>> {
        let file = self.files.get_mut(&handle)?;
        let start = file.pos.min(file.data.len());
        let end = (start + count).min(file.data.len());
        file.pos = end;
        Some(file.data[start..end].to_vec())
    }

    /// Move the position; `None` for a bad handle, origin, or a target before
    /// the start.
    pub fn seek(&mut self, handle: u16, offset: i32, origin: u16) -> Option<u32> {
        let file = self.files.get_mut(&handle)?;
        let base = match origin {
            SEEK_SET => 0,
            SEEK_CUR => file.pos as i64,
            SEEK_END => file.data.len() as i64,
            _ => return None,
        };
        let pos = base + offset as i64;
        if pos < 0 || pos > u32::MAX as i64 {
            return None;
        }
        file.pos = pos as usize;
        Some(pos as u32)
    }
}

impl KernelState {
    /// Read from an open file into 16-bit memory at `buf`.
    fn read_file(&mut self, handle: u16, buf: SegPtr, count: u16) -> Result<Option<u16>> {
        let data = match self.files.read(handle, count as usize) {
            Some(data) => data,
            None => return Ok(None),
        };
        self.heap.write(buf, &data)?;
        Ok(Some(data.len() as u16))
    }
}

impl Kernel {
    pub fn lclose(&self, handle: u16) -> u16 {
        if self.state().files.close(handle) {
            0
        } else {
            HFILE_ERROR
        }
    }

    pub fn lread(&self, handle: u16, buf: SegPtr, count: u16) -> Result<u16> {
        Ok(self
            .with_state(|st| st.read_file(handle, buf, count))?
            .unwrap_or(HFILE_ERROR))
    }

    pub fn llseek(&self, handle: u16, offset: i32, origin: u16) -> u32 {
        self.state()
            .files
            .seek(handle, offset, origin)
            .unwrap_or(0xffff_ffff)
    }

    /// `int 21h` as far as Windows programs use it.
    pub(crate) fn dos3call(&self, ctx: &mut Context16) -> Result<()> {
        let ah = (ctx.eax >> 8) as u8;
        let al = ctx.eax as u8;
        let bx = ctx.ebx as u16;
        trace!("int 21h ah={:02x} al={:02x} bx={:04x}", ah, al, bx);
        ctx.eflags &= !FLAG_CARRY;
        match ah {
            0x19 => {
                let drive = self.with_state(|st| get_task(&st.heap, st.current_task()).map_or(2, |t| t.drive()));
                ctx.eax = (ctx.eax & 0xffff_ff00) | drive as u32;
            }
            0x30 => {
                ctx.set_ax(DOS_VERSION);
                ctx.ebx &= 0xffff_0000;
                ctx.ecx &= 0xffff_0000;
            }
            0x3e => {
                if self.lclose(bx) != 0 {
                    fail(ctx, ERROR_INVALID_HANDLE);
                }
            }
            0x3f => {
                let buf = make_segptr(ctx.ds, ctx.dx());
                match self.with_state(|st| st.read_file(bx, buf, ctx.ecx as u16))? {
                    Some(n) => ctx.set_ax(n),
                    None => fail(ctx, ERROR_INVALID_HANDLE),
                }
            }
            0x42 => {
                let offset = ((ctx.ecx as u16 as u32) << 16 | ctx.dx() as u32) as i32;
                match self.state().files.seek(bx, offset, al as u16) {
                    Some(pos) => {
                        ctx.set_ax(pos as u16);
                        ctx.set_dx((pos >> 16) as u16);
                    }
                    None => fail(ctx, ERROR_INVALID_HANDLE),
                }
            }
            0x4c => return Err(KernelError::TaskExit(al as u16)),
            0x51 | 0x62 => {
                let pdb = self.get_current_pdb();
                ctx.ebx = (ctx.ebx & 0xffff_0000) | handle_to_sel(pdb) as u32;
            }
            _ => {
                warn!("int 21h function {:02x}h not supported", ah);
                fail(ctx, ERROR_INVALID_FUNCTION);
            }
        }
        Ok(())
    }
}

fn fail(ctx: &mut Context16, code: u16) {
    ctx.set_ax(code);
    ctx.eflags |= FLAG_CARRY;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_table() {
        let mut files = FileTable::default();
        let h = files.open(Arc::new(b"0123456789".to_vec()));
        assert_eq!(h, FIRST_FILE_HANDLE);
        assert_eq!(files.read(h, 4).unwrap(), b"0123");
        assert_eq!(files.seek(h, -2, SEEK_END), Some(8));
        assert_eq!(files.read(h, 10).unwrap(), b"89");
        assert_eq!(files.read(h, 10).unwrap(), b"");
        assert_eq!(files.seek(h, -1, SEEK_SET), None);
        assert_eq!(files.seek(h, 3, SEEK_SET), Some(3));
        assert_eq!(files.seek(h, 2, SEEK_CUR), Some(5));

        let second = files.open(Arc::new(vec![]));
        assert_ne!(second, h);
        assert!(files.close(h));
        assert!(!files.close(h));
        assert!(files.read(h, 1).is_none());
        assert_eq!(files.open(Arc::new(vec![])), h);
    }
}
