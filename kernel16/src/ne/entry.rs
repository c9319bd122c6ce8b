//! Entry points.
//!
//! On disk the entry table is a run of bundles, each a count, a type and then
//! fixed (3 byte) or moveable (6 byte) records; a zero type skips ordinals. In
//! memory it is expanded to bundles of uniform 5 byte entries:
//!
//! ```text
//! bundle: first u16, last u16, next u16      ordinals first+1 ..= last
//! entry:  type u8, flags u8, segnum u8, offs u16
//! ```

use serde::Serialize;

use crate::{
    errors::{KernelError, Result},
    global::handle_to_sel,
    ne::module::NeModule,
    utils::{make_segptr, peek_u16, SegPtr},
};

pub const BUNDLE_HEADER_SIZE: usize = 6;
pub const ENTRY_SIZE: usize = 5;
pub const ENTRY_MOVEABLE: u8 = 0xff;
/// Segment number of an absolute constant.
pub const ENTRY_CONSTANT: u8 = 0xfe;

pub const ENTRY_EXPORTED: u8 = 0x01;
pub const ENTRY_SHARED_DATA: u8 = 0x02;

#[derive(Serialize, Copy, Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub ordinal: u16,
    pub kind: u8,
    pub flags: u8,
    pub segnum: u8,
    pub offset: u16,
}

fn put_word(block: &mut [u8], off: usize, v: u16) -> Result<()> {
    block
        .get_mut(off..off + 2)
        .ok_or(KernelError::OutOfBounds(0, off as u32))?
        .copy_from_slice(&v.to_le_bytes());
    Ok(())
}

/// Expand the file entry table `table` into `block[start..end]`.
pub fn build_bundle_data(table: &[u8], block: &mut [u8], start: usize, end: usize) -> Result<()> {
    let overflow = |off: usize| KernelError::OutOfBounds(0, off as u32);
    if start + BUNDLE_HEADER_SIZE > end {
        return Err(overflow(start));
    }
    let mut bundle = start;
    let (mut first, mut last) = (0u16, 0u16);
    put_word(block, bundle, 0)?;
    put_word(block, bundle + 2, 0)?;
    put_word(block, bundle + 4, 0)?;
    let mut entry = bundle + BUNDLE_HEADER_SIZE;

    let mut p = 0;
    while let Some(&count) = table.get(p) {
        if count == 0 {
            break;
        }
        let kind = match table.get(p + 1) {
            Some(&k) => k,
            None => break,
        };
        p += 2;
        if kind != 0 {
            last = last.wrapping_add(count as u16);
            for _ in 0..count {
                let (flags, segnum, offs) = if kind == ENTRY_MOVEABLE {
                    // flags, int 3fh, segment, offset
                    let rec = table.get(p..p + 6).ok_or(overflow(p))?;
                    p += 6;
                    (rec[0], rec[3], u16::from_le_bytes([rec[4], rec[5]]))
                } else {
                    let rec = table.get(p..p + 3).ok_or(overflow(p))?;
                    p += 3;
                    (rec[0], kind, u16::from_le_bytes([rec[1], rec[2]]))
                };
                if entry + ENTRY_SIZE > end {
                    return Err(overflow(entry));
                }
                block[entry] = kind;
                block[entry + 1] = flags;
                block[entry + 2] = segnum;
                put_word(block, entry + 3, offs)?;
                entry += ENTRY_SIZE;
            }
            put_word(block, bundle + 2, last)?;
        } else if first == last {
            first = first.wrapping_add(count as u16);
            last = last.wrapping_add(count as u16);
            put_word(block, bundle, first)?;
            put_word(block, bundle + 2, last)?;
        } else {
            // a gap after some entries opens a new bundle
            if entry + BUNDLE_HEADER_SIZE > end {
                return Err(overflow(entry));
            }
            put_word(block, bundle + 4, entry as u16)?;
            bundle = entry;
            first = last.wrapping_add(count as u16);
            last = first;
            put_word(block, bundle, first)?;
            put_word(block, bundle + 2, last)?;
            put_word(block, bundle + 4, 0)?;
            entry += BUNDLE_HEADER_SIZE;
        }
    }
    Ok(())
}

impl<B: AsRef<[u8]>> NeModule<B> {
    /// Offsets of the bundles in chain order.
    fn bundles(&self) -> Vec<usize> {
        let mut out = vec![];
        let mut bundle = self.enttab() as usize;
        if bundle == 0 {
            return out;
        }
        loop {
            if peek_u16(self.bytes(), bundle + 4).is_none() {
                break;
            }
            out.push(bundle);
            let next = self.word(bundle + 4) as usize;
            // bundles are laid out in ascending order
            if next <= bundle {
                break;
            }
            bundle = next;
        }
        out
    }

    /// Block offset of the entry for `ordinal`.
    fn entry_offset(&self, ordinal: u16) -> Option<usize> {
        self.bundles().into_iter().find_map(|bundle| {
            let first = self.word(bundle);
            let last = self.word(bundle + 2);
            if ordinal > first && ordinal <= last {
                let off = bundle
                    + BUNDLE_HEADER_SIZE
                    + (ordinal - first - 1) as usize * ENTRY_SIZE;
                self.bytes().get(off..off + ENTRY_SIZE).map(|_| off)
            } else {
                None
            }
        })
    }

    pub fn entry(&self, ordinal: u16) -> Option<Entry> {
        let off = self.entry_offset(ordinal)?;
        Some(Entry {
            ordinal,
            kind: self.byte(off),
            flags: self.byte(off + 1),
            segnum: self.byte(off + 2),
            offset: self.word(off + 3),
        })
    }

    pub fn entries(&self) -> Vec<Entry> {
        let mut out = vec![];
        for bundle in self.bundles() {
            let first = self.word(bundle);
            let last = self.word(bundle + 2);
            for ordinal in first.saturating_add(1)..=last {
                if let Some(e) = self.entry(ordinal) {
                    out.push(e);
                }
            }
        }
        out
    }

    /// Far address of an exported ordinal, 0 when there is none. Constants come
    /// back with selector 0xffff.
    pub fn entry_point(&self, ordinal: u16) -> SegPtr {
        if self.is_win32() {
            return 0;
        }
        let entry = match self.entry(ordinal) {
            Some(e) => e,
            None => return 0,
        };
        if entry.segnum == ENTRY_CONSTANT {
            return make_segptr(0xffff, entry.offset);
        }
        match self.seg(entry.segnum as u16) {
            Some(seg) => make_segptr(handle_to_sel(seg.hseg), entry.offset),
            None => 0,
        }
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NeModule<B> {
    /// Change the offset of an entry point; returns false if it does not exist.
    pub fn set_entry_point(&mut self, ordinal: u16, offset: u16) -> bool {
        match self.entry_offset(ordinal) {
            Some(off) => {
                self.set_word(off + 3, offset);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ne::module::NE_MODULE_SIZE;
    use hex_literal::hex;

    fn module_with(table: &[u8]) -> Vec<u8> {
        let mut block = vec![0u8; 0x100];
        block[0..2].copy_from_slice(b"NE");
        block[0x04..0x06].copy_from_slice(&NE_MODULE_SIZE.to_le_bytes());
        build_bundle_data(table, &mut block, NE_MODULE_SIZE as usize, 0x100).unwrap();
        block
    }

    #[test]
    fn test_bundles_with_gaps() {
        // two fixed entries in segment 1, skip 3 ordinals, one moveable entry
        let table = hex!(
            "02 01 01 1000 03 2000"
            "03 00"
            "01 ff 03 cd3f 02 4000"
            "00"
        );
        let block = module_with(&table);
        let module = NeModule::new(&block[..]).unwrap();
        let entries = module.entries();
        assert_eq!(entries.iter().map(|e| e.ordinal).collect::<Vec<_>>(), vec![1, 2, 6]);
        assert_eq!(entries[0].offset, 0x0010);
        assert_eq!(entries[1].flags, 3);
        assert_eq!(entries[2].segnum, 2);
        assert_eq!(entries[2].kind, ENTRY_MOVEABLE);
        assert_eq!(entries[2].offset, 0x0040);
        assert!(module.entry(3).is_none());
        assert!(module.entry(7).is_none());
    }

    #[test]
    fn test_leading_gap() {
        let table = hex!("04 00 01 fe 01 0300 00");
        let block = module_with(&table);
        let module = NeModule::new(&block[..]).unwrap();
        assert_eq!(module.entries().len(), 1);
        assert_eq!(module.entry(5).unwrap().offset, 3);
        assert_eq!(module.entry_point(5), make_segptr(0xffff, 3));
    }

    #[test]
    fn test_set_entry_point() {
        let table = hex!("01 01 01 1000 00");
        let mut block = module_with(&table);
        let mut module = NeModule::new(&mut block[..]).unwrap();
        assert!(module.set_entry_point(1, 0x22));
        assert!(!module.set_entry_point(2, 0x22));
        let e = module.entry(1).unwrap();
        assert_eq!((e.segnum, e.offset), (1, 0x22));
    }

    #[test]
    fn test_overflow() {
        let table = hex!("02 01 01 1000 03 2000 00");
        let mut block = vec![0u8; 0x50];
        assert!(build_bundle_data(&table, &mut block, 0x44, 0x4c).is_err());
    }
}
