//! Local atom tables.
//!
//! The table sits in the local heap of a data segment and is found through the
//! `atomtable` word of the instance data. Entries are fixed local blocks laid out as
//! `next, refcount, length, name...`; an atom is `0xc000 | (entry >> 2)`.

use log::{trace, warn};

use crate::{
    local::{LocalFlags, LocalHeap, INSTANCE_ATOM_TABLE},
    utils::parse_int_name,
};

pub const DEFAULT_ATOM_TABLE_SIZE: u16 = 37;
pub const MAX_ATOM_LEN: usize = 255;
pub const MAX_INT_ATOM: u32 = 0xc000;

const ENTRY_NEXT: u16 = 0;
const ENTRY_REFCOUNT: u16 = 2;
const ENTRY_LENGTH: u16 = 4;
const ENTRY_NAME: u16 = 5;
const ENTRY_HEADER: usize = 6;
/// Bound on bucket chain walks over a corrupted table.
const MAX_CHAIN: usize = 0x4000;

pub fn atom_to_handle(atom: u16) -> u16 {
    atom << 2
}

pub fn handle_to_atom(handle: u16) -> u16 {
    0xc000 | (handle >> 2)
}

/// `hash ^= toupper(c) + i` over the name, modulo the bucket count.
pub fn atom_hash(entries: u16, name: &[u8]) -> u16 {
    let mut hash = 0u16;
    for (i, b) in name.iter().enumerate() {
        hash ^= (b.to_ascii_uppercase() as u16).wrapping_add(i as u16);
    }
    if entries == 0 {
        return 0;
    }
    hash % entries
}

/// `Some(atom)` for `#NNN` names; the atom is 0 when out of range.
fn int_atom(name: &str) -> Option<u16> {
    let value = parse_int_name(name)?;
    Some(if value >= MAX_INT_ATOM { 0 } else { value as u16 })
}

impl LocalHeap<'_> {
    /// Offset of the atom table, if one exists.
    pub fn atom_table(&self) -> Option<u16> {
        match self.word(INSTANCE_ATOM_TABLE) {
            0 => None,
            table if self.word(table) != 0 => Some(table),
            _ => None,
        }
    }

    /// Create the table; 0 if one already exists or the heap is full.
    pub fn init_atom_table(&mut self, entries: u16) -> u16 {
        if self.atom_table().is_some() {
            return 0;
        }
        let entries = if entries == 0 {
            DEFAULT_ATOM_TABLE_SIZE
        } else {
            entries
        };
        let table = self.alloc(LocalFlags::FIXED, 2 + entries * 2);
        if table == 0 {
            return 0;
        }
        self.set_word(table, entries);
        for i in 0..entries {
            self.set_word(table + 2 + i * 2, 0);
        }
        self.set_word(INSTANCE_ATOM_TABLE, table);
        table
    }

    fn entry_name(&self, entry: u16) -> &[u8] {
        let start = entry as usize + ENTRY_NAME as usize;
        let len = match self.bytes().get(start - 1) {
            Some(len) => *len as usize,
            None => return &[],
        };
        self.bytes().get(start..start + len).unwrap_or(&[])
    }

    /// The link word pointing at the entry of `atom`, if the table holds it.
    fn entry_link(&self, table: u16, atom: u16) -> Option<(u16, u16)> {
        let entry = atom_to_handle(atom);
        if entry as usize + ENTRY_HEADER > self.bytes().len() {
            return None;
        }
        let name = self.entry_name(entry);
        let mut link = table + 2 + atom_hash(self.word(table), name) * 2;
        for _ in 0..MAX_CHAIN {
            match self.word(link) {
                0 => return None,
                e if e == entry => return Some((link, entry)),
                e => link = e.checked_add(ENTRY_NEXT)?,
            }
        }
        None
    }

    fn lookup(&self, table: u16, name: &[u8]) -> (u16, u16) {
        let bucket = table + 2 + atom_hash(self.word(table), name) * 2;
        let mut entry = self.word(bucket);
        while entry != 0 {
            if self.entry_name(entry).eq_ignore_ascii_case(name) {
                return (bucket, entry);
            }
            entry = self.word(entry + ENTRY_NEXT);
        }
        (bucket, 0)
    }

    pub fn add_atom(&mut self, name: &str) -> u16 {
        if let Some(atom) = int_atom(name) {
            return atom;
        }
        let table = match self.atom_table() {
            Some(table) => table,
            None => match self.init_atom_table(0) {
                0 => return 0,
                table => table,
            },
        };
        let name = &name.as_bytes()[..name.len().min(MAX_ATOM_LEN)];
        let (_, entry) = self.lookup(table, name);
        if entry != 0 {
            let count = self.word(entry + ENTRY_REFCOUNT);
            self.set_word(entry + ENTRY_REFCOUNT, count.wrapping_add(1));
            trace!("existing atom {:#06x}", handle_to_atom(entry));
            return handle_to_atom(entry);
        }

        let entry_len = ((ENTRY_HEADER + name.len() + 3) & !3) as u16;
        let entry = self.alloc(LocalFlags::FIXED, entry_len);
        if entry == 0 {
            return 0;
        }
        // the table itself is a fixed block and never moves
        let (bucket, _) = self.lookup(table, name);
        let head = self.word(bucket);
        self.set_word(entry + ENTRY_NEXT, head);
        self.set_word(entry + ENTRY_REFCOUNT, 1);
        self.set_byte(entry + ENTRY_LENGTH, name.len() as u8);
        let start = (entry + ENTRY_NAME) as usize;
        if let Some(dst) = self.bytes_mut().get_mut(start..start + entry_len as usize - 5) {
            dst.fill(0);
            dst[..name.len()].copy_from_slice(name);
        }
        self.set_word(bucket, entry);
        trace!("new atom {:#06x}", handle_to_atom(entry));
        handle_to_atom(entry)
    }

    /// Drop a reference; returns 0 on success, the atom if it is unknown.
    pub fn delete_atom(&mut self, atom: u16) -> u16 {
        if (atom as u32) < MAX_INT_ATOM {
            return 0;
        }
        let table = match self.atom_table() {
            Some(table) => table,
            None => return 0,
        };
        let (link, entry) = match self.entry_link(table, atom) {
            Some(found) => found,
            None => {
                warn!("unknown atom {:#06x}", atom);
                return atom;
            }
        };
        let count = self.word(entry + ENTRY_REFCOUNT).wrapping_sub(1);
        self.set_word(entry + ENTRY_REFCOUNT, count);
        if count == 0 {
            let next = self.word(entry + ENTRY_NEXT);
            self.set_word(link, next);
            self.free(entry);
        }
        0
    }

    pub fn find_atom(&self, name: &str) -> u16 {
        if let Some(atom) = int_atom(name) {
            return atom;
        }
        let table = match self.atom_table() {
            Some(table) => table,
            None => return 0,
        };
        let name = &name.as_bytes()[..name.len().min(MAX_ATOM_LEN)];
        match self.lookup(table, name) {
            (_, 0) => 0,
            (_, entry) => handle_to_atom(entry),
        }
    }

    /// Name of `atom`, truncated to `count - 1` characters.
    pub fn atom_name(&self, atom: u16, count: usize) -> Option<String> {
        if count == 0 {
            return None;
        }
        let mut name = if (atom as u32) < MAX_INT_ATOM {
            format!("#{}", atom).into_bytes()
        } else {
            let (_, entry) = self.entry_link(self.atom_table()?, atom)?;
            self.entry_name(entry).to_vec()
        };
        name.truncate(count - 1);
        Some(String::from_utf8_lossy(&name).into_owned())
    }

    pub fn atom_handle(&self, atom: u16) -> u16 {
        if (atom as u32) < MAX_INT_ATOM {
            return 0;
        }
        atom_to_handle(atom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn heap_segment() -> Vec<u8> {
        let mut seg = vec![0u8; 0x2000];
        assert!(LocalHeap::new(&mut seg).init(0x10, 0x1ff0));
        seg
    }

    #[test]
    fn test_hash() {
        assert_eq!(atom_hash(37, b"abc"), atom_hash(37, b"ABC"));
        // 'A' ^ ('B' + 1) = 0x41 ^ 0x43 = 2
        assert_eq!(atom_hash(37, b"AB"), 2);
    }

    #[test]
    fn test_add_find_delete() {
        let mut seg = heap_segment();
        let mut heap = LocalHeap::new(&mut seg);
        let a = heap.add_atom("Hello");
        assert!(a >= 0xc000);
        assert_eq!(heap.add_atom("HELLO"), a);
        assert_eq!(heap.find_atom("hello"), a);
        assert_eq!(heap.atom_name(a, 256).as_deref(), Some("Hello"));
        assert_eq!(heap.atom_name(a, 3).as_deref(), Some("He"));

        assert_eq!(heap.delete_atom(a), 0);
        assert_eq!(heap.find_atom("Hello"), a);
        assert_eq!(heap.delete_atom(a), 0);
        assert_eq!(heap.find_atom("Hello"), 0);
        assert!(heap.validate());
    }

    #[test]
    fn test_integer_atoms() {
        let mut seg = heap_segment();
        let mut heap = LocalHeap::new(&mut seg);
        assert_eq!(heap.add_atom("#123"), 123);
        assert_eq!(heap.find_atom("#123"), 123);
        assert_eq!(heap.add_atom("#49152"), 0);
        assert_eq!(heap.atom_name(123, 10).as_deref(), Some("#123"));
        assert_eq!(heap.delete_atom(123), 0);
        assert_eq!(heap.atom_handle(123), 0);
        assert!(heap.atom_table().is_none());
    }

    #[test]
    fn test_unknown_atoms() {
        let mut seg = heap_segment();
        let mut heap = LocalHeap::new(&mut seg);
        let a = heap.add_atom("Hello");
        assert_eq!(heap.atom_name(0xffff, 10), None);
        assert_eq!(heap.delete_atom(0xffff), 0xffff);
        assert_eq!(heap.atom_name(0xc001, 10), None);
        assert_eq!(heap.delete_atom(0xc001), 0xc001);
        assert_eq!(heap.atom_name(a, 10).as_deref(), Some("Hello"));

        assert_eq!(heap.delete_atom(a), 0);
        assert_eq!(heap.atom_name(a, 10), None);
        assert_eq!(heap.delete_atom(a), a);
        assert!(heap.validate());
    }

    #[test]
    fn test_collisions_share_bucket() {
        let mut seg = heap_segment();
        let mut heap = LocalHeap::new(&mut seg);
        assert_ne!(heap.init_atom_table(1), 0);
        let a = heap.add_atom("one");
        let b = heap.add_atom("two");
        assert_ne!(a, b);
        assert_eq!(heap.find_atom("one"), a);
        assert_eq!(heap.find_atom("two"), b);
        assert_eq!(heap.delete_atom(a), 0);
        assert_eq!(heap.find_atom("two"), b);
        assert_eq!(heap.find_atom("one"), 0);
        assert_eq!(heap.init_atom_table(0), 0);
    }
}
