//! Writes NE images. Used for the built-in modules and by tests.

use std::collections::BTreeMap;

use crate::{
    ne::{
        entry::{ENTRY_CONSTANT, ENTRY_EXPORTED},
        header::{NeHeader, DOS_HEADER_SIZE, IMAGE_OS2_SIGNATURE, NE_HEADER_SIZE, NE_OSFLAGS_WINDOWS},
        module::{ModuleFlags, SegmentFlags},
        reloc::RelocRecord,
        resource::{ResId, RESOURCE_FLAGS_DEFAULT},
    },
    utils::align_up,
};

#[derive(Clone, Debug, Default)]
pub struct SegmentSpec {
    /// File image, already in iterated form when `flags` says so.
    pub data: Vec<u8>,
    pub flags: u16,
    pub minsize: u16,
    pub relocs: Vec<RelocRecord>,
}

#[derive(Clone, Debug)]
struct ResourceSpec {
    type_id: ResId,
    name: ResId,
    data: Vec<u8>,
}

#[derive(Copy, Clone, Debug)]
struct EntrySpec {
    segnum: u8,
    offset: u16,
    flags: u8,
}

#[derive(Clone, Debug)]
pub struct NeBuilder {
    name: String,
    flags: u16,
    expver: u16,
    align_shift: u16,
    heap: u16,
    stack: u16,
    autodata: u16,
    csip: u32,
    sssp: u32,
    description: String,
    segments: Vec<SegmentSpec>,
    entries: BTreeMap<u16, EntrySpec>,
    resident: Vec<(String, u16)>,
    nonresident: Vec<(String, u16)>,
    modules: Vec<String>,
    imported: Vec<u8>,
    resources: Vec<ResourceSpec>,
}

impl NeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            flags: 0,
            expver: 0x030a,
            align_shift: 4,
            heap: 0,
            stack: 0,
            autodata: 0,
            csip: 0,
            sssp: 0,
            description: String::new(),
            segments: vec![],
            entries: BTreeMap::new(),
            resident: vec![],
            nonresident: vec![],
            modules: vec![],
            // offset 0 is never a valid name
            imported: vec![0],
            resources: vec![],
        }
    }

    pub fn lib(&mut self, lib: bool) -> &mut Self {
        if lib {
            self.flags |= ModuleFlags::LIBMODULE.bits();
        } else {
            self.flags &= !ModuleFlags::LIBMODULE.bits();
        }
        self
    }

    pub fn flags(&mut self, flags: ModuleFlags) -> &mut Self {
        self.flags |= flags.bits();
        self
    }

    pub fn expver(&mut self, expver: u16) -> &mut Self {
        self.expver = expver;
        self
    }

    pub fn description(&mut self, text: &str) -> &mut Self {
        self.description = text.to_string();
        self
    }

    /// Add a segment and return its number.
    pub fn segment(&mut self, spec: SegmentSpec) -> u16 {
        self.segments.push(spec);
        self.segments.len() as u16
    }

    pub fn code_segment(&mut self, data: Vec<u8>) -> u16 {
        let minsize = data.len().min(0xffff) as u16;
        self.segment(SegmentSpec {
            data,
            flags: 0,
            minsize,
            relocs: vec![],
        })
    }

    /// The first data segment becomes the automatic data segment.
    pub fn data_segment(&mut self, data: Vec<u8>, minsize: u16) -> u16 {
        let seg = self.segment(SegmentSpec {
            minsize: minsize.max(data.len().min(0xffff) as u16),
            data,
            flags: SegmentFlags::DATA.bits(),
            relocs: vec![],
        });
        if self.autodata == 0 {
            self.autodata = seg;
        }
        seg
    }

    /// A data segment stored as `(repeat, bytes)` records.
    pub fn iterated_segment(&mut self, records: &[(u16, &[u8])], minsize: u16) -> u16 {
        let mut data = vec![];
        for (rept, bytes) in records {
            data.extend_from_slice(&rept.to_le_bytes());
            data.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            data.extend_from_slice(bytes);
        }
        self.segment(SegmentSpec {
            data,
            flags: (SegmentFlags::DATA | SegmentFlags::ITERATED).bits(),
            minsize,
            relocs: vec![],
        })
    }

    pub fn segment_flags(&mut self, segnum: u16, flags: SegmentFlags) -> &mut Self {
        if let Some(seg) = self.segments.get_mut(segnum as usize - 1) {
            seg.flags |= flags.bits();
        }
        self
    }

    pub fn reloc(&mut self, segnum: u16, reloc: RelocRecord) -> &mut Self {
        if let Some(seg) = self.segments.get_mut(segnum as usize - 1) {
            seg.relocs.push(reloc);
        }
        self
    }

    pub fn entry(&mut self, segnum: u16, offset: u16) -> &mut Self {
        self.csip = ((segnum as u32) << 16) | offset as u32;
        self
    }

    /// Stack in `segnum`; the initial `sp` is derived from the segment size.
    pub fn stack(&mut self, segnum: u16, size: u16) -> &mut Self {
        self.sssp = (segnum as u32) << 16;
        self.stack = size;
        self
    }

    pub fn heap(&mut self, size: u16) -> &mut Self {
        self.heap = size;
        self
    }

    pub fn entry_point(&mut self, ordinal: u16, segnum: u16, offset: u16, flags: u8) -> &mut Self {
        self.entries.insert(
            ordinal,
            EntrySpec {
                segnum: segnum as u8,
                offset,
                flags,
            },
        );
        self
    }

    pub fn export(&mut self, name: &str, ordinal: u16, segnum: u16, offset: u16) -> &mut Self {
        self.entry_point(ordinal, segnum, offset, ENTRY_EXPORTED);
        self.resident.push((name.to_ascii_uppercase(), ordinal));
        self
    }

    pub fn export_nonresident(&mut self, name: &str, ordinal: u16, segnum: u16, offset: u16) -> &mut Self {
        self.entry_point(ordinal, segnum, offset, ENTRY_EXPORTED);
        self.nonresident.push((name.to_ascii_uppercase(), ordinal));
        self
    }

    pub fn constant(&mut self, name: &str, ordinal: u16, value: u16) -> &mut Self {
        self.entry_point(ordinal, ENTRY_CONSTANT as u16, value, ENTRY_EXPORTED);
        self.resident.push((name.to_ascii_uppercase(), ordinal));
        self
    }

    fn imported_name(&mut self, name: &str) -> u16 {
        let off = self.imported.len() as u16;
        self.imported.push(name.len() as u8);
        self.imported.extend_from_slice(name.as_bytes());
        off
    }

    /// Reference a module; returns its 1-based index for relocations.
    pub fn import_module(&mut self, name: &str) -> u16 {
        let name = name.to_ascii_uppercase();
        if let Some(i) = self.modules.iter().position(|m| *m == name) {
            return i as u16 + 1;
        }
        self.modules.push(name);
        self.modules.len() as u16
    }

    /// Offset of `name` in the imported names table.
    pub fn import_name(&mut self, name: &str) -> u16 {
        self.imported_name(name)
    }

    pub fn resource(&mut self, type_id: ResId, name: ResId, data: Vec<u8>) -> &mut Self {
        self.resources.push(ResourceSpec { type_id, name, data });
        self
    }

    fn name_table(first: &str, names: &[(String, u16)]) -> Vec<u8> {
        let mut out = vec![];
        for (name, ordinal) in std::iter::once(&(first.to_string(), 0)).chain(names.iter()) {
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&ordinal.to_le_bytes());
        }
        out.push(0);
        out
    }

    fn entry_table(&self) -> Vec<u8> {
        let mut out = vec![];
        let mut next = 1u16;
        let ordinals: Vec<u16> = self.entries.keys().copied().collect();
        let mut i = 0;
        while i < ordinals.len() {
            let ordinal = ordinals[i];
            let mut gap = ordinal - next;
            while gap > 0 {
                let n = gap.min(0xff);
                out.extend_from_slice(&[n as u8, 0]);
                gap -= n;
            }
            let segnum = self.entries[&ordinal].segnum;
            let mut run = vec![];
            while i < ordinals.len()
                && run.len() < 0xff
                && ordinals[i] == ordinal + run.len() as u16
                && self.entries[&ordinals[i]].segnum == segnum
            {
                run.push(self.entries[&ordinals[i]]);
                i += 1;
            }
            out.extend_from_slice(&[run.len() as u8, segnum]);
            for e in &run {
                out.push(e.flags);
                out.extend_from_slice(&e.offset.to_le_bytes());
            }
            next = ordinal + run.len() as u16;
        }
        out.push(0);
        out
    }

    fn resource_table(&self, positions: &[usize]) -> Vec<u8> {
        if self.resources.is_empty() {
            return vec![];
        }
        let mut types: Vec<(&ResId, Vec<usize>)> = vec![];
        for (i, res) in self.resources.iter().enumerate() {
            match types.iter_mut().find(|(t, _)| **t == res.type_id) {
                Some((_, list)) => list.push(i),
                None => types.push((&res.type_id, vec![i])),
            }
        }
        let header_len = 2 + types.len() * 8 + self.resources.len() * 12 + 2;
        let mut strings: Vec<u8> = vec![];
        let id_of = |id: &ResId, strings: &mut Vec<u8>| -> u16 {
            match id {
                ResId::Int(n) => n | 0x8000,
                ResId::Name(s) => {
                    let off = (header_len + strings.len()) as u16;
                    strings.push(s.len() as u8);
                    strings.extend_from_slice(s.as_bytes());
                    off
                }
            }
        };

        let unit = 1usize << self.align_shift;
        let mut out = self.align_shift.to_le_bytes().to_vec();
        for (type_id, list) in &types {
            let tid = id_of(type_id, &mut strings);
            out.extend_from_slice(&tid.to_le_bytes());
            out.extend_from_slice(&(list.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            for &i in list {
                let res = &self.resources[i];
                let id = id_of(&res.name, &mut strings);
                out.extend_from_slice(&((positions[i] >> self.align_shift) as u16).to_le_bytes());
                out.extend_from_slice(&(((res.data.len() + unit - 1) / unit) as u16).to_le_bytes());
                out.extend_from_slice(&RESOURCE_FLAGS_DEFAULT.to_le_bytes());
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&[0; 4]);
            }
        }
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&strings);
        out.push(0);
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let unit = 1usize << self.align_shift;
        let mut modtab = vec![];
        let mut imported = self.imported.clone();
        for name in &self.modules {
            modtab.extend_from_slice(&(imported.len() as u16).to_le_bytes());
            imported.push(name.len() as u8);
            imported.extend_from_slice(name.as_bytes());
        }
        let restab = Self::name_table(&self.name, &self.resident);
        let nrestab = Self::name_table(&self.description, &self.nonresident);
        let enttab = self.entry_table();
        let rsrc_len = self.resource_table(&vec![0; self.resources.len()]).len();

        let segtab_off = NE_HEADER_SIZE;
        let rsrctab_off = segtab_off + self.segments.len() * 8;
        let restab_off = rsrctab_off + rsrc_len;
        let modtab_off = restab_off + restab.len();
        let imptab_off = modtab_off + modtab.len();
        let enttab_off = imptab_off + imported.len();
        let tables_end = enttab_off + enttab.len();

        let mut out = vec![0u8; DOS_HEADER_SIZE + tables_end];
        out[0..2].copy_from_slice(b"MZ");
        out[0x3c..0x40].copy_from_slice(&(DOS_HEADER_SIZE as u32).to_le_bytes());
        let ne = DOS_HEADER_SIZE;

        let mut segtab = vec![];
        for seg in &self.segments {
            let mut flags = seg.flags;
            let filepos = if seg.data.is_empty() {
                0
            } else {
                out.resize(align_up(out.len(), unit), 0);
                let pos = out.len() >> self.align_shift;
                out.extend_from_slice(&seg.data);
                if !seg.relocs.is_empty() {
                    flags |= SegmentFlags::RELOC_DATA.bits();
                    out.extend_from_slice(&(seg.relocs.len() as u16).to_le_bytes());
                    for r in &seg.relocs {
                        out.extend_from_slice(&r.to_bytes());
                    }
                }
                pos
            };
            segtab.extend_from_slice(&(filepos as u16).to_le_bytes());
            segtab.extend_from_slice(&(seg.data.len() as u16).to_le_bytes());
            segtab.extend_from_slice(&flags.to_le_bytes());
            segtab.extend_from_slice(&seg.minsize.to_le_bytes());
        }

        let mut positions = vec![];
        for res in &self.resources {
            out.resize(align_up(out.len(), unit), 0);
            positions.push(out.len());
            out.extend_from_slice(&res.data);
        }
        out.resize(align_up(out.len(), unit), 0);
        let rsrc = self.resource_table(&positions);

        let nrestab_pos = out.len();
        out.extend_from_slice(&nrestab);

        let mut flags = self.flags;
        if self.autodata != 0 {
            flags |= if flags & ModuleFlags::LIBMODULE.bits() != 0 {
                ModuleFlags::SINGLEDATA.bits()
            } else {
                ModuleFlags::MULTIPLEDATA.bits()
            };
        }
        let header = NeHeader {
            magic: IMAGE_OS2_SIGNATURE,
            ver: 5,
            rev: 10,
            enttab: enttab_off as u16,
            cbenttab: enttab.len() as u16,
            crc: 0,
            flags,
            autodata: self.autodata,
            heap: self.heap,
            stack: self.stack,
            csip: self.csip,
            sssp: self.sssp,
            cseg: self.segments.len() as u16,
            cmod: self.modules.len() as u16,
            cbnrestab: nrestab.len() as u16,
            segtab: segtab_off as u16,
            rsrctab: rsrctab_off as u16,
            restab: restab_off as u16,
            modtab: modtab_off as u16,
            imptab: imptab_off as u16,
            nrestab: nrestab_pos as u32,
            cmovent: 0,
            align: self.align_shift,
            cres: 0,
            exetyp: NE_OSFLAGS_WINDOWS,
            flagsothers: 0,
            pretthunks: 0,
            psegrefbytes: 0,
            swaparea: 0,
            expver: self.expver,
        };
        out[ne..ne + NE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        for (off, bytes) in [
            (segtab_off, &segtab),
            (rsrctab_off, &rsrc),
            (restab_off, &restab),
            (modtab_off, &modtab),
            (imptab_off, &imported),
            (enttab_off, &enttab),
        ] {
            out[ne + off..ne + off + bytes.len()].copy_from_slice(bytes);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ne::header::read_header;

    #[test]
    fn test_tables_are_contiguous() {
        let mut b = NeBuilder::new("demo");
        let code = b.code_segment(vec![0x90; 0x30]);
        b.data_segment(vec![1, 2, 3], 0x100);
        b.export("Go", 1, code, 0);
        b.import_module("kernel");
        b.resource(ResId::Int(6), ResId::Int(1), b"hello".to_vec());
        let image = b.build();
        let (_, ne) = read_header(&image, "DEMO.EXE").unwrap();
        assert_eq!(ne.cseg, 2);
        assert_eq!(ne.autodata, 2);
        assert_eq!(ne.cmod, 1);
        assert!(ne.rsrctab < ne.restab);
        assert!(ne.restab < ne.modtab);
        assert_eq!(ne.flags & ModuleFlags::MULTIPLEDATA.bits(), ModuleFlags::MULTIPLEDATA.bits());
        assert_eq!(ne.nrestab as usize + ne.cbnrestab as usize, image.len());
    }

    #[test]
    fn test_entry_table_runs() {
        let mut b = NeBuilder::new("X");
        b.entry_point(1, 1, 0x10, 1)
            .entry_point(2, 1, 0x20, 1)
            .entry_point(5, 2, 0x30, 0);
        assert_eq!(
            b.entry_table(),
            vec![2, 1, 1, 0x10, 0, 1, 0x20, 0, 2, 0, 1, 2, 0, 0x30, 0, 0]
        );
    }
}
