//! On-disk structures of a New Executable image.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use goblin::pe::header::{DOS_MAGIC, PE_MAGIC, PE_POINTER_OFFSET};
use serde::Serialize;
use std::io::Cursor;

use crate::{
    errors::{KernelError, Result},
    utils::{peek_u16, peek_u32},
};

pub const IMAGE_OS2_SIGNATURE: u16 = 0x454e;
pub const IMAGE_OS2_SIGNATURE_LX: u16 = 0x584c;
pub const NE_HEADER_SIZE: usize = 0x40;
pub const DOS_HEADER_SIZE: usize = 0x40;

pub const NE_OSFLAGS_WINDOWS: u8 = 0x02;
pub const NE_OSFLAGS_WINDOWS386: u8 = 0x04;

/// Size of one segment table entry on disk.
pub const DISK_SEGMENT_SIZE: usize = 8;

#[derive(Serialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct NeHeader {
    pub magic: u16,
    pub ver: u8,
    pub rev: u8,
    pub enttab: u16,
    pub cbenttab: u16,
    pub crc: u32,
    pub flags: u16,
    pub autodata: u16,
    pub heap: u16,
    pub stack: u16,
    pub csip: u32,
    pub sssp: u32,
    pub cseg: u16,
    pub cmod: u16,
    pub cbnrestab: u16,
    pub segtab: u16,
    pub rsrctab: u16,
    pub restab: u16,
    pub modtab: u16,
    pub imptab: u16,
    /// Absolute file offset, unlike the other table offsets.
    pub nrestab: u32,
    pub cmovent: u16,
    pub align: u16,
    pub cres: u16,
    pub exetyp: u8,
    pub flagsothers: u8,
    pub pretthunks: u16,
    pub psegrefbytes: u16,
    pub swaparea: u16,
    pub expver: u16,
}

impl NeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NE_HEADER_SIZE {
            return Err(KernelError::BadFormat("truncated NE header".into()));
        }
        let mut r = Cursor::new(data);
        Ok(Self {
            magic: r.read_u16::<LittleEndian>()?,
            ver: r.read_u8()?,
            rev: r.read_u8()?,
            enttab: r.read_u16::<LittleEndian>()?,
            cbenttab: r.read_u16::<LittleEndian>()?,
            crc: r.read_u32::<LittleEndian>()?,
            flags: r.read_u16::<LittleEndian>()?,
            autodata: r.read_u16::<LittleEndian>()?,
            heap: r.read_u16::<LittleEndian>()?,
            stack: r.read_u16::<LittleEndian>()?,
            csip: r.read_u32::<LittleEndian>()?,
            sssp: r.read_u32::<LittleEndian>()?,
            cseg: r.read_u16::<LittleEndian>()?,
            cmod: r.read_u16::<LittleEndian>()?,
            cbnrestab: r.read_u16::<LittleEndian>()?,
            segtab: r.read_u16::<LittleEndian>()?,
            rsrctab: r.read_u16::<LittleEndian>()?,
            restab: r.read_u16::<LittleEndian>()?,
            modtab: r.read_u16::<LittleEndian>()?,
            imptab: r.read_u16::<LittleEndian>()?,
            nrestab: r.read_u32::<LittleEndian>()?,
            cmovent: r.read_u16::<LittleEndian>()?,
            align: r.read_u16::<LittleEndian>()?,
            cres: r.read_u16::<LittleEndian>()?,
            exetyp: r.read_u8()?,
            flagsothers: r.read_u8()?,
            pretthunks: r.read_u16::<LittleEndian>()?,
            psegrefbytes: r.read_u16::<LittleEndian>()?,
            swaparea: r.read_u16::<LittleEndian>()?,
            expver: r.read_u16::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(NE_HEADER_SIZE);
        // writes into a Vec cannot fail
        let _ = (|| -> std::io::Result<()> {
            w.write_u16::<LittleEndian>(self.magic)?;
            w.write_u8(self.ver)?;
            w.write_u8(self.rev)?;
            w.write_u16::<LittleEndian>(self.enttab)?;
            w.write_u16::<LittleEndian>(self.cbenttab)?;
            w.write_u32::<LittleEndian>(self.crc)?;
            w.write_u16::<LittleEndian>(self.flags)?;
            w.write_u16::<LittleEndian>(self.autodata)?;
            w.write_u16::<LittleEndian>(self.heap)?;
            w.write_u16::<LittleEndian>(self.stack)?;
            w.write_u32::<LittleEndian>(self.csip)?;
            w.write_u32::<LittleEndian>(self.sssp)?;
            w.write_u16::<LittleEndian>(self.cseg)?;
            w.write_u16::<LittleEndian>(self.cmod)?;
            w.write_u16::<LittleEndian>(self.cbnrestab)?;
            w.write_u16::<LittleEndian>(self.segtab)?;
            w.write_u16::<LittleEndian>(self.rsrctab)?;
            w.write_u16::<LittleEndian>(self.restab)?;
            w.write_u16::<LittleEndian>(self.modtab)?;
            w.write_u16::<LittleEndian>(self.imptab)?;
            w.write_u32::<LittleEndian>(self.nrestab)?;
            w.write_u16::<LittleEndian>(self.cmovent)?;
            w.write_u16::<LittleEndian>(self.align)?;
            w.write_u16::<LittleEndian>(self.cres)?;
            w.write_u8(self.exetyp)?;
            w.write_u8(self.flagsothers)?;
            w.write_u16::<LittleEndian>(self.pretthunks)?;
            w.write_u16::<LittleEndian>(self.psegrefbytes)?;
            w.write_u16::<LittleEndian>(self.swaparea)?;
            w.write_u16::<LittleEndian>(self.expver)
        })();
        w
    }
}

/// A segment table entry as stored in the file.
#[derive(Serialize, Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DiskSegment {
    /// In units of `1 << align`; 0 when the segment has no file data.
    pub filepos: u16,
    pub size: u16,
    pub flags: u16,
    pub minsize: u16,
}

impl DiskSegment {
    pub fn parse(data: &[u8]) -> Option<Self> {
        Some(Self {
            filepos: peek_u16(data, 0)?,
            size: peek_u16(data, 2)?,
            flags: peek_u16(data, 4)?,
            minsize: peek_u16(data, 6)?,
        })
    }
}

/// Offset of the NE header inside `image`, after rejecting the formats that are
/// recognisable but not loadable here.
pub fn locate_ne_header(image: &[u8], path: &str) -> Result<usize> {
    if peek_u16(image, 0) != Some(DOS_MAGIC) || image.len() < DOS_HEADER_SIZE {
        return Err(KernelError::BadFormat(format!("{}: no MZ header", path)));
    }
    let lfanew = peek_u32(image, PE_POINTER_OFFSET as usize).unwrap_or(0) as usize;
    if lfanew.checked_add(NE_HEADER_SIZE).map_or(true, |end| end > image.len()) {
        return Err(KernelError::BadFormat(format!("{}: header past end of file", path)));
    }
    if peek_u32(image, lfanew) == Some(PE_MAGIC) {
        return Err(KernelError::Win32Module(path.to_string()));
    }
    match peek_u16(image, lfanew) {
        Some(IMAGE_OS2_SIGNATURE) => Ok(lfanew),
        Some(IMAGE_OS2_SIGNATURE_LX) => Err(KernelError::LinearExecutable(path.to_string())),
        _ => Err(KernelError::BadFormat(format!("{}: not an NE image", path))),
    }
}

/// Parse and sanity check the header of an NE image.
pub fn read_header(image: &[u8], path: &str) -> Result<(usize, NeHeader)> {
    let lfanew = locate_ne_header(image, path)?;
    let header = NeHeader::parse(&image[lfanew..])?;
    if header.exetyp != NE_OSFLAGS_WINDOWS && header.exetyp != NE_OSFLAGS_WINDOWS386 {
        return Err(KernelError::BadFormat(format!(
            "{}: target OS {:#x} is not Windows",
            path, header.exetyp
        )));
    }
    Ok((lfanew, header))
}

#[cfg(test)]
mod test {
    use super::*;

    fn mz_with(lfanew: u32, magic: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; lfanew as usize + NE_HEADER_SIZE];
        image[0..2].copy_from_slice(b"MZ");
        image[0x3c..0x40].copy_from_slice(&lfanew.to_le_bytes());
        image[lfanew as usize..lfanew as usize + magic.len()].copy_from_slice(magic);
        image
    }

    #[test]
    fn test_rejects_other_formats() {
        assert!(matches!(
            locate_ne_header(&mz_with(0x80, b"PE\0\0"), "A.DLL"),
            Err(KernelError::Win32Module(_))
        ));
        assert!(matches!(
            locate_ne_header(&mz_with(0x80, b"LX"), "A.DLL"),
            Err(KernelError::LinearExecutable(_))
        ));
        assert!(matches!(
            locate_ne_header(b"ZM", "A.DLL"),
            Err(KernelError::BadFormat(_))
        ));
        let mut short = mz_with(0x80, b"NE");
        short[0x3c..0x40].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(locate_ne_header(&short, "A.DLL").is_err());
        assert_eq!(locate_ne_header(&mz_with(0x80, b"NE"), "A.DLL").unwrap(), 0x80);
    }

    #[test]
    fn test_header_bytes() {
        let header = NeHeader {
            magic: IMAGE_OS2_SIGNATURE,
            cseg: 2,
            csip: 0x0001_0010,
            nrestab: 0x1234,
            exetyp: NE_OSFLAGS_WINDOWS,
            expver: 0x030a,
            ..Default::default()
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), NE_HEADER_SIZE);
        assert_eq!(&bytes[0..2], b"NE");
        assert_eq!(NeHeader::parse(&bytes).unwrap(), header);

        let mut image = mz_with(0x40, &bytes);
        assert_eq!(read_header(&image, "A.EXE").unwrap().1.cseg, 2);
        image[0x40 + 0x36] = 1;
        assert!(read_header(&image, "A.EXE").is_err());
    }
}
