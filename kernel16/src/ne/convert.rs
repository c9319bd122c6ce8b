//! Conversion of 32-bit resource layouts to their 16-bit form, for resources
//! served out of host modules.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use log::{trace, warn};

use crate::{errors::Result, ne::resource::ResourceType};

const MF_POPUP: u16 = 0x0010;
const MF_END: u16 = 0x0080;
const DS_SETFONT: u32 = 0x0040;
const DIALOGEX_SIGNATURE: u32 = 0xffff_0001;
const ACCEL_LAST: u8 = 0x80;

struct Reader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(data),
        }
    }

    fn word(&mut self) -> Result<u16> {
        Ok(self.cur.read_u16::<LittleEndian>()?)
    }

    fn dword(&mut self) -> Result<u32> {
        Ok(self.cur.read_u32::<LittleEndian>()?)
    }

    fn peek_word(&self) -> Result<u16> {
        let mut c = self.cur.clone();
        Ok(c.read_u16::<LittleEndian>()?)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.cur.position() as usize;
        let data: &'a [u8] = *self.cur.get_ref();
        let out = data.get(start..start + len).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "resource truncated")
        })?;
        self.cur.set_position((start + len) as u64);
        Ok(out)
    }

    fn skip(&mut self, len: u64) {
        self.cur.set_position(self.cur.position() + len);
    }

    fn align4(&mut self) {
        let pos = self.cur.position();
        self.cur.set_position((pos + 3) & !3);
    }

    /// Copy a NUL terminated UTF-16 string as 8-bit text.
    fn string(&mut self, out: &mut BytesMut) -> Result<()> {
        loop {
            let c = self.word()?;
            if c == 0 {
                break;
            }
            out.put_u8(if c < 0x100 { c as u8 } else { b'?' });
        }
        out.put_u8(0);
        Ok(())
    }
}

pub fn convert_menu(data: &[u8]) -> Result<Vec<u8>> {
    let mut p = Reader::new(data);
    let mut out = BytesMut::with_capacity(data.len());
    let version = p.word()?;
    let header_size = p.word()?;
    out.put_u16_le(version);
    out.put_u16_le(header_size);
    out.put_slice(p.bytes(header_size as usize)?);

    let mut level = 1;
    while level > 0 {
        if version == 0 {
            let flags = p.word()?;
            out.put_u16_le(flags);
            if flags & MF_POPUP == 0 {
                out.put_u16_le(p.word()?);
            } else {
                level += 1;
            }
            p.string(&mut out)?;
            if flags & MF_END != 0 {
                level -= 1;
            }
        } else {
            out.put_u32_le(p.dword()?); // type
            out.put_u32_le(p.dword()?); // state
            out.put_u16_le(p.dword()? as u16); // id
            let flags = p.word()?;
            out.put_u8(flags as u8);
            p.string(&mut out)?;
            p.align4();
            if flags & 1 != 0 {
                // help id
                out.put_u32_le(p.dword()?);
                level += 1;
            }
            if flags & MF_END != 0 {
                level -= 1;
            }
        }
    }
    Ok(out.to_vec())
}

pub fn convert_dialog(data: &[u8]) -> Result<Vec<u8>> {
    let mut p = Reader::new(data);
    let mut out = BytesMut::with_capacity(data.len());

    let mut style = p.dword()?;
    out.put_u32_le(style);
    let ex = style == DIALOGEX_SIGNATURE;
    if ex {
        out.put_u32_le(p.dword()?); // help id
        out.put_u32_le(p.dword()?); // ex style
        style = p.dword()?;
        out.put_u32_le(style);
    } else {
        p.skip(4);
    }

    let mut items = p.word()?;
    out.put_u8(items as u8);
    for _ in 0..4 {
        out.put_u16_le(p.word()?);
    }

    // menu
    match p.peek_word()? {
        0x0000 => {
            p.skip(2);
            out.put_u8(0);
        }
        0xffff => {
            p.skip(2);
            out.put_u8(0xff);
            out.put_u16_le(p.word()?);
        }
        _ => p.string(&mut out)?,
    }
    // class
    match p.peek_word()? {
        0x0000 => {
            p.skip(2);
            out.put_u8(0);
        }
        0xffff => {
            p.skip(2);
            out.put_u8(0xff);
            out.put_u8(p.word()? as u8);
        }
        _ => p.string(&mut out)?,
    }
    // caption
    p.string(&mut out)?;

    if style & DS_SETFONT != 0 {
        out.put_u16_le(p.word()?); // point size
        if ex {
            out.put_u16_le(p.word()?); // weight
            out.put_u16_le(p.word()?); // italic, charset
        }
        p.string(&mut out)?;
    }

    while items > 0 {
        p.align4();
        let mut item_style = 0;
        if ex {
            out.put_u32_le(p.dword()?); // help id
            out.put_u32_le(p.dword()?); // ex style
            out.put_u32_le(p.dword()?); // style
        } else {
            item_style = p.dword()?;
            p.skip(4);
        }
        for _ in 0..4 {
            out.put_u16_le(p.word()?);
        }
        if ex {
            out.put_u32_le(p.dword()?);
        } else {
            out.put_u16_le(p.word()?);
            out.put_u32_le(item_style);
        }

        // class: predefined classes shrink to one byte
        match p.peek_word()? {
            0x0000 => {
                p.skip(2);
                out.put_u8(0);
            }
            0xffff => {
                p.skip(2);
                out.put_u8(p.word()? as u8);
            }
            _ => p.string(&mut out)?,
        }
        // text
        match p.peek_word()? {
            0x0000 => {
                p.skip(2);
                out.put_u8(0);
            }
            0xffff => {
                p.skip(2);
                out.put_u8(0xff);
                out.put_u16_le(p.word()?);
            }
            _ => p.string(&mut out)?,
        }

        let extra = p.word()?;
        if ex {
            out.put_u16_le(extra);
        } else {
            out.put_u8(extra as u8);
        }
        out.put_slice(p.bytes(extra as usize)?);
        items -= 1;
    }
    Ok(out.to_vec())
}

/// 8 byte entries become 5 bytes: flags byte, key, command.
pub fn convert_accelerators(data: &[u8]) -> Result<Vec<u8>> {
    let mut p = Reader::new(data);
    let mut out = BytesMut::with_capacity(data.len());
    loop {
        let flags = p.word()? as u8;
        out.put_u8(flags);
        out.put_u16_le(p.word()?); // key
        out.put_u16_le(p.word()?); // command
        p.skip(2);
        if flags & ACCEL_LAST != 0 {
            break;
        }
    }
    Ok(out.to_vec())
}

/// 16-bit image of a 32-bit resource of type `type_id`. Types without a
/// conversion are copied as they are.
pub fn convert_resource(type_id: u16, data: &[u8]) -> Result<Vec<u8>> {
    let converted = match ResourceType::from_repr(type_id) {
        Some(ResourceType::Menu) => convert_menu(data)?,
        Some(ResourceType::Dialog) => convert_dialog(data)?,
        Some(ResourceType::Accelerator) => convert_accelerators(data)?,
        Some(ResourceType::String) => {
            warn!("string tables from 32-bit modules are passed through unconverted");
            data.to_vec()
        }
        _ => data.to_vec(),
    };
    trace!(
        "converted resource type {} from {} to {} bytes",
        type_id,
        data.len(),
        converted.len()
    );
    Ok(converted)
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    fn wide(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(|c| c.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_standard_menu() {
        let mut menu = hex!("0000 0000").to_vec();
        // popup "&File" containing "Open" (id 100) and the last item "Quit" (id 101)
        menu.extend_from_slice(&hex!("1000"));
        menu.extend(wide("&File"));
        menu.extend_from_slice(&hex!("0000 6400"));
        menu.extend(wide("Open"));
        menu.extend_from_slice(&hex!("8000 6500"));
        menu.extend(wide("Quit"));
        // closes the popup's parent level
        menu.extend_from_slice(&hex!("8000 6600"));
        menu.extend(wide("\u{263a}"));

        let out = convert_menu(&menu).unwrap();
        let mut want = hex!("0000 0000 1000").to_vec();
        want.extend_from_slice(b"&File\0");
        want.extend_from_slice(&hex!("0000 6400"));
        want.extend_from_slice(b"Open\0");
        want.extend_from_slice(&hex!("8000 6500"));
        want.extend_from_slice(b"Quit\0");
        want.extend_from_slice(&hex!("8000 6600"));
        want.extend_from_slice(b"?\0");
        assert_eq!(out, want);
    }

    #[test]
    fn test_extended_menu() {
        let mut menu = hex!("0100 0400 00000000").to_vec();
        menu.extend_from_slice(&hex!("00000000 00000000 07000000 8000"));
        menu.extend(wide("Hi"));
        // 14 + 6 bytes of item end on a dword boundary
        let out = convert_menu(&menu).unwrap();
        let mut want = hex!("0100 0400 00000000 00000000 00000000 0700 80").to_vec();
        want.extend_from_slice(b"Hi\0");
        assert_eq!(out, want);
    }

    #[test]
    fn test_dialog() {
        // style DS_SETFONT, no ex style, one item, at 1,2 size 30x40
        let mut dlg = hex!("40000000 00000000 0100 0100 0200 1e00 2800").to_vec();
        dlg.extend_from_slice(&hex!("0000")); // no menu
        dlg.extend_from_slice(&hex!("0000")); // default class
        dlg.extend(wide("Hello"));
        dlg.extend_from_slice(&hex!("0800"));
        dlg.extend(wide("Sys"));
        while dlg.len() % 4 != 0 {
            dlg.push(0);
        }
        // button: style, ex style, x y cx cy, id 1, class 0x80, text "OK", no data
        dlg.extend_from_slice(&hex!("00000150 00000000 0500 0600 0700 0800 0100"));
        dlg.extend_from_slice(&hex!("ffff 8000"));
        dlg.extend(wide("OK"));
        dlg.extend_from_slice(&hex!("0000"));

        let out = convert_dialog(&dlg).unwrap();
        let mut want = hex!("40000000 01 0100 0200 1e00 2800 00 00").to_vec();
        want.extend_from_slice(b"Hello\0");
        want.extend_from_slice(&hex!("0800"));
        want.extend_from_slice(b"Sys\0");
        want.extend_from_slice(&hex!("0500 0600 0700 0800 0100 00000150 80"));
        want.extend_from_slice(b"OK\0");
        want.push(0);
        assert_eq!(out, want);
    }

    #[test]
    fn test_accelerators() {
        let acc = hex!("0300 4100 e803 0000 8b00 7000 e903 0000");
        let out = convert_accelerators(&acc).unwrap();
        assert_eq!(out, hex!("03 4100 e803 8b 7000 e903").to_vec());
    }

    #[test]
    fn test_truncated() {
        assert!(convert_accelerators(&hex!("0300 4100")).is_err());
        assert!(convert_menu(&hex!("0000 0000 1000 4100")).is_err());
        assert_eq!(convert_resource(10, b"raw").unwrap(), b"raw".to_vec());
    }
}
