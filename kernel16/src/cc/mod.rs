//! 16-bit calling conventions as seen from a relay stub.
//!
//! On entry to a far procedure the stack holds the return `ip`, the return `cs`
//! and then the arguments. Pascal pushes left to right and the callee pops;
//! cdecl pushes right to left and the caller pops.

use strum::{Display, EnumString};

use crate::{
    errors::Result,
    registers::{Context16, StackRegister},
    stack::Stack,
};

/// Bytes taken by the far return address.
pub const RETURN_ADDRESS_SIZE: u16 = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ArgKind {
    Word,
    /// signed word, sign-extended when read
    #[strum(serialize = "s_word")]
    SWord,
    Long,
    /// far pointer
    #[strum(serialize = "ptr", serialize = "segptr", serialize = "str")]
    Ptr,
}

impl ArgKind {
    pub fn size(&self) -> u16 {
        match self {
            ArgKind::Word | ArgKind::SWord => 2,
            ArgKind::Long | ArgKind::Ptr => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReturnKind {
    Word,
    Long,
    Void,
}

pub trait CallingConvention {
    /// Offset from `sp` of argument `index`, return address included.
    fn param_offset(&self, args: &[ArgKind], index: usize) -> u16;

    /// Whether the callee removes its arguments on return.
    fn callee_pops(&self) -> bool;

    fn args_size(&self, args: &[ArgKind]) -> u16 {
        args.iter().map(ArgKind::size).sum()
    }

    fn get_raw_param(&self, frame: &impl Stack, args: &[ArgKind], index: usize) -> Result<u32> {
        let off = self.param_offset(args, index) as i32;
        Ok(match args[index] {
            ArgKind::Word => frame.stack_read(off)? as u32,
            ArgKind::SWord => frame.stack_read(off)? as i16 as i32 as u32,
            ArgKind::Long | ArgKind::Ptr => {
                let lo = frame.stack_read(off)? as u32;
                let hi = frame.stack_read(off + 2)? as u32;
                (hi << 16) | lo
            }
        })
    }

    fn get_params(&self, frame: &impl Stack, args: &[ArgKind]) -> Result<Vec<u32>> {
        (0..args.len())
            .map(|i| self.get_raw_param(frame, args, i))
            .collect()
    }

    fn set_return_value(&self, ctx: &mut Context16, kind: ReturnKind, value: u32) {
        match kind {
            ReturnKind::Word => ctx.set_ax(value as u16),
            ReturnKind::Long => {
                ctx.set_ax(value as u16);
                ctx.set_dx((value >> 16) as u16);
            }
            ReturnKind::Void => {}
        }
    }

    /// Pop the return address and, if the convention says so, the arguments.
    fn unwind(&self, frame: &mut impl Stack, args: &[ArgKind]) -> Result<(u16, u16)> {
        let ip = frame.stack_pop()?;
        let cs = frame.stack_pop()?;
        if self.callee_pops() {
            for _ in 0..self.args_size(args) / 2 {
                frame.stack_pop()?;
            }
        }
        Ok((cs, ip))
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Pascal16;

#[derive(Copy, Clone, Debug, Default)]
pub struct Cdecl16;

impl CallingConvention for Pascal16 {
    fn param_offset(&self, args: &[ArgKind], index: usize) -> u16 {
        // the last argument is nearest to the return address
        RETURN_ADDRESS_SIZE + args[index + 1..].iter().map(ArgKind::size).sum::<u16>()
    }

    fn callee_pops(&self) -> bool {
        true
    }
}

impl CallingConvention for Cdecl16 {
    fn param_offset(&self, args: &[ArgKind], index: usize) -> u16 {
        RETURN_ADDRESS_SIZE + args[..index].iter().map(ArgKind::size).sum::<u16>()
    }

    fn callee_pops(&self) -> bool {
        false
    }
}

/// Stack bytes to drop after a register-convention call returns.
pub fn register_unwind(ctx: &mut Context16, args_size: u16) {
    ctx.incr_sp(args_size as i32);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::MemoryConfig, global::{GlobalFlags, GlobalHeap}, stack::Frame16};
    use std::str::FromStr;

    fn frame_with(words: &[u16]) -> (GlobalHeap, Context16) {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let ss = heap.alloc(GlobalFlags::FIXED, 0x100, 1);
        let mut ctx = Context16 {
            ss,
            esp: 0x100,
            ..Default::default()
        };
        {
            let mut frame = Frame16::new(&mut heap, &mut ctx);
            for w in words.iter().rev() {
                frame.stack_push(*w).unwrap();
            }
        }
        (heap, ctx)
    }

    #[test]
    fn test_pascal_layout() {
        // f(word a, long b, word c) with a=1, b=0x00050004, c=3; pushed a, b, c
        // stack from top: ip, cs, c, b.lo, b.hi, a
        let (mut heap, mut ctx) = frame_with(&[0x10, 0x20, 3, 4, 5, 1]);
        let args = [ArgKind::Word, ArgKind::Long, ArgKind::Word];
        let mut frame = Frame16::new(&mut heap, &mut ctx);
        assert_eq!(
            Pascal16.get_params(&frame, &args).unwrap(),
            vec![1, 0x0005_0004, 3]
        );
        assert_eq!(Pascal16.unwind(&mut frame, &args).unwrap(), (0x20, 0x10));
        assert_eq!(frame.ctx.sp(), 0x100);
    }

    #[test]
    fn test_cdecl_layout() {
        let (mut heap, mut ctx) = frame_with(&[0x10, 0x20, 0xffff, 7, 8]);
        let args = [ArgKind::SWord, ArgKind::Ptr];
        let mut frame = Frame16::new(&mut heap, &mut ctx);
        assert_eq!(
            Cdecl16.get_params(&frame, &args).unwrap(),
            vec![0xffff_ffff, 0x0008_0007]
        );
        Cdecl16.unwind(&mut frame, &args).unwrap();
        assert_eq!(frame.ctx.sp(), 0x100 - 6);
        assert_eq!(ArgKind::from_str("segptr").unwrap(), ArgKind::Ptr);
        assert_eq!(ReturnKind::from_str("long").unwrap(), ReturnKind::Long);
    }
}
