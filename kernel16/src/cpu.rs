//! The boundary to whatever executes 16-bit instructions.
//!
//! The kernel never interprets application code itself; it hands a register context
//! to a [`Cpu16`] and gets control back when the code traps into the relay segment or
//! faults. [`MicroCpu`] is a small interpreter for the instruction subset the kernel
//! emits (relay stubs, thunks, patched prologs) and that simple test programs use.

use log::trace;
use thiserror::Error;

use crate::{
    errors::KernelError,
    global::GlobalHeap,
    registers::{Context16, StackRegister},
    utils::{make_segptr, SegPtr},
};

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault16 {
    #[error("general protection fault at {cs:04x}:{ip:04x}")]
    GeneralProtection { cs: u16, ip: u16 },
    #[error("invalid opcode at {cs:04x}:{ip:04x}")]
    InvalidOpcode { cs: u16, ip: u16 },
    #[error("segment {0:#06x} not present")]
    NotPresent(u16),
    #[error("stack fault")]
    Stack,
    #[error("divide by zero at {cs:04x}:{ip:04x}")]
    DivideByZero { cs: u16, ip: u16 },
    #[error("instruction limit exceeded")]
    Timeout,
}

/// Why a [`Cpu16`] handed control back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exit16 {
    /// `ud2` executed; `cs:ip` still points at the instruction.
    Trap,
    Fault(Fault16),
}

pub trait Cpu16: Send {
    /// Run from `ctx.cs:ctx.ip` until a trap or a fault.
    fn run(&mut self, mem: &mut GlobalHeap, ctx: &mut Context16) -> Exit16;
}

/// The trap instruction used by relay stubs.
pub const TRAP_OPCODE: [u8; 2] = [0x0f, 0x0b];

const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

pub struct MicroCpu {
    step_limit: u64,
    steps: u64,
}

impl Default for MicroCpu {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_LIMIT)
    }
}

fn fetch_fault(e: KernelError, cs: u16, ip: u16) -> Fault16 {
    match e {
        KernelError::InvalidSelector(sel) => Fault16::NotPresent(sel),
        _ => Fault16::GeneralProtection { cs, ip },
    }
}

impl MicroCpu {
    pub fn new(step_limit: u64) -> Self {
        Self {
            step_limit,
            steps: 0,
        }
    }

    /// Instructions executed over the lifetime of this cpu.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn fetch_u8(mem: &GlobalHeap, ctx: &mut Context16) -> Result<u8, Fault16> {
        let ip = ctx.ip();
        let b = mem
            .read(make_segptr(ctx.cs, ip), 1)
            .map_err(|e| fetch_fault(e, ctx.cs, ip))?;
        ctx.eip = ip.wrapping_add(1) as u32;
        Ok(b[0])
    }

    fn fetch_u16(mem: &GlobalHeap, ctx: &mut Context16) -> Result<u16, Fault16> {
        let lo = Self::fetch_u8(mem, ctx)?;
        let hi = Self::fetch_u8(mem, ctx)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn push(mem: &mut GlobalHeap, ctx: &mut Context16, value: u16) -> Result<(), Fault16> {
        let sp = ctx.incr_sp(-2);
        mem.write_word(make_segptr(ctx.ss, sp), value)
            .map_err(|_| Fault16::Stack)
    }

    fn pop(mem: &GlobalHeap, ctx: &mut Context16) -> Result<u16, Fault16> {
        let v = mem
            .read_word(make_segptr(ctx.ss, ctx.sp()))
            .map_err(|_| Fault16::Stack)?;
        ctx.incr_sp(2);
        Ok(v)
    }

    fn bp_word(mem: &GlobalHeap, ctx: &mut Context16) -> Result<u16, Fault16> {
        let disp = Self::fetch_u8(mem, ctx)? as i8 as i16;
        let addr = (ctx.ebp as u16).wrapping_add(disp as u16);
        mem.read_word(make_segptr(ctx.ss, addr))
            .map_err(|_| Fault16::Stack)
    }

    fn load_segment(mem: &GlobalHeap, sel: u16, cs: u16, ip: u16) -> Result<u16, Fault16> {
        if sel != 0 && !mem.ldt().is_allocated(sel) {
            return Err(Fault16::GeneralProtection { cs, ip });
        }
        Ok(sel)
    }

    fn far_target(mem: &GlobalHeap, ctx: &mut Context16) -> Result<SegPtr, Fault16> {
        let off = Self::fetch_u16(mem, ctx)?;
        let sel = Self::fetch_u16(mem, ctx)?;
        Ok(make_segptr(sel, off))
    }

    fn step(&mut self, mem: &mut GlobalHeap, ctx: &mut Context16) -> Result<Option<Exit16>, Fault16> {
        let (cs, ip) = (ctx.cs, ctx.ip());
        let op = Self::fetch_u8(mem, ctx)?;
        match op {
            0x0f => {
                if Self::fetch_u8(mem, ctx)? == 0x0b {
                    ctx.eip = ip as u32;
                    return Ok(Some(Exit16::Trap));
                }
                return Err(Fault16::InvalidOpcode { cs, ip });
            }
            0x90 => {}
            0xb8 => {
                let v = Self::fetch_u16(mem, ctx)?;
                ctx.set_ax(v);
            }
            0xb9 => ctx.ecx = Self::fetch_u16(mem, ctx)? as u32,
            0xba => {
                let v = Self::fetch_u16(mem, ctx)?;
                ctx.set_dx(v);
            }
            0xbb => ctx.ebx = Self::fetch_u16(mem, ctx)? as u32,
            0x31 => match Self::fetch_u8(mem, ctx)? {
                // xor ax, ax
                0xc0 => ctx.set_ax(0),
                _ => return Err(Fault16::InvalidOpcode { cs, ip }),
            },
            0x40 => ctx.set_ax(ctx.ax().wrapping_add(1)),
            0x45 => ctx.ebp = (ctx.ebp as u16).wrapping_add(1) as u32,
            0x4d => ctx.ebp = (ctx.ebp as u16).wrapping_sub(1) as u32,
            0x8c => match Self::fetch_u8(mem, ctx)? {
                0xd8 => ctx.set_ax(ctx.ds),
                0xc0 => ctx.set_ax(ctx.es),
                _ => return Err(Fault16::InvalidOpcode { cs, ip }),
            },
            0x8e => match Self::fetch_u8(mem, ctx)? {
                0xd8 => ctx.ds = Self::load_segment(mem, ctx.ax(), cs, ip)?,
                0xc0 => ctx.es = Self::load_segment(mem, ctx.ax(), cs, ip)?,
                _ => return Err(Fault16::InvalidOpcode { cs, ip }),
            },
            0x89 => match Self::fetch_u8(mem, ctx)? {
                0xe5 => ctx.ebp = ctx.sp() as u32,
                0xec => ctx.set_sp(ctx.ebp as u16),
                _ => return Err(Fault16::InvalidOpcode { cs, ip }),
            },
            0x8b => match Self::fetch_u8(mem, ctx)? {
                0x46 => {
                    let v = Self::bp_word(mem, ctx)?;
                    ctx.set_ax(v);
                }
                _ => return Err(Fault16::InvalidOpcode { cs, ip }),
            },
            0xff => match Self::fetch_u8(mem, ctx)? {
                0x76 => {
                    let v = Self::bp_word(mem, ctx)?;
                    Self::push(mem, ctx, v)?;
                }
                _ => return Err(Fault16::InvalidOpcode { cs, ip }),
            },
            0x1e => Self::push(mem, ctx, ctx.ds)?,
            0x06 => Self::push(mem, ctx, ctx.es)?,
            0x1f => {
                let v = Self::pop(mem, ctx)?;
                ctx.ds = Self::load_segment(mem, v, cs, ip)?;
            }
            0x07 => {
                let v = Self::pop(mem, ctx)?;
                ctx.es = Self::load_segment(mem, v, cs, ip)?;
            }
            0x50 => Self::push(mem, ctx, ctx.ax())?,
            0x51 => Self::push(mem, ctx, ctx.ecx as u16)?,
            0x52 => Self::push(mem, ctx, ctx.dx())?,
            0x53 => Self::push(mem, ctx, ctx.ebx as u16)?,
            0x55 => Self::push(mem, ctx, ctx.ebp as u16)?,
            0x58 => {
                let v = Self::pop(mem, ctx)?;
                ctx.set_ax(v);
            }
            0x59 => ctx.ecx = Self::pop(mem, ctx)? as u32,
            0x5a => {
                let v = Self::pop(mem, ctx)?;
                ctx.set_dx(v);
            }
            0x5b => ctx.ebx = Self::pop(mem, ctx)? as u32,
            0x5d => ctx.ebp = Self::pop(mem, ctx)? as u32,
            0x6a => {
                let v = Self::fetch_u8(mem, ctx)? as i8 as i16 as u16;
                Self::push(mem, ctx, v)?;
            }
            0x68 => {
                let v = Self::fetch_u16(mem, ctx)?;
                Self::push(mem, ctx, v)?;
            }
            0x9a => {
                let target = Self::far_target(mem, ctx)?;
                Self::push(mem, ctx, ctx.cs)?;
                Self::push(mem, ctx, ctx.ip())?;
                ctx.cs = (target >> 16) as u16;
                ctx.eip = target & 0xffff;
            }
            0xea => {
                let target = Self::far_target(mem, ctx)?;
                ctx.cs = (target >> 16) as u16;
                ctx.eip = target & 0xffff;
            }
            0xcb | 0xca => {
                let extra = if op == 0xca {
                    Self::fetch_u16(mem, ctx)?
                } else {
                    0
                };
                let ret_ip = Self::pop(mem, ctx)?;
                let ret_cs = Self::pop(mem, ctx)?;
                ctx.incr_sp(extra as i32);
                ctx.cs = ret_cs;
                ctx.eip = ret_ip as u32;
            }
            // hlt is privileged
            0xf4 => return Err(Fault16::GeneralProtection { cs, ip }),
            _ => return Err(Fault16::InvalidOpcode { cs, ip }),
        }
        Ok(None)
    }
}

impl Cpu16 for MicroCpu {
    fn run(&mut self, mem: &mut GlobalHeap, ctx: &mut Context16) -> Exit16 {
        let mut budget = self.step_limit;
        loop {
            if budget == 0 {
                return Exit16::Fault(Fault16::Timeout);
            }
            budget -= 1;
            self.steps += 1;
            let at = (ctx.cs, ctx.ip());
            match self.step(mem, ctx) {
                Ok(None) => {}
                Ok(Some(exit)) => return exit,
                Err(fault) => {
                    // faults restart at the faulting instruction
                    ctx.cs = at.0;
                    ctx.eip = at.1 as u32;
                    trace!("fault {} at {:04x}:{:04x}", fault, at.0, at.1);
                    return Exit16::Fault(fault);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::MemoryConfig, global::GlobalFlags, ldt::SegmentAccess};
    use hex_literal::hex;

    fn setup(code: &[u8]) -> (GlobalHeap, Context16) {
        let mut mem = GlobalHeap::new(&MemoryConfig::default());
        let cs = mem.alloc_segment(GlobalFlags::FIXED, 0x100, 1, SegmentAccess::CODE);
        let ss = mem.alloc(GlobalFlags::FIXED, 0x200, 1);
        mem.write(make_segptr(cs, 0), code).unwrap();
        let ctx = Context16 {
            cs,
            ss,
            ds: ss,
            esp: 0x200,
            ..Default::default()
        };
        (mem, ctx)
    }

    #[test]
    fn test_runs_until_trap() {
        // mov ax, 1234h; push ax; pop dx; mov ax, ds; ud2
        let (mut mem, mut ctx) = setup(&hex!("b8 34 12 50 5a 8c d8 0f 0b"));
        let exit = MicroCpu::default().run(&mut mem, &mut ctx);
        assert_eq!(exit, Exit16::Trap);
        assert_eq!(ctx.ip(), 7);
        assert_eq!(ctx.dx(), 0x1234);
        assert_eq!(ctx.ax(), ctx.ds);
        assert_eq!(ctx.sp(), 0x200);
    }

    #[test]
    fn test_far_call_and_return() {
        let (mut mem, mut ctx) = setup(&[]);
        let cs = ctx.cs;
        // 0: call far cs:0x10; ud2      0x10: mov ax, 7; retf 2
        mem.write(make_segptr(cs, 0), hex!("6a 05 9a 10 00")).unwrap();
        mem.write(make_segptr(cs, 5), cs.to_le_bytes()).unwrap();
        mem.write(make_segptr(cs, 7), hex!("0f 0b")).unwrap();
        mem.write(make_segptr(cs, 0x10), hex!("b8 07 00 ca 02 00")).unwrap();
        let exit = MicroCpu::default().run(&mut mem, &mut ctx);
        assert_eq!(exit, Exit16::Trap);
        assert_eq!(ctx.ip(), 7);
        assert_eq!(ctx.ax(), 7);
        assert_eq!(ctx.sp(), 0x200);
    }

    #[test]
    fn test_faults() {
        let (mut mem, mut ctx) = setup(&hex!("b8 ff ff 8e d8"));
        let exit = MicroCpu::default().run(&mut mem, &mut ctx);
        assert_eq!(
            exit,
            Exit16::Fault(Fault16::GeneralProtection { cs: ctx.cs, ip: 3 })
        );
        assert_eq!(ctx.ip(), 3);

        let (mut mem, mut ctx) = setup(&hex!("eb fe"));
        assert!(matches!(
            MicroCpu::default().run(&mut mem, &mut ctx),
            Exit16::Fault(Fault16::InvalidOpcode { .. })
        ));

        // jmp far to itself
        let (mut mem, mut ctx) = setup(&[]);
        let mut code = hex!("ea 00 00 00 00").to_vec();
        code[3..5].copy_from_slice(&ctx.cs.to_le_bytes());
        mem.write(make_segptr(ctx.cs, 0), code).unwrap();
        assert_eq!(
            MicroCpu::new(100).run(&mut mem, &mut ctx),
            Exit16::Fault(Fault16::Timeout)
        );
    }
}
