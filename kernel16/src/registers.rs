use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::utils::{make_segptr, offset_of, selector_of, SegPtr};

/// Register file of a 16-bit thread of execution.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Context16 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
}

pub const FLAG_CARRY: u32 = 0x0001;
pub const FLAG_ZERO: u32 = 0x0040;

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString, Display, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Reg16 {
    Ax,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Bp,
    Sp,
    Ip,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Flags,
}

pub trait Registers {
    fn read(&self, reg: Reg16) -> u32;
    fn write(&mut self, reg: Reg16, value: u32);
    fn pc(&self) -> SegPtr;
    fn set_pc(&mut self, value: SegPtr);
    fn save_registers(&self) -> BTreeMap<Reg16, u32>;
}

pub trait StackRegister {
    fn sp(&self) -> u16;
    fn set_sp(&mut self, value: u16);

    /// increment stack pointer by `delta`, wrapping inside the segment.
    /// Return new stack pointer
    fn incr_sp(&mut self, delta: i32) -> u16 {
        let new_sp = (self.sp() as i32).wrapping_add(delta) as u16;
        self.set_sp(new_sp);
        new_sp
    }
}

impl Registers for Context16 {
    fn read(&self, reg: Reg16) -> u32 {
        match reg {
            Reg16::Ax => self.eax,
            Reg16::Bx => self.ebx,
            Reg16::Cx => self.ecx,
            Reg16::Dx => self.edx,
            Reg16::Si => self.esi,
            Reg16::Di => self.edi,
            Reg16::Bp => self.ebp,
            Reg16::Sp => self.esp,
            Reg16::Ip => self.eip,
            Reg16::Cs => self.cs as u32,
            Reg16::Ds => self.ds as u32,
            Reg16::Es => self.es as u32,
            Reg16::Fs => self.fs as u32,
            Reg16::Gs => self.gs as u32,
            Reg16::Ss => self.ss as u32,
            Reg16::Flags => self.eflags,
        }
    }

    fn write(&mut self, reg: Reg16, value: u32) {
        match reg {
            Reg16::Ax => self.eax = value,
            Reg16::Bx => self.ebx = value,
            Reg16::Cx => self.ecx = value,
            Reg16::Dx => self.edx = value,
            Reg16::Si => self.esi = value,
            Reg16::Di => self.edi = value,
            Reg16::Bp => self.ebp = value,
            Reg16::Sp => self.esp = value,
            Reg16::Ip => self.eip = value,
            Reg16::Cs => self.cs = value as u16,
            Reg16::Ds => self.ds = value as u16,
            Reg16::Es => self.es = value as u16,
            Reg16::Fs => self.fs = value as u16,
            Reg16::Gs => self.gs = value as u16,
            Reg16::Ss => self.ss = value as u16,
            Reg16::Flags => self.eflags = value,
        }
    }

    fn pc(&self) -> SegPtr {
        make_segptr(self.cs, self.eip as u16)
    }

    fn set_pc(&mut self, value: SegPtr) {
        self.cs = selector_of(value);
        self.eip = offset_of(value) as u32;
    }

    fn save_registers(&self) -> BTreeMap<Reg16, u32> {
        let mut reg_values = BTreeMap::default();
        for reg in Reg16::iter() {
            let reg_v = Registers::read(self, reg);
            if reg_v != 0 {
                reg_values.insert(reg, reg_v);
            }
        }
        reg_values
    }
}

impl StackRegister for Context16 {
    fn sp(&self) -> u16 {
        self.esp as u16
    }

    fn set_sp(&mut self, value: u16) {
        self.esp = (self.esp & 0xffff_0000) | value as u32;
    }
}

impl Context16 {
    pub fn ax(&self) -> u16 {
        self.eax as u16
    }

    pub fn set_ax(&mut self, v: u16) {
        self.eax = (self.eax & 0xffff_0000) | v as u32;
    }

    pub fn dx(&self) -> u16 {
        self.edx as u16
    }

    pub fn set_dx(&mut self, v: u16) {
        self.edx = (self.edx & 0xffff_0000) | v as u32;
    }

    /// `dx:ax` as one value.
    pub fn dx_ax(&self) -> u32 {
        ((self.dx() as u32) << 16) | self.ax() as u32
    }

    pub fn ip(&self) -> u16 {
        self.eip as u16
    }

    pub fn stack_ptr(&self) -> SegPtr {
        make_segptr(self.ss, self.sp())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_register_access() {
        let mut ctx = Context16::default();
        ctx.write(Reg16::from_str("ds").unwrap(), 0x1237);
        ctx.set_pc(make_segptr(0x8f, 0x10));
        ctx.set_sp(0xfffe);
        assert_eq!(ctx.ds, 0x1237);
        assert_eq!(ctx.read(Reg16::Cs), 0x8f);
        assert_eq!(ctx.pc(), 0x008f_0010);
        assert_eq!(ctx.incr_sp(4), 0x0002);

        let saved = ctx.save_registers();
        assert_eq!(saved.get(&Reg16::Ip), Some(&0x10));
        assert!(!saved.contains_key(&Reg16::Ax));
        assert_eq!(Reg16::Flags.to_string(), "flags");
    }

    #[test]
    fn test_long_return() {
        let mut ctx = Context16::default();
        ctx.set_ax(0x5678);
        ctx.set_dx(0x1234);
        assert_eq!(ctx.dx_ax(), 0x1234_5678);
    }
}
