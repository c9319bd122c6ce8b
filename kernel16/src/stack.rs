use crate::{
    errors::Result,
    global::GlobalHeap,
    registers::{Context16, StackRegister},
    utils::{align, make_segptr, SegPtr},
};

/// Stack operations
pub trait Stack {
    /// Push a word onto the stack.
    /// return the far address of the new top of stack
    fn stack_push(&mut self, value: u16) -> Result<SegPtr>;

    /// Pop a word from stack.
    /// Returns: the value at the top.
    fn stack_pop(&mut self) -> Result<u16>;

    /// Peek the stack at a byte offset from its top, without moving `sp`.
    /// Offset 0 is the word at the top of the stack.
    fn stack_read(&self, offset: i32) -> Result<u16>;
    fn stack_write(&mut self, offset: i32, value: u16) -> Result<()>;

    /// alignment default to word size.
    fn aligned_push_bytes(&mut self, s: impl AsRef<[u8]>, alignment: Option<u16>) -> Result<SegPtr>;

    fn aligned_push_str(&mut self, s: &str) -> Result<SegPtr> {
        let mut b = s.as_bytes().to_vec();
        // add a 0x00 separator.
        b.push(0);
        self.aligned_push_bytes(&b, None)
    }

    /// Push a far pointer, selector first.
    fn stack_push_long(&mut self, value: u32) -> Result<SegPtr> {
        self.stack_push((value >> 16) as u16)?;
        self.stack_push(value as u16)
    }
}

/// A register context paired with the memory its `ss` points into.
pub struct Frame16<'a> {
    pub heap: &'a mut GlobalHeap,
    pub ctx: &'a mut Context16,
}

impl<'a> Frame16<'a> {
    pub fn new(heap: &'a mut GlobalHeap, ctx: &'a mut Context16) -> Self {
        Self { heap, ctx }
    }

    fn at(&self, offset: i32) -> SegPtr {
        make_segptr(self.ctx.ss, (self.ctx.sp() as i32).wrapping_add(offset) as u16)
    }
}

impl Stack for Frame16<'_> {
    fn stack_push(&mut self, value: u16) -> Result<SegPtr> {
        let new_sp = self.ctx.incr_sp(-2);
        let top = make_segptr(self.ctx.ss, new_sp);
        self.heap.write_word(top, value)?;
        Ok(top)
    }

    fn stack_pop(&mut self) -> Result<u16> {
        let v = self.heap.read_word(self.ctx.stack_ptr())?;
        self.ctx.incr_sp(2);
        Ok(v)
    }

    fn stack_read(&self, offset: i32) -> Result<u16> {
        self.heap.read_word(self.at(offset))
    }

    fn stack_write(&mut self, offset: i32, value: u16) -> Result<()> {
        let addr = self.at(offset);
        self.heap.write_word(addr, value)
    }

    fn aligned_push_bytes(&mut self, s: impl AsRef<[u8]>, alignment: Option<u16>) -> Result<SegPtr> {
        let alignment = alignment.unwrap_or(2);
        let data = s.as_ref();
        let top = align(self.ctx.sp().wrapping_sub(data.len() as u16), alignment);
        self.heap.write(make_segptr(self.ctx.ss, top), data)?;
        self.ctx.set_sp(top);
        Ok(make_segptr(self.ctx.ss, top))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::MemoryConfig, global::GlobalFlags, utils::selector_of};

    #[test]
    fn test_push_pop() {
        let mut heap = GlobalHeap::new(&MemoryConfig::default());
        let ss = heap.alloc(GlobalFlags::FIXED, 0x100, 1);
        let mut ctx = Context16 {
            ss,
            esp: 0x100,
            ..Default::default()
        };
        let mut frame = Frame16::new(&mut heap, &mut ctx);
        frame.stack_push(0x1234).unwrap();
        frame.stack_push_long(0xaaaa_5555).unwrap();
        assert_eq!(frame.stack_read(0).unwrap(), 0x5555);
        assert_eq!(frame.stack_read(2).unwrap(), 0xaaaa);
        frame.stack_write(4, 0x4321).unwrap();
        assert_eq!(frame.stack_pop().unwrap(), 0x5555);
        assert_eq!(frame.stack_pop().unwrap(), 0xaaaa);
        assert_eq!(frame.stack_pop().unwrap(), 0x4321);

        let s = frame.aligned_push_str("abc").unwrap();
        assert_eq!(selector_of(s), ss);
        assert_eq!(frame.ctx.sp(), 0xfc);
        assert_eq!(frame.heap.read(s, 4).unwrap(), b"abc\0");
    }
}
