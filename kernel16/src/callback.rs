//! Calls from the host into 16-bit code.
//!
//! The argument words are copied onto the 16-bit stack, followed by a far
//! return address pointing at stub 0 of the relay segment. The CPU then runs
//! until that stub traps; traps on other relay stubs are kernel entry points
//! and are dispatched on the way.

use log::{debug, trace};

use crate::{
    cpu::{Exit16, Fault16},
    errors::Result,
    kernel::{exports::RETURN_STUB, Kernel},
    registers::{Context16, StackRegister},
    stack::{Frame16, Stack},
    utils::{make_segptr, offset_of, selector_of, SegPtr},
};

impl Kernel {
    /// Far call `target` with `args`, given in stack order (the word at the
    /// lowest address first). Returns `dx:ax`.
    pub fn call_to_16(&self, target: SegPtr, args: &[u16]) -> Result<u32> {
        let ctx = Context16 {
            cs: selector_of(target),
            eip: offset_of(target) as u32,
            ..Default::default()
        };
        Ok(self.call_to_16_regs(ctx, args)?.dx_ax())
    }

    /// Run from `ctx.cs:ip` with the given registers until the code returns
    /// to us. A zero `ss` means the current 16-bit stack.
    pub fn call_to_16_regs(&self, mut ctx: Context16, args: &[u16]) -> Result<Context16> {
        let _win16 = self.win16().lock();
        {
            let mut st = self.state();
            if ctx.ss == 0 {
                let (ss, sp) = st.call_stack(self.config())?;
                ctx.ss = ss;
                ctx.set_sp(sp);
            }
            let relay = st.relay_sel;
            let mut frame = Frame16::new(&mut st.heap, &mut ctx);
            for word in args.iter().rev() {
                frame.stack_push(*word)?;
            }
            frame.stack_push(relay)?;
            frame.stack_push(RETURN_STUB)?;
        }
        debug!(
            "call to 16-bit {:04x}:{:04x} ss:sp={:04x}:{:04x} ds={:04x} args={:04x?}",
            ctx.cs,
            ctx.ip(),
            ctx.ss,
            ctx.sp(),
            ctx.ds,
            args
        );

        let mut cpu = self.new_cpu();
        loop {
            let exit = {
                let mut st = self.state();
                cpu.run(&mut st.heap, &mut ctx)
            };
            match exit {
                Exit16::Fault(fault) => {
                    debug!("16-bit fault: {}", fault);
                    return Err(fault.into());
                }
                Exit16::Trap => {
                    let ordinal = self.trapped_stub(&ctx)?;
                    if ordinal == RETURN_STUB {
                        trace!("back from 16-bit, ax={:04x} dx={:04x}", ctx.ax(), ctx.dx());
                        return Ok(ctx);
                    }
                    self.relay_call(ordinal, &mut ctx)?;
                }
            }
        }
    }

    /// Number of the relay stub `ctx` trapped on.
    fn trapped_stub(&self, ctx: &Context16) -> Result<u16> {
        let st = self.state();
        let invalid = Fault16::InvalidOpcode {
            cs: ctx.cs,
            ip: ctx.ip(),
        };
        if ctx.cs != st.relay_sel {
            return Err(invalid.into());
        }
        st.heap
            .read_word(make_segptr(ctx.cs, ctx.ip().wrapping_add(2)))
            .map_err(|_| invalid.into())
    }
}
