//! The interpretation loop and the integer executor.
//!
//! `Interpreter::run` fetches, decodes and executes one instruction at a
//! time, owning all architectural state exclusively. It yields in exactly
//! three ways: the `hlt` opcode retires, the shared [`Control`] word requests
//! an end, or an unrecoverable [`Fault`] occurs. The `syscall` opcode hands
//! the whole machine to the host's [`Hooks`] implementation and resumes when
//! it returns.
//!
//! The x87 and SSE executors live in their own modules; everything integer
//! is here.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::cpu::decode::{Decoder, DecoderError};
use crate::cpu::flags::{self, Flags};
use crate::cpu::instr::*;
use crate::cpu::state::State;
use crate::cpu::Control;
use crate::memory::{MemImage, MemoryError};

/// Host collaborator hooks.
///
/// The core calls out through this trait; everything else about the
/// environment (loading, file descriptors, syscall semantics) stays on the
/// host's side of the line.
pub trait Hooks {
    /// Invoked when a `syscall` instruction retires. The hook may freely
    /// read and modify registers and memory through `cpu` and must return
    /// for execution to continue; requesting loop exit is done via
    /// `cpu.control.end_emulation()`.
    fn syscall(&mut self, cpu: Cpu<'_>) -> Result<(), FaultKind>;

    /// Best-guess symbol for an address, used only for trace output.
    /// Must be free of side effects.
    fn symbol_lookup(&self, _addr: u64) -> Option<(String, u64)> {
        None
    }
}

/// A no-op host: `syscall` is a fatal fault. Useful for pure-computation
/// tests and as the default for images that never leave user code.
#[derive(Debug)]
pub struct NullHooks;

impl Hooks for NullHooks {
    fn syscall(&mut self, _cpu: Cpu<'_>) -> Result<(), FaultKind> {
        Err(FaultKind::Unsupported("syscall without a dispatcher".into()))
    }
}

/// The mutable view of the machine a [`Hooks`] implementation receives.
pub struct Cpu<'a> {
    pub state: &'a mut State,
    pub mem: &'a mut MemImage,
    pub control: &'a Control,
}

/// Why `step` finished.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Flow {
    Continue,
    /// The halt opcode retired; `run` returns.
    Halt,
}

/// An unrecoverable error, carrying the address of the faulting instruction.
///
/// The interpreter never resumes after returning one of these.
#[derive(Debug)]
pub struct Fault {
    pub rip: u64,
    pub kind: FaultKind,
}

#[derive(Debug)]
pub enum FaultKind {
    /// An opcode, prefix combination or ModR/M sub-field outside the
    /// supported set.
    Decode(DecoderError),
    /// A data or instruction fetch outside the memory image.
    Memory(MemoryError),
    /// `div`/`idiv` by zero, or a quotient that does not fit.
    DivideError,
    /// A supported opcode with unsupported inputs (e.g. a CPUID leaf
    /// outside the compatibility surface).
    Unsupported(String),
    /// Debug-build stack discipline check: `rsp` left the committed range.
    StackRange { rsp: u64 },
}

impl From<MemoryError> for FaultKind {
    #[cold]
    fn from(e: MemoryError) -> Self {
        FaultKind::Memory(e)
    }
}

impl From<DecoderError> for FaultKind {
    #[cold]
    fn from(e: DecoderError) -> Self {
        match e {
            DecoderError::Memory(m) => FaultKind::Memory(m),
            other => FaultKind::Decode(other),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            FaultKind::Decode(DecoderError::Undefined(why)) => {
                write!(f, "decode failure at {:#018x}: {}", self.rip, why)
            }
            FaultKind::Decode(DecoderError::Memory(e)) | FaultKind::Memory(e) => {
                write!(f, "at {:#018x}: {}", self.rip, e)
            }
            FaultKind::DivideError => write!(f, "divide error at {:#018x}", self.rip),
            FaultKind::Unsupported(why) => write!(f, "at {:#018x}: {}", self.rip, why),
            FaultKind::StackRange { rsp } => {
                write!(f, "rsp {:#018x} outside the committed stack at {:#018x}", rsp, self.rip)
            }
        }
    }
}

impl Error for Fault {}

/// AMD64 user-mode interpreter.
pub struct Interpreter<H: Hooks> {
    state: State,
    mem: MemImage,
    hooks: H,
    control: Arc<Control>,
    instructions: u64,
}

impl<H: Hooks> Interpreter<H> {
    /// Creates a core over a loader-built memory image.
    ///
    /// `rsp` starts at the image's `stack_top`, `rip` at `entry_rip`; the
    /// loader tweaks `fs`/`gs` and initial registers through `state_mut`.
    pub fn new(mem: MemImage, entry_rip: u64, hooks: H) -> Self {
        let state = State::new(entry_rip, mem.stack_top());
        Self {
            state,
            mem,
            hooks,
            control: Arc::new(Control::new()),
            instructions: 0,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn mem(&self) -> &MemImage {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut MemImage {
        &mut self.mem
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// The shared run-control word; clone it to toggle tracing or stop the
    /// loop from another thread.
    pub fn control(&self) -> Arc<Control> {
        Arc::clone(&self.control)
    }

    /// Convenience for [`Control::trace_instructions`].
    pub fn trace_instructions(&self, trace: bool) -> bool {
        self.control.trace_instructions(trace)
    }

    /// Convenience for [`Control::end_emulation`].
    pub fn end_emulation(&self) {
        self.control.end_emulation()
    }

    /// Instructions retired so far.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Runs until the halt opcode, an end-emulation request, or a fault.
    /// Returns the number of instructions executed.
    pub fn run(&mut self) -> Result<u64, Fault> {
        loop {
            if self.control.end_requested() {
                return Ok(self.instructions);
            }
            match self.step()? {
                Flow::Continue => {}
                Flow::Halt => return Ok(self.instructions),
            }
        }
    }

    /// Decodes and executes a single instruction.
    pub fn step(&mut self) -> Result<Flow, Fault> {
        let rip = self.state.rip();
        let fault = |kind| Fault { rip, kind };

        let instr = {
            let mut decoder = Decoder::new(&self.mem, rip);
            let instr = decoder.decode_next().map_err(|e| fault(e.into()))?;
            self.state.set_rip(decoder.current_address());
            instr
        };

        if self.control.is_tracing() {
            self.trace(rip, &instr);
        }

        let flow = self.exec(&instr).map_err(fault)?;
        self.instructions += 1;

        #[cfg(debug_assertions)]
        self.check_stack(rip)?;

        Ok(flow)
    }

    /// Debug-build sanity check on the stack pointer. Fatal like every
    /// other fault; release builds rely on the plain bounds checks.
    #[cfg(debug_assertions)]
    fn check_stack(&self, rip: u64) -> Result<(), Fault> {
        // Red-zone style slack above the loader's stack top.
        const SLACK: u64 = 256;
        let rsp = self.state.gp64(reg::RSP);
        if rsp < self.mem.stack_floor() || rsp > self.mem.stack_top().saturating_add(SLACK) {
            return Err(Fault {
                rip,
                kind: FaultKind::StackRange { rsp },
            });
        }
        Ok(())
    }

    /// Emits one trace line for the instruction about to execute. Reads
    /// state only; never writes it.
    fn trace(&self, rip: u64, instr: &Instr) {
        let mut line = instr.to_string();
        if let Instr::Call {
            target: Operand::Imm(imm),
        } = instr
        {
            if let Some((name, offset)) = self.hooks.symbol_lookup(imm.zero_extended()) {
                line = format!("{}  ; {}+{:#x}", line, name, offset);
            }
        }
        trace!(
            "{:#018x}  {}  rax={:#x} rsp={:#x}  {}",
            rip,
            line,
            self.state.gp64(reg::RAX),
            self.state.gp64(reg::RSP),
            self.state.flags().summary(),
        );
    }

    // --- operand plumbing --------------------------------------------

    /// Effective address of a memory operand, segment base included.
    pub(crate) fn ea(&self, mem: &MemoryLocation) -> u64 {
        let mut addr = self.ea_no_segment(mem);
        if let Some(seg) = mem.segment {
            addr = addr.wrapping_add(self.state.seg_base(seg));
        }
        addr
    }

    /// The raw base+index+displacement sum (what `lea` materializes).
    fn ea_no_segment(&self, mem: &MemoryLocation) -> u64 {
        let base = match mem.base {
            Base::None => 0,
            Base::Reg(index) => self.state.gp64(index),
            Base::Rip => self.state.rip(),
        };
        let index = match mem.index {
            Some((index, scale)) => self.state.gp64(index) << scale,
            None => 0,
        };
        let addr = base.wrapping_add(index).wrapping_add(mem.disp as u64);
        if mem.addr32 {
            addr & 0xffff_ffff
        } else {
            addr
        }
    }

    /// Reads an operand, zero-extended to 64 bits.
    pub(crate) fn read_operand(&self, op: &Operand) -> Result<u64, FaultKind> {
        Ok(match op {
            Operand::Reg(reg) => self.state.read_reg(*reg),
            Operand::Imm(imm) => imm.zero_extended(),
            Operand::Mem(mem) => self.mem.read_wide(self.ea(mem), mem.size.bytes())?,
        })
    }

    /// Writes a register or memory operand.
    pub(crate) fn write_operand(&mut self, op: &Operand, value: u64) -> Result<(), FaultKind> {
        match op {
            Operand::Reg(reg) => self.state.write_reg(*reg, value),
            Operand::Mem(mem) => self.mem.write_wide(self.ea(mem), mem.size.bytes(), value)?,
            Operand::Imm(_) => unreachable!("immediate destination"),
        }
        Ok(())
    }

    /// Pushes `size.bytes()` bytes (8 or 2 in practice).
    fn push(&mut self, value: u64, size: OpSize) -> Result<(), FaultKind> {
        let rsp = self.state.gp64(reg::RSP).wrapping_sub(size.bytes() as u64);
        self.mem.write_wide(rsp, size.bytes(), value)?;
        self.state.set_gp64(reg::RSP, rsp);
        Ok(())
    }

    fn pop(&mut self, size: OpSize) -> Result<u64, FaultKind> {
        let rsp = self.state.gp64(reg::RSP);
        let value = self.mem.read_wide(rsp, size.bytes())?;
        self.state.set_gp64(reg::RSP, rsp.wrapping_add(size.bytes() as u64));
        Ok(value)
    }

    /// Push width for a `push`/`pop` operand: 2 bytes under an operand-size
    /// prefix, 8 otherwise.
    fn stack_width(op: &Operand) -> OpSize {
        if op.size() == OpSize::Bits16 {
            OpSize::Bits16
        } else {
            OpSize::Bits64
        }
    }

    // --- execution ---------------------------------------------------

    fn exec(&mut self, instr: &Instr) -> Result<Flow, FaultKind> {
        match instr {
            Instr::Alu { op, dest, src } => {
                let size = dest.size();
                let a = self.read_operand(dest)?;
                let b = self.read_operand(src)?;
                let carry = self.state.flags().contains(Flags::CF);
                let flags = self.state.flags_mut();
                let result = match op {
                    AluOp::Add => flags::add(flags, a, b, false, size),
                    AluOp::Adc => flags::add(flags, a, b, carry, size),
                    AluOp::Sub | AluOp::Cmp => flags::sub(flags, a, b, false, size),
                    AluOp::Sbb => flags::sub(flags, a, b, carry, size),
                    AluOp::And => flags::logic(flags, a & b, size),
                    AluOp::Or => flags::logic(flags, a | b, size),
                    AluOp::Xor => flags::logic(flags, a ^ b, size),
                };
                if *op != AluOp::Cmp {
                    self.write_operand(dest, result)?;
                }
            }
            Instr::Shift { op, dest, src } => {
                let size = dest.size();
                let value = self.read_operand(dest)?;
                let count = self.read_operand(src)? as u8;
                let result = flags::shift(self.state.flags_mut(), *op, value, count, size);
                self.write_operand(dest, result)?;
            }
            Instr::ShiftD {
                left,
                dest,
                src,
                count,
            } => {
                let size = dest.size();
                let bits = size.bits();
                let value = self.read_operand(dest)?;
                let fill = self.state.read_reg(*src);
                let count = (self.read_operand(count)? as u32
                    & if bits == 64 { 0x3f } else { 0x1f })
                    % bits;
                if count != 0 {
                    let (result, cf) = if *left {
                        (
                            (value << count | fill >> (bits - count)) & size.mask(),
                            value >> (bits - count) & 1 != 0,
                        )
                    } else {
                        (
                            (value >> count | fill << (bits - count)) & size.mask(),
                            value >> (count - 1) & 1 != 0,
                        )
                    };
                    let flags = self.state.flags_mut();
                    flags::logic(flags, result, size);
                    flags.set(Flags::CF, cf);
                    flags.set(
                        Flags::OF,
                        count == 1 && (result ^ value) & size.sign_bit() != 0,
                    );
                    self.write_operand(dest, result)?;
                }
            }
            Instr::Mov { dest, src } => {
                let value = self.read_operand(src)?;
                self.write_operand(dest, value)?;
            }
            Instr::MovZx { dest, src } => {
                let value = self.read_operand(src)?;
                self.state.write_reg(*dest, value);
            }
            Instr::MovSx { dest, src } => {
                let value = self.read_operand(src)?;
                self.state
                    .write_reg(*dest, flags::sign_extend(value, src.size()) as u64);
            }
            Instr::Xchg { reg, rm } => {
                let a = self.state.read_reg(*reg);
                let b = self.read_operand(rm)?;
                self.write_operand(rm, a)?;
                self.state.write_reg(*reg, b);
            }
            Instr::Lea { dest, src } => {
                let addr = self.ea_no_segment(src);
                self.state.write_reg(*dest, addr);
            }
            Instr::Test { lhs, rhs } => {
                let size = lhs.size();
                let a = self.read_operand(lhs)?;
                let b = self.read_operand(rhs)?;
                flags::logic(self.state.flags_mut(), a & b, size);
            }
            Instr::Not { operand } => {
                let value = self.read_operand(operand)?;
                self.write_operand(operand, !value)?;
            }
            Instr::Neg { operand } => {
                let size = operand.size();
                let value = self.read_operand(operand)?;
                let result = flags::sub(self.state.flags_mut(), 0, value, false, size);
                self.write_operand(operand, result)?;
            }
            Instr::Mul { operand } => self.exec_mul(operand)?,
            Instr::Imul { operand } => self.exec_imul(operand)?,
            Instr::ImulTrunc { dest, src1, src2 } => {
                let size = dest.size;
                let a = flags::sign_extend(self.read_operand(src1)?, size) as i128;
                let b = flags::sign_extend(self.read_operand(src2)?, src2.size()) as i128;
                let product = a * b;
                let low = product as u64 & size.mask();
                let overflow = product != flags::sign_extend(low, size) as i128;
                self.state.write_reg(*dest, low);
                let flags = self.state.flags_mut();
                flags.set(Flags::CF, overflow);
                flags.set(Flags::OF, overflow);
            }
            Instr::Div { operand } => self.exec_div(operand, false)?,
            Instr::Idiv { operand } => self.exec_div(operand, true)?,
            Instr::Inc { operand } => {
                let size = operand.size();
                let value = self.read_operand(operand)?;
                let result = flags::inc_dec(self.state.flags_mut(), value, false, size);
                self.write_operand(operand, result)?;
            }
            Instr::Dec { operand } => {
                let size = operand.size();
                let value = self.read_operand(operand)?;
                let result = flags::inc_dec(self.state.flags_mut(), value, true, size);
                self.write_operand(operand, result)?;
            }
            Instr::Push { operand } => {
                let width = Self::stack_width(operand);
                let value = match operand {
                    Operand::Imm(imm) => imm.sign_extended() as u64,
                    other => self.read_operand(other)?,
                };
                self.push(value, width)?;
            }
            Instr::Pop { operand } => {
                let width = Self::stack_width(operand);
                let value = self.pop(width)?;
                self.write_operand(operand, value)?;
            }
            Instr::Pushf => {
                let flags = self.state.flags().bits();
                self.push(flags, OpSize::Bits64)?;
            }
            Instr::Popf => {
                let value = self.pop(OpSize::Bits64)?;
                let keep = self.state.flags().bits() & !Flags::MODIFIABLE.bits();
                *self.state.flags_mut() = Flags::from_bits_truncate(
                    keep | (value & Flags::MODIFIABLE.bits()),
                ) | Flags::FIXED;
            }
            Instr::Leave { size } => {
                let rbp = self.state.gp64(reg::RBP);
                self.state.set_gp64(reg::RSP, rbp);
                let width = if *size == OpSize::Bits16 {
                    OpSize::Bits16
                } else {
                    OpSize::Bits64
                };
                let value = self.pop(width)?;
                self.state
                    .write_reg(Register::new(reg::RBP, width), value);
            }
            Instr::Jump { target } => {
                let target = self.read_operand(target)?;
                self.state.set_rip(target);
            }
            Instr::JumpIf { cc, target } => {
                if self.state.flags().condition(*cc) {
                    let target = self.read_operand(target)?;
                    self.state.set_rip(target);
                }
            }
            Instr::JumpCxz { size, target } => {
                if self.state.gp64(reg::RCX) & size.mask() == 0 {
                    let target = self.read_operand(target)?;
                    self.state.set_rip(target);
                }
            }
            Instr::Call { target } => {
                let target = self.read_operand(target)?;
                let ret = self.state.rip();
                self.push(ret, OpSize::Bits64)?;
                self.state.set_rip(target);
            }
            Instr::Ret { pop } => {
                let ret = self.pop(OpSize::Bits64)?;
                let rsp = self.state.gp64(reg::RSP).wrapping_add(*pop as u64);
                self.state.set_gp64(reg::RSP, rsp);
                self.state.set_rip(ret);
            }
            Instr::SetIf { cc, operand } => {
                let value = self.state.flags().condition(*cc) as u64;
                self.write_operand(operand, value)?;
            }
            Instr::MovIf { cc, dest, src } => {
                let value = self.read_operand(src)?;
                if self.state.flags().condition(*cc) {
                    self.state.write_reg(*dest, value);
                } else if dest.size == OpSize::Bits32 {
                    // A cmov always writes its destination; for 32-bit
                    // destinations that zeroes the upper half even when the
                    // condition is false.
                    let old = self.state.read_reg(*dest);
                    self.state.write_reg(*dest, old);
                }
            }
            Instr::StrMem { op, rep, size } => self.exec_string(*op, *rep, *size)?,
            Instr::BitScan { reverse, dest, src } => {
                let value = self.read_operand(src)?;
                self.state.flags_mut().set(Flags::ZF, value == 0);
                if value != 0 {
                    let index = if *reverse {
                        63 - value.leading_zeros() as u64
                    } else {
                        value.trailing_zeros() as u64
                    };
                    self.state.write_reg(*dest, index);
                }
            }
            Instr::BitTest { op, operand, bit } => self.exec_bittest(*op, operand, bit)?,
            Instr::Bswap { reg } => {
                let value = self.state.read_reg(*reg);
                let swapped = match reg.size {
                    OpSize::Bits64 => value.swap_bytes(),
                    _ => (value as u32).swap_bytes() as u64,
                };
                self.state.write_reg(*reg, swapped);
            }
            Instr::Convert { kind } => self.exec_convert(*kind),
            Instr::Xadd { dest, src } => {
                let size = dest.size();
                let a = self.read_operand(dest)?;
                let b = self.state.read_reg(*src);
                let sum = flags::add(self.state.flags_mut(), a, b, false, size);
                self.state.write_reg(*src, a);
                self.write_operand(dest, sum)?;
            }
            Instr::CmpXchg { dest, src } => {
                let size = dest.size();
                let acc_reg = Register::new(reg::RAX, size);
                let acc = self.state.read_reg(acc_reg);
                let current = self.read_operand(dest)?;
                flags::sub(self.state.flags_mut(), acc, current, false, size);
                if acc == current {
                    let value = self.state.read_reg(*src);
                    self.write_operand(dest, value)?;
                } else {
                    self.state.write_reg(acc_reg, current);
                }
            }
            Instr::SetFlag { kind } => {
                let flags = self.state.flags_mut();
                match kind {
                    FlagOpKind::Clc => flags.remove(Flags::CF),
                    FlagOpKind::Stc => flags.insert(Flags::CF),
                    FlagOpKind::Cmc => flags.toggle(Flags::CF),
                    FlagOpKind::Cld => flags.remove(Flags::DF),
                    FlagOpKind::Std => flags.insert(Flags::DF),
                }
            }
            Instr::Cpuid => self.exec_cpuid()?,
            Instr::Syscall => {
                self.hooks.syscall(Cpu {
                    state: &mut self.state,
                    mem: &mut self.mem,
                    control: &*self.control,
                })?;
            }
            Instr::Halt => return Ok(Flow::Halt),
            Instr::Nop => {}
            Instr::Fpu(fpu) => self.exec_fpu(fpu)?,
            Instr::Sse(sse) => self.exec_sse(sse)?,
        }
        Ok(Flow::Continue)
    }

    fn exec_mul(&mut self, operand: &Operand) -> Result<(), FaultKind> {
        let size = operand.size();
        let a = self.state.read_reg(Register::new(reg::RAX, size));
        let b = self.read_operand(operand)?;
        let (low, high) = match size {
            OpSize::Bits64 => {
                let product = a as u128 * b as u128;
                (product as u64, (product >> 64) as u64)
            }
            _ => {
                let product = a * b;
                (
                    product & size.mask(),
                    product >> size.bits() & size.mask(),
                )
            }
        };
        if size == OpSize::Bits8 {
            // The 16-bit product lives in ax.
            self.state
                .write_reg(Register::new(reg::RAX, OpSize::Bits16), high << 8 | low);
        } else {
            self.state.write_reg(Register::new(reg::RAX, size), low);
            self.state.write_reg(Register::new(reg::RDX, size), high);
        }
        let overflow = high != 0;
        let flags = self.state.flags_mut();
        flags.set(Flags::CF, overflow);
        flags.set(Flags::OF, overflow);
        Ok(())
    }

    fn exec_imul(&mut self, operand: &Operand) -> Result<(), FaultKind> {
        let size = operand.size();
        let a = flags::sign_extend(
            self.state.read_reg(Register::new(reg::RAX, size)),
            size,
        ) as i128;
        let b = flags::sign_extend(self.read_operand(operand)?, size) as i128;
        let product = a * b;
        let low = product as u64 & size.mask();
        let high = (product >> size.bits()) as u64 & size.mask();
        if size == OpSize::Bits8 {
            self.state
                .write_reg(Register::new(reg::RAX, OpSize::Bits16), high << 8 | low);
        } else {
            self.state.write_reg(Register::new(reg::RAX, size), low);
            self.state.write_reg(Register::new(reg::RDX, size), high);
        }
        let overflow = product != flags::sign_extend(low, size) as i128;
        let flags = self.state.flags_mut();
        flags.set(Flags::CF, overflow);
        flags.set(Flags::OF, overflow);
        Ok(())
    }

    fn exec_div(&mut self, operand: &Operand, signed: bool) -> Result<(), FaultKind> {
        let size = operand.size();
        let divisor = self.read_operand(operand)?;
        if divisor & size.mask() == 0 {
            return Err(FaultKind::DivideError);
        }

        let low = self.state.read_reg(Register::new(reg::RAX, size));
        let high = if size == OpSize::Bits8 {
            // The 16-bit dividend is all of ax.
            self.state.read_reg(Register::new(reg::RAX, OpSize::Bits16)) >> 8
        } else {
            self.state.read_reg(Register::new(reg::RDX, size))
        };

        let (quotient, remainder) = if signed {
            let dividend = ((high as i128) << size.bits())
                | low as i128 & size.mask() as i128;
            // Sign-extend the double-width dividend from its top bit.
            let shift = 128 - 2 * size.bits();
            let dividend = dividend << shift >> shift;
            let divisor = flags::sign_extend(divisor, size) as i128;
            let quotient = dividend.wrapping_div(divisor);
            let limit = 1i128 << (size.bits() - 1);
            if quotient >= limit || quotient < -limit {
                return Err(FaultKind::DivideError);
            }
            (quotient as u64, dividend.wrapping_rem(divisor) as u64)
        } else {
            let dividend = (high as u128) << size.bits() | low as u128;
            let divisor = divisor as u128;
            let quotient = dividend / divisor;
            if quotient > size.mask() as u128 {
                return Err(FaultKind::DivideError);
            }
            (quotient as u64, (dividend % divisor) as u64)
        };

        if size == OpSize::Bits8 {
            let packed = (remainder & 0xff) << 8 | quotient & 0xff;
            self.state
                .write_reg(Register::new(reg::RAX, OpSize::Bits16), packed);
        } else {
            self.state.write_reg(Register::new(reg::RAX, size), quotient);
            self.state.write_reg(Register::new(reg::RDX, size), remainder);
        }
        Ok(())
    }

    fn exec_string(&mut self, op: StrMemOp, rep: RepKind, size: OpSize) -> Result<(), FaultKind> {
        let bytes = size.bytes() as u64;
        let step = if self.state.flags().contains(Flags::DF) {
            bytes.wrapping_neg()
        } else {
            bytes
        };
        let acc = Register::new(reg::RAX, size);

        loop {
            if rep != RepKind::None && self.state.gp64(reg::RCX) == 0 {
                break;
            }

            let rsi = self.state.gp64(reg::RSI);
            let rdi = self.state.gp64(reg::RDI);
            match op {
                StrMemOp::Movs => {
                    let value = self.mem.read_wide(rsi, size.bytes())?;
                    self.mem.write_wide(rdi, size.bytes(), value)?;
                    self.state.set_gp64(reg::RSI, rsi.wrapping_add(step));
                    self.state.set_gp64(reg::RDI, rdi.wrapping_add(step));
                }
                StrMemOp::Stos => {
                    let value = self.state.read_reg(acc);
                    self.mem.write_wide(rdi, size.bytes(), value)?;
                    self.state.set_gp64(reg::RDI, rdi.wrapping_add(step));
                }
                StrMemOp::Lods => {
                    let value = self.mem.read_wide(rsi, size.bytes())?;
                    self.state.write_reg(acc, value);
                    self.state.set_gp64(reg::RSI, rsi.wrapping_add(step));
                }
                StrMemOp::Scas => {
                    let value = self.mem.read_wide(rdi, size.bytes())?;
                    let a = self.state.read_reg(acc);
                    flags::sub(self.state.flags_mut(), a, value, false, size);
                    self.state.set_gp64(reg::RDI, rdi.wrapping_add(step));
                }
            }

            if rep == RepKind::None {
                break;
            }
            let rcx = self.state.gp64(reg::RCX).wrapping_sub(1);
            self.state.set_gp64(reg::RCX, rcx);

            // repe/repne termination applies to the comparing operation.
            if op == StrMemOp::Scas {
                let zf = self.state.flags().contains(Flags::ZF);
                match rep {
                    RepKind::Rep if !zf => break,
                    RepKind::Repne if zf => break,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn exec_bittest(
        &mut self,
        op: BitOp,
        operand: &Operand,
        bit: &Operand,
    ) -> Result<(), FaultKind> {
        let size = operand.size();
        let index = self.read_operand(bit)? % size.bits() as u64;
        let value = self.read_operand(operand)?;
        let mask = 1u64 << index;

        self.state.flags_mut().set(Flags::CF, value & mask != 0);

        let new = match op {
            BitOp::Bt => return Ok(()),
            BitOp::Bts => value | mask,
            BitOp::Btr => value & !mask,
            BitOp::Btc => value ^ mask,
        };
        self.write_operand(operand, new)
    }

    fn exec_convert(&mut self, kind: ConvertKind) {
        use self::ConvertKind::*;

        let (from, to) = match kind {
            Cbw => (OpSize::Bits8, OpSize::Bits16),
            Cwde => (OpSize::Bits16, OpSize::Bits32),
            Cdqe => (OpSize::Bits32, OpSize::Bits64),
            Cwd => (OpSize::Bits16, OpSize::Bits16),
            Cdq => (OpSize::Bits32, OpSize::Bits32),
            Cqo => (OpSize::Bits64, OpSize::Bits64),
        };
        let a = self.state.read_reg(Register::new(reg::RAX, from));
        let extended = flags::sign_extend(a, from) as u64;
        match kind {
            Cbw | Cwde | Cdqe => {
                self.state.write_reg(Register::new(reg::RAX, to), extended);
            }
            _ => {
                let high = (flags::sign_extend(a, from) >> 63) as u64;
                self.state.write_reg(Register::new(reg::RDX, to), high);
            }
        }
    }

    fn exec_cpuid(&mut self) -> Result<(), FaultKind> {
        let leaf = self.state.read_reg(Register::new(reg::RAX, OpSize::Bits32)) as u32;
        let set = |state: &mut State, a: u32, b: u32, c: u32, d: u32| {
            state.write_reg(Register::new(reg::RAX, OpSize::Bits32), a as u64);
            state.write_reg(Register::new(reg::RBX, OpSize::Bits32), b as u64);
            state.write_reg(Register::new(reg::RCX, OpSize::Bits32), c as u64);
            state.write_reg(Register::new(reg::RDX, OpSize::Bits32), d as u64);
        };
        match leaf {
            0 => {
                // "GenuineIntel" in the traditional ebx/edx/ecx order.
                let b = u32::from_le_bytes(*b"Genu");
                let d = u32::from_le_bytes(*b"ineI");
                let c = u32::from_le_bytes(*b"ntel");
                set(&mut self.state, 1, b, c, d);
            }
            1 | 0x8000_0000 => set(&mut self.state, 0, 0, 0, 0),
            other => {
                return Err(FaultKind::Unsupported(format!(
                    "cpuid leaf {:#010x}",
                    other
                )));
            }
        }
        Ok(())
    }
}

impl<H: Hooks + fmt::Debug> fmt::Debug for Interpreter<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("state", &self.state)
            .field("hooks", &self.hooks)
            .field("instructions", &self.instructions)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{Interpreter, NullHooks};
    use crate::memory::MemImage;

    /// A small machine: 8 KiB image at `0x1000` with `code` at the entry
    /// point, data space around `0x2000`, and a 4 KiB stack topping out at
    /// `0x4000`.
    pub(crate) fn machine(code: &[u8]) -> Interpreter<NullHooks> {
        let mut mem = vec![0u8; 0x3000];
        mem[..code.len()].copy_from_slice(code);
        let image = MemImage::new(mem, 0x1000, 0x1000, 0x4000);
        Interpreter::new(image, 0x1000, NullHooks)
    }

    pub(crate) fn run_to_halt(m: &mut Interpreter<NullHooks>) -> u64 {
        m.run().expect("emulation faulted")
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn factorial_loop() {
        // mov rax, 1; mov ecx, 15; imul rax, rcx; dec rcx; jne back; hlt
        let code = [
            0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
            0xb9, 0x0f, 0x00, 0x00, 0x00, // mov ecx, 15
            0x48, 0x0f, 0xaf, 0xc1, // imul rax, rcx
            0x48, 0xff, 0xc9, // dec rcx
            0x75, 0xf7, // jne -9
            0xf4,
        ];
        let mut m = machine(&code);
        let executed = run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 1_307_674_368_000);
        assert_eq!(m.state().gp64(reg::RCX), 0);
        // 2 setup + 15 * 3 loop + 1 hlt
        assert_eq!(executed, 48);
    }

    #[test]
    fn unsigned_divide_edge() {
        // rdx:rax = 2^64, divided by 2.
        let code = [0x48, 0xf7, 0xf3, 0xf4]; // div rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RDX, 1);
        m.state_mut().set_gp64(reg::RAX, 0);
        m.state_mut().set_gp64(reg::RBX, 2);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x8000_0000_0000_0000);
        assert_eq!(m.state().gp64(reg::RDX), 0);
    }

    #[test]
    fn divide_by_zero_faults() {
        let code = [0x48, 0xf7, 0xfb, 0xf4]; // idiv rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 100);
        let err = m.run().unwrap_err();
        assert!(matches!(err.kind, FaultKind::DivideError));
        assert_eq!(err.rip, 0x1000);
    }

    #[test]
    fn divide_overflow_faults() {
        // i64::MIN / -1 does not fit.
        let code = [0x48, 0xf7, 0xfb, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RDX, 0xffff_ffff_ffff_ffff);
        m.state_mut().set_gp64(reg::RAX, 0x8000_0000_0000_0000);
        m.state_mut().set_gp64(reg::RBX, !0); // -1
        let err = m.run().unwrap_err();
        assert!(matches!(err.kind, FaultKind::DivideError));
    }

    #[test]
    fn shift_count_is_masked() {
        let code = [0x48, 0xd3, 0xe0, 0xf4]; // shl rax, cl
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0x0123_4567_89ab_cdef);
        m.state_mut().set_gp64(reg::RCX, 64);
        m.state_mut().flags_mut().insert(Flags::CF | Flags::OF);
        let before = m.state().flags();
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x0123_4567_89ab_cdef);
        assert_eq!(m.state().flags(), before);
    }

    #[test]
    fn push_pop_roundtrip() {
        let code = [0x50, 0x5b, 0xf4]; // push rax; pop rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0xdead_beef_1234_5678);
        let rsp = m.state().gp64(reg::RSP);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RBX), 0xdead_beef_1234_5678);
        assert_eq!(m.state().gp64(reg::RSP), rsp);
    }

    #[test]
    fn call_and_return() {
        // call +1 (to the ret behind the hlt), then return to the hlt.
        let code = [
            0xe8, 0x01, 0x00, 0x00, 0x00, // call 0x1006
            0xf4, // hlt
            0xc3, // ret
        ];
        let mut m = machine(&code);
        let rsp = m.state().gp64(reg::RSP);
        let executed = run_to_halt(&mut m);
        assert_eq!(executed, 3);
        assert_eq!(m.state().gp64(reg::RSP), rsp);
        assert_eq!(m.state().rip(), 0x1006);
    }

    #[test]
    fn rep_stosb() {
        let code = [0xf3, 0xaa, 0xf4]; // rep stosb
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0xab);
        m.state_mut().set_gp64(reg::RDI, 0x2000);
        m.state_mut().set_gp64(reg::RCX, 5);
        run_to_halt(&mut m);
        for i in 0..5 {
            assert_eq!(m.mem().read_u8(0x2000 + i).unwrap(), 0xab);
        }
        assert_eq!(m.mem().read_u8(0x2005).unwrap(), 0);
        assert_eq!(m.state().gp64(reg::RCX), 0);
        assert_eq!(m.state().gp64(reg::RDI), 0x2005);
    }

    #[test]
    fn rep_movsb_backwards() {
        // std; rep movsb with rsi/rdi at the high ends of two regions.
        let code = [0xfd, 0xf3, 0xa4, 0xf4];
        let mut m = machine(&code);
        for i in 0..16 {
            m.mem_mut().write_u8(0x2000 + i, i as u8).unwrap();
        }
        m.state_mut().set_gp64(reg::RSI, 0x200f);
        m.state_mut().set_gp64(reg::RDI, 0x202f);
        m.state_mut().set_gp64(reg::RCX, 16);
        run_to_halt(&mut m);
        for i in 0..16 {
            assert_eq!(m.mem().read_u8(0x2020 + i).unwrap(), i as u8);
        }
        assert_eq!(m.state().gp64(reg::RCX), 0);
        assert_eq!(m.state().gp64(reg::RSI), 0x1fff);
        assert_eq!(m.state().gp64(reg::RDI), 0x201f);
        assert!(m.state().flags().contains(Flags::DF));
    }

    #[test]
    fn bit_scan_zero_sets_zf() {
        let code = [0x48, 0x0f, 0xbc, 0xc3, 0xf4]; // bsf rax, rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0x1234);
        m.state_mut().set_gp64(reg::RBX, 0);
        run_to_halt(&mut m);
        assert!(m.state().flags().contains(Flags::ZF));
        assert_eq!(m.state().gp64(reg::RAX), 0x1234); // untouched

        let code = [0x48, 0x0f, 0xbd, 0xc3, 0xf4]; // bsr rax, rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RBX, 0b0101_1000);
        run_to_halt(&mut m);
        assert!(!m.state().flags().contains(Flags::ZF));
        assert_eq!(m.state().gp64(reg::RAX), 6);
    }

    #[test]
    fn dword_writes_zero_extend() {
        let code = [0xb8, 0x78, 0x56, 0x34, 0x12, 0xf4]; // mov eax, 0x12345678
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, !0);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x1234_5678);
    }

    #[test]
    fn byte_write_preserves_rest() {
        let code = [0xb3, 0x9a, 0xf4]; // mov bl, 0x9a
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RBX, 0x1111_1111_1111_1111);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RBX), 0x1111_1111_1111_119a);
    }

    #[test]
    fn high_byte_registers_without_rex() {
        // mov ah, 0x7f  (b4 7f) then mov [0x2000], ah (88 24 25 ..).
        let code = [
            0xb4, 0x7f, // mov ah, 0x7f
            0x88, 0x24, 0x25, 0x00, 0x20, 0x00, 0x00, // mov [0x2000], ah
            0xf4,
        ];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0xffff_ffff_ffff_00ff);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0xffff_ffff_ffff_7fff);
        assert_eq!(m.mem().read_u8(0x2000).unwrap(), 0x7f);
    }

    #[test]
    fn movzx_movsx() {
        let code = [0x0f, 0xb6, 0xc3, 0xf4]; // movzx eax, bl
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RBX, 0x80);
        m.state_mut().set_gp64(reg::RAX, !0);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x80);

        let code = [0x48, 0x0f, 0xbe, 0xc3, 0xf4]; // movsx rax, bl
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RBX, 0x80);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0xffff_ffff_ffff_ff80);
    }

    #[test]
    fn imul_overflow_flag() {
        let code = [0x48, 0x0f, 0xaf, 0xc3, 0xf4]; // imul rax, rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 1 << 62);
        m.state_mut().set_gp64(reg::RBX, 4);
        run_to_halt(&mut m);
        assert!(m.state().flags().contains(Flags::CF | Flags::OF));

        let mut m = machine(&[0x48, 0x0f, 0xaf, 0xc3, 0xf4]);
        m.state_mut().set_gp64(reg::RAX, 1000);
        m.state_mut().set_gp64(reg::RBX, 1000);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 1_000_000);
        assert!(!m.state().flags().contains(Flags::CF));
    }

    #[test]
    fn lea_with_sib() {
        let code = [0x48, 0x8d, 0x44, 0x88, 0x05, 0xf4]; // lea rax, [rax+rcx*4+5]
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0x100);
        m.state_mut().set_gp64(reg::RCX, 3);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x111);
    }

    #[test]
    fn rip_relative_load() {
        // mov rax, [rip+0xff9] at 0x1000 reads 0x2000.
        let code = [0x48, 0x8b, 0x05, 0xf9, 0x0f, 0x00, 0x00, 0xf4];
        let mut m = machine(&code);
        m.mem_mut().write_u64(0x2000, 0xfeed_face_cafe_beef).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0xfeed_face_cafe_beef);
    }

    #[test]
    fn leave_restores_frame() {
        let code = [0xc9, 0xf4]; // leave
        let mut m = machine(&code);
        m.mem_mut().write_u64(0x3800, 0x0000_1111_2222_3333).unwrap();
        m.state_mut().set_gp64(reg::RBP, 0x3800);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RSP), 0x3808);
        assert_eq!(m.state().gp64(reg::RBP), 0x0000_1111_2222_3333);
    }

    #[test]
    fn conditional_move_and_set() {
        // cmp rax, rbx; cmovb rcx, rbx; setb dl
        let code = [
            0x48, 0x39, 0xd8, // cmp rax, rbx
            0x48, 0x0f, 0x42, 0xcb, // cmovb rcx, rbx
            0x0f, 0x92, 0xc2, // setb dl
            0xf4,
        ];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 3);
        m.state_mut().set_gp64(reg::RBX, 9);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RCX), 9);
        assert_eq!(m.state().gp64(reg::RDX) & 0xff, 1);

        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 10);
        m.state_mut().set_gp64(reg::RBX, 9);
        m.state_mut().set_gp64(reg::RCX, 7);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RCX), 7);
        assert_eq!(m.state().gp64(reg::RDX) & 0xff, 0);
    }

    #[test]
    fn shld_fills_from_source() {
        let code = [0x48, 0x0f, 0xa4, 0xd8, 0x04, 0xf4]; // shld rax, rbx, 4
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0x1234_5678_90ab_cdef);
        m.state_mut().set_gp64(reg::RBX, 0xf000_0000_0000_0000);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x2345_6789_0abc_deff);
        assert!(m.state().flags().contains(Flags::CF));
    }

    #[test]
    fn bit_test_and_set() {
        let code = [0x48, 0x0f, 0xab, 0xd8, 0xf4]; // bts rax, rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0);
        m.state_mut().set_gp64(reg::RBX, 65); // masked to bit 1
        run_to_halt(&mut m);
        assert!(!m.state().flags().contains(Flags::CF));
        assert_eq!(m.state().gp64(reg::RAX), 2);
    }

    #[test]
    fn bswap_reverses() {
        let code = [0x48, 0x0f, 0xc8, 0xf4]; // bswap rax
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0x0102_0304_0506_0708);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x0807_0605_0403_0201);
    }

    #[test]
    fn xadd_and_cmpxchg() {
        let code = [0x48, 0x0f, 0xc1, 0xd8, 0xf4]; // xadd rax, rbx
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 10);
        m.state_mut().set_gp64(reg::RBX, 32);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 42);
        assert_eq!(m.state().gp64(reg::RBX), 10);

        // cmpxchg rcx, rbx: match -> rcx gets rbx, ZF set.
        let code = [0x48, 0x0f, 0xb1, 0xd9, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 5);
        m.state_mut().set_gp64(reg::RCX, 5);
        m.state_mut().set_gp64(reg::RBX, 99);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RCX), 99);
        assert!(m.state().flags().contains(Flags::ZF));

        let code = [0x48, 0x0f, 0xb1, 0xd9, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 4);
        m.state_mut().set_gp64(reg::RCX, 5);
        m.state_mut().set_gp64(reg::RBX, 99);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 5);
        assert_eq!(m.state().gp64(reg::RCX), 5);
        assert!(!m.state().flags().contains(Flags::ZF));
    }

    #[test]
    fn cpuid_vendor_string() {
        let code = [0x0f, 0xa2, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 0);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RBX) as u32, u32::from_le_bytes(*b"Genu"));
        assert_eq!(m.state().gp64(reg::RDX) as u32, u32::from_le_bytes(*b"ineI"));
        assert_eq!(m.state().gp64(reg::RCX) as u32, u32::from_le_bytes(*b"ntel"));
    }

    #[test]
    fn cpuid_unknown_leaf_faults() {
        let code = [0x0f, 0xa2, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 7);
        assert!(matches!(
            m.run().unwrap_err().kind,
            FaultKind::Unsupported(_)
        ));
    }

    #[test]
    fn unknown_opcode_faults_with_byte() {
        let code = [0x0e, 0xf4]; // not valid in long mode
        let mut m = machine(&code);
        let err = m.run().unwrap_err();
        match err.kind {
            FaultKind::Decode(DecoderError::Undefined(why)) => {
                assert!(why.contains("0x0e"), "{}", why)
            }
            other => panic!("unexpected fault {:?}", other),
        }
    }

    #[test]
    fn out_of_image_access_faults() {
        // mov rax, [0x20000] is far outside the 12 KiB image.
        let code = [0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x02, 0x00, 0xf4];
        let mut m = machine(&code);
        let err = m.run().unwrap_err();
        assert!(matches!(err.kind, FaultKind::Memory(_)));
        assert_eq!(err.rip, 0x1000);
    }

    #[test]
    fn syscall_hook_drives_exit() {
        #[derive(Debug, Default)]
        struct Recorder {
            nr: u64,
        }

        impl Hooks for Recorder {
            fn syscall(&mut self, cpu: Cpu<'_>) -> Result<(), FaultKind> {
                self.nr = cpu.state.gp64(reg::RAX);
                cpu.state.set_gp64(reg::RAX, 0);
                cpu.control.end_emulation();
                Ok(())
            }
        }

        // mov eax, 60; syscall; (unreachable) hlt
        let code = [0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05, 0xf4];
        let mut mem = vec![0u8; 0x3000];
        mem[..code.len()].copy_from_slice(&code);
        let image = crate::memory::MemImage::new(mem, 0x1000, 0x1000, 0x4000);
        let mut m = Interpreter::new(image, 0x1000, Recorder::default());
        let executed = m.run().unwrap();
        assert_eq!(executed, 2);
        assert_eq!(m.hooks_mut().nr, 60);
        assert_eq!(m.state().gp64(reg::RAX), 0);
    }

    #[test]
    fn end_emulation_stops_loop() {
        // An infinite loop, stopped via the control word.
        let code = [0xeb, 0xfe]; // jmp $
        let mut m = machine(&code);
        let control = m.control();
        control.trace_instructions(false);
        // Step a few times, then request an end; run() must return.
        for _ in 0..3 {
            m.step().unwrap();
        }
        control.end_emulation();
        let executed = m.run().unwrap();
        assert_eq!(executed, 3);
    }

    #[test]
    fn pushf_popf_masking() {
        // stc; pushfq; clc; popfq -> CF restored.
        let code = [0xf9, 0x9c, 0xf8, 0x9d, 0xf4];
        let mut m = machine(&code);
        run_to_halt(&mut m);
        assert!(m.state().flags().contains(Flags::CF));
        assert!(m.state().flags().contains(Flags::FIXED));
    }

    #[test]
    fn adc_sbb_use_carry() {
        // stc; adc rax, rbx
        let code = [0xf9, 0x48, 0x11, 0xd8, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RAX, 1);
        m.state_mut().set_gp64(reg::RBX, 2);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 4);
    }

    #[test]
    fn xchg_with_memory() {
        let code = [0x48, 0x87, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, 0xf4]; // xchg [0x2000], rax
        let mut m = machine(&code);
        m.mem_mut().write_u64(0x2000, 77).unwrap();
        m.state_mut().set_gp64(reg::RAX, 88);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 77);
        assert_eq!(m.mem().read_u64(0x2000).unwrap(), 88);
    }

    #[test]
    fn segment_override_applies_base() {
        use crate::cpu::instr::Segment;

        // mov rax, fs:[0x10]
        let code = [0x64, 0x48, 0x8b, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_seg_base(Segment::Fs, 0x2000);
        m.mem_mut().write_u64(0x2010, 0x5151).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX), 0x5151);
    }

    #[test]
    fn jrcxz_branches_on_zero() {
        // jrcxz +1 (over the hlt at 0x1003 to mov at 0x1003?):
        // layout: jrcxz +2; hlt; mov al, 1; hlt
        let code = [0xe3, 0x01, 0xf4, 0xb0, 0x01, 0xf4];
        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RCX, 0);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX) & 0xff, 1);

        let mut m = machine(&code);
        m.state_mut().set_gp64(reg::RCX, 5);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(reg::RAX) & 0xff, 0);
    }
}
