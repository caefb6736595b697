//! AMD64 instruction decoder.
//!
//! A long-mode decoder for the subset this core executes: the general
//! integer instructions, the `0f` map including SSE/SSE2, and the `d8`-`df`
//! x87 escapes. Prefix bytes are collected up front, then the opcode selects
//! how ModR/M, SIB, displacement and immediate bytes are consumed.
//!
//! Anything outside the supported set decodes to an error carrying the
//! offending byte; the interpreter turns that into a fatal fault rather than
//! guessing.

use crate::cpu::instr::*;
use crate::cpu::prefix::{Prefixes, SseSelector};
use crate::memory::{MemImage, MemoryError};

use num_traits::FromPrimitive;

/// Machine instruction decoder.
#[derive(Debug)]
pub struct Decoder<'a> {
    /// Virtual address of the next byte that will be loaded from memory.
    pos: u64,
    /// Length of the currently decoded instruction.
    len: u32,
    prefixes: Prefixes,
    mem: &'a MemImage,
}

impl<'a> Decoder<'a> {
    /// Creates a new instruction decoder reading from `mem`, starting at
    /// virtual address `rip`.
    pub fn new(mem: &'a MemImage, rip: u64) -> Self {
        Self {
            pos: rip,
            len: 0,
            prefixes: Prefixes::empty(),
            mem,
        }
    }

    /// The virtual address of the first byte of the next instruction.
    ///
    /// After a successful `decode_next` this is the post-decode `rip` that
    /// relative displacements were resolved against.
    pub fn current_address(&self) -> u64 {
        self.pos
    }

    /// Read and decode the next instruction in the stream.
    ///
    /// On error the decoder most likely points into the middle of an
    /// instruction and should not be used further.
    pub fn decode_next(&mut self) -> Result<Instr, DecoderError> {
        self.len = 0;
        self.prefixes = Prefixes::empty();

        let mut byte = self.read()?;
        while self.prefixes.decode(byte).is_ok() {
            byte = self.read()?;
        }

        // Many one-byte opcodes end in direction and size bits: X X X X X X D S
        let default_dir_bit = (byte & 0b10) >> 1 != 0; // false = reg to r/m
        let default_size_bit = (byte & 0b01) != 0; // false = 8 bit

        let instr = match byte {
            _ if bitpat!(0 0 _ _ _ 0 _ _)(byte) => {
                // "Normal" ALU opcode with ModR/M byte.
                let op = AluOp::from_u8((byte & 0b0011_1000) >> 3).unwrap();
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let reg = self.reg_register(modrm, size).into();
                let rm = self.read_addressing(modrm, size)?;
                let (src, dest) = if default_dir_bit { (rm, reg) } else { (reg, rm) };

                Instr::Alu { op, dest, src }
            }
            _ if bitpat!(0 0 _ _ _ 1 0 _)(byte) => {
                // ALU op with immediate and the accumulator.
                let op = AluOp::from_u8((byte & 0b0011_1000) >> 3).unwrap();
                let size = self.prefixes.sized(default_size_bit);
                let dest = Register::new(reg::RAX, size).into();
                let src = self.read_immediate(size)?.into();

                Instr::Alu { op, dest, src }
            }
            _ if bitpat!(1 0 0 0 0 0 _ _)(byte) => {
                // ALU opcode with immediate. The direction bit instead
                // selects an 8-bit immediate sign-extended to the operand
                // size; `82` (both clear) does not exist in long mode.
                let sign_ext_imm = default_dir_bit;
                if sign_ext_imm && !default_size_bit {
                    return Err(DecoderError::unknown_op(byte));
                }
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let op = AluOp::from_u8(modrm.reg_raw()).unwrap();
                let dest = self.read_addressing(modrm, size)?;
                let src = if sign_ext_imm {
                    Immediate::from(self.read()?).sign_ext_to(size).into()
                } else {
                    self.read_immediate(size)?.into()
                };

                Instr::Alu { op, dest, src }
            }
            _ if bitpat!(0 1 0 1 _ _ _ _)(byte) => {
                // 0x5_: push or pop a 64-bit register (REX.B extends).
                let pop = byte & 0b1000 != 0;
                let size = self.prefixes.stack_size();
                let reg = Register::new(byte & 0b111 | self.rex_b(), size);

                if pop {
                    Instr::Pop { operand: reg.into() }
                } else {
                    Instr::Push { operand: reg.into() }
                }
            }
            0x63 => {
                // movsxd: sign-extend r/m32 into a wider register.
                let modrm = self.read_modrm()?;
                let dest = self.reg_register(modrm, self.prefixes.op_size());
                let src = self.read_addressing(modrm, OpSize::Bits32)?;

                Instr::MovSx { dest, src }
            }
            _ if bitpat!(0 1 1 0 1 0 _ 0)(byte) => {
                // 0x68 / 0x6A: push immediate (sign-extended when pushed).
                let smol = byte & 0b10 != 0;
                let word = self.prefixes.op_size() == OpSize::Bits16;
                let imm = if smol {
                    let imm = Immediate::from(self.read()?);
                    // A 16-bit push must carry a 16-bit operand so the
                    // stack width comes out right.
                    if word { imm.sign_ext_to(OpSize::Bits16) } else { imm }
                } else if word {
                    Immediate::from(self.read_u16()?)
                } else {
                    Immediate::from(self.read_u32()?)
                };

                Instr::Push { operand: imm.into() }
            }
            0x69 | 0x6B => {
                // imul with immediate: dest = r/m * imm.
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let dest = self.reg_register(modrm, size);
                let src1 = self.read_addressing(modrm, size)?;
                let src2 = if byte == 0x6b {
                    Immediate::from(self.read()?).sign_ext_to(size).into()
                } else {
                    self.read_immediate(size)?.into()
                };

                Instr::ImulTrunc { dest, src1, src2 }
            }
            _ if bitpat!(0 1 1 1 _ _ _ _)(byte) => {
                // 0x7_: conditional short jumps.
                let cc = ConditionCode::from_u8(byte & 0x0f).unwrap();
                let offset = self.read()? as i8;
                let target = self.rel_target(offset as i64);

                Instr::JumpIf { cc, target }
            }
            0x84 | 0x85 => {
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let lhs = self.read_addressing(modrm, size)?;
                let rhs = self.reg_register(modrm, size).into();

                Instr::Test { lhs, rhs }
            }
            0x86 | 0x87 => {
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let reg = self.reg_register(modrm, size);
                let rm = self.read_addressing(modrm, size)?;

                Instr::Xchg { reg, rm }
            }
            _ if bitpat!(1 0 0 0 1 0 _ _)(byte) => {
                // mov reg/mem <-> GP reg.
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let reg = self.reg_register(modrm, size).into();
                let rm = self.read_addressing(modrm, size)?;
                let (src, dest) = if default_dir_bit { (rm, reg) } else { (reg, rm) };

                Instr::Mov { dest, src }
            }
            0x8d => {
                let modrm = self.read_modrm()?;
                let size = self.prefixes.op_size();
                let dest = self.reg_register(modrm, size);
                match self.read_addressing(modrm, size)? {
                    Operand::Mem(src) => Instr::Lea { dest, src },
                    _ => return Err(DecoderError::ud("use of `lea` with register operand")),
                }
            }
            0x8f => {
                let modrm = self.read_modrm()?;
                if modrm.reg_raw() != 0 {
                    return Err(DecoderError::ud("0x8f with non-0 reg field"));
                }
                let operand = self.read_addressing(modrm, self.prefixes.stack_size())?;

                Instr::Pop { operand }
            }
            0x90 if !self.rex_b_set() => Instr::Nop, // also `pause` under f3
            _ if bitpat!(1 0 0 1 0 _ _ _)(byte) => {
                // 0x90..0x97: xchg rAX, r.
                let size = self.prefixes.op_size();
                let reg = Register::new(reg::RAX, size);
                let rm = Register::new(byte & 0b111 | self.rex_b(), size).into();

                Instr::Xchg { reg, rm }
            }
            0x98 => Instr::Convert {
                kind: match self.prefixes.op_size() {
                    OpSize::Bits16 => ConvertKind::Cbw,
                    OpSize::Bits32 => ConvertKind::Cwde,
                    _ => ConvertKind::Cdqe,
                },
            },
            0x99 => Instr::Convert {
                kind: match self.prefixes.op_size() {
                    OpSize::Bits16 => ConvertKind::Cwd,
                    OpSize::Bits32 => ConvertKind::Cdq,
                    _ => ConvertKind::Cqo,
                },
            },
            0x9c => Instr::Pushf,
            0x9d => Instr::Popf,
            0xa4 | 0xa5 | 0xaa | 0xab | 0xac | 0xad | 0xae | 0xaf => {
                let op = match byte & !1 {
                    0xa4 => StrMemOp::Movs,
                    0xaa => StrMemOp::Stos,
                    0xac => StrMemOp::Lods,
                    _ => StrMemOp::Scas,
                };
                let size = self.prefixes.sized(default_size_bit);

                Instr::StrMem {
                    op,
                    rep: self.prefixes.rep(),
                    size,
                }
            }
            0xa8 | 0xa9 => {
                let size = self.prefixes.sized(default_size_bit);
                let lhs = Register::new(reg::RAX, size).into();
                let rhs = self.read_immediate(size)?.into();

                Instr::Test { lhs, rhs }
            }
            _ if bitpat!(1 0 1 1 _ _ _ _)(byte) => {
                // 0xB_: load immediate into register. The only encoding with
                // a true 64-bit immediate.
                let wide = byte & 0b1000 != 0;
                let size = if wide { self.prefixes.op_size() } else { OpSize::Bits8 };
                let index = byte & 0b111 | self.rex_b();
                let dest = if wide {
                    Register::new(index, size)
                } else {
                    self.byte_reg(index)
                };
                let src = self.read_immediate_full(size)?;

                Instr::Mov {
                    dest: dest.into(),
                    src: src.into(),
                }
            }
            _ if bitpat!(1 1 0 0 0 0 0 _)(byte) || bitpat!(1 1 0 1 0 0 _ _)(byte) => {
                // Shift group 2: C0/C1 imm8, D0/D1 by one, D2/D3 by cl.
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let dest = self.read_addressing(modrm, size)?;

                let src: Operand = if byte & 0xf0 == 0xc0 {
                    Immediate::from(self.read()?).into()
                } else if byte & 0b10 == 0 {
                    Immediate::Imm8(1).into()
                } else {
                    Register::new(reg::RCX, OpSize::Bits8).into()
                };

                let op = ShiftOp::from_u8(modrm.reg_raw()).unwrap();

                Instr::Shift { op, dest, src }
            }
            _ if bitpat!(1 1 0 0 0 0 1 _)(byte) => {
                // ret, with optional stack adjustment.
                let pop = if byte & 1 == 0 { self.read_u16()? } else { 0 };

                Instr::Ret { pop }
            }
            0xc6 | 0xc7 => {
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                if modrm.reg_raw() != 0 {
                    return Err(DecoderError::ud("0xc6/0xc7 with non-0 reg field"));
                }
                let dest = self.read_addressing(modrm, size)?;
                let src = self.read_immediate(size)?.into();

                Instr::Mov { dest, src }
            }
            0xc9 => Instr::Leave {
                size: self.prefixes.stack_size(),
            },
            0xd8..=0xdf => self.decode_fpu(byte)?,
            0xe3 => {
                let size = if self.prefixes.addr32() {
                    OpSize::Bits32
                } else {
                    OpSize::Bits64
                };
                let offset = self.read()? as i8;
                let target = self.rel_target(offset as i64);

                Instr::JumpCxz { size, target }
            }
            0xe8 => {
                let offset = self.read_u32()? as i32;
                let target = self.rel_target(offset as i64);

                Instr::Call { target }
            }
            0xe9 => {
                let offset = self.read_u32()? as i32;
                let target = self.rel_target(offset as i64);

                Instr::Jump { target }
            }
            0xeb => {
                let offset = self.read()? as i8;
                let target = self.rel_target(offset as i64);

                Instr::Jump { target }
            }
            0xf4 => Instr::Halt,
            0xf5 => Instr::SetFlag { kind: FlagOpKind::Cmc },
            0xf8 => Instr::SetFlag { kind: FlagOpKind::Clc },
            0xf9 => Instr::SetFlag { kind: FlagOpKind::Stc },
            0xfc => Instr::SetFlag { kind: FlagOpKind::Cld },
            0xfd => Instr::SetFlag { kind: FlagOpKind::Std },
            _ if bitpat!(1 1 1 1 0 1 1 _)(byte) => {
                // 0xF6 / 0xF7: test/not/neg/mul/imul/div/idiv group.
                let size = self.prefixes.sized(default_size_bit);
                let modrm = self.read_modrm()?;
                let operand = self.read_addressing(modrm, size)?;

                match modrm.reg_raw() {
                    0 => Instr::Test {
                        lhs: operand,
                        rhs: self.read_immediate(size)?.into(),
                    },
                    1 => return Err(DecoderError::ud("use of 0xf6/0xf7 with ext. opcode 1")),
                    2 => Instr::Not { operand },
                    3 => Instr::Neg { operand },
                    4 => Instr::Mul { operand },
                    5 => Instr::Imul { operand },
                    6 => Instr::Div { operand },
                    7 => Instr::Idiv { operand },
                    _ => unreachable!(),
                }
            }
            0xfe => {
                let modrm = self.read_modrm()?;
                let operand = self.read_addressing(modrm, OpSize::Bits8)?;
                match modrm.reg_raw() {
                    0 => Instr::Inc { operand },
                    1 => Instr::Dec { operand },
                    _ => return Err(DecoderError::ud("0xfe group with bad ext. opcode")),
                }
            }
            0xff => {
                // inc/dec/call/jmp/push group. Calls, jumps and pushes
                // always use 64-bit operands in long mode.
                let modrm = self.read_modrm()?;
                match modrm.reg_raw() {
                    0 | 1 => {
                        let operand = self.read_addressing(modrm, self.prefixes.op_size())?;
                        if modrm.reg_raw() == 0 {
                            Instr::Inc { operand }
                        } else {
                            Instr::Dec { operand }
                        }
                    }
                    2 => Instr::Call {
                        target: self.read_addressing(modrm, OpSize::Bits64)?,
                    },
                    4 => Instr::Jump {
                        target: self.read_addressing(modrm, OpSize::Bits64)?,
                    },
                    6 => Instr::Push {
                        operand: self.read_addressing(modrm, self.prefixes.stack_size())?,
                    },
                    _ => return Err(DecoderError::ud("0xff group with unsupported ext. opcode")),
                }
            }
            0x0f => self.decode_0f()?,
            _ => return Err(DecoderError::unknown_op(byte)),
        };

        Ok(instr)
    }

    /// Decodes a `0x0f` expansion opcode.
    fn decode_0f(&mut self) -> Result<Instr, DecoderError> {
        let byte = self.read()?;
        let sel = self.prefixes.sse_selector();

        let instr = match byte {
            0x05 => Instr::Syscall,
            0x0b => return Err(DecoderError::ud("ud2")),
            0x18..=0x1f => {
                // Hint nops (`0f 1f /0` is the canonical long nop); they
                // still consume a full ModR/M encoding.
                let modrm = self.read_modrm()?;
                self.read_addressing(modrm, OpSize::Bits32)?;
                Instr::Nop
            }
            0x10 | 0x11 => {
                let load = byte == 0x10;
                match sel {
                    SseSelector::None | SseSelector::Op66 => {
                        let kind = if sel == SseSelector::Op66 {
                            Mov128Kind::Upd
                        } else {
                            Mov128Kind::Ups
                        };
                        let (dst, src) = self.xmm_reg_rm(load)?;
                        Instr::Sse(SseInstr::Mov128 { kind, dst, src })
                    }
                    SseSelector::F3 | SseSelector::F2 => {
                        let double = sel == SseSelector::F2;
                        let size = if double { OpSize::Bits64 } else { OpSize::Bits32 };
                        let (dst, src) = self.xmm_reg_rm_sized(load, size)?;
                        Instr::Sse(SseInstr::MovScalar { double, dst, src })
                    }
                }
            }
            0x12 | 0x13 | 0x16 | 0x17 => self.decode_mov_half(byte, sel)?,
            0x14 | 0x15 => {
                // unpcklps/unpckhps and the pd forms. Bit for bit these are
                // the dword/qword lane interleaves, so they reuse those ops.
                let high = byte == 0x15;
                let op = match (sel, high) {
                    (SseSelector::None, false) => PackedIntOp::UnpckLDq,
                    (SseSelector::None, true) => PackedIntOp::UnpckHDq,
                    (SseSelector::Op66, false) => PackedIntOp::UnpckLQdq,
                    (SseSelector::Op66, true) => PackedIntOp::UnpckHQdq,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::PackedInt { op, dst, src })
            }
            0x28 | 0x29 => {
                let kind = match sel {
                    SseSelector::None => Mov128Kind::Aps,
                    SseSelector::Op66 => Mov128Kind::Apd,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_reg_rm(byte == 0x28)?;
                Instr::Sse(SseInstr::Mov128 { kind, dst, src })
            }
            0x2a => {
                let double = match sel {
                    SseSelector::F2 => true,
                    SseSelector::F3 => false,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let wide = self.prefixes.rex_w();
                let modrm = self.read_modrm()?;
                let xmm = self.xmm_reg_field(modrm);
                let size = if wide { OpSize::Bits64 } else { OpSize::Bits32 };
                let src = self.read_addressing(modrm, size)?;
                Instr::Sse(SseInstr::CvtFromInt {
                    double,
                    wide,
                    xmm,
                    src,
                })
            }
            0x2c | 0x2d => {
                let double = match sel {
                    SseSelector::F2 => true,
                    SseSelector::F3 => false,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let wide = self.prefixes.rex_w();
                let modrm = self.read_modrm()?;
                let gpr = self.reg_register(
                    modrm,
                    if wide { OpSize::Bits64 } else { OpSize::Bits32 },
                );
                let src = self.xmm_rm(
                    modrm,
                    if double { OpSize::Bits64 } else { OpSize::Bits32 },
                )?;
                Instr::Sse(SseInstr::CvtToInt {
                    double,
                    wide,
                    trunc: byte == 0x2c,
                    gpr,
                    src,
                })
            }
            0x2e | 0x2f => {
                let double = match sel {
                    SseSelector::None => false,
                    SseSelector::Op66 => true,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let modrm = self.read_modrm()?;
                let lhs = self.xmm_reg_field(modrm);
                let rhs = self.xmm_rm(
                    modrm,
                    if double { OpSize::Bits64 } else { OpSize::Bits32 },
                )?;
                Instr::Sse(SseInstr::Comis {
                    double,
                    unordered: byte == 0x2e,
                    lhs,
                    rhs,
                })
            }
            0x40..=0x4f => {
                let cc = ConditionCode::from_u8(byte & 0x0f).unwrap();
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let dest = self.reg_register(modrm, size);
                let src = self.read_addressing(modrm, size)?;

                Instr::MovIf { cc, dest, src }
            }
            0x50 => {
                let kind = match sel {
                    SseSelector::None => MovMskKind::Ps,
                    SseSelector::Op66 => MovMskKind::Pd,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let modrm = self.read_modrm()?;
                if !modrm.is_reg() {
                    return Err(DecoderError::ud("movmsk with memory operand"));
                }
                Instr::Sse(SseInstr::MovMsk {
                    kind,
                    gpr: self.reg_register(modrm, OpSize::Bits32),
                    src: modrm.rm_raw() | self.rex_b(),
                })
            }
            0x51 | 0x58 | 0x59 | 0x5c..=0x5f => {
                let op = match byte {
                    0x51 => SseArithOp::Sqrt,
                    0x58 => SseArithOp::Add,
                    0x59 => SseArithOp::Mul,
                    0x5c => SseArithOp::Sub,
                    0x5d => SseArithOp::Min,
                    0x5e => SseArithOp::Div,
                    _ => SseArithOp::Max,
                };
                let ty = self.sse_ty(sel);
                let (dst, src) = self.xmm_dst_src_ty(ty)?;
                Instr::Sse(SseInstr::Arith { op, ty, dst, src })
            }
            0x54..=0x57 => {
                let op = match byte {
                    0x54 => SseLogicOp::And,
                    0x55 => SseLogicOp::Andn,
                    0x56 => SseLogicOp::Or,
                    _ => SseLogicOp::Xor,
                };
                let double = match sel {
                    SseSelector::None => false,
                    SseSelector::Op66 => true,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::Logic {
                    op,
                    double,
                    dst,
                    src,
                })
            }
            0x5a => match sel {
                SseSelector::F3 => {
                    let (xmm, src) = self.xmm_dst_src_sized(OpSize::Bits32)?;
                    Instr::Sse(SseInstr::CvtScalar {
                        to_double: true,
                        xmm,
                        src,
                    })
                }
                SseSelector::F2 => {
                    let (xmm, src) = self.xmm_dst_src_sized(OpSize::Bits64)?;
                    Instr::Sse(SseInstr::CvtScalar {
                        to_double: false,
                        xmm,
                        src,
                    })
                }
                SseSelector::None | SseSelector::Op66 => {
                    let kind = if sel == SseSelector::None {
                        CvtPackedKind::Ps2Pd
                    } else {
                        CvtPackedKind::Pd2Ps
                    };
                    let (xmm, src) = self.xmm_dst_src()?;
                    Instr::Sse(SseInstr::CvtPacked { kind, xmm, src })
                }
            },
            0x5b => {
                let kind = match sel {
                    SseSelector::None => CvtPackedKind::Dq2Ps,
                    SseSelector::F3 => CvtPackedKind::Tps2Dq,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (xmm, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::CvtPacked { kind, xmm, src })
            }
            0x60..=0x6b | 0x6c | 0x6d => {
                use self::PackedIntOp::*;
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let op = match byte {
                    0x60 => UnpckLBw,
                    0x61 => UnpckLWd,
                    0x62 => UnpckLDq,
                    0x63 => PackSsWb,
                    0x64 => CmpGtB,
                    0x65 => CmpGtW,
                    0x66 => CmpGtD,
                    0x67 => PackUsWb,
                    0x68 => UnpckHBw,
                    0x69 => UnpckHWd,
                    0x6a => UnpckHDq,
                    0x6b => PackSsDw,
                    0x6c => UnpckLQdq,
                    _ => UnpckHQdq,
                };
                let (dst, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::PackedInt { op, dst, src })
            }
            0x6e => {
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let wide = self.prefixes.rex_w();
                let modrm = self.read_modrm()?;
                let xmm = self.xmm_reg_field(modrm);
                let size = if wide { OpSize::Bits64 } else { OpSize::Bits32 };
                let rm = self.read_addressing(modrm, size)?;
                Instr::Sse(SseInstr::MovD {
                    wide,
                    to_xmm: true,
                    xmm,
                    rm,
                })
            }
            0x6f | 0x7f => {
                let kind = match sel {
                    SseSelector::Op66 => Mov128Kind::Dqa,
                    SseSelector::F3 => Mov128Kind::Dqu,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_reg_rm(byte == 0x6f)?;
                Instr::Sse(SseInstr::Mov128 { kind, dst, src })
            }
            0x70 => {
                let kind = match sel {
                    SseSelector::Op66 => ShufKind::D,
                    SseSelector::F2 => ShufKind::Lw,
                    SseSelector::F3 => ShufKind::Hw,
                    SseSelector::None => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_dst_src()?;
                let control = self.read()?;
                Instr::Sse(SseInstr::Shuffle {
                    kind,
                    dst,
                    src,
                    control,
                })
            }
            0x71..=0x73 => {
                use self::PShiftOp::*;
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let modrm = self.read_modrm()?;
                if !modrm.is_reg() {
                    return Err(DecoderError::ud("packed shift group with memory operand"));
                }
                let op = match (byte, modrm.reg_raw()) {
                    (0x71, 2) => SrlW,
                    (0x71, 4) => SraW,
                    (0x71, 6) => SllW,
                    (0x72, 2) => SrlD,
                    (0x72, 4) => SraD,
                    (0x72, 6) => SllD,
                    (0x73, 2) => SrlQ,
                    (0x73, 3) => SrlDq,
                    (0x73, 6) => SllQ,
                    (0x73, 7) => SllDq,
                    _ => return Err(DecoderError::ud("bad packed shift ext. opcode")),
                };
                let dst = modrm.rm_raw() | self.rex_b();
                let count = PShiftCount::Imm(self.read()?);
                Instr::Sse(SseInstr::PShift { op, dst, count })
            }
            0x74..=0x76 => {
                use self::PackedIntOp::*;
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let op = match byte {
                    0x74 => CmpEqB,
                    0x75 => CmpEqW,
                    _ => CmpEqD,
                };
                let (dst, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::PackedInt { op, dst, src })
            }
            0x7e => match sel {
                SseSelector::F3 => {
                    let (dst, src) = self.xmm_reg_rm_sized(true, OpSize::Bits64)?;
                    Instr::Sse(SseInstr::MovQ { dst, src })
                }
                SseSelector::Op66 => {
                    let wide = self.prefixes.rex_w();
                    let modrm = self.read_modrm()?;
                    let xmm = self.xmm_reg_field(modrm);
                    let size = if wide { OpSize::Bits64 } else { OpSize::Bits32 };
                    let rm = self.read_addressing(modrm, size)?;
                    Instr::Sse(SseInstr::MovD {
                        wide,
                        to_xmm: false,
                        xmm,
                        rm,
                    })
                }
                _ => return Err(DecoderError::unknown_sse(byte)),
            },
            0x80..=0x8f => {
                // jcc near with 32-bit offset.
                let cc = ConditionCode::from_u8(byte & 0x0f).unwrap();
                let offset = self.read_u32()? as i32;
                let target = self.rel_target(offset as i64);

                Instr::JumpIf { cc, target }
            }
            0x90..=0x9f => {
                let cc = ConditionCode::from_u8(byte & 0x0f).unwrap();
                let modrm = self.read_modrm()?;
                let operand = self.read_addressing(modrm, OpSize::Bits8)?;

                Instr::SetIf { cc, operand }
            }
            0xa2 => Instr::Cpuid,
            0xa3 | 0xab | 0xb3 | 0xbb => {
                let op = match byte {
                    0xa3 => BitOp::Bt,
                    0xab => BitOp::Bts,
                    0xb3 => BitOp::Btr,
                    _ => BitOp::Btc,
                };
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let bit = self.reg_register(modrm, size).into();
                let operand = self.read_addressing(modrm, size)?;

                Instr::BitTest { op, operand, bit }
            }
            0xa4 | 0xa5 | 0xac | 0xad => {
                let left = byte & 0x08 == 0;
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let src = self.reg_register(modrm, size);
                let dest = self.read_addressing(modrm, size)?;
                let count: Operand = if byte & 1 == 0 {
                    Immediate::from(self.read()?).into()
                } else {
                    Register::new(reg::RCX, OpSize::Bits8).into()
                };

                Instr::ShiftD {
                    left,
                    dest,
                    src,
                    count,
                }
            }
            0xae => {
                let modrm = self.read_modrm()?;
                match (modrm.is_reg(), modrm.reg_raw()) {
                    (false, 2) => {
                        let mem = self.mem_location(modrm, OpSize::Bits32)?;
                        Instr::Sse(SseInstr::LdMxcsr(mem))
                    }
                    (false, 3) => {
                        let mem = self.mem_location(modrm, OpSize::Bits32)?;
                        Instr::Sse(SseInstr::StMxcsr(mem))
                    }
                    // lfence/mfence/sfence: nothing to order here.
                    (true, 5) | (true, 6) | (true, 7) => Instr::Nop,
                    _ => return Err(DecoderError::ud("unsupported 0f ae ext. opcode")),
                }
            }
            0xaf => {
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let dest = self.reg_register(modrm, size);
                let src = self.read_addressing(modrm, size)?;

                Instr::ImulTrunc {
                    dest,
                    src1: dest.into(),
                    src2: src,
                }
            }
            0xb0 | 0xb1 => {
                let size = if byte == 0xb0 {
                    OpSize::Bits8
                } else {
                    self.prefixes.op_size()
                };
                let modrm = self.read_modrm()?;
                let src = self.reg_register(modrm, size);
                let dest = self.read_addressing(modrm, size)?;

                Instr::CmpXchg { dest, src }
            }
            0xb6 | 0xb7 | 0xbe | 0xbf => {
                let src_size = if byte & 1 != 0 {
                    OpSize::Bits16
                } else {
                    OpSize::Bits8
                };
                let modrm = self.read_modrm()?;
                let dest = self.reg_register(modrm, self.prefixes.op_size());
                let src = self.read_addressing(modrm, src_size)?;

                if byte & 0x08 != 0 {
                    Instr::MovSx { dest, src }
                } else {
                    Instr::MovZx { dest, src }
                }
            }
            0xba => {
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let op = BitOp::from_u8(modrm.reg_raw())
                    .ok_or_else(|| DecoderError::ud("0f ba with non-bt ext. opcode"))?;
                let operand = self.read_addressing(modrm, size)?;
                let bit = Immediate::from(self.read()?).into();

                Instr::BitTest { op, operand, bit }
            }
            0xbc | 0xbd => {
                let size = self.prefixes.op_size();
                let modrm = self.read_modrm()?;
                let dest = self.reg_register(modrm, size);
                let src = self.read_addressing(modrm, size)?;

                Instr::BitScan {
                    reverse: byte == 0xbd,
                    dest,
                    src,
                }
            }
            0xc0 | 0xc1 => {
                let size = if byte == 0xc0 {
                    OpSize::Bits8
                } else {
                    self.prefixes.op_size()
                };
                let modrm = self.read_modrm()?;
                let src = self.reg_register(modrm, size);
                let dest = self.read_addressing(modrm, size)?;

                Instr::Xadd { dest, src }
            }
            0xc2 => {
                let ty = self.sse_ty(sel);
                let (dst, src) = self.xmm_dst_src_ty(ty)?;
                let predicate = self.read()? & 0x1f;
                Instr::Sse(SseInstr::Cmp {
                    ty,
                    dst,
                    src,
                    predicate,
                })
            }
            0xc6 => {
                let kind = match sel {
                    SseSelector::None => ShufKind::Ps,
                    SseSelector::Op66 => ShufKind::Pd,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_dst_src()?;
                let control = self.read()?;
                Instr::Sse(SseInstr::Shuffle {
                    kind,
                    dst,
                    src,
                    control,
                })
            }
            0xc8..=0xcf => {
                let size = self.prefixes.op_size();
                let reg = Register::new(byte & 0b111 | self.rex_b(), size);

                Instr::Bswap { reg }
            }
            0xd1..=0xd3 | 0xe1 | 0xe2 | 0xf1..=0xf3 => {
                use self::PShiftOp::*;
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let op = match byte {
                    0xd1 => SrlW,
                    0xd2 => SrlD,
                    0xd3 => SrlQ,
                    0xe1 => SraW,
                    0xe2 => SraD,
                    0xf1 => SllW,
                    0xf2 => SllD,
                    _ => SllQ,
                };
                let modrm = self.read_modrm()?;
                let dst = self.xmm_reg_field(modrm);
                let count = PShiftCount::Reg(self.xmm_rm(modrm, OpSize::Bits64)?);
                Instr::Sse(SseInstr::PShift { op, dst, count })
            }
            0xd6 => {
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let (dst, src) = self.xmm_reg_rm_sized(false, OpSize::Bits64)?;
                Instr::Sse(SseInstr::MovQ { dst, src })
            }
            0xd7 => {
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let modrm = self.read_modrm()?;
                if !modrm.is_reg() {
                    return Err(DecoderError::ud("pmovmskb with memory operand"));
                }
                Instr::Sse(SseInstr::MovMsk {
                    kind: MovMskKind::B,
                    gpr: self.reg_register(modrm, OpSize::Bits32),
                    src: modrm.rm_raw() | self.rex_b(),
                })
            }
            0xe6 => {
                let kind = match sel {
                    SseSelector::Op66 => CvtPackedKind::Tpd2Dq,
                    SseSelector::F3 => CvtPackedKind::Dq2Pd,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (xmm, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::CvtPacked { kind, xmm, src })
            }
            0xd4 | 0xd5 | 0xd8..=0xdf | 0xe4 | 0xe5 | 0xe8..=0xef | 0xf4 | 0xf6 | 0xf8..=0xfe => {
                use self::PackedIntOp::*;
                if sel != SseSelector::Op66 {
                    return Err(DecoderError::unknown_sse(byte));
                }
                let op = match byte {
                    0xd4 => AddQ,
                    0xd5 => MulLw,
                    0xd8 => SubUsB,
                    0xd9 => SubUsW,
                    0xda => MinUb,
                    0xdb => And,
                    0xdc => AddUsB,
                    0xdd => AddUsW,
                    0xde => MaxUb,
                    0xdf => Andn,
                    0xe4 => MulHuw,
                    0xe5 => MulHw,
                    0xe8 => SubSB,
                    0xe9 => SubSW,
                    0xea => MinSw,
                    0xeb => Or,
                    0xec => AddSB,
                    0xed => AddSW,
                    0xee => MaxSw,
                    0xef => Xor,
                    0xf4 => MulUdq,
                    0xf6 => Sadbw,
                    0xf8 => SubB,
                    0xf9 => SubW,
                    0xfa => SubD,
                    0xfb => SubQ,
                    0xfc => AddB,
                    0xfd => AddW,
                    0xfe => AddD,
                    _ => return Err(DecoderError::unknown_sse(byte)),
                };
                let (dst, src) = self.xmm_dst_src()?;
                Instr::Sse(SseInstr::PackedInt { op, dst, src })
            }
            _ => return Err(DecoderError::unknown_0f(byte)),
        };

        Ok(instr)
    }

    /// `0f 12/13/16/17`: the 64-bit half moves.
    fn decode_mov_half(&mut self, byte: u8, sel: SseSelector) -> Result<Instr, DecoderError> {
        let double = match sel {
            SseSelector::None => false,
            SseSelector::Op66 => true,
            _ => return Err(DecoderError::unknown_sse(byte)),
        };
        let high = byte & 0x04 != 0; // 16/17 move the high half
        let load = byte & 0x01 == 0; // 12/16 load into the register

        let modrm = self.read_modrm()?;
        let reg = XmmRm::Reg(self.xmm_reg_field(modrm));
        let rm = self.xmm_rm(modrm, OpSize::Bits64)?;

        if let XmmRm::Reg(_) = rm {
            if !load || double {
                return Err(DecoderError::ud("half move with register operand"));
            }
            // movhlps / movlhps.
            return Ok(Instr::Sse(SseInstr::MovHalf {
                double,
                dst: reg,
                dst_high: high,
                src: rm,
                src_high: !high,
            }));
        }

        Ok(if load {
            Instr::Sse(SseInstr::MovHalf {
                double,
                dst: reg,
                dst_high: high,
                src: rm,
                src_high: false,
            })
        } else {
            Instr::Sse(SseInstr::MovHalf {
                double,
                dst: rm,
                dst_high: false,
                src: reg,
                src_high: high,
            })
        })
    }

    /// Decodes the x87 escape range (`d8`-`df`).
    fn decode_fpu(&mut self, esc: u8) -> Result<Instr, DecoderError> {
        use self::FpuInstr as F;

        let modrm = self.read_modrm()?;
        let reg = modrm.reg_raw();
        let i = modrm.rm_raw(); // st(i) in register forms

        if !modrm.is_reg() {
            // Memory forms.
            let instr = match (esc, reg) {
                (0xd8, _) | (0xdc, _) => {
                    let size = if esc == 0xd8 { OpSize::Bits32 } else { OpSize::Bits64 };
                    let mem = self.mem_location(modrm, size)?;
                    let m32 = esc == 0xd8;
                    match reg {
                        2 | 3 => F::Com {
                            src: if m32 {
                                FpuComSrc::M32(mem)
                            } else {
                                FpuComSrc::M64(mem)
                            },
                            pops: (reg == 3) as u8,
                            unordered: false,
                            eflags: false,
                        },
                        _ => F::Arith {
                            op: fpu_arith_op(reg),
                            form: if m32 { FpuForm::M32(mem) } else { FpuForm::M64(mem) },
                        },
                    }
                }
                (0xd9, 0) => F::Load(FpuLoad::M32(self.mem_location(modrm, OpSize::Bits32)?)),
                (0xd9, 2) | (0xd9, 3) => F::Store {
                    dst: FpuStore::M32(self.mem_location(modrm, OpSize::Bits32)?),
                    pop: reg == 3,
                },
                (0xd9, 4) => F::LdEnv(self.mem_location(modrm, OpSize::Bits32)?),
                (0xd9, 5) => F::LdCw(self.mem_location(modrm, OpSize::Bits16)?),
                (0xd9, 6) => F::StEnv(self.mem_location(modrm, OpSize::Bits32)?),
                (0xd9, 7) => F::StCw(self.mem_location(modrm, OpSize::Bits16)?),
                (0xda, 2) | (0xda, 3) | (0xde, 2) | (0xde, 3) => {
                    return Err(DecoderError::ud("ficom is not supported"));
                }
                (0xda, _) => F::Arith {
                    op: fpu_arith_op(reg),
                    form: FpuForm::I32(self.mem_location(modrm, OpSize::Bits32)?),
                },
                (0xdb, 0) => F::Load(FpuLoad::I32(self.mem_location(modrm, OpSize::Bits32)?)),
                (0xdb, 2) | (0xdb, 3) => F::Store {
                    dst: FpuStore::I32(self.mem_location(modrm, OpSize::Bits32)?),
                    pop: reg == 3,
                },
                (0xdb, 5) => F::Load(FpuLoad::M80(self.mem_location(modrm, OpSize::Bits64)?)),
                (0xdb, 7) => F::Store {
                    dst: FpuStore::M80(self.mem_location(modrm, OpSize::Bits64)?),
                    pop: true,
                },
                (0xdd, 0) => F::Load(FpuLoad::M64(self.mem_location(modrm, OpSize::Bits64)?)),
                (0xdd, 2) | (0xdd, 3) => F::Store {
                    dst: FpuStore::M64(self.mem_location(modrm, OpSize::Bits64)?),
                    pop: reg == 3,
                },
                (0xdd, 7) => F::StSw(FpuStswDst::M16(self.mem_location(modrm, OpSize::Bits16)?)),
                (0xde, _) => F::Arith {
                    op: fpu_arith_op(reg),
                    form: FpuForm::I16(self.mem_location(modrm, OpSize::Bits16)?),
                },
                (0xdf, 0) => F::Load(FpuLoad::I16(self.mem_location(modrm, OpSize::Bits16)?)),
                (0xdf, 2) | (0xdf, 3) => F::Store {
                    dst: FpuStore::I16(self.mem_location(modrm, OpSize::Bits16)?),
                    pop: reg == 3,
                },
                (0xdf, 5) => F::Load(FpuLoad::I64(self.mem_location(modrm, OpSize::Bits64)?)),
                (0xdf, 7) => F::Store {
                    dst: FpuStore::I64(self.mem_location(modrm, OpSize::Bits64)?),
                    pop: true,
                },
                _ => return Err(DecoderError::unknown_fpu(esc, modrm.0)),
            };
            return Ok(Instr::Fpu(instr));
        }

        // Register forms, keyed off the whole ModR/M byte.
        let instr = match (esc, modrm.0) {
            (0xd8, 0xd0..=0xd7) | (0xd8, 0xd8..=0xdf) => F::Com {
                src: FpuComSrc::St(i),
                pops: (modrm.0 >= 0xd8) as u8,
                unordered: false,
                eflags: false,
            },
            (0xd8, _) => F::Arith {
                op: fpu_arith_op(reg),
                form: FpuForm::St0Sti(i),
            },
            (0xd9, 0xc0..=0xc7) => F::Load(FpuLoad::St(i)),
            (0xd9, 0xc8..=0xcf) => F::Xch(i),
            (0xd9, 0xd0) => F::Nop,
            (0xd9, 0xe0) => F::Unary(FpuUnary::Chs),
            (0xd9, 0xe1) => F::Unary(FpuUnary::Abs),
            (0xd9, 0xe4) => F::Tst,
            (0xd9, 0xe5) => F::Xam,
            (0xd9, 0xe8) => F::Load(FpuLoad::One),
            (0xd9, 0xe9) => F::Load(FpuLoad::L2t),
            (0xd9, 0xea) => F::Load(FpuLoad::L2e),
            (0xd9, 0xeb) => F::Load(FpuLoad::Pi),
            (0xd9, 0xec) => F::Load(FpuLoad::Lg2),
            (0xd9, 0xed) => F::Load(FpuLoad::Ln2),
            (0xd9, 0xee) => F::Load(FpuLoad::Zero),
            (0xd9, 0xf0) => F::Unary(FpuUnary::Exp2M1),
            (0xd9, 0xf1) => F::Unary(FpuUnary::Yl2x),
            (0xd9, 0xf2) => F::Unary(FpuUnary::Ptan),
            (0xd9, 0xf3) => F::Unary(FpuUnary::Patan),
            (0xd9, 0xf4) => F::Unary(FpuUnary::Xtract),
            (0xd9, 0xf5) => F::Unary(FpuUnary::Prem1),
            (0xd9, 0xf6) => F::DecStp,
            (0xd9, 0xf7) => F::IncStp,
            (0xd9, 0xf8) => F::Unary(FpuUnary::Prem),
            (0xd9, 0xf9) => F::Unary(FpuUnary::Yl2xp1),
            (0xd9, 0xfa) => F::Unary(FpuUnary::Sqrt),
            (0xd9, 0xfb) => F::Unary(FpuUnary::SinCos),
            (0xd9, 0xfc) => F::Unary(FpuUnary::Rndint),
            (0xd9, 0xfd) => F::Unary(FpuUnary::Scale),
            (0xd9, 0xfe) => F::Unary(FpuUnary::Sin),
            (0xd9, 0xff) => F::Unary(FpuUnary::Cos),
            (0xda, 0xc0..=0xdf) => F::Cmov {
                cc: fpu_cmov_cc(modrm.0, false),
                i,
            },
            (0xda, 0xe9) => F::Com {
                src: FpuComSrc::St(1),
                pops: 2,
                unordered: true,
                eflags: false,
            },
            (0xdb, 0xc0..=0xdf) => F::Cmov {
                cc: fpu_cmov_cc(modrm.0, true),
                i,
            },
            (0xdb, 0xe2) => F::Nop, // fnclex; exceptions are never pending
            (0xdb, 0xe3) => F::Init,
            (0xdb, 0xe8..=0xef) | (0xdb, 0xf0..=0xf7) => F::Com {
                src: FpuComSrc::St(i),
                pops: 0,
                unordered: modrm.0 < 0xf0,
                eflags: true,
            },
            (0xdc, 0xc0..=0xcf) | (0xdc, 0xe0..=0xff) => F::Arith {
                op: match modrm.0 >> 3 & 7 {
                    0 => FpuArithOp::Add,
                    1 => FpuArithOp::Mul,
                    // The direction of sub/div flips relative to d8.
                    4 => FpuArithOp::Subr,
                    5 => FpuArithOp::Sub,
                    6 => FpuArithOp::Divr,
                    _ => FpuArithOp::Div,
                },
                form: FpuForm::StiSt0 { i, pop: false },
            },
            (0xdd, 0xc0..=0xc7) => F::Free(i),
            (0xdd, 0xd0..=0xd7) | (0xdd, 0xd8..=0xdf) => F::Store {
                dst: FpuStore::St(i),
                pop: modrm.0 >= 0xd8,
            },
            (0xdd, 0xe0..=0xe7) | (0xdd, 0xe8..=0xef) => F::Com {
                src: FpuComSrc::St(i),
                pops: (modrm.0 >= 0xe8) as u8,
                unordered: true,
                eflags: false,
            },
            (0xde, 0xd9) => F::Com {
                src: FpuComSrc::St(1),
                pops: 2,
                unordered: false,
                eflags: false,
            },
            (0xde, 0xc0..=0xcf) | (0xde, 0xe0..=0xff) => F::Arith {
                op: match modrm.0 >> 3 & 7 {
                    0 => FpuArithOp::Add,
                    1 => FpuArithOp::Mul,
                    4 => FpuArithOp::Subr,
                    5 => FpuArithOp::Sub,
                    6 => FpuArithOp::Divr,
                    _ => FpuArithOp::Div,
                },
                form: FpuForm::StiSt0 { i, pop: true },
            },
            (0xdf, 0xe0) => F::StSw(FpuStswDst::Ax),
            (0xdf, 0xe8..=0xef) | (0xdf, 0xf0..=0xf7) => F::Com {
                src: FpuComSrc::St(i),
                pops: 1,
                unordered: modrm.0 < 0xf0,
                eflags: true,
            },
            _ => return Err(DecoderError::unknown_fpu(esc, modrm.0)),
        };

        Ok(Instr::Fpu(instr))
    }

    // --- operand helpers ---------------------------------------------

    fn rex_b(&self) -> u8 {
        self.prefixes.rex.map_or(0, |r| (r.b as u8) << 3)
    }

    fn rex_b_set(&self) -> bool {
        self.rex_b() != 0
    }

    fn rex_r(&self) -> u8 {
        self.prefixes.rex.map_or(0, |r| (r.r as u8) << 3)
    }

    fn rex_x(&self) -> u8 {
        self.prefixes.rex.map_or(0, |r| (r.x as u8) << 3)
    }

    /// Byte-register lookup honoring the legacy high-byte aliasing: without
    /// a REX prefix, indices 4-7 name `ah`/`ch`/`dh`/`bh`.
    fn byte_reg(&self, index: u8) -> Register {
        if !self.prefixes.has_rex() && (4..8).contains(&index) {
            Register::high_byte(index - 4)
        } else {
            Register::new(index, OpSize::Bits8)
        }
    }

    /// The register named by the ModR/M `reg` field.
    fn reg_register(&self, modrm: ModRm, size: OpSize) -> Register {
        let index = modrm.reg_raw() | self.rex_r();
        if size == OpSize::Bits8 {
            self.byte_reg(index)
        } else {
            Register::new(index, size)
        }
    }

    /// The register named by the ModR/M `r/m` field (register mode only).
    fn rm_register(&self, modrm: ModRm, size: OpSize) -> Register {
        let index = modrm.rm_raw() | self.rex_b();
        if size == OpSize::Bits8 {
            self.byte_reg(index)
        } else {
            Register::new(index, size)
        }
    }

    /// Decodes the `r/m` side of a ModR/M byte into an operand.
    fn read_addressing(&mut self, modrm: ModRm, size: OpSize) -> Result<Operand, DecoderError> {
        if modrm.is_reg() {
            Ok(self.rm_register(modrm, size).into())
        } else {
            Ok(self.mem_location(modrm, size)?.into())
        }
    }

    /// Decodes a memory operand: base, optional SIB, displacement.
    fn mem_location(&mut self, modrm: ModRm, size: OpSize) -> Result<MemoryLocation, DecoderError> {
        debug_assert!(!modrm.is_reg());

        let segment = self.prefixes.segment();
        let addr32 = self.prefixes.addr32();

        if modrm.mod_raw() == 0 && modrm.rm_raw() == 0b101 {
            // RIP-relative with 32-bit displacement.
            let disp = self.read_u32()? as i32 as i64;
            return Ok(MemoryLocation {
                size,
                segment,
                base: Base::Rip,
                index: None,
                disp,
                addr32,
            });
        }

        if modrm.rm_raw() == 0b100 {
            // SIB byte.
            let sib = self.read()?;
            let scale = sib >> 6;
            let index_raw = sib >> 3 & 0b111;
            let base_raw = sib & 0b111;

            // Index 4 without REX.X encodes "no index"; with REX.X it is r12.
            let index = if index_raw == 4 && self.rex_x() == 0 {
                None
            } else {
                Some((index_raw | self.rex_x(), scale))
            };

            let (base, disp) = if base_raw == 0b101 && modrm.mod_raw() == 0 {
                (Base::None, self.read_u32()? as i32 as i64)
            } else {
                (Base::Reg(base_raw | self.rex_b()), self.read_disp(modrm)?)
            };

            return Ok(MemoryLocation {
                size,
                segment,
                base,
                index,
                disp,
                addr32,
            });
        }

        Ok(MemoryLocation {
            size,
            segment,
            base: Base::Reg(modrm.rm_raw() | self.rex_b()),
            index: None,
            disp: self.read_disp(modrm)?,
            addr32,
        })
    }

    fn read_disp(&mut self, modrm: ModRm) -> Result<i64, DecoderError> {
        Ok(match modrm.mod_raw() {
            0 => 0,
            1 => self.read()? as i8 as i64,
            2 => self.read_u32()? as i32 as i64,
            _ => unreachable!(),
        })
    }

    /// Folds a relative branch displacement into an absolute target operand.
    /// The displacement is always the final field of its instruction, so
    /// `pos` is the post-decode `rip` here.
    fn rel_target(&self, offset: i64) -> Operand {
        Immediate::Imm64(self.pos.wrapping_add(offset as u64) as i64).into()
    }

    /// Reads the usual immediate for an operand size: 8/16/32 bits verbatim,
    /// 64-bit operands take a 32-bit immediate sign-extended.
    fn read_immediate(&mut self, size: OpSize) -> Result<Immediate, DecoderError> {
        Ok(match size {
            OpSize::Bits8 => self.read()?.into(),
            OpSize::Bits16 => self.read_u16()?.into(),
            OpSize::Bits32 => self.read_u32()?.into(),
            OpSize::Bits64 => Immediate::Imm64(self.read_u32()? as i32 as i64),
        })
    }

    /// Reads a full-width immediate (only `b8+r` with REX.W has one).
    fn read_immediate_full(&mut self, size: OpSize) -> Result<Immediate, DecoderError> {
        Ok(match size {
            OpSize::Bits64 => self.read_u64()?.into(),
            _ => self.read_immediate(size)?,
        })
    }

    // --- SSE operand helpers -----------------------------------------

    fn sse_ty(&self, sel: SseSelector) -> SseTy {
        match sel {
            SseSelector::None => SseTy::Ps,
            SseSelector::Op66 => SseTy::Pd,
            SseSelector::F3 => SseTy::Ss,
            SseSelector::F2 => SseTy::Sd,
        }
    }

    fn xmm_reg_field(&self, modrm: ModRm) -> u8 {
        modrm.reg_raw() | self.rex_r()
    }

    /// The `r/m` side as an xmm register or memory location.
    fn xmm_rm(&mut self, modrm: ModRm, mem_size: OpSize) -> Result<XmmRm, DecoderError> {
        if modrm.is_reg() {
            Ok(XmmRm::Reg(modrm.rm_raw() | self.rex_b()))
        } else {
            Ok(XmmRm::Mem(self.mem_location(modrm, mem_size)?))
        }
    }

    /// `reg` and `r/m` xmm operands in (dst, src) order for a load, or
    /// (src, dst) flipped for a store.
    fn xmm_reg_rm(&mut self, load: bool) -> Result<(XmmRm, XmmRm), DecoderError> {
        self.xmm_reg_rm_sized(load, OpSize::Bits64)
    }

    fn xmm_reg_rm_sized(
        &mut self,
        load: bool,
        mem_size: OpSize,
    ) -> Result<(XmmRm, XmmRm), DecoderError> {
        let modrm = self.read_modrm()?;
        let reg = XmmRm::Reg(self.xmm_reg_field(modrm));
        let rm = self.xmm_rm(modrm, mem_size)?;
        Ok(if load { (reg, rm) } else { (rm, reg) })
    }

    /// Common `op xmm, xmm/m128` shape.
    fn xmm_dst_src(&mut self) -> Result<(u8, XmmRm), DecoderError> {
        self.xmm_dst_src_sized(OpSize::Bits64)
    }

    fn xmm_dst_src_sized(&mut self, mem_size: OpSize) -> Result<(u8, XmmRm), DecoderError> {
        let modrm = self.read_modrm()?;
        let dst = self.xmm_reg_field(modrm);
        let src = self.xmm_rm(modrm, mem_size)?;
        Ok((dst, src))
    }

    /// Like `xmm_dst_src`, with the memory width of a scalar form.
    fn xmm_dst_src_ty(&mut self, ty: SseTy) -> Result<(u8, XmmRm), DecoderError> {
        let mem_size = match ty {
            SseTy::Ss => OpSize::Bits32,
            _ => OpSize::Bits64,
        };
        self.xmm_dst_src_sized(mem_size)
    }

    // --- raw byte reading --------------------------------------------

    /// Read a single byte from the instruction stream.
    fn read(&mut self) -> Result<u8, DecoderError> {
        if self.len == 15 {
            // This would read the 16th byte, exceeding the length limit.
            return Err(DecoderError::ud("instruction exceeds the 15-byte limit"));
        }

        let b = self.mem.read_u8(self.pos)?;
        self.pos += 1;
        self.len += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, DecoderError> {
        let lo = self.read()? as u16;
        let hi = self.read()? as u16;
        Ok(hi << 8 | lo)
    }

    fn read_u32(&mut self) -> Result<u32, DecoderError> {
        let lo = self.read_u16()? as u32;
        let hi = self.read_u16()? as u32;
        Ok(hi << 16 | lo)
    }

    fn read_u64(&mut self) -> Result<u64, DecoderError> {
        let lo = self.read_u32()? as u64;
        let hi = self.read_u32()? as u64;
        Ok(hi << 32 | lo)
    }

    fn read_modrm(&mut self) -> Result<ModRm, DecoderError> {
        Ok(ModRm(self.read()?))
    }
}

/// The arithmetic selector shared by the x87 memory and `d8` register forms.
fn fpu_arith_op(reg: u8) -> FpuArithOp {
    match reg {
        0 => FpuArithOp::Add,
        1 => FpuArithOp::Mul,
        4 => FpuArithOp::Sub,
        5 => FpuArithOp::Subr,
        6 => FpuArithOp::Div,
        _ => FpuArithOp::Divr,
    }
}

/// `fcmovcc` condition selection: `da` holds b/e/be/u, `db` their negations.
fn fpu_cmov_cc(modrm: u8, negated: bool) -> ConditionCode {
    let row = modrm >> 3 & 3;
    let positive = match row {
        0 => ConditionCode::Carry,
        1 => ConditionCode::Equal,
        2 => ConditionCode::BelowOrEqual,
        _ => ConditionCode::Parity,
    };
    if !negated {
        return positive;
    }
    match positive {
        ConditionCode::Carry => ConditionCode::NotCarry,
        ConditionCode::Equal => ConditionCode::NotEqual,
        ConditionCode::BelowOrEqual => ConditionCode::Above,
        _ => ConditionCode::NotParity,
    }
}

/// A Mod-Reg-R/M byte.
#[derive(Debug, Copy, Clone)]
pub struct ModRm(pub u8);

impl ModRm {
    fn mod_raw(&self) -> u8 {
        self.0 >> 6
    }

    /// Whether the `r/m` field names a register (`mod == 11`).
    fn is_reg(&self) -> bool {
        self.mod_raw() == 0b11
    }

    fn reg_raw(&self) -> u8 {
        self.0 >> 3 & 0b111
    }

    fn rm_raw(&self) -> u8 {
        self.0 & 0b111
    }
}

/// Error type returned by the decoder.
///
/// Either an encoding this core does not support (the equivalent of `#UD`)
/// or a memory fault while fetching instruction bytes. Both are fatal.
#[derive(Debug)]
pub enum DecoderError {
    /// Memory error while reading machine code bytes.
    Memory(MemoryError),
    /// Unsupported or invalid instruction encoding.
    Undefined(String),
}

impl DecoderError {
    #[cold]
    pub(crate) fn ud<S: AsRef<str>>(why: S) -> Self {
        DecoderError::Undefined(why.as_ref().to_string())
    }

    #[cold]
    fn unknown_op(byte: u8) -> Self {
        DecoderError::Undefined(format!("unsupported opcode {:#04x}", byte))
    }

    #[cold]
    fn unknown_0f(byte: u8) -> Self {
        DecoderError::Undefined(format!("unsupported opcode 0f {:02x}", byte))
    }

    #[cold]
    fn unknown_sse(byte: u8) -> Self {
        DecoderError::Undefined(format!(
            "unsupported prefix combination for opcode 0f {:02x}",
            byte
        ))
    }

    #[cold]
    fn unknown_fpu(esc: u8, modrm: u8) -> Self {
        DecoderError::Undefined(format!("unsupported x87 encoding {:02x} {:02x}", esc, modrm))
    }
}

impl From<MemoryError> for DecoderError {
    #[cold]
    fn from(e: MemoryError) -> Self {
        DecoderError::Memory(e)
    }
}
