//! SSE/SSE2 executor.
//!
//! All lane traffic goes through the endian-safe accessors on [`Xmm`];
//! float corner cases (NaN selection, min/max tie rules, saturating
//! conversions) are spelled out rather than left to whatever the host FPU
//! does, so results match on every platform.

use crate::cpu::flags::Flags;
use crate::cpu::instr::*;
use crate::cpu::interpret::{FaultKind, Hooks, Interpreter};
use crate::cpu::state::Xmm;

/// Relation bitmask used by the 32-entry compare-predicate table.
const REL_GT: u8 = 1;
const REL_LT: u8 = 2;
const REL_EQ: u8 = 4;
const REL_UN: u8 = 8;

/// Truth table for `cmp<pred>`: predicates 16..=31 repeat 0..=15 with the
/// signaling behavior flipped, which an emulator without exceptions cannot
/// distinguish.
const CMP_TABLE: [u8; 16] = [
    REL_EQ,
    REL_LT,
    REL_LT | REL_EQ,
    REL_UN,
    REL_GT | REL_LT | REL_UN,
    REL_GT | REL_EQ | REL_UN,
    REL_GT | REL_UN,
    REL_GT | REL_LT | REL_EQ,
    REL_EQ | REL_UN,
    REL_LT | REL_UN,
    REL_LT | REL_EQ | REL_UN,
    0,
    REL_GT | REL_LT,
    REL_GT | REL_EQ,
    REL_GT,
    REL_GT | REL_LT | REL_EQ | REL_UN,
];

fn relation64(a: f64, b: f64) -> u8 {
    if a.is_nan() || b.is_nan() {
        REL_UN
    } else if a < b {
        REL_LT
    } else if a > b {
        REL_GT
    } else {
        REL_EQ
    }
}

fn quiet64(v: f64) -> f64 {
    f64::from_bits(v.to_bits() | 1 << 51)
}

fn quiet32(v: f32) -> f32 {
    f32::from_bits(v.to_bits() | 1 << 22)
}

/// Scalar double op with the architectural corner cases: the first NaN wins
/// (quieted, sign preserved); min/max return the second source on NaN or
/// equal inputs.
fn arith64(op: SseArithOp, a: f64, b: f64) -> f64 {
    match op {
        SseArithOp::Sqrt => {
            return if b.is_nan() { quiet64(b) } else { b.sqrt() };
        }
        SseArithOp::Min => return if a < b { a } else { b },
        SseArithOp::Max => return if a > b { a } else { b },
        _ => {}
    }
    if a.is_nan() {
        return quiet64(a);
    }
    if b.is_nan() {
        return quiet64(b);
    }
    match op {
        SseArithOp::Add => a + b,
        SseArithOp::Sub => a - b,
        SseArithOp::Mul => a * b,
        SseArithOp::Div => a / b,
        _ => unreachable!(),
    }
}

fn arith32(op: SseArithOp, a: f32, b: f32) -> f32 {
    match op {
        SseArithOp::Sqrt => {
            return if b.is_nan() { quiet32(b) } else { b.sqrt() };
        }
        SseArithOp::Min => return if a < b { a } else { b },
        SseArithOp::Max => return if a > b { a } else { b },
        _ => {}
    }
    if a.is_nan() {
        return quiet32(a);
    }
    if b.is_nan() {
        return quiet32(b);
    }
    match op {
        SseArithOp::Add => a + b,
        SseArithOp::Sub => a - b,
        SseArithOp::Mul => a * b,
        SseArithOp::Div => a / b,
        _ => unreachable!(),
    }
}

/// Float-to-signed conversion with the saturation rule: negative overflow
/// clamps to the minimum, positive overflow and NaN to the maximum.
fn f64_to_i32(v: f64, trunc: bool) -> i32 {
    if v.is_nan() {
        return i32::MAX;
    }
    let r = if trunc { v.trunc() } else { round_ties_even64(v) };
    r as i32 // saturating cast
}

fn f64_to_i64(v: f64, trunc: bool) -> i64 {
    if v.is_nan() {
        return i64::MAX;
    }
    let r = if trunc { v.trunc() } else { round_ties_even64(v) };
    r as i64
}

fn f32_to_i32(v: f32, trunc: bool) -> i32 {
    if v.is_nan() {
        return i32::MAX;
    }
    let r = if trunc { v.trunc() } else { round_ties_even32(v) };
    r as i32
}

fn f32_to_i64(v: f32, trunc: bool) -> i64 {
    if v.is_nan() {
        return i64::MAX;
    }
    let r = if trunc { v.trunc() } else { round_ties_even32(v) };
    r as i64
}

fn round_ties_even64(v: f64) -> f64 {
    let r = v.round();
    if (r - v).abs() == 0.5 && r % 2.0 != 0.0 {
        r - (r - v) * 2.0
    } else {
        r
    }
}

fn round_ties_even32(v: f32) -> f32 {
    let r = v.round();
    if (r - v).abs() == 0.5 && r % 2.0 != 0.0 {
        r - (r - v) * 2.0
    } else {
        r
    }
}

impl<H: Hooks> Interpreter<H> {
    /// Reads an xmm-or-memory operand as a whole 128-bit value.
    fn read_xmm128(&self, rm: &XmmRm) -> Result<Xmm, FaultKind> {
        Ok(match rm {
            XmmRm::Reg(i) => *self.state().xmm(*i),
            XmmRm::Mem(mem) => {
                let mut bytes = [0; 16];
                self.mem().read_bytes(self.ea(mem), &mut bytes)?;
                Xmm::from_bytes(bytes)
            }
        })
    }

    fn write_xmm128(&mut self, rm: &XmmRm, value: Xmm) -> Result<(), FaultKind> {
        match rm {
            XmmRm::Reg(i) => *self.state_mut().xmm_mut(*i) = value,
            XmmRm::Mem(mem) => {
                let addr = self.ea(mem);
                self.mem_mut().write_bytes(addr, &value.bytes())?;
            }
        }
        Ok(())
    }

    /// Low 64 bits of an xmm-or-memory operand.
    fn read_xmm_u64(&self, rm: &XmmRm) -> Result<u64, FaultKind> {
        Ok(match rm {
            XmmRm::Reg(i) => self.state().xmm(*i).u64(0),
            XmmRm::Mem(mem) => self.mem().read_u64(self.ea(mem))?,
        })
    }

    fn read_xmm_u32(&self, rm: &XmmRm) -> Result<u32, FaultKind> {
        Ok(match rm {
            XmmRm::Reg(i) => self.state().xmm(*i).u32(0),
            XmmRm::Mem(mem) => self.mem().read_u32(self.ea(mem))?,
        })
    }

    pub(crate) fn exec_sse(&mut self, instr: &SseInstr) -> Result<(), FaultKind> {
        match instr {
            SseInstr::Mov128 { kind: _, dst, src } => {
                let value = self.read_xmm128(src)?;
                self.write_xmm128(dst, value)?;
            }
            SseInstr::MovScalar { double, dst, src } => {
                match (dst, src) {
                    (XmmRm::Reg(d), XmmRm::Mem(_)) => {
                        // Loads zero the unreferenced upper lanes.
                        let mut out = Xmm::default();
                        if *double {
                            out.set_u64(0, self.read_xmm_u64(src)?);
                        } else {
                            out.set_u32(0, self.read_xmm_u32(src)?);
                        }
                        *self.state_mut().xmm_mut(*d) = out;
                    }
                    (XmmRm::Reg(d), XmmRm::Reg(_)) => {
                        // Register-to-register only replaces lane 0.
                        if *double {
                            let v = self.read_xmm_u64(src)?;
                            self.state_mut().xmm_mut(*d).set_u64(0, v);
                        } else {
                            let v = self.read_xmm_u32(src)?;
                            self.state_mut().xmm_mut(*d).set_u32(0, v);
                        }
                    }
                    (XmmRm::Mem(mem), _) => {
                        let addr = self.ea(mem);
                        if *double {
                            let v = self.read_xmm_u64(src)?;
                            self.mem_mut().write_u64(addr, v)?;
                        } else {
                            let v = self.read_xmm_u32(src)?;
                            self.mem_mut().write_u32(addr, v)?;
                        }
                    }
                }
            }
            SseInstr::MovHalf {
                double: _,
                dst,
                dst_high,
                src,
                src_high,
            } => {
                let value = match src {
                    XmmRm::Reg(i) => self.state().xmm(*i).u64(*src_high as usize),
                    XmmRm::Mem(mem) => self.mem().read_u64(self.ea(mem))?,
                };
                match dst {
                    XmmRm::Reg(i) => {
                        self.state_mut().xmm_mut(*i).set_u64(*dst_high as usize, value)
                    }
                    XmmRm::Mem(mem) => {
                        let addr = self.ea(mem);
                        self.mem_mut().write_u64(addr, value)?;
                    }
                }
            }
            SseInstr::MovD {
                wide,
                to_xmm,
                xmm,
                rm,
            } => {
                if *to_xmm {
                    let value = self.read_operand(rm)?;
                    let mut out = Xmm::default();
                    out.set_u64(0, if *wide { value } else { value & 0xffff_ffff });
                    *self.state_mut().xmm_mut(*xmm) = out;
                } else {
                    let value = if *wide {
                        self.state().xmm(*xmm).u64(0)
                    } else {
                        self.state().xmm(*xmm).u32(0) as u64
                    };
                    self.write_operand(rm, value)?;
                }
            }
            SseInstr::MovQ { dst, src } => {
                let value = self.read_xmm_u64(src)?;
                match dst {
                    XmmRm::Reg(i) => {
                        let mut out = Xmm::default();
                        out.set_u64(0, value);
                        *self.state_mut().xmm_mut(*i) = out;
                    }
                    XmmRm::Mem(mem) => {
                        let addr = self.ea(mem);
                        self.mem_mut().write_u64(addr, value)?;
                    }
                }
            }
            SseInstr::Arith { op, ty, dst, src } => self.sse_arith(*op, *ty, *dst, src)?,
            SseInstr::Logic {
                op,
                double: _,
                dst,
                src,
            } => {
                let b = self.read_xmm128(src)?;
                let x = self.state_mut().xmm_mut(*dst);
                for lane in 0..2 {
                    let a = x.u64(lane);
                    let v = match op {
                        SseLogicOp::And => a & b.u64(lane),
                        SseLogicOp::Andn => !a & b.u64(lane),
                        SseLogicOp::Or => a | b.u64(lane),
                        SseLogicOp::Xor => a ^ b.u64(lane),
                    };
                    x.set_u64(lane, v);
                }
            }
            SseInstr::Cmp {
                ty,
                dst,
                src,
                predicate,
            } => self.sse_cmp(*ty, *dst, src, *predicate)?,
            SseInstr::Comis {
                double,
                unordered: _,
                lhs,
                rhs,
            } => {
                let a = self.state().xmm(*lhs);
                let rel = if *double {
                    relation64(a.f64(0), f64::from_bits(self.read_xmm_u64(rhs)?))
                } else {
                    let b = f32::from_bits(self.read_xmm_u32(rhs)?);
                    relation64(a.f32(0) as f64, b as f64)
                };
                let flags = self.state_mut().flags_mut();
                flags.remove(Flags::OF | Flags::AF | Flags::SF);
                flags.set(Flags::ZF, rel & (REL_EQ | REL_UN) != 0);
                flags.set(Flags::PF, rel == REL_UN);
                flags.set(Flags::CF, rel & (REL_LT | REL_UN) != 0);
            }
            SseInstr::CvtFromInt {
                double,
                wide,
                xmm,
                src,
            } => {
                let raw = self.read_operand(src)?;
                let int = if *wide { raw as i64 } else { raw as u32 as i32 as i64 };
                let x = self.state_mut().xmm_mut(*xmm);
                if *double {
                    x.set_f64(0, int as f64);
                } else {
                    x.set_f32(0, int as f32);
                }
            }
            SseInstr::CvtToInt {
                double,
                wide,
                trunc,
                gpr,
                src,
            } => {
                let value = if *double {
                    let v = f64::from_bits(self.read_xmm_u64(src)?);
                    if *wide {
                        f64_to_i64(v, *trunc) as u64
                    } else {
                        f64_to_i32(v, *trunc) as u32 as u64
                    }
                } else {
                    let v = f32::from_bits(self.read_xmm_u32(src)?);
                    if *wide {
                        f32_to_i64(v, *trunc) as u64
                    } else {
                        f32_to_i32(v, *trunc) as u32 as u64
                    }
                };
                self.state_mut().write_reg(*gpr, value);
            }
            SseInstr::CvtScalar {
                to_double,
                xmm,
                src,
            } => {
                if *to_double {
                    let v = f32::from_bits(self.read_xmm_u32(src)?);
                    self.state_mut().xmm_mut(*xmm).set_f64(0, v as f64);
                } else {
                    let v = f64::from_bits(self.read_xmm_u64(src)?);
                    self.state_mut().xmm_mut(*xmm).set_f32(0, v as f32);
                }
            }
            SseInstr::CvtPacked { kind, xmm, src } => {
                let b = self.read_xmm128(src)?;
                let mut out = Xmm::default();
                match kind {
                    CvtPackedKind::Ps2Pd => {
                        out.set_f64(0, b.f32(0) as f64);
                        out.set_f64(1, b.f32(1) as f64);
                    }
                    CvtPackedKind::Pd2Ps => {
                        out.set_f32(0, b.f64(0) as f32);
                        out.set_f32(1, b.f64(1) as f32);
                    }
                    CvtPackedKind::Dq2Ps => {
                        for lane in 0..4 {
                            out.set_f32(lane, b.u32(lane) as i32 as f32);
                        }
                    }
                    CvtPackedKind::Tps2Dq => {
                        for lane in 0..4 {
                            out.set_u32(lane, f32_to_i32(b.f32(lane), true) as u32);
                        }
                    }
                    CvtPackedKind::Dq2Pd => {
                        out.set_f64(0, b.u32(0) as i32 as f64);
                        out.set_f64(1, b.u32(1) as i32 as f64);
                    }
                    CvtPackedKind::Tpd2Dq => {
                        out.set_u32(0, f64_to_i32(b.f64(0), true) as u32);
                        out.set_u32(1, f64_to_i32(b.f64(1), true) as u32);
                    }
                }
                *self.state_mut().xmm_mut(*xmm) = out;
            }
            SseInstr::PackedInt { op, dst, src } => {
                let a = *self.state().xmm(*dst);
                let b = self.read_xmm128(src)?;
                *self.state_mut().xmm_mut(*dst) = packed_int(*op, a, b);
            }
            SseInstr::PShift { op, dst, count } => {
                let count = match count {
                    PShiftCount::Imm(n) => *n as u64,
                    PShiftCount::Reg(rm) => self.read_xmm_u64(rm)?,
                };
                let a = *self.state().xmm(*dst);
                *self.state_mut().xmm_mut(*dst) = packed_shift(*op, a, count);
            }
            SseInstr::Shuffle {
                kind,
                dst,
                src,
                control,
            } => {
                let a = *self.state().xmm(*dst);
                let b = self.read_xmm128(src)?;
                let c = *control as usize;
                let mut out = b;
                match kind {
                    ShufKind::D => {
                        for lane in 0..4 {
                            out.set_u32(lane, b.u32(c >> (lane * 2) & 3));
                        }
                    }
                    ShufKind::Lw => {
                        for lane in 0..4 {
                            out.set_u16(lane, b.u16(c >> (lane * 2) & 3));
                        }
                    }
                    ShufKind::Hw => {
                        for lane in 0..4 {
                            out.set_u16(4 + lane, b.u16(4 + (c >> (lane * 2) & 3)));
                        }
                    }
                    ShufKind::Ps => {
                        out.set_u32(0, a.u32(c & 3));
                        out.set_u32(1, a.u32(c >> 2 & 3));
                        out.set_u32(2, b.u32(c >> 4 & 3));
                        out.set_u32(3, b.u32(c >> 6 & 3));
                    }
                    ShufKind::Pd => {
                        out.set_u64(0, a.u64(c & 1));
                        out.set_u64(1, b.u64(c >> 1 & 1));
                    }
                }
                *self.state_mut().xmm_mut(*dst) = out;
            }
            SseInstr::MovMsk { kind, gpr, src } => {
                let x = self.state().xmm(*src);
                let mask = match kind {
                    MovMskKind::B => (0..16).fold(0u64, |m, i| {
                        m | ((x.u8(i) >> 7) as u64) << i
                    }),
                    MovMskKind::Ps => (0..4).fold(0u64, |m, i| {
                        m | ((x.u32(i) >> 31) as u64) << i
                    }),
                    MovMskKind::Pd => (0..2).fold(0u64, |m, i| {
                        m | ((x.u64(i) >> 63) as u64) << i
                    }),
                };
                self.state_mut().write_reg(*gpr, mask);
            }
            SseInstr::LdMxcsr(mem) => {
                let value = self.mem().read_u32(self.ea(mem))?;
                self.state_mut().set_mxcsr(value);
            }
            SseInstr::StMxcsr(mem) => {
                let addr = self.ea(mem);
                let value = self.state().mxcsr();
                self.mem_mut().write_u32(addr, value)?;
            }
        }
        Ok(())
    }

    fn sse_arith(
        &mut self,
        op: SseArithOp,
        ty: SseTy,
        dst: u8,
        src: &XmmRm,
    ) -> Result<(), FaultKind> {
        match ty {
            SseTy::Ss => {
                let b = f32::from_bits(self.read_xmm_u32(src)?);
                let x = self.state_mut().xmm_mut(dst);
                let r = arith32(op, x.f32(0), b);
                x.set_f32(0, r);
            }
            SseTy::Sd => {
                let b = f64::from_bits(self.read_xmm_u64(src)?);
                let x = self.state_mut().xmm_mut(dst);
                let r = arith64(op, x.f64(0), b);
                x.set_f64(0, r);
            }
            SseTy::Ps => {
                let b = self.read_xmm128(src)?;
                let x = self.state_mut().xmm_mut(dst);
                for lane in 0..4 {
                    let r = arith32(op, x.f32(lane), b.f32(lane));
                    x.set_f32(lane, r);
                }
            }
            SseTy::Pd => {
                let b = self.read_xmm128(src)?;
                let x = self.state_mut().xmm_mut(dst);
                for lane in 0..2 {
                    let r = arith64(op, x.f64(lane), b.f64(lane));
                    x.set_f64(lane, r);
                }
            }
        }
        Ok(())
    }

    fn sse_cmp(
        &mut self,
        ty: SseTy,
        dst: u8,
        src: &XmmRm,
        predicate: u8,
    ) -> Result<(), FaultKind> {
        let table = CMP_TABLE[(predicate & 0x0f) as usize];
        match ty {
            SseTy::Ss => {
                let b = f32::from_bits(self.read_xmm_u32(src)?);
                let x = self.state_mut().xmm_mut(dst);
                let hit = table & relation64(x.f32(0) as f64, b as f64) != 0;
                x.set_u32(0, if hit { !0 } else { 0 });
            }
            SseTy::Sd => {
                let b = f64::from_bits(self.read_xmm_u64(src)?);
                let x = self.state_mut().xmm_mut(dst);
                let hit = table & relation64(x.f64(0), b) != 0;
                x.set_u64(0, if hit { !0 } else { 0 });
            }
            SseTy::Ps => {
                let b = self.read_xmm128(src)?;
                let x = self.state_mut().xmm_mut(dst);
                for lane in 0..4 {
                    let hit = table & relation64(x.f32(lane) as f64, b.f32(lane) as f64) != 0;
                    x.set_u32(lane, if hit { !0 } else { 0 });
                }
            }
            SseTy::Pd => {
                let b = self.read_xmm128(src)?;
                let x = self.state_mut().xmm_mut(dst);
                for lane in 0..2 {
                    let hit = table & relation64(x.f64(lane), b.f64(lane)) != 0;
                    x.set_u64(lane, if hit { !0 } else { 0 });
                }
            }
        }
        Ok(())
    }
}

/// The `dst = op(dst, src)` integer lane operations.
fn packed_int(op: PackedIntOp, a: Xmm, b: Xmm) -> Xmm {
    use self::PackedIntOp::*;

    let mut out = Xmm::default();
    match op {
        AddB | SubB => {
            for i in 0..16 {
                let v = if op == AddB {
                    a.u8(i).wrapping_add(b.u8(i))
                } else {
                    a.u8(i).wrapping_sub(b.u8(i))
                };
                out.set_u8(i, v);
            }
        }
        AddW | SubW => {
            for i in 0..8 {
                let v = if op == AddW {
                    a.u16(i).wrapping_add(b.u16(i))
                } else {
                    a.u16(i).wrapping_sub(b.u16(i))
                };
                out.set_u16(i, v);
            }
        }
        AddD | SubD => {
            for i in 0..4 {
                let v = if op == AddD {
                    a.u32(i).wrapping_add(b.u32(i))
                } else {
                    a.u32(i).wrapping_sub(b.u32(i))
                };
                out.set_u32(i, v);
            }
        }
        AddQ | SubQ => {
            for i in 0..2 {
                let v = if op == AddQ {
                    a.u64(i).wrapping_add(b.u64(i))
                } else {
                    a.u64(i).wrapping_sub(b.u64(i))
                };
                out.set_u64(i, v);
            }
        }
        AddSB | SubSB => {
            for i in 0..16 {
                let (x, y) = (a.u8(i) as i8, b.u8(i) as i8);
                let v = if op == AddSB {
                    x.saturating_add(y)
                } else {
                    x.saturating_sub(y)
                };
                out.set_u8(i, v as u8);
            }
        }
        AddSW | SubSW => {
            for i in 0..8 {
                let (x, y) = (a.u16(i) as i16, b.u16(i) as i16);
                let v = if op == AddSW {
                    x.saturating_add(y)
                } else {
                    x.saturating_sub(y)
                };
                out.set_u16(i, v as u16);
            }
        }
        AddUsB | SubUsB => {
            for i in 0..16 {
                let v = if op == AddUsB {
                    a.u8(i).saturating_add(b.u8(i))
                } else {
                    a.u8(i).saturating_sub(b.u8(i))
                };
                out.set_u8(i, v);
            }
        }
        AddUsW | SubUsW => {
            for i in 0..8 {
                let v = if op == AddUsW {
                    a.u16(i).saturating_add(b.u16(i))
                } else {
                    a.u16(i).saturating_sub(b.u16(i))
                };
                out.set_u16(i, v);
            }
        }
        CmpEqB => {
            for i in 0..16 {
                out.set_u8(i, if a.u8(i) == b.u8(i) { 0xff } else { 0 });
            }
        }
        CmpEqW => {
            for i in 0..8 {
                out.set_u16(i, if a.u16(i) == b.u16(i) { 0xffff } else { 0 });
            }
        }
        CmpEqD => {
            for i in 0..4 {
                out.set_u32(i, if a.u32(i) == b.u32(i) { !0 } else { 0 });
            }
        }
        CmpGtB => {
            for i in 0..16 {
                out.set_u8(i, if (a.u8(i) as i8) > b.u8(i) as i8 { 0xff } else { 0 });
            }
        }
        CmpGtW => {
            for i in 0..8 {
                out.set_u16(i, if (a.u16(i) as i16) > b.u16(i) as i16 { 0xffff } else { 0 });
            }
        }
        CmpGtD => {
            for i in 0..4 {
                out.set_u32(i, if (a.u32(i) as i32) > b.u32(i) as i32 { !0 } else { 0 });
            }
        }
        MinUb | MaxUb => {
            for i in 0..16 {
                let (x, y) = (a.u8(i), b.u8(i));
                out.set_u8(i, if op == MinUb { x.min(y) } else { x.max(y) });
            }
        }
        MinSw | MaxSw => {
            for i in 0..8 {
                let (x, y) = (a.u16(i) as i16, b.u16(i) as i16);
                let v = if op == MinSw { x.min(y) } else { x.max(y) };
                out.set_u16(i, v as u16);
            }
        }
        MulLw => {
            for i in 0..8 {
                let p = (a.u16(i) as i16 as i32) * (b.u16(i) as i16 as i32);
                out.set_u16(i, p as u16);
            }
        }
        MulHw => {
            for i in 0..8 {
                let p = (a.u16(i) as i16 as i32) * (b.u16(i) as i16 as i32);
                out.set_u16(i, (p >> 16) as u16);
            }
        }
        MulHuw => {
            for i in 0..8 {
                let p = (a.u16(i) as u32) * (b.u16(i) as u32);
                out.set_u16(i, (p >> 16) as u16);
            }
        }
        MulUdq => {
            // Lanes 0 and 2 of the sources, widened.
            out.set_u64(0, a.u32(0) as u64 * b.u32(0) as u64);
            out.set_u64(1, a.u32(2) as u64 * b.u32(2) as u64);
        }
        Sadbw => {
            for half in 0..2 {
                let mut sum = 0u64;
                for i in 0..8 {
                    let (x, y) = (a.u8(half * 8 + i) as i32, b.u8(half * 8 + i) as i32);
                    sum += (x - y).abs() as u64;
                }
                out.set_u64(half, sum);
            }
        }
        And => {
            for i in 0..2 {
                out.set_u64(i, a.u64(i) & b.u64(i));
            }
        }
        Andn => {
            for i in 0..2 {
                out.set_u64(i, !a.u64(i) & b.u64(i));
            }
        }
        Or => {
            for i in 0..2 {
                out.set_u64(i, a.u64(i) | b.u64(i));
            }
        }
        Xor => {
            for i in 0..2 {
                out.set_u64(i, a.u64(i) ^ b.u64(i));
            }
        }
        UnpckLBw | UnpckHBw => {
            let base = if op == UnpckLBw { 0 } else { 8 };
            for i in 0..8 {
                out.set_u8(i * 2, a.u8(base + i));
                out.set_u8(i * 2 + 1, b.u8(base + i));
            }
        }
        UnpckLWd | UnpckHWd => {
            let base = if op == UnpckLWd { 0 } else { 4 };
            for i in 0..4 {
                out.set_u16(i * 2, a.u16(base + i));
                out.set_u16(i * 2 + 1, b.u16(base + i));
            }
        }
        UnpckLDq | UnpckHDq => {
            let base = if op == UnpckLDq { 0 } else { 2 };
            for i in 0..2 {
                out.set_u32(i * 2, a.u32(base + i));
                out.set_u32(i * 2 + 1, b.u32(base + i));
            }
        }
        UnpckLQdq | UnpckHQdq => {
            let lane = if op == UnpckLQdq { 0 } else { 1 };
            out.set_u64(0, a.u64(lane));
            out.set_u64(1, b.u64(lane));
        }
        PackSsWb => {
            for i in 0..8 {
                out.set_u8(i, sat_i16_to_i8(a.u16(i) as i16) as u8);
                out.set_u8(8 + i, sat_i16_to_i8(b.u16(i) as i16) as u8);
            }
        }
        PackSsDw => {
            for i in 0..4 {
                out.set_u16(i, sat_i32_to_i16(a.u32(i) as i32) as u16);
                out.set_u16(4 + i, sat_i32_to_i16(b.u32(i) as i32) as u16);
            }
        }
        PackUsWb => {
            for i in 0..8 {
                out.set_u8(i, sat_i16_to_u8(a.u16(i) as i16));
                out.set_u8(8 + i, sat_i16_to_u8(b.u16(i) as i16));
            }
        }
    }
    out
}

fn sat_i16_to_i8(v: i16) -> i8 {
    v.max(i8::MIN as i16).min(i8::MAX as i16) as i8
}

fn sat_i16_to_u8(v: i16) -> u8 {
    v.max(0).min(u8::MAX as i16) as u8
}

fn sat_i32_to_i16(v: i32) -> i16 {
    v.max(i16::MIN as i32).min(i16::MAX as i32) as i16
}

/// Packed shifts: a count at or beyond the lane width empties the lane
/// (arithmetic right shifts fill with sign bits instead).
fn packed_shift(op: PShiftOp, a: Xmm, count: u64) -> Xmm {
    use self::PShiftOp::*;

    let mut out = Xmm::default();
    match op {
        SllW | SrlW | SraW => {
            for i in 0..8 {
                let v = match op {
                    SllW if count < 16 => a.u16(i) << count,
                    SrlW if count < 16 => a.u16(i) >> count,
                    SraW => ((a.u16(i) as i16) >> count.min(15)) as u16,
                    _ => 0,
                };
                out.set_u16(i, v);
            }
        }
        SllD | SrlD | SraD => {
            for i in 0..4 {
                let v = match op {
                    SllD if count < 32 => a.u32(i) << count,
                    SrlD if count < 32 => a.u32(i) >> count,
                    SraD => ((a.u32(i) as i32) >> count.min(31)) as u32,
                    _ => 0,
                };
                out.set_u32(i, v);
            }
        }
        SllQ | SrlQ => {
            for i in 0..2 {
                let v = match op {
                    SllQ if count < 64 => a.u64(i) << count,
                    SrlQ if count < 64 => a.u64(i) >> count,
                    _ => 0,
                };
                out.set_u64(i, v);
            }
        }
        SllDq | SrlDq => {
            let n = count.min(16) as usize;
            for i in 0..16 - n {
                if op == SllDq {
                    out.set_u8(i + n, a.u8(i));
                } else {
                    out.set_u8(i, a.u8(i + n));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::interpret::testutil::*;

    fn xmm_of_bytes(bytes: [u8; 16]) -> Xmm {
        Xmm::from_bytes(bytes)
    }

    #[test]
    fn pcmpeqb_alternating_mask() {
        // xmm0 = 01..10, xmm1 matches every other byte.
        let mut code = vec![0x66, 0x0f, 0x74, 0xc1]; // pcmpeqb xmm0, xmm1
        code.push(0xf4);
        let mut m = machine(&code);
        let a: [u8; 16] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        let b: [u8; 16] = [
            0x01, 0x00, 0x03, 0x00, 0x05, 0x00, 0x07, 0x00, 0x09, 0x00, 0x0b, 0x00, 0x0d, 0x00,
            0x0f, 0x00,
        ];
        *m.state_mut().xmm_mut(0) = xmm_of_bytes(a);
        *m.state_mut().xmm_mut(1) = xmm_of_bytes(b);
        run_to_halt(&mut m);
        let r = m.state().xmm(0).bytes();
        for i in 0..16 {
            assert_eq!(r[i], if i % 2 == 0 { 0xff } else { 0x00 }, "byte {}", i);
        }
    }

    #[test]
    fn subsd_infinity_minus_infinity() {
        let code = [0xf2, 0x0f, 0x5c, 0xc1, 0xf4]; // subsd xmm0, xmm1
        let mut m = machine(&code);
        m.state_mut().xmm_mut(0).set_f64(0, f64::INFINITY);
        m.state_mut().xmm_mut(0).set_f64(1, 42.5);
        m.state_mut().xmm_mut(1).set_f64(0, f64::INFINITY);
        run_to_halt(&mut m);
        assert!(m.state().xmm(0).f64(0).is_nan());
        // The upper lane is untouched by a scalar op.
        assert_eq!(m.state().xmm(0).f64(1), 42.5);
    }

    #[test]
    fn ucomisd_nan_flags() {
        use crate::cpu::Flags;

        let code = [0x66, 0x0f, 0x2e, 0xc1, 0xf4]; // ucomisd xmm0, xmm1
        let mut m = machine(&code);
        m.state_mut().xmm_mut(0).set_f64(0, f64::NAN);
        m.state_mut().xmm_mut(1).set_f64(0, 1.0);
        run_to_halt(&mut m);
        let f = m.state().flags();
        assert!(f.contains(Flags::ZF | Flags::PF | Flags::CF));
        assert!(!f.intersects(Flags::OF | Flags::AF | Flags::SF));

        let code = [0x66, 0x0f, 0x2e, 0xc1, 0xf4];
        let mut m = machine(&code);
        m.state_mut().xmm_mut(0).set_f64(0, 2.0);
        m.state_mut().xmm_mut(1).set_f64(0, 1.0);
        run_to_halt(&mut m);
        let f = m.state().flags();
        assert!(!f.intersects(Flags::ZF | Flags::PF | Flags::CF));
    }

    #[test]
    fn cmppd_masks_are_all_or_nothing() {
        // Property: every lane of a compare result is all-ones or all-zero,
        // and comparing a register against itself with "unordered" matches
        // only NaN lanes.
        let code = [0x66, 0x0f, 0xc2, 0xc0, 0x03, 0xf4]; // cmpunordpd xmm0, xmm0
        let mut m = machine(&code);
        m.state_mut().xmm_mut(0).set_f64(0, f64::NAN);
        m.state_mut().xmm_mut(0).set_f64(1, 7.0);
        run_to_halt(&mut m);
        assert_eq!(m.state().xmm(0).u64(0), !0);
        assert_eq!(m.state().xmm(0).u64(1), 0);
    }

    #[test]
    fn cvt_roundtrip_within_one_ulp() {
        // cvtsd2ss / cvtss2sd on a finite double stays within one f32 ulp
        // and preserves signed zeros and infinities exactly.
        for &v in &[
            1.0f64,
            -3.5,
            1.0e30,
            -0.0,
            0.0,
            f64::INFINITY,
            f64::NEG_INFINITY,
            std::f64::consts::PI,
        ] {
            let code = [
                0xf2, 0x0f, 0x5a, 0xc8, // cvtsd2ss xmm1, xmm0
                0xf3, 0x0f, 0x5a, 0xd1, // cvtss2sd xmm2, xmm1
                0xf4,
            ];
            let mut m = machine(&code);
            m.state_mut().xmm_mut(0).set_f64(0, v);
            run_to_halt(&mut m);
            let back = m.state().xmm(2).f64(0);
            if v.is_finite() {
                let ulp = (v as f32).to_bits();
                let ulp = f32::from_bits(ulp.wrapping_add(1)) as f64 - (v as f32) as f64;
                assert!((back - v).abs() <= ulp.abs(), "{} -> {}", v, back);
                assert_eq!(back.is_sign_negative(), v.is_sign_negative());
            } else {
                assert_eq!(back, v);
            }
        }
    }

    #[test]
    fn cvttsd2si_saturates_by_sign() {
        for &(v, expected) in &[
            (1.9f64, 1i32),
            (-1.9, -1),
            (1e100, i32::MAX),
            (-1e100, i32::MIN),
            (f64::NAN, i32::MAX),
            (f64::INFINITY, i32::MAX),
            (f64::NEG_INFINITY, i32::MIN),
        ] {
            let code = [0xf2, 0x0f, 0x2c, 0xc0, 0xf4]; // cvttsd2si eax, xmm0
            let mut m = machine(&code);
            m.state_mut().xmm_mut(0).set_f64(0, v);
            run_to_halt(&mut m);
            assert_eq!(m.state().gp64(0) as u32 as i32, expected, "{}", v);
        }
    }

    #[test]
    fn movss_load_zeroes_store_merges() {
        // movss from memory clears lanes 1-3; movss between registers only
        // replaces lane 0.
        let code = [
            0xf3, 0x0f, 0x10, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, // movss xmm0, [0x2000]
            0xf3, 0x0f, 0x10, 0xc8, // movss xmm1, xmm0
            0xf4,
        ];
        let mut m = machine(&code);
        m.mem_mut().write_f32(0x2000, 8.25).unwrap();
        for lane in 0..4 {
            m.state_mut().xmm_mut(0).set_f32(lane, -1.0);
            m.state_mut().xmm_mut(1).set_f32(lane, 3.0);
        }
        run_to_halt(&mut m);
        assert_eq!(m.state().xmm(0).f32(0), 8.25);
        for lane in 1..4 {
            assert_eq!(m.state().xmm(0).f32(lane), 0.0, "lane {}", lane);
        }
        assert_eq!(m.state().xmm(1).f32(0), 8.25);
        for lane in 1..4 {
            assert_eq!(m.state().xmm(1).f32(lane), 3.0, "lane {}", lane);
        }
    }

    #[test]
    fn minmax_prefer_second_source() {
        let a = f64::NAN;
        let b = 3.0;
        assert_eq!(arith64(SseArithOp::Min, a, b), 3.0);
        assert_eq!(arith64(SseArithOp::Max, a, b), 3.0);
        assert!(arith64(SseArithOp::Min, 3.0, f64::NAN).is_nan());
        // Both zero: the second source wins, sign included.
        assert!(arith64(SseArithOp::Min, 0.0, -0.0).is_sign_negative());
        assert!(!arith64(SseArithOp::Max, -0.0, 0.0).is_sign_negative());
    }

    #[test]
    fn psadbw_sums_absolute_differences() {
        let mut a = Xmm::default();
        let mut b = Xmm::default();
        for i in 0..16 {
            a.set_u8(i, i as u8);
            b.set_u8(i, 2);
        }
        let r = packed_int(PackedIntOp::Sadbw, a, b);
        // |0-2|+|1-2|+...+|7-2| = 2+1+0+1+2+3+4+5 = 18
        assert_eq!(r.u64(0), 18);
        // |8-2|+...+|15-2| = 6+..+13 = 76
        assert_eq!(r.u64(1), 76);
    }

    #[test]
    fn float_unpacks_interleave_lanes() {
        // unpcklps xmm0, xmm1: [a0 b0 a1 b1].
        let code = [0x0f, 0x14, 0xc1, 0xf4];
        let mut m = machine(&code);
        for lane in 0..4 {
            m.state_mut().xmm_mut(0).set_u32(lane, 0xa0 + lane as u32);
            m.state_mut().xmm_mut(1).set_u32(lane, 0xb0 + lane as u32);
        }
        run_to_halt(&mut m);
        let r = m.state().xmm(0);
        assert_eq!(
            [r.u32(0), r.u32(1), r.u32(2), r.u32(3)],
            [0xa0, 0xb0, 0xa1, 0xb1]
        );

        // unpckhpd xmm0, xmm1: [a1 b1].
        let code = [0x66, 0x0f, 0x15, 0xc1, 0xf4];
        let mut m = machine(&code);
        for lane in 0..2 {
            m.state_mut().xmm_mut(0).set_u64(lane, 0xa0 + lane as u64);
            m.state_mut().xmm_mut(1).set_u64(lane, 0xb0 + lane as u64);
        }
        run_to_halt(&mut m);
        assert_eq!(m.state().xmm(0).u64(0), 0xa1);
        assert_eq!(m.state().xmm(0).u64(1), 0xb1);
    }

    #[test]
    fn saturating_pack() {
        let mut a = Xmm::default();
        for i in 0..8 {
            a.set_u16(i, (i as i16 * 100 - 200) as u16);
        }
        let r = packed_int(PackedIntOp::PackUsWb, a, Xmm::default());
        assert_eq!(r.u8(0), 0); // -200 clamps to 0
        assert_eq!(r.u8(2), 0);
        assert_eq!(r.u8(3), 100);
        assert_eq!(r.u8(5), 255); // 300 clamps to 255
    }

    #[test]
    fn packed_shift_overflow_clears() {
        let mut a = Xmm::default();
        for i in 0..8 {
            a.set_u16(i, 0x8001);
        }
        let r = packed_shift(PShiftOp::SllW, a, 16);
        assert_eq!(r.bytes(), [0; 16]);
        let r = packed_shift(PShiftOp::SraW, a, 200);
        for i in 0..8 {
            assert_eq!(r.u16(i), 0xffff);
        }
        let r = packed_shift(PShiftOp::SrlDq, a, 15);
        assert_eq!(r.u8(0), 0x80);
        assert_eq!(r.u64(1), 0);
    }

    #[test]
    fn pshufd_broadcast() {
        let code = [0x66, 0x0f, 0x70, 0xc8, 0x00, 0xf4]; // pshufd xmm1, xmm0, 0
        let mut m = machine(&code);
        for lane in 0..4 {
            m.state_mut().xmm_mut(0).set_u32(lane, 0x100 + lane as u32);
        }
        run_to_halt(&mut m);
        for lane in 0..4 {
            assert_eq!(m.state().xmm(1).u32(lane), 0x100);
        }
    }

    #[test]
    fn movmskps_collects_signs() {
        let code = [0x0f, 0x50, 0xc8, 0xf4]; // movmskps ecx, xmm0
        let mut m = machine(&code);
        m.state_mut().xmm_mut(0).set_f32(0, -1.0);
        m.state_mut().xmm_mut(0).set_f32(1, 2.0);
        m.state_mut().xmm_mut(0).set_f32(2, -0.0);
        m.state_mut().xmm_mut(0).set_f32(3, 4.0);
        run_to_halt(&mut m);
        assert_eq!(m.state().gp64(1), 0b0101);
    }
}
