//! x87 floating-point executor.
//!
//! Values live in the rotating register stack as raw 10-byte [`F80`]s and
//! are expanded to `rug::Float` (64-bit significand, the extended format's
//! width) for arithmetic. NaN operands short-circuit before any `Float`
//! math so that payload and sign survive the way the hardware propagates
//! them.

use rug::float::Constant;
use rug::Float;

use crate::cpu::flags::Flags;
use crate::cpu::instr::*;
use crate::cpu::interpret::{FaultKind, Hooks, Interpreter};
use crate::f80::{self, F80, PRECISION};

/// Fills the quiet bit of a NaN so it propagates as a QNaN.
fn quieten(mut v: F80) -> F80 {
    v.0[7] |= 0x40;
    v
}

fn binop(op: FpuArithOp, a: &F80, b: &F80) -> F80 {
    if a.is_nan() {
        return quieten(*a);
    }
    if b.is_nan() {
        return quieten(*b);
    }
    let fa = a.to_float();
    let fb = b.to_float();
    // MPFR follows IEEE for the inf/zero corner cases, NaNs included
    // (inf - inf, 0 * inf, 0 / 0, x / 0 and friends).
    let r = match op {
        FpuArithOp::Add => fa + fb,
        FpuArithOp::Mul => fa * fb,
        FpuArithOp::Sub => fa - fb,
        FpuArithOp::Subr => fb - fa,
        FpuArithOp::Div => fa / fb,
        FpuArithOp::Divr => fb / fa,
    };
    F80::from_float(&r)
}

/// Applies the control-word rounding mode.
fn round_to_mode(f: Float, mode: u8) -> Float {
    match mode {
        0 => f.round_even(),
        1 => f.floor(),
        2 => f.ceil(),
        _ => f.trunc(),
    }
}

impl<H: Hooks> Interpreter<H> {
    pub(crate) fn exec_fpu(&mut self, instr: &FpuInstr) -> Result<(), FaultKind> {
        match instr {
            FpuInstr::Load(src) => {
                let value = self.fpu_load_value(src)?;
                self.state_mut().fpu_push(value);
            }
            FpuInstr::Store { dst, pop } => {
                self.fpu_store(dst)?;
                if *pop {
                    self.state_mut().fpu_pop();
                }
            }
            FpuInstr::Arith { op, form } => self.fpu_arith(*op, form)?,
            FpuInstr::Com {
                src,
                pops,
                unordered: _,
                eflags,
            } => {
                let a = self.state().st(0);
                let b = match src {
                    FpuComSrc::M32(mem) => F80::from_f32(self.mem().read_f32(self.ea(mem))?),
                    FpuComSrc::M64(mem) => F80::from_f64(self.mem().read_f64(self.ea(mem))?),
                    FpuComSrc::St(i) => self.state().st(*i),
                };
                self.fpu_compare(&a, &b, *eflags);
                for _ in 0..*pops {
                    self.state_mut().fpu_pop();
                }
            }
            FpuInstr::Tst => {
                let a = self.state().st(0);
                self.fpu_compare(&a, &f80::POSITIVE_ZERO, false);
            }
            FpuInstr::Xam => self.fpu_examine(),
            FpuInstr::Cmov { cc, i } => {
                if self.state().flags().condition(*cc) {
                    let value = self.state().st(*i);
                    self.state_mut().set_st(0, value);
                }
            }
            FpuInstr::Xch(i) => {
                let a = self.state().st(0);
                let b = self.state().st(*i);
                self.state_mut().set_st(0, b);
                self.state_mut().set_st(*i, a);
            }
            FpuInstr::Unary(op) => self.fpu_unary(*op),
            FpuInstr::Free(_) => {}
            FpuInstr::IncStp => {
                let top = self.state().fpu_top();
                self.state_mut().set_fpu_top(top.wrapping_add(1));
            }
            FpuInstr::DecStp => {
                let top = self.state().fpu_top();
                self.state_mut().set_fpu_top(top.wrapping_sub(1));
            }
            FpuInstr::Nop => {}
            FpuInstr::LdCw(mem) => {
                let cw = self.mem().read_u16(self.ea(mem))?;
                self.state_mut().set_fpu_control_word(cw);
            }
            FpuInstr::StCw(mem) => {
                let cw = self.state().fpu_control_word();
                let addr = self.ea(mem);
                self.mem_mut().write_u16(addr, cw)?;
            }
            FpuInstr::StSw(dst) => {
                let sw = self.state().fpu_status_word();
                match dst {
                    FpuStswDst::Ax => self
                        .state_mut()
                        .write_reg(Register::new(reg::RAX, OpSize::Bits16), sw as u64),
                    FpuStswDst::M16(mem) => {
                        let addr = self.ea(mem);
                        self.mem_mut().write_u16(addr, sw)?;
                    }
                }
            }
            FpuInstr::StEnv(mem) => {
                // 28-byte protected-mode environment; the pointer fields are
                // not tracked and store as zero.
                let addr = self.ea(mem);
                let cw = self.state().fpu_control_word() as u32;
                let sw = self.state().fpu_status_word() as u32;
                self.mem_mut().write_u32(addr, cw | 0xffff_0000)?;
                self.mem_mut().write_u32(addr + 4, sw | 0xffff_0000)?;
                self.mem_mut().write_u32(addr + 8, 0xffff_ffff)?;
                for i in 3u64..7 {
                    self.mem_mut().write_u32(addr + 4 * i, 0)?;
                }
            }
            FpuInstr::LdEnv(mem) => {
                let addr = self.ea(mem);
                let cw = self.mem().read_u32(addr)? as u16;
                let sw = self.mem().read_u32(addr + 4)? as u16;
                self.state_mut().set_fpu_control_word(cw);
                self.state_mut().set_fpu_status_word(sw);
            }
            FpuInstr::Init => self.state_mut().fpu_init(),
        }
        Ok(())
    }

    fn fpu_load_value(&mut self, src: &FpuLoad) -> Result<F80, FaultKind> {
        Ok(match src {
            FpuLoad::M32(mem) => F80::from_f32(self.mem().read_f32(self.ea(mem))?),
            FpuLoad::M64(mem) => F80::from_f64(self.mem().read_f64(self.ea(mem))?),
            FpuLoad::M80(mem) => {
                let mut bytes = [0; 10];
                self.mem().read_bytes(self.ea(mem), &mut bytes)?;
                F80(bytes)
            }
            FpuLoad::I16(mem) => int_to_f80(self.mem().read_u16(self.ea(mem))? as i16 as i64),
            FpuLoad::I32(mem) => int_to_f80(self.mem().read_u32(self.ea(mem))? as i32 as i64),
            FpuLoad::I64(mem) => int_to_f80(self.mem().read_u64(self.ea(mem))? as i64),
            FpuLoad::St(i) => self.state().st(*i),
            FpuLoad::One => f80::ONE,
            FpuLoad::Zero => f80::POSITIVE_ZERO,
            FpuLoad::Pi => F80::from_float(&Float::with_val(PRECISION, Constant::Pi)),
            FpuLoad::L2e => {
                F80::from_float(&Float::with_val(PRECISION, Constant::Log2).recip())
            }
            FpuLoad::L2t => F80::from_float(&Float::with_val(PRECISION, 10).log2()),
            FpuLoad::Lg2 => F80::from_float(&Float::with_val(PRECISION, 2).log10()),
            FpuLoad::Ln2 => F80::from_float(&Float::with_val(PRECISION, Constant::Log2)),
        })
    }

    fn fpu_store(&mut self, dst: &FpuStore) -> Result<(), FaultKind> {
        let st0 = self.state().st(0);
        match dst {
            FpuStore::M32(mem) => {
                let addr = self.ea(mem);
                self.mem_mut().write_f32(addr, st0.to_f32())?;
            }
            FpuStore::M64(mem) => {
                let addr = self.ea(mem);
                self.mem_mut().write_f64(addr, st0.to_f64())?;
            }
            FpuStore::M80(mem) => {
                let addr = self.ea(mem);
                self.mem_mut().write_bytes(addr, &st0.0)?;
            }
            FpuStore::I16(mem) => {
                let addr = self.ea(mem);
                let v = self.fpu_to_int(&st0, i16::MIN as i64, i16::MAX as i64, 0x8000);
                self.mem_mut().write_u16(addr, v as u16)?;
            }
            FpuStore::I32(mem) => {
                let addr = self.ea(mem);
                let v = self.fpu_to_int(&st0, i32::MIN as i64, i32::MAX as i64, 0x8000_0000);
                self.mem_mut().write_u32(addr, v as u32)?;
            }
            FpuStore::I64(mem) => {
                let addr = self.ea(mem);
                let v = self.fpu_to_int(&st0, i64::MIN, i64::MAX, i64::MIN as u64);
                self.mem_mut().write_u64(addr, v as u64)?;
            }
            FpuStore::St(i) => self.state_mut().set_st(*i, st0),
        }
        Ok(())
    }

    /// Float-to-integer conversion honoring the control-word rounding mode.
    /// NaN, infinities and out-of-range values produce the integer
    /// indefinite for the destination width.
    fn fpu_to_int(&self, value: &F80, min: i64, max: i64, indefinite: u64) -> i64 {
        if value.is_nan() || value.is_infinite() {
            return indefinite as i64;
        }
        let rounded = round_to_mode(value.to_float(), self.state().fpu_rounding());
        match rounded.to_integer() {
            Some(int) => match int.to_i64() {
                Some(v) if v >= min && v <= max => v,
                _ => indefinite as i64,
            },
            None => indefinite as i64,
        }
    }

    fn fpu_arith(&mut self, op: FpuArithOp, form: &FpuForm) -> Result<(), FaultKind> {
        match form {
            FpuForm::M32(mem) => {
                let b = F80::from_f32(self.mem().read_f32(self.ea(mem))?);
                let a = self.state().st(0);
                let r = binop(op, &a, &b);
                self.state_mut().set_st(0, r);
            }
            FpuForm::M64(mem) => {
                let b = F80::from_f64(self.mem().read_f64(self.ea(mem))?);
                let a = self.state().st(0);
                let r = binop(op, &a, &b);
                self.state_mut().set_st(0, r);
            }
            FpuForm::I16(mem) => {
                let b = int_to_f80(self.mem().read_u16(self.ea(mem))? as i16 as i64);
                let a = self.state().st(0);
                let r = binop(op, &a, &b);
                self.state_mut().set_st(0, r);
            }
            FpuForm::I32(mem) => {
                let b = int_to_f80(self.mem().read_u32(self.ea(mem))? as i32 as i64);
                let a = self.state().st(0);
                let r = binop(op, &a, &b);
                self.state_mut().set_st(0, r);
            }
            FpuForm::St0Sti(i) => {
                let a = self.state().st(0);
                let b = self.state().st(*i);
                let r = binop(op, &a, &b);
                self.state_mut().set_st(0, r);
            }
            FpuForm::StiSt0 { i, pop } => {
                let a = self.state().st(*i);
                let b = self.state().st(0);
                let r = binop(op, &a, &b);
                self.state_mut().set_st(*i, r);
                if *pop {
                    self.state_mut().fpu_pop();
                }
            }
        }
        Ok(())
    }

    /// Comparison result mapping: greater (0,0,0), less (0,0,1),
    /// equal (1,0,0), unordered (1,1,1) into C3/C2/C0 or ZF/PF/CF.
    fn fpu_compare(&mut self, a: &F80, b: &F80, eflags: bool) {
        use std::cmp::Ordering;

        let (c3, c2, c0) = if a.is_nan() || b.is_nan() {
            (true, true, true)
        } else {
            match a.to_float().partial_cmp(&b.to_float()) {
                Some(Ordering::Greater) => (false, false, false),
                Some(Ordering::Less) => (false, false, true),
                _ => (true, false, false),
            }
        };

        if eflags {
            let flags = self.state_mut().flags_mut();
            flags.set(Flags::ZF, c3);
            flags.set(Flags::PF, c2);
            flags.set(Flags::CF, c0);
            flags.remove(Flags::OF | Flags::AF | Flags::SF);
        } else {
            self.state_mut().set_fpu_c320(c3, c2, c0);
        }
    }

    /// `fxam` class encoding into C3/C2/C0, sign into C1.
    fn fpu_examine(&mut self) {
        let v = self.state().st(0);
        let (c3, c2, c0) = if v.is_nan() {
            (false, false, true)
        } else if v.is_infinite() {
            (false, true, true)
        } else if v.is_zero() {
            (true, false, false)
        } else if v.is_denormal() {
            (true, true, false)
        } else {
            (false, true, false)
        };
        self.state_mut().set_fpu_c320(c3, c2, c0);
        let sign = v.is_sign_negative();
        self.state_mut().set_fpu_cc(1, sign);
    }

    fn fpu_unary(&mut self, op: FpuUnary) {
        use self::FpuUnary::*;

        let st0 = self.state().st(0);
        match op {
            Chs => {
                let mut v = st0;
                v.0[9] ^= 0x80;
                self.state_mut().set_st(0, v);
            }
            Abs => {
                let mut v = st0;
                v.0[9] &= 0x7f;
                self.state_mut().set_st(0, v);
            }
            Sqrt => self.replace_st0(st0.to_float().sqrt()),
            Sin => self.replace_st0(st0.to_float().sin()),
            Cos => self.replace_st0(st0.to_float().cos()),
            SinCos => {
                let f = st0.to_float();
                let sin = f.clone().sin();
                let cos = f.cos();
                self.state_mut().set_st(0, F80::from_float(&sin));
                self.state_mut().fpu_push(F80::from_float(&cos));
            }
            Ptan => {
                let tan = st0.to_float().tan();
                self.state_mut().set_st(0, F80::from_float(&tan));
                self.state_mut().fpu_push(f80::ONE);
            }
            Patan => {
                // Two-argument arctangent keeps the quadrant: y is st(1),
                // x is st(0).
                let x = self.state_mut().fpu_pop().to_float();
                let y = self.state().st(0).to_float();
                let r = y.atan2(&x);
                self.state_mut().set_st(0, F80::from_float(&r));
            }
            Yl2x => {
                let x = self.state_mut().fpu_pop().to_float();
                let y = self.state().st(0).to_float();
                let r = y * x.log2();
                self.state_mut().set_st(0, F80::from_float(&r));
            }
            Yl2xp1 => {
                let x = self.state_mut().fpu_pop().to_float();
                let y = self.state().st(0).to_float();
                let ln2 = Float::with_val(PRECISION, Constant::Log2);
                let r = y * (x.ln_1p() / ln2);
                self.state_mut().set_st(0, F80::from_float(&r));
            }
            Exp2M1 => {
                // 2^x - 1 computed as expm1(x * ln 2) to keep precision
                // near zero, where this instruction is specified to be used.
                let ln2 = Float::with_val(PRECISION, Constant::Log2);
                let r = (st0.to_float() * ln2).exp_m1();
                self.replace_st0(r);
            }
            Scale => {
                let n = self.state().st(1).to_float();
                let f = st0.to_float();
                let r = if n.is_nan() || f.is_nan() {
                    Float::with_val(PRECISION, rug::float::Special::Nan)
                } else {
                    // Clamp the scale far beyond the exponent range; the
                    // encoding saturates to infinity/zero anyway.
                    let negative = n.is_sign_negative();
                    let n = n
                        .trunc()
                        .to_integer()
                        .and_then(|i| i.to_i32())
                        .unwrap_or(if negative { -100_000 } else { 100_000 })
                        .max(-100_000)
                        .min(100_000);
                    f << n
                };
                self.replace_st0(r);
            }
            Xtract => {
                let f = st0.to_float();
                if f.is_zero() {
                    // Exponent of zero is -inf; the significand keeps the
                    // signed zero.
                    self.state_mut()
                        .set_st(0, f80::NEGATIVE_INFINITY);
                    self.state_mut().fpu_push(st0);
                    return;
                }
                match f.get_exp() {
                    Some(exp) => {
                        // MPFR normalizes to 0.5 <= |m| < 1; the x87
                        // significand form is 1 <= |s| < 2.
                        let e = exp - 1;
                        let sig = f >> e;
                        self.state_mut()
                            .set_st(0, F80::from_float(&Float::with_val(PRECISION, e)));
                        self.state_mut().fpu_push(F80::from_float(&sig));
                    }
                    None => {
                        // NaN or infinity: exponent and significand both
                        // take the operand's value.
                        self.state_mut().set_st(0, st0);
                        self.state_mut().fpu_push(st0);
                    }
                }
            }
            Prem => self.fpu_partial_rem(false),
            Prem1 => self.fpu_partial_rem(true),
            Rndint => {
                let mode = self.state().fpu_rounding();
                if !st0.is_nan() && !st0.is_infinite() {
                    let r = round_to_mode(st0.to_float(), mode);
                    self.replace_st0(r);
                }
            }
        }
    }

    /// `fprem`/`fprem1`: remainder of st(0) by st(1). The two differ only
    /// in how the implied quotient is rounded (truncation vs nearest-even);
    /// either remainder is exactly representable, so no precision is lost.
    /// C2 is cleared (reduction always completes) and the low quotient bits
    /// land in C0/C3/C1 the way argument-reduction code expects.
    fn fpu_partial_rem(&mut self, nearest: bool) {
        let a = self.state().st(0);
        let b = self.state().st(1);
        if a.is_nan() || b.is_nan() || a.is_infinite() || b.is_zero() {
            let r = if a.is_nan() {
                quieten(a)
            } else if b.is_nan() {
                quieten(b)
            } else {
                f80::POSITIVE_NAN
            };
            self.state_mut().set_st(0, r);
            self.state_mut().set_fpu_c320(false, false, false);
            return;
        }

        let fa = a.to_float();
        let fb = b.to_float();
        let r = if nearest {
            fa.clone().remainder(&fb)
        } else {
            fa.clone() % &fb
        };

        // Low three bits of the integer quotient, when it is small enough
        // to recover exactly.
        let q = Float::with_val(PRECISION * 2, &fa - &r) / &fb;
        let qbits = q
            .round_even()
            .to_integer()
            .map(|i| i.abs())
            .and_then(|i| i.to_u64())
            .unwrap_or(0);

        self.state_mut().set_st(0, F80::from_float(&r));
        self.state_mut().set_fpu_c320(qbits >> 1 & 1 != 0, false, qbits >> 2 & 1 != 0);
        self.state_mut().set_fpu_cc(1, qbits & 1 != 0);
    }

    fn replace_st0(&mut self, value: Float) {
        self.state_mut().set_st(0, F80::from_float(&value));
    }
}

fn int_to_f80(value: i64) -> F80 {
    F80::from_float(&Float::with_val(PRECISION, value))
}

#[cfg(test)]
mod tests {
    use crate::cpu::interpret::testutil::*;
    use crate::f80::{self, F80};
    use rug::Float;

    const DATA: u64 = 0x2000;

    /// fld tbyte [0x2000]
    const FLD_M80: [u8; 7] = [0xdb, 0x2c, 0x25, 0x00, 0x20, 0x00, 0x00];
    /// fstp tbyte [0x2010]
    const FSTP_M80: [u8; 7] = [0xdb, 0x3c, 0x25, 0x10, 0x20, 0x00, 0x00];

    #[test]
    fn extended_load_store_is_bit_exact() {
        // fld m80 / fstp m80 / fld m80: the reloaded value matches the
        // original bit for bit, NaN payload included.
        let patterns: &[[u8; 10]] = &[
            F80::from_f64(1.5).0,
            F80::from_f64(-0.1).0,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01, 0x02, 0x83, 0xfe, 0x41],
            // NaN with a payload.
            [0x99, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0xff, 0x7f],
        ];
        for bits in patterns {
            let mut code = vec![];
            code.extend_from_slice(&FLD_M80);
            code.extend_from_slice(&FSTP_M80);
            code.extend_from_slice(&FLD_M80);
            code.push(0xf4);
            let mut m = machine(&code);
            m.mem_mut().write_bytes(DATA, bits).unwrap();
            run_to_halt(&mut m);
            let mut stored = [0; 10];
            m.mem().read_bytes(DATA + 0x10, &mut stored).unwrap();
            assert_eq!(&stored, bits);
            assert_eq!(m.state().st(0).0, *bits);
        }
    }

    #[test]
    fn sine_of_half_pi() {
        let half_pi = Float::with_val(f80::PRECISION, rug::float::Constant::Pi) / 2u32;
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80);
        code.push(0xd9);
        code.push(0xfe); // fsin
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut()
            .write_bytes(DATA, &F80::from_float(&half_pi).0)
            .unwrap();
        run_to_halt(&mut m);

        let sin = m.state().st(0).to_float();
        let err = Float::with_val(f80::PRECISION, 1 - sin).abs();
        assert!(err < 1e-18, "sin(pi/2) error {:?}", err);
    }

    #[test]
    fn arith_and_stack_rotation() {
        // fld1; fld1; faddp -> 2.0, then fld 3.0 from memory and fmulp.
        let mut code = vec![
            0xd9, 0xe8, // fld1
            0xd9, 0xe8, // fld1
            0xde, 0xc1, // faddp st(1), st(0)
        ];
        code.extend_from_slice(&FLD_M80);
        code.extend_from_slice(&[0xde, 0xc9]); // fmulp
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(3.0).0).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().st(0).to_f64(), 6.0);
        assert_eq!(m.state().fpu_top(), 7);
    }

    #[test]
    fn subtraction_directions() {
        // st0 = 2.0, st1 = 8.0: fsubr st(0) computes 2 - 8? No: fsub
        // computes st0 - src, fsubr src - st0.
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80); // 8.0
        code.extend_from_slice(&[0xd9, 0xe8]); // fld1 -> st0=1, st1=8
        code.extend_from_slice(&[0xd8, 0xe1]); // fsub st(0), st(1): 1-8=-7
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(8.0).0).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().st(0).to_f64(), -7.0);

        let mut code = vec![];
        code.extend_from_slice(&FLD_M80);
        code.extend_from_slice(&[0xd9, 0xe8]);
        code.extend_from_slice(&[0xd8, 0xe9]); // fsubr st(0), st(1): 8-1=7
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(8.0).0).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().st(0).to_f64(), 7.0);
    }

    #[test]
    fn partial_remainder_keeps_extended_precision() {
        // 16 rem 3.2: with a 64-bit significand 3.2 is slightly below the
        // exact value, so the remainder is ~3.2, not 0.
        let m32 = 3.2f64;
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80); // modulus -> st1
        code.extend_from_slice(&[0xdb, 0x2c, 0x25, 0x10, 0x20, 0x00, 0x00]); // fld [0x2010]
        code.extend_from_slice(&[0xd9, 0xf8]); // fprem
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(m32).0).unwrap();
        m.mem_mut()
            .write_bytes(DATA + 0x10, &F80::from_f64(16.0).0)
            .unwrap();
        run_to_halt(&mut m);
        let r = m.state().st(0).to_f64();
        assert!((r - 3.2).abs() < 1e-14, "fprem gave {}", r);
        // C2 clear: reduction complete.
        assert_eq!(m.state().fpu_status_word() >> 10 & 1, 0);
    }

    #[test]
    fn compare_sets_condition_bits() {
        // fld 2.0; fld1; fcom st(1) -> st0=1 < st1=2 -> C0.
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80);
        code.extend_from_slice(&[0xd9, 0xe8]); // fld1
        code.extend_from_slice(&[0xd8, 0xd1]); // fcom st(1)
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(2.0).0).unwrap();
        run_to_halt(&mut m);
        let sw = m.state().fpu_status_word();
        assert_eq!(sw >> 8 & 1, 1, "C0");
        assert_eq!(sw >> 14 & 1, 0, "C3");
    }

    #[test]
    fn fcomi_unordered_flags() {
        use crate::cpu::Flags;

        let mut code = vec![];
        code.extend_from_slice(&FLD_M80); // NaN
        code.extend_from_slice(&[0xd9, 0xe8]); // fld1
        code.extend_from_slice(&[0xdb, 0xf1]); // fcomi st(0), st(1)
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &f80::POSITIVE_NAN.0).unwrap();
        run_to_halt(&mut m);
        let flags = m.state().flags();
        assert!(flags.contains(Flags::ZF | Flags::PF | Flags::CF));
        assert!(!flags.intersects(Flags::OF | Flags::AF | Flags::SF));
    }

    #[test]
    fn integer_store_rounding_modes() {
        // fild a 7, add 0.5 via memory, fistp under each rounding mode.
        for &(mode, expected) in &[(0u16, 8i32), (1, 7), (2, 8), (3, 7)] {
            let mut code = vec![];
            // fild dword [0x2000]
            code.extend_from_slice(&[0xdb, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00]);
            // fadd dword [0x2008] (0.5f32)
            code.extend_from_slice(&[0xd8, 0x04, 0x25, 0x08, 0x20, 0x00, 0x00]);
            // fldcw [0x2010]
            code.extend_from_slice(&[0xd9, 0x2c, 0x25, 0x10, 0x20, 0x00, 0x00]);
            // fistp dword [0x2018]
            code.extend_from_slice(&[0xdb, 0x1c, 0x25, 0x18, 0x20, 0x00, 0x00]);
            code.push(0xf4);
            let mut m = machine(&code);
            m.mem_mut().write_u32(DATA, 7).unwrap();
            m.mem_mut().write_f32(DATA + 8, 0.5).unwrap();
            m.mem_mut().write_u16(DATA + 0x10, 0x037f | (mode << 10)).unwrap();
            run_to_halt(&mut m);
            assert_eq!(m.mem().read_u32(DATA + 0x18).unwrap() as i32, expected, "mode {}", mode);
        }
    }

    #[test]
    fn fxch_and_fchs() {
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80); // 2.0
        code.extend_from_slice(&[0xd9, 0xe8]); // fld1
        code.extend_from_slice(&[0xd9, 0xc9]); // fxch st(1)
        code.extend_from_slice(&[0xd9, 0xe0]); // fchs
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(2.0).0).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().st(0).to_f64(), -2.0);
        assert_eq!(m.state().st(1).to_f64(), 1.0);
    }

    #[test]
    fn fptan_pushes_one() {
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80);
        code.extend_from_slice(&[0xd9, 0xf2]); // fptan
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut().write_bytes(DATA, &F80::from_f64(0.25).0).unwrap();
        run_to_halt(&mut m);
        assert_eq!(m.state().st(0).to_f64(), 1.0);
        assert!((m.state().st(1).to_f64() - 0.25f64.tan()).abs() < 1e-16);
    }

    #[test]
    fn infinity_minus_infinity_is_nan() {
        let mut code = vec![];
        code.extend_from_slice(&FLD_M80);
        code.extend_from_slice(&FLD_M80);
        code.extend_from_slice(&[0xde, 0xe9]); // fsubp
        code.push(0xf4);
        let mut m = machine(&code);
        m.mem_mut()
            .write_bytes(DATA, &f80::POSITIVE_INFINITY.0)
            .unwrap();
        run_to_halt(&mut m);
        assert!(m.state().st(0).is_nan());
    }
}
