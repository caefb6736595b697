//! Instruction disassembler and pretty printer.
//!
//! This is what the tracer prints through. It never touches architectural
//! state; relative branch targets were already folded to absolute addresses
//! by the decoder, so no context is needed to render them.

use crate::cpu::instr::*;

/// Trait for assembly printing contexts.
///
/// The plain `String` impl concatenates everything; a fancier host can
/// implement this to color mnemonics, registers and targets differently.
pub trait AsmPrinter {
    /// Print an instruction mnemonic/name.
    fn print_mnemonic(&mut self, mnemonic: &str);

    /// Prints a register operand (or part of an operand).
    fn print_register(&mut self, name: &str);

    /// Prints an immediate operand.
    fn print_immediate(&mut self, imm: &str);

    /// Prints an address or an address offset of an operand.
    fn print_addr_or_offset(&mut self, addr: &str);

    /// Prints a jump or call target.
    fn print_jump_target(&mut self, target: &str);

    /// Print a string of symbol characters like `,[]+*`.
    fn print_symbols(&mut self, sym: &str);

    /// Called when the instruction is fully printed.
    fn done(&mut self);
}

/// Prints the instruction to a string, without formatting.
impl AsmPrinter for String {
    fn print_mnemonic(&mut self, mnemonic: &str) {
        self.push_str(mnemonic);
    }

    fn print_register(&mut self, name: &str) {
        self.push_str(name);
    }

    fn print_immediate(&mut self, imm: &str) {
        self.push_str(imm);
    }

    fn print_addr_or_offset(&mut self, addr: &str) {
        self.push_str(addr);
    }

    fn print_jump_target(&mut self, target: &str) {
        self.push_str(target);
    }

    fn print_symbols(&mut self, sym: &str) {
        self.push_str(sym);
    }

    fn done(&mut self) {}
}

/// Immediate formatting: decimal for counts and arithmetic, hex for masks
/// and addresses.
#[derive(Copy, Clone)]
enum ImmRepr {
    Dec,
    Hex,
}

fn imm_string(imm: &Immediate, repr: ImmRepr) -> String {
    match repr {
        ImmRepr::Dec => format!("{}", imm),
        ImmRepr::Hex => format!("{:#x}", imm),
    }
}

fn mem_size_keyword(size: OpSize) -> &'static str {
    size.keyword()
}

fn print_mem<P: AsmPrinter>(p: &mut P, mem: &MemoryLocation) {
    p.print_symbols("[");
    if let Some(seg) = mem.segment {
        p.print_register(seg.name());
        p.print_symbols(":");
    }

    let mut have_base = true;
    match mem.base {
        Base::Reg(index) => p.print_register(Register::new(index, OpSize::Bits64).name()),
        Base::Rip => p.print_register("rip"),
        Base::None => have_base = false,
    }

    if let Some((index, scale)) = mem.index {
        if have_base {
            p.print_symbols("+");
        }
        p.print_register(Register::new(index, OpSize::Bits64).name());
        if scale > 0 {
            p.print_symbols("*");
            p.print_addr_or_offset(&(1u32 << scale).to_string());
        }
        have_base = true;
    }

    if !have_base {
        p.print_addr_or_offset(&format!("{:#x}", mem.disp));
    } else if mem.disp != 0 {
        p.print_symbols(if mem.disp > 0 { "+" } else { "-" });
        p.print_addr_or_offset(&format!("{:#x}", mem.disp.unsigned_abs()));
    }
    p.print_symbols("]");
}

/// # Parameters
///
/// * `size_hint`: Print a `byte`/`word`/... keyword before memory operands;
///   used when no register operand pins the width down.
fn print_operand<P: AsmPrinter>(p: &mut P, op: &Operand, repr: ImmRepr, size_hint: bool) {
    match op {
        Operand::Reg(reg) => p.print_register(reg.name()),
        Operand::Imm(imm) => p.print_immediate(&imm_string(imm, repr)),
        Operand::Mem(mem) => {
            if size_hint {
                p.print_immediate(mem_size_keyword(mem.size));
                p.print_symbols(" ");
            }
            print_mem(p, mem);
        }
    }
}

/// Prints `mnemonic a,b` with the usual disambiguation rule: a memory
/// operand gets a size keyword only when no register operand fixes the
/// width.
fn print_binary<P: AsmPrinter>(p: &mut P, mnemonic: &str, a: &Operand, b: &Operand, repr: ImmRepr) {
    let any_reg =
        matches!(a, Operand::Reg(_)) || matches!(b, Operand::Reg(_));
    p.print_mnemonic(mnemonic);
    p.print_symbols(" ");
    print_operand(p, a, repr, !any_reg);
    p.print_symbols(",");
    print_operand(p, b, repr, false);
}

fn print_unary<P: AsmPrinter>(p: &mut P, mnemonic: &str, operand: &Operand) {
    p.print_mnemonic(mnemonic);
    p.print_symbols(" ");
    print_operand(p, operand, ImmRepr::Hex, true);
}

fn print_target<P: AsmPrinter>(p: &mut P, mnemonic: &str, target: &Operand) {
    p.print_mnemonic(mnemonic);
    p.print_symbols(" ");
    match target {
        Operand::Imm(imm) => p.print_jump_target(&format!("{:#x}", imm.zero_extended())),
        other => print_operand(p, other, ImmRepr::Hex, true),
    }
}

fn st<P: AsmPrinter>(p: &mut P, i: u8) {
    p.print_register(&format!("st({})", i));
}

fn xmm<P: AsmPrinter>(p: &mut P, i: u8) {
    p.print_register(&format!("xmm{}", i));
}

fn print_xmm_rm<P: AsmPrinter>(p: &mut P, rm: &XmmRm) {
    match rm {
        XmmRm::Reg(i) => xmm(p, *i),
        XmmRm::Mem(mem) => print_mem(p, mem),
    }
}

fn print_xmm_pair<P: AsmPrinter>(p: &mut P, mnemonic: &str, dst: &XmmRm, src: &XmmRm) {
    p.print_mnemonic(mnemonic);
    p.print_symbols(" ");
    print_xmm_rm(p, dst);
    p.print_symbols(",");
    print_xmm_rm(p, src);
}

fn print_xmm_ds<P: AsmPrinter>(p: &mut P, mnemonic: &str, dst: u8, src: &XmmRm) {
    p.print_mnemonic(mnemonic);
    p.print_symbols(" ");
    xmm(p, dst);
    p.print_symbols(",");
    print_xmm_rm(p, src);
}

/// x87 memory operand with its width spelled out (`tword` for the 10-byte
/// extended form).
fn print_fpu_mem<P: AsmPrinter>(p: &mut P, mem: &MemoryLocation, keyword: &str) {
    p.print_immediate(keyword);
    p.print_symbols(" ");
    print_mem(p, mem);
}

/// Renders one instruction through `p`.
pub fn print_instr<P: AsmPrinter>(instr: &Instr, p: &mut P) {
    match instr {
        Instr::Alu { op, dest, src } => {
            let repr = match op {
                AluOp::Add | AluOp::Adc | AluOp::Sbb | AluOp::Sub => ImmRepr::Dec,
                _ => ImmRepr::Hex,
            };
            print_binary(p, op.mnemonic(), dest, src, repr);
        }
        Instr::Shift { op, dest, src } => print_binary(p, op.mnemonic(), dest, src, ImmRepr::Dec),
        Instr::ShiftD {
            left,
            dest,
            src,
            count,
        } => {
            p.print_mnemonic(if *left { "shld" } else { "shrd" });
            p.print_symbols(" ");
            print_operand(p, dest, ImmRepr::Dec, false);
            p.print_symbols(",");
            p.print_register(src.name());
            p.print_symbols(",");
            print_operand(p, count, ImmRepr::Dec, false);
        }
        Instr::Mov { dest, src } => print_binary(p, "mov", dest, src, ImmRepr::Hex),
        Instr::MovZx { dest, src } => {
            print_binary(p, "movzx", &dest.clone().into(), src, ImmRepr::Hex)
        }
        Instr::MovSx { dest, src } => {
            print_binary(p, "movsx", &dest.clone().into(), src, ImmRepr::Hex)
        }
        Instr::Xchg { reg, rm } => print_binary(p, "xchg", rm, &reg.clone().into(), ImmRepr::Hex),
        Instr::Lea { dest, src } => {
            p.print_mnemonic("lea");
            p.print_symbols(" ");
            p.print_register(dest.name());
            p.print_symbols(",");
            print_mem(p, src);
        }
        Instr::Test { lhs, rhs } => print_binary(p, "test", lhs, rhs, ImmRepr::Hex),
        Instr::Not { operand } => print_unary(p, "not", operand),
        Instr::Neg { operand } => print_unary(p, "neg", operand),
        Instr::Mul { operand } => print_unary(p, "mul", operand),
        Instr::Imul { operand } => print_unary(p, "imul", operand),
        Instr::ImulTrunc { dest, src1, src2 } => {
            // The common two-operand form folds dest and src1 together.
            let two_op = matches!(src1, Operand::Reg(r) if r == dest);
            p.print_mnemonic("imul");
            p.print_symbols(" ");
            p.print_register(dest.name());
            if !two_op {
                p.print_symbols(",");
                print_operand(p, src1, ImmRepr::Dec, false);
            } else {
                p.print_symbols(",");
            }
            if !two_op {
                p.print_symbols(",");
            }
            print_operand(p, src2, ImmRepr::Dec, false);
        }
        Instr::Div { operand } => print_unary(p, "div", operand),
        Instr::Idiv { operand } => print_unary(p, "idiv", operand),
        Instr::Inc { operand } => print_unary(p, "inc", operand),
        Instr::Dec { operand } => print_unary(p, "dec", operand),
        Instr::Push { operand } => print_unary(p, "push", operand),
        Instr::Pop { operand } => print_unary(p, "pop", operand),
        Instr::Pushf => p.print_mnemonic("pushfq"),
        Instr::Popf => p.print_mnemonic("popfq"),
        Instr::Leave { .. } => p.print_mnemonic("leave"),
        Instr::Jump { target } => print_target(p, "jmp", target),
        Instr::JumpIf { cc, target } => {
            print_target(p, &format!("j{}", cc.suffix()), target)
        }
        Instr::JumpCxz { size, target } => {
            let mnemonic = if *size == OpSize::Bits32 { "jecxz" } else { "jrcxz" };
            print_target(p, mnemonic, target)
        }
        Instr::Call { target } => print_target(p, "call", target),
        Instr::Ret { pop } => {
            p.print_mnemonic("ret");
            if *pop != 0 {
                p.print_symbols(" ");
                p.print_immediate(&pop.to_string());
            }
        }
        Instr::SetIf { cc, operand } => {
            p.print_mnemonic(&format!("set{}", cc.suffix()));
            p.print_symbols(" ");
            print_operand(p, operand, ImmRepr::Hex, true);
        }
        Instr::MovIf { cc, dest, src } => {
            print_binary(
                p,
                &format!("cmov{}", cc.suffix()),
                &dest.clone().into(),
                src,
                ImmRepr::Hex,
            );
        }
        Instr::StrMem { op, rep, size } => {
            match rep {
                RepKind::Rep => {
                    p.print_mnemonic("rep");
                    p.print_symbols(" ");
                }
                RepKind::Repne => {
                    p.print_mnemonic("repne");
                    p.print_symbols(" ");
                }
                RepKind::None => {}
            }
            let suffix = match size {
                OpSize::Bits8 => "b",
                OpSize::Bits16 => "w",
                OpSize::Bits32 => "d",
                OpSize::Bits64 => "q",
            };
            p.print_mnemonic(&format!("{}{}", op.mnemonic(), suffix));
        }
        Instr::BitScan { reverse, dest, src } => {
            print_binary(
                p,
                if *reverse { "bsr" } else { "bsf" },
                &dest.clone().into(),
                src,
                ImmRepr::Hex,
            );
        }
        Instr::BitTest { op, operand, bit } => {
            print_binary(p, op.mnemonic(), operand, bit, ImmRepr::Dec)
        }
        Instr::Bswap { reg } => {
            p.print_mnemonic("bswap");
            p.print_symbols(" ");
            p.print_register(reg.name());
        }
        Instr::Convert { kind } => p.print_mnemonic(kind.mnemonic()),
        Instr::Xadd { dest, src } => {
            print_binary(p, "xadd", dest, &src.clone().into(), ImmRepr::Hex)
        }
        Instr::CmpXchg { dest, src } => {
            print_binary(p, "cmpxchg", dest, &src.clone().into(), ImmRepr::Hex)
        }
        Instr::SetFlag { kind } => p.print_mnemonic(kind.mnemonic()),
        Instr::Cpuid => p.print_mnemonic("cpuid"),
        Instr::Syscall => p.print_mnemonic("syscall"),
        Instr::Halt => p.print_mnemonic("hlt"),
        Instr::Nop => p.print_mnemonic("nop"),
        Instr::Fpu(fpu) => print_fpu(p, fpu),
        Instr::Sse(sse) => print_sse(p, sse),
    }
    p.done();
}

fn print_fpu<P: AsmPrinter>(p: &mut P, instr: &FpuInstr) {
    match instr {
        FpuInstr::Load(src) => {
            let (mnemonic, operand): (&str, _) = match src {
                FpuLoad::M32(mem) => ("fld", Some((mem, "dword"))),
                FpuLoad::M64(mem) => ("fld", Some((mem, "qword"))),
                FpuLoad::M80(mem) => ("fld", Some((mem, "tword"))),
                FpuLoad::I16(mem) => ("fild", Some((mem, "word"))),
                FpuLoad::I32(mem) => ("fild", Some((mem, "dword"))),
                FpuLoad::I64(mem) => ("fild", Some((mem, "qword"))),
                FpuLoad::St(i) => {
                    p.print_mnemonic("fld");
                    p.print_symbols(" ");
                    st(p, *i);
                    return;
                }
                FpuLoad::One => ("fld1", None),
                FpuLoad::Zero => ("fldz", None),
                FpuLoad::Pi => ("fldpi", None),
                FpuLoad::L2e => ("fldl2e", None),
                FpuLoad::L2t => ("fldl2t", None),
                FpuLoad::Lg2 => ("fldlg2", None),
                FpuLoad::Ln2 => ("fldln2", None),
            };
            p.print_mnemonic(mnemonic);
            if let Some((mem, keyword)) = operand {
                p.print_symbols(" ");
                print_fpu_mem(p, mem, keyword);
            }
        }
        FpuInstr::Store { dst, pop } => {
            let (base, operand) = match dst {
                FpuStore::M32(mem) => ("fst", Some((mem, "dword"))),
                FpuStore::M64(mem) => ("fst", Some((mem, "qword"))),
                FpuStore::M80(mem) => ("fst", Some((mem, "tword"))),
                FpuStore::I16(mem) => ("fist", Some((mem, "word"))),
                FpuStore::I32(mem) => ("fist", Some((mem, "dword"))),
                FpuStore::I64(mem) => ("fist", Some((mem, "qword"))),
                FpuStore::St(i) => {
                    p.print_mnemonic(if *pop { "fstp" } else { "fst" });
                    p.print_symbols(" ");
                    st(p, *i);
                    return;
                }
            };
            p.print_mnemonic(&format!("{}{}", base, if *pop { "p" } else { "" }));
            if let Some((mem, keyword)) = operand {
                p.print_symbols(" ");
                print_fpu_mem(p, mem, keyword);
            }
        }
        FpuInstr::Arith { op, form } => match form {
            FpuForm::M32(mem) => {
                p.print_mnemonic(op.mnemonic());
                p.print_symbols(" ");
                print_fpu_mem(p, mem, "dword");
            }
            FpuForm::M64(mem) => {
                p.print_mnemonic(op.mnemonic());
                p.print_symbols(" ");
                print_fpu_mem(p, mem, "qword");
            }
            FpuForm::I16(mem) => {
                p.print_mnemonic(&format!("fi{}", &op.mnemonic()[1..]));
                p.print_symbols(" ");
                print_fpu_mem(p, mem, "word");
            }
            FpuForm::I32(mem) => {
                p.print_mnemonic(&format!("fi{}", &op.mnemonic()[1..]));
                p.print_symbols(" ");
                print_fpu_mem(p, mem, "dword");
            }
            FpuForm::St0Sti(i) => {
                p.print_mnemonic(op.mnemonic());
                p.print_symbols(" ");
                st(p, 0);
                p.print_symbols(",");
                st(p, *i);
            }
            FpuForm::StiSt0 { i, pop } => {
                p.print_mnemonic(&format!("{}{}", op.mnemonic(), if *pop { "p" } else { "" }));
                p.print_symbols(" ");
                st(p, *i);
                p.print_symbols(",");
                st(p, 0);
            }
        },
        FpuInstr::Com {
            src,
            pops,
            unordered,
            eflags,
        } => {
            let mut mnemonic = String::from(if *unordered { "fucom" } else { "fcom" });
            if *eflags {
                mnemonic.push('i');
            }
            for _ in 0..*pops {
                mnemonic.push('p');
            }
            p.print_mnemonic(&mnemonic);
            if *pops == 2 {
                return;
            }
            p.print_symbols(" ");
            match src {
                FpuComSrc::M32(mem) => print_fpu_mem(p, mem, "dword"),
                FpuComSrc::M64(mem) => print_fpu_mem(p, mem, "qword"),
                FpuComSrc::St(i) => st(p, *i),
            }
        }
        FpuInstr::Tst => p.print_mnemonic("ftst"),
        FpuInstr::Xam => p.print_mnemonic("fxam"),
        FpuInstr::Cmov { cc, i } => {
            let suffix = match cc {
                ConditionCode::Parity => "u",
                ConditionCode::NotParity => "nu",
                other => other.suffix(),
            };
            p.print_mnemonic(&format!("fcmov{}", suffix));
            p.print_symbols(" ");
            st(p, 0);
            p.print_symbols(",");
            st(p, *i);
        }
        FpuInstr::Xch(i) => {
            p.print_mnemonic("fxch");
            p.print_symbols(" ");
            st(p, *i);
        }
        FpuInstr::Unary(op) => p.print_mnemonic(op.mnemonic()),
        FpuInstr::Free(i) => {
            p.print_mnemonic("ffree");
            p.print_symbols(" ");
            st(p, *i);
        }
        FpuInstr::IncStp => p.print_mnemonic("fincstp"),
        FpuInstr::DecStp => p.print_mnemonic("fdecstp"),
        FpuInstr::Nop => p.print_mnemonic("fnop"),
        FpuInstr::LdCw(mem) => {
            p.print_mnemonic("fldcw");
            p.print_symbols(" ");
            print_fpu_mem(p, mem, "word");
        }
        FpuInstr::StCw(mem) => {
            p.print_mnemonic("fnstcw");
            p.print_symbols(" ");
            print_fpu_mem(p, mem, "word");
        }
        FpuInstr::StSw(dst) => {
            p.print_mnemonic("fnstsw");
            p.print_symbols(" ");
            match dst {
                FpuStswDst::Ax => p.print_register("ax"),
                FpuStswDst::M16(mem) => print_fpu_mem(p, mem, "word"),
            }
        }
        FpuInstr::LdEnv(mem) => {
            p.print_mnemonic("fldenv");
            p.print_symbols(" ");
            print_mem(p, mem);
        }
        FpuInstr::StEnv(mem) => {
            p.print_mnemonic("fnstenv");
            p.print_symbols(" ");
            print_mem(p, mem);
        }
        FpuInstr::Init => p.print_mnemonic("fninit"),
    }
}

fn print_sse<P: AsmPrinter>(p: &mut P, instr: &SseInstr) {
    match instr {
        SseInstr::Mov128 { kind, dst, src } => print_xmm_pair(p, kind.mnemonic(), dst, src),
        SseInstr::MovScalar { double, dst, src } => {
            print_xmm_pair(p, if *double { "movsd" } else { "movss" }, dst, src)
        }
        SseInstr::MovHalf {
            double,
            dst,
            dst_high,
            src,
            src_high,
        } => {
            let reg_reg = matches!(dst, XmmRm::Reg(_)) && matches!(src, XmmRm::Reg(_));
            let mnemonic = if reg_reg {
                if *dst_high { "movlhps" } else { "movhlps" }
            } else {
                let high = if matches!(dst, XmmRm::Reg(_)) { *dst_high } else { *src_high };
                match (high, *double) {
                    (false, false) => "movlps",
                    (false, true) => "movlpd",
                    (true, false) => "movhps",
                    (true, true) => "movhpd",
                }
            };
            print_xmm_pair(p, mnemonic, dst, src);
        }
        SseInstr::MovD {
            wide,
            to_xmm,
            xmm: x,
            rm,
        } => {
            p.print_mnemonic(if *wide { "movq" } else { "movd" });
            p.print_symbols(" ");
            if *to_xmm {
                xmm(p, *x);
                p.print_symbols(",");
                print_operand(p, rm, ImmRepr::Hex, false);
            } else {
                print_operand(p, rm, ImmRepr::Hex, false);
                p.print_symbols(",");
                xmm(p, *x);
            }
        }
        SseInstr::MovQ { dst, src } => print_xmm_pair(p, "movq", dst, src),
        SseInstr::Arith { op, ty, dst, src } => {
            print_xmm_ds(p, &format!("{}{}", op.mnemonic(), ty.suffix()), *dst, src)
        }
        SseInstr::Logic {
            op,
            double,
            dst,
            src,
        } => {
            let suffix = if *double { "pd" } else { "ps" };
            print_xmm_ds(p, &format!("{}{}", op.mnemonic(), suffix), *dst, src)
        }
        SseInstr::Cmp {
            ty,
            dst,
            src,
            predicate,
        } => {
            print_xmm_ds(p, &format!("cmp{}", ty.suffix()), *dst, src);
            p.print_symbols(",");
            p.print_immediate(&format!("{:#x}", predicate));
        }
        SseInstr::Comis {
            double,
            unordered,
            lhs,
            rhs,
        } => {
            let mnemonic = match (unordered, double) {
                (true, false) => "ucomiss",
                (true, true) => "ucomisd",
                (false, false) => "comiss",
                (false, true) => "comisd",
            };
            print_xmm_ds(p, mnemonic, *lhs, rhs);
        }
        SseInstr::CvtFromInt {
            double,
            wide: _,
            xmm: x,
            src,
        } => {
            p.print_mnemonic(if *double { "cvtsi2sd" } else { "cvtsi2ss" });
            p.print_symbols(" ");
            xmm(p, *x);
            p.print_symbols(",");
            print_operand(p, src, ImmRepr::Hex, true);
        }
        SseInstr::CvtToInt {
            double,
            wide: _,
            trunc,
            gpr,
            src,
        } => {
            let mnemonic = match (trunc, double) {
                (true, true) => "cvttsd2si",
                (true, false) => "cvttss2si",
                (false, true) => "cvtsd2si",
                (false, false) => "cvtss2si",
            };
            p.print_mnemonic(mnemonic);
            p.print_symbols(" ");
            p.print_register(gpr.name());
            p.print_symbols(",");
            print_xmm_rm(p, src);
        }
        SseInstr::CvtScalar {
            to_double,
            xmm: x,
            src,
        } => {
            p.print_mnemonic(if *to_double { "cvtss2sd" } else { "cvtsd2ss" });
            p.print_symbols(" ");
            xmm(p, *x);
            p.print_symbols(",");
            print_xmm_rm(p, src);
        }
        SseInstr::CvtPacked { kind, xmm: x, src } => {
            p.print_mnemonic(kind.mnemonic());
            p.print_symbols(" ");
            xmm(p, *x);
            p.print_symbols(",");
            print_xmm_rm(p, src);
        }
        SseInstr::PackedInt { op, dst, src } => print_xmm_ds(p, op.mnemonic(), *dst, src),
        SseInstr::PShift { op, dst, count } => {
            p.print_mnemonic(op.mnemonic());
            p.print_symbols(" ");
            xmm(p, *dst);
            p.print_symbols(",");
            match count {
                PShiftCount::Imm(n) => p.print_immediate(&n.to_string()),
                PShiftCount::Reg(rm) => print_xmm_rm(p, rm),
            }
        }
        SseInstr::Shuffle {
            kind,
            dst,
            src,
            control,
        } => {
            print_xmm_ds(p, kind.mnemonic(), *dst, src);
            p.print_symbols(",");
            p.print_immediate(&format!("{:#x}", control));
        }
        SseInstr::MovMsk { kind, gpr, src } => {
            p.print_mnemonic(kind.mnemonic());
            p.print_symbols(" ");
            p.print_register(gpr.name());
            p.print_symbols(",");
            xmm(p, *src);
        }
        SseInstr::LdMxcsr(mem) => {
            p.print_mnemonic("ldmxcsr");
            p.print_symbols(" ");
            print_fpu_mem(p, mem, "dword");
        }
        SseInstr::StMxcsr(mem) => {
            p.print_mnemonic("stmxcsr");
            p.print_symbols(" ");
            print_fpu_mem(p, mem, "dword");
        }
    }
}
