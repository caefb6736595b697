//! `RFLAGS` storage and the arithmetic flag engine.
//!
//! Every ALU primitive lives here as a pure-ish helper that computes the
//! result *and* deposits exactly the flag bits the architecture defines for
//! it, leaving every other bit alone. The executor then never touches flag
//! bits by hand.

use crate::cpu::instr::{ConditionCode, OpSize, ShiftOp};

bitflags! {
    /// The `RFLAGS` register.
    ///
    /// Bit positions match the architectural layout so that `pushfq`/`popfq`
    /// can transfer the word verbatim.
    pub struct Flags: u64 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Parity flag (low result byte has even parity).
        const PF = 1 << 2;
        /// Auxiliary carry flag (carry out of bit 3).
        const AF = 1 << 4;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Interrupt enable. Not interpreted, but user code can observe it.
        const IF = 1 << 9;
        /// Direction flag for string operations.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
        /// Bit 1 reads as 1 on every processor.
        const FIXED = 1 << 1;
    }
}

impl Flags {
    /// Flags a `popfq` is allowed to change.
    pub const MODIFIABLE: Flags = Flags {
        bits: Flags::CF.bits
            | Flags::PF.bits
            | Flags::AF.bits
            | Flags::ZF.bits
            | Flags::SF.bits
            | Flags::DF.bits
            | Flags::OF.bits,
    };

    pub fn new() -> Flags {
        Flags::FIXED
    }

    /// Replaces PF, ZF and SF from `result`, keeping everything else.
    fn set_pzs(&mut self, result: u64, size: OpSize) {
        let result = result & size.mask();
        self.set(Flags::PF, parity(result));
        self.set(Flags::ZF, result == 0);
        self.set(Flags::SF, result & size.sign_bit() != 0);
    }

    /// Evaluates one of the 16 condition codes against the current flags.
    pub fn condition(&self, cc: ConditionCode) -> bool {
        let positive = match cc as u8 & 0x0e {
            0x00 => self.contains(Flags::OF),
            0x02 => self.contains(Flags::CF),
            0x04 => self.contains(Flags::ZF),
            0x06 => self.intersects(Flags::CF | Flags::ZF),
            0x08 => self.contains(Flags::SF),
            0x0a => self.contains(Flags::PF),
            0x0c => self.contains(Flags::SF) != self.contains(Flags::OF),
            0x0e => {
                self.contains(Flags::ZF) || self.contains(Flags::SF) != self.contains(Flags::OF)
            }
            _ => unreachable!(),
        };
        // Odd codes negate their even neighbor.
        positive != (cc as u8 & 1 != 0)
    }

    /// The trace-line flag summary: a set flag shows as its uppercase letter.
    pub fn summary(&self) -> String {
        [
            (Flags::CF, 'c'),
            (Flags::PF, 'p'),
            (Flags::AF, 'a'),
            (Flags::ZF, 'z'),
            (Flags::SF, 's'),
            (Flags::DF, 'd'),
            (Flags::OF, 'o'),
        ]
        .iter()
        .map(|&(bit, ch)| if self.contains(bit) { ch.to_ascii_uppercase() } else { ch })
        .collect()
    }
}

impl Default for Flags {
    fn default() -> Flags {
        Flags::new()
    }
}

/// 256-entry lookup for the parity flag.
const PARITY: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() % 2 == 0;
        i += 1;
    }
    table
};

fn parity(result: u64) -> bool {
    PARITY[(result & 0xff) as usize]
}

/// `a + b + carry` at the given width.
///
/// CF = unsigned overflow, OF = signed overflow, AF = carry out of bit 3,
/// PF/ZF/SF from the result.
pub fn add(flags: &mut Flags, a: u64, b: u64, carry: bool, size: OpSize) -> u64 {
    let mask = size.mask();
    let (a, b) = (a & mask, b & mask);
    let result = a.wrapping_add(b).wrapping_add(carry as u64) & mask;

    flags.set(Flags::CF, result < a || (carry && result == a));
    flags.set(Flags::OF, (!(a ^ b) & (a ^ result)) & size.sign_bit() != 0);
    flags.set(Flags::AF, (a ^ b ^ result) & 0x10 != 0);
    flags.set_pzs(result, size);
    result
}

/// `a - b - borrow` at the given width.
pub fn sub(flags: &mut Flags, a: u64, b: u64, borrow: bool, size: OpSize) -> u64 {
    let mask = size.mask();
    let (a, b) = (a & mask, b & mask);
    let result = a.wrapping_sub(b).wrapping_sub(borrow as u64) & mask;

    flags.set(Flags::CF, a < b || (borrow && a == b));
    flags.set(Flags::OF, ((a ^ b) & (a ^ result)) & size.sign_bit() != 0);
    flags.set(Flags::AF, (a ^ b ^ result) & 0x10 != 0);
    flags.set_pzs(result, size);
    result
}

/// Flag update shared by `and`/`or`/`xor`/`test`: CF and OF clear, AF kept.
pub fn logic(flags: &mut Flags, result: u64, size: OpSize) -> u64 {
    flags.remove(Flags::CF | Flags::OF);
    flags.set_pzs(result, size);
    result & size.mask()
}

/// `inc`/`dec`, which are add/sub by one that leave CF alone.
pub fn inc_dec(flags: &mut Flags, a: u64, dec: bool, size: OpSize) -> u64 {
    let cf = flags.contains(Flags::CF);
    let result = if dec {
        sub(flags, a, 1, false, size)
    } else {
        add(flags, a, 1, false, size)
    };
    flags.set(Flags::CF, cf);
    result
}

/// The shift/rotate group.
///
/// The count is masked to 5 bits (6 for 64-bit operands) first; a masked
/// count of zero changes neither the value nor any flag. Rotates update only
/// CF and OF, shifts update CF, OF (count 1) and PF/ZF/SF.
pub fn shift(flags: &mut Flags, op: ShiftOp, val: u64, count: u8, size: OpSize) -> u64 {
    let bits = size.bits();
    let count = (count & if bits == 64 { 0x3f } else { 0x1f }) as u32;
    if count == 0 {
        return val & size.mask();
    }

    let mask = size.mask();
    let val = val & mask;
    let msb = size.sign_bit();

    match op {
        ShiftOp::Shl | ShiftOp::Sal => {
            let wide = (val as u128) << count;
            let result = wide as u64 & mask;
            flags.set(Flags::CF, wide >> bits & 1 != 0);
            flags.set(
                Flags::OF,
                count == 1 && (val & msb != 0) != (val & msb >> 1 != 0),
            );
            flags.set_pzs(result, size);
            result
        }
        ShiftOp::Shr => {
            let result = if count >= 64 { 0 } else { val >> count };
            flags.set(Flags::CF, count <= bits && val >> (count - 1) & 1 != 0);
            flags.set(Flags::OF, count == 1 && val & msb != 0);
            flags.set_pzs(result, size);
            result
        }
        ShiftOp::Sar => {
            let signed = sign_extend(val, size);
            let result = (signed >> count.min(63)) as u64 & mask;
            flags.set(Flags::CF, (signed >> (count - 1).min(63)) & 1 != 0);
            flags.set(Flags::OF, false);
            flags.set_pzs(result, size);
            result
        }
        ShiftOp::Rol => {
            let n = count % bits;
            let result = (val << n | val.checked_shr(bits - n).unwrap_or(0)) & mask;
            flags.set(Flags::CF, result & 1 != 0);
            if count == 1 {
                let cf = flags.contains(Flags::CF);
                flags.set(Flags::OF, cf != (result & msb != 0));
            }
            result
        }
        ShiftOp::Ror => {
            let n = count % bits;
            let result = (val >> n | val.checked_shl(bits - n).unwrap_or(0)) & mask;
            flags.set(Flags::CF, result & msb != 0);
            if count == 1 {
                flags.set(Flags::OF, (result & msb != 0) != (result & msb >> 1 != 0));
            }
            result
        }
        ShiftOp::Rcl => {
            // Rotation through CF works on a (width + 1)-bit quantity.
            let n = count % (bits + 1);
            let cf_in = flags.contains(Flags::CF) as u128;
            let wide = (cf_in << bits) | val as u128;
            let rotated = if n == 0 {
                wide
            } else {
                (wide << n | wide >> (bits + 1 - n)) & ((1 << (bits + 1)) - 1)
            };
            let result = rotated as u64 & mask;
            flags.set(Flags::CF, rotated >> bits & 1 != 0);
            if count == 1 {
                let cf = flags.contains(Flags::CF);
                flags.set(Flags::OF, cf != (result & msb != 0));
            }
            result
        }
        ShiftOp::Rcr => {
            let n = count % (bits + 1);
            let cf_in = flags.contains(Flags::CF) as u128;
            let wide = (cf_in << bits) | val as u128;
            let rotated = if n == 0 {
                wide
            } else {
                (wide >> n | wide << (bits + 1 - n)) & ((1 << (bits + 1)) - 1)
            };
            let result = rotated as u64 & mask;
            flags.set(Flags::CF, rotated >> bits & 1 != 0);
            if count == 1 {
                flags.set(Flags::OF, (result & msb != 0) != (result & msb >> 1 != 0));
            }
            result
        }
    }
}

/// Sign-extends the low `size` bits of `val` to 64 bits, as a signed value.
pub fn sign_extend(val: u64, size: OpSize) -> i64 {
    match size {
        OpSize::Bits8 => val as u8 as i8 as i64,
        OpSize::Bits16 => val as u16 as i16 as i64,
        OpSize::Bits32 => val as u32 as i32 as i64,
        OpSize::Bits64 => val as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn add_carry_and_overflow() {
        let mut f = Flags::new();

        let r = add(&mut f, 0xff, 1, false, OpSize::Bits8);
        assert_eq!(r, 0);
        assert!(f.contains(Flags::CF | Flags::ZF | Flags::AF | Flags::PF));
        assert!(!f.contains(Flags::OF));

        let r = add(&mut f, 0x7f, 1, false, OpSize::Bits8);
        assert_eq!(r, 0x80);
        assert!(f.contains(Flags::OF | Flags::SF));
        assert!(!f.contains(Flags::CF));

        // Carry-in that causes the wrap on its own.
        let r = add(&mut f, 0xffff, 0, true, OpSize::Bits16);
        assert_eq!(r, 0);
        assert!(f.contains(Flags::CF));
    }

    #[test]
    fn add_sub_model_checks_random() {
        // Invariant 2: CF and OF match the unsigned/signed overflow
        // predicates at every width.
        let mut x: u64 = 0x243f_6a88_85a3_08d3;
        let mut next = || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };

        for &size in &[OpSize::Bits8, OpSize::Bits16, OpSize::Bits32, OpSize::Bits64] {
            let m = size.mask();
            for _ in 0..2000 {
                let (a, b) = (next() & m, next() & m);
                let cin = next() & 1 != 0;

                let mut f = Flags::new();
                let r = add(&mut f, a, b, cin, size);
                let wide = a as u128 + b as u128 + cin as u128;
                assert_eq!(r, (wide as u64) & m);
                assert_eq!(f.contains(Flags::CF), wide > m as u128);
                let sa = sign_extend(a, size) as i128;
                let sb = sign_extend(b, size) as i128;
                let signed = sa + sb + cin as i128;
                let min = -(1i128 << (size.bits() - 1));
                assert_eq!(f.contains(Flags::OF), signed < min || signed > -min - 1);

                let mut f = Flags::new();
                let r = sub(&mut f, a, b, cin, size);
                assert_eq!(r, a.wrapping_sub(b).wrapping_sub(cin as u64) & m);
                assert_eq!(f.contains(Flags::CF), (a as u128) < b as u128 + cin as u128);
                let signed = sa - sb - cin as i128;
                assert_eq!(f.contains(Flags::OF), signed < min || signed > -min - 1);
            }
        }
    }

    #[test]
    fn logic_clears_cf_of() {
        let mut f = Flags::CF | Flags::OF | Flags::AF | Flags::FIXED;
        logic(&mut f, 0, OpSize::Bits32);
        assert!(!f.contains(Flags::CF) && !f.contains(Flags::OF));
        assert!(f.contains(Flags::ZF | Flags::PF));
        // AF is left as-is.
        assert!(f.contains(Flags::AF));
    }

    #[test]
    fn shift_count_masking() {
        // Invariant: a count of 64 on a 64-bit operand is masked to 0 and
        // preserves both the value and the flags.
        let mut f = Flags::CF | Flags::OF | Flags::FIXED;
        let before = f;
        let r = shift(&mut f, ShiftOp::Shl, 0x0123_4567_89ab_cdef, 64, OpSize::Bits64);
        assert_eq!(r, 0x0123_4567_89ab_cdef);
        assert_eq!(f, before);

        let r = shift(&mut f, ShiftOp::Shl, 0xff, 32, OpSize::Bits8);
        assert_eq!(r, 0xff);
        assert_eq!(f, before);
    }

    #[test]
    fn shift_flags() {
        let mut f = Flags::new();
        let r = shift(&mut f, ShiftOp::Shl, 0x80, 1, OpSize::Bits8);
        assert_eq!(r, 0);
        assert!(f.contains(Flags::CF | Flags::ZF | Flags::OF));

        let mut f = Flags::new();
        let r = shift(&mut f, ShiftOp::Shr, 0x03, 1, OpSize::Bits8);
        assert_eq!(r, 1);
        assert!(f.contains(Flags::CF));
        assert!(!f.contains(Flags::OF));

        let mut f = Flags::new();
        let r = shift(&mut f, ShiftOp::Sar, 0x80, 2, OpSize::Bits8);
        assert_eq!(r, 0xe0);
        assert!(!f.contains(Flags::CF));
        assert!(f.contains(Flags::SF));
    }

    #[test]
    fn rotate_preserves_zf() {
        let mut f = Flags::ZF | Flags::FIXED;
        let r = shift(&mut f, ShiftOp::Rol, 0x81, 1, OpSize::Bits8);
        assert_eq!(r, 0x03);
        assert!(f.contains(Flags::ZF));
        assert!(f.contains(Flags::CF));
    }

    #[test]
    fn rcl_rcr_through_carry() {
        let mut f = Flags::CF | Flags::FIXED;
        let r = shift(&mut f, ShiftOp::Rcl, 0x00, 1, OpSize::Bits8);
        assert_eq!(r, 0x01);
        assert!(!f.contains(Flags::CF));

        let mut f = Flags::CF | Flags::FIXED;
        let r = shift(&mut f, ShiftOp::Rcr, 0x00, 1, OpSize::Bits8);
        assert_eq!(r, 0x80);
        assert!(!f.contains(Flags::CF));

        // A full rotation through all 9 positions restores the value.
        let mut f = Flags::new();
        let r = shift(&mut f, ShiftOp::Rcl, 0xa5, 9, OpSize::Bits8);
        assert_eq!(r, 0xa5);
        assert!(!f.contains(Flags::CF));
    }

    #[test]
    fn conditions() {
        let mut f = Flags::new();
        sub(&mut f, 3, 5, false, OpSize::Bits32);
        // 3 - 5: below (unsigned) and less (signed).
        assert!(f.condition(ConditionCode::from_u8(0x2).unwrap())); // b
        assert!(f.condition(ConditionCode::from_u8(0xc).unwrap())); // l
        assert!(!f.condition(ConditionCode::from_u8(0x4).unwrap())); // e
        assert!(f.condition(ConditionCode::from_u8(0x5).unwrap())); // ne
        assert!(f.condition(ConditionCode::from_u8(0xe).unwrap())); // le
        assert!(!f.condition(ConditionCode::from_u8(0xf).unwrap())); // g
    }

    #[test]
    fn summary_string() {
        let f = Flags::CF | Flags::ZF | Flags::FIXED;
        assert_eq!(f.summary(), "CpaZsdo");
    }
}
