//! Conversions between the 10-byte x87 extended-precision layout and
//! `rug::Float`.
//!
//! The x87 register stack stores raw 10-byte values; arithmetic is carried
//! out on `rug::Float` with a 64-bit significand, which matches the extended
//! format's significand width exactly. Keeping the stored form as bytes means
//! `fld m80` / `fstp m80` round-trips are bit-exact, NaN payloads included.
//!
//! Memory layout (little-endian): bytes 0..8 hold the 64-bit significand with
//! an explicit integer bit at bit 63, bytes 8..10 hold a 15-bit biased
//! exponent (bias 16383) and the sign in bit 15.

use std::convert::TryInto;
use std::fmt::{self, Formatter, LowerHex, UpperHex};

use rug::float::Special;
use rug::ops::NegAssign;
use rug::{Float, Integer};

/// Significand width of the extended format, and the precision used for all
/// x87 arithmetic.
pub const PRECISION: u32 = 64;

const EXPONENT_BITS: u32 = 15;
const EXPONENT_BIAS: i32 = (1 << (EXPONENT_BITS - 1)) - 1;
const EXPONENT_MAX: i32 = EXPONENT_BIAS;
/// Smallest exponent expressible without going through the subnormal
/// encoding (biased exponent field of 0).
const EXPONENT_MIN: i32 = 1 - EXPONENT_MAX;

pub const POSITIVE_ZERO: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
pub const NEGATIVE_ZERO: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0, 0, 0x80]);

/// The quiet NaN produced for host NaNs without a payload to preserve.
pub const POSITIVE_NAN: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0xc0, 0xff, 0x7f]);
pub const NEGATIVE_NAN: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0xc0, 0xff, 0xff]);

pub const POSITIVE_INFINITY: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0x80, 0xff, 0x7f]);
pub const NEGATIVE_INFINITY: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0x80, 0xff, 0xff]);

pub const ONE: F80 = F80([0, 0, 0, 0, 0, 0, 0, 0x80, 0xff, 0x3f]);

/// An 80-bit extended precision floating point value in memory form.
///
/// This type carries the binary representation only; no arithmetic is defined
/// on it. Convert to [`Float`] for computation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct F80(pub [u8; 10]);

macro_rules! impl_disp {
    ($trait:ident [ $fmt:expr ]) => {
        impl $trait for F80 {
            fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
                for &v in self.0.iter().rev() {
                    write!(f, $fmt, v)?;
                }
                Ok(())
            }
        }
    };
}
impl_disp! { LowerHex["{:02x}"] }
impl_disp! { UpperHex["{:02X}"] }

impl F80 {
    /// Splits the raw representation into (sign, biased exponent field,
    /// significand with integer bit).
    fn unpack(&self) -> (bool, u16, u64) {
        let sig = u64::from_le_bytes(self.0[0..8].try_into().unwrap());
        let se = u16::from_le_bytes(self.0[8..10].try_into().unwrap());
        (se & 0x8000 != 0, se & 0x7fff, sig)
    }

    fn pack(negative: bool, exp: u16, sig: u64) -> F80 {
        let mut v = [0; 10];
        v[0..8].copy_from_slice(&sig.to_le_bytes());
        let se = exp | if negative { 0x8000 } else { 0 };
        v[8..10].copy_from_slice(&se.to_le_bytes());
        F80(v)
    }

    pub fn is_nan(&self) -> bool {
        let (_, exp, sig) = self.unpack();
        exp == 0x7fff && sig << 1 != 0
    }

    pub fn is_infinite(&self) -> bool {
        let (_, exp, sig) = self.unpack();
        exp == 0x7fff && sig << 1 == 0
    }

    pub fn is_zero(&self) -> bool {
        let (_, exp, sig) = self.unpack();
        exp == 0 && sig == 0
    }

    /// True for subnormals and for values whose integer bit is clear even
    /// though the exponent field is not 0 ("unnormals", which no current
    /// hardware generates).
    pub fn is_denormal(&self) -> bool {
        let (_, exp, sig) = self.unpack();
        exp != 0x7fff && sig >> 63 == 0 && sig != 0
    }

    pub fn is_sign_negative(&self) -> bool {
        self.0[9] & 0x80 != 0
    }

    /// Expands into a `Float` with [`PRECISION`] bits of significand.
    ///
    /// Zeros, subnormals, unnormals, infinities and NaNs all map onto the
    /// corresponding `Float` specials; the expansion of finite values is
    /// exact because the `Float` significand is as wide as ours.
    pub fn to_float(&self) -> Float {
        let (negative, exp, sig) = self.unpack();
        let mut res = match exp {
            0x7fff => {
                if sig << 1 == 0 {
                    Float::with_val(PRECISION, Special::Infinity)
                } else {
                    Float::with_val(PRECISION, Special::Nan)
                }
            }
            0 if sig == 0 => Float::new(PRECISION),
            _ => {
                // Subnormals (exp field 0) weigh the significand like exp
                // field 1 but without the integer bit, which the shift
                // below accounts for on its own.
                let field = if exp == 0 { 1 } else { exp as i32 };
                let mut f = Float::with_val(PRECISION, sig);
                f <<= field - EXPONENT_BIAS - 63;
                f
            }
        };
        if negative {
            res.neg_assign();
        }
        res
    }

    /// Rounds a `Float` into the 80-bit memory form, ties to even.
    ///
    /// Exponents beyond the format saturate to infinity; values too small
    /// for the subnormal range flush to zero.
    pub fn from_float(value: &Float) -> F80 {
        if value.is_nan() {
            return if value.is_sign_positive() { POSITIVE_NAN } else { NEGATIVE_NAN };
        }
        if value.is_infinite() {
            return if value.is_sign_positive() { POSITIVE_INFINITY } else { NEGATIVE_INFINITY };
        }
        if value.is_zero() {
            return if value.is_sign_positive() { POSITIVE_ZERO } else { NEGATIVE_ZERO };
        }

        let (mut sig, mut exp) = Float::with_val(PRECISION, value).to_integer_exp().unwrap();
        let negative = sig < 0;
        if negative {
            sig.neg_assign();
        }

        // Normalize to exactly 64 significant bits. `to_integer_exp` returns
        // value = sig * 2^exp, so widening the significand lowers `exp`.
        let dif = sig.significant_bits() as i32 - 64;
        if dif != 0 {
            sig = if dif > 0 { sig >> dif as u32 } else { sig << (-dif) as u32 };
            exp += dif;
        }
        // Biased exponent of the leading bit (bit 63 has weight 2^(exp+63)).
        let mut field = exp + 63 + EXPONENT_BIAS;

        if field > 0x7ffe {
            return if negative { NEGATIVE_INFINITY } else { POSITIVE_INFINITY };
        }
        if field <= 0 {
            // Subnormal range: shift the significand down and round the
            // dropped bits to nearest, ties to even.
            let shift = (1 - field) as u32;
            if shift > 64 {
                return if negative { NEGATIVE_ZERO } else { POSITIVE_ZERO };
            }
            sig = shr_round_even(sig, shift);
            field = 0;
            if sig.significant_bits() == 65 {
                // Rounded all the way up to the smallest normal.
                sig >>= 1;
                field = 1;
            }
        }

        F80::pack(negative, field as u16, sig.to_u64().unwrap())
    }

    pub fn from_f64(value: f64) -> F80 {
        F80::from_float(&Float::with_val(PRECISION, value))
    }

    pub fn from_f32(value: f32) -> F80 {
        F80::from_float(&Float::with_val(PRECISION, value))
    }

    /// Narrows to an `f64`, rounding to nearest and producing double
    /// subnormals or infinities where the exponent demands it.
    pub fn to_f64(&self) -> f64 {
        self.to_float().to_f64()
    }

    pub fn to_f32(&self) -> f32 {
        self.to_float().to_f32()
    }
}

impl Default for F80 {
    fn default() -> F80 {
        POSITIVE_ZERO
    }
}

impl From<f64> for F80 {
    fn from(value: f64) -> F80 {
        F80::from_f64(value)
    }
}

impl From<f32> for F80 {
    fn from(value: f32) -> F80 {
        F80::from_f32(value)
    }
}

impl From<Float> for F80 {
    fn from(value: Float) -> F80 {
        F80::from_float(&value)
    }
}

impl From<F80> for Float {
    fn from(value: F80) -> Float {
        value.to_float()
    }
}

/// Shift right with round-to-nearest, ties to even.
fn shr_round_even(sig: Integer, shift: u32) -> Integer {
    if shift == 0 {
        return sig;
    }
    let mask = (Integer::from(1) << shift) - 1u32;
    let dropped = Integer::from(&sig & &mask);
    let mut out = sig >> shift;
    let half = Integer::from(1) << (shift - 1);
    if dropped > half || (dropped == half && out.is_odd()) {
        out += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: F80) -> F80 {
        F80::from_float(&v.to_float())
    }

    #[test]
    fn specials() {
        assert_eq!(roundtrip(POSITIVE_ZERO), POSITIVE_ZERO);
        assert_eq!(roundtrip(NEGATIVE_ZERO), NEGATIVE_ZERO);
        assert_eq!(roundtrip(POSITIVE_INFINITY), POSITIVE_INFINITY);
        assert_eq!(roundtrip(NEGATIVE_INFINITY), NEGATIVE_INFINITY);
        assert!(roundtrip(POSITIVE_NAN).is_nan());
        assert!(POSITIVE_INFINITY.to_float().is_infinite());
        assert!(NEGATIVE_INFINITY.to_f64() == f64::NEG_INFINITY);
        assert!(POSITIVE_NAN.to_f64().is_nan());
        assert!(NEGATIVE_ZERO.to_f64().is_sign_negative());
    }

    #[test]
    fn small_integers() {
        assert_eq!(F80::from_f64(1.0), ONE);
        assert_eq!(F80::from_f64(1.0).0, [0, 0, 0, 0, 0, 0, 0, 0x80, 0xff, 0x3f]);
        assert_eq!(F80::from_f64(2.0).0, [0, 0, 0, 0, 0, 0, 0, 0x80, 0x00, 0x40]);
        assert_eq!(F80::from_f64(-1.0).0, [0, 0, 0, 0, 0, 0, 0, 0x80, 0xff, 0xbf]);
        assert_eq!(F80::from_f64(-2.0).0, [0, 0, 0, 0, 0, 0, 0, 0x80, 0x00, 0xc0]);

        for i in -1000i32..=1000 {
            let v = F80::from_f64(i as f64);
            assert_eq!(v.to_f64(), i as f64, "{}", i);
        }
    }

    #[test]
    fn one_tenth() {
        // 0.1 rounded to 64 significand bits, the classic repeating pattern.
        let v = F80::from_f64(0.1f64);
        assert_eq!(v.to_f64(), 0.1f64);
        let exact_tenth = F80::from_float(&(Float::with_val(PRECISION, 1) / 10u32));
        assert_eq!(
            exact_tenth.0,
            [0xcd, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc, 0xfb, 0x3f]
        );
    }

    #[test]
    fn doubles_roundtrip_exactly() {
        // Every f64, subnormals included, is representable in the extended
        // format, so the narrowing conversion must give the bits back.
        for &v in &[
            1.5f64,
            -123.456e30,
            f64::MIN_POSITIVE,
            f64::MIN_POSITIVE / 4096.0, // double subnormal
            f64::MAX,
            5e-324,
            std::f64::consts::PI,
        ] {
            let enc = F80::from_f64(v);
            assert_eq!(enc.to_f64().to_bits(), v.to_bits(), "{:e}", v);
        }
    }

    #[test]
    fn extended_subnormals() {
        // Smallest positive extended subnormal: significand 1, exp field 0.
        let tiny = F80([1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(tiny.is_denormal());
        let f = tiny.to_float();
        assert!(!f.is_zero());
        assert_eq!(F80::from_float(&f), tiny);

        // Largest subnormal.
        let big_sub = F80([0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f, 0, 0]);
        assert_eq!(roundtrip(big_sub), big_sub);
    }

    #[test]
    fn overflow_saturates() {
        let huge = Float::with_val(PRECISION, 2) << 17000i32;
        assert_eq!(F80::from_float(&huge), POSITIVE_INFINITY);
        let tiny = Float::with_val(PRECISION, 2) >> 17000i32;
        assert_eq!(F80::from_float(&tiny), POSITIVE_ZERO);
    }

    #[test]
    fn float_narrowing_rounds() {
        // A value with more than 53 significant bits loses the tail going to
        // f64, rounding to nearest.
        let v = F80::from_float(&Float::with_val(PRECISION, (1u64 << 60) + 1));
        assert_eq!(v.to_f64(), (1u64 << 60) as f64);
    }
}
