//! Instruction prefix byte decoding.

use crate::cpu::instr::{OpSize, RepKind, Segment};

bitflags! {
    /// Bitmask of raw legacy instruction prefixes.
    ///
    /// Their meaning depends on the instruction opcode: `f2`/`f3` are repeat
    /// prefixes on string instructions but select SSE variants on `0f`
    /// opcodes, and `66` switches between operand sizes and the `pd`/packed
    /// forms. The decoder collects bytes here first and interprets them once
    /// the opcode is known.
    pub struct RawPrefixes: u16 {
        /// `f0`. Accepted and ignored; the interpreter is the only agent.
        const LOCK = 0x0001;
        /// `f2`
        const REPNE = 0x0002;
        /// `f3` - `rep`/`repe`, or the scalar-single SSE selector.
        const REP_REPE = 0x0004;
        /// `64` - address through the `fs` base.
        const OVERRIDE_FS = 0x0008;
        /// `65` - address through the `gs` base.
        const OVERRIDE_GS = 0x0010;
        /// `66` - operand size override (or packed-double SSE selector).
        const OVERRIDE_OPERAND = 0x0020;
        /// `67` - address size override (32-bit effective addresses).
        const OVERRIDE_ADDRESS = 0x0040;
    }
}

/// A decoded REX prefix (`40`-`4f`).
///
/// `W` widens the operand to 64 bits; `R`, `X` and `B` extend the ModR/M
/// `reg` field, the SIB index and the `r/m`/SIB base to four bits. The mere
/// presence of any REX byte also switches the byte registers from
/// `ah`/`ch`/`dh`/`bh` to `spl`/`bpl`/`sil`/`dil`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    pub fn decode(byte: u8) -> Rex {
        debug_assert!(byte & 0xf0 == 0x40);
        Rex {
            w: byte & 0x8 != 0,
            r: byte & 0x4 != 0,
            x: byte & 0x2 != 0,
            b: byte & 0x1 != 0,
        }
    }
}

/// All prefix state collected for one instruction.
///
/// Rebuilt from scratch at every instruction boundary; nothing here survives
/// across instructions.
#[derive(Debug, Default, Clone)]
pub struct Prefixes {
    pub raw: RawPrefixes,
    pub rex: Option<Rex>,
}

impl Default for RawPrefixes {
    fn default() -> RawPrefixes {
        RawPrefixes::empty()
    }
}

impl Prefixes {
    pub fn empty() -> Prefixes {
        Prefixes::default()
    }

    /// Merges a prefix byte. Returns `Err` when the byte is not a prefix
    /// (i.e. it is the opcode).
    ///
    /// A REX byte is only a prefix when it *immediately* precedes the
    /// opcode, which the decoder guarantees by clearing any previously
    /// collected REX when a legacy prefix follows it.
    pub fn decode(&mut self, byte: u8) -> Result<(), u8> {
        let legacy = match byte {
            // cs/ds/es/ss overrides are null prefixes in long mode (they
            // survive as branch hints); accept and ignore them.
            0x26 | 0x2e | 0x36 | 0x3e => RawPrefixes::empty(),
            0xf0 => RawPrefixes::LOCK,
            0xf2 => RawPrefixes::REPNE,
            0xf3 => RawPrefixes::REP_REPE,
            0x64 => RawPrefixes::OVERRIDE_FS,
            0x65 => RawPrefixes::OVERRIDE_GS,
            0x66 => RawPrefixes::OVERRIDE_OPERAND,
            0x67 => RawPrefixes::OVERRIDE_ADDRESS,
            0x40..=0x4f => {
                self.rex = Some(Rex::decode(byte));
                return Ok(());
            }
            _ => return Err(byte),
        };
        self.rex = None;
        self.raw |= legacy;
        Ok(())
    }

    pub fn rex_w(&self) -> bool {
        self.rex.map_or(false, |r| r.w)
    }

    pub fn has_rex(&self) -> bool {
        self.rex.is_some()
    }

    /// Effective operand size for the common integer encodings: 32-bit
    /// default, 16 under `66`, 64 under REX.W (which beats `66`).
    pub fn op_size(&self) -> OpSize {
        if self.rex_w() {
            OpSize::Bits64
        } else if self.raw.contains(RawPrefixes::OVERRIDE_OPERAND) {
            OpSize::Bits16
        } else {
            OpSize::Bits32
        }
    }

    /// Operand size for the `D` (size) bit found in many one-byte opcodes.
    pub fn sized(&self, size_bit: bool) -> OpSize {
        if size_bit {
            self.op_size()
        } else {
            OpSize::Bits8
        }
    }

    /// Stack operation size: pushes and pops move 8 bytes unless `66`
    /// shrinks them to 2.
    pub fn stack_size(&self) -> OpSize {
        if self.raw.contains(RawPrefixes::OVERRIDE_OPERAND) {
            OpSize::Bits16
        } else {
            OpSize::Bits64
        }
    }

    pub fn addr32(&self) -> bool {
        self.raw.contains(RawPrefixes::OVERRIDE_ADDRESS)
    }

    pub fn segment(&self) -> Option<Segment> {
        if self.raw.contains(RawPrefixes::OVERRIDE_FS) {
            Some(Segment::Fs)
        } else if self.raw.contains(RawPrefixes::OVERRIDE_GS) {
            Some(Segment::Gs)
        } else {
            None
        }
    }

    pub fn rep(&self) -> RepKind {
        if self.raw.contains(RawPrefixes::REP_REPE) {
            RepKind::Rep
        } else if self.raw.contains(RawPrefixes::REPNE) {
            RepKind::Repne
        } else {
            RepKind::None
        }
    }

    /// The SSE selector nibble: the last of `f3`/`f2`/`66` wins in real
    /// hardware, but well-formed code never combines them.
    pub fn sse_selector(&self) -> SseSelector {
        if self.raw.contains(RawPrefixes::REP_REPE) {
            SseSelector::F3
        } else if self.raw.contains(RawPrefixes::REPNE) {
            SseSelector::F2
        } else if self.raw.contains(RawPrefixes::OVERRIDE_OPERAND) {
            SseSelector::Op66
        } else {
            SseSelector::None
        }
    }
}

/// Which of the SSE-variant-selecting prefixes is present.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SseSelector {
    None,
    Op66,
    F3,
    F2,
}
