//! Instruction Set Architecture (ISA) definitions.
//!
//! [`for_each_instruction!`](crate::for_each_instruction) holds the canonical
//! list of base operations and feeds it to a callback macro, so the opcode
//! enum, the assembler and the static ISA checks are generated from one table.
//!
//! # Instruction Format
//!
//! Every instruction is fixed width: a `u16` [`Opcode`] followed by three
//! `u16` operands `a`, `b`, `c` (8 bytes little-endian on the wire).
//!
//! The opcode packs a base operation and an addressing mask:
//!
//! ```text
//! opcode = (base << 3) | mask      mask bit 0/1/2 = operand a/b/c is global
//! ```
//!
//! Only `Reg` operands may carry a mask bit. `Loc` operands are always
//! frame-relative and `Imm` operands are raw immediates. Each (base, mask)
//! pair corresponds to one specialized opcode such as `LONG_ADD_LGL`; the
//! dispatcher decodes the pair once per instruction.

use crate::virtual_machine::errors::ErrorKind;
use crate::virtual_machine::operand::{AddrMode, OperandKind};
use scopevm_derive::BinaryCodec;
use std::fmt;

/// Invokes a callback macro with the complete instruction definition list.
///
/// Operand fields are always named `a`, `b`, `c` in slot order.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Control
            // =========================
            /// ABORT code ; halt, code 0 ends the program normally
            Abort = 0x00, "ABORT" => [a: Imm],
            /// FOREIGN id, input, output ; output = foreign[id](input)
            Foreign = 0x01, "FOREIGN" => [a: Reg, b: Reg, c: Reg],
            /// MOVE dst, src ; dst = src
            Move = 0x02, "MOVE" => [a: Reg, b: Reg],
            /// SET dst, imm, kind ; dst = imm typed by kind (0 long, 1 float, 2 char, 3 bool)
            Set = 0x03, "SET" => [a: Loc, b: Imm, c: Imm],
            /// JUMP target ; ip = target
            Jump = 0x04, "JUMP" => [a: Imm],
            /// JUMP_CHECK cond, target ; if !cond { ip = target }
            JumpCheck = 0x05, "JUMP_CHECK" => [a: Reg, b: Imm],
            /// CALL callee ; push return ip, ip = callee
            Call = 0x06, "CALL" => [a: Reg],
            /// RETURN ; ip = popped return ip
            Return = 0x07, "RETURN" => [],
            /// LABEL dst, target ; dst = address of target
            Label = 0x08, "LABEL" => [a: Reg, b: Imm],

            // =========================
            // Heap access
            // =========================
            /// LOAD_ALLOC array, index, dst ; dst = array[index], checked
            LoadAlloc = 0x09, "LOAD_ALLOC" => [a: Reg, b: Reg, c: Reg],
            /// LOAD_ALLOC_I array, dst, index ; dst = array[index], unchecked
            LoadAllocI = 0x0A, "LOAD_ALLOC_I" => [a: Reg, b: Reg, c: Imm],
            /// LOAD_ALLOC_I_BOUND array, dst, index ; dst = array[index], checked
            LoadAllocIBound = 0x0B, "LOAD_ALLOC_I_BOUND" => [a: Reg, b: Reg, c: Imm],
            /// STORE_ALLOC array, index, src ; array[index] = src, checked
            StoreAlloc = 0x0C, "STORE_ALLOC" => [a: Reg, b: Reg, c: Reg],
            /// STORE_ALLOC_I array, src, index ; array[index] = src, unchecked
            StoreAllocI = 0x0D, "STORE_ALLOC_I" => [a: Reg, b: Reg, c: Imm],
            /// STORE_ALLOC_I_BOUND array, src, index ; array[index] = src, checked
            StoreAllocIBound = 0x0E, "STORE_ALLOC_I_BOUND" => [a: Reg, b: Reg, c: Imm],
            /// CONF_TRACE array, index, flag ; trace_stat[index] = flag != 0
            ConfTrace = 0x0F, "CONF_TRACE" => [a: Reg, b: Imm, c: Imm],
            /// DYNAMIC_CONF array, flag, index ; trace_stat[index] = flag
            DynamicConf = 0x10, "DYNAMIC_CONF" => [a: Loc, b: Loc, c: Imm],
            /// DYNAMIC_CONF_ALL array, flag ; trace_mode = flag ? ALL : NONE
            DynamicConfAll = 0x11, "DYNAMIC_CONF_ALL" => [a: Loc, b: Loc],

            // =========================
            // Frames and allocation
            // =========================
            /// STACK_OFFSET n ; frame base += n
            StackOffset = 0x12, "STACK_OFFSET" => [a: Imm],
            /// STACK_DEOFFSET n ; frame base -= n
            StackDeoffset = 0x13, "STACK_DEOFFSET" => [a: Imm],
            /// ALLOC dst, size, mode ; dst = new array of size registers
            Alloc = 0x14, "ALLOC" => [a: Reg, b: Reg, c: Imm],
            /// ALLOC_I dst, size, mode ; dst = new array of an immediate size
            AllocI = 0x15, "ALLOC_I" => [a: Reg, b: Imm, c: Imm],
            /// FREE array ; release array
            Free = 0x16, "FREE" => [a: Reg],
            /// DYNAMIC_FREE array, flag ; if flag { release array }
            DynamicFree = 0x17, "DYNAMIC_FREE" => [a: Loc, b: Loc],
            /// GC_NEW_FRAME ; open a collector frame
            GcNewFrame = 0x18, "GC_NEW_FRAME" => [],
            /// GC_TRACE array ; keep array alive past the current frame
            GcTrace = 0x19, "GC_TRACE" => [a: Reg],
            /// DYNAMIC_TRACE array, flag ; if flag { trace array }
            DynamicTrace = 0x1A, "DYNAMIC_TRACE" => [a: Loc, b: Loc],
            /// GC_CLEAN ; sweep and close the current collector frame
            GcClean = 0x1B, "GC_CLEAN" => [],

            // =========================
            // Logic
            // =========================
            /// AND lhs, rhs, dst ; dst = lhs && rhs
            And = 0x1C, "AND" => [a: Reg, b: Reg, c: Reg],
            /// OR lhs, rhs, dst ; dst = lhs || rhs
            Or = 0x1D, "OR" => [a: Reg, b: Reg, c: Reg],
            /// NOT src, dst ; dst = !src
            Not = 0x1E, "NOT" => [a: Reg, b: Reg],
            /// LENGTH array, dst ; dst = limit of array
            Length = 0x1F, "LENGTH" => [a: Reg, b: Reg],

            // =========================
            // Equality
            // =========================
            /// BOOL_EQUAL lhs, rhs, dst
            BoolEqual = 0x20, "BOOL_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// CHAR_EQUAL lhs, rhs, dst
            CharEqual = 0x21, "CHAR_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// LONG_EQUAL lhs, rhs, dst
            LongEqual = 0x22, "LONG_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_EQUAL lhs, rhs, dst
            FloatEqual = 0x23, "FLOAT_EQUAL" => [a: Reg, b: Reg, c: Reg],

            // =========================
            // Long arithmetic
            // =========================
            /// LONG_MORE lhs, rhs, dst ; dst = lhs > rhs
            LongMore = 0x24, "LONG_MORE" => [a: Reg, b: Reg, c: Reg],
            /// LONG_LESS lhs, rhs, dst ; dst = lhs < rhs
            LongLess = 0x25, "LONG_LESS" => [a: Reg, b: Reg, c: Reg],
            /// LONG_MORE_EQUAL lhs, rhs, dst ; dst = lhs >= rhs
            LongMoreEqual = 0x26, "LONG_MORE_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// LONG_LESS_EQUAL lhs, rhs, dst ; dst = lhs <= rhs
            LongLessEqual = 0x27, "LONG_LESS_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// LONG_ADD lhs, rhs, dst ; wrapping
            LongAdd = 0x28, "LONG_ADD" => [a: Reg, b: Reg, c: Reg],
            /// LONG_SUBTRACT lhs, rhs, dst ; wrapping
            LongSubtract = 0x29, "LONG_SUBTRACT" => [a: Reg, b: Reg, c: Reg],
            /// LONG_MULTIPLY lhs, rhs, dst ; wrapping
            LongMultiply = 0x2A, "LONG_MULTIPLY" => [a: Reg, b: Reg, c: Reg],
            /// LONG_DIVIDE lhs, rhs, dst ; rhs == 0 is DIVIDE_BY_ZERO
            LongDivide = 0x2B, "LONG_DIVIDE" => [a: Reg, b: Reg, c: Reg],
            /// LONG_MODULO lhs, rhs, dst ; rhs == 0 is DIVIDE_BY_ZERO
            LongModulo = 0x2C, "LONG_MODULO" => [a: Reg, b: Reg, c: Reg],
            /// LONG_EXPONENTIATE base, exp, dst ; wrapping
            LongExponentiate = 0x2D, "LONG_EXPONENTIATE" => [a: Reg, b: Reg, c: Reg],

            // =========================
            // Float arithmetic
            // =========================
            /// FLOAT_MORE lhs, rhs, dst ; dst = lhs > rhs
            FloatMore = 0x2E, "FLOAT_MORE" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_LESS lhs, rhs, dst ; dst = lhs < rhs
            FloatLess = 0x2F, "FLOAT_LESS" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_MORE_EQUAL lhs, rhs, dst ; dst = lhs >= rhs
            FloatMoreEqual = 0x30, "FLOAT_MORE_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_LESS_EQUAL lhs, rhs, dst ; dst = lhs <= rhs
            FloatLessEqual = 0x31, "FLOAT_LESS_EQUAL" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_ADD lhs, rhs, dst
            FloatAdd = 0x32, "FLOAT_ADD" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_SUBTRACT lhs, rhs, dst
            FloatSubtract = 0x33, "FLOAT_SUBTRACT" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_MULTIPLY lhs, rhs, dst
            FloatMultiply = 0x34, "FLOAT_MULTIPLY" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_DIVIDE lhs, rhs, dst ; rhs == 0.0 is DIVIDE_BY_ZERO
            FloatDivide = 0x35, "FLOAT_DIVIDE" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_MODULO lhs, rhs, dst ; rhs == 0.0 is DIVIDE_BY_ZERO
            FloatModulo = 0x36, "FLOAT_MODULO" => [a: Reg, b: Reg, c: Reg],
            /// FLOAT_EXPONENTIATE base, exp, dst
            FloatExponentiate = 0x37, "FLOAT_EXPONENTIATE" => [a: Reg, b: Reg, c: Reg],

            // =========================
            // Negation
            // =========================
            /// LONG_NEGATE src, dst ; wrapping
            LongNegate = 0x38, "LONG_NEGATE" => [a: Reg, b: Reg],
            /// FLOAT_NEGATE src, dst
            FloatNegate = 0x39, "FLOAT_NEGATE" => [a: Reg, b: Reg],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $code:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        /// Base operation, without addressing specialization.
        #[repr(u16)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum Op {
            $(
                $(#[$doc])*
                $name = $code,
            )*
        }

        impl TryFrom<u16> for Op {
            type Error = ErrorKind;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $( $code => Ok(Op::$name), )*
                    _ => Err(ErrorKind::Internal),
                }
            }
        }

        impl Op {
            /// Every base operation in table order.
            pub const ALL: &'static [Op] = &[ $( Op::$name ),* ];

            /// Returns the base mnemonic (without the addressing suffix).
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Op::$name => $mnemonic, )*
                }
            }

            /// Returns the operand classes of slots `a`, `b`, `c` in order.
            pub const fn operands(self) -> &'static [OperandKind] {
                match self {
                    $( Op::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

/// Bits of an opcode reserved for the addressing mask.
pub const MODE_BITS: u16 = 3;
const MODE_MASK: u16 = (1 << MODE_BITS) - 1;

impl Op {
    /// Mask of the slots that may be specialized to global addressing.
    pub const fn specializable_mask(self) -> u8 {
        let operands = self.operands();
        let mut mask = 0;
        let mut slot = 0;
        while slot < operands.len() {
            if matches!(operands[slot], OperandKind::Reg) {
                mask |= 1 << slot;
            }
            slot += 1;
        }
        mask
    }
}

/// Specialized opcode: base operation plus addressing mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub struct Opcode(u16);

impl Opcode {
    /// Builds the opcode for `op` with global addressing on the slots set in `mask`.
    pub const fn new(op: Op, mask: u8) -> Self {
        Self(((op as u16) << MODE_BITS) | (mask as u16 & MODE_MASK))
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn mask(self) -> u8 {
        (self.0 & MODE_MASK) as u8
    }

    /// Addressing mode of `slot` (0 = a, 1 = b, 2 = c).
    pub const fn mode(self, slot: usize) -> AddrMode {
        if self.0 & (1 << slot) != 0 {
            AddrMode::Global
        } else {
            AddrMode::Local
        }
    }

    /// Decodes the base operation and checks that only register slots are specialized.
    pub fn decode(self) -> Result<Op, ErrorKind> {
        let op = Op::try_from(self.0 >> MODE_BITS)?;
        if self.mask() & !op.specializable_mask() != 0 {
            return Err(ErrorKind::Internal);
        }
        Ok(op)
    }

    /// Specialized mnemonic, e.g. `LONG_ADD_LGL`.
    pub fn mnemonic(self) -> String {
        let Ok(op) = self.decode() else {
            return format!("<{:#06x}>", self.0);
        };
        let mut name = op.mnemonic().to_string();
        let mut suffix = op
            .operands()
            .iter()
            .enumerate()
            .filter(|(_, kind)| kind.is_register())
            .map(|(slot, _)| self.mode(slot).letter())
            .peekable();
        if suffix.peek().is_some() {
            name.push('_');
            name.extend(suffix);
        }
        name
    }

    /// Parses a specialized mnemonic back into an opcode.
    pub fn from_mnemonic(text: &str) -> Option<Self> {
        Op::ALL.iter().find_map(|&op| {
            let operands = op.operands();
            let registers: Vec<usize> = (0..operands.len())
                .filter(|&slot| operands[slot].is_register())
                .collect();

            if registers.is_empty() {
                return (text == op.mnemonic()).then(|| Opcode::new(op, 0));
            }

            let letters = text.strip_prefix(op.mnemonic())?.strip_prefix('_')?;
            if letters.chars().count() != registers.len() {
                return None;
            }

            let mut mask = 0u8;
            for (&slot, letter) in registers.iter().zip(letters.chars()) {
                match AddrMode::from_letter(letter)? {
                    AddrMode::Local => {}
                    AddrMode::Global if operands[slot] == OperandKind::Reg => mask |= 1 << slot,
                    AddrMode::Global => return None,
                }
            }
            Some(Opcode::new(op, mask))
        })
    }
}

/// One fixed-width instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub struct Instruction {
    pub op: Opcode,
    pub a: u16,
    pub b: u16,
    pub c: u16,
}

impl Instruction {
    /// `ABORT 0`: terminates every valid program.
    pub const SENTINEL: Instruction = Instruction::abort(ErrorKind::None);

    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    pub const fn new(op: Opcode, a: u16, b: u16, c: u16) -> Self {
        Self { op, a, b, c }
    }

    pub const fn abort(kind: ErrorKind) -> Self {
        Self::new(Opcode::new(Op::Abort, 0), kind.code(), 0, 0)
    }

    pub const fn is_sentinel(&self) -> bool {
        self.op.raw() == Self::SENTINEL.op.raw() && self.a == 0
    }

    /// Operand value of `slot` (0 = a, 1 = b, 2 = c).
    pub const fn operand(&self, slot: usize) -> u16 {
        match slot {
            0 => self.a,
            1 => self.b,
            _ => self.c,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.mnemonic())?;
        let count = self.op.decode().map_or(3, |op| op.operands().len());
        for slot in 0..count {
            let sep = if slot == 0 { " " } else { ", " };
            write!(f, "{sep}{}", self.operand(slot))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_try_from_invalid() {
        assert_eq!(Op::try_from(0x3A), Err(ErrorKind::Internal));
        assert_eq!(Op::try_from(0x28), Ok(Op::LongAdd));
    }

    #[test]
    fn opcode_packs_base_and_mask() {
        let op = Opcode::new(Op::LongAdd, 0b010);
        assert_eq!(op.raw(), (0x28 << 3) | 0b010);
        assert_eq!(op.mode(0), AddrMode::Local);
        assert_eq!(op.mode(1), AddrMode::Global);
        assert_eq!(op.decode(), Ok(Op::LongAdd));
    }

    #[test]
    fn mask_on_immediate_slot_is_rejected() {
        // slot c of LOAD_ALLOC_I is an immediate
        assert_eq!(
            Opcode::new(Op::LoadAllocI, 0b100).decode(),
            Err(ErrorKind::Internal)
        );
        // SET writes a local only
        assert_eq!(Opcode::new(Op::Set, 0b001).decode(), Err(ErrorKind::Internal));
    }

    #[test]
    fn specialized_mnemonics() {
        assert_eq!(Opcode::new(Op::LongAdd, 0b101).mnemonic(), "LONG_ADD_GLG");
        assert_eq!(Opcode::new(Op::Set, 0).mnemonic(), "SET_L");
        assert_eq!(Opcode::new(Op::DynamicConf, 0).mnemonic(), "DYNAMIC_CONF_LL");
        assert_eq!(Opcode::new(Op::GcClean, 0).mnemonic(), "GC_CLEAN");
        assert_eq!(Opcode::from_raw(0xFFFF).mnemonic(), "<0xffff>");
    }

    #[test]
    fn mnemonic_parsing_picks_the_right_base() {
        assert_eq!(
            Opcode::from_mnemonic("LOAD_ALLOC_I_BOUND_GL"),
            Some(Opcode::new(Op::LoadAllocIBound, 0b001))
        );
        assert_eq!(
            Opcode::from_mnemonic("LONG_MORE_EQUAL_LLG"),
            Some(Opcode::new(Op::LongMoreEqual, 0b100))
        );
        assert_eq!(Opcode::from_mnemonic("RETURN"), Some(Opcode::new(Op::Return, 0)));
        assert_eq!(Opcode::from_mnemonic("LONG_ADD_LL"), None);
        assert_eq!(Opcode::from_mnemonic("SET_G"), None);
        assert_eq!(Opcode::from_mnemonic("RETURN_L"), None);
    }

    #[test]
    fn every_specialization_round_trips_through_its_mnemonic() {
        for &op in Op::ALL {
            let allowed = op.specializable_mask();
            for mask in 0..8u8 {
                if mask & !allowed != 0 {
                    continue;
                }
                let opcode = Opcode::new(op, mask);
                assert_eq!(Opcode::from_mnemonic(&opcode.mnemonic()), Some(opcode));
            }
        }
    }

    #[test]
    fn sentinel_detection() {
        assert!(Instruction::SENTINEL.is_sentinel());
        assert!(!Instruction::abort(ErrorKind::Abort).is_sentinel());
        let jump = Instruction::new(Opcode::new(Op::Jump, 0), 0, 0, 0);
        assert!(!jump.is_sentinel());
    }

    #[test]
    fn display_prints_declared_operands() {
        let add = Instruction::new(Opcode::new(Op::LongAdd, 0b001), 1, 2, 3);
        assert_eq!(add.to_string(), "LONG_ADD_GLL 1, 2, 3");
        assert_eq!(Instruction::SENTINEL.to_string(), "ABORT 0");
        let ret = Instruction::new(Opcode::new(Op::Return, 0), 0, 0, 0);
        assert_eq!(ret.to_string(), "RETURN");
    }
}
