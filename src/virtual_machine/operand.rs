//! Operand classes and addressing modes.

use crate::virtual_machine::errors::ErrorKind;

/// How an instruction slot (`a`, `b` or `c`) is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// Register operand whose addressing mode comes from the opcode mask.
    Reg,
    /// Register operand that is always frame-relative.
    Loc,
    /// Raw 16-bit immediate.
    Imm,
}

impl OperandKind {
    /// True for operands that name a register and therefore contribute a
    /// mnemonic suffix letter.
    pub const fn is_register(self) -> bool {
        matches!(self, OperandKind::Reg | OperandKind::Loc)
    }
}

/// Register addressing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    /// Offset from the current frame base.
    Local,
    /// Absolute index into the register stack.
    Global,
}

impl AddrMode {
    pub const fn letter(self) -> char {
        match self {
            AddrMode::Local => 'L',
            AddrMode::Global => 'G',
        }
    }

    pub const fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'L' => Some(AddrMode::Local),
            'G' => Some(AddrMode::Global),
            _ => None,
        }
    }
}

/// Type selector of the `SET` immediate.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImmKind {
    /// Immediate reinterpreted as `i16` and widened.
    Long = 0,
    /// Immediate reinterpreted as `i16` and converted.
    Float = 1,
    /// Immediate is a Unicode scalar value.
    Char = 2,
    /// Non-zero is true.
    Bool = 3,
}

impl TryFrom<u16> for ImmKind {
    type Error = ErrorKind;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ImmKind::Long),
            1 => Ok(ImmKind::Float),
            2 => Ok(ImmKind::Char),
            3 => Ok(ImmKind::Bool),
            _ => Err(ErrorKind::Internal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_round_trip() {
        for mode in [AddrMode::Local, AddrMode::Global] {
            assert_eq!(AddrMode::from_letter(mode.letter()), Some(mode));
        }
        assert_eq!(AddrMode::from_letter('X'), None);
    }

    #[test]
    fn imm_kind_rejects_unknown_selector() {
        assert_eq!(ImmKind::try_from(2), Ok(ImmKind::Char));
        assert_eq!(ImmKind::try_from(4), Err(ErrorKind::Internal));
    }

    #[test]
    fn register_operands() {
        assert!(OperandKind::Reg.is_register());
        assert!(OperandKind::Loc.is_register());
        assert!(!OperandKind::Imm.is_register());
    }
}
