//! Register values and the register stack.

use crate::virtual_machine::errors::{ErrorKind, VMError};
use crate::virtual_machine::operand::AddrMode;
use crate::virtual_machine::vm::heap::HeapHandle;

/// Runtime value held by a register or a heap slot.
///
/// Reading a register as a different kind than it holds is an
/// [`ErrorKind::Internal`] fault; the VM never coerces between kinds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Register {
    /// 64-bit signed integer with wrapping arithmetic.
    Long(i64),
    Float(f64),
    Char(char),
    Bool(bool),
    /// Instruction index, produced by `LABEL` and consumed by `CALL`.
    Address(usize),
    Handle(HeapHandle),
}

impl Default for Register {
    fn default() -> Self {
        Register::Long(0)
    }
}

macro_rules! register_accessors {
    ($( $name:ident => $variant:ident : $ty:ty ),* $(,)?) => {
        impl Register {
            $(
                #[doc = concat!("Returns the `", stringify!($variant), "` payload, or `Internal` for any other kind.")]
                pub fn $name(self) -> Result<$ty, ErrorKind> {
                    match self {
                        Register::$variant(v) => Ok(v),
                        _ => Err(ErrorKind::Internal),
                    }
                }
            )*
        }
    };
}

register_accessors! {
    as_long => Long: i64,
    as_float => Float: f64,
    as_char => Char: char,
    as_bool => Bool: bool,
    as_address => Address: usize,
    as_handle => Handle: HeapHandle,
}

impl Register {
    /// Kind name used in diagnostics.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Register::Long(_) => "long",
            Register::Float(_) => "float",
            Register::Char(_) => "char",
            Register::Bool(_) => "bool",
            Register::Address(_) => "address",
            Register::Handle(_) => "handle",
        }
    }
}

/// Fixed-capacity register stack.
///
/// The first `globals` registers form the global region. Local operands are
/// offsets from the current frame base, which never drops below the global
/// region and is moved by `STACK_OFFSET`/`STACK_DEOFFSET`.
pub struct RegisterStack {
    regs: Vec<Register>,
    globals: usize,
    base: usize,
}

impl RegisterStack {
    /// Reserves `size` registers, all initialized to `Long(0)`.
    pub fn new(size: usize, globals: usize) -> Result<Self, VMError> {
        if globals > size {
            return Err(VMError::InvalidConfig {
                reason: "global region larger than the register stack",
            });
        }
        let mut regs = Vec::new();
        regs.try_reserve_exact(size)
            .map_err(|_| VMError::OutOfMemory { registers: size })?;
        regs.resize(size, Register::default());
        Ok(Self {
            regs,
            globals,
            base: globals,
        })
    }

    /// Total number of registers, globals included.
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Absolute address of local register 0.
    pub fn frame_base(&self) -> usize {
        self.base
    }

    /// Resolves an operand to an absolute register address.
    pub fn locate(&self, mode: AddrMode, index: u16) -> Result<usize, ErrorKind> {
        let addr = match mode {
            AddrMode::Global => index as usize,
            AddrMode::Local => self.base + index as usize,
        };
        if addr >= self.regs.len() {
            return Err(ErrorKind::StackOverflow);
        }
        Ok(addr)
    }

    /// Reads the register at absolute address `addr`.
    pub fn get(&self, addr: usize) -> Result<Register, ErrorKind> {
        self.regs.get(addr).copied().ok_or(ErrorKind::StackOverflow)
    }

    /// Writes the register at absolute address `addr`.
    pub fn set(&mut self, addr: usize, value: Register) -> Result<(), ErrorKind> {
        let slot = self.regs.get_mut(addr).ok_or(ErrorKind::StackOverflow)?;
        *slot = value;
        Ok(())
    }

    /// Reads `addr` as a long. The other typed reads follow the same rule:
    /// a register of another kind is an `Internal` fault.
    pub fn long(&self, addr: usize) -> Result<i64, ErrorKind> {
        self.get(addr)?.as_long()
    }

    pub fn float(&self, addr: usize) -> Result<f64, ErrorKind> {
        self.get(addr)?.as_float()
    }

    pub fn char(&self, addr: usize) -> Result<char, ErrorKind> {
        self.get(addr)?.as_char()
    }

    pub fn bool(&self, addr: usize) -> Result<bool, ErrorKind> {
        self.get(addr)?.as_bool()
    }

    pub fn handle(&self, addr: usize) -> Result<HeapHandle, ErrorKind> {
        self.get(addr)?.as_handle()
    }

    /// Moves the frame base up by `amount` registers.
    pub fn offset(&mut self, amount: u16) -> Result<(), ErrorKind> {
        let base = self.base + amount as usize;
        if base >= self.regs.len() {
            return Err(ErrorKind::StackOverflow);
        }
        self.base = base;
        Ok(())
    }

    /// Moves the frame base down by `amount` registers.
    pub fn deoffset(&mut self, amount: u16) -> Result<(), ErrorKind> {
        self.base = self
            .base
            .checked_sub(amount as usize)
            .filter(|&base| base >= self.globals)
            .ok_or(ErrorKind::Internal)?;
        Ok(())
    }

    /// Returns the frame base to the global region, keeping register contents.
    pub fn reset_base(&mut self) {
        self.base = self.globals;
    }

    /// Clears every register and returns the frame base to the global region.
    pub fn reset(&mut self) {
        self.regs.fill(Register::default());
        self.base = self.globals;
    }
}
