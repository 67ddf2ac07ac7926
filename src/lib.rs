//! Register-stack bytecode virtual machine.
//!
//! Provides the machine, its assembler and the binary program format.

pub mod types;
pub mod utils;
pub mod virtual_machine;
