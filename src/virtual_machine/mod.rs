//! Register-stack bytecode virtual machine with a frame-scoped tracing collector.
//!
//! # Architecture
//!
//! - **Registers**: one contiguous stack of tagged [`vm::Register`]s. Globals sit at
//!   the bottom and are addressed absolutely; locals are addressed relative to a
//!   movable base adjusted by `STACK_OFFSET` / `STACK_DEOFFSET`.
//! - **Heap**: an arena of fixed-size register arrays addressed by generation
//!   checked [`vm::HeapHandle`]s.
//! - **Collector**: [`vm::Tracer`] keeps one frame of allocations and roots per
//!   `GC_NEW_FRAME`. `GC_CLEAN` promotes what is reachable to the parent frame and
//!   releases the rest.
//! - **Foreign calls**: [`foreign::ForeignTable`] maps ids to host functions.
//! - **Errors**: execution halts with a [`errors::MachineError`] carrying the
//!   [`errors::ErrorKind`] and the faulting instruction index.
//!
//! # Modules
//!
//! - [`assembler`]: Text assembly and diagnostics
//! - [`errors`]: Halting kinds, runtime faults and load-time errors
//! - [`foreign`]: Host function table and library imports
//! - [`isa`]: Instruction set definition and opcode masks
//! - [`operand`]: Operand slot kinds and addressing modes
//! - [`program`]: Program container, validation and disassembly
//! - [`vm`]: The machine, its heap and its collector

pub mod assembler;
pub mod errors;
pub mod foreign;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod operand;
pub mod program;
pub mod vm;
