//! Core virtual machine implementation.
//!
//! A [`Machine`] owns a register stack, a heap arena, the collector frames,
//! the call stack and a foreign function table. [`Machine::execute`] runs an
//! instruction stream from index 0 until `ABORT 0` or the first fault, and
//! reports faults with the index of the instruction that raised them.
//!
//! Long arithmetic wraps. Division and modulo by zero, long or float, raise
//! `DIVIDE_BY_ZERO` and leave the destination untouched.

mod context;
pub mod gc;
pub mod heap;
pub mod registers;

pub use context::{HaltHandle, MachineConfig};
pub use gc::{SweepReport, Tracer};
pub use heap::{HeapAlloc, HeapArena, HeapHandle, TraceMode};
pub use registers::{Register, RegisterStack};

use crate::virtual_machine::errors::{ErrorKind, MachineError, VMError};
use crate::virtual_machine::foreign::{ForeignContext, ForeignTable};
use crate::virtual_machine::isa::{Instruction, Op};
use crate::virtual_machine::operand::{AddrMode, ImmKind};
use crate::virtual_machine::program::Program;
use crate::{info, warn};
use context::CallFrame;

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        ins = $ins:ident,
        op = $op:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $op {
            $(
                Op::$variant => {
                    $( let $field = exec_vm!(@read $vm, $ins, $field, $kind)?; )*
                    $vm.$handler($( $field ),*)
                }
            )*
        }
    }};

    // Register operand, local or global per the opcode mask
    (@read $vm:ident, $ins:ident, $field:ident, Reg) => {
        $vm.registers.locate($ins.op.mode(exec_vm!(@slot $field)), $ins.$field)
    };

    // Register operand, always frame-relative
    (@read $vm:ident, $ins:ident, $field:ident, Loc) => {
        $vm.registers.locate(AddrMode::Local, $ins.$field)
    };

    // Raw immediate
    (@read $vm:ident, $ins:ident, $field:ident, Imm) => {
        Ok::<u16, ErrorKind>($ins.$field)
    };

    (@slot a) => { 0 };
    (@slot b) => { 1 };
    (@slot c) => { 2 };
}

/// Bytecode virtual machine.
///
/// All state survives between calls to [`execute`](Machine::execute): globals,
/// heap contents and registered foreign functions stay in place until
/// [`reset`](Machine::reset) or [`release`](Machine::release).
pub struct Machine {
    /// Index of the next instruction.
    ip: usize,
    halted: bool,
    registers: RegisterStack,
    /// Return addresses pushed by `CALL`.
    positions: Vec<CallFrame>,
    heap: HeapArena,
    tracer: Tracer,
    foreign: ForeignTable,
    halt: HaltHandle,
    last_error: Option<MachineError>,
    config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, VMError> {
        config.validate()?;
        Ok(Self {
            ip: 0,
            halted: false,
            registers: RegisterStack::new(config.stack_size, config.global_count)?,
            positions: Vec::new(),
            heap: HeapArena::new(config.heap_limit, config.free_pool_limit),
            tracer: Tracer::new(config.frame_limit),
            foreign: ForeignTable::new(),
            halt: HaltHandle::default(),
            last_error: None,
            config,
        })
    }

    /// Creates a machine sized by the program header and loads its constants.
    pub fn from_program(program: &Program) -> Result<Self, VMError> {
        let mut machine = Self::new(program.header().config())?;
        machine.load(program)?;
        Ok(machine)
    }

    /// Copies the program constants into the first global registers.
    pub fn load(&mut self, program: &Program) -> Result<(), VMError> {
        let constants = program.constants();
        if constants.len() > self.config.global_count {
            return Err(VMError::InvalidConfig {
                reason: "constant pool exceeds the global region",
            });
        }
        for (addr, constant) in constants.iter().enumerate() {
            self.registers
                .set(addr, Register::from(*constant))
                .map_err(|_| VMError::InvalidConfig {
                    reason: "constant pool exceeds the global region",
                })?;
        }
        info!(
            "loaded program: instructions={} constants={}",
            program.instructions().len(),
            constants.len()
        );
        Ok(())
    }

    /// Runs the program's instruction stream.
    pub fn run(&mut self, program: &Program) -> Result<(), MachineError> {
        self.execute(program.instructions())
    }

    /// Executes `instructions` from index 0 until `ABORT 0` or a fault.
    ///
    /// The fault is also kept for [`last_error`](Machine::last_error). A
    /// faulted run leaves no open frames behind: collector frames are cleaned
    /// down to the root and the register frame base returns to the globals.
    pub fn execute(&mut self, instructions: &[Instruction]) -> Result<(), MachineError> {
        self.ip = 0;
        self.halted = false;
        self.positions.clear();

        let result = self.dispatch(instructions);
        match result {
            Ok(()) => self.last_error = None,
            Err(err) => {
                warn!("machine halted: {err}");
                self.last_error = Some(err);
                self.unwind();
            }
        }
        result
    }

    fn unwind(&mut self) {
        self.positions.clear();
        self.registers.reset_base();
        match self.tracer.unwind(&mut self.heap) {
            Ok(report) if report.promoted + report.released > 0 => info!(
                "unwound collector frames: promoted={} released={}",
                report.promoted, report.released
            ),
            Ok(_) => {}
            Err(kind) => warn!("collector unwind failed: {kind}"),
        }
    }

    fn dispatch(&mut self, instructions: &[Instruction]) -> Result<(), MachineError> {
        while !self.halted {
            let ip = self.ip;
            let fault = |kind| MachineError { kind, ip };

            if self.halt.is_requested() {
                return Err(fault(ErrorKind::Cancelled));
            }
            let ins = instructions
                .get(ip)
                .copied()
                .ok_or(fault(ErrorKind::Internal))?;
            self.ip = ip + 1;
            if let Err(kind) = self.exec(ins) {
                self.ip = ip;
                return Err(fault(kind));
            }
        }
        Ok(())
    }

    /// Executes a single instruction.
    fn exec(&mut self, ins: Instruction) -> Result<(), ErrorKind> {
        let op = ins.op.decode()?;
        exec_vm! {
            vm = self,
            ins = ins,
            op = op,
            {
                // Control
                Abort => op_abort(a: Imm),
                Foreign => op_foreign(a: Reg, b: Reg, c: Reg),
                Move => op_move(a: Reg, b: Reg),
                Set => op_set(a: Loc, b: Imm, c: Imm),
                Jump => op_jump(a: Imm),
                JumpCheck => op_jump_check(a: Reg, b: Imm),
                Call => op_call(a: Reg),
                Return => op_return(),
                Label => op_label(a: Reg, b: Imm),
                // Heap access
                LoadAlloc => op_load_alloc(a: Reg, b: Reg, c: Reg),
                LoadAllocI => op_load_alloc_i(a: Reg, b: Reg, c: Imm),
                LoadAllocIBound => op_load_alloc_i_bound(a: Reg, b: Reg, c: Imm),
                StoreAlloc => op_store_alloc(a: Reg, b: Reg, c: Reg),
                StoreAllocI => op_store_alloc_i(a: Reg, b: Reg, c: Imm),
                StoreAllocIBound => op_store_alloc_i_bound(a: Reg, b: Reg, c: Imm),
                ConfTrace => op_conf_trace(a: Reg, b: Imm, c: Imm),
                DynamicConf => op_dynamic_conf(a: Loc, b: Loc, c: Imm),
                DynamicConfAll => op_dynamic_conf_all(a: Loc, b: Loc),
                // Frames and allocation
                StackOffset => op_stack_offset(a: Imm),
                StackDeoffset => op_stack_deoffset(a: Imm),
                Alloc => op_alloc(a: Reg, b: Reg, c: Imm),
                AllocI => op_alloc_i(a: Reg, b: Imm, c: Imm),
                Free => op_free(a: Reg),
                DynamicFree => op_dynamic_free(a: Loc, b: Loc),
                GcNewFrame => op_gc_new_frame(),
                GcTrace => op_gc_trace(a: Reg),
                DynamicTrace => op_dynamic_trace(a: Loc, b: Loc),
                GcClean => op_gc_clean(),
                // Logic
                And => op_and(a: Reg, b: Reg, c: Reg),
                Or => op_or(a: Reg, b: Reg, c: Reg),
                Not => op_not(a: Reg, b: Reg),
                Length => op_length(a: Reg, b: Reg),
                // Equality
                BoolEqual => op_bool_equal(a: Reg, b: Reg, c: Reg),
                CharEqual => op_char_equal(a: Reg, b: Reg, c: Reg),
                LongEqual => op_long_equal(a: Reg, b: Reg, c: Reg),
                FloatEqual => op_float_equal(a: Reg, b: Reg, c: Reg),
                // Long arithmetic
                LongMore => op_long_more(a: Reg, b: Reg, c: Reg),
                LongLess => op_long_less(a: Reg, b: Reg, c: Reg),
                LongMoreEqual => op_long_more_equal(a: Reg, b: Reg, c: Reg),
                LongLessEqual => op_long_less_equal(a: Reg, b: Reg, c: Reg),
                LongAdd => op_long_add(a: Reg, b: Reg, c: Reg),
                LongSubtract => op_long_subtract(a: Reg, b: Reg, c: Reg),
                LongMultiply => op_long_multiply(a: Reg, b: Reg, c: Reg),
                LongDivide => op_long_divide(a: Reg, b: Reg, c: Reg),
                LongModulo => op_long_modulo(a: Reg, b: Reg, c: Reg),
                LongExponentiate => op_long_exponentiate(a: Reg, b: Reg, c: Reg),
                // Float arithmetic
                FloatMore => op_float_more(a: Reg, b: Reg, c: Reg),
                FloatLess => op_float_less(a: Reg, b: Reg, c: Reg),
                FloatMoreEqual => op_float_more_equal(a: Reg, b: Reg, c: Reg),
                FloatLessEqual => op_float_less_equal(a: Reg, b: Reg, c: Reg),
                FloatAdd => op_float_add(a: Reg, b: Reg, c: Reg),
                FloatSubtract => op_float_subtract(a: Reg, b: Reg, c: Reg),
                FloatMultiply => op_float_multiply(a: Reg, b: Reg, c: Reg),
                FloatDivide => op_float_divide(a: Reg, b: Reg, c: Reg),
                FloatModulo => op_float_modulo(a: Reg, b: Reg, c: Reg),
                FloatExponentiate => op_float_exponentiate(a: Reg, b: Reg, c: Reg),
                // Negation
                LongNegate => op_long_negate(a: Reg, b: Reg),
                FloatNegate => op_float_negate(a: Reg, b: Reg),
            }
        }
    }

    // ==================== Host interface ====================

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Index of the next instruction, or of the faulting one after an error.
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn last_error(&self) -> Option<MachineError> {
        self.last_error
    }

    /// Returns a handle that cancels execution from any thread.
    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    pub fn registers(&self) -> &RegisterStack {
        &self.registers
    }

    pub fn heap(&self) -> &HeapArena {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut HeapArena {
        &mut self.heap
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn foreign_mut(&mut self) -> &mut ForeignTable {
        &mut self.foreign
    }

    /// Reads a register by addressing mode and operand index.
    pub fn register(&self, mode: AddrMode, index: u16) -> Result<Register, ErrorKind> {
        self.registers.get(self.registers.locate(mode, index)?)
    }

    pub fn set_register(&mut self, mode: AddrMode, index: u16, value: Register) -> Result<(), ErrorKind> {
        let addr = self.registers.locate(mode, index)?;
        self.registers.set(addr, value)
    }

    /// Allocates an array owned by the current collector frame.
    pub fn allocate(&mut self, size: u16, trace_mode: TraceMode) -> Result<HeapHandle, ErrorKind> {
        let handle = self.heap.allocate(size, trace_mode)?;
        self.tracer.register(&self.heap, handle);
        Ok(handle)
    }

    /// Traces `handle` and everything reachable from it in the current frame.
    pub fn supertrace(&mut self, handle: HeapHandle) -> Result<usize, ErrorKind> {
        self.tracer.supertrace(&mut self.heap, handle)
    }

    /// Drops the traces of `handle` and everything reachable from it.
    pub fn detrace(&mut self, handle: HeapHandle) -> Result<usize, ErrorKind> {
        self.tracer.detrace(&mut self.heap, handle)
    }

    /// Returns the machine to its freshly created state, keeping the
    /// foreign table and configuration.
    pub fn reset(&mut self) {
        self.ip = 0;
        self.halted = false;
        self.registers.reset();
        self.positions.clear();
        self.heap.clear();
        self.tracer.reset();
        self.last_error = None;
    }

    /// Tears the machine down, releasing every heap allocation. Returns the
    /// number of allocations that were still live.
    pub fn release(mut self) -> usize {
        let released = self.heap.clear();
        info!("machine released: allocations={released}");
        released
    }

    // ==================== Control ====================

    fn op_abort(&mut self, code: u16) -> Result<(), ErrorKind> {
        match ErrorKind::from_code(code) {
            Some(ErrorKind::None) => {
                self.halted = true;
                Ok(())
            }
            Some(kind) => Err(kind),
            None => Err(ErrorKind::Internal),
        }
    }

    fn op_foreign(&mut self, id: usize, input: usize, output: usize) -> Result<(), ErrorKind> {
        let id = self.registers.long(id)?;
        let input = self.registers.get(input)?;
        let mut ctx = ForeignContext::new(&mut self.heap, &mut self.tracer);
        let result = self.foreign.invoke(id, &mut ctx, input)?;
        self.registers.set(output, result)
    }

    fn op_move(&mut self, dst: usize, src: usize) -> Result<(), ErrorKind> {
        let value = self.registers.get(src)?;
        self.registers.set(dst, value)
    }

    fn op_set(&mut self, dst: usize, imm: u16, kind: u16) -> Result<(), ErrorKind> {
        let value = match ImmKind::try_from(kind)? {
            ImmKind::Long => Register::Long(imm as i16 as i64),
            ImmKind::Float => Register::Float(imm as i16 as f64),
            ImmKind::Char => Register::Char(char::from_u32(imm as u32).ok_or(ErrorKind::Internal)?),
            ImmKind::Bool => Register::Bool(imm != 0),
        };
        self.registers.set(dst, value)
    }

    fn op_jump(&mut self, target: u16) -> Result<(), ErrorKind> {
        self.ip = target as usize;
        Ok(())
    }

    fn op_jump_check(&mut self, cond: usize, target: u16) -> Result<(), ErrorKind> {
        if !self.registers.bool(cond)? {
            self.ip = target as usize;
        }
        Ok(())
    }

    fn op_call(&mut self, callee: usize) -> Result<(), ErrorKind> {
        let target = self.registers.get(callee)?.as_address()?;
        if self.positions.len() >= self.config.frame_limit {
            return Err(ErrorKind::StackOverflow);
        }
        self.positions.push(CallFrame { return_ip: self.ip });
        self.ip = target;
        Ok(())
    }

    fn op_return(&mut self) -> Result<(), ErrorKind> {
        let frame = self.positions.pop().ok_or(ErrorKind::Internal)?;
        self.ip = frame.return_ip;
        Ok(())
    }

    fn op_label(&mut self, dst: usize, target: u16) -> Result<(), ErrorKind> {
        self.registers.set(dst, Register::Address(target as usize))
    }

    // ==================== Heap access ====================

    fn op_load_alloc(&mut self, array: usize, index: usize, dst: usize) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let index = self.registers.long(index)?;
        let value = self.heap.get(handle)?.load(index)?;
        self.registers.set(dst, value)
    }

    fn op_load_alloc_i(&mut self, array: usize, dst: usize, index: u16) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let value = self.heap.get(handle)?.load_unchecked(index as usize)?;
        self.registers.set(dst, value)
    }

    fn op_load_alloc_i_bound(&mut self, array: usize, dst: usize, index: u16) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let value = self.heap.get(handle)?.load(index as i64)?;
        self.registers.set(dst, value)
    }

    fn op_store_alloc(&mut self, array: usize, index: usize, src: usize) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let index = self.registers.long(index)?;
        let value = self.registers.get(src)?;
        self.heap.get_mut(handle)?.store(index, value)
    }

    fn op_store_alloc_i(&mut self, array: usize, src: usize, index: u16) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let value = self.registers.get(src)?;
        self.heap.get_mut(handle)?.store_unchecked(index as usize, value)
    }

    fn op_store_alloc_i_bound(&mut self, array: usize, src: usize, index: u16) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let value = self.registers.get(src)?;
        self.heap.get_mut(handle)?.store(index as i64, value)
    }

    fn op_conf_trace(&mut self, array: usize, index: u16, flag: u16) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        self.heap.get_mut(handle)?.set_traced(index as i64, flag != 0)
    }

    fn op_dynamic_conf(&mut self, array: usize, flag: usize, index: u16) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let flag = self.registers.bool(flag)?;
        self.heap.get_mut(handle)?.set_traced(index as i64, flag)
    }

    fn op_dynamic_conf_all(&mut self, array: usize, flag: usize) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let mode = if self.registers.bool(flag)? {
            TraceMode::All
        } else {
            TraceMode::None
        };
        self.heap.get_mut(handle)?.set_trace_mode(mode);
        Ok(())
    }

    // ==================== Frames and allocation ====================

    fn op_stack_offset(&mut self, amount: u16) -> Result<(), ErrorKind> {
        self.registers.offset(amount)
    }

    fn op_stack_deoffset(&mut self, amount: u16) -> Result<(), ErrorKind> {
        self.registers.deoffset(amount)
    }

    fn op_alloc(&mut self, dst: usize, size: usize, mode: u16) -> Result<(), ErrorKind> {
        let size = u16::try_from(self.registers.long(size)?).map_err(|_| ErrorKind::Memory)?;
        self.op_alloc_i(dst, size, mode)
    }

    fn op_alloc_i(&mut self, dst: usize, size: u16, mode: u16) -> Result<(), ErrorKind> {
        let mode = TraceMode::try_from(mode)?;
        let handle = self.allocate(size, mode)?;
        self.registers.set(dst, Register::Handle(handle))
    }

    fn op_free(&mut self, array: usize) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        self.heap.release(handle)?;
        self.tracer.forget(handle);
        Ok(())
    }

    fn op_dynamic_free(&mut self, array: usize, flag: usize) -> Result<(), ErrorKind> {
        if self.registers.bool(flag)? {
            self.op_free(array)?;
        }
        Ok(())
    }

    fn op_gc_new_frame(&mut self) -> Result<(), ErrorKind> {
        self.tracer.new_frame()
    }

    fn op_gc_trace(&mut self, array: usize) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        self.tracer.trace(&self.heap, handle)
    }

    fn op_dynamic_trace(&mut self, array: usize, flag: usize) -> Result<(), ErrorKind> {
        if self.registers.bool(flag)? {
            self.op_gc_trace(array)?;
        }
        Ok(())
    }

    fn op_gc_clean(&mut self) -> Result<(), ErrorKind> {
        self.tracer.clean(&mut self.heap).map(|_| ())
    }

    // ==================== Logic ====================

    fn op_and(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = self.registers.bool(lhs)? && self.registers.bool(rhs)?;
        self.registers.set(dst, Register::Bool(value))
    }

    fn op_or(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = self.registers.bool(lhs)? || self.registers.bool(rhs)?;
        self.registers.set(dst, Register::Bool(value))
    }

    fn op_not(&mut self, src: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = !self.registers.bool(src)?;
        self.registers.set(dst, Register::Bool(value))
    }

    fn op_length(&mut self, array: usize, dst: usize) -> Result<(), ErrorKind> {
        let handle = self.registers.handle(array)?;
        let limit = self.heap.get(handle)?.limit();
        self.registers.set(dst, Register::Long(limit as i64))
    }

    // ==================== Equality ====================

    fn op_bool_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = self.registers.bool(lhs)? == self.registers.bool(rhs)?;
        self.registers.set(dst, Register::Bool(value))
    }

    fn op_char_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = self.registers.char(lhs)? == self.registers.char(rhs)?;
        self.registers.set(dst, Register::Bool(value))
    }

    fn op_long_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x == y)))
    }

    fn op_float_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x == y)))
    }

    // ==================== Long arithmetic ====================

    fn long_binary(
        &mut self,
        lhs: usize,
        rhs: usize,
        dst: usize,
        f: impl FnOnce(i64, i64) -> Result<Register, ErrorKind>,
    ) -> Result<(), ErrorKind> {
        let value = f(self.registers.long(lhs)?, self.registers.long(rhs)?)?;
        self.registers.set(dst, value)
    }

    fn op_long_more(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x > y)))
    }

    fn op_long_less(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x < y)))
    }

    fn op_long_more_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x >= y)))
    }

    fn op_long_less_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x <= y)))
    }

    fn op_long_add(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Long(x.wrapping_add(y))))
    }

    fn op_long_subtract(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Long(x.wrapping_sub(y))))
    }

    fn op_long_multiply(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Long(x.wrapping_mul(y))))
    }

    fn op_long_divide(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| match y {
            0 => Err(ErrorKind::DivideByZero),
            _ => Ok(Register::Long(x.wrapping_div(y))),
        })
    }

    fn op_long_modulo(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| match y {
            0 => Err(ErrorKind::DivideByZero),
            _ => Ok(Register::Long(x.wrapping_rem(y))),
        })
    }

    fn op_long_exponentiate(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.long_binary(lhs, rhs, dst, |x, y| Ok(Register::Long(long_pow(x, y))))
    }

    // ==================== Float arithmetic ====================

    fn float_binary(
        &mut self,
        lhs: usize,
        rhs: usize,
        dst: usize,
        f: impl FnOnce(f64, f64) -> Result<Register, ErrorKind>,
    ) -> Result<(), ErrorKind> {
        let value = f(self.registers.float(lhs)?, self.registers.float(rhs)?)?;
        self.registers.set(dst, value)
    }

    fn op_float_more(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x > y)))
    }

    fn op_float_less(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x < y)))
    }

    fn op_float_more_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x >= y)))
    }

    fn op_float_less_equal(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Bool(x <= y)))
    }

    fn op_float_add(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Float(x + y)))
    }

    fn op_float_subtract(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Float(x - y)))
    }

    fn op_float_multiply(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Float(x * y)))
    }

    fn op_float_divide(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| {
            if y == 0.0 {
                return Err(ErrorKind::DivideByZero);
            }
            Ok(Register::Float(x / y))
        })
    }

    fn op_float_modulo(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| {
            if y == 0.0 {
                return Err(ErrorKind::DivideByZero);
            }
            Ok(Register::Float(x % y))
        })
    }

    fn op_float_exponentiate(&mut self, lhs: usize, rhs: usize, dst: usize) -> Result<(), ErrorKind> {
        self.float_binary(lhs, rhs, dst, |x, y| Ok(Register::Float(x.powf(y))))
    }

    // ==================== Negation ====================

    fn op_long_negate(&mut self, src: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = self.registers.long(src)?.wrapping_neg();
        self.registers.set(dst, Register::Long(value))
    }

    fn op_float_negate(&mut self, src: usize, dst: usize) -> Result<(), ErrorKind> {
        let value = -self.registers.float(src)?;
        self.registers.set(dst, Register::Float(value))
    }
}

/// Wrapping integer power. Negative exponents truncate toward zero, so only
/// bases 1 and -1 produce a non-zero result.
fn long_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 if exp % 2 == 0 => 1,
            -1 => -1,
            _ => 0,
        };
    }
    let mut result: i64 = 1;
    let mut base = base;
    let mut exp = exp as u64;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}
