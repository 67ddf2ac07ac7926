//! Foreign function bridge.
//!
//! Host code registers functions in a [`ForeignTable`] and programs call them
//! with `FOREIGN id, input, output`. Ids are handed out densely in
//! registration order. A function receives one register and returns one
//! register; multi-argument calls pass a heap array as input, and the
//! function reaches the heap through its [`ForeignContext`].
//!
//! Functions can also be pulled from named libraries through a
//! [`LibraryResolver`]. Each `(library, symbol)` pair is imported once and
//! keeps its id for the lifetime of the table.

use crate::virtual_machine::errors::{ErrorKind, VMError};
use crate::virtual_machine::vm::{HeapAlloc, HeapArena, HeapHandle, Register, TraceMode, Tracer};
use crate::warn;
use scopevm_derive::Error;
use std::collections::HashMap;

/// Failure reported by a foreign function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ForeignError {
    /// Human-readable reason, logged when the call halts the machine.
    pub message: String,
}

impl ForeignError {
    /// Creates an error carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ErrorKind> for ForeignError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind.to_string())
    }
}

/// Heap access granted to a foreign function for the duration of one call.
pub struct ForeignContext<'a> {
    heap: &'a mut HeapArena,
    tracer: &'a mut Tracer,
}

impl<'a> ForeignContext<'a> {
    pub(crate) fn new(heap: &'a mut HeapArena, tracer: &'a mut Tracer) -> Self {
        Self { heap, tracer }
    }

    /// Allocates an array owned by the caller's current collector frame.
    pub fn allocate(&mut self, size: u16, trace_mode: TraceMode) -> Result<HeapHandle, ErrorKind> {
        let handle = self.heap.allocate(size, trace_mode)?;
        self.tracer.register(self.heap, handle);
        Ok(handle)
    }

    /// Borrows a live allocation. Stale handles are `Internal`.
    pub fn alloc(&self, handle: HeapHandle) -> Result<&HeapAlloc, ErrorKind> {
        self.heap.get(handle)
    }

    /// Mutably borrows a live allocation.
    pub fn alloc_mut(&mut self, handle: HeapHandle) -> Result<&mut HeapAlloc, ErrorKind> {
        self.heap.get_mut(handle)
    }

    /// Reads a char array into a string.
    pub fn read_string(&self, handle: HeapHandle) -> Result<String, ErrorKind> {
        let alloc = self.heap.get(handle)?;
        (0..alloc.limit() as i64)
            .map(|i| alloc.load(i)?.as_char())
            .collect()
    }

    /// Copies `text` into a fresh char array.
    pub fn write_string(&mut self, text: &str) -> Result<HeapHandle, ErrorKind> {
        let len = u16::try_from(text.chars().count()).map_err(|_| ErrorKind::Memory)?;
        let handle = self.allocate(len, TraceMode::None)?;
        let alloc = self.heap.get_mut(handle)?;
        for (i, ch) in text.chars().enumerate() {
            alloc.store(i as i64, Register::Char(ch))?;
        }
        Ok(handle)
    }
}

/// A host function callable through `FOREIGN`.
pub trait ForeignFunction {
    /// Length the input array must have. `None` accepts any input register.
    fn arity(&self) -> Option<u16> {
        None
    }

    /// Runs the function on `input`; the returned register is written to the
    /// `FOREIGN` output operand.
    fn call(&mut self, ctx: &mut ForeignContext<'_>, input: Register) -> Result<Register, ForeignError>;
}

/// Adapter turning a closure into a [`ForeignFunction`].
pub struct NativeFn<F> {
    arity: Option<u16>,
    f: F,
}

impl<F> ForeignFunction for NativeFn<F>
where
    F: FnMut(&mut ForeignContext<'_>, Register) -> Result<Register, ForeignError>,
{
    fn arity(&self) -> Option<u16> {
        self.arity
    }

    fn call(&mut self, ctx: &mut ForeignContext<'_>, input: Register) -> Result<Register, ForeignError> {
        (self.f)(ctx, input)
    }
}

/// Source of functions for [`ForeignTable::import`].
pub trait LibraryResolver {
    /// Looks up `symbol` in `library`. `None` when it cannot be provided.
    fn resolve(&mut self, library: &str, symbol: &str) -> Option<Box<dyn ForeignFunction>>;
}

/// Symbols already imported, per library.
#[derive(Debug, Default)]
struct DynamicLibraryTable {
    libraries: HashMap<String, HashMap<String, u16>>,
}

impl DynamicLibraryTable {
    fn lookup(&self, library: &str, symbol: &str) -> Option<u16> {
        self.libraries.get(library)?.get(symbol).copied()
    }

    fn record(&mut self, library: &str, symbol: &str, id: u16) {
        self.libraries
            .entry(library.to_string())
            .or_default()
            .insert(symbol.to_string(), id);
    }
}

/// Registry of foreign functions indexed by call id.
#[derive(Default)]
pub struct ForeignTable {
    functions: Vec<Box<dyn ForeignFunction>>,
    libraries: DynamicLibraryTable,
}

impl ForeignTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered functions, imports included.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registers a function and returns its call id.
    pub fn include(&mut self, function: impl ForeignFunction + 'static) -> Result<u16, VMError> {
        self.push(Box::new(function))
    }

    /// Registers a closure accepting any input.
    pub fn include_fn<F>(&mut self, f: F) -> Result<u16, VMError>
    where
        F: FnMut(&mut ForeignContext<'_>, Register) -> Result<Register, ForeignError> + 'static,
    {
        self.include(NativeFn { arity: None, f })
    }

    /// Registers a closure whose input must be an array of `arity` slots.
    pub fn include_with_arity<F>(&mut self, arity: u16, f: F) -> Result<u16, VMError>
    where
        F: FnMut(&mut ForeignContext<'_>, Register) -> Result<Register, ForeignError> + 'static,
    {
        self.include(NativeFn {
            arity: Some(arity),
            f,
        })
    }

    fn push(&mut self, function: Box<dyn ForeignFunction>) -> Result<u16, VMError> {
        let id = u16::try_from(self.functions.len()).map_err(|_| VMError::ForeignTableFull)?;
        if id == u16::MAX {
            return Err(VMError::ForeignTableFull);
        }
        self.functions.push(function);
        Ok(id)
    }

    /// Imports `library::symbol` through `resolver`, reusing the id of an
    /// earlier import of the same pair.
    pub fn import(
        &mut self,
        resolver: &mut dyn LibraryResolver,
        library: &str,
        symbol: &str,
    ) -> Result<u16, VMError> {
        if let Some(id) = self.libraries.lookup(library, symbol) {
            return Ok(id);
        }
        let function = resolver
            .resolve(library, symbol)
            .ok_or_else(|| VMError::UnresolvedForeign {
                library: library.to_string(),
                symbol: symbol.to_string(),
            })?;
        let id = self.push(function)?;
        self.libraries.record(library, symbol, id);
        Ok(id)
    }

    /// Id of a previously imported symbol.
    pub fn imported(&self, library: &str, symbol: &str) -> Option<u16> {
        self.libraries.lookup(library, symbol)
    }

    /// Runs function `id`. Every failure is reported as [`ErrorKind::Foreign`].
    pub(crate) fn invoke(
        &mut self,
        id: i64,
        ctx: &mut ForeignContext<'_>,
        input: Register,
    ) -> Result<Register, ErrorKind> {
        let Some(function) = usize::try_from(id)
            .ok()
            .and_then(|i| self.functions.get_mut(i))
        else {
            warn!("foreign call to unregistered id {id}");
            return Err(ErrorKind::Foreign);
        };

        if let Some(arity) = function.arity() {
            let actual = input
                .as_handle()
                .and_then(|handle| ctx.alloc(handle))
                .map(HeapAlloc::limit);
            if actual != Ok(arity) {
                warn!("foreign call {id}: expected an array of {arity} slots");
                return Err(ErrorKind::Foreign);
            }
        }

        function.call(ctx, input).map_err(|err| {
            warn!("foreign call {id} failed: {err}");
            ErrorKind::Foreign
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> (HeapArena, Tracer) {
        (HeapArena::new(16, 0), Tracer::new(4))
    }

    struct Doubler;

    impl ForeignFunction for Doubler {
        fn call(&mut self, _: &mut ForeignContext<'_>, input: Register) -> Result<Register, ForeignError> {
            Ok(Register::Long(input.as_long()? * 2))
        }
    }

    struct MathLib;

    impl LibraryResolver for MathLib {
        fn resolve(&mut self, library: &str, symbol: &str) -> Option<Box<dyn ForeignFunction>> {
            match (library, symbol) {
                ("math", "double") => Some(Box::new(Doubler)),
                _ => None,
            }
        }
    }

    #[test]
    fn ids_are_dense() {
        let mut table = ForeignTable::new();
        assert_eq!(table.include(Doubler), Ok(0));
        assert_eq!(table.include_fn(|_, input| Ok(input)), Ok(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn invoke_passes_input_and_output() {
        let (mut heap, mut tracer) = heap();
        let mut table = ForeignTable::new();
        let id = table.include(Doubler).unwrap();
        let mut ctx = ForeignContext::new(&mut heap, &mut tracer);
        assert_eq!(
            table.invoke(id as i64, &mut ctx, Register::Long(21)),
            Ok(Register::Long(42))
        );
    }

    #[test]
    fn unregistered_id_is_foreign_error() {
        let (mut heap, mut tracer) = heap();
        let mut table = ForeignTable::new();
        let mut ctx = ForeignContext::new(&mut heap, &mut tracer);
        assert_eq!(
            table.invoke(3, &mut ctx, Register::Long(0)),
            Err(ErrorKind::Foreign)
        );
        assert_eq!(
            table.invoke(-1, &mut ctx, Register::Long(0)),
            Err(ErrorKind::Foreign)
        );
    }

    #[test]
    fn failing_function_is_foreign_error() {
        let (mut heap, mut tracer) = heap();
        let mut table = ForeignTable::new();
        let id = table.include(Doubler).unwrap();
        let mut ctx = ForeignContext::new(&mut heap, &mut tracer);
        assert_eq!(
            table.invoke(id as i64, &mut ctx, Register::Bool(true)),
            Err(ErrorKind::Foreign)
        );
    }

    #[test]
    fn arity_is_checked_against_input_array() {
        let (mut heap, mut tracer) = heap();
        let mut table = ForeignTable::new();
        let id = table
            .include_with_arity(2, |ctx, input| {
                let args = ctx.alloc(input.as_handle()?)?;
                let sum = args.load(0)?.as_long()? + args.load(1)?.as_long()?;
                Ok(Register::Long(sum))
            })
            .unwrap();

        let mut ctx = ForeignContext::new(&mut heap, &mut tracer);
        let args = ctx.allocate(2, TraceMode::None).unwrap();
        ctx.alloc_mut(args).unwrap().store(0, Register::Long(40)).unwrap();
        ctx.alloc_mut(args).unwrap().store(1, Register::Long(2)).unwrap();
        assert_eq!(
            table.invoke(id as i64, &mut ctx, Register::Handle(args)),
            Ok(Register::Long(42))
        );

        let short = ctx.allocate(1, TraceMode::None).unwrap();
        assert_eq!(
            table.invoke(id as i64, &mut ctx, Register::Handle(short)),
            Err(ErrorKind::Foreign)
        );
        assert_eq!(
            table.invoke(id as i64, &mut ctx, Register::Long(1)),
            Err(ErrorKind::Foreign)
        );
    }

    #[test]
    fn strings_round_trip_through_heap() {
        let (mut heap, mut tracer) = heap();
        let mut ctx = ForeignContext::new(&mut heap, &mut tracer);
        let handle = ctx.write_string("héllo").unwrap();
        assert_eq!(ctx.alloc(handle).unwrap().limit(), 5);
        assert_eq!(ctx.read_string(handle).unwrap(), "héllo");
        assert_eq!(tracer.allocations(), &[handle]);
    }

    #[test]
    fn imports_are_deduplicated() {
        let mut table = ForeignTable::new();
        table.include(Doubler).unwrap();
        let first = table.import(&mut MathLib, "math", "double").unwrap();
        let second = table.import(&mut MathLib, "math", "double").unwrap();
        assert_eq!(first, 1);
        assert_eq!(first, second);
        assert_eq!(table.len(), 2);
        assert_eq!(table.imported("math", "double"), Some(1));
        assert!(matches!(
            table.import(&mut MathLib, "math", "sqrt"),
            Err(VMError::UnresolvedForeign { .. })
        ));
    }
}
