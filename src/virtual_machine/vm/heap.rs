//! Heap allocation arena.
//!
//! Allocations live in a slot table addressed by [`HeapHandle`]s. Every
//! release bumps the slot's generation, so a handle that outlived its
//! allocation (freed explicitly, swept by a frame clean, or freed twice)
//! is detected on use and reported as [`ErrorKind::Internal`].
//!
//! Released allocations go to a bounded free pool and are recycled by later
//! allocations of equal or smaller size, keeping their backing storage but
//! none of its contents.

use crate::virtual_machine::errors::ErrorKind;
use crate::virtual_machine::vm::registers::Register;

/// Stable reference to a heap allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapHandle {
    index: u32,
    generation: u32,
}

impl HeapHandle {
    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Which slots of an allocation hold handles the collector must follow.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceMode {
    /// Plain data, never followed.
    None = 0,
    /// Every initialized slot is followed.
    All = 1,
    /// Only slots flagged in `trace_stat` are followed.
    Some = 2,
}

impl TryFrom<u16> for TraceMode {
    type Error = ErrorKind;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TraceMode::None),
            1 => Ok(TraceMode::All),
            2 => Ok(TraceMode::Some),
            _ => Err(ErrorKind::Internal),
        }
    }
}

/// A variable-length array of registers with per-slot metadata.
#[derive(Debug)]
pub struct HeapAlloc {
    registers: Vec<Register>,
    init_stat: Vec<bool>,
    trace_stat: Vec<bool>,
    limit: u16,
    trace_mode: TraceMode,
    mark: u32,
}

impl HeapAlloc {
    fn new(size: u16, trace_mode: TraceMode) -> Result<Self, ErrorKind> {
        let size = size as usize;
        let mut registers = Vec::new();
        registers
            .try_reserve_exact(size)
            .map_err(|_| ErrorKind::Memory)?;
        registers.resize(size, Register::default());
        Ok(Self {
            registers,
            init_stat: vec![false; size],
            trace_stat: vec![false; size],
            limit: size as u16,
            trace_mode,
            mark: 0,
        })
    }

    /// Prepares a pooled allocation for reuse with a logical size of `size`.
    ///
    /// The whole backing store is cleared, so unchecked reads past the new
    /// limit never observe the previous owner's values.
    fn recycle(&mut self, size: u16, trace_mode: TraceMode) {
        self.registers.fill(Register::default());
        self.init_stat.fill(false);
        self.trace_stat.fill(false);
        self.limit = size;
        self.trace_mode = trace_mode;
        self.mark = 0;
    }

    /// Number of addressable slots.
    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// Size of the backing storage, at least `limit`.
    pub fn capacity(&self) -> usize {
        self.registers.len()
    }

    pub fn trace_mode(&self) -> TraceMode {
        self.trace_mode
    }

    pub fn set_trace_mode(&mut self, trace_mode: TraceMode) {
        self.trace_mode = trace_mode;
    }

    /// True when the allocation may embed handles.
    pub fn holds_handles(&self) -> bool {
        self.trace_mode != TraceMode::None
    }

    fn checked_index(&self, index: i64) -> Result<usize, ErrorKind> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.limit as usize)
            .ok_or(ErrorKind::IndexOutOfRange)
    }

    pub fn is_initialized(&self, index: usize) -> bool {
        index < self.limit as usize && self.init_stat[index]
    }

    pub fn is_traced(&self, index: usize) -> bool {
        index < self.limit as usize && self.trace_stat[index]
    }

    /// Bounds- and initialization-checked read.
    pub fn load(&self, index: i64) -> Result<Register, ErrorKind> {
        let index = self.checked_index(index)?;
        if !self.init_stat[index] {
            return Err(ErrorKind::UninitializedRead);
        }
        Ok(self.registers[index])
    }

    /// Read that skips the limit and initialization checks.
    ///
    /// Only the backing storage bound is enforced.
    pub fn load_unchecked(&self, index: usize) -> Result<Register, ErrorKind> {
        self.registers.get(index).copied().ok_or(ErrorKind::Internal)
    }

    /// Bounds-checked write.
    pub fn store(&mut self, index: i64, value: Register) -> Result<(), ErrorKind> {
        let index = self.checked_index(index)?;
        self.registers[index] = value;
        self.init_stat[index] = true;
        Ok(())
    }

    /// Write that skips the limit check.
    pub fn store_unchecked(&mut self, index: usize, value: Register) -> Result<(), ErrorKind> {
        let slot = self.registers.get_mut(index).ok_or(ErrorKind::Internal)?;
        *slot = value;
        self.init_stat[index] = true;
        Ok(())
    }

    /// Flags whether slot `index` is followed under [`TraceMode::Some`].
    pub fn set_traced(&mut self, index: i64, traced: bool) -> Result<(), ErrorKind> {
        let index = self.checked_index(index)?;
        self.trace_stat[index] = traced;
        Ok(())
    }

    /// Handles the collector follows out of this allocation.
    pub fn children(&self) -> impl Iterator<Item = HeapHandle> + '_ {
        let followed = move |i: &usize| match self.trace_mode {
            TraceMode::None => false,
            TraceMode::All => true,
            TraceMode::Some => self.trace_stat[*i],
        };
        (0..self.limit as usize)
            .filter(move |&i| self.init_stat[i])
            .filter(followed)
            .filter_map(move |i| self.registers[i].as_handle().ok())
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    alloc: Option<HeapAlloc>,
}

/// Owner of every live heap allocation.
pub struct HeapArena {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    pool: Vec<HeapAlloc>,
    live: usize,
    limit: usize,
    pool_limit: usize,
    epoch: u32,
}

impl HeapArena {
    /// Creates an arena holding at most `limit` live allocations and keeping
    /// up to `pool_limit` released ones for reuse.
    pub fn new(limit: usize, pool_limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            pool: Vec::new(),
            live: 0,
            limit,
            pool_limit,
            epoch: 0,
        }
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of released allocations waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn allocate(&mut self, size: u16, trace_mode: TraceMode) -> Result<HeapHandle, ErrorKind> {
        if self.live >= self.limit {
            return Err(ErrorKind::Memory);
        }

        let alloc = match self
            .pool
            .iter()
            .position(|pooled| pooled.capacity() >= size as usize)
        {
            Some(i) => {
                let mut alloc = self.pool.swap_remove(i);
                alloc.recycle(size, trace_mode);
                alloc
            }
            None => HeapAlloc::new(size, trace_mode)?,
        };

        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| ErrorKind::Memory)?;
                self.slots.push(Slot {
                    generation: 0,
                    alloc: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.alloc = Some(alloc);
        self.live += 1;
        Ok(HeapHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Releases an allocation. Fails on handles that are already released.
    pub fn release(&mut self, handle: HeapHandle) -> Result<(), ErrorKind> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(ErrorKind::Internal)?;
        let alloc = slot.alloc.take().ok_or(ErrorKind::Internal)?;
        slot.generation = slot.generation.wrapping_add(1);

        self.vacant.push(handle.index);
        self.live -= 1;
        if self.pool.len() < self.pool_limit {
            self.pool.push(alloc);
        }
        Ok(())
    }

    pub fn contains(&self, handle: HeapHandle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn get(&self, handle: HeapHandle) -> Result<&HeapAlloc, ErrorKind> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.alloc.as_ref())
            .ok_or(ErrorKind::Internal)
    }

    pub fn get_mut(&mut self, handle: HeapHandle) -> Result<&mut HeapAlloc, ErrorKind> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.alloc.as_mut())
            .ok_or(ErrorKind::Internal)
    }

    /// Starts a marking pass. Marks left by earlier passes never equal the
    /// returned epoch.
    pub(crate) fn next_epoch(&mut self) -> u32 {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            for alloc in self.slots.iter_mut().filter_map(|slot| slot.alloc.as_mut()) {
                alloc.mark = 0;
            }
            self.epoch = 1;
        }
        self.epoch
    }

    /// Marks every live allocation reachable from `roots` with `epoch` and
    /// appends each newly marked handle to `visited`.
    ///
    /// Already marked allocations are not revisited, which bounds the walk
    /// on cyclic graphs. Stale roots and children are skipped.
    pub(crate) fn mark_from(
        &mut self,
        roots: impl IntoIterator<Item = HeapHandle>,
        epoch: u32,
        visited: &mut Vec<HeapHandle>,
    ) {
        let mut worklist: Vec<HeapHandle> = roots.into_iter().collect();
        while let Some(handle) = worklist.pop() {
            let Ok(alloc) = self.get_mut(handle) else {
                continue;
            };
            if alloc.mark == epoch {
                continue;
            }
            alloc.mark = epoch;
            visited.push(handle);
            worklist.extend(alloc.children());
        }
    }

    pub(crate) fn is_marked(&self, handle: HeapHandle, epoch: u32) -> bool {
        self.get(handle).is_ok_and(|alloc| alloc.mark == epoch)
    }

    /// Releases every live allocation and empties the pool.
    ///
    /// Handles issued before the call stay invalid afterwards.
    pub fn clear(&mut self) -> usize {
        let released = self.live;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.alloc.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.vacant.push(index as u32);
            }
        }
        self.pool.clear();
        self.live = 0;
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> HeapArena {
        HeapArena::new(8, 4)
    }

    #[test]
    fn checked_access() {
        let mut heap = arena();
        let h = heap.allocate(2, TraceMode::None).unwrap();
        let alloc = heap.get_mut(h).unwrap();

        assert_eq!(alloc.load(0), Err(ErrorKind::UninitializedRead));
        alloc.store(1, Register::Long(42)).unwrap();
        assert_eq!(alloc.load(1), Ok(Register::Long(42)));
        assert_eq!(alloc.load(2), Err(ErrorKind::IndexOutOfRange));
        assert_eq!(alloc.load(-1), Err(ErrorKind::IndexOutOfRange));
        assert_eq!(
            alloc.store(2, Register::Bool(true)),
            Err(ErrorKind::IndexOutOfRange)
        );
    }

    #[test]
    fn unchecked_access_stays_inside_backing_store() {
        let mut heap = arena();
        let h = heap.allocate(1, TraceMode::None).unwrap();
        let alloc = heap.get_mut(h).unwrap();
        alloc.store_unchecked(0, Register::Char('x')).unwrap();
        assert_eq!(alloc.load_unchecked(0), Ok(Register::Char('x')));
        assert_eq!(alloc.load(0), Ok(Register::Char('x')));
        assert_eq!(alloc.load_unchecked(1), Err(ErrorKind::Internal));
    }

    #[test]
    fn double_free_is_internal() {
        let mut heap = arena();
        let h = heap.allocate(1, TraceMode::None).unwrap();
        heap.release(h).unwrap();
        assert_eq!(heap.release(h), Err(ErrorKind::Internal));
        assert_eq!(heap.get(h).err(), Some(ErrorKind::Internal));
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let mut heap = arena();
        let old = heap.allocate(1, TraceMode::None).unwrap();
        heap.release(old).unwrap();
        let new = heap.allocate(1, TraceMode::None).unwrap();

        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(!heap.contains(old));
        assert!(heap.contains(new));
    }

    #[test]
    fn pool_recycles_larger_backing_store() {
        let mut heap = arena();
        let big = heap.allocate(10, TraceMode::All).unwrap();
        heap.get_mut(big).unwrap().store(3, Register::Long(9)).unwrap();
        heap.release(big).unwrap();
        assert_eq!(heap.pooled(), 1);

        let small = heap.allocate(4, TraceMode::None).unwrap();
        assert_eq!(heap.pooled(), 0);
        let alloc = heap.get(small).unwrap();
        assert_eq!(alloc.limit(), 4);
        assert_eq!(alloc.capacity(), 10);
        assert_eq!(alloc.trace_mode(), TraceMode::None);
        assert_eq!(alloc.load(3), Err(ErrorKind::UninitializedRead));
        assert_eq!(alloc.load(4), Err(ErrorKind::IndexOutOfRange));
    }

    #[test]
    fn recycled_storage_is_cleared() {
        let mut heap = arena();
        let old = heap.allocate(4, TraceMode::None).unwrap();
        heap.get_mut(old).unwrap().store(3, Register::Long(99)).unwrap();
        heap.release(old).unwrap();

        let reused = heap.allocate(1, TraceMode::None).unwrap();
        let alloc = heap.get(reused).unwrap();
        assert_eq!(alloc.capacity(), 4);
        assert_eq!(alloc.load_unchecked(3), Ok(Register::default()));
    }

    #[test]
    fn pool_is_bounded() {
        let mut heap = HeapArena::new(8, 1);
        let a = heap.allocate(1, TraceMode::None).unwrap();
        let b = heap.allocate(1, TraceMode::None).unwrap();
        heap.release(a).unwrap();
        heap.release(b).unwrap();
        assert_eq!(heap.pooled(), 1);
    }

    #[test]
    fn capacity_exhaustion_is_memory_error() {
        let mut heap = HeapArena::new(2, 0);
        heap.allocate(1, TraceMode::None).unwrap();
        let h = heap.allocate(1, TraceMode::None).unwrap();
        assert_eq!(heap.allocate(1, TraceMode::None), Err(ErrorKind::Memory));
        heap.release(h).unwrap();
        assert!(heap.allocate(1, TraceMode::None).is_ok());
    }

    #[test]
    fn children_follow_trace_mode() {
        let mut heap = arena();
        let leaf = heap.allocate(0, TraceMode::None).unwrap();
        let parent = heap.allocate(3, TraceMode::Some).unwrap();
        {
            let alloc = heap.get_mut(parent).unwrap();
            alloc.store(0, Register::Handle(leaf)).unwrap();
            alloc.store(1, Register::Handle(leaf)).unwrap();
            alloc.store(2, Register::Long(5)).unwrap();
            alloc.set_traced(1, true).unwrap();
            alloc.set_traced(2, true).unwrap();
        }
        let alloc = heap.get(parent).unwrap();
        assert_eq!(alloc.children().collect::<Vec<_>>(), vec![leaf]);

        heap.get_mut(parent).unwrap().set_trace_mode(TraceMode::All);
        assert_eq!(heap.get(parent).unwrap().children().count(), 2);

        heap.get_mut(parent).unwrap().set_trace_mode(TraceMode::None);
        assert_eq!(heap.get(parent).unwrap().children().count(), 0);
    }

    #[test]
    fn marking_terminates_on_cycles() {
        let mut heap = arena();
        let a = heap.allocate(1, TraceMode::All).unwrap();
        let b = heap.allocate(1, TraceMode::All).unwrap();
        heap.get_mut(a).unwrap().store(0, Register::Handle(b)).unwrap();
        heap.get_mut(b).unwrap().store(0, Register::Handle(a)).unwrap();

        let epoch = heap.next_epoch();
        let mut visited = Vec::new();
        heap.mark_from([a], epoch, &mut visited);
        assert_eq!(visited.len(), 2);
        assert!(heap.is_marked(a, epoch) && heap.is_marked(b, epoch));

        let next = heap.next_epoch();
        assert!(!heap.is_marked(a, next));
    }

    #[test]
    fn clear_invalidates_every_handle() {
        let mut heap = arena();
        let a = heap.allocate(1, TraceMode::None).unwrap();
        let b = heap.allocate(1, TraceMode::None).unwrap();
        assert_eq!(heap.clear(), 2);
        assert!(!heap.contains(a) && !heap.contains(b));
        let c = heap.allocate(1, TraceMode::None).unwrap();
        assert!(heap.contains(c));
        assert!(!heap.contains(a));
    }
}
