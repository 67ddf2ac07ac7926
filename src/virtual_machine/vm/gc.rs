//! Frame-scoped tracing collector.
//!
//! Every allocation is registered in the collector frame that was open when
//! it was made. `GC_TRACE` marks an allocation as escaping the current
//! frame. `GC_CLEAN` closes the frame: whatever is reachable from its traces
//! is promoted to the parent frame, everything else allocated in the frame
//! is released. The root frame is never cleaned, its allocations live until
//! the machine is torn down.

use crate::virtual_machine::errors::ErrorKind;
use crate::virtual_machine::vm::heap::{HeapArena, HeapHandle};

/// Entries a frame may hold before stale handles are compacted away.
const COMPACT_THRESHOLD: usize = 64;

#[derive(Debug)]
struct GcFrame {
    allocs: Vec<HeapHandle>,
    traces: Vec<HeapHandle>,
    /// Length at which `allocs` or `traces` is next compacted.
    compact_at: usize,
}

impl Default for GcFrame {
    fn default() -> Self {
        Self {
            allocs: Vec::new(),
            traces: Vec::new(),
            compact_at: COMPACT_THRESHOLD,
        }
    }
}

impl GcFrame {
    fn push_alloc(&mut self, heap: &HeapArena, handle: HeapHandle) {
        if self.allocs.len() >= self.compact_at {
            self.compact(heap);
        }
        self.allocs.push(handle);
    }

    /// Adds a trace unless `handle` is already traced. Returns true when added.
    fn push_trace(&mut self, heap: &HeapArena, handle: HeapHandle) -> bool {
        if self.traces.contains(&handle) {
            return false;
        }
        if self.traces.len() >= self.compact_at {
            self.compact(heap);
        }
        self.traces.push(handle);
        true
    }

    /// Drops entries whose allocation was released. The next compaction
    /// happens once the larger list has doubled.
    fn compact(&mut self, heap: &HeapArena) {
        self.allocs.retain(|&h| heap.contains(h));
        self.traces.retain(|&h| heap.contains(h));
        let len = self.allocs.len().max(self.traces.len());
        self.compact_at = (len * 2).max(COMPACT_THRESHOLD);
    }
}

/// Outcome of closing a collector frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Allocations handed to the parent frame.
    pub promoted: usize,
    /// Allocations released to the heap.
    pub released: usize,
}

/// Stack of collector frames above an always-present root frame.
#[derive(Debug)]
pub struct Tracer {
    root: GcFrame,
    frames: Vec<GcFrame>,
    frame_limit: usize,
    visited: Vec<HeapHandle>,
}

impl Tracer {
    pub fn new(frame_limit: usize) -> Self {
        Self {
            root: GcFrame::default(),
            frames: Vec::new(),
            frame_limit,
            visited: Vec::new(),
        }
    }

    /// Number of frames opened above the root.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn current(&self) -> &GcFrame {
        self.frames.last().unwrap_or(&self.root)
    }

    fn current_mut(&mut self) -> &mut GcFrame {
        self.frames.last_mut().unwrap_or(&mut self.root)
    }

    /// Allocations owned by the current frame.
    pub fn allocations(&self) -> &[HeapHandle] {
        &self.current().allocs
    }

    /// Traces recorded in the current frame.
    pub fn traces(&self) -> &[HeapHandle] {
        &self.current().traces
    }

    pub fn new_frame(&mut self) -> Result<(), ErrorKind> {
        if self.frames.len() >= self.frame_limit {
            return Err(ErrorKind::StackOverflow);
        }
        self.frames.push(GcFrame::default());
        Ok(())
    }

    /// Records a fresh allocation in the current frame.
    pub fn register(&mut self, heap: &HeapArena, handle: HeapHandle) {
        self.current_mut().push_alloc(heap, handle);
    }

    /// Drops an explicitly freed allocation from the current frame.
    ///
    /// Handles owned by other frames are left for compaction or the sweep,
    /// which skip released entries.
    pub fn forget(&mut self, handle: HeapHandle) {
        let frame = self.current_mut();
        if let Some(i) = frame.allocs.iter().rposition(|&h| h == handle) {
            frame.allocs.swap_remove(i);
        }
        frame.traces.retain(|&h| h != handle);
    }

    /// Marks `handle` as escaping the current frame. Tracing an already
    /// traced handle is a no-op.
    ///
    /// The allocation may belong to any open frame, but it must be live.
    pub fn trace(&mut self, heap: &HeapArena, handle: HeapHandle) -> Result<(), ErrorKind> {
        if !heap.contains(handle) {
            return Err(ErrorKind::Internal);
        }
        self.current_mut().push_trace(heap, handle);
        Ok(())
    }

    /// Removes one trace of `handle` from the current frame.
    pub fn untrace(&mut self, handle: HeapHandle) -> bool {
        let traces = &mut self.current_mut().traces;
        match traces.iter().rposition(|&h| h == handle) {
            Some(i) => {
                traces.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Traces `handle` and everything reachable from it. Returns the number
    /// of allocations newly traced.
    pub fn supertrace(&mut self, heap: &mut HeapArena, handle: HeapHandle) -> Result<usize, ErrorKind> {
        self.reachable_from(heap, handle)?;

        let heap: &HeapArena = heap;
        let frame = self.frames.last_mut().unwrap_or(&mut self.root);
        let added = self
            .visited
            .iter()
            .filter(|&&reached| frame.push_trace(heap, reached))
            .count();
        Ok(added)
    }

    /// Removes the traces of `handle` and everything reachable from it.
    /// Returns the number of traces dropped.
    pub fn detrace(&mut self, heap: &mut HeapArena, handle: HeapHandle) -> Result<usize, ErrorKind> {
        let epoch = self.reachable_from(heap, handle)?;

        let frame = self.frames.last_mut().unwrap_or(&mut self.root);
        let before = frame.traces.len();
        frame.traces.retain(|&h| !heap.is_marked(h, epoch));
        Ok(before - frame.traces.len())
    }

    fn reachable_from(&mut self, heap: &mut HeapArena, handle: HeapHandle) -> Result<u32, ErrorKind> {
        if !heap.contains(handle) {
            return Err(ErrorKind::Internal);
        }
        let epoch = heap.next_epoch();
        self.visited.clear();
        heap.mark_from([handle], epoch, &mut self.visited);
        Ok(epoch)
    }

    /// Closes the current frame, promoting what its traces reach and
    /// releasing the rest of its allocations.
    ///
    /// Allocations already released (explicitly or by an earlier clean) are
    /// skipped. Cleaning the root frame is an internal error.
    pub fn clean(&mut self, heap: &mut HeapArena) -> Result<SweepReport, ErrorKind> {
        let frame = self.frames.pop().ok_or(ErrorKind::Internal)?;

        let epoch = heap.next_epoch();
        self.visited.clear();
        heap.mark_from(frame.traces.iter().copied(), epoch, &mut self.visited);

        let mut report = SweepReport::default();
        for handle in frame.allocs {
            if !heap.contains(handle) {
                continue;
            }
            if heap.is_marked(handle, epoch) {
                self.current_mut().push_alloc(heap, handle);
                report.promoted += 1;
            } else {
                heap.release(handle)?;
                report.released += 1;
            }
        }
        Ok(report)
    }

    /// Cleans every open frame, innermost first, leaving only the root.
    pub fn unwind(&mut self, heap: &mut HeapArena) -> Result<SweepReport, ErrorKind> {
        let mut total = SweepReport::default();
        while !self.frames.is_empty() {
            let report = self.clean(heap)?;
            total.promoted += report.promoted;
            total.released += report.released;
        }
        Ok(total)
    }

    /// Drops every frame and bookkeeping entry.
    pub fn reset(&mut self) {
        self.root = GcFrame::default();
        self.frames.clear();
        self.visited.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::vm::heap::TraceMode;
    use crate::virtual_machine::vm::registers::Register;

    fn setup() -> (HeapArena, Tracer) {
        (HeapArena::new(64, 0), Tracer::new(4))
    }

    fn alloc(heap: &mut HeapArena, tracer: &mut Tracer, size: u16, mode: TraceMode) -> HeapHandle {
        let h = heap.allocate(size, mode).unwrap();
        tracer.register(heap, h);
        h
    }

    fn link(heap: &mut HeapArena, from: HeapHandle, index: i64, to: HeapHandle) {
        heap.get_mut(from)
            .unwrap()
            .store(index, Register::Handle(to))
            .unwrap();
    }

    #[test]
    fn clean_releases_untraced() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let h = alloc(&mut heap, &mut tracer, 2, TraceMode::None);

        let report = tracer.clean(&mut heap).unwrap();
        assert_eq!(report, SweepReport { promoted: 0, released: 1 });
        assert!(!heap.contains(h));
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn traced_allocation_moves_to_parent() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        tracer.new_frame().unwrap();
        let h = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        tracer.trace(&heap, h).unwrap();

        let report = tracer.clean(&mut heap).unwrap();
        assert_eq!(report.promoted, 1);
        assert!(heap.contains(h));
        assert_eq!(tracer.allocations(), &[h]);
        assert!(tracer.traces().is_empty());

        // Not traced again in the parent, so the next clean releases it.
        tracer.clean(&mut heap).unwrap();
        assert!(!heap.contains(h));
    }

    #[test]
    fn handles_inside_traced_array_survive() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let outer = alloc(&mut heap, &mut tracer, 2, TraceMode::Some);
        let kept = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        let dropped = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        link(&mut heap, outer, 0, kept);
        link(&mut heap, outer, 1, dropped);
        heap.get_mut(outer).unwrap().set_traced(0, true).unwrap();
        tracer.trace(&heap, outer).unwrap();

        let report = tracer.clean(&mut heap).unwrap();
        assert_eq!(report, SweepReport { promoted: 2, released: 1 });
        assert!(heap.contains(outer) && heap.contains(kept));
        assert!(!heap.contains(dropped));
    }

    #[test]
    fn cyclic_graph_is_promoted_once() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let a = alloc(&mut heap, &mut tracer, 1, TraceMode::All);
        let b = alloc(&mut heap, &mut tracer, 1, TraceMode::All);
        link(&mut heap, a, 0, b);
        link(&mut heap, b, 0, a);
        tracer.trace(&heap, a).unwrap();

        let report = tracer.clean(&mut heap).unwrap();
        assert_eq!(report, SweepReport { promoted: 2, released: 0 });
        assert_eq!(tracer.allocations().len(), 2);
    }

    #[test]
    fn untraced_cycle_is_released() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let a = alloc(&mut heap, &mut tracer, 1, TraceMode::All);
        let b = alloc(&mut heap, &mut tracer, 1, TraceMode::All);
        link(&mut heap, a, 0, b);
        link(&mut heap, b, 0, a);

        assert_eq!(tracer.clean(&mut heap).unwrap().released, 2);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn explicitly_freed_allocation_is_skipped() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let h = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        heap.release(h).unwrap();

        assert_eq!(tracer.clean(&mut heap).unwrap(), SweepReport::default());
    }

    #[test]
    fn cleaning_root_is_internal() {
        let (mut heap, mut tracer) = setup();
        assert_eq!(tracer.clean(&mut heap), Err(ErrorKind::Internal));
    }

    #[test]
    fn frame_limit_is_enforced() {
        let (_, mut tracer) = setup();
        for _ in 0..4 {
            tracer.new_frame().unwrap();
        }
        assert_eq!(tracer.new_frame(), Err(ErrorKind::StackOverflow));
        assert_eq!(tracer.depth(), 4);
    }

    #[test]
    fn tracing_stale_handle_is_internal() {
        let (mut heap, mut tracer) = setup();
        let h = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        heap.release(h).unwrap();
        assert_eq!(tracer.trace(&heap, h), Err(ErrorKind::Internal));
    }

    #[test]
    fn supertrace_and_detrace_walk_graph() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let a = alloc(&mut heap, &mut tracer, 1, TraceMode::All);
        let b = alloc(&mut heap, &mut tracer, 1, TraceMode::All);
        let c = alloc(&mut heap, &mut tracer, 0, TraceMode::None);
        link(&mut heap, a, 0, b);
        link(&mut heap, b, 0, c);

        assert_eq!(tracer.supertrace(&mut heap, a), Ok(3));
        assert_eq!(tracer.supertrace(&mut heap, a), Ok(0));
        assert_eq!(tracer.detrace(&mut heap, b), Ok(2));
        assert_eq!(tracer.traces(), &[a]);

        assert!(tracer.untrace(a));
        assert!(!tracer.untrace(a));
    }

    #[test]
    fn repeated_trace_is_recorded_once() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let h = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        for _ in 0..10 {
            tracer.trace(&heap, h).unwrap();
        }
        assert_eq!(tracer.traces(), &[h]);
    }

    #[test]
    fn forget_drops_freed_allocation() {
        let (mut heap, mut tracer) = setup();
        let h = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        tracer.trace(&heap, h).unwrap();
        heap.release(h).unwrap();
        tracer.forget(h);

        assert!(tracer.allocations().is_empty());
        assert!(tracer.traces().is_empty());
    }

    #[test]
    fn stale_entries_are_compacted() {
        let (mut heap, mut tracer) = setup();
        let kept = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        for _ in 0..1000 {
            let h = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
            heap.release(h).unwrap();
        }

        assert!(tracer.allocations().len() <= COMPACT_THRESHOLD);
        assert!(tracer.allocations().contains(&kept));
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn unwind_cleans_every_open_frame() {
        let (mut heap, mut tracer) = setup();
        tracer.new_frame().unwrap();
        let kept = alloc(&mut heap, &mut tracer, 1, TraceMode::None);
        tracer.trace(&heap, kept).unwrap();
        tracer.new_frame().unwrap();
        let dropped = alloc(&mut heap, &mut tracer, 1, TraceMode::None);

        let report = tracer.unwind(&mut heap).unwrap();
        assert_eq!(report, SweepReport { promoted: 1, released: 1 });
        assert_eq!(tracer.depth(), 0);
        assert!(heap.contains(kept) && !heap.contains(dropped));
        assert_eq!(tracer.allocations(), &[kept]);
    }
}
