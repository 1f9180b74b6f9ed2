//! The heap allocator.
//!
//! A first-fit allocator over a contiguous slot range inside the VM's
//! memory map, reached through the [MemoryBus] seam.  Every block is a
//! two-slot header `[payload-size, used-flag]` followed by the payload;
//! walking from the heap start by `2 + size` visits every block and ends
//! exactly at the end of the heap.  Freeing runs a single forward
//! coalescing pass that re-examines its position after each merge, so
//! chains of free neighbors collapse fully.

use crate::common::{Diagnostic, ErrorKind, Map};

/// How the allocator touches memory: the VM hands it a view of its own
/// memory map.
pub trait MemoryBus {
    fn read(&self, addr: i64) -> i64;
    fn write(&mut self, addr: i64, value: i64);
}

/// Absent slots read as zero.
impl MemoryBus for Map<i64, i64> {
    fn read(&self, addr: i64) -> i64 {
        self.get(&addr).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: i64, value: i64) {
        self.insert(addr, value);
    }
}

pub const DEFAULT_HEAP_START: i64 = 4096;
pub const DEFAULT_HEAP_SIZE: i64 = 10240;

/// Slots taken by a block header.
const HEADER: i64 = 2;

#[derive(Clone, Copy, Debug)]
pub struct HeapAllocator {
    start: i64,
    size: i64,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        HeapAllocator {
            start: DEFAULT_HEAP_START,
            size: DEFAULT_HEAP_SIZE,
        }
    }
}

impl HeapAllocator {
    pub fn new(start: i64, size: i64) -> Self {
        HeapAllocator { start, size }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.start + self.size
    }

    /// Write a single free block covering the whole range.
    pub fn init(&self, bus: &mut impl MemoryBus) {
        bus.write(self.start, self.size - HEADER);
        bus.write(self.start + 1, 0);
    }

    /// First-fit allocation.  Returns the payload address, or 0 when no
    /// free block is large enough.
    pub fn alloc(&self, bus: &mut impl MemoryBus, want: i64) -> i64 {
        if want <= 0 {
            return 0;
        }
        let mut header = self.start;
        while header < self.end() {
            let size = bus.read(header);
            let used = bus.read(header + 1) != 0;
            if !used && size >= want {
                // Split when the remainder can hold a header and at
                // least one payload slot.
                if size - want >= HEADER + 1 {
                    let rest = header + HEADER + want;
                    bus.write(rest, size - want - HEADER);
                    bus.write(rest + 1, 0);
                    bus.write(header, want);
                }
                bus.write(header + 1, 1);
                return header + HEADER;
            }
            header += HEADER + size;
        }
        0
    }

    /// Release an allocation.  The pointer must be a payload address of a
    /// currently used block; anything else is a [ErrorKind::Heap] error
    /// and leaves the heap untouched.
    pub fn free(&self, bus: &mut impl MemoryBus, ptr: i64) -> Result<(), Diagnostic> {
        let header = ptr - HEADER;
        if header < self.start || ptr >= self.end() {
            return Err(Diagnostic::new(
                ErrorKind::Heap,
                format!("free of address {ptr} which is outside the heap"),
            ));
        }
        if !self.is_block_header(bus, header) {
            return Err(Diagnostic::new(
                ErrorKind::Heap,
                format!("free of address {ptr} which is not an allocation"),
            ));
        }
        if bus.read(header + 1) == 0 {
            return Err(Diagnostic::new(
                ErrorKind::Heap,
                format!("double free of address {ptr}"),
            ));
        }
        bus.write(header + 1, 0);
        self.coalesce(bus);
        Ok(())
    }

    fn is_block_header(&self, bus: &impl MemoryBus, header: i64) -> bool {
        let mut cursor = self.start;
        while cursor < self.end() {
            if cursor == header {
                return true;
            }
            cursor += HEADER + bus.read(cursor);
        }
        false
    }

    /// Merge adjacent free blocks; a merge re-examines the same position
    /// so runs of three or more collapse in one pass.
    fn coalesce(&self, bus: &mut impl MemoryBus) {
        let mut header = self.start;
        loop {
            let size = bus.read(header);
            let next = header + HEADER + size;
            if next >= self.end() {
                break;
            }
            if bus.read(header + 1) == 0 && bus.read(next + 1) == 0 {
                bus.write(header, size + HEADER + bus.read(next));
            } else {
                header = next;
            }
        }
    }

    /// Walk all blocks as `(header-address, payload-size, used)` tuples.
    /// The walk is the heap's structural invariant; tests lean on it.
    pub fn blocks(&self, bus: &impl MemoryBus) -> Vec<(i64, i64, bool)> {
        let mut out = Vec::new();
        let mut header = self.start;
        while header < self.end() {
            let size = bus.read(header);
            out.push((header, size, bus.read(header + 1) != 0));
            header += HEADER + size;
        }
        out
    }

    /// Size of the largest free block.
    pub fn largest_free(&self, bus: &impl MemoryBus) -> i64 {
        self.blocks(bus)
            .iter()
            .filter(|(_, _, used)| !used)
            .map(|(_, size, _)| *size)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (HeapAllocator, Map<i64, i64>) {
        let heap = HeapAllocator::new(4096, 64);
        let mut memory = Map::new();
        heap.init(&mut memory);
        (heap, memory)
    }

    fn assert_walk_is_total(heap: &HeapAllocator, bus: &Map<i64, i64>) {
        let blocks = heap.blocks(bus);
        let mut cursor = heap.start();
        for (header, size, _) in &blocks {
            assert_eq!(*header, cursor);
            cursor += HEADER + size;
        }
        assert_eq!(cursor, heap.start() + 64, "walk must end exactly at the heap end");
    }

    #[test]
    fn init_is_one_free_block() {
        let (heap, memory) = fresh();
        assert_eq!(heap.blocks(&memory), vec![(4096, 62, false)]);
    }

    #[test]
    fn alloc_splits_and_returns_payload_addresses() {
        let (heap, mut memory) = fresh();
        let p = heap.alloc(&mut memory, 3);
        assert_eq!(p, 4098);
        let q = heap.alloc(&mut memory, 5);
        assert_eq!(q, 4103);
        assert_walk_is_total(&heap, &memory);
    }

    #[test]
    fn alloc_without_room_for_a_split_takes_the_whole_block() {
        let (heap, mut memory) = fresh();
        // 62 payload slots; asking for 60 leaves 2, not enough for a
        // header plus a slot, so no split happens
        let p = heap.alloc(&mut memory, 60);
        assert_eq!(p, 4098);
        assert_eq!(heap.blocks(&memory), vec![(4096, 62, true)]);
    }

    #[test]
    fn exhaustion_returns_zero_and_leaves_the_heap_alone() {
        let (heap, mut memory) = fresh();
        let before = heap.blocks(&memory);
        assert_eq!(heap.alloc(&mut memory, 100), 0);
        assert_eq!(heap.blocks(&memory), before);
    }

    #[test]
    fn free_coalesces_back_to_one_block() {
        let (heap, mut memory) = fresh();
        let p = heap.alloc(&mut memory, 3);
        let q = heap.alloc(&mut memory, 4);
        let r = heap.alloc(&mut memory, 5);
        heap.free(&mut memory, p).unwrap();
        heap.free(&mut memory, r).unwrap();
        heap.free(&mut memory, q).unwrap();
        assert_eq!(heap.largest_free(&memory), 62);
        assert_walk_is_total(&heap, &memory);
    }

    #[test]
    fn alloc_free_round_trip_restores_the_largest_block() {
        let (heap, mut memory) = fresh();
        let initial = heap.largest_free(&memory);
        let p = heap.alloc(&mut memory, 7);
        heap.free(&mut memory, p).unwrap();
        assert_eq!(heap.largest_free(&memory), initial);
    }

    #[test]
    fn free_of_null_is_an_error() {
        let (heap, mut memory) = fresh();
        let err = heap.free(&mut memory, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Heap);
    }

    #[test]
    fn free_of_an_interior_pointer_is_an_error() {
        let (heap, mut memory) = fresh();
        let p = heap.alloc(&mut memory, 4);
        let err = heap.free(&mut memory, p + 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Heap);
    }

    #[test]
    fn double_free_is_an_error() {
        let (heap, mut memory) = fresh();
        let p = heap.alloc(&mut memory, 4);
        heap.free(&mut memory, p).unwrap();
        let err = heap.free(&mut memory, p).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Heap);
        assert_walk_is_total(&heap, &memory);
    }
}
