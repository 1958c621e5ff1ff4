//! Collection orchestration and heap sizing for a generational mark-compact
//! garbage collector.
//!
//! The heap is a set of mutable and immutable segments allocated downward
//! from their tops. A collection marks reachable words into per-space
//! bitmaps, compacts immutable survivors into the immutable region, fixes up
//! every moved pointer, and then resizes the regions so the allocation that
//! triggered the collection — plus a configured amount of slack — fits.
//!
//! This crate owns the *decisions*: minor versus full, grow versus shrink,
//! merge the survivors or re-collect them. The tracing, compaction, pointer
//! update and weak-reference sweeps are external engines consumed through
//! the traits in [`collector`]; they parallelize over the spaces via the
//! bounded worker pool in [`farm`].

mod collector;
mod farm;
mod policy;
mod space;
mod system;

pub use collector::{
    Collector, CollectorCreateInfo, CompactEngine, ConsistencyCheck, GcStats,
    InvariantChecker, MarkEngine, MemoryProbe, SysMemoryProbe, UpdateEngine,
    WeakSweepEngine,
};
pub use farm::{DEFAULT_QUEUE_DEPTH, GcTaskFarm, initialise_gc_workers};
pub use policy::{
    GROW_FLOOR_WORDS, GcConfig, GcDebugFlags, MAX_RECOLLECT_AGE,
    adjust_heap_size, area_still_full, expand_immutable_area,
    should_recollect_generation, try_expand_heap,
};
pub use space::{
    BITS_PER_WORD, Bitmap, LocalSpace, PermanentSpace, SegmentRegistry,
    SpaceId, SpaceKind, round_up_bitmap_units,
};
pub use system::{WORD_BYTES, physical_memory_bytes};
