//! Collection orchestration.
//!
//! The collector is invoked by the allocator once an allocation cannot be
//! satisfied, with every mutator stopped. It sequences the external mark,
//! weak-sweep, compact and update engines over the heap spaces, applies the
//! sizing policy, and decides whether the survivors of this collection merge
//! into the old generation or stay "new" for another round.
//!
//! This module never looks inside objects. The engines are consumed through
//! narrow traits and are assumed correct; the accounting identities they
//! must satisfy are asserted between phases.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::farm::GcTaskFarm;
use crate::policy::{
    GcConfig, adjust_heap_size, area_still_full, expand_immutable_area,
    should_recollect_generation,
};
use crate::space::{SegmentRegistry, SpaceKind};
use crate::system::{WORD_BYTES, physical_memory_bytes};

// ── Engine interfaces ─────────────────────────────────────────────────

/// Object-graph tracer. Sets mark bits from the roots and fills in
/// `i_marked`/`m_marked` for every local space. On a minor collection only
/// the `[gen_bottom, gen_top)` window of each space is followed.
pub trait MarkEngine {
    fn mark(&mut self, registry: &mut SegmentRegistry, full: bool, farm: &GcTaskFarm);
}

/// Weak-reference liveness sweep; clears dead weak targets using the bitmap
/// the mark engine just built.
pub trait WeakSweepEngine {
    fn sweep_weak(&mut self, registry: &mut SegmentRegistry);
}

/// Relocator. Moves marked immutable data into immutable spaces, writes
/// tombstones, fills in `copied`, and returns the count of immutable words
/// that had to stay behind in mutable spaces.
pub trait CompactEngine {
    fn compact(&mut self, registry: &mut SegmentRegistry, farm: &GcTaskFarm) -> usize;
}

/// Pointer fixup. Rewrites every reference through the tombstones and fills
/// in `updated` for every space.
pub trait UpdateEngine {
    fn update(&mut self, registry: &mut SegmentRegistry, farm: &GcTaskFarm);
}

/// Diagnostic heap validation, run once per episode. Its findings do not
/// steer control flow; a violation is an engine defect and should abort.
pub trait ConsistencyCheck {
    fn check(&mut self, registry: &SegmentRegistry);
}

/// Source for the machine's physical memory size. `None` means unknown.
pub trait MemoryProbe {
    fn physical_memory(&self) -> Option<u64>;
}

/// Default probe backed by sysconf.
#[derive(Debug, Default)]
pub struct SysMemoryProbe;

impl MemoryProbe for SysMemoryProbe {
    fn physical_memory(&self) -> Option<u64> {
        physical_memory_bytes()
    }
}

/// Default consistency check: generation ordering for every space.
#[derive(Debug, Default)]
pub struct InvariantChecker;

impl ConsistencyCheck for InvariantChecker {
    fn check(&mut self, registry: &SegmentRegistry) {
        for space in registry.local_spaces() {
            assert!(space.bottom <= space.pointer);
            assert!(space.pointer <= space.gen_top);
            assert!(space.gen_top <= space.top);
        }
    }
}

// ── Collector ─────────────────────────────────────────────────────────

/// Lifetime counters, readable between collections.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Mark/compact/update episodes run, including internal retries.
    pub episodes: u64,
    pub minor_collections: u64,
    pub full_collections: u64,
    /// Episodes that re-entered immediately instead of returning.
    pub retries: u64,
    /// Collections that ended in unrecoverable exhaustion.
    pub failures: u64,
}

/// Everything a collector needs at construction time.
pub struct CollectorCreateInfo {
    pub config: GcConfig,
    pub registry: SegmentRegistry,
    pub mark: Box<dyn MarkEngine>,
    pub weak: Box<dyn WeakSweepEngine>,
    pub compact: Box<dyn CompactEngine>,
    pub update: Box<dyn UpdateEngine>,
    pub checker: Box<dyn ConsistencyCheck>,
    pub probe: Box<dyn MemoryProbe>,
    pub farm: Arc<GcTaskFarm>,
}

/// The collection orchestrator for one heap instance.
///
/// Holds the policy state that survives between collections: the age of the
/// current generation and whether a recovery full collection has been
/// scheduled. One collector serves one heap; nothing here is process-global.
pub struct Collector {
    config: GcConfig,
    registry: SegmentRegistry,
    mark: Box<dyn MarkEngine>,
    weak: Box<dyn WeakSweepEngine>,
    compact: Box<dyn CompactEngine>,
    update: Box<dyn UpdateEngine>,
    checker: Box<dyn ConsistencyCheck>,
    probe: Box<dyn MemoryProbe>,
    farm: Arc<GcTaskFarm>,
    /// Consecutive collections that kept their survivors "new".
    this_generation: u32,
    /// Recovery action carried to the next invocation.
    do_full_gc_next_time: bool,
    stats: GcStats,
}

impl Collector {
    pub fn new(info: CollectorCreateInfo) -> Self {
        info.config.validate().expect("invalid GC configuration");
        Self {
            config: info.config,
            registry: info.registry,
            mark: info.mark,
            weak: info.weak,
            compact: info.compact,
            update: info.update,
            checker: info.checker,
            probe: info.probe,
            farm: info.farm,
            this_generation: 0,
            do_full_gc_next_time: false,
            stats: GcStats::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SegmentRegistry {
        &mut self.registry
    }

    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Is a full collection already scheduled for the next invocation?
    #[must_use]
    pub fn full_collection_scheduled(&self) -> bool {
        self.do_full_gc_next_time
    }

    /// Run one collection. `words_required_to_allocate` is the allocation
    /// the mutator could not satisfy; on return `true` at least one mutable
    /// space can hold it. `false` means the heap is exhausted even after
    /// escalating to a full collection, and the runtime should treat the
    /// triggering allocation as failed.
    ///
    /// The caller must have stopped every mutator thread and must serialize
    /// invocations; the calling thread is blocked for the duration.
    pub fn run_collection(
        &mut self,
        require_full: bool,
        words_required_to_allocate: usize,
    ) -> bool {
        let mut do_full = require_full;
        let started = Instant::now();

        // A completed episode that still cannot satisfy the request
        // re-enters here instead of returning.
        loop {
            self.stats.episodes += 1;

            // Entry invariant: clean bitmaps, ordered generation bounds.
            for space in self.registry.local_spaces_mut() {
                assert!(space.top >= space.gen_top);
                assert!(space.gen_top >= space.pointer);
                assert!(space.pointer >= space.bottom);
                // Low-water mark of this episode, before anything moves.
                space.gen_bottom = space.pointer;
                space.reset_weak_bounds();
                space.reset_phase_counters();
            }
            for space in self.registry.permanent_spaces_mut() {
                space.reset_weak_bounds();
            }

            // A previous collection may have demanded a full one now.
            if self.do_full_gc_next_time {
                do_full = true;
                self.do_full_gc_next_time = false;
            }

            if do_full {
                // Collect everything, not just the newest generation.
                for space in self.registry.local_spaces_mut() {
                    space.gen_top = space.top;
                }
            }

            debug!(
                "{} collection, {} words requested",
                if do_full { "full" } else { "minor" },
                words_required_to_allocate
            );

            self.mark.mark(&mut self.registry, do_full, &self.farm);

            self.weak.sweep_weak(&mut self.registry);

            // Expand the immutable region before compaction so there is
            // room to move the immutable survivors out of the mutable
            // spaces. The mutable region is resized afterwards, when its
            // exact need is known.
            if do_full {
                let immutable_data = self
                    .registry
                    .local_spaces()
                    .map(|space| space.i_marked)
                    .sum();
                expand_immutable_area(
                    &mut self.registry,
                    &self.config,
                    immutable_data,
                );
            }

            let immutable_overflow =
                self.compact.compact(&mut self.registry, &self.farm);
            self.verify_compaction();

            self.update.update(&mut self.registry, &self.farm);
            self.verify_update(immutable_overflow);

            // At most the first (gen_top - bottom) bits of each bitmap can
            // be dirty; clearing that range restores the exit invariant.
            for space in self.registry.local_spaces_mut() {
                let dirty = space.gen_top - space.bottom;
                space.bitmap.clear_bits(space.bottom, dirty);
            }

            if do_full {
                // Overflowed immutable words count toward the immutable
                // region's requirement.
                adjust_heap_size(
                    &mut self.registry,
                    &self.config,
                    SpaceKind::Immutable,
                    immutable_overflow,
                );
                let i_full = area_still_full(
                    &self.registry,
                    &self.config,
                    SpaceKind::Immutable,
                    immutable_overflow,
                    do_full,
                );
                let m_full = area_still_full(
                    &self.registry,
                    &self.config,
                    SpaceKind::Mutable,
                    words_required_to_allocate,
                    do_full,
                );
                // If the next collection is going to target this same
                // generation anyway, leave the mutable sizing to it.
                if i_full
                    || !m_full
                    || !should_recollect_generation(
                        &self.registry,
                        self.this_generation,
                    )
                {
                    adjust_heap_size(
                        &mut self.registry,
                        &self.config,
                        SpaceKind::Mutable,
                        words_required_to_allocate,
                    );
                }
            }

            self.checker.check(&self.registry);

            // Did this episode clear enough space?
            let i_full = area_still_full(
                &self.registry,
                &self.config,
                SpaceKind::Immutable,
                immutable_overflow,
                do_full,
            );
            let m_full = area_still_full(
                &self.registry,
                &self.config,
                SpaceKind::Mutable,
                words_required_to_allocate,
                do_full,
            );
            if i_full || m_full {
                if !i_full
                    && should_recollect_generation(
                        &self.registry,
                        self.this_generation,
                    )
                {
                    // The next collection re-collects this generation;
                    // that should recover enough on its own.
                } else if !do_full {
                    self.do_full_gc_next_time = true;
                } else if area_still_full(
                    &self.registry,
                    &self.config,
                    SpaceKind::Immutable,
                    0,
                    false,
                ) || area_still_full(
                    &self.registry,
                    &self.config,
                    SpaceKind::Mutable,
                    words_required_to_allocate,
                    false,
                ) {
                    // A full collection fell short even of the minor
                    // thresholds: no forward progress is possible.
                    warn!(
                        "heap exhausted after {:?}, {} words still unavailable",
                        started.elapsed(),
                        words_required_to_allocate
                    );
                    self.stats.failures += 1;
                    return false;
                }
            }

            if should_recollect_generation(&self.registry, self.this_generation)
            {
                // Significant holes are left, so don't merge: keep the
                // survivors "new" and target them again next time. After a
                // full collection the follow-up must be full as well,
                // otherwise the still-new immutables would all be marked
                // again anyway.
                self.do_full_gc_next_time |= do_full;
                self.this_generation += 1;
            } else {
                // Merge this generation with the old one.
                for space in self.registry.local_spaces_mut() {
                    space.gen_top = space.pointer;
                }
                self.this_generation = 0;
            }

            // Room for the allocation that triggered the collection?
            let have_space = self.registry.local_spaces().any(|space| {
                space.kind == SpaceKind::Mutable
                    && space.free_words() >= words_required_to_allocate
            });
            if !have_space {
                self.stats.retries += 1;
                continue;
            }

            // If a full collection is already scheduled and the heap sits
            // close to physical memory, run it now; waiting would only pile
            // more data into the mutable region first.
            if self.do_full_gc_next_time {
                if let Some(load) = self.heap_load_percent() {
                    if load > self.config.heap_load_escalate_percent {
                        debug!("heap load {load}%, collecting again now");
                        self.stats.retries += 1;
                        continue;
                    }
                }
            }

            if do_full {
                self.stats.full_collections += 1;
            } else {
                self.stats.minor_collections += 1;
            }
            debug!("collection completed in {:?}", started.elapsed());
            return true;
        }
    }

    /// Post-compaction accounting: mutable data never moves, and no more
    /// immutable words may arrive in immutable spaces than were marked.
    fn verify_compaction(&self) {
        let mut m_copied = 0usize;
        let mut i_copied = 0usize;
        let mut i_marked = 0usize;
        for space in self.registry.local_spaces() {
            match space.kind {
                SpaceKind::Mutable => m_copied += space.copied,
                SpaceKind::Immutable => {
                    i_copied += space.copied;
                    i_marked += space.i_marked;
                }
            }
            assert!(
                space.bottom <= space.pointer && space.pointer <= space.gen_top,
                "compaction moved an allocation frontier out of range"
            );
        }
        assert_eq!(m_copied, 0, "compaction relocated mutable data");
        assert!(i_copied <= i_marked, "copied more immutable words than marked");
    }

    /// Post-update accounting: every marked word is visited exactly once,
    /// with overflowed immutable words counted as still mutable-resident.
    fn verify_update(&self, immutable_overflow: usize) {
        let mut i_updated = 0usize;
        let mut m_updated = 0usize;
        let mut i_marked = 0usize;
        let mut m_marked = 0usize;
        for space in self.registry.local_spaces() {
            i_marked += space.i_marked;
            m_marked += space.m_marked;
            match space.kind {
                SpaceKind::Mutable => m_updated += space.updated,
                SpaceKind::Immutable => i_updated += space.updated,
            }
        }
        assert!(i_marked >= immutable_overflow, "overflow exceeds marked words");
        assert_eq!(
            i_updated,
            i_marked - immutable_overflow,
            "immutable update count off"
        );
        assert_eq!(
            m_updated,
            m_marked + immutable_overflow,
            "mutable update count off"
        );
    }

    /// Resident heap as a percentage of physical memory. `None` when the
    /// machine size is unknown or beyond the address space; the pressure
    /// check is skipped in that case.
    fn heap_load_percent(&self) -> Option<usize> {
        let bytes = self.probe.physical_memory()?;
        let mem_words = usize::try_from(bytes / WORD_BYTES as u64).ok()?;
        if mem_words == 0 {
            return None;
        }

        let mut used = 0usize;
        for space in self.registry.permanent_spaces() {
            used += space.size_words();
        }
        for space in self.registry.local_spaces() {
            // Mutable capacity counts whole, it is all allocation-bound;
            // immutable spaces count only the occupied part.
            used += match space.kind {
                SpaceKind::Mutable => space.size_words(),
                SpaceKind::Immutable => space.top - space.pointer,
            };
        }

        // A crude estimate: the C heap, the executable and the bitmaps are
        // all left out.
        if mem_words < 100 {
            Some(100)
        } else {
            Some(used / (mem_words / 100))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
