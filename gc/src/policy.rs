//! Heap-sizing policy and the collection predicates.
//!
//! Everything here is driven by word counts the engines left behind in the
//! spaces: how much to grow or shrink each region after a full collection,
//! whether a region still lacks the space a pending allocation needs, and
//! whether the survivors of this collection are ready to be treated as old
//! data.

use log::trace;

use bitflags::bitflags;

use crate::space::{SegmentRegistry, SpaceKind, round_up_bitmap_units};

/// Below this request size there is no point retrying a failed growth.
pub const GROW_FLOOR_WORDS: usize = 64 * 1024;

/// A generation older than this is always merged, however poor the update
/// ratio looked.
pub const MAX_RECOLLECT_AGE: u32 = 3;

bitflags! {
    /// Diagnostic switches for the sizing policy.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct GcDebugFlags: u8 {
        /// Never request new heap segments.
        const NO_HEAP_GROWTH = 1 << 0;
        /// Never delete empty heap segments.
        const NO_HEAP_SHRINK = 1 << 1;
    }
}

/// Collector tuning, all word counts unless noted.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Unit size for new mutable segments.
    pub mutable_segment_words: usize,
    /// Unit size for new immutable segments.
    pub immutable_segment_words: usize,
    /// Free space the mutable region should end a full collection with.
    pub mutable_full_slack: usize,
    /// Free space the immutable region should end a full collection with.
    pub immutable_full_slack: usize,
    /// Minimum acceptable mutable free space after a minor collection.
    pub mutable_minor_slack: usize,
    /// Minimum acceptable immutable free space after a minor collection.
    pub immutable_minor_slack: usize,
    pub debug: GcDebugFlags,
    /// One extra segment is requested per this many existing segments of a
    /// kind when growing. Tuning guess inherited from long use; there is no
    /// derived "right" value.
    pub space_factor: usize,
    /// Heap load percentage beyond which an already-scheduled full
    /// collection runs immediately instead of waiting for the next
    /// allocation failure.
    pub heap_load_escalate_percent: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mutable_segment_words: 1 << 20,   // 8 MB on 64-bit
            immutable_segment_words: 1 << 20, // 8 MB on 64-bit
            mutable_full_slack: 1 << 22,
            immutable_full_slack: 1 << 21,
            mutable_minor_slack: 1 << 18,
            immutable_minor_slack: 1 << 17,
            debug: GcDebugFlags::empty(),
            space_factor: 3,
            heap_load_escalate_percent: 80,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.mutable_segment_words == 0 || self.immutable_segment_words == 0
        {
            return Err("segment sizes must be > 0");
        }
        if self.space_factor == 0 {
            return Err("space_factor must be > 0");
        }
        if self.heap_load_escalate_percent > 100 {
            return Err("heap_load_escalate_percent must be <= 100");
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn segment_words(&self, kind: SpaceKind) -> usize {
        match kind {
            SpaceKind::Mutable => self.mutable_segment_words,
            SpaceKind::Immutable => self.immutable_segment_words,
        }
    }

    #[inline]
    #[must_use]
    pub fn full_slack(&self, kind: SpaceKind) -> usize {
        match kind {
            SpaceKind::Mutable => self.mutable_full_slack,
            SpaceKind::Immutable => self.immutable_full_slack,
        }
    }

    #[inline]
    #[must_use]
    pub fn minor_slack(&self, kind: SpaceKind) -> usize {
        match kind {
            SpaceKind::Mutable => self.mutable_minor_slack,
            SpaceKind::Immutable => self.immutable_minor_slack,
        }
    }
}

// ── Growth ────────────────────────────────────────────────────────────

/// Try to obtain another heap segment of `words`. On refusal the request is
/// halved and retried until it falls to the floor, then given up silently;
/// the collection carries on with whatever space exists.
pub fn try_expand_heap(
    registry: &mut SegmentRegistry,
    config: &GcConfig,
    mut words: usize,
    kind: SpaceKind,
) -> bool {
    if config.debug.contains(GcDebugFlags::NO_HEAP_GROWTH) {
        return false;
    }
    loop {
        if registry.new_local_space(words, kind).is_some() {
            trace!("grew {kind:?} region by {words} words");
            return true;
        }
        words /= 2;
        if words <= GROW_FLOOR_WORDS {
            return false;
        }
    }
}

/// Expand the immutable region before compaction of a full collection, so
/// the compactor has room to move `words_needed` marked immutable words out
/// of the mutable spaces.
pub fn expand_immutable_area(
    registry: &mut SegmentRegistry,
    config: &GcConfig,
    words_needed: usize,
) {
    let current_size = registry.capacity_words(SpaceKind::Immutable);
    let n_spaces = registry.space_count(SpaceKind::Immutable);

    if config.immutable_full_slack + words_needed > current_size {
        let segment = config.immutable_segment_words;
        let mut growth =
            config.immutable_full_slack + words_needed - current_size;
        if growth < segment {
            growth = segment;
        }
        // Grow in bigger increments once several segments exist already,
        // otherwise the region ends up as a trail of small fragments.
        growth += (n_spaces / config.space_factor) * segment;

        let words = round_up_bitmap_units(growth);
        let _ = try_expand_heap(registry, config, words, SpaceKind::Immutable);
    }
}

/// Resize one region after a full collection so that a full segment's worth
/// of free space (the configured slack plus the triggering request) is
/// available — growing when short, releasing empty segments when over.
pub fn adjust_heap_size(
    registry: &mut SegmentRegistry,
    config: &GcConfig,
    kind: SpaceKind,
    words_required: usize,
) {
    let currently_free = registry.free_words(kind);
    let largest_free = registry.largest_free_span(kind);
    let n_spaces = registry.space_count(kind);

    let required_free = words_required + config.full_slack(kind);

    // A very large request (a new stack segment, say) must fit in a single
    // mutable space; overall free space is not enough on its own.
    if required_free > currently_free
        || (kind == SpaceKind::Mutable && largest_free < words_required)
    {
        let segment = config.segment_words(kind);
        let mut growth = required_free.saturating_sub(currently_free);
        if growth < segment {
            growth = segment;
        }
        growth += (n_spaces / config.space_factor) * segment;
        if growth < words_required {
            growth = words_required;
        }

        let words = round_up_bitmap_units(growth);
        trace!("{kind:?} region short {words} words after full collection");
        let _ = try_expand_heap(registry, config, words, kind);
    } else if !config.debug.contains(GcDebugFlags::NO_HEAP_SHRINK) {
        // Give memory back: delete completely empty segments, newest first,
        // as long as doing so keeps the configured slack intact.
        let mut budget = currently_free - required_free;
        let doomed: Vec<_> = registry
            .spaces_of_kind(kind)
            .rev()
            .filter(|space| {
                if space.is_empty() && space.size_words() <= budget {
                    budget -= space.size_words();
                    true
                } else {
                    false
                }
            })
            .map(|space| space.id)
            .collect();
        for id in doomed {
            let words = registry.delete_local_space(id);
            trace!("released empty {kind:?} segment of {words} words");
        }
    }
}

// ── Fullness ──────────────────────────────────────────────────────────

/// Does the region still lack space after a collection?
///
/// For the mutable region `words_needed` is the allocation that triggered
/// the collection and must fit inside a single space. For the immutable
/// region it is overflow that merely has to exist somewhere, so it is folded
/// into the aggregate free-space requirement.
#[must_use]
pub fn area_still_full(
    registry: &SegmentRegistry,
    config: &GcConfig,
    kind: SpaceKind,
    mut words_needed: usize,
    full_gc: bool,
) -> bool {
    let mut required_free = if full_gc {
        config.full_slack(kind)
    } else {
        config.minor_slack(kind)
    };
    if kind == SpaceKind::Immutable {
        required_free += words_needed;
        words_needed = 0;
    }

    for space in registry.spaces_of_kind(kind) {
        let mut free = space.free_words();
        if free >= words_needed {
            free -= words_needed;
            words_needed = 0;
        }
        if free >= required_free {
            required_free = 0;
        } else {
            required_free -= free;
        }
    }
    words_needed != 0 || required_free != 0
}

// ── Generation retention ──────────────────────────────────────────────

/// Should the next collection target this same generation again, instead of
/// merging its survivors into the old data?
///
/// A low update ratio means the compaction left large unmoved stretches in
/// the current generation — typically a big object with no hole to move
/// into. Merging now would freeze that layout as "old"; keeping the
/// survivors "new" lets the next collection retry once more space exists.
#[must_use]
pub fn should_recollect_generation(
    registry: &SegmentRegistry,
    generation_age: u32,
) -> bool {
    if generation_age > MAX_RECOLLECT_AGE {
        return false;
    }

    let mut total = 0usize;
    let mut updated = 0usize;
    for space in registry.local_spaces() {
        total += space.gen_top - space.pointer;
        updated += space.updated;
    }
    if total == 0 {
        return false;
    }
    updated * 2 < total
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{BITS_PER_WORD, SpaceId};

    fn small_config() -> GcConfig {
        GcConfig {
            mutable_segment_words: 4_096,
            immutable_segment_words: 4_096,
            mutable_full_slack: 2_000,
            immutable_full_slack: 2_000,
            mutable_minor_slack: 1_000,
            immutable_minor_slack: 1_000,
            ..GcConfig::default()
        }
    }

    fn fill(registry: &mut SegmentRegistry, id: SpaceId, words: usize) {
        registry
            .space_mut(id)
            .expect("space exists")
            .allocate(words)
            .expect("space has room");
    }

    #[test]
    fn expand_heap_halves_until_it_fits() {
        let mut registry = SegmentRegistry::with_limit(100_000);
        let config = small_config();

        // 150_000 words fail against the budget; the halved 75_000 is
        // still above the floor and is granted.
        assert!(try_expand_heap(
            &mut registry,
            &config,
            150_000,
            SpaceKind::Mutable
        ));
        assert_eq!(registry.allocated_words(), 75_000);
    }

    #[test]
    fn expand_heap_gives_up_below_the_floor() {
        let mut registry = SegmentRegistry::with_limit(10_000);
        let config = small_config();

        // Halving 1_000_000 reaches 62_500 < 64 K before anything fits.
        assert!(!try_expand_heap(
            &mut registry,
            &config,
            1_000_000,
            SpaceKind::Mutable
        ));
        assert_eq!(registry.allocated_words(), 0);
        assert_eq!(registry.space_count(SpaceKind::Mutable), 0);
    }

    #[test]
    fn expand_heap_respects_no_growth_flag() {
        let mut registry = SegmentRegistry::new();
        let config = GcConfig {
            debug: GcDebugFlags::NO_HEAP_GROWTH,
            ..small_config()
        };
        assert!(!try_expand_heap(
            &mut registry,
            &config,
            128,
            SpaceKind::Mutable
        ));
    }

    #[test]
    fn immutable_expansion_rounds_and_inflates() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();
        for _ in 0..3 {
            registry
                .new_local_space(4_096, SpaceKind::Immutable)
                .expect("seed segment");
        }

        // Capacity 12_288, need slack 2_000 + 40_000 marked: shortfall
        // 29_712, plus one extra segment for the three existing ones.
        expand_immutable_area(&mut registry, &config, 40_000);

        assert_eq!(registry.space_count(SpaceKind::Immutable), 4);
        let grown = registry
            .spaces_of_kind(SpaceKind::Immutable)
            .next_back()
            .expect("grown segment");
        assert_eq!(grown.size_words() % BITS_PER_WORD, 0);
        assert!(grown.size_words() >= 29_712 + 4_096);
    }

    #[test]
    fn immutable_expansion_skips_when_capacity_suffices() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();
        registry
            .new_local_space(65_536, SpaceKind::Immutable)
            .expect("seed segment");
        expand_immutable_area(&mut registry, &config, 1_000);
        assert_eq!(registry.space_count(SpaceKind::Immutable), 1);
    }

    #[test]
    fn adjust_grows_when_no_single_space_fits() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();
        // Plenty of aggregate free space, but split over small spaces.
        registry.new_local_space(3_000, SpaceKind::Mutable).unwrap();
        registry.new_local_space(3_000, SpaceKind::Mutable).unwrap();

        adjust_heap_size(&mut registry, &config, SpaceKind::Mutable, 5_000);

        assert!(
            registry.largest_free_span(SpaceKind::Mutable) >= 5_000,
            "growth must make the triggering allocation fit a single space"
        );
    }

    #[test]
    fn adjust_growth_request_is_bitmap_aligned_and_covers_request() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();

        adjust_heap_size(&mut registry, &config, SpaceKind::Mutable, 50_000);

        let space = registry
            .spaces_of_kind(SpaceKind::Mutable)
            .next()
            .expect("grown segment");
        assert_eq!(space.size_words() % BITS_PER_WORD, 0);
        assert!(space.size_words() >= 50_000);
    }

    #[test]
    fn adjust_shrinks_newest_empty_segments_first() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();
        let oldest = registry.new_local_space(4_096, SpaceKind::Mutable).unwrap();
        let used = registry.new_local_space(4_096, SpaceKind::Mutable).unwrap();
        let newest = registry.new_local_space(4_096, SpaceKind::Mutable).unwrap();
        fill(&mut registry, used, 100);

        // Free 4_096 + 3_996 + 4_096, target 0 + 2_000: the 10_188-word
        // budget covers both empty segments; the occupied one must stay.
        adjust_heap_size(&mut registry, &config, SpaceKind::Mutable, 0);

        assert!(registry.space(newest).is_none(), "newest empty segment released");
        assert!(registry.space(oldest).is_none(), "older empty segment also fits the budget");
        assert!(registry.space(used).is_some(), "occupied segment must never be deleted");
    }

    #[test]
    fn adjust_shrink_keeps_the_slack() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();
        registry.new_local_space(4_096, SpaceKind::Mutable).unwrap();
        registry.new_local_space(4_096, SpaceKind::Mutable).unwrap();

        // Target 3_000 + 2_000 leaves a 3_192-word budget: neither 4_096-word
        // segment fits it, so nothing may be released.
        adjust_heap_size(&mut registry, &config, SpaceKind::Mutable, 3_000);

        assert_eq!(registry.space_count(SpaceKind::Mutable), 2);
        assert!(registry.free_words(SpaceKind::Mutable) >= 3_000);
    }

    #[test]
    fn adjust_shrink_respects_disable_flag() {
        let mut registry = SegmentRegistry::new();
        let config = GcConfig {
            debug: GcDebugFlags::NO_HEAP_SHRINK,
            ..small_config()
        };
        registry.new_local_space(65_536, SpaceKind::Mutable).unwrap();
        registry.new_local_space(65_536, SpaceKind::Mutable).unwrap();

        adjust_heap_size(&mut registry, &config, SpaceKind::Mutable, 0);

        assert_eq!(registry.space_count(SpaceKind::Mutable), 2);
    }

    #[test]
    fn mutable_fullness_requires_a_single_fitting_space() {
        let mut registry = SegmentRegistry::new();
        let config = small_config();
        registry.new_local_space(500, SpaceKind::Mutable).unwrap();
        registry.new_local_space(600, SpaceKind::Mutable).unwrap();

        // 550 words fit neither space after minor slack is accounted, but
        // the second space alone satisfies the allocation itself.
        assert!(area_still_full(&registry, &config, SpaceKind::Mutable, 550, false));

        // With no slack requirement the 600-word space satisfies it.
        let relaxed = GcConfig {
            mutable_minor_slack: 0,
            ..config
        };
        assert!(!area_still_full(&registry, &relaxed, SpaceKind::Mutable, 550, false));

        // 700 words fit no single space even though 1_100 are free overall.
        assert!(area_still_full(&registry, &relaxed, SpaceKind::Mutable, 700, false));
    }

    #[test]
    fn immutable_fullness_is_aggregate() {
        let mut registry = SegmentRegistry::new();
        let config = GcConfig {
            immutable_minor_slack: 100,
            ..small_config()
        };
        registry.new_local_space(500, SpaceKind::Immutable).unwrap();
        registry.new_local_space(600, SpaceKind::Immutable).unwrap();

        // 900 overflow words + 100 slack spread across both spaces.
        assert!(!area_still_full(&registry, &config, SpaceKind::Immutable, 900, false));
        // 1_100 words cannot be covered by 1_100 free minus the slack.
        assert!(area_still_full(&registry, &config, SpaceKind::Immutable, 1_100, false));
    }

    #[test]
    fn empty_region_is_full_when_slack_demanded() {
        let registry = SegmentRegistry::new();
        let config = small_config();
        assert!(area_still_full(&registry, &config, SpaceKind::Immutable, 0, true));
        let none_needed = GcConfig {
            immutable_minor_slack: 0,
            ..config
        };
        assert!(!area_still_full(
            &registry,
            &none_needed,
            SpaceKind::Immutable,
            0,
            false
        ));
    }

    #[test]
    fn recollect_stops_at_the_age_cap() {
        let mut registry = SegmentRegistry::new();
        let id = registry.new_local_space(10_000, SpaceKind::Mutable).unwrap();
        fill(&mut registry, id, 4_000);
        // Nothing updated at all: strongest possible recollect signal.
        assert!(should_recollect_generation(&registry, 0));
        assert!(should_recollect_generation(&registry, MAX_RECOLLECT_AGE));
        assert!(!should_recollect_generation(&registry, MAX_RECOLLECT_AGE + 1));
    }

    #[test]
    fn recollect_needs_a_generation_to_decide_about() {
        let mut registry = SegmentRegistry::new();
        registry.new_local_space(10_000, SpaceKind::Mutable).unwrap();
        assert!(!should_recollect_generation(&registry, 0));
    }

    #[test]
    fn recollect_follows_the_update_ratio() {
        let mut registry = SegmentRegistry::new();
        let id = registry.new_local_space(10_000, SpaceKind::Mutable).unwrap();
        fill(&mut registry, id, 4_000);

        registry.space_mut(id).unwrap().updated = 2_000;
        assert!(!should_recollect_generation(&registry, 0), "exactly half updated merges");

        registry.space_mut(id).unwrap().updated = 1_999;
        assert!(should_recollect_generation(&registry, 0), "under half updated recollects");
    }
}
