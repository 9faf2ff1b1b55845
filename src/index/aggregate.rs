use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::backend::Backend;
use crate::chunk::ChunkTable;
use crate::error::Result;
use crate::record::IntervalRecord;
use crate::scan;

/// The aggregated read-side view of a container: the global interval map,
/// the chunk table its entries point into, and the two running aggregates
/// the scanner feeds.
///
/// Map invariants after every insert: keys equal their entry's
/// `logical_offset`, sized intervals are pairwise disjoint, and every
/// `chunk_id` indexes the chunk table.
#[derive(Default, Debug)]
pub struct Aggregate {
    map: BTreeMap<i64, IntervalRecord>,
    chunks: ChunkTable,
    eof: i64,
    backing_bytes: i64,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self) -> &BTreeMap<i64, IntervalRecord> {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut BTreeMap<i64, IntervalRecord> {
        &mut self.map
    }

    pub fn chunks(&self) -> &ChunkTable {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut ChunkTable {
        &mut self.chunks
    }

    pub fn eof(&self) -> i64 {
        self.eof
    }

    pub fn backing_bytes(&self) -> i64 {
        self.backing_bytes
    }

    pub(crate) fn set_aggregates(&mut self, eof: i64, backing_bytes: i64) {
        self.eof = eof;
        self.backing_bytes = backing_bytes;
    }

    /// Scans one index dropping and folds its records in.
    pub fn absorb_dropping(&mut self, bpath: &str, backend: &Arc<dyn Backend>) -> Result<()> {
        let out = scan::scan_dropping(bpath, backend, &mut self.chunks)?;
        self.eof = self.eof.max(out.eof);
        self.backing_bytes += out.backing_bytes;
        for rec in out.records {
            self.insert(rec);
        }
        Ok(())
    }

    /// Inserts one interval, resolving any overlap.
    ///
    /// Every logical point ends up owned by the newest record covering it
    /// (later end timestamp; ties to later begin, then higher writer id).
    /// Losers are clipped or split around the winner with their physical
    /// offsets shifted by the displacement, so the outcome depends only on
    /// the record multiset, never on arrival order.
    pub fn insert(&mut self, g: IntervalRecord) {
        use std::collections::btree_map::Entry;

        if g.length == 0 {
            // a marker shadowed by a covering sized entry is dropped, so the
            // predecessor of any position is never a marker inside an
            // interval (the reverse arrival order evicts it below)
            if let Some((_, e)) = self.map.range(..=g.logical_offset).next_back() {
                if e.length > 0
                    && e.logical_offset < g.logical_offset
                    && e.logical_tail() > g.logical_offset
                {
                    return;
                }
            }
            // otherwise markers hold a key only while nothing sized wants it
            match self.map.entry(g.logical_offset) {
                Entry::Vacant(v) => {
                    v.insert(g);
                }
                Entry::Occupied(mut o) => {
                    if o.get().length == 0 && g.newer_than(o.get()) {
                        o.insert(g);
                    }
                }
            }
            return;
        }

        let start = g.logical_offset;
        let end = g.logical_tail();

        // gather every entry whose interval or key collides with g
        let mut affected: Vec<IntervalRecord> = Vec::new();
        if let Some((_, e)) = self.map.range(..=start).next_back() {
            if e.logical_tail() > start || e.logical_offset == start {
                affected.push(*e);
            }
        }
        for (_, e) in self
            .map
            .range((Bound::Excluded(start), Bound::Excluded(end)))
        {
            affected.push(*e);
        }

        if affected.is_empty() {
            self.map.insert(start, g);
            return;
        }

        for e in &affected {
            self.map.remove(&e.logical_offset);
        }
        // zero-length markers under g are evicted outright
        let sized: Vec<IntervalRecord> = affected.into_iter().filter(|e| e.length > 0).collect();
        if sized.is_empty() {
            self.map.insert(start, g);
            return;
        }

        // cut at every boundary, hand each segment to the newest covering
        // record, then stitch adjacent segments that kept the same source
        let mut cuts: Vec<i64> = vec![start, end];
        for e in &sized {
            cuts.push(e.logical_offset);
            cuts.push(e.logical_tail());
        }
        cuts.sort_unstable();
        cuts.dedup();

        // (source, seg_start, seg_end); source 0 is g, i + 1 is sized[i]
        let mut winners: Vec<(usize, i64, i64)> = Vec::new();
        for w in cuts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let g_covers = a >= start && b <= end;
            let e_covers = sized
                .iter()
                .position(|e| e.logical_offset <= a && e.logical_tail() >= b);
            let src = match (g_covers, e_covers) {
                (true, Some(i)) => {
                    if g.newer_than(&sized[i]) {
                        0
                    } else {
                        i + 1
                    }
                }
                (true, None) => 0,
                (false, Some(i)) => i + 1,
                (false, None) => continue, // gap between disjoint neighbors
            };
            match winners.last_mut() {
                Some((prev, _, prev_end)) if *prev == src && *prev_end == a => *prev_end = b,
                _ => winners.push((src, a, b)),
            }
        }

        for (src, a, b) in winners {
            let frag = if src == 0 {
                g.slice(a, b)
            } else {
                sized[src - 1].slice(a, b)
            };
            // may overwrite a zero-length marker sitting on the key
            self.map.insert(frag.logical_offset, frag);
        }
    }

    /// Folds another aggregate in, re-interning its chunks and re-running
    /// overlap resolution on each entry. Folding partial aggregates in any
    /// grouping yields the same map; the deterministic tie-breaks in
    /// [`IntervalRecord::newer_than`] make the merge associative.
    pub fn merge(&mut self, other: Aggregate) {
        let mut remap = Vec::with_capacity(other.chunks.len());
        for entry in other.chunks.entries() {
            remap.push(self.chunks.intern_spec(
                entry.spec().to_string(),
                entry.bpath().to_string(),
                entry.backend().clone(),
            ));
        }
        for (_, mut rec) in other.map {
            rec.chunk_id = remap[rec.chunk_id as usize];
            self.insert(rec);
        }
        self.eof = self.eof.max(other.eof);
        self.backing_bytes += other.backing_bytes;
    }

    /// Drops the map, chunk table, and backing-bytes count. The EOF value is
    /// the caller's to keep; it outlives the aggregated view.
    pub fn clear(&mut self) {
        self.map.clear();
        self.chunks.clear();
        self.backing_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PosixBackend;
    use crate::chunk::ChunkTable;
    use itertools::Itertools;

    fn rec(offset: i64, len: u64, writer: u32, begin: f64, end: f64) -> IntervalRecord {
        IntervalRecord {
            logical_offset: offset,
            physical_offset: 0,
            length: len,
            begin_timestamp: begin,
            end_timestamp: end,
            chunk_id: writer,
            writer_id: writer,
        }
    }

    fn entries(agg: &Aggregate) -> Vec<(i64, i64, u32, i64)> {
        agg.map()
            .values()
            .map(|e| (e.logical_offset, e.logical_tail(), e.chunk_id, e.physical_offset))
            .collect()
    }

    fn assert_disjoint(agg: &Aggregate) {
        for (a, b) in agg.map().values().tuple_windows() {
            assert!(
                a.logical_tail() <= b.logical_offset,
                "overlapping entries: {a:?} vs {b:?}"
            );
        }
    }

    #[test]
    fn test_partial_overlap_later_wins() {
        let mut agg = Aggregate::new();
        agg.insert(rec(0, 100, 1, 1.0, 2.0));
        agg.insert(rec(50, 100, 2, 3.0, 4.0));

        assert_eq!(entries(&agg), vec![(0, 50, 1, 0), (50, 150, 2, 0)]);
        assert_disjoint(&agg);
    }

    #[test]
    fn test_partial_overlap_insertion_order_is_irrelevant() {
        let mut forward = Aggregate::new();
        forward.insert(rec(0, 100, 1, 1.0, 2.0));
        forward.insert(rec(50, 100, 2, 3.0, 4.0));

        let mut backward = Aggregate::new();
        backward.insert(rec(50, 100, 2, 3.0, 4.0));
        backward.insert(rec(0, 100, 1, 1.0, 2.0));

        assert_eq!(forward.map(), backward.map());
    }

    #[test]
    fn test_full_overwrite_discards_older() {
        let mut agg = Aggregate::new();
        agg.insert(rec(0, 100, 1, 1.0, 2.0));
        agg.insert(rec(0, 100, 2, 3.0, 4.0));
        assert_eq!(entries(&agg), vec![(0, 100, 2, 0)]);
    }

    #[test]
    fn test_contained_newer_splits_older() {
        let mut agg = Aggregate::new();
        agg.insert(rec(0, 100, 1, 1.0, 2.0));
        agg.insert(rec(40, 20, 2, 3.0, 4.0));

        assert_eq!(
            entries(&agg),
            vec![(0, 40, 1, 0), (40, 60, 2, 0), (60, 100, 1, 60)]
        );
        assert_disjoint(&agg);
    }

    #[test]
    fn test_contained_older_is_swallowed() {
        let mut agg = Aggregate::new();
        agg.insert(rec(40, 20, 1, 1.0, 2.0));
        agg.insert(rec(0, 100, 2, 3.0, 4.0));
        assert_eq!(entries(&agg), vec![(0, 100, 2, 0)]);
    }

    #[test]
    fn test_identical_start_clips_loser_tail() {
        let mut agg = Aggregate::new();
        agg.insert(rec(0, 100, 1, 1.0, 2.0));
        agg.insert(rec(0, 40, 2, 3.0, 4.0));
        // loser keeps its portion beyond the winner, physically shifted
        assert_eq!(entries(&agg), vec![(0, 40, 2, 0), (40, 100, 1, 40)]);
    }

    #[test]
    fn test_timestamp_ties_break_on_begin_then_writer() {
        let mut agg = Aggregate::new();
        agg.insert(rec(0, 10, 1, 1.0, 2.0));
        agg.insert(rec(0, 10, 2, 1.5, 2.0));
        assert_eq!(entries(&agg), vec![(0, 10, 2, 0)]);

        let mut agg = Aggregate::new();
        agg.insert(rec(0, 10, 5, 1.0, 2.0));
        agg.insert(rec(0, 10, 3, 1.0, 2.0));
        assert_eq!(entries(&agg), vec![(0, 10, 5, 0)]);
    }

    #[test]
    fn test_zero_length_records_are_inert_but_kept() {
        let mut agg = Aggregate::new();
        agg.insert(rec(10, 0, 1, 1.0, 2.0));
        assert_eq!(agg.map().len(), 1);

        // a sized record over the marker evicts it
        agg.insert(rec(0, 20, 2, 3.0, 4.0));
        assert_eq!(entries(&agg), vec![(0, 20, 2, 0)]);

        // a marker never displaces a sized record
        agg.insert(rec(0, 0, 3, 5.0, 6.0));
        assert_eq!(entries(&agg), vec![(0, 20, 2, 0)]);

        // a marker landing inside a sized interval is dropped either way
        // around, so lookups by predecessor always find the covering entry
        agg.insert(rec(10, 0, 4, 7.0, 8.0));
        assert_eq!(agg.map().len(), 1);

        let mut reversed = Aggregate::new();
        reversed.insert(rec(10, 0, 4, 7.0, 8.0));
        reversed.insert(rec(0, 20, 2, 3.0, 4.0));
        assert_eq!(reversed.map(), agg.map());
    }

    #[test]
    fn test_insertion_order_determinism_over_permutations() {
        let records = vec![
            rec(0, 100, 1, 1.0, 2.0),
            rec(50, 100, 2, 3.0, 4.0),
            rec(25, 10, 3, 2.0, 3.0),
            rec(120, 40, 4, 0.5, 1.0),
            rec(0, 10, 5, 4.0, 5.0),
        ];

        let mut reference: Option<BTreeMap<i64, IntervalRecord>> = None;
        for perm in records.iter().copied().permutations(records.len()) {
            let mut agg = Aggregate::new();
            for r in perm {
                agg.insert(r);
            }
            assert_disjoint(&agg);
            match &reference {
                None => reference = Some(agg.map().clone()),
                Some(want) => assert_eq!(agg.map(), want),
            }
        }
    }

    #[test]
    fn test_merge_remaps_chunk_ids() {
        let backend: Arc<dyn Backend> = Arc::new(PosixBackend);

        let mut left = Aggregate::new();
        let c0 = left.chunks_mut().intern(&backend, "/c/dropping.data.1.1.a.0");
        let mut r = rec(0, 50, 0, 1.0, 2.0);
        r.chunk_id = c0;
        left.insert(r);
        left.set_aggregates(50, 50);

        let mut right = Aggregate::new();
        let mut chunks = ChunkTable::new();
        let other_id = chunks.intern(&backend, "/c/dropping.data.1.1.b.0");
        assert_eq!(other_id, 0); // same local id, different dropping
        right.chunks = chunks;
        let mut r = rec(50, 50, 1, 3.0, 4.0);
        r.chunk_id = other_id;
        right.insert(r);
        right.set_aggregates(100, 50);

        left.merge(right);
        assert_eq!(left.chunks().len(), 2);
        assert_eq!(entries(&left), vec![(0, 50, 0, 0), (50, 100, 1, 0)]);
        assert_eq!(left.eof(), 100);
        assert_eq!(left.backing_bytes(), 100);
    }
}
