use std::collections::BTreeMap;
use std::ops::Bound;

use crate::errstate;
use crate::error::Result;
use crate::record::IntervalRecord;

/// One physical read instruction.
///
/// `hole` marks a region no record covers; the reader must return zeros for
/// it, and `chunk_id`/`physical_offset` are meaningless there.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReadSlice {
    pub chunk_id: u32,
    pub physical_offset: i64,
    pub length: u64,
    pub hole: bool,
}

impl ReadSlice {
    pub fn hole(length: u64) -> Self {
        ReadSlice {
            chunk_id: 0,
            physical_offset: 0,
            length,
            hole: true,
        }
    }
}

/// Resolves logical `[offset, offset + length)` into an ordered list of
/// read instructions.
///
/// Covered segments come out of the map; gaps between entries become holes.
/// Past the last entry the trailing hole runs to `offset + length` or to
/// `eof`, whichever comes first, so reads never fabricate bytes beyond the
/// tracked end of file.
pub fn query(
    map: &BTreeMap<i64, IntervalRecord>,
    eof: i64,
    offset: i64,
    length: u64,
) -> Result<Vec<ReadSlice>> {
    if length == 0 {
        return Err(errstate!("query length must be positive"));
    }
    if offset < 0 {
        return Err(errstate!("query offset must be non-negative, got {offset}"));
    }
    let end = offset + length as i64;
    let mut out = Vec::new();
    let mut pos = offset;

    // the entry containing `offset`, if any, then everything starting inside
    // the range; zero-length markers never cover anything
    let containing = map
        .range(..=pos)
        .next_back()
        .map(|(_, e)| *e)
        .filter(|e| e.length > 0 && e.logical_tail() > pos);
    let rest = map
        .range((Bound::Excluded(pos), Bound::Excluded(end)))
        .map(|(_, e)| *e);

    for e in containing.into_iter().chain(rest) {
        if e.length == 0 {
            continue;
        }
        if pos >= end {
            break;
        }
        if e.logical_offset > pos {
            out.push(ReadSlice::hole((e.logical_offset - pos) as u64));
            pos = e.logical_offset;
        }
        let seg_end = e.logical_tail().min(end);
        out.push(ReadSlice {
            chunk_id: e.chunk_id,
            physical_offset: e.physical_offset + (pos - e.logical_offset),
            length: (seg_end - pos) as u64,
            hole: false,
        });
        pos = seg_end;
    }

    if pos < end {
        let cap = end.min(eof.max(pos));
        if cap > pos {
            out.push(ReadSlice::hole((cap - pos) as u64));
        }
    }
    Ok(out)
}
