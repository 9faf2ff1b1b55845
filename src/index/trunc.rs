use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{Backend, OpenFlags};
use crate::error::Result;
use crate::record::{IntervalRecord, WriteRecord, DROPPING_MODE, RECORD_SIZE};
use crate::scan;

/// Filters the in-memory map down to content below `z`: entries at or past
/// `z` go away, a straddling entry is shortened to end at `z`.
pub fn trunc_map(map: &mut BTreeMap<i64, IntervalRecord>, z: i64) {
    map.retain(|&k, _| k < z);
    for (_, e) in map.range_mut(..z) {
        if e.logical_tail() > z {
            e.length = (z - e.logical_offset) as u64;
        }
    }
}

/// Replaces a dropping's contents with the given record array via a
/// truncate-and-write open.
pub fn rewrite_records(bpath: &str, backend: &Arc<dyn Backend>, records: &[WriteRecord]) -> Result<()> {
    let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
    for rec in records {
        rec.encode(&mut bytes)?;
    }
    let mut handle = backend.open(bpath, OpenFlags::TruncWrite, DROPPING_MODE)?;
    let wrote = handle.write_all(&bytes);
    let closed = handle.close();
    wrote?;
    closed?;
    Ok(())
}

/// Rewrites one index dropping in place, keeping only record content below
/// `z`. Returns whether the file changed.
///
/// The filter runs in memory over the scanned records; the rewrite lays the
/// kept records back down as one array.
pub fn rewrite_dropping(bpath: &str, backend: &Arc<dyn Backend>, z: i64) -> Result<bool> {
    let records = scan::read_records(bpath, backend)?;
    let kept: Vec<WriteRecord> = records.iter().filter_map(|r| r.clip_below(z)).collect();
    if kept.len() == records.len() && kept.iter().zip(&records).all(|(a, b)| a == b) {
        return Ok(false);
    }
    rewrite_records(bpath, backend, &kept)?;
    tracing::debug!(
        dropping = %bpath,
        kept = kept.len(),
        dropped = records.len() - kept.len(),
        "rewrote index dropping for truncate"
    );
    Ok(true)
}

/// Applies the truncate filter to every index dropping in a container.
pub fn rewrite_container(container_bpath: &str, backend: &Arc<dyn Backend>, z: i64) -> Result<()> {
    for bpath in scan::collect_droppings(container_bpath, backend)? {
        rewrite_dropping(&bpath, backend, z)?;
    }
    Ok(())
}
