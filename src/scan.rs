use std::sync::Arc;

use crate::backend::{Backend, OpenFlags};
use crate::chunk::{data_dropping_bpath, ChunkTable};
use crate::errfmt;
use crate::error::{Error, Result};
use crate::record::{IntervalRecord, WriteRecord, INDEX_PREFIX, RECORD_SIZE};

/// Reads every raw record of one index dropping.
///
/// The file is nothing but concatenated records, so its size must divide
/// evenly; anything else is a format error and aborts the caller's scan.
pub fn read_records(bpath: &str, backend: &Arc<dyn Backend>) -> Result<Vec<WriteRecord>> {
    let st = backend.lstat(bpath)?;
    if st.size % RECORD_SIZE as u64 != 0 {
        return Err(errfmt!(
            "dropping {bpath}: size {} is not a multiple of the {RECORD_SIZE}-byte record",
            st.size
        ));
    }
    let count = (st.size / RECORD_SIZE as u64) as usize;
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut handle = backend.open(bpath, OpenFlags::Read, 0)?;
    let bytes = handle.read_all()?;
    if bytes.len() != st.size as usize {
        return Err(errfmt!(
            "dropping {bpath}: read {} bytes, expected {}",
            bytes.len(),
            st.size
        ));
    }
    let mut rd = bytes.as_slice();
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(WriteRecord::decode(&mut rd)?);
    }
    Ok(out)
}

/// What one dropping contributes to the aggregate.
pub struct ScanOutput {
    pub records: Vec<IntervalRecord>,
    /// Max `logical_offset + length` over sized records.
    pub eof: i64,
    /// Sum of record lengths, shadowed bytes included.
    pub backing_bytes: i64,
}

/// Streams one index dropping into interval form, interning each record's
/// data dropping in the chunk table.
pub fn scan_dropping(
    bpath: &str,
    backend: &Arc<dyn Backend>,
    chunks: &mut ChunkTable,
) -> Result<ScanOutput> {
    let raw = read_records(bpath, backend)?;
    let mut out = ScanOutput {
        records: Vec::with_capacity(raw.len()),
        eof: 0,
        backing_bytes: 0,
    };
    for rec in raw {
        let data_bpath = data_dropping_bpath(bpath, rec.writer_id)?;
        let chunk_id = chunks.intern(backend, &data_bpath);
        out.backing_bytes += rec.length as i64;
        if rec.length > 0 {
            out.eof = out.eof.max(rec.logical_tail());
        }
        out.records.push(IntervalRecord::from_write(&rec, chunk_id));
    }
    tracing::debug!(dropping = %bpath, records = out.records.len(), "scanned index dropping");
    Ok(out)
}

/// Collects the bpaths of every index dropping in a container.
///
/// The container layer owns the directory layout; the index only looks one
/// subdir level deep and pattern-matches the dropping prefix. A missing
/// container directory is an empty container, not an error.
pub fn collect_droppings(container_bpath: &str, backend: &Arc<dyn Backend>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let entries = match backend.readdir(container_bpath) {
        Ok(v) => v,
        Err(Error::NotFound(_)) => return Ok(out),
        Err(e) => return Err(e),
    };
    for dent in entries {
        let path = format!("{container_bpath}/{}", dent.name);
        if dent.is_dir {
            let subs = match backend.readdir(&path) {
                Ok(v) => v,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for sub in subs {
                if !sub.is_dir && sub.name.starts_with(INDEX_PREFIX) {
                    out.push(format!("{path}/{}", sub.name));
                }
            }
        } else if dent.name.starts_with(INDEX_PREFIX) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn name_fields(bpath: &str) -> Option<(f64, String, u32)> {
    let name = bpath.rsplit('/').next()?;
    let stem = name.strip_prefix(INDEX_PREFIX)?;
    let parts: Vec<&str> = stem.split('.').collect();
    if parts.len() < 4 {
        return None;
    }
    let timestamp: f64 = format!("{}.{}", parts[0], parts[1]).parse().ok()?;
    let writer_id: u32 = parts[parts.len() - 1].parse().ok()?;
    let hostname = parts[2..parts.len() - 1].join(".");
    Some((timestamp, hostname, writer_id))
}

/// The `<sec>.<usec>` stamp of a dropping file name, as seconds.
pub fn dropping_timestamp(bpath: &str) -> Option<f64> {
    name_fields(bpath).map(|(ts, _, _)| ts)
}

/// The host field of a dropping file name.
pub fn dropping_hostname(bpath: &str) -> Option<String> {
    name_fields(bpath).map(|(_, host, _)| host)
}

/// The trailing writer/pid field of a dropping file name.
pub fn dropping_writer_id(bpath: &str) -> Option<u32> {
    name_fields(bpath).map(|(_, _, id)| id)
}
