use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, NativeEndian};

use crate::backend::{Backend, BackendRegistry};
use crate::errfmt;
use crate::error::{Error, Result};
use crate::record::{IntervalRecord, INDEX_PREFIX, RECORD_SIZE};
use crate::scan;

use super::aggregate::Aggregate;

/// Serializes an aggregated index for cross-node hand-off.
///
/// Layout: an 8-byte little-endian entry count, the entries in native record
/// layout with `chunk_id` in the id slot, then the chunk path specs in
/// chunk-id order, each terminated by `\n`. Posix paths appear bare (a
/// leading `/` implies `posix:`).
pub fn export(agg: &Aggregate) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + agg.map().len() * RECORD_SIZE);
    let mut count = [0u8; 8];
    LittleEndian::write_u64(&mut count, agg.map().len() as u64);
    buf.extend_from_slice(&count);
    for entry in agg.map().values() {
        entry.encode_stream(&mut buf)?;
    }
    for chunk in agg.chunks().entries() {
        buf.extend_from_slice(chunk.spec().as_bytes());
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Rebuilds an aggregate from a serialized global index, bypassing any
/// dropping scans. Entries land in the map directly; the exporter already
/// resolved overlaps.
pub fn import(bytes: &[u8], registry: &BackendRegistry) -> Result<Aggregate> {
    if bytes.len() < 8 {
        return Err(errfmt!("global index stream truncated at the count word"));
    }
    let count = LittleEndian::read_u64(&bytes[..8]) as usize;
    let body = &bytes[8..];
    let need = count
        .checked_mul(RECORD_SIZE)
        .ok_or_else(|| errfmt!("global index stream count {count} overflows"))?;
    if body.len() < need {
        return Err(errfmt!(
            "global index stream truncated: {count} entries need {need} bytes, {} remain",
            body.len()
        ));
    }

    let mut rd = &body[..need];
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(IntervalRecord::decode_stream(&mut rd)?);
    }

    let text = std::str::from_utf8(&body[need..])
        .map_err(|_| errfmt!("chunk path list is not UTF-8"))?;
    if !text.is_empty() && !text.ends_with('\n') {
        return Err(errfmt!("unterminated chunk path list"));
    }

    let mut agg = Aggregate::new();
    for (i, spec) in text.split('\n').filter(|l| !l.is_empty()).enumerate() {
        let (backend, bpath) = registry.resolve(spec)?;
        let id = agg
            .chunks_mut()
            .intern_spec(spec.to_string(), bpath, backend);
        if id as usize != i {
            return Err(errfmt!("duplicate chunk path in stream: {spec}"));
        }
    }

    let nchunks = agg.chunks().len() as u32;
    let mut eof = 0i64;
    let mut backing = 0i64;
    for rec in records {
        if rec.chunk_id >= nchunks {
            return Err(errfmt!(
                "chunk id {} out of range ({nchunks} chunk paths)",
                rec.chunk_id
            ));
        }
        backing += rec.length as i64;
        if rec.length > 0 {
            eof = eof.max(rec.logical_tail());
        }
        agg.map_mut().insert(rec.logical_offset, rec);
    }
    agg.set_aggregates(eof, backing);
    Ok(agg)
}

/// Directory-listing hand-off: enough of a dropping file name for a remote
/// rank to reconstruct the path and claim a share of the scan work.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexFileInfo {
    pub timestamp: f64,
    pub hostname: String,
    pub writer_id: u32,
}

/// Serializes a listing: per record, a native f64 timestamp, a u32
/// hostname length, the hostname bytes, and the u32 writer id.
pub fn infos_to_stream(list: &[IndexFileInfo]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut scratch8 = [0u8; 8];
    let mut scratch4 = [0u8; 4];
    for info in list {
        NativeEndian::write_f64(&mut scratch8, info.timestamp);
        buf.extend_from_slice(&scratch8);
        NativeEndian::write_u32(&mut scratch4, info.hostname.len() as u32);
        buf.extend_from_slice(&scratch4);
        buf.extend_from_slice(info.hostname.as_bytes());
        NativeEndian::write_u32(&mut scratch4, info.writer_id);
        buf.extend_from_slice(&scratch4);
    }
    buf
}

pub fn infos_from_stream(bytes: &[u8]) -> Result<Vec<IndexFileInfo>> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 12 {
            return Err(errfmt!("index file info stream truncated"));
        }
        let timestamp = NativeEndian::read_f64(&rest[..8]);
        let host_len = NativeEndian::read_u32(&rest[8..12]) as usize;
        rest = &rest[12..];
        if rest.len() < host_len + 4 {
            return Err(errfmt!("index file info stream truncated"));
        }
        let hostname = std::str::from_utf8(&rest[..host_len])
            .map_err(|_| errfmt!("index file info hostname is not UTF-8"))?
            .to_string();
        let writer_id = NativeEndian::read_u32(&rest[host_len..host_len + 4]);
        rest = &rest[host_len + 4..];
        out.push(IndexFileInfo {
            timestamp,
            hostname,
            writer_id,
        });
    }
    Ok(out)
}

/// Lists the index droppings of one container subdir as IndexFileInfo
/// records, in file-name order. Parallel readers partition scan work with
/// this. A missing subdir is an empty listing.
pub fn infos_from_subdir(subdir_bpath: &str, backend: &Arc<dyn Backend>) -> Result<Vec<IndexFileInfo>> {
    let entries = match backend.readdir(subdir_bpath) {
        Ok(v) => v,
        Err(Error::NotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|d| !d.is_dir && d.name.starts_with(INDEX_PREFIX))
        .map(|d| d.name)
        .collect();
    names.sort();

    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match (
            scan::dropping_timestamp(&name),
            scan::dropping_hostname(&name),
            scan::dropping_writer_id(&name),
        ) {
            (Some(timestamp), Some(hostname), Some(writer_id)) => out.push(IndexFileInfo {
                timestamp,
                hostname,
                writer_id,
            }),
            _ => {
                tracing::warn!(dropping = %name, "skipping unparseable dropping name");
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PosixBackend;
    use crate::record::WriteRecord;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn registry() -> BackendRegistry {
        BackendRegistry::with_posix()
    }

    fn rec(offset: i64, len: u64, chunk: u32) -> IntervalRecord {
        IntervalRecord {
            logical_offset: offset,
            physical_offset: offset,
            length: len,
            begin_timestamp: 1.0,
            end_timestamp: 2.0,
            chunk_id: chunk,
            writer_id: chunk,
        }
    }

    fn sample_aggregate() -> Aggregate {
        let backend: Arc<dyn Backend> = Arc::new(PosixBackend);
        let mut agg = Aggregate::new();
        agg.chunks_mut().intern(&backend, "/c/h/dropping.data.1.2.a.0");
        agg.chunks_mut().intern(&backend, "/c/h/dropping.data.1.2.b.1");
        agg.insert(rec(0, 100, 0));
        agg.insert(rec(100, 50, 1));
        agg.set_aggregates(150, 150);
        agg
    }

    #[test]
    fn test_export_import_is_a_fixed_point() {
        let agg = sample_aggregate();
        let first = export(&agg).expect("Failed to export");

        let imported = import(&first, &registry()).expect("Failed to import");
        assert_eq!(imported.map().len(), 2);
        assert_eq!(imported.eof(), 150);
        assert_eq!(imported.backing_bytes(), 150);

        let second = export(&imported).expect("Failed to re-export");
        assert_eq!(first, second);
    }

    #[test]
    fn test_import_rejects_truncated_streams() {
        let agg = sample_aggregate();
        let bytes = export(&agg).expect("Failed to export");

        match import(&bytes[..4], &registry()) {
            Err(Error::Format(_)) => {}
            other => panic!("Expected Format error, got {other:?}"),
        }
        // count says two records but the body is cut short
        match import(&bytes[..8 + RECORD_SIZE], &registry()) {
            Err(Error::Format(_)) => {}
            other => panic!("Expected Format error, got {other:?}"),
        }
    }

    #[test]
    fn test_import_rejects_out_of_range_chunk_id() {
        let backend: Arc<dyn Backend> = Arc::new(PosixBackend);
        let mut agg = Aggregate::new();
        agg.chunks_mut().intern(&backend, "/c/h/dropping.data.1.2.a.0");
        agg.insert(rec(0, 10, 7)); // no chunk 7 in the table
        let bytes = export(&agg).expect("Failed to export");

        match import(&bytes, &registry()) {
            Err(Error::Format(msg)) => assert!(msg.contains("out of range")),
            other => panic!("Expected Format error, got {other:?}"),
        }
    }

    #[test]
    fn test_infos_stream_roundtrip() {
        let list = vec![
            IndexFileInfo { timestamp: 10.25, hostname: "nodeA".into(), writer_id: 3 },
            IndexFileInfo { timestamp: 11.0, hostname: "b.example".into(), writer_id: 0 },
        ];
        let bytes = infos_to_stream(&list);
        let back = infos_from_stream(&bytes).expect("Failed to decode");
        assert_eq!(back, list);

        match infos_from_stream(&bytes[..bytes.len() - 2]) {
            Err(Error::Format(_)) => {}
            other => panic!("Expected Format error, got {other:?}"),
        }
    }

    #[test]
    fn test_infos_from_subdir_lists_droppings() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        for name in [
            "dropping.index.10.250000.nodeA.3",
            "dropping.index.11.0.nodeB.5",
            "dropping.data.10.250000.nodeA.3",
        ] {
            let mut rec_bytes = Vec::new();
            WriteRecord {
                logical_offset: 0,
                physical_offset: 0,
                length: 1,
                begin_timestamp: 0.0,
                end_timestamp: 0.1,
                writer_id: 0,
            }
            .encode(&mut rec_bytes)
            .expect("Failed to encode");
            std::fs::File::create(dir.path().join(name))
                .and_then(|mut f| f.write_all(&rec_bytes))
                .expect("Failed to seed dropping");
        }

        let backend: Arc<dyn Backend> = Arc::new(PosixBackend);
        let subdir = dir.path().to_string_lossy().into_owned();
        let infos = infos_from_subdir(&subdir, &backend).expect("Failed to list");
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].hostname, "nodeA");
        assert_eq!(infos[0].writer_id, 3);
        assert_eq!(infos[1].timestamp, 11.0);
    }
}
