use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backend, Handle, OpenFlags};
use crate::errfmt;
use crate::error::Result;
use crate::record::{DATA_PREFIX, INDEX_PREFIX};

/// One data dropping referenced by the aggregated index.
///
/// The entry owns an advisory read handle, opened on first use and closed
/// when the index closes. No back-pointers: the chunk table owns its entries
/// and nothing else.
pub struct ChunkEntry {
    spec: String,
    bpath: String,
    backend: Arc<dyn Backend>,
    handle: Option<Box<dyn Handle>>,
}

impl std::fmt::Debug for ChunkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkEntry")
            .field("spec", &self.spec)
            .field("bpath", &self.bpath)
            .field("handle_open", &self.handle.is_some())
            .finish()
    }
}

impl ChunkEntry {
    /// The path spec as it appears in a global index stream. Posix paths are
    /// written bare (a leading `/` implies `posix:`).
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn bpath(&self) -> &str {
        &self.bpath
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

/// Dense map of chunk id to data dropping.
///
/// Ids are assigned in first-encounter order; the next available id is
/// always the table size.
#[derive(Default, Debug)]
pub struct ChunkTable {
    entries: Vec<ChunkEntry>,
    by_spec: HashMap<String, u32>,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_spec: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interns a data dropping, deriving its path spec from the backend
    /// scheme. Duplicate paths yield the id they were first assigned.
    pub fn intern(&mut self, backend: &Arc<dyn Backend>, bpath: &str) -> u32 {
        let spec = if backend.scheme() == "posix" && bpath.starts_with('/') {
            bpath.to_string()
        } else {
            format!("{}:{}", backend.scheme(), bpath)
        };
        self.intern_spec(spec, bpath.to_string(), backend.clone())
    }

    /// Interns a chunk under an explicit path spec (stream import keeps the
    /// spec bytes it was handed).
    pub fn intern_spec(&mut self, spec: String, bpath: String, backend: Arc<dyn Backend>) -> u32 {
        if let Some(&id) = self.by_spec.get(&spec) {
            return id;
        }
        let id = self.entries.len() as u32;
        self.by_spec.insert(spec.clone(), id);
        self.entries.push(ChunkEntry {
            spec,
            bpath,
            backend,
            handle: None,
        });
        id
    }

    pub fn get(&self, id: u32) -> Option<&ChunkEntry> {
        self.entries.get(id as usize)
    }

    pub(crate) fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    /// Reads data bytes from a chunk, opening its handle on first use.
    pub fn read_at(&mut self, id: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self
            .entries
            .get_mut(id as usize)
            .ok_or_else(|| errfmt!("chunk id {id} out of range"))?;
        if entry.handle.is_none() {
            entry.handle = Some(entry.backend.open(&entry.bpath, OpenFlags::Read, 0)?);
        }
        entry.handle.as_mut().unwrap().read_at(offset, buf)
    }

    /// Closes all cached handles. The cache is advisory, so failures are
    /// logged and swallowed; calling this twice is a no-op.
    pub fn close_handles(&mut self) {
        for entry in &mut self.entries {
            if let Some(handle) = entry.handle.take() {
                if let Err(err) = handle.close() {
                    tracing::warn!(chunk = %entry.bpath, error = %err, "chunk handle close failed");
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.close_handles();
        self.entries.clear();
        self.by_spec.clear();
    }
}

/// Derives the data dropping path referenced by an index record.
///
/// `dropping.index.<sec>.<usec>.<host>.<pid>` paired with writer id W refers
/// to `dropping.data.<sec>.<usec>.<host>.W` in the same directory.
pub fn data_dropping_bpath(index_bpath: &str, writer_id: u32) -> Result<String> {
    let (dir, name) = match index_bpath.rsplit_once('/') {
        Some((d, n)) => (Some(d), n),
        None => (None, index_bpath),
    };
    let stem = name
        .strip_prefix(INDEX_PREFIX)
        .ok_or_else(|| errfmt!("not an index dropping: {index_bpath}"))?;
    let (ts_host, _pid) = stem
        .rsplit_once('.')
        .ok_or_else(|| errfmt!("malformed dropping name: {index_bpath}"))?;
    let data_name = format!("{DATA_PREFIX}{ts_host}.{writer_id}");
    Ok(match dir {
        Some(dir) => format!("{dir}/{data_name}"),
        None => data_name,
    })
}
