pub mod aggregate;
pub mod query;
pub mod reader;
pub mod stream;
pub mod trunc;

use std::sync::{Arc, Mutex};

use crate::backend::{Backend, BackendRegistry};
use crate::config::IndexConfig;
use crate::errstate;
use crate::error::{Error, Result};
use crate::journal::WriteJournal;
use crate::record::WriteRecord;
use crate::scan;

use aggregate::Aggregate;
use query::ReadSlice;

/// Access mode of an open index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Canonical location of a container: its backend path and the backend it
/// lives on. Path resolution is the enclosing file system's job.
#[derive(Clone)]
pub struct ContainerRef {
    pub bpath: String,
    pub backend: Arc<dyn Backend>,
}

/// Options for [`ByteRangeIndex::open`].
#[derive(Default)]
pub struct OpenOptions {
    /// A pre-serialized global index to import instead of scanning (the
    /// cross-node hand-off path).
    pub index_stream: Option<Vec<u8>>,
    /// Scan only droppings written by this rank, for deterministic re-read
    /// from a single writer identity.
    pub uniform_restart: Option<u32>,
}

/// What close reports back for the container's metadata dropping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CloseStats {
    /// The tracked end of file.
    pub last_offset: i64,
    /// Bytes written this open (writable modes) or backing bytes scanned
    /// (read-only).
    pub total_bytes: i64,
}

/// Mode-dependent state. Each mode owns exactly the data it needs; the
/// transitions in open/close do the allocation and teardown.
enum State {
    Closed,
    Read(Aggregate),
    Write(WriteJournal),
    /// Writable, but with no aggregated map: queries rebuild a read view on
    /// demand so they never serve a stale one.
    ReadWrite(WriteJournal),
}

struct Inner {
    state: State,
    /// Max logical offset + length ever observed. Survives close so the
    /// container's metadata dropping can reuse it.
    eof_tracker: i64,
    container: Option<ContainerRef>,
}

/// The byte-range index of one open container file.
///
/// A single mutex guards every public operation; calls block only on the
/// mutex and on backend I/O. Collaborators (config, backend registry) are
/// handed in at construction, never read from process globals.
pub struct ByteRangeIndex {
    cfg: IndexConfig,
    registry: Arc<BackendRegistry>,
    inner: Mutex<Inner>,
}

impl ByteRangeIndex {
    /// Creates a closed index.
    pub fn new(cfg: IndexConfig, registry: Arc<BackendRegistry>) -> Self {
        Self {
            cfg,
            registry,
            inner: Mutex::new(Inner {
                state: State::Closed,
                eof_tracker: 0,
                container: None,
            }),
        }
    }

    /// Opens the index against a container.
    ///
    /// Read and read-write opens load the aggregated view (stream import
    /// when provided, otherwise a scan of every dropping, honoring the
    /// uniform-restart hint). A read-write open then discards the view,
    /// keeping only the EOF it learned; write-only opens do nothing eagerly.
    pub fn open(&self, container: &ContainerRef, mode: AccessMode, opts: OpenOptions) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        if !matches!(inner.state, State::Closed) {
            return Err(errstate!("index is already open"));
        }

        inner.state = match mode {
            AccessMode::WriteOnly => State::Write(WriteJournal::new(self.cfg.flush_threshold)),
            AccessMode::ReadOnly | AccessMode::ReadWrite => {
                let agg = self.load(container, &opts)?;
                inner.eof_tracker = inner.eof_tracker.max(agg.eof());
                if mode == AccessMode::ReadOnly {
                    State::Read(agg)
                } else {
                    // the map would go stale under our own writes; queries
                    // re-read instead (slow but correct)
                    State::ReadWrite(WriteJournal::new(self.cfg.flush_threshold))
                }
            }
        };
        inner.container = Some(container.clone());
        tracing::debug!(container = %container.bpath, ?mode, "index opened");
        Ok(())
    }

    fn load(&self, container: &ContainerRef, opts: &OpenOptions) -> Result<Aggregate> {
        if let Some(bytes) = &opts.index_stream {
            return stream::import(bytes, &self.registry);
        }
        let mut droppings = scan::collect_droppings(&container.bpath, &container.backend)?;
        if let Some(rank) = opts.uniform_restart {
            droppings.retain(|d| scan::dropping_writer_id(d) == Some(rank));
        }
        reader::aggregate_droppings(&droppings, &container.backend, self.cfg.reader_threads)
    }

    /// Closes the index, flushing and releasing whatever the mode holds.
    ///
    /// Returns the close stats, or `None` when the index was not open
    /// (double close and close-before-open are no-ops). A flush failure
    /// still closes everything and wins over any close failure.
    pub fn close(&self) -> Result<Option<CloseStats>> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        match std::mem::replace(&mut inner.state, State::Closed) {
            State::Closed => Ok(None),
            State::Read(mut agg) => {
                let stats = CloseStats {
                    last_offset: inner.eof_tracker,
                    total_bytes: agg.backing_bytes(),
                };
                agg.clear(); // drops the map and chunk handles
                inner.container = None;
                Ok(Some(stats))
            }
            State::Write(mut journal) | State::ReadWrite(mut journal) => {
                let stats = CloseStats {
                    last_offset: inner.eof_tracker,
                    total_bytes: journal.write_bytes(),
                };
                let res = journal.close();
                inner.container = None;
                res.map(|()| Some(stats))
            }
        }
    }

    /// Journals one write: logical placement, physical placement inside the
    /// writer's data dropping, and the wall-clock bracket of the write.
    pub fn add(
        &self,
        logical_offset: i64,
        length: u64,
        writer_id: u32,
        physical_offset: i64,
        begin: f64,
        end: f64,
    ) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        match &mut inner.state {
            State::Write(journal) | State::ReadWrite(journal) => {
                journal.add(WriteRecord {
                    logical_offset,
                    physical_offset,
                    length,
                    begin_timestamp: begin,
                    end_timestamp: end,
                    writer_id,
                })?;
                if length > 0 {
                    inner.eof_tracker = inner.eof_tracker.max(logical_offset + length as i64);
                }
                Ok(())
            }
            _ => Err(errstate!("add requires a writable index")),
        }
    }

    /// Forces buffered records out to the index dropping. A no-op when
    /// nothing is writable.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.inner.lock()?;
        match &mut guard.state {
            State::Write(journal) | State::ReadWrite(journal) => journal.flush(),
            _ => Ok(()),
        }
    }

    /// Resolves logical `[offset, offset + length)` into ordered physical
    /// read instructions, holes included.
    ///
    /// Read-write opens hold no aggregated map, so each query builds a
    /// throwaway read-only companion over the same container
    /// (open → query → close), after pushing our own buffered records down.
    pub fn query(&self, offset: i64, length: u64) -> Result<Vec<ReadSlice>> {
        enum Plan {
            Direct(Vec<ReadSlice>),
            Companion(ContainerRef),
        }

        let plan = {
            let mut guard = self.inner.lock()?;
            let inner = &mut *guard;
            match &mut inner.state {
                State::Read(agg) => {
                    Plan::Direct(query::query(agg.map(), inner.eof_tracker, offset, length)?)
                }
                State::ReadWrite(journal) => {
                    if journal.has_wdrop() {
                        journal.flush()?;
                    }
                    let container = inner
                        .container
                        .clone()
                        .ok_or_else(|| errstate!("open index without a container"))?;
                    Plan::Companion(container)
                }
                State::Write(_) => return Err(errstate!("query requires a readable index")),
                State::Closed => return Err(errstate!("query on a closed index")),
            }
        };

        match plan {
            Plan::Direct(slices) => Ok(slices),
            Plan::Companion(container) => {
                let companion = ByteRangeIndex::new(self.cfg.clone(), self.registry.clone());
                companion.open(&container, AccessMode::ReadOnly, OpenOptions::default())?;
                let result = companion.query(offset, length);
                let _ = companion.close(); // throwaway view, close errors carry nothing
                result
            }
        }
    }

    /// Truncates the logical file at `offset`.
    ///
    /// Zero: the container layer has already removed the droppings; only the
    /// in-memory view is dropped here. Non-zero: requires a writable open;
    /// filters the write buffer, rewrites every persisted dropping (reading
    /// the open one before truncating its handle), and lowers the EOF.
    pub fn truncate(&self, offset: i64) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;

        if offset == 0 {
            match &mut inner.state {
                State::Closed => return Err(errstate!("truncate on a closed index")),
                State::Read(agg) => agg.clear(),
                State::Write(journal) | State::ReadWrite(journal) => journal.clear_buffer(),
            }
            inner.eof_tracker = 0;
            return Ok(());
        }

        let container = inner
            .container
            .clone()
            .ok_or_else(|| errstate!("truncate on a closed index"))?;
        match &mut inner.state {
            State::Write(journal) | State::ReadWrite(journal) => {
                journal.retain_below(offset);
                let open_bpath = journal.wdrop_bpath().map(str::to_string);
                for bpath in scan::collect_droppings(&container.bpath, &container.backend)? {
                    if Some(&bpath) == open_bpath.as_ref() {
                        // read before dropping the stale tail through our
                        // own handle, then lay the kept records back down
                        let records = scan::read_records(&bpath, &container.backend)?;
                        let kept: Vec<WriteRecord> =
                            records.iter().filter_map(|r| r.clip_below(offset)).collect();
                        journal.truncate_wdrop()?;
                        trunc::rewrite_records(&bpath, &container.backend, &kept)?;
                    } else {
                        trunc::rewrite_dropping(&bpath, &container.backend, offset)?;
                    }
                }
                inner.eof_tracker = offset;
                Ok(())
            }
            _ => Err(errstate!("truncate requires a writable index")),
        }
    }

    /// Ensures the writable index dropping exists under the given hostdir.
    /// Idempotent: the first caller creates it, later callers see it and
    /// succeed.
    pub fn new_wdrop(
        &self,
        subdir_bpath: &str,
        backend: &Arc<dyn Backend>,
        ts: &str,
        hostname: &str,
        pid: u32,
    ) -> Result<()> {
        let mut guard = self.inner.lock()?;
        match &mut guard.state {
            State::Write(journal) | State::ReadWrite(journal) => {
                journal.ensure_wdrop(subdir_bpath, backend, ts, hostname, pid)
            }
            _ => Err(errstate!("new_wdrop requires a writable index")),
        }
    }

    /// A writer's data dropping is closing. Nothing to do here: one index
    /// dropping is shared by every writer of this open, and the final close
    /// releases it.
    pub fn closing_wdrop(&self, _ts: &str, _pid: u32, _filename: &str) -> Result<()> {
        Ok(())
    }

    /// Current `(last_offset, total_bytes)` without closing.
    pub fn info(&self) -> Result<(i64, i64)> {
        let guard = self.inner.lock()?;
        match &guard.state {
            State::Write(journal) | State::ReadWrite(journal) => {
                Ok((guard.eof_tracker, journal.write_bytes()))
            }
            State::Read(agg) => Ok((guard.eof_tracker, agg.backing_bytes())),
            State::Closed => Err(errstate!("info on a closed index")),
        }
    }

    /// Serializes the aggregated view for cross-node hand-off.
    pub fn to_stream(&self) -> Result<Vec<u8>> {
        let guard = self.inner.lock()?;
        match &guard.state {
            State::Read(agg) => stream::export(agg),
            _ => Err(errstate!("stream export requires a read-only index")),
        }
    }

    /// Reads data bytes out of a chunk named by a query result. The chunk
    /// handle opens on first use and stays cached until close.
    pub fn read_chunk(&self, chunk_id: u32, physical_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.inner.lock()?;
        match &mut guard.state {
            State::Read(agg) => agg.chunks_mut().read_at(chunk_id, physical_offset, buf),
            _ => Err(errstate!("chunk reads require a read-only index")),
        }
    }

    /// Index flattening is not part of the current contract.
    pub fn optimize(&self) -> Result<()> {
        Err(Error::Unsupported("index optimize".to_string()))
    }

    /// Sizing a file from droppings alone is not part of the current
    /// contract.
    pub fn getattr_size(&self) -> Result<()> {
        Err(Error::Unsupported("getattr size from index droppings".to_string()))
    }

    /// Droppings move with their container; nothing to rename here.
    pub fn droppings_rename(_src: &ContainerRef, _dst: &ContainerRef) -> Result<()> {
        Ok(())
    }

    /// Container unlink removes the droppings; nothing extra to do.
    pub fn droppings_unlink(_container: &ContainerRef) -> Result<()> {
        Ok(())
    }

    /// Truncate-to-zero deletes droppings at the container level; nothing
    /// extra to do.
    pub fn droppings_zero(_container: &ContainerRef) -> Result<()> {
        Ok(())
    }

    /// Rewrites every index dropping of a (not necessarily open) container
    /// so no record content reaches past `offset`. Called when a file
    /// shrinks to a non-zero size; data droppings are left alone.
    pub fn droppings_trunc(container: &ContainerRef, offset: i64) -> Result<()> {
        if offset <= 0 {
            return Err(errstate!(
                "droppings_trunc needs a positive offset, got {offset}"
            ));
        }
        trunc::rewrite_container(&container.bpath, &container.backend, offset)
    }
}
