use std::sync::Arc;

use crate::backend::{with_umask_cleared, Backend, Handle, OpenFlags};
use crate::errstate;
use crate::error::Result;
use crate::record::{WriteRecord, DROPPING_MODE, INDEX_PREFIX, RECORD_SIZE};

struct Wdrop {
    handle: Box<dyn Handle>,
    bpath: String,
}

/// The write side of an open index: a buffer of records and the single
/// index dropping they flush into.
///
/// One journal serves every writer of the open; per-writer data droppings
/// are distinguished by the `writer_id` inside each record, not by separate
/// index droppings. The caller holds the index mutex across every call.
pub struct WriteJournal {
    buf: Vec<WriteRecord>,
    wdrop: Option<Wdrop>,
    write_count: u64,
    write_bytes: i64,
    flush_threshold: usize,
}

impl WriteJournal {
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            buf: Vec::new(),
            wdrop: None,
            write_count: 0,
            write_bytes: 0,
            flush_threshold: flush_threshold.max(1),
        }
    }

    /// Buffers one record, flushing when the running add count hits a
    /// multiple of the flush threshold.
    pub fn add(&mut self, rec: WriteRecord) -> Result<()> {
        self.buf.push(rec);
        self.write_count += 1;
        self.write_bytes += rec.length as i64;
        if self.write_count % self.flush_threshold as u64 == 0 {
            self.flush()?;
        }
        Ok(())
    }

    /// Appends the whole buffer to the index dropping as one write.
    ///
    /// The buffer is cleared even when the write fails; a failed flush means
    /// those records are gone and the caller must treat it as data loss.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let wdrop = match self.wdrop.as_mut() {
            Some(w) => w,
            None => {
                debug_assert!(false, "flush with a non-empty buffer but no write dropping");
                return Err(errstate!("flush with a non-empty buffer but no write dropping"));
            }
        };
        let records = std::mem::take(&mut self.buf);
        let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
        for rec in &records {
            rec.encode(&mut bytes)?;
        }
        if let Err(err) = wdrop.handle.write_all(&bytes) {
            tracing::error!(
                dropping = %wdrop.bpath,
                records = records.len(),
                error = %err,
                "index flush failed, buffered records lost"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Ensures the writable index dropping exists:
    /// `<subdir>/<INDEX_PREFIX><ts>.<host>.<pid>`, append/create, with the
    /// umask cleared so `DROPPING_MODE` lands intact. Idempotent; the caller
    /// already holds the index mutex, so one non-null check suffices here.
    pub fn ensure_wdrop(
        &mut self,
        subdir_bpath: &str,
        backend: &Arc<dyn Backend>,
        ts: &str,
        hostname: &str,
        pid: u32,
    ) -> Result<()> {
        if self.wdrop.is_some() {
            return Ok(());
        }
        let bpath = format!("{subdir_bpath}/{INDEX_PREFIX}{ts}.{hostname}.{pid}");
        let handle =
            with_umask_cleared(|| backend.open(&bpath, OpenFlags::AppendCreate, DROPPING_MODE))?;
        tracing::debug!(dropping = %bpath, "created index write dropping");
        self.wdrop = Some(Wdrop { handle, bpath });
        Ok(())
    }

    pub fn has_wdrop(&self) -> bool {
        self.wdrop.is_some()
    }

    pub fn wdrop_bpath(&self) -> Option<&str> {
        self.wdrop.as_ref().map(|w| w.bpath.as_str())
    }

    /// Truncates the open dropping file to zero ahead of a rewrite.
    pub fn truncate_wdrop(&mut self) -> Result<()> {
        if let Some(w) = self.wdrop.as_mut() {
            w.handle.truncate(0)?;
        }
        Ok(())
    }

    /// Drops buffered records at or past `z`, clipping a straddler.
    pub fn retain_below(&mut self, z: i64) {
        self.buf = self.buf.iter().filter_map(|r| r.clip_below(z)).collect();
    }

    pub fn clear_buffer(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn write_bytes(&self) -> i64 {
        self.write_bytes
    }

    /// Flushes and closes the dropping handle. A flush error wins over a
    /// close error; both sides are attempted regardless.
    pub fn close(&mut self) -> Result<()> {
        let flushed = self.flush();
        self.write_count = 0;
        self.write_bytes = 0;
        let closed = match self.wdrop.take() {
            Some(w) => w.handle.close(),
            None => Ok(()),
        };
        match (flushed, closed) {
            (Err(e), _) => Err(e),
            (Ok(()), r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PosixBackend;
    use crate::error::Error;
    use tempfile::TempDir;

    fn rec(offset: i64, len: u64) -> WriteRecord {
        WriteRecord {
            logical_offset: offset,
            physical_offset: offset,
            length: len,
            begin_timestamp: 1.0,
            end_timestamp: 1.1,
            writer_id: 0,
        }
    }

    fn journal_in(dir: &TempDir, threshold: usize) -> (WriteJournal, String) {
        let backend: Arc<dyn Backend> = Arc::new(PosixBackend);
        let subdir = dir.path().to_string_lossy().into_owned();
        let mut journal = WriteJournal::new(threshold);
        journal
            .ensure_wdrop(&subdir, &backend, "10.20", "node0", 42)
            .expect("Failed to create write dropping");
        let bpath = journal.wdrop_bpath().expect("dropping exists").to_string();
        (journal, bpath)
    }

    #[test]
    fn test_flush_threshold_boundary() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let (mut journal, bpath) = journal_in(&dir, 4);

        for i in 0..3 {
            journal.add(rec(i * 10, 10)).expect("Failed to add");
        }
        assert_eq!(journal.buffered(), 3);
        assert_eq!(std::fs::metadata(&bpath).expect("stat").len(), 0);

        // the 4th add crosses the threshold and flushes everything
        journal.add(rec(30, 10)).expect("Failed to add");
        assert_eq!(journal.buffered(), 0);
        assert_eq!(
            std::fs::metadata(&bpath).expect("stat").len(),
            4 * RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_sync_appends_exact_record_bytes() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let (mut journal, bpath) = journal_in(&dir, 1024);

        for i in 0..7 {
            journal.add(rec(i * 100, 100)).expect("Failed to add");
        }
        journal.flush().expect("Failed to flush");
        assert_eq!(
            std::fs::metadata(&bpath).expect("stat").len(),
            7 * RECORD_SIZE as u64
        );
        assert_eq!(journal.write_bytes(), 700);

        // flushing an empty buffer appends nothing
        journal.flush().expect("Failed to flush");
        assert_eq!(
            std::fs::metadata(&bpath).expect("stat").len(),
            7 * RECORD_SIZE as u64
        );
    }

    #[test]
    fn test_wdrop_create_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let backend: Arc<dyn Backend> = Arc::new(PosixBackend);
        let subdir = dir.path().to_string_lossy().into_owned();
        let mut journal = WriteJournal::new(1024);

        journal
            .ensure_wdrop(&subdir, &backend, "1.2", "h", 1)
            .expect("Failed to create");
        let first = journal.wdrop_bpath().expect("exists").to_string();
        journal
            .ensure_wdrop(&subdir, &backend, "9.9", "other", 2)
            .expect("second call succeeds");
        assert_eq!(journal.wdrop_bpath(), Some(first.as_str()));
    }

    #[test]
    fn test_flush_without_dropping_is_a_state_error() {
        let mut journal = WriteJournal::new(1024);
        journal.add(rec(0, 10)).expect("buffered add succeeds");
        // debug_assert fires under cfg(debug_assertions); exercise the
        // release-mode contract
        if cfg!(not(debug_assertions)) {
            match journal.flush() {
                Err(Error::State(_)) => {}
                other => panic!("Expected State error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_retain_below_filters_and_clips() {
        let mut journal = WriteJournal::new(1024);
        journal.buf.push(rec(0, 100));
        journal.buf.push(rec(100, 100)); // straddles 150
        journal.buf.push(rec(200, 50)); // fully beyond
        journal.retain_below(150);
        assert_eq!(journal.buffered(), 2);
        assert_eq!(journal.buf[1].length, 50);
    }

    #[test]
    fn test_close_flushes_and_releases() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let (mut journal, bpath) = journal_in(&dir, 1024);
        journal.add(rec(0, 64)).expect("Failed to add");
        journal.close().expect("Failed to close");
        assert!(!journal.has_wdrop());
        assert_eq!(
            std::fs::metadata(&bpath).expect("stat").len(),
            RECORD_SIZE as u64
        );
        // double close is harmless
        journal.close().expect("second close succeeds");
    }
}
