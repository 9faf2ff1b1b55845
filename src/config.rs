/// Configuration for a byte-range index.
///
/// Passed to [`crate::ByteRangeIndex::new`]; the index never consults
/// process-wide state.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Flush the write buffer every this many `add` calls (default: 1024)
    pub flush_threshold: usize,

    /// Worker threads for parallel dropping scans (default: 4)
    pub reader_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1024,
            reader_threads: 4,
        }
    }
}

impl IndexConfig {
    /// Create a config with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the write-buffer flush threshold.
    pub fn flush_threshold(mut self, count: usize) -> Self {
        self.flush_threshold = count;
        self
    }

    /// Set the reader pool size. A size of 1 forces serial scans.
    pub fn reader_threads(mut self, threads: usize) -> Self {
        self.reader_threads = threads;
        self
    }
}
