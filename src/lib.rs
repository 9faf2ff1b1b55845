pub mod backend;
pub mod chunk;
pub mod config;
pub mod error;
pub mod index;
pub mod journal;
pub mod record;
pub mod scan;

pub use backend::{Backend, BackendRegistry, PosixBackend};
pub use config::IndexConfig;
pub use error::{Error, Result};
pub use index::query::ReadSlice;
pub use index::{AccessMode, ByteRangeIndex, CloseStats, ContainerRef, OpenOptions};
pub use record::{IntervalRecord, WriteRecord, RECORD_SIZE};
