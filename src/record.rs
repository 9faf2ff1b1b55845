use std::io::{Read, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// File-name prefix of index dropping files.
pub const INDEX_PREFIX: &str = "dropping.index.";
/// File-name prefix of data dropping files.
pub const DATA_PREFIX: &str = "dropping.data.";
/// Permission bits for newly created droppings (umask is cleared around the
/// create, so these land on disk as-is).
pub const DROPPING_MODE: u32 = 0o644;

/// On-disk size of one write record: 44 bytes of fields plus 4 pad bytes,
/// matching the natural-alignment layout of the field list.
pub const RECORD_SIZE: usize = 48;

const RECORD_PAD: usize = 4;

/// One on-disk index record describing a single append.
///
/// Records are written in native byte order with no framing; an index
/// dropping file is nothing but a concatenation of these. The layout is
/// stable for a given build but not portable across architectures.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteRecord {
    /// Byte position in the logical file.
    pub logical_offset: i64,
    /// Byte position inside the writer's data dropping.
    pub physical_offset: i64,
    /// Bytes covered; zero is legal (zero-length marker).
    pub length: u64,
    /// Wall-clock bracket of the underlying write.
    pub begin_timestamp: f64,
    pub end_timestamp: f64,
    /// Which data dropping (within the same timestamp/host) holds the bytes.
    pub writer_id: u32,
}

impl WriteRecord {
    /// One past the last logical byte covered.
    pub fn logical_tail(&self) -> i64 {
        self.logical_offset + self.length as i64
    }

    /// Clips the record to logical offsets below `z`. Returns None when the
    /// record starts at or past `z`, a shortened copy when it straddles `z`,
    /// and the record unchanged otherwise.
    pub fn clip_below(&self, z: i64) -> Option<WriteRecord> {
        if self.logical_offset >= z {
            return None;
        }
        let mut out = *self;
        if out.logical_tail() > z {
            out.length = (z - out.logical_offset) as u64;
        }
        Some(out)
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i64::<NativeEndian>(self.logical_offset)?;
        w.write_i64::<NativeEndian>(self.physical_offset)?;
        w.write_u64::<NativeEndian>(self.length)?;
        w.write_f64::<NativeEndian>(self.begin_timestamp)?;
        w.write_f64::<NativeEndian>(self.end_timestamp)?;
        w.write_u32::<NativeEndian>(self.writer_id)?;
        w.write_all(&[0u8; RECORD_PAD])?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let rec = WriteRecord {
            logical_offset: r.read_i64::<NativeEndian>()?,
            physical_offset: r.read_i64::<NativeEndian>()?,
            length: r.read_u64::<NativeEndian>()?,
            begin_timestamp: r.read_f64::<NativeEndian>()?,
            end_timestamp: r.read_f64::<NativeEndian>()?,
            writer_id: r.read_u32::<NativeEndian>()?,
        };
        let mut pad = [0u8; RECORD_PAD];
        r.read_exact(&mut pad)?;
        Ok(rec)
    }
}

/// The in-memory, read-side form of a record after aggregation.
///
/// `writer_id` is replaced by a dense `chunk_id` into the chunk table; the
/// original writer id is retained only to break timestamp ties
/// deterministically.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntervalRecord {
    pub logical_offset: i64,
    pub physical_offset: i64,
    pub length: u64,
    pub begin_timestamp: f64,
    pub end_timestamp: f64,
    pub chunk_id: u32,
    pub writer_id: u32,
}

impl IntervalRecord {
    /// Builds the interval form of a scanned record.
    pub fn from_write(rec: &WriteRecord, chunk_id: u32) -> Self {
        IntervalRecord {
            logical_offset: rec.logical_offset,
            physical_offset: rec.physical_offset,
            length: rec.length,
            begin_timestamp: rec.begin_timestamp,
            end_timestamp: rec.end_timestamp,
            chunk_id,
            writer_id: rec.writer_id,
        }
    }

    /// One past the last logical byte covered.
    pub fn logical_tail(&self) -> i64 {
        self.logical_offset + self.length as i64
    }

    /// True if the (half-open) logical intervals intersect.
    pub fn overlaps(&self, other: &IntervalRecord) -> bool {
        self.length > 0
            && other.length > 0
            && self.logical_offset < other.logical_tail()
            && other.logical_offset < self.logical_tail()
    }

    /// Conflict-resolution order: later end timestamp wins, ties broken by
    /// later begin timestamp, then by higher writer id.
    pub fn newer_than(&self, other: &IntervalRecord) -> bool {
        if self.end_timestamp != other.end_timestamp {
            return self.end_timestamp > other.end_timestamp;
        }
        if self.begin_timestamp != other.begin_timestamp {
            return self.begin_timestamp > other.begin_timestamp;
        }
        self.writer_id > other.writer_id
    }

    /// The fragment of this record covering logical `[start, end)`, which
    /// must lie within the record. The physical offset shifts by the same
    /// displacement as the logical one; timestamps and ids carry over.
    pub fn slice(&self, start: i64, end: i64) -> IntervalRecord {
        debug_assert!(start >= self.logical_offset && end <= self.logical_tail());
        debug_assert!(start < end);
        let mut out = *self;
        out.physical_offset += start - self.logical_offset;
        out.logical_offset = start;
        out.length = (end - start) as u64;
        out
    }

    /// Stream form: the write-record layout with `chunk_id` in the id slot.
    pub fn encode_stream<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i64::<NativeEndian>(self.logical_offset)?;
        w.write_i64::<NativeEndian>(self.physical_offset)?;
        w.write_u64::<NativeEndian>(self.length)?;
        w.write_f64::<NativeEndian>(self.begin_timestamp)?;
        w.write_f64::<NativeEndian>(self.end_timestamp)?;
        w.write_u32::<NativeEndian>(self.chunk_id)?;
        w.write_all(&[0u8; RECORD_PAD])?;
        Ok(())
    }

    pub fn decode_stream<R: Read>(r: &mut R) -> Result<Self> {
        let rec = WriteRecord::decode(r)?;
        Ok(IntervalRecord::from_write(&rec, rec.writer_id))
    }
}
